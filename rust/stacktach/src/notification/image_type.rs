//! Image classification bitmask.

use serde_json::Value;

pub const BASE_IMAGE: i32 = 0x1;
pub const SNAPSHOT_IMAGE: i32 = 0x2;

pub const LINUX_IMAGE: i32 = 0x10;
pub const WINDOWS_IMAGE: i32 = 0x20;
pub const FREEBSD_IMAGE: i32 = 0x40;

pub const OS_UBUNTU: i32 = 0x100;
pub const OS_DEBIAN: i32 = 0x200;
pub const OS_CENTOS: i32 = 0x400;
pub const OS_RHEL: i32 = 0x800;

pub fn fold_image_type(
    image_type: Option<&str>,
    os_type: Option<&str>,
    os_distro: Option<&str>,
) -> i32 {
    let kind = match image_type {
        Some("base") => BASE_IMAGE,
        Some("snapshot") => SNAPSHOT_IMAGE,
        _ => 0,
    };
    let os = match os_type {
        Some("linux") => LINUX_IMAGE,
        Some("windows") => WINDOWS_IMAGE,
        Some("freebsd") => FREEBSD_IMAGE,
        _ => 0,
    };
    let distro = match os_distro {
        Some("ubuntu") => OS_UBUNTU,
        Some("debian") => OS_DEBIAN,
        Some("centos") => OS_CENTOS,
        Some("rhel") => OS_RHEL,
        _ => 0,
    };
    kind | os | distro
}

/// Folds `payload.image_meta`; `os_type` falls back to `payload.os_type`.
pub fn image_type_from_payload(payload: &Value) -> i32 {
    let meta = payload.get("image_meta").unwrap_or(&Value::Null);
    let os_type = meta
        .get("os_type")
        .and_then(Value::as_str)
        .or_else(|| payload.get("os_type").and_then(Value::as_str));

    fold_image_type(
        meta.get("image_type").and_then(Value::as_str),
        os_type,
        meta.get("os_distro").and_then(Value::as_str),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn folds_each_dimension() {
        assert_eq!(fold_image_type(None, None, None), 0);
        assert_eq!(fold_image_type(Some("base"), None, None), BASE_IMAGE);
        assert_eq!(
            fold_image_type(Some("snapshot"), Some("freebsd"), Some("rhel")),
            SNAPSHOT_IMAGE | FREEBSD_IMAGE | OS_RHEL
        );
        assert_eq!(fold_image_type(Some("other"), Some("plan9"), Some("arch")), 0);
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"image_meta": {"image_type": "base", "os_type": "linux", "os_distro": "centos"}});
        let b = json!({"image_meta": {"os_distro": "centos", "os_type": "linux", "image_type": "base"}});
        assert_eq!(image_type_from_payload(&a), image_type_from_payload(&b));
        assert_eq!(
            image_type_from_payload(&a),
            BASE_IMAGE | LINUX_IMAGE | OS_CENTOS
        );
    }

    #[test]
    fn os_type_falls_back_to_payload() {
        let payload = json!({"os_type": "windows", "image_meta": {"os_distro": "debian"}});
        assert_eq!(
            image_type_from_payload(&payload),
            WINDOWS_IMAGE | OS_DEBIAN
        );
        let payload = json!({"os_type": "windows", "image_meta": {"os_type": "linux"}});
        assert_eq!(image_type_from_payload(&payload), LINUX_IMAGE);
    }
}
