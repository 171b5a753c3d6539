//! Shape checks on the exist itself, before it is compared with anything.

use super::errors::VerificationError;
use crate::config::ValidationLevel;
use crate::models::{FlavorField, Flavored, InstanceExists};
use once_cell::sync::Lazy;
use regex::Regex;

static TENANT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]+$").expect("valid regex"));
static OS_FIELD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9.]+").expect("valid regex"));
static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("valid regex")
});

pub fn is_tenant(value: &str) -> bool {
    TENANT.is_match(value)
}

pub fn is_uuid(value: &str) -> bool {
    UUID.is_match(value)
}

fn is_integer(value: &str) -> bool {
    value.trim().parse::<i64>().is_ok()
}

fn present<'a>(
    exist: &InstanceExists,
    field: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, VerificationError> {
    match value {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(VerificationError::null_field(field, exist.id, &exist.instance)),
    }
}

fn check(
    exist: &InstanceExists,
    field: &'static str,
    value: Option<&str>,
    valid: impl Fn(&str) -> bool,
) -> Result<(), VerificationError> {
    let text = present(exist, field, value)?;
    if valid(text) {
        Ok(())
    } else {
        Err(VerificationError::wrong_type(field, text, exist.id, &exist.instance))
    }
}

pub fn verify_validity(
    exist: &InstanceExists,
    level: ValidationLevel,
    flavor_field: FlavorField,
) -> Result<(), VerificationError> {
    if level == ValidationLevel::None {
        return Ok(());
    }

    check(exist, "tenant", exist.tenant.as_deref(), is_tenant)?;
    if exist.launched_at.is_none() {
        return Err(VerificationError::null_field("launched_at", exist.id, &exist.instance));
    }
    match flavor_field {
        FlavorField::InstanceTypeId => check(
            exist,
            "instance_type_id",
            exist.instance_type_id(),
            is_integer,
        )?,
        FlavorField::InstanceFlavorId => {
            present(exist, "instance_flavor_id", exist.instance_flavor_id())?;
        }
    }

    if level == ValidationLevel::All {
        let meta = &exist.meta;
        check(exist, "rax_options", meta.rax_options.as_deref(), is_integer)?;
        let os_like = |text: &str| OS_FIELD.is_match(text);
        check(exist, "os_architecture", meta.os_architecture.as_deref(), os_like)?;
        check(exist, "os_distro", meta.os_distro.as_deref(), os_like)?;
        check(exist, "os_version", meta.os_version.as_deref(), os_like)?;
    }
    Ok(())
}
