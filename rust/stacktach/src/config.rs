use crate::models::FlavorField;
use anyhow::{Context, Result};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "stacktach_verifier_config.json";
pub const MEMORY_DATABASE_URL: &str = "memory://";

pub type Topics = HashMap<String, Vec<String>>;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RabbitConfig {
    #[serde(default = "default_rabbit_host")]
    pub host: String,
    #[serde(default = "default_rabbit_port")]
    pub port: u16,
    #[serde(default = "default_rabbit_user")]
    pub userid: String,
    #[serde(default = "default_rabbit_user")]
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default = "default_true")]
    pub durable_queue: bool,
    #[serde(default)]
    pub topics: Topics,
}

impl Default for RabbitConfig {
    fn default() -> Self {
        Self {
            host: default_rabbit_host(),
            port: default_rabbit_port(),
            userid: default_rabbit_user(),
            password: default_rabbit_user(),
            virtual_host: default_virtual_host(),
            durable_queue: true,
            topics: Topics::new(),
        }
    }
}

impl RabbitConfig {
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.userid.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            ..Default::default()
        }
    }

    /// Broker address without credentials, for log lines.
    pub fn display_addr(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.virtual_host)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    None,
    Basic,
    #[default]
    All,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SettleUnits {
    Seconds,
    #[default]
    Minutes,
    Hours,
    Days,
}

impl SettleUnits {
    pub fn duration(self, amount: u64) -> Duration {
        let seconds = match self {
            SettleUnits::Seconds => 1,
            SettleUnits::Minutes => 60,
            SettleUnits::Hours => 60 * 60,
            SettleUnits::Days => 60 * 60 * 24,
        };
        Duration::from_secs(amount.saturating_mul(seconds))
    }
}

/// A deployment whose notifications are ingested. Falls back to the top-level
/// `rabbit` block for anything it leaves out.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeploymentConfig {
    pub name: String,
    #[serde(default)]
    pub rabbit: Option<RabbitConfig>,
    #[serde(default)]
    pub topics: Option<Topics>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub enable_notifications: bool,
    #[serde(default)]
    pub rabbit: RabbitConfig,
    #[serde(default = "default_tick_time")]
    pub tick_time: u64,
    #[serde(default)]
    pub settle_units: SettleUnits,
    #[serde(default = "default_settle_time")]
    pub settle_time: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub process_timeout: u64,
    #[serde(default)]
    pub validation_level: ValidationLevel,
    #[serde(default = "default_nova_event_type")]
    pub nova_event_type: String,
    #[serde(default = "default_glance_event_type")]
    pub glance_event_type: String,
    #[serde(default)]
    pub flavor_field_name: FlavorField,
    #[serde(default)]
    pub reconcile: bool,
    #[serde(default)]
    pub reconciler_config: Option<PathBuf>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    #[serde(default)]
    pub pg_ssl_root_cert: Option<String>,
    #[serde(default)]
    pub pg_ssl_cert: Option<String>,
    #[serde(default)]
    pub pg_ssl_key: Option<String>,
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,
    #[serde(default = "default_verifier_exchange")]
    pub verifier_exchange: String,
}

/// Environment variables layered over the file.
#[derive(Debug, Default, Deserialize)]
pub struct EnvOverrides {
    #[serde(default)]
    pub stacktach_database_url: Option<String>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub stacktach_pool_size: Option<usize>,
    #[serde(default)]
    pub stacktach_tick_time: Option<u64>,
    #[serde(default)]
    pub pgsslrootcert: Option<String>,
    #[serde(default)]
    pub pgsslcert: Option<String>,
    #[serde(default)]
    pub pgsslkey: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self> {
        envy::from_env().context("failed to parse STACKTACH_* environment variables")
    }
}

fn default_rabbit_host() -> String {
    "localhost".to_string()
}

const fn default_rabbit_port() -> u16 {
    5672
}

fn default_rabbit_user() -> String {
    "guest".to_string()
}

fn default_virtual_host() -> String {
    "/".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_tick_time() -> u64 {
    30
}

const fn default_settle_time() -> u64 {
    5
}

const fn default_pool_size() -> usize {
    10
}

const fn default_max_pool_size() -> u32 {
    10
}

fn default_nova_event_type() -> String {
    "compute.instance.exists.verified".to_string()
}

fn default_glance_event_type() -> String {
    "image.exists.verified".to_string()
}

fn default_verifier_exchange() -> String {
    "nova".to_string()
}

pub fn default_topics() -> Topics {
    Topics::from([(
        "nova".to_string(),
        vec!["monitor.info".to_string(), "monitor.error".to_string()],
    )])
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.apply_overrides(EnvOverrides::from_env()?);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, env: EnvOverrides) {
        if let Some(url) = env.stacktach_database_url.or(env.database_url) {
            self.database_url = Some(url);
        }
        if let Some(size) = env.stacktach_pool_size {
            self.pool_size = size;
        }
        if let Some(tick) = env.stacktach_tick_time {
            self.tick_time = tick;
        }
        self.pg_ssl_root_cert = env.pgsslrootcert.or(self.pg_ssl_root_cert.take());
        self.pg_ssl_cert = env.pgsslcert.or(self.pg_ssl_cert.take());
        self.pg_ssl_key = env.pgsslkey.or(self.pg_ssl_key.take());
    }

    pub fn validate(&self) -> Result<()> {
        match self.database_url.as_deref() {
            None | Some("") => {
                anyhow::bail!("database_url, STACKTACH_DATABASE_URL or DATABASE_URL must be set")
            }
            Some(_) => {}
        }
        if self.tick_time == 0 {
            anyhow::bail!("tick_time must be at least one second");
        }
        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be positive");
        }
        if self.max_pool_size == 0 {
            anyhow::bail!("max_pool_size must be positive");
        }
        if self.verifier_exchange.is_empty() {
            anyhow::bail!("verifier_exchange is required");
        }
        if self.rabbit.host.is_empty() {
            anyhow::bail!("rabbit.host is required");
        }
        if self.reconcile && self.reconciler_config.is_none() {
            anyhow::bail!("reconcile requires reconciler_config");
        }
        for deployment in &self.deployments {
            if deployment.name.is_empty() {
                anyhow::bail!("every deployment needs a name");
            }
        }
        if self.pg_ssl_cert.is_some() != self.pg_ssl_key.is_some() {
            anyhow::bail!("pg_ssl_cert and pg_ssl_key must both be set (or neither)");
        }
        Ok(())
    }

    pub fn database_url(&self) -> &str {
        self.database_url.as_deref().unwrap_or(MEMORY_DATABASE_URL)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url() == MEMORY_DATABASE_URL
    }

    pub fn settle_duration(&self) -> Duration {
        self.settle_units.duration(self.settle_time)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_time.max(1))
    }

    pub fn process_timeout(&self) -> Option<Duration> {
        (self.process_timeout > 0).then(|| Duration::from_secs(self.process_timeout))
    }

    pub fn rabbit_for<'a>(&'a self, deployment: &'a DeploymentConfig) -> &'a RabbitConfig {
        deployment.rabbit.as_ref().unwrap_or(&self.rabbit)
    }

    /// Exchange to routing keys bound for ingest on `deployment`.
    pub fn ingest_topics(&self, deployment: &DeploymentConfig) -> Topics {
        deployment
            .topics
            .clone()
            .filter(|topics| !topics.is_empty())
            .unwrap_or_else(default_topics)
    }

    /// Routing keys verified exists are republished under. Empty means the
    /// original routing key of each raw record.
    pub fn publish_routing_keys(&self) -> &[String] {
        self.rabbit
            .topics
            .get(&self.verifier_exchange)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults_fill_a_minimal_file() {
        let cfg = parse(r#"{"database_url": "memory://"}"#);
        cfg.validate().unwrap();
        assert!(!cfg.enable_notifications);
        assert_eq!(cfg.tick_time, 30);
        assert_eq!(cfg.pool_size, 10);
        assert_eq!(cfg.settle_duration(), Duration::from_secs(300));
        assert_eq!(cfg.process_timeout(), None);
        assert_eq!(cfg.validation_level, ValidationLevel::All);
        assert_eq!(cfg.flavor_field_name, FlavorField::InstanceTypeId);
        assert_eq!(cfg.nova_event_type, "compute.instance.exists.verified");
        assert_eq!(cfg.glance_event_type, "image.exists.verified");
        assert_eq!(cfg.rabbit.port, 5672);
        assert!(cfg.uses_memory_store());
        assert!(cfg.publish_routing_keys().is_empty());
    }

    #[test]
    fn reads_verifier_options() {
        let cfg = parse(
            r#"{
                "enable_notifications": true,
                "rabbit": {
                    "host": "rabbit.local",
                    "port": 5673,
                    "userid": "stacktach",
                    "password": "secret",
                    "virtual_host": "/stacktach",
                    "durable_queue": false,
                    "topics": {"nova": ["notifications.info"]}
                },
                "tick_time": 10,
                "settle_units": "hours",
                "settle_time": 2,
                "pool_size": 4,
                "process_timeout": 90,
                "validation_level": "basic",
                "flavor_field_name": "instance_flavor_id",
                "reconcile": true,
                "reconciler_config": "/etc/stacktach/reconciler.json",
                "database_url": "postgres://localhost/stacktach",
                "deployments": [{"name": "east", "topics": {"glance": ["monitor.info"]}}]
            }"#,
        );
        cfg.validate().unwrap();
        assert_eq!(cfg.settle_duration(), Duration::from_secs(7200));
        assert_eq!(cfg.process_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(cfg.validation_level, ValidationLevel::Basic);
        assert_eq!(cfg.flavor_field_name, FlavorField::InstanceFlavorId);
        assert_eq!(cfg.publish_routing_keys(), ["notifications.info".to_string()]);
        assert_eq!(cfg.rabbit.display_addr(), "rabbit.local:5673/stacktach");
        assert!(!cfg.uses_memory_store());

        let east = &cfg.deployments[0];
        assert_eq!(cfg.rabbit_for(east), &cfg.rabbit);
        assert_eq!(
            cfg.ingest_topics(east),
            Topics::from([("glance".to_string(), vec!["monitor.info".to_string()])])
        );
    }

    #[test]
    fn deployment_without_topics_uses_monitor_queues() {
        let cfg = parse(r#"{"database_url": "memory://", "deployments": [{"name": "west"}]}"#);
        assert_eq!(cfg.ingest_topics(&cfg.deployments[0]), default_topics());
    }

    #[test]
    fn overrides_beat_the_file() {
        let mut cfg = parse(r#"{"database_url": "postgres://file", "tick_time": 5}"#);
        cfg.apply_overrides(EnvOverrides {
            database_url: Some("postgres://generic".into()),
            stacktach_database_url: Some("postgres://specific".into()),
            stacktach_tick_time: Some(60),
            ..Default::default()
        });
        assert_eq!(cfg.database_url(), "postgres://specific");
        assert_eq!(cfg.tick_time, 60);
        assert_eq!(cfg.pool_size, 10);
    }

    #[test]
    fn validation_rejects_bad_files() {
        assert!(parse("{}").validate().is_err());
        assert!(parse(r#"{"database_url": "memory://", "pool_size": 0}"#)
            .validate()
            .is_err());
        assert!(parse(r#"{"database_url": "memory://", "reconcile": true}"#)
            .validate()
            .is_err());
        assert!(
            parse(r#"{"database_url": "memory://", "deployments": [{"name": ""}]}"#)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn from_file_reads_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"database_url": "memory://", "settle_time": 3}}"#).unwrap();
        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.settle_duration(), Duration::from_secs(180));
    }
}
