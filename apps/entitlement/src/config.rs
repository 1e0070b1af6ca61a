use std::{
    collections::HashMap,
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

use crate::db::DEFAULT_POOL_SIZE;
use crate::policy::PolicyLimits;
use crate::progress::{DEFAULT_TTL_SECONDS, MAX_TTL_SECONDS};
use crate::webhook::DEFAULT_TOLERANCE_SECONDS;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub db_url: Option<String>,
    pub db_pool_size: usize,
    pub log_format: LogFormat,
    /// Shared secret per webhook provider, keyed by the `:provider` path segment.
    pub webhook_secrets: HashMap<String, String>,
    pub webhook_tolerance_seconds: u64,
    pub progress_ttl_seconds: u64,
    /// `0` disables the background sweep.
    pub progress_sweep_interval_seconds: u64,
    pub policy_limits: PolicyLimits,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid ENTITLEMENT_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid ENTITLEMENT_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
    #[error("invalid ENTITLEMENT_WEBHOOK_SECRETS: {0}")]
    InvalidWebhookSecrets(String),
    #[error("invalid numeric setting: {0}")]
    InvalidNumber(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = lookup("ENTITLEMENT_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            lookup("ENTITLEMENT_SERVICE_NAME").unwrap_or_else(|| "entitlement".to_string());
        let build_sha = lookup("ENTITLEMENT_BUILD_SHA").unwrap_or_else(|| "dev".to_string());
        let db_url = lookup("DB_URL").or_else(|| lookup("DATABASE_URL"));
        let db_pool_size = parse_u64_env_lookup(
            &lookup,
            "ENTITLEMENT_DB_POOL_SIZE",
            DEFAULT_POOL_SIZE as u64,
            1,
            256,
        )? as usize;
        let log_format = parse_log_format(
            lookup("ENTITLEMENT_LOG_FORMAT")
                .unwrap_or_else(|| "text".to_string())
                .as_str(),
        )?;
        let webhook_secrets = lookup("ENTITLEMENT_WEBHOOK_SECRETS")
            .map(|raw| parse_webhook_secrets(&raw))
            .transpose()?
            .unwrap_or_default();
        let webhook_tolerance_seconds = parse_u64_env_lookup(
            &lookup,
            "ENTITLEMENT_WEBHOOK_TOLERANCE_SECONDS",
            DEFAULT_TOLERANCE_SECONDS,
            1,
            3_600,
        )?;
        let progress_ttl_seconds = parse_u64_env_lookup(
            &lookup,
            "ENTITLEMENT_PROGRESS_TTL_SECONDS",
            DEFAULT_TTL_SECONDS,
            1,
            MAX_TTL_SECONDS,
        )?;
        let progress_sweep_interval_seconds = parse_u64_env_lookup(
            &lookup,
            "ENTITLEMENT_PROGRESS_SWEEP_INTERVAL_SECONDS",
            300,
            0,
            86_400,
        )?;
        let policy_limits = parse_policy_limits_from_env(&lookup)?;

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            db_url,
            db_pool_size,
            log_format,
            webhook_secrets,
            webhook_tolerance_seconds,
            progress_ttl_seconds,
            progress_sweep_interval_seconds,
            policy_limits,
        })
    }
}

fn parse_policy_limits_from_env(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<PolicyLimits, ConfigError> {
    let defaults = PolicyLimits::default();
    Ok(PolicyLimits {
        anonymous: parse_u64_env_lookup(
            lookup,
            "ENTITLEMENT_LIMIT_ANONYMOUS",
            defaults.anonymous,
            0,
            1_000_000,
        )?,
        free: parse_u64_env_lookup(lookup, "ENTITLEMENT_LIMIT_FREE", defaults.free, 0, 1_000_000)?,
        pro: parse_u64_env_lookup(lookup, "ENTITLEMENT_LIMIT_PRO", defaults.pro, 0, 1_000_000)?,
    })
}

/// `provider=secret` pairs separated by commas.
fn parse_webhook_secrets(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut secrets = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let Some((provider, secret)) = entry.split_once('=') else {
            return Err(ConfigError::InvalidWebhookSecrets(
                "expected provider=secret".to_string(),
            ));
        };
        let provider = provider.trim().to_ascii_lowercase();
        let secret = secret.trim();
        if provider.is_empty() || secret.is_empty() {
            return Err(ConfigError::InvalidWebhookSecrets(
                "provider and secret must be non-empty".to_string(),
            ));
        }
        if secrets.insert(provider.clone(), secret.to_string()).is_some() {
            return Err(ConfigError::InvalidWebhookSecrets(format!(
                "duplicate provider `{provider}`"
            )));
        }
    }
    Ok(secrets)
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "text" | "pretty" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}

fn parse_u64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.parse::<u64>()
            .map_err(|error| ConfigError::InvalidNumber(format!("{key}: {error}")))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}
