//! Configuration types.
//!
//! Everything is read once at startup from the process environment (after
//! `.env` has been loaded by the binary). Loaders take a lookup closure so
//! tests can feed a map instead of mutating the real environment.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::channels::email::EmailConfig;
use crate::error::ConfigError;
use crate::llm::LlmConfig;

/// Default delay between inbox scans.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Default sign-off name used in generated replies.
pub const DEFAULT_SIGNATURE_NAME: &str = "John Doe";

/// Reply composition settings.
#[derive(Debug, Clone)]
pub struct SupportConfig {
    /// Persona name the model signs replies with.
    pub signature_name: String,
    /// Temperature for the extraction call.
    pub extraction_temperature: f32,
    /// Temperature for the reply call.
    pub reply_temperature: f32,
    /// Max tokens for the extraction call.
    pub extraction_max_tokens: u32,
    /// Max tokens for the reply call.
    pub reply_max_tokens: u32,
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            signature_name: DEFAULT_SIGNATURE_NAME.to_string(),
            extraction_temperature: 0.0,
            reply_temperature: 0.7,
            extraction_max_tokens: 512,
            reply_max_tokens: 1024,
        }
    }
}

impl SupportConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let signature_name = lookup("MAILBOT_SIGNATURE_NAME")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SIGNATURE_NAME.to_string());
        Self {
            signature_name,
            ..Self::default()
        }
    }
}

/// Outer polling loop settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between the end of one scan and the start of the next.
    pub interval: Duration,
    /// Email the literal extraction-failure text back to the sender.
    /// On by default; set `MAILBOT_REPLY_ON_EXTRACTION_FAILURE=false` to
    /// acknowledge such emails silently.
    pub reply_on_extraction_failure: bool,
    /// Pipeline calls allowed in flight within one scan.
    pub max_concurrent: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            reply_on_extraction_failure: true,
            max_concurrent: 1,
        }
    }
}

impl PollerConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let interval_secs: u64 =
            env_parse(lookup, "MAILBOT_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        let reply_on_extraction_failure =
            env_bool(lookup, "MAILBOT_REPLY_ON_EXTRACTION_FAILURE", true)?;
        let max_concurrent: usize = env_parse(lookup, "MAILBOT_MAX_CONCURRENT", 1)?;
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAILBOT_MAX_CONCURRENT".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            interval: Duration::from_secs(interval_secs),
            reply_on_extraction_failure,
            max_concurrent,
        })
    }
}

/// Everything the binary needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub email: EmailConfig,
    pub support: SupportConfig,
    pub poller: PollerConfig,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            llm: LlmConfig::from_lookup(lookup)?,
            email: EmailConfig::from_lookup(lookup)?,
            support: SupportConfig::from_lookup(lookup),
            poller: PollerConfig::from_lookup(lookup)?,
        })
    }
}

// ── Lookup helpers ──────────────────────────────────────────────────

/// Fetch a variable that must be present and non-empty.
pub fn env_required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse a variable, falling back to `default` when unset or empty.
pub fn env_parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse a boolean flag (`true/false`, `1/0`, `yes/no`, `on/off`).
pub fn env_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{v}'"),
            }),
        },
    }
}
