use std::path::PathBuf;

use huddle_gateway::GatewayConfig;
use huddle_types::events::{RateLimit, RateLimits};
use huddle_types::models::PostingMode;
use thiserror::Error;

/// Placeholder JWT secrets that must never reach a running server.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is unset or still a placeholder")]
    MissingSecret(&'static str),
    #[error("{name}: invalid value '{value}' ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Where rate-limit and connection counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBackend {
    /// Shared through the database file; safe across processes.
    Sqlite,
    /// Process-local; single-instance deployments only.
    Memory,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub default_posting_mode: PostingMode,
    pub counter_backend: CounterBackend,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads `HUDDLE_*` settings through `lookup`; unset names take their
    /// defaults, malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("HUDDLE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::MissingSecret("HUDDLE_JWT_SECRET"));
        }

        let defaults = GatewayConfig::default();
        let rate_defaults = RateLimits::default();
        let gateway = GatewayConfig {
            max_connections_per_user: parse(
                &lookup,
                "HUDDLE_MAX_CONNECTIONS_PER_USER",
                defaults.max_connections_per_user,
            )?,
            max_payload_bytes: parse(
                &lookup,
                "HUDDLE_MAX_PAYLOAD_BYTES",
                defaults.max_payload_bytes,
            )?,
            max_message_length: parse(
                &lookup,
                "HUDDLE_MAX_MESSAGE_LENGTH",
                defaults.max_message_length,
            )?,
            rate_limits: RateLimits {
                message_send: rate(
                    &lookup,
                    "HUDDLE_RATE_MESSAGE_SEND",
                    rate_defaults.message_send,
                )?,
                reaction: rate(&lookup, "HUDDLE_RATE_REACTION", rate_defaults.reaction)?,
                typing: rate(&lookup, "HUDDLE_RATE_TYPING", rate_defaults.typing)?,
            },
            ..defaults
        };

        let default_posting_mode = match lookup("HUDDLE_DEFAULT_POSTING_MODE") {
            None => PostingMode::All,
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "HUDDLE_DEFAULT_POSTING_MODE",
                value,
                reason: "expected all or admins_only",
            })?,
        };
        let counter_backend = match lookup("HUDDLE_COUNTER_STORE").as_deref() {
            None | Some("sqlite") => CounterBackend::Sqlite,
            Some("memory") => CounterBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "HUDDLE_COUNTER_STORE",
                    value: other.to_string(),
                    reason: "expected sqlite or memory",
                });
            }
        };

        Ok(Self {
            host: lookup("HUDDLE_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&lookup, "HUDDLE_PORT", 3000)?,
            db_path: lookup("HUDDLE_DB_PATH").unwrap_or_else(|| "huddle.db".into()).into(),
            jwt_secret,
            upload_dir: lookup("HUDDLE_UPLOAD_DIR").unwrap_or_else(|| "./uploads".into()).into(),
            max_upload_bytes: parse(&lookup, "HUDDLE_MAX_UPLOAD_BYTES", 50 * 1024 * 1024)?,
            default_posting_mode,
            counter_backend,
            gateway,
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            reason: "not a number",
        }),
    }
}

/// `limit/window_secs`, e.g. `60/60`.
fn rate(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: RateLimit,
) -> Result<RateLimit, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    let invalid = |reason| ConfigError::Invalid {
        name,
        value: value.clone(),
        reason,
    };
    let (limit, window) = value
        .split_once('/')
        .ok_or_else(|| invalid("expected limit/window_secs"))?;
    let limit: u32 = limit.trim().parse().map_err(|_| invalid("limit is not a number"))?;
    let window: u64 = window.trim().parse().map_err(|_| invalid("window is not a number"))?;
    if limit == 0 || window == 0 {
        return Err(invalid("limit and window must be positive"));
    }
    Ok(RateLimit::new(limit, window))
}
