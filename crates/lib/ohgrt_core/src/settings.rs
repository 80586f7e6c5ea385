//! Typed security settings.
//!
//! Loaded once at startup from environment variables, then overlaid with
//! command-line overrides. Each collaborator gets its own section so the
//! nonce guard never sees JWT material and the codec never sees Redis URLs.
//!
//! | Variable                              | Default                     |
//! |---------------------------------------|-----------------------------|
//! | `ENVIRONMENT`                         | `development`               |
//! | `JWT_SECRET_KEY`                      | required in production      |
//! | `JWT_ALGORITHM`                       | `HS256`                     |
//! | `JWT_ACCESS_TOKEN_EXPIRE_MINUTES`     | `15`                        |
//! | `JWT_REFRESH_TOKEN_EXPIRE_DAYS`       | `7`                         |
//! | `REQUEST_TIMESTAMP_TOLERANCE_SECONDS` | `300`                       |
//! | `NONCE_EXPIRY_HOURS`                  | `24`                        |
//! | `RATE_LIMIT_ENABLED`                  | `true`                      |
//! | `RATE_LIMIT_REQUESTS_PER_MINUTE`      | `60`                        |
//! | `RATE_LIMIT_REQUESTS_PER_HOUR`        | `1000`                      |
//! | `REDIS_URL`                           | `redis://localhost:6379/0`  |
//! | `STORE_TIMEOUT_MS`                    | `2000`                      |
//! | `STORE_HEALTH_CHECK_SECONDS`          | `30`                        |
//! | `STORE_ALLOW_FALLBACK`                | `true`                      |
//! | `LITE_MODE`                           | `false`                     |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use thiserror::Error;
use tracing::warn;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("{0} is required in production")]
    Missing(&'static str),
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

// =============================================================================
// Environment
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(invalid(
                "ENVIRONMENT",
                format!("`{other}` is not one of development, staging, production"),
            )),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Signing material and token lifetimes.
#[derive(Clone)]
pub struct JwtSettings {
    pub secret: String,
    pub algorithm: Algorithm,
    pub access_ttl: chrono::Duration,
    pub refresh_ttl: chrono::Duration,
}

impl fmt::Debug for JwtSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtSettings")
            .field("secret", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

impl JwtSettings {
    /// Settings with default lifetimes around the given secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            algorithm: Algorithm::HS256,
            access_ttl: chrono::Duration::minutes(15),
            refresh_ttl: chrono::Duration::days(7),
        }
    }
}

fn parse_algorithm(value: &str) -> Result<Algorithm, ConfigError> {
    match value.trim().to_ascii_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(invalid(
            "JWT_ALGORITHM",
            format!("`{other}` is not a supported HMAC algorithm"),
        )),
    }
}

/// Path allow-list: exact matches plus prefixes.
#[derive(Debug, Clone, Default)]
pub struct ExemptPaths {
    pub exact: Vec<String>,
    pub prefixes: Vec<String>,
}

impl ExemptPaths {
    pub fn new<E, P>(exact: E, prefixes: P) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            exact: exact.into_iter().map(Into::into).collect(),
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.exact.iter().any(|p| p == path) || self.prefixes.iter().any(|p| path.starts_with(p))
    }
}

/// Request verification (timestamp window, nonce lifetime, exemptions).
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub timestamp_tolerance_secs: u64,
    pub nonce_ttl: Duration,
    pub exempt: ExemptPaths,
    pub lite_mode: bool,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            timestamp_tolerance_secs: 300,
            nonce_ttl: Duration::from_secs(24 * 3600),
            exempt: ExemptPaths::new(
                [
                    "/",
                    "/docs",
                    "/redoc",
                    "/openapi.json",
                    "/health",
                    "/metrics",
                    "/auth/google",
                    "/auth/refresh",
                ],
                ["/health/", "/docs/", "/redoc/", "/auth/providers/", "/whatsapp"],
            ),
            lite_mode: false,
        }
    }
}

/// Sliding-window limits.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub per_minute: u64,
    pub per_hour: u64,
    /// Added to each window to get the key's expiry.
    pub key_buffer: Duration,
    pub exempt: ExemptPaths,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 60,
            per_hour: 1000,
            key_buffer: Duration::from_secs(60),
            exempt: ExemptPaths::new(
                ["/", "/health", "/docs", "/redoc", "/openapi.json"],
                ["/health/", "/docs/", "/redoc/"],
            ),
        }
    }
}

/// Shared store connection.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// `None` runs memory-only.
    pub redis_url: Option<String>,
    pub timeout_ms: u64,
    pub health_check_secs: u64,
    pub allow_memory_fallback: bool,
}

impl StoreSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_secs.max(1))
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            redis_url: Some("redis://localhost:6379/0".to_string()),
            timeout_ms: 2000,
            health_check_secs: 30,
            allow_memory_fallback: true,
        }
    }
}

// =============================================================================
// Root
// =============================================================================

/// Everything the security core needs, validated.
#[derive(Debug, Clone)]
pub struct SecuritySettings {
    pub environment: Environment,
    pub jwt: JwtSettings,
    pub gate: GateSettings,
    pub rate_limit: RateLimitSettings,
    pub store: StoreSettings,
}

/// Values supplied on the command line. `None` keeps the loaded value.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub environment: Option<Environment>,
    pub redis_url: Option<String>,
    pub lite_mode: Option<bool>,
    pub rate_limit_enabled: Option<bool>,
    pub rate_limit_per_minute: Option<u64>,
    pub rate_limit_per_hour: Option<u64>,
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(name, format!("`{other}` is not a boolean"))),
    }
}

fn parse_num<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| invalid(name, e.to_string()))
}

fn generate_secret() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

impl SecuritySettings {
    /// Defaults around a fixed secret. Used by tests and local tooling.
    pub fn for_secret(secret: impl Into<String>) -> Self {
        Self {
            environment: Environment::Development,
            jwt: JwtSettings::with_secret(secret),
            gate: GateSettings::default(),
            rate_limit: RateLimitSettings::default(),
            store: StoreSettings {
                redis_url: None,
                ..StoreSettings::default()
            },
        }
    }

    /// Reads settings from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads settings through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let environment = match var("ENVIRONMENT") {
            Some(v) => v.parse()?,
            None => Environment::default(),
        };

        let mut jwt = JwtSettings::with_secret(String::new());
        if let Some(v) = var("JWT_ALGORITHM") {
            jwt.algorithm = parse_algorithm(&v)?;
        }
        if let Some(v) = var("JWT_ACCESS_TOKEN_EXPIRE_MINUTES") {
            jwt.access_ttl =
                chrono::Duration::minutes(parse_num("JWT_ACCESS_TOKEN_EXPIRE_MINUTES", &v)?);
        }
        if let Some(v) = var("JWT_REFRESH_TOKEN_EXPIRE_DAYS") {
            jwt.refresh_ttl =
                chrono::Duration::days(parse_num("JWT_REFRESH_TOKEN_EXPIRE_DAYS", &v)?);
        }
        jwt.secret = match var("JWT_SECRET_KEY") {
            Some(secret) => secret,
            None if environment.is_production() => {
                return Err(ConfigError::Missing("JWT_SECRET_KEY"));
            }
            None => {
                warn!(
                    environment = environment.as_str(),
                    "JWT_SECRET_KEY not set, using an ephemeral secret"
                );
                generate_secret()
            }
        };

        let mut gate = GateSettings::default();
        if let Some(v) = var("REQUEST_TIMESTAMP_TOLERANCE_SECONDS") {
            gate.timestamp_tolerance_secs = parse_num("REQUEST_TIMESTAMP_TOLERANCE_SECONDS", &v)?;
        }
        if let Some(v) = var("NONCE_EXPIRY_HOURS") {
            let hours: u64 = parse_num("NONCE_EXPIRY_HOURS", &v)?;
            gate.nonce_ttl = Duration::from_secs(hours.saturating_mul(3600));
        }
        if let Some(v) = var("LITE_MODE") {
            gate.lite_mode = parse_bool("LITE_MODE", &v)?;
        }

        let mut rate_limit = RateLimitSettings::default();
        if let Some(v) = var("RATE_LIMIT_ENABLED") {
            rate_limit.enabled = parse_bool("RATE_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = var("RATE_LIMIT_REQUESTS_PER_MINUTE") {
            rate_limit.per_minute = parse_num("RATE_LIMIT_REQUESTS_PER_MINUTE", &v)?;
        }
        if let Some(v) = var("RATE_LIMIT_REQUESTS_PER_HOUR") {
            rate_limit.per_hour = parse_num("RATE_LIMIT_REQUESTS_PER_HOUR", &v)?;
        }

        let mut store = StoreSettings::default();
        if let Some(v) = var("REDIS_URL") {
            store.redis_url = Some(v);
        }
        if let Some(v) = var("STORE_TIMEOUT_MS") {
            store.timeout_ms = parse_num("STORE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("STORE_HEALTH_CHECK_SECONDS") {
            store.health_check_secs = parse_num("STORE_HEALTH_CHECK_SECONDS", &v)?;
        }
        if let Some(v) = var("STORE_ALLOW_FALLBACK") {
            store.allow_memory_fallback = parse_bool("STORE_ALLOW_FALLBACK", &v)?;
        }

        let settings = Self {
            environment,
            jwt,
            gate,
            rate_limit,
            store,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay command-line values and re-validate.
    pub fn with_overrides(mut self, overrides: SettingsOverrides) -> Result<Self, ConfigError> {
        if let Some(environment) = overrides.environment {
            self.environment = environment;
        }
        if let Some(url) = overrides.redis_url {
            self.store.redis_url = (!url.trim().is_empty()).then_some(url);
        }
        if let Some(lite_mode) = overrides.lite_mode {
            self.gate.lite_mode = lite_mode;
        }
        if let Some(enabled) = overrides.rate_limit_enabled {
            self.rate_limit.enabled = enabled;
        }
        if let Some(per_minute) = overrides.rate_limit_per_minute {
            self.rate_limit.per_minute = per_minute;
        }
        if let Some(per_hour) = overrides.rate_limit_per_hour {
            self.rate_limit.per_hour = per_hour;
        }
        self.validate()?;
        Ok(self)
    }

    /// Whether lite mode actually bypasses verification.
    pub fn lite_mode_active(&self) -> bool {
        self.gate.lite_mode && !self.environment.is_production()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt.secret.is_empty() {
            return Err(ConfigError::Missing("JWT_SECRET_KEY"));
        }
        if self.jwt.access_ttl <= chrono::Duration::zero() {
            return Err(invalid(
                "JWT_ACCESS_TOKEN_EXPIRE_MINUTES",
                "must be positive",
            ));
        }
        if self.jwt.refresh_ttl <= chrono::Duration::zero() {
            return Err(invalid("JWT_REFRESH_TOKEN_EXPIRE_DAYS", "must be positive"));
        }
        if self.rate_limit.per_minute == 0 || self.rate_limit.per_hour == 0 {
            return Err(invalid("RATE_LIMIT_REQUESTS_PER_*", "must be at least 1"));
        }
        if self.store.timeout_ms == 0 {
            return Err(invalid("STORE_TIMEOUT_MS", "must be at least 1"));
        }
        if self.gate.lite_mode && self.environment.is_production() {
            warn!("LITE_MODE is set in production and will be ignored");
        }
        Ok(())
    }
}
