//! Portal configuration
//!
//! Read from a TOML file, then overridden from `RDP_*` environment variables.
//! Every section has defaults, so a missing file yields a working
//! configuration apart from the signing secret, which [`PortalConfig::validate`]
//! insists on.
//!
//! ```toml
//! [auth]
//! jwt_secret = "at-least-thirty-two-bytes-of-secret"
//! access_ttl_secs = 7200
//!
//! [audit]
//! capacity = 1000
//! write_timeout_ms = 5000
//!
//! [log]
//! level = "info"
//! format = "json"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use rdp_access::{ClassificationRules, SinkConfig, TokenConfig};
use rdp_types::Classification;

/// Shortest accepted signing secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;

const MAX_LEEWAY_SECS: u64 = 60;

/// Configuration failure
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {var} has invalid value {value:?}")]
    Env { var: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// `[server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Per-request deadline; a handler that overruns gets a 500
    pub request_deadline_secs: u64,
    pub session_sweep_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            request_deadline_secs: 30,
            session_sweep_secs: 3600,
        }
    }
}

/// `[auth]`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub leeway_secs: u64,
    /// Refuse access tokens whose session row is missing
    pub strict_revocation: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: "rdp-api".into(),
            audience: "rdp-users".into(),
            access_ttl_secs: 2 * 60 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            leeway_secs: 0,
            strict_revocation: false,
        }
    }
}

impl fmt::Debug for AuthSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSection")
            .field("jwt_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("leeway_secs", &self.leeway_secs)
            .field("strict_revocation", &self.strict_revocation)
            .finish()
    }
}

/// `[audit]` and `[metrics]`: one write-behind sink each
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    pub capacity: usize,
    pub write_timeout_ms: u64,
    pub drain_window_ms: u64,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            capacity: 1000,
            write_timeout_ms: 5000,
            drain_window_ms: 5000,
        }
    }
}

impl SinkSection {
    #[must_use]
    pub fn to_sink_config(&self, name: &'static str) -> SinkConfig {
        SinkConfig::new(name)
            .with_capacity(self.capacity)
            .with_write_timeout(Duration::from_millis(self.write_timeout_ms))
            .with_drain_window(Duration::from_millis(self.drain_window_ms))
    }
}

/// `[policy]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub cache_capacity: u64,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            cache_capacity: rdp_access::policy::DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// `[log]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// `EnvFilter` directive, e.g. `info` or `rdp_access=debug,info`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
        }
    }
}

/// `[classification]`: path prefixes added to the built-in rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationSection {
    pub public: Vec<String>,
    pub confidential: Vec<String>,
    pub secret: Vec<String>,
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub server: ServerSection,
    pub auth: AuthSection,
    pub audit: SinkSection,
    pub metrics: SinkSection,
    pub policy: PolicySection,
    pub log: LogSection,
    pub classification: ClassificationSection,
}

impl PortalConfig {
    /// Load from `path`; a missing file (or no path) yields defaults
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `RDP_*` overrides from the process environment
    pub fn apply_env(self) -> ConfigResult<Self> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Apply `RDP_*` overrides from `lookup`
    pub fn apply_env_from<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup("RDP_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(issuer) = lookup("RDP_JWT_ISSUER") {
            self.auth.issuer = issuer;
        }
        if let Some(audience) = lookup("RDP_JWT_AUDIENCE") {
            self.auth.audience = audience;
        }
        if let Some(raw) = lookup("RDP_ACCESS_TOKEN_TTL_SECS") {
            self.auth.access_ttl_secs = parse_env("RDP_ACCESS_TOKEN_TTL_SECS", raw)?;
        }
        if let Some(raw) = lookup("RDP_REFRESH_TOKEN_TTL_SECS") {
            self.auth.refresh_ttl_secs = parse_env("RDP_REFRESH_TOKEN_TTL_SECS", raw)?;
        }
        if let Some(level) = lookup("RDP_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(raw) = lookup("RDP_LOG_FORMAT") {
            self.log.format = parse_env("RDP_LOG_FORMAT", raw)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.auth.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "auth.jwt_secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.auth.issuer.is_empty() || self.auth.audience.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.issuer and auth.audience must not be empty".into(),
            ));
        }
        if self.auth.access_ttl_secs == 0 || self.auth.refresh_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token lifetimes must be positive".into()));
        }
        if self.auth.leeway_secs > MAX_LEEWAY_SECS {
            return Err(ConfigError::Invalid(format!(
                "auth.leeway_secs must not exceed {MAX_LEEWAY_SECS}"
            )));
        }
        for (name, sink) in [("audit", &self.audit), ("metrics", &self.metrics)] {
            if sink.capacity == 0 {
                return Err(ConfigError::Invalid(format!("{name}.capacity must be positive")));
            }
            if sink.write_timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.write_timeout_ms must be positive"
                )));
            }
        }
        if self.policy.cache_capacity == 0 {
            return Err(ConfigError::Invalid("policy.cache_capacity must be positive".into()));
        }
        if self.server.request_deadline_secs == 0 || self.server.session_sweep_secs == 0 {
            return Err(ConfigError::Invalid(
                "server intervals must be positive".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth.jwt_secret = secret.into();
        self
    }

    #[must_use]
    pub fn with_token_ttls(mut self, access: Duration, refresh: Duration) -> Self {
        self.auth.access_ttl_secs = access.as_secs();
        self.auth.refresh_ttl_secs = refresh.as_secs();
        self
    }

    #[must_use]
    pub fn with_strict_revocation(mut self, strict: bool) -> Self {
        self.auth.strict_revocation = strict;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: SinkSection) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: SinkSection) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.server.request_deadline_secs = deadline.as_secs().max(1);
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: LogSection) -> Self {
        self.log = log;
        self
    }

    #[must_use]
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig::new(self.auth.jwt_secret.clone())
            .with_issuer(self.auth.issuer.clone())
            .with_audience(self.auth.audience.clone())
            .with_access_ttl(Duration::from_secs(self.auth.access_ttl_secs))
            .with_refresh_ttl(Duration::from_secs(self.auth.refresh_ttl_secs))
            .with_leeway(Duration::from_secs(self.auth.leeway_secs))
    }

    /// Built-in rules plus the configured prefixes
    #[must_use]
    pub fn classification_rules(&self) -> ClassificationRules {
        let extra = [
            (&self.classification.public, Classification::Public),
            (&self.classification.confidential, Classification::Confidential),
            (&self.classification.secret, Classification::Secret),
        ];
        extra
            .into_iter()
            .flat_map(|(prefixes, class)| prefixes.iter().map(move |p| (p, class)))
            .fold(ClassificationRules::default(), |rules, (prefix, class)| {
                rules.with_rule(prefix.clone(), class)
            })
    }

    #[inline]
    #[must_use]
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.server.request_deadline_secs)
    }

    #[inline]
    #[must_use]
    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.server.session_sweep_secs)
    }
}

fn parse_env<T: FromStr>(var: &'static str, raw: String) -> ConfigResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value: raw })
}
