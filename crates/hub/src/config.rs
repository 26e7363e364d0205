//! Configuration: a single TOML document plus environment overrides.
//!
//! The file is optional for development (every section has defaults except
//! the broker, the database and the auth secret, which may also arrive via
//! env).  Env always wins over the file.  Validation runs once at startup;
//! a bad config is a fatal init failure (exit 1), never a runtime surprise.

use std::env;
use std::fmt;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSettings,
    pub store: StoreSettings,
    pub ingest: IngestSettings,
    pub analysis: AnalysisSettings,
    pub auth: AuthSettings,
    pub retention: RetentionSettings,
    pub compression: CompressionSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    /// Broker address: `host`, `host:port`, or `mqtt://host:port`.
    pub broker_url: String,
    pub topics: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub auto_reconnect: bool,
    pub keepalive_s: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            topics: vec!["machine/+/data".into()],
            username: None,
            password: None,
            clean_session: true,
            auto_reconnect: true,
            keepalive_s: 60,
        }
    }
}

impl MqttSettings {
    /// Split the broker URL into (host, port); port defaults to 1883.
    pub fn host_port(&self) -> Result<(String, u16)> {
        let stripped = self
            .broker_url
            .strip_prefix("mqtt://")
            .or_else(|| self.broker_url.strip_prefix("tcp://"))
            .unwrap_or(&self.broker_url);
        if stripped.is_empty() {
            bail!("mqtt.broker_url is empty");
        }
        match stripped.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("bad port in mqtt.broker_url: '{port}'"))?;
                Ok((host.to_string(), port))
            }
            None => Ok((stripped.to_string(), 1883)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub buffer_capacity: usize,
    pub batch_max: usize,
    pub batch_linger_ms: u64,
    pub shutdown_grace_s: u64,
    pub quality: QualitySettings,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            batch_max: 500,
            batch_linger_ms: 250,
            shutdown_grace_s: 30,
            quality: QualitySettings::default(),
        }
    }
}

/// Cross-field quality heuristics (see reading validation).  Overridable
/// so a site with unusual machinery can relax them without a rebuild.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub enabled: bool,
    pub critical_min_temperature: f64,
    pub critical_min_vibration: f64,
    pub idle_max_temperature: f64,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            critical_min_temperature: 50.0,
            critical_min_vibration: 0.5,
            idle_max_temperature: 80.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub z_threshold: f64,
    pub min_points: usize,
    pub temp_warn: f64,
    pub temp_crit: f64,
    pub vib_warn: f64,
    pub vib_crit: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            z_threshold: 2.5,
            min_points: 10,
            temp_warn: 90.0,
            temp_crit: 100.0,
            vib_warn: 0.7,
            vib_crit: 0.8,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HMAC signing key; at least 32 bytes.
    pub secret: String,
    pub token_ttl_ms: u64,
    pub users: Vec<UserEntry>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl_ms: 86_400_000,
            users: Vec::new(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct UserEntry {
    pub username: String,
    /// bcrypt hash, cost ≥ 10.
    pub password_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub days: u32,
    pub prune_interval_s: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            days: 365,
            prune_interval_s: 21_600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    /// Informational: the store-side policy is created by the migrations.
    pub age_days: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self { age_days: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub bind: String,
    pub request_timeout_s: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            request_timeout_s: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load(path: Option<&str>) -> Result<Config> {
    let mut config = match path {
        Some(p) => {
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read config: {p}"))?;
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {p}"))?
        }
        None => Config::default(),
    };
    apply_env(&mut config);
    config.validate()?;
    Ok(config)
}

/// Env beats file.  Only deployment-varying values get env knobs; tuning
/// lives in the file.
fn apply_env(config: &mut Config) {
    if let Ok(v) = env::var("MQTT_BROKER_URL") {
        config.mqtt.broker_url = v;
    }
    if let Ok(v) = env::var("MQTT_USERNAME") {
        config.mqtt.username = Some(v);
    }
    if let Ok(v) = env::var("MQTT_PASSWORD") {
        config.mqtt.password = Some(v);
    }
    if let Ok(v) = env::var("DATABASE_URL") {
        config.store.database_url = v;
    }
    if let Ok(v) = env::var("AUTH_SECRET") {
        config.auth.secret = v;
    }
    if let Ok(v) = env::var("HTTP_BIND") {
        config.http.bind = v;
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.broker_url.is_empty() {
            bail!("mqtt.broker_url is required (or set MQTT_BROKER_URL)");
        }
        self.mqtt.host_port()?;
        if self.mqtt.topics.is_empty() {
            bail!("mqtt.topics must name at least one topic filter");
        }
        if self.store.database_url.is_empty() {
            bail!("store.database_url is required (or set DATABASE_URL)");
        }
        if self.store.max_connections == 0 {
            bail!("store.max_connections must be at least 1");
        }
        if self.ingest.buffer_capacity == 0 {
            bail!("ingest.buffer_capacity must be at least 1");
        }
        if self.ingest.batch_max == 0 {
            bail!("ingest.batch_max must be at least 1");
        }
        if self.auth.secret.len() < 32 {
            bail!("auth.secret must be at least 32 bytes (set AUTH_SECRET)");
        }
        if self.analysis.temp_warn >= self.analysis.temp_crit {
            bail!("analysis.temp_warn must be below analysis.temp_crit");
        }
        if self.analysis.vib_warn >= self.analysis.vib_crit {
            bail!("analysis.vib_warn must be below analysis.vib_crit");
        }
        if self.analysis.z_threshold <= 0.0 {
            bail!("analysis.z_threshold must be positive");
        }
        if self.retention.days == 0 {
            bail!("retention.days must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redacting Debug — secrets must never reach the logs
// ---------------------------------------------------------------------------

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("mqtt", &self.mqtt_redacted())
            .field("store", &self.store)
            .field("ingest", &self.ingest)
            .field("analysis", &self.analysis)
            .field("auth", &self.auth)
            .field("retention", &self.retention)
            .field("compression", &self.compression)
            .field("http", &self.http)
            .finish()
    }
}

impl Config {
    fn mqtt_redacted(&self) -> MqttSettings {
        MqttSettings {
            password: self.mqtt.password.as_ref().map(|_| "<redacted>".into()),
            ..self.mqtt.clone()
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("secret", &"<redacted>")
            .field("token_ttl_ms", &self.token_ttl_ms)
            .field("users", &self.users.len())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
