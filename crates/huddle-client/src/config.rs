//! Client configuration
//!
//! Sources in increasing priority: built-in defaults, a config file
//! (explicit path, `HUDDLE_CONFIG`, or `./huddle.{toml,json,...}` if present)
//! and `HUDDLE_*` environment variables. Nested keys use a double underscore,
//! e.g. `HUDDLE_SIGNALING__REQUEST_TIMEOUT_MS=5000`.

use config::{Config, ConfigError, Environment, File, FileFormat};
use huddle_scheduler::WeightConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::room::JoinOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub room_id: String,
    pub display_name: String,
    /// Random when absent
    pub peer_id: Option<String>,
    pub signaling: SignalingSettings,
    pub join: JoinOptions,
    pub api: ApiSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4443,
            room_id: "huddle".to_string(),
            display_name: "Huddle Observer".to_string(),
            peer_id: None,
            signaling: SignalingSettings::default(),
            join: JoinOptions::default(),
            api: ApiSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingSettings {
    /// `wss://` when true, `ws://` otherwise
    pub secure: bool,
    pub subprotocol: String,
    pub request_timeout_ms: u64,
    pub ping_interval_secs: u64,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            secure: true,
            subprotocol: "protoo".to_string(),
            request_timeout_ms: 10_000,
            ping_interval_secs: 30,
        }
    }
}

impl SignalingSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

/// One scheduler route and its consumer pool size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRoute {
    pub name: String,
    pub concurrency: usize,
}

/// Out-of-band HTTP API used alongside the signaling connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// API calls are skipped when unset
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub routes: Vec<ApiRoute>,
    pub weights: WeightConfig,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            routes: vec![ApiRoute {
                name: "api".to_string(),
                concurrency: 4,
            }],
            weights: WeightConfig::default(),
        }
    }
}

impl ClientSettings {
    /// Load configuration from defaults, file and environment
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let explicit = config_file
            .map(str::to_string)
            .or_else(|| std::env::var("HUDDLE_CONFIG").ok());
        builder = match explicit {
            Some(path) => builder.add_source(File::with_name(&path)),
            None => builder.add_source(File::with_name("huddle").required(false)),
        };

        // HUDDLE_ROOM_ID, HUDDLE_SIGNALING__SUBPROTOCOL, ...
        builder = builder.add_source(
            Environment::with_prefix("HUDDLE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Configured peer id, or a fresh random one
    pub fn resolved_peer_id(&self) -> String {
        match &self.peer_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => random_peer_id(),
        }
    }
}

/// Short random peer id
pub fn random_peer_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(8).collect()
}
