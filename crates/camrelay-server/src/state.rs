use camrelay_protocol::IceServer;
use config::{Environment, File, FileFormat};
use serde::Deserialize;
use std::sync::Arc;

use crate::rtc::RtcEngine;
use crate::session::SessionCoordinator;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
    /// TURN urls sharing `turn_username`/`turn_credential`
    #[serde(default)]
    pub turn_urls: Vec<String>,
    #[serde(default)]
    pub turn_username: Option<String>,
    #[serde(default)]
    pub turn_credential: Option<String>,
    /// Empty allows any origin
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            stun_servers: default_stun_servers(),
            turn_servers: Vec::new(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `camrelay.toml` (optional), then `CAMRELAY_*` environment
    /// variables
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(File::with_name("camrelay").required(false))
            .add_source(
                Environment::with_prefix("CAMRELAY")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stun_servers")
                    .with_list_parse_key("turn_urls")
                    .with_list_parse_key("allowed_origins"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Parse a TOML document, with defaults for anything it leaves out
    pub fn from_toml(source: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// STUN servers first, then every TURN server with its credential
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut ice_servers: Vec<IceServer> = self
            .stun_servers
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();

        if !self.turn_urls.is_empty() {
            ice_servers.push(IceServer {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }

        for turn in &self.turn_servers {
            ice_servers.push(IceServer {
                urls: vec![turn.url.clone()],
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.clone()),
            });
        }

        ice_servers
    }
}

pub struct AppState<E: RtcEngine> {
    pub config: Arc<Config>,
    pub coordinator: SessionCoordinator<E>,
}

impl<E: RtcEngine> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<E: RtcEngine> AppState<E> {
    pub fn new(config: Config, engine: Arc<E>) -> Self {
        Self {
            config: Arc::new(config),
            coordinator: SessionCoordinator::new(engine),
        }
    }
}
