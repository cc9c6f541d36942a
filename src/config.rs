use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub web_socket_config: WebSocketConfig,
    pub ca_file: Option<String>,
    /// Extra headers added to the upgrade request, as (name, value) pairs.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub max_frame_size: Option<usize>,
    pub max_message_size: Option<usize>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
        }
    }
}

/// Everything a load run needs to know. Every field has a default, so a
/// config file only has to list what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Base address of the chat service, `ws://`, `wss://`, `http://` or `https://`.
    pub server_url: String,
    /// Conversation every client joins and sends to.
    pub conversation_id: String,
    /// Requested number of clients, capped by the number of credentials.
    pub clients: usize,
    pub messages_per_client: usize,
    pub message_delay_ms: u64,
    /// A client that sent something and heard nothing back for this long is
    /// timed out. A client with nothing pending is disconnected after the same
    /// amount of silence.
    pub inactivity_timeout_secs: u64,
    /// Upper bound for the whole run.
    pub global_timeout_secs: u64,
    /// Enables the forward policy: every received message triggers one more
    /// send, up to this many per client.
    pub max_forwards: Option<usize>,
    pub spawn_stagger_ms: u64,
    pub join_settle_ms: u64,
    pub connect_timeout_secs: u64,
    pub sample_interval_ms: u64,
    pub shutdown_grace_secs: u64,
    pub live_monitoring: bool,
    pub monitor_interval_secs: u64,
    pub reports_enabled: bool,
    pub report_dir: String,
    pub lookup_conversation_size: bool,
    pub ca_file: Option<String>,
    pub web_socket: WebSocketConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            server_url: String::from("ws://localhost"),
            conversation_id: String::new(),
            clients: 2,
            messages_per_client: 10,
            message_delay_ms: 100,
            inactivity_timeout_secs: 10,
            global_timeout_secs: 120,
            max_forwards: None,
            spawn_stagger_ms: 100,
            join_settle_ms: 500,
            connect_timeout_secs: 10,
            sample_interval_ms: 500,
            shutdown_grace_secs: 5,
            live_monitoring: false,
            monitor_interval_secs: 2,
            reports_enabled: true,
            report_dir: String::from("stress_test_reports"),
            lookup_conversation_size: true,
            ca_file: None,
            web_socket: WebSocketConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("failed to read {}: {}", path.display(), e)))?;
        let config: RunConfig = serde_json::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.server_url.trim().is_empty() {
            return Err(Error::ConfigError(String::from("server_url must not be empty")));
        }
        if self.inactivity_timeout_secs == 0 {
            return Err(Error::ConfigError(String::from(
                "inactivity_timeout_secs must be greater than zero",
            )));
        }
        if self.global_timeout_secs == 0 {
            return Err(Error::ConfigError(String::from(
                "global_timeout_secs must be greater than zero",
            )));
        }
        if self.sample_interval_ms == 0 {
            return Err(Error::ConfigError(String::from(
                "sample_interval_ms must be greater than zero",
            )));
        }
        if self.live_monitoring && self.monitor_interval_secs == 0 {
            return Err(Error::ConfigError(String::from(
                "monitor_interval_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            web_socket_config: self.web_socket.clone(),
            ca_file: self.ca_file.clone(),
            headers: Vec::new(),
        }
    }

    pub fn message_delay(&self) -> Duration {
        Duration::from_millis(self.message_delay_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.global_timeout_secs)
    }

    pub fn spawn_stagger(&self) -> Duration {
        Duration::from_millis(self.spawn_stagger_ms)
    }

    pub fn join_settle(&self) -> Duration {
        Duration::from_millis(self.join_settle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
