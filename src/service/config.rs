extern crate config as _;

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Largest message body/block the framers will accept, in bytes.
    pub max_msg_length: usize,
    /// If true, JSON parse errors are surfaced to handlers as pseudo-messages
    /// instead of being logged and dismissed.
    pub debug_replies: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            max_msg_length: 1024 * 1024,
            debug_replies: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub max_connection: usize,
    pub conn_read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            max_connection: 1024,
            conn_read_buffer_size: 4 * 1024,
        }
    }
}

/// Wire protocol spoken on a listener port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Json,
    Http,
    Websocket,
    Rtcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub label: String,
    pub addr: String,
    pub protocol: Protocol,
    /// TLS for this port.  Key material handling is an external collaborator;
    /// a secure listener without it fails startup of that listener only.
    #[serde(default)]
    pub secure: bool,
    /// Root path element for HTTP and WebSocket URIs on this port.
    #[serde(default = "default_root_uri")]
    pub root_uri: String,
}

fn default_root_uri() -> String {
    "portico".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds a session may go without client traffic before it is killed.
    pub inactivity_timeout_secs: u64,
    /// Seconds an RTCP session may sit with no live TCP connection.
    pub disconnected_timeout_secs: u64,
    /// Ceiling on unacknowledged outbound bytes; exceeding it kills the session.
    pub backlog_limit_bytes: usize,
    /// Seconds a fresh TCP connection gets to issue its first request.
    pub startup_grace_secs: u64,
    /// Seconds an HTTP long-poll select may wait before an empty reply.
    pub select_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            inactivity_timeout_secs: 60,
            disconnected_timeout_secs: 30,
            backlog_limit_bytes: 64 * 1024,
            startup_grace_secs: 15,
            select_timeout_secs: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub channel_capacity: usize,
    /// 0 means one worker per CPU core.
    pub num_workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            channel_capacity: 1024,
            num_workers: 0,
        }
    }
}

impl DispatcherConfig {
    pub fn effective_workers(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get()
        } else {
            self.num_workers
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;

        Ok(server_config)
    }
}
