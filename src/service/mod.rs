pub use app_error::{AppError, AppResult};
pub use config::{
    DispatcherConfig, GeneralConfig, ListenerConfig, NetworkConfig, Protocol, ServerConfig,
    SessionConfig,
};
pub use runtime::ServerRuntime;
pub use server::PortServer;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod runtime;
mod server;
mod shutdown;
mod tracing_config;
