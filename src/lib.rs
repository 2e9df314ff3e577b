mod network;
mod request;
mod service;
mod session;
mod utils;

pub use network::framer::{
    FrameDecoder, FrameEncoder, FramerConfig, HttpError, HttpRequest, InboundMessage,
    OutboundMessage, RtcpRequest, RtcpVerb, WebsocketRequest,
};
pub use network::{ChunkyInputStream, Connection, MessageHandler, MessageHandlerFactory, TcpConnection};
pub use request::{DispatchHandlerFactory, MessageDispatcher, MessageDispatcherBuilder};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, DispatcherConfig, GeneralConfig,
    ListenerConfig, NetworkConfig, Protocol, ServerConfig, ServerRuntime, SessionConfig, Shutdown,
};
pub use session::{
    HttpHandlerFactory, HttpSessionConnection, RtcpHandlerFactory, RtcpSessionConnection,
    SessionRegistry, SessionUri, UriVerb, WebsocketHandlerFactory,
};
pub use utils::{TickClock, Timeout, Timer};
