pub use dispatch::{DispatchHandlerFactory, MessageDispatcher, MessageDispatcherBuilder};

mod dispatch;
