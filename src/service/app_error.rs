// Copyright 2025 the portico authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
#[error("Connection layer error")]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// wire protocol errors, fatal to the connection that produced them
    #[error("message too large: {0}")]
    MessageTooLarge(String),

    #[error("bad UTF-8 encoding in message stream")]
    BadUtf8,

    #[error("WebSocket handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("unwritable message type for this framer: {0}")]
    UnwritableMessage(String),

    /// death notifications
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("session closed: {0}")]
    SessionClosed(String),
}

impl AppError {
    /// Standard reason handed to `connection_died` on an orderly close.
    pub fn normal_close() -> AppError {
        AppError::ConnectionClosed("normal close".to_string())
    }
}
