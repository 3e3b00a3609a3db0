use agenda_protocol::{ConnCode, ErrorReply};
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AgendaError {
    #[error("could not decode payload: {0}")]
    Decode(String),

    #[error("could not encode reply: {0}")]
    Encode(String),

    #[error("invalid time: {0}")]
    TimeParse(String),

    #[error("missing required field: {0}")]
    MissingData(&'static str),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unexpected cached value for {0}")]
    TypeCast(String),

    #[error("event timed out after {0:?}")]
    Timeout(Duration),

    #[error("unsupported event: {0}")]
    UnsupportedEvent(String),

    #[error("session closed")]
    SessionClosed,
}

impl AgendaError {
    pub fn conn_code(&self) -> ConnCode {
        match self {
            AgendaError::Decode(_) => ConnCode::JsonDecodeError,
            AgendaError::Encode(_) => ConnCode::JsonEncodeError,
            AgendaError::TimeParse(_) => ConnCode::TimeParseError,
            AgendaError::MissingData(_) => ConnCode::MissingData,
            AgendaError::Permission(_) => ConnCode::PermissionError,
            AgendaError::Cache(_) => ConnCode::CacheError,
            AgendaError::Store(StoreError::Expired) => ConnCode::Timeout,
            AgendaError::Store(_) => ConnCode::DatabaseError,
            AgendaError::TypeCast(_) => ConnCode::TypeCastError,
            AgendaError::Timeout(_) => ConnCode::Timeout,
            AgendaError::UnsupportedEvent(_) => ConnCode::UnsupportedData,
            AgendaError::SessionClosed => ConnCode::GoingAway,
        }
    }

    /// Convert to a wire error reply with a sanitized message.
    pub fn to_error_reply(&self) -> ErrorReply {
        let message = match self {
            AgendaError::Store(StoreError::Backend(_)) => "database error".to_string(),
            AgendaError::Cache(_) => "cache error".to_string(),
            other => other.to_string(),
        };
        ErrorReply::new(self.conn_code(), message)
    }
}
