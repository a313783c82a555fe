//! Error types for Troupe

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid arguments for tool {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("no pending elicitation for session {0}")]
    NoPendingElicitation(String),

    #[error("session {0} already has an active run")]
    SessionBusy(String),

    #[error("llm error: {provider} - {message}")]
    LlmError { provider: String, message: String },

    #[error("tool error: {name} - {message}")]
    ToolError { name: String, message: String },

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification a transport maps onto its own status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    ServerError,
}

impl Error {
    pub fn invalid_arguments(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn llm_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn tool_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolError {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidArguments { .. }
            | Error::InvalidRequest(_)
            | Error::SessionNotFound(_)
            | Error::AgentNotFound(_)
            | Error::NoPendingElicitation(_)
            | Error::SessionBusy(_) => ErrorClass::BadRequest,
            _ => ErrorClass::ServerError,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.class() == ErrorClass::BadRequest
    }
}
