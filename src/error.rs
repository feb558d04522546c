//! Platform error taxonomy and API error codes.
//!
//! Workers capture failures with `anyhow` context at the narrowest point and
//! attach them to the nearest sub-task or round; the typed variants here are
//! what crosses component boundaries and maps onto the response envelope.

use std::time::Duration;

use thiserror::Error;

pub const CODE_OK: i32 = 0;
pub const CODE_INVALID_ARGS: i32 = 40001;
pub const CODE_NOT_FOUND: i32 = 40002;
pub const CODE_UNAUTHORIZED: i32 = 40101;
pub const CODE_INTERNAL: i32 = 50001;
pub const CODE_STORE: i32 = 50002;
pub const CODE_LLM: i32 = 50003;

/// Failure of a single provider extraction call.
///
/// "No data" is not an error: a successful call with zero rows is reported as
/// a normal outcome by the extractor.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("provider rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider error {code}: {message}")]
    Provider { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum PlatformError {
    /// Invalid plugin declaration or missing required environment.
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    /// Widening was required but the engine cannot express it.
    #[error("schema error: {0}")]
    Schema(String),
    #[error("store error: {0}")]
    Store(String),
    /// An invalid state transition or argument was requested.
    #[error("invalid state: {0}")]
    State(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("llm error: {0}")]
    Llm(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PlatformError {
    /// The documented envelope code for this error.
    pub fn code(&self) -> i32 {
        match self {
            PlatformError::Config(_) | PlatformError::State(_) => CODE_INVALID_ARGS,
            PlatformError::NotFound(_) => CODE_NOT_FOUND,
            PlatformError::Store(_) => CODE_STORE,
            PlatformError::Llm(_) => CODE_LLM,
            PlatformError::Extract(_)
            | PlatformError::Schema(_)
            | PlatformError::Internal(_) => CODE_INTERNAL,
        }
    }
}

impl From<rusqlite::Error> for PlatformError {
    fn from(e: rusqlite::Error) -> Self {
        PlatformError::Store(e.to_string())
    }
}

pub type Result<T, E = PlatformError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(PlatformError::State("bad".into()).code(), CODE_INVALID_ARGS);
        assert_eq!(PlatformError::NotFound("x".into()).code(), CODE_NOT_FOUND);
        assert_eq!(PlatformError::Store("w".into()).code(), CODE_STORE);
        assert_eq!(PlatformError::Llm("m".into()).code(), CODE_LLM);
        let extract = PlatformError::Extract(ExtractError::Transport("conn reset".into()));
        assert_eq!(extract.code(), CODE_INTERNAL);
    }
}
