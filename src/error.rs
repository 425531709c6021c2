use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalciferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("provider {provider} failed: {source}")]
    Upstream {
        provider: String,
        #[source]
        source: Box<CalciferError>,
    },
    #[error("cache miss")]
    CacheMiss,
    #[error("request cancelled")]
    Cancelled,
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CalciferError {
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::CacheMiss)
    }

    pub(crate) fn upstream(provider: impl Into<String>, source: CalciferError) -> Self {
        Self::Upstream {
            provider: provider.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, CalciferError>;
