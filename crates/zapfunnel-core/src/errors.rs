/// Core error type for the funnel engine.
///
/// Adapter crates should map their specific errors into this type so the core
/// can handle failures consistently (transient gateway fault vs data error).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown funnel: {0}")]
    UnknownFunnel(String),

    #[error("invalid funnel definition: {0}")]
    InvalidFunnel(String),

    #[error("gateway error: {message}")]
    Gateway {
        message: String,
        status: Option<u16>,
    },

    #[error("all instances failed: {0}")]
    PoolExhausted(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(String),
}

pub type Result<T> = std::result::Result<T, Error>;
