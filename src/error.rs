use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Configuration parameter value is out of bounds.
    #[error("config parameter {parameter:?} value is out of bounds: {message}")]
    ConfigParameterValue {
        parameter: &'static str,
        message: String,
    },

    /// Wrapper for [`figment::Error`](https://docs.rs/figment/latest/figment/struct.Error.html)
    #[error("config deserialization: {0:?}")]
    ConfigDeserialization(#[from] figment::Error),

    /// Wrapper for [`serde_json::Error`](https://docs.rs/serde_json/latest/serde_json/struct.Error.html)
    #[error("json serialization/deserialization: {0:?}")]
    SerdeJson(#[from] serde_json::Error),

    /// Wrapper for [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html)
    #[error("IO: {0:?}")]
    IO(#[from] std::io::Error),

    /// Buffer shorter than a required fixed-size header prefix
    #[error("truncated {0} header")]
    TooSmall(&'static str),

    /// Magic bytes absent, truncated structure or impossible field value
    #[error("invalid {format} image: {message}")]
    InvalidFormat {
        format: &'static str,
        message: String,
    },
}

impl AnalysisError {
    pub fn invalid(format: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            format,
            message: message.into(),
        }
    }
}
