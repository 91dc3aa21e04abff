use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport failure to {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AgentError {
    /// Build a transport error for a `host:port` endpoint.
    pub fn transport(host: &str, port: u16, message: impl Into<String>) -> Self {
        AgentError::Transport {
            endpoint: format!("{host}:{port}"),
            message: message.into(),
        }
    }
}
