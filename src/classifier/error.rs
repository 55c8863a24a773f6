use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("classifier unreachable after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("classifier pool is shut down")]
    PoolClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("classifier rejected request: {0}")]
    Rejected(String),
}

impl From<std::io::Error> for ClassifierError {
    fn from(err: std::io::Error) -> Self {
        ClassifierError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for ClassifierError {
    fn from(err: serde_json::Error) -> Self {
        ClassifierError::Protocol(err.to_string())
    }
}
