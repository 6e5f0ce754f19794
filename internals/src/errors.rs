use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Frame(String),

    /// Broker answered with an ERROR frame
    #[error("Broker error: {message}")]
    Broker { message: String, details: String },

    #[error("Invalid broker url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("No endpoint of '{url}' is reachable: {}", .attempts.join("; "))]
    NoEndpointReachable { url: String, attempts: Vec<String> },

    #[error("Connection to {0} is closed")]
    ConnectionClosed(String),

    #[error("Timed out waiting for receipt '{0}'")]
    ReceiptTimeout(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Message listener failed: {0}")]
    Listener(String),
}
