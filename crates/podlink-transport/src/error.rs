/// Errors raised by a packet radio adapter.
#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    /// The adapter could not be reached or initialized.
    #[error("failed to connect to radio adapter: {0}")]
    Connect(String),

    /// An I/O error occurred on the link to the adapter.
    #[error("radio I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The adapter reported a failure while executing a command.
    #[error("radio device error: {0}")]
    Device(String),

    /// A command was issued while no adapter link was established.
    #[error("radio adapter not connected")]
    NotConnected,

    /// The adapter has been shut down.
    #[error("radio shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RadioError>;
