use std::time::Duration;

/// Why a send request failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    #[error("disconnected before the device acknowledged")]
    Disconnected,

    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("batch contains no lines")]
    EmptyBatch,

    #[error("line {0:?} contains a line break")]
    InvalidLine(String),

    #[error("the link has shut down")]
    LinkClosed,
}
