use std::fmt;

use tokio::sync::watch;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds of the messaging core. The same values are used as the
/// reason codes handed to channel users when a partition deactivates or a
/// channel disconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// No registration or no live connection for the channel.
    NotConnected,
    /// The channel number is already registered.
    AlreadyRegistered,
    /// The remote partition is unreachable or stopped heartbeating.
    PartitionDown,
    /// No free slot in the outbound queue.
    QueueFull,
    /// Transient condition, the caller may try again.
    Retry,
    /// A worker, queue or memory region could not be allocated.
    ResourceExhausted,
    /// The remote partition speaks an incompatible protocol version.
    ProtocolVersionMismatch,
    /// Both sides registered the channel with different payload sizes.
    PayloadSizeMismatch,
    /// A wait was cut short because the signal it waited on went away.
    Interrupted,
    /// The local subsystem is shutting down.
    Unloading,
    /// The local user withdrew the channel registration.
    Unregistering,
    InvalidPartition,
    InvalidChannel,
    InvalidArgument,
    /// A descriptor or reserved page failed validation.
    CorruptDescriptor,
}

impl Error {
    /// Transient errors are retried locally and never reach a reason code.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::QueueFull | Error::Retry)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotConnected => "channel is not connected",
            Error::AlreadyRegistered => "channel is already registered",
            Error::PartitionDown => "remote partition is down",
            Error::QueueFull => "message queue is full",
            Error::Retry => "resource temporarily unavailable",
            Error::ResourceExhausted => "resources exhausted",
            Error::ProtocolVersionMismatch => "protocol version mismatch",
            Error::PayloadSizeMismatch => "payload sizes differ between partitions",
            Error::Interrupted => "wait interrupted",
            Error::Unloading => "subsystem is unloading",
            Error::Unregistering => "channel registration withdrawn",
            Error::InvalidPartition => "invalid partition",
            Error::InvalidChannel => "invalid channel",
            Error::InvalidArgument => "invalid argument",
            Error::CorruptDescriptor => "corrupt descriptor",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<watch::error::RecvError> for Error {
    fn from(_: watch::error::RecvError) -> Self {
        Self::Interrupted
    }
}
