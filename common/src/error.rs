use std::{fmt, process::ExitCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherError {
    /// Fatal error. Should not retry.
    Fatal,
    /// Configuration error. Should not retry.
    Configuration,
    /// The upstream node connection failed. Retry with backoff.
    UpstreamUnavailable,
    /// A batched historical fetch came back with heights missing.
    PartialFetch,
    /// The raw payload could not be decoded. Skip the block.
    MalformedPayload,
    /// A computed trie root does not match the header. Reject the block.
    RootMismatch,
    /// Writing IPLD bytes to the block store failed.
    PublishFailed,
    /// Writing manifest rows to the index failed.
    IndexFailed,
    /// A requested CID is not in the block store.
    NotFound,
    /// A batch get returned fewer IPLDs than requested.
    UnexpectedIpldCount,
    /// A subscriber's parameters could not be parsed.
    BadSubscription,
    /// A subscriber did not drain its channel in time.
    SlowConsumer,
}

pub type Result<T> = error_stack::Result<T, WatcherError>;

impl error_stack::Context for WatcherError {}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherError::Fatal => f.write_str("watcher error: fatal"),
            WatcherError::Configuration => f.write_str("watcher error: configuration"),
            WatcherError::UpstreamUnavailable => f.write_str("watcher error: upstream unavailable"),
            WatcherError::PartialFetch => f.write_str("watcher error: partial fetch"),
            WatcherError::MalformedPayload => f.write_str("watcher error: malformed payload"),
            WatcherError::RootMismatch => f.write_str("watcher error: root mismatch"),
            WatcherError::PublishFailed => f.write_str("watcher error: publish failed"),
            WatcherError::IndexFailed => f.write_str("watcher error: index failed"),
            WatcherError::NotFound => f.write_str("watcher error: not found"),
            WatcherError::UnexpectedIpldCount => {
                f.write_str("watcher error: unexpected ipld count")
            }
            WatcherError::BadSubscription => f.write_str("watcher error: bad subscription"),
            WatcherError::SlowConsumer => f.write_str("watcher error: slow consumer"),
        }
    }
}

pub trait ReportExt {
    fn to_exit_code(&self) -> ExitCode;
}

impl<T> ReportExt for Result<T> {
    fn to_exit_code(&self) -> ExitCode {
        match self {
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{:?}", err);
                ExitCode::FAILURE
            }
        }
    }
}
