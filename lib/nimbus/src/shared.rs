use std::io;

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamError {
    /// Socket or reliable-UDP send/receive failure. Always fatal.
    Transport(io::ErrorKind),
    /// Runt packet or malformed header. Logged and dropped at the call site.
    Framing,
    /// Cipher failure or authentication tag mismatch.
    Crypto,
    /// A bounded queue rejected the element.
    BoundExceeded,
    /// The queue or stream is shutting down.
    Shutdown,
    /// A startup budget expired before the peer answered.
    Timeout,
    /// The stream has not been started, or has already been stopped.
    NotRunning,
    /// A worker thread could not be spawned.
    Thread,
}

impl From<io::Error> for StreamError {
    #[inline]
    fn from(err: io::Error) -> Self {
        StreamError::Transport(err.kind())
    }
}

/// Coarse connection quality reported to the listener.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionStatus {
    Okay,
    Poor,
}

/// Termination the peer intended; not an error.
pub const TERMINATION_GRACEFUL: i32 = 0;
/// The peer closed the session before a single frame was seen.
pub const TERMINATION_UNEXPECTED_EARLY: i32 = -102;
/// The peer refused to stream protected content.
pub const TERMINATION_PROTECTED_CONTENT: i32 = -103;
/// Catch-all for transport level failures.
pub const TERMINATION_TRANSPORT_FAILURE: i32 = -1;

/// Callbacks delivered upward to the embedding application. Implementations
/// must be cheap and non-blocking; they are invoked from the worker threads.
pub trait ConnectionListener: Send + Sync {
    /// Called on OKAY/POOR transitions, never twice in a row with the same
    /// status.
    fn connection_status_update(&self, status: ConnectionStatus);

    /// Called exactly once when the session ends, with one of the
    /// `TERMINATION_*` codes or a peer-supplied reason.
    fn connection_terminated(&self, code: i32);

    /// Controller haptics request from the host.
    fn rumble(&self, controller: u16, low_freq: u16, high_freq: u16);
}
