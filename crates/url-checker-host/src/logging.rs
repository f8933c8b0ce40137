//! Guest output logging.
//!
//! Bytes the guest writes to its standard streams through the stub shim are
//! not forwarded to the host process. They are emitted via `tracing` instead
//! so that diagnostics printed during `_initialize` remain visible.

use tracing::{debug, warn};

/// A guest standard stream, identified by its WASI file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStream {
    /// File descriptor 1.
    Stdout,
    /// File descriptor 2.
    Stderr,
}

impl GuestStream {
    /// Map a WASI file descriptor to a stream, if it is one.
    pub fn from_fd(fd: i32) -> Option<Self> {
        match fd {
            1 => Some(GuestStream::Stdout),
            2 => Some(GuestStream::Stderr),
            _ => None,
        }
    }

    /// Emit `bytes` written by the guest on this stream.
    pub fn log(self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_end();
        if text.is_empty() {
            return;
        }

        match self {
            GuestStream::Stdout => debug!(guest_log = true, stream = "stdout", "{}", text),
            GuestStream::Stderr => warn!(guest_log = true, stream = "stderr", "{}", text),
        }
    }
}
