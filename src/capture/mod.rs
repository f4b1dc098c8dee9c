//! Packet capture/injection layer.
//!
//! The rewrite engine only ever sees a request as ready, pending or failed.
//! Buffer lifetime for in-flight requests belongs to the backend (see
//! [`pending::PendingTable`]).
//!
//! ## Backends
//!
//! - windivert.rs: WinDivert network layer with overlapped I/O (Windows)
//! - memory.rs: in-process capture fed through channels
//! - [`UnsupportedProvider`]: platforms without a packet diversion driver

pub mod memory;
pub mod pending;
#[cfg(windows)]
pub mod windivert;

pub use memory::{MemoryCapture, MemoryCaptureTap, MemoryProvider};
pub use pending::{PendingTable, RequestId};

use std::time::Duration;

use thiserror::Error;

use crate::divert::filter::DivertFilter;

/// Largest packet the capture layer hands out (IPv4 maximum).
pub const MAX_PACKET_SIZE: usize = 0xFFFF;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Handle closed or operation aborted; the normal shutdown signal.
    #[error("capture handle closed")]
    Closed,

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open capture handle: {0}")]
    Open(String),

    #[error("packet capture is not supported on this platform")]
    Unsupported,
}

impl CaptureError {
    /// True if the handle is gone and the caller should stop using it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::Closed | CaptureError::Unsupported)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "IN",
            Direction::Outbound => "OUT",
        }
    }
}

/// Metadata attached to a captured packet. Backends keep whatever else they
/// need for re-injection in `opaque`.
#[derive(Debug, Clone)]
pub struct PacketMeta {
    pub direction: Direction,
    pub opaque: Vec<u8>,
}

impl PacketMeta {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            opaque: Vec::new(),
        }
    }
}

/// A captured packet: raw IPv4 bytes plus capture metadata.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub data: Vec<u8>,
    pub meta: PacketMeta,
}

/// Outcome of submitting an asynchronous operation.
#[derive(Debug)]
pub enum Submission<T> {
    Ready(T),
    Pending(RequestId),
}

/// An open capture handle.
pub trait PacketCapture: Send + Sync + 'static {
    /// Issue a receive. Either completes immediately or returns a request
    /// to be waited on with [`PacketCapture::wait_recv`].
    fn recv(&self) -> Result<Submission<CapturedPacket>, CaptureError>;

    /// Wait up to `timeout` for a pending receive. `Ok(None)` means the wait
    /// timed out and the request is still outstanding.
    fn wait_recv(
        &self,
        request: RequestId,
        timeout: Duration,
    ) -> Result<Option<CapturedPacket>, CaptureError>;

    /// Reclaim every completed operation that nobody is waiting on, without
    /// blocking. Returns how many were reclaimed.
    fn drain_completions(&self) -> usize;

    /// Re-inject a packet. A pending send is completed in the background and
    /// reclaimed by [`PacketCapture::drain_completions`].
    fn send(&self, packet: &CapturedPacket) -> Result<Submission<()>, CaptureError>;

    /// Recompute checksums after mutating a packet.
    fn recalculate_checksums(&self, packet: &mut CapturedPacket);

    /// Invalidate the handle. Blocked and future calls fail with
    /// [`CaptureError::Closed`]. Idempotent.
    fn close(&self);
}

/// Opens capture handles for a filter.
pub trait CaptureProvider: Send + Sync + 'static {
    type Capture: PacketCapture;

    fn open(&self, filter: &DivertFilter, priority: i16) -> Result<Self::Capture, CaptureError>;
}

/// Provider for platforms without a packet diversion driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedProvider;

impl CaptureProvider for UnsupportedProvider {
    type Capture = MemoryCapture;

    fn open(&self, _filter: &DivertFilter, _priority: i16) -> Result<Self::Capture, CaptureError> {
        Err(CaptureError::Unsupported)
    }
}

/// Capture provider for the current platform.
#[cfg(windows)]
pub type PlatformProvider = windivert::WinDivertProvider;

#[cfg(not(windows))]
pub type PlatformProvider = UnsupportedProvider;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordTable;

    #[test]
    fn test_fatal_errors() {
        assert!(CaptureError::Closed.is_fatal());
        assert!(CaptureError::Unsupported.is_fatal());
        assert!(!CaptureError::Io(std::io::Error::from(std::io::ErrorKind::Other)).is_fatal());
        assert!(!CaptureError::Open("nope".into()).is_fatal());
    }

    #[test]
    fn test_unsupported_provider() {
        let filter = DivertFilter::new(80, 8080, RecordTable::default().into());
        assert!(matches!(UnsupportedProvider.open(&filter, 0), Err(CaptureError::Unsupported)));
    }
}
