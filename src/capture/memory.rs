//! In-process capture backend.
//!
//! Packets are fed through a [`MemoryCaptureTap`]. The tap applies the same
//! predicate as the capture filter: matching packets are queued for the
//! rewrite engine, everything else goes straight to the re-injection side
//! untouched. Re-injected packets can be read back from the tap.
//!
//! Receives that find the queue empty become pending requests and sends are
//! completed asynchronously, so the engine's wait/drain paths are the same
//! ones a completion-port backend drives.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use super::{
    CaptureError, CaptureProvider, CapturedPacket, Direction, PacketCapture, PacketMeta,
    PendingTable, RequestId, Submission,
};
use crate::divert::filter::DivertFilter;
use crate::packet;

/// A request tracked by the memory backend.
#[derive(Debug)]
enum MemoryOp {
    Recv,
    Send { len: usize },
}

struct Shared {
    intercept_tx: Sender<CapturedPacket>,
    intercept_rx: Receiver<CapturedPacket>,
    output_tx: Sender<CapturedPacket>,
    output_rx: Receiver<CapturedPacket>,
    filter: Mutex<Option<DivertFilter>>,
    recv_fault: Mutex<Option<io::ErrorKind>>,
    failed_recvs: AtomicU64,
    open_handles: AtomicU64,
    opened: AtomicU64,
    reclaimed: AtomicU64,
}

/// Opens [`MemoryCapture`] handles that share one tap.
#[derive(Clone)]
pub struct MemoryProvider {
    shared: Arc<Shared>,
}

/// Test-side view of a memory capture: inject packets, read re-injections.
#[derive(Clone)]
pub struct MemoryCaptureTap {
    shared: Arc<Shared>,
}

impl MemoryProvider {
    pub fn new() -> (Self, MemoryCaptureTap) {
        let (intercept_tx, intercept_rx) = crossbeam_channel::unbounded();
        let (output_tx, output_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            intercept_tx,
            intercept_rx,
            output_tx,
            output_rx,
            filter: Mutex::new(None),
            recv_fault: Mutex::new(None),
            failed_recvs: AtomicU64::new(0),
            open_handles: AtomicU64::new(0),
            opened: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MemoryCaptureTap { shared },
        )
    }
}

impl CaptureProvider for MemoryProvider {
    type Capture = MemoryCapture;

    fn open(&self, filter: &DivertFilter, priority: i16) -> Result<MemoryCapture, CaptureError> {
        log::debug!("Memory capture opened (priority {}): {}", priority, filter);
        *self.shared.filter.lock() = Some(filter.clone());
        self.shared.open_handles.fetch_add(1, Ordering::SeqCst);
        self.shared.opened.fetch_add(1, Ordering::SeqCst);

        let (close_tx, close_rx) = crossbeam_channel::bounded(0);
        Ok(MemoryCapture {
            shared: Arc::clone(&self.shared),
            pending: PendingTable::new(),
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        })
    }
}

impl MemoryCaptureTap {
    /// Offer a packet to the network layer. Returns `true` if the capture
    /// filter selected it, `false` if it passed through untouched.
    pub fn inject(&self, data: Vec<u8>, direction: Direction) -> bool {
        let packet = CapturedPacket {
            data,
            meta: PacketMeta::new(direction),
        };

        let selected = match (self.shared.filter.lock().as_ref(), self.is_open()) {
            (Some(filter), true) => packet::parse_ipv4_tcp(&packet.data)
                .map(|h| filter.matches(&h))
                .unwrap_or(false),
            _ => false,
        };

        let tx = if selected {
            &self.shared.intercept_tx
        } else {
            &self.shared.output_tx
        };
        let _ = tx.send(packet);
        selected
    }

    /// Queue raw bytes for the engine, bypassing the filter.
    pub fn inject_unfiltered(&self, data: Vec<u8>, direction: Direction) {
        let _ = self.shared.intercept_tx.send(CapturedPacket {
            data,
            meta: PacketMeta::new(direction),
        });
    }

    /// Next packet that reached the network stack, whether re-injected by
    /// the engine or passed through by the filter.
    pub fn recv_output(&self, timeout: Duration) -> Option<CapturedPacket> {
        self.shared.output_rx.recv_timeout(timeout).ok()
    }

    /// True while a capture handle is open.
    pub fn is_open(&self) -> bool {
        self.shared.open_handles.load(Ordering::SeqCst) > 0
    }

    /// Number of handles opened over the provider's lifetime.
    pub fn times_opened(&self) -> u64 {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Make the next receive fail with an I/O error of `kind`.
    pub fn fail_next_recv(&self, kind: io::ErrorKind) {
        *self.shared.recv_fault.lock() = Some(kind);
    }

    /// Number of receives failed through [`fail_next_recv`](Self::fail_next_recv).
    pub fn failed_recvs(&self) -> u64 {
        self.shared.failed_recvs.load(Ordering::SeqCst)
    }

    /// Number of completed requests reclaimed by drain passes.
    pub fn reclaimed(&self) -> u64 {
        self.shared.reclaimed.load(Ordering::SeqCst)
    }
}

pub struct MemoryCapture {
    shared: Arc<Shared>,
    pending: PendingTable<MemoryOp>,
    closed: AtomicBool,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl MemoryCapture {
    /// Requests issued and not yet reclaimed.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn ensure_open(&self) -> Result<(), CaptureError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CaptureError::Closed)
        } else {
            Ok(())
        }
    }
}

impl PacketCapture for MemoryCapture {
    fn recv(&self) -> Result<Submission<CapturedPacket>, CaptureError> {
        self.ensure_open()?;
        if let Some(kind) = self.shared.recv_fault.lock().take() {
            self.shared.failed_recvs.fetch_add(1, Ordering::SeqCst);
            return Err(CaptureError::Io(io::Error::new(kind, "receive failed")));
        }
        match self.shared.intercept_rx.try_recv() {
            Ok(packet) => Ok(Submission::Ready(packet)),
            Err(TryRecvError::Empty) => Ok(Submission::Pending(self.pending.issue(MemoryOp::Recv))),
            Err(TryRecvError::Disconnected) => Err(CaptureError::Closed),
        }
    }

    fn wait_recv(
        &self,
        request: RequestId,
        timeout: Duration,
    ) -> Result<Option<CapturedPacket>, CaptureError> {
        if self.closed.load(Ordering::SeqCst) {
            self.pending.take(request);
            return Err(CaptureError::Closed);
        }

        crossbeam_channel::select! {
            recv(self.shared.intercept_rx) -> msg => {
                self.pending.take(request);
                msg.map(Some).map_err(|_| CaptureError::Closed)
            }
            recv(self.close_rx) -> _ => {
                self.pending.take(request);
                Err(CaptureError::Closed)
            }
            default(timeout) => Ok(None),
        }
    }

    fn drain_completions(&self) -> usize {
        let reclaimed = self.pending.take_completed();
        for op in &reclaimed {
            match op {
                MemoryOp::Send { len } => log::trace!("Memory capture reclaimed send of {} bytes", len),
                MemoryOp::Recv => log::trace!("Memory capture reclaimed orphaned receive"),
            }
        }
        self.shared
            .reclaimed
            .fetch_add(reclaimed.len() as u64, Ordering::SeqCst);
        reclaimed.len()
    }

    fn send(&self, packet: &CapturedPacket) -> Result<Submission<()>, CaptureError> {
        self.ensure_open()?;
        let id = self.pending.issue(MemoryOp::Send {
            len: packet.data.len(),
        });
        self.shared
            .output_tx
            .send(packet.clone())
            .map_err(|_| CaptureError::Closed)?;
        self.pending.complete(id);
        Ok(Submission::Pending(id))
    }

    fn recalculate_checksums(&self, packet: &mut CapturedPacket) {
        packet::fix_packet_checksums(&mut packet.data);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender wakes any waiter selecting on `close_rx`.
        self.close_tx.lock().take();
        self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for MemoryCapture {
    fn drop(&mut self) {
        self.close();
        let leftover = self.pending.take_all();
        if !leftover.is_empty() {
            log::debug!("Memory capture dropped {} outstanding requests", leftover.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyRecord, RecordTable};
    use crate::packet::test_support::tcp_packet;
    use std::net::Ipv4Addr;
    use std::thread;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn open() -> (MemoryCapture, MemoryCaptureTap) {
        let records = RecordTable::new(vec![ProxyRecord::new(CLIENT, Ipv4Addr::new(1, 2, 3, 4), 80)]);
        let filter = DivertFilter::new(80, 8080, Arc::new(records));
        let (provider, tap) = MemoryProvider::new();
        (provider.open(&filter, 0).unwrap(), tap)
    }

    #[test]
    fn test_filter_selects_and_passes_through() {
        let (capture, tap) = open();

        assert!(tap.inject(tcp_packet(CLIENT, LOCAL, 50000, 80, b""), Direction::Inbound));
        assert!(!tap.inject(tcp_packet(CLIENT, LOCAL, 50000, 22, b""), Direction::Inbound));

        // The non-matching packet is already on the output side.
        let passed = tap.recv_output(Duration::from_millis(100)).unwrap();
        assert_eq!(packet::parse_ipv4_tcp(&passed.data).unwrap().dst_port, 22);

        match capture.recv().unwrap() {
            Submission::Ready(p) => assert_eq!(p.meta.direction, Direction::Inbound),
            Submission::Pending(_) => panic!("expected a ready packet"),
        }
    }

    #[test]
    fn test_pending_recv_times_out_then_completes() {
        let (capture, tap) = open();

        let id = match capture.recv().unwrap() {
            Submission::Pending(id) => id,
            Submission::Ready(_) => panic!("queue should be empty"),
        };
        assert_eq!(capture.pending_requests(), 1);
        assert!(capture.wait_recv(id, Duration::from_millis(20)).unwrap().is_none());

        tap.inject(tcp_packet(CLIENT, LOCAL, 50000, 80, b"x"), Direction::Inbound);
        let packet = capture.wait_recv(id, Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(packet.data.len(), 41);
        assert_eq!(capture.pending_requests(), 0);
    }

    #[test]
    fn test_sends_are_reclaimed_once() {
        let (capture, tap) = open();
        let packet = CapturedPacket {
            data: tcp_packet(LOCAL, CLIENT, 8080, 50000, b""),
            meta: PacketMeta::new(Direction::Outbound),
        };

        assert!(matches!(capture.send(&packet).unwrap(), Submission::Pending(_)));
        assert!(matches!(capture.send(&packet).unwrap(), Submission::Pending(_)));
        assert_eq!(capture.pending_requests(), 2);

        assert_eq!(capture.drain_completions(), 2);
        assert_eq!(capture.drain_completions(), 0);
        assert_eq!(tap.reclaimed(), 2);
        assert!(tap.recv_output(Duration::from_millis(100)).is_some());
        assert!(tap.recv_output(Duration::from_millis(100)).is_some());
    }

    #[test]
    fn test_recv_fault_fires_once() {
        let (capture, tap) = open();
        tap.fail_next_recv(io::ErrorKind::ConnectionReset);

        match capture.recv() {
            Err(e @ CaptureError::Io(_)) => assert!(!e.is_fatal()),
            other => panic!("expected an I/O error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(tap.failed_recvs(), 1);
        assert!(matches!(capture.recv().unwrap(), Submission::Pending(_)));
    }

    #[test]
    fn test_close_wakes_waiter() {
        let (capture, tap) = open();
        let capture = Arc::new(capture);

        let id = match capture.recv().unwrap() {
            Submission::Pending(id) => id,
            Submission::Ready(_) => panic!("queue should be empty"),
        };

        let waiter = {
            let capture = Arc::clone(&capture);
            thread::spawn(move || capture.wait_recv(id, Duration::from_secs(30)))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(tap.is_open());
        capture.close();
        capture.close();

        assert!(matches!(waiter.join().unwrap(), Err(CaptureError::Closed)));
        assert!(!tap.is_open());
        assert!(matches!(capture.recv(), Err(CaptureError::Closed)));
        assert_eq!(capture.pending_requests(), 0);
    }
}
