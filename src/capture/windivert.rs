//! WinDivert network-layer backend.
//!
//! Receives use an overlapped request signalled through an event; the event
//! handle carries the low-order bit so receive completions are *not* queued
//! to the completion port. Sends are fire-and-forget: every send (immediate
//! or pending) posts exactly one completion packet, and the send's buffers
//! stay in the pending table until a drain pass dequeues that packet.

use std::ffi::{c_void, CString};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use windivert_sys::address::WINDIVERT_ADDRESS;
use windivert_sys::{
    ChecksumFlags, WinDivertClose, WinDivertFlags, WinDivertHelperCalcChecksums, WinDivertLayer,
    WinDivertOpen, WinDivertRecvEx, WinDivertSendEx,
};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_INVALID_HANDLE, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED,
    HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT, WIN32_ERROR,
};
use windows::Win32::System::IO::{
    CreateIoCompletionPort, GetOverlappedResult, GetQueuedCompletionStatus, OVERLAPPED,
};
use windows::Win32::System::Threading::{CreateEventW, ResetEvent, WaitForSingleObject};

use super::{
    CaptureError, CaptureProvider, CapturedPacket, Direction, PacketCapture, PacketMeta,
    PendingTable, RequestId, Submission, MAX_PACKET_SIZE,
};
use crate::divert::filter::DivertFilter;

const ADDR_LEN: usize = mem::size_of::<WINDIVERT_ADDRESS>();

/// How long drop waits for cancelled sends to post their completions.
const DROP_DRAIN_WAIT_MS: u32 = 100;

fn last_error() -> WIN32_ERROR {
    unsafe { GetLastError() }
}

fn map_error(err: WIN32_ERROR) -> CaptureError {
    if err == ERROR_INVALID_HANDLE || err == ERROR_OPERATION_ABORTED {
        CaptureError::Closed
    } else {
        CaptureError::Io(std::io::Error::from_raw_os_error(err.0 as i32))
    }
}

fn address_bytes(addr: &WINDIVERT_ADDRESS) -> Vec<u8> {
    let mut bytes = vec![0u8; ADDR_LEN];
    unsafe {
        std::ptr::copy_nonoverlapping(
            addr as *const WINDIVERT_ADDRESS as *const u8,
            bytes.as_mut_ptr(),
            ADDR_LEN,
        );
    }
    bytes
}

fn address_from_meta(meta: &PacketMeta) -> Option<WINDIVERT_ADDRESS> {
    if meta.opaque.len() != ADDR_LEN {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(meta.opaque.as_ptr() as *const WINDIVERT_ADDRESS) })
}

#[repr(C)]
struct RecvSlot {
    overlapped: OVERLAPPED,
    addr: WINDIVERT_ADDRESS,
    addr_len: u32,
    recv_len: u32,
    buf: Vec<u8>,
}

impl RecvSlot {
    fn into_packet(self, len: usize) -> CapturedPacket {
        let direction = if self.addr.outbound() {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        let mut data = self.buf;
        data.truncate(len);
        CapturedPacket {
            data,
            meta: PacketMeta {
                direction,
                opaque: address_bytes(&self.addr),
            },
        }
    }
}

#[repr(C)]
struct SendSlot {
    // Must stay first: completion packets hand back this pointer.
    overlapped: OVERLAPPED,
    id: Option<RequestId>,
    addr: WINDIVERT_ADDRESS,
    data: Vec<u8>,
}

enum WinOp {
    Recv(Box<RecvSlot>),
    Send(Box<SendSlot>),
}

// The slots hold raw OS structures that are only touched by the thread that
// issued them or by the drain pass after the kernel is done with them.
unsafe impl Send for WinOp {}

/// Opens [`WinDivertCapture`] handles on the network layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct WinDivertProvider;

impl CaptureProvider for WinDivertProvider {
    type Capture = WinDivertCapture;

    fn open(&self, filter: &DivertFilter, priority: i16) -> Result<WinDivertCapture, CaptureError> {
        WinDivertCapture::open(&filter.expression(), priority)
    }
}

pub struct WinDivertCapture {
    handle: HANDLE,
    io_port: HANDLE,
    event: HANDLE,
    closed: AtomicBool,
    pending: PendingTable<WinOp>,
}

// Raw handles are plain kernel object references; access is serialized by
// the owning proxy (one rewrite worker) and `closed`.
unsafe impl Send for WinDivertCapture {}
unsafe impl Sync for WinDivertCapture {}

impl WinDivertCapture {
    pub fn open(filter: &str, priority: i16) -> Result<Self, CaptureError> {
        let filter = CString::new(filter)
            .map_err(|e| CaptureError::Open(format!("invalid filter string: {}", e)))?;

        let io_port = unsafe {
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, HANDLE::default(), 0, 0)
                .map_err(|e| CaptureError::Open(format!("failed to create I/O completion port: {}", e)))?
        };

        let event = match unsafe { CreateEventW(None, false, false, PCWSTR::null()) } {
            Ok(event) => event,
            Err(e) => {
                unsafe { CloseHandle(io_port) };
                return Err(CaptureError::Open(format!("failed to create event: {}", e)));
            }
        };

        let handle = unsafe {
            WinDivertOpen(
                filter.as_ptr(),
                WinDivertLayer::Network,
                priority,
                WinDivertFlags::new(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            let err = last_error();
            unsafe {
                CloseHandle(event);
                CloseHandle(io_port);
            }
            return Err(CaptureError::Open(format!(
                "failed to open the WinDivert device ({})",
                err.0
            )));
        }

        if let Err(e) = unsafe { CreateIoCompletionPort(handle, io_port, 0, 0) } {
            unsafe {
                WinDivertClose(handle);
                CloseHandle(event);
                CloseHandle(io_port);
            }
            return Err(CaptureError::Open(format!(
                "failed to associate I/O completion port: {}",
                e
            )));
        }

        log::debug!("WinDivert handle opened (priority {})", priority);
        Ok(Self {
            handle,
            io_port,
            event,
            closed: AtomicBool::new(false),
            pending: PendingTable::new(),
        })
    }

    /// Dequeue send completions until the port has nothing left within
    /// `wait_ms`, releasing each send's slot.
    fn drain_port(&self, wait_ms: u32) -> usize {
        let mut reclaimed = 0;
        loop {
            let mut bytes = 0u32;
            let mut key = 0usize;
            let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
            unsafe {
                GetQueuedCompletionStatus(
                    self.io_port,
                    &mut bytes,
                    &mut key,
                    &mut overlapped,
                    wait_ms,
                )
            };
            if overlapped.is_null() {
                break;
            }
            // Only sends post completion packets; the slot is alive until
            // taken out of the table below.
            let id = unsafe { (*(overlapped as *const SendSlot)).id };
            if let Some(id) = id {
                if self.pending.take(id).is_some() {
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }

    /// Event handle with the low-order bit set: completion is signalled on
    /// the event only, never queued to the completion port.
    fn recv_event(&self) -> HANDLE {
        HANDLE(self.event.0 | 1)
    }
}

impl PacketCapture for WinDivertCapture {
    fn recv(&self) -> Result<Submission<CapturedPacket>, CaptureError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::Closed);
        }

        let mut slot = Box::new(RecvSlot {
            overlapped: unsafe { mem::zeroed() },
            addr: unsafe { mem::zeroed() },
            addr_len: ADDR_LEN as u32,
            recv_len: 0,
            buf: vec![0u8; MAX_PACKET_SIZE],
        });
        slot.overlapped.hEvent = self.recv_event();
        unsafe { ResetEvent(self.event) };

        let ok = unsafe {
            WinDivertRecvEx(
                self.handle,
                slot.buf.as_mut_ptr() as *mut c_void,
                slot.buf.len() as u32,
                &mut slot.recv_len,
                0,
                &mut slot.addr,
                &mut slot.addr_len,
                &mut slot.overlapped,
            )
        };
        if ok.as_bool() {
            let len = slot.recv_len as usize;
            return Ok(Submission::Ready((*slot).into_packet(len)));
        }

        let err = last_error();
        if err == ERROR_IO_PENDING {
            Ok(Submission::Pending(self.pending.issue(WinOp::Recv(slot))))
        } else {
            Err(map_error(err))
        }
    }

    fn wait_recv(
        &self,
        request: RequestId,
        timeout: Duration,
    ) -> Result<Option<CapturedPacket>, CaptureError> {
        let wait = unsafe { WaitForSingleObject(self.event, timeout.as_millis() as u32) };
        if wait == WAIT_TIMEOUT {
            return Ok(None);
        }
        if wait != WAIT_OBJECT_0 {
            // The request may still be in flight; drop leaks it.
            return Err(CaptureError::Closed);
        }

        let slot = match self.pending.take(request) {
            Some(WinOp::Recv(slot)) => slot,
            Some(WinOp::Send(_)) | None => {
                return Err(CaptureError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no pending receive {}", request),
                )))
            }
        };

        let mut len = 0u32;
        let ok = unsafe { GetOverlappedResult(self.handle, &slot.overlapped, &mut len, false) };
        if !ok.as_bool() {
            return Err(map_error(last_error()));
        }
        Ok(Some((*slot).into_packet(len as usize)))
    }

    fn drain_completions(&self) -> usize {
        self.drain_port(0)
    }

    fn send(&self, packet: &CapturedPacket) -> Result<Submission<()>, CaptureError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::Closed);
        }
        let addr = address_from_meta(&packet.meta).ok_or_else(|| {
            CaptureError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "packet has no WinDivert address",
            ))
        })?;

        let slot = Box::new(SendSlot {
            overlapped: unsafe { mem::zeroed() },
            id: None,
            addr,
            data: packet.data.clone(),
        });
        let id = self.pending.issue(WinOp::Send(slot));

        let ok = self
            .pending
            .with(id, |op| match op {
                WinOp::Send(slot) => {
                    slot.id = Some(id);
                    unsafe {
                        WinDivertSendEx(
                            self.handle,
                            slot.data.as_ptr() as *const c_void,
                            slot.data.len() as u32,
                            std::ptr::null_mut(),
                            0,
                            &slot.addr,
                            ADDR_LEN as u32,
                            &mut slot.overlapped,
                        )
                        .as_bool()
                    }
                }
                WinOp::Recv(_) => false,
            })
            .unwrap_or(false);

        if ok {
            return Ok(Submission::Ready(()));
        }
        let err = last_error();
        if err == ERROR_IO_PENDING {
            Ok(Submission::Pending(id))
        } else {
            // Failed synchronously: no completion packet will follow.
            self.pending.take(id);
            Err(map_error(err))
        }
    }

    fn recalculate_checksums(&self, packet: &mut CapturedPacket) {
        let mut addr = address_from_meta(&packet.meta);
        let addr_ptr = addr
            .as_mut()
            .map(|a| a as *mut WINDIVERT_ADDRESS)
            .unwrap_or(std::ptr::null_mut());
        unsafe {
            WinDivertHelperCalcChecksums(
                packet.data.as_mut_ptr() as *mut c_void,
                packet.data.len() as u32,
                addr_ptr,
                ChecksumFlags::new(),
            );
        }
        if let Some(addr) = addr {
            packet.meta.opaque = address_bytes(&addr);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe { WinDivertClose(self.handle) };
        log::debug!("WinDivert handle closed");
    }
}

impl Drop for WinDivertCapture {
    fn drop(&mut self) {
        self.close();
        // Closing cancels in-flight sends; their completion packets may
        // still be on the way.
        self.drain_port(DROP_DRAIN_WAIT_MS);

        // Whatever is left may still be referenced by the driver. Leak it
        // rather than free memory the kernel could write into.
        let leftover = self.pending.take_all();
        if !leftover.is_empty() {
            log::debug!("Leaking {} unfinished WinDivert requests", leftover.len());
            mem::forget(leftover);
        }
        unsafe {
            CloseHandle(self.event);
            CloseHandle(self.io_port);
        }
    }
}
