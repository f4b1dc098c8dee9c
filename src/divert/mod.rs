//! Transparent redirect proxy.
//!
//! A [`DivertProxy`] pairs two long-running workers:
//!
//! - rewrite.rs: diverts client packets for the redirect port to the local
//!   relay port, and rewrites the relay's replies back
//! - acceptor.rs: the local relay; tunnels each accepted connection to the
//!   forward target of the record matching the client's address
//!
//! Both share the read-only record table and the running flag. Per-connection
//! tunnel threads are detached and outlive `stop`.
//!
//! ## Usage
//!
//! ```no_run
//! use stream_divert::config::{ProxyRecord, ProxySettings};
//! use stream_divert::divert::DivertProxy;
//!
//! let record: ProxyRecord = "10.0.0.5=192.168.1.10:80".parse()?;
//! let proxy = DivertProxy::new(ProxySettings::new(80, 8080, vec![record]))?;
//! proxy.start()?;
//! // ...
//! proxy.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acceptor;
pub mod filter;
pub mod rewrite;
pub mod stats;
pub mod tunnel;

pub use acceptor::ConnectionAcceptor;
pub use filter::DivertFilter;
pub use rewrite::{PacketRewriteEngine, Rewrite, RewriteRules};
pub use stats::{ProxyStats, StatsSnapshot};
pub use tunnel::{ByteTunnel, TunnelPair};

use std::fmt;
use std::net::{SocketAddrV4, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::capture::{CaptureProvider, PacketCapture, PlatformProvider};
use crate::config::{ProxySettings, RecordTable};
use crate::error::ProxyError;

/// Bound on each worker join during stop.
const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyState::Stopped => "stopped",
            ProxyState::Starting => "starting",
            ProxyState::Running => "running",
            ProxyState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Wait up to `timeout` for a worker to finish. A worker that overruns is
/// left detached; returns whether it was joined.
fn join_worker(label: &str, worker: &str, handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::error!(
                "{}: {} worker still running after {:?}, detaching it",
                label,
                worker,
                timeout
            );
            return false;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }

    match handle.join() {
        Ok(()) => log::debug!("{}: {} worker joined", label, worker),
        Err(_) => log::error!("{}: {} worker panicked", label, worker),
    }
    true
}

/// OS resources and workers of a started proxy.
struct Inner<C> {
    state: ProxyState,
    capture: Option<Arc<C>>,
    listener: Option<Arc<TcpListener>>,
    rewrite_handle: Option<JoinHandle<()>>,
    acceptor_handle: Option<JoinHandle<()>>,
}

/// One redirect-port/proxy-port pair with its record table.
pub struct DivertProxy<P: CaptureProvider = PlatformProvider> {
    settings: ProxySettings,
    records: Arc<RecordTable>,
    provider: P,
    label: String,
    running: Arc<AtomicBool>,
    stats: Arc<ProxyStats>,
    inner: Mutex<Inner<P::Capture>>,
}

impl DivertProxy<PlatformProvider> {
    /// Proxy backed by the platform's packet diversion driver.
    pub fn new(settings: ProxySettings) -> Result<Self, ProxyError> {
        Self::with_provider(settings, PlatformProvider::default())
    }
}

impl<P: CaptureProvider> DivertProxy<P> {
    pub fn with_provider(settings: ProxySettings, provider: P) -> Result<Self, ProxyError> {
        settings.validate()?;
        let records = Arc::new(RecordTable::new(settings.records.clone()));
        let label = settings.to_string();

        Ok(Self {
            settings,
            records,
            provider,
            label,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ProxyStats::default()),
            inner: Mutex::new(Inner {
                state: ProxyState::Stopped,
                capture: None,
                listener: None,
                rewrite_handle: None,
                acceptor_handle: None,
            }),
        })
    }

    /// Open the capture handle and the listening socket, then launch both
    /// workers. On failure every acquired resource is released and the proxy
    /// can be started again. Starting a running proxy is a no-op.
    pub fn start(&self) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock();
        match inner.state {
            ProxyState::Running => return Ok(()),
            ProxyState::Starting | ProxyState::Stopping => {
                return Err(ProxyError::InvalidParam(format!(
                    "{} is {}",
                    self.label, inner.state
                )))
            }
            ProxyState::Stopped => {}
        }
        inner.state = ProxyState::Starting;

        log::info!("{}: starting", self.label);
        for record in self.records.iter() {
            log::info!(
                "{}: {} -> {}-{} -> {}:{}",
                self.label,
                record.source_address,
                self.settings.redirect_port,
                self.settings.proxy_port,
                record.forward_address,
                record.forward_port
            );
        }
        let filter = self.filter();
        log::info!("{}: filter: {}", self.label, filter);

        let capture = match self.provider.open(&filter, self.settings.priority) {
            Ok(capture) => Arc::new(capture),
            Err(e) => {
                log::error!("{}: failed to open capture handle: {}", self.label, e);
                inner.state = ProxyState::Stopped;
                return Err(e.into());
            }
        };

        let listen_addr = SocketAddrV4::new(self.settings.listen_address, self.settings.proxy_port);
        let listener = match acceptor::bind_listener(listen_addr) {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                log::error!("{}: failed to set up relay on {}: {}", self.label, listen_addr, e);
                capture.close();
                inner.state = ProxyState::Stopped;
                return Err(e);
            }
        };

        self.stats.reset();
        self.running.store(true, Ordering::SeqCst);

        let engine = PacketRewriteEngine::new(
            self.label.clone(),
            Arc::clone(&capture),
            RewriteRules::new(
                self.settings.redirect_port,
                self.settings.proxy_port,
                Arc::clone(&self.records),
            ),
            Arc::clone(&self.stats),
        );
        let rewrite_handle = match thread::Builder::new()
            .name("divert-rewrite".into())
            .spawn(move || engine.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                log::error!("{}: failed to spawn rewrite worker: {}", self.label, source);
                self.running.store(false, Ordering::SeqCst);
                capture.close();
                acceptor::unblock_listener(&listener);
                inner.state = ProxyState::Stopped;
                return Err(ProxyError::Worker { name: "rewrite", source });
            }
        };

        let acceptor = ConnectionAcceptor::new(
            &self.label,
            Arc::clone(&listener),
            Arc::clone(&self.records),
            Arc::clone(&self.running),
            Arc::clone(&self.stats),
            self.settings.connect_timeout(),
        );
        let acceptor_handle = match thread::Builder::new()
            .name("divert-acceptor".into())
            .spawn(move || acceptor.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                log::error!("{}: failed to spawn acceptor worker: {}", self.label, source);
                self.running.store(false, Ordering::SeqCst);
                capture.close();
                acceptor::unblock_listener(&listener);
                join_worker(&self.label, "rewrite", rewrite_handle, THREAD_JOIN_TIMEOUT);
                inner.state = ProxyState::Stopped;
                return Err(ProxyError::Worker { name: "acceptor", source });
            }
        };

        inner.capture = Some(capture);
        inner.listener = Some(listener);
        inner.rewrite_handle = Some(rewrite_handle);
        inner.acceptor_handle = Some(acceptor_handle);
        inner.state = ProxyState::Running;

        log::info!("{}: started", self.label);
        Ok(())
    }

    /// Stop both workers. Safe to call in any state; returns `true` if a
    /// running proxy was torn down.
    pub fn stop(&self) -> bool {
        let (rewrite_handle, acceptor_handle) = {
            let mut inner = self.inner.lock();
            if inner.state != ProxyState::Running {
                return false;
            }
            inner.state = ProxyState::Stopping;
            log::info!("{}: stopping...", self.label);

            self.running.store(false, Ordering::SeqCst);
            if let Some(capture) = inner.capture.take() {
                capture.close();
            }
            if let Some(listener) = inner.listener.take() {
                acceptor::unblock_listener(&listener);
            }
            (inner.rewrite_handle.take(), inner.acceptor_handle.take())
        };

        if let Some(handle) = rewrite_handle {
            join_worker(&self.label, "rewrite", handle, THREAD_JOIN_TIMEOUT);
        }
        if let Some(handle) = acceptor_handle {
            join_worker(&self.label, "acceptor", handle, THREAD_JOIN_TIMEOUT);
        }

        self.inner.lock().state = ProxyState::Stopped;

        let stats = self.stats.snapshot();
        log::info!(
            "{}: stopped - {} packets diverted, {} rewritten, {} connections ({} unmatched, {} connect failures)",
            self.label,
            stats.packets_diverted,
            stats.packets_rewritten,
            stats.connections_accepted,
            stats.connections_unmatched,
            stats.connect_failures
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProxyState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// The capture filter this proxy opens its handle with.
    pub fn filter(&self) -> DivertFilter {
        DivertFilter::new(
            self.settings.redirect_port,
            self.settings.proxy_port,
            Arc::clone(&self.records),
        )
    }
}

impl<P: CaptureProvider> fmt::Display for DivertProxy<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl<P: CaptureProvider> Drop for DivertProxy<P> {
    fn drop(&mut self) {
        self.stop();
    }
}
