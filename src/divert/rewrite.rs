//! Port rewriting for diverted packets.
//!
//! Client packets addressed to the redirect port have their destination port
//! moved to the local relay; the relay's replies have their source port moved
//! back, so the client only ever sees the redirect port.

use std::sync::Arc;
use std::time::Duration;

use crate::capture::{CaptureError, CapturedPacket, Direction, PacketCapture, Submission};
use crate::config::RecordTable;
use crate::packet::{self, PacketHeaders};

use super::stats::ProxyStats;

/// How long one wait on a pending receive lasts before completed sends are
/// reclaimed and the wait resumes.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Header change for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewrite {
    /// Relay reply: source port becomes the redirect port.
    SourcePort(u16),
    /// Client request: destination port becomes the proxy port.
    DestinationPort(u16),
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct RewriteRules {
    redirect_port: u16,
    proxy_port: u16,
    records: Arc<RecordTable>,
}

impl RewriteRules {
    pub fn new(redirect_port: u16, proxy_port: u16, records: Arc<RecordTable>) -> Self {
        Self {
            redirect_port,
            proxy_port,
            records,
        }
    }

    /// Decide the rewrite for a packet travelling in `direction`.
    pub fn classify(&self, direction: Direction, headers: &PacketHeaders) -> Rewrite {
        match direction {
            Direction::Outbound
                if headers.src_port == self.proxy_port
                    && self.records.contains_source(headers.dst_addr) =>
            {
                Rewrite::SourcePort(self.redirect_port)
            }
            Direction::Inbound
                if headers.dst_port == self.redirect_port
                    && self.records.contains_source(headers.src_addr) =>
            {
                Rewrite::DestinationPort(self.proxy_port)
            }
            _ => Rewrite::Unchanged,
        }
    }

    /// Apply the rewrite to `data`. Returns what was done, or `None` if the
    /// buffer is not an IPv4/TCP packet.
    pub fn apply(&self, direction: Direction, data: &mut [u8]) -> Option<(PacketHeaders, Rewrite)> {
        let headers = packet::parse_ipv4_tcp(data)?;
        let rewrite = self.classify(direction, &headers);
        match rewrite {
            Rewrite::SourcePort(port) => packet::set_tcp_src_port(data, &headers, port),
            Rewrite::DestinationPort(port) => packet::set_tcp_dst_port(data, &headers, port),
            Rewrite::Unchanged => {}
        }
        Some((headers, rewrite))
    }
}

/// Receive, rewrite and re-inject packets until the capture is closed.
pub struct PacketRewriteEngine<C: PacketCapture> {
    label: String,
    capture: Arc<C>,
    rules: RewriteRules,
    stats: Arc<ProxyStats>,
    poll_interval: Duration,
}

impl<C: PacketCapture> PacketRewriteEngine<C> {
    pub fn new(
        label: String,
        capture: Arc<C>,
        rules: RewriteRules,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            label,
            capture,
            rules,
            stats,
            poll_interval: RECV_POLL_INTERVAL,
        }
    }

    /// Override how long each wait on a pending receive lasts.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs until the capture reports a fatal error, normally because
    /// [`PacketCapture::close`] was called.
    pub fn run(self) {
        log::debug!("{}: rewrite worker started", self.label);

        loop {
            let packet = match self.next_packet() {
                Ok(packet) => packet,
                Err(e) if e.is_fatal() => break,
                Err(e) => {
                    log::warn!("{}: failed to read packet: {}", self.label, e);
                    continue;
                }
            };
            self.capture.drain_completions();
            self.process(packet);
        }

        let reclaimed = self.capture.drain_completions();
        if reclaimed > 0 {
            log::debug!("{}: reclaimed {} completed sends on exit", self.label, reclaimed);
        }
        log::info!("{}: rewrite worker exiting", self.label);
    }

    fn next_packet(&self) -> Result<CapturedPacket, CaptureError> {
        let request = match self.capture.recv()? {
            Submission::Ready(packet) => return Ok(packet),
            Submission::Pending(request) => request,
        };

        loop {
            if let Some(packet) = self.capture.wait_recv(request, self.poll_interval)? {
                return Ok(packet);
            }
            self.capture.drain_completions();
        }
    }

    fn process(&self, mut packet: CapturedPacket) {
        ProxyStats::incr(&self.stats.packets_diverted);

        let direction = packet.meta.direction;
        let (headers, rewrite) = match self.rules.apply(direction, &mut packet.data) {
            Some(result) => result,
            None => {
                log::warn!(
                    "{}: failed to parse packet ({} bytes {})",
                    self.label,
                    packet.data.len(),
                    direction.as_str()
                );
                ProxyStats::incr(&self.stats.packets_dropped);
                return;
            }
        };

        log::debug!(
            "{}: packet {}:{} {}:{} {}",
            self.label,
            headers.src_addr,
            headers.src_port,
            headers.dst_addr,
            headers.dst_port,
            direction.as_str()
        );
        match rewrite {
            Rewrite::SourcePort(port) => {
                log::debug!("{}: modify packet src -> {}:{}", self.label, headers.dst_addr, port);
                ProxyStats::incr(&self.stats.packets_rewritten);
            }
            Rewrite::DestinationPort(port) => {
                log::debug!("{}: modify packet dst -> {}:{}", self.label, headers.dst_addr, port);
                ProxyStats::incr(&self.stats.packets_rewritten);
            }
            Rewrite::Unchanged => {}
        }

        self.capture.recalculate_checksums(&mut packet);

        if let Err(e) = self.capture.send(&packet) {
            ProxyStats::incr(&self.stats.reinject_failures);
            log::warn!("{}: failed to send packet: {}", self.label, e);
        }
    }
}
