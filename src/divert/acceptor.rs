//! Local relay: accepts redirected connections and tunnels them to the
//! forward target of the matching record.

use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::config::{ProxyRecord, RecordTable};
use crate::error::ProxyError;

use super::stats::ProxyStats;
use super::tunnel::TunnelPair;

/// Backlog of the relay's listening socket.
pub const LISTEN_BACKLOG: i32 = 16;

/// Create the relay's listening socket: SO_REUSEADDR, bind, listen.
pub fn bind_listener(addr: SocketAddrV4) -> Result<TcpListener, ProxyError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ProxyError::socket("create", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ProxyError::socket("set SO_REUSEADDR on", e))?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|e| ProxyError::socket("bind", e))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| ProxyError::socket("listen on", e))?;
    Ok(socket.into())
}

/// Wake a thread blocked in `accept` on `listener`.
///
/// Shutting the socket down is enough on Windows. Elsewhere a blocked
/// `accept` may not notice, so a throwaway connection is made as well; the
/// acceptor sees the cleared running flag and exits.
pub fn unblock_listener(listener: &TcpListener) {
    let local = listener.local_addr();
    let _ = SockRef::from(listener).shutdown(Shutdown::Both);

    if let Ok(SocketAddr::V4(addr)) = local {
        let target = if addr.ip().is_unspecified() {
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, addr.port())
        } else {
            addr
        };
        let _ = TcpStream::connect_timeout(&target.into(), Duration::from_millis(200));
    }
}

/// Everything a connection thread needs, moved into its closure.
#[derive(Clone)]
struct ConnectionContext {
    label: Arc<str>,
    records: Arc<RecordTable>,
    stats: Arc<ProxyStats>,
    connect_timeout: Option<Duration>,
}

pub struct ConnectionAcceptor {
    ctx: ConnectionContext,
    listener: Arc<TcpListener>,
    running: Arc<AtomicBool>,
}

impl ConnectionAcceptor {
    pub fn new(
        label: &str,
        listener: Arc<TcpListener>,
        records: Arc<RecordTable>,
        running: Arc<AtomicBool>,
        stats: Arc<ProxyStats>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            ctx: ConnectionContext {
                label: Arc::from(label),
                records,
                stats,
                connect_timeout,
            },
            listener,
            running,
        }
    }

    /// Accept until the running flag is cleared and the listener is shut
    /// down. Each connection is handled on its own detached thread.
    pub fn run(self) {
        log::debug!("{}: acceptor started", self.ctx.label);

        loop {
            let accepted = self.listener.accept();
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let (client, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("{}: failed to accept socket: {}", self.ctx.label, e);
                    continue;
                }
            };

            log::info!("{}: incoming connection from {}", self.ctx.label, peer);
            ProxyStats::incr(&self.ctx.stats.connections_accepted);

            let ctx = self.ctx.clone();
            let spawned = thread::Builder::new()
                .name(format!("conn-{}", peer))
                .spawn(move || ctx.handle(client, peer));
            if let Err(e) = spawned {
                log::error!("{}: failed to spawn connection thread: {}", self.ctx.label, e);
            }
        }

        log::info!("{}: acceptor exiting", self.ctx.label);
    }
}

impl ConnectionContext {
    fn handle(self, client: TcpStream, peer: SocketAddr) {
        let record = match self.lookup(peer) {
            Some(record) => record,
            None => {
                ProxyStats::incr(&self.stats.connections_unmatched);
                log::warn!(
                    "{}: no proxy record for {}, closing connection",
                    self.label,
                    peer
                );
                return;
            }
        };

        let target = record.forward_socket_addr();
        log::info!("{}: connecting to forward host {}", self.label, target);
        let server = match self.connect(target) {
            Ok(server) => server,
            Err(e) => {
                ProxyStats::incr(&self.stats.connect_failures);
                log::error!("{}: failed to connect to {}: {}", self.label, target, e);
                return;
            }
        };

        log::info!("{}: starting to route {} -> {}", self.label, peer, target);
        let name = format!("{} {}->{}", self.label, peer, target);
        let report = TunnelPair::new(client, server).run(&name);

        ProxyStats::add(&self.stats.bytes_upstream, report.upstream.bytes);
        ProxyStats::add(&self.stats.bytes_downstream, report.downstream.bytes);
        log::info!(
            "{}: connection {} closed ({} bytes up, {} bytes down)",
            self.label,
            peer,
            report.upstream.bytes,
            report.downstream.bytes
        );
    }

    fn lookup(&self, peer: SocketAddr) -> Option<ProxyRecord> {
        match peer {
            SocketAddr::V4(v4) => self.records.find_by_source(*v4.ip()).copied(),
            SocketAddr::V6(v6) => v6
                .ip()
                .to_ipv4_mapped()
                .and_then(|ip| self.records.find_by_source(ip).copied()),
        }
    }

    fn connect(&self, target: SocketAddrV4) -> io::Result<TcpStream> {
        match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&target.into(), timeout),
            None => TcpStream::connect(target),
        }
    }
}
