//! Byte relay between two connected sockets.
//!
//! One [`ByteTunnel`] copies a single direction. A [`TunnelPair`] runs both
//! directions of a relayed connection and returns once both have finished.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;

/// Chunk size for each read.
pub const TUNNEL_BUFFER_SIZE: usize = 8192;

/// How a tunnel direction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEnd {
    /// Source sent FIN; the FIN was propagated to the destination.
    Eof,
    /// A read or write failed; both sockets were shut down.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelReport {
    pub bytes: u64,
    pub end: TunnelEnd,
}

/// One direction of a relayed connection.
pub struct ByteTunnel<'a> {
    name: &'a str,
    from: &'a TcpStream,
    to: &'a TcpStream,
}

impl<'a> ByteTunnel<'a> {
    pub fn new(name: &'a str, from: &'a TcpStream, to: &'a TcpStream) -> Self {
        Self { name, from, to }
    }

    /// Copy until EOF or error.
    ///
    /// On EOF the source's read half and the destination's write half are
    /// shut down, so the peer sees a FIN while the opposite direction keeps
    /// flowing. On error both sockets are shut down in both directions,
    /// which also unblocks the opposite tunnel.
    pub fn run(&self) -> TunnelReport {
        let mut buf = [0u8; TUNNEL_BUFFER_SIZE];
        let mut bytes = 0u64;
        let mut from = self.from;
        let mut to = self.to;

        loop {
            let n = match from.read(&mut buf) {
                Ok(0) => {
                    log::debug!("{}: EOF after {} bytes", self.name, bytes);
                    let _ = self.from.shutdown(Shutdown::Read);
                    let _ = self.to.shutdown(Shutdown::Write);
                    return TunnelReport {
                        bytes,
                        end: TunnelEnd::Eof,
                    };
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return self.fail("recv", e, bytes),
            };

            if let Err(e) = to.write_all(&buf[..n]) {
                return self.fail("send", e, bytes);
            }
            bytes += n as u64;
        }
    }

    fn fail(&self, action: &str, err: io::Error, bytes: u64) -> TunnelReport {
        log::warn!("{}: {} failed after {} bytes: {}", self.name, action, bytes, err);
        let _ = self.from.shutdown(Shutdown::Both);
        let _ = self.to.shutdown(Shutdown::Both);
        TunnelReport {
            bytes,
            end: TunnelEnd::Failed,
        }
    }
}

/// Both directions of a relayed connection.
pub struct TunnelPair {
    client: TcpStream,
    server: TcpStream,
}

/// Byte counts for a finished [`TunnelPair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairReport {
    pub upstream: TunnelReport,
    pub downstream: TunnelReport,
}

impl TunnelPair {
    pub fn new(client: TcpStream, server: TcpStream) -> Self {
        Self { client, server }
    }

    /// Relay until both directions finish, then close both sockets.
    ///
    /// Client to server runs on a scoped thread; server to client runs on
    /// the calling thread.
    pub fn run(self, label: &str) -> PairReport {
        let up_name = format!("{} client->server", label);
        let down_name = format!("{} server->client", label);

        let (upstream, downstream) = thread::scope(|s| {
            let up = s.spawn(|| ByteTunnel::new(&up_name, &self.client, &self.server).run());
            let downstream = ByteTunnel::new(&down_name, &self.server, &self.client).run();
            let upstream = up.join().unwrap_or_else(|_| {
                log::error!("{}: tunnel thread panicked", up_name);
                TunnelReport {
                    bytes: 0,
                    end: TunnelEnd::Failed,
                }
            });
            (upstream, downstream)
        });

        // Sockets close when `self` drops here.
        PairReport {
            upstream,
            downstream,
        }
    }
}
