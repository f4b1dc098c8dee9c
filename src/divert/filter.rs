//! Capture filter for a proxy instance.
//!
//! The filter selects exactly two kinds of TCP packets:
//! - replies leaving the local relay (`tcp.SrcPort == proxy_port`)
//! - client packets aimed at the redirect port from a configured source
//!   (`tcp.DstPort == redirect_port and ip.SrcAddr == source`)
//!
//! [`DivertFilter::matches`] evaluates the same predicate in-process.

use std::fmt;
use std::sync::Arc;

use crate::config::RecordTable;
use crate::packet::PacketHeaders;

#[derive(Debug, Clone)]
pub struct DivertFilter {
    redirect_port: u16,
    proxy_port: u16,
    records: Arc<RecordTable>,
}

impl DivertFilter {
    pub fn new(redirect_port: u16, proxy_port: u16, records: Arc<RecordTable>) -> Self {
        Self {
            redirect_port,
            proxy_port,
            records,
        }
    }

    /// The filter in WinDivert filter language.
    pub fn expression(&self) -> String {
        let mut disjuncts = Vec::with_capacity(self.records.len() + 1);
        disjuncts.push(format!("(tcp.SrcPort == {})", self.proxy_port));
        for record in self.records.iter() {
            disjuncts.push(format!(
                "(tcp.DstPort == {} and ip.SrcAddr == {})",
                self.redirect_port, record.source_address
            ));
        }
        format!("tcp and ({})", disjuncts.join(" or "))
    }

    /// Whether a parsed TCP packet would be selected by the filter.
    pub fn matches(&self, headers: &PacketHeaders) -> bool {
        headers.src_port == self.proxy_port
            || (headers.dst_port == self.redirect_port
                && self.records.contains_source(headers.src_addr))
    }
}

impl fmt::Display for DivertFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}
