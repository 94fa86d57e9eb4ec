//! Per-mapping TCP connection tracking
//!
//! Every TCP mapping owns a list of the peers it has talked to. Each peer
//! carries a coarse TCP state and an idle clock; the reaper sweeps the list
//! with separate timeouts for established and transitory connections.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// TCP connection state as seen from the translator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// No segment seen yet, or RST seen
    Closed,
    /// Internal host sent SYN
    SynSent,
    /// SYN answered (or peer opened)
    SynReceived,
    /// Three-way handshake completed
    Established,
    /// Internal host sent FIN
    FinWait,
    /// Peer sent FIN
    CloseWait,
    /// Both sides sent FIN, final ACK outstanding
    Closing,
    /// Internal host sent FIN after the peer's
    LastAck,
    /// Both FINs acknowledged
    TimeWait,
}

/// Which way a segment crossed the translator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Internal host to peer
    Outbound,
    /// Peer to internal host
    Inbound,
}

/// TCP header flags relevant to state tracking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub ack: bool,
}

impl TcpFlags {
    /// Parse flags from the 13th byte of a TCP header
    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: (byte & 0x01) != 0,
            syn: (byte & 0x02) != 0,
            rst: (byte & 0x04) != 0,
            ack: (byte & 0x10) != 0,
        }
    }

    pub fn syn() -> Self {
        Self {
            syn: true,
            ..Self::default()
        }
    }

    pub fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Self::default()
        }
    }

    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Self::default()
        }
    }

    pub fn fin_ack() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Self::default()
        }
    }

    pub fn rst() -> Self {
        Self {
            rst: true,
            ..Self::default()
        }
    }
}

impl TcpState {
    /// Next state after observing a segment with `flags` travelling in
    /// `direction`. Segments that do not drive a transition leave the state
    /// unchanged.
    pub fn advance(self, flags: TcpFlags, direction: Direction) -> TcpState {
        use Direction::{Inbound, Outbound};

        if flags.rst {
            return TcpState::Closed;
        }

        match (self, direction) {
            (TcpState::Closed, Outbound) if flags.syn && !flags.ack => TcpState::SynSent,
            (TcpState::Closed, Inbound) if flags.syn && !flags.ack => TcpState::SynReceived,

            (TcpState::SynSent, Inbound) if flags.syn => TcpState::SynReceived,

            (TcpState::SynReceived, _) if flags.ack && !flags.syn && !flags.fin => {
                TcpState::Established
            }

            (TcpState::Established, Outbound) if flags.fin => TcpState::FinWait,
            (TcpState::Established, Inbound) if flags.fin => TcpState::CloseWait,

            (TcpState::FinWait, Inbound) if flags.fin && flags.ack => TcpState::TimeWait,
            (TcpState::FinWait, Inbound) if flags.fin => TcpState::Closing,

            (TcpState::CloseWait, Outbound) if flags.fin => TcpState::LastAck,

            (TcpState::Closing, _) if flags.ack => TcpState::TimeWait,

            (TcpState::LastAck, Inbound) if flags.ack => TcpState::Closed,

            (state, _) => state,
        }
    }

    pub fn is_established(self) -> bool {
        self == TcpState::Established
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// One TCP peer observed under a mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub peer_ip: Ipv4Addr,
    pub tcp_state: TcpState,
    pub last_activity: Instant,
}

impl Connection {
    fn new(peer_ip: Ipv4Addr, now: Instant) -> Self {
        Self {
            peer_ip,
            tcp_state: TcpState::Closed,
            last_activity: now,
        }
    }

    /// Whether the connection has been idle longer than its state allows
    pub fn is_expired(&self, now: Instant, established: Duration, transitory: Duration) -> bool {
        let timeout = if self.tcp_state.is_established() {
            established
        } else {
            transitory
        };
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// Connection list owned by a single TCP mapping.
///
/// Newest entries come first; lookups return the most recently inserted
/// match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionList {
    entries: VecDeque<Connection>,
}

impl ConnectionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup a connection by peer
    pub fn find(&self, peer_ip: Ipv4Addr) -> Option<&Connection> {
        self.entries.iter().find(|c| c.peer_ip == peer_ip)
    }

    pub fn find_mut(&mut self, peer_ip: Ipv4Addr) -> Option<&mut Connection> {
        self.entries.iter_mut().find(|c| c.peer_ip == peer_ip)
    }

    /// Prepend a new CLOSED connection for `peer_ip`.
    ///
    /// Does not look for an existing entry for the same peer; callers that
    /// need one entry per peer use find-then-insert.
    pub fn insert(&mut self, peer_ip: Ipv4Addr, now: Instant) -> &mut Connection {
        self.entries.push_front(Connection::new(peer_ip, now));
        &mut self.entries[0]
    }

    /// Newest connection for `peer_ip`, creating one if the peer is not yet
    /// tracked. The flag reports whether an entry was created.
    pub fn find_or_insert(&mut self, peer_ip: Ipv4Addr, now: Instant) -> (&mut Connection, bool) {
        match self.entries.iter().position(|c| c.peer_ip == peer_ip) {
            Some(index) => (&mut self.entries[index], false),
            None => (self.insert(peer_ip, now), true),
        }
    }

    /// Remove the newest connection for `peer_ip`. No-op if absent.
    pub fn remove(&mut self, peer_ip: Ipv4Addr) -> Option<Connection> {
        let index = self.entries.iter().position(|c| c.peer_ip == peer_ip)?;
        self.entries.remove(index)
    }

    /// Drop every connection idle past its state-dependent timeout.
    /// Returns how many were removed.
    pub fn sweep(&mut self, now: Instant, established: Duration, transitory: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|c| !c.is_expired(now, established, transitory));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
