//! NAPT (Network Address Port Translation) mapping table
//!
//! Binds internal (IP, port / ICMP identifier) tuples to externally visible
//! ports and identifiers. All state (both pools, every mapping and every
//! connection list) sits behind one mutex; every public operation holds it
//! for its whole duration and hands back copies, never references into the
//! table.

use super::allocator::Pool;
use super::clock::Clock;
use super::conntrack::{Connection, ConnectionList, Direction, TcpFlags, TcpState};
use crate::telemetry::NatMetrics;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Protocol kind of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    Icmp,
    Tcp,
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingKind::Icmp => f.write_str("ICMP"),
            MappingKind::Tcp => f.write_str("TCP"),
        }
    }
}

/// Stable identity of a mapping, never reused within a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingId(u64);

/// Copy of a mapping's fields, detached from the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub id: MappingId,
    pub kind: MappingKind,
    pub internal_ip: Ipv4Addr,
    /// Internal port or ICMP identifier
    pub internal_aux: u16,
    /// Allocated external port or ICMP identifier
    pub external_aux: u16,
    pub last_activity: Instant,
    /// TCP peers, newest first (always empty for ICMP)
    pub connections: Vec<Connection>,
}

/// Idle timeouts applied by the reaper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatTimeouts {
    /// ICMP query mapping idle timeout (default: 60 seconds)
    pub icmp: Duration,
    /// Established TCP connection idle timeout (default: 2 hours 4 minutes)
    pub tcp_established: Duration,
    /// Transitory TCP connection idle timeout (default: 5 minutes)
    pub tcp_transitory: Duration,
    /// How long a TCP mapping may sit without connections (default: 500ms)
    pub tcp_empty_grace: Duration,
}

impl Default for NatTimeouts {
    fn default() -> Self {
        Self {
            icmp: Duration::from_secs(60),
            tcp_established: Duration::from_secs(7440),
            tcp_transitory: Duration::from_secs(300),
            tcp_empty_grace: Duration::from_millis(500),
        }
    }
}

/// Construction parameters for a [`NatTable`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaptConfig {
    pub timeouts: NatTimeouts,
    /// Inclusive external port range for TCP mappings
    pub port_range: (u16, u16),
    /// Inclusive external identifier range for ICMP mappings
    pub icmp_id_range: (u16, u16),
    /// Name of the interface facing the internal network
    pub internal_interface: String,
}

impl Default for NaptConfig {
    fn default() -> Self {
        Self {
            timeouts: NatTimeouts::default(),
            port_range: (1024, 65535),
            icmp_id_range: (1024, 65535),
            internal_interface: "eth1".to_string(),
        }
    }
}

/// What one reaper pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub icmp_expired: usize,
    pub tcp_expired: usize,
    pub connections_expired: usize,
}

impl ReapSummary {
    pub fn is_empty(&self) -> bool {
        self.icmp_expired == 0 && self.tcp_expired == 0 && self.connections_expired == 0
    }
}

/// Point-in-time table statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub icmp_mappings: usize,
    pub tcp_mappings: usize,
    pub connections: usize,
    pub ports_in_use: usize,
    pub icmp_ids_in_use: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InternalKey {
    kind: MappingKind,
    ip: Ipv4Addr,
    aux: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExternalKey {
    kind: MappingKind,
    aux: u16,
}

#[derive(Debug)]
struct MappingEntry {
    id: MappingId,
    kind: MappingKind,
    internal_ip: Ipv4Addr,
    internal_aux: u16,
    external_aux: u16,
    last_activity: Instant,
    connections: ConnectionList,
}

impl MappingEntry {
    fn internal_key(&self) -> InternalKey {
        InternalKey {
            kind: self.kind,
            ip: self.internal_ip,
            aux: self.internal_aux,
        }
    }

    fn external_key(&self) -> ExternalKey {
        ExternalKey {
            kind: self.kind,
            aux: self.external_aux,
        }
    }

    fn snapshot(&self) -> Mapping {
        Mapping {
            id: self.id,
            kind: self.kind,
            internal_ip: self.internal_ip,
            internal_aux: self.internal_aux,
            external_aux: self.external_aux,
            last_activity: self.last_activity,
            connections: self.connections.iter().cloned().collect(),
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Everything guarded by the table lock
#[derive(Debug)]
struct NatState {
    mappings: HashMap<MappingId, MappingEntry>,
    /// Mappings per internal tuple, oldest first
    by_internal: HashMap<InternalKey, Vec<MappingId>>,
    by_external: HashMap<ExternalKey, MappingId>,
    ports: Pool,
    icmp_ids: Pool,
    next_id: u64,
}

impl NatState {
    fn new(config: &NaptConfig) -> Self {
        Self {
            mappings: HashMap::new(),
            by_internal: HashMap::new(),
            by_external: HashMap::new(),
            ports: Pool::new(MappingKind::Tcp, config.port_range.0, config.port_range.1),
            icmp_ids: Pool::new(
                MappingKind::Icmp,
                config.icmp_id_range.0,
                config.icmp_id_range.1,
            ),
            next_id: 1,
        }
    }

    fn pool_mut(&mut self, kind: MappingKind) -> &mut Pool {
        match kind {
            MappingKind::Tcp => &mut self.ports,
            MappingKind::Icmp => &mut self.icmp_ids,
        }
    }

    fn insert(
        &mut self,
        kind: MappingKind,
        internal_ip: Ipv4Addr,
        internal_aux: u16,
        now: Instant,
    ) -> Result<&MappingEntry> {
        let external_aux = self.pool_mut(kind).allocate()?;

        let id = MappingId(self.next_id);
        self.next_id += 1;

        let entry = MappingEntry {
            id,
            kind,
            internal_ip,
            internal_aux,
            external_aux,
            last_activity: now,
            connections: ConnectionList::new(),
        };

        // The newest mapping for an internal tuple wins lookups
        self.by_internal
            .entry(entry.internal_key())
            .or_default()
            .push(id);
        let previous = self.by_external.insert(entry.external_key(), id);
        debug_assert!(previous.is_none(), "external id handed out twice");

        Ok(self.mappings.entry(id).or_insert(entry))
    }

    /// Unlink a mapping, release its slot and drop its connections.
    fn remove(&mut self, id: MappingId) -> Option<MappingEntry> {
        let entry = self.mappings.remove(&id)?;

        let external_key = entry.external_key();
        if self.by_external.get(&external_key) == Some(&id) {
            self.by_external.remove(&external_key);
        }

        let internal_key = entry.internal_key();
        if let Some(ids) = self.by_internal.get_mut(&internal_key) {
            // Usually a single element; an older duplicate becomes visible again
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_internal.remove(&internal_key);
            }
        }

        self.pool_mut(entry.kind).release(entry.external_aux);
        Some(entry)
    }

    fn by_internal(&self, key: &InternalKey) -> Option<&MappingEntry> {
        self.by_internal
            .get(key)
            .and_then(|ids| ids.last())
            .and_then(|id| self.mappings.get(id))
    }

    fn by_external(&self, key: &ExternalKey) -> Option<&MappingEntry> {
        self.by_external
            .get(key)
            .and_then(|id| self.mappings.get(id))
    }

    fn by_external_mut(&mut self, key: &ExternalKey) -> Option<&mut MappingEntry> {
        let id = self.by_external.get(key)?;
        self.mappings.get_mut(id)
    }
}

/// Shared NAPT state: mappings, their connections and both allocator pools.
///
/// Cheap to share behind an `Arc`; packet-processing paths and the reaper
/// call into the same instance.
pub struct NatTable {
    state: Mutex<NatState>,
    config: NaptConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<NatMetrics>,
}

impl NatTable {
    /// Create an empty table
    pub fn new(config: NaptConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_metrics(config, clock, Arc::new(NatMetrics::new()))
    }

    /// Create an empty table reporting into an existing metrics registry
    pub fn with_metrics(
        config: NaptConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<NatMetrics>,
    ) -> Self {
        Self {
            state: Mutex::new(NatState::new(&config)),
            config,
            clock,
            metrics,
        }
    }

    fn state(&self) -> MutexGuard<'_, NatState> {
        // A panic while mutating the table leaves it unusable; there is no
        // meaningful way to keep translating.
        self.state.lock().expect("NAT table lock poisoned")
    }

    pub fn config(&self) -> &NaptConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<NatMetrics> {
        &self.metrics
    }

    /// Current time according to the table's clock
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Check whether `name` is the interface facing the internal network
    pub fn is_internal_interface(&self, name: &str) -> bool {
        name == self.config.internal_interface
    }

    /// Find the mapping for an internal tuple
    pub fn lookup_internal(
        &self,
        kind: MappingKind,
        internal_ip: Ipv4Addr,
        internal_aux: u16,
    ) -> Option<Mapping> {
        let key = InternalKey {
            kind,
            ip: internal_ip,
            aux: internal_aux,
        };
        self.state().by_internal(&key).map(MappingEntry::snapshot)
    }

    /// Find the mapping owning an external port / identifier
    pub fn lookup_external(&self, kind: MappingKind, external_aux: u16) -> Option<Mapping> {
        let key = ExternalKey {
            kind,
            aux: external_aux,
        };
        self.state().by_external(&key).map(MappingEntry::snapshot)
    }

    /// Create a mapping for an internal tuple, allocating an external slot.
    ///
    /// Fails with [`Error::Exhausted`] when the pool for `kind` is empty.
    pub fn insert(
        &self,
        kind: MappingKind,
        internal_ip: Ipv4Addr,
        internal_aux: u16,
    ) -> Result<Mapping> {
        let now = self.clock.now();
        let mut state = self.state();

        let mapping = match state.insert(kind, internal_ip, internal_aux, now) {
            Ok(entry) => entry.snapshot(),
            Err(e) => {
                self.metrics.allocation_failures.inc();
                warn!(%kind, %internal_ip, internal_aux, "cannot create mapping: {}", e);
                return Err(e);
            }
        };

        self.metrics.mappings_created.inc();
        self.metrics.set_active_mappings(state.mappings.len());
        debug!(
            %kind,
            %internal_ip,
            internal_aux,
            external_aux = mapping.external_aux,
            "mapping created"
        );

        Ok(mapping)
    }

    /// Remove a mapping, releasing its external slot and all connections.
    ///
    /// Matches on the mapping's identity, so a stale snapshot never removes a
    /// newer mapping that reused the slot. Returns false if already gone.
    pub fn remove(&self, mapping: &Mapping) -> bool {
        let mut state = self.state();
        match state.remove(mapping.id) {
            Some(entry) => {
                self.metrics.mappings_removed.inc();
                self.metrics.set_active_mappings(state.mappings.len());
                debug!(
                    kind = %entry.kind,
                    external_aux = entry.external_aux,
                    connections = entry.connections.len(),
                    "mapping removed"
                );
                true
            }
            None => {
                debug!(
                    kind = %mapping.kind,
                    external_aux = mapping.external_aux,
                    "mapping already removed"
                );
                false
            }
        }
    }

    /// Refresh a mapping's activity stamp. Returns false if no such mapping.
    pub fn touch(&self, kind: MappingKind, external_aux: u16) -> bool {
        let now = self.clock.now();
        let key = ExternalKey {
            kind,
            aux: external_aux,
        };
        match self.state().by_external_mut(&key) {
            Some(entry) => {
                entry.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Find the newest connection to `peer_ip` under a TCP mapping
    pub fn find_connection(
        &self,
        mapping: &Mapping,
        peer_ip: Ipv4Addr,
    ) -> Result<Option<Connection>> {
        self.with_connections(mapping, |connections, _| {
            connections.find(peer_ip).cloned()
        })
    }

    /// Start tracking a new peer under a TCP mapping.
    ///
    /// Always prepends a fresh CLOSED entry, even if the peer is already
    /// tracked. Use [`NatTable::observe_segment`] for find-or-create.
    pub fn insert_connection(&self, mapping: &Mapping, peer_ip: Ipv4Addr) -> Result<Connection> {
        let now = self.clock.now();
        let connection = self.with_connections(mapping, |connections, last_activity| {
            *last_activity = now;
            connections.insert(peer_ip, now).clone()
        })?;

        self.metrics.connections_created.inc();
        debug!(external_aux = mapping.external_aux, %peer_ip, "connection created");
        Ok(connection)
    }

    /// Set the TCP state of an existing connection and refresh its activity.
    /// Returns `None` if the peer is not tracked.
    pub fn update_connection(
        &self,
        mapping: &Mapping,
        peer_ip: Ipv4Addr,
        tcp_state: TcpState,
    ) -> Result<Option<Connection>> {
        let now = self.clock.now();
        self.with_connections(mapping, |connections, last_activity| {
            let connection = connections.find_mut(peer_ip)?;
            connection.tcp_state = tcp_state;
            connection.last_activity = now;
            *last_activity = now;
            Some(connection.clone())
        })
    }

    /// Account for one TCP segment between the mapping's internal host and
    /// `peer_ip`: find or create the connection, advance its state and
    /// refresh activity on both the connection and the mapping.
    pub fn observe_segment(
        &self,
        mapping: &Mapping,
        peer_ip: Ipv4Addr,
        flags: TcpFlags,
        direction: Direction,
    ) -> Result<Connection> {
        let now = self.clock.now();
        let (connection, created) =
            self.with_connections(mapping, |connections, last_activity| {
                *last_activity = now;
                let (connection, created) = connections.find_or_insert(peer_ip, now);
                let previous = connection.tcp_state;
                connection.tcp_state = previous.advance(flags, direction);
                connection.last_activity = now;
                if previous != connection.tcp_state {
                    trace!(
                        %peer_ip,
                        from = %previous,
                        to = %connection.tcp_state,
                        "tcp state change"
                    );
                }
                (connection.clone(), created)
            })?;

        if created {
            self.metrics.connections_created.inc();
            debug!(external_aux = mapping.external_aux, %peer_ip, "connection created");
        }
        Ok(connection)
    }

    /// Stop tracking the newest connection to `peer_ip`. Returns false if
    /// the peer was not tracked.
    pub fn remove_connection(&self, mapping: &Mapping, peer_ip: Ipv4Addr) -> Result<bool> {
        self.with_connections(mapping, |connections, _| {
            connections.remove(peer_ip).is_some()
        })
    }

    /// Run `f` against the live connection list of a TCP mapping
    fn with_connections<T>(
        &self,
        mapping: &Mapping,
        f: impl FnOnce(&mut ConnectionList, &mut Instant) -> T,
    ) -> Result<T> {
        if mapping.kind != MappingKind::Tcp {
            return Err(Error::UnsupportedKind(mapping.kind));
        }

        let mut state = self.state();
        let entry = state
            .mappings
            .get_mut(&mapping.id)
            .ok_or(Error::MappingNotFound {
                kind: mapping.kind,
                external_aux: mapping.external_aux,
            })?;

        Ok(f(&mut entry.connections, &mut entry.last_activity))
    }

    /// One expiry pass over the whole table.
    ///
    /// ICMP mappings idle past the ICMP timeout are removed. TCP mappings
    /// have their connections swept, then are removed once they hold no
    /// connections and have been idle past the empty-mapping grace period.
    pub fn reap(&self) -> ReapSummary {
        let now = self.clock.now();
        let timeouts = &self.config.timeouts;
        let mut summary = ReapSummary::default();

        let mut state = self.state();

        // Snapshot the ids up front; entries may disappear as we go
        let ids: Vec<MappingId> = state.mappings.keys().copied().collect();

        for id in ids {
            let Some(entry) = state.mappings.get_mut(&id) else {
                continue;
            };

            let expired = match entry.kind {
                MappingKind::Icmp => entry.idle_for(now) > timeouts.icmp,
                MappingKind::Tcp => {
                    let swept = entry.connections.sweep(
                        now,
                        timeouts.tcp_established,
                        timeouts.tcp_transitory,
                    );
                    if swept > 0 {
                        debug!(
                            external_aux = entry.external_aux,
                            count = swept,
                            "connections expired"
                        );
                    }
                    summary.connections_expired += swept;
                    entry.connections.is_empty() && entry.idle_for(now) > timeouts.tcp_empty_grace
                }
            };

            if !expired {
                continue;
            }

            if let Some(entry) = state.remove(id) {
                debug!(
                    kind = %entry.kind,
                    internal_ip = %entry.internal_ip,
                    internal_aux = entry.internal_aux,
                    external_aux = entry.external_aux,
                    "mapping expired"
                );
                match entry.kind {
                    MappingKind::Icmp => summary.icmp_expired += 1,
                    MappingKind::Tcp => summary.tcp_expired += 1,
                }
            }
        }

        let active = state.mappings.len();
        drop(state);

        self.metrics.reap_passes.inc();
        self.metrics
            .icmp_mappings_expired
            .add(summary.icmp_expired as u64);
        self.metrics
            .tcp_mappings_expired
            .add(summary.tcp_expired as u64);
        self.metrics
            .connections_expired
            .add(summary.connections_expired as u64);
        self.metrics.set_active_mappings(active);

        trace!(
            icmp_expired = summary.icmp_expired,
            tcp_expired = summary.tcp_expired,
            connections_expired = summary.connections_expired,
            active,
            "reap pass"
        );

        summary
    }

    /// Remove every mapping, releasing all slots. Returns how many were
    /// removed.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let ids: Vec<MappingId> = state.mappings.keys().copied().collect();
        let removed = ids
            .into_iter()
            .filter(|id| state.remove(*id).is_some())
            .count();

        self.metrics.mappings_removed.add(removed as u64);
        self.metrics.set_active_mappings(0);
        removed
    }

    /// Number of live mappings
    pub fn len(&self) -> usize {
        self.state().mappings.len()
    }

    /// Check if table is empty
    pub fn is_empty(&self) -> bool {
        self.state().mappings.is_empty()
    }

    /// Snapshot of every live mapping
    pub fn mappings(&self) -> Vec<Mapping> {
        self.state()
            .mappings
            .values()
            .map(MappingEntry::snapshot)
            .collect()
    }

    pub fn stats(&self) -> TableStats {
        let state = self.state();
        let mut stats = TableStats {
            ports_in_use: state.ports.in_use(),
            icmp_ids_in_use: state.icmp_ids.in_use(),
            ..TableStats::default()
        };
        for entry in state.mappings.values() {
            match entry.kind {
                MappingKind::Icmp => stats.icmp_mappings += 1,
                MappingKind::Tcp => stats.tcp_mappings += 1,
            }
            stats.connections += entry.connections.len();
        }
        stats
    }
}

impl fmt::Debug for NatTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatTable")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::clock::ManualClock;
    use std::collections::HashSet;

    const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const PEER: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
    const OTHER_PEER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    fn make_table() -> (NatTable, Arc<ManualClock>) {
        make_table_with(NaptConfig::default())
    }

    fn make_table_with(config: NaptConfig) -> (NatTable, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (NatTable::new(config, clock.clone()), clock)
    }

    fn small_pools(size: u16) -> NaptConfig {
        NaptConfig {
            port_range: (5000, 5000 + size - 1),
            icmp_id_range: (100, 100 + size - 1),
            ..NaptConfig::default()
        }
    }

    #[test]
    fn test_napt_table_new() {
        let (table, _) = make_table();
        assert!(table.is_empty());
        assert_eq!(table.stats(), TableStats::default());
    }

    #[test]
    fn test_insert_and_lookup_roundtrip() {
        let (table, _) = make_table();

        let mapping = table.insert(MappingKind::Tcp, HOST, 12345).unwrap();
        assert_eq!(mapping.internal_ip, HOST);
        assert_eq!(mapping.internal_aux, 12345);
        assert!(mapping.connections.is_empty());

        let by_internal = table.lookup_internal(MappingKind::Tcp, HOST, 12345);
        let by_external = table.lookup_external(MappingKind::Tcp, mapping.external_aux);
        assert_eq!(by_internal.as_ref(), Some(&mapping));
        assert_eq!(by_external.as_ref(), Some(&mapping));
    }

    #[test]
    fn test_lookup_is_kind_scoped() {
        let (table, _) = make_table();

        let mapping = table.insert(MappingKind::Icmp, HOST, 0x1234).unwrap();
        assert!(table.lookup_internal(MappingKind::Tcp, HOST, 0x1234).is_none());
        assert!(table
            .lookup_external(MappingKind::Tcp, mapping.external_aux)
            .is_none());
    }

    #[test]
    fn test_lookup_miss() {
        let (table, _) = make_table();
        assert!(table.lookup_internal(MappingKind::Tcp, HOST, 1).is_none());
        assert!(table.lookup_external(MappingKind::Icmp, 1024).is_none());
    }

    #[test]
    fn test_external_ids_unique_per_kind() {
        let (table, _) = make_table();
        let mut seen = HashSet::new();

        for port in 0..200u16 {
            let mapping = table.insert(MappingKind::Tcp, HOST, port).unwrap();
            assert!(seen.insert(mapping.external_aux));
        }

        // The two kinds draw from independent pools
        let icmp = table.insert(MappingKind::Icmp, HOST, 1).unwrap();
        assert_eq!(icmp.external_aux, 1024);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let (table, _) = make_table_with(small_pools(4));

        let mappings: Vec<_> = (0..4u16)
            .map(|i| table.insert(MappingKind::Tcp, HOST, 40000 + i).unwrap())
            .collect();

        match table.insert(MappingKind::Tcp, HOST, 50000) {
            Err(Error::Exhausted { kind }) => assert_eq!(kind, MappingKind::Tcp),
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(table.metrics().allocation_failures.get(), 1);

        // ICMP pool is unaffected
        assert!(table.insert(MappingKind::Icmp, HOST, 1).is_ok());

        assert!(table.remove(&mappings[2]));
        let reused = table.insert(MappingKind::Tcp, HOST, 50000).unwrap();
        assert_eq!(reused.external_aux, mappings[2].external_aux);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (table, _) = make_table();
        let mapping = table.insert(MappingKind::Icmp, HOST, 7).unwrap();

        assert!(table.remove(&mapping));
        assert!(!table.remove(&mapping));
        assert!(table.is_empty());
        assert_eq!(table.stats().icmp_ids_in_use, 0);
    }

    #[test]
    fn test_stale_snapshot_does_not_remove_successor() {
        let (table, _) = make_table_with(small_pools(1));

        let old = table.insert(MappingKind::Tcp, HOST, 1).unwrap();
        assert!(table.remove(&old));

        let new = table.insert(MappingKind::Tcp, HOST, 2).unwrap();
        assert_eq!(new.external_aux, old.external_aux);

        assert!(!table.remove(&old));
        assert_eq!(
            table.lookup_external(MappingKind::Tcp, new.external_aux),
            Some(new)
        );
    }

    #[test]
    fn test_duplicate_internal_insert_newest_wins() {
        let (table, _) = make_table();

        let first = table.insert(MappingKind::Tcp, HOST, 80).unwrap();
        let second = table.insert(MappingKind::Tcp, HOST, 80).unwrap();
        assert_ne!(first.external_aux, second.external_aux);

        assert_eq!(
            table.lookup_internal(MappingKind::Tcp, HOST, 80).unwrap().id,
            second.id
        );

        // Older binding becomes visible again once the newer one is gone
        table.remove(&second);
        assert_eq!(
            table.lookup_internal(MappingKind::Tcp, HOST, 80).unwrap().id,
            first.id
        );
    }

    #[test]
    fn test_removing_older_duplicate_keeps_newest_visible() {
        let (table, _) = make_table();

        let first = table.insert(MappingKind::Icmp, HOST, 7).unwrap();
        let second = table.insert(MappingKind::Icmp, HOST, 7).unwrap();
        let third = table.insert(MappingKind::Icmp, HOST, 7).unwrap();

        assert!(table.remove(&second));
        assert_eq!(
            table.lookup_internal(MappingKind::Icmp, HOST, 7).unwrap().id,
            third.id
        );

        assert!(table.remove(&third));
        assert_eq!(
            table.lookup_internal(MappingKind::Icmp, HOST, 7).unwrap().id,
            first.id
        );

        assert!(table.remove(&first));
        assert!(table.lookup_internal(MappingKind::Icmp, HOST, 7).is_none());
        assert!(table.state().by_internal.is_empty());
    }

    #[test]
    fn test_mass_expiry_empties_indexes() {
        let (table, clock) = make_table();
        let count: u16 = 20_000;

        for i in 0..count {
            let host = Ipv4Addr::from(u32::from(HOST) + u32::from(i % 200));
            table.insert(MappingKind::Icmp, host, i).unwrap();
        }
        assert_eq!(table.len(), count as usize);

        clock.advance(table.config().timeouts.icmp + Duration::from_secs(1));

        let started = std::time::Instant::now();
        let summary = table.reap();
        let elapsed = started.elapsed();

        assert_eq!(summary.icmp_expired, count as usize);
        // Linear in the table size; a rescan per removal would take minutes
        // in a debug build
        assert!(elapsed < Duration::from_secs(10), "reap took {:?}", elapsed);

        let state = table.state();
        assert!(state.mappings.is_empty());
        assert!(state.by_internal.is_empty());
        assert!(state.by_external.is_empty());
        assert_eq!(state.icmp_ids.in_use(), 0);
    }

    #[test]
    fn test_touch_refreshes_activity() {
        let (table, clock) = make_table();
        let mapping = table.insert(MappingKind::Icmp, HOST, 9).unwrap();

        clock.advance(Duration::from_secs(30));
        assert!(table.touch(MappingKind::Icmp, mapping.external_aux));

        let refreshed = table
            .lookup_external(MappingKind::Icmp, mapping.external_aux)
            .unwrap();
        assert_eq!(
            refreshed.last_activity.duration_since(mapping.last_activity),
            Duration::from_secs(30)
        );

        assert!(!table.touch(MappingKind::Tcp, mapping.external_aux));
    }

    #[test]
    fn test_is_internal_interface() {
        let (table, _) = make_table();
        assert!(table.is_internal_interface("eth1"));
        assert!(!table.is_internal_interface("eth2"));
        assert!(!table.is_internal_interface("eth10"));
    }

    #[test]
    fn test_connection_insert_and_find() {
        let (table, _) = make_table();
        let mapping = table.insert(MappingKind::Tcp, HOST, 5555).unwrap();

        assert!(table.find_connection(&mapping, PEER).unwrap().is_none());

        let conn = table.insert_connection(&mapping, PEER).unwrap();
        assert_eq!(conn.tcp_state, TcpState::Closed);
        assert_eq!(table.find_connection(&mapping, PEER).unwrap(), Some(conn));

        // Snapshots carry the connection list
        let snapshot = table.lookup_external(MappingKind::Tcp, mapping.external_aux);
        assert_eq!(snapshot.unwrap().connections.len(), 1);
    }

    #[test]
    fn test_connection_ops_reject_icmp() {
        let (table, _) = make_table();
        let mapping = table.insert(MappingKind::Icmp, HOST, 1).unwrap();

        match table.insert_connection(&mapping, PEER) {
            Err(Error::UnsupportedKind(MappingKind::Icmp)) => {}
            other => panic!("Expected UnsupportedKind, got {:?}", other),
        }
    }

    #[test]
    fn test_connection_ops_on_removed_mapping() {
        let (table, _) = make_table();
        let mapping = table.insert(MappingKind::Tcp, HOST, 1).unwrap();
        table.remove(&mapping);

        match table.find_connection(&mapping, PEER) {
            Err(Error::MappingNotFound { external_aux, .. }) => {
                assert_eq!(external_aux, mapping.external_aux)
            }
            other => panic!("Expected MappingNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_update_connection() {
        let (table, clock) = make_table();
        let mapping = table.insert(MappingKind::Tcp, HOST, 1).unwrap();
        table.insert_connection(&mapping, PEER).unwrap();

        clock.advance(Duration::from_secs(2));
        let conn = table
            .update_connection(&mapping, PEER, TcpState::Established)
            .unwrap()
            .unwrap();
        assert_eq!(conn.tcp_state, TcpState::Established);
        assert_eq!(conn.last_activity, clock.now());

        assert!(table
            .update_connection(&mapping, OTHER_PEER, TcpState::Established)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_observe_segment_tracks_handshake_without_duplicates() {
        let (table, _) = make_table();
        let mapping = table.insert(MappingKind::Tcp, HOST, 40001).unwrap();

        table
            .observe_segment(&mapping, PEER, TcpFlags::syn(), Direction::Outbound)
            .unwrap();
        table
            .observe_segment(&mapping, PEER, TcpFlags::syn_ack(), Direction::Inbound)
            .unwrap();
        let conn = table
            .observe_segment(&mapping, PEER, TcpFlags::ack(), Direction::Outbound)
            .unwrap();

        assert_eq!(conn.tcp_state, TcpState::Established);
        assert_eq!(table.stats().connections, 1);
        assert_eq!(table.metrics().connections_created.get(), 1);
    }

    #[test]
    fn test_remove_connection() {
        let (table, _) = make_table();
        let mapping = table.insert(MappingKind::Tcp, HOST, 1).unwrap();
        table.insert_connection(&mapping, PEER).unwrap();

        assert!(table.remove_connection(&mapping, PEER).unwrap());
        assert!(!table.remove_connection(&mapping, PEER).unwrap());
    }

    #[test]
    fn test_reap_icmp_expiry() {
        let (table, clock) = make_table();
        let icmp_timeout = table.config().timeouts.icmp;

        let stale = table.insert(MappingKind::Icmp, HOST, 1).unwrap();
        clock.advance(icmp_timeout + Duration::from_secs(1));
        let fresh = table.insert(MappingKind::Icmp, HOST, 2).unwrap();

        let summary = table.reap();
        assert_eq!(summary.icmp_expired, 1);
        assert!(table
            .lookup_external(MappingKind::Icmp, stale.external_aux)
            .is_none());
        assert!(table
            .lookup_external(MappingKind::Icmp, fresh.external_aux)
            .is_some());
        assert_eq!(table.stats().icmp_ids_in_use, 1);
    }

    #[test]
    fn test_reap_icmp_boundary_survives() {
        let (table, clock) = make_table();
        table.insert(MappingKind::Icmp, HOST, 1).unwrap();

        clock.advance(table.config().timeouts.icmp);
        assert!(table.reap().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reap_empty_tcp_mapping_after_grace() {
        let (table, clock) = make_table();
        let mapping = table.insert(MappingKind::Tcp, HOST, 1).unwrap();

        // Within grace: kept
        assert_eq!(table.reap().tcp_expired, 0);

        // Past grace but far below every TCP timeout: removed
        clock.advance(Duration::from_secs(1));
        assert_eq!(table.reap().tcp_expired, 1);
        assert!(table
            .lookup_external(MappingKind::Tcp, mapping.external_aux)
            .is_none());
        assert_eq!(table.stats().ports_in_use, 0);
    }

    #[test]
    fn test_reap_connection_sweep_independence() {
        let (table, clock) = make_table();
        let timeouts = table.config().timeouts.clone();
        let mapping = table.insert(MappingKind::Tcp, HOST, 1).unwrap();

        table.insert_connection(&mapping, PEER).unwrap();
        table
            .update_connection(&mapping, PEER, TcpState::Established)
            .unwrap();

        clock.advance(timeouts.tcp_established);
        table.insert_connection(&mapping, OTHER_PEER).unwrap();
        table
            .update_connection(&mapping, OTHER_PEER, TcpState::Established)
            .unwrap();

        clock.advance(Duration::from_secs(1));
        let summary = table.reap();
        assert_eq!(summary.connections_expired, 1);
        assert_eq!(summary.tcp_expired, 0);

        let survivor = table
            .lookup_external(MappingKind::Tcp, mapping.external_aux)
            .unwrap();
        assert_eq!(survivor.connections.len(), 1);
        assert_eq!(survivor.connections[0].peer_ip, OTHER_PEER);
    }

    #[test]
    fn test_reap_tcp_mapping_after_last_connection_expires() {
        let (table, clock) = make_table();
        let timeouts = table.config().timeouts.clone();
        let mapping = table.insert(MappingKind::Tcp, HOST, 1).unwrap();
        table
            .observe_segment(&mapping, PEER, TcpFlags::syn(), Direction::Outbound)
            .unwrap();

        clock.advance(timeouts.tcp_transitory + Duration::from_secs(1));
        let summary = table.reap();
        assert_eq!(summary.connections_expired, 1);
        assert_eq!(summary.tcp_expired, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_clear_releases_everything() {
        let (table, _) = make_table();
        for i in 0..10u16 {
            let m = table.insert(MappingKind::Tcp, HOST, i).unwrap();
            table.insert_connection(&m, PEER).unwrap();
            table.insert(MappingKind::Icmp, HOST, i).unwrap();
        }

        assert_eq!(table.clear(), 20);
        assert_eq!(table.stats(), TableStats::default());
        assert_eq!(table.metrics().active_mappings(), 0);
    }
}
