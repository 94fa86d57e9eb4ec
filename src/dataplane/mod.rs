//! Data plane components
//!
//! NAT state: external id pools, the mapping table with its per-mapping TCP
//! connection lists, and the reaper that expires idle state.

mod allocator;
mod clock;
mod conntrack;
mod napt;
mod reaper;

pub use allocator::Pool;
pub use clock::{Clock, ManualClock, SystemClock};
pub use conntrack::{Connection, ConnectionList, Direction, TcpFlags, TcpState};
pub use napt::{
    Mapping, MappingId, MappingKind, NaptConfig, NatTable, NatTimeouts, ReapSummary, TableStats,
};
pub use reaper::{Nat, Reaper};
