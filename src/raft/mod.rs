//! The Raft replication protocol. For details, see Diego Ongaro's original
//! paper "In Search of an Understandable Consensus Algorithm":
//! <https://raft.github.io/raft.pdf>
//!
//! This implementation replicates a key/value command log across a fixed set
//! of replicas exchanging JSON datagrams. It is memory-only: the log and term
//! state do not survive a process crash. The [`Node`] state machine is driven
//! synchronously by the event loop in [`crate::server`], which passes the
//! current time into `step()` and `tick()` so that the node itself never
//! reads the clock.

mod log;
mod message;
mod node;
mod state;

pub use self::log::{Entry, Index, Log};
pub use message::{Envelope, Message, RequestID, BROADCAST};
pub use node::{Node, NodeID, Status, Term};
pub use state::{KvStore, State};

use std::ops::Range;
use std::time::Duration;

/// The election timeout range. A replica starts an election if it hasn't
/// heard from a leader within a timeout drawn uniformly from this range. The
/// timeout is redrawn on every timer reset (follower reversion, vote grant,
/// accepted append-entries), but not when an election starts, so a failed
/// candidate escalates to a new term promptly.
pub const ELECTION_TIMEOUT: Range<Duration> =
    Duration::from_millis(500)..Duration::from_millis(650);

/// How long a leader waits before sending an idle peer another (empty)
/// append-entries, to assert its leadership.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(450);

/// How long a leader waits before re-sending entries to a peer that hasn't
/// acknowledged the previous send.
pub const REPLICATE_INTERVAL: Duration = Duration::from_millis(100);

/// The per-peer send gap right after winning an election (and after each
/// acknowledgement), chosen small to propagate leadership quickly.
pub const TAKEOVER_INTERVAL: Duration = Duration::from_micros(2500);

/// The maximum number of log entries in a single append-entries message,
/// capping the datagram size.
pub const MAX_APPEND_ENTRIES: usize = 7;
