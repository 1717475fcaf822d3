mod candidate;
mod follower;
mod leader;

use super::log::{Index, Log};
use super::message::{Envelope, Message, BROADCAST};
use super::state::State;
use super::ELECTION_TIMEOUT;
use crate::error::Result;

use candidate::Candidate;
use follower::Follower;
use leader::Leader;

use ::log::{debug, info};
use rand::Rng as _;
use serde_derive::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// A replica ID: an opaque short string assigned at startup. The id `FFFF`
/// is reserved for broadcast.
pub type NodeID = String;

/// A leader term. Monotonically increasing.
pub type Term = u64;

/// Generates a randomized election timeout.
fn rand_election_timeout() -> Duration {
    rand::thread_rng().gen_range(ELECTION_TIMEOUT)
}

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are enqueued on the node's two
/// channels: client replies on client_tx, peer traffic on peer_tx.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or leader
    /// if there are no peers.
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        client_tx: crossbeam::channel::Sender<Envelope>,
        peer_tx: crossbeam::channel::Sender<Envelope>,
        now: Instant,
    ) -> Result<Self> {
        assert_ne!(id, BROADCAST, "replica id {BROADCAST} is reserved");
        let node = RawNode {
            id,
            peers,
            term: 0,
            voted: false,
            log,
            state,
            backlog: VecDeque::new(),
            last_heard: now,
            timeout: rand_election_timeout(),
            client_tx,
            peer_tx,
            role: Follower::new(None),
        };
        if node.peers.is_empty() {
            // If there are no peers, win the election immediately.
            return Ok(node.into_candidate(now)?.into_leader(now)?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> &NodeID {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Returns a status snapshot of the node.
    pub fn status(&self) -> Status {
        match self {
            Node::Candidate(n) => n.status_with(BROADCAST.into()),
            Node::Follower(n) => {
                n.status_with(n.role.leader.clone().unwrap_or_else(|| BROADCAST.into()))
            }
            Node::Leader(n) => n.status_with(n.id.clone()),
        }
    }

    /// Processes an inbound message.
    pub fn step(self, now: Instant, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(now, msg),
            Node::Follower(n) => n.step(now, msg),
            Node::Leader(n) => n.step(now, msg),
        }
    }

    /// Moves time forward, firing any pending timeouts and reconsidering
    /// backlogged client requests.
    pub fn tick(self, now: Instant) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(now),
            Node::Follower(n) => n.tick(now),
            Node::Leader(n) => n.tick(now),
        }
    }

    /// Re-offers all backlogged client requests to the current role handler,
    /// in arrival order. Requests that still can't be served (no leader
    /// known, or a write already staged) re-enter the backlog.
    fn replay_backlog(mut self, now: Instant) -> Result<Self> {
        let backlog = match &mut self {
            Node::Candidate(n) => std::mem::take(&mut n.backlog),
            Node::Follower(n) => std::mem::take(&mut n.backlog),
            Node::Leader(n) => std::mem::take(&mut n.backlog),
        };
        for msg in backlog {
            self = self.step(now, msg)?;
        }
        Ok(self)
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A node status snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The node's current leader, or `FFFF` if unknown.
    pub leader: NodeID,
    /// The node's current term.
    pub term: Term,
    /// The last log index.
    pub last_index: Index,
    /// The current commit index.
    pub commit_index: Index,
    /// The current applied index.
    pub apply_index: Index,
}

/// A Raft role: leader, follower, or candidate.
pub trait Role: std::fmt::Debug {
    /// The leader to advertise in outbound envelopes, or `FFFF` if unknown.
    fn leader_hint(&self, id: &NodeID) -> NodeID;
}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: HashSet<NodeID>,
    term: Term,
    /// Whether a vote was spent in the current term: granted to a candidate,
    /// or cast for ourself when campaigning. Reset whenever the term
    /// advances.
    voted: bool,
    log: Log,
    state: Box<dyn State>,
    /// Client requests that can't currently be served: no leader is known,
    /// or a write is already staged. Reconsidered on every tick, in arrival
    /// order.
    backlog: VecDeque<Envelope>,
    /// When we last heard from a live leader or granted a vote.
    last_heard: Instant,
    /// The election timeout, redrawn on every timer reset.
    timeout: Duration,
    client_tx: crossbeam::channel::Sender<Envelope>,
    peer_tx: crossbeam::channel::Sender<Envelope>,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            term: self.term,
            voted: self.voted,
            log: self.log,
            state: self.state,
            backlog: self.backlog,
            last_heard: self.last_heard,
            timeout: self.timeout,
            client_tx: self.client_tx,
            peer_tx: self.peer_tx,
            role,
        }
    }

    /// Reverts the node to a follower, adopting the given term and leader
    /// (if known). The election timer is reset with a fresh timeout.
    fn into_follower(
        mut self,
        term: Term,
        leader: Option<NodeID>,
        now: Instant,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {term}", self.term);
        if term > self.term {
            info!("Discovered term {term}, reverting to follower");
            self.term = term;
            self.voted = false;
        } else if let Some(leader) = &leader {
            info!("Lost election, following leader {leader} in term {term}");
        }
        self.reset_timer(now);
        Ok(self.into_role(Follower::new(leader)))
    }

    /// Transforms the node into a candidate and campaigns for leadership.
    fn into_candidate(self, now: Instant) -> Result<RawNode<Candidate>> {
        let mut node = self.into_role(Candidate::new());
        node.campaign(now)?;
        Ok(node)
    }

    /// Resets the election timer, redrawing the timeout.
    fn reset_timer(&mut self, now: Instant) {
        self.last_heard = now;
        self.timeout = rand_election_timeout();
    }

    /// Applies any pending committed entries to the state machine, silently.
    /// The leader instead uses maybe_apply_with() to acknowledge clients.
    fn maybe_apply(&mut self) -> Result<()> {
        Self::maybe_apply_with(&mut self.log, &mut self.state, |_| Ok(()))
    }

    /// Like maybe_apply(), but calls the given closure with every applied
    /// entry. Not a method, so that the closure can borrow the node.
    fn maybe_apply_with<F>(log: &mut Log, state: &mut Box<dyn State>, mut on_apply: F) -> Result<()>
    where
        F: FnMut(&super::log::Entry) -> Result<()>,
    {
        let applied_index = state.applied_index();
        let commit_index = log.commit_index();
        assert!(commit_index >= applied_index, "commit index below applied index");
        for index in applied_index + 1..=commit_index {
            let entry = log.get(index).expect("committed entry missing").clone();
            debug!("Applying {entry:?}");
            state.apply(index, &entry);
            on_apply(&entry)?;
        }
        Ok(())
    }

    /// Returns the quorum size of the cluster: a strict majority of the
    /// fixed replica set, counting ourself.
    fn quorum_size(&self) -> u64 {
        (self.peers.len() as u64 + 1) / 2 + 1
    }

    /// Enqueues a message to a peer (or all peers, via `FFFF`).
    fn send_peer(&self, to: impl Into<NodeID>, message: Message) -> Result<()> {
        let msg = Envelope {
            src: self.id.clone(),
            dst: to.into(),
            leader: self.role.leader_hint(&self.id),
            message,
        };
        debug!("Sending {msg:?}");
        Ok(self.peer_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        self.send_peer(BROADCAST, message)
    }

    /// Enqueues a reply to a client. Client replies use a dedicated queue so
    /// that role transitions can never reorder them relative to the
    /// operations that produced them.
    fn send_client(&self, to: impl Into<NodeID>, message: Message) -> Result<()> {
        let msg = Envelope {
            src: self.id.clone(),
            dst: to.into(),
            leader: self.role.leader_hint(&self.id),
            message,
        };
        debug!("Replying {msg:?}");
        Ok(self.client_tx.send(msg)?)
    }

    /// Builds a status snapshot with the given leader.
    fn status_with(&self, leader: NodeID) -> Status {
        Status {
            leader,
            term: self.term,
            last_index: self.log.last_index(),
            commit_index: self.log.commit_index(),
            apply_index: self.state.applied_index(),
        }
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert!(
            msg.dst == self.id || msg.dst == BROADCAST,
            "message for other node {}",
            msg.dst
        );
    }

    /// Asserts common node invariants.
    fn assert_node(&self) {
        debug_assert!(
            self.log.commit_index() >= self.state.applied_index(),
            "commit index below applied index"
        );
    }
}
