use super::super::log::{Entry, Index};
use super::super::message::{Envelope, Message, RequestID};
use super::{Node, NodeID, RawNode, Role};
use crate::error::Result;
use crate::raft::{HEARTBEAT_INTERVAL, MAX_APPEND_ENTRIES, REPLICATE_INTERVAL, TAKEOVER_INTERVAL};

use ::log::debug;
use itertools::Itertools as _;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// A leader serves client requests and replicates the log to followers. It
/// stages at most one client write at a time: a put is admitted only when no
/// other write is seeking a quorum, which keeps acknowledgement tracking to a
/// single quorum set and guarantees client acks in admission order.
#[derive(Clone, Debug, PartialEq)]
pub struct Leader {
    /// The next log index to send each peer.
    pub(super) next_index: HashMap<NodeID, Index>,
    /// The highest log index known to be replicated on each peer.
    pub(super) match_index: HashMap<NodeID, Index>,
    /// The message ID of the staged client write, if one is in flight.
    pub(super) staged: Option<RequestID>,
    /// The replicas (ourself included) that have acknowledged the staged
    /// write.
    pub(super) quorum: HashSet<NodeID>,
    /// Per-peer send pacing.
    pub(super) pacing: HashMap<NodeID, Pacing>,
}

/// Send pacing for a single peer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pacing {
    /// When the peer was last sent an append-entries.
    pub(super) last_sent: Instant,
    /// The minimum gap before the next entry-carrying send. Small right
    /// after installation and after each acknowledgement, larger while a
    /// send is outstanding.
    pub(super) gap: Duration,
}

impl Leader {
    /// Creates a new leader role with replication state for every peer.
    pub fn new(peers: &HashSet<NodeID>, next_index: Index, now: Instant) -> Self {
        let mut leader = Self {
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            staged: None,
            quorum: HashSet::new(),
            pacing: HashMap::new(),
        };
        for peer in peers {
            leader.next_index.insert(peer.clone(), next_index);
            leader.match_index.insert(peer.clone(), 0);
            leader.pacing.insert(peer.clone(), Pacing { last_sent: now, gap: TAKEOVER_INTERVAL });
        }
        leader
    }
}

impl Role for Leader {
    fn leader_hint(&self, id: &NodeID) -> NodeID {
        id.clone()
    }
}

impl RawNode<Leader> {
    /// Processes an inbound message.
    pub fn step(mut self, now: Instant, msg: Envelope) -> Result<Node> {
        self.assert_node();
        self.assert_step(&msg);

        // A staged write admits no rival; hold later puts in arrival order.
        if matches!(msg.message, Message::Put { .. }) && self.role.staged.is_some() {
            self.backlog.push_back(msg);
            return Ok(self.into());
        }

        match msg.message {
            // Reads are served directly from applied state.
            Message::Get { mid, key } => {
                let value = self.state.read(&key);
                self.send_client(msg.src, Message::Ok { mid, value: Some(value) })?;
            }

            // Admit the put: append it to our log and start gathering a
            // quorum. Replication to peers happens on the next tick.
            Message::Put { mid, key, value } => {
                let entry = Entry {
                    term: self.term,
                    key,
                    value,
                    client: msg.src,
                    put_id: mid.clone(),
                };
                let index = self.log.append(entry);
                debug!("Staged put {mid} at index {index}");
                self.role.staged = Some(mid);
                self.role.quorum = HashSet::from([self.id.clone()]);
            }

            Message::AppendEntryResponse { term, success, next_index, put_id } => {
                if success {
                    let next = next_index.min(self.log.next_index()).max(1);
                    self.role.next_index.insert(msg.src.clone(), next);
                    self.role.match_index.insert(msg.src.clone(), next - 1);
                    if let Some(pacing) = self.role.pacing.get_mut(&msg.src) {
                        pacing.gap = TAKEOVER_INTERVAL;
                    }
                    // Count the ack towards the staged write's quorum; on a
                    // quorum, the write (and everything before it) commits.
                    if self.role.staged.is_some() && self.role.staged == put_id {
                        self.role.quorum.insert(msg.src);
                        if self.role.quorum.len() as u64 >= self.quorum_size() {
                            self.log.commit(self.log.last_index());
                            self.role.staged = None;
                            self.role.quorum.clear();
                        }
                    }
                    self.maybe_commit();
                    self.maybe_apply_and_ack()?;
                } else if term > self.term {
                    // We've been deposed; a newer leader will reach us.
                    return Ok(self.into_follower(term, None, now)?.into());
                } else {
                    // Log inconsistency: back up to the follower's hinted
                    // index and retry immediately.
                    let next = next_index.max(1);
                    debug!("Follower {} rejected entries, backing up to {next}", msg.src);
                    self.role.next_index.insert(msg.src.clone(), next);
                    if let Some(pacing) = self.role.pacing.get_mut(&msg.src) {
                        pacing.gap = Duration::ZERO;
                    }
                }
            }

            // A newer leader exists; follow it and let it process the
            // message. Our staged write, if any, is abandoned and the
            // client retries via redirect.
            Message::AppendEntry { term, .. } if term > self.term => {
                return self.into_follower(term, Some(msg.src.clone()), now)?.step(now, msg);
            }
            Message::AppendEntry { .. } => {
                debug!("Ignoring append from stale leader {}", msg.src)
            }

            Message::RequestVote { term, .. } if term > self.term => {
                return self.into_follower(term, None, now)?.step(now, msg);
            }
            Message::RequestVote { .. } => {}

            // Grants straggling in after the election was already won.
            Message::Vote { .. } => {}

            Message::Hello | Message::Ok { .. } | Message::Redirect { .. } => {
                debug!("Dropping unexpected message {:?}", msg.message)
            }
        }
        Ok(self.into())
    }

    /// Moves time forward: applies and acknowledges newly committed writes,
    /// sends each peer new entries or a heartbeat as its pacing allows, and
    /// reconsiders backlogged client requests.
    pub fn tick(mut self, now: Instant) -> Result<Node> {
        self.assert_node();
        self.maybe_apply_and_ack()?;

        let last_index = self.log.last_index();
        // Sorted for deterministic send order.
        for peer in self.peers.iter().sorted().cloned().collect_vec() {
            let next = self.role.next_index[&peer];
            let Pacing { last_sent, gap } = self.role.pacing[&peer];
            if last_index >= next && now >= last_sent + gap {
                self.replicate(&peer, next)?;
                let pacing = self.role.pacing.get_mut(&peer).expect("unknown peer");
                pacing.last_sent = now;
                pacing.gap = REPLICATE_INTERVAL;
            } else if now >= last_sent + HEARTBEAT_INTERVAL {
                self.replicate_empty(&peer, next)?;
                self.role.pacing.get_mut(&peer).expect("unknown peer").last_sent = now;
            }
        }

        if !self.backlog.is_empty() {
            return Node::from(self).replay_backlog(now);
        }
        Ok(self.into())
    }

    /// Sends a batch of entries to a peer, starting at its next index.
    fn replicate(&self, peer: &NodeID, next: Index) -> Result<()> {
        let prev_log_index = next - 1;
        let prev_log_term = self.log.get(prev_log_index).expect("missing base entry").term;
        let entries = self.log.scan(next..next + MAX_APPEND_ENTRIES as Index).to_vec();
        debug!("Replicating {} entries at base {prev_log_index} to {peer}", entries.len());
        let num_puts = entries.len() as u64;
        self.send_peer(
            peer.clone(),
            Message::AppendEntry {
                term: self.term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.log.commit_index(),
                num_puts,
                put_id: self.role.staged.clone(),
            },
        )
    }

    /// Sends a heartbeat to a peer: an append with no entries but otherwise
    /// identical framing.
    fn replicate_empty(&self, peer: &NodeID, next: Index) -> Result<()> {
        let prev_log_index = next - 1;
        let prev_log_term = self.log.get(prev_log_index).expect("missing base entry").term;
        self.send_peer(
            peer.clone(),
            Message::AppendEntry {
                term: self.term,
                prev_log_index,
                prev_log_term,
                entries: vec![],
                leader_commit: self.log.commit_index(),
                num_puts: 0,
                put_id: self.role.staged.clone(),
            },
        )
    }

    /// Advances the commit index to the highest entry replicated to a
    /// strict majority of the cluster, stopping at the first index that
    /// either lacks a majority or wasn't proposed in our own term (see
    /// figure 8 in the Raft paper for why older terms can't be counted).
    fn maybe_commit(&mut self) -> Index {
        let mut commit_index = self.log.commit_index();
        for n in commit_index + 1..=self.log.last_index() {
            let replicated =
                1 + self.role.match_index.values().filter(|&&m| m >= n).count() as u64;
            if replicated < self.quorum_size() || self.log.get(n).map(|e| e.term) != Some(self.term)
            {
                break;
            }
            commit_index = n;
        }
        if commit_index > self.log.commit_index() {
            self.log.commit(commit_index);
        }
        commit_index
    }

    /// Applies newly committed entries and acknowledges each applied put to
    /// the client that submitted it, in log-index order.
    fn maybe_apply_and_ack(&mut self) -> Result<()> {
        let id = self.id.clone();
        let client_tx = self.client_tx.clone();
        Self::maybe_apply_with(&mut self.log, &mut self.state, |entry| {
            let msg = Envelope {
                src: id.clone(),
                dst: entry.client.clone(),
                leader: id.clone(),
                message: Message::Ok { mid: entry.put_id.clone(), value: None },
            };
            debug!("Acknowledging {msg:?}");
            Ok(client_tx.send(msg)?)
        })
    }
}
