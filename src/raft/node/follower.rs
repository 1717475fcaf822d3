use super::super::message::{Envelope, Message};
use super::{Node, NodeID, RawNode, Role};
use crate::error::Result;

use ::log::{debug, info};
use std::time::Instant;

/// A follower replicates state from a leader, redirects clients to it, and
/// campaigns for leadership if the leader goes quiet.
#[derive(Clone, Debug, PartialEq)]
pub struct Follower {
    /// The leader, or None if we haven't heard from one this term.
    pub(super) leader: Option<NodeID>,
}

impl Follower {
    /// Creates a new follower role.
    pub fn new(leader: Option<NodeID>) -> Self {
        Self { leader }
    }
}

impl Role for Follower {
    fn leader_hint(&self, _id: &NodeID) -> NodeID {
        self.leader.clone().unwrap_or_else(|| super::BROADCAST.into())
    }
}

impl RawNode<Follower> {
    /// Processes an inbound message.
    pub fn step(mut self, now: Instant, msg: Envelope) -> Result<Node> {
        self.assert_node();
        self.assert_step(&msg);

        match msg.message {
            // Client requests are redirected to the leader if we know one,
            // otherwise held until one emerges.
            Message::Get { .. } | Message::Put { .. } => {
                match &self.role.leader {
                    Some(_) => {
                        let mid = match &msg.message {
                            Message::Get { mid, .. } | Message::Put { mid, .. } => mid.clone(),
                            _ => unreachable!(),
                        };
                        self.send_client(msg.src, Message::Redirect { mid })?;
                    }
                    None => self.backlog.push_back(msg),
                }
            }

            // Grant a vote if the candidate's log is at least as long as
            // ours and we haven't spent our vote for its term. Rejections
            // are silent; the candidate retries in a later term.
            Message::RequestVote { term, last_log_index, .. } => {
                let up_to_date = last_log_index >= self.log.last_index();
                let grantable = term > self.term || (term == self.term && !self.voted);
                if up_to_date && grantable {
                    if term > self.term {
                        self.term = term;
                    }
                    self.voted = true;
                    self.reset_timer(now);
                    info!("Voting for {} in term {} election", msg.src, term);
                    self.send_peer(msg.src, Message::Vote { term: self.term })?;
                } else {
                    debug!("Rejecting vote for {} in term {term}", msg.src);
                }
            }

            // Accept entries from a live leader whose view of our log
            // checks out, following it if we weren't already. A rejection
            // hints at our commit index, which the leader's log is
            // guaranteed to contain.
            Message::AppendEntry {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                put_id,
                ..
            } => {
                let consistent = prev_log_index < self.log.next_index()
                    && self.log.has(prev_log_index, prev_log_term);
                if term >= self.term && consistent {
                    self.term = term;
                    // Clearing the vote re-arms the election gate: if this
                    // leader goes quiet, we are free to campaign.
                    self.voted = false;
                    if self.role.leader.as_ref() != Some(&msg.src) {
                        info!("Following leader {} in term {}", msg.src, self.term);
                        self.role.leader = Some(msg.src.clone());
                    }
                    self.reset_timer(now);
                    // Only entry-carrying appends touch the log and get a
                    // response; a bare heartbeat must never truncate.
                    if !entries.is_empty() {
                        let next_index = self.log.splice(prev_log_index, entries);
                        self.send_peer(
                            msg.src,
                            Message::AppendEntryResponse {
                                term: self.term,
                                success: true,
                                next_index,
                                put_id,
                            },
                        )?;
                    }
                    if leader_commit > self.log.commit_index() {
                        self.log.commit(leader_commit.min(self.log.last_index()));
                        self.maybe_apply()?;
                    }
                } else {
                    self.send_peer(
                        msg.src,
                        Message::AppendEntryResponse {
                            term: self.term,
                            success: false,
                            next_index: self.log.commit_index(),
                            put_id: None,
                        },
                    )?;
                }
            }

            // A vote grant from a candidacy we've since abandoned.
            Message::Vote { .. } => {}

            // A stale response from our own leadership in a previous term.
            Message::AppendEntryResponse { .. } => {}

            // Not addressed to replicas; drop.
            Message::Hello | Message::Ok { .. } | Message::Redirect { .. } => {
                debug!("Dropping unexpected message {:?}", msg.message)
            }
        }
        Ok(self.into())
    }

    /// Moves time forward: applies any newly committed entries, starts an
    /// election if the leader has gone quiet and our vote is unspent, and
    /// reconsiders backlogged client requests once a leader is known.
    pub fn tick(mut self, now: Instant) -> Result<Node> {
        self.assert_node();
        self.maybe_apply()?;
        if now >= self.last_heard + self.timeout && !self.voted {
            return Ok(self.into_candidate(now)?.into());
        }
        if self.role.leader.is_some() && !self.backlog.is_empty() {
            return Node::from(self).replay_backlog(now);
        }
        Ok(self.into())
    }
}
