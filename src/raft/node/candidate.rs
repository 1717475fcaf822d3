use super::super::message::{Envelope, Message};
use super::{Node, NodeID, RawNode, Role};
use crate::error::Result;

use ::log::{debug, info};
use std::collections::HashSet;
use std::time::Instant;

/// A candidate is campaigning to become leader.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Votes received, including our own.
    pub(super) votes: HashSet<NodeID>,
}

impl Candidate {
    /// Creates a new candidate role.
    pub fn new() -> Self {
        Self { votes: HashSet::new() }
    }
}

impl Default for Candidate {
    fn default() -> Self {
        Self::new()
    }
}

impl Role for Candidate {
    fn leader_hint(&self, _id: &NodeID) -> NodeID {
        super::BROADCAST.into()
    }
}

impl RawNode<Candidate> {
    /// Campaigns for leadership: enters the next term, votes for ourself,
    /// and solicits votes from all peers. The election timer is deliberately
    /// not reset, so a failed campaign escalates to a new term after the
    /// existing timeout.
    pub(super) fn campaign(&mut self, now: Instant) -> Result<()> {
        self.term += 1;
        self.voted = true;
        self.role.votes = HashSet::from([self.id.clone()]);
        self.last_heard = now;
        info!("Starting election for term {}", self.term);
        self.broadcast(Message::RequestVote {
            term: self.term,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    /// Transitions the candidate to leader after winning an election:
    /// initializes the per-peer replication state and immediately asserts
    /// leadership with an empty broadcast append, based at the sentinel so
    /// every peer accepts it.
    pub(super) fn into_leader(self, now: Instant) -> Result<RawNode<super::Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let role = super::Leader::new(&self.peers, self.log.next_index(), now);
        let node = self.into_role(role);
        node.broadcast(Message::AppendEntry {
            term: node.term,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: node.log.commit_index(),
            num_puts: 0,
            put_id: None,
        })?;
        Ok(node)
    }

    /// Processes an inbound message.
    pub fn step(mut self, now: Instant, msg: Envelope) -> Result<Node> {
        self.assert_node();
        self.assert_step(&msg);
        assert!(self.role.votes.contains(&self.id), "candidate did not vote for itself");

        match msg.message {
            // Clients must wait for the election to settle.
            Message::Get { .. } | Message::Put { .. } => self.backlog.push_back(msg),

            // A live leader in this term or later means we lost; follow it
            // and process the message as a follower.
            Message::AppendEntry { term, .. } if term >= self.term => {
                return self.into_follower(term, Some(msg.src.clone()), now)?.step(now, msg);
            }

            // A stale leader; refuse so it learns our term.
            Message::AppendEntry { .. } => {
                let next_index = self.log.commit_index();
                self.send_peer(
                    msg.src,
                    Message::AppendEntryResponse {
                        term: self.term,
                        success: false,
                        next_index,
                        put_id: None,
                    },
                )?;
            }

            // Count votes for our current term; with a quorum, take over as
            // leader and re-offer any backlogged client requests.
            Message::Vote { term } if term == self.term => {
                self.role.votes.insert(msg.src);
                if self.role.votes.len() as u64 >= self.quorum_size() {
                    return Node::from(self.into_leader(now)?).replay_backlog(now);
                }
            }

            // A grant from a previous campaign.
            Message::Vote { .. } => {}

            // A rival candidate in a later term takes precedence; step back
            // into a leaderless follower and let it process the request.
            Message::RequestVote { term, .. } if term > self.term => {
                return self.into_follower(term, None, now)?.step(now, msg);
            }

            // Don't grant rival candidacies at our own term; we voted for
            // ourself.
            Message::RequestVote { .. } => {}

            // Stale leftovers from an earlier leadership; drop.
            Message::AppendEntryResponse { .. } => {}
            Message::Hello | Message::Ok { .. } | Message::Redirect { .. } => {
                debug!("Dropping unexpected message {:?}", msg.message)
            }
        }
        Ok(self.into())
    }

    /// Moves time forward: if the election timer expires before a quorum
    /// arrives, escalate to a new term and campaign again.
    pub fn tick(mut self, now: Instant) -> Result<Node> {
        self.assert_node();
        self.maybe_apply()?;
        if now >= self.last_heard + self.timeout {
            self.campaign(now)?;
        }
        Ok(self.into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::super::message::BROADCAST;
    use super::super::tests::{assert_messages, assert_node, entry, envelope, put, setup, t0};
    use super::*;

    /// Builds a candidate out of the standard follower fixture, campaigning
    /// at term 4.
    fn setup_candidate() -> (
        Node,
        crossbeam::channel::Receiver<Envelope>,
        crossbeam::channel::Receiver<Envelope>,
    ) {
        let (follower, client_rx, peer_rx) = setup();
        let node = follower.into_candidate(t0()).unwrap();
        assert_messages(
            &peer_rx,
            vec![envelope(
                "A",
                BROADCAST,
                BROADCAST,
                Message::RequestVote { term: 4, last_log_index: 3, last_log_term: 2 },
            )],
        );
        (node.into(), client_rx, peer_rx)
    }

    fn vote(src: &str, term: u64) -> Envelope {
        envelope(src, "A", BROADCAST, Message::Vote { term })
    }

    #[test]
    // Two grants plus our own vote form a quorum of five; the new leader
    // immediately asserts itself with an empty append based at the
    // sentinel.
    fn step_vote_quorum() -> Result<()> {
        let (mut node, _client_rx, peer_rx) = setup_candidate();
        node = node.step(t0(), vote("B", 4))?;
        assert_node(&node).is_candidate().term(4);
        assert_messages(&peer_rx, vec![]);

        node = node.step(t0(), vote("C", 4))?;
        assert_node(&node).is_leader().term(4).voted(true);
        assert_messages(
            &peer_rx,
            vec![envelope(
                "A",
                BROADCAST,
                "A",
                Message::AppendEntry {
                    term: 4,
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: vec![],
                    leader_commit: 2,
                    num_puts: 0,
                    put_id: None,
                },
            )],
        );
        Ok(())
    }

    #[test]
    // Duplicate grants from the same peer don't add up to a quorum.
    fn step_vote_duplicate() -> Result<()> {
        let (mut node, _client_rx, peer_rx) = setup_candidate();
        for _ in 0..5 {
            node = node.step(t0(), vote("B", 4))?;
            assert_node(&node).is_candidate().term(4);
        }
        assert_messages(&peer_rx, vec![]);
        Ok(())
    }

    #[test]
    // Grants from an earlier campaign are ignored.
    fn step_vote_stale_term() -> Result<()> {
        let (mut node, _client_rx, _peer_rx) = setup_candidate();
        node = node.step(t0(), vote("B", 3))?;
        node = node.step(t0(), vote("C", 3))?;
        assert_node(&node).is_candidate().term(4);
        Ok(())
    }

    #[test]
    // Client requests are backlogged during the election and served once it
    // is won.
    fn step_client_backlogged_until_won() -> Result<()> {
        let (mut node, client_rx, _peer_rx) = setup_candidate();
        node = node.step(t0(), put("X", "A", "m9", "x", "9"))?;
        assert_node(&node).is_candidate().backlogged(vec!["m9"]);
        assert_messages(&client_rx, vec![]);

        node = node.step(t0(), vote("B", 4))?;
        node = node.step(t0(), vote("C", 4))?;
        // The put was admitted by the new leader: staged, appended at 4.
        assert_node(&node).is_leader().backlogged(vec![]).last(4).entry(
            4,
            crate::raft::Entry {
                term: 4,
                key: "x".into(),
                value: "9".into(),
                client: "X".into(),
                put_id: "m9".into(),
            },
        );
        Ok(())
    }

    #[test]
    // An append from a leader in our term means we lost the election.
    fn step_lost_to_leader() -> Result<()> {
        let (node, _client_rx, peer_rx) = setup_candidate();
        let node = node.step(
            t0(),
            envelope(
                "D",
                "A",
                "D",
                Message::AppendEntry {
                    term: 4,
                    prev_log_index: 3,
                    prev_log_term: 2,
                    entries: vec![entry(4, "d", "4", "m4")],
                    leader_commit: 2,
                    num_puts: 1,
                    put_id: Some("m4".into()),
                },
            ),
        )?;
        assert_node(&node).is_follower().term(4).leader(Some("D")).last(4);
        assert_messages(
            &peer_rx,
            vec![envelope(
                "A",
                "D",
                "D",
                Message::AppendEntryResponse {
                    term: 4,
                    success: true,
                    next_index: 5,
                    put_id: Some("m4".into()),
                },
            )],
        );
        Ok(())
    }

    #[test]
    // A stale leader's append is refused.
    fn step_stale_append() -> Result<()> {
        let (node, _client_rx, peer_rx) = setup_candidate();
        let node = node.step(
            t0(),
            envelope(
                "B",
                "A",
                "B",
                Message::AppendEntry {
                    term: 3,
                    prev_log_index: 3,
                    prev_log_term: 2,
                    entries: vec![],
                    leader_commit: 2,
                    num_puts: 0,
                    put_id: None,
                },
            ),
        )?;
        assert_node(&node).is_candidate().term(4);
        assert_messages(
            &peer_rx,
            vec![envelope(
                "A",
                "B",
                BROADCAST,
                Message::AppendEntryResponse {
                    term: 4,
                    success: false,
                    next_index: 2,
                    put_id: None,
                },
            )],
        );
        Ok(())
    }

    #[test]
    // A rival candidacy in a later term turns us back into a follower, and
    // we may grant it.
    fn step_rival_higher_term() -> Result<()> {
        let (node, _client_rx, peer_rx) = setup_candidate();
        let node = node.step(
            t0(),
            envelope(
                "E",
                BROADCAST,
                BROADCAST,
                Message::RequestVote { term: 5, last_log_index: 3, last_log_term: 2 },
            ),
        )?;
        assert_node(&node).is_follower().term(5).voted(true).leader(None);
        assert_messages(&peer_rx, vec![envelope("A", "E", BROADCAST, Message::Vote { term: 5 })]);
        Ok(())
    }

    #[test]
    // A rival candidacy at our own term is ignored; we voted for ourself.
    fn step_rival_same_term() -> Result<()> {
        let (node, _client_rx, peer_rx) = setup_candidate();
        let node = node.step(
            t0(),
            envelope(
                "E",
                BROADCAST,
                BROADCAST,
                Message::RequestVote { term: 4, last_log_index: 9, last_log_term: 2 },
            ),
        )?;
        assert_node(&node).is_candidate().term(4);
        assert_messages(&peer_rx, vec![]);
        Ok(())
    }

    #[test]
    // The timer expiring mid-election escalates to a new term. The previous
    // campaign's timeout is kept, not redrawn.
    fn tick_reelection() -> Result<()> {
        let (node, _client_rx, peer_rx) = setup_candidate();
        let timeout = match &node {
            Node::Candidate(n) => n.timeout,
            _ => unreachable!(),
        };
        let node = node.tick(t0() + timeout / 2)?;
        assert_node(&node).is_candidate().term(4);
        assert_messages(&peer_rx, vec![]);

        let node = node.tick(t0() + timeout)?;
        assert_node(&node).is_candidate().term(5);
        assert_messages(
            &peer_rx,
            vec![envelope(
                "A",
                BROADCAST,
                BROADCAST,
                Message::RequestVote { term: 5, last_log_index: 3, last_log_term: 2 },
            )],
        );
        Ok(())
    }
}
