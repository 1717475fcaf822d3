use super::log::{Entry, Index};
use super::node::{NodeID, Term};
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};

/// The reserved broadcast address. Datagrams sent to it are delivered to all
/// replicas. It doubles as the "leader unknown" sentinel in the envelope's
/// leader field.
pub const BROADCAST: &str = "FFFF";

/// A client-chosen message ID, used to correlate requests and replies.
pub type RequestID = String;

/// A message envelope, shared by every datagram on the wire. The payload is
/// flattened into the same JSON object and dispatched on its `type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sending replica or client.
    pub src: NodeID,
    /// The destination replica or client, or `FFFF` to broadcast.
    pub dst: NodeID,
    /// The sender's current leader, or `FFFF` if unknown.
    pub leader: NodeID,
    /// The message payload.
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Decodes an envelope from a raw datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes the envelope into a datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A message between replicas, or between a client and a replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Announces a replica to the controller on startup. Broadcast once.
    Hello,

    /// A client read of a single key.
    Get {
        #[serde(rename = "MID")]
        mid: RequestID,
        key: String,
    },

    /// A client write of a single key.
    Put {
        #[serde(rename = "MID")]
        mid: RequestID,
        key: String,
        value: String,
    },

    /// Acknowledges a client request: a get carries the read value (the empty
    /// string if the key is absent), a put carries no value and means the
    /// write is committed.
    Ok {
        #[serde(rename = "MID")]
        mid: RequestID,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// Tells a client to retry its request with the leader named in the
    /// envelope's leader field.
    Redirect {
        #[serde(rename = "MID")]
        mid: RequestID,
    },

    /// Candidates solicit votes from all peers when campaigning.
    RequestVote {
        /// The candidate's term.
        term: Term,
        /// The index of the candidate's last log entry.
        last_log_index: Index,
        /// The term of the candidate's last log entry.
        last_log_term: Term,
    },

    /// Grants a vote to a candidate. Replicas grant at most one vote per
    /// term; rejections are silent.
    Vote {
        /// The voter's term, after adopting the candidate's.
        term: Term,
    },

    /// Leaders replicate log entries and assert leadership. An empty entries
    /// list is a heartbeat: it resets the receiver's election timer and may
    /// advance its commit index, but never modifies its log.
    AppendEntry {
        /// The leader's term.
        term: Term,
        /// The index of the entry immediately preceding the sent entries.
        prev_log_index: Index,
        /// The term of the entry at prev_log_index.
        prev_log_term: Term,
        /// Entries to append, at most [`super::MAX_APPEND_ENTRIES`].
        entries: Vec<Entry>,
        /// The leader's commit index.
        leader_commit: Index,
        /// The number of put entries carried. Informational only.
        num_puts: u64,
        /// The message ID of the leader's staged put, if any, echoed back in
        /// responses so the leader can count acknowledgements towards its
        /// quorum.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        put_id: Option<RequestID>,
    },

    /// A follower's reply to an entry-carrying append. Heartbeats are not
    /// acknowledged.
    AppendEntryResponse {
        /// The follower's term.
        term: Term,
        /// Whether the entries were appended.
        success: bool,
        /// On success, the follower's new next log index. On failure, the
        /// follower's commit index, as a hint for where to resume.
        next_index: Index,
        /// The put_id of the append being acknowledged, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        put_id: Option<RequestID>,
    },
}
