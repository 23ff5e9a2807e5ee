#![doc = include_str!("../README.md")]

use std::cmp::Ordering;

use one_two_eight::{generate_id, generate_id_prototk};
use prototk_derive::Message;
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

//////////////////////////////////////////////// IDs ///////////////////////////////////////////////

generate_id! {CommandID, "command:"}
generate_id_prototk! {CommandID}

generate_id! {ReplyToken, "reply:"}
generate_id_prototk! {ReplyToken}

///////////////////////////////////////////// ReplicaID ////////////////////////////////////////////

/// A ReplicaID is a small, dense index that is unique per cluster member and stable across
/// restarts.  It doubles as the ballot tie-breaker, so two replicas must never share an index.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct ReplicaID {
    #[prototk(1, uint64)]
    pub index: u64,
}

impl ReplicaID {
    /// The smallest possible replica ID.
    pub const BOTTOM: ReplicaID = ReplicaID { index: 0 };

    /// The largest possible replica ID.
    pub const TOP: ReplicaID = ReplicaID { index: u64::MAX };

    /// Create a new ReplicaID from a dense index.
    pub const fn new(index: u64) -> Self {
        Self { index }
    }
}

impl std::fmt::Display for ReplicaID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "replica:{}", self.index)
    }
}

////////////////////////////////////////////// Ballot //////////////////////////////////////////////

/// Ballots are neither created nor destroyed, they just exist.  A ballot is the ordered pair of
/// (number, leader), where only the listed leader is allowed to issue proposals under the ballot.
///
/// Ballots are comparable.  When `ballot1` < `ballot2`, we will say that ballot2 supersedes
/// ballot1.  The comparison is lexicographic by (number, leader), which ensures that a proposer
/// whose ballot is superseded by a competing proposer can select another ballot to supersede
/// either of the first two.
#[derive(Clone, Debug, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct Ballot {
    #[prototk(1, uint64)]
    pub number: u64,
    #[prototk(2, message)]
    pub leader: ReplicaID,
}

impl Ballot {
    /// The smallest possible ballot.  Reserved for probing prepares that never become promises.
    pub const BOTTOM: Ballot = Ballot {
        number: 0,
        leader: ReplicaID::BOTTOM,
    };

    /// The largest possible ballot.
    pub const TOP: Ballot = Ballot {
        number: u64::MAX,
        leader: ReplicaID::TOP,
    };

    /// The smallest ballot led by `leader` that supersedes `self`.
    pub fn superseding(&self, leader: ReplicaID) -> Ballot {
        Ballot {
            number: self.number + 1,
            leader,
        }
    }
}

impl Default for Ballot {
    fn default() -> Self {
        Self::BOTTOM
    }
}

//////////////////////////////////////////// Identifier ////////////////////////////////////////////

/// An Identifier addresses a single instance of the synod protocol:  `from` proposed filling
/// `slot` under ballot `number`.  Identifiers order by slot first so that sorted containers keyed
/// by Identifier iterate in log order; ballot comparisons go through `number` explicitly.
#[derive(Clone, Debug, Default, Eq, Hash, Message, PartialEq)]
pub struct Identifier {
    #[prototk(1, message)]
    pub from: ReplicaID,
    #[prototk(2, message)]
    pub number: Ballot,
    #[prototk(3, uint64)]
    pub slot: u64,
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Identifier) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Identifier) -> Ordering {
        self.slot
            .cmp(&other.slot)
            .then_with(|| self.number.cmp(&other.number))
            .then_with(|| self.from.cmp(&other.from))
    }
}

////////////////////////////////////////////// Progress ////////////////////////////////////////////

/// The durable heart of a replica.  `promised` only ever increases, `committed.slot` only ever
/// increases, and `committed.number` never exceeds `promised`.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Progress {
    #[prototk(1, message)]
    pub promised: Ballot,
    #[prototk(2, message)]
    pub committed: Identifier,
}

/////////////////////////////////////////////// Value //////////////////////////////////////////////

/// The commands a slot can hold.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum Value {
    /// Fills a slot without side effects.  Recovery proposes Nop for slots it cannot learn.
    #[prototk(1, message)]
    #[default]
    Nop,
    /// A client command.  `id` deduplicates retries and routes the reply.
    #[prototk(2, message)]
    Command {
        #[prototk(1, message)]
        id: CommandID,
        #[prototk(2, bytes)]
        request: Vec<u8>,
    },
    /// A membership change.  Delivery of this variant is not yet implemented.
    #[prototk(3, message)]
    Reconfigure {
        #[prototk(1, bytes)]
        body: Vec<u8>,
    },
}

impl Value {
    /// The command ID for client commands; BOTTOM for everything else.
    pub fn command_id(&self) -> CommandID {
        match self {
            Value::Command { id, .. } => *id,
            _ => CommandID::BOTTOM,
        }
    }
}

////////////////////////////////////////////// PValue //////////////////////////////////////////////

/// A Proposed Value, or PValue, is commonly referred to as a "decree" in the Paxos papers.
///
/// PValues pair an [Identifier] with a [Value] and can be interpreted as, "The proposer
/// championing `id.number` proposes putting `value` into `id.slot`".  The journal stores at most
/// one PValue per slot for the replica's current promise.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PValue {
    #[prototk(1, message)]
    pub id: Identifier,
    #[prototk(2, message)]
    pub value: Value,
}

////////////////////////////////////////////// Prepare /////////////////////////////////////////////

/// Prepare messages rally support for a new ballot.  They are answered with [PrepareAck] or
/// [PrepareNack].
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Prepare {
    #[prototk(1, message)]
    pub id: Identifier,
}

impl Prepare {
    /// The probing prepare `from` broadcasts to check for a live leader.  It carries the BOTTOM
    /// ballot so it can never be promised, and never touches the journal.
    pub fn probe(from: ReplicaID) -> Prepare {
        Prepare {
            id: Identifier {
                from,
                number: Ballot::BOTTOM,
                slot: 0,
            },
        }
    }
}

///////////////////////////////////////////// PrepareAck ///////////////////////////////////////////

/// A promise to never accept a ballot below `id.number`, carrying the highest PValue the sender
/// has accepted for `id.slot` so that recovery can choose values safely.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PrepareAck {
    #[prototk(1, message)]
    pub id: Identifier,
    #[prototk(2, message)]
    pub from: ReplicaID,
    #[prototk(3, message)]
    pub progress: Progress,
    #[prototk(4, uint64)]
    pub max_accepted: u64,
    #[prototk(5, uint64)]
    pub heartbeat: u64,
    #[prototk(6, message)]
    pub accepted: Option<PValue>,
}

//////////////////////////////////////////// PrepareNack ///////////////////////////////////////////

/// A refusal to promise, carrying the sender's progress and its freshest leader-heartbeat
/// evidence so that probing followers can decide whether failover is warranted.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PrepareNack {
    #[prototk(1, message)]
    pub id: Identifier,
    #[prototk(2, message)]
    pub from: ReplicaID,
    #[prototk(3, message)]
    pub progress: Progress,
    #[prototk(4, uint64)]
    pub max_accepted: u64,
    #[prototk(5, uint64)]
    pub heartbeat: u64,
}

////////////////////////////////////////////// Accept //////////////////////////////////////////////

/// Accept messages use a previously rallied ballot to assign a [PValue].
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Accept {
    #[prototk(1, message)]
    pub pvalue: PValue,
}

///////////////////////////////////////////// AcceptAck ////////////////////////////////////////////

/// The sender durably accepted the PValue named by `id`.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct AcceptAck {
    #[prototk(1, message)]
    pub id: Identifier,
    #[prototk(2, message)]
    pub from: ReplicaID,
    #[prototk(3, message)]
    pub progress: Progress,
}

///////////////////////////////////////////// AcceptNack ///////////////////////////////////////////

/// The sender refused the PValue named by `id` because it promised a superseding ballot.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct AcceptNack {
    #[prototk(1, message)]
    pub id: Identifier,
    #[prototk(2, message)]
    pub from: ReplicaID,
    #[prototk(3, message)]
    pub progress: Progress,
}

////////////////////////////////////////////// Commit //////////////////////////////////////////////

/// The value at `id.slot` under `id.number` was accepted by a quorum.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Commit {
    #[prototk(1, message)]
    pub id: Identifier,
}

///////////////////////////////////////////// Heartbeat ////////////////////////////////////////////

/// Leaders broadcast heartbeats with a monotonically increasing counter.  Followers treat a fresh
/// counter as evidence of a live leader and suppress failover.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Heartbeat {
    #[prototk(1, uint64)]
    pub counter: u64,
}

////////////////////////////////////////// RetransmitRequest ///////////////////////////////////////

/// A lagging replica asks `to` for everything after `slot`.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct RetransmitRequest {
    #[prototk(1, message)]
    pub from: ReplicaID,
    #[prototk(2, message)]
    pub to: ReplicaID,
    #[prototk(3, uint64)]
    pub slot: u64,
}

////////////////////////////////////////// RetransmitResponse //////////////////////////////////////

/// Slot-ascending runs of PValues:  `committed` at or below the sender's committed slot,
/// `uncommitted` above it.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct RetransmitResponse {
    #[prototk(1, message)]
    pub from: ReplicaID,
    #[prototk(2, message)]
    pub to: ReplicaID,
    #[prototk(3, message)]
    pub committed: Vec<PValue>,
    #[prototk(4, message)]
    pub uncommitted: Vec<PValue>,
}

///////////////////////////////////////////// NotLeader ////////////////////////////////////////////

/// Returned to a client that routed a command to a replica that is not leading.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct NotLeader {
    #[prototk(1, message)]
    pub from: ReplicaID,
    #[prototk(2, message)]
    pub command: CommandID,
}

/////////////////////////////////////////// ClientCommand //////////////////////////////////////////

/// A client submits a value for the leader to sequence.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ClientCommand {
    #[prototk(1, message)]
    pub value: Value,
}

////////////////////////////////////////// ReplicaMessage //////////////////////////////////////////

/// The envelope for everything a replica can receive.  The transport serializes this enum; the
/// dispatcher routes on it.
#[derive(Clone, Debug, Eq, Message, PartialEq)]
pub enum ReplicaMessage {
    #[prototk(1, message)]
    Prepare(Prepare),
    #[prototk(2, message)]
    PrepareAck(PrepareAck),
    #[prototk(3, message)]
    PrepareNack(PrepareNack),
    #[prototk(4, message)]
    Accept(Accept),
    #[prototk(5, message)]
    AcceptAck(AcceptAck),
    #[prototk(6, message)]
    AcceptNack(AcceptNack),
    #[prototk(7, message)]
    Commit(Commit),
    #[prototk(8, message)]
    Heartbeat(Heartbeat),
    #[prototk(9, message)]
    RetransmitRequest(RetransmitRequest),
    #[prototk(10, message)]
    RetransmitResponse(RetransmitResponse),
    #[prototk(11, message)]
    NotLeader(NotLeader),
    #[prototk(12, message)]
    ClientCommand(ClientCommand),
}

impl Default for ReplicaMessage {
    fn default() -> Self {
        Self::Heartbeat(Heartbeat::default())
    }
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(475136, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(475137, message)]
    SerializationError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: prototk::Error,
    },
    #[prototk(475138, message)]
    JournalError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(475139, message)]
    MissingAccept {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, uint64)]
        slot: u64,
    },
    #[prototk(475140, message)]
    Corruption {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(475141, message)]
    LostLeadership {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        replica: ReplicaID,
        #[prototk(3, message)]
        command: CommandID,
    },
    #[prototk(475142, message)]
    NotYetImplemented {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(475143, message)]
    SystemError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Self {
        Self::JournalError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what,
        }
    }
}

iotoz! {Error}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use buffertk::{stack_pack, Unpacker};

    use super::*;

    #[test]
    fn ballots_order_by_number_then_leader() {
        let b11 = Ballot {
            number: 1,
            leader: ReplicaID::new(1),
        };
        let b12 = Ballot {
            number: 1,
            leader: ReplicaID::new(2),
        };
        let b21 = Ballot {
            number: 2,
            leader: ReplicaID::new(1),
        };
        assert!(b11 < b12);
        assert!(b12 < b21);
        assert!(Ballot::BOTTOM < b11);
        assert!(b21 < Ballot::TOP);
    }

    #[test]
    fn superseding_always_wins() {
        let b = Ballot {
            number: 5,
            leader: ReplicaID::new(7),
        };
        let s = b.superseding(ReplicaID::new(1));
        assert!(b < s);
        assert_eq!(6, s.number);
        assert_eq!(ReplicaID::new(1), s.leader);
    }

    #[test]
    fn identifiers_order_by_slot_first() {
        let lo = Identifier {
            from: ReplicaID::new(9),
            number: Ballot {
                number: 9,
                leader: ReplicaID::new(9),
            },
            slot: 1,
        };
        let hi = Identifier {
            from: ReplicaID::new(1),
            number: Ballot::BOTTOM,
            slot: 2,
        };
        assert!(lo < hi);
    }

    #[test]
    fn probe_carries_the_bottom_ballot() {
        let probe = Prepare::probe(ReplicaID::new(3));
        assert_eq!(Ballot::BOTTOM, probe.id.number);
        assert_eq!(ReplicaID::new(3), probe.id.from);
        assert_eq!(0, probe.id.slot);
    }

    #[test]
    fn envelope_round_trip() {
        let msg = ReplicaMessage::Accept(Accept {
            pvalue: PValue {
                id: Identifier {
                    from: ReplicaID::new(2),
                    number: Ballot {
                        number: 3,
                        leader: ReplicaID::new(2),
                    },
                    slot: 42,
                },
                value: Value::Command {
                    id: CommandID::BOTTOM,
                    request: vec![0xde, 0xad],
                },
            },
        });
        let buf = stack_pack(&msg).to_vec();
        let mut up = Unpacker::new(&buf);
        let got: ReplicaMessage = up.unpack().expect("envelope should unpack");
        assert_eq!(msg, got);
    }
}
