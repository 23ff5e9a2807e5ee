//! The gap-filling retransmission subprotocol.
//!
//! A replica that discovers it is behind asks a peer for everything after its committed slot.
//! The peer answers with two slot-ascending runs:  PValues it knows to be committed, and PValues
//! it has accepted above its committed slot.  The requester delivers the contiguous committable
//! prefix, advances its progress, and journals whatever accepts its promise still allows.
//!
//! The builder and the prefix computation are free functions so that the safety-critical
//! arithmetic stays independently testable; the applier lives on [crate::agent::Agent] because it
//! must sequence delivery, the progress write, and the accept write.

use biometrics::{Collector, Counter};
use zerror::Z;
use zerror_core::ErrorCore;

use synod_pb::{Error, Identifier, PValue};

use crate::journal::Journal;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static OUT_OF_RANGE: Counter = Counter::new("synod.retransmit.out_of_range");
static TRUNCATED: Counter = Counter::new("synod.retransmit.truncated");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&OUT_OF_RANGE);
    collector.register_counter(&TRUNCATED);
}

/////////////////////////////////////////// ResponseState //////////////////////////////////////////

/// The payload of a retransmit response.  Both runs ascend by slot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResponseState {
    pub committed: Vec<PValue>,
    pub uncommitted: Vec<PValue>,
}

////////////////////////////////////////// build_response //////////////////////////////////////////

/// Build the response to a retransmit request, or None when the requester has fallen off the
/// retained history and must resync at a higher level.  `committed_slot` is the responder's own
/// committed slot; `from_slot` is the last slot the requester has.
pub fn build_response<J: Journal>(
    journal: &mut J,
    committed_slot: u64,
    from_slot: u64,
) -> Result<Option<ResponseState>, Error> {
    let Some((min, max)) = journal.bounds()? else {
        OUT_OF_RANGE.click();
        return Ok(None);
    };
    if from_slot + 1 < min {
        OUT_OF_RANGE.click();
        return Ok(None);
    }
    let mut committed = Vec::new();
    for slot in std::cmp::max(from_slot + 1, min)..=std::cmp::min(committed_slot, max) {
        committed.push(read_accepted(journal, slot)?);
    }
    let mut uncommitted = Vec::new();
    for slot in std::cmp::max(committed_slot + 1, min)..=max {
        uncommitted.push(read_accepted(journal, slot)?);
    }
    Ok(Some(ResponseState {
        committed,
        uncommitted,
    }))
}

fn read_accepted<J: Journal>(journal: &mut J, slot: u64) -> Result<PValue, Error> {
    match journal.accepted(slot)? {
        Some(pv) => Ok(pv),
        None => Err(Error::MissingAccept {
            core: ErrorCore::default(),
            slot,
        })
        .with_info("context", "journal bounds cover a slot it cannot produce"),
    }
}

/////////////////////////////////////// contiguous_committable /////////////////////////////////////

/// The length of the longest prefix of `seq` that starts at `committed.slot + 1` and increases by
/// exactly one slot per entry.  Anything past a gap is unusable:  a sender that misorders its
/// response is buggy, and the receiver refuses to reorder on its behalf.
pub fn contiguous_committable(committed: &Identifier, seq: &[PValue]) -> usize {
    let mut expected = committed.slot + 1;
    let mut len = 0;
    for pv in seq {
        if pv.id.slot != expected {
            TRUNCATED.click();
            break;
        }
        expected += 1;
        len += 1;
    }
    len
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use synod_pb::{Ballot, ReplicaID, Value};

    use crate::journal::MemoryJournal;

    use super::*;

    fn pvalue(slot: u64) -> PValue {
        PValue {
            id: Identifier {
                from: ReplicaID::new(1),
                number: Ballot {
                    number: 1,
                    leader: ReplicaID::new(1),
                },
                slot,
            },
            value: Value::Nop,
        }
    }

    fn journal_with(slots: impl Iterator<Item = u64>) -> MemoryJournal {
        let mut journal = MemoryJournal::new();
        let pvalues: Vec<PValue> = slots.map(pvalue).collect();
        journal.accept(&pvalues).unwrap();
        journal
    }

    #[test]
    fn committed_range() {
        let mut journal = journal_with(98..=100);
        let state = build_response(&mut journal, 100, 97).unwrap().unwrap();
        assert_eq!(vec![pvalue(98), pvalue(99), pvalue(100)], state.committed);
        assert!(state.uncommitted.is_empty());
    }

    #[test]
    fn uncommitted_range() {
        let mut journal = journal_with(98..=100);
        let state = build_response(&mut journal, 97, 97).unwrap().unwrap();
        assert!(state.committed.is_empty());
        assert_eq!(vec![pvalue(98), pvalue(99), pvalue(100)], state.uncommitted);
    }

    #[test]
    fn requester_off_the_retained_history() {
        let mut journal = journal_with(98..=100);
        assert_eq!(None, build_response(&mut journal, 100, 10).unwrap());
    }

    #[test]
    fn mixed_ranges() {
        let mut journal = journal_with(98..=101);
        let state = build_response(&mut journal, 99, 97).unwrap().unwrap();
        assert_eq!(vec![pvalue(98), pvalue(99)], state.committed);
        assert_eq!(vec![pvalue(100), pvalue(101)], state.uncommitted);
    }

    #[test]
    fn empty_journal_has_nothing_to_offer() {
        let mut journal = MemoryJournal::new();
        assert_eq!(None, build_response(&mut journal, 0, 0).unwrap());
    }

    #[test]
    fn prefix_stops_at_the_first_gap() {
        let committed = Identifier {
            from: ReplicaID::new(1),
            number: Ballot::BOTTOM,
            slot: 97,
        };
        let seq = vec![pvalue(98), pvalue(99), pvalue(101), pvalue(100)];
        assert_eq!(2, contiguous_committable(&committed, &seq));
    }

    #[test]
    fn prefix_requires_the_next_slot_first() {
        let committed = Identifier {
            from: ReplicaID::new(1),
            number: Ballot::BOTTOM,
            slot: 97,
        };
        assert_eq!(0, contiguous_committable(&committed, &[pvalue(99)]));
        assert_eq!(1, contiguous_committable(&committed, &[pvalue(98)]));
        assert_eq!(0, contiguous_committable(&committed, &[]));
    }
}
