//! The durable memory of a replica.
//!
//! A journal stores exactly two things:  the [Progress] record and the accepted PValue per slot.
//! The core calls the journal synchronously from inside its handlers, which is what guarantees
//! that everything a handler persisted is durable before anything the handler said reaches the
//! wire.

use std::collections::BTreeMap;

use biometrics::{Collector, Counter};
use zerror::Z;
use zerror_core::ErrorCore;

use synod_pb::{Error, PValue, Progress};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static SAVE_PROGRESS: Counter = Counter::new("synod.journal.save_progress");
static ACCEPT: Counter = Counter::new("synod.journal.accept");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&SAVE_PROGRESS);
    collector.register_counter(&ACCEPT);
}

////////////////////////////////////////////// Journal /////////////////////////////////////////////

/// The journal contract.  Every write method must be crash-atomic and durable before it returns.
/// Any error is fatal to the replica:  the dispatcher halts and the process restarts from the
/// journal's contents.
///
/// After a crash, the visible state must equal some prefix of the write sequence that was issued.
/// A later write must never survive a crash that an earlier write did not.
pub trait Journal {
    /// Read the Progress record.  Called once at boot.
    fn load_progress(&mut self) -> Result<Progress, Error>;

    /// Durably replace the Progress record.
    fn save_progress(&mut self, progress: &Progress) -> Result<(), Error>;

    /// Durably record one or more accepted PValues, atomically.  A PValue for a slot that already
    /// holds one replaces it; that only happens when the replica repromises to a superseding
    /// ballot.
    fn accept(&mut self, pvalues: &[PValue]) -> Result<(), Error>;

    /// The PValue durably stored for `slot`, if any.
    fn accepted(&mut self, slot: u64) -> Result<Option<PValue>, Error>;

    /// The inclusive range of slots for which [Journal::accepted] may return Some, or None for an
    /// empty journal.  Retention is the host's policy; the core only requires that bounds tell
    /// the truth.
    fn bounds(&mut self) -> Result<Option<(u64, u64)>, Error>;
}

/////////////////////////////////////////// MemoryJournal //////////////////////////////////////////

/// A journal that holds everything in memory.  It provides no durability whatsoever, which makes
/// it suitable for tests and for hosts that wrap the journal in their own transactional storage.
/// It does enforce the Progress invariants, so a handler that tries to move progress backwards
/// fails loudly instead of corrupting the replica.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryJournal {
    progress: Progress,
    accepted: BTreeMap<u64, PValue>,
}

impl MemoryJournal {
    /// A fresh, empty journal.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for MemoryJournal {
    fn load_progress(&mut self) -> Result<Progress, Error> {
        Ok(self.progress.clone())
    }

    fn save_progress(&mut self, progress: &Progress) -> Result<(), Error> {
        SAVE_PROGRESS.click();
        if progress.promised < self.progress.promised {
            return Err(Error::Corruption {
                core: ErrorCore::default(),
                what: "promise moved backwards".to_owned(),
            })
            .with_info("was", self.progress.promised.clone())
            .with_info("now", progress.promised.clone());
        }
        if progress.committed.slot < self.progress.committed.slot {
            return Err(Error::Corruption {
                core: ErrorCore::default(),
                what: "committed slot moved backwards".to_owned(),
            })
            .with_info("was", self.progress.committed.slot)
            .with_info("now", progress.committed.slot);
        }
        if progress.committed.number > progress.promised {
            return Err(Error::Corruption {
                core: ErrorCore::default(),
                what: "committed ballot exceeds promise".to_owned(),
            })
            .with_info("committed", progress.committed.clone())
            .with_info("promised", progress.promised.clone());
        }
        self.progress = progress.clone();
        Ok(())
    }

    fn accept(&mut self, pvalues: &[PValue]) -> Result<(), Error> {
        ACCEPT.click();
        for pv in pvalues {
            self.accepted.insert(pv.id.slot, pv.clone());
        }
        Ok(())
    }

    fn accepted(&mut self, slot: u64) -> Result<Option<PValue>, Error> {
        Ok(self.accepted.get(&slot).cloned())
    }

    fn bounds(&mut self) -> Result<Option<(u64, u64)>, Error> {
        let min = self.accepted.keys().next().copied();
        let max = self.accepted.keys().next_back().copied();
        match (min, max) {
            (Some(min), Some(max)) => Ok(Some((min, max))),
            _ => Ok(None),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use synod_pb::{Ballot, Identifier, ReplicaID, Value};

    use super::*;

    fn pvalue(slot: u64, number: u64) -> PValue {
        PValue {
            id: Identifier {
                from: ReplicaID::new(1),
                number: Ballot {
                    number,
                    leader: ReplicaID::new(1),
                },
                slot,
            },
            value: Value::Nop,
        }
    }

    #[test]
    fn bounds_of_an_empty_journal() {
        let mut journal = MemoryJournal::new();
        assert_eq!(None, journal.bounds().unwrap());
    }

    #[test]
    fn bounds_track_accepts() {
        let mut journal = MemoryJournal::new();
        journal.accept(&[pvalue(3, 1), pvalue(5, 1)]).unwrap();
        assert_eq!(Some((3, 5)), journal.bounds().unwrap());
        assert_eq!(Some(pvalue(3, 1)), journal.accepted(3).unwrap());
        assert_eq!(None, journal.accepted(4).unwrap());
    }

    #[test]
    fn repromise_overwrites_a_slot() {
        let mut journal = MemoryJournal::new();
        journal.accept(&[pvalue(3, 1)]).unwrap();
        journal.accept(&[pvalue(3, 2)]).unwrap();
        assert_eq!(Some(pvalue(3, 2)), journal.accepted(3).unwrap());
    }

    #[test]
    fn progress_may_not_regress() {
        let mut journal = MemoryJournal::new();
        let promised = Ballot {
            number: 4,
            leader: ReplicaID::new(2),
        };
        let progress = Progress {
            promised: promised.clone(),
            committed: Identifier {
                from: ReplicaID::new(2),
                number: promised,
                slot: 9,
            },
        };
        journal.save_progress(&progress).unwrap();
        assert!(journal.save_progress(&Progress::default()).is_err());
        assert_eq!(progress, journal.load_progress().unwrap());
    }
}
