//! Recovery:  the road from follower to leader.
//!
//! A recoverer promises itself a ballot that supersedes everything it has seen, durably records
//! that promise, and then runs the classic prepare phase over every slot that might hold an
//! undelivered value:  from just past its committed slot through just past its journal's highest
//! accepted slot.  The prepare range deliberately ignores higher accepted slots reported by
//! responders and trusts only the local journal; the retransmission subprotocol fills anything
//! that misses.
//!
//! For each prepared slot, a majority of responses either reveals a superseding promise (back
//! down) or yields the safe value:  the accepted PValue with the largest ballot across all
//! responses, or Nop when nobody accepted anything.  The recoverer proposes that value under its
//! own ballot and becomes leader once the slot after its committed frontier is accepted by a
//! majority.

use std::collections::HashMap;

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};

use synod_pb::{
    Accept, Error, Heartbeat, Identifier, PValue, Prepare, PrepareAck, ReplicaMessage, Value,
};

use crate::agent::{max_accepted, Agent, PrepareVote, Role};
use crate::dispatch::Env;
use crate::journal::Journal;
use crate::{Host, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static RECOVERY: Counter = Counter::new("synod.recoverer.recovery");
static SLOT_DECIDED: Counter = Counter::new("synod.recoverer.slot_decided");
static LEADERSHIP: Counter = Counter::new("synod.recoverer.leadership");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&RECOVERY);
    collector.register_counter(&SLOT_DECIDED);
    collector.register_counter(&LEADERSHIP);
}

/////////////////////////////////////////////// Agent //////////////////////////////////////////////

impl Agent {
    /// Become a recoverer:  durably promise ourselves a superseding ballot, then prepare every
    /// slot that might hold a value, seeding each ledger with our own ack.
    pub(crate) fn become_recoverer<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
    ) -> Result<(), Error> {
        RECOVERY.click();
        let highest = std::cmp::max(
            self.data.progress.promised.clone(),
            self.data.progress.committed.number.clone(),
        );
        let promise = highest.superseding(self.id);
        let first = self.data.progress.committed.slot + 1;
        let max_accepted = max_accepted(journal)?;
        let last = std::cmp::max(first, max_accepted + 1);
        self.data.progress.promised = promise.clone();
        journal.save_progress(&self.data.progress)?;
        self.role = Role::Recoverer;
        self.data.epoch = None;
        self.data.prepare_responses.clear();
        self.data.accept_responses.clear();
        clue!(COLLECTOR, INFO, {
            recovery: {
                replica: self.id.index,
                ballot: promise.number,
                first_slot: first,
                last_slot: last,
            },
        });
        for slot in first..=last {
            let id = Identifier {
                from: self.id,
                number: promise.clone(),
                slot,
            };
            let ack = PrepareAck {
                id: id.clone(),
                from: self.id,
                progress: self.data.progress.clone(),
                max_accepted,
                heartbeat: self.data.leader_heartbeat,
                accepted: journal.accepted(slot)?,
            };
            let mut votes = HashMap::new();
            votes.insert(self.id, PrepareVote::Ack(ack));
            self.data.prepare_responses.insert(id.clone(), votes);
            env.emit(ReplicaMessage::Prepare(Prepare { id }));
        }
        self.data.timeout = env.random_timeout();
        self.advance_recovery(env, journal, host)
    }

    /// A response to one of our recovery prepares.  Votes accumulate until a strict majority has
    /// answered for the slot, and only then is the slot decided.
    pub(crate) fn on_recovery_response<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        vote: PrepareVote,
    ) -> Result<(), Error> {
        let id = vote.id().clone();
        let Some(votes) = self.data.prepare_responses.get_mut(&id) else {
            self.unexpected(env, "recovery_response");
            return Ok(());
        };
        votes.insert(vote.from(), vote);
        if env.majority(self.data.cluster_size, votes.len() as u64) {
            self.decide_slot(env, journal, host, id)?;
            self.maybe_promote(env, journal, host)?;
        }
        Ok(())
    }

    /// Decide one prepared slot from a majority of responses.  Any nack for a superseding promise
    /// dethrones us; otherwise the largest-ballot accepted value (or Nop) goes out under our own
    /// ballot.
    fn decide_slot<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        id: Identifier,
    ) -> Result<(), Error> {
        let Some(votes) = self.data.prepare_responses.remove(&id) else {
            return Ok(());
        };
        let promise = self.data.progress.promised.clone();
        let superseded = votes.values().any(|vote| match vote {
            PrepareVote::Nack(nack) => nack.progress.promised > promise,
            PrepareVote::Ack(_) => false,
        });
        if superseded {
            self.backdown(env, host);
            return Ok(());
        }
        SLOT_DECIDED.click();
        let value = votes
            .values()
            .filter_map(|vote| vote.accepted())
            .max_by(|a, b| a.id.number.cmp(&b.id.number))
            .map(|pv| pv.value.clone())
            .unwrap_or(Value::Nop);
        let id = Identifier {
            from: self.id,
            number: promise,
            slot: id.slot,
        };
        let pv = PValue {
            id: id.clone(),
            value,
        };
        journal.accept(std::slice::from_ref(&pv))?;
        self.open_accept_votes(env, id);
        env.emit(ReplicaMessage::Accept(Accept { pvalue: pv }));
        Ok(())
    }

    /// Decide every prepared slot that already has a majority.  With a cluster of one, the
    /// seeded self-votes are the majority and recovery completes without a single message.
    fn advance_recovery<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
    ) -> Result<(), Error> {
        let ids: Vec<Identifier> = self.data.prepare_responses.keys().cloned().collect();
        for id in ids {
            if self.role != Role::Recoverer {
                return Ok(());
            }
            let majority = self
                .data
                .prepare_responses
                .get(&id)
                .map(|votes| env.majority(self.data.cluster_size, votes.len() as u64))
                .unwrap_or(false);
            if majority {
                self.decide_slot(env, journal, host, id)?;
            }
        }
        self.maybe_promote(env, journal, host)
    }

    /// Promote to leader once every prepared slot has been decided and the slot just past the
    /// committed frontier has a majority of accept acks.  The contiguous prefix beyond it commits
    /// through the leader's commit scan immediately after promotion.
    pub(crate) fn maybe_promote<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
    ) -> Result<(), Error> {
        if self.role != Role::Recoverer || !self.data.prepare_responses.is_empty() {
            return Ok(());
        }
        // Ledgers for slots that committed out from under us are dead weight.
        loop {
            let Some((id, _)) = self.data.accept_responses.first_key_value() else {
                return Ok(());
            };
            if id.slot > self.data.progress.committed.slot {
                break;
            }
            let id = id.clone();
            self.data.accept_responses.remove(&id);
        }
        let next = self.data.progress.committed.slot + 1;
        let Some((id, ledger)) = self.data.accept_responses.first_key_value() else {
            return Ok(());
        };
        if id.slot != next {
            return Ok(());
        }
        let acks = ledger.votes.values().filter(|vote| vote.is_ack()).count() as u64;
        if !env.majority(self.data.cluster_size, acks) {
            return Ok(());
        }
        self.promote_to_leader(env);
        self.commit_scan(env, journal, host)
    }

    fn promote_to_leader(&mut self, env: &mut Env) {
        LEADERSHIP.click();
        clue!(COLLECTOR, INFO, {
            leadership: {
                replica: self.id.index,
                ballot: self.data.progress.promised.number,
            },
        });
        self.role = Role::Leader;
        self.data.epoch = Some(self.data.progress.promised.clone());
        // Announce ourselves above every counter the old leader used, so followers adopt the new
        // evidence immediately.
        self.data.leader_heartbeat += 1;
        env.emit(ReplicaMessage::Heartbeat(Heartbeat {
            counter: self.data.leader_heartbeat,
        }));
        self.data.timeout = env.now() + env.options().heartbeat_interval_ms();
    }

    /// The recoverer's tick:  prepares that still lack a majority go out again, and accepts
    /// whose resend deadline passed go out again.
    pub(crate) fn recoverer_timeout<J: Journal>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
    ) -> Result<(), Error> {
        if env.now() >= self.data.timeout {
            let again: Vec<Identifier> = self
                .data
                .prepare_responses
                .iter()
                .filter(|(_, votes)| {
                    !env.majority(self.data.cluster_size, votes.len() as u64)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in again {
                env.emit(ReplicaMessage::Prepare(Prepare { id }));
            }
            self.data.timeout = env.random_timeout();
        }
        self.resend_expired_accepts(env, journal)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use synod_pb::{PrepareNack, Progress, ReplicaID};

    use crate::agent::testutil::*;
    use crate::dispatch::Address;
    use crate::journal::{Journal, MemoryJournal};

    use super::*;

    fn recovering_agent(
        te: &mut TestEnv,
        journal: &mut MemoryJournal,
        host: &mut TestHost,
        cluster_size: u64,
    ) -> Agent {
        let mut agent = Agent::new(ReplicaID::new(1), Progress::default(), cluster_size);
        let mut env = te.env(0, Address::Replica(ReplicaID::new(1)));
        agent.become_recoverer(&mut env, journal, host).unwrap();
        agent
    }

    #[test]
    fn an_empty_journal_prepares_exactly_one_slot() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(3);
        let mut agent = Agent::new(ReplicaID::new(1), Progress::default(), 3);
        let mut env = te.env(0, Address::Replica(ReplicaID::new(1)));
        agent.become_recoverer(&mut env, &mut journal, &mut host).unwrap();
        let prepares: Vec<&Prepare> = env
            .outbound
            .iter()
            .filter_map(|m| match m {
                ReplicaMessage::Prepare(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(1, prepares.len());
        assert_eq!(1, prepares[0].id.slot);
        assert_eq!(ballot(1, 1), prepares[0].id.number);
    }

    #[test]
    fn accepted_slots_extend_the_prepare_range() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(3);
        journal
            .accept(&[PValue {
                id: identifier(2, ballot(0, 0), 1),
                value: Value::Nop,
            }])
            .unwrap();
        let mut agent = Agent::new(ReplicaID::new(1), Progress::default(), 3);
        let mut env = te.env(0, Address::Replica(ReplicaID::new(1)));
        agent.become_recoverer(&mut env, &mut journal, &mut host).unwrap();
        let slots: Vec<u64> = env
            .outbound
            .iter()
            .filter_map(|m| match m {
                ReplicaMessage::Prepare(p) => Some(p.id.slot),
                _ => None,
            })
            .collect();
        assert_eq!(vec![1, 2], slots);
        assert_eq!(2, agent.data.prepare_responses.len());
    }

    #[test]
    fn recovery_proposes_the_largest_ballot_value() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(3);
        let mut agent = recovering_agent(&mut te, &mut journal, &mut host, 3);
        let prepared = Identifier {
            from: ReplicaID::new(1),
            number: ballot(1, 1),
            slot: 1,
        };
        let ack = PrepareAck {
            id: prepared.clone(),
            from: ReplicaID::new(2),
            progress: Progress::default(),
            max_accepted: 1,
            heartbeat: 0,
            accepted: Some(PValue {
                id: identifier(3, ballot(0, 3), 1),
                value: Value::Command {
                    id: synod_pb::CommandID::BOTTOM,
                    request: vec![0xaa],
                },
            }),
        };
        let mut env = te.env(1, Address::Replica(ReplicaID::new(2)));
        agent
            .on_recovery_response(&mut env, &mut journal, &mut host, PrepareVote::Ack(ack))
            .unwrap();
        let accepts: Vec<&Accept> = env
            .outbound
            .iter()
            .filter_map(|m| match m {
                ReplicaMessage::Accept(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(1, accepts.len());
        assert_eq!(ballot(1, 1), accepts[0].pvalue.id.number);
        match &accepts[0].pvalue.value {
            Value::Command { request, .. } => assert_eq!(vec![0xaa], *request),
            value => panic!("expected the recovered command, got {value:?}"),
        }
        // Our own acceptance went durable before the broadcast.
        assert_eq!(accepts[0].pvalue, journal.accepted(1).unwrap().unwrap());
    }

    #[test]
    fn recovery_proposes_nop_when_nothing_was_accepted() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(3);
        let mut agent = recovering_agent(&mut te, &mut journal, &mut host, 3);
        let prepared = Identifier {
            from: ReplicaID::new(1),
            number: ballot(1, 1),
            slot: 1,
        };
        let ack = PrepareAck {
            id: prepared,
            from: ReplicaID::new(2),
            progress: Progress::default(),
            max_accepted: 0,
            heartbeat: 0,
            accepted: None,
        };
        let mut env = te.env(1, Address::Replica(ReplicaID::new(2)));
        agent
            .on_recovery_response(&mut env, &mut journal, &mut host, PrepareVote::Ack(ack))
            .unwrap();
        assert!(env.outbound.iter().any(|m| matches!(
            m,
            ReplicaMessage::Accept(a) if a.pvalue.value == Value::Nop
        )));
    }

    #[test]
    fn a_superseding_promise_ends_recovery() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(3);
        let mut agent = recovering_agent(&mut te, &mut journal, &mut host, 3);
        let prepared = Identifier {
            from: ReplicaID::new(1),
            number: ballot(1, 1),
            slot: 1,
        };
        let nack = PrepareNack {
            id: prepared,
            from: ReplicaID::new(2),
            progress: Progress {
                promised: ballot(7, 3),
                committed: Identifier::default(),
            },
            max_accepted: 0,
            heartbeat: 0,
        };
        let mut env = te.env(1, Address::Replica(ReplicaID::new(2)));
        agent
            .on_recovery_response(&mut env, &mut journal, &mut host, PrepareVote::Nack(nack))
            .unwrap();
        assert_eq!(Role::Follower, agent.role());
        assert!(agent.data.accept_responses.is_empty());
    }

    #[test]
    fn a_cluster_of_one_elects_itself_on_the_spot() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(1);
        let agent = recovering_agent(&mut te, &mut journal, &mut host, 1);
        assert_eq!(Role::Leader, agent.role());
        assert_eq!(Some(&ballot(1, 1)), agent.epoch());
        assert_eq!(1, agent.progress().committed.slot);
    }

    #[test]
    fn majority_accept_acks_promote_to_leader() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(3);
        let mut agent = recovering_agent(&mut te, &mut journal, &mut host, 3);
        let prepared = Identifier {
            from: ReplicaID::new(1),
            number: ballot(1, 1),
            slot: 1,
        };
        let ack = PrepareAck {
            id: prepared.clone(),
            from: ReplicaID::new(2),
            progress: Progress::default(),
            max_accepted: 0,
            heartbeat: 0,
            accepted: None,
        };
        let mut env = te.env(1, Address::Replica(ReplicaID::new(2)));
        agent
            .on_recovery_response(&mut env, &mut journal, &mut host, PrepareVote::Ack(ack))
            .unwrap();
        assert_eq!(Role::Recoverer, agent.role());
        let accept_ack = synod_pb::AcceptAck {
            id: prepared,
            from: ReplicaID::new(2),
            progress: Progress::default(),
        };
        let mut env = te.env(2, Address::Replica(ReplicaID::new(2)));
        agent
            .on_accept_ack(&mut env, &mut journal, &mut host, accept_ack)
            .unwrap();
        assert_eq!(Role::Leader, agent.role());
        assert_eq!(Some(&ballot(1, 1)), agent.epoch());
        assert_eq!(1, agent.progress().committed.slot);
        assert!(env
            .outbound
            .iter()
            .any(|m| matches!(m, ReplicaMessage::Commit(_))));
    }
}
