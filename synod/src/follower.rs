//! The follower's side of leader liveness.
//!
//! A follower whose timeout expires does not storm into an election.  It first broadcasts a *low
//! prepare*:  a probing prepare under the BOTTOM ballot that no acceptor can promise, so every
//! peer answers with a nack carrying its progress and its freshest heartbeat evidence.  Only when
//! a majority of those answers shows no evidence of a live leader does the follower fail over and
//! start recovery.  The probe is pure reconnaissance; it never touches the journal.

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};

use synod_pb::{Error, Prepare, PrepareNack, ReplicaMessage, RetransmitRequest};

use crate::agent::{max_accepted, Agent, PrepareVote, Role};
use crate::dispatch::Env;
use crate::journal::Journal;
use crate::{Host, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROBE: Counter = Counter::new("synod.follower.probe");
static FAILOVER: Counter = Counter::new("synod.follower.failover");
static FAILOVER_SUPPRESSED: Counter = Counter::new("synod.follower.failover_suppressed");
static FELL_BEHIND: Counter = Counter::new("synod.follower.fell_behind");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PROBE);
    collector.register_counter(&FAILOVER);
    collector.register_counter(&FAILOVER_SUPPRESSED);
    collector.register_counter(&FELL_BEHIND);
}

////////////////////////////////////////// compute_failover ////////////////////////////////////////

/// The failover decision, from the nack evidence a probe gathered.  Returns whether to fail over
/// and the freshest heartbeat counter seen.
///
/// Nacks carrying a heartbeat counter above our own mean someone has heard from a leader more
/// recently than we have.  If a majority of the cluster could still be in contact with that
/// leader, counting the leader itself behind a possible partition, we stand down and adopt the
/// fresher evidence.  Otherwise we fail over and accept the risk of a duel over the certainty of
/// a stalled cluster.
pub fn compute_failover(
    cluster_size: u64,
    leader_heartbeat: u64,
    nack_heartbeats: &[u64],
) -> (bool, u64) {
    let larger: Vec<u64> = nack_heartbeats
        .iter()
        .copied()
        .filter(|&h| h > leader_heartbeat)
        .collect();
    let max_heartbeat = larger.iter().copied().fold(leader_heartbeat, u64::max);
    let failover = larger.is_empty() || larger.len() as u64 + 1 <= cluster_size / 2;
    (failover, max_heartbeat)
}

/////////////////////////////////////////////// Agent //////////////////////////////////////////////

impl Agent {
    /// The follower's timeout:  broadcast the probe, or rebroadcast it if one is already out.
    /// The self-nack counts toward the probe's majority, so the first probe seeds it.
    pub(crate) fn follower_timeout<J: Journal>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
    ) -> Result<(), Error> {
        if env.now() < self.data.timeout {
            return Ok(());
        }
        let probe = Prepare::probe(self.id);
        if !self.data.prepare_responses.contains_key(&probe.id) {
            PROBE.click();
            let nack = PrepareNack {
                id: probe.id.clone(),
                from: self.id,
                progress: self.data.progress.clone(),
                max_accepted: max_accepted(journal)?,
                heartbeat: self.data.leader_heartbeat,
            };
            let mut votes = std::collections::HashMap::new();
            votes.insert(self.id, PrepareVote::Nack(nack));
            self.data.prepare_responses.insert(probe.id.clone(), votes);
        }
        env.emit(ReplicaMessage::Prepare(probe));
        self.data.timeout = env.random_timeout();
        Ok(())
    }

    /// A response to our probe.  A responder that has committed past us means we are the stale
    /// one:  abandon the probe and catch up instead.  Otherwise tally the vote and decide
    /// failover once a strict majority has answered.
    pub(crate) fn on_probe_response<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        vote: PrepareVote,
    ) -> Result<(), Error> {
        let probe_id = Prepare::probe(self.id).id;
        if *vote.id() != probe_id || !self.data.prepare_responses.contains_key(&probe_id) {
            self.unexpected(env, "probe_response");
            return Ok(());
        }
        if vote.progress().committed.slot > self.data.progress.committed.slot {
            FELL_BEHIND.click();
            let to = vote.from();
            let slot = self.data.progress.committed.slot;
            self.backdown(env, host);
            env.emit(ReplicaMessage::RetransmitRequest(RetransmitRequest {
                from: self.id,
                to,
                slot,
            }));
            return Ok(());
        }
        let (count, nack_heartbeats) = {
            let votes = self
                .data
                .prepare_responses
                .entry(probe_id.clone())
                .or_default();
            votes.insert(vote.from(), vote);
            let nack_heartbeats: Vec<u64> = votes
                .values()
                .filter_map(|v| match v {
                    PrepareVote::Nack(nack) => Some(nack.heartbeat),
                    PrepareVote::Ack(_) => None,
                })
                .collect();
            (votes.len() as u64, nack_heartbeats)
        };
        if !env.majority(self.data.cluster_size, count) {
            return Ok(());
        }
        let (failover, max_heartbeat) = compute_failover(
            self.data.cluster_size,
            self.data.leader_heartbeat,
            &nack_heartbeats,
        );
        if !failover {
            FAILOVER_SUPPRESSED.click();
            clue!(COLLECTOR, INFO, {
                failover_suppressed: {
                    replica: self.id.index,
                    heartbeat: max_heartbeat,
                },
            });
            self.data.prepare_responses.clear();
            self.data.leader_heartbeat = max_heartbeat;
            return Ok(());
        }
        FAILOVER.click();
        clue!(COLLECTOR, INFO, {
            failover: {
                replica: self.id.index,
                heartbeat: max_heartbeat,
            },
        });
        debug_assert_eq!(Role::Follower, self.role);
        self.become_recoverer(env, journal, host)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use synod_pb::{Ballot, Identifier, Progress, ReplicaID};

    use crate::agent::testutil::*;
    use crate::dispatch::Address;
    use crate::journal::{Journal, MemoryJournal};

    use super::*;

    #[test]
    fn no_fresher_evidence_means_failover() {
        // Two nacks at or below our own evidence:  the leader is silent for everyone.
        assert_eq!((true, 1000), compute_failover(3, 1000, &[999, 999]));
    }

    #[test]
    fn a_possible_majority_with_the_leader_suppresses_failover() {
        // Both peers heard the leader more recently than we did.  With the leader itself, that
        // could be a functioning majority on the other side of a partition.
        assert_eq!((false, 999), compute_failover(3, 997, &[998, 999]));
    }

    #[test]
    fn a_minority_with_the_leader_does_not_suppress() {
        assert_eq!((true, 999), compute_failover(5, 997, &[999]));
    }

    #[test]
    fn the_probe_is_recorded_once_and_rebroadcast() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut agent = Agent::new(ReplicaID::new(1), Progress::default(), 3);
        let mut env = te.env(0, Address::Replica(ReplicaID::new(1)));
        agent.follower_timeout(&mut env, &mut journal).unwrap();
        assert!(matches!(
            env.outbound.as_slice(),
            [ReplicaMessage::Prepare(_)]
        ));
        let timeout = agent.data.timeout;
        assert!(timeout > 0);
        assert_eq!(1, agent.data.prepare_responses.len());
        // The next timeout rebroadcasts without double-counting the self vote.
        let mut env = te.env(timeout, Address::Replica(ReplicaID::new(1)));
        agent.follower_timeout(&mut env, &mut journal).unwrap();
        assert!(matches!(
            env.outbound.as_slice(),
            [ReplicaMessage::Prepare(_)]
        ));
        let votes = agent.data.prepare_responses.values().next().unwrap();
        assert_eq!(1, votes.len());
    }

    #[test]
    fn a_quiet_majority_triggers_recovery() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(3);
        let mut agent = Agent::new(ReplicaID::new(1), Progress::default(), 3);
        let mut env = te.env(0, Address::Replica(ReplicaID::new(1)));
        agent.follower_timeout(&mut env, &mut journal).unwrap();
        let probe_id = Prepare::probe(ReplicaID::new(1)).id;
        let nack = PrepareNack {
            id: probe_id,
            from: ReplicaID::new(2),
            progress: Progress::default(),
            max_accepted: 0,
            heartbeat: 0,
        };
        let mut env = te.env(1, Address::Replica(ReplicaID::new(2)));
        agent
            .on_probe_response(
                &mut env,
                &mut journal,
                &mut host,
                PrepareVote::Nack(nack),
            )
            .unwrap();
        assert_eq!(Role::Recoverer, agent.role());
        // The promise went durable before the prepares went out.
        let promised = journal.load_progress().unwrap().promised;
        assert_eq!(
            Ballot {
                number: 1,
                leader: ReplicaID::new(1)
            },
            promised
        );
        assert!(matches!(
            env.outbound.as_slice(),
            [ReplicaMessage::Prepare(_)]
        ));
    }

    #[test]
    fn fresh_evidence_from_a_majority_keeps_us_following() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(3);
        let mut agent = Agent::new(ReplicaID::new(1), Progress::default(), 3);
        agent.data.leader_heartbeat = 10;
        let mut env = te.env(0, Address::Replica(ReplicaID::new(1)));
        agent.follower_timeout(&mut env, &mut journal).unwrap();
        let probe_id = Prepare::probe(ReplicaID::new(1)).id;
        for (from, heartbeat) in [(2u64, 11u64), (3, 12)] {
            let nack = PrepareNack {
                id: probe_id.clone(),
                from: ReplicaID::new(from),
                progress: Progress::default(),
                max_accepted: 0,
                heartbeat,
            };
            let mut env = te.env(1, Address::Replica(ReplicaID::new(from)));
            agent
                .on_probe_response(
                    &mut env,
                    &mut journal,
                    &mut host,
                    PrepareVote::Nack(nack),
                )
                .unwrap();
        }
        assert_eq!(Role::Follower, agent.role());
        assert_eq!(12, agent.leader_heartbeat());
        assert!(agent.data.prepare_responses.is_empty());
    }

    #[test]
    fn a_responder_ahead_of_us_turns_the_probe_into_catch_up() {
        let mut te = TestEnv::new();
        let mut journal = MemoryJournal::new();
        let mut host = TestHost::new(3);
        let mut agent = Agent::new(ReplicaID::new(1), Progress::default(), 3);
        let mut env = te.env(0, Address::Replica(ReplicaID::new(1)));
        agent.follower_timeout(&mut env, &mut journal).unwrap();
        let probe_id = Prepare::probe(ReplicaID::new(1)).id;
        let ahead = Progress {
            promised: Ballot {
                number: 3,
                leader: ReplicaID::new(2),
            },
            committed: Identifier {
                from: ReplicaID::new(2),
                number: Ballot {
                    number: 3,
                    leader: ReplicaID::new(2),
                },
                slot: 40,
            },
        };
        let nack = PrepareNack {
            id: probe_id,
            from: ReplicaID::new(2),
            progress: ahead,
            max_accepted: 40,
            heartbeat: 0,
        };
        let mut env = te.env(1, Address::Replica(ReplicaID::new(2)));
        agent
            .on_probe_response(
                &mut env,
                &mut journal,
                &mut host,
                PrepareVote::Nack(nack),
            )
            .unwrap();
        assert_eq!(Role::Follower, agent.role());
        assert!(agent.data.prepare_responses.is_empty());
        match &env.outbound[0] {
            ReplicaMessage::RetransmitRequest(req) => {
                assert_eq!(ReplicaID::new(2), req.to);
                assert_eq!(0, req.slot);
            }
            msg => panic!("expected RetransmitRequest, got {msg:?}"),
        }
    }
}
