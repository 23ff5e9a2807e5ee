//! Leading:  sequencing client commands and driving them to commit.
//!
//! The leader owes every slot it opens an eventual commit or an eventual LostLeadership.  Intake
//! journals the leader's own acceptance before anything reaches the wire, the commit scan only
//! advances the committed frontier through contiguous majority-acked slots, and a majority of
//! nacks is the cluster telling the leader its reign is over.

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};

use synod_pb::{
    Accept, AcceptAck, AcceptNack, ClientCommand, Commit, Error, Heartbeat, Identifier, NotLeader,
    PValue, ReplicaMessage,
};
use zerror_core::ErrorCore;

use crate::agent::{Agent, AcceptVote, PendingCommand, Role};
use crate::dispatch::{Address, Env};
use crate::journal::Journal;
use crate::{Host, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static INTAKE: Counter = Counter::new("synod.leader.intake");
static COMMIT: Counter = Counter::new("synod.leader.commit");
static HEARTBEAT: Counter = Counter::new("synod.leader.heartbeat");
static DETHRONED: Counter = Counter::new("synod.leader.dethroned");
static MISROUTED: Counter = Counter::new("synod.leader.misrouted");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&INTAKE);
    collector.register_counter(&COMMIT);
    collector.register_counter(&HEARTBEAT);
    collector.register_counter(&DETHRONED);
    collector.register_counter(&MISROUTED);
}

/////////////////////////////////////////////// Agent //////////////////////////////////////////////

impl Agent {
    /// A client command arrived.  A leader sequences it into the next free slot; everyone else
    /// points the client elsewhere.
    pub(crate) fn on_client_command<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        m: ClientCommand,
    ) -> Result<(), Error> {
        let token = match env.sender() {
            Address::Client(token) => token,
            Address::Replica(_) => {
                self.unexpected(env, "client_command");
                return Ok(());
            }
        };
        let epoch = match (&self.role, &self.data.epoch) {
            (Role::Leader, Some(epoch)) => epoch.clone(),
            _ => {
                MISROUTED.click();
                env.emit(ReplicaMessage::NotLeader(NotLeader {
                    from: self.id,
                    command: m.value.command_id(),
                }));
                return Ok(());
            }
        };
        let mut slot = self.data.progress.committed.slot;
        if let Some((id, _)) = self.data.accept_responses.last_key_value() {
            slot = std::cmp::max(slot, id.slot);
        }
        if let Some((id, _)) = self.data.client_commands.last_key_value() {
            slot = std::cmp::max(slot, id.slot);
        }
        let id = Identifier {
            from: self.id,
            number: epoch,
            slot: slot + 1,
        };
        let pv = PValue {
            id: id.clone(),
            value: m.value.clone(),
        };
        journal.accept(std::slice::from_ref(&pv))?;
        INTAKE.click();
        self.data.client_commands.insert(
            id.clone(),
            PendingCommand {
                value: m.value,
                token,
            },
        );
        self.open_accept_votes(env, id);
        env.emit(ReplicaMessage::Accept(Accept { pvalue: pv }));
        self.commit_scan(env, journal, host)
    }

    pub(crate) fn on_accept_ack<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        m: AcceptAck,
    ) -> Result<(), Error> {
        if self.role == Role::Follower {
            self.unexpected(env, "accept_ack");
            return Ok(());
        }
        let from = m.from;
        let Some(ledger) = self.data.accept_responses.get_mut(&m.id) else {
            self.unexpected(env, "accept_ack");
            return Ok(());
        };
        ledger.votes.insert(from, AcceptVote::Ack(m));
        match self.role {
            Role::Recoverer => self.maybe_promote(env, journal, host),
            Role::Leader => self.commit_scan(env, journal, host),
            Role::Follower => Ok(()),
        }
    }

    /// An accept nack always means the sender promised a superseding ballot.  A recoverer gives
    /// up immediately; an established leader holds out until a majority says so, because one
    /// stale straggler should not dethrone a healthy reign.
    pub(crate) fn on_accept_nack<H: Host>(
        &mut self,
        env: &mut Env,
        host: &mut H,
        m: AcceptNack,
    ) -> Result<(), Error> {
        match self.role {
            Role::Follower => {
                self.unexpected(env, "accept_nack");
                Ok(())
            }
            Role::Recoverer => {
                if m.progress.promised > self.data.progress.promised {
                    self.backdown(env, host);
                }
                Ok(())
            }
            Role::Leader => {
                let from = m.from;
                let Some(ledger) = self.data.accept_responses.get_mut(&m.id) else {
                    self.unexpected(env, "accept_nack");
                    return Ok(());
                };
                ledger.votes.insert(from, AcceptVote::Nack(m));
                let nacks = ledger.votes.values().filter(|vote| !vote.is_ack()).count() as u64;
                if env.majority(self.data.cluster_size, nacks) {
                    DETHRONED.click();
                    clue!(COLLECTOR, INFO, {
                        dethroned: {
                            replica: self.id.index,
                        },
                    });
                    self.backdown(env, host);
                }
                Ok(())
            }
        }
    }

    /// Commit every contiguous majority-acked slot just past the committed frontier:  broadcast
    /// the commit, deliver locally, and once the progress write lands, answer the waiting
    /// clients.
    pub(crate) fn commit_scan<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
    ) -> Result<(), Error> {
        let mut replies = Vec::new();
        let mut delivered = false;
        loop {
            let next = self.data.progress.committed.slot + 1;
            let Some((id, ledger)) = self.data.accept_responses.first_key_value() else {
                break;
            };
            if id.slot < next {
                let id = id.clone();
                self.data.accept_responses.remove(&id);
                continue;
            }
            if id.slot > next {
                break;
            }
            let acks = ledger.votes.values().filter(|vote| vote.is_ack()).count() as u64;
            if !env.majority(self.data.cluster_size, acks) {
                break;
            }
            let id = id.clone();
            self.data.accept_responses.remove(&id);
            let Some(pv) = journal.accepted(next)? else {
                return Err(Error::MissingAccept {
                    core: ErrorCore::default(),
                    slot: next,
                });
            };
            COMMIT.click();
            env.emit(ReplicaMessage::Commit(Commit { id }));
            if let Some(reply) = self.deliver_one(host, &pv)? {
                replies.push(reply);
            }
            delivered = true;
        }
        if delivered {
            journal.save_progress(&self.data.progress)?;
        }
        for (token, response) in replies {
            host.respond(token, Ok(response));
        }
        Ok(())
    }

    /// The leader's tick:  heartbeat on schedule, and rebroadcast accepts that have waited too
    /// long for their majority.
    pub(crate) fn leader_timeout<J: Journal>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
    ) -> Result<(), Error> {
        if env.now() >= self.data.timeout {
            HEARTBEAT.click();
            self.data.leader_heartbeat += 1;
            env.emit(ReplicaMessage::Heartbeat(Heartbeat {
                counter: self.data.leader_heartbeat,
            }));
            self.data.timeout = env.now() + env.options().heartbeat_interval_ms();
        }
        self.resend_expired_accepts(env, journal)
    }

    pub(crate) fn resend_expired_accepts<J: Journal>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
    ) -> Result<(), Error> {
        let expired: Vec<Identifier> = self
            .data
            .accept_responses
            .iter()
            .filter(|(_, ledger)| ledger.resend_at <= env.now())
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let Some(pv) = journal.accepted(id.slot)? else {
                return Err(Error::MissingAccept {
                    core: ErrorCore::default(),
                    slot: id.slot,
                });
            };
            env.emit(ReplicaMessage::Accept(Accept { pvalue: pv }));
            if let Some(ledger) = self.data.accept_responses.get_mut(&id) {
                ledger.resend_at = env.random_timeout();
            }
        }
        Ok(())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
