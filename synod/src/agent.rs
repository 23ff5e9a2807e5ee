//! The consensus state machine.
//!
//! One [Agent] per replica.  The agent is exclusively owned by the dispatcher; every handler runs
//! synchronously against it, writes through the journal before its messages leave the process,
//! and never blocks.  Handlers for the probing, recovery, and leading phases live in the
//! [crate::follower], [crate::recoverer], and [crate::leader] modules; this module owns the data
//! model, the acceptor logic every role shares, commit delivery, and backdown.

use std::collections::{BTreeMap, HashMap};

use biometrics::{Collector, Counter};
use indicio::{clue, DEBUG, ERROR, INFO};
use zerror_core::ErrorCore;

use synod_pb::{
    Accept, AcceptAck, AcceptNack, Ballot, Commit, Error, Heartbeat, Identifier, PValue, Prepare,
    PrepareAck, PrepareNack, Progress, ReplicaID, ReplicaMessage, ReplyToken, RetransmitRequest,
    RetransmitResponse, Value,
};

use crate::dispatch::Env;
use crate::journal::Journal;
use crate::retransmit;
use crate::{Host, Payload, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static BACKDOWN: Counter = Counter::new("synod.agent.backdown");
static DELIVER: Counter = Counter::new("synod.agent.deliver");
static UNEXPECTED_MESSAGE: Counter = Counter::new("synod.agent.unexpected_message");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&BACKDOWN);
    collector.register_counter(&DELIVER);
    collector.register_counter(&UNEXPECTED_MESSAGE);
}

/////////////////////////////////////////////// Role ///////////////////////////////////////////////

/// The three phases a replica moves through.  Every replica boots a Follower; a Follower whose
/// patience runs out and whose probe finds no heartbeat evidence becomes a Recoverer; a Recoverer
/// that completes recovery becomes the Leader.  Any role that observes a superseding ballot backs
/// down to Follower.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Role {
    #[default]
    Follower,
    Recoverer,
    Leader,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Recoverer => "recoverer",
            Role::Leader => "leader",
        }
    }
}

//////////////////////////////////////////// PrepareVote ///////////////////////////////////////////

/// One replica's answer to an outstanding prepare.
#[derive(Clone, Debug)]
pub enum PrepareVote {
    Ack(PrepareAck),
    Nack(PrepareNack),
}

impl PrepareVote {
    pub fn id(&self) -> &Identifier {
        match self {
            PrepareVote::Ack(ack) => &ack.id,
            PrepareVote::Nack(nack) => &nack.id,
        }
    }

    pub fn from(&self) -> ReplicaID {
        match self {
            PrepareVote::Ack(ack) => ack.from,
            PrepareVote::Nack(nack) => nack.from,
        }
    }

    pub fn progress(&self) -> &Progress {
        match self {
            PrepareVote::Ack(ack) => &ack.progress,
            PrepareVote::Nack(nack) => &nack.progress,
        }
    }

    pub fn heartbeat(&self) -> u64 {
        match self {
            PrepareVote::Ack(ack) => ack.heartbeat,
            PrepareVote::Nack(nack) => nack.heartbeat,
        }
    }

    pub fn accepted(&self) -> Option<&PValue> {
        match self {
            PrepareVote::Ack(ack) => ack.accepted.as_ref(),
            PrepareVote::Nack(_) => None,
        }
    }
}

///////////////////////////////////////////// AcceptVote ///////////////////////////////////////////

/// One replica's answer to an outstanding accept.
#[derive(Clone, Debug)]
pub enum AcceptVote {
    Ack(AcceptAck),
    Nack(AcceptNack),
}

impl AcceptVote {
    pub fn is_ack(&self) -> bool {
        matches!(self, AcceptVote::Ack(_))
    }
}

//////////////////////////////////////////// AcceptVotes ///////////////////////////////////////////

/// The votes gathered for one accept, plus the tick at which the accept gets rebroadcast.
#[derive(Clone, Debug)]
pub struct AcceptVotes {
    pub resend_at: u64,
    pub votes: HashMap<ReplicaID, AcceptVote>,
}

/////////////////////////////////////////// PendingCommand /////////////////////////////////////////

/// A client command the leader has proposed but not yet committed.  `token` routes the reply.
#[derive(Clone, Debug)]
pub struct PendingCommand {
    pub value: Value,
    pub token: ReplyToken,
}

///////////////////////////////////////////// PaxosData ////////////////////////////////////////////

/// Everything a replica knows.  Only `progress` is durable; the rest reconstructs from the wire
/// after a restart.
#[derive(Clone, Debug, Default)]
pub struct PaxosData {
    pub(crate) progress: Progress,
    pub(crate) cluster_size: u64,
    /// The highest heartbeat counter observed from any leader.  Evidence, not a clock.
    pub(crate) leader_heartbeat: u64,
    /// The tick at which the current role times out.
    pub(crate) timeout: u64,
    pub(crate) prepare_responses: BTreeMap<Identifier, HashMap<ReplicaID, PrepareVote>>,
    /// The promise this replica made to itself when it became leader.
    pub(crate) epoch: Option<Ballot>,
    pub(crate) accept_responses: BTreeMap<Identifier, AcceptVotes>,
    pub(crate) client_commands: BTreeMap<Identifier, PendingCommand>,
}

/////////////////////////////////////////////// Agent //////////////////////////////////////////////

/// One replica's consensus engine.
#[derive(Clone, Debug)]
pub struct Agent {
    pub(crate) id: ReplicaID,
    pub(crate) role: Role,
    pub(crate) data: PaxosData,
}

impl Agent {
    /// A freshly booted agent:  a follower with the journal's progress and empty vote state.
    pub fn new(id: ReplicaID, progress: Progress, cluster_size: u64) -> Self {
        Self {
            id,
            role: Role::Follower,
            data: PaxosData {
                progress,
                cluster_size,
                ..PaxosData::default()
            },
        }
    }

    pub fn id(&self) -> ReplicaID {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn progress(&self) -> &Progress {
        &self.data.progress
    }

    pub fn epoch(&self) -> Option<&Ballot> {
        self.data.epoch.as_ref()
    }

    pub fn leader_heartbeat(&self) -> u64 {
        self.data.leader_heartbeat
    }

    /// Route one message to the handler for the current role.
    pub(crate) fn process<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        msg: ReplicaMessage,
    ) -> Result<(), Error> {
        match msg {
            ReplicaMessage::Prepare(m) => self.on_prepare(env, journal, host, m),
            ReplicaMessage::PrepareAck(m) => {
                self.on_prepare_response(env, journal, host, PrepareVote::Ack(m))
            }
            ReplicaMessage::PrepareNack(m) => {
                self.on_prepare_response(env, journal, host, PrepareVote::Nack(m))
            }
            ReplicaMessage::Accept(m) => self.on_accept(env, journal, host, m),
            ReplicaMessage::AcceptAck(m) => self.on_accept_ack(env, journal, host, m),
            ReplicaMessage::AcceptNack(m) => self.on_accept_nack(env, host, m),
            ReplicaMessage::Commit(m) => self.on_commit(env, journal, host, m),
            ReplicaMessage::Heartbeat(m) => {
                self.on_heartbeat(env, m);
                Ok(())
            }
            ReplicaMessage::RetransmitRequest(m) => self.on_retransmit_request(env, journal, m),
            ReplicaMessage::RetransmitResponse(m) => {
                self.on_retransmit_response(env, journal, host, m)
            }
            ReplicaMessage::NotLeader(_) => {
                // Replicas never address each other with this; something is confused.
                UNEXPECTED_MESSAGE.click();
                clue!(COLLECTOR, ERROR, {
                    unknown_message: {
                        replica: self.id.index,
                        kind: "not_leader",
                    },
                });
                Ok(())
            }
            ReplicaMessage::ClientCommand(m) => self.on_client_command(env, journal, host, m),
        }
    }

    /// Route a timer tick to the handler for the current role.
    pub(crate) fn check_timeout<J: Journal>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
    ) -> Result<(), Error> {
        match self.role {
            Role::Follower => self.follower_timeout(env, journal),
            Role::Recoverer => self.recoverer_timeout(env, journal),
            Role::Leader => self.leader_timeout(env, journal),
        }
    }

    fn on_prepare_response<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        vote: PrepareVote,
    ) -> Result<(), Error> {
        match self.role {
            Role::Follower => self.on_probe_response(env, journal, host, vote),
            Role::Recoverer => self.on_recovery_response(env, journal, host, vote),
            Role::Leader => {
                self.unexpected(env, "prepare_response");
                Ok(())
            }
        }
    }

    /// Standard promise logic, every role.  A superseding prepare dethrones a recoverer or leader
    /// before the promise is considered.
    fn on_prepare<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        m: Prepare,
    ) -> Result<(), Error> {
        let id = m.id;
        if self.role != Role::Follower && id.number > self.data.progress.promised {
            self.backdown(env, host);
        }
        let max_accepted = max_accepted(journal)?;
        if id.number > self.data.progress.promised {
            self.data.progress.promised = id.number.clone();
            journal.save_progress(&self.data.progress)?;
            let accepted = journal.accepted(id.slot)?;
            env.emit(ReplicaMessage::PrepareAck(PrepareAck {
                id,
                from: self.id,
                progress: self.data.progress.clone(),
                max_accepted,
                heartbeat: self.data.leader_heartbeat,
                accepted,
            }));
        } else {
            env.emit(ReplicaMessage::PrepareNack(PrepareNack {
                id,
                from: self.id,
                progress: self.data.progress.clone(),
                max_accepted,
                heartbeat: self.data.leader_heartbeat,
            }));
        }
        Ok(())
    }

    /// Standard accept logic, every role.  The promise write, when the accept raises the promise,
    /// and the accept write itself both land before the ack is emitted.
    fn on_accept<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        m: Accept,
    ) -> Result<(), Error> {
        let pv = m.pvalue;
        let id = pv.id.clone();
        if self.role != Role::Follower && id.number > self.data.progress.promised {
            self.backdown(env, host);
        }
        if id.number >= self.data.progress.promised {
            if id.number > self.data.progress.promised {
                self.data.progress.promised = id.number.clone();
                journal.save_progress(&self.data.progress)?;
            }
            journal.accept(std::slice::from_ref(&pv))?;
            env.emit(ReplicaMessage::AcceptAck(AcceptAck {
                id,
                from: self.id,
                progress: self.data.progress.clone(),
            }));
        } else {
            env.emit(ReplicaMessage::AcceptNack(AcceptNack {
                id,
                from: self.id,
                progress: self.data.progress.clone(),
            }));
        }
        Ok(())
    }

    /// Advance the committed frontier toward `m.id`.  Only journal entries that carry the
    /// committing ballot are trustworthy:  an entry from a dead ballot may differ from what the
    /// cluster committed, so the walk stops there and asks the committer to retransmit.
    fn on_commit<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        m: Commit,
    ) -> Result<(), Error> {
        let id = m.id;
        if self.role != Role::Follower && id.number > self.data.progress.promised {
            self.backdown(env, host);
        }
        if id.slot <= self.data.progress.committed.slot {
            return Ok(());
        }
        let mut replies = Vec::new();
        let mut delivered = false;
        while self.data.progress.committed.slot < id.slot {
            let next = self.data.progress.committed.slot + 1;
            let Some(pv) = journal.accepted(next)? else {
                break;
            };
            if pv.id.number != id.number {
                break;
            }
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
        if self.data.progress.committed.slot < id.slot {
            if let Some(to) = env.sender_replica() {
                env.emit(ReplicaMessage::RetransmitRequest(RetransmitRequest {
                    from: self.id,
                    to,
                    slot: self.data.progress.committed.slot,
                }));
            }
        }
        Ok(())
    }

    /// Heartbeats are evidence that a leader lives.  Only followers consume them; recoverers and
    /// leaders settle their disputes with ballots.
    fn on_heartbeat(&mut self, env: &mut Env, m: Heartbeat) {
        if self.role == Role::Follower && m.counter > self.data.leader_heartbeat {
            self.data.leader_heartbeat = m.counter;
            self.data.timeout = env.random_timeout();
        }
    }

    fn on_retransmit_request<J: Journal>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        m: RetransmitRequest,
    ) -> Result<(), Error> {
        let committed_slot = self.data.progress.committed.slot;
        match retransmit::build_response(journal, committed_slot, m.slot)? {
            Some(state) => {
                env.emit(ReplicaMessage::RetransmitResponse(RetransmitResponse {
                    from: self.id,
                    to: m.from,
                    committed: state.committed,
                    uncommitted: state.uncommitted,
                }));
            }
            None => {
                clue!(COLLECTOR, DEBUG, {
                    retransmit_out_of_range: {
                        requester: m.from.index,
                        from_slot: m.slot,
                    },
                });
            }
        }
        Ok(())
    }

    /// Apply a retransmit response:  deliver the contiguous committable prefix, persist the new
    /// progress, then journal whatever accepts the (possibly raised) promise allows.  That order
    /// is load-bearing.  Delivering before the progress write keeps a crash from forgetting a
    /// committed value; the dedupe id shields the host from the resulting re-delivery.
    fn on_retransmit_response<J: Journal, H: Host>(
        &mut self,
        env: &mut Env,
        journal: &mut J,
        host: &mut H,
        m: RetransmitResponse,
    ) -> Result<(), Error> {
        if self.role != Role::Follower {
            self.unexpected(env, "retransmit_response");
            return Ok(());
        }
        let prefix = retransmit::contiguous_committable(&self.data.progress.committed, &m.committed);
        if prefix < m.committed.len() {
            clue!(COLLECTOR, DEBUG, {
                retransmit_truncated: {
                    usable: prefix as u64,
                    sent: m.committed.len() as u64,
                },
            });
        }
        let mut replies = Vec::new();
        for pv in &m.committed[..prefix] {
            if let Some(reply) = self.deliver_one(host, pv)? {
                replies.push(reply);
            }
        }
        let mut promised = self.data.progress.promised.clone();
        for pv in m.committed.iter().chain(m.uncommitted.iter()) {
            if pv.id.number > promised {
                promised = pv.id.number.clone();
            }
        }
        let changed = prefix > 0 || promised > self.data.progress.promised;
        self.data.progress.promised = promised.clone();
        if changed {
            journal.save_progress(&self.data.progress)?;
        }
        let acceptable: Vec<PValue> = m
            .committed
            .into_iter()
            .chain(m.uncommitted)
            .filter(|pv| pv.id.number >= promised)
            .collect();
        if !acceptable.is_empty() {
            journal.accept(&acceptable)?;
        }
        for (token, response) in replies {
            host.respond(token, Ok(response));
        }
        Ok(())
    }

    /// Deliver one committed PValue to the host and advance the committed frontier.  Returns the
    /// client reply to send once the progress write lands.
    pub(crate) fn deliver_one<H: Host>(
        &mut self,
        host: &mut H,
        pv: &PValue,
    ) -> Result<Option<(ReplyToken, Vec<u8>)>, Error> {
        DELIVER.click();
        let response = match &pv.value {
            Value::Nop => None,
            Value::Command { request, .. } => Some(host.deliver(Payload {
                delivery_id: pv.id.slot,
                request: request.clone(),
            })),
            Value::Reconfigure { .. } => {
                return Err(Error::NotYetImplemented {
                    core: ErrorCore::default(),
                    what: "membership change delivery".to_owned(),
                });
            }
        };
        self.data.progress.committed = pv.id.clone();
        let pending = self.data.client_commands.remove(&pv.id);
        match (pending, response) {
            (Some(pending), Some(response)) => Ok(Some((pending.token, response))),
            (Some(pending), None) => Ok(Some((pending.token, Vec::new()))),
            _ => Ok(None),
        }
    }

    /// Open the vote ledger for an accept this replica just journaled, seeded with its own ack.
    pub(crate) fn open_accept_votes(&mut self, env: &mut Env, id: Identifier) {
        let mut votes = HashMap::new();
        votes.insert(
            self.id,
            AcceptVote::Ack(AcceptAck {
                id: id.clone(),
                from: self.id,
                progress: self.data.progress.clone(),
            }),
        );
        self.data.accept_responses.insert(
            id,
            AcceptVotes {
                resend_at: env.random_timeout(),
                votes,
            },
        );
    }

    /// Return to Follower.  Outstanding votes are forgotten, waiting clients are told to retry
    /// elsewhere, and the heartbeat evidence survives untouched.
    pub(crate) fn backdown<H: Host>(&mut self, env: &mut Env, host: &mut H) {
        BACKDOWN.click();
        clue!(COLLECTOR, INFO, {
            backdown: {
                replica: self.id.index,
                role: self.role.as_str(),
                abandoned_commands: self.data.client_commands.len() as u64,
            },
        });
        self.role = Role::Follower;
        self.data.prepare_responses.clear();
        self.data.accept_responses.clear();
        for (_, pending) in std::mem::take(&mut self.data.client_commands) {
            host.respond(
                pending.token,
                Err(Error::LostLeadership {
                    core: ErrorCore::default(),
                    replica: self.id,
                    command: pending.value.command_id(),
                }),
            );
        }
        self.data.epoch = None;
        self.data.timeout = env.random_timeout();
    }

    pub(crate) fn unexpected(&self, _env: &Env, kind: &'static str) {
        UNEXPECTED_MESSAGE.click();
        clue!(COLLECTOR, DEBUG, {
            unexpected_message: {
                replica: self.id.index,
                role: self.role.as_str(),
                kind: kind,
            },
        });
    }
}

/////////////////////////////////////////////// utils //////////////////////////////////////////////

pub(crate) fn max_accepted<J: Journal>(journal: &mut J) -> Result<u64, Error> {
    Ok(journal.bounds()?.map(|(_, max)| max).unwrap_or(0))
}

////////////////////////////////////////////// testutil ////////////////////////////////////////////

#[cfg(test)]
pub(crate) mod testutil {
    use guacamole::Guacamole;

    use crate::dispatch::{Address, Env};
    use crate::quorum::SimpleMajority;
    use crate::{Host, Payload, SynodOptions};

    use super::*;

    /// A host that records everything the core tells it.
    #[derive(Debug, Default)]
    pub(crate) struct TestHost {
        pub cluster_size: u64,
        pub delivered: Vec<Payload>,
        pub responses: Vec<(ReplyToken, Result<Vec<u8>, Error>)>,
    }

    impl TestHost {
        pub(crate) fn new(cluster_size: u64) -> Self {
            Self {
                cluster_size,
                ..Self::default()
            }
        }
    }

    impl Host for TestHost {
        fn cluster_size(&self) -> u64 {
            self.cluster_size
        }

        fn deliver(&mut self, payload: Payload) -> Vec<u8> {
            let response = payload.request.clone();
            self.delivered.push(payload);
            response
        }

        fn respond(&mut self, token: ReplyToken, response: Result<Vec<u8>, Error>) {
            self.responses.push((token, response));
        }
    }

    /// Owns everything an [Env] borrows so tests can mint one per event.
    pub(crate) struct TestEnv {
        options: SynodOptions,
        quorum: SimpleMajority,
        guac: Guacamole,
    }

    impl TestEnv {
        pub(crate) fn new() -> Self {
            Self {
                options: SynodOptions::default(),
                quorum: SimpleMajority,
                guac: Guacamole::new(0x1eaf),
            }
        }

        pub(crate) fn env(&mut self, now: u64, from: Address) -> Env<'_> {
            Env {
                now,
                from,
                options: &self.options,
                quorum: &self.quorum,
                guac: &mut self.guac,
                outbound: Vec::new(),
            }
        }
    }

    pub(crate) fn ballot(number: u64, leader: u64) -> Ballot {
        Ballot {
            number,
            leader: ReplicaID::new(leader),
        }
    }

    pub(crate) fn identifier(from: u64, number: Ballot, slot: u64) -> Identifier {
        Identifier {
            from: ReplicaID::new(from),
            number,
            slot,
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
