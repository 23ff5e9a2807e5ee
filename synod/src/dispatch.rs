//! The event pump.
//!
//! The dispatcher owns the agent, the journal, and the host, and feeds them one event at a time:
//! a message with its sender, or a timer tick.  Handlers buffer their outbound messages in an
//! [Env]; once a handler returns, the dispatcher classifies each buffered message as a direct
//! reply to the triggering sender or as a broadcast, and hands the batch back to the transport.
//! Because handlers call the journal synchronously, every journal write from an event is durable
//! before any message from that event reaches the wire, and the next event sees the settled
//! agent.
//!
//! A handler error is a replica death:  the dispatcher marks itself halted and refuses further
//! events, and the process restarts from the journal.

use biometrics::{Collector, Counter};
use guacamole::combinators::any;
use guacamole::Guacamole;
use indicio::{clue, ERROR};
use tatl::{HeyListen, Stationary};
use zerror::Z;
use zerror_core::ErrorCore;

use synod_pb::{Error, ReplicaID, ReplicaMessage, ReplyToken};

use crate::agent::Agent;
use crate::journal::Journal;
use crate::quorum::{QuorumStrategy, SimpleMajority};
use crate::{Host, SynodOptions, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static MESSAGES: Counter = Counter::new("synod.dispatch.messages");
static TICKS: Counter = Counter::new("synod.dispatch.ticks");
static HALTED: Counter = Counter::new("synod.dispatch.halted");
static HALTED_MONITOR: Stationary = Stationary::new("synod.dispatch.halted", &HALTED);

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&MESSAGES);
    collector.register_counter(&TICKS);
    collector.register_counter(&HALTED);
}

/// Registers this module's monitors with the provided HeyListen.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&HALTED_MONITOR);
}

////////////////////////////////////////////// Address /////////////////////////////////////////////

/// Where an event came from, and therefore where a direct reply goes.  Replicas are addressed by
/// their stable index; clients by the opaque token the transport minted for their connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Address {
    Replica(ReplicaID),
    Client(ReplyToken),
}

/////////////////////////////////////////////// Route //////////////////////////////////////////////

/// How an outbound message travels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    /// To the sender of the event that produced it.
    Direct,
    /// To every cluster member.  The core never relies on hearing its own broadcasts; every
    /// vote-opening path records its own vote up front.
    Broadcast,
}

/// Classify an outbound message.  Answers go back where the question came from; questions go to
/// everyone.
pub fn route(msg: &ReplicaMessage) -> Route {
    match msg {
        ReplicaMessage::PrepareAck(_)
        | ReplicaMessage::PrepareNack(_)
        | ReplicaMessage::AcceptAck(_)
        | ReplicaMessage::AcceptNack(_)
        | ReplicaMessage::RetransmitRequest(_)
        | ReplicaMessage::RetransmitResponse(_)
        | ReplicaMessage::NotLeader(_) => Route::Direct,
        ReplicaMessage::Prepare(_)
        | ReplicaMessage::Accept(_)
        | ReplicaMessage::Commit(_)
        | ReplicaMessage::Heartbeat(_)
        | ReplicaMessage::ClientCommand(_) => Route::Broadcast,
    }
}

///////////////////////////////////////////// Outbound /////////////////////////////////////////////

/// One message the transport must carry.
#[derive(Clone, Debug)]
pub enum Outbound {
    Direct { to: Address, msg: ReplicaMessage },
    Broadcast { msg: ReplicaMessage },
}

/////////////////////////////////////////////// Env ////////////////////////////////////////////////

/// Everything a handler may consult or affect besides the agent, the journal, and the host:  the
/// tick clock, the timeout RNG, the quorum strategy, and the send buffer.
pub struct Env<'a> {
    pub(crate) now: u64,
    pub(crate) from: Address,
    pub(crate) options: &'a SynodOptions,
    pub(crate) quorum: &'a dyn QuorumStrategy,
    pub(crate) guac: &'a mut Guacamole,
    pub(crate) outbound: Vec<ReplicaMessage>,
}

impl<'a> Env<'a> {
    /// The tick at which this event fired.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// The sender of the triggering event.
    pub fn sender(&self) -> Address {
        self.from
    }

    /// The sender, when it was a replica.
    pub fn sender_replica(&self) -> Option<ReplicaID> {
        match self.from {
            Address::Replica(id) => Some(id),
            Address::Client(_) => None,
        }
    }

    /// Buffer an outbound message.  The dispatcher routes it after the handler returns.
    pub fn emit(&mut self, msg: ReplicaMessage) {
        self.outbound.push(msg);
    }

    /// A fresh absolute timeout, drawn uniformly from the configured window.  Randomness keeps
    /// dueling probers from synchronizing.
    pub fn random_timeout(&mut self) -> u64 {
        let min = self.options.leader_timeout_min_ms;
        let max = self.options.leader_timeout_max_ms;
        let span = std::cmp::max(1, max.saturating_sub(min));
        self.now + min + any::<u64>(self.guac) % span
    }

    /// Whether `votes` constitute a quorum of `cluster_size`.
    pub fn majority(&self, cluster_size: u64, votes: u64) -> bool {
        self.quorum.assent(cluster_size, votes)
    }

    pub(crate) fn options(&self) -> &SynodOptions {
        self.options
    }
}

///////////////////////////////////////////// Dispatcher ///////////////////////////////////////////

/// One replica's event pump.  Single-threaded and cooperative:  feed it events, transmit what it
/// returns.
pub struct Dispatcher<J: Journal, H: Host> {
    options: SynodOptions,
    quorum: Box<dyn QuorumStrategy + Send>,
    agent: Agent,
    journal: J,
    host: H,
    guac: Guacamole,
    halted: bool,
}

impl<J: Journal, H: Host> Dispatcher<J, H> {
    /// Boot a replica from its journal, seeding the timeout RNG from urandom.
    pub fn new(options: SynodOptions, id: ReplicaID, journal: J, host: H) -> Result<Self, Error> {
        let seed = match one_two_eight::urandom() {
            Some(bytes) => u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            None => {
                return Err(Error::SystemError {
                    core: ErrorCore::default(),
                    what: "urandom unavailable".to_owned(),
                })
                .with_info("context", "seeding election timeouts");
            }
        };
        Self::seeded(options, id, journal, host, seed)
    }

    /// Boot a replica with a caller-chosen RNG seed.  Deterministic seeds belong in tests;
    /// production timeouts must be unpredictable or duels stop resolving.
    pub fn seeded(
        options: SynodOptions,
        id: ReplicaID,
        mut journal: J,
        host: H,
        seed: u64,
    ) -> Result<Self, Error> {
        let progress = journal.load_progress()?;
        let agent = Agent::new(id, progress, host.cluster_size());
        Ok(Self {
            options,
            quorum: Box::new(SimpleMajority),
            agent,
            journal,
            host,
            guac: Guacamole::new(seed),
            halted: false,
        })
    }

    /// Substitute a quorum strategy.  Must happen before any event is pumped or quorum decisions
    /// will be inconsistent.
    pub fn with_quorum(mut self, quorum: Box<dyn QuorumStrategy + Send>) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut J {
        &mut self.journal
    }

    /// Pump one message event.
    pub fn handle(
        &mut self,
        now: u64,
        from: Address,
        msg: ReplicaMessage,
    ) -> Result<Vec<Outbound>, Error> {
        MESSAGES.click();
        self.pump(now, from, Some(msg))
    }

    /// Pump one timer tick.
    pub fn tick(&mut self, now: u64) -> Result<Vec<Outbound>, Error> {
        TICKS.click();
        self.pump(now, Address::Replica(self.agent.id()), None)
    }

    fn pump(
        &mut self,
        now: u64,
        from: Address,
        msg: Option<ReplicaMessage>,
    ) -> Result<Vec<Outbound>, Error> {
        if self.halted {
            return Err(Error::SystemError {
                core: ErrorCore::default(),
                what: "dispatcher halted by an earlier fatal error".to_owned(),
            });
        }
        self.agent.data.cluster_size = self.host.cluster_size();
        let mut env = Env {
            now,
            from,
            options: &self.options,
            quorum: &*self.quorum,
            guac: &mut self.guac,
            outbound: Vec::new(),
        };
        let result = match msg {
            Some(msg) => self
                .agent
                .process(&mut env, &mut self.journal, &mut self.host, msg),
            None => self.agent.check_timeout(&mut env, &mut self.journal),
        };
        if let Err(err) = result {
            self.halted = true;
            HALTED.click();
            clue!(COLLECTOR, ERROR, {
                halted: {
                    replica: self.agent.id().index,
                    error: format!("{:?}", err),
                },
            });
            return Err(err);
        }
        let outbound = env
            .outbound
            .into_iter()
            .map(|msg| match route(&msg) {
                Route::Direct => Outbound::Direct { to: from, msg },
                Route::Broadcast => Outbound::Broadcast { msg },
            })
            .collect();
        Ok(outbound)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
