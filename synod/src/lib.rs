#![doc = include_str!("../README.md")]

use biometrics::Collector;
use tatl::HeyListen;

pub mod agent;
pub mod dispatch;
pub mod follower;
pub mod journal;
pub mod leader;
pub mod quorum;
pub mod recoverer;
pub mod retransmit;

pub use synod_pb::{
    Ballot, CommandID, Error, Identifier, PValue, Progress, ReplicaID, ReplicaMessage, ReplyToken,
    Value,
};

pub use agent::{Agent, Role};
pub use dispatch::{Address, Dispatcher, Outbound};
pub use journal::{Journal, MemoryJournal};
pub use quorum::{QuorumStrategy, SimpleMajority};

///////////////////////////////////////////// constants ////////////////////////////////////////////

/// The default lower bound on the follower election timeout, in milliseconds.
pub const DEFAULT_LEADER_TIMEOUT_MIN_MS: u64 = 1_500;

/// The default upper bound on the follower election timeout, in milliseconds.
pub const DEFAULT_LEADER_TIMEOUT_MAX_MS: u64 = 3_000;

/// Leaders heartbeat this many times per minimum election timeout.
pub const HEARTBEATS_PER_TIMEOUT: u64 = 4;

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Registers this crate's biometrics with the provided Collector.
pub fn register_biometrics(collector: &Collector) {
    agent::register_biometrics(collector);
    dispatch::register_biometrics(collector);
    follower::register_biometrics(collector);
    journal::register_biometrics(collector);
    leader::register_biometrics(collector);
    recoverer::register_biometrics(collector);
    retransmit::register_biometrics(collector);
}

/// Registers this crate's monitors with the provided HeyListen.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    dispatch::register_monitors(hey_listen);
}

/////////////////////////////////////////// SynodOptions ///////////////////////////////////////////

/// Timing options for one replica.  Timeouts are expressed in ticks; the scheduler defines the
/// tick granularity, and every constant here assumes one tick per millisecond.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct SynodOptions {
    /// The lower bound on the follower election timeout, in milliseconds.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Minimum milliseconds before a follower probes for a leader.")
    )]
    pub leader_timeout_min_ms: u64,
    /// The upper bound on the follower election timeout, in milliseconds.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Maximum milliseconds before a follower probes for a leader.")
    )]
    pub leader_timeout_max_ms: u64,
}

impl SynodOptions {
    /// How often a leader heartbeats.  Derived from the minimum election timeout so that a live
    /// leader always produces fresh evidence before any follower's patience runs out.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        std::cmp::max(1, self.leader_timeout_min_ms / HEARTBEATS_PER_TIMEOUT)
    }
}

impl Default for SynodOptions {
    fn default() -> Self {
        Self {
            leader_timeout_min_ms: DEFAULT_LEADER_TIMEOUT_MIN_MS,
            leader_timeout_max_ms: DEFAULT_LEADER_TIMEOUT_MAX_MS,
        }
    }
}

////////////////////////////////////////////// Payload /////////////////////////////////////////////

/// One command as handed to the host's executor.  `delivery_id` is the slot the command committed
/// in; hosts must treat it as a dedupe key because a crash between delivery and the progress write
/// will re-deliver the same payload after recovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Payload {
    pub delivery_id: u64,
    pub request: Vec<u8>,
}

/////////////////////////////////////////////// Host ///////////////////////////////////////////////

/// What the embedding process provides to the core.
pub trait Host {
    /// The current number of cluster members.  Constant for now; membership change is future
    /// work.
    fn cluster_size(&self) -> u64;

    /// Apply one committed command to the application state machine and return the reply bytes.
    /// Must be deterministic and idempotent with respect to `payload.delivery_id`.
    fn deliver(&mut self, payload: Payload) -> Vec<u8>;

    /// Send a reply to the client the transport knows by `token`.  An `Err` of
    /// [Error::LostLeadership] tells the client to retry against the next leader.
    fn respond(&mut self, token: ReplyToken, response: Result<Vec<u8>, Error>);
}
