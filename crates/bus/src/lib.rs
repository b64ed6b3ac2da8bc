//! shared-bus CSMA/CD simulation for EtherSim

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ethersim_core::types::serde_millis;
use ethersim_core::{StationId, TransitionError, TransmissionId};

pub mod backoff;
pub mod event_log;
pub mod medium;
pub mod scheduler;
pub mod station;

pub use backoff::BackoffPolicy;
pub use event_log::{EventKind, LogEntry, TransmissionLog};
pub use medium::{Arbitration, Contender, Medium};
pub use scheduler::{BusStats, Scheduler, StepReport};
pub use station::Station;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Invalid receiver PC {receiver} for sender PC {sender}")]
    InvalidReceiver { sender: StationId, receiver: i64 },

    #[error("Invalid sender PC {0}")]
    InvalidSender(i64),

    #[error("Message of {len} bytes exceeds the {mtu} byte MTU")]
    PayloadTooLarge { len: usize, mtu: usize },

    #[error("Unknown transmission {0}")]
    UnknownTransmission(TransmissionId),

    #[error("Transmission {0} is in flight and cannot be cancelled")]
    CancelInFlight(TransmissionId),

    #[error("Simulation time went backwards: {now:?} < {last:?}")]
    TimeWentBackwards { now: Duration, last: Duration },

    #[error("Invalid bus configuration: {0}")]
    InvalidConfig(String),

    #[error("Bus invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub stations: u32,
    pub mtu: usize,
    #[serde(with = "serde_millis", rename = "slot_time_ms")]
    pub slot_time: Duration,
    /// How long a new frame stays invisible to carrier sense.
    #[serde(with = "serde_millis", rename = "collision_window_ms")]
    pub collision_window: Duration,
    #[serde(with = "serde_millis", rename = "propagation_delay_ms")]
    pub propagation_delay: Duration,
    pub max_attempts: u32,
    pub cap_exponent: u32,
    pub seed: Option<u64>,
    pub archive_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stations: 6,
            mtu: 1500,
            slot_time: Duration::from_millis(500),
            collision_window: Duration::from_millis(500),
            propagation_delay: Duration::from_millis(1000),
            max_attempts: 16,
            cap_exponent: 10,
            seed: None,
            archive_capacity: 1024,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), BusError> {
        let fail = |msg: &str| Err(BusError::InvalidConfig(msg.to_string()));
        if self.stations < 2 {
            return fail("a bus needs at least 2 stations");
        }
        if self.mtu == 0 {
            return fail("mtu must be positive");
        }
        if self.slot_time.is_zero() {
            return fail("slot time must be positive");
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1");
        }
        if self.cap_exponent > 16 {
            return fail("cap_exponent must not exceed 16");
        }
        if self.collision_window > self.propagation_delay {
            return fail("collision window cannot outlast the propagation delay");
        }
        Ok(())
    }
}
