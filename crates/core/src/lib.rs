//! core data types for EtherSim

pub mod transmission;
pub mod types;

pub use transmission::{Transmission, TransmissionStatus, TransitionError};
pub use types::{BackoffWindow, SimTime, StationId, TransmissionId};
