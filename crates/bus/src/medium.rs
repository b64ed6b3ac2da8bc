//! The shared medium: occupancy tracking and collision detection

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use log::{debug, trace};

use ethersim_core::{SimTime, StationId, Transmission, TransmissionId, TransmissionStatus};

use crate::{BusConfig, BusError, EventKind, TransmissionLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contender {
    pub id: TransmissionId,
    pub station: StationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arbitration {
    Idle,
    /// The bus was sensed busy; every offer waits.
    Deferred(Vec<Contender>),
    Granted(Contender),
    /// Every contender, frames that were already on the bus first.
    Collision(Vec<Contender>),
}

#[derive(Debug, Clone)]
struct Occupant {
    contender: Contender,
    receiver: StationId,
    started_at: SimTime,
    sensed_at: SimTime,
    clear_at: SimTime,
}

/// A broadcast bus. A frame occupies it for `propagation_delay`; during the
/// first `collision_window` of that time the other stations cannot sense it
/// yet, so anything they put on the bus collides with it.
#[derive(Debug)]
pub struct Medium {
    collision_window: Duration,
    propagation_delay: Duration,
    occupants: BTreeMap<TransmissionId, Occupant>,
}

impl Medium {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            collision_window: config.collision_window,
            propagation_delay: config.propagation_delay,
            occupants: BTreeMap::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.occupants.is_empty()
    }

    pub fn occupancy(&self) -> impl Iterator<Item = TransmissionId> + '_ {
        self.occupants.keys().copied()
    }

    /// True when some frame on the bus is visible to carrier sense.
    pub fn carrier_sensed(&self, now: SimTime) -> bool {
        self.occupants.values().any(|o| o.sensed_at <= now)
    }

    /// Frames that have reached the far end of the bus by `now`.
    pub fn due(&self, now: SimTime) -> Vec<Contender> {
        let mut due: Vec<_> = self.occupants.values().filter(|o| o.clear_at <= now).collect();
        due.sort_by_key(|o| (o.clear_at, o.contender.id));
        due.into_iter().map(|o| o.contender).collect()
    }

    pub fn release(&mut self, id: TransmissionId) -> bool {
        self.occupants.remove(&id).is_some()
    }

    /// Arbitrates the frames offered this tick against the current occupancy.
    ///
    /// All offers are checked before anything changes, so a rejected tick
    /// leaves the medium untouched.
    pub fn attempt(
        &mut self,
        offers: &[&Transmission],
        now: SimTime,
        log: &mut TransmissionLog,
    ) -> Result<Arbitration, BusError> {
        let mut stations = BTreeSet::new();
        for t in offers {
            if t.status() != TransmissionStatus::Pending {
                return Err(BusError::Invariant(format!(
                    "transmission {} offered to the medium while {}",
                    t.id,
                    t.status()
                )));
            }
            if self.occupants.contains_key(&t.id) {
                return Err(BusError::Invariant(format!(
                    "transmission {} is already on the medium",
                    t.id
                )));
            }
            if !stations.insert(t.sender) {
                return Err(BusError::Invariant(format!(
                    "station {} offered two frames in one tick",
                    t.sender
                )));
            }
        }

        if offers.is_empty() {
            return Ok(Arbitration::Idle);
        }

        let mut offered: Vec<&Transmission> = offers.to_vec();
        offered.sort_by_key(|t| (t.created_at, t.id));

        if self.carrier_sensed(now) {
            trace!("carrier sensed at {:?}, deferring {} offers", now, offered.len());
            return Ok(Arbitration::Deferred(
                offered.iter().map(|t| contender_of(t)).collect(),
            ));
        }

        let mut vulnerable: Vec<Occupant> = self
            .occupants
            .values()
            .filter(|o| o.sensed_at > now)
            .cloned()
            .collect();
        vulnerable.sort_by_key(|o| (o.started_at, o.contender.id));

        if vulnerable.is_empty() && offered.len() == 1 {
            let t = offered[0];
            self.occupants.insert(
                t.id,
                Occupant {
                    contender: contender_of(t),
                    receiver: t.receiver,
                    started_at: now,
                    sensed_at: now + self.collision_window,
                    clear_at: now + self.propagation_delay,
                },
            );
            return Ok(Arbitration::Granted(contender_of(t)));
        }

        // (id, sender, receiver) of every party, bus-first order
        let parties: Vec<(TransmissionId, StationId, StationId)> = vulnerable
            .iter()
            .map(|o| (o.contender.id, o.contender.station, o.receiver))
            .chain(offered.iter().map(|t| (t.id, t.sender, t.receiver)))
            .collect();

        for o in &vulnerable {
            self.occupants.remove(&o.contender.id);
        }

        for (i, a) in parties.iter().enumerate() {
            for b in &parties[i + 1..] {
                log.record(
                    now,
                    EventKind::Collision,
                    Some(a.0),
                    a.1,
                    a.2,
                    format!(
                        "PC {} -> PC {} collided with PC {} -> PC {} (transmission {})",
                        a.1, a.2, b.1, b.2, b.0
                    ),
                );
            }
        }
        let (_, first_sender, first_receiver) = parties[0];
        log.record(
            now,
            EventKind::CollisionDetected,
            None,
            first_sender,
            first_receiver,
            format!("Collision detected between {} transmissions", parties.len()),
        );
        debug!("collision of {} frames at {:?}", parties.len(), now);

        Ok(Arbitration::Collision(
            parties
                .into_iter()
                .map(|(id, station, _)| Contender { id, station })
                .collect(),
        ))
    }
}

fn contender_of(t: &Transmission) -> Contender {
    Contender {
        id: t.id,
        station: t.sender,
    }
}
