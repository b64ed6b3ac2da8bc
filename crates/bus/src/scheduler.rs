//! Tick-driven CSMA/CD scheduler for the shared bus

use std::collections::BTreeMap;
use std::time::Duration;
use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use ethersim_core::{
    BackoffWindow, SimTime, StationId, Transmission, TransmissionId, TransmissionStatus,
};

use crate::{
    Arbitration, BackoffPolicy, BusConfig, BusError, Contender, EventKind, LogEntry, Medium,
    Station, TransmissionLog,
};

/// What one call to [`Scheduler::step`] did.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub now: SimTime,
    /// Log entries appended during this tick, in order.
    pub entries: Vec<LogEntry>,
    /// Frames that reached a terminal status during this tick.
    pub finished: Vec<Transmission>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BusStats {
    pub ticks: u64,
    pub submitted: u64,
    /// Offers put to the medium, counting every retry and deferred tick.
    pub offered: u64,
    pub granted: u64,
    pub delivered: u64,
    pub collisions: u64,
    pub collided_frames: u64,
    pub deferred: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Owns the stations, the medium and the log, and advances them one tick at
/// a time. Waiting is data (a resume time on the frame), never a sleep.
pub struct Scheduler {
    config: BusConfig,
    stations: Vec<Station>,
    medium: Medium,
    policy: BackoffPolicy,
    log: TransmissionLog,
    rng: StdRng,
    next_id: TransmissionId,
    now: SimTime,
    archive: BTreeMap<TransmissionId, Transmission>,
    stats: BusStats,
}

impl Scheduler {
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        info!("Bus scheduler initialized with config: {:?}", config);
        Ok(Self {
            stations: (1..=config.stations).map(Station::new).collect(),
            medium: Medium::new(&config),
            policy: BackoffPolicy::from_config(&config),
            log: TransmissionLog::new(),
            rng,
            next_id: 1,
            now: Duration::ZERO,
            archive: BTreeMap::new(),
            stats: BusStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Time of the last completed step.
    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn log(&self) -> &TransmissionLog {
        &self.log
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn station(&self, id: StationId) -> Option<&Station> {
        self.index_of(id).ok().map(|i| &self.stations[i])
    }

    pub fn is_idle(&self) -> bool {
        self.medium.is_idle() && !self.stations.iter().any(Station::has_work)
    }

    fn index_of(&self, id: StationId) -> Result<usize, BusError> {
        if id >= 1 && (id as usize) <= self.stations.len() {
            Ok(id as usize - 1)
        } else {
            Err(BusError::Invariant(format!("no station {id}")))
        }
    }

    /// Validates a request and queues the frame on the sender's station.
    pub fn submit(&mut self, sender: i64, receiver: i64, msg: &str) -> Result<TransmissionId, BusError> {
        if sender < 1 || sender > self.stations.len() as i64 {
            return Err(BusError::InvalidSender(sender));
        }
        let id = self.next_id;
        let now = self.now;
        let t = self.stations[sender as usize - 1].enqueue(
            id,
            msg,
            receiver,
            self.config.stations,
            self.config.mtu,
            now,
        )?;
        self.log.record_for(
            now,
            EventKind::Enqueued,
            t,
            format!("PC {} queued {} bytes for PC {}", t.sender, t.payload.len(), t.receiver),
        );
        debug!("transmission {} queued: PC {} -> PC {}", id, t.sender, t.receiver);
        self.next_id += 1;
        self.stats.submitted += 1;
        Ok(id)
    }

    pub fn transmission(&self, id: TransmissionId) -> Option<&Transmission> {
        if let Some(t) = self.archive.get(&id) {
            return Some(t);
        }
        self.stations.iter().find_map(|s| {
            s.current()
                .filter(|t| t.id == id)
                .or_else(|| s.queue().find(|t| t.id == id))
        })
    }

    /// Cancels a frame that is still Pending or in Backoff.
    pub fn cancel(&mut self, id: TransmissionId) -> Result<Transmission, BusError> {
        let mut cancelled = None;
        for station in self.stations.iter_mut() {
            if let Some(t) = station.cancel(id)? {
                cancelled = Some(t);
                break;
            }
        }
        let t = cancelled.ok_or(BusError::UnknownTransmission(id))?;
        self.log.record_for(
            self.now,
            EventKind::Cancelled,
            &t,
            format!("Transmission from PC {} to PC {} cancelled", t.sender, t.receiver),
        );
        debug!("transmission {} cancelled", id);
        self.stats.cancelled += 1;
        self.archive_finished(t.clone());
        Ok(t)
    }

    fn archive_finished(&mut self, t: Transmission) {
        self.archive.insert(t.id, t);
        while self.archive.len() > self.config.archive_capacity {
            self.archive.pop_first();
        }
    }

    /// Runs one tick at `now`. The tick completes fully before returning.
    pub fn step(&mut self, now: SimTime) -> Result<StepReport, BusError> {
        if now < self.now {
            return Err(BusError::TimeWentBackwards { now, last: self.now });
        }
        self.now = now;
        self.stats.ticks += 1;
        let log_start = self.log.len();
        let mut finished = Vec::new();

        // frames that reached the far end
        for c in self.medium.due(now) {
            self.medium.release(c.id);
            let idx = self.index_of(c.station)?;
            let station = &mut self.stations[idx];
            let t = current_of(station, c.id)?;
            t.deliver()?;
            self.log.record_for(
                now,
                EventKind::Delivered,
                t,
                format!("Packet from PC {} successfully received by PC {}", t.sender, t.receiver),
            );
            debug!("transmission {} delivered after {} attempts", t.id, t.attempts());
            self.stats.delivered += 1;
            finished.extend(station.finish());
        }

        for station in self.stations.iter_mut() {
            let Some(t) = station.current_mut() else { continue };
            if t.status() == TransmissionStatus::Backoff && t.resume_at().is_some_and(|r| r <= now) {
                t.resume()?;
                self.log.record_for(
                    now,
                    EventKind::Resumed,
                    t,
                    format!("PC {} retrying transmission to PC {} (attempt {})", t.sender, t.receiver, t.attempts() + 1),
                );
            }
        }

        for station in self.stations.iter_mut() {
            if let Some(id) = station.tick() {
                trace!("station {} picked up transmission {}", station.id(), id);
            }
        }

        let offers: Vec<&Transmission> = self.stations.iter().filter_map(Station::offer).collect();
        self.stats.offered += offers.len() as u64;
        let arbitration = self.medium.attempt(&offers, now, &mut self.log)?;

        match arbitration {
            Arbitration::Idle => {}
            Arbitration::Granted(c) => {
                let idx = self.index_of(c.station)?;
                let station = &mut self.stations[idx];
                station.clear_deferral();
                let t = current_of(station, c.id)?;
                t.start()?;
                let detail = if t.attempts() > 1 {
                    format!("Starting transmission from PC {} to PC {} (attempt {})", t.sender, t.receiver, t.attempts())
                } else {
                    format!("Starting transmission from PC {} to PC {}", t.sender, t.receiver)
                };
                self.log.record_for(now, EventKind::SendStart, t, detail);
                debug!("transmission {} granted the bus", t.id);
                self.stats.granted += 1;
            }
            Arbitration::Deferred(waiting) => {
                for c in waiting {
                    let idx = self.index_of(c.station)?;
                    let station = &mut self.stations[idx];
                    if station.note_deferral() {
                        let t = current_of(station, c.id)?;
                        self.log.record_for(
                            now,
                            EventKind::Deferred,
                            t,
                            format!("PC {} senses the bus busy, deferring", t.sender),
                        );
                        self.stats.deferred += 1;
                    }
                }
            }
            Arbitration::Collision(parties) => {
                self.apply_collision(&parties, now, &mut finished)?;
            }
        }

        for t in &finished {
            self.archive_finished(t.clone());
        }
        trace!("tick at {:?}: {} frames finished", now, finished.len());

        Ok(StepReport {
            now,
            entries: self.log.since(log_start).to_vec(),
            finished,
        })
    }

    /// Moves every party of a collision to Collided at once, then draws the
    /// backoff delays and either schedules the retry or fails the frame.
    fn apply_collision(
        &mut self,
        parties: &[Contender],
        now: SimTime,
        finished: &mut Vec<Transmission>,
    ) -> Result<(), BusError> {
        if parties.len() < 2 {
            return Err(BusError::Invariant(format!(
                "collision reported with {} parties",
                parties.len()
            )));
        }
        self.stats.collisions += 1;
        self.stats.collided_frames += parties.len() as u64;

        let mut attempts = Vec::with_capacity(parties.len());
        for c in parties {
            let idx = self.index_of(c.station)?;
            let station = &mut self.stations[idx];
            let t = current_of(station, c.id)?;
            t.collide()?;
            attempts.push(t.attempts());
            station.note_collision();
        }

        // the first pair shares one window; everybody else draws independently
        let window = self.policy.compute_window(attempts[0], attempts[1], &mut self.rng);
        let mut delays = vec![window.old_message, window.new_message];
        for &a in &attempts[2..] {
            delays.push(self.policy.delay(a, &mut self.rng));
        }

        for (i, c) in parties.iter().enumerate() {
            let idx = self.index_of(c.station)?;
            let station = &mut self.stations[idx];
            let t = current_of(station, c.id)?;
            t.note_window(BackoffWindow {
                old_message: delays[0],
                new_message: if i == 0 { delays[1] } else { delays[i] },
            });

            if t.attempts() >= self.config.max_attempts {
                t.fail()?;
                self.log.record_for(
                    now,
                    EventKind::Failed,
                    t,
                    format!(
                        "Transmission from PC {} to PC {} failed after {} attempts",
                        t.sender,
                        t.receiver,
                        t.attempts()
                    ),
                );
                debug!("transmission {} failed", t.id);
                self.stats.failed += 1;
                finished.extend(station.finish());
            } else {
                t.back_off(now + delays[i])?;
                self.log.record_for(
                    now,
                    EventKind::Backoff,
                    t,
                    format!(
                        "PC {} backs off for {}s before retrying PC {}",
                        t.sender,
                        delays[i].as_secs_f64(),
                        t.receiver
                    ),
                );
                debug!("transmission {} backs off {:?}", t.id, delays[i]);
            }
        }
        Ok(())
    }

    /// Steps at a fixed `tick` until nothing is left to do or `horizon` is
    /// reached. Returns every frame that finished along the way.
    pub fn run_until_idle(&mut self, tick: Duration, horizon: SimTime) -> Result<Vec<Transmission>, BusError> {
        if tick.is_zero() {
            return Err(BusError::InvalidConfig("tick must be positive".to_string()));
        }
        let mut finished = Vec::new();
        let mut now = self.now;
        loop {
            let report = self.step(now)?;
            finished.extend(report.finished);
            if self.is_idle() || now >= horizon {
                break;
            }
            now += tick;
        }
        Ok(finished)
    }
}

fn current_of(station: &mut Station, id: TransmissionId) -> Result<&mut Transmission, BusError> {
    let station_id = station.id();
    station
        .current_mut()
        .filter(|t| t.id == id)
        .ok_or_else(|| BusError::Invariant(format!("station {station_id} is not working on transmission {id}")))
}
