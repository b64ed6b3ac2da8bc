//! Scripted scenarios for exercising the shared bus

use std::time::Duration;
use colored::Colorize;
use ethersim_bus::{BusConfig, BusError, BusStats, EventKind, LogEntry, Scheduler};
use ethersim_core::{Transmission, TransmissionStatus};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use crate::SimulationPresets;

pub struct ScenarioSummary {
    pub finished: Vec<Transmission>,
    pub stats: BusStats,
    pub elapsed: Duration,
}

impl ScenarioSummary {
    fn collect(scheduler: &Scheduler, finished: Vec<Transmission>) -> Self {
        Self {
            finished,
            stats: scheduler.stats().clone(),
            elapsed: scheduler.now(),
        }
    }

    pub fn delivered(&self) -> usize {
        self.count(TransmissionStatus::Delivered)
    }

    pub fn failed(&self) -> usize {
        self.count(TransmissionStatus::Failed)
    }

    fn count(&self, status: TransmissionStatus) -> usize {
        self.finished.iter().filter(|t| t.status() == status).count()
    }
}

pub fn print_entry(entry: &LogEntry) {
    let line = format!("[{:>9.4}s] {}", entry.at.as_secs_f64(), entry.detail);
    match entry.kind {
        EventKind::Collision | EventKind::CollisionDetected | EventKind::Failed => {
            println!("{}", line.bright_red())
        }
        EventKind::Backoff | EventKind::Deferred => println!("{}", line.yellow()),
        EventKind::Delivered => println!("{}", line.bright_green()),
        _ => println!("{}", line),
    }
}

/// One frame on an idle bus.
pub fn lone_transmission(config: BusConfig) -> Result<ScenarioSummary, BusError> {
    println!("\n=== Lone Transmission ===");
    let tick = SimulationPresets::tick_for(&config);
    let mut scheduler = Scheduler::new(config)?;

    scheduler.submit(1, 2, "Hello from PC 1")?;
    let finished = scheduler.run_until_idle(tick, Duration::from_secs(3600))?;
    scheduler.log().entries().iter().for_each(print_entry);

    for t in &finished {
        match t.first_collision() {
            None => println!("✓ delivered without collision in {} attempt", t.attempts()),
            Some(w) => println!("✗ collided: old {:?}, new {:?}", w.old_message, w.new_message),
        }
    }
    Ok(ScenarioSummary::collect(&scheduler, finished))
}

/// PC 1 and PC 2 both talk to PC 3 in the same tick.
pub fn two_station_collision(config: BusConfig) -> Result<ScenarioSummary, BusError> {
    println!("\n=== Two-Station Collision ===");
    let tick = SimulationPresets::tick_for(&config);
    let mut scheduler = Scheduler::new(config)?;

    scheduler.submit(1, 3, "First message")?;
    scheduler.submit(2, 3, "Second message")?;
    let finished = scheduler.run_until_idle(tick, Duration::from_secs(3600))?;
    scheduler.log().entries().iter().for_each(print_entry);

    for t in &finished {
        if let Some(w) = t.first_collision() {
            println!(
                "  transmission {}: backoff times old {}s / new {}s",
                t.id,
                w.old_message.as_secs_f64(),
                w.new_message.as_secs_f64()
            );
        }
    }
    Ok(ScenarioSummary::collect(&scheduler, finished))
}

/// Every station sends `frames_per_station` frames at once to its neighbour.
pub fn saturation(config: BusConfig, frames_per_station: u32) -> Result<ScenarioSummary, BusError> {
    println!("\n=== Saturation ({} stations, {} frames each) ===", config.stations, frames_per_station);
    let tick = SimulationPresets::tick_for(&config);
    let stations = config.stations as i64;
    let mut scheduler = Scheduler::new(config)?;

    for round in 0..frames_per_station {
        for sender in 1..=stations {
            let receiver = sender % stations + 1;
            scheduler.submit(sender, receiver, &format!("frame {round} from PC {sender}"))?;
        }
    }

    let total = frames_per_station as u64 * stations as u64;
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} frames {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let horizon = tick * 10_000_000;
    let mut finished = Vec::new();
    let mut now = scheduler.now();
    while !scheduler.is_idle() && now <= horizon {
        let report = scheduler.step(now)?;
        pb.inc(report.finished.len() as u64);
        finished.extend(report.finished);
        pb.set_message(format!("{} collisions", scheduler.stats().collisions));
        now += tick;
    }
    pb.finish();
    info!(
        "saturation run settled after {} ticks with {} collisions",
        scheduler.stats().ticks,
        scheduler.stats().collisions
    );

    let summary = ScenarioSummary::collect(&scheduler, finished);
    println!("  - delivered: {}", summary.delivered());
    println!("  - failed: {}", summary.failed());
    println!("  - collisions: {}", summary.stats.collisions);
    println!("  - simulated time: {:?}", summary.elapsed);
    Ok(summary)
}
