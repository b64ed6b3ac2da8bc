//! simulation tools for EtherSim

pub mod scenarios;

use std::time::Duration;
use ethersim_bus::BusConfig;

pub struct SimulationPresets;

impl SimulationPresets {
    /// Human-scale timings the browser front-end animates.
    pub fn demo_lan() -> BusConfig {
        BusConfig::default()
    }

    /// 10 Mbit/s coax: 51.2 µs slots, full-size frames on the wire for 1.2 ms.
    pub fn classic_ethernet() -> BusConfig {
        BusConfig {
            stations: 8,
            mtu: 1500,
            slot_time: Duration::from_nanos(51_200),
            collision_window: Duration::from_nanos(25_600),
            propagation_delay: Duration::from_micros(1_200),
            max_attempts: 16,
            cap_exponent: 10,
            seed: Some(0xE7_4E),
            archive_capacity: 4096,
        }
    }

    pub fn congested_lan() -> BusConfig {
        BusConfig {
            stations: 16,
            mtu: 1500,
            slot_time: Duration::from_millis(100),
            collision_window: Duration::from_millis(100),
            propagation_delay: Duration::from_millis(400),
            max_attempts: 8,
            cap_exponent: 10,
            seed: Some(7),
            archive_capacity: 4096,
        }
    }

    /// Tick that keeps every resume time on a tick boundary.
    pub fn tick_for(config: &BusConfig) -> Duration {
        let slot = config.slot_time / 10;
        if slot.is_zero() {
            config.slot_time
        } else {
            slot
        }
    }
}
