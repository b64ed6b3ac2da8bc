//! shared-bus simulation for EtherSim

use anyhow::{Context, Result};
use colored::Colorize;
use ethersim_sim::{scenarios, SimulationPresets};

fn main() -> Result<()> {
    env_logger::init();

    let seed = std::env::args()
        .nth(1)
        .map(|s| s.parse::<u64>().context("seed must be an unsigned integer"))
        .transpose()?;

    println!("{}", "EtherSim Shared-Bus Simulation".bright_blue().bold());
    println!("{}", "==============================".bright_blue());

    let test_scenarios = vec![
        ("Demo LAN", SimulationPresets::demo_lan()),
        ("Classic 10 Mbit/s Ethernet", SimulationPresets::classic_ethernet()),
        ("Congested LAN", SimulationPresets::congested_lan()),
    ];

    for (name, mut config) in test_scenarios {
        if seed.is_some() {
            config.seed = seed;
        }
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        println!("Stations: {}", config.stations);
        println!("Slot time: {:?}", config.slot_time);
        println!("Propagation delay: {:?}", config.propagation_delay);

        scenarios::lone_transmission(config.clone())?;
        scenarios::two_station_collision(config.clone())?;
        scenarios::saturation(config, 4)?;

        println!("{}", "Test complete!".bright_yellow());
        println!("{}", "-".repeat(50));
    }

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
