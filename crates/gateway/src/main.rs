mod config;

use anyhow::{Context, Result};
use log::info;

use ethersim_bus::Scheduler;
use ethersim_rpc::{run_api, run_driver, SharedState};

use crate::config::GatewayConfig;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = GatewayConfig::from_env()?;
    info!(
        "EtherSim gateway: {} stations, slot {:?}, propagation {:?}, tick {:?}",
        config.bus.stations, config.bus.slot_time, config.bus.propagation_delay, config.tick
    );

    let scheduler = Scheduler::new(config.bus.clone()).context("Failed to build the bus")?;
    let state = SharedState::new(scheduler, config.request_timeout);

    // after a failed tick the API stays up and answers 503
    tokio::spawn(run_driver(state.clone(), config.tick));

    tokio::select! {
        res = run_api(state.clone(), config.listen, config.allowed_origins.clone()) => {
            res.with_context(|| format!("API server on {} failed", config.listen))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            state.stop().await;
        }
    }

    Ok(())
}
