//! SOS controller - accelerates whitelisted TCP transfers through agents
//!
//! Loads a deployment file, installs its agents and whitelist, and either
//! replays recorded packets through the controller or runs until
//! interrupted.

mod deployment;

use anyhow::{Context, Result};
use clap::Parser;
use deployment::{load_replay, Deployment};
use sos_control::{PacketVerdict, SosController, StaticTopology};
use sos_router::{RecordingSwitch, StrategyKind};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "sos-controller")]
#[command(about = "Steroid OpenFlow Service controller")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Deployment file (YAML)
    #[arg(short, long, env = "SOS_CONFIG", default_value = "sos.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SOS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Override the configured access routing strategy
    #[arg(long, env = "SOS_STRATEGY")]
    strategy: Option<StrategyKind>,

    /// Feed the packets in this file through the controller and exit
    #[arg(long)]
    replay: Option<PathBuf>,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}

/// Build the controller and install the deployment's agents and whitelist
fn build_controller(
    mut deployment: Deployment,
    strategy: Option<StrategyKind>,
) -> Result<(SosController, RecordingSwitch)> {
    if let Some(strategy) = strategy {
        deployment.controller = deployment.controller.with_strategy(strategy);
    }

    let topology = StaticTopology::new(deployment.topology);
    let switch = RecordingSwitch::new(topology.switches());
    let controller = SosController::new(
        deployment.controller,
        Arc::new(topology),
        Arc::new(switch.clone()),
    )
    .context("Invalid controller configuration")?;

    for agent in deployment.agents {
        let ip = agent.ip;
        let code = controller.add_agent(agent);
        info!(agent = %ip, ?code, "Registered agent");
    }
    for entry in deployment.whitelist {
        let code = controller.add_whitelist_entry(entry.clone());
        info!(
            client = %entry.client_ip,
            server = %entry.server_ip,
            port = entry.server_port,
            ?code,
            "Whitelisted connection"
        );
    }

    Ok((controller, switch))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!(
        version = env!("GIT_TAG"),
        commit = env!("GIT_HASH"),
        config = ?cli.config,
        "Starting SOS controller"
    );

    let deployment = Deployment::load(&cli.config)?;
    let (controller, switch) = build_controller(deployment, cli.strategy)?;
    info!(
        strategy = controller.strategy(),
        agents = controller.agents().len(),
        ready = ?controller.ready(),
        "Controller ready"
    );

    if let Some(path) = cli.replay {
        let events = load_replay(&path)?;
        info!(events = events.len(), "Replaying packets");
        for event in &events {
            let verdict = controller.handle_packet(event.switch, event.in_port, &event.frame());
            if verdict == PacketVerdict::Continue {
                warn!(switch = %event.switch, in_port = event.in_port, "Packet not handled");
            }
        }
        info!(
            active = controller.active_sessions().len(),
            terminated = controller.terminated_sessions().len(),
            flows = switch.flow_count(),
            "Replay finished"
        );
        println!(
            "{}",
            serde_json::to_string_pretty(&controller.active_sessions())
                .context("Failed to serialize sessions")?
        );
        controller.shutdown();
        return Ok(());
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }
    controller.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sos_proto::ReturnCode;

    const DEPLOYMENT: &str = r#"
controller:
  controller_mac: "02:00:00:00:00:fe"
topology:
  switches: [1, 2]
  links:
    - { a: { switch: 1, port: 3 }, b: { switch: 2, port: 3 }, latency_ms: 5 }
  hosts:
    - { ip: 10.0.0.1, mac: "00:00:00:00:00:01", attachment_points: [{ switch: 1, port: 2 }] }
    - { ip: 10.0.0.2, mac: "00:00:00:00:00:02", attachment_points: [{ switch: 2, port: 2 }] }
agents:
  - { ip: 10.0.0.1, data_port: 9877, control_port: 9878, feedback_port: 9998, stats_port: 9999 }
  - { ip: 10.0.0.2, data_port: 9877, control_port: 9878, feedback_port: 9998, stats_port: 9999 }
  - { ip: 10.0.0.2, data_port: 9877, control_port: 9878, feedback_port: 9998, stats_port: 9999 }
whitelist:
  - { server_ip: 10.0.0.5, server_port: 80, client_ip: 10.0.0.9 }
"#;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "sos-controller",
            "--config",
            "deploy.yaml",
            "--strategy",
            "first-hop-last-hop",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("deploy.yaml"));
        assert_eq!(cli.strategy, Some(StrategyKind::FirstHopLastHop));
        assert!(cli.replay.is_none());
    }

    #[test]
    fn test_build_controller_installs_deployment() {
        let deployment = Deployment::parse(DEPLOYMENT).unwrap();
        let (controller, _) =
            build_controller(deployment, Some(StrategyKind::FirstHopLastHop)).unwrap();

        // the duplicate agent is refused
        assert_eq!(controller.agents().len(), 2);
        assert_eq!(controller.whitelist().len(), 1);
        assert_eq!(controller.ready(), ReturnCode::Ready);
        assert_eq!(controller.strategy(), "first-hop-last-hop");
    }
}
