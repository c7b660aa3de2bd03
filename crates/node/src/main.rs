mod config;
mod events;
mod node;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::{NodeConfig, Role, parse_speed};
use events::NodeEvent;
use lockstep::Rational;
use node::LockstepNode;

#[derive(Parser)]
#[command(name = "lockstep-node")]
#[command(about = "Headless lockstep peer")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Deflate the stream after the handshake (host decides)")]
    compress: bool,

    #[arg(long, global = true)]
    spectator: bool,

    #[arg(long, global = true, help = "Leave after this many ticks")]
    ticks: Option<u32>,

    #[arg(long, global = true, default_value = "1/1", value_parser = parse_speed)]
    speed: Rational,

    #[arg(long, global = true, default_value_t = 16, help = "Frame interval in ms")]
    frame_ms: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Host a match and wait for the other players to join
    Host {
        #[arg(short, long, default_value_t = lockstep::DEFAULT_PORT)]
        port: u16,

        #[arg(long, default_value_t = 2, help = "Players including the host")]
        players: usize,
    },
    /// Join a hosted match
    Join {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value_t = lockstep::DEFAULT_PORT)]
        port: u16,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let role = match args.command {
        Command::Host { port, players } => Role::Host { port, players },
        Command::Join { host, port } => Role::Join { host, port },
    };
    let config = NodeConfig {
        role,
        compress: args.compress,
        spectator: args.spectator,
        ticks: args.ticks,
        speed: args.speed,
        frame_interval: Duration::from_millis(args.frame_ms),
        ..Default::default()
    };
    let frame_interval = config.frame_interval;

    let mut node = LockstepNode::start(config)?;
    while node.is_running() {
        node.tick_once();
        for event in node.drain_events() {
            log_event(event);
        }
        thread::sleep(frame_interval);
    }

    let latency = node.clock().agreed_latency();
    log::info!("finished after {} ticks, agreed latency {latency}", node.ticks());
    node.leave();
    Ok(())
}

fn log_event(event: NodeEvent) {
    match event {
        NodeEvent::PeerJoined {
            slot,
            address,
            spectator,
        } => {
            let role = if spectator { "spectator" } else { "player" };
            log::info!("{role} from [{address}] joined in slot {slot}");
        }
        NodeEvent::PeerLeft { slot, reason } => {
            log::info!("slot {slot} {}", reason.as_str());
        }
        NodeEvent::MatchStarted { players } => {
            log::info!("match started with {players} slots");
        }
        NodeEvent::Waiting { slot, waited_ms } => {
            log::info!("waiting for slot {slot} ({waited_ms} ms)");
        }
        NodeEvent::Desync { slots, time } => {
            if slots.is_empty() {
                log::info!("back in sync at gameTime {time}");
            } else {
                log::error!("out of sync at gameTime {time}: slots {slots:?}");
            }
        }
        NodeEvent::Error { message } => log::error!("{message}"),
    }
}
