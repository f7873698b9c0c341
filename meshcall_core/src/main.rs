//! Mesh call simulator
//!
//! Runs N participants with loopback transports and checks that every pair
//! ends up connected. By default they meet on an in-process relay guarded by
//! `LOGIN`; with `--relay` they connect to the WebSocket relay at
//! `MESHCALL_RELAY_URL` instead.
//!
//! ```bash
//! RUST_LOG=meshcall_core=debug cargo run --bin meshcall-sim -- 4
//! MESHCALL_RELAY_URL=ws://127.0.0.1:8888/ws cargo run --bin meshcall-sim -- 3 --relay
//! ```

use meshcall_core::{
    CallError, LoopbackEngine, LoopbackMedia, MeshConfig, MeshCoordinator, RelayHub,
    SignalingChannel, Topology, WebSocketChannel,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_PARTICIPANTS: usize = 3;

/// Idle wait between polls when signaling crosses the network
const NETWORK_IDLE: Duration = Duration::from_millis(100);

/// Consecutive idle polls before signaling counts as settled
const QUIET_ROUNDS: usize = 3;

struct Options {
    count: usize,
    websocket: bool,
}

fn participant<C: SignalingChannel>(
    channel: C,
    index: usize,
    config: &MeshConfig,
) -> MeshCoordinator<C> {
    MeshCoordinator::new(
        config.clone(),
        channel,
        Arc::new(LoopbackEngine::new(format!("10.0.0.{}", index + 1))),
        Arc::new(LoopbackMedia::new()),
    )
}

/// Drain every coordinator until nobody has work left. A zero `idle` only
/// yields to the runtime between polls.
async fn settle<C: SignalingChannel>(
    participants: &mut [MeshCoordinator<C>],
    idle: Duration,
) -> Result<usize, CallError> {
    let mut rounds = 0;
    let mut quiet = 0;
    while quiet < QUIET_ROUNDS {
        let mut handled = 0;
        for participant in participants.iter_mut() {
            handled += participant.drain_ready().await?;
        }
        if handled == 0 {
            quiet += 1;
            if idle.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(idle).await;
            }
        } else {
            quiet = 0;
            rounds += 1;
        }
    }
    Ok(rounds)
}

/// Start every call, check the topology, then hang up. `on_settled` runs
/// while the calls are still up.
async fn run_call<C: SignalingChannel>(
    participants: &mut [MeshCoordinator<C>],
    idle: Duration,
    on_settled: impl Fn(),
) -> Result<bool, CallError> {
    for participant in participants.iter_mut() {
        participant.start_call().await?;
    }
    let rounds = settle(participants, idle).await?;
    info!("Signaling settled after {} rounds", rounds);
    on_settled();

    let expected = participants.len() - 1;
    let mut complete = true;
    for participant in participants.iter() {
        let peers = participant.connected_peers();
        let id = participant
            .local_id()
            .map(ToString::to_string)
            .unwrap_or_default();
        let names: Vec<String> = peers.iter().map(ToString::to_string).collect();
        info!("{} connected to [{}]", id, names.join(", "));
        if peers.len() != expected {
            error!("{} has {} peers, expected {}", id, peers.len(), expected);
            complete = false;
        }
    }

    for participant in participants.iter_mut() {
        participant.end_call().await?;
    }
    settle(participants, idle).await?;
    Ok(complete)
}

async fn simulate_in_process(count: usize, config: &MeshConfig) -> Result<bool, CallError> {
    let hub = RelayHub::from_config(config);
    let mut participants = Vec::with_capacity(count);
    for index in 0..count {
        let channel = hub.connect_with_login(config.login.as_deref())?;
        participants.push(participant(channel, index, config));
    }

    let complete = run_call(&mut participants, Duration::ZERO, || {
        info!(
            "Relay has {} online, {} in call",
            hub.online_count(),
            hub.active_count()
        )
    })
    .await?;
    info!(
        "All calls ended, {} online, {} in call",
        hub.online_count(),
        hub.active_count()
    );
    Ok(complete)
}

async fn simulate_websocket(count: usize, config: &MeshConfig) -> Result<bool, CallError> {
    info!("Connecting {} participants to {}", count, config.relay_url);
    let mut participants = Vec::with_capacity(count);
    for index in 0..count {
        let channel = WebSocketChannel::from_config(config).await?;
        participants.push(participant(channel, index, config));
    }
    // Let the relay register every client before the first broadcast
    tokio::time::sleep(NETWORK_IDLE).await;

    run_call(&mut participants, NETWORK_IDLE, || {}).await
}

fn parse_args() -> Result<Options, String> {
    let mut options = Options {
        count: DEFAULT_PARTICIPANTS,
        websocket: false,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--relay" => options.websocket = true,
            other => match other.parse::<usize>() {
                Ok(n) if n >= 2 => options.count = n,
                _ => {
                    return Err(format!(
                        "Participant count must be a number of at least 2, got '{other}'"
                    ));
                }
            },
        }
    }
    Ok(options)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut options = match parse_args() {
        Ok(options) => options,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let config = match MeshConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };
    if config.topology == Topology::Pairwise && options.count != 2 {
        info!("Pairwise calls have exactly two participants");
        options.count = 2;
    }
    info!(
        "Simulating {} participants ({:?} topology)",
        options.count, config.topology
    );

    let result = if options.websocket {
        simulate_websocket(options.count, &config).await
    } else {
        simulate_in_process(options.count, &config).await
    };
    match result {
        Ok(true) => info!("Topology complete"),
        Ok(false) => {
            error!("Topology incomplete");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Simulation failed: {}", e);
            std::process::exit(1);
        }
    }
}
