use clap::Parser;
use log::{error, info, warn};
use server::actor::Envelope;
use server::arena::{steering_keys, Arena, ArenaConfig};
use server::directory::ActorDirectory;
use server::dispatcher::{
    BroadcastDispatcher, DispatchMessage, LatestSnapshot, BROADCAST_INTERVAL, DISPATCHER_ID,
};
use server::recording::{Recorder, RecordingConfig};
use server::transport::{ObserverStats, TransportConfig, TransportServer};
use shared::storage::DEFAULT_RECORDING_DIR;
use shared::{unix_time_secs, FileRecordingStorage, RecordingStorage, DEFAULT_PORT};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the observer listener to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Simulation ticks per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Units spawned per team in the demo arena
    #[arg(short, long, default_value = "6")]
    units: usize,

    /// Record the session to a .jsonl log
    #[arg(short, long)]
    record: bool,

    /// Directory recordings are written to
    #[arg(long, default_value = DEFAULT_RECORDING_DIR)]
    recording_dir: PathBuf,

    /// Seconds between actor stats reports, 0 disables them
    #[arg(short, long, default_value = "10")]
    monitor: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let bind_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let latest = LatestSnapshot::new();
    let directory = Arc::new(ActorDirectory::new());
    let (dispatcher, counters) = BroadcastDispatcher::mailbox(latest.clone(), BROADCAST_INTERVAL);
    directory.register(Arc::new(dispatcher));
    if args.monitor > 0 {
        directory.start_monitoring(Duration::from_secs(args.monitor))?;
    }

    let observers = Arc::new(ObserverStats::new());
    let config = TransportConfig {
        bind_addr,
        ..TransportConfig::default()
    };
    let transport = TransportServer::bind(config, latest, observers.clone())
        .await?
        .spawn();
    info!("Relay listening on {}", transport.local_addr());

    let recorder = if args.record {
        let storage: Arc<dyn RecordingStorage> =
            Arc::new(FileRecordingStorage::new(&args.recording_dir));
        let defaults = RecordingConfig::default();
        let file_name = defaults
            .output_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("session.jsonl"));
        let config = RecordingConfig {
            output_path: args.recording_dir.join(file_name),
            ..defaults
        };
        let mut recorder = Recorder::new(config, storage);
        recorder.start(shared::WORLD_WIDTH, shared::WORLD_HEIGHT)?;
        Some(recorder)
    } else {
        None
    };

    let arena = Arena::new(ArenaConfig {
        units_per_team: args.units,
        ..ArenaConfig::default()
    });
    let running = Arc::new(AtomicBool::new(true));
    let simulation = {
        let directory = Arc::clone(&directory);
        let observers = Arc::clone(&observers);
        let running = Arc::clone(&running);
        let tick_rate = args.tick_rate.max(1);
        thread::Builder::new()
            .name("simulation".to_string())
            .spawn(move || {
                run_simulation(arena, recorder, directory, observers, running, tick_rate)
            })?
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");

    running.store(false, Ordering::Release);
    if simulation.join().is_err() {
        error!("Simulation thread panicked");
    }
    transport.shutdown().await?;
    directory.shutdown();

    info!(
        "Published {} snapshots, {} rate limited",
        counters.published(),
        counters.rate_limited()
    );
    Ok(())
}

/// Fixed-rate loop: step the arena, hand the frame to the dispatcher, record it
fn run_simulation(
    mut arena: Arena,
    mut recorder: Option<Recorder>,
    directory: Arc<ActorDirectory<DispatchMessage>>,
    observers: Arc<ObserverStats>,
    running: Arc<AtomicBool>,
    tick_rate: u32,
) {
    let tick = Duration::from_secs_f64(1.0 / tick_rate as f64);
    // Cap the maximum delta time to 50ms
    let max_delta_time = 1.0 / 20.0;
    let mut last_update = Instant::now();
    let mut last_input_count = 0;

    while running.load(Ordering::Acquire) {
        let frame_start = Instant::now();
        let mut delta_time = (frame_start - last_update).as_secs_f32();
        last_update = frame_start;
        if delta_time > max_delta_time {
            warn!(
                "Large delta time detected ({:.3}s), capping to {:.3}s",
                delta_time, max_delta_time
            );
            delta_time = max_delta_time;
        }

        // Keys recorded this tick, only when a fresh observer input arrived
        let mut pressed = Vec::new();
        let input_count = observers.inputs();
        if input_count != last_input_count {
            last_input_count = input_count;
            if let Some((vx, vy)) = observers.last_input() {
                arena.set_avatar_velocity(vx, vy);
                pressed = steering_keys(vx, vy);
            }
        }

        arena.step(delta_time);

        let snapshot = arena.snapshot(unix_time_secs());
        directory.send(
            DISPATCHER_ID,
            Envelope::new("simulation", DispatchMessage::Snapshot(snapshot)),
        );

        if let Some(recorder) = recorder.as_mut() {
            recorder.update(delta_time as f64, &arena, &pressed);
        }

        if let Some(remaining) = tick.checked_sub(frame_start.elapsed()) {
            thread::sleep(remaining);
        }
    }

    if let Some(mut recorder) = recorder {
        recorder.stop(Some(&arena));
    }
}
