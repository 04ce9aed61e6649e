use clap::{Parser, Subcommand};
use client::interpolation::InterpolationBuffer;
use client::network::{ObserverClient, DEFAULT_JOIN_TIMEOUT};
use client::replay::{Recording, ReplayReconstructor};
use log::{error, info, warn};
use shared::storage::DEFAULT_RECORDING_DIR;
use shared::{unix_time_secs, FileRecordingStorage, RecordingStorage, DEFAULT_PORT};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch a live relay and report the interpolated scene
    Watch {
        /// Relay address to connect to
        #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
        server: String,

        /// Name sent with the join request
        #[arg(short, long, default_value = "observer")]
        name: String,

        /// Steer the server's avatar in a slow circle
        #[arg(long)]
        steer: bool,
    },
    /// Replay a recorded session
    Replay {
        /// Recording file to play
        path: PathBuf,

        /// Playback speed multiplier
        #[arg(long, default_value = "1.0")]
        speed: f64,

        /// Print the scene at this many seconds in and exit
        #[arg(long)]
        at: Option<f64>,
    },
    /// List recordings, oldest first
    List {
        #[arg(short, long, default_value = DEFAULT_RECORDING_DIR)]
        dir: PathBuf,
    },
    /// Connect many observers at once and report throughput
    Stress {
        #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
        server: String,

        /// Number of concurrent observers
        #[arg(short, long, default_value = "50")]
        clients: usize,

        /// Seconds to run for
        #[arg(short, long, default_value = "30")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    match args.command {
        Command::Watch {
            server,
            name,
            steer,
        } => watch(&server, &name, steer).await,
        Command::Replay { path, speed, at } => replay(&path, speed, at).await,
        Command::List { dir } => list(dir),
        Command::Stress {
            server,
            clients,
            duration,
        } => stress(&server, clients, Duration::from_secs(duration)).await,
    }
}

async fn watch(server: &str, name: &str, steer: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Connecting to: {}", server);
    let mut observer = ObserverClient::connect(server).await?;
    observer.join(name, DEFAULT_JOIN_TIMEOUT).await?;

    let buffer = InterpolationBuffer::shared();
    let (reader, mut writer) = observer.split();
    let mut receiver = tokio::spawn(reader.run(buffer.clone()));

    // Render-rate sampling, ~60Hz
    let mut frame_timer = interval(Duration::from_millis(16));
    frame_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            result = &mut receiver => {
                match result {
                    Ok(Ok(frames)) => info!("Relay closed after {} snapshots", frames),
                    Ok(Err(e)) => error!("Connection lost: {}", e),
                    Err(e) => error!("Receiver task failed: {}", e),
                }
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting");
                receiver.abort();
                return Ok(());
            }
            _ = frame_timer.tick() => {
                let scene = match buffer.lock() {
                    Ok(buffer) => buffer.sample(unix_time_secs()),
                    Err(poisoned) => poisoned.into_inner().sample(unix_time_secs()),
                };

                if steer {
                    let angle = started.elapsed().as_secs_f32() * 0.5;
                    if let Err(e) = writer.send_input(angle.cos(), angle.sin()).await {
                        warn!("Failed to send input: {}", e);
                    }
                }

                if last_report.elapsed() >= Duration::from_secs(1) {
                    last_report = Instant::now();
                    match scene {
                        Some(scene) => info!(
                            "[{}] {} entities at t={:.3}",
                            scene.state,
                            scene.entities.len(),
                            scene.timestamp
                        ),
                        None => info!("Waiting for snapshots..."),
                    }
                }
            }
        }
    }
}

async fn replay(
    path: &Path,
    speed: f64,
    at: Option<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = FileRecordingStorage::default();
    let recording = Recording::load(&storage, path)?;
    if recording.skipped > 0 {
        warn!("{} malformed lines were skipped", recording.skipped);
    }
    if let Some(header) = recording.header {
        info!(
            "Recording v{} on a {}x{} canvas",
            header.version, header.width, header.height
        );
    }
    info!(
        "{} keyframes, {:.2}s long",
        recording.keyframes.len(),
        recording.duration()
    );

    let mut replay = ReplayReconstructor::new(recording);
    let start = replay.cursor();

    if let Some(offset) = at {
        replay.scrub(start + offset);
        for object in replay.active_objects() {
            println!(
                "{:<12} ({:>8.2}, {:>8.2}) {:?} {}x{}",
                object.id, object.x, object.y, object.shape, object.width, object.height
            );
        }
        return Ok(());
    }

    let mut frame_timer = interval(Duration::from_millis(16));
    frame_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick = Instant::now();
    let mut last_report = Instant::now();

    while !replay.is_finished() {
        frame_timer.tick().await;
        let dt = last_tick.elapsed().as_secs_f64() * speed.max(0.0);
        last_tick = Instant::now();

        let previous = replay.cursor();
        replay.advance(dt);
        for input in replay.recording().inputs_between(previous, replay.cursor()) {
            info!("t={:.2} keys {:?}", input.t - start, input.keys);
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            info!(
                "t={:.2}/{:.2} {} active objects",
                replay.cursor() - start,
                replay.duration(),
                replay.active_objects().len()
            );
        }
    }

    info!("Replay finished, {} objects seen", replay.objects().len());
    Ok(())
}

fn list(dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let storage = FileRecordingStorage::new(dir);
    let recordings = storage.list_recordings()?;
    if recordings.is_empty() {
        println!("No recordings in {}", storage.root().display());
    }
    for path in recordings {
        println!("{}", path.display());
    }
    Ok(())
}

async fn stress(
    server: &str,
    clients: usize,
    duration: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting {} observers against {}", clients, server);
    let frames = Arc::new(AtomicU64::new(0));
    let mut tasks = Vec::with_capacity(clients);

    for id in 0..clients {
        let server = server.to_string();
        let frames = Arc::clone(&frames);
        tasks.push(tokio::spawn(async move {
            let mut observer = match ObserverClient::connect(&server).await {
                Ok(observer) => observer,
                Err(e) => {
                    warn!("Observer {} failed to connect: {}", id, e);
                    return;
                }
            };
            if let Err(e) = observer
                .join(&format!("Client_{}", id), DEFAULT_JOIN_TIMEOUT)
                .await
            {
                warn!("Observer {} failed to join: {}", id, e);
                return;
            }
            loop {
                match observer.next_snapshot().await {
                    Ok(Some(_)) => {
                        frames.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!("Observer {} lost connection: {}", id, e);
                        return;
                    }
                }
            }
        }));
        // Stagger connections slightly
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    let mut report = interval(Duration::from_secs(5));
    report.tick().await;
    while started.elapsed() < duration {
        report.tick().await;
        let total = frames.load(Ordering::Relaxed);
        let alive = tasks.iter().filter(|t| !t.is_finished()).count();
        info!(
            "{} observers alive, {} frames received ({:.1}/s)",
            alive,
            total,
            total as f64 / started.elapsed().as_secs_f64()
        );
    }

    for task in &tasks {
        task.abort();
    }
    info!(
        "Stress test finished: {} frames in {:.1}s",
        frames.load(Ordering::Relaxed),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
