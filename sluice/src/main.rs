use clap::Parser;
use sluice_common::SourceType;
use sluice_core::config::Config;
use sluice_core::playback::{PlaybackHandle, PlaybackProgress, PlaybackService};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// sluice: stream one track to the default output device.
///
/// Transport commands are read from stdin, one per line:
/// `p` pause/resume, `s <secs>` seek, `v <0..1>` volume, `q` quit.
/// Progress events are printed to stdout as JSON lines.
#[derive(Parser)]
#[command(name = "sluice")]
struct Args {
    /// Local file path or http(s) URL of a FLAC file
    source: String,

    /// Track duration in seconds. Read from the FLAC header when omitted.
    #[arg(long, default_value = "0")]
    duration: f64,

    /// Initial volume slider position
    #[arg(long, default_value = "1.0", env = "SLUICE_VOLUME")]
    volume: f32,

    /// Print every state snapshot, not only transitions
    #[arg(long)]
    verbose_state: bool,
}

fn configure_logging() {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_line_number(true)
        .with_target(false)
        .with_file(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() {
    configure_logging();
    let args = Args::parse();

    info!("sluice starting");
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    let handle = PlaybackService::start_default(config, tokio::runtime::Handle::current())
        .unwrap_or_else(|e| {
            error!("Failed to start playback: {e}");
            std::process::exit(1);
        });
    let mut progress_rx = handle.subscribe_progress();

    let source_type = SourceType::detect(&args.source);
    handle.set_volume(args.volume);
    handle.load(args.source.clone(), args.duration, source_type);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut last_state = None;
    let exit_code = loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !run_command(&handle, line.trim()) {
                        break 0;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    stdin_open = false;
                }
            },
            progress = progress_rx.recv() => {
                let Some(progress) = progress else {
                    error!("Playback service stopped unexpectedly");
                    break 1;
                };
                if let PlaybackProgress::State(snapshot) = &progress {
                    let transition = (snapshot.user_paused, snapshot.waiting_for_data);
                    if !args.verbose_state && last_state == Some(transition) {
                        continue;
                    }
                    last_state = Some(transition);
                }
                print_progress(&progress);
                match progress {
                    PlaybackProgress::TrackEnded { .. } => break 0,
                    PlaybackProgress::LoadFailed { message, .. } => {
                        error!("Load failed: {message}");
                        break 1;
                    }
                    _ => {}
                }
            }
        }
    };

    handle.shutdown();
    handle.closed().await;
    info!("sluice stopped");
    std::process::exit(exit_code);
}

/// Apply one stdin command. Returns false on quit.
fn run_command(handle: &PlaybackHandle, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("p"), None) => handle.pause_or_resume(),
        (Some("s"), Some(secs)) => match secs.parse::<f64>() {
            Ok(secs) => handle.seek(secs),
            Err(_) => warn!("Bad seek position: {secs}"),
        },
        (Some("v"), Some(level)) => match level.parse::<f32>() {
            Ok(level) => handle.set_volume(level.clamp(0.0, 1.0)),
            Err(_) => warn!("Bad volume: {level}"),
        },
        (Some("q"), None) => return false,
        (None, _) => {}
        _ => warn!("Unknown command: {line}"),
    }
    true
}

fn print_progress(progress: &PlaybackProgress) {
    match serde_json::to_string(progress) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("Failed to serialize progress: {e}"),
    }
}
