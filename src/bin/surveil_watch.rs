//! surveil_watch - live terminal view of a detection backend
//!
//! Mounts a stream session against the backend's prediction endpoint, reads
//! the video feed alongside it, and redraws the status whenever either
//! changes. Ctrl-C unmounts the session and exits.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use surveil_client::{
    render, ClientConfig, FrameSource, FrameView, StreamSession, TransportKind, VisualOutput,
};

#[path = "../ui.rs"]
mod ui;

const REDRAW_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Backend address (host[:port]); port 8000 when omitted.
    #[arg(long, env = "SURVEIL_BACKEND")]
    backend: Option<String>,
    /// Prediction transport (ws|poll).
    #[arg(long, value_name = "KIND")]
    transport: Option<String>,
    /// Do not read the video feed.
    #[arg(long)]
    no_frames: bool,
    /// Exit after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECS")]
    duration_s: Option<u64>,
    /// UI mode for status output (auto|plain|pretty|json)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty);

    let config = {
        let _stage = ui.stage("Load configuration");
        let mut config = ClientConfig::load()?;
        if let Some(backend) = &args.backend {
            config = config.with_backend(backend)?;
        }
        if let Some(kind) = &args.transport {
            config.transport = TransportKind::parse(kind)?;
        }
        config
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("install Ctrl-C handler")?;
    }

    let mut frames = if args.no_frames {
        None
    } else {
        let _stage = ui.stage("Start video feed");
        Some(FrameSource::start(config.frame_source_config())?)
    };

    let mut session = {
        let _stage = ui.stage("Mount stream session");
        StreamSession::from_config(&config)?
    };
    log::info!(
        "watching {} via {} transport",
        session.endpoint(),
        session.transport_name()
    );

    let deadline = args
        .duration_s
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut board = ui.status_board();
    let result = watch(&mut session, frames.as_ref(), &running, deadline, |output| {
        board.show(present(output, ui.mode())?);
        Ok(())
    });

    let final_view = session.unmount();
    if let Some(frames) = frames.as_mut() {
        frames.stop();
    }
    board.finish(&format!(
        "stream closed ({} updates, last phase {})",
        final_view.revision, final_view.phase
    ));
    result
}

fn watch(
    session: &mut StreamSession,
    frames: Option<&surveil_client::FrameSourceHandle>,
    running: &AtomicBool,
    deadline: Option<Instant>,
    mut draw: impl FnMut(&VisualOutput) -> Result<()>,
) -> Result<()> {
    while running.load(Ordering::SeqCst) {
        session.pump(REDRAW_INTERVAL)?;
        let now = Instant::now();
        let frame_view = frames
            .map(|frames| frames.view(now))
            .unwrap_or_else(FrameView::disabled);
        draw(&render(session.view(), &frame_view))?;
        if deadline.is_some_and(|deadline| now >= deadline) {
            break;
        }
    }
    Ok(())
}

fn present(output: &VisualOutput, mode: ui::UiMode) -> Result<String> {
    if mode == ui::UiMode::Json {
        return serde_json::to_string(output).context("serialize status");
    }
    Ok(output.to_string())
}
