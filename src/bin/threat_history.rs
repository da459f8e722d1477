//! threat_history - print past detections recorded by the backend

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::time::Duration;

use surveil_client::{render_history_table, ClientConfig, HistoryClient};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Backend address (host[:port]); port 8000 when omitted.
    #[arg(long, env = "SURVEIL_BACKEND")]
    backend: Option<String>,
    /// Full history URL, overriding the one derived from the backend.
    #[arg(long)]
    url: Option<String>,
    /// Request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_s: u64,
    /// UI mode for output (auto|plain|pretty|json)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty);

    let url = match args.url {
        Some(url) => url,
        None => {
            let mut config = ClientConfig::load()?;
            if let Some(backend) = &args.backend {
                config = config.with_backend(backend)?;
            }
            config.history_url()
        }
    };

    let client = HistoryClient::new(url, Duration::from_secs(args.timeout_s.max(1)));
    let entries = {
        let _stage = ui.stage("Fetch threat history");
        client.fetch()?
    };
    log::info!("{} entries from {}", entries.len(), client.url());

    if ui.mode() == ui::UiMode::Json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("serialize history")?
        );
    } else {
        print!("{}", render_history_table(&entries));
    }
    Ok(())
}
