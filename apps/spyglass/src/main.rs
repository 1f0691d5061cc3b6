use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use spyglass_client_core::client::TelemetryClient;
use spyglass_client_core::config::Config;
use spyglass_client_core::logging::{self, LogConfig, LogLevel};
use spyglass_client_core::poll::RestPoller;
use spyglass_client_core::store::StoreChange;

use persona_proto::PolledSession;

#[derive(Parser, Debug)]
#[command(name = "spyglass", about = "Watch a persona study's live telemetry")]
struct Cli {
    /// Study id to watch
    #[arg(long, short = 's', env = "SPYGLASS_STUDY")]
    study: String,

    /// Orchestrator address (host:port), overrides SPYGLASS_SERVER
    #[arg(long)]
    server: Option<String>,

    /// Poll cadence for the REST fallback read, in milliseconds
    #[arg(long, default_value_t = 2_000)]
    poll_ms: u64,

    /// Disable the REST fallback poll
    #[arg(long)]
    no_poll: bool,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::from_env();
    if let Some(server) = cli.server.clone() {
        config.server = server;
    }

    let client = TelemetryClient::new(&config);
    client.connect();
    client.watch_study(&cli.study);

    let store = client.store().clone();
    let mut changes = store.subscribe_changes();
    let poller = RestPoller::new(&config.api_url())?;
    let mut polled: HashMap<String, PolledSession> = HashMap::new();
    let mut poll_tick = tokio::time::interval(Duration::from_millis(cli.poll_ms.max(250)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(StoreChange::Session { session_id, .. }) => {
                    let view = store.resolve_session(&session_id, polled.get(&session_id));
                    println!(
                        "{} · step {} · {} · {}% · {}",
                        view.persona_name,
                        view.step_number,
                        view.emotion,
                        view.task_progress,
                        view.narration,
                    );
                    if view.completed {
                        println!("{} finished ({} steps)", view.persona_name, view.step_number);
                    }
                }
                Ok(StoreChange::Study { .. }) => {
                    if let Some(study) = store.study() {
                        println!("study {} · {}% · phase {:?}", study.study_id, study.percent, study.phase);
                        if let Some(error) = &study.last_error {
                            warn!(error = %error, "study reported an error");
                        }
                        if study.terminal {
                            println!(
                                "study finished: score {:?}, issues {:?}",
                                study.score, study.issue_count
                            );
                            break;
                        }
                    }
                }
                Ok(StoreChange::Reset) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "change stream lagged; views re-read full snapshots");
                }
                Err(RecvError::Closed) => break,
            },
            _ = poll_tick.tick(), if !cli.no_poll => {
                match poller.sessions(&cli.study).await {
                    Ok(fresh) => polled = fresh,
                    Err(err) => debug!(error = %err, "poll failed; relying on live state"),
                }
            }
        }
    }

    client.shutdown();
    Ok(())
}
