pub mod clock;
pub mod commands;
pub mod display;
pub mod error;
pub mod link;
pub mod pace;
pub mod session;
pub mod settings;
pub mod targets;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use clock::SystemClock;
use commands::{disconnect, execute, get_state, stop_run, AppState, OperatorCommand, HELP};
use display::{DisplayEvent, DisplaySink, JsonLinesSink};
use link::SimulatedRig;
use session::SessionPhase;
use settings::SettingsStore;

pub use error::{Result, RigError, TransportError};

#[derive(Parser, Debug)]
#[command(name = "paceline", version, about = "Drive a running rig from the terminal")]
pub struct Cli {
    /// Rig settings (JSON). Defaults are used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Talk to an in-memory rig instead of a radio.
    #[arg(long)]
    pub simulate: bool,

    /// Name the simulated rig advertises.
    #[arg(long, default_value = "HMSoft")]
    pub rig_name: String,

    /// Override the delay before the CONN handshake.
    #[arg(long)]
    pub settle_ms: Option<u64>,
}

fn init_logging() {
    let debug_mode = std::env::var("PACELINE_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    // Reads RUST_LOG on top of the default level.
    env_logger::Builder::new()
        .filter_level(if debug_mode {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    info!("Paceline starting up...");

    // One thread services operator input, ticks and link callbacks.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(serve(cli))
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let store = match &cli.config {
        Some(path) => SettingsStore::new(path.clone())?,
        None => SettingsStore::in_memory(),
    };
    let mut settings = store.settings();
    if let Some(ms) = cli.settle_ms {
        settings.settle_delay_ms = ms;
    }

    if !cli.simulate {
        bail!("no radio backend in this build; pass --simulate");
    }
    let transport = Arc::new(SimulatedRig::new(cli.rig_name.clone()));

    let sink: Arc<dyn DisplaySink> = Arc::new(JsonLinesSink);
    let state = AppState::new(&settings, transport, sink.clone(), Arc::new(SystemClock))?;
    sink.emit(DisplayEvent::info(HELP));

    drive(&state, BufReader::new(tokio::io::stdin())).await?;
    info!("Paceline shut down");
    Ok(())
}

/// Feeds operator lines into `state` until `quit`, end of input or a read
/// error. The rig is always stopped and released before this returns.
async fn drive<R>(state: &AppState, input: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut outcome = Ok(());

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read operator input: {}", e);
                state
                    .sink
                    .emit(DisplayEvent::error(format!("operator input failed: {e}")));
                outcome = Err(anyhow::Error::new(e).context("Failed to read operator input"));
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<OperatorCommand>() {
            Ok(OperatorCommand::Quit) => break,
            Ok(OperatorCommand::Help) => state.sink.emit(DisplayEvent::info(HELP)),
            Ok(OperatorCommand::State) => {
                let snapshot = get_state(state).await;
                match serde_json::to_string(&snapshot) {
                    Ok(json) => println!("{json}"),
                    Err(e) => state.sink.emit(DisplayEvent::error(e.to_string())),
                }
            }
            Ok(command) => {
                if let Err(e) = execute(state, command).await {
                    warn!("{}", e);
                }
            }
            Err(e) => state.sink.emit(DisplayEvent::error(e)),
        }
    }

    if state.session.phase().await == SessionPhase::Running {
        let _ = stop_run(state).await;
    }
    state.link.flush().await;
    disconnect(state).await;
    outcome
}
