//! Operator-facing handlers: the buttons and fields of the control surface.
//!
//! Handlers return `Result<_, String>` for the front end and make sure every
//! failure also reaches the display as a status line.

use std::{str::FromStr, sync::Arc};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    clock::Clock,
    display::{DisplayEvent, DisplaySink},
    error::RigError,
    link::{ConnectionState, DeviceLink, LinkTransport},
    log_debug,
    pace::PaceSpec,
    session::{SessionController, SessionState, SessionSummary},
    settings::RigSettings,
    targets::{ParameterResolver, TargetSet},
};

const ENABLE_LOGS: bool = true;

pub struct AppState {
    pub resolver: Mutex<ParameterResolver>,
    pub link: DeviceLink,
    pub session: SessionController,
    pub sink: Arc<dyn DisplaySink>,
}

impl AppState {
    pub fn new(
        settings: &RigSettings,
        transport: Arc<dyn LinkTransport>,
        sink: Arc<dyn DisplaySink>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let resolver = ParameterResolver::new(settings.pace_options()?).with_sink(sink.clone());
        let link = DeviceLink::new(
            transport,
            sink.clone(),
            settings.device_filter(),
            settings.settle_delay(),
        );
        let session =
            SessionController::new(link.clone(), sink.clone(), clock, settings.tick_interval());

        Ok(Self {
            resolver: Mutex::new(resolver),
            link,
            session,
            sink,
        })
    }

    fn report(&self, err: RigError) -> String {
        let message = err.to_string();
        self.sink.emit(DisplayEvent::error(message.clone()));
        message
    }

    /// The link puts its own connect failures on the display; only refusals
    /// made before any attempt still need reporting.
    fn report_link(&self, err: RigError) -> String {
        match err {
            RigError::InvalidStateTransition { .. } => self.report(err),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlSnapshot {
    pub connection: ConnectionState,
    pub targets: TargetSet,
    pub session: SessionState,
}

pub async fn get_state(state: &AppState) -> ControlSnapshot {
    ControlSnapshot {
        connection: state.link.state().await,
        targets: state.resolver.lock().await.targets(),
        session: state.session.snapshot().await,
    }
}

pub async fn set_pace(state: &AppState, value: &str) -> Result<TargetSet, String> {
    let mut resolver = state.resolver.lock().await;
    let pace = PaceSpec::parse(value).map_err(|e| state.report(e))?;
    if !resolver.options().contains(pace) {
        let message = format!("{} is not on the pace selector", pace.label());
        state.sink.emit(DisplayEvent::error(message.clone()));
        return Err(message);
    }
    resolver
        .set_pace(pace)
        .map(|resolution| resolution.targets)
        .map_err(|e| state.report(e))
}

pub async fn clear_pace(state: &AppState) -> TargetSet {
    state.resolver.lock().await.clear_pace().targets
}

pub async fn set_distance(state: &AppState, distance_km: f64) -> Result<TargetSet, String> {
    state
        .resolver
        .lock()
        .await
        .set_distance(distance_km)
        .map(|resolution| resolution.targets)
        .map_err(|e| state.report(e))
}

pub async fn set_time(state: &AppState, time_min: f64) -> Result<TargetSet, String> {
    state
        .resolver
        .lock()
        .await
        .set_time(time_min)
        .map(|resolution| resolution.targets)
        .map_err(|e| state.report(e))
}

pub async fn toggle_connection(state: &AppState) -> Result<ConnectionState, String> {
    state.link.toggle().await.map_err(|e| state.report_link(e))?;
    Ok(state.link.state().await)
}

pub async fn connect(state: &AppState) -> Result<ConnectionState, String> {
    state.link.connect().await.map_err(|e| state.report_link(e))?;
    Ok(state.link.state().await)
}

pub async fn disconnect(state: &AppState) -> ConnectionState {
    state.link.disconnect().await;
    state.link.state().await
}

pub async fn start_run(state: &AppState) -> Result<SessionState, String> {
    let targets = state.resolver.lock().await.targets();
    state
        .session
        .start(&targets)
        .await
        .map_err(|e| state.report(e))
}

pub async fn stop_run(state: &AppState) -> Result<SessionSummary, String> {
    state.session.stop().await.map_err(|e| state.report(e))
}

/// Back to setup. Targets stay as entered.
pub async fn restart(state: &AppState) -> Result<(), String> {
    state.session.reset().await.map_err(|e| state.report(e))
}

/// One line of operator input.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Pace(String),
    ClearPace,
    Distance(f64),
    Time(f64),
    Connect,
    Disconnect,
    Toggle,
    Run,
    Stop,
    Restart,
    State,
    Help,
    Quit,
}

pub const HELP: &str = "commands: pace M:SS | pace clear | distance KM | time MIN | \
connect | disconnect | toggle | run | stop | restart | state | help | quit";

impl FromStr for OperatorCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| "empty command".to_string())?;
        let arg = parts.next();
        if parts.next().is_some() {
            return Err(format!("too many arguments for {verb}"));
        }

        let number = |name: &str| -> Result<f64, String> {
            let raw = arg.ok_or_else(|| format!("{name} needs a value"))?;
            raw.parse::<f64>()
                .map_err(|_| format!("{name} must be a number, got {raw}"))
        };

        let command = match (verb.to_ascii_lowercase().as_str(), arg) {
            ("pace", Some("clear")) => OperatorCommand::ClearPace,
            ("pace", Some(value)) => OperatorCommand::Pace(value.to_string()),
            ("pace", None) => return Err("pace needs a value like 5:30".into()),
            ("distance", _) => OperatorCommand::Distance(number("distance")?),
            ("time", _) => OperatorCommand::Time(number("time")?),
            ("connect", None) => OperatorCommand::Connect,
            ("disconnect", None) => OperatorCommand::Disconnect,
            ("toggle", None) => OperatorCommand::Toggle,
            ("run" | "start", None) => OperatorCommand::Run,
            ("stop", None) => OperatorCommand::Stop,
            ("restart" | "reset", None) => OperatorCommand::Restart,
            ("state", None) => OperatorCommand::State,
            ("help", None) => OperatorCommand::Help,
            ("quit" | "exit", None) => OperatorCommand::Quit,
            (other, _) => return Err(format!("unknown command: {other}")),
        };
        Ok(command)
    }
}

/// Applies one operator command. `State`, `Help` and `Quit` belong to the
/// caller's loop and are no-ops here.
pub async fn execute(state: &AppState, command: OperatorCommand) -> Result<(), String> {
    log_debug!("operator: {:?}", command);
    match command {
        OperatorCommand::Pace(value) => set_pace(state, &value).await.map(|_| ()),
        OperatorCommand::ClearPace => {
            clear_pace(state).await;
            Ok(())
        }
        OperatorCommand::Distance(km) => set_distance(state, km).await.map(|_| ()),
        OperatorCommand::Time(min) => set_time(state, min).await.map(|_| ()),
        OperatorCommand::Connect => connect(state).await.map(|_| ()),
        OperatorCommand::Disconnect => {
            disconnect(state).await;
            Ok(())
        }
        OperatorCommand::Toggle => toggle_connection(state).await.map(|_| ()),
        OperatorCommand::Run => start_run(state).await.map(|_| ()),
        OperatorCommand::Stop => stop_run(state).await.map(|_| ()),
        OperatorCommand::Restart => restart(state).await,
        OperatorCommand::State | OperatorCommand::Help | OperatorCommand::Quit => Ok(()),
    }
}
