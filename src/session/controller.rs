use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    clock::Clock,
    display::{DisplayEvent, DisplaySink},
    error::{Result, RigError},
    link::{Command, DeviceLink},
    log_info,
    targets::TargetSet,
};

use super::{SessionPhase, SessionState, SessionSummary, SessionTargets, Telemetry};

const ENABLE_LOGS: bool = true;

struct Ticker {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

/// Idle -> Running -> Stopped -> Idle.
///
/// The motor and this timer are independent: RUN and STOP are dispatched
/// best-effort and never awaited, so a dead link cannot stall the session.
#[derive(Clone)]
pub struct SessionController {
    state: Arc<Mutex<SessionState>>,
    link: DeviceLink,
    sink: Arc<dyn DisplaySink>,
    clock: Arc<dyn Clock>,
    ticker: Arc<Mutex<Option<Ticker>>>,
    tick_interval: Duration,
}

impl SessionController {
    pub fn new(
        link: DeviceLink,
        sink: Arc<dyn DisplaySink>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::new())),
            link,
            sink,
            clock,
            ticker: Arc::new(Mutex::new(None)),
            tick_interval,
        }
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    pub async fn summary(&self) -> Option<SessionSummary> {
        self.state.lock().await.summary.clone()
    }

    pub async fn start(&self, targets: &TargetSet) -> Result<SessionState> {
        let session_targets = SessionTargets::from_targets(targets)?;

        let snapshot = {
            let mut state = self.state.lock().await;
            if state.phase != SessionPhase::Idle {
                return Err(RigError::invalid_state(state.phase.as_str(), "start"));
            }

            self.link.dispatch(Command::Run);

            let session_id = Uuid::new_v4().to_string();
            state.begin_session(session_id, session_targets, self.clock.now());
            state.clone()
        };

        self.spawn_ticker().await;

        log_info!(
            "Session {} started at {}",
            snapshot.session_id.as_deref().unwrap_or_default(),
            snapshot.target_pace_label()
        );
        self.sink.emit(DisplayEvent::SessionStarted {
            session: snapshot.clone(),
            telemetry: snapshot.telemetry(),
        });

        Ok(snapshot)
    }

    pub async fn stop(&self) -> Result<SessionSummary> {
        let summary = {
            let mut state = self.state.lock().await;
            if state.phase != SessionPhase::Running {
                return Err(RigError::invalid_state(state.phase.as_str(), "stop"));
            }
            self.cancel_ticker().await;
            self.link.dispatch(Command::Stop);
            state.stop(self.clock.now())
        };

        log_info!(
            "Session {} stopped: {} km in {} min",
            summary.session_id,
            summary.total_distance_km,
            summary.total_time_min
        );
        self.sink.emit(DisplayEvent::SessionCompleted {
            summary: summary.clone(),
        });

        Ok(summary)
    }

    /// Discards a stopped session. The link is left alone.
    pub async fn reset(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match state.phase {
                SessionPhase::Idle => return Ok(()),
                SessionPhase::Running => {
                    return Err(RigError::invalid_state(state.phase.as_str(), "reset"));
                }
                SessionPhase::Stopped => state.cancel(),
            }
        }
        self.cancel_ticker().await;
        self.sink.emit(DisplayEvent::SessionReset);
        Ok(())
    }

    /// Runs one tick immediately. `None` unless running.
    pub async fn tick_now(&self) -> Option<Telemetry> {
        tick(&self.state, self.clock.as_ref(), self.sink.as_ref()).await
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(ticker) = ticker_guard.take() {
            ticker.cancel_token.cancel();
            ticker.handle.abort();
        }

        let state = self.state.clone();
        let clock = self.clock.clone();
        let sink = self.sink.clone();
        let tick_interval = self.tick_interval;
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + tick_interval, tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if token.is_cancelled() {
                    break;
                }
                if tick(&state, clock.as_ref(), sink.as_ref()).await.is_none() {
                    break;
                }
            }
        });

        *ticker_guard = Some(Ticker {
            handle,
            cancel_token,
        });
    }

    async fn cancel_ticker(&self) {
        if let Some(ticker) = self.ticker.lock().await.take() {
            ticker.cancel_token.cancel();
            ticker.handle.abort();
        }
    }
}

/// Emits under the state lock so nothing can slip out after a stop.
async fn tick(
    state: &Mutex<SessionState>,
    clock: &dyn Clock,
    sink: &dyn DisplaySink,
) -> Option<Telemetry> {
    let mut guard = state.lock().await;
    if guard.phase != SessionPhase::Running {
        return None;
    }
    guard.sync_elapsed(clock.now());
    let telemetry = guard.telemetry();
    sink.emit(DisplayEvent::SessionTick {
        telemetry: telemetry.clone(),
    });
    Some(telemetry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        display::ChannelSink,
        link::{
            protocol::{HM10_CHARACTERISTIC_UUID, HM10_SERVICE_UUID},
            DeviceFilter, SimulatedRig,
        },
        pace::PaceSpec,
    };
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        rig: SimulatedRig,
        clock: Arc<ManualClock>,
        controller: SessionController,
        rx: UnboundedReceiver<DisplayEvent>,
    }

    fn harness() -> Harness {
        let rig = SimulatedRig::default();
        let (sink, rx) = ChannelSink::new();
        let sink: Arc<dyn DisplaySink> = Arc::new(sink);
        let link = DeviceLink::new(
            Arc::new(rig.clone()),
            sink.clone(),
            DeviceFilter {
                service: HM10_SERVICE_UUID,
                characteristic: HM10_CHARACTERISTIC_UUID,
                name_prefix: None,
            },
            Duration::from_secs(3600),
        );
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap(),
        ));
        let controller =
            SessionController::new(link, sink, clock.clone(), Duration::from_secs(1));
        Harness {
            rig,
            clock,
            controller,
            rx,
        }
    }

    fn five_k() -> TargetSet {
        TargetSet {
            pace: Some(PaceSpec::new(5, 0).unwrap()),
            distance_km: 5.0,
            time_min: 25.0,
            ..TargetSet::default()
        }
    }

    fn drain(rx: &mut UnboundedReceiver<DisplayEvent>) -> Vec<DisplayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn immediate_stop_reports_zero_distance() {
        let h = harness();
        h.controller.start(&five_k()).await.unwrap();
        let summary = h.controller.stop().await.unwrap();
        assert_eq!(summary.total_distance_km, "0.00");
        assert_eq!(summary.total_time_min, 0);
        assert_eq!(summary.avg_pace_label, "5'00\"/km");
        assert_eq!(h.controller.phase().await, SessionPhase::Stopped);
    }

    #[tokio::test]
    async fn tick_uses_wall_clock_floor() {
        let h = harness();
        h.controller.start(&five_k()).await.unwrap();
        h.clock.advance(chrono::Duration::milliseconds(5500));
        let telemetry = h.controller.tick_now().await.unwrap();
        assert_eq!(telemetry.elapsed_seconds, 5);
    }

    #[tokio::test]
    async fn clock_stepping_back_does_not_rewind_telemetry() {
        let h = harness();
        let started = h.controller.start(&five_k()).await.unwrap();
        let started_at = started.started_at.unwrap();

        h.clock.set(started_at + chrono::Duration::seconds(120));
        assert_eq!(h.controller.tick_now().await.unwrap().elapsed_seconds, 120);

        h.clock.set(started_at + chrono::Duration::seconds(30));
        let telemetry = h.controller.tick_now().await.unwrap();
        assert_eq!(telemetry.elapsed_seconds, 120);
        assert_eq!(telemetry.distance_label, "0.40");
    }

    #[tokio::test]
    async fn start_while_running_is_rejected() {
        let h = harness();
        let first = h.controller.start(&five_k()).await.unwrap();
        let err = h.controller.start(&five_k()).await.unwrap_err();
        assert_eq!(err, RigError::invalid_state("running", "start"));
        assert_eq!(
            h.controller.snapshot().await.session_id,
            first.session_id
        );
    }

    #[tokio::test]
    async fn start_without_pace_is_rejected() {
        let h = harness();
        let err = h.controller.start(&TargetSet::default()).await.unwrap_err();
        assert_eq!(err, RigError::InvalidPace);
        assert_eq!(h.controller.phase().await, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn stop_and_reset_follow_the_lifecycle() {
        let h = harness();
        assert!(h.controller.stop().await.is_err());
        h.controller.start(&five_k()).await.unwrap();
        assert_eq!(
            h.controller.reset().await,
            Err(RigError::invalid_state("running", "reset"))
        );
        h.controller.stop().await.unwrap();
        assert!(h.controller.start(&five_k()).await.is_err());
        h.controller.reset().await.unwrap();
        assert_eq!(h.controller.snapshot().await, SessionState::default());
        h.controller.start(&five_k()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_push_telemetry_each_second() {
        let mut h = harness();
        h.controller.start(&five_k()).await.unwrap();
        drain(&mut h.rx);

        for second in 1..=3u64 {
            h.clock.advance(chrono::Duration::seconds(1));
            time::sleep(Duration::from_millis(1001)).await;
            let ticks: Vec<Telemetry> = drain(&mut h.rx)
                .into_iter()
                .filter_map(|event| match event {
                    DisplayEvent::SessionTick { telemetry } => Some(telemetry),
                    _ => None,
                })
                .collect();
            assert_eq!(ticks.len(), 1);
            assert_eq!(ticks[0].elapsed_seconds, second);
            assert_eq!(ticks[0].pace_label, "5'00\"");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_after_stop() {
        let mut h = harness();
        h.controller.start(&five_k()).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(2));
        time::sleep(Duration::from_millis(2001)).await;

        let summary = h.controller.stop().await.unwrap();
        assert_eq!(summary.total_time_min, 0);

        h.clock.advance(chrono::Duration::seconds(10));
        time::sleep(Duration::from_secs(10)).await;

        let events = drain(&mut h.rx);
        let completed = events
            .iter()
            .position(|e| matches!(e, DisplayEvent::SessionCompleted { .. }))
            .unwrap();
        assert!(events[completed + 1..]
            .iter()
            .all(|e| !matches!(e, DisplayEvent::SessionTick { .. })));
        assert_eq!(h.controller.tick_now().await, None);
    }

    #[tokio::test]
    async fn session_runs_without_a_link() {
        let h = harness();
        h.controller.start(&five_k()).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(90));
        h.controller.tick_now().await.unwrap();
        let summary = h.controller.stop().await.unwrap();
        assert_eq!(summary.total_distance_km, "0.30");
        assert_eq!(summary.total_time_min, 1);
        assert!(h.rig.written_lines().is_empty());
    }

    #[tokio::test]
    async fn run_and_stop_reach_a_connected_rig_in_order() {
        let h = harness();
        h.controller.link().connect().await.unwrap();
        h.controller.start(&five_k()).await.unwrap();
        h.controller.stop().await.unwrap();
        h.controller.link().flush().await;
        assert_eq!(h.rig.written_lines(), vec!["RUN", "STOP"]);
    }

    #[tokio::test]
    async fn failed_writes_do_not_touch_the_session() {
        let h = harness();
        h.controller.link().connect().await.unwrap();
        h.rig.set_write_failure(true);

        h.controller.start(&five_k()).await.unwrap();
        h.controller.link().flush().await;
        assert_eq!(h.controller.phase().await, SessionPhase::Running);
        assert!(h.controller.link().is_connected().await);

        h.controller.stop().await.unwrap();
        assert_eq!(h.controller.phase().await, SessionPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_writes_do_not_delay_ticks() {
        let mut h = harness();
        h.controller.link().connect().await.unwrap();
        h.rig.set_write_delay(Duration::from_secs(5));

        h.controller.start(&five_k()).await.unwrap();
        drain(&mut h.rx);
        h.clock.advance(chrono::Duration::seconds(1));
        time::sleep(Duration::from_millis(1001)).await;

        assert!(h.rig.written_lines().is_empty());
        assert!(drain(&mut h.rx)
            .iter()
            .any(|e| matches!(e, DisplayEvent::SessionTick { telemetry } if telemetry.elapsed_seconds == 1)));
    }

    #[tokio::test]
    async fn start_emits_initial_display() {
        let mut h = harness();
        h.controller.start(&five_k()).await.unwrap();
        let events = drain(&mut h.rx);
        match events.last() {
            Some(DisplayEvent::SessionStarted { telemetry, .. }) => {
                assert_eq!(telemetry.distance_label, "0.00");
                assert_eq!(telemetry.elapsed_minutes, 0);
                assert_eq!(telemetry.pace_label, "5'00\"");
            }
            other => panic!("expected session-started, got {other:?}"),
        }
    }
}
