use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, RigError},
    pace::{pace_label, pace_to_speed, PaceSpec},
    targets::TargetSet,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Running,
    Stopped,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Running => "running",
            SessionPhase::Stopped => "stopped",
        }
    }
}

/// Targets frozen at run start; later edits to the form do not reach a
/// running session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionTargets {
    pub pace: PaceSpec,
    pub pace_label: String,
    pub speed_kmh: f64,
    pub distance_km: f64,
    pub time_min: f64,
}

impl SessionTargets {
    pub fn from_targets(targets: &TargetSet) -> Result<Self> {
        let pace = targets.pace.ok_or(RigError::InvalidPace)?;
        Ok(Self {
            pace,
            pace_label: pace_label(pace),
            speed_kmh: pace_to_speed(pace)?,
            distance_km: targets.distance_km,
            time_min: targets.time_min,
        })
    }
}

/// What the running screen shows, once per tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub elapsed_seconds: u64,
    pub elapsed_minutes: u64,
    /// Target speed times elapsed time; no sensor is involved.
    pub virtual_distance_km: f64,
    pub distance_label: String,
    pub pace_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub total_distance_km: String,
    pub total_time_min: u64,
    pub avg_pace_label: String,
    pub target_distance_km: f64,
    pub target_time_min: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub phase: SessionPhase,
    pub session_id: Option<String>,
    pub targets: Option<SessionTargets>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    /// Last distance pushed to the display.
    pub virtual_distance_km: f64,
    pub summary: Option<SessionSummary>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_speed_kmh(&self) -> f64 {
        self.targets.as_ref().map_or(0.0, |t| t.speed_kmh)
    }

    pub fn target_pace_label(&self) -> String {
        self.targets
            .as_ref()
            .map(|t| t.pace_label.clone())
            .unwrap_or_default()
    }

    pub fn begin_session(
        &mut self,
        session_id: String,
        targets: SessionTargets,
        started_at: DateTime<Utc>,
    ) {
        *self = Self {
            phase: SessionPhase::Running,
            session_id: Some(session_id),
            targets: Some(targets),
            started_at: Some(started_at),
            elapsed_seconds: 0,
            virtual_distance_km: 0.0,
            summary: None,
        };
    }

    /// Whole seconds since start, read off the wall clock so a late tick
    /// still lands on the right second.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> u64 {
        let Some(started_at) = self.started_at else {
            return 0;
        };
        let elapsed_ms = (now - started_at).num_milliseconds().max(0) as u64;
        elapsed_ms / 1000
    }

    /// Advances elapsed time and the virtual distance. Never moves backwards.
    pub fn sync_elapsed(&mut self, now: DateTime<Utc>) {
        if self.phase != SessionPhase::Running {
            return;
        }
        self.elapsed_seconds = self.elapsed_seconds.max(self.elapsed_at(now));
        let hours = self.elapsed_seconds as f64 / 3600.0;
        self.virtual_distance_km = self.target_speed_kmh() * hours;
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            elapsed_seconds: self.elapsed_seconds,
            elapsed_minutes: self.elapsed_seconds / 60,
            virtual_distance_km: self.virtual_distance_km,
            distance_label: format_distance(self.virtual_distance_km),
            pace_label: self.target_pace_label(),
        }
    }

    /// Freezes what was last displayed into the summary.
    pub fn stop(&mut self, stopped_at: DateTime<Utc>) -> SessionSummary {
        let targets = self.targets.clone();
        let summary = SessionSummary {
            session_id: self.session_id.clone().unwrap_or_default(),
            started_at: self.started_at.unwrap_or(stopped_at),
            stopped_at,
            total_distance_km: format_distance(self.virtual_distance_km),
            total_time_min: self.elapsed_seconds / 60,
            avg_pace_label: format!("{}/km", self.target_pace_label()),
            target_distance_km: targets.as_ref().map_or(0.0, |t| t.distance_km),
            target_time_min: targets.as_ref().map_or(0.0, |t| t.time_min),
        };
        self.phase = SessionPhase::Stopped;
        self.summary = Some(summary.clone());
        summary
    }

    pub fn cancel(&mut self) {
        *self = Self::default();
    }
}

pub fn format_distance(km: f64) -> String {
    format!("{km:.2}")
}
