use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    display::{DisplayEvent, DisplaySink},
    error::{Result, RigError},
    pace::{pace_label, pace_to_speed, PaceOptions, PaceSpec},
};

/// Which target is currently derived from the other two and read-only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LockedField {
    #[default]
    None,
    Time,
    Pace,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetSet {
    pub pace: Option<PaceSpec>,
    pub distance_km: f64,
    pub time_min: f64,
    pub locked_field: LockedField,
}

impl TargetSet {
    pub fn target_speed_kmh(&self) -> Option<f64> {
        self.pace.and_then(|pace| pace_to_speed(pace).ok())
    }

    pub fn pace_label(&self) -> Option<String> {
        self.pace.map(pace_label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub targets: TargetSet,
    /// Set when a pace had to be derived but no selector value fits.
    pub notice: Option<RigError>,
}

/// Keeps pace, distance and time consistent: any two determine the third.
///
/// Precedence, evaluated after every edit:
/// 1. pace and distance set: time = distance / speed, whole minutes, time locked.
/// 2. otherwise distance and time set: speed = distance / time, rounded to whole
///    km/h and mapped onto the nearest selector value, pace locked. A speed with
///    no selector value clears the pace and reports `NoMatchingPace`.
///
/// Typing into the locked field unlocks it and makes it an input again.
/// Rounding is to whole minutes and whole km/h only; paces are never matched
/// fractionally.
pub struct ParameterResolver {
    targets: TargetSet,
    options: PaceOptions,
    sink: Option<Arc<dyn DisplaySink>>,
}

impl ParameterResolver {
    pub fn new(options: PaceOptions) -> Self {
        Self {
            targets: TargetSet::default(),
            options,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn DisplaySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn targets(&self) -> TargetSet {
        self.targets.clone()
    }

    pub fn options(&self) -> &PaceOptions {
        &self.options
    }

    pub fn set_pace(&mut self, pace: PaceSpec) -> Result<Resolution> {
        if pace.is_zero() {
            return Err(RigError::InvalidPace);
        }
        if self.targets.locked_field == LockedField::Pace {
            self.targets.locked_field = LockedField::None;
        }
        self.targets.pace = Some(pace);
        Ok(self.resolve())
    }

    pub fn clear_pace(&mut self) -> Resolution {
        if self.targets.locked_field == LockedField::Pace {
            self.targets.locked_field = LockedField::None;
        }
        self.targets.pace = None;
        self.resolve()
    }

    pub fn set_distance(&mut self, distance_km: f64) -> Result<Resolution> {
        check_non_negative("distance", distance_km)?;
        self.targets.distance_km = distance_km;
        Ok(self.resolve())
    }

    pub fn set_time(&mut self, time_min: f64) -> Result<Resolution> {
        check_non_negative("time", time_min)?;
        if self.targets.locked_field == LockedField::Time {
            // The operator now drives time, so pace becomes the derived field.
            self.targets.locked_field = if time_min > 0.0 {
                LockedField::Pace
            } else {
                LockedField::None
            };
        }
        self.targets.time_min = time_min;
        Ok(self.resolve())
    }

    /// Back to an empty form, keeping the selector options.
    pub fn reset(&mut self) -> Resolution {
        self.targets = TargetSet::default();
        self.resolve()
    }

    fn resolve(&mut self) -> Resolution {
        let notice = self.recompute();
        let resolution = Resolution {
            targets: self.targets.clone(),
            notice,
        };

        debug!(
            "targets resolved: pace={:?} distance={} time={} locked={:?}",
            resolution.targets.pace,
            resolution.targets.distance_km,
            resolution.targets.time_min,
            resolution.targets.locked_field
        );

        if let Some(sink) = &self.sink {
            sink.emit(DisplayEvent::TargetsChanged {
                targets: resolution.targets.clone(),
            });
            if let Some(notice) = &resolution.notice {
                sink.emit(DisplayEvent::warning(notice.to_string()));
            }
        }

        resolution
    }

    fn recompute(&mut self) -> Option<RigError> {
        let targets = &mut self.targets;

        // Derived values are outputs, not inputs.
        let pace_input = match targets.locked_field {
            LockedField::Pace => None,
            _ => targets.pace,
        };
        let time_input = match targets.locked_field {
            LockedField::Time => 0.0,
            _ => targets.time_min,
        };
        let distance = targets.distance_km;

        let speed = pace_input
            .and_then(|pace| pace_to_speed(pace).ok())
            .filter(|speed| *speed > 0.0);

        if let Some(speed) = speed {
            if distance > 0.0 {
                targets.time_min = (distance / speed * 60.0).round();
                targets.locked_field = LockedField::Time;
                return None;
            }
        }

        if speed.is_none() && distance > 0.0 && time_input > 0.0 {
            let derived_speed = distance / (time_input / 60.0);
            return match self.options.nearest(derived_speed) {
                Ok(pace) => {
                    targets.pace = Some(pace);
                    targets.locked_field = LockedField::Pace;
                    None
                }
                Err(err) => {
                    targets.pace = None;
                    targets.locked_field = LockedField::None;
                    Some(err)
                }
            };
        }

        if targets.locked_field == LockedField::Pace {
            // A derived pace with nothing left to derive it from is stale.
            targets.pace = None;
        }
        targets.locked_field = LockedField::None;
        None
    }
}

fn check_non_negative(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(RigError::InvalidValue { field, value })
    }
}
