use crate::error::{Result, RigError};

use super::converter::{pace_to_speed, PaceSpec};

pub const DEFAULT_PACE_OPTIONS: &[&str] = &[
    "4:00", "4:30", "5:00", "5:30", "6:00", "6:30", "7:00", "7:30", "8:00", "8:30", "9:00",
    "9:30", "10:00",
];

/// The discrete values offered by the pace selector.
///
/// A derived speed is only ever mapped onto one of these; speeds outside
/// `min_speed_kmh..=max_speed_kmh` have no match.
#[derive(Debug, Clone, PartialEq)]
pub struct PaceOptions {
    options: Vec<(PaceSpec, f64)>,
    min_speed_kmh: f64,
    max_speed_kmh: f64,
}

impl PaceOptions {
    /// Builds the selector from "M:SS" strings. The supported speed range is
    /// the span of the options' speeds rounded to whole km/h.
    pub fn from_strs<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        let mut options = Vec::with_capacity(values.len());
        for value in values {
            let pace = PaceSpec::parse(value.as_ref())?;
            options.push((pace, pace_to_speed(pace)?));
        }
        if options.is_empty() {
            return Err(RigError::InvalidPaceFormat(String::new()));
        }

        let (min, max) = options
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), (_, speed)| {
                (lo.min(*speed), hi.max(*speed))
            });

        Ok(Self {
            options,
            min_speed_kmh: min.round(),
            max_speed_kmh: max.round(),
        })
    }

    pub fn with_speed_range(mut self, min_speed_kmh: f64, max_speed_kmh: f64) -> Self {
        self.min_speed_kmh = min_speed_kmh;
        self.max_speed_kmh = max_speed_kmh;
        self
    }

    pub fn speed_range(&self) -> (f64, f64) {
        (self.min_speed_kmh, self.max_speed_kmh)
    }

    pub fn paces(&self) -> impl Iterator<Item = PaceSpec> + '_ {
        self.options.iter().map(|(pace, _)| *pace)
    }

    pub fn contains(&self, pace: PaceSpec) -> bool {
        self.options.iter().any(|(p, _)| *p == pace)
    }

    /// Maps a derived speed onto the closest selector value.
    ///
    /// The speed is rounded to whole km/h first; there is no fractional
    /// matching. Ties go to the faster option.
    pub fn nearest(&self, speed_kmh: f64) -> Result<PaceSpec> {
        let no_match = RigError::NoMatchingPace { speed_kmh };
        if !speed_kmh.is_finite() {
            return Err(no_match);
        }

        let rounded = speed_kmh.round();
        if rounded < self.min_speed_kmh || rounded > self.max_speed_kmh {
            return Err(no_match);
        }

        let mut best: Option<(PaceSpec, f64, f64)> = None;
        for (pace, speed) in &self.options {
            let distance = (speed - rounded).abs();
            let better = match best {
                None => true,
                Some((_, best_distance, best_speed)) => {
                    distance < best_distance - f64::EPSILON
                        || ((distance - best_distance).abs() <= f64::EPSILON && *speed > best_speed)
                }
            };
            if better {
                best = Some((*pace, distance, *speed));
            }
        }

        best.map(|(pace, _, _)| pace).ok_or(no_match)
    }
}

impl Default for PaceOptions {
    fn default() -> Self {
        Self::from_strs(DEFAULT_PACE_OPTIONS).expect("built-in pace options are valid")
    }
}
