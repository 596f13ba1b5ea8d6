use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RigError};

/// Time per kilometre, as picked on the pace selector ("5:30" = 5'30"/km).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaceSpec {
    minutes: u32,
    seconds: u32,
}

impl PaceSpec {
    pub fn new(minutes: u32, seconds: u32) -> Result<Self> {
        if seconds > 59 {
            return Err(RigError::InvalidPaceFormat(format!("{minutes}:{seconds}")));
        }
        Ok(Self { minutes, seconds })
    }

    /// Parses the selector's "M:SS" form.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || RigError::InvalidPaceFormat(input.to_string());

        let (mins, secs) = input.trim().split_once(':').ok_or_else(invalid)?;
        let minutes = mins.parse::<u32>().map_err(|_| invalid())?;
        let seconds = secs.parse::<u32>().map_err(|_| invalid())?;
        if seconds > 59 {
            return Err(invalid());
        }
        Ok(Self { minutes, seconds })
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn total_seconds(&self) -> u64 {
        u64::from(self.minutes) * 60 + u64::from(self.seconds)
    }

    pub fn is_zero(&self) -> bool {
        self.minutes == 0 && self.seconds == 0
    }

    pub fn speed_kmh(&self) -> Result<f64> {
        pace_to_speed(*self)
    }

    pub fn label(&self) -> String {
        pace_label(*self)
    }
}

impl fmt::Display for PaceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}", self.minutes, self.seconds)
    }
}

impl FromStr for PaceSpec {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PaceSpec {
    type Error = RigError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PaceSpec> for String {
    fn from(pace: PaceSpec) -> Self {
        pace.to_string()
    }
}

/// km/h = 60 / (min/km)
pub fn pace_to_speed(pace: PaceSpec) -> Result<f64> {
    if pace.is_zero() {
        return Err(RigError::InvalidPace);
    }
    Ok(3600.0 / pace.total_seconds() as f64)
}

/// Renders `M'SS"`.
pub fn pace_label(pace: PaceSpec) -> String {
    format!("{}'{:02}\"", pace.minutes, pace.seconds)
}

/// Inverse of [`pace_to_speed`], rounded to the nearest whole second per km.
pub fn speed_to_pace(speed_kmh: f64) -> Result<PaceSpec> {
    if !speed_kmh.is_finite() || speed_kmh <= 0.0 {
        return Err(RigError::InvalidValue {
            field: "speed",
            value: speed_kmh,
        });
    }
    let total = (3600.0 / speed_kmh).round();
    if total < 1.0 || total > u32::MAX as f64 {
        return Err(RigError::InvalidValue {
            field: "speed",
            value: speed_kmh,
        });
    }
    let total = total as u32;
    Ok(PaceSpec {
        minutes: total / 60,
        seconds: total % 60,
    })
}
