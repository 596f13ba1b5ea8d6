use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{PoisonError, RwLock},
    time::Duration,
};
use uuid::Uuid;

use crate::{
    link::{
        protocol::{HM10_CHARACTERISTIC_UUID, HM10_SERVICE_UUID},
        DeviceFilter,
    },
    pace::{options::DEFAULT_PACE_OPTIONS, PaceOptions},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeedRange {
    pub min_kmh: f64,
    pub max_kmh: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RigSettings {
    pub device_name_prefix: Option<String>,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Wait before `CONN` so the rig's LCD is ready for it.
    pub settle_delay_ms: u64,
    pub tick_interval_ms: u64,
    pub pace_options: Vec<String>,
    /// Overrides the range derived from `pace_options`.
    pub pace_speed_range: Option<SpeedRange>,
}

impl Default for RigSettings {
    fn default() -> Self {
        Self {
            device_name_prefix: None,
            service_uuid: HM10_SERVICE_UUID,
            characteristic_uuid: HM10_CHARACTERISTIC_UUID,
            settle_delay_ms: 1500,
            tick_interval_ms: 1000,
            pace_options: DEFAULT_PACE_OPTIONS.iter().map(|s| s.to_string()).collect(),
            pace_speed_range: None,
        }
    }
}

impl RigSettings {
    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            service: self.service_uuid,
            characteristic: self.characteristic_uuid,
            name_prefix: self.device_name_prefix.clone(),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn pace_options(&self) -> Result<PaceOptions> {
        let options = PaceOptions::from_strs(&self.pace_options)
            .context("Invalid pace options in settings")?;
        Ok(match self.pace_speed_range {
            Some(range) => options.with_speed_range(range.min_kmh, range.max_kmh),
            None => options,
        })
    }
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<RigSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!(
                    "Ignoring unreadable settings in {}: {}",
                    path.display(),
                    e
                );
                RigSettings::default()
            })
        } else {
            RigSettings::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Defaults only, nothing on disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(RigSettings::default()),
        }
    }

    pub fn settings(&self) -> RigSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, settings: RigSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        *guard = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &RigSettings) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }

    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            bail!("in-memory settings have nothing to reload");
        };
        let contents = fs::read_to_string(path)?;
        let data: RigSettings = serde_json::from_str(&contents)?;
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data;
        Ok(())
    }
}
