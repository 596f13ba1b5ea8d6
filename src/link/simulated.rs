//! In-memory stand-in for the rig's BLE serial module.
//!
//! Records every write and can be told to fail at each stage of the
//! connect sequence, so the CLI and tests can drive the link without radio.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::TransportError;

use super::{
    protocol::{HM10_CHARACTERISTIC_UUID, HM10_SERVICE_UUID, TERMINATOR},
    transport::{Characteristic, DeviceFilter, LinkTransport, Peripheral},
};

struct SimState {
    name: String,
    service: Uuid,
    characteristic: Uuid,
    present: bool,
    cancel_chooser: bool,
    fail_gatt: bool,
    fail_writes: bool,
    write_delay: Duration,
    connected: bool,
    connects: u32,
    written: Vec<Vec<u8>>,
    drop_tx: Option<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct SimulatedRig {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                name: name.into(),
                service: HM10_SERVICE_UUID,
                characteristic: HM10_CHARACTERISTIC_UUID,
                present: true,
                cancel_chooser: false,
                fail_gatt: false,
                fail_writes: false,
                write_delay: Duration::ZERO,
                connected: false,
                connects: 0,
                written: Vec::new(),
                drop_tx: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_present(&self, present: bool) {
        self.state().present = present;
    }

    pub fn set_cancel_chooser(&self, cancel: bool) {
        self.state().cancel_chooser = cancel;
    }

    pub fn set_gatt_failure(&self, fail: bool) {
        self.state().fail_gatt = fail;
    }

    pub fn set_write_failure(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.state().write_delay = delay;
    }

    /// Exposes a different service, as a wrong module would.
    pub fn set_service(&self, service: Uuid) {
        self.state().service = service;
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn connect_count(&self) -> u32 {
        self.state().connects
    }

    /// Commands received so far, without their terminator.
    pub fn written_lines(&self) -> Vec<String> {
        self.state()
            .written
            .iter()
            .map(|bytes| {
                let line = bytes.strip_suffix(&[TERMINATOR]).unwrap_or(bytes.as_slice());
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    pub fn written_raw(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    /// The peripheral walks out of range.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected = false;
        if let Some(tx) = state.drop_tx.as_ref() {
            let _ = tx.send(true);
        }
    }
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new("HMSoft")
    }
}

#[async_trait]
impl LinkTransport for SimulatedRig {
    async fn request_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn Peripheral>, TransportError> {
        let mut state = self.state();
        if state.cancel_chooser {
            return Err(TransportError::Cancelled);
        }
        if !state.present || state.service != filter.service || !filter.matches_name(&state.name)
        {
            return Err(TransportError::NotFound);
        }

        let (drop_tx, drop_rx) = watch::channel(false);
        state.drop_tx = Some(drop_tx);

        Ok(Arc::new(SimPeripheral {
            rig: self.clone(),
            name: state.name.clone(),
            drop_rx,
        }))
    }
}

struct SimPeripheral {
    rig: SimulatedRig,
    name: String,
    drop_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Peripheral for SimPeripheral {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect_gatt(&self) -> Result<(), TransportError> {
        let mut state = self.rig.state();
        if state.fail_gatt {
            return Err(TransportError::Gatt("GATT server unreachable".into()));
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn open_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Arc<dyn Characteristic>, TransportError> {
        let state = self.rig.state();
        if !state.connected {
            return Err(TransportError::Gatt("not connected".into()));
        }
        if state.service != service {
            return Err(TransportError::Gatt(format!("service {service} not found")));
        }
        if state.characteristic != characteristic {
            return Err(TransportError::Gatt(format!(
                "characteristic {characteristic} not found"
            )));
        }
        Ok(Arc::new(SimCharacteristic {
            rig: self.rig.clone(),
        }))
    }

    fn subscribe_disconnect(&self) -> watch::Receiver<bool> {
        self.drop_rx.clone()
    }

    async fn disconnect(&self) {
        self.rig.state().connected = false;
    }
}

struct SimCharacteristic {
    rig: SimulatedRig,
}

#[async_trait]
impl Characteristic for SimCharacteristic {
    async fn write_value(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let delay = self.rig.state().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.rig.state();
        if state.fail_writes {
            return Err(TransportError::Write("characteristic write rejected".into()));
        }
        if !state.connected {
            return Err(TransportError::Write("peripheral not connected".into()));
        }
        state.written.push(bytes.to_vec());
        Ok(())
    }
}
