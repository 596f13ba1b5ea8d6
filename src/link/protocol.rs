//! Line protocol understood by the rig's microcontroller.
//!
//! Each command is a bare ASCII word terminated by `\n`, written to the
//! single writable characteristic. The rig never acknowledges.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HM-10 / CC2541 serial service.
pub const HM10_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// Its single read/write characteristic.
pub const HM10_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

pub const TERMINATOR: u8 = b'\n';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    /// Post-connect handshake; the rig updates its LCD.
    Conn,
    /// Start the motor.
    Run,
    /// Halt the motor.
    Stop,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Conn => "CONN",
            Command::Run => "RUN",
            Command::Stop => "STOP",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.as_str().len() + 1);
        bytes.extend_from_slice(self.as_str().as_bytes());
        bytes.push(TERMINATOR);
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
