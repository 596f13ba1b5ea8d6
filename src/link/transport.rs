use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::TransportError;

/// What the chooser looks for: a peripheral advertising `service` that
/// exposes `characteristic` as a writable serial pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub name_prefix: Option<String>,
}

impl DeviceFilter {
    pub fn matches_name(&self, name: &str) -> bool {
        self.name_prefix
            .as_deref()
            .map_or(true, |prefix| name.starts_with(prefix))
    }
}

/// Discovery entry point of a wireless stack.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Scans for (or lets the user pick) one peripheral matching `filter`.
    async fn request_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn Peripheral>, TransportError>;
}

#[async_trait]
pub trait Peripheral: Send + Sync {
    fn name(&self) -> String;

    async fn connect_gatt(&self) -> Result<(), TransportError>;

    async fn open_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Arc<dyn Characteristic>, TransportError>;

    /// Flips to `true` when the peripheral goes away on its own.
    fn subscribe_disconnect(&self) -> watch::Receiver<bool>;

    async fn disconnect(&self);
}

#[async_trait]
pub trait Characteristic: Send + Sync {
    async fn write_value(&self, bytes: &[u8]) -> Result<(), TransportError>;
}
