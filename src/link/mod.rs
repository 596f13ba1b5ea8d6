pub mod device;
pub mod protocol;
pub mod simulated;
pub mod state;
pub mod transport;

pub use device::DeviceLink;
pub use protocol::Command;
pub use simulated::SimulatedRig;
pub use state::ConnectionState;
pub use transport::{Characteristic, DeviceFilter, LinkTransport, Peripheral};
