//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod serial;
pub mod sim;
pub mod traits;

pub use mock::MockTransport;
pub use nusb::NusbTransport;
pub use serial::SerialTransport;
pub use sim::{SimConfig, SimPartition, SimulatedDevice};
pub use traits::{PortClaim, Transport, TransportError};
