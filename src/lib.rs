//! Streaming driver for USB source-measure units.
//!
//! Two hardware families are supported: a 12-bit low-rate instrument and a
//! 16-bit high-rate one, each with two channels that source voltage or
//! current while measuring the other quantity. A [`Session`] binds devices,
//! configures a common sample rate and streams samples between per-channel
//! [`Signal`] sources and sinks and the hardware.

pub mod calibration;
pub mod codec;
pub mod device;
pub mod error;
pub mod loopback;
pub mod session;
pub mod signal;
pub mod transfer;
pub mod usb;

pub use calibration::{CalEntry, CalQuantity, CalibrationTable};
pub use device::{Device, Sample};
pub use error::{Error, Fault, FaultKind, Result};
pub use session::{Event, Session, SessionConfig};
pub use signal::{Mode, Quantity, Signal, SignalInfo};
pub use usb::{Descriptor, Family};
