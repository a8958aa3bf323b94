//! Simulated hardware: a virtual bus and serial-level adapter models.

pub mod bus;
pub mod ds2480;
pub mod ds9097;

pub use bus::{VirtualBus, VirtualDevice};
pub use ds2480::{Ds2480Emulator, EmulatorFault};
pub use ds9097::Ds9097Emulator;
