//! Hardware capabilities and drivers.
//!
//! - [`capabilities`]: the traits the session controller consumes
//! - [`mock`]: simulated supplies and firmware boards
//! - [`registry`]: config-driven driver instantiation
//! - `scpi_serial`: SCPI supplies over serial (feature `instrument_serial`)

pub mod capabilities;
pub mod mock;
pub mod registry;

#[cfg(feature = "instrument_serial")]
pub mod scpi_serial;
