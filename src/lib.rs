//! # Station Control Core Library
//!
//! This crate is the core of the `station-ctl` module test station. It decides
//! which firmware board is exclusively claimed for a test, drives the HV and LV
//! power supplies under remote or manual control, and implements the safety
//! interlock that de-energizes every rail when a critical condition is
//! signalled. Presentation layers (the station GUI, the CLI in `main.rs`)
//! only send requests and render snapshots.
//!
//! ## Crate Structure
//!
//! - **`channel`**: The `PowerChannel` state machine for one rail.
//! - **`config`**: Figment-based `StationConfig` (TOML + `STATION_` environment).
//! - **`error`**: `thiserror` enums per layer and the `ErrorClass` taxonomy.
//! - **`hardware`**: Capability traits (`InstrumentHandle`, `PowerSupplyConnector`,
//!   `FirmwareStatusSource`), mock and SCPI drivers, and the config-driven registry.
//! - **`interlock`**: The shared interlock flag.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`messages`**: Commands, trip requests and broadcast events of the session actor.
//! - **`pool`**: `ExclusiveResourcePool`, the single-claim board registry.
//! - **`sensor`**: Bridge from a sensor monitor to the interlock.
//! - **`session`**: `SessionController`, the single owner of session state.
//! - **`session_actor`**: The actor running a session and its cloneable handle.
//! - **`snapshot`**: Pure projection of session state for observers.

pub mod channel;
pub mod config;
pub mod error;
pub mod hardware;
pub mod interlock;
pub mod logging;
pub mod messages;
pub mod pool;
pub mod sensor;
pub mod session;
pub mod session_actor;
pub mod snapshot;

pub use channel::{Activation, PowerRole};
pub use error::{ChannelError, ClaimError, ErrorClass, SessionError, SessionResult};
pub use session::SessionController;
pub use session_actor::{spawn_session, SessionHandle};
