//! Mock Hardware Implementations
//!
//! Provides simulated instruments for testing and for running a station without
//! physical hardware. All mock devices use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockPowerSupply` - Connector exposing a fixed set of ports, each with a
//!   scripted status string and an observable output state
//! - `MockFirmwareSource` - Firmware status source returning scripted reports
//!
//! Every mock records what was done to it (open count, power-on/off count,
//! output state) so tests can assert that the controller de-energized a rail.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep, Duration};

use crate::hardware::capabilities::{
    BoardIdentity, FirmwareReport, FirmwareStatusSource, InstrumentHandle, PortId,
    PowerSupplyConnector, Severity, StatusText,
};

// =============================================================================
// MockPort - Simulated Supply Behind One Port
// =============================================================================

/// Simulated power supply sitting on one port.
///
/// Shared between the connector and every handle opened on the port, so the
/// state survives handle drops and can be inspected by tests.
pub struct MockPort {
    status: RwLock<String>,
    output_on: AtomicBool,
    fail_open: AtomicBool,
    fail_power_off: AtomicBool,
    open_count: AtomicU64,
    power_on_count: AtomicU64,
    power_off_count: AtomicU64,
    open_started: Notify,
}

impl MockPort {
    fn new(status: impl Into<String>) -> Self {
        Self {
            status: RwLock::new(status.into()),
            output_on: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            fail_power_off: AtomicBool::new(false),
            open_count: AtomicU64::new(0),
            power_on_count: AtomicU64::new(0),
            power_off_count: AtomicU64::new(0),
            open_started: Notify::new(),
        }
    }

    /// Change the status string the device reports
    pub async fn set_status(&self, status: impl Into<String>) {
        *self.status.write().await = status.into();
    }

    /// Make `open` fail on this port
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make `power_off` return an error (the output still switches off)
    pub fn set_fail_power_off(&self, fail: bool) {
        self.fail_power_off.store(fail, Ordering::SeqCst);
    }

    /// Whether the output is currently energized
    pub fn is_output_on(&self) -> bool {
        self.output_on.load(Ordering::SeqCst)
    }

    /// Number of `open` calls that reached this port
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Number of `power_on` calls
    pub fn power_on_count(&self) -> u64 {
        self.power_on_count.load(Ordering::SeqCst)
    }

    /// Number of `power_off` calls
    pub fn power_off_count(&self) -> u64 {
        self.power_off_count.load(Ordering::SeqCst)
    }

    /// Wait until an `open` call has started on this port
    pub async fn wait_for_open(&self) {
        self.open_started.notified().await;
    }
}

// =============================================================================
// MockPowerSupply - Simulated Connector
// =============================================================================

/// Mock power supply connector
///
/// # Example
///
/// ```rust,ignore
/// let hv = MockPowerSupply::new()
///     .with_model("Keithley2410")
///     .with_port("ASRL/dev/ttyUSB0::INSTR", "KEITHLEY 2410 / 0.0 V");
/// let handle = hv.open("Keithley2410", "ASRL/dev/ttyUSB0::INSTR").await?;
/// ```
#[derive(Clone, Default)]
pub struct MockPowerSupply {
    models: Vec<String>,
    ports: HashMap<PortId, Arc<MockPort>>,
    port_order: Vec<PortId>,
    open_delay: Duration,
    list_delay: Duration,
    list_started: Arc<Notify>,
}

impl MockPowerSupply {
    /// Create a connector with no ports and no model restriction
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict `open` to the listed model (may be called repeatedly)
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.push(model.into());
        self
    }

    /// Add a port whose device reports `status`
    ///
    /// Use [`StatusText::NO_VALID_DEVICE`] for a port with nothing attached.
    pub fn with_port(mut self, port: impl Into<PortId>, status: impl Into<String>) -> Self {
        let port = port.into();
        if !self.ports.contains_key(&port) {
            self.port_order.push(port.clone());
        }
        self.ports.insert(port, Arc::new(MockPort::new(status)));
        self
    }

    /// Delay every `open` by `delay` (simulates slow VISA/serial enumeration)
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Delay every `list_ports` by `delay` (simulates a hung enumeration)
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    /// Wait until a `list_ports` call has started
    pub async fn wait_for_list_ports(&self) {
        self.list_started.notified().await;
    }

    /// Inspect the simulated device on `port`
    pub fn port(&self, port: &str) -> Option<Arc<MockPort>> {
        self.ports.get(port).cloned()
    }

    /// True if any port has its output energized
    pub fn any_output_on(&self) -> bool {
        self.ports.values().any(|p| p.is_output_on())
    }
}

#[async_trait]
impl PowerSupplyConnector for MockPowerSupply {
    async fn list_ports(&self) -> Result<Vec<PortId>> {
        self.list_started.notify_one();
        if !self.list_delay.is_zero() {
            sleep(self.list_delay).await;
        }
        Ok(self.port_order.clone())
    }

    async fn open(&self, model: &str, port: &str) -> Result<Box<dyn InstrumentHandle>> {
        if !self.models.is_empty() && !self.models.iter().any(|m| m == model) {
            return Err(anyhow!("Unknown power supply model '{}'", model));
        }
        let device = self
            .ports
            .get(port)
            .cloned()
            .ok_or_else(|| anyhow!("Port '{}' does not exist", port))?;

        device.open_count.fetch_add(1, Ordering::SeqCst);
        device.open_started.notify_one();
        tracing::debug!(model, port, "MockPowerSupply: opening");

        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        if !self.open_delay.is_zero() {
            sleep(self.open_delay).await;
        }

        if device.fail_open.load(Ordering::SeqCst) {
            return Err(anyhow!("Port '{}' could not be opened", port));
        }

        Ok(Box::new(MockSupplyHandle { device }))
    }
}

/// Handle opened by [`MockPowerSupply`]
struct MockSupplyHandle {
    device: Arc<MockPort>,
}

#[async_trait]
impl InstrumentHandle for MockSupplyHandle {
    async fn query_status(&self) -> Result<StatusText> {
        Ok(StatusText::new(self.device.status.read().await.clone()))
    }

    async fn power_on(&self) -> Result<()> {
        if !StatusText::new(self.device.status.read().await.clone()).is_valid() {
            return Err(anyhow!("No device to power on"));
        }
        self.device.power_on_count.fetch_add(1, Ordering::SeqCst);
        self.device.output_on.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn power_off(&self) -> Result<()> {
        self.device.power_off_count.fetch_add(1, Ordering::SeqCst);
        self.device.output_on.store(false, Ordering::SeqCst);
        if self.device.fail_power_off.load(Ordering::SeqCst) {
            return Err(anyhow!("Output off acknowledgement timed out"));
        }
        Ok(())
    }
}

// =============================================================================
// MockFirmwareSource - Simulated Board Checks
// =============================================================================

/// Mock firmware status source with scripted per-board reports
///
/// Boards without a scripted report are reported as unreachable.
#[derive(Clone, Default)]
pub struct MockFirmwareSource {
    reports: Arc<RwLock<HashMap<String, FirmwareReport>>>,
    failing: Arc<RwLock<HashSet<String>>>,
    check_delay: Duration,
    check_count: Arc<AtomicU64>,
}

impl MockFirmwareSource {
    /// Create a source with no scripted boards
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a healthy board
    pub fn with_ok_board(self, name: impl Into<String>) -> Self {
        self.with_report(
            name,
            FirmwareReport {
                comment: "Connected".to_string(),
                severity: Severity::Ok,
                verbose: "Firmware loaded and reachable".to_string(),
            },
        )
    }

    /// Script an arbitrary report for a board
    pub fn with_report(self, name: impl Into<String>, report: FirmwareReport) -> Self {
        if let Ok(mut reports) = self.reports.try_write() {
            reports.insert(name.into(), report);
        }
        self
    }

    /// Delay every check by `delay`
    pub fn with_check_delay(mut self, delay: Duration) -> Self {
        self.check_delay = delay;
        self
    }

    /// Replace the report of a board at runtime
    pub async fn set_report(&self, name: impl Into<String>, report: FirmwareReport) {
        self.reports.write().await.insert(name.into(), report);
    }

    /// Make checks of `name` fail with an error
    pub async fn set_failing(&self, name: impl Into<String>, failing: bool) {
        let name = name.into();
        let mut set = self.failing.write().await;
        if failing {
            set.insert(name);
        } else {
            set.remove(&name);
        }
    }

    /// Total checks served
    pub fn check_count(&self) -> u64 {
        self.check_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FirmwareStatusSource for MockFirmwareSource {
    async fn check(&self, board: &BoardIdentity) -> Result<FirmwareReport> {
        self.check_count.fetch_add(1, Ordering::SeqCst);
        if !self.check_delay.is_zero() {
            sleep(self.check_delay).await;
        }
        if self.failing.read().await.contains(&board.name) {
            return Err(anyhow!("Board '{}' did not answer at {}", board.name, board.address));
        }
        Ok(self
            .reports
            .read()
            .await
            .get(&board.name)
            .cloned()
            .unwrap_or_else(|| FirmwareReport {
                comment: "Board not reachable".to_string(),
                severity: Severity::Error,
                verbose: format!("No response from {} ({})", board.name, board.address),
            }))
    }
}
