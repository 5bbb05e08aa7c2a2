//! Shared fixtures for session integration tests.

#![allow(dead_code)]

use station_ctl::config::StationConfig;
use station_ctl::hardware::capabilities::StatusText;
use station_ctl::hardware::mock::{MockFirmwareSource, MockPowerSupply};
use station_ctl::hardware::registry::StationRegistry;
use station_ctl::{spawn_session, SessionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Port with a healthy HV supply
pub const HV_PORT: &str = "COM4";
/// Port with a healthy LV supply
pub const LV_PORT: &str = "COM5";
/// Port with nothing attached
pub const EMPTY_PORT: &str = "COM3";
/// Status the healthy HV supply reports
pub const HV_STATUS: &str = "5.3 kV / 2 mA";

/// A running session with its mock devices.
pub struct Station {
    pub handle: SessionHandle,
    pub task: JoinHandle<()>,
    pub hv: MockPowerSupply,
    pub lv: MockPowerSupply,
    pub firmware: MockFirmwareSource,
}

impl Station {
    /// Shut the session down and wait for the actor.
    pub async fn stop(self) {
        let _ = self.handle.shutdown().await;
        let _ = self.task.await;
    }
}

/// Configuration with two boards, FC7-A being the default.
pub fn station_config(expert: bool) -> StationConfig {
    StationConfig::from_toml_str(&format!(
        r#"
        [application]
        name = "Integration Station"
        log_level = "debug"

        [session]
        start_in_expert_mode = {expert}
        default_board = "FC7-A"
        instrument_timeout_ms = 1000
        status_timeout_ms = 500

        [[boards]]
        name = "FC7-A"
        address = "192.168.1.80"

        [[boards]]
        name = "FC7-B"
        address = "192.168.1.81"

        [power.hv]
        default_model = "ModelX"
        default_port = "{HV_PORT}"
        driver = {{ type = "mock" }}

        [power.lv]
        default_model = "ModelY"
        default_port = "{LV_PORT}"
        driver = {{ type = "mock" }}
        "#
    ))
    .unwrap()
}

/// HV supply on `HV_PORT`, nothing on `EMPTY_PORT`.
pub fn hv_supply() -> MockPowerSupply {
    MockPowerSupply::new()
        .with_port(EMPTY_PORT, StatusText::NO_VALID_DEVICE)
        .with_port(HV_PORT, HV_STATUS)
}

/// LV supply on `LV_PORT`.
pub fn lv_supply() -> MockPowerSupply {
    MockPowerSupply::new().with_port(LV_PORT, "Agilent Technologies,E3633A")
}

/// Start a session on the given devices.
pub async fn start_with(
    expert: bool,
    hv: MockPowerSupply,
    lv: MockPowerSupply,
    firmware: MockFirmwareSource,
) -> Station {
    let registry = StationRegistry::new(
        Arc::new(hv.clone()),
        Arc::new(lv.clone()),
        Arc::new(firmware.clone()),
    );
    let (handle, task) = spawn_session(&station_config(expert), &registry);
    handle.refresh_statuses().await.unwrap();
    Station {
        handle,
        task,
        hv,
        lv,
        firmware,
    }
}

/// Start a session where both boards are healthy.
pub async fn start_station(expert: bool) -> Station {
    let firmware = MockFirmwareSource::new()
        .with_ok_board("FC7-A")
        .with_ok_board("FC7-B");
    start_with(expert, hv_supply(), lv_supply(), firmware).await
}

/// Start an expert session whose HV supply takes `delay` to open.
pub async fn start_with_slow_hv(delay: Duration) -> Station {
    let firmware = MockFirmwareSource::new()
        .with_ok_board("FC7-A")
        .with_ok_board("FC7-B");
    start_with(true, hv_supply().with_open_delay(delay), lv_supply(), firmware).await
}
