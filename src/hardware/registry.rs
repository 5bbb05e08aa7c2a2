//! Station Registry
//!
//! Resolves the driver names in [`StationConfig`] to live capability objects,
//! once, at startup. The session controller receives the resulting
//! [`StationRegistry`] and never looks anything up by name afterwards.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    StationRegistry                      │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │  │ HV connector │  │ LV connector │  │ Firmware src  │  │
//! │  └──────────────┘  └──────────────┘  └───────────────┘  │
//! ├─────────────────────────────────────────────────────────┤
//! │                  Capability Traits                      │
//! │  PowerSupplyConnector | FirmwareStatusSource            │
//! ├─────────────────────────────────────────────────────────┤
//! │                  Hardware Drivers                       │
//! │  MockPowerSupply | ScpiSerialConnector | MockFirmware   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use station_ctl::config::StationConfig;
//! use station_ctl::hardware::registry::StationRegistry;
//!
//! let config = StationConfig::load()?;
//! let registry = StationRegistry::from_config(&config)?;
//! let ports = registry.connector(PowerRole::Hv).list_ports().await?;
//! ```

use crate::channel::PowerRole;
use crate::config::{DriverType, FirmwareDriver, PowerSupplyDefinition, StationConfig};
use crate::hardware::capabilities::{FirmwareStatusSource, PowerSupplyConnector, StatusText};
use crate::hardware::mock::{MockFirmwareSource, MockPowerSupply};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Live collaborators of one station
#[derive(Clone)]
pub struct StationRegistry {
    hv: Arc<dyn PowerSupplyConnector>,
    lv: Arc<dyn PowerSupplyConnector>,
    firmware: Arc<dyn FirmwareStatusSource>,
}

impl StationRegistry {
    /// Assemble a registry from already-built collaborators
    pub fn new(
        hv: Arc<dyn PowerSupplyConnector>,
        lv: Arc<dyn PowerSupplyConnector>,
        firmware: Arc<dyn FirmwareStatusSource>,
    ) -> Self {
        Self { hv, lv, firmware }
    }

    /// Instantiate every driver named in the configuration
    ///
    /// # Errors
    /// Returns error if a driver is unavailable in this build
    pub fn from_config(config: &StationConfig) -> Result<Self> {
        let hv = instantiate_connector(PowerRole::Hv, &config.power.hv)?;
        let lv = instantiate_connector(PowerRole::Lv, &config.power.lv)?;
        let firmware = instantiate_firmware(&config.firmware.driver);
        Ok(Self { hv, lv, firmware })
    }

    /// Connector of one rail
    pub fn connector(&self, role: PowerRole) -> Arc<dyn PowerSupplyConnector> {
        match role {
            PowerRole::Hv => self.hv.clone(),
            PowerRole::Lv => self.lv.clone(),
        }
    }

    /// Firmware status source
    pub fn firmware(&self) -> Arc<dyn FirmwareStatusSource> {
        self.firmware.clone()
    }
}

/// Build the connector for one rail
fn instantiate_connector(
    role: PowerRole,
    definition: &PowerSupplyDefinition,
) -> Result<Arc<dyn PowerSupplyConnector>> {
    tracing::debug!(%role, driver = definition.driver.driver_name(), "Instantiating power supply driver");

    match &definition.driver {
        DriverType::Mock {
            ports,
            open_delay_ms,
        } => {
            let mut supply = MockPowerSupply::new()
                .with_open_delay(Duration::from_millis(*open_delay_ms));
            for model in &definition.models {
                supply = supply.with_model(model.clone());
            }
            for (port, status) in ports {
                supply = supply.with_port(port.clone(), status.clone());
            }
            Ok(Arc::new(supply))
        }

        #[cfg(feature = "instrument_serial")]
        DriverType::ScpiSerial { baud_rate } => Ok(Arc::new(
            crate::hardware::scpi_serial::ScpiSerialConnector::new(
                *baud_rate,
                definition.models.clone(),
            ),
        )),

        #[cfg(not(feature = "instrument_serial"))]
        DriverType::ScpiSerial { .. } => Err(anyhow::anyhow!(
            "{} supply uses the scpi_serial driver, but this build lacks the 'instrument_serial' feature",
            role
        )),
    }
}

/// Build the firmware status source
fn instantiate_firmware(driver: &FirmwareDriver) -> Arc<dyn FirmwareStatusSource> {
    match driver {
        FirmwareDriver::Mock { healthy } => {
            let source = healthy
                .iter()
                .fold(MockFirmwareSource::new(), |source, board| {
                    source.with_ok_board(board.clone())
                });
            Arc::new(source)
        }
    }
}

/// Create a registry with mock drivers for testing
///
/// Both rails accept any model and expose one populated port and one empty
/// port; every board in `boards` reports healthy.
pub fn create_mock_registry(
    boards: &[&str],
) -> (StationRegistry, MockPowerSupply, MockPowerSupply, MockFirmwareSource) {
    let hv = MockPowerSupply::new()
        .with_port("ASRL/dev/ttyUSB0::INSTR", "KEITHLEY INSTRUMENTS INC.,MODEL 2410")
        .with_port("ASRL/dev/ttyUSB1::INSTR", StatusText::NO_VALID_DEVICE);
    let lv = MockPowerSupply::new()
        .with_port("ASRL/dev/ttyUSB2::INSTR", "Agilent Technologies,E3633A")
        .with_port("ASRL/dev/ttyUSB3::INSTR", StatusText::NO_VALID_DEVICE);
    let firmware = boards
        .iter()
        .fold(MockFirmwareSource::new(), |source, board| source.with_ok_board(*board));

    let registry = StationRegistry::new(
        Arc::new(hv.clone()),
        Arc::new(lv.clone()),
        Arc::new(firmware.clone()),
    );
    (registry, hv, lv, firmware)
}
