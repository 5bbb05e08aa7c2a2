//! SCPI Power Supply over Serial
//!
//! Reference: Keithley 2400-series SourceMeter and 2200-series supply manuals
//!
//! Protocol Overview:
//! - Format: SCPI over RS-232 / USB-serial
//! - Baud: configurable (9600 default), 8N1, no flow control
//! - Terminator: LF (\n) on commands, CR/LF stripped from responses
//! - Identification: `*IDN?`
//! - Output: `:OUTP ON` / `:OUTP OFF`
//!
//! # Important Notes
//!
//! - A port that opens but never answers `*IDN?` reports the
//!   "No valid device" sentinel instead of an error; the channel treats both
//!   the same way, but the sentinel keeps the status text meaningful.
//! - Output commands are fire-and-forget: SCPI supplies do not acknowledge
//!   `:OUTP`, so a short settle delay follows each write.
//!
//! # Example Usage
//!
//! ```no_run
//! use station_ctl::hardware::scpi_serial::ScpiSerialConnector;
//! use station_ctl::hardware::capabilities::PowerSupplyConnector;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = ScpiSerialConnector::new(9600, vec!["Keithley2410".into()]);
//!     let supply = connector.open("Keithley2410", "/dev/ttyUSB0").await?;
//!     println!("{}", supply.query_status().await?);
//!     Ok(())
//! }
//! ```

use crate::hardware::capabilities::{InstrumentHandle, PortId, PowerSupplyConnector, StatusText};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Connector for SCPI power supplies on serial ports
#[derive(Debug, Clone)]
pub struct ScpiSerialConnector {
    baud_rate: u32,
    timeout: Duration,
    models: Vec<String>,
}

impl ScpiSerialConnector {
    /// Create a connector
    ///
    /// # Arguments
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    /// * `models` - Accepted model names (empty accepts any)
    pub fn new(baud_rate: u32, models: Vec<String>) -> Self {
        Self {
            baud_rate,
            timeout: Duration::from_millis(500),
            models,
        }
    }

    /// Set the per-query read timeout
    ///
    /// Default: 500 ms
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl PowerSupplyConnector for ScpiSerialConnector {
    async fn list_ports(&self) -> Result<Vec<PortId>> {
        let ports = tokio_serial::available_ports().context("Failed to enumerate serial ports")?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    async fn open(&self, model: &str, port: &str) -> Result<Box<dyn InstrumentHandle>> {
        if !self.models.is_empty() && !self.models.iter().any(|m| m == model) {
            return Err(anyhow!("Unknown power supply model '{}'", model));
        }

        let stream = tokio_serial::new(port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open serial port '{}'", port))?;

        Ok(Box::new(ScpiSupply {
            port: Mutex::new(BufReader::new(stream)),
            timeout: self.timeout,
        }))
    }
}

/// Opened SCPI supply
struct ScpiSupply {
    /// Serial port protected by Mutex for exclusive access
    port: Mutex<BufReader<SerialStream>>,
    /// Query timeout duration
    timeout: Duration,
}

impl ScpiSupply {
    /// Send query and read one response line
    async fn query(&self, command: &str) -> Result<String> {
        let mut port = self.port.lock().await;

        let cmd = format!("{}\n", command);
        port.get_mut()
            .write_all(cmd.as_bytes())
            .await
            .context("SCPI write failed")?;

        let mut response = String::new();
        tokio::time::timeout(self.timeout, port.read_line(&mut response))
            .await
            .context("SCPI read timeout")??;

        Ok(strip_line_endings(&response))
    }

    /// Send command without expecting a response
    async fn send(&self, command: &str) -> Result<()> {
        let mut port = self.port.lock().await;

        let cmd = format!("{}\n", command);
        port.get_mut()
            .write_all(cmd.as_bytes())
            .await
            .context("SCPI write failed")?;

        // Small delay to allow the supply to process the command
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

/// Remove every CR and LF, as the supplies pad `*IDN?` answers inconsistently
fn strip_line_endings(raw: &str) -> String {
    raw.chars().filter(|c| *c != '\r' && *c != '\n').collect::<String>().trim().to_string()
}

#[async_trait]
impl InstrumentHandle for ScpiSupply {
    async fn query_status(&self) -> Result<StatusText> {
        match self.query("*IDN?").await {
            Ok(idn) if !idn.is_empty() => Ok(StatusText::new(idn)),
            Ok(_) => Ok(StatusText::no_valid_device()),
            Err(err) => {
                tracing::debug!(error = %err, "*IDN? unanswered");
                Ok(StatusText::no_valid_device())
            }
        }
    }

    async fn power_on(&self) -> Result<()> {
        self.send(":OUTP ON").await
    }

    async fn power_off(&self) -> Result<()> {
        self.send(":OUTP OFF").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_line_endings() {
        assert_eq!(
            strip_line_endings("KEITHLEY INSTRUMENTS INC.,MODEL 2410,4090615,C34\r\n"),
            "KEITHLEY INSTRUMENTS INC.,MODEL 2410,4090615,C34"
        );
        assert_eq!(strip_line_endings("\r\n"), "");
    }

    #[tokio::test]
    async fn test_unknown_model_rejected_before_port_open() {
        let connector = ScpiSerialConnector::new(9600, vec!["Keithley2410".into()]);
        let result = connector.open("ModelX", "/dev/does-not-exist").await;
        assert!(result.is_err());
    }
}
