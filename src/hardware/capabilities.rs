//! Instrument Capabilities
//!
//! The controller never talks to hardware directly. It consumes three small
//! capability traits, each implemented by a driver in this module's siblings:
//!
//! - [`PowerSupplyConnector`]: enumerates ports and opens a power supply by
//!   model and port, yielding an [`InstrumentHandle`].
//! - [`InstrumentHandle`]: one opened power supply (status, output on/off).
//! - [`FirmwareStatusSource`]: reports the health of a firmware board.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! Errors from these traits never leave the controller as errors. The channel
//! and pool layers turn them into state-machine outcomes (`ActivationFailed`,
//! board status `Error`), so drivers are free to report any failure they like.
//!
//! # Status text
//!
//! Status strings are opaque. The only value with meaning is the sentinel
//! [`StatusText::NO_VALID_DEVICE`], which a device (or driver) returns when
//! nothing answers on the selected port. Every other non-empty string is a
//! valid device-reported status.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a port a power supply can be reached on
/// (e.g. "ASRL/dev/ttyUSB0::INSTR", "/dev/ttyUSB0", "COM3").
pub type PortId = String;

/// Status text reported by an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusText(String);

impl StatusText {
    /// Sentinel meaning "nothing is connected on this port".
    pub const NO_VALID_DEVICE: &'static str = "No valid device";

    /// Wrap a raw status string.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The sentinel status.
    pub fn no_valid_device() -> Self {
        Self(Self::NO_VALID_DEVICE.to_string())
    }

    /// True when the text identifies a connected device.
    ///
    /// Empty text and the sentinel (compared case-insensitively, since
    /// instrument front-ends disagree on capitalisation) are not valid.
    pub fn is_valid(&self) -> bool {
        let trimmed = self.0.trim();
        !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(Self::NO_VALID_DEVICE)
    }

    /// Borrow the raw text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatusText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Severity attached to a status, rendered as a colour by presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Device healthy / connected
    Ok,
    /// Device usable with caveats
    Warning,
    /// Device absent or failing
    Error,
}

impl Severity {
    /// Colour name used by the station front-end.
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Ok => "green",
            Severity::Warning => "orange",
            Severity::Error => "red",
        }
    }
}

/// Identity a firmware status source needs to check one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardIdentity {
    /// Board name (e.g. "FC7-A")
    pub name: String,
    /// Network address of the board
    pub address: String,
    /// Identifier of the board's check log
    pub log_id: String,
}

/// Result of a firmware board health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareReport {
    /// Short comment; also the key into the problem/solution table
    pub comment: String,
    /// Severity of the comment
    pub severity: Severity,
    /// Free-form details for the operator
    pub verbose: String,
}

impl FirmwareReport {
    /// Report recorded when the status source itself failed.
    pub fn query_failed(err: &anyhow::Error) -> Self {
        Self {
            comment: "Status check failed".to_string(),
            severity: Severity::Error,
            verbose: format!("{err:#}"),
        }
    }
}

/// Capability: Power Supply Handle
///
/// One opened power supply. Obtained from [`PowerSupplyConnector::open`] and
/// owned by exactly one power channel.
///
/// # Contract
/// - `query_status` returns the device identification / status text, or the
///   sentinel when nothing answers
/// - `power_off` must be safe to call repeatedly and while already off
#[async_trait]
pub trait InstrumentHandle: Send + Sync {
    /// Query the device status text
    async fn query_status(&self) -> Result<StatusText>;

    /// Enable the output
    async fn power_on(&self) -> Result<()>;

    /// Disable the output
    async fn power_off(&self) -> Result<()>;

    /// Release the connection
    ///
    /// # Default Implementation
    /// Nothing to release.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: Power Supply Connection
///
/// Resolves a (model, port) selection to an opened [`InstrumentHandle`].
#[async_trait]
pub trait PowerSupplyConnector: Send + Sync {
    /// List ports a supply could be opened on
    ///
    /// Pure query with no retry; callers re-invoke to refresh.
    async fn list_ports(&self) -> Result<Vec<PortId>>;

    /// Open the supply of `model` on `port`
    ///
    /// # Returns
    /// - Ok(handle) when the port opened (the device may still report the
    ///   sentinel status)
    /// - Err if the port cannot be opened or the model is unknown
    async fn open(&self, model: &str, port: &str) -> Result<Box<dyn InstrumentHandle>>;
}

/// Capability: Firmware Status
///
/// Health check of one firmware board.
#[async_trait]
pub trait FirmwareStatusSource: Send + Sync {
    /// Check the board and return its report
    async fn check(&self, board: &BoardIdentity) -> Result<FirmwareReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_status_is_not_valid() {
        assert!(!StatusText::no_valid_device().is_valid());
        assert!(!StatusText::new("no valid device").is_valid());
        assert!(!StatusText::new("   ").is_valid());
        assert!(StatusText::new("5.3 kV / 2 mA").is_valid());
    }

    #[test]
    fn severity_colors() {
        assert_eq!(Severity::Ok.color(), "green");
        assert_eq!(Severity::Error.color(), "red");
    }

    #[test]
    fn failed_query_report_is_an_error() {
        let report = FirmwareReport::query_failed(&anyhow::anyhow!("ping timeout"));
        assert_eq!(report.severity, Severity::Error);
        assert!(report.verbose.contains("ping timeout"));
    }
}
