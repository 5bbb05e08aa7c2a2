//! Power channel state machine.
//!
//! One [`PowerChannel`] drives one rail (HV sensor bias or LV chip supply).
//!
//! ```text
//!            set_remote_control(false)
//!   ┌──────────────────────────────────────────┐
//!   │                                          ▼
//! Idle ──select──▶ Configuring ──activate──▶ Active ──deactivate──▶ (Released) ──▶ Idle
//!   ▲                   │  failed / tripped
//!   └───────────────────┘                               Disabled ◀── remote off
//! ```
//!
//! `Released` is transient: `deactivate` passes through it while the output is
//! being switched off and the handle dropped, then settles in `Idle` (or stays
//! `Disabled`). It is never observable between calls.
//!
//! Device failures never escape as errors from the device layer; they become
//! [`ChannelError::ActivationFailed`] with the channel back in `Idle`, and the
//! status text and severity are recomputed on every attempt.
//!
//! While `Active`, the opened supply is also registered with the session's
//! [`PowerCutoff`] so an interlock trip can reach it without waiting for the
//! channel's owner.

use crate::error::ChannelError;
use crate::hardware::capabilities::{
    InstrumentHandle, PortId, PowerSupplyConnector, Severity, StatusText,
};
use crate::interlock::{Interlock, PowerCutoff};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which rail a channel drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PowerRole {
    /// High voltage (sensor bias)
    #[serde(rename = "HV", alias = "hv")]
    Hv,
    /// Low voltage (chip supply)
    #[serde(rename = "LV", alias = "lv")]
    Lv,
}

impl PowerRole {
    /// Both rails, HV first.
    pub const ALL: [PowerRole; 2] = [PowerRole::Hv, PowerRole::Lv];
}

impl fmt::Display for PowerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerRole::Hv => f.write_str("HV"),
            PowerRole::Lv => f.write_str("LV"),
        }
    }
}

/// Activation state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Under manual (front panel) control
    Disabled,
    /// Remote control, nothing selected
    Idle,
    /// Model and port selected
    Configuring,
    /// Device opened and locked to this channel
    Active,
    /// Being released (transient)
    Released,
}

/// State machine for one power rail.
pub struct PowerChannel {
    role: PowerRole,
    remote_control_enabled: bool,
    selected_model: Option<String>,
    selected_port: Option<PortId>,
    activation: Activation,
    last_status_text: Option<StatusText>,
    severity: Option<Severity>,
    output_on: bool,
    handle: Option<Arc<dyn InstrumentHandle>>,
    connector: Arc<dyn PowerSupplyConnector>,
    instrument_timeout: Duration,
    cutoff: PowerCutoff,
}

impl PowerChannel {
    /// New channel in `Idle` with remote control enabled.
    pub fn new(
        role: PowerRole,
        connector: Arc<dyn PowerSupplyConnector>,
        instrument_timeout: Duration,
    ) -> Self {
        Self {
            role,
            remote_control_enabled: true,
            selected_model: None,
            selected_port: None,
            activation: Activation::Idle,
            last_status_text: None,
            severity: None,
            output_on: false,
            handle: None,
            connector,
            instrument_timeout,
            cutoff: PowerCutoff::new(),
        }
    }

    /// Register active supplies with a shared cutoff instead of a private one.
    pub fn with_cutoff(mut self, cutoff: PowerCutoff) -> Self {
        self.cutoff = cutoff;
        self
    }

    /// Rail driven by this channel
    pub fn role(&self) -> PowerRole {
        self.role
    }

    /// Current activation state
    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Whether this controller governs the supply
    pub fn remote_control_enabled(&self) -> bool {
        self.remote_control_enabled
    }

    /// Selected model
    pub fn selected_model(&self) -> Option<&str> {
        self.selected_model.as_deref()
    }

    /// Selected port
    pub fn selected_port(&self) -> Option<&str> {
        self.selected_port.as_deref()
    }

    /// Status text from the last activation attempt
    pub fn last_status_text(&self) -> Option<&StatusText> {
        self.last_status_text.as_ref()
    }

    /// Severity from the last activation attempt
    pub fn severity(&self) -> Option<Severity> {
        self.severity
    }

    /// Whether this controller has switched the output on
    pub fn is_output_on(&self) -> bool {
        self.output_on
    }

    /// Switch between remote control and manual (front panel) control.
    ///
    /// Disabling is refused while `Active`; release the channel first. A
    /// pending selection is dropped. Once `Disabled`, only re-enabling remote
    /// control is accepted.
    pub fn set_remote_control(&mut self, enabled: bool) -> Result<(), ChannelError> {
        if enabled {
            self.remote_control_enabled = true;
            if self.activation == Activation::Disabled {
                self.activation = Activation::Idle;
            }
            debug!(role = %self.role, "Remote control enabled");
            return Ok(());
        }

        if self.activation == Activation::Active {
            return Err(ChannelError::ChannelBusy(self.role));
        }
        self.remote_control_enabled = false;
        self.selected_model = None;
        self.selected_port = None;
        self.activation = Activation::Disabled;
        debug!(role = %self.role, "Remote control disabled");
        Ok(())
    }

    /// Select the model and port to activate.
    ///
    /// A selection may be replaced while `Configuring`.
    pub fn select(&mut self, model: &str, port: &str) -> Result<(), ChannelError> {
        match self.activation {
            Activation::Disabled => return Err(ChannelError::RemoteControlDisabled(self.role)),
            Activation::Active | Activation::Released => {
                return Err(ChannelError::ChannelBusy(self.role))
            }
            Activation::Idle | Activation::Configuring => {}
        }
        if !self.remote_control_enabled {
            return Err(ChannelError::RemoteControlDisabled(self.role));
        }
        if model.trim().is_empty() {
            return Err(ChannelError::InvalidSelection("model must not be empty".into()));
        }
        if port.trim().is_empty() {
            return Err(ChannelError::InvalidSelection("port must not be empty".into()));
        }

        self.selected_model = Some(model.to_string());
        self.selected_port = Some(port.to_string());
        self.activation = Activation::Configuring;
        debug!(role = %self.role, model, port, "Power supply selected");
        Ok(())
    }

    /// Open the selected supply and read its status.
    ///
    /// On success the channel is `Active` and locked. On any failure it
    /// returns to `Idle` with the selection cleared. If `interlock` trips
    /// while the device is being opened, the supply is powered off as soon as
    /// the open completes and [`ChannelError::InterlockTripped`] is returned.
    pub async fn activate(&mut self, interlock: &Interlock) -> Result<StatusText, ChannelError> {
        let (model, port) = match (self.activation, &self.selected_model, &self.selected_port) {
            (Activation::Disabled, _, _) => {
                return Err(ChannelError::RemoteControlDisabled(self.role))
            }
            (Activation::Active | Activation::Released, _, _) => {
                return Err(ChannelError::ChannelBusy(self.role))
            }
            (Activation::Configuring, Some(model), Some(port)) => (model.clone(), port.clone()),
            _ => return Err(ChannelError::InvalidSelection("no model/port selected".into())),
        };

        info!(role = %self.role, %model, %port, "Activating power supply");
        let (handle, status) = match self.open_and_query(&model, &port).await {
            Ok((handle, status)) if status.is_valid() => (Arc::from(handle), status),
            Ok((handle, status)) => {
                if let Err(err) = handle.release().await {
                    debug!(role = %self.role, error = %err, "Release after failed activation");
                }
                return Err(self.fail_activation(status.to_string()));
            }
            Err(reason) => return Err(self.fail_activation(reason)),
        };

        if interlock.is_tripped() {
            warn!(role = %self.role, "Interlock tripped during activation; powering off");
            self.handle = Some(handle);
            self.deactivate().await;
            self.last_status_text = Some(status);
            self.severity = Some(Severity::Error);
            return Err(ChannelError::InterlockTripped(self.role));
        }

        self.cutoff.register(self.role, Arc::clone(&handle));
        self.handle = Some(handle);
        self.last_status_text = Some(status.clone());
        self.severity = Some(Severity::Ok);
        self.activation = Activation::Active;
        info!(role = %self.role, status = %status, "Power supply active");
        Ok(status)
    }

    /// Open and query, bounded by the instrument timeout.
    async fn open_and_query(
        &self,
        model: &str,
        port: &str,
    ) -> Result<(Box<dyn InstrumentHandle>, StatusText), String> {
        let timeout = self.instrument_timeout;
        let handle = match tokio::time::timeout(timeout, self.connector.open(model, port)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return Err(format!("{err:#}")),
            Err(_) => return Err(format!("open timed out after {} ms", timeout.as_millis())),
        };
        match tokio::time::timeout(timeout, handle.query_status()).await {
            Ok(Ok(status)) => Ok((handle, status)),
            Ok(Err(err)) => {
                let reason = format!("{err:#}");
                if let Err(err) = handle.release().await {
                    debug!(role = %self.role, error = %err, "Release after failed query");
                }
                Err(reason)
            }
            Err(_) => Err(format!("status query timed out after {} ms", timeout.as_millis())),
        }
    }

    fn fail_activation(&mut self, reason: String) -> ChannelError {
        warn!(role = %self.role, %reason, "Power supply activation failed");
        self.last_status_text = Some(StatusText::no_valid_device());
        self.severity = Some(Severity::Error);
        self.selected_model = None;
        self.selected_port = None;
        self.activation = Activation::Idle;
        ChannelError::ActivationFailed {
            role: self.role,
            reason,
        }
    }

    /// Power the rail off and return to `Idle`.
    ///
    /// Safe from every state and idempotent. The power-off command is issued
    /// whenever a device is held, with no timeout; its failure is logged and
    /// the channel is released anyway. A `Disabled` channel stays `Disabled`.
    pub async fn deactivate(&mut self) {
        let settled = if self.activation == Activation::Disabled {
            Activation::Disabled
        } else {
            Activation::Idle
        };

        if let Some(handle) = self.handle.take() {
            self.activation = Activation::Released;
            self.cutoff.unregister(self.role);
            if let Err(err) = handle.power_off().await {
                warn!(role = %self.role, error = %err, "Power-off command failed during release");
            }
            if let Err(err) = handle.release().await {
                debug!(role = %self.role, error = %err, "Handle release failed");
            }
            info!(role = %self.role, "Power supply released");
        }

        self.output_on = false;
        self.selected_model = None;
        self.selected_port = None;
        self.last_status_text = None;
        self.severity = None;
        self.activation = settled;
    }

    /// Switch the output of an `Active` channel on or off.
    ///
    /// Bounded by the instrument timeout. Switching on is refused while
    /// `interlock` is tripped, and an output that comes on while a trip lands
    /// is switched straight back off.
    pub async fn set_output(&mut self, on: bool, interlock: &Interlock) -> Result<(), ChannelError> {
        let handle = match (&self.handle, self.activation) {
            (Some(handle), Activation::Active) => Arc::clone(handle),
            _ => return Err(ChannelError::NotActive(self.role)),
        };
        if on && interlock.is_tripped() {
            return Err(ChannelError::InterlockTripped(self.role));
        }

        let command = async {
            if on {
                handle.power_on().await
            } else {
                handle.power_off().await
            }
        };
        let result = match tokio::time::timeout(self.instrument_timeout, command).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "output command timed out after {} ms",
                self.instrument_timeout.as_millis()
            )),
        };
        match result {
            Ok(()) if on && interlock.is_tripped() => {
                warn!(role = %self.role, "Interlock tripped while switching output on; switching off");
                if let Err(err) = handle.power_off().await {
                    warn!(role = %self.role, error = %err, "Power-off after trip failed");
                }
                self.output_on = false;
                Err(ChannelError::InterlockTripped(self.role))
            }
            Ok(()) => {
                self.output_on = on;
                info!(role = %self.role, on, "Output switched");
                Ok(())
            }
            Err(err) => {
                warn!(role = %self.role, on, error = %err, "Output command failed");
                if !on {
                    self.output_on = false;
                }
                Err(ChannelError::OutputFailed {
                    role: self.role,
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    /// Ports the supply could be opened on.
    ///
    /// A failed or timed-out enumeration yields an empty list.
    pub async fn list_available_ports(&self) -> Vec<PortId> {
        let timeout = self.instrument_timeout;
        match tokio::time::timeout(timeout, self.connector.list_ports()).await {
            Ok(Ok(ports)) => ports,
            Ok(Err(err)) => {
                warn!(role = %self.role, error = %err, "Port enumeration failed");
                Vec::new()
            }
            Err(_) => {
                warn!(role = %self.role, timeout_ms = timeout.as_millis() as u64, "Port enumeration timed out");
                Vec::new()
            }
        }
    }

    /// `Active` implies remote control and a complete selection.
    pub fn invariant_holds(&self) -> bool {
        self.activation != Activation::Active
            || (self.remote_control_enabled
                && self.selected_model.as_deref().is_some_and(|m| !m.is_empty())
                && self.selected_port.as_deref().is_some_and(|p| !p.is_empty()))
    }
}
