//! Sensor monitor bridge.
//!
//! A sensor monitor (temperature, humidity, leakage current, ...) reports a
//! critical condition by sending a [`CriticalCondition`]. The bridge task
//! turns every such notification into an interlock trip and does nothing
//! else; it is the only consumer of the monitor channel.

use crate::session_actor::SessionHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Notification that a monitored quantity left its safe range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalCondition;

/// Sending side given to a sensor monitor.
#[derive(Debug, Clone)]
pub struct SensorSignal {
    tx: mpsc::Sender<CriticalCondition>,
}

impl SensorSignal {
    /// Report a critical condition.
    ///
    /// Never blocks. If notifications are already queued the new one is
    /// dropped, since a queued one trips the interlock anyway.
    pub fn critical(&self) {
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.tx.try_send(CriticalCondition) {
            warn!("Critical condition reported but the sensor bridge has stopped");
        }
    }
}

/// Create a monitor channel.
pub fn sensor_channel(capacity: usize) -> (SensorSignal, mpsc::Receiver<CriticalCondition>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SensorSignal { tx }, rx)
}

/// Spawn the bridge forwarding every critical condition from `monitor` to
/// the session interlock.
///
/// The task ends when every [`SensorSignal`] has been dropped.
pub fn spawn_sensor_bridge(
    session: SessionHandle,
    monitor: impl Into<String>,
    mut conditions: mpsc::Receiver<CriticalCondition>,
) -> JoinHandle<()> {
    let monitor = monitor.into();
    tokio::spawn(async move {
        info!(%monitor, "Sensor bridge started");
        while let Some(CriticalCondition) = conditions.recv().await {
            warn!(%monitor, "Critical condition reported");
            session
                .trip_interlock(format!("Critical condition reported by {monitor}"))
                .await;
        }
        info!(%monitor, "Sensor bridge stopped");
    })
}
