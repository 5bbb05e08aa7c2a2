//! Safety interlock flag.
//!
//! The flag is shared between the session owner and every producer of trip
//! requests. Tripping it is a plain atomic store, so it takes effect before
//! the session task has even seen the trip message: an activation that is
//! already waiting on a device observes the flag the moment the device call
//! returns and powers the rail back off.
//!
//! Only [`Interlock::reset`] clears the flag. Nothing in the crate calls it
//! except the explicit operator reset path.
//!
//! [`PowerCutoff`] is the other half: a registry of the supplies that are
//! currently energizable, so a trip can switch them off while the session
//! task is still waiting on an unrelated device call.

use crate::channel::PowerRole;
use crate::hardware::capabilities::InstrumentHandle;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{info, warn};

/// Details recorded when the interlock trips.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TripRecord {
    /// Operator-visible cause
    pub reason: String,
    /// When the trip was recorded
    pub at: DateTime<Utc>,
}

/// Shared interlock flag.
///
/// Cloning yields another reference to the same flag.
#[derive(Debug, Clone, Default)]
pub struct Interlock {
    tripped: Arc<AtomicBool>,
    record: Arc<RwLock<Option<TripRecord>>>,
}

impl Interlock {
    /// Create a clear interlock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the interlock.
    ///
    /// Returns true if this call changed the flag. The first reason wins;
    /// later trips keep the first record.
    pub fn trip(&self, reason: impl Into<String>) -> bool {
        let first = !self.tripped.swap(true, Ordering::SeqCst);
        if first {
            if let Ok(mut record) = self.record.write() {
                *record = Some(TripRecord {
                    reason: reason.into(),
                    at: Utc::now(),
                });
            }
        }
        first
    }

    /// Whether the interlock is tripped.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// The record of the current trip, if any.
    pub fn record(&self) -> Option<TripRecord> {
        self.record.read().ok().and_then(|r| r.clone())
    }

    /// Clear the interlock. Returns true if it was tripped.
    pub fn reset(&self) -> bool {
        let was_tripped = self.tripped.swap(false, Ordering::SeqCst);
        if let Ok(mut record) = self.record.write() {
            *record = None;
        }
        was_tripped
    }
}

/// Registry of opened supplies that a trip must be able to switch off.
///
/// Channels register their handle when they become active and unregister it
/// before they release it. Cloning yields another reference to the same
/// registry.
#[derive(Clone, Default)]
pub struct PowerCutoff {
    supplies: Arc<Mutex<BTreeMap<PowerRole, Arc<dyn InstrumentHandle>>>>,
}

impl PowerCutoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, role: PowerRole, handle: Arc<dyn InstrumentHandle>) {
        self.supplies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(role, handle);
    }

    pub fn unregister(&self, role: PowerRole) {
        self.supplies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&role);
    }

    /// Roles with a registered supply.
    pub fn registered(&self) -> Vec<PowerRole> {
        self.supplies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Send power-off to every registered supply concurrently.
    ///
    /// Registrations are kept; the owning channel still performs its own
    /// release. Returns how many supplies acknowledged the power-off.
    pub async fn cut_all(&self) -> usize {
        let supplies: Vec<(PowerRole, Arc<dyn InstrumentHandle>)> = self
            .supplies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(role, handle)| (*role, Arc::clone(handle)))
            .collect();

        let results = join_all(supplies.iter().map(|(role, handle)| async move {
            (*role, handle.power_off().await)
        }))
        .await;

        let mut acknowledged = 0;
        for (role, result) in results {
            match result {
                Ok(()) => {
                    info!(role = %role, "Output cut by interlock");
                    acknowledged += 1;
                }
                Err(err) => warn!(role = %role, error = %err, "Interlock power-off failed"),
            }
        }
        acknowledged
    }
}

impl std::fmt::Debug for PowerCutoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerCutoff")
            .field("registered", &self.registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::PowerSupplyConnector;
    use crate::hardware::mock::MockPowerSupply;

    #[test]
    fn test_trip_and_reset() {
        let interlock = Interlock::new();
        assert!(!interlock.is_tripped());

        assert!(interlock.trip("Sensor over temperature"));
        assert!(interlock.is_tripped());
        assert_eq!(
            interlock.record().map(|r| r.reason),
            Some("Sensor over temperature".to_string())
        );

        assert!(interlock.reset());
        assert!(!interlock.is_tripped());
        assert!(interlock.record().is_none());
        assert!(!interlock.reset());
    }

    #[test]
    fn test_first_reason_wins() {
        let interlock = Interlock::new();
        assert!(interlock.trip("first"));
        assert!(!interlock.trip("second"));
        assert_eq!(interlock.record().map(|r| r.reason), Some("first".to_string()));
    }

    #[test]
    fn test_clones_share_state() {
        let interlock = Interlock::new();
        let producer = interlock.clone();
        producer.trip("remote");
        assert!(interlock.is_tripped());
    }

    #[tokio::test]
    async fn test_cutoff_switches_registered_supplies_off() {
        let supply = MockPowerSupply::new()
            .with_port("COM4", "Keithley 2410")
            .with_port("COM5", "E3633A");
        let hv: Arc<dyn InstrumentHandle> = Arc::from(supply.open("ModelX", "COM4").await.unwrap());
        let lv: Arc<dyn InstrumentHandle> = Arc::from(supply.open("ModelY", "COM5").await.unwrap());
        hv.power_on().await.unwrap();
        lv.power_on().await.unwrap();

        let cutoff = PowerCutoff::new();
        cutoff.register(PowerRole::Hv, hv);
        cutoff.register(PowerRole::Lv, Arc::clone(&lv));
        cutoff.unregister(PowerRole::Lv);
        assert_eq!(cutoff.registered(), vec![PowerRole::Hv]);

        assert_eq!(cutoff.cut_all().await, 1);
        assert!(!supply.port("COM4").unwrap().is_output_on());
        assert!(supply.port("COM5").unwrap().is_output_on());
    }

    #[tokio::test]
    async fn test_cutoff_counts_only_acknowledged_power_offs() {
        let supply = MockPowerSupply::new().with_port("COM4", "Keithley 2410");
        supply.port("COM4").unwrap().set_fail_power_off(true);
        let handle = supply.open("ModelX", "COM4").await.unwrap();

        let cutoff = PowerCutoff::new();
        cutoff.register(PowerRole::Hv, Arc::from(handle));
        assert_eq!(cutoff.cut_all().await, 0);
        assert_eq!(cutoff.registered(), vec![PowerRole::Hv]);
    }
}
