//! Exclusive board pool.
//!
//! Tracks the configured firmware boards and enforces that at most one of
//! them is claimed at any time. The exclusion is global across the pool: a
//! claim on any board is rejected while a different board is held. Requests
//! are rejected outright and never queued, since the pool models a single
//! physical test fixture.
//!
//! Board health comes from a [`FirmwareStatusSource`]. A refresh is split in
//! two: [`ExclusiveResourcePool::begin_refresh`] hands out a [`RefreshJob`]
//! that owns everything the checks need, so the owner can run it on another
//! task and apply the reports when they arrive. Checks run concurrently,
//! bounded by the configured timeout. A failing or slow check is recorded as
//! [`BoardStatus::Error`] and never propagated.
//!
//! The claimed board is in use by the running test and is never re-checked;
//! it keeps the status it was claimed with.

use crate::config::{BoardDefinition, FirmwareConfig};
use crate::error::ClaimError;
use crate::hardware::capabilities::{BoardIdentity, FirmwareReport, FirmwareStatusSource, Severity};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Last known health of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardStatus {
    /// Never checked
    Unknown,
    /// A check is in flight
    Checking,
    /// Healthy
    Ok,
    /// Reachable with caveats
    Warning,
    /// Unreachable or failing
    Error,
}

impl From<Severity> for BoardStatus {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Ok => BoardStatus::Ok,
            Severity::Warning => BoardStatus::Warning,
            Severity::Error => BoardStatus::Error,
        }
    }
}

/// Claim state of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    /// Available
    Free,
    /// Exclusively held for testing
    Claimed,
}

/// One firmware board in the pool.
#[derive(Debug, Clone)]
pub struct Resource {
    name: String,
    address: String,
    log_id: String,
    fpga_config: Option<String>,
    last_status: BoardStatus,
    last_report: Option<FirmwareReport>,
    claim_state: ClaimState,
}

impl Resource {
    fn new(definition: &BoardDefinition, log_id: String) -> Self {
        Self {
            name: definition.name.clone(),
            address: definition.address.clone(),
            log_id,
            fpga_config: definition.fpga_config.clone(),
            last_status: BoardStatus::Unknown,
            last_report: None,
            claim_state: ClaimState::Free,
        }
    }

    /// Board name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Network address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Identifier of the board's check log
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    /// Selected FPGA image
    pub fn fpga_config(&self) -> Option<&str> {
        self.fpga_config.as_deref()
    }

    /// Last known health
    pub fn last_status(&self) -> BoardStatus {
        self.last_status
    }

    /// Report from the last completed check
    pub fn last_report(&self) -> Option<&FirmwareReport> {
        self.last_report.as_ref()
    }

    /// Claim state
    pub fn claim_state(&self) -> ClaimState {
        self.claim_state
    }

    fn identity(&self) -> BoardIdentity {
        BoardIdentity {
            name: self.name.clone(),
            address: self.address.clone(),
            log_id: self.log_id.clone(),
        }
    }
}

/// Pool of firmware boards with a single global claim.
pub struct ExclusiveResourcePool {
    resources: Vec<Resource>,
    source: Arc<dyn FirmwareStatusSource>,
    status_timeout: Duration,
}

impl ExclusiveResourcePool {
    /// Create a pool with one free, unchecked resource per board.
    pub fn new(
        boards: &[BoardDefinition],
        firmware: &FirmwareConfig,
        source: Arc<dyn FirmwareStatusSource>,
        status_timeout: Duration,
    ) -> Self {
        let resources = boards
            .iter()
            .map(|b| Resource::new(b, firmware.log_id(&b.name)))
            .collect();
        Self {
            resources,
            source,
            status_timeout,
        }
    }

    /// All boards, in configuration order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Look up a board by name.
    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.name == name)
    }

    /// Name of the claimed board, if any.
    pub fn current_claim(&self) -> Option<&str> {
        self.resources
            .iter()
            .find(|r| r.claim_state == ClaimState::Claimed)
            .map(|r| r.name.as_str())
    }

    /// Whether `name` could be claimed right now.
    pub fn is_claimable(&self, name: &str) -> bool {
        self.current_claim().is_none()
            && self
                .get(name)
                .is_some_and(|r| r.last_status == BoardStatus::Ok)
    }

    /// Mark every unclaimed board as `Checking` and return the job that
    /// checks them.
    pub fn begin_refresh(&mut self) -> RefreshJob {
        let identities = self
            .resources
            .iter_mut()
            .filter(|r| r.claim_state == ClaimState::Free)
            .map(|r| {
                r.last_status = BoardStatus::Checking;
                r.identity()
            })
            .collect();
        RefreshJob {
            source: self.source.clone(),
            identities,
            timeout: self.status_timeout,
        }
    }

    /// Record the outcome of one board check.
    ///
    /// Unknown names are ignored; the board list is fixed for the session.
    /// Reports for the claimed board are dropped.
    pub fn apply_report(&mut self, name: &str, report: FirmwareReport) {
        match self.get_mut(name) {
            Some(resource) if resource.claim_state == ClaimState::Free => {
                resource.last_status = report.severity.into();
                resource.last_report = Some(report);
            }
            Some(_) => debug!(board = name, "Ignoring status report for claimed board"),
            None => {}
        }
    }

    /// Check every unclaimed board and record the results.
    ///
    /// Never fails: a check that errors or exceeds the status timeout leaves
    /// the board in `Error`.
    pub async fn refresh_statuses(&mut self) -> BTreeMap<String, BoardStatus> {
        let reports = self.begin_refresh().run().await;
        for (name, report) in reports {
            self.apply_report(&name, report);
        }
        self.statuses()
    }

    /// Current status of every board.
    pub fn statuses(&self) -> BTreeMap<String, BoardStatus> {
        self.resources
            .iter()
            .map(|r| (r.name.clone(), r.last_status))
            .collect()
    }

    /// Claim `name` for exclusive use.
    ///
    /// Claiming the board that is already held is a no-op success.
    pub fn claim(&mut self, name: &str) -> Result<(), ClaimError> {
        let Some(target) = self.get(name) else {
            return Err(ClaimError::UnknownResource(name.to_string()));
        };
        if target.claim_state == ClaimState::Claimed {
            return Ok(());
        }
        if let Some(held) = self.current_claim() {
            return Err(ClaimError::AlreadyClaimed {
                held: held.to_string(),
            });
        }
        if target.last_status != BoardStatus::Ok {
            return Err(ClaimError::NotReady(name.to_string()));
        }

        if let Some(resource) = self.get_mut(name) {
            resource.claim_state = ClaimState::Claimed;
        }
        info!(board = name, "Board claimed");
        Ok(())
    }

    /// Release the claimed board.
    pub fn release(&mut self, name: &str) -> Result<(), ClaimError> {
        match self.get_mut(name) {
            Some(resource) if resource.claim_state == ClaimState::Claimed => {
                resource.claim_state = ClaimState::Free;
                info!(board = name, "Board released");
                Ok(())
            }
            _ => Err(ClaimError::NotClaimedByCaller(name.to_string())),
        }
    }

    /// Release whatever is claimed. Returns the released board.
    pub fn release_all(&mut self) -> Option<String> {
        let held = self.current_claim()?.to_string();
        if let Some(resource) = self.get_mut(&held) {
            resource.claim_state = ClaimState::Free;
        }
        info!(board = %held, "Board released");
        Some(held)
    }

    /// Record the FPGA image selected for a board.
    pub fn set_fpga_config(&mut self, name: &str, config: Option<String>) -> Result<(), ClaimError> {
        let resource = self
            .get_mut(name)
            .ok_or_else(|| ClaimError::UnknownResource(name.to_string()))?;
        debug!(board = name, fpga_config = ?config, "FPGA configuration selected");
        resource.fpga_config = config;
        Ok(())
    }
}

/// A batch of board checks detached from the pool.
///
/// Holds no reference to the pool, so it can run on its own task while the
/// pool's owner keeps serving requests.
pub struct RefreshJob {
    source: Arc<dyn FirmwareStatusSource>,
    identities: Vec<BoardIdentity>,
    timeout: Duration,
}

impl RefreshJob {
    /// Boards this job checks.
    pub fn boards(&self) -> impl Iterator<Item = &str> {
        self.identities.iter().map(|i| i.name.as_str())
    }

    /// Run every check concurrently.
    pub async fn run(self) -> Vec<(String, FirmwareReport)> {
        let RefreshJob {
            source,
            identities,
            timeout,
        } = self;
        check_all(source, identities, timeout).await
    }
}

async fn check_all(
    source: Arc<dyn FirmwareStatusSource>,
    identities: Vec<BoardIdentity>,
    timeout: Duration,
) -> Vec<(String, FirmwareReport)> {
    let checks = identities.into_iter().map(|identity| {
        let source = source.clone();
        async move {
            let report = match tokio::time::timeout(timeout, source.check(&identity)).await {
                Ok(Ok(report)) => report,
                Ok(Err(err)) => {
                    warn!(board = %identity.name, error = %err, "Firmware status check failed");
                    FirmwareReport::query_failed(&err)
                }
                Err(_) => {
                    warn!(board = %identity.name, ?timeout, "Firmware status check timed out");
                    FirmwareReport::query_failed(&anyhow::anyhow!(
                        "No answer within {} ms",
                        timeout.as_millis()
                    ))
                }
            };
            (identity.name, report)
        }
    });
    join_all(checks).await
}
