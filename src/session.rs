//! Session controller.
//!
//! [`SessionController`] is the single owner of the board pool, both power
//! channels, the expert-mode flag and the test lifecycle. Every transition
//! goes through it so the interlock and expert-mode gates are applied the same
//! way everywhere. It is not shared: [`crate::session_actor`] runs it on one
//! task and serializes all requests to it.
//!
//! After every mutation the controller publishes a fresh [`SessionSnapshot`]
//! on a `watch` channel and, for notable transitions, a [`SessionEvent`] on a
//! `broadcast` channel. Observers get copies, never references.
//!
//! The interlock power-off path does not go through observers.
//! [`SessionController::trip_interlock`] switches both rails off itself and
//! only then announces the stop. Both channels share one [`PowerCutoff`], so
//! a caller that cannot wait for the controller can still cut every active
//! output.

use crate::channel::{Activation, PowerChannel, PowerRole};
use crate::config::StationConfig;
use crate::error::{ChannelError, ClaimError, SessionError, SessionResult};
use crate::hardware::capabilities::{FirmwareReport, PortId, Severity, StatusText};
use crate::hardware::registry::StationRegistry;
use crate::interlock::{Interlock, PowerCutoff};
use crate::messages::SessionEvent;
use crate::pool::{BoardStatus, ClaimState, ExclusiveResourcePool, RefreshJob};
use crate::snapshot::{project, SessionSnapshot, SessionView};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Last firmware report of a board, with the operator solution text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardDiagnostics {
    /// Board name
    pub board: String,
    /// Last known health
    pub status: BoardStatus,
    /// Status comment (key of the solution table)
    pub comment: Option<String>,
    /// Comment severity
    pub severity: Option<Severity>,
    /// Verbose details from the status source
    pub verbose: Option<String>,
    /// Solution text for `comment`, if the table has one
    pub solution: Option<String>,
    /// Identifier of the board's check log
    pub log_id: String,
}

/// Per-rail outcome of [`SessionController::connect_defaults`].
pub type DefaultsOutcome = Vec<(PowerRole, SessionResult<StatusText>)>;

#[derive(Debug, Clone, Default)]
struct RailDefaults {
    model: Option<String>,
    port: Option<String>,
}

/// Coordinator of one test station session.
pub struct SessionController {
    id: Uuid,
    pool: ExclusiveResourcePool,
    hv: PowerChannel,
    lv: PowerChannel,
    expert_mode: bool,
    test_in_progress: bool,
    interlock: Interlock,
    cutoff: PowerCutoff,
    default_board: Option<String>,
    rail_defaults: [RailDefaults; 2],
    solutions: BTreeMap<String, String>,
    events: broadcast::Sender<SessionEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    /// Build a session from configuration and resolved drivers.
    ///
    /// Every board starts free and unchecked. Both channels start `Idle`, and
    /// are forced to `Disabled` unless the session starts in expert mode.
    pub fn new(config: &StationConfig, registry: &StationRegistry) -> Self {
        let settings = &config.session;
        let pool = ExclusiveResourcePool::new(
            &config.boards,
            &config.firmware,
            registry.firmware(),
            settings.status_timeout(),
        );
        let cutoff = PowerCutoff::new();
        let hv = PowerChannel::new(
            PowerRole::Hv,
            registry.connector(PowerRole::Hv),
            settings.instrument_timeout(),
        )
        .with_cutoff(cutoff.clone());
        let lv = PowerChannel::new(
            PowerRole::Lv,
            registry.connector(PowerRole::Lv),
            settings.instrument_timeout(),
        )
        .with_cutoff(cutoff.clone());
        let rail_defaults = PowerRole::ALL.map(|role| {
            let rail = config.power.rail(role);
            RailDefaults {
                model: rail.default_model.clone(),
                port: rail.default_port.clone(),
            }
        });

        let (events, _) = broadcast::channel(settings.event_capacity);
        let id = Uuid::new_v4();
        let mut session = Self {
            id,
            pool,
            hv,
            lv,
            expert_mode: settings.start_in_expert_mode,
            test_in_progress: false,
            interlock: Interlock::new(),
            cutoff,
            default_board: config.default_board().map(str::to_string),
            rail_defaults,
            solutions: config.firmware.solutions.clone(),
            events,
            snapshots: watch::channel(placeholder_snapshot(id)).0,
        };

        if !session.expert_mode {
            for role in PowerRole::ALL {
                if let Err(err) = session.channel_mut(role).set_remote_control(false) {
                    warn!(%role, error = %err, "Could not disable remote control at startup");
                }
            }
        }
        let snapshot = session.snapshot();
        session.snapshots.send_replace(snapshot);
        info!(session_id = %id, expert_mode = session.expert_mode, boards = config.boards.len(), "Session created");
        session
    }

    /// Session identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Shared interlock flag, for producers that must trip it directly
    pub fn interlock(&self) -> Interlock {
        self.interlock.clone()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Event sender, for handles that subscribe on behalf of observers
    pub(crate) fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    /// Watch the latest snapshot
    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// Whether expert mode is on
    pub fn is_expert_mode(&self) -> bool {
        self.expert_mode
    }

    /// Whether the interlock is tripped
    pub fn is_interlock_tripped(&self) -> bool {
        self.interlock.is_tripped()
    }

    /// Whether a test is running
    pub fn is_test_in_progress(&self) -> bool {
        self.test_in_progress
    }

    /// Name of the claimed board
    pub fn current_claim(&self) -> Option<&str> {
        self.pool.current_claim()
    }

    /// The "start new test" capability
    pub fn can_start_new_test(&self) -> bool {
        self.pool.current_claim().is_some() && !self.test_in_progress && !self.is_interlock_tripped()
    }

    /// Read access to one channel
    pub fn channel(&self, role: PowerRole) -> &PowerChannel {
        match role {
            PowerRole::Hv => &self.hv,
            PowerRole::Lv => &self.lv,
        }
    }

    fn channel_mut(&mut self, role: PowerRole) -> &mut PowerChannel {
        match role {
            PowerRole::Hv => &mut self.hv,
            PowerRole::Lv => &mut self.lv,
        }
    }

    /// Read access to the board pool
    pub fn pool(&self) -> &ExclusiveResourcePool {
        &self.pool
    }

    /// Project the current state into a snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        project(&SessionView {
            session_id: self.id,
            expert_mode: self.expert_mode,
            interlock: self.interlock.record(),
            interlock_tripped: self.interlock.is_tripped(),
            test_in_progress: self.test_in_progress,
            default_board: self.default_board.as_deref(),
            pool: &self.pool,
            hv: &self.hv,
            lv: &self.lv,
        })
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn emit(&self, event: SessionEvent) {
        debug!(?event, "Session event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn ensure_interlock_clear(&self) -> SessionResult<()> {
        if self.interlock.is_tripped() {
            Err(SessionError::InterlockActive)
        } else {
            Ok(())
        }
    }

    fn ensure_expert(&self, operation: &str) -> SessionResult<()> {
        if self.expert_mode {
            Ok(())
        } else {
            Err(SessionError::ExpertModeRequired(operation.to_string()))
        }
    }

    // -------------------------------------------------------------------------
    // Boards
    // -------------------------------------------------------------------------

    /// Check every unclaimed board and record the results.
    pub async fn refresh_statuses(&mut self) -> BTreeMap<String, BoardStatus> {
        let reports = self.begin_refresh().run().await;
        self.apply_refresh(reports)
    }

    /// Mark the unclaimed boards `Checking` and hand out the checks to run.
    ///
    /// Pair with [`SessionController::apply_refresh`] once the job completes.
    pub fn begin_refresh(&mut self) -> RefreshJob {
        let job = self.pool.begin_refresh();
        self.publish();
        job
    }

    /// Record the reports of a completed [`RefreshJob`].
    pub fn apply_refresh(
        &mut self,
        reports: Vec<(String, FirmwareReport)>,
    ) -> BTreeMap<String, BoardStatus> {
        for (name, report) in reports {
            self.pool.apply_report(&name, report);
        }
        self.publish();
        self.pool.statuses()
    }

    /// Claim a board for exclusive use.
    ///
    /// Outside expert mode only the default board may be claimed.
    pub fn request_claim(&mut self, board: &str) -> SessionResult<()> {
        self.ensure_interlock_clear()?;
        if !self.expert_mode
            && self.pool.get(board).is_some()
            && self.default_board.as_deref() != Some(board)
        {
            return Err(SessionError::ExpertModeRequired(format!("claim board '{board}'")));
        }

        let newly_claimed = self.pool.current_claim() != Some(board);
        self.pool.claim(board)?;
        if newly_claimed {
            self.emit(SessionEvent::BoardClaimed {
                board: board.to_string(),
            });
        }
        self.publish();
        Ok(())
    }

    /// Release the claimed board.
    pub fn request_release(&mut self, board: &str) -> SessionResult<()> {
        self.ensure_interlock_clear()?;
        if self.test_in_progress {
            return Err(SessionError::TestInProgress);
        }
        self.pool.release(board)?;
        self.emit(SessionEvent::BoardReleased {
            board: board.to_string(),
        });
        self.publish();
        Ok(())
    }

    /// Firmware report of a board, with its solution text.
    pub fn board_diagnostics(&self, board: &str) -> SessionResult<BoardDiagnostics> {
        let resource = self
            .pool
            .get(board)
            .ok_or_else(|| ClaimError::UnknownResource(board.to_string()))?;
        let report = resource.last_report();
        let comment = report.map(|r| r.comment.clone());
        let solution = comment
            .as_deref()
            .and_then(|c| self.solutions.get(c))
            .cloned();

        Ok(BoardDiagnostics {
            board: resource.name().to_string(),
            status: resource.last_status(),
            comment,
            severity: report.map(|r| r.severity),
            verbose: report.map(|r| r.verbose.clone()),
            solution,
            log_id: resource.log_id().to_string(),
        })
    }

    /// Record the FPGA image for a board. Expert mode only.
    pub fn set_fpga_config(&mut self, board: &str, config: Option<String>) -> SessionResult<()> {
        self.ensure_expert("select FPGA configuration")?;
        self.pool.set_fpga_config(board, config)?;
        self.publish();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Power
    // -------------------------------------------------------------------------

    /// Select `model`/`port` on a rail and activate it.
    pub async fn request_power_activate(
        &mut self,
        role: PowerRole,
        model: &str,
        port: &str,
    ) -> SessionResult<StatusText> {
        self.ensure_interlock_clear()?;
        if !self.channel(role).remote_control_enabled() {
            return Err(ChannelError::RemoteControlDisabled(role).into());
        }

        self.channel_mut(role).select(model, port)?;
        let interlock = self.interlock.clone();
        let result = self.channel_mut(role).activate(&interlock).await;
        if let Ok(status) = &result {
            self.emit(SessionEvent::ChannelActivated {
                role,
                status: status.to_string(),
            });
        }
        self.publish();
        Ok(result?)
    }

    /// Power a rail off and release it.
    ///
    /// De-energizing is never blocked by the interlock.
    pub async fn request_power_release(&mut self, role: PowerRole) -> SessionResult<()> {
        if !self.channel(role).remote_control_enabled() {
            return Err(ChannelError::RemoteControlDisabled(role).into());
        }
        let was_active = self.channel(role).activation() == Activation::Active;
        self.channel_mut(role).deactivate().await;
        if was_active {
            self.emit(SessionEvent::ChannelReleased { role });
        }
        self.publish();
        Ok(())
    }

    /// Switch between remote and manual control of a rail.
    ///
    /// Taking remote control requires expert mode.
    pub fn set_remote_control(&mut self, role: PowerRole, enabled: bool) -> SessionResult<()> {
        if enabled {
            self.ensure_expert("enable remote control")?;
        }
        self.channel_mut(role).set_remote_control(enabled)?;
        self.publish();
        Ok(())
    }

    /// Switch an active rail's output on or off.
    ///
    /// Switching on is refused while the interlock is tripped.
    pub async fn set_output(&mut self, role: PowerRole, on: bool) -> SessionResult<()> {
        if on {
            self.ensure_interlock_clear()?;
        }
        let interlock = self.interlock.clone();
        let result = self.channel_mut(role).set_output(on, &interlock).await;
        self.publish();
        Ok(result?)
    }

    /// Ports available on a rail.
    pub async fn list_ports(&self, role: PowerRole) -> Vec<PortId> {
        self.channel(role).list_available_ports().await
    }

    /// Activate both rails with their configured default model and port.
    ///
    /// Expert mode only. Each rail succeeds or fails on its own.
    pub async fn connect_defaults(&mut self) -> SessionResult<DefaultsOutcome> {
        self.ensure_expert("connect default devices")?;
        self.ensure_interlock_clear()?;

        let mut outcome = Vec::with_capacity(2);
        for (index, role) in PowerRole::ALL.into_iter().enumerate() {
            let defaults = self.rail_defaults[index].clone();
            let result = match (defaults.model, defaults.port) {
                (Some(model), Some(port)) => {
                    self.request_power_activate(role, &model, &port).await
                }
                _ => Err(ChannelError::InvalidSelection(format!(
                    "no default {role} model/port configured"
                ))
                .into()),
            };
            outcome.push((role, result));
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Interlock
    // -------------------------------------------------------------------------

    /// Registry of the supplies that are currently active.
    pub fn power_cutoff(&self) -> PowerCutoff {
        self.cutoff.clone()
    }

    /// Trip the safety interlock.
    ///
    /// Switches both rails off, aborts any running test, then announces the
    /// stop. Never fails. Every power-off command runs to completion without
    /// a timeout.
    pub async fn trip_interlock(&mut self, reason: &str) {
        self.interlock.trip(reason);
        error!(session_id = %self.id, reason, "Interlock tripped; de-energizing all rails");

        for role in PowerRole::ALL {
            let was_active = self.channel(role).activation() == Activation::Active;
            self.channel_mut(role).deactivate().await;
            if was_active {
                self.emit(SessionEvent::ChannelReleased { role });
            }
        }

        if self.test_in_progress {
            self.test_in_progress = false;
            warn!("Running test aborted by interlock");
            self.emit(SessionEvent::TestFinished {
                board: self.pool.current_claim().map(str::to_string),
                aborted: true,
            });
        }

        self.emit(SessionEvent::GlobalStop {
            reason: self
                .interlock
                .record()
                .map(|r| r.reason)
                .unwrap_or_else(|| reason.to_string()),
        });
        self.publish();
    }

    /// Clear the interlock. Returns true if it was tripped.
    pub fn reset_interlock(&mut self) -> bool {
        let was_tripped = self.interlock.reset();
        if was_tripped {
            info!(session_id = %self.id, "Interlock reset by operator");
            self.emit(SessionEvent::InterlockReset);
            self.publish();
        }
        was_tripped
    }

    // -------------------------------------------------------------------------
    // Expert mode
    // -------------------------------------------------------------------------

    /// Enter expert mode and take remote control of both rails.
    pub fn enter_expert_mode(&mut self) {
        if !self.expert_mode {
            self.expert_mode = true;
            self.emit(SessionEvent::ExpertModeChanged { enabled: true });
        }
        for role in PowerRole::ALL {
            if let Err(err) = self.channel_mut(role).set_remote_control(true) {
                warn!(%role, error = %err, "Could not enable remote control");
            }
        }
        info!("Expert mode entered");
        self.publish();
    }

    /// Leave expert mode.
    ///
    /// Releases both rails, hands them back to front panel control and drops
    /// a claim on any board other than the default one.
    pub async fn exit_expert_mode(&mut self) -> SessionResult<()> {
        if self.test_in_progress {
            return Err(SessionError::TestInProgress);
        }

        for role in PowerRole::ALL {
            let was_active = self.channel(role).activation() == Activation::Active;
            self.channel_mut(role).deactivate().await;
            if was_active {
                self.emit(SessionEvent::ChannelReleased { role });
            }
            self.channel_mut(role).set_remote_control(false)?;
        }

        if let Some(held) = self.pool.current_claim().map(str::to_string) {
            if self.default_board.as_deref() != Some(held.as_str()) {
                self.pool.release(&held)?;
                self.emit(SessionEvent::BoardReleased { board: held });
            }
        }

        if self.expert_mode {
            self.expert_mode = false;
            self.emit(SessionEvent::ExpertModeChanged { enabled: false });
        }
        info!("Expert mode left");
        self.publish();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Test lifecycle
    // -------------------------------------------------------------------------

    /// Start a test on the claimed board.
    ///
    /// Switches the LV output on when the LV rail is active. If that fails
    /// the test is not started.
    pub async fn begin_test(&mut self) -> SessionResult<()> {
        self.ensure_interlock_clear()?;
        if self.test_in_progress {
            return Err(SessionError::TestInProgress);
        }
        let board = self
            .pool
            .current_claim()
            .map(str::to_string)
            .ok_or(SessionError::NoBoardClaimed)?;
        if self.pool.get(&board).map(|r| r.last_status()) != Some(BoardStatus::Ok) {
            return Err(ClaimError::NotReady(board).into());
        }

        if self.lv.activation() == Activation::Active {
            let interlock = self.interlock.clone();
            let switched = self.lv.set_output(true, &interlock).await;
            if let Err(err) = switched {
                warn!(board = %board, error = %err, "Test not started; LV output failed");
                self.publish();
                return Err(err.into());
            }
        }

        self.test_in_progress = true;
        info!(board = %board, "Test started");
        self.emit(SessionEvent::TestStarted { board });
        self.publish();
        Ok(())
    }

    /// Finish the running test. Returns false if none was running.
    pub fn finish_test(&mut self) -> bool {
        if !self.test_in_progress {
            return false;
        }
        self.test_in_progress = false;
        let board = self.pool.current_claim().map(str::to_string);
        info!(board = ?board, "Test finished");
        self.emit(SessionEvent::TestFinished {
            board,
            aborted: false,
        });
        self.publish();
        true
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Power off both rails, release the claim and announce the shutdown.
    pub async fn shutdown(&mut self) {
        for role in PowerRole::ALL {
            self.channel_mut(role).deactivate().await;
        }
        self.test_in_progress = false;
        if let Some(board) = self.pool.release_all() {
            self.emit(SessionEvent::BoardReleased { board });
        }
        info!(session_id = %self.id, "Session shut down");
        self.emit(SessionEvent::Shutdown);
        self.publish();
    }

    /// Check the session invariants.
    ///
    /// At most one claimed board, and no channel `Active` without remote
    /// control and a complete selection.
    pub fn invariants_hold(&self) -> bool {
        let claimed = self
            .pool
            .resources()
            .iter()
            .filter(|r| r.claim_state() == ClaimState::Claimed)
            .count();
        claimed <= 1 && self.hv.invariant_holds() && self.lv.invariant_holds()
    }
}

/// Snapshot used only until the first real projection replaces it.
fn placeholder_snapshot(id: Uuid) -> SessionSnapshot {
    use crate::snapshot::ChannelSnapshot;
    let channel = |role| ChannelSnapshot {
        role,
        activation: Activation::Idle,
        remote_control_enabled: false,
        selected_model: None,
        selected_port: None,
        status_text: None,
        severity: None,
        color: None,
        output_on: false,
        can_select: false,
        can_release: false,
    };
    SessionSnapshot {
        session_id: id,
        expert_mode: false,
        interlock_tripped: false,
        interlock: None,
        test_in_progress: false,
        can_start_new_test: false,
        claimed_board: None,
        boards: Vec::new(),
        hv: channel(PowerRole::Hv),
        lv: channel(PowerRole::Lv),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::registry::create_mock_registry;
    use tracing_test::traced_test;

    const HV_PORT: &str = "ASRL/dev/ttyUSB0::INSTR";
    const LV_PORT: &str = "ASRL/dev/ttyUSB2::INSTR";

    fn config(expert: bool) -> StationConfig {
        StationConfig::from_toml_str(&format!(
            r#"
            [application]
            name = "Session Test"

            [session]
            start_in_expert_mode = {expert}
            default_board = "FC7-A"

            [[boards]]
            name = "FC7-A"
            address = "192.168.1.80"

            [[boards]]
            name = "FC7-B"
            address = "192.168.1.81"

            [power.hv]
            default_model = "Keithley2410"
            default_port = "{HV_PORT}"
            driver = {{ type = "mock" }}

            [power.lv]
            driver = {{ type = "mock" }}

            [firmware.solutions]
            "Board not reachable" = "Check the ethernet cable"
            "#
        ))
        .unwrap()
    }

    async fn session(expert: bool) -> SessionController {
        let (registry, _, _, _) = create_mock_registry(&["FC7-A", "FC7-B"]);
        let mut session = SessionController::new(&config(expert), &registry);
        session.refresh_statuses().await;
        session
    }

    #[tokio::test]
    async fn test_non_expert_starts_disabled() {
        let session = session(false).await;
        assert_eq!(session.channel(PowerRole::Hv).activation(), Activation::Disabled);
        assert_eq!(session.channel(PowerRole::Lv).activation(), Activation::Disabled);
    }

    #[tokio::test]
    async fn test_non_expert_claims_default_board_only() {
        let mut session = session(false).await;
        assert!(matches!(
            session.request_claim("FC7-B"),
            Err(SessionError::ExpertModeRequired(_))
        ));
        session.request_claim("FC7-A").unwrap();
        assert!(session.can_start_new_test());
        session.request_release("FC7-A").unwrap();
        assert!(!session.can_start_new_test());
    }

    #[tokio::test]
    async fn test_power_gated_by_remote_control() {
        let mut session = session(false).await;
        assert_eq!(
            session
                .request_power_activate(PowerRole::Hv, "Keithley2410", HV_PORT)
                .await,
            Err(ChannelError::RemoteControlDisabled(PowerRole::Hv).into())
        );
        assert!(matches!(
            session.set_remote_control(PowerRole::Hv, true),
            Err(SessionError::ExpertModeRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_expert_mode_cleans_up() {
        let mut session = session(true).await;
        session.request_claim("FC7-B").unwrap();
        session
            .request_power_activate(PowerRole::Lv, "E3633A", LV_PORT)
            .await
            .unwrap();

        session.exit_expert_mode().await.unwrap();
        assert!(!session.is_expert_mode());
        assert_eq!(session.current_claim(), None);
        assert_eq!(session.channel(PowerRole::Lv).activation(), Activation::Disabled);
    }

    #[tokio::test]
    async fn test_exit_expert_mode_keeps_default_claim() {
        let mut session = session(true).await;
        session.request_claim("FC7-A").unwrap();
        session.exit_expert_mode().await.unwrap();
        assert_eq!(session.current_claim(), Some("FC7-A"));
    }

    #[tokio::test]
    async fn test_connect_defaults_reports_each_rail() {
        let mut session = session(true).await;
        let outcome = session.connect_defaults().await.unwrap();
        assert_eq!(outcome.len(), 2);
        assert!(outcome[0].1.is_ok());
        assert!(matches!(
            outcome[1].1,
            Err(SessionError::Channel(ChannelError::InvalidSelection(_)))
        ));
        assert_eq!(session.channel(PowerRole::Hv).activation(), Activation::Active);

        let mut non_expert = self::session(false).await;
        assert!(matches!(
            non_expert.connect_defaults().await,
            Err(SessionError::ExpertModeRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_test_lifecycle() {
        let mut session = session(true).await;
        assert_eq!(session.begin_test().await, Err(SessionError::NoBoardClaimed));

        session.request_claim("FC7-A").unwrap();
        session.begin_test().await.unwrap();
        assert!(!session.can_start_new_test());
        assert_eq!(session.begin_test().await, Err(SessionError::TestInProgress));
        assert_eq!(session.request_release("FC7-A"), Err(SessionError::TestInProgress));
        assert_eq!(session.exit_expert_mode().await, Err(SessionError::TestInProgress));

        assert!(session.finish_test());
        assert!(!session.finish_test());
        session.request_release("FC7-A").unwrap();
    }

    #[tokio::test]
    async fn test_begin_test_switches_lv_output_on() {
        let (registry, _, lv, _) = create_mock_registry(&["FC7-A", "FC7-B"]);
        let mut session = SessionController::new(&config(true), &registry);
        session.refresh_statuses().await;
        session.request_claim("FC7-A").unwrap();
        session
            .request_power_activate(PowerRole::Lv, "E3633A", LV_PORT)
            .await
            .unwrap();

        session.begin_test().await.unwrap();
        assert!(lv.port(LV_PORT).unwrap().is_output_on());
        assert!(session.channel(PowerRole::Lv).is_output_on());
        assert!(session.snapshot().lv.output_on);
    }

    #[tokio::test]
    async fn test_failed_lv_output_does_not_start_test() {
        let (registry, _, lv, _) = create_mock_registry(&["FC7-A", "FC7-B"]);
        let mut session = SessionController::new(&config(true), &registry);
        session.refresh_statuses().await;
        session.request_claim("FC7-A").unwrap();
        session
            .request_power_activate(PowerRole::Lv, "E3633A", LV_PORT)
            .await
            .unwrap();
        lv.port(LV_PORT).unwrap().set_status(StatusText::NO_VALID_DEVICE).await;

        assert!(matches!(
            session.begin_test().await,
            Err(SessionError::Channel(ChannelError::OutputFailed { role: PowerRole::Lv, .. }))
        ));
        assert!(!session.is_test_in_progress());
        assert!(session.can_start_new_test());
    }

    #[tokio::test]
    async fn test_claimed_board_keeps_status_across_refresh() {
        let (registry, _, _, firmware) = create_mock_registry(&["FC7-A", "FC7-B"]);
        let mut session = SessionController::new(&config(true), &registry);
        session.refresh_statuses().await;
        session.request_claim("FC7-A").unwrap();

        firmware.set_failing("FC7-A", true).await;
        let statuses = session.refresh_statuses().await;
        assert_eq!(statuses["FC7-A"], BoardStatus::Ok);
        assert_eq!(
            session.snapshot().board("FC7-A").unwrap().comment.as_deref(),
            Some("Connected")
        );
    }

    #[tokio::test]
    async fn test_trip_aborts_test_and_resets() {
        let mut session = session(true).await;
        let mut events = session.subscribe();
        session.request_claim("FC7-A").unwrap();
        session.begin_test().await.unwrap();

        session.trip_interlock("sensor over temperature").await;
        assert!(!session.is_test_in_progress());
        assert_eq!(session.begin_test().await, Err(SessionError::InterlockActive));

        let mut saw_stop = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::GlobalStop { reason } = event {
                assert_eq!(reason, "sensor over temperature");
                saw_stop = true;
            }
        }
        assert!(saw_stop);

        assert!(session.reset_interlock());
        assert!(!session.reset_interlock());
        session.begin_test().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_trip_is_logged_with_reason() {
        let mut session = session(true).await;
        session
            .request_power_activate(PowerRole::Hv, "Keithley2410", HV_PORT)
            .await
            .unwrap();

        session.trip_interlock("leakage current above limit").await;
        assert!(logs_contain("Interlock tripped"));
        assert!(logs_contain("leakage current above limit"));
        assert!(logs_contain("Power supply released"));
    }

    #[tokio::test]
    async fn test_board_diagnostics_and_fpga_config() {
        let (registry, _, _, _) = create_mock_registry(&["FC7-A"]);
        let mut session = SessionController::new(&config(true), &registry);
        session.refresh_statuses().await;

        let diag = session.board_diagnostics("FC7-B").unwrap();
        assert_eq!(diag.status, BoardStatus::Error);
        assert_eq!(diag.solution.as_deref(), Some("Check the ethernet cable"));
        assert!(diag.log_id.ends_with(".FC7-B.log"));
        assert!(session.board_diagnostics("FC7-Z").is_err());

        session
            .set_fpga_config("FC7-A", Some("IT-uDTC_L12-KSU-3xQUAD".into()))
            .unwrap();
        assert_eq!(
            session.snapshot().board("FC7-A").unwrap().fpga_config.as_deref(),
            Some("IT-uDTC_L12-KSU-3xQUAD")
        );
    }

    #[tokio::test]
    async fn test_claimed_board_shows_connected() {
        let mut session = session(true).await;
        session.request_claim("FC7-B").unwrap();
        let snapshot = session.snapshot();
        assert_eq!(
            snapshot.board("FC7-B").unwrap().comment.as_deref(),
            Some("Connected")
        );
        assert!(!snapshot.board("FC7-A").unwrap().can_claim);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let mut session = session(true).await;
        session.request_claim("FC7-A").unwrap();
        session
            .request_power_activate(PowerRole::Hv, "Keithley2410", HV_PORT)
            .await
            .unwrap();
        session.set_output(PowerRole::Hv, true).await.unwrap();

        session.shutdown().await;
        assert_eq!(session.current_claim(), None);
        assert_eq!(session.channel(PowerRole::Hv).activation(), Activation::Idle);
        assert!(!session.channel(PowerRole::Hv).is_output_on());
        assert!(session.invariants_hold());
    }
}
