//! Actor that owns the session.
//!
//! The [`SessionActor`] is the single owner of a [`SessionController`]. It
//! receives [`SessionCommand`]s over a bounded mpsc channel and processes
//! them one at a time, so claim and activation decisions never observe torn
//! state. Clients talk to it through a cloneable [`SessionHandle`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  SessionCommand (mpsc)   ┌──────────────────────┐
//! │ SessionHandle│ ───────────────────────▶ │     SessionActor     │
//! │   (clone)    │  TripRequest (unbounded) │  owns SessionCtrl    │
//! │              │ ═══════════════════════▶ │  biased select: trip │
//! └──────────────┘ ◀─────────────────────── │  before commands     │
//!        ▲           oneshot response       └──────────────────────┘
//!        │ broadcast SessionEvent / watch SessionSnapshot  │
//!        └─────────────────────────────────────────────────┘
//! ```
//!
//! # Interlock
//!
//! [`SessionHandle::trip_interlock`] sets the shared interlock flag before it
//! sends anything, then queues a trip on a dedicated channel that the actor
//! always drains first. The actor keeps polling that channel while a command
//! is in flight: a trip that lands while the actor waits on a device switches
//! every active supply off through the session's
//! [`PowerCutoff`](crate::interlock::PowerCutoff) at once, and the full
//! release runs as soon as the command finishes. An activation that is
//! waiting on a device sees the flag as soon as the device answers and powers
//! the rail back off. The shutdown runs inside the actor task, so dropping
//! the caller's future does not cancel it.
//!
//! # Board refresh
//!
//! Firmware checks can take seconds. `RefreshStatuses` only marks the boards
//! and spawns the checks; their reports come back to the actor on an internal
//! channel and are applied there, so other commands and trips are served
//! while the checks run.
//!
//! # Cancellation
//!
//! A command whose caller has dropped its response receiver before the actor
//! gets to it is skipped without side effects. Once the actor has started a
//! command it runs it to completion, even if the caller goes away meanwhile.

use crate::channel::PowerRole;
use crate::config::StationConfig;
use crate::error::{SessionError, SessionResult};
use crate::hardware::capabilities::{FirmwareReport, PortId, StatusText};
use crate::hardware::registry::StationRegistry;
use crate::interlock::Interlock;
use crate::messages::{SessionCommand, SessionEvent, TripRequest};
use crate::pool::BoardStatus;
use crate::session::{BoardDiagnostics, DefaultsOutcome, SessionController};
use crate::snapshot::SessionSnapshot;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Reports of a spawned board refresh, on their way back to the actor.
struct RefreshDone {
    reports: Vec<(String, FirmwareReport)>,
    response: oneshot::Sender<BTreeMap<String, BoardStatus>>,
}

/// Actor owning one session.
pub struct SessionActor {
    session: SessionController,
}

impl SessionActor {
    /// Wrap a session.
    pub fn new(session: SessionController) -> Self {
        Self { session }
    }

    /// Runs the actor event loop until shutdown.
    ///
    /// Trips are always handled before the next command. When every handle
    /// has been dropped the session is shut down as if `Shutdown` had been
    /// received.
    pub async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        mut trip_rx: mpsc::UnboundedReceiver<TripRequest>,
    ) {
        info!("SessionActor started");
        let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel::<RefreshDone>();

        loop {
            tokio::select! {
                biased;

                Some(trip) = trip_rx.recv() => {
                    self.session.trip_interlock(&trip.reason).await;
                    if let Some(ack) = trip.ack {
                        let _ = ack.send(());
                    }
                }

                Some(done) = refresh_rx.recv() => {
                    let statuses = self.session.apply_refresh(done.reports);
                    let _ = done.response.send(statuses);
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        info!("All session handles dropped");
                        self.session.shutdown().await;
                        break;
                    };
                    if self
                        .serve_command(command, &mut trip_rx, &refresh_tx)
                        .await
                        .is_break()
                    {
                        break;
                    }
                }
            }
        }

        info!("SessionActor stopped");
    }

    /// Run one command while still answering trips.
    ///
    /// A trip that arrives mid-command cuts every active output immediately
    /// and is acknowledged then. The controller-level trip (release, test
    /// abort, announcements) follows once the command has finished.
    async fn serve_command(
        &mut self,
        command: SessionCommand,
        trip_rx: &mut mpsc::UnboundedReceiver<TripRequest>,
        refreshes: &mpsc::UnboundedSender<RefreshDone>,
    ) -> ControlFlow<()> {
        let interlock = self.session.interlock();
        let cutoff = self.session.power_cutoff();
        let mut deferred = Vec::new();

        let flow = {
            let work = self.handle_command(command, refreshes);
            tokio::pin!(work);
            loop {
                tokio::select! {
                    biased;

                    Some(trip) = trip_rx.recv() => {
                        interlock.trip(trip.reason.clone());
                        warn!(reason = %trip.reason, "Interlock tripped during a command; cutting outputs");
                        cutoff.cut_all().await;
                        if let Some(ack) = trip.ack {
                            let _ = ack.send(());
                        }
                        deferred.push(trip.reason);
                    }

                    flow = &mut work => break flow,
                }
            }
        };

        for reason in deferred {
            self.session.trip_interlock(&reason).await;
        }
        flow
    }

    async fn handle_command(
        &mut self,
        command: SessionCommand,
        refreshes: &mpsc::UnboundedSender<RefreshDone>,
    ) -> ControlFlow<()> {
        if command.is_abandoned() {
            debug!(command = command.name(), "Caller went away; command skipped");
            return ControlFlow::Continue(());
        }

        match command {
            SessionCommand::RefreshStatuses { response } => {
                let job = self.session.begin_refresh();
                let refreshes = refreshes.clone();
                tokio::spawn(
                    async move {
                        let reports = job.run().await;
                        if refreshes.send(RefreshDone { reports, response }).is_err() {
                            debug!("Session stopped before the board refresh finished");
                        }
                    }
                    .in_current_span(),
                );
            }

            SessionCommand::Claim { board, response } => {
                let _ = response.send(self.session.request_claim(&board));
            }

            SessionCommand::Release { board, response } => {
                let _ = response.send(self.session.request_release(&board));
            }

            SessionCommand::ActivatePower {
                role,
                model,
                port,
                response,
            } => {
                let result = self
                    .session
                    .request_power_activate(role, &model, &port)
                    .await;
                let _ = response.send(result);
            }

            SessionCommand::ReleasePower { role, response } => {
                let result = self.session.request_power_release(role).await;
                let _ = response.send(result);
            }

            SessionCommand::SetRemoteControl {
                role,
                enabled,
                response,
            } => {
                let _ = response.send(self.session.set_remote_control(role, enabled));
            }

            SessionCommand::SetOutput { role, on, response } => {
                let result = self.session.set_output(role, on).await;
                let _ = response.send(result);
            }

            SessionCommand::ListPorts { role, response } => {
                let ports = self.session.list_ports(role).await;
                let _ = response.send(ports);
            }

            SessionCommand::ConnectDefaults { response } => {
                let result = self.session.connect_defaults().await;
                let _ = response.send(result);
            }

            SessionCommand::ResetInterlock { response } => {
                let _ = response.send(self.session.reset_interlock());
            }

            SessionCommand::EnterExpertMode { response } => {
                self.session.enter_expert_mode();
                let _ = response.send(());
            }

            SessionCommand::ExitExpertMode { response } => {
                let result = self.session.exit_expert_mode().await;
                let _ = response.send(result);
            }

            SessionCommand::BeginTest { response } => {
                let result = self.session.begin_test().await;
                let _ = response.send(result);
            }

            SessionCommand::FinishTest { response } => {
                let _ = response.send(self.session.finish_test());
            }

            SessionCommand::BoardDiagnostics { board, response } => {
                let _ = response.send(self.session.board_diagnostics(&board));
            }

            SessionCommand::SetFpgaConfig {
                board,
                config,
                response,
            } => {
                let _ = response.send(self.session.set_fpga_config(&board, config));
            }

            SessionCommand::Snapshot { response } => {
                let _ = response.send(self.session.snapshot());
            }

            SessionCommand::Shutdown { response } => {
                self.session.shutdown().await;
                let _ = response.send(());
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }
}

/// Spawn the actor for an already-built session.
pub fn spawn(session: SessionController, command_capacity: usize) -> (SessionHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(command_capacity);
    let (trip_tx, trip_rx) = mpsc::unbounded_channel();

    let handle = SessionHandle {
        commands: command_tx,
        trips: trip_tx,
        interlock: session.interlock(),
        events: session.event_sender(),
        snapshots: session.watch_snapshot(),
    };

    let span = info_span!("session", session_id = %session.id());
    let task = tokio::spawn(SessionActor::new(session).run(command_rx, trip_rx).instrument(span));
    (handle, task)
}

/// Build a session from configuration and spawn its actor.
pub fn spawn_session(
    config: &StationConfig,
    registry: &StationRegistry,
) -> (SessionHandle, JoinHandle<()>) {
    let session = SessionController::new(config, registry);
    spawn(session, config.session.command_capacity)
}

/// Cloneable client of a [`SessionActor`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    trips: mpsc::UnboundedSender<TripRequest>,
    interlock: Interlock,
    events: broadcast::Sender<SessionEvent>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        (command, rx): (SessionCommand, oneshot::Receiver<T>),
    ) -> SessionResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Trip the safety interlock and wait until every active output is off.
    ///
    /// Never fails. The flag is set before this returns its first poll, so
    /// dropping the returned future early still leaves the interlock tripped
    /// and the shutdown queued.
    pub async fn trip_interlock(&self, reason: impl Into<String>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_trip(reason.into(), Some(ack_tx));
        let _ = ack_rx.await;
    }

    /// Trip the safety interlock without waiting for the shutdown.
    ///
    /// Usable from synchronous code such as signal handlers.
    pub fn signal_trip(&self, reason: impl Into<String>) {
        self.send_trip(reason.into(), None);
    }

    fn send_trip(&self, reason: String, ack: Option<oneshot::Sender<()>>) {
        self.interlock.trip(reason.clone());
        if self.trips.send(TripRequest { reason, ack }).is_err() {
            error!("Interlock trip requested after the session stopped");
        }
    }

    /// Whether the interlock is tripped
    pub fn is_interlock_tripped(&self) -> bool {
        self.interlock.is_tripped()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch the latest snapshot
    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Latest published snapshot, without a round trip to the actor
    pub fn latest_snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Check every board's firmware status
    pub async fn refresh_statuses(&self) -> SessionResult<BTreeMap<String, BoardStatus>> {
        self.request(SessionCommand::refresh_statuses()).await
    }

    /// Claim a board
    pub async fn claim(&self, board: &str) -> SessionResult<()> {
        self.request(SessionCommand::claim(board.to_string())).await?
    }

    /// Release the claimed board
    pub async fn release(&self, board: &str) -> SessionResult<()> {
        self.request(SessionCommand::release(board.to_string())).await?
    }

    /// Select and activate a rail
    pub async fn activate_power(
        &self,
        role: PowerRole,
        model: &str,
        port: &str,
    ) -> SessionResult<StatusText> {
        self.request(SessionCommand::activate_power(
            role,
            model.to_string(),
            port.to_string(),
        ))
        .await?
    }

    /// Power off and release a rail
    pub async fn release_power(&self, role: PowerRole) -> SessionResult<()> {
        self.request(SessionCommand::release_power(role)).await?
    }

    /// Switch a rail between remote and manual control
    pub async fn set_remote_control(&self, role: PowerRole, enabled: bool) -> SessionResult<()> {
        self.request(SessionCommand::set_remote_control(role, enabled))
            .await?
    }

    /// Switch an active rail's output
    pub async fn set_output(&self, role: PowerRole, on: bool) -> SessionResult<()> {
        self.request(SessionCommand::set_output(role, on)).await?
    }

    /// Ports of a rail
    pub async fn list_ports(&self, role: PowerRole) -> SessionResult<Vec<PortId>> {
        self.request(SessionCommand::list_ports(role)).await
    }

    /// Activate both rails with their defaults
    pub async fn connect_defaults(&self) -> SessionResult<DefaultsOutcome> {
        self.request(SessionCommand::connect_defaults()).await?
    }

    /// Clear the interlock
    pub async fn reset_interlock(&self) -> SessionResult<bool> {
        self.request(SessionCommand::reset_interlock()).await
    }

    /// Enter expert mode
    pub async fn enter_expert_mode(&self) -> SessionResult<()> {
        self.request(SessionCommand::enter_expert_mode()).await
    }

    /// Leave expert mode
    pub async fn exit_expert_mode(&self) -> SessionResult<()> {
        self.request(SessionCommand::exit_expert_mode()).await?
    }

    /// Start a test on the claimed board
    pub async fn begin_test(&self) -> SessionResult<()> {
        self.request(SessionCommand::begin_test()).await?
    }

    /// Finish the running test
    pub async fn finish_test(&self) -> SessionResult<bool> {
        self.request(SessionCommand::finish_test()).await
    }

    /// Firmware diagnostics of a board
    pub async fn board_diagnostics(&self, board: &str) -> SessionResult<BoardDiagnostics> {
        self.request(SessionCommand::board_diagnostics(board.to_string()))
            .await?
    }

    /// Select the FPGA image of a board
    pub async fn set_fpga_config(&self, board: &str, config: Option<String>) -> SessionResult<()> {
        self.request(SessionCommand::set_fpga_config(board.to_string(), config))
            .await?
    }

    /// Current snapshot, after every queued command
    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        self.request(SessionCommand::snapshot()).await
    }

    /// Power everything off and stop the actor
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.request(SessionCommand::shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::registry::create_mock_registry;

    fn config() -> StationConfig {
        StationConfig::from_toml_str(
            r#"
            [application]
            name = "Actor Test"

            [session]
            start_in_expert_mode = true

            [[boards]]
            name = "FC7-A"
            address = "192.168.1.80"

            [power.hv]
            driver = { type = "mock" }

            [power.lv]
            driver = { type = "mock" }
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let (registry, _, _, _) = create_mock_registry(&["FC7-A"]);
        let (handle, task) = spawn_session(&config(), &registry);

        handle.refresh_statuses().await.unwrap();
        handle.claim("FC7-A").await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.claimed_board.as_deref(), Some("FC7-A"));
        assert_eq!(handle.latest_snapshot(), snapshot);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(handle.claim("FC7-A").await, Err(SessionError::SessionClosed));
    }

    #[tokio::test]
    async fn test_dropping_all_handles_shuts_down() {
        let (registry, _, _, _) = create_mock_registry(&["FC7-A"]);
        let (handle, task) = spawn_session(&config(), &registry);
        let mut events = handle.subscribe();
        drop(handle);

        task.await.unwrap();
        let mut saw_shutdown = false;
        while let Ok(event) = events.try_recv() {
            saw_shutdown |= event == SessionEvent::Shutdown;
        }
        assert!(saw_shutdown);
    }

    #[tokio::test]
    async fn test_trip_after_shutdown_still_sets_flag() {
        let (registry, _, _, _) = create_mock_registry(&["FC7-A"]);
        let (handle, task) = spawn_session(&config(), &registry);
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        handle.trip_interlock("late").await;
        assert!(handle.is_interlock_tripped());
    }
}
