//! Message types for actor-based communication.
//!
//! This module defines the command, trip and event types exchanged with the
//! `SessionActor` (see [`crate::session_actor`]).
//!
//! # Message Flow
//!
//! ```text
//! Client (UI, CLI, sensor)           Actor Task
//! ------------------------           ----------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                    3. Receive command
//!                                    4. Skip it if the caller went away
//!                                    5. Process (mutate session)
//!                                    6. Send response
//! 7. Await oneshot receiver   <------
//! ```
//!
//! # Channel Types
//!
//! - **mpsc (bounded)**: client → actor commands, processed in order
//! - **mpsc (unbounded)**: interlock trips, always drained before commands
//! - **oneshot**: actor → client response, one per command
//! - **broadcast**: [`SessionEvent`] notifications to any number of observers
//!
//! Each command variant has a helper that builds the command and returns the
//! receiver:
//!
//! ```rust
//! use station_ctl::messages::SessionCommand;
//!
//! let (cmd, rx) = SessionCommand::claim("FC7-A".to_string());
//! // cmd_tx.send(cmd).await?;
//! // let result = rx.await?;
//! ```

use crate::channel::PowerRole;
use crate::error::SessionResult;
use crate::hardware::capabilities::{PortId, StatusText};
use crate::pool::BoardStatus;
use crate::session::{BoardDiagnostics, DefaultsOutcome};
use crate::snapshot::SessionSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Notifications broadcast to session observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Interlock tripped; both rails have already been switched off
    GlobalStop {
        /// Trip cause
        reason: String,
    },
    /// Operator cleared the interlock
    InterlockReset,
    /// A board was claimed
    BoardClaimed {
        /// Board name
        board: String,
    },
    /// A board was released
    BoardReleased {
        /// Board name
        board: String,
    },
    /// A rail became active
    ChannelActivated {
        /// Rail
        role: PowerRole,
        /// Device status text
        status: String,
    },
    /// An active rail was powered off and released
    ChannelReleased {
        /// Rail
        role: PowerRole,
    },
    /// Expert mode toggled
    ExpertModeChanged {
        /// New value
        enabled: bool,
    },
    /// A test started on the claimed board
    TestStarted {
        /// Board under test
        board: String,
    },
    /// The running test ended
    TestFinished {
        /// Board under test
        board: Option<String>,
        /// Ended by the interlock rather than the operator
        aborted: bool,
    },
    /// The session shut down
    Shutdown,
}

/// Interlock trip request.
///
/// Travels on its own channel so it is never queued behind operator
/// commands, and is served even while a command is waiting on a device.
#[derive(Debug)]
pub struct TripRequest {
    /// Trip cause
    pub reason: String,
    /// Acknowledged once every active output has been switched off
    pub ack: Option<oneshot::Sender<()>>,
}

/// Commands that can be sent to the `SessionActor`.
///
/// Each variant carries a `oneshot::Sender` for the response. Use the helper
/// methods to create commands with receivers.
#[derive(Debug)]
pub enum SessionCommand {
    /// Check every board's firmware status.
    RefreshStatuses {
        /// Status per board
        response: oneshot::Sender<BTreeMap<String, BoardStatus>>,
    },

    /// Claim a board for exclusive use.
    Claim {
        /// Board name
        board: String,
        /// Claim result
        response: oneshot::Sender<SessionResult<()>>,
    },

    /// Release the claimed board.
    Release {
        /// Board name
        board: String,
        /// Release result
        response: oneshot::Sender<SessionResult<()>>,
    },

    /// Select a model/port on a rail and activate it.
    ActivatePower {
        /// Rail
        role: PowerRole,
        /// Supply model
        model: String,
        /// Port the supply is on
        port: String,
        /// Device status on success
        response: oneshot::Sender<SessionResult<StatusText>>,
    },

    /// Power a rail off and release it.
    ReleasePower {
        /// Rail
        role: PowerRole,
        /// Release result
        response: oneshot::Sender<SessionResult<()>>,
    },

    /// Switch a rail between remote and manual control.
    SetRemoteControl {
        /// Rail
        role: PowerRole,
        /// Remote (true) or front panel (false)
        enabled: bool,
        /// Result
        response: oneshot::Sender<SessionResult<()>>,
    },

    /// Switch an active rail's output.
    SetOutput {
        /// Rail
        role: PowerRole,
        /// On or off
        on: bool,
        /// Result
        response: oneshot::Sender<SessionResult<()>>,
    },

    /// List the ports of a rail.
    ListPorts {
        /// Rail
        role: PowerRole,
        /// Ports (empty if enumeration failed)
        response: oneshot::Sender<Vec<PortId>>,
    },

    /// Activate both rails with their configured defaults.
    ConnectDefaults {
        /// Per-rail outcome
        response: oneshot::Sender<SessionResult<DefaultsOutcome>>,
    },

    /// Clear the interlock.
    ResetInterlock {
        /// Whether it was tripped
        response: oneshot::Sender<bool>,
    },

    /// Enter expert mode.
    EnterExpertMode {
        /// Acknowledgement
        response: oneshot::Sender<()>,
    },

    /// Leave expert mode.
    ExitExpertMode {
        /// Result
        response: oneshot::Sender<SessionResult<()>>,
    },

    /// Start a test on the claimed board.
    BeginTest {
        /// Result
        response: oneshot::Sender<SessionResult<()>>,
    },

    /// Finish the running test.
    FinishTest {
        /// Whether a test was running
        response: oneshot::Sender<bool>,
    },

    /// Firmware diagnostics of a board.
    BoardDiagnostics {
        /// Board name
        board: String,
        /// Diagnostics
        response: oneshot::Sender<SessionResult<BoardDiagnostics>>,
    },

    /// Select the FPGA image of a board.
    SetFpgaConfig {
        /// Board name
        board: String,
        /// Image name, or None to clear
        config: Option<String>,
        /// Result
        response: oneshot::Sender<SessionResult<()>>,
    },

    /// Current snapshot.
    Snapshot {
        /// Snapshot
        response: oneshot::Sender<SessionSnapshot>,
    },

    /// Power everything off and stop the actor.
    Shutdown {
        /// Acknowledgement, sent after teardown
        response: oneshot::Sender<()>,
    },
}

impl SessionCommand {
    /// Whether the caller has stopped waiting for the response.
    pub fn is_abandoned(&self) -> bool {
        match self {
            SessionCommand::RefreshStatuses { response } => response.is_closed(),
            SessionCommand::Claim { response, .. }
            | SessionCommand::Release { response, .. }
            | SessionCommand::ReleasePower { response, .. }
            | SessionCommand::SetRemoteControl { response, .. }
            | SessionCommand::SetOutput { response, .. }
            | SessionCommand::ExitExpertMode { response }
            | SessionCommand::BeginTest { response }
            | SessionCommand::SetFpgaConfig { response, .. } => response.is_closed(),
            SessionCommand::ActivatePower { response, .. } => response.is_closed(),
            SessionCommand::ListPorts { response, .. } => response.is_closed(),
            SessionCommand::ConnectDefaults { response } => response.is_closed(),
            SessionCommand::ResetInterlock { response }
            | SessionCommand::FinishTest { response } => response.is_closed(),
            SessionCommand::EnterExpertMode { response } => response.is_closed(),
            SessionCommand::BoardDiagnostics { response, .. } => response.is_closed(),
            SessionCommand::Snapshot { response } => response.is_closed(),
            // Teardown always runs
            SessionCommand::Shutdown { .. } => false,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SessionCommand::RefreshStatuses { .. } => "refresh_statuses",
            SessionCommand::Claim { .. } => "claim",
            SessionCommand::Release { .. } => "release",
            SessionCommand::ActivatePower { .. } => "activate_power",
            SessionCommand::ReleasePower { .. } => "release_power",
            SessionCommand::SetRemoteControl { .. } => "set_remote_control",
            SessionCommand::SetOutput { .. } => "set_output",
            SessionCommand::ListPorts { .. } => "list_ports",
            SessionCommand::ConnectDefaults { .. } => "connect_defaults",
            SessionCommand::ResetInterlock { .. } => "reset_interlock",
            SessionCommand::EnterExpertMode { .. } => "enter_expert_mode",
            SessionCommand::ExitExpertMode { .. } => "exit_expert_mode",
            SessionCommand::BeginTest { .. } => "begin_test",
            SessionCommand::FinishTest { .. } => "finish_test",
            SessionCommand::BoardDiagnostics { .. } => "board_diagnostics",
            SessionCommand::SetFpgaConfig { .. } => "set_fpga_config",
            SessionCommand::Snapshot { .. } => "snapshot",
            SessionCommand::Shutdown { .. } => "shutdown",
        }
    }

    /// Helper to create a RefreshStatuses command
    pub fn refresh_statuses() -> (Self, oneshot::Receiver<BTreeMap<String, BoardStatus>>) {
        let (tx, rx) = oneshot::channel();
        (Self::RefreshStatuses { response: tx }, rx)
    }

    /// Helper to create a Claim command
    pub fn claim(board: String) -> (Self, oneshot::Receiver<SessionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Claim { board, response: tx }, rx)
    }

    /// Helper to create a Release command
    pub fn release(board: String) -> (Self, oneshot::Receiver<SessionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Release { board, response: tx }, rx)
    }

    /// Helper to create an ActivatePower command
    pub fn activate_power(
        role: PowerRole,
        model: String,
        port: String,
    ) -> (Self, oneshot::Receiver<SessionResult<StatusText>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::ActivatePower {
                role,
                model,
                port,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a ReleasePower command
    pub fn release_power(role: PowerRole) -> (Self, oneshot::Receiver<SessionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ReleasePower { role, response: tx }, rx)
    }

    /// Helper to create a SetRemoteControl command
    pub fn set_remote_control(
        role: PowerRole,
        enabled: bool,
    ) -> (Self, oneshot::Receiver<SessionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetRemoteControl {
                role,
                enabled,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a SetOutput command
    pub fn set_output(role: PowerRole, on: bool) -> (Self, oneshot::Receiver<SessionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetOutput {
                role,
                on,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a ListPorts command
    pub fn list_ports(role: PowerRole) -> (Self, oneshot::Receiver<Vec<PortId>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ListPorts { role, response: tx }, rx)
    }

    /// Helper to create a ConnectDefaults command
    pub fn connect_defaults() -> (Self, oneshot::Receiver<SessionResult<DefaultsOutcome>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ConnectDefaults { response: tx }, rx)
    }

    /// Helper to create a ResetInterlock command
    pub fn reset_interlock() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::ResetInterlock { response: tx }, rx)
    }

    /// Helper to create an EnterExpertMode command
    pub fn enter_expert_mode() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::EnterExpertMode { response: tx }, rx)
    }

    /// Helper to create an ExitExpertMode command
    pub fn exit_expert_mode() -> (Self, oneshot::Receiver<SessionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ExitExpertMode { response: tx }, rx)
    }

    /// Helper to create a BeginTest command
    pub fn begin_test() -> (Self, oneshot::Receiver<SessionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::BeginTest { response: tx }, rx)
    }

    /// Helper to create a FinishTest command
    pub fn finish_test() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::FinishTest { response: tx }, rx)
    }

    /// Helper to create a BoardDiagnostics command
    pub fn board_diagnostics(
        board: String,
    ) -> (Self, oneshot::Receiver<SessionResult<BoardDiagnostics>>) {
        let (tx, rx) = oneshot::channel();
        (Self::BoardDiagnostics { board, response: tx }, rx)
    }

    /// Helper to create a SetFpgaConfig command
    pub fn set_fpga_config(
        board: String,
        config: Option<String>,
    ) -> (Self, oneshot::Receiver<SessionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetFpgaConfig {
                board,
                config,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Snapshot command
    pub fn snapshot() -> (Self, oneshot::Receiver<SessionSnapshot>) {
        let (tx, rx) = oneshot::channel();
        (Self::Snapshot { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
