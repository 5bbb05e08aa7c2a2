//! Immutable session snapshots.
//!
//! Observers never see live session state. They receive a
//! [`SessionSnapshot`] derived from it by [`project`], which is a pure
//! function: every "can do X" flag a presentation layer renders is computed
//! here from the typed state, so there is one source of truth for whether a
//! transition is currently legal.

use crate::channel::{Activation, PowerChannel, PowerRole};
use crate::hardware::capabilities::Severity;
use crate::interlock::TripRecord;
use crate::pool::{BoardStatus, ClaimState, ExclusiveResourcePool, Resource};
use serde::Serialize;
use uuid::Uuid;

/// Comment shown for the claimed board
pub const CLAIMED_COMMENT: &str = "Connected";

/// Rendering-ready view of one board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardSnapshot {
    /// Board name
    pub name: String,
    /// Network address
    pub address: String,
    /// Last known health
    pub status: BoardStatus,
    /// Claim state
    pub claim_state: ClaimState,
    /// Last status comment; "Connected" while claimed
    pub comment: Option<String>,
    /// Selected FPGA image
    pub fpga_config: Option<String>,
    /// Whether a claim request would currently be accepted
    pub can_claim: bool,
}

/// Rendering-ready view of one power channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    /// Rail
    pub role: PowerRole,
    /// Activation state
    pub activation: Activation,
    /// Remote (true) or front panel (false) control
    pub remote_control_enabled: bool,
    /// Selected model
    pub selected_model: Option<String>,
    /// Selected port
    pub selected_port: Option<String>,
    /// Status text from the last activation attempt
    pub status_text: Option<String>,
    /// Severity from the last activation attempt
    pub severity: Option<Severity>,
    /// Colour of `severity` for status displays
    pub color: Option<&'static str>,
    /// Output energized by this controller
    pub output_on: bool,
    /// Whether `select` would currently be accepted
    pub can_select: bool,
    /// Whether the channel holds a device that can be released
    pub can_release: bool,
}

/// Rendering-ready view of the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Session identifier
    pub session_id: Uuid,
    /// Expert mode flag
    pub expert_mode: bool,
    /// Interlock flag
    pub interlock_tripped: bool,
    /// Details of the current trip
    pub interlock: Option<TripRecord>,
    /// A test is running on the claimed board
    pub test_in_progress: bool,
    /// The "start new test" capability
    pub can_start_new_test: bool,
    /// Claimed board
    pub claimed_board: Option<String>,
    /// Every board, in configuration order
    pub boards: Vec<BoardSnapshot>,
    /// HV rail
    pub hv: ChannelSnapshot,
    /// LV rail
    pub lv: ChannelSnapshot,
}

impl SessionSnapshot {
    /// Snapshot of one rail
    pub fn channel(&self, role: PowerRole) -> &ChannelSnapshot {
        match role {
            PowerRole::Hv => &self.hv,
            PowerRole::Lv => &self.lv,
        }
    }

    /// Snapshot of one board
    pub fn board(&self, name: &str) -> Option<&BoardSnapshot> {
        self.boards.iter().find(|b| b.name == name)
    }
}

/// Borrowed session state a snapshot is projected from.
#[allow(missing_docs)]
pub struct SessionView<'a> {
    pub session_id: Uuid,
    pub expert_mode: bool,
    pub interlock: Option<TripRecord>,
    pub interlock_tripped: bool,
    pub test_in_progress: bool,
    pub default_board: Option<&'a str>,
    pub pool: &'a ExclusiveResourcePool,
    pub hv: &'a PowerChannel,
    pub lv: &'a PowerChannel,
}

/// Derive the presentation snapshot from session state.
pub fn project(view: &SessionView<'_>) -> SessionSnapshot {
    let claimed_board = view.pool.current_claim().map(str::to_string);
    let boards = view
        .pool
        .resources()
        .iter()
        .map(|r| board_snapshot(view, r))
        .collect();

    SessionSnapshot {
        session_id: view.session_id,
        expert_mode: view.expert_mode,
        interlock_tripped: view.interlock_tripped,
        interlock: view.interlock.clone(),
        test_in_progress: view.test_in_progress,
        can_start_new_test: claimed_board.is_some()
            && !view.test_in_progress
            && !view.interlock_tripped,
        claimed_board,
        boards,
        hv: channel_snapshot(view.hv, view.interlock_tripped),
        lv: channel_snapshot(view.lv, view.interlock_tripped),
    }
}

fn board_snapshot(view: &SessionView<'_>, resource: &Resource) -> BoardSnapshot {
    let claimed = resource.claim_state() == ClaimState::Claimed;
    let comment = if claimed {
        Some(CLAIMED_COMMENT.to_string())
    } else {
        resource.last_report().map(|r| r.comment.clone())
    };
    let allowed_in_mode = view.expert_mode || view.default_board == Some(resource.name());

    BoardSnapshot {
        name: resource.name().to_string(),
        address: resource.address().to_string(),
        status: resource.last_status(),
        claim_state: resource.claim_state(),
        comment,
        fpga_config: resource.fpga_config().map(str::to_string),
        can_claim: !view.interlock_tripped
            && allowed_in_mode
            && view.pool.is_claimable(resource.name()),
    }
}

fn channel_snapshot(channel: &PowerChannel, interlock_tripped: bool) -> ChannelSnapshot {
    let activation = channel.activation();
    ChannelSnapshot {
        role: channel.role(),
        activation,
        remote_control_enabled: channel.remote_control_enabled(),
        selected_model: channel.selected_model().map(str::to_string),
        selected_port: channel.selected_port().map(str::to_string),
        status_text: channel.last_status_text().map(|s| s.to_string()),
        severity: channel.severity(),
        color: channel.severity().map(|s| s.color()),
        output_on: channel.is_output_on(),
        can_select: !interlock_tripped
            && channel.remote_control_enabled()
            && matches!(activation, Activation::Idle | Activation::Configuring),
        can_release: activation == Activation::Active,
    }
}
