//! Integration tests for the safety interlock.
//!
//! Covers the fail-safe shutdown from every reachable channel state, the
//! one-way gate until an explicit reset, a trip racing an in-flight
//! activation, a trip while the session waits on an unrelated device or on
//! board checks, and the sensor bridge.

mod common;

use common::*;
use station_ctl::hardware::mock::MockFirmwareSource;
use station_ctl::messages::SessionEvent;
use station_ctl::pool::BoardStatus;
use station_ctl::sensor::{sensor_channel, spawn_sensor_bridge};
use station_ctl::{Activation, ChannelError, PowerRole, SessionError};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// =============================================================================
// Fail-safe shutdown
// =============================================================================

#[tokio::test]
async fn test_trip_de_energizes_every_rail() {
    let station = start_station(true).await;
    let mut events = station.handle.subscribe();

    assert_ok!(station.handle.connect_defaults().await);
    assert_ok!(station.handle.set_output(PowerRole::Hv, true).await);
    assert_ok!(station.handle.set_output(PowerRole::Lv, true).await);
    assert!(station.hv.any_output_on() && station.lv.any_output_on());

    station.handle.trip_interlock("over temperature").await;

    assert!(!station.hv.any_output_on());
    assert!(!station.lv.any_output_on());
    let snapshot = station.handle.snapshot().await.unwrap();
    assert!(snapshot.interlock_tripped);
    assert_eq!(
        snapshot.interlock.as_ref().map(|r| r.reason.as_str()),
        Some("over temperature")
    );
    for role in PowerRole::ALL {
        assert_eq!(snapshot.channel(role).activation, Activation::Idle);
        assert!(!snapshot.channel(role).can_select);
    }

    let mut stops = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::GlobalStop { reason } = event {
            stops.push(reason);
        }
    }
    assert_eq!(stops, vec!["over temperature".to_string()]);
    station.stop().await;
}

#[tokio::test]
async fn test_trip_from_mixed_channel_states() {
    let station = start_station(true).await;

    // HV active, LV under manual control
    assert_ok!(
        station
            .handle
            .activate_power(PowerRole::Hv, "ModelX", HV_PORT)
            .await
    );
    assert_ok!(station.handle.set_remote_control(PowerRole::Lv, false).await);

    station.handle.trip_interlock("leakage current").await;

    let snapshot = station.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.hv.activation, Activation::Idle);
    assert_eq!(snapshot.lv.activation, Activation::Disabled);
    assert!(!station.hv.any_output_on());
    assert_eq!(station.hv.port(HV_PORT).unwrap().power_off_count(), 1);
    station.stop().await;
}

#[tokio::test]
async fn test_trip_with_idle_rails_is_harmless() {
    let station = start_station(true).await;

    station.handle.trip_interlock("first").await;
    station.handle.trip_interlock("second").await;

    let snapshot = station.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.hv.activation, Activation::Idle);
    assert_eq!(snapshot.lv.activation, Activation::Idle);
    // First reason is kept until reset
    assert_eq!(snapshot.interlock.unwrap().reason, "first");
    assert_eq!(station.hv.port(HV_PORT).unwrap().power_off_count(), 0);
    station.stop().await;
}

#[tokio::test]
async fn test_failing_power_off_still_releases_channel() {
    let station = start_station(true).await;
    assert_ok!(
        station
            .handle
            .activate_power(PowerRole::Hv, "ModelX", HV_PORT)
            .await
    );
    station.hv.port(HV_PORT).unwrap().set_fail_power_off(true);

    station.handle.trip_interlock("vacuum lost").await;

    let snapshot = station.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.hv.activation, Activation::Idle);
    assert!(!station.hv.any_output_on());
    station.stop().await;
}

// =============================================================================
// One-way gate
// =============================================================================

#[tokio::test]
async fn test_tripped_interlock_blocks_until_reset() {
    let station = start_station(true).await;
    station.handle.trip_interlock("door open").await;

    assert_eq!(
        station.handle.claim("FC7-A").await,
        Err(SessionError::InterlockActive)
    );
    assert_eq!(
        station
            .handle
            .activate_power(PowerRole::Hv, "ModelX", HV_PORT)
            .await,
        Err(SessionError::InterlockActive)
    );
    assert_eq!(station.hv.port(HV_PORT).unwrap().open_count(), 0);

    // Powering down is never blocked
    assert_ok!(station.handle.release_power(PowerRole::Hv).await);

    let snapshot = station.handle.snapshot().await.unwrap();
    assert!(snapshot.boards.iter().all(|b| !b.can_claim));
    assert!(!snapshot.can_start_new_test);

    assert!(station.handle.reset_interlock().await.unwrap());
    assert!(!station.handle.reset_interlock().await.unwrap());
    assert!(!station.handle.is_interlock_tripped());

    assert_ok!(station.handle.claim("FC7-A").await);
    assert_ok!(
        station
            .handle
            .activate_power(PowerRole::Hv, "ModelX", HV_PORT)
            .await
    );
    station.stop().await;
}

#[tokio::test]
async fn test_trip_aborts_running_test() {
    let station = start_station(true).await;
    let mut events = station.handle.subscribe();
    assert_ok!(station.handle.claim("FC7-A").await);
    assert_ok!(station.handle.begin_test().await);

    station.handle.trip_interlock("humidity").await;

    let snapshot = station.handle.snapshot().await.unwrap();
    assert!(!snapshot.test_in_progress);
    assert!(!snapshot.can_start_new_test);
    // The claim survives a trip
    assert_eq!(snapshot.claimed_board.as_deref(), Some("FC7-A"));
    assert_err!(station.handle.begin_test().await);

    let mut aborted = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::TestFinished { board, aborted: true } = event {
            assert_eq!(board.as_deref(), Some("FC7-A"));
            aborted = true;
        }
    }
    assert!(aborted);
    station.stop().await;
}

// =============================================================================
// Trip racing an in-flight activation
// =============================================================================

#[tokio::test]
async fn test_trip_during_activation_powers_supply_back_off() {
    let station = start_with_slow_hv(Duration::from_millis(300)).await;
    let port = station.hv.port(HV_PORT).unwrap();

    let activation = tokio::spawn({
        let handle = station.handle.clone();
        async move { handle.activate_power(PowerRole::Hv, "ModelX", HV_PORT).await }
    });

    port.wait_for_open().await;
    station.handle.trip_interlock("over temperature").await;

    let result = activation.await.unwrap();
    assert_eq!(
        result,
        Err(SessionError::Channel(ChannelError::InterlockTripped(
            PowerRole::Hv
        )))
    );
    assert!(!port.is_output_on());
    assert!(port.power_off_count() >= 1);

    let snapshot = station.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.hv.activation, Activation::Idle);
    assert!(snapshot.interlock_tripped);
    station.stop().await;
}

#[tokio::test]
async fn test_trip_flag_is_visible_before_actor_catches_up() {
    let station = start_with_slow_hv(Duration::from_millis(300)).await;
    let port = station.hv.port(HV_PORT).unwrap();

    let activation = tokio::spawn({
        let handle = station.handle.clone();
        async move { handle.activate_power(PowerRole::Hv, "ModelX", HV_PORT).await }
    });
    port.wait_for_open().await;

    station.handle.signal_trip("emergency stop button");
    assert!(station.handle.is_interlock_tripped());

    assert_err!(activation.await.unwrap());
    let snapshot = station.handle.snapshot().await.unwrap();
    assert!(snapshot.interlock_tripped);
    assert!(!port.is_output_on());
    station.stop().await;
}

// =============================================================================
// Trip while the session is busy elsewhere
// =============================================================================

fn healthy_boards() -> MockFirmwareSource {
    MockFirmwareSource::new()
        .with_ok_board("FC7-A")
        .with_ok_board("FC7-B")
}

#[tokio::test]
async fn test_trip_cuts_hv_while_lv_port_listing_hangs() {
    let lv = lv_supply().with_list_delay(Duration::from_secs(2));
    let station = start_with(true, hv_supply(), lv, healthy_boards()).await;
    assert_ok!(
        station
            .handle
            .activate_power(PowerRole::Hv, "ModelX", HV_PORT)
            .await
    );
    assert_ok!(station.handle.set_output(PowerRole::Hv, true).await);

    let listing = tokio::spawn({
        let handle = station.handle.clone();
        async move { handle.list_ports(PowerRole::Lv).await }
    });
    station.lv.wait_for_list_ports().await;

    let trip = tokio::time::timeout(
        Duration::from_millis(300),
        station.handle.trip_interlock("leakage current above limit"),
    )
    .await;
    assert!(trip.is_ok(), "trip waited behind the LV port listing");
    assert!(!station.hv.any_output_on());

    // The hung listing gives up at the instrument timeout
    assert_eq!(listing.await.unwrap(), Ok(Vec::new()));
    let snapshot = station.handle.snapshot().await.unwrap();
    assert!(snapshot.interlock_tripped);
    assert_eq!(snapshot.hv.activation, Activation::Idle);
    station.stop().await;
}

#[tokio::test]
async fn test_trip_during_board_refresh_cuts_power_promptly() {
    let firmware = healthy_boards().with_check_delay(Duration::from_millis(400));
    let station = start_with(true, hv_supply(), lv_supply(), firmware).await;
    assert_ok!(
        station
            .handle
            .activate_power(PowerRole::Hv, "ModelX", HV_PORT)
            .await
    );
    assert_ok!(station.handle.set_output(PowerRole::Hv, true).await);

    let refresh = tokio::spawn({
        let handle = station.handle.clone();
        async move { handle.refresh_statuses().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Requests are answered while the checks run
    let snapshot = tokio::time::timeout(Duration::from_millis(200), station.handle.snapshot())
        .await
        .expect("snapshot waited behind the board refresh")
        .unwrap();
    assert_eq!(snapshot.board("FC7-B").unwrap().status, BoardStatus::Checking);

    station.handle.signal_trip("over temperature");
    let cut = tokio::time::timeout(Duration::from_millis(200), async {
        while station.hv.any_output_on() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(cut.is_ok(), "HV still on 200 ms after the trip");

    let statuses = refresh.await.unwrap().unwrap();
    assert_eq!(statuses["FC7-A"], BoardStatus::Ok);
    assert!(station.handle.snapshot().await.unwrap().interlock_tripped);
    station.stop().await;
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_abandoned_command_is_skipped() {
    let station = start_with_slow_hv(Duration::from_millis(300)).await;
    let port = station.hv.port(HV_PORT).unwrap();

    let activation = tokio::spawn({
        let handle = station.handle.clone();
        async move { handle.activate_power(PowerRole::Hv, "ModelX", HV_PORT).await }
    });
    port.wait_for_open().await;

    // Queued behind the slow activation, then abandoned by its caller
    let claim = tokio::time::timeout(Duration::from_millis(20), station.handle.claim("FC7-A")).await;
    assert!(claim.is_err());

    assert_ok!(activation.await.unwrap());
    let snapshot = station.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.claimed_board, None);
    assert_eq!(snapshot.hv.activation, Activation::Active);
    station.stop().await;
}

#[tokio::test]
async fn test_requests_after_shutdown_report_closed_session() {
    let station = start_station(true).await;
    let handle = station.handle.clone();
    station.stop().await;

    assert_eq!(handle.claim("FC7-A").await, Err(SessionError::SessionClosed));
    assert_eq!(
        handle.release_power(PowerRole::Hv).await,
        Err(SessionError::SessionClosed)
    );
}

// =============================================================================
// Sensor bridge
// =============================================================================

#[tokio::test]
async fn test_sensor_condition_trips_interlock() {
    let station = start_station(true).await;
    assert_ok!(station.handle.connect_defaults().await);
    assert_ok!(station.handle.set_output(PowerRole::Lv, true).await);

    let (signal, conditions) = sensor_channel(4);
    let bridge = spawn_sensor_bridge(station.handle.clone(), "humidity", conditions);

    signal.critical();
    signal.critical();
    drop(signal);
    bridge.await.unwrap();

    assert!(station.handle.is_interlock_tripped());
    assert!(!station.lv.any_output_on());
    let snapshot = station.handle.snapshot().await.unwrap();
    let reason = snapshot.interlock.unwrap().reason;
    assert!(reason.contains("humidity"), "unexpected reason: {reason}");
    assert_eq!(snapshot.lv.activation, Activation::Idle);
    station.stop().await;
}
