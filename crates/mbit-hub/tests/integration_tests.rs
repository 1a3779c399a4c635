//! Integration tests for the simulator hub
//!
//! These tests drive sessions end to end through [`SessionManager`] and
//! [`DeviceClient`] over in-memory duplex streams:
//! - Radio broadcast between sessions, bucket isolation and queue overflow
//! - Device lifecycle (sleep, panic, reset) as seen by a client
//! - Protocol error handling that keeps the session alive
//! - Session teardown and physical input injection
//! - Observer state snapshots and gesture history

use std::sync::Arc;

use mbit_hub::{
    CloseReason, DeviceClient, HubConfig, InputEvent, SessionManager, SimEvent, TimeMode,
};
use mbit_protocol::{
    encode, Button, DeviceSnapshot, Envelope, ErrorCode, Event, Gesture, Grid, LifecycleKind,
    MessageBody, RadioSettings, Request, Response,
};
use mbit_sim::RadioDomain;
use tokio::io::DuplexStream;

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;
    use std::time::Duration;
    use tokio::sync::broadcast;

    pub const WAIT: Duration = Duration::from_secs(2);

    pub fn hub_with(config: HubConfig) -> SessionManager {
        let domain = Arc::new(RadioDomain::new(config.radio.clone()));
        SessionManager::new(config, domain)
    }

    pub fn hub() -> SessionManager {
        hub_with(HubConfig::default())
    }

    /// Open a session and complete the handshake
    pub async fn connect(hub: &SessionManager) -> DeviceClient<DuplexStream> {
        let (client_side, server_side) = tokio::io::duplex(16 * 1024);
        hub.accept(server_side, None).unwrap();
        tokio::time::timeout(WAIT, DeviceClient::connect(client_side))
            .await
            .expect("handshake timed out")
            .unwrap()
    }

    pub fn on_channel(channel: u8) -> RadioSettings {
        RadioSettings {
            channel,
            ..RadioSettings::default()
        }
    }

    /// Wait for the first observer event matching `pred`
    pub async fn wait_for<F>(rx: &mut broadcast::Receiver<SimEvent>, pred: F) -> SimEvent
    where
        F: Fn(&SimEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not observed")
    }

    /// Next observer snapshot
    pub async fn next_state(rx: &mut broadcast::Receiver<SimEvent>) -> DeviceSnapshot {
        match wait_for(rx, |e| matches!(e, SimEvent::StateChanged { .. })).await {
            SimEvent::StateChanged { snapshot, .. } => snapshot,
            other => panic!("unexpected event {:?}", other),
        }
    }
}

use helpers::*;

// ============================================================================
// Radio
// ============================================================================

mod radio_tests {
    use super::*;

    #[tokio::test]
    async fn test_packet_reaches_same_bucket_only() {
        let hub = hub();
        let mut sender = connect(&hub).await;
        let mut listener = connect(&hub).await;
        let mut elsewhere = connect(&hub).await;

        sender.radio_config(on_channel(7)).await.unwrap();
        listener.radio_config(on_channel(7)).await.unwrap();
        elsewhere.radio_config(on_channel(8)).await.unwrap();

        sender.radio_send(b"hi".to_vec()).await.unwrap();

        let packet = listener.radio_receive().await.unwrap().unwrap();
        assert_eq!(packet.payload, b"hi");
        assert_eq!(listener.radio_receive().await.unwrap(), None);
        assert_eq!(elsewhere.radio_receive().await.unwrap(), None);
        assert_eq!(sender.radio_receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_listener_is_told_about_arrivals() {
        let hub = hub();
        let mut sender = connect(&hub).await;
        let mut listener = connect(&hub).await;
        sender.radio_config(on_channel(7)).await.unwrap();
        listener.radio_config(on_channel(7)).await.unwrap();

        sender.radio_send(b"ping".to_vec()).await.unwrap();

        let event = tokio::time::timeout(WAIT, listener.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Event::RadioPacketArrived {
                from: sender.device_id(),
                length: 4,
            }
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let hub = hub();
        let mut sender = connect(&hub).await;
        let mut listener = connect(&hub).await;
        let settings = RadioSettings {
            queue: 3,
            ..on_channel(7)
        };
        sender.radio_config(settings).await.unwrap();
        listener.radio_config(settings).await.unwrap();

        for n in 0u8..5 {
            sender.radio_send(vec![n]).await.unwrap();
        }

        let mut received = Vec::new();
        while let Some(packet) = listener.radio_receive().await.unwrap() {
            received.push(packet.payload);
        }
        assert_eq!(received, vec![vec![2], vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn test_moving_buckets_loses_queued_packets() {
        let hub = hub();
        let mut sender = connect(&hub).await;
        let mut listener = connect(&hub).await;
        sender.radio_config(on_channel(7)).await.unwrap();
        listener.radio_config(on_channel(7)).await.unwrap();

        sender.radio_send(b"stale".to_vec()).await.unwrap();
        listener.radio_config(on_channel(8)).await.unwrap();
        listener.radio_config(on_channel(7)).await.unwrap();
        assert_eq!(listener.radio_receive().await.unwrap(), None);

        sender.radio_send(b"fresh".to_vec()).await.unwrap();
        let packet = listener.radio_receive().await.unwrap().unwrap();
        assert_eq!(packet.payload, b"fresh");
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let hub = hub();
        let mut client = connect(&hub).await;
        let settings = RadioSettings {
            length: 4,
            ..on_channel(7)
        };
        client.radio_config(settings).await.unwrap();

        let err = client.radio_send(b"too long".to_vec()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Validation));
    }

    #[tokio::test]
    async fn test_traffic_is_observable() {
        let hub = hub();
        let mut events = hub.subscribe();
        let mut sender = connect(&hub).await;
        let mut listener = connect(&hub).await;
        sender.radio_config(on_channel(3)).await.unwrap();
        listener.radio_config(on_channel(3)).await.unwrap();

        sender.radio_send(b"abc".to_vec()).await.unwrap();

        let traffic = wait_for(&mut events, |e| matches!(e, SimEvent::RadioTraffic { .. })).await;
        match traffic {
            SimEvent::RadioTraffic {
                from,
                key,
                length,
                delivered,
                dropped,
            } => {
                assert_eq!(from, sender.device_id());
                assert_eq!(key.channel, 3);
                assert_eq!(length, 3);
                assert_eq!(delivered, 1);
                assert_eq!(dropped, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_advances_only_own_clock() {
        let hub = hub();
        let mut sleeper = connect(&hub).await;
        let mut bystander = connect(&hub).await;

        sleeper.sleep(100).await.unwrap();

        assert_eq!(sleeper.running_time().await.unwrap(), 100_000);
        assert_eq!(bystander.running_time().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_packet_timestamp_uses_sender_clock() {
        let hub = hub();
        let mut sender = connect(&hub).await;
        let mut listener = connect(&hub).await;
        sender.radio_config(on_channel(7)).await.unwrap();
        listener.radio_config(on_channel(7)).await.unwrap();

        sender.sleep(25).await.unwrap();
        sender.radio_send(b"t".to_vec()).await.unwrap();

        let packet = listener.radio_receive().await.unwrap().unwrap();
        assert_eq!(packet.timestamp_micros, 25_000);
    }

    #[tokio::test]
    async fn test_panic_then_reset() {
        let hub = hub();
        let mut client = connect(&hub).await;
        client.sleep(50).await.unwrap();
        client.set_pixel(2, 2, 9).await.unwrap();
        client.set_temperature(30).await.unwrap();

        client.panic(42).await.unwrap();
        let err = client.temperature().await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidState));
        let err = client.get_pixel(2, 2).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidState));

        client.reset().await.unwrap();
        assert_eq!(client.get_pixel(2, 2).await.unwrap(), 0);
        assert_eq!(client.temperature().await.unwrap(), 20);
        assert_eq!(client.running_time().await.unwrap(), 0);

        let lifecycles: Vec<LifecycleKind> = client
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                Event::StateChanged(snapshot) => Some(snapshot.lifecycle),
                _ => None,
            })
            .collect();
        assert_eq!(lifecycles.first(), Some(&LifecycleKind::Panicked));
        assert_eq!(lifecycles.last(), Some(&LifecycleKind::Running));
    }

    #[tokio::test]
    async fn test_panicked_device_leaves_no_radio_traffic() {
        let hub = hub();
        let mut sender = connect(&hub).await;
        let mut listener = connect(&hub).await;
        sender.radio_config(on_channel(7)).await.unwrap();
        listener.radio_config(on_channel(7)).await.unwrap();

        sender.panic(1).await.unwrap();
        let err = sender.radio_send(b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidState));
        assert_eq!(listener.radio_receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_real_time_sleep_completes() {
        let hub = hub_with(HubConfig {
            time_mode: TimeMode::RealTime { tick_millis: 2 },
            ..HubConfig::default()
        });
        let mut client = connect(&hub).await;

        tokio::time::timeout(WAIT, client.sleep(10))
            .await
            .expect("sleep never woke")
            .unwrap();
        assert!(client.running_time().await.unwrap() >= 10_000);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_real_time_sleep_does_not_stall_other_devices() {
        let hub = hub_with(HubConfig {
            time_mode: TimeMode::RealTime { tick_millis: 2 },
            ..HubConfig::default()
        });
        let mut sleeper = connect(&hub).await;
        let mut sender = connect(&hub).await;
        let mut listener = connect(&hub).await;
        sender.radio_config(on_channel(7)).await.unwrap();
        listener.radio_config(on_channel(7)).await.unwrap();

        let sleeping = tokio::spawn(async move { sleeper.sleep(300).await });

        sender.radio_send(b"hi".to_vec()).await.unwrap();
        let packet = listener.radio_receive().await.unwrap().unwrap();
        assert_eq!(packet.payload, b"hi".to_vec());
        assert!(!sleeping.is_finished());

        tokio::time::timeout(WAIT, sleeping)
            .await
            .expect("sleep never woke")
            .unwrap()
            .unwrap();

        hub.shutdown().await;
    }
}

// ============================================================================
// Protocol errors
// ============================================================================

mod protocol_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_sequence_is_rejected() {
        let hub = hub();
        let mut client = connect(&hub).await;

        let first = client.call_with_seq(5, Request::RunningTime).await.unwrap();
        assert_eq!(first, Response::Micros { value: 0 });

        let replay = client.call_with_seq(5, Request::RunningTime).await.unwrap();
        assert_eq!(replay.error_code(), Some(ErrorCode::Protocol));

        let older = client.call_with_seq(3, Request::RunningTime).await.unwrap();
        assert_eq!(older.error_code(), Some(ErrorCode::Protocol));

        // The counter moved past 5, so ordinary calls keep working
        assert_eq!(client.running_time().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_decode_error_keeps_session() {
        let hub = hub();
        let mut events = hub.subscribe();
        let mut client = connect(&hub).await;

        let mut bad = encode(&Envelope::request(client.device_id(), 1, Request::Reset)).unwrap();
        bad[0] = 0x09;
        client.send_raw(&bad).await.unwrap();

        let reply = client.next_envelope().await.unwrap();
        assert_eq!(reply.seq, 0);
        match reply.body {
            MessageBody::Response(response) => {
                assert_eq!(response.error_code(), Some(ErrorCode::Decode))
            }
            other => panic!("expected error response, got {:?}", other),
        }
        wait_for(&mut events, |e| matches!(e, SimEvent::DecodeFailure { .. })).await;

        client.set_pixel(1, 1, 5).await.unwrap();
        assert_eq!(client.get_pixel(1, 1).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_out_of_range_values_are_validation_errors() {
        let hub = hub();
        let mut client = connect(&hub).await;

        let err = client.set_pixel(5, 0, 1).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Validation));
        let err = client.set_pixel(0, 0, 10).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Validation));
        let err = client.radio_config(on_channel(84)).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Validation));
        let err = client.accelerometer_range(3).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Validation));
    }
}

// ============================================================================
// Sessions
// ============================================================================

mod session_tests {
    use super::*;

    #[tokio::test]
    async fn test_devices_get_distinct_ids() {
        let hub = hub();
        let a = connect(&hub).await;
        let b = connect(&hub).await;
        assert_ne!(a.device_id(), b.device_id());
        assert_eq!(hub.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_removes_radio_membership() {
        let hub = hub();
        let mut events = hub.subscribe();
        let mut client = connect(&hub).await;
        client.radio_config(on_channel(7)).await.unwrap();
        let device = client.device_id();
        assert!(hub.domain().bucket_of(device).is_some());

        drop(client);

        let closed = wait_for(&mut events, |e| matches!(e, SimEvent::SessionClosed { .. })).await;
        match closed {
            SimEvent::SessionClosed {
                device: closed_device,
                reason,
                stats,
                ..
            } => {
                assert_eq!(closed_device, device);
                assert_eq!(reason, CloseReason::CleanDisconnect);
                assert_eq!(stats.requests, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(hub.domain().bucket_of(device).is_none());
        assert!(hub.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_injected_button_press() {
        let hub = hub();
        let mut client = connect(&hub).await;

        hub.inject_input(client.device_id(), InputEvent::ButtonPress(Button::A))
            .await
            .unwrap();
        let event = tokio::time::timeout(WAIT, client.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, Event::ButtonPressed { button: Button::A });

        let reading = client.button_read(Button::A).await.unwrap();
        assert!(reading.pressed);
        assert!(reading.was_pressed);
        assert_eq!(reading.presses, 1);

        let reading = client.button_read(Button::A).await.unwrap();
        assert!(reading.pressed);
        assert!(!reading.was_pressed);
        assert_eq!(reading.presses, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_session() {
        let hub = hub();
        let mut a = connect(&hub).await;
        let _b = connect(&hub).await;

        hub.shutdown().await;

        assert!(hub.sessions().is_empty());
        assert!(hub.is_shut_down());
        assert!(a.running_time().await.is_err());
    }
}

// ============================================================================
// Observers
// ============================================================================

mod observer_tests {
    use super::*;

    #[tokio::test]
    async fn test_every_mutating_request_is_observed() {
        let hub = hub();
        let mut events = hub.subscribe();
        let mut client = connect(&hub).await;

        client.radio_config(on_channel(12)).await.unwrap();
        let snapshot = match wait_for(&mut events, |e| {
            matches!(e, SimEvent::StateChanged { snapshot, .. } if snapshot.radio.channel == 12)
        })
        .await
        {
            SimEvent::StateChanged { snapshot, .. } => snapshot,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(snapshot.radio_on);

        client.accelerometer_range(8).await.unwrap();
        let snapshot = next_state(&mut events).await;
        assert_eq!(snapshot.accelerometer_range, 8);
        assert_eq!(snapshot.radio.channel, 12);

        client.radio_off().await.unwrap();
        assert!(!next_state(&mut events).await.radio_on);

        client.button_read(Button::A).await.unwrap();
        let snapshot = next_state(&mut events).await;
        assert!(!snapshot.radio_on);
        assert_eq!(snapshot.accelerometer_range, 8);

        // A pure read in between publishes nothing
        client.temperature().await.unwrap();
        client.set_temperature(25).await.unwrap();
        assert_eq!(next_state(&mut events).await.temperature, 25);
    }

    #[tokio::test]
    async fn test_gesture_history_through_hub() {
        let hub = hub();
        let mut events = hub.subscribe();
        let mut client = connect(&hub).await;
        let device = client.device_id();

        hub.inject_input(device, InputEvent::Gesture(Gesture::Shake))
            .await
            .unwrap();
        hub.inject_input(device, InputEvent::Gesture(Gesture::Up))
            .await
            .unwrap();
        wait_for(&mut events, |e| {
            matches!(e, SimEvent::StateChanged { snapshot, .. } if snapshot.gesture == Gesture::Up)
        })
        .await;

        assert!(client.is_gesture(Gesture::Up).await.unwrap());
        assert!(client.was_gesture(Gesture::Shake).await.unwrap());
        assert!(!client.was_gesture(Gesture::FaceDown).await.unwrap());
        assert_eq!(
            client.gestures().await.unwrap(),
            vec![Gesture::Shake, Gesture::Up]
        );
        assert!(client.gestures().await.unwrap().is_empty());
        assert!(!client.was_gesture(Gesture::Shake).await.unwrap());

        hub.inject_input(device, InputEvent::Gesture(Gesture::Shake))
            .await
            .unwrap();
        wait_for(&mut events, |e| {
            matches!(e, SimEvent::StateChanged { snapshot, .. } if snapshot.gesture == Gesture::Shake)
        })
        .await;
        client.reset().await.unwrap();
        assert!(client.gestures().await.unwrap().is_empty());
    }
}

// ============================================================================
// Property Tests
// ============================================================================

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn pixel_write() -> impl Strategy<Value = (u8, u8, u8)> {
        (0u8..5, 0u8..5, 0u8..=9)
    }

    fn display_grid() -> impl Strategy<Value = Grid> {
        prop::collection::vec(0u8..=9, 25)
            .prop_filter_map("5x5 grid", |cells| Grid::from_cells(5, 5, cells))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// The display holds the last value written to each pixel
        #[test]
        fn prop_display_last_write_wins(writes in prop::collection::vec(pixel_write(), 0..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (expected, actual) = runtime.block_on(async {
                let hub = hub();
                let mut client = connect(&hub).await;

                let mut expected = [[0u8; 5]; 5];
                for &(x, y, value) in &writes {
                    client.set_pixel(x, y, value).await.unwrap();
                    expected[y as usize][x as usize] = value;
                }

                let mut actual = [[0u8; 5]; 5];
                for y in 0..5u8 {
                    for x in 0..5u8 {
                        actual[y as usize][x as usize] = client.get_pixel(x, y).await.unwrap();
                    }
                }
                (expected, actual)
            });
            prop_assert_eq!(expected, actual);
        }

        /// A full display write replaces the whole buffer
        #[test]
        fn prop_display_write_replaces_buffer(grids in prop::collection::vec(display_grid(), 1..8)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (expected, actual) = runtime.block_on(async {
                let hub = hub();
                let mut client = connect(&hub).await;
                let mut events = hub.subscribe();

                for grid in &grids {
                    client.display_write(grid.clone()).await.unwrap();
                }

                let mut pixels = Vec::with_capacity(25);
                for y in 0..5u8 {
                    for x in 0..5u8 {
                        pixels.push(client.get_pixel(x, y).await.unwrap());
                    }
                }
                let last = grids.last().unwrap().clone();
                let observed = loop {
                    let snapshot = next_state(&mut events).await;
                    if snapshot.display == last {
                        break snapshot.display;
                    }
                };
                assert_eq!(observed.cells(), pixels.as_slice());
                (last.cells().to_vec(), pixels)
            });
            prop_assert_eq!(expected, actual);
        }
    }
}
