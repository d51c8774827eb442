use crate::decode::{decode_frame, SequenceTracker};
use crate::errors::{Error, Result};
use crate::metrics::{
    DECODED_FRAMES_TOTAL, DECODE_FAILURES_TOTAL, LOST_PACKETS_TOTAL, MESSAGES_TOTAL,
    UNRECOGNIZED_FRAMES_TOTAL,
};
use crate::model::{StreamingFrame, TelemetryEvent};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Decodes bus payloads and publishes them on the storage and UI channels.
#[derive(Debug)]
pub struct Dispatcher {
    db_tx: mpsc::UnboundedSender<StreamingFrame>,
    ui_tx: mpsc::UnboundedSender<TelemetryEvent>,
    sequences: SequenceTracker,
}

impl Dispatcher {
    pub fn new(
        db_tx: mpsc::UnboundedSender<StreamingFrame>,
        ui_tx: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        Self {
            db_tx,
            ui_tx,
            sequences: SequenceTracker::new(),
        }
    }

    /// Decodes one message. Streaming frames go to both channels, everything
    /// else to the UI channel only. Unrecognized frames are skipped.
    pub fn dispatch(&mut self, topic: &str, payload: &[u8], arrival: DateTime<Utc>) -> Result<()> {
        MESSAGES_TOTAL.inc();

        let event = match decode_frame(topic, payload, &mut self.sequences, arrival) {
            Ok(Some(event)) => event,
            Ok(None) => {
                UNRECOGNIZED_FRAMES_TOTAL.inc();
                debug!(
                    "Ignoring unrecognized frame on {} ({} bytes)",
                    topic,
                    payload.len()
                );
                return Ok(());
            }
            Err(e) => {
                DECODE_FAILURES_TOTAL.inc();
                return Err(Error::Decode(e));
            }
        };

        DECODED_FRAMES_TOTAL.with_label_values(&[event.kind()]).inc();

        match event {
            TelemetryEvent::Streaming(frame) => {
                LOST_PACKETS_TOTAL.inc_by(f64::from(frame.lost_packets));
                // a closed branch must not starve the other one
                let stored = self.db_tx.send(frame.clone()).is_ok();
                let relayed = self.ui_tx.send(TelemetryEvent::Streaming(frame)).is_ok();
                if !stored || !relayed {
                    return Err(Error::ChannelSend);
                }
            }
            other => {
                self.ui_tx.send(other).map_err(|_| Error::ChannelSend)?;
            }
        }
        Ok(())
    }
}

/// Bus connection owner. Runs until `shutdown` fires; broker faults are
/// retried forever after a fixed delay.
pub async fn run_mqtt(
    settings: MqttSettings,
    mut dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        settings.broker, settings.port, settings.client_id
    );

    let mut mqtt_options = MqttOptions::new(
        settings.client_id.clone(),
        settings.broker.clone(),
        settings.port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
    let mut state = ConnectionState::Connecting;

    loop {
        let notification = tokio::select! {
            notification = eventloop.poll() => notification,
            _ = shutdown.cancelled() => {
                if state == ConnectionState::Connecting {
                    info!("Shutdown requested while connecting");
                } else {
                    info!("Shutdown requested, disconnecting from broker");
                }
                let _ = client.try_disconnect();
                break;
            }
        };

        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                state = transition(state, ConnectionState::Connected);
                debug!("ConnAck: {:?}", ack.code);

                subscribe(&client, &settings.topic);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                match dispatcher.dispatch(&publish.topic, &publish.payload, Utc::now()) {
                    Ok(()) => {}
                    Err(Error::Decode(e)) => {
                        warn!("Dropping frame from {}: {}", publish.topic, e);
                    }
                    Err(e) => {
                        error!("Failed to publish decoded frame: {}", e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                state = transition(state, ConnectionState::Disconnected);
                warn!(
                    "MQTT connection error: {}. Reconnecting in {:?}...",
                    e, settings.reconnect_delay
                );

                tokio::select! {
                    _ = tokio::time::sleep(settings.reconnect_delay) => {}
                    _ = shutdown.cancelled() => {
                        info!("Shutdown requested while waiting to reconnect");
                        break;
                    }
                }
                state = transition(state, ConnectionState::Connecting);
            }
        }
    }

    info!("MQTT listener stopped");
    Ok(())
}

/// Queues the subscription. A failure is logged and retried on the next ConnAck.
fn subscribe(client: &AsyncClient, topic: &str) -> bool {
    match client.try_subscribe(topic, QoS::AtMostOnce) {
        Ok(()) => {
            info!("Subscribed to {}", topic);
            true
        }
        Err(e) => {
            error!("Failed to subscribe to {}: {}", topic, e);
            false
        }
    }
}

fn transition(from: ConnectionState, to: ConnectionState) -> ConnectionState {
    if from != to {
        info!("MQTT connection {:?} -> {:?}", from, to);
    }
    to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::fixtures::{self, HeartbeatFields, TOPIC};
    use crate::decode::DecodeError;

    fn dispatcher() -> (
        Dispatcher,
        mpsc::UnboundedReceiver<StreamingFrame>,
        mpsc::UnboundedReceiver<TelemetryEvent>,
    ) {
        let (db_tx, db_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        (Dispatcher::new(db_tx, ui_tx), db_rx, ui_rx)
    }

    #[test]
    fn test_streaming_goes_to_both_paths() {
        tokio_test::block_on(async {
            let (mut dispatcher, mut db_rx, mut ui_rx) = dispatcher();
            let payload = fixtures::streaming(1, 200, &[(1.0, 2.0, 3.0)]);

            assert!(dispatcher.dispatch(TOPIC, &payload, Utc::now()).is_ok());

            let stored = db_rx.recv().await.unwrap();
            assert_eq!(stored.sensor, "AA:BB");
            match ui_rx.recv().await.unwrap() {
                TelemetryEvent::Streaming(frame) => assert_eq!(frame, stored),
                other => panic!("unexpected {:?}", other),
            }
        });
    }

    #[test]
    fn test_heartbeat_and_profile_go_to_ui_only() {
        let (mut dispatcher, mut db_rx, mut ui_rx) = dispatcher();

        let heartbeat = fixtures::heartbeat(&HeartbeatFields::default());
        let profile = fixtures::daq_profile(0x03, 0b0000_0100, 1000, 500);
        dispatcher.dispatch(TOPIC, &heartbeat, Utc::now()).unwrap();
        dispatcher.dispatch(TOPIC, &profile, Utc::now()).unwrap();

        assert!(matches!(ui_rx.try_recv(), Ok(TelemetryEvent::Heartbeat(_))));
        assert!(matches!(ui_rx.try_recv(), Ok(TelemetryEvent::DaqProfile(_))));
        assert!(db_rx.try_recv().is_err());
    }

    #[test]
    fn test_unrecognized_frame_publishes_nothing() {
        let (mut dispatcher, mut db_rx, mut ui_rx) = dispatcher();

        assert!(dispatcher.dispatch(TOPIC, &[0x09, 0x09, 0x09], Utc::now()).is_ok());
        assert!(dispatcher.dispatch("no-slash", &[0x01, 0x03], Utc::now()).is_ok());
        assert!(db_rx.try_recv().is_err());
        assert!(ui_rx.try_recv().is_err());
    }

    #[test]
    fn test_protocol_violation_is_reported_not_published() {
        let (mut dispatcher, _db_rx, mut ui_rx) = dispatcher();
        let payload = fixtures::daq_profile(0x03, 0b0000_1100, 0, 0);

        let result = dispatcher.dispatch(TOPIC, &payload, Utc::now());
        assert!(matches!(
            result,
            Err(Error::Decode(DecodeError::InvalidStreamingType(_)))
        ));
        assert!(ui_rx.try_recv().is_err());

        // the next good frame still flows
        let heartbeat = fixtures::heartbeat(&HeartbeatFields::default());
        dispatcher.dispatch(TOPIC, &heartbeat, Utc::now()).unwrap();
        assert!(ui_rx.try_recv().is_ok());
    }

    #[test]
    fn test_closed_channel_is_an_error() {
        let (mut dispatcher, db_rx, _ui_rx) = dispatcher();
        drop(db_rx);
        let payload = fixtures::streaming(1, 200, &[(0.0, 0.0, 0.0)]);

        assert!(matches!(
            dispatcher.dispatch(TOPIC, &payload, Utc::now()),
            Err(Error::ChannelSend)
        ));
    }

    #[test]
    fn test_closed_storage_channel_does_not_starve_ui() {
        let (mut dispatcher, db_rx, mut ui_rx) = dispatcher();
        drop(db_rx);

        for seq in 1..=2 {
            let payload = fixtures::streaming(seq, 200, &[(1.0, 2.0, 3.0)]);
            assert!(dispatcher.dispatch(TOPIC, &payload, Utc::now()).is_err());
        }

        for _ in 0..2 {
            assert!(matches!(ui_rx.try_recv(), Ok(TelemetryEvent::Streaming(_))));
        }
    }

    #[test]
    fn test_closed_ui_channel_does_not_starve_storage() {
        let (mut dispatcher, mut db_rx, ui_rx) = dispatcher();
        drop(ui_rx);
        let payload = fixtures::streaming(1, 200, &[(1.0, 2.0, 3.0)]);

        assert!(dispatcher.dispatch(TOPIC, &payload, Utc::now()).is_err());
        assert_eq!(db_rx.try_recv().unwrap().sensor, "AA:BB");
    }

    #[test]
    fn test_sequence_state_survives_between_messages() {
        let (mut dispatcher, mut db_rx, _ui_rx) = dispatcher();

        for seq in [1, 2, 5] {
            let payload = fixtures::streaming(seq, 200, &[(0.0, 0.0, 0.0)]);
            dispatcher.dispatch(TOPIC, &payload, Utc::now()).unwrap();
        }

        let lost: Vec<u32> = (0..3).map(|_| db_rx.try_recv().unwrap().lost_packets).collect();
        assert_eq!(lost, vec![0, 0, 2]);
    }

    #[test]
    fn test_subscribe_with_full_queue_does_not_fail_listener() {
        let options = MqttOptions::new("test-subscriber", "127.0.0.1", 1);
        // nobody polls the event loop, so the single request slot stays taken
        let (client, _eventloop) = AsyncClient::new(options, 1);

        assert!(subscribe(&client, "+/#"));
        assert!(!subscribe(&client, "+/#"));
    }

    #[test]
    fn test_transition() {
        assert_eq!(
            transition(ConnectionState::Connecting, ConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            transition(ConnectionState::Disconnected, ConnectionState::Disconnected),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_shutdown_while_broker_unreachable() {
        let (dispatcher, _db_rx, _ui_rx) = dispatcher();
        let shutdown = CancellationToken::new();
        let settings = MqttSettings {
            broker: "127.0.0.1".to_string(),
            port: 1,
            client_id: "test-listener".to_string(),
            topic: "+/#".to_string(),
            reconnect_delay: Duration::from_secs(5),
        };

        let handle = tokio::spawn(run_mqtt(settings, dispatcher, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
