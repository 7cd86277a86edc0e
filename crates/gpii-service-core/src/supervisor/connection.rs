//! Per-child connection driver.
//!
//! Owns one child's endpoint from spawn to exit: establish the connection,
//! pump frames both ways, answer pings, republish everything inbound on the
//! bus, and heartbeat at 1 Hz. The exit code is reported only after the
//! stream has drained, so buffered inbound frames are always dispatched
//! before the supervisor observes the termination.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::{EVENT_MESSAGE_PREFIX, EVENT_SEND};
use crate::bus::EventBus;
use crate::launcher::ChildHandle;
use crate::protocol::{Message, MessageCodec};
use crate::transport::Connection;

/// Heartbeat period while a child is connected.
pub(crate) const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Exit code reported when the real one could not be collected.
const UNKNOWN_EXIT: u32 = u32::MAX;

/// Drive `child` until it terminates; returns its exit code.
///
/// If the child dies before its connection is established the wait simply
/// resolves first and no connection is ever handed out.
pub(crate) async fn drive(child: ChildHandle, bus: EventBus) -> u32 {
    let ChildHandle {
        pid,
        endpoint,
        mut exited,
        ..
    } = child;

    let mut early_exit = None;
    tokio::select! {
        connection = endpoint.establish(pid) => match connection {
            Ok(connection) => {
                debug!(pid, "child connected");
                run_connection(connection, &bus).await;
            }
            Err(err) => warn!(pid, %err, "child connection failed"),
        },
        code = &mut exited => {
            warn!(pid, "child exited before connecting");
            early_exit = Some(code.unwrap_or(UNKNOWN_EXIT));
        }
    }

    match early_exit {
        Some(code) => code,
        None => exited.await.unwrap_or(UNKNOWN_EXIT),
    }
}

/// Pump one established connection until EOF or failure.
pub(crate) async fn run_connection(connection: Connection, bus: &EventBus) {
    let mut framed = Framed::new(connection, MessageCodec::new());
    let mut outbound = bus.subscribe();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_PERIOD,
        HEARTBEAT_PERIOD,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                None => {
                    debug!("peer closed the connection");
                    break;
                }
                Some(Err(err)) => {
                    warn!(%err, "connection failed");
                    break;
                }
                Some(Ok(message)) => {
                    if message.kind == Message::PING {
                        let pong = Message::new(Message::PONG, message.payload.clone());
                        if let Err(err) = framed.send(&pong).await {
                            warn!(%err, "pong failed");
                            break;
                        }
                    }
                    // Everything inbound is republished, including `error`
                    // (a transport no-op) and unknown types.
                    bus.publish(
                        format!("{EVENT_MESSAGE_PREFIX}.{}", message.kind),
                        message.payload,
                    );
                }
            },
            event = outbound.recv() => match event {
                Ok(event) if event.name == EVENT_SEND => {
                    match serde_json::from_value::<Message>(event.payload) {
                        Ok(message) => {
                            if let Err(err) = framed.send(&message).await {
                                warn!(%err, "outbound send failed");
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "unsendable outbound message"),
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "outbound queue lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
            },
            _ = heartbeat.tick() => {
                let hello = Message::new(Message::HELLO, Value::Null);
                if let Err(err) = framed.send(&hello).await {
                    warn!(%err, "heartbeat failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use serde_json::json;
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    fn codec_pair() -> (MessageCodec, BytesMut) {
        (MessageCodec::new(), BytesMut::new())
    }

    /// Drive `run_connection` against an in-memory peer.
    async fn with_connection<F, Fut>(bus: EventBus, peer: F)
    where
        F: FnOnce(tokio::io::DuplexStream) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let driver = tokio::spawn(async move {
            run_connection(Box::new(server), &bus).await;
        });
        peer(client).await;
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn ping_gets_a_pong_with_the_same_payload() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let bus = EventBus::new();
        with_connection(bus, |mut client| async move {
            let (mut codec, mut buf) = codec_pair();
            codec.encode(Message::new("ping", json!(42)), &mut buf).unwrap();
            client.write_all(&buf).await.unwrap();

            // Read frames until the pong shows up (a heartbeat may slip in
            // first).
            let mut incoming = BytesMut::new();
            let mut read = [0u8; 4096];
            let pong = loop {
                let n = client.read(&mut read).await.unwrap();
                incoming.extend_from_slice(&read[..n]);
                if let Some(msg) = codec.decode(&mut incoming).unwrap() {
                    if msg.kind == Message::PONG {
                        break msg;
                    }
                }
            };
            assert_eq!(pong.payload, json!(42));
            drop(client);
        })
        .await;
    }

    #[tokio::test]
    async fn inbound_messages_are_republished_with_their_type() {
        use tokio::io::AsyncWriteExt;

        let bus = EventBus::new();
        let mut events = bus.subscribe();
        with_connection(bus, |mut client| async move {
            let (mut codec, mut buf) = codec_pair();
            codec
                .encode(Message::new("hello", json!({"cwd": "C:\\work"})), &mut buf)
                .unwrap();
            codec
                .encode(Message::new("custom-metric", json!(7)), &mut buf)
                .unwrap();
            client.write_all(&buf).await.unwrap();
            drop(client);
        })
        .await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.name, "gpii.message.hello");
        assert_eq!(first.payload, json!({"cwd": "C:\\work"}));

        let second = events.recv().await.unwrap();
        assert_eq!(second.name, "gpii.message.custom-metric");
        assert_eq!(second.payload, json!(7));
    }

    #[tokio::test]
    async fn published_send_events_reach_the_peer() {
        use tokio::io::AsyncReadExt;

        let bus = EventBus::new();
        let sender = bus.clone();
        with_connection(bus, |mut client| async move {
            // Give the driver a moment to subscribe before publishing.
            tokio::task::yield_now().await;
            sender.publish(
                EVENT_SEND,
                serde_json::to_value(Message::new("settings", json!({"volume": 1}))).unwrap(),
            );

            let (mut codec, _) = codec_pair();
            let mut incoming = BytesMut::new();
            let mut read = [0u8; 4096];
            let msg = loop {
                let n = client.read(&mut read).await.unwrap();
                incoming.extend_from_slice(&read[..n]);
                if let Some(msg) = codec.decode(&mut incoming).unwrap() {
                    if msg.kind == "settings" {
                        break msg;
                    }
                }
            };
            assert_eq!(msg.payload, json!({"volume": 1}));
            drop(client);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_arrive_at_one_hertz() {
        use tokio::io::AsyncReadExt;

        let bus = EventBus::new();
        with_connection(bus, |mut client| async move {
            let (mut codec, _) = codec_pair();
            let mut incoming = BytesMut::new();
            let mut read = [0u8; 4096];
            let mut hellos = 0;
            while hellos < 3 {
                let n = client.read(&mut read).await.unwrap();
                incoming.extend_from_slice(&read[..n]);
                while let Some(msg) = codec.decode(&mut incoming).unwrap() {
                    if msg.kind == Message::HELLO {
                        hellos += 1;
                    }
                }
            }
            drop(client);
        })
        .await;
    }
}
