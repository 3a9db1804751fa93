// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Broker → hub feed
//
// Reads every user topic from the latest offset under its own consumer group,
// so the relay never replays history and never competes with persistence.
// Frames re-published from saved laps carry the replay header and are not
// streamed again.

use super::hub::RelayHub;
use crate::broker::{
    Broker, CommitPosition, ReceivedMessage, StartPosition, TopicNaming, HEADER_ENCODING,
    HEADER_REPLAY, HEADER_SESSION_ID, HEADER_USER_ID,
};
use crate::frame::{decode_frame, Encoding, Frame};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const POLL_BATCH: usize = 500;
const POLL_TIMEOUT: Duration = Duration::from_millis(50);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(3);

/// Identity and frame carried by one live broker message. Replayed lap
/// frames yield `None`.
pub fn decode_relay_message(
    naming: &TopicNaming,
    message: &ReceivedMessage,
) -> Option<(String, String, Frame)> {
    if is_replay(message) {
        return None;
    }
    let user_id = naming
        .user_from_topic(&message.topic)
        .or_else(|| message.header(HEADER_USER_ID))?
        .to_string();
    let session_id = message.header(HEADER_SESSION_ID)?.to_string();
    let encoding = match message.header(HEADER_ENCODING) {
        Some(value) => value.parse::<Encoding>().ok()?,
        None => Encoding::Protobuf,
    };
    let frame = decode_frame(&message.payload, encoding).ok()?;
    Some((user_id, session_id, frame))
}

fn is_replay(message: &ReceivedMessage) -> bool {
    message.header(HEADER_REPLAY).is_some()
}

pub struct RelayFeed {
    broker: Arc<dyn Broker>,
    naming: TopicNaming,
    hub: Arc<RelayHub>,
    group_id: String,
}

impl RelayFeed {
    pub fn new(
        broker: Arc<dyn Broker>,
        naming: TopicNaming,
        hub: Arc<RelayHub>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            naming,
            hub,
            group_id: group_id.into(),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let subscription = self
            .broker
            .subscribe(&self.naming.pattern(), &self.group_id, StartPosition::Latest)
            .await
            .context("Relay feed failed to subscribe")?;
        info!("Relay feed '{}' reading '{}'", self.group_id, self.naming.pattern());

        let mut undecodable: u64 = 0;
        let mut last_heartbeat = tokio::time::Instant::now();

        loop {
            let polled = tokio::select! {
                polled = subscription.poll(POLL_BATCH, POLL_TIMEOUT) => polled,
                _ = shutdown.changed() => break,
            };

            let messages = match polled {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Relay feed poll failed: {}", e);
                    tokio::time::sleep(POLL_TIMEOUT).await;
                    continue;
                }
            };

            let mut positions: BTreeMap<(String, u32), u64> = BTreeMap::new();
            for message in &messages {
                positions.insert((message.topic.clone(), message.partition), message.offset + 1);
                if is_replay(message) {
                    continue;
                }
                match decode_relay_message(&self.naming, message) {
                    Some((user_id, session_id, frame)) => {
                        self.hub.dispatch(&user_id, &session_id, frame);
                    }
                    None => {
                        undecodable += 1;
                        debug!(
                            "Relay skipped message {}/{}@{} ({} so far)",
                            message.topic, message.partition, message.offset, undecodable
                        );
                    }
                }
            }

            if !positions.is_empty() {
                let positions: Vec<CommitPosition> = positions
                    .into_iter()
                    .map(|((topic, partition), offset)| CommitPosition {
                        topic,
                        partition,
                        offset,
                    })
                    .collect();
                if let Err(e) = subscription.commit(&positions).await {
                    debug!("Relay commit failed: {}", e);
                }
            }

            if last_heartbeat.elapsed() >= HEARTBEAT_EVERY {
                if let Err(e) = subscription.heartbeat().await {
                    debug!("Relay heartbeat failed: {}", e);
                }
                last_heartbeat = tokio::time::Instant::now();
            }
        }

        info!("Relay feed stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Headers, MemoryBroker, OutboundMessage, TopicSpec};
    use crate::frame::encode_frame;
    use crate::relay::hub::HubEvent;
    use bytes::Bytes;

    fn replayed(session_id: &str, lap_time: i64) -> OutboundMessage {
        let mut message = outbound(session_id, lap_time, Encoding::Protobuf);
        message.headers.insert(HEADER_REPLAY.into(), "1".into());
        message
    }

    fn outbound(session_id: &str, lap_time: i64, encoding: Encoding) -> OutboundMessage {
        let frame = Frame {
            lap_number: 1,
            lap_time,
            ..Default::default()
        };
        let mut headers = Headers::new();
        headers.insert(HEADER_SESSION_ID.into(), session_id.into());
        headers.insert(HEADER_ENCODING.into(), encoding.as_str().into());
        OutboundMessage {
            key: session_id.into(),
            headers,
            payload: Bytes::from(encode_frame(&frame, encoding).unwrap()),
            timestamp_ms: lap_time,
        }
    }

    #[test]
    fn test_decode_both_encodings() {
        let naming = TopicNaming::default();
        for encoding in [Encoding::Protobuf, Encoding::Json] {
            let sent = outbound("s1", 42, encoding);
            let message = ReceivedMessage {
                topic: "telemetry-user-u7".into(),
                partition: 0,
                offset: 0,
                key: sent.key,
                headers: sent.headers,
                payload: sent.payload,
                timestamp_ms: 0,
            };
            let (user, session, frame) = decode_relay_message(&naming, &message).unwrap();
            assert_eq!(user, "u7");
            assert_eq!(session, "s1");
            assert_eq!(frame.lap_time, 42);
        }

        let sent = replayed("s1", 42);
        let message = ReceivedMessage {
            topic: "telemetry-user-u7".into(),
            partition: 0,
            offset: 1,
            key: sent.key,
            headers: sent.headers,
            payload: sent.payload,
            timestamp_ms: 0,
        };
        assert!(decode_relay_message(&naming, &message).is_none());
    }

    #[tokio::test]
    async fn test_feed_starts_at_latest_and_dispatches() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .create_topic(&TopicSpec {
                name: "telemetry-user-u1".into(),
                partitions: 1,
                retention: Duration::from_secs(60),
            })
            .await
            .unwrap();
        // Already in the log before the relay starts: never shown to viewers
        broker
            .send("telemetry-user-u1", &[outbound("s1", 1, Encoding::Protobuf)])
            .await
            .unwrap();

        let hub = Arc::new(RelayHub::new(16));
        let mut viewer = hub.attach("u1");
        let feed = RelayFeed::new(broker.clone(), TopicNaming::default(), hub.clone(), "relay");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { feed.run(shutdown_rx).await });

        // Let the subscription settle at the log end
        tokio::time::sleep(Duration::from_millis(100)).await;
        broker
            .send(
                "telemetry-user-u1",
                &[replayed("s1", 500), outbound("s1", 2, Encoding::Protobuf)],
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), viewer.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            HubEvent::Telemetry { frame, .. } => assert_eq!(frame.lap_time, 2),
            other => panic!("unexpected {:?}", other),
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
