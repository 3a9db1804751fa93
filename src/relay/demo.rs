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

// Viewer-triggered demo playback
//
// A demo runs the generator into an ordinary producer, so its frames reach
// viewers through the relay feed and persistence through the consumer like
// any live session.

use super::hub::RelayHub;
use crate::broker::{Broker, TopicProvisioner};
use crate::config::{DemoSourceConfig, ProducerSettings};
use crate::producer::TelemetryProducer;
use crate::protocol::{DemoComplete, DemoRequest, SessionSource};
use crate::session::{SessionCloser, SessionError, SessionManager};
use crate::source::{run_collector, DemoGenerator};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("session '{0}' is not a demo session")]
    NotDemo(String),
    #[error("session '{0}' belongs to another user")]
    WrongUser(String),
    #[error("a demo is already running for session '{0}'")]
    AlreadyRunning(String),
    #[error("session '{0}' is closed")]
    SessionClosed(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("demo producer failed: {0}")]
    Producer(String),
}

/// Control surface the relay exposes to viewers
#[async_trait]
pub trait DemoController: Send + Sync {
    async fn start_demo(&self, user_id: &str, request: DemoRequest) -> Result<(), DemoError>;

    /// Stop the named demo, or every demo of the user when `session_id` is
    /// `None`. Returns how many were stopped.
    async fn stop_demo(&self, user_id: &str, session_id: Option<&str>) -> usize;

    fn running(&self) -> usize;
}

struct RunningDemo {
    user_id: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct DemoRunner {
    broker: Arc<dyn Broker>,
    provisioner: Arc<TopicProvisioner>,
    manager: Arc<SessionManager>,
    hub: Arc<RelayHub>,
    producer_settings: ProducerSettings,
    defaults: DemoSourceConfig,
    running: Arc<DashMap<String, RunningDemo>>,
}

impl DemoRunner {
    pub fn new(
        broker: Arc<dyn Broker>,
        provisioner: Arc<TopicProvisioner>,
        manager: Arc<SessionManager>,
        hub: Arc<RelayHub>,
        producer_settings: ProducerSettings,
        defaults: DemoSourceConfig,
    ) -> Self {
        Self {
            broker,
            provisioner,
            manager,
            hub,
            producer_settings,
            defaults,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.running.contains_key(session_id)
    }

    async fn stop_one(&self, session_id: &str) -> bool {
        let Some((_, demo)) = self.running.remove(session_id) else {
            return false;
        };
        let _ = demo.stop_tx.send(true);
        if let Err(e) = demo.task.await {
            error!("Demo task for session '{}' panicked: {}", session_id, e);
        }
        info!("Demo for session '{}' stopped", session_id);
        true
    }
}

#[async_trait]
impl DemoController for DemoRunner {
    async fn start_demo(&self, user_id: &str, request: DemoRequest) -> Result<(), DemoError> {
        let session_id = request.session_id.clone();
        if self.running.contains_key(&session_id) {
            return Err(DemoError::AlreadyRunning(session_id));
        }

        let session = self
            .manager
            .create(
                Some(session_id.clone()),
                user_id,
                SessionSource::Demo,
                vec!["demo".to_string()],
            )
            .await?;
        if session.source != SessionSource::Demo {
            return Err(DemoError::NotDemo(session_id));
        }
        if session.user_id != user_id {
            return Err(DemoError::WrongUser(session_id));
        }
        if session.status.is_terminal() {
            return Err(DemoError::SessionClosed(session_id));
        }
        self.manager.start(&session_id).await?;

        let producer = TelemetryProducer::start(
            self.broker.clone(),
            &self.provisioner,
            user_id,
            &session_id,
            SessionSource::Demo,
            &self.producer_settings,
        )
        .await
        .map_err(|e| DemoError::Producer(e.to_string()))?;

        let mut plan = self.defaults.clone();
        if let Some(laps) = request.laps {
            plan.laps = laps.max(1);
        }
        plan.looping = request.looping;
        let generator = DemoGenerator::new(&plan, chrono::Utc::now().timestamp_millis());

        let (stop_tx, stop_rx) = watch::channel(false);
        let hub = self.hub.clone();
        let running = self.running.clone();
        let user = user_id.to_string();
        let session = session_id.clone();
        let task = tokio::spawn(async move {
            let result = run_collector(Box::new(generator), producer.clone(), stop_rx.clone()).await;
            producer.close().await;
            match result {
                // Only a run that reached its lap count counts as complete
                Ok(_) if !*stop_rx.borrow() => {
                    hub.demo_complete(
                        &user,
                        DemoComplete {
                            session_id: session.clone(),
                            laps: plan.laps,
                        },
                    );
                    info!("Demo for session '{}' completed {} laps", session, plan.laps);
                }
                Ok(_) => {}
                Err(e) => error!("Demo for session '{}' failed: {:#}", session, e),
            }
            running.remove(&session);
        });

        self.running.insert(
            session_id.clone(),
            RunningDemo {
                user_id: user_id.to_string(),
                stop_tx,
                task,
            },
        );
        info!("Demo started for user '{}' session '{}'", user_id, session_id);
        Ok(())
    }

    async fn stop_demo(&self, user_id: &str, session_id: Option<&str>) -> usize {
        let targets: Vec<String> = self
            .running
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .filter(|entry| session_id.map_or(true, |id| entry.key() == id))
            .map(|entry| entry.key().clone())
            .collect();

        let mut stopped = 0;
        for session_id in targets {
            if self.stop_one(&session_id).await {
                stopped += 1;
            }
        }
        stopped
    }

    fn running(&self) -> usize {
        self.running.len()
    }
}

#[async_trait]
impl SessionCloser for DemoRunner {
    async fn close_session(&self, session_id: &str) {
        self.stop_one(session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::TopicSettings;
    use crate::relay::hub::HubEvent;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn runner(frame_rate_hz: u32) -> (DemoRunner, Arc<RelayHub>, Arc<SessionManager>) {
        let broker = Arc::new(MemoryBroker::new());
        let provisioner = Arc::new(TopicProvisioner::new(broker.clone(), &TopicSettings::default()));
        let manager = Arc::new(SessionManager::new(Arc::new(MemoryStore::new())));
        let hub = Arc::new(RelayHub::new(64));
        let runner = DemoRunner::new(
            broker,
            provisioner,
            manager.clone(),
            hub.clone(),
            ProducerSettings::default(),
            DemoSourceConfig {
                frame_rate_hz,
                laps: 1,
                looping: true,
                seed: 3,
            },
        );
        (runner, hub, manager)
    }

    fn request(session_id: &str) -> DemoRequest {
        DemoRequest {
            session_id: session_id.to_string(),
            laps: None,
            looping: true,
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (runner, _hub, manager) = runner(50);
        runner.start_demo("u1", request("d1")).await.unwrap();
        assert!(runner.is_running("d1"));
        assert!(matches!(
            runner.start_demo("u1", request("d1")).await,
            Err(DemoError::AlreadyRunning(_))
        ));
        assert!(manager.get("d1").await.unwrap().started);

        // Another user's stop does not touch it
        assert_eq!(runner.stop_demo("u2", None).await, 0);
        assert_eq!(runner.stop_demo("u1", Some("d1")).await, 1);
        assert_eq!(runner.running(), 0);
    }

    #[tokio::test]
    async fn test_live_session_is_refused() {
        let (runner, _hub, manager) = runner(50);
        manager
            .create(Some("live-1".into()), "u1", SessionSource::Live, vec![])
            .await
            .unwrap();
        assert!(matches!(
            runner.start_demo("u1", request("live-1")).await,
            Err(DemoError::NotDemo(_))
        ));
    }

    #[tokio::test]
    async fn test_archive_stops_demo() {
        let (runner, _hub, manager) = runner(50);
        let runner = Arc::new(runner);
        manager.register_closer(runner.clone());
        runner.start_demo("u1", request("d2")).await.unwrap();
        manager.archive("d2").await.unwrap();
        assert!(!runner.is_running("d2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_demo_reports_completion() {
        let (runner, hub, _manager) = runner(10);
        let mut viewer = hub.attach("u1");
        runner
            .start_demo(
                "u1",
                DemoRequest {
                    session_id: "d3".into(),
                    laps: Some(1),
                    looping: false,
                },
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(600), viewer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            HubEvent::DemoComplete(DemoComplete {
                session_id: "d3".into(),
                laps: 1
            })
        );
    }
}
