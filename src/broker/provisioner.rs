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

use super::backend::{Broker, BrokerError, TopicSpec};
use super::TopicNaming;
use crate::config::TopicSettings;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Makes sure a user's topic exists before the first publish.
///
/// Safe to call concurrently and repeatedly: a topic that already exists
/// counts as provisioned.
pub struct TopicProvisioner {
    broker: Arc<dyn Broker>,
    naming: TopicNaming,
    partitions: u32,
    retention: Duration,
    provisioned: DashSet<String>,
}

impl TopicProvisioner {
    pub fn new(broker: Arc<dyn Broker>, settings: &TopicSettings) -> Self {
        Self {
            broker,
            naming: TopicNaming::new(settings.prefix.clone()),
            partitions: settings.partitions,
            retention: Duration::from_secs(settings.retention_seconds),
            provisioned: DashSet::new(),
        }
    }

    pub fn naming(&self) -> &TopicNaming {
        &self.naming
    }

    /// Ensure the user's topic exists and return its name
    pub async fn ensure_user_topic(&self, user_id: &str) -> Result<String, BrokerError> {
        let topic = self.naming.topic_for_user(user_id);
        if self.provisioned.contains(&topic) {
            return Ok(topic);
        }

        let spec = TopicSpec {
            name: topic.clone(),
            partitions: self.partitions,
            retention: self.retention,
        };

        match self.broker.create_topic(&spec).await {
            Ok(()) => info!("Provisioned topic '{}' for user '{}'", topic, user_id),
            Err(BrokerError::TopicAlreadyExists(_)) => {
                debug!("Topic '{}' already exists", topic)
            }
            Err(e) => return Err(e),
        }

        self.provisioned.insert(topic.clone());
        Ok(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn test_concurrent_provisioning() {
        let broker = MemoryBroker::new();
        let provisioner = Arc::new(TopicProvisioner::new(
            Arc::new(broker.clone()),
            &TopicSettings::default(),
        ));

        let mut handles = vec![];
        for _ in 0..8 {
            let provisioner = provisioner.clone();
            handles.push(tokio::spawn(async move {
                provisioner.ensure_user_topic("alice").await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "telemetry-user-alice");
        }

        assert_eq!(broker.topic_names(), vec!["telemetry-user-alice".to_string()]);
        let spec = broker.topic_spec("telemetry-user-alice").unwrap();
        assert_eq!(spec.partitions, 10);
        assert_eq!(spec.retention, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_existing_topic_is_success() {
        let broker = MemoryBroker::new();
        let settings = TopicSettings::default();
        let first = TopicProvisioner::new(Arc::new(broker.clone()), &settings);
        let second = TopicProvisioner::new(Arc::new(broker.clone()), &settings);
        first.ensure_user_topic("bob").await.unwrap();
        second.ensure_user_topic("bob").await.unwrap();
    }
}
