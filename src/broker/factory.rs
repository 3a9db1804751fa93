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

// Broker factory for creating broker backends from configuration

use super::backend::Broker;
use super::memory::MemoryBroker;
use super::zenoh_broker::ZenohBroker;
use crate::config::BrokerConfig;
use anyhow::{bail, Result};
use std::sync::Arc;

pub struct BrokerFactory;

impl BrokerFactory {
    /// Create a broker backend from configuration
    pub async fn create(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
        match config.backend.as_str() {
            "memory" => Ok(Arc::new(MemoryBroker::new())),

            "zenoh" => {
                let broker = ZenohBroker::connect(&config.zenoh).await?;
                Ok(Arc::new(broker))
            }

            unknown => bail!(
                "Unknown broker backend: '{}'. Supported: memory, zenoh",
                unknown
            ),
        }
    }

    /// Check that the backend can carry messages between pipeline roles
    /// running in separate processes. The memory broker lives in one
    /// process; zenoh keeps no log, so splitting it is an explicit opt-in.
    pub fn check_split_roles(config: &BrokerConfig) -> Result<()> {
        match config.backend.as_str() {
            "zenoh" if config.zenoh.allow_split_roles => Ok(()),
            "zenoh" => bail!(
                "The zenoh broker is not durable: frames sent while a role is down are lost. \
                 Set broker.zenoh.allow_split_roles to run roles separately"
            ),
            other => bail!(
                "Broker backend '{}' cannot connect separate processes; run with --role all",
                other
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_memory_broker() {
        let config = BrokerConfig {
            backend: "memory".to_string(),
            ..BrokerConfig::default()
        };
        let broker = BrokerFactory::create(&config).await.unwrap();
        assert_eq!(broker.broker_type(), "memory");
    }

    #[tokio::test]
    async fn test_create_unknown_broker() {
        let config = BrokerConfig {
            backend: "kafka".to_string(),
            ..BrokerConfig::default()
        };
        let result = BrokerFactory::create(&config).await;
        assert!(result.is_err());
        if let Err(e) = result {
            assert!(e.to_string().contains("Unknown broker backend"));
        }
    }

    #[test]
    fn test_split_roles_need_opt_in() {
        let mut config = BrokerConfig::default();
        config.backend = "memory".to_string();
        assert!(BrokerFactory::check_split_roles(&config).is_err());

        config.backend = "zenoh".to_string();
        let err = BrokerFactory::check_split_roles(&config).unwrap_err();
        assert!(err.to_string().contains("not durable"));

        config.zenoh.allow_split_roles = true;
        assert!(BrokerFactory::check_split_roles(&config).is_ok());
    }
}
