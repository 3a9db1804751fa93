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

// Broker module
//
// Provides a trait-based abstraction over the partitioned message broker
// that carries telemetry from producers to the persistence consumer and
// the live relay.
//
// Topics are per user (`telemetry-user-<userId>`); the partition is chosen
// from the session id so that one session's frames are never reordered.

pub mod backend;
pub mod factory;
pub mod memory;
pub mod provisioner;
pub mod zenoh_broker;

pub use backend::{
    Broker, BrokerError, CommitPosition, Headers, OutboundMessage, ReceivedMessage, StartPosition,
    Subscription, TopicSpec,
};
pub use factory::BrokerFactory;
pub use memory::MemoryBroker;
pub use provisioner::TopicProvisioner;
pub use zenoh_broker::ZenohBroker;

pub const HEADER_SESSION_ID: &str = "sessionId";
pub const HEADER_USER_ID: &str = "userId";
pub const HEADER_ENCODING: &str = "encoding";
pub const HEADER_SOURCE: &str = "source";
/// Set on frames re-published from a saved lap rather than produced live
pub const HEADER_REPLAY: &str = "replay";

/// Maps user ids to topic names and back
#[derive(Debug, Clone, PartialEq)]
pub struct TopicNaming {
    prefix: String,
}

impl Default for TopicNaming {
    fn default() -> Self {
        Self::new("telemetry-user-")
    }
}

impl TopicNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn topic_for_user(&self, user_id: &str) -> String {
        format!("{}{}", self.prefix, user_id)
    }

    pub fn user_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())
            .filter(|user| !user.is_empty())
    }

    /// Glob pattern matching every user topic
    pub fn pattern(&self) -> String {
        format!("{}*", self.prefix)
    }
}

/// Stable partition for a message key (FNV-1a, identical across processes)
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % partitions as u64) as u32
}

/// Convert a `*` glob into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<regex::Regex, BrokerError> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    regex::Regex::new(&format!("^{}$", escaped))
        .map_err(|e| BrokerError::InvalidPattern(format!("{}: {}", pattern, e)))
}
