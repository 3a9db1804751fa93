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

// Storage module
//
// Trait-based abstraction over the session/lap/frame store, so the
// persistence consumer can write to different storage systems. The crate
// ships the in-memory backend; database backends implement the same trait.

pub mod backend;
pub mod memory;

pub use backend::TelemetryStore;
pub use memory::MemoryStore;
