// Copyright 2025 the portico authors
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

use std::sync::Arc;

use dashmap::DashMap;

/// Table of live sessions for one port's handler, indexed two ways: by the
/// opaque session ID a client presents to reattach, and by the id of the TCP
/// connection currently carrying each session.
pub struct SessionRegistry<S> {
    by_session_id: DashMap<String, Arc<S>>,
    by_connection: DashMap<u64, Arc<S>>,
}

impl<S> SessionRegistry<S> {
    pub fn new() -> SessionRegistry<S> {
        SessionRegistry {
            by_session_id: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    pub fn add(&self, session_id: &str, session: Arc<S>) {
        self.by_session_id.insert(session_id.to_string(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<S>> {
        self.by_session_id.get(session_id).map(|s| s.value().clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.by_session_id.remove(session_id);
    }

    pub fn bind_connection(&self, connection_id: u64, session: Arc<S>) {
        self.by_connection.insert(connection_id, session);
    }

    pub fn unbind_connection(&self, connection_id: u64) -> Option<Arc<S>> {
        self.by_connection.remove(&connection_id).map(|(_, s)| s)
    }

    pub fn by_connection(&self, connection_id: u64) -> Option<Arc<S>> {
        self.by_connection
            .get(&connection_id)
            .map(|s| s.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.by_session_id.len()
    }
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
