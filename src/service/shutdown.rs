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

use tokio::sync::broadcast;

/// Listens for the runtime's shutdown broadcast.  Once the signal has been
/// seen, every further `recv` returns immediately, so a task can poll it
/// from inside a select loop without re-arming anything.
#[derive(Debug)]
pub struct Shutdown {
    shutdown_seen: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown_seen: false,
            notify,
        }
    }

    pub async fn recv(&mut self) {
        if self.shutdown_seen {
            return;
        }
        // a closed channel counts: the runtime is gone
        let _ = self.notify.recv().await;
        self.shutdown_seen = true;
    }
}
