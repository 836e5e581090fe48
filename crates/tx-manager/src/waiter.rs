// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug)]
struct Inner<K> {
    next_id: u64,
    waiting: HashMap<K, Vec<(u64, oneshot::Sender<()>)>>,
}

/// Lets tasks wait, with a deadline, for an event identified by a key.
///
/// Every registration resolves exactly once: either [`Self::fire`]
/// reaches it or its deadline passes, never both. Registrations are
/// dropped on every exit path, so an abandoned wait leaves nothing behind.
#[derive(Debug, Clone)]
pub struct ConfirmationWaiter<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Default for ConfirmationWaiter<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                waiting: HashMap::new(),
            })),
        }
    }
}

impl<K> ConfirmationWaiter<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates a waiter with nobody waiting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `key`. Fires that happen after this call are
    /// delivered to the returned registration.
    pub fn register(&self, key: K) -> Registration<K> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.waiting.entry(key.clone()).or_default().push((id, tx));
        Registration {
            key,
            id,
            rx: Some(rx),
            waiter: self.clone(),
        }
    }

    /// Resolves every registration for `key`.
    ///
    /// Returns `true` if at least one still waiting task was reached.
    pub fn fire(&self, key: &K) -> bool {
        let Some(waiting) = self.inner.lock().waiting.remove(key) else {
            return false;
        };
        waiting
            .into_iter()
            .fold(false, |reached, (_, tx)| tx.send(()).is_ok() || reached)
    }

    /// Number of keys someone is waiting on.
    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Whether nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deregister(&self, key: &K, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(waiting) = inner.waiting.get_mut(key) {
            waiting.retain(|(other, _)| *other != id);
            if waiting.is_empty() {
                inner.waiting.remove(key);
            }
        }
    }
}

/// A pending wait created by [`ConfirmationWaiter::register`].
#[derive(Debug)]
pub struct Registration<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    id: u64,
    rx: Option<oneshot::Receiver<()>>,
    waiter: ConfirmationWaiter<K>,
}

impl<K> Registration<K>
where
    K: Eq + Hash + Clone,
{
    /// Waits for the fire. Returns `false` if `timeout` passed first.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        let Some(rx) = self.rx.take() else {
            return false;
        };
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }
}

impl<K> Drop for Registration<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.waiter.deregister(&self.key, self.id);
    }
}
