// Copyright 2023, The Android Open Source Project
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

//! Wait/notify primitive bridging the HAL event task and the callers
//! blocked on a command completion.
//!
//! A caller acquires the event with [`SyncEvent::begin`], which serializes
//! operations of the same category and arms the completion slot *before*
//! the HAL command is issued. The event task delivers completions with
//! [`SyncEvent::notify`]; completions arriving while nothing is armed are
//! dropped.

use crate::error::{Error, Result};
use log::{trace, warn};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time;

/// Completion event for one category of asynchronous operation.
pub struct SyncEvent<T> {
    name: &'static str,
    lock: Mutex<()>,
    slot: parking_lot::Mutex<Option<mpsc::UnboundedSender<T>>>,
}

/// An armed completion slot. Holding it keeps other operations of the
/// same category out; dropping it disarms the slot.
pub struct Pending<'a, T> {
    event: &'a SyncEvent<T>,
    rx: mpsc::UnboundedReceiver<T>,
    _guard: MutexGuard<'a, ()>,
}

impl<T> SyncEvent<T> {
    /// Create a disarmed event.
    pub fn new(name: &'static str) -> Self {
        SyncEvent { name, lock: Mutex::new(()), slot: parking_lot::Mutex::new(None) }
    }

    /// Name used in log messages.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the event and arm the completion slot.
    pub async fn begin(&self) -> Pending<'_, T> {
        let guard = self.lock.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.slot.lock() = Some(tx);
        Pending { event: self, rx, _guard: guard }
    }

    /// Deliver a completion. Returns false if nothing was waiting.
    pub fn notify(&self, value: T) -> bool {
        match self.slot.lock().as_ref() {
            Some(tx) => tx.send(value).is_ok(),
            None => {
                trace!("{}: completion dropped, no waiter", self.name);
                false
            }
        }
    }

    /// Release the current waiter, if any, with [`Error::Aborted`].
    pub fn abort(&self) {
        if self.slot.lock().take().is_some() {
            warn!("{}: aborting pending wait", self.name);
        }
    }

    /// Return true while a caller holds an armed slot.
    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T> Pending<'_, T> {
    /// Wait for the next completion. Completions delivered while the
    /// caller was not yet waiting are returned in arrival order.
    pub async fn wait(&mut self, timeout: Duration) -> Result<T> {
        match time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(Error::Aborted),
            Err(_) => {
                warn!("{}: no completion after {:?}", self.event.name, timeout);
                Err(Error::Timeout)
            }
        }
    }
}

impl<T> Drop for Pending<'_, T> {
    fn drop(&mut self) {
        self.event.slot.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completion_reaches_armed_waiter() {
        let event = SyncEvent::new("test");
        let mut pending = event.begin().await;
        assert!(event.notify(7u8));
        assert_eq!(pending.wait(Duration::from_millis(10)).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_without_waiter_is_dropped() {
        let event = SyncEvent::new("test");
        assert!(!event.notify(1u8));
        let mut pending = event.begin().await;
        assert_eq!(pending.wait(Duration::from_millis(10)).await, Err(Error::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn completions_are_queued_in_order() {
        let event = SyncEvent::new("test");
        let mut pending = event.begin().await;
        event.notify(1u8);
        event.notify(2u8);
        assert_eq!(pending.wait(Duration::from_millis(10)).await, Ok(1));
        assert_eq!(pending.wait(Duration::from_millis(10)).await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_releases_waiter() {
        let event = SyncEvent::<u8>::new("test");
        let mut pending = event.begin().await;
        event.abort();
        assert_eq!(pending.wait(Duration::from_secs(5)).await, Err(Error::Aborted));
        assert!(!event.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_bounded() {
        let event = SyncEvent::<u8>::new("test");
        let mut pending = event.begin().await;
        let start = time::Instant::now();
        assert_eq!(pending.wait(Duration::from_millis(250)).await, Err(Error::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(260));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_pending_disarms() {
        let event = SyncEvent::<u8>::new("test");
        {
            let _pending = event.begin().await;
            assert!(event.is_armed());
        }
        assert!(!event.is_armed());
    }
}
