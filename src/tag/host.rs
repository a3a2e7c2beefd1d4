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

//! Per-tag operations handed to the dispatcher.

use crate::error::{Error, Result};
use crate::nci::Technology;
use crate::tag::adapter::NciTagAdapter;
use crate::tag::ndef::{NdefInfo, NdefMessage, NdefMode};
use crate::tag::record::{TagRecord, TechExtras};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

/// Consumer of classified tags.
pub trait TagDispatcher: Send + Sync {
    /// A tag was activated and classified.
    fn on_tag_discovered(&self, tag: Arc<TagHost>);
    /// The tag with this handle left the field.
    fn on_tag_lost(&self, handle: u8);
}

/// Dispatcher notifications, for channel based consumers.
#[derive(Debug)]
pub enum DispatchEvent {
    /// A tag was activated and classified.
    Discovered(Arc<TagHost>),
    /// The tag with this handle left the field.
    Lost(u8),
}

impl TagDispatcher for mpsc::UnboundedSender<DispatchEvent> {
    fn on_tag_discovered(&self, tag: Arc<TagHost>) {
        if self.send(DispatchEvent::Discovered(tag)).is_err() {
            warn!("dispatcher gone, tag dropped");
        }
    }

    fn on_tag_lost(&self, handle: u8) {
        if self.send(DispatchEvent::Lost(handle)).is_err() {
            warn!("dispatcher gone, loss of tag {} dropped", handle);
        }
    }
}

/// Background presence checking of one tag.
#[derive(Default)]
struct Watchdog {
    running: AtomicBool,
    paused: AtomicUsize,
    lost: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Pauses the watchdog while held.
struct PauseGuard<'a>(&'a Watchdog);

impl Watchdog {
    fn pause(&self) -> PauseGuard<'_> {
        self.paused.fetch_add(1, Ordering::SeqCst);
        PauseGuard(self)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst) > 0
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.0.paused.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct NdefState {
    info: Option<NdefInfo>,
    message: Option<Bytes>,
}

/// Operations on one classified tag.
pub struct TagHost {
    record: TagRecord,
    adapter: Arc<NciTagAdapter>,
    dispatcher: Arc<dyn TagDispatcher>,
    op_lock: tokio::sync::Mutex<()>,
    connected: Mutex<Option<Technology>>,
    ndef: Mutex<NdefState>,
    watchdog: Watchdog,
}

impl fmt::Debug for TagHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagHost")
            .field("handle", &self.record.handle())
            .field("uid", &hex::encode_upper(self.record.uid()))
            .field("technologies", &self.record.technologies())
            .field("connected", &*self.connected.lock())
            .finish()
    }
}

impl TagHost {
    /// Wrap a tag record.
    pub fn new(
        record: TagRecord,
        adapter: Arc<NciTagAdapter>,
        dispatcher: Arc<dyn TagDispatcher>,
    ) -> Arc<TagHost> {
        Arc::new(TagHost {
            record,
            adapter,
            dispatcher,
            op_lock: tokio::sync::Mutex::new(()),
            connected: Mutex::new(None),
            ndef: Mutex::new(NdefState::default()),
            watchdog: Watchdog::default(),
        })
    }

    /// Tag record.
    pub fn record(&self) -> &TagRecord {
        &self.record
    }

    /// Tag identifier.
    pub fn uid(&self) -> &[u8] {
        self.record.uid()
    }

    /// Discovery identifier of the primary facet.
    pub fn handle(&self) -> u8 {
        self.record.handle()
    }

    /// Technologies of the tag, followed by NDEF or NDEF-formatable
    /// once detection found them.
    pub fn technologies(&self) -> Vec<Technology> {
        let mut technologies = self.record.technologies();
        match self.ndef.lock().info {
            Some(info) if info.capable => technologies.push(Technology::Ndef),
            Some(info) if info.formatable => technologies.push(Technology::NdefFormatable),
            _ => (),
        }
        technologies
    }

    /// Technology selected by the last connect.
    pub fn connected_technology(&self) -> Option<Technology> {
        *self.connected.lock()
    }

    /// Metadata of `technology`.
    pub fn tech_extras(&self, technology: Technology) -> Option<TechExtras> {
        match technology {
            Technology::Ndef => {
                let ndef = self.ndef.lock();
                let info = ndef.info.filter(|info| info.capable)?;
                Some(TechExtras::Ndef {
                    max_size: info.max_size,
                    mode: info.mode,
                    message: ndef.message.as_ref().map(|m| m.to_vec()).unwrap_or_default(),
                })
            }
            Technology::NdefFormatable => Some(TechExtras::None),
            _ => self.record.index_of(technology).and_then(|index| self.record.extras(index)),
        }
    }

    /// Facet serving `technology`. NDEF goes through the NDEF facet.
    fn facet_index(&self, technology: Technology) -> Result<usize> {
        match technology {
            Technology::Ndef | Technology::NdefFormatable => Ok(self.record.ndef_facet_index()),
            _ => self.record.index_of(technology).ok_or(Error::InvalidTechnology),
        }
    }

    /// Select `technology` on the tag.
    pub async fn connect(&self, technology: Technology) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let _pause = self.watchdog.pause();
        let index = self.facet_index(technology)?;
        self.adapter.connect(&self.record, index).await?;
        *self.connected.lock() = Some(technology);
        Ok(())
    }

    /// Tear down the RF link. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.stop_presence_check();
        self.connected.lock().take();
        self.adapter.disconnect(self.handle()).await
    }

    /// Recreate the RF link of the connected technology. A no-op when
    /// nothing is connected.
    pub async fn reconnect(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let _pause = self.watchdog.pause();
        let Some(technology) = self.connected_technology() else {
            return Ok(());
        };
        self.adapter.reconnect_facet(&self.record, self.facet_index(technology)?).await
    }

    /// Send a raw command and return the response.
    pub async fn transceive(&self, data: &[u8]) -> Result<Bytes> {
        let _op = self.op_lock.lock().await;
        let _pause = self.watchdog.pause();
        let technology = self.connected_technology().ok_or(Error::NotConnected)?;
        self.adapter.connect(&self.record, self.facet_index(technology)?).await?;
        self.adapter.transceive(data).await
    }

    async fn connect_ndef(&self) -> Result<()> {
        self.adapter.connect(&self.record, self.record.ndef_facet_index()).await
    }

    /// Current size and access mode of the NDEF message.
    pub async fn detect_ndef_info(&self) -> Result<(u32, NdefMode)> {
        let _op = self.op_lock.lock().await;
        let _pause = self.watchdog.pause();
        self.connect_ndef().await?;
        let info = self.adapter.check_ndef().await?;
        self.ndef.lock().info = Some(info);
        if !info.capable {
            return Err(Error::NotNdefCapable);
        }
        Ok((info.current_size, info.mode))
    }

    /// Read the NDEF message.
    pub async fn read_ndef(&self) -> Result<NdefMessage> {
        let _op = self.op_lock.lock().await;
        let _pause = self.watchdog.pause();
        self.connect_ndef().await?;
        let message = self.adapter.read_ndef().await?;
        self.ndef.lock().message = Some(message.0.clone());
        Ok(message)
    }

    /// Write an NDEF message.
    pub async fn write_ndef(&self, message: &[u8]) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let _pause = self.watchdog.pause();
        self.connect_ndef().await?;
        let result = self.adapter.write_ndef(message).await;
        self.ndef.lock().info = None;
        result
    }

    /// Format the tag for NDEF.
    pub async fn format_ndef(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let _pause = self.watchdog.pause();
        self.connect_ndef().await?;
        let result = self.adapter.format_ndef().await;
        self.ndef.lock().info = None;
        result
    }

    /// Make the NDEF message read-only.
    pub async fn make_read_only(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let _pause = self.watchdog.pause();
        self.connect_ndef().await?;
        let result = self.adapter.make_read_only().await;
        self.ndef.lock().info = None;
        result
    }

    /// Detect and read the NDEF message for dispatching. Returns `None`
    /// for a tag that is not NDEF capable.
    pub async fn find_and_read_ndef(&self) -> Result<Option<NdefMessage>> {
        let _op = self.op_lock.lock().await;
        let _pause = self.watchdog.pause();
        self.connect_ndef().await?;
        let info = self.adapter.check_ndef().await?;
        self.ndef.lock().info = Some(info);
        if !info.capable {
            debug!("tag {} is not NDEF capable", self.handle());
            return Ok(None);
        }
        let message = self.adapter.read_ndef().await?;
        self.ndef.lock().message = Some(message.0.clone());
        Ok(Some(message))
    }

    /// Check that the tag is still in the field.
    pub async fn is_present(&self) -> bool {
        let _op = self.op_lock.lock().await;
        self.adapter.presence_check(self.handle()).await
    }

    /// Start the background presence check. The dispatcher is told
    /// once when the tag is lost.
    pub fn start_presence_check(self: &Arc<Self>) {
        if self.watchdog.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let interval = self.adapter.config().presence_check_interval;
        let host: Weak<TagHost> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                time::sleep(interval).await;
                let Some(host) = host.upgrade() else { break };
                if !host.watchdog.running.load(Ordering::SeqCst) {
                    break;
                }
                if host.watchdog.is_paused() {
                    continue;
                }
                if !host.adapter.presence_check(host.handle()).await {
                    host.tag_lost().await;
                    break;
                }
            }
        });
        *self.watchdog.task.lock() = Some(task);
    }

    /// Stop the background presence check.
    pub fn stop_presence_check(&self) {
        if self.watchdog.running.swap(false, Ordering::SeqCst) {
            debug!("presence check of tag {} stopped", self.handle());
        }
    }

    async fn tag_lost(&self) {
        if !self.watchdog.running.swap(false, Ordering::SeqCst)
            || self.watchdog.lost.swap(true, Ordering::SeqCst)
        {
            return;
        }
        info!("tag {} lost", self.handle());
        self.connected.lock().take();
        self.dispatcher.on_tag_lost(self.handle());
        if let Err(err) = self.adapter.disconnect(self.handle()).await {
            warn!("disconnect of lost tag {} failed: {}", self.handle(), err);
        }
    }
}

impl Drop for TagHost {
    fn drop(&mut self) {
        if let Some(task) = self.watchdog.task.lock().take() {
            task.abort();
        }
    }
}
