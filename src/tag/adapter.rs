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

//! NCI tag adapter.
//!
//! Protocol state machine of the tag currently in the field. The
//! controller adapter feeds HAL events through the `on_*` handlers,
//! which run on the HAL event task and never block. The async
//! operations issue one HAL command, then wait on the completion event
//! of their category.
//!
//! Connect, reconnect, disconnect, transceive and the NDEF operations
//! are serialized by one connection lock, held across interface
//! reselects.

use crate::config::TagConfig;
use crate::error::{Error, Result};
use crate::hal::{
    resolve_mifare, ActivationNtf, DiscoverNtf, MifareExtension, NdefDetectResult, NfcHal,
};
use crate::nci::{
    DeactivationReason, DeactivationType, NciVersion, Protocol, RfInterface, Status, TechMode,
    Technology,
};
use crate::sync::SyncEvent;
use crate::tag::activation::{is_multi_protocol_sak, Endpoint, TechParams};
use crate::tag::ndef::{NdefInfo, NdefMessage, NdefMode, EMPTY_NDEF};
use crate::tag::record::{TagFacet, TagRecord};
use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

/// NFC-A halt command (HLTA), sent before leaving the frame interface.
const HLTA: [u8; 2] = [0x50, 0x00];

/// Activity of the selected tag.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TagActivity {
    /// No tag is activated.
    #[default]
    Idle,
    /// The tag is activated on an RF interface.
    Active,
    /// The tag was deactivated to sleep and can be selected again.
    Sleep,
}

/// Origin of the deactivation the adapter is waiting for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Cause {
    Reselect,
    Disconnect,
}

/// Outcome of one activation wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Activation {
    Activated,
    /// The controller woke the waiter without activating the target.
    NotYet,
    Rejected(Status),
}

/// Connection state of the selected tag facet.
#[derive(Clone, Debug, Default)]
struct ConnectionState {
    activity: TagActivity,
    /// Handle of the tag record owning the link.
    session: Option<u8>,
    discovery_id: u8,
    protocol: Option<Protocol>,
    interface: Option<RfInterface>,
    tech_mode: Option<TechMode>,
    /// Technology selected by the last connect.
    technology: Option<Technology>,
    reselecting: bool,
    pending: Option<Cause>,
    /// A wait timed out; the next connect reselects the interface.
    needs_reconnect: bool,
}

/// Per-technology timeouts of the blocking tag operations.
///
/// Seeded from the configuration; ISO-DEP uses at least the frame
/// waiting time announced by the card. Runtime overrides take
/// precedence until reset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutTable {
    defaults: HashMap<Technology, Duration>,
    overrides: HashMap<Technology, Duration>,
    fallback: Duration,
    frame_wait_time: Option<Duration>,
}

impl TimeoutTable {
    /// Build a table from seed values. Technologies without a seed use
    /// `fallback`.
    pub fn new(seed: &[(Technology, Duration)], fallback: Duration) -> Self {
        TimeoutTable {
            defaults: seed.iter().copied().collect(),
            overrides: HashMap::new(),
            fallback,
            frame_wait_time: None,
        }
    }

    /// Timeout of `technology`.
    pub fn get(&self, technology: Technology) -> Duration {
        if let Some(timeout) = self.overrides.get(&technology) {
            return *timeout;
        }
        let timeout = self.defaults.get(&technology).copied().unwrap_or(self.fallback);
        match (technology, self.frame_wait_time) {
            (Technology::IsoDep, Some(fwt)) => timeout.max(fwt),
            _ => timeout,
        }
    }

    /// Override the timeout of `technology`.
    pub fn set(&mut self, technology: Technology, timeout: Duration) {
        self.overrides.insert(technology, timeout);
    }

    /// Drop every override.
    pub fn reset(&mut self) {
        self.overrides.clear();
    }

    /// Frame waiting time of the activated ISO-DEP card.
    pub fn set_frame_wait_time(&mut self, frame_wait_time: Option<Duration>) {
        self.frame_wait_time = frame_wait_time;
    }
}

/// Candidate collected during a multi-tag discovery round.
#[derive(Clone, Debug)]
struct Candidate {
    discovery_id: u8,
    protocol: Protocol,
    uid: Vec<u8>,
    sak: Option<u8>,
    /// Facets of same-card discoveries folded into this candidate.
    merged: Vec<TagFacet>,
}

#[derive(Debug, Default)]
struct MultiTagRound {
    candidates: Vec<Candidate>,
    next: usize,
    complete: bool,
}

impl MultiTagRound {
    fn is_open(&self) -> bool {
        !self.candidates.is_empty()
    }

    fn has_next(&self) -> bool {
        self.candidates.iter().skip(self.next).any(|c| c.protocol != Protocol::NfcDep)
    }

    /// Next selectable candidate. Peer-to-peer candidates are skipped.
    fn take_next(&mut self) -> Option<Candidate> {
        while let Some(candidate) = self.candidates.get(self.next) {
            self.next += 1;
            if candidate.protocol != Protocol::NfcDep {
                return Some(candidate.clone());
            }
            debug!("skipping NFC-DEP candidate {}", candidate.discovery_id);
        }
        None
    }

    /// Same-UID ISO-DEP / Mifare discovery of the same card.
    fn twin_of(&self, uid: &[u8], sak: Option<u8>, protocol: Protocol) -> Option<usize> {
        if !sak.map_or(false, is_multi_protocol_sak) {
            return None;
        }
        self.candidates.iter().position(|c| {
            c.uid == uid
                && c.sak == sak
                && matches!(
                    (c.protocol, protocol),
                    (Protocol::IsoDep, Protocol::Mifare) | (Protocol::Mifare, Protocol::IsoDep)
                )
        })
    }
}

/// Protocol state machine of the tag in the field.
pub struct NciTagAdapter {
    hal: Arc<dyn NfcHal>,
    mifare: Option<Arc<dyn MifareExtension>>,
    config: TagConfig,
    nci_version: Mutex<NciVersion>,
    conn_lock: tokio::sync::Mutex<()>,
    state: Mutex<ConnectionState>,
    round: Mutex<MultiTagRound>,
    timeouts: Mutex<TimeoutTable>,
    ndef_cache: Mutex<Option<NdefInfo>>,
    rx_buffer: Mutex<BytesMut>,
    activation: SyncEvent<Activation>,
    deactivation: SyncEvent<DeactivationType>,
    transceive: SyncEvent<std::result::Result<Bytes, Status>>,
    ndef_detect: SyncEvent<NdefDetectResult>,
    ndef_read: SyncEvent<(Status, Bytes)>,
    ndef_write: SyncEvent<Status>,
    ndef_format: SyncEvent<Status>,
    read_only: SyncEvent<Status>,
    presence: SyncEvent<Status>,
}

impl NciTagAdapter {
    /// Create the adapter. The Mifare extension is resolved once.
    pub fn new(hal: Arc<dyn NfcHal>, config: TagConfig) -> Self {
        let mifare = resolve_mifare(hal.as_ref());
        let timeouts = TimeoutTable::new(&config.timeouts, config.op_timeout);
        NciTagAdapter {
            hal,
            mifare,
            config,
            nci_version: Mutex::new(NciVersion::Version20),
            conn_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(ConnectionState::default()),
            round: Mutex::new(MultiTagRound::default()),
            timeouts: Mutex::new(timeouts),
            ndef_cache: Mutex::new(None),
            rx_buffer: Mutex::new(BytesMut::new()),
            activation: SyncEvent::new("activation"),
            deactivation: SyncEvent::new("deactivation"),
            transceive: SyncEvent::new("transceive"),
            ndef_detect: SyncEvent::new("ndef-detect"),
            ndef_read: SyncEvent::new("ndef-read"),
            ndef_write: SyncEvent::new("ndef-write"),
            ndef_format: SyncEvent::new("ndef-format"),
            read_only: SyncEvent::new("read-only"),
            presence: SyncEvent::new("presence-check"),
        }
    }

    /// Tag configuration.
    pub fn config(&self) -> &TagConfig {
        &self.config
    }

    /// Record the NCI version reported by the controller.
    pub fn set_nci_version(&self, version: NciVersion) {
        *self.nci_version.lock() = version;
    }

    /// Activity of the selected tag.
    pub fn activity(&self) -> TagActivity {
        self.state.lock().activity
    }

    /// Handle of the tag owning the link.
    pub fn session(&self) -> Option<u8> {
        self.state.lock().session
    }

    /// Technology selected by the last connect.
    pub fn connected_technology(&self) -> Option<Technology> {
        self.state.lock().technology
    }

    /// True while a multi-tag round holds candidates.
    pub fn round_open(&self) -> bool {
        self.round.lock().is_open()
    }

    /// Number of candidates not yet selected in the current round.
    pub fn pending_candidates(&self) -> usize {
        let round = self.round.lock();
        round.candidates.len().saturating_sub(round.next)
    }

    /// Timeout of `technology`.
    pub fn timeout(&self, technology: Technology) -> Duration {
        self.timeouts.lock().get(technology)
    }

    /// Override the timeout of `technology`.
    pub fn set_timeout(&self, technology: Technology, timeout: Duration) {
        self.timeouts.lock().set(technology, timeout);
    }

    /// Restore the configured timeouts.
    pub fn reset_timeouts(&self) {
        self.timeouts.lock().reset();
    }

    /// Release every pending caller with [`Error::Aborted`].
    pub fn abort_all_waits(&self) {
        self.activation.abort();
        self.deactivation.abort();
        self.transceive.abort();
        self.ndef_detect.abort();
        self.ndef_read.abort();
        self.ndef_write.abort();
        self.ndef_format.abort();
        self.read_only.abort();
        self.presence.abort();
    }

    /// Forget the selected tag and the discovery round.
    pub fn reset(&self) {
        *self.state.lock() = ConnectionState::default();
        *self.round.lock() = MultiTagRound::default();
        self.ndef_cache.lock().take();
        self.rx_buffer.lock().clear();
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.state.lock();
        match (state.session, state.activity) {
            (Some(_), TagActivity::Active) => Ok(()),
            _ => Err(Error::NotActive),
        }
    }

    /// Connect to the facet `index` of `record`. The RF interface is
    /// reselected when the facet needs another discovery identifier or
    /// interface than the active one.
    pub async fn connect(&self, record: &TagRecord, index: usize) -> Result<()> {
        let facet = record.facet(index).ok_or(Error::InvalidTechnology)?;
        let _conn = self.conn_lock.lock().await;
        self.connect_locked(record, facet).await.map(|_| ())
    }

    /// Connect to a facet, then reselect its interface unless connecting
    /// already did. Only tags whose state is reset by a reselect are
    /// touched.
    pub async fn reconnect_facet(&self, record: &TagRecord, index: usize) -> Result<()> {
        let facet = record.facet(index).ok_or(Error::InvalidTechnology)?;
        let _conn = self.conn_lock.lock().await;
        if self.connect_locked(record, facet).await? {
            return Ok(());
        }
        self.reconnect_locked().await
    }

    /// Returns true if the facet had to be reselected.
    async fn connect_locked(&self, record: &TagRecord, facet: &TagFacet) -> Result<bool> {
        let interface = facet.interface();
        let needs_reselect = {
            let state = self.state.lock();
            if state.session != Some(record.handle()) {
                return Err(Error::NoRemoteSession);
            }
            if state.activity == TagActivity::Idle {
                return Err(Error::NotActive);
            }
            state.activity == TagActivity::Sleep
                || state.discovery_id != facet.discovery_id
                || state.interface != Some(interface)
                || state.needs_reconnect
        };
        if needs_reselect {
            self.reselect(facet.discovery_id, facet.protocol, interface).await?;
        }
        self.state.lock().technology = Some(facet.technology);
        debug!("connected to {} of tag {}", facet.technology, record.handle());
        Ok(needs_reselect)
    }

    async fn reconnect_locked(&self) -> Result<()> {
        let (discovery_id, protocol, interface) = {
            let state = self.state.lock();
            match (state.session, state.protocol, state.interface) {
                (Some(_), Some(protocol), Some(interface)) => {
                    (state.discovery_id, protocol, interface)
                }
                _ => return Err(Error::NotActive),
            }
        };
        if !matches!(protocol, Protocol::T2t | Protocol::IsoDep | Protocol::Mifare) {
            debug!("no reconnect needed for {:?}", protocol);
            return Ok(());
        }
        self.reselect(discovery_id, protocol, interface).await
    }

    /// Deactivate the tag owning `handle`. Deactivates to sleep while
    /// the discovery round has another candidate, to discovery
    /// otherwise. A tag that is already gone is a no-op.
    pub async fn disconnect(&self, handle: u8) -> Result<()> {
        let _conn = self.conn_lock.lock().await;
        if self.state.lock().session != Some(handle) {
            debug!("tag {} already disconnected", handle);
            return Ok(());
        }
        let kind = if self.round.lock().has_next() {
            DeactivationType::Sleep
        } else {
            DeactivationType::Discovery
        };

        let mut pending = self.deactivation.begin().await;
        self.state.lock().pending = Some(Cause::Disconnect);
        debug!("+ deactivate({:?})", kind);
        if let Err(err) = Error::check(self.hal.deactivate(kind)) {
            *self.state.lock() = ConnectionState::default();
            return Err(err);
        }
        if let Err(err) = pending.wait(self.config.op_timeout).await {
            warn!("tag {} not deactivated: {}", handle, err);
            let mut state = self.state.lock();
            if state.pending == Some(Cause::Disconnect) {
                *state = ConnectionState::default();
            }
        }
        Ok(())
    }

    /// Switch the RF interface: halt, sleep, select, wait for the
    /// activation. The caller holds the connection lock. On failure
    /// every wait is aborted and the tag is deactivated to discovery.
    async fn reselect(
        &self,
        discovery_id: u8,
        protocol: Protocol,
        interface: RfInterface,
    ) -> Result<()> {
        info!("reselect discovery id {} with {:?} interface", discovery_id, interface);
        self.state.lock().reselecting = true;
        let result = self.reselect_sequence(discovery_id, protocol, interface).await;
        {
            let mut state = self.state.lock();
            state.reselecting = false;
            if result.is_ok() {
                state.discovery_id = discovery_id;
                state.protocol = Some(protocol);
                state.interface = Some(interface);
                state.needs_reconnect = false;
            }
        }
        if let Err(err) = &result {
            self.reselect_failed(err);
        }
        result
    }

    async fn reselect_sequence(
        &self,
        discovery_id: u8,
        protocol: Protocol,
        interface: RfInterface,
    ) -> Result<()> {
        let (current, tech_mode) = {
            let state = self.state.lock();
            (state.interface, state.tech_mode)
        };
        let nci_version = *self.nci_version.lock();
        if nci_version.is_nci2()
            && current == Some(RfInterface::Frame)
            && tech_mode == Some(TechMode::NfcAPassivePoll)
        {
            debug!("+ send_raw_frame({})", hex::encode(HLTA));
            let status = self.hal.send_raw_frame(&HLTA);
            if !status.is_ok() {
                warn!("halt command failed: {}", status);
            }
            time::sleep(self.config.halt_delay).await;
        }

        {
            let mut pending = self.deactivation.begin().await;
            self.state.lock().pending = Some(Cause::Reselect);
            debug!("+ deactivate({:?})", DeactivationType::Sleep);
            Error::check(self.hal.deactivate(DeactivationType::Sleep))?;
            let kind = pending.wait(self.config.sleep_timeout).await?;
            trace!("deactivated to {:?}", kind);
        }
        if self.state.lock().activity != TagActivity::Sleep {
            warn!("tag did not go to sleep");
            return Err(Error::NotActive);
        }

        let mut pending = self.activation.begin().await;
        debug!("+ select({}, {:?}, {:?})", discovery_id, protocol, interface);
        Error::check(self.hal.select(discovery_id, protocol, interface))?;
        for attempt in 1..=self.config.reselect_retries {
            match pending.wait(self.config.activation_timeout).await {
                Ok(Activation::Activated) => return Ok(()),
                Ok(Activation::NotYet) => {
                    debug!("activation attempt {}: target not activated yet", attempt)
                }
                Err(Error::Timeout) => debug!("activation attempt {} timed out", attempt),
                Ok(Activation::Rejected(status)) => return Err(Error::Status(status)),
                Err(err) => return Err(err),
            }
        }
        Err(Error::Timeout)
    }

    fn reselect_failed(&self, err: &Error) {
        warn!("interface reselect failed: {}", err);
        self.abort_all_waits();
        self.reset();
        self.state.lock().pending = Some(Cause::Disconnect);
        debug!("+ deactivate({:?})", DeactivationType::Discovery);
        let status = self.hal.deactivate(DeactivationType::Discovery);
        if !status.is_ok() {
            warn!("deactivation after failed reselect returned {}", status);
        }
    }

    /// Send a raw frame on the connected facet and wait for the
    /// response. Mifare Classic cards go through the vendor extension.
    pub async fn transceive(&self, data: &[u8]) -> Result<Bytes> {
        let _conn = self.conn_lock.lock().await;
        let (technology, protocol) = {
            let state = self.state.lock();
            if state.session.is_none() || state.activity != TagActivity::Active {
                return Err(Error::NotActive);
            }
            (state.technology.ok_or(Error::NotConnected)?, state.protocol)
        };
        let timeout = self.timeout(technology);
        let mifare = match (&self.mifare, protocol) {
            (Some(mifare), Some(Protocol::Mifare)) => Some(mifare.clone()),
            (None, Some(Protocol::Mifare)) => return Err(Error::Unsupported("mifare_transceive")),
            _ => None,
        };

        let mut pending = self.transceive.begin().await;
        self.rx_buffer.lock().clear();
        let status = match &mifare {
            Some(mifare) => {
                debug!("+ mifare_transceive({})", hex::encode(data));
                mifare.transceive(data)
            }
            None => {
                debug!("+ send_raw_frame({})", hex::encode(data));
                self.hal.send_raw_frame(data)
            }
        };
        Error::check(status)?;
        let response = pending.wait(timeout).await;
        drop(pending);

        match response {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(Status::RfProtocolError)) if mifare.is_some() => {
                warn!("Mifare protocol error, reconnecting");
                if let Err(err) = self.reconnect_locked().await {
                    warn!("reconnect failed: {}", err);
                }
                Err(Error::Status(Status::RfProtocolError))
            }
            Ok(Err(status)) => Err(Error::Status(status)),
            Err(Error::Timeout) => {
                self.state.lock().needs_reconnect = true;
                Err(Error::Timeout)
            }
            Err(err) => Err(err),
        }
    }

    async fn detect_locked(&self) -> Result<NdefInfo> {
        self.ensure_active()?;
        let cached = *self.ndef_cache.lock();
        if let Some(info) = cached {
            trace!("NDEF detection cached: {:?}", info);
            return Ok(info);
        }
        let mut pending = self.ndef_detect.begin().await;
        debug!("+ detect_ndef()");
        Error::check(self.hal.detect_ndef())?;
        let result = pending.wait(self.config.ndef_check_timeout).await?;
        let info = NdefInfo::from_detection(&result);
        debug!("NDEF detection: {:?}", info);
        *self.ndef_cache.lock() = Some(info);
        Ok(info)
    }

    /// Detect the NDEF capability of the connected tag. The result is
    /// cached until the next write, format or activation.
    pub async fn check_ndef(&self) -> Result<NdefInfo> {
        let _conn = self.conn_lock.lock().await;
        self.detect_locked().await
    }

    /// Read the NDEF message.
    pub async fn read_ndef(&self) -> Result<NdefMessage> {
        let _conn = self.conn_lock.lock().await;
        let info = self.detect_locked().await?;
        if !info.capable {
            return Err(Error::NotNdefCapable);
        }
        if info.current_size == 0 {
            return Ok(NdefMessage::default());
        }
        let mut pending = self.ndef_read.begin().await;
        debug!("+ read_ndef()");
        Error::check(self.hal.read_ndef())?;
        let (status, message) = pending.wait(self.config.ndef_read_timeout).await?;
        Error::check(status)?;
        Ok(NdefMessage(message))
    }

    /// Write an NDEF message. An empty message is written as the empty
    /// NDEF record.
    pub async fn write_ndef(&self, message: &[u8]) -> Result<()> {
        let _conn = self.conn_lock.lock().await;
        let info = self.detect_locked().await?;
        if !info.capable {
            return Err(Error::NotNdefCapable);
        }
        if info.mode == NdefMode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        let message = if message.is_empty() { &EMPTY_NDEF[..] } else { message };
        if message.len() > info.max_size as usize {
            return Err(Error::MessageTooLarge {
                size: message.len(),
                max: info.max_size as usize,
            });
        }

        let timeout = self.timeout(Technology::Ndef);
        let mut pending = self.ndef_write.begin().await;
        self.ndef_cache.lock().take();
        debug!("+ write_ndef({})", hex::encode(message));
        Error::check(self.hal.write_ndef(message))?;
        Error::check(pending.wait(timeout).await?)
    }

    /// Format the tag for NDEF, then reconnect it.
    pub async fn format_ndef(&self) -> Result<()> {
        let _conn = self.conn_lock.lock().await;
        self.ensure_active()?;
        let mut pending = self.ndef_format.begin().await;
        self.ndef_cache.lock().take();
        debug!("+ format_ndef()");
        Error::check(self.hal.format_ndef())?;
        let status = pending.wait(self.config.ndef_format_timeout).await?;
        drop(pending);
        Error::check(status)?;
        if let Err(err) = self.reconnect_locked().await {
            warn!("reconnect after format failed: {}", err);
        }
        Ok(())
    }

    /// Make the NDEF area read-only. A permanent lock is tried first.
    pub async fn make_read_only(&self) -> Result<()> {
        let _conn = self.conn_lock.lock().await;
        let info = self.detect_locked().await?;
        if !info.capable {
            return Err(Error::NotNdefCapable);
        }
        self.ndef_cache.lock().take();
        match self.set_read_only(true).await {
            Err(Error::Status(Status::Rejected)) => {
                info!("hard lock rejected, falling back to soft lock");
                self.set_read_only(false).await
            }
            result => result,
        }
    }

    async fn set_read_only(&self, hard_lock: bool) -> Result<()> {
        let mut pending = self.read_only.begin().await;
        debug!("+ set_read_only({})", hard_lock);
        Error::check(self.hal.set_read_only(hard_lock))?;
        Error::check(pending.wait(self.config.op_timeout).await?)
    }

    /// Check that the tag owning `handle` is still in the field. A tag
    /// busy with a reselect or another operation counts as present. A
    /// check the controller reports as failed is retried; one left
    /// unanswered means the tag is gone.
    pub async fn presence_check(&self, handle: u8) -> bool {
        if self.state.lock().reselecting {
            return true;
        }
        let Ok(_conn) = self.conn_lock.try_lock() else {
            trace!("operation in flight, presence check skipped");
            return true;
        };
        let protocol = {
            let state = self.state.lock();
            if state.session != Some(handle) {
                return false;
            }
            match state.activity {
                TagActivity::Idle => return false,
                TagActivity::Sleep => return true,
                TagActivity::Active => state.protocol,
            }
        };
        for attempt in 1..=self.config.presence_check_retries + 1 {
            match self.presence_round(protocol).await {
                Ok(true) => return true,
                Ok(false) => debug!("presence check {} of tag {} failed", attempt, handle),
                Err(Error::Timeout) => {
                    debug!("presence check of tag {} unanswered", handle);
                    return false;
                }
                Err(err) => debug!("presence check {} of tag {}: {}", attempt, handle, err),
            }
        }
        false
    }

    async fn presence_round(&self, protocol: Option<Protocol>) -> Result<bool> {
        let mut pending = self.presence.begin().await;
        let status = match (&self.mifare, protocol) {
            (Some(mifare), Some(Protocol::Mifare)) => {
                debug!("+ mifare_presence_check()");
                mifare.presence_check()
            }
            _ => {
                let algorithm = self.config.presence_check_algorithm;
                debug!("+ presence_check({:?})", algorithm);
                self.hal.presence_check(algorithm)
            }
        };
        Error::check(status)?;
        Ok(pending.wait(self.config.presence_check_timeout).await?.is_ok())
    }

    fn select_candidate(&self, candidate: &Candidate) {
        let interface = RfInterface::for_protocol(candidate.protocol);
        debug!("+ select({}, {:?}, {:?})", candidate.discovery_id, candidate.protocol, interface);
        let status = self.hal.select(candidate.discovery_id, candidate.protocol, interface);
        if !status.is_ok() {
            warn!("select of discovery id {} returned {}", candidate.discovery_id, status);
            self.resume_discovery();
        }
    }

    /// Drop the discovery round and return the controller from the
    /// host select state to polling.
    fn resume_discovery(&self) {
        *self.round.lock() = MultiTagRound::default();
        debug!("+ deactivate({:?})", DeactivationType::Discovery);
        let status = self.hal.deactivate(DeactivationType::Discovery);
        if !status.is_ok() {
            warn!("deactivation to discovery returned {}", status);
        }
    }

    /// RF_DISCOVER_NTF. Candidates accumulate until the last
    /// notification of the poll, then the first one is selected.
    pub fn on_discover_result(&self, ntf: &DiscoverNtf) {
        let endpoint = Endpoint::from_discovery(ntf);
        let protocol = endpoint.protocol();
        let uid = endpoint.uid();
        let sak = endpoint.params.as_ref().and_then(TechParams::sak);
        debug!(
            "discovered id {} protocol {:?} uid {} (more: {})",
            ntf.discovery_id,
            protocol,
            hex::encode(&uid),
            ntf.more
        );

        let selected = {
            let mut round = self.round.lock();
            if round.complete {
                *round = MultiTagRound::default();
            }
            let twin = if self.config.multi_protocol_tags {
                round.twin_of(&uid, sak, protocol)
            } else {
                None
            };
            match twin {
                Some(index) => {
                    debug!("discovery id {} merged with its twin", ntf.discovery_id);
                    round.candidates[index].merged.extend(endpoint.facets);
                }
                None if round.candidates.len() >= self.config.max_candidates => {
                    warn!("too many candidates, dropping discovery id {}", ntf.discovery_id);
                }
                None => round.candidates.push(Candidate {
                    discovery_id: ntf.discovery_id,
                    protocol,
                    uid,
                    sak,
                    merged: vec![],
                }),
            }
            if ntf.more {
                None
            } else {
                round.complete = true;
                let next = round.take_next();
                if next.is_none() {
                    *round = MultiTagRound::default();
                }
                next
            }
        };
        if let Some(candidate) = selected {
            self.select_candidate(&candidate);
        }
    }

    /// RF_DISCOVER_SELECT_RSP delivered as an event. A failure outside a
    /// reselect ends the discovery round.
    pub fn on_select_result(&self, status: Status) {
        if status.is_ok() {
            return;
        }
        warn!("select rejected: {}", status);
        if self.state.lock().reselecting {
            self.activation.notify(Activation::Rejected(status));
        } else {
            self.resume_discovery();
        }
    }

    /// CORE_GENERIC_ERROR_NTF.
    pub fn on_generic_error(&self, status: Status) {
        match status {
            Status::DiscoveryTargetActivationFailed => {
                self.activation.notify(Activation::NotYet);
            }
            _ => warn!("generic error {}", status),
        }
    }

    /// RF_INTF_ACTIVATED_NTF. Returns the record of a newly activated
    /// tag; a reactivation completing a reselect returns `None`.
    pub fn on_activated(&self, ntf: &ActivationNtf) -> Option<TagRecord> {
        let endpoint = Endpoint::from_activation(ntf);
        let protocol = endpoint.protocol();
        {
            let mut state = self.state.lock();
            state.activity = TagActivity::Active;
            state.discovery_id = ntf.discovery_id;
            state.protocol = Some(protocol);
            state.interface = Some(ntf.interface);
            if state.reselecting {
                drop(state);
                debug!("discovery id {} reactivated on {:?}", ntf.discovery_id, ntf.interface);
                self.activation.notify(Activation::Activated);
                return None;
            }
        }

        let merged = self
            .round
            .lock()
            .candidates
            .iter()
            .find(|c| c.discovery_id == ntf.discovery_id)
            .map(|c| c.merged.clone())
            .unwrap_or_default();
        let Some(record) = endpoint.into_record(merged) else {
            warn!("activation of discovery id {} without technology", ntf.discovery_id);
            return None;
        };
        {
            let mut state = self.state.lock();
            state.session = Some(record.handle());
            state.tech_mode = record.tech_mode();
            state.technology = None;
            state.needs_reconnect = false;
        }
        self.ndef_cache.lock().take();
        self.timeouts.lock().set_frame_wait_time(record.frame_wait_time());
        info!(
            "tag {} activated with {:?}",
            hex::encode_upper(record.uid()),
            record.technologies()
        );
        Some(record)
    }

    /// RF_DEACTIVATE_NTF. Outside a reselect the connection is reset;
    /// after a sleep deactivation the next candidate of the round is
    /// selected.
    pub fn on_deactivated(&self, kind: DeactivationType, reason: DeactivationReason) {
        debug!("deactivated to {:?} ({:?})", kind, reason);
        let next = {
            let mut state = self.state.lock();
            state.activity =
                if kind.is_sleep() { TagActivity::Sleep } else { TagActivity::Idle };
            let cause = state.pending.take();
            if cause == Some(Cause::Reselect) || state.reselecting {
                None
            } else {
                *state = ConnectionState::default();
                self.ndef_cache.lock().take();
                let mut round = self.round.lock();
                let next = if kind.is_sleep() { round.take_next() } else { None };
                if next.is_none() {
                    *round = MultiTagRound::default();
                }
                next
            }
        };
        self.deactivation.notify(kind);
        if let Some(candidate) = next {
            self.select_candidate(&candidate);
        }
    }

    /// Data received on the RF connection.
    pub fn on_data(&self, status: Status, payload: &[u8], more: bool) {
        let mut buffer = self.rx_buffer.lock();
        if !status.is_ok() {
            buffer.clear();
            drop(buffer);
            self.transceive.notify(Err(status));
            return;
        }
        buffer.extend_from_slice(payload);
        if !more {
            let response = buffer.split().freeze();
            drop(buffer);
            self.transceive.notify(Ok(response));
        }
    }

    /// NDEF detection result.
    pub fn on_ndef_detected(&self, result: NdefDetectResult) {
        self.ndef_detect.notify(result);
    }

    /// NDEF read completion.
    pub fn on_ndef_read(&self, status: Status, message: Bytes) {
        self.ndef_read.notify((status, message));
    }

    /// NDEF write completion.
    pub fn on_ndef_written(&self, status: Status) {
        self.ndef_write.notify(status);
    }

    /// NDEF format completion.
    pub fn on_ndef_formatted(&self, status: Status) {
        self.ndef_format.notify(status);
    }

    /// Read-only completion.
    pub fn on_read_only_set(&self, status: Status) {
        self.read_only.notify(status);
    }

    /// Presence check result.
    pub fn on_presence_checked(&self, status: Status) {
        self.presence.notify(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(discovery_id: u8, protocol: Protocol, uid: &[u8], sak: u8) -> Candidate {
        Candidate { discovery_id, protocol, uid: uid.to_vec(), sak: Some(sak), merged: vec![] }
    }

    #[test]
    fn timeout_table_overrides_and_resets() {
        let mut table = TimeoutTable::new(
            &[(Technology::NfcA, Duration::from_millis(618))],
            Duration::from_secs(1),
        );
        assert_eq!(table.get(Technology::NfcA), Duration::from_millis(618));
        assert_eq!(table.get(Technology::NfcV), Duration::from_secs(1));
        table.set(Technology::NfcA, Duration::from_millis(100));
        assert_eq!(table.get(Technology::NfcA), Duration::from_millis(100));
        table.reset();
        assert_eq!(table.get(Technology::NfcA), Duration::from_millis(618));
    }

    #[test]
    fn iso_dep_timeout_covers_frame_wait_time() {
        let mut table = TimeoutTable::new(
            &[(Technology::IsoDep, Duration::from_millis(618))],
            Duration::from_secs(1),
        );
        table.set_frame_wait_time(Some(Duration::from_millis(38)));
        assert_eq!(table.get(Technology::IsoDep), Duration::from_millis(618));
        table.set_frame_wait_time(Some(Duration::from_millis(4949)));
        assert_eq!(table.get(Technology::IsoDep), Duration::from_millis(4949));
        table.set(Technology::IsoDep, Duration::from_millis(200));
        assert_eq!(table.get(Technology::IsoDep), Duration::from_millis(200));
    }

    #[test]
    fn round_skips_peer_to_peer_candidates() {
        let mut round = MultiTagRound::default();
        round.candidates.push(candidate(1, Protocol::NfcDep, &[1], 0x40));
        round.candidates.push(candidate(2, Protocol::IsoDep, &[2], 0x20));
        assert!(round.has_next());
        assert_eq!(round.take_next().map(|c| c.discovery_id), Some(2));
        assert!(!round.has_next());
        assert!(round.take_next().is_none());
    }

    #[test]
    fn twins_need_multi_protocol_sak() {
        let mut round = MultiTagRound::default();
        round.candidates.push(candidate(1, Protocol::IsoDep, &[1, 2, 3, 4], 0x28));
        assert_eq!(round.twin_of(&[1, 2, 3, 4], Some(0x28), Protocol::Mifare), Some(0));
        assert_eq!(round.twin_of(&[1, 2, 3, 5], Some(0x28), Protocol::Mifare), None);
        assert_eq!(round.twin_of(&[1, 2, 3, 4], Some(0x28), Protocol::IsoDep), None);
        assert_eq!(round.twin_of(&[1, 2, 3, 4], Some(0x08), Protocol::Mifare), None);
    }
}
