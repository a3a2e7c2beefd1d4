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

//! Controller-level NCI adapter.
//!
//! Owns the controller session: enable and disable, RF discovery,
//! polling and listen configuration, screen state. HAL events are
//! consumed by a single task, the serialized callback context, which
//! fans them out to the tag adapter and the routing manager.

use crate::config::NfcConfig;
use crate::error::{Error, Result};
use crate::hal::{HalEvent, HalLoader, NfcHal};
use crate::nci::{param, NciVersion, ScreenState, Status, TechMask, Technology};
use crate::routing::RoutingManager;
use crate::sync::SyncEvent;
use crate::tag::{NciTagAdapter, TagDispatcher, TagHost};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Category of a counted operational failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum FailureKind {
    Enable,
    Disable,
    Discovery,
    Polling,
    Config,
    Routing,
    Screen,
}

/// Parameters of the running RF discovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryParams {
    /// Technologies polled.
    pub tech: TechMask,
    /// Listen mode is disabled.
    pub reader_mode: bool,
    /// The host is a listen-mode routing destination.
    pub host_routing: bool,
}

#[derive(Debug, Default)]
struct Session {
    enabled: bool,
    discovery: Option<DiscoveryParams>,
}

struct Inner {
    hal: Arc<dyn NfcHal>,
    config: NfcConfig,
    tags: Arc<NciTagAdapter>,
    routing: Arc<RoutingManager>,
    dispatcher: Arc<dyn TagDispatcher>,
    session: tokio::sync::Mutex<Session>,
    nci_version: Mutex<NciVersion>,
    screen_state: Mutex<ScreenState>,
    failures: Mutex<HashMap<FailureKind, u32>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    enable: SyncEvent<(Status, NciVersion)>,
    disable: SyncEvent<Status>,
    polling: SyncEvent<Status>,
    discovery: SyncEvent<Status>,
    config_set: SyncEvent<Status>,
}

/// The NFC controller service. Cloning yields another handle to the
/// same controller session.
#[derive(Clone)]
pub struct NfcAdapter {
    inner: Arc<Inner>,
}

impl NfcAdapter {
    /// Create an adapter reading its configuration through the HAL.
    pub fn new(hal: Arc<dyn NfcHal>, dispatcher: Arc<dyn TagDispatcher>) -> Self {
        let config = NfcConfig::load(hal.as_ref());
        NfcAdapter::with_config(hal, config, dispatcher)
    }

    /// Create an adapter with an explicit configuration.
    pub fn with_config(
        hal: Arc<dyn NfcHal>,
        config: NfcConfig,
        dispatcher: Arc<dyn TagDispatcher>,
    ) -> Self {
        let tags = Arc::new(NciTagAdapter::new(hal.clone(), config.tag.clone()));
        let routing = Arc::new(RoutingManager::new(hal.clone(), config.routing.clone()));
        NfcAdapter {
            inner: Arc::new(Inner {
                hal,
                config,
                tags,
                routing,
                dispatcher,
                session: tokio::sync::Mutex::new(Session::default()),
                nci_version: Mutex::new(NciVersion::Version20),
                screen_state: Mutex::new(ScreenState::ON_UNLOCKED),
                failures: Mutex::new(HashMap::new()),
                event_task: Mutex::new(None),
                enable: SyncEvent::new("enable"),
                disable: SyncEvent::new("disable"),
                polling: SyncEvent::new("polling"),
                discovery: SyncEvent::new("discovery"),
                config_set: SyncEvent::new("set-config"),
            }),
        }
    }

    /// Resolve the HAL library for `chip_type` and create the adapter.
    pub fn load(
        loader: &HalLoader,
        chip_type: Option<&str>,
        dispatcher: Arc<dyn TagDispatcher>,
    ) -> Result<Self> {
        Ok(NfcAdapter::new(loader.load(chip_type)?, dispatcher))
    }

    /// Typed configuration.
    pub fn config(&self) -> &NfcConfig {
        &self.inner.config
    }

    /// Tag adapter.
    pub fn tags(&self) -> &Arc<NciTagAdapter> {
        &self.inner.tags
    }

    /// Routing manager.
    pub fn routing(&self) -> &Arc<RoutingManager> {
        &self.inner.routing
    }

    /// NCI version reported by the controller at enable time.
    pub fn nci_version(&self) -> NciVersion {
        *self.inner.nci_version.lock()
    }

    /// Last screen state applied.
    pub fn screen_state(&self) -> ScreenState {
        *self.inner.screen_state.lock()
    }

    /// True once the controller is enabled.
    pub async fn is_enabled(&self) -> bool {
        self.inner.session.lock().await.enabled
    }

    /// Parameters of the running RF discovery.
    pub async fn discovery(&self) -> Option<DiscoveryParams> {
        self.inner.session.lock().await.discovery
    }

    /// Number of failures counted for `kind`.
    pub fn failure_count(&self, kind: FailureKind) -> u32 {
        self.inner.failures.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Transceive timeout of `technology`.
    pub fn get_timeout(&self, technology: Technology) -> Duration {
        self.inner.tags.timeout(technology)
    }

    /// Override the transceive timeout of `technology`.
    pub fn set_timeout(&self, technology: Technology, timeout: Duration) {
        info!("timeout of {} set to {:?}", technology, timeout);
        self.inner.tags.set_timeout(technology, timeout);
    }

    /// Restore the configured timeouts.
    pub fn reset_timeouts(&self) {
        self.inner.tags.reset_timeouts();
    }

    /// Enable the controller: start the event task, wait for the enable
    /// confirmation, then bring up routing and the NDEF handler.
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        if session.enabled {
            debug!("controller already enabled");
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_event_loop(Arc::downgrade(inner), rx));
        if let Some(previous) = inner.event_task.lock().replace(task) {
            previous.abort();
        }

        let enabled = {
            let mut pending = inner.enable.begin().await;
            debug!("+ enable()");
            match Error::check(inner.hal.enable(tx)) {
                Ok(()) => pending.wait(inner.config.controller.enable_timeout).await,
                Err(err) => Err(err),
            }
        };
        let nci_version = match enabled {
            Ok((Status::Ok, nci_version)) => nci_version,
            Ok((status, _)) => return Err(self.enable_failed(Error::Status(status))),
            Err(err) => return Err(self.enable_failed(err)),
        };
        info!("controller enabled, {:?}", nci_version);
        *inner.nci_version.lock() = nci_version;
        inner.tags.set_nci_version(nci_version);

        let screen = self.screen_state();
        if nci_version.is_nci2() && screen != ScreenState::ON_UNLOCKED {
            debug!("applying recorded screen state {:?}", screen);
            if let Err(err) = self.apply_screen_state(screen).await {
                warn!("screen state {:?} not applied: {}", screen, err);
            }
        }

        if let Err(err) = inner.routing.initialize().await {
            self.count_failure(FailureKind::Routing, &err);
        }
        debug!("+ register_ndef_handler()");
        let status = inner.hal.register_ndef_handler();
        if !status.is_ok() {
            warn!("NDEF handler registration returned {}", status);
        }
        let duration = inner.config.controller.discovery_duration;
        debug!("+ set_discovery_duration({:?})", duration);
        let status = inner.hal.set_discovery_duration(duration);
        if !status.is_ok() {
            warn!("set_discovery_duration returned {}", status);
        }

        session.enabled = true;
        Ok(())
    }

    fn enable_failed(&self, err: Error) -> Error {
        self.count_failure(FailureKind::Enable, &err);
        if let Some(task) = self.inner.event_task.lock().take() {
            task.abort();
        }
        err
    }

    /// Disable the controller. Safe to call when the controller was
    /// never enabled.
    pub async fn deinitialize(&self) {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        if !session.enabled {
            debug!("controller not enabled");
            return;
        }
        if session.discovery.is_some() {
            if let Err(err) = self.stop_discovery(&mut session).await {
                warn!("stopping discovery failed: {}", err);
            }
        }
        inner.routing.deinitialize().await;
        inner.tags.abort_all_waits();
        inner.tags.reset();

        let disabled = {
            let mut pending = inner.disable.begin().await;
            debug!("+ disable(true)");
            match Error::check(inner.hal.disable(true)) {
                Ok(()) => pending
                    .wait(inner.config.controller.disable_timeout)
                    .await
                    .and_then(Error::check),
                Err(err) => Err(err),
            }
        };
        if let Err(err) = disabled {
            self.count_failure(FailureKind::Disable, &err);
        }
        session.enabled = false;
        session.discovery = None;
        if let Some(task) = inner.event_task.lock().take() {
            task.abort();
        }
        info!("controller disabled");
    }

    /// Start RF discovery with the configured polling technologies,
    /// listening enabled and the host routable.
    pub async fn enable_default_discovery(&self) -> Result<()> {
        let tech = self.inner.config.controller.polling_tech;
        self.enable_discovery(tech, false, true, false).await
    }

    /// Start RF discovery. A running discovery with the same parameters
    /// is kept unless `restart` is set; otherwise it is stopped before
    /// polling and listening are reconfigured.
    pub async fn enable_discovery(
        &self,
        tech: TechMask,
        reader_mode: bool,
        host_routing: bool,
        restart: bool,
    ) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if !session.enabled {
            return Err(Error::NotActive);
        }
        let params = DiscoveryParams { tech, reader_mode, host_routing };
        if session.discovery == Some(params) && !restart {
            debug!("discovery already running with {:?}", params);
            return Ok(());
        }
        if session.discovery.is_some() {
            self.stop_discovery(&mut session).await?;
        }
        self.start_discovery(&mut session, params).await
    }

    /// Stop RF discovery. A no-op when discovery is not running.
    pub async fn disable_discovery(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if session.discovery.is_none() {
            debug!("discovery not running");
            return Ok(());
        }
        self.stop_discovery(&mut session).await
    }

    async fn start_discovery(&self, session: &mut Session, params: DiscoveryParams) -> Result<()> {
        let inner = &self.inner;
        if let Err(err) = inner.routing.commit_if_changed().await {
            self.count_failure(FailureKind::Routing, &err);
        }
        if !params.tech.is_empty() {
            debug!("+ enable_polling({:?})", params.tech);
            self.round_trip(&inner.polling, FailureKind::Polling, || {
                inner.hal.enable_polling(params.tech)
            })
            .await?;
        }
        debug!("+ set_listening({})", !params.reader_mode);
        self.round_trip(&inner.config_set, FailureKind::Config, || {
            inner.hal.set_listening(!params.reader_mode)
        })
        .await?;
        if let Err(err) =
            inner.routing.set_host_listen(params.host_routing && !params.reader_mode).await
        {
            self.count_failure(FailureKind::Routing, &err);
        }
        debug!("+ start_rf_discovery()");
        self.round_trip(&inner.discovery, FailureKind::Discovery, || {
            inner.hal.start_rf_discovery()
        })
        .await?;
        info!("RF discovery started with {:?}", params);
        session.discovery = Some(params);
        Ok(())
    }

    async fn stop_discovery(&self, session: &mut Session) -> Result<()> {
        let inner = &self.inner;
        debug!("+ stop_rf_discovery()");
        self.round_trip(&inner.discovery, FailureKind::Discovery, || {
            inner.hal.stop_rf_discovery()
        })
        .await?;
        session.discovery = None;
        debug!("+ disable_polling()");
        self.round_trip(&inner.polling, FailureKind::Polling, || inner.hal.disable_polling())
            .await?;
        info!("RF discovery stopped");
        Ok(())
    }

    /// Apply a new screen state. Controllers before NCI 2.0 have no
    /// dynamic power sub-states; the state is only recorded for them.
    pub async fn set_screen_status(&self, state: ScreenState) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        let previous = self.screen_state();
        if previous == state {
            return Ok(());
        }
        if !session.enabled || !self.nci_version().is_nci2() {
            debug!("screen state {:?} recorded", state);
            *self.inner.screen_state.lock() = state;
            return Ok(());
        }

        let discovery = session.discovery;
        if discovery.is_some() {
            self.stop_discovery(&mut session).await?;
        }
        let applied = self.apply_screen_state(state).await;
        if applied.is_ok() {
            info!("screen state {:?} -> {:?}", previous, state);
            *self.inner.screen_state.lock() = state;
        }
        if let Some(params) = discovery {
            self.start_discovery(&mut session, params).await?;
        }
        applied
    }

    async fn apply_screen_state(&self, state: ScreenState) -> Result<()> {
        let inner = &self.inner;
        let sub_state = state.power_sub_state();
        debug!("+ set_power_sub_state({:#04x})", sub_state);
        self.round_trip(&inner.config_set, FailureKind::Screen, || {
            inner.hal.set_power_sub_state(sub_state)
        })
        .await?;

        let discovery_param = if state == ScreenState::ON_UNLOCKED {
            param::LISTEN_DH_NFCEE_ENABLE | param::POLLING_DH_ENABLE
        } else {
            param::LISTEN_DH_NFCEE_ENABLE | param::POLLING_DH_DISABLE
        };
        debug!("+ set_config({:#04x}, {:02x})", param::CON_DISCOVERY_PARAM, discovery_param);
        self.round_trip(&inner.config_set, FailureKind::Screen, || {
            inner.hal.set_config(param::CON_DISCOVERY_PARAM, &[discovery_param])
        })
        .await
    }

    /// Recompute and commit the routing table. RF discovery is stopped
    /// around the commit.
    pub async fn commit_routing(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if !session.enabled {
            return Err(Error::NotActive);
        }
        let discovery = session.discovery;
        if discovery.is_some() {
            self.stop_discovery(&mut session).await?;
        }
        let committed = self.inner.routing.commit_routing().await;
        if let Err(err) = &committed {
            self.count_failure(FailureKind::Routing, err);
        }
        if let Some(params) = discovery {
            self.start_discovery(&mut session, params).await?;
        }
        committed
    }

    /// Issue one command and wait for its completion event. Failures
    /// are counted against `kind`.
    async fn round_trip(
        &self,
        event: &SyncEvent<Status>,
        kind: FailureKind,
        command: impl FnOnce() -> Status,
    ) -> Result<()> {
        let mut pending = event.begin().await;
        let result = match Error::check(command()) {
            Ok(()) => pending.wait(self.inner.config.controller.op_timeout).await,
            Err(err) => Err(err),
        }
        .and_then(Error::check);
        drop(pending);
        if let Err(err) = &result {
            self.count_failure(kind, err);
        }
        result
    }

    fn count_failure(&self, kind: FailureKind, err: &Error) {
        error!("{:?} operation failed: {}", kind, err);
        *self.inner.failures.lock().entry(kind).or_default() += 1;
    }
}

impl Inner {
    /// Route one HAL event. Runs on the event task and never blocks.
    fn dispatch(&self, event: HalEvent) {
        match event {
            HalEvent::Enabled { status, nci_version } => {
                self.enable.notify((status, nci_version));
            }
            HalEvent::Disabled(status) => {
                self.disable.notify(status);
            }
            HalEvent::PollingEnabled(status) | HalEvent::PollingDisabled(status) => {
                self.polling.notify(status);
            }
            HalEvent::DiscoveryStarted(status) | HalEvent::DiscoveryStopped(status) => {
                self.discovery.notify(status);
            }
            HalEvent::ConfigSet(status) => {
                self.config_set.notify(status);
            }
            HalEvent::DiscoverResult(ntf) => self.tags.on_discover_result(&ntf),
            HalEvent::SelectResult(status) => self.tags.on_select_result(status),
            HalEvent::GenericError(status) => self.tags.on_generic_error(status),
            HalEvent::Activated(ntf) => {
                if let Some(record) = self.tags.on_activated(&ntf) {
                    let host = TagHost::new(record, self.tags.clone(), self.dispatcher.clone());
                    host.start_presence_check();
                    self.dispatcher.on_tag_discovered(host);
                }
            }
            HalEvent::Deactivated { kind, reason } => self.tags.on_deactivated(kind, reason),
            HalEvent::Data { status, payload, more } => self.tags.on_data(status, &payload, more),
            HalEvent::NdefDetected(result) => self.tags.on_ndef_detected(result),
            HalEvent::NdefRead { status, message } => self.tags.on_ndef_read(status, message),
            HalEvent::NdefWritten(status) => self.tags.on_ndef_written(status),
            HalEvent::NdefFormatted(status) => self.tags.on_ndef_formatted(status),
            HalEvent::ReadOnlySet(status) => self.tags.on_read_only_set(status),
            HalEvent::PresenceChecked(status) => self.tags.on_presence_checked(status),
            HalEvent::Ee(event) => self.routing.on_ee_event(event),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn run_event_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<HalEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.dispatch(event);
    }
    debug!("HAL event loop terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::hal::sim::SimulatedController;
    use crate::tag::DispatchEvent;

    fn adapter(sim: &SimulatedController) -> (NfcAdapter, mpsc::UnboundedReceiver<DispatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel::<DispatchEvent>();
        (NfcAdapter::new(Arc::new(sim.clone()), Arc::new(tx)), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_is_idempotent() {
        let sim = SimulatedController::new(ConfigStore::new());
        let (nfc, _rx) = adapter(&sim);
        nfc.initialize().await.unwrap();
        nfc.initialize().await.unwrap();
        assert_eq!(sim.call_count("enable"), 1);
        assert_eq!(sim.call_count("register_ndef_handler"), 1);
        assert_eq!(sim.discovery_duration(), Some(Duration::from_millis(500)));
        assert!(nfc.is_enabled().await);
    }

    #[tokio::test(start_paused = true)]
    async fn deinitialize_without_initialize() {
        let sim = SimulatedController::new(ConfigStore::new());
        let (nfc, _rx) = adapter(&sim);
        nfc.deinitialize().await;
        assert_eq!(sim.call_count("disable"), 0);
        assert!(!nfc.is_enabled().await);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_requires_enabled_controller() {
        let sim = SimulatedController::new(ConfigStore::new());
        let (nfc, _rx) = adapter(&sim);
        let result = nfc.enable_discovery(TechMask::A, false, true, false).await;
        assert_eq!(result, Err(Error::NotActive));
        assert_eq!(sim.call_count("enable_polling"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn matching_discovery_is_not_restarted() {
        let sim = SimulatedController::new(ConfigStore::new());
        let (nfc, _rx) = adapter(&sim);
        nfc.initialize().await.unwrap();
        nfc.enable_discovery(TechMask::A | TechMask::B, false, true, false).await.unwrap();
        nfc.enable_discovery(TechMask::A | TechMask::B, false, true, false).await.unwrap();
        assert_eq!(sim.call_count("start_rf_discovery"), 1);

        nfc.enable_discovery(TechMask::A | TechMask::B, false, true, true).await.unwrap();
        assert_eq!(sim.call_count("stop_rf_discovery"), 1);
        assert_eq!(sim.call_count("start_rf_discovery"), 2);

        nfc.enable_discovery(TechMask::A, true, false, false).await.unwrap();
        assert_eq!(sim.discovery_configuration(), (TechMask::A, false));
        assert!(sim.is_discovering());
    }
}
