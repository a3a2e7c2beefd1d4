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

//! Simulated NFCC.
//!
//! Implements the HAL entry points on top of an RF state machine
//! following [NCI] 5.2, with cards that can be placed in and removed
//! from the field. Faults (mute cards, late activations, failed
//! presence checks, protocol errors) are injected through knobs.

use super::{
    ActivationNtf, DiscoverNtf, EeEvent, EeInfo, EntryPoints, HalEvent, HalEventSender,
    MifareExtension, NdefDetectResult, NdefFlags, NfcHal,
};
use crate::config::{ConfigStore, ConfigValue, PresenceCheckAlgorithm};
use crate::nci::{
    DeactivationReason, DeactivationType, NciVersion, PowerState, Protocol, RfInterface, Status,
    TechMask, TechMode,
};
use crate::routing::RoutingEntry;
use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Largest payload of one data packet.
const MAX_DATA_PACKET_PAYLOAD_SIZE: usize = 255;

/// Capacity of the NDEF area created by a format.
const FORMATTED_NDEF_SIZE: u32 = 128;

/// One protocol exposed by a simulated card.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimEndpoint {
    /// RF protocol.
    pub protocol: Protocol,
    /// Technology and mode the endpoint answers.
    pub tech_mode: TechMode,
    /// Technology specific parameters, [NCI] 7.1.
    pub tech_params: Vec<u8>,
    /// Activation parameters sent on the ISO-DEP interface.
    pub activation_params: Vec<u8>,
}

/// NDEF area of a simulated card.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimNdef {
    /// Current message.
    pub message: Vec<u8>,
    /// Capacity.
    pub max_size: u32,
    /// The area is locked.
    pub read_only: bool,
    /// The card supports a permanent lock.
    pub hard_lockable: bool,
}

/// A card that can be placed in the simulated field.
#[derive(Clone, Debug, Default)]
pub struct SimCard {
    /// Endpoints reported while polling, in order.
    pub endpoints: Vec<SimEndpoint>,
    /// NDEF area, if formatted.
    pub ndef: Option<SimNdef>,
    /// The card can be formatted for NDEF.
    pub formatable: bool,
    /// Responses to raw frames.
    pub responses: HashMap<Vec<u8>, Vec<u8>>,
}

fn nfca_params(atqa: [u8; 2], uid: &[u8], sak: u8) -> Vec<u8> {
    let mut params = atqa.to_vec();
    params.push(uid.len() as u8);
    params.extend_from_slice(uid);
    params.extend_from_slice(&[1, sak]);
    params
}

/// RATS response with TA, TB (FWI 7) and TC present.
fn ats() -> Vec<u8> {
    let ats = [0x78, 0x80, 0x70, 0x02, 0x80, 0x31, 0x80, 0x66];
    let mut params = vec![ats.len() as u8];
    params.extend_from_slice(&ats);
    params
}

impl SimCard {
    /// ISO-DEP card answering on NFC-A.
    pub fn iso_dep_a(uid: &[u8]) -> SimCard {
        SimCard {
            endpoints: vec![SimEndpoint {
                protocol: Protocol::IsoDep,
                tech_mode: TechMode::NfcAPassivePoll,
                tech_params: nfca_params([0x44, 0x03], uid, 0x20),
                activation_params: ats(),
            }],
            ..Default::default()
        }
    }

    /// Mifare Classic card.
    pub fn mifare_classic(uid: &[u8]) -> SimCard {
        SimCard {
            endpoints: vec![SimEndpoint {
                protocol: Protocol::Mifare,
                tech_mode: TechMode::NfcAPassivePoll,
                tech_params: nfca_params([0x04, 0x00], uid, 0x08),
                activation_params: vec![],
            }],
            ..Default::default()
        }
    }

    /// Card answering both as ISO-DEP and Mifare Classic (SAK 0x28).
    pub fn multi_protocol(uid: &[u8]) -> SimCard {
        let tech_params = nfca_params([0x04, 0x00], uid, 0x28);
        SimCard {
            endpoints: vec![
                SimEndpoint {
                    protocol: Protocol::IsoDep,
                    tech_mode: TechMode::NfcAPassivePoll,
                    tech_params: tech_params.clone(),
                    activation_params: ats(),
                },
                SimEndpoint {
                    protocol: Protocol::Mifare,
                    tech_mode: TechMode::NfcAPassivePoll,
                    tech_params,
                    activation_params: vec![],
                },
            ],
            ..Default::default()
        }
    }

    /// Type 2 tag. A 7 byte UID starting with 04h is a Mifare Ultralight.
    pub fn type2(uid: &[u8]) -> SimCard {
        SimCard {
            endpoints: vec![SimEndpoint {
                protocol: Protocol::T2t,
                tech_mode: TechMode::NfcAPassivePoll,
                tech_params: nfca_params([0x44, 0x00], uid, 0x00),
                activation_params: vec![],
            }],
            ..Default::default()
        }
    }

    /// Type 3 tag (Felica) with system code 12FCh.
    pub fn felica(nfcid2: [u8; 8]) -> SimCard {
        let mut sensf_res = nfcid2.to_vec();
        sensf_res.extend_from_slice(&[0x03, 0x01, 0x4b, 0x02, 0x4f, 0x49, 0x93, 0xff]);
        sensf_res.extend_from_slice(&[0x12, 0xfc]);
        let mut tech_params = vec![0x01, sensf_res.len() as u8];
        tech_params.extend(sensf_res);
        SimCard {
            endpoints: vec![SimEndpoint {
                protocol: Protocol::T3t,
                tech_mode: TechMode::NfcFPassivePoll,
                tech_params,
                activation_params: vec![],
            }],
            ..Default::default()
        }
    }

    /// Type 5 tag. `uid` is given in air order.
    pub fn nfcv(uid: [u8; 8]) -> SimCard {
        let mut tech_params = vec![0x00, 0x00];
        tech_params.extend_from_slice(&uid);
        SimCard {
            endpoints: vec![SimEndpoint {
                protocol: Protocol::T5t,
                tech_mode: TechMode::NfcVPassivePoll,
                tech_params,
                activation_params: vec![],
            }],
            ..Default::default()
        }
    }

    /// Add a writable NDEF area holding `message`.
    pub fn with_ndef(mut self, message: &[u8], max_size: u32) -> SimCard {
        self.ndef = Some(SimNdef {
            message: message.to_vec(),
            max_size,
            read_only: false,
            hard_lockable: true,
        });
        self
    }

    /// Lock the NDEF area.
    pub fn read_only(mut self) -> SimCard {
        if let Some(ndef) = self.ndef.as_mut() {
            ndef.read_only = true;
        }
        self
    }

    /// Refuse permanent locks of the NDEF area.
    pub fn soft_lock_only(mut self) -> SimCard {
        if let Some(ndef) = self.ndef.as_mut() {
            ndef.hard_lockable = false;
        }
        self
    }

    /// Allow the card to be formatted for NDEF.
    pub fn formatable(mut self) -> SimCard {
        self.formatable = true;
        self
    }

    /// Answer `command` with `response`.
    pub fn with_response(mut self, command: &[u8], response: &[u8]) -> SimCard {
        self.responses.insert(command.to_vec(), response.to_vec());
        self
    }
}

/// State of the RF discovery, [NCI] 5.2. The state
/// RFST_W4_ALL_DISCOVERIES is implied by the poll routine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RfState {
    Idle,
    Discovery,
    PollActive { endpoint: usize, interface: RfInterface },
    WaitForHostSelect,
    WaitForSelectResponse { endpoint: usize, interface: RfInterface },
}

/// Poll response collected during discovery: card id and endpoint
/// index within the card.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct PollResponse {
    card: u16,
    endpoint: usize,
}

#[derive(Default)]
struct Faults {
    mute_frames: bool,
    spurious_wakeups: u32,
    activation_delay: Option<Duration>,
    suppress_activation: bool,
    presence_failures: u32,
    silent_presence_checks: bool,
    reject_next_select: bool,
    mifare_protocol_error: bool,
}

struct State {
    events: Option<HalEventSender>,
    nci_version: NciVersion,
    rf_state: RfState,
    polling: TechMask,
    listening: bool,
    cards: Vec<(u16, SimCard)>,
    next_card_id: u16,
    poll_responses: Vec<PollResponse>,
    calls: HashMap<&'static str, usize>,
    selects: Vec<(u8, Protocol, RfInterface)>,
    faults: Faults,
    ees: Vec<EeInfo>,
    staged_routes: Vec<RoutingEntry>,
    committed_routes: Vec<RoutingEntry>,
    aids: Vec<(Vec<u8>, u8)>,
    config_parameters: HashMap<u8, Vec<u8>>,
    power_sub_state: Option<u8>,
    discovery_duration: Option<Duration>,
}

struct Inner {
    config: ConfigStore,
    entry_points: EntryPoints,
    state: Mutex<State>,
}

/// Simulated NFC controller implementing the HAL entry points.
#[derive(Clone)]
pub struct SimulatedController {
    inner: Arc<Inner>,
}

impl State {
    fn emit(&self, event: HalEvent) {
        match &self.events {
            Some(events) => {
                if events.send(event).is_err() {
                    warn!("event channel closed");
                }
            }
            None => warn!("controller not enabled, dropping {:?}", event),
        }
    }

    fn record(&mut self, entry_point: &'static str) {
        *self.calls.entry(entry_point).or_default() += 1;
    }

    fn card(&self, id: u16) -> Option<&SimCard> {
        self.cards.iter().find(|(card_id, _)| *card_id == id).map(|(_, card)| card)
    }

    fn card_mut(&mut self, id: u16) -> Option<&mut SimCard> {
        self.cards.iter_mut().find(|(card_id, _)| *card_id == id).map(|(_, card)| card)
    }

    /// Poll response and endpoint of the active remote endpoint. Returns
    /// `None` when nothing is active or the card left the field.
    fn active(&self) -> Option<(PollResponse, &SimEndpoint, RfInterface)> {
        let RfState::PollActive { endpoint, interface } = self.rf_state else {
            return None;
        };
        let response = *self.poll_responses.get(endpoint)?;
        let card = self.card(response.card)?;
        Some((response, card.endpoints.get(response.endpoint)?, interface))
    }

    fn active_card_mut(&mut self) -> Option<&mut SimCard> {
        let RfState::PollActive { endpoint, .. } = self.rf_state else {
            return None;
        };
        let response = *self.poll_responses.get(endpoint)?;
        self.card_mut(response.card)
    }

    /// Poll the field once. A single endpoint is activated directly;
    /// several endpoints are reported for the host to select.
    fn poll(&mut self) -> Option<(usize, RfInterface)> {
        if self.rf_state != RfState::Discovery {
            return None;
        }
        self.poll_responses = self
            .cards
            .iter()
            .flat_map(|(id, card)| {
                card.endpoints
                    .iter()
                    .enumerate()
                    .filter(|(_, endpoint)| {
                        self.polling.intersects(endpoint.tech_mode.technology_mask())
                    })
                    .map(move |(index, _)| PollResponse { card: *id, endpoint: index })
            })
            .collect();
        debug!(" > received {} poll response(s)", self.poll_responses.len());

        match self.poll_responses.len() {
            0 => None,
            1 => {
                let protocol = self.endpoint(0)?.protocol;
                let interface = RfInterface::for_protocol(protocol);
                self.rf_state = RfState::WaitForSelectResponse { endpoint: 0, interface };
                Some((0, interface))
            }
            count => {
                self.rf_state = RfState::WaitForHostSelect;
                for index in 0..count {
                    let Some(endpoint) = self.endpoint(index) else { continue };
                    let ntf = DiscoverNtf {
                        discovery_id: index as u8 + 1,
                        protocol: endpoint.protocol.into(),
                        tech_mode: tech_mode_code(endpoint.tech_mode),
                        tech_params: endpoint.tech_params.clone(),
                        more: index + 1 < count,
                    };
                    self.emit(HalEvent::DiscoverResult(ntf));
                }
                None
            }
        }
    }

    fn endpoint(&self, index: usize) -> Option<&SimEndpoint> {
        let response = self.poll_responses.get(index)?;
        self.card(response.card)?.endpoints.get(response.endpoint)
    }

    /// Complete the activation started by a select.
    fn activate(&mut self, endpoint: usize, interface: RfInterface) {
        if self.rf_state != (RfState::WaitForSelectResponse { endpoint, interface }) {
            debug!("activation of endpoint {} cancelled", endpoint);
            return;
        }
        let Some(remote) = self.endpoint(endpoint).cloned() else {
            debug!("endpoint {} left the field before activation", endpoint);
            self.rf_state = RfState::Discovery;
            return;
        };
        self.rf_state = RfState::PollActive { endpoint, interface };
        self.emit(HalEvent::Activated(ActivationNtf {
            discovery_id: endpoint as u8 + 1,
            interface,
            protocol: remote.protocol.into(),
            tech_mode: tech_mode_code(remote.tech_mode),
            tech_params: remote.tech_params,
            activation_params: if interface == RfInterface::IsoDep {
                remote.activation_params
            } else {
                vec![]
            },
        }));
    }

    /// Send a response on the static RF connection, segmented in data
    /// packets.
    fn respond(&self, response: &[u8]) {
        let mut chunks = response.chunks(MAX_DATA_PACKET_PAYLOAD_SIZE).peekable();
        if chunks.peek().is_none() {
            self.emit(HalEvent::Data { status: Status::Ok, payload: Bytes::new(), more: false });
        }
        while let Some(chunk) = chunks.next() {
            self.emit(HalEvent::Data {
                status: Status::Ok,
                payload: Bytes::copy_from_slice(chunk),
                more: chunks.peek().is_some(),
            });
        }
    }

    fn transceive(&mut self, data: &[u8], mifare: bool) -> Status {
        let Some((response, endpoint, interface)) = self.active() else {
            if matches!(self.rf_state, RfState::PollActive { .. }) {
                // The card left the field.
                self.emit(HalEvent::Data {
                    status: Status::RfTimeout,
                    payload: Bytes::new(),
                    more: false,
                });
                return Status::Ok;
            }
            return Status::Failed;
        };
        let protocol = endpoint.protocol;
        if mifare && self.faults.mifare_protocol_error {
            self.faults.mifare_protocol_error = false;
            self.emit(HalEvent::Data {
                status: Status::RfProtocolError,
                payload: Bytes::new(),
                more: false,
            });
            return Status::Ok;
        }
        let halt = matches!(
            (protocol, data),
            (_, [0x50, 0x00]) | (Protocol::IsoDep, [0xc2])
        );
        if halt || self.faults.mute_frames {
            debug!(" > no response");
            return Status::Ok;
        }
        let reply = match self.card(response.card).and_then(|card| card.responses.get(data)) {
            Some(reply) => reply.clone(),
            None if interface == RfInterface::IsoDep => vec![0x6a, 0x82],
            None => vec![0x00],
        };
        self.respond(&reply);
        Status::Ok
    }

    fn presence_check(&mut self) -> Status {
        if !matches!(self.rf_state, RfState::PollActive { .. }) {
            return Status::SemanticError;
        }
        if self.faults.silent_presence_checks {
            debug!(" > presence check unanswered");
            return Status::Ok;
        }
        let status = if self.faults.presence_failures > 0 {
            self.faults.presence_failures -= 1;
            Status::Failed
        } else if self.active().is_some() {
            Status::Ok
        } else {
            Status::RfTimeout
        };
        self.emit(HalEvent::PresenceChecked(status));
        Status::Ok
    }
}

fn tech_mode_code(mode: TechMode) -> u8 {
    match mode {
        TechMode::NfcAPassivePoll => 0x00,
        TechMode::NfcBPassivePoll => 0x01,
        TechMode::NfcFPassivePoll => 0x02,
        TechMode::NfcVPassivePoll => 0x06,
        TechMode::NfcAPassiveListen => 0x80,
        TechMode::NfcBPassiveListen => 0x81,
        TechMode::NfcFPassiveListen => 0x82,
    }
}

impl SimulatedController {
    /// Create a controller exporting every entry point.
    pub fn new(config: ConfigStore) -> Self {
        SimulatedController::with_entry_points(config, EntryPoints::all())
    }

    /// Create a controller exporting only `entry_points`.
    pub fn with_entry_points(config: ConfigStore, entry_points: EntryPoints) -> Self {
        SimulatedController {
            inner: Arc::new(Inner {
                config,
                entry_points,
                state: Mutex::new(State {
                    events: None,
                    nci_version: NciVersion::Version20,
                    rf_state: RfState::Idle,
                    polling: TechMask::empty(),
                    listening: false,
                    cards: vec![],
                    next_card_id: 1,
                    poll_responses: vec![],
                    calls: HashMap::new(),
                    selects: vec![],
                    faults: Faults::default(),
                    ees: vec![],
                    staged_routes: vec![],
                    committed_routes: vec![],
                    aids: vec![],
                    config_parameters: HashMap::new(),
                    power_sub_state: None,
                    discovery_duration: None,
                }),
            }),
        }
    }

    /// Set the NCI version reported at enable time.
    pub fn set_nci_version(&self, version: NciVersion) {
        self.inner.state.lock().nci_version = version;
    }

    /// Place a card in the field and poll. Returns the card identifier.
    pub fn present(&self, card: SimCard) -> u16 {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_card_id;
            state.next_card_id += 1;
            state.cards.push((id, card));
            id
        };
        self.poll_now();
        id
    }

    /// Remove a card from the field.
    pub fn remove(&self, card: u16) {
        self.inner.state.lock().cards.retain(|(id, _)| *id != card);
    }

    /// Run one poll cycle if discovery is running.
    pub fn poll_now(&self) {
        let activation = self.inner.state.lock().poll();
        if let Some((endpoint, interface)) = activation {
            self.inner.state.lock().activate(endpoint, interface);
        }
    }

    /// Number of calls to an entry point, by name.
    pub fn call_count(&self, entry_point: &str) -> usize {
        self.inner.state.lock().calls.get(entry_point).copied().unwrap_or(0)
    }

    /// Select commands received, in order.
    pub fn selects(&self) -> Vec<(u8, Protocol, RfInterface)> {
        self.inner.state.lock().selects.clone()
    }

    /// Discovery identifier of the active remote endpoint.
    pub fn active_discovery_id(&self) -> Option<u8> {
        match self.inner.state.lock().rf_state {
            RfState::PollActive { endpoint, .. } => Some(endpoint as u8 + 1),
            _ => None,
        }
    }

    /// True while RF discovery runs, including an active endpoint.
    pub fn is_discovering(&self) -> bool {
        self.inner.state.lock().rf_state != RfState::Idle
    }

    /// Drop raw frames without answering.
    pub fn set_mute_frames(&self, mute: bool) {
        self.inner.state.lock().faults.mute_frames = mute;
    }

    /// Report `count` failed target activations before the next
    /// activation.
    pub fn set_spurious_wakeups(&self, count: u32) {
        self.inner.state.lock().faults.spurious_wakeups = count;
    }

    /// Delay activations following a select.
    pub fn set_activation_delay(&self, delay: Option<Duration>) {
        self.inner.state.lock().faults.activation_delay = delay;
    }

    /// Never complete activations following a select.
    pub fn set_suppress_activation(&self, suppress: bool) {
        self.inner.state.lock().faults.suppress_activation = suppress;
    }

    /// Fail the next `count` presence checks.
    pub fn fail_presence_checks(&self, count: u32) {
        self.inner.state.lock().faults.presence_failures = count;
    }

    /// Accept presence checks without ever reporting their result.
    pub fn set_silent_presence_checks(&self, silent: bool) {
        self.inner.state.lock().faults.silent_presence_checks = silent;
    }

    /// Reject the next select command.
    pub fn reject_next_select(&self) {
        self.inner.state.lock().faults.reject_next_select = true;
    }

    /// Answer the next Mifare command with a protocol error.
    pub fn fail_next_mifare_transceive(&self) {
        self.inner.state.lock().faults.mifare_protocol_error = true;
    }

    /// Set the NFCEE inventory.
    pub fn set_ees(&self, ees: Vec<EeInfo>) {
        self.inner.state.lock().ees = ees;
    }

    /// Change one NFCEE and report it.
    pub fn change_ee(&self, info: EeInfo) {
        let mut state = self.inner.state.lock();
        match state.ees.iter_mut().find(|ee| ee.id == info.id) {
            Some(ee) => *ee = info,
            None => state.ees.push(info),
        }
        state.emit(HalEvent::Ee(EeEvent::InfoChanged(info)));
    }

    /// Routing table committed by the last update.
    pub fn committed_routes(&self) -> Vec<RoutingEntry> {
        self.inner.state.lock().committed_routes.clone()
    }

    /// AID routes, with their destination.
    pub fn aids(&self) -> Vec<(Vec<u8>, u8)> {
        self.inner.state.lock().aids.clone()
    }

    /// Value of a configuration parameter set by the host.
    pub fn config_parameter(&self, id: u8) -> Option<Vec<u8>> {
        self.inner.state.lock().config_parameters.get(&id).cloned()
    }

    /// Last power sub-state set by the host.
    pub fn power_sub_state(&self) -> Option<u8> {
        self.inner.state.lock().power_sub_state
    }

    /// Technologies polled and listen mode, as configured by the host.
    pub fn discovery_configuration(&self) -> (TechMask, bool) {
        let state = self.inner.state.lock();
        (state.polling, state.listening)
    }

    /// Discovery duration set by the host.
    pub fn discovery_duration(&self) -> Option<Duration> {
        self.inner.state.lock().discovery_duration
    }

    /// NDEF message currently stored on a card.
    pub fn ndef_message(&self, card: u16) -> Option<Vec<u8>> {
        let state = self.inner.state.lock();
        state.card(card)?.ndef.as_ref().map(|ndef| ndef.message.clone())
    }

    fn complete_select(&self, endpoint: usize, interface: RfInterface) {
        let mut state = self.inner.state.lock();
        for _ in 0..std::mem::take(&mut state.faults.spurious_wakeups) {
            state.emit(HalEvent::GenericError(Status::DiscoveryTargetActivationFailed));
        }
        if state.faults.suppress_activation {
            debug!(" > activation suppressed");
            return;
        }
        let Some(delay) = state.faults.activation_delay else {
            state.activate(endpoint, interface);
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.state.lock().activate(endpoint, interface);
                });
            }
            Err(_) => {
                warn!("no runtime for delayed activation");
                state.activate(endpoint, interface);
            }
        }
    }
}

impl NfcHal for SimulatedController {
    fn entry_points(&self) -> EntryPoints {
        self.inner.entry_points
    }

    fn enable(&self, events: HalEventSender) -> Status {
        let mut state = self.inner.state.lock();
        state.record("enable");
        debug!("+ enable()");
        state.events = Some(events);
        state.rf_state = RfState::Idle;
        let nci_version = state.nci_version;
        state.emit(HalEvent::Enabled { status: Status::Ok, nci_version });
        Status::Ok
    }

    fn disable(&self, graceful: bool) -> Status {
        let mut state = self.inner.state.lock();
        state.record("disable");
        debug!("+ disable({})", graceful);
        state.rf_state = RfState::Idle;
        state.emit(HalEvent::Disabled(Status::Ok));
        state.events = None;
        Status::Ok
    }

    fn enable_polling(&self, tech: TechMask) -> Status {
        let mut state = self.inner.state.lock();
        state.record("enable_polling");
        debug!("+ enable_polling({:?})", tech);
        state.polling = tech;
        state.emit(HalEvent::PollingEnabled(Status::Ok));
        Status::Ok
    }

    fn disable_polling(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("disable_polling");
        debug!("+ disable_polling()");
        state.polling = TechMask::empty();
        state.emit(HalEvent::PollingDisabled(Status::Ok));
        Status::Ok
    }

    fn set_listening(&self, enabled: bool) -> Status {
        let mut state = self.inner.state.lock();
        state.record("set_listening");
        debug!("+ set_listening({})", enabled);
        state.listening = enabled;
        state.emit(HalEvent::ConfigSet(Status::Ok));
        Status::Ok
    }

    fn start_rf_discovery(&self) -> Status {
        {
            let mut state = self.inner.state.lock();
            state.record("start_rf_discovery");
            debug!("+ start_rf_discovery()");
            if state.rf_state != RfState::Idle {
                debug!("start_rf_discovery received in {:?} state", state.rf_state);
                return Status::SemanticError;
            }
            state.rf_state = RfState::Discovery;
            state.emit(HalEvent::DiscoveryStarted(Status::Ok));
        }
        self.poll_now();
        Status::Ok
    }

    fn stop_rf_discovery(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("stop_rf_discovery");
        debug!("+ stop_rf_discovery()");
        if matches!(state.rf_state, RfState::PollActive { .. }) {
            state.emit(HalEvent::Deactivated {
                kind: DeactivationType::Idle,
                reason: DeactivationReason::DhRequest,
            });
        }
        state.rf_state = RfState::Idle;
        state.emit(HalEvent::DiscoveryStopped(Status::Ok));
        Status::Ok
    }

    fn set_discovery_duration(&self, duration: Duration) -> Status {
        let mut state = self.inner.state.lock();
        state.record("set_discovery_duration");
        debug!("+ set_discovery_duration({:?})", duration);
        state.discovery_duration = Some(duration);
        Status::Ok
    }

    fn set_config(&self, id: u8, value: &[u8]) -> Status {
        let mut state = self.inner.state.lock();
        state.record("set_config");
        debug!("+ set_config({:#04x}, {})", id, hex::encode(value));
        state.config_parameters.insert(id, value.to_vec());
        state.emit(HalEvent::ConfigSet(Status::Ok));
        Status::Ok
    }

    fn set_power_sub_state(&self, sub_state: u8) -> Status {
        let mut state = self.inner.state.lock();
        state.record("set_power_sub_state");
        debug!("+ set_power_sub_state({:#04x})", sub_state);
        if !state.nci_version.is_nci2() {
            return Status::NotSupported;
        }
        state.power_sub_state = Some(sub_state);
        state.emit(HalEvent::ConfigSet(Status::Ok));
        Status::Ok
    }

    fn select(&self, discovery_id: u8, protocol: Protocol, interface: RfInterface) -> Status {
        let endpoint = {
            let mut state = self.inner.state.lock();
            state.record("select");
            debug!("+ select({}, {:?}, {:?})", discovery_id, protocol, interface);
            state.selects.push((discovery_id, protocol, interface));

            if state.rf_state != RfState::WaitForHostSelect {
                debug!("select received in {:?} state", state.rf_state);
                return Status::SemanticError;
            }
            if std::mem::take(&mut state.faults.reject_next_select) {
                debug!(" > select rejected");
                return Status::Rejected;
            }
            // If the RF Discovery ID, RF Protocol or RF Interface is not
            // valid, the NFCC SHALL respond with STATUS_REJECTED.
            let endpoint = (discovery_id as usize).wrapping_sub(1);
            match state.endpoint(endpoint) {
                Some(remote) if remote.protocol == protocol => (),
                _ => {
                    debug!("select with invalid discovery id or protocol");
                    return Status::Rejected;
                }
            }
            state.rf_state = RfState::WaitForSelectResponse { endpoint, interface };
            state.emit(HalEvent::SelectResult(Status::Ok));
            endpoint
        };
        self.complete_select(endpoint, interface);
        Status::Ok
    }

    fn deactivate(&self, kind: DeactivationType) -> Status {
        use DeactivationType::*;

        let mut state = self.inner.state.lock();
        state.record("deactivate");
        debug!("+ deactivate({:?})", kind);
        let (status, next_state) = match (state.rf_state, kind) {
            (RfState::Idle, _) => (Status::SemanticError, RfState::Idle),
            (RfState::Discovery, Idle) => (Status::Ok, RfState::Idle),
            (RfState::Discovery, _) => (Status::SemanticError, RfState::Discovery),
            (RfState::PollActive { .. }, Idle) => (Status::Ok, RfState::Idle),
            (RfState::PollActive { .. }, Sleep | SleepAf) => {
                (Status::Ok, RfState::WaitForHostSelect)
            }
            (RfState::PollActive { .. }, Discovery) => (Status::Ok, RfState::Discovery),
            (RfState::WaitForHostSelect | RfState::WaitForSelectResponse { .. }, Idle) => {
                (Status::Ok, RfState::Idle)
            }
            (RfState::WaitForHostSelect | RfState::WaitForSelectResponse { .. }, Discovery) => {
                (Status::Ok, RfState::Discovery)
            }
            (current @ (RfState::WaitForHostSelect | RfState::WaitForSelectResponse { .. }), _) => {
                (Status::SemanticError, current)
            }
        };
        if status.is_ok() {
            state.rf_state = next_state;
            state.emit(HalEvent::Deactivated { kind, reason: DeactivationReason::DhRequest });
        }
        status
    }

    fn send_raw_frame(&self, data: &[u8]) -> Status {
        let mut state = self.inner.state.lock();
        state.record("send_raw_frame");
        debug!("+ send_raw_frame({})", hex::encode(data));
        state.transceive(data, false)
    }

    fn detect_ndef(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("detect_ndef");
        debug!("+ detect_ndef()");
        let Some(card) = state.active_card_mut() else { return Status::Failed };
        let result = match &card.ndef {
            Some(ndef) => {
                let mut flags = NdefFlags::SUPPORTED | NdefFlags::FORMATTED;
                flags.set(NdefFlags::READ_ONLY, ndef.read_only);
                NdefDetectResult {
                    status: Status::Ok,
                    max_size: ndef.max_size,
                    current_size: ndef.message.len() as u32,
                    flags,
                }
            }
            None => NdefDetectResult {
                status: Status::Failed,
                max_size: 0,
                current_size: 0,
                flags: if card.formatable { NdefFlags::FORMATABLE } else { NdefFlags::UNKNOWN },
            },
        };
        state.emit(HalEvent::NdefDetected(result));
        Status::Ok
    }

    fn read_ndef(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("read_ndef");
        debug!("+ read_ndef()");
        let Some(card) = state.active_card_mut() else { return Status::Failed };
        let event = match &card.ndef {
            Some(ndef) => HalEvent::NdefRead {
                status: Status::Ok,
                message: Bytes::copy_from_slice(&ndef.message),
            },
            None => HalEvent::NdefRead { status: Status::Failed, message: Bytes::new() },
        };
        state.emit(event);
        Status::Ok
    }

    fn write_ndef(&self, message: &[u8]) -> Status {
        let mut state = self.inner.state.lock();
        state.record("write_ndef");
        debug!("+ write_ndef({})", hex::encode(message));
        let Some(card) = state.active_card_mut() else { return Status::Failed };
        let status = match card.ndef.as_mut() {
            Some(ndef) if !ndef.read_only && message.len() as u32 <= ndef.max_size => {
                ndef.message = message.to_vec();
                Status::Ok
            }
            _ => Status::Rejected,
        };
        state.emit(HalEvent::NdefWritten(status));
        Status::Ok
    }

    fn format_ndef(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("format_ndef");
        debug!("+ format_ndef()");
        let Some(card) = state.active_card_mut() else { return Status::Failed };
        let status = if card.formatable {
            card.formatable = false;
            card.ndef = Some(SimNdef {
                message: vec![],
                max_size: FORMATTED_NDEF_SIZE,
                read_only: false,
                hard_lockable: true,
            });
            Status::Ok
        } else {
            Status::Rejected
        };
        state.emit(HalEvent::NdefFormatted(status));
        Status::Ok
    }

    fn set_read_only(&self, hard_lock: bool) -> Status {
        let mut state = self.inner.state.lock();
        state.record("set_read_only");
        debug!("+ set_read_only({})", hard_lock);
        let Some(card) = state.active_card_mut() else { return Status::Failed };
        let status = match card.ndef.as_mut() {
            Some(ndef) if ndef.hard_lockable || !hard_lock => {
                ndef.read_only = true;
                Status::Ok
            }
            _ => Status::Rejected,
        };
        state.emit(HalEvent::ReadOnlySet(status));
        Status::Ok
    }

    fn presence_check(&self, algorithm: PresenceCheckAlgorithm) -> Status {
        let mut state = self.inner.state.lock();
        state.record("presence_check");
        debug!("+ presence_check({:?})", algorithm);
        state.presence_check()
    }

    fn register_ndef_handler(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("register_ndef_handler");
        debug!("+ register_ndef_handler()");
        Status::Ok
    }

    fn ee_register(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("ee_register");
        debug!("+ ee_register()");
        state.emit(HalEvent::Ee(EeEvent::Registered(Status::Ok)));
        Status::Ok
    }

    fn ee_deregister(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("ee_deregister");
        debug!("+ ee_deregister()");
        state.emit(HalEvent::Ee(EeEvent::Deregistered(Status::Ok)));
        Status::Ok
    }

    fn ee_get_info(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("ee_get_info");
        debug!("+ ee_get_info()");
        let ees = state.ees.clone();
        state.emit(HalEvent::Ee(EeEvent::Discovered(ees)));
        Status::Ok
    }

    fn set_ee_listen_tech(&self, ee: u8, tech: TechMask) -> Status {
        let mut state = self.inner.state.lock();
        state.record("set_ee_listen_tech");
        debug!("+ set_ee_listen_tech({:#04x}, {:?})", ee, tech);
        let status =
            if state.ees.iter().any(|info| info.id == ee) { Status::Ok } else { Status::Rejected };
        state.emit(HalEvent::Ee(EeEvent::ListenConfigured(status)));
        Status::Ok
    }

    fn set_host_listen_tech(&self, tech: TechMask) -> Status {
        let mut state = self.inner.state.lock();
        state.record("set_host_listen_tech");
        debug!("+ set_host_listen_tech({:?})", tech);
        state.emit(HalEvent::Ee(EeEvent::ListenConfigured(Status::Ok)));
        Status::Ok
    }

    fn clear_routing(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("clear_routing");
        debug!("+ clear_routing()");
        state.staged_routes.clear();
        state.emit(HalEvent::Ee(EeEvent::RoutingCleared(Status::Ok)));
        Status::Ok
    }

    fn set_routing(&self, entry: &RoutingEntry) -> Status {
        let mut state = self.inner.state.lock();
        state.record("set_routing");
        debug!("+ set_routing({:?})", entry);
        state.staged_routes.push(*entry);
        state.emit(HalEvent::Ee(EeEvent::RoutingSet(Status::Ok)));
        Status::Ok
    }

    fn add_aid_routing(&self, aid: &[u8], route: u8, power: PowerState, info: u8) -> Status {
        let mut state = self.inner.state.lock();
        state.record("add_aid_routing");
        debug!(
            "+ add_aid_routing({}, {:#04x}, {:?}, {:#04x})",
            hex::encode(aid),
            route,
            power,
            info
        );
        state.aids.retain(|(existing, _)| existing != aid);
        state.aids.push((aid.to_vec(), route));
        state.emit(HalEvent::Ee(EeEvent::AidAdded(Status::Ok)));
        Status::Ok
    }

    fn remove_aid_routing(&self, aid: &[u8]) -> Status {
        let mut state = self.inner.state.lock();
        state.record("remove_aid_routing");
        debug!("+ remove_aid_routing({})", hex::encode(aid));
        let before = state.aids.len();
        state.aids.retain(|(existing, _)| existing != aid);
        let status = if state.aids.len() < before { Status::Ok } else { Status::Rejected };
        state.emit(HalEvent::Ee(EeEvent::AidRemoved(status)));
        Status::Ok
    }

    fn set_system_code_routing(&self, system_code: u16, route: u8, power: PowerState) -> Status {
        let mut state = self.inner.state.lock();
        state.record("set_system_code_routing");
        debug!("+ set_system_code_routing({:#06x}, {:#04x}, {:?})", system_code, route, power);
        state.emit(HalEvent::Ee(EeEvent::RoutingSet(Status::Ok)));
        Status::Ok
    }

    fn update_routing(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("update_routing");
        debug!("+ update_routing()");
        state.committed_routes = state.staged_routes.clone();
        state.emit(HalEvent::Ee(EeEvent::RoutingUpdated(Status::Ok)));
        Status::Ok
    }

    fn config_get(&self, key: &str) -> Option<ConfigValue> {
        self.inner.config.get(key).cloned()
    }

    fn config_has_key(&self, key: &str) -> bool {
        self.inner.config.has_key(key)
    }

    fn mifare_extension(&self) -> Option<Arc<dyn MifareExtension>> {
        Some(Arc::new(self.clone()))
    }
}

impl MifareExtension for SimulatedController {
    fn transceive(&self, data: &[u8]) -> Status {
        let mut state = self.inner.state.lock();
        state.record("mifare_transceive");
        debug!("+ mifare_transceive({})", hex::encode(data));
        state.transceive(data, true)
    }

    fn presence_check(&self) -> Status {
        let mut state = self.inner.state.lock();
        state.record("mifare_presence_check");
        debug!("+ mifare_presence_check()");
        state.presence_check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn enabled(sim: &SimulatedController) -> mpsc::UnboundedReceiver<HalEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(sim.enable(tx), Status::Ok);
        assert!(matches!(rx.try_recv(), Ok(HalEvent::Enabled { status: Status::Ok, .. })));
        assert_eq!(sim.enable_polling(TechMask::all()), Status::Ok);
        assert_eq!(rx.try_recv(), Ok(HalEvent::PollingEnabled(Status::Ok)));
        rx
    }

    #[test]
    fn single_endpoint_is_activated_automatically() {
        let sim = SimulatedController::new(ConfigStore::new());
        let mut rx = enabled(&sim);
        sim.present(SimCard::iso_dep_a(&[1, 2, 3, 4]));
        assert_eq!(sim.start_rf_discovery(), Status::Ok);
        assert_eq!(rx.try_recv(), Ok(HalEvent::DiscoveryStarted(Status::Ok)));
        match rx.try_recv() {
            Ok(HalEvent::Activated(ntf)) => {
                assert_eq!(ntf.discovery_id, 1);
                assert_eq!(ntf.interface, RfInterface::IsoDep);
                assert!(!ntf.activation_params.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sim.active_discovery_id(), Some(1));
    }

    #[test]
    fn several_endpoints_wait_for_host_select() {
        let sim = SimulatedController::new(ConfigStore::new());
        let mut rx = enabled(&sim);
        sim.start_rf_discovery();
        let _ = rx.try_recv();
        sim.present(SimCard::multi_protocol(&[1, 2, 3, 4]));
        let first = rx.try_recv();
        let second = rx.try_recv();
        assert!(matches!(first, Ok(HalEvent::DiscoverResult(DiscoverNtf { more: true, .. }))));
        assert!(matches!(second, Ok(HalEvent::DiscoverResult(DiscoverNtf { more: false, .. }))));

        assert_eq!(sim.select(2, Protocol::IsoDep, RfInterface::IsoDep), Status::Rejected);
        assert_eq!(sim.select(2, Protocol::Mifare, RfInterface::Mifare), Status::Ok);
        assert_eq!(rx.try_recv(), Ok(HalEvent::SelectResult(Status::Ok)));
        assert!(matches!(rx.try_recv(), Ok(HalEvent::Activated(_))));
    }

    #[test]
    fn deactivation_follows_rf_state_machine() {
        let sim = SimulatedController::new(ConfigStore::new());
        let mut rx = enabled(&sim);
        assert_eq!(sim.deactivate(DeactivationType::Sleep), Status::SemanticError);
        sim.start_rf_discovery();
        sim.present(SimCard::type2(&[4, 1, 2, 3, 4, 5, 6]));
        while rx.try_recv().is_ok() {}
        assert_eq!(sim.deactivate(DeactivationType::Sleep), Status::Ok);
        assert_eq!(
            rx.try_recv(),
            Ok(HalEvent::Deactivated {
                kind: DeactivationType::Sleep,
                reason: DeactivationReason::DhRequest
            })
        );
        assert_eq!(sim.deactivate(DeactivationType::Sleep), Status::SemanticError);
        assert_eq!(sim.select(1, Protocol::T2t, RfInterface::Frame), Status::Ok);
        assert_eq!(sim.active_discovery_id(), Some(1));
    }

    #[test]
    fn raw_frames_are_answered_and_segmented() {
        let long = vec![0xab; 300];
        let sim = SimulatedController::new(ConfigStore::new());
        let mut rx = enabled(&sim);
        sim.start_rf_discovery();
        sim.present(SimCard::iso_dep_a(&[1, 2, 3, 4]).with_response(&[0x00, 0xb0], &long));
        while rx.try_recv().is_ok() {}
        sim.send_raw_frame(&[0x00, 0xb0]);
        match (rx.try_recv(), rx.try_recv()) {
            (
                Ok(HalEvent::Data { payload: first, more: true, .. }),
                Ok(HalEvent::Data { payload: second, more: false, .. }),
            ) => assert_eq!(first.len() + second.len(), 300),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sim.call_count("send_raw_frame"), 1);
    }
}
