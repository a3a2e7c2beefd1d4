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

//! NCI Hardware Abstraction Layer boundary.
//!
//! Commands are issued through the named entry points of [`NfcHal`] and
//! return the synchronous command status only. Completions and
//! notifications are delivered later as [`HalEvent`]s on the channel
//! registered with [`NfcHal::enable`].

use crate::config::{ConfigValue, PresenceCheckAlgorithm};
use crate::nci::{
    DeactivationReason, DeactivationType, NciVersion, PowerState, Protocol, RfInterface, Status,
    TechMask,
};
use crate::routing::RoutingEntry;
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

mod loader;
pub mod native;
pub mod sim;

pub use loader::{HalFactory, HalLoader, DEFAULT_HAL_LIBRARY};
pub use native::NativeHal;

/// Channel on which the HAL delivers its events.
pub type HalEventSender = mpsc::UnboundedSender<HalEvent>;

bitflags! {
    /// Entry points exported by a HAL library.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EntryPoints: u64 {
        const ENABLE = 1 << 0;
        const DISABLE = 1 << 1;
        const ENABLE_POLLING = 1 << 2;
        const DISABLE_POLLING = 1 << 3;
        const SET_LISTENING = 1 << 4;
        const START_RF_DISCOVERY = 1 << 5;
        const STOP_RF_DISCOVERY = 1 << 6;
        const SET_DISCOVERY_DURATION = 1 << 7;
        const SET_CONFIG = 1 << 8;
        const SET_POWER_SUB_STATE = 1 << 9;
        const SELECT = 1 << 10;
        const DEACTIVATE = 1 << 11;
        const SEND_RAW_FRAME = 1 << 12;
        const DETECT_NDEF = 1 << 13;
        const READ_NDEF = 1 << 14;
        const WRITE_NDEF = 1 << 15;
        const FORMAT_NDEF = 1 << 16;
        const SET_READ_ONLY = 1 << 17;
        const PRESENCE_CHECK = 1 << 18;
        const REGISTER_NDEF_HANDLER = 1 << 19;
        const EE_REGISTER = 1 << 20;
        const EE_DEREGISTER = 1 << 21;
        const EE_GET_INFO = 1 << 22;
        const SET_EE_LISTEN_TECH = 1 << 23;
        const SET_HOST_LISTEN_TECH = 1 << 24;
        const CLEAR_ROUTING = 1 << 25;
        const SET_ROUTING = 1 << 26;
        const ADD_AID_ROUTING = 1 << 27;
        const REMOVE_AID_ROUTING = 1 << 28;
        const SET_SYSTEM_CODE_ROUTING = 1 << 29;
        const UPDATE_ROUTING = 1 << 30;
        const CONFIG_GET = 1 << 31;
        const CONFIG_HAS_KEY = 1 << 32;
        const MIFARE_TRANSCEIVE = 1 << 40;
        const MIFARE_PRESENCE_CHECK = 1 << 41;
    }
}

impl EntryPoints {
    /// Vendor proprietary entry points for Mifare Classic cards.
    pub const MIFARE: EntryPoints =
        EntryPoints::MIFARE_TRANSCEIVE.union(EntryPoints::MIFARE_PRESENCE_CHECK);

    /// Entry points every HAL library must export.
    pub const REQUIRED: EntryPoints = EntryPoints::all().difference(EntryPoints::MIFARE);

    /// Name of the first entry point of `required` not exported.
    pub fn first_missing(self, required: EntryPoints) -> Option<&'static str> {
        required.difference(self).iter_names().next().map(|(name, _)| name)
    }
}

bitflags! {
    /// Attributes reported by NDEF detection.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct NdefFlags: u8 {
        /// The tag supports NDEF.
        const SUPPORTED = 0x01;
        /// The NDEF support could not be determined.
        const UNKNOWN = 0x02;
        /// The tag can be formatted for NDEF.
        const FORMATABLE = 0x04;
        /// The tag is formatted for NDEF.
        const FORMATTED = 0x08;
        /// The NDEF area is read-only.
        const READ_ONLY = 0x10;
    }
}

/// RF_DISCOVER_NTF: one endpoint/protocol found during polling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoverNtf {
    /// RF discovery identifier assigned by the controller.
    pub discovery_id: u8,
    /// Raw RF protocol code.
    pub protocol: u8,
    /// Raw RF technology and mode code.
    pub tech_mode: u8,
    /// Technology specific parameters, [NCI] 7.1.
    pub tech_params: Vec<u8>,
    /// More notifications follow for the same poll.
    pub more: bool,
}

/// RF_INTF_ACTIVATED_NTF.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationNtf {
    /// RF discovery identifier of the activated endpoint.
    pub discovery_id: u8,
    /// Activated RF interface.
    pub interface: RfInterface,
    /// Raw RF protocol code.
    pub protocol: u8,
    /// Raw RF technology and mode code of the activation.
    pub tech_mode: u8,
    /// Technology specific parameters, [NCI] 7.1.
    pub tech_params: Vec<u8>,
    /// Activation parameters (RATS / ATTRIB response), [NCI] 7.2.
    pub activation_params: Vec<u8>,
}

/// Result of NDEF detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NdefDetectResult {
    /// Detection status.
    pub status: Status,
    /// Capacity of the NDEF area.
    pub max_size: u32,
    /// Size of the current NDEF message.
    pub current_size: u32,
    /// NDEF attributes.
    pub flags: NdefFlags,
}

/// Operational status of an NFCEE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EeStatus {
    Active,
    Inactive,
    Removed,
}

/// Inventory entry of an NFCEE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EeInfo {
    /// NFCEE identifier.
    pub id: u8,
    /// Operational status.
    pub status: EeStatus,
    /// Technologies the NFCEE can listen on.
    pub listen_tech: TechMask,
    /// Power states in which the NFCEE can be routed to.
    pub power_states: PowerState,
}

impl EeInfo {
    /// True if the NFCEE is enabled.
    pub fn is_active(&self) -> bool {
        self.status == EeStatus::Active
    }
}

/// NFCEE management and routing notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EeEvent {
    Registered(Status),
    Deregistered(Status),
    Discovered(Vec<EeInfo>),
    InfoChanged(EeInfo),
    ListenConfigured(Status),
    RoutingCleared(Status),
    RoutingSet(Status),
    RoutingUpdated(Status),
    AidAdded(Status),
    AidRemoved(Status),
}

/// Events delivered by the HAL on its callback context.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum HalEvent {
    Enabled { status: Status, nci_version: NciVersion },
    Disabled(Status),
    PollingEnabled(Status),
    PollingDisabled(Status),
    DiscoveryStarted(Status),
    DiscoveryStopped(Status),
    ConfigSet(Status),
    DiscoverResult(DiscoverNtf),
    SelectResult(Status),
    /// CORE_GENERIC_ERROR_NTF, e.g. a failed target activation.
    GenericError(Status),
    Activated(ActivationNtf),
    Deactivated { kind: DeactivationType, reason: DeactivationReason },
    /// Data received on the RF connection. `more` is set while the
    /// response is chained over several events.
    Data { status: Status, payload: Bytes, more: bool },
    NdefDetected(NdefDetectResult),
    NdefRead { status: Status, message: Bytes },
    NdefWritten(Status),
    NdefFormatted(Status),
    ReadOnlySet(Status),
    PresenceChecked(Status),
    Ee(EeEvent),
}

/// Named entry points of a HAL library.
pub trait NfcHal: Send + Sync {
    /// Entry points exported by the library.
    fn entry_points(&self) -> EntryPoints;

    /// Bring up the controller; events are delivered on `events`.
    fn enable(&self, events: HalEventSender) -> Status;
    /// Shut the controller down.
    fn disable(&self, graceful: bool) -> Status;
    /// Enable polling for the given technologies.
    fn enable_polling(&self, tech: TechMask) -> Status;
    /// Disable polling.
    fn disable_polling(&self) -> Status;
    /// Enable or disable listen mode (disabled in reader mode).
    fn set_listening(&self, enabled: bool) -> Status;
    /// Start RF discovery.
    fn start_rf_discovery(&self) -> Status;
    /// Stop RF discovery.
    fn stop_rf_discovery(&self) -> Status;
    /// Set the duration of one discovery cycle.
    fn set_discovery_duration(&self, duration: Duration) -> Status;
    /// CORE_SET_CONFIG_CMD for one parameter.
    fn set_config(&self, id: u8, value: &[u8]) -> Status;
    /// CORE_SET_POWER_SUB_STATE_CMD.
    fn set_power_sub_state(&self, sub_state: u8) -> Status;

    /// RF_DISCOVER_SELECT_CMD.
    fn select(&self, discovery_id: u8, protocol: Protocol, interface: RfInterface) -> Status;
    /// RF_DEACTIVATE_CMD.
    fn deactivate(&self, kind: DeactivationType) -> Status;
    /// Send a frame on the static RF connection.
    fn send_raw_frame(&self, data: &[u8]) -> Status;
    /// Start NDEF detection on the activated tag.
    fn detect_ndef(&self) -> Status;
    /// Read the NDEF message of the activated tag.
    fn read_ndef(&self) -> Status;
    /// Write an NDEF message to the activated tag.
    fn write_ndef(&self, message: &[u8]) -> Status;
    /// Format the activated tag for NDEF.
    fn format_ndef(&self) -> Status;
    /// Make the NDEF area read-only.
    fn set_read_only(&self, hard_lock: bool) -> Status;
    /// Check that the activated tag is still in the field.
    fn presence_check(&self, algorithm: PresenceCheckAlgorithm) -> Status;
    /// Register the default NDEF type handler.
    fn register_ndef_handler(&self) -> Status;

    /// Register for NFCEE events.
    fn ee_register(&self) -> Status;
    /// Deregister from NFCEE events.
    fn ee_deregister(&self) -> Status;
    /// Request the NFCEE inventory.
    fn ee_get_info(&self) -> Status;
    /// Configure the technologies an NFCEE listens on.
    fn set_ee_listen_tech(&self, ee: u8, tech: TechMask) -> Status;
    /// Configure the technologies the host listens on.
    fn set_host_listen_tech(&self, tech: TechMask) -> Status;
    /// Clear the technology and protocol routes.
    fn clear_routing(&self) -> Status;
    /// Stage one technology or protocol route.
    fn set_routing(&self, entry: &RoutingEntry) -> Status;
    /// Stage an AID route.
    fn add_aid_routing(&self, aid: &[u8], route: u8, power: PowerState, info: u8) -> Status;
    /// Remove an AID route.
    fn remove_aid_routing(&self, aid: &[u8]) -> Status;
    /// Stage a system code route.
    fn set_system_code_routing(&self, system_code: u16, route: u8, power: PowerState) -> Status;
    /// Commit the staged routing table.
    fn update_routing(&self) -> Status;

    /// Read a configuration key.
    fn config_get(&self, key: &str) -> Option<ConfigValue>;
    /// Check for a configuration key.
    fn config_has_key(&self, key: &str) -> bool;

    /// Vendor proprietary Mifare Classic entry points.
    fn mifare_extension(&self) -> Option<Arc<dyn MifareExtension>> {
        None
    }
}

/// Vendor proprietary entry points for Mifare Classic cards, which do
/// not follow the generic frame semantics. Responses are delivered as
/// [`HalEvent::Data`] and [`HalEvent::PresenceChecked`].
pub trait MifareExtension: Send + Sync {
    /// Send a Mifare command.
    fn transceive(&self, data: &[u8]) -> Status;
    /// Check that the Mifare card is still present.
    fn presence_check(&self) -> Status;
}

/// Resolve the Mifare extension once, only if the library exports it.
pub fn resolve_mifare(hal: &dyn NfcHal) -> Option<Arc<dyn MifareExtension>> {
    if hal.entry_points().contains(EntryPoints::MIFARE) {
        hal.mifare_extension()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mifare_entry_points_are_optional() {
        assert!(!EntryPoints::REQUIRED.intersects(EntryPoints::MIFARE));
        assert_eq!(EntryPoints::REQUIRED.first_missing(EntryPoints::REQUIRED), None);
    }

    #[test]
    fn first_missing_names_the_entry_point() {
        let exported = EntryPoints::REQUIRED.difference(EntryPoints::SELECT);
        assert_eq!(exported.first_missing(EntryPoints::REQUIRED), Some("SELECT"));
    }
}
