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

//! NCI protocol vocabulary shared by the HAL boundary and the adapters.

use bitflags::bitflags;
use std::fmt;

/// Status codes reported by the controller for commands and notifications.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Status {
    Ok,
    Rejected,
    MessageCorrupted,
    Failed,
    NotInitialized,
    SyntaxError,
    SemanticError,
    InvalidParam,
    NotSupported,
    Busy,
    Timeout,
    DiscoveryTargetActivationFailed,
    RfTransmissionError,
    RfProtocolError,
    RfTimeout,
    Unknown(u8),
}

impl Status {
    /// Return true for the only successful status.
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Status::Ok,
            0x01 => Status::Rejected,
            0x02 => Status::MessageCorrupted,
            0x03 => Status::Failed,
            0x04 => Status::NotInitialized,
            0x05 => Status::SyntaxError,
            0x06 => Status::SemanticError,
            0x09 => Status::InvalidParam,
            0x0b => Status::NotSupported,
            0xa3 => Status::DiscoveryTargetActivationFailed,
            0xb0 => Status::RfTransmissionError,
            0xb1 => Status::RfProtocolError,
            0xb2 => Status::RfTimeout,
            0xe0 => Status::Busy,
            0xe3 => Status::Timeout,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => 0x00,
            Status::Rejected => 0x01,
            Status::MessageCorrupted => 0x02,
            Status::Failed => 0x03,
            Status::NotInitialized => 0x04,
            Status::SyntaxError => 0x05,
            Status::SemanticError => 0x06,
            Status::InvalidParam => 0x09,
            Status::NotSupported => 0x0b,
            Status::DiscoveryTargetActivationFailed => 0xa3,
            Status::RfTransmissionError => 0xb0,
            Status::RfProtocolError => 0xb1,
            Status::RfTimeout => 0xb2,
            Status::Busy => 0xe0,
            Status::Timeout => 0xe3,
            Status::Unknown(code) => code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#04x})", self, u8::from(*self))
    }
}

/// NCI version reported by the controller at enable time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum NciVersion {
    Version10,
    Version11,
    Version20,
}

impl NciVersion {
    /// Controllers implementing NCI 2.0 support power sub-states and
    /// the halt-before-reselect sequence.
    pub fn is_nci2(self) -> bool {
        self >= NciVersion::Version20
    }
}

impl TryFrom<u8> for NciVersion {
    type Error = u8;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x10 => NciVersion::Version10,
            0x11 => NciVersion::Version11,
            0x20 => NciVersion::Version20,
            _ => return Err(code),
        })
    }
}

/// RF protocols, [NCI] Table 133. `Mifare` is the proprietary
/// Mifare Classic protocol value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Protocol {
    Undetermined,
    T1t,
    T2t,
    T3t,
    IsoDep,
    NfcDep,
    T5t,
    Mifare,
}

impl TryFrom<u8> for Protocol {
    type Error = u8;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => Protocol::Undetermined,
            0x01 => Protocol::T1t,
            0x02 => Protocol::T2t,
            0x03 => Protocol::T3t,
            0x04 => Protocol::IsoDep,
            0x05 => Protocol::NfcDep,
            0x06 => Protocol::T5t,
            0x80 => Protocol::Mifare,
            _ => return Err(code),
        })
    }
}

impl From<Protocol> for u8 {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Undetermined => 0x00,
            Protocol::T1t => 0x01,
            Protocol::T2t => 0x02,
            Protocol::T3t => 0x03,
            Protocol::IsoDep => 0x04,
            Protocol::NfcDep => 0x05,
            Protocol::T5t => 0x06,
            Protocol::Mifare => 0x80,
        }
    }
}

/// RF technology and mode, [NCI] Table 132. Only the poll modes are
/// reported for tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TechMode {
    NfcAPassivePoll,
    NfcBPassivePoll,
    NfcFPassivePoll,
    NfcVPassivePoll,
    NfcAPassiveListen,
    NfcBPassiveListen,
    NfcFPassiveListen,
}

impl TechMode {
    /// Technology bit matching this mode.
    pub fn technology_mask(self) -> TechMask {
        match self {
            TechMode::NfcAPassivePoll | TechMode::NfcAPassiveListen => TechMask::A,
            TechMode::NfcBPassivePoll | TechMode::NfcBPassiveListen => TechMask::B,
            TechMode::NfcFPassivePoll | TechMode::NfcFPassiveListen => TechMask::F,
            TechMode::NfcVPassivePoll => TechMask::V,
        }
    }
}

impl TryFrom<u8> for TechMode {
    type Error = u8;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => TechMode::NfcAPassivePoll,
            0x01 => TechMode::NfcBPassivePoll,
            0x02 => TechMode::NfcFPassivePoll,
            0x06 => TechMode::NfcVPassivePoll,
            0x80 => TechMode::NfcAPassiveListen,
            0x81 => TechMode::NfcBPassiveListen,
            0x82 => TechMode::NfcFPassiveListen,
            _ => return Err(code),
        })
    }
}

/// RF interfaces, [NCI] Table 134. `Mifare` is the proprietary
/// interface used for Mifare Classic cards.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RfInterface {
    NfceeDirect,
    Frame,
    IsoDep,
    NfcDep,
    Mifare,
}

impl From<RfInterface> for u8 {
    fn from(interface: RfInterface) -> Self {
        match interface {
            RfInterface::NfceeDirect => 0x00,
            RfInterface::Frame => 0x01,
            RfInterface::IsoDep => 0x02,
            RfInterface::NfcDep => 0x03,
            RfInterface::Mifare => 0x80,
        }
    }
}

impl TryFrom<u8> for RfInterface {
    type Error = u8;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => RfInterface::NfceeDirect,
            0x01 => RfInterface::Frame,
            0x02 => RfInterface::IsoDep,
            0x03 => RfInterface::NfcDep,
            0x80 => RfInterface::Mifare,
            _ => return Err(code),
        })
    }
}

impl RfInterface {
    /// Interface used to activate a discovered endpoint with the given
    /// protocol. Mirrors the default RF interface mapping of [NCI] 6.2
    /// with the proprietary Mifare mapping.
    pub fn for_protocol(protocol: Protocol) -> RfInterface {
        match protocol {
            Protocol::IsoDep => RfInterface::IsoDep,
            Protocol::NfcDep => RfInterface::NfcDep,
            Protocol::Mifare => RfInterface::Mifare,
            _ => RfInterface::Frame,
        }
    }
}

/// Deactivation types of RF_DEACTIVATE_CMD.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DeactivationType {
    Idle,
    Sleep,
    SleepAf,
    Discovery,
}

impl TryFrom<u8> for DeactivationType {
    type Error = u8;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => DeactivationType::Idle,
            0x01 => DeactivationType::Sleep,
            0x02 => DeactivationType::SleepAf,
            0x03 => DeactivationType::Discovery,
            _ => return Err(code),
        })
    }
}

impl From<DeactivationType> for u8 {
    fn from(kind: DeactivationType) -> Self {
        match kind {
            DeactivationType::Idle => 0x00,
            DeactivationType::Sleep => 0x01,
            DeactivationType::SleepAf => 0x02,
            DeactivationType::Discovery => 0x03,
        }
    }
}

impl DeactivationType {
    /// Sleep deactivations keep the endpoint selectable.
    pub fn is_sleep(self) -> bool {
        matches!(self, DeactivationType::Sleep | DeactivationType::SleepAf)
    }
}

/// Deactivation reasons of RF_DEACTIVATE_NTF.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DeactivationReason {
    DhRequest,
    EndpointRequest,
    RfLinkLoss,
    NfcBBadAfi,
    DhRequestFailed,
}

impl TryFrom<u8> for DeactivationReason {
    type Error = u8;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => DeactivationReason::DhRequest,
            0x01 => DeactivationReason::EndpointRequest,
            0x02 => DeactivationReason::RfLinkLoss,
            0x03 => DeactivationReason::NfcBBadAfi,
            0x04 => DeactivationReason::DhRequestFailed,
            _ => return Err(code),
        })
    }
}

/// Technology classes exposed by a tag to the dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum Technology {
    NfcA,
    NfcB,
    NfcF,
    NfcV,
    IsoDep,
    Ndef,
    NdefFormatable,
    MifareClassic,
    MifareUltralight,
    NfcBarcode,
    Unknown,
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Technology::NfcA => "NFC-A",
            Technology::NfcB => "NFC-B",
            Technology::NfcF => "NFC-F",
            Technology::NfcV => "NFC-V",
            Technology::IsoDep => "ISO-DEP",
            Technology::Ndef => "NDEF",
            Technology::NdefFormatable => "NDEF-FORMATABLE",
            Technology::MifareClassic => "MIFARE-CLASSIC",
            Technology::MifareUltralight => "MIFARE-ULTRALIGHT",
            Technology::NfcBarcode => "NFC-BARCODE",
            Technology::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// RF technologies used for polling and listen configuration.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct TechMask: u8 {
        /// NFC-A.
        const A = 1 << 0;
        /// NFC-B.
        const B = 1 << 1;
        /// NFC-F.
        const F = 1 << 2;
        /// NFC-V (ISO 15693).
        const V = 1 << 3;
    }
}

impl TechMask {
    /// Technologies that may appear in a technology routing entry.
    pub const ROUTABLE: TechMask = TechMask::A.union(TechMask::B).union(TechMask::F);
}

bitflags! {
    /// Protocols used in protocol routing entries.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ProtocolMask: u8 {
        /// ISO-DEP / ISO 7816 APDU traffic.
        const ISO_DEP = 1 << 0;
        /// Type 3 tag (Felica).
        const T3T = 1 << 1;
        /// NFC-DEP.
        const NFC_DEP = 1 << 2;
    }
}

bitflags! {
    /// Power states of a listen mode routing entry, [NCI 2.0] Table 50.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct PowerState: u8 {
        /// Device switched on.
        const SWITCH_ON = 0x01;
        /// Device switched off.
        const SWITCH_OFF = 0x02;
        /// Battery off.
        const BATTERY_OFF = 0x04;
        /// Screen off, device unlocked.
        const SCREEN_OFF_UNLOCKED = 0x08;
        /// Screen on, device locked.
        const SCREEN_ON_LOCKED = 0x10;
        /// Screen off, device locked.
        const SCREEN_OFF_LOCKED = 0x20;
    }
}

impl PowerState {
    /// Power states the device host can service: never while the
    /// device is switched off or the battery is off.
    pub const HOST_SUPPORTED: PowerState = PowerState::SWITCH_ON
        .union(PowerState::SCREEN_OFF_UNLOCKED)
        .union(PowerState::SCREEN_ON_LOCKED)
        .union(PowerState::SCREEN_OFF_LOCKED);
}

bitflags! {
    /// Screen state reported by the device.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ScreenState: u8 {
        /// Screen off, unlocked.
        const OFF_UNLOCKED = 0x01;
        /// Screen off, locked.
        const OFF_LOCKED = 0x02;
        /// Screen on, locked.
        const ON_LOCKED = 0x04;
        /// Screen on, unlocked.
        const ON_UNLOCKED = 0x08;
    }
}

impl ScreenState {
    /// Power sub-state code sent with CORE_SET_POWER_SUB_STATE_CMD.
    pub fn power_sub_state(self) -> u8 {
        if self.contains(ScreenState::ON_UNLOCKED) {
            0x00
        } else if self.contains(ScreenState::OFF_UNLOCKED) {
            0x01
        } else if self.contains(ScreenState::ON_LOCKED) {
            0x02
        } else {
            0x03
        }
    }
}

/// Configuration parameter identifiers used by the adapters.
pub mod param {
    /// Discovery parameter controlling polling and listening while
    /// the screen state changes (NCI 2.0 CON_DISCOVERY_PARAM).
    pub const CON_DISCOVERY_PARAM: u8 = 0x02;
    /// Listening of the DH and NFCEEs enabled.
    pub const LISTEN_DH_NFCEE_ENABLE: u8 = 0x00;
    /// Listening of the DH and NFCEEs disabled.
    pub const LISTEN_DH_NFCEE_DISABLE: u8 = 0x02;
    /// Polling of the DH enabled.
    pub const POLLING_DH_ENABLE: u8 = 0x00;
    /// Polling of the DH disabled.
    pub const POLLING_DH_DISABLE: u8 = 0x01;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_convert_both_ways() {
        for code in [0x00u8, 0x01, 0x03, 0x06, 0xb1, 0xb2, 0xe0, 0xe3, 0x42] {
            assert_eq!(u8::from(Status::from(code)), code);
        }
        assert_eq!(Status::from(0x42), Status::Unknown(0x42));
    }

    #[test]
    fn interface_follows_protocol() {
        assert_eq!(RfInterface::for_protocol(Protocol::IsoDep), RfInterface::IsoDep);
        assert_eq!(RfInterface::for_protocol(Protocol::Mifare), RfInterface::Mifare);
        assert_eq!(RfInterface::for_protocol(Protocol::T2t), RfInterface::Frame);
    }

    #[test]
    fn host_never_serves_switched_off_states() {
        assert!(!PowerState::HOST_SUPPORTED.contains(PowerState::SWITCH_OFF));
        assert!(!PowerState::HOST_SUPPORTED.contains(PowerState::BATTERY_OFF));
        assert_eq!(PowerState::HOST_SUPPORTED.bits(), 0x39);
    }

    #[test]
    fn unknown_protocol_codes_are_rejected() {
        assert_eq!(Protocol::try_from(0x81), Err(0x81));
        assert_eq!(Protocol::try_from(0x80), Ok(Protocol::Mifare));
    }
}
