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

//! HAL entry points exported by a vendor shared library.
//!
//! Every entry point is a C function named `nfc_hal_<entry point>`,
//! returning the NCI status of the command. The symbols are resolved
//! once when the library is opened. Completions are reported through the
//! callback passed to `nfc_hal_enable` as an event code, a status and an
//! event payload laid out as the matching NCI notification.

use super::{
    ActivationNtf, DiscoverNtf, EeEvent, EeInfo, EeStatus, EntryPoints, HalEvent, HalEventSender,
    MifareExtension, NdefDetectResult, NdefFlags, NfcHal,
};
use crate::config::{self, ConfigValue, PresenceCheckAlgorithm};
use crate::error::{Error, Result};
use crate::nci::{
    DeactivationReason, DeactivationType, NciVersion, PowerState, Protocol, RfInterface, Status,
    TechMask,
};
use crate::routing::RoutingEntry;
use bytes::Bytes;
use libloading::Library;
use log::{debug, warn};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CString};
use std::sync::Arc;
use std::time::Duration;

/// Event callback registered with `nfc_hal_enable`.
pub type EventCallback =
    unsafe extern "C" fn(context: *mut c_void, event: u8, status: u8, data: *const u8, len: usize);

/// Event codes of the vendor callback.
pub mod event {
    #![allow(missing_docs)]
    pub const ENABLED: u8 = 0x01;
    pub const DISABLED: u8 = 0x02;
    pub const POLLING_ENABLED: u8 = 0x03;
    pub const POLLING_DISABLED: u8 = 0x04;
    pub const DISCOVERY_STARTED: u8 = 0x05;
    pub const DISCOVERY_STOPPED: u8 = 0x06;
    pub const CONFIG_SET: u8 = 0x07;
    pub const DISCOVER_RESULT: u8 = 0x10;
    pub const SELECT_RESULT: u8 = 0x11;
    pub const GENERIC_ERROR: u8 = 0x12;
    pub const ACTIVATED: u8 = 0x13;
    pub const DEACTIVATED: u8 = 0x14;
    pub const DATA: u8 = 0x20;
    /// Data segment followed by more segments of the same response.
    pub const DATA_MORE: u8 = 0x21;
    pub const NDEF_DETECTED: u8 = 0x30;
    pub const NDEF_READ: u8 = 0x31;
    pub const NDEF_WRITTEN: u8 = 0x32;
    pub const NDEF_FORMATTED: u8 = 0x33;
    pub const READ_ONLY_SET: u8 = 0x34;
    pub const PRESENCE_CHECKED: u8 = 0x35;
    pub const EE_REGISTERED: u8 = 0x40;
    pub const EE_DEREGISTERED: u8 = 0x41;
    pub const EE_DISCOVERED: u8 = 0x42;
    pub const EE_INFO_CHANGED: u8 = 0x43;
    pub const EE_LISTEN_CONFIGURED: u8 = 0x44;
    pub const ROUTING_CLEARED: u8 = 0x45;
    pub const ROUTING_SET: u8 = 0x46;
    pub const ROUTING_UPDATED: u8 = 0x47;
    pub const AID_ADDED: u8 = 0x48;
    pub const AID_REMOVED: u8 = 0x49;
}

/// RF_DISCOVER_NTF notification type announcing more notifications.
const DISCOVER_MORE: u8 = 0x02;

/// Capacity of the buffer receiving configuration values.
const CONFIG_VALUE_CAPACITY: usize = 256;

type Cmd = unsafe extern "C" fn() -> u8;
type CmdU8 = unsafe extern "C" fn(u8) -> u8;
type CmdU8U8 = unsafe extern "C" fn(u8, u8) -> u8;
type CmdBytes = unsafe extern "C" fn(*const u8, usize) -> u8;

macro_rules! symbols {
    ($($field:ident: $flag:ident => $ty:ty,)*) => {
        /// Entry points resolved from the library, `None` when not
        /// exported.
        struct Symbols {
            $($field: Option<$ty>,)*
        }

        impl Symbols {
            fn resolve(library: &Library) -> (Symbols, EntryPoints) {
                let mut exported = EntryPoints::empty();
                let symbols = Symbols {
                    $($field: {
                        let entry = resolve::<$ty>(library, stringify!($field));
                        if entry.is_some() {
                            exported |= EntryPoints::$flag;
                        }
                        entry
                    },)*
                };
                (symbols, exported)
            }
        }
    };
}

symbols! {
    enable: ENABLE => unsafe extern "C" fn(EventCallback, *mut c_void) -> u8,
    disable: DISABLE => CmdU8,
    enable_polling: ENABLE_POLLING => CmdU8,
    disable_polling: DISABLE_POLLING => Cmd,
    set_listening: SET_LISTENING => CmdU8,
    start_rf_discovery: START_RF_DISCOVERY => Cmd,
    stop_rf_discovery: STOP_RF_DISCOVERY => Cmd,
    set_discovery_duration: SET_DISCOVERY_DURATION => unsafe extern "C" fn(u32) -> u8,
    set_config: SET_CONFIG => unsafe extern "C" fn(u8, *const u8, usize) -> u8,
    set_power_sub_state: SET_POWER_SUB_STATE => CmdU8,
    select: SELECT => unsafe extern "C" fn(u8, u8, u8) -> u8,
    deactivate: DEACTIVATE => CmdU8,
    send_raw_frame: SEND_RAW_FRAME => CmdBytes,
    detect_ndef: DETECT_NDEF => Cmd,
    read_ndef: READ_NDEF => Cmd,
    write_ndef: WRITE_NDEF => CmdBytes,
    format_ndef: FORMAT_NDEF => Cmd,
    set_read_only: SET_READ_ONLY => CmdU8,
    presence_check: PRESENCE_CHECK => CmdU8,
    register_ndef_handler: REGISTER_NDEF_HANDLER => Cmd,
    ee_register: EE_REGISTER => Cmd,
    ee_deregister: EE_DEREGISTER => Cmd,
    ee_get_info: EE_GET_INFO => Cmd,
    set_ee_listen_tech: SET_EE_LISTEN_TECH => CmdU8U8,
    set_host_listen_tech: SET_HOST_LISTEN_TECH => CmdU8,
    clear_routing: CLEAR_ROUTING => Cmd,
    set_routing: SET_ROUTING => CmdBytes,
    add_aid_routing: ADD_AID_ROUTING => unsafe extern "C" fn(*const u8, usize, u8, u8, u8) -> u8,
    remove_aid_routing: REMOVE_AID_ROUTING => CmdBytes,
    set_system_code_routing: SET_SYSTEM_CODE_ROUTING => unsafe extern "C" fn(u16, u8, u8) -> u8,
    update_routing: UPDATE_ROUTING => Cmd,
    config_get: CONFIG_GET => unsafe extern "C" fn(*const c_char, *mut u8, usize) -> usize,
    config_has_key: CONFIG_HAS_KEY => unsafe extern "C" fn(*const c_char) -> u8,
    mifare_transceive: MIFARE_TRANSCEIVE => CmdBytes,
    mifare_presence_check: MIFARE_PRESENCE_CHECK => Cmd,
}

/// Symbol name of an entry point.
pub fn symbol_name(entry_point: &str) -> String {
    format!("nfc_hal_{}", entry_point.to_ascii_lowercase())
}

fn resolve<T: Copy>(library: &Library, entry_point: &str) -> Option<T> {
    let name = symbol_name(entry_point);
    // SAFETY: the symbol is declared with the C signature of the entry
    // point, and the pointer is only called while the library is loaded.
    match unsafe { library.get::<T>(name.as_bytes()) } {
        Ok(symbol) => Some(*symbol),
        Err(_) => {
            debug!("{} not exported", name);
            None
        }
    }
}

/// Call an entry point, mapping a missing symbol to NOT_SUPPORTED.
macro_rules! call {
    ($symbols:expr, $name:ident ( $($arg:expr),* )) => {
        match $symbols.$name {
            // SAFETY: resolved with the C signature of the entry point
            // from a library kept loaded by the caller.
            Some(entry) => Status::from(unsafe { entry($($arg),*) }),
            None => Status::NotSupported,
        }
    };
}

/// Destination of the vendor callback. The sink is shared by every
/// holder of the library, so it outlives the loaded code.
#[derive(Default)]
struct EventSink {
    events: Mutex<Option<HalEventSender>>,
}

extern "C" fn on_event(
    context: *mut c_void,
    event: u8,
    status: u8,
    data: *const u8,
    len: usize,
) {
    if context.is_null() {
        return;
    }
    // SAFETY: `context` is the `EventSink` registered by `enable`,
    // kept alive alongside the library.
    let sink = unsafe { &*(context as *const EventSink) };
    let payload = if data.is_null() || len == 0 {
        &[][..]
    } else {
        // SAFETY: the library passes `len` readable bytes at `data`
        // for the duration of the callback.
        unsafe { std::slice::from_raw_parts(data, len) }
    };
    let Some(event) = decode_event(event, Status::from(status), payload) else {
        warn!("malformed event {:#04x} ({} bytes)", event, len);
        return;
    };
    match sink.events.lock().as_ref() {
        Some(events) => {
            if events.send(event).is_err() {
                warn!("event channel closed");
            }
        }
        None => warn!("controller not enabled, dropping {:?}", event),
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (first, rest) = self.0.split_first()?;
        self.0 = rest;
        Some(*first)
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.0.len() < len {
            return None;
        }
        let (head, rest) = self.0.split_at(len);
        self.0 = rest;
        Some(head)
    }

    fn u32_le(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.bytes(4)?.try_into().ok()?))
    }

    /// Length prefixed byte string.
    fn field(&mut self) -> Option<Vec<u8>> {
        let len = self.u8()? as usize;
        Some(self.bytes(len)?.to_vec())
    }
}

fn decode_ee_info(reader: &mut Reader) -> Option<EeInfo> {
    let id = reader.u8()?;
    let status = match reader.u8()? {
        0x00 => EeStatus::Active,
        0x01 => EeStatus::Inactive,
        _ => EeStatus::Removed,
    };
    Some(EeInfo {
        id,
        status,
        listen_tech: TechMask::from_bits_truncate(reader.u8()?),
        power_states: PowerState::from_bits_truncate(reader.u8()?),
    })
}

/// Decode one callback event. Returns `None` for an unknown event code
/// or a truncated payload.
pub fn decode_event(event: u8, status: Status, payload: &[u8]) -> Option<HalEvent> {
    let mut reader = Reader(payload);
    Some(match event {
        event::ENABLED => HalEvent::Enabled {
            status,
            nci_version: NciVersion::try_from(reader.u8()?).ok()?,
        },
        event::DISABLED => HalEvent::Disabled(status),
        event::POLLING_ENABLED => HalEvent::PollingEnabled(status),
        event::POLLING_DISABLED => HalEvent::PollingDisabled(status),
        event::DISCOVERY_STARTED => HalEvent::DiscoveryStarted(status),
        event::DISCOVERY_STOPPED => HalEvent::DiscoveryStopped(status),
        event::CONFIG_SET => HalEvent::ConfigSet(status),
        event::DISCOVER_RESULT => HalEvent::DiscoverResult(DiscoverNtf {
            discovery_id: reader.u8()?,
            protocol: reader.u8()?,
            tech_mode: reader.u8()?,
            tech_params: reader.field()?,
            more: reader.u8()? == DISCOVER_MORE,
        }),
        event::SELECT_RESULT => HalEvent::SelectResult(status),
        event::GENERIC_ERROR => HalEvent::GenericError(status),
        event::ACTIVATED => {
            let discovery_id = reader.u8()?;
            let interface = RfInterface::try_from(reader.u8()?).ok()?;
            let protocol = reader.u8()?;
            let tech_mode = reader.u8()?;
            // Max data packet payload size and initial credits.
            reader.bytes(2)?;
            let tech_params = reader.field()?;
            // Data exchange mode and bit rates.
            reader.bytes(3)?;
            let activation_params = reader.field()?;
            HalEvent::Activated(ActivationNtf {
                discovery_id,
                interface,
                protocol,
                tech_mode,
                tech_params,
                activation_params,
            })
        }
        event::DEACTIVATED => HalEvent::Deactivated {
            kind: DeactivationType::try_from(reader.u8()?).ok()?,
            reason: DeactivationReason::try_from(reader.u8()?).ok()?,
        },
        event::DATA | event::DATA_MORE => HalEvent::Data {
            status,
            payload: Bytes::copy_from_slice(payload),
            more: event == event::DATA_MORE,
        },
        event::NDEF_DETECTED => HalEvent::NdefDetected(NdefDetectResult {
            status,
            max_size: reader.u32_le()?,
            current_size: reader.u32_le()?,
            flags: NdefFlags::from_bits_truncate(reader.u8()?),
        }),
        event::NDEF_READ => {
            HalEvent::NdefRead { status, message: Bytes::copy_from_slice(payload) }
        }
        event::NDEF_WRITTEN => HalEvent::NdefWritten(status),
        event::NDEF_FORMATTED => HalEvent::NdefFormatted(status),
        event::READ_ONLY_SET => HalEvent::ReadOnlySet(status),
        event::PRESENCE_CHECKED => HalEvent::PresenceChecked(status),
        event::EE_REGISTERED => HalEvent::Ee(EeEvent::Registered(status)),
        event::EE_DEREGISTERED => HalEvent::Ee(EeEvent::Deregistered(status)),
        event::EE_DISCOVERED => {
            let count = reader.u8()?;
            let ees = (0..count)
                .map(|_| decode_ee_info(&mut reader))
                .collect::<Option<Vec<_>>>()?;
            HalEvent::Ee(EeEvent::Discovered(ees))
        }
        event::EE_INFO_CHANGED => HalEvent::Ee(EeEvent::InfoChanged(decode_ee_info(&mut reader)?)),
        event::EE_LISTEN_CONFIGURED => HalEvent::Ee(EeEvent::ListenConfigured(status)),
        event::ROUTING_CLEARED => HalEvent::Ee(EeEvent::RoutingCleared(status)),
        event::ROUTING_SET => HalEvent::Ee(EeEvent::RoutingSet(status)),
        event::ROUTING_UPDATED => HalEvent::Ee(EeEvent::RoutingUpdated(status)),
        event::AID_ADDED => HalEvent::Ee(EeEvent::AidAdded(status)),
        event::AID_REMOVED => HalEvent::Ee(EeEvent::AidRemoved(status)),
        _ => return None,
    })
}

fn presence_check_code(algorithm: PresenceCheckAlgorithm) -> u8 {
    match algorithm {
        PresenceCheckAlgorithm::Default => 0x00,
        PresenceCheckAlgorithm::IBlock => 0x01,
        PresenceCheckAlgorithm::IsoDepNak => 0x02,
    }
}

/// HAL library loaded from the file system.
pub struct NativeHal {
    path: String,
    symbols: Arc<Symbols>,
    entry_points: EntryPoints,
    library: Arc<Library>,
    sink: Arc<EventSink>,
}

impl NativeHal {
    /// Open the library at `path` and resolve its entry points.
    pub fn open(path: &str) -> Result<NativeHal> {
        // SAFETY: loading runs the library initializers; vendor HAL
        // libraries have no initialization side effects on the host.
        let library = unsafe { Library::new(path) }.map_err(|err| {
            debug!("dlopen {}: {}", path, err);
            Error::HalUnavailable(path.to_owned())
        })?;
        let (symbols, entry_points) = Symbols::resolve(&library);
        debug!("{} exports {:?}", path, entry_points);
        Ok(NativeHal {
            path: path.to_owned(),
            symbols: Arc::new(symbols),
            entry_points,
            library: Arc::new(library),
            sink: Arc::default(),
        })
    }

    /// Path the library was loaded from.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn key(key: &str) -> Option<CString> {
        CString::new(key).ok()
    }
}

impl NfcHal for NativeHal {
    fn entry_points(&self) -> EntryPoints {
        self.entry_points
    }

    fn enable(&self, events: HalEventSender) -> Status {
        *self.sink.events.lock() = Some(events);
        let context = Arc::as_ptr(&self.sink) as *mut c_void;
        call!(self.symbols, enable(on_event, context))
    }

    fn disable(&self, graceful: bool) -> Status {
        call!(self.symbols, disable(graceful as u8))
    }

    fn enable_polling(&self, tech: TechMask) -> Status {
        call!(self.symbols, enable_polling(tech.bits()))
    }

    fn disable_polling(&self) -> Status {
        call!(self.symbols, disable_polling())
    }

    fn set_listening(&self, enabled: bool) -> Status {
        call!(self.symbols, set_listening(enabled as u8))
    }

    fn start_rf_discovery(&self) -> Status {
        call!(self.symbols, start_rf_discovery())
    }

    fn stop_rf_discovery(&self) -> Status {
        call!(self.symbols, stop_rf_discovery())
    }

    fn set_discovery_duration(&self, duration: Duration) -> Status {
        let millis = u32::try_from(duration.as_millis()).unwrap_or(u32::MAX);
        call!(self.symbols, set_discovery_duration(millis))
    }

    fn set_config(&self, id: u8, value: &[u8]) -> Status {
        call!(self.symbols, set_config(id, value.as_ptr(), value.len()))
    }

    fn set_power_sub_state(&self, sub_state: u8) -> Status {
        call!(self.symbols, set_power_sub_state(sub_state))
    }

    fn select(&self, discovery_id: u8, protocol: Protocol, interface: RfInterface) -> Status {
        call!(self.symbols, select(discovery_id, protocol.into(), interface.into()))
    }

    fn deactivate(&self, kind: DeactivationType) -> Status {
        call!(self.symbols, deactivate(kind.into()))
    }

    fn send_raw_frame(&self, data: &[u8]) -> Status {
        call!(self.symbols, send_raw_frame(data.as_ptr(), data.len()))
    }

    fn detect_ndef(&self) -> Status {
        call!(self.symbols, detect_ndef())
    }

    fn read_ndef(&self) -> Status {
        call!(self.symbols, read_ndef())
    }

    fn write_ndef(&self, message: &[u8]) -> Status {
        call!(self.symbols, write_ndef(message.as_ptr(), message.len()))
    }

    fn format_ndef(&self) -> Status {
        call!(self.symbols, format_ndef())
    }

    fn set_read_only(&self, hard_lock: bool) -> Status {
        call!(self.symbols, set_read_only(hard_lock as u8))
    }

    fn presence_check(&self, algorithm: PresenceCheckAlgorithm) -> Status {
        call!(self.symbols, presence_check(presence_check_code(algorithm)))
    }

    fn register_ndef_handler(&self) -> Status {
        call!(self.symbols, register_ndef_handler())
    }

    fn ee_register(&self) -> Status {
        call!(self.symbols, ee_register())
    }

    fn ee_deregister(&self) -> Status {
        call!(self.symbols, ee_deregister())
    }

    fn ee_get_info(&self) -> Status {
        call!(self.symbols, ee_get_info())
    }

    fn set_ee_listen_tech(&self, ee: u8, tech: TechMask) -> Status {
        call!(self.symbols, set_ee_listen_tech(ee, tech.bits()))
    }

    fn set_host_listen_tech(&self, tech: TechMask) -> Status {
        call!(self.symbols, set_host_listen_tech(tech.bits()))
    }

    fn clear_routing(&self) -> Status {
        call!(self.symbols, clear_routing())
    }

    fn set_routing(&self, entry: &RoutingEntry) -> Status {
        let tlvs = entry.encode();
        call!(self.symbols, set_routing(tlvs.as_ptr(), tlvs.len()))
    }

    fn add_aid_routing(&self, aid: &[u8], route: u8, power: PowerState, info: u8) -> Status {
        call!(self.symbols, add_aid_routing(aid.as_ptr(), aid.len(), route, power.bits(), info))
    }

    fn remove_aid_routing(&self, aid: &[u8]) -> Status {
        call!(self.symbols, remove_aid_routing(aid.as_ptr(), aid.len()))
    }

    fn set_system_code_routing(&self, system_code: u16, route: u8, power: PowerState) -> Status {
        call!(self.symbols, set_system_code_routing(system_code, route, power.bits()))
    }

    fn update_routing(&self) -> Status {
        call!(self.symbols, update_routing())
    }

    fn config_get(&self, key: &str) -> Option<ConfigValue> {
        let entry = self.symbols.config_get?;
        let key = NativeHal::key(key)?;
        let mut value = vec![0u8; CONFIG_VALUE_CAPACITY];
        // SAFETY: `key` is NUL terminated and `value` has the advertised
        // capacity; the library writes at most that many bytes.
        let len = unsafe { entry(key.as_ptr(), value.as_mut_ptr(), value.len()) };
        if len == 0 || len > value.len() {
            return None;
        }
        config::parse_value(std::str::from_utf8(&value[..len]).ok()?.trim())
    }

    fn config_has_key(&self, key: &str) -> bool {
        let (Some(entry), Some(key)) = (self.symbols.config_has_key, NativeHal::key(key)) else {
            return false;
        };
        // SAFETY: `key` is NUL terminated.
        unsafe { entry(key.as_ptr()) != 0 }
    }

    fn mifare_extension(&self) -> Option<Arc<dyn MifareExtension>> {
        Some(Arc::new(NativeMifare {
            symbols: self.symbols.clone(),
            _library: self.library.clone(),
            _sink: self.sink.clone(),
        }))
    }
}

/// Mifare Classic entry points of a loaded library.
struct NativeMifare {
    symbols: Arc<Symbols>,
    _library: Arc<Library>,
    _sink: Arc<EventSink>,
}

impl MifareExtension for NativeMifare {
    fn transceive(&self, data: &[u8]) -> Status {
        call!(self.symbols, mifare_transceive(data.as_ptr(), data.len()))
    }

    fn presence_check(&self) -> Status {
        call!(self.symbols, mifare_presence_check())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_names_follow_entry_points() {
        assert_eq!(symbol_name("SET_ROUTING"), "nfc_hal_set_routing");
        assert_eq!(symbol_name("MIFARE_PRESENCE_CHECK"), "nfc_hal_mifare_presence_check");
    }

    #[test]
    fn missing_library_is_unavailable() {
        assert_eq!(
            NativeHal::open("/nonexistent/libnfc-nci.so").err(),
            Some(Error::HalUnavailable("/nonexistent/libnfc-nci.so".into()))
        );
    }

    #[test]
    fn decode_discover_notifications() {
        let payload = [0x01, 0x04, 0x00, 0x03, 0x44, 0x00, 0x20, DISCOVER_MORE];
        assert_eq!(
            decode_event(event::DISCOVER_RESULT, Status::Ok, &payload),
            Some(HalEvent::DiscoverResult(DiscoverNtf {
                discovery_id: 1,
                protocol: u8::from(Protocol::IsoDep),
                tech_mode: 0x00,
                tech_params: vec![0x44, 0x00, 0x20],
                more: true,
            }))
        );
        assert_eq!(decode_event(event::DISCOVER_RESULT, Status::Ok, &payload[..5]), None);
    }

    #[test]
    fn decode_activation() {
        let payload = [
            0x02, 0x02, 0x04, 0x00, 0xff, 0x01, 0x02, 0x44, 0x00, 0x00, 0x00, 0x00, 0x02, 0x05,
            0x78,
        ];
        match decode_event(event::ACTIVATED, Status::Ok, &payload) {
            Some(HalEvent::Activated(ntf)) => {
                assert_eq!(ntf.discovery_id, 2);
                assert_eq!(ntf.interface, RfInterface::IsoDep);
                assert_eq!(ntf.tech_params, vec![0x44, 0x00]);
                assert_eq!(ntf.activation_params, vec![0x05, 0x78]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn decode_status_and_data_events() {
        assert_eq!(
            decode_event(event::ENABLED, Status::Ok, &[0x20]),
            Some(HalEvent::Enabled { status: Status::Ok, nci_version: NciVersion::Version20 })
        );
        assert_eq!(
            decode_event(event::DEACTIVATED, Status::Ok, &[0x01, 0x00]),
            Some(HalEvent::Deactivated {
                kind: DeactivationType::Sleep,
                reason: DeactivationReason::DhRequest
            })
        );
        assert_eq!(
            decode_event(event::DATA_MORE, Status::Ok, &[0x90]),
            Some(HalEvent::Data {
                status: Status::Ok,
                payload: Bytes::from_static(&[0x90]),
                more: true
            })
        );
        assert_eq!(
            decode_event(event::EE_DISCOVERED, Status::Ok, &[0x01, 0x86, 0x00, 0x03, 0x3f]),
            Some(HalEvent::Ee(EeEvent::Discovered(vec![EeInfo {
                id: 0x86,
                status: EeStatus::Active,
                listen_tech: TechMask::from_bits_truncate(0x03),
                power_states: PowerState::from_bits_truncate(0x3f),
            }])))
        );
        assert_eq!(decode_event(0xff, Status::Ok, &[]), None);
    }
}
