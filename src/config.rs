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

//! Configuration consumed at startup.
//!
//! The HAL exposes the vendor configuration through its `config_get` and
//! `config_has_key` entry points. [`NfcConfig::load`] reads the typed
//! values the adapters need, falling back to the defaults of the
//! reference hardware.

use crate::hal::NfcHal;
use crate::nci::{PowerState, TechMask, Technology};
use log::warn;
use std::collections::HashMap;
use std::time::Duration;

/// Raw value of a configuration key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    /// Decimal or `0x` hexadecimal number.
    Number(u32),
    /// Quoted string.
    Text(String),
    /// Byte array written as `{01:02:03}`.
    Bytes(Vec<u8>),
}

/// Key/value store in the `libnfc-nci.conf` format.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigStore {
    values: HashMap<String, ConfigValue>,
}

impl ConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Default::default()
    }

    /// Parse the configuration text. Malformed lines are logged and
    /// skipped.
    pub fn parse(text: &str) -> Self {
        let mut store = ConfigStore::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("config line {}: missing '='", number + 1);
                continue;
            };
            match parse_value(value.trim()) {
                Some(value) => store.set(key.trim(), value),
                None => warn!("config line {}: invalid value for {}", number + 1, key.trim()),
            }
        }
        store
    }

    /// Insert or replace a value.
    pub fn set(&mut self, key: &str, value: ConfigValue) {
        self.values.insert(key.to_owned(), value);
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// Return true if the key is present.
    pub fn has_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

pub(crate) fn parse_value(value: &str) -> Option<ConfigValue> {
    if let Some(text) = value.strip_prefix('"') {
        return text.strip_suffix('"').map(|text| ConfigValue::Text(text.to_owned()));
    }
    if let Some(bytes) = value.strip_prefix('{') {
        let bytes = bytes.strip_suffix('}')?.trim();
        if bytes.is_empty() {
            return Some(ConfigValue::Bytes(vec![]));
        }
        return bytes
            .split([':', ','])
            .map(|byte| u8::from_str_radix(byte.trim(), 16).ok())
            .collect::<Option<Vec<u8>>>()
            .map(ConfigValue::Bytes);
    }
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
    .map(ConfigValue::Number)
}

/// Algorithm used for presence checks of ISO-DEP tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PresenceCheckAlgorithm {
    Default,
    IBlock,
    IsoDepNak,
}

/// Listen-mode routing configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingConfig {
    /// NFCEE receiving A/B technology traffic.
    pub default_offhost_route: u8,
    /// NFCEE receiving NFC-F / T3T traffic.
    pub default_felica_route: u8,
    /// NFCEE receiving unmatched AIDs.
    pub default_route: u8,
    /// NFCEE receiving ISO-DEP protocol traffic.
    pub default_isodep_route: u8,
    /// Embedded secure element NFCEE identifiers.
    pub offhost_route_ese: Vec<u8>,
    /// UICC NFCEE identifiers.
    pub offhost_route_uicc: Vec<u8>,
    /// Default Felica system code.
    pub default_sys_code: u16,
    /// NFCEE receiving the default system code.
    pub default_sys_code_route: u8,
    /// Power states of the default system code route.
    pub default_sys_code_power: PowerState,
    /// Power states requested for technology and protocol routes.
    pub default_tech_power: PowerState,
    /// Power states requested for AID routes.
    pub default_aid_power: PowerState,
    /// Technologies the host listens on.
    pub host_listen_tech: TechMask,
    /// Technologies NFCEEs may listen on.
    pub offhost_listen_tech: TechMask,
    /// Time to wait for the initial NFCEE inventory.
    pub ee_discovery_timeout: Duration,
    /// Time to wait for each routing round trip.
    pub op_timeout: Duration,
}

impl RoutingConfig {
    /// True if any route points away from the host.
    pub fn has_offhost_routes(&self) -> bool {
        self.default_offhost_route != HOST_ROUTE
            || self.default_felica_route != HOST_ROUTE
            || self.default_route != HOST_ROUTE
            || self.default_isodep_route != HOST_ROUTE
            || !self.offhost_route_ese.is_empty()
            || !self.offhost_route_uicc.is_empty()
    }
}

/// NFCEE identifier of the device host.
pub const HOST_ROUTE: u8 = 0x00;

/// Timing and behaviour of the tag adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagConfig {
    /// Presence check algorithm for ISO-DEP tags.
    pub presence_check_algorithm: PresenceCheckAlgorithm,
    /// Interval between two presence checks.
    pub presence_check_interval: Duration,
    /// Time to wait for one presence check result.
    pub presence_check_timeout: Duration,
    /// Presence checks retried after a failure status.
    pub presence_check_retries: u32,
    /// Activation waits attempted by an interface reselect.
    pub reselect_retries: u32,
    /// Time to wait for the sleep confirmation of a reselect.
    pub sleep_timeout: Duration,
    /// Time to wait for one activation attempt of a reselect.
    pub activation_timeout: Duration,
    /// Delay after the halt command sent before a reselect.
    pub halt_delay: Duration,
    /// Merge same-UID ISO-DEP / Mifare discoveries into one tag.
    pub multi_protocol_tags: bool,
    /// Bound on the discovery candidates kept for one round.
    pub max_candidates: usize,
    /// Seed values of the per-technology timeout table.
    pub timeouts: Vec<(Technology, Duration)>,
    /// NDEF read timeout.
    pub ndef_read_timeout: Duration,
    /// NDEF detection timeout.
    pub ndef_check_timeout: Duration,
    /// NDEF format timeout.
    pub ndef_format_timeout: Duration,
    /// Timeout of the remaining blocking operations.
    pub op_timeout: Duration,
}

/// Controller-level configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Time to wait for the enable confirmation.
    pub enable_timeout: Duration,
    /// Time to wait for the disable confirmation.
    pub disable_timeout: Duration,
    /// Duration of one RF discovery cycle.
    pub discovery_duration: Duration,
    /// Technologies polled by default.
    pub polling_tech: TechMask,
    /// Timeout of the discovery and configuration round trips.
    pub op_timeout: Duration,
}

/// Typed configuration of the whole core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NfcConfig {
    /// Controller settings.
    pub controller: ControllerConfig,
    /// Tag adapter settings.
    pub tag: TagConfig,
    /// Routing settings.
    pub routing: RoutingConfig,
}

impl Default for NfcConfig {
    fn default() -> Self {
        NfcConfig::from_lookup(|_| None)
    }
}

impl NfcConfig {
    /// Load the configuration through the HAL config entry points.
    pub fn load(hal: &dyn NfcHal) -> Self {
        NfcConfig::from_lookup(|key| {
            if hal.config_has_key(key) {
                hal.config_get(key)
            } else {
                None
            }
        })
    }

    /// Build the configuration from a store directly.
    pub fn from_store(store: &ConfigStore) -> Self {
        NfcConfig::from_lookup(|key| store.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<ConfigValue>) -> Self {
        let number = |key: &str, default: u32| match lookup(key) {
            Some(ConfigValue::Number(value)) => value,
            Some(other) => {
                warn!("config {} has unexpected value {:?}", key, other);
                default
            }
            None => default,
        };
        let millis = |key: &str, default: u32| Duration::from_millis(number(key, default) as u64);
        let bytes = |key: &str| match lookup(key) {
            Some(ConfigValue::Bytes(bytes)) => bytes,
            Some(ConfigValue::Number(value)) => vec![value as u8],
            _ => vec![],
        };
        let route = |key: &str, default: u8| number(key, default as u32) as u8;

        let default_route = route("DEFAULT_ROUTE", HOST_ROUTE);
        let op_timeout = millis("DEFAULT_OP_TIMEOUT_MS", 1000);

        NfcConfig {
            controller: ControllerConfig {
                enable_timeout: millis("NFC_ENABLE_TIMEOUT_MS", 10_000),
                disable_timeout: millis("NFC_DISABLE_TIMEOUT_MS", 3000),
                discovery_duration: millis("DISCOVERY_DURATION_MS", 500),
                polling_tech: TechMask::from_bits_truncate(number("POLLING_TECH_MASK", 0x0f) as u8),
                op_timeout,
            },
            tag: TagConfig {
                presence_check_algorithm: match number("PRESENCE_CHECK_ALGORITHM", 0) {
                    1 => PresenceCheckAlgorithm::IBlock,
                    2 => PresenceCheckAlgorithm::IsoDepNak,
                    _ => PresenceCheckAlgorithm::Default,
                },
                presence_check_interval: millis("PRESENCE_CHECK_INTERVAL_MS", 125),
                presence_check_timeout: millis("PRESENCE_CHECK_TIMEOUT_MS", 1000),
                presence_check_retries: number("PRESENCE_CHECK_RETRIES", 1),
                reselect_retries: number("RESELECT_RETRY_COUNT", 3).max(1),
                sleep_timeout: millis("RESELECT_SLEEP_TIMEOUT_MS", 1000),
                activation_timeout: millis("RESELECT_ACTIVATION_TIMEOUT_MS", 1000),
                halt_delay: millis("HALT_DELAY_MS", 10),
                multi_protocol_tags: number("ENABLE_MULTI_PROTOCOL_TAG", 1) != 0,
                max_candidates: number("MAX_MULTI_TAG_CANDIDATES", 10) as usize,
                timeouts: vec![
                    (Technology::NfcA, millis("NFCA_TIMEOUT_MS", 618)),
                    (Technology::NfcB, millis("NFCB_TIMEOUT_MS", 1000)),
                    (Technology::NfcF, millis("NFCF_TIMEOUT_MS", 255)),
                    (Technology::NfcV, millis("NFCV_TIMEOUT_MS", 1000)),
                    (Technology::IsoDep, millis("ISODEP_TIMEOUT_MS", 618)),
                    (Technology::MifareClassic, millis("NFCA_TIMEOUT_MS", 618)),
                    (Technology::MifareUltralight, millis("NFCA_TIMEOUT_MS", 618)),
                    (Technology::Ndef, op_timeout),
                    (Technology::NdefFormatable, op_timeout),
                ],
                ndef_read_timeout: millis("NDEF_READ_TIMEOUT_MS", 5000),
                ndef_check_timeout: millis("NDEF_CHECK_TIMEOUT_MS", 3000),
                ndef_format_timeout: millis("NDEF_FORMAT_TIMEOUT_MS", 3000),
                op_timeout,
            },
            routing: RoutingConfig {
                default_offhost_route: route("DEFAULT_OFFHOST_ROUTE", HOST_ROUTE),
                default_felica_route: route("DEFAULT_NFCF_ROUTE", HOST_ROUTE),
                default_route,
                default_isodep_route: route("DEFAULT_ISODEP_ROUTE", default_route),
                offhost_route_ese: bytes("OFFHOST_ROUTE_ESE"),
                offhost_route_uicc: bytes("OFFHOST_ROUTE_UICC"),
                default_sys_code: number("DEFAULT_SYS_CODE", 0xfefe) as u16,
                default_sys_code_route: route("DEFAULT_SYS_CODE_ROUTE", HOST_ROUTE),
                default_sys_code_power: PowerState::from_bits_truncate(
                    number("DEFAULT_SYS_CODE_PWR_STATE", 0x39) as u8,
                ),
                default_tech_power: PowerState::from_bits_truncate(
                    number("DEFAULT_TECH_PWR_STATE", 0x3b) as u8,
                ),
                default_aid_power: PowerState::from_bits_truncate(
                    number("DEFAULT_AID_PWR_STATE", 0x39) as u8,
                ),
                host_listen_tech: TechMask::from_bits_truncate(
                    number("HOST_LISTEN_TECH_MASK", 0x03) as u8,
                ),
                offhost_listen_tech: TechMask::from_bits_truncate(
                    number("OFFHOST_LISTEN_TECH_MASK", 0x07) as u8,
                ),
                ee_discovery_timeout: millis("EE_DISCOVERY_TIMEOUT_MS", 2000),
                op_timeout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = r#"
# Routing
DEFAULT_OFFHOST_ROUTE=0x86
DEFAULT_NFCF_ROUTE=0x81
OFFHOST_ROUTE_ESE={86}
OFFHOST_ROUTE_UICC={81:82}
PRESENCE_CHECK_INTERVAL_MS=250
PRESENCE_CHECK_RETRIES=0
CHIP_NAME="pn7160"
broken line
"#;

    #[test]
    fn parse_conf_values() {
        let store = ConfigStore::parse(CONF);
        assert_eq!(store.get("DEFAULT_OFFHOST_ROUTE"), Some(&ConfigValue::Number(0x86)));
        assert_eq!(store.get("OFFHOST_ROUTE_UICC"), Some(&ConfigValue::Bytes(vec![0x81, 0x82])));
        assert_eq!(store.get("CHIP_NAME"), Some(&ConfigValue::Text("pn7160".into())));
        assert!(!store.has_key("broken line"));
    }

    #[test]
    fn typed_config_uses_defaults() {
        let config = NfcConfig::default();
        assert_eq!(config.tag.presence_check_interval, Duration::from_millis(125));
        assert_eq!(config.tag.reselect_retries, 3);
        assert_eq!(config.tag.presence_check_retries, 1);
        assert_eq!(config.routing.default_isodep_route, HOST_ROUTE);
        assert!(!config.routing.has_offhost_routes());
        assert!(config
            .tag
            .timeouts
            .contains(&(Technology::NfcF, Duration::from_millis(255))));
    }

    #[test]
    fn typed_config_reads_store() {
        let config = NfcConfig::from_store(&ConfigStore::parse(CONF));
        assert_eq!(config.routing.default_offhost_route, 0x86);
        assert_eq!(config.routing.default_felica_route, 0x81);
        assert_eq!(config.routing.offhost_route_ese, vec![0x86]);
        assert_eq!(config.tag.presence_check_interval, Duration::from_millis(250));
        assert_eq!(config.tag.presence_check_retries, 0);
        assert!(config.routing.has_offhost_routes());
    }
}
