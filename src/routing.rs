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

//! Listen mode routing.
//!
//! The routing table decides which execution environment (the device
//! host, an embedded secure element, a UICC) receives card emulation
//! traffic. Technology and protocol routes are recomputed from the
//! configuration and the live NFCEE inventory, then committed to the
//! controller as one batch.

use crate::config::{RoutingConfig, HOST_ROUTE};
use crate::error::{Error, Result};
use crate::hal::{EeEvent, EeInfo, NfcHal};
use crate::nci::{PowerState, ProtocolMask, Status, TechMask};
use crate::sync::SyncEvent;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Longest AID accepted by the controller, ISO/IEC 7816-5.
const MAX_AID_LENGTH: usize = 16;

/// Type of a listen mode routing entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum RouteKind {
    Technology,
    Protocol,
}

/// One technology or protocol route.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutingEntry {
    /// Entry type.
    pub kind: RouteKind,
    /// [`TechMask`] bits for technology entries, [`ProtocolMask`] bits
    /// for protocol entries.
    pub value_mask: u8,
    /// NFCEE identifier of the destination.
    pub destination: u8,
    /// Power states in which the route applies.
    pub power_state: PowerState,
}

impl RoutingEntry {
    /// RF_SET_LISTEN_MODE_ROUTING_CMD TLVs of the entry.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        self.encode_into(&mut out);
        out
    }

    /// Append the RF_SET_LISTEN_MODE_ROUTING_CMD TLVs of the entry, one
    /// per technology or protocol of the mask.
    fn encode_into(&self, out: &mut Vec<u8>) {
        let (tlv_type, values): (u8, Vec<u8>) = match self.kind {
            RouteKind::Technology => {
                let mask = TechMask::from_bits_truncate(self.value_mask);
                let values = TECH_CODES
                    .iter()
                    .filter(|(tech, _)| mask.contains(*tech))
                    .map(|(_, code)| *code)
                    .collect();
                (0x00, values)
            }
            RouteKind::Protocol => {
                let mask = ProtocolMask::from_bits_truncate(self.value_mask);
                let values = PROTOCOL_CODES
                    .iter()
                    .filter(|(protocol, _)| mask.contains(*protocol))
                    .map(|(_, code)| *code)
                    .collect();
                (0x01, values)
            }
        };
        for value in values {
            let power = self.power_state.bits();
            out.extend_from_slice(&[tlv_type, 3, self.destination, power, value]);
        }
    }
}

/// RF technology codes of technology routes, [NCI] Table 130.
const TECH_CODES: [(TechMask, u8); 3] =
    [(TechMask::A, 0x00), (TechMask::B, 0x01), (TechMask::F, 0x02)];

/// RF protocol codes of protocol routes, [NCI] Table 133.
const PROTOCOL_CODES: [(ProtocolMask, u8); 3] =
    [(ProtocolMask::T3T, 0x03), (ProtocolMask::ISO_DEP, 0x04), (ProtocolMask::NFC_DEP, 0x05)];

/// Result of a routing computation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingTable {
    /// Entries to commit, sorted.
    pub entries: Vec<RoutingEntry>,
    /// Entries that failed validation.
    pub rejected: Vec<Error>,
}

impl RoutingTable {
    /// Encode the entries as listen mode routing TLVs.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        for entry in &self.entries {
            entry.encode_into(&mut out);
        }
        out
    }
}

/// Technologies on which `route` can receive traffic.
fn reachable_tech(config: &RoutingConfig, ees: &[EeInfo], route: u8) -> TechMask {
    if route == HOST_ROUTE {
        return config.host_listen_tech;
    }
    ees.iter()
        .find(|ee| ee.id == route && ee.is_active())
        .map(|ee| ee.listen_tech & config.offhost_listen_tech)
        .unwrap_or(TechMask::empty())
}

/// Power states supported by `route`.
fn supported_power(ees: &[EeInfo], route: u8) -> PowerState {
    if route == HOST_ROUTE {
        return PowerState::HOST_SUPPORTED;
    }
    ees.iter().find(|ee| ee.id == route).map(|ee| ee.power_states).unwrap_or(PowerState::empty())
}

/// Compute the technology and protocol routes for a configuration and
/// an NFCEE inventory. The result only depends on its inputs.
pub fn compute_routing_table(config: &RoutingConfig, ees: &[EeInfo]) -> RoutingTable {
    let mut table = RoutingTable::default();

    let protocol_route = |protocol: ProtocolMask, route: u8, required: TechMask| {
        if !reachable_tech(config, ees, route).intersects(required) {
            return None;
        }
        Some(RoutingEntry {
            kind: RouteKind::Protocol,
            value_mask: protocol.bits(),
            destination: route,
            power_state: config.default_tech_power & supported_power(ees, route),
        })
    };

    let isodep_route = config.default_isodep_route;
    match protocol_route(ProtocolMask::ISO_DEP, isodep_route, TechMask::A | TechMask::B) {
        Some(entry) => table.entries.push(entry),
        None => table.rejected.push(Error::RouteRejected {
            route: isodep_route,
            reason: "ISO-DEP destination cannot listen on NFC-A or NFC-B",
        }),
    }
    let felica_route = config.default_felica_route;
    match protocol_route(ProtocolMask::T3T, felica_route, TechMask::F) {
        Some(entry) => table.entries.push(entry),
        None => debug!("T3T route to {:#04x} skipped, NFC-F not reachable", felica_route),
    }

    let mut tech_routes: BTreeMap<u8, TechMask> = BTreeMap::new();
    *tech_routes.entry(config.default_offhost_route).or_insert(TechMask::empty()) |=
        TechMask::A | TechMask::B;
    *tech_routes.entry(config.default_felica_route).or_insert(TechMask::empty()) |= TechMask::F;
    for (route, mask) in tech_routes {
        let mask = mask & TechMask::ROUTABLE & reachable_tech(config, ees, route);
        let power_state = config.default_tech_power & supported_power(ees, route);
        if mask.is_empty() || power_state.is_empty() {
            debug!("no technology route to {:#04x}", route);
            continue;
        }
        table.entries.push(RoutingEntry {
            kind: RouteKind::Technology,
            value_mask: mask.bits(),
            destination: route,
            power_state,
        });
    }

    table.entries.sort();
    table
}

/// Computes and commits the controller routing table.
pub struct RoutingManager {
    hal: Arc<dyn NfcHal>,
    config: RoutingConfig,
    lock: Mutex<()>,
    ees: parking_lot::Mutex<Vec<EeInfo>>,
    ee_info_changed: AtomicBool,
    committed: parking_lot::Mutex<Option<RoutingTable>>,
    registration: SyncEvent<Status>,
    inventory: SyncEvent<Vec<EeInfo>>,
    listen: SyncEvent<Status>,
    clear: SyncEvent<Status>,
    set: SyncEvent<Status>,
    update: SyncEvent<Status>,
    aid: SyncEvent<Status>,
}

impl RoutingManager {
    /// Create the manager.
    pub fn new(hal: Arc<dyn NfcHal>, config: RoutingConfig) -> Self {
        RoutingManager {
            hal,
            config,
            lock: Mutex::new(()),
            ees: parking_lot::Mutex::new(vec![]),
            ee_info_changed: AtomicBool::new(false),
            committed: parking_lot::Mutex::new(None),
            registration: SyncEvent::new("ee-register"),
            inventory: SyncEvent::new("ee-discovery"),
            listen: SyncEvent::new("listen-tech"),
            clear: SyncEvent::new("routing-clear"),
            set: SyncEvent::new("routing-set"),
            update: SyncEvent::new("routing-update"),
            aid: SyncEvent::new("aid-routing"),
        }
    }

    /// Issue one command and wait for its acknowledgement.
    async fn round_trip(
        &self,
        event: &SyncEvent<Status>,
        command: impl FnOnce() -> Status,
    ) -> Result<()> {
        let mut pending = event.begin().await;
        Error::check(command())?;
        Error::check(pending.wait(self.config.op_timeout).await?)
    }

    /// Register for NFCEE events, apply the listen configuration and
    /// commit the default routes.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        debug!("+ ee_register()");
        self.round_trip(&self.registration, || self.hal.ee_register()).await?;

        if self.config.has_offhost_routes() {
            let mut pending = self.inventory.begin().await;
            debug!("+ ee_get_info()");
            Error::check(self.hal.ee_get_info())?;
            match pending.wait(self.config.ee_discovery_timeout).await {
                Ok(ees) => info!("discovered {} NFCEE(s)", ees.len()),
                Err(err) => warn!("NFCEE discovery incomplete: {}", err),
            }
        }

        let ees = self.ees.lock().clone();
        for ee in ees.iter().filter(|ee| ee.is_active()) {
            let tech = ee.listen_tech & self.config.offhost_listen_tech;
            debug!("+ set_ee_listen_tech({:#04x}, {:?})", ee.id, tech);
            if let Err(err) =
                self.round_trip(&self.listen, || self.hal.set_ee_listen_tech(ee.id, tech)).await
            {
                warn!("listen configuration of NFCEE {:#04x} failed: {}", ee.id, err);
            }
        }
        let host_tech = self.config.host_listen_tech;
        debug!("+ set_host_listen_tech({:?})", host_tech);
        self.round_trip(&self.listen, || self.hal.set_host_listen_tech(host_tech)).await?;

        let route = self.config.default_route;
        let power = self.config.default_aid_power & supported_power(&ees, route);
        debug!("+ add_aid_routing(<default>, {:#04x})", route);
        self.round_trip(&self.aid, || self.hal.add_aid_routing(&[], route, power, 0)).await?;

        let code = self.config.default_sys_code;
        let route = self.config.default_sys_code_route;
        let power = self.config.default_sys_code_power & supported_power(&ees, route);
        debug!("+ set_system_code_routing({:#06x}, {:#04x})", code, route);
        let result =
            self.round_trip(&self.set, || self.hal.set_system_code_routing(code, route, power));
        if let Err(err) = result.await {
            warn!("system code routing failed: {}", err);
        }

        self.commit_locked().await
    }

    /// Deregister from NFCEE events.
    pub async fn deinitialize(&self) {
        let _guard = self.lock.lock().await;
        debug!("+ ee_deregister()");
        if let Err(err) = self.round_trip(&self.registration, || self.hal.ee_deregister()).await {
            warn!("NFCEE deregistration failed: {}", err);
        }
        self.committed.lock().take();
    }

    /// Routing table for the current configuration and inventory.
    pub fn compute_routing_params(&self) -> RoutingTable {
        compute_routing_table(&self.config, &self.ees.lock())
    }

    /// Last committed routing table.
    pub fn committed(&self) -> Option<RoutingTable> {
        self.committed.lock().clone()
    }

    /// True if the NFCEE inventory changed since the last commit.
    pub fn is_ee_info_changed(&self) -> bool {
        self.ee_info_changed.load(Ordering::SeqCst)
    }

    /// Recompute and commit the routing table.
    pub async fn commit_routing(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.commit_locked().await
    }

    /// Commit only if the NFCEE inventory changed since the last commit.
    pub async fn commit_if_changed(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.is_ee_info_changed() {
            info!("NFCEE inventory changed, recomputing routes");
            self.commit_locked().await?;
        }
        Ok(())
    }

    async fn commit_locked(&self) -> Result<()> {
        let table = self.compute_routing_params();
        for rejected in &table.rejected {
            warn!("{}", rejected);
        }

        debug!("+ clear_routing()");
        self.round_trip(&self.clear, || self.hal.clear_routing()).await?;
        for entry in &table.entries {
            debug!("+ set_routing({:?})", entry);
            self.round_trip(&self.set, || self.hal.set_routing(entry)).await?;
        }
        debug!("+ update_routing()");
        self.round_trip(&self.update, || self.hal.update_routing()).await?;

        info!("committed {} routing entries", table.entries.len());
        self.ee_info_changed.store(false, Ordering::SeqCst);
        *self.committed.lock() = Some(table);
        Ok(())
    }

    /// Enable or disable listening of the host.
    pub async fn set_host_listen(&self, enabled: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        let tech = if enabled { self.config.host_listen_tech } else { TechMask::empty() };
        debug!("+ set_host_listen_tech({:?})", tech);
        self.round_trip(&self.listen, || self.hal.set_host_listen_tech(tech)).await
    }

    /// Route an AID to an NFCEE. The power states are pruned to those
    /// the destination supports.
    pub async fn add_aid_routing(
        &self,
        aid: &[u8],
        route: u8,
        power: PowerState,
        info: u8,
    ) -> Result<()> {
        if aid.len() > MAX_AID_LENGTH {
            return Err(Error::RouteRejected { route, reason: "AID longer than 16 bytes" });
        }
        let _guard = self.lock.lock().await;
        let power = power & supported_power(&self.ees.lock(), route);
        debug!("+ add_aid_routing({}, {:#04x}, {:?})", hex::encode(aid), route, power);
        self.round_trip(&self.aid, || self.hal.add_aid_routing(aid, route, power, info)).await
    }

    /// Remove an AID route.
    pub async fn remove_aid_routing(&self, aid: &[u8]) -> Result<()> {
        let _guard = self.lock.lock().await;
        debug!("+ remove_aid_routing({})", hex::encode(aid));
        self.round_trip(&self.aid, || self.hal.remove_aid_routing(aid)).await
    }

    /// Current NFCEE inventory.
    pub fn ees(&self) -> Vec<EeInfo> {
        self.ees.lock().clone()
    }

    /// Handle an NFCEE event on the HAL callback context.
    pub fn on_ee_event(&self, event: EeEvent) {
        match event {
            EeEvent::Registered(status) | EeEvent::Deregistered(status) => {
                self.registration.notify(status);
            }
            EeEvent::Discovered(ees) => {
                *self.ees.lock() = ees.clone();
                self.ee_info_changed.store(true, Ordering::SeqCst);
                self.inventory.notify(ees);
            }
            EeEvent::InfoChanged(info) => {
                debug!("NFCEE {:#04x} is now {:?}", info.id, info.status);
                let mut ees = self.ees.lock();
                match ees.iter_mut().find(|ee| ee.id == info.id) {
                    Some(ee) => *ee = info,
                    None => ees.push(info),
                }
                self.ee_info_changed.store(true, Ordering::SeqCst);
            }
            EeEvent::ListenConfigured(status) => {
                self.listen.notify(status);
            }
            EeEvent::RoutingCleared(status) => {
                self.clear.notify(status);
            }
            EeEvent::RoutingSet(status) => {
                self.set.notify(status);
            }
            EeEvent::RoutingUpdated(status) => {
                self.update.notify(status);
            }
            EeEvent::AidAdded(status) | EeEvent::AidRemoved(status) => {
                self.aid.notify(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NfcConfig;
    use crate::hal::EeStatus;

    fn ese() -> EeInfo {
        EeInfo {
            id: 0x86,
            status: EeStatus::Active,
            listen_tech: TechMask::A | TechMask::B,
            power_states: PowerState::all(),
        }
    }

    fn uicc() -> EeInfo {
        EeInfo {
            id: 0x81,
            status: EeStatus::Active,
            listen_tech: TechMask::A | TechMask::B | TechMask::F,
            power_states: PowerState::SWITCH_ON | PowerState::SWITCH_OFF,
        }
    }

    #[test]
    fn default_configuration_routes_to_host() {
        let config = NfcConfig::default().routing;
        let table = compute_routing_table(&config, &[]);
        assert!(table.rejected.is_empty());
        assert_eq!(
            table.entries,
            vec![
                RoutingEntry {
                    kind: RouteKind::Technology,
                    value_mask: (TechMask::A | TechMask::B).bits(),
                    destination: HOST_ROUTE,
                    power_state: PowerState::from_bits_truncate(0x39),
                },
                RoutingEntry {
                    kind: RouteKind::Protocol,
                    value_mask: ProtocolMask::ISO_DEP.bits(),
                    destination: HOST_ROUTE,
                    power_state: PowerState::from_bits_truncate(0x39),
                },
            ]
        );
    }

    #[test]
    fn host_never_carries_switched_off_states() {
        let config = NfcConfig::default().routing;
        assert_eq!(config.default_tech_power.bits(), 0x3b);
        for entry in compute_routing_table(&config, &[]).entries {
            let host_off = PowerState::SWITCH_OFF | PowerState::BATTERY_OFF;
            assert!(!entry.power_state.intersects(host_off));
        }
    }

    #[test]
    fn offhost_routes_follow_inventory() {
        let mut config = NfcConfig::default().routing;
        config.default_offhost_route = 0x86;
        config.default_felica_route = 0x81;
        let table = compute_routing_table(&config, &[ese(), uicc()]);

        let ese_entry = table
            .entries
            .iter()
            .find(|entry| entry.kind == RouteKind::Technology && entry.destination == 0x86)
            .unwrap();
        assert_eq!(ese_entry.value_mask, (TechMask::A | TechMask::B).bits());
        assert_eq!(ese_entry.power_state.bits(), 0x3b);

        let uicc_entries: Vec<_> =
            table.entries.iter().filter(|entry| entry.destination == 0x81).collect();
        assert_eq!(uicc_entries.len(), 2);
        for entry in uicc_entries {
            assert_eq!(entry.power_state, PowerState::SWITCH_ON | PowerState::SWITCH_OFF);
        }
    }

    #[test]
    fn iso_dep_to_unreachable_destination_is_rejected() {
        let mut config = NfcConfig::default().routing;
        config.default_isodep_route = 0x81;
        let felica_only = EeInfo { listen_tech: TechMask::F, ..uicc() };
        let table = compute_routing_table(&config, &[felica_only]);
        assert_eq!(
            table.rejected,
            vec![Error::RouteRejected {
                route: 0x81,
                reason: "ISO-DEP destination cannot listen on NFC-A or NFC-B"
            }]
        );
        assert!(!table.entries.iter().any(|entry| entry.kind == RouteKind::Protocol
            && entry.value_mask == ProtocolMask::ISO_DEP.bits()));
    }

    #[test]
    fn computation_is_idempotent() {
        let mut config = NfcConfig::default().routing;
        config.default_offhost_route = 0x86;
        config.default_felica_route = 0x81;
        let ees = [uicc(), ese()];
        let first = compute_routing_table(&config, &ees);
        let second = compute_routing_table(&config, &ees);
        assert_eq!(first, second);
        assert_eq!(first.encode(), second.encode());
    }

    #[test]
    fn encoding_expands_masks() {
        let table = RoutingTable {
            entries: vec![RoutingEntry {
                kind: RouteKind::Technology,
                value_mask: (TechMask::A | TechMask::F).bits(),
                destination: 0x86,
                power_state: PowerState::SWITCH_ON,
            }],
            rejected: vec![],
        };
        assert_eq!(table.encode(), vec![0x00, 3, 0x86, 0x01, 0x00, 0x00, 3, 0x86, 0x01, 0x02]);
    }
}
