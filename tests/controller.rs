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

mod common;

use common::Harness;
use nfc_nci::hal::sim::{SimCard, SimulatedController};
use nfc_nci::hal::{EeInfo, EeStatus};
use nfc_nci::nci::{param, NciVersion, PowerState, ScreenState, TechMask};
use nfc_nci::routing::RouteKind;
use nfc_nci::{ConfigStore, ConfigValue, DispatchEvent, FailureKind, NfcAdapter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

const ESE: u8 = 0x86;

fn ese(status: EeStatus) -> EeInfo {
    EeInfo {
        id: ESE,
        status,
        listen_tech: TechMask::A | TechMask::B,
        power_states: PowerState::all(),
    }
}

fn offhost_controller() -> SimulatedController {
    let mut store = ConfigStore::new();
    store.set("DEFAULT_OFFHOST_ROUTE", ConfigValue::Number(ESE as u32));
    store.set("OFFHOST_ROUTE_ESE", ConfigValue::Bytes(vec![ESE]));
    let sim = SimulatedController::new(store);
    sim.set_ees(vec![ese(EeStatus::Active)]);
    sim
}

#[tokio::test(start_paused = true)]
async fn screen_off_disables_polling_and_restarts_discovery() {
    let h = Harness::discovering().await;

    h.nfc.set_screen_status(ScreenState::OFF_LOCKED).await.unwrap();
    assert_eq!(h.nfc.screen_state(), ScreenState::OFF_LOCKED);
    assert_eq!(h.sim.power_sub_state(), Some(0x03));
    assert_eq!(
        h.sim.config_parameter(param::CON_DISCOVERY_PARAM),
        Some(vec![param::POLLING_DH_DISABLE])
    );
    assert!(h.nfc.discovery().await.is_some());
    assert_eq!(h.sim.call_count("start_rf_discovery"), 2);

    h.nfc.set_screen_status(ScreenState::OFF_LOCKED).await.unwrap();
    assert_eq!(h.sim.call_count("set_power_sub_state"), 1);

    h.nfc.set_screen_status(ScreenState::ON_UNLOCKED).await.unwrap();
    assert_eq!(h.sim.power_sub_state(), Some(0x00));
    assert_eq!(
        h.sim.config_parameter(param::CON_DISCOVERY_PARAM),
        Some(vec![param::POLLING_DH_ENABLE])
    );
    assert_eq!(h.nfc.failure_count(FailureKind::Screen), 0);
}

#[tokio::test(start_paused = true)]
async fn screen_state_is_only_recorded_before_nci2() {
    let sim = SimulatedController::new(ConfigStore::new());
    sim.set_nci_version(NciVersion::Version11);
    let h = Harness::enabled(sim).await;
    assert_eq!(h.nfc.nci_version(), NciVersion::Version11);

    h.nfc.set_screen_status(ScreenState::OFF_UNLOCKED).await.unwrap();
    assert_eq!(h.nfc.screen_state(), ScreenState::OFF_UNLOCKED);
    assert_eq!(h.sim.call_count("set_power_sub_state"), 0);
    assert_eq!(h.sim.call_count("set_config"), 0);
}

#[tokio::test(start_paused = true)]
async fn screen_state_recorded_before_enable_is_applied() {
    let sim = SimulatedController::new(ConfigStore::new());
    let (tx, _rx) = mpsc::unbounded_channel::<DispatchEvent>();
    let nfc = NfcAdapter::new(Arc::new(sim.clone()), Arc::new(tx));

    nfc.set_screen_status(ScreenState::OFF_LOCKED).await.unwrap();
    assert_eq!(sim.call_count("set_power_sub_state"), 0);
    nfc.initialize().await.unwrap();
    assert_eq!(sim.power_sub_state(), Some(0x03));
    assert_eq!(
        sim.config_parameter(param::CON_DISCOVERY_PARAM),
        Some(vec![param::POLLING_DH_DISABLE])
    );

    nfc.enable_default_discovery().await.unwrap();
    nfc.set_screen_status(ScreenState::OFF_LOCKED).await.unwrap();
    assert_eq!(sim.call_count("set_power_sub_state"), 1);
    assert_eq!(nfc.failure_count(FailureKind::Screen), 0);
}

#[tokio::test(start_paused = true)]
async fn default_routes_are_committed_at_enable() {
    let h = Harness::enabled(offhost_controller()).await;
    let routing = h.nfc.routing();

    let table = routing.compute_routing_params();
    assert_eq!(routing.compute_routing_params(), table);
    assert_eq!(routing.compute_routing_params().encode(), table.encode());
    assert!(table.entries.iter().any(|entry| {
        entry.kind == RouteKind::Technology && entry.destination == ESE
    }));
    assert_eq!(routing.committed(), Some(table.clone()));
    assert_eq!(h.sim.committed_routes(), table.entries);
    assert!(!routing.is_ee_info_changed());
    assert_eq!(h.sim.call_count("set_ee_listen_tech"), 1);
    assert_eq!(h.nfc.failure_count(FailureKind::Routing), 0);
}

#[tokio::test(start_paused = true)]
async fn ee_change_is_committed_with_discovery_restart() {
    let h = Harness::enabled(offhost_controller()).await;
    h.nfc.enable_default_discovery().await.unwrap();
    assert_eq!(h.sim.call_count("update_routing"), 1);

    h.sim.change_ee(ese(EeStatus::Inactive));
    h.settle().await;
    assert!(h.nfc.routing().is_ee_info_changed());

    h.nfc.commit_routing().await.unwrap();
    assert_eq!(h.sim.call_count("update_routing"), 2);
    assert!(!h.nfc.routing().is_ee_info_changed());
    assert!(h.sim.committed_routes().iter().all(|entry| entry.destination != ESE));
    assert_eq!(h.sim.call_count("stop_rf_discovery"), 1);
    assert_eq!(h.sim.call_count("start_rf_discovery"), 2);
}

#[tokio::test(start_paused = true)]
async fn ee_change_is_committed_on_next_discovery_start() {
    let h = Harness::enabled(offhost_controller()).await;
    h.sim.change_ee(ese(EeStatus::Inactive));
    h.settle().await;

    h.nfc.enable_default_discovery().await.unwrap();
    assert_eq!(h.sim.call_count("update_routing"), 2);
    assert!(!h.nfc.routing().is_ee_info_changed());
}

#[tokio::test(start_paused = true)]
async fn aid_routes_reach_the_controller() {
    let h = Harness::enabled(offhost_controller()).await;
    let aid: [u8; 7] = [0xa0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10];
    let routing = h.nfc.routing();

    routing.add_aid_routing(&aid, ESE, PowerState::SWITCH_ON, 0).await.unwrap();
    assert!(h.sim.aids().contains(&(aid.to_vec(), ESE)));
    routing.remove_aid_routing(&aid).await.unwrap();
    assert!(!h.sim.aids().iter().any(|(existing, _)| existing == &aid));
    assert!(routing.remove_aid_routing(&aid).await.is_err());
    assert!(routing.add_aid_routing(&[0u8; 17], ESE, PowerState::SWITCH_ON, 0).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn presence_check_retries_once() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&[0x04, 0xa1, 0xb2, 0xc3]));
    let tag = h.discovered().await;
    tag.stop_presence_check();

    h.sim.fail_presence_checks(1);
    assert!(tag.is_present().await);
    h.sim.fail_presence_checks(2);
    assert!(!tag.is_present().await);
    assert_eq!(h.sim.call_count("presence_check"), 4);
}

#[tokio::test(start_paused = true)]
async fn unanswered_presence_check_loses_the_tag_within_one_window() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&[0x04, 0xa1, 0xb2, 0xc3]));
    let tag = h.discovered().await;
    h.sim.set_silent_presence_checks(true);

    let start = Instant::now();
    match h.next().await {
        DispatchEvent::Lost(handle) => assert_eq!(handle, tag.handle()),
        event => panic!("expected the tag to be lost, got {:?}", event),
    }
    let config = h.nfc.config().tag.clone();
    assert!(start.elapsed() <= config.presence_check_interval + config.presence_check_timeout);
    assert_eq!(h.sim.call_count("presence_check"), 1);
}

#[tokio::test(start_paused = true)]
async fn deinitialize_stops_discovery_and_disables() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&[0x04, 0xa1, 0xb2, 0xc3]));
    let tag = h.discovered().await;
    tag.stop_presence_check();

    h.nfc.deinitialize().await;
    assert!(!h.nfc.is_enabled().await);
    assert!(h.nfc.discovery().await.is_none());
    assert!(!h.sim.is_discovering());
    assert_eq!(h.sim.call_count("disable"), 1);
    assert_eq!(h.sim.call_count("ee_deregister"), 1);
    assert_eq!(h.nfc.tags().session(), None);
    assert!(tag.transceive(&[0x00]).await.is_err());
    assert!(h.rx.try_recv().is_err());
}
