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

use common::{Harness, HELLO_NDEF};
use nfc_nci::hal::sim::SimCard;
use nfc_nci::nci::Technology;
use nfc_nci::tag::{NdefMode, TechExtras};
use nfc_nci::Error;

const UID: [u8; 4] = [0x04, 0xa1, 0xb2, 0xc3];
const T2T_UID: [u8; 7] = [0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

#[tokio::test(start_paused = true)]
async fn detection_is_cached_until_write() {
    let mut h = Harness::discovering().await;
    let card = h.sim.present(SimCard::iso_dep_a(&UID).with_ndef(&HELLO_NDEF, 64));
    let tag = h.discovered().await;

    assert_eq!(tag.detect_ndef_info().await, Ok((12, NdefMode::ReadWrite)));
    assert_eq!(tag.detect_ndef_info().await, Ok((12, NdefMode::ReadWrite)));
    assert_eq!(h.sim.call_count("detect_ndef"), 1);

    let uri: [u8; 8] = [0xd1, 0x01, 0x04, 0x55, 0x03, 0x61, 0x2e, 0x62];
    tag.write_ndef(&uri).await.unwrap();
    assert_eq!(h.sim.ndef_message(card), Some(uri.to_vec()));
    assert_eq!(tag.detect_ndef_info().await, Ok((8, NdefMode::ReadWrite)));
    assert_eq!(h.sim.call_count("detect_ndef"), 2);
    assert_eq!(tag.read_ndef().await.unwrap().as_bytes(), &uri);
}

#[tokio::test(start_paused = true)]
async fn empty_write_stores_the_empty_record() {
    let mut h = Harness::discovering().await;
    let card = h.sim.present(SimCard::iso_dep_a(&UID).with_ndef(&HELLO_NDEF, 64));
    let tag = h.discovered().await;

    tag.write_ndef(&[]).await.unwrap();
    assert_eq!(h.sim.ndef_message(card), Some(vec![0xd0, 0x00, 0x00]));
}

#[tokio::test(start_paused = true)]
async fn oversized_message_is_refused() {
    let mut h = Harness::discovering().await;
    let card = h.sim.present(SimCard::iso_dep_a(&UID).with_ndef(&HELLO_NDEF, 16));
    let tag = h.discovered().await;

    let message = [0u8; 17];
    assert_eq!(
        tag.write_ndef(&message).await,
        Err(Error::MessageTooLarge { size: 17, max: 16 })
    );
    assert_eq!(h.sim.call_count("write_ndef"), 0);
    assert_eq!(h.sim.ndef_message(card), Some(HELLO_NDEF.to_vec()));
}

#[tokio::test(start_paused = true)]
async fn read_only_card_refuses_writes() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&UID).with_ndef(&HELLO_NDEF, 64).read_only());
    let tag = h.discovered().await;

    assert_eq!(tag.detect_ndef_info().await, Ok((12, NdefMode::ReadOnly)));
    assert_eq!(tag.write_ndef(&HELLO_NDEF).await, Err(Error::ReadOnly));
    assert_eq!(h.sim.call_count("write_ndef"), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_hard_lock_falls_back_to_soft_lock() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&UID).with_ndef(&HELLO_NDEF, 64).soft_lock_only());
    let tag = h.discovered().await;

    tag.make_read_only().await.unwrap();
    assert_eq!(h.sim.call_count("set_read_only"), 2);
    assert_eq!(tag.detect_ndef_info().await, Ok((12, NdefMode::ReadOnly)));
}

#[tokio::test(start_paused = true)]
async fn hard_lock_is_tried_first() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&UID).with_ndef(&HELLO_NDEF, 64));
    let tag = h.discovered().await;

    tag.make_read_only().await.unwrap();
    assert_eq!(h.sim.call_count("set_read_only"), 1);
}

#[tokio::test(start_paused = true)]
async fn formatable_card_gains_an_ndef_area() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::type2(&T2T_UID).formatable());
    let tag = h.discovered().await;

    assert_eq!(tag.detect_ndef_info().await, Err(Error::NotNdefCapable));
    assert_eq!(
        tag.technologies(),
        vec![Technology::NfcA, Technology::MifareUltralight, Technology::NdefFormatable]
    );
    assert_eq!(tag.tech_extras(Technology::NdefFormatable), Some(TechExtras::None));

    tag.format_ndef().await.unwrap();
    assert_eq!(tag.detect_ndef_info().await, Ok((0, NdefMode::ReadWrite)));
    match tag.tech_extras(Technology::Ndef) {
        Some(TechExtras::Ndef { max_size, .. }) => assert_eq!(max_size, 128),
        other => panic!("unexpected NDEF extras {:?}", other),
    }
    assert_eq!(tag.find_and_read_ndef().await.map(|m| m.map(|m| m.is_empty())), Ok(Some(true)));
}

#[tokio::test(start_paused = true)]
async fn format_of_unformatable_card_fails() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::type2(&T2T_UID));
    let tag = h.discovered().await;

    assert!(tag.format_ndef().await.is_err());
    assert_eq!(h.sim.call_count("format_ndef"), 1);
}
