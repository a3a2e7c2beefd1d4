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
use nfc_nci::tag::{NdefMode, TagActivity, TechExtras};
use nfc_nci::{DispatchEvent, Error};
use std::time::Duration;
use tokio::time::Instant;

const UID: [u8; 4] = [0x04, 0xa1, 0xb2, 0xc3];

#[tokio::test(start_paused = true)]
async fn iso_dep_card_is_classified_read_and_lost() {
    let mut h = Harness::discovering().await;
    let card = h.sim.present(SimCard::iso_dep_a(&UID).with_ndef(&HELLO_NDEF, 64));

    let tag = h.discovered().await;
    assert_eq!(tag.technologies(), vec![Technology::NfcA, Technology::IsoDep]);
    assert_eq!(tag.uid(), &UID);
    assert_eq!(tag.handle(), 1);
    assert_eq!(
        tag.tech_extras(Technology::NfcA),
        Some(TechExtras::NfcA { atqa: vec![0x44, 0x03], sak: 0x20 })
    );

    let message = tag.find_and_read_ndef().await.unwrap().expect("NDEF capable");
    assert_eq!(message.to_string(), "D101085402656E68656C6C6F");
    assert_eq!(
        tag.technologies(),
        vec![Technology::NfcA, Technology::IsoDep, Technology::Ndef]
    );
    match tag.tech_extras(Technology::Ndef) {
        Some(TechExtras::Ndef { max_size, mode, message }) => {
            assert_eq!(max_size, 64);
            assert_eq!(mode, NdefMode::ReadWrite);
            assert_eq!(message, HELLO_NDEF.to_vec());
        }
        other => panic!("unexpected NDEF extras {:?}", other),
    }

    let start = Instant::now();
    h.sim.remove(card);
    match h.next().await {
        DispatchEvent::Lost(handle) => assert_eq!(handle, tag.handle()),
        event => panic!("expected the tag to be lost, got {:?}", event),
    }
    let config = h.nfc.config().tag.clone();
    assert!(start.elapsed() <= config.presence_check_interval + config.presence_check_timeout);
    h.settle().await;
    assert_eq!(h.nfc.tags().activity(), TagActivity::Idle);
}

#[tokio::test(start_paused = true)]
async fn card_without_ndef_reports_not_capable() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::type2(&[0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));

    let tag = h.discovered().await;
    assert_eq!(
        tag.technologies(),
        vec![Technology::NfcA, Technology::MifareUltralight]
    );
    assert_eq!(tag.read_ndef().await, Err(Error::NotNdefCapable));
    assert_eq!(tag.detect_ndef_info().await, Err(Error::NotNdefCapable));
    assert_eq!(tag.find_and_read_ndef().await, Ok(None));
}

#[tokio::test(start_paused = true)]
async fn operations_before_connect_fail() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&UID));

    let tag = h.discovered().await;
    assert_eq!(tag.connected_technology(), None);
    assert_eq!(tag.transceive(&[0x00, 0xa4]).await, Err(Error::NotConnected));
    assert_eq!(tag.reconnect().await, Ok(()));
    assert_eq!(tag.connect(Technology::NfcF).await, Err(Error::InvalidTechnology));
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&UID));

    let tag = h.discovered().await;
    tag.connect(Technology::IsoDep).await.unwrap();
    assert_eq!(tag.connected_technology(), Some(Technology::IsoDep));

    tag.disconnect().await.unwrap();
    assert_eq!(tag.connected_technology(), None);
    assert_eq!(h.nfc.tags().session(), None);
    tag.disconnect().await.unwrap();
    assert_eq!(tag.connected_technology(), None);
    assert_eq!(h.sim.call_count("deactivate"), 1);
    assert_eq!(tag.connect(Technology::IsoDep).await, Err(Error::NoRemoteSession));
}

#[tokio::test(start_paused = true)]
async fn transceive_answers_with_the_card_response() {
    let mut h = Harness::discovering().await;
    let select = [0x00, 0xa4, 0x04, 0x00, 0x02, 0xe1, 0x03];
    h.sim.present(SimCard::iso_dep_a(&UID).with_response(&select, &[0x90, 0x00]));

    let tag = h.discovered().await;
    tag.connect(Technology::IsoDep).await.unwrap();
    assert_eq!(&tag.transceive(&select).await.unwrap()[..], &[0x90, 0x00]);
    assert_eq!(&tag.transceive(&[0x00, 0xb0, 0x00, 0x00]).await.unwrap()[..], &[0x6a, 0x82]);
    assert!(h.sim.selects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn long_responses_are_reassembled() {
    let mut h = Harness::discovering().await;
    let read = [0x00, 0xb0, 0x00, 0x00, 0x00];
    let content: Vec<u8> = (0..600).map(|i| i as u8).collect();
    h.sim.present(SimCard::iso_dep_a(&UID).with_response(&read, &content));

    let tag = h.discovered().await;
    tag.connect(Technology::IsoDep).await.unwrap();
    assert_eq!(tag.transceive(&read).await.unwrap().to_vec(), content);
}

#[tokio::test(start_paused = true)]
async fn transceive_timeout_is_bounded() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&UID));

    let tag = h.discovered().await;
    tag.connect(Technology::IsoDep).await.unwrap();
    let timeout = Duration::from_millis(200);
    h.nfc.set_timeout(Technology::IsoDep, timeout);
    assert_eq!(h.nfc.get_timeout(Technology::IsoDep), timeout);
    h.sim.set_mute_frames(true);

    let start = Instant::now();
    assert_eq!(tag.transceive(&[0x00, 0x84, 0x00, 0x00, 0x08]).await, Err(Error::Timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(20));

    h.nfc.reset_timeouts();
    assert_eq!(h.nfc.get_timeout(Technology::IsoDep), Duration::from_millis(618));
}

#[tokio::test(start_paused = true)]
async fn transceive_after_timeout_reselects_interface() {
    let mut h = Harness::discovering().await;
    h.sim.present(SimCard::iso_dep_a(&UID));

    let tag = h.discovered().await;
    tag.connect(Technology::IsoDep).await.unwrap();
    h.nfc.set_timeout(Technology::IsoDep, Duration::from_millis(100));
    h.sim.set_mute_frames(true);
    assert_eq!(tag.transceive(&[0x00]).await, Err(Error::Timeout));

    h.sim.set_mute_frames(false);
    assert_eq!(&tag.transceive(&[0x00]).await.unwrap()[..], &[0x6a, 0x82]);
    assert_eq!(h.sim.selects().len(), 1);
}
