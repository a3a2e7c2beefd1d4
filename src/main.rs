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

//! Drive the NCI core against the simulated controller.

use anyhow::{bail, Result};
use argh::FromArgs;
use nfc_nci::hal::sim::{SimCard, SimulatedController};
use nfc_nci::hal::{HalLoader, DEFAULT_HAL_LIBRARY};
use nfc_nci::nci::Technology;
use nfc_nci::{ConfigStore, DispatchEvent, NfcAdapter, NfcHal, TagHost};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

/// Time allowed for the dispatcher to hear about a tag.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// ISO 7816-4 SELECT of the NDEF tag application.
const SELECT_NDEF_APPLICATION: [u8; 13] =
    [0x00, 0xa4, 0x04, 0x00, 0x07, 0xd2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01, 0x00];

#[derive(FromArgs, Debug)]
/// NCI core driven by a simulated NFC controller.
struct Opt {
    #[argh(option)]
    /// configuration file in the libnfc-nci.conf format.
    config: Option<PathBuf>,
    #[argh(option)]
    /// chip type selecting the vendor HAL library.
    chip: Option<String>,
    #[argh(option, default = "String::from(\"04a1b2c3\")")]
    /// UID of the simulated card, in hex.
    uid: String,
    #[argh(option, default = "String::from(\"d101085402656e68656c6c6f\")")]
    /// NDEF message stored on the simulated card, in hex.
    ndef: String,
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<DispatchEvent>) -> Result<DispatchEvent> {
    match time::timeout(DISPATCH_TIMEOUT, rx.recv()).await? {
        Some(event) => Ok(event),
        None => bail!("dispatcher channel closed"),
    }
}

async fn exercise(tag: &TagHost) -> Result<()> {
    println!("Tag {} discovered with {:?}", hex::encode_upper(tag.uid()), tag.technologies());
    match tag.find_and_read_ndef().await? {
        Some(message) => println!("NDEF message: {}", message),
        None => println!("Tag is not NDEF capable"),
    }
    tag.connect(Technology::IsoDep).await?;
    let response = tag.transceive(&SELECT_NDEF_APPLICATION).await?;
    println!("SELECT response: {}", hex::encode_upper(&response));
    println!("Technologies after NDEF detection: {:?}", tag.technologies());
    Ok(())
}

async fn run() -> Result<()> {
    let opt: Opt = argh::from_env();
    let store = match &opt.config {
        Some(path) => ConfigStore::parse(&std::fs::read_to_string(path)?),
        None => ConfigStore::new(),
    };
    let uid = hex::decode(&opt.uid)?;
    let ndef = hex::decode(&opt.ndef)?;

    let sim = SimulatedController::new(store);
    let mut loader = HalLoader::new();
    let library = sim.clone();
    loader.register(
        DEFAULT_HAL_LIBRARY,
        Box::new(move || -> Arc<dyn NfcHal> { Arc::new(library.clone()) }),
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<DispatchEvent>();
    let nfc = NfcAdapter::load(&loader, opt.chip.as_deref(), Arc::new(tx))?;
    nfc.initialize().await?;
    println!("Controller enabled ({:?})", nfc.nci_version());
    nfc.enable_default_discovery().await?;

    let card = sim.present(
        SimCard::iso_dep_a(&uid)
            .with_ndef(&ndef, 256)
            .with_response(&SELECT_NDEF_APPLICATION, &[0x90, 0x00]),
    );
    let tag = match next_event(&mut rx).await? {
        DispatchEvent::Discovered(tag) => tag,
        event => bail!("unexpected dispatcher event {:?}", event),
    };
    exercise(&tag).await?;

    sim.remove(card);
    match next_event(&mut rx).await? {
        DispatchEvent::Lost(handle) => println!("Tag {} lost", handle),
        event => bail!("unexpected dispatcher event {:?}", event),
    }

    nfc.deinitialize().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "debug"),
    );
    run().await
}
