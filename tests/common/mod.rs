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

#![allow(dead_code)]

use nfc_nci::hal::sim::SimulatedController;
use nfc_nci::{ConfigStore, DispatchEvent, NfcAdapter, TagHost};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

/// NDEF message with one well-known text record "hello".
pub const HELLO_NDEF: [u8; 12] =
    [0xd1, 0x01, 0x08, 0x54, 0x02, 0x65, 0x6e, 0x68, 0x65, 0x6c, 0x6c, 0x6f];

/// Controller adapter wired to a simulated controller and a channel
/// dispatcher.
pub struct Harness {
    pub sim: SimulatedController,
    pub nfc: NfcAdapter,
    pub rx: mpsc::UnboundedReceiver<DispatchEvent>,
}

impl Harness {
    /// Enabled controller, discovery stopped.
    pub async fn enabled(sim: SimulatedController) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel::<DispatchEvent>();
        let nfc = NfcAdapter::new(Arc::new(sim.clone()), Arc::new(tx));
        nfc.initialize().await.expect("controller enabled");
        Harness { sim, nfc, rx }
    }

    /// Enabled controller polling every technology.
    pub async fn discovering() -> Harness {
        let harness = Harness::enabled(SimulatedController::new(ConfigStore::new())).await;
        harness.nfc.enable_default_discovery().await.expect("discovery started");
        harness
    }

    /// Next dispatcher notification.
    pub async fn next(&mut self) -> DispatchEvent {
        time::timeout(Duration::from_secs(10), self.rx.recv())
            .await
            .expect("dispatcher notification")
            .expect("dispatcher channel open")
    }

    /// Next discovered tag.
    pub async fn discovered(&mut self) -> Arc<TagHost> {
        match self.next().await {
            DispatchEvent::Discovered(tag) => tag,
            event => panic!("expected a discovered tag, got {:?}", event),
        }
    }

    /// Let the event task drain the HAL events.
    pub async fn settle(&self) {
        time::sleep(Duration::from_millis(1)).await;
    }
}
