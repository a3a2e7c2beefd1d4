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

//! NCI core of an NFC service.
//!
//! Drives an NFC controller through the named entry points of a HAL
//! library: enables the controller and RF discovery, classifies the
//! tags found in the field, selects the RF interface of each tag
//! technology and commits the listen-mode routing table.
//!
//! Classified tags are handed to a [`TagDispatcher`] as [`TagHost`]s.

#![warn(missing_docs)]

pub mod adapter;
pub mod config;
pub mod error;
pub mod hal;
pub mod nci;
pub mod routing;
pub mod sync;
pub mod tag;

pub use adapter::{DiscoveryParams, FailureKind, NfcAdapter};
pub use config::{ConfigStore, ConfigValue, NfcConfig};
pub use error::{Error, Result};
pub use hal::{HalEvent, HalLoader, NfcHal};
pub use routing::{RoutingEntry, RoutingManager, RoutingTable};
pub use tag::{DispatchEvent, NciTagAdapter, TagDispatcher, TagHost, TagRecord};
