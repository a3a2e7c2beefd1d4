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

//! Tag discovery, classification and operations.

pub mod activation;
pub mod adapter;
pub mod host;
pub mod ndef;
pub mod record;

pub use adapter::{NciTagAdapter, TagActivity, TimeoutTable};
pub use host::{DispatchEvent, TagDispatcher, TagHost};
pub use ndef::{NdefInfo, NdefMessage, NdefMode};
pub use record::{TagFacet, TagRecord, TechExtras};
