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

//! NDEF helpers.

use crate::hal::{NdefDetectResult, NdefFlags};
use bytes::Bytes;
use std::fmt;

/// Empty NDEF message: one short record with TNF "empty" and the
/// MB, ME and SR flags set.
pub const EMPTY_NDEF: [u8; 3] = [0xd0, 0x00, 0x00];

/// Access mode of the NDEF area.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum NdefMode {
    ReadOnly,
    ReadWrite,
    Unknown,
}

/// Outcome of the most recent NDEF detection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NdefInfo {
    /// The tag can hold an NDEF message.
    pub capable: bool,
    /// The tag can be formatted for NDEF.
    pub formatable: bool,
    /// Size of the current message.
    pub current_size: u32,
    /// Capacity of the NDEF area.
    pub max_size: u32,
    /// Access mode.
    pub mode: NdefMode,
}

impl NdefInfo {
    /// Interpret a detection result. A failed detection that still
    /// reports NDEF support, without the unknown flag, counts as capable.
    pub fn from_detection(result: &NdefDetectResult) -> NdefInfo {
        let capable = result.status.is_ok()
            || (result.flags.contains(NdefFlags::SUPPORTED)
                && !result.flags.contains(NdefFlags::UNKNOWN));
        let mode = if !capable {
            NdefMode::Unknown
        } else if result.flags.contains(NdefFlags::READ_ONLY) {
            NdefMode::ReadOnly
        } else {
            NdefMode::ReadWrite
        };
        NdefInfo {
            capable,
            formatable: result.flags.contains(NdefFlags::FORMATABLE),
            current_size: result.current_size,
            max_size: result.max_size,
            mode,
        }
    }
}

/// NDEF message read from a tag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NdefMessage(pub Bytes);

impl NdefMessage {
    /// Raw message bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for a zero length message.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NdefMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.0))
    }
}
