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

//! Error type shared by the adapters.

use crate::nci::Status;
use thiserror::Error;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the NCI core. Controller statuses and wait
/// timeouts are returned as values; nothing in the core panics on a
/// hardware failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The controller or HAL returned a non-OK status.
    #[error("controller returned status {0}")]
    Status(Status),
    /// The completion event did not arrive in time.
    #[error("timed out waiting for completion")]
    Timeout,
    /// The pending wait was released because the link was declared lost.
    #[error("wait aborted")]
    Aborted,
    /// The controller is not enabled or the tag is not activated.
    #[error("controller or tag not active")]
    NotActive,
    /// No technology of the tag is currently connected.
    #[error("tag not connected")]
    NotConnected,
    /// The technology is not part of the tag's technology list.
    #[error("invalid technology index or list")]
    InvalidTechnology,
    /// No remote endpoint session exists for the operation.
    #[error("no remote session")]
    NoRemoteSession,
    /// The tag cannot hold an NDEF message.
    #[error("tag is not NDEF capable")]
    NotNdefCapable,
    /// The NDEF area is read-only.
    #[error("tag is read-only")]
    ReadOnly,
    /// The NDEF message does not fit on the tag.
    #[error("NDEF message of {size} bytes exceeds capacity {max}")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Capacity reported by NDEF detection.
        max: usize,
    },
    /// An optional HAL entry point is not provided by the library.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// No HAL library could be resolved.
    #[error("HAL library {0} unavailable")]
    HalUnavailable(String),
    /// The HAL library lacks a required entry point.
    #[error("HAL library {library} is missing entry point {entry_point}")]
    MissingEntryPoint {
        /// Library path.
        library: String,
        /// Name of the first missing entry point.
        entry_point: &'static str,
    },
    /// A routing entry failed validation.
    #[error("routing to NFCEE {route:#04x} rejected: {reason}")]
    RouteRejected {
        /// Destination NFCEE identifier.
        route: u8,
        /// Validation failure.
        reason: &'static str,
    },
}

impl Error {
    /// Convert a HAL command status into a result.
    pub fn check(status: Status) -> Result<()> {
        if status.is_ok() {
            Ok(())
        } else {
            Err(Error::Status(status))
        }
    }
}
