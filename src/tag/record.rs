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

//! Description of one physically present tag.

use crate::nci::{Protocol, RfInterface, TechMode, Technology};
use crate::tag::ndef::NdefMode;
use std::time::Duration;

/// One technology-level presentation of a tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagFacet {
    /// Technology class exposed to the dispatcher.
    pub technology: Technology,
    /// RF discovery identifier used to select the facet.
    pub discovery_id: u8,
    /// RF protocol of the facet.
    pub protocol: Protocol,
    /// Technology specific poll bytes (ATQA, PMm, ...).
    pub poll_bytes: Vec<u8>,
    /// Technology specific activation bytes (SAK, historical bytes, ...).
    pub act_bytes: Vec<u8>,
}

impl TagFacet {
    /// RF interface required to communicate with the facet.
    ///
    /// NFC-A or NFC-B access to an ISO-DEP card goes through the frame
    /// interface; Mifare Classic through the proprietary interface.
    pub fn interface(&self) -> RfInterface {
        match (self.technology, self.protocol) {
            (Technology::IsoDep, _) => RfInterface::IsoDep,
            (Technology::MifareClassic, _) | (_, Protocol::Mifare) => RfInterface::Mifare,
            _ => RfInterface::Frame,
        }
    }
}

/// Immutable description of a tag handed to the dispatcher.
///
/// The facets are ordered; index 0 is the primary facet used for the
/// UID and discovery identifier lookups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagRecord {
    uid: Vec<u8>,
    facets: Vec<TagFacet>,
    tech_mode: Option<TechMode>,
    frame_wait_time: Option<Duration>,
}

impl TagRecord {
    /// Build a record. Returns `None` when no facet is given.
    pub fn new(
        uid: Vec<u8>,
        facets: Vec<TagFacet>,
        tech_mode: Option<TechMode>,
        frame_wait_time: Option<Duration>,
    ) -> Option<Self> {
        if facets.is_empty() {
            return None;
        }
        Some(TagRecord { uid, facets, tech_mode, frame_wait_time })
    }

    /// Tag identifier.
    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    /// Discovery identifier of the primary facet.
    pub fn handle(&self) -> u8 {
        self.facets[0].discovery_id
    }

    /// Ordered facets.
    pub fn facets(&self) -> &[TagFacet] {
        &self.facets
    }

    /// Facet at `index`.
    pub fn facet(&self, index: usize) -> Option<&TagFacet> {
        self.facets.get(index)
    }

    /// Ordered technology list.
    pub fn technologies(&self) -> Vec<Technology> {
        self.facets.iter().map(|facet| facet.technology).collect()
    }

    /// Index of the first facet of a technology.
    pub fn index_of(&self, technology: Technology) -> Option<usize> {
        self.facets.iter().position(|facet| facet.technology == technology)
    }

    /// Technology and mode of the activation.
    pub fn tech_mode(&self) -> Option<TechMode> {
        self.tech_mode
    }

    /// Frame waiting time announced by an ISO-DEP card.
    pub fn frame_wait_time(&self) -> Option<Duration> {
        self.frame_wait_time
    }

    /// Facet used for NDEF operations: ISO-DEP first, then Mifare
    /// Classic, then the primary facet.
    pub fn ndef_facet_index(&self) -> usize {
        self.index_of(Technology::IsoDep)
            .or_else(|| self.index_of(Technology::MifareClassic))
            .unwrap_or(0)
    }

    /// Decoded technology extras of the facet at `index`.
    pub fn extras(&self, index: usize) -> Option<TechExtras> {
        self.facets.get(index).map(|facet| TechExtras::decode(facet, self.tech_mode))
    }
}

/// Technology specific metadata exposed to consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TechExtras {
    NfcA { atqa: Vec<u8>, sak: u8 },
    NfcB { application_data: Vec<u8>, protocol_info: Vec<u8> },
    NfcF { pmm: Vec<u8>, system_code: Vec<u8> },
    NfcV { response_flags: u8, dsfid: u8 },
    IsoDep { historical_bytes: Option<Vec<u8>>, hi_layer_response: Option<Vec<u8>> },
    MifareClassic { atqa: Vec<u8>, sak: u8 },
    MifareUltralight { atqa: Vec<u8>, sak: u8 },
    Ndef { max_size: u32, mode: NdefMode, message: Vec<u8> },
    None,
}

impl TechExtras {
    fn decode(facet: &TagFacet, tech_mode: Option<TechMode>) -> TechExtras {
        let sak = facet.act_bytes.first().copied().unwrap_or(0);
        match facet.technology {
            Technology::NfcA => TechExtras::NfcA { atqa: facet.poll_bytes.clone(), sak },
            Technology::MifareClassic => {
                TechExtras::MifareClassic { atqa: facet.poll_bytes.clone(), sak }
            }
            Technology::MifareUltralight => {
                TechExtras::MifareUltralight { atqa: facet.poll_bytes.clone(), sak }
            }
            Technology::NfcB => {
                let split = facet.poll_bytes.len().min(4);
                TechExtras::NfcB {
                    application_data: facet.poll_bytes[..split].to_vec(),
                    protocol_info: facet.poll_bytes[split..].to_vec(),
                }
            }
            Technology::NfcF => {
                let split = facet.poll_bytes.len().min(8);
                TechExtras::NfcF {
                    pmm: facet.poll_bytes[..split].to_vec(),
                    system_code: facet.poll_bytes[split..].to_vec(),
                }
            }
            Technology::NfcV => TechExtras::NfcV {
                response_flags: facet.poll_bytes.first().copied().unwrap_or(0),
                dsfid: facet.poll_bytes.get(1).copied().unwrap_or(0),
            },
            Technology::IsoDep => {
                if tech_mode == Some(TechMode::NfcBPassivePoll) {
                    TechExtras::IsoDep {
                        historical_bytes: None,
                        hi_layer_response: Some(facet.act_bytes.clone()),
                    }
                } else {
                    TechExtras::IsoDep {
                        historical_bytes: Some(facet.act_bytes.clone()),
                        hi_layer_response: None,
                    }
                }
            }
            _ => TechExtras::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facet(technology: Technology, protocol: Protocol) -> TagFacet {
        TagFacet {
            technology,
            discovery_id: 1,
            protocol,
            poll_bytes: vec![0x44, 0x00],
            act_bytes: vec![0x20],
        }
    }

    #[test]
    fn empty_record_rejected() {
        assert_eq!(TagRecord::new(vec![1], vec![], None, None), None);
    }

    #[test]
    fn facet_interfaces() {
        assert_eq!(facet(Technology::IsoDep, Protocol::IsoDep).interface(), RfInterface::IsoDep);
        assert_eq!(facet(Technology::NfcA, Protocol::IsoDep).interface(), RfInterface::Frame);
        assert_eq!(facet(Technology::NfcA, Protocol::Mifare).interface(), RfInterface::Mifare);
        assert_eq!(facet(Technology::NfcA, Protocol::T2t).interface(), RfInterface::Frame);
    }

    #[test]
    fn ndef_facet_prefers_iso_dep() {
        let record = TagRecord::new(
            vec![1, 2, 3, 4],
            vec![
                facet(Technology::NfcA, Protocol::IsoDep),
                facet(Technology::IsoDep, Protocol::IsoDep),
            ],
            Some(TechMode::NfcAPassivePoll),
            None,
        )
        .unwrap();
        assert_eq!(record.ndef_facet_index(), 1);
        assert_eq!(record.handle(), 1);
        assert_eq!(record.extras(0), Some(TechExtras::NfcA { atqa: vec![0x44, 0x00], sak: 0x20 }));
    }
}
