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

//! Parsing of discovery and activation notifications into UIDs,
//! technology lists and facets.

use crate::hal::{ActivationNtf, DiscoverNtf};
use crate::nci::{Protocol, TechMode, Technology};
use crate::tag::record::{TagFacet, TagRecord};
use log::{debug, warn};
use std::time::Duration;

/// NXP manufacturer code, first byte of a Mifare Ultralight UID.
const NXP_MANUFACTURER_ID: u8 = 0x04;
/// SAK bit announcing Mifare Classic support.
const SAK_MIFARE_CLASSIC: u8 = 0x08;
/// SAK bit announcing ISO 14443-4 compliance.
const SAK_ISO14443_4: u8 = 0x20;

/// NFC-A poll mode parameters, [NCI] 7.1 Table 54.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NfcAParams {
    /// SENS_RES (ATQA).
    pub sens_res: [u8; 2],
    /// NFCID1.
    pub nfcid1: Vec<u8>,
    /// SEL_RES (SAK), absent for T1T.
    pub sel_res: Option<u8>,
}

/// NFC-B poll mode parameters, [NCI] 7.1 Table 56.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NfcBParams {
    /// NFCID0.
    pub nfcid0: [u8; 4],
    /// Application data.
    pub application_data: [u8; 4],
    /// Protocol info.
    pub protocol_info: Vec<u8>,
}

/// NFC-F poll mode parameters, [NCI] 7.1 Table 58.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NfcFParams {
    /// Bit rate of the poll.
    pub bit_rate: u8,
    /// NFCID2.
    pub nfcid2: [u8; 8],
    /// PAD0/PAD1/MRTI/PAD2 (PMm).
    pub pmm: [u8; 8],
    /// Request data (system code), when present.
    pub system_code: Option<[u8; 2]>,
}

/// NFC-V poll mode parameters, [NCI 2.0] Table 64.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NfcVParams {
    /// RES_FLAG.
    pub response_flags: u8,
    /// DSFID.
    pub dsfid: u8,
    /// UID in the order received over the air.
    pub uid: [u8; 8],
}

/// Technology specific parameters of a discovered endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TechParams {
    A(NfcAParams),
    B(NfcBParams),
    F(NfcFParams),
    V(NfcVParams),
}

fn array<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.get(..N)?.try_into().ok()
}

impl TechParams {
    /// Parse the parameters for the technology of `mode`.
    pub fn parse(mode: TechMode, bytes: &[u8]) -> Option<TechParams> {
        match mode {
            TechMode::NfcAPassivePoll => {
                let sens_res = array::<2>(bytes)?;
                let nfcid1_len = *bytes.get(2)? as usize;
                let nfcid1 = bytes.get(3..3 + nfcid1_len)?.to_vec();
                let rest = &bytes[3 + nfcid1_len..];
                let sel_res = match rest.first() {
                    Some(1) => rest.get(1).copied(),
                    _ => None,
                };
                Some(TechParams::A(NfcAParams { sens_res, nfcid1, sel_res }))
            }
            TechMode::NfcBPassivePoll => {
                let len = *bytes.first()? as usize;
                let sensb_res = bytes.get(1..1 + len)?;
                Some(TechParams::B(NfcBParams {
                    nfcid0: array::<4>(sensb_res)?,
                    application_data: array::<4>(sensb_res.get(4..)?)?,
                    protocol_info: sensb_res.get(8..)?.to_vec(),
                }))
            }
            TechMode::NfcFPassivePoll => {
                let bit_rate = *bytes.first()?;
                let len = *bytes.get(1)? as usize;
                let sensf_res = bytes.get(2..2 + len)?;
                Some(TechParams::F(NfcFParams {
                    bit_rate,
                    nfcid2: array::<8>(sensf_res)?,
                    pmm: array::<8>(sensf_res.get(8..)?)?,
                    system_code: sensf_res.get(16..).and_then(array::<2>),
                }))
            }
            TechMode::NfcVPassivePoll => Some(TechParams::V(NfcVParams {
                response_flags: *bytes.first()?,
                dsfid: *bytes.get(1)?,
                uid: array::<8>(bytes.get(2..)?)?,
            })),
            _ => None,
        }
    }

    /// Identifier of the endpoint. NFC-V UIDs are reported most
    /// significant byte first.
    pub fn uid(&self) -> Vec<u8> {
        match self {
            TechParams::A(a) => a.nfcid1.clone(),
            TechParams::B(b) => b.nfcid0.to_vec(),
            TechParams::F(f) => f.nfcid2.to_vec(),
            TechParams::V(v) => v.uid.iter().rev().copied().collect(),
        }
    }

    /// SEL_RES of an NFC-A endpoint.
    pub fn sak(&self) -> Option<u8> {
        match self {
            TechParams::A(a) => a.sel_res,
            _ => None,
        }
    }
}

/// Mifare Ultralight: Type 2 tag from NXP with a zero SAK.
pub fn is_mifare_ultralight(params: &NfcAParams) -> bool {
    params.nfcid1.first() == Some(&NXP_MANUFACTURER_ID) && params.sel_res == Some(0x00)
}

/// SAK of a card answering both as ISO-DEP and Mifare Classic (0x28, 0x38).
pub fn is_multi_protocol_sak(sak: u8) -> bool {
    sak & (SAK_MIFARE_CLASSIC | SAK_ISO14443_4) == SAK_MIFARE_CLASSIC | SAK_ISO14443_4
}

/// Technology list for a protocol reported with a technology and mode.
/// Unknown combinations classify as [`Technology::Unknown`].
pub fn classify(protocol: u8, tech_mode: u8, params: Option<&TechParams>) -> Vec<Technology> {
    let mode = TechMode::try_from(tech_mode).ok();
    match (Protocol::try_from(protocol), mode) {
        (Ok(Protocol::T1t), Some(TechMode::NfcAPassivePoll)) => vec![Technology::NfcA],
        (Ok(Protocol::T2t), Some(TechMode::NfcAPassivePoll)) => match params {
            Some(TechParams::A(a)) if is_mifare_ultralight(a) => {
                vec![Technology::NfcA, Technology::MifareUltralight]
            }
            _ => vec![Technology::NfcA],
        },
        (Ok(Protocol::T3t), Some(TechMode::NfcFPassivePoll)) => vec![Technology::NfcF],
        (Ok(Protocol::IsoDep), Some(TechMode::NfcAPassivePoll)) => {
            vec![Technology::NfcA, Technology::IsoDep]
        }
        (Ok(Protocol::IsoDep), Some(TechMode::NfcBPassivePoll)) => {
            vec![Technology::NfcB, Technology::IsoDep]
        }
        (Ok(Protocol::T5t), Some(TechMode::NfcVPassivePoll)) => vec![Technology::NfcV],
        (Ok(Protocol::Mifare), Some(TechMode::NfcAPassivePoll)) => {
            vec![Technology::NfcA, Technology::MifareClassic]
        }
        (protocol, _) => {
            debug!("unclassified protocol {:?} with mode {:#04x}", protocol, tech_mode);
            vec![Technology::Unknown]
        }
    }
}

/// Answer to select of an ISO-DEP NFC-A card, [DIGITAL] 14.6.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ats {
    /// Frame waiting time integer from TB(1).
    pub fwi: Option<u8>,
    /// Historical bytes.
    pub historical_bytes: Vec<u8>,
}

impl Ats {
    /// Parse an ATS without its length byte.
    pub fn parse(ats: &[u8]) -> Ats {
        let Some(&t0) = ats.first() else { return Ats::default() };
        let mut index = 1;
        if t0 & 0x10 != 0 {
            index += 1;
        }
        let mut fwi = None;
        if t0 & 0x20 != 0 {
            fwi = ats.get(index).map(|tb| tb >> 4);
            index += 1;
        }
        if t0 & 0x40 != 0 {
            index += 1;
        }
        Ats { fwi, historical_bytes: ats.get(index..).unwrap_or_default().to_vec() }
    }

    /// Frame waiting time: (256 * 16 / fc) * 2^FWI, about 302us * 2^FWI.
    pub fn frame_wait_time(&self) -> Option<Duration> {
        let fwi = self.fwi.filter(|fwi| *fwi <= 14)?;
        Some(Duration::from_micros(302 * (1u64 << fwi)))
    }
}

fn length_prefixed(bytes: &[u8]) -> &[u8] {
    match bytes.split_first() {
        Some((&len, rest)) => rest.get(..len as usize).unwrap_or(rest),
        None => &[],
    }
}

/// Poll and activation bytes of one technology of an endpoint.
fn facet_bytes(
    technology: Technology,
    params: Option<&TechParams>,
    activation_params: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    match (technology, params) {
        (
            Technology::NfcA | Technology::MifareClassic | Technology::MifareUltralight,
            Some(TechParams::A(a)),
        ) => (a.sens_res.to_vec(), a.sel_res.into_iter().collect()),
        (Technology::NfcB, Some(TechParams::B(b))) => {
            let mut poll = b.application_data.to_vec();
            poll.extend_from_slice(&b.protocol_info);
            (poll, vec![])
        }
        (Technology::NfcF, Some(TechParams::F(f))) => {
            let mut poll = f.pmm.to_vec();
            poll.extend(f.system_code.iter().flatten());
            (poll, vec![])
        }
        (Technology::NfcV, Some(TechParams::V(v))) => (vec![v.response_flags, v.dsfid], vec![]),
        (Technology::IsoDep, Some(TechParams::A(_))) => {
            (vec![], Ats::parse(length_prefixed(activation_params)).historical_bytes)
        }
        (Technology::IsoDep, Some(TechParams::B(_))) => {
            // ATTRIB response: MBLI/DID byte followed by the higher layer response.
            let attrib = length_prefixed(activation_params);
            (vec![], attrib.get(1..).unwrap_or_default().to_vec())
        }
        _ => (vec![], vec![]),
    }
}

/// Endpoint characterized from a discovery or activation notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// RF discovery identifier.
    pub discovery_id: u8,
    /// Raw protocol code.
    pub protocol_code: u8,
    /// Technology and mode, if known.
    pub tech_mode: Option<TechMode>,
    /// Parsed technology parameters.
    pub params: Option<TechParams>,
    /// Facets, one per technology.
    pub facets: Vec<TagFacet>,
    /// Frame waiting time for ISO-DEP NFC-A cards.
    pub frame_wait_time: Option<Duration>,
}

impl Endpoint {
    fn build(
        discovery_id: u8,
        protocol_code: u8,
        tech_mode: u8,
        tech_params: &[u8],
        activation_params: &[u8],
    ) -> Endpoint {
        let mode = TechMode::try_from(tech_mode).ok();
        let params = mode.and_then(|mode| TechParams::parse(mode, tech_params));
        if mode.is_some() && params.is_none() {
            warn!("malformed technology parameters for mode {:#04x}", tech_mode);
        }
        let protocol = Protocol::try_from(protocol_code).unwrap_or(Protocol::Undetermined);
        let facets = classify(protocol_code, tech_mode, params.as_ref())
            .into_iter()
            .map(|technology| {
                let (poll_bytes, act_bytes) =
                    facet_bytes(technology, params.as_ref(), activation_params);
                TagFacet { technology, discovery_id, protocol, poll_bytes, act_bytes }
            })
            .collect();
        let frame_wait_time = match (protocol, &params) {
            (Protocol::IsoDep, Some(TechParams::A(_))) => {
                Ats::parse(length_prefixed(activation_params)).frame_wait_time()
            }
            _ => None,
        };
        Endpoint { discovery_id, protocol_code, tech_mode: mode, params, facets, frame_wait_time }
    }

    /// Characterize a discovered endpoint.
    pub fn from_discovery(ntf: &DiscoverNtf) -> Endpoint {
        Endpoint::build(ntf.discovery_id, ntf.protocol, ntf.tech_mode, &ntf.tech_params, &[])
    }

    /// Characterize an activated endpoint.
    pub fn from_activation(ntf: &ActivationNtf) -> Endpoint {
        Endpoint::build(
            ntf.discovery_id,
            ntf.protocol,
            ntf.tech_mode,
            &ntf.tech_params,
            &ntf.activation_params,
        )
    }

    /// Typed protocol, `Undetermined` for unknown codes.
    pub fn protocol(&self) -> Protocol {
        Protocol::try_from(self.protocol_code).unwrap_or(Protocol::Undetermined)
    }

    /// Endpoint identifier, empty when the parameters are malformed.
    pub fn uid(&self) -> Vec<u8> {
        self.params.as_ref().map(TechParams::uid).unwrap_or_default()
    }

    /// Freeze the endpoint into a tag record, appending the facets of
    /// other protocols of the same card.
    pub fn into_record(self, merged: Vec<TagFacet>) -> Option<TagRecord> {
        let uid = self.uid();
        let mut facets = self.facets;
        for facet in merged {
            if !facets.iter().any(|f| f.technology == facet.technology) {
                facets.push(facet);
            }
        }
        TagRecord::new(uid, facets, self.tech_mode, self.frame_wait_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nci::RfInterface;

    fn nfca_params(nfcid1: &[u8], sak: u8) -> Vec<u8> {
        let mut bytes = vec![0x44, 0x00, nfcid1.len() as u8];
        bytes.extend_from_slice(nfcid1);
        bytes.extend_from_slice(&[1, sak]);
        bytes
    }

    fn activation(
        protocol: u8,
        tech_mode: u8,
        tech_params: Vec<u8>,
        act: Vec<u8>,
    ) -> ActivationNtf {
        ActivationNtf {
            discovery_id: 1,
            interface: RfInterface::Frame,
            protocol,
            tech_mode,
            tech_params,
            activation_params: act,
        }
    }

    #[test]
    fn iso_dep_over_nfca() {
        // ATS: T0 with TA/TB/TC present, FWI 8, historical bytes 80 31.
        let ats = vec![0x06, 0x75, 0x77, 0x81, 0x02, 0x80, 0x31];
        let mut act = vec![ats.len() as u8];
        act.extend(ats);
        let endpoint = Endpoint::from_activation(&activation(
            0x04,
            0x00,
            nfca_params(&[0x08, 0x11, 0x22, 0x33], 0x20),
            act,
        ));
        let record = endpoint.into_record(vec![]).unwrap();
        assert_eq!(record.technologies(), vec![Technology::NfcA, Technology::IsoDep]);
        assert_eq!(record.uid(), &[0x08, 0x11, 0x22, 0x33]);
        assert_eq!(record.facets()[0].poll_bytes, vec![0x44, 0x00]);
        assert_eq!(record.facets()[0].act_bytes, vec![0x20]);
        assert_eq!(record.facets()[1].act_bytes, vec![0x80, 0x31]);
        assert_eq!(record.frame_wait_time(), Some(Duration::from_micros(302 * 256)));
    }

    #[test]
    fn ultralight_is_sub_classified() {
        let params = nfca_params(&[0x04, 1, 2, 3, 4, 5, 6], 0x00);
        let endpoint = Endpoint::from_activation(&activation(0x02, 0x00, params, vec![]));
        assert_eq!(
            endpoint.facets.iter().map(|f| f.technology).collect::<Vec<_>>(),
            vec![Technology::NfcA, Technology::MifareUltralight]
        );

        let params = nfca_params(&[0x05, 1, 2, 3, 4, 5, 6], 0x00);
        let endpoint = Endpoint::from_activation(&activation(0x02, 0x00, params, vec![]));
        assert_eq!(endpoint.facets.len(), 1);
    }

    #[test]
    fn mifare_protocol_is_nfca_and_classic() {
        let params = nfca_params(&[1, 2, 3, 4], 0x08);
        let endpoint = Endpoint::from_activation(&activation(0x80, 0x00, params, vec![]));
        let techs: Vec<_> = endpoint.facets.iter().map(|f| f.technology).collect();
        assert_eq!(techs, vec![Technology::NfcA, Technology::MifareClassic]);
        assert!(endpoint.facets.iter().all(|f| f.protocol == Protocol::Mifare));
    }

    #[test]
    fn nfcb_nfcf_nfcv_layouts() {
        let sensb = [0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4, 0x80, 0x81, 0x82];
        let mut params = vec![sensb.len() as u8];
        params.extend(sensb);
        let endpoint = Endpoint::from_activation(&activation(0x04, 0x01, params, vec![1, 0x00]));
        assert_eq!(endpoint.uid(), vec![0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(endpoint.facets[0].technology, Technology::NfcB);
        assert_eq!(endpoint.facets[0].poll_bytes, vec![1, 2, 3, 4, 0x80, 0x81, 0x82]);

        let mut sensf = (1..=8).collect::<Vec<u8>>();
        sensf.extend(0x10..0x18);
        sensf.extend([0x12, 0xfc]);
        let mut params = vec![0x01, sensf.len() as u8];
        params.extend(sensf);
        let endpoint = Endpoint::from_activation(&activation(0x03, 0x02, params, vec![]));
        assert_eq!(endpoint.uid(), (1..=8).collect::<Vec<u8>>());
        assert_eq!(endpoint.facets[0].poll_bytes.len(), 10);
        assert_eq!(&endpoint.facets[0].poll_bytes[8..], &[0x12, 0xfc]);

        let params = vec![0x00, 0x01, 1, 2, 3, 4, 5, 6, 7, 0xe0];
        let endpoint = Endpoint::from_activation(&activation(0x06, 0x06, params, vec![]));
        assert_eq!(endpoint.uid(), vec![0xe0, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(endpoint.facets[0].poll_bytes, vec![0x00, 0x01]);
    }

    #[test]
    fn unknown_combinations_classify_as_unknown() {
        assert_eq!(classify(0x42, 0x00, None), vec![Technology::Unknown]);
        assert_eq!(classify(0x03, 0x00, None), vec![Technology::Unknown]);
        assert_eq!(classify(0x05, 0x00, None), vec![Technology::Unknown]);
        let endpoint = Endpoint::from_activation(&activation(0x42, 0x77, vec![], vec![]));
        assert_eq!(endpoint.facets.len(), 1);
        assert!(endpoint.uid().is_empty());
    }

    #[test]
    fn known_pairs_are_deterministic_and_aligned() {
        let cases: [(u8, u8, Vec<u8>); 5] = [
            (0x01, 0x00, nfca_params(&[1, 2, 3, 4], 0x00)),
            (0x02, 0x00, nfca_params(&[4, 2, 3, 4, 5, 6, 7], 0x00)),
            (0x04, 0x00, nfca_params(&[1, 2, 3, 4], 0x20)),
            (0x80, 0x00, nfca_params(&[1, 2, 3, 4], 0x08)),
            (0x06, 0x06, vec![0, 0, 1, 2, 3, 4, 5, 6, 7, 8]),
        ];
        for (protocol, mode, params) in cases {
            let ntf = activation(protocol, mode, params.clone(), vec![]);
            let first = Endpoint::from_activation(&ntf);
            let second = Endpoint::from_activation(&activation(protocol, mode, params, vec![]));
            assert!(!first.facets.is_empty());
            assert_eq!(first, second);
            assert!(first.facets.iter().all(|f| f.discovery_id == 1));
        }
    }

    #[test]
    fn multi_protocol_sak() {
        assert!(is_multi_protocol_sak(0x28));
        assert!(is_multi_protocol_sak(0x38));
        assert!(!is_multi_protocol_sak(0x20));
        assert!(!is_multi_protocol_sak(0x08));
    }
}
