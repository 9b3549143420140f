// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Timing math: access address, CRC seed and hop increment
//! generation, window widening, packet and sub-event durations.

use num_derive::FromPrimitive;

#[allow(non_camel_case_types)]
pub type microseconds = u32;

/// Inter frame space.
pub const T_IFS_USEC: microseconds = 150;

/// Access address of advertising physical channel PDUs.
pub const ADVERTISING_ACCESS_ADDRESS: u32 = 0x8e89_bed6;

/// Connection interval and ISO interval unit.
pub const INTERVAL_UNIT_USEC: microseconds = 1250;

/// Sleep clock accuracy, in ppm, indexed by SCA code.
const SCA_PPM: [u16; 8] = [500, 250, 150, 100, 75, 50, 30, 20];

/// LE PHYs, encoded as in HCI events. PDUs carry the bitmask form.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
pub enum Phy {
    #[default]
    Le1m = 1,
    Le2m = 2,
    LeCoded = 3,
}

impl Phy {
    pub fn from_mask(mask: u8) -> Option<Phy> {
        match mask {
            0x1 => Some(Phy::Le1m),
            0x2 => Some(Phy::Le2m),
            0x4 => Some(Phy::LeCoded),
            _ => None,
        }
    }

    pub fn mask(self) -> u8 {
        match self {
            Phy::Le1m => 0x1,
            Phy::Le2m => 0x2,
            Phy::LeCoded => 0x4,
        }
    }

    /// Select one PHY in the enabled mask with the priority
    /// LE 2M > LE 1M > LE Coded.
    pub fn select(mask: u8) -> Option<Phy> {
        if mask & 0x2 != 0 {
            Some(Phy::Le2m)
        } else if mask & 0x1 != 0 {
            Some(Phy::Le1m)
        } else if mask & 0x4 != 0 {
            Some(Phy::LeCoded)
        } else {
            None
        }
    }
}

/// Vol 6, Part B, 2.1.2 access address requirements.
pub fn is_valid_access_address(access_address: u32) -> bool {
    if (access_address ^ ADVERTISING_ACCESS_ADDRESS).count_ones() <= 1 {
        return false;
    }

    let octets = access_address.to_le_bytes();
    if octets.iter().all(|octet| *octet == octets[0]) {
        return false;
    }

    let transitions = (access_address ^ (access_address >> 1)) & 0x7fff_ffff;
    if transitions.count_ones() > 24 {
        return false;
    }

    // No more than six consecutive zeros or ones.
    let mut run = 1;
    for bit in 1..32 {
        if (access_address >> bit) & 1 == (access_address >> (bit - 1)) & 1 {
            run += 1;
            if run > 6 {
                return false;
            }
        } else {
            run = 1;
        }
    }

    // At least two transitions in the six most significant bits.
    let msb = access_address >> 26;
    ((msb ^ (msb >> 1)) & 0x1f).count_ones() >= 2
}

/// Draw random words until one is a legal access address.
pub fn compute_access_address(mut random: impl FnMut() -> u32) -> u32 {
    loop {
        let access_address = random();
        if is_valid_access_address(access_address) {
            return access_address;
        }
    }
}

pub fn compute_crc_init(random: u32) -> u32 {
    random & 0x00ff_ffff
}

/// Hop increment in [5, 16], shaped as the sum of a 3-bit, a 2-bit
/// and a 1-bit field of the random word.
pub fn compute_hop_inc(random: u32) -> u8 {
    ((random & 0x7) + ((random >> 3) & 0x3) + ((random >> 5) & 0x1) + 5) as u8
}

pub fn sca_to_ppm(sca: u8) -> u16 {
    SCA_PPM[(sca & 0x7) as usize]
}

/// Drift bound accumulated over `unsync_usec` with a combined clock
/// accuracy of `ppm`, rounded up.
pub fn calc_window_widening_usec(unsync_usec: u64, ppm: u32) -> microseconds {
    let widening = (unsync_usec * ppm as u64).div_ceil(1_000_000);
    widening.min(microseconds::MAX as u64) as microseconds
}

/// Window widening may not exceed half the interval minus T_IFS.
pub fn cap_window_widening_usec(widening: microseconds, interval_usec: microseconds) -> microseconds {
    widening.min((interval_usec / 2).saturating_sub(T_IFS_USEC))
}

/// Air time of a CIS PDU with a `len` octet payload. The MIC is always
/// accounted for.
pub fn cis_pdu_duration_usec(phy: Phy, len: u16) -> microseconds {
    const HEADER: u32 = 2;
    const MIC: u32 = 4;
    const CRC: u32 = 3;
    const ACCESS_ADDRESS: u32 = 4;
    let len = len as u32;
    match phy {
        Phy::Le1m => (1 + ACCESS_ADDRESS + HEADER + len + MIC + CRC) * 8,
        Phy::Le2m => (2 + ACCESS_ADDRESS + HEADER + len + MIC + CRC) * 4,
        // S=8: preamble, access address, CI and TERM1 take 376us, the
        // payload is 64us per octet and TERM2 24us.
        Phy::LeCoded => 376 + (HEADER + len + MIC + CRC) * 64 + 24,
    }
}

/// Direction parameters used for sub-event duration computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubEvtLink {
    pub phy_c_to_p: Phy,
    pub max_pdu_c_to_p: u16,
    pub phy_p_to_c: Phy,
    pub max_pdu_p_to_c: u16,
}

/// Duration of one sub-event of a CIS with sequential packing.
pub fn calc_sub_evt_duration_usec_seq(link: &SubEvtLink, sub_evt_delay_usec: microseconds) -> microseconds {
    cis_pdu_duration_usec(link.phy_c_to_p, link.max_pdu_c_to_p)
        + T_IFS_USEC
        + cis_pdu_duration_usec(link.phy_p_to_c, link.max_pdu_p_to_c)
        + T_IFS_USEC
        + sub_evt_delay_usec
}

/// Duration of one interleaved sub-event, covering every CIS of the CIG.
pub fn calc_sub_evt_duration_usec_inter<'a>(
    links: impl IntoIterator<Item = &'a SubEvtLink>,
    sub_evt_delay_usec: microseconds,
) -> microseconds {
    links.into_iter().map(|link| calc_sub_evt_duration_usec_seq(link, sub_evt_delay_usec)).sum()
}
