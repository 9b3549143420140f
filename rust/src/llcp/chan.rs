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

//! Data channel selection, Vol 6, Part B, 4.5.8.

use crate::packets::hci::ChanSel;

pub const NUM_DATA_CHANNELS: u8 = 37;

/// Bitmap of the 37 data channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelMap(u64);

impl Default for ChannelMap {
    fn default() -> Self {
        ChannelMap::ALL
    }
}

impl ChannelMap {
    pub const ALL: ChannelMap = ChannelMap(0x1f_ffff_ffff);

    pub fn new(bits: u64) -> ChannelMap {
        ChannelMap(bits & ChannelMap::ALL.0)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// A channel map needs at least two used channels.
    pub fn is_valid(&self) -> bool {
        self.num_used() >= 2
    }

    pub fn is_used(&self, channel: u8) -> bool {
        channel < NUM_DATA_CHANNELS && (self.0 >> channel) & 1 != 0
    }

    pub fn num_used(&self) -> u8 {
        self.0.count_ones() as u8
    }

    /// Used channel at position `index` of the remapping table.
    fn remap(&self, index: u8) -> u8 {
        (0..NUM_DATA_CHANNELS).filter(|channel| self.is_used(*channel)).nth(index as usize).unwrap_or(0)
    }

    /// Position of a used channel in the remapping table.
    fn remap_index(&self, channel: u8) -> u8 {
        (self.0 & ((1u64 << channel) - 1)).count_ones() as u8
    }
}

/// Channel Selection Algorithm #1. Returns the next unmapped channel
/// and the data channel to use.
pub fn csa1_select(last_unmapped: u8, hop_inc: u8, map: &ChannelMap) -> (u8, u8) {
    let unmapped = (last_unmapped + hop_inc) % NUM_DATA_CHANNELS;
    if map.is_used(unmapped) || map.num_used() == 0 {
        (unmapped, unmapped)
    } else {
        (unmapped, map.remap(unmapped % map.num_used()))
    }
}

/// Channel identifier of Channel Selection Algorithm #2.
pub fn csa2_channel_identifier(access_address: u32) -> u16 {
    ((access_address >> 16) ^ (access_address & 0xffff)) as u16
}

fn perm(value: u16) -> u16 {
    let [low, high] = value.to_le_bytes();
    u16::from_le_bytes([low.reverse_bits(), high.reverse_bits()])
}

fn mam(a: u16, b: u16) -> u16 {
    (17u32 * a as u32 + b as u32) as u16
}

/// Unmapped event pseudo random number, prn_s.
fn csa2_prn_s(counter: u16, ch_id: u16) -> u16 {
    let mut value = counter ^ ch_id;
    for _ in 0..3 {
        value = mam(perm(value), ch_id);
    }
    value
}

/// Event channel selected by Channel Selection Algorithm #2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Csa2Event {
    pub channel: u8,
    pub prn_s: u16,
    /// Position of `channel` in the remapping table.
    pub index: u8,
}

pub fn csa2_select(counter: u16, ch_id: u16, map: &ChannelMap) -> Csa2Event {
    let prn_s = csa2_prn_s(counter, ch_id);
    let prn_e = prn_s ^ ch_id;
    let unmapped = (prn_e % NUM_DATA_CHANNELS as u16) as u8;
    if map.is_used(unmapped) {
        Csa2Event { channel: unmapped, prn_s, index: map.remap_index(unmapped) }
    } else {
        let index = ((map.num_used() as u32 * prn_e as u32) >> 16) as u8;
        Csa2Event { channel: map.remap(index), prn_s, index }
    }
}

/// Sub-event channel state of Channel Selection Algorithm #2, reset
/// at every event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Csa2SubEvt {
    prn_lu: u16,
    index: u8,
}

impl Csa2SubEvt {
    pub fn new(event: &Csa2Event) -> Csa2SubEvt {
        Csa2SubEvt { prn_lu: event.prn_s, index: event.index }
    }

    /// Channel of the next sub-event.
    pub fn next(&mut self, ch_id: u16, map: &ChannelMap) -> u8 {
        let n = map.num_used() as i32;
        if n == 0 {
            return 0;
        }
        self.prn_lu = mam(perm(self.prn_lu), ch_id);
        let prn_se = (self.prn_lu ^ ch_id) as i32;
        let d = (n - 5).min(3).max(((n - 10) / 2).min(11)).max(1);
        let step = d + ((prn_se * (n - 2 * d + 1)) >> 16);
        self.index = ((self.index as i32 + step) % n) as u8;
        map.remap(self.index)
    }
}

/// Channel parameters of an ACL connection. The algorithm is fixed
/// when the connection is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclChanParam {
    pub map: ChannelMap,
    pub algorithm: ChanSel,
    pub hop_inc: u8,
    pub last_unmapped: u8,
    pub ch_id: u16,
}

impl AclChanParam {
    pub fn new(access_address: u32, map: ChannelMap, hop_inc: u8, algorithm: ChanSel) -> Self {
        AclChanParam {
            map,
            algorithm,
            hop_inc,
            last_unmapped: 0,
            ch_id: csa2_channel_identifier(access_address),
        }
    }

    /// Data channel of connection event `counter`.
    pub fn select(&mut self, counter: u16) -> u8 {
        match self.algorithm {
            ChanSel::Csa1 => {
                let (unmapped, channel) = csa1_select(self.last_unmapped, self.hop_inc, &self.map);
                self.last_unmapped = unmapped;
                channel
            }
            ChanSel::Csa2 => csa2_select(counter, self.ch_id, &self.map).channel,
        }
    }
}

/// Channel parameters of a CIS, always Channel Selection Algorithm #2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CisChanParam {
    pub map: ChannelMap,
    pub ch_id: u16,
    /// Channel of the current event.
    pub chan_idx: u8,
    sub_evt: Csa2SubEvt,
    /// Sub-events of the current event already handed out.
    sub_evt_num: u8,
}

impl CisChanParam {
    /// Initial setup when the CIS access address becomes known.
    pub fn setup(access_address: u32, map: ChannelMap) -> Self {
        CisChanParam {
            map,
            ch_id: csa2_channel_identifier(access_address),
            chan_idx: 0,
            sub_evt: Csa2SubEvt::default(),
            sub_evt_num: 0,
        }
    }

    /// Channel map update. The channel identifier and the sub-event
    /// state are kept.
    pub fn update(&mut self, map: ChannelMap) {
        self.map = map;
    }

    /// Select the channel of CIS event `counter` and reset the
    /// sub-event sequence.
    pub fn select_event(&mut self, counter: u16) -> u8 {
        let event = csa2_select(counter, self.ch_id, &self.map);
        self.chan_idx = event.channel;
        self.sub_evt = Csa2SubEvt::new(&event);
        self.sub_evt_num = 0;
        event.channel
    }

    pub fn next_sub_event(&mut self) -> u8 {
        self.sub_evt.next(self.ch_id, &self.map)
    }

    /// Channel of the next sub-event of the current event. The first
    /// sub-event uses the event channel.
    pub fn sub_event_chan(&mut self) -> u8 {
        let chan = match self.sub_evt_num {
            0 => self.chan_idx,
            _ => self.next_sub_event(),
        };
        self.sub_evt_num = self.sub_evt_num.saturating_add(1);
        chan
    }

    pub fn sub_evt_num(&self) -> u8 {
        self.sub_evt_num
    }
}
