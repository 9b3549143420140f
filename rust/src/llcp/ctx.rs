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

//! Connection, CIG and CIS contexts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::llcp::chan::{AclChanParam, ChannelMap, CisChanParam};
use crate::llcp::cis_est::CisEstState;
use crate::llcp::cis_term::CisTermState;
use crate::llcp::cmn::CmnState;
use crate::llcp::conn_upd::{ConnUpdParams, ConnUpdState};
use crate::llcp::list::{CisList, FtList};
use crate::llcp::phy_upd::PhyUpdState;
use crate::llcp::procedure::LlcpOwner;
use crate::llcp::timing::{microseconds, Phy, SubEvtLink, INTERVAL_UNIT_USEC};
use crate::packets::hci::{ChanSel, ErrorCode, Role};
use crate::packets::llcp;

/// Maximum number of payloads tracked per flush timeout list.
const MAX_FT_ENTRIES: usize = 16;

/// Connection parameters of a newly established ACL link, as taken
/// from the CONNECT_IND exchange.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnParams {
    pub handle: u16,
    /// 0: central, 1: peripheral.
    pub role: u8,
    pub peer_address_type: u8,
    pub peer_address: [u8; 6],
    /// Ignored for the central role, generated locally.
    pub access_address: u32,
    /// Ignored for the central role, generated locally.
    pub crc_init: u32,
    /// Ignored for the central role, generated locally.
    pub hop_inc: u8,
    /// 0: algorithm #1, 1: algorithm #2.
    pub chan_sel: u8,
    pub channel_map: u64,
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
    pub peer_sca: u8,
    /// Time of the first connection event anchor.
    pub anchor_usec: u64,
}

/// Encryption state. The packet counters are also written by the
/// radio completion path.
#[derive(Debug, Default)]
pub struct EncBlock {
    pub enabled: bool,
    pub session_key: [u8; 16],
    pub iv: [u8; 8],
    pub tx_pkt_counter: AtomicU64,
    pub rx_pkt_counter: AtomicU64,
}

impl EncBlock {
    pub fn new(session_key: [u8; 16], iv: [u8; 8]) -> EncBlock {
        EncBlock { enabled: true, session_key, iv, ..Default::default() }
    }

    /// Encryption block of a CIS on this ACL: same session key, the
    /// four least significant IV octets XOR-ed with the CIS access
    /// address.
    pub fn derive_cis(&self, access_address: u32) -> EncBlock {
        if !self.enabled {
            return EncBlock::default();
        }
        let mut iv = self.iv;
        for (octet, aa) in iv.iter_mut().zip(access_address.to_le_bytes()) {
            *octet ^= aa;
        }
        EncBlock::new(self.session_key, iv)
    }

    pub fn on_tx(&self) {
        if self.enabled {
            self.tx_pkt_counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn on_rx(&self) {
        if self.enabled {
            self.rx_pkt_counter.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Version information received in LL_VERSION_IND.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerVersion {
    pub version: u8,
    pub company_id: u16,
    pub sub_version: u16,
}

/// ACL connection context.
#[derive(Debug)]
pub struct ConnCtx {
    pub handle: u16,
    pub role: Role,
    pub peer_address_type: u8,
    pub peer_address: [u8; 6],
    pub access_address: u32,
    pub crc_init: u32,
    pub chan: AclChanParam,
    /// Data channel of the current connection event.
    pub data_chan: u8,
    /// Connection interval in 1.25ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10ms units.
    pub supervision_timeout: u16,
    pub event_counter: u16,
    pub anchor_usec: u64,
    /// Anchor of the last connection event with a received packet.
    pub last_sync_usec: u64,
    pub peer_sca: u8,
    pub tx_phy: Phy,
    pub rx_phy: Phy,
    pub peer_features: Option<u64>,
    pub peer_version: Option<PeerVersion>,
    /// LL_VERSION_IND is sent at most once per connection.
    pub version_sent: bool,
    pub peer_data_length: Option<llcp::DataLength>,
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub llcp: LlcpOwner,
    pub cmn: CmnState,
    pub conn_upd: ConnUpdState,
    /// Host request waiting for the procedure slot.
    pub conn_upd_req: Option<ConnUpdParams>,
    pub chan_map_req: Option<ChannelMap>,
    pub phy_upd: PhyUpdState,
    /// Host PHY preference, bitmasks (tx, rx). All PHYs when the host
    /// has no preference.
    pub phy_pref: (u8, u8),
    pub enc: EncBlock,
    /// Central: CIS handles queued by the host for creation.
    pub cis_create_queue: VecDeque<u16>,
    /// Peripheral: LL_CIS_REQ received while the same CIS was
    /// terminating, replayed once termination completes.
    pub pended_cis_req: Option<llcp::CisReq>,
    /// Local termination in progress.
    pub terminate: Option<ErrorCode>,
}

impl ConnCtx {
    pub fn new(params: &ConnParams, role: Role) -> ConnCtx {
        let chan_sel = if params.chan_sel == 1 { ChanSel::Csa2 } else { ChanSel::Csa1 };
        let chan = AclChanParam::new(
            params.access_address,
            ChannelMap::new(params.channel_map),
            params.hop_inc,
            chan_sel,
        );
        ConnCtx {
            handle: params.handle,
            role,
            peer_address_type: params.peer_address_type,
            peer_address: params.peer_address,
            access_address: params.access_address,
            crc_init: params.crc_init,
            chan,
            data_chan: 0,
            interval: params.interval,
            latency: params.latency,
            supervision_timeout: params.supervision_timeout,
            event_counter: 0,
            anchor_usec: params.anchor_usec,
            last_sync_usec: params.anchor_usec,
            peer_sca: params.peer_sca,
            tx_phy: Phy::Le1m,
            rx_phy: Phy::Le1m,
            peer_features: None,
            peer_version: None,
            version_sent: false,
            peer_data_length: None,
            max_tx_octets: 27,
            max_tx_time: 328,
            llcp: LlcpOwner::default(),
            cmn: CmnState::default(),
            conn_upd: ConnUpdState::default(),
            conn_upd_req: None,
            chan_map_req: None,
            phy_upd: PhyUpdState::default(),
            phy_pref: (0x7, 0x7),
            enc: EncBlock::default(),
            cis_create_queue: VecDeque::new(),
            pended_cis_req: None,
            terminate: None,
        }
    }

    pub fn interval_usec(&self) -> microseconds {
        self.interval as microseconds * INTERVAL_UNIT_USEC
    }

    pub fn supervision_timeout_ms(&self) -> u32 {
        self.supervision_timeout as u32 * 10
    }
}

/// Sub-event packing of the CISes of a CIG.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Packing {
    #[default]
    Sequential,
    Interleaved,
}

/// Connected Isochronous Group context.
#[derive(Debug)]
pub struct CigCtx {
    pub cig_id: u8,
    /// Pool index.
    pub cig_handle: u8,
    pub role: Role,
    pub cis_list: CisList,
    pub packing: Packing,
    pub framed: bool,
    /// ISO interval in 1.25ms units.
    pub iso_interval: u16,
    pub sdu_interval_c_to_p: microseconds,
    pub sdu_interval_p_to_c: microseconds,
    pub ft_c_to_p: u8,
    pub ft_p_to_c: u8,
    pub cig_sync_delay_usec: microseconds,
    pub anchor_usec: u64,
    /// Anchor of the last CIG event with a received packet.
    pub last_sync_usec: u64,
    pub num_cis_ested: u8,
    /// The head CIS left the list; the next event anchor is corrected
    /// by the offset of the new head.
    pub head_cis_removed: bool,
    pub removed_head_offset_usec: microseconds,
    /// The CIG operation is committed to the scheduler.
    pub scheduled: bool,
    /// Central: Set CIG Parameters may still modify the CIG.
    pub configurable: bool,
}

impl CigCtx {
    pub fn new(cig_id: u8, cig_handle: u8, role: Role, max_cis: usize) -> CigCtx {
        CigCtx {
            cig_id,
            cig_handle,
            role,
            cis_list: CisList::with_capacity(max_cis),
            packing: Packing::Sequential,
            framed: false,
            iso_interval: 0,
            sdu_interval_c_to_p: 0,
            sdu_interval_p_to_c: 0,
            ft_c_to_p: 1,
            ft_p_to_c: 1,
            cig_sync_delay_usec: 0,
            anchor_usec: 0,
            last_sync_usec: 0,
            num_cis_ested: 0,
            head_cis_removed: false,
            removed_head_offset_usec: 0,
            scheduled: false,
            configurable: true,
        }
    }

    pub fn iso_interval_usec(&self) -> microseconds {
        self.iso_interval as microseconds * INTERVAL_UNIT_USEC
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsoDataPath {
    Hci,
}

/// Connected Isochronous Stream context.
#[derive(Debug)]
pub struct CisCtx {
    pub cis_connection_handle: u16,
    pub cig_id: u8,
    pub cis_id: u8,
    pub acl_connection_handle: Option<u16>,
    pub role: Role,
    /// Established and available for scheduling.
    pub established: bool,
    pub chan: CisChanParam,
    pub event_counter: u16,
    pub access_address: u32,
    pub crc_init: u32,
    pub phy_c_to_p: Phy,
    pub phy_p_to_c: Phy,
    /// Negotiated stream parameters, in LL_CIS_REQ form.
    pub params: llcp::CisReq,
    pub enc: EncBlock,
    pub tx_ft: FtList,
    /// Payloads expected from the peer, one entry per CIS event.
    pub rx_ft: FtList,
    /// Received payloads flushed before they arrived.
    pub rx_flushed: u32,
    pub iso_data_path_c_to_p: Option<IsoDataPath>,
    pub iso_data_path_p_to_c: Option<IsoDataPath>,
    pub sdu_queue: VecDeque<Bytes>,
    pub est_state: CisEstState,
    pub term_state: CisTermState,
    pub cis_offset_usec: microseconds,
    pub cig_sync_delay_usec: microseconds,
    pub cis_sync_delay_usec: microseconds,
    /// Receive synchronization delay including window widening.
    pub rx_sync_delay_usec: microseconds,
}

impl CisCtx {
    pub fn new(cis_connection_handle: u16, cig_id: u8, cis_id: u8, role: Role) -> CisCtx {
        CisCtx {
            cis_connection_handle,
            cig_id,
            cis_id,
            acl_connection_handle: None,
            role,
            established: false,
            chan: CisChanParam::default(),
            event_counter: 0,
            access_address: 0,
            crc_init: 0,
            phy_c_to_p: Phy::Le1m,
            phy_p_to_c: Phy::Le1m,
            params: llcp::CisReq { cig_id, cis_id, ..Default::default() },
            enc: EncBlock::default(),
            tx_ft: FtList::with_capacity(MAX_FT_ENTRIES),
            rx_ft: FtList::with_capacity(MAX_FT_ENTRIES),
            rx_flushed: 0,
            iso_data_path_c_to_p: None,
            iso_data_path_p_to_c: None,
            sdu_queue: VecDeque::new(),
            est_state: CisEstState::default(),
            term_state: CisTermState::default(),
            cis_offset_usec: 0,
            cig_sync_delay_usec: 0,
            cis_sync_delay_usec: 0,
            rx_sync_delay_usec: 0,
        }
    }

    pub fn sub_evt_link(&self) -> SubEvtLink {
        SubEvtLink {
            phy_c_to_p: self.phy_c_to_p,
            max_pdu_c_to_p: self.params.max_pdu_c_to_p,
            phy_p_to_c: self.phy_p_to_c,
            max_pdu_p_to_c: self.params.max_pdu_p_to_c,
        }
    }

    /// Burst number and flush timeout in the transmit and receive
    /// directions of the local role.
    pub fn tx_rx_bn_ft(&self) -> ((u8, u8), (u8, u8)) {
        let c_to_p = (self.params.bn_c_to_p, self.params.ft_c_to_p);
        let p_to_c = (self.params.bn_p_to_c, self.params.ft_p_to_c);
        match self.role {
            Role::Central => (c_to_p, p_to_c),
            Role::Peripheral => (p_to_c, c_to_p),
        }
    }

    pub fn max_sdu_tx(&self) -> u16 {
        match self.role {
            Role::Central => self.params.max_sdu_c_to_p,
            Role::Peripheral => self.params.max_sdu_p_to_c,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.est_state == CisEstState::Idle && !self.established
    }
}
