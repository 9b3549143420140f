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

pub mod context;

use crate::config::CoreConfig;
use crate::llcp::chan::ChannelMap;
use crate::llcp::ctx::ConnParams;
use crate::llcp::LinkLayer;
use crate::packets::hci::Role;
use crate::packets::llcp::{CisInd, CisReq, LlcpPdu};

use context::TestContext;

/// ACL connection handle used by the tests.
pub const ACL: u16 = 1;

pub fn conn_params(handle: u16, role: Role) -> ConnParams {
    ConnParams {
        handle,
        role: role as u8,
        peer_address_type: 0,
        peer_address: [1, 2, 3, 4, 5, 6],
        access_address: 0x5065_4cd6,
        crc_init: 0x12_3456,
        hop_inc: 7,
        chan_sel: 1,
        channel_map: ChannelMap::ALL.bits(),
        interval: 40,
        latency: 0,
        supervision_timeout: 100,
        peer_sca: 0,
        anchor_usec: 1_000_000,
    }
}

/// Link layer with the ACL connection `ACL` in `role` and an empty
/// record.
pub fn connected(role: Role) -> LinkLayer<TestContext> {
    connected_with(role, CoreConfig::default())
}

pub fn connected_with(role: Role, config: CoreConfig) -> LinkLayer<TestContext> {
    let mut ll = LinkLayer::new(TestContext::new(), config);
    ll.add_link(conn_params(ACL, role)).unwrap();
    ll.ctx().clear();
    ll
}

/// Deliver `pdu` from the peer on `ACL`.
pub fn ingest(ll: &mut LinkLayer<TestContext>, pdu: LlcpPdu) {
    ll.ingest_llcp(ACL, &pdu.to_vec()).unwrap()
}

/// A valid LL_CIS_REQ: 2M both ways, 40 octet SDUs every 10ms.
pub fn cis_req(cig_id: u8, cis_id: u8, conn_event_count: u16) -> CisReq {
    CisReq {
        cig_id,
        cis_id,
        phy_c_to_p: 0x2,
        phy_p_to_c: 0x2,
        framed: false,
        max_sdu_c_to_p: 40,
        max_sdu_p_to_c: 40,
        sdu_interval_c_to_p: 10_000,
        sdu_interval_p_to_c: 10_000,
        max_pdu_c_to_p: 40,
        max_pdu_p_to_c: 40,
        nse: 2,
        sub_interval: 4_000,
        bn_c_to_p: 1,
        bn_p_to_c: 1,
        ft_c_to_p: 1,
        ft_p_to_c: 1,
        iso_interval: 8,
        cis_offset_min: 1_000,
        cis_offset_max: 8_000,
        conn_event_count,
    }
}

/// Run the peripheral side of a CIS establishment on `ACL` to
/// completion. Returns the CIS connection handle.
pub fn establish_peripheral_cis(ll: &mut LinkLayer<TestContext>, cig_id: u8, cis_id: u8) -> u16 {
    let conn_event_count = ll.pools().find_conn(ACL).unwrap().event_counter + 6;
    ingest(ll, LlcpPdu::CisReq(cis_req(cig_id, cis_id, conn_event_count)));
    let cis_connection_handle = ll.get_cis_connection_handle(cig_id, cis_id).unwrap();
    ll.accept_cis_request(cis_connection_handle).unwrap();
    ingest(
        ll,
        LlcpPdu::CisInd(CisInd {
            access_address: 0x6b3a_29c1 ^ ((cis_id as u32) << 8),
            cis_offset: 2_000,
            cig_sync_delay: 3_000,
            cis_sync_delay: 3_000,
            conn_event_count,
        }),
    );
    assert!(ll.pools().find_cis_by_handle(cis_connection_handle).unwrap().established);
    cis_connection_handle
}
