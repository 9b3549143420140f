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

//! Link Layer connection core: ACL, CIG and CIS contexts, LLCP
//! procedures and radio operation scheduling.

use bytes::Bytes;

use crate::packets::{hci, llcp};

pub mod bod;
pub mod chan;
pub mod cis_est;
pub mod cis_term;
pub mod cmn;
pub mod conn_upd;
pub mod ctx;
pub mod iso;
pub mod list;
pub mod manager;
pub mod phy_upd;
pub mod pool;
pub mod procedure;
pub mod timing;

#[cfg(test)]
pub mod test;

pub use bod::{ConflictOutcome, ConflictResolver, Op, OpEvent, OpId, SubEvent};
pub use manager::{DispatchId, Event, LinkLayer, LinkLayerError, Message};

/// Radio protocol kinds reference counted by the baseband.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Acl = 0,
    Cis = 1,
}

/// Single shot timers owned by the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// LLCP procedure response timeout, one per ACL connection.
    LlcpRsp(u16),
    /// CIS establishment response timeout, one per CIS.
    CisLlcpRsp(u16),
    /// CIS supervision timeout, one per CIS.
    CisSupervision(u16),
}

/// Collaborators consumed by the core: scheduler, baseband, timers,
/// crypto primitive, buffer pool and host.
pub trait Context {
    fn sch_insert_at_due_time(&self, op: &Op, resolver: ConflictResolver) -> bool;
    fn sch_reload(&self, op: &Op);
    fn sch_remove(&self, id: OpId);

    fn bb_start(&self, protocol: Protocol);
    fn bb_stop(&self, protocol: Protocol);
    /// Continue the CIG operation `id` with `sub_event`, or end the CIG
    /// event when there is none.
    fn bb_next_sub_event(&self, id: OpId, sub_event: Option<SubEvent>);

    fn send_llcp_packet(&self, acl_connection_handle: u16, packet: llcp::LlcpPdu);
    fn send_host_event(&self, event: hci::HostEvent);

    fn start_timer(&self, timer: TimerId, timeout_ms: u32);
    fn stop_timer(&self, timer: TimerId);

    fn aes_ecb_encrypt(&self, key: &[u8; 16], block: &[u8; 16]) -> [u8; 16];

    /// Return a queued ISO SDU to the buffer pool.
    fn free_sdu(&self, cis_connection_handle: u16, sdu: Bytes);

    fn random_u32(&self) -> u32;
}
