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

//! Radio operation descriptors: build them from an ACL or CIG context
//! and commit them to the scheduler.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::llcp::ctx::{CigCtx, CisCtx, ConnCtx, EncBlock, Packing};
use crate::llcp::list::FtParam;
use crate::llcp::timing::{
    calc_sub_evt_duration_usec_inter, calc_sub_evt_duration_usec_seq, calc_window_widening_usec,
    cap_window_widening_usec, microseconds, sca_to_ppm, Phy,
};
use crate::llcp::{Context, LinkLayer, TimerId};
use crate::packets::hci::{ErrorCode, HostEvent, Role};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Acl = 0,
    Cig = 1,
}

/// Identifies the owner of an operation: ACL connection handle or
/// CIG handle.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpId {
    pub kind: OpKind,
    pub handle: u16,
}

impl OpId {
    pub fn acl(handle: u16) -> OpId {
        OpId { kind: OpKind::Acl, handle }
    }

    pub fn cig(cig_handle: u8) -> OpId {
        OpId { kind: OpKind::Cig, handle: cig_handle as u16 }
    }
}

/// Completion callbacks the baseband invokes for an operation.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackSet {
    AclCentral = 0,
    AclPeripheral = 1,
    CisCentral = 2,
    CisPeripheral = 3,
}

impl CallbackSet {
    fn acl(role: Role) -> CallbackSet {
        match role {
            Role::Central => CallbackSet::AclCentral,
            Role::Peripheral => CallbackSet::AclPeripheral,
        }
    }

    fn cis(role: Role) -> CallbackSet {
        match role {
            Role::Central => CallbackSet::CisCentral,
            Role::Peripheral => CallbackSet::CisPeripheral,
        }
    }
}

/// Radio operation descriptor.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    pub id: OpId,
    pub due_usec: u64,
    pub min_dur_usec: microseconds,
    pub max_dur_usec: microseconds,
    pub chan: u8,
    pub tx_phy: u8,
    pub rx_phy: u8,
    pub access_address: u32,
    pub crc_init: u32,
    pub enc_enabled: bool,
    pub session_key: [u8; 16],
    pub iv: [u8; 8],
    pub callbacks: CallbackSet,
}

impl Op {
    fn new(id: OpId, callbacks: CallbackSet) -> Op {
        Op {
            id,
            due_usec: 0,
            min_dur_usec: 0,
            max_dur_usec: 0,
            chan: 0,
            tx_phy: Phy::Le1m as u8,
            rx_phy: Phy::Le1m as u8,
            access_address: 0,
            crc_init: 0,
            enc_enabled: false,
            session_key: [0; 16],
            iv: [0; 8],
            callbacks,
        }
    }

    fn set_enc(&mut self, enc: &EncBlock) {
        self.enc_enabled = enc.enabled;
        self.session_key = enc.session_key;
        self.iv = enc.iv;
    }
}

/// Completions reported by the baseband for a committed operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpEvent {
    Begin,
    /// A sub-event of `cis_connection_handle` completed; the baseband
    /// waits for the next one.
    Continue { cis_connection_handle: Option<u16> },
    /// End of the operation with the baseband status, 0 on success.
    End(u8),
    Abort,
    Tx { cis_connection_handle: Option<u16> },
    Rx { cis_connection_handle: Option<u16>, last: bool },
}

/// Next sub-event of a CIG event.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubEvent {
    pub cis_connection_handle: u16,
    pub chan: u8,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictOutcome {
    KeepExisting = 0,
    KeepNew = 1,
}

/// Invoked by the scheduler when `new` overlaps `existing`.
pub type ConflictResolver = fn(new: &Op, existing: &Op) -> ConflictOutcome;

/// The existing operation always wins.
// TODO: prefer the connection closest to its supervision timeout.
pub fn resolve_conflict(new: &Op, existing: &Op) -> ConflictOutcome {
    trace!(new = ?new.id, existing = ?existing.id, "scheduling conflict, keeping existing");
    ConflictOutcome::KeepExisting
}

/// Combined clock accuracy of the local and peer sleep clocks.
fn combined_ppm(local_sca: u8, peer_sca: u8) -> u32 {
    sca_to_ppm(local_sca) as u32 + sca_to_ppm(peer_sca) as u32
}

pub fn build_acl_op(conn: &ConnCtx) -> Op {
    let mut op = Op::new(OpId::acl(conn.handle), CallbackSet::acl(conn.role));
    op.due_usec = conn.anchor_usec;
    op.chan = conn.data_chan;
    op.tx_phy = conn.tx_phy as u8;
    op.rx_phy = conn.rx_phy as u8;
    op.access_address = conn.access_address;
    op.crc_init = conn.crc_init;
    op.set_enc(&conn.enc);
    // Connection event spans at most the connection interval.
    op.max_dur_usec = conn.interval_usec();
    op.min_dur_usec = op.max_dur_usec.min(2_500);
    op
}

/// Window widening of a peripheral connection event at `anchor_usec`.
fn acl_widening(conn: &ConnCtx, local_sca: u8, anchor_usec: u64) -> microseconds {
    if conn.role == Role::Central {
        return 0;
    }
    let unsync = anchor_usec.saturating_sub(conn.last_sync_usec);
    cap_window_widening_usec(
        calc_window_widening_usec(unsync, combined_ppm(local_sca, conn.peer_sca)),
        conn.interval_usec(),
    )
}

/// Commit the ACL operation of `conn`. A scheduling conflict skips to
/// the next connection event until the insertion succeeds.
pub fn commit_acl_op<C: Context>(ctx: &C, conn: &mut ConnCtx, local_sca: u8) -> Op {
    loop {
        conn.data_chan = conn.chan.select(conn.event_counter);
        let widening = acl_widening(conn, local_sca, conn.anchor_usec);
        let mut op = build_acl_op(conn);
        op.due_usec = conn.anchor_usec.saturating_sub(widening as u64);
        op.min_dur_usec += 2 * widening;
        if ctx.sch_insert_at_due_time(&op, resolve_conflict) {
            debug!(handle = conn.handle, event_counter = conn.event_counter, "ACL operation committed");
            return op;
        }
        debug!(handle = conn.handle, event_counter = conn.event_counter, "ACL scheduling conflict, retrying");
        conn.event_counter = conn.event_counter.wrapping_add(1);
        conn.anchor_usec += conn.interval_usec() as u64;
    }
}

/// Refresh the ACL operation for the connection event that just became
/// current.
pub fn reload_acl_op<C: Context>(ctx: &C, conn: &mut ConnCtx, local_sca: u8) {
    conn.data_chan = conn.chan.select(conn.event_counter);
    let widening = acl_widening(conn, local_sca, conn.anchor_usec);
    let mut op = build_acl_op(conn);
    op.due_usec = conn.anchor_usec.saturating_sub(widening as u64);
    op.min_dur_usec += 2 * widening;
    ctx.sch_reload(&op);
}

/// Minimum duration of a CIG event: the largest burst of every CIS,
/// one CIS after the other with sequential packing and alternating
/// with interleaved packing.
fn cig_event_duration_usec(cig: &CigCtx, members: &[&CisCtx], sub_evt_delay_usec: microseconds) -> microseconds {
    let burst = |cis: &CisCtx| cis.params.bn_c_to_p.max(cis.params.bn_p_to_c).max(1) as microseconds;
    match cig.packing {
        Packing::Interleaved => {
            let links: Vec<_> = members.iter().map(|cis| cis.sub_evt_link()).collect();
            let max_burst = members.iter().map(|cis| burst(cis)).max().unwrap_or(1);
            calc_sub_evt_duration_usec_inter(&links, sub_evt_delay_usec) * max_burst
        }
        Packing::Sequential => members
            .iter()
            .map(|cis| calc_sub_evt_duration_usec_seq(&cis.sub_evt_link(), sub_evt_delay_usec) * burst(cis))
            .sum(),
    }
}

/// Build the CIG operation from its head CIS `cis`. `members` are the
/// scheduled CISes of the CIG in list order.
pub fn build_cig_op(cig: &CigCtx, cis: &CisCtx, members: &[&CisCtx], sub_evt_delay_usec: microseconds) -> Op {
    let mut op = Op::new(OpId::cig(cig.cig_handle), CallbackSet::cis(cis.role));
    op.due_usec = cig.anchor_usec;
    op.chan = cis.chan.chan_idx;
    let (tx_phy, rx_phy) = match cis.role {
        Role::Central => (cis.phy_c_to_p, cis.phy_p_to_c),
        Role::Peripheral => (cis.phy_p_to_c, cis.phy_c_to_p),
    };
    op.tx_phy = tx_phy as u8;
    op.rx_phy = rx_phy as u8;
    op.access_address = cis.access_address;
    op.crc_init = cis.crc_init;
    op.set_enc(&cis.enc);

    op.min_dur_usec = cig_event_duration_usec(cig, members, sub_evt_delay_usec);
    op.max_dur_usec = cig.cig_sync_delay_usec.max(op.min_dur_usec);
    op
}

/// Widening applied to a CIS event of the peripheral.
fn cis_widening(cis: &CisCtx, cig: &CigCtx, peer_sca: u8, local_sca: u8, unsync_usec: u64) -> microseconds {
    if cis.role == Role::Central {
        return 0;
    }
    cap_window_widening_usec(
        calc_window_widening_usec(unsync_usec, combined_ppm(local_sca, peer_sca)),
        cig.iso_interval_usec(),
    )
}

/// Timing inputs of a CIG commit.
pub struct CigCommit<'a> {
    pub conn: &'a ConnCtx,
    pub local_sca: u8,
    pub sub_evt_delay_usec: microseconds,
}

/// Commit the CIG operation anchored on `cis`, the first CIS of the
/// CIG to be established.
///
/// The CIS anchor is one ACL interval after the current ACL anchor
/// plus the CIS offset. The due time is moved earlier by the window
/// widening, which also inflates the minimum duration and the receive
/// synchronization delay on both sides. A scheduling conflict never
/// fails the commit: the CIS moves to its next event, with channel and
/// widening recomputed, until the scheduler accepts it.
pub fn commit_cig_op<C: Context>(
    ctx: &C,
    commit: &CigCommit,
    cig: &mut CigCtx,
    cis: &mut CisCtx,
) -> Op {
    let conn = commit.conn;
    let mut anchor = conn.anchor_usec + conn.interval_usec() as u64 + cis.cis_offset_usec as u64;
    let mut unsync = anchor.saturating_sub(conn.last_sync_usec);
    let base_rx_sync_delay = cis.cis_sync_delay_usec;

    loop {
        cis.chan.select_event(cis.event_counter);
        let widening = cis_widening(cis, cig, conn.peer_sca, commit.local_sca, unsync);
        cig.anchor_usec = anchor;

        let mut op = build_cig_op(cig, cis, &[&*cis], commit.sub_evt_delay_usec);
        op.due_usec = anchor.saturating_sub(widening as u64);
        op.min_dur_usec += 2 * widening;
        cis.rx_sync_delay_usec = base_rx_sync_delay + 2 * widening;

        if ctx.sch_insert_at_due_time(&op, resolve_conflict) {
            cig.scheduled = true;
            cig.last_sync_usec = anchor.saturating_sub(unsync);
            debug!(
                cig_id = cig.cig_id,
                cis_connection_handle = cis.cis_connection_handle,
                event_counter = cis.event_counter,
                "CIG operation committed"
            );
            return op;
        }

        debug!(
            cig_id = cig.cig_id,
            event_counter = cis.event_counter,
            "CIG scheduling conflict, retrying next event"
        );
        cis.event_counter = cis.event_counter.wrapping_add(1);
        anchor += cig.iso_interval_usec() as u64;
        unsync += cig.iso_interval_usec() as u64;
    }
}

/// Refresh the CIG operation for the CIG event that just became
/// current. `members` are the scheduled CISes, head first.
pub fn reload_cig_op<C: Context>(
    ctx: &C,
    cig: &CigCtx,
    members: &[&CisCtx],
    peer_sca: u8,
    local_sca: u8,
    sub_evt_delay_usec: microseconds,
) {
    let Some(head) = members.first() else {
        return;
    };
    let unsync = cig.anchor_usec.saturating_sub(cig.last_sync_usec);
    let widening = cis_widening(head, cig, peer_sca, local_sca, unsync);
    let mut op = build_cig_op(cig, head, members, sub_evt_delay_usec);
    op.due_usec = cig.anchor_usec.saturating_sub(widening as u64);
    op.min_dur_usec += 2 * widening;
    ctx.sch_reload(&op);
}

impl<C: Context> LinkLayer<C> {
    /// Completion of the ACL operation of `handle`.
    pub(super) fn acl_op_event(&mut self, handle: u16, event: OpEvent) {
        let local_sca = self.config.local_sca;
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        match event {
            OpEvent::Begin | OpEvent::Continue { .. } | OpEvent::Tx { .. } => (),
            OpEvent::Rx { .. } => conn.last_sync_usec = conn.anchor_usec,
            OpEvent::End(0) | OpEvent::Abort => {
                if let Some(reason) = conn.terminate {
                    return self.teardown_conn(handle, reason);
                }
                conn.event_counter = conn.event_counter.wrapping_add(1);
                conn.anchor_usec += conn.interval_usec() as u64;
                trace!(handle, event_counter = conn.event_counter, "ACL event end");
                self.cis_term_ack(handle);
                self.conn_upd_event(handle);
                self.phy_upd_event(handle);
                if let Some(conn) = self.pools.find_conn_mut(handle) {
                    reload_acl_op(&self.ctx, conn, local_sca)
                }
            }
            OpEvent::End(status) => {
                warn!(handle, status, "ACL operation failed");
                self.ctx.send_host_event(HostEvent::HardwareError { code: status });
                self.teardown_conn(handle, ErrorCode::HardwareFailure)
            }
        }
    }

    /// Completion of the CIG operation of `cig_handle`.
    pub(super) fn cig_op_event(&mut self, cig_handle: u8, event: OpEvent) {
        match event {
            OpEvent::Begin => self.cig_event_begin(cig_handle),
            OpEvent::Continue { cis_connection_handle } => {
                self.cig_continue(cig_handle, cis_connection_handle)
            }
            OpEvent::Tx { .. } => (),
            OpEvent::Rx { cis_connection_handle: Some(cis_connection_handle), last } => {
                self.cig_rx(cig_handle, cis_connection_handle, last)
            }
            OpEvent::Rx { cis_connection_handle: None, .. } => (),
            OpEvent::End(0) | OpEvent::Abort => self.cig_event_end(cig_handle),
            OpEvent::End(status) => {
                warn!(cig_handle, status, "CIG operation failed");
                self.ctx.send_host_event(HostEvent::HardwareError { code: status });
                let handles = self.pools.cig(cig_handle).map(|cig| cig.cis_list.handles());
                for cis_connection_handle in handles.unwrap_or_default() {
                    self.close_cis(cis_connection_handle, ErrorCode::HardwareFailure)
                }
            }
        }
    }

    /// Start of a CIG event. The operation opens on the first sub-event
    /// of the head CIS; CISes not established take no sub-event. Every
    /// established CIS expects a new burst from the peer.
    fn cig_event_begin(&mut self, cig_handle: u8) {
        let Some(cig) = self.pools.cig_mut(cig_handle) else {
            return;
        };
        cig.cis_list.clear_done();
        let handles = cig.cis_list.handles();

        let mut head = true;
        for cis_connection_handle in handles {
            let Some(cis) = self.pools.find_cis_by_handle_mut(cis_connection_handle) else {
                continue;
            };
            if !cis.established {
                if let Some(cig) = self.pools.cig_mut(cig_handle) {
                    cig.cis_list.set_done(cis_connection_handle)
                }
                continue;
            }
            if head {
                cis.chan.sub_event_chan();
                head = false;
            }
            let (_, (bn_rx, ft_rx)) = cis.tx_rx_bn_ft();
            if bn_rx > 0
                && cis.rx_ft.insert_tail(FtParam::new(bn_rx, ft_rx, cis.params.nse)).is_err()
            {
                trace!(cis_connection_handle, "receive flush timeout list full");
            }
        }
    }

    /// The baseband finished a sub-event of `current` and asks for the
    /// next one. A CIS that used all its sub-events is done; the CIG
    /// event ends once every CIS is done.
    fn cig_continue(&mut self, cig_handle: u8, current: Option<u16>) {
        let exhausted = current
            .and_then(|handle| self.pools.find_cis_by_handle(handle))
            .filter(|cis| cis.chan.sub_evt_num() >= cis.params.nse.max(1))
            .map(|cis| cis.cis_connection_handle);
        let Some(cig) = self.pools.cig_mut(cig_handle) else {
            return;
        };
        if let Some(cis_connection_handle) = exhausted {
            cig.cis_list.set_done(cis_connection_handle);
        }
        let next = match (cig.packing, current) {
            _ if cig.cis_list.are_all_done() => None,
            (Packing::Interleaved, Some(current)) => cig.cis_list.next_pending_after(current),
            _ => cig.cis_list.first_pending(),
        };
        let sub_event = next
            .and_then(|handle| self.pools.find_cis_by_handle_mut(handle))
            .map(|cis| SubEvent {
                cis_connection_handle: cis.cis_connection_handle,
                chan: cis.chan.sub_event_chan(),
            });
        if sub_event.is_none() {
            trace!(cig_handle, "all CISes done");
        }
        self.ctx.bb_next_sub_event(OpId::cig(cig_handle), sub_event)
    }

    /// A packet was received from the peer: the CIG is synchronized and
    /// the CIS supervision timer restarts.
    fn cig_rx(&mut self, cig_handle: u8, cis_connection_handle: u16, last: bool) {
        let Some(cig) = self.pools.cig_mut(cig_handle) else {
            return;
        };
        cig.last_sync_usec = cig.anchor_usec;
        if last {
            match cig.packing {
                Packing::Interleaved => cig.cis_list.set_done_from(cis_connection_handle),
                Packing::Sequential => cig.cis_list.set_done(cis_connection_handle),
            }
        }
        if let Some(cis) = self.pools.find_cis_by_handle_mut(cis_connection_handle) {
            cis.rx_ft.ack_oldest();
        }
        let supervision_timeout_ms = self
            .pools
            .find_cis_by_handle(cis_connection_handle)
            .and_then(|cis| cis.acl_connection_handle)
            .and_then(|acl_connection_handle| self.pools.find_conn(acl_connection_handle))
            .map(ConnCtx::supervision_timeout_ms);
        if let Some(timeout_ms) = supervision_timeout_ms {
            self.ctx.start_timer(TimerId::CisSupervision(cis_connection_handle), timeout_ms)
        }
    }

    /// End of a CIG event: advance every established CIS, flush the
    /// expired payloads and reload the operation for the next event.
    fn cig_event_end(&mut self, cig_handle: u8) {
        let local_sca = self.config.local_sca;
        let sub_evt_delay_usec = self.config.sub_evt_delay_usec;
        let Some(cig) = self.pools.cig(cig_handle) else {
            return;
        };
        let handles = cig.cis_list.handles();

        for cis_connection_handle in &handles {
            let Some(cis) = self.pools.find_cis_by_handle_mut(*cis_connection_handle) else {
                continue;
            };
            if !cis.established {
                continue;
            }
            cis.event_counter = cis.event_counter.wrapping_add(1);
            cis.chan.select_event(cis.event_counter);
            let lost: u32 = cis.rx_ft.age_all().iter().map(|param| param.pending as u32).sum();
            if lost > 0 {
                cis.rx_flushed = cis.rx_flushed.saturating_add(lost);
                debug!(
                    cis_connection_handle = *cis_connection_handle,
                    lost,
                    event_counter = cis.event_counter,
                    "receive payloads flushed"
                );
            }
            let flushed = cis.tx_ft.age_all().len();
            let sdus: Vec<Bytes> = (0..flushed).filter_map(|_| cis.sdu_queue.pop_front()).collect();
            if sdus.is_empty() {
                continue;
            }
            let count = sdus.len() as u16;
            for sdu in sdus {
                self.ctx.free_sdu(*cis_connection_handle, sdu);
            }
            self.pools.iso_credits = self.pools.iso_credits.saturating_add(count);
            self.ctx.send_host_event(HostEvent::NumberOfCompletedPackets {
                handle: *cis_connection_handle,
                count,
            });
        }

        let head = handles.first().and_then(|handle| self.pools.find_cis_by_handle(*handle));
        let head_offset_usec = head.map(|cis| cis.cis_offset_usec);
        let peer_sca = head
            .and_then(|cis| cis.acl_connection_handle)
            .and_then(|acl_connection_handle| self.pools.find_conn(acl_connection_handle))
            .map_or(0, |conn| conn.peer_sca);
        let Some(cig) = self.pools.cig_mut(cig_handle) else {
            return;
        };
        cig.anchor_usec += cig.iso_interval_usec() as u64;
        if cig.head_cis_removed {
            // The CIG anchor follows the new head CIS.
            if let Some(offset_usec) = head_offset_usec {
                cig.anchor_usec = (cig.anchor_usec + offset_usec as u64)
                    .saturating_sub(cig.removed_head_offset_usec as u64);
            }
            cig.head_cis_removed = false;
        }
        if !cig.scheduled {
            return;
        }

        let Some(cig) = self.pools.cig(cig_handle) else {
            return;
        };
        let members: Vec<&CisCtx> = handles
            .iter()
            .filter_map(|handle| self.pools.find_cis_by_handle(*handle))
            .filter(|cis| cis.established)
            .collect();
        reload_cig_op(&self.ctx, cig, &members, peer_sca, local_sca, sub_evt_delay_usec)
    }
}
