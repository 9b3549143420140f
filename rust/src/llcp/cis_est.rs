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

//! CIS establishment procedure.
//!
//! The central sends LL_CIS_REQ, the peripheral host accepts or rejects
//! it, the peripheral answers with LL_CIS_RSP and the central fixes the
//! access address and offset with LL_CIS_IND. The CIS is established
//! when LL_CIS_IND is sent or received. The state is kept per CIS.

use tracing::{debug, info, trace, warn};

use crate::config::LeFeature;
use crate::llcp::bod::{self, CigCommit};
use crate::llcp::chan::CisChanParam;
use crate::llcp::conn_upd::INSTANT_OFFSET;
use crate::llcp::ctx::{CigCtx, CisCtx};
use crate::llcp::iso::transport_latency;
use crate::llcp::manager::{DispatchId, Event};
use crate::llcp::procedure::{LlcpProc, PeerStartOutcome};
use crate::llcp::timing::{compute_access_address, microseconds, Phy};
use crate::llcp::{Context, LinkLayer, TimerId};
use crate::packets::hci::{ChanSel, CisEstablishedParams, ErrorCode, HostEvent, Role};
use crate::packets::llcp::{self, CisReq, CisRsp, LlcpPdu, Opcode};

/// Smallest CIS offset proposed by the central.
pub const MIN_CIS_OFFSET_USEC: microseconds = 500;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CisEstState {
    #[default]
    Idle,
    /// Peripheral, waiting for the host to accept or reject.
    HostReply,
    /// Peripheral, waiting for LL_CIS_IND.
    WaitCisInd,
    /// Central, waiting for LL_CIS_RSP.
    WaitCisRsp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CisEstEvent {
    HostCreate,
    HostAccept,
    HostReject(ErrorCode),
    PeerCisReq,
    PeerCisRsp(CisRsp),
    PeerCisInd(llcp::CisInd),
    PeerReject(ErrorCode),
    PeerInvalid,
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CisEstAction {
    NotifyHost,
    RejectCollision,
    SendRsp,
    SendReject(ErrorCode),
    Establish(llcp::CisInd),
    SendReq,
    SendInd(CisRsp),
    Fail(ErrorCode),
}

fn transition(
    role: Role,
    state: CisEstState,
    event: CisEstEvent,
) -> Option<(CisEstAction, CisEstState)> {
    use CisEstAction as A;
    use CisEstEvent as E;
    use CisEstState as S;
    match (role, state, event) {
        (Role::Peripheral, S::Idle, E::PeerCisReq) => Some((A::NotifyHost, S::HostReply)),
        (Role::Peripheral, S::HostReply | S::WaitCisInd, E::PeerCisReq) => {
            Some((A::RejectCollision, state))
        }
        (Role::Peripheral, S::HostReply, E::HostAccept) => Some((A::SendRsp, S::WaitCisInd)),
        (Role::Peripheral, S::HostReply, E::HostReject(reason)) => {
            Some((A::SendReject(reason), S::Idle))
        }
        (Role::Peripheral, S::WaitCisInd, E::PeerCisInd(ind)) => Some((A::Establish(ind), S::Idle)),
        (Role::Central, S::Idle, E::HostCreate) => Some((A::SendReq, S::WaitCisRsp)),
        (Role::Central, S::WaitCisRsp, E::PeerCisRsp(rsp)) => Some((A::SendInd(rsp), S::Idle)),
        (Role::Peripheral, S::WaitCisInd, E::PeerReject(code))
        | (Role::Central, S::WaitCisRsp, E::PeerReject(code)) => Some((A::Fail(code), S::Idle)),
        (Role::Peripheral, S::WaitCisInd, E::PeerInvalid)
        | (Role::Central, S::WaitCisRsp, E::PeerInvalid) => {
            Some((A::Fail(ErrorCode::InvalidLlParameters), S::Idle))
        }
        (Role::Peripheral, S::HostReply | S::WaitCisInd, E::Timeout)
        | (Role::Central, S::WaitCisRsp, E::Timeout) => {
            Some((A::Fail(ErrorCode::LlResponseTimeout), S::Idle))
        }
        _ => None,
    }
}

impl CisCtx {
    /// The host was notified of the request and has not answered yet.
    pub fn is_waiting_host(&self) -> bool {
        self.est_state == CisEstState::HostReply
    }
}

/// Parameters reported to the host once the CIS is established.
pub(super) fn cis_established_params(cig: &CigCtx, cis: &CisCtx) -> CisEstablishedParams {
    let params = &cis.params;
    CisEstablishedParams {
        cig_sync_delay: cig.cig_sync_delay_usec,
        cis_sync_delay: cis.cis_sync_delay_usec,
        transport_latency_c_to_p: transport_latency(
            cig.cig_sync_delay_usec,
            params.iso_interval,
            params.ft_c_to_p,
            params.sdu_interval_c_to_p,
            params.framed,
        ),
        transport_latency_p_to_c: transport_latency(
            cig.cig_sync_delay_usec,
            params.iso_interval,
            params.ft_p_to_c,
            params.sdu_interval_p_to_c,
            params.framed,
        ),
        phy_c_to_p: cis.phy_c_to_p as u8,
        phy_p_to_c: cis.phy_p_to_c as u8,
        nse: params.nse,
        bn_c_to_p: params.bn_c_to_p,
        bn_p_to_c: params.bn_p_to_c,
        ft_c_to_p: params.ft_c_to_p,
        ft_p_to_c: params.ft_p_to_c,
        max_pdu_c_to_p: params.max_pdu_c_to_p,
        max_pdu_p_to_c: params.max_pdu_p_to_c,
        iso_interval: params.iso_interval,
    }
}

impl<C: Context> LinkLayer<C> {
    /// The CIS of `acl_connection_handle` with an establishment in
    /// progress.
    fn cis_est_pending(&self, acl_connection_handle: u16) -> Option<u16> {
        self.pools
            .cis_handles(|cis| {
                cis.acl_connection_handle == Some(acl_connection_handle)
                    && cis.est_state != CisEstState::Idle
            })
            .first()
            .copied()
    }

    fn cis_est_execute(&mut self, cis_connection_handle: u16, event: CisEstEvent) {
        let Some(cis) = self.pools.find_cis_by_handle_mut(cis_connection_handle) else {
            return;
        };
        let Some(acl_connection_handle) = cis.acl_connection_handle else {
            trace!(cis_connection_handle, ?event, "CIS not bound to a connection");
            return;
        };
        let state = cis.est_state;
        let Some((action, next)) = transition(cis.role, state, event.clone()) else {
            trace!(cis_connection_handle, ?state, ?event, "unhandled CIS establishment event");
            return;
        };
        cis.est_state = next;
        debug!(cis_connection_handle, ?state, ?next, "CIS establishment");

        match action {
            CisEstAction::NotifyHost => {
                let (cig_id, cis_id) = (cis.cig_id, cis.cis_id);
                self.ctx.start_timer(
                    TimerId::CisLlcpRsp(cis_connection_handle),
                    self.config.llcp_rsp_timeout_ms,
                );
                self.ctx.send_host_event(HostEvent::CisRequest {
                    acl_handle: acl_connection_handle,
                    cis_handle: cis_connection_handle,
                    cig_id,
                    cis_id,
                })
            }
            CisEstAction::RejectCollision => self.reject_ext(
                acl_connection_handle,
                Opcode::CisReq,
                ErrorCode::LlProcedureCollision,
            ),
            CisEstAction::SendRsp => {
                let rsp = CisRsp {
                    cis_offset_min: cis.params.cis_offset_min,
                    cis_offset_max: cis.params.cis_offset_max,
                    conn_event_count: cis.params.conn_event_count,
                };
                self.ctx.send_llcp_packet(acl_connection_handle, LlcpPdu::CisRsp(rsp))
            }
            CisEstAction::SendReject(reason) => {
                let reason = match reason {
                    ErrorCode::Success => ErrorCode::RemoteUserTerminatedConnection,
                    reason => reason,
                };
                self.reject_ext(acl_connection_handle, Opcode::CisReq, reason);
                self.cis_est_cleanup(cis_connection_handle)
            }
            CisEstAction::Establish(ind) => self.cis_establish(cis_connection_handle, &ind),
            CisEstAction::SendReq => self.cis_est_send_req(acl_connection_handle, cis_connection_handle),
            CisEstAction::SendInd(rsp) => {
                self.cis_est_send_ind(acl_connection_handle, cis_connection_handle, rsp)
            }
            CisEstAction::Fail(status) => {
                warn!(cis_connection_handle, ?status, "CIS establishment failed");
                self.ctx.send_host_event(HostEvent::CisEstablished {
                    status,
                    cis_handle: cis_connection_handle,
                    params: None,
                });
                self.cis_est_cleanup(cis_connection_handle)
            }
        }
    }

    /// Peripheral: LL_CIS_REQ from the central, or a request replayed
    /// after a CIS termination completed.
    pub(super) fn cis_est_rx_req(&mut self, handle: u16, req: CisReq) {
        let supported = self.config.supports(LeFeature::ConnectedIsochronousStreamPeripheral);
        let supported_phys = self.config.supported_phys();
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        if conn.role != Role::Peripheral || !supported {
            return self.reject_ext(handle, Opcode::CisReq, ErrorCode::UnsupportedRemoteFeature);
        }
        if (req.phy_c_to_p | req.phy_p_to_c) & !supported_phys != 0 {
            return self.reject_ext(
                handle,
                Opcode::CisReq,
                ErrorCode::UnsupportedFeatureOrParameterValue,
            );
        }
        if conn.llcp.is_active(LlcpProc::CisTerm) {
            debug!(handle, cig_id = req.cig_id, cis_id = req.cis_id, "deferring LL_CIS_REQ");
            conn.pended_cis_req = Some(req);
            return;
        }
        let est_active = conn.llcp.is_active(LlcpProc::CisEst);
        if est_active {
            if let Some(pending) = self.cis_est_pending(handle) {
                return self.cis_est_execute(pending, CisEstEvent::PeerCisReq);
            }
        }

        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        match conn.llcp.start_peer(LlcpProc::CisEst) {
            PeerStartOutcome::Started => (),
            PeerStartOutcome::Overrode(proc) => debug!(handle, ?proc, "CIS request overrides"),
            PeerStartOutcome::Collision(error_code) => {
                return self.reject_ext(handle, Opcode::CisReq, error_code)
            }
        }

        match self.cis_est_alloc(handle, &req) {
            Ok(cis_connection_handle) => {
                self.cis_est_execute(cis_connection_handle, CisEstEvent::PeerCisReq)
            }
            Err(error_code) => {
                self.reject_ext(handle, Opcode::CisReq, error_code);
                self.llcp_complete(handle, LlcpProc::CisEst)
            }
        }
    }

    /// Allocate the CIG (or join the existing one) and the CIS named by
    /// the request.
    fn cis_est_alloc(&mut self, handle: u16, req: &CisReq) -> Result<u16, ErrorCode> {
        if self.pools.find_cis_by_id(req.cig_id, req.cis_id).is_some() {
            warn!(cig_id = req.cig_id, cis_id = req.cis_id, "CIS already exists");
            return Err(ErrorCode::InvalidLlParameters);
        }
        let cig_handle = match self.pools.find_cig_by_id(req.cig_id) {
            Some(cig_handle)
                if self.pools.cig(cig_handle).is_some_and(|cig| cig.role == Role::Peripheral) =>
            {
                cig_handle
            }
            Some(_) => {
                warn!(cig_id = req.cig_id, "CIG identifier used by a local central CIG");
                return Err(ErrorCode::ConnectionRejectedLimitedResources);
            }
            None => self
                .pools
                .alloc_cig(&self.ctx, req.cig_id, Role::Peripheral)
                .ok_or(ErrorCode::ConnectionRejectedLimitedResources)?,
        };
        let Some(cis_connection_handle) =
            self.pools.alloc_cis(cig_handle, req.cis_id, Role::Peripheral)
        else {
            warn!(cig_id = req.cig_id, cis_id = req.cis_id, "no free CIS context");
            if self.pools.cig(cig_handle).is_some_and(|cig| cig.cis_list.is_empty()) {
                self.pools.free_cig_ctx(&self.ctx, cig_handle);
            }
            return Err(ErrorCode::ConnectionRejectedLimitedResources);
        };

        let cig = self
            .pools
            .cig_mut(cig_handle)
            .ok_or(ErrorCode::ConnectionRejectedLimitedResources)?;
        cig.framed = req.framed;
        cig.iso_interval = req.iso_interval;
        cig.sdu_interval_c_to_p = req.sdu_interval_c_to_p;
        cig.sdu_interval_p_to_c = req.sdu_interval_p_to_c;
        cig.ft_c_to_p = req.ft_c_to_p;
        cig.ft_p_to_c = req.ft_p_to_c;
        cig.cis_list.insert_cis(cis_connection_handle);

        let cis = self
            .pools
            .find_cis_by_handle_mut(cis_connection_handle)
            .ok_or(ErrorCode::ConnectionRejectedLimitedResources)?;
        cis.acl_connection_handle = Some(handle);
        cis.phy_c_to_p = Phy::from_mask(req.phy_c_to_p).unwrap_or_default();
        cis.phy_p_to_c = Phy::from_mask(req.phy_p_to_c).unwrap_or_default();
        cis.params = req.clone();
        Ok(cis_connection_handle)
    }

    pub(super) fn cis_est_host_accept(&mut self, cis_connection_handle: u16) {
        self.cis_est_execute(cis_connection_handle, CisEstEvent::HostAccept)
    }

    pub(super) fn cis_est_host_reject(&mut self, cis_connection_handle: u16, reason: ErrorCode) {
        self.cis_est_execute(cis_connection_handle, CisEstEvent::HostReject(reason))
    }

    pub(super) fn cis_est_timeout(&mut self, cis_connection_handle: u16) {
        self.cis_est_execute(cis_connection_handle, CisEstEvent::Timeout)
    }

    pub(super) fn cis_est_rx_rsp(&mut self, handle: u16, rsp: CisRsp) {
        match self.cis_est_pending(handle) {
            Some(cis) => self.cis_est_execute(cis, CisEstEvent::PeerCisRsp(rsp)),
            None => trace!(handle, "unexpected LL_CIS_RSP"),
        }
    }

    pub(super) fn cis_est_rx_ind(&mut self, handle: u16, ind: llcp::CisInd) {
        match self.cis_est_pending(handle) {
            Some(cis) => self.cis_est_execute(cis, CisEstEvent::PeerCisInd(ind)),
            None => trace!(handle, "unexpected LL_CIS_IND"),
        }
    }

    pub(super) fn cis_est_rx_reject(&mut self, handle: u16, error_code: ErrorCode) {
        if let Some(cis) = self.cis_est_pending(handle) {
            self.cis_est_execute(cis, CisEstEvent::PeerReject(error_code))
        }
    }

    pub(super) fn cis_est_rx_invalid(&mut self, handle: u16) {
        if let Some(cis) = self.cis_est_pending(handle) {
            self.cis_est_execute(cis, CisEstEvent::PeerInvalid)
        }
    }

    /// Central: the procedure became active, request the next CIS
    /// queued by Create CIS.
    pub(super) fn cis_est_initiate(&mut self, handle: u16) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        match conn.cis_create_queue.pop_front() {
            Some(cis_connection_handle) => {
                self.cis_est_execute(cis_connection_handle, CisEstEvent::HostCreate)
            }
            None => self.llcp_complete(handle, LlcpProc::CisEst),
        }
    }

    fn cis_est_send_req(&mut self, handle: u16, cis_connection_handle: u16) {
        let Some(conn) = self.pools.find_conn(handle) else {
            return;
        };
        let conn_event_count = conn.event_counter.wrapping_add(INSTANT_OFFSET);
        let cis_offset_max = conn.interval_usec().saturating_sub(1).max(MIN_CIS_OFFSET_USEC);
        let Some(cis) = self.pools.find_cis_by_handle_mut(cis_connection_handle) else {
            return;
        };
        cis.params.cis_offset_min = MIN_CIS_OFFSET_USEC;
        cis.params.cis_offset_max = cis_offset_max;
        cis.params.conn_event_count = conn_event_count;
        let req = cis.params.clone();
        self.ctx.send_llcp_packet(handle, LlcpPdu::CisReq(req));
        self.ctx.start_timer(
            TimerId::CisLlcpRsp(cis_connection_handle),
            self.config.llcp_rsp_timeout_ms,
        )
    }

    fn cis_est_send_ind(&mut self, handle: u16, cis_connection_handle: u16, rsp: CisRsp) {
        let access_address = compute_access_address(|| self.ctx.random_u32());
        let Some(cis) = self.pools.find_cis_by_handle(cis_connection_handle) else {
            return;
        };
        let cig_sync_delay = self
            .pools
            .find_cig_by_id(cis.cig_id)
            .and_then(|cig_handle| self.pools.cig(cig_handle))
            .map_or(0, |cig| cig.cig_sync_delay_usec);
        let ind = llcp::CisInd {
            access_address,
            cis_offset: rsp.cis_offset_min.max(cis.params.cis_offset_min),
            cig_sync_delay,
            cis_sync_delay: cis.cis_sync_delay_usec,
            conn_event_count: cis.params.conn_event_count,
        };
        self.ctx.send_llcp_packet(handle, LlcpPdu::CisInd(ind.clone()));
        self.cis_establish(cis_connection_handle, &ind)
    }

    /// Event counter of an established CIS of the CIG other than
    /// `cis_connection_handle`.
    fn cig_running_counter(&self, cig_handle: u8, cis_connection_handle: u16) -> Option<u16> {
        let cig = self.pools.cig(cig_handle)?;
        cig.cis_list
            .handles()
            .into_iter()
            .filter(|handle| *handle != cis_connection_handle)
            .filter_map(|handle| self.pools.find_cis_by_handle(handle))
            .find(|cis| cis.established)
            .map(|cis| cis.event_counter)
    }

    /// Establish the CIS with the parameters of LL_CIS_IND. The first
    /// established CIS of the CIG commits the CIG operation, later ones
    /// join it at the current CIG event.
    fn cis_establish(&mut self, cis_connection_handle: u16, ind: &llcp::CisInd) {
        let local_sca = self.config.local_sca;
        let sub_evt_delay_usec = self.config.sub_evt_delay_usec;
        let Some(cis) = self.pools.find_cis_by_handle(cis_connection_handle) else {
            return;
        };
        let Some(acl_connection_handle) = cis.acl_connection_handle else {
            return;
        };
        let Some(cig_handle) = self.pools.find_cig_by_id(cis.cig_id) else {
            return;
        };
        let running_counter = self.cig_running_counter(cig_handle, cis_connection_handle);
        let Some((conn, cig, cis)) =
            self.pools.acl_cig_cis_mut(acl_connection_handle, cig_handle, cis_connection_handle)
        else {
            return;
        };

        cis.access_address = ind.access_address;
        cis.crc_init = conn.crc_init;
        cis.cis_offset_usec = ind.cis_offset;
        cis.cig_sync_delay_usec = ind.cig_sync_delay;
        cis.cis_sync_delay_usec = ind.cis_sync_delay;
        cis.rx_sync_delay_usec = ind.cis_sync_delay;
        cis.chan = CisChanParam::setup(ind.access_address, conn.chan.map);
        cis.enc = conn.enc.derive_cis(ind.access_address);
        cis.established = true;
        cig.cig_sync_delay_usec = ind.cig_sync_delay;
        cig.num_cis_ested += 1;
        cig.configurable = false;
        if !cig.cis_list.contains(cis_connection_handle) {
            cig.cis_list.insert_cis(cis_connection_handle);
        }

        match running_counter {
            Some(counter) if cig.scheduled => {
                cis.event_counter = counter;
                cis.chan.select_event(counter);
            }
            _ => {
                cis.event_counter = 0;
                let commit = CigCommit { conn, local_sca, sub_evt_delay_usec };
                bod::commit_cig_op(&self.ctx, &commit, cig, cis);
            }
        }

        let params = cis_established_params(cig, cis);
        let supervision_timeout_ms = conn.supervision_timeout_ms();
        info!(cis_connection_handle, acl_connection_handle, "CIS established");
        self.ctx.stop_timer(TimerId::CisLlcpRsp(cis_connection_handle));
        self.ctx.send_host_event(HostEvent::CisEstablished {
            status: ErrorCode::Success,
            cis_handle: cis_connection_handle,
            params: Some(params),
        });
        self.ctx.send_host_event(HostEvent::ChannelSelectionAlgorithm {
            handle: cis_connection_handle,
            algorithm: ChanSel::Csa2,
        });
        self.ctx.start_timer(TimerId::CisSupervision(cis_connection_handle), supervision_timeout_ms);
        self.cis_est_complete(acl_connection_handle)
    }

    /// Undo a failed establishment. A peripheral CIS is freed, together
    /// with its CIG when it was the last member; a central CIS returns
    /// to its configured state.
    fn cis_est_cleanup(&mut self, cis_connection_handle: u16) {
        let Some(cis) = self.pools.find_cis_by_handle_mut(cis_connection_handle) else {
            return;
        };
        let acl_connection_handle = cis.acl_connection_handle;
        let (role, cig_id) = (cis.role, cis.cig_id);
        cis.est_state = CisEstState::Idle;
        if role == Role::Central {
            cis.acl_connection_handle = None;
        }
        self.ctx.stop_timer(TimerId::CisLlcpRsp(cis_connection_handle));

        if role == Role::Peripheral {
            let cig_handle = self.pools.find_cig_by_id(cig_id);
            if let Some(cig) = cig_handle.and_then(|cig_handle| self.pools.cig_mut(cig_handle)) {
                cig.cis_list.remove_cis(cis_connection_handle);
            }
            self.pools.free_cis_ctx(&self.ctx, cis_connection_handle);
            if let Some(cig_handle) = cig_handle {
                if self.pools.cig(cig_handle).is_some_and(|cig| cig.cis_list.is_empty()) {
                    self.post(cig_handle as u16, DispatchId::Cig, Event::CigCleanup)
                }
            }
        }
        if let Some(acl_connection_handle) = acl_connection_handle {
            self.cis_est_complete(acl_connection_handle)
        }
    }

    /// Release the procedure and move on to the next CIS queued by
    /// Create CIS, if any.
    fn cis_est_complete(&mut self, handle: u16) {
        self.llcp_complete(handle, LlcpProc::CisEst);
        if self.pools.find_conn(handle).is_some_and(|conn| !conn.cis_create_queue.is_empty()) {
            self.llcp_start_local(handle, LlcpProc::CisEst)
        }
    }
}
