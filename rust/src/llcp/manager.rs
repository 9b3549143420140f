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

//! Link layer instance: owns the context pools, queues messages from
//! the host and the baseband, and dispatches them to the procedure
//! state machines.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::{CoreConfig, LeFeature};
use crate::llcp::bod::{self, OpEvent, OpId, OpKind};
use crate::llcp::chan::ChannelMap;
use crate::llcp::conn_upd::ConnUpdParams;
use crate::llcp::ctx::{ConnCtx, ConnParams, EncBlock};
use crate::llcp::pool::ContextPools;
use crate::llcp::procedure::{LlcpProc, StartOutcome};
use crate::llcp::timing::{compute_access_address, compute_crc_init, compute_hop_inc};
use crate::llcp::{Context, Protocol, TimerId};
use crate::packets::hci::{ChanSel, ErrorCode, HostEvent, Role};
use crate::packets::llcp::{LlcpPdu, Opcode, PacketError};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LinkLayerError {
    #[error("Unknown connection handle 0x{0:03x}")]
    UnknownConnection(u16),
    #[error("Link 0x{0:03x} already exists")]
    LinkAlreadyExists(u16),
    #[error("No free connection context")]
    ConnectionLimitExceeded,
    #[error("Command disallowed: {0}")]
    CommandDisallowed(&'static str),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(&'static str),
    #[error("Unsupported feature or parameter value: {0}")]
    Unsupported(&'static str),
    #[error("No free CIG or CIS context")]
    LimitedResources,
    #[error("Invalid LLCP packet: {0}")]
    InvalidLlcpPacket(#[from] PacketError),
}

impl LinkLayerError {
    /// Status reported to the host for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LinkLayerError::UnknownConnection(_) => ErrorCode::UnknownConnection,
            LinkLayerError::LinkAlreadyExists(_) => ErrorCode::ConnectionAlreadyExists,
            LinkLayerError::ConnectionLimitExceeded => ErrorCode::ConnectionLimitExceeded,
            LinkLayerError::CommandDisallowed(_) => ErrorCode::CommandDisallowed,
            LinkLayerError::InvalidParameters(_) => ErrorCode::InvalidHciCommandParameters,
            LinkLayerError::Unsupported(_) => ErrorCode::UnsupportedFeatureOrParameterValue,
            LinkLayerError::LimitedResources => ErrorCode::ConnectionRejectedLimitedResources,
            LinkLayerError::InvalidLlcpPacket(_) => ErrorCode::InvalidLlParameters,
        }
    }
}

/// Receiver of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchId {
    /// ACL connection, addressed by connection handle.
    Conn,
    /// CIS, addressed by CIS connection handle.
    Cis,
    /// CIG, addressed by CIG handle.
    Cig,
    /// Every context.
    Broadcast,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Llcp(LlcpPdu),
    /// Received LLCP PDU with invalid length or parameters.
    LlcpInvalid(Opcode),
    /// Received LLCP PDU with an unknown opcode.
    LlcpUnknown(u8),
    HostDisconnect(ErrorCode),
    HostReadRemoteFeatures,
    HostReadRemoteVersion,
    HostSetDataLength { tx_octets: u16, tx_time: u16 },
    HostRequestPeerSca,
    HostConnectionUpdate(ConnUpdParams),
    HostChannelMapUpdate(ChannelMap),
    HostSetPhy { tx_phys: u8, rx_phys: u8 },
    HostCreateCis,
    /// Replay of an LL_CIS_REQ deferred while a CIS was terminating.
    IntPendCisReq,
    LlcpRspTimeout,
    AclOp(OpEvent),

    HostAcceptCis,
    HostRejectCis(ErrorCode),
    HostCisDisconnect(ErrorCode),
    CisLlcpRspTimeout,
    CisSupervisionTimeout,

    CigOp(OpEvent),
    CigCleanup,

    Reset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub handle: u16,
    pub dispatch_id: DispatchId,
    pub event: Event,
}

pub struct LinkLayer<C: Context> {
    pub(super) ctx: C,
    pub(super) config: CoreConfig,
    pub(super) pools: ContextPools,
    queue: VecDeque<Message>,
    /// Teardown of CIGs is deferred until the reset completes.
    pub(super) reset_in_progress: bool,
}

impl<C: Context> LinkLayer<C> {
    pub fn new(ctx: C, config: CoreConfig) -> LinkLayer<C> {
        let pools = ContextPools::new(&config);
        LinkLayer { ctx, config, pools, queue: VecDeque::new(), reset_in_progress: false }
    }

    pub fn ctx(&self) -> &C {
        &self.ctx
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn pools(&self) -> &ContextPools {
        &self.pools
    }

    /// Queue a message for the next `tick`.
    pub fn post(&mut self, handle: u16, dispatch_id: DispatchId, event: Event) {
        self.queue.push_back(Message { handle, dispatch_id, event })
    }

    /// Dispatch every queued message, including the ones posted while
    /// processing.
    pub fn tick(&mut self) {
        while let Some(message) = self.queue.pop_front() {
            self.dispatch(message)
        }
    }

    fn run(&mut self, handle: u16, dispatch_id: DispatchId, event: Event) {
        self.post(handle, dispatch_id, event);
        self.tick()
    }

    fn dispatch(&mut self, message: Message) {
        let Message { handle, dispatch_id, event } = message;
        match dispatch_id {
            DispatchId::Conn => self.conn_dispatch(handle, event),
            DispatchId::Cis => self.cis_dispatch(handle, event),
            DispatchId::Cig => self.cig_dispatch(handle, event),
            DispatchId::Broadcast => self.broadcast_dispatch(event),
        }
    }

    fn conn_dispatch(&mut self, handle: u16, event: Event) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            trace!(handle, ?event, "dropping message for unknown connection");
            return;
        };
        match event {
            Event::Llcp(pdu) => self.rx_llcp(handle, pdu),
            Event::LlcpInvalid(opcode) => self.rx_llcp_invalid(handle, opcode),
            Event::LlcpUnknown(unknown_type) => {
                debug!(handle, unknown_type, "unknown LLCP opcode");
                self.ctx.send_llcp_packet(handle, LlcpPdu::UnknownRsp { unknown_type })
            }
            Event::HostDisconnect(reason) => {
                self.terminate_conn(handle, reason, ErrorCode::ConnectionTerminatedByLocalHost)
            }
            Event::HostReadRemoteFeatures => self.llcp_start_local(handle, LlcpProc::FeatExch),
            Event::HostReadRemoteVersion => self.llcp_start_local(handle, LlcpProc::VerExch),
            Event::HostSetDataLength { tx_octets, tx_time } => {
                conn.max_tx_octets = tx_octets;
                conn.max_tx_time = tx_time;
                self.llcp_start_local(handle, LlcpProc::DataLenUpd)
            }
            Event::HostRequestPeerSca => self.llcp_start_local(handle, LlcpProc::ReqPeerSca),
            Event::HostConnectionUpdate(params) => {
                conn.conn_upd_req = Some(params);
                self.llcp_start_local(handle, LlcpProc::ConnUpd)
            }
            Event::HostChannelMapUpdate(map) => {
                conn.chan_map_req = Some(map);
                self.llcp_start_local(handle, LlcpProc::ChanMapUpd)
            }
            Event::HostSetPhy { tx_phys, rx_phys } => {
                conn.phy_pref = (tx_phys, rx_phys);
                self.llcp_start_local(handle, LlcpProc::PhyUpd)
            }
            Event::HostCreateCis => self.llcp_start_local(handle, LlcpProc::CisEst),
            Event::IntPendCisReq => {
                if let Some(req) = conn.pended_cis_req.take() {
                    self.cis_est_rx_req(handle, req)
                }
            }
            Event::LlcpRspTimeout => {
                warn!(handle, active = ?conn.llcp.active(), "LLCP response timeout");
                self.teardown_conn(handle, ErrorCode::LlResponseTimeout)
            }
            Event::AclOp(op_event) => self.acl_op_event(handle, op_event),
            event => trace!(handle, ?event, "ignored connection event"),
        }
    }

    fn cis_dispatch(&mut self, cis_connection_handle: u16, event: Event) {
        if self.pools.find_cis_by_handle(cis_connection_handle).is_none() {
            trace!(cis_connection_handle, ?event, "dropping message for unknown CIS");
            return;
        }
        match event {
            Event::HostAcceptCis => self.cis_est_host_accept(cis_connection_handle),
            Event::HostRejectCis(reason) => self.cis_est_host_reject(cis_connection_handle, reason),
            Event::HostCisDisconnect(reason) => {
                self.cis_term_host_disconnect(cis_connection_handle, reason)
            }
            Event::CisLlcpRspTimeout => self.cis_est_timeout(cis_connection_handle),
            Event::CisSupervisionTimeout => {
                warn!(cis_connection_handle, "CIS supervision timeout");
                self.cis_term_close(cis_connection_handle, ErrorCode::ConnectionTimeout)
            }
            event => trace!(cis_connection_handle, ?event, "ignored CIS event"),
        }
    }

    fn cig_dispatch(&mut self, cig_handle: u16, event: Event) {
        let Ok(cig_handle) = u8::try_from(cig_handle) else {
            trace!(cig_handle, "invalid CIG handle");
            return;
        };
        if self.pools.cig(cig_handle).is_none() {
            trace!(cig_handle, ?event, "dropping message for unknown CIG");
            return;
        }
        match event {
            Event::CigOp(op_event) => self.cig_op_event(cig_handle, op_event),
            Event::CigCleanup => self.cig_cleanup(cig_handle),
            event => trace!(cig_handle, ?event, "ignored CIG event"),
        }
    }

    fn broadcast_dispatch(&mut self, event: Event) {
        match event {
            Event::Reset => self.reset_all(),
            event => trace!(?event, "ignored broadcast event"),
        }
    }

    /// Start a locally initiated procedure, or pend it while another
    /// one owns the connection.
    pub(super) fn llcp_start_local(&mut self, handle: u16, proc: LlcpProc) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        match conn.llcp.start_local(proc) {
            StartOutcome::Started => self.llcp_initiate(handle, proc),
            StartOutcome::Pended => {
                debug!(handle, ?proc, active = ?conn.llcp.active(), "procedure pended")
            }
        }
    }

    /// First step of a procedure that just became active.
    pub(super) fn llcp_initiate(&mut self, handle: u16, proc: LlcpProc) {
        match proc {
            LlcpProc::FeatExch | LlcpProc::VerExch | LlcpProc::DataLenUpd | LlcpProc::ReqPeerSca => {
                self.cmn_initiate(handle, proc)
            }
            LlcpProc::ConnUpd | LlcpProc::ChanMapUpd => self.conn_upd_initiate(handle, proc),
            LlcpProc::PhyUpd => self.phy_upd_initiate(handle),
            LlcpProc::CisEst => self.cis_est_initiate(handle),
            LlcpProc::CisTerm => self.cis_term_initiate(handle),
        }
    }

    /// Release the procedure slot and resume the next pended procedure.
    pub(super) fn llcp_complete(&mut self, handle: u16, proc: LlcpProc) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        let next = conn.llcp.complete(proc);
        if conn.llcp.active().is_none() {
            self.ctx.stop_timer(TimerId::LlcpRsp(handle));
        }
        if let Some(next) = next {
            debug!(handle, ?next, "resuming pended procedure");
            self.llcp_initiate(handle, next)
        }
    }

    pub(super) fn start_llcp_rsp_timer(&self, handle: u16) {
        self.ctx.start_timer(TimerId::LlcpRsp(handle), self.config.llcp_rsp_timeout_ms)
    }

    /// Reject a peer PDU with LL_REJECT_EXT_IND.
    pub(super) fn reject_ext(&self, handle: u16, opcode: Opcode, error_code: ErrorCode) {
        debug!(handle, ?opcode, ?error_code, "rejecting peer request");
        self.ctx.send_llcp_packet(
            handle,
            LlcpPdu::RejectExtInd { reject_opcode: opcode as u8, error_code: error_code.into() },
        )
    }

    fn rx_llcp(&mut self, handle: u16, pdu: LlcpPdu) {
        trace!(handle, opcode = ?pdu.opcode(), "received LLCP PDU");
        match pdu {
            LlcpPdu::TerminateInd { error_code } => {
                self.teardown_conn(handle, ErrorCode::from_u8(error_code))
            }
            LlcpPdu::FeatureReq { .. }
            | LlcpPdu::PeripheralFeatureReq { .. }
            | LlcpPdu::FeatureRsp { .. }
            | LlcpPdu::VersionInd { .. }
            | LlcpPdu::LengthReq(_)
            | LlcpPdu::LengthRsp(_)
            | LlcpPdu::ClockAccuracyReq { .. }
            | LlcpPdu::ClockAccuracyRsp { .. } => self.cmn_rx(handle, pdu),
            LlcpPdu::ConnectionUpdateInd(_) | LlcpPdu::ChannelMapInd { .. } => {
                self.conn_upd_rx(handle, pdu)
            }
            LlcpPdu::PhyReq { .. } | LlcpPdu::PhyRsp { .. } | LlcpPdu::PhyUpdateInd { .. } => {
                self.phy_upd_rx(handle, pdu)
            }
            LlcpPdu::CisReq(req) => self.cis_est_rx_req(handle, req),
            LlcpPdu::CisRsp(rsp) => self.cis_est_rx_rsp(handle, rsp),
            LlcpPdu::CisInd(ind) => self.cis_est_rx_ind(handle, ind),
            LlcpPdu::CisTerminateInd { cig_id, cis_id, error_code } => {
                self.cis_term_rx(handle, cig_id, cis_id, ErrorCode::from_u8(error_code))
            }
            LlcpPdu::RejectInd { error_code } => {
                self.rx_reject(handle, None, ErrorCode::from_u8(error_code))
            }
            LlcpPdu::RejectExtInd { reject_opcode, error_code } => {
                self.rx_reject(handle, Some(reject_opcode), ErrorCode::from_u8(error_code))
            }
            LlcpPdu::UnknownRsp { unknown_type } => {
                self.rx_reject(handle, Some(unknown_type), ErrorCode::UnsupportedRemoteFeature)
            }
        }
    }

    /// Route a peer rejection to the procedure it answers.
    fn rx_reject(&mut self, handle: u16, opcode: Option<u8>, error_code: ErrorCode) {
        let Some(conn) = self.pools.find_conn(handle) else {
            return;
        };
        let proc = match opcode {
            Some(opcode) => proc_of_opcode(opcode),
            None => conn.llcp.active(),
        };
        debug!(handle, ?proc, ?error_code, "peer rejected procedure");
        match proc {
            Some(
                proc @ (LlcpProc::FeatExch
                | LlcpProc::VerExch
                | LlcpProc::DataLenUpd
                | LlcpProc::ReqPeerSca),
            ) => self.cmn_rx_reject(handle, proc, error_code),
            Some(LlcpProc::ConnUpd | LlcpProc::ChanMapUpd) => {
                self.conn_upd_rx_reject(handle, error_code)
            }
            Some(LlcpProc::PhyUpd) => self.phy_upd_rx_reject(handle, error_code),
            Some(LlcpProc::CisEst) => self.cis_est_rx_reject(handle, error_code),
            Some(LlcpProc::CisTerm) | None => trace!(handle, "ignored rejection"),
        }
    }

    /// The owning state machine sees the invalid PDU before the peer is
    /// answered.
    fn rx_llcp_invalid(&mut self, handle: u16, opcode: Opcode) {
        warn!(handle, ?opcode, "invalid LLCP PDU");
        if proc_of_opcode(opcode as u8) == Some(LlcpProc::CisEst) {
            self.cis_est_rx_invalid(handle)
        }
        self.reject_ext(handle, opcode, ErrorCode::InvalidLlParameters)
    }

    /// Local termination: LL_TERMINATE_IND is sent now, the link is torn
    /// down at the end of the connection event.
    pub(super) fn terminate_conn(&mut self, handle: u16, reason: ErrorCode, host_reason: ErrorCode) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        if conn.terminate.is_some() {
            trace!(handle, "termination already in progress");
            return;
        }
        conn.terminate = Some(host_reason);
        info!(handle, ?reason, "terminating connection");
        self.ctx.send_llcp_packet(handle, LlcpPdu::TerminateInd { error_code: reason.into() })
    }

    /// Close every CIS of the ACL, then the ACL itself.
    pub(super) fn teardown_conn(&mut self, handle: u16, reason: ErrorCode) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        conn.llcp.clear();
        for cis_connection_handle in
            self.pools.cis_handles(|cis| cis.acl_connection_handle == Some(handle))
        {
            self.close_cis(cis_connection_handle, reason)
        }
        self.ctx.stop_timer(TimerId::LlcpRsp(handle));
        self.ctx.sch_remove(OpId::acl(handle));
        if self.pools.free_conn(handle).is_none() {
            return;
        }
        if self.pools.conns.num_used() == 0 {
            self.ctx.bb_stop(Protocol::Acl);
        }
        info!(handle, ?reason, "connection closed");
        if !self.reset_in_progress {
            self.ctx.send_host_event(HostEvent::DisconnectionComplete {
                status: ErrorCode::Success,
                handle,
                reason,
            })
        }
    }

    fn reset_all(&mut self) {
        info!("link layer reset");
        self.reset_in_progress = true;
        for cis_connection_handle in self.pools.cis_handles(|_| true) {
            self.close_cis(cis_connection_handle, ErrorCode::ConnectionTerminatedByLocalHost);
            self.pools.free_cis_ctx(&self.ctx, cis_connection_handle);
        }
        for handle in self.pools.conn_handles() {
            self.teardown_conn(handle, ErrorCode::ConnectionTerminatedByLocalHost)
        }
        let cig_handles: Vec<u8> = self.pools.cigs.iter().map(|(index, _)| index as u8).collect();
        for cig_handle in cig_handles {
            if self.pools.cig(cig_handle).is_some_and(|cig| cig.scheduled) {
                self.ctx.sch_remove(OpId::cig(cig_handle));
            }
            self.pools.free_cig_ctx(&self.ctx, cig_handle);
        }
        self.pools.iso_credits = self.config.num_iso_bufs;
        self.reset_in_progress = false;
    }

    /// Register a new ACL connection and schedule its first event.
    /// Returns the connection handle.
    pub fn add_link(&mut self, params: ConnParams) -> Result<u16, LinkLayerError> {
        let handle = params.handle;
        if self.pools.find_conn(handle).is_some() {
            return Err(LinkLayerError::LinkAlreadyExists(handle));
        }
        if handle >= self.config.cis_handle_base {
            return Err(LinkLayerError::InvalidParameters("ACL handle in the CIS handle range"));
        }
        let role = match params.role {
            0 => Role::Central,
            1 => Role::Peripheral,
            _ => return Err(LinkLayerError::InvalidParameters("role")),
        };
        if !ChannelMap::new(params.channel_map).is_valid() {
            return Err(LinkLayerError::InvalidParameters("channel map"));
        }
        if self.pools.conns.num_avail() == 0 {
            return Err(LinkLayerError::ConnectionLimitExceeded);
        }

        let mut params = params;
        if role == Role::Central {
            params.access_address = compute_access_address(|| self.ctx.random_u32());
            params.crc_init = compute_crc_init(self.ctx.random_u32());
            params.hop_inc = compute_hop_inc(self.ctx.random_u32());
        }
        if params.chan_sel == ChanSel::Csa2 as u8
            && !self.config.supports(LeFeature::ChannelSelectionAlgorithm2)
        {
            params.chan_sel = ChanSel::Csa1 as u8;
        }

        let first = self.pools.conns.num_used() == 0;
        let local_sca = self.config.local_sca;
        let conn = self
            .pools
            .alloc_conn(ConnCtx::new(&params, role))
            .ok_or(LinkLayerError::ConnectionLimitExceeded)?;
        if first {
            self.ctx.bb_start(Protocol::Acl);
        }
        bod::commit_acl_op(&self.ctx, conn, local_sca);
        let algorithm = conn.chan.algorithm;
        info!(handle, ?role, access_address = params.access_address, "connection created");

        self.ctx.send_host_event(HostEvent::ConnectionComplete {
            status: ErrorCode::Success,
            handle,
            role,
            peer_address_type: params.peer_address_type,
            peer_address: params.peer_address,
            interval: params.interval,
            latency: params.latency,
            supervision_timeout: params.supervision_timeout,
            central_clock_accuracy: match role {
                Role::Central => 0,
                Role::Peripheral => params.peer_sca,
            },
        });
        self.ctx.send_host_event(HostEvent::ChannelSelectionAlgorithm { handle, algorithm });
        Ok(handle)
    }

    /// Disconnect an ACL connection or a CIS.
    pub fn disconnect(&mut self, handle: u16, reason: ErrorCode) -> Result<(), LinkLayerError> {
        if let Some(cis) = self.pools.find_cis_by_handle(handle) {
            // On the central, before Create CIS; on the peripheral, before
            // the CIS is established.
            if !cis.established {
                return Err(LinkLayerError::CommandDisallowed("CIS is not established"));
            }
            self.run(handle, DispatchId::Cis, Event::HostCisDisconnect(reason));
            return Ok(());
        }
        self.conn(handle)?;
        self.run(handle, DispatchId::Conn, Event::HostDisconnect(reason));
        Ok(())
    }

    pub fn remove_link(&mut self, handle: u16) -> Result<(), LinkLayerError> {
        self.disconnect(handle, ErrorCode::RemoteUserTerminatedConnection)
    }

    /// Enable encryption on an ACL: the session key is the long term
    /// key encrypting the session key diversifier.
    pub fn set_encryption(
        &mut self,
        handle: u16,
        ltk: [u8; 16],
        skd: [u8; 16],
        iv: [u8; 8],
    ) -> Result<(), LinkLayerError> {
        let session_key = self.ctx.aes_ecb_encrypt(&ltk, &skd);
        let conn = self
            .pools
            .find_conn_mut(handle)
            .ok_or(LinkLayerError::UnknownConnection(handle))?;
        conn.enc = EncBlock::new(session_key, iv);
        debug!(handle, "encryption enabled");
        Ok(())
    }

    /// Process an LL Control PDU received on the ACL `handle`.
    pub fn ingest_llcp(&mut self, handle: u16, data: &[u8]) -> Result<(), LinkLayerError> {
        self.conn(handle)?;
        let event = match LlcpPdu::parse(data) {
            Ok(pdu) => Event::Llcp(pdu),
            Err(PacketError::UnknownOpcode(opcode)) => Event::LlcpUnknown(opcode),
            Err(PacketError::InvalidLength { opcode, .. })
            | Err(PacketError::InvalidField { opcode, .. }) => Event::LlcpInvalid(opcode),
            Err(err) => return Err(err.into()),
        };
        self.run(handle, DispatchId::Conn, event);
        Ok(())
    }

    pub fn read_remote_features(&mut self, handle: u16) -> Result<(), LinkLayerError> {
        self.conn(handle)?;
        self.run(handle, DispatchId::Conn, Event::HostReadRemoteFeatures);
        Ok(())
    }

    pub fn read_remote_version(&mut self, handle: u16) -> Result<(), LinkLayerError> {
        self.conn(handle)?;
        self.run(handle, DispatchId::Conn, Event::HostReadRemoteVersion);
        Ok(())
    }

    pub fn set_data_length(
        &mut self,
        handle: u16,
        tx_octets: u16,
        tx_time: u16,
    ) -> Result<(), LinkLayerError> {
        self.conn(handle)?;
        if !(27..=251).contains(&tx_octets) || !(328..=17040).contains(&tx_time) {
            return Err(LinkLayerError::InvalidParameters("data length"));
        }
        self.run(handle, DispatchId::Conn, Event::HostSetDataLength { tx_octets, tx_time });
        Ok(())
    }

    pub fn request_peer_sca(&mut self, handle: u16) -> Result<(), LinkLayerError> {
        self.conn(handle)?;
        if !self.config.supports(LeFeature::SleepClockAccuracyUpdates) {
            return Err(LinkLayerError::Unsupported("sleep clock accuracy updates"));
        }
        self.run(handle, DispatchId::Conn, Event::HostRequestPeerSca);
        Ok(())
    }

    /// Central only.
    pub fn connection_update(
        &mut self,
        handle: u16,
        params: ConnUpdParams,
    ) -> Result<(), LinkLayerError> {
        if self.conn(handle)?.role != Role::Central {
            return Err(LinkLayerError::CommandDisallowed("connection update on a peripheral"));
        }
        if !(6..=3200).contains(&params.interval)
            || params.latency > 499
            || !(10..=3200).contains(&params.supervision_timeout)
        {
            return Err(LinkLayerError::InvalidParameters("connection parameters"));
        }
        self.run(handle, DispatchId::Conn, Event::HostConnectionUpdate(params));
        Ok(())
    }

    /// Central only.
    pub fn channel_map_update(&mut self, handle: u16, channel_map: u64) -> Result<(), LinkLayerError> {
        if self.conn(handle)?.role != Role::Central {
            return Err(LinkLayerError::CommandDisallowed("channel map update on a peripheral"));
        }
        let map = ChannelMap::new(channel_map);
        if !map.is_valid() {
            return Err(LinkLayerError::InvalidParameters("channel map"));
        }
        self.run(handle, DispatchId::Conn, Event::HostChannelMapUpdate(map));
        Ok(())
    }

    pub fn set_phy(&mut self, handle: u16, tx_phys: u8, rx_phys: u8) -> Result<(), LinkLayerError> {
        self.conn(handle)?;
        let supported = self.config.supported_phys();
        if tx_phys == 0 || rx_phys == 0 || (tx_phys | rx_phys) & !supported != 0 {
            return Err(LinkLayerError::Unsupported("PHY"));
        }
        self.run(handle, DispatchId::Conn, Event::HostSetPhy { tx_phys, rx_phys });
        Ok(())
    }

    /// Peripheral: accept the CIS announced by a CIS request event.
    pub fn accept_cis_request(&mut self, cis_connection_handle: u16) -> Result<(), LinkLayerError> {
        self.check_cis_request(cis_connection_handle)?;
        self.run(cis_connection_handle, DispatchId::Cis, Event::HostAcceptCis);
        Ok(())
    }

    pub fn reject_cis_request(
        &mut self,
        cis_connection_handle: u16,
        reason: ErrorCode,
    ) -> Result<(), LinkLayerError> {
        self.check_cis_request(cis_connection_handle)?;
        self.run(cis_connection_handle, DispatchId::Cis, Event::HostRejectCis(reason));
        Ok(())
    }

    fn check_cis_request(&self, cis_connection_handle: u16) -> Result<(), LinkLayerError> {
        let cis = self
            .pools
            .find_cis_by_handle(cis_connection_handle)
            .ok_or(LinkLayerError::UnknownConnection(cis_connection_handle))?;
        if cis.role == Role::Central {
            return Err(LinkLayerError::CommandDisallowed("CIS request on a central CIS"));
        }
        if !cis.is_waiting_host() {
            return Err(LinkLayerError::CommandDisallowed("no CIS request pending"));
        }
        Ok(())
    }

    /// Expiry of a timer started through the context.
    pub fn timer_expired(&mut self, timer: TimerId) {
        match timer {
            TimerId::LlcpRsp(handle) => self.run(handle, DispatchId::Conn, Event::LlcpRspTimeout),
            TimerId::CisLlcpRsp(handle) => {
                self.run(handle, DispatchId::Cis, Event::CisLlcpRspTimeout)
            }
            TimerId::CisSupervision(handle) => {
                self.run(handle, DispatchId::Cis, Event::CisSupervisionTimeout)
            }
        }
    }

    /// Completion reported by the baseband. Encryption packet counters
    /// are updated here, before the event is queued.
    pub fn op_event(&mut self, id: OpId, event: OpEvent) {
        let cis_enc = |cis_connection_handle: Option<u16>| {
            cis_connection_handle
                .and_then(|handle| self.pools.find_cis_by_handle(handle))
                .map(|cis| &cis.enc)
        };
        let enc = match id.kind {
            OpKind::Acl => self.pools.find_conn(id.handle).map(|conn| &conn.enc),
            OpKind::Cig => match event {
                OpEvent::Tx { cis_connection_handle } | OpEvent::Rx { cis_connection_handle, .. } => {
                    cis_enc(cis_connection_handle)
                }
                _ => None,
            },
        };
        match (enc, event) {
            (Some(enc), OpEvent::Tx { .. }) => enc.on_tx(),
            (Some(enc), OpEvent::Rx { .. }) => enc.on_rx(),
            _ => (),
        }
        match id.kind {
            OpKind::Acl => self.run(id.handle, DispatchId::Conn, Event::AclOp(event)),
            OpKind::Cig => self.run(id.handle, DispatchId::Cig, Event::CigOp(event)),
        }
    }

    /// Close every CIS, CIG and connection.
    pub fn reset(&mut self) {
        self.run(0, DispatchId::Broadcast, Event::Reset)
    }

    pub fn get_cis_connection_handle(&self, cig_id: u8, cis_id: u8) -> Option<u16> {
        self.pools.find_cis_by_id(cig_id, cis_id)
    }

    pub(super) fn conn(&self, handle: u16) -> Result<&ConnCtx, LinkLayerError> {
        self.pools.find_conn(handle).ok_or(LinkLayerError::UnknownConnection(handle))
    }
}

/// Procedure a request PDU belongs to.
fn proc_of_opcode(opcode: u8) -> Option<LlcpProc> {
    let opcode: Opcode = num_traits::FromPrimitive::from_u8(opcode)?;
    match opcode {
        Opcode::FeatureReq | Opcode::PeripheralFeatureReq | Opcode::FeatureRsp => {
            Some(LlcpProc::FeatExch)
        }
        Opcode::VersionInd => Some(LlcpProc::VerExch),
        Opcode::LengthReq | Opcode::LengthRsp => Some(LlcpProc::DataLenUpd),
        Opcode::ClockAccuracyReq | Opcode::ClockAccuracyRsp => Some(LlcpProc::ReqPeerSca),
        Opcode::ConnectionUpdateInd => Some(LlcpProc::ConnUpd),
        Opcode::ChannelMapInd => Some(LlcpProc::ChanMapUpd),
        Opcode::PhyReq | Opcode::PhyRsp | Opcode::PhyUpdateInd => Some(LlcpProc::PhyUpd),
        Opcode::CisReq | Opcode::CisRsp | Opcode::CisInd => Some(LlcpProc::CisEst),
        Opcode::CisTerminateInd => Some(LlcpProc::CisTerm),
        Opcode::TerminateInd | Opcode::UnknownRsp | Opcode::RejectInd | Opcode::RejectExtInd => {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::llcp::test::context::{Recorded, TestContext};
    use crate::llcp::test::{conn_params, connected, ACL};
    use crate::packets::hci;

    #[test]
    fn test_add_link_central() {
        let mut ll = LinkLayer::new(TestContext::new(), CoreConfig::default());
        assert_eq!(ll.add_link(conn_params(ACL, Role::Central)), Ok(ACL));
        let conn = ll.pools().find_conn(ACL).unwrap();
        assert!(crate::llcp::timing::is_valid_access_address(conn.access_address));
        assert!((5..=16).contains(&conn.chan.hop_inc));
        assert_eq!(conn.crc_init >> 24, 0);

        let ctx = ll.ctx();
        assert_eq!(ctx.take(|record| matches!(record, Recorded::BbStart(Protocol::Acl))), 1);
        assert_eq!(ctx.take(|record| matches!(record, Recorded::SchInsert(_))), 1);
        assert_eq!(
            ctx.host_events()[1],
            HostEvent::ChannelSelectionAlgorithm { handle: ACL, algorithm: ChanSel::Csa2 }
        );
        assert!(matches!(
            ctx.host_events()[0],
            HostEvent::ConnectionComplete { status: ErrorCode::Success, handle: ACL, .. }
        ));

        assert_eq!(
            ll.add_link(conn_params(ACL, Role::Central)),
            Err(LinkLayerError::LinkAlreadyExists(ACL))
        );
    }

    #[test]
    fn test_add_link_peripheral_keeps_parameters() {
        let mut ll = LinkLayer::new(TestContext::new(), CoreConfig::default());
        let params = conn_params(ACL, Role::Peripheral);
        ll.add_link(params).unwrap();
        let conn = ll.pools().find_conn(ACL).unwrap();
        assert_eq!(conn.access_address, params.access_address);
        assert_eq!(conn.crc_init, params.crc_init);
        assert_eq!(conn.chan.hop_inc, params.hop_inc);
    }

    #[test]
    fn test_connection_limit() {
        let config = CoreConfig { max_conn: 1, ..Default::default() };
        let mut ll = LinkLayer::new(TestContext::new(), config);
        ll.add_link(conn_params(ACL, Role::Central)).unwrap();
        assert_eq!(
            ll.add_link(conn_params(ACL + 1, Role::Central)),
            Err(LinkLayerError::ConnectionLimitExceeded)
        );
        assert_eq!(LinkLayerError::ConnectionLimitExceeded.error_code() as u8, 0x09);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut ll = connected(Role::Central);
        ll.ingest_llcp(ACL, &[0x7f]).unwrap();
        assert_eq!(ll.ctx().llcp_packets(), vec![(ACL, LlcpPdu::UnknownRsp { unknown_type: 0x7f })]);
        assert!(ll.ingest_llcp(ACL, &[]).is_err());
        assert_eq!(ll.ingest_llcp(0x42, &[0x7f]), Err(LinkLayerError::UnknownConnection(0x42)));
    }

    #[test]
    fn test_invalid_pdu_rejected() {
        let mut ll = connected(Role::Central);
        // LL_FEATURE_REQ with a truncated feature set.
        ll.ingest_llcp(ACL, &[Opcode::FeatureReq as u8, 0x01]).unwrap();
        assert_eq!(
            ll.ctx().llcp_packets(),
            vec![(
                ACL,
                LlcpPdu::RejectExtInd {
                    reject_opcode: Opcode::FeatureReq as u8,
                    error_code: ErrorCode::InvalidLlParameters as u8,
                }
            )]
        );
    }

    #[test]
    fn test_peer_terminate() {
        let mut ll = connected(Role::Peripheral);
        ll.ingest_llcp(
            ACL,
            &LlcpPdu::TerminateInd { error_code: ErrorCode::RemoteUserTerminatedConnection as u8 }
                .to_vec(),
        )
        .unwrap();
        assert!(ll.pools().find_conn(ACL).is_none());
        let ctx = ll.ctx();
        assert_eq!(ctx.take(|record| matches!(record, Recorded::BbStop(Protocol::Acl))), 1);
        assert_eq!(
            ctx.host_events(),
            vec![HostEvent::DisconnectionComplete {
                status: ErrorCode::Success,
                handle: ACL,
                reason: ErrorCode::RemoteUserTerminatedConnection,
            }]
        );
    }

    #[test]
    fn test_local_terminate_at_event_end() {
        let mut ll = connected(Role::Central);
        ll.disconnect(ACL, ErrorCode::RemoteUserTerminatedConnection).unwrap();
        assert_eq!(
            ll.ctx().llcp_packets(),
            vec![(ACL, LlcpPdu::TerminateInd { error_code: 0x13 })]
        );
        assert!(ll.pools().find_conn(ACL).is_some());

        ll.op_event(OpId::acl(ACL), OpEvent::End(0));
        assert!(ll.pools().find_conn(ACL).is_none());
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::DisconnectionComplete {
                status: ErrorCode::Success,
                handle: ACL,
                reason: ErrorCode::ConnectionTerminatedByLocalHost,
            }]
        );
    }

    #[test]
    fn test_llcp_response_timeout() {
        let mut ll = connected(Role::Central);
        ll.read_remote_features(ACL).unwrap();
        ll.timer_expired(TimerId::LlcpRsp(ACL));
        assert!(ll.pools().find_conn(ACL).is_none());
        assert!(ll.ctx().host_events().contains(&HostEvent::DisconnectionComplete {
            status: ErrorCode::Success,
            handle: ACL,
            reason: ErrorCode::LlResponseTimeout,
        }));
    }

    #[test]
    fn test_stale_messages_dropped() {
        let mut ll = connected(Role::Central);
        ll.post(0x33, DispatchId::Conn, Event::HostReadRemoteFeatures);
        ll.post(0xe07, DispatchId::Cis, Event::HostAcceptCis);
        ll.post(1, DispatchId::Cig, Event::CigCleanup);
        ll.tick();
        assert!(ll.ctx().llcp_packets().is_empty());
        assert!(ll.ctx().host_events().is_empty());
    }

    #[test]
    fn test_acl_event_end_advances() {
        let mut ll = connected(Role::Central);
        let anchor = ll.pools().find_conn(ACL).unwrap().anchor_usec;
        ll.op_event(OpId::acl(ACL), OpEvent::End(0));
        let conn = ll.pools().find_conn(ACL).unwrap();
        assert_eq!(conn.event_counter, 1);
        assert_eq!(conn.anchor_usec, anchor + 50_000);
        assert_eq!(ll.ctx().take(|record| matches!(record, Recorded::SchReload(_))), 1);
    }

    #[test]
    fn test_hardware_error() {
        let mut ll = connected(Role::Central);
        ll.op_event(OpId::acl(ACL), OpEvent::End(0x03));
        assert!(ll.pools().find_conn(ACL).is_none());
        let events = ll.ctx().host_events();
        assert_eq!(events[0], hci::HostEvent::HardwareError { code: 0x03 });
        assert!(matches!(
            events[1],
            HostEvent::DisconnectionComplete { reason: ErrorCode::HardwareFailure, .. }
        ));
    }

    #[test]
    fn test_encryption_counters() {
        let mut ll = connected(Role::Central);
        ll.set_encryption(ACL, [1; 16], [2; 16], [3; 8]).unwrap();
        let conn = ll.pools().find_conn(ACL).unwrap();
        assert!(conn.enc.enabled);
        assert_eq!(conn.enc.session_key, [3; 16]);

        ll.op_event(OpId::acl(ACL), OpEvent::Tx { cis_connection_handle: None });
        ll.op_event(OpId::acl(ACL), OpEvent::Rx { cis_connection_handle: None, last: true });
        ll.op_event(OpId::acl(ACL), OpEvent::Rx { cis_connection_handle: None, last: true });
        let conn = ll.pools().find_conn(ACL).unwrap();
        assert_eq!(conn.enc.tx_pkt_counter.load(std::sync::atomic::Ordering::Acquire), 1);
        assert_eq!(conn.enc.rx_pkt_counter.load(std::sync::atomic::Ordering::Acquire), 2);
    }

    #[test]
    fn test_reset() {
        let mut ll = connected(Role::Central);
        ll.add_link(conn_params(ACL + 1, Role::Peripheral)).unwrap();
        ll.ctx().clear();
        ll.reset();
        assert_eq!(ll.pools().conns.num_used(), 0);
        assert_eq!(ll.pools().cis_radio_refs(), 0);
        assert_eq!(ll.ctx().take(|record| matches!(record, Recorded::BbStop(Protocol::Acl))), 1);
        assert!(ll.ctx().host_events().is_empty());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(LinkLayerError::UnknownConnection(1).error_code(), ErrorCode::UnknownConnection);
        assert_eq!(
            LinkLayerError::CommandDisallowed("").error_code(),
            ErrorCode::CommandDisallowed
        );
        assert_eq!(
            LinkLayerError::InvalidLlcpPacket(PacketError::Empty).error_code(),
            ErrorCode::InvalidLlParameters
        );
    }
}
