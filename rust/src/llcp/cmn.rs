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

//! Common procedures: feature exchange, version exchange, data length
//! update and peer sleep clock accuracy request. Peer requests are
//! answered on reception and never take the procedure slot.

use tracing::{debug, trace};

use crate::config::CoreConfig;
use crate::llcp::ctx::{ConnCtx, PeerVersion};
use crate::llcp::procedure::LlcpProc;
use crate::llcp::{Context, LinkLayer};
use crate::packets::hci::{ErrorCode, HostEvent, Role};
use crate::packets::llcp::{DataLength, LlcpPdu};

/// Largest data PDU payload accepted locally.
pub const LOCAL_MAX_RX_OCTETS: u16 = 251;
/// Largest data PDU reception time accepted locally, 251 octets on
/// the 1M PHY.
pub const LOCAL_MAX_RX_TIME: u16 = 2120;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CmnState {
    #[default]
    Idle,
    /// Request sent, waiting for the peer response.
    WaitRsp(LlcpProc),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmnEvent {
    Start(LlcpProc),
    PeerRsp(LlcpProc),
    PeerReject(LlcpProc, ErrorCode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmnAction {
    SendReq(LlcpProc),
    Complete(LlcpProc),
    Fail(LlcpProc, ErrorCode),
}

fn transition(state: CmnState, event: CmnEvent) -> Option<(CmnAction, CmnState)> {
    use CmnAction::*;
    use CmnState::*;

    match (state, event) {
        (Idle, CmnEvent::Start(proc)) => Some((SendReq(proc), WaitRsp(proc))),
        // Resumed after a peer procedure took over the connection.
        (WaitRsp(waiting), CmnEvent::Start(proc)) if waiting == proc => {
            Some((SendReq(proc), WaitRsp(proc)))
        }
        (WaitRsp(waiting), CmnEvent::PeerRsp(proc)) if waiting == proc => {
            Some((Complete(proc), Idle))
        }
        (WaitRsp(waiting), CmnEvent::PeerReject(proc, error_code)) if waiting == proc => {
            Some((Fail(proc, error_code), Idle))
        }
        _ => None,
    }
}

fn version_ind(config: &CoreConfig) -> LlcpPdu {
    LlcpPdu::VersionInd {
        version: config.bt_version,
        company_id: config.company_id,
        sub_version: config.sub_version,
    }
}

fn local_data_length(conn: &ConnCtx) -> DataLength {
    DataLength {
        max_rx_octets: LOCAL_MAX_RX_OCTETS,
        max_rx_time: LOCAL_MAX_RX_TIME,
        max_tx_octets: conn.max_tx_octets,
        max_tx_time: conn.max_tx_time,
    }
}

/// Effective data length once the peer limits are known.
fn data_length_change(conn: &ConnCtx) -> Option<HostEvent> {
    let peer = conn.peer_data_length.as_ref()?;
    Some(HostEvent::DataLengthChange {
        handle: conn.handle,
        max_tx_octets: conn.max_tx_octets.min(peer.max_rx_octets),
        max_tx_time: conn.max_tx_time.min(peer.max_rx_time),
        max_rx_octets: LOCAL_MAX_RX_OCTETS.min(peer.max_tx_octets),
        max_rx_time: LOCAL_MAX_RX_TIME.min(peer.max_tx_time),
    })
}

impl<C: Context> LinkLayer<C> {
    pub(super) fn cmn_initiate(&mut self, handle: u16, proc: LlcpProc) {
        let Some(conn) = self.pools.find_conn(handle) else {
            return;
        };
        if proc == LlcpProc::VerExch && conn.peer_version.is_some() {
            debug!(handle, "peer version already known");
            self.cmn_report(handle, proc, ErrorCode::Success);
            return self.llcp_complete(handle, proc);
        }
        self.cmn_execute(handle, CmnEvent::Start(proc))
    }

    fn cmn_execute(&mut self, handle: u16, event: CmnEvent) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        let Some((action, next)) = transition(conn.cmn, event) else {
            trace!(handle, state = ?conn.cmn, ?event, "unhandled common procedure event");
            return;
        };
        conn.cmn = next;
        match action {
            CmnAction::SendReq(proc) => {
                self.cmn_send_req(handle, proc);
                self.start_llcp_rsp_timer(handle)
            }
            CmnAction::Complete(proc) => {
                self.cmn_report(handle, proc, ErrorCode::Success);
                self.llcp_complete(handle, proc)
            }
            CmnAction::Fail(proc, error_code) => {
                debug!(handle, ?proc, ?error_code, "common procedure failed");
                self.cmn_report(handle, proc, error_code);
                self.llcp_complete(handle, proc)
            }
        }
    }

    fn cmn_send_req(&mut self, handle: u16, proc: LlcpProc) {
        let features = self.config.supported_features();
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        let pdu = match proc {
            LlcpProc::FeatExch => match conn.role {
                Role::Central => LlcpPdu::FeatureReq { features },
                Role::Peripheral => LlcpPdu::PeripheralFeatureReq { features },
            },
            LlcpProc::VerExch if conn.version_sent => return,
            LlcpProc::VerExch => {
                conn.version_sent = true;
                version_ind(&self.config)
            }
            LlcpProc::DataLenUpd => LlcpPdu::LengthReq(local_data_length(conn)),
            LlcpProc::ReqPeerSca => LlcpPdu::ClockAccuracyReq { sca: self.config.local_sca },
            _ => return,
        };
        self.ctx.send_llcp_packet(handle, pdu)
    }

    /// Completion event of a locally initiated procedure.
    fn cmn_report(&self, handle: u16, proc: LlcpProc, status: ErrorCode) {
        let Some(conn) = self.pools.find_conn(handle) else {
            return;
        };
        let event = match proc {
            LlcpProc::FeatExch => HostEvent::ReadRemoteFeaturesComplete {
                status,
                handle,
                features: conn.peer_features.unwrap_or(0),
            },
            LlcpProc::VerExch => {
                let version = conn.peer_version.unwrap_or_default();
                HostEvent::ReadRemoteVersionComplete {
                    status,
                    handle,
                    version: version.version,
                    company_id: version.company_id,
                    sub_version: version.sub_version,
                }
            }
            LlcpProc::DataLenUpd if status == ErrorCode::Success => {
                let Some(event) = data_length_change(conn) else {
                    return;
                };
                event
            }
            LlcpProc::ReqPeerSca => {
                HostEvent::RequestPeerScaComplete { status, handle, peer_sca: conn.peer_sca }
            }
            _ => return,
        };
        self.ctx.send_host_event(event)
    }

    pub(super) fn cmn_rx(&mut self, handle: u16, pdu: LlcpPdu) {
        let local_features = self.config.supported_features();
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        match pdu {
            LlcpPdu::FeatureReq { features } | LlcpPdu::PeripheralFeatureReq { features } => {
                conn.peer_features = Some(features);
                self.ctx.send_llcp_packet(handle, LlcpPdu::FeatureRsp { features: local_features })
            }
            LlcpPdu::FeatureRsp { features } => {
                conn.peer_features = Some(features);
                self.cmn_execute(handle, CmnEvent::PeerRsp(LlcpProc::FeatExch))
            }
            LlcpPdu::VersionInd { version, company_id, sub_version } => {
                conn.peer_version = Some(PeerVersion { version, company_id, sub_version });
                if conn.version_sent {
                    self.cmn_execute(handle, CmnEvent::PeerRsp(LlcpProc::VerExch))
                } else {
                    conn.version_sent = true;
                    self.ctx.send_llcp_packet(handle, version_ind(&self.config))
                }
            }
            LlcpPdu::LengthReq(length) => {
                conn.peer_data_length = Some(length);
                self.ctx.send_llcp_packet(handle, LlcpPdu::LengthRsp(local_data_length(conn)));
                if let Some(event) = data_length_change(conn) {
                    self.ctx.send_host_event(event)
                }
            }
            LlcpPdu::LengthRsp(length) => {
                conn.peer_data_length = Some(length);
                self.cmn_execute(handle, CmnEvent::PeerRsp(LlcpProc::DataLenUpd))
            }
            LlcpPdu::ClockAccuracyReq { sca } => {
                conn.peer_sca = sca;
                self.ctx.send_llcp_packet(
                    handle,
                    LlcpPdu::ClockAccuracyRsp { sca: self.config.local_sca },
                )
            }
            LlcpPdu::ClockAccuracyRsp { sca } => {
                conn.peer_sca = sca;
                self.cmn_execute(handle, CmnEvent::PeerRsp(LlcpProc::ReqPeerSca))
            }
            pdu => trace!(handle, opcode = ?pdu.opcode(), "not a common procedure PDU"),
        }
    }

    pub(super) fn cmn_rx_reject(&mut self, handle: u16, proc: LlcpProc, error_code: ErrorCode) {
        self.cmn_execute(handle, CmnEvent::PeerReject(proc, error_code))
    }
}
