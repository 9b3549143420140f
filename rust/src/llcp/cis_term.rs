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

//! CIS termination procedure and CIS/CIG teardown.

use tracing::{debug, info, trace};

use crate::llcp::cis_est::CisEstState;
use crate::llcp::manager::{DispatchId, Event};
use crate::llcp::procedure::LlcpProc;
use crate::llcp::{Context, LinkLayer, OpId, TimerId};
use crate::packets::hci::{ErrorCode, HostEvent, Role};
use crate::packets::llcp::LlcpPdu;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CisTermState {
    #[default]
    Idle,
    /// Waiting for the connection to be available.
    Pending(ErrorCode),
    /// LL_CIS_TERMINATE_IND sent, waiting for the acknowledgement.
    WaitAck(ErrorCode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CisTermEvent {
    HostDisconnect(ErrorCode),
    Start,
    Acked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CisTermAction {
    StartProc,
    SendInd(ErrorCode),
    Close,
}

fn transition(state: CisTermState, event: CisTermEvent) -> Option<(CisTermAction, CisTermState)> {
    match (state, event) {
        (CisTermState::Idle, CisTermEvent::HostDisconnect(reason)) => {
            Some((CisTermAction::StartProc, CisTermState::Pending(reason)))
        }
        (CisTermState::Pending(reason), CisTermEvent::Start) => {
            Some((CisTermAction::SendInd(reason), CisTermState::WaitAck(reason)))
        }
        (CisTermState::WaitAck(_), CisTermEvent::Acked) => {
            Some((CisTermAction::Close, CisTermState::Idle))
        }
        _ => None,
    }
}

impl<C: Context> LinkLayer<C> {
    fn cis_term_execute(&mut self, cis_connection_handle: u16, event: CisTermEvent) {
        let Some(cis) = self.pools.find_cis_by_handle_mut(cis_connection_handle) else {
            return;
        };
        let Some(acl_connection_handle) = cis.acl_connection_handle else {
            trace!(cis_connection_handle, ?event, "CIS not bound to a connection");
            return;
        };
        let state = cis.term_state;
        let Some((action, next)) = transition(state, event) else {
            trace!(cis_connection_handle, ?state, ?event, "unhandled CIS termination event");
            return;
        };
        cis.term_state = next;
        debug!(cis_connection_handle, ?state, ?next, "CIS termination");

        match action {
            CisTermAction::StartProc => {
                self.llcp_start_local(acl_connection_handle, LlcpProc::CisTerm)
            }
            CisTermAction::SendInd(reason) => {
                let pdu = LlcpPdu::CisTerminateInd {
                    cig_id: cis.cig_id,
                    cis_id: cis.cis_id,
                    error_code: reason.into(),
                };
                self.ctx.send_llcp_packet(acl_connection_handle, pdu)
            }
            CisTermAction::Close => {
                self.close_cis(cis_connection_handle, ErrorCode::ConnectionTerminatedByLocalHost);
                self.cis_term_finish(acl_connection_handle)
            }
        }
    }

    pub(super) fn cis_term_host_disconnect(&mut self, cis_connection_handle: u16, reason: ErrorCode) {
        self.cis_term_execute(cis_connection_handle, CisTermEvent::HostDisconnect(reason))
    }

    /// The procedure became active on the ACL: terminate the CIS that
    /// asked for it.
    pub(super) fn cis_term_initiate(&mut self, handle: u16) {
        let pending = self.pools.cis_handles(|cis| {
            cis.acl_connection_handle == Some(handle)
                && matches!(cis.term_state, CisTermState::Pending(_))
        });
        match pending.first() {
            Some(cis_connection_handle) => {
                self.cis_term_execute(*cis_connection_handle, CisTermEvent::Start)
            }
            None => {
                debug!(handle, "no CIS left to terminate");
                self.cis_term_finish(handle)
            }
        }
    }

    /// End of a connection event of the ACL `handle`: a pending
    /// LL_CIS_TERMINATE_IND has been acknowledged.
    pub(super) fn cis_term_ack(&mut self, handle: u16) {
        for cis_connection_handle in self.pools.cis_handles(|cis| {
            cis.acl_connection_handle == Some(handle)
                && matches!(cis.term_state, CisTermState::WaitAck(_))
        }) {
            self.cis_term_execute(cis_connection_handle, CisTermEvent::Acked)
        }
    }

    /// LL_CIS_TERMINATE_IND from the peer.
    pub(super) fn cis_term_rx(&mut self, handle: u16, cig_id: u8, cis_id: u8, reason: ErrorCode) {
        let Some(cis_connection_handle) = self
            .pools
            .find_cis_by_id(cig_id, cis_id)
            .filter(|cis_connection_handle| {
                self.pools
                    .find_cis_by_handle(*cis_connection_handle)
                    .is_some_and(|cis| cis.acl_connection_handle == Some(handle))
            })
        else {
            trace!(handle, cig_id, cis_id, "skipping out of place LL_CIS_TERMINATE_IND");
            return;
        };
        self.cis_term_close(cis_connection_handle, reason)
    }

    /// Close a CIS outside of the termination procedure. A local
    /// termination in flight is completed as well.
    pub(super) fn cis_term_close(&mut self, cis_connection_handle: u16, reason: ErrorCode) {
        let Some(cis) = self.pools.find_cis_by_handle(cis_connection_handle) else {
            return;
        };
        let terminating = match (cis.acl_connection_handle, cis.term_state) {
            (Some(acl_connection_handle), CisTermState::WaitAck(_)) => Some(acl_connection_handle),
            _ => None,
        };
        self.close_cis(cis_connection_handle, reason);
        if let Some(acl_connection_handle) = terminating {
            self.cis_term_finish(acl_connection_handle)
        }
    }

    /// Release the procedure, then replay an LL_CIS_REQ received while
    /// it was running.
    fn cis_term_finish(&mut self, handle: u16) {
        self.llcp_complete(handle, LlcpProc::CisTerm);
        if self.pools.find_conn(handle).is_some_and(|conn| conn.pended_cis_req.is_some()) {
            self.post(handle, DispatchId::Conn, Event::IntPendCisReq)
        }
    }

    /// Tear down a CIS. The host is told when the CIS was established.
    /// A peripheral CIS is freed, a central CIS goes back to its
    /// configured state. The CIG operation is removed from the
    /// scheduler with the last established CIS.
    pub(super) fn close_cis(&mut self, cis_connection_handle: u16, reason: ErrorCode) {
        let Some(cis) = self.pools.find_cis_by_handle_mut(cis_connection_handle) else {
            return;
        };
        let was_established = cis.established;
        let (role, cig_id, cis_offset_usec) = (cis.role, cis.cig_id, cis.cis_offset_usec);
        cis.established = false;
        cis.est_state = CisEstState::Idle;
        cis.term_state = CisTermState::Idle;
        cis.event_counter = 0;
        cis.acl_connection_handle = None;
        let sdus: Vec<_> = cis.sdu_queue.drain(..).collect();
        cis.tx_ft.clear();
        cis.rx_ft.clear();
        cis.rx_flushed = 0;
        for sdu in sdus {
            self.ctx.free_sdu(cis_connection_handle, sdu);
            self.pools.iso_credits = self.pools.iso_credits.saturating_add(1);
        }
        // The peripheral slot is freed below, which stops both timers.
        if role == Role::Central {
            self.ctx.stop_timer(TimerId::CisLlcpRsp(cis_connection_handle));
            self.ctx.stop_timer(TimerId::CisSupervision(cis_connection_handle));
        }

        let cig_handle = self.pools.find_cig_by_id(cig_id);
        let mut cig_empty = false;
        if let Some(cig_handle) = cig_handle {
            if let Some(cig) = self.pools.cig_mut(cig_handle) {
                if was_established {
                    cig.num_cis_ested = cig.num_cis_ested.saturating_sub(1);
                }
                if cig.num_cis_ested > 0 && cig.cis_list.head_handle() == Some(cis_connection_handle)
                {
                    cig.head_cis_removed = true;
                    cig.removed_head_offset_usec = cis_offset_usec;
                }
                cig.cis_list.remove_cis(cis_connection_handle);
                if cig.num_cis_ested == 0 && cig.scheduled {
                    self.ctx.sch_remove(OpId::cig(cig_handle));
                    cig.scheduled = false;
                    cig.head_cis_removed = false;
                }
                cig_empty = cig.cis_list.is_empty();
            }
        }

        if was_established {
            info!(cis_connection_handle, ?reason, "CIS closed");
            if !self.reset_in_progress {
                self.ctx.send_host_event(HostEvent::DisconnectionComplete {
                    status: ErrorCode::Success,
                    handle: cis_connection_handle,
                    reason,
                });
            }
        }

        if role == Role::Peripheral {
            self.pools.free_cis_ctx(&self.ctx, cis_connection_handle);
            if let (Some(cig_handle), true, false) = (cig_handle, cig_empty, self.reset_in_progress) {
                self.post(cig_handle as u16, DispatchId::Cig, Event::CigCleanup)
            }
        }
    }

    /// Release a CIG left without CIS. While a CIS of the CIG is still
    /// established only its operation is removed from the scheduler.
    pub(super) fn cig_cleanup(&mut self, cig_handle: u8) {
        let Some(cig) = self.pools.cig_mut(cig_handle) else {
            return;
        };
        if cig.scheduled {
            self.ctx.sch_remove(OpId::cig(cig_handle));
            cig.scheduled = false;
        }
        if cig.num_cis_ested == 0 && cig.cis_list.is_empty() {
            self.pools.free_cig_ctx(&self.ctx, cig_handle)
        } else {
            debug!(cig_handle, num_cis_ested = cig.num_cis_ested, "CIG kept");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::llcp::test::context::Recorded;
    use crate::llcp::test::{cis_req, connected, establish_peripheral_cis, ingest, ACL};
    use crate::llcp::{OpEvent, Protocol};

    #[test]
    fn test_transitions() {
        let reason = ErrorCode::RemoteUserTerminatedConnection;
        assert_eq!(
            transition(CisTermState::Idle, CisTermEvent::HostDisconnect(reason)),
            Some((CisTermAction::StartProc, CisTermState::Pending(reason)))
        );
        assert_eq!(
            transition(CisTermState::Pending(reason), CisTermEvent::Start),
            Some((CisTermAction::SendInd(reason), CisTermState::WaitAck(reason)))
        );
        assert_eq!(transition(CisTermState::WaitAck(reason), CisTermEvent::HostDisconnect(reason)), None);
        assert_eq!(transition(CisTermState::Idle, CisTermEvent::Acked), None);
    }

    #[test]
    fn test_host_disconnect() {
        let mut ll = connected(Role::Peripheral);
        let cis = establish_peripheral_cis(&mut ll, 1, 0);
        ll.ctx().clear();

        ll.disconnect(cis, ErrorCode::RemoteUserTerminatedConnection).unwrap();
        assert_eq!(
            ll.ctx().llcp_packets(),
            vec![(ACL, LlcpPdu::CisTerminateInd { cig_id: 1, cis_id: 0, error_code: 0x13 })]
        );
        assert_eq!(ll.pools().find_conn(ACL).unwrap().llcp.active(), Some(LlcpProc::CisTerm));
        assert!(ll.ctx().host_events().is_empty());

        // Acknowledged at the end of the connection event.
        ll.op_event(OpId::acl(ACL), OpEvent::End(0));
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::DisconnectionComplete {
                status: ErrorCode::Success,
                handle: cis,
                reason: ErrorCode::ConnectionTerminatedByLocalHost
            }]
        );
        assert_eq!(ll.pools().num_enabled_cis(), 0);
        assert_eq!(ll.pools().find_cig_by_id(1), None);
        assert_eq!(ll.ctx().take(|r| *r == Recorded::SchRemove(OpId::cig(0))), 1);
        assert_eq!(ll.ctx().take(|r| *r == Recorded::BbStop(Protocol::Cis)), 1);
        assert_eq!(ll.pools().find_conn(ACL).unwrap().llcp.active(), None);
    }

    #[test]
    fn test_peer_terminate() {
        let mut ll = connected(Role::Peripheral);
        let cis = establish_peripheral_cis(&mut ll, 1, 0);
        ll.ctx().clear();

        ingest(&mut ll, LlcpPdu::CisTerminateInd { cig_id: 1, cis_id: 0, error_code: 0x13 });
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::DisconnectionComplete {
                status: ErrorCode::Success,
                handle: cis,
                reason: ErrorCode::RemoteUserTerminatedConnection
            }]
        );
        assert_eq!(ll.ctx().take(|r| *r == Recorded::StopTimer(TimerId::CisSupervision(cis))), 1);
        assert_eq!(ll.ctx().take(|r| *r == Recorded::StopTimer(TimerId::CisLlcpRsp(cis))), 1);
        assert_eq!(ll.ctx().take(|r| *r == Recorded::BbStop(Protocol::Cis)), 1);
        assert!(ll.ctx().llcp_packets().is_empty());
    }

    #[test]
    fn test_out_of_place_terminate() {
        let mut ll = connected(Role::Peripheral);
        establish_peripheral_cis(&mut ll, 1, 0);
        ll.ctx().clear();

        ingest(&mut ll, LlcpPdu::CisTerminateInd { cig_id: 1, cis_id: 3, error_code: 0x13 });
        assert!(ll.ctx().host_events().is_empty());
        assert_eq!(ll.pools().num_established_cis(), 1);
    }

    #[test]
    fn test_cig_kept_while_cis_established() {
        let mut ll = connected(Role::Peripheral);
        let first = establish_peripheral_cis(&mut ll, 1, 0);
        let second = establish_peripheral_cis(&mut ll, 1, 1);
        let cig_handle = ll.pools().find_cig_by_id(1).unwrap();
        ll.ctx().clear();

        ingest(&mut ll, LlcpPdu::CisTerminateInd { cig_id: 1, cis_id: 0, error_code: 0x13 });
        let cig = ll.pools().cig(cig_handle).unwrap();
        assert_eq!(cig.num_cis_ested, 1);
        assert!(cig.scheduled);
        assert!(cig.head_cis_removed);
        assert_eq!(cig.cis_list.handles(), vec![second]);
        assert!(ll.pools().find_cis_by_handle(first).is_none());
        assert_eq!(ll.ctx().take(|r| matches!(r, Recorded::SchRemove(_))), 0);

        ll.post(cig_handle as u16, DispatchId::Cig, Event::CigCleanup);
        ll.tick();
        assert_eq!(ll.ctx().take(|r| *r == Recorded::SchRemove(OpId::cig(cig_handle))), 1);
        assert_eq!(ll.ctx().take(|r| *r == Recorded::BbStop(Protocol::Cis)), 0);
        assert!(ll.pools().cig(cig_handle).is_some());
    }

    #[test]
    fn test_supervision_timeout() {
        let mut ll = connected(Role::Peripheral);
        let cis = establish_peripheral_cis(&mut ll, 1, 0);
        ll.ctx().clear();

        ll.timer_expired(TimerId::CisSupervision(cis));
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::DisconnectionComplete {
                status: ErrorCode::Success,
                handle: cis,
                reason: ErrorCode::ConnectionTimeout
            }]
        );
        assert!(ll.pools().find_conn(ACL).is_some());
    }

    #[test]
    fn test_request_deferred_until_terminated() {
        let mut ll = connected(Role::Peripheral);
        let cis = establish_peripheral_cis(&mut ll, 1, 0);
        ll.disconnect(cis, ErrorCode::RemoteUserTerminatedConnection).unwrap();
        ll.ctx().clear();

        ingest(&mut ll, LlcpPdu::CisReq(cis_req(1, 0, 12)));
        assert!(ll.ctx().llcp_packets().is_empty());
        assert!(ll.pools().find_conn(ACL).unwrap().pended_cis_req.is_some());

        ll.op_event(OpId::acl(ACL), OpEvent::End(0));
        let events = ll.ctx().host_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HostEvent::DisconnectionComplete { handle, .. } if handle == cis));
        assert_eq!(
            events[1],
            HostEvent::CisRequest { acl_handle: ACL, cis_handle: cis, cig_id: 1, cis_id: 0 }
        );
        assert_eq!(
            ll.pools().find_cis_by_handle(cis).unwrap().est_state,
            CisEstState::HostReply
        );
        assert_eq!(ll.pools().find_conn(ACL).unwrap().llcp.active(), Some(LlcpProc::CisEst));
    }

    #[test]
    fn test_connection_loss_closes_cis() {
        let mut ll = connected(Role::Peripheral);
        let cis = establish_peripheral_cis(&mut ll, 1, 0);
        ll.ctx().clear();

        ingest(&mut ll, LlcpPdu::TerminateInd { error_code: 0x13 });
        let events = ll.ctx().host_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HostEvent::DisconnectionComplete { handle, .. } if handle == cis));
        assert!(matches!(events[1], HostEvent::DisconnectionComplete { handle: ACL, .. }));
        assert_eq!(ll.pools().num_enabled_cis(), 0);
        assert_eq!(ll.pools().cis_radio_refs(), 0);
    }
}
