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

//! PHY update procedure.
//!
//! Either side may send LL_PHY_REQ; the central always decides and
//! sends LL_PHY_UPDATE_IND. When both sides request at the same time
//! the central rejects the peripheral's request, and the peripheral
//! drops its own request to answer the central.

use tracing::{debug, trace, warn};

use crate::llcp::conn_upd::{instant_passed, INSTANT_OFFSET};
use crate::llcp::ctx::ConnCtx;
use crate::llcp::procedure::{LlcpProc, PeerStartOutcome};
use crate::llcp::timing::Phy;
use crate::llcp::{Context, LinkLayer, TimerId};
use crate::packets::hci::{ErrorCode, HostEvent, Role};
use crate::packets::llcp::{LlcpPdu, Opcode};

/// Content of LL_PHY_UPDATE_IND. `None` keeps the PHY of that
/// direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhyInd {
    pub instant: u16,
    pub phy_c_to_p: Option<Phy>,
    pub phy_p_to_c: Option<Phy>,
}

impl PhyInd {
    fn changes(&self) -> bool {
        self.phy_c_to_p.is_some() || self.phy_p_to_c.is_some()
    }

    fn to_pdu(self) -> LlcpPdu {
        LlcpPdu::PhyUpdateInd {
            phy_c_to_p: self.phy_c_to_p.map_or(0, Phy::mask),
            phy_p_to_c: self.phy_p_to_c.map_or(0, Phy::mask),
            instant: if self.changes() { self.instant } else { 0 },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PhyUpdState {
    #[default]
    Idle,
    WaitRsp,
    /// Peripheral, waiting for the central's decision.
    WaitInd,
    Instant(PhyInd),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PhyUpdEvent {
    Start,
    /// Peer request, with the indication the central answers with.
    PeerReq(PhyInd),
    PeerRsp(PhyInd),
    PeerInd(PhyInd),
    EventCounter(u16),
    PeerReject(ErrorCode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PhyUpdAction {
    SendReq,
    SendRsp,
    SendInd(PhyInd),
    RejectCollision,
    Arm,
    Apply(PhyInd),
    Complete,
    Fail(ErrorCode),
}

/// State after an indication: wait for the instant, or done when
/// nothing changes.
fn armed(ind: PhyInd) -> PhyUpdState {
    if ind.changes() {
        PhyUpdState::Instant(ind)
    } else {
        PhyUpdState::Idle
    }
}

fn transition(
    role: Role,
    state: PhyUpdState,
    event: PhyUpdEvent,
) -> Option<(PhyUpdAction, PhyUpdState)> {
    use PhyUpdAction::*;
    use PhyUpdState::*;

    match (role, state, event) {
        (_, Idle, PhyUpdEvent::Start) => Some((SendReq, WaitRsp)),

        (Role::Central, Idle, PhyUpdEvent::PeerReq(ind))
        | (Role::Central, WaitRsp, PhyUpdEvent::PeerRsp(ind)) => Some((SendInd(ind), armed(ind))),
        (Role::Central, WaitRsp, PhyUpdEvent::PeerReq(_)) => Some((RejectCollision, WaitRsp)),

        (Role::Peripheral, Idle | WaitRsp, PhyUpdEvent::PeerReq(_)) => Some((SendRsp, WaitInd)),
        (Role::Peripheral, Idle | WaitRsp | WaitInd, PhyUpdEvent::PeerInd(ind)) => {
            if ind.changes() {
                Some((Arm, Instant(ind)))
            } else {
                Some((Complete, Idle))
            }
        }

        (_, Instant(ind), PhyUpdEvent::EventCounter(counter)) if counter == ind.instant => {
            Some((Apply(ind), Idle))
        }
        (_, WaitRsp, PhyUpdEvent::PeerReject(error_code)) => Some((Fail(error_code), Idle)),
        _ => None,
    }
}

/// Central decision from the local preference and the peer's request
/// or response. Directions already on the selected PHY are left out.
fn central_ind(conn: &ConnCtx, supported: u8, peer_tx_phys: u8, peer_rx_phys: u8) -> PhyInd {
    let (pref_tx, pref_rx) = conn.phy_pref;
    PhyInd {
        instant: conn.event_counter.wrapping_add(INSTANT_OFFSET),
        phy_c_to_p: Phy::select(pref_tx & peer_rx_phys & supported)
            .filter(|phy| *phy != conn.tx_phy),
        phy_p_to_c: Phy::select(pref_rx & peer_tx_phys & supported)
            .filter(|phy| *phy != conn.rx_phy),
    }
}

impl<C: Context> LinkLayer<C> {
    pub(super) fn phy_upd_initiate(&mut self, handle: u16) {
        self.phy_upd_execute(handle, PhyUpdEvent::Start)
    }

    fn phy_upd_execute(&mut self, handle: u16, event: PhyUpdEvent) {
        let supported = self.config.supported_phys();
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        let Some((action, next)) = transition(conn.role, conn.phy_upd, event) else {
            trace!(handle, state = ?conn.phy_upd, ?event, "unhandled PHY update event");
            return;
        };
        conn.phy_upd = next;
        let (pref_tx, pref_rx) = conn.phy_pref;
        match action {
            PhyUpdAction::SendReq => {
                self.ctx.send_llcp_packet(
                    handle,
                    LlcpPdu::PhyReq { tx_phys: pref_tx & supported, rx_phys: pref_rx & supported },
                );
                self.start_llcp_rsp_timer(handle)
            }
            PhyUpdAction::SendRsp => {
                self.ctx.send_llcp_packet(
                    handle,
                    LlcpPdu::PhyRsp { tx_phys: pref_tx & supported, rx_phys: pref_rx & supported },
                );
                self.start_llcp_rsp_timer(handle)
            }
            PhyUpdAction::SendInd(ind) => {
                debug!(handle, ?ind, "sending PHY update indication");
                self.ctx.send_llcp_packet(handle, ind.to_pdu());
                if next == PhyUpdState::Idle {
                    self.phy_upd_done(handle, ErrorCode::Success)
                }
            }
            PhyUpdAction::RejectCollision => {
                self.reject_ext(handle, Opcode::PhyReq, ErrorCode::LlProcedureCollision)
            }
            PhyUpdAction::Arm => {
                debug!(handle, state = ?next, "PHY update armed");
                self.ctx.stop_timer(TimerId::LlcpRsp(handle))
            }
            PhyUpdAction::Apply(ind) => {
                let (tx, rx) = match conn.role {
                    Role::Central => (ind.phy_c_to_p, ind.phy_p_to_c),
                    Role::Peripheral => (ind.phy_p_to_c, ind.phy_c_to_p),
                };
                conn.tx_phy = tx.unwrap_or(conn.tx_phy);
                conn.rx_phy = rx.unwrap_or(conn.rx_phy);
                debug!(handle, tx_phy = ?conn.tx_phy, rx_phy = ?conn.rx_phy, "PHY updated");
                self.phy_upd_done(handle, ErrorCode::Success)
            }
            PhyUpdAction::Complete => self.phy_upd_done(handle, ErrorCode::Success),
            PhyUpdAction::Fail(error_code) => {
                warn!(handle, ?error_code, "PHY update rejected");
                self.phy_upd_done(handle, error_code)
            }
        }
    }

    fn phy_upd_done(&mut self, handle: u16, status: ErrorCode) {
        let Some(conn) = self.pools.find_conn(handle) else {
            return;
        };
        self.ctx.send_host_event(HostEvent::PhyUpdateComplete {
            status,
            handle,
            tx_phy: conn.tx_phy as u8,
            rx_phy: conn.rx_phy as u8,
        });
        self.llcp_complete(handle, LlcpProc::PhyUpd)
    }

    pub(super) fn phy_upd_rx(&mut self, handle: u16, pdu: LlcpPdu) {
        let supported = self.config.supported_phys();
        let opcode = pdu.opcode();
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        let event = match pdu {
            LlcpPdu::PhyReq { tx_phys, rx_phys } => {
                PhyUpdEvent::PeerReq(central_ind(conn, supported, tx_phys, rx_phys))
            }
            LlcpPdu::PhyRsp { tx_phys, rx_phys } => {
                PhyUpdEvent::PeerRsp(central_ind(conn, supported, tx_phys, rx_phys))
            }
            LlcpPdu::PhyUpdateInd { phy_c_to_p, phy_p_to_c, instant } => {
                let ind = PhyInd {
                    instant,
                    phy_c_to_p: Phy::from_mask(phy_c_to_p),
                    phy_p_to_c: Phy::from_mask(phy_p_to_c),
                };
                if ind.changes() && instant_passed(instant, conn.event_counter) {
                    warn!(handle, instant, event_counter = conn.event_counter, "instant passed");
                    return self.terminate_conn(
                        handle,
                        ErrorCode::InstantPassed,
                        ErrorCode::InstantPassed,
                    );
                }
                PhyUpdEvent::PeerInd(ind)
            }
            _ => return,
        };

        // A response or an indication answers the local request.
        if !conn.llcp.is_active(LlcpProc::PhyUpd) {
            if opcode == Opcode::PhyRsp {
                trace!(handle, "unexpected LL_PHY_RSP");
                return;
            }
            match conn.llcp.start_peer(LlcpProc::PhyUpd) {
                PeerStartOutcome::Started => (),
                PeerStartOutcome::Overrode(pended) => {
                    debug!(handle, ?pended, "procedure pended by the peer PHY update")
                }
                PeerStartOutcome::Collision(error_code) => {
                    return self.reject_ext(handle, opcode, error_code)
                }
            }
        }
        self.phy_upd_execute(handle, event)
    }

    pub(super) fn phy_upd_rx_reject(&mut self, handle: u16, error_code: ErrorCode) {
        self.phy_upd_execute(handle, PhyUpdEvent::PeerReject(error_code))
    }

    /// Called once the connection event counter has advanced.
    pub(super) fn phy_upd_event(&mut self, handle: u16) {
        let Some(conn) = self.pools.find_conn(handle) else {
            return;
        };
        if let PhyUpdState::Instant(ind) = conn.phy_upd {
            if ind.instant == conn.event_counter {
                let counter = conn.event_counter;
                self.phy_upd_execute(handle, PhyUpdEvent::EventCounter(counter))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::llcp::test::context::TestContext;
    use crate::llcp::test::{connected, ingest, ACL};
    use crate::llcp::{OpEvent, OpId};

    fn run_events(ll: &mut LinkLayer<TestContext>, count: usize) {
        for _ in 0..count {
            ll.op_event(OpId::acl(ACL), OpEvent::End(0));
        }
    }

    #[test]
    fn test_collision_transitions() {
        let ind = PhyInd { instant: 6, phy_c_to_p: Some(Phy::Le2m), phy_p_to_c: None };
        assert_eq!(
            transition(Role::Central, PhyUpdState::WaitRsp, PhyUpdEvent::PeerReq(ind)),
            Some((PhyUpdAction::RejectCollision, PhyUpdState::WaitRsp))
        );
        assert_eq!(
            transition(Role::Peripheral, PhyUpdState::WaitRsp, PhyUpdEvent::PeerReq(ind)),
            Some((PhyUpdAction::SendRsp, PhyUpdState::WaitInd))
        );
        assert_eq!(
            transition(Role::Peripheral, PhyUpdState::WaitInd, PhyUpdEvent::PeerReject(
                ErrorCode::UnspecifiedError
            )),
            None
        );
    }

    #[test]
    fn test_central_phy_update() {
        let mut ll = connected(Role::Central);
        ll.set_phy(ACL, 0x2, 0x2).unwrap();
        assert_eq!(ll.ctx().llcp_packets(), vec![(ACL, LlcpPdu::PhyReq { tx_phys: 2, rx_phys: 2 })]);

        ingest(&mut ll, LlcpPdu::PhyRsp { tx_phys: 0x3, rx_phys: 0x3 });
        assert_eq!(
            ll.ctx().llcp_packets()[1],
            (ACL, LlcpPdu::PhyUpdateInd { phy_c_to_p: 2, phy_p_to_c: 2, instant: 6 })
        );

        run_events(&mut ll, 6);
        let conn = ll.pools().find_conn(ACL).unwrap();
        assert_eq!((conn.tx_phy, conn.rx_phy), (Phy::Le2m, Phy::Le2m));
        assert_eq!(conn.llcp.active(), None);
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::PhyUpdateComplete {
                status: ErrorCode::Success,
                handle: ACL,
                tx_phy: 2,
                rx_phy: 2,
            }]
        );
    }

    #[test]
    fn test_central_rejects_collision() {
        let mut ll = connected(Role::Central);
        ll.set_phy(ACL, 0x2, 0x2).unwrap();
        ingest(&mut ll, LlcpPdu::PhyReq { tx_phys: 0x1, rx_phys: 0x1 });
        assert_eq!(
            ll.ctx().llcp_packets()[1],
            (
                ACL,
                LlcpPdu::RejectExtInd {
                    reject_opcode: Opcode::PhyReq as u8,
                    error_code: ErrorCode::LlProcedureCollision as u8,
                }
            )
        );
        assert_eq!(ll.pools().find_conn(ACL).unwrap().phy_upd, PhyUpdState::WaitRsp);
    }

    #[test]
    fn test_peripheral_yields_on_collision() {
        let mut ll = connected(Role::Peripheral);
        ll.set_phy(ACL, 0x4, 0x4).unwrap();
        ingest(&mut ll, LlcpPdu::PhyReq { tx_phys: 0x2, rx_phys: 0x2 });
        assert_eq!(ll.ctx().llcp_packets()[1], (ACL, LlcpPdu::PhyRsp { tx_phys: 4, rx_phys: 4 }));
        assert_eq!(ll.pools().find_conn(ACL).unwrap().phy_upd, PhyUpdState::WaitInd);

        ingest(&mut ll, LlcpPdu::PhyUpdateInd { phy_c_to_p: 0x2, phy_p_to_c: 0x4, instant: 3 });
        run_events(&mut ll, 3);
        let conn = ll.pools().find_conn(ACL).unwrap();
        assert_eq!(conn.tx_phy, Phy::LeCoded);
        assert_eq!(conn.rx_phy, Phy::Le2m);
        assert_eq!(conn.llcp.active(), None);
    }

    #[test]
    fn test_no_change() {
        let mut ll = connected(Role::Central);
        ingest(&mut ll, LlcpPdu::PhyReq { tx_phys: 0x1, rx_phys: 0x1 });
        assert_eq!(
            ll.ctx().llcp_packets(),
            vec![(ACL, LlcpPdu::PhyUpdateInd { phy_c_to_p: 0, phy_p_to_c: 0, instant: 0 })]
        );
        assert_eq!(ll.pools().find_conn(ACL).unwrap().llcp.active(), None);
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::PhyUpdateComplete {
                status: ErrorCode::Success,
                handle: ACL,
                tx_phy: 1,
                rx_phy: 1,
            }]
        );
    }

    #[test]
    fn test_unsupported_phy() {
        let mut ll = connected(Role::Central);
        assert!(ll.set_phy(ACL, 0x8, 0x1).is_err());
        assert!(ll.set_phy(ACL, 0, 0x1).is_err());
    }
}
