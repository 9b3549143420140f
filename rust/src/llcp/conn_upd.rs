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

//! Connection update and channel map update. Both are started by the
//! central with an indication carrying an instant, and take effect
//! on the connection event whose counter equals the instant.

use tracing::{debug, trace, warn};

use crate::llcp::chan::ChannelMap;
use crate::llcp::procedure::{LlcpProc, PeerStartOutcome};
use crate::llcp::{Context, LinkLayer};
use crate::packets::hci::{ErrorCode, HostEvent, Role};
use crate::packets::llcp::{ConnectionUpdateInd, LlcpPdu};

/// Connection events between an indication and its instant.
pub const INSTANT_OFFSET: u16 = 6;

/// An instant is in the past when it is not ahead of the current
/// event counter, modulo 65536.
pub fn instant_passed(instant: u16, event_counter: u16) -> bool {
    let ahead = instant.wrapping_sub(event_counter);
    ahead == 0 || ahead >= 0x8000
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnUpdParams {
    /// Connection interval in 1.25ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10ms units.
    pub supervision_timeout: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingUpdate {
    Params(ConnUpdParams),
    ChanMap(ChannelMap),
}

impl PendingUpdate {
    fn proc(&self) -> LlcpProc {
        match self {
            PendingUpdate::Params(_) => LlcpProc::ConnUpd,
            PendingUpdate::ChanMap(_) => LlcpProc::ChanMapUpd,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnUpdState {
    #[default]
    Idle,
    /// Waiting for the instant.
    Instant { instant: u16, update: PendingUpdate },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnUpdEvent {
    Start { update: PendingUpdate, instant: u16 },
    PeerInd { update: PendingUpdate, instant: u16 },
    EventCounter(u16),
    PeerReject(ErrorCode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnUpdAction {
    SendInd { update: PendingUpdate, instant: u16 },
    Arm,
    Apply(PendingUpdate),
    Fail(PendingUpdate, ErrorCode),
}

fn transition(state: ConnUpdState, event: ConnUpdEvent) -> Option<(ConnUpdAction, ConnUpdState)> {
    use ConnUpdAction::*;
    use ConnUpdState::*;

    match (state, event) {
        (Idle, ConnUpdEvent::Start { update, instant }) => {
            Some((SendInd { update, instant }, Instant { instant, update }))
        }
        (Idle, ConnUpdEvent::PeerInd { update, instant }) => Some((Arm, Instant { instant, update })),
        (Instant { instant, update }, ConnUpdEvent::EventCounter(counter)) if counter == instant => {
            Some((Apply(update), Idle))
        }
        (Instant { update, .. }, ConnUpdEvent::PeerReject(error_code)) => {
            Some((Fail(update, error_code), Idle))
        }
        _ => None,
    }
}

impl<C: Context> LinkLayer<C> {
    /// Central: send the queued host request.
    pub(super) fn conn_upd_initiate(&mut self, handle: u16, proc: LlcpProc) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        let update = match proc {
            LlcpProc::ConnUpd => conn.conn_upd_req.take().map(PendingUpdate::Params),
            LlcpProc::ChanMapUpd => conn.chan_map_req.take().map(PendingUpdate::ChanMap),
            _ => None,
        };
        let Some(update) = update else {
            trace!(handle, ?proc, "no pending update request");
            return self.llcp_complete(handle, proc);
        };
        let instant = conn.event_counter.wrapping_add(INSTANT_OFFSET);
        self.conn_upd_execute(handle, ConnUpdEvent::Start { update, instant })
    }

    fn conn_upd_execute(&mut self, handle: u16, event: ConnUpdEvent) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        let Some((action, next)) = transition(conn.conn_upd, event) else {
            trace!(handle, state = ?conn.conn_upd, ?event, "unhandled connection update event");
            return;
        };
        conn.conn_upd = next;
        match action {
            ConnUpdAction::SendInd { update, instant } => {
                let pdu = match update {
                    PendingUpdate::Params(params) => {
                        LlcpPdu::ConnectionUpdateInd(ConnectionUpdateInd {
                            win_size: 1,
                            win_offset: 0,
                            interval: params.interval,
                            latency: params.latency,
                            timeout: params.supervision_timeout,
                            instant,
                        })
                    }
                    PendingUpdate::ChanMap(map) => {
                        LlcpPdu::ChannelMapInd { channel_map: map.bits(), instant }
                    }
                };
                debug!(handle, ?update, instant, "sending update indication");
                self.ctx.send_llcp_packet(handle, pdu)
            }
            ConnUpdAction::Arm => debug!(handle, state = ?next, "update armed"),
            ConnUpdAction::Apply(update) => {
                self.conn_upd_apply(handle, update);
                self.llcp_complete(handle, update.proc())
            }
            ConnUpdAction::Fail(update, error_code) => {
                warn!(handle, ?update, ?error_code, "update rejected by the peer");
                if let (PendingUpdate::Params(_), Some(conn)) = (update, self.pools.find_conn(handle)) {
                    self.ctx.send_host_event(HostEvent::ConnectionUpdateComplete {
                        status: error_code,
                        handle,
                        interval: conn.interval,
                        latency: conn.latency,
                        supervision_timeout: conn.supervision_timeout,
                    })
                }
                self.llcp_complete(handle, update.proc())
            }
        }
    }

    fn conn_upd_apply(&mut self, handle: u16, update: PendingUpdate) {
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        match update {
            PendingUpdate::Params(params) => {
                conn.interval = params.interval;
                conn.latency = params.latency;
                conn.supervision_timeout = params.supervision_timeout;
                debug!(handle, ?params, "connection parameters updated");
                self.ctx.send_host_event(HostEvent::ConnectionUpdateComplete {
                    status: ErrorCode::Success,
                    handle,
                    interval: params.interval,
                    latency: params.latency,
                    supervision_timeout: params.supervision_timeout,
                })
            }
            PendingUpdate::ChanMap(map) => {
                conn.chan.map = map;
                debug!(handle, channel_map = map.bits(), "channel map updated");
                for (_, cis) in self
                    .pools
                    .cis
                    .iter_mut()
                    .filter(|(_, cis)| cis.acl_connection_handle == Some(handle))
                {
                    cis.chan.update(map)
                }
            }
        }
    }

    /// Peripheral: LL_CONNECTION_UPDATE_IND or LL_CHANNEL_MAP_IND.
    pub(super) fn conn_upd_rx(&mut self, handle: u16, pdu: LlcpPdu) {
        let opcode = pdu.opcode();
        let (update, instant) = match pdu {
            LlcpPdu::ConnectionUpdateInd(ind) => (
                PendingUpdate::Params(ConnUpdParams {
                    interval: ind.interval,
                    latency: ind.latency,
                    supervision_timeout: ind.timeout,
                }),
                ind.instant,
            ),
            LlcpPdu::ChannelMapInd { channel_map, instant } => {
                (PendingUpdate::ChanMap(ChannelMap::new(channel_map)), instant)
            }
            _ => return,
        };
        let Some(conn) = self.pools.find_conn_mut(handle) else {
            return;
        };
        if conn.role == Role::Central {
            debug!(handle, ?opcode, "update indication received by the central");
            return self.reject_ext(handle, opcode, ErrorCode::InvalidLlParameters);
        }
        if let PendingUpdate::ChanMap(map) = update {
            if !map.is_valid() {
                return self.reject_ext(handle, opcode, ErrorCode::InvalidLlParameters);
            }
        }
        if instant_passed(instant, conn.event_counter) {
            warn!(handle, instant, event_counter = conn.event_counter, "instant passed");
            return self.terminate_conn(handle, ErrorCode::InstantPassed, ErrorCode::InstantPassed);
        }
        match conn.llcp.start_peer(update.proc()) {
            PeerStartOutcome::Started => (),
            PeerStartOutcome::Overrode(pended) => {
                debug!(handle, ?pended, "procedure pended by the peer update")
            }
            PeerStartOutcome::Collision(error_code) => {
                return self.reject_ext(handle, opcode, error_code)
            }
        }
        self.conn_upd_execute(handle, ConnUpdEvent::PeerInd { update, instant })
    }

    pub(super) fn conn_upd_rx_reject(&mut self, handle: u16, error_code: ErrorCode) {
        self.conn_upd_execute(handle, ConnUpdEvent::PeerReject(error_code))
    }

    /// Called once the connection event counter has advanced.
    pub(super) fn conn_upd_event(&mut self, handle: u16) {
        let Some(conn) = self.pools.find_conn(handle) else {
            return;
        };
        if let ConnUpdState::Instant { instant, .. } = conn.conn_upd {
            if instant == conn.event_counter {
                let counter = conn.event_counter;
                self.conn_upd_execute(handle, ConnUpdEvent::EventCounter(counter))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::llcp::test::{connected, ingest, ACL};
    use crate::llcp::{OpEvent, OpId};
    use crate::packets::llcp::Opcode;

    fn run_events(ll: &mut LinkLayer<crate::llcp::test::context::TestContext>, count: usize) {
        for _ in 0..count {
            ll.op_event(OpId::acl(ACL), OpEvent::End(0));
        }
    }

    #[test]
    fn test_instant_passed() {
        assert!(!instant_passed(10, 4));
        assert!(instant_passed(10, 10));
        assert!(instant_passed(10, 11));
        assert!(!instant_passed(2, 0xfffe));
        assert!(instant_passed(0xfffe, 2));
    }

    #[test]
    fn test_transitions() {
        use ConnUpdAction::*;
        use ConnUpdState::*;

        let update = PendingUpdate::ChanMap(ChannelMap::ALL);
        let armed = Instant { instant: 7, update };
        assert_eq!(
            transition(Idle, ConnUpdEvent::PeerInd { update, instant: 7 }),
            Some((Arm, armed))
        );
        assert_eq!(transition(armed, ConnUpdEvent::EventCounter(6)), None);
        assert_eq!(transition(armed, ConnUpdEvent::EventCounter(7)), Some((Apply(update), Idle)));
        assert_eq!(transition(Idle, ConnUpdEvent::EventCounter(7)), None);
    }

    #[test]
    fn test_central_connection_update() {
        let mut ll = connected(Role::Central);
        let params = ConnUpdParams { interval: 80, latency: 1, supervision_timeout: 200 };
        ll.connection_update(ACL, params).unwrap();
        assert_eq!(
            ll.ctx().llcp_packets(),
            vec![(
                ACL,
                LlcpPdu::ConnectionUpdateInd(ConnectionUpdateInd {
                    win_size: 1,
                    win_offset: 0,
                    interval: 80,
                    latency: 1,
                    timeout: 200,
                    instant: 6,
                })
            )]
        );

        run_events(&mut ll, 5);
        assert_eq!(ll.pools().find_conn(ACL).unwrap().interval, 40);
        assert!(ll.ctx().host_events().is_empty());

        run_events(&mut ll, 1);
        let conn = ll.pools().find_conn(ACL).unwrap();
        assert_eq!((conn.interval, conn.latency, conn.supervision_timeout), (80, 1, 200));
        assert_eq!(conn.llcp.active(), None);
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::ConnectionUpdateComplete {
                status: ErrorCode::Success,
                handle: ACL,
                interval: 80,
                latency: 1,
                supervision_timeout: 200,
            }]
        );
    }

    #[test]
    fn test_peripheral_cannot_initiate() {
        let mut ll = connected(Role::Peripheral);
        let params = ConnUpdParams { interval: 80, latency: 0, supervision_timeout: 200 };
        assert!(ll.connection_update(ACL, params).is_err());
        assert!(ll.channel_map_update(ACL, 0x3).is_err());
    }

    #[test]
    fn test_peripheral_channel_map() {
        let mut ll = connected(Role::Peripheral);
        ingest(&mut ll, LlcpPdu::ChannelMapInd { channel_map: 0x1_0000_00ff, instant: 2 });
        assert!(ll.pools().find_conn(ACL).unwrap().llcp.is_active(LlcpProc::ChanMapUpd));

        run_events(&mut ll, 2);
        let conn = ll.pools().find_conn(ACL).unwrap();
        assert_eq!(conn.chan.map, ChannelMap::new(0x1_0000_00ff));
        assert_eq!(conn.llcp.active(), None);
        assert!(ll.ctx().llcp_packets().is_empty());
    }

    #[test]
    fn test_invalid_channel_map() {
        let mut ll = connected(Role::Peripheral);
        ingest(&mut ll, LlcpPdu::ChannelMapInd { channel_map: 0x1, instant: 2 });
        assert_eq!(
            ll.ctx().llcp_packets(),
            vec![(
                ACL,
                LlcpPdu::RejectExtInd {
                    reject_opcode: Opcode::ChannelMapInd as u8,
                    error_code: ErrorCode::InvalidLlParameters as u8,
                }
            )]
        );
    }

    #[test]
    fn test_instant_passed_terminates() {
        let mut ll = connected(Role::Peripheral);
        ll.pools.find_conn_mut(ACL).unwrap().event_counter = 20;
        ingest(
            &mut ll,
            LlcpPdu::ConnectionUpdateInd(ConnectionUpdateInd {
                win_size: 1,
                win_offset: 0,
                interval: 80,
                latency: 0,
                timeout: 200,
                instant: 10,
            }),
        );
        assert_eq!(
            ll.ctx().llcp_packets(),
            vec![(ACL, LlcpPdu::TerminateInd { error_code: ErrorCode::InstantPassed as u8 })]
        );

        run_events(&mut ll, 1);
        assert!(ll.pools().find_conn(ACL).is_none());
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::DisconnectionComplete {
                status: ErrorCode::Success,
                handle: ACL,
                reason: ErrorCode::InstantPassed,
            }]
        );
    }

    #[test]
    fn test_update_collides_with_phy_update() {
        let mut ll = connected(Role::Peripheral);
        ll.set_phy(ACL, 0x2, 0x2).unwrap();
        ll.ctx().clear();
        ingest(&mut ll, LlcpPdu::ChannelMapInd { channel_map: 0xff, instant: 6 });
        assert_eq!(
            ll.ctx().llcp_packets(),
            vec![(
                ACL,
                LlcpPdu::RejectExtInd {
                    reject_opcode: Opcode::ChannelMapInd as u8,
                    error_code: ErrorCode::DifferentTransactionCollision as u8,
                }
            )]
        );
        assert!(ll.pools().find_conn(ACL).unwrap().llcp.is_active(LlcpProc::PhyUpd));
    }
}
