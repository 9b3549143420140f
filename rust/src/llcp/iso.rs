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

//! Host configuration of central CIGs, Create CIS, ISO data paths and
//! outbound ISO SDUs.

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::config::LeFeature;
use crate::llcp::cis_est::CisEstState;
use crate::llcp::ctx::{CigCtx, CisCtx, IsoDataPath, Packing};
use crate::llcp::list::FtParam;
use crate::llcp::manager::{DispatchId, Event, LinkLayerError};
use crate::llcp::timing::{microseconds, Phy, INTERVAL_UNIT_USEC};
use crate::llcp::{Context, LinkLayer};
use crate::packets::hci::Role;
use crate::packets::llcp::CisReq;

#[allow(non_camel_case_types)]
type slots = u16;

/// Largest payload of a CIS PDU.
const MAX_CIS_PDU: u16 = 251;

/// Host configuration of one CIS of a central CIG.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CisConfig {
    pub cis_id: u8,
    pub max_sdu_c_to_p: u16,
    pub max_sdu_p_to_c: u16,
    /// Bitmask of the PHYs allowed from the central to the peripheral.
    pub phy_c_to_p: u8,
    /// Bitmask of the PHYs allowed from the peripheral to the central.
    pub phy_p_to_c: u8,
}

/// Host configuration of a central CIG.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CigConfig {
    pub cig_id: u8,
    pub sdu_interval_c_to_p: microseconds,
    pub sdu_interval_p_to_c: microseconds,
    pub framed: bool,
    pub packing: Packing,
    /// Milliseconds.
    pub max_transport_latency_c_to_p: u16,
    /// Milliseconds.
    pub max_transport_latency_p_to_c: u16,
    pub cis: Vec<CisConfig>,
}

/// Direction of an ISO data path, seen from the host: input paths
/// carry SDUs from the host to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataPathDirection {
    Input,
    Output,
}

/// Stream parameters of a central CIS, in LL_CIS_REQ form. The offsets
/// and the instant are filled when the request is sent.
fn cis_params(cig: &CigCtx, cis: &CisConfig) -> CisReq {
    let bn = |max_sdu: u16| {
        u8::try_from((max_sdu + MAX_CIS_PDU - 1) / MAX_CIS_PDU).unwrap_or(u8::MAX)
    };
    let bn_c_to_p = bn(cis.max_sdu_c_to_p);
    let bn_p_to_c = bn(cis.max_sdu_p_to_c);
    let nse = bn_c_to_p.max(bn_p_to_c).max(1);
    let phy = |mask: u8| Phy::select(mask).unwrap_or_default().mask();

    CisReq {
        cig_id: cig.cig_id,
        cis_id: cis.cis_id,
        phy_c_to_p: phy(cis.phy_c_to_p),
        phy_p_to_c: phy(cis.phy_p_to_c),
        framed: cig.framed,
        max_sdu_c_to_p: cis.max_sdu_c_to_p,
        max_sdu_p_to_c: cis.max_sdu_p_to_c,
        sdu_interval_c_to_p: cig.sdu_interval_c_to_p,
        sdu_interval_p_to_c: cig.sdu_interval_p_to_c,
        max_pdu_c_to_p: MAX_CIS_PDU,
        max_pdu_p_to_c: MAX_CIS_PDU,
        nse,
        sub_interval: cig.iso_interval_usec() / nse as microseconds,
        bn_c_to_p,
        bn_p_to_c,
        ft_c_to_p: cig.ft_c_to_p,
        ft_p_to_c: cig.ft_p_to_c,
        iso_interval: cig.iso_interval,
        cis_offset_min: 0,
        cis_offset_max: 0,
        conn_event_count: 0,
    }
}

/// Apply a new stream configuration to a central CIS.
fn configure_cis(cig: &CigCtx, cis: &mut CisCtx, config: &CisConfig) {
    cis.params = cis_params(cig, config);
    cis.phy_c_to_p = Phy::from_mask(cis.params.phy_c_to_p).unwrap_or_default();
    cis.phy_p_to_c = Phy::from_mask(cis.params.phy_p_to_c).unwrap_or_default();
    cis.cig_sync_delay_usec = cig.cig_sync_delay_usec;
    cis.cis_sync_delay_usec = cig.iso_interval_usec();
}

impl CisCtx {
    /// Air direction of a host data path: c_to_p is the transmit
    /// direction of the central.
    fn data_path_mut(&mut self, direction: DataPathDirection) -> &mut Option<IsoDataPath> {
        match (self.role, direction) {
            (Role::Central, DataPathDirection::Input)
            | (Role::Peripheral, DataPathDirection::Output) => &mut self.iso_data_path_c_to_p,
            (Role::Central, DataPathDirection::Output)
            | (Role::Peripheral, DataPathDirection::Input) => &mut self.iso_data_path_p_to_c,
        }
    }

    fn has_input_path(&self) -> bool {
        match self.role {
            Role::Central => self.iso_data_path_c_to_p.is_some(),
            Role::Peripheral => self.iso_data_path_p_to_c.is_some(),
        }
    }
}

impl<C: Context> LinkLayer<C> {
    /// Create or modify a central CIG. Returns the CIS connection
    /// handles of the configured CISes, in the order of the request.
    /// On error the CIG and its CISes are left untouched.
    pub fn set_cig_parameters(&mut self, config: &CigConfig) -> Result<Vec<u16>, LinkLayerError> {
        let cig_id = config.cig_id;
        let existing = self.pools.find_cig_by_id(cig_id).and_then(|index| self.pools.cig(index));
        if let Some(cig) = existing {
            if cig.role != Role::Central {
                return Err(LinkLayerError::CommandDisallowed("CIG is used as peripheral"));
            }
            if !cig.configurable {
                return Err(LinkLayerError::CommandDisallowed("CIG is not configurable"));
            }
        }
        if config.cis.is_empty() {
            return Err(LinkLayerError::InvalidParameters("empty CIS configuration"));
        }

        let supported_phys = self.config.supported_phys();
        for (index, cis) in config.cis.iter().enumerate() {
            if config.cis[..index].iter().any(|other| other.cis_id == cis.cis_id) {
                return Err(LinkLayerError::InvalidParameters("duplicate CIS identifier"));
            }
            if cis.phy_c_to_p == 0 || cis.phy_p_to_c == 0 {
                return Err(LinkLayerError::Unsupported("CIS without PHY"));
            }
            if (cis.phy_c_to_p | cis.phy_p_to_c) & !supported_phys != 0 {
                return Err(LinkLayerError::Unsupported("CIS PHY"));
            }
            let current = self
                .pools
                .find_cis_by_id(cig_id, cis.cis_id)
                .and_then(|handle| self.pools.find_cis_by_handle(handle));
            if let Some(current) = current {
                if (cis.max_sdu_c_to_p == 0 && current.iso_data_path_c_to_p.is_some())
                    || (cis.max_sdu_p_to_c == 0 && current.iso_data_path_p_to_c.is_some())
                {
                    return Err(LinkLayerError::CommandDisallowed("data path without SDUs"));
                }
            }
            if cis.max_sdu_c_to_p > 0xfff || cis.max_sdu_p_to_c > 0xfff {
                return Err(LinkLayerError::InvalidParameters("max SDU"));
            }
        }

        // Directions configured by this request or by the CISes of the
        // CIG it leaves unchanged.
        let kept: Vec<&CisCtx> = self
            .pools
            .cis
            .iter()
            .map(|(_, cis)| cis)
            .filter(|cis| cis.cig_id == cig_id && cis.role == Role::Central)
            .filter(|cis| config.cis.iter().all(|new| new.cis_id != cis.cis_id))
            .collect();
        let configures_c_to_p = config.cis.iter().any(|cis| cis.max_sdu_c_to_p != 0)
            || kept.iter().any(|cis| cis.params.max_sdu_c_to_p != 0);
        let configures_p_to_c = config.cis.iter().any(|cis| cis.max_sdu_p_to_c != 0)
            || kept.iter().any(|cis| cis.params.max_sdu_p_to_c != 0);
        if (configures_c_to_p && !(0xff..=0xf_ffff).contains(&config.sdu_interval_c_to_p))
            || (configures_p_to_c && !(0xff..=0xf_ffff).contains(&config.sdu_interval_p_to_c))
        {
            return Err(LinkLayerError::InvalidParameters("SDU interval"));
        }
        if (configures_c_to_p && !(0x5..=0xfa0).contains(&config.max_transport_latency_c_to_p))
            || (configures_p_to_c
                && !(0x5..=0xfa0).contains(&config.max_transport_latency_p_to_c))
        {
            return Err(LinkLayerError::InvalidParameters("max transport latency"));
        }

        let Some(iso_interval) = iso_interval(
            config.sdu_interval_c_to_p,
            config.sdu_interval_p_to_c,
            config.framed,
            config.max_transport_latency_c_to_p as microseconds * 1000,
            config.max_transport_latency_p_to_c as microseconds * 1000,
        ) else {
            return Err(LinkLayerError::Unsupported("no ISO interval fits the CIG parameters"));
        };

        let new_cis = config
            .cis
            .iter()
            .filter(|cis| self.pools.find_cis_by_id(cig_id, cis.cis_id).is_none())
            .count();
        if new_cis > self.pools.num_avail_cis()
            || (existing.is_none() && self.pools.num_avail_cig() == 0)
        {
            return Err(LinkLayerError::LimitedResources);
        }

        let cig_handle = match self.pools.find_cig_by_id(cig_id) {
            Some(cig_handle) => cig_handle,
            None => self
                .pools
                .alloc_cig(&self.ctx, cig_id, Role::Central)
                .ok_or(LinkLayerError::LimitedResources)?,
        };
        let Some(cig) = self.pools.cig_mut(cig_handle) else {
            return Err(LinkLayerError::LimitedResources);
        };
        cig.iso_interval = iso_interval;
        cig.sdu_interval_c_to_p = config.sdu_interval_c_to_p;
        cig.sdu_interval_p_to_c = config.sdu_interval_p_to_c;
        cig.framed = config.framed;
        cig.packing = config.packing;
        cig.ft_c_to_p = 1;
        cig.ft_p_to_c = 1;
        cig.cig_sync_delay_usec = cig.iso_interval_usec();

        let mut handles = vec![];
        for cis_config in &config.cis {
            let handle = match self.pools.find_cis_by_id(cig_id, cis_config.cis_id) {
                Some(handle) => handle,
                None => self
                    .pools
                    .alloc_cis(cig_handle, cis_config.cis_id, Role::Central)
                    .ok_or(LinkLayerError::LimitedResources)?,
            };
            handles.push(handle);
        }

        // Every CIS of the CIG follows the new group timing.
        let configs: Vec<(u16, CisConfig)> = self
            .pools
            .cis_handles(|cis| cis.cig_id == cig_id)
            .into_iter()
            .filter_map(|handle| {
                let cis = self.pools.find_cis_by_handle(handle)?;
                let config = config
                    .cis
                    .iter()
                    .find(|config| config.cis_id == cis.cis_id)
                    .copied()
                    .unwrap_or(CisConfig {
                        cis_id: cis.cis_id,
                        max_sdu_c_to_p: cis.params.max_sdu_c_to_p,
                        max_sdu_p_to_c: cis.params.max_sdu_p_to_c,
                        phy_c_to_p: cis.params.phy_c_to_p,
                        phy_p_to_c: cis.params.phy_p_to_c,
                    });
                Some((handle, config))
            })
            .collect();
        for (handle, cis_config) in configs {
            let Some((cig, cis)) = self.pools.cig_cis_mut(cig_handle, handle) else {
                continue;
            };
            configure_cis(cig, cis, &cis_config);
        }

        info!(cig_id, iso_interval, cis_count = handles.len(), "CIG configured");
        Ok(handles)
    }

    /// Remove a central CIG and the configuration of its CISes.
    pub fn remove_cig(&mut self, cig_id: u8) -> Result<(), LinkLayerError> {
        let cig_handle = self
            .pools
            .find_cig_by_id(cig_id)
            .filter(|cig_handle| {
                self.pools.cig(*cig_handle).is_some_and(|cig| cig.role == Role::Central)
            })
            .ok_or(LinkLayerError::UnknownConnection(cig_id as u16))?;
        let handles = self.pools.cis_handles(|cis| cis.cig_id == cig_id);
        if handles
            .iter()
            .filter_map(|handle| self.pools.find_cis_by_handle(*handle))
            .any(|cis| !cis.is_idle() || cis.acl_connection_handle.is_some())
        {
            return Err(LinkLayerError::CommandDisallowed("CIG is active"));
        }
        for handle in handles {
            self.pools.free_cis_ctx(&self.ctx, handle);
        }
        self.pools.free_cig_ctx(&self.ctx, cig_handle);
        info!(cig_id, "CIG removed");
        Ok(())
    }

    /// Create the CISes `(cis_connection_handle, acl_connection_handle)`.
    /// The establishments run one at a time on each ACL.
    pub fn create_cis(&mut self, requests: &[(u16, u16)]) -> Result<(), LinkLayerError> {
        for (index, &(cis_connection_handle, acl_connection_handle)) in requests.iter().enumerate()
        {
            let conn = self.conn(acl_connection_handle)?;
            if conn.role != Role::Central {
                return Err(LinkLayerError::InvalidParameters("CIS on a peripheral ACL"));
            }
            let cis = self
                .pools
                .find_cis_by_handle(cis_connection_handle)
                .filter(|cis| cis.role == Role::Central)
                .ok_or(LinkLayerError::UnknownConnection(cis_connection_handle))?;
            if !cis.is_idle() || cis.acl_connection_handle.is_some() {
                return Err(LinkLayerError::LinkAlreadyExists(cis_connection_handle));
            }
            if requests[..index].iter().any(|(other, _)| *other == cis_connection_handle) {
                return Err(LinkLayerError::InvalidParameters("CIS requested twice"));
            }
        }
        if self.pools.conns.iter().any(|(_, conn)| !conn.cis_create_queue.is_empty())
            || self.pools.cis.iter().any(|(_, cis)| cis.est_state == CisEstState::WaitCisRsp)
        {
            return Err(LinkLayerError::CommandDisallowed("Create CIS already pending"));
        }
        if !self.config.supports(LeFeature::ConnectedIsochronousStreamHostSupport) {
            return Err(LinkLayerError::CommandDisallowed("CIS host support is not set"));
        }

        for &(cis_connection_handle, acl_connection_handle) in requests {
            let Some(cis) = self.pools.find_cis_by_handle_mut(cis_connection_handle) else {
                continue;
            };
            cis.acl_connection_handle = Some(acl_connection_handle);
            let cig_id = cis.cig_id;
            if let Some(cig) = self.pools.cig_by_id_mut(cig_id) {
                cig.configurable = false;
            }
            if let Some(conn) = self.pools.find_conn_mut(acl_connection_handle) {
                conn.cis_create_queue.push_back(cis_connection_handle);
            }
            debug!(cis_connection_handle, acl_connection_handle, "CIS creation queued");
            self.post(acl_connection_handle, DispatchId::Conn, Event::HostCreateCis);
        }
        self.tick();
        Ok(())
    }

    pub fn setup_iso_data_path(
        &mut self,
        cis_connection_handle: u16,
        direction: DataPathDirection,
    ) -> Result<(), LinkLayerError> {
        let cis = self
            .pools
            .find_cis_by_handle_mut(cis_connection_handle)
            .ok_or(LinkLayerError::UnknownConnection(cis_connection_handle))?;
        if cis.role == Role::Peripheral
            && !cis.established
            && cis.est_state != CisEstState::WaitCisInd
        {
            return Err(LinkLayerError::CommandDisallowed("CIS request not accepted"));
        }
        let path = cis.data_path_mut(direction);
        if path.is_some() {
            return Err(LinkLayerError::CommandDisallowed("ISO data path already set up"));
        }
        *path = Some(IsoDataPath::Hci);
        debug!(cis_connection_handle, ?direction, "ISO data path set up");
        Ok(())
    }

    pub fn remove_iso_data_path(
        &mut self,
        cis_connection_handle: u16,
        directions: &[DataPathDirection],
    ) -> Result<(), LinkLayerError> {
        let cis = self
            .pools
            .find_cis_by_handle_mut(cis_connection_handle)
            .ok_or(LinkLayerError::UnknownConnection(cis_connection_handle))?;
        if directions.iter().any(|direction| cis.data_path_mut(*direction).is_none()) {
            return Err(LinkLayerError::CommandDisallowed("ISO data path is not set up"));
        }
        for direction in directions {
            *cis.data_path_mut(*direction) = None;
        }
        Ok(())
    }

    /// Queue an outbound SDU on an established CIS. The SDU consumes one
    /// buffer credit, returned with Number Of Completed Packets once
    /// its payloads are flushed.
    pub fn send_iso_sdu(
        &mut self,
        cis_connection_handle: u16,
        sdu: Bytes,
    ) -> Result<(), LinkLayerError> {
        let credits = self.pools.iso_credits;
        let cis = self
            .pools
            .find_cis_by_handle_mut(cis_connection_handle)
            .ok_or(LinkLayerError::UnknownConnection(cis_connection_handle))?;
        if !cis.established || !cis.has_input_path() {
            return Err(LinkLayerError::CommandDisallowed("no input data path"));
        }
        if sdu.len() > cis.max_sdu_tx() as usize {
            return Err(LinkLayerError::InvalidParameters("SDU longer than max SDU"));
        }
        if credits == 0 {
            return Err(LinkLayerError::CommandDisallowed("no ISO buffer credit"));
        }
        let ((bn, ft), _) = cis.tx_rx_bn_ft();
        if cis.tx_ft.insert_tail(FtParam::new(bn, ft, cis.params.nse)).is_err() {
            return Err(LinkLayerError::LimitedResources);
        }
        trace!(cis_connection_handle, len = sdu.len(), "ISO SDU queued");
        cis.sdu_queue.push_back(sdu);
        self.pools.iso_credits = credits - 1;
        Ok(())
    }
}

/// Compute the ISO_Interval, in 1.25ms units, for the SDU intervals and
/// maximum transport latencies, all in microseconds.
pub(crate) fn iso_interval(
    sdu_interval_c_to_p: microseconds,
    sdu_interval_p_to_c: microseconds,
    framed: bool,
    max_transport_latency_c_to_p: microseconds,
    max_transport_latency_p_to_c: microseconds,
) -> Option<slots> {
    if framed {
        let iso_interval = sdu_interval_c_to_p.max(sdu_interval_p_to_c);
        let iso_interval = iso_interval.div_ceil(INTERVAL_UNIT_USEC).max(4);
        return slots::try_from(iso_interval).ok();
    }
    // Unframed PDUs need an ISO interval that is a multiple of the SDU
    // interval.
    let sdu_interval = match (sdu_interval_c_to_p, sdu_interval_p_to_c) {
        (0, 0) => return None,
        (0, interval) | (interval, 0) => interval,
        (c_to_p, p_to_c) => num_integer::lcm(c_to_p, p_to_c),
    };
    let iso_interval = num_integer::lcm(INTERVAL_UNIT_USEC, sdu_interval);
    let min_transport_latency =
        |sdu_interval: microseconds| (2 * iso_interval).checked_sub(sdu_interval);
    let fits = |sdu_interval: microseconds, max_transport_latency: microseconds| {
        sdu_interval == 0
            || min_transport_latency(sdu_interval).is_some_and(|min| min <= max_transport_latency)
    };
    let interval_slots = slots::try_from(iso_interval / INTERVAL_UNIT_USEC).ok()?;
    ((4..=0xc80).contains(&interval_slots)
        && fits(sdu_interval_c_to_p, max_transport_latency_c_to_p)
        && fits(sdu_interval_p_to_c, max_transport_latency_p_to_c))
    .then_some(interval_slots)
}

/// Transport latency of one direction of a CIG. The sync delay and the
/// SDU interval are in microseconds, the ISO interval in 1.25ms units.
pub(crate) fn transport_latency(
    cig_sync_delay: microseconds,
    iso_interval: slots,
    ft: u8,
    sdu_interval: microseconds,
    framed: bool,
) -> microseconds {
    let iso_interval = iso_interval as microseconds * INTERVAL_UNIT_USEC;
    let latency = cig_sync_delay + ft as microseconds * iso_interval;
    if framed {
        latency + sdu_interval
    } else {
        latency.saturating_sub(sdu_interval)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CoreConfig;
    use crate::llcp::bod::{OpEvent, OpId};
    use crate::llcp::test::context::{Recorded, TestContext};
    use crate::llcp::test::{conn_params, connected, establish_peripheral_cis, ingest, ACL};
    use crate::llcp::{Protocol, TimerId};
    use crate::packets::hci::{ErrorCode, HostEvent};
    use crate::packets::llcp::{CisRsp, LlcpPdu, Opcode};

    const CIS: u16 = 0xe00;

    fn cis_config(cis_id: u8) -> CisConfig {
        CisConfig {
            cis_id,
            max_sdu_c_to_p: 40,
            max_sdu_p_to_c: 40,
            phy_c_to_p: 0x2,
            phy_p_to_c: 0x2,
        }
    }

    fn cig_config(cig_id: u8, cis: Vec<CisConfig>) -> CigConfig {
        CigConfig {
            cig_id,
            sdu_interval_c_to_p: 10_000,
            sdu_interval_p_to_c: 10_000,
            framed: false,
            packing: Packing::Sequential,
            max_transport_latency_c_to_p: 20,
            max_transport_latency_p_to_c: 20,
            cis,
        }
    }

    fn cis_rsp() -> CisRsp {
        CisRsp { cis_offset_min: 1_000, cis_offset_max: 5_000, conn_event_count: 6 }
    }

    #[test]
    fn test_iso_interval() {
        assert!(iso_interval(0x7530, 0x7530, false, 0x7530, 0x7530).is_some());
        assert!(iso_interval(0x7530, 0, false, 0x7530, 0x7530).is_some());
        assert!(iso_interval(0x7530, 0x7530, false, 0x7000, 0x7000).is_none());
        assert_eq!(iso_interval(10_000, 10_000, false, 20_000, 20_000), Some(8));
        assert_eq!(iso_interval(7_500, 10_000, false, 60_000, 60_000), Some(24));
        assert_eq!(iso_interval(0, 0, false, 20_000, 20_000), None);
        assert_eq!(iso_interval(10_001, 0, true, 0, 0), Some(9));
        assert_eq!(iso_interval(1_000, 0, true, 0, 0), Some(4));
    }

    #[test]
    fn test_transport_latency() {
        assert_eq!(transport_latency(3_000, 8, 1, 10_000, false), 3_000);
        assert_eq!(transport_latency(3_000, 8, 2, 10_000, true), 33_000);
        assert_eq!(transport_latency(0, 4, 1, 10_000, false), 0);
    }

    #[test]
    fn test_set_cig_parameters() {
        let mut ll = connected(Role::Central);
        let handles =
            ll.set_cig_parameters(&cig_config(1, vec![cis_config(0), cis_config(1)])).unwrap();
        assert_eq!(handles, vec![CIS, CIS + 1]);
        assert_eq!(ll.ctx().take(|r| *r == Recorded::BbStart(Protocol::Cis)), 1);

        let cig = ll.pools().cig(ll.pools().find_cig_by_id(1).unwrap()).unwrap();
        assert_eq!(cig.iso_interval, 8);
        assert!(cig.configurable);
        let cis = ll.pools().find_cis_by_handle(CIS).unwrap();
        assert_eq!(cis.role, Role::Central);
        assert_eq!(cis.phy_c_to_p, Phy::Le2m);
        assert_eq!((cis.params.nse, cis.params.bn_c_to_p, cis.params.ft_c_to_p), (1, 1, 1));
        assert_eq!(cis.params.sub_interval, 10_000);
        assert_eq!(cis.params.max_pdu_p_to_c, 251);

        // Reconfiguration keeps the handles and retimes every CIS.
        let mut config = cig_config(1, vec![cis_config(1)]);
        config.sdu_interval_c_to_p = 5_000;
        config.sdu_interval_p_to_c = 5_000;
        assert_eq!(ll.set_cig_parameters(&config), Ok(vec![CIS + 1]));
        assert_eq!(ll.pools().find_cis_by_handle(CIS).unwrap().params.iso_interval, 4);
        assert_eq!(ll.pools().find_cis_by_handle(CIS + 1).unwrap().params.sub_interval, 5_000);
        assert_eq!(ll.pools().num_enabled_cis(), 2);
    }

    #[test]
    fn test_set_cig_parameters_validation() {
        let mut ll = connected(Role::Central);

        let mut no_phy = cis_config(0);
        no_phy.phy_p_to_c = 0;
        assert_eq!(
            ll.set_cig_parameters(&cig_config(1, vec![no_phy])),
            Err(LinkLayerError::Unsupported("CIS without PHY"))
        );

        let mut reserved_phy = cis_config(0);
        reserved_phy.phy_c_to_p = 0x8;
        assert!(matches!(
            ll.set_cig_parameters(&cig_config(1, vec![reserved_phy])),
            Err(LinkLayerError::Unsupported(_))
        ));

        let mut large_sdu = cis_config(0);
        large_sdu.max_sdu_c_to_p = 0x1000;
        assert!(matches!(
            ll.set_cig_parameters(&cig_config(1, vec![large_sdu])),
            Err(LinkLayerError::InvalidParameters(_))
        ));

        let mut short_interval = cig_config(1, vec![cis_config(0)]);
        short_interval.sdu_interval_c_to_p = 0x10;
        assert_eq!(
            ll.set_cig_parameters(&short_interval),
            Err(LinkLayerError::InvalidParameters("SDU interval"))
        );

        let mut low_latency = cig_config(1, vec![cis_config(0)]);
        low_latency.max_transport_latency_c_to_p = 5;
        assert!(matches!(
            ll.set_cig_parameters(&low_latency),
            Err(LinkLayerError::Unsupported(_))
        ));

        assert!(matches!(
            ll.set_cig_parameters(&cig_config(1, vec![cis_config(0), cis_config(0)])),
            Err(LinkLayerError::InvalidParameters(_))
        ));

        let five = (0..5).map(cis_config).collect();
        assert_eq!(ll.set_cig_parameters(&cig_config(1, five)), Err(LinkLayerError::LimitedResources));

        // Nothing was allocated by the failed requests.
        assert_eq!(ll.pools().find_cig_by_id(1), None);
        assert_eq!(ll.pools().num_enabled_cis(), 0);
        assert_eq!(ll.ctx().take(|r| matches!(r, Recorded::BbStart(_))), 0);
    }

    #[test]
    fn test_central_cis_establishment() {
        let mut ll = connected(Role::Central);
        ll.set_cig_parameters(&cig_config(1, vec![cis_config(0)])).unwrap();
        ll.ctx().clear();

        ll.create_cis(&[(CIS, ACL)]).unwrap();
        let packets = ll.ctx().llcp_packets();
        assert_eq!(packets.len(), 1);
        let (handle, LlcpPdu::CisReq(req)) = &packets[0] else {
            panic!("unexpected packet {:?}", packets[0]);
        };
        assert_eq!(*handle, ACL);
        assert_eq!((req.cig_id, req.cis_id, req.phy_c_to_p, req.iso_interval), (1, 0, 0x2, 8));
        assert_eq!(req.conn_event_count, 6);
        assert_eq!((req.cis_offset_min, req.cis_offset_max), (500, 49_999));
        assert_eq!(
            ll.ctx().take(|r| *r == Recorded::StartTimer(TimerId::CisLlcpRsp(CIS), 40_000)),
            1
        );
        assert_eq!(
            ll.pools().find_cis_by_handle(CIS).unwrap().est_state,
            CisEstState::WaitCisRsp
        );
        assert!(!ll.pools().cig(0).unwrap().configurable);

        ll.ctx().clear();
        ingest(&mut ll, LlcpPdu::CisRsp(cis_rsp()));

        let cis = ll.pools().find_cis_by_handle(CIS).unwrap();
        assert!(cis.established);
        let packets = ll.ctx().llcp_packets();
        let [(_, LlcpPdu::CisInd(ind))] = packets.as_slice() else {
            panic!("unexpected packets {:?}", packets);
        };
        assert_eq!(ind.access_address, cis.access_address);
        assert_eq!(ind.cis_offset, 1_000);
        assert_eq!((ind.cig_sync_delay, ind.cis_sync_delay), (10_000, 10_000));
        assert_eq!(ind.conn_event_count, 6);

        let events = ll.ctx().host_events();
        assert!(matches!(
            events[0],
            HostEvent::CisEstablished { status: ErrorCode::Success, cis_handle: CIS, params: Some(_) }
        ));
        // The central does not widen its receive window.
        let inserted = ll.ctx().inserted_ops();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].due_usec, 1_051_000);
        assert_eq!(ll.pools().find_conn(ACL).unwrap().llcp.active(), None);

        assert_eq!(ll.remove_cig(1), Err(LinkLayerError::CommandDisallowed("CIG is active")));
        assert!(matches!(
            ll.set_cig_parameters(&cig_config(1, vec![cis_config(0)])),
            Err(LinkLayerError::CommandDisallowed(_))
        ));
        assert_eq!(ll.create_cis(&[(CIS, ACL)]), Err(LinkLayerError::LinkAlreadyExists(CIS)));
    }

    #[test]
    fn test_create_cis_one_at_a_time() {
        let mut ll = connected(Role::Central);
        let cis = vec![cis_config(0), cis_config(1), cis_config(2)];
        ll.set_cig_parameters(&cig_config(1, cis)).unwrap();
        ll.ctx().clear();

        ll.create_cis(&[(CIS, ACL), (CIS + 1, ACL)]).unwrap();
        let requests = |ll: &LinkLayer<TestContext>| {
            ll.ctx()
                .llcp_packets()
                .into_iter()
                .filter_map(|(_, pdu)| match pdu {
                    LlcpPdu::CisReq(req) => Some(req.cis_id),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(requests(&ll), vec![0]);
        assert_eq!(
            ll.create_cis(&[(CIS + 2, ACL)]),
            Err(LinkLayerError::CommandDisallowed("Create CIS already pending"))
        );

        ingest(&mut ll, LlcpPdu::CisRsp(cis_rsp()));
        assert_eq!(requests(&ll), vec![0, 1]);
        assert_eq!(
            ll.pools().find_cis_by_handle(CIS + 1).unwrap().est_state,
            CisEstState::WaitCisRsp
        );

        ingest(&mut ll, LlcpPdu::CisRsp(cis_rsp()));
        assert_eq!(ll.pools().num_established_cis(), 2);
        // The second CIS joins the CIG operation of the first one.
        assert_eq!(ll.ctx().inserted_ops().len(), 1);
        assert_eq!(ll.pools().find_conn(ACL).unwrap().llcp.active(), None);
    }

    #[test]
    fn test_create_cis_rejected_by_peer() {
        let mut ll = connected(Role::Central);
        ll.set_cig_parameters(&cig_config(1, vec![cis_config(0)])).unwrap();
        ll.create_cis(&[(CIS, ACL)]).unwrap();
        ll.ctx().clear();

        ingest(
            &mut ll,
            LlcpPdu::RejectExtInd {
                reject_opcode: Opcode::CisReq as u8,
                error_code: ErrorCode::UnsupportedRemoteFeature.into(),
            },
        );
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::CisEstablished {
                status: ErrorCode::UnsupportedRemoteFeature,
                cis_handle: CIS,
                params: None
            }]
        );
        let cis = ll.pools().find_cis_by_handle(CIS).unwrap();
        assert_eq!(cis.acl_connection_handle, None);
        assert!(cis.is_idle());

        assert_eq!(ll.remove_cig(1), Ok(()));
        assert_eq!(ll.ctx().take(|r| *r == Recorded::BbStop(Protocol::Cis)), 1);
        assert_eq!(ll.get_cis_connection_handle(1, 0), None);
        assert_eq!(ll.remove_cig(1), Err(LinkLayerError::UnknownConnection(1)));
    }

    #[test]
    fn test_create_cis_validation() {
        let mut ll = connected(Role::Central);
        ll.add_link(conn_params(2, Role::Peripheral)).unwrap();
        ll.set_cig_parameters(&cig_config(1, vec![cis_config(0)])).unwrap();

        assert_eq!(ll.create_cis(&[(CIS, 7)]), Err(LinkLayerError::UnknownConnection(7)));
        assert!(matches!(
            ll.create_cis(&[(CIS, 2)]),
            Err(LinkLayerError::InvalidParameters(_))
        ));
        assert_eq!(
            ll.create_cis(&[(CIS + 3, ACL)]),
            Err(LinkLayerError::UnknownConnection(CIS + 3))
        );
        assert!(matches!(
            ll.create_cis(&[(CIS, ACL), (CIS, ACL)]),
            Err(LinkLayerError::InvalidParameters(_))
        ));

        let mut ll = LinkLayer::new(
            TestContext::new(),
            CoreConfig { bt_version: crate::config::BT_VERSION_5_0, ..Default::default() },
        );
        ll.add_link(conn_params(ACL, Role::Central)).unwrap();
        ll.set_cig_parameters(&cig_config(1, vec![cis_config(0)])).unwrap();
        assert!(matches!(
            ll.create_cis(&[(CIS, ACL)]),
            Err(LinkLayerError::CommandDisallowed(_))
        ));
    }

    #[test]
    fn test_iso_data_path() {
        let mut ll = connected(Role::Peripheral);
        ingest(&mut ll, LlcpPdu::CisReq(crate::llcp::test::cis_req(1, 0, 6)));
        assert_eq!(
            ll.setup_iso_data_path(CIS, DataPathDirection::Input),
            Err(LinkLayerError::CommandDisallowed("CIS request not accepted"))
        );
        ll.accept_cis_request(CIS).unwrap();

        assert_eq!(ll.setup_iso_data_path(CIS, DataPathDirection::Input), Ok(()));
        assert!(matches!(
            ll.setup_iso_data_path(CIS, DataPathDirection::Input),
            Err(LinkLayerError::CommandDisallowed(_))
        ));
        let cis = ll.pools().find_cis_by_handle(CIS).unwrap();
        assert_eq!(cis.iso_data_path_p_to_c, Some(IsoDataPath::Hci));
        assert_eq!(cis.iso_data_path_c_to_p, None);

        assert!(matches!(
            ll.remove_iso_data_path(CIS, &[DataPathDirection::Input, DataPathDirection::Output]),
            Err(LinkLayerError::CommandDisallowed(_))
        ));
        assert_eq!(ll.remove_iso_data_path(CIS, &[DataPathDirection::Input]), Ok(()));
        assert_eq!(ll.pools().find_cis_by_handle(CIS).unwrap().iso_data_path_p_to_c, None);
        assert_eq!(
            ll.setup_iso_data_path(0xe05, DataPathDirection::Output),
            Err(LinkLayerError::UnknownConnection(0xe05))
        );
    }

    #[test]
    fn test_send_iso_sdu() {
        let mut ll = connected(Role::Peripheral);
        let cis = establish_peripheral_cis(&mut ll, 1, 0);
        assert_eq!(
            ll.send_iso_sdu(cis, Bytes::from_static(&[0; 20])),
            Err(LinkLayerError::CommandDisallowed("no input data path"))
        );
        ll.setup_iso_data_path(cis, DataPathDirection::Input).unwrap();
        ll.ctx().clear();

        assert_eq!(ll.send_iso_sdu(cis, Bytes::from_static(&[0; 20])), Ok(()));
        assert_eq!(
            ll.send_iso_sdu(cis, Bytes::from_static(&[0; 41])),
            Err(LinkLayerError::InvalidParameters("SDU longer than max SDU"))
        );
        assert_eq!(ll.pools().iso_credits, 7);
        assert_eq!(ll.pools().find_cis_by_handle(cis).unwrap().tx_ft.len(), 1);

        // The flush timeout is one event: the payload is flushed at the
        // end of the next CIG event and its credit returned.
        ll.op_event(OpId::cig(0), OpEvent::End(0));
        assert_eq!(ll.ctx().take(|r| matches!(r, Recorded::FreeSdu(h, _) if *h == cis)), 1);
        assert_eq!(
            ll.ctx().host_events(),
            vec![HostEvent::NumberOfCompletedPackets { handle: cis, count: 1 }]
        );
        assert_eq!(ll.pools().iso_credits, 8);
        assert!(ll.pools().find_cis_by_handle(cis).unwrap().tx_ft.is_empty());
    }

    #[test]
    fn test_send_iso_sdu_without_credit() {
        let mut ll = connected(Role::Peripheral);
        let cis = establish_peripheral_cis(&mut ll, 1, 0);
        ll.setup_iso_data_path(cis, DataPathDirection::Input).unwrap();
        for _ in 0..8 {
            ll.send_iso_sdu(cis, Bytes::from_static(b"sdu")).unwrap();
        }
        assert_eq!(
            ll.send_iso_sdu(cis, Bytes::from_static(b"sdu")),
            Err(LinkLayerError::CommandDisallowed("no ISO buffer credit"))
        );

        // Closing the CIS returns the queued SDUs.
        ll.disconnect(cis, ErrorCode::RemoteUserTerminatedConnection).unwrap();
        ll.op_event(OpId::acl(ACL), OpEvent::End(0));
        assert_eq!(ll.ctx().take(|r| matches!(r, Recorded::FreeSdu(..))), 8);
        assert_eq!(ll.pools().iso_credits, 8);
    }
}
