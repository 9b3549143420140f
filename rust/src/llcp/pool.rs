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

//! Fixed capacity context pools. A slot index is the context handle;
//! allocation is a linear scan for the first free slot.

use tracing::{debug, trace};

use crate::config::CoreConfig;
use crate::llcp::ctx::{CigCtx, CisCtx, ConnCtx};
use crate::llcp::{Context, Protocol, TimerId};
use crate::packets::hci::Role;

#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Option<T>>,
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Pool<T> {
        Pool { slots: (0..capacity).map(|_| None).collect() }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first free slot, building its context from the slot
    /// index.
    pub fn alloc(&mut self, init: impl FnOnce(usize) -> T) -> Option<usize> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(init(index));
        Some(index)
    }

    pub fn free(&mut self, index: usize) -> Option<T> {
        self.slots.get_mut(index)?.take()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn position<F: Fn(&T) -> bool>(&self, predicate: F) -> Option<usize> {
        self.slots.iter().position(|slot| slot.as_ref().is_some_and(&predicate))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| Some((index, slot.as_ref()?)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| Some((index, slot.as_mut()?)))
    }

    pub fn num_used(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn num_avail(&self) -> usize {
        self.capacity() - self.num_used()
    }
}

/// Connection, CIG and CIS pools sized once from the configuration.
#[derive(Debug)]
pub struct ContextPools {
    pub conns: Pool<ConnCtx>,
    pub cigs: Pool<CigCtx>,
    pub cis: Pool<CisCtx>,
    cis_handle_base: u16,
    /// Number of allocated CIGs keeping the CIS radio protocol alive.
    cis_radio_refs: usize,
    /// Outbound ISO SDU flow control credits.
    pub iso_credits: u16,
}

impl ContextPools {
    pub fn new(config: &CoreConfig) -> ContextPools {
        ContextPools {
            conns: Pool::with_capacity(config.max_conn as usize),
            cigs: Pool::with_capacity(config.max_cig as usize),
            cis: Pool::with_capacity(config.max_cis as usize),
            cis_handle_base: config.cis_handle_base,
            cis_radio_refs: 0,
            iso_credits: config.num_iso_bufs,
        }
    }

    pub fn cis_radio_refs(&self) -> usize {
        self.cis_radio_refs
    }

    pub fn alloc_conn(&mut self, conn: ConnCtx) -> Option<&mut ConnCtx> {
        let index = self.conns.alloc(|_| conn)?;
        self.conns.get_mut(index)
    }

    pub fn find_conn(&self, handle: u16) -> Option<&ConnCtx> {
        let index = self.conns.position(|conn| conn.handle == handle)?;
        self.conns.get(index)
    }

    pub fn find_conn_mut(&mut self, handle: u16) -> Option<&mut ConnCtx> {
        let index = self.conns.position(|conn| conn.handle == handle)?;
        self.conns.get_mut(index)
    }

    pub fn free_conn(&mut self, handle: u16) -> Option<ConnCtx> {
        let index = self.conns.position(|conn| conn.handle == handle)?;
        self.conns.free(index)
    }

    pub fn conn_handles(&self) -> Vec<u16> {
        self.conns.iter().map(|(_, conn)| conn.handle).collect()
    }

    /// Allocate a CIG context. The first live CIG starts the CIS radio
    /// protocol.
    pub fn alloc_cig<C: Context>(&mut self, ctx: &C, cig_id: u8, role: Role) -> Option<u8> {
        let max_cis = self.cis.capacity();
        let index = self.cigs.alloc(|index| CigCtx::new(cig_id, index as u8, role, max_cis))?;
        self.cis_radio_refs += 1;
        if self.cis_radio_refs == 1 {
            ctx.bb_start(Protocol::Cis);
        }
        debug!(cig_id, cig_handle = index, "allocated CIG");
        Some(index as u8)
    }

    pub fn find_cig_by_id(&self, cig_id: u8) -> Option<u8> {
        self.cigs.position(|cig| cig.cig_id == cig_id).map(|index| index as u8)
    }

    pub fn cig(&self, cig_handle: u8) -> Option<&CigCtx> {
        self.cigs.get(cig_handle as usize)
    }

    pub fn cig_mut(&mut self, cig_handle: u8) -> Option<&mut CigCtx> {
        self.cigs.get_mut(cig_handle as usize)
    }

    pub fn cig_by_id_mut(&mut self, cig_id: u8) -> Option<&mut CigCtx> {
        let cig_handle = self.find_cig_by_id(cig_id)?;
        self.cig_mut(cig_handle)
    }

    /// Release a CIG context. The last live CIG stops the CIS radio
    /// protocol.
    pub fn free_cig_ctx<C: Context>(&mut self, ctx: &C, cig_handle: u8) {
        let Some(cig) = self.cigs.free(cig_handle as usize) else {
            return;
        };
        self.cis_radio_refs = self.cis_radio_refs.saturating_sub(1);
        if self.cis_radio_refs == 0 {
            ctx.bb_stop(Protocol::Cis);
        }
        debug!(cig_id = cig.cig_id, cig_handle, "freed CIG");
    }

    /// Allocate a CIS context for the CIG `cig_handle`.
    pub fn alloc_cis(&mut self, cig_handle: u8, cis_id: u8, role: Role) -> Option<u16> {
        let cig_id = self.cig(cig_handle)?.cig_id;
        let base = self.cis_handle_base;
        let index =
            self.cis.alloc(|index| CisCtx::new(base + index as u16, cig_id, cis_id, role))?;
        debug!(cig_id, cis_id, cis_connection_handle = base + index as u16, "allocated CIS");
        Some(base + index as u16)
    }

    fn cis_index(&self, cis_connection_handle: u16) -> Option<usize> {
        cis_connection_handle.checked_sub(self.cis_handle_base).map(usize::from)
    }

    pub fn find_cis_by_handle(&self, cis_connection_handle: u16) -> Option<&CisCtx> {
        self.cis.get(self.cis_index(cis_connection_handle)?)
    }

    pub fn find_cis_by_handle_mut(&mut self, cis_connection_handle: u16) -> Option<&mut CisCtx> {
        let index = self.cis_index(cis_connection_handle)?;
        self.cis.get_mut(index)
    }

    pub fn find_cis_by_id(&self, cig_id: u8, cis_id: u8) -> Option<u16> {
        self.cis
            .position(|cis| cis.cig_id == cig_id && cis.cis_id == cis_id)
            .map(|index| self.cis_handle_base + index as u16)
    }

    /// CIS handles matching `predicate`, in slot order.
    pub fn cis_handles<F: Fn(&CisCtx) -> bool>(&self, predicate: F) -> Vec<u16> {
        self.cis.iter().filter(|(_, cis)| predicate(cis)).map(|(_, cis)| cis.cis_connection_handle).collect()
    }

    /// Release a CIS context: queued SDUs go back to the buffer pool
    /// and credit the flow control, flush timeout lists are cleared and
    /// both CIS timers are stopped.
    pub fn free_cis_ctx<C: Context>(&mut self, ctx: &C, cis_connection_handle: u16) {
        let Some(index) = self.cis_index(cis_connection_handle) else {
            return;
        };
        let Some(mut cis) = self.cis.free(index) else {
            trace!(cis_connection_handle, "CIS already freed");
            return;
        };
        for sdu in cis.sdu_queue.drain(..) {
            ctx.free_sdu(cis_connection_handle, sdu);
            self.iso_credits = self.iso_credits.saturating_add(1);
        }
        cis.tx_ft.clear();
        cis.rx_ft.clear();
        ctx.stop_timer(TimerId::CisLlcpRsp(cis_connection_handle));
        ctx.stop_timer(TimerId::CisSupervision(cis_connection_handle));
        debug!(cig_id = cis.cig_id, cis_id = cis.cis_id, cis_connection_handle, "freed CIS");
    }

    /// Borrow an ACL, a CIG and a CIS of that CIG together.
    pub fn acl_cig_cis_mut(
        &mut self,
        acl_connection_handle: u16,
        cig_handle: u8,
        cis_connection_handle: u16,
    ) -> Option<(&ConnCtx, &mut CigCtx, &mut CisCtx)> {
        let conn_index = self.conns.position(|conn| conn.handle == acl_connection_handle)?;
        let cis_index = self.cis_index(cis_connection_handle)?;
        let conn = self.conns.get(conn_index)?;
        let cig = self.cigs.get_mut(cig_handle as usize)?;
        let cis = self.cis.get_mut(cis_index)?;
        Some((conn, cig, cis))
    }

    pub fn cig_cis_mut(
        &mut self,
        cig_handle: u8,
        cis_connection_handle: u16,
    ) -> Option<(&mut CigCtx, &mut CisCtx)> {
        let cis_index = self.cis_index(cis_connection_handle)?;
        let cig = self.cigs.get_mut(cig_handle as usize)?;
        let cis = self.cis.get_mut(cis_index)?;
        Some((cig, cis))
    }

    pub fn num_avail_cis(&self) -> usize {
        self.cis.num_avail()
    }

    pub fn num_avail_cig(&self) -> usize {
        self.cigs.num_avail()
    }

    pub fn num_enabled_cis(&self) -> usize {
        self.cis.num_used()
    }

    pub fn num_established_cis(&self) -> usize {
        self.cis.iter().filter(|(_, cis)| cis.established).count()
    }
}
