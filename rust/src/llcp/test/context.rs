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

use std::cell::{Cell, RefCell};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::llcp::{ConflictResolver, Context, Op, OpId, Protocol, SubEvent, TimerId};
use crate::packets::{hci, llcp};

/// Side effect recorded by the test context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    SchInsert(Op),
    SchReload(Op),
    SchRemove(OpId),
    BbStart(Protocol),
    BbStop(Protocol),
    NextSubEvent(OpId, Option<SubEvent>),
    Llcp(u16, llcp::LlcpPdu),
    Host(hci::HostEvent),
    StartTimer(TimerId, u32),
    StopTimer(TimerId),
    FreeSdu(u16, Bytes),
}

pub struct TestContext {
    records: RefCell<Vec<Recorded>>,
    refused_inserts: Cell<usize>,
    rng: RefCell<StdRng>,
}

impl TestContext {
    pub fn new() -> Self {
        TestContext {
            records: RefCell::new(vec![]),
            refused_inserts: Cell::new(0),
            rng: RefCell::new(StdRng::seed_from_u64(0x11c7)),
        }
    }

    /// Refuse the next `count` scheduler insertions.
    pub fn refuse_inserts(&self, count: usize) {
        self.refused_inserts.set(count);
    }

    /// Remove the records matching `predicate`, returning how many
    /// were removed.
    pub fn take<F: Fn(&Recorded) -> bool>(&self, predicate: F) -> usize {
        let mut records = self.records.borrow_mut();
        let before = records.len();
        records.retain(|record| !predicate(record));
        before - records.len()
    }

    /// LLCP PDUs sent so far, in order, without removing them.
    pub fn llcp_packets(&self) -> Vec<(u16, llcp::LlcpPdu)> {
        self.records
            .borrow()
            .iter()
            .filter_map(|record| match record {
                Recorded::Llcp(handle, pdu) => Some((*handle, pdu.clone())),
                _ => None,
            })
            .collect()
    }

    /// Host events sent so far, in order, without removing them.
    pub fn host_events(&self) -> Vec<hci::HostEvent> {
        self.records
            .borrow()
            .iter()
            .filter_map(|record| match record {
                Recorded::Host(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// Operations handed to the scheduler so far, in order.
    pub fn inserted_ops(&self) -> Vec<Op> {
        self.records
            .borrow()
            .iter()
            .filter_map(|record| match record {
                Recorded::SchInsert(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    /// Remove and return every record.
    pub fn take_all(&self) -> Vec<Recorded> {
        self.records.take()
    }

    pub fn clear(&self) {
        self.records.borrow_mut().clear();
    }

    fn record(&self, record: Recorded) {
        self.records.borrow_mut().push(record)
    }
}

impl Context for TestContext {
    fn sch_insert_at_due_time(&self, op: &Op, _resolver: ConflictResolver) -> bool {
        self.record(Recorded::SchInsert(op.clone()));
        let refused = self.refused_inserts.get();
        if refused > 0 {
            self.refused_inserts.set(refused - 1);
            false
        } else {
            true
        }
    }

    fn sch_reload(&self, op: &Op) {
        self.record(Recorded::SchReload(op.clone()))
    }

    fn sch_remove(&self, id: OpId) {
        self.record(Recorded::SchRemove(id))
    }

    fn bb_start(&self, protocol: Protocol) {
        self.record(Recorded::BbStart(protocol))
    }

    fn bb_stop(&self, protocol: Protocol) {
        self.record(Recorded::BbStop(protocol))
    }

    fn bb_next_sub_event(&self, id: OpId, sub_event: Option<SubEvent>) {
        self.record(Recorded::NextSubEvent(id, sub_event))
    }

    fn send_llcp_packet(&self, acl_connection_handle: u16, packet: llcp::LlcpPdu) {
        self.record(Recorded::Llcp(acl_connection_handle, packet))
    }

    fn send_host_event(&self, event: hci::HostEvent) {
        self.record(Recorded::Host(event))
    }

    fn start_timer(&self, timer: TimerId, timeout_ms: u32) {
        self.record(Recorded::StartTimer(timer, timeout_ms))
    }

    fn stop_timer(&self, timer: TimerId) {
        self.record(Recorded::StopTimer(timer))
    }

    // Not a cipher, only deterministic.
    fn aes_ecb_encrypt(&self, key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
        let mut out = [0; 16];
        for (i, octet) in out.iter_mut().enumerate() {
            *octet = key[i] ^ block[15 - i];
        }
        out
    }

    fn free_sdu(&self, cis_connection_handle: u16, sdu: Bytes) {
        self.record(Recorded::FreeSdu(cis_connection_handle, sdu))
    }

    fn random_u32(&self) -> u32 {
        self.rng.borrow_mut().random()
    }
}
