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

//! Ownership of the single LLCP procedure slot of a connection.
//!
//! A connection runs at most one procedure at a time. A request that
//! finds the slot taken either waits (local requests), takes the slot
//! over from a procedure without an instant (peer requests), or is
//! refused as a transaction collision. Waiting procedures resume in
//! the order they were recorded once the active one completes.

use std::collections::VecDeque;

use crate::packets::hci::ErrorCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LlcpProc {
    ConnUpd,
    ChanMapUpd,
    PhyUpd,
    FeatExch,
    VerExch,
    DataLenUpd,
    ReqPeerSca,
    CisEst,
    CisTerm,
}

impl LlcpProc {
    /// Procedures whose PDUs carry an instant field.
    pub fn has_instant(self) -> bool {
        matches!(self, LlcpProc::ConnUpd | LlcpProc::ChanMapUpd | LlcpProc::PhyUpd)
    }

    /// Procedures that a peer request may push back onto the pend
    /// queue.
    pub fn is_overridable(self) -> bool {
        matches!(
            self,
            LlcpProc::FeatExch | LlcpProc::VerExch | LlcpProc::DataLenUpd | LlcpProc::ReqPeerSca
        )
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LlcpState {
    #[default]
    Idle,
    Busy,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Pended,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PeerStartOutcome {
    Started,
    /// The active procedure was pended in favor of the peer request.
    Overrode(LlcpProc),
    /// The slot is held by a procedure that cannot be overridden.
    Collision(ErrorCode),
}

#[derive(Debug, Default)]
pub struct LlcpOwner {
    state: LlcpState,
    active: Option<LlcpProc>,
    pend: VecDeque<LlcpProc>,
    overridden: bool,
}

impl LlcpOwner {
    pub fn state(&self) -> LlcpState {
        self.state
    }

    pub fn active(&self) -> Option<LlcpProc> {
        self.active
    }

    pub fn is_active(&self, proc: LlcpProc) -> bool {
        self.active == Some(proc)
    }

    pub fn is_overridden(&self) -> bool {
        self.overridden
    }

    /// Bitmask of the pended procedures.
    pub fn pend_mask(&self) -> u16 {
        self.pend.iter().fold(0, |mask, proc| mask | proc.bit())
    }

    pub fn is_pended(&self, proc: LlcpProc) -> bool {
        self.pend_mask() & proc.bit() != 0
    }

    fn activate(&mut self, proc: LlcpProc) {
        self.state = LlcpState::Busy;
        self.active = Some(proc);
    }

    fn pend(&mut self, proc: LlcpProc) {
        if !self.is_pended(proc) {
            self.pend.push_back(proc);
        }
    }

    /// Locally initiated procedure.
    pub fn start_local(&mut self, proc: LlcpProc) -> StartOutcome {
        match self.active {
            None => {
                self.activate(proc);
                StartOutcome::Started
            }
            Some(_) => {
                self.pend(proc);
                StartOutcome::Pended
            }
        }
    }

    /// Peer initiated procedure.
    pub fn start_peer(&mut self, proc: LlcpProc) -> PeerStartOutcome {
        match self.active {
            None => {
                self.activate(proc);
                PeerStartOutcome::Started
            }
            Some(active) if active == proc => {
                PeerStartOutcome::Collision(ErrorCode::LlProcedureCollision)
            }
            Some(active) if active.is_overridable() => {
                self.pend(active);
                self.overridden = true;
                self.activate(proc);
                PeerStartOutcome::Overrode(active)
            }
            Some(_) => PeerStartOutcome::Collision(ErrorCode::DifferentTransactionCollision),
        }
    }

    /// Complete `proc`. Returns the next pended procedure, which is
    /// made active and must be re-initiated by the caller.
    pub fn complete(&mut self, proc: LlcpProc) -> Option<LlcpProc> {
        if self.active != Some(proc) {
            // Completed while pended, e.g. a late response.
            self.pend.retain(|pended| *pended != proc);
            return None;
        }
        self.active = None;
        self.state = LlcpState::Idle;
        let next = self.pend.pop_front()?;
        if self.pend.is_empty() {
            self.overridden = false;
        }
        self.activate(next);
        Some(next)
    }

    /// Drop every procedure, used on disconnection.
    pub fn clear(&mut self) {
        *self = LlcpOwner::default();
    }
}
