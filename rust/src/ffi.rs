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

// TODO(b/290018030): Remove this and add proper safety comments.
#![allow(clippy::undocumented_unsafe_blocks)]

use std::cell::Cell;
use std::ffi::{c_char, CStr};
use std::mem::ManuallyDrop;
use std::rc::Rc;
use std::{ptr, slice};

use bytes::Bytes;
use tracing::warn;

use crate::config::CoreConfig;
use crate::llcp::bod::OpKind;
use crate::llcp::ctx::ConnParams;
use crate::llcp::{
    ConflictOutcome, ConflictResolver, Context, LinkLayer, LinkLayerError, Op, OpEvent, OpId,
    Protocol, SubEvent, TimerId,
};
use crate::packets::hci::{ErrorCode, HostEvent};
use crate::packets::llcp::LlcpPdu;

/// Link layer instance handed out to C.
pub type FfiLinkLayer = LinkLayer<ControllerOps>;

/// Conflict resolver called back by the scheduler during
/// `sch_insert_at_due_time`.
pub type FfiConflictResolver =
    unsafe extern "C" fn(new: *const Op, existing: *const Op) -> ConflictOutcome;

/// Link layer callbacks
#[repr(C)]
#[derive(Clone)]
pub struct ControllerOps {
    user_pointer: *mut (),
    sch_insert_at_due_time:
        unsafe extern "C" fn(user: *mut (), op: *const Op, resolver: FfiConflictResolver) -> bool,
    sch_reload: unsafe extern "C" fn(user: *mut (), op: *const Op),
    sch_remove: unsafe extern "C" fn(user: *mut (), kind: u8, handle: u16),
    bb_start: unsafe extern "C" fn(user: *mut (), protocol: u8),
    bb_stop: unsafe extern "C" fn(user: *mut (), protocol: u8),
    /// `cis_handle` 0xffff ends the CIG event.
    bb_next_sub_event:
        unsafe extern "C" fn(user: *mut (), kind: u8, handle: u16, cis_handle: u16, chan: u8),
    send_llcp_packet: unsafe extern "C" fn(user: *mut (), handle: u16, data: *const u8, len: usize),
    send_hci_event: unsafe extern "C" fn(user: *mut (), data: *const u8, len: usize),
    start_timer: unsafe extern "C" fn(user: *mut (), kind: u8, handle: u16, timeout_ms: u32),
    stop_timer: unsafe extern "C" fn(user: *mut (), kind: u8, handle: u16),
    aes_ecb_encrypt: unsafe extern "C" fn(
        user: *mut (),
        key: *const [u8; 16],
        block: *const [u8; 16],
        result: *mut [u8; 16],
    ),
    free_sdu: unsafe extern "C" fn(user: *mut (), handle: u16, data: *const u8, len: usize),
    random_u32: unsafe extern "C" fn(user: *mut ()) -> u32,
}

thread_local! {
    /// Resolver of the scheduler insertion in progress.
    static CONFLICT_RESOLVER: Cell<Option<ConflictResolver>> = const { Cell::new(None) };
}

unsafe extern "C" fn resolve_conflict(new: *const Op, existing: *const Op) -> ConflictOutcome {
    let (Some(new), Some(existing)) = (unsafe { new.as_ref() }, unsafe { existing.as_ref() })
    else {
        return ConflictOutcome::KeepExisting;
    };
    match CONFLICT_RESOLVER.get() {
        Some(resolver) => resolver(new, existing),
        None => ConflictOutcome::KeepExisting,
    }
}

/// Timers cross the boundary as (kind, handle).
fn timer_to_raw(timer: TimerId) -> (u8, u16) {
    match timer {
        TimerId::LlcpRsp(handle) => (0, handle),
        TimerId::CisLlcpRsp(handle) => (1, handle),
        TimerId::CisSupervision(handle) => (2, handle),
    }
}

fn timer_from_raw(kind: u8, handle: u16) -> Option<TimerId> {
    match kind {
        0 => Some(TimerId::LlcpRsp(handle)),
        1 => Some(TimerId::CisLlcpRsp(handle)),
        2 => Some(TimerId::CisSupervision(handle)),
        _ => None,
    }
}

impl Context for ControllerOps {
    fn sch_insert_at_due_time(&self, op: &Op, resolver: ConflictResolver) -> bool {
        let previous = CONFLICT_RESOLVER.replace(Some(resolver));
        let inserted = unsafe {
            (self.sch_insert_at_due_time)(self.user_pointer, op as *const _, resolve_conflict)
        };
        CONFLICT_RESOLVER.set(previous);
        inserted
    }

    fn sch_reload(&self, op: &Op) {
        unsafe { (self.sch_reload)(self.user_pointer, op as *const _) }
    }

    fn sch_remove(&self, id: OpId) {
        unsafe { (self.sch_remove)(self.user_pointer, id.kind as u8, id.handle) }
    }

    fn bb_start(&self, protocol: Protocol) {
        unsafe { (self.bb_start)(self.user_pointer, protocol as u8) }
    }

    fn bb_stop(&self, protocol: Protocol) {
        unsafe { (self.bb_stop)(self.user_pointer, protocol as u8) }
    }

    fn bb_next_sub_event(&self, id: OpId, sub_event: Option<SubEvent>) {
        let (cis_handle, chan) =
            sub_event.map_or((0xffff, 0), |sub_event| (sub_event.cis_connection_handle, sub_event.chan));
        unsafe {
            (self.bb_next_sub_event)(self.user_pointer, id.kind as u8, id.handle, cis_handle, chan)
        }
    }

    fn send_llcp_packet(&self, acl_connection_handle: u16, packet: LlcpPdu) {
        let packet = packet.to_vec();
        unsafe {
            (self.send_llcp_packet)(
                self.user_pointer,
                acl_connection_handle,
                packet.as_ptr(),
                packet.len(),
            )
        }
    }

    fn send_host_event(&self, event: HostEvent) {
        let packet = event.to_vec();
        unsafe { (self.send_hci_event)(self.user_pointer, packet.as_ptr(), packet.len()) }
    }

    fn start_timer(&self, timer: TimerId, timeout_ms: u32) {
        let (kind, handle) = timer_to_raw(timer);
        unsafe { (self.start_timer)(self.user_pointer, kind, handle, timeout_ms) }
    }

    fn stop_timer(&self, timer: TimerId) {
        let (kind, handle) = timer_to_raw(timer);
        unsafe { (self.stop_timer)(self.user_pointer, kind, handle) }
    }

    fn aes_ecb_encrypt(&self, key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
        let mut result = [0; 16];
        unsafe {
            (self.aes_ecb_encrypt)(
                self.user_pointer,
                key as *const _,
                block as *const _,
                &mut result as *mut _,
            )
        };
        result
    }

    fn free_sdu(&self, cis_connection_handle: u16, sdu: Bytes) {
        unsafe {
            (self.free_sdu)(self.user_pointer, cis_connection_handle, sdu.as_ptr(), sdu.len())
        }
    }

    fn random_u32(&self) -> u32 {
        unsafe { (self.random_u32)(self.user_pointer) }
    }
}

fn status(result: Result<(), LinkLayerError>) -> u8 {
    match result {
        Ok(()) => ErrorCode::Success.into(),
        Err(err) => {
            warn!(%err, "link layer request failed");
            err.error_code().into()
        }
    }
}

/// Run `f` on the link layer behind `ll` without taking ownership.
///
/// # Safety
/// `ll` must have been returned by `link_layer_create` and not
/// destroyed.
unsafe fn with_link_layer<R>(
    ll: *const FfiLinkLayer,
    default: R,
    f: impl FnOnce(&mut FfiLinkLayer) -> R,
) -> R {
    let mut ll = ManuallyDrop::new(unsafe { Rc::from_raw(ll) });
    match Rc::get_mut(&mut ll) {
        Some(ll) => f(ll),
        None => default,
    }
}

/// Create a new link layer instance
/// Returns null if the configuration is invalid
/// # Arguments
/// * `ops` - Function callbacks required by the link layer
/// * `config_toml` - Null terminated TOML configuration, or null for
///   the default configuration
/// # Safety
/// - `config_toml` must be null or a valid null terminated string
#[no_mangle]
pub unsafe extern "C" fn link_layer_create(
    ops: ControllerOps,
    config_toml: *const c_char,
) -> *const FfiLinkLayer {
    let config = if config_toml.is_null() {
        Ok(CoreConfig::default())
    } else {
        match unsafe { CStr::from_ptr(config_toml) }.to_str() {
            Ok(config_toml) => CoreConfig::from_toml_str(config_toml),
            Err(err) => {
                warn!(%err, "configuration is not valid UTF-8");
                return ptr::null();
            }
        }
    };
    match config {
        Ok(config) => Rc::into_raw(Rc::new(LinkLayer::new(ops, config))),
        Err(err) => {
            warn!(%err, "invalid link layer configuration");
            ptr::null()
        }
    }
}

/// Deallocate the link layer instance
/// # Arguments
/// * `ll` - link layer pointer
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointers and must not be reused afterwards
#[no_mangle]
pub unsafe extern "C" fn link_layer_destroy(ll: *const FfiLinkLayer) {
    unsafe {
        let _ = Rc::from_raw(ll);
    }
}

/// Dispatch the queued messages
/// # Arguments
/// * `ll` - link layer pointer
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn link_layer_tick(ll: *const FfiLinkLayer) {
    unsafe { with_link_layer(ll, (), |ll| ll.tick()) }
}

/// Register a new ACL connection
/// Returns the HCI status
/// # Arguments
/// * `ll` - link layer pointer
/// * `params` - connection parameters from the CONNECT_IND exchange
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
/// - `params` must be valid for reads
#[no_mangle]
pub unsafe extern "C" fn link_layer_add_link(
    ll: *const FfiLinkLayer,
    params: *const ConnParams,
) -> u8 {
    let Some(params) = (unsafe { params.as_ref() }) else {
        return ErrorCode::InvalidHciCommandParameters.into();
    };
    unsafe {
        with_link_layer(ll, ErrorCode::UnspecifiedError.into(), |ll| {
            status(ll.add_link(*params).map(|_| ()))
        })
    }
}

/// Unregister a link with a peer inside the link layer
/// Returns the HCI status
/// # Arguments
/// * `ll` - link layer pointer
/// * `handle` - ACL connection handle
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn link_layer_remove_link(ll: *const FfiLinkLayer, handle: u16) -> u8 {
    unsafe {
        with_link_layer(ll, ErrorCode::UnspecifiedError.into(), |ll| {
            status(ll.remove_link(handle))
        })
    }
}

/// Process an LLCP packet from a peer with the link layer
/// Returns the HCI status
/// # Arguments
/// * `ll` - link layer pointer
/// * `handle` - ACL handle of the connection
/// * `data` - LLCP packet data
/// * `len` - LLCP packet len
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointers
/// - `data` must be valid for reads of len `len`
#[no_mangle]
pub unsafe extern "C" fn link_layer_ingest_llcp(
    ll: *const FfiLinkLayer,
    handle: u16,
    data: *const u8,
    len: usize,
) -> u8 {
    let data = unsafe { slice::from_raw_parts(data, len) };
    unsafe {
        with_link_layer(ll, ErrorCode::UnspecifiedError.into(), |ll| {
            status(ll.ingest_llcp(handle, data))
        })
    }
}

/// Accept the CIS request reported for `cis_connection_handle`
/// Returns the HCI status
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn link_layer_accept_cis(
    ll: *const FfiLinkLayer,
    cis_connection_handle: u16,
) -> u8 {
    unsafe {
        with_link_layer(ll, ErrorCode::UnspecifiedError.into(), |ll| {
            status(ll.accept_cis_request(cis_connection_handle))
        })
    }
}

/// Reject the CIS request reported for `cis_connection_handle`
/// Returns the HCI status
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn link_layer_reject_cis(
    ll: *const FfiLinkLayer,
    cis_connection_handle: u16,
    reason: u8,
) -> u8 {
    unsafe {
        with_link_layer(ll, ErrorCode::UnspecifiedError.into(), |ll| {
            status(ll.reject_cis_request(cis_connection_handle, ErrorCode::from_u8(reason)))
        })
    }
}

/// Disconnect an ACL connection or a CIS
/// Returns the HCI status
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn link_layer_disconnect(
    ll: *const FfiLinkLayer,
    handle: u16,
    reason: u8,
) -> u8 {
    unsafe {
        with_link_layer(ll, ErrorCode::UnspecifiedError.into(), |ll| {
            status(ll.disconnect(handle, ErrorCode::from_u8(reason)))
        })
    }
}

/// Queue an outbound ISO SDU on a CIS, the data is copied
/// Returns the HCI status
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
/// - `data` must be valid for reads of len `len`
#[no_mangle]
pub unsafe extern "C" fn link_layer_send_iso_sdu(
    ll: *const FfiLinkLayer,
    cis_connection_handle: u16,
    data: *const u8,
    len: usize,
) -> u8 {
    let sdu = Bytes::copy_from_slice(unsafe { slice::from_raw_parts(data, len) });
    unsafe {
        with_link_layer(ll, ErrorCode::UnspecifiedError.into(), |ll| {
            status(ll.send_iso_sdu(cis_connection_handle, sdu))
        })
    }
}

/// Notify the expiry of a timer started with `start_timer`
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn link_layer_timer_expired(ll: *const FfiLinkLayer, kind: u8, handle: u16) {
    let Some(timer) = timer_from_raw(kind, handle) else {
        warn!(kind, handle, "unknown timer");
        return;
    };
    unsafe { with_link_layer(ll, (), |ll| ll.timer_expired(timer)) }
}

/// Report an operation completion
/// # Arguments
/// * `ll` - link layer pointer
/// * `kind`, `handle` - operation identifier
/// * `event` - 0: begin, 1: end, 2: abort, 3: tx, 4: rx, 5: continue
/// * `status` - baseband status of the end event
/// * `cis_connection_handle` - CIS of a tx, rx or continue event,
///   0xffff if none
/// * `last` - rx event of the last sub-event of the CIS
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn link_layer_op_event(
    ll: *const FfiLinkLayer,
    kind: u8,
    handle: u16,
    event: u8,
    status: u8,
    cis_connection_handle: u16,
    last: bool,
) {
    let kind = match kind {
        0 => OpKind::Acl,
        1 => OpKind::Cig,
        _ => {
            warn!(kind, handle, "unknown operation kind");
            return;
        }
    };
    let cis_connection_handle = (cis_connection_handle != 0xffff).then_some(cis_connection_handle);
    let event = match event {
        0 => OpEvent::Begin,
        1 => OpEvent::End(status),
        2 => OpEvent::Abort,
        3 => OpEvent::Tx { cis_connection_handle },
        4 => OpEvent::Rx { cis_connection_handle, last },
        5 => OpEvent::Continue { cis_connection_handle },
        _ => {
            warn!(event, handle, "unknown operation event");
            return;
        }
    };
    unsafe { with_link_layer(ll, (), |ll| ll.op_event(OpId { kind, handle }, event)) }
}

/// Close every CIS, CIG and connection
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn link_layer_reset(ll: *const FfiLinkLayer) {
    unsafe { with_link_layer(ll, (), |ll| ll.reset()) }
}

/// Query the connection handle for a CIS established with
/// the input CIS and CIG identifiers.
/// Returns true if successful
/// # Arguments
/// * `ll` - link layer pointer
/// * `cig_id` - Identifier of the established Cig
/// * `cis_id` - Identifier of the established Cis
/// * `cis_connection_handle` - Returns the handle of the CIS if connected
/// # Safety
/// - This should be called from the thread of creation
/// - `ll` must be a valid pointers
/// - `cis_connection_handle` must be valid for writes
#[no_mangle]
pub unsafe extern "C" fn link_layer_get_cis_connection_handle(
    ll: *const FfiLinkLayer,
    cig_id: u8,
    cis_id: u8,
    cis_connection_handle: *mut u16,
) -> bool {
    unsafe {
        with_link_layer(ll, false, |ll| {
            ll.get_cis_connection_handle(cig_id, cis_id)
                .map(|handle| *cis_connection_handle = handle)
                .is_some()
        })
    }
}
