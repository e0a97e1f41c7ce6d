//! # `wifi-sta-mgmt`
//! Station management for an 802.11 access point or mesh node.
//!
//! This crate keeps track of every peer, that the local interface talks to. It is independent of
//! the actual MAC hardware, the frames handled here are opaque to it and only ever moved between
//! queues.
//! ## Overview
//! All state lives in a [StationPool], which is created once with a fixed number of records.
//!
//! ### Records and lookup
//! Station records are preallocated and never move. Free records wait on a FIFO free list. When a
//! station shows up, a record is taken from the free list, reset and inserted into one of 32 hash
//! buckets, which are indexed by a fold of the MAC address. Callers refer to stations through a
//! [StationHandle], which carries the generation of the record. Once a station is released, all
//! of its handles become stale and every operation with them fails with
//! [StationError::NotFound], even after the record has been reused.
//!
//! The broadcast pseudo-station with address `ff:ff:ff:ff:ff:ff` is allocated along with the pool.
//! Frames addressed to groups are queued on it.
//!
//! ### Reordering
//! Every station has a [ReorderController] for each of its 16 traffic identifiers. While a
//! BlockAck session is active, out of order frames are buffered and released in sequence order.
//! Gaps, that are never closed, are skipped once the reorder timer expires. The timers are driven
//! by [StationPool::run_reorder_timers], which should be spawned as a task, or by calling
//! [StationPool::expire_reorder_timers] from an existing timer.
//!
//! ### Membership
//! Stations move from unauthenticated to authenticating and finally to associated, at which point
//! they get an association ID. Power save state is tracked in two bitmaps indexed by the AID.
//! A periodic [StationPool::liveness_sweep] ages out stations, that have gone silent.
//!
//! ### Locking
//! The table of records is guarded by one lock. Beyond that, the state of a record, each of its
//! transmit queues, its sleep queue and each of its reorder controllers are locked individually.
//! With the `critical_section` feature, which is enabled by default, all locks are backed by a
//! critical section and the pool can be shared between threads or interrupt contexts.

#![no_std]
#![allow(unexpected_cfgs)]
pub(crate) mod fmt;

extern crate alloc;
#[cfg(test)]
extern crate std;

mod acl;
mod address;
mod config;
mod frame_pool;
mod membership;
mod pool;
mod reorder;
mod station;
mod sync;

pub use acl::{AccessControlList, AclEntry, AclMode, AclVerdict, DEFAULT_ACL_CAPACITY};
pub use address::{MacAddress, BROADCAST, HASH_BUCKET_COUNT};
pub use config::{PoolConfig, DEFAULT_STATION_COUNT};
pub use frame_pool::{DropFrames, FramePool, FreeFrameQueue};
pub use membership::{AidBitmap, PowerSaveBitmaps, AID_BITMAP_BITS};
pub use pool::{LivenessReport, ReceiveOutcome, ReorderStatus, StationPool};
pub use reorder::{
    seq_less, InOrder, RejectReason, Rejected, ReorderController, ReorderState, Tid,
    DEFAULT_REORDER_TIMEOUT, MAX_WINDOW_SIZE, SEQ_MASK, SEQ_UNSET, TID_COUNT,
};
pub use station::{
    AccessCategory, Membership, RxSeqCache, SignalEstimate, StationCapabilities, StationFlags,
    StationHandle, StationInfo, ACCESS_CATEGORY_COUNT, RX_SEQ_UNSET,
};
pub use sync::TimerKick;

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// An error returned by station management.
pub enum StationError {
    /// No free record, association ID or ACL entry was left, or memory couldn't be reserved.
    ResourceExhausted,
    /// The handle is stale, or no station with that address exists.
    NotFound,
    /// A parameter was out of range.
    InvalidArgument,
    /// A station with that address already exists.
    AlreadyExists,
}
pub type StationResult<T> = Result<T, StationError>;
