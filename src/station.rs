use alloc::collections::VecDeque;
use core::cell::RefCell;

use bitfield_struct::bitfield;
use embassy_sync::blocking_mutex;
use embassy_time::Duration;

use crate::{
    address::MacAddress,
    reorder::{ReorderController, Tid, TID_COUNT},
    DefaultRawMutex,
};

pub(crate) type Locked<T> = blocking_mutex::Mutex<DefaultRawMutex, RefCell<T>>;

/// The number of access categories and therefore transmit sub-queues per station.
pub const ACCESS_CATEGORY_COUNT: usize = 4;
/// Initial value of all receive sequence caches.
pub const RX_SEQ_UNSET: u16 = 0xffff;

/// Weight of the old value in the signal quality estimate.
const RX_SMOOTH_FACTOR: i32 = 20;

#[bitfield(u16)]
#[derive(PartialEq, Eq)]
/// Link state of a station.
pub struct StationFlags {
    /// The firmware has an active link to this station.
    pub fw_linked: bool,
    /// The station is the access point.
    pub ap_role: bool,
    pub qos: bool,
    pub ht: bool,
    pub pairwise_key_installed: bool,
    #[bits(11)]
    __: u16,
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
/// Capabilities negotiated with a station, which affect the protection settings of the BSS.
pub struct StationCapabilities {
    pub non_erp: bool,
    pub no_short_slot_time: bool,
    pub no_short_preamble: bool,
    pub no_ht_greenfield: bool,
    pub no_ht: bool,
    pub ht_20mhz: bool,
    #[bits(2)]
    __: u8,
}

/// The access categories used for transmit queueing.
///
/// The discriminants match the order of the hardware transmit counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessCategory {
    Voice,
    Video,
    BestEffort,
    Background,
}
impl AccessCategory {
    pub const ALL: [Self; ACCESS_CATEGORY_COUNT] =
        [Self::Voice, Self::Video, Self::BestEffort, Self::Background];
    pub const fn index(self) -> usize {
        self as usize
    }
    /// Map a TID to its access category, as specified by 802.1D.
    pub const fn from_tid(tid: Tid) -> Self {
        match tid.into_bits() & 0b111 {
            1 | 2 => Self::Background,
            0 | 3 => Self::BestEffort,
            4 | 5 => Self::Video,
            _ => Self::Voice,
        }
    }
}

/// Which of the membership lists a station is on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Membership {
    #[default]
    None,
    AuthPending,
    Associated,
}

/// Last seen sequence control values, used to discard retransmissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxSeqCache {
    tid_rxseq: [u16; TID_COUNT],
    mgmt_seq: u16,
}
impl RxSeqCache {
    // The first frame of a WPS handshake may carry sequence number zero, so zero can't be used
    // as the initial value here.
    pub const fn new() -> Self {
        Self {
            tid_rxseq: [RX_SEQ_UNSET; TID_COUNT],
            mgmt_seq: RX_SEQ_UNSET,
        }
    }
    /// Check if a data frame is a retransmission of the previous one, and remember it otherwise.
    pub fn is_duplicate(&mut self, tid: Tid, seq_ctrl: u16) -> bool {
        let last = &mut self.tid_rxseq[tid.index()];
        if *last == seq_ctrl {
            return true;
        }
        *last = seq_ctrl;
        false
    }
    /// Same as [Self::is_duplicate] for management frames.
    pub fn is_mgmt_duplicate(&mut self, seq: u16) -> bool {
        if self.mgmt_seq == seq {
            return true;
        }
        self.mgmt_seq = seq;
        false
    }
}
impl Default for RxSeqCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A smoothed estimate of the received signal quality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalEstimate(i32);
impl SignalEstimate {
    pub const UNSET: Self = Self(-1);
    /// The current estimate, if any sample was taken yet.
    pub fn get(&self) -> Option<i32> {
        (self.0 >= 0).then_some(self.0)
    }
    /// Fold a new sample into the estimate.
    ///
    /// Rising samples are rounded up, so the estimate converges towards a sudden improvement.
    pub fn update(&mut self, sample: i32) {
        let sample = sample.max(0);
        self.0 = match self.get() {
            None => sample,
            Some(current) if sample > current => {
                (current * (RX_SMOOTH_FACTOR - 1) + sample) / RX_SMOOTH_FACTOR + 1
            }
            Some(current) => (current * (RX_SMOOTH_FACTOR - 1) + sample) / RX_SMOOTH_FACTOR,
        };
    }
}

/// Everything guarded by the lock of a station record.
pub(crate) struct LinkState {
    pub address: MacAddress,
    pub aid: u16,
    pub mac_id: Option<u8>,
    pub flags: StationFlags,
    pub capabilities: StationCapabilities,
    pub signal: SignalEstimate,
    pub membership: Membership,
    pub expire_to: u8,
    pub keep_alive_trycnt: u8,
    pub under_exist_checking: bool,
    pub rx_cache: RxSeqCache,
}
impl LinkState {
    pub const fn new(address: MacAddress) -> Self {
        Self {
            address,
            aid: 0,
            mac_id: None,
            flags: StationFlags::new(),
            capabilities: StationCapabilities::new(),
            signal: SignalEstimate::UNSET,
            membership: Membership::None,
            expire_to: 0,
            keep_alive_trycnt: 0,
            under_exist_checking: false,
            rx_cache: RxSeqCache::new(),
        }
    }
}

/// A station record.
///
/// Every part, that's touched from a different context, has its own lock. The identity of the
/// record (address, generation, liveness) is kept by the pool under the table lock.
pub(crate) struct Station<F> {
    pub link: Locked<LinkState>,
    pub tx_queues: [Locked<VecDeque<F>>; ACCESS_CATEGORY_COUNT],
    pub sleep_queue: Locked<VecDeque<F>>,
    pub reorder: [Locked<ReorderController<F>>; TID_COUNT],
}
impl<F> Station<F> {
    pub fn new(reorder_timeout: Duration) -> Self {
        Self {
            link: blocking_mutex::Mutex::new(RefCell::new(LinkState::new(MacAddress::new(
                [0; 6],
            )))),
            tx_queues: core::array::from_fn(|_| {
                blocking_mutex::Mutex::new(RefCell::new(VecDeque::new()))
            }),
            sleep_queue: blocking_mutex::Mutex::new(RefCell::new(VecDeque::new())),
            reorder: core::array::from_fn(|_| {
                blocking_mutex::Mutex::new(RefCell::new(ReorderController::new(reorder_timeout)))
            }),
        }
    }
}

/// A validated reference to a live station.
///
/// Handles carry the generation of the record, so a handle to a released station can never
/// reach the next occupant of the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StationHandle {
    pub(crate) offset: u16,
    pub(crate) generation: u32,
}
impl StationHandle {
    /// The position of the record in the pool.
    pub const fn offset(&self) -> usize {
        self.offset as usize
    }
}

/// A snapshot of the state of a station.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StationInfo {
    pub handle: StationHandle,
    pub address: MacAddress,
    /// The association ID, or zero if none is assigned.
    pub aid: u16,
    pub mac_id: Option<u8>,
    pub flags: StationFlags,
    pub capabilities: StationCapabilities,
    pub signal: Option<i32>,
    pub membership: Membership,
    pub expire_to: u8,
    pub keep_alive_retries: u8,
    pub exist_checking: bool,
}
impl StationInfo {
    pub(crate) fn new(handle: StationHandle, link: &LinkState) -> Self {
        Self {
            handle,
            address: link.address,
            aid: link.aid,
            mac_id: link.mac_id,
            flags: link.flags,
            capabilities: link.capabilities,
            signal: link.signal.get(),
            membership: link.membership,
            expire_to: link.expire_to,
            keep_alive_retries: link.keep_alive_trycnt,
            exist_checking: link.under_exist_checking,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_to_access_category() {
        let expected = [
            AccessCategory::BestEffort,
            AccessCategory::Background,
            AccessCategory::Background,
            AccessCategory::BestEffort,
            AccessCategory::Video,
            AccessCategory::Video,
            AccessCategory::Voice,
            AccessCategory::Voice,
        ];
        for (tid, ac) in Tid::all().zip(expected.iter().cycle()) {
            assert_eq!(AccessCategory::from_tid(tid), *ac, "{tid:?}");
        }
        for (i, ac) in AccessCategory::ALL.iter().enumerate() {
            assert_eq!(ac.index(), i);
        }
    }

    #[test]
    fn first_frame_is_never_a_duplicate() {
        let mut cache = RxSeqCache::new();
        let tid = Tid::new(0).unwrap();
        assert!(!cache.is_duplicate(tid, 0));
        assert!(cache.is_duplicate(tid, 0));
        assert!(!cache.is_duplicate(tid, 0x10));
        // Caches are kept per TID.
        assert!(!cache.is_duplicate(Tid::new(5).unwrap(), 0x10));

        assert!(!cache.is_mgmt_duplicate(0));
        assert!(cache.is_mgmt_duplicate(0));
    }

    #[test]
    fn signal_estimate_smoothing() {
        let mut signal = SignalEstimate::UNSET;
        assert_eq!(signal.get(), None);
        signal.update(60);
        assert_eq!(signal.get(), Some(60));
        signal.update(80);
        assert_eq!(signal.get(), Some(62));
        signal.update(0);
        assert_eq!(signal.get(), Some(58));
    }

    #[test]
    fn flags_pack_into_bits() {
        let flags = StationFlags::new().with_fw_linked(true).with_ht(true);
        assert_eq!(flags.into_bits(), 0b1001);
        let capabilities = StationCapabilities::new().with_no_ht(true);
        assert!(capabilities.no_ht());
        assert!(!capabilities.non_erp());
    }
}
