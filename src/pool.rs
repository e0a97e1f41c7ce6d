use alloc::{collections::VecDeque, vec::Vec};
use core::cell::RefCell;

use embassy_futures::select::select;
use embassy_sync::blocking_mutex;
use embassy_time::{Instant, Timer};
use portable_atomic::{AtomicUsize, Ordering};

use crate::{
    acl::AccessControlList,
    address::{MacAddress, BROADCAST, HASH_BUCKET_COUNT},
    config::PoolConfig,
    frame_pool::FramePool,
    membership::{AssociationState, PowerSaveBitmaps, StationList, AID_BITMAP_BITS},
    reorder::{RejectReason, Rejected, ReorderController, ReorderState, Tid, MAX_WINDOW_SIZE},
    station::{
        AccessCategory, LinkState, Locked, Membership, Station, StationCapabilities,
        StationFlags, StationHandle, StationInfo, ACCESS_CATEGORY_COUNT,
    },
    sync::TimerKick,
    StationError, StationResult,
};

/// The hardware MAC identifier of the broadcast pseudo-station.
const BROADCAST_MAC_ID: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Taken from the free list, but not reset yet.
    Allocating,
    Live,
    /// Detached from lookups, while the queues are drained.
    Releasing,
}

struct Slot {
    address: MacAddress,
    generation: u32,
    state: SlotState,
}

/// Identity of all records, guarded by the table lock.
struct Table {
    slots: Vec<Slot>,
    free: VecDeque<u16>,
    buckets: [Vec<u16>; HASH_BUCKET_COUNT],
}
impl Table {
    fn slot(&self, offset: u16) -> Option<&Slot> {
        self.slots.get(offset as usize)
    }
    fn is_live(&self, handle: StationHandle) -> bool {
        self.slot(handle.offset)
            .is_some_and(|slot| slot.state == SlotState::Live && slot.generation == handle.generation)
    }
    fn live_address(&self, handle: StationHandle) -> Option<MacAddress> {
        self.slot(handle.offset)
            .filter(|_| self.is_live(handle))
            .map(|slot| slot.address)
    }
    fn bucket(&self, address: MacAddress) -> StationResult<&Vec<u16>> {
        let index = address.bucket_index();
        self.buckets.get(index).ok_or_else(|| {
            error!("Bucket index {} for {:?} is out of range.", index, address);
            StationError::InvalidArgument
        })
    }
    fn find(&self, address: MacAddress) -> Option<StationHandle> {
        self.bucket(address)
            .ok()?
            .iter()
            .find_map(|offset| {
                let slot = self.slot(*offset)?;
                (slot.state == SlotState::Live && slot.address == address).then_some(
                    StationHandle {
                        offset: *offset,
                        generation: slot.generation,
                    },
                )
            })
    }
    /// Take a record from the free list and index it under the address.
    fn claim(&mut self, address: MacAddress) -> StationResult<StationHandle> {
        // Records, which are still being released, keep their address until they're free.
        if self
            .bucket(address)?
            .iter()
            .any(|offset| self.slot(*offset).is_some_and(|slot| slot.address == address))
        {
            return Err(StationError::AlreadyExists);
        }
        let index = address.bucket_index();
        let offset = self.free.pop_front().ok_or(StationError::ResourceExhausted)?;
        let Some(slot) = self.slots.get_mut(offset as usize) else {
            error!("Free list contained invalid offset {}.", offset);
            return Err(StationError::InvalidArgument);
        };
        slot.address = address;
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Allocating;
        let handle = StationHandle {
            offset,
            generation: slot.generation,
        };
        self.buckets[index].push(offset);
        Ok(handle)
    }
    fn set_state(&mut self, handle: StationHandle, from: SlotState, to: SlotState) -> bool {
        match self.slots.get_mut(handle.offset()) {
            Some(slot) if slot.generation == handle.generation && slot.state == from => {
                slot.state = to;
                true
            }
            _ => false,
        }
    }
    /// Unindex the record and put it back on the free list.
    fn finish_release(&mut self, handle: StationHandle) -> Option<MacAddress> {
        if !self.set_state(handle, SlotState::Releasing, SlotState::Free) {
            return None;
        }
        let address = self.slot(handle.offset)?.address;
        if let Some(bucket) = self.buckets.get_mut(address.bucket_index()) {
            bucket.retain(|offset| *offset != handle.offset);
        }
        self.free.push_back(handle.offset);
        Some(address)
    }
    fn live_handles(&self) -> Vec<(StationHandle, MacAddress)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::Live)
            .map(|(offset, slot)| {
                (
                    StationHandle {
                        offset: offset as u16,
                        generation: slot.generation,
                    },
                    slot.address,
                )
            })
            .collect()
    }
}

/// What happened to a frame passed to [StationPool::receive].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiveOutcome {
    /// The frame was indicated or buffered.
    Accepted,
    /// The frame was dropped and handed back to the frame pool.
    Rejected(RejectReason),
}

/// A snapshot of a reorder controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReorderStatus {
    pub state: ReorderState,
    pub expected_seq: Option<u16>,
    pub window_end: Option<u16>,
    pub window_size: u16,
    pub buffered: usize,
    pub timer_armed: bool,
}

/// Stations reported by [StationPool::liveness_sweep].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LivenessReport {
    /// Stations, that didn't complete authentication in time. They were removed from the
    /// authentication list.
    pub expired_auth: Vec<StationHandle>,
    /// Associated stations, that went silent and should be sent a keep-alive probe.
    pub probe: Vec<StationHandle>,
    /// Associated stations, that didn't answer any probe. They were disassociated.
    pub expired: Vec<StationHandle>,
}

enum Liveness {
    Alive,
    Probe,
    Expired,
}

/// The station table of an interface.
///
/// All operations take `&self`, so the pool can be shared between the receive path, the
/// transmit path and management.
pub struct StationPool<P: FramePool> {
    config: PoolConfig,
    frame_pool: P,
    stations: Vec<Station<P::Frame>>,
    table: Locked<Table>,
    auth: Locked<StationList>,
    assoc: Locked<AssociationState>,
    power_save: Locked<PowerSaveBitmaps>,
    hw_tx_counters: Locked<[usize; ACCESS_CATEGORY_COUNT]>,
    station_count: AtomicUsize,
    acl: AccessControlList,
    reorder_kick: TimerKick,
}
impl<P: FramePool> StationPool<P> {
    /// Create a pool with all records preallocated and the broadcast pseudo-station in place.
    pub fn new(config: PoolConfig, frame_pool: P) -> StationResult<Self> {
        if config.capacity == 0 || config.capacity > AID_BITMAP_BITS {
            error!(
                "Station capacity {} must be between 1 and {}.",
                config.capacity, AID_BITMAP_BITS
            );
            return Err(StationError::InvalidArgument);
        }
        if !(1..=MAX_WINDOW_SIZE).contains(&config.reorder_window) {
            error!("Reorder window {} is out of range.", config.reorder_window);
            return Err(StationError::InvalidArgument);
        }
        let capacity = config.capacity;

        let mut stations = Vec::new();
        let mut slots = Vec::new();
        let mut free = VecDeque::new();
        stations
            .try_reserve_exact(capacity)
            .and_then(|_| slots.try_reserve_exact(capacity))
            .and_then(|_| free.try_reserve_exact(capacity))
            .map_err(|_| {
                error!("Failed to reserve memory for {} stations.", capacity);
                StationError::ResourceExhausted
            })?;
        for offset in 0..capacity {
            stations.push(Station::new(config.reorder_timeout));
            slots.push(Slot {
                address: MacAddress::default(),
                generation: 0,
                state: SlotState::Free,
            });
            free.push_back(offset as u16);
        }

        let pool = Self {
            config,
            frame_pool,
            stations,
            table: blocking_mutex::Mutex::new(RefCell::new(Table {
                slots,
                free,
                buckets: core::array::from_fn(|_| Vec::new()),
            })),
            auth: blocking_mutex::Mutex::new(RefCell::new(StationList::with_capacity(capacity))),
            assoc: blocking_mutex::Mutex::new(RefCell::new(AssociationState::new(capacity))),
            power_save: blocking_mutex::Mutex::new(RefCell::new(PowerSaveBitmaps::new())),
            hw_tx_counters: blocking_mutex::Mutex::new(RefCell::new([0; ACCESS_CATEGORY_COUNT])),
            station_count: AtomicUsize::new(0),
            acl: AccessControlList::new(config.acl_capacity),
            reorder_kick: TimerKick::new(),
        };
        let broadcast = pool.allocate(BROADCAST)?;
        pool.set_mac_id(broadcast, Some(BROADCAST_MAC_ID))?;
        debug!("Station pool initialized with {} records.", capacity);
        Ok(pool)
    }
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
    /// The pool, that dropped frames are handed back to.
    pub fn frame_pool(&self) -> &P {
        &self.frame_pool
    }
    /// The total number of records.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }
    /// The number of allocated stations, including the broadcast pseudo-station.
    pub fn station_count(&self) -> usize {
        self.station_count.load(Ordering::Relaxed)
    }
    pub fn acl(&self) -> &AccessControlList {
        &self.acl
    }

    fn is_live(&self, handle: StationHandle) -> bool {
        self.table.lock(|table| table.borrow().is_live(handle))
    }
    /// The record the handle points to, without checking if it's still live.
    fn record(&self, handle: StationHandle) -> StationResult<&Station<P::Frame>> {
        self.stations.get(handle.offset()).ok_or_else(|| {
            trace!("Handle {:?} is out of range.", handle);
            StationError::NotFound
        })
    }
    fn station(&self, handle: StationHandle) -> StationResult<&Station<P::Frame>> {
        if !self.is_live(handle) {
            trace!("Stale station handle {:?}.", handle);
            return Err(StationError::NotFound);
        }
        self.record(handle)
    }
    fn live_address(&self, handle: StationHandle) -> StationResult<MacAddress> {
        self.table
            .lock(|table| table.borrow().live_address(handle))
            .ok_or(StationError::NotFound)
    }

    /// Allocate a record for the station with the address.
    pub fn allocate(&self, address: MacAddress) -> StationResult<StationHandle> {
        if address.is_multicast() && !address.is_broadcast() {
            warn!("Refusing to allocate a station for group address {:?}.", address);
            return Err(StationError::InvalidArgument);
        }
        let handle = self
            .table
            .lock(|table| table.borrow_mut().claim(address))
            .inspect_err(|err| debug!("Allocating {:?} failed: {:?}.", address, err))?;
        let station = self.record(handle)?;
        station
            .link
            .lock(|link| *link.borrow_mut() = LinkState::new(address));
        for controller in station.reorder.iter() {
            controller.lock(|controller| {
                let mut controller = controller.borrow_mut();
                controller.reset(&self.frame_pool);
                controller.claim(handle.generation);
            });
        }
        self.table.lock(|table| {
            table
                .borrow_mut()
                .set_state(handle, SlotState::Allocating, SlotState::Live)
        });
        self.station_count.fetch_add(1, Ordering::Relaxed);
        info!("Allocated station {:?} at offset {}.", address, handle.offset);
        Ok(handle)
    }
    fn drain_queue(&self, queue: &Locked<VecDeque<P::Frame>>) -> usize {
        queue.lock(|queue| {
            let mut queue = queue.borrow_mut();
            let drained = queue.len();
            queue
                .drain(..)
                .for_each(|frame| self.frame_pool.recycle(frame));
            drained
        })
    }
    /// Disassociate without touching the list, which the caller already did.
    fn clear_association(
        &self,
        station: &Station<P::Frame>,
        handle: StationHandle,
        assoc: &mut AssociationState,
    ) {
        let aid = station.link.lock(|link| {
            let mut link = link.borrow_mut();
            link.membership = Membership::None;
            core::mem::take(&mut link.aid)
        });
        if aid != 0 {
            self.power_save
                .lock(|power_save| power_save.borrow_mut().clear(aid));
            assoc.aids.release(aid, handle);
        }
    }
    /// Release the station and return its record to the free list.
    ///
    /// All frames, that are still queued or buffered for reordering, are handed back to the
    /// frame pool. Releasing a stale handle does nothing.
    pub fn release(&self, handle: StationHandle) {
        if !self.table.lock(|table| {
            table
                .borrow_mut()
                .set_state(handle, SlotState::Live, SlotState::Releasing)
        }) {
            trace!("Ignoring release of stale handle {:?}.", handle);
            return;
        }
        let Ok(station) = self.record(handle) else {
            return;
        };
        station
            .link
            .lock(|link| link.borrow_mut().flags.set_fw_linked(false));

        // Sub-queue lock first, then the counters.
        for ac in AccessCategory::ALL {
            station.tx_queues[ac.index()].lock(|queue| {
                let mut queue = queue.borrow_mut();
                let drained = queue.len();
                queue
                    .drain(..)
                    .for_each(|frame| self.frame_pool.recycle(frame));
                self.hw_tx_counters.lock(|counters| {
                    let mut counters = counters.borrow_mut();
                    counters[ac.index()] = counters[ac.index()].saturating_sub(drained);
                });
            });
        }
        let dozed = self.drain_queue(&station.sleep_queue);
        for controller in station.reorder.iter() {
            controller.lock(|controller| controller.borrow_mut().reset(&self.frame_pool));
        }

        self.auth
            .lock(|auth| auth.borrow_mut().remove(handle));
        self.assoc.lock(|assoc| {
            let mut assoc = assoc.borrow_mut();
            assoc.list.remove(handle);
            self.clear_association(station, handle, &mut assoc);
        });
        station.link.lock(|link| {
            let mut link = link.borrow_mut();
            link.expire_to = 0;
            link.keep_alive_trycnt = 0;
            link.under_exist_checking = false;
        });

        let address = self
            .table
            .lock(|table| table.borrow_mut().finish_release(handle));
        self.station_count.fetch_sub(1, Ordering::Relaxed);
        info!(
            "Released station {:?}, dropped {} sleep queue frames.",
            address, dozed
        );
    }
    /// Release the station with that address.
    pub fn release_by_address(&self, address: MacAddress) -> StationResult<()> {
        let Some(handle) = self.lookup(address) else {
            warn!("Can't release unknown station {:?}.", address);
            return Err(StationError::InvalidArgument);
        };
        self.release(handle);
        Ok(())
    }
    /// Release every station except the broadcast pseudo-station.
    ///
    /// Returns the number of released stations.
    pub fn release_all(&self) -> usize {
        let handles = self.table.lock(|table| table.borrow().live_handles());
        let mut released = 0;
        for (handle, address) in handles {
            if address.is_broadcast() {
                continue;
            }
            self.release(handle);
            released += 1;
        }
        released
    }
    /// Release every station including the broadcast pseudo-station.
    pub fn shutdown(&self) -> usize {
        let handles = self.table.lock(|table| table.borrow().live_handles());
        for (handle, _) in handles.iter() {
            self.release(*handle);
        }
        debug!("Station pool shut down, released {} stations.", handles.len());
        handles.len()
    }
    /// Find the station with that address.
    ///
    /// Group addresses resolve to the broadcast pseudo-station.
    pub fn lookup(&self, address: MacAddress) -> Option<StationHandle> {
        let address = address.normalized();
        self.table.lock(|table| table.borrow().find(address))
    }
    pub fn broadcast_station(&self) -> Option<StationHandle> {
        self.lookup(BROADCAST)
    }
    fn check_offset(&self, offset: usize) -> StationResult<()> {
        if offset >= self.capacity() {
            error!(
                "Offset {} is outside of the pool with {} records.",
                offset,
                self.capacity()
            );
            return Err(StationError::InvalidArgument);
        }
        Ok(())
    }
    /// The stable position of the station in the pool.
    pub fn offset_of(&self, handle: StationHandle) -> StationResult<usize> {
        self.check_offset(handle.offset())?;
        self.station(handle).map(|_| handle.offset())
    }
    /// The station at the position in the pool.
    pub fn by_offset(&self, offset: usize) -> StationResult<StationHandle> {
        self.check_offset(offset)?;
        self.table.lock(|table| {
            let table = table.borrow();
            match table.slot(offset as u16) {
                Some(slot) if slot.state == SlotState::Live => Ok(StationHandle {
                    offset: offset as u16,
                    generation: slot.generation,
                }),
                _ => Err(StationError::NotFound),
            }
        })
    }

    pub fn station_info(&self, handle: StationHandle) -> StationResult<StationInfo> {
        let station = self.station(handle)?;
        Ok(station
            .link
            .lock(|link| StationInfo::new(handle, &link.borrow())))
    }
    fn with_link<U>(
        &self,
        handle: StationHandle,
        f: impl FnOnce(&mut LinkState) -> U,
    ) -> StationResult<U> {
        let station = self.station(handle)?;
        Ok(station.link.lock(|link| f(&mut link.borrow_mut())))
    }
    pub fn set_flags(&self, handle: StationHandle, flags: StationFlags) -> StationResult<()> {
        self.with_link(handle, |link| link.flags = flags)
    }
    pub fn set_capabilities(
        &self,
        handle: StationHandle,
        capabilities: StationCapabilities,
    ) -> StationResult<()> {
        self.with_link(handle, |link| link.capabilities = capabilities)
    }
    /// Set the identifier, under which the hardware knows this station.
    pub fn set_mac_id(&self, handle: StationHandle, mac_id: Option<u8>) -> StationResult<()> {
        self.with_link(handle, |link| link.mac_id = mac_id)
    }
    /// Fold a signal quality sample into the estimate of the station.
    pub fn update_signal(&self, handle: StationHandle, sample: i32) -> StationResult<()> {
        self.with_link(handle, |link| link.signal.update(sample))
    }
    /// Check if a data frame is a retransmission.
    ///
    /// `seq_ctrl` is the complete sequence control field, so fragments aren't mistaken for
    /// duplicates.
    pub fn check_rx_duplicate(
        &self,
        handle: StationHandle,
        tid: Tid,
        seq_ctrl: u16,
    ) -> StationResult<bool> {
        self.with_link(handle, |link| link.rx_cache.is_duplicate(tid, seq_ctrl))
    }
    pub fn check_mgmt_duplicate(&self, handle: StationHandle, seq: u16) -> StationResult<bool> {
        self.with_link(handle, |link| link.rx_cache.is_mgmt_duplicate(seq))
    }

    // Reordering
    fn with_controller<U>(
        &self,
        handle: StationHandle,
        tid: Tid,
        f: impl FnOnce(&mut ReorderController<P::Frame>) -> U,
    ) -> StationResult<U> {
        let station = self.record(handle)?;
        station.reorder[tid.index()].lock(|controller| {
            let mut controller = controller.borrow_mut();
            if controller.owner() != Some(handle.generation) {
                return Err(StationError::NotFound);
            }
            Ok(f(&mut controller))
        })
    }
    /// Start or stop a BlockAck session on the TID.
    ///
    /// If no window size is specified, the one from the [PoolConfig] is used. Stopping a session
    /// indicates all frames, that are still buffered.
    pub fn set_reorder_session(
        &self,
        handle: StationHandle,
        tid: Tid,
        enabled: bool,
        window_size: Option<u16>,
        now: Instant,
        mut indicate: impl FnMut(P::Frame),
    ) -> StationResult<()> {
        let window_size = window_size.unwrap_or(self.config.reorder_window);
        if !(1..=MAX_WINDOW_SIZE).contains(&window_size) {
            warn!("Invalid reorder window size {}.", window_size);
            return Err(StationError::InvalidArgument);
        }
        let flushed = self.with_controller(handle, tid, |controller| {
            controller
                .set_session(enabled, window_size, now)
                .collect::<Vec<_>>()
        })?;
        flushed.into_iter().for_each(&mut indicate);
        debug!(
            "BlockAck session on TID {} {}.",
            tid.into_bits(),
            if enabled { "started" } else { "stopped" }
        );
        Ok(())
    }
    /// Pass a received frame through the reorder controller of the TID.
    ///
    /// Every frame, that is in order after this, is passed to `indicate` once the controller has
    /// been unlocked again. Rejected frames go back to the frame pool.
    pub fn receive(
        &self,
        handle: StationHandle,
        tid: Tid,
        frame: P::Frame,
        seq: u16,
        now: Instant,
        mut indicate: impl FnMut(P::Frame),
    ) -> StationResult<ReceiveOutcome> {
        let Some(station) = self.stations.get(handle.offset()) else {
            self.frame_pool.recycle(frame);
            return Err(StationError::NotFound);
        };
        let (outcome, released, newly_armed) = station.reorder[tid.index()].lock(|controller| {
            let mut controller = controller.borrow_mut();
            if controller.owner() != Some(handle.generation) {
                self.frame_pool.recycle(frame);
                return Err(StationError::NotFound);
            }
            let was_armed = controller.timer_armed();
            let (outcome, released) = match controller.submit(frame, seq, now) {
                Ok(in_order) => (ReceiveOutcome::Accepted, in_order.collect::<Vec<_>>()),
                Err(Rejected { frame, reason }) => {
                    trace!("Dropping frame with sequence number {}: {:?}.", seq, reason);
                    self.frame_pool.recycle(frame);
                    (ReceiveOutcome::Rejected(reason), Vec::new())
                }
            };
            Ok((outcome, released, !was_armed && controller.timer_armed()))
        })?;
        if newly_armed {
            self.reorder_kick.kick();
        }
        released.into_iter().for_each(&mut indicate);
        Ok(outcome)
    }
    pub fn reorder_status(&self, handle: StationHandle, tid: Tid) -> StationResult<ReorderStatus> {
        self.with_controller(handle, tid, |controller| ReorderStatus {
            state: controller.state(),
            expected_seq: controller.expected_seq(),
            window_end: controller.window_end(),
            window_size: controller.window_size(),
            buffered: controller.buffered(),
            timer_armed: controller.timer_armed(),
        })
    }
    /// Fire all reorder timers, that are due at `now`.
    ///
    /// Released frames are passed to `indicate` together with their station and TID. Returns the
    /// number of frames released.
    pub fn expire_reorder_timers(
        &self,
        now: Instant,
        mut indicate: impl FnMut(StationHandle, Tid, P::Frame),
    ) -> usize {
        let mut released = 0;
        for (offset, station) in self.stations.iter().enumerate() {
            for tid in Tid::all() {
                let expired = station.reorder[tid.index()].lock(|controller| {
                    let mut controller = controller.borrow_mut();
                    // Controllers of free records have no owner.
                    let generation = controller.owner()?;
                    let frames = controller.expire(now)?.collect::<Vec<_>>();
                    Some((
                        StationHandle {
                            offset: offset as u16,
                            generation,
                        },
                        frames,
                    ))
                });
                let Some((handle, frames)) = expired else {
                    continue;
                };
                released += frames.len();
                for frame in frames {
                    indicate(handle, tid, frame);
                }
            }
        }
        released
    }
    /// The earliest instant, at which a reorder timer fires.
    pub fn next_reorder_deadline(&self) -> Option<Instant> {
        self.stations
            .iter()
            .flat_map(|station| station.reorder.iter())
            .filter_map(|controller| {
                controller.lock(|controller| {
                    let controller = controller.borrow();
                    controller.owner().and(controller.deadline())
                })
            })
            .min()
    }
    /// Drive the reorder timers of all stations.
    ///
    /// This sleeps until the earliest deadline and is woken up early, when a timer gets armed.
    pub async fn run_reorder_timers(
        &self,
        mut indicate: impl FnMut(StationHandle, Tid, P::Frame),
    ) -> ! {
        loop {
            self.reorder_kick.reset();
            match self.next_reorder_deadline() {
                Some(deadline) => {
                    select(Timer::at(deadline), self.reorder_kick.wait()).await;
                }
                None => self.reorder_kick.wait().await,
            }
            let released = self.expire_reorder_timers(Instant::now(), &mut indicate);
            if released != 0 {
                trace!("Reorder timers released {} frames.", released);
            }
        }
    }

    // Transmit queues
    /// Queue a frame for transmission to the station.
    ///
    /// If the station isn't live, the frame goes back to the frame pool.
    pub fn enqueue_tx(
        &self,
        handle: StationHandle,
        ac: AccessCategory,
        frame: P::Frame,
    ) -> StationResult<()> {
        let Ok(station) = self.record(handle) else {
            self.frame_pool.recycle(frame);
            return Err(StationError::NotFound);
        };
        station.tx_queues[ac.index()].lock(|queue| {
            if !self.is_live(handle) {
                self.frame_pool.recycle(frame);
                return Err(StationError::NotFound);
            }
            queue.borrow_mut().push_back(frame);
            self.hw_tx_counters
                .lock(|counters| counters.borrow_mut()[ac.index()] += 1);
            Ok(())
        })
    }
    pub fn dequeue_tx(
        &self,
        handle: StationHandle,
        ac: AccessCategory,
    ) -> StationResult<Option<P::Frame>> {
        let station = self.record(handle)?;
        station.tx_queues[ac.index()].lock(|queue| {
            if !self.is_live(handle) {
                return Err(StationError::NotFound);
            }
            let frame = queue.borrow_mut().pop_front();
            if frame.is_some() {
                self.hw_tx_counters.lock(|counters| {
                    let mut counters = counters.borrow_mut();
                    counters[ac.index()] = counters[ac.index()].saturating_sub(1);
                });
            }
            Ok(frame)
        })
    }
    /// The number of frames queued for the station in that access category.
    pub fn tx_pending(&self, handle: StationHandle, ac: AccessCategory) -> StationResult<usize> {
        let station = self.station(handle)?;
        Ok(station.tx_queues[ac.index()].lock(|queue| queue.borrow().len()))
    }
    /// The number of frames queued for all stations in that access category.
    pub fn hw_tx_pending(&self, ac: AccessCategory) -> usize {
        self.hw_tx_counters
            .lock(|counters| counters.borrow()[ac.index()])
    }
    /// Buffer a frame while the station is dozing.
    pub fn enqueue_sleep(&self, handle: StationHandle, frame: P::Frame) -> StationResult<()> {
        let Ok(station) = self.record(handle) else {
            self.frame_pool.recycle(frame);
            return Err(StationError::NotFound);
        };
        station.sleep_queue.lock(|queue| {
            if !self.is_live(handle) {
                self.frame_pool.recycle(frame);
                return Err(StationError::NotFound);
            }
            queue.borrow_mut().push_back(frame);
            Ok(())
        })
    }
    pub fn dequeue_sleep(&self, handle: StationHandle) -> StationResult<Option<P::Frame>> {
        let station = self.record(handle)?;
        station.sleep_queue.lock(|queue| {
            if !self.is_live(handle) {
                return Err(StationError::NotFound);
            }
            Ok(queue.borrow_mut().pop_front())
        })
    }
    pub fn sleep_queue_len(&self, handle: StationHandle) -> StationResult<usize> {
        let station = self.station(handle)?;
        Ok(station.sleep_queue.lock(|queue| queue.borrow().len()))
    }

    // Membership
    /// Put the station on the authentication list.
    pub fn begin_authentication(&self, handle: StationHandle) -> StationResult<()> {
        let station = self.record(handle)?;
        self.auth.lock(|auth| {
            if self.live_address(handle)?.is_broadcast() {
                return Err(StationError::InvalidArgument);
            }
            station.link.lock(|link| {
                let mut link = link.borrow_mut();
                if link.membership == Membership::Associated {
                    debug!("Station {:?} is already associated.", link.address);
                    return Err(StationError::InvalidArgument);
                }
                link.membership = Membership::AuthPending;
                link.expire_to = self.config.auth_timeout;
                Ok(())
            })?;
            auth.borrow_mut().insert(handle);
            Ok(())
        })
    }
    /// Move the station to the associated list and assign it the lowest free association ID.
    ///
    /// Associating a station twice returns the association ID it already has.
    pub fn associate(&self, handle: StationHandle) -> StationResult<u16> {
        let station = self.record(handle)?;
        self.auth.lock(|auth| {
            self.assoc.lock(|assoc| {
                let address = self.live_address(handle)?;
                if address.is_broadcast() {
                    warn!("The broadcast station can't associate.");
                    return Err(StationError::InvalidArgument);
                }
                let mut assoc = assoc.borrow_mut();
                if assoc.list.contains(handle) {
                    return Ok(station.link.lock(|link| link.borrow().aid));
                }
                let Some(aid) = assoc.aids.assign(handle) else {
                    warn!("No association ID left for {:?}.", address);
                    return Err(StationError::ResourceExhausted);
                };
                assoc.list.insert(handle);
                auth.borrow_mut().remove(handle);
                station.link.lock(|link| {
                    let mut link = link.borrow_mut();
                    link.aid = aid;
                    link.membership = Membership::Associated;
                    link.expire_to = self.config.expire_timeout;
                    link.keep_alive_trycnt = 0;
                    link.under_exist_checking = false;
                });
                info!("Associated {:?} with AID {}.", address, aid);
                Ok(aid)
            })
        })
    }
    /// Remove the station from the associated list and free its association ID.
    pub fn disassociate(&self, handle: StationHandle) -> StationResult<()> {
        let station = self.record(handle)?;
        self.assoc.lock(|assoc| {
            if !self.is_live(handle) {
                return Err(StationError::NotFound);
            }
            let mut assoc = assoc.borrow_mut();
            if assoc.list.remove(handle) {
                self.clear_association(station, handle, &mut assoc);
                debug!("Disassociated station at offset {}.", handle.offset);
            }
            Ok(())
        })
    }
    pub fn auth_count(&self) -> usize {
        self.auth.lock(|auth| auth.borrow().count())
    }
    pub fn associated_count(&self) -> usize {
        self.assoc.lock(|assoc| assoc.borrow().list.count())
    }
    pub fn authenticating_stations(&self) -> Vec<StationHandle> {
        self.auth.lock(|auth| auth.borrow().members().to_vec())
    }
    pub fn associated_stations(&self) -> Vec<StationHandle> {
        self.assoc
            .lock(|assoc| assoc.borrow().list.members().to_vec())
    }
    pub fn station_by_aid(&self, aid: u16) -> Option<StationHandle> {
        self.assoc.lock(|assoc| assoc.borrow().aids.get(aid))
    }
    fn update_power_save(
        &self,
        handle: StationHandle,
        f: impl FnOnce(&mut PowerSaveBitmaps, u16),
    ) -> StationResult<()> {
        let station = self.record(handle)?;
        self.assoc.lock(|assoc| {
            if !self.is_live(handle) {
                return Err(StationError::NotFound);
            }
            let aid = station.link.lock(|link| link.borrow().aid);
            if aid == 0 || assoc.borrow().aids.get(aid) != Some(handle) {
                return Err(StationError::InvalidArgument);
            }
            self.power_save
                .lock(|power_save| f(&mut power_save.borrow_mut(), aid));
            Ok(())
        })
    }
    /// Mark an associated station as dozing or awake.
    pub fn set_sleeping(&self, handle: StationHandle, sleeping: bool) -> StationResult<()> {
        self.update_power_save(handle, |power_save, aid| {
            power_save.sleeping.set(aid, sleeping);
        })
    }
    /// Set whether traffic is buffered for an associated station.
    pub fn set_traffic_indicated(
        &self,
        handle: StationHandle,
        indicated: bool,
    ) -> StationResult<()> {
        self.update_power_save(handle, |power_save, aid| {
            power_save.traffic_indicated.set(aid, indicated);
        })
    }
    pub fn power_save_bitmaps(&self) -> PowerSaveBitmaps {
        self.power_save.lock(|power_save| *power_save.borrow())
    }

    // Liveness
    /// Note activity from the station, which restarts its countdown.
    pub fn touch(&self, handle: StationHandle) -> StationResult<()> {
        let (auth_timeout, expire_timeout) = (self.config.auth_timeout, self.config.expire_timeout);
        self.with_link(handle, |link| {
            link.expire_to = match link.membership {
                Membership::None => 0,
                Membership::AuthPending => auth_timeout,
                Membership::Associated => expire_timeout,
            };
            link.keep_alive_trycnt = 0;
            link.under_exist_checking = false;
        })
    }
    /// Count down the liveness of all authenticating and associated stations.
    ///
    /// This should be called periodically. Stations reported as expired are only removed from
    /// their list, releasing them is left to the caller.
    pub fn liveness_sweep(&self) -> LivenessReport {
        let mut report = LivenessReport::default();
        self.auth.lock(|auth| {
            let mut auth = auth.borrow_mut();
            for handle in auth.members().to_vec() {
                let Some(station) = self.stations.get(handle.offset()) else {
                    continue;
                };
                let expired = station.link.lock(|link| {
                    let mut link = link.borrow_mut();
                    link.expire_to = link.expire_to.saturating_sub(1);
                    if link.expire_to == 0 {
                        link.membership = Membership::None;
                    }
                    link.expire_to == 0
                });
                if expired {
                    auth.remove(handle);
                    report.expired_auth.push(handle);
                }
            }
        });
        self.assoc.lock(|assoc| {
            let mut assoc = assoc.borrow_mut();
            for handle in assoc.list.members().to_vec() {
                let Some(station) = self.stations.get(handle.offset()) else {
                    continue;
                };
                let liveness = station.link.lock(|link| {
                    let mut link = link.borrow_mut();
                    link.expire_to = link.expire_to.saturating_sub(1);
                    if link.expire_to > 0 {
                        Liveness::Alive
                    } else if link.keep_alive_trycnt < self.config.keep_alive_retries {
                        link.keep_alive_trycnt += 1;
                        link.under_exist_checking = true;
                        link.expire_to = 1;
                        Liveness::Probe
                    } else {
                        Liveness::Expired
                    }
                });
                match liveness {
                    Liveness::Alive => {}
                    Liveness::Probe => report.probe.push(handle),
                    Liveness::Expired => {
                        assoc.list.remove(handle);
                        self.clear_association(station, handle, &mut assoc);
                        report.expired.push(handle);
                    }
                }
            }
        });
        if !report.expired.is_empty() || !report.expired_auth.is_empty() {
            debug!(
                "Liveness sweep expired {} associated and {} authenticating stations.",
                report.expired.len(),
                report.expired_auth.len()
            );
        }
        report
    }
}
