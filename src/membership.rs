use alloc::{vec, vec::Vec};

use macro_bits::{bit, check_bit};

use crate::station::StationHandle;

/// The number of association IDs the bitmaps can represent.
pub const AID_BITMAP_BITS: usize = 256;
const AID_BITMAP_WORDS: usize = AID_BITMAP_BITS / 64;

/// A bitmap indexed by association ID.
///
/// Bit `aid - 1` belongs to the station with that association ID, since zero is never assigned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AidBitmap([u64; AID_BITMAP_WORDS]);
impl AidBitmap {
    pub const fn new() -> Self {
        Self([0; AID_BITMAP_WORDS])
    }
    fn position(aid: u16) -> Option<(usize, usize)> {
        let index = (aid as usize).checked_sub(1)?;
        (index < AID_BITMAP_BITS).then_some((index / 64, index % 64))
    }
    /// Set or clear the bit for the association ID.
    ///
    /// Returns `false`, if the association ID is outside of the bitmap.
    pub fn set(&mut self, aid: u16, value: bool) -> bool {
        let Some((word, bit)) = Self::position(aid) else {
            return false;
        };
        if value {
            self.0[word] |= bit!(bit);
        } else {
            self.0[word] &= !bit!(bit);
        }
        true
    }
    pub fn get(&self, aid: u16) -> bool {
        Self::position(aid).is_some_and(|(word, bit)| check_bit!(self.0[word], bit!(bit)))
    }
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|word| *word == 0)
    }
    /// Iterate over all association IDs with their bit set.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (1..=AID_BITMAP_BITS as u16).filter(|aid| self.get(*aid))
    }
    /// The raw words of the bitmap, least significant association IDs first.
    pub fn words(&self) -> &[u64; AID_BITMAP_WORDS] {
        &self.0
    }
}

/// The power save state of all associated stations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PowerSaveBitmaps {
    /// Stations, which are currently dozing.
    pub sleeping: AidBitmap,
    /// Stations, for which traffic is buffered, as advertised in the TIM.
    pub traffic_indicated: AidBitmap,
}
impl PowerSaveBitmaps {
    pub const fn new() -> Self {
        Self {
            sleeping: AidBitmap::new(),
            traffic_indicated: AidBitmap::new(),
        }
    }
    /// Clear both bits of the association ID, regardless of their state.
    pub fn clear(&mut self, aid: u16) {
        self.sleeping.set(aid, false);
        self.traffic_indicated.set(aid, false);
    }
}

/// A list of stations with an explicit member count.
///
/// Members are located through a table indexed by the record offset, so membership checks and
/// removal don't have to search the list.
pub(crate) struct StationList {
    members: Vec<StationHandle>,
    positions: Vec<Option<u16>>,
    count: usize,
}
impl StationList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            members: Vec::with_capacity(capacity),
            positions: vec![None; capacity],
            count: 0,
        }
    }
    fn position(&self, handle: StationHandle) -> Option<usize> {
        let position = (*self.positions.get(handle.offset())?)? as usize;
        (self.members.get(position) == Some(&handle)).then_some(position)
    }
    /// Append the station, if it isn't already a member.
    ///
    /// Only one handle per record can be a member at a time.
    pub fn insert(&mut self, handle: StationHandle) -> bool {
        let position = self.members.len() as u16;
        let Some(slot) = self.positions.get_mut(handle.offset()) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(position);
        self.members.push(handle);
        self.count += 1;
        true
    }
    /// Remove the station. The last member takes its place.
    pub fn remove(&mut self, handle: StationHandle) -> bool {
        let Some(position) = self.position(handle) else {
            return false;
        };
        self.members.swap_remove(position);
        self.positions[handle.offset()] = None;
        if let Some(moved) = self.members.get(position) {
            self.positions[moved.offset()] = Some(position as u16);
        }
        self.count -= 1;
        true
    }
    pub fn contains(&self, handle: StationHandle) -> bool {
        self.position(handle).is_some()
    }
    pub fn count(&self) -> usize {
        debug_assert_eq!(self.count, self.members.len());
        self.count
    }
    pub fn members(&self) -> &[StationHandle] {
        &self.members
    }
}

/// Maps association IDs to stations.
pub(crate) struct AidTable {
    slots: Vec<Option<StationHandle>>,
}
impl AidTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }
    /// Assign the lowest free association ID to the station.
    pub fn assign(&mut self, handle: StationHandle) -> Option<u16> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(handle);
        Some(index as u16 + 1)
    }
    /// Free the association ID, if it still belongs to the station.
    pub fn release(&mut self, aid: u16, handle: StationHandle) -> bool {
        match (aid as usize)
            .checked_sub(1)
            .and_then(|index| self.slots.get_mut(index))
        {
            Some(slot) if *slot == Some(handle) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
    pub fn get(&self, aid: u16) -> Option<StationHandle> {
        let index = (aid as usize).checked_sub(1)?;
        self.slots.get(index).copied().flatten()
    }
}

/// The associated list and the association IDs, which are always updated together.
pub(crate) struct AssociationState {
    pub list: StationList,
    pub aids: AidTable,
}
impl AssociationState {
    pub fn new(capacity: usize) -> Self {
        Self {
            list: StationList::with_capacity(capacity),
            aids: AidTable::new(capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(offset: u16) -> StationHandle {
        StationHandle {
            offset,
            generation: 0,
        }
    }

    #[test]
    fn bitmap_is_indexed_by_aid_minus_one() {
        let mut bitmap = AidBitmap::new();
        assert!(bitmap.set(1, true));
        assert!(bitmap.set(65, true));
        assert_eq!(bitmap.words()[0], 1);
        assert_eq!(bitmap.words()[1], 1);
        assert!(bitmap.get(65));
        assert!(!bitmap.get(64));
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), [1, 65]);

        assert!(!bitmap.set(0, true));
        assert!(!bitmap.set(AID_BITMAP_BITS as u16 + 1, true));
        assert!(!bitmap.get(0));

        assert!(bitmap.set(1, false));
        assert!(bitmap.set(65, false));
        assert!(bitmap.is_empty());
    }

    #[test]
    fn clearing_power_save_state() {
        let mut bitmaps = PowerSaveBitmaps::new();
        bitmaps.sleeping.set(3, true);
        bitmaps.traffic_indicated.set(3, true);
        bitmaps.traffic_indicated.set(4, true);
        bitmaps.clear(3);
        assert!(bitmaps.sleeping.is_empty());
        assert_eq!(bitmaps.traffic_indicated.iter().collect::<Vec<_>>(), [4]);
    }

    #[test]
    fn list_count_tracks_membership() {
        let mut list = StationList::with_capacity(4);
        assert!(list.insert(handle(0)));
        assert!(list.insert(handle(1)));
        assert!(!list.insert(handle(1)));
        assert_eq!(list.count(), 2);
        assert!(list.remove(handle(0)));
        assert!(!list.remove(handle(0)));
        assert_eq!(list.count(), 1);
        assert_eq!(list.members(), [handle(1)]);
    }

    #[test]
    fn removal_moves_the_last_member() {
        let mut list = StationList::with_capacity(4);
        for offset in 0..4 {
            assert!(list.insert(handle(offset)));
        }
        assert!(list.remove(handle(1)));
        assert_eq!(list.members(), [handle(0), handle(3), handle(2)]);
        // The moved member can still be found and removed.
        assert!(list.contains(handle(3)));
        assert!(list.remove(handle(3)));
        assert_eq!(list.members(), [handle(0), handle(2)]);
        assert!(!list.contains(handle(1)));

        // Another generation of the same record isn't a member.
        let stale = StationHandle {
            offset: 0,
            generation: 1,
        };
        assert!(!list.contains(stale));
        assert!(!list.remove(stale));
        assert!(!list.insert(stale));
        assert_eq!(list.count(), 2);

        // Offsets outside the list are rejected.
        assert!(!list.insert(handle(4)));
    }

    #[test]
    fn aids_are_reused_lowest_first() {
        let mut aids = AidTable::new(3);
        assert_eq!(aids.assign(handle(0)), Some(1));
        assert_eq!(aids.assign(handle(1)), Some(2));
        assert_eq!(aids.assign(handle(2)), Some(3));
        assert_eq!(aids.assign(handle(3)), None);

        // Only the owner can release an association ID.
        assert!(!aids.release(2, handle(0)));
        assert!(aids.release(2, handle(1)));
        assert_eq!(aids.get(2), None);
        assert_eq!(aids.assign(handle(3)), Some(2));
        assert_eq!(aids.get(2), Some(handle(3)));
        assert!(!aids.release(0, handle(3)));
    }
}
