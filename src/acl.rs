use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex;
use macro_bits::serializable_enum;

use crate::{address::MacAddress, station::Locked, StationError, StationResult};

/// The default number of entries in the access control list.
pub const DEFAULT_ACL_CAPACITY: usize = 16;

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// How the access control list is applied to stations trying to join.
    ///
    /// Values, which don't correspond to one of the modes, behave like [AclMode::Open].
    pub enum AclMode: u8 {
        /// Every station is allowed.
        #[default]
        Open => 0,
        /// Stations are allowed, unless they are on the list.
        DenyListed => 1,
        /// Only stations on the list are allowed.
        AllowListed => 2
    }
}

/// The outcome of an access check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AclVerdict {
    Allow,
    Deny,
}

/// An entry of the access control list.
///
/// Entries aren't removed, but invalidated, so the list never has to be compacted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AclEntry {
    pub address: MacAddress,
    pub valid: bool,
}

struct AclState {
    mode: AclMode,
    entries: Vec<AclEntry>,
    capacity: usize,
}
impl AclState {
    fn entry_mut(&mut self, address: MacAddress) -> Option<&mut AclEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.address == address)
    }
}

/// Admission control by hardware address.
pub struct AccessControlList {
    state: Locked<AclState>,
}
impl AccessControlList {
    /// Create an empty list in [AclMode::Open], which holds at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: blocking_mutex::Mutex::new(RefCell::new(AclState {
                mode: AclMode::Open,
                entries: Vec::with_capacity(capacity),
                capacity,
            })),
        }
    }
    pub fn mode(&self) -> AclMode {
        self.state.lock(|state| state.borrow().mode)
    }
    pub fn set_mode(&self, mode: AclMode) {
        debug!("Setting ACL mode to {}.", mode.into_bits());
        self.state.lock(|state| state.borrow_mut().mode = mode);
    }
    /// Add a valid entry for the address.
    ///
    /// An existing entry for the address is revalidated. Otherwise an invalidated entry is
    /// reused, before the list is grown.
    pub fn add(&self, address: MacAddress) -> StationResult<()> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if let Some(entry) = state.entry_mut(address) {
                entry.valid = true;
                return Ok(());
            }
            let new_entry = AclEntry {
                address,
                valid: true,
            };
            if let Some(entry) = state.entries.iter_mut().find(|entry| !entry.valid) {
                *entry = new_entry;
            } else if state.entries.len() < state.capacity {
                state.entries.push(new_entry);
            } else {
                warn!("ACL is full, can't add {:?}.", address);
                return Err(StationError::ResourceExhausted);
            }
            Ok(())
        })
    }
    /// Invalidate the entry for the address.
    ///
    /// Returns `false`, if there was no valid entry.
    pub fn remove(&self, address: MacAddress) -> bool {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.entry_mut(address) {
                Some(entry) if entry.valid => {
                    entry.valid = false;
                    true
                }
                _ => false,
            }
        })
    }
    /// Toggle the validity of an existing entry.
    pub fn set_valid(&self, address: MacAddress, valid: bool) -> StationResult<()> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let entry = state.entry_mut(address).ok_or(StationError::NotFound)?;
            entry.valid = valid;
            Ok(())
        })
    }
    /// Drop all entries. The mode is left untouched.
    pub fn clear(&self) {
        self.state.lock(|state| state.borrow_mut().entries.clear());
    }
    /// A copy of all entries, including invalidated ones.
    pub fn entries(&self) -> Vec<AclEntry> {
        self.state.lock(|state| state.borrow().entries.clone())
    }
    /// Decide whether the station may join.
    pub fn check(&self, address: MacAddress) -> AclVerdict {
        let (mode, matched) = self.state.lock(|state| {
            let state = state.borrow();
            let matched = state
                .entries
                .iter()
                .any(|entry| entry.valid && entry.address == address);
            (state.mode, matched)
        });
        let allowed = match mode {
            AclMode::DenyListed => !matched,
            AclMode::AllowListed => matched,
            _ => true,
        };
        if allowed {
            AclVerdict::Allow
        } else {
            trace!("ACL denied {:?}.", address);
            AclVerdict::Deny
        }
    }
}
impl Default for AccessControlList {
    fn default() -> Self {
        Self::new(DEFAULT_ACL_CAPACITY)
    }
}
