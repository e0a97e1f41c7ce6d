use core::{fmt, ops::Deref};

use macro_bits::check_bit;

/// Number of buckets in the station hash index.
///
/// This must be a power of two, since the hash is masked into the bucket range.
pub const HASH_BUCKET_COUNT: usize = 32;

/// The all-ones broadcast address, which is reserved for the broadcast pseudo-station.
pub const BROADCAST: MacAddress = MacAddress::new([0xff; 6]);

/// A 48 bit IEEE 802 hardware address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);
impl MacAddress {
    pub const fn new(address: [u8; 6]) -> Self {
        Self(address)
    }
    /// Check if the group bit of the first octet is set.
    pub fn is_multicast(&self) -> bool {
        check_bit!(self.0[0], 1)
    }
    pub fn is_broadcast(&self) -> bool {
        *self == BROADCAST
    }
    /// Returns the address under which the station is indexed.
    ///
    /// All group addresses are attributed to the broadcast pseudo-station.
    pub fn normalized(&self) -> Self {
        if self.is_multicast() {
            BROADCAST
        } else {
            *self
        }
    }
    /// Fold the address into a bucket of the hash index.
    pub fn bucket_index(&self) -> usize {
        let mut x = self.0[0] as usize;
        for byte in &self.0[1..] {
            x = (x << 2) ^ *byte as usize;
        }
        x ^= x >> 8;
        x & (HASH_BUCKET_COUNT - 1)
    }
}
impl Deref for MacAddress {
    type Target = [u8; 6];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl From<[u8; 6]> for MacAddress {
    fn from(value: [u8; 6]) -> Self {
        Self(value)
    }
}
impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}
impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
#[cfg(feature = "defmt")]
impl defmt::Format for MacAddress {
    fn format(&self, fmt: defmt::Formatter) {
        let [a, b, c, d, e, g] = self.0;
        defmt::write!(
            fmt,
            "{=u8:02x}:{=u8:02x}:{=u8:02x}:{=u8:02x}:{=u8:02x}:{=u8:02x}",
            a,
            b,
            c,
            d,
            e,
            g
        )
    }
}
