use embassy_time::Duration;

use crate::{
    acl::DEFAULT_ACL_CAPACITY,
    reorder::{DEFAULT_REORDER_TIMEOUT, MAX_WINDOW_SIZE},
};

/// The default number of station records, including the broadcast pseudo-station.
pub const DEFAULT_STATION_COUNT: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Parameters of a [StationPool](crate::StationPool).
pub struct PoolConfig {
    /// The number of station records. This is fixed for the lifetime of the pool.
    pub capacity: usize,
    /// The reorder window used, when a session doesn't specify one.
    pub reorder_window: u16,
    /// How long frames are held back waiting for a gap to close.
    pub reorder_timeout: Duration,
    /// Liveness sweeps before a station stuck in authentication is dropped.
    pub auth_timeout: u8,
    /// Liveness sweeps without activity, before an associated station is probed.
    pub expire_timeout: u8,
    /// Keep-alive probes sent to a silent station, before it's considered gone.
    pub keep_alive_retries: u8,
    /// The number of entries in the access control list.
    pub acl_capacity: usize,
}
impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_STATION_COUNT,
            reorder_window: MAX_WINDOW_SIZE,
            reorder_timeout: DEFAULT_REORDER_TIMEOUT,
            auth_timeout: 3,
            expire_timeout: 3,
            keep_alive_retries: 3,
            acl_capacity: DEFAULT_ACL_CAPACITY,
        }
    }
}
