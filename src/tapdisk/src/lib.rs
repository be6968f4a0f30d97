//! Request pipeline for userspace virtual block devices.
//!
//! A `Vbd` hosts one image chain (child plus read-only ancestors), owns the
//! AIO queue, and drives per-request state machines through the single
//! threaded event scheduler. Image format engines plug in as variants of
//! [`Driver`].

use nix::errno::Errno;
use thiserror::Error;

pub mod pidfile;
pub mod protocol;
pub mod vbd;
pub mod vhd;

pub use vbd::{Vbd, VbdCallback, VreqId};
pub use vhd::VhdDriver;

/// Ring depth: concurrent top-level requests.
pub const MAX_REQUESTS: usize = 32;
/// Scatter-gather segments per top-level request.
pub const MAX_SEGMENTS_PER_REQ: usize = 11;

pub const SECTOR_SIZE: u64 = vhdfmt::VHD_SECTOR_SIZE;
pub const SECTOR_SHIFT: u32 = vhdfmt::VHD_SECTOR_SHIFT;

#[derive(Debug, Error)]
pub enum TdError {
    #[error("resource temporarily unavailable")]
    Busy,

    #[error("image queue is dead")]
    QueueDead,

    #[error("sector {0} out of range")]
    Range(u64),

    #[error(transparent)]
    Vhd(#[from] vhdfmt::VhdError),

    #[error(transparent)]
    Queue(#[from] aioq::QueueError),

    #[error(transparent)]
    Sched(#[from] sched::SchedError),

    #[error(transparent)]
    Lock(#[from] dotlock::LockError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TdError {
    pub fn errno(&self) -> Errno {
        match self {
            TdError::Busy => Errno::EBUSY,
            TdError::QueueDead => Errno::EIO,
            TdError::Range(_) => Errno::ERANGE,
            TdError::Vhd(e) => e.errno(),
            TdError::Lock(e) => e.errno(),
            TdError::Queue(_) => Errno::EIO,
            TdError::Sched(_) => Errno::EIO,
            TdError::Io(e) => e
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, TdError>;

/// Image drivers as a tagged variant; each arm owns its private state.
pub enum Driver {
    Vhd(VhdDriver),
}

impl Driver {
    pub fn sectors(&self) -> u64 {
        match self {
            Driver::Vhd(d) => d.sectors(),
        }
    }

    pub fn is_diff(&self) -> bool {
        match self {
            Driver::Vhd(d) => d.is_diff(),
        }
    }

    pub fn idle(&self) -> bool {
        match self {
            Driver::Vhd(d) => d.idle(),
        }
    }

    pub fn queue_read(
        &mut self,
        q: &mut aioq::Tqueue,
        sector: u64,
        nr_secs: u32,
        buf: *mut u8,
        origin: u64,
        out: &mut Vec<vhd::DriverEvent>,
    ) {
        match self {
            Driver::Vhd(d) => d.queue_read(q, sector, nr_secs, buf, origin, out),
        }
    }

    pub fn queue_write(
        &mut self,
        q: &mut aioq::Tqueue,
        sector: u64,
        nr_secs: u32,
        buf: *const u8,
        origin: u64,
        out: &mut Vec<vhd::DriverEvent>,
    ) {
        match self {
            Driver::Vhd(d) => d.queue_write(q, sector, nr_secs, buf, origin, out),
        }
    }

    pub fn complete(
        &mut self,
        token: aioq::Token,
        res: i64,
        q: &mut aioq::Tqueue,
        out: &mut Vec<vhd::DriverEvent>,
    ) {
        match self {
            Driver::Vhd(d) => d.complete(token, res, q, out),
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            Driver::Vhd(d) => d.close(),
        }
    }

    pub fn vhd(&self) -> &VhdDriver {
        match self {
            Driver::Vhd(d) => d,
        }
    }

    pub fn vhd_mut(&mut self) -> &mut VhdDriver {
        match self {
            Driver::Vhd(d) => d,
        }
    }
}
