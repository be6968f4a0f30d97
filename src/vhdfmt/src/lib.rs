//! VHD sparse-image format engine.
//!
//! Parses, validates and mutates the on-disk structures of a VHD file
//! (footer, dynamic header, BAT, block bitmaps, batmap, parent locators),
//! resolves differencing chains, and carries the at-rest encryption layer.
//! All metadata I/O goes through sector-aligned buffers so images opened
//! with O_DIRECT behave.

use nix::errno::Errno;
use thiserror::Error;

pub mod bitmap;
pub mod buf;
pub mod chain;
pub mod check;
pub mod create;
pub mod crypto;
pub mod journal;
pub mod ondisk;

mod context;

pub use context::{OpenFlags, VhdContext};
pub use ondisk::{
    Batmap, BatmapHeader, DiskType, Footer, Geometry, Header, Keyhash, ParentLocator, PlatCode,
};

pub const VHD_SECTOR_SIZE: u64 = 512;
pub const VHD_SECTOR_SHIFT: u32 = 9;

/// BAT sentinel for an unallocated block.
pub const DD_BLK_UNUSED: u32 = 0xffff_ffff;

/// Default block size: 2 MiB.
pub const DD_BLOCKSIZE_DEFAULT: u32 = 0x0020_0000;

/// Poison byte written over a killed primary footer.
pub const FOOTER_POISON: u8 = 0xc7;

/// How far in the future a timestamp may lie before we call it invalid;
/// covers clock skew against NFS servers.
pub const TIMESTAMP_MAX_SLACK: u32 = 1800;

pub const fn secs_round_up(bytes: u64) -> u64 {
    (bytes + VHD_SECTOR_SIZE - 1) >> VHD_SECTOR_SHIFT
}

pub const fn sectors_to_bytes(secs: u64) -> u64 {
    secs << VHD_SECTOR_SHIFT
}

#[derive(Debug, Error)]
pub enum VhdError {
    #[error("invalid {kind}: {reason}")]
    InvalidFormat { kind: &'static str, reason: String },

    #[error("{0} checksum mismatch")]
    ChecksumMismatch(&'static str),

    #[error("image has no parent")]
    NoParent,

    #[error("no encryption key available")]
    NoKey,

    #[error("encryption key does not match image keyhash")]
    KeyMismatch,

    #[error("key file present but image carries no keyhash")]
    UnexpectedKey,

    #[error("image is disabled pending a metadata update")]
    Disabled,

    #[error("sector {0} out of range")]
    Range(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VhdError {
    pub fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        VhdError::InvalidFormat {
            kind,
            reason: reason.into(),
        }
    }

    /// Map onto the errno surfaced by the CLI tools.
    pub fn errno(&self) -> Errno {
        match self {
            VhdError::InvalidFormat { .. } | VhdError::ChecksumMismatch(_) => Errno::EINVAL,
            VhdError::NoParent => Errno::ENOENT,
            VhdError::NoKey => Errno::ENOKEY,
            VhdError::KeyMismatch => Errno::ENOKEY,
            VhdError::UnexpectedKey => Errno::EACCES,
            VhdError::Disabled => Errno::EACCES,
            VhdError::Range(_) => Errno::ERANGE,
            VhdError::Io(e) => e
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, VhdError>;
