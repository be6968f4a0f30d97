//! On-disk structures and their big-endian codec.
//!
//! In-memory representations stay native-endian; `OnDisk::read_be` swaps on
//! ingress and `OnDisk::write_be` swaps into a caller-provided buffer on
//! egress, so validators and encoders share one layout definition.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::{secs_round_up, Result, VhdError};

pub const HD_COOKIE: &[u8; 8] = b"conectix";
pub const DD_COOKIE: &[u8; 8] = b"cxsparse";
pub const BATMAP_COOKIE: &[u8; 8] = b"tdbatmap";

pub const HD_TEMPORARY: u32 = 0x0000_0001;
/// Spec: must always be set.
pub const HD_RESERVED: u32 = 0x0000_0002;

pub const HD_FF_VERSION: u32 = 0x0001_0000;
pub const DD_VERSION: u32 = 0x0001_0000;

/// `hdr_ver` value written while a journalled metadata update is in flight.
pub const DD_VERSION_DISABLED: u32 = 0xffff_ffff;

pub const fn vhd_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

/// Creator tag written by this implementation and its ancestors.
pub const TAP_CREATOR_APP: &[u8; 4] = b"tap\0";
pub const VHD_CURRENT_VERSION: u32 = vhd_version(1, 3);

pub const BATMAP_VERSION: u32 = vhd_version(1, 2);

/// VHD timestamps count seconds since 2000-01-01T00:00:00Z.
const VHD_EPOCH_START: u64 = 946_684_800;

pub const FOOTER_SIZE: usize = 512;
pub const HEADER_SIZE: usize = 1024;
pub const LOCATOR_SIZE: usize = 24;
pub const PARENT_LOCATORS: usize = 8;
pub const BATMAP_HEADER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    None,
    Fixed,
    Dynamic,
    Diff,
    Reserved(u32),
}

impl DiskType {
    pub fn from_raw(raw: u32) -> DiskType {
        match raw {
            0 => DiskType::None,
            2 => DiskType::Fixed,
            3 => DiskType::Dynamic,
            4 => DiskType::Diff,
            other => DiskType::Reserved(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            DiskType::None => 0,
            DiskType::Fixed => 2,
            DiskType::Dynamic => 3,
            DiskType::Diff => 4,
            DiskType::Reserved(other) => other,
        }
    }

    pub fn is_sparse(self) -> bool {
        matches!(self, DiskType::Dynamic | DiskType::Diff)
    }

    pub fn name(self) -> &'static str {
        match self {
            DiskType::None => "None",
            DiskType::Fixed => "Fixed hard disk",
            DiskType::Dynamic => "Dynamic hard disk",
            DiskType::Diff => "Differencing hard disk",
            DiskType::Reserved(_) => "Reserved (deprecated)",
        }
    }
}

/// Parent locator platform codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatCode(pub u32);

impl PlatCode {
    pub const NONE: PlatCode = PlatCode(0);
    pub const WI2R: PlatCode = PlatCode(0x5769_3272); // deprecated
    pub const WI2K: PlatCode = PlatCode(0x5769_326b); // deprecated
    pub const W2RU: PlatCode = PlatCode(0x5732_7275); // Windows relative path, UTF-16
    pub const W2KU: PlatCode = PlatCode(0x5732_6b75); // Windows absolute path, UTF-16
    pub const MAC: PlatCode = PlatCode(0x4d61_6320); // MacOS alias blob
    pub const MACX: PlatCode = PlatCode(0x4d61_6358); // file:// URL, UTF-8

    pub fn is_known(self) -> bool {
        matches!(
            self,
            PlatCode::NONE
                | PlatCode::WI2R
                | PlatCode::WI2K
                | PlatCode::W2RU
                | PlatCode::W2KU
                | PlatCode::MAC
                | PlatCode::MACX
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            PlatCode::NONE => "PLAT_CODE_NONE",
            PlatCode::WI2R => "PLAT_CODE_WI2R",
            PlatCode::WI2K => "PLAT_CODE_WI2K",
            PlatCode::W2RU => "PLAT_CODE_W2RU",
            PlatCode::W2KU => "PLAT_CODE_W2KU",
            PlatCode::MAC => "PLAT_CODE_MAC",
            PlatCode::MACX => "PLAT_CODE_MACX",
            _ => "unknown",
        }
    }
}

/// CHS geometry triple packed as (cylinders:16, heads:8, spt:8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub spt: u8,
}

impl Geometry {
    pub fn from_raw(raw: u32) -> Geometry {
        Geometry {
            cylinders: (raw >> 16) as u16,
            heads: (raw >> 8) as u8,
            spt: raw as u8,
        }
    }

    pub fn to_raw(self) -> u32 {
        ((self.cylinders as u32) << 16) | ((self.heads as u32) << 8) | self.spt as u32
    }

    /// Geometry for a given size in bytes, from the algorithm in the VHD
    /// specification appendix.
    pub fn for_size(size: u64) -> Geometry {
        let mut secs = secs_round_up(size);

        if secs > 65535 * 16 * 255 {
            secs = 65535 * 16 * 255;
        }

        let (mut spt, mut heads, mut cth);
        if secs >= 65535 * 16 * 63 {
            spt = 255;
            cth = secs / spt;
            heads = 16;
        } else {
            spt = 17;
            cth = secs / spt;
            heads = (cth + 1023) / 1024;

            if heads < 4 {
                heads = 4;
            }

            if cth >= heads * 1024 || heads > 16 {
                spt = 31;
                cth = secs / spt;
                heads = 16;
            }

            if cth >= heads * 1024 {
                spt = 63;
                cth = secs / spt;
                heads = 16;
            }
        }

        Geometry {
            cylinders: (cth / heads) as u16,
            heads: heads as u8,
            spt: spt as u8,
        }
    }
}

/// Current time in the VHD epoch.
pub fn vhd_time_now() -> u32 {
    vhd_time(SystemTime::now())
}

pub fn vhd_time(t: SystemTime) -> u32 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs().saturating_sub(VHD_EPOCH_START) as u32,
        Err(_) => 0,
    }
}

/// One's-complement checksum: sum of unsigned bytes with the checksum field
/// zeroed, inverted.
pub fn ones_checksum(bytes: &[u8], checksum_field: std::ops::Range<usize>) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in bytes.iter().enumerate() {
        if checksum_field.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

/// Checksum of a raw payload with no embedded checksum field (the batmap).
pub fn payload_checksum(bytes: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for b in bytes {
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_be_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_be_bytes());
}

/// Big-endian on-disk record codec.
pub trait OnDisk: Sized {
    const SIZE: usize;

    /// Decode from a buffer of at least `SIZE` bytes.
    fn read_be(buf: &[u8]) -> Self;

    /// Encode into a buffer of at least `SIZE` bytes.
    fn write_be(&self, out: &mut [u8]);
}

/// The generic disk footer, present on every VHD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub cookie: [u8; 8],
    pub features: u32,
    pub ff_version: u32,
    /// Absolute offset of the dynamic header; all-ones for fixed disks.
    pub data_offset: u64,
    pub timestamp: u32,
    pub crtr_app: [u8; 4],
    pub crtr_ver: u32,
    pub crtr_os: u32,
    pub orig_size: u64,
    pub curr_size: u64,
    pub geometry: u32,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub uuid: Uuid,
    pub saved: u8,
    /// tapdisk extension; excluded from the checksum by tap 0.1/1.1 tools.
    pub hidden: u8,
    pub reserved: [u8; 426],
}

impl Default for Footer {
    fn default() -> Footer {
        Footer {
            cookie: *HD_COOKIE,
            features: HD_RESERVED,
            ff_version: HD_FF_VERSION,
            data_offset: u64::MAX,
            timestamp: 0,
            crtr_app: *TAP_CREATOR_APP,
            crtr_ver: VHD_CURRENT_VERSION,
            crtr_os: 0,
            orig_size: 0,
            curr_size: 0,
            geometry: 0,
            disk_type: DiskType::None,
            checksum: 0,
            uuid: Uuid::nil(),
            saved: 0,
            hidden: 0,
            reserved: [0u8; 426],
        }
    }
}

impl OnDisk for Footer {
    const SIZE: usize = FOOTER_SIZE;

    fn read_be(buf: &[u8]) -> Footer {
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&buf[0..8]);
        let mut crtr_app = [0u8; 4];
        crtr_app.copy_from_slice(&buf[28..32]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[68..84]);
        let mut reserved = [0u8; 426];
        reserved.copy_from_slice(&buf[86..512]);

        Footer {
            cookie,
            features: get_u32(buf, 8),
            ff_version: get_u32(buf, 12),
            data_offset: get_u64(buf, 16),
            timestamp: get_u32(buf, 24),
            crtr_app,
            crtr_ver: get_u32(buf, 32),
            crtr_os: get_u32(buf, 36),
            orig_size: get_u64(buf, 40),
            curr_size: get_u64(buf, 48),
            geometry: get_u32(buf, 56),
            disk_type: DiskType::from_raw(get_u32(buf, 60)),
            checksum: get_u32(buf, 64),
            uuid: Uuid::from_bytes(uuid),
            saved: buf[84],
            hidden: buf[85],
            reserved,
        }
    }

    fn write_be(&self, out: &mut [u8]) {
        out[..FOOTER_SIZE].fill(0);
        out[0..8].copy_from_slice(&self.cookie);
        put_u32(out, 8, self.features);
        put_u32(out, 12, self.ff_version);
        put_u64(out, 16, self.data_offset);
        put_u32(out, 24, self.timestamp);
        out[28..32].copy_from_slice(&self.crtr_app);
        put_u32(out, 32, self.crtr_ver);
        put_u32(out, 36, self.crtr_os);
        put_u64(out, 40, self.orig_size);
        put_u64(out, 48, self.curr_size);
        put_u32(out, 56, self.geometry);
        put_u32(out, 60, self.disk_type.to_raw());
        put_u32(out, 64, self.checksum);
        out[68..84].copy_from_slice(self.uuid.as_bytes());
        out[84] = self.saved;
        out[85] = self.hidden;
        out[86..512].copy_from_slice(&self.reserved);
    }
}

impl Footer {
    pub fn compute_checksum(&self) -> u32 {
        let mut buf = [0u8; FOOTER_SIZE];
        self.write_be(&mut buf);
        ones_checksum(&buf, 64..68)
    }

    pub fn set_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn is_tap_creator(&self) -> bool {
        &self.crtr_app[..3] == b"tap"
    }

    /// Checksum test with the `hidden`-byte compatibility quirk: tap 0.1 and
    /// 1.1 computed the checksum before the field existed.
    pub fn checksum_valid(&self) -> bool {
        if self.compute_checksum() == self.checksum {
            return true;
        }

        if self.hidden != 0
            && self.is_tap_creator()
            && (self.crtr_ver == vhd_version(0, 1) || self.crtr_ver == vhd_version(1, 1))
        {
            let mut quirked = self.clone();
            quirked.hidden = 0;
            return quirked.compute_checksum() == self.checksum;
        }

        false
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::from_raw(self.geometry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParentLocator {
    pub code: PlatCode,
    /// Sectors reserved for the locator data. Some creators wrote bytes here
    /// instead; `data_size_bytes` untangles that.
    pub data_space: u32,
    pub data_len: u32,
    pub res: u32,
    pub data_offset: u64,
}

impl Default for PlatCode {
    fn default() -> PlatCode {
        PlatCode::NONE
    }
}

impl OnDisk for ParentLocator {
    const SIZE: usize = LOCATOR_SIZE;

    fn read_be(buf: &[u8]) -> ParentLocator {
        ParentLocator {
            code: PlatCode(get_u32(buf, 0)),
            data_space: get_u32(buf, 4),
            data_len: get_u32(buf, 8),
            res: get_u32(buf, 12),
            data_offset: get_u64(buf, 16),
        }
    }

    fn write_be(&self, out: &mut [u8]) {
        put_u32(out, 0, self.code.0);
        put_u32(out, 4, self.data_space);
        put_u32(out, 8, self.data_len);
        put_u32(out, 12, self.res);
        put_u64(out, 16, self.data_offset);
    }
}

impl ParentLocator {
    /// Size in bytes of the on-disk locator data region. `data_space` should
    /// be in sectors, but some tools stored bytes.
    pub fn data_size_bytes(&self) -> Result<u64> {
        let space = self.data_space as u64;
        if space < crate::VHD_SECTOR_SIZE {
            Ok(space << crate::VHD_SECTOR_SHIFT)
        } else if space % crate::VHD_SECTOR_SIZE == 0 {
            Ok(space)
        } else {
            Err(VhdError::invalid(
                "parent locator",
                format!("bad data_space {:#x}", self.data_space),
            ))
        }
    }

    pub fn is_zero(&self) -> bool {
        self.code == PlatCode::NONE
            && self.data_space == 0
            && self.data_len == 0
            && self.res == 0
            && self.data_offset == 0
    }
}

/// The dynamic disk header of sparse and differencing images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub cookie: [u8; 8],
    /// Unused; all-ones.
    pub data_offset: u64,
    pub table_offset: u64,
    pub hdr_ver: u32,
    pub max_bat_size: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub prt_uuid: Uuid,
    pub prt_ts: u32,
    pub res1: u32,
    pub prt_name: [u8; 512],
    pub loc: [ParentLocator; PARENT_LOCATORS],
    pub res2: [u8; 256],
}

impl Default for Header {
    fn default() -> Header {
        Header {
            cookie: *DD_COOKIE,
            data_offset: u64::MAX,
            table_offset: 0,
            hdr_ver: DD_VERSION,
            max_bat_size: 0,
            block_size: DD_BLOCKSIZE_DEFAULT_RAW,
            checksum: 0,
            prt_uuid: Uuid::nil(),
            prt_ts: 0,
            res1: 0,
            prt_name: [0u8; 512],
            loc: [ParentLocator::default(); PARENT_LOCATORS],
            res2: [0u8; 256],
        }
    }
}

const DD_BLOCKSIZE_DEFAULT_RAW: u32 = crate::DD_BLOCKSIZE_DEFAULT;

impl OnDisk for Header {
    const SIZE: usize = HEADER_SIZE;

    fn read_be(buf: &[u8]) -> Header {
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&buf[0..8]);
        let mut prt_uuid = [0u8; 16];
        prt_uuid.copy_from_slice(&buf[40..56]);
        let mut prt_name = [0u8; 512];
        prt_name.copy_from_slice(&buf[64..576]);
        let mut res2 = [0u8; 256];
        res2.copy_from_slice(&buf[768..1024]);

        let mut loc = [ParentLocator::default(); PARENT_LOCATORS];
        for (i, slot) in loc.iter_mut().enumerate() {
            *slot = ParentLocator::read_be(&buf[576 + i * LOCATOR_SIZE..]);
        }

        Header {
            cookie,
            data_offset: get_u64(buf, 8),
            table_offset: get_u64(buf, 16),
            hdr_ver: get_u32(buf, 24),
            max_bat_size: get_u32(buf, 28),
            block_size: get_u32(buf, 32),
            checksum: get_u32(buf, 36),
            prt_uuid: Uuid::from_bytes(prt_uuid),
            prt_ts: get_u32(buf, 56),
            res1: get_u32(buf, 60),
            prt_name,
            loc,
            res2,
        }
    }

    fn write_be(&self, out: &mut [u8]) {
        out[..HEADER_SIZE].fill(0);
        out[0..8].copy_from_slice(&self.cookie);
        put_u64(out, 8, self.data_offset);
        put_u64(out, 16, self.table_offset);
        put_u32(out, 24, self.hdr_ver);
        put_u32(out, 28, self.max_bat_size);
        put_u32(out, 32, self.block_size);
        put_u32(out, 36, self.checksum);
        out[40..56].copy_from_slice(self.prt_uuid.as_bytes());
        put_u32(out, 56, self.prt_ts);
        put_u32(out, 60, self.res1);
        out[64..576].copy_from_slice(&self.prt_name);
        for (i, slot) in self.loc.iter().enumerate() {
            slot.write_be(&mut out[576 + i * LOCATOR_SIZE..576 + (i + 1) * LOCATOR_SIZE]);
        }
        out[768..1024].copy_from_slice(&self.res2);
    }
}

impl Header {
    pub fn compute_checksum(&self) -> u32 {
        let mut buf = [0u8; HEADER_SIZE];
        self.write_be(&mut buf);
        ones_checksum(&buf, 36..40)
    }

    pub fn set_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn checksum_valid(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    /// Decode the UTF-16 parent name. Big-endian per the VHD spec, but a BOM
    /// is honoured either way.
    pub fn parent_name(&self) -> Result<String> {
        let raw = &self.prt_name;
        let mut units = Vec::with_capacity(raw.len() / 2);
        let mut le = false;
        let mut start = 0;

        if raw[0] == 0xff && raw[1] == 0xfe {
            le = true;
            start = 2;
        } else if raw[0] == 0xfe && raw[1] == 0xff {
            start = 2;
        }

        for pair in raw[start..].chunks_exact(2) {
            let unit = if le {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            };
            if unit == 0 {
                break;
            }
            units.push(unit);
        }

        String::from_utf16(&units)
            .map_err(|_| VhdError::invalid("header", "undecodable parent name"))
    }

    pub fn set_parent_name(&mut self, name: &str) -> Result<()> {
        let mut raw = [0u8; 512];
        let mut off = 0;
        for unit in name.encode_utf16() {
            if off + 2 > raw.len() {
                return Err(VhdError::invalid("header", "parent name too long"));
            }
            raw[off..off + 2].copy_from_slice(&unit.to_be_bytes());
            off += 2;
        }
        self.prt_name = raw;
        Ok(())
    }
}

/// 32-byte-nonce SHA-256 key fingerprint carried in the batmap header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keyhash {
    pub cookie: u8,
    pub nonce: [u8; 32],
    pub hash: [u8; 32],
}

impl Default for Keyhash {
    fn default() -> Keyhash {
        Keyhash {
            cookie: 0,
            nonce: [0u8; 32],
            hash: [0u8; 32],
        }
    }
}

impl Keyhash {
    pub fn is_set(&self) -> bool {
        self.cookie != 0
    }
}

/// Header of the batmap acceleration structure, one sector on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatmapHeader {
    pub cookie: [u8; 8],
    pub batmap_offset: u64,
    /// Size of the map payload in sectors.
    pub batmap_size: u32,
    pub batmap_version: u32,
    /// One's-complement checksum of the map payload.
    pub checksum: u32,
    pub marker: u8,
    pub keyhash: Keyhash,
}

impl Default for BatmapHeader {
    fn default() -> BatmapHeader {
        BatmapHeader {
            cookie: *BATMAP_COOKIE,
            batmap_offset: 0,
            batmap_size: 0,
            batmap_version: BATMAP_VERSION,
            checksum: 0,
            marker: 0,
            keyhash: Keyhash::default(),
        }
    }
}

impl OnDisk for BatmapHeader {
    const SIZE: usize = BATMAP_HEADER_SIZE;

    fn read_be(buf: &[u8]) -> BatmapHeader {
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&buf[0..8]);
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&buf[30..62]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[62..94]);

        BatmapHeader {
            cookie,
            batmap_offset: get_u64(buf, 8),
            batmap_size: get_u32(buf, 16),
            batmap_version: get_u32(buf, 20),
            checksum: get_u32(buf, 24),
            marker: buf[28],
            keyhash: Keyhash {
                cookie: buf[29],
                nonce,
                hash,
            },
        }
    }

    fn write_be(&self, out: &mut [u8]) {
        out[..BATMAP_HEADER_SIZE].fill(0);
        out[0..8].copy_from_slice(&self.cookie);
        put_u64(out, 8, self.batmap_offset);
        put_u32(out, 16, self.batmap_size);
        put_u32(out, 20, self.batmap_version);
        put_u32(out, 24, self.checksum);
        out[28] = self.marker;
        out[29] = self.keyhash.cookie;
        out[30..62].copy_from_slice(&self.keyhash.nonce);
        out[62..94].copy_from_slice(&self.keyhash.hash);
    }
}

/// In-memory batmap: header plus the 1-bit-per-block payload.
#[derive(Debug, Clone)]
pub struct Batmap {
    pub header: BatmapHeader,
    pub map: Vec<u8>,
}

impl Batmap {
    /// Batmap bits are always big-endian-within-byte, independent of the
    /// image's block-bitmap format.
    pub fn test(&self, blk: u32) -> bool {
        crate::bitmap::test_bit_be(&self.map, blk as u64)
    }

    pub fn set(&mut self, blk: u32) {
        crate::bitmap::set_bit_be(&mut self.map, blk as u64);
    }

    pub fn clear(&mut self, blk: u32) {
        crate::bitmap::clear_bit_be(&mut self.map, blk as u64);
    }
}

/// Decode a BAT buffer (big-endian entries) into host order.
pub fn bat_read_be(buf: &[u8], entries: usize) -> Vec<u32> {
    let mut bat = Vec::with_capacity(entries);
    for i in 0..entries {
        bat.push(get_u32(buf, i * 4));
    }
    bat
}

/// Encode one sector's worth (128 entries) of BAT starting at `first`.
pub fn bat_write_sector_be(bat: &[u32], first: usize, out: &mut [u8]) {
    for i in 0..128 {
        let val = bat.get(first + i).copied().unwrap_or(crate::DD_BLK_UNUSED);
        put_u32(out, i * 4, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_checksum_round_trip() {
        let mut f = Footer {
            timestamp: vhd_time_now(),
            orig_size: 8 << 20,
            curr_size: 8 << 20,
            geometry: Geometry::for_size(8 << 20).to_raw(),
            disk_type: DiskType::Fixed,
            uuid: Uuid::new_v4(),
            ..Footer::default()
        };
        f.set_checksum();

        let mut buf = [0u8; FOOTER_SIZE];
        f.write_be(&mut buf);
        let back = Footer::read_be(&buf);

        assert_eq!(back, f);
        assert!(back.checksum_valid());
        assert_eq!(back.compute_checksum(), back.checksum);
    }

    #[test]
    fn footer_hidden_checksum_quirk() {
        let mut f = Footer {
            disk_type: DiskType::Dynamic,
            crtr_ver: vhd_version(0, 1),
            uuid: Uuid::new_v4(),
            ..Footer::default()
        };
        // Old tools computed the checksum before `hidden` existed.
        f.set_checksum();
        f.hidden = 1;
        assert_ne!(f.compute_checksum(), f.checksum);
        assert!(f.checksum_valid());

        // Current creator versions get no such leniency.
        f.crtr_ver = VHD_CURRENT_VERSION;
        assert!(!f.checksum_valid());
    }

    #[test]
    fn header_round_trip_and_parent_name() {
        let mut h = Header {
            table_offset: 1536,
            max_bat_size: 4,
            prt_uuid: Uuid::new_v4(),
            prt_ts: 1234,
            ..Header::default()
        };
        h.set_parent_name("parent.vhd").unwrap();
        h.loc[0] = ParentLocator {
            code: PlatCode::MACX,
            data_space: 1,
            data_len: 19,
            res: 0,
            data_offset: 1536,
        };
        h.set_checksum();

        let mut buf = [0u8; HEADER_SIZE];
        h.write_be(&mut buf);
        let back = Header::read_be(&buf);

        assert_eq!(back, h);
        assert!(back.checksum_valid());
        assert_eq!(back.parent_name().unwrap(), "parent.vhd");
    }

    #[test]
    fn batmap_header_round_trip() {
        let mut hdr = BatmapHeader {
            batmap_offset: 3072,
            batmap_size: 1,
            ..BatmapHeader::default()
        };
        hdr.keyhash.cookie = 1;
        hdr.keyhash.nonce[0] = 0xab;
        hdr.keyhash.hash[31] = 0xcd;

        let mut buf = [0u8; BATMAP_HEADER_SIZE];
        hdr.write_be(&mut buf);
        let back = BatmapHeader::read_be(&buf);
        assert_eq!(back, hdr);
        assert!(back.keyhash.is_set());
    }

    #[test]
    fn geometry_small_disk_branch() {
        let g = Geometry::for_size(8 << 20);
        // 16384 sectors, small-disk branch: spt 17, 4 heads.
        assert_eq!(g.spt, 17);
        assert_eq!(g.heads, 4);
        assert_eq!(g.cylinders as u64, 16384 / 17 / 4);
    }
}
