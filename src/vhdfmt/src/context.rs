//! An open VHD image and its metadata I/O.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::bitmap::BitmapFormat;
use crate::buf::AlignedBuf;
use crate::ondisk::{
    bat_read_be, bat_write_sector_be, vhd_version, Batmap, BatmapHeader, Footer, Header,
    Keyhash, OnDisk, ParentLocator, BATMAP_COOKIE, DD_COOKIE, DD_VERSION, DD_VERSION_DISABLED,
    FOOTER_SIZE, HD_COOKIE, HEADER_SIZE,
};
use crate::{
    secs_round_up, sectors_to_bytes, Result, VhdError, DD_BLK_UNUSED, FOOTER_POISON,
    VHD_SECTOR_SHIFT, VHD_SECTOR_SIZE,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY          = 1 << 0;
        const QUIET           = 1 << 1;
        const STRICT          = 1 << 2;
        const QUERY           = 1 << 3;
        const NO_CACHE        = 1 << 4;
        const IGNORE_DISABLED = 1 << 5;
        const CACHED          = 1 << 6;
        const FAST            = 1 << 7;
        const THIN            = 1 << 8;
    }
}

pub struct VhdContext {
    file: File,
    path: PathBuf,
    flags: OpenFlags,
    o_direct: bool,
    wrote: bool,

    pub footer: Footer,
    pub header: Header,
    pub bat: Vec<u32>,
    pub batmap: Option<Batmap>,

    /// Sectors per block.
    pub spb: u32,
    /// Sectors per page.
    pub spp: u32,
    /// Block bitmap size in sectors.
    pub bm_secs: u32,
    /// First sector available for new block allocation.
    pub next_db: u64,

    pub bitmap_format: BitmapFormat,
    pub primary_footer_missing: bool,
}

impl VhdContext {
    pub fn open(path: impl AsRef<Path>, mut flags: OpenFlags) -> Result<VhdContext> {
        let path = path.as_ref().to_path_buf();

        if flags.contains(OpenFlags::QUERY) {
            flags |= OpenFlags::QUIET | OpenFlags::RDONLY | OpenFlags::NO_CACHE;
        }

        let rdonly = flags.contains(OpenFlags::RDONLY);
        let want_direct = !flags.intersects(OpenFlags::CACHED | OpenFlags::FAST);

        let mut opts = OpenOptions::new();
        opts.read(true).write(!rdonly);
        if want_direct {
            opts.custom_flags(libc::O_DIRECT);
        }

        let (file, o_direct) = match opts.open(&path) {
            Ok(f) => (f, want_direct),
            Err(e) if want_direct && e.raw_os_error() == Some(libc::EINVAL) => {
                if !flags.contains(OpenFlags::QUIET) {
                    warn!(path = %path.display(), "direct I/O unsupported, falling back");
                }
                let f = OpenOptions::new().read(true).write(!rdonly).open(&path)?;
                (f, false)
            }
            Err(e) => return Err(e.into()),
        };

        let mut ctx = VhdContext {
            file,
            path,
            flags,
            o_direct,
            wrote: false,
            footer: Footer::default(),
            header: Header::default(),
            bat: Vec::new(),
            batmap: None,
            spb: 1,
            spp: 1,
            bm_secs: 0,
            next_db: 0,
            bitmap_format: BitmapFormat::BigEndian,
            primary_footer_missing: false,
        };

        ctx.read_footer()?;

        if ctx.footer.disk_type.is_sparse() {
            ctx.read_header()?;

            ctx.spp = (page_size() >> VHD_SECTOR_SHIFT) as u32;
            ctx.spb = ctx.header.block_size >> VHD_SECTOR_SHIFT;
            ctx.bm_secs = secs_round_up(ctx.spb as u64 >> 3) as u32;

            if !flags.contains(OpenFlags::NO_CACHE) {
                ctx.read_batmap()?;
                ctx.read_bat()?;
            }
        }

        ctx.bitmap_format = if ctx.footer.is_tap_creator() && ctx.footer.crtr_ver == vhd_version(0, 1)
        {
            BitmapFormat::LittleEndian
        } else {
            BitmapFormat::BigEndian
        };

        if flags.contains(OpenFlags::STRICT) && !rdonly {
            ctx.kill_primary_footer()?;
        }

        debug!(
            path = %ctx.path.display(),
            size = ctx.footer.curr_size,
            kind = ctx.footer.disk_type.name(),
            "opened vhd"
        );

        Ok(ctx)
    }

    /// Flush metadata and release the image. Rewrites the primary footer if
    /// we tombstoned it on open or wrote data since.
    pub fn close(self) -> Result<()> {
        if !self.flags.contains(OpenFlags::RDONLY)
            && (self.flags.contains(OpenFlags::STRICT) || self.wrote)
        {
            self.write_primary_footer()?;
        }

        self.file.sync_all()?;
        Ok(())
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_sparse(&self) -> bool {
        self.footer.disk_type.is_sparse()
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(OpenFlags::RDONLY)
    }

    /// Note that image data has been modified, so close() rewrites the
    /// primary footer.
    pub fn mark_dirty(&mut self) {
        self.wrote = true;
    }

    pub fn eof(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn bat_entries(&self) -> u32 {
        self.header.max_bat_size
    }

    pub fn bat_entry(&self, blk: u32) -> u32 {
        self.bat
            .get(blk as usize)
            .copied()
            .unwrap_or(DD_BLK_UNUSED)
    }

    pub fn set_bat_entry(&mut self, blk: u32, sector: u32) {
        self.bat[blk as usize] = sector;
    }

    /// Number of blocks implied by the virtual disk size.
    pub fn blocks(&self) -> u64 {
        if !self.is_sparse() || self.header.block_size == 0 {
            return 0;
        }
        self.footer
            .curr_size
            .div_ceil(self.header.block_size as u64)
    }

    /// Sector-aligned read of `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<AlignedBuf> {
        let mut buf = AlignedBuf::zeroed(len);
        match self.file.read_exact_at(&mut buf, offset) {
            Ok(()) => Ok(buf),
            Err(e) if self.o_direct && e.raw_os_error() == Some(libc::EINVAL) => {
                // Unaligned request against an O_DIRECT fd (the 511-byte
                // legacy footer is the usual culprit); retry buffered.
                let plain = File::open(&self.path)?;
                plain.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let buf = AlignedBuf::from_slice(data);
        self.file.write_all_at(&buf, offset)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn read_footer(&mut self) -> Result<()> {
        let eof = self.eof()?;
        if eof < FOOTER_SIZE as u64 {
            return Err(VhdError::invalid("footer", "file too small"));
        }

        let tail = eof % VHD_SECTOR_SIZE;
        let candidate = match tail {
            // Trailing 512-byte footer.
            0 => {
                let buf = self.read_at(eof - FOOTER_SIZE as u64, FOOTER_SIZE)?;
                Some(Footer::read_be(&buf))
            }
            // Pre-2004 images carry a 511-byte footer; the final reserved
            // byte reads as zero.
            511 => {
                let mut padded = [0u8; FOOTER_SIZE];
                let buf = self.read_at(eof - 511, 511)?;
                padded[..511].copy_from_slice(&buf);
                Some(Footer::read_be(&padded))
            }
            _ => {
                return Err(VhdError::invalid(
                    "footer",
                    format!("invalid file size {eof:#x}"),
                ))
            }
        };

        if let Some(footer) = candidate {
            if &footer.cookie == HD_COOKIE && footer.checksum_valid() {
                self.footer = footer;
                return Ok(());
            }

            if footer.cookie[..4] == [FOOTER_POISON; 4] {
                debug!(path = %self.path.display(), "primary footer is tombstoned");
            }
        }

        // Primary is gone; fall back to the backup copy at offset 0.
        let buf = self.read_at(0, FOOTER_SIZE)?;
        let backup = Footer::read_be(&buf);
        if &backup.cookie != HD_COOKIE || !backup.checksum_valid() {
            return Err(VhdError::invalid("footer", "no valid footer found"));
        }

        if self.flags.contains(OpenFlags::STRICT) {
            return Err(VhdError::invalid(
                "footer",
                "primary footer missing and image opened strict",
            ));
        }

        if !self.flags.contains(OpenFlags::QUIET) {
            warn!(
                path = %self.path.display(),
                "primary footer missing; using backup copy from start of file. \
                 This may be crash recovery fallout, or the image may be corrupt"
            );
        }

        self.primary_footer_missing = true;
        self.footer = backup;
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        let buf = self.read_at(self.footer.data_offset, HEADER_SIZE)?;
        let header = Header::read_be(&buf);

        if &header.cookie != DD_COOKIE {
            return Err(VhdError::invalid("header", "invalid cookie"));
        }

        let tolerant = self.flags.contains(OpenFlags::QUERY);

        if header.hdr_ver == DD_VERSION_DISABLED {
            if !self.flags.contains(OpenFlags::IGNORE_DISABLED) && !tolerant {
                return Err(VhdError::Disabled);
            }
        } else if header.hdr_ver != DD_VERSION && !tolerant {
            return Err(VhdError::invalid(
                "header",
                format!("unsupported version {:#x}", header.hdr_ver),
            ));
        }

        if !header.checksum_valid() && !tolerant {
            return Err(VhdError::ChecksumMismatch("header"));
        }

        if !header.block_size.is_power_of_two() && !tolerant {
            return Err(VhdError::invalid(
                "header",
                format!("block size {:#x} not a power of two", header.block_size),
            ));
        }

        self.header = header;
        Ok(())
    }

    /// Byte offset one past the last metadata structure (header, locators,
    /// BAT, batmap); data blocks may not live below this.
    pub fn end_of_headers(&self) -> u64 {
        let mut end = self.footer.data_offset + HEADER_SIZE as u64;

        end = end.max(self.header.table_offset + self.bat_bytes());

        for loc in &self.header.loc {
            if loc.code != crate::PlatCode::NONE {
                let size = loc.data_size_bytes().unwrap_or(0);
                end = end.max(loc.data_offset + size);
            }
        }

        if let Some(batmap) = &self.batmap {
            end = end.max(self.batmap_header_offset() + BatmapHeader::SIZE as u64);
            end = end.max(
                batmap.header.batmap_offset + sectors_to_bytes(batmap.header.batmap_size as u64),
            );
        }

        end
    }

    fn bat_bytes(&self) -> u64 {
        sectors_to_bytes(secs_round_up(self.header.max_bat_size as u64 * 4))
    }

    /// Load the BAT and derive `next_db`.
    pub fn read_bat(&mut self) -> Result<()> {
        let entries = self.header.max_bat_size as usize;
        let buf = self.read_at(self.header.table_offset, self.bat_bytes() as usize)?;
        self.bat = bat_read_be(&buf, entries);

        let mut next_db = secs_round_up(self.end_of_headers());
        for &entry in &self.bat {
            if entry != DD_BLK_UNUSED {
                next_db = next_db.max(entry as u64 + self.spb as u64 + self.bm_secs as u64);
            }
        }

        // Data region of the next block must begin on a page boundary.
        let spp = self.spp as u64;
        let bm = self.bm_secs as u64;
        if (next_db + bm) % spp != 0 {
            next_db += spp - (next_db + bm) % spp;
        }

        self.next_db = next_db;
        debug!(next_db, entries, "read bat");
        Ok(())
    }

    /// Rewrite the whole BAT.
    pub fn write_bat(&self) -> Result<()> {
        let secs = secs_round_up(self.header.max_bat_size as u64 * 4) as usize;
        let mut buf = AlignedBuf::zeroed(secs << VHD_SECTOR_SHIFT);
        for sec in 0..secs {
            bat_write_sector_be(
                &self.bat,
                sec * 128,
                &mut buf[sec << VHD_SECTOR_SHIFT..(sec + 1) << VHD_SECTOR_SHIFT],
            );
        }
        self.file.write_all_at(&buf, self.header.table_offset)?;
        Ok(())
    }

    /// Rewrite just the BAT sector containing `blk`.
    pub fn write_bat_entry(&self, blk: u32) -> Result<()> {
        let first = (blk as usize / 128) * 128;
        let mut buf = AlignedBuf::zeroed(VHD_SECTOR_SIZE as usize);
        bat_write_sector_be(&self.bat, first, &mut buf);
        let offset = self.header.table_offset + first as u64 * 4;
        self.file.write_all_at(&buf, offset)?;
        Ok(())
    }

    pub fn batmap_header_offset(&self) -> u64 {
        sectors_to_bytes(secs_round_up(
            self.header.table_offset + self.header.max_bat_size as u64 * 4,
        ))
    }

    pub fn read_batmap_header(&self) -> Result<Option<BatmapHeader>> {
        if !self.is_sparse() {
            return Ok(None);
        }

        let offset = self.batmap_header_offset();
        let eof = self.eof()?;
        if offset + BatmapHeader::SIZE as u64 > eof {
            return Ok(None);
        }

        let buf = self.read_at(offset, BatmapHeader::SIZE)?;
        let header = BatmapHeader::read_be(&buf);
        if &header.cookie != BATMAP_COOKIE {
            return Ok(None);
        }

        Ok(Some(header))
    }

    pub fn read_batmap(&mut self) -> Result<()> {
        let Some(header) = self.read_batmap_header()? else {
            self.batmap = None;
            return Ok(());
        };

        let size = sectors_to_bytes(header.batmap_size as u64) as usize;
        if size == 0 {
            self.batmap = None;
            return Ok(());
        }

        let buf = self.read_at(header.batmap_offset, size)?;
        self.batmap = Some(Batmap {
            header,
            map: buf.to_vec(),
        });
        Ok(())
    }

    pub fn has_batmap(&self) -> bool {
        self.batmap.is_some()
    }

    pub fn write_batmap_header(&self, header: &BatmapHeader) -> Result<()> {
        let mut buf = AlignedBuf::zeroed(BatmapHeader::SIZE);
        header.write_be(&mut buf);
        self.file.write_all_at(&buf, self.batmap_header_offset())?;
        Ok(())
    }

    /// Write the batmap payload and its header (payload checksum refreshed).
    pub fn write_batmap(&mut self) -> Result<()> {
        let Some(batmap) = self.batmap.as_mut() else {
            return Ok(());
        };

        batmap.header.checksum = crate::ondisk::payload_checksum(&batmap.map);

        let header = batmap.header.clone();
        let payload = AlignedBuf::from_slice(&batmap.map);
        self.file.write_all_at(&payload, header.batmap_offset)?;
        self.write_batmap_header(&header)?;
        Ok(())
    }

    pub fn get_keyhash(&self) -> Result<Option<Keyhash>> {
        if let Some(batmap) = &self.batmap {
            return Ok(Some(batmap.header.keyhash));
        }
        Ok(self.read_batmap_header()?.map(|h| h.keyhash))
    }

    pub fn set_keyhash(&mut self, keyhash: Keyhash) -> Result<()> {
        let Some(mut header) = self.read_batmap_header()? else {
            return Err(VhdError::invalid("batmap", "image has no batmap"));
        };

        header.keyhash = keyhash;
        self.write_batmap_header(&header)?;
        if let Some(batmap) = self.batmap.as_mut() {
            batmap.header.keyhash = keyhash;
        }
        Ok(())
    }

    /// Absolute byte offset of a block's bitmap.
    pub fn bitmap_offset(&self, blk: u32) -> Result<u64> {
        let entry = self.bat_entry(blk);
        if entry == DD_BLK_UNUSED {
            return Err(VhdError::Range(blk as u64));
        }
        Ok(sectors_to_bytes(entry as u64))
    }

    /// Absolute byte offset of a sector within a block's data area.
    pub fn data_offset(&self, blk: u32, sec_in_blk: u32) -> Result<u64> {
        let entry = self.bat_entry(blk);
        if entry == DD_BLK_UNUSED {
            return Err(VhdError::Range(blk as u64));
        }
        Ok(sectors_to_bytes(
            entry as u64 + self.bm_secs as u64 + sec_in_blk as u64,
        ))
    }

    pub fn read_bitmap(&self, blk: u32) -> Result<AlignedBuf> {
        let offset = self.bitmap_offset(blk)?;
        self.read_at(offset, sectors_to_bytes(self.bm_secs as u64) as usize)
    }

    pub fn write_bitmap(&self, blk: u32, map: &[u8]) -> Result<()> {
        let offset = self.bitmap_offset(blk)?;
        self.write_at(offset, map)
    }

    pub fn read_block(&self, blk: u32) -> Result<AlignedBuf> {
        let offset = self.data_offset(blk, 0)?;
        self.read_at(offset, sectors_to_bytes(self.spb as u64) as usize)
    }

    pub fn read_locator_data(&self, loc: &ParentLocator) -> Result<Vec<u8>> {
        let size = loc.data_size_bytes()?;
        let buf = self.read_at(loc.data_offset, size as usize)?;
        Ok(buf[..(loc.data_len as usize).min(buf.len())].to_vec())
    }

    /// Overwrite the trailing footer with a poison pattern so other openers
    /// see the image as in use. The backup copy at offset 0 survives.
    pub fn kill_primary_footer(&mut self) -> Result<()> {
        let eof = self.eof()?;
        let buf = AlignedBuf::filled(FOOTER_SIZE, FOOTER_POISON);
        self.file.write_all_at(&buf, eof - FOOTER_SIZE as u64)?;
        self.wrote = true;
        Ok(())
    }

    /// Byte offset the primary footer belongs at.
    pub fn primary_footer_offset(&self) -> Result<u64> {
        if self.is_sparse() {
            Ok(sectors_to_bytes(self.next_db))
        } else {
            Ok(self.eof()? - FOOTER_SIZE as u64)
        }
    }

    pub fn write_footer_at(&self, footer: &Footer, offset: u64) -> Result<()> {
        let mut out = footer.clone();
        out.set_checksum();
        let mut buf = AlignedBuf::zeroed(FOOTER_SIZE);
        out.write_be(&mut buf);
        self.file.write_all_at(&buf, offset)?;
        Ok(())
    }

    pub fn write_primary_footer(&self) -> Result<()> {
        self.write_footer_at(&self.footer, self.primary_footer_offset()?)
    }

    pub fn write_backup_footer(&self) -> Result<()> {
        self.write_footer_at(&self.footer, 0)
    }

    pub fn write_header(&self) -> Result<()> {
        let mut out = self.header.clone();
        out.set_checksum();
        let mut buf = AlignedBuf::zeroed(HEADER_SIZE);
        out.write_be(&mut buf);
        self.file.write_all_at(&buf, self.footer.data_offset)?;
        Ok(())
    }

    /// The hidden flag lives in the backup footer of sparse images and the
    /// only footer of fixed ones.
    pub fn get_hidden(&self) -> Result<u8> {
        if self.is_sparse() {
            let buf = self.read_at(0, FOOTER_SIZE)?;
            Ok(Footer::read_be(&buf).hidden)
        } else {
            Ok(self.footer.hidden)
        }
    }

    pub fn set_hidden(&mut self, hidden: u8) -> Result<()> {
        self.footer.hidden = hidden;
        self.footer.set_checksum();

        if self.is_sparse() {
            self.write_backup_footer()
        } else {
            self.write_primary_footer()
        }
    }

    /// Restore a valid primary footer and trim trailing garbage.
    pub fn repair(&mut self) -> Result<()> {
        let offset = if self.is_sparse() {
            sectors_to_bytes(self.next_db)
        } else {
            self.eof()? - FOOTER_SIZE as u64
        };

        self.write_footer_at(&self.footer, offset)?;

        let end = offset + FOOTER_SIZE as u64;
        if self.eof()? != end {
            self.file.set_len(end)?;
        }

        Ok(())
    }
}

pub(crate) fn page_size() -> u64 {
    // Safety: sysconf is always callable.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as u64
    }
}

impl std::fmt::Debug for VhdContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhdContext")
            .field("path", &self.path)
            .field("type", &self.footer.disk_type)
            .field("size", &self.footer.curr_size)
            .field("spb", &self.spb)
            .field("next_db", &self.next_db)
            .finish()
    }
}
