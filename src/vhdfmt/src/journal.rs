//! Journalled bitmap-ordering update.
//!
//! Images written by tap creator 0.1 carry little-endian-within-word block
//! bitmaps. The updater rewrites them in place to the current layout after
//! journalling the metadata prefix and every allocated bitmap, so an
//! interrupted run can be rolled back. The image is disabled (header version
//! poisoned) for the duration; an interrupted update therefore refuses to
//! open without `IGNORE_DISABLED`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::bitmap::convert_le_to_be;
use crate::ondisk::{
    vhd_version, Footer, Header, OnDisk, DD_VERSION, DD_VERSION_DISABLED, FOOTER_SIZE,
};
use crate::{
    secs_round_up, sectors_to_bytes, OpenFlags, Result, VhdContext, VhdError, DD_BLK_UNUSED,
    VHD_SECTOR_SHIFT,
};

pub fn journal_path(image: &Path) -> PathBuf {
    let mut os = image.as_os_str().to_os_string();
    os.push(".journal");
    PathBuf::from(os)
}

/// Does this image still use the legacy bitmap ordering?
pub fn needs_update(ctx: &VhdContext) -> bool {
    ctx.is_sparse() && ctx.footer.is_tap_creator() && ctx.footer.crtr_ver == vhd_version(0, 1)
}

struct UpdateCtx {
    path: PathBuf,
    journal: PathBuf,
    footer: Footer,
    header: Header,
    bat: Vec<u32>,
    spb: u32,
}

impl UpdateCtx {
    fn load(path: &Path) -> Result<UpdateCtx> {
        let ctx = VhdContext::open(
            path,
            OpenFlags::RDONLY | OpenFlags::QUIET | OpenFlags::IGNORE_DISABLED,
        )?;

        Ok(UpdateCtx {
            path: path.to_path_buf(),
            journal: journal_path(path),
            footer: ctx.footer.clone(),
            header: ctx.header.clone(),
            bat: ctx.bat.clone(),
            spb: ctx.spb,
        })
    }

    fn bitmap_bytes(&self) -> usize {
        sectors_to_bytes(secs_round_up((self.spb as u64) >> 3).max(1)) as usize
    }

    fn metadata_prefix_bytes(&self) -> u64 {
        sectors_to_bytes(secs_round_up(
            self.header.table_offset + self.header.max_bat_size as u64 * 4,
        ))
    }

    fn is_disabled(&self) -> bool {
        self.header.hdr_ver == DD_VERSION_DISABLED
    }

    /// Journal the metadata prefix (backup footer, header, locators, BAT)
    /// plus every allocated bitmap at its native offset.
    fn create_journal(&self) -> Result<()> {
        let image = File::open(&self.path)?;
        let journal = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.journal)?;

        let prefix = self.metadata_prefix_bytes() as usize;
        let mut buf = vec![0u8; prefix];
        image.read_exact_at(&mut buf, 0)?;
        journal.write_all_at(&buf, 0)?;

        let mut bm = vec![0u8; self.bitmap_bytes()];
        for &entry in &self.bat {
            if entry == DD_BLK_UNUSED {
                continue;
            }
            let off = (entry as u64) << VHD_SECTOR_SHIFT;
            image.read_exact_at(&mut bm, off)?;
            journal.write_all_at(&bm, off)?;
        }

        journal.sync_all()?;
        info!(journal = %self.journal.display(), "journal written");
        Ok(())
    }

    /// Confirm a pre-existing journal matches this image (modulo the fields
    /// the update itself rewrites).
    fn validate_journal(&self) -> Result<()> {
        let image = File::open(&self.path)?;
        let journal = File::open(&self.journal)?;

        let size = self.header.table_offset as usize;
        let mut fbuf = vec![0u8; size];
        let mut jbuf = vec![0u8; size];
        image.read_exact_at(&mut fbuf, 0)?;
        journal.read_exact_at(&mut jbuf, 0)?;

        // The update rewrites creator and header versions and their
        // checksums; ignore them when comparing.
        for buf in [&mut fbuf, &mut jbuf] {
            let mut footer = Footer::read_be(buf);
            footer.crtr_ver = 0;
            footer.checksum = 0;
            footer.write_be(&mut buf[..FOOTER_SIZE]);

            let hdr_off = self.footer.data_offset as usize;
            let mut header = Header::read_be(&buf[hdr_off..]);
            header.hdr_ver = 0;
            header.checksum = 0;
            header.write_be(&mut buf[hdr_off..hdr_off + Header::SIZE]);
        }

        if fbuf != jbuf {
            warn!("journal metadata does not match file");
            return Err(VhdError::invalid("journal", "metadata does not match file"));
        }

        let mut jbat = vec![0u8; self.bat.len() * 4];
        journal.read_exact_at(&mut jbat, self.header.table_offset)?;
        for (i, &entry) in self.bat.iter().enumerate() {
            let jentry = u32::from_be_bytes(jbat[i * 4..i * 4 + 4].try_into().unwrap());
            if entry != jentry {
                warn!("journal BAT does not match file");
                return Err(VhdError::invalid("journal", "BAT does not match file"));
            }
        }

        Ok(())
    }

    /// Rewrite `hdr_ver` so other openers refuse the image mid-update.
    fn set_header_version(&mut self, version: u32) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;

        self.header.hdr_ver = version;
        self.header.set_checksum();

        let mut buf = vec![0u8; Header::SIZE];
        self.header.write_be(&mut buf);
        file.write_all_at(&buf, self.footer.data_offset)?;
        file.sync_all()?;
        Ok(())
    }

    /// Push journalled bitmaps back into the image, converted to the new
    /// ordering (or verbatim when rolling back).
    fn rewrite_bitmaps(&self, rollback: bool) -> Result<()> {
        let image = OpenOptions::new().write(true).open(&self.path)?;
        let journal = File::open(&self.journal)?;

        let size = self.bitmap_bytes();
        let mut old = vec![0u8; size];
        let mut new = vec![0u8; size];

        for &entry in &self.bat {
            if entry == DD_BLK_UNUSED {
                continue;
            }

            let off = (entry as u64) << VHD_SECTOR_SHIFT;
            journal.read_exact_at(&mut old, off)?;

            if rollback {
                new.copy_from_slice(&old);
            } else {
                convert_le_to_be(&old, &mut new);
            }

            image.write_all_at(&new, off)?;
        }

        image.sync_all()?;
        Ok(())
    }

    /// Stamp both footers with the post-update creator version.
    fn update_creator_version(&mut self) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;

        self.footer.crtr_ver = vhd_version(1, 1);
        self.footer.set_checksum();

        let mut buf = vec![0u8; FOOTER_SIZE];
        self.footer.write_be(&mut buf);
        file.write_all_at(&buf, 0)?;

        let eof = file.metadata()?.len();
        file.write_all_at(&buf, eof - FOOTER_SIZE as u64)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Run the one-shot bitmap-ordering update on `image`.
///
/// `journal` names an existing journal to resume from; `rollback` restores
/// the journalled bitmaps without conversion (requires a journal).
pub fn update(image: &Path, journal: Option<&Path>, rollback: bool) -> Result<()> {
    if rollback && journal.is_none() {
        return Err(VhdError::invalid("journal", "rollback requires a journal"));
    }

    let mut ctx = UpdateCtx::load(image)?;

    if !ctx.footer.disk_type.is_sparse() {
        return Ok(());
    }

    if ctx.footer.crtr_ver != vhd_version(0, 1) {
        // Already converted; a crashed run may have left the image disabled.
        if ctx.footer.crtr_ver == vhd_version(1, 1) && ctx.is_disabled() {
            return ctx.set_header_version(DD_VERSION);
        }
        return Ok(());
    }

    if let Some(journal) = journal {
        ctx.journal = journal.to_path_buf();
        ctx.validate_journal()?;
    } else {
        ctx.create_journal()?;
    }

    ctx.set_header_version(DD_VERSION_DISABLED)?;

    if let Err(e) = ctx.rewrite_bitmaps(rollback) {
        warn!("bitmap rewrite failed, keeping journal: {e}");
        return Err(e);
    }

    ctx.update_creator_version()?;
    ctx.set_header_version(DD_VERSION)?;

    std::fs::remove_file(&ctx.journal)?;
    info!(image = %image.display(), "bitmap ordering updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::{create, CreateOpts};
    use crate::ondisk::vhd_time_now;
    use std::os::unix::fs::FileExt;
    use tempfile::tempdir;

    /// Build a sparse image stamped as tap 0.1 with one allocated block
    /// whose bitmap uses the legacy ordering.
    fn legacy_image(path: &Path) -> (u32, u64) {
        create(
            path,
            &CreateOpts {
                size: 2 << 20,
                sparse: true,
                ..CreateOpts::default()
            },
        )
        .unwrap();

        // CACHED avoids O_DIRECT so the test can write plain heap buffers.
        let mut ctx = VhdContext::open(path, OpenFlags::CACHED).unwrap();
        let blk_sector = ctx.next_db as u32;

        // Allocate block 0 by hand: bitmap + data + BAT entry.
        let bm_bytes = sectors_to_bytes(ctx.bm_secs as u64) as usize;
        let mut bitmap = vec![0u8; bm_bytes];
        crate::bitmap::set_bit_le(&mut bitmap, 3);
        crate::bitmap::set_bit_le(&mut bitmap, 64);

        let data_len = sectors_to_bytes(ctx.spb as u64) as usize;
        ctx.file()
            .write_all_at(&vec![0u8; data_len], sectors_to_bytes(blk_sector as u64 + ctx.bm_secs as u64))
            .unwrap();
        ctx.file()
            .write_all_at(&bitmap, sectors_to_bytes(blk_sector as u64))
            .unwrap();

        ctx.set_bat_entry(0, blk_sector);
        ctx.write_bat_entry(0).unwrap();

        // Stamp the creator version back to 0.1 in both footers. The data
        // write extended the file past the old primary footer, so a fresh
        // one is appended after the block.
        ctx.footer.crtr_ver = vhd_version(0, 1);
        ctx.footer.timestamp = vhd_time_now();
        ctx.footer.set_checksum();
        ctx.write_backup_footer().unwrap();
        let eof = ctx.eof().unwrap();
        ctx.write_footer_at(&ctx.footer, eof).unwrap();

        (blk_sector, sectors_to_bytes(blk_sector as u64))
    }

    #[test]
    fn update_converts_bitmaps_and_bumps_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.vhd");
        let (_, bitmap_off) = legacy_image(&path);

        {
            let ctx = VhdContext::open(&path, OpenFlags::RDONLY).unwrap();
            assert!(needs_update(&ctx));
            assert_eq!(ctx.bitmap_format, crate::bitmap::BitmapFormat::LittleEndian);
        }

        update(&path, None, false).unwrap();

        let ctx = VhdContext::open(&path, OpenFlags::RDONLY).unwrap();
        assert!(!needs_update(&ctx));
        assert_eq!(ctx.footer.crtr_ver, vhd_version(1, 1));
        assert_eq!(ctx.header.hdr_ver, DD_VERSION);
        assert_eq!(ctx.bitmap_format, crate::bitmap::BitmapFormat::BigEndian);

        let bm = ctx.read_bitmap(0).unwrap();
        assert!(crate::bitmap::test_bit_be(&bm, 3));
        assert!(crate::bitmap::test_bit_be(&bm, 64));
        assert!(!crate::bitmap::test_bit_be(&bm, 4));

        assert!(!journal_path(&path).exists());
    }

    #[test]
    fn disabled_image_refuses_normal_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.vhd");
        legacy_image(&path);

        let mut ctx = UpdateCtx::load(&path).unwrap();
        ctx.set_header_version(DD_VERSION_DISABLED).unwrap();

        assert!(matches!(
            VhdContext::open(&path, OpenFlags::RDONLY | OpenFlags::QUIET),
            Err(VhdError::Disabled)
        ));

        VhdContext::open(
            &path,
            OpenFlags::RDONLY | OpenFlags::QUIET | OpenFlags::IGNORE_DISABLED,
        )
        .unwrap();
    }
}
