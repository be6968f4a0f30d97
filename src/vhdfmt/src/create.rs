//! Image creation and snapshotting.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::chain::{macx_encode, w2u_encode};
use crate::ondisk::{
    payload_checksum, vhd_time, vhd_time_now, BatmapHeader, DiskType, Footer, Geometry, Header,
    OnDisk, ParentLocator, PlatCode, FOOTER_SIZE, HEADER_SIZE,
};
use crate::{
    secs_round_up, sectors_to_bytes, OpenFlags, Result, VhdContext, VhdError, DD_BLK_UNUSED,
    VHD_SECTOR_SIZE,
};

/// Default block shift: 2 MiB blocks.
const BLK_SHIFT: u32 = 21;

#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    /// Virtual size in bytes; rounded up to a whole number of blocks.
    /// Ignored (taken from the parent) when snapshotting.
    pub size: u64,
    pub sparse: bool,
    pub parent: Option<PathBuf>,
    /// Do not open or verify the parent; leaves the parent UUID nil.
    pub ignore_parent: bool,
    /// Write a batmap after the BAT. On by default for sparse images.
    pub no_batmap: bool,
}

pub fn create(path: impl AsRef<Path>, opts: &CreateOpts) -> Result<()> {
    let path = path.as_ref();
    let res = create_inner(path, opts);
    if res.is_err() {
        let _ = fs::remove_file(path);
    }
    res
}

/// Snapshot `parent` into a new differencing image at `child`.
pub fn snapshot(child: impl AsRef<Path>, parent: impl AsRef<Path>, ignore_parent: bool) -> Result<()> {
    create(
        child,
        &CreateOpts {
            size: 0,
            sparse: true,
            parent: Some(parent.as_ref().to_path_buf()),
            ignore_parent,
            no_batmap: false,
        },
    )
}

fn create_inner(path: &Path, opts: &CreateOpts) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    let mut blks = (opts.size + (1 << BLK_SHIFT) - 1) >> BLK_SHIFT;
    let mut size = blks << BLK_SHIFT;

    let disk_type = if !opts.sparse {
        DiskType::Fixed
    } else if opts.parent.is_some() {
        DiskType::Diff
    } else {
        DiskType::Dynamic
    };

    let mut footer = Footer {
        timestamp: vhd_time_now(),
        data_offset: if opts.sparse { VHD_SECTOR_SIZE } else { u64::MAX },
        orig_size: size,
        curr_size: size,
        geometry: Geometry::for_size(size).to_raw(),
        disk_type,
        uuid: Uuid::new_v4(),
        ..Footer::default()
    };

    if !opts.sparse {
        write_fixed_body(&file, size)?;
        footer.set_checksum();
        write_footer(&file, &footer, size)?;
        file.sync_all()?;
        debug!(path = %path.display(), size, "created fixed vhd");
        return Ok(());
    }

    let mut header = Header {
        table_offset: 3 * VHD_SECTOR_SIZE,
        ..Header::default()
    };

    if let Some(parent_path) = &opts.parent {
        let parent = if opts.ignore_parent {
            None
        } else {
            Some(VhdContext::open(
                parent_path,
                OpenFlags::RDONLY | OpenFlags::NO_CACHE | OpenFlags::QUIET,
            )?)
        };

        if let Some(parent) = &parent {
            size = parent.footer.curr_size;
            blks = (size + (1 << BLK_SHIFT) - 1) >> BLK_SHIFT;
            footer.orig_size = size;
            footer.curr_size = size;
            footer.geometry = Geometry::for_size(size).to_raw();
            header.prt_uuid = parent.footer.uuid;
        }

        set_parent(&file, &mut header, path, parent_path)?;
    }

    header.max_bat_size = blks as u32;
    footer.set_checksum();
    header.set_checksum();

    // Backup footer, then the dynamic header.
    let mut fbuf = vec![0u8; FOOTER_SIZE];
    footer.write_be(&mut fbuf);
    file.write_all_at(&fbuf, 0)?;

    let mut hbuf = vec![0u8; HEADER_SIZE];
    header.write_be(&mut hbuf);
    file.write_all_at(&hbuf, footer.data_offset)?;

    // BAT, every entry unallocated.
    let bat_secs = secs_round_up(blks * 4);
    let mut bat = vec![0u8; sectors_to_bytes(bat_secs) as usize];
    for entry in bat.chunks_exact_mut(4) {
        entry.copy_from_slice(&DD_BLK_UNUSED.to_be_bytes());
    }
    file.write_all_at(&bat, header.table_offset)?;

    let mut end = header.table_offset + sectors_to_bytes(bat_secs);

    if !opts.no_batmap {
        end = write_batmap(&file, end, blks)?;
    }

    file.write_all_at(&fbuf, end)?;
    file.sync_all()?;

    debug!(
        path = %path.display(),
        size,
        blks,
        kind = disk_type.name(),
        "created sparse vhd"
    );
    Ok(())
}

fn write_fixed_body(file: &File, size: u64) -> Result<()> {
    let chunk = vec![0u8; 1 << 20];
    let mut off = 0;
    while off < size {
        let n = chunk.len().min((size - off) as usize);
        file.write_all_at(&chunk[..n], off)?;
        off += n as u64;
    }
    Ok(())
}

fn write_footer(file: &File, footer: &Footer, offset: u64) -> Result<()> {
    let mut buf = vec![0u8; FOOTER_SIZE];
    footer.write_be(&mut buf);
    file.write_all_at(&buf, offset)?;
    Ok(())
}

/// Zeroed batmap covering `blks` blocks, placed at `offset` (end of BAT).
/// Returns the end of the batmap region.
fn write_batmap(file: &File, offset: u64, blks: u64) -> Result<u64> {
    let map_secs = secs_round_up(blks.div_ceil(8));
    let map = vec![0u8; sectors_to_bytes(map_secs) as usize];

    let header = BatmapHeader {
        batmap_offset: offset + BatmapHeader::SIZE as u64,
        batmap_size: map_secs as u32,
        checksum: payload_checksum(&map),
        ..BatmapHeader::default()
    };

    let mut hbuf = vec![0u8; BatmapHeader::SIZE];
    header.write_be(&mut hbuf);
    file.write_all_at(&hbuf, offset)?;
    file.write_all_at(&map, header.batmap_offset)?;

    Ok(header.batmap_offset + sectors_to_bytes(map_secs))
}

/// Record the parent in the header: modification timestamp, UTF-16 name, and
/// locators inserted between the header and the BAT (bumping table_offset).
fn set_parent(
    file: &File,
    header: &mut Header,
    child_path: &Path,
    parent_path: &Path,
) -> Result<()> {
    let meta = fs::metadata(parent_path)?;
    header.prt_ts = meta
        .modified()
        .map(vhd_time)
        .unwrap_or_else(|_| vhd_time_now());

    let file_name = parent_path
        .file_name()
        .ok_or_else(|| VhdError::invalid("parent", "parent path has no file name"))?
        .to_string_lossy()
        .into_owned();
    header.set_parent_name(&file_name)?;

    let absolute = fs::canonicalize(parent_path)?;
    let absolute_str = absolute.to_string_lossy().into_owned();

    let mut slot = 0;

    // One locator per platform code. The MACX slot keeps the path the way
    // the caller gave it, so relative chains survive a directory rename;
    // W2KU always records the absolute location.
    if parent_path.is_relative() {
        let rel = relative_to(parent_path, child_path);
        write_locator(file, header, &mut slot, PlatCode::MACX, &macx_encode(&rel))?;
        write_locator(file, header, &mut slot, PlatCode::W2RU, &w2u_encode(&rel))?;
    } else {
        write_locator(
            file,
            header,
            &mut slot,
            PlatCode::MACX,
            &macx_encode(&absolute_str),
        )?;
    }

    write_locator(
        file,
        header,
        &mut slot,
        PlatCode::W2KU,
        &w2u_encode(&absolute_str),
    )?;

    Ok(())
}

fn relative_to(parent: &Path, child: &Path) -> String {
    // Both paths interpreted from the caller's cwd; the stored locator is
    // relative to the child image's directory.
    let child_dir = child.parent().unwrap_or_else(|| Path::new("."));
    parent
        .strip_prefix(child_dir)
        .unwrap_or(parent)
        .to_string_lossy()
        .into_owned()
}

fn write_locator(
    file: &File,
    header: &mut Header,
    slot: &mut usize,
    code: PlatCode,
    data: &[u8],
) -> Result<()> {
    if *slot >= header.loc.len() {
        return Err(VhdError::invalid("parent locator", "no free locator slot"));
    }

    let space = secs_round_up(data.len() as u64);
    let loc = ParentLocator {
        code,
        data_space: space as u32,
        data_len: data.len() as u32,
        res: 0,
        data_offset: header.table_offset,
    };

    file.write_all_at(data, loc.data_offset)?;

    header.loc[*slot] = loc;
    *slot += 1;
    header.table_offset += sectors_to_bytes(space);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_fixed_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.vhd");
        create(
            &path,
            &CreateOpts {
                size: 8 << 20,
                sparse: false,
                ..CreateOpts::default()
            },
        )
        .unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), (8 << 20) + 512);

        let ctx = VhdContext::open(&path, OpenFlags::RDONLY).unwrap();
        assert_eq!(ctx.footer.curr_size, 8 << 20);
        assert_eq!(ctx.footer.disk_type, DiskType::Fixed);
        assert!(ctx.footer.checksum_valid());
        assert_eq!(ctx.footer.compute_checksum(), ctx.footer.checksum);
    }

    #[test]
    fn create_dynamic_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.vhd");
        create(
            &path,
            &CreateOpts {
                size: 4 << 20,
                sparse: true,
                ..CreateOpts::default()
            },
        )
        .unwrap();

        let mut ctx = VhdContext::open(&path, OpenFlags::RDONLY).unwrap();
        assert_eq!(ctx.footer.disk_type, DiskType::Dynamic);
        assert_eq!(ctx.header.max_bat_size, 2);
        assert!(ctx.header.checksum_valid());

        ctx.read_batmap().unwrap();
        ctx.read_bat().unwrap();
        assert!(ctx.bat.iter().all(|&e| e == DD_BLK_UNUSED));
        assert!(ctx.has_batmap());

        // next_db must land past every metadata structure.
        let eoh = ctx.end_of_headers();
        assert!(sectors_to_bytes(ctx.next_db) >= eoh);
    }

    #[test]
    fn snapshot_links_parent_uuid() {
        let dir = tempdir().unwrap();
        let ppath = dir.path().join("parent.vhd");
        let cpath = dir.path().join("child.vhd");

        create(
            &ppath,
            &CreateOpts {
                size: 4 << 20,
                sparse: true,
                ..CreateOpts::default()
            },
        )
        .unwrap();
        snapshot(&cpath, &ppath, false).unwrap();

        let parent = VhdContext::open(&ppath, OpenFlags::RDONLY).unwrap();
        let child = VhdContext::open(&cpath, OpenFlags::RDONLY).unwrap();

        assert_eq!(child.footer.disk_type, DiskType::Diff);
        assert_eq!(child.header.prt_uuid, parent.footer.uuid);
        assert_eq!(child.footer.curr_size, parent.footer.curr_size);
        assert_eq!(child.header.parent_name().unwrap(), "parent.vhd");

        let resolved = crate::chain::parent_path(&child).unwrap();
        assert_eq!(fs::canonicalize(resolved).unwrap(), fs::canonicalize(&ppath).unwrap());
    }
}
