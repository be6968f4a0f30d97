//! Command implementations.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use tapdisk::vbd::SectorStatus;
use tapdisk::Vbd;
use vhdfmt::buf::AlignedBuf;
use vhdfmt::chain;
use vhdfmt::create::CreateOpts;
use vhdfmt::{
    sectors_to_bytes, DiskType, Geometry, OpenFlags, VhdContext, DD_BLK_UNUSED, VHD_SECTOR_SHIFT,
};

pub struct CliError {
    pub errno: Errno,
    pub message: String,
}

impl CliError {
    fn new(errno: Errno, message: impl Into<String>) -> CliError {
        CliError {
            errno,
            message: message.into(),
        }
    }
}

impl From<vhdfmt::VhdError> for CliError {
    fn from(e: vhdfmt::VhdError) -> CliError {
        CliError::new(e.errno(), e.to_string())
    }
}

impl From<tapdisk::TdError> for CliError {
    fn from(e: tapdisk::TdError) -> CliError {
        CliError::new(e.errno(), e.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> CliError {
        let errno = e
            .raw_os_error()
            .map(Errno::from_raw)
            .unwrap_or(Errno::EIO);
        CliError::new(errno, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

pub fn create(name: &Path, size_mib: u64, reserve: bool) -> Result<()> {
    vhdfmt::create::create(
        name,
        &CreateOpts {
            size: size_mib << 20,
            sparse: !reserve,
            ..CreateOpts::default()
        },
    )?;
    Ok(())
}

pub fn snapshot(name: &Path, parent: &Path, ignore_parent: bool) -> Result<()> {
    if !ignore_parent && !parent.exists() {
        return Err(CliError::new(
            Errno::ENOENT,
            format!("{} not found", parent.display()),
        ));
    }
    vhdfmt::create::snapshot(name, parent, ignore_parent)?;
    Ok(())
}

pub fn query(name: &Path, virtsize: bool, parent: bool, fields: bool) -> Result<()> {
    let ctx = VhdContext::open(name, OpenFlags::QUERY)?;

    if virtsize {
        println!("{}", ctx.footer.curr_size >> VHD_SECTOR_SHIFT);
    }

    if parent {
        if ctx.footer.disk_type != DiskType::Diff {
            println!("{} has no parent", name.display());
        } else {
            match chain::parent_path(&ctx) {
                Ok(p) => println!("{}", p.display()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    if fields {
        println!("hidden: {}", ctx.get_hidden()?);
    }

    Ok(())
}

pub fn set(name: &Path, field: &str, value: u64) -> Result<()> {
    if field != "hidden" {
        return Err(CliError::new(
            Errno::EINVAL,
            format!("invalid field {field}"),
        ));
    }
    if value > 255 {
        return Err(CliError::new(Errno::ERANGE, "value out of range"));
    }

    let mut ctx = VhdContext::open(name, OpenFlags::empty())?;
    ctx.set_hidden(value as u8)?;
    ctx.close()?;
    Ok(())
}

pub fn repair(name: &Path) -> Result<()> {
    let mut ctx = VhdContext::open(name, OpenFlags::QUIET)?;
    ctx.repair()?;
    ctx.close()?;
    println!("{} successfully repaired", name.display());
    Ok(())
}

/// Shared driver for the data-plane commands: run one request through a
/// synchronous VBD and surface its completion status.
fn run_one(
    vbd: &mut Vbd,
    write: bool,
    sector: u64,
    secs: u32,
    buf: &mut AlignedBuf,
) -> Result<()> {
    let status = Rc::new(RefCell::new(None::<i32>));
    let status_cb = status.clone();
    let cb = Box::new(move |_id, err| {
        *status_cb.borrow_mut() = Some(err);
    });

    if write {
        vbd.queue_write(sector, secs, buf.as_ptr(), cb)?;
    } else {
        vbd.queue_read(sector, secs, buf.as_mut_ptr(), cb)?;
    }

    vbd.run_to_completion()?;

    let result = match status.borrow().unwrap_or(libc::EIO) {
        0 => Ok(()),
        err => Err(CliError::new(
            Errno::from_raw(err),
            format!(
                "{} of {secs} sectors at {sector} failed",
                if write { "write" } else { "read" }
            ),
        )),
    };
    result
}

pub fn fill(name: &Path) -> Result<()> {
    {
        let ctx = VhdContext::open(name, OpenFlags::QUERY)?;
        if ctx.footer.disk_type == DiskType::Diff {
            return Err(CliError::new(
                Errno::EINVAL,
                "filling differencing images not supported",
            ));
        }
    }

    let mut vbd = Vbd::open(name, OpenFlags::empty(), true)?;
    vbd.set_retry_policy(Duration::from_millis(10), 10);

    let (entries, spb) = {
        let ctx = vbd.child().vhd().context();
        (ctx.header.max_bat_size, ctx.spb)
    };

    let mut buf = AlignedBuf::zeroed(sectors_to_bytes(spb as u64) as usize);

    for blk in 0..entries {
        if vbd.child().vhd().context().bat_entry(blk) != DD_BLK_UNUSED {
            continue;
        }
        run_one(&mut vbd, true, blk as u64 * spb as u64, spb, &mut buf)?;
    }

    vbd.close()?;
    println!("{} successfully filled", name.display());
    Ok(())
}

pub fn read(
    name: &Path,
    print_headers: bool,
    bat: Option<u32>,
    bitmap: Option<u32>,
    data: Option<u64>,
    count: u32,
) -> Result<()> {
    let mut ctx = VhdContext::open(name, OpenFlags::RDONLY | OpenFlags::QUIET)?;
    if ctx.is_sparse() && ctx.bat.is_empty() {
        ctx.read_batmap()?;
        ctx.read_bat()?;
    }

    if print_headers {
        vhdfmt::check::print_footer(&ctx.footer);
        if ctx.is_sparse() {
            vhdfmt::check::print_header(&ctx.header);

            if let Some(batmap) = &ctx.batmap {
                println!("VHD Batmap Summary:\n-------------------");
                println!("Batmap offset       : {}", batmap.header.batmap_offset);
                println!("Batmap size (secs)  : {}", batmap.header.batmap_size);
                println!("Batmap version      : {:#010x}", batmap.header.batmap_version);
                if batmap.header.keyhash.is_set() {
                    let nonce: String = batmap.header.keyhash.nonce.iter().map(|b| format!("{b:02x}")).collect();
                    let hash: String = batmap.header.keyhash.hash.iter().map(|b| format!("{b:02x}")).collect();
                    println!("Batmap keyhash nonce: {nonce}");
                    println!("Batmap keyhash hash : {hash}");
                }
            }
        }
    }

    if let Some(blk) = bat {
        if blk >= ctx.bat_entries() {
            return Err(CliError::new(Errno::ERANGE, format!("block {blk} past end of file")));
        }
        println!("block: {blk}: offset: {:#x}", ctx.bat_entry(blk));
    }

    if let Some(blk) = bitmap {
        if blk >= ctx.bat_entries() {
            return Err(CliError::new(Errno::ERANGE, format!("block {blk} past end of file")));
        }
        if ctx.bat_entry(blk) == DD_BLK_UNUSED {
            println!("block {blk}: not allocated");
        } else {
            let map = ctx.read_bitmap(blk)?;
            let set = (0..ctx.spb as u64)
                .filter(|&i| vhdfmt::bitmap::test_bit(ctx.bitmap_format, &map, i))
                .count();
            println!("block {blk}: {set} of {} sectors set", ctx.spb);
        }
    }

    if let Some(sector) = data {
        drop(ctx);
        let mut vbd = Vbd::open(name, OpenFlags::RDONLY, true)?;
        let mut buf = AlignedBuf::zeroed(sectors_to_bytes(count.max(1) as u64) as usize);
        run_one(&mut vbd, false, sector, count.max(1), &mut buf)?;

        for (i, chunk) in buf.chunks(16).enumerate() {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            println!("{:08x}  {}", (sector << VHD_SECTOR_SHIFT) as usize + i * 16, hex.join(" "));
        }
        vbd.close()?;
    }

    Ok(())
}

pub fn check(name: &Path, opts: vhdfmt::check::CheckOpts) -> Result<()> {
    vhdfmt::check::check(name, &opts)?;
    Ok(())
}

pub fn coalesce(name: &Path) -> Result<()> {
    let parent = {
        let ctx = VhdContext::open(name, OpenFlags::RDONLY | OpenFlags::QUIET)?;
        if ctx.footer.disk_type != DiskType::Diff {
            return Err(CliError::new(
                Errno::EINVAL,
                format!("{} has no parent", name.display()),
            ));
        }
        chain::parent_path(&ctx)?
    };

    let mut child = Vbd::open(name, OpenFlags::RDONLY, true)?;
    let mut target = Vbd::open(&parent, OpenFlags::empty(), true)?;

    let (blocks, spb) = {
        let ctx = child.child().vhd().context();
        (ctx.bat_entries(), ctx.spb)
    };

    let mut buf = AlignedBuf::zeroed(sectors_to_bytes(spb as u64) as usize);
    let mut coalesced: u64 = 0;

    for blk in 0..blocks {
        if child.child().vhd().context().bat_entry(blk) == DD_BLK_UNUSED {
            continue;
        }

        let base = blk as u64 * spb as u64;
        let status = child.block_status(base, spb)?;

        // Copy runs of sectors the child itself backs.
        let mut run: Option<(u64, u32)> = None;
        for i in 0..=spb as usize {
            let owned = i < spb as usize
                && matches!(status[i], SectorStatus::Allocated { level: 0 });

            if owned {
                match run.as_mut() {
                    Some((_, n)) => *n += 1,
                    None => run = Some((base + i as u64, 1)),
                }
            } else if let Some((start, n)) = run.take() {
                run_one(&mut child, false, start, n, &mut buf)?;
                run_one(&mut target, true, start, n, &mut buf)?;
                coalesced += n as u64;
            }
        }
    }

    child.close()?;
    target.close()?;
    println!("coalesced {coalesced} sectors from {}", name.display());
    Ok(())
}

pub fn resize(name: &Path, size_mib: u64) -> Result<()> {
    let mut ctx = VhdContext::open(name, OpenFlags::empty())?;

    if !ctx.is_sparse() {
        return Err(CliError::new(
            Errno::EINVAL,
            "cannot resize fixed images in place",
        ));
    }

    let new_size = size_mib << 20;
    let blocks = new_size.div_ceil(ctx.header.block_size as u64);
    if blocks > ctx.header.max_bat_size as u64 {
        return Err(CliError::new(
            Errno::ERANGE,
            format!(
                "{size_mib} MiB needs {blocks} BAT entries, image has {}",
                ctx.header.max_bat_size
            ),
        ));
    }

    ctx.footer.curr_size = new_size;
    ctx.footer.geometry = Geometry::for_size(new_size).to_raw();
    ctx.footer.set_checksum();
    ctx.write_backup_footer()?;
    ctx.mark_dirty();
    ctx.close()?;

    println!("{} resized to {size_mib} MiB", name.display());
    Ok(())
}

pub fn scan(names: &[PathBuf]) -> Result<()> {
    let mut failed = false;

    for name in names {
        let ctx = match VhdContext::open(name, OpenFlags::QUERY) {
            Ok(ctx) => ctx,
            Err(e) => {
                println!("vhd={} scan-error={e}", name.display());
                failed = true;
                continue;
            }
        };

        let parent = if ctx.footer.disk_type == DiskType::Diff {
            chain::parent_path(&ctx)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "<unresolved>".into())
        } else {
            "none".into()
        };

        println!(
            "vhd={} capacity={} size={} hidden={} parent={}",
            name.display(),
            ctx.footer.curr_size,
            ctx.eof().unwrap_or(0),
            ctx.get_hidden().unwrap_or(0),
            parent,
        );
    }

    if failed {
        return Err(CliError::new(Errno::EINVAL, "scan found invalid images"));
    }
    Ok(())
}

pub fn revert(name: &Path, journal: &Path) -> Result<()> {
    if !journal.exists() {
        return Err(CliError::new(
            Errno::ENOENT,
            format!("{} not found", journal.display()),
        ));
    }
    vhdfmt::journal::update(name, Some(journal), true)?;
    println!("{} reverted from {}", name.display(), journal.display());
    Ok(())
}

pub fn modify(name: &Path, parent: &Path) -> Result<()> {
    let (prt_uuid, prt_ts) = {
        let pctx = VhdContext::open(parent, OpenFlags::QUERY)?;
        let meta = std::fs::metadata(parent)?;
        let ts = meta
            .modified()
            .map(vhdfmt::ondisk::vhd_time)
            .unwrap_or_else(|_| vhdfmt::ondisk::vhd_time_now());
        (pctx.footer.uuid, ts)
    };

    let mut ctx = VhdContext::open(name, OpenFlags::empty())?;
    if ctx.footer.disk_type != DiskType::Diff {
        return Err(CliError::new(
            Errno::EINVAL,
            format!("{} is not a differencing image", name.display()),
        ));
    }

    let file_name = parent
        .file_name()
        .ok_or_else(|| CliError::new(Errno::EINVAL, "parent path has no file name"))?
        .to_string_lossy()
        .into_owned();

    ctx.header.prt_uuid = prt_uuid;
    ctx.header.prt_ts = prt_ts;
    ctx.header.set_parent_name(&file_name)?;

    let absolute = std::fs::canonicalize(parent)?;
    let abs_str = absolute.to_string_lossy().into_owned();
    let rel_str = parent.to_string_lossy().into_owned();

    // Rewrite each locator's payload in place; the reserved data space
    // bounds the new encoding.
    for i in 0..ctx.header.loc.len() {
        let loc = ctx.header.loc[i];
        let encoded = match loc.code {
            vhdfmt::PlatCode::MACX => chain::macx_encode(&abs_str),
            vhdfmt::PlatCode::W2KU => chain::w2u_encode(&abs_str),
            vhdfmt::PlatCode::W2RU => chain::w2u_encode(&rel_str),
            _ => continue,
        };

        let space = loc.data_size_bytes()?;
        if encoded.len() as u64 > space {
            return Err(CliError::new(
                Errno::ENAMETOOLONG,
                format!("locator {i} cannot hold the new parent path"),
            ));
        }

        let mut padded = vec![0u8; space as usize];
        padded[..encoded.len()].copy_from_slice(&encoded);
        ctx.write_at(loc.data_offset, &padded)?;

        ctx.header.loc[i].data_len = encoded.len() as u32;
    }

    ctx.write_header()?;
    ctx.mark_dirty();
    ctx.close()?;

    println!("{} re-pointed at {}", name.display(), parent.display());
    Ok(())
}

pub fn update(name: &Path, journal: Option<&Path>) -> Result<()> {
    vhdfmt::journal::update(name, journal, false)?;
    println!("{} updated", name.display());
    Ok(())
}
