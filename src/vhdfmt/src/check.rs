//! Whole-file validation pass: checksums, ranges, overlaps, chain
//! consistency. Messages go to stdout, one line per failed invariant, the
//! way the CLI has always reported them.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::bitmap;
use crate::chain::{decode_locator, resolve_parent_path};
use crate::ondisk::{
    vhd_time_now, DiskType, Footer, Header, OnDisk, ParentLocator, PlatCode, BATMAP_COOKIE,
    BATMAP_VERSION, DD_COOKIE, DD_VERSION, FOOTER_SIZE, HD_COOKIE, HD_FF_VERSION, HD_RESERVED,
    HD_TEMPORARY, HEADER_SIZE, VHD_CURRENT_VERSION,
};
use crate::{
    sectors_to_bytes, Geometry, OpenFlags, Result, VhdContext, VhdError, DD_BLK_UNUSED,
    TIMESTAMP_MAX_SLACK, VHD_SECTOR_SHIFT, VHD_SECTOR_SIZE,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOpts {
    /// Tolerate a missing/invalid primary footer (use the backup).
    pub ignore_footer: bool,
    pub ignore_parent_uuid: bool,
    pub ignore_timestamps: bool,
    /// Verify that sectors whose bitmap bit is clear hold zeros.
    pub check_data: bool,
    /// Skip the O(n²) BAT overlap scan.
    pub no_check_bat: bool,
    pub collect_stats: bool,
    /// Recursively check every ancestor.
    pub check_parents: bool,
}

#[derive(Debug)]
struct ImageStats {
    name: String,
    bitmap: Vec<u8>,
    secs_total: u64,
    secs_allocated: u64,
    secs_written: u64,
}

struct CheckCtx {
    opts: CheckOpts,
    stats: Vec<ImageStats>,
    primary_footer_missing: bool,
}

fn fail(msg: String) -> VhdError {
    println!("{msg}");
    VhdError::invalid("check", msg)
}

fn all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

fn validate_footer(opts: &CheckOpts, footer: &Footer) -> Option<String> {
    if &footer.cookie != HD_COOKIE {
        return Some("invalid cookie".into());
    }

    if !footer.checksum_valid() {
        return Some("invalid checksum".into());
    }

    if footer.features & HD_RESERVED == 0 {
        return Some("invalid 'reserved' feature".into());
    }

    if footer.features & !(HD_TEMPORARY | HD_RESERVED) != 0 {
        return Some("invalid extra features".into());
    }

    if footer.ff_version != HD_FF_VERSION {
        return Some("invalid file format version".into());
    }

    if !footer.disk_type.is_sparse() && footer.data_offset != u64::MAX {
        return Some("invalid data offset".into());
    }

    if !opts.ignore_timestamps && footer.timestamp > vhd_time_now() + TIMESTAMP_MAX_SLACK {
        return Some("creation time in future".into());
    }

    if footer.is_tap_creator() && footer.crtr_ver > VHD_CURRENT_VERSION {
        return Some("unsupported tap creator version".into());
    }

    if Geometry::for_size(footer.curr_size).to_raw() < footer.geometry {
        return Some("geometry too large".into());
    }

    if !matches!(
        footer.disk_type,
        DiskType::Fixed | DiskType::Dynamic | DiskType::Diff
    ) {
        return Some("invalid type".into());
    }

    if footer.saved > 1 {
        return Some("invalid 'saved' state".into());
    }

    if footer.hidden > 1 {
        return Some("invalid 'hidden' state".into());
    }

    if !all_zero(&footer.reserved) {
        return Some("invalid 'reserved' bits".into());
    }

    if footer.uuid.is_nil() {
        return Some("invalid (NULL) uuid".into());
    }

    None
}

fn validate_header(eof: u64, header: &Header) -> Option<String> {
    if &header.cookie != DD_COOKIE {
        return Some("invalid cookie".into());
    }

    if !header.checksum_valid() {
        return Some("invalid checksum".into());
    }

    if header.hdr_ver != DD_VERSION {
        return Some("invalid header version".into());
    }

    if header.data_offset != u64::MAX {
        return Some("invalid data offset".into());
    }

    if header.table_offset == 0
        || header.table_offset % VHD_SECTOR_SIZE != 0
        || header.table_offset + header.max_bat_size as u64 * 4 > eof - FOOTER_SIZE as u64
    {
        return Some("invalid table offset".into());
    }

    if header.block_size.count_ones() != 1 {
        return Some("invalid block size".into());
    }

    if header.res1 != 0 {
        return Some("invalid reserved bits".into());
    }

    if !all_zero(&header.res2) {
        return Some("invalid reserved bits".into());
    }

    None
}

fn validate_differencing_header(opts: &CheckOpts, vhd: &VhdContext) -> Option<String> {
    let header = &vhd.header;

    if vhd.footer.disk_type == DiskType::Diff {
        if !opts.ignore_timestamps && header.prt_ts > vhd_time_now() + TIMESTAMP_MAX_SLACK {
            return Some("parent creation time in future".into());
        }

        if header.parent_name().is_err() {
            return Some("invalid parent name".into());
        }
    } else {
        if !all_zero(&header.prt_name) {
            return Some("invalid non-null parent name".into());
        }

        if !header.loc.iter().all(ParentLocator::is_zero) {
            return Some("invalid non-null parent locators".into());
        }

        if !header.prt_uuid.is_nil() {
            return Some("invalid non-null parent uuid".into());
        }

        if header.prt_ts != 0 {
            return Some("invalid non-zero parent timestamp".into());
        }
    }

    None
}

fn validate_batmap(vhd: &VhdContext) -> Option<String> {
    let batmap = vhd.batmap.as_ref()?;
    let header = &batmap.header;

    if &header.cookie != BATMAP_COOKIE {
        return Some("invalid cookie".into());
    }

    if header.batmap_version > BATMAP_VERSION {
        return Some("unsupported batmap version".into());
    }

    if crate::ondisk::payload_checksum(&batmap.map) != header.checksum {
        return Some("invalid checksum".into());
    }

    if header.batmap_size == 0 {
        return Some("invalid size zero".into());
    }

    if (header.batmap_size as u64) << (VHD_SECTOR_SHIFT + 3) < vhd.header.max_bat_size as u64 {
        return Some("batmap-BAT size mismatch".into());
    }

    let eof = match vhd.eof() {
        Ok(eof) => eof,
        Err(_) => return Some("error finding eof".into()),
    };

    if header.batmap_offset == 0 || header.batmap_offset % VHD_SECTOR_SIZE != 0 {
        return Some("invalid batmap offset".into());
    }

    if header.batmap_offset + sectors_to_bytes(header.batmap_size as u64)
        > eof - FOOTER_SIZE as u64
    {
        return Some("invalid batmap size".into());
    }

    None
}

fn validate_locator(vhd: &VhdContext, loc: &ParentLocator) -> Option<String> {
    if !loc.code.is_known() {
        return Some("invalid platform code".into());
    }

    if loc.code == PlatCode::NONE {
        if !loc.is_zero() {
            return Some("non-zero locator".into());
        }
        return None;
    }

    if loc.data_offset == 0 {
        return Some("invalid data offset".into());
    }

    if loc.data_space == 0 {
        return Some("invalid data space".into());
    }

    if loc.data_len == 0 {
        return Some("invalid data length".into());
    }

    let size = match loc.data_size_bytes() {
        Ok(size) => size,
        Err(_) => return Some("invalid data space".into()),
    };

    if size < loc.data_len as u64 {
        return Some("data space does not cover data length".into());
    }

    let eof = match vhd.eof() {
        Ok(eof) => eof,
        Err(_) => return Some("error finding eof".into()),
    };

    if loc.data_offset + size > eof - FOOTER_SIZE as u64 {
        return Some("invalid size".into());
    }

    if loc.res != 0 {
        return Some("invalid reserved bits".into());
    }

    None
}

/// Footer pass over the raw file: primary at EOF (512 or legacy 511 bytes),
/// backup at offset 0, and their equality modulo the hidden quirk.
fn check_footer(ctx: &mut CheckCtx, file: &File) -> Result<Footer> {
    let eof = file.metadata()?.len();
    if eof < FOOTER_SIZE as u64 {
        return Err(fail("file too small for a footer".into()));
    }

    let tail = eof % VHD_SECTOR_SIZE;
    if tail != 0 && tail != 511 {
        return Err(fail(format!("invalid file size: {eof:#x}")));
    }

    let mut raw = [0u8; FOOTER_SIZE];
    if tail == 0 {
        file.read_exact_at(&mut raw, eof - FOOTER_SIZE as u64)?;
    } else {
        file.read_exact_at(&mut raw[..511], eof - 511)?;
    }
    let primary = Footer::read_be(&raw);

    let mut primary_valid = true;
    if let Some(msg) = validate_footer(&ctx.opts, &primary) {
        ctx.primary_footer_missing = true;
        primary_valid = false;

        if !ctx.opts.ignore_footer {
            return Err(fail(format!("primary footer invalid: {msg}")));
        }
    }

    if primary_valid && primary.disk_type == DiskType::Fixed {
        return Ok(primary);
    }

    let mut raw_backup = [0u8; FOOTER_SIZE];
    file.read_exact_at(&mut raw_backup, 0)?;
    let backup = Footer::read_be(&raw_backup);

    if let Some(msg) = validate_footer(&ctx.opts, &backup) {
        return Err(fail(format!("backup footer invalid: {msg}")));
    }

    if !primary_valid {
        return Ok(backup);
    }

    if primary != backup {
        // tap 0.1/1.1 set `hidden` in one copy only; tolerate that skew.
        let mut quirked = backup.clone();
        quirked.hidden = primary.hidden;
        let tolerable = backup.hidden != 0
            && backup.is_tap_creator()
            && (backup.crtr_ver == crate::ondisk::vhd_version(0, 1)
                || backup.crtr_ver == crate::ondisk::vhd_version(1, 1));

        if !(tolerable && quirked == primary) {
            return Err(fail("primary and backup footers do not match".into()));
        }
    }

    Ok(primary)
}

fn check_header(file: &File, footer: &Footer) -> Result<Header> {
    let eof = file.metadata()?.len();
    let mut raw = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut raw, footer.data_offset)?;
    let header = Header::read_be(&raw);

    if let Some(msg) = validate_header(eof, &header) {
        return Err(fail(format!("header is invalid: {msg}")));
    }

    Ok(header)
}

fn check_bitmap(ctx: &mut CheckCtx, vhd: &VhdContext, blk: u32) -> Result<()> {
    let map = vhd.read_bitmap(blk)?;
    let data = if ctx.opts.check_data {
        Some(vhd.read_block(blk)?)
    } else {
        None
    };

    let sector = blk as u64 * vhd.spb as u64;
    let mut err = None;

    for i in 0..vhd.spb {
        let set = bitmap::test_bit(vhd.bitmap_format, &map, i as u64);

        if ctx.opts.collect_stats && set {
            let stats = ctx.stats.last_mut().expect("stats entry for this image");
            stats.secs_written += 1;
            bitmap::set_bit_be(&mut stats.bitmap, sector + i as u64);
        }

        if let Some(data) = &data {
            let buf = &data[(i as usize) << VHD_SECTOR_SHIFT..(i as usize + 1) << VHD_SECTOR_SHIFT];
            if !all_zero(buf) && !set {
                println!("sector {i:#x} of block {blk:#x} has data where bitmap is clear");
                err = Some(VhdError::invalid(
                    "check",
                    format!("sector {i:#x} of block {blk:#x} has data where bitmap is clear"),
                ));
            }
        }
    }

    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn check_bat(ctx: &mut CheckCtx, vhd: &VhdContext) -> Result<()> {
    if ctx.opts.collect_stats {
        let secs_total = vhd.spb as u64 * vhd.header.max_bat_size as u64;
        ctx.stats.push(ImageStats {
            name: vhd.path().display().to_string(),
            bitmap: vec![0u8; ((secs_total + 7) >> 3) as usize],
            secs_total,
            secs_allocated: 0,
            secs_written: 0,
        });
    }

    let mut eof = vhd.eof()?;
    if eof % VHD_SECTOR_SIZE != 0 {
        if eof % VHD_SECTOR_SIZE != 511 {
            return Err(fail(format!("invalid file size: {eof:#x}")));
        }
        eof += 1;
    }

    let eof_secs = (eof - FOOTER_SIZE as u64) >> VHD_SECTOR_SHIFT;
    let eoh_secs = crate::secs_round_up(vhd.end_of_headers());
    let block_secs = vhd.spb as u64 + vhd.bm_secs as u64;

    let vhd_blks = vhd.blocks();
    if vhd_blks > vhd.header.max_bat_size as u64 {
        return Err(fail(format!(
            "VHD size ({vhd_blks} blocks) exceeds BAT size ({})",
            vhd.header.max_bat_size
        )));
    }

    for i in 0..vhd_blks as u32 {
        let off = vhd.bat_entry(i);
        if off == DD_BLK_UNUSED {
            continue;
        }
        let off = off as u64;

        if off < eoh_secs {
            return Err(fail(format!(
                "block {i} (offset {off:#x}) clobbers headers"
            )));
        }

        if off + block_secs > eof_secs {
            let short_footer_slack = ctx.primary_footer_missing
                && ctx.opts.ignore_footer
                && off + block_secs == eof_secs + 1;
            if !short_footer_slack {
                return Err(fail(format!(
                    "block {i} (offset {off:#x}) clobbers footer"
                )));
            }
        }

        if !ctx.opts.no_check_bat {
            for j in 0..vhd_blks as u32 {
                if i == j {
                    continue;
                }

                let joff = vhd.bat_entry(j);
                if joff == DD_BLK_UNUSED {
                    continue;
                }
                let joff = joff as u64;

                let overlaps = off == joff
                    || (off > joff && off < joff + block_secs)
                    || (off + block_secs > joff && off + block_secs < joff + block_secs);
                if overlaps {
                    return Err(fail(format!(
                        "block {i} (offset {off:#x}) clobbers block {j} (offset {joff:#x})"
                    )));
                }
            }
        }

        if ctx.opts.check_data || ctx.opts.collect_stats {
            if ctx.opts.collect_stats {
                let stats = ctx.stats.last_mut().expect("stats entry for this image");
                stats.secs_allocated += vhd.spb as u64;
            }
            check_bitmap(ctx, vhd, i)?;
        }
    }

    Ok(())
}

fn check_batmap(vhd: &VhdContext) -> Result<()> {
    if let Some(msg) = validate_batmap(vhd) {
        return Err(fail(format!("batmap is invalid: {msg}")));
    }

    let batmap = vhd.batmap.as_ref().expect("batmap present");
    for i in 0..vhd.blocks() as u32 {
        if batmap.test(i) && vhd.bat_entry(i) == DD_BLK_UNUSED {
            return Err(fail(format!("batmap shows unallocated block {i} full")));
        }
    }

    Ok(())
}

fn check_parent(
    ctx: &CheckCtx,
    vhd: &VhdContext,
    ppath: &Path,
) -> Option<String> {
    if ctx.opts.ignore_parent_uuid {
        return None;
    }

    let parent = match VhdContext::open(
        ppath,
        OpenFlags::RDONLY | OpenFlags::QUIET | OpenFlags::IGNORE_DISABLED | OpenFlags::NO_CACHE,
    ) {
        Ok(parent) => parent,
        Err(_) => return Some("error opening parent".into()),
    };

    if vhd.header.prt_uuid != parent.footer.uuid {
        return Some("invalid parent uuid".into());
    }

    None
}

fn check_parent_locators(ctx: &CheckCtx, vhd: &VhdContext) -> Result<()> {
    let pname = vhd
        .header
        .parent_name()
        .map_err(|e| fail(format!("error decoding parent name: {e}")))?;

    let mut counts = [(PlatCode::MACX, 0u32), (PlatCode::MAC, 0), (PlatCode::W2KU, 0),
                      (PlatCode::W2RU, 0), (PlatCode::WI2R, 0), (PlatCode::WI2K, 0)];
    let mut found = 0;

    for (i, loc) in vhd.header.loc.iter().enumerate() {
        if let Some(msg) = validate_locator(vhd, loc) {
            return Err(fail(format!("invalid parent locator {i}: {msg}")));
        }

        if loc.code == PlatCode::NONE {
            continue;
        }

        let count = counts
            .iter_mut()
            .find(|(code, _)| *code == loc.code)
            .map(|(_, n)| n)
            .ok_or_else(|| fail(format!("invalid platform code for locator {i}")))?;
        *count += 1;
        if *count > 1 {
            return Err(fail(format!(
                "duplicate platform code in locator {i}: {:#x}",
                loc.code.0
            )));
        }

        if !matches!(loc.code, PlatCode::MACX | PlatCode::W2RU | PlatCode::W2KU) {
            continue;
        }

        let decoded = decode_locator(vhd, loc)
            .map_err(|e| fail(format!("error reading parent locator {i}: {e}")))?;

        let file = Path::new(&decoded)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if file != pname {
            return Err(fail(format!(
                "parent locator {i} name ({file}) does not match header name ({pname})"
            )));
        }

        let location = resolve_parent_path(vhd.path(), &decoded);
        if !location.exists() {
            if loc.code == PlatCode::MACX {
                return Err(fail(format!(
                    "parent locator {i} points to missing file {decoded} \
                     (resolved to {})",
                    location.display()
                )));
            }
            continue;
        }

        if let Some(msg) = check_parent(ctx, vhd, &location) {
            return Err(fail(format!("invalid parent {}: {msg}", location.display())));
        }

        found += 1;
    }

    if found == 0 {
        return Err(fail(format!("could not find parent {pname}")));
    }

    Ok(())
}

/// Print footer and header summaries of a file that failed validation.
pub fn dump_headers(path: &Path) {
    println!("{} appears invalid; dumping metadata", path.display());

    let Ok(vhd) = VhdContext::open(path, OpenFlags::QUERY) else {
        println!("could not open {} for dumping", path.display());
        return;
    };

    print_footer(&vhd.footer);
    if vhd.is_sparse() {
        print_header(&vhd.header);
    }
}

pub fn print_footer(f: &Footer) {
    println!("VHD Footer Summary:\n-------------------");
    println!(
        "Features            : ({:#010x}) {}{}",
        f.features,
        if f.features & HD_TEMPORARY != 0 { "<TEMP>" } else { "" },
        if f.features & HD_RESERVED != 0 { "<RESV>" } else { "" },
    );
    println!(
        "File format version : Major: {}, Minor: {}",
        f.ff_version >> 16,
        f.ff_version & 0xffff
    );
    println!("Data offset         : {}", f.data_offset);
    println!("Timestamp           : {}", f.timestamp);
    println!(
        "Creator Application : '{}'",
        String::from_utf8_lossy(&f.crtr_app).trim_end_matches('\0')
    );
    println!(
        "Creator version     : Major: {}, Minor: {}",
        f.crtr_ver >> 16,
        f.crtr_ver & 0xffff
    );
    println!("Original disk size  : {} MB ({} Bytes)", f.orig_size >> 20, f.orig_size);
    println!("Current disk size   : {} MB ({} Bytes)", f.curr_size >> 20, f.curr_size);
    let g = f.geometry();
    println!(
        "Geometry            : Cyl: {}, Hds: {}, Sctrs: {}",
        g.cylinders, g.heads, g.spt
    );
    println!("Disk type           : {}", f.disk_type.name());
    let cksm = f.compute_checksum();
    println!(
        "Checksum            : {:#x}|{:#x} ({})",
        f.checksum,
        cksm,
        if f.checksum == cksm { "Good!" } else { "Bad!" }
    );
    println!("UUID                : {}", f.uuid);
    println!("Saved state         : {}", if f.saved == 0 { "No" } else { "Yes" });
    println!("Hidden              : {}", f.hidden);
}

pub fn print_header(h: &Header) {
    println!("VHD Header Summary:\n-------------------");
    println!("Data offset (unusd) : {}", h.data_offset);
    println!("Table offset        : {}", h.table_offset);
    println!("Header version      : {:#010x}", h.hdr_ver);
    println!("Max BAT size        : {}", h.max_bat_size);
    println!(
        "Block size          : {:#x} ({}MB)",
        h.block_size,
        h.block_size >> 20
    );
    println!("Parent UUID         : {}", h.prt_uuid);
    println!("Parent timestamp    : {}", h.prt_ts);
    let cksm = h.compute_checksum();
    println!(
        "Checksum            : {:#x}|{:#x} ({})",
        h.checksum,
        cksm,
        if h.checksum == cksm { "Good!" } else { "Bad!" }
    );
    println!(
        "Parent name         : {}",
        h.parent_name().unwrap_or_else(|_| "<undecodable>".into())
    );
    for (i, loc) in h.loc.iter().enumerate() {
        if loc.code != PlatCode::NONE {
            println!(
                "loc[{i}].code: {}, space: {:#x}, len: {:#x}, offset: {:#x}",
                loc.code.name(),
                loc.data_space,
                loc.data_len,
                loc.data_offset
            );
        }
    }
}

fn pct(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64 * 100.0
    }
}

/// Stats are collected child-first; reporting walks root-to-child so each
/// image is compared against its parent and against every ancestor.
fn print_stats(stats: &[ImageStats]) {
    let Some(root) = stats.last() else { return };

    println!(
        "{}: secs allocated: {:#x} secs written: {:#x} ({:.2}%)",
        root.name,
        root.secs_allocated,
        root.secs_written,
        pct(root.secs_written, root.secs_allocated)
    );

    let secs = root.secs_total;
    let mut chain_bitmap = root.bitmap.clone();

    for idx in (0..stats.len() - 1).rev() {
        let cur = &stats[idx];
        let parent = &stats[idx + 1];
        let mut unique_parent = 0u64;
        let mut unique_chain = 0u64;

        for i in 0..secs.min(cur.secs_total) {
            if bitmap::test_bit_be(&cur.bitmap, i) {
                if !bitmap::test_bit_be(&parent.bitmap, i) {
                    unique_parent += 1;
                }
                if !bitmap::test_bit_be(&chain_bitmap, i) {
                    unique_chain += 1;
                }
                bitmap::set_bit_be(&mut chain_bitmap, i);
            }
        }

        println!(
            "{}: secs allocated: {:#x} secs written: {:#x} ({:.2}%) \
             secs not in parent: {:#x} ({:.2}%) secs not in ancestors: {:#x} ({:.2}%)",
            cur.name,
            cur.secs_allocated,
            cur.secs_written,
            pct(cur.secs_written, cur.secs_allocated),
            unique_parent,
            pct(unique_parent, cur.secs_written),
            unique_chain,
            pct(unique_chain, cur.secs_written),
        );
    }
}

fn check_one(ctx: &mut CheckCtx, path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let meta = std::fs::metadata(path)?;
    if !meta.is_file() && !meta.file_type().is_block_device() {
        return Err(fail(format!(
            "{} is not a regular file or block device",
            path.display()
        )));
    }

    let file = File::open(path)?;
    let footer = check_footer(ctx, &file)?;

    if !footer.disk_type.is_sparse() {
        println!("{} is valid", path.display());
        return Ok(());
    }

    check_header(&file, &footer)?;
    drop(file);

    let mut vhd = VhdContext::open(
        path,
        OpenFlags::RDONLY | OpenFlags::QUIET | OpenFlags::IGNORE_DISABLED,
    )?;
    vhd.read_batmap()?;
    vhd.read_bat()?;

    if let Some(msg) = validate_differencing_header(&ctx.opts, &vhd) {
        return Err(fail(format!("differencing header is invalid: {msg}")));
    }

    check_bat(ctx, &vhd)?;

    if vhd.has_batmap() {
        check_batmap(&vhd)?;
    }

    if vhd.footer.disk_type == DiskType::Diff {
        check_parent_locators(ctx, &vhd)?;
    }

    if !ctx.opts.collect_stats {
        println!("{} is valid", path.display());
    }

    Ok(())
}

/// Run the full validation pass. Headers of an invalid file are dumped
/// before returning its error.
pub fn check(path: impl AsRef<Path>, opts: &CheckOpts) -> Result<()> {
    let path = path.as_ref();
    let mut ctx = CheckCtx {
        opts: *opts,
        stats: Vec::new(),
        primary_footer_missing: false,
    };

    if let Err(e) = check_one(&mut ctx, path) {
        dump_headers(path);
        return Err(e);
    }

    if opts.check_parents {
        let mut cur: PathBuf = path.to_path_buf();
        loop {
            let vhd = VhdContext::open(
                &cur,
                OpenFlags::RDONLY | OpenFlags::QUIET | OpenFlags::IGNORE_DISABLED,
            )?;
            if vhd.footer.disk_type != DiskType::Diff {
                break;
            }
            let parent = crate::chain::parent_path(&vhd)?;
            drop(vhd);

            if let Err(e) = check_one(&mut ctx, &parent) {
                dump_headers(&parent);
                return Err(e);
            }
            cur = parent;
        }
    }

    if opts.collect_stats {
        print_stats(&ctx.stats);
    }

    Ok(())
}
