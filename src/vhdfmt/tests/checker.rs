//! Integrity checker scenarios over deliberately damaged images.

use std::path::{Path, PathBuf};

use vhdfmt::check::{check, CheckOpts};
use vhdfmt::create::{create, snapshot, CreateOpts};
use vhdfmt::{OpenFlags, VhdContext, VhdError};

fn sparse_image(dir: &Path, name: &str, mib: u64) -> PathBuf {
    let path = dir.join(name);
    create(
        &path,
        &CreateOpts {
            size: mib << 20,
            sparse: true,
            ..CreateOpts::default()
        },
    )
    .unwrap();
    path
}

/// Allocate a block by hand: bitmap sector plus data region appended at
/// next_db, BAT entry patched.
fn allocate_block(ctx: &mut VhdContext, blk: u32) -> u32 {
    use std::os::unix::fs::FileExt;

    let sector = ctx.next_db as u32;
    let total = vhdfmt::sectors_to_bytes(ctx.bm_secs as u64 + ctx.spb as u64) as usize;
    ctx.file()
        .write_all_at(&vec![0u8; total], vhdfmt::sectors_to_bytes(sector as u64))
        .unwrap();

    ctx.set_bat_entry(blk, sector);
    ctx.write_bat_entry(blk).unwrap();
    ctx.next_db += ctx.bm_secs as u64 + ctx.spb as u64;

    // Keep a trailing footer after the new block.
    ctx.write_primary_footer().unwrap();
    let end = vhdfmt::sectors_to_bytes(ctx.next_db) + 512;
    ctx.file().set_len(end).unwrap();

    sector
}

fn reason(err: VhdError) -> String {
    match err {
        VhdError::InvalidFormat { reason, .. } => reason,
        other => panic!("expected format error, got {other}"),
    }
}

#[test]
fn clean_images_pass() {
    let dir = tempfile::tempdir().unwrap();
    let path = sparse_image(dir.path(), "ok.vhd", 4);
    check(&path, &CheckOpts::default()).unwrap();

    let child = dir.path().join("child.vhd");
    snapshot(&child, &path, false).unwrap();
    check(
        &child,
        &CheckOpts {
            check_parents: true,
            ..CheckOpts::default()
        },
    )
    .unwrap();
}

#[test]
fn overlapping_bat_entries_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = sparse_image(dir.path(), "overlap.vhd", 4);

    {
        let mut ctx = VhdContext::open(&path, OpenFlags::CACHED).unwrap();
        let first = allocate_block(&mut ctx, 0);
        allocate_block(&mut ctx, 1);

        // Point block 1 at block 0's extent.
        ctx.set_bat_entry(1, first);
        ctx.write_bat_entry(1).unwrap();
        ctx.close().unwrap();
    }

    let err = check(&path, &CheckOpts::default()).unwrap_err();
    let msg = reason(err);
    assert!(msg.contains("clobbers block"), "message was {msg:?}");
    assert!(msg.contains("block 0") || msg.contains("block 1"));
}

#[test]
fn block_inside_headers_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = sparse_image(dir.path(), "lowblock.vhd", 4);

    {
        let mut ctx = VhdContext::open(&path, OpenFlags::CACHED).unwrap();
        allocate_block(&mut ctx, 0);
        // Sector 1 is the dynamic header.
        ctx.set_bat_entry(0, 1);
        ctx.write_bat_entry(0).unwrap();
        ctx.close().unwrap();
    }

    let err = check(&path, &CheckOpts::default()).unwrap_err();
    assert!(reason(err).contains("clobbers headers"));
}

#[test]
fn batmap_claiming_unallocated_block_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = sparse_image(dir.path(), "batmap.vhd", 4);

    {
        let mut ctx = VhdContext::open(&path, OpenFlags::CACHED).unwrap();
        ctx.read_batmap().unwrap();
        ctx.batmap.as_mut().unwrap().set(1);
        ctx.write_batmap().unwrap();
        ctx.close().unwrap();
    }

    let err = check(&path, &CheckOpts::default()).unwrap_err();
    assert!(reason(err).contains("batmap shows unallocated block 1 full"));
}

#[test]
fn corrupt_footer_checksum_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = sparse_image(dir.path(), "badsum.vhd", 2);

    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        let eof = file.metadata().unwrap().len();
        // Flip a byte inside both footers' timestamp field.
        file.write_all_at(&[0xff], 24).unwrap();
        file.write_all_at(&[0xff], eof - 512 + 24).unwrap();
    }

    let err = check(&path, &CheckOpts::default()).unwrap_err();
    assert!(reason(err).contains("invalid checksum"));
}

#[test]
fn missing_parent_fails_locator_check() {
    let dir = tempfile::tempdir().unwrap();
    let parent = sparse_image(dir.path(), "gone.vhd", 2);
    let child = dir.path().join("child.vhd");
    snapshot(&child, &parent, false).unwrap();

    std::fs::remove_file(&parent).unwrap();

    let err = check(&child, &CheckOpts::default()).unwrap_err();
    let msg = reason(err);
    assert!(
        msg.contains("missing file") || msg.contains("could not find parent"),
        "message was {msg:?}"
    );
}
