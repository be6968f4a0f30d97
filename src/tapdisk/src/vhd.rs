//! Asynchronous VHD driver.
//!
//! A note on write transactions: writes that require updating the BAT or a
//! block bitmap cannot be signalled complete until every update has reached
//! disk. Data writes against the same bitmap are grouped in a transaction;
//! only once all of them have landed is the bitmap written (from the shadow
//! copy), and only after the bitmap write returns are the data writes
//! signalled. Allocating writes additionally extend the file, schedule a
//! zero-bitmap write as the transaction's first member and carry the BAT
//! update: the BAT write is issued once the zeroed bitmap is on disk, and
//! the bitmap write-back starts only after the whole membership (data,
//! zero-bitmap, BAT) has resolved.
//!
//! Errors travel as positive errnos.

use std::os::fd::AsRawFd;
use std::rc::Rc;

use aioq::{prep_read, prep_write, Token, Tqueue};
use bitflags::bitflags;
use tracing::{debug, error, warn};
use vhdfmt::bitmap;
use vhdfmt::buf::AlignedBuf;
use vhdfmt::crypto::XtsContext;
use vhdfmt::{
    sectors_to_bytes, DiskType, OpenFlags, VhdContext, DD_BLK_UNUSED, VHD_SECTOR_SHIFT,
};

use crate::{Result, TdError};

pub const VHD_CACHE_SIZE: usize = 32;

/// Data-request pool size: enough for every ring slot at maximal
/// fragmentation.
pub const VHD_REQS_DATA: usize = crate::MAX_REQUESTS * crate::MAX_SEGMENTS_PER_REQ;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReqFlags: u8 {
        const UPDATE_BAT    = 1 << 0;
        const UPDATE_BITMAP = 1 << 1;
        const QUEUED        = 1 << 2;
        const FINISHED      = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxStatus: u8 {
        const LIVE       = 1 << 0;
        const UPDATE_BAT = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BmStatus: u8 {
        const READ_PENDING  = 1 << 0;
        const WRITE_PENDING = 1 << 1;
        const LOCKED        = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BatStatus: u8 {
        const LOCKED        = 1 << 0;
        const WRITE_STARTED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VhdOp {
    #[default]
    None,
    BatWrite,
    DataRead,
    DataWrite,
    BitmapRead,
    BitmapWrite,
    ZeroBmWrite,
}

/// A request drawn from the data pool or embedded in a metadata owner.
#[derive(Debug, Default)]
struct VhdRequest {
    op: VhdOp,
    lsec: u64,
    nr_secs: u32,
    buf: u64,
    error: i32,
    flags: ReqFlags,
    /// Block whose transaction this request belongs to.
    tx_blk: Option<u32>,
    origin: u64,
    /// Owned ciphertext for encrypted writes; the caller's buffer is never
    /// mutated.
    crypt_buf: Option<AlignedBuf>,
}

impl VhdRequest {
    fn clear(&mut self) {
        *self = VhdRequest::default();
    }
}

/// Transaction over one block's bitmap.
#[derive(Debug, Default)]
struct Tx {
    status: TxStatus,
    error: i32,
    started: u32,
    finished: u32,
    closed: bool,
    /// Data-request pool ids; the zero-bitmap and BAT members count in
    /// `started`/`finished` only.
    data_reqs: Vec<usize>,
}

impl Tx {
    fn completed(&self) -> bool {
        self.started == self.finished
    }
}

/// One resident block bitmap.
struct VhdBitmap {
    blk: u32,
    seqno: u64,
    status: BmStatus,
    /// Canonical bitmap as last committed to disk.
    map: AlignedBuf,
    /// Working copy; becomes canonical only after its disk write succeeds.
    shadow: AlignedBuf,
    tx: Tx,
    /// Data writes waiting to form the next transaction.
    queued: Vec<usize>,
    /// Requests blocked on the pending bitmap read.
    waiting: Vec<WaitingReq>,
    req: VhdRequest,
}

struct WaitingReq {
    op: VhdOp,
    lsec: u64,
    nr_secs: u32,
    buf: u64,
    origin: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    /// In flight; a later `Done`/`Error` event resolves it.
    Submitted,
    /// Not backed by this image; consult the parent (or read zeros).
    NotAllocated,
    Done,
    /// Positive errno.
    Error(i32),
}

#[derive(Debug, Clone, Copy)]
pub struct DriverEvent {
    pub origin: u64,
    pub lsec: u64,
    pub secs: u32,
    pub status: SpanStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqRef {
    Data(usize),
    Bitmap(usize),
    Bat,
    ZeroBm,
}

const TOKEN_CLASS_SHIFT: u64 = 32;
const TOKEN_IMAGE_SHIFT: u64 = 40;

fn encode_token(image: u8, req: ReqRef) -> Token {
    let (class, idx) = match req {
        ReqRef::Data(idx) => (0u64, idx as u64),
        ReqRef::Bitmap(slot) => (1, slot as u64),
        ReqRef::Bat => (2, 0),
        ReqRef::ZeroBm => (3, 0),
    };
    ((image as u64) << TOKEN_IMAGE_SHIFT) | (class << TOKEN_CLASS_SHIFT) | idx
}

/// Which image in the chain a completion token belongs to.
pub fn token_image(token: Token) -> u8 {
    (token >> TOKEN_IMAGE_SHIFT) as u8
}

fn decode_token(token: Token) -> ReqRef {
    let class = (token >> TOKEN_CLASS_SHIFT) & 0xff;
    let idx = (token & 0xffff_ffff) as usize;
    match class {
        0 => ReqRef::Data(idx),
        1 => ReqRef::Bitmap(idx),
        2 => ReqRef::Bat,
        _ => ReqRef::ZeroBm,
    }
}

enum BmLookup {
    BatLocked,
    BatClear,
    BitClear,
    BitSet,
    NotCached,
    ReadPending,
    OutOfRange,
}

pub struct VhdDriver {
    ctx: VhdContext,
    image: u8,

    bat_status: BatStatus,
    pbw_blk: u32,
    pbw_offset: u64,
    bat_error: i32,
    bat_buf: AlignedBuf,
    /// Preallocation image: a zeroed page (covers the bitmap and alignment
    /// gap) followed by poisoned data sectors.
    zeros: AlignedBuf,

    cache: [Option<Box<VhdBitmap>>; VHD_CACHE_SIZE],
    bm_free: Vec<Box<VhdBitmap>>,
    bm_lru: u64,

    reqs: Vec<VhdRequest>,
    req_free: Vec<usize>,

    xts: Option<Rc<XtsContext>>,

    queued: u64,
    completed: u64,
    returned: u64,
    reads: u64,
    read_secs: u64,
    writes: u64,
    write_secs: u64,
}

impl VhdDriver {
    pub fn open(
        path: impl AsRef<std::path::Path>,
        flags: OpenFlags,
        image: u8,
        xts: Option<Rc<XtsContext>>,
    ) -> Result<VhdDriver> {
        let ctx = VhdContext::open(path, flags)?;

        let map_bytes = sectors_to_bytes(ctx.bm_secs.max(1) as u64) as usize;
        let page = page_bytes();
        let zsize = page + sectors_to_bytes(ctx.spb.max(1) as u64) as usize;
        let mut zeros = AlignedBuf::filled(zsize, 0x5a);
        zeros[..page].fill(0);

        let mut bm_free = Vec::with_capacity(VHD_CACHE_SIZE);
        if ctx.is_sparse() {
            for _ in 0..VHD_CACHE_SIZE {
                bm_free.push(Box::new(VhdBitmap {
                    blk: 0,
                    seqno: 0,
                    status: BmStatus::default(),
                    map: AlignedBuf::zeroed(map_bytes),
                    shadow: AlignedBuf::zeroed(map_bytes),
                    tx: Tx::default(),
                    queued: Vec::new(),
                    waiting: Vec::new(),
                    req: VhdRequest::default(),
                }));
            }
        }

        Ok(VhdDriver {
            ctx,
            image,
            bat_status: BatStatus::default(),
            pbw_blk: 0,
            pbw_offset: 0,
            bat_error: 0,
            bat_buf: AlignedBuf::zeroed(vhdfmt::VHD_SECTOR_SIZE as usize),
            zeros,
            cache: std::array::from_fn(|_| None),
            bm_free,
            bm_lru: 0,
            reqs: (0..VHD_REQS_DATA).map(|_| VhdRequest::default()).collect(),
            req_free: (0..VHD_REQS_DATA).rev().collect(),
            xts,
            queued: 0,
            completed: 0,
            returned: 0,
            reads: 0,
            read_secs: 0,
            writes: 0,
            write_secs: 0,
        })
    }

    pub fn close(self) -> Result<()> {
        debug!(
            queued = self.queued,
            completed = self.completed,
            returned = self.returned,
            reads = self.reads,
            writes = self.writes,
            "closing vhd driver"
        );
        self.ctx.close()?;
        Ok(())
    }

    pub fn context(&self) -> &VhdContext {
        &self.ctx
    }

    /// Attach the chain's encryption context after key discovery.
    pub fn set_xts(&mut self, xts: Option<Rc<XtsContext>>) {
        self.xts = xts;
    }

    pub fn context_mut(&mut self) -> &mut VhdContext {
        &mut self.ctx
    }

    pub fn sectors(&self) -> u64 {
        self.ctx.footer.curr_size >> VHD_SECTOR_SHIFT
    }

    pub fn spb(&self) -> u32 {
        self.ctx.spb
    }

    pub fn is_diff(&self) -> bool {
        self.ctx.footer.disk_type == DiskType::Diff
    }

    /// No requests in flight or parked anywhere in the driver.
    pub fn idle(&self) -> bool {
        self.req_free.len() == VHD_REQS_DATA
            && !self.bat_status.contains(BatStatus::LOCKED)
            && self.cache.iter().flatten().all(|bm| !self.bitmap_in_use(bm))
    }

    // ---- bitmap cache ------------------------------------------------

    fn get_bitmap(&self, blk: u32) -> Option<usize> {
        self.cache
            .iter()
            .position(|e| e.as_ref().is_some_and(|bm| bm.blk == blk))
    }

    fn bitmap_in_use(&self, bm: &VhdBitmap) -> bool {
        bm.status
            .intersects(BmStatus::READ_PENDING | BmStatus::WRITE_PENDING)
            || bm.tx.status.contains(TxStatus::UPDATE_BAT)
            || !bm.waiting.is_empty()
            || !bm.tx.data_reqs.is_empty()
            || bm.tx.started != bm.tx.finished
            || !bm.queued.is_empty()
    }

    fn lru_seqno(&mut self) -> u64 {
        if self.bm_lru == 0xffff_ffff {
            self.bm_lru = 0;
            for bm in self.cache.iter_mut().flatten() {
                bm.seqno >>= 1;
                self.bm_lru = self.bm_lru.max(bm.seqno);
            }
        }
        self.bm_lru += 1;
        self.bm_lru
    }

    fn touch_bitmap(&mut self, slot: usize) {
        let seqno = self.lru_seqno();
        if let Some(bm) = self.cache[slot].as_mut() {
            bm.seqno = seqno;
        }
    }

    fn evict_lru_bitmap(&mut self) -> Option<Box<VhdBitmap>> {
        let mut victim: Option<(usize, u64)> = None;
        for (i, entry) in self.cache.iter().enumerate() {
            if let Some(bm) = entry {
                if bm.status.contains(BmStatus::LOCKED) {
                    continue;
                }
                if victim.map_or(true, |(_, seq)| bm.seqno < seq) {
                    victim = Some((i, bm.seqno));
                }
            }
        }

        let (slot, _) = victim?;
        let bm = self.cache[slot].take().expect("victim occupied");
        debug_assert!(!self.bitmap_in_use(&bm));
        Some(bm)
    }

    /// Take a cache entry for `blk`, evicting if the free pool is dry.
    fn alloc_bitmap(&mut self, blk: u32) -> Result<Box<VhdBitmap>> {
        let mut bm = match self.bm_free.pop() {
            Some(bm) => bm,
            None => self.evict_lru_bitmap().ok_or(TdError::Busy)?,
        };

        bm.blk = blk;
        bm.seqno = 0;
        bm.status = BmStatus::default();
        bm.tx = Tx::default();
        bm.queued.clear();
        bm.waiting.clear();
        bm.map.fill(0);
        bm.shadow.fill(0);
        bm.req.clear();
        Ok(bm)
    }

    fn install_bitmap(&mut self, bm: Box<VhdBitmap>) -> usize {
        let slot = self
            .cache
            .iter()
            .position(|e| e.is_none())
            .expect("bitmap cache has a free slot");
        self.cache[slot] = Some(bm);
        self.touch_bitmap(slot);
        slot
    }

    fn release_bitmap(&mut self, slot: usize) {
        let bm = self.cache[slot].take().expect("releasing live bitmap");
        self.bm_free.push(bm);
    }

    /// Batmap shortcut: a set bit asserts the whole block's bitmap is ones,
    /// so the bitmap read can be skipped.
    fn batmap_full(&self, blk: u32) -> bool {
        self.ctx
            .batmap
            .as_ref()
            .is_some_and(|batmap| batmap.test(blk))
    }

    fn read_bitmap_cache(&mut self, sector: u64, write: bool) -> BmLookup {
        if self.ctx.footer.disk_type == DiskType::Fixed {
            return BmLookup::BitSet;
        }

        let blk = (sector / self.ctx.spb as u64) as u32;
        let sec = sector % self.ctx.spb as u64;

        if blk >= self.ctx.header.max_bat_size {
            error!(sector, blk, "sector out of range");
            return BmLookup::OutOfRange;
        }

        if self.ctx.bat_entry(blk) == DD_BLK_UNUSED {
            if write && self.bat_status.contains(BatStatus::LOCKED) && self.pbw_blk != blk {
                return BmLookup::BatLocked;
            }
            return BmLookup::BatClear;
        }

        if self.batmap_full(blk) {
            return BmLookup::BitSet;
        }

        let Some(slot) = self.get_bitmap(blk) else {
            return BmLookup::NotCached;
        };

        self.touch_bitmap(slot);

        let bm = self.cache[slot].as_ref().expect("cached bitmap");
        if bm.status.contains(BmStatus::READ_PENDING) {
            return BmLookup::ReadPending;
        }

        if bitmap::test_bit(self.ctx.bitmap_format, &bm.map, sec) {
            BmLookup::BitSet
        } else {
            BmLookup::BitClear
        }
    }

    /// Length of the run of sectors (from `sector`, at most `nr_secs`, never
    /// crossing the block) whose bitmap state equals `value`.
    fn bitmap_span(&self, sector: u64, nr_secs: u32, value: bool) -> u32 {
        if self.ctx.footer.disk_type == DiskType::Fixed {
            return nr_secs;
        }

        let blk = (sector / self.ctx.spb as u64) as u32;
        let mut sec = sector % self.ctx.spb as u64;

        if self.batmap_full(blk) {
            return nr_secs.min((self.ctx.spb as u64 - sec) as u32);
        }

        let slot = self.get_bitmap(blk).expect("bitmap resident for span scan");
        let bm = self.cache[slot].as_ref().expect("cached bitmap");
        debug_assert!(!bm.status.contains(BmStatus::READ_PENDING));

        let mut span = 0;
        while sec < self.ctx.spb as u64 && span < nr_secs {
            if bitmap::test_bit(self.ctx.bitmap_format, &bm.map, sec) != value {
                break;
            }
            sec += 1;
            span += 1;
        }
        span
    }

    // ---- request pool ------------------------------------------------

    fn alloc_request(&mut self) -> Option<usize> {
        let id = self.req_free.pop()?;
        debug_assert_eq!(self.reqs[id].nr_secs, 0);
        Some(id)
    }

    fn free_request(&mut self, id: usize) {
        self.reqs[id].clear();
        self.req_free.push(id);
    }

    // ---- submission helpers -------------------------------------------

    fn aio_read(&mut self, q: &mut Tqueue, req: ReqRef, buf: u64, bytes: u64, offset: u64) {
        let token = encode_token(self.image, req);
        // Safety: the buffer belongs to the request (or its caller) and
        // lives until the completion is routed back here.
        let tiocb = unsafe {
            prep_read(
                self.ctx.file().as_raw_fd(),
                buf as *mut u8,
                bytes,
                offset as i64,
                token,
            )
        };
        if let Err(e) = q.queue(tiocb) {
            error!("failed to queue read: {e}");
        }

        self.queued += 1;
        self.reads += 1;
        self.read_secs += bytes >> VHD_SECTOR_SHIFT;
    }

    fn aio_write(&mut self, q: &mut Tqueue, req: ReqRef, buf: u64, bytes: u64, offset: u64) {
        let token = encode_token(self.image, req);
        // Safety: as in aio_read.
        let tiocb = unsafe {
            prep_write(
                self.ctx.file().as_raw_fd(),
                buf as *const u8,
                bytes,
                offset as i64,
                token,
            )
        };
        if let Err(e) = q.queue(tiocb) {
            error!("failed to queue write: {e}");
        }

        self.queued += 1;
        self.writes += 1;
        self.write_secs += bytes >> VHD_SECTOR_SHIFT;
    }

    // ---- block allocation ---------------------------------------------

    /// Begin allocating `blk`: extend the file so the block's bitmap and
    /// data region exist on disk before any metadata points at them, then
    /// open the allocation transaction with its zero-bitmap write.
    fn allocate_block(&mut self, q: &mut Tqueue, blk: u32) -> std::result::Result<(), i32> {
        debug_assert_eq!(self.ctx.bat_entry(blk), DD_BLK_UNUSED);

        if self.bat_status.contains(BatStatus::LOCKED) {
            // Joining the allocation already in progress for this block.
            debug_assert_eq!(self.pbw_blk, blk);
            if self.bat_error != 0 {
                return Err(libc::EBUSY);
            }
            return Ok(());
        }

        let offset = sectors_to_bytes(self.ctx.next_db);
        let size = sectors_to_bytes(self.ctx.spb as u64 + self.ctx.bm_secs as u64) as usize;
        if size > self.zeros.len() {
            error!(size, zeros = self.zeros.len(), "preallocation buffer too small");
        }
        let size = size.min(self.zeros.len());

        if let Err(e) = self.ctx.write_at(offset, &self.zeros[..size]) {
            error!("block preallocation failed: {e}");
            return Err(e.errno() as i32);
        }

        self.pbw_blk = blk;
        self.pbw_offset = self.ctx.next_db;
        self.bat_error = 0;
        self.bat_status.insert(BatStatus::LOCKED);

        // An empty bitmap may already be resident if an earlier BAT update
        // failed.
        let slot = match self.get_bitmap(blk) {
            Some(slot) => slot,
            None => {
                let bm = match self.alloc_bitmap(blk) {
                    Ok(bm) => bm,
                    Err(_) => {
                        self.bat_status = BatStatus::default();
                        return Err(libc::EBUSY);
                    }
                };
                self.install_bitmap(bm)
            }
        };

        self.schedule_zero_bm_write(q, slot);
        let bm = self.cache[slot].as_mut().expect("cached bitmap");
        bm.tx.status.insert(TxStatus::UPDATE_BAT);

        Ok(())
    }

    fn schedule_zero_bm_write(&mut self, q: &mut Tqueue, slot: usize) {
        let offset = sectors_to_bytes(self.pbw_offset);
        let bytes = sectors_to_bytes(self.ctx.bm_secs as u64);

        debug!(blk = self.pbw_blk, offset, "writing zero bitmap");

        {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            bm.status.insert(BmStatus::LOCKED);
            bm.tx.started += 1;
            bm.tx.status.insert(TxStatus::LIVE);
        }

        let buf = self.zeros.as_ptr() as u64;
        self.aio_write(q, ReqRef::ZeroBm, buf, bytes, offset);
    }

    fn schedule_bat_write(&mut self, q: &mut Tqueue) {
        debug_assert!(self.bat_status.contains(BatStatus::LOCKED));

        let blk = self.pbw_blk;
        let first = (blk as usize / 128) * 128;

        // Stage the BAT sector with the new entry patched in.
        for i in 0..128 {
            let entry = if first + i == blk as usize {
                self.pbw_offset as u32
            } else {
                self.ctx
                    .bat
                    .get(first + i)
                    .copied()
                    .unwrap_or(DD_BLK_UNUSED)
            };
            self.bat_buf[i * 4..i * 4 + 4].copy_from_slice(&entry.to_be_bytes());
        }

        let offset = self.ctx.header.table_offset + first as u64 * 4;

        let slot = self.get_bitmap(blk).expect("allocating block's bitmap");
        self.cache[slot].as_mut().expect("cached bitmap").tx.started += 1;

        debug!(blk, pbw_offset = self.pbw_offset, offset, "writing bat");

        let buf = self.bat_buf.as_ptr() as u64;
        self.aio_write(q, ReqRef::Bat, buf, vhdfmt::VHD_SECTOR_SIZE, offset);
        self.bat_status.insert(BatStatus::WRITE_STARTED);
    }

    // ---- data paths ----------------------------------------------------

    fn schedule_data_read(
        &mut self,
        q: &mut Tqueue,
        sector: u64,
        nr_secs: u32,
        buf: u64,
        origin: u64,
    ) -> std::result::Result<(), i32> {
        let offset = if self.ctx.footer.disk_type == DiskType::Fixed {
            sector << VHD_SECTOR_SHIFT
        } else {
            let blk = (sector / self.ctx.spb as u64) as u32;
            let sec = (sector % self.ctx.spb as u64) as u32;
            let entry = self.ctx.bat_entry(blk);
            debug_assert_ne!(entry, DD_BLK_UNUSED);
            sectors_to_bytes(entry as u64 + self.ctx.bm_secs as u64 + sec as u64)
        };

        let id = self.alloc_request().ok_or(libc::EBUSY)?;
        let req = &mut self.reqs[id];
        req.op = VhdOp::DataRead;
        req.lsec = sector;
        req.nr_secs = nr_secs;
        req.buf = buf;
        req.origin = origin;

        self.aio_read(q, ReqRef::Data(id), buf, sectors_to_bytes(nr_secs as u64), offset);
        Ok(())
    }

    fn schedule_data_write(
        &mut self,
        q: &mut Tqueue,
        sector: u64,
        nr_secs: u32,
        buf: u64,
        flags: ReqFlags,
        origin: u64,
    ) -> std::result::Result<(), i32> {
        let offset;
        let mut blk = 0;

        if self.ctx.footer.disk_type == DiskType::Fixed {
            offset = sector << VHD_SECTOR_SHIFT;
        } else {
            blk = (sector / self.ctx.spb as u64) as u32;
            let sec = sector % self.ctx.spb as u64;
            let mut entry = self.ctx.bat_entry(blk) as u64;

            if flags.contains(ReqFlags::UPDATE_BAT) {
                self.allocate_block(q, blk)?;
                entry = self.pbw_offset;
            }

            offset = sectors_to_bytes(entry + self.ctx.bm_secs as u64 + sec);
        }

        let id = self.alloc_request().ok_or(libc::EBUSY)?;

        // Writes against an encrypted chain hit the disk from an owned
        // ciphertext copy.
        let mut submit_buf = buf;
        if let Some(xts) = self.xts.clone() {
            let bytes = sectors_to_bytes(nr_secs as u64) as usize;
            let mut crypt = AlignedBuf::zeroed(bytes);
            // Safety: caller guarantees `buf` spans nr_secs sectors.
            unsafe {
                std::ptr::copy_nonoverlapping(buf as *const u8, crypt.as_mut_ptr(), bytes);
            }
            xts.encrypt(sector, &mut crypt);
            submit_buf = crypt.as_ptr() as u64;
            self.reqs[id].crypt_buf = Some(crypt);
        }

        {
            let req = &mut self.reqs[id];
            req.op = VhdOp::DataWrite;
            req.lsec = sector;
            req.nr_secs = nr_secs;
            req.buf = buf;
            req.flags = flags;
            req.origin = origin;
        }

        if flags.contains(ReqFlags::UPDATE_BITMAP) {
            let slot = self.get_bitmap(blk).expect("bitmap resident for write");
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            debug_assert!(!bm.status.contains(BmStatus::READ_PENDING));
            bm.status.insert(BmStatus::LOCKED);

            if bm.tx.closed {
                // No new members once the bitmap write-back is underway;
                // this write seeds the next transaction.
                bm.queued.push(id);
                self.reqs[id].flags.insert(ReqFlags::QUEUED);
            } else {
                bm.tx.started += 1;
                bm.tx.status.insert(TxStatus::LIVE);
                bm.tx.data_reqs.push(id);
                self.reqs[id].tx_blk = Some(blk);
            }
        }

        self.aio_write(
            q,
            ReqRef::Data(id),
            submit_buf,
            sectors_to_bytes(nr_secs as u64),
            offset,
        );
        Ok(())
    }

    fn schedule_bitmap_read(&mut self, q: &mut Tqueue, blk: u32) -> std::result::Result<(), i32> {
        debug_assert_ne!(self.ctx.footer.disk_type, DiskType::Fixed);
        debug_assert!(self.get_bitmap(blk).is_none());

        let entry = self.ctx.bat_entry(blk);
        debug_assert_ne!(entry, DD_BLK_UNUSED);
        let offset = sectors_to_bytes(entry as u64);

        let bm = self.alloc_bitmap(blk).map_err(|_| libc::EBUSY)?;
        let slot = self.install_bitmap(bm);

        let bytes = sectors_to_bytes(self.ctx.bm_secs as u64);
        let buf = {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            bm.req.clear();
            bm.req.op = VhdOp::BitmapRead;
            bm.req.lsec = blk as u64 * self.ctx.spb as u64;
            bm.req.nr_secs = self.ctx.bm_secs;
            bm.status.insert(BmStatus::LOCKED | BmStatus::READ_PENDING);
            bm.map.as_ptr() as u64
        };

        debug!(blk, offset, "reading bitmap");
        self.aio_read(q, ReqRef::Bitmap(slot), buf, bytes, offset);
        Ok(())
    }

    fn schedule_bitmap_write(&mut self, q: &mut Tqueue, blk: u32) {
        let slot = self.get_bitmap(blk).expect("bitmap resident for write-back");

        let mut entry = self.ctx.bat_entry(blk);
        if entry == DD_BLK_UNUSED {
            debug_assert!(self.bat_status.contains(BatStatus::LOCKED));
            debug_assert_eq!(self.pbw_blk, blk);
            entry = self.pbw_offset as u32;
        }
        let offset = sectors_to_bytes(entry as u64);
        let bytes = sectors_to_bytes(self.ctx.bm_secs as u64);

        let buf = {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            debug_assert!(!bm
                .status
                .intersects(BmStatus::READ_PENDING | BmStatus::WRITE_PENDING));
            bm.req.clear();
            bm.req.op = VhdOp::BitmapWrite;
            bm.req.lsec = blk as u64 * self.ctx.spb as u64;
            bm.req.nr_secs = self.ctx.bm_secs;
            bm.status.insert(BmStatus::LOCKED | BmStatus::WRITE_PENDING);
            bm.shadow.as_ptr() as u64
        };

        self.touch_bitmap(slot);
        debug!(blk, offset, "writing bitmap");
        self.aio_write(q, ReqRef::Bitmap(slot), buf, bytes, offset);
    }

    /// Park a request until the block's bitmap read completes.
    fn queue_waiting(&mut self, op: VhdOp, sector: u64, nr_secs: u32, buf: u64, origin: u64) {
        let blk = (sector / self.ctx.spb as u64) as u32;
        let slot = self.get_bitmap(blk).expect("bitmap being read");

        let bm = self.cache[slot].as_mut().expect("cached bitmap");
        debug_assert!(bm.status.contains(BmStatus::READ_PENDING));
        bm.status.insert(BmStatus::LOCKED);
        bm.waiting.push(WaitingReq {
            op,
            lsec: sector,
            nr_secs,
            buf,
            origin,
        });
    }

    // ---- top-level queueing -------------------------------------------

    fn push_event(out: &mut Vec<DriverEvent>, origin: u64, lsec: u64, secs: u32, status: SpanStatus) {
        out.push(DriverEvent {
            origin,
            lsec,
            secs,
            status,
        });
    }

    /// Walk `nr_secs` from `sector`, splitting on block and bitmap-state
    /// boundaries. Each span resolves to a submitted read, a parent
    /// fall-through (`NotAllocated`) or an inline error covering the rest
    /// of the request.
    pub fn queue_read(
        &mut self,
        q: &mut Tqueue,
        sector: u64,
        nr_secs: u32,
        buf: *mut u8,
        origin: u64,
        out: &mut Vec<DriverEvent>,
    ) {
        let mut sec = sector;
        let end = sector + nr_secs as u64;
        let mut buf = buf as u64;

        while sec < end {
            let remaining = (end - sec) as u32;
            let blk_span =
                remaining.min((self.ctx.spb as u64 - sec % self.ctx.spb as u64).max(1) as u32);

            let res: std::result::Result<(u32, SpanStatus), i32> =
                match self.read_bitmap_cache(sec, false) {
                    BmLookup::OutOfRange => Err(libc::EINVAL),

                    BmLookup::BatClear => Ok((blk_span, SpanStatus::NotAllocated)),

                    BmLookup::BitClear => Ok((
                        self.bitmap_span(sec, remaining, false),
                        SpanStatus::NotAllocated,
                    )),

                    BmLookup::BitSet => {
                        let n = self.bitmap_span(sec, remaining, true);
                        self.schedule_data_read(q, sec, n, buf, origin)
                            .map(|()| (n, SpanStatus::Submitted))
                    }

                    BmLookup::NotCached => self
                        .schedule_bitmap_read(q, (sec / self.ctx.spb as u64) as u32)
                        .map(|()| {
                            self.queue_waiting(VhdOp::DataRead, sec, blk_span, buf, origin);
                            (blk_span, SpanStatus::Submitted)
                        }),

                    BmLookup::ReadPending => {
                        self.queue_waiting(VhdOp::DataRead, sec, blk_span, buf, origin);
                        Ok((blk_span, SpanStatus::Submitted))
                    }

                    // Readers never observe the BAT lock.
                    BmLookup::BatLocked => unreachable!("BAT lock on read path"),
                };

            match res {
                Ok((n, status)) => {
                    Self::push_event(out, origin, sec, n, status);
                    sec += n as u64;
                    buf += sectors_to_bytes(n as u64);
                }
                Err(e) => {
                    Self::push_event(out, origin, sec, remaining, SpanStatus::Error(e));
                    return;
                }
            }
        }
    }

    pub fn queue_write(
        &mut self,
        q: &mut Tqueue,
        sector: u64,
        nr_secs: u32,
        buf: *const u8,
        origin: u64,
        out: &mut Vec<DriverEvent>,
    ) {
        let mut sec = sector;
        let end = sector + nr_secs as u64;
        let mut buf = buf as u64;

        while sec < end {
            let remaining = (end - sec) as u32;
            let blk_span =
                remaining.min((self.ctx.spb as u64 - sec % self.ctx.spb as u64).max(1) as u32);

            let res: std::result::Result<u32, i32> = match self.read_bitmap_cache(sec, true) {
                BmLookup::OutOfRange => Err(libc::EINVAL),

                BmLookup::BatLocked => Err(libc::EBUSY),

                BmLookup::BatClear => self
                    .schedule_data_write(
                        q,
                        sec,
                        blk_span,
                        buf,
                        ReqFlags::UPDATE_BAT | ReqFlags::UPDATE_BITMAP,
                        origin,
                    )
                    .map(|()| blk_span),

                BmLookup::BitClear => {
                    let n = self.bitmap_span(sec, remaining, false);
                    self.schedule_data_write(q, sec, n, buf, ReqFlags::UPDATE_BITMAP, origin)
                        .map(|()| n)
                }

                BmLookup::BitSet => {
                    let n = self.bitmap_span(sec, remaining, true);
                    self.schedule_data_write(q, sec, n, buf, ReqFlags::empty(), origin)
                        .map(|()| n)
                }

                BmLookup::NotCached => self
                    .schedule_bitmap_read(q, (sec / self.ctx.spb as u64) as u32)
                    .map(|()| {
                        self.queue_waiting(VhdOp::DataWrite, sec, blk_span, buf, origin);
                        blk_span
                    }),

                BmLookup::ReadPending => {
                    self.queue_waiting(VhdOp::DataWrite, sec, blk_span, buf, origin);
                    Ok(blk_span)
                }
            };

            match res {
                Ok(n) => {
                    Self::push_event(out, origin, sec, n, SpanStatus::Submitted);
                    sec += n as u64;
                    buf += sectors_to_bytes(n as u64);
                }
                Err(e) => {
                    Self::push_event(out, origin, sec, remaining, SpanStatus::Error(e));
                    return;
                }
            }
        }
    }

    // ---- completion ----------------------------------------------------

    fn signal_data_req(&mut self, id: usize, error: i32, out: &mut Vec<DriverEvent>) {
        let req = &self.reqs[id];
        let err = if error != 0 { error } else { req.error };

        Self::push_event(
            out,
            req.origin,
            req.lsec,
            req.nr_secs,
            if err != 0 {
                SpanStatus::Error(err)
            } else {
                SpanStatus::Done
            },
        );

        self.returned += 1;
        self.free_request(id);
    }

    /// Fold any writes queued behind a closed transaction into a fresh one.
    fn start_new_bitmap_transaction(
        &mut self,
        q: &mut Tqueue,
        slot: usize,
        out: &mut Vec<DriverEvent>,
    ) {
        let (blk, queued) = {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            if bm.queued.is_empty() {
                return;
            }
            (bm.blk, std::mem::take(&mut bm.queued))
        };

        debug!(blk, n = queued.len(), "starting queued transaction");

        // Writes queued against a block whose allocation ultimately failed
        // can never become durable.
        let orphaned = self.ctx.bat_entry(blk) == DD_BLK_UNUSED;

        for id in queued {
            self.reqs[id].flags.remove(ReqFlags::QUEUED);
            self.reqs[id].tx_blk = Some(blk);

            let finished = self.reqs[id].flags.contains(ReqFlags::FINISHED);
            let error = self.reqs[id].error;
            let lsec = self.reqs[id].lsec;
            let nr_secs = self.reqs[id].nr_secs;
            let fmt = self.ctx.bitmap_format;

            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            bm.tx.started += 1;
            bm.tx.status.insert(TxStatus::LIVE);
            bm.tx.data_reqs.push(id);
            if orphaned {
                bm.tx.error = libc::EIO;
            }

            if finished {
                bm.tx.finished += 1;
                if error == 0 {
                    let sec = lsec % self.ctx.spb as u64;
                    for i in 0..nr_secs as u64 {
                        bitmap::set_bit(fmt, &mut bm.shadow, sec + i);
                    }
                }
            }
        }

        // Perhaps every queued write had already completed.
        let bm = self.cache[slot].as_ref().expect("cached bitmap");
        if bm.tx.started > 0 && bm.tx.completed() {
            self.finish_data_transaction(q, slot, out);
        }
    }

    fn finish_bat_transaction(&mut self, slot: usize) {
        if !self.bat_status.contains(BatStatus::LOCKED) {
            return;
        }

        let bm = self.cache[slot].as_mut().expect("cached bitmap");
        if self.pbw_blk != bm.blk {
            return;
        }

        if self.bat_error != 0 && bm.tx.status.contains(TxStatus::LIVE) {
            // Keep the failed allocation pinned until its transaction
            // resolves; new writers queue behind it.
            bm.tx.closed = true;
            return;
        }

        debug!(blk = bm.blk, "releasing bat lock");
        self.bat_status = BatStatus::default();
        self.pbw_blk = 0;
        self.pbw_offset = 0;
        self.bat_error = 0;
    }

    fn finish_bitmap_transaction(
        &mut self,
        q: &mut Tqueue,
        slot: usize,
        error: i32,
        out: &mut Vec<DriverEvent>,
    ) {
        let (tx_error, data_reqs) = {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            bm.tx.error = if bm.tx.error != 0 { bm.tx.error } else { error };
            let error = bm.tx.error;

            if error != 0 {
                // Roll the shadow back to the last committed state.
                let (map, shadow) = (&bm.map, &mut bm.shadow);
                shadow.copy_from_slice(map);
            } else {
                // Commit: the write-back landed, the shadow is canonical.
                let (map, shadow) = (&mut bm.map, &bm.shadow);
                map.copy_from_slice(shadow);
            }

            let reqs = std::mem::take(&mut bm.tx.data_reqs);
            bm.tx = Tx::default();
            (error, reqs)
        };

        for id in data_reqs {
            self.signal_data_req(id, tx_error, out);
        }

        self.start_new_bitmap_transaction(q, slot, out);

        {
            let in_use = {
                let bm = self.cache[slot].as_ref().expect("cached bitmap");
                self.bitmap_in_use(bm)
            };
            if !in_use {
                self.cache[slot]
                    .as_mut()
                    .expect("cached bitmap")
                    .status
                    .remove(BmStatus::LOCKED);
            }
        }

        self.finish_bat_transaction(slot);
    }

    /// All transaction members have landed: close it and write the bitmap
    /// back (or resolve immediately on error).
    fn finish_data_transaction(&mut self, q: &mut Tqueue, slot: usize, out: &mut Vec<DriverEvent>) {
        let (blk, error) = {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            bm.tx.closed = true;
            (bm.blk, bm.tx.error)
        };

        debug!(blk, "data transaction complete");

        if error == 0 {
            self.schedule_bitmap_write(q, blk);
            return;
        }

        self.finish_bitmap_transaction(q, slot, 0, out);
    }

    fn finish_bat_write(&mut self, q: &mut Tqueue, error: i32, out: &mut Vec<DriverEvent>) {
        self.returned += 1;

        let blk = self.pbw_blk;
        let slot = self.get_bitmap(blk).expect("allocating block's bitmap");

        debug!(blk, pbw_offset = self.pbw_offset, error, "bat write finished");
        debug_assert!(self.bat_status.contains(BatStatus::LOCKED));
        debug_assert!(self.bat_status.contains(BatStatus::WRITE_STARTED));

        self.bat_error = error;
        self.bat_status.remove(BatStatus::WRITE_STARTED);

        if error == 0 {
            self.ctx.set_bat_entry(blk, self.pbw_offset as u32);
            self.ctx.mark_dirty();

            // Advance past the new block, re-establishing page alignment of
            // the next data region.
            let mut next_db = self.pbw_offset + self.ctx.spb as u64 + self.ctx.bm_secs as u64;
            let spp = self.ctx.spp as u64;
            let bm_secs = self.ctx.bm_secs as u64;
            if (next_db + bm_secs) % spp != 0 {
                next_db += spp - (next_db + bm_secs) % spp;
            }
            self.ctx.next_db = next_db;
        }

        {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            debug_assert!(bm.tx.status.contains(TxStatus::LIVE));
            bm.tx.finished += 1;
            if error != 0 {
                bm.tx.error = error;
            }
            bm.tx.status.remove(TxStatus::UPDATE_BAT);
        }

        let completed = {
            let bm = self.cache[slot].as_ref().expect("cached bitmap");
            bm.tx.completed()
        };
        if completed {
            self.finish_data_transaction(q, slot, out);
        }

        self.finish_bat_transaction(slot);
    }

    fn finish_zero_bm_write(&mut self, q: &mut Tqueue, error: i32, out: &mut Vec<DriverEvent>) {
        self.returned += 1;

        let blk = self.pbw_blk;
        let slot = self.get_bitmap(blk).expect("allocating block's bitmap");

        debug!(blk, error, "zero bitmap write finished");
        debug_assert!(self.bat_status.contains(BatStatus::LOCKED));

        {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            bm.tx.finished += 1;
        }

        if error != 0 {
            // The allocation is off: release the BAT slot and poison the
            // transaction so its members fail.
            self.bat_status = BatStatus::default();
            self.pbw_blk = 0;
            self.pbw_offset = 0;
            self.bat_error = 0;

            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            bm.tx.error = error;
            bm.tx.status.remove(TxStatus::UPDATE_BAT);
        } else {
            // The bitmap region is durably zeroed: safe to point the BAT at
            // the new block.
            self.schedule_bat_write(q);
        }

        let completed = {
            let bm = self.cache[slot].as_ref().expect("cached bitmap");
            bm.tx.completed()
        };
        if completed {
            self.finish_data_transaction(q, slot, out);
        }
    }

    fn finish_bitmap_read(
        &mut self,
        q: &mut Tqueue,
        slot: usize,
        error: i32,
        out: &mut Vec<DriverEvent>,
    ) {
        self.returned += 1;

        let (blk, waiting) = {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            debug_assert!(bm.status.contains(BmStatus::READ_PENDING));
            bm.status.remove(BmStatus::READ_PENDING);
            (bm.blk, std::mem::take(&mut bm.waiting))
        };

        debug!(blk, error, n_waiting = waiting.len(), "bitmap read finished");

        if error != 0 {
            self.cache[slot]
                .as_mut()
                .expect("cached bitmap")
                .status
                .remove(BmStatus::LOCKED);
            self.release_bitmap(slot);

            for w in waiting {
                Self::push_event(out, w.origin, w.lsec, w.nr_secs, SpanStatus::Error(error));
                self.returned += 1;
            }
            return;
        }

        {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            let (map, shadow) = (&bm.map, &mut bm.shadow);
            shadow.copy_from_slice(map);
        }

        // Requeue every waiter through the top-level paths; the bitmap is
        // resident now, so they resolve to real spans.
        for w in waiting {
            match w.op {
                VhdOp::DataRead => {
                    self.queue_read(q, w.lsec, w.nr_secs, w.buf as *mut u8, w.origin, out)
                }
                VhdOp::DataWrite => {
                    self.queue_write(q, w.lsec, w.nr_secs, w.buf as *const u8, w.origin, out)
                }
                op => unreachable!("unexpected waiting op {op:?}"),
            }
        }

        let in_use = {
            let bm = self.cache[slot].as_ref().expect("cached bitmap");
            self.bitmap_in_use(bm)
        };
        if !in_use {
            self.cache[slot]
                .as_mut()
                .expect("cached bitmap")
                .status
                .remove(BmStatus::LOCKED);
        }
    }

    fn finish_bitmap_write(
        &mut self,
        q: &mut Tqueue,
        slot: usize,
        error: i32,
        out: &mut Vec<DriverEvent>,
    ) {
        self.returned += 1;

        {
            let bm = self.cache[slot].as_mut().expect("cached bitmap");
            debug_assert!(bm.tx.closed);
            debug_assert!(bm.status.contains(BmStatus::WRITE_PENDING));
            bm.status.remove(BmStatus::WRITE_PENDING);
            debug!(
                blk = bm.blk,
                started = bm.tx.started,
                finished = bm.tx.finished,
                "bitmap write finished"
            );
        }

        self.finish_bitmap_transaction(q, slot, error, out);
    }

    fn finish_data_read(&mut self, id: usize, out: &mut Vec<DriverEvent>) {
        if self.reqs[id].error == 0 {
            if let Some(xts) = self.xts.clone() {
                let req = &self.reqs[id];
                let bytes = sectors_to_bytes(req.nr_secs as u64) as usize;
                // Safety: the read completed into this caller-owned buffer.
                let buf = unsafe { std::slice::from_raw_parts_mut(req.buf as *mut u8, bytes) };
                xts.decrypt(req.lsec, buf);
            }
        }

        self.signal_data_req(id, 0, out);
    }

    fn finish_data_write(&mut self, q: &mut Tqueue, id: usize, out: &mut Vec<DriverEvent>) {
        self.reqs[id].flags.insert(ReqFlags::FINISHED);
        self.reqs[id].crypt_buf = None;

        if let Some(blk) = self.reqs[id].tx_blk {
            let slot = self.get_bitmap(blk).expect("transaction bitmap resident");
            let error = self.reqs[id].error;
            let lsec = self.reqs[id].lsec;
            let nr_secs = self.reqs[id].nr_secs;
            let fmt = self.ctx.bitmap_format;

            {
                let bm = self.cache[slot].as_mut().expect("cached bitmap");
                bm.tx.finished += 1;

                if error == 0 {
                    let sec = lsec % self.ctx.spb as u64;
                    for i in 0..nr_secs as u64 {
                        bitmap::set_bit(fmt, &mut bm.shadow, sec + i);
                    }
                }
            }

            let completed = {
                let bm = self.cache[slot].as_ref().expect("cached bitmap");
                bm.tx.completed()
            };
            if completed {
                self.finish_data_transaction(q, slot, out);
            }
        } else if !self.reqs[id].flags.contains(ReqFlags::QUEUED) {
            self.signal_data_req(id, 0, out);
        }
    }

    /// Route one kernel completion back through the request state machine.
    /// `res` is a byte count on success or a negated errno.
    pub fn complete(&mut self, token: Token, res: i64, q: &mut Tqueue, out: &mut Vec<DriverEvent>) {
        self.completed += 1;
        let error = if res < 0 { (-res) as i32 } else { 0 };

        match decode_token(token) {
            ReqRef::Data(id) => {
                self.reqs[id].error = error;
                if error != 0 {
                    warn!(
                        op = ?self.reqs[id].op,
                        lsec = self.reqs[id].lsec,
                        nr_secs = self.reqs[id].nr_secs,
                        error,
                        "aio failed"
                    );
                }
                match self.reqs[id].op {
                    VhdOp::DataRead => self.finish_data_read(id, out),
                    VhdOp::DataWrite => self.finish_data_write(q, id, out),
                    op => unreachable!("data token with op {op:?}"),
                }
            }
            ReqRef::Bitmap(slot) => {
                let op = self.cache[slot]
                    .as_ref()
                    .map(|bm| bm.req.op)
                    .unwrap_or(VhdOp::None);
                match op {
                    VhdOp::BitmapRead => self.finish_bitmap_read(q, slot, error, out),
                    VhdOp::BitmapWrite => self.finish_bitmap_write(q, slot, error, out),
                    op => unreachable!("bitmap token with op {op:?}"),
                }
            }
            ReqRef::Bat => self.finish_bat_write(q, error, out),
            ReqRef::ZeroBm => self.finish_zero_bm_write(q, error, out),
        }
    }
}

fn page_bytes() -> usize {
    // Safety: sysconf is always callable.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}
