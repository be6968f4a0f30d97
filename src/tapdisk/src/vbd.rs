//! The virtual block device: one image chain plus its request lists.
//!
//! Requests live on exactly one of three lists. `new` requests are issued
//! against the chain top-down (reads falling through unallocated spans to
//! the parent, or to zeros at the root); `pending` requests have sectors in
//! flight; requests whose final status was an error park on `failed` and are
//! re-driven in FIFO order after the retry interval, with the error hidden
//! from the guest until the retry budget runs out. A dead VBD completes
//! everything with EIO.

use std::collections::{HashMap, VecDeque};
use std::collections::HashSet;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use aioq::{Completion, Tqueue};
use sched::{EventCallback, EventId, EventSet, Scheduler};
use tracing::{debug, warn};
use uuid::Uuid;
use vhdfmt::chain::{parent_path, validate_parent, ValidateOpts};
use vhdfmt::crypto::chain_open_crypto;
use vhdfmt::{bitmap, DiskType, OpenFlags, DD_BLK_UNUSED};

use crate::vhd::{token_image, DriverEvent, SpanStatus, VhdDriver, VHD_CACHE_SIZE, VHD_REQS_DATA};
use crate::{Driver, Result, TdError, SECTOR_SHIFT};

pub const TD_VBD_MAX_RETRIES: u32 = 100;
pub const TD_VBD_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub type VreqId = usize;

/// Completion callback: request id and 0 or a positive errno.
pub type VbdCallback = Box<dyn FnMut(VreqId, i32)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbdOp {
    Read,
    Write,
}

/// One scatter-gather segment of guest memory.
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    pub base: *mut u8,
    pub secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqState {
    Free,
    New,
    Pending,
    Failed,
}

struct VbdRequest {
    op: VbdOp,
    sector: u64,
    iov: Vec<IoVec>,
    cb: Option<VbdCallback>,

    state: ReqState,
    error: i32,
    prev_error: i32,
    secs_pending: u64,
    num_retries: u32,
    last_try: Instant,
    submitting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorStatus {
    /// Backed by the image at this depth in the chain (0 = child).
    Allocated { level: u8 },
    Unallocated,
}

pub struct Vbd {
    chain: Vec<Driver>,
    queue: Tqueue,

    reqs: Vec<VbdRequest>,
    free_reqs: Vec<VreqId>,
    new_list: VecDeque<VreqId>,
    failed_list: VecDeque<VreqId>,

    dead: bool,
    last_activity: Instant,
    retry_interval: Duration,
    max_retries: u32,
}

impl std::fmt::Debug for Vbd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vbd")
            .field("chain_depth", &self.chain.len())
            .field("dead", &self.dead)
            .finish()
    }
}

impl Vbd {
    /// Open `path` and its ancestors. `sync` selects the synchronous I/O
    /// backend (utilities).
    pub fn open(path: impl AsRef<std::path::Path>, flags: OpenFlags, sync: bool) -> Result<Vbd> {
        let mut child = VhdDriver::open(path.as_ref(), flags, 0, None)?;
        let xts = chain_open_crypto(child.context())?.map(Rc::new);
        child.set_xts(xts.clone());

        let mut seen: HashSet<Uuid> = HashSet::new();
        seen.insert(child.context().footer.uuid);

        let mut chain = vec![Driver::Vhd(child)];

        while chain.last().map(Driver::is_diff).unwrap_or(false) {
            let (ppath, image) = {
                let child = chain.last().unwrap().vhd();
                (parent_path(child.context())?, chain.len() as u8)
            };

            let pflags = (flags & (OpenFlags::QUIET | OpenFlags::CACHED | OpenFlags::FAST))
                | OpenFlags::RDONLY;
            let parent = VhdDriver::open(&ppath, pflags, image, xts.clone())?;

            if !seen.insert(parent.context().footer.uuid) {
                return Err(TdError::Vhd(vhdfmt::VhdError::invalid(
                    "chain",
                    "cyclical parent chain",
                )));
            }

            validate_parent(
                chain.last().unwrap().vhd().context(),
                parent.context(),
                ValidateOpts::default(),
            )?;

            chain.push(Driver::Vhd(parent));
        }

        let ring = VHD_REQS_DATA + (VHD_CACHE_SIZE + 2) * chain.len();
        let queue = Tqueue::new(ring, sync)?;

        debug!(
            path = %path.as_ref().display(),
            chain_len = chain.len(),
            sync,
            "vbd open"
        );

        Ok(Vbd {
            chain,
            queue,
            reqs: Vec::new(),
            free_reqs: Vec::new(),
            new_list: VecDeque::new(),
            failed_list: VecDeque::new(),
            dead: false,
            last_activity: Instant::now(),
            retry_interval: TD_VBD_RETRY_INTERVAL,
            max_retries: TD_VBD_MAX_RETRIES,
        })
    }

    pub fn close(mut self) -> Result<()> {
        self.queue.cancel_all();
        for driver in self.chain.drain(..) {
            driver.close()?;
        }
        Ok(())
    }

    pub fn set_retry_policy(&mut self, interval: Duration, max_retries: u32) {
        self.retry_interval = interval;
        self.max_retries = max_retries;
    }

    pub fn sectors(&self) -> u64 {
        self.chain[0].sectors()
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn poll_fd(&self) -> RawFd {
        self.queue.poll_fd()
    }

    pub fn is_sync(&self) -> bool {
        self.queue.is_sync()
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    pub fn child(&self) -> &Driver {
        &self.chain[0]
    }

    pub fn child_mut(&mut self) -> &mut Driver {
        &mut self.chain[0]
    }

    /// Requests not yet signalled to their callbacks.
    pub fn outstanding(&self) -> usize {
        self.reqs
            .iter()
            .filter(|r| r.state != ReqState::Free)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_list.len()
    }

    /// True when requests are outstanding but nothing has moved for
    /// `timeout`; callers dump state and may kill the queue.
    pub fn progress_stalled(&self, timeout: Duration) -> bool {
        self.outstanding() > 0 && self.last_activity.elapsed() > timeout
    }

    // ---- request admission ---------------------------------------------

    fn alloc_vreq(
        &mut self,
        op: VbdOp,
        sector: u64,
        iov: Vec<IoVec>,
        cb: VbdCallback,
    ) -> Result<VreqId> {
        let total: u64 = iov.iter().map(|v| v.secs as u64).sum();
        if total == 0 || sector + total > self.sectors() {
            return Err(TdError::Range(sector));
        }

        let id = match self.free_reqs.pop() {
            Some(id) => id,
            None => {
                self.reqs.push(VbdRequest {
                    op,
                    sector: 0,
                    iov: Vec::new(),
                    cb: None,
                    state: ReqState::Free,
                    error: 0,
                    prev_error: 0,
                    secs_pending: 0,
                    num_retries: 0,
                    last_try: Instant::now(),
                    submitting: false,
                });
                self.reqs.len() - 1
            }
        };

        let req = &mut self.reqs[id];
        req.op = op;
        req.sector = sector;
        req.iov = iov;
        req.cb = Some(cb);
        req.state = ReqState::New;
        req.error = 0;
        req.prev_error = 0;
        req.secs_pending = 0;
        req.num_retries = 0;
        req.submitting = false;

        self.new_list.push_back(id);
        Ok(id)
    }

    pub fn queue_read(
        &mut self,
        sector: u64,
        secs: u32,
        buf: *mut u8,
        cb: VbdCallback,
    ) -> Result<VreqId> {
        self.alloc_vreq(VbdOp::Read, sector, vec![IoVec { base: buf, secs }], cb)
    }

    pub fn queue_write(
        &mut self,
        sector: u64,
        secs: u32,
        buf: *const u8,
        cb: VbdCallback,
    ) -> Result<VreqId> {
        self.alloc_vreq(
            VbdOp::Write,
            sector,
            vec![IoVec {
                base: buf as *mut u8,
                secs,
            }],
            cb,
        )
    }

    pub fn queue_read_iov(&mut self, sector: u64, iov: Vec<IoVec>, cb: VbdCallback) -> Result<VreqId> {
        self.alloc_vreq(VbdOp::Read, sector, iov, cb)
    }

    pub fn queue_write_iov(&mut self, sector: u64, iov: Vec<IoVec>, cb: VbdCallback) -> Result<VreqId> {
        self.alloc_vreq(VbdOp::Write, sector, iov, cb)
    }

    // ---- issue / dispatch ----------------------------------------------

    /// Guest-buffer address for an absolute sector of a request.
    fn buf_for(&self, id: VreqId, lsec: u64) -> *mut u8 {
        let req = &self.reqs[id];
        let mut off = lsec - req.sector;
        for seg in &req.iov {
            if off < seg.secs as u64 {
                // Safety: offset stays within the segment.
                return unsafe { seg.base.add((off << SECTOR_SHIFT) as usize) };
            }
            off -= seg.secs as u64;
        }
        unreachable!("sector {lsec} outside request");
    }

    fn issue_rw(&mut self, id: VreqId, level: usize, sector: u64, secs: u32, buf: *mut u8, dispatch: bool) {
        let op = self.reqs[id].op;
        let mut events = Vec::new();

        match op {
            VbdOp::Read => {
                self.chain[level].queue_read(&mut self.queue, sector, secs, buf, id as u64, &mut events)
            }
            VbdOp::Write => {
                debug_assert_eq!(level, 0);
                self.chain[level].queue_write(&mut self.queue, sector, secs, buf, id as u64, &mut events)
            }
        }

        self.handle_events(level, events, dispatch);
    }

    fn handle_events(&mut self, level: usize, events: Vec<DriverEvent>, dispatch: bool) {
        for ev in events {
            let id = ev.origin as usize;

            match ev.status {
                SpanStatus::Submitted => {
                    // Requeued waiters (dispatch path) were accounted when
                    // they were first parked.
                    if !dispatch {
                        self.reqs[id].secs_pending += ev.secs as u64;
                    }
                }

                SpanStatus::Done => {
                    debug_assert!(dispatch);
                    self.reqs[id].secs_pending -= ev.secs as u64;
                }

                SpanStatus::Error(e) => {
                    self.reqs[id].error = e;
                    if dispatch {
                        self.reqs[id].secs_pending =
                            self.reqs[id].secs_pending.saturating_sub(ev.secs as u64);
                    }
                }

                SpanStatus::NotAllocated => {
                    let buf = self.buf_for(id, ev.lsec);
                    if level + 1 < self.chain.len() {
                        self.issue_rw(id, level + 1, ev.lsec, ev.secs, buf, dispatch);
                    } else {
                        // Top of the chain: unallocated reads are zeros.
                        let bytes = (ev.secs as usize) << SECTOR_SHIFT;
                        // Safety: buf_for bounds the span inside the
                        // request's segment.
                        unsafe { std::ptr::write_bytes(buf, 0, bytes) };
                        if dispatch {
                            self.reqs[id].secs_pending =
                                self.reqs[id].secs_pending.saturating_sub(ev.secs as u64);
                        }
                    }
                }
            }

            if dispatch {
                self.last_activity = Instant::now();
                self.maybe_finalize(id);
            }
        }
    }

    fn maybe_finalize(&mut self, id: VreqId) {
        let req = &self.reqs[id];
        if req.state == ReqState::Pending && !req.submitting && req.secs_pending == 0 {
            self.finalize(id);
        }
    }

    fn finalize(&mut self, id: VreqId) {
        let (error, retries) = {
            let req = &self.reqs[id];
            (req.error, req.num_retries)
        };

        if self.dead {
            self.complete_vreq(id, if error != 0 { error } else { libc::EIO });
            return;
        }

        if error != 0 && retries < self.max_retries {
            let req = &mut self.reqs[id];
            req.num_retries += 1;
            req.prev_error = error;
            req.error = 0;
            req.secs_pending = 0;
            req.last_try = Instant::now();
            req.state = ReqState::Failed;
            self.failed_list.push_back(id);
            debug!(id, error, retries = req.num_retries, "request parked for retry");
            return;
        }

        self.complete_vreq(id, error);
    }

    fn complete_vreq(&mut self, id: VreqId, error: i32) {
        let mut cb = {
            let req = &mut self.reqs[id];
            req.state = ReqState::Free;
            req.iov.clear();
            req.cb.take()
        };
        self.free_reqs.push(id);

        if error != 0 {
            warn!(id, error, "request failed");
        }

        if let Some(cb) = cb.as_mut() {
            cb(id, error);
        }
    }

    /// Drive every request on the new list into the chain.
    pub fn submit_new(&mut self) {
        while let Some(id) = self.new_list.pop_front() {
            if self.reqs[id].state != ReqState::New {
                continue;
            }

            if self.dead {
                self.reqs[id].state = ReqState::Pending;
                self.finalize(id);
                continue;
            }

            self.reqs[id].state = ReqState::Pending;
            self.reqs[id].submitting = true;

            let mut sector = self.reqs[id].sector;
            let iov = self.reqs[id].iov.clone();
            for seg in iov {
                self.issue_rw(id, 0, sector, seg.secs, seg.base, false);
                sector += seg.secs as u64;
            }

            self.reqs[id].submitting = false;
            self.maybe_finalize(id);
        }
    }

    /// Submit batched iocbs until the queue drains; dispatch any inline
    /// completions (sync mode, submission failures).
    pub fn flush(&mut self) -> Result<()> {
        loop {
            let comps = self.queue.submit_all()?;
            if comps.is_empty() {
                break;
            }
            self.dispatch_completions(comps);
        }
        Ok(())
    }

    /// Reap and dispatch kernel completions, then submit any follow-on work
    /// (bitmap write-backs, requeued waiters).
    pub fn complete_io(&mut self) -> Result<()> {
        let comps = self.queue.complete()?;
        self.dispatch_completions(comps);
        self.flush()
    }

    fn dispatch_completions(&mut self, comps: Vec<Completion>) {
        for c in comps {
            let level = token_image(c.token) as usize;
            let mut events = Vec::new();
            self.chain[level].complete(c.token, c.res, &mut self.queue, &mut events);
            self.handle_events(level, events, true);
        }
    }

    /// Move failed requests whose retry interval has elapsed back onto the
    /// new list, oldest first.
    pub fn retry_due(&mut self) {
        let now = Instant::now();
        while let Some(&id) = self.failed_list.front() {
            if now.duration_since(self.reqs[id].last_try) < self.retry_interval {
                break;
            }
            self.failed_list.pop_front();
            self.reqs[id].state = ReqState::New;
            self.new_list.push_back(id);
        }
    }

    /// Poison the VBD: everything outstanding or arriving completes with
    /// EIO.
    pub fn kill_queue(&mut self) {
        warn!("killing vbd queue");
        self.dead = true;

        let comps = self.queue.cancel_all();
        self.dispatch_completions(comps);

        let parked: Vec<VreqId> = self
            .failed_list
            .drain(..)
            .chain(self.new_list.drain(..))
            .collect();
        for id in parked {
            if self.reqs[id].state != ReqState::Free {
                self.reqs[id].state = ReqState::Pending;
                self.finalize(id);
            }
        }
    }

    /// Allocation status per sector, walking the chain top-down.
    pub fn block_status(&mut self, sector: u64, nr_secs: u32) -> Result<Vec<SectorStatus>> {
        if sector + nr_secs as u64 > self.sectors() {
            return Err(TdError::Range(sector));
        }

        let mut out = vec![SectorStatus::Unallocated; nr_secs as usize];
        let mut bitmaps: HashMap<(usize, u32), Vec<u8>> = HashMap::new();

        for (i, status) in out.iter_mut().enumerate() {
            let lsec = sector + i as u64;

            for (level, driver) in self.chain.iter().enumerate() {
                let ctx = driver.vhd().context();

                if ctx.footer.disk_type == DiskType::Fixed {
                    *status = SectorStatus::Allocated { level: level as u8 };
                    break;
                }

                let blk = (lsec / ctx.spb as u64) as u32;
                let sec = lsec % ctx.spb as u64;
                if ctx.bat_entry(blk) == DD_BLK_UNUSED {
                    continue;
                }

                let allocated = if ctx.batmap.as_ref().is_some_and(|bm| bm.test(blk)) {
                    true
                } else {
                    let map = match bitmaps.entry((level, blk)) {
                        std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                        std::collections::hash_map::Entry::Vacant(e) => {
                            e.insert(ctx.read_bitmap(blk)?.to_vec())
                        }
                    };
                    bitmap::test_bit(ctx.bitmap_format, map, sec)
                };

                if allocated {
                    *status = SectorStatus::Allocated { level: level as u8 };
                    break;
                }
            }
        }

        Ok(out)
    }

    /// Run queued work to completion; the utilities' main loop.
    pub fn run_to_completion(&mut self) -> Result<()> {
        loop {
            self.submit_new();
            self.flush()?;

            while self.queue.pending() > 0 {
                if !self.queue.is_sync() {
                    self.wait_for_poll_fd()?;
                }
                self.complete_io()?;
            }

            if self.new_list.is_empty() && self.failed_list.is_empty() {
                break;
            }

            if !self.failed_list.is_empty() && self.queue.pending() == 0 {
                std::thread::sleep(self.retry_interval.min(Duration::from_millis(100)));
                self.retry_due();
            }
        }

        Ok(())
    }

    fn wait_for_poll_fd(&self) -> Result<()> {
        use nix::sys::select::{select, FdSet};
        use nix::sys::time::{TimeVal, TimeValLike};

        let fd = self.queue.poll_fd();
        let mut rfds = FdSet::new();
        // Safety: the queue owns this fd for its own lifetime.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        rfds.insert(borrowed);

        let mut tv = TimeVal::seconds(1);
        match select(fd + 1, &mut rfds, None, None, &mut tv) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EINTR) => Ok(()),
            Err(e) => Err(TdError::Queue(aioq::QueueError::Sys(e))),
        }
    }
}

/// Periodically re-assert the advisory lock on the image and poison the VBD
/// if another host has stolen it (persistent lock staler than the lease).
pub fn register_lock_heartbeat(
    sched: &mut Scheduler,
    vbd: std::rc::Rc<std::cell::RefCell<Vbd>>,
    image: std::path::PathBuf,
    lock_uuid: String,
    readonly: bool,
    interval_secs: u64,
) -> Result<EventId> {
    let cb: EventCallback = std::rc::Rc::new(std::cell::RefCell::new(
        move |_s: &mut Scheduler, _id: EventId, _ev: EventSet| {
            match dotlock::lock(&image, &lock_uuid, false, readonly) {
                Ok(()) => {}
                Err(e) => {
                    warn!(image = %image.display(), "lost image lock: {e}");
                    vbd.borrow_mut().kill_queue();
                    return;
                }
            }

            match dotlock::lock_delta(&image) {
                Ok(delta) if delta > dotlock::LEASE_TIME_SECS => {
                    warn!(
                        image = %image.display(),
                        delta,
                        "image lock gone stale, poisoning queue"
                    );
                    vbd.borrow_mut().kill_queue();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(image = %image.display(), "lock heartbeat failed: {e}");
                    vbd.borrow_mut().kill_queue();
                }
            }
        },
    ));

    Ok(sched.register_event(EventSet::TIMEOUT, -1, Some(interval_secs), cb)?)
}

/// Wire a VBD into the event loop: completion dispatch on the queue's poll
/// fd and a one-second service timer for retries and progress checks.
pub fn register_vbd(
    sched: &mut Scheduler,
    vbd: std::rc::Rc<std::cell::RefCell<Vbd>>,
) -> Result<(EventId, EventId)> {
    let poll_fd = vbd.borrow().poll_fd();

    let vbd_poll = vbd.clone();
    let poll_cb: EventCallback = std::rc::Rc::new(std::cell::RefCell::new(
        move |_s: &mut Scheduler, _id: EventId, _ev: EventSet| {
            let mut vbd = vbd_poll.borrow_mut();
            if let Err(e) = vbd.complete_io() {
                warn!("completion dispatch failed: {e}");
            }
        },
    ));
    let poll_id = sched.register_event(EventSet::READ_FD, poll_fd, None, poll_cb)?;

    let vbd_timer = vbd.clone();
    let timer_cb: EventCallback = std::rc::Rc::new(std::cell::RefCell::new(
        move |_s: &mut Scheduler, _id: EventId, _ev: EventSet| {
            let mut vbd = vbd_timer.borrow_mut();
            vbd.retry_due();
            vbd.submit_new();
            if let Err(e) = vbd.flush() {
                warn!("submit failed: {e}");
            }
        },
    ));
    let timer_id = sched.register_event(
        EventSet::TIMEOUT,
        -1,
        Some(TD_VBD_RETRY_INTERVAL.as_secs()),
        timer_cb,
    )?;

    Ok((poll_id, timer_id))
}
