//! Batched asynchronous I/O queue over Linux native AIO.
//!
//! Requests are prepped into `Tiocb`s, queued while a batch builds, merged
//! by the optimiser and submitted in one io_submit. Completion readiness is
//! signalled through an eventfd registered on every iocb, so the owning
//! event loop can select on `poll_fd()`. A synchronous fallback mode (used
//! by the utilities, and automatically when the process-wide AIO context
//! limit is exhausted) performs loop-until-complete pread/pwrite behind the
//! same interface.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use thiserror::Error;
use tracing::{debug, error, warn};

pub mod optimize;
pub mod raw;

pub use optimize::{Completion, OpioCtx, OPIO_TAG};
use raw::{AioContext, IoEvent, Iocb, IOCB_CMD_PREAD, IOCB_CMD_PWRITE, IOCB_FLAG_RESFD};

/// Caller-chosen completion routing token. Must not use the optimiser's tag
/// bit, and must be unique among in-flight requests.
pub type Token = u64;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("token {0:#x} collides with the opio tag bit")]
    BadToken(Token),

    #[error(transparent)]
    Sys(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A prepped request: one kernel control block plus its routing token.
#[derive(Debug, Clone, Copy)]
pub struct Tiocb {
    iocb: Iocb,
}

impl Tiocb {
    pub fn token(&self) -> Token {
        self.iocb.aio_data
    }

    pub fn nbytes(&self) -> u64 {
        self.iocb.aio_nbytes
    }
}

/// Prepare a read of `bytes` into `buf` at file `offset`.
///
/// # Safety
///
/// `buf` must stay valid (and otherwise untouched) until the completion for
/// `token` is returned by `submit`/`complete`/`cancel_all`.
pub unsafe fn prep_read(fd: RawFd, buf: *mut u8, bytes: u64, offset: i64, token: Token) -> Tiocb {
    prep(fd, IOCB_CMD_PREAD, buf as u64, bytes, offset, token)
}

/// Prepare a write; same contract as [`prep_read`].
pub unsafe fn prep_write(
    fd: RawFd,
    buf: *const u8,
    bytes: u64,
    offset: i64,
    token: Token,
) -> Tiocb {
    prep(fd, IOCB_CMD_PWRITE, buf as u64, bytes, offset, token)
}

fn prep(fd: RawFd, op: u16, buf: u64, bytes: u64, offset: i64, token: Token) -> Tiocb {
    Tiocb {
        iocb: Iocb {
            aio_data: token,
            aio_lio_opcode: op,
            aio_fildes: fd as u32,
            aio_buf: buf,
            aio_nbytes: bytes,
            aio_offset: offset,
            ..Iocb::default()
        },
    }
}

enum Backend {
    Aio {
        ctx: AioContext,
        eventfd: OwnedFd,
    },
    /// pread/pwrite at submit time; the pipe read end is a poll fd that
    /// never fires.
    Sync {
        _pipe_w: OwnedFd,
        pipe_r: OwnedFd,
    },
}

pub struct Tqueue {
    size: usize,
    backend: Backend,

    queued: Vec<Iocb>,
    deferred: VecDeque<Iocb>,

    /// Expected byte count per in-flight or queued token.
    expected: HashMap<Token, u64>,
    /// Post-merge byte count per submitted head token.
    merged_nbytes: HashMap<u64, u64>,

    iocbs_pending: usize,
    tiocbs_pending: usize,

    events: Vec<IoEvent>,
    opio: OpioCtx,
}

impl Tqueue {
    /// `size` bounds in-flight kernel requests. `sync` forces the
    /// synchronous backend; otherwise it is the fallback when the kernel
    /// refuses an AIO context.
    pub fn new(size: usize, sync: bool) -> Result<Tqueue> {
        let backend = if sync {
            Self::sync_backend()?
        } else {
            let mut ctx: AioContext = 0;
            match raw::io_setup(size as i32, &mut ctx) {
                Ok(()) => {
                    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
                    let eventfd = Errno::result(fd)
                        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
                        .map_err(QueueError::Sys)?;
                    Backend::Aio { ctx, eventfd }
                }
                Err(Errno::EAGAIN) => {
                    warn!(
                        "no AIO context available (fs.aio-max-nr exhausted?), \
                         falling back to synchronous I/O"
                    );
                    Self::sync_backend()?
                }
                Err(e) => return Err(e.into()),
            }
        };

        Ok(Tqueue {
            size,
            backend,
            queued: Vec::with_capacity(size),
            deferred: VecDeque::new(),
            expected: HashMap::with_capacity(size),
            merged_nbytes: HashMap::new(),
            iocbs_pending: 0,
            tiocbs_pending: 0,
            events: vec![IoEvent::default(); size],
            opio: OpioCtx::new(size),
        })
    }

    fn sync_backend() -> Result<Backend> {
        let (pipe_r, pipe_w) = nix::unistd::pipe().map_err(QueueError::Sys)?;
        Ok(Backend::Sync {
            _pipe_w: pipe_w,
            pipe_r,
        })
    }

    pub fn is_sync(&self) -> bool {
        matches!(self.backend, Backend::Sync { .. })
    }

    /// Fd that becomes readable when completions are waiting; register it
    /// with the event scheduler.
    pub fn poll_fd(&self) -> RawFd {
        match &self.backend {
            Backend::Aio { eventfd, .. } => eventfd.as_raw_fd(),
            Backend::Sync { pipe_r, .. } => pipe_r.as_raw_fd(),
        }
    }

    pub fn full(&self) -> bool {
        self.queued.len() + self.iocbs_pending >= self.size
    }

    pub fn empty(&self) -> bool {
        self.queued.is_empty() && self.deferred.is_empty() && self.iocbs_pending == 0
    }

    pub fn pending(&self) -> usize {
        self.tiocbs_pending
    }

    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Add a prepped request to the building batch, or defer it when the
    /// ring is full.
    pub fn queue(&mut self, tiocb: Tiocb) -> Result<()> {
        let token = tiocb.token();
        if token & OPIO_TAG != 0 {
            return Err(QueueError::BadToken(token));
        }

        let mut iocb = tiocb.iocb;
        if let Backend::Aio { eventfd, .. } = &self.backend {
            iocb.aio_flags = IOCB_FLAG_RESFD;
            iocb.aio_resfd = eventfd.as_raw_fd() as u32;
        }

        self.expected.insert(token, iocb.aio_nbytes);

        if self.full() {
            self.deferred.push_back(iocb);
        } else {
            self.queued.push(iocb);
        }
        Ok(())
    }

    /// Submit the building batch. Completions for requests that failed at
    /// submission (and every request, in sync mode) come back immediately.
    pub fn submit(&mut self) -> Result<Vec<Completion>> {
        if self.queued.is_empty() {
            return Ok(Vec::new());
        }

        if self.is_sync() {
            return Ok(self.submit_sync());
        }

        let originators = self.queued.len();
        let merged = self.opio.merge(&mut self.queued);

        let mut ptrs: Vec<*mut Iocb> = self.queued.iter_mut().map(|io| io as *mut Iocb).collect();

        let Backend::Aio { ctx, .. } = &self.backend else {
            unreachable!()
        };
        // Safety: queued iocbs live until the kernel copies them during
        // io_submit; buffer validity is the preppers' contract.
        let submitted = match unsafe { raw::io_submit(*ctx, &mut ptrs) } {
            Ok(n) => n,
            Err(Errno::EAGAIN) => {
                // Out of ring space; put the batch back for later.
                debug!(originators, "io_submit EAGAIN, deferring batch");
                let queued = std::mem::take(&mut self.queued);
                for iocb in &queued {
                    for orig in self.opio.expand_iocb(iocb) {
                        self.deferred.push_back(orig);
                    }
                }
                return Ok(Vec::new());
            }
            Err(e) => {
                error!("io_submit failed: {e}");
                0
            }
        };

        // Record merged sizes for the splitter.
        for iocb in self.queued.iter().take(submitted) {
            if OpioCtx::is_merged(iocb) {
                self.merged_nbytes.insert(iocb.aio_data, iocb.aio_nbytes);
            }
        }

        // Fail the unsubmitted tail with EIO completions.
        let mut completions = Vec::new();
        if submitted < merged {
            error!(
                "io_submit error: {} of {} failed",
                merged - submitted,
                merged
            );
            let tail: Vec<Iocb> = self.queued.drain(submitted..).collect();
            for iocb in &tail {
                for orig in self.opio.expand_iocb(iocb) {
                    self.expected.remove(&orig.aio_data);
                    completions.push(Completion {
                        token: orig.aio_data,
                        res: -(libc::EIO as i64),
                    });
                }
            }
        }

        let submitted_originators = originators - completions.len();
        self.iocbs_pending += submitted;
        self.tiocbs_pending += submitted_originators;
        self.queued.clear();

        Ok(completions)
    }

    /// Keep submitting until nothing is queued (completions may requeue).
    pub fn submit_all(&mut self) -> Result<Vec<Completion>> {
        let mut completions = Vec::new();
        while !self.queued.is_empty() {
            completions.extend(self.submit()?);
        }
        Ok(completions)
    }

    fn submit_sync(&mut self) -> Vec<Completion> {
        let mut batch = std::mem::take(&mut self.queued);
        self.opio.merge(&mut batch);

        let mut completions = Vec::new();
        for iocb in &batch {
            let res = sync_rw(iocb);
            let merged_nbytes = iocb.aio_nbytes;
            for c in self.opio.split_event(iocb.aio_data, res, merged_nbytes) {
                completions.push(self.finish(c));
            }
        }

        self.promote_deferred();
        completions
    }

    /// Reap kernel completions and split them back to originators.
    pub fn complete(&mut self) -> Result<Vec<Completion>> {
        if self.is_sync() {
            return Ok(Vec::new());
        }

        if let Backend::Aio { eventfd, .. } = &self.backend {
            // Drain the eventfd counter; failure just means nothing fired.
            let mut counter = 0u64;
            // Safety: reading 8 bytes into a local from our own fd.
            unsafe {
                libc::read(
                    eventfd.as_raw_fd(),
                    &mut counter as *mut u64 as *mut libc::c_void,
                    8,
                )
            };
        }

        let Backend::Aio { ctx, .. } = &self.backend else {
            unreachable!()
        };
        let n = raw::io_getevents(*ctx, &mut self.events).map_err(QueueError::Sys)?;

        let mut completions = Vec::with_capacity(n);
        for i in 0..n {
            let ev = self.events[i];
            let merged_nbytes = self
                .merged_nbytes
                .remove(&ev.data)
                .unwrap_or_else(|| self.expected.get(&ev.data).copied().unwrap_or(0));
            for c in self.opio.split_event(ev.data, ev.res, merged_nbytes) {
                completions.push(self.finish(c));
            }
        }

        self.iocbs_pending -= n;
        self.tiocbs_pending = self.tiocbs_pending.saturating_sub(completions.len());

        self.promote_deferred();
        Ok(completions)
    }

    /// Normalise one completion against the caller's expected byte count:
    /// full transfer reports the byte count, anything else an error.
    fn finish(&mut self, c: Completion) -> Completion {
        let expected = self.expected.remove(&c.token).unwrap_or(0);
        let res = if c.res < 0 {
            c.res
        } else if c.res as u64 == expected {
            c.res
        } else {
            -(libc::EIO as i64)
        };
        Completion {
            token: c.token,
            res,
        }
    }

    fn promote_deferred(&mut self) {
        while !self.full() {
            let Some(iocb) = self.deferred.pop_front() else {
                break;
            };
            self.queued.push(iocb);
        }
    }

    /// Fail everything queued or deferred with EIO. In-flight kernel
    /// requests still complete later through `complete`.
    pub fn cancel_all(&mut self) -> Vec<Completion> {
        let mut completions = Vec::new();

        let queued = std::mem::take(&mut self.queued);
        let deferred = std::mem::take(&mut self.deferred);
        for iocb in queued.iter().chain(deferred.iter()) {
            for orig in self.opio.expand_iocb(iocb) {
                self.expected.remove(&orig.aio_data);
                completions.push(Completion {
                    token: orig.aio_data,
                    res: -(libc::EIO as i64),
                });
            }
        }

        completions
    }
}

impl Drop for Tqueue {
    fn drop(&mut self) {
        if let Backend::Aio { ctx, .. } = &self.backend {
            let _ = raw::io_destroy(*ctx);
        }
    }
}

/// Loop-until-complete pread/pwrite for the synchronous backend.
fn sync_rw(iocb: &Iocb) -> i64 {
    let fd = iocb.aio_fildes as RawFd;
    let mut done: u64 = 0;

    while done < iocb.aio_nbytes {
        let ptr = (iocb.aio_buf + done) as *mut libc::c_void;
        let len = (iocb.aio_nbytes - done) as usize;
        let off = iocb.aio_offset + done as i64;

        // Safety: buffer validity is the prep contract.
        let ret = unsafe {
            if iocb.aio_lio_opcode == IOCB_CMD_PWRITE {
                libc::pwrite(fd, ptr, len, off)
            } else {
                libc::pread(fd, ptr, len, off)
            }
        };

        match ret {
            -1 => {
                let errno = Errno::last();
                if errno == Errno::EINTR {
                    continue;
                }
                return -(errno as i32 as i64);
            }
            0 => return -(libc::EIO as i64),
            n => done += n as u64,
        }
    }

    done as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn pattern_file(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
        f
    }

    fn wait_completions(queue: &mut Tqueue, want: usize) -> Vec<Completion> {
        let mut got = Vec::new();
        for _ in 0..1000 {
            got.extend(queue.complete().unwrap());
            if got.len() >= want {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        got
    }

    #[test]
    fn async_contiguous_reads_round_trip() {
        let file = pattern_file(4096);
        let fd = file.as_file().as_raw_fd();

        let mut queue = Tqueue::new(16, false).unwrap();
        let mut buf = vec![0u8; 2048];

        for i in 0..4u64 {
            let tiocb = unsafe {
                prep_read(
                    fd,
                    buf.as_mut_ptr().add(i as usize * 512),
                    512,
                    i as i64 * 512,
                    i,
                )
            };
            queue.queue(tiocb).unwrap();
        }

        let failed = queue.submit_all().unwrap();
        assert!(failed.is_empty());

        let comps = wait_completions(&mut queue, 4);
        assert_eq!(comps.len(), 4);
        let mut tokens: Vec<u64> = comps.iter().map(|c| c.token).collect();
        tokens.sort_unstable();
        assert_eq!(tokens, vec![0, 1, 2, 3]);
        assert!(comps.iter().all(|c| c.res == 512));

        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, (i % 256) as u8);
        }
        assert!(queue.empty());
    }

    #[test]
    fn sync_mode_round_trip() {
        let file = pattern_file(2048);
        let fd = file.as_file().as_raw_fd();

        let mut queue = Tqueue::new(8, true).unwrap();
        assert!(queue.is_sync());

        let mut buf = vec![0u8; 1024];
        let t0 = unsafe { prep_read(fd, buf.as_mut_ptr(), 512, 0, 1) };
        let t1 = unsafe { prep_read(fd, buf.as_mut_ptr().add(512), 512, 512, 2) };
        queue.queue(t0).unwrap();
        queue.queue(t1).unwrap();

        let comps = queue.submit().unwrap();
        assert_eq!(comps.len(), 2);
        assert!(comps.iter().all(|c| c.res == 512));
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, (i % 256) as u8);
        }
    }

    #[test]
    fn sync_write_then_read_back() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();

        let mut queue = Tqueue::new(8, true).unwrap();
        let data = vec![0xaau8; 512];
        let w = unsafe { prep_write(fd, data.as_ptr(), 512, 0, 7) };
        queue.queue(w).unwrap();
        let comps = queue.submit().unwrap();
        assert_eq!(comps, vec![Completion { token: 7, res: 512 }]);

        let mut back = vec![0u8; 512];
        let r = unsafe { prep_read(fd, back.as_mut_ptr(), 512, 0, 8) };
        queue.queue(r).unwrap();
        let comps = queue.submit().unwrap();
        assert_eq!(comps, vec![Completion { token: 8, res: 512 }]);
        assert_eq!(back, data);
    }

    #[test]
    fn overfull_queue_defers() {
        let file = pattern_file(8192);
        let fd = file.as_file().as_raw_fd();

        let mut queue = Tqueue::new(2, false).unwrap();
        let mut bufs: Vec<Vec<u8>> = (0..4).map(|_| vec![0u8; 512]).collect();

        for (i, buf) in bufs.iter_mut().enumerate() {
            // Discontiguous offsets so nothing merges.
            let tiocb = unsafe {
                prep_read(fd, buf.as_mut_ptr(), 512, i as i64 * 1024, i as u64)
            };
            queue.queue(tiocb).unwrap();
        }
        assert_eq!(queue.deferred(), 2);

        queue.submit_all().unwrap();
        let first = wait_completions(&mut queue, 2);
        assert_eq!(first.len(), 2);

        // Deferred requests were promoted during completion.
        queue.submit_all().unwrap();
        let second = wait_completions(&mut queue, 2);
        assert_eq!(second.len(), 2);
        assert!(queue.empty());
    }

    #[test]
    fn cancel_fails_queued_with_eio() {
        let file = pattern_file(1024);
        let fd = file.as_file().as_raw_fd();

        let mut queue = Tqueue::new(4, false).unwrap();
        let mut buf = vec![0u8; 512];
        let tiocb = unsafe { prep_read(fd, buf.as_mut_ptr(), 512, 0, 3) };
        queue.queue(tiocb).unwrap();

        let comps = queue.cancel_all();
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].token, 3);
        assert_eq!(comps[0].res, -(libc::EIO as i64));
        assert!(queue.empty());
    }

    #[test]
    fn rejects_tagged_tokens() {
        let file = pattern_file(512);
        let fd = file.as_file().as_raw_fd();

        let mut queue = Tqueue::new(4, true).unwrap();
        let mut buf = vec![0u8; 512];
        let tiocb = unsafe { prep_read(fd, buf.as_mut_ptr(), 512, 0, OPIO_TAG | 1) };
        assert!(matches!(
            queue.queue(tiocb),
            Err(QueueError::BadToken(_))
        ));
    }
}
