//! Linux native AIO syscall ABI.
//!
//! Thin hand-rolled bindings over io_setup/io_submit/io_getevents/io_destroy;
//! struct layouts match include/uapi/linux/aio_abi.h for little-endian
//! 64-bit targets.

use nix::errno::Errno;

pub type AioContext = libc::c_ulong;

pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;

/// Signal completion by incrementing the eventfd in `aio_resfd`.
pub const IOCB_FLAG_RESFD: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Iocb {
    /// Returned verbatim in `IoEvent::data`; carries the caller's token.
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_rw_flags: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoEvent {
    pub data: u64,
    /// Userspace address of the submitted iocb; stale by the time we see it,
    /// so routing goes through `data` instead.
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

pub fn io_setup(nr_events: i32, ctx: &mut AioContext) -> nix::Result<()> {
    // Safety: ctx points at writable memory for the duration of the call.
    let ret = unsafe { libc::syscall(libc::SYS_io_setup, nr_events as libc::c_long, ctx) };
    Errno::result(ret).map(drop)
}

pub fn io_destroy(ctx: AioContext) -> nix::Result<()> {
    let ret = unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
    Errno::result(ret).map(drop)
}

/// Submit a batch; returns how many of `iocbs` the kernel accepted.
///
/// # Safety
///
/// Every pointed-to iocb, and every buffer an iocb references, must stay
/// valid until its completion event is reaped.
pub unsafe fn io_submit(ctx: AioContext, iocbs: &mut [*mut Iocb]) -> nix::Result<usize> {
    let ret = libc::syscall(
        libc::SYS_io_submit,
        ctx,
        iocbs.len() as libc::c_long,
        iocbs.as_mut_ptr(),
    );
    Errno::result(ret).map(|n| n as usize)
}

/// Reap up to `events.len()` completions without blocking.
pub fn io_getevents(ctx: AioContext, events: &mut [IoEvent]) -> nix::Result<usize> {
    let mut timeout = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: events is writable for events.len() entries.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            0 as libc::c_long,
            events.len() as libc::c_long,
            events.as_mut_ptr(),
            &mut timeout,
        )
    };
    Errno::result(ret).map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iocb_layout_matches_kernel_abi() {
        assert_eq!(std::mem::size_of::<Iocb>(), 64);
        assert_eq!(std::mem::size_of::<IoEvent>(), 32);
    }

    #[test]
    fn context_setup_and_teardown() {
        let mut ctx: AioContext = 0;
        io_setup(8, &mut ctx).unwrap();
        assert_ne!(ctx, 0);
        io_destroy(ctx).unwrap();
    }
}
