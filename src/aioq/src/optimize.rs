//! I/O optimiser: merge adjacent control blocks into one kernel request and
//! split the merged completion back into per-originator events.
//!
//! Two control blocks merge when their opcodes match and both their file
//! extents and their memory buffers are contiguous. A merged head keeps the
//! combined byte count; the member bookkeeping needed to reconstruct
//! per-originator completions lives in a fixed pool here, addressed through
//! a tag bit in the iocb's `aio_data`.

use crate::raw::{Iocb, IoEvent};

/// High bit of `aio_data` marks a merged chain; caller tokens must stay
/// below it.
pub const OPIO_TAG: u64 = 1 << 63;

#[derive(Debug, Clone, Copy)]
pub struct OpioMember {
    pub token: u64,
    pub buf: u64,
    pub nbytes: u64,
    pub offset: i64,
}

/// Per-originator completion record produced by the splitter: byte count on
/// success, negated errno on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: u64,
    pub res: i64,
}

pub struct OpioCtx {
    chains: Vec<Option<Vec<OpioMember>>>,
    free: Vec<usize>,
    /// Remaining member records; mirrors the fixed pool of the original
    /// design so merging degrades gracefully under pressure.
    free_members: usize,
}

impl OpioCtx {
    pub fn new(num_iocbs: usize) -> OpioCtx {
        OpioCtx {
            chains: (0..num_iocbs).map(|_| None).collect(),
            free: (0..num_iocbs).rev().collect(),
            free_members: num_iocbs,
        }
    }

    fn alloc_chain(&mut self) -> Option<usize> {
        let idx = self.free.pop()?;
        self.chains[idx] = Some(Vec::with_capacity(4));
        Some(idx)
    }

    fn free_chain(&mut self, idx: usize) -> Vec<OpioMember> {
        let members = self.chains[idx].take().expect("live opio chain");
        self.free.push(idx);
        self.free_members += members.len();
        members
    }

    pub fn is_merged(iocb: &Iocb) -> bool {
        iocb.aio_data & OPIO_TAG != 0
    }

    fn chain_idx(iocb: &Iocb) -> usize {
        (iocb.aio_data & !OPIO_TAG) as usize
    }

    /// Try to fold `io` into `head`. On success `head` describes both
    /// requests; failure leaves both untouched.
    fn merge_pair(&mut self, head: &mut Iocb, io: &Iocb) -> bool {
        if head.aio_lio_opcode != io.aio_lio_opcode {
            return false;
        }

        if head.aio_offset + head.aio_nbytes as i64 != io.aio_offset {
            return false;
        }

        if head.aio_buf + head.aio_nbytes != io.aio_buf {
            return false;
        }

        let head_is_merged = Self::is_merged(head);
        let needed = if head_is_merged { 1 } else { 2 };
        if self.free_members < needed {
            return false;
        }

        let idx = if head_is_merged {
            Self::chain_idx(head)
        } else {
            let Some(idx) = self.alloc_chain() else {
                return false;
            };
            let chain = self.chains[idx].as_mut().expect("fresh chain");
            chain.push(OpioMember {
                token: head.aio_data,
                buf: head.aio_buf,
                nbytes: head.aio_nbytes,
                offset: head.aio_offset,
            });
            self.free_members -= 1;
            head.aio_data = OPIO_TAG | idx as u64;
            idx
        };

        self.chains[idx].as_mut().expect("live chain").push(OpioMember {
            token: io.aio_data,
            buf: io.aio_buf,
            nbytes: io.aio_nbytes,
            offset: io.aio_offset,
        });
        self.free_members -= 1;
        head.aio_nbytes += io.aio_nbytes;

        true
    }

    /// Merge a submission-ordered queue in place; returns the merged length.
    pub fn merge(&mut self, queue: &mut Vec<Iocb>) -> usize {
        if queue.is_empty() {
            return 0;
        }

        let mut on_queue = 0;
        for i in 1..queue.len() {
            let io = queue[i];
            let (left, _) = queue.split_at_mut(i);
            if !self.merge_pair(&mut left[on_queue], &io) {
                on_queue += 1;
                queue[on_queue] = io;
            }
        }

        queue.truncate(on_queue + 1);
        queue.len()
    }

    /// Un-merge an iocb back into its member control blocks (submission
    /// order). Plain iocbs come back as themselves.
    pub fn expand_iocb(&mut self, iocb: &Iocb) -> Vec<Iocb> {
        if !Self::is_merged(iocb) {
            return vec![*iocb];
        }

        let members = self.free_chain(Self::chain_idx(iocb));
        members
            .into_iter()
            .map(|m| Iocb {
                aio_data: m.token,
                aio_buf: m.buf,
                aio_nbytes: m.nbytes,
                aio_offset: m.offset,
                ..*iocb
            })
            .collect()
    }

    /// Rebuild per-originator completions for one kernel event.
    ///
    /// Exactly one completion per originator, in submission order; on
    /// failure every member observes the merged event's error.
    pub fn split_event(&mut self, iocb_data: u64, res: i64, merged_nbytes: u64) -> Vec<Completion> {
        if iocb_data & OPIO_TAG == 0 {
            return vec![Completion {
                token: iocb_data,
                res,
            }];
        }

        let err = if res < 0 {
            res
        } else if res as u64 == merged_nbytes {
            0
        } else {
            -libc::EIO as i64
        };

        let members = self.free_chain((iocb_data & !OPIO_TAG) as usize);
        members
            .into_iter()
            .map(|m| Completion {
                token: m.token,
                res: if err != 0 { err } else { m.nbytes as i64 },
            })
            .collect()
    }

    /// Split a batch of kernel events, preserving per-originator order.
    /// `nbytes_of` recovers the merged sizes recorded at submission.
    pub fn split(&mut self, events: &[IoEvent], nbytes_of: impl Fn(u64) -> u64) -> Vec<Completion> {
        let mut out = Vec::with_capacity(events.len());
        for ev in events {
            out.extend(self.split_event(ev.data, ev.res, nbytes_of(ev.data)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::{IOCB_CMD_PREAD, IOCB_CMD_PWRITE};

    fn iocb(op: u16, token: u64, buf: u64, nbytes: u64, offset: i64) -> Iocb {
        Iocb {
            aio_data: token,
            aio_lio_opcode: op,
            aio_buf: buf,
            aio_nbytes: nbytes,
            aio_offset: offset,
            ..Iocb::default()
        }
    }

    #[test]
    fn four_contiguous_reads_merge_to_one() {
        let mut ctx = OpioCtx::new(16);
        let mut queue: Vec<Iocb> = (0..4)
            .map(|i| iocb(IOCB_CMD_PREAD, i, 0x1000 + i * 512, 512, i as i64 * 512))
            .collect();

        let merged = ctx.merge(&mut queue);
        assert_eq!(merged, 1);
        assert_eq!(queue[0].aio_nbytes, 2048);
        assert_eq!(queue[0].aio_offset, 0);
        assert!(OpioCtx::is_merged(&queue[0]));

        // Single successful completion of 2048 bytes fans out to four
        // 512-byte completions in submission order.
        let comps = ctx.split_event(queue[0].aio_data, 2048, 2048);
        assert_eq!(comps.len(), 4);
        for (i, c) in comps.iter().enumerate() {
            assert_eq!(c.token, i as u64);
            assert_eq!(c.res, 512);
        }
    }

    #[test]
    fn merged_failure_propagates_to_every_member() {
        let mut ctx = OpioCtx::new(16);
        let mut queue: Vec<Iocb> = (0..4)
            .map(|i| iocb(IOCB_CMD_PREAD, i, 0x1000 + i * 512, 512, i as i64 * 512))
            .collect();
        ctx.merge(&mut queue);

        let comps = ctx.split_event(queue[0].aio_data, -libc::EIO as i64, 2048);
        assert_eq!(comps.len(), 4);
        for c in &comps {
            assert_eq!(c.res, -libc::EIO as i64);
        }
    }

    #[test]
    fn short_merged_completion_becomes_eio() {
        let mut ctx = OpioCtx::new(16);
        let mut queue: Vec<Iocb> = (0..2)
            .map(|i| iocb(IOCB_CMD_PWRITE, i, 0x2000 + i * 512, 512, i as i64 * 512))
            .collect();
        assert_eq!(ctx.merge(&mut queue), 1);

        let comps = ctx.split_event(queue[0].aio_data, 512, 1024);
        assert_eq!(comps.len(), 2);
        assert!(comps.iter().all(|c| c.res == -libc::EIO as i64));
    }

    #[test]
    fn mixed_opcodes_and_gaps_do_not_merge() {
        let mut ctx = OpioCtx::new(16);

        // Read then write at contiguous offsets: no merge.
        let mut queue = vec![
            iocb(IOCB_CMD_PREAD, 1, 0x1000, 512, 0),
            iocb(IOCB_CMD_PWRITE, 2, 0x1200, 512, 512),
        ];
        assert_eq!(ctx.merge(&mut queue), 2);

        // Contiguous offsets but discontiguous buffers: no merge.
        let mut queue = vec![
            iocb(IOCB_CMD_PREAD, 1, 0x1000, 512, 0),
            iocb(IOCB_CMD_PREAD, 2, 0x9000, 512, 512),
        ];
        assert_eq!(ctx.merge(&mut queue), 2);

        // Contiguous buffers but a file gap: no merge.
        let mut queue = vec![
            iocb(IOCB_CMD_PREAD, 1, 0x1000, 512, 0),
            iocb(IOCB_CMD_PREAD, 2, 0x1200, 512, 4096),
        ];
        assert_eq!(ctx.merge(&mut queue), 2);
    }

    #[test]
    fn merge_runs_interleave_correctly() {
        let mut ctx = OpioCtx::new(16);
        let mut queue = vec![
            iocb(IOCB_CMD_PREAD, 1, 0x1000, 512, 0),
            iocb(IOCB_CMD_PREAD, 2, 0x1200, 512, 512),
            iocb(IOCB_CMD_PREAD, 3, 0x9000, 512, 8192),
            iocb(IOCB_CMD_PREAD, 4, 0x9200, 512, 8704),
            iocb(IOCB_CMD_PREAD, 5, 0x9400, 512, 9216),
        ];

        assert_eq!(ctx.merge(&mut queue), 2);
        assert_eq!(queue[0].aio_nbytes, 1024);
        assert_eq!(queue[1].aio_nbytes, 1536);

        let mut comps = ctx.split_event(queue[0].aio_data, 1024, 1024);
        comps.extend(ctx.split_event(queue[1].aio_data, 1536, 1536));
        let tokens: Vec<u64> = comps.iter().map(|c| c.token).collect();
        assert_eq!(tokens, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn expand_restores_original_iocbs() {
        let mut ctx = OpioCtx::new(16);
        let mut queue: Vec<Iocb> = (0..3)
            .map(|i| iocb(IOCB_CMD_PWRITE, 10 + i, 0x1000 + i * 512, 512, i as i64 * 512))
            .collect();
        assert_eq!(ctx.merge(&mut queue), 1);

        let restored = ctx.expand_iocb(&queue[0]);
        assert_eq!(restored.len(), 3);
        for (i, io) in restored.iter().enumerate() {
            assert_eq!(io.aio_data, 10 + i as u64);
            assert_eq!(io.aio_nbytes, 512);
            assert_eq!(io.aio_offset, i as i64 * 512);
            assert!(!OpioCtx::is_merged(io));
        }
    }

    #[test]
    fn pool_exhaustion_degrades_to_no_merge() {
        let mut ctx = OpioCtx::new(2);
        let mut queue: Vec<Iocb> = (0..4)
            .map(|i| iocb(IOCB_CMD_PREAD, i, 0x1000 + i * 512, 512, i as i64 * 512))
            .collect();

        // Only one pair fits in the pool; the rest stay unmerged.
        let merged = ctx.merge(&mut queue);
        assert_eq!(merged, 3);
    }
}
