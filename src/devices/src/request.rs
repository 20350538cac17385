use crossbeam_channel::Sender;
use nix::errno::Errno;
use pagemap::{PagePool, PAGE_SIZE};
use protocol::{BlkStatus, K2uHeader, MapKind, Opcode};
use tracing::debug;

/// One scatter-gather fragment of a block request: `len` bytes starting
/// `offset` bytes into pool page `page`. A fragment may run across several
/// consecutive pool pages.
#[derive(Debug, Copy, Clone)]
pub struct SgFragment {
    pub page: usize,
    pub offset: usize,
    pub len: usize,
}

impl SgFragment {
    pub fn new(page: usize, offset: usize, len: usize) -> SgFragment {
        // Normalize so `offset` is an in-page offset.
        SgFragment {
            page: page + offset / PAGE_SIZE,
            offset: offset % PAGE_SIZE,
            len,
        }
    }

    pub(crate) fn pool_offset(&self) -> u64 {
        PagePool::page_offset(self.page) + self.offset as u64
    }
}

/// Outcome of a block request. `position` is the byte offset the payload
/// landed at; zone appends report their effective offset through it.
#[derive(Debug, Copy, Clone)]
pub struct IoCompletion {
    pub status: BlkStatus,
    pub position: u64,
}

pub(crate) struct BlockBody {
    pub fragments: Vec<SgFragment>,
    pub map_kind: MapKind,
    pub map_data: u64,
    pub mapped_size: usize,
    /// Bytes already pushed through the inline stream.
    pub streamed: usize,
    pub done: Sender<IoCompletion>,
}

/// Raw destination for zone descriptors; owned by the thread blocked in
/// `report_zones`, which outlives the request.
pub(crate) struct ZoneBuffer(pub *mut u8);

unsafe impl Send for ZoneBuffer {}

pub(crate) struct ZoneBody {
    pub dst: ZoneBuffer,
    pub capacity: usize,
    pub done: Sender<Result<usize, Errno>>,
}

pub(crate) enum RequestBody {
    Block(BlockBody),
    Zones(ZoneBody),
}

/// An in-flight request. Ownership moves from the device pending queue to
/// the serving connection (`sending` or `waiting_requests`) and ends in one
/// of the `complete_*` calls; every path completes exactly once because
/// completion consumes the request.
pub(crate) struct Request {
    pub id: u64,
    pub opcode: Opcode,
    pub pos: u64,
    pub length: u64,
    pub body: RequestBody,
}

impl Request {
    pub fn to_k2u(&self, window_base: u64) -> K2uHeader {
        let (data_address, mapping_data, map_type) = match &self.body {
            RequestBody::Block(body) if body.map_kind != MapKind::Unmapped => {
                (window_base, body.map_data, body.map_kind as i32)
            }
            _ => (0, 0, MapKind::Unmapped as i32),
        };
        K2uHeader::new(
            self.id,
            self.opcode as u32,
            self.pos,
            self.length,
            data_address,
            mapping_data,
            map_type,
        )
    }

    pub fn block_body(&mut self) -> Option<&mut BlockBody> {
        match &mut self.body {
            RequestBody::Block(body) => Some(body),
            RequestBody::Zones(_) => None,
        }
    }

    /// Stream outstanding payload bytes into `out`; returns the count
    /// copied. Used by the inline small-write path.
    pub fn stream_out(&mut self, pool: &PagePool, out: &mut [u8]) -> usize {
        let length = self.length as usize;
        let body = match &mut self.body {
            RequestBody::Block(body) => body,
            RequestBody::Zones(_) => return 0,
        };

        let mut copied = 0;
        while body.streamed < length && copied < out.len() {
            // Locate the fragment holding the next unsent byte.
            let mut skip = body.streamed;
            let mut src = None;
            for frag in &body.fragments {
                if skip < frag.len {
                    src = Some((frag.pool_offset() + skip as u64, frag.len - skip));
                    break;
                }
                skip -= frag.len;
            }
            let Some((offset, avail)) = src else { break };

            let n = avail.min(out.len() - copied);
            if pool
                .read_bytes(offset, &mut out[copied..copied + n])
                .is_err()
            {
                break;
            }
            copied += n;
            body.streamed += n;
        }
        copied
    }

    pub fn stream_done(&self) -> bool {
        match &self.body {
            RequestBody::Block(body) => body.streamed >= self.length as usize,
            RequestBody::Zones(_) => true,
        }
    }

    /// Copy an inline read reply from userspace memory back into the
    /// request's pages.
    ///
    /// # Safety
    ///
    /// `src` must point at `self.length` readable bytes.
    pub unsafe fn copy_in_payload(&mut self, pool: &PagePool, src: *const u8) {
        let mut remain = self.length as usize;
        let mut consumed = 0usize;
        let fragments = match &self.body {
            RequestBody::Block(body) => &body.fragments,
            RequestBody::Zones(_) => return,
        };
        for frag in fragments {
            if remain == 0 {
                break;
            }
            let n = frag.len.min(remain);
            let _ = pool.write_from_ptr(frag.pool_offset(), src.add(consumed), n);
            consumed += n;
            remain -= n;
        }
    }

    pub fn complete_block(self, status: BlkStatus) {
        debug!(id = self.id, ?status, "request complete");
        match self.body {
            RequestBody::Block(body) => {
                let _ = body.done.send(IoCompletion {
                    status,
                    position: self.pos,
                });
            }
            RequestBody::Zones(body) => {
                let _ = body.done.send(Err(Errno::EIO));
            }
        }
    }

    pub fn complete_zones(self, result: Result<usize, Errno>) {
        match self.body {
            RequestBody::Zones(body) => {
                let _ = body.done.send(result);
            }
            RequestBody::Block(body) => {
                let _ = body.done.send(IoCompletion {
                    status: BlkStatus::IoError,
                    position: 0,
                });
            }
        }
    }

    /// Completion used by teardown paths.
    pub fn fail(self) {
        match self.body {
            RequestBody::Block(_) => self.complete_block(BlkStatus::IoError),
            RequestBody::Zones(_) => self.complete_zones(Err(Errno::EIO)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use pagemap::PagePool;

    fn block_request(pool_page: usize, len: usize) -> (Request, crossbeam_channel::Receiver<IoCompletion>) {
        let (tx, rx) = bounded(1);
        (
            Request {
                id: 1,
                opcode: Opcode::Write,
                pos: 0,
                length: len as u64,
                body: RequestBody::Block(BlockBody {
                    fragments: vec![SgFragment::new(pool_page, 0, len)],
                    map_kind: MapKind::Unmapped,
                    map_data: 0,
                    mapped_size: 0,
                    streamed: 0,
                    done: tx,
                }),
            },
            rx,
        )
    }

    #[test]
    fn stream_out_in_chunks() {
        let pool = PagePool::new(32, 8).unwrap();
        let range = pool.alloc_range(1).unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        pool.write_bytes(range.byte_offset(0), &data).unwrap();

        let (mut req, _rx) = block_request(range.page(0), data.len());
        let mut out = vec![0u8; 64];
        assert_eq!(req.stream_out(&pool, &mut out), 64);
        assert!(!req.stream_done());
        let mut tail = vec![0u8; 64];
        assert_eq!(req.stream_out(&pool, &mut tail), 36);
        assert!(req.stream_done());

        let mut all = out;
        all.extend_from_slice(&tail[..36]);
        assert_eq!(all, data);
    }

    #[test]
    fn completion_consumes() {
        let pool = PagePool::new(32, 8).unwrap();
        let range = pool.alloc_range(1).unwrap();
        let (req, rx) = block_request(range.page(0), 10);
        req.complete_block(BlkStatus::Ok);
        assert!(rx.recv().unwrap().status.is_ok());
    }
}
