use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{bounded, Receiver};
use nix::errno::Errno;
use protocol::{
    BlkStatus, Opcode, ZoneDescriptor, ZonedModel, MAX_SEGMENTS, MAX_SIZE_PER_COMMAND,
    MAX_ZONES, MAX_ZONE_SECTORS, SECTOR_SHIFT,
};
use tracing::{debug, warn};

use crate::request::{
    BlockBody, IoCompletion, Request, RequestBody, SgFragment, ZoneBody, ZoneBuffer,
};

/// Block-layer operations the shim accepts. The set is closed at the type
/// level; wire-opcode decoding on the other side still rejects unknowns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoType {
    Read,
    Write,
    Discard,
    Flush,
    ZoneOpen,
    ZoneClose,
    ZoneFinish,
    ZoneAppend,
    ZoneReset,
    ZoneResetAll,
}

impl IoType {
    fn opcode(self) -> Opcode {
        match self {
            IoType::Read => Opcode::Read,
            IoType::Write => Opcode::Write,
            IoType::Discard => Opcode::Discard,
            IoType::Flush => Opcode::Flush,
            IoType::ZoneOpen => Opcode::ZoneOpen,
            IoType::ZoneClose => Opcode::ZoneClose,
            IoType::ZoneFinish => Opcode::ZoneFinish,
            IoType::ZoneAppend => Opcode::ZoneAppend,
            IoType::ZoneReset => Opcode::ZoneReset,
            IoType::ZoneResetAll => Opcode::ZoneResetAll,
        }
    }
}

/// One block request as submitted by the block layer: an operation, a
/// starting sector, and the pages backing the payload.
pub struct BlockIo {
    pub op: IoType,
    pub sector: u64,
    pub len: u64,
    pub fragments: Vec<SgFragment>,
}

impl BlockIo {
    fn data(op: IoType, sector: u64, fragments: Vec<SgFragment>) -> BlockIo {
        let len = fragments.iter().map(|f| f.len as u64).sum();
        BlockIo {
            op,
            sector,
            len,
            fragments,
        }
    }

    pub fn read(sector: u64, fragments: Vec<SgFragment>) -> BlockIo {
        BlockIo::data(IoType::Read, sector, fragments)
    }

    pub fn write(sector: u64, fragments: Vec<SgFragment>) -> BlockIo {
        BlockIo::data(IoType::Write, sector, fragments)
    }

    pub fn zone_append(zone_start_sector: u64, fragments: Vec<SgFragment>) -> BlockIo {
        BlockIo::data(IoType::ZoneAppend, zone_start_sector, fragments)
    }

    pub fn discard(sector: u64, len: u64) -> BlockIo {
        BlockIo {
            op: IoType::Discard,
            sector,
            len,
            fragments: Vec::new(),
        }
    }

    pub fn flush() -> BlockIo {
        BlockIo {
            op: IoType::Flush,
            sector: 0,
            len: 0,
            fragments: Vec::new(),
        }
    }

    pub fn zone_mgmt(op: IoType, sector: u64) -> BlockIo {
        debug_assert!(matches!(
            op,
            IoType::ZoneOpen
                | IoType::ZoneClose
                | IoType::ZoneFinish
                | IoType::ZoneReset
                | IoType::ZoneResetAll
        ));
        BlockIo {
            op,
            sector,
            len: 0,
            fragments: Vec::new(),
        }
    }
}

/// Completion handle returned by [`BlockDevice::queue_rq`].
pub struct IoHandle {
    id: u64,
    rx: Receiver<IoCompletion>,
}

impl IoHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the request completes. A torn-down engine reads as an
    /// I/O error, the same way the block layer sees a dead device.
    pub fn wait(self) -> IoCompletion {
        self.rx.recv().unwrap_or(IoCompletion {
            status: BlkStatus::IoError,
            position: 0,
        })
    }
}

/// Queue attributes recorded at registration time.
#[derive(Debug, Copy, Clone)]
pub struct QueueLimits {
    pub max_segments: usize,
    pub max_bytes_per_command: usize,
    pub max_zone_append_sectors: u64,
    pub max_open_zones: u32,
    pub max_active_zones: u32,
}

struct Pending {
    queue: VecDeque<Request>,
    dead: bool,
}

/// A registered virtual disk: identity, queue limits, and the pending FIFO
/// its serving connections drain.
pub struct BlockDevice {
    name: String,
    model: ZonedModel,
    capacity_sectors: u64,
    limits: QueueLimits,
    ids: Arc<AtomicU64>,
    pending: Mutex<Pending>,
    wait_queue: Condvar,
    connections: AtomicUsize,
}

impl BlockDevice {
    pub(crate) fn new(
        name: String,
        model: ZonedModel,
        disk_size: u64,
        max_open_zones: u32,
        max_active_zones: u32,
        ids: Arc<AtomicU64>,
    ) -> BlockDevice {
        BlockDevice {
            name,
            model,
            capacity_sectors: disk_size >> SECTOR_SHIFT,
            limits: QueueLimits {
                max_segments: MAX_SEGMENTS,
                max_bytes_per_command: MAX_SIZE_PER_COMMAND,
                max_zone_append_sectors: MAX_ZONE_SECTORS,
                max_open_zones,
                max_active_zones,
            },
            ids,
            pending: Mutex::new(Pending {
                queue: VecDeque::new(),
                dead: false,
            }),
            wait_queue: Condvar::new(),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> ZonedModel {
        self.model
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    /// Submit one block request. Never blocks: the request is linked into
    /// the pending FIFO and a serving connection is woken.
    pub fn queue_rq(&self, io: BlockIo) -> IoHandle {
        let id = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = bounded(1);
        let handle = IoHandle { id, rx };

        let opcode = io.op.opcode();
        let pos = io.sector << SECTOR_SHIFT;
        debug!(id, ?opcode, pos, length = io.len, "new request");

        let request = Request {
            id,
            opcode,
            pos,
            length: io.len,
            body: RequestBody::Block(BlockBody {
                fragments: io.fragments,
                map_kind: Default::default(),
                map_data: 0,
                mapped_size: 0,
                streamed: 0,
                done: tx,
            }),
        };

        if io.len as usize > self.limits.max_bytes_per_command
            || request_segments(&request) > self.limits.max_segments
        {
            warn!(id, "request exceeds queue limits");
            request.complete_block(BlkStatus::IoError);
            return handle;
        }

        self.enqueue(request);
        handle
    }

    /// Synchronous zone report: queues a control request carrying the
    /// destination buffer and sleeps until the reply releases it.
    pub fn report_zones(
        &self,
        sector: u64,
        nr_zones: u32,
    ) -> Result<Vec<ZoneDescriptor>, Errno> {
        let nr_zones = nr_zones.min(MAX_ZONES as u32);
        if nr_zones == 0 {
            // Nothing to report; skip the round-trip entirely.
            return Ok(Vec::new());
        }

        let mut zones = vec![ZoneDescriptor::default(); nr_zones as usize];
        let capacity = zones.len() * size_of::<ZoneDescriptor>();
        let (tx, rx) = bounded(1);

        let request = Request {
            id: self.ids.fetch_add(1, Ordering::Relaxed) + 1,
            opcode: Opcode::ReportZones,
            pos: sector << SECTOR_SHIFT,
            length: nr_zones as u64,
            body: RequestBody::Zones(ZoneBody {
                dst: ZoneBuffer(zones.as_mut_ptr().cast()),
                capacity,
                done: tx,
            }),
        };
        self.enqueue(request);

        let filled = rx.recv().map_err(|_| Errno::EIO)??;
        debug!(nr_zones = filled / size_of::<ZoneDescriptor>(), "zone report");
        zones.truncate(filled / size_of::<ZoneDescriptor>());
        Ok(zones)
    }

    pub(crate) fn enqueue(&self, request: Request) {
        let mut pending = self.pending.lock().unwrap();
        if pending.dead {
            drop(pending);
            request.fail();
            return;
        }
        pending.queue.push_back(request);
        drop(pending);
        self.wait_queue.notify_one();
    }

    /// Pop the next pending request, blocking until one arrives, the device
    /// dies (`ENODEV`), or the calling connection closes (`EBADF`).
    pub(crate) fn dequeue(&self, closed: &AtomicBool) -> Result<Request, Errno> {
        let mut pending = self.pending.lock().unwrap();
        loop {
            if let Some(request) = pending.queue.pop_front() {
                return Ok(request);
            }
            if pending.dead {
                return Err(Errno::ENODEV);
            }
            if closed.load(Ordering::Acquire) {
                return Err(Errno::EBADF);
            }
            pending = self.wait_queue.wait(pending).unwrap();
        }
    }

    /// Fail everything still queued and refuse new submissions.
    pub(crate) fn fail_pending(&self) {
        let drained: Vec<Request> = {
            let mut pending = self.pending.lock().unwrap();
            pending.dead = true;
            pending.queue.drain(..).collect()
        };
        self.wait_queue.notify_all();
        for request in drained {
            request.fail();
        }
    }

    /// Wake blocked readers so they can notice connection shutdown.
    pub(crate) fn kick(&self) {
        self.wait_queue.notify_all();
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of connections still bound.
    pub(crate) fn connection_closed(&self) -> usize {
        self.connections.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

fn request_segments(request: &Request) -> usize {
    match &request.body {
        RequestBody::Block(body) => body.fragments.len(),
        RequestBody::Zones(_) => 0,
    }
}
