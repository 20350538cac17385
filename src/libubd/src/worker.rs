use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::size_of;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use devices::{CharDev, Connection, ModuleState, MAP_AREA_SIZE};
use nix::errno::Errno;
use pagemap::PAGE_SIZE;
use protocol::{
    BlkStatus, ControlType, DeviceOptions, K2uHeader, MapKind, Opcode, U2kHeader,
    ZoneDescriptor, DEFAULT_NUM_THREADS, K2U_HEADER_SIZE, MAP_DATA_THRESHOLD, U2K_HEADER_SIZE,
};
use tracing::{debug, error, warn};

use crate::ops::BlockOperations;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("invalid device options: {0}")]
    Options(#[from] protocol::OptionsError),
    #[error("binding failed: {0}")]
    Bind(Errno),
    #[error("mapping window failed: {0}")]
    Window(Errno),
}

/// A running worker pool bound to one block device.
pub struct Daemon {
    name: String,
    state: Arc<ModuleState>,
    workers: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn disk_name(&self) -> &str {
        &self.name
    }

    /// Remove the device and wait for the workers to drain out.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.state.remove_block_device(&self.name);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Create the device described by `options` and serve it with a pool of
/// worker threads (`options.num_threads`, 0 meaning the default of 4).
pub fn serve(
    chardev: &CharDev,
    options: &DeviceOptions,
    ops: Arc<dyn BlockOperations>,
) -> Result<Daemon, ServeError> {
    options.validate()?;
    let name = options.name()?.to_owned();
    let num_threads = if options.num_threads == 0 {
        DEFAULT_NUM_THREADS
    } else {
        options.num_threads as usize
    };

    let mut workers = Vec::with_capacity(num_threads);
    if let Err(err) = spawn_workers(chardev, options, &name, &ops, num_threads, &mut workers) {
        // Tear down whatever came up; the removal drains the half-built
        // pool.
        chardev.state().remove_block_device(&name);
        for worker in workers {
            let _ = worker.join();
        }
        return Err(err);
    }

    Ok(Daemon {
        name,
        state: Arc::clone(chardev.state()),
        workers,
    })
}

fn spawn_workers(
    chardev: &CharDev,
    options: &DeviceOptions,
    name: &str,
    ops: &Arc<dyn BlockOperations>,
    num_threads: usize,
    workers: &mut Vec<JoinHandle<()>>,
) -> Result<(), ServeError> {
    for index in 0..num_threads {
        let conn = chardev.open();
        conn.mmap(MAP_AREA_SIZE).map_err(ServeError::Window)?;

        // The first connection registers the device; the rest attach to it
        // by name.
        let bind = if index == 0 {
            U2kHeader::control(
                ControlType::Create as u32,
                size_of::<DeviceOptions>() as u32,
                options as *const DeviceOptions as u64,
            )
        } else {
            U2kHeader::control(
                ControlType::Connect as u32,
                name.len() as u32,
                name.as_ptr() as u64,
            )
        };
        conn.write(bind.as_wire_bytes()).map_err(ServeError::Bind)?;

        let worker = Worker {
            index,
            conn,
            scratch: AlignedBuf::new(MAP_DATA_THRESHOLD as usize),
            ops: Arc::clone(ops),
        };
        workers.push(worker.run());
    }
    Ok(())
}

/// Page-aligned scratch buffer for inline payloads.
struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn new(len: usize) -> AlignedBuf {
        let layout = Layout::from_size_align(len, PAGE_SIZE).expect("valid scratch layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        AlignedBuf {
            ptr: NonNull::new(ptr).expect("scratch allocation failed"),
            len,
        }
    }

    fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, PAGE_SIZE).expect("valid scratch layout");
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

struct Worker {
    index: usize,
    conn: Arc<Connection>,
    scratch: AlignedBuf,
    ops: Arc<dyn BlockOperations>,
}

enum Exit {
    DeviceGone,
    Fatal,
}

impl Worker {
    fn run(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name(format!("ubd-worker{}", self.index))
            .spawn(move || self.work())
            .expect("failed to spawn thread")
    }

    fn work(mut self) {
        loop {
            let (mut header, opcode) = match self.read_command() {
                Ok(pair) => pair,
                Err(_) => break,
            };

            if self.copy_in(&mut header, opcode).is_err() {
                break;
            }

            // Keeps a zone-report buffer alive until the reply is written.
            let (reply, _zones) = self.dispatch(&header, opcode);

            match self.conn.write(reply.as_wire_bytes()) {
                Ok(n) if n == U2K_HEADER_SIZE => {}
                Ok(n) => {
                    error!(n, "short reply write");
                    break;
                }
                Err(Errno::ENODEV) | Err(Errno::EBADF) => break,
                Err(err) => {
                    error!(%err, "reply write failed");
                    break;
                }
            }
        }
        debug!(worker = self.index, "worker exiting");
        self.conn.close();
    }

    fn read_command(&self) -> Result<(K2uHeader, Opcode), Exit> {
        let mut buf = [0u8; K2U_HEADER_SIZE];
        loop {
            match self.conn.read(&mut buf) {
                Ok(n) if n == K2U_HEADER_SIZE => break,
                Ok(n) => {
                    error!(n, "short command read");
                    return Err(Exit::Fatal);
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(Errno::ENODEV) | Err(Errno::EBADF) => return Err(Exit::DeviceGone),
                Err(err) => {
                    error!(%err, "command read failed");
                    return Err(Exit::Fatal);
                }
            }
        }

        let header = K2uHeader::decode(&buf).ok_or(Exit::Fatal)?;
        let Some(opcode) = Opcode::from_raw(header.opcode) else {
            error!(opcode = header.opcode, "undecodable opcode");
            return Err(Exit::Fatal);
        };
        debug!(
            id = header.id,
            ?opcode,
            offset = header.offset,
            length = header.length,
            "command read"
        );
        Ok((header, opcode))
    }

    /// Inline small-I/O path: point the command at the scratch buffer and,
    /// for writes, pull the payload out of the stream.
    fn copy_in(&mut self, header: &mut K2uHeader, opcode: Opcode) -> Result<(), Exit> {
        if !opcode.may_have_data() || header.length == 0 || header.length > MAP_DATA_THRESHOLD {
            return Ok(());
        }

        header.data_map_type = MapKind::Simple as i32;
        header.data_address = self.scratch.addr();
        header.mapping_data = 0;

        if opcode.is_write() {
            let size = header.length as usize;
            let mut total = 0usize;
            while total < size {
                match self.conn.read(&mut self.scratch.as_mut_slice()[total..size]) {
                    Ok(0) => {
                        error!("stream ended inside an inline payload");
                        return Err(Exit::Fatal);
                    }
                    Ok(n) => total += n,
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                    Err(err) => {
                        error!(%err, "inline payload read failed");
                        return Err(Exit::Fatal);
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, header: &K2uHeader, opcode: Opcode) -> (U2kHeader, Option<Vec<ZoneDescriptor>>) {
        if opcode.is_blk_request() {
            let mut user_data = 0u64;
            let reply = self.handle_blk_command(header, opcode, &mut user_data);
            (U2kHeader::reply(header.id, reply, user_data), None)
        } else {
            self.handle_report_zones(header)
        }
    }

    fn handle_blk_command(&self, header: &K2uHeader, opcode: Opcode, user_data: &mut u64) -> i64 {
        if header.data_map_type == MapKind::List as i32 {
            return self.handle_datamap_list(header, opcode, user_data) as u32 as i64;
        }

        let status = match opcode {
            Opcode::Read => {
                if header.length <= MAP_DATA_THRESHOLD {
                    // Reply payload pointer for the inline copy-back.
                    *user_data = header.data_address + header.mapping_data;
                }
                let data =
                    unsafe { data_slice_mut(header.data_address + header.mapping_data, header.length) };
                self.ops.read(data, header.offset)
            }
            Opcode::Write => {
                let data =
                    unsafe { data_slice(header.data_address + header.mapping_data, header.length) };
                self.ops.write(data, header.offset)
            }
            Opcode::ZoneAppend => {
                let data =
                    unsafe { data_slice(header.data_address + header.mapping_data, header.length) };
                let mut position = 0u64;
                let status = self.ops.append_zone(data, header.offset, Some(&mut position));
                if status.is_ok() {
                    *user_data = position;
                }
                status
            }
            Opcode::Discard => self.ops.discard(header.offset, header.length),
            Opcode::Flush => self.ops.flush(),
            Opcode::ZoneOpen => self.ops.open_zone(header.offset),
            Opcode::ZoneClose => self.ops.close_zone(header.offset),
            Opcode::ZoneFinish => self.ops.finish_zone(header.offset),
            Opcode::ZoneReset => self.ops.reset_zone(header.offset),
            Opcode::ZoneResetAll => self.ops.reset_all_zones(),
            Opcode::Connect | Opcode::Disconnect | Opcode::Ioctl | Opcode::ReportZones => {
                warn!(?opcode, "opcode has no block handler");
                BlkStatus::NotSupported
            }
        };
        status as u32 as i64
    }

    /// Scattered payload: one handler call per descriptor entry, advancing
    /// the byte offset entry by entry. The first failing entry
    /// short-circuits the run; bytes already written stay written.
    fn handle_datamap_list(&self, header: &K2uHeader, opcode: Opcode, user_data: &mut u64) -> BlkStatus {
        let mut offset = header.offset;
        let mut first = true;

        for index in 0.. {
            let (addr, len) = unsafe { read_descriptor(header.mapping_data, index) };
            if addr == 0 {
                break;
            }

            let status = match opcode {
                Opcode::Read => self.ops.read(unsafe { data_slice_mut(addr, len) }, offset),
                Opcode::Write => self.ops.write(unsafe { data_slice(addr, len) }, offset),
                Opcode::ZoneAppend => {
                    let mut position = 0u64;
                    let out = if first { Some(&mut position) } else { None };
                    let status = self.ops.append_zone(unsafe { data_slice(addr, len) }, offset, out);
                    if first && status.is_ok() {
                        *user_data = position;
                    }
                    status
                }
                _ => {
                    error!(?opcode, "unexpected opcode in descriptor-list dispatch");
                    return BlkStatus::NotSupported;
                }
            };

            if !status.is_ok() {
                return status;
            }
            offset += len;
            first = false;
        }
        BlkStatus::Ok
    }

    fn handle_report_zones(&self, header: &K2uHeader) -> (U2kHeader, Option<Vec<ZoneDescriptor>>) {
        let nr_zones = header.length as usize;
        if nr_zones == 0 {
            // Nothing asked for: immediate OK, no handler call.
            return (U2kHeader::reply(header.id, 0, 0), None);
        }

        let mut zones = vec![ZoneDescriptor::default(); nr_zones];
        match self.ops.report_zones(header.offset, &mut zones) {
            Ok(count) => {
                let count = count.min(zones.len());
                let reply = (count * size_of::<ZoneDescriptor>()) as i64;
                let addr = zones.as_ptr() as u64;
                (U2kHeader::reply(header.id, reply, addr), Some(zones))
            }
            Err(status) => {
                let errno = match status {
                    BlkStatus::NotSupported => Errno::EOPNOTSUPP,
                    _ => Errno::EIO,
                };
                (U2kHeader::reply(header.id, -(errno as i64), 0), None)
            }
        }
    }
}

unsafe fn data_slice<'a>(addr: u64, len: u64) -> &'a [u8] {
    if len == 0 {
        &[]
    } else {
        slice::from_raw_parts(addr as *const u8, len as usize)
    }
}

unsafe fn data_slice_mut<'a>(addr: u64, len: u64) -> &'a mut [u8] {
    if len == 0 {
        &mut []
    } else {
        slice::from_raw_parts_mut(addr as *mut u8, len as usize)
    }
}

unsafe fn read_descriptor(list_addr: u64, index: usize) -> (u64, u64) {
    let entry = (list_addr as *const u64).add(index * 2);
    (entry.read(), entry.add(1).read())
}
