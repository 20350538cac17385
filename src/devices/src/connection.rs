use std::collections::VecDeque;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use protocol::{
    BlkStatus, ControlType, DeviceOptions, MapKind, Opcode, U2kHeader, K2U_HEADER_SIZE,
    MAP_DATA_THRESHOLD, MAX_DISK_NAME_LEN, U2K_HEADER_SIZE,
};
use tracing::{debug, error, warn};

use crate::blockdev::BlockDevice;
use crate::mapping::DataMapping;
use crate::registry::ModuleState;
use crate::request::RequestBody;
use crate::MAP_AREA_SIZE;

/// One open handle on the character device.
///
/// `read`, `write`, `mmap` and `close` mirror the file operations of the
/// device node. A connection is unbound until its first control write
/// (`Create` or `Connect`) and serves exactly one device afterwards.
pub struct Connection {
    state: Arc<ModuleState>,
    closed: AtomicBool,
    inner: Mutex<ConnInner>,
}

struct ConnInner {
    device: Option<Arc<BlockDevice>>,
    /// Requests sent to userspace, awaiting their reply, keyed by id.
    waiting: VecDeque<crate::request::Request>,
    /// Inline small write still streaming its payload out.
    sending: Option<crate::request::Request>,
    mapping: Option<DataMapping>,
}

impl Connection {
    pub(crate) fn new(state: Arc<ModuleState>) -> Connection {
        Connection {
            state,
            closed: AtomicBool::new(false),
            inner: Mutex::new(ConnInner {
                device: None,
                waiting: VecDeque::new(),
                sending: None,
                mapping: None,
            }),
        }
    }

    /// Dequeue the next command into `buf`.
    ///
    /// Returns the header, followed by as much inline payload as fits for
    /// small writes; remaining payload streams out of subsequent reads.
    /// Blocks until a command is pending.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Errno::EBADF);
        }

        let device = {
            let mut inner = self.inner.lock().unwrap();

            // Finish streaming an inline payload before anything else.
            if let Some(mut request) = inner.sending.take() {
                let n = request.stream_out(self.state.pool(), buf);
                if request.stream_done() {
                    inner.waiting.push_back(request);
                } else {
                    inner.sending = Some(request);
                }
                return Ok(n);
            }

            if buf.len() < K2U_HEADER_SIZE {
                return Err(Errno::EINVAL);
            }
            inner.device.clone().ok_or(Errno::EINVAL)?
        };

        loop {
            let mut request = device.dequeue(&self.closed)?;
            let mut inner = self.inner.lock().unwrap();
            if self.closed.load(Ordering::Acquire) {
                request.fail();
                return Err(Errno::EBADF);
            }

            let has_data = request.opcode.may_have_data() && request.length > 0;
            let inline = has_data && request.length <= MAP_DATA_THRESHOLD;

            if has_data && !inline {
                let Some(mapping) = inner.mapping.as_mut() else {
                    error!(
                        id = request.id,
                        "large request on a connection without a mapping window"
                    );
                    request.fail();
                    drop(inner);
                    continue;
                };
                let opcode = request.opcode;
                let body = request.block_body().expect("data request carries a block body");
                if let Err(err) = mapping.map(opcode, body) {
                    error!(id = request.id, %err, "data mapping failed");
                    request.fail();
                    drop(inner);
                    continue;
                }
            }

            debug!(
                id = request.id,
                opcode = ?request.opcode,
                pos = request.pos,
                length = request.length,
                "sending request"
            );

            let window_base = inner.mapping.as_ref().map_or(0, |m| m.base_addr());
            request.to_k2u(window_base).encode_to(buf);
            let mut total = K2U_HEADER_SIZE;

            if inline && request.opcode.is_write() {
                total += request.stream_out(self.state.pool(), &mut buf[total..]);
                if request.stream_done() {
                    inner.waiting.push_back(request);
                } else {
                    inner.sending = Some(request);
                }
            } else {
                inner.waiting.push_back(request);
            }
            return Ok(total);
        }
    }

    /// Post one U2K message: a binding control before the connection is
    /// bound, a reply afterwards.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Errno::EBADF);
        }
        if buf.len() < U2K_HEADER_SIZE {
            return Err(Errno::EINVAL);
        }
        let header = U2kHeader::decode(buf).ok_or(Errno::EINVAL)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.device.is_none() {
            return self.bind(&mut inner, &header);
        }

        let position = inner
            .waiting
            .iter()
            .position(|request| request.id == header.id)
            .ok_or(Errno::EINVAL)?;
        let mut request = inner.waiting.remove(position).expect("position is valid");
        debug!(id = header.id, reply = header.reply, "received reply");

        if matches!(request.body, RequestBody::Block(_)) {
            {
                let status = reply_status(header.reply);
                if request.opcode == Opcode::ZoneAppend && status.is_ok() {
                    // The effective write position computed by the backend.
                    request.pos = header.user_data;
                }

                let is_read = request.opcode == Opcode::Read;
                let mapped = request
                    .block_body()
                    .map_or(false, |body| body.map_kind != MapKind::Unmapped);

                if mapped {
                    let length = request.length;
                    let Some(mapping) = inner.mapping.as_mut() else {
                        request.complete_block(BlkStatus::IoError);
                        return Err(Errno::EINVAL);
                    };
                    let body = request.block_body().expect("mapped request is a block request");
                    if is_read && status.is_ok() {
                        mapping.copy_in_misaligned_pages(length, body);
                    }
                    mapping.unmap(body);
                } else if is_read && status.is_ok() && request.length > 0 {
                    if header.user_data == 0 {
                        warn!(id = request.id, "read reply carries no payload pointer");
                        request.complete_block(BlkStatus::IoError);
                        return Ok(U2K_HEADER_SIZE);
                    }
                    // In-process equivalent of copying the reply payload
                    // back from user memory.
                    unsafe {
                        request.copy_in_payload(self.state.pool(), header.user_data as *const u8);
                    }
                }
                request.complete_block(status);
            }
        } else {
            let (capacity, dst) = match &request.body {
                RequestBody::Zones(body) => (body.capacity, body.dst.0),
                RequestBody::Block(_) => unreachable!(),
            };
            let result = if header.reply < 0 {
                Err(Errno::from_raw(-header.reply as i32))
            } else {
                let filled = (header.reply as usize).min(capacity);
                if filled > 0 && header.user_data == 0 {
                    Err(Errno::EFAULT)
                } else {
                    if filled > 0 {
                        unsafe {
                            ptr::copy_nonoverlapping(header.user_data as *const u8, dst, filled);
                        }
                    }
                    Ok(filled)
                }
            };
            request.complete_zones(result);
        }

        Ok(U2K_HEADER_SIZE)
    }

    /// Establish the mapping window. Exactly one window per connection and
    /// exactly the canonical size.
    pub fn mmap(&self, length: usize) -> Result<u64, Errno> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Errno::EBADF);
        }
        if length != MAP_AREA_SIZE {
            return Err(Errno::EINVAL);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.mapping.is_some() {
            return Err(Errno::EEXIST);
        }
        let mapping = DataMapping::new(self.state.pool()).map_err(|err| {
            error!(%err, "mapping window setup failed");
            Errno::ENOMEM
        })?;
        let base = mapping.base_addr();
        inner.mapping = Some(mapping);
        Ok(base)
    }

    /// Release the connection: every request still awaiting a reply is
    /// completed with an I/O error, and the device is removed once its last
    /// connection goes away.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (device, waiting, sending, _mapping) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.device.take(),
                std::mem::take(&mut inner.waiting),
                inner.sending.take(),
                inner.mapping.take(),
            )
        };

        for request in waiting {
            request.fail();
        }
        if let Some(request) = sending {
            request.fail();
        }

        if let Some(device) = device {
            // Wake any reader still blocked on the pending queue.
            device.kick();
            if device.connection_closed() == 0 {
                self.state.remove_device(&device);
            }
        }
    }

    fn bind(&self, inner: &mut ConnInner, header: &U2kHeader) -> Result<usize, Errno> {
        let control = ControlType::from_raw(header.u2k_type()).ok_or(Errno::EINVAL)?;
        if header.user_data == 0 {
            return Err(Errno::EFAULT);
        }

        let device = match control {
            ControlType::Create => {
                if header.u2k_length() as usize != size_of::<DeviceOptions>() {
                    return Err(Errno::EINVAL);
                }
                let options =
                    unsafe { ptr::read_unaligned(header.user_data as *const DeviceOptions) };
                self.state.create_block_device(&options).map_err(|err| {
                    warn!(%err, "device creation failed");
                    Errno::EINVAL
                })?
            }
            ControlType::Connect => {
                let len = header.u2k_length() as usize;
                if len == 0 || len > MAX_DISK_NAME_LEN {
                    return Err(Errno::EINVAL);
                }
                let mut raw = vec![0u8; len];
                unsafe {
                    ptr::copy_nonoverlapping(
                        header.user_data as *const u8,
                        raw.as_mut_ptr(),
                        len,
                    );
                }
                let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
                let name = std::str::from_utf8(&raw[..end]).map_err(|_| Errno::EINVAL)?;
                self.state.get_block_device(name).ok_or(Errno::ENOENT)?
            }
        };

        device.connection_opened();
        debug!(device = device.name(), "connection bound");
        inner.device = Some(device);
        Ok(U2K_HEADER_SIZE)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Replies carry a block status; anything outside the alphabet (including
/// negative values) is coerced to an I/O error.
fn reply_status(reply: i64) -> BlkStatus {
    u32::try_from(reply)
        .ok()
        .and_then(BlkStatus::from_raw)
        .unwrap_or_else(|| {
            warn!(reply, "reply status outside the allowed alphabet");
            BlkStatus::IoError
        })
}
