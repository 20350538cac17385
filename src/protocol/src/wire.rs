use std::mem::size_of;

use zerocopy::{AsBytes as _, FromBytes as _};
use zerocopy_derive::{AsBytes, FromBytes};

pub const K2U_HEADER_SIZE: usize = size_of::<K2uHeader>();
pub const U2K_HEADER_SIZE: usize = size_of::<U2kHeader>();

/// How the payload of a command is addressed from userspace.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum MapKind {
    /// No mapped payload (control ops, or the inline small-I/O path).
    #[default]
    Unmapped = 0,
    /// Payload is contiguous in the window; `mapping_data` is the in-page
    /// offset of the first byte.
    Simple = 1,
    /// Payload is scattered; `mapping_data` is the user address of a
    /// zero-terminated `(address, length)` descriptor array.
    List = 2,
}

impl MapKind {
    pub fn from_raw(raw: i32) -> Option<MapKind> {
        match raw {
            0 => Some(MapKind::Unmapped),
            1 => Some(MapKind::Simple),
            2 => Some(MapKind::List),
            _ => None,
        }
    }
}

/// Kernel-to-user command header. Exchanged whole; a short read is an error.
#[derive(Debug, Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct K2uHeader {
    pub id: u64,
    pub opcode: u32,
    _pad0: u32,
    pub offset: u64,
    pub length: u64,
    pub data_address: u64,
    pub mapping_data: u64,
    pub data_map_type: i32,
    _pad1: u32,
}

const _: () = assert!(size_of::<K2uHeader>() == 56);

impl K2uHeader {
    pub fn new(
        id: u64,
        opcode: u32,
        offset: u64,
        length: u64,
        data_address: u64,
        mapping_data: u64,
        data_map_type: i32,
    ) -> Self {
        K2uHeader {
            id,
            opcode,
            _pad0: 0,
            offset,
            length,
            data_address,
            mapping_data,
            data_map_type,
            _pad1: 0,
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<K2uHeader> {
        K2uHeader::read_from(bytes.get(..K2U_HEADER_SIZE)?)
    }

    pub fn encode_to(&self, out: &mut [u8]) {
        out[..K2U_HEADER_SIZE].copy_from_slice(self.as_bytes());
    }

    pub fn map_kind(&self) -> Option<MapKind> {
        MapKind::from_raw(self.data_map_type)
    }
}

/// User-to-kernel reply header.
///
/// `reply` doubles as a `{u2k_type, u2k_length}` pair while the connection
/// is still unbound: the control type occupies the low 32 bits and the
/// payload length the high 32 bits, matching the little-endian union layout
/// of the C ABI.
#[derive(Debug, Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct U2kHeader {
    pub id: u64,
    pub reply: i64,
    pub user_data: u64,
}

const _: () = assert!(size_of::<U2kHeader>() == 24);

impl U2kHeader {
    pub fn reply(id: u64, reply: i64, user_data: u64) -> Self {
        U2kHeader {
            id,
            reply,
            user_data,
        }
    }

    pub fn control(u2k_type: u32, u2k_length: u32, user_data: u64) -> Self {
        U2kHeader {
            id: 0,
            reply: (u2k_type as i64) | ((u2k_length as i64) << 32),
            user_data,
        }
    }

    pub fn u2k_type(&self) -> u32 {
        self.reply as u32
    }

    pub fn u2k_length(&self) -> u32 {
        (self.reply >> 32) as u32
    }

    pub fn decode(bytes: &[u8]) -> Option<U2kHeader> {
        U2kHeader::read_from(bytes.get(..U2K_HEADER_SIZE)?)
    }

    pub fn as_wire_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}
