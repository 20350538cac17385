/// Command opcodes carried in the K2U header.
///
/// The numeric values are wire ABI; the gaps come from the block layer
/// operation codes the engine forwards verbatim.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Connect = 0,
    Disconnect = 1,
    Read = 2,
    Write = 3,
    Discard = 4,
    Ioctl = 5,
    Flush = 6,
    ReportZones = 9,
    ZoneOpen = 10,
    ZoneClose = 11,
    ZoneFinish = 12,
    ZoneAppend = 13,
    ZoneReset = 15,
    ZoneResetAll = 17,
}

impl Opcode {
    pub fn from_raw(raw: u32) -> Option<Opcode> {
        Some(match raw {
            0 => Opcode::Connect,
            1 => Opcode::Disconnect,
            2 => Opcode::Read,
            3 => Opcode::Write,
            4 => Opcode::Discard,
            5 => Opcode::Ioctl,
            6 => Opcode::Flush,
            9 => Opcode::ReportZones,
            10 => Opcode::ZoneOpen,
            11 => Opcode::ZoneClose,
            12 => Opcode::ZoneFinish,
            13 => Opcode::ZoneAppend,
            15 => Opcode::ZoneReset,
            17 => Opcode::ZoneResetAll,
            _ => return None,
        })
    }

    /// Everything except zone reporting is a block request whose reply is a
    /// block status; zone reporting replies with a byte count.
    pub fn is_blk_request(self) -> bool {
        self != Opcode::ReportZones
    }

    pub fn may_have_data(self) -> bool {
        matches!(self, Opcode::Read | Opcode::Write | Opcode::ZoneAppend)
    }

    /// True when payload flows kernel-to-user (host memory is the source).
    pub fn is_write(self) -> bool {
        matches!(self, Opcode::Write | Opcode::ZoneAppend)
    }
}

/// Control types accepted in a U2K header before the connection is bound.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlType {
    /// Bind to an existing device; `user_data` points at the disk name.
    Connect = 0,
    /// Register a new device; `user_data` points at a `DeviceOptions`.
    Create = 1,
}

impl ControlType {
    pub fn from_raw(raw: u32) -> Option<ControlType> {
        match raw {
            0 => Some(ControlType::Connect),
            1 => Some(ControlType::Create),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        for raw in 0..32 {
            if let Some(op) = Opcode::from_raw(raw) {
                assert_eq!(op as u32, raw);
            }
        }
        assert!(Opcode::from_raw(7).is_none());
        assert!(Opcode::from_raw(14).is_none());
        assert!(Opcode::from_raw(16).is_none());
        assert!(Opcode::from_raw(u32::MAX).is_none());
    }

    #[test]
    fn data_direction() {
        assert!(Opcode::Write.is_write());
        assert!(Opcode::ZoneAppend.is_write());
        assert!(!Opcode::Read.is_write());
        assert!(Opcode::Read.may_have_data());
        assert!(!Opcode::Flush.may_have_data());
        assert!(!Opcode::ReportZones.is_blk_request());
    }
}
