/// Wire opcodes. `spec.md` §4.2 names OP_MSG as the steady-state framing and
/// OP_QUERY only for the legacy handshake path; the legacy path is not
/// exercised by the core handshake (`hello` is always sent as OP_MSG here,
/// matching current deployments), but the opcode constant is kept for
/// completeness and for bound-connection diagnostics.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply = 1,
    Query = 2004,
    Compressed = 2012,
    Message = 2013,
}

/// `flagBits` of an OP_MSG message. Only `checksumPresent` and `moreToCome`
/// are defined by the protocol; `exhaustAllowed` is a request-only bit this
/// driver never sets since it does not implement exhaust cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u32);

impl MessageFlags {
    const CHECKSUM_PRESENT: u32 = 1 << 0;
    const MORE_TO_COME: u32 = 1 << 1;
    const EXHAUST_ALLOWED: u32 = 1 << 16;

    pub fn empty() -> Self {
        MessageFlags(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        MessageFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn with_more_to_come(mut self) -> Self {
        self.0 |= Self::MORE_TO_COME;
        self
    }

    pub fn more_to_come(self) -> bool {
        self.0 & Self::MORE_TO_COME != 0
    }

    pub fn checksum_present(self) -> bool {
        self.0 & Self::CHECKSUM_PRESENT != 0
    }

    pub fn exhaust_allowed(self) -> bool {
        self.0 & Self::EXHAUST_ALLOWED != 0
    }
}
