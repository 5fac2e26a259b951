/// Binary subtype byte, per `spec.md` §3/§4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinarySubtype {
    Generic,
    Function,
    BinaryOld,
    UuidOld,
    Uuid,
    Md5,
    Encrypted,
    Column,
    Custom(u8),
}

impl BinarySubtype {
    pub fn to_u8(self) -> u8 {
        match self {
            BinarySubtype::Generic => 0x00,
            BinarySubtype::Function => 0x01,
            BinarySubtype::BinaryOld => 0x02,
            BinarySubtype::UuidOld => 0x03,
            BinarySubtype::Uuid => 0x04,
            BinarySubtype::Md5 => 0x05,
            BinarySubtype::Encrypted => 0x06,
            BinarySubtype::Column => 0x07,
            BinarySubtype::Custom(b) => b,
        }
    }

    pub fn from_u8(b: u8) -> Self {
        match b {
            0x00 => BinarySubtype::Generic,
            0x01 => BinarySubtype::Function,
            0x02 => BinarySubtype::BinaryOld,
            0x03 => BinarySubtype::UuidOld,
            0x04 => BinarySubtype::Uuid,
            0x05 => BinarySubtype::Md5,
            0x06 => BinarySubtype::Encrypted,
            0x07 => BinarySubtype::Column,
            other => BinarySubtype::Custom(other),
        }
    }
}

/// A binary value. Subtype `0x02` ("binary old") carries an extra inner
/// length prefix on the wire, which is preserved verbatim so a decoded value
/// re-encodes byte-identically (`spec.md` §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binary {
    pub subtype: BinarySubtype,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn new(subtype: BinarySubtype, bytes: Vec<u8>) -> Self {
        Binary { subtype, bytes }
    }

    pub fn generic(bytes: Vec<u8>) -> Self {
        Binary::new(BinarySubtype::Generic, bytes)
    }

    pub fn uuid(bytes: [u8; 16]) -> Self {
        Binary::new(BinarySubtype::Uuid, bytes.to_vec())
    }
}
