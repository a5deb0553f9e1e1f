use crate::lua_vm::{LuaError, LuaResult};

/// One-byte type tags of the BLON format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlonTag {
    Nil = 0,
    False = 1,
    True = 2,
    Zero = 3,
    One = 4,
    UInt8 = 5,
    UInt16 = 6,
    UInt32 = 7,
    NegUInt8 = 8,
    NegUInt16 = 9,
    NegUInt32 = 10,
    Int64 = 11,
    Float32 = 12,
    Float64 = 13,
    String8 = 14,
    String16 = 15,
    String32 = 16,
    /// A short string that is also stored in the next cache slot.
    String8Cached = 17,
    /// A back-reference: the next byte is a cache slot.
    PreviouslyCachedString = 18,
    Table8 = 19,
    Table16 = 20,
    Table32 = 21,
}

impl TryFrom<u8> for BlonTag {
    type Error = LuaError;

    fn try_from(byte: u8) -> LuaResult<Self> {
        use BlonTag::*;
        Ok(match byte {
            0 => Nil,
            1 => False,
            2 => True,
            3 => Zero,
            4 => One,
            5 => UInt8,
            6 => UInt16,
            7 => UInt32,
            8 => NegUInt8,
            9 => NegUInt16,
            10 => NegUInt32,
            11 => Int64,
            12 => Float32,
            13 => Float64,
            14 => String8,
            15 => String16,
            16 => String32,
            17 => String8Cached,
            18 => PreviouslyCachedString,
            19 => Table8,
            20 => Table16,
            21 => Table32,
            other => {
                return Err(LuaError::InvalidData(format!("unknown type tag {}", other)));
            }
        })
    }
}
