use std::io::{ErrorKind, Read};

use crate::blon::string_cache::StringCache;
use crate::blon::BlonTag;
use crate::lua_value::{LuaArgs, LuaString, LuaTable, LuaValue};
use crate::lua_vm::lua_limits::MAX_DECODE_DEPTH;
use crate::lua_vm::{LuaError, LuaResult};

/// Streaming BLON decoder, the mirror image of
/// [`BlonWriter`](crate::blon::BlonWriter).
pub struct BlonReader<R: Read> {
    input: R,
    cache: StringCache,
}

impl<R: Read> BlonReader<R> {
    pub fn new(input: R) -> Self {
        BlonReader {
            input,
            cache: StringCache::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.input
    }

    pub fn read_args(&mut self) -> LuaResult<LuaArgs> {
        let count = self.read_u8()?;
        (0..count).map(|_| self.read_value()).collect::<LuaResult<Vec<_>>>().map(LuaArgs::from_vec)
    }

    pub fn read_value(&mut self) -> LuaResult<LuaValue> {
        self.read_value_at(0)
    }

    /// True when the underlying stream has no more bytes.
    pub fn is_exhausted(&mut self) -> LuaResult<bool> {
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) => return Ok(true),
                Ok(_) => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(truncated(e)),
            }
        }
    }

    fn read_value_at(&mut self, depth: usize) -> LuaResult<LuaValue> {
        let tag = BlonTag::try_from(self.read_u8()?)?;
        let value = match tag {
            BlonTag::Nil => LuaValue::Nil,
            BlonTag::False => LuaValue::Boolean(false),
            BlonTag::True => LuaValue::Boolean(true),
            BlonTag::Zero => LuaValue::Integer(0),
            BlonTag::One => LuaValue::Integer(1),
            BlonTag::UInt8 => LuaValue::Integer(self.read_u8()? as i64),
            BlonTag::UInt16 => LuaValue::Integer(u16::from_le_bytes(self.read_array()?) as i64),
            BlonTag::UInt32 => LuaValue::Integer(u32::from_le_bytes(self.read_array()?) as i64),
            BlonTag::NegUInt8 => LuaValue::Integer(-(self.read_u8()? as i64)),
            BlonTag::NegUInt16 => LuaValue::Integer(-(u16::from_le_bytes(self.read_array()?) as i64)),
            BlonTag::NegUInt32 => LuaValue::Integer(-(u32::from_le_bytes(self.read_array()?) as i64)),
            BlonTag::Int64 => LuaValue::Integer(i64::from_le_bytes(self.read_array()?)),
            BlonTag::Float32 => LuaValue::Number(f32::from_le_bytes(self.read_array()?) as f64),
            BlonTag::Float64 => LuaValue::Number(f64::from_le_bytes(self.read_array()?)),
            BlonTag::String8 => {
                let len = self.read_u8()? as usize;
                LuaValue::String(self.read_string(len)?)
            }
            BlonTag::String16 => {
                let len = u16::from_le_bytes(self.read_array()?) as usize;
                LuaValue::String(self.read_string(len)?)
            }
            BlonTag::String32 => {
                let len = u32::from_le_bytes(self.read_array()?) as usize;
                LuaValue::String(self.read_string(len)?)
            }
            BlonTag::String8Cached => {
                let len = self.read_u8()? as usize;
                let s = self.read_string(len)?;
                self.cache.insert(s.clone());
                LuaValue::String(s)
            }
            BlonTag::PreviouslyCachedString => {
                let slot = self.read_u8()?;
                match self.cache.get(slot) {
                    Some(s) => LuaValue::String(s.clone()),
                    None => {
                        return Err(LuaError::InvalidData(format!(
                            "reference to empty string cache slot {}",
                            slot
                        )));
                    }
                }
            }
            BlonTag::Table8 => {
                let count = self.read_u8()? as usize;
                self.read_table(count, depth)?
            }
            BlonTag::Table16 => {
                let count = u16::from_le_bytes(self.read_array()?) as usize;
                self.read_table(count, depth)?
            }
            BlonTag::Table32 => {
                let count = u32::from_le_bytes(self.read_array()?) as usize;
                self.read_table(count, depth)?
            }
        };
        Ok(value)
    }

    fn read_table(&mut self, count: usize, depth: usize) -> LuaResult<LuaValue> {
        if depth >= MAX_DECODE_DEPTH {
            return Err(LuaError::InvalidData(format!(
                "tables nested deeper than {} levels",
                MAX_DECODE_DEPTH
            )));
        }
        // The count comes from untrusted input; do not pre-size from it.
        let table = LuaTable::new();
        for _ in 0..count {
            let key = self.read_value_at(depth + 1)?;
            let value = self.read_value_at(depth + 1)?;
            if key.is_nil() || value.is_nil() {
                return Err(LuaError::InvalidData("nil in table entry".to_string()));
            }
            table
                .set(key, value)
                .map_err(|e| LuaError::InvalidData(e.to_string()))?;
        }
        Ok(LuaValue::Table(table))
    }

    fn read_u8(&mut self) -> LuaResult<u8> {
        let [b] = self.read_array::<1>()?;
        Ok(b)
    }

    fn read_array<const N: usize>(&mut self) -> LuaResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.input.read_exact(&mut buf).map_err(truncated)?;
        Ok(buf)
    }

    fn read_string(&mut self, len: usize) -> LuaResult<LuaString> {
        let mut buf = Vec::new();
        let read = (&mut self.input)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(truncated)?;
        if read != len {
            return Err(LuaError::InvalidData("unexpected end of data".to_string()));
        }
        Ok(LuaString::from(buf))
    }
}

fn truncated(e: std::io::Error) -> LuaError {
    match e.kind() {
        ErrorKind::UnexpectedEof => LuaError::InvalidData("unexpected end of data".to_string()),
        ErrorKind::InvalidData | ErrorKind::InvalidInput => LuaError::InvalidData(e.to_string()),
        _ => LuaError::Io(e),
    }
}
