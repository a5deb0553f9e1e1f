use std::io::Write;

use ahash::AHashSet;

use crate::blon::string_cache::StringCache;
use crate::blon::BlonTag;
use crate::lua_value::{LuaArgs, LuaString, LuaTable, LuaValue};
use crate::lua_vm::lua_limits::BLON_MAX_ARGS;
use crate::lua_vm::{LuaError, LuaResult};

/// Streaming BLON encoder.
///
/// One writer owns one string cache; values written through the same writer
/// share back-references, so they must be read back through one reader in
/// the same order.
pub struct BlonWriter<W: Write> {
    out: W,
    cache: StringCache,
    in_progress: AHashSet<usize>,
}

impl<W: Write> BlonWriter<W> {
    pub fn new(out: W) -> Self {
        BlonWriter {
            out,
            cache: StringCache::new(),
            in_progress: AHashSet::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Writes an argument list: a count byte followed by the values.
    pub fn write_args(&mut self, args: &LuaArgs) -> LuaResult<()> {
        if args.len() > BLON_MAX_ARGS {
            return Err(LuaError::InvalidData(format!(
                "cannot encode {} values (at most {})",
                args.len(),
                BLON_MAX_ARGS
            )));
        }
        self.out.write_all(&[args.len() as u8])?;
        for value in args {
            self.write_value(value)?;
        }
        Ok(())
    }

    pub fn write_value(&mut self, value: &LuaValue) -> LuaResult<()> {
        match value {
            LuaValue::Nil => self.tag(BlonTag::Nil),
            LuaValue::Boolean(false) => self.tag(BlonTag::False),
            LuaValue::Boolean(true) => self.tag(BlonTag::True),
            LuaValue::Integer(i) => self.write_integer(*i),
            LuaValue::Number(n) => self.write_number(*n),
            LuaValue::String(s) => self.write_string(s),
            LuaValue::Table(t) => self.write_table(t),
            other => Err(LuaError::Marshal(format!(
                "cannot encode a {} value",
                describe(other)
            ))),
        }
    }

    fn tag(&mut self, tag: BlonTag) -> LuaResult<()> {
        self.out.write_all(&[tag as u8])?;
        Ok(())
    }

    fn tagged(&mut self, tag: BlonTag, payload: &[u8]) -> LuaResult<()> {
        self.tag(tag)?;
        self.out.write_all(payload)?;
        Ok(())
    }

    fn write_integer(&mut self, i: i64) -> LuaResult<()> {
        match i {
            0 => self.tag(BlonTag::Zero),
            1 => self.tag(BlonTag::One),
            _ => {
                let magnitude = i.unsigned_abs();
                let negative = i < 0;
                if let Ok(m) = u8::try_from(magnitude) {
                    let tag = if negative { BlonTag::NegUInt8 } else { BlonTag::UInt8 };
                    self.tagged(tag, &[m])
                } else if let Ok(m) = u16::try_from(magnitude) {
                    let tag = if negative { BlonTag::NegUInt16 } else { BlonTag::UInt16 };
                    self.tagged(tag, &m.to_le_bytes())
                } else if let Ok(m) = u32::try_from(magnitude) {
                    let tag = if negative { BlonTag::NegUInt32 } else { BlonTag::UInt32 };
                    self.tagged(tag, &m.to_le_bytes())
                } else {
                    self.tagged(BlonTag::Int64, &i.to_le_bytes())
                }
            }
        }
    }

    fn write_number(&mut self, n: f64) -> LuaResult<()> {
        let narrow = n as f32;
        if (narrow as f64).to_bits() == n.to_bits() {
            self.tagged(BlonTag::Float32, &narrow.to_le_bytes())
        } else {
            self.tagged(BlonTag::Float64, &n.to_le_bytes())
        }
    }

    fn write_string(&mut self, s: &LuaString) -> LuaResult<()> {
        let bytes = s.as_bytes();
        if StringCache::is_cacheable(bytes) {
            if let Some(slot) = self.cache.find(s) {
                return self.tagged(BlonTag::PreviouslyCachedString, &[slot]);
            }
            self.cache.insert(s.clone());
            self.tagged(BlonTag::String8Cached, &[bytes.len() as u8])?;
        } else {
            self.write_length(bytes.len(), [BlonTag::String8, BlonTag::String16, BlonTag::String32])?;
        }
        self.out.write_all(bytes)?;
        Ok(())
    }

    fn write_table(&mut self, table: &LuaTable) -> LuaResult<()> {
        if !self.in_progress.insert(table.addr()) {
            return Err(LuaError::Marshal(
                "cannot encode a table that contains itself".to_string(),
            ));
        }
        let pairs = table.pairs();
        let result = self
            .write_length(pairs.len(), [BlonTag::Table8, BlonTag::Table16, BlonTag::Table32])
            .and_then(|_| {
                pairs.iter().try_for_each(|(k, v)| {
                    self.write_value(k)?;
                    self.write_value(v)
                })
            });
        self.in_progress.remove(&table.addr());
        result
    }

    fn write_length(&mut self, len: usize, tags: [BlonTag; 3]) -> LuaResult<()> {
        if let Ok(n) = u8::try_from(len) {
            self.tagged(tags[0], &[n])
        } else if let Ok(n) = u16::try_from(len) {
            self.tagged(tags[1], &n.to_le_bytes())
        } else if let Ok(n) = u32::try_from(len) {
            self.tagged(tags[2], &n.to_le_bytes())
        } else {
            Err(LuaError::InvalidData(format!("length {} does not fit the format", len)))
        }
    }
}

fn describe(value: &LuaValue) -> &'static str {
    match value {
        LuaValue::Object(o) => o.type_name(),
        LuaValue::NativeFunction(_) | LuaValue::Function(_) => "function",
        LuaValue::Coroutine(_) => "thread",
        other => other.type_name(),
    }
}
