//! BLON: a compact binary encoding of plain values.
//!
//! Supports nil, booleans, integers, floats, strings and tables (nested,
//! acyclic). Every value starts with a one-byte [`BlonTag`]; multi-byte
//! payloads are little-endian. Integers pick the smallest of the unsigned
//! or negated-unsigned widths, floats travel as `f32` when that is
//! bit-exact, and short strings are replaced by two-byte back-references
//! once they have been seen.
//!
//! [`encode_value`] / [`decode_value`] (and the `args` variants) wrap the
//! stream in gzip; [`BlonWriter`] / [`BlonReader`] work on raw streams.

mod reader;
mod string_cache;
mod tag;
mod writer;

use std::io::Write;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub use reader::BlonReader;
pub use tag::BlonTag;
pub use writer::BlonWriter;

use crate::lua_value::{LuaArgs, LuaValue};
use crate::lua_vm::{LuaError, LuaResult};

/// Encodes one value into a gzip-compressed BLON blob.
pub fn encode_value(value: &LuaValue) -> LuaResult<Vec<u8>> {
    compress(|writer| writer.write_value(value))
}

/// Decodes a blob produced by [`encode_value`].
pub fn decode_value(bytes: &[u8]) -> LuaResult<LuaValue> {
    decompress(bytes, |reader| reader.read_value())
}

/// Encodes an argument list (at most 255 values).
pub fn encode_args(args: &LuaArgs) -> LuaResult<Vec<u8>> {
    compress(|writer| writer.write_args(args))
}

pub fn decode_args(bytes: &[u8]) -> LuaResult<LuaArgs> {
    decompress(bytes, |reader| reader.read_args())
}

/// Uncompressed BLON bytes of one value.
pub fn encode_raw_value(value: &LuaValue) -> LuaResult<Vec<u8>> {
    let mut writer = BlonWriter::new(Vec::new());
    writer.write_value(value)?;
    Ok(writer.into_inner())
}

/// Decodes uncompressed BLON bytes of one value.
pub fn decode_raw_value(bytes: &[u8]) -> LuaResult<LuaValue> {
    let mut reader = BlonReader::new(bytes);
    let value = reader.read_value()?;
    ensure_exhausted(&mut reader)?;
    Ok(value)
}

fn compress<F>(write: F) -> LuaResult<Vec<u8>>
where
    F: FnOnce(&mut BlonWriter<&mut GzEncoder<Vec<u8>>>) -> LuaResult<()>,
{
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    {
        let mut writer = BlonWriter::new(&mut encoder);
        write(&mut writer)?;
    }
    encoder.flush()?;
    Ok(encoder.finish()?)
}

fn decompress<T, F>(bytes: &[u8], read: F) -> LuaResult<T>
where
    F: FnOnce(&mut BlonReader<GzDecoder<&[u8]>>) -> LuaResult<T>,
{
    let mut reader = BlonReader::new(GzDecoder::new(bytes));
    let value = read(&mut reader)?;
    ensure_exhausted(&mut reader)?;
    Ok(value)
}

fn ensure_exhausted<R: std::io::Read>(reader: &mut BlonReader<R>) -> LuaResult<()> {
    if reader.is_exhausted()? {
        Ok(())
    } else {
        Err(LuaError::InvalidData("trailing data after value".to_string()))
    }
}
