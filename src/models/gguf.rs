//! GGUF header reader: parses the key/value metadata section of a model file.
//!
//! Only the header is read: magic, version, tensor count, kv count and the
//! kv pairs themselves. Tensor descriptors and weights are never touched.
//! Tokenizer tables still have to be read through to reach the keys after
//! them, but only the first element of a non-byte array is kept in memory.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Strings longer than this are treated as corruption.
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Arrays longer than this are treated as corruption (tokenizer vocabularies
/// sit around 150k entries).
const MAX_ARRAY_LEN: u64 = 16 * 1024 * 1024;

/// A single metadata value as stored in the header.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    /// Raw string bytes. GGUF promises UTF-8 but files in the wild break it.
    String(Vec<u8>),
    /// Byte arrays (u8/i8) in full, any other array as its first element only.
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    /// Normalise a value to text.
    ///
    /// Byte-like values (strings, u8/i8 arrays) decode as lossy UTF-8. Other
    /// arrays collapse to their first element. Scalars print as-is.
    pub fn to_text(&self) -> Option<String> {
        match self {
            GgufValue::String(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            GgufValue::Array(items) => {
                if let Some(bytes) = byte_array(items) {
                    return Some(String::from_utf8_lossy(&bytes).into_owned());
                }
                items.first().and_then(GgufValue::to_text)
            }
            GgufValue::U8(v) => Some(v.to_string()),
            GgufValue::I8(v) => Some(v.to_string()),
            GgufValue::U16(v) => Some(v.to_string()),
            GgufValue::I16(v) => Some(v.to_string()),
            GgufValue::U32(v) => Some(v.to_string()),
            GgufValue::I32(v) => Some(v.to_string()),
            GgufValue::U64(v) => Some(v.to_string()),
            GgufValue::I64(v) => Some(v.to_string()),
            GgufValue::F32(v) => Some(v.to_string()),
            GgufValue::F64(v) => Some(v.to_string()),
            GgufValue::Bool(v) => Some(v.to_string()),
        }
    }

    /// Normalise a value to an integer, taking the first element of arrays.
    pub fn to_u64(&self) -> Option<u64> {
        match self {
            GgufValue::U8(v) => Some(*v as u64),
            GgufValue::U16(v) => Some(*v as u64),
            GgufValue::U32(v) => Some(*v as u64),
            GgufValue::U64(v) => Some(*v),
            GgufValue::I8(v) => u64::try_from(*v).ok(),
            GgufValue::I16(v) => u64::try_from(*v).ok(),
            GgufValue::I32(v) => u64::try_from(*v).ok(),
            GgufValue::I64(v) => u64::try_from(*v).ok(),
            GgufValue::Bool(v) => Some(*v as u64),
            GgufValue::F32(_) | GgufValue::F64(_) => None,
            GgufValue::String(bytes) => String::from_utf8_lossy(bytes).trim().parse().ok(),
            GgufValue::Array(items) => items.first().and_then(GgufValue::to_u64),
        }
    }
}

fn byte_array(items: &[GgufValue]) -> Option<Vec<u8>> {
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|item| match item {
            GgufValue::U8(b) => Some(*b),
            GgufValue::I8(b) => Some(*b as u8),
            _ => None,
        })
        .collect()
}

/// Parsed header: format version plus metadata in file order.
#[derive(Debug, Clone, Default)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata: Vec<(String, GgufValue)>,
}

impl GgufHeader {
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// First entry (in file order) whose key ends with `suffix`.
    pub fn find_suffix(&self, suffix: &str) -> Option<&GgufValue> {
        self.metadata
            .iter()
            .find(|(k, _)| k.ends_with(suffix))
            .map(|(_, v)| v)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GgufError {
    #[error("I/O error reading GGUF header: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file (bad magic)")]
    BadMagic,

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("Unknown GGUF value type {0}")]
    UnknownValueType(u32),

    #[error("GGUF length field {0} exceeds sanity limit")]
    LengthOverflow(u64),
}

/// Read the header of the GGUF file at `path`.
pub fn read_header(path: &Path) -> Result<GgufHeader, GgufError> {
    let file = File::open(path)?;
    parse_header(&mut BufReader::new(file))
}

/// Parse a GGUF header from any byte source.
pub fn parse_header<R: Read>(r: &mut R) -> Result<GgufHeader, GgufError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != GGUF_MAGIC {
        return Err(GgufError::BadMagic);
    }

    let version = read_u32(r)?;
    if version < 2 {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(r)?;
    let kv_count = read_u64(r)?;

    let mut metadata = Vec::new();
    for _ in 0..kv_count {
        let key = String::from_utf8_lossy(&read_string(r)?).into_owned();
        let vtype = read_u32(r)?;
        let value = read_value(r, vtype)?;
        metadata.push((key, value));
    }

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata,
    })
}

fn read_value<R: Read>(r: &mut R, vtype: u32) -> Result<GgufValue, GgufError> {
    let value = match vtype {
        0 => GgufValue::U8(read_array::<1, R>(r)?[0]),
        1 => GgufValue::I8(read_array::<1, R>(r)?[0] as i8),
        2 => GgufValue::U16(u16::from_le_bytes(read_array(r)?)),
        3 => GgufValue::I16(i16::from_le_bytes(read_array(r)?)),
        4 => GgufValue::U32(read_u32(r)?),
        5 => GgufValue::I32(i32::from_le_bytes(read_array(r)?)),
        6 => GgufValue::F32(f32::from_le_bytes(read_array(r)?)),
        7 => GgufValue::Bool(read_array::<1, R>(r)?[0] != 0),
        8 => GgufValue::String(read_string(r)?),
        9 => {
            let elem_type = read_u32(r)?;
            let count = read_u64(r)?;
            if count > MAX_ARRAY_LEN {
                return Err(GgufError::LengthOverflow(count));
            }
            if matches!(elem_type, 0 | 1) {
                let mut items = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    items.push(read_value(r, elem_type)?);
                }
                GgufValue::Array(items)
            } else {
                let mut items = Vec::new();
                if count > 0 {
                    items.push(read_value(r, elem_type)?);
                    for _ in 1..count {
                        skip_value(r, elem_type)?;
                    }
                }
                GgufValue::Array(items)
            }
        }
        10 => GgufValue::U64(read_u64(r)?),
        11 => GgufValue::I64(i64::from_le_bytes(read_array(r)?)),
        12 => GgufValue::F64(f64::from_le_bytes(read_array(r)?)),
        other => return Err(GgufError::UnknownValueType(other)),
    };
    Ok(value)
}

/// Consume one value of type `vtype` without keeping it.
fn skip_value<R: Read>(r: &mut R, vtype: u32) -> Result<(), GgufError> {
    let width = match vtype {
        0 | 1 | 7 => 1,
        2 | 3 => 2,
        4 | 5 | 6 => 4,
        10 | 11 | 12 => 8,
        8 => {
            let len = read_u64(r)?;
            if len > MAX_STRING_LEN {
                return Err(GgufError::LengthOverflow(len));
            }
            len
        }
        9 => {
            let elem_type = read_u32(r)?;
            let count = read_u64(r)?;
            if count > MAX_ARRAY_LEN {
                return Err(GgufError::LengthOverflow(count));
            }
            for _ in 0..count {
                skip_value(r, elem_type)?;
            }
            return Ok(());
        }
        other => return Err(GgufError::UnknownValueType(other)),
    };
    let skipped = io::copy(&mut r.by_ref().take(width), &mut io::sink())?;
    if skipped < width {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}

fn read_array<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N], GgufError> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, GgufError> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, GgufError> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

fn read_string<R: Read>(r: &mut R) -> Result<Vec<u8>, GgufError> {
    let len = read_u64(r)?;
    if len > MAX_STRING_LEN {
        return Err(GgufError::LengthOverflow(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Helpers for building synthetic GGUF headers in tests.
#[cfg(test)]
pub(crate) mod test_support {
    pub struct HeaderBuilder {
        kvs: Vec<u8>,
        count: u64,
    }

    impl HeaderBuilder {
        pub fn new() -> Self {
            Self { kvs: Vec::new(), count: 0 }
        }

        fn key(&mut self, key: &str, vtype: u32) {
            self.kvs.extend_from_slice(&(key.len() as u64).to_le_bytes());
            self.kvs.extend_from_slice(key.as_bytes());
            self.kvs.extend_from_slice(&vtype.to_le_bytes());
            self.count += 1;
        }

        pub fn string(mut self, key: &str, value: &[u8]) -> Self {
            self.key(key, 8);
            self.kvs.extend_from_slice(&(value.len() as u64).to_le_bytes());
            self.kvs.extend_from_slice(value);
            self
        }

        pub fn u32(mut self, key: &str, value: u32) -> Self {
            self.key(key, 4);
            self.kvs.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub fn u32_array(mut self, key: &str, values: &[u32]) -> Self {
            self.key(key, 9);
            self.kvs.extend_from_slice(&4u32.to_le_bytes());
            self.kvs.extend_from_slice(&(values.len() as u64).to_le_bytes());
            for v in values {
                self.kvs.extend_from_slice(&v.to_le_bytes());
            }
            self
        }

        pub fn string_array(mut self, key: &str, values: &[&str]) -> Self {
            self.key(key, 9);
            self.kvs.extend_from_slice(&8u32.to_le_bytes());
            self.kvs.extend_from_slice(&(values.len() as u64).to_le_bytes());
            for v in values {
                self.kvs.extend_from_slice(&(v.len() as u64).to_le_bytes());
                self.kvs.extend_from_slice(v.as_bytes());
            }
            self
        }

        pub fn u8_array(mut self, key: &str, values: &[u8]) -> Self {
            self.key(key, 9);
            self.kvs.extend_from_slice(&0u32.to_le_bytes());
            self.kvs.extend_from_slice(&(values.len() as u64).to_le_bytes());
            self.kvs.extend_from_slice(values);
            self
        }

        pub fn build(self) -> Vec<u8> {
            let mut buf = Vec::new();
            buf.extend_from_slice(b"GGUF");
            buf.extend_from_slice(&3u32.to_le_bytes());
            buf.extend_from_slice(&0u64.to_le_bytes());
            buf.extend_from_slice(&self.count.to_le_bytes());
            buf.extend_from_slice(&self.kvs);
            buf
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::HeaderBuilder;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_synthetic_header() {
        let data = HeaderBuilder::new()
            .string("general.architecture", b"llama")
            .string("general.name", b"Tiny Llama")
            .u32("llama.block_count", 22)
            .u32("general.file_type", 15)
            .build();

        let header = parse_header(&mut Cursor::new(data)).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.metadata.len(), 4);
        assert_eq!(header.get("general.name").and_then(|v| v.to_text()).as_deref(), Some("Tiny Llama"));
        assert_eq!(header.find_suffix("block_count").and_then(|v| v.to_u64()), Some(22));
    }

    #[test]
    fn rejects_bad_magic() {
        let result = parse_header(&mut Cursor::new(b"NOT_GGUF_DATA".to_vec()));
        assert!(matches!(result, Err(GgufError::BadMagic)));
    }

    #[test]
    fn rejects_version_one() {
        let mut data = b"GGUF".to_vec();
        data.extend_from_slice(&1u32.to_le_bytes());
        let result = parse_header(&mut Cursor::new(data));
        assert!(matches!(result, Err(GgufError::UnsupportedVersion(1))));
    }

    #[test]
    fn truncated_header_is_io_error() {
        let mut data = HeaderBuilder::new().string("general.name", b"cut").build();
        data.truncate(data.len() - 2);
        assert!(matches!(parse_header(&mut Cursor::new(data)), Err(GgufError::Io(_))));
    }

    #[test]
    fn invalid_utf8_decodes_lossily() {
        let v = GgufValue::String(vec![b'a', 0xff, b'b']);
        assert_eq!(v.to_text().unwrap(), "a\u{fffd}b");
    }

    #[test]
    fn byte_arrays_decode_as_text() {
        let data = HeaderBuilder::new().u8_array("general.size_label", b"7B").build();
        let header = parse_header(&mut Cursor::new(data)).unwrap();
        assert_eq!(header.get("general.size_label").unwrap().to_text().unwrap(), "7B");
    }

    #[test]
    fn sequences_collapse_to_first_element() {
        let data = HeaderBuilder::new().u32_array("x.block_count", &[40, 41]).build();
        let header = parse_header(&mut Cursor::new(data)).unwrap();
        let value = header.get("x.block_count").unwrap();
        assert_eq!(value.to_u64(), Some(40));
        assert_eq!(value.to_text().as_deref(), Some("40"));
    }

    #[test]
    fn vocabulary_arrays_keep_only_their_first_entry() {
        let vocab: Vec<String> = (0..10_000).map(|i| format!("tok{}", i)).collect();
        let vocab: Vec<&str> = vocab.iter().map(String::as_str).collect();
        let data = HeaderBuilder::new()
            .string_array("tokenizer.ggml.tokens", &vocab)
            .u32_array("tokenizer.ggml.token_type", &[1; 5000])
            .u32("llama.block_count", 32)
            .build();

        let header = parse_header(&mut Cursor::new(data)).unwrap();
        assert_eq!(
            header.get("tokenizer.ggml.tokens"),
            Some(&GgufValue::Array(vec![GgufValue::String(b"tok0".to_vec())]))
        );
        assert_eq!(
            header.get("tokenizer.ggml.token_type"),
            Some(&GgufValue::Array(vec![GgufValue::U32(1)]))
        );
        assert_eq!(header.get("llama.block_count").and_then(|v| v.to_u64()), Some(32));
    }

    #[test]
    fn truncated_skipped_array_is_io_error() {
        let mut data = HeaderBuilder::new().string_array("tokenizer.ggml.tokens", &["a", "bb", "ccc"]).build();
        data.truncate(data.len() - 2);
        assert!(matches!(parse_header(&mut Cursor::new(data)), Err(GgufError::Io(_))));
    }
}
