//! Length-prefixed, checksummed, self-describing record framing used for
//! every durable manifest, branch file, and changelog entry:
//!
//! ```text
//! u32 length | u32 crc32 | u8 version | payload
//! ```
//!
//! `payload` is stable JSON (`serde_json`), chosen as the one encoding per
//! the external-interfaces contract. `length` covers `version byte + payload`
//! (not itself); `crc32` is computed over the same span.

use std::io::{Read, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Encode `value` as a single framed record.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    let mut body = Vec::with_capacity(1 + payload.len());
    body.push(RECORD_FORMAT_VERSION);
    body.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(4 + 4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a single framed record from the front of `bytes`, returning the
/// value and the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], path: &std::path::Path) -> Result<(T, usize)> {
    if bytes.len() < 8 {
        return Err(Error::CorruptedManifest {
            path: path.to_path_buf(),
            reason: "record too short for frame header".into(),
        });
    }
    let length = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let expected_crc = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let total = 8 + length;
    if bytes.len() < total {
        return Err(Error::CorruptedManifest {
            path: path.to_path_buf(),
            reason: format!("record truncated: declared {length} bytes, have {}", bytes.len() - 8),
        });
    }
    let body = &bytes[8..total];

    let mut hasher = Hasher::new();
    hasher.update(body);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return Err(Error::CorruptedManifest {
            path: path.to_path_buf(),
            reason: format!("checksum mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"),
        });
    }

    if body.is_empty() {
        return Err(Error::CorruptedManifest {
            path: path.to_path_buf(),
            reason: "empty record body".into(),
        });
    }
    let version = body[0];
    if version != RECORD_FORMAT_VERSION {
        return Err(Error::CorruptedManifest {
            path: path.to_path_buf(),
            reason: format!("unsupported record version {version}"),
        });
    }
    let value = serde_json::from_slice(&body[1..])
        .map_err(|e| Error::CorruptedManifest {
            path: path.to_path_buf(),
            reason: format!("payload deserialize failed: {e}"),
        })?;
    Ok((value, total))
}

/// Write a single record to a fresh file at `path`, atomically via a
/// temp-file-then-rename on the same filesystem, and fsync the result.
pub fn write_atomic<T: Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    let framed = encode(value)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?;
        f.write_all(&framed).map_err(|e| Error::io(&tmp_path, e))?;
        f.sync_all().map_err(|e| Error::io(&tmp_path, e))?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| Error::io(path, e))?;
    Ok(())
}

/// Read and decode a single-record file in full.
pub fn read_one<T: DeserializeOwned>(path: &std::path::Path) -> Result<T> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| Error::io(path, e))?;
    let (value, _) = decode(&bytes, path)?;
    Ok(value)
}

/// Append a framed record to a growing log file, fsyncing afterward.
pub fn append<T: Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    let framed = encode(value)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    f.write_all(&framed).map_err(|e| Error::io(path, e))?;
    f.sync_all().map_err(|e| Error::io(path, e))?;
    Ok(())
}

/// Decode every record in a log file in order.
pub fn read_all<T: DeserializeOwned>(path: &std::path::Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| Error::io(path, e))?;

    let mut out = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (value, consumed) = decode(&bytes[offset..], path)?;
        out.push(value);
        offset += consumed;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        value: u64,
    }

    #[test]
    fn encode_decode_roundtrips() {
        let s = Sample { name: "users".into(), value: 42 };
        let bytes = encode(&s).unwrap();
        let (decoded, consumed): (Sample, usize) = decode(&bytes, std::path::Path::new("x")).unwrap();
        assert_eq!(decoded, s);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let s = Sample { name: "users".into(), value: 1 };
        let mut bytes = encode(&s).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let result: Result<(Sample, usize)> = decode(&bytes, std::path::Path::new("x"));
        assert!(matches!(result, Err(Error::CorruptedManifest { .. })));
    }

    #[test]
    fn write_atomic_then_read_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest");
        let s = Sample { name: "orders".into(), value: 7 };
        write_atomic(&path, &s).unwrap();
        let read_back: Sample = read_one(&path).unwrap();
        assert_eq!(read_back, s);
    }

    #[test]
    fn append_and_read_all_preserves_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        for i in 0..5u64 {
            append(&path, &Sample { name: format!("t{i}"), value: i }).unwrap();
        }
        let all: Vec<Sample> = read_all(&path).unwrap();
        assert_eq!(all.len(), 5);
        for (i, s) in all.iter().enumerate() {
            assert_eq!(s.value, i as u64);
        }
    }

    #[test]
    fn read_all_on_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");
        let all: Vec<Sample> = read_all(&path).unwrap();
        assert!(all.is_empty());
    }
}
