//! Chunk types and fingerprinting.

use std::fmt;
use std::io::{self, Read};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{RemoteError, Result};
use crate::remote::{ManifestEntry, PartDescriptor};

/// Fixed chunk boundary (1 MiB)
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Fingerprint of zero bytes: md5("") followed by sha1("")
pub const EMPTY_FINGERPRINT: &str =
    "d41d8cd98f00b204e9800998ecf8427eda39a3ee5e6b4b0d3255bfef95601890afd80709";

/// Hex md5 digest followed by hex sha1 digest of a chunk's bytes.
///
/// This pair is the identity the server deduplicates on.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Length of a fingerprint in hex characters (32 for md5, 40 for sha1)
    pub const LEN: usize = 72;

    pub fn compute(data: &[u8]) -> Self {
        let md5 = md5::compute(data);
        let mut hasher = Sha1::new();
        hasher.update(data);
        let sha1 = hasher.finalize();
        Self(format!("{:x}{}", md5, hex::encode(sha1)))
    }

    /// The sentinel the server recognizes as "no content"
    pub fn empty() -> Self {
        Self(EMPTY_FINGERPRINT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.0[..self.0.len().min(16)])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A contiguous byte range of an object.
///
/// The payload is only held until the server has it; committed manifests
/// carry fingerprints, offsets and sizes alone.
#[derive(Clone)]
pub struct Chunk {
    pub fingerprint: Fingerprint,
    pub offset: u64,
    pub size: u32,
    pub payload: Option<Bytes>,
}

impl Chunk {
    /// Fingerprint `data` as the chunk starting at `offset`
    pub fn new(offset: u64, data: Bytes) -> Self {
        let fingerprint = if data.is_empty() {
            Fingerprint::empty()
        } else {
            Fingerprint::compute(&data)
        };
        Self {
            fingerprint,
            offset,
            size: data.len() as u32,
            payload: Some(data),
        }
    }

    pub fn descriptor(&self) -> PartDescriptor {
        PartDescriptor {
            fingerprint: self.fingerprint.to_string(),
            size: self.size,
        }
    }

    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            fingerprint: self.fingerprint.to_string(),
            offset: self.offset,
            size: self.size,
        }
    }

    pub fn discard_payload(&mut self) {
        self.payload = None;
    }

    fn end(&self) -> u64 {
        self.offset + u64::from(self.size)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("fingerprint", &self.fingerprint)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Split in-memory data into chunks
pub fn chunk_bytes(data: &[u8]) -> Vec<Chunk> {
    if data.is_empty() {
        return vec![Chunk::new(0, Bytes::new())];
    }
    data.chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(i, part)| Chunk::new((i * CHUNK_SIZE) as u64, Bytes::copy_from_slice(part)))
        .collect()
}

/// Split a byte stream into chunks, reading it to the end.
///
/// Boundaries depend only on offsets, never on how the reader happens to
/// return data, so the same content always yields the same chunks.
pub fn chunk_reader<R: Read>(mut reader: R) -> io::Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let filled = fill(&mut reader, &mut buf)?;
        if filled == 0 {
            break;
        }
        buf.truncate(filled);
        let chunk = Chunk::new(offset, Bytes::from(buf));
        offset = chunk.end();
        chunks.push(chunk);
        if filled < CHUNK_SIZE {
            break;
        }
    }

    if chunks.is_empty() {
        chunks.push(Chunk::new(0, Bytes::new()));
    }
    Ok(chunks)
}

/// Read until `buf` is full or the reader is exhausted
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Check that `chunks` tile `[0, size)` exactly, in order.
pub fn verify_manifest(chunks: &[Chunk], size: u64) -> Result<()> {
    let mut expected_offset = 0u64;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.offset != expected_offset {
            return Err(RemoteError::ProtocolInvariant(format!(
                "chunk {} starts at {} but the previous one ended at {}",
                i, chunk.offset, expected_offset
            )));
        }
        if chunk.size == 0 && chunks.len() > 1 {
            return Err(RemoteError::ProtocolInvariant(format!(
                "chunk {} is empty in a multi-chunk manifest",
                i
            )));
        }
        expected_offset = chunk.end();
    }
    if expected_offset != size {
        return Err(RemoteError::ProtocolInvariant(format!(
            "manifest covers {} bytes but the object is {} bytes",
            expected_offset, size
        )));
    }
    Ok(())
}
