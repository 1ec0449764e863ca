mod chunk;

pub use chunk::{
    chunk_bytes, chunk_reader, verify_manifest, Chunk, Fingerprint, CHUNK_SIZE, EMPTY_FINGERPRINT,
};

use std::collections::HashSet;
use std::io::Read;

use crate::error::Result;
use crate::remote::{ManifestEntry, ObjectMutation, PartDescriptor, RemoteClient};

/// Outcome of a committed upload
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub size: u64,
    pub chunks: usize,
    /// Chunks whose payload actually went over the wire
    pub sent_chunks: usize,
    pub sent_bytes: u64,
    pub manifest: Vec<ManifestEntry>,
}

impl UploadReport {
    pub fn deduplicated_chunks(&self) -> usize {
        self.chunks - self.sent_chunks
    }
}

/// Store `size` bytes read from `reader` as the object at `path`.
///
/// Chunks the content, asks the server which parts it lacks, sends only
/// those in a single batch and commits the manifest. A failure at any step
/// leaves the remote object untouched; parts already sent are harmless
/// since the server keys them by fingerprint. A reader that yields a
/// different number of bytes than `size` fails before anything is sent.
pub async fn upload<R: Read + Send>(
    client: &RemoteClient,
    path: &str,
    reader: R,
    size: u64,
) -> Result<UploadReport> {
    let mut chunks = chunk_reader(reader)?;
    verify_manifest(&chunks, size)?;
    tracing::debug!("uploading {} ({} bytes, {} chunks)", path, size, chunks.len());

    let descriptors: Vec<PartDescriptor> = chunks.iter().map(Chunk::descriptor).collect();
    let missing: HashSet<(String, u32)> = client
        .api()
        .has_parts(&descriptors)
        .await?
        .into_iter()
        .map(|part| (part.fingerprint, part.size))
        .collect();

    // Identical ranges only need to travel once.
    let mut queued = HashSet::new();
    let to_send: Vec<Chunk> = chunks
        .iter()
        .filter(|c| {
            let key = (c.fingerprint.to_string(), c.size);
            missing.contains(&key) && queued.insert(key)
        })
        .cloned()
        .collect();

    let sent_chunks = to_send.len();
    let sent_bytes: u64 = to_send.iter().map(|c| u64::from(c.size)).sum();
    if to_send.is_empty() {
        tracing::debug!("server already holds every part of {}", path);
    } else {
        tracing::debug!(
            "sending {} parts ({} bytes) for {}",
            sent_chunks,
            sent_bytes,
            path
        );
        client.api().send_parts(&to_send).await?;
    }
    drop(to_send);

    chunks.iter_mut().for_each(Chunk::discard_payload);
    let manifest: Vec<ManifestEntry> = chunks.iter().map(Chunk::manifest_entry).collect();

    client
        .mutate_metadata(ObjectMutation::CreateFile {
            path: path.to_string(),
            size,
            parts: manifest.clone(),
        })
        .await?;

    tracing::info!(
        "uploaded {} ({} bytes, {}/{} parts sent)",
        path,
        size,
        sent_chunks,
        chunks.len()
    );
    Ok(UploadReport {
        size,
        chunks: chunks.len(),
        sent_chunks,
        sent_bytes,
        manifest,
    })
}
