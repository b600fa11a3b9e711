//! Turning an incoming byte stream into stored chunks and a manifest.

use crate::chunk_store::{ChunkStore, PutOutcome};
use crate::error::EngineResult;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use larder_core::{Chunk, ChunkRef, Chunker, NarHasher, ObjectManifest};

/// Chunks stored concurrently while ingesting one object.
const UPLOAD_CONCURRENCY: usize = 8;

/// What ingesting one stream produced.
#[derive(Debug, Clone)]
pub struct IngestedObject {
    pub manifest: ObjectManifest,
    /// Chunks this ingest wrote for the first time.
    pub new_chunks: u64,
    pub new_bytes: u64,
}

/// Chunk `stream`, storing every chunk as soon as its boundary is known.
///
/// Memory is bounded by the chunker's buffer plus the chunks in flight,
/// not by the object size. Chunks are stored but not referenced: an
/// interrupted ingest leaves only refcount-0 chunks for GC.
pub async fn ingest<S, E>(
    chunker: &Chunker,
    chunks: &ChunkStore,
    mut stream: S,
) -> EngineResult<IngestedObject>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<crate::EngineError>,
{
    let mut splitter = chunker.stream();
    let mut hasher = NarHasher::new();
    let mut refs = Vec::new();
    let mut totals = Totals::default();

    while let Some(piece) = stream.next().await {
        let piece = piece.map_err(Into::into)?;
        hasher.update(&piece);
        let ready = splitter.push(&piece);
        store_all(chunks, ready, &mut refs, &mut totals).await?;
    }
    store_all(chunks, splitter.finish(), &mut refs, &mut totals).await?;

    let (nar_hash, nar_size) = hasher.finalize();
    let manifest = ObjectManifest::new(nar_hash, nar_size, refs)?;
    crate::metrics::BYTES_INGESTED.inc_by(nar_size);

    Ok(IngestedObject {
        manifest,
        new_chunks: totals.new_chunks,
        new_bytes: totals.new_bytes,
    })
}

#[derive(Default)]
struct Totals {
    new_chunks: u64,
    new_bytes: u64,
}

async fn store_all(
    store: &ChunkStore,
    ready: Vec<Chunk>,
    refs: &mut Vec<ChunkRef>,
    totals: &mut Totals,
) -> EngineResult<()> {
    if ready.is_empty() {
        return Ok(());
    }
    refs.extend(ready.iter().map(Chunk::to_ref));

    let outcomes: Vec<(PutOutcome, u64)> = futures::stream::iter(ready)
        .map(|chunk| async move {
            let size = chunk.size();
            let outcome = store.put_if_absent(&chunk.hash, chunk.data).await?;
            Ok::<_, crate::EngineError>((outcome, size))
        })
        .buffered(UPLOAD_CONCURRENCY)
        .try_collect()
        .await?;

    for (outcome, size) in outcomes {
        if outcome == PutOutcome::Inserted {
            totals.new_chunks += 1;
            totals.new_bytes += size;
        }
    }
    Ok(())
}
