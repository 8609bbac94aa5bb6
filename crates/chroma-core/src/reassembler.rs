//! Merge a session's fragments into one decodable artifact.

use crate::fragment::Fragment;
use crate::media::{MediaCodec, MediaError};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ARTIFACT_FILE: &str = "artifact.mp4";
const NORMALIZED_DIR: &str = "normalized";

#[derive(Error, Debug)]
pub enum ReassemblyError {
    #[error("no usable media: every fragment was missing or failed to transcode")]
    NoUsableMedia,
    #[error("{sequenced} of {total} fragments carry a sequence number; all or none must")]
    MixedOrderingKeys { sequenced: usize, total: usize },
    #[error("sequence number {0} appears more than once")]
    DuplicateSequence(u64),
    #[error("failed to merge {count} fragments: {source}")]
    MergeFailed {
        count: usize,
        #[source]
        source: MediaError,
    },
    #[error("reassembly I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a session's fragments were put in capture order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingKey {
    Sequence,
    StartTime,
}

/// The merged session video.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub ordering: OrderingKey,
    pub fragments_used: usize,
    pub fragments_dropped: usize,
}

/// Sort fragments into capture order.
///
/// Sequence numbers win when present; they must then be present on every
/// fragment and unique. Without them, start time decides and arrival breaks
/// ties.
pub fn order_fragments(
    fragments: &[Fragment],
) -> Result<(OrderingKey, Vec<&Fragment>), ReassemblyError> {
    let sequenced = fragments
        .iter()
        .filter(|f| f.meta.sequence.is_some())
        .count();
    let mut ordered: Vec<&Fragment> = fragments.iter().collect();

    if sequenced == 0 {
        ordered.sort_by_key(|f| (f.meta.start_time, f.arrival));
        return Ok((OrderingKey::StartTime, ordered));
    }
    if sequenced != fragments.len() {
        return Err(ReassemblyError::MixedOrderingKeys {
            sequenced,
            total: fragments.len(),
        });
    }

    let mut seen = HashSet::with_capacity(fragments.len());
    for f in fragments {
        let seq = f.meta.sequence.unwrap_or_default();
        if !seen.insert(seq) {
            return Err(ReassemblyError::DuplicateSequence(seq));
        }
    }
    ordered.sort_by_key(|f| f.meta.sequence);
    Ok((OrderingKey::Sequence, ordered))
}

/// One decodable unit: a fragment that starts its own stream plus the
/// headerless continuations that follow it.
struct Stream<'a> {
    parts: Vec<&'a Fragment>,
}

impl Stream<'_> {
    fn head(&self) -> &Fragment {
        self.parts[0]
    }
}

/// Group ordered fragments into streams. A continuation with no open stream
/// of its container in front of it cannot be decoded and is returned apart.
fn group_streams<'a>(ordered: &[&'a Fragment]) -> (Vec<Stream<'a>>, Vec<&'a Fragment>) {
    let mut streams: Vec<Stream<'a>> = Vec::new();
    let mut orphans = Vec::new();
    for &fragment in ordered {
        if !fragment.continuation {
            streams.push(Stream {
                parts: vec![fragment],
            });
            continue;
        }
        match streams.last_mut() {
            Some(open) if open.head().container == fragment.container => {
                open.parts.push(fragment)
            }
            _ => orphans.push(fragment),
        }
    }
    (streams, orphans)
}

/// Bytes of a multi-part stream, joined in order into one file.
fn join_parts(parts: &[&Fragment], out: &Path) -> Result<(), io::Error> {
    let mut joined = fs::File::create(out)?;
    for part in parts {
        io::copy(&mut fs::File::open(&part.path)?, &mut joined)?;
    }
    Ok(())
}

/// Order, normalize and join `fragments` into `{work_dir}/artifact.mp4`.
///
/// Foreign-container streams are transcoded one by one; a stream that fails
/// to transcode is dropped and the rest still merge. Source fragments are
/// never modified.
pub fn reassemble(
    fragments: &[Fragment],
    work_dir: &Path,
    codec: &dyn MediaCodec,
) -> Result<Artifact, ReassemblyError> {
    if fragments.is_empty() {
        return Err(ReassemblyError::NoUsableMedia);
    }
    let (ordering, ordered) = order_fragments(fragments)?;
    let (streams, orphans) = group_streams(&ordered);

    let mut dropped = orphans.len();
    for orphan in &orphans {
        tracing::warn!(
            arrival = orphan.arrival,
            sequence = ?orphan.meta.sequence,
            start_time = orphan.meta.start_time,
            "dropping continuation fragment with no stream header before it"
        );
    }

    let normalized_dir = work_dir.join(NORMALIZED_DIR);
    fs::create_dir_all(&normalized_dir)?;

    let mut usable: Vec<PathBuf> = Vec::with_capacity(streams.len());
    let mut used = 0usize;
    for (pos, stream) in streams.iter().enumerate() {
        let head = stream.head();
        if head.container.is_native() {
            usable.push(head.path.clone());
            used += 1;
            continue;
        }

        let source = if stream.parts.len() == 1 {
            head.path.clone()
        } else {
            let joined = normalized_dir.join(format!("{pos:04}.{}", head.container.extension()));
            join_parts(&stream.parts, &joined)?;
            joined
        };
        let out = normalized_dir.join(format!("{pos:04}.mp4"));
        match codec.transcode(&source, &out) {
            Ok(()) => {
                usable.push(out);
                used += stream.parts.len();
            }
            Err(e) => {
                dropped += stream.parts.len();
                tracing::warn!(
                    arrival = head.arrival,
                    sequence = ?head.meta.sequence,
                    start_time = head.meta.start_time,
                    parts = stream.parts.len(),
                    error = %e,
                    "dropping stream that failed to transcode"
                );
            }
        }
    }

    let artifact = work_dir.join(ARTIFACT_FILE);
    match usable.as_slice() {
        [] => return Err(ReassemblyError::NoUsableMedia),
        [single] => {
            fs::copy(single, &artifact)?;
        }
        many => {
            codec
                .concat(many, &artifact)
                .map_err(|source| ReassemblyError::MergeFailed {
                    count: many.len(),
                    source,
                })?;
        }
    }

    tracing::info!(
        ordering = ?ordering,
        streams = usable.len(),
        used,
        dropped,
        "fragments reassembled"
    );

    Ok(Artifact {
        path: artifact,
        ordering,
        fragments_used: used,
        fragments_dropped: dropped,
    })
}
