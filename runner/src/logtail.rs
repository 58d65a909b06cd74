//! Incremental reads of a sandbox execution log.

use std::io::SeekFrom;
use std::path::Path;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Upper bound on bytes returned by one call.
pub const MAX_READ: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TailChunk {
    /// Offset to pass to the next call.
    pub pos: u64,
    pub lines: Vec<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tail {
    NoNewContent,
    Chunk(TailChunk),
}

/// Read complete lines from `offset`.
///
/// When the read stops short of the end of the file, the trailing partial
/// line is held back and `pos` points at its start. A single line longer than
/// [`MAX_READ`] is returned in pieces.
pub async fn read_from(path: &Path, offset: u64) -> std::io::Result<Tail> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    if offset >= size {
        return Ok(Tail::NoNewContent);
    }

    let want = (size - offset).min(MAX_READ);
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    (&mut file).take(want).read_to_end(&mut buf).await?;

    let read_to_eof = offset + buf.len() as u64 >= size;
    let mut consumed = buf.len();
    if !read_to_eof && let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') {
        consumed = last_newline + 1;
    }

    let text = String::from_utf8_lossy(buf.get(..consumed).unwrap_or_default());
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect();
    while lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }

    let pos = offset + consumed as u64;
    Ok(Tail::Chunk(TailChunk {
        pos,
        lines,
        has_more: pos < size,
    }))
}
