//! Detection of the `---` delimited header at the start of a page file.
//!
//! Only the beginning of a file is read: a head chunk first, then further
//! chunks until the closing delimiter turns up. Files that do not start with
//! a `---` line are rejected after the first read.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the first read. Covers the header of most pages.
pub const HEAD_CHUNK: usize = 512;
/// Size of each additional read while looking for the closing delimiter.
pub const CHUNK: usize = 4096;
/// `---\n---\n`
const MIN_HEADER: usize = 8;
const OPENING: &[u8] = b"---\n";

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header is never closed (no `---` line in the first {size} bytes)")]
    Malformed { size: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Text between the delimiters.
    pub front_matter: String,
    /// Byte offset where the page body starts.
    pub content_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ScanningForStart,
    ScanningForEnd,
    Found { start: usize, end: usize },
    NoHeader,
    Malformed,
}

/// Read the header of a page, if it has one.
///
/// Returns `Ok(None)` when the file has no header, including a small file
/// whose header is never closed. An unclosed header in a file larger than
/// [`HEAD_CHUNK`] is an error.
pub async fn read_header<R>(reader: &mut R) -> Result<Option<Header>, HeaderError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(HEAD_CHUNK);
    let mut eof = fill(reader, &mut buf, HEAD_CHUNK).await?;
    let mut resume = 0;
    let mut state = State::ScanningForStart;

    loop {
        state = match state {
            State::ScanningForStart => {
                if buf.len() < MIN_HEADER || !buf.starts_with(OPENING) {
                    State::NoHeader
                } else {
                    resume = OPENING.len() - 1;
                    State::ScanningForEnd
                }
            }
            State::ScanningForEnd => match find_terminator(&buf, resume) {
                Ok((start, end)) => State::Found { start, end },
                Err(_) if eof && buf.len() > HEAD_CHUNK => State::Malformed,
                Err(_) if eof => State::NoHeader,
                Err(line_start) => {
                    resume = line_start;
                    eof = fill(reader, &mut buf, CHUNK).await?;
                    State::ScanningForEnd
                }
            },
            State::Found { start, end } => {
                let text = buf.get(OPENING.len()..start).unwrap_or_default();
                return Ok(Some(Header {
                    front_matter: String::from_utf8_lossy(text).into_owned(),
                    content_offset: end as u64,
                }));
            }
            State::NoHeader => return Ok(None),
            State::Malformed => return Err(HeaderError::Malformed { size: buf.len() }),
        };
    }
}

/// Append up to `n` bytes to `buf`. Returns true at end of input.
async fn fill<R>(reader: &mut R, buf: &mut Vec<u8>, n: usize) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let start = buf.len();
    buf.resize(start + n, 0);
    let mut filled = start;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    let eof = filled < buf.len();
    buf.truncate(filled);
    Ok(eof)
}

/// Find `\n-{3,}\n` at or after `from`, returning the offset of its leading
/// newline and the offset just past it.
///
/// When there is no complete terminator, returns the offset of the last
/// newline seen, where a terminator cut off by the end of `buf` would begin.
fn find_terminator(buf: &[u8], from: usize) -> Result<(usize, usize), usize> {
    let mut last_line = from;
    for (i, &b) in buf.iter().enumerate().skip(from) {
        if b != b'\n' {
            continue;
        }
        last_line = i;
        let dashes = buf[i + 1..].iter().take_while(|&&c| c == b'-').count();
        if dashes >= 3 && buf.get(i + 1 + dashes) == Some(&b'\n') {
            return Ok((i, i + dashes + 2));
        }
    }
    Err(last_line)
}
