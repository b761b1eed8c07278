//! Newline-delimited JSON change log decoding.
//!
//! The provider streams one change set object per line and terminates the
//! log with `{"end": true}`. A log that stops before the end marker was
//! truncated in transit and is reported as a request error.

use super::ChangeStream;
use crate::error::{ErrorKind, Result};
use crate::models::{ChangeSet, Checkpoint, Node, RawNode};
use async_stream::try_stream;
use bytes::Bytes;
use exn::{OptionExt, ResultExt};
use futures::{Stream, StreamExt};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RawChangeSet {
    #[serde(default)]
    end: bool,
    #[serde(default)]
    checkpoint: Option<String>,
    #[serde(default)]
    reset: bool,
    #[serde(default)]
    nodes: Vec<RawNode>,
}

/// Incremental line splitter. Chunks may cut lines anywhere.
#[derive(Debug, Default)]
struct Decoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a newline.
    scanned: usize,
    ended: bool,
}

impl Decoder {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ChangeSet>> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);
        let mut decoded = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = memchr::memchr(b'\n', &buffer[from..]) {
            let newline = from + offset;
            decoded.extend(self.decode_line(&buffer[start..newline])?);
            start = newline + 1;
            from = start;
        }
        buffer.drain(..start);
        self.scanned = buffer.len();
        self.buffer = buffer;
        Ok(decoded)
    }

    fn finish(mut self) -> Result<Option<ChangeSet>> {
        let rest = std::mem::take(&mut self.buffer);
        let last = self.decode_line(&rest)?;
        if !self.ended {
            exn::bail!(ErrorKind::Request("change log ended without an end marker".into()));
        }
        Ok(last)
    }

    fn decode_line(&mut self, line: &[u8]) -> Result<Option<ChangeSet>> {
        let line = line.trim_ascii();
        // Anything after the end marker is ignored.
        if line.is_empty() || self.ended {
            return Ok(None);
        }
        let raw: RawChangeSet =
            serde_json::from_slice(line).or_raise(|| ErrorKind::InvalidResponse("undecodable change set".into()))?;
        if raw.end {
            self.ended = true;
            return Ok(None);
        }
        let checkpoint =
            raw.checkpoint.ok_or_raise(|| ErrorKind::InvalidResponse("change set without a checkpoint".into()))?;
        let mut changeset = ChangeSet::new(Checkpoint::new(checkpoint)).with_reset(raw.reset);
        for raw_node in raw.nodes {
            let node = Node::try_from(raw_node)?;
            if node.is_purged() {
                changeset.purged_nodes.push(node.id);
            } else {
                changeset.nodes.push(node);
            }
        }
        Ok(Some(changeset))
    }
}

/// Decode a raw change log body into change sets, lazily.
///
/// The first error (transport, decoding or truncation) is yielded and ends
/// the stream.
pub fn parse_change_log<S>(body: S) -> ChangeStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    Box::pin(try_stream! {
        let mut body = Box::pin(body);
        let mut decoder = Decoder::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for changeset in decoder.feed(&chunk)? {
                yield changeset;
            }
        }
        if let Some(changeset) = decoder.finish()? {
            yield changeset;
        }
    })
}
