//! Object decoders

use super::{sort_trace, ResourceSpans, Trace};
use crate::{Result, SpanError, CURRENT_DATA_ENCODING};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashSet;
use std::sync::Arc;

/// Every object encoding this build understands
pub const ALL_ENCODINGS: &[&str] = &[CURRENT_DATA_ENCODING];

/// Works with the opaque objects stored in blocks
pub trait ObjectDecoder: Send + Sync {
    /// Encoding name recorded in block metas
    fn encoding(&self) -> &'static str;

    /// Encode a trace with its time range in unix seconds
    fn prepare_for_write(&self, trace: &Trace, start: u32, end: u32) -> Result<Vec<u8>>;

    /// Decode an object. Expensive; only used when surfacing results
    fn prepare_for_read(&self, obj: &[u8]) -> Result<Trace>;

    /// Merge several partial objects for the same ID into one
    fn combine(&self, objs: &[&[u8]]) -> Result<Vec<u8>>;

    /// Start and end unix seconds without decoding the body
    fn fast_range(&self, obj: &[u8]) -> Result<(u32, u32)>;
}

/// Look up a decoder by encoding name
pub fn object_decoder(encoding: &str) -> Result<Arc<dyn ObjectDecoder>> {
    match encoding {
        CURRENT_DATA_ENCODING => Ok(Arc::new(V1Decoder)),
        other => Err(SpanError::Validation(format!(
            "unknown encoding {}. Supported encodings {:?}",
            other, ALL_ENCODINGS
        ))),
    }
}

/// `v1` objects
///
/// Format:
/// - 4 bytes: start (unix seconds)
/// - 4 bytes: end (unix seconds)
/// - N bytes: bincode trace
#[derive(Debug, Clone, Copy, Default)]
pub struct V1Decoder;

const HEADER_LEN: usize = 8;

impl ObjectDecoder for V1Decoder {
    fn encoding(&self) -> &'static str {
        CURRENT_DATA_ENCODING
    }

    fn prepare_for_write(&self, trace: &Trace, start: u32, end: u32) -> Result<Vec<u8>> {
        let body = bincode::serialize(trace)?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_u32_le(start);
        buf.put_u32_le(end);
        buf.put_slice(&body);
        Ok(buf.to_vec())
    }

    fn prepare_for_read(&self, obj: &[u8]) -> Result<Trace> {
        if obj.len() < HEADER_LEN {
            return Err(SpanError::InvalidFormat("Object too short".into()));
        }
        Ok(bincode::deserialize(&obj[HEADER_LEN..])?)
    }

    fn combine(&self, objs: &[&[u8]]) -> Result<Vec<u8>> {
        match objs {
            [] => return Err(SpanError::Internal("combine called with no objects".into())),
            [single] => return Ok(single.to_vec()),
            _ => {}
        }

        let mut start = u32::MAX;
        let mut end = 0u32;
        let mut combined = Trace::default();
        let mut seen: HashSet<Vec<u8>> = HashSet::new();

        for obj in objs {
            let (s, e) = self.fast_range(obj)?;
            start = start.min(s);
            end = end.max(e);

            let trace = self.prepare_for_read(obj)?;
            if combined.id.is_empty() {
                combined.id = trace.id;
            }
            for batch in trace.batches {
                let spans: Vec<_> = batch
                    .spans
                    .into_iter()
                    .filter(|s| seen.insert(s.span_id.clone()))
                    .collect();
                if !spans.is_empty() {
                    combined.batches.push(ResourceSpans {
                        resource: batch.resource,
                        spans,
                    });
                }
            }
        }

        sort_trace(&mut combined);
        self.prepare_for_write(&combined, start, end)
    }

    fn fast_range(&self, obj: &[u8]) -> Result<(u32, u32)> {
        if obj.len() < HEADER_LEN {
            return Err(SpanError::InvalidFormat("Object too short".into()));
        }
        let mut header = &obj[..HEADER_LEN];
        Ok((header.get_u32_le(), header.get_u32_le()))
    }
}
