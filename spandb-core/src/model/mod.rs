//! Trace data model and object encodings
//!
//! Blocks store opaque objects; this module owns the only code that knows
//! what is inside them.

mod decoder;

pub use decoder::{object_decoder, ObjectDecoder, V1Decoder, ALL_ENCODINGS};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A trace: every span recorded for one trace ID
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: Vec<u8>,
    pub batches: Vec<ResourceSpans>,
}

/// Spans emitted by one resource (service instance)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpans {
    pub resource: BTreeMap<String, String>,
    pub spans: Vec<Span>,
}

/// A single span
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: Vec<u8>,
    pub parent_span_id: Vec<u8>,
    pub name: String,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub attributes: BTreeMap<String, String>,
}

impl Trace {
    /// Number of spans across all batches
    pub fn span_count(&self) -> usize {
        self.batches.iter().map(|b| b.spans.len()).sum()
    }

    /// Earliest span start and latest span end, in unix seconds
    pub fn time_range(&self) -> Option<(i64, i64)> {
        let spans = self.batches.iter().flat_map(|b| b.spans.iter());
        let start = spans.clone().map(|s| s.start_time_unix_nano).min()?;
        let end = spans.map(|s| s.end_time_unix_nano).max()?;
        Some(((start / 1_000_000_000) as i64, (end / 1_000_000_000) as i64))
    }
}

/// Put a trace into canonical order: spans by start time within a batch,
/// batches by the start time of their first span
pub fn sort_trace(trace: &mut Trace) {
    for batch in &mut trace.batches {
        batch.spans.sort_by_key(|s| s.start_time_unix_nano);
    }
    trace
        .batches
        .sort_by_key(|b| b.spans.first().map(|s| s.start_time_unix_nano).unwrap_or(0));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: u64) -> Span {
        Span {
            span_id: start.to_be_bytes().to_vec(),
            start_time_unix_nano: start,
            end_time_unix_nano: start + 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_sort_empty_trace() {
        let mut trace = Trace::default();
        sort_trace(&mut trace);
        assert_eq!(trace, Trace::default());
    }

    #[test]
    fn test_sort_batches_by_first_span() {
        let mut trace = Trace {
            id: vec![1],
            batches: vec![
                ResourceSpans { spans: vec![span(2)], ..Default::default() },
                ResourceSpans { spans: vec![span(1)], ..Default::default() },
            ],
        };
        sort_trace(&mut trace);
        assert_eq!(trace.batches[0].spans[0].start_time_unix_nano, 1);
        assert_eq!(trace.batches[1].spans[0].start_time_unix_nano, 2);
    }

    #[test]
    fn test_sort_spans_within_batch() {
        let mut trace = Trace {
            id: vec![1],
            batches: vec![ResourceSpans { spans: vec![span(9), span(3), span(5)], ..Default::default() }],
        };
        sort_trace(&mut trace);
        let starts: Vec<u64> = trace.batches[0].spans.iter().map(|s| s.start_time_unix_nano).collect();
        assert_eq!(starts, vec![3, 5, 9]);
    }

    #[test]
    fn test_time_range() {
        let trace = Trace {
            id: vec![1],
            batches: vec![ResourceSpans {
                spans: vec![span(5_000_000_000), span(2_000_000_000)],
                ..Default::default()
            }],
        };
        assert_eq!(trace.time_range(), Some((2, 5)));
        assert_eq!(Trace::default().time_range(), None);
    }
}
