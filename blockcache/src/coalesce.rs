//! Merge batched range requests into the fewest contiguous fetches.
//!
//! [plan] is a pure function: given the requested spans, it returns the merged spans to fetch and,
//! for every request, where its bytes live inside one of those fetches. Requests may be unordered,
//! overlapping, or duplicated. Spans that touch (one ends where the next begins) or overlap are
//! merged; spans separated by a gap are not.

use bytes::Bytes;

/// A contiguous byte range of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub offset: u64,
    pub len: usize,
}

impl Span {
    pub const fn new(offset: u64, len: usize) -> Self {
        Self { offset, len }
    }

    /// The offset one past the last byte of the span.
    pub const fn end(&self) -> u64 {
        self.offset.saturating_add(self.len as u64)
    }
}

/// The location of one request's bytes inside a merged fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Piece {
    /// Index of the request in the input.
    pub request: usize,
    /// Index of the fetch in [Plan::fetches] that covers the request.
    pub fetch: usize,
    /// Offset of the request's first byte within the fetched buffer.
    pub start: usize,
    /// Length of the request.
    pub len: usize,
}

impl Piece {
    /// Cut this piece out of the bytes returned for its fetch. The result is shorter than
    /// [Piece::len] (possibly empty) if the fetch came back short.
    pub fn slice(&self, fetched: &Bytes) -> Bytes {
        let start = self.start.min(fetched.len());
        let end = self.start.saturating_add(self.len).min(fetched.len());
        fetched.slice(start..end)
    }
}

/// The outcome of [plan].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Spans to fetch, sorted by offset and pairwise disjoint and non-adjacent.
    pub fetches: Vec<Span>,
    /// One entry per non-empty request, in request order.
    pub pieces: Vec<Piece>,
}

/// Merge `requests` into the minimal set of contiguous fetches.
pub fn plan(requests: &[Span]) -> Plan {
    let mut order: Vec<usize> = (0..requests.len())
        .filter(|&i| requests[i].len > 0)
        .collect();
    order.sort_by_key(|&i| (requests[i].offset, requests[i].end()));

    let mut fetches: Vec<Span> = Vec::new();
    let mut assigned = vec![None; requests.len()];
    for i in order {
        let request = requests[i];
        match fetches.last_mut() {
            Some(last) if request.offset <= last.end() => {
                let end = last.end().max(request.end());
                last.len = (end - last.offset) as usize;
            }
            _ => fetches.push(request),
        }
        assigned[i] = Some(fetches.len() - 1);
    }

    let pieces = requests
        .iter()
        .zip(assigned)
        .enumerate()
        .filter_map(|(request, (span, fetch))| {
            let fetch = fetch?;
            Some(Piece {
                request,
                fetch,
                start: (span.offset - fetches[fetch].offset) as usize,
                len: span.len,
            })
        })
        .collect();

    Plan { fetches, pieces }
}
