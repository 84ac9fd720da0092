//! Batch metadata exchanged before KV tensors.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::cache::block::TokenId;
use crate::transfer::TransportError;

/// Half-open `(start, end)` index range.
pub type IndexRange = (usize, usize);

/// Describes a batch of requests; entry `i` of every array belongs to request `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBatchMetadata")]
pub struct RequestBatchMetadata {
    token_ids: Vec<Vec<TokenId>>,
    layer_range: Vec<IndexRange>,
    head_range: Vec<IndexRange>,
    token_range: Vec<IndexRange>,
}

#[derive(Deserialize)]
struct RawBatchMetadata {
    token_ids: Vec<Vec<TokenId>>,
    layer_range: Vec<IndexRange>,
    head_range: Vec<IndexRange>,
    token_range: Vec<IndexRange>,
}

impl TryFrom<RawBatchMetadata> for RequestBatchMetadata {
    type Error = TransportError;

    fn try_from(raw: RawBatchMetadata) -> Result<Self, Self::Error> {
        Self::new(raw.token_ids, raw.layer_range, raw.head_range, raw.token_range)
    }
}

impl RequestBatchMetadata {
    /// Build metadata, checking that the arrays are index-aligned and every
    /// range is ordered.
    pub fn new(
        token_ids: Vec<Vec<TokenId>>,
        layer_range: Vec<IndexRange>,
        head_range: Vec<IndexRange>,
        token_range: Vec<IndexRange>,
    ) -> Result<Self, TransportError> {
        let n = token_ids.len();
        if layer_range.len() != n || head_range.len() != n || token_range.len() != n {
            return Err(TransportError::InvalidArgument(format!(
                "metadata arrays are not aligned: token_ids={n}, layer_range={}, head_range={}, token_range={}",
                layer_range.len(),
                head_range.len(),
                token_range.len()
            )));
        }

        for (name, ranges) in [
            ("layer_range", &layer_range),
            ("head_range", &head_range),
            ("token_range", &token_range),
        ] {
            if let Some((i, (start, end))) = ranges.iter().enumerate().find(|(_, r)| r.0 > r.1) {
                return Err(TransportError::InvalidArgument(format!(
                    "{name}[{i}] = ({start}, {end}) is reversed"
                )));
            }
        }

        Ok(Self {
            token_ids,
            layer_range,
            head_range,
            token_range,
        })
    }

    /// Metadata with no requests.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn token_ids(&self) -> &[Vec<TokenId>] {
        &self.token_ids
    }

    pub fn layer_range(&self) -> &[IndexRange] {
        &self.layer_range
    }

    pub fn head_range(&self) -> &[IndexRange] {
        &self.head_range
    }

    pub fn token_range(&self) -> &[IndexRange] {
        &self.token_range
    }

    /// View of request `i`.
    pub fn request(&self, i: usize) -> Option<RequestMeta<'_>> {
        Some(RequestMeta {
            token_ids: self.token_ids.get(i)?,
            layers: to_range(self.layer_range[i]),
            heads: to_range(self.head_range[i]),
            tokens: to_range(self.token_range[i]),
        })
    }

    pub fn requests(&self) -> impl Iterator<Item = RequestMeta<'_>> + '_ {
        (0..self.len()).filter_map(move |i| self.request(i))
    }
}

fn to_range((start, end): IndexRange) -> Range<usize> {
    start..end
}

/// One request of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta<'a> {
    pub token_ids: &'a [TokenId],
    pub layers: Range<usize>,
    pub heads: Range<usize>,
    pub tokens: Range<usize>,
}

impl RequestMeta<'_> {
    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }
}

/// Object messages of the sync protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "meta", rename_all = "snake_case")]
pub enum MetadataMessage {
    /// Readiness signal soliciting the next batch.
    Probe,
    /// A batch of requests.
    Batch(RequestBatchMetadata),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RequestBatchMetadata {
        RequestBatchMetadata::new(
            vec![vec![1, 2, 3], vec![4]],
            vec![(0, 2), (1, 2)],
            vec![(0, 4), (2, 4)],
            vec![(0, 3), (0, 1)],
        )
        .unwrap()
    }

    #[test]
    fn test_misaligned_rejected() {
        let result = RequestBatchMetadata::new(vec![vec![1]], vec![], vec![(0, 1)], vec![(0, 1)]);
        assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
    }

    #[test]
    fn test_reversed_range_rejected() {
        let result =
            RequestBatchMetadata::new(vec![vec![1]], vec![(2, 1)], vec![(0, 1)], vec![(0, 1)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_request_view() {
        let meta = sample();
        let req = meta.request(1).unwrap();
        assert_eq!(req.token_ids, &[4]);
        assert_eq!(req.layers, 1..2);
        assert_eq!(req.num_heads(), 2);
        assert!(meta.request(2).is_none());
        assert_eq!(meta.requests().count(), 2);
    }

    #[test]
    fn test_deserialization_validates() {
        let json = r#"{"token_ids":[[1]],"layer_range":[],"head_range":[],"token_range":[]}"#;
        assert!(serde_json::from_str::<RequestBatchMetadata>(json).is_err());

        let json = serde_json::to_string(&sample()).unwrap();
        let back: RequestBatchMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_message_encoding() {
        let probe = serde_json::to_string(&MetadataMessage::Probe).unwrap();
        assert_eq!(probe, r#"{"kind":"probe"}"#);

        let batch = MetadataMessage::Batch(RequestBatchMetadata::empty());
        let json = serde_json::to_string(&batch).unwrap();
        assert_eq!(serde_json::from_str::<MetadataMessage>(&json).unwrap(), batch);
    }
}
