use std::cmp::Ordering;

use tracing::warn;

use crate::error::IncomparableHashError;
use crate::fingerprint::GroupKey;
use crate::hashing::{HashKind, PerceptualHashes};
use crate::store::{FingerprintRecord, FingerprintStore};

/// Matches at or above this percentage are reported.
pub const DEFAULT_THRESHOLD: f64 = 90.0;
/// Above this a match is almost certainly the same image.
pub const LIKELY_SAME_THRESHOLD: f64 = 95.0;

/// Per-algorithm and combined similarity, each in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub average: f64,
    pub perceptual: f64,
    pub difference: f64,
    pub combined: f64,
}

impl Similarity {
    /// Fails when any pair of tokens differs in bit length.
    pub fn between(
        query: &PerceptualHashes,
        stored: &PerceptualHashes,
    ) -> Result<Self, IncomparableHashError> {
        let score = |kind: HashKind| -> Result<f64, IncomparableHashError> {
            let (q, s) = (query.get(kind), stored.get(kind));
            let distance = q.distance(s, kind)?;
            Ok((1.0 - f64::from(distance) / q.bit_len() as f64) * 100.0)
        };

        let average = score(HashKind::Average)?;
        let perceptual = score(HashKind::Perceptual)?;
        let difference = score(HashKind::Difference)?;

        Ok(Self {
            average,
            perceptual,
            difference,
            combined: (average + perceptual + difference) / 3.0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SimilarMatch<'a> {
    pub group_key: &'a GroupKey,
    pub record: &'a FingerprintRecord,
    pub similarity: Similarity,
}

impl SimilarMatch<'_> {
    pub fn is_likely_same(&self) -> bool {
        self.similarity.combined > LIKELY_SAME_THRESHOLD
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityReport<'a> {
    /// Best match first.
    pub matches: Vec<SimilarMatch<'a>>,
    /// Records that could not be compared with the query.
    pub skipped: Vec<(&'a GroupKey, IncomparableHashError)>,
}

impl<'a> SimilarityReport<'a> {
    pub fn best(&self) -> Option<&SimilarMatch<'a>> {
        self.matches.first()
    }
}

/// Linear scan of `store` for records at least `threshold` percent similar
/// to `query`.
///
/// Ordered by similarity (highest first), then by first sighting (oldest
/// first), then by group key.
pub fn find_similar<'a>(
    query: &PerceptualHashes,
    store: &'a FingerprintStore,
    threshold: f64,
) -> SimilarityReport<'a> {
    let mut report = SimilarityReport::default();

    for (key, record) in store.all() {
        let similarity = record
            .fingerprint
            .hash_set()
            .and_then(|stored| Similarity::between(query, &stored));

        match similarity {
            Ok(similarity) if similarity.combined >= threshold => {
                report.matches.push(SimilarMatch {
                    group_key: key,
                    record,
                    similarity,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Skipping {}: {}", key, e);
                report.skipped.push((key, e));
            }
        }
    }

    report.matches.sort_by(rank);
    report
}

fn rank(a: &SimilarMatch<'_>, b: &SimilarMatch<'_>) -> Ordering {
    b.similarity
        .combined
        .total_cmp(&a.similarity.combined)
        .then_with(|| a.record.first_seen.cmp(&b.record.first_seen))
        .then_with(|| a.group_key.cmp(b.group_key))
}
