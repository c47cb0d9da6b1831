//! # Chunk-level tagging metrics
//!
//! Entity chunks are extracted from BIO tag sequences and compared exactly:
//! a predicted chunk counts as correct only when its type and span both
//! match a gold chunk.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::tags::BioTag;

/// A typed span `[start, end)` of one sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Chunk {
    pub kind: String,
    pub start: usize,
    pub end: usize,
}

/// Extracts the entity chunks of one tag sequence.
///
/// `I-X` continues an open `X` chunk and otherwise opens a new one.
/// Repeated unprefixed labels merge into one chunk.
pub fn chunks<S: AsRef<str>>(tags: &[S]) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut open: Option<(BioTag<'_>, usize)> = None;

    for (pos, tag) in tags.iter().enumerate() {
        let tag = BioTag::parse(tag.as_ref());
        let continues = match open {
            _ if tag.is_begin() => false,
            Some((prev, _)) if tag.is_inside() => prev.entity() == tag.entity(),
            Some((BioTag::Single(prev), _)) => tag == BioTag::Single(prev),
            _ => false,
        };
        if continues {
            continue;
        }

        if let Some(chunk) = open.take().and_then(|(prev, start)| close(prev, start, pos)) {
            out.push(chunk);
        }
        if tag != BioTag::Outside {
            open = Some((tag, pos));
        }
    }

    out.extend(open.and_then(|(prev, start)| close(prev, start, tags.len())));
    out
}

fn close(tag: BioTag<'_>, start: usize, end: usize) -> Option<Chunk> {
    tag.entity().map(|kind| Chunk {
        kind: kind.to_string(),
        start,
        end,
    })
}

/// Precision, recall and F1 with the counts they derive from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Prf {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of gold chunks.
    pub support: usize,
}

impl Prf {
    fn from_counts(correct: usize, predicted: usize, gold: usize) -> Self {
        let precision = ratio(correct, predicted);
        let recall = ratio(correct, gold);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1,
            support: gold,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Per-entity-type and averaged chunk scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaggingReport {
    pub per_type: BTreeMap<String, Prf>,
    pub micro: Prf,
    pub macro_avg: Prf,
    /// Fraction of positions whose tag matches.
    pub token_accuracy: f64,
}

#[derive(Default)]
struct Counts {
    correct: usize,
    predicted: usize,
    gold: usize,
}

/// Scores predicted tag sequences against gold ones, sequence by sequence.
///
/// Pairs are compared up to the shorter length; padding is expected to be
/// stripped already.
pub fn evaluate<S: AsRef<str>>(gold: &[Vec<S>], predicted: &[Vec<S>]) -> TaggingReport {
    let mut counts: BTreeMap<String, Counts> = BTreeMap::new();
    let mut matching = 0usize;
    let mut positions = 0usize;

    for (gold_seq, pred_seq) in gold.iter().zip(predicted) {
        let len = gold_seq.len().min(pred_seq.len());
        let (gold_seq, pred_seq) = (&gold_seq[..len], &pred_seq[..len]);
        matching += gold_seq
            .iter()
            .zip(pred_seq)
            .filter(|(g, p)| g.as_ref() == p.as_ref())
            .count();
        positions += len;

        let gold_chunks = chunks(gold_seq);
        let pred_chunks = chunks(pred_seq);
        let gold_set: HashSet<&Chunk> = gold_chunks.iter().collect();

        for chunk in &gold_chunks {
            counts.entry(chunk.kind.clone()).or_default().gold += 1;
        }
        for chunk in &pred_chunks {
            let entry = counts.entry(chunk.kind.clone()).or_default();
            entry.predicted += 1;
            if gold_set.contains(chunk) {
                entry.correct += 1;
            }
        }
    }

    let per_type: BTreeMap<String, Prf> = counts
        .iter()
        .map(|(kind, c)| (kind.clone(), Prf::from_counts(c.correct, c.predicted, c.gold)))
        .collect();

    let micro = Prf::from_counts(
        counts.values().map(|c| c.correct).sum(),
        counts.values().map(|c| c.predicted).sum(),
        counts.values().map(|c| c.gold).sum(),
    );

    let n = per_type.len().max(1) as f64;
    let macro_avg = Prf {
        precision: per_type.values().map(|p| p.precision).sum::<f64>() / n,
        recall: per_type.values().map(|p| p.recall).sum::<f64>() / n,
        f1: per_type.values().map(|p| p.f1).sum::<f64>() / n,
        support: micro.support,
    };

    TaggingReport {
        per_type,
        micro,
        macro_avg,
        token_accuracy: ratio(matching, positions),
    }
}

impl fmt::Display for TaggingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<12} {:>9} {:>9} {:>9} {:>9}",
            "type", "precision", "recall", "f1", "support"
        )?;
        let rows = self
            .per_type
            .iter()
            .map(|(k, p)| (k.as_str(), p))
            .chain([("micro", &self.micro), ("macro", &self.macro_avg)]);
        for (kind, p) in rows {
            writeln!(
                f,
                "{:<12} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                kind, p.precision, p.recall, p.f1, p.support
            )?;
        }
        write!(f, "token accuracy {:.4}", self.token_accuracy)
    }
}
