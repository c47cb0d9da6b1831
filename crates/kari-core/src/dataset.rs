//! # Datasets
//!
//! Pre-indexed, post-padded training sequences for one tagging task, and
//! index views over them used to slice folds and build mini-batches without
//! copying the sequences.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{KariError, Result};

/// Token index reserved for padding.
pub const PAD_INDEX: u32 = 0;

/// One tagging task: vocabulary, tag set and aligned token/tag sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Display name used in logs and checkpoint file names.
    #[serde(default)]
    pub name: String,
    pub word_type_to_idx: HashMap<String, u32>,
    pub tag_type_count: usize,
    pub tag_type_to_idx: HashMap<String, u32>,
    pub train_word_idx_sequence: Vec<Vec<u32>>,
    pub train_tag_idx_sequence: Vec<Vec<u32>>,
}

impl Dataset {
    /// Builds and validates a dataset.
    pub fn new(
        name: impl Into<String>,
        word_type_to_idx: HashMap<String, u32>,
        tag_type_to_idx: HashMap<String, u32>,
        train_word_idx_sequence: Vec<Vec<u32>>,
        train_tag_idx_sequence: Vec<Vec<u32>>,
    ) -> Result<Self> {
        let dataset = Self {
            name: name.into(),
            word_type_to_idx,
            tag_type_count: tag_type_to_idx.len(),
            tag_type_to_idx,
            train_word_idx_sequence,
            train_tag_idx_sequence,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    fn invalid(&self, reason: impl Into<String>) -> KariError {
        KariError::InvalidDataset {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Checks alignment, fixed length, post-padding and index ranges.
    pub fn validate(&self) -> Result<()> {
        if self.train_word_idx_sequence.len() != self.train_tag_idx_sequence.len() {
            return Err(self.invalid(format!(
                "{} token sequences but {} tag sequences",
                self.train_word_idx_sequence.len(),
                self.train_tag_idx_sequence.len()
            )));
        }
        if self.tag_type_count == 0 {
            return Err(self.invalid("tag set is empty"));
        }

        let seq_len = self.max_seq_len().unwrap_or(0);
        let vocab = self.word_type_to_idx.len() as u32;
        for (i, (words, tags)) in self
            .train_word_idx_sequence
            .iter()
            .zip(&self.train_tag_idx_sequence)
            .enumerate()
        {
            if words.len() != seq_len || tags.len() != seq_len {
                return Err(self.invalid(format!(
                    "sequence {i} has length {}/{}, expected {seq_len}",
                    words.len(),
                    tags.len()
                )));
            }
            let length = sequence_length(words);
            if words[length..].iter().any(|&w| w != PAD_INDEX) {
                return Err(self.invalid(format!("sequence {i} is not post-padded")));
            }
            if let Some(&w) = words.iter().find(|&&w| w > vocab) {
                return Err(self.invalid(format!(
                    "sequence {i} has token index {w} outside the vocabulary"
                )));
            }
            if let Some(&t) = tags.iter().find(|&&t| t as usize >= self.tag_type_count) {
                return Err(self.invalid(format!(
                    "sequence {i} has tag index {t} outside the tag set"
                )));
            }
        }
        Ok(())
    }

    /// Number of training examples.
    pub fn len(&self) -> usize {
        self.train_word_idx_sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train_word_idx_sequence.is_empty()
    }

    /// Fixed sequence length shared by every example, if there is any example.
    pub fn max_seq_len(&self) -> Option<usize> {
        self.train_word_idx_sequence.first().map(Vec::len)
    }

    /// Tag names indexed by tag index.
    pub fn idx_to_tag(&self) -> Vec<String> {
        invert_tag_map(&self.tag_type_to_idx, self.tag_type_count)
    }

    /// A view over the examples at `indices`.
    pub fn view<'a>(&'a self, indices: &'a [usize]) -> SequenceView<'a> {
        SequenceView {
            dataset: self,
            indices,
        }
    }
}

/// Inverts a tag-to-index mapping; unmapped indices get a `<i>` placeholder.
pub fn invert_tag_map(tag_type_to_idx: &HashMap<String, u32>, count: usize) -> Vec<String> {
    let mut idx_to_tag: Vec<String> = (0..count).map(|i| format!("<{i}>")).collect();
    for (tag, &idx) in tag_type_to_idx {
        if let Some(slot) = idx_to_tag.get_mut(idx as usize) {
            *slot = tag.clone();
        }
    }
    idx_to_tag
}

/// Number of non-padding tokens at the head of a post-padded sequence.
pub fn sequence_length(words: &[u32]) -> usize {
    words.iter().position(|&w| w == PAD_INDEX).unwrap_or(words.len())
}

/// Post-pads (or truncates) ragged sequences to `max_seq_len`.
pub fn pad_sequences(sequences: &[Vec<u32>], max_seq_len: usize, value: u32) -> Vec<Vec<u32>> {
    sequences
        .iter()
        .map(|seq| {
            let mut padded: Vec<u32> = seq.iter().copied().take(max_seq_len).collect();
            padded.resize(max_seq_len, value);
            padded
        })
        .collect()
}

/// Index view over a dataset, e.g. one fold's train or validation slice.
#[derive(Debug, Clone, Copy)]
pub struct SequenceView<'a> {
    dataset: &'a Dataset,
    indices: &'a [usize],
}

impl<'a> SequenceView<'a> {
    pub fn dataset(&self) -> &'a Dataset {
        self.dataset
    }

    pub fn indices(&self) -> &'a [usize] {
        self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Builds the batch made of the view positions `positions`.
    pub fn batch(&self, positions: &[usize], device: &Device) -> Result<Batch> {
        let rows: Vec<usize> = positions.iter().map(|&p| self.indices[p]).collect();
        Batch::from_rows(self.dataset, &rows, device)
    }

    /// Consecutive batches of at most `batch_size` examples over `order`.
    pub fn batches<'b>(
        &'b self,
        order: &'b [usize],
        batch_size: usize,
        device: &'b Device,
    ) -> impl Iterator<Item = Result<Batch>> + 'b {
        order
            .chunks(batch_size.max(1))
            .map(move |chunk| self.batch(chunk, device))
    }
}

/// Tensors for one mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, seq_len)` token indices, `u32`.
    pub tokens: Tensor,
    /// `(batch, seq_len)` gold tag indices, `u32`.
    pub tags: Tensor,
    /// `(batch, seq_len)` 1.0 for real tokens, 0.0 for padding, `f32`.
    pub mask: Tensor,
    /// Row-major copy of the gold tags.
    pub tag_ids: Vec<u32>,
    /// Non-padding length of every row (at least 1).
    pub lengths: Vec<usize>,
    pub seq_len: usize,
}

impl Batch {
    /// Gathers the dataset rows `rows` into tensors.
    pub fn from_rows(dataset: &Dataset, rows: &[usize], device: &Device) -> Result<Self> {
        let seq_len = dataset.max_seq_len().unwrap_or(0);
        let batch = rows.len();
        let mut tokens = Vec::with_capacity(batch * seq_len);
        let mut tag_ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        let mut lengths = Vec::with_capacity(batch);

        for &row in rows {
            let words = &dataset.train_word_idx_sequence[row];
            let tags = &dataset.train_tag_idx_sequence[row];
            // the first position always counts so every row has a CRF path
            let length = sequence_length(words).max(1);
            tokens.extend_from_slice(words);
            tag_ids.extend_from_slice(tags);
            mask.extend((0..seq_len).map(|t| if t < length { 1f32 } else { 0f32 }));
            lengths.push(length);
        }

        Ok(Self {
            tokens: Tensor::from_vec(tokens, (batch, seq_len), device)?,
            tags: Tensor::from_vec(tag_ids.clone(), (batch, seq_len), device)?,
            mask: Tensor::from_vec(mask, (batch, seq_len), device)?,
            tag_ids,
            lengths,
            seq_len,
        })
    }

    pub fn size(&self) -> usize {
        self.lengths.len()
    }

    /// Gold tags of row `row`, truncated to its length.
    pub fn gold_path(&self, row: usize) -> &[u32] {
        let start = row * self.seq_len;
        &self.tag_ids[start..start + self.lengths[row]]
    }
}
