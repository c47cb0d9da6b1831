use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

use crate::crf::viterbi::ViterbiDecoder;
use crate::dataset::Batch;

/// Linear-chain CRF output layer: a dense emission projection plus learned
/// tag transitions and start/end boundary scores.
pub struct CrfLayer {
    pub emission: Linear,
    /// `[num_tags, num_tags]`, indexed `[prev, curr]`.
    pub transitions: Tensor,
    pub start: Tensor,
    pub end: Tensor,
    num_tags: usize,
}

impl CrfLayer {
    pub fn new(in_dim: usize, num_tags: usize, vb: VarBuilder) -> Result<Self> {
        let emission = candle_nn::linear(in_dim, num_tags, vb.pp("emission"))?;
        let transitions = vb.get_with_hints(
            (num_tags, num_tags),
            "transitions",
            Init::Uniform { lo: -0.1, up: 0.1 },
        )?;
        let start = vb.get_with_hints(num_tags, "start", Init::Const(0.0))?;
        let end = vb.get_with_hints(num_tags, "end", Init::Const(0.0))?;

        Ok(Self {
            emission,
            transitions,
            start,
            end,
            num_tags,
        })
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// Emission scores `[batch, seq_len, num_tags]` for encoder features `[batch, seq_len, dim]`.
    pub fn emissions(&self, features: &Tensor) -> Result<Tensor> {
        self.emission.forward(features)
    }

    /// Mean negative log-likelihood of the gold tags in `batch`.
    pub fn neg_log_likelihood(&self, emissions: &Tensor, batch: &Batch) -> Result<Tensor> {
        let log_z = self.log_partition(emissions, &batch.mask)?;
        let gold = self.gold_score(emissions, batch)?;
        (log_z - gold)?.mean_all()
    }

    /// Forward algorithm: log of the summed exponentiated scores of every path, `[batch]`.
    pub fn log_partition(&self, emissions: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (_, seq_len, _) = emissions.dims3()?;
        let transitions = self.transitions.unsqueeze(0)?;

        let mut alpha = emissions
            .i((.., 0, ..))?
            .broadcast_add(&self.start.unsqueeze(0)?)?;
        for t in 1..seq_len {
            let emit = emissions.i((.., t, ..))?.unsqueeze(1)?;
            let scores = alpha
                .unsqueeze(2)?
                .broadcast_add(&transitions)?
                .broadcast_add(&emit)?;
            let next = log_sum_exp(&scores, 1)?;
            let m = mask.i((.., t))?.unsqueeze(1)?;
            alpha = blend(&next, &alpha, &m)?;
        }

        log_sum_exp(&alpha.broadcast_add(&self.end.unsqueeze(0)?)?, 1)
    }

    /// Unnormalised score of the gold path of every row, `[batch]`.
    pub fn gold_score(&self, emissions: &Tensor, batch: &Batch) -> Result<Tensor> {
        let (batch_size, seq_len, _) = emissions.dims3()?;
        let device = emissions.device();

        let emitted = emissions
            .gather(&batch.tags.unsqueeze(2)?.contiguous()?, 2)?
            .squeeze(2)?;
        let mut score = (emitted * &batch.mask)?.sum(1)?;

        if seq_len > 1 {
            let n = self.num_tags as u32;
            let mut pairs = Vec::with_capacity(batch_size * (seq_len - 1));
            for row in batch.tag_ids.chunks(seq_len) {
                pairs.extend(row.windows(2).map(|w| w[0] * n + w[1]));
            }
            let pairs = Tensor::from_vec(pairs, batch_size * (seq_len - 1), device)?;
            let transitioned = self
                .transitions
                .flatten_all()?
                .index_select(&pairs, 0)?
                .reshape((batch_size, seq_len - 1))?;
            let tail_mask = batch.mask.narrow(1, 1, seq_len - 1)?;
            score = (score + (transitioned * tail_mask)?.sum(1)?)?;
        }

        let first: Vec<u32> = (0..batch_size).map(|r| batch.tag_ids[r * seq_len]).collect();
        let last: Vec<u32> = (0..batch_size)
            .map(|r| batch.tag_ids[r * seq_len + batch.lengths[r] - 1])
            .collect();
        let first = Tensor::from_vec(first, batch_size, device)?;
        let last = Tensor::from_vec(last, batch_size, device)?;

        score = (score + self.start.index_select(&first, 0)?)?;
        score + self.end.index_select(&last, 0)?
    }

    /// Viterbi paths of every row, each truncated to the row length.
    pub fn decode(&self, emissions: &Tensor, lengths: &[usize]) -> crate::Result<Vec<Vec<u32>>> {
        let emissions: Vec<Vec<Vec<f32>>> = emissions.to_vec3()?;
        let transitions: Vec<Vec<f32>> = self.transitions.to_vec2()?;
        let start: Vec<f32> = self.start.to_vec1()?;
        let end: Vec<f32> = self.end.to_vec1()?;
        let decoder = ViterbiDecoder::new(self.num_tags);

        emissions
            .iter()
            .zip(lengths)
            .map(|(row, &len)| {
                let path = decoder.decode(&row[..len], &transitions, &start, &end)?;
                Ok(path.into_iter().map(|t| t as u32).collect())
            })
            .collect()
    }

    /// Viterbi accuracy over the non-padding positions of `batch`.
    pub fn accuracy(&self, emissions: &Tensor, batch: &Batch) -> crate::Result<f32> {
        let paths = self.decode(emissions, &batch.lengths)?;
        let mut correct = 0usize;
        let mut total = 0usize;
        for (row, path) in paths.iter().enumerate() {
            let gold = batch.gold_path(row);
            correct += path.iter().zip(gold).filter(|(p, g)| p == g).count();
            total += gold.len();
        }
        Ok(if total > 0 {
            correct as f32 / total as f32
        } else {
            0.0
        })
    }
}

/// Numerically stable `log(sum(exp(xs)))` over `dim`, removing `dim`.
pub fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let summed = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    (summed + max)?.squeeze(dim)
}

/// `mask * new + (1 - mask) * old`, with `mask` broadcast over the last dimension.
pub fn blend(new: &Tensor, old: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let keep = mask.affine(-1.0, 1.0)?;
    new.broadcast_mul(mask)? + old.broadcast_mul(&keep)?
}
