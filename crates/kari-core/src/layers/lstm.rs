//! # Bidirectional LSTM
//!
//! Keras-style LSTM with recurrent dropout and padding masks. A masked time
//! step leaves the hidden and cell state untouched, so the backward
//! direction starts from a zero state at the last real token of a
//! post-padded sequence.

use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use crate::crf::model::blend;

/// LSTM cell - processes one timestep at a time.
///
/// Gates are packed in the order input, forget, cell, output:
/// - `c_next = f * c + i * g`
/// - `h_next = o * tanh(c_next)`
pub struct LstmCell {
    /// `x -> 4 * hidden`, with bias.
    input: Linear,
    /// `h -> 4 * hidden`, no bias.
    recurrent: Linear,
    hidden_size: usize,
}

impl LstmCell {
    pub fn new(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let input = candle_nn::linear(input_size, 4 * hidden_size, vb.pp("input"))?;
        let recurrent = candle_nn::linear_no_bias(hidden_size, 4 * hidden_size, vb.pp("recurrent"))?;
        Ok(Self {
            input,
            recurrent,
            hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// One step on `x: [batch, input]` with state `h, c: [batch, hidden]`.
    pub fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = self.input.forward(x)?.add(&self.recurrent.forward(h)?)?;
        let gates = gates.chunk(4, 1)?;

        let i = candle_nn::ops::sigmoid(&gates[0])?;
        let f = candle_nn::ops::sigmoid(&gates[1])?;
        let g = gates[2].tanh()?;
        let o = candle_nn::ops::sigmoid(&gates[3])?;

        let c_next = f.mul(c)?.add(&i.mul(&g)?)?;
        let h_next = o.mul(&c_next.tanh()?)?;
        Ok((h_next, c_next))
    }
}

/// Two LSTM cells reading the sequence in opposite directions, outputs concatenated.
pub struct BiLstm {
    forward: LstmCell,
    backward: LstmCell,
    recurrent_dropout: f32,
}

impl BiLstm {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        recurrent_dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            forward: LstmCell::new(input_size, hidden_size, vb.pp("forward"))?,
            backward: LstmCell::new(input_size, hidden_size, vb.pp("backward"))?,
            recurrent_dropout,
        })
    }

    /// Output width: both directions concatenated.
    pub fn output_size(&self) -> usize {
        2 * self.forward.hidden_size()
    }

    /// `xs: [batch, seq_len, input]`, `mask: [batch, seq_len]` → `[batch, seq_len, 2 * hidden]`.
    pub fn forward(&self, xs: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let fwd = self.run(&self.forward, xs, mask, train, false)?;
        let bwd = self.run(&self.backward, xs, mask, train, true)?;
        Tensor::cat(&[fwd, bwd], 2)
    }

    fn run(
        &self,
        cell: &LstmCell,
        xs: &Tensor,
        mask: &Tensor,
        train: bool,
        reverse: bool,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        let mut h = Tensor::zeros((batch, cell.hidden_size()), xs.dtype(), xs.device())?;
        let mut c = h.clone();

        // one recurrent dropout mask per sequence, reused at every step
        let dropout = if train && self.recurrent_dropout > 0.0 {
            let ones = Tensor::ones((batch, cell.hidden_size()), xs.dtype(), xs.device())?;
            Some(candle_nn::ops::dropout(&ones, self.recurrent_dropout)?)
        } else {
            None
        };

        let steps: Vec<usize> = if reverse {
            (0..seq_len).rev().collect()
        } else {
            (0..seq_len).collect()
        };

        let mut outputs = Vec::with_capacity(seq_len);
        for t in steps {
            let x_t = xs.i((.., t, ..))?.contiguous()?;
            let m_t = mask.i((.., t))?.unsqueeze(1)?;
            let h_in = match &dropout {
                Some(keep) => h.mul(keep)?,
                None => h.clone(),
            };
            let (h_next, c_next) = cell.step(&x_t, &h_in, &c)?;
            h = blend(&h_next, &h, &m_t)?;
            c = blend(&c_next, &c, &m_t)?;
            outputs.push(h.clone());
        }

        if reverse {
            outputs.reverse();
        }
        Tensor::stack(&outputs, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn bilstm(dropout: f32) -> (VarMap, BiLstm) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let lstm = BiLstm::new(3, 5, dropout, vb.pp("bilstm")).unwrap();
        (varmap, lstm)
    }

    #[test]
    fn output_shape_concatenates_directions() {
        let (_varmap, lstm) = bilstm(0.0);
        let xs = Tensor::randn(0f32, 1.0, (2, 4, 3), &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let out = lstm.forward(&xs, &mask, false).unwrap();
        assert_eq!(out.dims(), &[2, 4, 10]);
        assert_eq!(lstm.output_size(), 10);
    }

    #[test]
    fn padding_does_not_change_real_positions() {
        let (_varmap, lstm) = bilstm(0.0);
        let device = Device::Cpu;
        let short = Tensor::randn(0f32, 1.0, (1, 2, 3), &device).unwrap();
        let noise = Tensor::randn(0f32, 1.0, (1, 3, 3), &device).unwrap();
        let padded = Tensor::cat(&[&short, &noise], 1).unwrap();

        let full_mask = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        let pad_mask = Tensor::new(&[[1f32, 1.0, 0.0, 0.0, 0.0]], &device).unwrap();

        let expected: Vec<Vec<Vec<f32>>> = lstm
            .forward(&short, &full_mask, false)
            .unwrap()
            .to_vec3()
            .unwrap();
        let actual: Vec<Vec<Vec<f32>>> = lstm
            .forward(&padded, &pad_mask, false)
            .unwrap()
            .narrow(1, 0, 2)
            .unwrap()
            .to_vec3()
            .unwrap();

        for (e, a) in expected[0].iter().flatten().zip(actual[0].iter().flatten()) {
            assert!((e - a).abs() < 1e-5, "{e} vs {a}");
        }
    }

    #[test]
    fn inference_is_deterministic_with_dropout_configured() {
        let (_varmap, lstm) = bilstm(0.5);
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 3), &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let a: Vec<Vec<Vec<f32>>> = lstm.forward(&xs, &mask, false).unwrap().to_vec3().unwrap();
        let b: Vec<Vec<Vec<f32>>> = lstm.forward(&xs, &mask, false).unwrap().to_vec3().unwrap();
        assert_eq!(a, b);
    }
}
