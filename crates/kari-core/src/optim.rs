//! # Optimizers
//!
//! The Keras optimizer family on top of candle's `Optimizer` trait. SGD and
//! Adam delegate to candle's `SGD` and `AdamW` (without weight decay); the
//! rest keep their state in `Var`s so that updating it never chains the
//! autodiff graph across steps.

use candle_core::backprop::GradStore;
use candle_core::{Result as CandleResult, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::config::OptimizerKind;
use crate::error::Result;

/// Keras' fuzz factor.
pub const EPSILON: f64 = 1e-7;

fn float_vars(vars: Vec<Var>) -> Vec<Var> {
    vars.into_iter().filter(|v| v.dtype().is_float()).collect()
}

fn zeros_like(var: &Var) -> CandleResult<Var> {
    Var::zeros(var.shape(), var.dtype(), var.device())
}

/// Adamax: Adam with the infinity norm of past gradients.
#[derive(Debug, Clone, Copy)]
pub struct ParamsAdamax {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
}

impl Default for ParamsAdamax {
    fn default() -> Self {
        Self {
            lr: 0.002,
            beta1: 0.9,
            beta2: 0.999,
        }
    }
}

pub struct Adamax {
    vars: Vec<(Var, Var, Var)>,
    step_t: usize,
    params: ParamsAdamax,
}

impl Optimizer for Adamax {
    type Config = ParamsAdamax;

    fn new(vars: Vec<Var>, params: ParamsAdamax) -> CandleResult<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|v| Ok((zeros_like(&v)?, zeros_like(&v)?, v)))
            .collect::<CandleResult<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    fn step(&mut self, grads: &GradStore) -> CandleResult<()> {
        self.step_t += 1;
        let ParamsAdamax { lr, beta1, beta2 } = self.params;
        let lr_t = lr / (1.0 - beta1.powi(self.step_t as i32));
        for (m, u, var) in &self.vars {
            if let Some(g) = grads.get(var) {
                let next_m = m.affine(beta1, 0.0)?.add(&g.affine(1.0 - beta1, 0.0)?)?;
                let next_u = u.affine(beta2, 0.0)?.maximum(&g.abs()?)?;
                let delta = next_m.div(&next_u.affine(1.0, EPSILON)?)?.affine(lr_t, 0.0)?;
                var.set(&var.sub(&delta)?)?;
                m.set(&next_m)?;
                u.set(&next_u)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// Adagrad: per-parameter rates scaled by the accumulated squared gradients.
#[derive(Debug, Clone, Copy)]
pub struct ParamsAdagrad {
    pub lr: f64,
}

impl Default for ParamsAdagrad {
    fn default() -> Self {
        Self { lr: 0.01 }
    }
}

pub struct Adagrad {
    vars: Vec<(Var, Var)>,
    params: ParamsAdagrad,
}

impl Optimizer for Adagrad {
    type Config = ParamsAdagrad;

    fn new(vars: Vec<Var>, params: ParamsAdagrad) -> CandleResult<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|v| Ok((zeros_like(&v)?, v)))
            .collect::<CandleResult<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> CandleResult<()> {
        let lr = self.params.lr;
        for (acc, var) in &self.vars {
            if let Some(g) = grads.get(var) {
                let next_acc = acc.add(&g.sqr()?)?;
                let delta = g
                    .div(&next_acc.sqrt()?.affine(1.0, EPSILON)?)?
                    .affine(lr, 0.0)?;
                var.set(&var.sub(&delta)?)?;
                acc.set(&next_acc)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// Adadelta: step sizes from running averages of squared gradients and updates.
#[derive(Debug, Clone, Copy)]
pub struct ParamsAdadelta {
    pub lr: f64,
    pub rho: f64,
}

impl Default for ParamsAdadelta {
    fn default() -> Self {
        Self { lr: 1.0, rho: 0.95 }
    }
}

pub struct Adadelta {
    vars: Vec<(Var, Var, Var)>,
    params: ParamsAdadelta,
}

impl Optimizer for Adadelta {
    type Config = ParamsAdadelta;

    fn new(vars: Vec<Var>, params: ParamsAdadelta) -> CandleResult<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|v| Ok((zeros_like(&v)?, zeros_like(&v)?, v)))
            .collect::<CandleResult<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> CandleResult<()> {
        let ParamsAdadelta { lr, rho } = self.params;
        for (acc, delta_acc, var) in &self.vars {
            if let Some(g) = grads.get(var) {
                let next_acc = acc.affine(rho, 0.0)?.add(&g.sqr()?.affine(1.0 - rho, 0.0)?)?;
                let update = g
                    .mul(&delta_acc.affine(1.0, EPSILON)?.sqrt()?)?
                    .div(&next_acc.affine(1.0, EPSILON)?.sqrt()?)?;
                var.set(&var.sub(&update.affine(lr, 0.0)?)?)?;
                let next_delta_acc = delta_acc
                    .affine(rho, 0.0)?
                    .add(&update.sqr()?.affine(1.0 - rho, 0.0)?)?;
                acc.set(&next_acc)?;
                delta_acc.set(&next_delta_acc)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// RMSprop: gradients divided by a running RMS of recent gradients.
#[derive(Debug, Clone, Copy)]
pub struct ParamsRmsProp {
    pub lr: f64,
    pub rho: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self { lr: 0.001, rho: 0.9 }
    }
}

pub struct RmsProp {
    vars: Vec<(Var, Var)>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> CandleResult<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|v| Ok((zeros_like(&v)?, v)))
            .collect::<CandleResult<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> CandleResult<()> {
        let ParamsRmsProp { lr, rho } = self.params;
        for (acc, var) in &self.vars {
            if let Some(g) = grads.get(var) {
                let next_acc = acc.affine(rho, 0.0)?.add(&g.sqr()?.affine(1.0 - rho, 0.0)?)?;
                let delta = g
                    .div(&next_acc.sqrt()?.affine(1.0, EPSILON)?)?
                    .affine(lr, 0.0)?;
                var.set(&var.sub(&delta)?)?;
                acc.set(&next_acc)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// Nadam: Adam with Nesterov momentum and Keras' momentum schedule.
#[derive(Debug, Clone, Copy)]
pub struct ParamsNadam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub schedule_decay: f64,
}

impl Default for ParamsNadam {
    fn default() -> Self {
        Self {
            lr: 0.002,
            beta1: 0.9,
            beta2: 0.999,
            schedule_decay: 0.004,
        }
    }
}

pub struct Nadam {
    vars: Vec<(Var, Var, Var)>,
    step_t: usize,
    m_schedule: f64,
    params: ParamsNadam,
}

impl Optimizer for Nadam {
    type Config = ParamsNadam;

    fn new(vars: Vec<Var>, params: ParamsNadam) -> CandleResult<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|v| Ok((zeros_like(&v)?, zeros_like(&v)?, v)))
            .collect::<CandleResult<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            m_schedule: 1.0,
            params,
        })
    }

    fn step(&mut self, grads: &GradStore) -> CandleResult<()> {
        self.step_t += 1;
        let ParamsNadam {
            lr,
            beta1,
            beta2,
            schedule_decay,
        } = self.params;
        let t = self.step_t as f64;

        let momentum_cache_t = beta1 * (1.0 - 0.5 * 0.96f64.powf(t * schedule_decay));
        let momentum_cache_t_1 = beta1 * (1.0 - 0.5 * 0.96f64.powf((t + 1.0) * schedule_decay));
        let m_schedule_new = self.m_schedule * momentum_cache_t;
        let m_schedule_next = m_schedule_new * momentum_cache_t_1;
        self.m_schedule = m_schedule_new;
        let v_correction = 1.0 - beta2.powf(t);

        for (m, v, var) in &self.vars {
            if let Some(g) = grads.get(var) {
                let g_prime = g.affine(1.0 / (1.0 - m_schedule_new), 0.0)?;
                let next_m = m.affine(beta1, 0.0)?.add(&g.affine(1.0 - beta1, 0.0)?)?;
                let m_prime = next_m.affine(1.0 / (1.0 - m_schedule_next), 0.0)?;
                let next_v = v.affine(beta2, 0.0)?.add(&g.sqr()?.affine(1.0 - beta2, 0.0)?)?;
                let v_prime = next_v.affine(1.0 / v_correction, 0.0)?;
                let m_bar = g_prime
                    .affine(1.0 - momentum_cache_t, 0.0)?
                    .add(&m_prime.affine(momentum_cache_t_1, 0.0)?)?;
                let delta = m_bar
                    .div(&v_prime.sqrt()?.affine(1.0, EPSILON)?)?
                    .affine(lr, 0.0)?;
                var.set(&var.sub(&delta)?)?;
                m.set(&next_m)?;
                v.set(&next_v)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

enum Inner {
    Sgd(SGD),
    Adam(AdamW),
    Adamax(Adamax),
    Adagrad(Adagrad),
    Adadelta(Adadelta),
    RmsProp(RmsProp),
    Nadam(Nadam),
}

/// Optimizer attached to one task model at compile time.
///
/// Holds its own moment estimates for every variable the task trains, shared
/// ones included, and keeps them across fitting calls.
pub struct TaskOptimizer {
    kind: OptimizerKind,
    inner: Inner,
    vars: Vec<Var>,
    clip_norm: Option<f64>,
}

impl TaskOptimizer {
    pub fn new(
        kind: OptimizerKind,
        vars: Vec<Var>,
        learning_rate: f64,
        clip_norm: Option<f64>,
    ) -> Result<Self> {
        let inner = match kind {
            OptimizerKind::Sgd => Inner::Sgd(SGD::new(vars.clone(), learning_rate)?),
            OptimizerKind::Adam => Inner::Adam(AdamW::new(
                vars.clone(),
                ParamsAdamW {
                    lr: learning_rate,
                    beta1: 0.9,
                    beta2: 0.999,
                    eps: EPSILON,
                    weight_decay: 0.0,
                },
            )?),
            OptimizerKind::Adamax => Inner::Adamax(Adamax::new(
                vars.clone(),
                ParamsAdamax {
                    lr: learning_rate,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Adagrad => Inner::Adagrad(Adagrad::new(
                vars.clone(),
                ParamsAdagrad { lr: learning_rate },
            )?),
            OptimizerKind::Adadelta => Inner::Adadelta(Adadelta::new(
                vars.clone(),
                ParamsAdadelta {
                    lr: learning_rate,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Rmsprop => Inner::RmsProp(RmsProp::new(
                vars.clone(),
                ParamsRmsProp {
                    lr: learning_rate,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Nadam => Inner::Nadam(Nadam::new(
                vars.clone(),
                ParamsNadam {
                    lr: learning_rate,
                    ..Default::default()
                },
            )?),
        };

        Ok(Self {
            kind,
            inner,
            vars,
            clip_norm: clip_norm.filter(|c| *c > 0.0),
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn learning_rate(&self) -> f64 {
        match &self.inner {
            Inner::Sgd(o) => o.learning_rate(),
            Inner::Adam(o) => o.learning_rate(),
            Inner::Adamax(o) => o.learning_rate(),
            Inner::Adagrad(o) => o.learning_rate(),
            Inner::Adadelta(o) => o.learning_rate(),
            Inner::RmsProp(o) => o.learning_rate(),
            Inner::Nadam(o) => o.learning_rate(),
        }
    }

    /// Backpropagates `loss`, clips the gradients and applies one update.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let mut grads = loss.backward()?;
        if let Some(max_norm) = self.clip_norm {
            clip_grad_norm(&self.vars, &mut grads, max_norm)?;
        }
        self.step(&grads)
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match &mut self.inner {
            Inner::Sgd(o) => o.step(grads)?,
            Inner::Adam(o) => o.step(grads)?,
            Inner::Adamax(o) => o.step(grads)?,
            Inner::Adagrad(o) => o.step(grads)?,
            Inner::Adadelta(o) => o.step(grads)?,
            Inner::RmsProp(o) => o.step(grads)?,
            Inner::Nadam(o) => o.step(grads)?,
        }
        Ok(())
    }
}

/// Rescales all gradients of `vars` so that their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var) {
            sum_sq += g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = sum_sq.sqrt();

    if norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(g) = grads.get(var) {
                let clipped = g.affine(scale, 0.0)?;
                grads.insert(var, clipped);
            }
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    /// Minimises `sum((w - 3)^2)` and returns the final weights.
    fn minimise(kind: OptimizerKind, lr: f64, steps: usize) -> Vec<f32> {
        let w = Var::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let mut opt = TaskOptimizer::new(kind, vec![w.clone()], lr, None).unwrap();
        for _ in 0..steps {
            let loss = w.as_tensor().affine(1.0, -3.0).unwrap().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        w.as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn every_optimizer_descends() {
        let cases = [
            (OptimizerKind::Sgd, 0.1),
            (OptimizerKind::Adam, 0.1),
            (OptimizerKind::Adamax, 0.1),
            (OptimizerKind::Adagrad, 0.5),
            (OptimizerKind::Adadelta, 1.0),
            (OptimizerKind::Rmsprop, 0.05),
            (OptimizerKind::Nadam, 0.1),
        ];
        for (kind, lr) in cases {
            let w = minimise(kind, lr, 200);
            for x in w {
                assert!(x > 0.1, "{kind}: weight stayed at {x}");
                assert!(x < 5.0, "{kind}: weight diverged to {x}");
            }
        }
    }

    #[test]
    fn sgd_converges() {
        let w = minimise(OptimizerKind::Sgd, 0.1, 100);
        assert!(w.iter().all(|x| (x - 3.0).abs() < 1e-3));
    }

    #[test]
    fn clip_grad_norm_rescales() {
        let a = Var::new(&[3f32, 0.0], &Device::Cpu).unwrap();
        let b = Var::new(&[0f32, 4.0], &Device::Cpu).unwrap();
        // d/dx sum(x^2 / 2) = x, so the gradients are (3, 0) and (0, 4): norm 5
        let loss = (a.as_tensor().sqr().unwrap().sum_all().unwrap()
            + b.as_tensor().sqr().unwrap().sum_all().unwrap())
        .unwrap()
        .affine(0.5, 0.0)
        .unwrap();
        let mut grads = loss.backward().unwrap();

        let vars = vec![a.clone(), b.clone()];
        let norm = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);

        let ga: Vec<f32> = grads.get(&a).unwrap().to_vec1().unwrap();
        let gb: Vec<f32> = grads.get(&b).unwrap().to_vec1().unwrap();
        assert!((ga[0] - 0.6).abs() < 1e-5);
        assert!((gb[1] - 0.8).abs() < 1e-5);
    }

    #[test]
    fn clip_grad_norm_leaves_small_gradients() {
        let a = Var::new(&[0.3f32], &Device::Cpu).unwrap();
        let loss = a.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        clip_grad_norm(&[a.clone()], &mut grads, 10.0).unwrap();
        let g: Vec<f32> = grads.get(&a).unwrap().to_vec1().unwrap();
        assert!((g[0] - 0.6).abs() < 1e-5);
    }

    #[test]
    fn non_positive_clip_disables_clipping() {
        let w = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let opt = TaskOptimizer::new(OptimizerKind::Sgd, vec![w], 0.1, Some(0.0)).unwrap();
        assert!(opt.clip_norm.is_none());
        assert_eq!(opt.kind(), OptimizerKind::Sgd);
        assert!((opt.learning_rate() - 0.1).abs() < 1e-12);
    }
}
