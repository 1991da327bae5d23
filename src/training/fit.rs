//! Fitting a linear head on frozen backbone features.
//!
//! We minimize binary cross-entropy on sigmoid outputs using AdamW and a
//! one-cycle schedule. The schedule warms the learning rate up from
//! `lr / 25` to `lr` over the first quarter of training, then anneals it to
//! `lr / 1e5`, while momentum moves in the opposite direction.

use std::f32::consts::PI;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::{SeedableRng as _, rngs::StdRng, seq::SliceRandom as _};

use crate::{
    model::{classifier::sigmoid, head::LinearHead},
    prelude::*,
};

/// Fraction of steps spent warming up.
const PCT_START: f32 = 0.25;
/// The starting learning rate is `lr / DIV`.
const DIV: f32 = 25.0;
/// The final learning rate is `lr / DIV_FINAL`.
const DIV_FINAL: f32 = 1e5;
/// Momentum at the start and end of the cycle.
const MOM_MAX: f32 = 0.95;
/// Momentum at peak learning rate.
const MOM_MIN: f32 = 0.85;
const BETA2: f32 = 0.99;
const EPS: f32 = 1e-5;
/// Threshold used by [`accuracy_multi`].
const ACCURACY_THRESHOLD: f32 = 0.5;

/// Optimizer settings.
#[derive(Clone, Debug)]
pub struct FitOptions {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub seed: u64,
}

/// A feature matrix with matching multi-hot targets.
#[derive(Clone, Copy, Debug)]
pub struct Dataset<'a> {
    pub features: ArrayView2<'a, f32>,
    pub targets: ArrayView2<'a, f32>,
}

impl Dataset<'_> {
    fn len(&self) -> usize {
        self.features.nrows()
    }
}

/// Metrics recorded after each epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Mean training loss over the epoch's batches.
    pub train_loss: f32,
    /// Loss on the validation split, if there is one.
    pub valid_loss: Option<f32>,
    /// Thresholded accuracy on the validation split, if there is one.
    pub accuracy_multi: Option<f32>,
}

/// Fit a head mapping `train.features` to `train.targets`.
///
/// `on_epoch` is called after every epoch, which lets callers log or
/// update progress bars.
pub fn fit_head(
    train: Dataset<'_>,
    valid: Option<Dataset<'_>>,
    opts: &FitOptions,
    mut on_epoch: impl FnMut(&EpochStats),
) -> Result<(LinearHead, Vec<EpochStats>)> {
    if train.len() == 0 {
        return Err(anyhow!("no training examples"));
    }
    if train.targets.nrows() != train.len() {
        return Err(anyhow!(
            "{} feature rows but {} target rows",
            train.len(),
            train.targets.nrows()
        ));
    }
    let batch_size = opts.batch_size.max(1);
    let n_batches = train.len().div_ceil(batch_size);
    let schedule = OneCycle::new(opts.learning_rate, opts.epochs * n_batches);

    let mut head = LinearHead::zeros(train.targets.ncols(), train.features.ncols());
    let mut optimizer = AdamW::new(&head, opts.weight_decay);
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut order = (0..train.len()).collect::<Vec<_>>();
    let mut history = Vec::with_capacity(opts.epochs);

    for epoch in 1..=opts.epochs {
        order.shuffle(&mut rng);
        let mut loss_sum = 0.0;
        for batch in order.chunks(batch_size) {
            let x = train.features.select(Axis(0), batch);
            let y = train.targets.select(Axis(0), batch);
            let (loss, grad_w, grad_b) = loss_and_gradients(&head, x.view(), y.view())?;
            let (lr, momentum) = schedule.at(optimizer.step);
            optimizer.update(&mut head, &grad_w, &grad_b, lr, momentum);
            loss_sum += loss;
        }

        let (valid_loss, accuracy_multi) = match valid {
            Some(valid) if valid.len() > 0 => {
                let logits = head.logits(valid.features)?;
                (
                    Some(bce_with_logits(logits.view(), valid.targets)),
                    Some(accuracy_multi(logits.view(), valid.targets)),
                )
            }
            _ => (None, None),
        };
        let stats = EpochStats {
            epoch,
            train_loss: loss_sum / n_batches as f32,
            valid_loss,
            accuracy_multi,
        };
        on_epoch(&stats);
        history.push(stats);
    }
    Ok((head, history))
}

/// Mean BCE loss of a batch, with gradients for the weights and bias.
fn loss_and_gradients(
    head: &LinearHead,
    x: ArrayView2<'_, f32>,
    y: ArrayView2<'_, f32>,
) -> Result<(f32, Array2<f32>, Array1<f32>)> {
    let logits = head.logits(x)?;
    let loss = bce_with_logits(logits.view(), y);
    // d(mean BCE)/d(logit) = (sigmoid(logit) - target) / element count.
    let scale = 1.0 / logits.len() as f32;
    let delta = (logits.mapv(sigmoid) - &y) * scale;
    let grad_w = delta.t().dot(&x);
    let grad_b = delta.sum_axis(Axis(0));
    Ok((loss, grad_w, grad_b))
}

/// Mean binary cross-entropy of sigmoid outputs, computed stably from
/// logits.
pub fn bce_with_logits(logits: ArrayView2<'_, f32>, targets: ArrayView2<'_, f32>) -> f32 {
    if logits.is_empty() {
        return 0.0;
    }
    let total = logits
        .iter()
        .zip(targets.iter())
        .map(|(&z, &y)| z.max(0.0) - z * y + (-z.abs()).exp().ln_1p())
        .sum::<f32>();
    total / logits.len() as f32
}

/// The fraction of (image, class) pairs where the thresholded sigmoid output
/// agrees with the target.
pub fn accuracy_multi(logits: ArrayView2<'_, f32>, targets: ArrayView2<'_, f32>) -> f32 {
    if logits.is_empty() {
        return 0.0;
    }
    let correct = logits
        .iter()
        .zip(targets.iter())
        .filter(|&(&z, &y)| (sigmoid(z) > ACCURACY_THRESHOLD) == (y > 0.5))
        .count();
    correct as f32 / logits.len() as f32
}

/// A one-cycle learning-rate and momentum schedule.
#[derive(Clone, Debug)]
struct OneCycle {
    max_lr: f32,
    total_steps: usize,
}

impl OneCycle {
    fn new(max_lr: f32, total_steps: usize) -> Self {
        Self {
            max_lr,
            total_steps: total_steps.max(1),
        }
    }

    /// Learning rate and momentum for a 0-based step.
    fn at(&self, step: usize) -> (f32, f32) {
        let pos = step as f32 / self.total_steps as f32;
        let start_lr = self.max_lr / DIV;
        let final_lr = self.max_lr / DIV_FINAL;
        if pos < PCT_START {
            let p = pos / PCT_START;
            (
                cosine(start_lr, self.max_lr, p),
                cosine(MOM_MAX, MOM_MIN, p),
            )
        } else {
            let p = ((pos - PCT_START) / (1.0 - PCT_START)).min(1.0);
            (
                cosine(self.max_lr, final_lr, p),
                cosine(MOM_MIN, MOM_MAX, p),
            )
        }
    }
}

/// Cosine interpolation from `start` (at `pos = 0`) to `end` (at `pos = 1`).
fn cosine(start: f32, end: f32, pos: f32) -> f32 {
    start + (1.0 + (PI * (1.0 - pos)).cos()) * (end - start) / 2.0
}

/// Adam with decoupled weight decay. Decay applies to weights, not biases.
struct AdamW {
    weight_decay: f32,
    step: usize,
    m_w: Array2<f32>,
    v_w: Array2<f32>,
    m_b: Array1<f32>,
    v_b: Array1<f32>,
}

impl AdamW {
    fn new(head: &LinearHead, weight_decay: f32) -> Self {
        Self {
            weight_decay,
            step: 0,
            m_w: Array2::zeros(head.weights.raw_dim()),
            v_w: Array2::zeros(head.weights.raw_dim()),
            m_b: Array1::zeros(head.bias.raw_dim()),
            v_b: Array1::zeros(head.bias.raw_dim()),
        }
    }

    fn update(
        &mut self,
        head: &mut LinearHead,
        grad_w: &Array2<f32>,
        grad_b: &Array1<f32>,
        lr: f32,
        beta1: f32,
    ) {
        self.step += 1;
        let t = self.step as i32;
        let debias1 = 1.0 - beta1.powi(t);
        let debias2 = 1.0 - BETA2.powi(t);

        head.weights *= 1.0 - lr * self.weight_decay;

        self.m_w.zip_mut_with(grad_w, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        self.v_w.zip_mut_with(grad_w, |v, &g| *v = BETA2 * *v + (1.0 - BETA2) * g * g);
        ndarray::Zip::from(&mut head.weights)
            .and(&self.m_w)
            .and(&self.v_w)
            .for_each(|w, &m, &v| {
                *w -= lr * (m / debias1) / ((v / debias2).sqrt() + EPS);
            });

        self.m_b.zip_mut_with(grad_b, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        self.v_b.zip_mut_with(grad_b, |v, &g| *v = BETA2 * *v + (1.0 - BETA2) * g * g);
        ndarray::Zip::from(&mut head.bias)
            .and(&self.m_b)
            .and(&self.v_b)
            .for_each(|b, &m, &v| {
                *b -= lr * (m / debias1) / ((v / debias2).sqrt() + EPS);
            });
    }
}
