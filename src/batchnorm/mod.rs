//! Batch normalization for fully-connected inputs (Ioffe & Szegedy, 2015).
//!
//! Normalizes each feature channel of a `[batch, features]` mini-batch
//! to zero mean and unit variance, then applies an optional learnable
//! affine transform. Training mode computes statistics from the batch
//! and maintains exponentially-averaged running statistics; eval mode
//! normalizes with the running statistics directly.
//!
//! The layer carries its own backward pass: gradients are computed from
//! the exact statistics saved by the preceding forward call, never from
//! recomputed ones, so the input gradient accounts for the influence
//! every element has on the batch mean and variance.
//!
//! # Example
//!
//! ```
//! use normalizar::batchnorm::BatchNorm1d;
//! use normalizar::primitives::Matrix;
//!
//! let mut layer = BatchNorm1d::new(3).expect("positive feature count");
//! let batch = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 3.0, 2.0, 1.0])
//!     .expect("data length matches rows * cols");
//!
//! let output = layer.forward(batch).expect("batch matches layer width");
//! assert_eq!(output.shape(), (2, 3));
//! ```
//!
//! # References
//!
//! - Ioffe, S., & Szegedy, C. (2015). Batch normalization: Accelerating
//!   deep network training by reducing internal covariate shift. ICML.

use crate::error::{NormalizarError, Result};
use crate::primitives::{Matrix, Vector};
use crate::serialization::safetensors::{
    save_safetensors, SafeTensorsArchive, TensorMap, UserMetadata,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Current state-file version. Stores `running_var` directly.
pub const STATE_FORMAT_VERSION: u32 = 2;

/// Legacy state-file version that stored an inverse running standard
/// deviation (`running_std`) instead of `running_var`.
const LEGACY_STATE_VERSION: u32 = 1;

/// Learnable per-channel parameters, present only when the layer is
/// affine. When affine is disabled the vectors do not exist at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AffineParams {
    /// No learnable parameters: the layer outputs the normalized values.
    Disabled,
    /// Per-channel scale and shift with paired gradient accumulators.
    Enabled {
        /// Learnable scale (gamma)
        weight: Vector<f32>,
        /// Learnable shift (beta)
        bias: Vector<f32>,
        /// Accumulated gradient w.r.t. `weight`
        grad_weight: Vector<f32>,
        /// Accumulated gradient w.r.t. `bias`
        grad_bias: Vector<f32>,
    },
}

/// Statistics saved by a training-mode forward pass for the paired
/// backward pass. Overwritten on every training forward, dropped by
/// `clear_state`.
#[derive(Debug, Clone)]
struct SavedStats {
    mean: Vector<f32>,
    inv_std: Vector<f32>,
    batch_size: usize,
}

/// Per-channel batch statistics from one training-mode forward pass.
struct ChannelStats {
    mean: Vec<f32>,
    biased_var: Vec<f32>,
    unbiased_var: Vec<f32>,
}

/// Validated configuration for [`BatchNorm1d`].
///
/// `num_features` is required; the remaining knobs default to the
/// conventional values. Validation happens once, in [`build`].
///
/// # Example
///
/// ```
/// use normalizar::batchnorm::BatchNormConfig;
///
/// let layer = BatchNormConfig::new(8)
///     .with_eps(1e-3)
///     .with_momentum(0.05)
///     .with_affine(false)
///     .build()
///     .expect("valid configuration");
/// assert_eq!(layer.num_features(), 8);
/// ```
///
/// [`build`]: BatchNormConfig::build
#[derive(Debug, Clone)]
pub struct BatchNormConfig {
    num_features: usize,
    eps: f32,
    momentum: f32,
    affine: bool,
    in_place: bool,
    seed: Option<u64>,
}

impl BatchNormConfig {
    /// Starts a configuration for a layer over `num_features` channels.
    #[must_use]
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            affine: true,
            in_place: false,
            seed: None,
        }
    }

    /// Sets the epsilon added to the variance before the inverse square
    /// root. Must be positive.
    #[must_use]
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Sets the exponential-moving-average weight for running-statistic
    /// updates. Must lie in `(0, 1]`.
    #[must_use]
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// Enables or disables the learnable affine transform.
    #[must_use]
    pub fn with_affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    /// Selects whether `forward` reuses the input allocation for its
    /// output (destructively) instead of allocating a fresh one.
    #[must_use]
    pub fn with_in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }

    /// Sets a seed for the affine weight initialization.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validates the configuration and builds the layer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHyperparameter` if `num_features` is zero,
    /// `eps` is not positive, or `momentum` is outside `(0, 1]`.
    pub fn build(self) -> Result<BatchNorm1d> {
        if self.num_features == 0 {
            return Err(NormalizarError::InvalidHyperparameter {
                param: "num_features".to_string(),
                value: "0".to_string(),
                constraint: "> 0".to_string(),
            });
        }
        if !(self.eps > 0.0) {
            return Err(NormalizarError::InvalidHyperparameter {
                param: "eps".to_string(),
                value: self.eps.to_string(),
                constraint: "> 0".to_string(),
            });
        }
        if !(self.momentum > 0.0 && self.momentum <= 1.0) {
            return Err(NormalizarError::InvalidHyperparameter {
                param: "momentum".to_string(),
                value: self.momentum.to_string(),
                constraint: "in (0, 1]".to_string(),
            });
        }

        let params = if self.affine {
            initial_affine_params(self.num_features, self.seed)
        } else {
            AffineParams::Disabled
        };

        Ok(BatchNorm1d {
            num_features: self.num_features,
            eps: self.eps,
            momentum: self.momentum,
            in_place: self.in_place,
            training: true,
            params,
            running_mean: Vector::zeros(self.num_features),
            running_var: Vector::ones(self.num_features),
            saved: None,
        })
    }
}

/// Weight starts as `U(0, 1)` samples, bias and both gradient
/// accumulators as zeros.
fn initial_affine_params(num_features: usize, seed: Option<u64>) -> AffineParams {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let weight: Vec<f32> = (0..num_features).map(|_| rng.gen_range(0.0..1.0)).collect();

    AffineParams::Enabled {
        weight: Vector::from_vec(weight),
        bias: Vector::zeros(num_features),
        grad_weight: Vector::zeros(num_features),
        grad_bias: Vector::zeros(num_features),
    }
}

/// Batch Normalization over the feature channels of a 2-D batch.
///
/// See the [module documentation](self) for the full contract. Layers
/// start in training mode; switch with [`eval`](BatchNorm1d::eval) and
/// [`train`](BatchNorm1d::train).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm1d {
    num_features: usize,
    eps: f32,
    momentum: f32,
    in_place: bool,
    training: bool,
    params: AffineParams,
    /// Running mean, updated only by training-mode forward passes
    running_mean: Vector<f32>,
    /// Running variance, updated only by training-mode forward passes
    running_var: Vector<f32>,
    /// Scratch statistics from the last training forward; not persisted
    #[serde(skip)]
    saved: Option<SavedStats>,
}

impl BatchNorm1d {
    /// Creates a layer with the default configuration
    /// (`eps = 1e-5`, `momentum = 0.1`, affine enabled, not in-place).
    ///
    /// # Errors
    ///
    /// Returns `InvalidHyperparameter` if `num_features` is zero.
    pub fn new(num_features: usize) -> Result<Self> {
        BatchNormConfig::new(num_features).build()
    }

    /// Number of feature channels this layer normalizes.
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Epsilon added to the variance for numerical stability.
    #[must_use]
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// EMA weight for running-statistic updates.
    #[must_use]
    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Whether `forward` overwrites its input allocation.
    #[must_use]
    pub fn is_in_place(&self) -> bool {
        self.in_place
    }

    /// Whether the layer carries learnable affine parameters.
    #[must_use]
    pub fn affine(&self) -> bool {
        matches!(self.params, AffineParams::Enabled { .. })
    }

    /// Switches to training mode.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Switches to evaluation mode.
    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Returns true in training mode.
    #[must_use]
    pub fn training(&self) -> bool {
        self.training
    }

    /// Running per-channel mean.
    #[must_use]
    pub fn running_mean(&self) -> &Vector<f32> {
        &self.running_mean
    }

    /// Running per-channel variance.
    #[must_use]
    pub fn running_var(&self) -> &Vector<f32> {
        &self.running_var
    }

    /// Learnable scale, if the layer is affine.
    #[must_use]
    pub fn weight(&self) -> Option<&Vector<f32>> {
        match &self.params {
            AffineParams::Enabled { weight, .. } => Some(weight),
            AffineParams::Disabled => None,
        }
    }

    /// Learnable shift, if the layer is affine.
    #[must_use]
    pub fn bias(&self) -> Option<&Vector<f32>> {
        match &self.params {
            AffineParams::Enabled { bias, .. } => Some(bias),
            AffineParams::Disabled => None,
        }
    }

    /// Accumulated scale gradient, if the layer is affine.
    #[must_use]
    pub fn grad_weight(&self) -> Option<&Vector<f32>> {
        match &self.params {
            AffineParams::Enabled { grad_weight, .. } => Some(grad_weight),
            AffineParams::Disabled => None,
        }
    }

    /// Accumulated shift gradient, if the layer is affine.
    #[must_use]
    pub fn grad_bias(&self) -> Option<&Vector<f32>> {
        match &self.params {
            AffineParams::Enabled { grad_bias, .. } => Some(grad_bias),
            AffineParams::Disabled => None,
        }
    }

    /// Mean saved by the last training-mode forward pass, if any.
    #[must_use]
    pub fn saved_mean(&self) -> Option<&Vector<f32>> {
        self.saved.as_ref().map(|s| &s.mean)
    }

    /// Inverse standard deviation saved by the last training-mode
    /// forward pass, if any.
    #[must_use]
    pub fn saved_inv_std(&self) -> Option<&Vector<f32>> {
        self.saved.as_ref().map(|s| &s.inv_std)
    }

    /// Replaces the learnable scale (e.g. from a loaded checkpoint).
    ///
    /// # Errors
    ///
    /// Returns an error if the layer is not affine or the length does
    /// not match `num_features`.
    pub fn set_weight(&mut self, weight: Vector<f32>) -> Result<()> {
        if weight.len() != self.num_features {
            return Err(NormalizarError::ShapeMismatch {
                expected: format!("[{}]", self.num_features),
                actual: format!("[{}]", weight.len()),
            });
        }
        match &mut self.params {
            AffineParams::Enabled { weight: w, .. } => {
                *w = weight;
                Ok(())
            }
            AffineParams::Disabled => Err(NormalizarError::precondition(
                "cannot set weight on a layer without affine parameters",
            )),
        }
    }

    /// Replaces the learnable shift (e.g. from a loaded checkpoint).
    ///
    /// # Errors
    ///
    /// Returns an error if the layer is not affine or the length does
    /// not match `num_features`.
    pub fn set_bias(&mut self, bias: Vector<f32>) -> Result<()> {
        if bias.len() != self.num_features {
            return Err(NormalizarError::ShapeMismatch {
                expected: format!("[{}]", self.num_features),
                actual: format!("[{}]", bias.len()),
            });
        }
        match &mut self.params {
            AffineParams::Enabled { bias: b, .. } => {
                *b = bias;
                Ok(())
            }
            AffineParams::Disabled => Err(NormalizarError::precondition(
                "cannot set bias on a layer without affine parameters",
            )),
        }
    }

    /// Runs the layer on a batch.
    ///
    /// The input is consumed. For an in-place layer the returned matrix
    /// reuses the input allocation (the original values are destroyed);
    /// otherwise the output is freshly allocated. Keep a copy of the
    /// input if you need it for [`backward`](BatchNorm1d::backward).
    ///
    /// Training mode computes batch statistics, saves them for the
    /// backward pass, and updates the running statistics; eval mode
    /// normalizes with the running statistics and mutates nothing.
    ///
    /// # Errors
    ///
    /// - `ShapeMismatch` if the batch width differs from
    ///   `num_features` or the batch is empty.
    /// - `PreconditionViolation` if training mode is given fewer than
    ///   2 samples (the unbiased running-variance update is undefined).
    pub fn forward(&mut self, input: Matrix<f32>) -> Result<Matrix<f32>> {
        let (batch, features) = input.shape();
        if features != self.num_features {
            return Err(NormalizarError::batch_shape_mismatch(
                self.num_features,
                batch,
                features,
            ));
        }
        if batch == 0 {
            return Err(NormalizarError::ShapeMismatch {
                expected: format!("[batch >= 1, {}]", self.num_features),
                actual: format!("[0, {features}]"),
            });
        }

        let (mean, inv_std) = if self.training {
            if batch < 2 {
                return Err(NormalizarError::precondition(format!(
                    "training-mode forward requires at least 2 samples per channel, got {batch}"
                )));
            }
            let stats = channel_statistics(&input);
            self.update_running_stats(&stats);

            let inv_std: Vec<f32> = stats
                .biased_var
                .iter()
                .map(|&v| 1.0 / (v + self.eps).sqrt())
                .collect();
            self.saved = Some(SavedStats {
                mean: Vector::from_slice(&stats.mean),
                inv_std: Vector::from_slice(&inv_std),
                batch_size: batch,
            });
            (stats.mean, inv_std)
        } else {
            let mean = self.running_mean.as_slice().to_vec();
            let inv_std: Vec<f32> = self
                .running_var
                .as_slice()
                .iter()
                .map(|&v| 1.0 / (v + self.eps).sqrt())
                .collect();
            (mean, inv_std)
        };

        self.apply(input, &mean, &inv_std)
    }

    /// Normalizes (and affine-transforms) the batch with the given
    /// per-channel statistics, honoring the in-place flag.
    fn apply(&self, input: Matrix<f32>, mean: &[f32], inv_std: &[f32]) -> Result<Matrix<f32>> {
        let (batch, features) = input.shape();
        let (weight, bias) = match &self.params {
            AffineParams::Enabled { weight, bias, .. } => {
                (Some(weight.as_slice()), Some(bias.as_slice()))
            }
            AffineParams::Disabled => (None, None),
        };

        if self.in_place {
            let mut output = input;
            let data = output.as_mut_slice();
            for i in 0..batch {
                for j in 0..features {
                    let idx = i * features + j;
                    let mut value = (data[idx] - mean[j]) * inv_std[j];
                    if let (Some(w), Some(b)) = (weight, bias) {
                        value = value * w[j] + b[j];
                    }
                    data[idx] = value;
                }
            }
            Ok(output)
        } else {
            let src = input.as_slice();
            let mut data = vec![0.0f32; batch * features];
            for i in 0..batch {
                for j in 0..features {
                    let idx = i * features + j;
                    let mut value = (src[idx] - mean[j]) * inv_std[j];
                    if let (Some(w), Some(b)) = (weight, bias) {
                        value = value * w[j] + b[j];
                    }
                    data[idx] = value;
                }
            }
            Matrix::from_vec(batch, features, data).map_err(Into::into)
        }
    }

    /// EMA update of the running statistics. The running variance uses
    /// the unbiased (n-1) estimate; the normalization path keeps the
    /// biased (n) one.
    fn update_running_stats(&mut self, stats: &ChannelStats) {
        let m = self.momentum;
        for (r, &b) in self
            .running_mean
            .as_mut_slice()
            .iter_mut()
            .zip(stats.mean.iter())
        {
            *r = (1.0 - m) * *r + m * b;
        }
        for (r, &b) in self
            .running_var
            .as_mut_slice()
            .iter_mut()
            .zip(stats.unbiased_var.iter())
        {
            *r = (1.0 - m) * *r + m * b;
        }
    }

    /// Full backward pass: returns the input gradient and accumulates
    /// the parameter gradients (scaled by `scale`) into the layer's
    /// accumulators.
    ///
    /// Uses the statistics saved by the preceding training-mode forward
    /// pass; `input` must be the same batch that forward saw.
    ///
    /// # Errors
    ///
    /// - `PreconditionViolation` in eval mode or before any
    ///   training-mode forward pass.
    /// - `ShapeMismatch` if `input` and `grad_output` differ from each
    ///   other or from the forward batch.
    pub fn backward(
        &mut self,
        input: &Matrix<f32>,
        grad_output: &Matrix<f32>,
        scale: f32,
    ) -> Result<Matrix<f32>> {
        self.check_backward_shapes(input, grad_output)?;
        let (sum_dy, dot_p) = self.channel_reductions(input, grad_output)?;
        self.accumulate_parameter_gradients(&sum_dy, &dot_p, scale)?;
        self.input_gradient(input, grad_output, &sum_dy, &dot_p)
    }

    /// Parameter-gradient-only backward: accumulates the scale and
    /// shift gradients without computing an input gradient. A no-op for
    /// layers without affine parameters.
    ///
    /// # Errors
    ///
    /// In addition to the [`backward`](BatchNorm1d::backward) errors,
    /// fails with `PreconditionViolation` on an in-place layer: its
    /// forward pass already overwrote the input buffer, so the
    /// decoupled parameter-gradient step has nothing valid to read.
    pub fn backward_params(
        &mut self,
        input: &Matrix<f32>,
        grad_output: &Matrix<f32>,
        scale: f32,
    ) -> Result<()> {
        if self.in_place {
            return Err(NormalizarError::precondition(
                "parameter-only gradients are unavailable for an in-place layer: \
                 the forward pass has already overwritten the input buffer",
            ));
        }
        self.check_backward_shapes(input, grad_output)?;
        let (sum_dy, dot_p) = self.channel_reductions(input, grad_output)?;
        self.accumulate_parameter_gradients(&sum_dy, &dot_p, scale)
    }

    /// Input-gradient-only backward: same computation as
    /// [`backward`](BatchNorm1d::backward) with the parameter gradients
    /// discarded. Leaves the accumulators untouched.
    ///
    /// # Errors
    ///
    /// Same as [`backward`](BatchNorm1d::backward).
    pub fn backward_input(
        &self,
        input: &Matrix<f32>,
        grad_output: &Matrix<f32>,
    ) -> Result<Matrix<f32>> {
        self.check_backward_shapes(input, grad_output)?;
        let (sum_dy, dot_p) = self.channel_reductions(input, grad_output)?;
        self.input_gradient(input, grad_output, &sum_dy, &dot_p)
    }

    /// Resets both gradient accumulators to zero. No-op without affine
    /// parameters.
    pub fn zero_grad_parameters(&mut self) {
        if let AffineParams::Enabled {
            grad_weight,
            grad_bias,
            ..
        } = &mut self.params
        {
            grad_weight.fill(0.0);
            grad_bias.fill(0.0);
        }
    }

    /// Drops the scratch statistics saved for the backward pass.
    /// Learnable parameters and running statistics are untouched.
    pub fn clear_state(&mut self) {
        self.saved = None;
    }

    /// Restores the running statistics to their initial state
    /// (zero mean, unit variance).
    pub fn reset_running_stats(&mut self) {
        self.running_mean.fill(0.0);
        self.running_var.fill(1.0);
    }

    /// Re-randomizes the affine weight, zeroes the bias and both
    /// gradient accumulators. No-op without affine parameters.
    pub fn reset_parameters(&mut self, seed: Option<u64>) {
        if self.affine() {
            self.params = initial_affine_params(self.num_features, seed);
        }
    }

    fn check_backward_shapes(&self, input: &Matrix<f32>, grad_output: &Matrix<f32>) -> Result<()> {
        if !self.training {
            return Err(NormalizarError::precondition(
                "backward is only defined in training mode; call train() and run forward first",
            ));
        }
        let saved = self.saved_stats()?;

        if input.shape() != grad_output.shape() {
            let (gr, gc) = grad_output.shape();
            let (ir, ic) = input.shape();
            return Err(NormalizarError::ShapeMismatch {
                expected: format!("grad_output of shape [{ir}, {ic}]"),
                actual: format!("[{gr}, {gc}]"),
            });
        }

        let (batch, features) = input.shape();
        if features != self.num_features || batch != saved.batch_size {
            return Err(NormalizarError::ShapeMismatch {
                expected: format!("[{}, {}]", saved.batch_size, self.num_features),
                actual: format!("[{batch}, {features}]"),
            });
        }
        Ok(())
    }

    fn saved_stats(&self) -> Result<&SavedStats> {
        self.saved.as_ref().ok_or_else(|| {
            NormalizarError::precondition(
                "backward called before a training-mode forward pass saved batch statistics",
            )
        })
    }

    /// Per-channel reductions shared by all backward entry points:
    /// the plain gradient sum and the centered-input dot product.
    fn channel_reductions(
        &self,
        input: &Matrix<f32>,
        grad_output: &Matrix<f32>,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let saved = self.saved_stats()?;
        let (batch, features) = input.shape();
        let x = input.as_slice();
        let dy = grad_output.as_slice();
        let mean = saved.mean.as_slice();

        let mut sum_dy = vec![0.0f32; features];
        let mut dot_p = vec![0.0f32; features];
        for i in 0..batch {
            for j in 0..features {
                let idx = i * features + j;
                sum_dy[j] += dy[idx];
                dot_p[j] += (x[idx] - mean[j]) * dy[idx];
            }
        }
        Ok((sum_dy, dot_p))
    }

    fn accumulate_parameter_gradients(
        &mut self,
        sum_dy: &[f32],
        dot_p: &[f32],
        scale: f32,
    ) -> Result<()> {
        let Some(saved) = self.saved.as_ref() else {
            return Err(NormalizarError::precondition(
                "backward called before a training-mode forward pass saved batch statistics",
            ));
        };
        let inv_std = saved.inv_std.as_slice();

        if let AffineParams::Enabled {
            grad_weight,
            grad_bias,
            ..
        } = &mut self.params
        {
            let gw = grad_weight.as_mut_slice();
            let gb = grad_bias.as_mut_slice();
            for j in 0..sum_dy.len() {
                gb[j] += scale * sum_dy[j];
                gw[j] += scale * dot_p[j] * inv_std[j];
            }
        }
        Ok(())
    }

    /// The batch-norm input gradient: each element's gradient carries
    /// the direct normalization term plus the terms flowing through the
    /// batch mean and variance.
    fn input_gradient(
        &self,
        input: &Matrix<f32>,
        grad_output: &Matrix<f32>,
        sum_dy: &[f32],
        dot_p: &[f32],
    ) -> Result<Matrix<f32>> {
        let saved = self.saved_stats()?;
        let (batch, features) = input.shape();
        let n = batch as f32;
        let x = input.as_slice();
        let dy = grad_output.as_slice();
        let mean = saved.mean.as_slice();
        let inv_std = saved.inv_std.as_slice();
        let weight = match &self.params {
            AffineParams::Enabled { weight, .. } => Some(weight.as_slice()),
            AffineParams::Disabled => None,
        };

        let mut data = vec![0.0f32; batch * features];
        for j in 0..features {
            let istd = inv_std[j];
            let k = dot_p[j] * istd * istd / n;
            let mean_dy = sum_dy[j] / n;
            let w = weight.map_or(1.0, |w| w[j]);
            for i in 0..batch {
                let idx = i * features + j;
                data[idx] = (dy[idx] - mean_dy - (x[idx] - mean[j]) * k) * istd * w;
            }
        }
        Matrix::from_vec(batch, features, data).map_err(Into::into)
    }

    /// Saves the layer state to a `SafeTensors` file.
    ///
    /// Persists the running statistics, the affine parameters when
    /// present, and the configuration in the `__metadata__` section.
    /// Gradient accumulators and saved batch statistics are transient
    /// and not written.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file writing fails.
    pub fn save_safetensors<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let nf = self.num_features;
        let mut tensors = TensorMap::new();
        tensors.insert(
            "running_mean".to_string(),
            (self.running_mean.as_slice().to_vec(), vec![nf]),
        );
        tensors.insert(
            "running_var".to_string(),
            (self.running_var.as_slice().to_vec(), vec![nf]),
        );
        if let AffineParams::Enabled { weight, bias, .. } = &self.params {
            tensors.insert("weight".to_string(), (weight.as_slice().to_vec(), vec![nf]));
            tensors.insert("bias".to_string(), (bias.as_slice().to_vec(), vec![nf]));
        }

        let mut metadata = UserMetadata::new();
        metadata.insert("format".to_string(), "normalizar.batchnorm1d".to_string());
        metadata.insert("version".to_string(), STATE_FORMAT_VERSION.to_string());
        metadata.insert("num_features".to_string(), nf.to_string());
        metadata.insert("eps".to_string(), self.eps.to_string());
        metadata.insert("momentum".to_string(), self.momentum.to_string());
        metadata.insert("affine".to_string(), self.affine().to_string());
        metadata.insert("in_place".to_string(), self.in_place.to_string());

        save_safetensors(path, &tensors, &metadata)
    }

    /// Loads a layer from a `SafeTensors` file, migrating legacy
    /// versions where necessary.
    ///
    /// Version 2 (current) stores `running_var` directly. Version 1
    /// stored an inverse running standard deviation; its `running_std`
    /// tensor is converted via `running_var = 1/running_std^2 - eps`
    /// and discarded. Gradient accumulators start at zero and no saved
    /// batch statistics exist on a freshly loaded layer.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVersion` for any other version tag.
    /// - `FormatError` for missing/invalid metadata or tensors.
    pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<Self> {
        let archive = SafeTensorsArchive::open(path)?;
        let version: u32 = parse_field(archive.user_metadata(), "version")?;
        match version {
            STATE_FORMAT_VERSION => Self::from_state_v2(&archive),
            LEGACY_STATE_VERSION => Self::from_state_v1(&archive),
            other => Err(NormalizarError::UnsupportedVersion {
                found: other,
                supported: STATE_FORMAT_VERSION,
            }),
        }
    }

    /// Current-format loader: `running_var` is stored directly.
    fn from_state_v2(archive: &SafeTensorsArchive) -> Result<Self> {
        let mut layer = Self::layer_from_metadata(archive.user_metadata())?;
        let nf = layer.num_features;
        layer.running_mean = Vector::from_vec(named_vector(archive, "running_mean", nf)?);
        layer.running_var = Vector::from_vec(named_vector(archive, "running_var", nf)?);
        layer.load_affine(archive)?;
        Ok(layer)
    }

    /// Legacy loader: converts the `running_std` tensor into a running
    /// variance and drops it.
    fn from_state_v1(archive: &SafeTensorsArchive) -> Result<Self> {
        let mut layer = Self::layer_from_metadata(archive.user_metadata())?;
        let nf = layer.num_features;
        layer.running_mean = Vector::from_vec(named_vector(archive, "running_mean", nf)?);

        let running_std = named_vector(archive, "running_std", nf)?;
        layer.running_var = Vector::from_vec(running_var_from_legacy_std(
            &running_std,
            layer.eps,
        ));
        layer.load_affine(archive)?;
        Ok(layer)
    }

    /// Rebuilds an initial layer from the configuration carried in the
    /// state-file metadata.
    fn layer_from_metadata(meta: &UserMetadata) -> Result<Self> {
        let num_features: usize = parse_field(meta, "num_features")?;
        let eps: f32 = parse_field(meta, "eps")?;
        let momentum: f32 = parse_field(meta, "momentum")?;
        let affine: bool = parse_field(meta, "affine")?;
        let in_place: bool = parse_field(meta, "in_place")?;

        BatchNormConfig::new(num_features)
            .with_eps(eps)
            .with_momentum(momentum)
            .with_affine(affine)
            .with_in_place(in_place)
            .build()
    }

    fn load_affine(&mut self, archive: &SafeTensorsArchive) -> Result<()> {
        if self.affine() {
            let weight = named_vector(archive, "weight", self.num_features)?;
            let bias = named_vector(archive, "bias", self.num_features)?;
            self.set_weight(Vector::from_vec(weight))?;
            self.set_bias(Vector::from_vec(bias))?;
        }
        Ok(())
    }
}

/// Two-pass per-channel statistics: mean first, then the sum of squared
/// deviations (clamped at zero against round-off), never the
/// sum-of-squares-minus-square-of-sum shortcut.
fn channel_statistics(input: &Matrix<f32>) -> ChannelStats {
    let (batch, features) = input.shape();
    let data = input.as_slice();
    let n = batch as f32;

    let mut mean = vec![0.0f32; features];
    for i in 0..batch {
        for j in 0..features {
            mean[j] += data[i * features + j];
        }
    }
    for m in &mut mean {
        *m /= n;
    }

    let mut sq_dev = vec![0.0f32; features];
    for i in 0..batch {
        for j in 0..features {
            let d = data[i * features + j] - mean[j];
            sq_dev[j] += d * d;
        }
    }

    let biased_var: Vec<f32> = sq_dev.iter().map(|&s| (s / n).max(0.0)).collect();
    let unbiased_var: Vec<f32> = sq_dev.iter().map(|&s| (s / (n - 1.0)).max(0.0)).collect();

    ChannelStats {
        mean,
        biased_var,
        unbiased_var,
    }
}

/// Recovers a running variance from the legacy inverse-standard-
/// deviation representation: `var = 1/std^2 - eps`.
fn running_var_from_legacy_std(running_std: &[f32], eps: f32) -> Vec<f32> {
    running_std.iter().map(|&s| 1.0 / (s * s) - eps).collect()
}

fn metadata_field<'a>(meta: &'a UserMetadata, key: &str) -> Result<&'a str> {
    meta.get(key)
        .map(String::as_str)
        .ok_or_else(|| NormalizarError::format(format!("missing '{key}' in state metadata")))
}

fn parse_field<T: FromStr>(meta: &UserMetadata, key: &str) -> Result<T> {
    let raw = metadata_field(meta, key)?;
    raw.parse().map_err(|_| {
        NormalizarError::format(format!("invalid '{key}' value '{raw}' in state metadata"))
    })
}

fn named_vector(archive: &SafeTensorsArchive, name: &str, expected_len: usize) -> Result<Vec<f32>> {
    let data = archive.tensor(name)?;
    if data.len() != expected_len {
        return Err(NormalizarError::ShapeMismatch {
            expected: format!("tensor '{name}' of length {expected_len}"),
            actual: format!("length {}", data.len()),
        });
    }
    Ok(data)
}


#[cfg(test)]
#[path = "tests_batchnorm_contract.rs"]
mod tests_batchnorm_contract;
