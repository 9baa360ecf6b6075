//! ODE right-hand sides `f(t, z)` over batched states.
//!
//! Three parameterizations share the [`OdeFunc`] contract:
//!
//! - [`TensorTrainOdeFunc`]: `dz/dt = A ×ₖ φ([z, t])` with `A` a fixed-rank tensor train
//! - [`LinearCubicOdeFunc`]: `dz/dt = (z ∘ z ∘ z) · A`
//! - [`MlpOdeFunc`]: `dz/dt = W₂ σ(W₁ x + b₁) + b₂`, with `x = z` or `x = z³`

use std::fmt;
use std::str::FromStr;

use crate::basis::{self, BasisKind};
use crate::tt::{TensorTrainFixedRank, UniformInit};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// A time-dependent vector field over `(batch, dim)` states.
///
/// Implementations must be pure: calling `derivative` twice with the same inputs gives the same
/// output and mutates nothing.
pub trait OdeFunc {
    /// State width `D`.
    fn dim(&self) -> usize;

    /// Instantaneous derivative at `(t, z)`, same shape as `z`.
    fn derivative(&self, t: f64, z: &ArrayView2<f64>) -> Result<Array2<f64>>;
}

fn check_width(z: &ArrayView2<f64>, dim: usize) -> Result<()> {
    if z.ncols() != dim {
        return Err(Error::Shape(format!(
            "state must have {dim} columns, got {}",
            z.ncols()
        )));
    }
    Ok(())
}

/// Tensor-train rank request.
///
/// Only [`TtRank::Fixed`] is implemented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtRank {
    Fixed(usize),
    /// Rank chosen during training (e.g. by rounding).
    Adaptive,
    /// One rank per bond.
    PerMode(Vec<usize>),
}

impl Default for TtRank {
    fn default() -> Self {
        TtRank::Fixed(3)
    }
}

/// Configuration for [`TensorTrainOdeFunc`].
#[derive(Debug, Clone)]
pub struct TtOdeConfig {
    /// Latent state dimension `Dz`.
    pub latent_dim: usize,
    pub basis: BasisKind,
    pub rank: TtRank,
    /// Polynomial degree `d`; each mode has `d + 1` features.
    pub poly_deg: usize,
    pub init: UniformInit,
    /// RNG seed for core initialisation.
    pub seed: u64,
}

impl Default for TtOdeConfig {
    fn default() -> Self {
        Self {
            latent_dim: 2,
            basis: BasisKind::Poly,
            rank: TtRank::default(),
            poly_deg: 2,
            init: UniformInit::default(),
            seed: 42,
        }
    }
}

/// Tensor-train ODE right-hand side:
/// \[
/// \frac{dz}{dt} = \mathcal{A} \cdot \Phi([z, t]).
/// \]
///
/// The train has dims `[Dz] + [d + 1] * (Dz + 1)`: one output mode and one basis mode per state
/// component plus one for time.
#[derive(Debug, Clone)]
pub struct TensorTrainOdeFunc {
    tt: TensorTrainFixedRank,
    basis: BasisKind,
    poly_deg: usize,
    latent_dim: usize,
}

impl TensorTrainOdeFunc {
    pub fn new(cfg: &TtOdeConfig) -> Result<Self> {
        let rank = match &cfg.rank {
            TtRank::Fixed(r) => *r,
            other => {
                return Err(Error::Unsupported(format!(
                    "only fixed tensor-train ranks are supported, got {other:?}"
                )))
            }
        };
        if cfg.latent_dim == 0 {
            return Err(Error::Shape("latent dim must be >= 1, got 0".into()));
        }

        let dims = Self::dims(cfg.latent_dim, cfg.poly_deg);
        let tt = TensorTrainFixedRank::new(&dims, rank, cfg.init, cfg.seed)?;
        log::info!(
            "tensor-train ode func: dims={dims:?} rank={rank} learnable={}",
            tt.num_learnable_scalars()
        );
        Ok(Self {
            tt,
            basis: cfg.basis,
            poly_deg: cfg.poly_deg,
            latent_dim: cfg.latent_dim,
        })
    }

    /// `[Dz] + [d + 1] * (Dz + 1)`.
    pub fn dims(latent_dim: usize, poly_deg: usize) -> Vec<usize> {
        let mut dims = Vec::with_capacity(latent_dim + 2);
        dims.push(latent_dim);
        dims.extend(std::iter::repeat(poly_deg + 1).take(latent_dim + 1));
        dims
    }

    pub fn tt(&self) -> &TensorTrainFixedRank {
        &self.tt
    }

    pub fn tt_mut(&mut self) -> &mut TensorTrainFixedRank {
        &mut self.tt
    }

    pub fn poly_deg(&self) -> usize {
        self.poly_deg
    }

    /// Order of the underlying tensor (`Dz + 2`).
    pub fn order(&self) -> usize {
        self.tt.order()
    }

    /// Sum of core norms, for use as a regularizer `λ · norm()`.
    pub fn norm(&self) -> f64 {
        self.tt.norm()
    }

    pub fn num_learnable_scalars(&self) -> usize {
        self.tt.num_learnable_scalars()
    }

    /// One SGD step regressing `f(t, z)` onto `target` (same shape as `z`).
    ///
    /// Returns `½ · mean_b ‖f(t, z_b) − target_b‖²` before the step.
    pub fn sgd_step(
        &mut self,
        t: f64,
        z: &ArrayView2<f64>,
        target: &ArrayView2<f64>,
        lr: f64,
    ) -> Result<f64> {
        check_width(z, self.latent_dim)?;
        let phi = basis::expand(self.basis, z, t, self.poly_deg)?;
        self.tt.sgd_step(&phi, target, lr)
    }

    /// [`Self::sgd_step`] with the penalty `λ · norm()` added to the loss.
    pub fn sgd_step_regularized(
        &mut self,
        t: f64,
        z: &ArrayView2<f64>,
        target: &ArrayView2<f64>,
        lr: f64,
        lambda: f64,
    ) -> Result<f64> {
        check_width(z, self.latent_dim)?;
        let phi = basis::expand(self.basis, z, t, self.poly_deg)?;
        self.tt.sgd_step_regularized(&phi, target, lr, lambda)
    }
}

impl OdeFunc for TensorTrainOdeFunc {
    fn dim(&self) -> usize {
        self.latent_dim
    }

    fn derivative(&self, t: f64, z: &ArrayView2<f64>) -> Result<Array2<f64>> {
        check_width(z, self.latent_dim)?;
        let phi = basis::expand(self.basis, z, t, self.poly_deg)?;
        self.tt.evaluate(&phi)
    }
}

/// `dz/dt = (z ∘ z ∘ z) · A` with a square system matrix `A`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearCubicOdeFunc {
    /// System matrix, `(D, D)`.
    pub a: Array2<f64>,
}

impl LinearCubicOdeFunc {
    pub fn new(a: Array2<f64>) -> Result<Self> {
        if a.nrows() != a.ncols() || a.is_empty() {
            return Err(Error::Shape(format!(
                "system matrix must be square and non-empty, got {:?}",
                a.dim()
            )));
        }
        Ok(Self { a })
    }
}

impl OdeFunc for LinearCubicOdeFunc {
    fn dim(&self) -> usize {
        self.a.nrows()
    }

    fn derivative(&self, _t: f64, z: &ArrayView2<f64>) -> Result<Array2<f64>> {
        check_width(z, self.dim())?;
        Ok(z.mapv(|v| v * v * v).dot(&self.a))
    }
}

/// Pointwise nonlinearity between MLP layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    Identity,
    Sigmoid,
    #[default]
    Tanh,
    Relu,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Identity => x,
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
        }
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(Activation::Identity),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::Relu),
            other => Err(Error::Unsupported(format!(
                "activation `{other}` is not supported, must be one of identity, sigmoid, tanh, relu"
            ))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Activation::Identity => "identity",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Relu => "relu",
        };
        f.write_str(s)
    }
}

/// Two-layer MLP vector field, `D → H → D`.
///
/// Weights are drawn from `N(0, 0.1²)`, biases start at zero.
#[derive(Debug, Clone)]
pub struct MlpOdeFunc {
    /// `(D, H)`
    pub w1: Array2<f64>,
    pub b1: Array1<f64>,
    /// `(H, D)`
    pub w2: Array2<f64>,
    pub b2: Array1<f64>,
    pub activation: Activation,
    /// Feed `z³` instead of `z` into the first layer.
    pub cube_input: bool,
}

impl MlpOdeFunc {
    pub fn new(
        dim: usize,
        hidden: usize,
        activation: Activation,
        cube_input: bool,
        seed: u64,
    ) -> Result<Self> {
        if dim == 0 || hidden == 0 {
            return Err(Error::Shape(format!(
                "mlp dims must be >= 1, got dim={dim} hidden={hidden}"
            )));
        }
        let normal = Normal::new(0.0, 0.1).map_err(|e| Error::Domain(format!("normal init: {e}")))?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let w1 = Array2::from_shape_fn((dim, hidden), |_| normal.sample(&mut rng));
        let w2 = Array2::from_shape_fn((hidden, dim), |_| normal.sample(&mut rng));
        Ok(Self {
            w1,
            b1: Array1::zeros(hidden),
            w2,
            b2: Array1::zeros(dim),
            activation,
            cube_input,
        })
    }

    pub fn num_learnable_scalars(&self) -> usize {
        self.w1.len() + self.b1.len() + self.w2.len() + self.b2.len()
    }
}

impl OdeFunc for MlpOdeFunc {
    fn dim(&self) -> usize {
        self.w1.nrows()
    }

    fn derivative(&self, _t: f64, z: &ArrayView2<f64>) -> Result<Array2<f64>> {
        check_width(z, self.dim())?;
        let x = if self.cube_input {
            z.mapv(|v| v * v * v)
        } else {
            z.to_owned()
        };
        let act = self.activation;
        let h = (x.dot(&self.w1) + &self.b1).mapv(|v| act.apply(v));
        Ok(h.dot(&self.w2) + &self.b2)
    }
}
