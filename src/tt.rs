//! Fixed-rank tensor train over a sequence of basis modes.
//!
//! A tensor of order `N` with dims `[out_dim, m_1, ..., m_{N-1}]` is stored as `N - 1` cores:
//!
//! - first: `G0` with shape `(m_1, r)`
//! - middle: `Gi` with shape `(r, m_{i+1}, r)` (zero or more)
//! - last: `G_last` with shape `(r, m_{N-1}, out_dim)`
//!
//! Contracting the train with one basis vector per mode gives an `out_dim` vector:
//! \[
//! y_l = \sum_{i_1..i_{N-1}} \phi_1[j_1] G_0[j_1, i_1]\, \phi_2[j_2] G_1[i_1, j_2, i_2] \cdots
//!       \phi_{N-1}[j_{N-1}] G_{last}[i_{N-2}, j_{N-1}, l].
//! \]
//! Contraction runs left to right, mode 1 first. The order matters: each step folds the running
//! `(batch, r)` state into the next core slice.

use std::fmt;

use crate::{Error, Result};
use ndarray::{Array2, Array3, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Uniform};

/// Uniform initialisation range `[low, high)` for core entries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformInit {
    pub low: f64,
    pub high: f64,
}

impl Default for UniformInit {
    fn default() -> Self {
        Self {
            low: 0.01,
            high: 0.05,
        }
    }
}

impl UniformInit {
    pub(crate) fn distribution(&self) -> Result<Uniform<f64>> {
        if !self.low.is_finite() || !self.high.is_finite() || self.low >= self.high {
            return Err(Error::Domain(format!(
                "uniform init needs finite low < high, got [{}, {})",
                self.low, self.high
            )));
        }
        Uniform::new(self.low, self.high).map_err(|e| Error::Domain(format!("uniform init: {e}")))
    }
}

/// One core of the train, tagged by its position.
#[derive(Debug, Clone, PartialEq)]
pub enum TtCore {
    /// `(basis_dim, rank)`
    First(Array2<f64>),
    /// `(rank, basis_dim, rank)`
    Middle(Array3<f64>),
    /// `(rank, basis_dim, out_dim)`
    Last(Array3<f64>),
}

impl TtCore {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            TtCore::First(g) => g.shape().to_vec(),
            TtCore::Middle(g) | TtCore::Last(g) => g.shape().to_vec(),
        }
    }

    /// Length of the axis contracted against the basis vector.
    pub fn basis_dim(&self) -> usize {
        match self {
            TtCore::First(g) => g.nrows(),
            TtCore::Middle(g) | TtCore::Last(g) => g.dim().1,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TtCore::First(g) => g.len(),
            TtCore::Middle(g) | TtCore::Last(g) => g.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frobenius norm.
    pub fn norm(&self) -> f64 {
        let sq: f64 = match self {
            TtCore::First(g) => g.iter().map(|v| v * v).sum(),
            TtCore::Middle(g) | TtCore::Last(g) => g.iter().map(|v| v * v).sum(),
        };
        sq.sqrt()
    }

    fn values(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            TtCore::First(g) => Box::new(g.iter().copied()),
            TtCore::Middle(g) | TtCore::Last(g) => Box::new(g.iter().copied()),
        }
    }

    fn scale(&mut self, s: f64) {
        match self {
            TtCore::First(g) => *g *= s,
            TtCore::Middle(g) | TtCore::Last(g) => *g *= s,
        }
    }

    /// `self -= lr * grad`. Shapes are checked by the caller.
    fn axpy_neg(&mut self, lr: f64, grad: &TtCore) {
        match (self, grad) {
            (TtCore::First(g), TtCore::First(d)) => g.scaled_add(-lr, d),
            (TtCore::Middle(g), TtCore::Middle(d)) | (TtCore::Last(g), TtCore::Last(d)) => {
                g.scaled_add(-lr, d)
            }
            _ => unreachable!("gradient core kind always matches its parameter core"),
        }
    }
}

/// Per-batch `(r, m)` slices of a 3-way core contracted with its basis vectors:
/// `S[b, i, k] = Σ_j G[i, j, k] φ[b, j]`.
fn core_slices(core: &Array3<f64>, phi: &ArrayView2<f64>) -> Array3<f64> {
    let (ri, m, rk) = core.dim();
    let batch = phi.nrows();
    let mut s = Array3::<f64>::zeros((batch, ri, rk));
    for b in 0..batch {
        for i in 0..ri {
            for j in 0..m {
                let p = phi[[b, j]];
                if p == 0.0 {
                    continue;
                }
                for k in 0..rk {
                    s[[b, i, k]] += core[[i, j, k]] * p;
                }
            }
        }
    }
    s
}

/// `out[b, k] = Σ_i h[b, i] S[b, i, k]`.
fn fold_into_slices(h: &Array2<f64>, s: &Array3<f64>) -> Array2<f64> {
    let (batch, ri, rk) = s.dim();
    let mut out = Array2::<f64>::zeros((batch, rk));
    for b in 0..batch {
        for i in 0..ri {
            let hi = h[[b, i]];
            for k in 0..rk {
                out[[b, k]] += hi * s[[b, i, k]];
            }
        }
    }
    out
}

/// Intermediates kept from a forward contraction, needed for the core gradients.
struct Forward {
    /// `hs[i]` is the running `(batch, r)` state after core `i` (last core excluded).
    hs: Vec<Array2<f64>>,
    /// Slices of cores `1..n` (middle and last), in core order.
    slices: Vec<Array3<f64>>,
    out: Array2<f64>,
}

/// A tensor train with one fixed rank shared by every bond.
#[derive(Debug, Clone)]
pub struct TensorTrainFixedRank {
    cores: Vec<TtCore>,
    trainable: Vec<bool>,
    rank: usize,
    out_dim: usize,
}

impl TensorTrainFixedRank {
    /// Allocate and uniformly initialise the cores for `dims = [out_dim, m_1, ..., m_{N-1}]`.
    ///
    /// Entries are drawn in core order (row-major within each core) from a `ChaCha8Rng` seeded
    /// with `seed`, so equal inputs give bit-identical cores.
    pub fn new(dims: &[usize], rank: usize, init: UniformInit, seed: u64) -> Result<Self> {
        let order = dims.len();
        if order < 3 {
            return Err(Error::Shape(format!(
                "tensor-train order must be >= 3 (out_dim + at least two modes), got dims {dims:?}"
            )));
        }
        if dims.contains(&0) {
            return Err(Error::Shape(format!("all dims must be >= 1, got {dims:?}")));
        }
        if rank == 0 {
            return Err(Error::Shape("tensor-train rank must be >= 1, got 0".into()));
        }

        let dist = init.distribution()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let out_dim = dims[0];

        let mut cores = Vec::with_capacity(order - 1);
        cores.push(TtCore::First(Array2::from_shape_fn((dims[1], rank), |_| {
            dist.sample(&mut rng)
        })));
        for &m in &dims[2..order - 1] {
            cores.push(TtCore::Middle(Array3::from_shape_fn((rank, m, rank), |_| {
                dist.sample(&mut rng)
            })));
        }
        cores.push(TtCore::Last(Array3::from_shape_fn(
            (rank, dims[order - 1], out_dim),
            |_| dist.sample(&mut rng),
        )));
        debug_assert_eq!(cores.len(), order - 1);

        Self::from_cores(cores, out_dim)
    }

    /// Build a train from explicit cores.
    ///
    /// Requires `First, Middle*, Last` in that order with one consistent rank and a last core whose
    /// trailing axis is `out_dim`.
    pub fn from_cores(cores: Vec<TtCore>, out_dim: usize) -> Result<Self> {
        let n = cores.len();
        if n < 2 {
            return Err(Error::Shape(format!(
                "a tensor train needs at least 2 cores (first + last), got {n}"
            )));
        }
        let rank = match &cores[0] {
            TtCore::First(g) => g.ncols(),
            other => {
                return Err(Error::Shape(format!(
                    "core 0 must be a 2-way first core, got shape {:?}",
                    other.shape()
                )))
            }
        };
        for (idx, core) in cores.iter().enumerate().skip(1) {
            match core {
                TtCore::Middle(g) if idx < n - 1 => {
                    let (ri, _, rk) = g.dim();
                    if ri != rank || rk != rank {
                        return Err(Error::Shape(format!(
                            "middle core {idx} must be ({rank}, m, {rank}), got {:?}",
                            g.shape()
                        )));
                    }
                }
                TtCore::Last(g) if idx == n - 1 => {
                    let (ri, _, o) = g.dim();
                    if ri != rank || o != out_dim {
                        return Err(Error::Shape(format!(
                            "last core must be ({rank}, m, {out_dim}), got {:?}",
                            g.shape()
                        )));
                    }
                }
                other => {
                    return Err(Error::Shape(format!(
                        "core {idx} of {n} has the wrong position tag (shape {:?})",
                        other.shape()
                    )))
                }
            }
        }
        if cores.iter().any(TtCore::is_empty) {
            return Err(Error::Shape("cores must be non-empty".into()));
        }

        Ok(Self {
            trainable: vec![true; n],
            cores,
            rank,
            out_dim,
        })
    }

    pub fn cores(&self) -> &[TtCore] {
        &self.cores
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Tensor order `N` (number of cores + 1).
    pub fn order(&self) -> usize {
        self.cores.len() + 1
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.cores.iter().map(TtCore::shape).collect()
    }

    /// Sum of the Frobenius norms of all cores (not of the full tensor).
    pub fn norm(&self) -> f64 {
        self.cores.iter().map(TtCore::norm).sum()
    }

    pub fn freeze(&mut self, idx: usize) -> Result<()> {
        self.set_trainable(idx, false)
    }

    pub fn unfreeze(&mut self, idx: usize) -> Result<()> {
        self.set_trainable(idx, true)
    }

    fn set_trainable(&mut self, idx: usize, on: bool) -> Result<()> {
        let n = self.cores.len();
        let slot = self
            .trainable
            .get_mut(idx)
            .ok_or_else(|| Error::Shape(format!("core index {idx} out of range for {n} cores")))?;
        *slot = on;
        Ok(())
    }

    /// True when every core is trainable.
    pub fn is_trainable(&self) -> bool {
        self.trainable.iter().all(|&t| t)
    }

    pub fn is_core_trainable(&self, idx: usize) -> bool {
        self.trainable.get(idx).copied().unwrap_or(false)
    }

    pub fn num_learnable_scalars(&self) -> usize {
        self.cores
            .iter()
            .zip(&self.trainable)
            .filter(|(_, &t)| t)
            .map(|(c, _)| c.len())
            .sum()
    }

    /// Trainable core entries concatenated in core order.
    pub fn flatten(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.num_learnable_scalars());
        for (core, &t) in self.cores.iter().zip(&self.trainable) {
            if t {
                out.extend(core.values());
            }
        }
        out
    }

    fn check_basis(&self, phi: &[Array2<f64>]) -> Result<usize> {
        if phi.len() != self.cores.len() {
            return Err(Error::Shape(format!(
                "number of basis tensors must equal number of cores: {} != {}",
                phi.len(),
                self.cores.len()
            )));
        }
        let batch = phi[0].nrows();
        for (idx, (core, p)) in self.cores.iter().zip(phi).enumerate() {
            if p.nrows() != batch {
                return Err(Error::Shape(format!(
                    "basis {idx} has batch {} but basis 0 has batch {batch}",
                    p.nrows()
                )));
            }
            if p.ncols() != core.basis_dim() {
                return Err(Error::Shape(format!(
                    "basis {idx} has {} features but core {idx} expects {}",
                    p.ncols(),
                    core.basis_dim()
                )));
            }
        }
        Ok(batch)
    }

    fn forward(&self, phi: &[Array2<f64>]) -> Result<Forward> {
        self.check_basis(phi)?;
        let n = self.cores.len();

        // first core: h[b, k] = Σ_j φ0[b, j] G0[j, k]
        let mut h = match &self.cores[0] {
            TtCore::First(g) => phi[0].dot(g),
            _ => unreachable!("core 0 is validated as First"),
        };
        let mut hs = Vec::with_capacity(n - 1);
        let mut slices = Vec::with_capacity(n - 1);

        for i in 1..n - 1 {
            let s = match &self.cores[i] {
                TtCore::Middle(g) => core_slices(g, &phi[i].view()),
                _ => unreachable!("inner cores are validated as Middle"),
            };
            let next = fold_into_slices(&h, &s);
            hs.push(std::mem::replace(&mut h, next));
            slices.push(s);
        }

        let s = match &self.cores[n - 1] {
            TtCore::Last(g) => core_slices(g, &phi[n - 1].view()),
            _ => unreachable!("final core is validated as Last"),
        };
        let out = fold_into_slices(&h, &s);
        hs.push(h);
        slices.push(s);

        if out.ncols() != self.out_dim {
            return Err(Error::Shape(format!(
                "output size must equal out_dim: {} != {}",
                out.ncols(),
                self.out_dim
            )));
        }
        Ok(Forward { hs, slices, out })
    }

    /// Contract the train with one basis matrix per mode, returning `(batch, out_dim)`.
    ///
    /// `phi[i]` is `(batch, basis_dim_i)`. The time mode is simply the last entry of `phi`.
    pub fn evaluate(&self, phi: &[Array2<f64>]) -> Result<Array2<f64>> {
        Ok(self.forward(phi)?.out)
    }

    /// Gradients of `Σ_{b,l} upstream[b, l] · y[b, l]` with respect to every core.
    ///
    /// Frozen cores get `None`.
    pub fn grad_cores(
        &self,
        phi: &[Array2<f64>],
        upstream: &ArrayView2<f64>,
    ) -> Result<Vec<Option<TtCore>>> {
        let fwd = self.forward(phi)?;
        if upstream.dim() != fwd.out.dim() {
            return Err(Error::Shape(format!(
                "upstream gradient must be {:?}, got {:?}",
                fwd.out.dim(),
                upstream.dim()
            )));
        }
        Ok(self.backward(phi, &fwd, upstream))
    }

    fn backward(
        &self,
        phi: &[Array2<f64>],
        fwd: &Forward,
        upstream: &ArrayView2<f64>,
    ) -> Vec<Option<TtCore>> {
        let n = self.cores.len();
        let batch = upstream.nrows();
        let mut grads: Vec<Option<TtCore>> = vec![None; n];

        // g carries dL/dh for the running state entering core `i`.
        let mut g = upstream.to_owned();
        for i in (1..n).rev() {
            let h = &fwd.hs[i - 1];
            let s = &fwd.slices[i - 1];
            let (_, ri, rk) = s.dim();
            let m = phi[i].ncols();

            if self.trainable[i] {
                // dG[a, j, c] = Σ_b h[b, a] g[b, c] φ[b, j]
                let mut dg = Array3::<f64>::zeros((ri, m, rk));
                for b in 0..batch {
                    for a in 0..ri {
                        let ha = h[[b, a]];
                        for j in 0..m {
                            let w = ha * phi[i][[b, j]];
                            if w == 0.0 {
                                continue;
                            }
                            for c in 0..rk {
                                dg[[a, j, c]] += w * g[[b, c]];
                            }
                        }
                    }
                }
                grads[i] = Some(if i == n - 1 {
                    TtCore::Last(dg)
                } else {
                    TtCore::Middle(dg)
                });
            }

            // dL/dh_prev[b, a] = Σ_c S[b, a, c] g[b, c]
            let mut prev = Array2::<f64>::zeros((batch, ri));
            for b in 0..batch {
                for a in 0..ri {
                    let mut acc = 0.0;
                    for c in 0..rk {
                        acc += s[[b, a, c]] * g[[b, c]];
                    }
                    prev[[b, a]] = acc;
                }
            }
            g = prev;
        }

        if self.trainable[0] {
            grads[0] = Some(TtCore::First(phi[0].t().dot(&g)));
        }
        grads
    }

    /// One SGD step on `½ · mean_b ‖y_b − target_b‖²`. Returns the loss before the step.
    ///
    /// Frozen cores are left untouched.
    pub fn sgd_step(&mut self, phi: &[Array2<f64>], target: &ArrayView2<f64>, lr: f64) -> Result<f64> {
        self.sgd_step_regularized(phi, target, lr, 0.0)
    }

    /// One SGD step on `½ · mean_b ‖y_b − target_b‖² + λ · norm()`.
    ///
    /// The penalty gradient of a core `G` is `λ · G / ‖G‖`; cores with zero norm get none.
    /// Returns the regularized loss before the step.
    pub fn sgd_step_regularized(
        &mut self,
        phi: &[Array2<f64>],
        target: &ArrayView2<f64>,
        lr: f64,
        lambda: f64,
    ) -> Result<f64> {
        if !lr.is_finite() {
            return Err(Error::Domain(format!("lr must be finite, got {lr}")));
        }
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(Error::Domain(format!(
                "lambda must be finite and >= 0, got {lambda}"
            )));
        }
        let fwd = self.forward(phi)?;
        if target.dim() != fwd.out.dim() {
            return Err(Error::Shape(format!(
                "target must be {:?}, got {:?}",
                fwd.out.dim(),
                target.dim()
            )));
        }
        let batch = target.nrows() as f64;
        let resid = &fwd.out - target;
        let loss = 0.5 * resid.iter().map(|r| r * r).sum::<f64>() / batch + lambda * self.norm();
        let upstream = resid / batch;

        let grads = self.backward(phi, &fwd, &upstream.view());
        for (core, grad) in self.cores.iter_mut().zip(&grads) {
            if let Some(d) = grad {
                let n = core.norm();
                if lambda > 0.0 && n > 0.0 {
                    core.scale(1.0 - lr * lambda / n);
                }
                core.axpy_neg(lr, d);
            }
        }
        Ok(loss)
    }
}

impl fmt::Display for TensorTrainFixedRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TensorTrainFixedRank(order={}, rank={}, out_dim={}, shapes={:?})",
            self.order(),
            self.rank,
            self.out_dim,
            self.shapes()
        )
    }
}
