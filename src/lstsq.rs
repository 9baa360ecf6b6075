//! Online least-squares system identification (an alternative to backprop).
//!
//! The forward pass integrates `dz/dt = f(t, z)` with explicit Euler and keeps the whole
//! trajectory. Instead of differentiating through it, the backward pass:
//!
//! 1. nudges the final state against the loss gradient, `z_T' = z_T − lr · ∂L/∂z_T`,
//! 2. takes first differences of the corrected trajectory over the mean step `h̄`,
//! 3. solves
//!    \[
//!    \min_A \big\| \psi(Z_{0..T-1}) A - \tfrac{1}{\bar h}\Delta Z \big\|_F^2
//!    \]
//!    with `ψ(z) = z³` by default,
//! 4. writes `A` into [`SystemIdParams::system_matrix`] and returns no input gradient.
//!
//! The caller then mixes the fit with the previous matrix ([`blend`]) and assigns it back before
//! the next forward pass. This is a two-call API: `forward` then `backward`, nothing is hooked
//! into an autodiff graph.

use std::fmt;

use crate::ode::{integrate, OdeMethod, TimeSpan, Trajectory};
use crate::ode_func::{LinearCubicOdeFunc, OdeFunc};
use crate::{Error, Result};
use nalgebra::{DMatrix, SVD};
use ndarray::{concatenate, Array2, ArrayView2, Axis};

/// Feature map applied to the states in the least-squares design matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemFeatures {
    /// `ψ(z) = z ∘ z ∘ z`, matching [`LinearCubicOdeFunc`].
    #[default]
    Cube,
    /// `ψ(z) = z`.
    Identity,
}

impl SystemFeatures {
    pub fn apply(self, z: &ArrayView2<f64>) -> Array2<f64> {
        match self {
            SystemFeatures::Cube => z.mapv(|v| v * v * v),
            SystemFeatures::Identity => z.to_owned(),
        }
    }
}

/// Hyperparameters of the least-squares rule.
#[derive(Debug, Clone)]
pub struct SystemIdConfig {
    /// Euler step size.
    pub step_size: f64,
    pub t_span: TimeSpan,
    /// Step used to correct the final state against `∂L/∂z_T`.
    pub lr: f64,
    /// Weight of the fresh fit in [`blend`].
    pub alpha: f64,
    pub features: SystemFeatures,
    /// Singular values below `rcond · σ_max` count as zero.
    pub rcond: f64,
    /// Condition numbers above this are logged as a warning.
    pub warn_cond: f64,
}

impl Default for SystemIdConfig {
    fn default() -> Self {
        Self {
            step_size: 0.05,
            t_span: TimeSpan::default(),
            lr: 0.01,
            alpha: 0.8,
            features: SystemFeatures::Cube,
            rcond: 1e-10,
            warn_cond: 1e8,
        }
    }
}

/// Mutable state shared between the forward pass, the backward pass and the training loop.
///
/// `backward` overwrites `system_matrix` with the raw fit; the training loop reads it, blends it
/// with the matrix it held before the forward pass, and writes the blend back.
pub struct SystemIdParams {
    pub step_size: f64,
    pub t_span: TimeSpan,
    pub system_matrix: Array2<f64>,
    /// Right-hand side to integrate. `None` integrates `(z ∘ z ∘ z) · system_matrix`.
    pub ode_func: Option<Box<dyn OdeFunc>>,
}

impl SystemIdParams {
    pub fn new(cfg: &SystemIdConfig, system_matrix: Array2<f64>) -> Result<Self> {
        if system_matrix.nrows() != system_matrix.ncols() || system_matrix.is_empty() {
            return Err(Error::Shape(format!(
                "system matrix must be square and non-empty, got {:?}",
                system_matrix.dim()
            )));
        }
        Ok(Self {
            step_size: cfg.step_size,
            t_span: cfg.t_span,
            system_matrix,
            ode_func: None,
        })
    }

    pub fn with_ode_func(mut self, f: Box<dyn OdeFunc>) -> Self {
        self.ode_func = Some(f);
        self
    }
}

impl fmt::Debug for SystemIdParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemIdParams")
            .field("step_size", &self.step_size)
            .field("t_span", &self.t_span)
            .field("system_matrix", &self.system_matrix)
            .field("external_ode_func", &self.ode_func.is_some())
            .finish()
    }
}

/// Integrate `x` with explicit Euler under `params`; returns `(z_T, trajectory)`.
pub fn euler_forward(x: &ArrayView2<f64>, params: &SystemIdParams) -> Result<(Array2<f64>, Trajectory)> {
    let traj = match &params.ode_func {
        Some(f) => integrate(OdeMethod::Euler, f.as_ref(), params.t_span, params.step_size, x)?,
        None => {
            let f = LinearCubicOdeFunc::new(params.system_matrix.clone())?;
            integrate(OdeMethod::Euler, &f, params.t_span, params.step_size, x)?
        }
    };
    let z_t = traj
        .last()
        .cloned()
        .ok_or_else(|| Error::Domain("integrator returned an empty trajectory".into()))?;
    Ok((z_t, traj))
}

/// Least-squares refit of the system matrix from a trajectory and `∂L/∂z_T`.
///
/// Returns `A` with shape `(D, D)` such that `ψ(z_k) A ≈ (z_{k+1} − z_k) / h̄` over all steps and
/// batch rows, where the last state is first replaced by `z_T − lr · ∂L/∂z_T`.
pub fn fit_linear_system(
    traj: &Trajectory,
    dl_dzt: &ArrayView2<f64>,
    cfg: &SystemIdConfig,
) -> Result<Array2<f64>> {
    if traj.len() < 2 {
        return Err(Error::Domain(format!(
            "least squares needs at least 2 trajectory states, got {}",
            traj.len()
        )));
    }
    if traj.times.len() != traj.states.len() {
        return Err(Error::Shape(format!(
            "trajectory has {} states but {} times",
            traj.states.len(),
            traj.times.len()
        )));
    }
    let n = traj.len();
    let z_t = &traj.states[n - 1];
    if dl_dzt.dim() != z_t.dim() {
        return Err(Error::Shape(format!(
            "loss gradient must match final state {:?}, got {:?}",
            z_t.dim(),
            dl_dzt.dim()
        )));
    }

    let mut z_t_prime = z_t.clone();
    z_t_prime.scaled_add(-cfg.lr, dl_dzt);

    // Non-uniform steps are averaged, not used per transition.
    let h = traj.mean_step()?;

    let mut xs = Vec::with_capacity(n - 1);
    let mut ys = Vec::with_capacity(n - 1);
    for k in 0..n - 1 {
        let next = if k + 1 == n - 1 {
            &z_t_prime
        } else {
            &traj.states[k + 1]
        };
        let cur = &traj.states[k];
        if cur.dim() != z_t.dim() || next.dim() != z_t.dim() {
            return Err(Error::Shape(format!(
                "trajectory state {k} has shape {:?}, expected {:?}",
                cur.dim(),
                z_t.dim()
            )));
        }
        xs.push(cfg.features.apply(&cur.view()));
        ys.push((next - cur) / h);
    }

    let x_views: Vec<_> = xs.iter().map(|a| a.view()).collect();
    let y_views: Vec<_> = ys.iter().map(|a| a.view()).collect();
    let x = concatenate(Axis(0), &x_views).map_err(|e| Error::Shape(e.to_string()))?;
    let y = concatenate(Axis(0), &y_views).map_err(|e| Error::Shape(e.to_string()))?;

    solve_lstsq(&x.view(), &y.view(), cfg.rcond, cfg.warn_cond)
}

/// `min_A ‖X A − Y‖_F` via SVD.
///
/// Fails with [`Error::Solve`] if `X` is not of full column rank (relative to `rcond`), or if
/// any input is non-finite.
pub fn solve_lstsq(
    x: &ArrayView2<f64>,
    y: &ArrayView2<f64>,
    rcond: f64,
    warn_cond: f64,
) -> Result<Array2<f64>> {
    let (rows, cols) = x.dim();
    if y.nrows() != rows {
        return Err(Error::Shape(format!(
            "design has {rows} rows but targets have {}",
            y.nrows()
        )));
    }
    if cols == 0 || y.ncols() == 0 {
        return Err(Error::Shape(format!(
            "empty least-squares problem: X {:?}, Y {:?}",
            x.dim(),
            y.dim()
        )));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(Error::Solve("design or targets contain non-finite values".into()));
    }

    let xm = DMatrix::from_fn(rows, cols, |i, j| x[[i, j]]);
    let ym = DMatrix::from_fn(rows, y.ncols(), |i, j| y[[i, j]]);

    let svd = SVD::try_new(xm, true, true, f64::EPSILON, 10_000)
        .ok_or_else(|| Error::Solve("SVD did not converge".into()))?;
    let sv = &svd.singular_values;
    let s_max = sv.iter().copied().fold(0.0f64, f64::max);
    let tol = rcond * s_max;
    let rank = sv.iter().filter(|&&s| s > tol).count();
    if s_max == 0.0 || rank < cols {
        return Err(Error::Solve(format!(
            "design matrix is rank deficient: rank {rank} < {cols} columns ({rows} rows)"
        )));
    }
    let s_min = sv.iter().copied().fold(f64::INFINITY, f64::min);
    let cond = s_max / s_min;
    if cond > warn_cond {
        log::warn!("least-squares design is poorly conditioned: cond={cond:.3e}");
    }

    let sol = svd
        .solve(&ym, tol)
        .map_err(|e| Error::Solve(e.to_string()))?;
    Ok(Array2::from_shape_fn((cols, y.ncols()), |(i, j)| sol[(i, j)]))
}

/// Convex mix `α · a_fit + (1 − α) · a_prev`.
pub fn blend(a_fit: &ArrayView2<f64>, a_prev: &ArrayView2<f64>, alpha: f64) -> Result<Array2<f64>> {
    if a_fit.dim() != a_prev.dim() {
        return Err(Error::Shape(format!(
            "cannot blend {:?} with {:?}",
            a_fit.dim(),
            a_prev.dim()
        )));
    }
    if !(0.0..=1.0).contains(&alpha) {
        return Err(Error::Domain(format!("alpha must be in [0, 1], got {alpha}")));
    }
    Ok(a_fit.mapv(|v| alpha * v) + &a_prev.mapv(|v| (1.0 - alpha) * v))
}

/// Gradients returned by [`EulerLstsq::backward`]: always `None` for both the input and the
/// params, since the update travels through [`SystemIdParams`] instead.
#[derive(Debug, Clone, PartialEq)]
pub struct InputGrads {
    pub x: Option<Array2<f64>>,
    pub params: Option<Array2<f64>>,
}

/// Forward/backward pair for the least-squares rule.
///
/// `forward` saves the trajectory; `backward` consumes it.
#[derive(Debug, Clone, Default)]
pub struct EulerLstsq {
    cfg: SystemIdConfig,
    saved: Option<Trajectory>,
}

impl EulerLstsq {
    pub fn new(cfg: SystemIdConfig) -> Self {
        Self { cfg, saved: None }
    }

    pub fn config(&self) -> &SystemIdConfig {
        &self.cfg
    }

    pub fn forward(&mut self, x: &ArrayView2<f64>, params: &SystemIdParams) -> Result<Array2<f64>> {
        let (z_t, traj) = euler_forward(x, params)?;
        self.saved = Some(traj);
        Ok(z_t)
    }

    /// Refit the system matrix into `params.system_matrix`.
    pub fn backward(
        &mut self,
        dl_dzt: &ArrayView2<f64>,
        params: &mut SystemIdParams,
    ) -> Result<InputGrads> {
        let traj = self
            .saved
            .take()
            .ok_or_else(|| Error::Domain("backward called without a saved forward trajectory".into()))?;
        let a_fit = fit_linear_system(&traj, dl_dzt, &self.cfg)?;
        if a_fit.dim() != params.system_matrix.dim() {
            return Err(Error::Shape(format!(
                "fitted matrix {:?} does not match system matrix {:?}",
                a_fit.dim(),
                params.system_matrix.dim()
            )));
        }
        log::debug!(
            "lstsq refit over {} states: |A_fit - A_old| = {:.4e}",
            traj.len(),
            frobenius(&(&a_fit - &params.system_matrix))
        );
        params.system_matrix = a_fit;
        Ok(InputGrads {
            x: None,
            params: None,
        })
    }
}

pub(crate) fn frobenius(a: &Array2<f64>) -> f64 {
    a.iter().map(|v| v * v).sum::<f64>().sqrt()
}
