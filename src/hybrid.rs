//! Hybrid matrix Neural ODE: `z_T = EulerSolve(dz/dt = z³ A, z_0 = x)`.
//!
//! The system matrix `A` can be trained two ways:
//!
//! - [`OptMethod::Lstsq`]: forward with [`EulerLstsq`], refit `A` by least squares in the backward
//!   pass, then blend `A ← α A_fit + (1 − α) A_old`.
//! - [`OptMethod::GradDesc`]: exact gradient of the loss through the Euler recurrence, then SGD.
//!
//! Both use MSE on the final state, averaged over every entry.

use std::fmt;
use std::str::FromStr;

use crate::lstsq::{blend, frobenius, EulerLstsq, SystemIdConfig, SystemIdParams};
use crate::ode::{integrate, OdeMethod};
use crate::ode_func::LinearCubicOdeFunc;
use crate::tt::UniformInit;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::Distribution;

/// How the system matrix is optimised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptMethod {
    #[default]
    Lstsq,
    GradDesc,
}

impl FromStr for OptMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lstsq" => Ok(OptMethod::Lstsq),
            "graddesc" => Ok(OptMethod::GradDesc),
            other => Err(Error::Unsupported(format!(
                "unknown opt method `{other}`, expected `lstsq` or `graddesc`"
            ))),
        }
    }
}

impl fmt::Display for OptMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptMethod::Lstsq => f.write_str("lstsq"),
            OptMethod::GradDesc => f.write_str("graddesc"),
        }
    }
}

/// Configuration for [`HybridMatrixNeuralOde`].
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// State dimension `D`; `A` is `(D, D)`.
    pub dim: usize,
    pub opt_method: OptMethod,
    /// Solver settings, and the lstsq rule's `lr`/`alpha`.
    pub system_id: SystemIdConfig,
    /// SGD step for [`OptMethod::GradDesc`].
    pub sgd_lr: f64,
    pub init: UniformInit,
    pub seed: u64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            dim: 2,
            opt_method: OptMethod::Lstsq,
            system_id: SystemIdConfig::default(),
            sgd_lr: 1e-3,
            init: UniformInit {
                low: 0.001,
                high: 0.005,
            },
            seed: 42,
        }
    }
}

/// What one training step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Loss of the forward pass that preceded the update.
    pub loss: f64,
    /// `‖A_new − A_old‖_F`.
    pub update_norm: f64,
}

/// MSE over every entry and its gradient with respect to `pred`.
pub fn mse_with_grad(pred: &ArrayView2<f64>, target: &ArrayView2<f64>) -> Result<(f64, Array2<f64>)> {
    if pred.dim() != target.dim() {
        return Err(Error::Shape(format!(
            "prediction {:?} and target {:?} differ",
            pred.dim(),
            target.dim()
        )));
    }
    let n = pred.len() as f64;
    let resid = pred - target;
    let loss = resid.iter().map(|r| r * r).sum::<f64>() / n;
    Ok((loss, resid * (2.0 / n)))
}

#[derive(Debug)]
pub struct HybridMatrixNeuralOde {
    cfg: HybridConfig,
    params: SystemIdParams,
    rule: EulerLstsq,
}

impl HybridMatrixNeuralOde {
    pub fn new(cfg: HybridConfig) -> Result<Self> {
        if cfg.dim == 0 {
            return Err(Error::Shape("hybrid model dim must be >= 1, got 0".into()));
        }
        if !(0.0..=1.0).contains(&cfg.system_id.alpha) {
            return Err(Error::Domain(format!(
                "alpha must be in [0, 1], got {}",
                cfg.system_id.alpha
            )));
        }
        let dist = cfg.init.distribution()?;
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let a = Array2::from_shape_fn((cfg.dim, cfg.dim), |_| dist.sample(&mut rng));
        let params = SystemIdParams::new(&cfg.system_id, a)?;
        log::info!(
            "hybrid matrix ode: dim={} opt_method={} step_size={} t_span={:?}",
            cfg.dim,
            cfg.opt_method,
            params.step_size,
            params.t_span
        );
        Ok(Self {
            rule: EulerLstsq::new(cfg.system_id.clone()),
            cfg,
            params,
        })
    }

    pub fn config(&self) -> &HybridConfig {
        &self.cfg
    }

    pub fn system_matrix(&self) -> &Array2<f64> {
        &self.params.system_matrix
    }

    pub fn set_system_matrix(&mut self, a: Array2<f64>) -> Result<()> {
        if a.dim() != self.params.system_matrix.dim() {
            return Err(Error::Shape(format!(
                "system matrix must be {:?}, got {:?}",
                self.params.system_matrix.dim(),
                a.dim()
            )));
        }
        self.params.system_matrix = a;
        Ok(())
    }

    /// `z_T` for a batch `x` of shape `(batch, D)`.
    pub fn forward(&self, x: &ArrayView2<f64>) -> Result<Array2<f64>> {
        let f = LinearCubicOdeFunc::new(self.params.system_matrix.clone())?;
        let traj = integrate(
            OdeMethod::Euler,
            &f,
            self.params.t_span,
            self.params.step_size,
            x,
        )?;
        traj.last()
            .cloned()
            .ok_or_else(|| Error::Domain("integrator returned an empty trajectory".into()))
    }

    /// One optimisation step on `(x, y)` with the configured method.
    pub fn train_step(&mut self, x: &ArrayView2<f64>, y: &ArrayView2<f64>) -> Result<StepReport> {
        let report = match self.cfg.opt_method {
            OptMethod::Lstsq => self.lstsq_step(x, y)?,
            OptMethod::GradDesc => self.graddesc_step(x, y)?,
        };
        log::debug!(
            "{} step: loss={:.6e} |dA|={:.4e}",
            self.cfg.opt_method,
            report.loss,
            report.update_norm
        );
        Ok(report)
    }

    fn lstsq_step(&mut self, x: &ArrayView2<f64>, y: &ArrayView2<f64>) -> Result<StepReport> {
        let a_old = self.params.system_matrix.clone();
        let z_t = self.rule.forward(x, &self.params)?;
        let (loss, dl_dzt) = mse_with_grad(&z_t.view(), y)?;

        // backward writes the raw fit into params; read it back and blend with the old matrix.
        self.rule.backward(&dl_dzt.view(), &mut self.params)?;
        let a_fit = self.params.system_matrix.clone();
        let a_new = blend(&a_fit.view(), &a_old.view(), self.cfg.system_id.alpha)?;
        let update_norm = frobenius(&(&a_new - &a_old));
        self.params.system_matrix = a_new;

        Ok(StepReport { loss, update_norm })
    }

    fn graddesc_step(&mut self, x: &ArrayView2<f64>, y: &ArrayView2<f64>) -> Result<StepReport> {
        let (loss, grad) = self.loss_and_grad(x, y)?;
        let step = grad * self.cfg.sgd_lr;
        let update_norm = frobenius(&step);
        self.params.system_matrix -= &step;
        Ok(StepReport { loss, update_norm })
    }

    /// MSE of `z_T` against `y` and its exact gradient with respect to `A`.
    ///
    /// Reverse pass over `z_{k+1} = z_k + h_k (z_k ∘ z_k ∘ z_k) A`:
    /// \[
    /// \bar A \mathrel{+}= h_k (z_k^3)^\top \lambda_{k+1},\qquad
    /// \lambda_k = \lambda_{k+1} + h_k \big(\lambda_{k+1} A^\top\big) \circ 3 z_k^2.
    /// \]
    pub fn loss_and_grad(&self, x: &ArrayView2<f64>, y: &ArrayView2<f64>) -> Result<(f64, Array2<f64>)> {
        let a = &self.params.system_matrix;
        let f = LinearCubicOdeFunc::new(a.clone())?;
        let traj = integrate(
            OdeMethod::Euler,
            &f,
            self.params.t_span,
            self.params.step_size,
            x,
        )?;
        let z_t = traj
            .last()
            .ok_or_else(|| Error::Domain("integrator returned an empty trajectory".into()))?;
        let (loss, mut lambda) = mse_with_grad(&z_t.view(), y)?;

        let mut grad = Array2::<f64>::zeros(a.dim());
        for k in (0..traj.len() - 1).rev() {
            let z = &traj.states[k];
            let h = traj.times[k + 1] - traj.times[k];
            let cube = z.mapv(|v| v * v * v);
            grad.scaled_add(h, &cube.t().dot(&lambda));

            let back = lambda.dot(&a.t()) * &z.mapv(|v| 3.0 * v * v);
            lambda.scaled_add(h, &back);
        }
        Ok((loss, grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn data(a_true: &Array2<f64>, x: &Array2<f64>) -> Array2<f64> {
        let cfg = HybridConfig {
            dim: a_true.nrows(),
            ..HybridConfig::default()
        };
        let mut m = HybridMatrixNeuralOde::new(cfg).unwrap();
        m.set_system_matrix(a_true.clone()).unwrap();
        m.forward(&x.view()).unwrap()
    }

    #[test]
    fn opt_method_parsing() {
        assert_eq!("lstsq".parse::<OptMethod>().unwrap(), OptMethod::Lstsq);
        assert_eq!("graddesc".parse::<OptMethod>().unwrap(), OptMethod::GradDesc);
        assert!(matches!("adam".parse::<OptMethod>(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn init_is_seeded_and_in_range() {
        let a = HybridMatrixNeuralOde::new(HybridConfig::default()).unwrap();
        let b = HybridMatrixNeuralOde::new(HybridConfig::default()).unwrap();
        assert_eq!(a.system_matrix(), b.system_matrix());
        assert!(a.system_matrix().iter().all(|&v| (0.001..0.005).contains(&v)));
        assert_eq!(a.system_matrix().dim(), (2, 2));
    }

    #[test]
    fn mse_gradient_is_scaled_residual() {
        let (loss, g) = mse_with_grad(&array![[1.0, 2.0]].view(), &array![[0.0, 0.0]].view()).unwrap();
        assert!((loss - 2.5).abs() < 1e-12);
        assert_eq!(g, array![[1.0, 2.0]]);
    }

    #[test]
    fn adjoint_gradient_matches_finite_differences() {
        let cfg = HybridConfig {
            opt_method: OptMethod::GradDesc,
            ..HybridConfig::default()
        };
        let mut m = HybridMatrixNeuralOde::new(cfg).unwrap();
        m.set_system_matrix(array![[-0.4, 0.3], [0.2, -0.1]]).unwrap();
        let x = array![[0.9, -0.6], [0.5, 1.2]];
        let y = array![[0.2, 0.1], [-0.3, 0.4]];

        let (_, grad) = m.loss_and_grad(&x.view(), &y.view()).unwrap();
        let eps = 1e-6;
        for i in 0..2 {
            for j in 0..2 {
                let base = m.system_matrix().clone();
                let mut plus = base.clone();
                plus[[i, j]] += eps;
                let mut minus = base.clone();
                minus[[i, j]] -= eps;
                m.set_system_matrix(plus).unwrap();
                let (lp, _) = m.loss_and_grad(&x.view(), &y.view()).unwrap();
                m.set_system_matrix(minus).unwrap();
                let (lm, _) = m.loss_and_grad(&x.view(), &y.view()).unwrap();
                m.set_system_matrix(base).unwrap();
                let fd = (lp - lm) / (2.0 * eps);
                assert!(
                    (fd - grad[[i, j]]).abs() < 1e-7,
                    "dA[{i},{j}]: analytic {} vs fd {fd}",
                    grad[[i, j]]
                );
            }
        }
    }

    #[test]
    fn graddesc_reduces_loss() {
        let a_true = array![[-0.8, 0.4], [-0.2, -0.5]];
        let x = array![[0.9, -0.6], [0.5, 1.2], [-1.0, 0.3], [0.2, 0.7]];
        let y = data(&a_true, &x);

        let cfg = HybridConfig {
            opt_method: OptMethod::GradDesc,
            sgd_lr: 0.5,
            ..HybridConfig::default()
        };
        let mut m = HybridMatrixNeuralOde::new(cfg).unwrap();
        let first = m.train_step(&x.view(), &y.view()).unwrap().loss;
        let mut last = first;
        for _ in 0..300 {
            last = m.train_step(&x.view(), &y.view()).unwrap().loss;
        }
        assert!(last < 0.2 * first, "graddesc loss {first} -> {last}");
    }

    #[test]
    fn lstsq_step_blends_fit_with_previous() {
        let x = array![[0.9, -0.6], [0.5, 1.2], [-1.0, 0.3]];
        let y = array![[0.7, -0.5], [0.4, 0.9], [-0.8, 0.3]];
        let mut m = HybridMatrixNeuralOde::new(HybridConfig::default()).unwrap();
        let a_old = m.system_matrix().clone();

        // Reproduce the fit by hand through the public rule API.
        let cfg = m.config().system_id.clone();
        let params = SystemIdParams::new(&cfg, a_old.clone()).unwrap();
        let (z_t, traj) = crate::lstsq::euler_forward(&x.view(), &params).unwrap();
        let (_, g) = mse_with_grad(&z_t.view(), &y.view()).unwrap();
        let a_fit = crate::lstsq::fit_linear_system(&traj, &g.view(), &cfg).unwrap();

        m.train_step(&x.view(), &y.view()).unwrap();
        for ((new, fit), old) in m.system_matrix().iter().zip(a_fit.iter()).zip(a_old.iter()) {
            let expected = 0.8 * fit + 0.2 * old;
            assert!((new - expected).abs() < 1e-12);
        }
    }
}
