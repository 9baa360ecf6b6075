//! Burn-backed (opt-in) MLP Neural ODE trained through autodiff.
//!
//! This module is **additive**: it provides the plain gradient-descent path for a
//! neural right-hand side without changing the default `ndarray`-only API surface.
//!
//! Current scope:
//! - A tiny vector field `BurnNodeMlp` (`Linear → tanh → Linear`) with `dz/dt = f(z)`.
//! - Explicit Euler unrolled on burn tensors, so `loss.backward()` differentiates through the
//!   whole solve.
//! - An adapter implementing [`OdeFunc`], so a trained field plugs into [`crate::ode::integrate`]
//!   and [`crate::lstsq::SystemIdParams::with_ode_func`].

use burn_core as burn;

use burn::module::Module;
use burn::tensor::activation::tanh;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_nn::{Linear, LinearConfig};
use burn_optim::{GradientsParams, LearningRate, Optimizer, SgdConfig};
use ndarray::{Array2, ArrayView2};

use crate::ode::TimeSpan;
use crate::ode_func::OdeFunc;
use crate::{Error, Result};

/// Default burn backend for training: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

/// A two-layer MLP vector field `R^d → R^d`.
#[derive(Module, Debug)]
pub struct BurnNodeMlp<B: Backend> {
    l1: Linear<B>,
    l2: Linear<B>,
}

impl<B: Backend> BurnNodeMlp<B> {
    pub fn new(device: &B::Device, d: usize, hidden: usize) -> Self {
        let l1 = LinearConfig::new(d, hidden).init(device);
        let l2 = LinearConfig::new(hidden, d).init(device);
        Self { l1, l2 }
    }

    /// `[batch, d] → [batch, d]`.
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        self.l2.forward(tanh(self.l1.forward(z)))
    }

    /// Explicit Euler over `span`, returning `z(t1)`.
    ///
    /// Uses the same step grid as [`TimeSpan::grid`].
    pub fn solve_euler(&self, z0: Tensor<B, 2>, span: TimeSpan, step_size: f64) -> Result<Tensor<B, 2>> {
        let ts = span.grid(step_size)?;
        let mut z = z0;
        for w in ts.windows(2) {
            let dt = (w[1] - w[0]) as f32;
            let v = self.forward(z.clone());
            z = z + v.mul_scalar(dt);
        }
        Ok(z)
    }
}

/// Training configuration for [`train_node_sgd`].
#[derive(Debug, Clone)]
pub struct BurnNodeConfig {
    pub hidden: usize,
    pub lr: LearningRate,
    pub epochs: usize,
    pub t_span: TimeSpan,
    pub step_size: f64,
}

impl Default for BurnNodeConfig {
    fn default() -> Self {
        Self {
            hidden: 50,
            lr: 1e-3,
            epochs: 100,
            t_span: TimeSpan::default(),
            step_size: 0.05,
        }
    }
}

fn ndarray_to_burn_2<B: Backend>(device: &B::Device, x: &ArrayView2<f64>) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    let flat: Vec<f32> = x.iter().map(|&v| v as f32).collect();
    Tensor::from_data(TensorData::new(flat, [n, d]), device)
}

fn burn_to_ndarray_2<B: Backend>(t: Tensor<B, 2>) -> Result<Array2<f64>> {
    let [n, d] = t.dims();
    let flat = t
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| Error::Domain(format!("burn tensor export failed: {e:?}")))?;
    Array2::from_shape_vec((n, d), flat.into_iter().map(f64::from).collect())
        .map_err(|e| Error::Shape(e.to_string()))
}

/// Full-batch SGD on `MSE(solve_euler(x), y)`; returns the model and the per-epoch losses.
pub fn train_node_sgd(
    device: &<BurnBackend as Backend>::Device,
    x: &ArrayView2<f64>,
    y: &ArrayView2<f64>,
    cfg: &BurnNodeConfig,
) -> Result<(BurnNodeMlp<BurnBackend>, Vec<f32>)> {
    if x.dim() != y.dim() {
        return Err(Error::Shape(format!(
            "x {:?} and y {:?} must have the same shape",
            x.dim(),
            y.dim()
        )));
    }
    if x.nrows() == 0 || cfg.hidden == 0 || cfg.epochs == 0 {
        return Err(Error::Domain(
            "need a non-empty batch, hidden >= 1 and epochs >= 1".into(),
        ));
    }

    let d = x.ncols();
    let mut model = BurnNodeMlp::<BurnBackend>::new(device, d, cfg.hidden);
    let mut optim = SgdConfig::new().init::<BurnBackend, BurnNodeMlp<BurnBackend>>();

    let xb = ndarray_to_burn_2::<BurnBackend>(device, x);
    let yb = ndarray_to_burn_2::<BurnBackend>(device, y);

    let mut losses = Vec::with_capacity(cfg.epochs);
    for epoch in 0..cfg.epochs {
        let pred = model.solve_euler(xb.clone(), cfg.t_span, cfg.step_size)?;
        let loss = (pred - yb.clone()).powf_scalar(2.0).mean();
        let value: f32 = loss.clone().into_scalar().elem();
        losses.push(value);
        log::debug!("burn node epoch {epoch}: loss={value:.6e}");

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(cfg.lr, model, grads);
    }
    Ok((model, losses))
}

/// [`OdeFunc`] adapter over a burn vector field.
pub struct BurnOdeFunc<B: Backend> {
    pub model: BurnNodeMlp<B>,
    pub device: B::Device,
    dim: usize,
}

impl<B: Backend> BurnOdeFunc<B> {
    pub fn new(model: BurnNodeMlp<B>, device: B::Device, dim: usize) -> Self {
        Self { model, device, dim }
    }
}

impl<B: Backend> OdeFunc for BurnOdeFunc<B> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn derivative(&self, _t: f64, z: &ArrayView2<f64>) -> Result<Array2<f64>> {
        if z.ncols() != self.dim {
            return Err(Error::Shape(format!(
                "state must have {} columns, got {}",
                self.dim,
                z.ncols()
            )));
        }
        let zb = ndarray_to_burn_2::<B>(&self.device, z);
        burn_to_ndarray_2(self.model.forward(zb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode::{integrate, OdeMethod};
    use ndarray::array;

    #[test]
    fn burn_node_shapes_smoke() {
        let device = <BurnBackend as Backend>::Device::default();
        let model = BurnNodeMlp::<BurnBackend>::new(&device, 3, 8);
        let z0 = ndarray_to_burn_2::<BurnBackend>(&device, &Array2::<f64>::ones((4, 3)).view());
        let z_t = model.solve_euler(z0, TimeSpan::default(), 0.1).unwrap();
        assert_eq!(z_t.dims(), [4, 3]);
    }

    #[test]
    fn burn_node_train_reduces_loss() {
        let device = <BurnBackend as Backend>::Device::default();
        let x = array![[0.5, -0.2], [0.1, 0.8], [-0.6, 0.4], [0.9, 0.9]];
        let y = x.mapv(|v| 0.5 * v);
        let cfg = BurnNodeConfig {
            hidden: 16,
            lr: 5e-2,
            epochs: 60,
            ..BurnNodeConfig::default()
        };
        let (_model, losses) = train_node_sgd(&device, &x.view(), &y.view(), &cfg).unwrap();
        assert_eq!(losses.len(), 60);
        assert!(losses[59] < losses[0], "loss {} -> {}", losses[0], losses[59]);
    }

    #[test]
    fn adapter_plugs_into_integrator() {
        let device = <BurnBackend as Backend>::Device::default();
        let model = BurnNodeMlp::<BurnBackend>::new(&device, 2, 8);
        let f = BurnOdeFunc::new(model, device, 2);
        let z0 = array![[0.3, -0.4]];
        let traj = integrate(OdeMethod::Euler, &f, TimeSpan::default(), 0.1, &z0.view()).unwrap();
        assert_eq!(traj.len(), 11);
        assert_eq!(traj.last().unwrap().dim(), (1, 2));
    }
}
