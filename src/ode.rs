//! Fixed-step ODE integrators over batched states.
//!
//! The right-hand side has the form
//! \[
//! \frac{dz}{dt} = f(t, z),
//! \]
//! where `z` is a `(batch, D)` matrix and `f` is any [`OdeFunc`].
//!
//! We keep this module tiny and deterministic: no adaptive stepping, no hidden tolerances.
//! Unlike a sampler, callers here need the whole path, so every step is recorded in a
//! [`Trajectory`].

use crate::ode_func::OdeFunc;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

/// Fixed-step ODE method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OdeMethod {
    /// Explicit Euler (1st order).
    #[default]
    Euler,
    /// Heun / explicit trapezoid / RK2 (2nd order).
    Heun,
}

/// Integration interval `[t0, t1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSpan {
    pub t0: f64,
    pub t1: f64,
}

impl Default for TimeSpan {
    fn default() -> Self {
        Self { t0: 0.0, t1: 1.0 }
    }
}

/// Upper bound on the number of steps [`TimeSpan::grid`] will lay out.
pub const MAX_STEPS: usize = 1 << 24;

impl TimeSpan {
    pub fn new(t0: f64, t1: f64) -> Self {
        Self { t0, t1 }
    }

    /// Step times `t0, t0 + h, ..., t1`; the last step is clipped to land on `t1`.
    pub fn grid(&self, step_size: f64) -> Result<Vec<f64>> {
        if !self.t0.is_finite() || !self.t1.is_finite() || self.t1 <= self.t0 {
            return Err(Error::Domain(format!(
                "time span must be finite with t0 < t1, got ({}, {})",
                self.t0, self.t1
            )));
        }
        if !step_size.is_finite() || step_size <= 0.0 {
            return Err(Error::Domain(format!(
                "step size must be finite and > 0, got {step_size}"
            )));
        }
        // Tolerate float noise in (t1 - t0) / h so that (0, 1) with h = 0.05 gives 20 steps.
        let ratio = (self.t1 - self.t0) / step_size;
        if !ratio.is_finite() || ratio > MAX_STEPS as f64 {
            return Err(Error::Domain(format!(
                "step size {step_size} needs {ratio:e} steps over ({}, {}), limit is {MAX_STEPS}",
                self.t0, self.t1
            )));
        }
        let steps = ((ratio - 1e-9).ceil() as usize).max(1);

        let mut ts = Vec::with_capacity(steps.saturating_add(1));
        for k in 0..steps {
            ts.push(self.t0 + k as f64 * step_size);
        }
        ts.push(self.t1);
        Ok(ts)
    }
}

/// States visited by an integrator together with their times.
///
/// `states[0]` is the initial state at `times[0] = t0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub states: Vec<Array2<f64>>,
    pub times: Vec<f64>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Final state `z(t1)`.
    pub fn last(&self) -> Option<&Array2<f64>> {
        self.states.last()
    }

    /// Mean spacing of `times`.
    ///
    /// Fixed-step grids make this exact, except a clipped final step is averaged in.
    pub fn mean_step(&self) -> Result<f64> {
        if self.times.len() < 2 {
            return Err(Error::Domain(format!(
                "need at least 2 time points for a step, got {}",
                self.times.len()
            )));
        }
        let n = (self.times.len() - 1) as f64;
        let total: f64 = self.times.windows(2).map(|w| w[1] - w[0]).sum();
        Ok(total / n)
    }
}

/// Integrate `f` over `span` with fixed steps, recording every state.
///
/// - `z0`: initial state, `(batch, D)`
/// - `step_size`: nominal step `h` (the final step may be shorter)
pub fn integrate<F>(
    method: OdeMethod,
    f: &F,
    span: TimeSpan,
    step_size: f64,
    z0: &ArrayView2<f64>,
) -> Result<Trajectory>
where
    F: OdeFunc + ?Sized,
{
    if z0.ncols() != f.dim() {
        return Err(Error::Shape(format!(
            "initial state has {} columns but the ODE function has dim {}",
            z0.ncols(),
            f.dim()
        )));
    }
    let times = span.grid(step_size)?;

    let mut states = Vec::with_capacity(times.len());
    let mut z = z0.to_owned();
    states.push(z.clone());

    for w in times.windows(2) {
        let (t, dt) = (w[0], w[1] - w[0]);
        match method {
            OdeMethod::Euler => {
                let v = f.derivative(t, &z.view())?;
                check_derivative(&v, &z)?;
                // z += dt * v
                z.scaled_add(dt, &v);
            }
            OdeMethod::Heun => {
                let v0 = f.derivative(t, &z.view())?;
                check_derivative(&v0, &z)?;

                // predictor
                let mut z_pred = z.clone();
                z_pred.scaled_add(dt, &v0);

                // corrector
                let v1 = f.derivative(t + dt, &z_pred.view())?;
                check_derivative(&v1, &z)?;
                z.scaled_add(0.5 * dt, &v0);
                z.scaled_add(0.5 * dt, &v1);
            }
        }
        states.push(z.clone());
    }

    Ok(Trajectory { states, times })
}

fn check_derivative(v: &Array2<f64>, z: &Array2<f64>) -> Result<()> {
    if v.dim() != z.dim() {
        return Err(Error::Shape(format!(
            "derivative shape {:?} must match state shape {:?}",
            v.dim(),
            z.dim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode_func::LinearCubicOdeFunc;
    use ndarray::array;
    use proptest::prelude::*;

    /// dz/dt = -z, one column per batch row.
    struct Decay {
        dim: usize,
    }

    impl OdeFunc for Decay {
        fn dim(&self) -> usize {
            self.dim
        }

        fn derivative(&self, _t: f64, z: &ArrayView2<f64>) -> Result<Array2<f64>> {
            Ok(z.mapv(|v| -v))
        }
    }

    /// Constant field, ignores the state.
    struct Constant {
        c: Array2<f64>,
    }

    impl OdeFunc for Constant {
        fn dim(&self) -> usize {
            self.c.ncols()
        }

        fn derivative(&self, _t: f64, _z: &ArrayView2<f64>) -> Result<Array2<f64>> {
            Ok(self.c.clone())
        }
    }

    #[test]
    fn default_span_and_step_give_twenty_steps() {
        let ts = TimeSpan::default().grid(0.05).unwrap();
        assert_eq!(ts.len(), 21);
        assert_eq!(ts[0], 0.0);
        assert_eq!(*ts.last().unwrap(), 1.0);
    }

    #[test]
    fn last_step_is_clipped_to_t1() {
        let ts = TimeSpan::new(0.0, 1.0).grid(0.3).unwrap();
        assert_eq!(ts.len(), 5);
        assert!((ts[3] - 0.9).abs() < 1e-12);
        assert_eq!(ts[4], 1.0);
    }

    #[test]
    fn invalid_spans_are_domain_errors() {
        assert!(matches!(TimeSpan::new(1.0, 0.0).grid(0.1), Err(Error::Domain(_))));
        assert!(matches!(TimeSpan::default().grid(0.0), Err(Error::Domain(_))));
        assert!(matches!(TimeSpan::default().grid(f64::NAN), Err(Error::Domain(_))));
    }

    #[test]
    fn tiny_steps_are_domain_errors_not_overflow() {
        assert!(matches!(TimeSpan::new(0.0, 1.0).grid(1e-300), Err(Error::Domain(_))));
        assert!(matches!(
            TimeSpan::new(0.0, 1.0).grid(f64::MIN_POSITIVE),
            Err(Error::Domain(_))
        ));
        assert!(matches!(TimeSpan::new(-1e300, 1e300).grid(1e-10), Err(Error::Domain(_))));
        assert!(TimeSpan::new(0.0, 1.0).grid(1e-6).is_ok());
    }

    #[test]
    fn heun_is_more_accurate_than_euler_on_dz_dt_eq_minus_z() {
        // ODE: dz/dt = -z, z(0)=1, exact z(1)=e^-1.
        let z0 = array![[1.0]];
        let exact = (-1.0f64).exp();
        let f = Decay { dim: 1 };

        let euler = integrate(OdeMethod::Euler, &f, TimeSpan::default(), 0.05, &z0.view()).unwrap();
        let heun = integrate(OdeMethod::Heun, &f, TimeSpan::default(), 0.05, &z0.view()).unwrap();

        let err_euler = (euler.last().unwrap()[[0, 0]] - exact).abs();
        let err_heun = (heun.last().unwrap()[[0, 0]] - exact).abs();
        assert!(
            err_heun < err_euler,
            "expected Heun to be more accurate: err_heun={err_heun} err_euler={err_euler}"
        );
    }

    #[test]
    fn euler_matches_the_recurrence() {
        let f = LinearCubicOdeFunc::new(array![[-1.0, 0.5], [0.0, -2.0]]).unwrap();
        let z0 = array![[0.4, -0.6], [1.0, 0.2]];
        let traj = integrate(OdeMethod::Euler, &f, TimeSpan::new(0.0, 0.3), 0.1, &z0.view()).unwrap();
        assert_eq!(traj.len(), 4);

        let mut z = z0.clone();
        for k in 0..3 {
            let cube = z.mapv(|v| v * v * v);
            z = &z + &(cube.dot(&f.a) * 0.1);
            for (a, b) in traj.states[k + 1].iter().zip(z.iter()) {
                assert!((a - b).abs() < 1e-12);
            }
        }
        assert!((traj.mean_step().unwrap() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn state_width_must_match_function_dim() {
        let f = Decay { dim: 3 };
        let z0 = array![[1.0, 2.0]];
        let r = integrate(OdeMethod::Euler, &f, TimeSpan::default(), 0.1, &z0.view());
        assert!(matches!(r, Err(Error::Shape(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_constant_field_is_exact_for_euler_and_heun(
            batch in 1usize..4,
            dim in 1usize..5,
            h in 1e-3f64..0.5,
            t0 in -2.0f64..2.0,
            len in 0.1f64..3.0,
            c in prop::collection::vec(-10.0f64..10.0, 16),
        ) {
            let c = Array2::from_shape_fn((batch, dim), |(b, k)| c[b * 4 + k]);
            let z0 = Array2::<f64>::zeros((batch, dim));
            let f = Constant { c: c.clone() };
            let span = TimeSpan::new(t0, t0 + len);

            for method in [OdeMethod::Euler, OdeMethod::Heun] {
                let traj = integrate(method, &f, span, h, &z0.view()).unwrap();
                prop_assert_eq!(traj.states.len(), traj.times.len());
                let end = traj.last().unwrap();
                for (e, ci) in end.iter().zip(c.iter()) {
                    let expected = len * ci;
                    prop_assert!((e - expected).abs() <= 1e-8 * (1.0 + expected.abs()) * traj.len() as f64);
                }
            }
        }
    }
}
