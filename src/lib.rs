//! # ttode
//!
//! Tensor-train Neural ODE right-hand sides, plus an online least-squares rule that refits a
//! linear system matrix from an explicit-Euler trajectory.
//!
//! This crate is intentionally small:
//!
//! - it implements the **ODE right-hand sides** (tensor-train, linear-cubic, small MLP),
//! - it implements a **fixed-step integrator** they plug into,
//! - it implements the **least-squares system identification** step that replaces backprop for
//!   the linear model,
//! - it does not provide datasets, a CLI, or an experiment runner.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every constructor that draws random numbers takes `seed`.
//! - **Shapes are checked at the boundary**: a bad basis/core/output shape is an
//!   [`Error::Shape`], never a panic.
//! - **No hidden fallbacks**: a rank-deficient least-squares problem is an [`Error::Solve`].
//! - **Backend-agnostic by default**: the default feature set is `ndarray` + `nalgebra` only.
//!   The `burn` backend is **feature-gated**.
//!
//! ## The tensor-train right-hand side
//!
//! For a latent state \(z \in \mathbb{R}^{D_z}\) and time \(t\), the derivative is
//!
//! \[
//! \frac{dz}{dt} = \mathcal{A} \times_1 \phi(z_1) \times_2 \cdots \times_{D_z} \phi(z_{D_z})
//!   \times_{D_z+1} \phi(t),
//! \]
//!
//! where \(\phi(x) = [1, x, \dots, x^d]\) and \(\mathcal{A}\) is stored as a fixed-rank tensor
//! train `G0 (d+1, r)`, `Gi (r, d+1, r)`, `G_last (r, d+1, D_z)`.
//!
//! ## Module map
//!
//! - `basis`: polynomial basis expansion of `[z, t]`
//! - `tt`: fixed-rank tensor-train cores and their contraction
//! - `ode_func`: ODE right-hand sides (`TensorTrainOdeFunc`, `LinearCubicOdeFunc`, `MlpOdeFunc`)
//! - `ode`: fixed-step integrators producing a full `Trajectory`
//! - `lstsq`: online least-squares refit of the system matrix (alternative to backprop)
//! - `hybrid`: the hybrid matrix Neural ODE, trainable by `lstsq` or `graddesc`
//! - `burn_node` (feature `burn`): autodiff-trained MLP Neural ODE

pub mod basis;
pub mod hybrid;
pub mod lstsq;
pub mod ode;
pub mod ode_func;
pub mod tt;

#[cfg(feature = "burn")]
pub mod burn_node;

/// ttode error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error("least-squares solve failed: {0}")]
    Solve(String),
    #[error("domain error: {0}")]
    Domain(String),
}

pub type Result<T> = std::result::Result<T, Error>;
