//! Polynomial basis expansion of the augmented state `[z, t]`.
//!
//! Each scalar of the augmented state becomes one tensor-train mode:
//! \[
//! \phi(x) = [x^0, x^1, \dots, x^d].
//! \]
//!
//! Mode order is fixed: the `Dz` state components first (in their original order), time last.
//! Cores in [`crate::tt::TensorTrainFixedRank`] are declared in the same order.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Which basis family to expand the augmented state in.
///
/// Only polynomials are implemented; any other name is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BasisKind {
    #[default]
    Poly,
}

impl FromStr for BasisKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "poly" => Ok(BasisKind::Poly),
            other => Err(Error::Unsupported(format!(
                "basis `{other}` is not supported, only `poly`"
            ))),
        }
    }
}

impl fmt::Display for BasisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasisKind::Poly => f.write_str("poly"),
        }
    }
}

/// Powers `x^0..=x^degree` of every entry of `x`, as a `(len, degree + 1)` matrix.
fn powers(x: &ArrayView1<f64>, degree: usize) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((x.len(), degree + 1));
    for (b, &xb) in x.iter().enumerate() {
        let mut p = 1.0f64;
        out[[b, 0]] = p;
        for k in 1..=degree {
            p *= xb;
            out[[b, k]] = p;
        }
    }
    out
}

/// Polynomial basis of a batch of states and a shared scalar time.
///
/// - `z`: `(batch, Dz)`
/// - `t`: time, broadcast over the batch
/// - returns `Dz + 1` matrices, each `(batch, degree + 1)`
///
/// `degree = 0` yields all-ones features for every mode.
pub fn poly_basis(z: &ArrayView2<f64>, t: f64, degree: usize) -> Result<Vec<Array2<f64>>> {
    let (batch, dz) = z.dim();
    if batch == 0 {
        return Err(Error::Domain("basis expansion needs a non-empty batch".into()));
    }
    if dz == 0 {
        return Err(Error::Shape("state dimension must be >= 1, got 0".into()));
    }

    let mut phi = Vec::with_capacity(dz + 1);
    for col in z.columns() {
        phi.push(powers(&col, degree));
    }
    let ts = ndarray::Array1::from_elem(batch, t);
    phi.push(powers(&ts.view(), degree));
    Ok(phi)
}

/// Dispatch on [`BasisKind`].
pub fn expand(kind: BasisKind, z: &ArrayView2<f64>, t: f64, degree: usize) -> Result<Vec<Array2<f64>>> {
    match kind {
        BasisKind::Poly => poly_basis(z, t, degree),
    }
}
