use ndarray::{array, Array2, Array3};
use ttode::basis::poly_basis;
use ttode::ode::{integrate, OdeMethod, TimeSpan};
use ttode::ode_func::{OdeFunc, TensorTrainOdeFunc, TtOdeConfig, TtRank};
use ttode::tt::{TensorTrainFixedRank, TtCore, UniformInit};
use ttode::Error;

fn matvec_rows(h: &[f64], m: &Array2<f64>) -> Vec<f64> {
    (0..m.ncols())
        .map(|k| (0..h.len()).map(|i| h[i] * m[[i, k]]).sum())
        .collect()
}

/// Slice `Σ_j G[:, j, :] φ[j]` of a 3-way core for one basis vector.
fn slice(g: &Array3<f64>, phi: &[f64]) -> Array2<f64> {
    let (ri, m, rk) = g.dim();
    Array2::from_shape_fn((ri, rk), |(i, k)| (0..m).map(|j| g[[i, j, k]] * phi[j]).sum())
}

#[test]
fn two_dim_degree_one_rank_two_matches_manual_contraction() {
    let z = array![[0.5, 0.5]];
    let phi = poly_basis(&z.view(), 0.3, 1).unwrap();
    assert_eq!(phi, vec![array![[1.0, 0.5]], array![[1.0, 0.5]], array![[1.0, 0.3]]]);

    let g0 = Array2::<f64>::ones((2, 2));
    let g1 = Array3::<f64>::ones((2, 2, 2));
    let g2 = Array3::<f64>::ones((2, 2, 2));
    let tt = TensorTrainFixedRank::from_cores(
        vec![
            TtCore::First(g0.clone()),
            TtCore::Middle(g1.clone()),
            TtCore::Last(g2.clone()),
        ],
        2,
    )
    .unwrap();
    let y = tt.evaluate(&phi).unwrap();

    // Three matrix products, mode by mode.
    let h0 = matvec_rows(&[1.0, 0.5], &g0);
    let h1 = matvec_rows(&h0, &slice(&g1, &[1.0, 0.5]));
    let out = matvec_rows(&h1, &slice(&g2, &[1.0, 0.3]));

    assert_eq!(y.dim(), (1, 2));
    for k in 0..2 {
        assert!((y[[0, k]] - out[k]).abs() < 1e-12);
        assert!((y[[0, k]] - 11.7).abs() < 1e-12);
    }
}

#[test]
fn tt_ode_func_core_layout() {
    for (dz, d, r) in [(1usize, 0usize, 1usize), (2, 1, 2), (4, 3, 5)] {
        let cfg = TtOdeConfig {
            latent_dim: dz,
            poly_deg: d,
            rank: TtRank::Fixed(r),
            ..TtOdeConfig::default()
        };
        let f = TensorTrainOdeFunc::new(&cfg).unwrap();
        let shapes = f.tt().shapes();
        assert_eq!(shapes.len(), dz + 1);
        assert_eq!(shapes[0], vec![d + 1, r]);
        assert_eq!(shapes[dz], vec![r, d + 1, dz]);
        assert!(shapes[1..dz].iter().all(|s| *s == vec![r, d + 1, r]));
    }
}

#[test]
fn seeded_construction_is_bit_identical() {
    let cfg = TtOdeConfig {
        latent_dim: 3,
        poly_deg: 2,
        rank: TtRank::Fixed(3),
        init: UniformInit { low: -0.1, high: 0.1 },
        seed: 2024,
        ..TtOdeConfig::default()
    };
    let a = TensorTrainOdeFunc::new(&cfg).unwrap();
    let b = TensorTrainOdeFunc::new(&cfg).unwrap();
    let fa = a.tt().flatten();
    let fb = b.tt().flatten();
    assert_eq!(fa.len(), fb.len());
    assert!(fa.iter().zip(&fb).all(|(x, y)| x.to_bits() == y.to_bits()));
    assert_eq!(a.norm().to_bits(), b.norm().to_bits());
}

#[test]
fn unsupported_rank_fails_at_construction() {
    let cfg = TtOdeConfig {
        rank: TtRank::Adaptive,
        ..TtOdeConfig::default()
    };
    let err = TensorTrainOdeFunc::new(&cfg).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
    assert!(err.to_string().contains("fixed"));
}

#[test]
fn tt_ode_func_drives_the_integrator() {
    let cfg = TtOdeConfig {
        latent_dim: 2,
        poly_deg: 2,
        rank: TtRank::Fixed(2),
        init: UniformInit { low: -0.05, high: 0.05 },
        seed: 7,
        ..TtOdeConfig::default()
    };
    let f = TensorTrainOdeFunc::new(&cfg).unwrap();
    let z0 = array![[0.2, -0.1], [0.5, 0.3], [-0.4, 0.8]];

    for method in [OdeMethod::Euler, OdeMethod::Heun] {
        let traj = integrate(method, &f, TimeSpan::default(), 0.05, &z0.view()).unwrap();
        assert_eq!(traj.len(), 21);
        assert_eq!(traj.states[0], z0);
        let z_t = traj.last().unwrap();
        assert_eq!(z_t.dim(), (3, 2));
        assert!(z_t.iter().all(|v| v.is_finite()));
    }

    // A wrong-width state is rejected before any step is taken.
    let bad = array![[0.1, 0.2, 0.3]];
    assert!(matches!(
        integrate(OdeMethod::Euler, &f, TimeSpan::default(), 0.05, &bad.view()),
        Err(Error::Shape(_))
    ));
    assert_eq!(f.dim(), 2);
}

#[test]
fn tt_ode_func_learns_a_damped_field() {
    // Regress dz/dt = -z on a grid of states; time enters as a constant mode.
    let cfg = TtOdeConfig {
        latent_dim: 2,
        poly_deg: 1,
        rank: TtRank::Fixed(3),
        init: UniformInit { low: -0.3, high: 0.3 },
        seed: 17,
        ..TtOdeConfig::default()
    };
    let mut f = TensorTrainOdeFunc::new(&cfg).unwrap();
    let z = Array2::from_shape_fn((16, 2), |(b, k)| {
        let v = if k == 0 { b % 4 } else { b / 4 };
        v as f64 / 3.0 - 0.5
    });
    let target = z.mapv(|v| -v);

    let first = f.sgd_step(0.0, &z.view(), &target.view(), 0.1).unwrap();
    let mut last = first;
    for _ in 0..4000 {
        last = f.sgd_step(0.0, &z.view(), &target.view(), 0.1).unwrap();
    }
    assert!(last < 0.25 * first, "loss {first} -> {last}");
}
