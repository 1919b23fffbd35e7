use ixsum::ixsum;
use ndarray::{array, Array1, Array2};

#[test]
fn matmul_adjoints() {
    let a = array![[1.0, 2.0]];
    let b = array![[3.0], [4.0]];
    ixsum!(grad = symbolic, z[i, k] := a[i, j] * b[j, k]);
    assert_eq!(z, array![[11.0]]);

    // loss = sum(z), so the adjoint is all ones
    let dz = Array2::<f64>::ones(z.dim());
    let (da, db) = z_grad(&dz);
    assert_eq!(da, array![[3.0, 4.0]]);
    assert_eq!(db, array![[1.0], [2.0]]);
}

#[test]
fn square_sum_gradient() {
    let a = array![1.0, 2.0, 3.0];
    ixsum!(grad = symbolic, s := a[i] * a[i]);
    assert_eq!(s, 14.0);
    let da = s_grad(&1.0);
    assert_eq!(da, array![2.0, 4.0, 6.0]);
}

#[test]
fn dual_agrees_with_symbolic() {
    let a = array![[0.5, -1.0], [2.0, 0.25]];
    let b = array![[1.5, 0.0], [-0.5, 3.0]];

    ixsum!(grad = symbolic, zs[i, k] := a[i, j] * b[j, k]);
    ixsum!(grad = dual, zd[i, k] := a[i, j] * b[j, k]);
    assert_eq!(zs, zd);

    let dz = Array2::from_shape_fn(zs.dim(), |(i, k)| 1.0 + (i * 2 + k) as f64);
    let (das, dbs) = zs_grad(&dz);
    let (dad, dbd) = zd_grad(&dz);
    for (x, y) in das.iter().zip(dad.iter()) {
        approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
    }
    for (x, y) in dbs.iter().zip(dbd.iter()) {
        approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
    }
}

#[test]
fn symbolic_matches_finite_differences() {
    let a0 = array![[0.8, -0.3, 1.2], [0.1, 0.9, -0.7]];
    let b0 = array![[0.4, -1.1], [2.0, 0.6], [-0.2, 0.5]];

    ixsum!(grad = symbolic, z[i, k] := a0[i, j] * b0[j, k]);
    let dz = Array2::<f64>::ones(z.dim());
    let (da, db) = z_grad(&dz);

    let loss = |a: &Array2<f64>, b: &Array2<f64>| -> f64 {
        ixsum!(l[i, k] := a[i, j] * b[j, k]);
        l.sum()
    };

    let eps = 1e-6;
    for i in 0..a0.nrows() {
        for j in 0..a0.ncols() {
            let mut hi = a0.clone();
            hi[[i, j]] += eps;
            let mut lo = a0.clone();
            lo[[i, j]] -= eps;
            let fd = (loss(&hi, &b0) - loss(&lo, &b0)) / (2.0 * eps);
            approx::assert_abs_diff_eq!(da[[i, j]], fd, epsilon = 1e-4);
        }
    }
    for i in 0..b0.nrows() {
        for j in 0..b0.ncols() {
            let mut hi = b0.clone();
            hi[[i, j]] += eps;
            let mut lo = b0.clone();
            lo[[i, j]] -= eps;
            let fd = (loss(&a0, &hi) - loss(&a0, &lo)) / (2.0 * eps);
            approx::assert_abs_diff_eq!(db[[i, j]], fd, epsilon = 1e-4);
        }
    }
}

#[test]
fn elementary_function_gradient() {
    let a: Array1<f64> = array![0.2, 0.7, -0.4];
    ixsum!(grad = symbolic, s := a[i].exp() * a[i]);
    approx::assert_abs_diff_eq!(
        s,
        a.iter().map(|x| x.exp() * x).sum::<f64>(),
        epsilon = 1e-12
    );
    let da = s_grad(&1.0);
    for (g, x) in da.iter().zip(a.iter()) {
        // d/dx (x e^x) = e^x (1 + x)
        approx::assert_abs_diff_eq!(*g, x.exp() * (1.0 + x), epsilon = 1e-12);
    }
}

#[test]
fn dual_poisons_repeated_appearances() {
    let a: Array1<f64> = array![1.0, 2.0];
    ixsum!(grad = dual, s := a[i] * a[i]);
    assert_eq!(s, 5.0);
    let da = s_grad(&1.0);
    assert!(da.iter().all(|g| g.is_nan()), "poisoned gradient is loud");
}

#[test]
fn gradient_skipped_for_unsupported_rhs() {
    // nested indexing raises the no-gradient flag: the forward kernel still
    // works and no pullback is bound (compiling at all is the assertion)
    let a = array![[1.0, 2.0], [3.0, 4.0]];
    let picks = ndarray::arr1(&[vec![1.0, 5.0], vec![2.0, 6.0]]);
    ixsum!(grad = symbolic, z[i] := a[i, j] * picks[i][0]);
    assert_eq!(z, array![3.0 * 1.0, 7.0 * 2.0]);
}
