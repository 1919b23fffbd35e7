use ixsum::ixsum;
use ndarray::{array, Array2};
use proptest::prelude::*;

#[test]
fn threading_is_bit_identical_for_integers() {
    let a = Array2::<i64>::from_shape_fn((17, 9), |(i, j)| (i * 31 + j * 7) as i64 - 40);
    let b = Array2::<i64>::from_shape_fn((9, 13), |(i, j)| (i * 5 + j * 11) as i64 - 30);
    ixsum!(threads = false, serial[i, k] := a[i, j] * b[j, k]);
    ixsum!(threads = 1, eager[i, k] := a[i, j] * b[j, k]);
    assert_eq!(serial, eager);
}

#[test]
fn unrolling_matches_plain_loops() {
    let a = Array2::<f64>::from_shape_fn((7, 23), |(i, j)| ((i * 23 + j) as f64).sin());
    ixsum!(avx = false, plain[i] := a[i, j]);
    ixsum!(avx = 8, unrolled[i] := a[i, j]);
    for (x, y) in plain.iter().zip(unrolled.iter()) {
        approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
    }
}

#[test]
fn grid_kernel_matches_host() {
    let a = Array2::<f64>::from_shape_fn((6, 5), |(i, j)| (i + 2 * j) as f64);
    let b = Array2::<f64>::from_shape_fn((5, 4), |(i, j)| (3 * i + j) as f64);
    ixsum!(host[i, k] := a[i, j] * b[j, k]);
    ixsum!(cuda = 8, grid[i, k] := a[i, j] * b[j, k]);
    assert_eq!(host, grid);
}

#[test]
fn registry_records_the_equation() {
    let q = array![1.0, 2.0];
    ixsum!(unique_output_name[i] := q[i] * q[i]);
    assert_eq!(unique_output_name, array![1.0, 4.0]);
    let recorded = ixsum_runtime::registry::all()
        .into_iter()
        .any(|r| r.equation.starts_with("unique_output_name[i]"));
    assert!(recorded, "driver registered its kernel record");
}

#[test]
fn named_axes_reach_the_registry() {
    let a = array![[1.0, 2.0], [3.0, 4.0]];
    ixsum!(named_out[row = i, col = j] := a[i, j]);
    assert_eq!(named_out, a);
    let labels = ixsum_runtime::registry::all()
        .into_iter()
        .find(|r| r.equation.starts_with("named_out["))
        .map(|r| r.axis_names);
    assert_eq!(labels, Some(vec!["row".to_string(), "col".to_string()]));
}

proptest! {
    #[test]
    fn threaded_matmul_matches_reference(
        rows in 1usize..6,
        mid in 1usize..6,
        cols in 1usize..6,
        seed in 0i64..1000,
    ) {
        let a = Array2::<i64>::from_shape_fn((rows, mid), |(i, j)| {
            (seed + (i * 7 + j * 3) as i64) % 17 - 8
        });
        let b = Array2::<i64>::from_shape_fn((mid, cols), |(i, j)| {
            (seed + (i * 5 + j * 11) as i64) % 13 - 6
        });
        ixsum!(threads = 1, z[i, j, k] := a[i, j] * b[j, k]);
        // reference: plain loops
        let mut expected = ndarray::Array3::<i64>::zeros((rows, mid, cols));
        for i in 0..rows {
            for j in 0..mid {
                for k in 0..cols {
                    expected[[i, j, k]] = a[[i, j]] * b[[j, k]];
                }
            }
        }
        prop_assert_eq!(&z, &expected);
    }

    #[test]
    fn unroll_equivalence_for_sums(
        len in 1usize..40,
        seed in 0i64..100,
    ) {
        let a = ndarray::Array1::<i64>::from_shape_fn(len, |i| (seed + i as i64) % 23 - 11);
        ixsum!(avx = false, plain := a[i] * a[i]);
        ixsum!(avx = 4, unrolled := a[i] * a[i]);
        prop_assert_eq!(plain, unrolled);
    }
}
