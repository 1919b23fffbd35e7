use ixsum::ixsum;
use ndarray::array;

#[test]
fn dot_product_scalar_output() {
    let a = array![1.0, 2.0, 3.0];
    ixsum!(s := a[i] * a[i]);
    assert_eq!(s, 14.0);
}

#[test]
fn row_max() {
    let a = array![[1.0, 9.0, 2.0], [8.0, 3.0, 7.0]];
    ixsum!(z[i] := max(a[i, j]));
    assert_eq!(z, array![9.0, 8.0]);
}

#[test]
fn row_min_all_positive() {
    let a = array![[4.0, 9.0, 2.0], [8.0, 3.0, 7.0]];
    ixsum!(z[i] := min(a[i, j]));
    assert_eq!(z, array![2.0, 3.0]);
}

#[test]
fn row_product() {
    let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 0.5]];
    ixsum!(z[i] := prod(a[i, j]));
    assert_eq!(z, array![6.0, 10.0]);
}

#[test]
fn full_max_to_scalar() {
    let a = array![[1i64, 9, 2], [8, 3, 7]];
    ixsum!(m := max(a[i, j]));
    assert_eq!(m, 9);
}

#[test]
fn scalar_accumulate() {
    let a = array![1.0, 2.0, 3.0];
    let mut s = 10.0;
    ixsum!(s += a[i]);
    assert_eq!(s, 16.0);
}

#[test]
fn scalar_overwrite() {
    let a = array![1.0, 2.0, 3.0];
    let mut s = 99.0;
    ixsum!(s = a[i] * a[i]);
    assert_eq!(s, 14.0);
}

#[test]
fn blocked_scalar_reduction_composes() {
    // force reduction blocking: no outer axis, minimum work of 1
    let a = ndarray::Array1::<i64>::from_shape_fn(1000, |i| i as i64);
    ixsum!(threads = 1, s := a[i]);
    assert_eq!(s, 499_500);
}
