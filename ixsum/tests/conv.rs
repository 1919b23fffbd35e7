use ixsum::ixsum;
use ndarray::{array, Array2};

#[test]
fn convolution_ranges_inferred() {
    // 5x5 image, 3x3 stencil: the output range is every valid placement
    let a = Array2::<f64>::ones((5, 5));
    let k = Array2::<f64>::ones((3, 3));
    ixsum!(z[i, j] := a[i + x, j + y] * k[x, y]);
    assert_eq!(z.dim(), (3, 3));
    assert!(z.iter().all(|&v| v == 9.0));
}

#[test]
fn convolution_values() {
    let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
    let k = array![[0.0, 1.0], [1.0, 0.0]];
    ixsum!(z[i, j] := a[i + x, j + y] * k[x, y]);
    // each cell: a[i, j+1] + a[i+1, j]
    assert_eq!(z, array![[6.0, 8.0], [12.0, 14.0]]);
}

#[test]
fn shifted_intersection() {
    let a = array![1.0, 2.0, 3.0, 4.0];
    ixsum!(z[i] := a[i] + a[i + 1]);
    assert_eq!(z, array![3.0, 5.0, 7.0]);
}

#[test]
fn strided_access() {
    let a = array![10.0, 11.0, 12.0, 13.0, 14.0];
    ixsum!(z[i] := a[2 * i]);
    assert_eq!(z, array![10.0, 12.0, 14.0]);
}

#[test]
fn scalar_shift() {
    let a = array![10.0, 20.0, 30.0, 40.0];
    let ones = array![1.0, 1.0, 1.0];
    let d = 1i64;
    ixsum!(z[i] := a[i + $d] * ones[i]);
    assert_eq!(z, array![20.0, 30.0, 40.0]);
}

#[test]
fn declared_range_resolves_entanglement() {
    let a = array![1.0, 2.0, 3.0, 4.0, 5.0];
    ixsum!(z[i] := a[i + j], j in 0..2);
    // z[i] = a[i] + a[i + 1] over the placements valid for both
    assert_eq!(z, array![3.0, 5.0, 7.0, 9.0]);
}

#[test]
#[should_panic(expected = "offset outputs")]
fn offset_output_rejected() {
    let a = array![1.0, 2.0, 3.0];
    ixsum!(z[i] := a[i + 1]);
    let _ = z;
}
