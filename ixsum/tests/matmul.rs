use ixsum::ixsum;
use ndarray::array;

#[test]
fn matmul() {
    let a = array![[1.0, 2.0], [3.0, 4.0]];
    let b = array![[5.0, 6.0], [7.0, 8.0]];
    ixsum!(z[i, k] := a[i, j] * b[j, k]);
    assert_eq!(z, array![[19.0, 22.0], [43.0, 50.0]]);
}

#[test]
fn matmul_integers() {
    let a = array![[1i64, 2], [3, 4]];
    let b = array![[5i64, 6], [7, 8]];
    ixsum!(z[i, k] := a[i, j] * b[j, k]);
    assert_eq!(z, array![[19, 22], [43, 50]]);
}

#[test]
fn row_sum_without_declaration() {
    // j appears only on the right: it reduces without being declared
    let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
    ixsum!(z[i] := a[i, j]);
    assert_eq!(z, array![6.0, 15.0]);
}

#[test]
fn anonymous_output_is_an_expression() {
    let a = array![[1, 2], [3, 4]];
    let b = array![[1, 0], [0, 1]];
    let z = ixsum!([i, k] := a[i, j] * b[j, k]);
    assert_eq!(z, a);
}

#[test]
fn elementwise_without_reduction() {
    let a = array![1.0, 2.0, 3.0];
    let b = array![10.0, 20.0, 30.0];
    ixsum!(z[i] := a[i] * b[i] + a[i]);
    assert_eq!(z, array![11.0, 42.0, 93.0]);
}

#[test]
fn three_dimensional_contraction() {
    let a = ndarray::Array3::<f64>::from_shape_fn((2, 3, 4), |(i, j, k)| {
        (i * 12 + j * 4 + k) as f64
    });
    let v = array![1.0, 2.0, 3.0, 4.0];
    ixsum!(z[i, j] := a[i, j, k] * v[k]);
    let mut expected = ndarray::Array2::<f64>::zeros((2, 3));
    for i in 0..2 {
        for j in 0..3 {
            for k in 0..4 {
                expected[[i, j]] += a[[i, j, k]] * v[[k]];
            }
        }
    }
    assert_eq!(z, expected);
}

#[test]
#[should_panic(expected = "disagrees")]
fn mismatched_shared_axis_panics() {
    let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
    let b = array![[1.0, 2.0], [3.0, 4.0]];
    ixsum!(z[i, k] := a[i, j] * b[j, k]);
    let _ = z;
}
