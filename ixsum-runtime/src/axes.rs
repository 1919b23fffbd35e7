//! Range algebra over loop axes.
//!
//! Axes are half-open `Range<isize>` values. The analyzer emits calls into
//! this module instead of computing ranges itself, since array lengths are
//! only known at run time.

use std::ops::Range;

/// Number of iterations of an axis; empty ranges count as zero.
pub fn axis_len(r: &Range<isize>) -> usize {
    (r.end - r.start).max(0) as usize
}

/// Largest range contained in both `a` and `b`.
pub fn intersect(a: Range<isize>, b: Range<isize>) -> Range<isize> {
    a.start.max(b.start)..a.end.min(b.end)
}

/// The values `i` with `scale * i + offset` inside `axis`.
///
/// This is the inverse image of an axis under an affine index map, used for
/// accesses like `a[2 * i + 1]`. The stride must be a non-zero integer;
/// negative strides are allowed.
///
/// ```
/// use ixsum_runtime::scaled_axis;
/// assert_eq!(scaled_axis(0..5, 1, 1), -1..4); // a[i + 1]
/// assert_eq!(scaled_axis(0..5, 2, 0), 0..3);  // a[2 * i]
/// ```
pub fn scaled_axis(axis: Range<isize>, scale: isize, offset: isize) -> Range<isize> {
    assert!(scale != 0, "index stride must be non-zero");
    if axis.start >= axis.end {
        return 0..0;
    }
    let lo = axis.start - offset;
    let hi = axis.end - 1 - offset;
    if scale > 0 {
        div_ceil(lo, scale)..div_floor(hi, scale) + 1
    } else {
        div_ceil(hi, scale)..div_floor(lo, scale) + 1
    }
}

/// The values `i` with `i + x` inside `outer` for every `x` in `inner`.
///
/// Resolves one side of an entangled pair `a[i + x]` once the other side's
/// range is known; the convolution case.
///
/// ```
/// use ixsum_runtime::outer_minus;
/// assert_eq!(outer_minus(0..5, &(0..3)), 0..3);
/// ```
pub fn outer_minus(outer: Range<isize>, inner: &Range<isize>) -> Range<isize> {
    if inner.start >= inner.end {
        return 0..0;
    }
    (outer.start - inner.start)..(outer.end - inner.end + 1)
}

/// Runtime check that two ranges inferred for the same unshifted index agree.
#[track_caller]
pub fn assert_same_axis(nominal: &Range<isize>, other: &Range<isize>, index: &str) {
    assert!(
        nominal == other,
        "range of index `{index}` disagrees between arrays: {nominal:?} vs {other:?}"
    );
}

/// Runtime check that an output axis starts at zero.
///
/// There is no offset-origin array type in this stack, so an equation whose
/// inferred output axis does not begin at the first element cannot be stored.
#[track_caller]
pub fn assert_zero_origin(axis: &Range<isize>, index: &str) {
    assert!(
        axis.start == 0,
        "axis of output index `{index}` starts at {}; offset outputs are not supported",
        axis.start
    );
}

fn div_floor(a: isize, b: isize) -> isize {
    let q = a / b;
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn div_ceil(a: isize, b: isize) -> isize {
    let q = a / b;
    let r = a % b;
    if r != 0 && (r < 0) == (b < 0) {
        q + 1
    } else {
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths() {
        assert_eq!(axis_len(&(0..5)), 5);
        assert_eq!(axis_len(&(-2..3)), 5);
        assert_eq!(axis_len(&(3..3)), 0);
        assert_eq!(axis_len(&(3..1)), 0);
    }

    #[test]
    fn intersections() {
        assert_eq!(intersect(0..5, -1..4), 0..4);
        assert_eq!(intersect(0..5, 2..9), 2..5);
        assert_eq!(axis_len(&intersect(0..2, 3..5)), 0);
    }

    #[test]
    fn shifted() {
        // a[i + 1] over a 5-element axis: i in -1..4
        assert_eq!(scaled_axis(0..5, 1, 1), -1..4);
        // a[i - 2]: i in 2..7
        assert_eq!(scaled_axis(0..5, 1, -2), 2..7);
    }

    #[test]
    fn strided() {
        assert_eq!(scaled_axis(0..5, 2, 0), 0..3); // 0, 2, 4
        assert_eq!(scaled_axis(0..5, 2, 1), 0..2); // 1, 3
        assert_eq!(scaled_axis(0..5, 3, 1), 0..2); // 1, 4
        assert_eq!(scaled_axis(0..6, -1, 0), -5..1); // -i in 0..6
    }

    #[test]
    fn entangled() {
        // 5-wide image, 3-wide stencil: 3 valid placements
        assert_eq!(outer_minus(0..5, &(0..3)), 0..3);
        // stencil as wide as the image: exactly one
        assert_eq!(outer_minus(0..3, &(0..3)), 0..1);
        assert_eq!(axis_len(&outer_minus(0..2, &(0..3))), 0);
    }

    #[test]
    #[should_panic(expected = "disagrees")]
    fn disagreement() {
        assert_same_axis(&(0..3), &(0..4), "j");
    }

    #[test]
    #[should_panic(expected = "offset outputs")]
    fn offset_output() {
        assert_zero_origin(&(1..4), "i");
    }
}
