//! Shared mutable output view for concurrently running kernels.
//!
//! The threader hands the same kernel to several scoped threads, each with a
//! disjoint sub-range of the outer axes. Every iteration of the outer nest
//! writes a distinct output cell, so the writes never alias; `SharedView`
//! erases the exclusivity of the underlying `ArrayViewMut` to make that
//! pattern expressible. It is the only unsafe surface of the runtime.

use ndarray::{ArrayViewMut, Dimension};
use std::marker::PhantomData;

/// Raw view over a mutable ndarray view, indexable from several threads.
///
/// # Safety contract
///
/// Callers of [`read`](SharedView::read) and [`write`](SharedView::write)
/// must guarantee that no two threads touch the same index concurrently.
/// The loop-nest synthesizer upholds this by only ever splitting free axes
/// across threads.
pub struct SharedView<'a, A> {
    ptr: *mut A,
    dims: Vec<usize>,
    strides: Vec<isize>,
    _marker: PhantomData<&'a mut A>,
}

unsafe impl<A: Send> Send for SharedView<'_, A> {}
unsafe impl<A: Send> Sync for SharedView<'_, A> {}

impl<'a, A> SharedView<'a, A> {
    pub fn new<D: Dimension>(mut view: ArrayViewMut<'a, A, D>) -> Self {
        let dims = view.shape().to_vec();
        let strides = view.strides().to_vec();
        SharedView {
            ptr: view.as_mut_ptr(),
            dims,
            strides,
            _marker: PhantomData,
        }
    }

    fn offset(&self, index: &[usize]) -> isize {
        debug_assert_eq!(index.len(), self.dims.len());
        let mut off = 0isize;
        for (k, &i) in index.iter().enumerate() {
            debug_assert!(i < self.dims[k], "index {i} out of bounds for axis {k}");
            off += i as isize * self.strides[k];
        }
        off
    }

    /// # Safety
    /// `index` must be in bounds and not concurrently written.
    pub unsafe fn read(&self, index: &[usize]) -> A
    where
        A: Copy,
    {
        *self.ptr.offset(self.offset(index))
    }

    /// # Safety
    /// `index` must be in bounds and not concurrently accessed.
    pub unsafe fn write(&self, index: &[usize], value: A) {
        *self.ptr.offset(self.offset(index)) = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr0, Array2};

    #[test]
    fn roundtrip() {
        let mut a = Array2::<f64>::zeros((2, 3));
        {
            let v = SharedView::new(a.view_mut());
            unsafe {
                v.write(&[0, 2], 1.5);
                v.write(&[1, 0], -2.0);
                assert_eq!(v.read(&[0, 2]), 1.5);
            }
        }
        assert_eq!(a[[0, 2]], 1.5);
        assert_eq!(a[[1, 0]], -2.0);
    }

    #[test]
    fn strided_view() {
        let mut a = Array2::<i64>::zeros((3, 3));
        {
            let mut t = a.view_mut().reversed_axes();
            let v = SharedView::new(t.view_mut());
            unsafe { v.write(&[0, 2], 7) };
        }
        // transposed write lands at the mirrored position
        assert_eq!(a[[2, 0]], 7);
    }

    #[test]
    fn zero_dim() {
        let mut a = arr0(0.0f32);
        {
            let v = SharedView::new(a.view_mut());
            unsafe { v.write(&[], 3.0) };
        }
        assert_eq!(a.into_scalar(), 3.0);
    }
}
