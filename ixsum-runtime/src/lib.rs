//! Runtime support for the [`ixsum!`](https://crates.io/crates/ixsum) macro.
//!
//! The macro compiles an index-notation equation into loop-nest kernels at
//! expansion time; everything those kernels need at run time lives here:
//!
//! - range algebra over `Range<isize>` axes ([`axes`]),
//! - the [`threader`](threads::threader) that partitions work across scoped
//!   threads and the grid launcher used by the block-kernel specialization,
//! - the [`StorageKind`](storage::StorageKind) capability probe that selects
//!   between kernel specializations,
//! - reduction initializers over the [`Element`](element::Element) trait,
//! - dual numbers for forward-over-reverse gradients,
//! - the process-wide kernel [`registry`].
//!
//! Nothing in this crate is specific to one equation; generated code calls
//! into it by fully qualified path.

pub mod axes;
pub mod dual;
pub mod element;
pub mod registry;
pub mod shared;
pub mod storage;
pub mod threads;

pub use axes::{assert_same_axis, assert_zero_origin, axis_len, intersect, outer_minus, scaled_axis};
pub use dual::Dual;
pub use element::{
    max_bound_like, max_by, min_bound_like, min_by, one_like, poison_like, same_elem, same_scalar,
    zero_like, Element, Poison,
};
pub use shared::SharedView;
pub use storage::{storage_kind_of, StorageKind};
pub use threads::{grad_threader, launch_grid, threader, Keep, Launch, Threads};

/// Debug note emitted when the dual-number gradient strategy cannot handle a
/// term; the corresponding gradient array is filled with poison values so the
/// failure is visible rather than silently wrong.
pub fn dual_poison_note(array: &str) {
    log::warn!(
        "dual-number gradient for `{array}` is undefined (repeated appearance); filling with poison"
    );
}
