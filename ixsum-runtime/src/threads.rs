//! Work partitioning for generated kernels.
//!
//! A kernel is a closure over `(outer, inner, keep)` axis slices. The
//! threader decides how to invoke it:
//!
//! - splitting a **free** axis hands disjoint outer sub-ranges to scoped
//!   threads, each with the caller's `keep`;
//! - blocking a **reduction** axis runs sequential sub-ranges, passing
//!   [`Keep::Accumulate`] to every call after the first so partial
//!   reductions compose.
//!
//! The reduction operator must be associative for either split to be valid;
//! the synthesizer only emits associative operators.

use crate::axes::axis_len;
use log::debug;
use std::ops::Range;

/// Whether a kernel invocation starts fresh or continues from the stored
/// output. `Fresh` initializes the accumulator from the reduction operator's
/// identity; `Accumulate` reads the current output cell instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    Fresh,
    Accumulate,
}

/// Threading policy from the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threads {
    /// Never split.
    Off,
    /// Split when the estimated work exceeds the block threshold.
    Auto,
    /// Split when the estimated work exceeds this many scalar operations.
    Min(usize),
}

/// Launch parameters baked into the expansion.
#[derive(Debug, Clone, Copy)]
pub struct Launch {
    pub threads: Threads,
    /// Work threshold for `Threads::Auto`, scaled by the analyzer's cost
    /// estimate of one right-hand-side evaluation.
    pub block: usize,
}

impl Launch {
    fn min_work(&self) -> usize {
        match self.threads {
            Threads::Off => usize::MAX,
            Threads::Auto => self.block.max(1),
            Threads::Min(m) => m.max(1),
        }
    }
}

fn workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Drive a forward kernel over the full axis product.
///
/// Splits the leading outer axis across scoped threads when profitable.
/// When there is no outer axis to split (a full reduction), the leading
/// reduction axis is blocked sequentially with `Accumulate` continuation,
/// which keeps the result identical while bounding the working set.
pub fn threader<K>(
    kernel: &K,
    outer: &[Range<isize>],
    inner: &[Range<isize>],
    launch: &Launch,
    keep: Keep,
) where
    K: Fn(&[Range<isize>], &[Range<isize>], Keep) + Sync,
{
    let outer_work: usize = outer.iter().map(axis_len).product();
    let inner_work: usize = inner.iter().map(axis_len).product::<usize>().max(1);
    let total = outer_work * inner_work;
    let min_work = launch.min_work();
    let workers = workers();

    if !outer.is_empty() && outer_work > 1 && total >= min_work.saturating_mul(2) && workers > 1 {
        let lead = axis_len(&outer[0]);
        let pieces = (total / min_work).clamp(1, workers.min(lead));
        if pieces > 1 {
            debug!("splitting outer axis of {lead} into {pieces} pieces");
            let start = outer[0].start;
            let end = outer[0].end;
            std::thread::scope(|scope| {
                for p in 0..pieces {
                    let lo = start + (lead * p / pieces) as isize;
                    let hi = start + (lead * (p + 1) / pieces) as isize;
                    let mut sub = outer.to_vec();
                    sub[0] = lo..hi.min(end);
                    scope.spawn(move || kernel(&sub, inner, keep));
                }
            });
            return;
        }
    }

    if outer_work <= 1 && !inner.is_empty() && total >= min_work.saturating_mul(2) {
        // Full reduction: block the leading reduction axis sequentially so
        // the accumulator is carried across blocks.
        let lead = axis_len(&inner[0]);
        let pieces = (total / min_work).clamp(1, lead);
        if pieces > 1 {
            debug!("blocking reduction axis of {lead} into {pieces} pieces");
            let start = inner[0].start;
            for p in 0..pieces {
                let lo = start + (lead * p / pieces) as isize;
                let hi = start + (lead * (p + 1) / pieces) as isize;
                let mut sub = inner.to_vec();
                sub[0] = lo..hi;
                let k = if p == 0 { keep } else { Keep::Accumulate };
                kernel(outer, &sub, k);
            }
            return;
        }
    }

    kernel(outer, inner, keep);
}

/// Drive a gradient kernel.
///
/// Only shared axes are split across threads: every right-hand-side array
/// carries each shared index, so concurrent iterations write disjoint slices
/// of every gradient array. Non-shared axes always run inside one thread.
pub fn grad_threader<K>(
    kernel: &K,
    shared: &[Range<isize>],
    nonshared: &[Range<isize>],
    launch: &Launch,
) where
    K: Fn(&[Range<isize>], &[Range<isize>]) + Sync,
{
    let shared_work: usize = shared.iter().map(axis_len).product();
    let rest: usize = nonshared.iter().map(axis_len).product::<usize>().max(1);
    let total = shared_work.max(1) * rest;
    let min_work = launch.min_work();
    let workers = workers();

    if !shared.is_empty() && shared_work > 1 && total >= min_work.saturating_mul(2) && workers > 1 {
        let lead = axis_len(&shared[0]);
        let pieces = (total / min_work).clamp(1, workers.min(lead));
        if pieces > 1 {
            debug!("splitting shared gradient axis of {lead} into {pieces} pieces");
            let start = shared[0].start;
            std::thread::scope(|scope| {
                for p in 0..pieces {
                    let lo = start + (lead * p / pieces) as isize;
                    let hi = start + (lead * (p + 1) / pieces) as isize;
                    let mut sub = shared.to_vec();
                    sub[0] = lo..hi;
                    scope.spawn(move || kernel(&sub, nonshared));
                }
            });
            return;
        }
    }

    kernel(shared, nonshared);
}

/// Drive a grid-style kernel over flat global ids, `block` ids per call.
///
/// This is the host-side model of a device launch: iterations share no
/// state, and the kernel decodes its indices from the global id.
pub fn launch_grid<K>(kernel: &K, total: usize, block: usize, launch: &Launch)
where
    K: Fn(Range<usize>) + Sync,
{
    let block = block.max(1);
    let blocks = total.div_ceil(block);
    let workers = workers();
    if blocks <= 1 || workers <= 1 || matches!(launch.threads, Threads::Off) {
        if total > 0 {
            kernel(0..total);
        }
        return;
    }
    debug!("launching {blocks} blocks of {block} over {workers} workers");
    std::thread::scope(|scope| {
        for w in 0..workers.min(blocks) {
            scope.spawn(move || {
                let mut b = w;
                while b < blocks {
                    let lo = b * block;
                    let hi = (lo + block).min(total);
                    kernel(lo..hi);
                    b += workers;
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedView;
    use ndarray::Array1;

    const SERIAL: Launch = Launch {
        threads: Threads::Off,
        block: 1,
    };
    const EAGER: Launch = Launch {
        threads: Threads::Min(1),
        block: 1,
    };

    fn fill_squares(launch: &Launch) -> Array1<i64> {
        let mut out = Array1::<i64>::zeros(64);
        {
            let z = SharedView::new(out.view_mut());
            let kernel = |outer: &[Range<isize>], _inner: &[Range<isize>], _keep: Keep| {
                for i in outer[0].clone() {
                    unsafe { z.write(&[i as usize], (i * i) as i64) };
                }
            };
            threader(&kernel, &[0..64], &[], launch, Keep::Fresh);
        }
        out
    }

    #[test]
    fn split_matches_serial() {
        assert_eq!(fill_squares(&SERIAL), fill_squares(&EAGER));
    }

    #[test]
    fn reduction_blocking_composes() {
        // scalar sum over 0..100 with forced blocking
        let run = |launch: &Launch| {
            let mut out = ndarray::arr0(0i64);
            {
                let z = SharedView::new(out.view_mut());
                let kernel = |_outer: &[Range<isize>], inner: &[Range<isize>], keep: Keep| {
                    let mut acc = match keep {
                        Keep::Fresh => 0,
                        Keep::Accumulate => unsafe { z.read(&[]) },
                    };
                    for i in inner[0].clone() {
                        acc += i as i64;
                    }
                    unsafe { z.write(&[], acc) };
                };
                threader(&kernel, &[], &[0..100], launch, Keep::Fresh);
            }
            out.into_scalar()
        };
        assert_eq!(run(&SERIAL), 4950);
        assert_eq!(run(&EAGER), 4950);
    }

    #[test]
    fn grid_covers_every_id() {
        let mut out = Array1::<i64>::zeros(37);
        {
            let z = SharedView::new(out.view_mut());
            let kernel = |ids: Range<usize>| {
                for gid in ids {
                    unsafe { z.write(&[gid], 1 + z.read(&[gid])) };
                }
            };
            launch_grid(&kernel, 37, 4, &EAGER);
        }
        assert!(out.iter().all(|&x| x == 1));
    }
}
