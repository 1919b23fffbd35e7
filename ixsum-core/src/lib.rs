#![cfg_attr(doc, katexit::katexit)]
//! Equation analyzer and loop-nest synthesizer behind the `ixsum!` macro
//!
//! Index notation
//! --------------
//! The Einstein summation rule abbreviates tensor operations by summing
//! over every index that appears on the right of an equation but not on
//! the left. Matrix multiplication
//! $$
//! Z_{ik} = \sum_{j \in J} a_{ij} b_{jk}
//! $$
//! is written
//!
//! ```text
//! z[i, k] := a[i, j] * b[j, k]
//! ```
//!
//! where `i` and `k` are **free** indices (outer loops, axes of the
//! output) and `j` is a **reduction** index (inner loop). This crate
//! extends the plain summation rule with affine index shifts
//! (`a[i + 1]`, `a[2 * i]`, and the entangled convolution form
//! `a[i + x] * k[x]`), lifted scalars (`$alpha`), literal axis pins,
//! explicit range declarations (`i in 0..n`), the reduction operators
//! `max`, `min` and `prod`, and reverse-mode gradient synthesis.
//!
//! Pipeline
//! --------
//! Analysis runs in strict phase order over a single mutable
//! [`Store`](store::Store):
//!
//! 1. [`scan`] splits the raw token stream into options, range
//!    declarations and the equation, handling the non-Rust `:=` operator
//!    and `$name` interpolations.
//! 2. [`analyze`](analyze::analyze) classifies the left side, walks the
//!    right side into a canonical tree, and collects per-index range
//!    evidence.
//! 3. [`ranges::solve`] assigns every loop index a concrete axis: shifted
//!    indices by intersection of their candidates, unshifted indices by
//!    strict agreement, entangled pairs by resolving the constrained side
//!    first.
//! 4. [`codegen`] emits the kernels (plain, unrolled, grid), the driver
//!    that dispatches between them through the runtime's storage probe and
//!    threader, and optionally a gradient pullback.
//!
//! The emitted code runs against `ndarray` arrays and the `ixsum-runtime`
//! crate; this crate itself never touches an array.

pub mod analyze;
pub mod codegen;
pub mod error;
pub mod options;
pub mod ranges;
pub mod scan;
pub mod store;

use error::{Error, Result};
use proc_macro2::TokenStream;

/// Full expansion pipeline for one `ixsum!` invocation.
///
/// An invocation without an equation updates the process-wide option
/// defaults and expands to nothing.
pub fn expand(input: TokenStream) -> Result<TokenStream> {
    let scanned = scan::scan(input)?;
    let mut opts = options::defaults();
    for (name, value) in &scanned.options {
        opts.apply(name, value)?;
    }
    let Some(eq) = &scanned.equation else {
        if !scanned.ranges.is_empty() {
            return Err(Error::Equation(
                "range declaration without an equation".into(),
            ));
        }
        options::set_defaults(opts);
        return Ok(TokenStream::new());
    };
    let mut st = analyze::analyze(eq, &scanned.ranges, &opts)?;
    ranges::solve(&mut st)?;
    if opts.verbose {
        eprintln!("{st}");
    }
    Ok(codegen::emit(&st))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn expand_str(src: &str) -> Result<TokenStream> {
        expand(TokenStream::from_str(src).unwrap())
    }

    #[test]
    fn stray_range_declaration() {
        assert!(matches!(
            expand_str("i in 0..3"),
            Err(Error::Equation(_))
        ));
    }

    #[test]
    fn scenarios_expand() {
        for src in [
            "z[i, k] := a[i, j] * b[j, k]",
            "s := a[i] * a[i]",
            "z[i, j] := a[i + x, j + y] * k[x, y]",
            "z[i, k] := $alpha * a[i, j] * b[j, k] + $beta",
            "z[i] := max(a[i, j])",
            "z[i, k] += c[i, j] * d[j, k]",
            "grad = symbolic, z[i, k] := a[i, j] * b[j, k]",
            "grad = dual, z[i, k] := a[i, j] * b[j, k]",
            "cuda = 64, z[i] := a[i, j]",
        ] {
            expand_str(src).unwrap_or_else(|e| panic!("{src}: {e}"));
        }
    }

    #[test]
    fn verbose_dump_is_stable() {
        let scanned =
            scan::scan(TokenStream::from_str("z[i, k] := a[i, j] * b[j, k]").unwrap()).unwrap();
        let eq = scanned.equation.unwrap();
        let mut st =
            analyze::analyze(&eq, &scanned.ranges, &options::Options::default()).unwrap();
        ranges::solve(&mut st).unwrap();
        insta::assert_snapshot!(st.to_string(), @r###"
        equation:  z[i, k] := a[i, j] * b[j, k]
        flags:     newarray
        free:      i, k
        reduction: j
        shared:    j
        arrays:    a, b
        scalars:   -
        shifted:   -
        pairs:     -
        reduce by: +
        cost:      3
        "###);
    }
}
