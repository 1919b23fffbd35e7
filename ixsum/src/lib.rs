#![doc = include_str!("../README.md")]

use proc_macro::TokenStream;
use proc_macro_error::{abort_call_site, proc_macro_error};

/// Compile an index-notation equation into specialized loop nests.
///
/// See the crate-level documentation for the equation grammar and the
/// recognized options. Analysis failures (unknown options, unconstrained
/// indices, self-referential creation, malformed index expressions) are
/// reported as compile errors at the call site.
#[proc_macro_error]
#[proc_macro]
pub fn ixsum(input: TokenStream) -> TokenStream {
    match ixsum_core::expand(input.into()) {
        Ok(tokens) => tokens.into(),
        Err(e) => abort_call_site!("{}", e),
    }
}
