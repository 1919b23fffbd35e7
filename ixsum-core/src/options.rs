//! Call-site options and process-wide defaults.
//!
//! Options arrive as `name = value` arguments ahead of (or instead of) the
//! equation. An invocation with options but no equation updates the
//! process-wide defaults, which are seeded once from `IXSUM_*` environment
//! variables when first touched.

use crate::error::{Error, Result};
use proc_macro2::TokenStream;
use std::sync::{Mutex, OnceLock};

/// Threading policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadsOpt {
    Off,
    Auto,
    /// Minimum number of scalar operations before splitting.
    Min(usize),
}

/// Inner-loop unrolling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvxOpt {
    Off,
    Unroll(usize),
}

/// Gradient synthesis strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradMode {
    Off,
    Symbolic,
    Dual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub verbose: bool,
    pub threads: ThreadsOpt,
    pub grad: GradMode,
    pub avx: AvxOpt,
    /// Grid block size; zero disables the grid specialization.
    pub cuda: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            verbose: false,
            threads: ThreadsOpt::Auto,
            grad: GradMode::Off,
            avx: AvxOpt::Unroll(8),
            cuda: 0,
        }
    }
}

const NAMES: [&str; 5] = ["verbose", "threads", "grad", "avx", "cuda"];

pub fn is_option(name: &str) -> bool {
    NAMES.contains(&name)
}

enum Value {
    Bool(bool),
    Int(u64),
    Word(String),
}

fn parse_value(name: &str, tokens: &TokenStream) -> Result<Value> {
    let bad = || Error::OptionValue(name.to_string(), tokens.to_string());
    let expr: syn::Expr = syn::parse2(tokens.clone()).map_err(|_| bad())?;
    match expr {
        syn::Expr::Lit(syn::ExprLit {
            lit: syn::Lit::Bool(b),
            ..
        }) => Ok(Value::Bool(b.value)),
        syn::Expr::Lit(syn::ExprLit {
            lit: syn::Lit::Int(i),
            ..
        }) => i.base10_parse::<u64>().map(Value::Int).map_err(|_| bad()),
        syn::Expr::Path(p) => p
            .path
            .get_ident()
            .map(|id| Value::Word(id.to_string()))
            .ok_or_else(bad),
        _ => Err(bad()),
    }
}

impl Options {
    /// Apply one `name = value` argument.
    pub fn apply(&mut self, name: &str, tokens: &TokenStream) -> Result<()> {
        let bad = || Error::OptionValue(name.to_string(), tokens.to_string());
        match (name, parse_value(name, tokens)?) {
            ("verbose", Value::Bool(b)) => self.verbose = b,
            ("threads", Value::Bool(false)) => self.threads = ThreadsOpt::Off,
            ("threads", Value::Bool(true)) => self.threads = ThreadsOpt::Auto,
            ("threads", Value::Int(n)) if n > 0 => self.threads = ThreadsOpt::Min(n as usize),
            ("grad", Value::Bool(false)) => self.grad = GradMode::Off,
            ("grad", Value::Word(w)) if w == "symbolic" => self.grad = GradMode::Symbolic,
            ("grad", Value::Word(w)) if w == "dual" => self.grad = GradMode::Dual,
            ("avx", Value::Bool(false)) => self.avx = AvxOpt::Off,
            ("avx", Value::Bool(true)) => self.avx = AvxOpt::Unroll(8),
            ("avx", Value::Int(n)) if n > 0 => self.avx = AvxOpt::Unroll(n as usize),
            ("cuda", Value::Int(n)) => self.cuda = n as usize,
            _ => return Err(bad()),
        }
        Ok(())
    }
}

fn from_env() -> Options {
    let mut opts = Options::default();
    let get = |key: &str| std::env::var(key).ok();
    if let Some(v) = get("IXSUM_VERBOSE") {
        opts.verbose = v == "1" || v == "true";
    }
    if let Some(v) = get("IXSUM_THREADS") {
        opts.threads = match v.as_str() {
            "false" | "0" => ThreadsOpt::Off,
            "true" => ThreadsOpt::Auto,
            other => other.parse().map_or(opts.threads, ThreadsOpt::Min),
        };
    }
    if let Some(v) = get("IXSUM_AVX") {
        opts.avx = match v.as_str() {
            "false" | "0" => AvxOpt::Off,
            "true" => AvxOpt::Unroll(8),
            other => other.parse().map_or(opts.avx, AvxOpt::Unroll),
        };
    }
    if let Some(v) = get("IXSUM_CUDA") {
        opts.cuda = v.parse().unwrap_or(opts.cuda);
    }
    if let Some(v) = get("IXSUM_GRAD") {
        opts.grad = match v.as_str() {
            "symbolic" => GradMode::Symbolic,
            "dual" => GradMode::Dual,
            _ => GradMode::Off,
        };
    }
    opts
}

fn cell() -> &'static Mutex<Options> {
    static DEFAULTS: OnceLock<Mutex<Options>> = OnceLock::new();
    DEFAULTS.get_or_init(|| Mutex::new(from_env()))
}

/// Snapshot of the process-wide defaults.
pub fn defaults() -> Options {
    cell().lock().expect("option defaults poisoned").clone()
}

/// Replace the process-wide defaults; the explicit form of an option-only
/// invocation.
pub fn set_defaults(opts: Options) {
    *cell().lock().expect("option defaults poisoned") = opts;
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::quote;

    #[test]
    fn apply_values() {
        let mut o = Options::default();
        o.apply("verbose", &quote! { true }).unwrap();
        o.apply("threads", &quote! { 4096 }).unwrap();
        o.apply("grad", &quote! { symbolic }).unwrap();
        o.apply("avx", &quote! { 4 }).unwrap();
        o.apply("cuda", &quote! { 256 }).unwrap();
        assert!(o.verbose);
        assert_eq!(o.threads, ThreadsOpt::Min(4096));
        assert_eq!(o.grad, GradMode::Symbolic);
        assert_eq!(o.avx, AvxOpt::Unroll(4));
        assert_eq!(o.cuda, 256);
    }

    #[test]
    fn rejects_bad_values() {
        let mut o = Options::default();
        assert!(matches!(
            o.apply("threads", &quote! { 0 }),
            Err(Error::OptionValue(..))
        ));
        assert!(matches!(
            o.apply("grad", &quote! { true }),
            Err(Error::OptionValue(..))
        ));
        assert!(matches!(
            o.apply("cuda", &quote! { -1 }),
            Err(Error::OptionValue(..))
        ));
    }

    // The defaults cell is process-wide; tests that touch it take this lock
    // so they cannot interleave.
    static DEFAULTS_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_roundtrip() {
        let _guard = DEFAULTS_GUARD.lock().unwrap();
        let before = defaults();
        let mut changed = before.clone();
        changed.threads = ThreadsOpt::Off;
        set_defaults(changed.clone());
        assert_eq!(defaults(), changed);
        set_defaults(before);
    }

    #[test]
    fn invocation_without_equation_updates_defaults() {
        let _guard = DEFAULTS_GUARD.lock().unwrap();
        let before = defaults();
        let out = crate::expand(quote! { avx = 2 }).unwrap();
        assert!(out.is_empty());
        assert_eq!(defaults().avx, AvxOpt::Unroll(2));
        set_defaults(before);
    }
}
