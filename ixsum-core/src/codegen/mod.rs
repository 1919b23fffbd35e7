//! Code generation.
//!
//! Everything here folds the analyzed store into token fragments; the
//! emitted code only ever calls `ndarray` and `ixsum-runtime` by fully
//! qualified path, so the expansion works wherever those crates are in
//! scope.

pub mod grad;
pub mod nest;

use crate::ranges::ax_ident;
use crate::store::{Access, Affine, LeftRaw, RedOp, Rhs, Store};
use proc_macro2::{Literal, TokenStream};
use quote::quote;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// Maps an index symbol to the tokens standing in for it inside an emitted
/// expression: the loop variable, or an axis start for the representative.
pub(crate) type Subst<'a> = &'a dyn Fn(&str) -> TokenStream;

pub(crate) fn ix_ident(ix: &str) -> syn::Ident {
    quote::format_ident!("{}", ix)
}

pub(crate) fn loop_subst(ix: &str) -> TokenStream {
    let id = ix_ident(ix);
    quote! { #id }
}

pub(crate) fn start_subst(ix: &str) -> TokenStream {
    let ax = ax_ident(ix);
    quote! { (#ax.start) }
}

/// Emit one affine index as an `isize` expression.
pub(crate) fn emit_affine(aff: &Affine, subst: Subst) -> TokenStream {
    let mut pieces: Vec<TokenStream> = Vec::new();
    for (ix, scale) in &aff.vars {
        let v = subst(ix);
        pieces.push(match scale {
            1 => v,
            -1 => quote! { (- #v) },
            s => {
                let s = Literal::isize_suffixed(*s as isize);
                quote! { (#s * #v) }
            }
        });
    }
    for (id, coef) in &aff.scalars {
        pieces.push(match coef {
            1 => quote! { (#id as isize) },
            -1 => quote! { (- (#id as isize)) },
            c => {
                let c = Literal::isize_suffixed(*c as isize);
                quote! { (#c * (#id as isize)) }
            }
        });
    }
    if aff.lit != 0 || pieces.is_empty() {
        let l = Literal::isize_suffixed(aff.lit as isize);
        pieces.push(quote! { #l });
    }
    let mut iter = pieces.into_iter();
    let mut out = iter.next().expect("at least one piece");
    for p in iter {
        out = quote! { (#out + #p) };
    }
    out
}

/// Index list of one access, as `usize` expressions.
pub(crate) fn access_index(access: &Access, subst: Subst) -> Vec<TokenStream> {
    access
        .index
        .iter()
        .map(|aff| {
            let e = emit_affine(aff, subst);
            quote! { ((#e) as usize) }
        })
        .collect()
}

pub(crate) fn emit_access(st: &Store, access: &Access, subst: Subst) -> TokenStream {
    let local = &st.arrays[access.array].local;
    let idx = access_index(access, subst);
    quote! { #local[[#(#idx),*]] }
}

/// Emit the canonical right-hand-side tree.
pub(crate) fn emit_rhs(st: &Store, rhs: &Rhs, subst: Subst) -> TokenStream {
    match rhs {
        Rhs::Access(at) => emit_access(st, &st.accesses[*at], subst),
        Rhs::Scalar(id) => quote! { #id },
        Rhs::Lit(lit) => quote! { #lit },
        Rhs::Path(p) => quote! { #p },
        Rhs::Unary(op, e) => {
            let e = emit_rhs(st, e, subst);
            quote! { (#op #e) }
        }
        Rhs::Binary(op, l, r) => {
            let l = emit_rhs(st, l, subst);
            let r = emit_rhs(st, r, subst);
            quote! { (#l #op #r) }
        }
        Rhs::Method { recv, method, args } => {
            let recv = emit_rhs(st, recv, subst);
            let args: Vec<_> = args.iter().map(|a| emit_rhs(st, a, subst)).collect();
            quote! { (#recv).#method(#(#args),*) }
        }
        Rhs::Call { func, args } => {
            let args: Vec<_> = args.iter().map(|a| emit_rhs(st, a, subst)).collect();
            quote! { #func(#(#args),*) }
        }
        Rhs::Field { base, member } => {
            let base = emit_rhs(st, base, subst);
            quote! { (#base).#member }
        }
        Rhs::Chain { base, index } => {
            let base = emit_rhs(st, base, subst);
            quote! { (#base)[(#index) as usize] }
        }
        Rhs::Tuple(items) => {
            let items: Vec<_> = items.iter().map(|x| emit_rhs(st, x, subst)).collect();
            quote! { (#(#items),*) }
        }
        Rhs::Cast { expr, ty } => {
            let e = emit_rhs(st, expr, subst);
            quote! { ((#e) as #ty) }
        }
    }
}

/// Emit the reduced body in dual-number arithmetic, perturbing one access.
pub(crate) fn emit_rhs_dual(st: &Store, rhs: &Rhs, subst: Subst, target: usize) -> TokenStream {
    match rhs {
        Rhs::Access(at) => {
            let v = emit_access(st, &st.accesses[*at], subst);
            if *at == target {
                quote! { ixsum_runtime::Dual::perturbed(#v) }
            } else {
                quote! { ixsum_runtime::Dual::constant(#v) }
            }
        }
        Rhs::Scalar(id) => quote! { ixsum_runtime::Dual::constant(#id) },
        Rhs::Lit(lit) => quote! { ixsum_runtime::Dual::constant(#lit) },
        Rhs::Path(p) => quote! { ixsum_runtime::Dual::constant(#p) },
        Rhs::Unary(op, e) => {
            let e = emit_rhs_dual(st, e, subst, target);
            quote! { (#op #e) }
        }
        Rhs::Binary(op, l, r) => {
            let l = emit_rhs_dual(st, l, subst, target);
            let r = emit_rhs_dual(st, r, subst, target);
            quote! { (#l #op #r) }
        }
        Rhs::Method { recv, method, args } => {
            let recv = emit_rhs_dual(st, recv, subst, target);
            // `powi` keeps its integer argument as-is.
            if method == "powi" {
                let args: Vec<_> = args.iter().map(|a| emit_rhs(st, a, subst)).collect();
                quote! { (#recv).#method(#(#args),*) }
            } else {
                let args: Vec<_> = args
                    .iter()
                    .map(|a| emit_rhs_dual(st, a, subst, target))
                    .collect();
                quote! { (#recv).#method(#(#args),*) }
            }
        }
        // dualizable() rejects the rest before emission
        _ => unreachable!("non-dualizable node survived the check"),
    }
}

/// Whether the dual strategy can evaluate a tree at all.
pub(crate) fn dualizable(rhs: &Rhs) -> bool {
    match rhs {
        Rhs::Access(_) | Rhs::Scalar(_) | Rhs::Lit(_) | Rhs::Path(_) => true,
        Rhs::Unary(op, e) => matches!(op, syn::UnOp::Neg(_)) && dualizable(e),
        Rhs::Binary(op, l, r) => {
            matches!(
                op,
                syn::BinOp::Add(_) | syn::BinOp::Sub(_) | syn::BinOp::Mul(_) | syn::BinOp::Div(_)
            ) && dualizable(l)
                && dualizable(r)
        }
        Rhs::Method { recv, method, args } => {
            const KNOWN: [&str; 8] = ["exp", "ln", "sin", "cos", "sqrt", "tanh", "powi", "powf"];
            KNOWN.contains(&method.to_string().as_str())
                && dualizable(recv)
                && args.iter().all(dualizable)
        }
        _ => false,
    }
}

/// Output index list, as `usize` expressions over a substitution.
pub(crate) fn left_index(st: &Store, subst: Subst) -> Vec<TokenStream> {
    st.left_raw
        .iter()
        .map(|raw| match raw {
            LeftRaw::Sym(ix) => {
                let v = subst(ix);
                quote! { ((#v) as usize) }
            }
            LeftRaw::Pin(p) => {
                let p = Literal::usize_suffixed(*p);
                quote! { #p }
            }
            LeftRaw::Scalar(id) => quote! { ((#id) as usize) },
        })
        .collect()
}

/// Reduction combine over two value fragments.
pub(crate) fn combine(op: RedOp, a: TokenStream, b: TokenStream) -> TokenStream {
    match op {
        RedOp::Sum => quote! { (#a) + (#b) },
        RedOp::Prod => quote! { (#a) * (#b) },
        RedOp::Max => quote! { ixsum_runtime::max_by(#a, #b) },
        RedOp::Min => quote! { ixsum_runtime::min_by(#a, #b) },
    }
}

/// Reduction identity over the representative binding.
pub(crate) fn identity(op: RedOp) -> TokenStream {
    match op {
        RedOp::Sum => quote! { ixsum_runtime::zero_like(&__rep) },
        RedOp::Prod => quote! { ixsum_runtime::one_like(&__rep) },
        RedOp::Max => quote! { ixsum_runtime::min_bound_like(&__rep) },
        RedOp::Min => quote! { ixsum_runtime::max_bound_like(&__rep) },
    }
}

/// Stable fingerprint of the canonical analysis, keying the kernel registry.
pub(crate) fn fingerprint(st: &Store) -> u64 {
    let mut h = FxHasher::default();
    st.equation().hash(&mut h);
    st.fingerprint_extra.hash(&mut h);
    h.finish()
}

/// Top-level assembly: the full expansion for one invocation.
pub fn emit(st: &Store) -> TokenStream {
    let pullback = grad::emit_pullback(st);
    let has_gradient = pullback.is_some();
    let forward = nest::emit_forward(st, has_gradient);

    let binding = match (&st.left_scalar, &st.left_array, st.op) {
        (Some(s), _, crate::store::EqOp::Create) => quote! { let #s = #forward; },
        (Some(s), _, _) => quote! { #s = #forward; },
        (None, Some(z), crate::store::EqOp::Create) => quote! { let #z = #forward; },
        (None, Some(_), _) => quote! { #forward; },
        // Anonymous output: the expansion is an expression.
        (None, None, _) => quote! { #forward },
    };

    match pullback {
        Some((name, closure)) => quote! {
            #binding
            let #name = #closure;
        },
        None => binding,
    }
}
