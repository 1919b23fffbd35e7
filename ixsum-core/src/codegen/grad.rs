//! Reverse-mode gradient synthesis.
//!
//! When the call site asks for a gradient, the expansion also binds
//! `<name>_grad`, a pullback closure over owned copies of the inputs:
//! called with the adjoint of the output it returns one gradient array per
//! right-hand-side array, in appearance order.
//!
//! Two strategies: symbolic differentiation of the reduced body per (array,
//! appearance) with a small rule table, or dual-number re-evaluation with
//! one perturbed access per array. The gradient nest iterates shared
//! indices outermost, which is what makes the threaded writes race-free.

use super::nest::{cap_ident, prelude, rep_binding};
use super::{
    access_index, dualizable, emit_rhs, emit_rhs_dual, ix_ident, left_index, loop_subst,
};
use crate::options::GradMode;
use crate::ranges::ax_ident;
use crate::store::{LeftRaw, Rhs, Store};
use proc_macro2::{Literal, Span, TokenStream};
use quote::quote;

enum Update {
    /// `d{array}[inds] += dz * ∂rhs/∂(appearance)`.
    Symbolic(usize, Rhs),
    /// `d{array}[inds] += dz * eps(rhs with appearance perturbed)`.
    Dual(usize),
    /// Strategy defeated for this array; fill with poison.
    Poison,
}

pub fn emit_pullback(st: &Store) -> Option<(syn::Ident, TokenStream)> {
    if st.opts.grad == GradMode::Off
        || !st.flags.newarray
        || st.flags.nograd
        || st.arrays.is_empty()
    {
        return None;
    }
    let out_name = st.left_array.as_ref().or(st.left_scalar.as_ref())?;
    let reduced = st.reduced.as_ref()?;

    // One planned update per array.
    let mut plans: Vec<Vec<Update>> = (0..st.arrays.len()).map(|_| Vec::new()).collect();
    match st.opts.grad {
        GradMode::Symbolic => {
            for (p, access) in st.accesses.iter().enumerate() {
                let d = diff(st, reduced, p)?;
                if !is_zero(&d) {
                    plans[access.array].push(Update::Symbolic(p, d));
                }
            }
        }
        GradMode::Dual => {
            if !dualizable(reduced) {
                return None;
            }
            for (n, plan) in plans.iter_mut().enumerate() {
                let appearances: Vec<usize> = st
                    .accesses
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| a.array == n)
                    .map(|(p, _)| p)
                    .collect();
                match appearances.as_slice() {
                    [p] => plan.push(Update::Dual(*p)),
                    _ => plan.push(Update::Poison),
                }
            }
        }
        GradMode::Off => unreachable!("checked above"),
    }

    let name = quote::format_ident!("{}_grad", out_name);
    let closure = pullback_tokens(st, &plans);
    Some((name, closure))
}

fn pullback_tokens(st: &Store, plans: &[Vec<Update>]) -> TokenStream {
    // Owned captures: inputs and scalars outlive the caller's borrows.
    let captures: Vec<TokenStream> = st
        .arrays
        .iter()
        .enumerate()
        .map(|(n, a)| {
            let cap = cap_ident(n);
            match (&a.name, &a.lifted) {
                (Some(name), _) => quote! { let #cap = #name.to_owned(); },
                (None, Some(e)) => quote! { let #cap = (#e).to_owned(); },
                (None, None) => unreachable!("array without name or lifted source"),
            }
        })
        .collect();
    let scalar_caps: Vec<TokenStream> = st
        .scalars
        .iter()
        .map(|s| quote! { let #s = #s.clone(); })
        .collect();

    let body = prelude(st, true);
    let rep = rep_binding(st, true);
    let scalar_out = st.left_scalar.is_some();

    let (dz_ty, coupling, shape_check, dz_read) = if scalar_out {
        (
            quote! { &_ },
            quote! { ixsum_runtime::same_scalar(__dz, &__rep); },
            TokenStream::new(),
            quote! { *__dz },
        )
    } else {
        let dim = quote::format_ident!("Ix{}", st.left_raw.len());
        let first = &st.arrays[0].local;
        let dims: Vec<TokenStream> = st
            .left_raw
            .iter()
            .map(|raw| match raw {
                LeftRaw::Sym(ix) => {
                    let ax = ax_ident(ix);
                    quote! { ixsum_runtime::axis_len(&#ax) }
                }
                LeftRaw::Pin(_) => quote! { 1usize },
                LeftRaw::Scalar(_) => unreachable!("rejected for new arrays"),
            })
            .collect();
        let zi = left_index(st, &loop_subst);
        (
            quote! { &ndarray::Array<_, ndarray::#dim> },
            quote! { ixsum_runtime::same_elem(__dz, &#first); },
            quote! { assert_eq!(__dz.shape(), &[#(#dims),*][..], "adjoint shape mismatch"); },
            quote! { __dz[[#(#zi),*]] },
        )
    };

    // Gradient allocations; poisoned arrays are filled and never written.
    let mut allocs = Vec::new();
    let mut views = Vec::new();
    for (n, a) in st.arrays.iter().enumerate() {
        let d = d_ident(n);
        let local = &a.local;
        let poisoned = matches!(plans[n].as_slice(), [Update::Poison]);
        if poisoned {
            let label = a.display_name();
            allocs.push(quote! {
                ixsum_runtime::dual_poison_note(#label);
                let #d = ndarray::Array::from_elem(
                    #local.raw_dim(),
                    ixsum_runtime::poison_like(&__rep),
                );
            });
        } else {
            allocs.push(quote! {
                let mut #d = ndarray::Array::from_elem(
                    #local.raw_dim(),
                    ixsum_runtime::zero_like(&__rep),
                );
            });
            let gz = gz_ident(n);
            views.push(quote! {
                let #gz = ixsum_runtime::SharedView::new(#d.view_mut());
            });
        }
    }

    let updates: Vec<TokenStream> = plans
        .iter()
        .enumerate()
        .flat_map(|(n, plan)| {
            let gz = gz_ident(n);
            plan.iter()
                .filter_map(move |u| {
                    let (p, value) = match u {
                        Update::Symbolic(p, d) => {
                            let value = if is_one(d) {
                                quote! { __g }
                            } else {
                                let d = emit_rhs(st, d, &loop_subst);
                                quote! { __g * (#d) }
                            };
                            (*p, value)
                        }
                        Update::Dual(p) => {
                            let dual = emit_rhs_dual(
                                st,
                                st.reduced.as_ref().expect("reduction body"),
                                &loop_subst,
                                *p,
                            );
                            (*p, quote! { __g * (#dual).eps })
                        }
                        Update::Poison => return None,
                    };
                    let idx = access_index(&st.accesses[p], &loop_subst);
                    Some(quote! {
                        {
                            let __cur = unsafe { #gz.read(&[#(#idx),*]) };
                            unsafe { #gz.write(&[#(#idx),*], __cur + #value); }
                        }
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect();

    // Shared indices outermost: concurrent slices of every gradient are
    // disjoint along them.
    let shared = st.shared_ind.clone();
    let rest: Vec<String> = st
        .loop_ind()
        .into_iter()
        .filter(|ix| !shared.contains(ix))
        .collect();
    let mut nest = quote! {
        let __g = #dz_read;
        #(#updates)*
    };
    for (k, ix) in rest.iter().enumerate().rev() {
        let var = ix_ident(ix);
        let kl = Literal::usize_unsuffixed(k);
        nest = quote! { for #var in __rest[#kl].clone() { #nest } };
    }
    for (k, ix) in shared.iter().enumerate().rev() {
        let var = ix_ident(ix);
        let kl = Literal::usize_unsuffixed(k);
        nest = quote! { for #var in __shared[#kl].clone() { #nest } };
    }

    let ns = Literal::usize_unsuffixed(shared.len());
    let nr = Literal::usize_unsuffixed(rest.len());
    let ax_shared: Vec<_> = shared.iter().map(|ix| ax_ident(ix)).collect();
    let ax_rest: Vec<_> = rest.iter().map(|ix| ax_ident(ix)).collect();
    let threads = match st.opts.threads {
        crate::options::ThreadsOpt::Off => quote! { ixsum_runtime::Threads::Off },
        crate::options::ThreadsOpt::Auto => quote! { ixsum_runtime::Threads::Auto },
        crate::options::ThreadsOpt::Min(m) => {
            let m = Literal::usize_suffixed(m);
            quote! { ixsum_runtime::Threads::Min(#m) }
        }
    };

    let result: TokenStream = if st.arrays.len() == 1 {
        let d = d_ident(0);
        quote! { #d }
    } else {
        let ds: Vec<_> = (0..st.arrays.len()).map(d_ident).collect();
        quote! { (#(#ds),*) }
    };

    quote! {
        {
            #(#captures)*
            #(#scalar_caps)*
            move |__dz: #dz_ty| {
                #(#body)*
                #rep
                #coupling
                #shape_check
                #(#allocs)*
                {
                    #(#views)*
                    let __gk = |__shared: &[::core::ops::Range<isize>],
                                __rest: &[::core::ops::Range<isize>]| {
                        #nest
                    };
                    let __gshared: [::core::ops::Range<isize>; #ns] = [#(#ax_shared.clone()),*];
                    let __grest: [::core::ops::Range<isize>; #nr] = [#(#ax_rest.clone()),*];
                    let __glaunch = ixsum_runtime::Launch { threads: #threads, block: 1usize << 16 };
                    ixsum_runtime::grad_threader(&__gk, &__gshared, &__grest, &__glaunch);
                }
                #result
            }
        }
    }
}

fn d_ident(n: usize) -> syn::Ident {
    quote::format_ident!("__d{}", n)
}

fn gz_ident(n: usize) -> syn::Ident {
    quote::format_ident!("__gz{}", n)
}

// ---- symbolic rule table -----------------------------------------------

fn flit(digits: &str) -> Rhs {
    Rhs::Lit(syn::Lit::Float(syn::LitFloat::new(digits, Span::call_site())))
}

fn zero() -> Rhs {
    flit("0.0")
}

fn one() -> Rhs {
    flit("1.0")
}

fn int_arg(v: i64) -> Rhs {
    let lit = Rhs::Lit(syn::Lit::Int(syn::LitInt::new(
        &v.unsigned_abs().to_string(),
        Span::call_site(),
    )));
    if v < 0 {
        Rhs::Unary(syn::UnOp::Neg(Default::default()), Box::new(lit))
    } else {
        lit
    }
}

pub(super) fn is_zero(r: &Rhs) -> bool {
    matches!(r, Rhs::Lit(syn::Lit::Float(f)) if f.base10_digits() == "0.0")
}

fn is_one(r: &Rhs) -> bool {
    matches!(r, Rhs::Lit(syn::Lit::Float(f)) if f.base10_digits() == "1.0")
}

fn add(a: Rhs, b: Rhs) -> Rhs {
    if is_zero(&a) {
        return b;
    }
    if is_zero(&b) {
        return a;
    }
    Rhs::Binary(syn::BinOp::Add(Default::default()), Box::new(a), Box::new(b))
}

fn sub(a: Rhs, b: Rhs) -> Rhs {
    if is_zero(&b) {
        return a;
    }
    if is_zero(&a) {
        return neg(b);
    }
    Rhs::Binary(syn::BinOp::Sub(Default::default()), Box::new(a), Box::new(b))
}

fn neg(a: Rhs) -> Rhs {
    if is_zero(&a) {
        return a;
    }
    Rhs::Unary(syn::UnOp::Neg(Default::default()), Box::new(a))
}

fn mul(a: Rhs, b: Rhs) -> Rhs {
    if is_zero(&a) || is_zero(&b) {
        return zero();
    }
    if is_one(&a) {
        return b;
    }
    if is_one(&b) {
        return a;
    }
    Rhs::Binary(syn::BinOp::Mul(Default::default()), Box::new(a), Box::new(b))
}

fn div(a: Rhs, b: Rhs) -> Rhs {
    if is_zero(&a) {
        return zero();
    }
    if is_one(&b) {
        return a;
    }
    Rhs::Binary(syn::BinOp::Div(Default::default()), Box::new(a), Box::new(b))
}

fn call_method(recv: Rhs, name: &str) -> Rhs {
    Rhs::Method {
        recv: Box::new(recv),
        method: quote::format_ident!("{}", name),
        args: Vec::new(),
    }
}

fn contains(st: &Store, rhs: &Rhs, target: usize) -> bool {
    match rhs {
        Rhs::Access(p) => *p == target,
        Rhs::Scalar(_) | Rhs::Lit(_) | Rhs::Path(_) => false,
        Rhs::Unary(_, e) => contains(st, e, target),
        Rhs::Binary(_, l, r) => contains(st, l, target) || contains(st, r, target),
        Rhs::Method { recv, args, .. } => {
            contains(st, recv, target) || args.iter().any(|a| contains(st, a, target))
        }
        Rhs::Call { args, .. } => args.iter().any(|a| contains(st, a, target)),
        Rhs::Field { base, .. } => contains(st, base, target),
        Rhs::Chain { base, .. } => contains(st, base, target),
        Rhs::Tuple(items) => items.iter().any(|x| contains(st, x, target)),
        Rhs::Cast { expr, .. } => contains(st, expr, target),
    }
}

/// `∂ rhs / ∂ (appearance target)`, or `None` when no rule applies.
fn diff(st: &Store, rhs: &Rhs, target: usize) -> Option<Rhs> {
    match rhs {
        Rhs::Access(p) => Some(if *p == target { one() } else { zero() }),
        Rhs::Scalar(_) | Rhs::Lit(_) | Rhs::Path(_) => Some(zero()),
        Rhs::Unary(op, e) => match op {
            syn::UnOp::Neg(_) => Some(neg(diff(st, e, target)?)),
            _ => independent(st, rhs, target),
        },
        Rhs::Binary(op, l, r) => match op {
            syn::BinOp::Add(_) => Some(add(diff(st, l, target)?, diff(st, r, target)?)),
            syn::BinOp::Sub(_) => Some(sub(diff(st, l, target)?, diff(st, r, target)?)),
            syn::BinOp::Mul(_) => {
                let dl = diff(st, l, target)?;
                let dr = diff(st, r, target)?;
                Some(add(
                    mul(dl, (**r).clone()),
                    mul((**l).clone(), dr),
                ))
            }
            syn::BinOp::Div(_) => {
                let dl = diff(st, l, target)?;
                let dr = diff(st, r, target)?;
                // d(u/v) = du/v - u dv / v^2
                Some(sub(
                    div(dl, (**r).clone()),
                    div(
                        mul((**l).clone(), dr),
                        mul((**r).clone(), (**r).clone()),
                    ),
                ))
            }
            _ => independent(st, rhs, target),
        },
        Rhs::Method { recv, method, args } => {
            let name = method.to_string();
            if args.is_empty() {
                let d = diff(st, recv, target)?;
                let recv = (**recv).clone();
                return match name.as_str() {
                    "exp" => Some(mul(call_method(recv, "exp"), d)),
                    "ln" => Some(div(d, recv)),
                    "sin" => Some(mul(call_method(recv, "cos"), d)),
                    "cos" => Some(neg(mul(call_method(recv, "sin"), d))),
                    "sqrt" => Some(div(d, mul(flit("2.0"), call_method(recv, "sqrt")))),
                    "tanh" => {
                        let t = call_method(recv, "tanh");
                        Some(mul(sub(one(), mul(t.clone(), t)), d))
                    }
                    _ => independent(st, rhs, target),
                };
            }
            if name == "powi" && args.len() == 1 {
                if let Rhs::Lit(syn::Lit::Int(n)) = &args[0] {
                    let n: i64 = n.base10_parse().ok()?;
                    let d = diff(st, recv, target)?;
                    let recv = (**recv).clone();
                    let lower = match n - 1 {
                        0 => one(),
                        1 => recv.clone(),
                        m => Rhs::Method {
                            recv: Box::new(recv.clone()),
                            method: quote::format_ident!("powi"),
                            args: vec![int_arg(m)],
                        },
                    };
                    let coef = if n >= 0 {
                        flit(&format!("{n}.0"))
                    } else {
                        neg(flit(&format!("{}.0", -n)))
                    };
                    return Some(mul(mul(coef, lower), d));
                }
                return independent(st, rhs, target);
            }
            if name == "powf" && args.len() == 1 {
                if contains(st, &args[0], target) {
                    return None;
                }
                let d = diff(st, recv, target)?;
                let e = args[0].clone();
                let recv = (**recv).clone();
                let lower = Rhs::Method {
                    recv: Box::new(recv),
                    method: quote::format_ident!("powf"),
                    args: vec![sub(e.clone(), one())],
                };
                return Some(mul(mul(e, lower), d));
            }
            independent(st, rhs, target)
        }
        _ => independent(st, rhs, target),
    }
}

/// Fallback: a subtree with no rule differentiates to zero when it does not
/// touch the target, and defeats the gradient otherwise.
fn independent(st: &Store, rhs: &Rhs, target: usize) -> Option<Rhs> {
    if contains(st, rhs, target) {
        None
    } else {
        Some(zero())
    }
}
