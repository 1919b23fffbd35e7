//! Forward loop-nest synthesis.
//!
//! Emits the preamble (views, rank checks, axis definitions), the output
//! allocation or rebinding, up to three kernel closures, and the dispatch
//! through the runtime threader. The kernel template is:
//!
//! ```text
//! for each free index:                  # outer nest, splittable
//!     acc = keep == Fresh ? init : z[..]
//!     for each reduction index:         # inner nest
//!         acc = red(acc, rhs)
//!     z[..] = acc
//! ```
//!
//! with the no-reduction case collapsing to a single write.

use super::{
    combine, emit_rhs, fingerprint, identity, ix_ident, left_index, loop_subst, start_subst, Subst,
};
use crate::ranges::ax_ident;
use crate::store::{EqOp, Store};
use proc_macro2::{Literal, TokenStream};
use quote::quote;

/// Auto-threading threshold before dividing by the cost estimate.
const BLOCK_BASE: usize = 1 << 18;

pub fn emit_forward(st: &Store, has_gradient: bool) -> TokenStream {
    let prelude = prelude(st, false);
    let origin = origin_asserts(st);
    let rep = rep_binding(st, false);
    let kernels = kernel_block(st);
    let registry = registry_block(st, has_gradient);

    if st.left_scalar.is_some() {
        let seed = match st.op {
            EqOp::Create => quote! { ixsum_runtime::zero_like(&__rep) },
            _ => {
                let s = st.left_scalar.as_ref().expect("scalar output");
                quote! { #s }
            }
        };
        quote! {
            {
                #(#prelude)*
                #rep
                let mut __out = ndarray::arr0(#seed);
                #kernels
                #registry
                __out.into_scalar()
            }
        }
    } else if st.op == EqOp::Create {
        let dims = out_dims(st);
        quote! {
            {
                #(#prelude)*
                #(#origin)*
                #rep
                let mut __out = ndarray::Array::from_elem(
                    [#(#dims),*],
                    ixsum_runtime::zero_like(&__rep),
                );
                #kernels
                #registry
                __out
            }
        }
    } else {
        let z = st.left_array.as_ref().expect("existing output");
        let rank = Literal::usize_suffixed(st.left_raw.len());
        let msg = format!(
            "rank mismatch: `{z}` is indexed with {} indices",
            st.left_raw.len()
        );
        let zeroing = st.flags.zero && st.op == EqOp::Assign;
        let fill = if zeroing {
            quote! { __zv.fill(ixsum_runtime::zero_like(&__rep)); }
        } else {
            TokenStream::new()
        };
        let mutable = if zeroing { quote! { mut } } else { TokenStream::new() };
        quote! {
            {
                let #mutable __zv = #z.view_mut();
                assert_eq!(__zv.ndim(), #rank, #msg);
                #(#prelude)*
                #(#origin)*
                #rep
                #fill
                #kernels
                #registry
            }
        }
    }
}

/// View bindings, rank checks and axis definitions. With `captured` set the
/// views come from the pullback's owned copies instead of the caller's
/// names.
pub(super) fn prelude(st: &Store, captured: bool) -> Vec<TokenStream> {
    let mut out = Vec::new();
    for (n, a) in st.arrays.iter().enumerate() {
        let local = &a.local;
        if captured {
            let cap = cap_ident(n);
            out.push(quote! { let #local = #cap.view(); });
        } else {
            match (&a.name, &a.lifted) {
                (Some(name), _) => out.push(quote! { let #local = #name.view(); }),
                (None, Some(e)) => {
                    let bound = quote::format_ident!("__l{}", n);
                    out.push(quote! {
                        let #bound = #e;
                        let #local = #bound.view();
                    });
                }
                (None, None) => unreachable!("array without name or lifted source"),
            }
        }
    }
    for (at, rank) in &st.ranks {
        let local = &st.arrays[*at].local;
        let r = Literal::usize_suffixed(*rank);
        let msg = format!(
            "rank mismatch: `{}` is indexed with {rank} indices",
            st.arrays[*at].display_name()
        );
        out.push(quote! { assert_eq!(#local.ndim(), #r, #msg); });
    }
    for (ix, expr) in &st.axis_defs {
        let ax = ax_ident(ix);
        out.push(quote! { let #ax: ::core::ops::Range<isize> = #expr; });
    }
    out.extend(st.axis_asserts.iter().cloned());
    out
}

pub(super) fn cap_ident(n: usize) -> syn::Ident {
    quote::format_ident!("__g{}", n)
}

pub(super) fn origin_asserts(st: &Store) -> Vec<TokenStream> {
    st.left_ind
        .iter()
        .map(|ix| {
            let ax = ax_ident(ix);
            quote! { ixsum_runtime::assert_zero_origin(&#ax, #ix); }
        })
        .collect()
}

/// Representative value of the right-hand side at the first index of every
/// axis; pins the element type for allocation and initializers.
pub(super) fn rep_binding(st: &Store, _captured: bool) -> TokenStream {
    let rhs = emit_rhs(st, &st.full_rhs(), &start_subst);
    quote! { let __rep = #rhs; }
}

fn out_dims(st: &Store) -> Vec<TokenStream> {
    st.left_raw
        .iter()
        .map(|raw| match raw {
            crate::store::LeftRaw::Sym(ix) => {
                let ax = ax_ident(ix);
                quote! { ixsum_runtime::axis_len(&#ax) }
            }
            crate::store::LeftRaw::Pin(_) => quote! { 1usize },
            crate::store::LeftRaw::Scalar(_) => {
                unreachable!("scalar positions rejected for new arrays")
            }
        })
        .collect()
}

// ---- kernels -----------------------------------------------------------

fn kernel_block(st: &Store) -> TokenStream {
    let shared = if st.op == EqOp::Create || st.left_scalar.is_some() {
        quote! { let __z = ixsum_runtime::SharedView::new(__out.view_mut()); }
    } else {
        quote! { let __z = ixsum_runtime::SharedView::new(__zv); }
    };
    let keep0 = match st.op {
        EqOp::Accum => quote! { ixsum_runtime::Keep::Accumulate },
        _ => quote! { ixsum_runtime::Keep::Fresh },
    };

    let unroll = match (st.opts.avx, st.flags.noavx, st.red_ind.is_empty()) {
        (crate::options::AvxOpt::Unroll(u), false, false) if u > 1 => Some(u),
        _ => None,
    };
    let grid = st.opts.cuda > 0;

    let host = host_kernel(st);
    let has_simd = unroll.is_some();
    let simd = unroll
        .map(|u| unrolled_kernel(st, u))
        .unwrap_or_default();
    let gridk = if grid { grid_kernel(st) } else { TokenStream::new() };

    let lens: Vec<TokenStream> = if grid {
        st.left_ind
            .iter()
            .map(|ix| {
                let ax = ax_ident(ix);
                let len = len_ident(ix);
                quote! { let #len = ixsum_runtime::axis_len(&#ax); }
            })
            .collect()
    } else {
        Vec::new()
    };

    let nf = Literal::usize_unsuffixed(st.left_ind.len());
    let nr = Literal::usize_unsuffixed(st.red_ind.len());
    let ax_free: Vec<_> = st.left_ind.iter().map(|ix| ax_ident(ix)).collect();
    let ax_red: Vec<_> = st.red_ind.iter().map(|ix| ax_ident(ix)).collect();
    let threads = threads_tokens(st);
    let block = Literal::usize_suffixed((BLOCK_BASE / st.cost).max(1));

    let host_call = quote! {
        ixsum_runtime::threader(&__host, &__outer, &__inner, &__launch, __keep0);
    };
    let dispatch = if !has_simd && !grid {
        host_call
    } else {
        let mut arms = Vec::new();
        if grid {
            let len_free: Vec<_> = st.left_ind.iter().map(|ix| len_ident(ix)).collect();
            let cuda_block = Literal::usize_suffixed(st.opts.cuda);
            arms.push(quote! {
                ixsum_runtime::StorageKind::Device => {
                    let __total = 1usize #( * #len_free )*;
                    ixsum_runtime::launch_grid(&__grid, __total, #cuda_block, &__launch);
                }
            });
        }
        if has_simd {
            arms.push(quote! {
                ixsum_runtime::StorageKind::HostVectorizable => {
                    ixsum_runtime::threader(&__simd, &__outer, &__inner, &__launch, __keep0);
                }
            });
        }
        arms.push(quote! { _ => { #host_call } });
        let device = grid;
        quote! {
            match ixsum_runtime::storage_kind_of(&__rep, #device) {
                #(#arms)*
            }
        }
    };

    quote! {
        {
            #shared
            let __keep0 = #keep0;
            #(#lens)*
            #host
            #simd
            #gridk
            let __outer: [::core::ops::Range<isize>; #nf] = [#(#ax_free.clone()),*];
            let __inner: [::core::ops::Range<isize>; #nr] = [#(#ax_red.clone()),*];
            let __launch = ixsum_runtime::Launch { threads: #threads, block: #block };
            #dispatch
        }
    }
}

fn len_ident(ix: &str) -> syn::Ident {
    quote::format_ident!("__len_{}", ix)
}

fn threads_tokens(st: &Store) -> TokenStream {
    match st.opts.threads {
        crate::options::ThreadsOpt::Off => quote! { ixsum_runtime::Threads::Off },
        crate::options::ThreadsOpt::Auto => quote! { ixsum_runtime::Threads::Auto },
        crate::options::ThreadsOpt::Min(m) => {
            let m = Literal::usize_suffixed(m);
            quote! { ixsum_runtime::Threads::Min(#m) }
        }
    }
}

/// Accumulator initializer for a fresh cell: the reduction identity plus
/// any terms that sit outside the reduction.
fn fresh_init(st: &Store, subst: Subst) -> TokenStream {
    let mut out = identity(st.red_op);
    for (neg, term) in &st.post {
        let t = emit_rhs(st, term, subst);
        out = if *neg {
            quote! { (#out - (#t)) }
        } else {
            quote! { (#out + (#t)) }
        };
    }
    out
}

/// The per-cell body shared by every kernel variant.
fn cell_body(st: &Store, keep: &TokenStream, red_range: &dyn Fn(usize, &str) -> TokenStream, unroll: Option<usize>) -> TokenStream {
    let zi = left_index(st, &loop_subst);
    if st.red_ind.is_empty() {
        let v = emit_rhs(st, &st.full_rhs(), &loop_subst);
        let overwrite = quote! { unsafe { __z.write(&[#(#zi),*], __v); } };
        let accumulate = {
            let c = combine(
                st.red_op,
                quote! { __cur },
                quote! { __v },
            );
            quote! {
                let __cur = unsafe { __z.read(&[#(#zi),*]) };
                unsafe { __z.write(&[#(#zi),*], #c); }
            }
        };
        return quote! {
            let __v = #v;
            match #keep {
                ixsum_runtime::Keep::Fresh => { #overwrite }
                ixsum_runtime::Keep::Accumulate => { #accumulate }
            }
        };
    }

    let init = fresh_init(st, &loop_subst);
    let reduced = st.reduced.as_ref().expect("reduction body");
    let step = {
        let rhs = emit_rhs(st, reduced, &loop_subst);
        let c = combine(st.red_op, quote! { __acc }, rhs);
        quote! { __acc = #c; }
    };

    // Innermost loop, optionally unrolled into independent accumulators.
    let last = st.red_ind.len() - 1;
    let last_ix = &st.red_ind[last];
    let jvar = ix_ident(last_ix);
    let innermost = match unroll {
        None => {
            let r = red_range(last, last_ix);
            quote! { for #jvar in #r { #step } }
        }
        Some(u) => {
            let r = red_range(last, last_ix);
            let unit = identity(st.red_op);
            let un = Literal::usize_suffixed(u);
            let ui = Literal::isize_suffixed(u as isize);
            let lanes: Vec<TokenStream> = (0..u)
                .map(|lane| {
                    let li = Literal::isize_suffixed(lane as isize);
                    let lu = Literal::usize_suffixed(lane);
                    let rhs = emit_rhs(st, reduced, &loop_subst);
                    let c = combine(st.red_op, quote! { __accs[#lu] }, rhs);
                    quote! {
                        {
                            let #jvar = __cursor + #li;
                            __accs[#lu] = #c;
                        }
                    }
                })
                .collect();
            let folds: Vec<TokenStream> = (0..u)
                .map(|lane| {
                    let lu = Literal::usize_suffixed(lane);
                    let c = combine(st.red_op, quote! { __acc }, quote! { __accs[#lu] });
                    quote! { __acc = #c; }
                })
                .collect();
            quote! {
                {
                    let __r = #r;
                    let mut __accs = [#unit; #un];
                    let mut __cursor = __r.start;
                    while __cursor + #ui <= __r.end {
                        #(#lanes)*
                        __cursor += #ui;
                    }
                    for #jvar in __cursor..__r.end { #step }
                    #(#folds)*
                }
            }
        }
    };

    let mut red_nest = innermost;
    for (k, ix) in st.red_ind.iter().enumerate().rev().skip(1) {
        let var = ix_ident(ix);
        let r = red_range(k, ix);
        red_nest = quote! { for #var in #r { #red_nest } };
    }

    quote! {
        let mut __acc = match #keep {
            ixsum_runtime::Keep::Fresh => #init,
            ixsum_runtime::Keep::Accumulate => unsafe { __z.read(&[#(#zi),*]) },
        };
        #red_nest
        unsafe { __z.write(&[#(#zi),*], __acc); }
    }
}

fn outer_loops(st: &Store, body: TokenStream) -> TokenStream {
    let mut nest = body;
    for (k, ix) in st.left_ind.iter().enumerate().rev() {
        let var = ix_ident(ix);
        let kl = Literal::usize_unsuffixed(k);
        nest = quote! { for #var in __outer[#kl].clone() { #nest } };
    }
    nest
}

fn param_range(k: usize, _ix: &str) -> TokenStream {
    let kl = Literal::usize_unsuffixed(k);
    quote! { __inner[#kl].clone() }
}

fn host_kernel(st: &Store) -> TokenStream {
    let keep = quote! { __keep };
    let body = cell_body(st, &keep, &param_range, None);
    let nest = outer_loops(st, body);
    quote! {
        let __host = |__outer: &[::core::ops::Range<isize>],
                      __inner: &[::core::ops::Range<isize>],
                      __keep: ixsum_runtime::Keep| {
            #nest
        };
    }
}

fn unrolled_kernel(st: &Store, unroll: usize) -> TokenStream {
    let keep = quote! { __keep };
    let body = cell_body(st, &keep, &param_range, Some(unroll));
    let nest = outer_loops(st, body);
    quote! {
        let __simd = |__outer: &[::core::ops::Range<isize>],
                      __inner: &[::core::ops::Range<isize>],
                      __keep: ixsum_runtime::Keep| {
            #nest
        };
    }
}

fn grid_kernel(st: &Store) -> TokenStream {
    let keep = quote! { __keep0 };
    let axis_range = |_k: usize, ix: &str| {
        let ax = ax_ident(ix);
        quote! { #ax.clone() }
    };
    let body = cell_body(st, &keep, &axis_range, None);

    // Decode free indices from the flat id, last axis fastest.
    let mut decode = Vec::new();
    let n = st.left_ind.len();
    if n == 1 {
        let var = ix_ident(&st.left_ind[0]);
        let ax = ax_ident(&st.left_ind[0]);
        decode.push(quote! { let #var = #ax.start + (__gid as isize); });
    } else if n > 1 {
        decode.push(quote! { let mut __rem = __gid; });
        for (k, ix) in st.left_ind.iter().enumerate().rev() {
            let var = ix_ident(ix);
            let ax = ax_ident(ix);
            let len = len_ident(ix);
            if k == 0 {
                decode.push(quote! { let #var = #ax.start + (__rem as isize); });
            } else {
                decode.push(quote! {
                    let #var = #ax.start + ((__rem % #len) as isize);
                    __rem /= #len;
                });
            }
        }
    }

    let origin: Vec<TokenStream> = st
        .loop_ind()
        .iter()
        .map(|ix| {
            let ax = ax_ident(ix);
            quote! { ixsum_runtime::assert_zero_origin(&#ax, #ix); }
        })
        .collect();

    quote! {
        let __grid = |__ids: ::core::ops::Range<usize>| {
            #(#origin)*
            for __gid in __ids {
                #(#decode)*
                #body
            }
        };
    }
}

fn registry_block(st: &Store, has_gradient: bool) -> TokenStream {
    let fp = Literal::u64_suffixed(fingerprint(st));
    let eq = st.equation();
    let names: Vec<String> = st.left_names.iter().map(|(n, _)| n.clone()).collect();
    quote! {
        {
            static __IXSUM_REGISTERED: ::std::sync::Once = ::std::sync::Once::new();
            __IXSUM_REGISTERED.call_once(|| {
                ixsum_runtime::registry::register(ixsum_runtime::registry::KernelRecord {
                    fingerprint: #fp,
                    equation: #eq.to_string(),
                    axis_names: vec![#(#names.to_string()),*],
                    has_gradient: #has_gradient,
                });
            });
        }
    }
}
