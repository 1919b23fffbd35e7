//! Range solver.
//!
//! Assigns every loop index a concrete axis, as a `Range<isize>` expression
//! over the preamble view bindings. Shifted indices intersect their
//! candidates; unshifted indices take the first candidate as nominal and
//! assert agreement with the rest at run time. Entangled pairs resolve the
//! directly-constrained side first and derive the partner from the
//! containing axis.

use crate::error::{Error, Result};
use crate::store::Store;
use proc_macro2::TokenStream;
use quote::quote;

pub fn ax_ident(ix: &str) -> syn::Ident {
    quote::format_ident!("__ax_{}", ix)
}

pub fn solve(st: &mut Store) -> Result<()> {
    let todo = st.loop_ind();

    // Entangled pairs: iterate to a fixpoint so a pair can feed another.
    let mut have: Vec<String> = todo
        .iter()
        .filter(|ix| !st.constraints_of(ix).is_empty())
        .cloned()
        .collect();
    let mut derived: Vec<(String, TokenStream, String)> = Vec::new(); // (receiver, range, donor)
    let mut pending = st.pair_constraints.clone();
    loop {
        let mut progressed = false;
        pending.retain(|pc| {
            let a_ok = have.contains(&pc.a);
            let b_ok = have.contains(&pc.b);
            if !a_ok && !b_ok {
                return true;
            }
            let (donor, receiver) = if a_ok {
                (pc.a.clone(), pc.b.clone())
            } else {
                (pc.b.clone(), pc.a.clone())
            };
            let axis = &pc.axis;
            let donor_ax = ax_ident(&donor);
            derived.push((
                receiver.clone(),
                quote! { ixsum_runtime::outer_minus(#axis, &#donor_ax) },
                donor,
            ));
            if !have.contains(&receiver) {
                have.push(receiver);
            }
            progressed = true;
            false
        });
        if !progressed {
            break;
        }
    }
    if let Some(pc) = pending.first() {
        return Err(Error::Unconstrained(pc.a.clone()));
    }

    // Emit definitions donor-first.
    let mut emitted: Vec<String> = Vec::new();
    let mut defs = Vec::new();
    let mut asserts = Vec::new();
    while emitted.len() < todo.len() {
        let before = emitted.len();
        for ix in &todo {
            if emitted.contains(ix) {
                continue;
            }
            let my_derived: Vec<_> = derived.iter().filter(|(r, _, _)| r == ix).collect();
            if my_derived.iter().any(|(_, _, donor)| !emitted.contains(donor)) {
                continue;
            }
            let def = define(st, ix, &my_derived, &mut asserts)?;
            defs.push((ix.clone(), def));
            emitted.push(ix.clone());
        }
        assert!(emitted.len() > before, "pair resolution order is acyclic");
    }

    st.axis_defs = defs;
    st.axis_asserts = asserts;
    Ok(())
}

fn define(
    st: &Store,
    ix: &str,
    derived: &[&(String, TokenStream, String)],
    asserts: &mut Vec<TokenStream>,
) -> Result<TokenStream> {
    let from_arrays: Vec<TokenStream> = st
        .constraints_of(ix)
        .iter()
        .filter(|c| !c.declared)
        .map(|c| c.range.clone())
        .collect();
    let declared: Vec<TokenStream> = st
        .constraints_of(ix)
        .iter()
        .filter(|c| c.declared)
        .map(|c| c.range.clone())
        .collect();
    let narrowing: Vec<TokenStream> = declared
        .into_iter()
        .chain(derived.iter().map(|(_, r, _)| r.clone()))
        .collect();

    if st.is_shifted(ix) {
        let all: Vec<TokenStream> = from_arrays.into_iter().chain(narrowing).collect();
        if all.is_empty() {
            return Err(Error::Unconstrained(ix.to_string()));
        }
        Ok(fold_intersect(all))
    } else if let Some((nominal, rest)) = from_arrays.split_first() {
        let ax = ax_ident(ix);
        for other in rest {
            asserts.push(quote! {
                ixsum_runtime::assert_same_axis(&#ax, &(#other), #ix);
            });
        }
        let mut all = vec![nominal.clone()];
        all.extend(narrowing);
        Ok(fold_intersect(all))
    } else if !narrowing.is_empty() {
        Ok(fold_intersect(narrowing))
    } else {
        Err(Error::Unconstrained(ix.to_string()))
    }
}

fn fold_intersect(cands: Vec<TokenStream>) -> TokenStream {
    let mut iter = cands.into_iter();
    let mut out = iter.next().expect("at least one candidate");
    for c in iter {
        out = quote! { ixsum_runtime::intersect(#out, #c) };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze;
    use crate::options::Options;
    use crate::scan::scan;
    use proc_macro2::TokenStream;
    use std::str::FromStr;

    fn solved(src: &str) -> Result<Store> {
        let scanned = scan(TokenStream::from_str(src).unwrap())?;
        let eq = scanned.equation.expect("equation");
        let mut st = analyze(&eq, &scanned.ranges, &Options::default())?;
        solve(&mut st)?;
        Ok(st)
    }

    fn def_of<'a>(st: &'a Store, ix: &str) -> &'a TokenStream {
        &st.axis_defs.iter().find(|(s, _)| s == ix).unwrap().1
    }

    #[test]
    fn matmul_axes() {
        let st = solved("z[i, k] := a[i, j] * b[j, k]").unwrap();
        assert_eq!(st.axis_defs.len(), 3);
        assert!(def_of(&st, "i").to_string().contains("__a0 . len_of"));
        assert!(def_of(&st, "k").to_string().contains("__a1 . len_of"));
        // j appears in both arrays: one runtime agreement check
        assert_eq!(st.axis_asserts.len(), 1);
        assert!(st.axis_asserts[0].to_string().contains("assert_same_axis"));
    }

    #[test]
    fn shifted_intersection() {
        let st = solved("z[i] := a[i] + a[i + 1]").unwrap();
        let def = def_of(&st, "i").to_string();
        assert!(def.contains("intersect"));
        assert!(def.contains("scaled_axis"));
        assert!(st.axis_asserts.is_empty());
    }

    #[test]
    fn convolution_derives_from_pair() {
        let st = solved("z[i, j] := a[i + x, j + y] * k[x, y]").unwrap();
        // x and y resolve from k's axes, i and j derive via outer_minus
        assert!(def_of(&st, "x").to_string().contains("__a1"));
        assert!(def_of(&st, "i").to_string().contains("outer_minus"));
        // donors must be defined before receivers
        let order: Vec<&str> = st.axis_defs.iter().map(|(s, _)| s.as_str()).collect();
        let at = |ix: &str| order.iter().position(|s| *s == ix).unwrap();
        assert!(at("x") < at("i"));
        assert!(at("y") < at("j"));
    }

    #[test]
    fn declared_range_narrows() {
        let st = solved("z[i] := a[i], i in 0..3").unwrap();
        assert!(def_of(&st, "i").to_string().contains("intersect"));
    }

    #[test]
    fn unconstrained_pair() {
        assert_eq!(
            solved("z[i] := a[i + j]").unwrap_err(),
            Error::Unconstrained("i".into())
        );
    }

    #[test]
    fn unconstrained_index() {
        assert_eq!(
            solved("z[i] := $x * 1.0").unwrap_err(),
            Error::Unconstrained("i".into())
        );
    }
}
