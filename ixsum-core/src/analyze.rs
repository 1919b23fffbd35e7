//! Expression analyzer.
//!
//! Classifies the left-hand side, walks the right-hand side bottom-up into
//! the canonical [`Rhs`] tree, and fills the store's index sets, range
//! constraints and flags. Multi-index accesses like `a[i, j]` are not
//! parseable Rust, so the token stream is rewritten to `a[(i, j)]` before
//! `syn` parses it.

use crate::error::{Error, Result};
use crate::options::Options;
use crate::scan::{Equation, RangeDecl};
use crate::store::{
    Access, Affine, Constraint, EqOp, LeftRaw, PairConstraint, RedOp, Rhs, Store,
};
use proc_macro2::{Delimiter, Group, Literal, Spacing, TokenStream, TokenTree};
use quote::quote;

pub fn analyze(eq: &Equation, ranges: &[RangeDecl], opts: &Options) -> Result<Store> {
    let mut st = Store::new(opts.clone(), eq.op, eq.interp.clone());
    parse_left(&mut st, eq.lhs.clone())?;

    // An existing output is itself range evidence for its indices; it goes
    // first so it becomes the nominal range.
    if st.op != EqOp::Create && st.left_array.is_some() {
        let zv = quote::format_ident!("__zv");
        for (k, raw) in st.left_raw.clone().iter().enumerate() {
            if let LeftRaw::Sym(ix) = raw {
                let kl = Literal::usize_unsuffixed(k);
                let range = quote! { (0isize)..(#zv.len_of(ndarray::Axis(#kl)) as isize) };
                st.add_constraint(
                    ix,
                    Constraint {
                        range,
                        declared: false,
                    },
                );
            }
        }
    }

    for decl in ranges {
        let range = declared_range(decl)?;
        st.add_constraint(
            &decl.index,
            Constraint {
                range,
                declared: true,
            },
        );
        st.fingerprint_extra
            .push_str(&format!("{} in {};", decl.index, decl.range));
    }

    let wrapped = wrap_index_brackets(eq.rhs.clone());
    let expr: syn::Expr = syn::parse2(wrapped)
        .map_err(|e| Error::Equation(format!("cannot parse right-hand side: {e}")))?;

    // Split the top-level additive chain; one term may be a reduction call.
    let terms = additive_terms(&expr);
    let mut red_call: Option<(RedOp, syn::Expr)> = None;
    let mut plain: Vec<(bool, syn::Expr)> = Vec::new();
    for (neg, term) in terms {
        match reduction_call(term) {
            Some((op, body)) => {
                if red_call.is_some() {
                    return Err(Error::Equation(
                        "at most one reduction call per equation".into(),
                    ));
                }
                if neg {
                    return Err(Error::Equation(
                        "a negated reduction call is not supported".into(),
                    ));
                }
                red_call = Some((op, body.clone()));
            }
            None => plain.push((neg, term.clone())),
        }
    }

    let red_body = match &red_call {
        Some((_, body)) => Some(walk(&mut st, body)?),
        None => None,
    };
    let mut walked: Vec<(bool, Rhs)> = Vec::new();
    for (neg, term) in &plain {
        walked.push((*neg, walk(&mut st, term)?));
    }

    st.red_ind = st
        .right_ind
        .iter()
        .filter(|ix| !st.left_ind.contains(ix))
        .cloned()
        .collect();
    st.shared_ind = shared_indices(&st);

    if let (Some(name), true) = (&st.left_array, st.flags.newarray) {
        if st
            .arrays
            .iter()
            .any(|a| a.name.as_ref().is_some_and(|n| n == name))
        {
            return Err(Error::SelfReference(name.to_string()));
        }
    }

    match (red_call, red_body) {
        (Some((op, _)), Some(body)) => {
            st.red_op = op;
            for (_, t) in &walked {
                if rhs_indices(&st, t).iter().any(|ix| st.red_ind.contains(ix)) {
                    return Err(Error::Equation(
                        "terms outside the reduction call must not use reduction indices".into(),
                    ));
                }
            }
            if op != RedOp::Sum && !walked.is_empty() {
                return Err(Error::Equation(
                    "extra terms are only supported with `+` reduction".into(),
                ));
            }
            st.reduced = Some(body);
            st.post = walked;
        }
        _ => {
            st.red_op = RedOp::Sum;
            if st.red_ind.is_empty() {
                st.reduced = Some(fold_terms(walked));
            } else {
                let mut reduced = Vec::new();
                let mut post = Vec::new();
                for (neg, t) in walked {
                    if rhs_indices(&st, &t).iter().any(|ix| st.red_ind.contains(ix)) {
                        reduced.push((neg, t));
                    } else {
                        post.push((neg, t));
                    }
                }
                st.reduced = Some(fold_terms(reduced));
                st.post = post;
            }
        }
    }

    if st.red_op != RedOp::Sum {
        st.flags.nograd = true;
    }
    if st.post.iter().any(|(_, t)| contains_access(t)) {
        st.flags.nograd = true;
    }

    st.fingerprint_extra.push_str(st.red_op.name());
    Ok(st)
}

// ---- left-hand side ----------------------------------------------------

fn parse_left(st: &mut Store, ts: TokenStream) -> Result<()> {
    let toks: Vec<TokenTree> = ts.into_iter().collect();
    match toks.as_slice() {
        [TokenTree::Ident(name)] => {
            st.left_scalar = Some(quote::format_ident!("{}", name));
            Ok(())
        }
        [TokenTree::Ident(name), TokenTree::Group(g)]
            if g.delimiter() == Delimiter::Bracket =>
        {
            st.left_array = Some(quote::format_ident!("{}", name));
            parse_left_indices(st, g.stream())
        }
        [TokenTree::Group(g)] if g.delimiter() == Delimiter::Bracket => {
            parse_left_indices(st, g.stream())
        }
        _ => Err(Error::Equation(
            "left-hand side must be `z[i, ...]`, `[i, ...]`, or a plain name".into(),
        )),
    }
}

fn parse_left_indices(st: &mut Store, inner: TokenStream) -> Result<()> {
    for elem in split_commas(inner) {
        if elem.is_empty() {
            continue;
        }
        let e: syn::Expr = syn::parse2(elem.iter().cloned().collect())
            .map_err(|_| Error::LeftIndex(collect_str(&elem)))?;
        left_elem(st, &e, None)?;
    }
    let mut seen: Vec<&str> = Vec::new();
    for raw in &st.left_raw {
        if let LeftRaw::Sym(ix) = raw {
            if seen.contains(&ix.as_str()) {
                st.flags.zero = true;
            }
            seen.push(ix);
        }
    }
    Ok(())
}

fn left_elem(st: &mut Store, e: &syn::Expr, label: Option<String>) -> Result<()> {
    let text = || quote!(#e).to_string();
    match peel(e) {
        syn::Expr::Assign(a) if label.is_none() => {
            let syn::Expr::Path(p) = peel(&a.left) else {
                return Err(Error::LeftIndex(text()));
            };
            let name = p
                .path
                .get_ident()
                .ok_or_else(|| Error::LeftIndex(text()))?
                .to_string();
            left_elem(st, &a.right, Some(name))
        }
        syn::Expr::Path(p) => {
            let id = p.path.get_ident().ok_or_else(|| Error::LeftIndex(text()))?;
            if st.is_interp(&id.to_string()) {
                if st.flags.newarray {
                    return Err(Error::LeftIndex(text()));
                }
                st.push_scalar(id);
                st.left_raw.push(LeftRaw::Scalar(id.clone()));
            } else {
                let ix = id.to_string();
                if !st.left_ind.contains(&ix) {
                    st.left_ind.push(ix.clone());
                }
                if let Some(name) = label {
                    st.left_names.push((name, ix.clone()));
                }
                st.left_raw.push(LeftRaw::Sym(ix));
            }
            Ok(())
        }
        syn::Expr::Lit(l) => {
            let syn::Lit::Int(ref i) = l.lit else {
                return Err(Error::LeftIndex(text()));
            };
            let v: usize = i.base10_parse().map_err(|_| Error::LeftIndex(text()))?;
            if st.flags.newarray && v != 0 {
                return Err(Error::LeftIndex(text()));
            }
            st.left_raw.push(LeftRaw::Pin(v));
            Ok(())
        }
        _ => Err(Error::LeftIndex(text())),
    }
}

// ---- right-hand side ---------------------------------------------------

fn peel(e: &syn::Expr) -> &syn::Expr {
    match e {
        syn::Expr::Paren(p) => peel(&p.expr),
        syn::Expr::Group(g) => peel(&g.expr),
        _ => e,
    }
}

/// Flatten the top-level `+`/`-` chain, distributing signs through parens.
fn additive_terms(e: &syn::Expr) -> Vec<(bool, &syn::Expr)> {
    fn go<'a>(e: &'a syn::Expr, neg: bool, out: &mut Vec<(bool, &'a syn::Expr)>) {
        match e {
            syn::Expr::Paren(p) => go(&p.expr, neg, out),
            syn::Expr::Group(g) => go(&g.expr, neg, out),
            syn::Expr::Binary(b) if matches!(b.op, syn::BinOp::Add(_)) => {
                go(&b.left, neg, out);
                go(&b.right, neg, out);
            }
            syn::Expr::Binary(b) if matches!(b.op, syn::BinOp::Sub(_)) => {
                go(&b.left, neg, out);
                go(&b.right, !neg, out);
            }
            syn::Expr::Unary(u) if matches!(u.op, syn::UnOp::Neg(_)) => {
                go(&u.expr, !neg, out);
            }
            _ => out.push((neg, e)),
        }
    }
    let mut out = Vec::new();
    go(e, false, &mut out);
    out
}

/// `max(body)`-style single-argument call selecting the reduction operator.
fn reduction_call(e: &syn::Expr) -> Option<(RedOp, &syn::Expr)> {
    let syn::Expr::Call(c) = peel(e) else {
        return None;
    };
    let syn::Expr::Path(p) = peel(&c.func) else {
        return None;
    };
    let op = RedOp::from_call(&p.path.get_ident()?.to_string())?;
    if c.args.len() != 1 {
        return None;
    }
    Some((op, &c.args[0]))
}

fn fold_terms(terms: Vec<(bool, Rhs)>) -> Rhs {
    let mut iter = terms.into_iter();
    let (neg, first) = iter.next().expect("at least one term");
    let mut tree = if neg {
        Rhs::Unary(syn::UnOp::Neg(Default::default()), Box::new(first))
    } else {
        first
    };
    for (neg, term) in iter {
        let op = if neg {
            syn::BinOp::Sub(Default::default())
        } else {
            syn::BinOp::Add(Default::default())
        };
        tree = Rhs::Binary(op, Box::new(tree), Box::new(term));
    }
    tree
}

fn walk(st: &mut Store, e: &syn::Expr) -> Result<Rhs> {
    match peel(e) {
        syn::Expr::Index(ix) => walk_access(st, &ix.expr, &ix.index),
        syn::Expr::Path(p) => {
            if let Some(id) = p.path.get_ident() {
                if st.is_interp(&id.to_string()) {
                    st.push_scalar(id);
                    return Ok(Rhs::Scalar(id.clone()));
                }
                return Err(Error::Equation(format!(
                    "`{id}` on the right is neither indexed nor lifted; write `${id}` for a scalar"
                )));
            }
            Ok(Rhs::Path(p.clone()))
        }
        syn::Expr::Lit(l) => Ok(Rhs::Lit(l.lit.clone())),
        syn::Expr::Unary(u) => {
            st.cost += 1;
            Ok(Rhs::Unary(u.op, Box::new(walk(st, &u.expr)?)))
        }
        syn::Expr::Binary(b) => {
            match b.op {
                syn::BinOp::Add(_) | syn::BinOp::Sub(_) => st.cost += 1,
                syn::BinOp::Mul(_) => st.cost += 2,
                syn::BinOp::Div(_) | syn::BinOp::Rem(_) => st.cost += 8,
                syn::BinOp::Eq(_)
                | syn::BinOp::Ne(_)
                | syn::BinOp::Lt(_)
                | syn::BinOp::Le(_)
                | syn::BinOp::Gt(_)
                | syn::BinOp::Ge(_)
                | syn::BinOp::And(_)
                | syn::BinOp::Or(_) => {
                    st.flags.noavx = true;
                    st.cost += 1;
                }
                _ => st.cost += 1,
            }
            let l = walk(st, &b.left)?;
            let r = walk(st, &b.right)?;
            Ok(Rhs::Binary(b.op, Box::new(l), Box::new(r)))
        }
        syn::Expr::MethodCall(m) => {
            st.flags.noavx = true;
            st.cost += 10;
            let recv = walk(st, &m.receiver)?;
            let args = m
                .args
                .iter()
                .map(|a| walk(st, a))
                .collect::<Result<Vec<_>>>()?;
            Ok(Rhs::Method {
                recv: Box::new(recv),
                method: m.method.clone(),
                args,
            })
        }
        syn::Expr::Call(c) => {
            st.flags.noavx = true;
            st.cost += 10;
            let syn::Expr::Path(func) = peel(&c.func) else {
                return Err(Error::Equation(format!(
                    "unsupported call on the right: {}",
                    quote!(#c)
                )));
            };
            let args = c
                .args
                .iter()
                .map(|a| walk(st, a))
                .collect::<Result<Vec<_>>>()?;
            Ok(Rhs::Call {
                func: func.clone(),
                args,
            })
        }
        syn::Expr::Field(f) => {
            st.flags.noavx = true;
            st.flags.nograd = true;
            Ok(Rhs::Field {
                base: Box::new(walk(st, &f.base)?),
                member: f.member.clone(),
            })
        }
        syn::Expr::Tuple(t) => {
            st.flags.noavx = true;
            let items = t
                .elems
                .iter()
                .map(|x| walk(st, x))
                .collect::<Result<Vec<_>>>()?;
            Ok(Rhs::Tuple(items))
        }
        syn::Expr::Cast(c) => {
            st.cost += 1;
            Ok(Rhs::Cast {
                expr: Box::new(walk(st, &c.expr)?),
                ty: c.ty.clone(),
            })
        }
        other => Err(Error::Equation(format!(
            "unsupported construct on the right: {}",
            quote!(#other)
        ))),
    }
}

fn walk_access(st: &mut Store, base: &syn::Expr, index: &syn::Expr) -> Result<Rhs> {
    let elems = index_elems(index);
    match peel(base) {
        syn::Expr::Path(p) if p.path.get_ident().is_some() => {
            let id = p.path.get_ident().expect("checked").clone();
            let at = st.intern_array(Some(id), None);
            access(st, at, elems)
        }
        b @ (syn::Expr::Index(_) | syn::Expr::Field(_)) => {
            st.flags.noavx = true;
            st.flags.nograd = true;
            if elems.len() != 1 {
                return Err(Error::Equation(
                    "chained indexing takes a single index".into(),
                ));
            }
            let inner = walk(st, b)?;
            Ok(Rhs::Chain {
                base: Box::new(inner),
                index: elems.into_iter().next().expect("checked"),
            })
        }
        b => {
            // Function-of-array: bind the subexpression in the preamble and
            // index the fresh name instead.
            let at = st.intern_array(None, Some(b.clone()));
            access(st, at, elems)
        }
    }
}

fn index_elems(index: &syn::Expr) -> Vec<syn::Expr> {
    match peel(index) {
        syn::Expr::Tuple(t) => t.elems.iter().cloned().collect(),
        other => vec![other.clone()],
    }
}

fn access(st: &mut Store, at: usize, elems: Vec<syn::Expr>) -> Result<Rhs> {
    if !st.ranks.contains(&(at, elems.len())) {
        st.ranks.push((at, elems.len()));
    }
    let local = st.arrays[at].local.clone();
    let mut index = Vec::new();
    for (k, e) in elems.iter().enumerate() {
        let mut aff = affine(st, e)?;
        aff.bare = aff.vars.len() == 1
            && aff.vars[0].1 == 1
            && aff.lit == 0
            && aff.scalars.is_empty()
            && matches!(peel(e), syn::Expr::Path(_));
        let kl = Literal::usize_unsuffixed(k);
        let axis = quote! { (0isize)..(#local.len_of(ndarray::Axis(#kl)) as isize) };
        match aff.vars.len() {
            0 => {}
            1 => {
                let (ix, scale) = aff.vars[0].clone();
                st.push_right_ind(&ix);
                if aff.bare {
                    st.add_constraint(
                        &ix,
                        Constraint {
                            range: axis,
                            declared: false,
                        },
                    );
                } else {
                    st.mark_shifted(&ix);
                    let s = Literal::isize_suffixed(scale as isize);
                    let off = offset_tokens(&aff);
                    st.add_constraint(
                        &ix,
                        Constraint {
                            range: quote! { ixsum_runtime::scaled_axis(#axis, #s, #off) },
                            declared: false,
                        },
                    );
                }
            }
            2 => {
                if aff.vars.iter().any(|(_, s)| *s != 1) {
                    return Err(Error::IndexForm(quote!(#e).to_string()));
                }
                let a = aff.vars[0].0.clone();
                let b = aff.vars[1].0.clone();
                st.push_right_ind(&a);
                st.push_right_ind(&b);
                st.mark_shifted(&a);
                st.mark_shifted(&b);
                let axis = if aff.lit == 0 && aff.scalars.is_empty() {
                    axis
                } else {
                    let off = offset_tokens(&aff);
                    quote! { ixsum_runtime::scaled_axis(#axis, 1isize, #off) }
                };
                st.pair_constraints.push(PairConstraint { a, b, axis });
            }
            _ => return Err(Error::IndexForm(quote!(#e).to_string())),
        }
        index.push(aff);
    }
    st.accesses.push(Access { array: at, index });
    Ok(Rhs::Access(st.accesses.len() - 1))
}

/// Constant part of an affine index as an `isize` expression.
fn offset_tokens(aff: &Affine) -> TokenStream {
    let lit = Literal::isize_suffixed(aff.lit as isize);
    let mut out = quote! { #lit };
    for (id, coef) in &aff.scalars {
        out = match coef {
            1 => quote! { #out + (#id as isize) },
            -1 => quote! { #out - (#id as isize) },
            c => {
                let c = Literal::isize_suffixed(*c as isize);
                quote! { #out + (#id as isize) * #c }
            }
        };
    }
    out
}

fn affine(st: &mut Store, e: &syn::Expr) -> Result<Affine> {
    let fail = || Error::IndexForm(quote!(#e).to_string());
    match peel(e) {
        syn::Expr::Path(p) => {
            let id = p.path.get_ident().ok_or_else(fail)?;
            if st.is_interp(&id.to_string()) {
                st.push_scalar(id);
                Ok(Affine {
                    vars: vec![],
                    lit: 0,
                    scalars: vec![(id.clone(), 1)],
                    bare: false,
                })
            } else {
                Ok(Affine {
                    vars: vec![(id.to_string(), 1)],
                    lit: 0,
                    scalars: vec![],
                    bare: false,
                })
            }
        }
        syn::Expr::Lit(l) => {
            let syn::Lit::Int(ref i) = l.lit else {
                return Err(fail());
            };
            Ok(Affine {
                vars: vec![],
                lit: i.base10_parse().map_err(|_| fail())?,
                scalars: vec![],
                bare: false,
            })
        }
        syn::Expr::Unary(u) if matches!(u.op, syn::UnOp::Neg(_)) => {
            Ok(negate(affine(st, &u.expr)?))
        }
        syn::Expr::Binary(b) => {
            let l = affine(st, &b.left)?;
            let r = affine(st, &b.right)?;
            match b.op {
                syn::BinOp::Add(_) => Ok(merge(l, r)),
                syn::BinOp::Sub(_) => Ok(merge(l, negate(r))),
                syn::BinOp::Mul(_) => {
                    let (c, other) = if l.vars.is_empty() && l.scalars.is_empty() {
                        (l.lit, r)
                    } else if r.vars.is_empty() && r.scalars.is_empty() {
                        (r.lit, l)
                    } else {
                        return Err(fail());
                    };
                    Ok(scale(other, c))
                }
                _ => Err(fail()),
            }
        }
        _ => Err(fail()),
    }
}

fn negate(aff: Affine) -> Affine {
    scale(aff, -1)
}

fn scale(mut aff: Affine, c: i64) -> Affine {
    for (_, s) in &mut aff.vars {
        *s *= c;
    }
    for (_, s) in &mut aff.scalars {
        *s *= c;
    }
    aff.lit *= c;
    aff.vars.retain(|(_, s)| *s != 0);
    aff.scalars.retain(|(_, s)| *s != 0);
    aff
}

fn merge(mut a: Affine, b: Affine) -> Affine {
    for (ix, s) in b.vars {
        if let Some((_, t)) = a.vars.iter_mut().find(|(x, _)| *x == ix) {
            *t += s;
        } else {
            a.vars.push((ix, s));
        }
    }
    for (id, s) in b.scalars {
        if let Some((_, t)) = a.scalars.iter_mut().find(|(x, _)| x == &id) {
            *t += s;
        } else {
            a.scalars.push((id, s));
        }
    }
    a.lit += b.lit;
    a.vars.retain(|(_, s)| *s != 0);
    a.scalars.retain(|(_, s)| *s != 0);
    a
}

// ---- helpers over the finished tree ------------------------------------

/// Every index symbol appearing in a subtree, in appearance order.
pub fn rhs_indices(st: &Store, rhs: &Rhs) -> Vec<String> {
    let mut out = Vec::new();
    collect_indices(st, rhs, &mut out);
    out
}

fn collect_indices(st: &Store, rhs: &Rhs, out: &mut Vec<String>) {
    let mut push = |ix: &str| {
        if !out.iter().any(|s| s == ix) {
            out.push(ix.to_string());
        }
    };
    match rhs {
        Rhs::Access(at) => {
            for aff in &st.accesses[*at].index {
                for (ix, _) in &aff.vars {
                    push(ix);
                }
            }
        }
        Rhs::Scalar(_) | Rhs::Lit(_) | Rhs::Path(_) => {}
        Rhs::Unary(_, e) => collect_indices(st, e, out),
        Rhs::Binary(_, l, r) => {
            collect_indices(st, l, out);
            collect_indices(st, r, out);
        }
        Rhs::Method { recv, args, .. } => {
            collect_indices(st, recv, out);
            for a in args {
                collect_indices(st, a, out);
            }
        }
        Rhs::Call { args, .. } => {
            for a in args {
                collect_indices(st, a, out);
            }
        }
        Rhs::Field { base, .. } => collect_indices(st, base, out),
        Rhs::Chain { base, .. } => collect_indices(st, base, out),
        Rhs::Tuple(items) => {
            for x in items {
                collect_indices(st, x, out);
            }
        }
        Rhs::Cast { expr, .. } => collect_indices(st, expr, out),
    }
}

pub fn contains_access(rhs: &Rhs) -> bool {
    match rhs {
        Rhs::Access(_) | Rhs::Chain { .. } => true,
        Rhs::Scalar(_) | Rhs::Lit(_) | Rhs::Path(_) => false,
        Rhs::Unary(_, e) => contains_access(e),
        Rhs::Binary(_, l, r) => contains_access(l) || contains_access(r),
        Rhs::Method { recv, args, .. } => {
            contains_access(recv) || args.iter().any(contains_access)
        }
        Rhs::Call { args, .. } => args.iter().any(contains_access),
        Rhs::Field { base, .. } => contains_access(base),
        Rhs::Tuple(items) => items.iter().any(contains_access),
        Rhs::Cast { expr, .. } => contains_access(expr),
    }
}

fn shared_indices(st: &Store) -> Vec<String> {
    if st.arrays.is_empty() {
        return Vec::new();
    }
    let mut per_array: Vec<Vec<&str>> = vec![Vec::new(); st.arrays.len()];
    for access in &st.accesses {
        for aff in &access.index {
            for (ix, _) in &aff.vars {
                if !per_array[access.array].contains(&ix.as_str()) {
                    per_array[access.array].push(ix);
                }
            }
        }
    }
    st.right_ind
        .iter()
        .filter(|ix| per_array.iter().all(|set| set.contains(&ix.as_str())))
        .cloned()
        .collect()
}

// ---- token-level plumbing ----------------------------------------------

fn collect_str(toks: &[TokenTree]) -> String {
    toks.iter()
        .cloned()
        .collect::<TokenStream>()
        .to_string()
}

fn split_commas(input: TokenStream) -> Vec<Vec<TokenTree>> {
    let mut args = vec![Vec::new()];
    for tt in input {
        match &tt {
            TokenTree::Punct(p) if p.as_char() == ',' && p.spacing() == Spacing::Alone => {
                args.push(Vec::new());
            }
            _ => args.last_mut().expect("never empty").push(tt),
        }
    }
    args
}

/// Rewrite `a[i, j]` into `a[(i, j)]` so `syn` accepts multi-index accesses.
fn wrap_index_brackets(ts: TokenStream) -> TokenStream {
    let mut out: Vec<TokenTree> = Vec::new();
    let mut prev_atom = false;
    for tt in ts {
        match tt {
            TokenTree::Group(g) => {
                let inner = wrap_index_brackets(g.stream());
                if g.delimiter() == Delimiter::Bracket && prev_atom {
                    let tuple = Group::new(Delimiter::Parenthesis, inner);
                    let wrapped = Group::new(
                        Delimiter::Bracket,
                        TokenTree::Group(tuple).into(),
                    );
                    out.push(TokenTree::Group(wrapped));
                } else {
                    let mut ng = Group::new(g.delimiter(), inner);
                    ng.set_span(g.span());
                    out.push(TokenTree::Group(ng));
                }
                prev_atom = true;
            }
            TokenTree::Punct(_) => {
                prev_atom = false;
                out.push(tt);
            }
            _ => {
                prev_atom = true;
                out.push(tt);
            }
        }
    }
    out.into_iter().collect()
}

fn declared_range(decl: &RangeDecl) -> Result<TokenStream> {
    let bad = || Error::RangeDecl(format!("`{} in {}`", decl.index, decl.range));
    let e: syn::Expr = syn::parse2(decl.range.clone()).map_err(|_| bad())?;
    let syn::Expr::Range(r) = peel(&e) else {
        return Err(bad());
    };
    let start = r.start.as_ref().ok_or_else(bad)?;
    let end = r.end.as_ref().ok_or_else(bad)?;
    Ok(match r.limits {
        syn::RangeLimits::HalfOpen(_) => {
            quote! { ((#start) as isize)..((#end) as isize) }
        }
        syn::RangeLimits::Closed(_) => {
            quote! { ((#start) as isize)..(((#end) as isize) + 1) }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::scan;
    use proc_macro2::TokenStream;
    use std::str::FromStr;

    fn run(src: &str) -> Result<Store> {
        let scanned = scan(TokenStream::from_str(src).unwrap())?;
        let eq = scanned.equation.expect("equation");
        analyze(&eq, &scanned.ranges, &Options::default())
    }

    #[test]
    fn matmul_sets() {
        let st = run("z[i, k] := a[i, j] * b[j, k]").unwrap();
        assert_eq!(st.left_ind, vec!["i", "k"]);
        assert_eq!(st.right_ind, vec!["i", "j", "k"]);
        assert_eq!(st.red_ind, vec!["j"]);
        assert_eq!(st.shared_ind, vec!["j"]);
        assert_eq!(st.arrays.len(), 2);
        assert!(st.flags.newarray);
        assert!(!st.flags.noavx);
        assert_eq!(st.equation(), "z[i, k] := a[i, j] * b[j, k]");
    }

    #[test]
    fn scalar_reduction() {
        let st = run("s := a[i] * a[i]").unwrap();
        assert_eq!(st.left_scalar.as_ref().unwrap().to_string(), "s");
        assert!(st.left_ind.is_empty());
        assert_eq!(st.red_ind, vec!["i"]);
        assert_eq!(st.arrays.len(), 1);
        assert_eq!(st.accesses.len(), 2);
    }

    #[test]
    fn entangled_pair() {
        let st = run("z[i, j] := a[i + x, j + y] * k[x, y]").unwrap();
        assert_eq!(st.pair_constraints.len(), 2);
        assert_eq!(st.pair_constraints[0].a, "i");
        assert_eq!(st.pair_constraints[0].b, "x");
        assert!(st.is_shifted("i") && st.is_shifted("x"));
        assert_eq!(st.red_ind, vec!["x", "y"]);
    }

    #[test]
    fn scaled_and_shifted() {
        let st = run("z[i] := a[2 * i + 1]").unwrap();
        assert!(st.is_shifted("i"));
        let c = st.constraints_of("i");
        assert_eq!(c.len(), 1);
        assert!(c[0].range.to_string().contains("scaled_axis"));
    }

    #[test]
    fn post_terms_split_off() {
        let st = run("z[i, k] := alpha * a[i, j] * b[j, k] + beta") // no `$` after scan strip
            .unwrap_err();
        // without `$`, bare names are rejected
        assert!(matches!(st, Error::Equation(_)));

        let st = run("z[i, k] := $alpha * a[i, j] * b[j, k] + $beta").unwrap();
        assert_eq!(st.post.len(), 1);
        assert_eq!(st.scalars.len(), 2);
        assert_eq!(
            st.equation(),
            "z[i, k] := ($alpha * a[i, j]) * b[j, k] + $beta"
        );
    }

    #[test]
    fn reduction_operator_call() {
        let st = run("z[i] := max(a[i, j])").unwrap();
        assert_eq!(st.red_op, RedOp::Max);
        assert_eq!(st.red_ind, vec!["j"]);
        assert!(st.flags.nograd);
    }

    #[test]
    fn self_reference() {
        assert_eq!(
            run("z[i, k] := z[i, j] * b[j, k]").unwrap_err(),
            Error::SelfReference("z".into())
        );
    }

    #[test]
    fn method_calls_suppress_unrolling() {
        let st = run("z[i] := a[i].exp()").unwrap();
        assert!(st.flags.noavx);
        assert!(!st.flags.nograd);
        assert!(st.cost > 10);
    }

    #[test]
    fn nested_indexing_suppresses_gradient() {
        let st = run("z[i] := a[i][0] * b[i]").unwrap();
        assert!(st.flags.noavx);
        assert!(st.flags.nograd);
    }

    #[test]
    fn repeated_output_index_forces_zeroing() {
        let st = run("z[i, i] := a[i]").unwrap();
        assert!(st.flags.zero);
        assert_eq!(st.left_ind, vec!["i"]);
    }

    #[test]
    fn lifted_root() {
        let st = run("z[i] := f(b)[i]").unwrap();
        assert_eq!(st.arrays.len(), 1);
        assert!(st.arrays[0].lifted.is_some());
        assert!(st.arrays[0].name.is_none());
    }

    #[test]
    fn declared_ranges_are_constraints() {
        let scanned = scan(TokenStream::from_str("z[i] := $x * 1.0, i in 0..5").unwrap()).unwrap();
        let eq = scanned.equation.unwrap();
        let st = analyze(&eq, &scanned.ranges, &Options::default()).unwrap();
        assert_eq!(st.constraints_of("i").len(), 1);
        assert!(st.constraints_of("i")[0].declared);
    }
}
