//! Argument scanner.
//!
//! Splits the macro input into option assignments, range declarations, and
//! at most one equation, working on raw token trees: the `:=` operator and
//! `$name` interpolations are not parseable Rust, so both are handled here
//! before `syn` ever sees the streams.

use crate::error::{Error, Result};
use crate::store::EqOp;
use proc_macro2::{Delimiter, Spacing, TokenStream, TokenTree};

#[derive(Debug, Clone)]
pub struct RangeDecl {
    pub index: String,
    pub range: TokenStream,
}

#[derive(Debug, Clone)]
pub struct Equation {
    pub op: EqOp,
    pub lhs: TokenStream,
    pub rhs: TokenStream,
    /// Names that appeared as `$name`, in first-appearance order.
    pub interp: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Scanned {
    pub options: Vec<(String, TokenStream)>,
    pub ranges: Vec<RangeDecl>,
    pub equation: Option<Equation>,
}

pub fn scan(input: TokenStream) -> Result<Scanned> {
    let mut out = Scanned::default();
    for arg in split_commas(input) {
        if arg.is_empty() {
            continue;
        }
        if let Some(decl) = range_decl(&arg) {
            out.ranges.push(decl);
            continue;
        }
        if let Some(decls) = range_decl_tuple(&arg) {
            out.ranges.extend(decls);
            continue;
        }
        if let Some((op, at, resume)) = find_operator(&arg) {
            let lhs_toks = &arg[..at];
            let rhs_toks = &arg[resume..];
            if op == EqOp::Assign {
                if let [TokenTree::Ident(name)] = lhs_toks {
                    let name = name.to_string();
                    if crate::options::is_option(&name) {
                        out.options.push((name, collect(rhs_toks)));
                        continue;
                    }
                    if !looks_like_rhs(rhs_toks) {
                        return Err(Error::UnknownOption(name));
                    }
                }
            }
            if out.equation.is_some() {
                return Err(Error::Equation(
                    "at most one equation per invocation".into(),
                ));
            }
            let mut interp = Vec::new();
            let lhs = strip_interp(collect(lhs_toks), &mut interp)?;
            let rhs = strip_interp(collect(rhs_toks), &mut interp)?;
            out.equation = Some(Equation {
                op,
                lhs,
                rhs,
                interp,
            });
            continue;
        }
        return Err(Error::Equation(format!(
            "unrecognized argument `{}`",
            collect(&arg)
        )));
    }
    Ok(out)
}

fn collect(toks: &[TokenTree]) -> TokenStream {
    toks.iter().cloned().collect()
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

/// `i in 1..n` shape.
fn range_decl(toks: &[TokenTree]) -> Option<RangeDecl> {
    match toks {
        [TokenTree::Ident(index), TokenTree::Ident(kw), rest @ ..]
            if *kw == "in" && !rest.is_empty() =>
        {
            Some(RangeDecl {
                index: index.to_string(),
                range: collect(rest),
            })
        }
        _ => None,
    }
}

/// `(i in 1..n, j in 1..m)` shape.
fn range_decl_tuple(toks: &[TokenTree]) -> Option<Vec<RangeDecl>> {
    let [TokenTree::Group(g)] = toks else {
        return None;
    };
    if g.delimiter() != Delimiter::Parenthesis {
        return None;
    }
    let parts = split_commas(g.stream());
    let decls: Vec<_> = parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| range_decl(p))
        .collect::<Option<_>>()?;
    if decls.is_empty() {
        None
    } else {
        Some(decls)
    }
}

/// Locate the top-level equation operator.
///
/// Works on maximal punctuation runs so `==`, `<=`, `..=` and friends are
/// never mistaken for an assignment. Returns the operator plus the token
/// positions where the left side ends and the right side starts.
fn find_operator(toks: &[TokenTree]) -> Option<(EqOp, usize, usize)> {
    let mut i = 0;
    while i < toks.len() {
        let TokenTree::Punct(p) = &toks[i] else {
            i += 1;
            continue;
        };
        let mut run = String::from(p.as_char());
        let mut j = i;
        while let TokenTree::Punct(q) = &toks[j] {
            if q.spacing() != Spacing::Joint {
                break;
            }
            let Some(TokenTree::Punct(next)) = toks.get(j + 1) else {
                break;
            };
            run.push(next.as_char());
            j += 1;
        }
        match run.as_str() {
            ":=" => return Some((EqOp::Create, i, j + 1)),
            "+=" => return Some((EqOp::Accum, i, j + 1)),
            "=" => return Some((EqOp::Assign, i, j + 1)),
            _ => i = j + 1,
        }
    }
    None
}

/// A right-hand side, as opposed to an option value: anything with an
/// indexed access or an interpolation in it.
fn looks_like_rhs(toks: &[TokenTree]) -> bool {
    toks.iter().any(|tt| match tt {
        TokenTree::Group(g) => {
            g.delimiter() == Delimiter::Bracket || looks_like_rhs(&g.stream().into_iter().collect::<Vec<_>>())
        }
        TokenTree::Punct(p) => p.as_char() == '$',
        _ => false,
    })
}

/// Replace every `$name` with `name`, recording the lifted names.
fn strip_interp(input: TokenStream, names: &mut Vec<String>) -> Result<TokenStream> {
    let mut out = Vec::new();
    let mut iter = input.into_iter().peekable();
    while let Some(tt) = iter.next() {
        match tt {
            TokenTree::Punct(p) if p.as_char() == '$' => match iter.next() {
                Some(TokenTree::Ident(id)) => {
                    let name = id.to_string();
                    if !names.contains(&name) {
                        names.push(name);
                    }
                    out.push(TokenTree::Ident(id));
                }
                _ => return Err(Error::Interpolation),
            },
            TokenTree::Group(g) => {
                let inner = strip_interp(g.stream(), names)?;
                let mut ng = proc_macro2::Group::new(g.delimiter(), inner);
                ng.set_span(g.span());
                out.push(TokenTree::Group(ng));
            }
            other => out.push(other),
        }
    }
    Ok(out.into_iter().collect())
}
