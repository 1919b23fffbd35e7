//! The analysis store.
//!
//! A single mutable bag of results, filled in phase order: the scanner
//! decides the equation shape, the analyzer populates the index sets,
//! constraints and the canonical right-hand-side tree, the range solver
//! appends axis definitions, and code generation reads everything. Each
//! field documents the phase that owns it.

use proc_macro2::TokenStream;
use std::fmt;

use crate::options::Options;

/// An index symbol. Kept as a string so ordered sets stay cheap to compare;
/// loop variables are re-interned as identifiers at emission time.
pub type Ix = String;

/// Equation shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqOp {
    /// `lhs := rhs`, allocate a fresh output.
    Create,
    /// `lhs = rhs`, overwrite an existing output.
    Assign,
    /// `lhs += rhs`, accumulate into an existing output.
    Accum,
}

impl EqOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            EqOp::Create => ":=",
            EqOp::Assign => "=",
            EqOp::Accum => "+=",
        }
    }
}

/// Decisions recorded while walking the equation.
#[derive(Debug, Default, Clone)]
pub struct Flags {
    /// `+=`: kernels continue from the stored output.
    pub plusequals: bool,
    /// `:=`: the output is allocated here.
    pub newarray: bool,
    /// Output indices repeat, so unwritten cells must read as zero.
    pub zero: bool,
    /// A construct on the right defeats the unrolled specialization.
    pub noavx: bool,
    /// A construct on the right defeats gradient synthesis.
    pub nograd: bool,
}

/// Reduction operator over the inner loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedOp {
    Sum,
    Prod,
    Max,
    Min,
}

impl RedOp {
    pub fn name(&self) -> &'static str {
        match self {
            RedOp::Sum => "+",
            RedOp::Prod => "*",
            RedOp::Max => "max",
            RedOp::Min => "min",
        }
    }

    pub fn from_call(name: &str) -> Option<RedOp> {
        match name {
            "sum" => Some(RedOp::Sum),
            "prod" => Some(RedOp::Prod),
            "max" => Some(RedOp::Max),
            "min" => Some(RedOp::Min),
            _ => None,
        }
    }
}

/// One position of the left-hand index list, exactly as written.
#[derive(Debug, Clone)]
pub enum LeftRaw {
    Sym(Ix),
    /// Literal axis pin.
    Pin(usize),
    /// Interpolated scalar position.
    Scalar(syn::Ident),
}

/// One array referenced on the right.
#[derive(Debug, Clone)]
pub struct ArrayInfo {
    /// User-visible name; `None` for a lifted subexpression.
    pub name: Option<syn::Ident>,
    /// The subexpression bound in the preamble when the indexing root was
    /// not a bare name.
    pub lifted: Option<syn::Expr>,
    /// Preamble view binding.
    pub local: syn::Ident,
}

impl ArrayInfo {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(id) => id.to_string(),
            None => format!("<{}>", self.local),
        }
    }
}

/// Affine decomposition of one index expression: `sum(scale * var) + lit +
/// sum(coef * scalar)`.
#[derive(Debug, Clone)]
pub struct Affine {
    pub vars: Vec<(Ix, i64)>,
    pub lit: i64,
    pub scalars: Vec<(syn::Ident, i64)>,
    /// The expression was a lone symbol.
    pub bare: bool,
}

/// One indexed access `a[e1, ..., en]` on the right.
#[derive(Debug, Clone)]
pub struct Access {
    pub array: usize,
    pub index: Vec<Affine>,
}

/// Canonicalized right-hand-side tree. Nested indexing is lifted and scalar
/// interpolations are plain references by the time this is built, so
/// emission is a straightforward fold.
#[derive(Debug, Clone)]
pub enum Rhs {
    Access(usize),
    Scalar(syn::Ident),
    Lit(syn::Lit),
    Path(syn::ExprPath),
    Unary(syn::UnOp, Box<Rhs>),
    Binary(syn::BinOp, Box<Rhs>, Box<Rhs>),
    Method {
        recv: Box<Rhs>,
        method: syn::Ident,
        args: Vec<Rhs>,
    },
    Call {
        func: syn::ExprPath,
        args: Vec<Rhs>,
    },
    Field {
        base: Box<Rhs>,
        member: syn::Member,
    },
    /// Indexing into the element produced by an access, e.g. `a[i][e]`.
    /// The inner expression is emitted verbatim and contributes no index.
    Chain {
        base: Box<Rhs>,
        index: syn::Expr,
    },
    Tuple(Vec<Rhs>),
    Cast {
        expr: Box<Rhs>,
        ty: Box<syn::Type>,
    },
}

/// One range candidate for an index.
#[derive(Debug, Clone)]
pub struct Constraint {
    /// `Range<isize>` expression over the preamble locals.
    pub range: TokenStream,
    /// Came from a call-site range declaration.
    pub declared: bool,
}

/// Two indices combined additively in one access; neither range is
/// determinable alone.
#[derive(Debug, Clone)]
pub struct PairConstraint {
    pub a: Ix,
    pub b: Ix,
    /// The containing axis, already adjusted for any constant offset.
    pub axis: TokenStream,
}

#[derive(Debug)]
pub struct Store {
    pub opts: Options,
    pub flags: Flags,
    pub op: EqOp,

    // Analyzer: left side.
    pub left_raw: Vec<LeftRaw>,
    pub left_ind: Vec<Ix>,
    pub left_array: Option<syn::Ident>,
    pub left_scalar: Option<syn::Ident>,
    pub left_names: Vec<(String, Ix)>,

    // Analyzer: right side.
    pub reduced: Option<Rhs>,
    pub post: Vec<(bool, Rhs)>,
    pub right_ind: Vec<Ix>,
    pub red_ind: Vec<Ix>,
    pub shared_ind: Vec<Ix>,
    pub arrays: Vec<ArrayInfo>,
    pub accesses: Vec<Access>,
    pub scalars: Vec<syn::Ident>,
    pub shifted: Vec<Ix>,
    /// Names that arrived as `$name`; the set scalar references must come
    /// from.
    pub interp: Vec<String>,
    /// Distinct `(array, rank)` pairs needing a preamble rank check.
    pub ranks: Vec<(usize, usize)>,

    // Constraint store.
    pub constraints: Vec<(Ix, Vec<Constraint>)>,
    pub pair_constraints: Vec<PairConstraint>,

    // Range solver output.
    pub axis_defs: Vec<(Ix, TokenStream)>,
    pub axis_asserts: Vec<TokenStream>,

    pub red_op: RedOp,
    pub cost: usize,
    /// Extra material hashed into the fingerprint alongside the canonical
    /// equation (declared ranges, reduction operator).
    pub fingerprint_extra: String,
}

impl Store {
    pub fn new(opts: Options, op: EqOp, interp: Vec<String>) -> Self {
        Store {
            opts,
            flags: Flags {
                plusequals: op == EqOp::Accum,
                newarray: op == EqOp::Create,
                ..Flags::default()
            },
            op,
            left_raw: Vec::new(),
            left_ind: Vec::new(),
            left_array: None,
            left_scalar: None,
            left_names: Vec::new(),
            reduced: None,
            post: Vec::new(),
            right_ind: Vec::new(),
            red_ind: Vec::new(),
            shared_ind: Vec::new(),
            arrays: Vec::new(),
            accesses: Vec::new(),
            scalars: Vec::new(),
            shifted: Vec::new(),
            interp,
            ranks: Vec::new(),
            constraints: Vec::new(),
            pair_constraints: Vec::new(),
            axis_defs: Vec::new(),
            axis_asserts: Vec::new(),
            red_op: RedOp::Sum,
            cost: 1,
            fingerprint_extra: String::new(),
        }
    }

    pub fn is_interp(&self, name: &str) -> bool {
        self.interp.iter().any(|s| s == name)
    }

    pub fn push_right_ind(&mut self, ix: &str) {
        if !self.right_ind.iter().any(|s| s == ix) {
            self.right_ind.push(ix.to_string());
        }
    }

    pub fn mark_shifted(&mut self, ix: &str) {
        if !self.shifted.iter().any(|s| s == ix) {
            self.shifted.push(ix.to_string());
        }
    }

    pub fn is_shifted(&self, ix: &str) -> bool {
        self.shifted.iter().any(|s| s == ix)
    }

    pub fn push_scalar(&mut self, id: &syn::Ident) {
        if !self.scalars.iter().any(|s| s == id) {
            self.scalars.push(id.clone());
        }
    }

    pub fn add_constraint(&mut self, ix: &str, c: Constraint) {
        if let Some((_, list)) = self.constraints.iter_mut().find(|(s, _)| s == ix) {
            list.push(c);
        } else {
            self.constraints.push((ix.to_string(), vec![c]));
        }
    }

    pub fn constraints_of(&self, ix: &str) -> &[Constraint] {
        self.constraints
            .iter()
            .find(|(s, _)| s == ix)
            .map_or(&[], |(_, list)| list.as_slice())
    }

    /// Register an array by name, or a lifted subexpression, returning its
    /// slot.
    pub fn intern_array(&mut self, name: Option<syn::Ident>, lifted: Option<syn::Expr>) -> usize {
        if let Some(id) = &name {
            if let Some(at) = self
                .arrays
                .iter()
                .position(|a| a.name.as_ref().is_some_and(|n| n == id))
            {
                return at;
            }
        }
        let at = self.arrays.len();
        let local = quote::format_ident!("__a{}", at);
        self.arrays.push(ArrayInfo {
            name,
            lifted,
            local,
        });
        at
    }

    /// Loop order for kernels: free indices, then reduction indices, both in
    /// first-appearance order.
    pub fn loop_ind(&self) -> Vec<Ix> {
        let mut all = self.left_ind.clone();
        all.extend(self.red_ind.iter().cloned());
        all
    }

    /// The full right-hand side as a single tree, posts folded back in.
    pub fn full_rhs(&self) -> Rhs {
        let mut tree = self.reduced.clone().expect("analyzer populated rhs");
        for (neg, term) in &self.post {
            let op = if *neg {
                syn::BinOp::Sub(Default::default())
            } else {
                syn::BinOp::Add(Default::default())
            };
            tree = Rhs::Binary(op, Box::new(tree), Box::new(term.clone()));
        }
        tree
    }

    // ---- canonical rendering ----------------------------------------

    pub fn render_affine(&self, aff: &Affine) -> String {
        let mut parts: Vec<String> = Vec::new();
        for (ix, scale) in &aff.vars {
            match scale {
                1 => parts.push(ix.clone()),
                -1 => parts.push(format!("-{ix}")),
                s => parts.push(format!("{s} * {ix}")),
            }
        }
        for (id, coef) in &aff.scalars {
            match coef {
                1 => parts.push(format!("${id}")),
                -1 => parts.push(format!("-${id}")),
                c => parts.push(format!("{c} * ${id}")),
            }
        }
        if aff.lit != 0 || parts.is_empty() {
            parts.push(aff.lit.to_string());
        }
        let mut out = String::new();
        for (n, p) in parts.iter().enumerate() {
            if n == 0 {
                out.push_str(p);
            } else if let Some(rest) = p.strip_prefix('-') {
                out.push_str(" - ");
                out.push_str(rest);
            } else {
                out.push_str(" + ");
                out.push_str(p);
            }
        }
        out
    }

    pub fn render_rhs(&self, rhs: &Rhs) -> String {
        match rhs {
            Rhs::Access(at) => {
                let access = &self.accesses[*at];
                let inds: Vec<String> = access
                    .index
                    .iter()
                    .map(|aff| self.render_affine(aff))
                    .collect();
                format!(
                    "{}[{}]",
                    self.arrays[access.array].display_name(),
                    inds.join(", ")
                )
            }
            Rhs::Scalar(id) => format!("${id}"),
            Rhs::Lit(lit) => quote::quote!(#lit).to_string(),
            Rhs::Path(p) => quote::quote!(#p).to_string(),
            Rhs::Unary(op, e) => {
                format!("{}({})", quote::quote!(#op), self.render_rhs(e))
            }
            Rhs::Binary(op, l, r) => {
                let ls = self.paren_if_binary(l);
                let rs = self.paren_if_binary(r);
                format!("{ls} {} {rs}", quote::quote!(#op))
            }
            Rhs::Method { recv, method, args } => {
                let a: Vec<String> = args.iter().map(|x| self.render_rhs(x)).collect();
                format!("{}.{method}({})", self.paren_if_binary(recv), a.join(", "))
            }
            Rhs::Call { func, args } => {
                let a: Vec<String> = args.iter().map(|x| self.render_rhs(x)).collect();
                format!("{}({})", quote::quote!(#func), a.join(", "))
            }
            Rhs::Field { base, member } => {
                format!("{}.{}", self.paren_if_binary(base), quote::quote!(#member))
            }
            Rhs::Chain { base, index } => {
                format!("{}[{}]", self.paren_if_binary(base), quote::quote!(#index))
            }
            Rhs::Tuple(items) => {
                let a: Vec<String> = items.iter().map(|x| self.render_rhs(x)).collect();
                format!("({})", a.join(", "))
            }
            Rhs::Cast { expr, ty } => {
                format!("{} as {}", self.paren_if_binary(expr), quote::quote!(#ty))
            }
        }
    }

    fn paren_if_binary(&self, rhs: &Rhs) -> String {
        match rhs {
            Rhs::Binary(..) => format!("({})", self.render_rhs(rhs)),
            _ => self.render_rhs(rhs),
        }
    }

    pub fn render_left(&self) -> String {
        if let Some(s) = &self.left_scalar {
            return s.to_string();
        }
        let inds: Vec<String> = self
            .left_raw
            .iter()
            .map(|raw| {
                let body = match raw {
                    LeftRaw::Sym(ix) => ix.clone(),
                    LeftRaw::Pin(p) => p.to_string(),
                    LeftRaw::Scalar(id) => format!("${id}"),
                };
                let named = match raw {
                    LeftRaw::Sym(ix) => self.left_names.iter().find(|(_, x)| x == ix),
                    _ => None,
                };
                match named {
                    Some((name, _)) => format!("{name} = {body}"),
                    None => body,
                }
            })
            .collect();
        let name = self
            .left_array
            .as_ref()
            .map_or(String::new(), |id| id.to_string());
        format!("{name}[{}]", inds.join(", "))
    }

    /// Canonical equation text: the registry record and the fingerprint
    /// input.
    pub fn equation(&self) -> String {
        let rhs = match self.reduced.as_ref() {
            Some(tree) => {
                let body = self.render_rhs(tree);
                let mut out = match self.red_op {
                    RedOp::Sum => body,
                    RedOp::Prod => format!("prod({body})"),
                    RedOp::Max => format!("max({body})"),
                    RedOp::Min => format!("min({body})"),
                };
                for (neg, term) in &self.post {
                    out.push_str(if *neg { " - " } else { " + " });
                    out.push_str(&self.paren_if_binary(term));
                }
                out
            }
            None => String::new(),
        };
        format!("{} {} {rhs}", self.render_left(), self.op.symbol())
    }
}

impl fmt::Display for Store {
    /// The `verbose = true` dump.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |v: &[Ix]| if v.is_empty() { "-".to_string() } else { v.join(", ") };
        writeln!(f, "equation:  {}", self.equation())?;
        let mut flags = Vec::new();
        if self.flags.plusequals {
            flags.push("plusequals");
        }
        if self.flags.newarray {
            flags.push("newarray");
        }
        if self.flags.zero {
            flags.push("zero");
        }
        if self.flags.noavx {
            flags.push("noavx");
        }
        if self.flags.nograd {
            flags.push("nograd");
        }
        writeln!(f, "flags:     {}", if flags.is_empty() { "-".to_string() } else { flags.join(", ") })?;
        writeln!(f, "free:      {}", list(&self.left_ind))?;
        writeln!(f, "reduction: {}", list(&self.red_ind))?;
        writeln!(f, "shared:    {}", list(&self.shared_ind))?;
        writeln!(
            f,
            "arrays:    {}",
            if self.arrays.is_empty() {
                "-".to_string()
            } else {
                self.arrays
                    .iter()
                    .map(|a| a.display_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        )?;
        writeln!(
            f,
            "scalars:   {}",
            if self.scalars.is_empty() {
                "-".to_string()
            } else {
                self.scalars
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        )?;
        writeln!(f, "shifted:   {}", list(&self.shifted))?;
        writeln!(
            f,
            "pairs:     {}",
            if self.pair_constraints.is_empty() {
                "-".to_string()
            } else {
                self.pair_constraints
                    .iter()
                    .map(|p| format!("({}, {})", p.a, p.b))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        )?;
        writeln!(f, "reduce by: {}", self.red_op.name())?;
        write!(f, "cost:      {}", self.cost)
    }
}
