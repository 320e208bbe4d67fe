use std::collections::BTreeSet;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Typed AST of the condition language. No node has side effects.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub(crate) fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Self::Binary(op, Box::new(left), Box::new(right))
    }

    /// Top-level names the expression reads (the `a` of `a.b[c]`, plus any names inside `c`).
    pub fn root_identifiers(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_roots(&mut names);
        names
    }

    fn collect_roots<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            Self::Literal(_) => {}
            Self::Ident(name) => {
                names.insert(name.as_str());
            }
            Self::Member(target, _) => target.collect_roots(names),
            Self::Index(target, index) => {
                target.collect_roots(names);
                index.collect_roots(names);
            }
            Self::Unary(_, operand) => operand.collect_roots(names),
            Self::Binary(_, left, right) => {
                left.collect_roots(names);
                right.collect_roots(names);
            }
        }
    }
}
