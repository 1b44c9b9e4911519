use crate::error::Span;

use string_interner::Sym;

/// A parsed script: a flat list of top-level statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `var a = 1, b;`
    VarDecl(Vec<VarDeclarator>),
    If {
        cond: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    /// Top-level `function name(params) { ... }`
    FunctionDecl {
        name: Sym,
        params: Vec<Param>,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Block(Vec<Stmt>),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDeclarator {
    pub name: Sym,
    pub span: Span,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Param {
    pub name: Sym,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f64),
    String(String),
    Ident(Sym),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `object.prop`
    Member {
        object: Box<Expr>,
        prop: Sym,
        prop_span: Span,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `(params) => body`, legal only as a handler argument
    Arrow {
        params: Vec<Param>,
        body: Vec<Stmt>,
    },
    Assign {
        target: AssignTarget,
        value: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Ident(Sym, Span),
    /// `[a, b] = ...` destructuring of a multi-field register read
    ArrayPattern(Vec<Param>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    /// Binding power for precedence climbing; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Eq | Self::Ne => 3,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 4,
            Self::Add | Self::Sub => 5,
            Self::Mul | Self::Div => 6,
            Self::Pow => 7,
        }
    }
}
