use std::fmt::{self, Display};
use std::sync::Arc;

use crate::location::{Span, Spanning};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Name {
    pub span: Span,
    pub text: String,
}

impl Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl Spanning for Name {
    fn span(&self) -> Span {
        self.span.clone()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
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
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Arg {
    pub name: Option<Name>,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Span, Literal),
    Var(Name),
    List(Span, Vec<Expr>),
    Index {
        span: Span,
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        span: Span,
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        span: Span,
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        span: Span,
        callee: Name,
        args: Vec<Arg>,
    },
}

impl Spanning for Expr {
    fn span(&self) -> Span {
        match self {
            Self::Literal(span, _) | Self::List(span, _) => span.clone(),
            Self::Var(name) => name.span.clone(),
            Self::Index { span, .. }
            | Self::Unary { span, .. }
            | Self::Binary { span, .. }
            | Self::Call { span, .. } => span.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FnKind {
    Plain,
    Cached {
        resource: bool,
        ttl_secs: Option<u64>,
        max_entries: Option<usize>,
    },
    Fragment,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FnDef {
    pub span: Span,
    pub name: Name,
    pub params: Vec<Name>,
    pub body: Block,
    pub kind: FnKind,
    /// Source text of the whole definition.
    pub code: String,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Block {
    pub span: Span,
    pub statements: Vec<Stmt>,
}

impl Spanning for Block {
    fn span(&self) -> Span {
        self.span.clone()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Let {
        span: Span,
        name: Name,
        value: Expr,
    },
    Assign {
        span: Span,
        name: Name,
        value: Expr,
    },
    If {
        span: Span,
        branches: Vec<(Expr, Block)>,
        otherwise: Option<Block>,
    },
    For {
        span: Span,
        var: Name,
        iter: Expr,
        body: Block,
    },
    While {
        span: Span,
        condition: Expr,
        body: Block,
    },
    Fn(Arc<FnDef>),
    Return {
        span: Span,
        value: Option<Expr>,
    },
    With {
        span: Span,
        container: Name,
        args: Vec<Arg>,
        body: Block,
    },
    Try {
        span: Span,
        body: Block,
        error: Name,
        handler: Block,
    },
    Stop(Span),
    Rerun(Span),
    Raise {
        span: Span,
        value: Expr,
    },
    ClearCache {
        span: Span,
        function: Name,
        args: Vec<Arg>,
    },
    Expr(Expr),
}

impl Spanning for Stmt {
    fn span(&self) -> Span {
        match self {
            Self::Let { span, .. }
            | Self::Assign { span, .. }
            | Self::If { span, .. }
            | Self::For { span, .. }
            | Self::While { span, .. }
            | Self::Return { span, .. }
            | Self::With { span, .. }
            | Self::Try { span, .. }
            | Self::Raise { span, .. }
            | Self::ClearCache { span, .. } => span.clone(),
            Self::Stop(span) | Self::Rerun(span) => span.clone(),
            Self::Fn(def) => def.span.clone(),
            Self::Expr(expr) => expr.span(),
        }
    }
}

/// A parsed page script.
#[derive(Clone, Debug, PartialEq)]
pub struct Script {
    pub statements: Vec<Stmt>,
}
