use serde::{Deserialize, Serialize};

/// One parsed source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Name the unit was loaded under (file name or `<input>`).
    pub name: String,
    /// Top-level declarations in source order.
    pub declarations: Vec<Declaration>,
}

/// Top-level declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Declaration {
    /// `include "file";`
    Include(Literal),
    /// `probe name { ... }`
    Probe(ObjectDecl),
    /// `backend name { ... }`
    Backend(ObjectDecl),
    /// `acl name { ... }`
    Acl(AclDecl),
    /// `sub name { ... }`
    Sub(SubDecl),
}

/// Probe or backend declaration body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDecl {
    /// Declared name.
    pub name: String,
    /// `.field = value;` lines in order.
    pub fields: Vec<FieldAssign>,
}

/// `.field = value;`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAssign {
    /// Field name as written, without the leading dot.
    pub name: String,
    /// Assigned value.
    pub value: FieldValue,
}

/// Right-hand side of a field assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// A literal token.
    Literal(Literal),
    /// A bare name, e.g. a probe reference.
    Name(String),
    /// An inline object body, e.g. `.probe = { .url = "/"; }`.
    Inline(Vec<FieldAssign>),
}

/// `acl name { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclDecl {
    /// Declared name.
    pub name: String,
    /// Entries in order.
    pub entries: Vec<AclLine>,
}

/// One ACL line: `[!] ["("] "text" [")"] ["/" mask] ;`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclLine {
    /// Leading `!`: the entry excludes.
    pub negated: bool,
    /// Parenthesised or `?`-suffixed: resolution failure is ignorable.
    pub ignorable: bool,
    /// Raw string token, quotes included.
    pub text: Literal,
    /// Mask written outside the quotes (`"10.0.0.0"/8`).
    pub mask: Option<String>,
}

/// `sub name { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDecl {
    /// Subroutine name.
    pub name: String,
    /// Body.
    pub body: Vec<Statement>,
}

/// Statements allowed inside a subroutine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// `set target op value;`
    Set {
        /// Assigned member or variable.
        target: Vec<String>,
        /// `=`, `+=` or `-=`.
        op: AssignOp,
        /// Right-hand side.
        value: Expr,
    },
    /// `unset target;`
    Unset(Vec<String>),
    /// `call name;`
    Call(String),
    /// `return;` / `return(state);` / `return(synth(...))`
    Return(Option<ReturnValue>),
    /// `error [status] ["description"];`
    Error {
        /// Status token: integer literal or status name.
        status: Option<String>,
        /// Description literal.
        description: Option<Literal>,
    },
    /// `if (...) { } else if (...) { } else { }`
    If {
        /// Condition/body pairs in source order.
        branches: Vec<(Expr, Vec<Statement>)>,
        /// Trailing `else` body.
        otherwise: Option<Vec<Statement>>,
    },
    /// `var TYPE name;`
    Var {
        /// Type keyword as written.
        ty: String,
        /// Variable name.
        name: String,
    },
    /// `hash_data(expr);`
    HashData(Expr),
    /// `restart;`
    Restart,
    /// Nested `{ ... }` block.
    Block(Vec<Statement>),
}

/// Assignment operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    /// `=`
    Set,
    /// `+=`
    Add,
    /// `-=`
    Sub,
}

/// Payload of `return(...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReturnValue {
    /// `return(name)`
    State(String),
    /// `return(synth(status, "reason"))` or `return(status, "reason")`
    Synth {
        /// Status expression.
        status: Expr,
        /// Optional reason expression.
        reason: Option<Expr>,
    },
}

/// Literal token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiteralKind {
    /// `"..."`
    String,
    /// `{"..."}`
    Synthetic,
    /// `42`
    Integer,
    /// `4.2`
    Float,
    /// `true` / `false`
    Bool,
    /// `10s`, `1.5m`
    Duration,
}

/// Literal token with its raw text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Literal {
    /// Token category.
    pub kind: LiteralKind,
    /// Token text exactly as it appeared in the source.
    pub text: String,
}

impl Literal {
    /// Build a literal token.
    pub fn new(kind: LiteralKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Negate,
}

/// Binary operators, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `||`
    Or,
    /// `&&`
    And,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `&`
    BitAnd,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `~`
    Match,
    /// `!~`
    NotMatch,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
}

impl BinaryOp {
    /// Source spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAnd => "&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Match => "~",
            BinaryOp::NotMatch => "!~",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// Expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Literal token.
    Literal(Literal),
    /// Dotted name: `req.http.host`, `office`, `myvar`.
    Path(Vec<String>),
    /// Prefix operator.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        expr: Box<Expr>,
    },
    /// Infix operator.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// `cond ? then : otherwise`
    Conditional {
        /// Condition.
        cond: Box<Expr>,
        /// Value when true.
        then: Box<Expr>,
        /// Value when false.
        otherwise: Box<Expr>,
    },
}
