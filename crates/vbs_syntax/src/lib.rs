use chrono::NaiveDateTime;

/// Longest identifier the legacy engine accepts.
pub const IDENTIFIER_MAX_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// A name as written in source. Comparisons between identifiers go through
/// [`Ident::key`], since the language is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

impl Ident {
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }

    pub fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompareMode {
    #[default]
    Binary,
    Text,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Comment {
    pub text: String,
    pub rem: bool,
    pub span: Span,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub option_explicit: bool,
    pub option_compare: CompareMode,
    pub option_base: u8,
    pub body: Vec<Stmt>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Access {
    #[default]
    None,
    Public,
    Private,
    PublicDefault,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ParamMode {
    #[default]
    Default,
    ByRef,
    ByVal,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Param {
    pub name: Ident,
    pub mode: ParamMode,
    /// Declared with a trailing `()`.
    pub array: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VarDecl {
    pub name: Ident,
    /// `None` for a scalar, `Some(vec![])` for a dynamic array `a()`.
    pub bounds: Option<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConstDecl {
    pub name: Ident,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReDimItem {
    pub name: Ident,
    pub bounds: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OnErrorMode {
    ResumeNext,
    GoTo0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExitKind {
    Do,
    For,
    Sub,
    Function,
    Property,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LoopCondition {
    While,
    Until,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LoopTest {
    pub kind: LoopCondition,
    /// True when the test follows `Loop` rather than `Do`.
    pub post: bool,
    pub condition: Expr,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ElseIf {
    pub condition: Expr,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CaseClause {
    pub values: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcedureKind {
    Sub,
    Function,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Procedure {
    pub kind: ProcedureKind,
    pub access: Access,
    pub name: Ident,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PropertyKind {
    Get,
    Let,
    Set,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PropertyDecl {
    pub kind: PropertyKind,
    pub access: Access,
    pub name: Ident,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ClassMember {
    Field {
        access: Access,
        vars: Vec<VarDecl>,
        span: Span,
    },
    Const {
        access: Access,
        items: Vec<ConstDecl>,
        span: Span,
    },
    Method(Procedure),
    Property(PropertyDecl),
    Initialize {
        access: Access,
        body: Vec<Stmt>,
        span: Span,
    },
    Terminate {
        access: Access,
        body: Vec<Stmt>,
        span: Span,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClassDecl {
    pub name: Ident,
    pub members: Vec<ClassMember>,
    pub span: Span,
}

impl ClassDecl {
    pub fn default_member(&self) -> Option<&Ident> {
        self.members.iter().find_map(|member| match member {
            ClassMember::Method(method) if method.access == Access::PublicDefault => {
                Some(&method.name)
            }
            ClassMember::Property(property) if property.access == Access::PublicDefault => {
                Some(&property.name)
            }
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    Dim {
        vars: Vec<VarDecl>,
        span: Span,
    },
    Field {
        access: Access,
        vars: Vec<VarDecl>,
        span: Span,
    },
    Const {
        access: Access,
        items: Vec<ConstDecl>,
        span: Span,
    },
    ReDim {
        preserve: bool,
        items: Vec<ReDimItem>,
        span: Span,
    },
    Assign {
        target: Expr,
        value: Expr,
        set: bool,
        span: Span,
    },
    Call {
        callee: Expr,
        args: Vec<Expr>,
        /// Written with the `Call` keyword.
        explicit: bool,
        span: Span,
    },
    Erase {
        name: Ident,
        span: Span,
    },
    OnError {
        mode: OnErrorMode,
        span: Span,
    },
    Exit {
        kind: ExitKind,
        span: Span,
    },
    If {
        condition: Expr,
        then_body: Vec<Stmt>,
        else_ifs: Vec<ElseIf>,
        else_body: Option<Vec<Stmt>>,
        inline: bool,
        span: Span,
    },
    For {
        var: Ident,
        from: Expr,
        to: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
        span: Span,
    },
    ForEach {
        var: Ident,
        collection: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    DoLoop {
        test: Option<LoopTest>,
        body: Vec<Stmt>,
        span: Span,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    Select {
        subject: Expr,
        cases: Vec<CaseClause>,
        else_body: Option<Vec<Stmt>>,
        span: Span,
    },
    With {
        target: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    Procedure(Procedure),
    Property(PropertyDecl),
    Class(ClassDecl),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Dim { span, .. }
            | Stmt::Field { span, .. }
            | Stmt::Const { span, .. }
            | Stmt::ReDim { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::Call { span, .. }
            | Stmt::Erase { span, .. }
            | Stmt::OnError { span, .. }
            | Stmt::Exit { span, .. }
            | Stmt::If { span, .. }
            | Stmt::For { span, .. }
            | Stmt::ForEach { span, .. }
            | Stmt::DoLoop { span, .. }
            | Stmt::While { span, .. }
            | Stmt::Select { span, .. }
            | Stmt::With { span, .. } => *span,
            Stmt::Procedure(procedure) => procedure.span,
            Stmt::Property(property) => property.span,
            Stmt::Class(class) => class.span,
        }
    }

    /// Node kind name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Stmt::Dim { .. } => "VariablesDeclaration",
            Stmt::Field { .. } => "FieldsDeclaration",
            Stmt::Const { .. } => "ConstsDeclaration",
            Stmt::ReDim { .. } => "ReDimStatement",
            Stmt::Assign { .. } => "AssignmentStatement",
            Stmt::Call { explicit: true, .. } => "CallStatement",
            Stmt::Call { .. } => "CallSubStatement",
            Stmt::Erase { .. } => "EraseStatement",
            Stmt::OnError { .. } => "OnErrorStatement",
            Stmt::Exit { .. } => "ExitStatement",
            Stmt::If { .. } => "IfStatement",
            Stmt::For { .. } => "ForStatement",
            Stmt::ForEach { .. } => "ForEachStatement",
            Stmt::DoLoop { .. } => "DoStatement",
            Stmt::While { .. } => "WhileStatement",
            Stmt::Select { .. } => "SelectStatement",
            Stmt::With { .. } => "WithStatement",
            Stmt::Procedure(Procedure {
                kind: ProcedureKind::Sub,
                ..
            }) => "SubDeclaration",
            Stmt::Procedure(_) => "FunctionDeclaration",
            Stmt::Property(_) => "PropertyDeclaration",
            Stmt::Class(_) => "ClassDeclaration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Literal {
    String(String),
    Int(i64),
    Float(f64),
    Date(NaiveDateTime),
    Bool(bool),
    Null,
    Empty,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Is,
    And,
    Or,
    Xor,
    Eqv,
    Imp,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::IntDiv => "\\",
            BinaryOp::Mod => "Mod",
            BinaryOp::Pow => "^",
            BinaryOp::Concat => "&",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Is => "Is",
            BinaryOp::And => "And",
            BinaryOp::Or => "Or",
            BinaryOp::Xor => "Xor",
            BinaryOp::Eqv => "Eqv",
            BinaryOp::Imp => "Imp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Ident(Ident),
    Literal(Literal, Span),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Member {
        object: Box<Expr>,
        name: Ident,
        span: Span,
    },
    IndexOrCall {
        object: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },
    /// `low To high` inside a `Case` value list.
    Range {
        low: Box<Expr>,
        high: Box<Expr>,
        span: Span,
    },
    New {
        class: Ident,
        span: Span,
    },
    /// `.name` inside a `With` body.
    WithMember {
        name: Ident,
        span: Span,
    },
    /// An omitted argument between commas, or the implicit subject of `Case Is`.
    Missing(Span),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Ident(ident) => ident.span,
            Expr::Literal(_, span)
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Member { span, .. }
            | Expr::IndexOrCall { span, .. }
            | Expr::Range { span, .. }
            | Expr::New { span, .. }
            | Expr::WithMember { span, .. }
            | Expr::Missing(span) => *span,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Ident(_) => "Identifier",
            Expr::Literal(..) => "Literal",
            Expr::Unary { .. } => "UnaryExpression",
            Expr::Binary { .. } => "BinaryExpression",
            Expr::Member { .. } => "MemberExpression",
            Expr::IndexOrCall { .. } => "IndexOrCallExpression",
            Expr::Range { .. } => "RangeExpression",
            Expr::New { .. } => "NewExpression",
            Expr::WithMember { .. } => "WithMemberAccessExpression",
            Expr::Missing(_) => "MissingValueExpression",
        }
    }

    pub fn as_ident(&self) -> Option<&Ident> {
        match self {
            Expr::Ident(ident) => Some(ident),
            _ => None,
        }
    }
}
