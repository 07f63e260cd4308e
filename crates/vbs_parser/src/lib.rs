mod error;
mod lexer;

pub use error::{Diagnostic, ParseError, SyntaxErrorCode};
pub use lexer::{parse_date, tokenize, Keyword, Lexer, Punct, Token, TokenKind};

use tracing::debug;
use vbs_syntax::{
    Access, BinaryOp, CaseClause, ClassDecl, ClassMember, Comment, CompareMode, ConstDecl,
    ElseIf, ExitKind, Expr, Ident, Literal, LoopCondition, LoopTest, OnErrorMode, Param,
    ParamMode, Procedure, ProcedureKind, Program, PropertyDecl, PropertyKind, ReDimItem, Span,
    Stmt, UnaryOp, VarDecl, IDENTIFIER_MAX_LENGTH,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Collect comments into [`Program::comments`].
    pub keep_comments: bool,
}

pub fn parse_program(source: &str) -> Result<Program, ParseError> {
    parse_program_with_options(source, &ParseOptions::default())
}

pub fn parse_program_with_options(
    source: &str,
    options: &ParseOptions,
) -> Result<Program, ParseError> {
    let mut tokens = Vec::new();
    let mut comments = Vec::new();
    for token in tokenize(source)? {
        match token.kind {
            TokenKind::Comment { text, rem } => {
                if options.keep_comments {
                    comments.push(Comment {
                        text,
                        rem,
                        span: token.span,
                    });
                }
            }
            _ => tokens.push(token),
        }
    }
    let mut parser = Parser::new(source, tokens);
    let mut program = parser.parse()?;
    program.comments = comments;
    debug!(
        statements = program.body.len(),
        bytes = source.len(),
        "parsed program"
    );
    Ok(program)
}

/// Access modifiers and members that may appear after `Public`/`Private`.
enum Declaration {
    Procedure(Procedure),
    Property(PropertyDecl),
    Const {
        access: Access,
        items: Vec<ConstDecl>,
        span: Span,
    },
    Field {
        access: Access,
        vars: Vec<VarDecl>,
        span: Span,
    },
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    prev_end: usize,
    with_depth: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
            prev_end: 0,
            with_depth: 0,
        }
    }

    fn parse(&mut self) -> Result<Program, ParseError> {
        let mut program = Program::default();
        self.parse_options(&mut program)?;
        loop {
            self.skip_line_terminations();
            if self.at_eof() {
                break;
            }
            if let Some(stmt) = self.parse_global_statement()? {
                program.body.push(stmt);
            }
        }
        Ok(program)
    }

    // ----- token helpers -----

    fn current(&self) -> &Token {
        let index = self.pos.min(self.tokens.len().saturating_sub(1));
        &self.tokens[index]
    }

    fn kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn peek_kind(&self, offset: usize) -> &TokenKind {
        let index = (self.pos + offset).min(self.tokens.len().saturating_sub(1));
        &self.tokens[index].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len().saturating_sub(1) {
            self.pos += 1;
        }
        self.prev_end = token.span.end;
        token
    }

    fn start(&self) -> usize {
        self.lexeme_start(self.current())
    }

    fn span_from(&self, start: usize) -> Span {
        Span::new(start, self.prev_end.max(start))
    }

    /// Line terminations and end of file also own the blanks before them.
    fn lexeme_start(&self, token: &Token) -> usize {
        match token.kind {
            TokenKind::Newline | TokenKind::Colon | TokenKind::Eof => {
                let text = &self.source[token.span.start..token.span.end];
                token.span.start + (text.len() - text.trim_start_matches([' ', '\t']).len())
            }
            _ => token.span.start,
        }
    }

    fn at_eof(&self) -> bool {
        matches!(self.kind(), TokenKind::Eof)
    }

    fn at_line_end(&self) -> bool {
        self.kind().is_line_termination()
    }

    fn at_statement_end(&self) -> bool {
        self.at_eof() || self.at_line_end()
    }

    fn skip_line_terminations(&mut self) {
        while self.at_line_end() {
            self.advance();
        }
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        match self.kind() {
            TokenKind::Keyword(kw) | TokenKind::SoftKeyword(kw, _) => *kw == keyword,
            _ => false,
        }
    }

    fn check_any_keyword(&self, keywords: &[Keyword]) -> bool {
        keywords.iter().any(|kw| self.check_keyword(*kw))
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.check_keyword(keyword) {
            self.advance();
            return true;
        }
        false
    }

    fn expect_keyword(&mut self, keyword: Keyword, code: SyntaxErrorCode) -> Result<(), ParseError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(code))
        }
    }

    fn check_punct(&self, punct: Punct) -> bool {
        matches!(self.kind(), TokenKind::Punct(p) if *p == punct)
    }

    fn eat_punct(&mut self, punct: Punct) -> bool {
        if self.check_punct(punct) {
            self.advance();
            return true;
        }
        false
    }

    fn expect_punct(&mut self, punct: Punct, code: SyntaxErrorCode) -> Result<(), ParseError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error(code))
        }
    }

    fn check_word(&self, word: &str) -> bool {
        matches!(self.kind(), TokenKind::Identifier(name) if name.eq_ignore_ascii_case(word))
    }

    fn error(&self, code: SyntaxErrorCode) -> ParseError {
        let token = self.current();
        let start = self.lexeme_start(token);
        let end = match token.kind {
            TokenKind::Newline | TokenKind::Colon | TokenKind::Eof => start,
            _ => token.span.end,
        };
        ParseError::Syntax(Diagnostic::at(code, self.source, start, end))
    }

    /// Ends a statement: a line termination, or end of file.
    fn end_statement(&mut self) -> Result<(), ParseError> {
        if self.at_line_end() {
            self.advance();
            Ok(())
        } else if self.at_eof() {
            Ok(())
        } else {
            Err(self.error(SyntaxErrorCode::ExpectedEndOfStatement))
        }
    }

    fn identifier_text(&self) -> Option<String> {
        match self.kind() {
            TokenKind::Identifier(name)
            | TokenKind::ExtendedIdentifier(name)
            | TokenKind::SoftKeyword(_, name) => Some(name.clone()),
            _ => None,
        }
    }

    fn check_identifier(&self) -> bool {
        self.identifier_text().is_some()
    }

    fn expect_ident(&mut self) -> Result<Ident, ParseError> {
        let Some(name) = self.identifier_text() else {
            return Err(self.error(SyntaxErrorCode::ExpectedIdentifier));
        };
        if name.chars().count() > IDENTIFIER_MAX_LENGTH {
            return Err(self.error(SyntaxErrorCode::IdentifierTooLong));
        }
        let token = self.advance();
        Ok(Ident::new(name, token.span))
    }

    /// Names after `.` may be any word, reserved or not.
    fn expect_member_name(&mut self) -> Result<Ident, ParseError> {
        if self.check_identifier() {
            return self.expect_ident();
        }
        match self.kind() {
            TokenKind::Keyword(_)
            | TokenKind::Bool(_)
            | TokenKind::Null
            | TokenKind::Empty
            | TokenKind::Nothing => {
                let token = self.advance();
                let name = &self.source[token.span.start..token.span.end];
                Ok(Ident::new(name, token.span))
            }
            _ => Err(self.error(SyntaxErrorCode::ExpectedIdentifier)),
        }
    }

    // ----- program structure -----

    fn parse_options(&mut self, program: &mut Program) -> Result<(), ParseError> {
        loop {
            self.skip_line_terminations();
            if !self.eat_keyword(Keyword::Option) {
                return Ok(());
            }
            if self.eat_keyword(Keyword::Explicit) {
                program.option_explicit = true;
            } else if self.check_word("compare") {
                self.advance();
                if self.check_word("text") {
                    program.option_compare = CompareMode::Text;
                } else if self.check_word("binary") {
                    program.option_compare = CompareMode::Binary;
                } else {
                    return Err(self.error(SyntaxErrorCode::SyntaxError));
                }
                self.advance();
            } else if self.check_word("base") {
                self.advance();
                program.option_base = match self.kind() {
                    TokenKind::Integer(0) | TokenKind::HexInteger(0) | TokenKind::OctInteger(0) => 0,
                    TokenKind::Integer(1) | TokenKind::HexInteger(1) | TokenKind::OctInteger(1) => 1,
                    _ => return Err(self.error(SyntaxErrorCode::SyntaxError)),
                };
                self.advance();
            } else {
                return Err(self.error(SyntaxErrorCode::SyntaxError));
            }
            self.end_statement()?;
        }
    }

    /// `Option` after the header is accepted and ignored.
    fn skip_option_statement(&mut self) {
        self.advance();
        while !self.at_statement_end() {
            self.advance();
        }
    }

    fn parse_global_statement(&mut self) -> Result<Option<Stmt>, ParseError> {
        let stmt = match self.kind() {
            TokenKind::Keyword(Keyword::Class) => Stmt::Class(self.parse_class()?),
            TokenKind::Keyword(Keyword::Sub) => {
                Stmt::Procedure(self.parse_procedure(ProcedureKind::Sub, Access::None)?)
            }
            TokenKind::Keyword(Keyword::Function) => {
                Stmt::Procedure(self.parse_procedure(ProcedureKind::Function, Access::None)?)
            }
            TokenKind::Keyword(Keyword::Public | Keyword::Private) => {
                match self.parse_public_or_private(true)? {
                    Declaration::Procedure(procedure) => Stmt::Procedure(procedure),
                    Declaration::Property(property) => Stmt::Property(property),
                    Declaration::Const { access, items, span } => Stmt::Const { access, items, span },
                    Declaration::Field { access, vars, span } => Stmt::Field { access, vars, span },
                }
            }
            TokenKind::Keyword(Keyword::Property) | TokenKind::SoftKeyword(Keyword::Property, _)
                if matches!(
                    self.peek_kind(1),
                    TokenKind::Keyword(Keyword::Get | Keyword::Let | Keyword::Set)
                ) =>
            {
                return Err(self.error(SyntaxErrorCode::MustBeDefinedInsideClass));
            }
            _ => return self.parse_block_statement(),
        };
        self.end_statement()?;
        Ok(Some(stmt))
    }

    /// Parses statements until one of `terminators` (or end of file) starts a line.
    fn parse_block(&mut self, terminators: &[Keyword]) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        loop {
            self.skip_line_terminations();
            if self.at_eof() || self.check_any_keyword(terminators) {
                return Ok(body);
            }
            if let Some(stmt) = self.parse_block_statement()? {
                body.push(stmt);
            }
        }
    }

    fn parse_block_statement(&mut self) -> Result<Option<Stmt>, ParseError> {
        let stmt = match self.kind() {
            TokenKind::Keyword(Keyword::If) => Some(self.parse_if()?),
            TokenKind::Keyword(Keyword::For) => Some(self.parse_for()?),
            TokenKind::Keyword(Keyword::Do) => Some(self.parse_do()?),
            TokenKind::Keyword(Keyword::Select) => Some(self.parse_select()?),
            TokenKind::Keyword(Keyword::While) => Some(self.parse_while()?),
            TokenKind::Keyword(Keyword::With) => Some(self.parse_with()?),
            _ => self.parse_inline_statement()?,
        };
        self.end_statement()?;
        Ok(stmt)
    }

    fn parse_inline_statement(&mut self) -> Result<Option<Stmt>, ParseError> {
        let stmt = match self.kind() {
            TokenKind::Keyword(Keyword::Dim) => self.parse_dim()?,
            TokenKind::Keyword(Keyword::ReDim) => self.parse_redim()?,
            TokenKind::Keyword(Keyword::Const) => {
                let start = self.start();
                let items = self.parse_const_items()?;
                Stmt::Const {
                    access: Access::None,
                    items,
                    span: self.span_from(start),
                }
            }
            TokenKind::Keyword(Keyword::On) => self.parse_on_error()?,
            TokenKind::Keyword(Keyword::Exit) => self.parse_exit()?,
            TokenKind::Keyword(Keyword::Set) => {
                let start = self.start();
                self.advance();
                self.parse_assignment(start, true)?
            }
            TokenKind::Keyword(Keyword::Let) => {
                let start = self.start();
                self.advance();
                self.parse_assignment(start, false)?
            }
            TokenKind::Keyword(Keyword::Call) => self.parse_call_statement()?,
            TokenKind::Keyword(Keyword::If) => self.parse_if()?,
            TokenKind::Keyword(Keyword::Option) => {
                self.skip_option_statement();
                return Ok(None);
            }
            TokenKind::Keyword(Keyword::Public | Keyword::Private) => {
                match self.parse_public_or_private(false)? {
                    Declaration::Field { access, vars, span } => Stmt::Field { access, vars, span },
                    Declaration::Const { access, items, span } => Stmt::Const { access, items, span },
                    _ => return Err(self.error(SyntaxErrorCode::SyntaxError)),
                }
            }
            TokenKind::SoftKeyword(Keyword::Erase, _)
                if matches!(
                    self.peek_kind(1),
                    TokenKind::Identifier(_)
                        | TokenKind::ExtendedIdentifier(_)
                        | TokenKind::SoftKeyword(..)
                ) =>
            {
                let start = self.start();
                self.advance();
                let name = self.expect_ident()?;
                Stmt::Erase {
                    name,
                    span: self.span_from(start),
                }
            }
            TokenKind::Punct(Punct::Dot) if self.with_depth > 0 => self.parse_assignment_or_call()?,
            TokenKind::Identifier(_) | TokenKind::ExtendedIdentifier(_) | TokenKind::SoftKeyword(..) => {
                self.parse_assignment_or_call()?
            }
            _ => return Err(self.error(SyntaxErrorCode::ExpectedStatement)),
        };
        Ok(Some(stmt))
    }

    /// Colon-separated statements on the current source line.
    fn parse_inline_run(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        loop {
            if self.at_eof() || matches!(self.kind(), TokenKind::Newline) {
                break;
            }
            if self.check_any_keyword(&[Keyword::Else, Keyword::ElseIf, Keyword::End]) {
                break;
            }
            if matches!(self.kind(), TokenKind::Colon) {
                self.advance();
                continue;
            }
            if let Some(stmt) = self.parse_inline_statement()? {
                body.push(stmt);
            }
            if matches!(self.kind(), TokenKind::Colon) {
                self.advance();
                continue;
            }
            break;
        }
        Ok(body)
    }

    /// The body after `Then`, `Else` or a `Case` label: either the rest of the
    /// current line or a block on the lines below.
    fn parse_clause_body(&mut self, terminators: &[Keyword]) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        if matches!(self.kind(), TokenKind::Colon) {
            self.advance();
        }
        if !self.at_statement_end() && !self.check_any_keyword(terminators) {
            body = self.parse_inline_run()?;
        }
        body.extend(self.parse_block(terminators)?);
        Ok(body)
    }

    // ----- control flow -----

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        let condition = self.parse_expression()?;
        self.expect_keyword(Keyword::Then, SyntaxErrorCode::ExpectedThen)?;

        if !matches!(self.kind(), TokenKind::Newline) {
            if matches!(self.kind(), TokenKind::Colon) {
                self.advance();
            }
            let then_body = self.parse_inline_run()?;
            let mut else_body = None;
            if self.eat_keyword(Keyword::Else) {
                else_body = Some(self.parse_inline_run()?);
            }
            if self.check_keyword(Keyword::End) && matches!(self.peek_kind(1), TokenKind::Keyword(Keyword::If)) {
                self.advance();
                self.advance();
            }
            return Ok(Stmt::If {
                condition,
                then_body,
                else_ifs: Vec::new(),
                else_body,
                inline: true,
                span: self.span_from(start),
            });
        }

        const TERMINATORS: &[Keyword] = &[Keyword::End, Keyword::Else, Keyword::ElseIf];
        self.advance();
        let then_body = self.parse_block(TERMINATORS)?;
        let mut else_ifs = Vec::new();
        while self.check_keyword(Keyword::ElseIf) {
            let clause_start = self.start();
            self.advance();
            let condition = self.parse_expression()?;
            self.expect_keyword(Keyword::Then, SyntaxErrorCode::ExpectedThen)?;
            let body = self.parse_clause_body(TERMINATORS)?;
            else_ifs.push(ElseIf {
                condition,
                body,
                span: self.span_from(clause_start),
            });
        }
        let mut else_body = None;
        if self.eat_keyword(Keyword::Else) {
            else_body = Some(self.parse_clause_body(&[Keyword::End])?);
        }
        self.expect_keyword(Keyword::End, SyntaxErrorCode::ExpectedEnd)?;
        self.expect_keyword(Keyword::If, SyntaxErrorCode::ExpectedIf)?;
        Ok(Stmt::If {
            condition,
            then_body,
            else_ifs,
            else_body,
            inline: false,
            span: self.span_from(start),
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        if self.eat_keyword(Keyword::Each) {
            let var = self.expect_ident()?;
            self.expect_keyword(Keyword::In, SyntaxErrorCode::ExpectedIn)?;
            let collection = self.parse_expression()?;
            self.end_statement()?;
            let body = self.parse_block(&[Keyword::Next])?;
            self.finish_next()?;
            return Ok(Stmt::ForEach {
                var,
                collection,
                body,
                span: self.span_from(start),
            });
        }
        let var = self
            .expect_ident()
            .map_err(|_| self.error(SyntaxErrorCode::InvalidForLoopControlVariable))?;
        self.expect_punct(Punct::Eq, SyntaxErrorCode::ExpectedEqual)?;
        let from = self.parse_expression()?;
        self.expect_keyword(Keyword::To, SyntaxErrorCode::ExpectedTo)?;
        let to = self.parse_expression()?;
        let step = if self.eat_keyword(Keyword::Step) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.end_statement()?;
        let body = self.parse_block(&[Keyword::Next])?;
        self.finish_next()?;
        Ok(Stmt::For {
            var,
            from,
            to,
            step,
            body,
            span: self.span_from(start),
        })
    }

    /// `Next`, optionally naming the loop variable.
    fn finish_next(&mut self) -> Result<(), ParseError> {
        self.expect_keyword(Keyword::Next, SyntaxErrorCode::ExpectedNext)?;
        if self.check_identifier() {
            self.advance();
        }
        Ok(())
    }

    fn parse_loop_test(&mut self, post: bool) -> Result<Option<LoopTest>, ParseError> {
        let kind = if self.eat_keyword(Keyword::While) {
            LoopCondition::While
        } else if self.eat_keyword(Keyword::Until) {
            LoopCondition::Until
        } else {
            return Ok(None);
        };
        let condition = self.parse_expression()?;
        Ok(Some(LoopTest {
            kind,
            post,
            condition,
        }))
    }

    fn parse_do(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        let mut test = self.parse_loop_test(false)?;
        if !self.at_line_end() {
            return Err(self.error(if test.is_some() {
                SyntaxErrorCode::ExpectedEndOfStatement
            } else {
                SyntaxErrorCode::ExpectedWhileUntilOrEndOfStatement
            }));
        }
        self.advance();
        let body = self.parse_block(&[Keyword::Loop])?;
        self.expect_keyword(Keyword::Loop, SyntaxErrorCode::ExpectedLoop)?;
        if test.is_none() {
            test = self.parse_loop_test(true)?;
        }
        Ok(Stmt::DoLoop {
            test,
            body,
            span: self.span_from(start),
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        let condition = self.parse_expression()?;
        self.end_statement()?;
        let body = self.parse_block(&[Keyword::WEnd])?;
        self.expect_keyword(Keyword::WEnd, SyntaxErrorCode::ExpectedWend)?;
        Ok(Stmt::While {
            condition,
            body,
            span: self.span_from(start),
        })
    }

    fn parse_select(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        self.expect_keyword(Keyword::Case, SyntaxErrorCode::ExpectedCase)?;
        let subject = self.parse_expression()?;
        self.end_statement()?;

        const TERMINATORS: &[Keyword] = &[Keyword::Case, Keyword::End];
        let mut cases = Vec::new();
        let mut else_body = None;
        loop {
            self.skip_line_terminations();
            if !self.check_keyword(Keyword::Case) {
                break;
            }
            if else_body.is_some() {
                return Err(self.error(SyntaxErrorCode::SyntaxError));
            }
            let case_start = self.start();
            self.advance();
            if self.eat_keyword(Keyword::Else) {
                else_body = Some(self.parse_clause_body(TERMINATORS)?);
                continue;
            }
            let mut values = vec![self.parse_case_value()?];
            while self.eat_punct(Punct::Comma) {
                values.push(self.parse_case_value()?);
            }
            let body = self.parse_clause_body(TERMINATORS)?;
            cases.push(CaseClause {
                values,
                body,
                span: self.span_from(case_start),
            });
        }
        self.expect_keyword(Keyword::End, SyntaxErrorCode::ExpectedEnd)?;
        self.expect_keyword(Keyword::Select, SyntaxErrorCode::ExpectedSelect)?;
        Ok(Stmt::Select {
            subject,
            cases,
            else_body,
            span: self.span_from(start),
        })
    }

    fn parse_case_value(&mut self) -> Result<Expr, ParseError> {
        let start = self.start();
        let has_is = self.eat_keyword(Keyword::Is);
        let op = match self.kind() {
            TokenKind::Punct(Punct::Eq) => Some(BinaryOp::Eq),
            TokenKind::Punct(Punct::Ne) => Some(BinaryOp::Ne),
            TokenKind::Punct(Punct::Lt) => Some(BinaryOp::Lt),
            TokenKind::Punct(Punct::Gt) => Some(BinaryOp::Gt),
            TokenKind::Punct(Punct::Le) => Some(BinaryOp::Le),
            TokenKind::Punct(Punct::Ge) => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            let subject = Expr::Missing(Span::new(start, start));
            self.advance();
            let right = self.parse_expression()?;
            return Ok(Expr::Binary {
                op,
                left: Box::new(subject),
                right: Box::new(right),
                span: self.span_from(start),
            });
        }
        if has_is {
            return Err(self.error(SyntaxErrorCode::SyntaxError));
        }
        let low = self.parse_expression()?;
        if self.eat_keyword(Keyword::To) {
            let high = self.parse_expression()?;
            return Ok(Expr::Range {
                low: Box::new(low),
                high: Box::new(high),
                span: self.span_from(start),
            });
        }
        Ok(low)
    }

    fn parse_with(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        let target = self.parse_expression()?;
        self.end_statement()?;
        self.with_depth += 1;
        let body = self.parse_block(&[Keyword::End]);
        self.with_depth -= 1;
        let body = body?;
        self.expect_keyword(Keyword::End, SyntaxErrorCode::ExpectedEnd)?;
        self.expect_keyword(Keyword::With, SyntaxErrorCode::ExpectedWith)?;
        Ok(Stmt::With {
            target,
            body,
            span: self.span_from(start),
        })
    }

    // ----- simple statements -----

    fn parse_var_decls(&mut self) -> Result<Vec<VarDecl>, ParseError> {
        let mut vars = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let bounds = if self.eat_punct(Punct::LParen) {
                let mut bounds = Vec::new();
                if !self.check_punct(Punct::RParen) {
                    bounds.push(self.parse_expression()?);
                    while self.eat_punct(Punct::Comma) {
                        bounds.push(self.parse_expression()?);
                    }
                }
                self.expect_punct(Punct::RParen, SyntaxErrorCode::ExpectedRParen)?;
                Some(bounds)
            } else {
                None
            };
            vars.push(VarDecl { name, bounds });
            if !self.eat_punct(Punct::Comma) {
                return Ok(vars);
            }
        }
    }

    fn parse_dim(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        let vars = self.parse_var_decls()?;
        Ok(Stmt::Dim {
            vars,
            span: self.span_from(start),
        })
    }

    fn parse_const_items(&mut self) -> Result<Vec<ConstDecl>, ParseError> {
        self.expect_keyword(Keyword::Const, SyntaxErrorCode::SyntaxError)?;
        let mut items = Vec::new();
        loop {
            let name = self.expect_ident()?;
            self.expect_punct(Punct::Eq, SyntaxErrorCode::ExpectedEqual)?;
            let value = self.parse_expression()?;
            items.push(ConstDecl { name, value });
            if !self.eat_punct(Punct::Comma) {
                return Ok(items);
            }
        }
    }

    fn parse_redim(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        let preserve = self.eat_keyword(Keyword::Preserve);
        let mut items = Vec::new();
        loop {
            let name = self.expect_ident()?;
            self.expect_punct(Punct::LParen, SyntaxErrorCode::ExpectedLParen)?;
            let mut bounds = vec![self.parse_expression()?];
            while self.eat_punct(Punct::Comma) {
                bounds.push(self.parse_expression()?);
            }
            self.expect_punct(Punct::RParen, SyntaxErrorCode::ExpectedRParen)?;
            items.push(ReDimItem { name, bounds });
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        Ok(Stmt::ReDim {
            preserve,
            items,
            span: self.span_from(start),
        })
    }

    fn parse_on_error(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        self.expect_keyword(Keyword::Error, SyntaxErrorCode::SyntaxError)?;
        let mode = if self.eat_keyword(Keyword::Resume) {
            self.expect_keyword(Keyword::Next, SyntaxErrorCode::ExpectedNext)?;
            OnErrorMode::ResumeNext
        } else {
            self.expect_keyword(Keyword::GoTo, SyntaxErrorCode::SyntaxError)?;
            if !matches!(self.kind(), TokenKind::Integer(0)) {
                return Err(self.error(SyntaxErrorCode::SyntaxError));
            }
            self.advance();
            OnErrorMode::GoTo0
        };
        Ok(Stmt::OnError {
            mode,
            span: self.span_from(start),
        })
    }

    fn parse_exit(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        let kind = match self.kind() {
            TokenKind::Keyword(Keyword::Do) => ExitKind::Do,
            TokenKind::Keyword(Keyword::For) => ExitKind::For,
            TokenKind::Keyword(Keyword::Sub) => ExitKind::Sub,
            TokenKind::Keyword(Keyword::Function) => ExitKind::Function,
            TokenKind::Keyword(Keyword::Property) | TokenKind::SoftKeyword(Keyword::Property, _) => {
                ExitKind::Property
            }
            _ => return Err(self.error(SyntaxErrorCode::InvalidExitStatement)),
        };
        self.advance();
        Ok(Stmt::Exit {
            kind,
            span: self.span_from(start),
        })
    }

    fn parse_assignment(&mut self, start: usize, set: bool) -> Result<Stmt, ParseError> {
        let target = self.parse_left_expression()?;
        self.expect_punct(Punct::Eq, SyntaxErrorCode::ExpectedEqual)?;
        let value = self.parse_expression()?;
        Ok(Stmt::Assign {
            target,
            value,
            set,
            span: self.span_from(start),
        })
    }

    fn parse_call_statement(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        self.advance();
        let callee = self.parse_left_expression()?;
        let (callee, args) = split_call(callee);
        Ok(Stmt::Call {
            callee,
            args,
            explicit: true,
            span: self.span_from(start),
        })
    }

    fn at_call_end(&self) -> bool {
        self.at_statement_end()
            || self.check_any_keyword(&[
                Keyword::End,
                Keyword::Else,
                Keyword::ElseIf,
                Keyword::Next,
                Keyword::Loop,
                Keyword::WEnd,
                Keyword::Case,
            ])
    }

    /// Comma-separated arguments of a call statement, where an empty slot
    /// becomes [`Expr::Missing`].
    fn parse_statement_args(&mut self, args: &mut Vec<Expr>) -> Result<(), ParseError> {
        while self.eat_punct(Punct::Comma) {
            if self.check_punct(Punct::Comma) || self.at_call_end() {
                let at = self.start();
                args.push(Expr::Missing(Span::new(at, at)));
            } else {
                args.push(self.parse_expression()?);
            }
        }
        Ok(())
    }

    fn parse_assignment_or_call(&mut self) -> Result<Stmt, ParseError> {
        let start = self.start();
        let (left, last_open) = self.parse_left_chain()?;
        if self.eat_punct(Punct::Eq) {
            let value = self.parse_expression()?;
            return Ok(Stmt::Assign {
                target: left,
                value,
                set: false,
                span: self.span_from(start),
            });
        }
        if self.at_call_end() {
            let (callee, args) = split_call(left);
            return Ok(Stmt::Call {
                callee,
                args,
                explicit: false,
                span: self.span_from(start),
            });
        }
        let single_group = matches!(&left, Expr::IndexOrCall { args, .. } if args.len() == 1);
        if let (Some(open), true) = (last_open, single_group && !self.check_punct(Punct::Comma)) {
            // `Foo (a) & b` passes the whole expression as one argument.
            if let Expr::IndexOrCall { object, .. } = left {
                self.pos = open;
                let first = self.parse_expression()?;
                let mut args = vec![first];
                self.parse_statement_args(&mut args)?;
                return Ok(Stmt::Call {
                    callee: *object,
                    args,
                    explicit: false,
                    span: self.span_from(start),
                });
            }
        }
        let (callee, mut args) = if self.check_punct(Punct::Comma) {
            match left {
                // `Foo (1), 2` passes the parenthesized value as the first argument.
                Expr::IndexOrCall { object, mut args, .. } if args.len() == 1 => {
                    let first = args.remove(0);
                    (*object, vec![first])
                }
                Expr::Ident(_) | Expr::Member { .. } | Expr::WithMember { .. } => {
                    let at = self.start();
                    (left, vec![Expr::Missing(Span::new(at, at))])
                }
                _ => return Err(self.error(SyntaxErrorCode::ExpectedEndOfStatement)),
            }
        } else {
            let first = self.parse_expression()?;
            (left, vec![first])
        };
        self.parse_statement_args(&mut args)?;
        Ok(Stmt::Call {
            callee,
            args,
            explicit: false,
            span: self.span_from(start),
        })
    }

    // ----- declarations -----

    fn parse_params(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        if self.check_punct(Punct::RParen) {
            return Ok(params);
        }
        loop {
            let mode = if self.eat_keyword(Keyword::ByRef) {
                ParamMode::ByRef
            } else if self.eat_keyword(Keyword::ByVal) {
                ParamMode::ByVal
            } else {
                ParamMode::Default
            };
            let name = self.expect_ident()?;
            let array = if self.eat_punct(Punct::LParen) {
                self.expect_punct(Punct::RParen, SyntaxErrorCode::ExpectedRParen)?;
                true
            } else {
                false
            };
            params.push(Param { name, mode, array });
            if !self.eat_punct(Punct::Comma) {
                return Ok(params);
            }
        }
    }

    fn parse_procedure(&mut self, kind: ProcedureKind, access: Access) -> Result<Procedure, ParseError> {
        let start = self.start();
        let (keyword, end_code) = match kind {
            ProcedureKind::Sub => (Keyword::Sub, SyntaxErrorCode::ExpectedSub),
            ProcedureKind::Function => (Keyword::Function, SyntaxErrorCode::ExpectedFunction),
        };
        self.advance();
        let name = self.expect_ident()?;
        let mut params = Vec::new();
        let mut parens = false;
        if self.eat_punct(Punct::LParen) {
            parens = true;
            params = self.parse_params()?;
            self.expect_punct(Punct::RParen, SyntaxErrorCode::ExpectedRParen)?;
        }
        let colon = matches!(self.kind(), TokenKind::Colon);
        let inline = colon || !self.at_statement_end();
        if inline && !(parens || colon) {
            return Err(self.error(SyntaxErrorCode::ExpectedEndOfStatement));
        }
        let body = if inline {
            if colon {
                self.advance();
            }
            let mut body = self.parse_inline_run()?;
            body.extend(self.parse_block(&[Keyword::End])?);
            body
        } else {
            self.end_statement()?;
            self.parse_block(&[Keyword::End])?
        };
        self.expect_keyword(Keyword::End, SyntaxErrorCode::ExpectedEnd)?;
        self.expect_keyword(keyword, end_code)?;
        Ok(Procedure {
            kind,
            access,
            name,
            params,
            body,
            span: self.span_from(start),
        })
    }

    fn parse_property(&mut self, access: Access) -> Result<PropertyDecl, ParseError> {
        let start = self.start();
        self.expect_keyword(Keyword::Property, SyntaxErrorCode::ExpectedProperty)?;
        let kind = if self.eat_keyword(Keyword::Get) {
            PropertyKind::Get
        } else if self.eat_keyword(Keyword::Let) {
            PropertyKind::Let
        } else if self.eat_keyword(Keyword::Set) {
            PropertyKind::Set
        } else {
            return Err(self.error(SyntaxErrorCode::ExpectedLetGetSet));
        };
        if access == Access::PublicDefault && kind != PropertyKind::Get {
            return Err(self.error(SyntaxErrorCode::DefaultCanOnlyBeOnPropertyGet));
        }
        let name = self.expect_ident()?;
        let mut params = Vec::new();
        if self.eat_punct(Punct::LParen) {
            params = self.parse_params()?;
            self.expect_punct(Punct::RParen, SyntaxErrorCode::ExpectedRParen)?;
        }
        if kind != PropertyKind::Get && params.is_empty() {
            return Err(self.error(SyntaxErrorCode::PropertySetOrLetMustHaveArguments));
        }
        self.end_statement()?;
        let body = self.parse_block(&[Keyword::End])?;
        self.expect_keyword(Keyword::End, SyntaxErrorCode::ExpectedEnd)?;
        self.expect_keyword(Keyword::Property, SyntaxErrorCode::ExpectedProperty)?;
        Ok(PropertyDecl {
            kind,
            access,
            name,
            params,
            body,
            span: self.span_from(start),
        })
    }

    fn parse_public_or_private(&mut self, global: bool) -> Result<Declaration, ParseError> {
        let start = self.start();
        let private = self.check_keyword(Keyword::Private);
        self.advance();
        let default = self.eat_keyword(Keyword::Default);
        if default && private {
            return Err(self.error(SyntaxErrorCode::DefaultMustAlsoSpecifyPublic));
        }
        let access = match (private, default) {
            (true, _) => Access::Private,
            (false, true) => Access::PublicDefault,
            (false, false) => Access::Public,
        };
        match self.kind() {
            TokenKind::Keyword(Keyword::Sub) => Ok(Declaration::Procedure(
                self.parse_procedure(ProcedureKind::Sub, access)?,
            )),
            TokenKind::Keyword(Keyword::Function) => Ok(Declaration::Procedure(
                self.parse_procedure(ProcedureKind::Function, access)?,
            )),
            TokenKind::SoftKeyword(Keyword::Property, _)
                if matches!(
                    self.peek_kind(1),
                    TokenKind::Keyword(Keyword::Get | Keyword::Let | Keyword::Set)
                ) =>
            {
                if global {
                    return Err(self.error(SyntaxErrorCode::MustBeDefinedInsideClass));
                }
                Ok(Declaration::Property(self.parse_property(access)?))
            }
            _ if default => Err(self.error(
                SyntaxErrorCode::DefaultCanBeSpecifiedOnlyOnPropertyFunctionOrSub,
            )),
            TokenKind::Keyword(Keyword::Const) => {
                let items = self.parse_const_items()?;
                Ok(Declaration::Const {
                    access,
                    items,
                    span: self.span_from(start),
                })
            }
            _ if self.check_identifier() => {
                let vars = self.parse_var_decls()?;
                Ok(Declaration::Field {
                    access,
                    vars,
                    span: self.span_from(start),
                })
            }
            _ => Err(self.error(SyntaxErrorCode::ExpectedIdentifier)),
        }
    }

    fn parse_class(&mut self) -> Result<ClassDecl, ParseError> {
        let start = self.start();
        self.advance();
        let name = self.expect_ident()?;
        self.end_statement()?;
        let mut members = Vec::new();
        let mut has_default = false;
        loop {
            self.skip_line_terminations();
            if self.at_eof() || self.check_keyword(Keyword::End) {
                break;
            }
            let member_start = self.start();
            let declaration = match self.kind() {
                TokenKind::Keyword(Keyword::Public | Keyword::Private) => {
                    self.parse_public_or_private(false)?
                }
                TokenKind::Keyword(Keyword::Dim) => {
                    self.advance();
                    let vars = self.parse_var_decls()?;
                    Declaration::Field {
                        access: Access::None,
                        vars,
                        span: self.span_from(member_start),
                    }
                }
                TokenKind::Keyword(Keyword::Const) => {
                    let items = self.parse_const_items()?;
                    Declaration::Const {
                        access: Access::None,
                        items,
                        span: self.span_from(member_start),
                    }
                }
                TokenKind::Keyword(Keyword::Sub) => {
                    Declaration::Procedure(self.parse_procedure(ProcedureKind::Sub, Access::None)?)
                }
                TokenKind::Keyword(Keyword::Function) => Declaration::Procedure(
                    self.parse_procedure(ProcedureKind::Function, Access::None)?,
                ),
                TokenKind::SoftKeyword(Keyword::Property, _) => {
                    Declaration::Property(self.parse_property(Access::None)?)
                }
                _ => return Err(self.error(SyntaxErrorCode::ExpectedStatement)),
            };
            let member = match declaration {
                Declaration::Procedure(procedure) => self.class_procedure(procedure)?,
                Declaration::Property(property) => ClassMember::Property(property),
                Declaration::Const { access, items, span } => ClassMember::Const { access, items, span },
                Declaration::Field { access, vars, span } => ClassMember::Field { access, vars, span },
            };
            let is_default = match &member {
                ClassMember::Method(procedure) => procedure.access == Access::PublicDefault,
                ClassMember::Property(property) => property.access == Access::PublicDefault,
                _ => false,
            };
            if is_default {
                if has_default {
                    return Err(self.error(SyntaxErrorCode::CannotHaveMultipleDefault));
                }
                has_default = true;
            }
            members.push(member);
            self.end_statement()?;
        }
        self.expect_keyword(Keyword::End, SyntaxErrorCode::ExpectedEnd)?;
        self.expect_keyword(Keyword::Class, SyntaxErrorCode::ExpectedClass)?;
        Ok(ClassDecl {
            name,
            members,
            span: self.span_from(start),
        })
    }

    fn class_procedure(&self, procedure: Procedure) -> Result<ClassMember, ParseError> {
        let lifecycle = procedure.kind == ProcedureKind::Sub
            && (procedure.name.is("class_initialize") || procedure.name.is("class_terminate"));
        if !lifecycle {
            return Ok(ClassMember::Method(procedure));
        }
        if !procedure.params.is_empty() {
            return Err(ParseError::Syntax(Diagnostic::at(
                SyntaxErrorCode::ClassInitializeOrTerminateDoNotHaveArguments,
                self.source,
                procedure.name.span.start,
                procedure.name.span.end,
            )));
        }
        if procedure.name.is("class_initialize") {
            Ok(ClassMember::Initialize {
                access: procedure.access,
                body: procedure.body,
                span: procedure.span,
            })
        } else {
            Ok(ClassMember::Terminate {
                access: procedure.access,
                body: procedure.body,
                span: procedure.span,
            })
        }
    }

    // ----- expressions, lowest precedence first -----

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_imp()
    }

    fn binary(&self, op: BinaryOp, left: Expr, right: Expr) -> Expr {
        let span = left.span().to(right.span());
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            span,
        }
    }

    fn parse_imp(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_eqv()?;
        while self.eat_keyword(Keyword::Imp) {
            let right = self.parse_eqv()?;
            expr = self.binary(BinaryOp::Imp, expr, right);
        }
        Ok(expr)
    }

    fn parse_eqv(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_xor()?;
        while self.eat_keyword(Keyword::Eqv) {
            let right = self.parse_xor()?;
            expr = self.binary(BinaryOp::Eqv, expr, right);
        }
        Ok(expr)
    }

    fn parse_xor(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_or()?;
        while self.eat_keyword(Keyword::Xor) {
            let right = self.parse_or()?;
            expr = self.binary(BinaryOp::Xor, expr, right);
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_and()?;
        while self.eat_keyword(Keyword::Or) {
            let right = self.parse_and()?;
            expr = self.binary(BinaryOp::Or, expr, right);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_not()?;
        while self.eat_keyword(Keyword::And) {
            let right = self.parse_not()?;
            expr = self.binary(BinaryOp::And, expr, right);
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.check_keyword(Keyword::Not) {
            let start = self.start();
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
                span: self.span_from(start),
            });
        }
        self.parse_relational()
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_concat()?;
        loop {
            let op = match self.kind() {
                TokenKind::Punct(Punct::Eq) => BinaryOp::Eq,
                TokenKind::Punct(Punct::Ne) => BinaryOp::Ne,
                TokenKind::Punct(Punct::Lt) => BinaryOp::Lt,
                TokenKind::Punct(Punct::Gt) => BinaryOp::Gt,
                TokenKind::Punct(Punct::Le) => BinaryOp::Le,
                TokenKind::Punct(Punct::Ge) => BinaryOp::Ge,
                TokenKind::Keyword(Keyword::Is) => BinaryOp::Is,
                _ => return Ok(expr),
            };
            self.advance();
            let right = self.parse_concat()?;
            expr = self.binary(op, expr, right);
        }
    }

    fn parse_concat(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_additive()?;
        while self.eat_punct(Punct::Amp) {
            let right = self.parse_additive()?;
            expr = self.binary(BinaryOp::Concat, expr, right);
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_modulo()?;
        loop {
            let op = match self.kind() {
                TokenKind::Punct(Punct::Plus) => BinaryOp::Add,
                TokenKind::Punct(Punct::Minus) => BinaryOp::Sub,
                _ => return Ok(expr),
            };
            self.advance();
            let right = self.parse_modulo()?;
            expr = self.binary(op, expr, right);
        }
    }

    fn parse_modulo(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_multiplicative()?;
        while self.eat_keyword(Keyword::Mod) {
            let right = self.parse_multiplicative()?;
            expr = self.binary(BinaryOp::Mod, expr, right);
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.kind() {
                TokenKind::Punct(Punct::Star) => BinaryOp::Mul,
                TokenKind::Punct(Punct::Slash) => BinaryOp::Div,
                TokenKind::Punct(Punct::Backslash) => BinaryOp::IntDiv,
                _ => return Ok(expr),
            };
            self.advance();
            let right = self.parse_unary()?;
            expr = self.binary(op, expr, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.kind() {
            TokenKind::Punct(Punct::Minus) => UnaryOp::Minus,
            TokenKind::Punct(Punct::Plus) => UnaryOp::Plus,
            _ => return self.parse_power(),
        };
        let start = self.start();
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
            span: self.span_from(start),
        })
    }

    /// `^` is right-associative and binds tighter than a leading sign on its
    /// left operand, so `-2 ^ 2` is `-(2 ^ 2)`.
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_primary()?;
        if self.eat_punct(Punct::Caret) {
            let exponent = self.parse_unary()?;
            return Ok(self.binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let start = self.start();
        let literal = match self.kind() {
            TokenKind::String(value) => Some(Literal::String(value.clone())),
            TokenKind::Integer(value) | TokenKind::HexInteger(value) | TokenKind::OctInteger(value) => {
                Some(Literal::Int(*value))
            }
            TokenKind::Float(value) => Some(Literal::Float(*value)),
            TokenKind::Date(value) => Some(Literal::Date(*value)),
            TokenKind::Bool(value) => Some(Literal::Bool(*value)),
            TokenKind::Null => Some(Literal::Null),
            TokenKind::Empty => Some(Literal::Empty),
            TokenKind::Nothing => Some(Literal::Nothing),
            _ => None,
        };
        if let Some(literal) = literal {
            self.advance();
            return Ok(Expr::Literal(literal, self.span_from(start)));
        }
        if self.eat_punct(Punct::LParen) {
            let expr = self.parse_expression()?;
            self.expect_punct(Punct::RParen, SyntaxErrorCode::ExpectedRParen)?;
            return Ok(expr);
        }
        if self.eat_keyword(Keyword::New) {
            let class = self.expect_ident()?;
            return Ok(Expr::New {
                class,
                span: self.span_from(start),
            });
        }
        if self.check_identifier() || (self.with_depth > 0 && self.check_punct(Punct::Dot)) {
            return self.parse_left_expression();
        }
        Err(self.error(SyntaxErrorCode::ExpectedExpression))
    }

    /// An identifier (or `.member` inside `With`) followed by any chain of
    /// member accesses and argument lists.
    fn parse_left_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_left_chain().map(|(expr, _)| expr)
    }

    /// Also returns the token index of the final `(` when the chain ends in
    /// an argument list.
    fn parse_left_chain(&mut self) -> Result<(Expr, Option<usize>), ParseError> {
        let start = self.start();
        let mut last_open = None;
        let mut expr = if self.with_depth > 0 && self.eat_punct(Punct::Dot) {
            let name = self.expect_member_name()?;
            Expr::WithMember {
                name,
                span: self.span_from(start),
            }
        } else {
            Expr::Ident(self.expect_ident()?)
        };
        loop {
            if self.eat_punct(Punct::Dot) {
                last_open = None;
                let name = self.expect_member_name()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    name,
                    span: self.span_from(start),
                };
            } else if self.check_punct(Punct::LParen) {
                last_open = Some(self.pos);
                self.advance();
                let args = self.parse_call_args()?;
                expr = Expr::IndexOrCall {
                    object: Box::new(expr),
                    args,
                    span: self.span_from(start),
                };
            } else {
                return Ok((expr, last_open));
            }
        }
    }

    /// Arguments after `(`, consuming the closing `)`.
    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat_punct(Punct::RParen) {
            return Ok(args);
        }
        loop {
            if self.check_punct(Punct::Comma) || self.check_punct(Punct::RParen) {
                let at = self.start();
                args.push(Expr::Missing(Span::new(at, at)));
            } else {
                args.push(self.parse_expression()?);
            }
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(Punct::RParen, SyntaxErrorCode::ExpectedRParen)?;
        Ok(args)
    }
}

/// A statement-level `Foo(a, b)` calls `Foo` with those arguments.
fn split_call(expr: Expr) -> (Expr, Vec<Expr>) {
    match expr {
        Expr::IndexOrCall { object, args, .. } => (*object, args),
        other => (other, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_program, parse_program_with_options, ParseOptions, SyntaxErrorCode};
    use vbs_syntax::{
        Access, BinaryOp, ClassMember, CompareMode, ExitKind, Expr, Literal, LoopCondition,
        ProcedureKind, Stmt, UnaryOp,
    };

    fn parse_expr(source: &str) -> Expr {
        let program = parse_program(&format!("x = {source}")).expect("parse");
        match program.body.into_iter().next() {
            Some(Stmt::Assign { value, .. }) => value,
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    fn shape(expr: &Expr) -> String {
        match expr {
            Expr::Literal(Literal::Int(value), _) => value.to_string(),
            Expr::Ident(ident) => ident.name.clone(),
            Expr::Binary { op, left, right, .. } => {
                format!("({} {} {})", shape(left), op.symbol(), shape(right))
            }
            Expr::Unary { op, operand, .. } => {
                let symbol = match op {
                    UnaryOp::Minus => "-",
                    UnaryOp::Plus => "+",
                    UnaryOp::Not => "Not ",
                };
                format!("({symbol}{})", shape(operand))
            }
            other => other.kind_name().to_string(),
        }
    }

    #[test]
    fn dim_then_assignment() {
        let program = parse_program("Dim x\nx = 10").expect("parse");
        assert_eq!(program.body.len(), 2);
        assert_eq!(program.body[0].kind_name(), "VariablesDeclaration");
        assert_eq!(program.body[1].kind_name(), "AssignmentStatement");
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(shape(&parse_expr("2 + 3 * 4")), "(2 + (3 * 4))");
        assert_eq!(shape(&parse_expr("2 * 3 + 4")), "((2 * 3) + 4)");
        assert_eq!(shape(&parse_expr("2 ^ 3 ^ 2")), "(2 ^ (3 ^ 2))");
        assert_eq!(shape(&parse_expr("-2 ^ 2")), "(-(2 ^ 2))");
        assert_eq!(shape(&parse_expr("7 Mod 3 * 2")), "(7 Mod (3 * 2))");
        assert_eq!(shape(&parse_expr("7 \\ 2 * 3")), "((7 \\ 2) * 3)");
        assert_eq!(shape(&parse_expr("1 + 7 Mod 3")), "(1 + (7 Mod 3))");
        assert_eq!(shape(&parse_expr("10 - 4 - 3")), "((10 - 4) - 3)");
        assert_eq!(shape(&parse_expr("2 ^ -1")), "(2 ^ (-1))");
    }

    #[test]
    fn logical_and_relational_precedence() {
        assert_eq!(
            shape(&parse_expr("a = 1 Or b & c = d And Not e")),
            "((a = 1) Or (((b & c) = d) And (Not e)))"
        );
        assert_eq!(shape(&parse_expr("a Imp b Eqv c")), "(a Imp (b Eqv c))");
        assert_eq!(shape(&parse_expr("Not a = b")), "(Not (a = b))");
        assert_eq!(shape(&parse_expr("a & b + c")), "(a & (b + c))");
    }

    #[test]
    fn case_insensitive_keywords_give_identical_asts() {
        let variants = [
            "DIM x\nIF x THEN x = 1 ELSE x = 2",
            "Dim x\nIf x Then x = 1 Else x = 2",
            "dim x\nif x then x = 1 else x = 2",
        ];
        let programs: Vec<_> = variants
            .iter()
            .map(|source| parse_program(source).expect("parse"))
            .collect();
        assert_eq!(programs[0], programs[1]);
        assert_eq!(programs[1], programs[2]);
    }

    #[test]
    fn inline_if_without_end_if() {
        let program = parse_program("If 1 = 1 Then Response.Write 1").expect("parse");
        match &program.body[0] {
            Stmt::If {
                inline,
                else_body,
                then_body,
                ..
            } => {
                assert!(*inline);
                assert!(else_body.is_none());
                assert_eq!(then_body.len(), 1);
                match &then_body[0] {
                    Stmt::Call { callee, args, .. } => {
                        assert_eq!(callee.kind_name(), "MemberExpression");
                        assert_eq!(args.len(), 1);
                    }
                    other => panic!("expected call, got {other:?}"),
                }
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn inline_if_with_colons_and_else() {
        let program = parse_program("If a Then b = 1 : c = 2 Else d = 3 : e = 4\nf = 5").expect("parse");
        assert_eq!(program.body.len(), 2);
        match &program.body[0] {
            Stmt::If {
                then_body,
                else_body,
                inline,
                ..
            } => {
                assert!(*inline);
                assert_eq!(then_body.len(), 2);
                assert_eq!(else_body.as_ref().map(Vec::len), Some(2));
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn block_if_with_elseif_chain() {
        let source = "If a Then\n  x = 1\nElseIf b Then\n  x = 2\nElseIf c Then x = 3\nElse\n  x = 4\nEnd If";
        let program = parse_program(source).expect("parse");
        match &program.body[0] {
            Stmt::If {
                else_ifs,
                else_body,
                inline,
                ..
            } => {
                assert!(!*inline);
                assert_eq!(else_ifs.len(), 2);
                assert_eq!(else_ifs[1].body.len(), 1);
                assert_eq!(else_body.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn missing_arguments_are_distinct_nodes() {
        let expr = parse_expr("Foo(1, , 3)");
        match expr {
            Expr::IndexOrCall { args, .. } => {
                assert_eq!(args.len(), 3);
                assert!(matches!(args[0], Expr::Literal(Literal::Int(1), _)));
                assert!(matches!(args[1], Expr::Missing(_)));
                assert!(matches!(args[2], Expr::Literal(Literal::Int(3), _)));
            }
            other => panic!("expected call, got {other:?}"),
        }
        match parse_expr("Foo(1,)") {
            Expr::IndexOrCall { args, .. } => assert!(matches!(args[1], Expr::Missing(_))),
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn call_statement_forms() {
        let program = parse_program("Foo 1, , 3\nCall Bar(2)\nBaz\nQux (4), 5").expect("parse");
        let summary: Vec<(String, usize, bool)> = program
            .body
            .iter()
            .map(|stmt| match stmt {
                Stmt::Call {
                    callee,
                    args,
                    explicit,
                    ..
                } => (
                    callee.as_ident().map(|id| id.name.clone()).unwrap_or_default(),
                    args.len(),
                    *explicit,
                ),
                other => panic!("expected call, got {other:?}"),
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Foo".to_string(), 3, false),
                ("Bar".to_string(), 1, true),
                ("Baz".to_string(), 0, false),
                ("Qux".to_string(), 2, false),
            ]
        );
    }

    #[test]
    fn parenthesized_first_argument_joins_the_expression() {
        let program = parse_program("Response.Write (a) & \"!\"").expect("parse");
        match &program.body[0] {
            Stmt::Call { callee, args, .. } => {
                assert_eq!(callee.kind_name(), "MemberExpression");
                assert_eq!(args.len(), 1);
                assert!(matches!(args[0], Expr::Binary { op: BinaryOp::Concat, .. }));
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn for_loops() {
        let program = parse_program("For i = 1 To 10 Step 2\nx = x + i\nNext\nFor Each v In items\nNext")
            .expect("parse");
        assert!(matches!(&program.body[0], Stmt::For { step: Some(_), body, .. } if body.len() == 1));
        assert!(matches!(&program.body[1], Stmt::ForEach { var, .. } if var.name == "v"));
    }

    #[test]
    fn do_loop_variants() {
        let program = parse_program(
            "Do While a\nLoop\nDo\nLoop Until b\nDo Until c\nLoop\nDo\nExit Do\nLoop",
        )
        .expect("parse");
        let tests: Vec<Option<(LoopCondition, bool)>> = program
            .body
            .iter()
            .map(|stmt| match stmt {
                Stmt::DoLoop { test, .. } => test.as_ref().map(|test| (test.kind, test.post)),
                other => panic!("expected do, got {other:?}"),
            })
            .collect();
        assert_eq!(
            tests,
            vec![
                Some((LoopCondition::While, false)),
                Some((LoopCondition::Until, true)),
                Some((LoopCondition::Until, false)),
                None
            ]
        );
        match &program.body[3] {
            Stmt::DoLoop { body, .. } => {
                assert!(matches!(body[0], Stmt::Exit { kind: ExitKind::Do, .. }))
            }
            other => panic!("expected do, got {other:?}"),
        }
    }

    #[test]
    fn select_case_values_ranges_and_is() {
        let source = "Select Case n\nCase 1, 2\nx = 1\nCase 3 To 5: x = 2\nCase Is > 10\nx = 3\nCase Else\nx = 4\nEnd Select";
        let program = parse_program(source).expect("parse");
        match &program.body[0] {
            Stmt::Select {
                cases, else_body, ..
            } => {
                assert_eq!(cases.len(), 3);
                assert_eq!(cases[0].values.len(), 2);
                assert!(matches!(cases[1].values[0], Expr::Range { .. }));
                assert_eq!(cases[1].body.len(), 1);
                match &cases[2].values[0] {
                    Expr::Binary { op, left, .. } => {
                        assert_eq!(*op, BinaryOp::Gt);
                        assert!(matches!(**left, Expr::Missing(_)));
                    }
                    other => panic!("expected comparison, got {other:?}"),
                }
                assert_eq!(else_body.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn case_else_must_be_last() {
        let err = parse_program("Select Case n\nCase Else\nx = 1\nCase 1\nx = 2\nEnd Select")
            .expect_err("case after else");
        assert_eq!(err.code(), SyntaxErrorCode::SyntaxError);
    }

    #[test]
    fn with_block_member_access() {
        let program = parse_program("With obj\n.Name = \"x\"\n.Save\nEnd With").expect("parse");
        match &program.body[0] {
            Stmt::With { body, .. } => {
                assert!(matches!(&body[0], Stmt::Assign { target: Expr::WithMember { .. }, .. }));
                assert!(matches!(&body[1], Stmt::Call { callee: Expr::WithMember { .. }, .. }));
            }
            other => panic!("expected with, got {other:?}"),
        }
        assert!(parse_program(".Name = 1").is_err());
    }

    #[test]
    fn procedures_and_inline_bodies() {
        let source = "Function Inc(ByVal n)\nInc = n + 1\nEnd Function\nSub Hello(): x = 1: End Sub\nPrivate Sub Quiet\nEnd Sub";
        let program = parse_program(source).expect("parse");
        match &program.body[0] {
            Stmt::Procedure(procedure) => {
                assert_eq!(procedure.kind, ProcedureKind::Function);
                assert_eq!(procedure.params.len(), 1);
                assert_eq!(procedure.body.len(), 1);
            }
            other => panic!("expected function, got {other:?}"),
        }
        assert!(matches!(&program.body[1], Stmt::Procedure(p) if p.body.len() == 1));
        assert!(matches!(&program.body[2], Stmt::Procedure(p) if p.access == Access::Private));
        let err = parse_program("Sub Bad x = 1 End Sub").expect_err("inline without parens");
        assert_eq!(err.code(), SyntaxErrorCode::ExpectedEndOfStatement);
    }

    #[test]
    fn class_members() {
        let source = "Class Person\n  Private m_name\n  Public Age\n  Const KIND = \"p\"\n  Private Sub Class_Initialize()\n    m_name = \"\"\n  End Sub\n  Public Default Property Get Name\n    Name = m_name\n  End Property\n  Public Property Let Name(value)\n    m_name = value\n  End Property\n  Function Greet()\n    Greet = \"hi\"\n  End Function\nEnd Class";
        let program = parse_program(source).expect("parse");
        let Stmt::Class(class) = &program.body[0] else {
            panic!("expected class");
        };
        assert_eq!(class.members.len(), 7);
        assert!(matches!(class.members[3], ClassMember::Initialize { .. }));
        assert_eq!(class.default_member().map(|id| id.name.as_str()), Some("Name"));
    }

    #[test]
    fn class_rule_violations() {
        let err = parse_program("Class A\nSub Class_Terminate(x)\nEnd Sub\nEnd Class").expect_err("args");
        assert_eq!(err.code(), SyntaxErrorCode::ClassInitializeOrTerminateDoNotHaveArguments);
        let err = parse_program("Class A\nProperty Let V\nEnd Property\nEnd Class").expect_err("let");
        assert_eq!(err.code(), SyntaxErrorCode::PropertySetOrLetMustHaveArguments);
        let err = parse_program(
            "Class A\nPublic Default Function F()\nEnd Function\nPublic Default Sub G()\nEnd Sub\nEnd Class",
        )
        .expect_err("two defaults");
        assert_eq!(err.code(), SyntaxErrorCode::CannotHaveMultipleDefault);
        let err = parse_program("Property Get X\nEnd Property").expect_err("global property");
        assert_eq!(err.code(), SyntaxErrorCode::MustBeDefinedInsideClass);
    }

    #[test]
    fn option_header() {
        let program = parse_program("Option Explicit\nOption Compare Text\nOption Base 1\nDim a")
            .expect("parse");
        assert!(program.option_explicit);
        assert_eq!(program.option_compare, CompareMode::Text);
        assert_eq!(program.option_base, 1);
        assert_eq!(program.body.len(), 1);
        assert!(parse_program("Option Base 2").is_err());
    }

    #[test]
    fn misc_statements() {
        let source = "On Error Resume Next\nOn Error GoTo 0\nReDim Preserve a(10), b(2, 3)\nErase a\nSet o = Nothing\nConst A = 1, B = \"two\"";
        let program = parse_program(source).expect("parse");
        let kinds: Vec<&str> = program.body.iter().map(Stmt::kind_name).collect();
        assert_eq!(
            kinds,
            vec![
                "OnErrorStatement",
                "OnErrorStatement",
                "ReDimStatement",
                "EraseStatement",
                "AssignmentStatement",
                "ConstsDeclaration"
            ]
        );
        assert!(matches!(&program.body[2], Stmt::ReDim { preserve: true, items, .. } if items[1].bounds.len() == 2));
        assert!(matches!(&program.body[4], Stmt::Assign { set: true, .. }));
    }

    #[test]
    fn missing_end_reports_code() {
        let err = parse_program("If a Then\nx = 1\n").expect_err("missing end if");
        assert_eq!(err.code(), SyntaxErrorCode::ExpectedEnd);
        let err = parse_program("For i = 1 To 2\nx = 1\n").expect_err("missing next");
        assert_eq!(err.code(), SyntaxErrorCode::ExpectedNext);
        let err = parse_program("While a\n").expect_err("missing wend");
        assert_eq!(err.code(), SyntaxErrorCode::ExpectedWend);
        let err = parse_program("x = (1 + 2").expect_err("missing paren");
        assert_eq!(err.code(), SyntaxErrorCode::ExpectedRParen);
        let err = parse_program("x = ").expect_err("missing expression");
        assert_eq!(err.code(), SyntaxErrorCode::ExpectedExpression);
    }

    #[test]
    fn syntax_errors_carry_context() {
        let err = parse_program("a = 1\nIf a Then\nx = 1\nEnd Wend").expect_err("bad end");
        let diagnostic = err.diagnostic();
        assert_eq!(diagnostic.code, SyntaxErrorCode::ExpectedIf);
        assert_eq!(diagnostic.line, 4);
        assert_eq!(diagnostic.column, 4);
        assert_eq!(diagnostic.token, "Wend");
        assert_eq!(diagnostic.line_text, "End Wend");
    }

    #[test]
    fn unterminated_string_is_a_lex_error() {
        let err = parse_program("Dim x = \"abc").expect_err("unterminated");
        assert!(err.is_lex());
        assert_eq!(err.code(), SyntaxErrorCode::UnterminatedStringConstant);
        assert_eq!(err.diagnostic().line, 1);
        assert_eq!(err.diagnostic().line_text, "Dim x = \"abc");
    }

    #[test]
    fn identifier_length_limit() {
        let long = "a".repeat(256);
        let err = parse_program(&format!("{long} = 1")).expect_err("too long");
        assert_eq!(err.code(), SyntaxErrorCode::IdentifierTooLong);
        assert!(parse_program(&format!("{} = 1", "b".repeat(255))).is_ok());
    }

    #[test]
    fn comments_are_kept_on_request() {
        let source = "' header\nx = 1 ' trailing\nREM done";
        let program = parse_program_with_options(source, &ParseOptions { keep_comments: true })
            .expect("parse");
        assert_eq!(program.comments.len(), 3);
        assert!(program.comments[2].rem);
        assert!(parse_program(source).expect("parse").comments.is_empty());
    }

    #[test]
    fn keywords_after_dot_are_member_names() {
        match parse_expr("Response.End") {
            Expr::Member { name, .. } => assert_eq!(name.name, "End"),
            other => panic!("expected member, got {other:?}"),
        }
    }
}
