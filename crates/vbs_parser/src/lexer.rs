use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use vbs_syntax::Span;

use crate::error::{Diagnostic, ParseError, SyntaxErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    And,
    ByRef,
    ByVal,
    Call,
    Case,
    Class,
    Const,
    Dim,
    Do,
    Each,
    Else,
    ElseIf,
    End,
    Eqv,
    Exit,
    For,
    Function,
    Get,
    GoTo,
    If,
    Imp,
    In,
    Is,
    Let,
    Loop,
    Mod,
    New,
    Next,
    Not,
    On,
    Option,
    Or,
    Preserve,
    Private,
    Public,
    ReDim,
    Resume,
    Select,
    Set,
    Sub,
    Then,
    To,
    Until,
    WEnd,
    While,
    With,
    Xor,
    // Usable as ordinary identifiers.
    Default,
    Erase,
    Error,
    Explicit,
    Property,
    Step,
}

const RESERVED: &[(&str, Keyword)] = &[
    ("and", Keyword::And),
    ("byref", Keyword::ByRef),
    ("byval", Keyword::ByVal),
    ("call", Keyword::Call),
    ("case", Keyword::Case),
    ("class", Keyword::Class),
    ("const", Keyword::Const),
    ("dim", Keyword::Dim),
    ("do", Keyword::Do),
    ("each", Keyword::Each),
    ("else", Keyword::Else),
    ("elseif", Keyword::ElseIf),
    ("end", Keyword::End),
    ("eqv", Keyword::Eqv),
    ("exit", Keyword::Exit),
    ("for", Keyword::For),
    ("function", Keyword::Function),
    ("get", Keyword::Get),
    ("goto", Keyword::GoTo),
    ("if", Keyword::If),
    ("imp", Keyword::Imp),
    ("in", Keyword::In),
    ("is", Keyword::Is),
    ("let", Keyword::Let),
    ("loop", Keyword::Loop),
    ("mod", Keyword::Mod),
    ("new", Keyword::New),
    ("next", Keyword::Next),
    ("not", Keyword::Not),
    ("on", Keyword::On),
    ("option", Keyword::Option),
    ("or", Keyword::Or),
    ("preserve", Keyword::Preserve),
    ("private", Keyword::Private),
    ("public", Keyword::Public),
    ("redim", Keyword::ReDim),
    ("resume", Keyword::Resume),
    ("select", Keyword::Select),
    ("set", Keyword::Set),
    ("sub", Keyword::Sub),
    ("then", Keyword::Then),
    ("to", Keyword::To),
    ("until", Keyword::Until),
    ("wend", Keyword::WEnd),
    ("while", Keyword::While),
    ("with", Keyword::With),
    ("xor", Keyword::Xor),
];

const SOFT: &[(&str, Keyword)] = &[
    ("default", Keyword::Default),
    ("erase", Keyword::Erase),
    ("error", Keyword::Error),
    ("explicit", Keyword::Explicit),
    ("property", Keyword::Property),
    ("step", Keyword::Step),
];

impl Keyword {
    pub fn reserved(name: &str) -> Option<Keyword> {
        RESERVED
            .iter()
            .find(|(text, _)| text.eq_ignore_ascii_case(name))
            .map(|(_, keyword)| *keyword)
    }

    pub fn soft(name: &str) -> Option<Keyword> {
        SOFT.iter()
            .find(|(text, _)| text.eq_ignore_ascii_case(name))
            .map(|(_, keyword)| *keyword)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::And => "And",
            Keyword::ByRef => "ByRef",
            Keyword::ByVal => "ByVal",
            Keyword::Call => "Call",
            Keyword::Case => "Case",
            Keyword::Class => "Class",
            Keyword::Const => "Const",
            Keyword::Dim => "Dim",
            Keyword::Do => "Do",
            Keyword::Each => "Each",
            Keyword::Else => "Else",
            Keyword::ElseIf => "ElseIf",
            Keyword::End => "End",
            Keyword::Eqv => "Eqv",
            Keyword::Exit => "Exit",
            Keyword::For => "For",
            Keyword::Function => "Function",
            Keyword::Get => "Get",
            Keyword::GoTo => "GoTo",
            Keyword::If => "If",
            Keyword::Imp => "Imp",
            Keyword::In => "In",
            Keyword::Is => "Is",
            Keyword::Let => "Let",
            Keyword::Loop => "Loop",
            Keyword::Mod => "Mod",
            Keyword::New => "New",
            Keyword::Next => "Next",
            Keyword::Not => "Not",
            Keyword::On => "On",
            Keyword::Option => "Option",
            Keyword::Or => "Or",
            Keyword::Preserve => "Preserve",
            Keyword::Private => "Private",
            Keyword::Public => "Public",
            Keyword::ReDim => "ReDim",
            Keyword::Resume => "Resume",
            Keyword::Select => "Select",
            Keyword::Set => "Set",
            Keyword::Sub => "Sub",
            Keyword::Then => "Then",
            Keyword::To => "To",
            Keyword::Until => "Until",
            Keyword::WEnd => "WEnd",
            Keyword::While => "While",
            Keyword::With => "With",
            Keyword::Xor => "Xor",
            Keyword::Default => "Default",
            Keyword::Erase => "Erase",
            Keyword::Error => "Error",
            Keyword::Explicit => "Explicit",
            Keyword::Property => "Property",
            Keyword::Step => "Step",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Punct {
    LParen,
    RParen,
    Dot,
    Comma,
    Plus,
    Minus,
    Slash,
    Backslash,
    Star,
    Amp,
    Caret,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Punct {
    pub fn as_str(self) -> &'static str {
        match self {
            Punct::LParen => "(",
            Punct::RParen => ")",
            Punct::Dot => ".",
            Punct::Comma => ",",
            Punct::Plus => "+",
            Punct::Minus => "-",
            Punct::Slash => "/",
            Punct::Backslash => "\\",
            Punct::Star => "*",
            Punct::Amp => "&",
            Punct::Caret => "^",
            Punct::Eq => "=",
            Punct::Ne => "<>",
            Punct::Lt => "<",
            Punct::Gt => ">",
            Punct::Le => "<=",
            Punct::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Eof,
    /// A run of line terminators containing at least one real newline.
    Newline,
    /// Statement separator colons on a single line.
    Colon,
    Comment { text: String, rem: bool },
    String(String),
    Integer(i64),
    HexInteger(i64),
    OctInteger(i64),
    Float(f64),
    Date(NaiveDateTime),
    Bool(bool),
    Null,
    Empty,
    Nothing,
    Identifier(String),
    /// `[any text]`; holds the text between the brackets.
    ExtendedIdentifier(String),
    Keyword(Keyword),
    /// A keyword that may also serve as an identifier.
    SoftKeyword(Keyword, String),
    Punct(Punct),
}

impl TokenKind {
    pub fn is_line_termination(&self) -> bool {
        matches!(self, TokenKind::Newline | TokenKind::Colon)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Eof => write!(f, "end of file"),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Comment { .. } => write!(f, "comment"),
            TokenKind::String(value) => write!(f, "\"{value}\""),
            TokenKind::Integer(value)
            | TokenKind::HexInteger(value)
            | TokenKind::OctInteger(value) => write!(f, "{value}"),
            TokenKind::Float(value) => write!(f, "{value}"),
            TokenKind::Date(value) => write!(f, "#{value}#"),
            TokenKind::Bool(true) => write!(f, "True"),
            TokenKind::Bool(false) => write!(f, "False"),
            TokenKind::Null => write!(f, "Null"),
            TokenKind::Empty => write!(f, "Empty"),
            TokenKind::Nothing => write!(f, "Nothing"),
            TokenKind::Identifier(name) | TokenKind::SoftKeyword(_, name) => write!(f, "{name}"),
            TokenKind::ExtendedIdentifier(name) => write!(f, "[{name}]"),
            TokenKind::Keyword(keyword) => write!(f, "{}", keyword.as_str()),
            TokenKind::Punct(punct) => write!(f, "{}", punct.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte range. Line terminations and end of file also cover the
    /// whitespace in front of them.
    pub span: Span,
    /// 1-based.
    pub line: usize,
    /// 1-based.
    pub column: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source).tokenize_all()
}

#[derive(Clone)]
pub struct Lexer<'a> {
    source: &'a str,
    index: usize,
    line: usize,
    line_start: usize,
    done: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            index: 0,
            line: 1,
            line_start: 0,
            done: false,
        }
    }

    /// Every token up to and including `Eof`, or the first lexical error.
    pub fn tokenize_all(self) -> Result<Vec<Token>, ParseError> {
        self.collect()
    }

    pub fn next_token(&mut self) -> Result<Token, ParseError> {
        let trivia_start = self.index;
        self.skip_whitespace()?;
        let Some(c) = self.peek() else {
            self.done = true;
            return Ok(self.token_from(TokenKind::Eof, trivia_start, self.line, self.column_of(self.index)));
        };
        if is_line_terminator(c) {
            return self.line_termination(trivia_start);
        }
        if let Some(comment) = self.comment() {
            return Ok(comment);
        }
        let next = self.peek_at(1);
        if c.is_ascii_alphabetic() {
            return self.identifier();
        }
        match c {
            '"' => self.string_literal(),
            '.' if next.is_some_and(|n| n.is_ascii_digit()) => self.number(),
            '0'..='9' => self.number(),
            '&' if next.is_some_and(|n| matches!(n, 'h' | 'H' | 'o' | 'O' | '0'..='7')) => {
                self.prefixed_integer()
            }
            '#' => self.date_literal(),
            '[' => self.extended_identifier(),
            _ => self.punctuation(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.index..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.source[self.index..].chars().nth(offset)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.index += c.len_utf8();
        Some(c)
    }

    fn column_of(&self, index: usize) -> usize {
        self.source[self.line_start..index].chars().count() + 1
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token {
        let column = self.column_of(start);
        self.token_from(kind, start, self.line, column)
    }

    fn token_from(&self, kind: TokenKind, start: usize, line: usize, column: usize) -> Token {
        Token {
            kind,
            span: Span::new(start, self.index),
            line,
            column,
        }
    }

    fn error(&self, code: SyntaxErrorCode, start: usize, end: usize) -> ParseError {
        ParseError::Lex(Diagnostic::at(code, self.source, start, end))
    }

    fn error_here(&self, code: SyntaxErrorCode) -> ParseError {
        let end = self.index + self.peek().map(char::len_utf8).unwrap_or(0);
        self.error(code, self.index, end)
    }

    fn newline(&mut self) {
        if let Some(c) = self.bump() {
            if c == '\r' && self.peek() == Some('\n') {
                self.index += 1;
            }
            self.line += 1;
            self.line_start = self.index;
        }
    }

    /// Skips blanks and line continuations.
    fn skip_whitespace(&mut self) -> Result<(), ParseError> {
        loop {
            while self.peek().is_some_and(is_whitespace) {
                self.index += 1;
            }
            if self.peek() != Some('_') {
                return Ok(());
            }
            let underscore = self.index;
            self.index += 1;
            while self.peek().is_some_and(is_whitespace) {
                self.index += 1;
            }
            match self.peek() {
                Some('\r' | '\n') => self.newline(),
                _ => {
                    self.index = underscore;
                    return Err(self.error(SyntaxErrorCode::InvalidCharacter, underscore, underscore + 1));
                }
            }
        }
    }

    fn line_termination(&mut self, trivia_start: usize) -> Result<Token, ParseError> {
        let line = self.line;
        let column = self.column_of(self.index);
        let mut colon = false;
        while let Some(c) = self.peek() {
            if !is_line_terminator(c) {
                break;
            }
            if c == ':' {
                colon = true;
                self.index += 1;
            } else {
                self.newline();
            }
            self.skip_whitespace()?;
        }
        let kind = if colon && self.line == line {
            TokenKind::Colon
        } else {
            TokenKind::Newline
        };
        Ok(self.token_from(kind, trivia_start, line, column))
    }

    fn comment(&mut self) -> Option<Token> {
        let start = self.index;
        let rem = match self.peek()? {
            '\'' => false,
            // `obj.Rem` is a member name.
            'r' | 'R' if self.source[..self.index].ends_with('.') => return None,
            'r' | 'R' => {
                let word = self.source.get(self.index..self.index + 3)?;
                if !word.eq_ignore_ascii_case("rem") {
                    return None;
                }
                match self.source[self.index + 3..].chars().next() {
                    None => {}
                    Some(c) if is_whitespace(c) || c == '\r' || c == '\n' => {}
                    Some(_) => return None,
                }
                true
            }
            _ => return None,
        };
        self.index += if rem { 3 } else { 1 };
        let body_start = self.index;
        while self.peek().is_some_and(|c| c != '\r' && c != '\n') {
            self.bump();
        }
        let text = self.source[body_start..self.index].to_string();
        Some(self.token(TokenKind::Comment { text, rem }, start))
    }

    fn identifier(&mut self) -> Result<Token, ParseError> {
        let start = self.index;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.index += 1;
        }
        let text = &self.source[start..self.index];
        let lower = text.to_ascii_lowercase();
        let kind = match lower.as_str() {
            "true" => TokenKind::Bool(true),
            "false" => TokenKind::Bool(false),
            "null" => TokenKind::Null,
            "empty" => TokenKind::Empty,
            "nothing" => TokenKind::Nothing,
            _ => {
                if let Some(keyword) = Keyword::reserved(&lower) {
                    TokenKind::Keyword(keyword)
                } else if let Some(keyword) = Keyword::soft(&lower) {
                    TokenKind::SoftKeyword(keyword, text.to_string())
                } else {
                    TokenKind::Identifier(text.to_string())
                }
            }
        };
        Ok(self.token(kind, start))
    }

    fn extended_identifier(&mut self) -> Result<Token, ParseError> {
        let start = self.index;
        self.index += 1;
        while self
            .peek()
            .is_some_and(|c| c != ']' && c != '\r' && c != '\n')
        {
            self.bump();
        }
        if self.peek() != Some(']') {
            return Err(self.error_here(SyntaxErrorCode::ExpectedRBracket));
        }
        let name = self.source[start + 1..self.index].to_string();
        self.index += 1;
        Ok(self.token(TokenKind::ExtendedIdentifier(name), start))
    }

    fn string_literal(&mut self) -> Result<Token, ParseError> {
        let start = self.index;
        self.index += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                Some('"') => {
                    self.index += 1;
                    if self.peek() == Some('"') {
                        self.index += 1;
                        value.push('"');
                    } else {
                        break;
                    }
                }
                Some('\r' | '\n') | None => {
                    return Err(self.error(
                        SyntaxErrorCode::UnterminatedStringConstant,
                        start,
                        self.index,
                    ));
                }
                Some(c) => {
                    value.push(c);
                    self.index += c.len_utf8();
                }
            }
        }
        Ok(self.token(TokenKind::String(value), start))
    }

    fn digits(&mut self, radix: u32) -> &'a str {
        let start = self.index;
        while self.peek().is_some_and(|c| c.is_digit(radix)) {
            self.index += 1;
        }
        &self.source[start..self.index]
    }

    fn reject_trailing_identifier(&self) -> Result<(), ParseError> {
        if self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            return Err(self.error_here(SyntaxErrorCode::ExpectedEndOfStatement));
        }
        Ok(())
    }

    fn number(&mut self) -> Result<Token, ParseError> {
        let start = self.index;
        let integer = self.digits(10);
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.index += 1;
            self.digits(10);
            is_float = true;
        } else if self.peek() == Some('.') && !integer.is_empty() {
            // `1.` is a complete float literal
            self.index += 1;
            is_float = true;
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.index += 1;
            if matches!(self.peek(), Some('+' | '-')) {
                self.index += 1;
            }
            if self.digits(10).is_empty() {
                return Err(self.error_here(SyntaxErrorCode::InvalidNumber));
            }
            is_float = true;
        }
        self.reject_trailing_identifier()?;
        let text = &self.source[start..self.index];
        if !is_float {
            if let Ok(value) = text.parse::<i64>() {
                return Ok(self.token(TokenKind::Integer(value), start));
            }
        }
        let value = text
            .parse::<f64>()
            .map_err(|_| self.error(SyntaxErrorCode::InvalidNumber, start, self.index))?;
        Ok(self.token(TokenKind::Float(value), start))
    }

    /// `&hFF`, `&o17` and the bare octal form `&17`.
    fn prefixed_integer(&mut self) -> Result<Token, ParseError> {
        let start = self.index;
        self.index += 1;
        let radix = match self.peek() {
            Some('h' | 'H') => {
                self.index += 1;
                16
            }
            Some('o' | 'O') => {
                self.index += 1;
                8
            }
            _ => 8,
        };
        let digits = self.digits(radix);
        if radix == 8 && self.peek().is_some_and(|c| c.is_ascii_digit()) {
            return Err(self.error_here(SyntaxErrorCode::SyntaxError));
        }
        self.reject_trailing_identifier()?;
        let value = i64::from_str_radix(digits, radix)
            .map_err(|_| self.error(SyntaxErrorCode::SyntaxError, start, self.index))?;
        let kind = if radix == 16 {
            TokenKind::HexInteger(value)
        } else {
            TokenKind::OctInteger(value)
        };
        Ok(self.token(kind, start))
    }

    fn date_literal(&mut self) -> Result<Token, ParseError> {
        let start = self.index;
        self.index += 1;
        while self
            .peek()
            .is_some_and(|c| c != '#' && c != '\r' && c != '\n')
        {
            self.bump();
        }
        let text = &self.source[start + 1..self.index];
        if self.peek() != Some('#') || text.trim().is_empty() {
            return Err(self.error(SyntaxErrorCode::SyntaxError, start, self.index));
        }
        self.index += 1;
        let value = parse_date(text)
            .ok_or_else(|| self.error(SyntaxErrorCode::SyntaxError, start, self.index))?;
        Ok(self.token(TokenKind::Date(value), start))
    }

    fn punctuation(&mut self) -> Result<Token, ParseError> {
        let start = self.index;
        let Some(c) = self.peek() else {
            return Err(self.error_here(SyntaxErrorCode::SyntaxError));
        };
        let next = self.peek_at(1);
        let (punct, width) = match (c, next) {
            ('(', _) => (Punct::LParen, 1),
            (')', _) => (Punct::RParen, 1),
            ('.', _) => (Punct::Dot, 1),
            (',', _) => (Punct::Comma, 1),
            ('+', _) => (Punct::Plus, 1),
            ('-', _) => (Punct::Minus, 1),
            ('/', _) => (Punct::Slash, 1),
            ('\\', _) => (Punct::Backslash, 1),
            ('*', _) => (Punct::Star, 1),
            ('&', _) => (Punct::Amp, 1),
            ('^', _) => (Punct::Caret, 1),
            ('=', Some('<')) | ('<', Some('=')) => (Punct::Le, 2),
            ('=', Some('>')) | ('>', Some('=')) => (Punct::Ge, 2),
            ('<', Some('>')) | ('>', Some('<')) => (Punct::Ne, 2),
            ('=', _) => (Punct::Eq, 1),
            ('<', _) => (Punct::Lt, 1),
            ('>', _) => (Punct::Gt, 1),
            _ => return Err(self.error_here(SyntaxErrorCode::InvalidCharacter)),
        };
        self.index += width;
        Ok(self.token(TokenKind::Punct(punct), start))
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.next_token();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

fn is_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\u{0B}' | '\u{0C}')
}

fn is_line_terminator(c: char) -> bool {
    matches!(c, '\n' | '\r' | ':')
}

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%B %d, %Y", "%d %B %Y", "%b %d, %Y"];

const DATE_TIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %I:%M:%S %p",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

const TIME_FORMATS: &[&str] = &["%I:%M:%S %p", "%I:%M %p", "%H:%M:%S", "%H:%M"];

/// Parses the body of a `#...#` literal. Times without a date fall on the
/// engine's zero date, 1899-12-30.
pub fn parse_date(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for format in DATE_TIME_FORMATS {
        if let Ok(value) = NaiveDateTime::parse_from_str(text, format) {
            return Some(value);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    for format in TIME_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(text, format) {
            return NaiveDate::from_ymd_opt(1899, 12, 30).map(|date| date.and_time(time));
        }
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|value| value.naive_local())
}
