use std::fmt;

use thiserror::Error;

/// Error numbers of the legacy scripting engine. Tooling keys off these, so
/// the discriminants are part of the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SyntaxErrorCode {
    SyntaxError = 1002,
    ExpectedColon = 1003,
    ExpectedLParen = 1005,
    ExpectedRParen = 1006,
    ExpectedRBracket = 1007,
    ExpectedIdentifier = 1010,
    ExpectedEqual = 1011,
    ExpectedIf = 1012,
    ExpectedTo = 1013,
    ExpectedEnd = 1014,
    ExpectedFunction = 1015,
    ExpectedSub = 1016,
    ExpectedThen = 1017,
    ExpectedWend = 1018,
    ExpectedLoop = 1019,
    ExpectedNext = 1020,
    ExpectedCase = 1021,
    ExpectedSelect = 1022,
    ExpectedExpression = 1023,
    ExpectedStatement = 1024,
    ExpectedEndOfStatement = 1025,
    ExpectedInteger = 1026,
    ExpectedWhileOrUntil = 1027,
    ExpectedWhileUntilOrEndOfStatement = 1028,
    ExpectedWith = 1029,
    IdentifierTooLong = 1030,
    InvalidNumber = 1031,
    InvalidCharacter = 1032,
    UnterminatedStringConstant = 1033,
    UnterminatedComment = 1034,
    InvalidUseOfMeKeyword = 1037,
    LoopWithoutDo = 1038,
    InvalidExitStatement = 1039,
    InvalidForLoopControlVariable = 1040,
    NameRedefined = 1041,
    MustBeFirstStatementOnTheLine = 1042,
    CannotAssignToNonByValVariable = 1043,
    CannotUseParenthesesWhenCallingSub = 1044,
    ExpectedLiteral = 1045,
    ExpectedIn = 1046,
    ExpectedClass = 1047,
    MustBeDefinedInsideClass = 1048,
    ExpectedLetGetSet = 1049,
    ExpectedProperty = 1050,
    InconsistentNumberOfArguments = 1051,
    CannotHaveMultipleDefault = 1052,
    ClassInitializeOrTerminateDoNotHaveArguments = 1053,
    PropertySetOrLetMustHaveArguments = 1054,
    UnexpectedNext = 1055,
    DefaultCanBeSpecifiedOnlyOnPropertyFunctionOrSub = 1056,
    DefaultMustAlsoSpecifyPublic = 1057,
    DefaultCanOnlyBeOnPropertyGet = 1058,
}

impl SyntaxErrorCode {
    pub fn number(self) -> u16 {
        self as u16
    }

    pub fn description(self) -> &'static str {
        use SyntaxErrorCode::*;
        match self {
            SyntaxError => "Syntax error",
            ExpectedColon => "Expected ':'",
            ExpectedLParen => "Expected '('",
            ExpectedRParen => "Expected ')'",
            ExpectedRBracket => "Expected ']'",
            ExpectedIdentifier => "Expected identifier",
            ExpectedEqual => "Expected '='",
            ExpectedIf => "Expected 'If'",
            ExpectedTo => "Expected 'To'",
            ExpectedEnd => "Expected 'End'",
            ExpectedFunction => "Expected 'Function'",
            ExpectedSub => "Expected 'Sub'",
            ExpectedThen => "Expected 'Then'",
            ExpectedWend => "Expected 'Wend'",
            ExpectedLoop => "Expected 'Loop'",
            ExpectedNext => "Expected 'Next'",
            ExpectedCase => "Expected 'Case'",
            ExpectedSelect => "Expected 'Select'",
            ExpectedExpression => "Expected expression",
            ExpectedStatement => "Expected statement",
            ExpectedEndOfStatement => "Expected end of statement",
            ExpectedInteger => "Expected integer constant",
            ExpectedWhileOrUntil => "Expected 'While' or 'Until'",
            ExpectedWhileUntilOrEndOfStatement => "Expected 'While', 'Until' or end of statement",
            ExpectedWith => "Expected 'With'",
            IdentifierTooLong => "Identifier too long",
            InvalidNumber => "Invalid number",
            InvalidCharacter => "Invalid character",
            UnterminatedStringConstant => "Unterminated string constant",
            UnterminatedComment => "Unterminated comment",
            InvalidUseOfMeKeyword => "Invalid use of 'Me' keyword",
            LoopWithoutDo => "'loop' without 'do'",
            InvalidExitStatement => "Invalid 'exit' statement",
            InvalidForLoopControlVariable => "Invalid 'for' loop control variable",
            NameRedefined => "Name redefined",
            MustBeFirstStatementOnTheLine => "Must be first statement on the line",
            CannotAssignToNonByValVariable => "Cannot assign to non-ByVal argument",
            CannotUseParenthesesWhenCallingSub => "Cannot use parentheses when calling a Sub",
            ExpectedLiteral => "Expected literal constant",
            ExpectedIn => "Expected 'In'",
            ExpectedClass => "Expected 'Class'",
            MustBeDefinedInsideClass => "Must be defined inside a Class",
            ExpectedLetGetSet => "Expected Let or Set or Get in property declaration",
            ExpectedProperty => "Expected 'Property'",
            InconsistentNumberOfArguments => {
                "Number of arguments must be consistent across properties specification"
            }
            CannotHaveMultipleDefault => "Cannot have multiple default property/method in a Class",
            ClassInitializeOrTerminateDoNotHaveArguments => {
                "Class initialize or terminate do not have arguments"
            }
            PropertySetOrLetMustHaveArguments => {
                "Property set or let must have at least one argument"
            }
            UnexpectedNext => "Unexpected 'Next'",
            DefaultCanBeSpecifiedOnlyOnPropertyFunctionOrSub => {
                "'Default' specification can only be on Property Get, Function or Sub"
            }
            DefaultMustAlsoSpecifyPublic => "'Default' specification must also specify 'Public'",
            DefaultCanOnlyBeOnPropertyGet => "'Default' specification can only be on Property Get",
        }
    }
}

impl fmt::Display for SyntaxErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// The user-visible shape of every lexer and parser failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: SyntaxErrorCode,
    /// 1-based.
    pub line: usize,
    /// 0-based.
    pub column: usize,
    pub token: String,
    pub line_text: String,
}

impl Diagnostic {
    /// Builds a diagnostic for the byte range `start..end` of `source`.
    pub fn at(code: SyntaxErrorCode, source: &str, start: usize, end: usize) -> Self {
        let start = floor_char_boundary(source, start.min(source.len()));
        let end = floor_char_boundary(source, end.clamp(start, source.len()));
        let line_start = source[..start]
            .rfind(['\n', '\r'])
            .map(|index| index + 1)
            .unwrap_or(0);
        let line_end = source[start..]
            .find(['\n', '\r'])
            .map(|index| start + index)
            .unwrap_or(source.len());
        let line = 1 + source[..line_start]
            .char_indices()
            .filter(|(index, ch)| {
                *ch == '\n' || (*ch == '\r' && source.as_bytes().get(index + 1) != Some(&b'\n'))
            })
            .count();
        Self {
            code,
            line,
            column: source[line_start..start].chars().count(),
            token: source[start..end].to_string(),
            line_text: source[line_start..line_end].to_string(),
        }
    }
}

fn floor_char_boundary(source: &str, mut index: usize) -> usize {
    while index > 0 && !source.is_char_boundary(index) {
        index -= 1;
    }
    index
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VBScript syntax error {} at line {}, column {}",
            self.code, self.line, self.column
        )?;
        if !self.token.is_empty() {
            write!(f, ": '{}'", self.token)?;
        }
        if !self.line_text.is_empty() {
            write!(f, "\n{}", self.line_text)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{0}")]
    Lex(Diagnostic),
    #[error("{0}")]
    Syntax(Diagnostic),
}

impl ParseError {
    pub fn diagnostic(&self) -> &Diagnostic {
        match self {
            ParseError::Lex(diagnostic) | ParseError::Syntax(diagnostic) => diagnostic,
        }
    }

    pub fn code(&self) -> SyntaxErrorCode {
        self.diagnostic().code
    }

    pub fn is_lex(&self) -> bool {
        matches!(self, ParseError::Lex(_))
    }
}
