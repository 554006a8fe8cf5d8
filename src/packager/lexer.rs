//! Tokenizer for the capability source subset (TypeScript and JavaScript).
//!
//! The token stream keeps just enough layout information (`newline_before`,
//! `space_before`) for the printer to re-emit semantically identical code
//! without the original whitespace and comments.

use super::Diagnostic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Number,
    Str,
    Regex,
    Punct,
    /// A template literal without substitutions: `` `abc` ``
    Template,
    /// `` `abc${ ``
    TemplateHead,
    /// `` }abc${ ``
    TemplateMiddle,
    /// `` }abc` ``
    TemplateTail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub column: u32,
    /// A line terminator appeared between the previous token and this one.
    pub newline_before: bool,
    /// Any whitespace or comment appeared between the previous token and this one.
    pub space_before: bool,
}

impl Token {
    /// Builds a token that does not come from a source file.
    pub fn synthetic(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            line: 0,
            column: 0,
            newline_before: false,
            space_before: false,
        }
    }

    pub fn is(&self, text: &str) -> bool {
        matches!(self.kind, TokenKind::Punct | TokenKind::Ident) && self.text == text
    }

    pub fn is_punct(&self, text: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == text
    }

    pub fn is_ident(&self) -> bool {
        self.kind == TokenKind::Ident
    }

    /// True for tokens after which a `/` starts a division rather than a regex,
    /// and after which a postfix TypeScript construct (`as`, `!`) may appear.
    pub fn ends_expression(&self) -> bool {
        match self.kind {
            TokenKind::Ident => !is_operator_keyword(&self.text),
            TokenKind::Number | TokenKind::Str | TokenKind::Regex => true,
            TokenKind::Template | TokenKind::TemplateTail => true,
            TokenKind::TemplateHead | TokenKind::TemplateMiddle => false,
            TokenKind::Punct => matches!(self.text.as_str(), ")" | "]" | "}"),
        }
    }
}

/// Keywords that are followed by an expression operand.
pub fn is_operator_keyword(word: &str) -> bool {
    matches!(
        word,
        "return"
            | "typeof"
            | "instanceof"
            | "in"
            | "of"
            | "new"
            | "delete"
            | "void"
            | "throw"
            | "case"
            | "do"
            | "else"
            | "yield"
            | "await"
            | "export"
            | "import"
            | "extends"
            | "let"
            | "const"
            | "var"
    )
}

/// Multi-character punctuators, longest first. `>` is always emitted on its
/// own so that nested generic argument lists (`Array<Array<T>>`) can be
/// matched; adjacent `>` tokens print back as `>>`, `>=`, `>>>=`.
const PUNCTUATORS: &[&str] = &[
    "...", "===", "!==", "**=", "<<=", "&&=", "||=", "??=", "=>", "==", "!=", "<=", "+=", "-=",
    "*=", "/=", "%=", "&=", "|=", "^=", "++", "--", "<<", "&&", "||", "??", "?.", "**",
];

const SINGLE_PUNCTUATORS: &str = "{}()[];,<>+-*/%&|^!~?:=.@#";

pub fn tokenize(file: &str, source: &str) -> Result<Vec<Token>, Diagnostic> {
    Lexer::new(file, source).run()
}

struct Lexer<'a> {
    file: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
    brace_depth: usize,
    /// Brace depths at which an open template substitution resumes.
    templates: Vec<usize>,
    newline_before: bool,
    space_before: bool,
}

impl<'a> Lexer<'a> {
    fn new(file: &'a str, source: &str) -> Self {
        Self {
            file,
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            brace_depth: 0,
            templates: Vec::new(),
            newline_before: false,
            space_before: false,
        }
    }

    fn error(&self, line: u32, column: u32, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(self.file, line, column, message)
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, start: usize, line: u32, column: u32) {
        let text: String = self.chars[start..self.pos].iter().collect();
        self.tokens.push(Token {
            kind,
            text,
            line,
            column,
            newline_before: self.newline_before,
            space_before: self.space_before,
        });
        self.newline_before = false;
        self.space_before = false;
    }

    fn run(mut self) -> Result<Vec<Token>, Diagnostic> {
        while let Some(c) = self.peek(0) {
            let (line, column, start) = (self.line, self.column, self.pos);

            if c == '\n' || c == '\r' || c == '\u{2028}' || c == '\u{2029}' {
                self.bump();
                self.newline_before = true;
                self.space_before = true;
                continue;
            }
            if c.is_whitespace() || c == '\u{feff}' {
                self.bump();
                self.space_before = true;
                continue;
            }
            if c == '/' && self.peek(1) == Some('/') {
                while let Some(c) = self.peek(0) {
                    if c == '\n' || c == '\r' {
                        break;
                    }
                    self.bump();
                }
                self.space_before = true;
                continue;
            }
            if c == '/' && self.peek(1) == Some('*') {
                self.bump();
                self.bump();
                loop {
                    match self.bump() {
                        Some('*') if self.peek(0) == Some('/') => {
                            self.bump();
                            break;
                        }
                        Some('\n') => self.newline_before = true,
                        Some(_) => {}
                        None => return Err(self.error(line, column, "unterminated block comment")),
                    }
                }
                self.space_before = true;
                continue;
            }

            if is_ident_start(c) || c == '\\' {
                self.bump();
                while let Some(c) = self.peek(0) {
                    if is_ident_part(c) || c == '\\' {
                        self.bump();
                    } else {
                        break;
                    }
                }
                self.push(TokenKind::Ident, start, line, column);
                continue;
            }

            if c.is_ascii_digit() || (c == '.' && self.peek(1).is_some_and(|d| d.is_ascii_digit())) {
                self.number();
                self.push(TokenKind::Number, start, line, column);
                continue;
            }

            if c == '"' || c == '\'' {
                self.string(c, line, column)?;
                self.push(TokenKind::Str, start, line, column);
                continue;
            }

            if c == '`' {
                self.bump();
                let kind = self.template_chunk(line, column, TokenKind::Template, TokenKind::TemplateHead)?;
                self.push(kind, start, line, column);
                continue;
            }

            if c == '}' && self.templates.last() == Some(&self.brace_depth) {
                self.templates.pop();
                self.bump();
                let kind = self.template_chunk(
                    line,
                    column,
                    TokenKind::TemplateTail,
                    TokenKind::TemplateMiddle,
                )?;
                self.push(kind, start, line, column);
                continue;
            }

            if c == '/' && self.regex_allowed() {
                self.regex(line, column)?;
                self.push(TokenKind::Regex, start, line, column);
                continue;
            }

            self.punctuator(line, column)?;
            self.push(TokenKind::Punct, start, line, column);
        }

        if !self.templates.is_empty() {
            return Err(self.error(self.line, self.column, "unterminated template literal"));
        }
        Ok(self.tokens)
    }

    fn number(&mut self) {
        let radix_prefix = self.peek(0) == Some('0')
            && matches!(self.peek(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B'));
        if radix_prefix {
            self.bump();
            self.bump();
            while self.peek(0).is_some_and(|c| c.is_ascii_hexdigit() || c == '_') {
                self.bump();
            }
        } else {
            while self.peek(0).is_some_and(|c| c.is_ascii_digit() || c == '_') {
                self.bump();
            }
            if self.peek(0) == Some('.') {
                self.bump();
                while self.peek(0).is_some_and(|c| c.is_ascii_digit() || c == '_') {
                    self.bump();
                }
            }
            if matches!(self.peek(0), Some('e' | 'E')) {
                let signed = matches!(self.peek(1), Some('+' | '-'));
                let digit_at = if signed { 2 } else { 1 };
                if self.peek(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                    for _ in 0..digit_at {
                        self.bump();
                    }
                    while self.peek(0).is_some_and(|c| c.is_ascii_digit() || c == '_') {
                        self.bump();
                    }
                }
            }
        }
        if self.peek(0) == Some('n') {
            self.bump();
        }
    }

    fn string(&mut self, quote: char, line: u32, column: u32) -> Result<(), Diagnostic> {
        self.bump();
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump();
                }
                Some(c) if c == quote => return Ok(()),
                Some('\n') | None => return Err(self.error(line, column, "unterminated string literal")),
                Some(_) => {}
            }
        }
    }

    /// Scans template text after a backtick or a closing substitution brace.
    fn template_chunk(
        &mut self,
        line: u32,
        column: u32,
        closed: TokenKind,
        open: TokenKind,
    ) -> Result<TokenKind, Diagnostic> {
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump();
                }
                Some('`') => return Ok(closed),
                Some('$') if self.peek(0) == Some('{') => {
                    self.bump();
                    self.templates.push(self.brace_depth);
                    return Ok(open);
                }
                Some(_) => {}
                None => return Err(self.error(line, column, "unterminated template literal")),
            }
        }
    }

    fn regex_allowed(&self) -> bool {
        match self.tokens.last() {
            None => true,
            Some(prev) => !prev.ends_expression(),
        }
    }

    fn regex(&mut self, line: u32, column: u32) -> Result<(), Diagnostic> {
        self.bump();
        let mut in_class = false;
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump();
                }
                Some('[') => in_class = true,
                Some(']') => in_class = false,
                Some('/') if !in_class => break,
                Some('\n') | None => {
                    return Err(self.error(line, column, "unterminated regular expression"))
                }
                Some(_) => {}
            }
        }
        while self.peek(0).is_some_and(is_ident_part) {
            self.bump();
        }
        Ok(())
    }

    fn punctuator(&mut self, line: u32, column: u32) -> Result<(), Diagnostic> {
        // `?.5` is a conditional followed by a number, not optional chaining
        let optional_chain_digit =
            self.peek(0) == Some('?') && self.peek(1) == Some('.') && self.peek(2).is_some_and(|c| c.is_ascii_digit());

        if !optional_chain_digit {
            for candidate in PUNCTUATORS {
                let matches = candidate
                    .chars()
                    .enumerate()
                    .all(|(i, expected)| self.peek(i) == Some(expected));
                if matches {
                    for _ in 0..candidate.len() {
                        self.bump();
                    }
                    return Ok(());
                }
            }
        }

        match self.peek(0) {
            Some(c) if SINGLE_PUNCTUATORS.contains(c) => {
                self.bump();
                match c {
                    '{' => self.brace_depth += 1,
                    '}' => self.brace_depth = self.brace_depth.saturating_sub(1),
                    _ => {}
                }
                Ok(())
            }
            Some(c) => Err(self.error(line, column, format!("unexpected character '{c}'"))),
            None => Err(self.error(line, column, "unexpected end of input")),
        }
    }
}

pub fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

pub fn is_ident_part(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric() || c == '\u{200c}' || c == '\u{200d}'
}

/// Precomputes, for every opening token, the index of its matching closer.
///
/// Template heads and middles count as openers; middles and tails as closers.
pub fn match_brackets(file: &str, tokens: &[Token]) -> Result<Vec<Option<usize>>, Diagnostic> {
    let mut close = vec![None; tokens.len()];
    let mut stack: Vec<usize> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        let opener = match token.kind {
            TokenKind::Punct => matches!(token.text.as_str(), "(" | "[" | "{"),
            TokenKind::TemplateHead => true,
            _ => false,
        };
        let closer = match token.kind {
            TokenKind::Punct => matches!(token.text.as_str(), ")" | "]" | "}"),
            TokenKind::TemplateMiddle | TokenKind::TemplateTail => true,
            _ => false,
        };

        if closer {
            let Some(open) = stack.pop() else {
                return Err(Diagnostic::new(
                    file,
                    token.line,
                    token.column,
                    format!("unexpected '{}'", token.text),
                ));
            };
            let expected = match tokens[open].text.as_str() {
                "(" => ")",
                "[" => "]",
                "{" => "}",
                _ => "}",
            };
            let found_ok = match token.kind {
                TokenKind::Punct => token.text == expected && tokens[open].kind == TokenKind::Punct,
                _ => matches!(tokens[open].kind, TokenKind::TemplateHead | TokenKind::TemplateMiddle),
            };
            if !found_ok {
                return Err(Diagnostic::new(
                    file,
                    token.line,
                    token.column,
                    format!(
                        "mismatched '{}' (opened at {}:{})",
                        token.text, tokens[open].line, tokens[open].column
                    ),
                ));
            }
            close[open] = Some(i);
        }
        if opener || token.kind == TokenKind::TemplateMiddle {
            stack.push(i);
        }
    }

    if let Some(open) = stack.pop() {
        let token = &tokens[open];
        return Err(Diagnostic::new(
            file,
            token.line,
            token.column,
            format!("unclosed '{}'", token.text),
        ));
    }
    Ok(close)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(source: &str) -> Vec<String> {
        tokenize("test.ts", source)
            .unwrap()
            .into_iter()
            .map(|t| t.text)
            .collect()
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize("test.ts", source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    // ── Basic tokens ────────────────────────────────────

    #[test]
    fn test_tokenize_declaration() {
        assert_eq!(texts("const a = 1;"), vec!["const", "a", "=", "1", ";"]);
    }

    #[test]
    fn test_comments_are_dropped() {
        let tokens = tokenize("t.ts", "a // line\n/* block\n */ b").unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens[1].newline_before);
        assert!(tokens[1].space_before);
    }

    #[test]
    fn test_greater_than_is_split() {
        assert_eq!(texts("a >>= b"), vec!["a", ">", ">", "=", "b"]);
        assert_eq!(texts("x => y"), vec!["x", "=>", "y"]);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(texts("0xff 1_000 1.5e-3 .5 10n"), vec!["0xff", "1_000", "1.5e-3", ".5", "10n"]);
    }

    #[test]
    fn test_optional_chain_vs_conditional() {
        assert_eq!(texts("a?.b"), vec!["a", "?.", "b"]);
        assert_eq!(texts("a?.5:1"), vec!["a", "?", ".5", ":", "1"]);
    }

    // ── Regex vs division ───────────────────────────────

    #[test]
    fn test_regex_after_operator() {
        let k = kinds("x = /ab+c/gi.test(s)");
        assert_eq!(k[2], TokenKind::Regex);
    }

    #[test]
    fn test_division_after_identifier() {
        assert_eq!(texts("a / b / c"), vec!["a", "/", "b", "/", "c"]);
    }

    #[test]
    fn test_regex_with_slash_in_class() {
        let tokens = tokenize("t.js", "return /[/]/;").unwrap();
        assert_eq!(tokens[1].kind, TokenKind::Regex);
        assert_eq!(tokens[1].text, "/[/]/");
    }

    // ── Templates ───────────────────────────────────────

    #[test]
    fn test_template_with_substitutions() {
        let k = kinds("`a${b}c${ {d:1}.d }e`");
        assert_eq!(k[0], TokenKind::TemplateHead);
        assert_eq!(k[2], TokenKind::TemplateMiddle);
        assert_eq!(*k.last().unwrap(), TokenKind::TemplateTail);
    }

    #[test]
    fn test_template_without_substitutions() {
        assert_eq!(kinds("`plain`"), vec![TokenKind::Template]);
    }

    // ── Errors ──────────────────────────────────────────

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("bad.ts", "const a = 'oops\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("unterminated string"));
    }

    #[test]
    fn test_unterminated_template() {
        assert!(tokenize("bad.ts", "`abc${x").is_err());
    }

    #[test]
    fn test_match_brackets() {
        let tokens = tokenize("t.ts", "f(a[1], {b: `${c}`})").unwrap();
        let close = match_brackets("t.ts", &tokens).unwrap();
        assert_eq!(close[1], Some(tokens.len() - 1));
    }

    #[test]
    fn test_mismatched_brackets() {
        let tokens = tokenize("t.ts", "f(a]").unwrap();
        let err = match_brackets("t.ts", &tokens).unwrap_err();
        assert!(err.message.contains("mismatched"));
    }

    #[test]
    fn test_unclosed_bracket() {
        let tokens = tokenize("t.ts", "function f() {").unwrap();
        assert!(match_brackets("t.ts", &tokens).is_err());
    }
}
