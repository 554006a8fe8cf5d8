//! Whitespace-only minification.
//!
//! Tokens are printed back to back. A single space is inserted only where two
//! tokens would otherwise fuse into a different token, and a single newline is
//! kept where the source had a line break that automatic semicolon insertion
//! may depend on.

use super::lexer::{is_ident_part, Token, TokenKind};

pub fn print(tokens: &[Token]) -> String {
    let mut out = String::with_capacity(tokens.iter().map(|t| t.text.len() + 1).sum());
    let mut prev: Option<&Token> = None;

    for token in tokens {
        if let Some(p) = prev {
            if token.newline_before && !newline_droppable(p, token) {
                out.push('\n');
            } else if needs_space(p, token) {
                out.push(' ');
            }
        }
        out.push_str(&token.text);
        prev = Some(token);
    }
    out
}

/// A line break between these tokens never changes how the program parses.
fn newline_droppable(prev: &Token, next: &Token) -> bool {
    if prev.kind == TokenKind::Punct {
        let after_safe = matches!(
            prev.text.as_str(),
            ";" | "{" | "," | "(" | "[" | "=" | "==" | "===" | "!=" | "!==" | "+=" | "-=" | "*="
                | "/=" | "%=" | "&&" | "||" | "??" | "?" | ":" | "=>" | "." | "?." | "+" | "-"
                | "*" | "/" | "%" | "<" | ">" | "<=" | "&" | "|" | "^" | "!" | "~" | "..."
        );
        if after_safe {
            return true;
        }
    }
    if matches!(prev.kind, TokenKind::TemplateHead | TokenKind::TemplateMiddle) {
        return true;
    }
    next.kind == TokenKind::Punct && matches!(next.text.as_str(), ")" | "]" | "," | ";" | "}")
}

fn needs_space(prev: &Token, next: &Token) -> bool {
    let last = prev.text.chars().last();
    let first = next.text.chars().next();
    let (Some(last), Some(first)) = (last, first) else {
        return false;
    };

    if is_ident_part(last) && (is_ident_part(first) || first == '\\') {
        return true;
    }
    // `1 .toString()` must not become a decimal point
    if prev.kind == TokenKind::Number
        && next.kind == TokenKind::Punct
        && next.text.starts_with('.')
        && !prev.text.contains(['.', 'e', 'E', 'x', 'X', 'n'])
    {
        return true;
    }
    if prev.kind == TokenKind::Regex && is_ident_part(first) {
        return true;
    }
    if prev.kind == TokenKind::Punct && next.kind == TokenKind::Punct {
        return match (last, first) {
            ('+', '+') | ('-', '-') => true,
            ('/', '/') | ('/', '*') => true,
            ('<', '!') => true,
            _ => false,
        };
    }
    // `a / /re/` must not turn into a line comment
    last == '/' && (first == '/' || first == '*')
}
