//! TypeScript → JavaScript lowering on the token stream.
//!
//! Removes type-level syntax (annotations, interfaces, aliases, generics,
//! `as` casts, non-null assertions, access modifiers, overloads) and lowers
//! `enum` declarations. Import and export statements are passed through
//! verbatim, minus `type`-only parts, for the linker to rewrite.

use std::collections::HashSet;

use super::lexer::{is_operator_keyword, match_brackets, tokenize, Token, TokenKind};
use super::Diagnostic;

const CLASS_MODIFIERS: &[&str] = &[
    "public",
    "private",
    "protected",
    "readonly",
    "abstract",
    "override",
    "declare",
];

const PARAMETER_PROPERTY_MODIFIERS: &[&str] =
    &["public", "private", "protected", "readonly", "override"];

/// Strips one TypeScript module. Returns every diagnostic found, not just the first.
pub fn strip_types(file: &str, tokens: Vec<Token>) -> Result<Vec<Token>, Vec<Diagnostic>> {
    let close = match_brackets(file, &tokens).map_err(|d| vec![d])?;
    let mut stripper = Stripper {
        file,
        toks: &tokens,
        close,
        out: Vec::with_capacity(tokens.len()),
        stack: Vec::new(),
        type_colons: HashSet::new(),
        drops: HashSet::new(),
        decl_depth: None,
        member_body_end: None,
        carry_newline: false,
        diagnostics: Vec::new(),
    };
    stripper.run();
    if stripper.diagnostics.is_empty() {
        Ok(stripper.out)
    } else {
        Err(stripper.diagnostics)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Block,
    Object,
    ClassBody,
    Params,
    Paren,
    Bracket,
    Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Callable {
    /// Not a parameter list, or a parameter list without declaration semantics.
    None,
    /// `function` declaration or expression; `out_mark` allows dropping overloads.
    Function { out_mark: usize },
    /// Class method; `out_mark` allows dropping overloads and abstract members.
    Method { out_mark: usize },
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    role: Role,
    callable: Callable,
    /// Only meaningful for `ClassBody`: the next token starts a member.
    member_start: bool,
    /// Only meaningful for `Params`: inside a default value expression.
    in_default: bool,
}

struct Stripper<'a> {
    file: &'a str,
    toks: &'a [Token],
    close: Vec<Option<usize>>,
    out: Vec<Token>,
    stack: Vec<Frame>,
    /// `:` tokens that introduce a type annotation.
    type_colons: HashSet<usize>,
    /// `?` / `!` markers to remove.
    drops: HashSet<usize>,
    /// Stack depth of the active `let`/`const`/`var` declaration.
    decl_depth: Option<usize>,
    /// Output length right after the closing brace of a method body.
    member_body_end: Option<usize>,
    carry_newline: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Stripper<'a> {
    // ── Token helpers ───────────────────────────────────

    fn tok(&self, i: usize) -> Option<&'a Token> {
        self.toks.get(i)
    }

    fn is(&self, i: usize, text: &str) -> bool {
        self.tok(i).is_some_and(|t| t.is(text))
    }

    fn is_ident_at(&self, i: usize) -> bool {
        self.tok(i).is_some_and(|t| t.is_ident())
    }

    fn is_kind(&self, i: usize, kind: TokenKind) -> bool {
        self.tok(i).is_some_and(|t| t.kind == kind)
    }

    fn close_of(&self, i: usize) -> usize {
        self.close.get(i).copied().flatten().unwrap_or(self.toks.len())
    }

    fn last_out(&self) -> Option<&Token> {
        self.out.last()
    }

    fn last_out_is(&self, text: &str) -> bool {
        self.last_out().is_some_and(|t| t.is(text))
    }

    fn top(&self) -> Option<Role> {
        self.stack.last().map(|f| f.role)
    }

    fn error(&mut self, i: usize, message: impl Into<String>) {
        let (line, column) = self.tok(i).map(|t| (t.line, t.column)).unwrap_or((0, 0));
        self.diagnostics.push(Diagnostic::new(self.file, line, column, message));
    }

    fn emit(&mut self, i: usize) {
        let mut token = self.toks[i].clone();
        if self.carry_newline {
            token.newline_before = true;
            self.carry_newline = false;
        }
        self.out.push(token);
    }

    /// Drops `from..to` from the output, remembering any line break it held.
    fn skip(&mut self, from: usize, to: usize) -> usize {
        let to = to.min(self.toks.len());
        if self.toks[from.min(to)..to].iter().any(|t| t.newline_before)
            || self.tok(to).is_some_and(|t| t.newline_before)
        {
            self.carry_newline = true;
        }
        to
    }

    fn emit_synthetic(&mut self, source: &str, newline_before: bool) {
        match tokenize(self.file, source) {
            Ok(tokens) => {
                let mut first = true;
                for mut token in tokens {
                    token.newline_before = first && (self.carry_newline || newline_before);
                    first = false;
                    self.out.push(token);
                }
                self.carry_newline = false;
            }
            Err(d) => self.diagnostics.push(d),
        }
    }

    fn at_statement_start(&self, i: usize) -> bool {
        if !matches!(self.top(), None | Some(Role::Block)) {
            return false;
        }
        match self.last_out() {
            None => true,
            Some(prev) => {
                prev.is_punct(";")
                    || prev.is_punct("{")
                    || prev.is_punct("}")
                    || (self.toks[i].newline_before && prev.ends_expression())
            }
        }
    }

    // ── Main loop ───────────────────────────────────────

    fn run(&mut self) {
        let mut i = 0;
        while i < self.toks.len() {
            i = self.step(i);
        }
    }

    fn step(&mut self, i: usize) -> usize {
        if self.type_colons.contains(&i) {
            let end = self.skip_type(i + 1);
            return self.skip(i, end);
        }
        if self.drops.contains(&i) {
            return self.skip(i, i + 1);
        }

        // A field initializer without a semicolon ends at the line break
        let after_unterminated_field = self.toks[i].newline_before
            && (self.toks[i].is_ident() || self.toks[i].is_punct("#"))
            && self.last_out().is_some_and(|t| t.ends_expression());
        let in_class_member_start = self
            .stack
            .last()
            .is_some_and(|f| f.role == Role::ClassBody && (f.member_start || after_unterminated_field));
        if in_class_member_start && !self.is(i, "}") && !self.is(i, ";") {
            if let Some(frame) = self.stack.last_mut() {
                frame.member_start = false;
            }
            let start = self.out.len();
            let next = self.class_member(i);
            if self.member_body_end == Some(start) {
                // A member after a method body needs no separator
                if let Some(token) = self.out.get_mut(start) {
                    token.newline_before = false;
                }
                self.carry_newline = false;
            }
            return next;
        }

        let toks = self.toks;
        let token = &toks[i];

        if self.at_statement_start(i) {
            if let Some(next) = self.statement(i) {
                return next;
            }
        }

        match (token.kind, token.text.as_str()) {
            (TokenKind::Punct, "@") => {
                self.error(i, "decorators are not supported");
                i + 1
            }
            (TokenKind::Ident, "as" | "satisfies") if self.is_type_cast(i) => {
                let end = self.skip_type(i + 1);
                self.skip(i, end)
            }
            (TokenKind::Punct, "!") if self.is_non_null_assertion(i) => self.skip(i, i + 1),
            (TokenKind::Punct, "<") => self.angle(i),
            (TokenKind::Punct, "(") => self.open_paren(i),
            (TokenKind::Punct, "{") => {
                let role = self.brace_role();
                self.emit(i);
                self.push(role, Callable::None);
                i + 1
            }
            (TokenKind::Punct, "[") => {
                self.emit(i);
                self.push(Role::Bracket, Callable::None);
                i + 1
            }
            (TokenKind::TemplateHead, _) => {
                self.emit(i);
                self.push(Role::Template, Callable::None);
                i + 1
            }
            (TokenKind::TemplateMiddle, _) => {
                self.emit(i);
                i + 1
            }
            (TokenKind::Punct, ")" | "]" | "}") | (TokenKind::TemplateTail, _) => self.close_frame(i),
            (TokenKind::Punct, ";") => {
                if self.decl_depth == Some(self.stack.len()) {
                    self.decl_depth = None;
                }
                self.emit(i);
                if let Some(frame) = self.stack.last_mut() {
                    if frame.role == Role::ClassBody {
                        frame.member_start = true;
                    }
                }
                i + 1
            }
            (TokenKind::Punct, ",") => {
                self.emit(i);
                if self.decl_depth == Some(self.stack.len()) {
                    self.declarator(i + 1);
                }
                if let Some(frame) = self.stack.last_mut() {
                    frame.in_default = false;
                }
                i + 1
            }
            (TokenKind::Punct, "=") if self.top() == Some(Role::Params) => {
                if let Some(frame) = self.stack.last_mut() {
                    frame.in_default = true;
                }
                self.emit(i);
                i + 1
            }
            (TokenKind::Punct, "?") if self.in_param_binding() && self.is_optional_marker(i) => self.skip(i, i + 1),
            (TokenKind::Punct, ":") if self.in_param_binding() && self.follows_binding() => {
                let end = self.skip_type(i + 1);
                self.skip(i, end)
            }
            (TokenKind::Ident, word)
                if self.top() == Some(Role::Params)
                    && PARAMETER_PROPERTY_MODIFIERS.contains(&word)
                    && (self.is_ident_at(i + 1) || self.is(i + 1, "{") || self.is(i + 1, "["))
                    && self.param_start() =>
            {
                self.error(i, "parameter properties are not supported");
                i + 1
            }
            (TokenKind::Ident, "this")
                if self.top() == Some(Role::Params) && self.is(i + 1, ":") && self.last_out_is("(") =>
            {
                let mut end = self.skip_type(i + 2);
                if self.is(end, ",") {
                    end += 1;
                }
                self.skip(i, end)
            }
            (TokenKind::Ident, "let" | "const" | "var") if self.starts_declaration(i) => {
                self.emit(i);
                self.decl_depth = Some(self.stack.len());
                self.declarator(i + 1);
                i + 1
            }
            (TokenKind::Ident, "in" | "of") if self.decl_depth == Some(self.stack.len()) => {
                self.decl_depth = None;
                self.emit(i);
                i + 1
            }
            (TokenKind::Ident, "class") if !self.last_out_is(".") => self.class_header(i),
            (TokenKind::Ident, "function") if !self.last_out_is(".") => {
                self.emit(i);
                let mut j = i + 1;
                if self.is(j, "*") {
                    self.emit(j);
                    j += 1;
                }
                if self.is_ident_at(j) {
                    self.emit(j);
                    j += 1;
                }
                if self.is(j, "<") {
                    if let Some(end) = self.skip_angle(j) {
                        j = self.skip(j, end);
                    }
                }
                j
            }
            _ => {
                self.emit(i);
                i + 1
            }
        }
    }

    fn push(&mut self, role: Role, callable: Callable) {
        self.stack.push(Frame {
            role,
            callable,
            member_start: role == Role::ClassBody,
            in_default: false,
        });
    }

    /// Classifies a `{` as a block or an object literal from what precedes it.
    fn brace_role(&self) -> Role {
        let Some(prev) = self.last_out() else {
            return Role::Block;
        };
        match prev.kind {
            TokenKind::Punct => match prev.text.as_str() {
                ")" | ";" | "{" | "}" | "=>" => Role::Block,
                ":" => {
                    let case_label = self
                        .out
                        .iter()
                        .rev()
                        .skip(1)
                        .take_while(|t| !(t.is_punct(";") || t.is_punct("{") || t.is_punct("}") || t.is_punct("?")))
                        .any(|t| t.is("case") || t.is("default"));
                    if case_label {
                        Role::Block
                    } else {
                        Role::Object
                    }
                }
                _ => Role::Object,
            },
            TokenKind::Ident => {
                if matches!(prev.text.as_str(), "else" | "try" | "finally" | "do") || prev.ends_expression() {
                    Role::Block
                } else {
                    Role::Object
                }
            }
            TokenKind::TemplateHead | TokenKind::TemplateMiddle => Role::Object,
            _ => Role::Block,
        }
    }

    fn close_frame(&mut self, i: usize) -> usize {
        self.emit(i);
        let frame = self.stack.pop();
        if self.decl_depth.is_some_and(|d| d > self.stack.len()) {
            self.decl_depth = None;
        }

        let Some(frame) = frame else {
            return i + 1;
        };

        let next_on_new_line = self.tok(i + 1).is_some_and(|t| t.newline_before);
        let closes_brace = self.toks[i].is_punct("}");
        let out_len = self.out.len();
        if let Some(parent) = self.stack.last_mut() {
            if parent.role == Role::ClassBody && closes_brace && (frame.role == Role::Block || next_on_new_line) {
                parent.member_start = true;
            }
            if parent.role == Role::ClassBody && frame.role == Role::Block && matches!(frame.callable, Callable::Method { .. }) {
                self.member_body_end = Some(out_len);
            }
        }
        if frame.role != Role::Params {
            return i + 1;
        }

        // Return type annotation after a parameter list
        let mut j = i + 1;
        if self.is(j, ":") {
            let end = self.skip_type(j + 1);
            j = self.skip(j, end);
        }

        let has_body = self.is(j, "{");
        match frame.callable {
            Callable::Function { out_mark } | Callable::Method { out_mark } if !has_body => {
                // Overload signature or abstract method: drop the whole declaration
                self.out.truncate(out_mark);
                if self.is(j, ";") {
                    j += 1;
                }
                if let Some(parent) = self.stack.last_mut() {
                    if parent.role == Role::ClassBody {
                        parent.member_start = true;
                    }
                }
                self.carry_newline = true;
                j
            }
            Callable::Method { .. } => {
                self.emit(j);
                self.push(Role::Block, frame.callable);
                j + 1
            }
            _ => j,
        }
    }

    // ── Statements ──────────────────────────────────────

    /// Handles TypeScript-only statements and import/export forms.
    /// Returns `None` when the token is not one of them.
    fn statement(&mut self, i: usize) -> Option<usize> {
        let toks = self.toks;
        let token = &toks[i];
        if !token.is_ident() {
            return None;
        }

        match token.text.as_str() {
            "interface" if self.is_ident_at(i + 1) => {
                let end = self.skip_interface(i);
                Some(self.skip(i, end))
            }
            "type" if self.is_ident_at(i + 1) && (self.is(i + 2, "=") || self.is(i + 2, "<")) => {
                let end = self.skip_type_alias(i);
                Some(self.skip(i, end))
            }
            "declare" if self.is_ident_at(i + 1) && !self.toks[i + 1].newline_before => {
                let end = self.skip_declaration(i);
                Some(self.skip(i, end))
            }
            "abstract" if self.is(i + 1, "class") => Some(self.skip(i, i + 1)),
            "enum" if self.is_ident_at(i + 1) && self.is(i + 2, "{") => Some(self.lower_enum(i)),
            "const" if self.is(i + 1, "enum") && self.is_ident_at(i + 2) && self.is(i + 3, "{") => {
                let j = self.skip(i, i + 1);
                Some(self.lower_enum(j))
            }
            "namespace" | "module"
                if (self.is_ident_at(i + 1) || self.is_kind(i + 1, TokenKind::Str))
                    && !self.toks[i + 1].newline_before =>
            {
                self.error(i, format!("'{}' blocks are not supported", token.text));
                let mut j = i + 1;
                while j < self.toks.len() && !self.is(j, "{") {
                    j += 1;
                }
                Some(self.close_of(j) + 1)
            }
            "import" if !self.is(i + 1, "(") && !self.is(i + 1, ".") => Some(self.import_statement(i)),
            "export" => Some(self.export_statement(i)),
            _ => None,
        }
    }

    fn import_statement(&mut self, i: usize) -> usize {
        // `import type ...` disappears entirely
        if self.is(i + 1, "type") && !self.is(i + 2, "from") && !self.is(i + 2, ",") {
            let end = self.statement_end_after_from(i);
            return self.skip(i, end);
        }
        if self.is_ident_at(i + 1) && self.is(i + 2, "=") {
            self.error(i, "'import x = require()' is not supported");
            return self.statement_end_after_from(i);
        }
        let end = self.statement_end_after_from(i);
        self.copy_module_clause(i, end);
        end
    }

    fn export_statement(&mut self, i: usize) -> usize {
        let next = i + 1;
        if self.is(next, "type") && (self.is(next + 1, "{") || self.is(next + 1, "*")) {
            let end = self.statement_end_after_from(i);
            return self.skip(i, end);
        }
        if self.is(next, "=") || (self.is(next, "as") && self.is(next + 1, "namespace")) {
            self.error(i, "'export =' and 'export as namespace' are not supported");
            return self.skip_unparsed_statement(i);
        }
        if self.is(next, "import") {
            self.error(i, "'export import' is not supported");
            return self.skip_unparsed_statement(i);
        }
        if self.is(next, "{") || self.is(next, "*") {
            let end = self.statement_end_after_from(i);
            self.copy_module_clause(i, end);
            return end;
        }
        if self.is(next, "interface")
            || self.is(next, "declare")
            || (self.is(next, "type") && self.is_ident_at(next + 1))
        {
            let end = match self.toks[next].text.as_str() {
                "interface" => self.skip_interface(next),
                "declare" => self.skip_declaration(next),
                _ => self.skip_type_alias(next),
            };
            return self.skip(i, end);
        }
        if self.is(next, "default") && self.is(next + 1, "interface") {
            let end = self.skip_interface(next + 1);
            return self.skip(i, end);
        }

        self.emit(i);
        let mut j = next;
        if self.is(j, "default") {
            self.emit(j);
            j += 1;
        }
        if self.is(j, "abstract") && self.is(j + 1, "class") {
            j = self.skip(j, j + 1);
        }
        if self.is(j, "enum") && self.is_ident_at(j + 1) {
            return self.lower_enum(j);
        }
        if self.is(j, "const") && self.is(j + 1, "enum") {
            let k = self.skip(j, j + 1);
            return self.lower_enum(k);
        }
        j
    }

    /// End of an import/export clause: one past the module specifier string
    /// (or past the closing brace of a local `export { }`), including an
    /// optional trailing semicolon.
    fn statement_end_after_from(&self, i: usize) -> usize {
        let end = self.clause_end(i);
        if self.is(end, ";") {
            end + 1
        } else {
            end
        }
    }

    fn clause_end(&self, i: usize) -> usize {
        let mut j = i + 1;
        while j < self.toks.len() {
            let t = &self.toks[j];
            if t.is("from") && self.is_kind(j + 1, TokenKind::Str) {
                return j + 2;
            }
            if t.kind == TokenKind::Str && self.toks[j - 1].is("import") {
                return j + 1;
            }
            if t.is_punct("{") {
                let c = self.close_of(j);
                if !self.is(c + 1, "from") {
                    return c + 1;
                }
                j = c + 1;
                continue;
            }
            if t.is_punct(";") {
                return j;
            }
            j += 1;
        }
        j
    }

    /// Copies an import/export clause verbatim, minus `type`-only specifiers.
    fn copy_module_clause(&mut self, from: usize, to: usize) {
        let mut j = from;
        let mut in_braces = false;
        while j < to {
            let t = &self.toks[j];
            if t.is_punct("{") {
                in_braces = true;
            } else if t.is_punct("}") {
                in_braces = false;
            }
            let type_specifier = in_braces
                && t.is("type")
                && self.is_ident_at(j + 1)
                && !self.is(j + 1, "as")
                && (self.is(j - 1, "{") || self.is(j - 1, ","));
            if type_specifier {
                let mut end = j + 2;
                if self.is(end, "as") {
                    end += 2;
                }
                if self.is(end, ",") {
                    end += 1;
                }
                j = self.skip(j, end);
                continue;
            }
            self.emit(j);
            j += 1;
        }
    }

    fn skip_interface(&self, i: usize) -> usize {
        let mut j = i + 1;
        while j < self.toks.len() && !self.is(j, "{") {
            if self.is(j, "<") {
                j = self.skip_angle(j).unwrap_or(j + 1);
            } else {
                j += 1;
            }
        }
        self.close_of(j) + 1
    }

    fn skip_type_alias(&self, i: usize) -> usize {
        let mut j = i + 2;
        if self.is(j, "<") {
            j = self.skip_angle(j).unwrap_or(j + 1);
        }
        if self.is(j, "=") {
            j = self.skip_type(j + 1);
        }
        if self.is(j, ";") {
            j += 1;
        }
        j
    }

    /// Skips an ambient `declare ...` statement. Signatures end at `;` or at
    /// the end of their type; bodies end at their closing brace.
    fn skip_declaration(&self, i: usize) -> usize {
        let mut j = i + 1;
        let end = match self.tok(j).map(|t| t.text.as_str()) {
            Some("function") => {
                j += 1;
                if self.is(j, "*") {
                    j += 1;
                }
                if self.is_ident_at(j) {
                    j += 1;
                }
                if self.is(j, "<") {
                    j = self.skip_angle(j).unwrap_or(j + 1);
                }
                if self.is(j, "(") {
                    j = self.close_of(j) + 1;
                }
                if self.is(j, ":") {
                    j = self.skip_type(j + 1);
                }
                j
            }
            Some("const" | "let" | "var") => self.skip_ambient_declarators(j + 1),
            Some("type") if self.is_ident_at(j + 1) => return self.skip_type_alias(j),
            Some("interface") => return self.skip_interface(j),
            Some("class" | "abstract" | "enum" | "namespace" | "module" | "global") => {
                while j < self.toks.len() && !self.is(j, "{") && !self.is(j, ";") {
                    if self.is(j, "<") {
                        j = self.skip_angle(j).unwrap_or(j + 1);
                    } else if self.is(j, "(") || self.is(j, "[") {
                        j = self.close_of(j) + 1;
                    } else {
                        j += 1;
                    }
                }
                if self.is(j, "{") {
                    return self.close_of(j) + 1;
                }
                j
            }
            _ => return self.skip_unparsed_statement(i),
        };
        if self.is(end, ";") {
            end + 1
        } else {
            end
        }
    }

    /// Skips `a: T, { b }: U = 1` in an ambient variable declaration.
    fn skip_ambient_declarators(&self, i: usize) -> usize {
        let mut j = i;
        loop {
            if self.is(j, "{") || self.is(j, "[") {
                j = self.close_of(j) + 1;
            } else if self.is_ident_at(j) {
                j += 1;
            } else {
                return j;
            }
            if self.is(j, ":") {
                j = self.skip_type(j + 1);
            }
            if self.is(j, "=") {
                j = self.skip_type_operand(j + 1);
            }
            if !self.is(j, ",") {
                return j;
            }
            j += 1;
        }
    }

    /// Skips a statement this stripper does not parse, up to `;`, a closing
    /// brace or a line break after a complete expression.
    fn skip_unparsed_statement(&self, i: usize) -> usize {
        let mut j = i + 1;
        while j < self.toks.len() {
            let t = &self.toks[j];
            if t.is_punct(";") {
                return j + 1;
            }
            if t.is_punct("{") || t.is_punct("(") || t.is_punct("[") {
                j = self.close_of(j) + 1;
                continue;
            }
            if t.newline_before && j > i + 2 && self.toks[j - 1].ends_expression() {
                return j;
            }
            j += 1;
        }
        j
    }

    fn lower_enum(&mut self, i: usize) -> usize {
        let toks = self.toks;
        let name = toks[i + 1].text.clone();
        let open = i + 2;
        let close = self.close_of(open);
        let mut body = String::new();
        let mut next_value: Option<f64> = Some(0.0);
        let mut j = open + 1;

        while j < close {
            let member = &toks[j];
            let key = match member.kind {
                TokenKind::Ident => format!("\"{}\"", member.text),
                TokenKind::Str => member.text.clone(),
                _ => {
                    self.error(j, "unsupported enum member name");
                    return close + 1;
                }
            };
            j += 1;

            let mut initializer: Option<(String, bool)> = None;
            if self.is(j, "=") {
                j += 1;
                let negative = self.is(j, "-");
                if negative {
                    j += 1;
                }
                match self.tok(j) {
                    Some(t) if t.kind == TokenKind::Number => {
                        let text = if negative { format!("-{}", t.text) } else { t.text.clone() };
                        next_value = parse_number(&text).map(|v| v + 1.0);
                        initializer = Some((text, true));
                    }
                    Some(t) if t.kind == TokenKind::Str && !negative => {
                        next_value = None;
                        initializer = Some((t.text.clone(), false));
                    }
                    _ => {
                        self.error(j, "computed enum members are not supported");
                        return close + 1;
                    }
                }
                j += 1;
            }

            let (value, numeric) = match initializer {
                Some(init) => init,
                None => match next_value {
                    Some(v) => {
                        next_value = Some(v + 1.0);
                        (format_number(v), true)
                    }
                    None => {
                        self.error(j, "enum member must have an initializer");
                        return close + 1;
                    }
                },
            };

            if numeric {
                body.push_str(&format!("{name}[{name}[{key}]={value}]={key};"));
            } else {
                body.push_str(&format!("{name}[{key}]={value};"));
            }

            if self.is(j, ",") {
                j += 1;
            }
        }

        self.emit_synthetic(
            &format!("var {name};(function({name}){{{body}}})({name}||({name}={{}}));"),
            self.toks[i].newline_before,
        );
        close + 1
    }

    // ── Declarations ────────────────────────────────────

    fn starts_declaration(&self, i: usize) -> bool {
        let next_binding = self.is_ident_at(i + 1) || self.is(i + 1, "{") || self.is(i + 1, "[");
        next_binding && !self.last_out_is(".") && !self.is(i + 1, "in") && !self.is(i + 1, "instanceof")
    }

    /// Registers the annotation slot of the declarator starting at `i`.
    fn declarator(&mut self, i: usize) {
        let Some(token) = self.tok(i) else {
            return;
        };
        let after_binding = if token.is_ident() {
            i + 1
        } else if token.is_punct("{") || token.is_punct("[") {
            self.close_of(i) + 1
        } else {
            return;
        };
        let mut colon = after_binding;
        if self.is(colon, "!") {
            self.drops.insert(colon);
            colon += 1;
        }
        if self.is(colon, ":") {
            self.type_colons.insert(colon);
        }
    }

    // ── Classes ─────────────────────────────────────────

    fn class_header(&mut self, i: usize) -> usize {
        self.emit(i);
        let mut j = i + 1;
        if self.is_ident_at(j) && !self.is(j, "extends") && !self.is(j, "implements") {
            self.emit(j);
            j += 1;
        }
        if self.is(j, "<") {
            if let Some(end) = self.skip_angle(j) {
                j = self.skip(j, end);
            }
        }
        if self.is(j, "extends") {
            self.emit(j);
            j += 1;
            while j < self.toks.len() && !self.is(j, "{") && !self.is(j, "implements") {
                if self.is(j, "(") || self.is(j, "[") {
                    let end = self.close_of(j) + 1;
                    for k in j..end {
                        self.emit(k);
                    }
                    j = end;
                    continue;
                }
                if self.is(j, "<") {
                    if let Some(end) = self.skip_angle(j) {
                        if self.is(end, "{") || self.is(end, "implements") {
                            j = self.skip(j, end);
                            continue;
                        }
                    }
                }
                self.emit(j);
                j += 1;
            }
        }
        if self.is(j, "implements") {
            let mut end = j + 1;
            while end < self.toks.len() && !self.is(end, "{") {
                if self.is(end, "<") {
                    end = self.skip_angle(end).unwrap_or(end + 1);
                } else {
                    end += 1;
                }
            }
            j = self.skip(j, end);
        }
        if self.is(j, "{") {
            self.emit(j);
            self.push(Role::ClassBody, Callable::None);
            j += 1;
        }
        j
    }

    /// Processes the prefix of a class member up to its name, generics and
    /// the opening of its parameter list or type annotation.
    fn class_member(&mut self, i: usize) -> usize {
        let out_mark = self.out.len();
        let mut j = i;
        let mut ambient = false;

        loop {
            let Some(t) = self.tok(j) else {
                return j;
            };
            if !t.is_ident() {
                break;
            }
            let followed_by_name = self.is_member_name_start(j + 1);
            if CLASS_MODIFIERS.contains(&t.text.as_str()) && followed_by_name {
                if t.text == "abstract" || t.text == "declare" {
                    ambient = true;
                }
                j = self.skip(j, j + 1);
                continue;
            }
            if matches!(t.text.as_str(), "static" | "async" | "get" | "set" | "accessor") && followed_by_name {
                if t.text == "static" && self.is(j + 1, "{") {
                    break;
                }
                self.emit(j);
                j += 1;
                continue;
            }
            break;
        }

        // Index signature: `[key: string]: T;`
        if self.is(j, "[") && self.is_ident_at(j + 1) && self.is(j + 2, ":") {
            let mut end = self.close_of(j) + 1;
            if self.is(end, ":") {
                end = self.skip_type(end + 1);
            }
            if self.is(end, ";") || self.is(end, ",") {
                end += 1;
            }
            self.out.truncate(out_mark);
            self.mark_member_start();
            return self.skip(i, end);
        }

        if self.is(j, "static") && self.is(j + 1, "{") {
            self.emit(j);
            return j + 1;
        }

        if self.is(j, "*") {
            self.emit(j);
            j += 1;
        }

        // Member name
        if self.is(j, "#") {
            self.emit(j);
            j += 1;
        }
        if self.is(j, "[") {
            let end = self.close_of(j) + 1;
            for k in j..end {
                self.emit(k);
            }
            j = end;
        } else if self.tok(j).is_some() && !self.is(j, "(") && !self.is(j, "<") {
            self.emit(j);
            j += 1;
        }

        if self.is(j, "?") || self.is(j, "!") {
            j = self.skip(j, j + 1);
        }
        if self.is(j, "<") {
            if let Some(end) = self.skip_angle(j) {
                j = self.skip(j, end);
            }
        }

        if self.is(j, "(") {
            // Bodiless methods (abstract, overloads) are dropped when the list closes
            self.emit(j);
            self.push(Role::Params, Callable::Method { out_mark });
            return j + 1;
        }
        if j == i {
            self.emit(i);
            return i + 1;
        }

        if self.is(j, ":") {
            let end = self.skip_type(j + 1);
            j = self.skip(j, end);
        }

        if ambient {
            let mut end = j;
            while end < self.toks.len() && !self.is(end, ";") && !self.is(end, "}") {
                if self.toks[end].newline_before && end > j {
                    break;
                }
                end += 1;
            }
            if self.is(end, ";") {
                end += 1;
            }
            self.out.truncate(out_mark);
            self.mark_member_start();
            return self.skip(i, end);
        }

        if !self.is(j, "=") && !self.is(j, ";") {
            // Field without initializer or semicolon: the next line is a new member
            self.mark_member_start();
        }
        j
    }

    fn mark_member_start(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            if frame.role == Role::ClassBody {
                frame.member_start = true;
            }
        }
    }

    fn is_member_name_start(&self, i: usize) -> bool {
        match self.tok(i) {
            Some(t) => match t.kind {
                TokenKind::Ident | TokenKind::Str | TokenKind::Number => true,
                TokenKind::Punct => matches!(t.text.as_str(), "[" | "#" | "*" | "{"),
                _ => false,
            },
            None => false,
        }
    }

    // ── Parentheses and generics ────────────────────────

    fn open_paren(&mut self, i: usize) -> usize {
        let close = self.close_of(i);
        let callable = self.function_callable();
        let is_params = callable.is_some()
            || self.last_out_is("catch")
            || self.is_arrow_params(close)
            || (self.top() == Some(Role::Object) && self.is_object_method_name() && (self.is(close + 1, "{") || self.is(close + 1, ":")));

        self.emit(i);
        if is_params {
            self.push(Role::Params, callable.unwrap_or(Callable::None));
        } else {
            self.push(Role::Paren, Callable::None);
        }
        i + 1
    }

    /// The output ends with a method name in an object literal: `{ run(`.
    fn is_object_method_name(&self) -> bool {
        let n = self.out.len();
        if n < 2 {
            return false;
        }
        let (before, name) = (&self.out[n - 2], &self.out[n - 1]);
        if name.is_punct("]") {
            return true;
        }
        let named = name.is_ident() || name.kind == TokenKind::Str;
        named
            && (before.is_punct("{")
                || before.is_punct(",")
                || before.is_punct("*")
                || (before.is_ident() && matches!(before.text.as_str(), "async" | "get" | "set")))
    }

    /// If the output ends with a `function` header, returns its callable kind.
    fn function_callable(&self) -> Option<Callable> {
        let n = self.out.len();
        let at = |k: usize| -> Option<&Token> { n.checked_sub(k).and_then(|idx| self.out.get(idx)) };

        let function_at = if at(1).is_some_and(|t| t.is("function")) {
            Some(n - 1)
        } else if at(2).is_some_and(|t| t.is("function"))
            && at(1).is_some_and(|t| t.is_ident() || t.is_punct("*"))
        {
            Some(n - 2)
        } else if at(3).is_some_and(|t| t.is("function"))
            && at(2).is_some_and(|t| t.is_punct("*"))
            && at(1).is_some_and(|t| t.is_ident())
        {
            Some(n - 3)
        } else {
            None
        }?;

        // Include `export`, `export default` and `async` in the droppable range
        let mut mark = function_at;
        while mark > 0 && self.out[mark - 1].is_ident() && matches!(self.out[mark - 1].text.as_str(), "async" | "export" | "default") {
            mark -= 1;
        }
        let is_declaration = mark == 0
            || self.out[mark - 1].is_punct(";")
            || self.out[mark - 1].is_punct("{")
            || self.out[mark - 1].is_punct("}")
            || self.out[function_at].newline_before;
        if is_declaration {
            Some(Callable::Function { out_mark: mark })
        } else {
            Some(Callable::None)
        }
    }

    fn is_arrow_params(&self, close: usize) -> bool {
        if self.is(close + 1, "=>") {
            return true;
        }
        if self.is(close + 1, ":") {
            let end = self.skip_type(close + 2);
            return self.is(end, "=>");
        }
        false
    }

    fn angle(&mut self, i: usize) -> usize {
        let Some(end) = self.skip_angle(i) else {
            self.emit(i);
            return i + 1;
        };
        let prev_is_callee = self
            .last_out()
            .is_some_and(|t| t.is_ident() && !is_operator_keyword(&t.text));
        let call_follows = self.is(end, "(")
            || matches!(self.tok(end).map(|t| t.kind), Some(TokenKind::Template | TokenKind::TemplateHead));

        if prev_is_callee && call_follows && !self.toks[i].newline_before {
            return self.skip(i, end);
        }
        // Generic arrow function: `<T>(x: T) => x`
        let expression_start = self.last_out().map_or(true, |t| !t.ends_expression());
        if expression_start && self.is(end, "(") && self.is_arrow_params(self.close_of(end)) {
            return self.skip(i, end);
        }
        self.emit(i);
        i + 1
    }

    /// Returns the index just past the `>` matching the `<` at `i`, when the
    /// bracketed tokens can form a type argument or parameter list.
    fn skip_angle(&self, i: usize) -> Option<usize> {
        let mut depth = 0usize;
        let mut j = i;
        while j < self.toks.len() {
            let t = &self.toks[j];
            match t.kind {
                TokenKind::Punct => match t.text.as_str() {
                    "<" => depth += 1,
                    ">" => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(j + 1);
                        }
                    }
                    "(" | "[" | "{" => {
                        j = self.close.get(j).copied().flatten()?;
                    }
                    "," | "." | "|" | "&" | "?" | ":" | "=>" | "-" | "..." | "=" => {}
                    _ => return None,
                },
                TokenKind::Ident | TokenKind::Str | TokenKind::Number | TokenKind::Template => {}
                TokenKind::TemplateHead => {
                    let mut k = j;
                    while !matches!(self.tok(k).map(|t| t.kind), Some(TokenKind::TemplateTail) | None) {
                        k = self.close.get(k).copied().flatten()?;
                    }
                    j = k;
                }
                _ => return None,
            }
            j += 1;
        }
        None
    }

    // ── Type expressions ────────────────────────────────

    /// Returns the index just past the type expression starting at `i`.
    fn skip_type(&self, i: usize) -> usize {
        let mut j = i;
        if self.is(j, "|") || self.is(j, "&") {
            j += 1;
        }
        loop {
            let next = self.skip_type_operand(j);
            if next == j {
                return j;
            }
            j = next;
            if self.is(j, "extends") && !self.toks[j].newline_before {
                let check = self.skip_type_operand(j + 1);
                if self.is(check, "?") {
                    let yes = self.skip_type(check + 1);
                    if self.is(yes, ":") {
                        return self.skip_type(yes + 1);
                    }
                    return yes;
                }
                return check;
            }
            if self.is(j, "|") || self.is(j, "&") {
                j += 1;
                continue;
            }
            return j;
        }
    }

    fn skip_type_operand(&self, i: usize) -> usize {
        let mut j = i;
        while self.is_ident_at(j)
            && matches!(self.toks[j].text.as_str(), "keyof" | "readonly" | "unique" | "infer")
            && self.tok(j + 1).is_some_and(|t| !t.is_punct(",") && !t.is_punct(")") && !t.is_punct("=") && !t.is_punct(";"))
        {
            j += 1;
        }
        if self.is(j, "asserts") && self.is_ident_at(j + 1) && !self.toks[j + 1].newline_before {
            j += 1;
        }
        if self.is(j, "new") {
            j += 1;
        }
        if self.is(j, "<") {
            j = self.skip_angle(j).unwrap_or(j);
        }

        let Some(t) = self.tok(j) else {
            return j;
        };
        match t.kind {
            TokenKind::Punct => match t.text.as_str() {
                "(" => {
                    j = self.close_of(j) + 1;
                    if self.is(j, "=>") {
                        return self.skip_type(j + 1);
                    }
                }
                "{" | "[" => j = self.close_of(j) + 1,
                "-" if self.is_kind(j + 1, TokenKind::Number) => j += 2,
                _ => return i,
            },
            TokenKind::Str | TokenKind::Number | TokenKind::Template => j += 1,
            TokenKind::TemplateHead => {
                let mut k = j;
                while k < self.toks.len() && self.toks[k].kind != TokenKind::TemplateTail {
                    k = self.close_of(k);
                }
                j = k + 1;
            }
            TokenKind::Ident => {
                if t.text == "typeof" {
                    j += 1;
                }
                j += 1;
                while self.is(j, ".") && self.is_ident_at(j + 1) {
                    j += 2;
                }
                if self.is(j, "<") && !self.toks[j].newline_before {
                    j = self.skip_angle(j).unwrap_or(j);
                }
                if self.is(j, "is") && !self.toks[j].newline_before {
                    return self.skip_type(j + 1);
                }
            }
            _ => return i,
        }

        while self.is(j, "[") && !self.toks[j].newline_before {
            j = self.close_of(j) + 1;
        }
        j
    }

    // ── Postfix type syntax ─────────────────────────────

    fn is_type_cast(&self, i: usize) -> bool {
        let prev_ends = self.last_out().is_some_and(|t| t.ends_expression());
        let next_is_type = self.tok(i + 1).is_some_and(|t| match t.kind {
            TokenKind::Ident | TokenKind::Str | TokenKind::Number | TokenKind::Template => true,
            TokenKind::Punct => matches!(t.text.as_str(), "{" | "[" | "(" | "<"),
            _ => false,
        });
        prev_ends && next_is_type && !self.toks[i].newline_before
    }

    fn is_non_null_assertion(&self, i: usize) -> bool {
        let t = &self.toks[i];
        !t.space_before && self.last_out().is_some_and(|p| p.ends_expression() && !p.is_punct("}"))
    }

    fn is_optional_marker(&self, i: usize) -> bool {
        let prev_binding = self
            .last_out()
            .is_some_and(|t| t.is_ident() || t.is_punct("]") || t.is_punct("}"));
        let next = self.tok(i + 1);
        prev_binding && next.is_some_and(|t| t.is_punct(":") || t.is_punct(",") || t.is_punct(")") || t.is_punct("="))
    }

    /// In a parameter list: the `:` directly follows a parameter binding.
    fn follows_binding(&self) -> bool {
        self.last_out()
            .is_some_and(|t| t.is_ident() || t.is_punct("]") || t.is_punct("}"))
    }

    fn in_param_binding(&self) -> bool {
        self.stack
            .last()
            .is_some_and(|f| f.role == Role::Params && !f.in_default)
    }

    fn param_start(&self) -> bool {
        self.last_out_is("(") || self.last_out_is(",")
    }
}

fn parse_number(text: &str) -> Option<f64> {
    let clean = text.replace('_', "");
    if let Some(hex) = clean.strip_prefix("0x").or_else(|| clean.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    clean.parse::<f64>().ok()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
