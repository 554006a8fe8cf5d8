//! ES module syntax → bundle factory bodies.
//!
//! `parse_module` removes top-level `import`/`export` statements from a token
//! stream and records what they bind. `ModuleSyntax::render` then produces
//! the body of one `function(exports,module,require){…}` factory once the
//! bundler has assigned a numeric id to every requested module.

use super::lexer::{Token, TokenKind};
use super::minify::print;
use super::Diagnostic;

/// One `import … from` / `export … from` / side-effect import.
#[derive(Debug, Clone)]
pub struct ModuleRequest {
    pub specifier: String,
    pub line: u32,
    pub column: u32,
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Default(String),
    Namespace(String),
    Named { imported: String, local: String },
    ReExport { imported: String, exported: String },
    ReExportAll,
    ReExportNamespace(String),
}

#[derive(Debug, Clone, Default)]
pub struct ModuleSyntax {
    pub requests: Vec<ModuleRequest>,
    /// `(exported, local)` pairs for function declarations, assigned before the body runs.
    hoisted: Vec<(String, String)>,
    /// `(exported, local)` pairs assigned after the body has run.
    trailer: Vec<(String, String)>,
    body: Vec<Token>,
}

/// A module rendered as the body of its factory function.
#[derive(Debug, Clone)]
pub struct RenderedModule {
    pub code: String,
    /// Length of the capability's own code, without generated glue.
    pub body_len: usize,
}

impl ModuleSyntax {
    /// A JSON document imported as a module.
    pub fn json(document: &str) -> Self {
        let mut body = vec![
            Token::synthetic(TokenKind::Ident, "exports"),
            Token::synthetic(TokenKind::Punct, "."),
            Token::synthetic(TokenKind::Ident, "default"),
            Token::synthetic(TokenKind::Punct, "="),
        ];
        // JSON is a valid expression; keep it as a single opaque token
        body.push(Token::synthetic(TokenKind::Template, document));
        body.push(Token::synthetic(TokenKind::Punct, ";"));
        Self {
            body,
            ..Self::default()
        }
    }

    /// Renders the factory body. `ids[k]` is the module id of `requests[k]`.
    pub fn render(&self, ids: &[usize]) -> RenderedModule {
        let mut code = String::new();

        for (k, (request, id)) in self.requests.iter().zip(ids).enumerate() {
            let var = format!("__i{k}");
            code.push_str(&format!("const {var}=require({id});"));
            for binding in &request.bindings {
                match binding {
                    Binding::Default(local) => code.push_str(&format!("const {local}={var}.default;")),
                    Binding::Namespace(local) => code.push_str(&format!("const {local}={var};")),
                    Binding::Named { imported, local } => {
                        code.push_str(&format!("const {local}={var}.{imported};"))
                    }
                    Binding::ReExport { imported, exported } => {
                        code.push_str(&format!("exports.{exported}={var}.{imported};"))
                    }
                    Binding::ReExportNamespace(exported) => {
                        code.push_str(&format!("exports.{exported}={var};"))
                    }
                    Binding::ReExportAll => code.push_str(&format!(
                        "Object.keys({var}).forEach(function(k){{if(k!==\"default\"&&!Object.prototype.hasOwnProperty.call(exports,k))exports[k]={var}[k]}});"
                    )),
                }
            }
        }
        for (exported, local) in &self.hoisted {
            code.push_str(&format!("exports.{exported}={local};"));
        }

        let body = print(&self.body);
        let body_len = body.len();
        code.push_str(&body);

        if !self.trailer.is_empty() {
            if !body.is_empty() && !body.ends_with(';') {
                code.push(';');
            }
            for (exported, local) in &self.trailer {
                code.push_str(&format!("exports.{exported}={local};"));
            }
        }

        RenderedModule { code, body_len }
    }
}

pub fn parse_module(file: &str, tokens: &[Token]) -> Result<ModuleSyntax, Vec<Diagnostic>> {
    let mut linker = Linker {
        file,
        toks: tokens,
        syntax: ModuleSyntax::default(),
        depth: 0,
        carry_newline: false,
        diagnostics: Vec::new(),
    };
    linker.run();
    if linker.diagnostics.is_empty() {
        Ok(linker.syntax)
    } else {
        Err(linker.diagnostics)
    }
}

struct Linker<'a> {
    file: &'a str,
    toks: &'a [Token],
    syntax: ModuleSyntax,
    depth: usize,
    carry_newline: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Linker<'a> {
    fn is(&self, i: usize, text: &str) -> bool {
        self.toks.get(i).is_some_and(|t| t.is(text))
    }

    fn ident_at(&self, i: usize) -> Option<&'a str> {
        self.toks
            .get(i)
            .filter(|t| t.is_ident())
            .map(|t| t.text.as_str())
    }

    fn error(&mut self, i: usize, message: impl Into<String>) {
        let (line, column) = self.toks.get(i).map(|t| (t.line, t.column)).unwrap_or((0, 0));
        self.diagnostics.push(Diagnostic::new(self.file, line, column, message));
    }

    fn emit(&mut self, i: usize) {
        let mut token = self.toks[i].clone();
        if self.carry_newline {
            token.newline_before = true;
            self.carry_newline = false;
        }
        self.track_depth(&token);
        self.syntax.body.push(token);
    }

    fn emit_synthetic(&mut self, kind: TokenKind, text: &str) {
        let mut token = Token::synthetic(kind, text);
        token.newline_before = std::mem::take(&mut self.carry_newline);
        self.syntax.body.push(token);
    }

    fn drop_token(&mut self, i: usize) {
        if self.toks[i].newline_before {
            self.carry_newline = true;
        }
    }

    fn track_depth(&mut self, token: &Token) {
        match token.kind {
            TokenKind::Punct if matches!(token.text.as_str(), "(" | "[" | "{") => self.depth += 1,
            TokenKind::Punct if matches!(token.text.as_str(), ")" | "]" | "}") => {
                self.depth = self.depth.saturating_sub(1)
            }
            TokenKind::TemplateHead => self.depth += 1,
            TokenKind::TemplateTail => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
    }

    fn run(&mut self) {
        let mut i = 0;
        while i < self.toks.len() {
            let token = &self.toks[i];
            let after_dot = i > 0 && (self.toks[i - 1].is_punct(".") || self.toks[i - 1].is_punct("?."));

            if token.is_ident() && !after_dot {
                match token.text.as_str() {
                    "import" if self.is(i + 1, "(") => {
                        self.error(i, "dynamic import() is not supported");
                    }
                    "import" if self.is(i + 1, ".") => {
                        self.error(i, "import.meta is not supported");
                    }
                    "import" if self.depth == 0 => {
                        i = self.import_statement(i);
                        continue;
                    }
                    "export" if self.depth == 0 => {
                        i = self.export_statement(i);
                        continue;
                    }
                    "require" if self.is(i + 1, "(") => {
                        self.error(i, "require() is not supported, use a static import");
                    }
                    _ => {}
                }
            }
            self.emit(i);
            i += 1;
        }
    }

    // ── Imports ─────────────────────────────────────────

    fn import_statement(&mut self, i: usize) -> usize {
        self.drop_token(i);
        let mut j = i + 1;
        let mut bindings = Vec::new();

        if let Some(specifier) = self.string_at(j) {
            return self.finish_request(i, j, specifier, bindings);
        }

        if let Some(local) = self.ident_at(j) {
            if local != "from" || self.is(j + 1, "from") {
                bindings.push(Binding::Default(local.to_string()));
                j += 1;
                if self.is(j, ",") {
                    j += 1;
                }
            }
        }
        if self.is(j, "*") && self.is(j + 1, "as") {
            match self.ident_at(j + 2) {
                Some(local) => bindings.push(Binding::Namespace(local.to_string())),
                None => self.error(j, "expected a namespace name"),
            }
            j += 3;
        } else if self.is(j, "{") {
            let (specifiers, end) = self.specifier_list(j);
            bindings.extend(
                specifiers
                    .into_iter()
                    .map(|(imported, local)| Binding::Named { imported, local }),
            );
            j = end;
        }

        if !self.is(j, "from") {
            self.error(j, "expected 'from' in import declaration");
            return self.skip_statement(j);
        }
        match self.string_at(j + 1) {
            Some(specifier) => self.finish_request(i, j + 1, specifier, bindings),
            None => {
                self.error(j + 1, "expected a module specifier");
                self.skip_statement(j)
            }
        }
    }

    /// Parses `{ a, b as c }`; returns `(name, alias)` pairs and the index after `}`.
    fn specifier_list(&mut self, open: usize) -> (Vec<(String, String)>, usize) {
        let mut out = Vec::new();
        let mut j = open + 1;
        while j < self.toks.len() && !self.is(j, "}") {
            let Some(name) = self.toks.get(j).filter(|t| t.is_ident() || t.kind == TokenKind::Str) else {
                self.error(j, "expected an identifier in specifier list");
                return (out, self.skip_statement(j));
            };
            if name.kind == TokenKind::Str {
                self.error(j, "string specifier names are not supported");
            }
            let name = name.text.clone();
            j += 1;
            let alias = if self.is(j, "as") {
                let alias = self.ident_at(j + 1).map(str::to_string);
                if alias.is_none() {
                    self.error(j + 1, "expected an alias after 'as'");
                }
                j += 2;
                alias.unwrap_or_else(|| name.clone())
            } else {
                name.clone()
            };
            out.push((name, alias));
            if self.is(j, ",") {
                j += 1;
            }
        }
        (out, j + 1)
    }

    fn string_at(&self, i: usize) -> Option<String> {
        let token = self.toks.get(i).filter(|t| t.kind == TokenKind::Str)?;
        let inner = &token.text[1..token.text.len().saturating_sub(1).max(1)];
        Some(inner.to_string())
    }

    fn finish_request(&mut self, statement: usize, spec_at: usize, specifier: String, bindings: Vec<Binding>) -> usize {
        let at = &self.toks[statement];
        self.syntax.requests.push(ModuleRequest {
            specifier,
            line: at.line,
            column: at.column,
            bindings,
        });
        let mut end = spec_at + 1;
        if self.is(end, ";") {
            end += 1;
        }
        end
    }

    fn skip_statement(&self, from: usize) -> usize {
        let mut j = from;
        while j < self.toks.len() && !self.is(j, ";") {
            j += 1;
        }
        j + 1
    }

    // ── Exports ─────────────────────────────────────────

    fn export_statement(&mut self, i: usize) -> usize {
        self.drop_token(i);
        let next = i + 1;

        if self.is(next, "*") {
            let mut j = next + 1;
            let binding = if self.is(j, "as") {
                let name = self.ident_at(j + 1).unwrap_or_default().to_string();
                j += 2;
                Binding::ReExportNamespace(name)
            } else {
                Binding::ReExportAll
            };
            if !self.is(j, "from") {
                self.error(j, "expected 'from' after 'export *'");
                return self.skip_statement(j);
            }
            return match self.string_at(j + 1) {
                Some(specifier) => self.finish_request(i, j + 1, specifier, vec![binding]),
                None => {
                    self.error(j + 1, "expected a module specifier");
                    self.skip_statement(j)
                }
            };
        }

        if self.is(next, "{") {
            let (specifiers, end) = self.specifier_list(next);
            if self.is(end, "from") {
                let bindings = specifiers
                    .into_iter()
                    .map(|(imported, exported)| Binding::ReExport { imported, exported })
                    .collect();
                return match self.string_at(end + 1) {
                    Some(specifier) => self.finish_request(i, end + 1, specifier, bindings),
                    None => {
                        self.error(end + 1, "expected a module specifier");
                        self.skip_statement(end)
                    }
                };
            }
            self.syntax
                .trailer
                .extend(specifiers.into_iter().map(|(local, exported)| (exported, local)));
            return if self.is(end, ";") { end + 1 } else { end };
        }

        if self.is(next, "default") {
            return self.export_default(next);
        }

        // `export function`, `export async function`, `export class`, `export const`, …
        let mut j = next;
        let is_async = self.is(j, "async") && self.is(j + 1, "function");
        if is_async {
            j += 1;
        }
        match self.ident_at(j) {
            Some("function") => {
                let name_at = if self.is(j + 1, "*") { j + 2 } else { j + 1 };
                match self.ident_at(name_at) {
                    Some(name) => self.syntax.hoisted.push((name.to_string(), name.to_string())),
                    None => self.error(name_at, "exported function must have a name"),
                }
            }
            Some("class") => match self.ident_at(j + 1) {
                Some(name) => self.syntax.trailer.push((name.to_string(), name.to_string())),
                None => self.error(j + 1, "exported class must have a name"),
            },
            Some("const" | "let" | "var") => {
                let names = self.declared_names(j + 1);
                self.syntax
                    .trailer
                    .extend(names.into_iter().map(|n| (n.clone(), n)));
            }
            _ => self.error(next, "unsupported export form"),
        }
        next
    }

    fn export_default(&mut self, at: usize) -> usize {
        self.drop_token(at);
        let mut j = at + 1;
        let is_async = self.is(j, "async") && self.is(j + 1, "function");
        if is_async {
            j += 1;
        }

        let declaration = match self.ident_at(j) {
            Some("function") => {
                let name_at = if self.is(j + 1, "*") { j + 2 } else { j + 1 };
                Some((true, self.ident_at(name_at)))
            }
            Some("class") => {
                let name = self.ident_at(j + 1).filter(|n| *n != "extends");
                Some((false, name))
            }
            _ => None,
        };

        match declaration {
            Some((true, Some(name))) => {
                self.syntax.hoisted.push(("default".to_string(), name.to_string()));
                at + 1
            }
            Some((false, Some(name))) => {
                self.syntax.trailer.push(("default".to_string(), name.to_string()));
                at + 1
            }
            Some((_, None)) => {
                // Anonymous function or class: emit as an expression statement
                self.emit_default_assignment();
                let end = self.declaration_end(j);
                for k in (at + 1)..end {
                    self.emit(k);
                }
                self.emit_synthetic(TokenKind::Punct, ";");
                end
            }
            None => {
                self.emit_default_assignment();
                at + 1
            }
        }
    }

    fn emit_default_assignment(&mut self) {
        self.emit_synthetic(TokenKind::Ident, "exports");
        self.emit_synthetic(TokenKind::Punct, ".");
        self.emit_synthetic(TokenKind::Ident, "default");
        self.emit_synthetic(TokenKind::Punct, "=");
    }

    /// Index after the body of the function or class declaration starting at `i`.
    fn declaration_end(&self, i: usize) -> usize {
        let mut depth = 0usize;
        let mut j = i;
        let mut seen_body = false;
        while j < self.toks.len() {
            let t = &self.toks[j];
            match t.kind {
                TokenKind::Punct if matches!(t.text.as_str(), "(" | "[") => depth += 1,
                TokenKind::Punct if matches!(t.text.as_str(), ")" | "]") => depth = depth.saturating_sub(1),
                TokenKind::Punct if t.text == "{" => {
                    // The body is the first brace outside parameters and heritage calls
                    if depth == 0 {
                        seen_body = true;
                    }
                    depth += 1;
                }
                TokenKind::Punct if t.text == "}" => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 && seen_body {
                        return j + 1;
                    }
                }
                TokenKind::TemplateHead => depth += 1,
                TokenKind::TemplateTail => depth = depth.saturating_sub(1),
                _ => {}
            }
            j += 1;
        }
        j
    }

    /// Collects the names bound by the declarators of a `let`/`const`/`var`.
    fn declared_names(&self, start: usize) -> Vec<String> {
        let mut names = Vec::new();
        let mut j = start;
        loop {
            j = self.binding_names(j, &mut names);
            if self.is(j, "=") {
                j = self.initializer_end(j + 1);
            }
            if self.is(j, ",") {
                j += 1;
                continue;
            }
            return names;
        }
    }

    /// Reads one binding (identifier or destructuring pattern) at `i`.
    fn binding_names(&self, i: usize, names: &mut Vec<String>) -> usize {
        let Some(token) = self.toks.get(i) else {
            return i;
        };
        if token.is_ident() {
            names.push(token.text.clone());
            return i + 1;
        }
        if !(token.is_punct("{") || token.is_punct("[")) {
            return i + 1;
        }

        let is_object = token.is_punct("{");
        let closer = if is_object { "}" } else { "]" };
        let mut j = i + 1;
        while j < self.toks.len() && !self.is(j, closer) {
            if self.is(j, ",") {
                j += 1;
                continue;
            }
            if self.is(j, "...") {
                j = self.binding_names(j + 1, names);
                continue;
            }
            if is_object {
                // `key: pattern`, `[computed]: pattern`, or shorthand `name`
                let key_end = if self.is(j, "[") { self.matching(j) + 1 } else { j + 1 };
                if self.is(key_end, ":") {
                    j = self.binding_names(key_end + 1, names);
                } else {
                    j = self.binding_names(j, names);
                }
            } else {
                j = self.binding_names(j, names);
            }
            if self.is(j, "=") {
                j = self.initializer_end(j + 1);
            }
        }
        j + 1
    }

    fn matching(&self, open: usize) -> usize {
        let mut depth = 0usize;
        for (j, t) in self.toks.iter().enumerate().skip(open) {
            if t.kind == TokenKind::Punct {
                match t.text.as_str() {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" | "}" => {
                        depth -= 1;
                        if depth == 0 {
                            return j;
                        }
                    }
                    _ => {}
                }
            }
        }
        self.toks.len()
    }

    /// Index of the `,` / closer / statement end that terminates an initializer.
    fn initializer_end(&self, start: usize) -> usize {
        let mut depth = 0usize;
        let mut j = start;
        while j < self.toks.len() {
            let t = &self.toks[j];
            match t.kind {
                TokenKind::Punct => match t.text.as_str() {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" | "}" => {
                        if depth == 0 {
                            return j;
                        }
                        depth -= 1;
                    }
                    "," | ";" if depth == 0 => return j,
                    _ => {}
                },
                TokenKind::TemplateHead => depth += 1,
                TokenKind::TemplateTail => depth = depth.saturating_sub(1),
                _ => {}
            }
            // A new statement on the next line ends the declaration
            if depth == 0 && j > start && t.newline_before && t.is_ident() && self.toks[j - 1].ends_expression() {
                return j;
            }
            j += 1;
        }
        j
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packager::lexer::tokenize;

    fn parse(source: &str) -> ModuleSyntax {
        let tokens = tokenize("m.js", source).unwrap();
        parse_module("m.js", &tokens).unwrap()
    }

    fn render(source: &str) -> String {
        let syntax = parse(source);
        let ids: Vec<usize> = (1..=syntax.requests.len()).collect();
        syntax.render(&ids).code
    }

    // ── Imports ─────────────────────────────────────────

    #[test]
    fn test_import_forms() {
        let syntax = parse("import a, { b, c as d } from './x';\nimport * as ns from './y';\nimport './z';");
        assert_eq!(syntax.requests.len(), 3);
        assert_eq!(syntax.requests[0].specifier, "./x");
        assert_eq!(
            syntax.requests[0].bindings,
            vec![
                Binding::Default("a".into()),
                Binding::Named { imported: "b".into(), local: "b".into() },
                Binding::Named { imported: "c".into(), local: "d".into() },
            ]
        );
        assert_eq!(syntax.requests[1].bindings, vec![Binding::Namespace("ns".into())]);
        assert!(syntax.requests[2].bindings.is_empty());
    }

    #[test]
    fn test_render_imports() {
        let code = render("import a, { b as c } from './x';\nuse(a, c);");
        assert_eq!(code, "const __i0=require(1);const a=__i0.default;const c=__i0.b;use(a,c);");
    }

    #[test]
    fn test_dynamic_import_rejected() {
        let tokens = tokenize("m.js", "const m = import('./x');").unwrap();
        let diags = parse_module("m.js", &tokens).unwrap_err();
        assert!(diags[0].message.contains("dynamic import"));
    }

    #[test]
    fn test_require_rejected() {
        let tokens = tokenize("m.js", "const fs = require('fs');").unwrap();
        assert!(parse_module("m.js", &tokens).is_err());
    }

    // ── Exports ─────────────────────────────────────────

    #[test]
    fn test_export_function_is_hoisted() {
        let code = render("export function transform(p) { return p; }");
        assert_eq!(code, "exports.transform=transform;function transform(p){return p;}");
    }

    #[test]
    fn test_export_const_goes_to_trailer() {
        let code = render("export const a = 1, { b, c: [d] } = o\nfoo()");
        assert_eq!(code, "const a=1,{b,c:[d]}=o\nfoo();exports.a=a;exports.b=b;exports.d=d;");
    }

    #[test]
    fn test_export_list() {
        let code = render("const x = 1;\nexport { x as y, x as default };");
        assert_eq!(code, "const x=1;exports.y=x;exports.default=x;");
    }

    #[test]
    fn test_export_default_expression() {
        assert_eq!(render("export default { a: 1 };"), "exports.default={a:1};");
    }

    #[test]
    fn test_export_default_anonymous_function() {
        assert_eq!(
            render("export default function (p) { return p }\nconst z = 1"),
            "exports.default=function(p){return p};const z=1"
        );
    }

    #[test]
    fn test_export_default_named_class() {
        assert_eq!(render("export default class A {}"), "class A{};exports.default=A;");
    }

    #[test]
    fn test_re_exports() {
        let code = render("export { a as b } from './x';\nexport * from './y';\nexport * as ns from './z';");
        assert!(code.starts_with("const __i0=require(1);exports.b=__i0.a;const __i1=require(2);Object.keys(__i1)"));
        assert!(code.ends_with("const __i2=require(3);exports.ns=__i2;"));
    }

    #[test]
    fn test_json_module() {
        let syntax = ModuleSyntax::json("{\"a\":1}");
        assert_eq!(syntax.render(&[]).code, "exports.default={\"a\":1};");
    }
}
