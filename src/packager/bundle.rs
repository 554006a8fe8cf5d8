//! Module graph discovery and bundle emission.
//!
//! Modules get their numeric id in depth-first discovery order from the
//! entry file (id 0). The emitted bundle references modules only by id, so
//! it is independent of where the sources live on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::lexer::tokenize;
use super::link::{parse_module, ModuleSyntax};
use super::resolve::Resolver;
use super::strip::strip_types;
use super::{Diagnostic, PackageError};

const FACTORY_HEAD: &str = "function(exports,module,require){";

const RUNTIME: &str = "__c={};function __r(i){var c=__c[i];if(c)return c.exports;var m=__c[i]={exports:{}};__m[i].call(m.exports,m.exports,m,__r);return m.exports}";

const EPILOGUE: &str = "var __e=__r(0);if(typeof __e.transform===\"function\")globalThis.transform=__e.transform;else if(typeof __e.default===\"function\")globalThis.transform=__e.default";

/// The linked bundle of one capability.
#[derive(Debug)]
pub struct Bundle {
    pub code: String,
    /// Bytes of capability code, without bundle glue.
    pub module_code_len: usize,
    pub module_count: usize,
}

struct ModuleRecord {
    syntax: ModuleSyntax,
    deps: Vec<usize>,
}

pub struct Bundler {
    resolver: Resolver,
    root: PathBuf,
    ids: HashMap<PathBuf, usize>,
    modules: Vec<Option<ModuleRecord>>,
    diagnostics: Vec<Diagnostic>,
}

impl Bundler {
    pub fn new(entry: &Path) -> Self {
        let root = entry
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            resolver: Resolver::new(),
            root,
            ids: HashMap::new(),
            modules: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn bundle(mut self, entry: &Path) -> Result<Bundle, PackageError> {
        let entry = entry.canonicalize().map_err(|source| PackageError::Io {
            path: entry.to_path_buf(),
            source,
        })?;
        self.root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| entry.parent().map(Path::to_path_buf).unwrap_or_default());

        self.visit(&entry)?;

        if !self.diagnostics.is_empty() {
            return Err(PackageError::CompileFailure(self.diagnostics));
        }

        let mut code = String::from("(function(){\"use strict\";var __m=[");
        let mut module_code_len = 0;
        for (id, record) in self.modules.iter().enumerate() {
            let Some(record) = record else {
                continue;
            };
            if id > 0 {
                code.push(',');
            }
            let rendered = record.syntax.render(&record.deps);
            module_code_len += rendered.body_len;
            code.push_str(FACTORY_HEAD);
            code.push_str(&rendered.code);
            code.push('}');
        }
        code.push_str("],");
        code.push_str(RUNTIME);
        code.push_str(EPILOGUE);
        code.push_str("})();");

        Ok(Bundle {
            code,
            module_code_len,
            module_count: self.modules.len(),
        })
    }

    /// Loads, transforms and links `path` and everything it imports.
    /// Returns the module id.
    fn visit(&mut self, path: &Path) -> Result<usize, PackageError> {
        if let Some(&id) = self.ids.get(path) {
            return Ok(id);
        }
        let id = self.modules.len();
        self.ids.insert(path.to_path_buf(), id);
        self.modules.push(None);

        let name = self.display_name(path);
        debug!("Bundling module {id}: {name}");

        let source = std::fs::read_to_string(path).map_err(|source| PackageError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let Some(syntax) = self.transform(&name, path, &source) else {
            return Ok(id);
        };

        let mut deps = Vec::with_capacity(syntax.requests.len());
        for request in &syntax.requests {
            match self.resolver.resolve(path, &request.specifier) {
                Some(target) => deps.push(self.visit(&target)?),
                None => {
                    self.diagnostics.push(Diagnostic::new(
                        &name,
                        request.line,
                        request.column,
                        format!("cannot resolve module '{}'", request.specifier),
                    ));
                    deps.push(0);
                }
            }
        }

        self.modules[id] = Some(ModuleRecord { syntax, deps });
        Ok(id)
    }

    fn transform(&mut self, name: &str, path: &Path, source: &str) -> Option<ModuleSyntax> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        match extension {
            "json" => match serde_json::from_str::<serde_json::Value>(source) {
                Ok(value) => Some(ModuleSyntax::json(&value.to_string())),
                Err(e) => {
                    self.diagnostics.push(Diagnostic::new(
                        name,
                        e.line() as u32,
                        e.column() as u32,
                        format!("invalid JSON module: {e}"),
                    ));
                    None
                }
            },
            "ts" | "js" => {
                let tokens = match tokenize(name, source) {
                    Ok(tokens) => tokens,
                    Err(d) => {
                        self.diagnostics.push(d);
                        return None;
                    }
                };
                let tokens = if extension == "ts" {
                    match strip_types(name, tokens) {
                        Ok(tokens) => tokens,
                        Err(diagnostics) => {
                            self.diagnostics.extend(diagnostics);
                            return None;
                        }
                    }
                } else {
                    tokens
                };
                match parse_module(name, &tokens) {
                    Ok(syntax) => Some(syntax),
                    Err(diagnostics) => {
                        self.diagnostics.extend(diagnostics);
                        None
                    }
                }
            }
            other => {
                self.diagnostics.push(Diagnostic::new(
                    name,
                    0,
                    0,
                    format!("unsupported module kind '.{other}'"),
                ));
                None
            }
        }
    }

    /// Path relative to the entry directory, for diagnostics only.
    fn display_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}
