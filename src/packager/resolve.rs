//! Module specifier resolution: relative paths, then `tsconfig.json` path aliases.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

const CANDIDATE_SUFFIXES: &[&str] = &["", ".ts", ".js", "/index.ts", "/index.js"];

#[derive(Debug, Default)]
pub struct Resolver {
    /// Nearest `tsconfig.json` per directory, memoized.
    configs: HashMap<PathBuf, Option<Arc<PathAliases>>>,
}

#[derive(Debug)]
struct PathAliases {
    base: PathBuf,
    /// `(pattern, targets)`, as written in `compilerOptions.paths`.
    paths: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Deserialize)]
struct TsConfig {
    #[serde(rename = "compilerOptions", default)]
    compiler_options: CompilerOptions,
}

#[derive(Debug, Default, Deserialize)]
struct CompilerOptions {
    #[serde(rename = "baseUrl")]
    base_url: Option<String>,
    #[serde(default)]
    paths: BTreeMap<String, Vec<String>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `specifier` as imported from the file `from`.
    /// Returns the canonical path of the target file.
    pub fn resolve(&mut self, from: &Path, specifier: &str) -> Option<PathBuf> {
        let dir = from.parent().unwrap_or_else(|| Path::new("."));

        if specifier.starts_with("./") || specifier.starts_with("../") {
            return find_file(&dir.join(specifier));
        }

        let aliases = self.aliases_for(dir)?;
        let (prefix, suffix, targets) = best_match(&aliases.paths, specifier)?;
        let captured = &specifier[prefix.len()..specifier.len() - suffix.len()];
        targets.iter().find_map(|target| {
            let substituted = target.replacen('*', captured, 1);
            find_file(&aliases.base.join(substituted))
        })
    }

    fn aliases_for(&mut self, dir: &Path) -> Option<Arc<PathAliases>> {
        if let Some(cached) = self.configs.get(dir) {
            return cached.clone();
        }
        let found = dir
            .ancestors()
            .map(|d| d.join("tsconfig.json"))
            .find(|p| p.is_file())
            .and_then(|p| load_aliases(&p))
            .map(Arc::new);
        self.configs.insert(dir.to_path_buf(), found.clone());
        found
    }
}

fn load_aliases(path: &Path) -> Option<PathAliases> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Cannot read {}: {e}", path.display());
            return None;
        }
    };
    let config: TsConfig = match serde_json::from_str(&strip_jsonc(&raw)) {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring malformed {}: {e}", path.display());
            return None;
        }
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = match &config.compiler_options.base_url {
        Some(url) => dir.join(url),
        None => dir.to_path_buf(),
    };
    debug!(
        "Loaded {} path aliases from {}",
        config.compiler_options.paths.len(),
        path.display()
    );
    Some(PathAliases {
        base,
        paths: config.compiler_options.paths.into_iter().collect(),
    })
}

/// Picks the alias pattern with the longest literal prefix that matches.
fn best_match<'p>(paths: &'p [(String, Vec<String>)], specifier: &str) -> Option<(&'p str, &'p str, &'p [String])> {
    let mut best: Option<(&str, &str, &[String])> = None;
    for (pattern, targets) in paths {
        let (prefix, suffix) = match pattern.split_once('*') {
            Some((prefix, suffix)) => (prefix, suffix),
            None if pattern == specifier => (pattern.as_str(), ""),
            None => continue,
        };
        let matches = specifier.len() >= prefix.len() + suffix.len()
            && specifier.starts_with(prefix)
            && specifier.ends_with(suffix);
        if matches && best.map_or(true, |(p, _, _)| prefix.len() > p.len()) {
            best = Some((prefix, suffix, targets.as_slice()));
        }
    }
    best
}

fn find_file(base: &Path) -> Option<PathBuf> {
    let raw = base.to_string_lossy();
    for suffix in CANDIDATE_SUFFIXES {
        let candidate = PathBuf::from(format!("{raw}{suffix}"));
        if candidate.is_file() {
            return candidate.canonicalize().ok();
        }
    }
    // `./util.js` written against a `util.ts` source
    if let Some(stem) = raw.strip_suffix(".js") {
        let candidate = PathBuf::from(format!("{stem}.ts"));
        if candidate.is_file() {
            return candidate.canonicalize().ok();
        }
    }
    None
}

/// Removes `//` and `/* */` comments and trailing commas from a JSONC document.
fn strip_jsonc(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i += 2;
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}
