pub mod bundle;
pub mod lexer;
pub mod link;
pub mod minify;
pub mod resolve;
pub mod strip;

use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use self::bundle::Bundler;

/// Identifies how `Digest` values are computed. Bump when the compression
/// format or hash changes, since every artifact name changes with it.
pub const DIGEST_SCHEME: &str = "gzip+sha256/v1";

/// Minimum size of the capability's own code after transformation.
/// Anything shorter means the source produced nothing executable.
pub const MIN_OUTPUT_LEN: usize = 16;

/// Upper bound on an inflated script, checked when restoring an artifact.
pub const MAX_SCRIPT_LEN: u64 = 16 * 1024 * 1024;

/// Name under which the bundle is reported by the engine syntax check.
pub const BUNDLE_NAME: &str = "capability.js";

// ── Diagnostics ─────────────────────────────────────────

/// A source-located compile error: `file:line:col: message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn new(file: &str, line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            file: file.to_string(),
            line,
            column,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}: {}", self.file, self.line, self.column, self.message)
    }
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("unsupported source kind: {} (only .js and .ts are supported)", .0.display())]
    UnsupportedSourceKind(PathBuf),

    #[error("compilation failed:\n{}", render_diagnostics(.0))]
    CompileFailure(Vec<Diagnostic>),

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ── Digest ──────────────────────────────────────────────

/// SHA-256 of a compressed script. Cache key and distribution identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// `data-<hex>`: the artifact name, derived from the digest only.
    pub fn artifact_name(&self) -> String {
        format!("data-{}", self.to_hex())
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

// ── Compression ─────────────────────────────────────────

/// Gzips `code` with a fixed header (no file name, mtime 0) so that identical
/// input always produces identical bytes, and digests the result.
pub fn compress(code: &str) -> (Vec<u8>, Digest) {
    let mut encoder: GzEncoder<Vec<u8>> = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail
    let compressed = encoder
        .write_all(code.as_bytes())
        .and_then(|_| encoder.finish())
        .unwrap_or_default();
    let digest = Digest::of(&compressed);
    (compressed, digest)
}

/// Inflates `compressed`, failing once the output would exceed `MAX_SCRIPT_LEN`.
pub fn decompress(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    inflate(compressed, MAX_SCRIPT_LEN)
}

fn inflate(compressed: &[u8], limit: u64) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(compressed).take(limit + 1).read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("script inflates beyond {limit} bytes"),
        ));
    }
    Ok(out)
}

// ── Packaged script ─────────────────────────────────────

/// The build output: executable script, its gzip form and content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedScript {
    pub code: String,
    pub compressed: Vec<u8>,
    pub digest: Digest,
}

impl PackagedScript {
    pub fn from_code(code: String) -> Self {
        let (compressed, digest) = compress(&code);
        Self {
            code,
            compressed,
            digest,
        }
    }

    /// Rebuilds a script from its compressed form (e.g. a distribution artifact).
    pub fn from_compressed(compressed: Vec<u8>) -> std::io::Result<Self> {
        let bytes = decompress(&compressed)?;
        let code = String::from_utf8(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let digest = Digest::of(&compressed);
        Ok(Self {
            code,
            compressed,
            digest,
        })
    }
}

// ── Packager ────────────────────────────────────────────

/// Builds a `PackagedScript` from a capability entry file.
#[derive(Debug, Clone, Default)]
pub struct Packager;

impl Packager {
    pub fn new() -> Self {
        Self
    }

    pub fn package(&self, source_path: &Path) -> Result<PackagedScript, PackageError> {
        check_source_kind(source_path)?;
        let started = Instant::now();

        let bundle = Bundler::new(source_path).bundle(source_path)?;
        if bundle.module_code_len < MIN_OUTPUT_LEN {
            return Err(PackageError::CompileFailure(vec![Diagnostic::new(
                &source_path.to_string_lossy(),
                1,
                1,
                format!(
                    "capability produced only {} bytes of code (minimum {MIN_OUTPUT_LEN})",
                    bundle.module_code_len
                ),
            )]));
        }

        // The bundle must load as a module in the runtime engine
        if let Err(message) = crate::sandbox::check_syntax(&bundle.code) {
            return Err(PackageError::CompileFailure(vec![Diagnostic::new(
                BUNDLE_NAME,
                1,
                1,
                message,
            )]));
        }

        let script = PackagedScript::from_code(bundle.code);
        debug!(
            "Bundled {} modules: {} bytes, {} compressed",
            bundle.module_count,
            script.code.len(),
            script.compressed.len()
        );
        info!(
            path = %source_path.display(),
            digest = %script.digest.short(),
            "Packaged capability in {:?}",
            started.elapsed()
        );
        Ok(script)
    }
}

fn check_source_kind(path: &Path) -> Result<(), PackageError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ts" | "js") => Ok(()),
        _ => Err(PackageError::UnsupportedSourceKind(path.to_path_buf())),
    }
}
