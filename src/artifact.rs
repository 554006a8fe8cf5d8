//! Distribution artifact: the compressed script plus its digest.
//!
//! On disk an artifact is a directory with three files:
//!
//! ```text
//! hash   raw SHA-256 of `data` (32 bytes)
//! sig    reserved, always empty
//! data   gzip of the bundled script
//! ```
//!
//! The same three fields are published as an `Opaque` Secret named
//! `data-<hex digest>`, which the webhook deployment mounts as that
//! directory.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::packager::{Digest, PackagedScript, DIGEST_SCHEME};

pub const NAMESPACE: &str = "capgate-system";

const HASH_FILE: &str = "hash";
const SIG_FILE: &str = "sig";
const DATA_FILE: &str = "data";

const DIGEST_SCHEME_ANNOTATION: &str = "capgate.io/digest-scheme";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact file missing: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("artifact integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("artifact hash must be 32 bytes, got {0}")]
    MalformedHash(usize),

    #[error("artifact data is not a valid compressed script: {0}")]
    CorruptData(#[source] io::Error),

    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot render manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub hash: Digest,
    pub sig: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SecretManifest<'a> {
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata<'a>,
    #[serde(rename = "type")]
    secret_type: &'static str,
    data: BTreeMap<&'static str, String>,
}

#[derive(Serialize)]
struct Metadata<'a> {
    name: &'a str,
    namespace: &'static str,
    annotations: BTreeMap<&'static str, &'static str>,
}

impl Artifact {
    pub fn from_script(script: &PackagedScript) -> Self {
        Self {
            name: script.digest.artifact_name(),
            hash: script.digest,
            sig: Vec::new(),
            data: script.compressed.clone(),
        }
    }

    /// Renders the artifact as a Kubernetes Secret manifest.
    pub fn to_manifest(&self) -> Result<String, ArtifactError> {
        let data = BTreeMap::from([
            (HASH_FILE, STANDARD.encode(self.hash.as_bytes())),
            (SIG_FILE, STANDARD.encode(&self.sig)),
            (DATA_FILE, STANDARD.encode(&self.data)),
        ]);
        let manifest = SecretManifest {
            api_version: "v1",
            kind: "Secret",
            metadata: Metadata {
                name: &self.name,
                namespace: NAMESPACE,
                annotations: BTreeMap::from([(DIGEST_SCHEME_ANNOTATION, DIGEST_SCHEME)]),
            },
            secret_type: "Opaque",
            data,
        };
        Ok(serde_yaml::to_string(&manifest)?)
    }

    pub fn write_dir(&self, dir: &Path) -> Result<(), ArtifactError> {
        fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for (file, bytes) in [
            (HASH_FILE, self.hash.as_bytes().as_slice()),
            (SIG_FILE, self.sig.as_slice()),
            (DATA_FILE, self.data.as_slice()),
        ] {
            let path = dir.join(file);
            fs::write(&path, bytes).map_err(|source| ArtifactError::Io { path, source })?;
        }
        debug!(name = %self.name, dir = %dir.display(), "Wrote artifact");
        Ok(())
    }

    /// Reads an artifact directory and verifies `sha256(data) == hash`.
    pub fn read_dir(dir: &Path) -> Result<Self, ArtifactError> {
        let hash = read_required(&dir.join(HASH_FILE))?;
        let data = read_required(&dir.join(DATA_FILE))?;
        let sig = match fs::read(dir.join(SIG_FILE)) {
            Ok(sig) => sig,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(ArtifactError::Io {
                    path: dir.join(SIG_FILE),
                    source,
                })
            }
        };

        let expected = Digest::from_slice(&hash).ok_or(ArtifactError::MalformedHash(hash.len()))?;
        let actual = Digest::of(&data);
        if actual != expected {
            return Err(ArtifactError::IntegrityMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }

        if !sig.is_empty() {
            warn!(name = %expected.artifact_name(), "Artifact signature present but signatures are not verified, ignoring");
        }

        Ok(Self {
            name: expected.artifact_name(),
            hash: expected,
            sig,
            data,
        })
    }

    pub fn into_script(self) -> Result<PackagedScript, ArtifactError> {
        PackagedScript::from_compressed(self.data).map_err(ArtifactError::CorruptData)
    }
}

/// Reads and verifies the artifact in `dir` and returns its script.
pub fn load(dir: &Path) -> Result<PackagedScript, ArtifactError> {
    let artifact = Artifact::read_dir(dir)?;
    let name = artifact.name.clone();
    let script = artifact.into_script()?;
    info!(name = %name, "Loaded artifact ({} bytes of code)", script.code.len());
    Ok(script)
}

fn read_required(path: &Path) -> Result<Vec<u8>, ArtifactError> {
    fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => ArtifactError::MissingArtifact(path.to_path_buf()),
        _ => ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}
