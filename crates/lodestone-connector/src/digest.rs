//! Streaming digest computation and verification
//!
//! Pure functions, no network I/O. Digests are computed incrementally
//! over streamed chunks so artifacts are never buffered whole in
//! memory. Verification passes when *any* supplied algorithm matches,
//! since repositories may publish only one.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Supported checksum algorithms, named after their sidecar extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Md5,
}

impl Algorithm {
    /// Sidecar probing order: strongest first among the commonly
    /// published ones.
    pub const ALL: [Algorithm; 3] = [Algorithm::Sha1, Algorithm::Sha256, Algorithm::Md5];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Md5 => "md5",
        }
    }

    /// Extension of the sidecar resource, without the leading dot.
    pub fn file_extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Some(Algorithm::Sha1),
            "sha256" | "sha-256" => Some(Algorithm::Sha256),
            "md5" => Some(Algorithm::Md5),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed checksum comparison. `expected` is `None` when the
/// repository required verification but published no digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumFailure {
    pub algorithm: Algorithm,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl ChecksumFailure {
    pub(crate) fn unavailable() -> Self {
        Self {
            algorithm: Algorithm::Sha1,
            expected: None,
            actual: None,
        }
    }
}

impl fmt::Display for ChecksumFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Checksum mismatch ({}): expected {}, actual {}",
            self.algorithm,
            self.expected.as_deref().unwrap_or("<none>"),
            self.actual.as_deref().unwrap_or("<none>"),
        )
    }
}

impl std::error::Error for ChecksumFailure {}

/// Incremental multi-algorithm hasher.
pub struct Digester {
    sha1: Option<Sha1>,
    sha256: Option<Sha256>,
    md5: Option<Md5>,
}

impl Digester {
    /// Hash only the requested algorithms.
    pub fn new(algorithms: &[Algorithm]) -> Self {
        Self {
            sha1: algorithms
                .contains(&Algorithm::Sha1)
                .then(Sha1::new),
            sha256: algorithms
                .contains(&Algorithm::Sha256)
                .then(Sha256::new),
            md5: algorithms.contains(&Algorithm::Md5).then(Md5::new),
        }
    }

    /// Hash every supported algorithm.
    pub fn all() -> Self {
        Self::new(&Algorithm::ALL)
    }

    pub fn update(&mut self, chunk: &[u8]) {
        if let Some(h) = &mut self.sha1 {
            h.update(chunk);
        }
        if let Some(h) = &mut self.sha256 {
            h.update(chunk);
        }
        if let Some(h) = &mut self.md5 {
            h.update(chunk);
        }
    }

    /// Finish hashing, yielding lowercase hex per algorithm.
    pub fn finish(self) -> HashMap<Algorithm, String> {
        let mut digests = HashMap::new();
        if let Some(h) = self.sha1 {
            digests.insert(Algorithm::Sha1, hex::encode(h.finalize()));
        }
        if let Some(h) = self.sha256 {
            digests.insert(Algorithm::Sha256, hex::encode(h.finalize()));
        }
        if let Some(h) = self.md5 {
            digests.insert(Algorithm::Md5, hex::encode(h.finalize()));
        }
        digests
    }

    /// Stream a file through the digester in fixed-size chunks.
    pub fn digest_file(
        path: &Path,
        algorithms: &[Algorithm],
    ) -> std::io::Result<HashMap<Algorithm, String>> {
        let mut digester = Self::new(algorithms);
        let mut file = std::fs::File::open(path)?;
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            digester.update(&buffer[..read]);
        }
        Ok(digester.finish())
    }
}

fn normalize(digest: &str) -> String {
    digest.trim().to_ascii_lowercase()
}

/// Compare computed digests against expected ones. Passes if any
/// expected algorithm matches; an empty expected set passes (the
/// policy gate lives with the caller).
pub fn verify(
    actual: &HashMap<Algorithm, String>,
    expected: &HashMap<Algorithm, String>,
) -> std::result::Result<(), ChecksumFailure> {
    let mut failure: Option<ChecksumFailure> = None;
    for (algorithm, want) in expected {
        match actual.get(algorithm) {
            Some(got) if normalize(got) == normalize(want) => return Ok(()),
            got => {
                if failure.is_none() {
                    failure = Some(ChecksumFailure {
                        algorithm: *algorithm,
                        expected: Some(normalize(want)),
                        actual: got.map(|g| normalize(g)),
                    });
                }
            }
        }
    }
    match failure {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

/// Extract the hex digest from a sidecar body. Sidecars commonly hold
/// either the bare hex string or `<hex>  <filename>`.
pub fn parse_sidecar(content: &str) -> Option<String> {
    let token = content.split_whitespace().next()?;
    let token = normalize(token);
    if !token.is_empty() && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(token)
    } else {
        None
    }
}
