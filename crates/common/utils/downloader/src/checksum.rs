// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use snafu::{ResultExt, Snafu, ensure};
use strum_macros::{Display, EnumString};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ChecksumError {
    #[snafu(display("unsupported checksum algorithm '{algorithm}'"))]
    UnsupportedAlgorithm { algorithm: String },

    #[snafu(display("File read error at {}: {source}", path.display()))]
    Read {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{algorithm} mismatch: expected {expected}, got {actual}"))]
    Mismatch {
        algorithm: ChecksumAlgorithm,
        expected:  String,
        actual:    String,
    },

    #[snafu(display("checksum computation cancelled"))]
    Cancelled,

    #[snafu(display("checksum task failed: {source}"))]
    HashTask { source: tokio::task::JoinError },
}

/// Expected digest of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// Algorithm name, e.g. `sha1` or `sha256`
    pub algorithm: String,
    /// Hex digest; compared case-insensitively
    pub hash:      String,
}

impl Checksum {
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash:      hash.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
    Sha512,
    Md5,
}

impl ChecksumAlgorithm {
    /// Accepts names like `sha1`, `SHA-256` or `sha_512`.
    pub fn from_name(name: &str) -> Result<Self, ChecksumError> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        normalized.parse().map_err(|_| {
            UnsupportedAlgorithmSnafu {
                algorithm: name.to_string(),
            }
            .build()
        })
    }

    /// Lowercase hex digest of an in-memory buffer.
    pub fn digest_hex(self, data: &[u8]) -> String {
        let mut hasher = Hasher::new(self);
        hasher.update(data);
        hasher.finalize_hex()
    }
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
    Md5(Md5),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
            ChecksumAlgorithm::Md5 => Self::Md5(Md5::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Md5(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

/// Stream `path` through the checksum's algorithm and compare with the
/// expected hash.
///
/// Reads happen on the blocking pool in `buffer_size` chunks; cancellation is
/// observed between chunks. Returns the computed lowercase hex digest.
pub async fn verify_file(
    path: &Path,
    checksum: &Checksum,
    buffer_size: usize,
    cancel: CancellationToken,
) -> Result<String, ChecksumError> {
    let algorithm = ChecksumAlgorithm::from_name(&checksum.algorithm)?;
    let owned_path = path.to_path_buf();

    let actual = tokio::task::spawn_blocking(move || {
        digest_file(&owned_path, algorithm, buffer_size, &cancel)
    })
    .await
    .context(HashTaskSnafu)??;

    let expected = checksum.hash.trim();
    ensure!(
        actual.eq_ignore_ascii_case(expected),
        MismatchSnafu {
            algorithm,
            expected,
            actual: actual.clone(),
        }
    );
    Ok(actual)
}

fn digest_file(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<String, ChecksumError> {
    let mut file = File::open(path).context(ReadSnafu { path })?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; buffer_size.max(1)];

    loop {
        ensure!(!cancel.is_cancelled(), CancelledSnafu);
        let read = file.read(&mut buffer).context(ReadSnafu { path })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize_hex())
}
