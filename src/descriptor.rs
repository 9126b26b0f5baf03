//! Content descriptors and checksum validation
//!
//! A [`ContentDescriptor`] is the immutable description of one downloadable
//! unit, produced by a provider collaborator. The pipeline derives the target
//! file name from it and validates the finished file against its declared
//! size and checksum.

use crate::error::{Error, Result};
use crate::types::ContentType;
use crate::utils::{DEFAULT_MAX_FILENAME_LEN, sanitize_file_name};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read buffer used when hashing files
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Digest algorithm of a declared checksum
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// MD5 (default)
    #[default]
    Md5,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl ChecksumAlgorithm {
    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha224 => "sha224",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha384 => "sha384",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha224 => Hasher::Sha224(sha2::Sha224::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha224" => Ok(ChecksumAlgorithm::Sha224),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha384" => Ok(ChecksumAlgorithm::Sha384),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(Error::config(
                "checksum_algorithm",
                format!("unsupported checksum algorithm '{other}'"),
            )),
        }
    }
}

impl<'de> Deserialize<'de> for ChecksumAlgorithm {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

enum Hasher {
    Md5(md5::Context),
    Sha224(sha2::Sha224),
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.consume(data),
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finish_hex(self) -> String {
        match self {
            Hasher::Md5(h) => format!("{:x}", h.compute()),
            Hasher::Sha224(h) => format!("{:x}", h.finalize()),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
            Hasher::Sha384(h) => format!("{:x}", h.finalize()),
            Hasher::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Hex digest of a byte slice
pub fn checksum_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finish_hex()
}

/// Hex digest of a file, read on the blocking pool
pub async fn checksum_file(algorithm: ChecksumAlgorithm, path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = algorithm.hasher();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish_hex())
    })
    .await
    .map_err(|e| Error::download("checksum task", e))?
}

/// Immutable description of one downloadable unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    /// Provider-assigned content id
    pub id: String,

    /// Kind of content
    #[serde(default)]
    pub content_type: ContentType,

    /// Logical source key (selects session and behavior overrides)
    pub source: String,

    /// Display title
    #[serde(default)]
    pub title: String,

    /// Display artist
    #[serde(default)]
    pub artist: Option<String>,

    /// Display album
    #[serde(default)]
    pub album: Option<String>,

    /// Where to fetch the body from
    pub url: String,

    /// Target file name without extension
    pub file_name: String,

    /// Target file extension, with or without a leading dot
    #[serde(default)]
    pub file_extension: String,

    /// Declared body length in bytes
    #[serde(default)]
    pub expected_size_bytes: Option<u64>,

    /// Declared hex digest
    #[serde(default)]
    pub checksum: Option<String>,

    /// Algorithm of [`checksum`](Self::checksum)
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Quality tier label (e.g. "lossless")
    #[serde(default)]
    pub quality: Option<String>,

    /// Container format (e.g. "flac")
    #[serde(default)]
    pub format: Option<String>,

    /// Bitrate in kbps
    #[serde(default)]
    pub bitrate: Option<u32>,

    /// Free-form provider data
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ContentDescriptor {
    /// Create a descriptor with the required fields; everything else is empty
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        url: impl Into<String>,
        file_name: impl Into<String>,
        file_extension: impl Into<String>,
    ) -> Self {
        let file_name = file_name.into();
        Self {
            id: id.into(),
            content_type: ContentType::default(),
            source: source.into(),
            title: file_name.clone(),
            artist: None,
            album: None,
            url: url.into(),
            file_name,
            file_extension: file_extension.into(),
            expected_size_bytes: None,
            checksum: None,
            checksum_algorithm: ChecksumAlgorithm::default(),
            quality: None,
            format: None,
            bitrate: None,
            metadata: HashMap::new(),
        }
    }

    /// Builder: set the content type
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Builder: declare the expected body length
    pub fn with_expected_size(mut self, bytes: u64) -> Self {
        self.expected_size_bytes = Some(bytes);
        self
    }

    /// Builder: declare a checksum
    pub fn with_checksum(mut self, algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Self {
        self.checksum_algorithm = algorithm;
        self.checksum = Some(hex.into());
        self
    }

    /// File name joined with the extension
    ///
    /// A leading dot on the extension is normalized, so `"flac"` and `".flac"`
    /// produce the same result. An empty extension yields the bare name.
    ///
    /// ```
    /// use ripstream_dl::descriptor::ContentDescriptor;
    ///
    /// let d = ContentDescriptor::new("1", "qobuz", "https://x/1", "01 Intro", ".flac");
    /// assert_eq!(d.full_file_name(), "01 Intro.flac");
    /// ```
    pub fn full_file_name(&self) -> String {
        let ext = self.file_extension.trim_start_matches('.');
        if ext.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}.{}", self.file_name, ext)
        }
    }

    /// Filesystem-safe file name, with the stem capped at `max_len` characters
    ///
    /// The extension is sanitized separately and never truncated away.
    pub fn safe_file_name(&self, max_len: usize) -> String {
        let stem = sanitize_file_name(&self.file_name, max_len);
        let ext = sanitize_file_name(
            self.file_extension.trim_start_matches('.'),
            DEFAULT_MAX_FILENAME_LEN,
        );
        let stem = if stem.trim().is_empty() {
            "untitled".to_string()
        } else {
            stem
        };
        if ext.is_empty() {
            stem
        } else {
            format!("{stem}.{ext}")
        }
    }

    /// Target path of this descriptor inside `dir`
    pub fn target_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.safe_file_name(DEFAULT_MAX_FILENAME_LEN))
    }

    /// "artist - title" when the artist is known, otherwise the title
    pub fn display_name(&self) -> String {
        match &self.artist {
            Some(artist) if !artist.is_empty() => format!("{} - {}", artist, self.title),
            _ => self.title.clone(),
        }
    }

    /// Reject descriptors that cannot possibly be downloaded
    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| Error::config("url", format!("invalid URL '{}': {e}", self.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::config(
                "url",
                format!("unsupported URL scheme '{}'", parsed.scheme()),
            ));
        }
        if self.file_name.trim().is_empty() {
            return Err(Error::config("file_name", "must not be empty"));
        }
        Ok(())
    }

    /// Whether the file at `path` hashes to the declared checksum
    ///
    /// Never fails: a missing declaration, an unreadable file or a mismatch
    /// all yield `false`. Hex case is ignored.
    pub async fn validate_checksum(&self, path: &Path) -> bool {
        let Some(expected) = &self.checksum else {
            return false;
        };
        match checksum_file(self.checksum_algorithm, path).await {
            Ok(actual) => actual.eq_ignore_ascii_case(expected.trim()),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Checksum computation failed");
                false
            }
        }
    }
}
