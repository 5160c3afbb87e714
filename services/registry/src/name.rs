//! Repository names, references and content digests.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use sha2::Digest as _;

/// Longest repository name accepted, including the tenant slug.
pub const MAX_NAME_LENGTH: usize = 255;

static TENANT_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:-+[a-z0-9]+)*$").expect("valid regex"));

static PATH_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("valid regex")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("valid regex"));

static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]+(?:[.+_-][a-z0-9]+)*):([a-zA-Z0-9=_-]+)$").expect("valid regex")
});

/// A name, reference or digest failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// Malformed `tenant/artifact` repository name.
    #[error("invalid repository name: {0}")]
    Repository(String),

    /// Malformed or unsupported content digest.
    #[error("invalid digest: {0}")]
    Digest(String),

    /// Malformed tag.
    #[error("invalid tag: {0}")]
    Tag(String),
}

/// A repository name: `<tenant-slug>/<artifact-name>`.
///
/// The artifact name may itself contain slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryName {
    tenant: String,
    artifact: String,
}

impl RepositoryName {
    /// Parse and validate a repository name.
    pub fn parse(name: &str) -> Result<Self, NameError> {
        let invalid = || NameError::Repository(name.to_owned());

        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(invalid());
        }

        let (tenant, artifact) = name.split_once('/').ok_or_else(invalid)?;
        if !TENANT_SLUG.is_match(tenant) {
            return Err(invalid());
        }
        if !artifact.split('/').all(|c| PATH_COMPONENT.is_match(c)) {
            return Err(invalid());
        }

        Ok(Self {
            tenant: tenant.to_owned(),
            artifact: artifact.to_owned(),
        })
    }

    /// The tenant (organization) slug.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The artifact name within the tenant.
    pub fn artifact(&self) -> &str {
        &self.artifact
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.artifact)
    }
}

impl FromStr for RepositoryName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Digest algorithms the registry can verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// SHA-256, the canonical algorithm.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Algorithm::Sha256),
            "sha384" => Some(Algorithm::Sha384),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }

    /// Name as it appears in a digest string.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha384 => 96,
            Algorithm::Sha512 => 128,
        }
    }

    fn hash(&self, data: &[u8]) -> String {
        match self {
            Algorithm::Sha256 => hex::encode(sha2::Sha256::digest(data)),
            Algorithm::Sha384 => hex::encode(sha2::Sha384::digest(data)),
            Algorithm::Sha512 => hex::encode(sha2::Sha512::digest(data)),
        }
    }
}

/// A validated content digest, e.g. `sha256:<64 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(digest: &str) -> Result<Self, NameError> {
        let invalid = || NameError::Digest(digest.to_owned());

        let captures = DIGEST.captures(digest).ok_or_else(invalid)?;
        let algorithm = Algorithm::from_name(&captures[1]).ok_or_else(invalid)?;
        let encoded = &captures[2];
        if encoded.len() != algorithm.encoded_len()
            || !encoded.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(invalid());
        }

        Ok(Self(digest.to_owned()))
    }

    /// The sha256 digest of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        Self::compute(Algorithm::Sha256, data)
    }

    /// The digest of `data` under `algorithm`.
    pub fn compute(algorithm: Algorithm, data: &[u8]) -> Self {
        Self(format!("{}:{}", algorithm.name(), algorithm.hash(data)))
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.0
            .split_once(':')
            .and_then(|(name, _)| Algorithm::from_name(name))
            .unwrap_or(Algorithm::Sha256)
    }

    /// The hex encoded hash.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or_default()
    }

    /// Whether `data` hashes to this digest.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(self.algorithm(), data) == *self
    }

    /// The digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A manifest reference: either a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A mutable, human chosen name.
    Tag(String),
    /// An immutable content digest.
    Digest(Digest),
}

impl Reference {
    /// Classify a reference string.
    ///
    /// Anything containing a colon must be a valid digest; tags never contain one.
    pub fn parse(reference: &str) -> Result<Self, NameError> {
        if reference.contains(':') {
            return Digest::parse(reference).map(Reference::Digest);
        }

        if TAG.is_match(reference) {
            Ok(Reference::Tag(reference.to_owned()))
        } else {
            Err(NameError::Tag(reference.to_owned()))
        }
    }

    /// The reference as it appears in a URL.
    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(tag) => tag,
            Reference::Digest(digest) => digest.as_str(),
        }
    }

    /// Whether this is a digest reference.
    pub fn is_digest(&self) -> bool {
        matches!(self, Reference::Digest(_))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a stored version name is a tag rather than a canonical digest name.
pub fn is_tag_name(name: &str) -> bool {
    !name.contains(':')
}
