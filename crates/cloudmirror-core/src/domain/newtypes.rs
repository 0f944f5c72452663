//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for identifiers and values shared by every
//! component. Each newtype validates (and where needed normalizes) its
//! input at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UUID-based ID types
// ============================================================================

/// Identifier for File entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// Create a new random FileId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid FileId: {e}")))
    }
}

/// Identifier for Replica entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Create a new random ReplicaId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid ReplicaId: {e}")))
    }
}

/// Identifier for ReplicaFragment entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(Uuid);

impl FragmentId {
    /// Create a new random FragmentId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FragmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for FragmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FragmentId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid FragmentId: {e}")))
    }
}

// ============================================================================
// Provider and account identity
// ============================================================================

/// Name of a storage provider family ("google", "microsoft", ...)
///
/// Always lowercase ASCII alphanumerics, `-` or `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a validated provider identifier
    pub fn new(value: impl AsRef<str>) -> Result<Self, DomainError> {
        let value = value.as_ref().trim().to_ascii_lowercase();
        if value.is_empty()
            || !value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DomainError::InvalidProvider(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProviderId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProviderId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProviderId> for String {
    fn from(value: ProviderId) -> Self {
        value.0
    }
}

/// Provider-scoped user identifier (an email address or phone number)
///
/// Compared case-insensitively: the stored form is trimmed and lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    /// Create a normalized account identifier
    pub fn new(value: impl AsRef<str>) -> Result<Self, DomainError> {
        let value = value.as_ref().trim().to_lowercase();
        if value.is_empty() || value.contains(['/', '\\']) || value.chars().any(char::is_control)
        {
            return Err(DomainError::InvalidAccount(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AccountId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

/// A (provider, account) pair, the unit of scanning and quota accounting
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub provider: ProviderId,
    pub account: AccountId,
}

impl AccountKey {
    #[must_use]
    pub fn new(provider: ProviderId, account: AccountId) -> Self {
        Self { provider, account }
    }

    /// Convenience constructor validating both halves
    pub fn parse(provider: &str, account: &str) -> Result<Self, DomainError> {
        Ok(Self::new(ProviderId::new(provider)?, AccountId::new(account)?))
    }
}

impl Display for AccountKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.account)
    }
}

// ============================================================================
// Content identity
// ============================================================================

/// Cheap identity derived from a file's name and size
///
/// Two Files with the same CalculatedId are duplicate candidates; the
/// content hash decides whether they really are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalculatedId(String);

impl CalculatedId {
    /// Derive the identity from a name and a size in bytes
    #[must_use]
    pub fn from_parts(name: &str, size: u64) -> Self {
        Self(format!("{name}{size}"))
    }

    /// Wrap a previously persisted value
    #[must_use]
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CalculatedId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized path relative to an account's sync root
///
/// Separators are unified to `/`, empty and `.` segments are dropped and
/// `..` is rejected. The root is the empty path. Paths keep their case
/// for display; [`LogicalPath::comparison_key`] is used for equality
/// across providers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalPath(String);

impl LogicalPath {
    /// Create a normalized path
    pub fn new(raw: impl AsRef<str>) -> Result<Self, DomainError> {
        let raw = raw.as_ref();
        let mut segments = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => return Err(DomainError::InvalidPath(raw.to_string())),
                s if s.chars().any(char::is_control) => {
                    return Err(DomainError::InvalidPath(raw.to_string()))
                }
                s => segments.push(s),
            }
        }
        Ok(Self(segments.join("/")))
    }

    /// The sync root itself
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment, empty for the root
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Containing folder; the root is its own parent
    #[must_use]
    pub fn parent(&self) -> Self {
        match self.0.rfind('/') {
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self::root(),
        }
    }

    /// Append a single child segment
    pub fn join(&self, name: &str) -> Result<Self, DomainError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(DomainError::InvalidPath(name.to_string()));
        }
        if self.is_root() {
            Self::new(name)
        } else {
            Self::new(format!("{}/{}", self.0, name))
        }
    }

    /// Same folder, different last segment
    pub fn with_file_name(&self, name: &str) -> Result<Self, DomainError> {
        self.parent().join(name)
    }

    /// Iterate over the path segments from the root down
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Case-insensitive key used to match paths across providers
    #[must_use]
    pub fn comparison_key(&self) -> String {
        self.0.to_lowercase()
    }
}

impl Display for LogicalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl TryFrom<String> for LogicalPath {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LogicalPath> for String {
    fn from(value: LogicalPath) -> Self {
        value.0
    }
}

/// Hash algorithm families reported by providers or computed locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha1,
    Md5,
    QuickXor,
}

impl HashAlgorithm {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha1 => "sha1",
            Self::Md5 => "md5",
            Self::QuickXor => "quickxor",
        }
    }

    /// Expected hex length for hex-encoded digests
    fn hex_len(&self) -> Option<usize> {
        match self {
            Self::Sha256 => Some(64),
            Self::Sha1 => Some(40),
            Self::Md5 => Some(32),
            Self::QuickXor => None,
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha1" => Ok(Self::Sha1),
            "md5" => Ok(Self::Md5),
            "quickxor" => Ok(Self::QuickXor),
            other => Err(DomainError::InvalidHash(other.to_string())),
        }
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content digest tagged with its algorithm
///
/// Persisted as `algorithm:value`. Two hashes are only comparable when
/// their algorithms match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    value: String,
}

impl ContentHash {
    /// Create a validated hash value
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let value = value.trim();
        if value.is_empty() {
            return Err(DomainError::InvalidHash(format!("{algorithm}: empty digest")));
        }
        let value = match algorithm.hex_len() {
            Some(len) => {
                if value.len() != len || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(DomainError::InvalidHash(format!("{algorithm}:{value}")));
                }
                value.to_ascii_lowercase()
            }
            None => value.to_string(),
        };
        Ok(Self { algorithm, value })
    }

    /// Parse the persisted `algorithm:value` form
    pub fn parse(tagged: &str) -> Result<Self, DomainError> {
        let (algorithm, value) = tagged
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidHash(tagged.to_string()))?;
        Self::new(algorithm.parse()?, value)
    }

    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// `Some(equal)` when both hashes use the same algorithm, `None` otherwise
    #[must_use]
    pub fn same_content(&self, other: &ContentHash) -> Option<bool> {
        (self.algorithm == other.algorithm).then(|| self.value == other.value)
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_file_id_roundtrip() {
        let id = FileId::new();
        let parsed: FileId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ReplicaId>().is_err());
    }

    #[test]
    fn test_provider_id_normalizes_case() {
        let p = ProviderId::new(" Google ").unwrap();
        assert_eq!(p.as_str(), "google");
        assert!(ProviderId::new("").is_err());
        assert!(ProviderId::new("one drive").is_err());
    }

    #[test]
    fn test_account_id_case_insensitive() {
        let a = AccountId::new("Alice@Example.com").unwrap();
        let b = AccountId::new("alice@example.com").unwrap();
        assert_eq!(a, b);
        assert!(AccountId::new("  ").is_err());
        assert!(AccountId::new("a/b").is_err());
    }

    #[test]
    fn test_account_key_display() {
        let key = AccountKey::parse("google", "a@x.com").unwrap();
        assert_eq!(key.to_string(), "google/a@x.com");
    }

    #[test]
    fn test_calculated_id_concatenates_name_and_size() {
        assert_eq!(
            CalculatedId::from_parts("report.txt", 500).as_str(),
            "report.txt500"
        );
    }

    #[test]
    fn test_logical_path_normalization() {
        let p = LogicalPath::new("\\docs//./2024/report.txt").unwrap();
        assert_eq!(p.as_str(), "docs/2024/report.txt");
        assert_eq!(p.file_name(), "report.txt");
        assert_eq!(p.parent().as_str(), "docs/2024");
        assert_eq!(p.segments().count(), 3);
        assert!(LogicalPath::new("docs/../etc").is_err());
    }

    #[test]
    fn test_logical_path_root() {
        let root = LogicalPath::new("/").unwrap();
        assert!(root.is_root());
        assert_eq!(root.parent(), root);
        assert_eq!(root.to_string(), "/");
        assert_eq!(root.join("a.txt").unwrap().as_str(), "a.txt");
        assert!(root.join("a/b").is_err());
    }

    #[test]
    fn test_logical_path_comparison_key() {
        let a = LogicalPath::new("Docs/Report.TXT").unwrap();
        let b = LogicalPath::new("docs/report.txt").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.comparison_key(), b.comparison_key());
    }

    #[test]
    fn test_with_file_name() {
        let p = LogicalPath::new("a/b/report.txt").unwrap();
        assert_eq!(
            p.with_file_name("report (1).txt").unwrap().as_str(),
            "a/b/report (1).txt"
        );
    }

    #[test]
    fn test_content_hash_parse_and_display() {
        let h = ContentHash::parse(&format!("sha256:{}", SHA.to_uppercase())).unwrap();
        assert_eq!(h.algorithm(), HashAlgorithm::Sha256);
        assert_eq!(h.value(), SHA);
        assert_eq!(h.to_string(), format!("sha256:{SHA}"));
        assert!(ContentHash::parse("sha256:short").is_err());
        assert!(ContentHash::parse("crc32:abcd").is_err());
        assert!(ContentHash::parse("nocolon").is_err());
    }

    #[test]
    fn test_content_hash_comparability() {
        let a = ContentHash::new(HashAlgorithm::Sha256, SHA).unwrap();
        let b = ContentHash::new(HashAlgorithm::Sha256, SHA).unwrap();
        let md5 = ContentHash::new(HashAlgorithm::Md5, "d41d8cd98f00b204e9800998ecf8427e").unwrap();
        assert_eq!(a.same_content(&b), Some(true));
        assert_eq!(a.same_content(&md5), None);
        let qx = ContentHash::new(HashAlgorithm::QuickXor, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap();
        assert_eq!(qx.value(), "AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
    }
}
