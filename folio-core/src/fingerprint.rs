//! Cache keys.
//!
//! A [`Fingerprint`] addresses one cached query result: an [`EntityTag`]
//! followed by the ordered parameters that defined the query. Two
//! fingerprints share a prefix when their leading tags are equal, which is
//! the granularity invalidation works at.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

// ============================================================================
// ENTITY TAGS
// ============================================================================

/// Leading tag of every fingerprint.
///
/// Detail tags address a single record, list tags address collections that
/// may contain records of the matching detail tag, and aggregate tags address
/// derived numbers computed over other collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityTag {
    Books,
    Book,
    Borrows,
    BorrowRecord,
    Users,
    User,
    AccountRequests,
    Reviews,
    Review,
    Fines,
    Fine,
    AdminStats,
}

/// Shape of the data stored under a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    Detail,
    List,
    Aggregate,
}

impl EntityTag {
    /// Every tag, in declaration order.
    pub const ALL: [EntityTag; 12] = [
        EntityTag::Books,
        EntityTag::Book,
        EntityTag::Borrows,
        EntityTag::BorrowRecord,
        EntityTag::Users,
        EntityTag::User,
        EntityTag::AccountRequests,
        EntityTag::Reviews,
        EntityTag::Review,
        EntityTag::Fines,
        EntityTag::Fine,
        EntityTag::AdminStats,
    ];

    /// Wire name of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Books => "books",
            Self::Book => "book",
            Self::Borrows => "borrows",
            Self::BorrowRecord => "borrow-record",
            Self::Users => "users",
            Self::User => "user",
            Self::AccountRequests => "account-requests",
            Self::Reviews => "reviews",
            Self::Review => "review",
            Self::Fines => "fines",
            Self::Fine => "fine",
            Self::AdminStats => "admin-stats",
        }
    }

    pub fn kind(&self) -> TagKind {
        match self {
            Self::Book | Self::BorrowRecord | Self::User | Self::Review | Self::Fine => {
                TagKind::Detail
            }
            Self::Books
            | Self::Borrows
            | Self::Users
            | Self::AccountRequests
            | Self::Reviews
            | Self::Fines => TagKind::List,
            Self::AdminStats => TagKind::Aggregate,
        }
    }

    pub fn is_detail(&self) -> bool {
        self.kind() == TagKind::Detail
    }

    /// List tags whose entries embed records of this detail tag.
    ///
    /// Empty for list and aggregate tags.
    pub fn list_tags(&self) -> &'static [EntityTag] {
        match self {
            Self::Book => &[EntityTag::Books],
            Self::BorrowRecord => &[EntityTag::Borrows],
            Self::User => &[EntityTag::Users],
            Self::Review => &[EntityTag::Reviews],
            Self::Fine => &[EntityTag::Fines],
            _ => &[],
        }
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityTag {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        // "borrow" is what the UI calls a borrow-record mutation
        if normalized == "borrow" {
            return Ok(Self::BorrowRecord);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == normalized)
            .ok_or(ValidationError::UnknownEntity {
                name: s.to_string(),
            })
    }
}

// ============================================================================
// KEY PARTS
// ============================================================================

/// One parameter of a fingerprint.
///
/// Structured parameters (filter objects, arrays) are stored as their
/// canonical JSON text so that equal filters hash equally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl KeyPart {
    /// Convert a JSON scalar to a key part.
    ///
    /// Objects and arrays become their serialized text. `serde_json` keeps
    /// object keys sorted, so the text is stable for equal objects.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Str(n.to_string()),
            },
            Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Str(s) => Value::String(s.clone()),
        }
    }

    /// True if `value` is the JSON form of this key part.
    pub fn matches_json(&self, value: &Value) -> bool {
        &KeyPart::from_json(value) == self
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&Value> for KeyPart {
    fn from(value: &Value) -> Self {
        Self::from_json(value)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

// ============================================================================
// FINGERPRINT
// ============================================================================

/// Structured cache key: entity tag plus ordered parameters.
///
/// ```
/// use folio_core::{EntityTag, Fingerprint};
///
/// let search = Fingerprint::new(EntityTag::Books, ["dune"]);
/// assert!(search.has_prefix(EntityTag::Books));
/// assert_eq!(search.to_string(), r#"["books","dune"]"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    tag: EntityTag,
    params: Vec<KeyPart>,
}

impl Fingerprint {
    pub fn new<I, P>(tag: EntityTag, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        Self {
            tag,
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Fingerprint with no parameters, e.g. `["admin-stats"]`.
    pub fn of(tag: EntityTag) -> Self {
        Self {
            tag,
            params: Vec::new(),
        }
    }

    /// Fingerprint of a single record: `[tag, id]`.
    pub fn detail(tag: EntityTag, id: impl Into<KeyPart>) -> Self {
        Self {
            tag,
            params: vec![id.into()],
        }
    }

    /// Append a parameter.
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.params.push(part.into());
        self
    }

    pub fn tag(&self) -> EntityTag {
        self.tag
    }

    pub fn params(&self) -> &[KeyPart] {
        &self.params
    }

    /// Prefix match on the leading tag.
    pub fn has_prefix(&self, tag: EntityTag) -> bool {
        self.tag == tag
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[\"{}\"", self.tag)?;
        for part in &self.params {
            write!(f, ",{}", part)?;
        }
        f.write_str("]")
    }
}
