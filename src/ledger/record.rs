//! Change records and the identifiers they are keyed by.

use crate::core::{DbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "CREATE",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }

    /// Deletes are the only changes allowed to omit the object etag.
    pub fn requires_etag(&self) -> bool {
        !matches!(self, ChangeType::Delete)
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(ChangeType::Create),
            "UPDATE" => Ok(ChangeType::Update),
            "DELETE" => Ok(ChangeType::Delete),
            other => Err(DbError::InvalidArgument(format!(
                "Unknown change type: {}",
                other
            ))),
        }
    }
}

/// Kind of entity a change refers to.
///
/// Variants are declared in name order so the derived `Ord` matches the
/// ordering of their names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    AccessApproval,
    AccessControlList,
    AccessRequirement,
    Activity,
    DataAccessSubmission,
    Entity,
    Evaluation,
    EvaluationSubmissions,
    File,
    Forum,
    Message,
    Principal,
    Submission,
    Table,
    Team,
    Thread,
    UserProfile,
    Verification,
    Wiki,
}

impl ObjectType {
    pub const ALL: [ObjectType; 19] = [
        ObjectType::AccessApproval,
        ObjectType::AccessControlList,
        ObjectType::AccessRequirement,
        ObjectType::Activity,
        ObjectType::DataAccessSubmission,
        ObjectType::Entity,
        ObjectType::Evaluation,
        ObjectType::EvaluationSubmissions,
        ObjectType::File,
        ObjectType::Forum,
        ObjectType::Message,
        ObjectType::Principal,
        ObjectType::Submission,
        ObjectType::Table,
        ObjectType::Team,
        ObjectType::Thread,
        ObjectType::UserProfile,
        ObjectType::Verification,
        ObjectType::Wiki,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::AccessApproval => "ACCESS_APPROVAL",
            ObjectType::AccessControlList => "ACCESS_CONTROL_LIST",
            ObjectType::AccessRequirement => "ACCESS_REQUIREMENT",
            ObjectType::Activity => "ACTIVITY",
            ObjectType::DataAccessSubmission => "DATA_ACCESS_SUBMISSION",
            ObjectType::Entity => "ENTITY",
            ObjectType::Evaluation => "EVALUATION",
            ObjectType::EvaluationSubmissions => "EVALUATION_SUBMISSIONS",
            ObjectType::File => "FILE",
            ObjectType::Forum => "FORUM",
            ObjectType::Message => "MESSAGE",
            ObjectType::Principal => "PRINCIPAL",
            ObjectType::Submission => "SUBMISSION",
            ObjectType::Table => "TABLE",
            ObjectType::Team => "TEAM",
            ObjectType::Thread => "THREAD",
            ObjectType::UserProfile => "USER_PROFILE",
            ObjectType::Verification => "VERIFICATION",
            ObjectType::Wiki => "WIKI",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.to_ascii_uppercase();
        ObjectType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| DbError::InvalidArgument(format!("Unknown object type: {}", s)))
    }
}

/// Opaque object identifier.
///
/// Ids shaped like `syn123` or `123` compare by their numeric value, so a
/// batch of entity ids sorts the way their database keys do. Anything else
/// sorts after every numeric id, by text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric key of the id, if it has one.
    pub fn numeric_key(&self) -> Option<u64> {
        let raw = self.0.trim();
        let digits = match raw.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("syn") => &raw[3..],
            _ => raw,
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

impl Ord for ObjectId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric_key(), other.numeric_key()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of a ledger row: at most one live change exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub object_id: ObjectId,
    pub object_type: ObjectType,
}

impl ObjectKey {
    pub fn new(object_id: impl Into<ObjectId>, object_type: ObjectType) -> Self {
        Self {
            object_id: object_id.into(),
            object_type,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// A change notification as seen by callers.
///
/// Writers fill in the object fields; `change_number` and `timestamp` are
/// assigned by the store and ignored on input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub object_id: Option<ObjectId>,
    pub object_type: Option<ObjectType>,
    pub change_type: Option<ChangeType>,
    pub object_etag: Option<String>,
    pub change_number: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    pub fn new(
        object_id: impl Into<ObjectId>,
        object_type: ObjectType,
        change_type: ChangeType,
    ) -> Self {
        Self {
            object_id: Some(object_id.into()),
            object_type: Some(object_type),
            change_type: Some(change_type),
            ..Self::default()
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.object_etag = Some(etag.into());
        self
    }

    pub fn with_change_number(mut self, change_number: i64) -> Self {
        self.change_number = Some(change_number);
        self
    }

    pub fn key(&self) -> Option<ObjectKey> {
        match (&self.object_id, self.object_type) {
            (Some(id), Some(object_type)) => Some(ObjectKey::new(id.clone(), object_type)),
            _ => None,
        }
    }
}

/// Row of the CHANGES table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChange {
    pub change_number: i64,
    pub key: ObjectKey,
    pub change_type: ChangeType,
    pub object_etag: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StoredChange {
    pub fn to_record(&self) -> ChangeRecord {
        ChangeRecord {
            object_id: Some(self.key.object_id.clone()),
            object_type: Some(self.key.object_type),
            change_type: Some(self.change_type),
            object_etag: self.object_etag.clone(),
            change_number: Some(self.change_number),
            timestamp: Some(self.timestamp),
        }
    }
}

/// Row of the SENT_MESSAGES table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub change_number: i64,
    pub object_id: ObjectId,
    pub object_type: ObjectType,
    pub timestamp: DateTime<Utc>,
}

/// Row of the PROCESSED_MESSAGES table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub change_number: i64,
    pub queue_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Current wall-clock time at millisecond precision.
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
