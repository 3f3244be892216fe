//! Rules for what counts as a legal change record.

use super::record::{ChangeRecord, ChangeType, ObjectKey, ObjectType};
use crate::core::{DbError, Result};

/// A change that passed validation and is ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub key: ObjectKey,
    pub change_type: ChangeType,
    pub object_etag: Option<String>,
}

pub fn validate_change(change: &ChangeRecord) -> Result<PendingChange> {
    let object_id = change
        .object_id
        .as_ref()
        .ok_or_else(|| DbError::InvalidArgument("change.objectId cannot be null".into()))?;
    let change_type = change
        .change_type
        .ok_or_else(|| DbError::InvalidArgument("change.changeType cannot be null".into()))?;
    let object_type = change
        .object_type
        .ok_or_else(|| DbError::InvalidArgument("change.objectType cannot be null".into()))?;
    if change_type.requires_etag() && change.object_etag.is_none() {
        return Err(DbError::InvalidArgument(format!(
            "Etag cannot be null for ChangeType: {}",
            change_type
        )));
    }

    Ok(PendingChange {
        key: ObjectKey::new(object_id.clone(), object_type),
        change_type,
        object_etag: change.object_etag.clone(),
    })
}

/// Validates every record before anything is written; one bad record
/// rejects the whole batch.
pub fn validate_batch(batch: &[ChangeRecord]) -> Result<Vec<PendingChange>> {
    batch.iter().map(validate_change).collect()
}

/// Checks a batch handed to the sent tracker.
pub fn validate_sent_batch(object_type: ObjectType, batch: &[ChangeRecord]) -> Result<Vec<i64>> {
    batch
        .iter()
        .map(|message| {
            if message.object_type != Some(object_type) {
                return Err(DbError::InvalidArgument(format!(
                    "All ChangeMessages in the batch must have an ObjectType of: {} but found: {}",
                    object_type,
                    message
                        .object_type
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "null".into())
                )));
            }
            message.change_number.ok_or_else(|| {
                DbError::InvalidArgument("change.changeNumber cannot be null".into())
            })
        })
        .collect()
}

pub(crate) fn require_key(
    object_id: Option<&str>,
    object_type: Option<ObjectType>,
) -> Result<ObjectKey> {
    let object_id =
        object_id.ok_or_else(|| DbError::InvalidArgument("ObjectId cannot be null".into()))?;
    let object_type =
        object_type.ok_or_else(|| DbError::InvalidArgument("ObjectType cannot be null".into()))?;
    Ok(ObjectKey::new(object_id, object_type))
}
