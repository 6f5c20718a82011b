//! Run-state records and their merge semantics.
//!
//! A record is either a partial checkpoint, which merges into whatever is
//! already stored for its id, or a complete snapshot, which replaces it.
//! Records are stored as a JSON document `{"payload": {...}, "complete": bool}`
//! keyed by id; the id itself is never part of the document.

use crate::models::{Result, TidemarkError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Bookmark data a pipeline needs to resume.
pub type Payload = Map<String, Value>;

/// One pipeline's persisted run state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    /// Unique, non-empty key (usually a schedule name)
    pub id: String,
    /// Checkpoint data
    pub payload: Payload,
    /// Terminal snapshot (`true`) or incremental checkpoint (`false`)
    pub complete: bool,
}

/// On-disk document shape shared by every backend.
#[derive(Debug, Serialize, Deserialize)]
struct StoredState {
    payload: Payload,
    #[serde(default)]
    complete: bool,
}

impl StateRecord {
    /// Create a record, rejecting an empty id.
    pub fn new(id: impl Into<String>, payload: Payload, complete: bool) -> Result<Self> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self {
            id,
            payload,
            complete,
        })
    }

    /// Create an incremental checkpoint.
    pub fn partial(id: impl Into<String>, payload: Payload) -> Result<Self> {
        Self::new(id, payload, false)
    }

    /// Create a terminal snapshot.
    pub fn complete(id: impl Into<String>, payload: Payload) -> Result<Self> {
        Self::new(id, payload, true)
    }

    /// Create a record from an arbitrary JSON value, which must be an object.
    pub fn from_json(id: impl Into<String>, value: Value, complete: bool) -> Result<Self> {
        match value {
            Value::Object(payload) => Self::new(id, payload, complete),
            other => Err(TidemarkError::InvalidInput(format!(
                "state payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Encode the record into its stored document.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_document(None)
    }

    /// Encode the record with its id embedded, for storage whose key does
    /// not reveal the id. [`StateRecord::decode`] ignores the extra field.
    pub fn encode_with_id(&self) -> Result<Vec<u8>> {
        self.encode_document(Some(&self.id))
    }

    fn encode_document(&self, id: Option<&str>) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Borrowed<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            id: Option<&'a str>,
            payload: &'a Payload,
            complete: bool,
        }

        serde_json::to_vec(&Borrowed {
            id,
            payload: &self.payload,
            complete: self.complete,
        })
        .map_err(|e| TidemarkError::serialization(&self.id, e))
    }

    /// Decode a stored document for `id`.
    pub fn decode(id: &str, bytes: &[u8]) -> Result<Self> {
        let stored: StoredState =
            serde_json::from_slice(bytes).map_err(|e| TidemarkError::serialization(id, e))?;
        Ok(Self {
            id: id.to_string(),
            payload: stored.payload,
            complete: stored.complete,
        })
    }
}

/// Merge an incoming record into an existing one.
///
/// Complete records replace. Partial records overwrite same-named fields and
/// keep the rest; the result takes the incoming `complete` flag. A missing
/// `existing` behaves like an empty partial record.
pub fn merge(existing: Option<&StateRecord>, incoming: StateRecord) -> StateRecord {
    if incoming.complete {
        return incoming;
    }

    let Some(existing) = existing else {
        return incoming;
    };

    let mut payload = existing.payload.clone();
    payload.extend(incoming.payload);

    StateRecord {
        id: incoming.id,
        payload,
        complete: incoming.complete,
    }
}

/// Reject ids no backend can store.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(TidemarkError::InvalidInput(
            "state id must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
