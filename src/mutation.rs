//! Mutation Records
//!
//! Immutable value objects describing one indexing mutation each: a full
//! document upsert, a delete, or a partial field update. Records serialize
//! to the wire shape the batch envelope embeds, and each one reports its
//! own independently serialized length, which is the unit the queue's byte
//! gauge counts.
//!
//! Partial updates validate their value shape against the operator at
//! construction time. A `PartialUpdate` that exists is well-formed; there
//! is no serialization-time rejection path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Errors
// ============================================================================

/// Error type for mutation construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// Value shape does not match what the operator accepts
    InvalidShape {
        operator: UpdateOperator,
        expected: &'static str,
        found: &'static str,
    },
}

impl std::fmt::Display for MutationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationError::InvalidShape {
                operator,
                expected,
                found,
            } => write!(
                f,
                "Invalid value for {}: expected {}, got {}",
                operator.as_str(),
                expected,
                found
            ),
        }
    }
}

impl std::error::Error for MutationError {}

// ============================================================================
// Update operators
// ============================================================================

/// Operator applied by a partial update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateOperator {
    /// Replace the field's value (any JSON shape)
    FieldReplace,
    /// Append elements to an array field
    ArrayAppend,
    /// Remove elements from an array field
    ArrayRemove,
    /// Merge entries into a dictionary field
    DictionaryPut,
    /// Remove keys from a dictionary field
    DictionaryRemove,
}

impl UpdateOperator {
    /// Wire name of the operator
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOperator::FieldReplace => "fieldReplace",
            UpdateOperator::ArrayAppend => "arrayAppend",
            UpdateOperator::ArrayRemove => "arrayRemove",
            UpdateOperator::DictionaryPut => "dictionaryPut",
            UpdateOperator::DictionaryRemove => "dictionaryRemove",
        }
    }

    /// Check `value` against this operator's shape constraint
    fn accepts(&self, value: &Value) -> Result<(), MutationError> {
        let ok = match self {
            UpdateOperator::FieldReplace => true,
            UpdateOperator::ArrayAppend | UpdateOperator::ArrayRemove => value.is_array(),
            UpdateOperator::DictionaryPut => value.is_object(),
            UpdateOperator::DictionaryRemove => value.is_string() || value.is_array(),
        };

        if ok {
            Ok(())
        } else {
            Err(MutationError::InvalidShape {
                operator: *self,
                expected: self.expected_shape(),
                found: value_kind(value),
            })
        }
    }

    fn expected_shape(&self) -> &'static str {
        match self {
            UpdateOperator::FieldReplace => "any",
            UpdateOperator::ArrayAppend | UpdateOperator::ArrayRemove => "array",
            UpdateOperator::DictionaryPut => "object",
            UpdateOperator::DictionaryRemove => "string or array",
        }
    }
}

/// JSON type name for error messages
fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Records
// ============================================================================

/// Full document upsert
///
/// The URI doubles as the document's natural id (`documentId` on the wire).
/// Metadata fields are flattened into the record object at the top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Document URI, the natural id
    pub document_id: String,
    /// Arbitrary metadata merged into the record at the top level
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(document_id: impl Into<String>) -> Self {
        Document {
            document_id: document_id.into(),
            metadata: Map::new(),
        }
    }

    /// Attach one metadata field
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(name.into(), value);
        self
    }

    /// Independently serialized JSON length in bytes
    pub fn serialized_len(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|bytes| bytes.len())
    }
}

/// Document deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDelete {
    /// Id of the document to delete
    pub document_id: String,
    /// Also delete documents nested under this one
    pub delete_children: bool,
}

impl DocumentDelete {
    pub fn new(document_id: impl Into<String>, delete_children: bool) -> Self {
        DocumentDelete {
            document_id: document_id.into(),
            delete_children,
        }
    }

    /// Independently serialized JSON length in bytes
    pub fn serialized_len(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|bytes| bytes.len())
    }
}

/// Wire shape of a partial update, used to route deserialization through
/// the validating constructor
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialUpdateWire {
    document_id: String,
    operator: UpdateOperator,
    field: String,
    value: Value,
}

/// Partial field update
///
/// Fields are private: a record that passed shape validation cannot be
/// mutated out of shape afterwards, and deserialization re-validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "PartialUpdateWire")]
pub struct PartialUpdate {
    document_id: String,
    operator: UpdateOperator,
    field: String,
    value: Value,
}

impl PartialUpdate {
    /// Build a partial update, validating `value` against `operator`
    pub fn new(
        document_id: impl Into<String>,
        operator: UpdateOperator,
        field: impl Into<String>,
        value: Value,
    ) -> Result<Self, MutationError> {
        operator.accepts(&value)?;
        Ok(PartialUpdate {
            document_id: document_id.into(),
            operator,
            field: field.into(),
            value,
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn operator(&self) -> UpdateOperator {
        self.operator
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Independently serialized JSON length in bytes
    pub fn serialized_len(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|bytes| bytes.len())
    }
}

impl TryFrom<PartialUpdateWire> for PartialUpdate {
    type Error = MutationError;

    fn try_from(wire: PartialUpdateWire) -> Result<Self, Self::Error> {
        PartialUpdate::new(wire.document_id, wire.operator, wire.field, wire.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_wire_shape() {
        let document = Document::new("https://docs.example.com/a")
            .with_field("title", json!("Alpha"))
            .with_field("rank", json!(3));

        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["documentId"], "https://docs.example.com/a");
        assert_eq!(value["title"], "Alpha");
        assert_eq!(value["rank"], 3);
    }

    #[test]
    fn test_document_metadata_is_flattened() {
        let document = Document::new("doc-1").with_field("lang", json!("en"));
        let value = serde_json::to_value(&document).unwrap();

        // No nested "metadata" object on the wire.
        assert!(value.get("metadata").is_none());
        assert_eq!(value["lang"], "en");
    }

    #[test]
    fn test_delete_wire_shape() {
        let delete = DocumentDelete::new("doc-2", true);
        let value = serde_json::to_value(&delete).unwrap();

        assert_eq!(value["documentId"], "doc-2");
        assert_eq!(value["deleteChildren"], true);
    }

    #[test]
    fn test_serialized_len_matches_json_bytes() {
        let document = Document::new("doc-3").with_field("title", json!("T"));
        let bytes = serde_json::to_vec(&document).unwrap();

        assert_eq!(document.serialized_len().unwrap(), bytes.len());
    }

    #[test]
    fn test_field_replace_accepts_any_shape() {
        for value in [json!(null), json!(7), json!("s"), json!([1]), json!({"k": 1})] {
            let update = PartialUpdate::new("doc", UpdateOperator::FieldReplace, "f", value);
            assert!(update.is_ok());
        }
    }

    #[test]
    fn test_array_operators_require_arrays() {
        for operator in [UpdateOperator::ArrayAppend, UpdateOperator::ArrayRemove] {
            assert!(PartialUpdate::new("doc", operator, "tags", json!(["a", "b"])).is_ok());

            let err = PartialUpdate::new("doc", operator, "tags", json!("a")).unwrap_err();
            assert_eq!(
                err,
                MutationError::InvalidShape {
                    operator,
                    expected: "array",
                    found: "string",
                }
            );
        }
    }

    #[test]
    fn test_dictionary_put_requires_object() {
        assert!(PartialUpdate::new(
            "doc",
            UpdateOperator::DictionaryPut,
            "attrs",
            json!({"color": "red"})
        )
        .is_ok());

        let err = PartialUpdate::new("doc", UpdateOperator::DictionaryPut, "attrs", json!([1]))
            .unwrap_err();
        assert!(matches!(err, MutationError::InvalidShape { found: "array", .. }));
    }

    #[test]
    fn test_dictionary_remove_accepts_string_or_array() {
        assert!(
            PartialUpdate::new("doc", UpdateOperator::DictionaryRemove, "attrs", json!("color"))
                .is_ok()
        );
        assert!(PartialUpdate::new(
            "doc",
            UpdateOperator::DictionaryRemove,
            "attrs",
            json!(["color", "size"])
        )
        .is_ok());

        let err =
            PartialUpdate::new("doc", UpdateOperator::DictionaryRemove, "attrs", json!(42))
                .unwrap_err();
        assert!(matches!(err, MutationError::InvalidShape { found: "number", .. }));
    }

    #[test]
    fn test_partial_update_wire_shape() {
        let update = PartialUpdate::new(
            "doc-4",
            UpdateOperator::ArrayAppend,
            "tags",
            json!(["new"]),
        )
        .unwrap();

        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["documentId"], "doc-4");
        assert_eq!(value["operator"], "arrayAppend");
        assert_eq!(value["field"], "tags");
        assert_eq!(value["value"], json!(["new"]));
    }

    #[test]
    fn test_deserialization_revalidates_shape() {
        let wire = json!({
            "documentId": "doc-5",
            "operator": "arrayAppend",
            "field": "tags",
            "value": "not-an-array",
        });

        let result: Result<PartialUpdate, _> = serde_json::from_value(wire);
        assert!(result.is_err());
    }
}
