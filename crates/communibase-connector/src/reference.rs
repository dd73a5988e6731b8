use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConnectorError;
use crate::types::Document;

/// A pointer to a (sub-)document: a root document plus a path of nested array elements.
///
/// ```json
/// {
///     "rootDocumentEntityType": "Person",
///     "rootDocumentId": "52259f95dafd757b06002221",
///     "path": [{"field": "addresses", "objectId": "52259f95dafd757b06002230"}]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    pub root_document_entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_document_id: Option<String>,
    #[serde(default)]
    pub path: Vec<PathStep>,
}

/// One step into the array `field`, selecting the element whose `_id` is `object_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStep {
    pub field: String,
    pub object_id: String,
}

impl DocumentReference {
    /// Whether the root is the caller-supplied parent rather than a stored document.
    pub fn refers_to_parent(&self) -> bool {
        self.root_document_entity_type.split('.').next() == Some("parent")
    }

    pub(crate) fn validate(&self, has_parent: bool) -> Result<(), ConnectorError> {
        let has_root_id = self
            .root_document_id
            .as_deref()
            .is_some_and(|id| !id.is_empty());
        if self.root_document_entity_type.is_empty() || !(has_root_id || has_parent) {
            return Err(ConnectorError::Validation(
                "please provide a document reference with a type and id".into(),
            ));
        }
        Ok(())
    }

    /// Follows the path starting at `root`.
    pub fn resolve(&self, root: Document) -> Result<Document, ConnectorError> {
        self.path.iter().try_fold(root, |document, step| {
            let Value::Object(mut document) = document else {
                return Err(ConnectorError::ReferenceResolution);
            };
            let Some(Value::Array(elements)) = document.remove(&step.field) else {
                return Err(ConnectorError::ReferenceResolution);
            };
            elements
                .into_iter()
                .find(|element| {
                    element.get("_id").and_then(Value::as_str) == Some(step.object_id.as_str())
                })
                .ok_or(ConnectorError::ReferenceResolution)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn person() -> Document {
        json!({
            "_id": "52259f95dafd757b06002221",
            "addresses": [
                {"_id": "52259f95dafd757b06002230", "street": "Kerkstraat"},
                {
                    "_id": "52259f95dafd757b06002231",
                    "street": "Dorpsstraat",
                    "notes": [{"_id": "52259f95dafd757b06002240", "text": "back door"}],
                },
            ],
        })
    }

    #[test]
    fn test_deserialize() {
        let reference: DocumentReference = serde_json::from_value(json!({
            "rootDocumentEntityType": "Person",
            "rootDocumentId": "52259f95dafd757b06002221",
            "path": [{"field": "addresses", "objectId": "52259f95dafd757b06002230"}],
        }))
        .unwrap();

        assert_eq!(reference.root_document_entity_type, "Person");
        assert_eq!(reference.path[0].field, "addresses");
        assert!(!reference.refers_to_parent());
    }

    #[test]
    fn test_resolve_nested() {
        let reference = DocumentReference {
            root_document_entity_type: "Person".into(),
            root_document_id: Some("52259f95dafd757b06002221".into()),
            path: vec![
                PathStep {
                    field: "addresses".into(),
                    object_id: "52259f95dafd757b06002231".into(),
                },
                PathStep {
                    field: "notes".into(),
                    object_id: "52259f95dafd757b06002240".into(),
                },
            ],
        };

        let note = reference.resolve(person()).unwrap();
        assert_eq!(note["text"], "back door");
    }

    #[test]
    fn test_resolve_empty_path() {
        let reference = DocumentReference {
            root_document_entity_type: "Person".into(),
            root_document_id: Some("52259f95dafd757b06002221".into()),
            path: vec![],
        };
        assert_eq!(reference.resolve(person()).unwrap(), person());
    }

    #[test]
    fn test_resolve_missing_step() {
        let missing_element = DocumentReference {
            root_document_entity_type: "Person".into(),
            root_document_id: None,
            path: vec![PathStep {
                field: "addresses".into(),
                object_id: "52259f95dafd757b06009999".into(),
            }],
        };
        assert_eq!(
            missing_element.resolve(person()),
            Err(ConnectorError::ReferenceResolution)
        );

        let missing_field = DocumentReference {
            path: vec![PathStep {
                field: "emailAddresses".into(),
                object_id: "52259f95dafd757b06002230".into(),
            }],
            ..missing_element
        };
        assert_eq!(
            missing_field.resolve(person()),
            Err(ConnectorError::ReferenceResolution)
        );
    }

    #[test]
    fn test_validate() {
        let parent = DocumentReference {
            root_document_entity_type: "parent.addresses".into(),
            ..Default::default()
        };
        assert!(parent.refers_to_parent());
        assert!(parent.validate(true).is_ok());
        assert!(matches!(
            parent.validate(false),
            Err(ConnectorError::Validation(_))
        ));

        let untyped = DocumentReference {
            root_document_id: Some("52259f95dafd757b06002221".into()),
            ..Default::default()
        };
        assert!(untyped.validate(true).is_err());
    }
}
