//! The verifier's disclosure request: which attributes it wants from which
//! document, optionally signed by the reader for reader authentication.

use coset::CoseSign1;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::cbor::Tag24;
use crate::cose::CoseCbor;
use crate::mdoc::{AttributeIdentifier, DocType, ElementIdentifier, NameSpace};

/// A disclosure request covering one or more documents.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    /// Version of the request structure.
    pub version: String,

    /// One request per document.
    pub doc_requests: Vec<DocRequest>,
}

impl DeviceRequest {
    pub(crate) const VERSION: &'static str = "1.0";

    /// A plain unsigned request for a set of attributes of one doc type.
    #[must_use]
    pub fn new(doc_type: DocType, name_spaces: RequestNameSpaces) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            doc_requests: vec![DocRequest {
                items_request: Tag24(ItemsRequest { doc_type, name_spaces }),
                reader_auth: None,
            }],
        }
    }
}

/// The request for one document, with an optional reader signature over the
/// items request and session transcript.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRequest {
    /// The requested attributes, as tagged bytes.
    pub items_request: Tag24<ItemsRequest>,

    /// Reader authentication: `COSE_Sign1` with a detached
    /// `ReaderAuthentication` payload, carrying the reader certificate
    /// chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader_auth: Option<CoseCbor<CoseSign1>>,
}

/// Requested attribute identifiers per namespace; the boolean signals the
/// reader's intent to retain the attribute value.
pub type RequestNameSpaces = IndexMap<NameSpace, IndexMap<ElementIdentifier, bool>>;

/// The attributes requested for one doc type.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsRequest {
    /// Document type the attributes are requested from.
    pub doc_type: DocType,

    /// Requested attributes per namespace.
    pub name_spaces: RequestNameSpaces,
}

impl ItemsRequest {
    /// All attribute identifiers named by this request.
    #[must_use]
    pub fn attribute_identifiers(&self) -> IndexSet<AttributeIdentifier> {
        self.name_spaces
            .iter()
            .flat_map(|(namespace, elements)| {
                elements.keys().map(|attribute| AttributeIdentifier {
                    doc_type: self.doc_type.clone(),
                    namespace: namespace.clone(),
                    attribute: attribute.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use indexmap::indexmap;

    use super::*;
    use crate::cbor;

    #[test]
    fn request_roundtrips() {
        let request = DeviceRequest::new(
            "org.iso.18013.5.1.mDL".to_string(),
            indexmap! {
                "org.iso.18013.5.1".to_string() => indexmap! {
                    "family_name".to_string() => true,
                    "birth_date".to_string() => false,
                },
            },
        );

        let bytes = cbor::to_vec(&request).unwrap();
        let decoded: DeviceRequest = cbor::from_slice(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn attribute_identifiers_cover_all_namespaces() {
        let items = ItemsRequest {
            doc_type: "doc".to_string(),
            name_spaces: indexmap! {
                "ns1".to_string() => indexmap! { "a".to_string() => true },
                "ns2".to_string() => indexmap! { "b".to_string() => true },
            },
        };

        let identifiers = items.attribute_identifiers();
        assert_eq!(identifiers.len(), 2);
        assert!(identifiers.iter().any(|id| id.namespace == "ns2" && id.attribute == "b"));
    }
}
