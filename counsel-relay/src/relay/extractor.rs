//! Document reference extraction from upstream components

use counsel_common::sse::DocumentRef;
use serde_json::Value;
use tracing::debug;

use super::types::{ComponentPayload, ComponentStatus};

/// Nested arrays deeper than this are ignored
const MAX_NESTING: usize = 4;

/// Extract document references from a component
///
/// Only `success` components yield references. Items are read from
/// `data[i].document.{name, fileUrl}` (a bare `{name, fileUrl}` item is also
/// accepted); nested arrays are walked; items missing a non-blank `name` or
/// URL are skipped.
pub fn extract_documents(payload: &ComponentPayload) -> Vec<DocumentRef> {
    if payload.status != ComponentStatus::Success {
        return Vec::new();
    }

    let mut refs = Vec::new();
    for item in &payload.data {
        collect(item, 0, &mut refs);
    }

    if refs.len() < payload.data.len() {
        debug!(
            component_id = %payload.id,
            items = payload.data.len(),
            extracted = refs.len(),
            "Extractor: skipped component items without a usable document"
        );
    }

    refs
}

fn collect(item: &Value, depth: usize, refs: &mut Vec<DocumentRef>) {
    match item {
        Value::Array(items) if depth < MAX_NESTING => {
            for nested in items {
                collect(nested, depth + 1, refs);
            }
        }
        Value::Object(obj) => {
            let doc = match obj.get("document") {
                Some(Value::Object(doc)) => doc,
                Some(_) => return,
                None => obj,
            };
            if let Some(doc_ref) = document_ref(doc) {
                refs.push(doc_ref);
            }
        }
        _ => {}
    }
}

fn document_ref(doc: &serde_json::Map<String, Value>) -> Option<DocumentRef> {
    let name = non_blank(doc.get("name"))?;
    let url = non_blank(doc.get("fileUrl")).or_else(|| non_blank(doc.get("file_url")))?;
    Some(DocumentRef::new(name, url))
}

fn non_blank(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
