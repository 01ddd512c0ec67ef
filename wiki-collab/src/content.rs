//! Content projections of the rich-text tree.
//!
//! The replica stores the editor tree in an XML fragment. The relational
//! store keeps a ProseMirror-shaped JSON projection of it:
//!
//! ```text
//! XmlFragment "default"                     {"type":"doc","content":[
//! └── <paragraph textAlign="left">    ──►     {"type":"paragraph","attrs":{...},
//!     └── XmlText "hi" {bold: {}}               "content":[{"type":"text","text":"hi",
//!                                                           "marks":[{"type":"bold"}]}]}]}
//! ```
//!
//! Projections derived from the JSON (plain text, attachment ids, page
//! mentions) are pure functions so they can run outside a transaction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;
use yrs::types::text::{Diff, YChange};
use yrs::types::Attrs;
use yrs::{
    Any, Out, ReadTxn, Text, TransactionMut, Xml, XmlElementPrelim, XmlElementRef, XmlFragment,
    XmlFragmentRef, XmlOut, XmlTextPrelim, XmlTextRef,
};

/// Node types whose `attachmentId` attribute references an attachment row.
const ATTACHMENT_ATTR: &str = "attachmentId";

// ─── XML → JSON ───────────────────────────────────────────────────────

/// Project the content fragment into ProseMirror JSON.
pub fn fragment_to_json<T: ReadTxn>(txn: &T, fragment: &XmlFragmentRef) -> Value {
    json!({
        "type": "doc",
        "content": children_to_json(txn, fragment),
    })
}

fn children_to_json<T: ReadTxn, F: XmlFragment>(txn: &T, parent: &F) -> Vec<Value> {
    let mut nodes = Vec::new();
    for index in 0..parent.len(txn) {
        match parent.get(txn, index) {
            Some(XmlOut::Element(element)) => nodes.push(element_to_json(txn, &element)),
            Some(XmlOut::Text(text)) => nodes.extend(text_to_json(txn, &text)),
            Some(XmlOut::Fragment(nested)) => nodes.extend(children_to_json(txn, &nested)),
            None => {}
        }
    }
    nodes
}

fn element_to_json<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> Value {
    let mut node = Map::new();
    node.insert("type".into(), Value::String(element.tag().to_string()));

    let attrs: Map<String, Value> = element
        .attributes(txn)
        .map(|(name, value)| (name.to_string(), out_to_json(&value)))
        .collect();
    if !attrs.is_empty() {
        node.insert("attrs".into(), Value::Object(attrs));
    }

    let content = children_to_json(txn, element);
    if !content.is_empty() {
        node.insert("content".into(), Value::Array(content));
    }
    Value::Object(node)
}

fn text_to_json<T: ReadTxn>(txn: &T, text: &XmlTextRef) -> Vec<Value> {
    let chunks: Vec<Diff<YChange>> = text.diff(txn, YChange::identity);
    chunks
        .into_iter()
        .filter_map(|chunk| {
            let value = match chunk.insert {
                Out::Any(Any::String(s)) => s.to_string(),
                _ => return None,
            };
            let mut node = Map::new();
            node.insert("type".into(), Value::String("text".into()));
            node.insert("text".into(), Value::String(value));
            if let Some(attributes) = chunk.attributes {
                let marks = attrs_to_marks(&attributes);
                if !marks.is_empty() {
                    node.insert("marks".into(), Value::Array(marks));
                }
            }
            Some(Value::Object(node))
        })
        .collect()
}

fn attrs_to_marks(attributes: &Attrs) -> Vec<Value> {
    let mut names: Vec<&Arc<str>> = attributes.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let mut mark = Map::new();
            mark.insert("type".into(), Value::String(name.to_string()));
            if let Some(Value::Object(attrs)) = attributes.get(name).map(any_to_json) {
                if !attrs.is_empty() {
                    mark.insert("attrs".into(), Value::Object(attrs));
                }
            }
            Value::Object(mark)
        })
        .collect()
}

fn out_to_json(value: &Out) -> Value {
    match value {
        Out::Any(any) => any_to_json(any),
        _ => Value::Null,
    }
}

fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined | Any::Buffer(_) => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => number_to_json(*n),
        Any::BigInt(n) => Value::from(*n),
        Any::String(s) => Value::String(s.to_string()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.to_string(), any_to_json(value)))
                .collect(),
        ),
    }
}

/// Integral doubles project as integers so `{"level": 1}` stays comparable.
fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ─── JSON → XML ───────────────────────────────────────────────────────

/// Populate an empty fragment from ProseMirror JSON.
pub fn json_into_fragment(
    txn: &mut TransactionMut,
    fragment: &XmlFragmentRef,
    doc: &Value,
) -> Result<(), String> {
    match doc.get("type").and_then(Value::as_str) {
        Some("doc") => {}
        other => return Err(format!("expected a doc node, got {other:?}")),
    }
    insert_children(txn, fragment, content_of(doc))
}

fn content_of(node: &Value) -> &[Value] {
    node.get("content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn insert_children<F: XmlFragment>(
    txn: &mut TransactionMut,
    parent: &F,
    children: &[Value],
) -> Result<(), String> {
    // Adjacent text nodes share one XmlText, split by formatting.
    let mut open_text: Option<XmlTextRef> = None;

    for child in children {
        let node_type = child
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "node without a type".to_string())?;

        if node_type == "text" {
            let chunk = child.get("text").and_then(Value::as_str).unwrap_or_default();
            let text = match open_text.take() {
                Some(text) => text,
                None => {
                    let index = parent.len(&*txn);
                    parent.insert(txn, index, XmlTextPrelim::new(""))
                }
            };
            let offset = text.len(&*txn);
            text.insert_with_attributes(txn, offset, chunk, marks_to_attrs(child));
            open_text = Some(text);
            continue;
        }

        open_text = None;
        let index = parent.len(&*txn);
        let element = parent.insert(txn, index, XmlElementPrelim::empty(node_type));
        if let Some(Value::Object(attrs)) = child.get("attrs") {
            for (name, value) in attrs {
                if value.is_null() {
                    continue;
                }
                element.insert_attribute(txn, name.as_str(), json_to_any(value));
            }
        }
        insert_children(txn, &element, content_of(child))?;
    }
    Ok(())
}

fn marks_to_attrs(text_node: &Value) -> Attrs {
    let mut attrs: Attrs = HashMap::new();
    let marks = text_node
        .get("marks")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for mark in marks {
        if let Some(name) = mark.get("type").and_then(Value::as_str) {
            let value = mark
                .get("attrs")
                .map(json_to_any)
                .unwrap_or_else(|| Any::Map(HashMap::new().into()));
            attrs.insert(Arc::from(name), value);
        }
    }
    attrs
}

fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => Any::Number(n.as_f64().unwrap_or_default()),
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(items.into())
        }
        Value::Object(entries) => {
            let entries: HashMap<String, Any> = entries
                .iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect();
            Any::Map(entries.into())
        }
    }
}

// ─── Derived projections ──────────────────────────────────────────────

/// Flatten the tree to text with all whitespace runs collapsed to one space.
pub fn plain_text(doc: &Value) -> String {
    let mut out = String::new();
    collect_text(doc, &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(node: &Value, out: &mut String) {
    match node.get("type").and_then(Value::as_str) {
        Some("text") => {
            if let Some(text) = node.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
        Some("mention") => {
            if let Some(label) = node.pointer("/attrs/label").and_then(Value::as_str) {
                out.push('@');
                out.push_str(label);
            }
        }
        Some("hardBreak") => out.push(' '),
        _ => {
            for child in content_of(node) {
                collect_text(child, out);
            }
            // block boundary
            out.push(' ');
        }
    }
}

/// Attachment ids referenced anywhere in the tree.
pub fn attachment_ids(doc: &Value) -> BTreeSet<Uuid> {
    let mut ids = BTreeSet::new();
    walk(doc, &mut |node| {
        if let Some(id) = node
            .pointer(&format!("/attrs/{ATTACHMENT_ATTR}"))
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            ids.insert(id);
        }
    });
    ids
}

/// Ids of pages referenced by `mention` nodes.
pub fn page_mentions(doc: &Value) -> Vec<Uuid> {
    let mut ids = BTreeSet::new();
    walk(doc, &mut |node| {
        if node.get("type").and_then(Value::as_str) != Some("mention") {
            return;
        }
        if node.pointer("/attrs/entityType").and_then(Value::as_str) != Some("page") {
            return;
        }
        if let Some(id) = node
            .pointer("/attrs/entityId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            ids.insert(id);
        }
    });
    ids.into_iter().collect()
}

fn walk(node: &Value, visit: &mut dyn FnMut(&Value)) {
    visit(node);
    for child in content_of(node) {
        walk(child, visit);
    }
}
