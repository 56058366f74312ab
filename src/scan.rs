use std::collections::{BTreeMap, HashMap};

use serde_yaml::Value;

use crate::{Error, Result};

/// One navigation step from a YAML node to one of its children.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Descend into the value stored under a mapping key.
    Key(Value),
    /// Descend into a sequence element.
    Index(usize),
}

/// A stable address of a scalar node across a set of parsed documents.
#[derive(Clone, Debug, PartialEq)]
pub struct NodePath {
    pub doc: usize,
    pub steps: Vec<Step>,
}

/// The distinct directive strings found in a document set, each with every
/// location holding that string in traversal order.
pub type Locations = BTreeMap<String, Vec<NodePath>>;

/// Walks every node of every document and collects string values whose
/// trimmed form starts with `<scheme>://` for one of the given schemes.
pub fn scan(docs: &[Value], schemes: &[&str]) -> Locations {
    let mut locations = Locations::new();
    for (doc, value) in docs.iter().enumerate() {
        let mut steps = Vec::new();
        walk(value, doc, &mut steps, schemes, &mut locations);
    }
    locations
}

fn walk(
    value: &Value,
    doc: usize,
    steps: &mut Vec<Step>,
    schemes: &[&str],
    locations: &mut Locations,
) {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if schemes
                .iter()
                .any(|scheme| trimmed.starts_with(&format!("{scheme}://")))
            {
                locations
                    .entry(trimmed.to_string())
                    .or_default()
                    .push(NodePath {
                        doc,
                        steps: steps.clone(),
                    });
            }
        }
        Value::Sequence(seq) => {
            for (i, item) in seq.iter().enumerate() {
                steps.push(Step::Index(i));
                walk(item, doc, steps, schemes, locations);
                steps.pop();
            }
        }
        Value::Mapping(map) => {
            for (key, item) in map {
                steps.push(Step::Key(key.clone()));
                walk(item, doc, steps, schemes, locations);
                steps.pop();
            }
        }
        Value::Tagged(tagged) => walk(&tagged.value, doc, steps, schemes, locations),
        _ => {}
    }
}

/// Replaces every located directive string with its resolved digest.
///
/// Every distinct string must have an entry in `resolved`; a gap means the
/// dispatcher and rewriter disagree about what was collected, which is a bug
/// rather than a recoverable condition.
pub fn rewrite(
    docs: &mut [Value],
    locations: &Locations,
    resolved: &HashMap<String, String>,
) -> Result<()> {
    for (reference, paths) in locations {
        let digest = resolved
            .get(reference)
            .ok_or_else(|| Error::MissingResolvedReference(reference.clone()))?;
        for path in paths {
            // A dangling path means the documents diverged from the scan.
            let node = lookup_mut(docs, path).ok_or_else(|| Error::StaleLocation {
                reference: reference.clone(),
                doc: path.doc,
            })?;
            *node = Value::String(digest.clone());
        }
    }
    Ok(())
}

fn lookup_mut<'a>(docs: &'a mut [Value], path: &NodePath) -> Option<&'a mut Value> {
    let mut node = docs.get_mut(path.doc)?;
    for step in &path.steps {
        while let Value::Tagged(tagged) = node {
            node = &mut tagged.value;
        }
        node = match step {
            Step::Key(key) => node.as_mapping_mut()?.get_mut(key)?,
            Step::Index(i) => node.as_sequence_mut()?.get_mut(*i)?,
        };
    }
    Some(node)
}

/// Parses a multi-document YAML stream into its component documents.
pub fn parse_documents(input: &str) -> Result<Vec<Value>> {
    use serde::Deserialize;

    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        docs.push(Value::deserialize(document)?);
    }
    Ok(docs)
}

/// Serializes documents back out, preserving document order.
pub fn serialize_documents(docs: &[Value]) -> Result<String> {
    let mut out = String::new();
    for (i, doc) in docs.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(doc)?);
    }
    Ok(out)
}
