use std::collections::BTreeMap;

use crate::models::{Primitive, PrimitiveLink};

// ── Primitive registry (static call-site graph) ──
//
// Every ingest kind funnels through these two operations, so primitives seen
// first in a tree upload and later in a trace merge into one record. In debug
// mode each record accumulates the set of source kinds that mentioned it.

/// Create-or-return a primitive record. Returns whether the record is new.
pub fn process_primitive<'a>(
    primitives: &'a mut BTreeMap<String, Primitive>,
    name: &str,
    source: Option<&str>,
    debug: bool,
) -> (&'a mut Primitive, bool) {
    let existed = primitives.contains_key(name);
    let primitive = primitives
        .entry(name.to_string())
        .or_insert_with(|| Primitive::from_key(name));
    if debug {
        if let Some(source) = source {
            let sources = primitive.sources.get_or_insert_with(Vec::new);
            if !sources.iter().any(|s| s == source) {
                sources.push(source.to_string());
            }
        }
    }
    (primitive, !existed)
}

/// Record a parent→child edge. Keeps the two adjacency lists mutually
/// consistent and maintains an edge record keyed `parent_child`. Returns
/// whether the edge is new.
pub fn add_primitive_child(
    primitives: &mut BTreeMap<String, Primitive>,
    links: &mut BTreeMap<String, PrimitiveLink>,
    parent: &str,
    child: &str,
    source: Option<&str>,
    debug: bool,
) -> bool {
    process_primitive(primitives, parent, source, debug);
    process_primitive(primitives, child, source, debug);

    let parent_record = primitives.get_mut(parent).unwrap();
    if !parent_record.children.iter().any(|c| c == child) {
        parent_record.children.push(child.to_string());
    }
    let child_record = primitives.get_mut(child).unwrap();
    if !child_record.parents.iter().any(|p| p == parent) {
        child_record.parents.push(parent.to_string());
    }

    let link_id = format!("{parent}_{child}");
    let existed = links.contains_key(&link_id);
    let link = links.entry(link_id).or_insert_with(|| PrimitiveLink {
        parent: parent.to_string(),
        child: child.to_string(),
        sources: None,
    });
    if debug {
        if let Some(source) = source {
            let sources = link.sources.get_or_insert_with(Vec::new);
            if !sources.iter().any(|s| s == source) {
                sources.push(source.to_string());
            }
        }
    }
    !existed
}
