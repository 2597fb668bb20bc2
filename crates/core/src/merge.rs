//! Two-way JSON merge patch (RFC 7386) between a baseline and a target document.

use serde_json::{Map, Value as Json};

/// Compute the merge patch that turns `baseline` into `target`.
///
/// Objects are diffed key by key; removed keys become `null`. Arrays and
/// scalars are replaced wholesale. Identical documents yield `{}`.
pub fn two_way(baseline: &Json, target: &Json) -> Json {
    match (baseline, target) {
        (Json::Object(base), Json::Object(tgt)) => Json::Object(diff_objects(base, tgt)),
        _ if baseline == target => Json::Object(Map::new()),
        _ => target.clone(),
    }
}

fn diff_objects(base: &Map<String, Json>, tgt: &Map<String, Json>) -> Map<String, Json> {
    let mut out = Map::new();
    for key in base.keys() {
        if !tgt.contains_key(key) {
            out.insert(key.clone(), Json::Null);
        }
    }
    for (key, new) in tgt {
        match base.get(key) {
            None => {
                out.insert(key.clone(), new.clone());
            }
            Some(old) if old == new => {}
            Some(Json::Object(old)) if new.is_object() => {
                if let Json::Object(new) = new {
                    let nested = diff_objects(old, new);
                    if !nested.is_empty() {
                        out.insert(key.clone(), Json::Object(nested));
                    }
                }
            }
            Some(_) => {
                out.insert(key.clone(), new.clone());
            }
        }
    }
    out
}

/// True when the patch changes nothing.
pub fn is_empty(patch: &Json) -> bool {
    patch.as_object().map(|m| m.is_empty()).unwrap_or(false)
}
