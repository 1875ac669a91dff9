use std::collections::{BTreeMap, HashMap};

/// Strips trailing NUL padding from every value. Entries left empty are dropped.
pub fn normalize_metadata(raw: &HashMap<String, String>) -> BTreeMap<String, String> {
    raw.iter()
        .filter_map(|(key, value)| {
            let clean = value.trim_end_matches('\0');
            (!clean.is_empty()).then(|| (key.clone(), clean.to_string()))
        })
        .collect()
}
