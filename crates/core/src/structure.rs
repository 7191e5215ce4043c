//! Pairing identifiers with externally supplied structure files.
//!
//! Structure files name proteins with `.` replaced by `_`, so `P12345.1`
//! is looked up as `P12345_1.pdb`. Stored identifiers are never rewritten.

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::debug;

const STRUCTURE_EXTENSIONS: [&str; 2] = [".pdb", ".cif"];
const COMPRESSED_EXTENSIONS: [&str; 2] = [".gz", ".zst"];

pub fn structure_key(identifier: &str) -> String {
    identifier.replace('.', "_")
}

/// File stem without the structure extension, or `None` when the name is
/// not a structure file.
pub fn structure_stem(file_name: &str) -> Option<&str> {
    let lower = file_name.to_ascii_lowercase();
    let mut end = file_name.len();
    if let Some(ext) = COMPRESSED_EXTENSIONS.iter().find(|ext| lower.ends_with(*ext)) {
        end -= ext.len();
    }
    let ext = STRUCTURE_EXTENSIONS
        .iter()
        .find(|ext| lower[..end].ends_with(*ext))?;
    let stem = &file_name[..end - ext.len()];
    (!stem.is_empty()).then_some(stem)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructureMatches {
    /// identifier -> file name, in identifier order.
    pub matched: IndexMap<String, String>,
    pub unmatched_files: Vec<String>,
    pub without_structure: Vec<String>,
}

pub fn match_structure_files<'a, I, F>(identifiers: I, file_names: F) -> StructureMatches
where
    I: IntoIterator<Item = &'a String>,
    F: IntoIterator<Item = String>,
{
    let mut by_key = HashMap::new();
    let mut matches = StructureMatches::default();
    for name in file_names {
        match structure_stem(&name) {
            Some(stem) => {
                let stem = stem.to_string();
                if let Some(previous) = by_key.insert(stem, name) {
                    debug!(file = %previous, "several structure files share a stem");
                    matches.unmatched_files.push(previous);
                }
            }
            None => debug!(file = %name, "skipping non-structure file"),
        }
    }
    for id in identifiers {
        match by_key.remove(&structure_key(id)) {
            Some(file) => {
                matches.matched.insert(id.clone(), file);
            }
            None => matches.without_structure.push(id.clone()),
        }
    }
    matches.unmatched_files.extend(by_key.into_values());
    matches.unmatched_files.sort();
    matches
}
