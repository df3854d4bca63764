//! `TAG:index:name` addressing for streams and side packets.
//!
//! A port is written as `name`, `TAG:name` or `TAG:index:name`. Untagged ports
//! share the empty tag. Within a tag, ports without an explicit index are
//! numbered in order of appearance; explicit indexes must cover `0..n`.

use crate::error::{GraphError, Result};
use crate::framework::id::CollectionItemId;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// One port of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub tag: String,
    pub index: usize,
    pub name: String,
}

impl TagEntry {
    /// `TAG:index` form used by handler configs and error messages.
    pub fn tag_index(&self) -> String {
        format!("{}:{}", self.tag, self.index)
    }
}

impl fmt::Display for TagEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tag.is_empty() && self.index == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}:{}", self.tag, self.index, self.name)
        }
    }
}

/// Ordered collection of ports, sorted by tag then index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap {
    entries: Vec<TagEntry>,
}

impl TagMap {
    /// Parse a list of port specs.
    pub fn new<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        // tag -> (explicit?, entries in appearance order)
        let mut by_tag: BTreeMap<String, (Option<bool>, Vec<(Option<usize>, String)>)> =
            BTreeMap::new();
        let mut seen_names = HashSet::new();

        for spec in specs {
            let spec = spec.as_ref();
            let (tag, index, name) = parse_tag_index_name(spec)?;
            if !seen_names.insert(name.clone()) {
                return Err(GraphError::InvalidConfig(format!(
                    "name '{}' appears more than once in the same collection",
                    name
                )));
            }
            let slot = by_tag.entry(tag.clone()).or_insert((None, Vec::new()));
            let explicit = index.is_some();
            match slot.0 {
                None => slot.0 = Some(explicit),
                Some(prev) if prev != explicit => {
                    return Err(GraphError::InvalidConfig(format!(
                        "tag '{}' mixes explicit and implicit indexes",
                        tag
                    )));
                }
                _ => {}
            }
            slot.1.push((index, name));
        }

        let mut entries = Vec::new();
        for (tag, (_, items)) in by_tag {
            let mut indexed: Vec<(usize, String)> = items
                .into_iter()
                .enumerate()
                .map(|(pos, (index, name))| (index.unwrap_or(pos), name))
                .collect();
            indexed.sort_by_key(|(index, _)| *index);
            for (expected, (index, _)) in indexed.iter().enumerate() {
                if *index != expected {
                    return Err(GraphError::InvalidConfig(format!(
                        "indexes for tag '{}' must be contiguous from 0 (found {} where {} was expected)",
                        tag, index, expected
                    )));
                }
            }
            entries.extend(indexed.into_iter().map(|(index, name)| TagEntry {
                tag: tag.clone(),
                index,
                name,
            }));
        }

        Ok(Self { entries })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TagEntry] {
        &self.entries
    }

    pub fn entry(&self, id: CollectionItemId) -> &TagEntry {
        &self.entries[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = CollectionItemId> + '_ {
        (0..self.entries.len()).map(|i| CollectionItemId(i as u32))
    }

    /// Look up the port at `tag`/`index`.
    pub fn id(&self, tag: &str, index: usize) -> Option<CollectionItemId> {
        self.entries
            .iter()
            .position(|e| e.tag == tag && e.index == index)
            .map(|i| CollectionItemId(i as u32))
    }

    /// All ports carrying `tag`, in index order.
    pub fn ids_for_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = CollectionItemId> + 'a {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.tag == tag)
            .map(|(i, _)| CollectionItemId(i as u32))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.entries.iter().any(|e| e.tag == tag)
    }

    /// Number of indexes under `tag`.
    pub fn count(&self, tag: &str) -> usize {
        self.entries.iter().filter(|e| e.tag == tag).count()
    }

    /// Distinct tags in sorted order.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.entries.iter().map(|e| e.tag.as_str()).collect();
        tags.dedup();
        tags
    }

    pub fn id_for_name(&self, name: &str) -> Option<CollectionItemId> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| CollectionItemId(i as u32))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Whether both maps have the same tags with the same index counts.
    pub fn same_shape(&self, other: &TagMap) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| a.tag == b.tag && a.index == b.index)
    }
}

/// Split `TAG:index:name` into its parts.
pub fn parse_tag_index_name(spec: &str) -> Result<(String, Option<usize>, String)> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (tag, index, name) = match parts.as_slice() {
        [name] => ("", None, *name),
        [tag, name] => {
            if tag.is_empty() {
                return Err(invalid(spec, "tag before ':' must not be empty"));
            }
            (*tag, None, *name)
        }
        [tag, index, name] => (*tag, Some(parse_index(spec, index)?), *name),
        _ => return Err(invalid(spec, "expected name, TAG:name or TAG:index:name")),
    };
    validate_tag(spec, tag)?;
    validate_name(spec, name)?;
    Ok((tag.to_string(), index, name.to_string()))
}

/// Parse `TAG`, `TAG:index` or `:index`. A bare tag leaves the index open.
pub fn parse_tag_index(spec: &str) -> Result<(String, Option<usize>)> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (tag, index) = match parts.as_slice() {
        [tag] => (*tag, None),
        [tag, index] => (*tag, Some(parse_index(spec, index)?)),
        _ => return Err(invalid(spec, "expected TAG or TAG:index")),
    };
    validate_tag(spec, tag)?;
    Ok((tag.to_string(), index))
}

fn parse_index(spec: &str, index: &str) -> Result<usize> {
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(spec, "index must be a non-negative integer"));
    }
    index
        .parse()
        .map_err(|_| invalid(spec, "index is out of range"))
}

fn validate_tag(spec: &str, tag: &str) -> Result<()> {
    let mut bytes = tag.bytes();
    let valid = match bytes.next() {
        None => true,
        Some(first) => {
            (first.is_ascii_uppercase() || first == b'_')
                && bytes.all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
        }
    };
    if valid {
        Ok(())
    } else {
        Err(invalid(spec, "tags use upper-case letters, digits and '_'"))
    }
}

fn validate_name(spec: &str, name: &str) -> Result<()> {
    let mut bytes = name.bytes();
    let valid = match bytes.next() {
        None => false,
        Some(first) => {
            (first.is_ascii_lowercase() || first == b'_')
                && bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        }
    };
    if valid {
        Ok(())
    } else {
        Err(invalid(spec, "names use lower-case letters, digits and '_'"))
    }
}

fn invalid(spec: &str, reason: &str) -> GraphError {
    GraphError::InvalidConfig(format!("invalid port '{}': {}", spec, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            parse_tag_index_name("video").unwrap(),
            ("".to_string(), None, "video".to_string())
        );
        assert_eq!(
            parse_tag_index_name("MAIN:in").unwrap(),
            ("MAIN".to_string(), None, "in".to_string())
        );
        assert_eq!(
            parse_tag_index_name("IMAGE:2:frame_2").unwrap(),
            ("IMAGE".to_string(), Some(2), "frame_2".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_bad_syntax() {
        assert!(parse_tag_index_name("main:in").is_err());
        assert!(parse_tag_index_name("MAIN:In").is_err());
        assert!(parse_tag_index_name("A:x:name").is_err());
        assert!(parse_tag_index_name("A:1:2:name").is_err());
        assert!(parse_tag_index_name("").is_err());
        assert!(parse_tag_index_name(":in").is_err());
    }

    #[test]
    fn test_parse_tag_index() {
        assert_eq!(parse_tag_index("LOOP").unwrap(), ("LOOP".to_string(), None));
        assert_eq!(parse_tag_index("LOOP:1").unwrap(), ("LOOP".to_string(), Some(1)));
        assert_eq!(parse_tag_index(":0").unwrap(), ("".to_string(), Some(0)));
        assert!(parse_tag_index("loop").is_err());
    }

    #[test]
    fn test_map_orders_by_tag_then_index() {
        let map = TagMap::new(&["LOOP:out", "MAIN:in", "b", "a"]).unwrap();
        let ordered: Vec<String> = map.entries().iter().map(|e| e.to_string()).collect();
        assert_eq!(ordered, vec!["b", ":1:a", "LOOP:0:out", "MAIN:0:in"]);
        assert_eq!(map.id("MAIN", 0), Some(CollectionItemId(3)));
        assert_eq!(map.count(""), 2);
        assert_eq!(map.tags(), vec!["", "LOOP", "MAIN"]);
        assert_eq!(map.id_for_name("out"), Some(CollectionItemId(2)));
    }

    #[test]
    fn test_explicit_indexes_must_be_contiguous() {
        assert!(TagMap::new(&["X:0:a", "X:1:b"]).is_ok());
        assert!(TagMap::new(&["X:0:a", "X:2:b"]).is_err());
        assert!(TagMap::new(&["X:1:a", "X:1:b"]).is_err());
        assert!(TagMap::new(&["X:0:a", "X:b"]).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        assert!(TagMap::new(&["A:x", "B:x"]).is_err());
    }

    #[test]
    fn test_same_shape() {
        let a = TagMap::new(&["in", "LOOP:l"]).unwrap();
        let b = TagMap::new(&["out", "LOOP:m"]).unwrap();
        let c = TagMap::new(&["out"]).unwrap();
        assert!(a.same_shape(&b));
        assert!(!a.same_shape(&c));
    }
}
