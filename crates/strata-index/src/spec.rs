use bson::raw::{RawBsonRef, RawDocument};
use serde::{Deserialize, Serialize};

use strata_path::{PathTree, normalize_wildcard_projection};
use strata_query::{Expression, parse_filter};

use crate::error::IndexError;

/// How one key of an index orders or transforms its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKeyKind {
    Ascending,
    Descending,
    Text,
    Hashed,
    Geo2dSphere,
    Vector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexKey {
    pub path: String,
    pub kind: IndexKeyKind,
}

/// A parsed `createIndexes` entry.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexKey>,
    pub unique: bool,
    pub sparse: bool,
    /// Key pattern was `{"$**": 1}` or a sub-path prefix of it.
    pub wildcard: bool,
    /// Normalized `wildcardProjection`, when given.
    pub wildcard_projection: Option<PathTree>,
    pub partial_filter: Option<Expression>,
    pub expire_after_seconds: Option<i64>,
}

impl IndexSpec {
    /// Whether a same-named index with `other`'s shape is the same index.
    /// Differing shapes under one name are an options conflict.
    pub fn same_definition(&self, other: &IndexSpec) -> bool {
        self.keys == other.keys
            && self.unique == other.unique
            && self.sparse == other.sparse
            && self.wildcard == other.wildcard
            && self.expire_after_seconds == other.expire_after_seconds
    }

    /// The single indexed path of a non-composite index.
    pub fn single_path(&self) -> Option<&str> {
        match self.keys.as_slice() {
            [only] => Some(&only.path),
            _ => None,
        }
    }
}

/// Parse one entry of a `createIndexes` command:
/// `{key: {...}, name: "...", unique: true, ...}`.
pub fn parse_index_spec(doc: &RawDocument) -> Result<IndexSpec, IndexError> {
    let mut keys = Vec::new();
    let mut name = None;
    let mut unique = false;
    let mut sparse = false;
    let mut wildcard = false;
    let mut wildcard_projection = None;
    let mut partial_filter = None;
    let mut expire_after_seconds = None;

    for entry in doc.iter() {
        let (field, value) = entry?;
        match field {
            "key" => {
                let RawBsonRef::Document(pattern) = value else {
                    return Err(IndexError::BadValue("'key' must be a document".into()));
                };
                (keys, wildcard) = parse_key_pattern(pattern)?;
            }
            "name" => match value {
                RawBsonRef::String(s) if !s.is_empty() => name = Some(s.to_string()),
                _ => return Err(IndexError::BadValue("'name' must be a non-empty string".into())),
            },
            "unique" => unique = bool_option(field, value)?,
            "sparse" => sparse = bool_option(field, value)?,
            "wildcardProjection" => {
                let RawBsonRef::Document(projection) = value else {
                    return Err(IndexError::BadValue(
                        "'wildcardProjection' must be a document".into(),
                    ));
                };
                wildcard_projection = Some(normalize_wildcard_projection(projection)?);
            }
            "partialFilterExpression" => {
                let RawBsonRef::Document(filter) = value else {
                    return Err(IndexError::BadValue(
                        "'partialFilterExpression' must be a document".into(),
                    ));
                };
                partial_filter = Some(parse_filter(filter)?);
            }
            "expireAfterSeconds" => {
                let seconds = match value {
                    RawBsonRef::Int32(n) => i64::from(n),
                    RawBsonRef::Int64(n) => n,
                    RawBsonRef::Double(d) if d.fract() == 0.0 => d as i64,
                    _ => {
                        return Err(IndexError::BadValue(
                            "'expireAfterSeconds' must be an integer".into(),
                        ));
                    }
                };
                if seconds < 0 {
                    return Err(IndexError::BadValue(
                        "'expireAfterSeconds' may not be negative".into(),
                    ));
                }
                expire_after_seconds = Some(seconds);
            }
            // Benign options carried for compatibility.
            "v" | "background" | "collation" => {}
            other => {
                return Err(IndexError::BadValue(format!("unknown index option '{other}'")));
            }
        }
    }

    if keys.is_empty() {
        return Err(IndexError::BadValue("index spec needs a 'key' pattern".into()));
    }
    if wildcard_projection.is_some() && !wildcard {
        return Err(IndexError::BadValue(
            "'wildcardProjection' is only valid on wildcard indexes".into(),
        ));
    }
    let name = match name {
        Some(n) => n,
        None => default_index_name(&keys),
    };

    Ok(IndexSpec {
        name,
        keys,
        unique,
        sparse,
        wildcard,
        wildcard_projection,
        partial_filter,
        expire_after_seconds,
    })
}

fn parse_key_pattern(pattern: &RawDocument) -> Result<(Vec<IndexKey>, bool), IndexError> {
    let mut keys = Vec::new();
    let mut wildcard = false;

    for entry in pattern.iter() {
        let (path, value) = entry?;
        let (path, is_wildcard) = if path == "$**" {
            (String::new(), true)
        } else if let Some(prefix) = path.strip_suffix(".$**") {
            (prefix.to_string(), true)
        } else {
            (path.to_string(), false)
        };
        if is_wildcard {
            wildcard = true;
        }

        let kind = match value {
            RawBsonRef::String("text") => IndexKeyKind::Text,
            RawBsonRef::String("hashed") => IndexKeyKind::Hashed,
            RawBsonRef::String("2dsphere") => IndexKeyKind::Geo2dSphere,
            RawBsonRef::String("vector") => IndexKeyKind::Vector,
            RawBsonRef::String(other) => {
                return Err(IndexError::BadValue(format!("unknown index kind '{other}'")));
            }
            other => match direction_of(other) {
                Some(1) => IndexKeyKind::Ascending,
                Some(-1) => IndexKeyKind::Descending,
                _ => {
                    return Err(IndexError::BadValue(format!(
                        "bad index direction for '{path}'"
                    )));
                }
            },
        };
        if is_wildcard && !matches!(kind, IndexKeyKind::Ascending) {
            return Err(IndexError::BadValue(
                "wildcard keys must use direction 1".into(),
            ));
        }
        keys.push(IndexKey { path, kind });
    }

    if wildcard && keys.len() > 1 {
        return Err(IndexError::BadValue(
            "wildcard indexes allow a single key".into(),
        ));
    }
    Ok((keys, wildcard))
}

fn bool_option(field: &str, value: RawBsonRef<'_>) -> Result<bool, IndexError> {
    match value {
        RawBsonRef::Boolean(b) => Ok(b),
        _ => Err(IndexError::BadValue(format!("'{field}' must be a boolean"))),
    }
}

fn direction_of(value: RawBsonRef<'_>) -> Option<i64> {
    match value {
        RawBsonRef::Int32(n) => Some(i64::from(n)),
        RawBsonRef::Int64(n) => Some(n),
        RawBsonRef::Double(d) if d.fract() == 0.0 => Some(d as i64),
        _ => None,
    }
}

fn default_index_name(keys: &[IndexKey]) -> String {
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let suffix = match key.kind {
            IndexKeyKind::Ascending => "1".to_string(),
            IndexKeyKind::Descending => "-1".to_string(),
            IndexKeyKind::Text => "text".to_string(),
            IndexKeyKind::Hashed => "hashed".to_string(),
            IndexKeyKind::Geo2dSphere => "2dsphere".to_string(),
            IndexKeyKind::Vector => "vector".to_string(),
        };
        let path = if key.path.is_empty() { "$**" } else { &key.path };
        parts.push(format!("{path}_{suffix}"));
    }
    parts.join("_")
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    #[test]
    fn single_and_composite_patterns() {
        let spec = parse_index_spec(&rawdoc! { "key": { "t": 1 } }).unwrap();
        assert_eq!(spec.name, "t_1");
        assert_eq!(spec.single_path(), Some("t"));
        assert!(!spec.wildcard);

        let spec = parse_index_spec(&rawdoc! { "key": { "a": 1, "b": -1 }, "name": "ab" }).unwrap();
        assert_eq!(spec.keys.len(), 2);
        assert_eq!(spec.keys[1].kind, IndexKeyKind::Descending);
        assert_eq!(spec.single_path(), None);
    }

    #[test]
    fn wildcard_patterns() {
        let spec = parse_index_spec(&rawdoc! { "key": { "$**": 1 } }).unwrap();
        assert!(spec.wildcard);
        assert_eq!(spec.name, "$**_1");

        let sub = parse_index_spec(&rawdoc! { "key": { "meta.$**": 1 } }).unwrap();
        assert!(sub.wildcard);
        assert_eq!(sub.keys[0].path, "meta");

        assert!(parse_index_spec(&rawdoc! { "key": { "$**": -1 } }).is_err());
        assert!(parse_index_spec(&rawdoc! { "key": { "$**": 1, "b": 1 } }).is_err());
    }

    #[test]
    fn wildcard_projection_normalizes() {
        let spec = parse_index_spec(&rawdoc! {
            "key": { "$**": 1 },
            "wildcardProjection": { "a": 1, "a.b": 1 }
        })
        .unwrap();
        let tree = spec.wildcard_projection.unwrap();
        assert_eq!(tree.root.children.len(), 1);
        assert!(!tree.include_id);

        assert!(
            parse_index_spec(&rawdoc! { "key": { "a": 1 }, "wildcardProjection": { "b": 1 } })
                .is_err()
        );
    }

    #[test]
    fn options_parse() {
        let spec = parse_index_spec(&rawdoc! {
            "key": { "email": 1 },
            "name": "email_unique",
            "unique": true,
            "sparse": true,
            "expireAfterSeconds": 3600,
            "partialFilterExpression": { "active": true }
        })
        .unwrap();
        assert!(spec.unique);
        assert!(spec.sparse);
        assert_eq!(spec.expire_after_seconds, Some(3600));
        assert!(spec.partial_filter.is_some());
    }

    #[test]
    fn conflicts_detected_by_definition() {
        let a = parse_index_spec(&rawdoc! { "key": { "x": 1 }, "name": "x" }).unwrap();
        let b = parse_index_spec(&rawdoc! { "key": { "x": -1 }, "name": "x" }).unwrap();
        let c = parse_index_spec(&rawdoc! { "key": { "x": 1 }, "name": "x" }).unwrap();
        assert!(!a.same_definition(&b));
        assert!(a.same_definition(&c));
    }

    #[test]
    fn unknown_options_rejected() {
        assert!(parse_index_spec(&rawdoc! { "key": { "a": 1 }, "frobnicate": 1 }).is_err());
        assert!(parse_index_spec(&rawdoc! { "name": "no_key" }).is_err());
    }
}
