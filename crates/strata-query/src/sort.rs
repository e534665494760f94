use std::cmp::Ordering;

use bson::raw::{RawBsonRef, RawDocument};
use serde::{Deserialize, Serialize};

use strata_bson::{Collation, PathSpread, compare, extract_path_spread};

use crate::error::QueryError;
use crate::parse::as_integer;

/// One key of a sort specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub path: String,
    pub ascending: bool,
}

/// Parse `{field: 1, other: -1}` into sort keys, preserving order.
pub fn parse_sort(doc: &RawDocument) -> Result<Vec<SortKey>, QueryError> {
    let mut keys = Vec::new();
    for entry in doc.iter() {
        let (path, value) = entry?;
        let direction = as_integer(value)
            .ok_or_else(|| QueryError::BadValue(format!("bad sort direction for '{path}'")))?;
        let ascending = match direction {
            1 => true,
            -1 => false,
            other => {
                return Err(QueryError::BadValue(format!(
                    "sort direction must be 1 or -1, got {other}"
                )));
            }
        };
        keys.push(SortKey {
            path: path.to_string(),
            ascending,
        });
    }
    Ok(keys)
}

/// Compare two documents under a sort spec.
///
/// Missing paths sort as null. An array sorts by its smallest element for
/// an ascending key and its largest for a descending key.
pub fn compare_docs(
    a: &RawDocument,
    b: &RawDocument,
    keys: &[SortKey],
    collation: Option<&Collation>,
) -> Ordering {
    for key in keys {
        let av = sort_value(a, &key.path, key.ascending, collation);
        let bv = sort_value(b, &key.path, key.ascending, collation);
        let ord = match (av, bv) {
            (None, None) => Ordering::Equal,
            (None, Some(v)) => compare(RawBsonRef::Null, v, collation),
            (Some(v), None) => compare(v, RawBsonRef::Null, collation),
            (Some(x), Some(y)) => compare(x, y, collation),
        };
        if ord != Ordering::Equal {
            return if key.ascending { ord } else { ord.reverse() };
        }
    }
    Ordering::Equal
}

fn sort_value<'a>(
    doc: &'a RawDocument,
    path: &str,
    ascending: bool,
    collation: Option<&Collation>,
) -> Option<RawBsonRef<'a>> {
    let mut candidates: Vec<RawBsonRef<'a>> = Vec::new();
    match extract_path_spread(doc, path) {
        PathSpread::Missing => return None,
        PathSpread::One(v) => push_sort_candidates(v, &mut candidates),
        PathSpread::Many(vs) => {
            for v in vs {
                push_sort_candidates(v, &mut candidates);
            }
        }
    }
    let mut best: Option<RawBsonRef<'a>> = None;
    for c in candidates {
        best = Some(match best {
            None => c,
            Some(cur) => {
                let ord = compare(c, cur, collation);
                let take = if ascending {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };
                if take { c } else { cur }
            }
        });
    }
    best
}

fn push_sort_candidates<'a>(v: RawBsonRef<'a>, out: &mut Vec<RawBsonRef<'a>>) {
    match v {
        RawBsonRef::Array(arr) => {
            let mut any = false;
            for elem in arr.into_iter().flatten() {
                out.push(elem);
                any = true;
            }
            if !any {
                // An empty array sorts below null; keep the array itself
                // so the value is not treated as missing.
                out.push(v);
            }
        }
        other => out.push(other),
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    #[test]
    fn parse_directions() {
        let keys = parse_sort(&rawdoc! { "a": 1, "b": -1 }).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ascending);
        assert!(!keys[1].ascending);
        assert!(parse_sort(&rawdoc! { "a": 2 }).is_err());
    }

    #[test]
    fn single_key_ordering() {
        let keys = parse_sort(&rawdoc! { "n": 1 }).unwrap();
        let a = rawdoc! { "n": 1 };
        let b = rawdoc! { "n": 2 };
        assert_eq!(compare_docs(&a, &b, &keys, None), Ordering::Less);
        let keys_desc = parse_sort(&rawdoc! { "n": -1 }).unwrap();
        assert_eq!(compare_docs(&a, &b, &keys_desc, None), Ordering::Greater);
    }

    #[test]
    fn missing_sorts_as_null() {
        let keys = parse_sort(&rawdoc! { "n": 1 }).unwrap();
        let missing = rawdoc! { "x": 1 };
        let nulled = rawdoc! { "n": null };
        let valued = rawdoc! { "n": 0 };
        assert_eq!(compare_docs(&missing, &nulled, &keys, None), Ordering::Equal);
        assert_eq!(compare_docs(&missing, &valued, &keys, None), Ordering::Less);
    }

    #[test]
    fn tie_break_on_second_key() {
        let keys = parse_sort(&rawdoc! { "a": 1, "b": -1 }).unwrap();
        let x = rawdoc! { "a": 1, "b": 5 };
        let y = rawdoc! { "a": 1, "b": 9 };
        assert_eq!(compare_docs(&x, &y, &keys, None), Ordering::Greater);
    }

    #[test]
    fn arrays_sort_by_extreme_element() {
        let asc = parse_sort(&rawdoc! { "v": 1 }).unwrap();
        let desc = parse_sort(&rawdoc! { "v": -1 }).unwrap();
        let arr = rawdoc! { "v": [5, 1, 9] };
        let three = rawdoc! { "v": 3 };
        // Ascending uses min element (1), so the array sorts first.
        assert_eq!(compare_docs(&arr, &three, &asc, None), Ordering::Less);
        // Descending uses max element (9), so the array still sorts first.
        assert_eq!(compare_docs(&arr, &three, &desc, None), Ordering::Less);
    }
}
