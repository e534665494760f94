use bson::raw::{RawBsonRef, RawDocument};

/// Result of resolving a dotted path against a document.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSpread<'a> {
    /// No value at the path.
    Missing,
    /// The path resolved to exactly one value.
    One(RawBsonRef<'a>),
    /// The path crossed an array with a non-numeric segment; one entry per
    /// matching element, in array order.
    Many(Vec<RawBsonRef<'a>>),
}

impl<'a> PathSpread<'a> {
    pub fn is_missing(&self) -> bool {
        matches!(self, PathSpread::Missing)
    }

    /// The single resolved value, if the path did not fan out.
    pub fn as_single(&self) -> Option<RawBsonRef<'a>> {
        match self {
            PathSpread::One(v) => Some(*v),
            _ => None,
        }
    }
}

/// Resolve a dotted path to a single value.
///
/// Numeric segments index arrays; a non-numeric segment against an array
/// yields `None` here (use [`extract_path_spread`] for map-style
/// traversal).
pub fn extract_path<'a>(doc: &'a RawDocument, path: &str) -> Option<RawBsonRef<'a>> {
    let mut current = RawBsonRef::Document(doc);
    for segment in path.split('.') {
        current = step(current, segment)?;
    }
    Some(current)
}

fn step<'a>(current: RawBsonRef<'a>, segment: &str) -> Option<RawBsonRef<'a>> {
    match current {
        RawBsonRef::Document(d) => d.get(segment).ok().flatten(),
        RawBsonRef::Array(arr) => {
            let index: usize = segment.parse().ok()?;
            arr.into_iter().flatten().nth(index)
        }
        _ => None,
    }
}

/// Resolve a dotted path with array map-style traversal: a non-numeric
/// segment applied to an array applies to each element.
pub fn extract_path_spread<'a>(doc: &'a RawDocument, path: &str) -> PathSpread<'a> {
    let mut frontier: Vec<RawBsonRef<'a>> = vec![RawBsonRef::Document(doc)];
    let mut fanned_out = false;

    for segment in path.split('.') {
        let numeric: Option<usize> = segment.parse().ok();
        let mut next = Vec::with_capacity(frontier.len());
        for value in frontier {
            match value {
                RawBsonRef::Document(d) => {
                    if let Ok(Some(v)) = d.get(segment) {
                        next.push(v);
                    }
                }
                RawBsonRef::Array(arr) => match numeric {
                    Some(index) => {
                        if let Some(v) = arr.into_iter().flatten().nth(index) {
                            next.push(v);
                        }
                    }
                    None => {
                        fanned_out = true;
                        for elem in arr.into_iter().flatten() {
                            if let RawBsonRef::Document(d) = elem
                                && let Ok(Some(v)) = d.get(segment)
                            {
                                next.push(v);
                            }
                        }
                    }
                },
                _ => {}
            }
        }
        frontier = next;
        if frontier.is_empty() {
            return PathSpread::Missing;
        }
    }

    if !fanned_out && frontier.len() == 1 {
        PathSpread::One(frontier[0])
    } else {
        PathSpread::Many(frontier)
    }
}

/// Collect every leaf value a path reaches, expanding terminal arrays into
/// their elements. This is the multikey extraction used by index
/// maintenance and `distinct`.
pub fn extract_path_values<'a>(doc: &'a RawDocument, path: &str) -> Vec<RawBsonRef<'a>> {
    let mut out = Vec::new();
    match extract_path_spread(doc, path) {
        PathSpread::Missing => {}
        PathSpread::One(v) => expand_terminal(v, &mut out),
        PathSpread::Many(vals) => {
            for v in vals {
                expand_terminal(v, &mut out);
            }
        }
    }
    out
}

fn expand_terminal<'a>(v: RawBsonRef<'a>, out: &mut Vec<RawBsonRef<'a>>) {
    match v {
        RawBsonRef::Array(arr) => {
            for elem in arr.into_iter().flatten() {
                out.push(elem);
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
    fn simple_nested_path() {
        let doc = rawdoc! { "a": { "b": { "c": 42 } } };
        assert_eq!(extract_path(&doc, "a.b.c"), Some(RawBsonRef::Int32(42)));
        assert_eq!(extract_path(&doc, "a.b.missing"), None);
        assert_eq!(extract_path(&doc, "a.x.c"), None);
    }

    #[test]
    fn numeric_segment_indexes_arrays() {
        let doc = rawdoc! { "tags": ["red", "green", "blue"] };
        assert_eq!(
            extract_path(&doc, "tags.1"),
            Some(RawBsonRef::String("green"))
        );
        assert_eq!(extract_path(&doc, "tags.9"), None);
    }

    #[test]
    fn non_numeric_on_array_is_strict_miss() {
        let doc = rawdoc! { "items": [{ "sku": "A" }, { "sku": "B" }] };
        assert_eq!(extract_path(&doc, "items.sku"), None);
    }

    #[test]
    fn spread_maps_over_array_elements() {
        let doc = rawdoc! { "items": [{ "sku": "A" }, { "n": 1 }, { "sku": "B" }] };
        let spread = extract_path_spread(&doc, "items.sku");
        assert_eq!(
            spread,
            PathSpread::Many(vec![RawBsonRef::String("A"), RawBsonRef::String("B")])
        );
    }

    #[test]
    fn spread_single_value_stays_single() {
        let doc = rawdoc! { "a": { "b": 7 } };
        assert_eq!(
            extract_path_spread(&doc, "a.b"),
            PathSpread::One(RawBsonRef::Int32(7))
        );
    }

    #[test]
    fn spread_numeric_then_field() {
        let doc = rawdoc! { "grades": [{ "g": 85 }, { "g": 90 }] };
        assert_eq!(
            extract_path_spread(&doc, "grades.1.g"),
            PathSpread::One(RawBsonRef::Int32(90))
        );
    }

    #[test]
    fn values_expand_terminal_arrays() {
        let doc = rawdoc! { "tags": ["x", "y"] };
        let vals = extract_path_values(&doc, "tags");
        assert_eq!(
            vals,
            vec![RawBsonRef::String("x"), RawBsonRef::String("y")]
        );
    }

    #[test]
    fn values_through_nested_arrays() {
        let doc = rawdoc! { "items": [{ "sku": ["A1", "A2"] }, { "sku": "B" }] };
        let vals = extract_path_values(&doc, "items.sku");
        assert_eq!(
            vals,
            vec![
                RawBsonRef::String("A1"),
                RawBsonRef::String("A2"),
                RawBsonRef::String("B")
            ]
        );
    }

    #[test]
    fn missing_path_yields_nothing() {
        let doc = rawdoc! { "a": 1 };
        assert!(extract_path_values(&doc, "b.c").is_empty());
        assert!(extract_path_spread(&doc, "a.b").is_missing());
    }
}
