use bson::raw::RawBsonRef;

use strata_query::Expression;

use crate::error::PathError;

/// Per-operator state carried by a `FieldWithContext` leaf in find-query
/// projection mode.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorContext {
    /// `field.$` — project the first array element the query matched.
    Positional,
    /// `{$elemMatch: <filter>}` — project the first element satisfying the
    /// compiled sub-filter.
    ElemMatch(Expression),
    /// `{$slice: n | [skip, limit]}`.
    Slice(SliceArgs),
    /// `{$meta: <name>}` — project a metadata value (e.g. `textScore`).
    Meta(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceArgs {
    /// Negative counts from the end.
    pub skip: i64,
    pub limit: Option<i64>,
}

impl SliceArgs {
    /// Resolve to a concrete `(start, count)` window over an array of
    /// `len` elements.
    pub fn window(&self, len: usize) -> (usize, usize) {
        let len_i = len as i64;
        match self.limit {
            None => {
                // Single-argument form: skip is really "count".
                let count = self.skip;
                if count >= 0 {
                    (0, count.min(len_i) as usize)
                } else {
                    let start = (len_i + count).max(0);
                    (start as usize, (len_i - start) as usize)
                }
            }
            Some(limit) => {
                let start = if self.skip >= 0 {
                    self.skip.min(len_i)
                } else {
                    (len_i + self.skip).max(0)
                };
                let count = limit.max(0).min(len_i - start);
                (start as usize, count as usize)
            }
        }
    }
}

/// Parse the operand of `$slice`.
pub(crate) fn parse_slice(value: RawBsonRef<'_>) -> Result<SliceArgs, PathError> {
    match value {
        RawBsonRef::Int32(n) => Ok(SliceArgs {
            skip: i64::from(n),
            limit: None,
        }),
        RawBsonRef::Int64(n) => Ok(SliceArgs { skip: n, limit: None }),
        RawBsonRef::Double(d) if d.fract() == 0.0 => Ok(SliceArgs {
            skip: d as i64,
            limit: None,
        }),
        RawBsonRef::Array(arr) => {
            let parts: Vec<i64> = arr
                .into_iter()
                .flatten()
                .filter_map(|v| match v {
                    RawBsonRef::Int32(n) => Some(i64::from(n)),
                    RawBsonRef::Int64(n) => Some(n),
                    RawBsonRef::Double(d) if d.fract() == 0.0 => Some(d as i64),
                    _ => None,
                })
                .collect();
            if parts.len() != 2 {
                return Err(PathError::BadOperator(
                    "$slice array form needs [skip, limit]".into(),
                ));
            }
            if parts[1] <= 0 {
                return Err(PathError::BadOperator(
                    "$slice limit must be positive".into(),
                ));
            }
            Ok(SliceArgs {
                skip: parts[0],
                limit: Some(parts[1]),
            })
        }
        _ => Err(PathError::BadOperator(
            "$slice needs a number or [skip, limit]".into(),
        )),
    }
}

/// Parse the operand of `$meta`.
pub(crate) fn parse_meta(value: RawBsonRef<'_>) -> Result<String, PathError> {
    match value {
        RawBsonRef::String(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(PathError::BadOperator("$meta needs a metadata name".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_first_n() {
        let s = SliceArgs { skip: 3, limit: None };
        assert_eq!(s.window(10), (0, 3));
        assert_eq!(s.window(2), (0, 2));
    }

    #[test]
    fn slice_last_n() {
        let s = SliceArgs { skip: -3, limit: None };
        assert_eq!(s.window(10), (7, 3));
        assert_eq!(s.window(2), (0, 2));
    }

    #[test]
    fn slice_skip_limit() {
        let s = SliceArgs { skip: 2, limit: Some(3) };
        assert_eq!(s.window(10), (2, 3));
        assert_eq!(s.window(4), (2, 2));
        assert_eq!(s.window(1), (1, 0));
    }

    #[test]
    fn slice_negative_skip_with_limit() {
        let s = SliceArgs { skip: -4, limit: Some(2) };
        assert_eq!(s.window(10), (6, 2));
        assert_eq!(s.window(3), (0, 2));
    }
}
