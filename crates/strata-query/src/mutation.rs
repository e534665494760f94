use bson::raw::{RawDocument, RawDocumentBuf};
use bson::{Bson, Document};

use crate::error::QueryError;

/// A parsed update document: one entry per `(operator, path)` pair, in
/// spec order. Field order matters for operator application, so entries
/// are kept as written.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSpec {
    pub fields: Vec<FieldUpdate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub path: String,
    pub op: UpdateOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(Bson),
    Unset,
    Inc(Bson),
    Mul(Bson),
    Min(Bson),
    Max(Bson),
    Rename(String),
    CurrentDate,
    Push { values: Vec<Bson> },
    AddToSet { values: Vec<Bson> },
    Pull(Bson),
    /// 1 pops the last element, -1 the first.
    Pop(i8),
}

/// Parse an update document like `{$set: {...}, $inc: {...}}`.
///
/// A document with no `$` operators is a whole-document replacement and is
/// rejected here; replacement is a different code path.
pub fn parse_update(doc: &RawDocument) -> Result<UpdateSpec, QueryError> {
    let mut fields = Vec::new();
    for entry in doc.iter() {
        let (op_name, value) = entry?;
        if !op_name.starts_with('$') {
            return Err(QueryError::BadValue(format!(
                "update operator expected, found field '{op_name}'"
            )));
        }
        let bson::raw::RawBsonRef::Document(args) = value else {
            return Err(QueryError::BadValue(format!("{op_name} needs a document")));
        };
        for arg in args.iter() {
            let (path, operand) = arg?;
            if path.is_empty() || path.starts_with('$') {
                return Err(QueryError::BadValue(format!("bad update path '{path}'")));
            }
            let operand: Bson = operand.to_raw_bson().try_into().map_err(
                |e: bson::raw::Error| QueryError::FailedToParse(e.to_string()),
            )?;
            let op = match op_name {
                "$set" => UpdateOp::Set(operand),
                "$unset" => UpdateOp::Unset,
                "$inc" => UpdateOp::Inc(require_number(op_name, operand)?),
                "$mul" => UpdateOp::Mul(require_number(op_name, operand)?),
                "$min" => UpdateOp::Min(operand),
                "$max" => UpdateOp::Max(operand),
                "$rename" => match operand {
                    Bson::String(target) if !target.is_empty() => UpdateOp::Rename(target),
                    _ => {
                        return Err(QueryError::BadValue(
                            "$rename target must be a non-empty string".into(),
                        ));
                    }
                },
                "$currentDate" => UpdateOp::CurrentDate,
                "$push" => UpdateOp::Push {
                    values: each_values(operand),
                },
                "$addToSet" => UpdateOp::AddToSet {
                    values: each_values(operand),
                },
                "$pull" => UpdateOp::Pull(operand),
                "$pop" => match operand {
                    Bson::Int32(1) | Bson::Int64(1) => UpdateOp::Pop(1),
                    Bson::Int32(-1) | Bson::Int64(-1) => UpdateOp::Pop(-1),
                    _ => return Err(QueryError::BadValue("$pop needs 1 or -1".into())),
                },
                other => {
                    return Err(QueryError::BadValue(format!(
                        "unknown update operator: {other}"
                    )));
                }
            };
            fields.push(FieldUpdate {
                path: path.to_string(),
                op,
            });
        }
    }
    if fields.is_empty() {
        return Err(QueryError::BadValue("update document has no operations".into()));
    }
    Ok(UpdateSpec { fields })
}

fn each_values(operand: Bson) -> Vec<Bson> {
    match operand {
        Bson::Document(doc) if doc.keys().next().map(String::as_str) == Some("$each") => {
            match doc.get("$each") {
                Some(Bson::Array(items)) => items.clone(),
                _ => vec![Bson::Document(doc)],
            }
        }
        other => vec![other],
    }
}

fn require_number(op: &str, operand: Bson) -> Result<Bson, QueryError> {
    match operand {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => Ok(operand),
        _ => Err(QueryError::BadValue(format!("{op} needs a numeric operand"))),
    }
}

/// Apply an update spec to a document, producing the rewritten document.
///
/// Dotted paths create intermediate documents as needed. `_id` may not be
/// changed.
pub fn apply_update(doc: &RawDocument, spec: &UpdateSpec) -> Result<RawDocumentBuf, QueryError> {
    let mut owned: Document =
        Document::try_from(doc).map_err(|e| QueryError::FailedToParse(e.to_string()))?;
    let now = bson::DateTime::now();

    for field in &spec.fields {
        if field.path == "_id" || field.path.starts_with("_id.") {
            return Err(QueryError::BadValue("_id may not be updated".into()));
        }
        apply_one(&mut owned, field, now)?;
    }

    bson::to_raw_document_buf(&owned).map_err(|e| QueryError::FailedToParse(e.to_string()))
}

fn apply_one(doc: &mut Document, field: &FieldUpdate, now: bson::DateTime) -> Result<(), QueryError> {
    match &field.op {
        UpdateOp::Set(value) => {
            set_path(doc, &field.path, value.clone())?;
        }
        UpdateOp::Unset => {
            remove_path(doc, &field.path);
        }
        UpdateOp::CurrentDate => {
            set_path(doc, &field.path, Bson::DateTime(now))?;
        }
        UpdateOp::Rename(target) => {
            if let Some(value) = take_path(doc, &field.path) {
                set_path(doc, target, value)?;
            }
        }
        UpdateOp::Inc(operand) => {
            let current = get_path(doc, &field.path).cloned();
            let next = match current {
                None => operand.clone(),
                Some(cur) => arithmetic(&field.path, &cur, operand, |a, b| a + b, |a, b| {
                    a.checked_add(b)
                })?,
            };
            set_path(doc, &field.path, next)?;
        }
        UpdateOp::Mul(operand) => {
            let current = get_path(doc, &field.path).cloned();
            let next = match current {
                None => zero_like(operand),
                Some(cur) => arithmetic(&field.path, &cur, operand, |a, b| a * b, |a, b| {
                    a.checked_mul(b)
                })?,
            };
            set_path(doc, &field.path, next)?;
        }
        UpdateOp::Min(operand) => {
            let replace = match get_path(doc, &field.path) {
                None => true,
                Some(cur) => bson_cmp(operand, cur) == std::cmp::Ordering::Less,
            };
            if replace {
                set_path(doc, &field.path, operand.clone())?;
            }
        }
        UpdateOp::Max(operand) => {
            let replace = match get_path(doc, &field.path) {
                None => true,
                Some(cur) => bson_cmp(operand, cur) == std::cmp::Ordering::Greater,
            };
            if replace {
                set_path(doc, &field.path, operand.clone())?;
            }
        }
        UpdateOp::Push { values } => {
            with_array(doc, &field.path, |arr| {
                arr.extend(values.iter().cloned());
                Ok(())
            })?;
        }
        UpdateOp::AddToSet { values } => {
            with_array(doc, &field.path, |arr| {
                for v in values {
                    if !arr.iter().any(|existing| bson_eq(existing, v)) {
                        arr.push(v.clone());
                    }
                }
                Ok(())
            })?;
        }
        UpdateOp::Pull(criterion) => {
            with_array(doc, &field.path, |arr| {
                arr.retain(|v| !bson_eq(v, criterion));
                Ok(())
            })?;
        }
        UpdateOp::Pop(end) => {
            with_array(doc, &field.path, |arr| {
                if !arr.is_empty() {
                    if *end == 1 {
                        arr.pop();
                    } else {
                        arr.remove(0);
                    }
                }
                Ok(())
            })?;
        }
    }
    Ok(())
}

fn bson_eq(a: &Bson, b: &Bson) -> bool {
    bson_cmp(a, b) == std::cmp::Ordering::Equal
}

fn bson_cmp(a: &Bson, b: &Bson) -> std::cmp::Ordering {
    // Route through the canonical raw comparator so numeric tags and
    // nested values order consistently with queries.
    let wrap_a = bson::to_raw_document_buf(&bson::doc! { "v": a.clone() });
    let wrap_b = bson::to_raw_document_buf(&bson::doc! { "v": b.clone() });
    match (wrap_a, wrap_b) {
        (Ok(ra), Ok(rb)) => match (ra.get("v"), rb.get("v")) {
            (Ok(Some(x)), Ok(Some(y))) => strata_bson::compare(x, y, None),
            _ => std::cmp::Ordering::Equal,
        },
        _ => std::cmp::Ordering::Equal,
    }
}

fn arithmetic(
    path: &str,
    current: &Bson,
    operand: &Bson,
    float_op: fn(f64, f64) -> f64,
    int_op: fn(i64, i64) -> Option<i64>,
) -> Result<Bson, QueryError> {
    let as_f64 = |b: &Bson| -> Option<f64> {
        match b {
            Bson::Int32(n) => Some(f64::from(*n)),
            Bson::Int64(n) => Some(*n as f64),
            Bson::Double(d) => Some(*d),
            _ => None,
        }
    };
    let as_i64 = |b: &Bson| -> Option<i64> {
        match b {
            Bson::Int32(n) => Some(i64::from(*n)),
            Bson::Int64(n) => Some(*n),
            _ => None,
        }
    };
    let (Some(cf), Some(of)) = (as_f64(current), as_f64(operand)) else {
        return Err(QueryError::BadValue(format!(
            "cannot apply numeric update to non-numeric field '{path}'"
        )));
    };
    if matches!(current, Bson::Double(_)) || matches!(operand, Bson::Double(_)) {
        return Ok(Bson::Double(float_op(cf, of)));
    }
    let (Some(ci), Some(oi)) = (as_i64(current), as_i64(operand)) else {
        return Ok(Bson::Double(float_op(cf, of)));
    };
    let result = int_op(ci, oi)
        .ok_or_else(|| QueryError::BadValue(format!("integer overflow updating '{path}'")))?;
    // Stay in Int32 when both operands were Int32 and the result fits.
    if matches!(current, Bson::Int32(_))
        && matches!(operand, Bson::Int32(_))
        && i32::try_from(result).is_ok()
    {
        Ok(Bson::Int32(result as i32))
    } else {
        Ok(Bson::Int64(result))
    }
}

fn zero_like(operand: &Bson) -> Bson {
    match operand {
        Bson::Double(_) => Bson::Double(0.0),
        Bson::Int64(_) => Bson::Int64(0),
        _ => Bson::Int32(0),
    }
}

// ── Dotted-path helpers over owned documents ────────────────────

fn get_path<'d>(doc: &'d Document, path: &str) -> Option<&'d Bson> {
    let (head, rest) = split_path(path);
    let value = doc.get(head)?;
    match rest {
        None => Some(value),
        Some(rest) => match value {
            Bson::Document(sub) => get_path(sub, rest),
            _ => None,
        },
    }
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<(), QueryError> {
    let (head, rest) = split_path(path);
    match rest {
        None => {
            doc.insert(head, value);
            Ok(())
        }
        Some(rest) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            match entry {
                Bson::Document(sub) => set_path(sub, rest, value),
                _ => Err(QueryError::BadValue(format!(
                    "cannot create path through non-document at '{head}'"
                ))),
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    let (head, rest) = split_path(path);
    match rest {
        None => {
            doc.remove(head);
        }
        Some(rest) => {
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                remove_path(sub, rest);
            }
        }
    }
}

fn take_path(doc: &mut Document, path: &str) -> Option<Bson> {
    let (head, rest) = split_path(path);
    match rest {
        None => doc.remove(head),
        Some(rest) => match doc.get_mut(head) {
            Some(Bson::Document(sub)) => take_path(sub, rest),
            _ => None,
        },
    }
}

fn with_array(
    doc: &mut Document,
    path: &str,
    f: impl FnOnce(&mut Vec<Bson>) -> Result<(), QueryError>,
) -> Result<(), QueryError> {
    let current = get_path(doc, path).cloned();
    match current {
        None => {
            let mut arr = Vec::new();
            f(&mut arr)?;
            set_path(doc, path, Bson::Array(arr))
        }
        Some(Bson::Array(mut arr)) => {
            f(&mut arr)?;
            set_path(doc, path, Bson::Array(arr))
        }
        Some(_) => Err(QueryError::BadValue(format!(
            "field '{path}' is not an array"
        ))),
    }
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    fn update(doc: &RawDocument, spec: &RawDocument) -> RawDocumentBuf {
        let parsed = parse_update(spec).unwrap();
        apply_update(doc, &parsed).unwrap()
    }

    #[test]
    fn set_creates_nested_paths() {
        let doc = rawdoc! { "_id": 1 };
        let out = update(&doc, &rawdoc! { "$set": { "a.b.c": 5 } });
        assert_eq!(out, rawdoc! { "_id": 1, "a": { "b": { "c": 5 } } });
    }

    #[test]
    fn unset_and_rename() {
        let doc = rawdoc! { "_id": 1, "old": "v", "gone": true };
        let out = update(
            &doc,
            &rawdoc! { "$unset": { "gone": "" }, "$rename": { "old": "new" } },
        );
        assert_eq!(out, rawdoc! { "_id": 1, "new": "v" });
    }

    #[test]
    fn inc_promotes_and_initializes() {
        let doc = rawdoc! { "_id": 1, "n": 10 };
        let out = update(&doc, &rawdoc! { "$inc": { "n": 5, "fresh": 2 } });
        assert_eq!(out, rawdoc! { "_id": 1, "n": 15, "fresh": 2 });

        let out = update(&rawdoc! { "_id": 1, "n": 10 }, &rawdoc! { "$inc": { "n": 0.5 } });
        assert_eq!(out, rawdoc! { "_id": 1, "n": 10.5 });
    }

    #[test]
    fn inc_overflow_is_an_error() {
        let doc = rawdoc! { "_id": 1, "n": i64::MAX };
        let spec = parse_update(&rawdoc! { "$inc": { "n": 1i64 } }).unwrap();
        assert!(apply_update(&doc, &spec).is_err());
    }

    #[test]
    fn min_max() {
        let doc = rawdoc! { "_id": 1, "lo": 5, "hi": 5 };
        let out = update(&doc, &rawdoc! { "$min": { "lo": 3 }, "$max": { "hi": 9 } });
        assert_eq!(out, rawdoc! { "_id": 1, "lo": 3, "hi": 9 });
        let unchanged = update(&out, &rawdoc! { "$min": { "lo": 4 }, "$max": { "hi": 2 } });
        assert_eq!(unchanged, rawdoc! { "_id": 1, "lo": 3, "hi": 9 });
    }

    #[test]
    fn push_each_and_add_to_set() {
        let doc = rawdoc! { "_id": 1, "tags": ["a"] };
        let out = update(&doc, &rawdoc! { "$push": { "tags": { "$each": ["b", "c"] } } });
        assert_eq!(out, rawdoc! { "_id": 1, "tags": ["a", "b", "c"] });

        let out = update(&out, &rawdoc! { "$addToSet": { "tags": "b" } });
        assert_eq!(out, rawdoc! { "_id": 1, "tags": ["a", "b", "c"] });
    }

    #[test]
    fn pull_and_pop() {
        let doc = rawdoc! { "_id": 1, "v": [1, 2, 3, 2] };
        let out = update(&doc, &rawdoc! { "$pull": { "v": 2 } });
        assert_eq!(out, rawdoc! { "_id": 1, "v": [1, 3] });

        let out = update(&out, &rawdoc! { "$pop": { "v": -1 } });
        assert_eq!(out, rawdoc! { "_id": 1, "v": [3] });
    }

    #[test]
    fn id_is_immutable() {
        let doc = rawdoc! { "_id": 1 };
        let spec = parse_update(&rawdoc! { "$set": { "_id": 2 } }).unwrap();
        assert!(apply_update(&doc, &spec).is_err());
    }

    #[test]
    fn replacement_document_rejected() {
        assert!(parse_update(&rawdoc! { "plain": 1 }).is_err());
    }

    #[test]
    fn add_to_set_compares_across_numeric_tags() {
        let doc = rawdoc! { "_id": 1, "v": [1i64] };
        let out = update(&doc, &rawdoc! { "$addToSet": { "v": 1.0 } });
        // 1i64 and 1.0 are the same value; nothing appended.
        assert_eq!(out, rawdoc! { "_id": 1, "v": [1i64] });
    }
}
