use bson::raw::{RawBsonRef, RawDocument};
use bson::spec::ElementType;
use regex::RegexBuilder;

use crate::error::QueryError;
use crate::filter::{
    BitsOp, CompareOp, CompiledRegex, Expression, FieldPredicate, TypeMatch,
};

/// Parse a BSON filter document into an [`Expression`] tree.
///
/// MongoDB query semantics: the top-level document is an implicit AND,
/// `{field: value}` is an implicit `$eq`, operator sub-documents supply
/// the rest. The empty filter matches everything.
pub fn parse_filter(doc: &RawDocument) -> Result<Expression, QueryError> {
    let mut children = Vec::new();

    for result in doc.iter() {
        let (key, value) = result?;
        match key {
            "$and" => children.push(parse_logical_array(value, Expression::And)?),
            "$or" => children.push(parse_logical_array(value, Expression::Or)?),
            "$nor" => children.push(parse_logical_array(value, Expression::Nor)?),
            "$expr" => children.push(Expression::Expr(value.to_raw_bson())),
            "$comment" => {}
            k if k.starts_with('$') => {
                return Err(QueryError::BadValue(format!(
                    "unknown top-level operator: {k}"
                )));
            }
            _ => children.push(parse_field_condition(key, value)?),
        }
    }

    Ok(Expression::and(children))
}

fn parse_logical_array(
    value: RawBsonRef<'_>,
    make: fn(Vec<Expression>) -> Expression,
) -> Result<Expression, QueryError> {
    let RawBsonRef::Array(arr) = value else {
        return Err(QueryError::BadValue(
            "$and/$or/$nor value must be an array".into(),
        ));
    };
    let mut children = Vec::new();
    for elem in arr {
        match elem? {
            RawBsonRef::Document(sub) => children.push(parse_filter(sub)?),
            _ => {
                return Err(QueryError::BadValue(
                    "$and/$or/$nor array elements must be documents".into(),
                ));
            }
        }
    }
    if children.is_empty() {
        return Err(QueryError::BadValue(
            "$and/$or/$nor array must not be empty".into(),
        ));
    }
    Ok(make(children))
}

fn parse_field_condition(field: &str, value: RawBsonRef<'_>) -> Result<Expression, QueryError> {
    if let RawBsonRef::Document(sub) = value
        && first_key_is_operator(sub)
    {
        let preds = parse_operator_doc(sub)?;
        return Ok(Expression::and(
            preds
                .into_iter()
                .map(|p| Expression::Field(field.to_string(), p))
                .collect(),
        ));
    }
    if let RawBsonRef::RegularExpression(re) = value {
        return Ok(Expression::Field(
            field.to_string(),
            FieldPredicate::Regex(compile_regex(re.pattern, re.options)?),
        ));
    }
    Ok(Expression::Field(
        field.to_string(),
        FieldPredicate::Compare(CompareOp::Eq, value.to_raw_bson()),
    ))
}

fn first_key_is_operator(doc: &RawDocument) -> bool {
    matches!(doc.iter().next(), Some(Ok((k, _))) if k.starts_with('$'))
}

/// Parse an operator sub-document like `{$gt: 21, $lte: 100}` into its
/// predicates.
fn parse_operator_doc(doc: &RawDocument) -> Result<Vec<FieldPredicate>, QueryError> {
    let mut preds = Vec::new();
    let mut pending_regex: Option<(String, String)> = None;

    for result in doc.iter() {
        let (op, value) = result?;
        match op {
            "$eq" => preds.push(FieldPredicate::Compare(CompareOp::Eq, value.to_raw_bson())),
            "$ne" => preds.push(FieldPredicate::Compare(CompareOp::Ne, value.to_raw_bson())),
            "$gt" => preds.push(FieldPredicate::Compare(CompareOp::Gt, value.to_raw_bson())),
            "$gte" => preds.push(FieldPredicate::Compare(CompareOp::Gte, value.to_raw_bson())),
            "$lt" => preds.push(FieldPredicate::Compare(CompareOp::Lt, value.to_raw_bson())),
            "$lte" => preds.push(FieldPredicate::Compare(CompareOp::Lte, value.to_raw_bson())),
            "$in" => preds.push(FieldPredicate::In(parse_value_array(op, value)?)),
            "$nin" => preds.push(FieldPredicate::Nin(parse_value_array(op, value)?)),
            "$all" => preds.push(FieldPredicate::All(parse_value_array(op, value)?)),
            "$exists" => preds.push(FieldPredicate::Exists(parse_truthy(value)?)),
            "$type" => preds.push(FieldPredicate::Type(parse_type_operand(value)?)),
            "$size" => {
                let n = as_integer(value).ok_or_else(|| {
                    QueryError::BadValue("$size needs an integer".into())
                })?;
                if n < 0 {
                    return Err(QueryError::BadValue("$size may not be negative".into()));
                }
                preds.push(FieldPredicate::Size(n));
            }
            "$mod" => preds.push(parse_mod(value)?),
            "$regex" => match value {
                RawBsonRef::String(pattern) => {
                    pending_regex
                        .get_or_insert_with(|| (String::new(), String::new()))
                        .0 = pattern.to_string();
                }
                RawBsonRef::RegularExpression(re) => {
                    preds.push(FieldPredicate::Regex(compile_regex(re.pattern, re.options)?));
                }
                _ => return Err(QueryError::BadValue("$regex needs a string".into())),
            },
            "$options" => match value {
                RawBsonRef::String(options) => {
                    pending_regex
                        .get_or_insert_with(|| (String::new(), String::new()))
                        .1 = options.to_string();
                }
                _ => return Err(QueryError::BadValue("$options needs a string".into())),
            },
            "$elemMatch" => preds.push(parse_elem_match(value)?),
            "$not" => preds.push(parse_not(value)?),
            "$bitsAllSet" => preds.push(FieldPredicate::Bits(BitsOp::AllSet, parse_bitmask(value)?)),
            "$bitsAnySet" => preds.push(FieldPredicate::Bits(BitsOp::AnySet, parse_bitmask(value)?)),
            "$bitsAllClear" => {
                preds.push(FieldPredicate::Bits(BitsOp::AllClear, parse_bitmask(value)?));
            }
            "$bitsAnyClear" => {
                preds.push(FieldPredicate::Bits(BitsOp::AnyClear, parse_bitmask(value)?));
            }
            "$comment" => {}
            other => {
                return Err(QueryError::BadValue(format!("unknown operator: {other}")));
            }
        }
    }

    if let Some((pattern, options)) = pending_regex {
        if pattern.is_empty() && options.is_empty() {
            return Err(QueryError::BadValue("$options without $regex".into()));
        }
        preds.push(FieldPredicate::Regex(compile_regex(&pattern, &options)?));
    }
    Ok(preds)
}

fn parse_elem_match(value: RawBsonRef<'_>) -> Result<FieldPredicate, QueryError> {
    let RawBsonRef::Document(sub) = value else {
        return Err(QueryError::BadValue("$elemMatch needs a document".into()));
    };
    // Operator form ({$gt: 5}) applies predicates to each element directly;
    // any non-operator or logical key makes it a full sub-filter over
    // document elements.
    let mut operator_form = true;
    for entry in sub.iter() {
        let (k, _) = entry?;
        if !k.starts_with('$') || matches!(k, "$and" | "$or" | "$nor" | "$expr") {
            operator_form = false;
            break;
        }
    }
    if operator_form {
        Ok(FieldPredicate::ElemMatchPredicates(parse_operator_doc(sub)?))
    } else {
        Ok(FieldPredicate::ElemMatch(Box::new(parse_filter(sub)?)))
    }
}

fn parse_not(value: RawBsonRef<'_>) -> Result<FieldPredicate, QueryError> {
    match value {
        RawBsonRef::Document(sub) if first_key_is_operator(sub) => {
            let preds = parse_operator_doc(sub)?;
            if preds.is_empty() {
                return Err(QueryError::BadValue("$not must not be empty".into()));
            }
            Ok(FieldPredicate::Not(preds))
        }
        RawBsonRef::RegularExpression(re) => Ok(FieldPredicate::Not(vec![FieldPredicate::Regex(
            compile_regex(re.pattern, re.options)?,
        )])),
        _ => Err(QueryError::BadValue(
            "$not needs an operator document or regex".into(),
        )),
    }
}

fn parse_mod(value: RawBsonRef<'_>) -> Result<FieldPredicate, QueryError> {
    let RawBsonRef::Array(arr) = value else {
        return Err(QueryError::BadValue("$mod needs [divisor, remainder]".into()));
    };
    let parts: Vec<i64> = arr
        .into_iter()
        .flatten()
        .filter_map(|v| as_integer(v))
        .collect();
    if parts.len() != 2 {
        return Err(QueryError::BadValue("$mod needs [divisor, remainder]".into()));
    }
    if parts[0] == 0 {
        return Err(QueryError::BadValue("$mod divisor may not be 0".into()));
    }
    Ok(FieldPredicate::Mod {
        divisor: parts[0],
        remainder: parts[1],
    })
}

fn parse_value_array(op: &str, value: RawBsonRef<'_>) -> Result<Vec<bson::RawBson>, QueryError> {
    let RawBsonRef::Array(arr) = value else {
        return Err(QueryError::BadValue(format!("{op} needs an array")));
    };
    let mut out = Vec::new();
    for elem in arr {
        out.push(elem?.to_raw_bson());
    }
    Ok(out)
}

fn parse_truthy(value: RawBsonRef<'_>) -> Result<bool, QueryError> {
    match value {
        RawBsonRef::Boolean(b) => Ok(b),
        RawBsonRef::Int32(n) => Ok(n != 0),
        RawBsonRef::Int64(n) => Ok(n != 0),
        RawBsonRef::Double(d) => Ok(d != 0.0),
        _ => Err(QueryError::BadValue("expected a boolean".into())),
    }
}

fn parse_type_operand(value: RawBsonRef<'_>) -> Result<Vec<TypeMatch>, QueryError> {
    match value {
        RawBsonRef::Array(arr) => {
            let mut out = Vec::new();
            for elem in arr {
                out.push(single_type_match(elem?)?);
            }
            if out.is_empty() {
                return Err(QueryError::BadValue("$type array must not be empty".into()));
            }
            Ok(out)
        }
        other => Ok(vec![single_type_match(other)?]),
    }
}

fn single_type_match(value: RawBsonRef<'_>) -> Result<TypeMatch, QueryError> {
    match value {
        RawBsonRef::String("number") => Ok(TypeMatch::AnyNumber),
        RawBsonRef::String(alias) => type_alias(alias)
            .map(TypeMatch::Tag)
            .ok_or_else(|| QueryError::BadValue(format!("unknown type alias: {alias}"))),
        other => {
            let code = as_integer(other)
                .ok_or_else(|| QueryError::BadValue("$type needs a string or number".into()))?;
            u8::try_from(code)
                .ok()
                .and_then(ElementType::from)
                .map(TypeMatch::Tag)
                .ok_or_else(|| QueryError::BadValue(format!("unknown type code: {code}")))
        }
    }
}

fn type_alias(alias: &str) -> Option<ElementType> {
    Some(match alias {
        "double" => ElementType::Double,
        "string" => ElementType::String,
        "object" => ElementType::EmbeddedDocument,
        "array" => ElementType::Array,
        "binData" => ElementType::Binary,
        "undefined" => ElementType::Undefined,
        "objectId" => ElementType::ObjectId,
        "bool" => ElementType::Boolean,
        "date" => ElementType::DateTime,
        "null" => ElementType::Null,
        "regex" => ElementType::RegularExpression,
        "dbPointer" => ElementType::DbPointer,
        "javascript" => ElementType::JavaScriptCode,
        "symbol" => ElementType::Symbol,
        "javascriptWithScope" => ElementType::JavaScriptCodeWithScope,
        "int" => ElementType::Int32,
        "timestamp" => ElementType::Timestamp,
        "long" => ElementType::Int64,
        "decimal" => ElementType::Decimal128,
        "minKey" => ElementType::MinKey,
        "maxKey" => ElementType::MaxKey,
        _ => return None,
    })
}

/// A bit mask: a non-negative integer, or an array of bit positions.
fn parse_bitmask(value: RawBsonRef<'_>) -> Result<u64, QueryError> {
    match value {
        RawBsonRef::Array(arr) => {
            let mut mask = 0u64;
            for elem in arr {
                let pos = as_integer(elem?)
                    .filter(|&p| (0..64).contains(&p))
                    .ok_or_else(|| {
                        QueryError::BadValue("bit positions must be integers in 0..64".into())
                    })?;
                mask |= 1 << pos;
            }
            Ok(mask)
        }
        other => {
            let n = as_integer(other)
                .ok_or_else(|| QueryError::BadValue("bit mask must be an integer".into()))?;
            if n < 0 {
                return Err(QueryError::BadValue("bit mask may not be negative".into()));
            }
            Ok(n as u64)
        }
    }
}

pub(crate) fn as_integer(value: RawBsonRef<'_>) -> Option<i64> {
    match value {
        RawBsonRef::Int32(n) => Some(i64::from(n)),
        RawBsonRef::Int64(n) => Some(n),
        RawBsonRef::Double(d) if d.fract() == 0.0 && d.abs() < 9.3e18 => Some(d as i64),
        _ => None,
    }
}

pub(crate) fn compile_regex(pattern: &str, options: &str) -> Result<CompiledRegex, QueryError> {
    let mut builder = RegexBuilder::new(pattern);
    for opt in options.chars() {
        match opt {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            // 'u' (unicode) is the engine default; unknown flags are
            // rejected rather than silently dropped.
            'u' => &mut builder,
            other => {
                return Err(QueryError::BadValue(format!(
                    "unsupported regex option: {other}"
                )));
            }
        };
    }
    let regex = builder
        .build()
        .map_err(|e| QueryError::BadRegex(e.to_string()))?;
    Ok(CompiledRegex {
        pattern: pattern.to_string(),
        options: options.to_string(),
        regex,
    })
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    fn parse(doc: &RawDocument) -> Expression {
        parse_filter(doc).unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert_eq!(parse(&rawdoc! {}), Expression::AlwaysTrue);
    }

    #[test]
    fn implicit_eq() {
        let e = parse(&rawdoc! { "name": "Alice" });
        match e {
            Expression::Field(path, FieldPredicate::Compare(CompareOp::Eq, _)) => {
                assert_eq!(path, "name");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn top_level_is_implicit_and() {
        let e = parse(&rawdoc! { "a": 1, "b": 2 });
        assert!(matches!(e, Expression::And(ref v) if v.len() == 2));
    }

    #[test]
    fn operator_doc_produces_multiple_predicates() {
        let e = parse(&rawdoc! { "age": { "$gte": 21, "$lt": 65 } });
        assert!(matches!(e, Expression::And(ref v) if v.len() == 2));
    }

    #[test]
    fn regex_with_options() {
        let e = parse(&rawdoc! { "name": { "$regex": "^a", "$options": "i" } });
        match e {
            Expression::Field(_, FieldPredicate::Regex(re)) => {
                assert_eq!(re.pattern, "^a");
                assert!(re.regex.is_match("Alpha"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn elem_match_forms() {
        let full = parse(&rawdoc! { "items": { "$elemMatch": { "sku": "A" } } });
        assert!(matches!(
            full,
            Expression::Field(_, FieldPredicate::ElemMatch(_))
        ));

        let ops = parse(&rawdoc! { "scores": { "$elemMatch": { "$gt": 80, "$lt": 90 } } });
        assert!(matches!(
            ops,
            Expression::Field(_, FieldPredicate::ElemMatchPredicates(ref v)) if v.len() == 2
        ));
    }

    #[test]
    fn not_wraps_operator_doc() {
        let e = parse(&rawdoc! { "age": { "$not": { "$gt": 30 } } });
        assert!(matches!(
            e,
            Expression::Field(_, FieldPredicate::Not(ref v)) if v.len() == 1
        ));
    }

    #[test]
    fn bit_positions_fold_into_mask() {
        let e = parse(&rawdoc! { "flags": { "$bitsAllSet": [0, 3] } });
        assert!(matches!(
            e,
            Expression::Field(_, FieldPredicate::Bits(BitsOp::AllSet, 0b1001))
        ));
    }

    #[test]
    fn unknown_operator_rejected() {
        let err = parse_filter(&rawdoc! { "a": { "$frobnicate": 1 } }).unwrap_err();
        assert!(matches!(err, QueryError::BadValue(_)));
    }

    #[test]
    fn unknown_top_level_operator_rejected() {
        assert!(parse_filter(&rawdoc! { "$frobnicate": [] }).is_err());
    }

    #[test]
    fn type_aliases() {
        let e = parse(&rawdoc! { "v": { "$type": ["string", "number", 16] } });
        match e {
            Expression::Field(_, FieldPredicate::Type(t)) => {
                assert_eq!(t.len(), 3);
                assert!(t.contains(&TypeMatch::AnyNumber));
                assert!(t.contains(&TypeMatch::Tag(ElementType::Int32)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn mod_validation() {
        assert!(parse_filter(&rawdoc! { "n": { "$mod": [0, 1] } }).is_err());
        assert!(parse_filter(&rawdoc! { "n": { "$mod": [4] } }).is_err());
        assert!(parse_filter(&rawdoc! { "n": { "$mod": [4, 1] } }).is_ok());
    }
}
