use bson::RawBson;
use bson::raw::{RawBsonRef, RawDocument};

use strata_bson::{PathSpread, compare, extract_path_spread, sort_class, values_equal};

use crate::error::QueryError;
use crate::filter::{BitsOp, CompareOp, CompiledRegex, Expression, FieldPredicate, TypeMatch};
use crate::parse::compile_regex;

/// Hook for evaluating `$expr` operands; supplied by the layer that owns
/// aggregation-expression evaluation.
pub type ExprHook<'h> = dyn Fn(&RawDocument, &RawBson) -> Result<bool, QueryError> + 'h;

/// Evaluate whether a document matches the expression.
pub fn matches(doc: &RawDocument, expr: &Expression) -> Result<bool, QueryError> {
    matches_with(doc, expr, None)
}

pub fn matches_with(
    doc: &RawDocument,
    expr: &Expression,
    hook: Option<&ExprHook<'_>>,
) -> Result<bool, QueryError> {
    match expr {
        Expression::AlwaysTrue => Ok(true),
        Expression::And(children) => {
            for child in children {
                if !matches_with(doc, child, hook)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expression::Or(children) => {
            for child in children {
                if matches_with(doc, child, hook)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expression::Nor(children) => {
            for child in children {
                if matches_with(doc, child, hook)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expression::Field(path, pred) => {
            let spread = extract_path_spread(doc, path);
            let (values, present) = match &spread {
                PathSpread::Missing => (Vec::new(), false),
                PathSpread::One(v) => (vec![*v], true),
                PathSpread::Many(vs) => (vs.clone(), true),
            };
            pred_matches(&values, present, pred)
        }
        Expression::Expr(operand) => match hook {
            Some(hook) => hook(doc, operand),
            None => Err(QueryError::Unsupported(
                "$expr requires an expression evaluation context".into(),
            )),
        },
    }
}

/// Evaluate a predicate against the resolved value(s) of a path.
///
/// Array semantics follow find-query matching: value predicates accept the
/// array itself or any element; `$size`/`$all`/`$elemMatch` operate on the
/// array as a whole.
fn pred_matches(
    values: &[RawBsonRef<'_>],
    present: bool,
    pred: &FieldPredicate,
) -> Result<bool, QueryError> {
    match pred {
        FieldPredicate::Compare(CompareOp::Eq, operand) => {
            Ok(eq_matches(values, present, &operand.as_raw_bson_ref()))
        }
        FieldPredicate::Compare(CompareOp::Ne, operand) => {
            Ok(!eq_matches(values, present, &operand.as_raw_bson_ref()))
        }
        FieldPredicate::Compare(op, operand) => {
            let operand = operand.as_raw_bson_ref();
            Ok(any_candidate(values, |v| ordered_matches(v, operand, *op)))
        }
        FieldPredicate::In(operands) => Ok(in_matches(values, present, operands)),
        FieldPredicate::Nin(operands) => Ok(!in_matches(values, present, operands)),
        FieldPredicate::Exists(expected) => Ok(present == *expected),
        FieldPredicate::Type(wanted) => Ok(any_candidate(values, |v| {
            wanted.iter().any(|t| type_matches(v, *t))
        })),
        FieldPredicate::Size(n) => Ok(values.iter().any(|v| match v {
            RawBsonRef::Array(arr) => arr.into_iter().count() as i64 == *n,
            _ => false,
        })),
        FieldPredicate::Mod { divisor, remainder } => Ok(any_candidate(values, |v| {
            integral_of(v).is_some_and(|n| n % divisor == *remainder)
        })),
        FieldPredicate::Regex(re) => Ok(any_candidate(values, |v| regex_matches(v, re))),
        FieldPredicate::All(operands) => {
            if operands.is_empty() {
                return Ok(false);
            }
            Ok(operands
                .iter()
                .all(|op| eq_matches(values, present, &op.as_raw_bson_ref())))
        }
        FieldPredicate::ElemMatch(filter) => {
            for v in values {
                if let RawBsonRef::Array(arr) = v {
                    for elem in arr.into_iter().flatten() {
                        if let RawBsonRef::Document(elem_doc) = elem
                            && matches(elem_doc, filter)?
                        {
                            return Ok(true);
                        }
                    }
                }
            }
            Ok(false)
        }
        FieldPredicate::ElemMatchPredicates(preds) => {
            for v in values {
                if let RawBsonRef::Array(arr) = v {
                    for elem in arr.into_iter().flatten() {
                        let mut all = true;
                        for p in preds {
                            if !pred_matches(&[elem], true, p)? {
                                all = false;
                                break;
                            }
                        }
                        if all {
                            return Ok(true);
                        }
                    }
                }
            }
            Ok(false)
        }
        FieldPredicate::Not(preds) => {
            for p in preds {
                if !pred_matches(values, present, p)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FieldPredicate::Bits(op, mask) => Ok(any_candidate(values, |v| {
            integral_of(v).is_some_and(|n| {
                let bits = n as u64;
                match op {
                    BitsOp::AllSet => bits & mask == *mask,
                    BitsOp::AnySet => bits & mask != 0,
                    BitsOp::AllClear => bits & mask == 0,
                    BitsOp::AnyClear => bits & mask != *mask,
                }
            })
        })),
    }
}

/// Apply `f` to each resolved value and, for arrays, to each element.
fn any_candidate(values: &[RawBsonRef<'_>], f: impl Fn(RawBsonRef<'_>) -> bool) -> bool {
    for &v in values {
        if let RawBsonRef::Array(arr) = v {
            if arr.into_iter().flatten().any(&f) {
                return true;
            }
        }
        if f(v) {
            return true;
        }
    }
    false
}

fn eq_matches(values: &[RawBsonRef<'_>], present: bool, operand: &RawBsonRef<'_>) -> bool {
    // $eq: null matches both missing fields and explicit null values.
    if matches!(operand, RawBsonRef::Null) && !present {
        return true;
    }
    any_candidate(values, |v| values_equal(v, *operand, None))
}

fn in_matches(values: &[RawBsonRef<'_>], present: bool, operands: &[RawBson]) -> bool {
    operands.iter().any(|op| match op.as_raw_bson_ref() {
        RawBsonRef::RegularExpression(re) => {
            match compile_regex(re.pattern, re.options) {
                Ok(compiled) => any_candidate(values, |v| regex_matches(v, &compiled)),
                Err(_) => false,
            }
        }
        operand => eq_matches(values, present, &operand),
    })
}

/// Ordered comparison with type bracketing: only values in the operand's
/// sort class participate (cross-tag numerics share a class).
fn ordered_matches(value: RawBsonRef<'_>, operand: RawBsonRef<'_>, op: CompareOp) -> bool {
    if sort_class(value.element_type()) != sort_class(operand.element_type()) {
        return false;
    }
    let ord = compare(value, operand, None);
    match op {
        CompareOp::Gt => ord == std::cmp::Ordering::Greater,
        CompareOp::Gte => ord != std::cmp::Ordering::Less,
        CompareOp::Lt => ord == std::cmp::Ordering::Less,
        CompareOp::Lte => ord != std::cmp::Ordering::Greater,
        CompareOp::Eq | CompareOp::Ne => unreachable!("handled by eq_matches"),
    }
}

fn type_matches(value: RawBsonRef<'_>, wanted: TypeMatch) -> bool {
    match wanted {
        TypeMatch::AnyNumber => strata_bson::is_numeric(value.element_type()),
        TypeMatch::Tag(tag) => value.element_type() == tag,
    }
}

fn regex_matches(value: RawBsonRef<'_>, re: &CompiledRegex) -> bool {
    match value {
        RawBsonRef::String(s) => re.regex.is_match(s),
        _ => false,
    }
}

fn integral_of(value: RawBsonRef<'_>) -> Option<i64> {
    crate::parse::as_integer(value)
}

/// Index of the first element of the array at `array_path` that satisfies
/// every predicate the filter places on that array. This backs the `$`
/// positional projection operator.
///
/// Returns `Ok(None)` when the filter does not constrain the array or no
/// element matches.
pub fn first_match_index(
    doc: &RawDocument,
    array_path: &str,
    expr: &Expression,
) -> Result<Option<usize>, QueryError> {
    let mut preds: Vec<(&str, &FieldPredicate)> = Vec::new();
    collect_array_predicates(expr, array_path, &mut preds);
    if preds.is_empty() {
        return Ok(None);
    }

    let Some(RawBsonRef::Array(arr)) = strata_bson::extract_path(doc, array_path) else {
        return Ok(None);
    };

    'element: for (index, elem) in arr.into_iter().flatten().enumerate() {
        for (suffix, pred) in &preds {
            let ok = if suffix.is_empty() {
                pred_matches(&[elem], true, pred)?
            } else if let RawBsonRef::Document(elem_doc) = elem {
                let spread = extract_path_spread(elem_doc, suffix);
                let (values, present) = match &spread {
                    PathSpread::Missing => (Vec::new(), false),
                    PathSpread::One(v) => (vec![*v], true),
                    PathSpread::Many(vs) => (vs.clone(), true),
                };
                pred_matches(&values, present, pred)?
            } else {
                false
            };
            if !ok {
                continue 'element;
            }
        }
        return Ok(Some(index));
    }
    Ok(None)
}

fn collect_array_predicates<'e>(
    expr: &'e Expression,
    array_path: &str,
    out: &mut Vec<(&'e str, &'e FieldPredicate)>,
) {
    match expr {
        Expression::And(children) => {
            for c in children {
                collect_array_predicates(c, array_path, out);
            }
        }
        Expression::Field(path, pred) => {
            if path == array_path {
                out.push(("", pred));
            } else if let Some(suffix) = path
                .strip_prefix(array_path)
                .and_then(|rest| rest.strip_prefix('.'))
            {
                out.push((suffix, pred));
            }
        }
        // Disjunctions don't pin a single element; the positional operator
        // only honors conjunctive constraints.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;
    use crate::parse::parse_filter;

    fn check(doc: &RawDocument, filter: &RawDocument) -> bool {
        matches(doc, &parse_filter(filter).unwrap()).unwrap()
    }

    #[test]
    fn implicit_eq_and_operators() {
        let doc = rawdoc! { "name": "Alice", "age": 30 };
        assert!(check(&doc, &rawdoc! { "name": "Alice" }));
        assert!(!check(&doc, &rawdoc! { "name": "Bob" }));
        assert!(check(&doc, &rawdoc! { "age": { "$gte": 21, "$lt": 65 } }));
        assert!(!check(&doc, &rawdoc! { "age": { "$gt": 30 } }));
    }

    #[test]
    fn cross_type_numeric_eq() {
        let doc = rawdoc! { "n": 5i64 };
        assert!(check(&doc, &rawdoc! { "n": 5.0 }));
        assert!(check(&doc, &rawdoc! { "n": 5 }));
    }

    #[test]
    fn eq_null_matches_missing_and_null() {
        let with_null = rawdoc! { "a": null };
        let without = rawdoc! { "b": 1 };
        let filter = rawdoc! { "a": null };
        assert!(check(&with_null, &filter));
        assert!(check(&without, &filter));
        assert!(!check(&rawdoc! { "a": 1 }, &filter));
    }

    #[test]
    fn array_any_element_semantics() {
        let doc = rawdoc! { "tags": ["red", "green"] };
        assert!(check(&doc, &rawdoc! { "tags": "red" }));
        assert!(!check(&doc, &rawdoc! { "tags": "blue" }));

        let nums = rawdoc! { "scores": [70, 85, 92] };
        assert!(check(&nums, &rawdoc! { "scores": { "$gt": 90 } }));
        assert!(!check(&nums, &rawdoc! { "scores": { "$gt": 95 } }));
    }

    #[test]
    fn whole_array_equality() {
        let doc = rawdoc! { "tags": ["a", "b"] };
        assert!(check(&doc, &rawdoc! { "tags": ["a", "b"] }));
        assert!(!check(&doc, &rawdoc! { "tags": ["b", "a"] }));
    }

    #[test]
    fn dotted_paths_map_over_arrays() {
        let doc = rawdoc! { "items": [{ "sku": "A" }, { "sku": "B" }] };
        assert!(check(&doc, &rawdoc! { "items.sku": "B" }));
        assert!(!check(&doc, &rawdoc! { "items.sku": "C" }));
    }

    #[test]
    fn type_bracketing_excludes_cross_class_ranges() {
        let doc = rawdoc! { "v": "10" };
        // A string never satisfies a numeric range.
        assert!(!check(&doc, &rawdoc! { "v": { "$gt": 5 } }));
        assert!(check(&doc, &rawdoc! { "v": { "$gt": "0" } }));
    }

    #[test]
    fn in_nin() {
        let doc = rawdoc! { "status": "active" };
        assert!(check(&doc, &rawdoc! { "status": { "$in": ["active", "idle"] } }));
        assert!(!check(&doc, &rawdoc! { "status": { "$nin": ["active"] } }));
        // $in with null matches a missing field.
        assert!(check(&rawdoc! { "x": 1 }, &rawdoc! { "status": { "$in": [null] } }));
    }

    #[test]
    fn exists_counts_null_as_present() {
        let doc = rawdoc! { "a": null };
        assert!(check(&doc, &rawdoc! { "a": { "$exists": true } }));
        assert!(check(&doc, &rawdoc! { "b": { "$exists": false } }));
    }

    #[test]
    fn size_all_elem_match() {
        let doc = rawdoc! { "tags": ["x", "y", "z"], "items": [{ "q": 5 }, { "q": 20 }] };
        assert!(check(&doc, &rawdoc! { "tags": { "$size": 3 } }));
        assert!(!check(&doc, &rawdoc! { "tags": { "$size": 2 } }));
        assert!(check(&doc, &rawdoc! { "tags": { "$all": ["x", "z"] } }));
        assert!(!check(&doc, &rawdoc! { "tags": { "$all": ["x", "w"] } }));
        assert!(check(&doc, &rawdoc! { "items": { "$elemMatch": { "q": { "$gt": 10 } } } }));
    }

    #[test]
    fn elem_match_operator_form_pins_one_element() {
        // No single element is both >80 and <85, though the array spans both.
        let doc = rawdoc! { "scores": [75, 90] };
        assert!(!check(
            &doc,
            &rawdoc! { "scores": { "$elemMatch": { "$gt": 80, "$lt": 85 } } }
        ));
        assert!(check(
            &doc,
            &rawdoc! { "scores": { "$elemMatch": { "$gt": 80, "$lt": 95 } } }
        ));
    }

    #[test]
    fn not_negates_including_missing() {
        let doc = rawdoc! { "age": 30 };
        assert!(!check(&doc, &rawdoc! { "age": { "$not": { "$gte": 21 } } }));
        assert!(check(&doc, &rawdoc! { "age": { "$not": { "$gt": 40 } } }));
        // Missing field satisfies $not.
        assert!(check(&rawdoc! { "x": 1 }, &rawdoc! { "age": { "$not": { "$gt": 0 } } }));
    }

    #[test]
    fn logical_or_nor() {
        let doc = rawdoc! { "a": 1, "b": 2 };
        assert!(check(&doc, &rawdoc! { "$or": [{ "a": 9 }, { "b": 2 }] }));
        assert!(check(&doc, &rawdoc! { "$nor": [{ "a": 9 }, { "b": 9 }] }));
        assert!(!check(&doc, &rawdoc! { "$nor": [{ "a": 1 }] }));
    }

    #[test]
    fn mod_and_bits() {
        let doc = rawdoc! { "n": 10 };
        assert!(check(&doc, &rawdoc! { "n": { "$mod": [4, 2] } }));
        assert!(!check(&doc, &rawdoc! { "n": { "$mod": [4, 0] } }));
        // 10 = 0b1010
        assert!(check(&doc, &rawdoc! { "n": { "$bitsAllSet": [1, 3] } }));
        assert!(check(&doc, &rawdoc! { "n": { "$bitsAllClear": [0, 2] } }));
        assert!(!check(&doc, &rawdoc! { "n": { "$bitsAnySet": [0, 2] } }));
    }

    #[test]
    fn regex_matching() {
        let doc = rawdoc! { "name": "Strata Engine" };
        assert!(check(&doc, &rawdoc! { "name": { "$regex": "^strata", "$options": "i" } }));
        assert!(!check(&doc, &rawdoc! { "name": { "$regex": "^engine" } }));
    }

    #[test]
    fn expr_without_hook_errors() {
        let doc = rawdoc! { "a": 1 };
        let expr = parse_filter(&rawdoc! { "$expr": { "$gt": ["$a", 0] } }).unwrap();
        assert!(matches(&doc, &expr).is_err());
    }

    #[test]
    fn positional_first_match_index() {
        let doc = rawdoc! {
            "grades": [
                { "s": "math", "g": 85 },
                { "s": "eng", "g": 90 },
                { "s": "art", "g": 95 }
            ]
        };
        let expr = parse_filter(&rawdoc! { "grades.g": { "$gte": 90 } }).unwrap();
        assert_eq!(first_match_index(&doc, "grades", &expr).unwrap(), Some(1));

        let none = parse_filter(&rawdoc! { "grades.g": { "$gt": 100 } }).unwrap();
        assert_eq!(first_match_index(&doc, "grades", &none).unwrap(), None);

        let unrelated = parse_filter(&rawdoc! { "other": 1 }).unwrap();
        assert_eq!(first_match_index(&doc, "grades", &unrelated).unwrap(), None);
    }

    #[test]
    fn positional_on_scalar_array() {
        let doc = rawdoc! { "scores": [70, 85, 92] };
        let expr = parse_filter(&rawdoc! { "scores": { "$gte": 85 } }).unwrap();
        assert_eq!(first_match_index(&doc, "scores", &expr).unwrap(), Some(1));
    }
}
