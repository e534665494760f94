use std::cmp::Ordering;

use bson::raw::{RawArray, RawBsonRef, RawDocument};
use bson::spec::ElementType;

use crate::collation::Collation;
use crate::decimal::{DecimalParts, compare_parts};

/// Canonical cross-type sort class. Values of different classes order by
/// class alone; values of the same class order by the per-class rules in
/// [`compare`].
pub fn sort_class(t: ElementType) -> u8 {
    match t {
        ElementType::MinKey => 0,
        ElementType::Null | ElementType::Undefined => 1,
        ElementType::Int32 | ElementType::Int64 | ElementType::Double | ElementType::Decimal128 => {
            2
        }
        ElementType::String | ElementType::Symbol => 3,
        ElementType::EmbeddedDocument => 4,
        ElementType::Array => 5,
        ElementType::Binary => 6,
        ElementType::ObjectId => 7,
        ElementType::DbPointer => 8,
        ElementType::Boolean => 9,
        ElementType::DateTime => 10,
        ElementType::Timestamp => 11,
        ElementType::RegularExpression => 12,
        ElementType::JavaScriptCode => 13,
        ElementType::JavaScriptCodeWithScope => 14,
        ElementType::MaxKey => 15,
    }
}

pub fn is_numeric(t: ElementType) -> bool {
    sort_class(t) == 2
}

/// A numeric value lifted out of its BSON tag for mathematical comparison.
pub(crate) enum Numeric {
    Int(i64),
    Float(f64),
    Decimal(DecimalParts),
}

pub(crate) fn as_numeric(v: RawBsonRef<'_>) -> Option<Numeric> {
    match v {
        RawBsonRef::Int32(n) => Some(Numeric::Int(i64::from(n))),
        RawBsonRef::Int64(n) => Some(Numeric::Int(n)),
        RawBsonRef::Double(d) => Some(Numeric::Float(d)),
        RawBsonRef::Decimal128(d) => Some(Numeric::Decimal(DecimalParts::from_decimal128(&d))),
        _ => None,
    }
}

/// Compare two BSON values under the canonical total order.
///
/// Cross-tag numbers compare by mathematical value (NaN below every number,
/// equal to NaN). Strings use `collation` when provided, byte order
/// otherwise. Documents compare pairwise in field order; arrays
/// elementwise.
pub fn compare(a: RawBsonRef<'_>, b: RawBsonRef<'_>, collation: Option<&Collation>) -> Ordering {
    let (ac, bc) = (sort_class(a.element_type()), sort_class(b.element_type()));
    if ac != bc {
        return ac.cmp(&bc);
    }
    match (a, b) {
        // Numbers: all four tags share a class.
        _ if ac == 2 => match (as_numeric(a), as_numeric(b)) {
            (Some(x), Some(y)) => compare_numeric(&x, &y),
            _ => Ordering::Equal,
        },

        (RawBsonRef::String(x), RawBsonRef::String(y))
        | (RawBsonRef::String(x), RawBsonRef::Symbol(y))
        | (RawBsonRef::Symbol(x), RawBsonRef::String(y))
        | (RawBsonRef::Symbol(x), RawBsonRef::Symbol(y)) => compare_strings(x, y, collation),

        (RawBsonRef::Document(x), RawBsonRef::Document(y)) => compare_documents(x, y, collation),
        (RawBsonRef::Array(x), RawBsonRef::Array(y)) => compare_arrays(x, y, collation),

        (RawBsonRef::Binary(x), RawBsonRef::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then_with(|| x.bytes.cmp(y.bytes)),

        (RawBsonRef::ObjectId(x), RawBsonRef::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (RawBsonRef::Boolean(x), RawBsonRef::Boolean(y)) => x.cmp(&y),
        (RawBsonRef::DateTime(x), RawBsonRef::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (RawBsonRef::Timestamp(x), RawBsonRef::Timestamp(y)) => x
            .time
            .cmp(&y.time)
            .then_with(|| x.increment.cmp(&y.increment)),
        (RawBsonRef::RegularExpression(x), RawBsonRef::RegularExpression(y)) => x
            .pattern
            .cmp(y.pattern)
            .then_with(|| x.options.cmp(y.options)),
        (RawBsonRef::JavaScriptCode(x), RawBsonRef::JavaScriptCode(y)) => x.cmp(y),
        (RawBsonRef::JavaScriptCodeWithScope(x), RawBsonRef::JavaScriptCodeWithScope(y)) => x
            .code
            .cmp(y.code)
            .then_with(|| compare_documents(x.scope, y.scope, collation)),

        // MinKey, MaxKey, Null, Undefined, DbPointer: no finer order
        // within the class.
        _ => Ordering::Equal,
    }
}

/// Equality under the canonical order.
pub fn values_equal(a: RawBsonRef<'_>, b: RawBsonRef<'_>, collation: Option<&Collation>) -> bool {
    compare(a, b, collation) == Ordering::Equal
}

fn compare_strings(a: &str, b: &str, collation: Option<&Collation>) -> Ordering {
    match collation {
        Some(c) => c.compare_strings(a, b),
        None => a.as_bytes().cmp(b.as_bytes()),
    }
}

pub(crate) fn compare_numeric(a: &Numeric, b: &Numeric) -> Ordering {
    use Numeric::*;
    match (a, b) {
        (Int(x), Int(y)) => x.cmp(y),
        (Float(x), Float(y)) => compare_f64(*x, *y),
        (Int(x), Float(y)) => compare_i64_f64(*x, *y),
        (Float(x), Int(y)) => compare_i64_f64(*y, *x).reverse(),
        (Decimal(x), Decimal(y)) => compare_parts(x, y),
        (Decimal(x), Int(y)) => compare_parts(x, &DecimalParts::from_i64(*y)),
        (Int(x), Decimal(y)) => compare_parts(&DecimalParts::from_i64(*x), y),
        (Decimal(x), Float(y)) => compare_parts(x, &DecimalParts::from_f64(*y)),
        (Float(x), Decimal(y)) => compare_parts(&DecimalParts::from_f64(*x), y),
    }
}

/// Total order on doubles: NaN equals NaN and sorts below every number.
fn compare_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Exact comparison of an i64 against a double, without the precision loss
/// of a single `as f64` cast.
fn compare_i64_f64(a: i64, b: f64) -> Ordering {
    if b.is_nan() {
        return Ordering::Greater;
    }
    // 2^63 is exactly representable; anything at or above it exceeds i64.
    if b >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    if b < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let truncated = b.trunc() as i64;
    match a.cmp(&truncated) {
        Ordering::Equal => {
            let fract = b - b.trunc();
            if fract > 0.0 {
                Ordering::Less
            } else if fract < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn compare_documents(a: &RawDocument, b: &RawDocument, collation: Option<&Collation>) -> Ordering {
    let mut ai = a.iter();
    let mut bi = b.iter();
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(Ok((ak, av))), Some(Ok((bk, bv)))) => {
                let by_name = ak.as_bytes().cmp(bk.as_bytes());
                if by_name != Ordering::Equal {
                    return by_name;
                }
                let by_value = compare(av, bv, collation);
                if by_value != Ordering::Equal {
                    return by_value;
                }
            }
            // A malformed document sorts after well-formed content; decode
            // errors are surfaced by validation, not by ordering.
            (Some(Err(_)), _) => return Ordering::Greater,
            (_, Some(Err(_))) => return Ordering::Less,
        }
    }
}

fn compare_arrays(a: &RawArray, b: &RawArray, collation: Option<&Collation>) -> Ordering {
    let mut ai = a.into_iter();
    let mut bi = b.into_iter();
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(Ok(av)), Some(Ok(bv))) => {
                let ord = compare(av, bv, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(Err(_)), _) => return Ordering::Greater,
            (_, Some(Err(_))) => return Ordering::Less,
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::oid::ObjectId;
    use bson::{Decimal128, rawdoc};
    use std::str::FromStr;

    use super::*;

    fn cmp(a: RawBsonRef<'_>, b: RawBsonRef<'_>) -> Ordering {
        compare(a, b, None)
    }

    #[test]
    fn type_classes_order() {
        let doc = rawdoc! { "d": {}, "a": [], "s": "x" };
        let d = doc.get("d").unwrap().unwrap();
        let a = doc.get("a").unwrap().unwrap();
        let s = doc.get("s").unwrap().unwrap();

        assert_eq!(cmp(RawBsonRef::MinKey, RawBsonRef::Null), Ordering::Less);
        assert_eq!(cmp(RawBsonRef::Null, RawBsonRef::Int32(0)), Ordering::Less);
        assert_eq!(cmp(RawBsonRef::Int32(99), s), Ordering::Less);
        assert_eq!(cmp(s, d), Ordering::Less);
        assert_eq!(cmp(d, a), Ordering::Less);
        assert_eq!(
            cmp(a, RawBsonRef::ObjectId(ObjectId::new())),
            Ordering::Less
        );
        assert_eq!(
            cmp(RawBsonRef::Boolean(true), RawBsonRef::MaxKey),
            Ordering::Less
        );
    }

    #[test]
    fn cross_tag_numbers_compare_mathematically() {
        assert_eq!(
            cmp(RawBsonRef::Int32(2), RawBsonRef::Double(2.0)),
            Ordering::Equal
        );
        assert_eq!(
            cmp(RawBsonRef::Int64(3), RawBsonRef::Double(2.5)),
            Ordering::Greater
        );
        assert_eq!(
            cmp(RawBsonRef::Double(-0.5), RawBsonRef::Int32(0)),
            Ordering::Less
        );
    }

    #[test]
    fn large_i64_vs_double_is_exact() {
        // 2^53 + 1 is not representable as f64; a naive cast would
        // declare these equal.
        let n = (1i64 << 53) + 1;
        assert_eq!(
            cmp(RawBsonRef::Int64(n), RawBsonRef::Double((1i64 << 53) as f64)),
            Ordering::Greater
        );
        assert_eq!(
            cmp(RawBsonRef::Int64(i64::MAX), RawBsonRef::Double(1e19)),
            Ordering::Less
        );
    }

    #[test]
    fn nan_below_all_numbers_equal_to_nan() {
        assert_eq!(
            cmp(RawBsonRef::Double(f64::NAN), RawBsonRef::Double(f64::NAN)),
            Ordering::Equal
        );
        assert_eq!(
            cmp(RawBsonRef::Double(f64::NAN), RawBsonRef::Int64(i64::MIN)),
            Ordering::Less
        );
        assert_eq!(
            cmp(RawBsonRef::Double(f64::NAN), RawBsonRef::Double(f64::NEG_INFINITY)),
            Ordering::Less
        );
        // But NaN still sorts above every non-numeric lower class.
        assert_eq!(
            cmp(RawBsonRef::Double(f64::NAN), RawBsonRef::Null),
            Ordering::Greater
        );
    }

    #[test]
    fn decimal_compares_against_all_numeric_tags() {
        let d = Decimal128::from_str("2.5").unwrap();
        assert_eq!(
            cmp(RawBsonRef::Decimal128(d), RawBsonRef::Int32(2)),
            Ordering::Greater
        );
        assert_eq!(
            cmp(RawBsonRef::Decimal128(d), RawBsonRef::Double(2.5)),
            Ordering::Equal
        );
        assert_eq!(
            cmp(RawBsonRef::Decimal128(d), RawBsonRef::Int64(3)),
            Ordering::Less
        );
    }

    #[test]
    fn antisymmetry() {
        let doc = rawdoc! {
            "vals": [1, "a", 2.5, {"x": 1}, [1, 2], true, null]
        };
        let arr = match doc.get("vals").unwrap().unwrap() {
            RawBsonRef::Array(a) => a,
            _ => unreachable!(),
        };
        let vals: Vec<_> = arr.into_iter().map(|v| v.unwrap()).collect();
        for &a in &vals {
            for &b in &vals {
                assert_eq!(cmp(a, b), cmp(b, a).reverse());
            }
        }
    }

    #[test]
    fn documents_compare_in_field_order() {
        let d1 = rawdoc! { "a": 1, "b": 2 };
        let d2 = rawdoc! { "a": 1, "b": 3 };
        let d3 = rawdoc! { "b": 2, "a": 1 };
        assert_eq!(
            cmp(RawBsonRef::Document(&d1), RawBsonRef::Document(&d2)),
            Ordering::Less
        );
        // Field order participates in the comparison.
        assert_ne!(
            cmp(RawBsonRef::Document(&d1), RawBsonRef::Document(&d3)),
            Ordering::Equal
        );
    }

    #[test]
    fn arrays_compare_elementwise_then_length() {
        let d = rawdoc! { "a": [1, 2], "b": [1, 2, 0], "c": [1, 3] };
        let a = d.get("a").unwrap().unwrap();
        let b = d.get("b").unwrap().unwrap();
        let c = d.get("c").unwrap().unwrap();
        assert_eq!(cmp(a, b), Ordering::Less); // prefix is shorter
        assert_eq!(cmp(a, c), Ordering::Less); // 2 < 3 decides
    }

    #[test]
    fn strings_use_collation_when_given() {
        let spec = rawdoc! { "locale": "en", "strength": 1 };
        let collation = crate::Collation::parse(&spec).unwrap();
        assert_eq!(
            compare(
                RawBsonRef::String("HELLO"),
                RawBsonRef::String("hello"),
                Some(&collation)
            ),
            Ordering::Equal
        );
        assert_eq!(
            compare(RawBsonRef::String("HELLO"), RawBsonRef::String("hello"), None),
            Ordering::Less
        );
    }
}
