use std::hash::{DefaultHasher, Hash, Hasher};

use bson::raw::RawBsonRef;

use crate::compare::{Numeric, as_numeric, sort_class};
use crate::decimal::DecimalParts;

/// Canonical 64-bit hash of a BSON value.
///
/// Agrees with [`compare`](crate::compare): values that compare equal hash
/// equal. All numeric tags are funneled through one canonical numeric form
/// (integral values in i64 range hash the integer, everything else the f64
/// approximation), so `Int32(5)`, `Int64(5)`, `Double(5.0)` and
/// `Decimal128("5")` share a hash.
pub fn hash_value(v: RawBsonRef<'_>) -> i64 {
    let mut hasher = DefaultHasher::new();
    feed(v, &mut hasher);
    hasher.finish() as i64
}

fn feed(v: RawBsonRef<'_>, h: &mut DefaultHasher) {
    let class = sort_class(v.element_type());
    class.hash(h);
    match v {
        _ if class == 2 => {
            if let Some(n) = as_numeric(v) {
                feed_numeric(&n, h);
            }
        }
        RawBsonRef::String(s) | RawBsonRef::Symbol(s) => s.hash(h),
        RawBsonRef::Document(doc) => {
            for entry in doc.iter().flatten() {
                let (name, value) = entry;
                name.hash(h);
                feed(value, h);
            }
        }
        RawBsonRef::Array(arr) => {
            for value in arr.into_iter().flatten() {
                feed(value, h);
            }
        }
        RawBsonRef::Binary(b) => {
            u8::from(b.subtype).hash(h);
            b.bytes.hash(h);
        }
        RawBsonRef::ObjectId(oid) => oid.bytes().hash(h),
        RawBsonRef::Boolean(b) => b.hash(h),
        RawBsonRef::DateTime(dt) => dt.timestamp_millis().hash(h),
        RawBsonRef::Timestamp(ts) => {
            ts.time.hash(h);
            ts.increment.hash(h);
        }
        RawBsonRef::RegularExpression(re) => {
            re.pattern.hash(h);
            re.options.hash(h);
        }
        RawBsonRef::JavaScriptCode(code) => code.hash(h),
        RawBsonRef::JavaScriptCodeWithScope(c) => {
            c.code.hash(h);
            for entry in c.scope.iter().flatten() {
                let (name, value) = entry;
                name.hash(h);
                feed(value, h);
            }
        }
        // Null, Undefined, MinKey, MaxKey, DbPointer: the class is the value.
        _ => {}
    }
}

fn feed_numeric(n: &Numeric, h: &mut DefaultHasher) {
    let exact = match n {
        Numeric::Int(i) => Some(*i),
        Numeric::Float(f) => exact_i64_of_f64(*f),
        Numeric::Decimal(d) => d.to_exact_i64(),
    };
    match exact {
        Some(i) => {
            0u8.hash(h);
            i.hash(h);
        }
        None => {
            let f = match n {
                Numeric::Int(i) => *i as f64,
                Numeric::Float(f) => *f,
                Numeric::Decimal(d) => d.to_f64(),
            };
            1u8.hash(h);
            canonical_f64_bits(f).hash(h);
        }
    }
}

fn exact_i64_of_f64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= -9_223_372_036_854_775_808.0 && f < 9_223_372_036_854_775_808.0 {
        Some(f as i64)
    } else {
        None
    }
}

fn canonical_f64_bits(f: f64) -> u64 {
    if f.is_nan() {
        return f64::NAN.to_bits();
    }
    if f == 0.0 {
        return 0.0f64.to_bits();
    }
    f.to_bits()
}

#[cfg(test)]
mod tests {
    use bson::{Decimal128, rawdoc};
    use std::str::FromStr;

    use super::*;

    #[test]
    fn numeric_tags_share_a_hash() {
        let five = hash_value(RawBsonRef::Int32(5));
        assert_eq!(hash_value(RawBsonRef::Int64(5)), five);
        assert_eq!(hash_value(RawBsonRef::Double(5.0)), five);
        assert_eq!(
            hash_value(RawBsonRef::Decimal128(Decimal128::from_str("5").unwrap())),
            five
        );
    }

    #[test]
    fn distinct_values_rarely_collide() {
        assert_ne!(
            hash_value(RawBsonRef::Int32(5)),
            hash_value(RawBsonRef::Int32(6))
        );
        assert_ne!(
            hash_value(RawBsonRef::String("5")),
            hash_value(RawBsonRef::Int32(5))
        );
    }

    #[test]
    fn nan_hashes_consistently() {
        assert_eq!(
            hash_value(RawBsonRef::Double(f64::NAN)),
            hash_value(RawBsonRef::Double(-f64::NAN))
        );
    }

    #[test]
    fn negative_zero_equals_zero() {
        assert_eq!(
            hash_value(RawBsonRef::Double(-0.0)),
            hash_value(RawBsonRef::Int32(0))
        );
    }

    #[test]
    fn documents_hash_field_order_sensitively() {
        let d1 = rawdoc! { "a": 1, "b": 2 };
        let d2 = rawdoc! { "b": 2, "a": 1 };
        assert_ne!(
            hash_value(RawBsonRef::Document(&d1)),
            hash_value(RawBsonRef::Document(&d2))
        );
    }

    #[test]
    fn equal_documents_hash_equal() {
        let d1 = rawdoc! { "a": [1, 2.0], "b": { "c": "x" } };
        let d2 = rawdoc! { "a": [1.0, 2], "b": { "c": "x" } };
        assert_eq!(
            hash_value(RawBsonRef::Document(&d1)),
            hash_value(RawBsonRef::Document(&d2))
        );
    }
}
