use bson::raw::RawBsonRef;

use crate::compare::sort_class;

// Order-preserving byte encodings for index keys: the standard sign-bit
// XOR for integers, the monotone IEEE 754 transform for doubles. Each key
// starts with the value's sort class so heterogeneous values order the
// same way the canonical comparator orders them.

#[inline]
pub fn encode_i64_sortable(n: i64) -> [u8; 8] {
    ((n as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

#[inline]
pub fn decode_i64_sortable(b: [u8; 8]) -> i64 {
    (u64::from_be_bytes(b) ^ 0x8000_0000_0000_0000) as i64
}

#[inline]
pub fn encode_f64_sortable(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let encoded = if (bits & 0x8000_0000_0000_0000) != 0 {
        !bits // negative: flip all bits
    } else {
        bits ^ 0x8000_0000_0000_0000 // positive: flip sign bit
    };
    encoded.to_be_bytes()
}

#[inline]
pub fn decode_f64_sortable(b: [u8; 8]) -> f64 {
    let encoded = u64::from_be_bytes(b);
    let bits = if (encoded & 0x8000_0000_0000_0000) != 0 {
        encoded ^ 0x8000_0000_0000_0000
    } else {
        !encoded
    };
    f64::from_bits(bits)
}

/// Append a string with 0x00-escaping so embedded NULs keep byte order:
/// `0x00` becomes `0x00 0xFF`, the terminator is `0x00 0x00`.
fn push_escaped_str(out: &mut Vec<u8>, s: &str) {
    for &b in s.as_bytes() {
        out.push(b);
        if b == 0 {
            out.push(0xFF);
        }
    }
    out.push(0);
    out.push(0);
}

/// Encode a value as an order-preserving index key.
///
/// All numeric tags are normalized to the f64 transform so cross-tag
/// ranges scan contiguously (values beyond 2^53 lose precision in the key;
/// the comparator re-checks exactness on fetch). Returns `None` for types
/// an ordered index does not key (documents, arrays, regex, code).
pub fn encode_index_key(value: RawBsonRef<'_>) -> Option<Vec<u8>> {
    let class = sort_class(value.element_type());
    let mut out = Vec::with_capacity(10);
    out.push(class);
    match value {
        RawBsonRef::MinKey | RawBsonRef::MaxKey | RawBsonRef::Null | RawBsonRef::Undefined => {}
        RawBsonRef::Int32(n) => out.extend_from_slice(&encode_f64_sortable(f64::from(n))),
        RawBsonRef::Int64(n) => out.extend_from_slice(&encode_f64_sortable(n as f64)),
        RawBsonRef::Double(d) => out.extend_from_slice(&encode_f64_sortable(d)),
        RawBsonRef::Decimal128(d) => {
            let approx: f64 = d.to_string().parse().unwrap_or(f64::NAN);
            out.extend_from_slice(&encode_f64_sortable(approx));
        }
        RawBsonRef::String(s) | RawBsonRef::Symbol(s) => push_escaped_str(&mut out, s),
        RawBsonRef::ObjectId(oid) => out.extend_from_slice(&oid.bytes()),
        RawBsonRef::Boolean(b) => out.push(u8::from(b)),
        RawBsonRef::DateTime(dt) => {
            out.extend_from_slice(&encode_i64_sortable(dt.timestamp_millis()));
        }
        RawBsonRef::Timestamp(ts) => {
            out.extend_from_slice(&ts.time.to_be_bytes());
            out.extend_from_slice(&ts.increment.to_be_bytes());
        }
        RawBsonRef::Binary(b) => {
            out.extend_from_slice(&(b.bytes.len() as u32).to_be_bytes());
            out.push(u8::from(b.subtype));
            out.extend_from_slice(b.bytes);
        }
        _ => return None,
    }
    Some(out)
}
