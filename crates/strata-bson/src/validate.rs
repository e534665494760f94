use crate::error::{ValueError, ValueErrorKind};

/// Default bound on document nesting during validation.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Validate a BSON document encoding end to end.
///
/// Checks the length prefix against the actual element encodings, rejects
/// unknown type tags, and bounds recursion depth. Errors carry the byte
/// offset they were detected at.
pub fn validate(bytes: &[u8]) -> Result<(), ValueError> {
    validate_with_depth(bytes, DEFAULT_MAX_DEPTH)
}

pub fn validate_with_depth(bytes: &[u8], max_depth: usize) -> Result<(), ValueError> {
    validate_document(bytes, 0, max_depth)
}

fn validate_document(bytes: &[u8], base: usize, depth_left: usize) -> Result<(), ValueError> {
    if depth_left == 0 {
        return Err(ValueError::new(ValueErrorKind::DepthExceeded, base));
    }
    if bytes.len() < 5 {
        return Err(ValueError::new(ValueErrorKind::Truncated, base));
    }
    let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if declared < 5 || declared as usize != bytes.len() {
        return Err(ValueError::new(ValueErrorKind::LengthMismatch, base));
    }
    if bytes[bytes.len() - 1] != 0 {
        return Err(ValueError::new(ValueErrorKind::LengthMismatch, base));
    }

    let mut at = 4usize;
    loop {
        let tag = bytes[at];
        if tag == 0 {
            // Terminator must be the declared last byte.
            if at != bytes.len() - 1 {
                return Err(ValueError::new(ValueErrorKind::LengthMismatch, base + at));
            }
            return Ok(());
        }
        at += 1;
        at = skip_cstring(bytes, at, base)?;
        at = validate_element(bytes, at, tag, base, depth_left)?;
        if at >= bytes.len() {
            return Err(ValueError::new(ValueErrorKind::Truncated, base + at));
        }
    }
}

fn validate_element(
    bytes: &[u8],
    at: usize,
    tag: u8,
    base: usize,
    depth_left: usize,
) -> Result<usize, ValueError> {
    match tag {
        0x01 | 0x09 | 0x11 | 0x12 => fixed(bytes, at, 8, base), // double, datetime, timestamp, int64
        0x02 | 0x0D | 0x0E => skip_string(bytes, at, base),     // string, code, symbol
        0x03 | 0x04 => {
            // document, array
            let len = read_len(bytes, at, base)?;
            let end = at + len;
            validate_document(&bytes[at..end], base + at, depth_left - 1)?;
            Ok(end)
        }
        0x05 => {
            // binary: i32 payload length, subtype byte, payload
            let len = read_i32(bytes, at, base)?;
            if len < 0 {
                return Err(ValueError::new(ValueErrorKind::BadPayload, base + at));
            }
            let end = at + 4 + 1 + len as usize;
            if end > bytes.len() {
                return Err(ValueError::new(ValueErrorKind::Truncated, base + at));
            }
            Ok(end)
        }
        0x06 | 0x0A => Ok(at), // undefined, null
        0x07 => fixed(bytes, at, 12, base),
        0x08 => {
            let end = fixed(bytes, at, 1, base)?;
            if bytes[at] > 1 {
                return Err(ValueError::new(ValueErrorKind::BadPayload, base + at));
            }
            Ok(end)
        }
        0x0B => {
            // regex: two cstrings
            let at = skip_cstring(bytes, at, base)?;
            skip_cstring(bytes, at, base)
        }
        0x0C => {
            // dbpointer: string + 12-byte id
            let at = skip_string(bytes, at, base)?;
            fixed(bytes, at, 12, base)
        }
        0x0F => {
            // code-with-scope: i32 total, string, document
            let total = read_len(bytes, at, base)?;
            let end = at + total;
            let inner = skip_string(bytes, at + 4, base)?;
            let scope_len = read_len(bytes, inner, base)?;
            if inner + scope_len != end {
                return Err(ValueError::new(ValueErrorKind::LengthMismatch, base + at));
            }
            validate_document(&bytes[inner..end], base + inner, depth_left - 1)?;
            Ok(end)
        }
        0x10 => fixed(bytes, at, 4, base),
        0x13 => fixed(bytes, at, 16, base),
        0x7F | 0xFF => Ok(at), // maxkey, minkey
        other => Err(ValueError::new(
            ValueErrorKind::UnknownTypeTag(other),
            base + at - 1,
        )),
    }
}

fn fixed(bytes: &[u8], at: usize, n: usize, base: usize) -> Result<usize, ValueError> {
    if at + n > bytes.len() {
        return Err(ValueError::new(ValueErrorKind::Truncated, base + at));
    }
    Ok(at + n)
}

fn read_i32(bytes: &[u8], at: usize, base: usize) -> Result<i32, ValueError> {
    if at + 4 > bytes.len() {
        return Err(ValueError::new(ValueErrorKind::Truncated, base + at));
    }
    Ok(i32::from_le_bytes([
        bytes[at],
        bytes[at + 1],
        bytes[at + 2],
        bytes[at + 3],
    ]))
}

/// Read a sub-document length and bound it against the buffer.
fn read_len(bytes: &[u8], at: usize, base: usize) -> Result<usize, ValueError> {
    let len = read_i32(bytes, at, base)?;
    if len < 5 {
        return Err(ValueError::new(ValueErrorKind::LengthMismatch, base + at));
    }
    let len = len as usize;
    if at + len > bytes.len() {
        return Err(ValueError::new(ValueErrorKind::Truncated, base + at));
    }
    Ok(len)
}

/// Skip a NUL-terminated name; the bytes must be valid UTF-8.
fn skip_cstring(bytes: &[u8], at: usize, base: usize) -> Result<usize, ValueError> {
    match bytes[at..].iter().position(|&b| b == 0) {
        Some(nul) => {
            if std::str::from_utf8(&bytes[at..at + nul]).is_err() {
                return Err(ValueError::new(ValueErrorKind::BadString, base + at));
            }
            Ok(at + nul + 1)
        }
        None => Err(ValueError::new(ValueErrorKind::BadString, base + at)),
    }
}

/// Skip a length-prefixed string: i32 length including the terminator.
fn skip_string(bytes: &[u8], at: usize, base: usize) -> Result<usize, ValueError> {
    let len = read_i32(bytes, at, base)?;
    if len < 1 {
        return Err(ValueError::new(ValueErrorKind::BadString, base + at));
    }
    let end = at + 4 + len as usize;
    if end > bytes.len() {
        return Err(ValueError::new(ValueErrorKind::Truncated, base + at));
    }
    if bytes[end - 1] != 0 {
        return Err(ValueError::new(ValueErrorKind::BadString, base + at));
    }
    if std::str::from_utf8(&bytes[at + 4..end - 1]).is_err() {
        return Err(ValueError::new(ValueErrorKind::BadString, base + at));
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;
    use crate::error::ValueErrorKind;

    #[test]
    fn well_formed_documents_pass() {
        let doc = rawdoc! {
            "s": "text",
            "n": 42,
            "d": 2.5,
            "inner": { "arr": [1, "two", { "deep": true }] },
            "nil": null,
        };
        assert_eq!(validate(doc.as_bytes()), Ok(()));
    }

    #[test]
    fn empty_document_passes() {
        let doc = rawdoc! {};
        assert_eq!(validate(doc.as_bytes()), Ok(()));
    }

    #[test]
    fn short_buffer_is_truncated() {
        let err = validate(&[4, 0, 0]).unwrap_err();
        assert_eq!(err.kind, ValueErrorKind::Truncated);
    }

    #[test]
    fn length_prefix_mismatch_detected() {
        let doc = rawdoc! { "a": 1 };
        let mut bytes = doc.as_bytes().to_vec();
        bytes[0] = bytes[0].wrapping_add(1);
        let err = validate(&bytes).unwrap_err();
        assert_eq!(err.kind, ValueErrorKind::LengthMismatch);
    }

    #[test]
    fn unknown_tag_reports_offset() {
        let doc = rawdoc! { "a": 1 };
        let mut bytes = doc.as_bytes().to_vec();
        // Tag byte of the first element lives at offset 4.
        bytes[4] = 0x55;
        let err = validate(&bytes).unwrap_err();
        assert_eq!(err.kind, ValueErrorKind::UnknownTypeTag(0x55));
        assert_eq!(err.offset, 4);
    }

    #[test]
    fn bool_payload_must_be_zero_or_one() {
        let doc = rawdoc! { "b": true };
        let mut bytes = doc.as_bytes().to_vec();
        let val_at = bytes.len() - 2;
        bytes[val_at] = 7;
        let err = validate(&bytes).unwrap_err();
        assert_eq!(err.kind, ValueErrorKind::BadPayload);
    }

    #[test]
    fn depth_bound_enforced() {
        let mut doc = rawdoc! { "leaf": 1 };
        for _ in 0..40 {
            doc = rawdoc! { "a": doc };
        }
        assert_eq!(validate(doc.as_bytes()), Ok(()));
        let err = validate_with_depth(doc.as_bytes(), 10).unwrap_err();
        assert_eq!(err.kind, ValueErrorKind::DepthExceeded);
    }

    #[test]
    fn nested_length_corruption_detected() {
        let doc = rawdoc! { "inner": { "a": 1 } };
        let mut bytes = doc.as_bytes().to_vec();
        // Corrupt the inner document's length prefix (after tag + "inner\0").
        let inner_at = 4 + 1 + "inner".len() + 1;
        bytes[inner_at] = bytes[inner_at].wrapping_add(3);
        assert!(validate(&bytes).is_err());
    }
}
