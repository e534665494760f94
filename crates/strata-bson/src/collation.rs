use std::cmp::Ordering;
use std::fmt;

use bson::raw::{RawBsonRef, RawDocument};

/// Longest ICU collation identifier we will emit.
pub const MAX_COLLATION_STRING: usize = 64;

/// A parsed collation specification.
///
/// The full locale-aware comparison is delegated to the host environment;
/// this type validates the spec, carries it through query compilation, and
/// provides the reduced comparison semantics the core needs (strength-based
/// case folding and numeric ordering).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collation {
    pub locale: String,
    /// 1 = primary (base letters), 2 = secondary (+diacritics),
    /// 3 = tertiary (+case, the default), 4, 5.
    pub strength: u8,
    pub case_level: bool,
    pub numeric_ordering: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollationError(pub String);

impl fmt::Display for CollationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid collation: {}", self.0)
    }
}

impl std::error::Error for CollationError {}

impl Collation {
    pub fn parse(spec: &RawDocument) -> Result<Self, CollationError> {
        let mut locale = None;
        let mut strength = 3u8;
        let mut case_level = false;
        let mut numeric_ordering = false;

        for entry in spec.iter() {
            let (key, value) = entry.map_err(|e| CollationError(e.to_string()))?;
            match key {
                "locale" => match value {
                    RawBsonRef::String(s) if !s.is_empty() => locale = Some(s.to_string()),
                    _ => return Err(CollationError("locale must be a non-empty string".into())),
                },
                "strength" => {
                    let n = match value {
                        RawBsonRef::Int32(n) => i64::from(n),
                        RawBsonRef::Int64(n) => n,
                        RawBsonRef::Double(d) if d.fract() == 0.0 => d as i64,
                        _ => return Err(CollationError("strength must be an integer".into())),
                    };
                    if !(1..=5).contains(&n) {
                        return Err(CollationError(format!("strength {n} out of range 1..5")));
                    }
                    strength = n as u8;
                }
                "caseLevel" => match value {
                    RawBsonRef::Boolean(b) => case_level = b,
                    _ => return Err(CollationError("caseLevel must be a boolean".into())),
                },
                "numericOrdering" => match value {
                    RawBsonRef::Boolean(b) => numeric_ordering = b,
                    _ => return Err(CollationError("numericOrdering must be a boolean".into())),
                },
                // caseFirst/alternate/maxVariable/backwards are accepted and
                // passed through to the host comparison; they do not change
                // the reduced semantics here.
                "caseFirst" | "alternate" | "maxVariable" | "backwards" | "normalization"
                | "version" => {}
                other => return Err(CollationError(format!("unknown collation field '{other}'"))),
            }
        }

        let locale = locale.ok_or_else(|| CollationError("missing required 'locale'".into()))?;
        Ok(Self {
            locale,
            strength,
            case_level,
            numeric_ordering,
        })
    }

    /// The simple binary collation: `{locale: "simple"}`.
    pub fn is_simple(&self) -> bool {
        self.locale == "simple"
    }

    /// ICU collation identifier, e.g. `en-u-ks-level1-kc-true`.
    /// Always at most [`MAX_COLLATION_STRING`] bytes.
    pub fn icu_string(&self) -> String {
        let mut s = String::with_capacity(MAX_COLLATION_STRING);
        s.push_str(&self.locale);
        s.push_str("-u-ks-level");
        s.push((b'0' + self.strength) as char);
        if self.case_level {
            s.push_str("-kc-true");
        }
        if self.numeric_ordering {
            s.push_str("-kn-true");
        }
        s.truncate(MAX_COLLATION_STRING);
        s
    }

    /// Compare two strings under this collation.
    pub fn compare_strings(&self, a: &str, b: &str) -> Ordering {
        if self.is_simple() {
            return a.cmp(b);
        }
        if self.numeric_ordering {
            let ord = compare_numeric_segments(self, a, b);
            if ord != Ordering::Equal {
                return ord;
            }
            return Ordering::Equal;
        }
        self.compare_folded(a, b)
    }

    fn compare_folded(&self, a: &str, b: &str) -> Ordering {
        if self.strength <= 2 && !self.case_level {
            let folded = a
                .chars()
                .flat_map(char::to_lowercase)
                .cmp(b.chars().flat_map(char::to_lowercase));
            if folded != Ordering::Equal {
                return folded;
            }
            // Equal at this strength: fall back to code points so the order
            // stays total.
            return a.cmp(b);
        }
        a.cmp(b)
    }
}

/// Numeric-ordering comparison: digit runs compare by value, everything
/// else by the collation's folded order.
fn compare_numeric_segments(collation: &Collation, a: &str, b: &str) -> Ordering {
    let mut ai = a.char_indices().peekable();
    let mut bi = b.char_indices().peekable();
    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((_, ac)), Some((_, bc))) => {
                if ac.is_ascii_digit() && bc.is_ascii_digit() {
                    let an = take_number(&mut ai);
                    let bn = take_number(&mut bi);
                    match an.cmp(&bn) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                } else {
                    let ord = if collation.strength <= 2 {
                        ac.to_lowercase().cmp(bc.to_lowercase())
                    } else {
                        ac.cmp(&bc)
                    };
                    match ord {
                        Ordering::Equal => {
                            ai.next();
                            bi.next();
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn take_number(it: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> u128 {
    let mut n: u128 = 0;
    while let Some((_, c)) = it.peek().copied() {
        if let Some(d) = c.to_digit(10) {
            n = n.saturating_mul(10).saturating_add(u128::from(d));
            it.next();
        } else {
            break;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    #[test]
    fn parse_minimal() {
        let spec = rawdoc! { "locale": "en" };
        let c = Collation::parse(&spec).unwrap();
        assert_eq!(c.locale, "en");
        assert_eq!(c.strength, 3);
        assert!(!c.numeric_ordering);
    }

    #[test]
    fn parse_rejects_missing_locale() {
        let spec = rawdoc! { "strength": 1 };
        assert!(Collation::parse(&spec).is_err());
    }

    #[test]
    fn parse_rejects_bad_strength() {
        let spec = rawdoc! { "locale": "en", "strength": 9 };
        assert!(Collation::parse(&spec).is_err());
    }

    #[test]
    fn icu_string_shape() {
        let spec = rawdoc! { "locale": "en", "strength": 1, "caseLevel": true };
        let c = Collation::parse(&spec).unwrap();
        assert_eq!(c.icu_string(), "en-u-ks-level1-kc-true");
        assert!(c.icu_string().len() <= MAX_COLLATION_STRING);
    }

    #[test]
    fn primary_strength_is_caseless() {
        let spec = rawdoc! { "locale": "en", "strength": 1 };
        let c = Collation::parse(&spec).unwrap();
        assert_eq!(c.compare_strings("Apple", "BANANA"), Ordering::Less);
        assert_ne!(c.compare_strings("apple", "APPLE"), Ordering::Greater);
    }

    #[test]
    fn numeric_ordering_compares_digit_runs() {
        let spec = rawdoc! { "locale": "en", "numericOrdering": true };
        let c = Collation::parse(&spec).unwrap();
        assert_eq!(c.compare_strings("item9", "item10"), Ordering::Less);
        assert_eq!(c.compare_strings("item10", "item10"), Ordering::Equal);
    }

    #[test]
    fn simple_locale_is_byte_order() {
        let spec = rawdoc! { "locale": "simple" };
        let c = Collation::parse(&spec).unwrap();
        assert!(c.is_simple());
        assert_eq!(c.compare_strings("B", "a"), Ordering::Less);
    }
}
