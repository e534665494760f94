/// What an index entry can be asked to match: the strategy vocabulary
/// shared between operator-class glue and the query compiler.
///
/// Strategies in the `Not*` family are negations; index results for them
/// must be wrapped with an anti-match by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexStrategy {
    Equal,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    In,
    NotEqual,
    NotIn,
    Regex,
    Exists,
    Size,
    Type,
    All,
    BitsAllClear,
    BitsAnyClear,
    BitsAllSet,
    BitsAnySet,
    Mod,
    OrderBy,
    Text,
    GeoWithin,
    GeoIntersects,
    Range,
    NotGreater,
    NotGreaterEqual,
    NotLess,
    NotLessEqual,
    GeoNear,
    GeoNearRange,
    CompositeQuery,
    IsMultikey,
    OrderByReverse,
    HasTruncatedTerms,
}

impl IndexStrategy {
    /// Negation strategies require wrapping index results with an
    /// anti-match.
    pub fn is_negation(self) -> bool {
        matches!(
            self,
            IndexStrategy::NotEqual
                | IndexStrategy::NotIn
                | IndexStrategy::NotGreater
                | IndexStrategy::NotGreaterEqual
                | IndexStrategy::NotLess
                | IndexStrategy::NotLessEqual
        )
    }

    /// Whether the strategy describes an ordered range over the key space
    /// (candidates for range-scan splitting).
    pub fn is_range(self) -> bool {
        matches!(
            self,
            IndexStrategy::Greater
                | IndexStrategy::GreaterEqual
                | IndexStrategy::Less
                | IndexStrategy::LessEqual
                | IndexStrategy::Range
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negations() {
        assert!(IndexStrategy::NotEqual.is_negation());
        assert!(IndexStrategy::NotLessEqual.is_negation());
        assert!(!IndexStrategy::Equal.is_negation());
        assert!(!IndexStrategy::GeoNear.is_negation());
    }

    #[test]
    fn ranges() {
        assert!(IndexStrategy::Greater.is_range());
        assert!(IndexStrategy::Range.is_range());
        assert!(!IndexStrategy::Text.is_range());
    }
}
