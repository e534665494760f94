use std::fmt;

use bson::RawBson;
use regex::Regex;

/// A find/`$match` filter compiled into an owned expression tree.
///
/// Owns field names and operand values so the expression can outlive the
/// spec document it was parsed from; only strings, nested values, and
/// compiled regexes allocate.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Matches every document. The empty filter `{}` parses to this.
    AlwaysTrue,
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Nor(Vec<Expression>),
    /// A predicate applied to the value(s) at a dotted path.
    Field(String, FieldPredicate),
    /// An aggregation-expression predicate (`$expr`); evaluated through a
    /// hook supplied by the caller, since expression evaluation lives a
    /// layer up.
    Expr(RawBson),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldPredicate {
    Compare(CompareOp, RawBson),
    In(Vec<RawBson>),
    Nin(Vec<RawBson>),
    Exists(bool),
    Type(Vec<TypeMatch>),
    Size(i64),
    Mod { divisor: i64, remainder: i64 },
    Regex(CompiledRegex),
    /// Every listed value must be matched by the field.
    All(Vec<RawBson>),
    /// `$elemMatch` with a full sub-filter: some array element (a document)
    /// satisfies the filter.
    ElemMatch(Box<Expression>),
    /// `$elemMatch` in operator form: some array element satisfies every
    /// predicate directly.
    ElemMatchPredicates(Vec<FieldPredicate>),
    /// `$not`: negates the conjunction of the wrapped predicates. Missing
    /// fields satisfy the negation.
    Not(Vec<FieldPredicate>),
    Bits(BitsOp, u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitsOp {
    AllSet,
    AnySet,
    AllClear,
    AnyClear,
}

/// A `$type` operand: a specific element type or the `"number"` alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeMatch {
    Tag(bson::spec::ElementType),
    AnyNumber,
}

/// A compiled `$regex` with its source pattern kept for equality and
/// round-tripping into query trees.
#[derive(Debug, Clone)]
pub struct CompiledRegex {
    pub pattern: String,
    pub options: String,
    pub regex: Regex,
}

impl PartialEq for CompiledRegex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.options == other.options
    }
}

impl fmt::Display for CompiledRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.pattern, self.options)
    }
}

impl Expression {
    /// Conjunction that flattens nested ANDs and drops AlwaysTrue.
    pub fn and(mut exprs: Vec<Expression>) -> Expression {
        exprs.retain(|e| !matches!(e, Expression::AlwaysTrue));
        match exprs.len() {
            0 => Expression::AlwaysTrue,
            1 => exprs.pop().expect("len checked"),
            _ => Expression::And(exprs),
        }
    }

    /// Collect the dotted paths this expression constrains, in first-use
    /// order. Used for index selection.
    pub fn referenced_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::AlwaysTrue | Expression::Expr(_) => {}
            Expression::And(children)
            | Expression::Or(children)
            | Expression::Nor(children) => {
                for c in children {
                    c.collect_paths(out);
                }
            }
            Expression::Field(path, _) => {
                if !out.contains(&path.as_str()) {
                    out.push(path);
                }
            }
        }
    }
}
