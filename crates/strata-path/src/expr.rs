use bson::RawBson;
use bson::raw::{RawBsonRef, RawDocument};

use strata_bson::{ArrayWriter, DocumentWriter, PathSpread, compare, extract_path_spread};

use crate::error::PathError;
use crate::vars::{TimeSnapshot, VarScope};

/// An aggregation expression compiled from a spec value.
///
/// Covers the operator set projection and `$addFields` need; constants
/// pass through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledExpression {
    Constant(RawBson),
    /// `"$a.b"` — a path into the current document.
    FieldPath(String),
    /// `"$$NOW"`, `"$$ROOT"`, `"$$userVar"` — the name without `$$`.
    Variable(String),
    /// `{a: <expr>, b: <expr>}` — document constructor.
    DocumentCtor(Vec<(String, CompiledExpression)>),
    /// `[<expr>, ...]` — array constructor.
    ArrayCtor(Vec<CompiledExpression>),
    Let {
        vars: Vec<(String, CompiledExpression)>,
        body: Box<CompiledExpression>,
    },
    Cond {
        condition: Box<CompiledExpression>,
        then: Box<CompiledExpression>,
        otherwise: Box<CompiledExpression>,
    },
    IfNull(Vec<CompiledExpression>),
    Op(ExprOp, Vec<CompiledExpression>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    And,
    Or,
    Not,
    Concat,
    ToUpper,
    ToLower,
    StrLenCp,
    Size,
    ArrayElemAt,
    First,
    Last,
    Type,
    Literal,
}

fn op_by_name(name: &str) -> Option<ExprOp> {
    Some(match name {
        "$add" => ExprOp::Add,
        "$subtract" => ExprOp::Subtract,
        "$multiply" => ExprOp::Multiply,
        "$divide" => ExprOp::Divide,
        "$mod" => ExprOp::Mod,
        "$abs" => ExprOp::Abs,
        "$eq" => ExprOp::Eq,
        "$ne" => ExprOp::Ne,
        "$gt" => ExprOp::Gt,
        "$gte" => ExprOp::Gte,
        "$lt" => ExprOp::Lt,
        "$lte" => ExprOp::Lte,
        "$cmp" => ExprOp::Cmp,
        "$and" => ExprOp::And,
        "$or" => ExprOp::Or,
        "$not" => ExprOp::Not,
        "$concat" => ExprOp::Concat,
        "$toUpper" => ExprOp::ToUpper,
        "$toLower" => ExprOp::ToLower,
        "$strLenCP" => ExprOp::StrLenCp,
        "$size" => ExprOp::Size,
        "$arrayElemAt" => ExprOp::ArrayElemAt,
        "$first" => ExprOp::First,
        "$last" => ExprOp::Last,
        "$type" => ExprOp::Type,
        _ => return None,
    })
}

/// Compile a spec value into an expression.
pub fn compile(value: RawBsonRef<'_>) -> Result<CompiledExpression, PathError> {
    match value {
        RawBsonRef::String(s) => {
            if let Some(var) = s.strip_prefix("$$") {
                Ok(CompiledExpression::Variable(var.to_string()))
            } else if let Some(path) = s.strip_prefix('$') {
                if path.is_empty() {
                    return Err(PathError::BadValue("empty field path".into()));
                }
                Ok(CompiledExpression::FieldPath(path.to_string()))
            } else {
                Ok(CompiledExpression::Constant(RawBson::String(s.to_string())))
            }
        }
        RawBsonRef::Document(doc) => compile_document(doc),
        RawBsonRef::Array(arr) => {
            let mut elems = Vec::new();
            for elem in arr {
                elems.push(compile(elem?)?);
            }
            Ok(CompiledExpression::ArrayCtor(elems))
        }
        other => Ok(CompiledExpression::Constant(other.to_raw_bson())),
    }
}

/// Compile a spec value treating everything as constant (wildcard-index
/// specs and similar).
pub fn compile_constant(value: RawBsonRef<'_>) -> CompiledExpression {
    CompiledExpression::Constant(value.to_raw_bson())
}

fn compile_document(doc: &RawDocument) -> Result<CompiledExpression, PathError> {
    let first_key = match doc.iter().next() {
        Some(entry) => entry?.0,
        None => return Ok(CompiledExpression::DocumentCtor(Vec::new())),
    };

    if !first_key.starts_with('$') {
        let mut fields = Vec::new();
        for entry in doc.iter() {
            let (key, value) = entry?;
            if key.starts_with('$') {
                return Err(PathError::BadValue(format!(
                    "operator '{key}' mixed into a document constructor"
                )));
            }
            fields.push((key.to_string(), compile(value)?));
        }
        return Ok(CompiledExpression::DocumentCtor(fields));
    }

    // Operator document: exactly one $-key.
    let mut iter = doc.iter();
    let (op_name, operand) = iter.next().expect("first key checked")?;
    if iter.next().is_some() {
        return Err(PathError::BadValue(format!(
            "an expression specification must contain exactly one operator, found more after '{op_name}'"
        )));
    }

    match op_name {
        "$literal" => Ok(CompiledExpression::Constant(operand.to_raw_bson())),
        "$let" => compile_let(operand),
        "$cond" => compile_cond(operand),
        "$ifNull" => {
            let args = operand_list(operand)?;
            if args.len() < 2 {
                return Err(PathError::BadValue("$ifNull needs at least 2 arguments".into()));
            }
            Ok(CompiledExpression::IfNull(args))
        }
        name => match op_by_name(name) {
            Some(op) => Ok(CompiledExpression::Op(op, operand_list(operand)?)),
            None => Err(PathError::BadValue(format!("unknown expression operator: {name}"))),
        },
    }
}

fn compile_let(operand: RawBsonRef<'_>) -> Result<CompiledExpression, PathError> {
    let RawBsonRef::Document(doc) = operand else {
        return Err(PathError::BadValue("$let needs a document".into()));
    };
    let mut vars = Vec::new();
    let mut body = None;
    for entry in doc.iter() {
        let (key, value) = entry?;
        match key {
            "vars" => {
                let RawBsonRef::Document(var_doc) = value else {
                    return Err(PathError::BadValue("$let.vars must be a document".into()));
                };
                for var in var_doc.iter() {
                    let (name, spec) = var?;
                    vars.push((name.to_string(), compile(spec)?));
                }
            }
            "in" => body = Some(compile(value)?),
            other => {
                return Err(PathError::BadValue(format!("unknown $let field: {other}")));
            }
        }
    }
    let body = body.ok_or_else(|| PathError::BadValue("$let requires 'in'".into()))?;
    Ok(CompiledExpression::Let {
        vars,
        body: Box::new(body),
    })
}

fn compile_cond(operand: RawBsonRef<'_>) -> Result<CompiledExpression, PathError> {
    match operand {
        RawBsonRef::Array(arr) => {
            let parts: Vec<_> = arr.into_iter().collect::<Result<_, _>>()?;
            if parts.len() != 3 {
                return Err(PathError::BadValue("$cond needs [if, then, else]".into()));
            }
            Ok(CompiledExpression::Cond {
                condition: Box::new(compile(parts[0])?),
                then: Box::new(compile(parts[1])?),
                otherwise: Box::new(compile(parts[2])?),
            })
        }
        RawBsonRef::Document(doc) => {
            let (mut cond, mut then, mut otherwise) = (None, None, None);
            for entry in doc.iter() {
                let (key, value) = entry?;
                match key {
                    "if" => cond = Some(compile(value)?),
                    "then" => then = Some(compile(value)?),
                    "else" => otherwise = Some(compile(value)?),
                    other => {
                        return Err(PathError::BadValue(format!("unknown $cond field: {other}")));
                    }
                }
            }
            match (cond, then, otherwise) {
                (Some(c), Some(t), Some(e)) => Ok(CompiledExpression::Cond {
                    condition: Box::new(c),
                    then: Box::new(t),
                    otherwise: Box::new(e),
                }),
                _ => Err(PathError::BadValue("$cond needs if/then/else".into())),
            }
        }
        _ => Err(PathError::BadValue("$cond needs a document or array".into())),
    }
}

fn operand_list(operand: RawBsonRef<'_>) -> Result<Vec<CompiledExpression>, PathError> {
    match operand {
        RawBsonRef::Array(arr) => {
            let mut out = Vec::new();
            for elem in arr {
                out.push(compile(elem?)?);
            }
            Ok(out)
        }
        single => Ok(vec![compile(single)?]),
    }
}

// ── Evaluation ──────────────────────────────────────────────────

/// Evaluate an expression against a document. `Ok(None)` means the result
/// is absent (`$$REMOVE` or a missing field path) and should not be
/// materialized.
pub fn eval(
    expr: &CompiledExpression,
    doc: &RawDocument,
    scope: &VarScope<'_>,
    snapshot: &TimeSnapshot,
) -> Result<Option<RawBson>, PathError> {
    match expr {
        CompiledExpression::Constant(v) => Ok(Some(v.clone())),
        CompiledExpression::FieldPath(path) => Ok(eval_field_path(doc, path)),
        CompiledExpression::Variable(name) => eval_variable(name, doc, scope, snapshot),
        CompiledExpression::DocumentCtor(fields) => {
            let mut w = DocumentWriter::new();
            for (name, field_expr) in fields {
                if let Some(v) = eval(field_expr, doc, scope, snapshot)? {
                    w.append(name, v);
                }
            }
            Ok(Some(RawBson::Document(w.into_buf())))
        }
        CompiledExpression::ArrayCtor(elems) => {
            let mut w = ArrayWriter::new();
            for e in elems {
                match eval(e, doc, scope, snapshot)? {
                    Some(v) => w.push(v),
                    None => w.push(RawBson::Null),
                }
            }
            Ok(Some(RawBson::Array(w.into_buf())))
        }
        CompiledExpression::Let { vars, body } => {
            let mut bindings = std::collections::HashMap::new();
            for (name, var_expr) in vars {
                let value = eval(var_expr, doc, scope, snapshot)?.unwrap_or(RawBson::Null);
                bindings.insert(name.clone(), value);
            }
            let child = scope.child(bindings);
            eval(body, doc, &child, snapshot)
        }
        CompiledExpression::Cond {
            condition,
            then,
            otherwise,
        } => {
            let cond = eval(condition, doc, scope, snapshot)?;
            if truthy(cond.as_ref()) {
                eval(then, doc, scope, snapshot)
            } else {
                eval(otherwise, doc, scope, snapshot)
            }
        }
        CompiledExpression::IfNull(args) => {
            let (fallback, candidates) = args.split_last().expect("arity checked at compile");
            for candidate in candidates {
                let v = eval(candidate, doc, scope, snapshot)?;
                match v {
                    Some(RawBson::Null) | None => continue,
                    Some(found) => return Ok(Some(found)),
                }
            }
            eval(fallback, doc, scope, snapshot)
        }
        CompiledExpression::Op(op, args) => eval_op(*op, args, doc, scope, snapshot),
    }
}

fn eval_field_path(doc: &RawDocument, path: &str) -> Option<RawBson> {
    match extract_path_spread(doc, path) {
        PathSpread::Missing => None,
        PathSpread::One(v) => Some(v.to_raw_bson()),
        PathSpread::Many(vs) => {
            let mut w = ArrayWriter::new();
            for v in vs {
                w.push_ref(v);
            }
            Some(RawBson::Array(w.into_buf()))
        }
    }
}

fn eval_variable(
    name: &str,
    doc: &RawDocument,
    scope: &VarScope<'_>,
    snapshot: &TimeSnapshot,
) -> Result<Option<RawBson>, PathError> {
    // A variable reference may carry a sub-path: `$$item.price`.
    let (head, rest) = match name.split_once('.') {
        Some((h, r)) => (h, Some(r)),
        None => (name, None),
    };
    let base: Option<RawBson> = match head {
        "ROOT" | "CURRENT" => Some(RawBson::Document(doc.to_raw_document_buf())),
        "NOW" => Some(RawBson::DateTime(snapshot.now)),
        "CLUSTER_TIME" => Some(RawBson::Timestamp(snapshot.cluster_time)),
        "REMOVE" => None,
        // $redact sentinels evaluate to themselves; only the redact
        // consumer interprets them.
        "DESCEND" => Some(RawBson::String("$$DESCEND".into())),
        "PRUNE" => Some(RawBson::String("$$PRUNE".into())),
        "KEEP" => Some(RawBson::String("$$KEEP".into())),
        user => match scope.lookup(user) {
            Some(v) => Some(v.clone()),
            None => {
                return Err(PathError::Expression(format!("undefined variable: {user}")));
            }
        },
    };
    match (base, rest) {
        (None, _) => Ok(None),
        (Some(v), None) => Ok(Some(v)),
        (Some(RawBson::Document(sub)), Some(rest)) => {
            Ok(strata_bson::extract_path(&sub, rest).map(|r| r.to_raw_bson()))
        }
        (Some(_), Some(_)) => Ok(None),
    }
}

fn truthy(v: Option<&RawBson>) -> bool {
    match v {
        None | Some(RawBson::Null) | Some(RawBson::Undefined) => false,
        Some(RawBson::Boolean(b)) => *b,
        Some(RawBson::Int32(n)) => *n != 0,
        Some(RawBson::Int64(n)) => *n != 0,
        Some(RawBson::Double(d)) => *d != 0.0,
        Some(_) => true,
    }
}

enum Number {
    Int(i64),
    Float(f64),
}

fn as_number(v: &RawBson) -> Option<Number> {
    match v {
        RawBson::Int32(n) => Some(Number::Int(i64::from(*n))),
        RawBson::Int64(n) => Some(Number::Int(*n)),
        RawBson::Double(d) => Some(Number::Float(*d)),
        _ => None,
    }
}

fn eval_op(
    op: ExprOp,
    args: &[CompiledExpression],
    doc: &RawDocument,
    scope: &VarScope<'_>,
    snapshot: &TimeSnapshot,
) -> Result<Option<RawBson>, PathError> {
    let mut values: Vec<Option<RawBson>> = Vec::with_capacity(args.len());
    for a in args {
        values.push(eval(a, doc, scope, snapshot)?);
    }

    match op {
        ExprOp::Add | ExprOp::Multiply => {
            let mut acc_i: Option<i64> = Some(if op == ExprOp::Add { 0 } else { 1 });
            let mut acc_f = if op == ExprOp::Add { 0.0 } else { 1.0 };
            let mut float = false;
            for v in &values {
                let Some(v) = null_to_none(v) else {
                    return Ok(Some(RawBson::Null));
                };
                match as_number(v) {
                    Some(Number::Int(n)) => {
                        acc_f = apply_f(op, acc_f, n as f64);
                        acc_i = acc_i.and_then(|a| apply_i(op, a, n));
                    }
                    Some(Number::Float(f)) => {
                        float = true;
                        acc_f = apply_f(op, acc_f, f);
                    }
                    None => {
                        return Err(PathError::Expression(format!(
                            "{op:?} requires numeric operands"
                        )));
                    }
                }
            }
            numeric_result(float, acc_i, acc_f)
        }
        ExprOp::Subtract | ExprOp::Divide | ExprOp::Mod => {
            if values.len() != 2 {
                return Err(PathError::Expression(format!("{op:?} needs 2 arguments")));
            }
            let (Some(a), Some(b)) = (null_to_none(&values[0]), null_to_none(&values[1])) else {
                return Ok(Some(RawBson::Null));
            };
            let (an, bn) = match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => (x, y),
                _ => {
                    return Err(PathError::Expression(format!(
                        "{op:?} requires numeric operands"
                    )));
                }
            };
            match op {
                ExprOp::Subtract => match (an, bn) {
                    (Number::Int(x), Number::Int(y)) => match x.checked_sub(y) {
                        Some(r) => Ok(Some(int_result(r))),
                        None => Err(PathError::Expression("integer overflow in $subtract".into())),
                    },
                    (x, y) => Ok(Some(RawBson::Double(to_f64(x) - to_f64(y)))),
                },
                ExprOp::Divide => {
                    let d = to_f64(bn);
                    if d == 0.0 {
                        return Err(PathError::Expression("division by zero".into()));
                    }
                    Ok(Some(RawBson::Double(to_f64(an) / d)))
                }
                ExprOp::Mod => match (an, bn) {
                    (Number::Int(x), Number::Int(y)) => {
                        if y == 0 {
                            return Err(PathError::Expression("$mod by zero".into()));
                        }
                        Ok(Some(int_result(x % y)))
                    }
                    (x, y) => {
                        let d = to_f64(y);
                        if d == 0.0 {
                            return Err(PathError::Expression("$mod by zero".into()));
                        }
                        Ok(Some(RawBson::Double(to_f64(x) % d)))
                    }
                },
                _ => unreachable!(),
            }
        }
        ExprOp::Abs => {
            let Some(v) = values.first().and_then(null_to_none) else {
                return Ok(Some(RawBson::Null));
            };
            match as_number(v) {
                Some(Number::Int(n)) => Ok(Some(int_result(n.abs()))),
                Some(Number::Float(f)) => Ok(Some(RawBson::Double(f.abs()))),
                None => Err(PathError::Expression("$abs requires a number".into())),
            }
        }
        ExprOp::Eq | ExprOp::Ne | ExprOp::Gt | ExprOp::Gte | ExprOp::Lt | ExprOp::Lte
        | ExprOp::Cmp => {
            if values.len() != 2 {
                return Err(PathError::Expression(format!("{op:?} needs 2 arguments")));
            }
            let a = values[0].clone().unwrap_or(RawBson::Null);
            let b = values[1].clone().unwrap_or(RawBson::Null);
            let ord = compare(a.as_raw_bson_ref(), b.as_raw_bson_ref(), None);
            use std::cmp::Ordering::*;
            let result = match op {
                ExprOp::Eq => RawBson::Boolean(ord == Equal),
                ExprOp::Ne => RawBson::Boolean(ord != Equal),
                ExprOp::Gt => RawBson::Boolean(ord == Greater),
                ExprOp::Gte => RawBson::Boolean(ord != Less),
                ExprOp::Lt => RawBson::Boolean(ord == Less),
                ExprOp::Lte => RawBson::Boolean(ord != Greater),
                ExprOp::Cmp => RawBson::Int32(match ord {
                    Less => -1,
                    Equal => 0,
                    Greater => 1,
                }),
                _ => unreachable!(),
            };
            Ok(Some(result))
        }
        ExprOp::And => Ok(Some(RawBson::Boolean(
            values.iter().all(|v| truthy(v.as_ref())),
        ))),
        ExprOp::Or => Ok(Some(RawBson::Boolean(
            values.iter().any(|v| truthy(v.as_ref())),
        ))),
        ExprOp::Not => {
            if values.len() != 1 {
                return Err(PathError::Expression("$not needs 1 argument".into()));
            }
            Ok(Some(RawBson::Boolean(!truthy(values[0].as_ref()))))
        }
        ExprOp::Concat => {
            let mut out = String::new();
            for v in &values {
                match null_to_none(v) {
                    None => return Ok(Some(RawBson::Null)),
                    Some(RawBson::String(s)) => out.push_str(s),
                    Some(_) => {
                        return Err(PathError::Expression("$concat requires strings".into()));
                    }
                }
            }
            Ok(Some(RawBson::String(out)))
        }
        ExprOp::ToUpper | ExprOp::ToLower | ExprOp::StrLenCp => {
            let v = values.first().and_then(null_to_none);
            let s = match v {
                None => String::new(),
                Some(RawBson::String(s)) => s.clone(),
                Some(other) => {
                    return Err(PathError::Expression(format!(
                        "{op:?} requires a string, got {:?}",
                        other.element_type()
                    )));
                }
            };
            Ok(Some(match op {
                ExprOp::ToUpper => RawBson::String(s.to_uppercase()),
                ExprOp::ToLower => RawBson::String(s.to_lowercase()),
                ExprOp::StrLenCp => RawBson::Int32(s.chars().count() as i32),
                _ => unreachable!(),
            }))
        }
        ExprOp::Size => {
            let Some(RawBson::Array(arr)) = values.first().and_then(null_to_none) else {
                return Err(PathError::Expression("$size requires an array".into()));
            };
            Ok(Some(RawBson::Int32(arr.into_iter().count() as i32)))
        }
        ExprOp::ArrayElemAt | ExprOp::First | ExprOp::Last => {
            let (arr_value, index) = match op {
                ExprOp::ArrayElemAt => {
                    if values.len() != 2 {
                        return Err(PathError::Expression(
                            "$arrayElemAt needs [array, index]".into(),
                        ));
                    }
                    let idx = match values[1].as_ref().and_then(as_number) {
                        Some(Number::Int(n)) => n,
                        _ => {
                            return Err(PathError::Expression(
                                "$arrayElemAt index must be an integer".into(),
                            ));
                        }
                    };
                    (values[0].clone(), idx)
                }
                ExprOp::First => (values.first().cloned().flatten(), 0),
                ExprOp::Last => (values.first().cloned().flatten(), -1),
                _ => unreachable!(),
            };
            let Some(RawBson::Array(arr)) = null_to_none(&arr_value) else {
                return Ok(None);
            };
            let elems: Vec<_> = arr.into_iter().flatten().collect();
            let idx = if index < 0 {
                elems.len() as i64 + index
            } else {
                index
            };
            if idx < 0 || idx as usize >= elems.len() {
                return Ok(None);
            }
            Ok(Some(elems[idx as usize].to_raw_bson()))
        }
        ExprOp::Type => {
            let name = match values.first().and_then(null_to_none) {
                None => "missing",
                Some(v) => type_name(v.element_type()),
            };
            Ok(Some(RawBson::String(name.to_string())))
        }
        ExprOp::Literal => Ok(values.first().cloned().flatten()),
    }
}

fn null_to_none(v: &Option<RawBson>) -> Option<&RawBson> {
    match v {
        None | Some(RawBson::Null) | Some(RawBson::Undefined) => None,
        Some(other) => Some(other),
    }
}

fn apply_f(op: ExprOp, a: f64, b: f64) -> f64 {
    if op == ExprOp::Add { a + b } else { a * b }
}

fn apply_i(op: ExprOp, a: i64, b: i64) -> Option<i64> {
    if op == ExprOp::Add {
        a.checked_add(b)
    } else {
        a.checked_mul(b)
    }
}

fn to_f64(n: Number) -> f64 {
    match n {
        Number::Int(i) => i as f64,
        Number::Float(f) => f,
    }
}

fn numeric_result(
    float: bool,
    acc_i: Option<i64>,
    acc_f: f64,
) -> Result<Option<RawBson>, PathError> {
    if float {
        return Ok(Some(RawBson::Double(acc_f)));
    }
    match acc_i {
        Some(n) => Ok(Some(int_result(n))),
        None => Err(PathError::Expression("integer overflow".into())),
    }
}

fn int_result(n: i64) -> RawBson {
    match i32::try_from(n) {
        Ok(small) => RawBson::Int32(small),
        Err(_) => RawBson::Int64(n),
    }
}

fn type_name(t: bson::spec::ElementType) -> &'static str {
    use bson::spec::ElementType::*;
    match t {
        Double => "double",
        String => "string",
        EmbeddedDocument => "object",
        Array => "array",
        Binary => "binData",
        Undefined => "undefined",
        ObjectId => "objectId",
        Boolean => "bool",
        DateTime => "date",
        Null => "null",
        RegularExpression => "regex",
        DbPointer => "dbPointer",
        JavaScriptCode => "javascript",
        Symbol => "symbol",
        JavaScriptCodeWithScope => "javascriptWithScope",
        Int32 => "int",
        Timestamp => "timestamp",
        Int64 => "long",
        Decimal128 => "decimal",
        MinKey => "minKey",
        MaxKey => "maxKey",
        EndOfDocument => "missing",
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use super::*;

    fn run(spec: &RawDocument, doc: &RawDocument) -> Option<RawBson> {
        let expr = compile(spec.get("e").unwrap().unwrap()).unwrap();
        eval(&expr, doc, &VarScope::new(), &TimeSnapshot::default()).unwrap()
    }

    #[test]
    fn field_paths_and_constants() {
        let doc = rawdoc! { "a": { "b": 7 }, "s": "x" };
        assert_eq!(run(&rawdoc! { "e": "$a.b" }, &doc), Some(RawBson::Int32(7)));
        assert_eq!(
            run(&rawdoc! { "e": "plain" }, &doc),
            Some(RawBson::String("plain".into()))
        );
        assert_eq!(run(&rawdoc! { "e": "$missing" }, &doc), None);
    }

    #[test]
    fn field_path_over_array_collects() {
        let doc = rawdoc! { "items": [{ "p": 1 }, { "p": 2 }] };
        let got = run(&rawdoc! { "e": "$items.p" }, &doc).unwrap();
        let RawBson::Array(arr) = got else { panic!() };
        assert_eq!(arr.into_iter().count(), 2);
    }

    #[test]
    fn arithmetic() {
        let doc = rawdoc! { "n": 4 };
        assert_eq!(
            run(&rawdoc! { "e": { "$add": ["$n", 1, 2] } }, &doc),
            Some(RawBson::Int32(7))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$multiply": ["$n", 2.5] } }, &doc),
            Some(RawBson::Double(10.0))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$subtract": [10, "$n"] } }, &doc),
            Some(RawBson::Int32(6))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$divide": [9, 2] } }, &doc),
            Some(RawBson::Double(4.5))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$mod": [9, 4] } }, &doc),
            Some(RawBson::Int32(1))
        );
    }

    #[test]
    fn null_propagates_through_arithmetic() {
        let doc = rawdoc! { "x": 1 };
        assert_eq!(
            run(&rawdoc! { "e": { "$add": [1, null] } }, &doc),
            Some(RawBson::Null)
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$add": [1, "$missing"] } }, &doc),
            Some(RawBson::Null)
        );
    }

    #[test]
    fn division_by_zero_errors() {
        let expr = compile(
            rawdoc! { "e": { "$divide": [1, 0] } }.get("e").unwrap().unwrap(),
        )
        .unwrap();
        let doc = rawdoc! {};
        assert!(eval(&expr, &doc, &VarScope::new(), &TimeSnapshot::default()).is_err());
    }

    #[test]
    fn comparisons_use_canonical_order() {
        let doc = rawdoc! { "n": 5i64 };
        assert_eq!(
            run(&rawdoc! { "e": { "$eq": ["$n", 5.0] } }, &doc),
            Some(RawBson::Boolean(true))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$cmp": ["abc", 100] } }, &doc),
            Some(RawBson::Int32(1)) // strings sort above numbers
        );
    }

    #[test]
    fn cond_and_ifnull() {
        let doc = rawdoc! { "qty": 150 };
        assert_eq!(
            run(
                &rawdoc! { "e": { "$cond": { "if": { "$gt": ["$qty", 100] }, "then": "bulk", "else": "unit" } } },
                &doc
            ),
            Some(RawBson::String("bulk".into()))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$ifNull": ["$missing", "fallback"] } }, &doc),
            Some(RawBson::String("fallback".into()))
        );
    }

    #[test]
    fn let_bindings_scope() {
        let doc = rawdoc! { "price": 10 };
        assert_eq!(
            run(
                &rawdoc! { "e": { "$let": {
                    "vars": { "tax": 0.2 },
                    "in": { "$multiply": ["$price", "$$tax"] }
                } } },
                &doc
            ),
            Some(RawBson::Double(2.0))
        );
    }

    #[test]
    fn undefined_variable_errors() {
        let expr = compile(rawdoc! { "e": "$$nope" }.get("e").unwrap().unwrap()).unwrap();
        let doc = rawdoc! {};
        assert!(eval(&expr, &doc, &VarScope::new(), &TimeSnapshot::default()).is_err());
    }

    #[test]
    fn remove_yields_absent() {
        let doc = rawdoc! {};
        assert_eq!(run(&rawdoc! { "e": "$$REMOVE" }, &doc), None);
    }

    #[test]
    fn system_time_variables_come_from_snapshot() {
        let snapshot = TimeSnapshot {
            now: bson::DateTime::from_millis(1_700_000_000_000),
            cluster_time: bson::Timestamp { time: 42, increment: 7 },
        };
        let doc = rawdoc! {};
        let expr = compile(rawdoc! { "e": "$$NOW" }.get("e").unwrap().unwrap()).unwrap();
        let got = eval(&expr, &doc, &VarScope::new(), &snapshot).unwrap();
        assert_eq!(got, Some(RawBson::DateTime(bson::DateTime::from_millis(1_700_000_000_000))));
    }

    #[test]
    fn document_and_array_constructors() {
        let doc = rawdoc! { "a": 1 };
        let got = run(&rawdoc! { "e": { "sum": { "$add": ["$a", 1] }, "lit": 3 } }, &doc);
        let Some(RawBson::Document(d)) = got else { panic!() };
        assert_eq!(d.get("sum").unwrap(), Some(bson::raw::RawBsonRef::Int32(2)));
        assert_eq!(d.get("lit").unwrap(), Some(bson::raw::RawBsonRef::Int32(3)));
    }

    #[test]
    fn literal_shields_operators() {
        let doc = rawdoc! {};
        let got = run(&rawdoc! { "e": { "$literal": { "$add": [1, 2] } } }, &doc);
        let Some(RawBson::Document(d)) = got else { panic!() };
        assert!(d.get("$add").unwrap().is_some());
    }

    #[test]
    fn string_and_array_helpers() {
        let doc = rawdoc! { "s": "MiXeD", "arr": [10, 20, 30] };
        assert_eq!(
            run(&rawdoc! { "e": { "$toUpper": "$s" } }, &doc),
            Some(RawBson::String("MIXED".into()))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$size": "$arr" } }, &doc),
            Some(RawBson::Int32(3))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$arrayElemAt": ["$arr", -1] } }, &doc),
            Some(RawBson::Int32(30))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$concat": ["a", "-", "b"] } }, &doc),
            Some(RawBson::String("a-b".into()))
        );
        assert_eq!(
            run(&rawdoc! { "e": { "$type": "$arr" } }, &doc),
            Some(RawBson::String("array".into()))
        );
    }
}
