use bson::RawBson;

use strata_index::{AmRegistry, IndexClass, OpFamily};
use strata_pipeline::QueryTree;
use strata_query::{CompareOp, Expression, FieldPredicate};

/// Rewrite the bottom of a query tree to use an ordered secondary index
/// when one serves the filter or the sort.
///
/// Patterns handled: `Filter(Scan)`, `Sort(Filter(Scan))`, `Sort(Scan)`,
/// plus any stack of row-preserving unary nodes above them. The chosen
/// predicates stay in the residual filter — multikey indexes can produce
/// false positives, so rows are always re-checked on fetch.
pub(crate) fn improve_access_path(
    tree: QueryTree,
    indexed_paths: &[String],
    registry: &AmRegistry,
) -> QueryTree {
    // Index selection consults the regular-index access method; if none
    // is registered (or it serves no single-path family), scans stay.
    let Some(am) = registry.find(|am| am.is_regular_bson_index()) else {
        return tree;
    };
    if am.op_family(IndexClass::SinglePath).is_none() {
        return tree;
    }

    rewrite(tree, indexed_paths, am.op_family(IndexClass::SinglePath))
}

fn rewrite(
    tree: QueryTree,
    indexed_paths: &[String],
    family: Option<&OpFamily>,
) -> QueryTree {
    match tree {
        QueryTree::Sort { keys, input } => {
            // Order-by pushdown: a single-key sort over a filtered or bare
            // scan can ride the index's order.
            if keys.len() == 1 && indexed_paths.contains(&keys[0].path) {
                let path = keys[0].path.clone();
                let reverse = !keys[0].ascending;
                match *input {
                    QueryTree::Filter { predicate, input: scan_input }
                        if !contains_expr(&predicate) =>
                    {
                        if let QueryTree::Scan { collection } = *scan_input {
                            let (lower, upper) = bounds_for(&predicate, &path);
                            return QueryTree::IndexScan {
                                collection,
                                index_path: path,
                                lower,
                                upper,
                                reverse,
                                residual: Some(predicate),
                            };
                        }
                        // Not a bare scan under the filter; restore.
                        let rebuilt = QueryTree::Filter {
                            predicate,
                            input: scan_input,
                        };
                        return QueryTree::Sort {
                            keys,
                            input: rebuilt.boxed(),
                        };
                    }
                    QueryTree::Scan { collection } => {
                        return QueryTree::IndexScan {
                            collection,
                            index_path: path,
                            lower: None,
                            upper: None,
                            reverse,
                            residual: None,
                        };
                    }
                    other => {
                        return QueryTree::Sort {
                            keys,
                            input: rewrite(other, indexed_paths, family).boxed(),
                        };
                    }
                }
            }
            QueryTree::Sort {
                keys,
                input: rewrite(*input, indexed_paths, family).boxed(),
            }
        }
        QueryTree::Filter { predicate, input } => {
            if let QueryTree::Scan { collection } = &*input
                && !contains_expr(&predicate)
            {
                // Use the first indexed path the filter constrains with
                // an indexable bound.
                for path in constrained_paths(&predicate) {
                    if !indexed_paths.iter().any(|p| p == path) {
                        continue;
                    }
                    let (lower, upper) = bounds_for(&predicate, path);
                    if lower.is_none() && upper.is_none() {
                        continue;
                    }
                    return QueryTree::IndexScan {
                        collection: collection.clone(),
                        index_path: path.to_string(),
                        lower,
                        upper,
                        reverse: false,
                        residual: Some(predicate),
                    };
                }
            }
            QueryTree::Filter {
                predicate,
                input: rewrite(*input, indexed_paths, family).boxed(),
            }
        }
        QueryTree::Project { projection, input } => QueryTree::Project {
            projection,
            input: rewrite(*input, indexed_paths, family).boxed(),
        },
        QueryTree::Limit { limit, input } => QueryTree::Limit {
            limit,
            input: rewrite(*input, indexed_paths, family).boxed(),
        },
        QueryTree::Skip { skip, input } => QueryTree::Skip {
            skip,
            input: rewrite(*input, indexed_paths, family).boxed(),
        },
        other => other,
    }
}

/// `$expr` predicates need the expression-evaluation hook only the
/// filter node provides; they disqualify residual-checked index scans.
fn contains_expr(predicate: &Expression) -> bool {
    match predicate {
        Expression::Expr(_) => true,
        Expression::And(children)
        | Expression::Or(children)
        | Expression::Nor(children) => children.iter().any(contains_expr),
        _ => false,
    }
}

/// Paths the predicate constrains conjunctively, in appearance order.
fn constrained_paths(predicate: &Expression) -> Vec<&str> {
    match predicate {
        Expression::Field(path, _) => vec![path.as_str()],
        Expression::And(children) => {
            let mut out = Vec::new();
            for child in children {
                for p in constrained_paths(child) {
                    if !out.contains(&p) {
                        out.push(p);
                    }
                }
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Fold the conjunctive bounds the predicate puts on `path` into an index
/// range. Non-indexable operand types leave that side open.
fn bounds_for(
    predicate: &Expression,
    path: &str,
) -> (Option<(RawBson, bool)>, Option<(RawBson, bool)>) {
    let mut lower: Option<(RawBson, bool)> = None;
    let mut upper: Option<(RawBson, bool)> = None;
    collect_bounds(predicate, path, &mut lower, &mut upper);
    (lower, upper)
}

fn collect_bounds(
    predicate: &Expression,
    path: &str,
    lower: &mut Option<(RawBson, bool)>,
    upper: &mut Option<(RawBson, bool)>,
) {
    match predicate {
        Expression::And(children) => {
            for child in children {
                collect_bounds(child, path, lower, upper);
            }
        }
        Expression::Field(p, pred) if p == path => {
            if let FieldPredicate::Compare(op, value) = pred {
                if strata_bson::encode_index_key(value.as_raw_bson_ref()).is_none() {
                    return;
                }
                match op {
                    CompareOp::Eq => {
                        tighten_lower(lower, value.clone(), true);
                        tighten_upper(upper, value.clone(), true);
                    }
                    CompareOp::Gt => tighten_lower(lower, value.clone(), false),
                    CompareOp::Gte => tighten_lower(lower, value.clone(), true),
                    CompareOp::Lt => tighten_upper(upper, value.clone(), false),
                    CompareOp::Lte => tighten_upper(upper, value.clone(), true),
                    CompareOp::Ne => {}
                }
            }
        }
        _ => {}
    }
}

fn tighten_lower(bound: &mut Option<(RawBson, bool)>, value: RawBson, inclusive: bool) {
    let replace = match bound {
        None => true,
        Some((current, current_inclusive)) => {
            match strata_bson::compare(
                value.as_raw_bson_ref(),
                current.as_raw_bson_ref(),
                None,
            ) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => *current_inclusive && !inclusive,
                std::cmp::Ordering::Less => false,
            }
        }
    };
    if replace {
        *bound = Some((value, inclusive));
    }
}

fn tighten_upper(bound: &mut Option<(RawBson, bool)>, value: RawBson, inclusive: bool) {
    let replace = match bound {
        None => true,
        Some((current, current_inclusive)) => {
            match strata_bson::compare(
                value.as_raw_bson_ref(),
                current.as_raw_bson_ref(),
                None,
            ) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => *current_inclusive && !inclusive,
                std::cmp::Ordering::Greater => false,
            }
        }
    };
    if replace {
        *bound = Some((value, inclusive));
    }
}
