use std::collections::HashMap;

use bson::raw::{RawBsonRef, RawDocument, RawDocumentBuf};

use strata_bson::{ArrayWriter, DocumentWriter};
use strata_query::{Expression, first_match_index, matches};

use crate::error::PathError;
use crate::expr;
use crate::ops::OperatorContext;
use crate::tree::{ArrayFieldNode, IntermediateNode, PathNode, PathTree, ProjectionMode};
use crate::vars::{TimeSnapshot, VarScope};

/// Everything projection needs beyond the tree: the originating query (for
/// the positional operator), variable bindings, the frozen time snapshot,
/// metadata values, and the missing-path policy.
pub struct ProjectionContext<'a> {
    pub query: Option<&'a Expression>,
    pub scope: &'a VarScope<'a>,
    pub snapshot: &'a TimeSnapshot,
    /// Materialize explicit nulls for included paths missing from the
    /// source.
    pub null_on_empty: bool,
    /// Metadata values addressable via `$meta` (e.g. `textScore`).
    pub meta: HashMap<String, f64>,
}

impl<'a> ProjectionContext<'a> {
    pub fn new(scope: &'a VarScope<'a>, snapshot: &'a TimeSnapshot) -> Self {
        Self {
            query: None,
            scope,
            snapshot,
            null_on_empty: false,
            meta: HashMap::new(),
        }
    }
}

struct WalkState<'a> {
    root_doc: &'a RawDocument,
    ctx: &'a ProjectionContext<'a>,
    positional_index: Option<usize>,
    in_nested_array: bool,
}

/// Project a source document through a path tree.
pub fn project(
    doc: &RawDocument,
    tree: &PathTree,
    ctx: &ProjectionContext<'_>,
) -> Result<RawDocumentBuf, PathError> {
    // The positional operator is resolved once per document, against the
    // outermost matching array.
    let positional_index = match &tree.positional_path {
        Some(array_path) => {
            let query = ctx.query.ok_or(PathError::PositionalNoQuery)?;
            match first_match_index(doc, array_path, query)? {
                Some(index) => Some(index),
                None => return Err(PathError::PositionalUnmatched(array_path.clone())),
            }
        }
        None => None,
    };

    let state = WalkState {
        root_doc: doc,
        ctx,
        positional_index,
        in_nested_array: false,
    };

    let mut out = DocumentWriter::new();
    match tree.mode {
        ProjectionMode::Exclusion => {
            walk_exclude(doc, &tree.root, &mut out, &state, tree.include_id, true)?;
        }
        ProjectionMode::Inclusion | ProjectionMode::Expression => {
            walk_include(doc, &tree.root, &mut out, &state, tree.include_id, true)?;
        }
    }
    Ok(out.into_buf())
}

// ── Inclusion / expression walk ─────────────────────────────────

fn walk_include(
    src: &RawDocument,
    node: &IntermediateNode,
    out: &mut DocumentWriter,
    state: &WalkState<'_>,
    include_id: bool,
    is_root: bool,
) -> Result<(), PathError> {
    let mut consumed = vec![false; node.children.len()];

    for entry in src.iter() {
        let (key, value) = entry?;
        if is_root && key == "_id" && node.child("_id").is_none() {
            if include_id {
                out.append_ref(key, value);
            }
            continue;
        }
        let Some(slot) = node.children.get_index_of(key) else {
            continue;
        };
        consumed[slot] = true;
        let child = &node.children[slot];
        emit_included(key, value, child, out, state)?;
    }

    write_pending(node, &consumed, out, state)?;
    Ok(())
}

fn emit_included(
    key: &str,
    value: RawBsonRef<'_>,
    child: &PathNode,
    out: &mut DocumentWriter,
    state: &WalkState<'_>,
) -> Result<(), PathError> {
    match child {
        PathNode::Included => out.append_ref(key, value),
        PathNode::Excluded => {}
        PathNode::Field(expression) => {
            if let Some(v) =
                expr::eval(expression, state.root_doc, state.ctx.scope, state.ctx.snapshot)?
            {
                out.append(key, v);
            }
        }
        PathNode::FieldWithContext(op) => emit_operator(key, Some(value), op, out, state)?,
        PathNode::ArrayField(array_node) => {
            emit_array_field(key, value, array_node, out, state, true)?;
        }
        PathNode::Intermediate(inner) => match value {
            RawBsonRef::Document(sub) => {
                let mut child_out = DocumentWriter::new();
                walk_include(sub, inner, &mut child_out, state, true, false)?;
                out.append_document(key, child_out);
            }
            RawBsonRef::Array(arr) => {
                // Inclusion recurses into document elements and drops the
                // rest.
                let nested = WalkState {
                    in_nested_array: true,
                    ..*state
                };
                let mut child_arr = ArrayWriter::new();
                for elem in arr.into_iter().flatten() {
                    if let RawBsonRef::Document(elem_doc) = elem {
                        let mut elem_out = DocumentWriter::new();
                        walk_include(elem_doc, inner, &mut elem_out, &nested, true, false)?;
                        child_arr.push_document(elem_out);
                    }
                }
                out.append_array(key, child_arr);
            }
            // A scalar under an intermediate path: the sub-path cannot
            // resolve, so the field is dropped.
            _ => {}
        },
    }
    Ok(())
}

/// Emit tree leaves the source walk never visited: computed fields,
/// `$meta`, and (optionally) explicit nulls for missing inclusions.
fn write_pending(
    node: &IntermediateNode,
    consumed: &[bool],
    out: &mut DocumentWriter,
    state: &WalkState<'_>,
) -> Result<(), PathError> {
    for (slot, (key, child)) in node.children.iter().enumerate() {
        if consumed[slot] {
            continue;
        }
        match child {
            PathNode::Field(expression) => {
                if let Some(v) =
                    expr::eval(expression, state.root_doc, state.ctx.scope, state.ctx.snapshot)?
                {
                    out.append(key, v);
                }
            }
            PathNode::FieldWithContext(OperatorContext::Meta(name)) => {
                if let Some(score) = state.ctx.meta.get(name) {
                    out.append(key, *score);
                }
            }
            PathNode::Included if state.ctx.null_on_empty => {
                out.append(key, bson::RawBson::Null);
            }
            PathNode::Intermediate(inner) if inner.has_expression_fields => {
                let consumed = vec![false; inner.children.len()];
                let mut child_out = DocumentWriter::new();
                write_pending(inner, &consumed, &mut child_out, state)?;
                if !child_out.is_empty() {
                    out.append_document(key, child_out);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn emit_operator(
    key: &str,
    value: Option<RawBsonRef<'_>>,
    op: &OperatorContext,
    out: &mut DocumentWriter,
    state: &WalkState<'_>,
) -> Result<(), PathError> {
    match op {
        OperatorContext::Positional => {
            let Some(RawBsonRef::Array(arr)) = value else {
                return Ok(());
            };
            // Positional applies only at the outermost array.
            if state.in_nested_array {
                if let Some(v) = value {
                    out.append_ref(key, v);
                }
                return Ok(());
            }
            let Some(index) = state.positional_index else {
                return Ok(());
            };
            let mut picked = ArrayWriter::new();
            if let Some(elem) = arr.into_iter().flatten().nth(index) {
                picked.push_ref(elem);
            }
            out.append_array(key, picked);
        }
        OperatorContext::ElemMatch(filter) => {
            let Some(RawBsonRef::Array(arr)) = value else {
                // $elemMatch omits the field when absent or not an array.
                return Ok(());
            };
            if state.in_nested_array {
                return Ok(());
            }
            for elem in arr.into_iter().flatten() {
                if let RawBsonRef::Document(elem_doc) = elem
                    && matches(elem_doc, filter)?
                {
                    let mut picked = ArrayWriter::new();
                    picked.push_ref(elem);
                    out.append_array(key, picked);
                    return Ok(());
                }
            }
        }
        OperatorContext::Slice(args) => match value {
            Some(RawBsonRef::Array(arr)) => {
                let elems: Vec<_> = arr.into_iter().flatten().collect();
                let (start, count) = args.window(elems.len());
                let mut sliced = ArrayWriter::new();
                for elem in elems.into_iter().skip(start).take(count) {
                    sliced.push_ref(elem);
                }
                out.append_array(key, sliced);
            }
            Some(other) => out.append_ref(key, other),
            None => {}
        },
        OperatorContext::Meta(name) => {
            if let Some(score) = state.ctx.meta.get(name) {
                out.append(key, *score);
            }
        }
    }
    Ok(())
}

fn emit_array_field(
    key: &str,
    value: RawBsonRef<'_>,
    node: &ArrayFieldNode,
    out: &mut DocumentWriter,
    state: &WalkState<'_>,
    inclusion: bool,
) -> Result<(), PathError> {
    let RawBsonRef::Array(arr) = value else {
        if !inclusion {
            out.append_ref(key, value);
        }
        return Ok(());
    };
    let nested = WalkState {
        in_nested_array: true,
        ..*state
    };
    let mut selected = ArrayWriter::new();
    for (index, elem) in arr.into_iter().flatten().enumerate() {
        let slot = node.elements.iter().find(|(i, _)| *i == index);
        match (slot, inclusion) {
            (Some((_, PathNode::Excluded)), _) => {}
            (Some((_, PathNode::Included)), _) => selected.push_ref(elem),
            (Some((_, PathNode::Intermediate(inner))), _) => {
                if let RawBsonRef::Document(elem_doc) = elem {
                    let mut elem_out = DocumentWriter::new();
                    if inclusion {
                        walk_include(elem_doc, inner, &mut elem_out, &nested, true, false)?;
                    } else {
                        walk_exclude(elem_doc, inner, &mut elem_out, &nested, true, false)?;
                    }
                    selected.push_document(elem_out);
                } else if !inclusion {
                    selected.push_ref(elem);
                }
            }
            (Some(_), _) | (None, false) => selected.push_ref(elem),
            (None, true) => {}
        }
    }
    out.append_array(key, selected);
    Ok(())
}

// ── Exclusion walk ──────────────────────────────────────────────

fn walk_exclude(
    src: &RawDocument,
    node: &IntermediateNode,
    out: &mut DocumentWriter,
    state: &WalkState<'_>,
    include_id: bool,
    is_root: bool,
) -> Result<(), PathError> {
    for entry in src.iter() {
        let (key, value) = entry?;
        if is_root && key == "_id" && node.child("_id").is_none() {
            if include_id {
                out.append_ref(key, value);
            }
            continue;
        }
        match node.child(key) {
            None => out.append_ref(key, value),
            Some(PathNode::Excluded) => {}
            Some(PathNode::Included) | Some(PathNode::Field(_)) => {
                // Reachable only with explicit inclusion-exclusion opt-in;
                // the source value passes through.
                out.append_ref(key, value);
            }
            Some(PathNode::FieldWithContext(op)) => {
                emit_operator(key, Some(value), op, out, state)?;
            }
            Some(PathNode::ArrayField(array_node)) => {
                emit_array_field(key, value, array_node, out, state, false)?;
            }
            Some(PathNode::Intermediate(inner)) => match value {
                RawBsonRef::Document(sub) => {
                    let mut child_out = DocumentWriter::new();
                    walk_exclude(sub, inner, &mut child_out, state, true, false)?;
                    out.append_document(key, child_out);
                }
                RawBsonRef::Array(arr) => {
                    let nested = WalkState {
                        in_nested_array: true,
                        ..*state
                    };
                    let mut child_arr = ArrayWriter::new();
                    for elem in arr.into_iter().flatten() {
                        match elem {
                            RawBsonRef::Document(elem_doc) => {
                                let mut elem_out = DocumentWriter::new();
                                walk_exclude(elem_doc, inner, &mut elem_out, &nested, true, false)?;
                                child_arr.push_document(elem_out);
                            }
                            other => child_arr.push_ref(other),
                        }
                    }
                    out.append_array(key, child_arr);
                }
                other => out.append_ref(key, other),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use strata_query::parse_filter;

    use crate::build::{BuildOptions, build_projection_tree};

    use super::*;

    fn run(doc: &RawDocument, spec: &RawDocument) -> RawDocumentBuf {
        let tree = build_projection_tree(spec, &BuildOptions::find_projection()).unwrap();
        let scope = VarScope::new();
        let snapshot = TimeSnapshot::default();
        let ctx = ProjectionContext::new(&scope, &snapshot);
        project(doc, &tree, &ctx).unwrap()
    }

    #[test]
    fn inclusion_keeps_named_paths_and_id() {
        let doc = rawdoc! { "_id": 1, "a": { "b": 2, "c": 3 }, "d": 4 };
        let out = run(&doc, &rawdoc! { "a.b": 1 });
        assert_eq!(out, rawdoc! { "_id": 1, "a": { "b": 2 } });
    }

    #[test]
    fn exclusion_removes_named_paths() {
        let doc = rawdoc! { "_id": 1, "a": { "b": 2, "c": 3 }, "d": 4 };
        let out = run(&doc, &rawdoc! { "a.b": 0 });
        assert_eq!(out, rawdoc! { "_id": 1, "a": { "c": 3 }, "d": 4 });
    }

    #[test]
    fn id_can_be_suppressed() {
        let doc = rawdoc! { "_id": 1, "a": 2 };
        assert_eq!(run(&doc, &rawdoc! { "_id": 0, "a": 1 }), rawdoc! { "a": 2 });
        assert_eq!(run(&doc, &rawdoc! { "_id": 0 }), rawdoc! { "a": 2 });
    }

    #[test]
    fn inclusion_recurses_into_array_documents() {
        let doc = rawdoc! { "items": [{ "sku": "A", "qty": 1 }, { "sku": "B" }, 7] };
        let out = run(&doc, &rawdoc! { "items.sku": 1 });
        assert_eq!(
            out,
            rawdoc! { "items": [{ "sku": "A" }, { "sku": "B" }] }
        );
    }

    #[test]
    fn exclusion_keeps_scalar_array_elements() {
        let doc = rawdoc! { "_id": 1, "items": [{ "sku": "A", "qty": 1 }, 7] };
        let out = run(&doc, &rawdoc! { "items.qty": 0 });
        assert_eq!(out, rawdoc! { "_id": 1, "items": [{ "sku": "A" }, 7] });
    }

    #[test]
    fn computed_fields_evaluate_against_root() {
        let doc = rawdoc! { "_id": 1, "a": 2, "b": 3 };
        let out = run(&doc, &rawdoc! { "sum": { "$add": ["$a", "$b"] }, "a": 1 });
        assert_eq!(out, rawdoc! { "_id": 1, "a": 2, "sum": 5 });
    }

    #[test]
    fn computed_fields_materialize_missing_intermediates() {
        let doc = rawdoc! { "_id": 1 };
        let out = run(&doc, &rawdoc! { "meta.total": { "$add": [1, 2] } });
        assert_eq!(out, rawdoc! { "_id": 1, "meta": { "total": 3 } });
    }

    #[test]
    fn positional_picks_first_matching_element() {
        let doc = rawdoc! {
            "_id": 9,
            "grades": [
                { "s": "math", "g": 85 },
                { "s": "eng", "g": 90 }
            ]
        };
        let tree =
            build_projection_tree(&rawdoc! { "grades.$": 1 }, &BuildOptions::find_projection())
                .unwrap();
        let query = parse_filter(&rawdoc! { "grades.g": { "$gte": 90 } }).unwrap();
        let scope = VarScope::new();
        let snapshot = TimeSnapshot::default();
        let mut ctx = ProjectionContext::new(&scope, &snapshot);
        ctx.query = Some(&query);
        let out = project(&doc, &tree, &ctx).unwrap();
        assert_eq!(out, rawdoc! { "_id": 9, "grades": [{ "s": "eng", "g": 90 }] });
    }

    #[test]
    fn positional_without_query_errors() {
        let tree =
            build_projection_tree(&rawdoc! { "a.$": 1 }, &BuildOptions::find_projection()).unwrap();
        let scope = VarScope::new();
        let snapshot = TimeSnapshot::default();
        let ctx = ProjectionContext::new(&scope, &snapshot);
        let doc = rawdoc! { "a": [1] };
        assert!(matches!(
            project(&doc, &tree, &ctx),
            Err(PathError::PositionalNoQuery)
        ));
    }

    #[test]
    fn elem_match_projects_first_matching() {
        let doc = rawdoc! {
            "_id": 1,
            "items": [{ "q": 5 }, { "q": 15 }, { "q": 25 }]
        };
        let out = run(
            &doc,
            &rawdoc! { "items": { "$elemMatch": { "q": { "$gt": 10 } } } },
        );
        assert_eq!(out, rawdoc! { "_id": 1, "items": [{ "q": 15 }] });
    }

    #[test]
    fn elem_match_omits_field_when_nothing_matches() {
        let doc = rawdoc! { "_id": 1, "items": [{ "q": 5 }] };
        let out = run(
            &doc,
            &rawdoc! { "items": { "$elemMatch": { "q": { "$gt": 10 } } } },
        );
        assert_eq!(out, rawdoc! { "_id": 1 });
    }

    #[test]
    fn slice_windows_arrays() {
        let doc = rawdoc! { "_id": 1, "v": [1, 2, 3, 4, 5], "w": 9 };
        let out = run(&doc, &rawdoc! { "v": { "$slice": -2 } });
        assert_eq!(out, rawdoc! { "_id": 1, "v": [4, 5], "w": 9 });

        let out = run(&doc, &rawdoc! { "v": { "$slice": [1, 2] } });
        assert_eq!(out, rawdoc! { "_id": 1, "v": [2, 3], "w": 9 });
    }

    #[test]
    fn meta_comes_from_context() {
        let doc = rawdoc! { "_id": 1, "t": "x" };
        let tree = build_projection_tree(
            &rawdoc! { "score": { "$meta": "textScore" }, "t": 1 },
            &BuildOptions::find_projection(),
        )
        .unwrap();
        let scope = VarScope::new();
        let snapshot = TimeSnapshot::default();
        let mut ctx = ProjectionContext::new(&scope, &snapshot);
        ctx.meta.insert("textScore".into(), 1.5);
        let out = project(&doc, &tree, &ctx).unwrap();
        assert_eq!(out, rawdoc! { "_id": 1, "t": "x", "score": 1.5 });
    }

    #[test]
    fn null_on_empty_materializes_missing_inclusions() {
        let doc = rawdoc! { "_id": 1, "a": 2 };
        let tree =
            build_projection_tree(&rawdoc! { "a": 1, "b": 1 }, &BuildOptions::default()).unwrap();
        let scope = VarScope::new();
        let snapshot = TimeSnapshot::default();
        let mut ctx = ProjectionContext::new(&scope, &snapshot);
        ctx.null_on_empty = true;
        let out = project(&doc, &tree, &ctx).unwrap();
        assert_eq!(out, rawdoc! { "_id": 1, "a": 2, "b": null });
    }

    #[test]
    fn array_slot_selection() {
        let doc = rawdoc! { "_id": 1, "v": ["a", "b", "c"] };
        let out = run(&doc, &rawdoc! { "v.1": 1 });
        assert_eq!(out, rawdoc! { "_id": 1, "v": ["b"] });
    }

    #[test]
    fn positional_through_nested_arrays_is_unmatched() {
        // The positional path targets `outer.inner`, but `inner` sits
        // inside array elements; the operator only resolves at the
        // outermost array, so this projection cannot match.
        let doc = rawdoc! {
            "_id": 1,
            "outer": [{ "inner": [1, 2] }]
        };
        let tree = build_projection_tree(
            &rawdoc! { "outer.inner.$": 1 },
            &BuildOptions::find_projection(),
        )
        .unwrap();
        let query = parse_filter(&rawdoc! { "outer.inner": 2 }).unwrap();
        let scope = VarScope::new();
        let snapshot = TimeSnapshot::default();
        let mut ctx = ProjectionContext::new(&scope, &snapshot);
        ctx.query = Some(&query);
        assert!(matches!(
            project(&doc, &tree, &ctx),
            Err(PathError::PositionalUnmatched(_))
        ));
    }
}
