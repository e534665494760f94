use bson::raw::{RawBsonRef, RawDocument};
use indexmap::IndexMap;

use crate::error::PathError;
use crate::expr;
use crate::ops::{self, OperatorContext};
use crate::tree::{ArrayFieldNode, IntermediateNode, PathNode, PathTree, ProjectionMode};

/// Default bound on path depth in a specification.
pub const DEFAULT_MAX_PATH_DEPTH: usize = 100;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Permit inclusion and exclusion leaves in one tree (`_id` is always
    /// exempt).
    pub allow_inclusion_exclusion: bool,
    /// Recognize the find-projection operators (`$`, `$elemMatch`,
    /// `$slice`, `$meta`) as leaf contexts.
    pub find_operators: bool,
    /// Treat operator-shaped leaf values as constants instead of parsing
    /// them as expressions (wildcard-index specs).
    pub constant_leaves: bool,
    /// Every leaf value is an expression, including plain numbers and
    /// booleans (`$addFields`-style specs, where `{a: 1}` assigns 1).
    pub force_leaf_expressions: bool,
    pub max_depth: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            allow_inclusion_exclusion: false,
            find_operators: false,
            constant_leaves: false,
            force_leaf_expressions: false,
            max_depth: DEFAULT_MAX_PATH_DEPTH,
        }
    }
}

impl BuildOptions {
    pub fn find_projection() -> Self {
        Self {
            find_operators: true,
            ..Self::default()
        }
    }

    pub fn field_expressions() -> Self {
        Self {
            force_leaf_expressions: true,
            ..Self::default()
        }
    }
}

/// Build a projection path tree from a specification document.
///
/// One pass over the spec entries creates the tree; a post-pass stamps the
/// `has_expression_fields` flag on ancestors.
pub fn build_projection_tree(
    spec: &RawDocument,
    options: &BuildOptions,
) -> Result<PathTree, PathError> {
    let mut root = IntermediateNode::default();
    let mut has_inclusion = false;
    let mut has_exclusion = false;
    let mut has_expression = false;
    let mut has_slice = false;
    let mut include_id: Option<bool> = None;
    let mut positional_path: Option<String> = None;

    for entry in spec.iter() {
        let (key, value) = entry?;
        validate_path(key, options.max_depth)?;

        // `_id` is exempt from the mixing rule; record its disposition
        // separately when it is a plain include/exclude.
        if key == "_id" && let Some(included) = inclusion_flag(value) {
            if include_id.replace(included).is_some() {
                return Err(PathError::PathCollision("_id".into()));
            }
            continue;
        }

        if let Some(array_path) = key.strip_suffix(".$") {
            if !options.find_operators {
                return Err(PathError::BadFieldName(key.to_string()));
            }
            if inclusion_flag(value) != Some(true) {
                return Err(PathError::BadOperator(
                    "positional projection must be included, not excluded".into(),
                ));
            }
            if positional_path.replace(array_path.to_string()).is_some() {
                return Err(PathError::BadOperator(
                    "at most one positional projection per query".into(),
                ));
            }
            has_inclusion = true;
            insert_leaf(
                &mut root,
                array_path,
                PathNode::FieldWithContext(OperatorContext::Positional),
            )?;
            continue;
        }

        let leaf = classify_leaf(value, options)?;
        match &leaf {
            PathNode::Included => has_inclusion = true,
            PathNode::Excluded => has_exclusion = true,
            PathNode::Field(_) => has_expression = true,
            PathNode::FieldWithContext(ctx) => match ctx {
                // $slice and $meta compose with either projection mode.
                OperatorContext::Slice(_) => has_slice = true,
                OperatorContext::Meta(_) => has_expression = true,
                _ => {
                    has_expression = true;
                    has_inclusion = true;
                }
            },
            _ => {}
        }
        insert_leaf(&mut root, key, leaf)?;
    }

    if has_exclusion && (has_inclusion || has_expression) && !options.allow_inclusion_exclusion {
        return Err(PathError::MixedInclusionExclusion(
            first_excluded_path(&root).unwrap_or_default(),
        ));
    }

    let mode = if has_expression {
        ProjectionMode::Expression
    } else if has_inclusion {
        ProjectionMode::Inclusion
    } else if has_exclusion || has_slice || include_id == Some(false) {
        ProjectionMode::Exclusion
    } else {
        ProjectionMode::Inclusion
    };

    // `_id` rides along unless explicitly excluded.
    let include_id = include_id.unwrap_or(true);

    root.refresh_expression_flags();
    Ok(PathTree {
        root,
        mode,
        include_id,
        positional_path,
    })
}

/// Build a conflict-checked tree from update paths. Numeric segments
/// produce `ArrayField` nodes whose elements are keyed by index, which is
/// how `{"a.0.b": ...}` and `{"a.1": ...}` coexist while `{"a": ...}`
/// plus `{"a.0": ...}` collide.
pub fn build_update_tree<'a>(
    paths: impl IntoIterator<Item = &'a str>,
) -> Result<IntermediateNode, PathError> {
    let mut root = IntermediateNode::default();
    for path in paths {
        validate_path(path, DEFAULT_MAX_PATH_DEPTH)?;
        insert_leaf(&mut root, path, PathNode::Included)?;
    }
    Ok(root)
}

/// Normalize a wildcard-index projection: every key is reduced to a single
/// segment, redundant sub-paths collapse into their prefix, and `_id` is
/// always materialized (excluded by default).
pub fn normalize_wildcard_projection(spec: &RawDocument) -> Result<PathTree, PathError> {
    let mut children: IndexMap<String, PathNode> = IndexMap::new();
    let mut include_id = false;
    let mut has_inclusion = false;
    let mut has_exclusion = false;

    for entry in spec.iter() {
        let (key, value) = entry?;
        validate_path(key, DEFAULT_MAX_PATH_DEPTH)?;
        let included = inclusion_flag(value).ok_or_else(|| {
            PathError::BadValue(format!(
                "wildcard projection values must be 0 or 1 ('{key}')"
            ))
        })?;
        if key == "_id" {
            include_id = included;
            continue;
        }
        if included {
            has_inclusion = true;
        } else {
            has_exclusion = true;
        }
        let top = key.split('.').next().unwrap_or(key).to_string();
        let node = if included {
            PathNode::Included
        } else {
            PathNode::Excluded
        };
        // Deduplicate: a prefix subsumes its sub-paths; conflicting
        // dispositions on the same top segment are a collision.
        match children.get(&top) {
            Some(existing) if *existing != node => {
                return Err(PathError::PathCollision(top));
            }
            _ => {
                children.insert(top, node);
            }
        }
    }

    if has_inclusion && has_exclusion {
        return Err(PathError::MixedInclusionExclusion(String::new()));
    }

    let mode = if has_exclusion {
        ProjectionMode::Exclusion
    } else {
        ProjectionMode::Inclusion
    };
    Ok(PathTree {
        root: IntermediateNode {
            children,
            has_expression_fields: false,
        },
        mode,
        include_id,
        positional_path: None,
    })
}

fn classify_leaf(value: RawBsonRef<'_>, options: &BuildOptions) -> Result<PathNode, PathError> {
    if options.force_leaf_expressions {
        return Ok(PathNode::Field(expr::compile(value)?));
    }
    if let Some(included) = inclusion_flag(value) {
        return Ok(if included {
            PathNode::Included
        } else {
            PathNode::Excluded
        });
    }

    if let RawBsonRef::Document(doc) = value
        && let Some(Ok((first_key, operand))) = doc.iter().next()
        && first_key.starts_with('$')
        && options.find_operators
    {
        match first_key {
            "$elemMatch" => {
                let RawBsonRef::Document(filter_doc) = operand else {
                    return Err(PathError::BadOperator("$elemMatch needs a document".into()));
                };
                let filter = strata_query::parse_filter(filter_doc)?;
                return Ok(PathNode::FieldWithContext(OperatorContext::ElemMatch(filter)));
            }
            "$slice" => {
                return Ok(PathNode::FieldWithContext(OperatorContext::Slice(
                    ops::parse_slice(operand)?,
                )));
            }
            "$meta" => {
                return Ok(PathNode::FieldWithContext(OperatorContext::Meta(
                    ops::parse_meta(operand)?,
                )));
            }
            _ => {}
        }
    }

    if options.constant_leaves {
        return Ok(PathNode::Field(expr::compile_constant(value)));
    }
    Ok(PathNode::Field(expr::compile(value)?))
}

/// `1`/`true`-style inclusion, `0`/`false` exclusion, anything else is not
/// a plain flag.
fn inclusion_flag(value: RawBsonRef<'_>) -> Option<bool> {
    match value {
        RawBsonRef::Boolean(b) => Some(b),
        RawBsonRef::Int32(n) => Some(n != 0),
        RawBsonRef::Int64(n) => Some(n != 0),
        RawBsonRef::Double(d) => Some(d != 0.0),
        _ => None,
    }
}

fn validate_path(path: &str, max_depth: usize) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::BadFieldName(path.to_string()));
    }
    let mut depth = 0;
    for (i, segment) in path.split('.').enumerate() {
        depth += 1;
        if segment.is_empty() {
            return Err(PathError::BadFieldName(path.to_string()));
        }
        // `$`-prefixed names are operator escapes; a trailing positional
        // segment is handled before insertion.
        if segment.starts_with('$') && !(segment == "$" && i > 0) {
            return Err(PathError::BadFieldName(path.to_string()));
        }
    }
    if depth > max_depth {
        return Err(PathError::DepthExceeded(max_depth));
    }
    Ok(())
}

fn insert_leaf(
    root: &mut IntermediateNode,
    path: &str,
    leaf: PathNode,
) -> Result<(), PathError> {
    let segments: Vec<&str> = path.split('.').collect();
    insert_into(root, path, &segments, leaf)
}

fn insert_into(
    node: &mut IntermediateNode,
    full_path: &str,
    segments: &[&str],
    leaf: PathNode,
) -> Result<(), PathError> {
    let segment = segments[0];
    let rest = &segments[1..];

    // A numeric segment addresses an array slot.
    if rest.first().is_some_and(|next| next.parse::<usize>().is_ok()) {
        return insert_array_slot(node, full_path, segment, rest, leaf);
    }

    if rest.is_empty() {
        return match node.children.get(segment) {
            None => {
                node.children.insert(segment.to_string(), leaf);
                Ok(())
            }
            Some(PathNode::Intermediate(_)) => Err(PathError::PartialPathCollision {
                shorter: full_path.to_string(),
                longer: format!("{full_path}.*"),
            }),
            Some(_) => Err(PathError::PathCollision(full_path.to_string())),
        };
    }

    let child = node
        .children
        .entry(segment.to_string())
        .or_insert_with(|| PathNode::Intermediate(IntermediateNode::default()));
    match child {
        PathNode::Intermediate(inner) => insert_into(inner, full_path, rest, leaf),
        _ => Err(PathError::PartialPathCollision {
            shorter: prefix_of(full_path, segments.len() - rest.len()),
            longer: full_path.to_string(),
        }),
    }
}

fn insert_array_slot(
    node: &mut IntermediateNode,
    full_path: &str,
    segment: &str,
    rest: &[&str],
    leaf: PathNode,
) -> Result<(), PathError> {
    let index: usize = rest[0].parse().expect("checked by caller");
    let after_index = &rest[1..];

    let child = node
        .children
        .entry(segment.to_string())
        .or_insert_with(|| PathNode::ArrayField(ArrayFieldNode::default()));
    let PathNode::ArrayField(array) = child else {
        return Err(PathError::PartialPathCollision {
            shorter: prefix_of(full_path, 1),
            longer: full_path.to_string(),
        });
    };

    let slot = match array.elements.iter_mut().find(|(i, _)| *i == index) {
        Some((_, existing)) => existing,
        None => {
            let at = array
                .elements
                .iter()
                .position(|(i, _)| *i > index)
                .unwrap_or(array.elements.len());
            array
                .elements
                .insert(at, (index, PathNode::Intermediate(IntermediateNode::default())));
            &mut array.elements[at].1
        }
    };

    if after_index.is_empty() {
        match slot {
            PathNode::Intermediate(inner) if inner.is_empty() => {
                *slot = leaf;
                Ok(())
            }
            _ => Err(PathError::PathCollision(full_path.to_string())),
        }
    } else {
        match slot {
            PathNode::Intermediate(inner) => insert_into(inner, full_path, after_index, leaf),
            _ => Err(PathError::PathCollision(full_path.to_string())),
        }
    }
}

fn prefix_of(path: &str, segments: usize) -> String {
    path.split('.').take(segments).collect::<Vec<_>>().join(".")
}

fn first_excluded_path(node: &IntermediateNode) -> Option<String> {
    for (segment, child) in &node.children {
        match child {
            PathNode::Excluded => return Some(segment.clone()),
            PathNode::Intermediate(inner) => {
                if let Some(sub) = first_excluded_path(inner) {
                    return Some(format!("{segment}.{sub}"));
                }
            }
            _ => {}
        }
    }
    None
}
