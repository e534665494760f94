use indexmap::IndexMap;

use crate::expr::CompiledExpression;
use crate::ops::OperatorContext;

/// A node of the BSON path tree.
///
/// The tree is keyed by dotted-path segments; intermediate nodes hold
/// ordered children, leaves carry what should happen at the path. Built
/// once from a specification document, read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum PathNode {
    Intermediate(IntermediateNode),
    /// The path is selected.
    Included,
    /// The path is removed.
    Excluded,
    /// The path maps to a computed expression.
    Field(CompiledExpression),
    /// The field maps to an array assembled from sub-leaves at known
    /// indices (`{"a.0": ..., "a.2": ...}` style specs).
    ArrayField(ArrayFieldNode),
    /// A find-projection operator with its own state.
    FieldWithContext(OperatorContext),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IntermediateNode {
    /// Children keyed by segment; insertion order is spec order.
    pub children: IndexMap<String, PathNode>,
    /// Whether any descendant leaf is an expression or operator field.
    pub has_expression_fields: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArrayFieldNode {
    /// `(index, leaf)` pairs in ascending index order.
    pub elements: Vec<(usize, PathNode)>,
}

/// What a projection tree does overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionMode {
    /// Only named paths appear in the output.
    Inclusion,
    /// Named paths are removed, everything else is kept.
    Exclusion,
    /// Every named path is computed; unnamed source paths are dropped.
    Expression,
}

/// A compiled projection: the tree plus the resolved mode and `_id`
/// handling.
#[derive(Debug, Clone, PartialEq)]
pub struct PathTree {
    pub root: IntermediateNode,
    pub mode: ProjectionMode,
    /// Whether `_id` appears in the output (it is exempt from the
    /// mixing rule and defaults to included).
    pub include_id: bool,
    /// Dotted path of the array targeted by a `$` positional leaf, if any.
    pub positional_path: Option<String>,
}

fn collect_fields<'t>(
    node: &'t IntermediateNode,
    prefix: String,
    out: &mut Vec<(String, &'t CompiledExpression)>,
) {
    for (segment, child) in &node.children {
        let path = if prefix.is_empty() {
            segment.clone()
        } else {
            format!("{prefix}.{segment}")
        };
        match child {
            PathNode::Field(expression) => out.push((path, expression)),
            PathNode::Intermediate(inner) => collect_fields(inner, path, out),
            _ => {}
        }
    }
}

impl PathNode {
    pub fn is_leaf(&self) -> bool {
        !matches!(self, PathNode::Intermediate(_))
    }

    pub fn as_intermediate(&self) -> Option<&IntermediateNode> {
        match self {
            PathNode::Intermediate(n) => Some(n),
            _ => None,
        }
    }

    /// Whether this subtree contains expression or operator leaves.
    pub(crate) fn has_expression_fields(&self) -> bool {
        match self {
            PathNode::Intermediate(n) => n.has_expression_fields,
            PathNode::Field(_) | PathNode::FieldWithContext(_) => true,
            PathNode::ArrayField(a) => a
                .elements
                .iter()
                .any(|(_, child)| child.has_expression_fields()),
            PathNode::Included | PathNode::Excluded => false,
        }
    }
}

impl IntermediateNode {
    pub fn child(&self, segment: &str) -> Option<&PathNode> {
        self.children.get(segment)
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Recompute `has_expression_fields` bottom-up. Called once after
    /// construction.
    pub(crate) fn refresh_expression_flags(&mut self) {
        let mut any = false;
        for (_, child) in self.children.iter_mut() {
            if let PathNode::Intermediate(inner) = child {
                inner.refresh_expression_flags();
            }
            if child.has_expression_fields() {
                any = true;
            }
        }
        self.has_expression_fields = any;
    }
}

impl PathTree {
    pub fn has_positional(&self) -> bool {
        self.positional_path.is_some()
    }

    /// Flatten every expression leaf into `(dotted-path, expression)`
    /// pairs, in tree order. `$addFields` application consumes this.
    pub fn flatten_fields(&self) -> Vec<(String, &CompiledExpression)> {
        let mut out = Vec::new();
        collect_fields(&self.root, String::new(), &mut out);
        out
    }

    /// Walk a dotted path to its node, if present.
    pub fn node_at(&self, path: &str) -> Option<&PathNode> {
        let mut node = &self.root;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let child = node.child(segment)?;
            if segments.peek().is_none() {
                return Some(child);
            }
            node = child.as_intermediate()?;
        }
        None
    }
}
