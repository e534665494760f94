use std::fmt;
use std::sync::Arc;

/// Which operator class an access method is being asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexClass {
    SinglePath,
    Composite,
    Text,
    Hashed,
    Unique,
    Wildcard,
}

/// Identifier of an operator family within the relational substrate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpFamily(pub String);

impl fmt::Display for OpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability booleans an access method declares at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmCapabilities {
    pub single_path: bool,
    pub unique: bool,
    pub wildcard: bool,
    pub composite: bool,
    pub text: bool,
    pub hashed: bool,
    pub order_by: bool,
    pub backwards_scan: bool,
    pub index_only_scan: bool,
    pub parallel_scan: bool,
}

/// Runtime predicate: is the named index multikey?
pub type MultikeyStatusFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
/// Runtime predicate: does the named index hold truncated terms?
pub type TruncationStatusFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
/// Optional hook contributing access-method-specific explain output.
pub type ExplainFn = Arc<dyn Fn(&str) -> bson::Document + Send + Sync>;

/// An immutable access-method registration entry.
///
/// One entry per alternate inverted-index implementation; the registry
/// routes `CREATE INDEX` and query planning through these.
#[derive(Clone)]
pub struct IndexAmEntry {
    /// Access-method name as referenced by index options.
    pub name: String,
    /// Identifier the relational substrate knows this method by.
    pub substrate_id: String,
    pub capabilities: AmCapabilities,
    /// Operator family per supported class; `None` for classes the method
    /// does not serve.
    op_families: Vec<(IndexClass, OpFamily)>,
    /// Operator families whose range predicates the compiler must split.
    range_optimized_families: Vec<OpFamily>,
    pub explain: Option<ExplainFn>,
    pub multikey_status: Option<MultikeyStatusFn>,
    pub truncation_status: Option<TruncationStatusFn>,
}

impl fmt::Debug for IndexAmEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexAmEntry")
            .field("name", &self.name)
            .field("substrate_id", &self.substrate_id)
            .field("capabilities", &self.capabilities)
            .field("op_families", &self.op_families)
            .finish()
    }
}

impl IndexAmEntry {
    pub fn new(
        name: impl Into<String>,
        substrate_id: impl Into<String>,
        capabilities: AmCapabilities,
    ) -> Self {
        Self {
            name: name.into(),
            substrate_id: substrate_id.into(),
            capabilities,
            op_families: Vec::new(),
            range_optimized_families: Vec::new(),
            explain: None,
            multikey_status: None,
            truncation_status: None,
        }
    }

    pub fn with_op_family(mut self, class: IndexClass, family: impl Into<String>) -> Self {
        self.op_families.push((class, OpFamily(family.into())));
        self
    }

    pub fn with_range_optimized_family(mut self, family: impl Into<String>) -> Self {
        self.range_optimized_families.push(OpFamily(family.into()));
        self
    }

    pub fn with_multikey_status(mut self, f: MultikeyStatusFn) -> Self {
        self.multikey_status = Some(f);
        self
    }

    pub fn with_truncation_status(mut self, f: TruncationStatusFn) -> Self {
        self.truncation_status = Some(f);
        self
    }

    pub fn with_explain(mut self, f: ExplainFn) -> Self {
        self.explain = Some(f);
        self
    }

    /// Resolve the operator family for a class this method serves.
    pub fn op_family(&self, class: IndexClass) -> Option<&OpFamily> {
        self.op_families
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, fam)| fam)
    }

    pub fn owns_op_family(&self, family: &OpFamily) -> bool {
        self.op_families.iter().any(|(_, fam)| fam == family)
    }

    /// Serves dotted-path, wildcard, and composite classes — the regular
    /// document index shape, as opposed to text/vector/geo methods.
    pub fn is_regular_bson_index(&self) -> bool {
        self.capabilities.single_path || self.capabilities.wildcard || self.capabilities.composite
    }

    /// Whether the compiler must split range predicates for this family.
    pub fn requires_range_optimization(&self, family: &OpFamily) -> bool {
        self.range_optimized_families.contains(family)
    }

    pub fn is_composite_op_family(&self, family: &OpFamily) -> bool {
        self.capabilities.composite && self.op_family(IndexClass::Composite) == Some(family)
    }

    pub fn supports_parallel_scans(&self, family: &OpFamily) -> bool {
        self.capabilities.parallel_scan && self.owns_op_family(family)
    }

    pub fn is_order_by_supported(&self, family: &OpFamily) -> bool {
        self.capabilities.order_by && self.owns_op_family(family)
    }

    /// Index-only-scan support plus the runtime callbacks the planner
    /// needs to decide per index at execution time.
    pub fn supports_index_only_scan(
        &self,
        family: &OpFamily,
    ) -> (bool, Option<MultikeyStatusFn>, Option<TruncationStatusFn>) {
        if self.capabilities.index_only_scan && self.owns_op_family(family) {
            (
                true,
                self.multikey_status.clone(),
                self.truncation_status.clone(),
            )
        } else {
            (false, None, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> IndexAmEntry {
        IndexAmEntry::new(
            "inverted",
            "strata_inverted",
            AmCapabilities {
                single_path: true,
                composite: true,
                wildcard: true,
                order_by: true,
                index_only_scan: true,
                ..AmCapabilities::default()
            },
        )
        .with_op_family(IndexClass::SinglePath, "bson_single_path_ops")
        .with_op_family(IndexClass::Composite, "bson_composite_ops")
        .with_range_optimized_family("bson_single_path_ops")
        .with_multikey_status(Arc::new(|name| name.ends_with("_mk")))
    }

    #[test]
    fn op_family_resolution() {
        let am = entry();
        assert_eq!(
            am.op_family(IndexClass::SinglePath),
            Some(&OpFamily("bson_single_path_ops".into()))
        );
        assert_eq!(am.op_family(IndexClass::Text), None);
    }

    #[test]
    fn capability_predicates() {
        let am = entry();
        let single = OpFamily("bson_single_path_ops".into());
        let composite = OpFamily("bson_composite_ops".into());
        assert!(am.is_regular_bson_index());
        assert!(am.requires_range_optimization(&single));
        assert!(!am.requires_range_optimization(&composite));
        assert!(am.is_composite_op_family(&composite));
        assert!(!am.is_composite_op_family(&single));
        assert!(am.is_order_by_supported(&single));
        assert!(!am.supports_parallel_scans(&single));
    }

    #[test]
    fn index_only_scan_yields_callbacks() {
        let am = entry();
        let single = OpFamily("bson_single_path_ops".into());
        let (ok, multikey, truncation) = am.supports_index_only_scan(&single);
        assert!(ok);
        assert!(multikey.is_some_and(|f| f("idx_mk")));
        assert!(truncation.is_none());

        let foreign = OpFamily("other_ops".into());
        let (ok, _, _) = am.supports_index_only_scan(&foreign);
        assert!(!ok);
    }
}
