use std::sync::Arc;

use crate::am::{AmCapabilities, IndexAmEntry, IndexClass};
use crate::error::IndexError;
use crate::spec::{IndexKeyKind, IndexSpec};

/// Most alternate access methods a deployment can register besides the
/// default.
pub const MAX_ALTERNATE_INDEX_AMS: usize = 5;

/// Registry of index access methods: a default plus up to
/// [`MAX_ALTERNATE_INDEX_AMS`] alternates, registered at startup.
///
/// Lookup is by name (index creation) or by capability (planning). When
/// several methods claim a shape the first registered wins; registration
/// order is the deliberate, deterministic tie-break.
pub struct AmRegistry {
    default: IndexAmEntry,
    alternates: Vec<IndexAmEntry>,
}

impl AmRegistry {
    pub fn new(default: IndexAmEntry) -> Self {
        Self {
            default,
            alternates: Vec::new(),
        }
    }

    /// The stock registry: the regular inverted-document index as the
    /// default, with text, hashed, geospatial, and vector methods as
    /// alternates.
    pub fn builtin() -> Self {
        let default = IndexAmEntry::new(
            "inverted",
            "strata_inverted",
            AmCapabilities {
                single_path: true,
                unique: true,
                wildcard: true,
                composite: true,
                order_by: true,
                backwards_scan: true,
                index_only_scan: true,
                ..AmCapabilities::default()
            },
        )
        .with_op_family(IndexClass::SinglePath, "bson_single_path_ops")
        .with_op_family(IndexClass::Composite, "bson_composite_ops")
        .with_op_family(IndexClass::Unique, "bson_unique_ops")
        .with_op_family(IndexClass::Wildcard, "bson_wildcard_ops")
        .with_range_optimized_family("bson_single_path_ops")
        .with_multikey_status(Arc::new(|_| false));

        let mut registry = Self::new(default);

        let text = IndexAmEntry::new(
            "text",
            "strata_text",
            AmCapabilities {
                text: true,
                ..AmCapabilities::default()
            },
        )
        .with_op_family(IndexClass::Text, "bson_text_ops");

        let hashed = IndexAmEntry::new(
            "hashed",
            "strata_hashed",
            AmCapabilities {
                hashed: true,
                ..AmCapabilities::default()
            },
        )
        .with_op_family(IndexClass::Hashed, "bson_hashed_ops");

        let geo = IndexAmEntry::new(
            "2dsphere",
            "strata_gist_geo",
            AmCapabilities {
                single_path: true,
                ..AmCapabilities::default()
            },
        )
        .with_op_family(IndexClass::SinglePath, "bson_gist_geo_ops");

        let vector = IndexAmEntry::new(
            "vector",
            "strata_hnsw",
            AmCapabilities {
                single_path: true,
                parallel_scan: true,
                ..AmCapabilities::default()
            },
        )
        .with_op_family(IndexClass::SinglePath, "bson_hnsw_ops");

        for am in [text, hashed, geo, vector] {
            registry.register(am).expect("builtin registry fits");
        }
        registry
    }

    pub fn register(&mut self, entry: IndexAmEntry) -> Result<(), IndexError> {
        if self.alternates.len() >= MAX_ALTERNATE_INDEX_AMS {
            return Err(IndexError::RegistryFull);
        }
        if self.default.name == entry.name
            || self.alternates.iter().any(|a| a.name == entry.name)
        {
            return Err(IndexError::DuplicateAccessMethod(entry.name));
        }
        self.alternates.push(entry);
        Ok(())
    }

    pub fn default_am(&self) -> &IndexAmEntry {
        &self.default
    }

    /// Default first, then alternates in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexAmEntry> {
        std::iter::once(&self.default).chain(self.alternates.iter())
    }

    pub fn by_name(&self, name: &str) -> Option<&IndexAmEntry> {
        self.iter().find(|am| am.name == name)
    }

    /// First method (registration order) satisfying the predicate.
    pub fn find(&self, pred: impl Fn(&IndexAmEntry) -> bool) -> Option<&IndexAmEntry> {
        self.iter().find(|am| pred(am))
    }

    /// Pick the access method serving an index spec. Registration order
    /// breaks ties when several methods claim the shape.
    pub fn select_for_spec(&self, spec: &IndexSpec) -> Result<&IndexAmEntry, IndexError> {
        let wanted = |am: &IndexAmEntry| -> bool {
            let caps = &am.capabilities;
            if spec.wildcard && !caps.wildcard {
                return false;
            }
            if spec.unique && !caps.unique {
                return false;
            }
            if spec.keys.len() > 1 && !caps.composite {
                return false;
            }
            spec.keys.iter().all(|key| match key.kind {
                IndexKeyKind::Ascending | IndexKeyKind::Descending => {
                    caps.single_path || caps.composite || caps.wildcard
                }
                IndexKeyKind::Text => caps.text,
                IndexKeyKind::Hashed => caps.hashed,
                IndexKeyKind::Geo2dSphere => {
                    caps.single_path && am.op_family(IndexClass::SinglePath).is_some_and(|f| {
                        f.0.contains("geo")
                    })
                }
                IndexKeyKind::Vector => {
                    caps.single_path && am.op_family(IndexClass::SinglePath).is_some_and(|f| {
                        f.0.contains("hnsw")
                    })
                }
            })
        };
        self.find(wanted)
            .ok_or_else(|| IndexError::UnableToFindIndex(format!("index '{}'", spec.name)))
    }
}

#[cfg(test)]
mod tests {
    use bson::rawdoc;

    use crate::spec::parse_index_spec;

    use super::*;

    #[test]
    fn builtin_shape() {
        let registry = AmRegistry::builtin();
        assert_eq!(registry.default_am().name, "inverted");
        assert_eq!(registry.iter().count(), 5);
        assert!(registry.by_name("text").is_some());
        assert!(registry.by_name("nope").is_none());
    }

    #[test]
    fn registration_cap_enforced() {
        let mut registry = AmRegistry::builtin();
        let extra = IndexAmEntry::new("extra", "x", AmCapabilities::default());
        registry.register(extra).unwrap();
        let overflow = IndexAmEntry::new("overflow", "y", AmCapabilities::default());
        assert_eq!(registry.register(overflow), Err(IndexError::RegistryFull));
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut registry = AmRegistry::builtin();
        let dup = IndexAmEntry::new("text", "t2", AmCapabilities::default());
        assert!(matches!(
            registry.register(dup),
            Err(IndexError::DuplicateAccessMethod(_))
        ));
    }

    #[test]
    fn spec_selection_routes_by_kind() {
        let registry = AmRegistry::builtin();

        let plain = parse_index_spec(&rawdoc! { "key": { "a": 1 }, "name": "a_1" }).unwrap();
        assert_eq!(registry.select_for_spec(&plain).unwrap().name, "inverted");

        let composite =
            parse_index_spec(&rawdoc! { "key": { "a": 1, "b": -1 }, "name": "ab" }).unwrap();
        assert_eq!(registry.select_for_spec(&composite).unwrap().name, "inverted");

        let text =
            parse_index_spec(&rawdoc! { "key": { "body": "text" }, "name": "t" }).unwrap();
        assert_eq!(registry.select_for_spec(&text).unwrap().name, "text");

        let hashed =
            parse_index_spec(&rawdoc! { "key": { "h": "hashed" }, "name": "h" }).unwrap();
        assert_eq!(registry.select_for_spec(&hashed).unwrap().name, "hashed");
    }

    #[test]
    fn registration_order_breaks_ties() {
        // Two methods claim single-path shapes; the default was registered
        // first and wins.
        let registry = AmRegistry::builtin();
        let spec = parse_index_spec(&rawdoc! { "key": { "a": 1 }, "name": "a_1" }).unwrap();
        assert_eq!(registry.select_for_spec(&spec).unwrap().name, "inverted");
    }
}
