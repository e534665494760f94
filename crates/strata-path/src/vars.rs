use std::collections::HashMap;

use bson::RawBson;

/// Time-system variables frozen at cursor creation. Every expression
/// evaluated under the same cursor sees the same `$$NOW` and
/// `$$CLUSTER_TIME`, across every getMore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSnapshot {
    pub now: bson::DateTime,
    pub cluster_time: bson::Timestamp,
}

impl TimeSnapshot {
    pub fn capture(cluster_time: bson::Timestamp) -> Self {
        Self {
            now: bson::DateTime::now(),
            cluster_time,
        }
    }
}

impl Default for TimeSnapshot {
    fn default() -> Self {
        Self::capture(bson::Timestamp {
            time: 0,
            increment: 0,
        })
    }
}

/// A parent-scoped chain of variable bindings (`$let`, `$lookup` `let`,
/// pipeline-level `let`).
#[derive(Debug, Default)]
pub struct VarScope<'a> {
    parent: Option<&'a VarScope<'a>>,
    vars: HashMap<String, RawBson>,
}

impl<'a> VarScope<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars(vars: HashMap<String, RawBson>) -> Self {
        Self { parent: None, vars }
    }

    /// A child scope whose lookups fall back to this scope.
    pub fn child(&'a self, vars: HashMap<String, RawBson>) -> VarScope<'a> {
        VarScope {
            parent: Some(self),
            vars,
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: RawBson) {
        self.vars.insert(name.into(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<&RawBson> {
        match self.vars.get(name) {
            Some(v) => Some(v),
            None => self.parent.and_then(|p| p.lookup(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_scopes_shadow_and_fall_back() {
        let mut outer = VarScope::new();
        outer.bind("a", RawBson::Int32(1));
        outer.bind("b", RawBson::Int32(2));

        let mut inner_vars = HashMap::new();
        inner_vars.insert("a".to_string(), RawBson::Int32(10));
        let inner = outer.child(inner_vars);

        assert_eq!(inner.lookup("a"), Some(&RawBson::Int32(10)));
        assert_eq!(inner.lookup("b"), Some(&RawBson::Int32(2)));
        assert_eq!(inner.lookup("c"), None);
    }

    #[test]
    fn snapshot_is_stable() {
        let snap = TimeSnapshot::capture(bson::Timestamp {
            time: 7,
            increment: 3,
        });
        let copy = snap;
        assert_eq!(snap, copy);
        assert_eq!(snap.cluster_time.time, 7);
    }
}
