//! Partial worlds: the variable assignments a particle carries.

use crate::model::{IdTypeSet, Timestep, Value, Var};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Copy-on-write store of variable values.
///
/// Basic variables hold sampled or observed values of random functions;
/// derived variables cache non-random functions evaluated on demand. Cloning
/// shares both maps; the first write to either side of a clone detaches it,
/// so a clone never observes writes made through another.
#[derive(Debug, Clone)]
pub struct World {
    basic: Arc<BTreeMap<Var, Value>>,
    derived: Arc<BTreeMap<Var, Value>>,
    id_types: Arc<IdTypeSet>,
}

impl World {
    pub fn new(id_types: Arc<IdTypeSet>) -> Self {
        Self {
            basic: Arc::new(BTreeMap::new()),
            derived: Arc::new(BTreeMap::new()),
            id_types,
        }
    }

    pub fn id_types(&self) -> &IdTypeSet {
        &self.id_types
    }

    /// Value of `var`, whether basic or derived.
    pub fn value(&self, var: &Var) -> Option<&Value> {
        self.basic.get(var).or_else(|| self.derived.get(var))
    }

    pub fn basic_value(&self, var: &Var) -> Option<&Value> {
        self.basic.get(var)
    }

    pub fn is_instantiated(&self, var: &Var) -> bool {
        self.basic.contains_key(var)
    }

    /// Assigns a basic variable. Overwriting an existing value with a
    /// different one drops every derived value, since any of them may have
    /// been computed from it.
    pub fn set_value(&mut self, var: Var, value: Value) -> Option<Value> {
        let previous = Arc::make_mut(&mut self.basic).insert(var, value.clone());
        if let Some(old) = previous.as_ref() {
            if old != &value {
                self.remove_all_derived();
            }
        }
        previous
    }

    pub fn set_derived(&mut self, var: Var, value: Value) {
        Arc::make_mut(&mut self.derived).insert(var, value);
    }

    pub fn remove(&mut self, var: &Var) -> Option<Value> {
        if !self.basic.contains_key(var) {
            return None;
        }
        let removed = Arc::make_mut(&mut self.basic).remove(var);
        self.remove_all_derived();
        removed
    }

    /// Finds an instantiated argument-free variable of `function`: the
    /// atemporal one if present, otherwise the one at the latest timestep.
    pub fn lookup_by_name(&self, function: &str) -> Option<&Var> {
        self.basic
            .keys()
            .filter(|var| var.function() == function && var.args().is_empty())
            .max_by_key(|var| var.timestep().map(|t| i64::from(t.index())).unwrap_or(i64::MAX))
    }

    pub fn basic_vars(&self) -> impl Iterator<Item = (&Var, &Value)> {
        self.basic.iter()
    }

    pub fn derived_vars(&self) -> impl Iterator<Item = (&Var, &Value)> {
        self.derived.iter()
    }

    pub fn len(&self) -> usize {
        self.basic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.basic.is_empty()
    }

    pub fn derived_len(&self) -> usize {
        self.derived.len()
    }

    pub fn latest_timestep(&self) -> Option<Timestep> {
        self.basic.keys().filter_map(Var::timestep).max()
    }

    /// Removes every temporal variable strictly before `first_kept`.
    pub fn retain_from(&mut self, first_kept: Timestep) {
        let stale = |var: &Var| var.timestep().is_some_and(|t| t < first_kept);
        if self.basic.keys().any(stale) {
            Arc::make_mut(&mut self.basic).retain(|var, _| !stale(var));
        }
        if self.derived.keys().any(stale) {
            Arc::make_mut(&mut self.derived).retain(|var, _| !stale(var));
        }
    }

    pub fn remove_all_derived(&mut self) {
        if !self.derived.is_empty() {
            self.derived = Arc::new(BTreeMap::new());
        }
    }

    /// True when both worlds still share their basic storage.
    pub fn shares_storage_with(&self, other: &World) -> bool {
        Arc::ptr_eq(&self.basic, &other.basic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> World {
        World::new(Arc::new(IdTypeSet::none()))
    }

    #[test]
    fn clone_is_independent_after_write() {
        let mut original = world();
        original.set_value(Var::nullary("Drift"), Value::Real(1.0));
        let mut copy = original.clone();
        assert!(copy.shares_storage_with(&original));

        copy.set_value(Var::nullary("Drift"), Value::Real(5.0));
        assert!(!copy.shares_storage_with(&original));
        assert_eq!(original.value(&Var::nullary("Drift")), Some(&Value::Real(1.0)));
        assert_eq!(copy.value(&Var::nullary("Drift")), Some(&Value::Real(5.0)));
    }

    #[test]
    fn overwriting_basic_value_clears_derived_cache() {
        let mut w = world();
        w.set_value(Var::at("X", 0), Value::Real(1.0));
        w.set_derived(Var::at("Y", 0), Value::Real(2.0));
        w.set_value(Var::at("X", 0), Value::Real(1.0));
        assert_eq!(w.derived_len(), 1);
        w.set_value(Var::at("X", 0), Value::Real(3.0));
        assert_eq!(w.derived_len(), 0);
    }

    #[test]
    fn retain_from_drops_older_slices_only() {
        let mut w = world();
        for t in 0..4 {
            w.set_value(Var::at("X", t), Value::Integer(t as i64));
        }
        w.set_value(Var::nullary("Drift"), Value::Real(0.1));
        w.retain_from(Timestep(2));
        assert_eq!(w.len(), 3);
        assert!(w.is_instantiated(&Var::nullary("Drift")));
        assert!(!w.is_instantiated(&Var::at("X", 1)));
        assert_eq!(w.latest_timestep(), Some(Timestep(3)));
    }

    #[test]
    fn lookup_prefers_atemporal_then_latest() {
        let mut w = world();
        w.set_value(Var::at("X", 0), Value::Real(0.0));
        w.set_value(Var::at("X", 2), Value::Real(0.0));
        assert_eq!(w.lookup_by_name("X"), Some(&Var::at("X", 2)));
        w.set_value(Var::nullary("X"), Value::Real(0.0));
        assert_eq!(w.lookup_by_name("X"), Some(&Var::nullary("X")));
    }
}
