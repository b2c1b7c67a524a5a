//! Lazy instantiation of variables against a world.

use super::{Dependency, FunctionKind, Law, Model, ModelError, Value, Var};
use crate::world::World;
use rand::RngCore;

impl Model {
    /// Returns the value of `var`, first sampling or evaluating it (and,
    /// recursively, its ancestors) if the world does not hold it yet.
    pub fn ensure_instantiated(
        &self,
        world: &mut World,
        var: &Var,
        rng: &mut dyn RngCore,
    ) -> Result<Value, ModelError> {
        if let Some(value) = world.value(var) {
            return Ok(value.clone());
        }
        let function = self.check_var(var)?;
        let dependency = function.dependency_at(var.timestep());
        let parents = self.instantiate_parents(world, var, dependency, rng)?;
        let value = match dependency.law() {
            Law::Distribution(cpd) => cpd.sample(&parents, rng)?,
            Law::Deterministic(eval) => eval(&parents)?,
        };
        self.check_result(var, function.return_type(), &value)?;
        match function.kind() {
            FunctionKind::Random => {
                world.set_value(var.clone(), value.clone());
            }
            FunctionKind::NonRandom => world.set_derived(var.clone(), value.clone()),
        }
        Ok(value)
    }

    /// Instantiates every variable in `vars`, closing over their ancestors.
    pub fn ensure_supported<'a>(
        &self,
        world: &mut World,
        vars: impl IntoIterator<Item = &'a Var>,
        rng: &mut dyn RngCore,
    ) -> Result<(), ModelError> {
        for var in vars {
            self.ensure_instantiated(world, var, rng)?;
        }
        Ok(())
    }

    /// Clamps `var` to the observed `value` and returns its conditional log
    /// probability given its (instantiated on demand) parents.
    pub fn observe(
        &self,
        world: &mut World,
        var: &Var,
        value: &Value,
        rng: &mut dyn RngCore,
    ) -> Result<f64, ModelError> {
        let function = self.check_var(var)?;
        let dependency = function.dependency_at(var.timestep());
        let Law::Distribution(cpd) = dependency.law() else {
            return Err(ModelError::Unresolvable {
                var: var.to_string(),
                reason: "non-random functions cannot be observed".to_string(),
            });
        };
        let cpd = cpd.clone();
        let parents = self.instantiate_parents(world, var, dependency, rng)?;
        world.set_value(var.clone(), value.clone());
        cpd.log_prob(&parents, value)
    }

    /// Draws a fresh value for random `var` from its conditional
    /// distribution without writing it to the world. Parents are
    /// instantiated as needed.
    pub fn sample_conditional(
        &self,
        world: &mut World,
        var: &Var,
        rng: &mut dyn RngCore,
    ) -> Result<Value, ModelError> {
        let function = self.check_var(var)?;
        let dependency = function.dependency_at(var.timestep());
        let Law::Distribution(cpd) = dependency.law() else {
            return Err(ModelError::Unresolvable {
                var: var.to_string(),
                reason: "non-random functions have no distribution".to_string(),
            });
        };
        let cpd = cpd.clone();
        let parents = self.instantiate_parents(world, var, dependency, rng)?;
        let value = cpd.sample(&parents, rng)?;
        self.check_result(var, function.return_type(), &value)?;
        Ok(value)
    }

    /// Log probability of the basic variable `var` given its parents, reading
    /// only what the world already determines. `None` when `var` or one of
    /// its random ancestors is not instantiated.
    pub fn conditional_log_prob(&self, world: &World, var: &Var) -> Result<Option<f64>, ModelError> {
        let Some(value) = world.basic_value(var) else {
            return Ok(None);
        };
        let function = self.lookup(var.function())?;
        let dependency = function.dependency_at(var.timestep());
        let Law::Distribution(cpd) = dependency.law() else {
            return Ok(None);
        };
        match self.read_parents(world, var, dependency)? {
            Some(parents) => Ok(Some(cpd.log_prob(&parents, value)?)),
            None => Ok(None),
        }
    }

    /// Sum of the conditional log probabilities of every basic variable in
    /// `world` other than `skip` whose parents are determined.
    pub fn log_joint_excluding(&self, world: &World, skip: &Var) -> Result<f64, ModelError> {
        let mut total = 0.0;
        for (var, _) in world.basic_vars() {
            if var == skip {
                continue;
            }
            if let Some(log_prob) = self.conditional_log_prob(world, var)? {
                total += log_prob;
            }
        }
        Ok(total)
    }

    fn instantiate_parents(
        &self,
        world: &mut World,
        var: &Var,
        dependency: &Dependency,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Value>, ModelError> {
        let mut values = Vec::with_capacity(dependency.parents().len());
        for parent in dependency.parents() {
            let parent_var = parent.resolve(var)?.ok_or_else(|| ModelError::Unresolvable {
                var: var.to_string(),
                reason: format!("{} has no previous timestep", parent.function()),
            })?;
            values.push(self.ensure_instantiated(world, &parent_var, rng)?);
        }
        Ok(values)
    }

    fn read_parents(
        &self,
        world: &World,
        var: &Var,
        dependency: &Dependency,
    ) -> Result<Option<Vec<Value>>, ModelError> {
        let mut values = Vec::with_capacity(dependency.parents().len());
        for parent in dependency.parents() {
            let Some(parent_var) = parent.resolve(var)? else {
                return Ok(None);
            };
            match self.read_value(world, &parent_var)? {
                Some(value) => values.push(value),
                None => return Ok(None),
            }
        }
        Ok(Some(values))
    }

    fn read_value(&self, world: &World, var: &Var) -> Result<Option<Value>, ModelError> {
        if let Some(value) = world.value(var) {
            return Ok(Some(value.clone()));
        }
        let function = self.lookup(var.function())?;
        let dependency = function.dependency_at(var.timestep());
        match dependency.law() {
            Law::Distribution(_) => Ok(None),
            Law::Deterministic(eval) => match self.read_parents(world, var, dependency)? {
                Some(parents) => Ok(Some(eval(&parents)?)),
                None => Ok(None),
            },
        }
    }

    fn check_result(
        &self,
        var: &Var,
        expected: &super::ValueType,
        value: &Value,
    ) -> Result<(), ModelError> {
        if self.value_has_type(value, expected) {
            Ok(())
        } else {
            Err(ModelError::TypeMismatch {
                var: var.to_string(),
                expected: expected.clone(),
                found: value.clone(),
            })
        }
    }
}
