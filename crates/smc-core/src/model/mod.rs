//! Declarative probability model: types, functions, and their dependencies.
//!
//! A model is assembled with [`ModelBuilder`], which validates parent references
//! once so that instantiation never has to re-check the declaration graph.

mod function;
mod instantiate;
mod value;
mod var;

pub use function::{
    ArgRef, DeterministicFn, Dependency, Function, FunctionKind, Law, ParentRef, TimeRef,
};
pub use value::{Value, ValueType};
pub use var::{Timestep, Var};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("invalid declaration of '{function}': {reason}")]
    InvalidDeclaration { function: String, reason: String },
    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),
    #[error("cannot resolve {var}: {reason}")]
    Unresolvable { var: String, reason: String },
    #[error("{var} expects a value of type {expected}, got {found}")]
    TypeMismatch {
        var: String,
        expected: ValueType,
        found: Value,
    },
}

/// A user-declared type and its guaranteed objects.
#[derive(Debug, Clone)]
pub struct TypeDecl {
    name: Arc<str>,
    guaranteed: Vec<Value>,
}

impl TypeDecl {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guaranteed(&self) -> &[Value] {
        &self.guaranteed
    }
}

/// Set of types whose objects are represented by identifiers in a world.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdTypeSet(BTreeSet<Arc<str>>);

impl IdTypeSet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.0.contains(type_name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|name| name.as_ref())
    }
}

#[derive(Debug)]
pub struct Model {
    types: Vec<TypeDecl>,
    functions: Vec<Function>,
    by_name: HashMap<Arc<str>, usize>,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.by_name.get(name).map(|&index| &self.functions[index])
    }

    pub fn lookup(&self, name: &str) -> Result<&Function, ModelError> {
        self.function(name)
            .ok_or_else(|| ModelError::UnknownFunction(name.to_string()))
    }

    pub fn types(&self) -> &[TypeDecl] {
        &self.types
    }

    pub fn type_decl(&self, name: &str) -> Option<&TypeDecl> {
        self.types.iter().find(|decl| decl.name() == name)
    }

    /// Parses an `idTypes` list: `none`, `all`, or comma-separated type names.
    /// Returns `None` when a listed name is not a declared type.
    pub fn listed_types(&self, listing: &str) -> Option<IdTypeSet> {
        let trimmed = listing.trim();
        if trimmed.eq_ignore_ascii_case("none") || trimmed.is_empty() {
            return Some(IdTypeSet::none());
        }
        if trimmed.eq_ignore_ascii_case("all") {
            return Some(IdTypeSet(
                self.types.iter().map(|decl| decl.name.clone()).collect(),
            ));
        }
        let mut set = BTreeSet::new();
        for name in trimmed.split(',').map(str::trim) {
            let decl = self.type_decl(name)?;
            set.insert(decl.name.clone());
        }
        Some(IdTypeSet(set))
    }

    /// Checks that `value` inhabits `ty`, including membership of symbols in
    /// the declared object set.
    pub fn value_has_type(&self, value: &Value, ty: &ValueType) -> bool {
        if !value.conforms_to(ty) {
            return false;
        }
        match ty {
            ValueType::Symbol(name) => self
                .type_decl(name)
                .is_some_and(|decl| decl.guaranteed.contains(value)),
            _ => true,
        }
    }

    /// Checks that `var` applies its function to well-typed arguments at a
    /// timestep exactly when the function is time-indexed.
    pub fn check_var(&self, var: &Var) -> Result<&Function, ModelError> {
        let function = self.lookup(var.function())?;
        if function.is_time_indexed() != var.is_temporal() {
            let reason = if function.is_time_indexed() {
                "missing timestep"
            } else {
                "function is not time-indexed"
            };
            return Err(ModelError::Unresolvable {
                var: var.to_string(),
                reason: reason.to_string(),
            });
        }
        if function.arity() != var.args().len() {
            return Err(ModelError::Unresolvable {
                var: var.to_string(),
                reason: format!(
                    "expected {} arguments, got {}",
                    function.arity(),
                    var.args().len()
                ),
            });
        }
        for (arg, ty) in var.args().iter().zip(function.arg_types()) {
            if !self.value_has_type(arg, ty) {
                return Err(ModelError::TypeMismatch {
                    var: var.to_string(),
                    expected: ty.clone(),
                    found: arg.clone(),
                });
            }
        }
        Ok(function)
    }
}

#[derive(Debug, Default)]
pub struct ModelBuilder {
    types: Vec<TypeDecl>,
    functions: Vec<Function>,
}

impl ModelBuilder {
    /// Declares a type with the given guaranteed objects.
    pub fn guaranteed_type(mut self, name: &str, objects: &[&str]) -> Self {
        self.types.push(TypeDecl {
            name: Arc::from(name),
            guaranteed: objects.iter().map(|object| Value::symbol(object)).collect(),
        });
        self
    }

    pub fn function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn build(self) -> Result<Model, ModelError> {
        let mut seen_types = BTreeSet::new();
        for decl in &self.types {
            if !seen_types.insert(decl.name.clone()) {
                return Err(ModelError::InvalidDeclaration {
                    function: decl.name.to_string(),
                    reason: "type declared more than once".to_string(),
                });
            }
        }

        let mut by_name = HashMap::new();
        for (index, function) in self.functions.iter().enumerate() {
            if by_name.insert(Arc::from(function.name()), index).is_some() {
                return Err(ModelError::InvalidDeclaration {
                    function: function.name().to_string(),
                    reason: "function declared more than once".to_string(),
                });
            }
        }

        let model = Model {
            types: self.types,
            functions: self.functions,
            by_name,
        };
        for function in &model.functions {
            validate_function(&model, function)?;
        }
        Ok(model)
    }
}

fn validate_function(model: &Model, function: &Function) -> Result<(), ModelError> {
    let invalid = |reason: String| ModelError::InvalidDeclaration {
        function: function.name().to_string(),
        reason,
    };

    for ty in function.arg_types().iter().chain([function.return_type()]) {
        if let ValueType::Symbol(name) = ty {
            if model.type_decl(name).is_none() {
                return Err(ModelError::UnknownType(name.to_string()));
            }
        }
    }

    let dependency_is_random = matches!(function.dependency().law(), Law::Distribution(_));
    if dependency_is_random != function.is_random() {
        return Err(invalid(
            "random functions need a distribution, non-random ones an expression".to_string(),
        ));
    }

    if function.initial().is_some() && !function.is_time_indexed() {
        return Err(invalid("only temporal functions take an initial dependency".to_string()));
    }

    let needs_initial = function
        .dependency()
        .parents()
        .iter()
        .any(|parent| parent.time() == TimeRef::Prev);
    if needs_initial && function.initial().is_none() {
        return Err(invalid(
            "reads a previous timestep but declares no initial dependency".to_string(),
        ));
    }

    if let Some(initial) = function.initial() {
        if initial.parents().iter().any(|parent| parent.time() == TimeRef::Prev) {
            return Err(invalid("initial dependency cannot read a previous timestep".to_string()));
        }
    }

    let dependencies = std::iter::once(function.dependency()).chain(function.initial());
    for dependency in dependencies {
        for parent in dependency.parents() {
            let target = model.lookup(parent.function())?;
            let time_ok = match parent.time() {
                TimeRef::Same => target.is_time_indexed() == function.is_time_indexed(),
                TimeRef::Prev => target.is_time_indexed() && function.is_time_indexed(),
                TimeRef::Atemporal => !target.is_time_indexed(),
            };
            if !time_ok {
                return Err(invalid(format!(
                    "parent '{}' has an incompatible time index",
                    parent.function()
                )));
            }
            let args_ok = match parent.args() {
                ArgRef::Inherit => target.arg_types() == function.arg_types(),
                ArgRef::None => target.arity() == 0,
            };
            if !args_ok {
                return Err(invalid(format!(
                    "parent '{}' cannot be applied to the child's arguments",
                    parent.function()
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distrib::{LinearGaussian, Tabular};

    fn region_model() -> ModelBuilder {
        Model::builder()
            .guaranteed_type("RainEvent", &["Rainy", "Dry"])
            .function(Function::random(
                "RainyRegion",
                ValueType::symbol("RainEvent"),
                Dependency::random(
                    Vec::new(),
                    Tabular::prior(vec![Value::symbol("Rainy"), Value::symbol("Dry")], &[0.5, 0.5])
                        .unwrap(),
                ),
            ))
    }

    #[test]
    fn listed_types_resolves_names() {
        let model = region_model().build().unwrap();
        assert!(model.listed_types("none").unwrap().is_empty());
        assert!(model.listed_types("all").unwrap().contains("RainEvent"));
        assert!(model.listed_types("RainEvent").unwrap().contains("RainEvent"));
        assert!(model.listed_types("Aircraft").is_none());
    }

    #[test]
    fn previous_timestep_requires_initial_dependency() {
        let result = Model::builder()
            .function(
                Function::random(
                    "X",
                    ValueType::Real,
                    Dependency::random(
                        vec![ParentRef::prev("X")],
                        LinearGaussian::new(0.0, vec![1.0], 1.0).unwrap(),
                    ),
                )
                .temporal(),
            )
            .build();
        assert!(matches!(result, Err(ModelError::InvalidDeclaration { .. })));
    }

    #[test]
    fn atemporal_parent_must_not_be_time_indexed() {
        let result = region_model()
            .function(
                Function::random(
                    "Y",
                    ValueType::Real,
                    Dependency::random(
                        vec![ParentRef::atemporal("Z")],
                        LinearGaussian::new(0.0, vec![1.0], 1.0).unwrap(),
                    ),
                ),
            )
            .function(
                Function::random(
                    "Z",
                    ValueType::Real,
                    Dependency::random(Vec::new(), LinearGaussian::fixed(0.0, 1.0).unwrap()),
                )
                .temporal(),
            )
            .build();
        assert!(matches!(result, Err(ModelError::InvalidDeclaration { .. })));
    }

    #[test]
    fn symbols_must_be_guaranteed_objects() {
        let model = region_model().build().unwrap();
        let ty = ValueType::symbol("RainEvent");
        assert!(model.value_has_type(&Value::symbol("Dry"), &ty));
        assert!(!model.value_has_type(&Value::symbol("Snow"), &ty));
    }
}
