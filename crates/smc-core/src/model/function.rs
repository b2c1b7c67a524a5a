use super::value::{Value, ValueType};
use super::{ModelError, Timestep, Var};
use crate::distrib::Cpd;
use std::fmt;
use std::sync::Arc;

/// Evaluates a non-random function from its parent values.
pub type DeterministicFn = Arc<dyn Fn(&[Value]) -> Result<Value, ModelError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Random,
    NonRandom,
}

/// Which timestep a parent is read from, relative to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRef {
    /// Same timestep as the child (or atemporal if the child is).
    Same,
    /// One timestep before the child.
    Prev,
    /// The parent is not time-indexed.
    Atemporal,
}

/// How a parent's arguments are derived from the child's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgRef {
    Inherit,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    function: Arc<str>,
    time: TimeRef,
    args: ArgRef,
}

impl ParentRef {
    pub fn same(function: &str) -> Self {
        Self::new(function, TimeRef::Same, ArgRef::None)
    }

    pub fn prev(function: &str) -> Self {
        Self::new(function, TimeRef::Prev, ArgRef::None)
    }

    pub fn atemporal(function: &str) -> Self {
        Self::new(function, TimeRef::Atemporal, ArgRef::None)
    }

    pub fn new(function: &str, time: TimeRef, args: ArgRef) -> Self {
        Self {
            function: Arc::from(function),
            time,
            args,
        }
    }

    pub fn inheriting_args(mut self) -> Self {
        self.args = ArgRef::Inherit;
        self
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn time(&self) -> TimeRef {
        self.time
    }

    pub fn args(&self) -> ArgRef {
        self.args
    }

    /// Resolves the parent variable of `child`. Returns `Ok(None)` for a
    /// previous-timestep parent of a variable at the first timestep.
    pub(crate) fn resolve(&self, child: &Var) -> Result<Option<Var>, ModelError> {
        let timestep = match self.time {
            TimeRef::Atemporal => None,
            TimeRef::Same => child.timestep(),
            TimeRef::Prev => {
                let Some(current) = child.timestep() else {
                    return Err(ModelError::Unresolvable {
                        var: child.to_string(),
                        reason: format!("atemporal variable cannot read {}(prev)", self.function),
                    });
                };
                match current.prev() {
                    Some(prev) => Some(prev),
                    None => return Ok(None),
                }
            }
        };
        let args = match self.args {
            ArgRef::Inherit => child.args().to_vec(),
            ArgRef::None => Vec::new(),
        };
        Ok(Some(Var::from_parts(self.function.clone(), args, timestep)))
    }
}

#[derive(Clone)]
pub enum Law {
    Distribution(Arc<dyn Cpd>),
    Deterministic(DeterministicFn),
}

impl fmt::Debug for Law {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Law::Distribution(cpd) => f.debug_tuple("Distribution").field(cpd).finish(),
            Law::Deterministic(_) => f.write_str("Deterministic(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dependency {
    parents: Vec<ParentRef>,
    law: Law,
}

impl Dependency {
    pub fn random(parents: Vec<ParentRef>, cpd: impl Cpd + 'static) -> Self {
        Self {
            parents,
            law: Law::Distribution(Arc::new(cpd)),
        }
    }

    pub fn deterministic(
        parents: Vec<ParentRef>,
        eval: impl Fn(&[Value]) -> Result<Value, ModelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            parents,
            law: Law::Deterministic(Arc::new(eval)),
        }
    }

    pub fn parents(&self) -> &[ParentRef] {
        &self.parents
    }

    pub fn law(&self) -> &Law {
        &self.law
    }
}

/// A declared function of the model.
#[derive(Debug, Clone)]
pub struct Function {
    name: Arc<str>,
    kind: FunctionKind,
    arg_types: Vec<ValueType>,
    return_type: ValueType,
    time_indexed: bool,
    dependency: Dependency,
    initial: Option<Dependency>,
}

impl Function {
    pub fn random(name: &str, return_type: ValueType, dependency: Dependency) -> Self {
        Self::new(name, FunctionKind::Random, return_type, dependency)
    }

    pub fn non_random(name: &str, return_type: ValueType, dependency: Dependency) -> Self {
        Self::new(name, FunctionKind::NonRandom, return_type, dependency)
    }

    fn new(name: &str, kind: FunctionKind, return_type: ValueType, dependency: Dependency) -> Self {
        Self {
            name: Arc::from(name),
            kind,
            arg_types: Vec::new(),
            return_type,
            time_indexed: false,
            dependency,
            initial: None,
        }
    }

    /// Marks the function as indexed by a trailing timestep argument.
    pub fn temporal(mut self) -> Self {
        self.time_indexed = true;
        self
    }

    /// Dependency used at the first timestep instead of the general one.
    pub fn with_initial(mut self, initial: Dependency) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn with_args(mut self, arg_types: Vec<ValueType>) -> Self {
        self.arg_types = arg_types;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn is_random(&self) -> bool {
        self.kind == FunctionKind::Random
    }

    pub fn is_time_indexed(&self) -> bool {
        self.time_indexed
    }

    pub fn arity(&self) -> usize {
        self.arg_types.len()
    }

    pub fn arg_types(&self) -> &[ValueType] {
        &self.arg_types
    }

    pub fn return_type(&self) -> &ValueType {
        &self.return_type
    }

    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    pub fn initial(&self) -> Option<&Dependency> {
        self.initial.as_ref()
    }

    /// Dependency governing `timestep`: the initial one at `@0` when declared.
    pub fn dependency_at(&self, timestep: Option<Timestep>) -> &Dependency {
        match (timestep, self.initial.as_ref()) {
            (Some(Timestep(0)), Some(initial)) => initial,
            _ => &self.dependency,
        }
    }
}
