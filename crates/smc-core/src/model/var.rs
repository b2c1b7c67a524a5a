use super::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Discrete time index of a temporal variable (`@t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestep(pub u32);

impl Timestep {
    pub const fn index(self) -> u32 {
        self.0
    }

    pub fn prev(self) -> Option<Timestep> {
        self.0.checked_sub(1).map(Timestep)
    }
}

impl fmt::Display for Timestep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A random variable: a function applied to concrete arguments, optionally at a timestep.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Var {
    function: Arc<str>,
    args: Vec<Value>,
    timestep: Option<Timestep>,
}

impl Var {
    pub fn new(function: &str, args: Vec<Value>, timestep: Option<Timestep>) -> Self {
        Self {
            function: Arc::from(function),
            args,
            timestep,
        }
    }

    /// Atemporal variable with no arguments, e.g. a global model parameter.
    pub fn nullary(function: &str) -> Self {
        Self::new(function, Vec::new(), None)
    }

    /// Temporal variable with no arguments.
    pub fn at(function: &str, timestep: u32) -> Self {
        Self::new(function, Vec::new(), Some(Timestep(timestep)))
    }

    pub(crate) fn from_parts(
        function: Arc<str>,
        args: Vec<Value>,
        timestep: Option<Timestep>,
    ) -> Self {
        Self {
            function,
            args,
            timestep,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn timestep(&self) -> Option<Timestep> {
        self.timestep
    }

    pub fn is_temporal(&self) -> bool {
        self.timestep.is_some()
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.function)?;
        let has_parens = !self.args.is_empty() || self.timestep.is_some();
        if !has_parens {
            return Ok(());
        }
        f.write_str("(")?;
        let mut first = true;
        for arg in &self.args {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
            first = false;
        }
        if let Some(timestep) = self.timestep {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{timestep}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_model_syntax() {
        assert_eq!(Var::nullary("Drift").to_string(), "Drift");
        assert_eq!(Var::at("Weather", 3).to_string(), "Weather(@3)");
        let var = Var::new("Pos", vec![Value::symbol("a1")], Some(Timestep(0)));
        assert_eq!(var.to_string(), "Pos(a1, @0)");
    }

    #[test]
    fn first_timestep_has_no_predecessor() {
        assert_eq!(Timestep(0).prev(), None);
        assert_eq!(Timestep(4).prev(), Some(Timestep(3)));
    }
}
