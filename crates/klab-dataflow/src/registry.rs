// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Extension function registry
//!
//! Functions are registered explicitly under a [`Signature`] (name plus
//! ordered parameter types). Resolution walks the registrations for a name in
//! order and returns the first whose parameters accept the call's arguments.
//! Plain functions and closures register directly; stateful implementations
//! implement [`ExtensionFunction`] on their own type.

use std::fmt;
use std::sync::Arc;

use klab_geometry::Geometry;
use parking_lot::RwLock;
use tracing::debug;

use crate::call::{Argument, ParameterType};
use crate::observation::Observation;
use crate::scope::ContextScope;
use crate::DataflowResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: String,
    pub parameters: Vec<ParameterType>,
}

impl Signature {
    pub fn new(name: impl Into<String>, parameters: &[ParameterType]) -> Self {
        Self {
            name: name.into(),
            parameters: parameters.to_vec(),
        }
    }

    pub fn matches(&self, name: &str, arguments: &[Argument]) -> bool {
        self.name == name
            && self.parameters.len() == arguments.len()
            && self
                .parameters
                .iter()
                .zip(arguments)
                .all(|(p, a)| p.accepts(a))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}", p)?;
        }
        f.write_str(")")
    }
}

/// Everything an extension function sees when called
pub struct Invocation<'a> {
    pub actuator: &'a str,
    /// Target observation, absent for void actuators
    pub observation: Option<&'a Arc<Observation>>,
    pub arguments: &'a [Argument],
    pub geometry: &'a Arc<Geometry>,
    pub scope: &'a ContextScope,
}

impl Invocation<'_> {
    /// Observation named by an `Argument::Observation` at `index`
    pub fn observation_argument(&self, index: usize) -> Option<Arc<Observation>> {
        match self.arguments.get(index)? {
            Argument::Observation(name) => self.scope.observation_named(name),
            _ => None,
        }
    }
}

pub trait ExtensionFunction: Send + Sync {
    fn call(&self, invocation: &Invocation<'_>) -> DataflowResult<()>;
}

impl<F> ExtensionFunction for F
where
    F: Fn(&Invocation<'_>) -> DataflowResult<()> + Send + Sync,
{
    fn call(&self, invocation: &Invocation<'_>) -> DataflowResult<()> {
        self(invocation)
    }
}

#[derive(Default)]
pub struct FunctionRegistry {
    entries: RwLock<Vec<(Signature, Arc<dyn ExtensionFunction>)>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, signature: Signature, function: impl ExtensionFunction + 'static) {
        self.register_shared(signature, Arc::new(function));
    }

    pub fn register_shared(&self, signature: Signature, function: Arc<dyn ExtensionFunction>) {
        debug!(target: "klab-dataflow", "Registered extension {}", signature);
        self.entries.write().push((signature, function));
    }

    /// First registration matching `name` and the argument types
    pub fn resolve(&self, name: &str, arguments: &[Argument]) -> Option<Arc<dyn ExtensionFunction>> {
        self.entries
            .read()
            .iter()
            .find(|(signature, _)| signature.matches(name, arguments))
            .map(|(_, function)| function.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klab_storage::Value;

    fn noop(_: &Invocation<'_>) -> DataflowResult<()> {
        Ok(())
    }

    struct Tagged(&'static str);

    impl ExtensionFunction for Tagged {
        fn call(&self, _: &Invocation<'_>) -> DataflowResult<()> {
            Err(crate::DataflowError::Execution(self.0.to_string()))
        }
    }

    #[test]
    fn test_signature_matching() {
        let sig = Signature::new("buffer", &[ParameterType::Observation, ParameterType::Number]);
        assert!(sig.matches("buffer", &[Argument::Observation("roads".into()), Argument::from(50.0)]));
        assert!(!sig.matches("buffer", &[Argument::Observation("roads".into())]));
        assert!(!sig.matches("buffer", &[Argument::from(50.0), Argument::Observation("roads".into())]));
        assert!(!sig.matches("distance", &[Argument::Observation("roads".into()), Argument::from(50.0)]));
        assert_eq!(sig.to_string(), "buffer(Observation, Number)");
    }

    #[test]
    fn test_first_compatible_registration_wins() {
        let registry = FunctionRegistry::new();
        let text: Arc<dyn ExtensionFunction> = Arc::new(Tagged("text"));
        let any: Arc<dyn ExtensionFunction> = Arc::new(Tagged("any"));
        registry.register_shared(Signature::new("f", &[ParameterType::Text]), text.clone());
        registry.register_shared(Signature::new("f", &[ParameterType::Any]), any.clone());
        registry.register(Signature::new("f", &[ParameterType::Number]), noop);
        assert_eq!(registry.len(), 3);

        let resolved = registry.resolve("f", &[Argument::from("x")]).unwrap();
        assert!(Arc::ptr_eq(&resolved, &text));
        // "any" was registered before the numeric overload and shadows it
        let resolved = registry.resolve("f", &[Argument::Value(Value::Int(1))]).unwrap();
        assert!(Arc::ptr_eq(&resolved, &any));

        assert!(registry.resolve("f", &[]).is_none());
        assert!(registry.resolve("g", &[Argument::from("x")]).is_none());
    }
}
