// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Service calls attached to actuators

use std::fmt;

use klab_computation::{
    Classification, ComputationStep, LookupTable, ScalarExpression, ValueMediator, SELF,
};
use klab_storage::Value;
use serde::{Deserialize, Serialize};

/// Argument of an extension call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    Value(Value),
    Text(String),
    /// Name of another observation in the context
    Observation(String),
}

impl From<f64> for Argument {
    fn from(v: f64) -> Self {
        Argument::Value(Value::Double(v))
    }
}

impl From<bool> for Argument {
    fn from(v: bool) -> Self {
        Argument::Value(Value::Boolean(v))
    }
}

impl From<&str> for Argument {
    fn from(v: &str) -> Self {
        Argument::Text(v.to_string())
    }
}

/// Declared parameter of an extension function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterType {
    Number,
    Boolean,
    Text,
    Observation,
    Any,
}

impl ParameterType {
    pub fn accepts(self, argument: &Argument) -> bool {
        match (self, argument) {
            (ParameterType::Any, _) => true,
            (ParameterType::Number, Argument::Value(v)) => {
                matches!(v, Value::Double(_) | Value::Float(_) | Value::Long(_) | Value::Int(_))
            }
            (ParameterType::Boolean, Argument::Value(Value::Boolean(_))) => true,
            (ParameterType::Text, Argument::Text(_) | Argument::Value(Value::Key(_))) => true,
            (ParameterType::Observation, Argument::Observation(_)) => true,
            _ => false,
        }
    }
}

/// One computation of an actuator
#[derive(Clone)]
pub enum ServiceCall {
    /// Constant, expression, lookup table, classification or mediator,
    /// fused with adjacent scalar calls
    Scalar(ComputationStep),
    /// Values pulled from a resource through an adapter or resources service
    Resource { urn: String },
    /// Function looked up in the registry by name and argument types
    Extension { name: String, arguments: Vec<Argument> },
}

impl ServiceCall {
    pub fn constant(value: impl Into<Value>) -> Self {
        ServiceCall::Scalar(ComputationStep::constant(value))
    }

    pub fn expression(expression: impl ScalarExpression + 'static) -> Self {
        ServiceCall::Scalar(ComputationStep::expression(expression))
    }

    pub fn lookup(table: LookupTable, input: impl Into<String>) -> Self {
        ServiceCall::Scalar(ComputationStep::lookup(table, input))
    }

    pub fn classify(classification: Classification, input: impl Into<String>) -> Self {
        ServiceCall::Scalar(ComputationStep::classify(classification, input))
    }

    pub fn mediate(mediator: ValueMediator) -> Self {
        ServiceCall::Scalar(ComputationStep::mediate(mediator))
    }

    pub fn resource(urn: impl Into<String>) -> Self {
        ServiceCall::Resource { urn: urn.into() }
    }

    pub fn extension(name: impl Into<String>, arguments: Vec<Argument>) -> Self {
        ServiceCall::Extension {
            name: name.into(),
            arguments,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, ServiceCall::Scalar(_))
    }

    /// Observations this call reads, by name
    pub fn dependencies(&self) -> Vec<String> {
        match self {
            ServiceCall::Scalar(step) => step.inputs().into_iter().filter(|v| v != SELF).collect(),
            ServiceCall::Resource { .. } => Vec::new(),
            ServiceCall::Extension { arguments, .. } => arguments
                .iter()
                .filter_map(|a| match a {
                    Argument::Observation(name) => Some(name.clone()),
                    _ => None,
                })
                .collect(),
        }
    }
}

impl fmt::Debug for ServiceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceCall::Scalar(step) => write!(f, "{:?}", step),
            ServiceCall::Resource { urn } => write!(f, "resource({})", urn),
            ServiceCall::Extension { name, arguments } => write!(f, "{}({} args)", name, arguments.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_compatibility() {
        assert!(ParameterType::Number.accepts(&Argument::Value(Value::Int(3))));
        assert!(!ParameterType::Number.accepts(&Argument::Text("3".into())));
        assert!(ParameterType::Text.accepts(&Argument::Value(Value::Key("forest".into()))));
        assert!(ParameterType::Observation.accepts(&Argument::Observation("elevation".into())));
        assert!(ParameterType::Any.accepts(&Argument::from(true)));
        assert!(!ParameterType::Boolean.accepts(&Argument::from(1.0)));
    }

    #[test]
    fn test_dependencies() {
        let call = ServiceCall::extension(
            "slope",
            vec![Argument::Observation("elevation".into()), Argument::from(2.0)],
        );
        assert_eq!(call.dependencies(), vec!["elevation".to_string()]);
        assert!(ServiceCall::mediate(ValueMediator::scale(2.0)).dependencies().is_empty());
        assert!(ServiceCall::resource("local:data:dem").dependencies().is_empty());
    }
}
