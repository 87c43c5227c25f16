// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Scalar computation steps
//!
//! Each step reads the element environment and writes one variable, `self`
//! unless a different target is named. Steps run in registration order for
//! every element, so later steps see what earlier ones wrote.

use std::fmt;
use std::sync::Arc;

use klab_storage::Value;

use crate::expression::{Environment, ScalarExpression, SELF};
use crate::lookup::{Classification, LookupTable, ValueMediator};
use crate::ComputationResult;

/// One scalar-eligible computation
#[derive(Clone)]
pub enum ComputationStep {
    /// Same value for every element
    Constant { value: Value, target: String },
    Expression { expression: Arc<dyn ScalarExpression>, target: String },
    /// `target = table[input]`
    Lookup { table: Arc<LookupTable>, input: String, target: String },
    /// `target = classification(input)`
    Classify { classification: Arc<Classification>, input: String, target: String },
    /// Unit or value conversion of a variable in place
    Mediate { mediator: ValueMediator, variable: String },
}

impl ComputationStep {
    pub fn constant(value: impl Into<Value>) -> Self {
        ComputationStep::Constant {
            value: value.into(),
            target: SELF.to_string(),
        }
    }

    pub fn expression(expression: impl ScalarExpression + 'static) -> Self {
        ComputationStep::Expression {
            expression: Arc::new(expression),
            target: SELF.to_string(),
        }
    }

    /// Lookup keyed on `input`, writing `self`
    pub fn lookup(table: LookupTable, input: impl Into<String>) -> Self {
        ComputationStep::Lookup {
            table: Arc::new(table),
            input: input.into(),
            target: SELF.to_string(),
        }
    }

    /// Classification of `input`, writing `self`
    pub fn classify(classification: Classification, input: impl Into<String>) -> Self {
        ComputationStep::Classify {
            classification: Arc::new(classification),
            input: input.into(),
            target: SELF.to_string(),
        }
    }

    pub fn mediate(mediator: ValueMediator) -> Self {
        ComputationStep::Mediate {
            mediator,
            variable: SELF.to_string(),
        }
    }

    /// Write an intermediate variable instead of `self`
    pub fn into_target(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        match &mut self {
            ComputationStep::Constant { target, .. }
            | ComputationStep::Expression { target, .. }
            | ComputationStep::Lookup { target, .. }
            | ComputationStep::Classify { target, .. } => *target = name,
            ComputationStep::Mediate { variable, .. } => *variable = name,
        }
        self
    }

    /// Variable this step writes
    pub fn target(&self) -> &str {
        match self {
            ComputationStep::Constant { target, .. }
            | ComputationStep::Expression { target, .. }
            | ComputationStep::Lookup { target, .. }
            | ComputationStep::Classify { target, .. } => target,
            ComputationStep::Mediate { variable, .. } => variable,
        }
    }

    /// Variables this step reads
    pub fn inputs(&self) -> Vec<String> {
        match self {
            ComputationStep::Constant { .. } => Vec::new(),
            ComputationStep::Expression { expression, .. } => expression.variables(),
            ComputationStep::Lookup { input, .. } | ComputationStep::Classify { input, .. } => {
                vec![input.clone()]
            }
            ComputationStep::Mediate { variable, .. } => vec![variable.clone()],
        }
    }

    /// False if the step keeps state between elements
    pub fn is_reentrant(&self) -> bool {
        match self {
            ComputationStep::Expression { expression, .. } => expression.is_reentrant(),
            _ => true,
        }
    }

    pub(crate) fn apply(&self, env: &mut Environment) -> ComputationResult<()> {
        let (target, value) = match self {
            ComputationStep::Constant { value, target } => (target, value.clone()),
            ComputationStep::Expression { expression, target } => (target, expression.evaluate(env)?),
            ComputationStep::Lookup { table, input, target } => (target, table.lookup(env.get(input)?)),
            ComputationStep::Classify {
                classification,
                input,
                target,
            } => (target, classification.classify(env.get(input)?)),
            ComputationStep::Mediate { mediator, variable } => {
                (variable, mediator.convert(env.get(variable)?)?)
            }
        };
        env.set(target, value);
        Ok(())
    }
}

impl fmt::Debug for ComputationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputationStep::Constant { value, target } => write!(f, "{} = {}", target, value),
            ComputationStep::Expression { expression, target } => {
                write!(f, "{} = {}", target, expression.describe())
            }
            ComputationStep::Lookup { table, input, target } => {
                write!(f, "{} = lookup[{} rows]({})", target, table.len(), input)
            }
            ComputationStep::Classify {
                classification,
                input,
                target,
            } => write!(f, "{} = classify[{} classes]({})", target, classification.len(), input),
            ComputationStep::Mediate { mediator, variable } => write!(
                f,
                "{} = {} * {} + {}",
                variable, variable, mediator.scale, mediator.offset
            ),
        }
    }
}
