// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::broker::{ArgKind, Topic, TypeContract};

/// Errors raised by the broker.
///
/// `IncompatibleContract` is a setup-time error: the component that tried to
/// subscribe is misconfigured. `ContractViolation` aborts a single publish and
/// leaves the broker untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("type contract {declared} on topic {topic} is not compatible with previous {existing}")]
    IncompatibleContract {
        topic: Topic,
        declared: TypeContract,
        existing: TypeContract,
    },
    #[error("argument {argument} on topic {topic} expects {expected}, got {found}")]
    ContractViolation {
        topic: Topic,
        argument: String,
        expected: ArgKind,
        found: ArgKind,
    },
}

/// Errors raised while compiling collector or delimiter patterns.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("start pattern {start:?} and end pattern {end:?} both match the empty string")]
    Degenerate { start: String, end: String },
    #[error("delimiter secret must not be empty")]
    EmptySecret,
    #[error("invalid pattern: {0}")]
    Invalid(#[from] regex::Error),
}

/// Errors raised while wiring a component onto a broker.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
