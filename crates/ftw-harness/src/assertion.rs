// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Evaluates a test's declared `output` against its captured traffic.

use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

const STATUS_PATTERN: &str = r"HTTP\S+ (\d{3})";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Check {
    Status,
    LogContains,
    NoLogContains,
    ResponseContains,
    HtmlContains,
    ExpectError,
}

impl Check {
    /// Maps an `output` key to its check; keys FTW knows but the harness
    /// cannot judge yield `None`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "status" => Some(Check::Status),
            "log_contains" => Some(Check::LogContains),
            "no_log_contains" => Some(Check::NoLogContains),
            "response_contains" => Some(Check::ResponseContains),
            "html_contains" => Some(Check::HtmlContains),
            "expect_error" => Some(Check::ExpectError),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Check::Status => "status",
            Check::LogContains => "log_contains",
            Check::NoLogContains => "no_log_contains",
            Check::ResponseContains => "response_contains",
            Check::HtmlContains => "html_contains",
            Check::ExpectError => "expect_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("invalid expected output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("expected output is not a mapping: {0}")]
    NotMapping(String),
    #[error("invalid pattern for {check}: {source}")]
    Pattern {
        check: &'static str,
        #[source]
        source: regex::Error,
    },
}

/// What a test captured during the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Captured<'a> {
    pub response: Option<&'a str>,
    pub log: Option<&'a str>,
}

/// Outcome of every check that could be evaluated, plus the error that
/// stopped evaluation early, if any.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub checks: BTreeMap<Check, bool>,
    pub error: Option<EvaluationError>,
}

impl Evaluation {
    /// `None` when evaluation was cut short; vacuously `true` without checks.
    #[must_use]
    pub fn passed(&self) -> Option<bool> {
        if self.error.is_some() {
            return None;
        }
        Some(self.checks.values().all(|passed| *passed))
    }
}

/// Verdict published for one test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub traffic_id: String,
    pub test_title: String,
    pub checks: BTreeMap<&'static str, bool>,
    pub passed: Option<bool>,
}

impl Verdict {
    #[must_use]
    pub fn new(traffic_id: &str, test_title: &str, evaluation: &Evaluation) -> Self {
        Self {
            traffic_id: traffic_id.to_string(),
            test_title: test_title.to_string(),
            checks: evaluation
                .checks
                .iter()
                .map(|(check, passed)| (check.name(), *passed))
                .collect(),
            passed: evaluation.passed(),
        }
    }
}

/// Evaluates the JSON-encoded `expected` output against `captured`.
#[must_use]
pub fn evaluate(expected: &str, captured: Captured<'_>) -> Evaluation {
    let mut evaluation = Evaluation::default();
    let expected: JsonValue = match serde_json::from_str(expected) {
        Ok(value) => value,
        Err(e) => {
            evaluation.error = Some(e.into());
            return evaluation;
        }
    };
    let expected = match expected {
        JsonValue::Object(map) => map,
        JsonValue::Null => return evaluation,
        other => {
            evaluation.error = Some(EvaluationError::NotMapping(other.to_string()));
            return evaluation;
        }
    };

    for (name, value) in &expected {
        let Some(check) = Check::from_name(name) else {
            continue;
        };
        match run_check(check, value, captured) {
            Ok(passed) => {
                evaluation.checks.insert(check, passed);
            }
            Err(e) => {
                evaluation.error = Some(e);
                break;
            }
        }
    }
    evaluation
}

fn run_check(check: Check, expected: &JsonValue, captured: Captured<'_>) -> Result<bool, EvaluationError> {
    match check {
        Check::Status => status_matches(expected, captured.response),
        Check::LogContains => regex_match(check, expected, captured.log),
        Check::NoLogContains => regex_match(check, expected, captured.log).map(|found| !found),
        Check::ResponseContains | Check::HtmlContains => {
            regex_match(check, expected, captured.response)
        }
        Check::ExpectError => Ok(truthy(expected) && captured.response.map_or(true, str::is_empty)),
    }
}

fn status_matches(expected: &JsonValue, response: Option<&str>) -> Result<bool, EvaluationError> {
    let Some(response) = response.filter(|r| !r.is_empty()) else {
        return Ok(false);
    };
    let status = Regex::new(STATUS_PATTERN).map_err(|source| EvaluationError::Pattern {
        check: Check::Status.name(),
        source,
    })?;
    let Some(code) = status
        .captures(response)
        .and_then(|captures| captures.get(1))
        .map(|code| code.as_str())
    else {
        return Ok(false);
    };
    Ok(match expected {
        JsonValue::Array(codes) => codes.iter().any(|c| scalar(c) == code),
        other => scalar(other) == code,
    })
}

fn regex_match(check: Check, expected: &JsonValue, text: Option<&str>) -> Result<bool, EvaluationError> {
    let pattern = RegexBuilder::new(&scalar(expected))
        .multi_line(true)
        .build()
        .map_err(|source| EvaluationError::Pattern {
            check: check.name(),
            source,
        })?;
    Ok(text.is_some_and(|text| !text.is_empty() && pattern.is_match(text)))
}

fn scalar(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}
