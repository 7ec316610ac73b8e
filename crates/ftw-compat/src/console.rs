// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Terminal rendering of [`Topic::ShowUi`] screens and failed verdicts.

use std::io::{self, Write};
use std::rc::Rc;

use ftw_correlator::broker::{Handler, Message, Subscriptions, Topic, Value};
use ftw_correlator::errors::BrokerError;
use ftw_correlator::Context;
use ftw_harness::commands::{BYE_SCREEN, RULE_SCREEN, TUTORIAL_SCREEN, WELCOME_SCREEN};
use ftw_harness::progress::PROGRESS_SCREEN;
use serde_json::Value as JsonValue;
use tracing::debug;

const PROGRESS_WIDTH: usize = 60;

pub struct Console {
    subscriptions: Subscriptions,
}

impl Console {
    /// # Errors
    ///
    /// Fails on a conflicting [`Topic::ShowUi`] or [`Topic::CheckResult`] contract.
    pub fn start(ctx: &Context) -> Result<Self, BrokerError> {
        let screen_ctx = ctx.clone();
        let on_screen: Handler = Rc::new(move |message: &Message| {
            let Some(screen) = message.arg(0).and_then(Value::as_text) else {
                return;
            };
            let text = match screen {
                WELCOME_SCREEN => Some(welcome()),
                TUTORIAL_SCREEN => Some(tutorial(&screen_ctx.delimiter().firewall_rule())),
                BYE_SCREEN => Some(format!("\n{}\nbye~\n", "~".repeat(PROGRESS_WIDTH / 2))),
                RULE_SCREEN => message
                    .arg(1)
                    .and_then(Value::as_text)
                    .map(|rule| format!("{rule}\n")),
                PROGRESS_SCREEN => progress(message),
                other => {
                    debug!("Unknown screen {other}");
                    None
                }
            };
            if let Some(text) = text {
                emit(&text);
            }
        });

        let on_verdict: Handler = Rc::new(|message: &Message| {
            if let Some(text) = message.arg(0).and_then(Value::as_json).and_then(render_verdict) {
                emit(&text);
            }
        });

        let subscriptions = Subscriptions::new(Rc::clone(ctx.broker()))
            .with(Topic::ShowUi, on_screen)
            .with(Topic::CheckResult, on_verdict);
        subscriptions.start()?;
        Ok(Self { subscriptions })
    }

    pub fn close(&self) {
        self.subscriptions.close();
    }
}

fn emit(text: &str) {
    let mut stdout = io::stdout().lock();
    if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
        debug!("Failed to write to stdout: {e}");
    }
}

fn progress(message: &Message) -> Option<String> {
    let count = |index| match message.arg(index) {
        Some(Value::Int(n)) => usize::try_from(*n).ok(),
        _ => None,
    };
    let finished = count(1)?;
    let total = count(2)?;
    let title = message.arg(3).and_then(Value::as_text).unwrap_or_default();
    // overshoot is reported as a warning by the progress monitor
    if finished > total {
        return None;
    }
    let bar = render_progress(finished, total, title, PROGRESS_WIDTH);
    Some(if finished == total {
        format!("\r{bar}\n")
    } else {
        format!("\r{bar}")
    })
}

fn welcome() -> String {
    "\nFTW-compatible tool\n===================\n\n".to_string()
}

fn tutorial(rule: &str) -> String {
    let steps: [(&str, Option<(&str, &str)>); 7] = [
        (
            "Add this rule at the head of the SecRules (optional, for white-box testing)",
            None,
        ),
        (
            "Import test cases; test cases already in the database are kept",
            Some(("load <path of test cases>", "load ./OWASP-CRS-regressions")),
        ),
        (
            "Generate the packet file, optionally only for titles matching a regex",
            Some(("gen [title regex]", "gen")),
        ),
        (
            "Start the test, sending every request to the server",
            Some(("start <destination>", "start localhost:18080")),
        ),
        (
            "Import the server log (optional, for white-box testing)",
            Some(("import <path of log>", "import ./logs/error.log")),
        ),
        ("Report the test results", Some(("report", "report"))),
        ("Exit", Some(("exit", "exit"))),
    ];

    let mut text = format!("FTW-compatible tool includes {} steps:\n", steps.len());
    for (index, (description, usage)) in steps.iter().enumerate() {
        let step = index + 1;
        match usage {
            None => text.push_str(&format!("{step}. {description}\n{rule}\n\n")),
            Some((command, example)) => text.push_str(&format!(
                "{step}. {description}\n   command : {command}\n   e.g.    : {example}\n\n"
            )),
        }
    }
    text
}

/// `[(title)####------] 50.0%`, `width` being the length between the brackets.
fn render_progress(finished: usize, total: usize, title: &str, width: usize) -> String {
    let mut title = format!("({title})");
    if title.chars().count() > width {
        title = format!(
            "{}...)",
            title.chars().take(width.saturating_sub(4)).collect::<String>()
        );
    }
    let title_len = title.chars().count();
    let done = if total == 0 {
        width
    } else {
        finished * width / total
    };
    let filled = done.saturating_sub(title_len);
    let empty = width.saturating_sub(title_len + filled);
    let percent = if total == 0 {
        100.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let ratio = finished as f64 / total as f64;
        ratio * 100.0
    };
    format!(
        "[{title}{}{}]{percent:5.1}%",
        "#".repeat(filled),
        "-".repeat(empty)
    )
}

/// Lists a verdict that did not pass; passing verdicts render nothing.
fn render_verdict(verdict: &JsonValue) -> Option<String> {
    let passed = verdict.get("passed").and_then(JsonValue::as_bool);
    if passed == Some(true) {
        return None;
    }
    let field = |name: &str| {
        verdict
            .get(name)
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let checks = verdict
        .get("checks")
        .and_then(JsonValue::as_object)
        .map(|checks| {
            checks
                .iter()
                .map(|(name, ok)| {
                    let state = if ok.as_bool() == Some(true) { "ok" } else { "FAIL" };
                    format!("{name}={state}")
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    let outcome = match passed {
        Some(false) => "failed",
        _ => "unknown",
    };
    Some(format!(
        "{:<10} : {}\n{:<10} : {}\n{:<10} : {}\n{:<10} : {outcome}\n\n",
        "test_title",
        field("test_title"),
        "traffic_id",
        field("traffic_id"),
        "checks",
        checks,
        "result",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_bar() {
        assert_eq!(
            render_progress(1, 2, "t", 20),
            "[(t)#######----------] 50.0%"
        );
        assert_eq!(
            render_progress(3, 3, "911100-3", 12),
            "[(911100-3)##]100.0%"
        );
    }

    #[test]
    fn test_long_title_is_cut() {
        let bar = render_progress(0, 4, "a very long test title", 10);
        assert_eq!(bar, "[(a ver...)]  0.0%");
    }

    #[test]
    fn test_passing_verdict_is_silent() {
        let verdict = json!({
            "traffic_id": "k",
            "test_title": "911100-1",
            "checks": {"status": true},
            "passed": true,
        });
        assert_eq!(render_verdict(&verdict), None);
    }

    #[test]
    fn test_failed_verdict() {
        let verdict = json!({
            "traffic_id": "k",
            "test_title": "911100-3",
            "checks": {"log_contains": true, "status": false},
            "passed": false,
        });
        assert_eq!(
            render_verdict(&verdict).unwrap(),
            "test_title : 911100-3\n\
             traffic_id : k\n\
             checks     : log_contains=ok, status=FAIL\n\
             result     : failed\n\n"
        );
    }

    #[test]
    fn test_tutorial_lists_rule_first() {
        let text = tutorial("SecRule REQUEST_HEADERS:Host");
        assert!(text.starts_with("FTW-compatible tool includes 7 steps:\n1. "));
        assert!(text.contains("\nSecRule REQUEST_HEADERS:Host\n"));
        assert!(text.contains("   command : start <destination>\n"));
    }
}
