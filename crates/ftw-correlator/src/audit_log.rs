// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Audit-log correlation.
//!
//! With the sentinel rule installed, the WAF writes one log line per sentinel
//! request. Everything logged between the two lines of one key belongs to the
//! test framed by that key.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::broker::{Handler, Message, Subscriptions, Topic, Value};
use crate::collector::{Extractor, MatchRecord, SwitchCollector};
use crate::context::Context;
use crate::errors::SetupError;
use crate::query::Query;

/// The audit-log text attributable to one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFragment {
    pub key: String,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogExtraction {
    Fragment(LogFragment),
    /// Log written between the closing marker of one test and the opening
    /// marker of the next.
    Gap { start: String, end: String },
    /// The two marker lines carry different keys.
    Mismatch { start: String, end: String },
    /// Not enough lines between the markers to strip the framing.
    Malformed { key: String },
}

/// Pairs marker lines and strips the framing around the enclosed log.
#[derive(Debug, Default)]
pub struct LogExtractor {
    last_closed: Option<String>,
}

impl LogExtractor {
    /// Key of the last fragment that was closed.
    #[must_use]
    pub fn last_closed(&self) -> Option<&str> {
        self.last_closed.as_deref()
    }
}

impl Extractor for LogExtractor {
    type Output = LogExtraction;

    fn on_extract(&mut self, buffer: &[u8], start: &MatchRecord, end: &MatchRecord) -> LogExtraction {
        let start_key = start.group_str(1).unwrap_or_default().to_string();
        let end_key = end.group_str(1).unwrap_or_default().to_string();
        if start_key != end_key {
            // the closing marker of a test also opens the next scan
            if self.last_closed.as_deref() == Some(start_key.as_str()) {
                return LogExtraction::Gap {
                    start: start_key,
                    end: end_key,
                };
            }
            return LogExtraction::Mismatch {
                start: start_key,
                end: end_key,
            };
        }

        let text = String::from_utf8_lossy(buffer);
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() < 2 {
            return LogExtraction::Malformed { key: start_key };
        }
        // first and last lines are the tails of the marker lines
        let log = lines[1..lines.len() - 1].join("\n");
        self.last_closed = Some(start_key.clone());
        LogExtraction::Fragment(LogFragment {
            key: start_key,
            log,
        })
    }
}

/// Builds the collector over audit-log lines for the context's delimiter.
///
/// # Errors
///
/// Fails if the rendered log pattern does not compile.
pub fn log_collector(ctx: &Context) -> Result<SwitchCollector<LogExtractor>, SetupError> {
    let pattern = ctx.delimiter().log_pattern();
    Ok(SwitchCollector::new(&pattern, &pattern, LogExtractor::default())?)
}

/// Publishes a [`LogFragment`] on [`Topic::AuditLog`] for every test found on
/// [`Topic::RawLog`] and stores it.
pub struct LogCollector {
    collector: Rc<RefCell<SwitchCollector<LogExtractor>>>,
    subscriptions: Subscriptions,
}

impl LogCollector {
    /// # Errors
    ///
    /// Fails on an invalid pattern or a conflicting topic contract.
    pub fn start(ctx: &Context) -> Result<Self, SetupError> {
        let collector = Rc::new(RefCell::new(log_collector(ctx)?));

        let line_ctx = ctx.clone();
        let line_collector = Rc::clone(&collector);
        let on_line: Handler = Rc::new(move |message: &Message| {
            let Some(line) = message.arg(0).and_then(Value::as_bytes) else {
                return;
            };
            let extractions = line_collector.borrow_mut().feed(line);
            for extraction in extractions {
                handle_extraction(&line_ctx, extraction);
            }
        });

        let reset_collector = Rc::clone(&collector);
        let on_reset: Handler = Rc::new(move |_: &Message| {
            let mut collector = reset_collector.borrow_mut();
            collector.reset();
            *collector.extractor_mut() = LogExtractor::default();
        });

        let subscriptions = Subscriptions::new(Rc::clone(ctx.broker()))
            .with(Topic::RawLog, on_line)
            .with(Topic::Reset, on_reset);
        subscriptions.start()?;
        Ok(Self {
            collector,
            subscriptions,
        })
    }

    /// Processes a trailing line that had no newline.
    pub fn finish(&self, ctx: &Context) {
        let extractions = self.collector.borrow_mut().finish();
        for extraction in extractions {
            handle_extraction(ctx, extraction);
        }
    }

    pub fn close(&self) {
        self.subscriptions.close();
    }
}

fn handle_extraction(ctx: &Context, extraction: LogExtraction) {
    match extraction {
        LogExtraction::Fragment(fragment) => publish_fragment(ctx, fragment),
        LogExtraction::Gap { start, end } => {
            debug!("Skipped audit log between {start} and {end}");
        }
        LogExtraction::Mismatch { start, end } => {
            ctx.warn(format!("log key mismatch {start} != {end}"));
        }
        LogExtraction::Malformed { key } => {
            debug!("Malformed audit log fragment {key}");
            ctx.warn("log error");
        }
    }
}

fn publish_fragment(ctx: &Context, fragment: LogFragment) {
    let stored = ctx.query(Query::UpdateLog {
        traffic_id: fragment.key.clone(),
        raw_log: fragment.log.clone(),
    });
    if stored.is_some_and(|result| result.row_count == 0) {
        debug!("Audit log {} matches no loaded request", fragment.key);
    }
    ctx.publish(
        Topic::AuditLog,
        &Message::new(vec![Value::Text(fragment.key), Value::Text(fragment.log)]),
    );
}
