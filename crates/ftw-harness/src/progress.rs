// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run progress, published as `ShowUi("progress", finished, total, title)`.
//!
//! The total comes from the generator's own "read N packets" banner, every
//! test being framed by two sentinels. Until that banner is seen, the number
//! of stored requests is used instead.

use std::cell::RefCell;
use std::rc::Rc;

use ftw_correlator::broker::{Handler, Message, Subscriptions, Topic, Value};
use ftw_correlator::errors::{PatternError, SetupError};
use ftw_correlator::query::{Field, Query};
use ftw_correlator::traffic::FINISH_PATTERN;
use ftw_correlator::Context;
use regex::Regex;
use tracing::debug;

pub const TOTAL_PATTERN: &str = r"^ read (\d+) packets from file with total length\((\d+)\)\.$";

/// Packets sent per test: opening sentinel, request, closing sentinel.
const PACKETS_PER_TEST: usize = 3;

pub const PROGRESS_SCREEN: &str = "progress";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub finished: usize,
    pub total: usize,
    pub active: bool,
}

pub struct ProgressMonitor {
    progress: Rc<RefCell<Progress>>,
    subscriptions: Subscriptions,
}

impl ProgressMonitor {
    /// # Errors
    ///
    /// Fails on a conflicting topic contract.
    pub fn start(ctx: &Context) -> Result<Self, SetupError> {
        let total_pattern = Regex::new(TOTAL_PATTERN).map_err(PatternError::from)?;
        let finish_pattern = Regex::new(FINISH_PATTERN).map_err(PatternError::from)?;
        let progress = Rc::new(RefCell::new(Progress::default()));

        let line_progress = Rc::clone(&progress);
        let on_line: Handler = Rc::new(move |message: &Message| {
            let Some(line) = message.arg(0).and_then(Value::as_bytes) else {
                return;
            };
            let line = String::from_utf8_lossy(line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(packets) = total_pattern
                .captures(line)
                .and_then(|captures| captures.get(1))
                .and_then(|packets| packets.as_str().parse::<usize>().ok())
            {
                let mut progress = line_progress.borrow_mut();
                *progress = Progress {
                    finished: 0,
                    total: packets / PACKETS_PER_TEST,
                    active: true,
                };
                debug!("Expecting {} tests", progress.total);
            } else if finish_pattern.is_match(line) {
                *line_progress.borrow_mut() = Progress::default();
            }
        });

        let traffic_ctx = ctx.clone();
        let traffic_progress = Rc::clone(&progress);
        let on_traffic: Handler = Rc::new(move |message: &Message| {
            let Some(key) = message.arg(0).and_then(Value::as_text) else {
                return;
            };
            let (finished, total) = {
                let mut progress = traffic_progress.borrow_mut();
                if !progress.active {
                    return;
                }
                progress.finished += 1;
                (progress.finished, progress.total)
            };
            let title = traffic_ctx
                .query(Query::SelectTestTitle {
                    traffic_id: key.to_string(),
                })
                .and_then(|result| {
                    result
                        .records()
                        .next()
                        .and_then(|record| record.text("test_title").map(ToString::to_string))
                })
                .unwrap_or_else(|| key.to_string());
            if finished > total {
                traffic_ctx.warn(format!("Finished({finished}) over total({total}) : {title}"));
            }
            traffic_ctx.publish(
                Topic::ShowUi,
                &Message::new(vec![
                    Value::Text(PROGRESS_SCREEN.to_string()),
                    Value::Int(i64::try_from(finished).unwrap_or(i64::MAX)),
                    Value::Int(i64::try_from(total).unwrap_or(i64::MAX)),
                    Value::Text(title),
                ]),
            );
        });

        let reset_ctx = ctx.clone();
        let reset_progress = Rc::clone(&progress);
        let on_reset: Handler = Rc::new(move |_: &Message| {
            let total = reset_ctx
                .query(Query::CountRequests)
                .and_then(|result| result.rows.first().and_then(|row| row.first()).and_then(Field::as_int))
                .and_then(|count| usize::try_from(count).ok())
                .unwrap_or_default();
            *reset_progress.borrow_mut() = Progress {
                finished: 0,
                total,
                active: true,
            };
        });

        let subscriptions = Subscriptions::new(Rc::clone(ctx.broker()))
            .with(Topic::GeneratorOutput, on_line)
            .with(Topic::RawTraffic, on_traffic)
            .with(Topic::Reset, on_reset);
        subscriptions.start()?;
        Ok(Self {
            progress,
            subscriptions,
        })
    }

    #[must_use]
    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn close(&self) {
        self.subscriptions.close();
    }
}
