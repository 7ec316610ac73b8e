// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A correlation session: one broker with every harness component attached.

use std::rc::Rc;

use ftw_correlator::audit_log::LogCollector;
use ftw_correlator::broker::{Broker, Message, Topic, Value};
use ftw_correlator::errors::{BrokerError, PatternError, SetupError};
use ftw_correlator::query::{Database, DatabaseService};
use ftw_correlator::traffic::{GeneratorPatterns, RawPacketCollector, RealTrafficCollector};
use ftw_correlator::{Context, Delimiter};
use tracing::{debug, error};

use crate::commands::Harness;
use crate::config::Config;
use crate::diagnostics::DiagnosticsBridge;
use crate::progress::ProgressMonitor;
use crate::store::{StoreError, TrafficStore};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid delimiter: {0}")]
    Delimiter(#[from] PatternError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed to open traffic store: {0}")]
    Store(#[from] StoreError),
}

pub struct Session {
    ctx: Context,
    store: Rc<TrafficStore>,
    diagnostics: DiagnosticsBridge,
    database: DatabaseService,
    requests: Rc<RawPacketCollector>,
    responses: Rc<RawPacketCollector>,
    traffic: RealTrafficCollector,
    log: LogCollector,
    progress: ProgressMonitor,
    harness: Harness,
}

impl Session {
    /// Opens the store and attaches every component to a fresh broker.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be opened or a component cannot subscribe.
    pub fn start(config: &Config) -> Result<Self, SessionError> {
        let delimiter = match &config.delimiter_secret {
            Some(secret) => Delimiter::with_secret(secret.clone())?,
            None => Delimiter::generate()?,
        };
        let store = match &config.database {
            Some(path) => TrafficStore::open(path)?,
            None => TrafficStore::open_ephemeral()?,
        };
        debug!("Traffic store at {}", store.path().display());
        Self::with_store(config, delimiter, store)
    }

    /// # Errors
    ///
    /// Fails when a component cannot subscribe.
    pub fn with_store(
        config: &Config,
        delimiter: Delimiter,
        store: TrafficStore,
    ) -> Result<Self, SessionError> {
        let ctx = Context::new(Rc::new(Broker::new()), Rc::new(delimiter));
        let store = Rc::new(store);
        let patterns = GeneratorPatterns::default();

        let diagnostics = DiagnosticsBridge::start(&ctx)?;
        let database = DatabaseService::start(&ctx, Rc::clone(&store) as Rc<dyn Database>)?;
        let requests = Rc::new(RawPacketCollector::requests(&ctx, &patterns)?);
        let responses = Rc::new(RawPacketCollector::responses(&ctx, &patterns)?);
        let traffic = RealTrafficCollector::start(&ctx)?;
        let log = LogCollector::start(&ctx)?;
        let progress = ProgressMonitor::start(&ctx)?;
        let harness = Harness::start(&ctx, config)?;

        let finish_requests = Rc::clone(&requests);
        let finish_responses = Rc::clone(&responses);
        harness.on_run_finished(Rc::new(move |ctx: &Context| {
            finish_requests.finish(ctx);
            finish_responses.finish(ctx);
        }));

        Ok(Self {
            ctx,
            store,
            diagnostics,
            database,
            requests,
            responses,
            traffic,
            log,
            progress,
            harness,
        })
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    #[must_use]
    pub fn store(&self) -> &TrafficStore {
        &self.store
    }

    #[must_use]
    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    #[must_use]
    pub fn progress(&self) -> &ProgressMonitor {
        &self.progress
    }

    /// Runs one command line such as `start localhost:8080`.
    ///
    /// Returns `false` once the session is stopped.
    pub fn execute(&self, line: &str) -> bool {
        let words: Vec<Value> = line
            .split_whitespace()
            .map(|word| Value::Text(word.to_string()))
            .collect();
        if words.is_empty() {
            return !self.harness.is_stopped();
        }
        let text = Value::Text(remainder(line).to_string());
        let message = Message::new(words).with_named("text", text);
        if !self.ctx.publish(Topic::Command, &message) {
            self.ctx.warn(format!("<{}> has no handler", line.trim()));
        }
        !self.harness.is_stopped()
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.harness.exit_code()
    }

    /// Detaches every component, in reverse start order, and flushes the store.
    pub fn close(&self) {
        self.harness.close();
        self.progress.close();
        self.log.finish(&self.ctx);
        self.log.close();
        self.traffic.close();
        self.responses.close();
        self.requests.close();
        self.database.close();
        self.diagnostics.close();
        if let Err(e) = self.store.flush() {
            error!("Failed to flush traffic store: {e}");
        }
    }
}

/// The line after its first word, with inner whitespace kept as typed.
fn remainder(line: &str) -> &str {
    let line = line.trim_start();
    line.find(char::is_whitespace)
        .map_or("", |end| line[end..].trim_start())
        .trim_end_matches(['\r', '\n'])
}
