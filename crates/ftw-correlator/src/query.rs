// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistence contract.
//!
//! The correlation engine never touches storage directly. It publishes typed
//! [`Query`] values on [`Topic::Query`]; a [`DatabaseService`] bound to some
//! [`Database`] runs them and hands the [`QueryResult`] to the optional
//! `callback` named argument.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::{Handler, Message, Subscriptions, Topic, Value};
use crate::context::Context;
use crate::errors::BrokerError;

pub type QueryCallback = Rc<dyn Fn(&QueryResult)>;

/// A test case request as produced by the loader, before any run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    pub traffic_id: String,
    pub test_title: String,
    pub meta: String,
    pub file: String,
    pub input: String,
    pub output: String,
    pub request: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    InsertRequest(NewRequest),
    /// `traffic_id, request` of every stored test, optionally restricted to
    /// titles matching a regular expression.
    SelectRequests { title: Option<String> },
    /// Forget raw request, response, log and verdict of every test.
    CleanRawData,
    UpdateRawTraffic {
        traffic_id: String,
        raw_request: Vec<u8>,
        raw_response: Vec<u8>,
        duration: Option<Duration>,
    },
    UpdateLog {
        traffic_id: String,
        raw_log: String,
    },
    UpdateTestingResult {
        traffic_id: String,
        passed: bool,
    },
    /// `traffic_id, test_title, output, raw_request, raw_response, raw_log`
    /// of every stored test.
    SelectResults,
    SelectTestTitle { traffic_id: String },
    CountRequests,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Field {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Field::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Field::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Field::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }
}

impl From<Option<Vec<u8>>> for Field {
    fn from(value: Option<Vec<u8>>) -> Self {
        value.map_or(Field::Null, Field::Bytes)
    }
}

impl From<Option<String>> for Field {
    fn from(value: Option<String>) -> Self {
        value.map_or(Field::Null, Field::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub rows: Vec<Vec<Field>>,
    pub row_count: usize,
    pub column_titles: Vec<String>,
}

impl QueryResult {
    /// Result of a statement that returns no rows.
    #[must_use]
    pub fn affected(row_count: usize) -> Self {
        Self {
            rows: Vec::new(),
            row_count,
            column_titles: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rows(column_titles: &[&str], rows: Vec<Vec<Field>>) -> Self {
        Self {
            row_count: rows.len(),
            rows,
            column_titles: column_titles.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn column(&self, title: &str) -> Option<usize> {
        self.column_titles.iter().position(|t| t == title)
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.rows.iter().map(move |fields| Record {
            titles: &self.column_titles,
            fields,
        })
    }
}

/// One row of a [`QueryResult`] addressed by column title.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    titles: &'a [String],
    fields: &'a [Field],
}

impl<'a> Record<'a> {
    #[must_use]
    pub fn get(&self, title: &str) -> Option<&'a Field> {
        self.titles
            .iter()
            .position(|t| t == title)
            .and_then(|index| self.fields.get(index))
    }

    #[must_use]
    pub fn text(&self, title: &str) -> Option<&'a str> {
        self.get(title).and_then(Field::as_text)
    }

    #[must_use]
    pub fn bytes(&self, title: &str) -> Option<&'a [u8]> {
        self.get(title).and_then(Field::as_bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("invalid query: {0}")]
    Invalid(String),
}

/// Capability implemented by storage backends.
pub trait Database {
    /// Runs `query` to completion.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] when the backend fails or the query is invalid.
    fn query(&self, query: &Query) -> Result<QueryResult, QueryError>;
}

/// Runs queries published on [`Topic::Query`] against a [`Database`].
pub struct DatabaseService {
    subscriptions: Subscriptions,
}

impl DatabaseService {
    /// Binds `database` to the context's broker.
    ///
    /// # Errors
    ///
    /// Fails if another component declared an incompatible contract for
    /// [`Topic::Query`].
    pub fn start(ctx: &Context, database: Rc<dyn Database>) -> Result<Self, BrokerError> {
        let handler_ctx = ctx.clone();
        let handler: Handler = Rc::new(move |message: &Message| {
            let Some(Value::Query(query)) = message.arg(0) else {
                return;
            };
            match database.query(query) {
                Ok(result) => {
                    debug!("Query {} affected {} rows", query_name(query), result.row_count);
                    if let Some(Value::Callback(callback)) = message.named("callback") {
                        callback(&result);
                    }
                }
                Err(e) => handler_ctx.error(format!("query {} failed: {e}", query_name(query))),
            }
        });
        let subscriptions = Subscriptions::new(Rc::clone(ctx.broker())).with(Topic::Query, handler);
        subscriptions.start()?;
        Ok(Self { subscriptions })
    }

    pub fn close(&self) {
        self.subscriptions.close();
    }
}

fn query_name(query: &Query) -> &'static str {
    match query {
        Query::InsertRequest(_) => "insert_request",
        Query::SelectRequests { .. } => "select_requests",
        Query::CleanRawData => "clean_raw_data",
        Query::UpdateRawTraffic { .. } => "update_raw_traffic",
        Query::UpdateLog { .. } => "update_log",
        Query::UpdateTestingResult { .. } => "update_testing_result",
        Query::SelectResults => "select_results",
        Query::SelectTestTitle { .. } => "select_test_title",
        Query::CountRequests => "count_requests",
    }
}

/// Publishes `query` and returns the result if a database answered.
pub(crate) fn run_query(ctx: &Context, query: Query) -> Option<QueryResult> {
    let slot: Rc<RefCell<Option<QueryResult>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    let callback: QueryCallback = Rc::new(move |result: &QueryResult| {
        *sink.borrow_mut() = Some(result.clone());
    });
    let message =
        Message::new(vec![Value::Query(query)]).with_named("callback", Value::Callback(callback));
    ctx.publish(Topic::Query, &message);
    slot.take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delimiter::Delimiter;
    use crate::broker::Broker;

    struct Fixed;

    impl Database for Fixed {
        fn query(&self, query: &Query) -> Result<QueryResult, QueryError> {
            match query {
                Query::CountRequests => Ok(QueryResult::with_rows(
                    &["count"],
                    vec![vec![Field::Int(3)]],
                )),
                Query::SelectTestTitle { .. } => Err(QueryError::Invalid("boom".to_string())),
                _ => Ok(QueryResult::affected(1)),
            }
        }
    }

    fn context() -> Context {
        Context::new(
            Rc::new(Broker::new()),
            Rc::new(Delimiter::with_secret("magic").unwrap()),
        )
    }

    #[test]
    fn test_query_callback_receives_result() {
        let ctx = context();
        let service = DatabaseService::start(&ctx, Rc::new(Fixed)).unwrap();

        let result = run_query(&ctx, Query::CountRequests).unwrap();
        assert_eq!(result.row_count, 1);
        let record = result.records().next().unwrap();
        assert_eq!(record.get("count").and_then(Field::as_int), Some(3));

        service.close();
        assert!(run_query(&ctx, Query::CountRequests).is_none());
    }

    #[test]
    fn test_query_failure_is_reported() {
        let ctx = context();
        let _service = DatabaseService::start(&ctx, Rc::new(Fixed)).unwrap();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        ctx.broker()
            .subscribe(
                Topic::Error,
                Rc::new(move |m: &Message| {
                    sink.borrow_mut()
                        .push(m.arg(0).and_then(Value::as_text).unwrap_or_default().to_string());
                }),
                None,
            )
            .unwrap();

        let result = run_query(
            &ctx,
            Query::SelectTestTitle {
                traffic_id: "k".to_string(),
            },
        );
        assert!(result.is_none());
        assert_eq!(
            *errors.borrow(),
            vec!["query select_test_title failed: invalid query: boom".to_string()]
        );
    }

    #[test]
    fn test_record_lookup_by_title() {
        let result = QueryResult::with_rows(
            &["traffic_id", "request"],
            vec![vec![Field::Text("a".into()), Field::Bytes(b"GET".to_vec())]],
        );
        assert_eq!(result.column("request"), Some(1));
        let record = result.records().next().unwrap();
        assert_eq!(record.text("traffic_id"), Some("a"));
        assert_eq!(record.bytes("request"), Some(&b"GET"[..]));
        assert!(record.get("missing").is_none());
    }
}
