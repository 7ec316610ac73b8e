// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synchronous publish/subscribe dispatcher.
//!
//! Every component of the harness talks to every other component through a
//! [`Broker`]. Dispatch is synchronous and single-threaded: [`Broker::publish`]
//! runs every subscriber of the topic, in subscription order, before it
//! returns.
//!
//! ```text
//!   GeneratorOutput ──> RawPacketCollector ──> RawRequest ──┐
//!                                         └──> RawResponse ─┴─> RealTrafficCollector ──> RawTraffic
//!   RawLog ─────────> LogCollector ──────────────────────────────────────────────────> AuditLog
//! ```
//!
//! Handlers may publish, subscribe and unsubscribe while they are being
//! dispatched. `publish` iterates over a snapshot of the subscriber list, so a
//! change made during dispatch takes effect from the next publish on.
//!
//! Each topic can carry a [`TypeContract`]. Contracts are checked for
//! consistency at subscribe time and for conformance at publish time.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use derive_more::Display;
use tracing::debug;

use crate::errors::BrokerError;
use crate::query::{Query, QueryCallback};

/// The fixed set of channels known to the harness.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A user command: the command name followed by its arguments, with the
    /// untouched remainder of the line in the `text` named argument.
    #[display("COMMAND")]
    Command,
    /// Start of a new run; every stateful component drops in-flight data.
    #[display("RESET")]
    Reset,
    /// A persistence query with an optional `callback` named argument.
    #[display("QUERY")]
    Query,
    /// One line of the generator's stdout, newline included.
    #[display("GENERATOR_OUTPUT")]
    GeneratorOutput,
    #[display("RAW_REQUEST")]
    RawRequest,
    #[display("RAW_RESPONSE")]
    RawResponse,
    /// A correlated (key, request, response, elapsed) record.
    #[display("RAW_TRAFFIC")]
    RawTraffic,
    /// One line of the WAF audit log.
    #[display("RAW_LOG")]
    RawLog,
    /// A correlated (key, log) fragment.
    #[display("AUDIT_LOG")]
    AuditLog,
    #[display("CHECK_RESULT")]
    CheckResult,
    #[display("SHOW_UI")]
    ShowUi,
    #[display("DEBUG")]
    Debug,
    #[display("INFO")]
    Info,
    #[display("WARNING")]
    Warning,
    #[display("ERROR")]
    Error,
    /// Unrecoverable condition; the owner of the process must terminate.
    #[display("FATAL")]
    Fatal,
}

impl Topic {
    /// Canonical contract for the topic.
    ///
    /// Components subscribe with this contract so that every publisher is
    /// checked against the same argument layout.
    #[must_use]
    pub fn contract(self) -> TypeContract {
        match self {
            Topic::Command => TypeContract::new()
                .arg("command", ArgKind::Text)
                .named("text", ArgKind::Text),
            Topic::Reset => TypeContract::new(),
            Topic::Query => TypeContract::new()
                .arg("query", ArgKind::Query)
                .named("callback", ArgKind::Callback),
            Topic::GeneratorOutput | Topic::RawLog => TypeContract::new().arg("line", ArgKind::Bytes),
            Topic::RawRequest => TypeContract::new().arg("request", ArgKind::Bytes),
            Topic::RawResponse => TypeContract::new().arg("response", ArgKind::Bytes),
            Topic::RawTraffic => TypeContract::new()
                .arg("key", ArgKind::Text)
                .arg("request", ArgKind::Bytes)
                .arg("response", ArgKind::Bytes)
                .arg("elapsed", ArgKind::Optional(Box::new(ArgKind::Float))),
            Topic::AuditLog => TypeContract::new()
                .arg("key", ArgKind::Text)
                .arg("log", ArgKind::Text),
            Topic::CheckResult => TypeContract::new().arg("verdict", ArgKind::Json),
            Topic::ShowUi => TypeContract::new().arg("screen", ArgKind::Text),
            Topic::Debug | Topic::Info | Topic::Warning | Topic::Error | Topic::Fatal => {
                TypeContract::new().arg("message", ArgKind::Text)
            }
        }
    }
}

/// Tag describing the runtime kind of a [`Value`].
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ArgKind {
    #[display("any")]
    Any,
    #[display("null")]
    Null,
    #[display("bool")]
    Bool,
    #[display("int")]
    Int,
    #[display("float")]
    Float,
    #[display("text")]
    Text,
    #[display("bytes")]
    Bytes,
    #[display("json")]
    Json,
    #[display("query")]
    Query,
    #[display("callback")]
    Callback,
    #[display("optional {_0}")]
    Optional(Box<ArgKind>),
}

impl ArgKind {
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgKind::Any => true,
            ArgKind::Optional(inner) => matches!(value, Value::Null) || inner.accepts(value),
            kind => *kind == value.kind(),
        }
    }
}

/// A dynamically typed broker argument.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Query(Query),
    Callback(QueryCallback),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> ArgKind {
        match self {
            Value::Null => ArgKind::Null,
            Value::Bool(_) => ArgKind::Bool,
            Value::Int(_) => ArgKind::Int,
            Value::Float(_) => ArgKind::Float,
            Value::Text(_) => ArgKind::Text,
            Value::Bytes(_) => ArgKind::Bytes,
            Value::Json(_) => ArgKind::Json,
            Value::Query(_) => ArgKind::Query,
            Value::Callback(_) => ArgKind::Callback,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(value) => write!(f, "Bool({value})"),
            Value::Int(value) => write!(f, "Int({value})"),
            Value::Float(value) => write!(f, "Float({value})"),
            Value::Text(value) => write!(f, "Text({value:?})"),
            Value::Bytes(value) => write!(f, "Bytes({:?})", String::from_utf8_lossy(value)),
            Value::Json(value) => write!(f, "Json({value})"),
            Value::Query(query) => write!(f, "Query({query:?})"),
            Value::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<Query> for Value {
    fn from(value: Query) -> Self {
        Value::Query(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

/// Positional and named arguments of one publish.
#[derive(Debug, Clone, Default)]
pub struct Message {
    args: Vec<Value>,
    named: Vec<(String, Value)>,
}

impl Message {
    #[must_use]
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            named: Vec::new(),
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A message carrying a single text argument.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![Value::Text(text.into())])
    }

    #[must_use]
    pub fn with_named(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named.push((name.into(), value));
        self
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    #[must_use]
    pub fn named(&self, name: &str) -> Option<&Value> {
        self.named
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// Statically declared argument layout of a topic.
///
/// Positional arguments are checked by index; arguments past the end of the
/// contract are not checked. Named arguments are checked by name; names the
/// contract does not mention are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeContract {
    positional: Vec<(&'static str, ArgKind)>,
    named: Vec<(&'static str, ArgKind)>,
}

impl TypeContract {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arg(mut self, name: &'static str, kind: ArgKind) -> Self {
        self.positional.push((name, kind));
        self
    }

    #[must_use]
    pub fn named(mut self, name: &'static str, kind: ArgKind) -> Self {
        self.named.push((name, kind));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Checks a message against the contract.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ContractViolation`] naming the first argument
    /// whose kind is not accepted.
    pub fn check(&self, topic: Topic, message: &Message) -> Result<(), BrokerError> {
        for ((name, expected), value) in self.positional.iter().zip(message.args()) {
            if !expected.accepts(value) {
                return Err(BrokerError::ContractViolation {
                    topic,
                    argument: (*name).to_string(),
                    expected: expected.clone(),
                    found: value.kind(),
                });
            }
        }
        for (name, value) in &message.named {
            let Some((_, expected)) = self.named.iter().find(|(key, _)| key == name) else {
                continue;
            };
            if !expected.accepts(value) {
                return Err(BrokerError::ContractViolation {
                    topic,
                    argument: name.clone(),
                    expected: expected.clone(),
                    found: value.kind(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for TypeContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<String> = self
            .positional
            .iter()
            .chain(self.named.iter())
            .map(|(name, kind)| format!("{name}: {kind}"))
            .collect();
        write!(f, "<{}>", fields.join(", "))
    }
}

pub type Handler = Rc<dyn Fn(&Message)>;

#[derive(Default)]
struct TopicEntry {
    contract: TypeContract,
    handlers: Vec<Handler>,
}

/// Synchronous, single-threaded dispatcher.
#[derive(Default)]
pub struct Broker {
    topics: RefCell<HashMap<Topic, TopicEntry>>,
}

impl Broker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to `topic`.
    ///
    /// A `None` or empty contract adopts whatever contract the topic already
    /// carries. A non-empty contract must equal the topic's current contract
    /// while the topic has subscribers. Subscribing the same handler twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::IncompatibleContract`] when the declared contract
    /// conflicts with the one already in force.
    pub fn subscribe(
        &self,
        topic: Topic,
        handler: Handler,
        contract: Option<TypeContract>,
    ) -> Result<(), BrokerError> {
        let mut topics = self.topics.borrow_mut();
        let entry = topics.entry(topic).or_default();
        if let Some(declared) = contract.filter(|c| !c.is_empty()) {
            if !entry.handlers.is_empty() && entry.contract != declared {
                return Err(BrokerError::IncompatibleContract {
                    topic,
                    declared,
                    existing: entry.contract.clone(),
                });
            }
            entry.contract = declared;
        }
        if !entry.handlers.iter().any(|h| Rc::ptr_eq(h, &handler)) {
            entry.handlers.push(handler);
        }
        Ok(())
    }

    /// Removes `handler` from `topic`. Unknown handlers are ignored.
    ///
    /// A topic without subscribers forgets its contract.
    pub fn unsubscribe(&self, topic: Topic, handler: &Handler) {
        let mut topics = self.topics.borrow_mut();
        let Some(entry) = topics.get_mut(&topic) else {
            return;
        };
        entry.handlers.retain(|h| !Rc::ptr_eq(h, handler));
        if entry.handlers.is_empty() {
            topics.remove(&topic);
        }
    }

    /// Dispatches `message` to every subscriber of `topic`.
    ///
    /// Returns `Ok(false)` when nobody is subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ContractViolation`] without invoking any handler
    /// if the message does not satisfy the topic's contract.
    pub fn publish(&self, topic: Topic, message: &Message) -> Result<bool, BrokerError> {
        let handlers = {
            let topics = self.topics.borrow();
            let Some(entry) = topics.get(&topic) else {
                return Ok(false);
            };
            entry.contract.check(topic, message)?;
            entry.handlers.clone()
        };
        if handlers.is_empty() {
            return Ok(false);
        }
        for handler in &handlers {
            handler(message);
        }
        Ok(true)
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .borrow()
            .get(&topic)
            .map_or(0, |entry| entry.handlers.len())
    }
}

/// A group of subscriptions owned by one component.
///
/// `start` subscribes every entry with its topic's canonical contract and
/// `close` removes them again. Components call `close` from their own
/// `close`; nothing is unsubscribed implicitly.
pub struct Subscriptions {
    broker: Rc<Broker>,
    entries: Vec<(Topic, Handler)>,
    active: Cell<bool>,
}

impl Subscriptions {
    #[must_use]
    pub fn new(broker: Rc<Broker>) -> Self {
        Self {
            broker,
            entries: Vec::new(),
            active: Cell::new(false),
        }
    }

    #[must_use]
    pub fn with(mut self, topic: Topic, handler: Handler) -> Self {
        self.entries.push((topic, handler));
        self
    }

    /// Subscribes every entry. On failure the entries subscribed so far are
    /// removed again before the error is returned.
    ///
    /// # Errors
    ///
    /// Propagates the first [`BrokerError`] raised by the broker.
    pub fn start(&self) -> Result<(), BrokerError> {
        for (index, (topic, handler)) in self.entries.iter().enumerate() {
            if let Err(e) = self
                .broker
                .subscribe(*topic, Rc::clone(handler), Some(topic.contract()))
            {
                for (topic, handler) in &self.entries[..index] {
                    self.broker.unsubscribe(*topic, handler);
                }
                return Err(e);
            }
        }
        self.active.set(true);
        Ok(())
    }

    pub fn close(&self) {
        if !self.active.replace(false) {
            return;
        }
        for (topic, handler) in &self.entries {
            self.broker.unsubscribe(*topic, handler);
        }
        debug!("Closed {} subscriptions", self.entries.len());
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}
