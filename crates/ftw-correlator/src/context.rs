// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::rc::Rc;

use tracing::{error, info, warn};

use crate::broker::{Broker, Message, Topic};
use crate::delimiter::Delimiter;
use crate::query::{run_query, Query, QueryResult};

/// Everything a component needs to take part in a correlation session: the
/// broker it talks through and the delimiter shared by every correlator.
#[derive(Clone)]
pub struct Context {
    broker: Rc<Broker>,
    delimiter: Rc<Delimiter>,
}

impl Context {
    #[must_use]
    pub fn new(broker: Rc<Broker>, delimiter: Rc<Delimiter>) -> Self {
        Self { broker, delimiter }
    }

    #[must_use]
    pub fn broker(&self) -> &Rc<Broker> {
        &self.broker
    }

    #[must_use]
    pub fn delimiter(&self) -> &Delimiter {
        &self.delimiter
    }

    /// Publishes `message`, logging contract violations instead of failing.
    ///
    /// Returns whether at least one subscriber received the message.
    pub fn publish(&self, topic: Topic, message: &Message) -> bool {
        match self.broker.publish(topic, message) {
            Ok(delivered) => delivered,
            Err(e) => {
                error!("Dropped message: {e}");
                false
            }
        }
    }

    pub fn info(&self, text: impl Into<String>) {
        let text = text.into();
        if !self.publish(Topic::Info, &Message::text(text.clone())) {
            info!("{text}");
        }
    }

    /// Reports a recoverable condition. Falls back to the log when nobody
    /// listens on [`Topic::Warning`].
    pub fn warn(&self, text: impl Into<String>) {
        let text = text.into();
        if !self.publish(Topic::Warning, &Message::text(text.clone())) {
            warn!("{text}");
        }
    }

    pub fn error(&self, text: impl Into<String>) {
        let text = text.into();
        if !self.publish(Topic::Error, &Message::text(text.clone())) {
            error!("{text}");
        }
    }

    pub fn fatal(&self, text: impl Into<String>) {
        let text = text.into();
        if !self.publish(Topic::Fatal, &Message::text(text.clone())) {
            error!("fatal: {text}");
        }
    }

    /// Runs `query` through whichever database listens on [`Topic::Query`].
    ///
    /// Returns `None` when no database is bound or the query failed; failures
    /// are reported on [`Topic::Error`] by the database service.
    pub fn query(&self, query: Query) -> Option<QueryResult> {
        run_query(self, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tracing_test::traced_test;

    fn context() -> Context {
        Context::new(
            Rc::new(Broker::new()),
            Rc::new(Delimiter::with_secret("magic").unwrap()),
        )
    }

    #[test]
    #[traced_test]
    fn test_warning_falls_back_to_log() {
        let ctx = context();
        ctx.warn("package lose message(3/5)");
        assert!(logs_contain("package lose message(3/5)"));
    }

    #[test]
    fn test_warning_reaches_subscriber() {
        let ctx = context();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        ctx.broker()
            .subscribe(
                Topic::Warning,
                Rc::new(move |m: &Message| {
                    sink.borrow_mut().push(
                        m.arg(0)
                            .and_then(|v| v.as_text())
                            .unwrap_or_default()
                            .to_string(),
                    );
                }),
                None,
            )
            .unwrap();
        ctx.warn("careful");
        assert_eq!(*seen.borrow(), vec!["careful".to_string()]);
    }

    #[test]
    #[traced_test]
    fn test_contract_violation_is_logged() {
        let ctx = context();
        ctx.broker()
            .subscribe(
                Topic::RawRequest,
                Rc::new(|_: &Message| {}),
                Some(Topic::RawRequest.contract()),
            )
            .unwrap();
        assert!(!ctx.publish(Topic::RawRequest, &Message::text("not bytes")));
        assert!(logs_contain("Dropped message"));
    }

    #[test]
    fn test_query_without_database() {
        assert!(context().query(Query::CountRequests).is_none());
    }
}
