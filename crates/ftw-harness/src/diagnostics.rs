// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mirrors the broker's diagnostic topics into `tracing`.

use std::rc::Rc;

use ftw_correlator::broker::{Handler, Message, Subscriptions, Topic, Value};
use ftw_correlator::errors::BrokerError;
use ftw_correlator::Context;
use tracing::{debug, error, info, warn};

pub struct DiagnosticsBridge {
    subscriptions: Subscriptions,
}

impl DiagnosticsBridge {
    /// # Errors
    ///
    /// Fails if a diagnostic topic already carries a different contract.
    pub fn start(ctx: &Context) -> Result<Self, BrokerError> {
        let subscriptions = [
            Topic::Debug,
            Topic::Info,
            Topic::Warning,
            Topic::Error,
            Topic::Fatal,
        ]
        .into_iter()
        .fold(Subscriptions::new(Rc::clone(ctx.broker())), |subs, topic| {
            subs.with(topic, forward(topic))
        });
        subscriptions.start()?;
        Ok(Self { subscriptions })
    }

    pub fn close(&self) {
        self.subscriptions.close();
    }
}

fn forward(topic: Topic) -> Handler {
    Rc::new(move |message: &Message| {
        let text = message.arg(0).and_then(Value::as_text).unwrap_or_default();
        match topic {
            Topic::Debug => debug!("{text}"),
            Topic::Info => info!("{text}"),
            Topic::Warning => warn!("{text}"),
            Topic::Fatal => error!(fatal = true, "{text}"),
            _ => error!("{text}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftw_correlator::broker::Broker;
    use ftw_correlator::Delimiter;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_broker_warnings_become_log_lines() {
        let ctx = Context::new(
            Rc::new(Broker::new()),
            Rc::new(Delimiter::with_secret("magic").unwrap()),
        );
        let bridge = DiagnosticsBridge::start(&ctx).unwrap();
        assert!(ctx.publish(Topic::Warning, &Message::text("log key mismatch a != b")));
        ctx.error("lost request 42");
        assert!(logs_contain("log key mismatch a != b"));
        assert!(logs_contain("lost request 42"));

        bridge.close();
        assert_eq!(ctx.broker().subscriber_count(Topic::Warning), 0);
    }
}
