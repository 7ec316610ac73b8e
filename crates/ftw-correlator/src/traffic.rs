// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw packet extraction and request/response correlation.
//!
//! Two [`RawPacketCollector`]s cut the generator's progress log into
//! length-framed raw requests and responses. The [`RealTrafficCollector`]
//! pairs them into one [`TrafficRecord`] per test, using the sentinel
//! requests around each test to find its boundaries.
//!
//! Responses carry no marker. They are attributed to the open transaction in
//! arrival order, which assumes the target answers requests in the order they
//! were sent.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use derive_more::Display;
use tracing::debug;

use crate::broker::{Handler, Message, Subscriptions, Topic, Value};
use crate::collector::{Extractor, MatchRecord, SwitchCollector};
use crate::context::Context;
use crate::errors::{BrokerError, SetupError};
use crate::query::Query;

pub const REQUEST_PATTERN: &str = r"^writing request\((\d+) bytes\)=>\[";
pub const RESPONSE_PATTERN: &str = r"^LOG: http packet received\((\d+) bytes\):\n";
pub const FINISH_PATTERN: &str = r"^Finished \d+ requests";

/// Progress annotations of the generator, one regex each.
///
/// `request` and `response` must capture the declared byte length in group 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorPatterns {
    pub request: String,
    pub response: String,
    pub finish: String,
}

impl Default for GeneratorPatterns {
    fn default() -> Self {
        Self {
            request: REQUEST_PATTERN.to_string(),
            response: RESPONSE_PATTERN.to_string(),
            finish: FINISH_PATTERN.to_string(),
        }
    }
}

impl GeneratorPatterns {
    fn start(&self, kind: PacketKind) -> &str {
        match kind {
            PacketKind::Request => &self.request,
            PacketKind::Response => &self.response,
        }
    }

    fn end(&self) -> String {
        format!(
            "(?:{})|(?:{})|(?:{})",
            self.request, self.response, self.finish
        )
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    #[display("request")]
    Request,
    #[display("response")]
    Response,
}

impl PacketKind {
    #[must_use]
    pub fn topic(self) -> Topic {
        match self {
            PacketKind::Request => Topic::RawRequest,
            PacketKind::Response => Topic::RawResponse,
        }
    }
}

/// One packet cut out of the generator log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPacket {
    pub packet: Vec<u8>,
    /// Length announced by the generator.
    pub declared: usize,
}

impl FramedPacket {
    /// Whether fewer bytes than announced were available.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.packet.len() < self.declared
    }
}

/// Cuts the announced number of bytes out of the collected buffer.
#[derive(Debug, Default)]
pub struct PacketFramer;

impl Extractor for PacketFramer {
    type Output = FramedPacket;

    fn on_extract(&mut self, buffer: &[u8], start: &MatchRecord, _end: &MatchRecord) -> FramedPacket {
        // an unparsable length can only be an overflow; keep what is there
        let declared = start
            .group_str(1)
            .and_then(|length| length.parse::<usize>().ok())
            .unwrap_or(usize::MAX);
        let available = declared.min(buffer.len());
        FramedPacket {
            packet: buffer[..available].to_vec(),
            declared,
        }
    }
}

/// Builds the collector for one kind of packet.
///
/// # Errors
///
/// Fails if the patterns do not compile or are degenerate.
pub fn packet_collector(
    patterns: &GeneratorPatterns,
    kind: PacketKind,
) -> Result<SwitchCollector<PacketFramer>, SetupError> {
    Ok(SwitchCollector::new(
        patterns.start(kind),
        &patterns.end(),
        PacketFramer,
    )?)
}

/// Publishes every raw request (or response) found on
/// [`Topic::GeneratorOutput`].
pub struct RawPacketCollector {
    kind: PacketKind,
    collector: Rc<RefCell<SwitchCollector<PacketFramer>>>,
    subscriptions: Subscriptions,
}

impl RawPacketCollector {
    /// # Errors
    ///
    /// Fails on invalid patterns or a conflicting topic contract.
    pub fn requests(ctx: &Context, patterns: &GeneratorPatterns) -> Result<Self, SetupError> {
        Self::start(ctx, patterns, PacketKind::Request)
    }

    /// # Errors
    ///
    /// Fails on invalid patterns or a conflicting topic contract.
    pub fn responses(ctx: &Context, patterns: &GeneratorPatterns) -> Result<Self, SetupError> {
        Self::start(ctx, patterns, PacketKind::Response)
    }

    fn start(ctx: &Context, patterns: &GeneratorPatterns, kind: PacketKind) -> Result<Self, SetupError> {
        let collector = Rc::new(RefCell::new(packet_collector(patterns, kind)?));

        let feed_ctx = ctx.clone();
        let feed_collector = Rc::clone(&collector);
        let on_line: Handler = Rc::new(move |message: &Message| {
            let Some(line) = message.arg(0).and_then(Value::as_bytes) else {
                return;
            };
            let packets = feed_collector.borrow_mut().feed(line);
            for framed in packets {
                publish_packet(&feed_ctx, kind, framed);
            }
        });

        let reset_collector = Rc::clone(&collector);
        let on_reset: Handler = Rc::new(move |_: &Message| {
            reset_collector.borrow_mut().reset();
        });

        let subscriptions = Subscriptions::new(Rc::clone(ctx.broker()))
            .with(Topic::GeneratorOutput, on_line)
            .with(Topic::Reset, on_reset);
        subscriptions.start()?;
        Ok(Self {
            kind,
            collector,
            subscriptions,
        })
    }

    #[must_use]
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Flushes a trailing unterminated line, e.g. at the end of a run.
    pub fn finish(&self, ctx: &Context) {
        let packets = self.collector.borrow_mut().finish();
        for framed in packets {
            publish_packet(ctx, self.kind, framed);
        }
    }

    pub fn close(&self) {
        self.subscriptions.close();
    }
}

fn publish_packet(ctx: &Context, kind: PacketKind, framed: FramedPacket) {
    if framed.is_truncated() {
        ctx.warn(format!(
            "package lose message({}/{})",
            framed.packet.len(),
            framed.declared
        ));
    }
    ctx.publish(kind.topic(), &Message::new(vec![Value::Bytes(framed.packet)]));
}

/// One correlated test execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    pub key: String,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    /// Time from the first real request to the first real response.
    pub elapsed: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponsePhase {
    /// The next response answers the opening sentinel.
    #[default]
    AwaitingResponse,
    CollectingResponse,
}

/// What a raw request did to the correlator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    Opened(String),
    /// A real request was buffered.
    Buffered,
    /// A request arrived while no transaction was open.
    Stray,
    Closed(TrafficRecord),
    /// The transaction `lost` never saw its closing sentinel; `next` opened.
    LostRequest { lost: String, next: String },
}

/// The correlation state machine, free of any broker wiring.
#[derive(Debug, Default)]
pub struct TrafficCorrelator {
    current_key: Option<String>,
    request_buffer: Vec<u8>,
    response_buffer: Vec<u8>,
    request_started: Option<Instant>,
    response_started: Option<Instant>,
    phase: ResponsePhase,
}

impl TrafficCorrelator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current_key(&self) -> Option<&str> {
        self.current_key.as_deref()
    }

    #[must_use]
    pub fn phase(&self) -> ResponsePhase {
        self.phase
    }

    /// Handles one raw request. `sentinel_key` is the key of the sentinel
    /// marker it carries, if any.
    pub fn on_request(&mut self, packet: &[u8], sentinel_key: Option<String>) -> Correlation {
        match (sentinel_key, self.current_key.take()) {
            (Some(key), None) => {
                self.current_key = Some(key.clone());
                Correlation::Opened(key)
            }
            (Some(key), Some(current)) if key == current => {
                let record = TrafficRecord {
                    key: current,
                    request: std::mem::take(&mut self.request_buffer),
                    response: std::mem::take(&mut self.response_buffer),
                    elapsed: self.elapsed(),
                };
                self.reset();
                Correlation::Closed(record)
            }
            (Some(key), Some(current)) => {
                self.reset();
                self.current_key = Some(key.clone());
                Correlation::LostRequest {
                    lost: current,
                    next: key,
                }
            }
            (None, None) => Correlation::Stray,
            (None, Some(current)) => {
                self.current_key = Some(current);
                if self.request_started.is_none() {
                    self.request_started = Some(Instant::now());
                }
                self.request_buffer.extend_from_slice(packet);
                Correlation::Buffered
            }
        }
    }

    /// Handles one raw response. Returns whether it was kept.
    pub fn on_response(&mut self, packet: &[u8]) -> bool {
        if self.current_key.is_none() {
            self.phase = ResponsePhase::AwaitingResponse;
            return false;
        }
        match self.phase {
            ResponsePhase::AwaitingResponse => {
                self.phase = ResponsePhase::CollectingResponse;
                false
            }
            ResponsePhase::CollectingResponse => {
                if self.request_buffer.is_empty() {
                    return false;
                }
                if self.response_started.is_none() {
                    self.response_started = Some(Instant::now());
                }
                self.response_buffer.extend_from_slice(packet);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn elapsed(&self) -> Option<Duration> {
        let request = self.request_started?;
        let response = self.response_started?;
        response.checked_duration_since(request)
    }
}

/// Publishes a [`TrafficRecord`] for every test framed by sentinels on the
/// raw request and raw response topics.
pub struct RealTrafficCollector {
    correlator: Rc<RefCell<TrafficCorrelator>>,
    subscriptions: Subscriptions,
}

impl RealTrafficCollector {
    /// # Errors
    ///
    /// Fails if another component declared a conflicting topic contract.
    pub fn start(ctx: &Context) -> Result<Self, BrokerError> {
        let correlator = Rc::new(RefCell::new(TrafficCorrelator::new()));

        let request_ctx = ctx.clone();
        let request_state = Rc::clone(&correlator);
        let on_request: Handler = Rc::new(move |message: &Message| {
            let Some(packet) = message.arg(0).and_then(Value::as_bytes) else {
                return;
            };
            let key = request_ctx.delimiter().try_extract_key(packet);
            let outcome = request_state.borrow_mut().on_request(packet, key);
            match outcome {
                Correlation::Opened(key) => debug!("Opened transaction {key}"),
                Correlation::Buffered => {}
                Correlation::Stray => debug!("Dropped request outside of any transaction"),
                Correlation::Closed(record) => publish_record(&request_ctx, record),
                Correlation::LostRequest { lost, next } => {
                    request_ctx.error(format!("lost request {lost}"));
                    debug!("Opened transaction {next}");
                }
            }
        });

        let response_state = Rc::clone(&correlator);
        let on_response: Handler = Rc::new(move |message: &Message| {
            if let Some(packet) = message.arg(0).and_then(Value::as_bytes) {
                response_state.borrow_mut().on_response(packet);
            }
        });

        let reset_state = Rc::clone(&correlator);
        let on_reset: Handler = Rc::new(move |_: &Message| reset_state.borrow_mut().reset());

        let subscriptions = Subscriptions::new(Rc::clone(ctx.broker()))
            .with(Topic::RawRequest, on_request)
            .with(Topic::RawResponse, on_response)
            .with(Topic::Reset, on_reset);
        subscriptions.start()?;
        Ok(Self {
            correlator,
            subscriptions,
        })
    }

    #[must_use]
    pub fn current_key(&self) -> Option<String> {
        self.correlator.borrow().current_key().map(ToString::to_string)
    }

    pub fn close(&self) {
        self.subscriptions.close();
    }
}

fn publish_record(ctx: &Context, record: TrafficRecord) {
    debug!(
        "Closed transaction {} ({} request bytes, {} response bytes)",
        record.key,
        record.request.len(),
        record.response.len()
    );
    ctx.publish(
        Topic::Query,
        &Message::new(vec![Value::Query(Query::UpdateRawTraffic {
            traffic_id: record.key.clone(),
            raw_request: record.request.clone(),
            raw_response: record.response.clone(),
            duration: record.elapsed,
        })]),
    );
    let elapsed = record
        .elapsed
        .map_or(Value::Null, |elapsed| Value::Float(elapsed.as_secs_f64()));
    ctx.publish(
        Topic::RawTraffic,
        &Message::new(vec![
            Value::Text(record.key),
            Value::Bytes(record.request),
            Value::Bytes(record.response),
            elapsed,
        ]),
    );
}
