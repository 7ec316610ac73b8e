// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # FTW correlator
//!
//! Recovers per-test transactions from the unstructured progress output of a
//! WAF load generator, and per-test fragments from the WAF's audit log.
//!
//! ## Overview
//!
//! - [`broker`]: synchronous, typed publish/subscribe dispatcher
//! - [`collector`]: start/end pattern extraction over a line stream
//! - [`delimiter`]: sentinel markers framing every test request
//! - [`traffic`]: raw packet collectors and the request/response correlator
//! - [`audit_log`]: audit-log fragment correlator
//! - [`query`]: persistence contract and the database service
//!
//! Components share a [`Context`] and talk exclusively through its broker.
//! Each component subscribes when it starts and unsubscribes on `close`.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod audit_log;
pub mod broker;
pub mod collector;
pub mod context;
pub mod delimiter;
pub mod errors;
pub mod query;
pub mod traffic;

pub use context::Context;
pub use delimiter::Delimiter;
