// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # FTW harness
//!
//! Everything around the correlator needed to run a WAF regression suite:
//! loading FTW YAML tests, writing the packet file, driving the load
//! generator, persisting captured traffic and judging it.
//!
//! A [`session::Session`] wires all of it onto one broker; commands are fed
//! to it line by line.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod assertion;
pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod logger;
pub mod packets;
pub mod progress;
pub mod runner;
pub mod session;
pub mod store;
pub mod testcase;
