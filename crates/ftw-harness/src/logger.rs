// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format of the harness.
//!
//! ```text
//! FTW | LEVEL | component | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! The component is the module an event comes from, so `ftw_harness::runner`
//! becomes `runner` and `ftw_compat` becomes `compat`. Dependencies are named
//! by their crate.
//!
//! ```text
//! FTW | WARN | traffic | package lose message(20/100)
//! FTW | INFO | runner | generator{destination=localhost:8080}: Generator exited code=0
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

/// Event formatter prefixing every line with `FTW` so harness diagnostics can
/// be told apart from the generator output they are interleaved with.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            &mut writer,
            "FTW | {} | {} | ",
            metadata.level(),
            component(metadata.target())
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                // populated by the fmt layer in `new_span`
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

fn component(target: &str) -> &str {
    if target.starts_with("ftw_") {
        let module = target.rsplit("::").next().unwrap_or(target);
        module.strip_prefix("ftw_").unwrap_or(module)
    } else {
        target.split("::").next().unwrap_or(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_prefix_level_and_span_context() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_writer(capture.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .event_format(Formatter)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "ftw_correlator::traffic", "package lose message(3/5)");
            let span = tracing::info_span!("generator", destination = "localhost:8080");
            let _guard = span.enter();
            tracing::info!(target: "ftw_harness::runner", code = 0, "Generator exited");
        });

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "FTW | WARN | traffic | package lose message(3/5)");
        assert_eq!(
            lines[1],
            "FTW | INFO | runner | generator{destination=\"localhost:8080\"}: Generator exited code=0"
        );
    }

    #[test]
    fn test_component_from_target() {
        assert_eq!(component("ftw_harness::store"), "store");
        assert_eq!(component("ftw_compat"), "compat");
        assert_eq!(component("sled::tree"), "sled");
        assert_eq!(component("tokio"), "tokio");
    }
}
