// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pattern-delimited extraction over a line-oriented byte stream.
//!
//! A [`SwitchCollector`] scans its input for a start pattern, accumulates
//! everything up to the next end pattern and hands the accumulated bytes to an
//! [`Extractor`]. Input may arrive in arbitrary chunks: bytes are reassembled
//! into lines (each keeping its trailing `\n`) before matching, so the
//! extraction sequence does not depend on where a chunk boundary falls.
//!
//! Patterns are matched against the unconsumed remainder of the current line,
//! which means `^` anchors at the position where scanning resumes. After an
//! extraction, scanning resumes at the start of the end match so that an end
//! marker may also open the next extraction.

use regex::bytes::{Captures, Regex};

use crate::errors::PatternError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorState {
    /// Scanning for the start pattern.
    #[default]
    Idle,
    /// Accumulating until the end pattern.
    Collecting,
    /// Input is discarded until [`SwitchCollector::resume`].
    Paused,
}

/// Owned copy of a pattern match and its capture groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRecord {
    groups: Vec<Option<Vec<u8>>>,
}

impl MatchRecord {
    fn from_captures(captures: &Captures<'_>) -> Self {
        Self {
            groups: captures
                .iter()
                .map(|group| group.map(|m| m.as_bytes().to_vec()))
                .collect(),
        }
    }

    /// The whole match.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.group(0).unwrap_or_default()
    }

    #[must_use]
    pub fn group(&self, index: usize) -> Option<&[u8]> {
        self.groups.get(index).and_then(|group| group.as_deref())
    }

    /// Capture group `index` if it participated in the match and is UTF-8.
    #[must_use]
    pub fn group_str(&self, index: usize) -> Option<&str> {
        self.group(index)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

/// Receives every completed extraction of a [`SwitchCollector`].
pub trait Extractor {
    type Output;

    fn on_extract(&mut self, buffer: &[u8], start: &MatchRecord, end: &MatchRecord)
        -> Self::Output;
}

pub struct SwitchCollector<E> {
    start: Regex,
    end: Regex,
    extractor: E,
    state: CollectorState,
    buffer: Vec<u8>,
    pending: Vec<u8>,
    start_match: Option<MatchRecord>,
}

impl<E: Extractor> SwitchCollector<E> {
    /// Compiles both patterns.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::Invalid`] for a pattern that does not compile
    /// and [`PatternError::Degenerate`] when both patterns match the empty
    /// string.
    pub fn new(start: &str, end: &str, extractor: E) -> Result<Self, PatternError> {
        let start_re = Regex::new(start)?;
        let end_re = Regex::new(end)?;
        if start_re.is_match(b"") && end_re.is_match(b"") {
            return Err(PatternError::Degenerate {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self {
            start: start_re,
            end: end_re,
            extractor,
            state: CollectorState::Idle,
            buffer: Vec::new(),
            pending: Vec::new(),
            start_match: None,
        })
    }

    /// Feeds a chunk and returns the output of every extraction it completed.
    ///
    /// A trailing partial line is held back until its newline arrives or
    /// [`finish`](Self::finish) is called.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<E::Output> {
        let mut outputs = Vec::new();
        self.pending.extend_from_slice(chunk);
        let mut consumed = 0;
        while let Some(offset) = self.pending[consumed..].iter().position(|&b| b == b'\n') {
            let line_end = consumed + offset + 1;
            let line = self.pending[consumed..line_end].to_vec();
            self.process_line(&line, &mut outputs);
            consumed = line_end;
        }
        self.pending.drain(..consumed);
        outputs
    }

    /// Processes any held-back partial line as if the stream ended there.
    pub fn finish(&mut self) -> Vec<E::Output> {
        let mut outputs = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.process_line(&line, &mut outputs);
        }
        outputs
    }

    /// Returns to [`CollectorState::Idle`], discarding in-flight data.
    pub fn reset(&mut self) {
        self.state = CollectorState::Idle;
        self.buffer.clear();
        self.pending.clear();
        self.start_match = None;
    }

    pub fn pause(&mut self) {
        self.state = CollectorState::Paused;
    }

    /// Leaves [`CollectorState::Paused`]; scanning restarts from `Idle`.
    pub fn resume(&mut self) {
        if self.state == CollectorState::Paused {
            self.reset();
        }
    }

    #[must_use]
    pub fn state(&self) -> CollectorState {
        self.state
    }

    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn extractor_mut(&mut self) -> &mut E {
        &mut self.extractor
    }

    fn process_line(&mut self, line: &[u8], outputs: &mut Vec<E::Output>) {
        let mut pos = 0;
        // where the start search of the current cycle began, if in this line
        let mut cycle_origin: Option<usize> = None;
        while pos < line.len() {
            let rest = &line[pos..];
            match self.state {
                CollectorState::Paused => break,
                CollectorState::Idle => {
                    let Some(captures) = self.start.captures(rest) else {
                        break;
                    };
                    let Some(whole) = captures.get(0) else {
                        break;
                    };
                    self.start_match = Some(MatchRecord::from_captures(&captures));
                    self.buffer.clear();
                    self.state = CollectorState::Collecting;
                    cycle_origin = Some(pos);
                    pos += whole.end();
                }
                CollectorState::Collecting => {
                    let Some(captures) = self.end.captures(rest) else {
                        self.buffer.extend_from_slice(rest);
                        break;
                    };
                    let Some(whole) = captures.get(0) else {
                        break;
                    };
                    self.buffer.extend_from_slice(&rest[..whole.start()]);
                    let end_match = MatchRecord::from_captures(&captures);
                    let resume = pos + whole.start();
                    // a zero-width start and end at the same spot would loop forever
                    let stalled = cycle_origin.is_some_and(|origin| resume <= origin);
                    let next = if stalled {
                        (pos + whole.end()).max(resume + 1)
                    } else {
                        resume
                    };
                    outputs.push(self.extract(&end_match));
                    cycle_origin = None;
                    pos = next;
                }
            }
        }
    }

    fn extract(&mut self, end_match: &MatchRecord) -> E::Output {
        let start_match = self.start_match.take().unwrap_or_default();
        let output = self
            .extractor
            .on_extract(&self.buffer, &start_match, end_match);
        self.buffer.clear();
        self.state = CollectorState::Idle;
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Recorder;

    impl Extractor for Recorder {
        type Output = (Vec<u8>, Vec<u8>, Vec<u8>);

        fn on_extract(
            &mut self,
            buffer: &[u8],
            start: &MatchRecord,
            end: &MatchRecord,
        ) -> Self::Output {
            (
                buffer.to_vec(),
                start.as_bytes().to_vec(),
                end.as_bytes().to_vec(),
            )
        }
    }

    fn collect_all(start: &str, end: &str, input: &[u8]) -> Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let mut collector = SwitchCollector::new(start, end, Recorder).unwrap();
        let mut outputs = collector.feed(input);
        outputs.extend(collector.finish());
        outputs
    }

    fn buffers(outputs: &[(Vec<u8>, Vec<u8>, Vec<u8>)]) -> Vec<&[u8]> {
        outputs.iter().map(|(buffer, _, _)| buffer.as_slice()).collect()
    }

    #[test]
    fn test_non_digit_delimiters() {
        let outputs = collect_all(r"\D+", r"\D+", b"abc123abc");
        assert_eq!(buffers(&outputs), vec![&b"123"[..]]);
    }

    #[test]
    fn test_end_marker_reopens_next_extraction() {
        let outputs = collect_all(r"\D+", r"(\D+|\z)", b"a1b1c1d1");
        assert_eq!(buffers(&outputs), vec![&b"1"[..]; 4]);
        assert_eq!(outputs[1].1, b"b".to_vec());
        assert_eq!(outputs[3].2, Vec::<u8>::new());
    }

    #[test]
    fn test_adjacent_markers_yield_empty_buffers() {
        let outputs = collect_all(r"\d", r"\d", b"abc123abc");
        assert_eq!(buffers(&outputs), vec![&b""[..], &b""[..]]);
    }

    #[test]
    fn test_no_markers_no_extraction() {
        assert!(collect_all(r"\d", r"\d", b"abcd").is_empty());
    }

    #[test]
    fn test_degenerate_patterns_rejected() {
        let error = SwitchCollector::new("a*", r"\z", Recorder).err().unwrap();
        assert!(matches!(error, PatternError::Degenerate { .. }));
        assert!(SwitchCollector::new("", "x*", Recorder).is_err());
        // one empty-matching side is allowed
        assert!(SwitchCollector::new("a+", r"\z", Recorder).is_ok());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let error = SwitchCollector::new("(", "x", Recorder).err().unwrap();
        assert!(matches!(error, PatternError::Invalid(_)));
    }

    #[test]
    fn test_collects_across_lines() {
        let mut collector = SwitchCollector::new(r"^BEGIN\n", r"^END\n", Recorder).unwrap();
        assert!(collector.feed(b"noise\nBEGIN\nfirst\nsec").is_empty());
        assert_eq!(collector.state(), CollectorState::Collecting);
        let outputs = collector.feed(b"ond\nEND\ntrailing\n");
        assert_eq!(buffers(&outputs), vec![&b"first\nsecond\n"[..]]);
        assert_eq!(collector.state(), CollectorState::Idle);
    }

    #[test]
    fn test_reset_discards_in_flight_data() {
        let mut collector = SwitchCollector::new(r"<", r">", Recorder).unwrap();
        collector.feed(b"<partial\n");
        assert_eq!(collector.buffer(), b"partial\n");
        collector.reset();
        assert_eq!(collector.state(), CollectorState::Idle);
        let outputs = collector.feed(b"dropped> <kept>\n");
        assert_eq!(buffers(&outputs), vec![&b"kept"[..]]);
    }

    #[test]
    fn test_paused_collector_ignores_input() {
        let mut collector = SwitchCollector::new(r"<", r">", Recorder).unwrap();
        collector.pause();
        assert!(collector.feed(b"<ignored>\n").is_empty());
        collector.resume();
        assert_eq!(collector.state(), CollectorState::Idle);
        assert_eq!(collector.feed(b"<seen>\n").len(), 1);
    }

    #[test]
    fn test_zero_width_markers_make_progress() {
        // both markers can match empty at a word boundary
        let outputs = collect_all(r"\b", r"\b|x+", b"ab cd");
        assert!(!outputs.is_empty());
    }

    #[test]
    fn test_capture_groups_are_kept() {
        let outputs = {
            let mut collector =
                SwitchCollector::new(r"len=(\d+):", r"(;)", Recorder).unwrap();
            collector.feed(b"len=12:payload;\n")
        };
        assert_eq!(outputs[0].1, b"len=12:".to_vec());

        struct Groups;
        impl Extractor for Groups {
            type Output = Option<String>;
            fn on_extract(&mut self, _: &[u8], start: &MatchRecord, _: &MatchRecord) -> Self::Output {
                start.group_str(1).map(ToString::to_string)
            }
        }
        let mut collector = SwitchCollector::new(r"len=(\d+):", r";", Groups).unwrap();
        assert_eq!(collector.feed(b"len=12:payload;\n"), vec![Some("12".to_string())]);
    }

    fn stream() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(
            prop_oneof![
                Just(b"<".to_vec()),
                Just(b">".to_vec()),
                Just(b"\n".to_vec()),
                Just(b"ab".to_vec()),
                Just(b"12".to_vec()),
            ],
            0..60,
        )
        .prop_map(|parts| parts.concat())
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_matter(
            input in stream(),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let whole = collect_all("<", ">|<", &input);

            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(input.len() + 1)).collect();
            points.sort_unstable();
            let mut collector = SwitchCollector::new("<", ">|<", Recorder).unwrap();
            let mut chunked = Vec::new();
            let mut last = 0;
            for point in points {
                chunked.extend(collector.feed(&input[last..point]));
                last = point;
            }
            chunked.extend(collector.feed(&input[last..]));
            chunked.extend(collector.finish());

            prop_assert_eq!(whole, chunked);
        }
    }
}
