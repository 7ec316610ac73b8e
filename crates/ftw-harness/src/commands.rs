// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The harness commands, dispatched from [`Topic::Command`].
//!
//! | command | effect |
//! |---------|--------|
//! | `load <path>` | store one request per FTW stage found below `path` |
//! | `gen [title-regex]` | write the packet file, every request framed by sentinels |
//! | `start <destination>` | replay the packet file against `destination` |
//! | `import <path-or-line>` | feed an audit log to the log collector |
//! | `report` | evaluate every captured test and publish its verdict |
//! | `rule` | show the WAF rule that echoes sentinels into the audit log |
//! | `help` | show the tutorial |
//! | `exit` | stop the session |

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use ftw_correlator::broker::{Handler, Message, Subscriptions, Topic, Value};
use ftw_correlator::errors::BrokerError;
use ftw_correlator::query::{NewRequest, Query};
use ftw_correlator::Context;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::assertion::{evaluate, Captured, Verdict};
use crate::config::Config;
use crate::packets::PacketWriter;
use crate::runner::{GeneratorRunner, RunnerError};
use crate::testcase::{self, Kind, LoadError, Node};

pub const WELCOME_SCREEN: &str = "welcome";
pub const TUTORIAL_SCREEN: &str = "tutorial";
pub const BYE_SCREEN: &str = "bye";
pub const RULE_SCREEN: &str = "rule";

/// Exit code reported after a fatal notification.
pub const FATAL_EXIT_CODE: i32 = 255;

/// Called once a generator run is over, before `start` returns.
pub type RunHook = Rc<dyn Fn(&Context)>;

struct State {
    ctx: Context,
    packet_path: PathBuf,
    runner: GeneratorRunner,
    shutdown: CancellationToken,
    exit_code: Cell<i32>,
    stopped: Cell<bool>,
    fatal: Cell<bool>,
    after_run: RefCell<Option<RunHook>>,
}

pub struct Harness {
    state: Rc<State>,
    subscriptions: Subscriptions,
}

impl Harness {
    /// # Errors
    ///
    /// Fails on a conflicting [`Topic::Command`] or [`Topic::Fatal`] contract.
    pub fn start(ctx: &Context, config: &Config) -> Result<Self, BrokerError> {
        let state = Rc::new(State {
            ctx: ctx.clone(),
            packet_path: config.packet_path.clone(),
            runner: GeneratorRunner::new(config.generator.clone()),
            shutdown: CancellationToken::new(),
            exit_code: Cell::new(0),
            stopped: Cell::new(false),
            fatal: Cell::new(false),
            after_run: RefCell::new(None),
        });

        let command_state = Rc::clone(&state);
        let on_command: Handler = Rc::new(move |message: &Message| {
            let mut words = message.args().iter().filter_map(Value::as_text);
            let Some(command) = words.next() else {
                return;
            };
            let args: Vec<&str> = words.collect();
            let text = message.named("text").and_then(Value::as_text);
            command_state.dispatch(command, &args, text);
        });

        let fatal_state = Rc::clone(&state);
        let on_fatal: Handler = Rc::new(move |_: &Message| {
            fatal_state.fatal.set(true);
            fatal_state.shutdown.cancel();
            fatal_state.stop();
        });

        let subscriptions = Subscriptions::new(Rc::clone(ctx.broker()))
            .with(Topic::Command, on_command)
            .with(Topic::Fatal, on_fatal);
        subscriptions.start()?;
        Ok(Self {
            state,
            subscriptions,
        })
    }

    pub fn on_run_finished(&self, hook: RunHook) {
        *self.state.after_run.borrow_mut() = Some(hook);
    }

    /// Whether `exit` ran or a fatal notification arrived.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.get()
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.state.fatal.get()
    }

    /// [`FATAL_EXIT_CODE`] after a fatal notification, otherwise the last
    /// non-zero generator exit code, or 0.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            FATAL_EXIT_CODE
        } else {
            self.state.exit_code.get()
        }
    }

    #[must_use]
    pub fn packet_path(&self) -> &Path {
        &self.state.packet_path
    }

    /// Interrupts a running generator and every later one.
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// Unsubscribes and removes the packet file.
    pub fn close(&self) {
        self.subscriptions.close();
        if self.state.packet_path.is_file() {
            if let Err(e) = fs::remove_file(&self.state.packet_path) {
                debug!("Failed to remove {}: {e}", self.state.packet_path.display());
            }
        }
    }
}

impl State {
    /// `text` is the raw remainder of the command line, when the sender kept it.
    fn dispatch(&self, command: &str, args: &[&str], text: Option<&str>) {
        let name = command.to_lowercase();
        let known = matches!(
            name.as_str(),
            "load" | "gen" | "start" | "import" | "report" | "rule" | "help" | "exit"
        );
        if !known {
            let mut words = vec![command];
            words.extend_from_slice(args);
            self.ctx
                .warn(format!("<{}> is not internal command", words.join(" ")));
            return;
        }
        self.ctx.info(format!("<{command}> ..."));
        match (name.as_str(), args) {
            ("load", [path]) => self.load(Path::new(path)),
            ("gen", []) => {
                self.generate(None);
            }
            ("gen", [title]) => {
                self.generate(Some(*title));
            }
            ("start", [destination]) => self.run(destination),
            ("import", [_, ..]) => match text {
                Some(text) => self.import(text),
                None => self.import(&args.join(" ")),
            },
            ("report", []) => self.report(),
            ("rule", []) => self.show(RULE_SCREEN, Some(self.ctx.delimiter().firewall_rule())),
            ("help", []) => self.show(TUTORIAL_SCREEN, None),
            ("exit", []) => self.stop(),
            _ => self.ctx.warn(format!("<{command}> got unexpected arguments {args:?}")),
        }
    }

    fn show(&self, screen: &str, text: Option<String>) {
        let mut args = vec![Value::Text(screen.to_string())];
        args.extend(text.map(Value::Text));
        self.ctx.publish(Topic::ShowUi, &Message::new(args));
    }

    fn stop(&self) {
        if !self.stopped.replace(true) {
            self.show(BYE_SCREEN, None);
        }
    }

    fn load(&self, path: &Path) {
        if !path.exists() {
            self.ctx.error(format!("{} is not existed", path.display()));
            return;
        }
        match self.insert_requests(path) {
            Ok(count) => self
                .ctx
                .info(format!("loaded {count} requests from {}", path.display())),
            Err(e) => self.ctx.error(e.to_string()),
        }
    }

    fn insert_requests(&self, path: &Path) -> Result<usize, LoadError> {
        let mut count = 0;
        for rule in testcase::load_rules(path)? {
            for test in testcase::get(Node::Rule(rule), Kind::Test)? {
                let Node::Test(test) = test else { continue };
                let meta = serde_json::to_string(&test)?;
                let file = test
                    .origin
                    .as_ref()
                    .map(|origin| origin.display().to_string())
                    .unwrap_or_default();
                for stage in testcase::get(Node::Test(test.clone()), Kind::Stage)? {
                    let Node::Stage(stage) = stage else { continue };
                    let input = serde_json::to_string(&stage.input)?;
                    let output = serde_json::to_string(&stage.output)?;
                    for packet in testcase::get(Node::Stage(stage), Kind::Packet)? {
                        let Node::Packet(packet) = packet else { continue };
                        self.ctx.query(Query::InsertRequest(NewRequest {
                            traffic_id: self.ctx.delimiter().new_key(),
                            test_title: test.test_title.clone(),
                            meta: meta.clone(),
                            file: file.clone(),
                            input: input.clone(),
                            output: output.clone(),
                            request: packet.bytes,
                        }));
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }

    /// Writes the packet file. Returns whether it was written.
    fn generate(&self, title: Option<&str>) -> bool {
        let Some(result) = self.ctx.query(Query::SelectRequests {
            title: title.map(ToString::to_string),
        }) else {
            return false;
        };
        if result.column("traffic_id").is_none() || result.column("request").is_none() {
            self.ctx
                .error("select_requests is not correct for generate testcase");
            return false;
        }

        let written = PacketWriter::create(&self.packet_path).and_then(|mut writer| {
            let delimiter = self.ctx.delimiter();
            for record in result.records() {
                let (Some(key), Some(request)) = (record.text("traffic_id"), record.bytes("request"))
                else {
                    continue;
                };
                let sentinel = delimiter.sentinel_packet(key);
                writer.write(&sentinel)?;
                writer.write(request)?;
                writer.write(&sentinel)?;
            }
            writer.finish()
        });
        match written {
            Ok(packets) => {
                self.ctx.info(format!(
                    "wrote {packets} packets to {}",
                    self.packet_path.display()
                ));
                true
            }
            Err(e) => {
                self.ctx.error(format!(
                    "failed to write {}: {e}",
                    self.packet_path.display()
                ));
                false
            }
        }
    }

    fn run(&self, destination: &str) {
        if !self.packet_path.exists() {
            self.generate(None);
            if !self.packet_path.exists() {
                self.ctx
                    .warn(format!("{} is not existed", self.packet_path.display()));
                return;
            }
        }
        self.ctx.query(Query::CleanRawData);
        self.ctx.publish(Topic::Reset, &Message::empty());

        let cancel = self.shutdown.child_token();
        let result = self
            .runner
            .run_blocking(&self.packet_path, destination, &cancel, |line| {
                self.ctx.publish(
                    Topic::GeneratorOutput,
                    &Message::new(vec![Value::Bytes(line.to_vec())]),
                );
            });
        match result {
            Ok(0) => {}
            Ok(code) => {
                self.exit_code.set(code);
                self.ctx.warn(format!("generator exited with code {code}"));
            }
            Err(RunnerError::Cancelled) => {
                self.ctx.publish(Topic::Reset, &Message::empty());
                self.ctx.warn("generator interrupted, partial results discarded");
            }
            Err(e) => self.ctx.error(e.to_string()),
        }

        let hook = self.after_run.borrow().clone();
        if let Some(hook) = hook {
            hook(&self.ctx);
        }
    }

    /// Replays an audit log file forward, or `text` itself when it names no
    /// file. Every published line ends with a newline.
    fn import(&self, text: &str) {
        let path = Path::new(text);
        let content = if path.is_file() {
            match fs::read(path) {
                Ok(content) => content,
                Err(e) => {
                    self.ctx
                        .error(format!("failed to read {}: {e}", path.display()));
                    return;
                }
            }
        } else {
            text.as_bytes().to_vec()
        };

        let mut lines = 0;
        for line in content.split_inclusive(|&b| b == b'\n') {
            let mut line = line.to_vec();
            if line.last() != Some(&b'\n') {
                line.push(b'\n');
            }
            self.ctx
                .publish(Topic::RawLog, &Message::new(vec![Value::Bytes(line)]));
            lines += 1;
        }
        debug!("Imported {lines} log lines");
    }

    fn report(&self) {
        let Some(result) = self.ctx.query(Query::SelectResults) else {
            return;
        };
        let (mut passed, mut failed, mut unknown) = (0, 0, 0);
        for record in result.records() {
            // never sent
            let Some(raw_request) = record.get("raw_request") else {
                continue;
            };
            if raw_request.is_null() {
                continue;
            }
            let traffic_id = record.text("traffic_id").unwrap_or_default();
            let test_title = record.text("test_title").unwrap_or_default();
            let response = record
                .bytes("raw_response")
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
            let evaluation = evaluate(
                record.text("output").unwrap_or("null"),
                Captured {
                    response: response.as_deref(),
                    log: record.text("raw_log"),
                },
            );

            if let Some(e) = &evaluation.error {
                unknown += 1;
                self.ctx.warn(format!("{test_title}: {e}"));
            } else if let Some(verdict) = evaluation.passed() {
                if verdict {
                    passed += 1;
                } else {
                    failed += 1;
                }
                self.ctx.query(Query::UpdateTestingResult {
                    traffic_id: traffic_id.to_string(),
                    passed: verdict,
                });
            }

            match serde_json::to_value(Verdict::new(traffic_id, test_title, &evaluation)) {
                Ok(verdict) => {
                    self.ctx
                        .publish(Topic::CheckResult, &Message::new(vec![Value::Json(verdict)]));
                }
                Err(e) => self.ctx.error(format!("failed to encode verdict: {e}")),
            }
        }
        self.ctx.info(format!(
            "report: {passed} passed, {failed} failed, {unknown} unknown"
        ));
    }
}
