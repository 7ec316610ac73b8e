// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use ftw_correlator::broker::{Message, Topic, Value};
use ftw_correlator::Delimiter;
use ftw_harness::config::{Config, GeneratorConfig};
use ftw_harness::packets::read_packets;
use ftw_harness::session::Session;
use ftw_harness::store::TrafficRow;
use tempfile::TempDir;

const RULE_FILE: &str = r#"---
meta:
  author: "ftw"
  enabled: true
  name: "911100.yaml"
tests:
- test_title: 911100-1
  stages:
  - stage:
      input:
        dest_addr: "127.0.0.1"
        method: "OPTIONS"
        port: 80
        headers:
          User-Agent: "ModSecurity CRS 3 Tests"
          Host: "localhost"
      output:
        status: [200, 403]
- test_title: 911100-2
  stages:
  - stage:
      input:
        method: "TEST"
        headers:
          Host: "localhost"
      output:
        status: 403
        log_contains: "id \"911100\""
- test_title: 911100-3
  stages:
  - stage:
      input:
        method: "CONNECT"
        headers:
          Host: "localhost"
      output:
        status: 200
"#;

struct Fixture {
    dir: TempDir,
    session: Session,
    warnings: Rc<RefCell<Vec<String>>>,
    verdicts: Rc<RefCell<Vec<serde_json::Value>>>,
}

impl Fixture {
    /// The generator prints `wb.out` from the fixture directory and exits
    /// with `code`.
    fn start(code: i32) -> Self {
        Self::with_generator(&format!("cat \"$(dirname \"$0\")/wb.out\"\nexit {code}"))
    }

    /// The generator is a shell script running `body`.
    fn with_generator(body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("911100.yaml"), RULE_FILE).unwrap();
        let program = fake_generator(dir.path(), body);
        let config = Config {
            database: Some(dir.path().join("db")),
            packet_path: dir.path().join("test.pkt"),
            generator: GeneratorConfig {
                program: program.display().to_string(),
                ..GeneratorConfig::default()
            },
            delimiter_secret: Some("magic".to_string()),
            ..Config::default()
        };
        let session = Session::start(&config).unwrap();

        let warnings = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&warnings);
        session
            .context()
            .broker()
            .subscribe(
                Topic::Warning,
                Rc::new(move |m: &Message| {
                    sink.borrow_mut()
                        .push(m.arg(0).and_then(Value::as_text).unwrap().to_string());
                }),
                None,
            )
            .unwrap();

        let verdicts = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&verdicts);
        session
            .context()
            .broker()
            .subscribe(
                Topic::CheckResult,
                Rc::new(move |m: &Message| {
                    sink.borrow_mut()
                        .push(m.arg(0).and_then(Value::as_json).unwrap().clone());
                }),
                None,
            )
            .unwrap();

        Self {
            dir,
            session,
            warnings,
            verdicts,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn rows(&self) -> Vec<TrafficRow> {
        self.session.store().rows().unwrap()
    }

    fn load(&self) {
        let rules = self.path("911100.yaml");
        assert!(self.session.execute(&format!("load {}", rules.display())));
    }
}

fn write_request(out: &mut Vec<u8>, packet: &[u8]) {
    out.extend_from_slice(format!("writing request({} bytes)=>[", packet.len()).as_bytes());
    out.extend_from_slice(packet);
    out.extend_from_slice(b"]\n");
}

fn receive_response(out: &mut Vec<u8>, packet: &[u8]) {
    out.extend_from_slice(format!("LOG: http packet received({} bytes):\n", packet.len()).as_bytes());
    out.extend_from_slice(packet);
    out.extend_from_slice(b"\n");
}

/// What the load generator prints when every test gets `responses[i]`.
fn generator_output(rows: &[TrafficRow], responses: &[&str]) -> Vec<u8> {
    let delimiter = Delimiter::with_secret("magic").unwrap();
    let mut output = format!(
        " read {} packets from file with total length(1024).\n",
        rows.len() * 3
    )
    .into_bytes();
    for (row, response) in rows.iter().zip(responses) {
        let sentinel = delimiter.sentinel_packet(&row.traffic_id);
        write_request(&mut output, &sentinel);
        receive_response(&mut output, b"HTTP/1.1 400 Bad Request\r\n\r\n");
        write_request(&mut output, &row.request);
        receive_response(&mut output, response.as_bytes());
        write_request(&mut output, &sentinel);
        receive_response(&mut output, b"HTTP/1.1 400 Bad Request\r\n\r\n");
    }
    output.extend_from_slice(format!("Finished {} requests\n", rows.len() * 3).as_bytes());
    output
}

#[cfg(unix)]
fn fake_generator(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("wb");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(not(unix))]
fn fake_generator(dir: &Path, _body: &str) -> PathBuf {
    dir.join("wb")
}

fn audit_line(key: &str) -> String {
    format!(
        "2019/04/11 19:20:46 [error] 392#412: [client 172.17.0.1] ModSecurity: Access denied with code 403 (phase 1). \
         [id \"010203\"] [msg \"delimiter-magic-{key}\"] [uri \"/\"]\n"
    )
}

#[test]
fn test_load_stores_one_request_per_stage() {
    let fixture = Fixture::start(0);
    fixture.load();

    let rows = fixture.rows();
    let titles: Vec<&str> = rows.iter().map(|row| row.test_title.as_str()).collect();
    assert_eq!(titles, vec!["911100-1", "911100-2", "911100-3"]);
    assert!(rows[0].request.starts_with(b"OPTIONS / HTTP/1.1\r\n"));
    assert!(rows[0].file.ends_with("911100.yaml"));
    let output: serde_json::Value = serde_json::from_str(&rows[1].output).unwrap();
    assert_eq!(output["status"], serde_json::json!(403));
    assert!(rows.iter().all(|row| row.raw_request.is_none()));
}

#[test]
fn test_gen_frames_requests_with_sentinels() {
    let fixture = Fixture::start(0);
    fixture.load();
    assert!(fixture.session.execute("gen 911100-2"));

    let rows = fixture.rows();
    let packets = read_packets(fixture.session.harness().packet_path()).unwrap();
    let sentinel = Delimiter::with_secret("magic")
        .unwrap()
        .sentinel_packet(&rows[1].traffic_id);
    assert_eq!(packets, vec![sentinel.clone(), rows[1].request.clone(), sentinel]);
}

#[test]
fn test_missing_rule_path() {
    let fixture = Fixture::start(0);
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&errors);
    fixture
        .session
        .context()
        .broker()
        .subscribe(
            Topic::Error,
            Rc::new(move |m: &Message| {
                sink.borrow_mut()
                    .push(m.arg(0).and_then(Value::as_text).unwrap().to_string());
            }),
            None,
        )
        .unwrap();

    let missing = fixture.path("missing.yaml");
    fixture.session.execute(&format!("load {}", missing.display()));
    assert_eq!(
        *errors.borrow(),
        vec![format!("{} is not existed", missing.display())]
    );
    assert!(fixture.rows().is_empty());
}

#[test]
fn test_unknown_command_and_exit() {
    let fixture = Fixture::start(0);
    assert!(fixture.session.execute("frobnicate now"));
    assert_eq!(
        *fixture.warnings.borrow(),
        vec!["<frobnicate now> is not internal command".to_string()]
    );

    assert!(!fixture.session.execute("exit"));
    assert_eq!(fixture.session.exit_code(), 0);
}

#[test]
fn test_fatal_stops_session() {
    let fixture = Fixture::start(0);
    fixture.session.context().fatal("store is gone");
    assert!(fixture.session.harness().is_stopped());
    assert_eq!(fixture.session.exit_code(), 255);
}

#[test]
fn test_import_keeps_whitespace_of_literal_text() {
    let fixture = Fixture::start(0);
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&lines);
    fixture
        .session
        .context()
        .broker()
        .subscribe(
            Topic::RawLog,
            Rc::new(move |m: &Message| {
                sink.borrow_mut()
                    .push(m.arg(0).and_then(Value::as_bytes).unwrap().to_vec());
            }),
            None,
        )
        .unwrap();

    fixture
        .session
        .execute("import   [error]\tModSecurity:  Access denied [id \"911100\"]");
    assert_eq!(
        *lines.borrow(),
        vec![b"[error]\tModSecurity:  Access denied [id \"911100\"]\n".to_vec()]
    );
}

#[cfg(unix)]
#[test]
#[serial_test::serial]
fn test_fatal_during_start_interrupts_generator() {
    let fixture = Fixture::with_generator("echo first\nsleep 3\necho after-fatal");
    fixture.load();

    let output = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&output);
    let ctx = fixture.session.context().clone();
    fixture
        .session
        .context()
        .broker()
        .subscribe(
            Topic::GeneratorOutput,
            Rc::new(move |m: &Message| {
                let line = m.arg(0).and_then(Value::as_bytes).unwrap();
                sink.borrow_mut()
                    .push(String::from_utf8_lossy(line).into_owned());
                ctx.fatal("store is gone");
            }),
            None,
        )
        .unwrap();
    let traffic = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&traffic);
    fixture
        .session
        .context()
        .broker()
        .subscribe(
            Topic::RawTraffic,
            Rc::new(move |_: &Message| *sink.borrow_mut() += 1),
            None,
        )
        .unwrap();

    let started = Instant::now();
    assert!(!fixture.session.execute("start localhost:8080"));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(*output.borrow(), vec!["first\n".to_string()]);
    assert_eq!(*traffic.borrow(), 0);
    assert!(fixture.session.harness().is_fatal());
    assert_eq!(fixture.session.exit_code(), 255);
    assert!(fixture
        .warnings
        .borrow()
        .contains(&"generator interrupted, partial results discarded".to_string()));
}

#[cfg(unix)]
#[test]
#[serial_test::serial]
fn test_start_import_report() {
    let fixture = Fixture::start(0);
    fixture.load();
    fixture.session.execute("gen");

    let rows = fixture.rows();
    fs::write(
        fixture.path("wb.out"),
        generator_output(
            &rows,
            &[
                "HTTP/1.1 200 OK\r\n\r\n",
                "HTTP/1.1 403 Forbidden\r\n\r\n",
                "HTTP/1.1 403 Forbidden\r\n\r\n",
            ],
        ),
    )
    .unwrap();

    let screens = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&screens);
    fixture
        .session
        .context()
        .broker()
        .subscribe(
            Topic::ShowUi,
            Rc::new(move |m: &Message| {
                let screen = m.arg(0).and_then(Value::as_text).unwrap().to_string();
                let title = m.arg(3).and_then(Value::as_text).map(ToString::to_string);
                sink.borrow_mut().push((screen, title));
            }),
            None,
        )
        .unwrap();

    assert!(fixture.session.execute("start localhost:8080"));
    assert_eq!(
        *screens.borrow(),
        vec![
            ("progress".to_string(), Some("911100-1".to_string())),
            ("progress".to_string(), Some("911100-2".to_string())),
            ("progress".to_string(), Some("911100-3".to_string())),
        ]
    );
    assert!(!fixture.session.progress().progress().active);
    let captured = fixture.rows();
    assert_eq!(
        captured[1].raw_response.as_deref(),
        Some(b"HTTP/1.1 403 Forbidden\r\n\r\n".as_slice())
    );
    assert_eq!(captured[1].raw_request.as_deref(), Some(rows[1].request.as_slice()));

    let log = fixture.path("error.log");
    let key = &rows[1].traffic_id;
    fs::write(
        &log,
        format!(
            "{}2019/04/11 19:20:46 [error] ModSecurity: Access denied with code 403 [id \"911100\"]\n{}",
            audit_line(key),
            audit_line(key)
        ),
    )
    .unwrap();
    fixture.session.execute(&format!("import {}", log.display()));
    assert_eq!(
        fixture.rows()[1].raw_log.as_deref(),
        Some("2019/04/11 19:20:46 [error] ModSecurity: Access denied with code 403 [id \"911100\"]")
    );

    fixture.session.execute("report");
    let verdicts = fixture.verdicts.borrow();
    let passed: Vec<_> = verdicts.iter().map(|v| v["passed"].clone()).collect();
    assert_eq!(
        passed,
        vec![
            serde_json::json!(true),
            serde_json::json!(true),
            serde_json::json!(false)
        ]
    );
    assert_eq!(verdicts[1]["checks"]["log_contains"], serde_json::json!(true));
    let results: Vec<_> = fixture.rows().iter().map(|row| row.testing_result).collect();
    assert_eq!(results, vec![Some(true), Some(true), Some(false)]);
    assert_eq!(fixture.session.exit_code(), 0);
}

#[cfg(unix)]
#[test]
#[serial_test::serial]
fn test_generator_failure_sets_exit_code() {
    let fixture = Fixture::start(2);
    fs::write(fixture.path("wb.out"), "connect failed\n").unwrap();
    fixture.load();
    assert!(fixture.session.execute("start localhost:1"));
    assert_eq!(fixture.session.exit_code(), 2);
    assert!(fixture
        .warnings
        .borrow()
        .contains(&"generator exited with code 2".to_string()));
    assert!(fixture.session.harness().packet_path().exists());

    fixture.session.close();
    assert!(!fixture.session.harness().packet_path().exists());
}
