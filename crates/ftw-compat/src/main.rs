// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod console;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use anyhow::Context as _;
use clap::{ArgGroup, Parser};
use ftw_correlator::broker::{Message, Topic};
use ftw_harness::commands::{TUTORIAL_SCREEN, WELCOME_SCREEN};
use ftw_harness::config::{self, Config};
use ftw_harness::logger::Formatter;
use ftw_harness::session::Session;
use tracing::{debug, error};

use crate::console::Console;

/// Database argument standing for an in-memory store.
const IN_MEMORY: &str = ":memory:";

#[derive(Parser, Debug)]
#[command(name = "ftw-compat")]
#[command(about = "Runs FTW regression tests against a WAF and correlates the captured traffic")]
#[command(group(ArgGroup::new("mode").required(true).args(["interact", "execute"])))]
struct Args {
    /// Traffic store location, `:memory:` for a throwaway store
    #[arg(short, long)]
    database: Option<String>,

    /// Read commands from stdin, one per line
    #[arg(short, long)]
    interact: bool,

    /// Run newline separated commands; `\n` and `\t` escapes are decoded
    #[arg(short = 'x', long)]
    execute: Option<String>,
}

fn main() {
    let args = Args::parse();
    let mut config = config::get_config(&config::config_path());
    match args.database.as_deref() {
        Some(IN_MEMORY) => config.database = None,
        Some(path) => config.database = Some(PathBuf::from(path)),
        None => {}
    }

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            config
                .log_level
                .env_filter()
                .expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .without_time()
        .with_writer(io::stderr)
        .event_format(Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let code = match run(&args, &config) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    process::exit(code);
}

fn run(args: &Args, config: &Config) -> anyhow::Result<i32> {
    let session = Session::start(config).context("failed to start session")?;
    let console = Console::start(session.context()).context("failed to attach console")?;
    let show = |screen: &str| {
        session
            .context()
            .publish(Topic::ShowUi, &Message::text(screen));
    };

    show(WELCOME_SCREEN);
    if args.interact {
        show(TUTORIAL_SCREEN);
        interact(&session)?;
    } else if let Some(commands) = &args.execute {
        for command in decode_escapes(commands).lines() {
            if !session.execute(command.trim()) {
                break;
            }
        }
    }

    let code = session.exit_code();
    console.close();
    session.close();
    Ok(code)
}

fn interact(session: &Session) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!(">> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            return Ok(());
        };
        if !session.execute(line?.trim()) {
            return Ok(());
        }
    }
}

/// Decodes `\n`, `\t` and `\\`; other escapes are kept as written.
fn decode_escapes(text: &str) -> String {
    let mut decoded = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            decoded.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => decoded.push('\n'),
            Some('t') => decoded.push('\t'),
            Some('\\') => decoded.push('\\'),
            Some(other) => {
                decoded.push('\\');
                decoded.push(other);
            }
            None => decoded.push('\\'),
        }
    }
    decoded
}
