// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process-wide `tracing` setup.
//!
//! Events are written one per line in glog layout,
//! `Lyyyymmdd hh:mm:ss.uuuuuu tid file:line] message`, to `$NOVAEXEC_LOG_FILE`,
//! `$NOVAEXEC_LOG_DIR/novaexec.log` or stderr.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

static INIT: OnceLock<()> = OnceLock::new();

const LOG_FILE_ENV: &str = "NOVAEXEC_LOG_FILE";
const LOG_DIR_ENV: &str = "NOVAEXEC_LOG_DIR";
const LOG_FILE_NAME: &str = "novaexec.log";

/// Appending file sink shared by every writer the subscriber hands out.
#[derive(Clone)]
struct LogFile {
    file: Arc<Mutex<File>>,
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl io::Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?
            .flush()
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

/// `None` when neither variable is set, so tests and CLIs log to stderr.
fn log_file_path() -> Option<PathBuf> {
    env_path(LOG_FILE_ENV).or_else(|| env_path(LOG_DIR_ENV).map(|dir| dir.join(LOG_FILE_NAME)))
}

fn open_log_file() -> Option<LogFile> {
    let path = log_file_path()?;
    let opened = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
    match opened {
        Ok(file) => Some(LogFile {
            file: Arc::new(Mutex::new(file)),
        }),
        Err(err) => {
            eprintln!("cannot log to {}: {}, using stderr", path.display(), err);
            None
        }
    }
}

fn level_char(level: &Level) -> char {
    match *level {
        Level::ERROR => 'E',
        Level::WARN => 'W',
        Level::INFO => 'I',
        Level::DEBUG => 'D',
        Level::TRACE => 'T',
    }
}

fn thread_number() -> u64 {
    format!("{:?}", std::thread::current().id())
        .trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .parse()
        .unwrap_or(0)
}

fn write_prefix(
    out: &mut impl fmt::Write,
    level: &Level,
    now: DateTime<Local>,
    thread: u64,
    file: &str,
    line: u32,
) -> fmt::Result {
    write!(
        out,
        "{}{:04}{:02}{:02} {:02}:{:02}:{:02}.{:06} {} {}:{}] ",
        level_char(level),
        now.year() % 10000,
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_micros(),
        thread,
        file,
        line
    )
}

struct GlogFormatter;

impl<S, N> FormatEvent<S, N> for GlogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write_prefix(
            &mut writer,
            metadata.level(),
            Local::now(),
            thread_number(),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber once; `filter` is an `EnvFilter` expression such as
/// `info,novaexec=debug`. Later calls are no-ops.
pub fn init_with_level(filter: &str) {
    INIT.get_or_init(|| {
        let builder = tracing_fmt().with_env_filter(EnvFilter::new(filter));
        let _ = match open_log_file() {
            Some(file) => builder
                .with_writer(file)
                .with_ansi(false)
                .event_format(GlogFormatter)
                .try_init(),
            // colors only when a terminal reads stderr
            None => builder
                .with_writer(io::stderr)
                .with_ansi(atty::is(atty::Stream::Stderr))
                .event_format(GlogFormatter)
                .try_init(),
        };
    });
}

pub fn init() {
    init_with_level("info");
}

/// Admits one of every `every` events for hot-path logging.
pub struct LogEvery {
    counter: AtomicU64,
    every: u64,
}

impl LogEvery {
    pub const fn new(every: u64) -> Self {
        Self {
            counter: AtomicU64::new(0),
            every,
        }
    }

    pub fn should_log(&self) -> bool {
        let every = self.every.max(1);
        self.counter.fetch_add(1, Ordering::Relaxed) % every == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn log_every_admits_first_of_each_window() {
        let sampler = LogEvery::new(3);
        let admitted: Vec<bool> = (0..7).map(|_| sampler.should_log()).collect();
        assert_eq!(admitted, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn prefix_uses_glog_layout() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        let mut out = String::new();
        write_prefix(&mut out, &Level::WARN, now, 17, "src/runtime/sql_task.rs", 42).unwrap();
        assert_eq!(out, "W20240307 09:05:01.000000 17 src/runtime/sql_task.rs:42] ");
    }
}

pub use tracing::instrument;
pub use tracing::{debug, error, info, trace, warn};
