//! Engine logger built on [tracing](https://crates.io/crates/tracing).
//!
//! A JSON subscriber feeds log records over a channel to a dedicated
//! writer thread, so logging never blocks the engine event loop. The
//! default writer prints colored console lines; a JSON writer is
//! available for host-side log collection.

use std::{
    fmt::Write as _,
    io::{self, stderr, stdout, Write},
    str::FromStr,
    thread::{self, JoinHandle},
};

use colored::{Color, Colorize as _};
use futures::executor::block_on;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DisplayFromStr};
use tokio::{
    select,
    sync::mpsc::{unbounded_channel, UnboundedSender},
};
use tracing::Level;

use crate::Result;

/// One log record after field extraction.
#[serde_as]
#[derive(Serialize, Deserialize, Debug)]
pub struct LogRecord {
    pub time: String,
    #[serde_as(as = "DisplayFromStr")]
    pub level: Level,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl LogRecord {
    fn from_json(mut raw: Map<String, Value>) -> Self {
        let target = raw
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let level = Level::from_str(raw.get("level").and_then(Value::as_str).unwrap_or("ERROR"))
            .unwrap_or(Level::ERROR);
        let mut fields = match raw.remove("fields") {
            Some(Value::Object(x)) => x,
            _ => Map::default(),
        };
        let message = fields
            .remove("message")
            .unwrap_or_default()
            .as_str()
            .unwrap_or_default()
            .to_owned();
        Self {
            time: chrono::Local::now().format("%F %T%.3f").to_string(),
            level,
            message,
            target,
            fields,
        }
    }
}

struct LogSender {
    tx: UnboundedSender<Map<String, Value>>,
}

impl Write for LogSender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(serde_json::from_slice(buf)?)
            .or(Err(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // the channel does not buffer
        Ok(())
    }
}

impl LogSender {
    fn new(tx: UnboundedSender<Map<String, Value>>) -> impl Fn() -> Self {
        move || Self { tx: tx.clone() }
    }
}

pub type WriterFn = Box<dyn Fn(LogRecord, Box<dyn Write>) -> Result<()> + Send>;
pub type FilterFn = Box<dyn Fn(&LogRecord) -> bool + Send>;

/// Keep this guard alive while the engine runs. Dropping it drains the
/// channel and joins the writer thread.
pub struct LoggerGuard {
    stop_tx: UnboundedSender<()>,
    join: Option<JoinHandle<()>>,
}

impl Drop for LoggerGuard {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(x) = self.join.take() {
            let _ = x.join();
        }
    }
}

pub struct LoggerBuilder {
    json: bool,
    level: Level,
    filter: Option<FilterFn>,
    json_writer: WriterFn,
    color_writer: WriterFn,
}

impl Default for LoggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggerBuilder {
    /// Colored level tag.
    ///
    /// - TRACE/DEBUG => Magenta
    /// - INFO => Green
    /// - WARN => Yellow
    /// - ERROR => Red
    pub fn fmt_level(level: &Level) -> String {
        format!("{: >5}", level.to_string())
            .bold()
            .color(match *level {
                Level::TRACE | Level::DEBUG => Color::Magenta,
                Level::INFO => Color::Green,
                Level::WARN => Color::Yellow,
                Level::ERROR => Color::Red,
            })
            .to_string()
    }

    fn default_json_writer(record: LogRecord, mut writer: Box<dyn Write>) -> Result<()> {
        let line = serde_json::to_string(&record).unwrap_or_default();
        writer.write_fmt(format_args!("{line}\n"))?;
        writer.flush()?;
        Ok(())
    }

    fn default_color_writer(record: LogRecord, mut writer: Box<dyn Write>) -> Result<()> {
        let mut buf = String::new();
        write!(
            buf,
            "{} {} {}{} {}",
            record.time.bright_black(),
            Self::fmt_level(&record.level),
            record.target.bright_black(),
            ":".bright_black(),
            record.message
        )
        .map_err(|e| crate::Error::Internal(e.into()))?;
        for (k, v) in &record.fields {
            if !k.starts_with("log.") {
                buf += &format!(" {k}={v}").bright_black().to_string();
            }
        }
        writer.write_fmt(format_args!("{buf}\n"))?;
        writer.flush()?;
        Ok(())
    }

    /// Colored console output at INFO by default.
    pub fn new() -> Self {
        Self {
            json: false,
            level: Level::INFO,
            filter: None,
            json_writer: Box::new(Self::default_json_writer),
            color_writer: Box::new(Self::default_color_writer),
        }
    }

    /// Emit JSON lines instead of colored text.
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Drop records the filter rejects.
    ///
    /// # Warning
    /// Heavy work here blocks other logs.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&LogRecord) -> bool + Send + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Use a custom JSON writer.
    pub fn json_writer(mut self, writer: WriterFn) -> Self {
        self.json_writer = writer;
        self
    }

    /// Use a custom colored writer.
    pub fn color_writer(mut self, writer: WriterFn) -> Self {
        self.color_writer = writer;
        self
    }

    /// Register the subscriber and start the writer thread. Call once
    /// for the whole process.
    pub fn start(self) -> LoggerGuard {
        let (tx, mut rx) = unbounded_channel();
        let (stop_tx, mut stop_rx) = unbounded_channel();
        tracing_subscriber::fmt()
            .with_max_level(self.level)
            .with_writer(LogSender::new(tx))
            .without_time()
            .json()
            .init();

        let join = thread::spawn(move || {
            let handle = |raw: Map<String, Value>| {
                let record = LogRecord::from_json(raw);
                if let Some(filter) = &self.filter {
                    if !filter(&record) {
                        return;
                    }
                }
                let writer: Box<dyn io::Write> = if record.level <= Level::WARN {
                    Box::new(stderr())
                } else {
                    Box::new(stdout())
                };
                if self.json {
                    let _ = (self.json_writer)(record, writer);
                } else {
                    let _ = (self.color_writer)(record, writer);
                }
            };
            block_on(async move {
                loop {
                    select! {
                        Some(v) = rx.recv() => handle(v),
                        _ = stop_rx.recv() => {
                            while let Ok(v) = rx.try_recv() {
                                handle(v);
                            }
                            break;
                        }
                    }
                }
            })
        });
        LoggerGuard {
            stop_tx,
            join: Some(join),
        }
    }
}
