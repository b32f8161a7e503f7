//! Event sinks
//!
//! A sink is an output endpoint fed by its own consumer inbox. The pipeline
//! drains the inbox and hands every event to [`Sink::push`].

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Mutex, PoisonError},
};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::{
    consumer::{ConsumerMode, DEFAULT_QUEUE_CAPACITY},
    event::{Event, EventKind},
};

/// Output endpoint for accounting events
pub trait Sink: Send + Sync {
    /// Unique name, also used for the sink's consumer
    fn name(&self) -> &str;

    /// Whether the sink is ready to receive events
    fn is_init(&self) -> bool;

    fn want_update(&self) -> bool;

    fn want_destroy(&self) -> bool;

    /// Inbox capacity of the sink's consumer
    fn queue_capacity(&self) -> usize {
        DEFAULT_QUEUE_CAPACITY
    }

    /// Write out a single event.
    fn push(&self, event: &Event, kind: EventKind) -> Result<()>;

    /// Flush buffered output. Called once the sink's inbox is closed.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkType {
    /// Newline-delimited JSON on stdout
    Stdout,
    /// Newline-delimited JSON file
    Json,
    /// InfluxDB line protocol file
    Influx,
}

impl std::str::FromStr for SinkType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(SinkType::Stdout),
            "json" => Ok(SinkType::Json),
            "influx" | "influxdb" => Ok(SinkType::Influx),
            _ => anyhow::bail!("Unsupported sink: {}. Use stdout, json, or influx", s),
        }
    }
}

type Output = Mutex<Box<dyn Write + Send>>;

fn write_line(output: &Output, line: &str) -> io::Result<()> {
    let mut w = output.lock().unwrap_or_else(PoisonError::into_inner);
    w.write_all(line.as_bytes())?;
    w.write_all(b"\n")
}

fn flush(output: &Output) -> io::Result<()> {
    output
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .flush()
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    kind: EventKind,
    /// Wall-clock time the event was written
    time: String,
    #[serde(flatten)]
    event: &'a Event,
}

/// Newline-delimited JSON sink
pub struct JsonSink {
    name: String,
    mode: ConsumerMode,
    output: Output,
}

impl JsonSink {
    /// Write events to stdout.
    pub fn stdout(mode: ConsumerMode) -> Self {
        Self::from_writer("stdout", io::stdout(), mode)
    }

    /// Write events to a newly created file at `path`.
    pub fn create(path: &Path, mode: ConsumerMode) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file: {:?}", path))?;
        Ok(Self::from_writer(
            format!("json:{}", path.display()),
            BufWriter::new(file),
            mode,
        ))
    }

    pub fn from_writer(
        name: impl Into<String>,
        writer: impl Write + Send + 'static,
        mode: ConsumerMode,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            output: Mutex::new(Box::new(writer)),
        }
    }

    fn to_json(event: &Event, kind: EventKind) -> Result<String> {
        let record = JsonRecord {
            kind,
            time: chrono::Utc::now().to_rfc3339(),
            event,
        };
        Ok(serde_json::to_string(&record)?)
    }
}

impl Sink for JsonSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_init(&self) -> bool {
        true
    }

    fn want_update(&self) -> bool {
        self.mode.want_update()
    }

    fn want_destroy(&self) -> bool {
        self.mode.want_destroy()
    }

    fn push(&self, event: &Event, kind: EventKind) -> Result<()> {
        let line = Self::to_json(event, kind)?;
        write_line(&self.output, &line)
            .with_context(|| format!("Failed to write event to {}", self.name))
    }

    fn flush(&self) -> Result<()> {
        flush(&self.output).with_context(|| format!("Failed to flush {}", self.name))
    }
}

/// InfluxDB line protocol sink
pub struct InfluxSink {
    name: String,
    mode: ConsumerMode,
    measurement: String,
    output: Output,
}

impl InfluxSink {
    /// Write line protocol to a newly created file at `path`.
    pub fn create(path: &Path, measurement: String, mode: ConsumerMode) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file: {:?}", path))?;
        Ok(Self::from_writer(
            format!("influx:{}", path.display()),
            BufWriter::new(file),
            measurement,
            mode,
        ))
    }

    pub fn from_writer(
        name: impl Into<String>,
        writer: impl Write + Send + 'static,
        measurement: String,
        mode: ConsumerMode,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            measurement,
            output: Mutex::new(Box::new(writer)),
        }
    }

    /// Convert an event to a line of InfluxDB line protocol.
    ///
    /// Identifiers and counters are written as unsigned fields (`u`), so
    /// counters past `i64::MAX` keep their value.
    fn to_influx_line(event: &Event, kind: EventKind, measurement: &str, timestamp: i64) -> String {
        format!(
            "{},kind={},proto={},src={},dst={},src_port={},dst_port={} \
             connection_id={}u,connmark={}u,netns={}u,start={}u,\
             packets_orig={}u,bytes_orig={}u,packets_ret={}u,bytes_ret={}u {}",
            measurement.replace(',', "\\,").replace(' ', "\\ "),
            kind,
            event.proto,
            event.src_addr,
            event.dst_addr,
            event.src_port,
            event.dst_port,
            event.connection_id,
            event.connmark,
            event.netns,
            event.start,
            event.packets_orig,
            event.bytes_orig,
            event.packets_ret,
            event.bytes_ret,
            timestamp
        )
    }
}

impl Sink for InfluxSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_init(&self) -> bool {
        true
    }

    fn want_update(&self) -> bool {
        self.mode.want_update()
    }

    fn want_destroy(&self) -> bool {
        self.mode.want_destroy()
    }

    fn push(&self, event: &Event, kind: EventKind) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let line = Self::to_influx_line(event, kind, &self.measurement, timestamp);
        write_line(&self.output, &line)
            .with_context(|| format!("Failed to write event to {}", self.name))
    }

    fn flush(&self) -> Result<()> {
        flush(&self.output).with_context(|| format!("Failed to flush {}", self.name))
    }
}
