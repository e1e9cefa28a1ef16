use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// One structured telemetry record. Every envelope the executor produces is
/// mirrored here, along with agent lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: String,
    pub run_id: String,
    pub step: u32,
    pub kind: String,
    pub data: Value,
}

impl Event {
    pub fn now(run_id: &str, step: u32, kind: &str, data: Value) -> Self {
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::new());
        Self {
            ts,
            run_id: run_id.to_string(),
            step,
            kind: kind.to_string(),
            data,
        }
    }
}

/// Telemetry receiver. Sinks are fire-and-forget: callers swallow emit
/// errors so telemetry can never fail a run.
pub trait EventSink: Send {
    fn emit(&mut self, event: &Event) -> anyhow::Result<()>;
}

/// Drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Append-only JSONL file, one event per line.
pub struct JsonlFileSink {
    file: File,
}

impl JsonlFileSink {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl EventSink for JsonlFileSink {
    fn emit(&mut self, event: &Event) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Buffers events in memory; test support.
#[derive(Default)]
pub struct MemorySink {
    pub events: Vec<Event>,
}

impl EventSink for MemorySink {
    fn emit(&mut self, event: &Event) -> anyhow::Result<()> {
        self.events.push(event.clone());
        Ok(())
    }
}

/// Fans out to several sinks; a failing sink does not stop the others.
pub struct MultiSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for MultiSink {
    fn emit(&mut self, event: &Event) -> anyhow::Result<()> {
        for sink in &mut self.sinks {
            let _ = sink.emit(event);
        }
        Ok(())
    }
}
