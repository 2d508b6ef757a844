//! Metrics sinks for flushed steps.
//!
//! The coordinator flushes each finished step's averaged metrics into a
//! sink. Backends: console table, CSV (long format, one row per key),
//! and a fan-out combinator.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Destination for per-step aggregated metrics.
pub trait MetricsSink: Send {
    /// Record one flushed step.
    fn log_step(&mut self, step: u64, metrics: &[(String, f64)]);

    /// Flush any buffered output.
    fn flush(&mut self);
}

/// Human-readable console output.
pub struct ConsoleSink {
    /// Only steps that are multiples of this are printed (0 prints all).
    print_interval: u64,
}

impl ConsoleSink {
    /// Create a console sink printing every `print_interval`-th step.
    pub fn new(print_interval: u64) -> Self {
        Self { print_interval }
    }
}

impl MetricsSink for ConsoleSink {
    fn log_step(&mut self, step: u64, metrics: &[(String, f64)]) {
        if self.print_interval > 1 && step % self.print_interval != 0 {
            return;
        }
        let line = metrics
            .iter()
            .map(|(key, value)| format!("{key}={value:.4}"))
            .collect::<Vec<_>>()
            .join(" | ");
        println!("step {step:>8} | {line}");
    }

    fn flush(&mut self) {}
}

/// CSV file output in long format: `step,key,value`.
pub struct CsvSink {
    writer: BufWriter<File>,
}

impl CsvSink {
    /// Create a CSV sink writing to `path`.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "step,key,value")?;
        Ok(Self { writer })
    }
}

impl MetricsSink for CsvSink {
    fn log_step(&mut self, step: u64, metrics: &[(String, f64)]) {
        for (key, value) in metrics {
            let _ = writeln!(self.writer, "{step},{key},{value}");
        }
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Fan-out to multiple sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl MultiSink {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn add<S: MetricsSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricsSink for MultiSink {
    fn log_step(&mut self, step: u64, metrics: &[(String, f64)]) {
        for sink in &mut self.sinks {
            sink.log_step(step, metrics);
        }
    }

    fn flush(&mut self) {
        for sink in &mut self.sinks {
            sink.flush();
        }
    }
}

/// In-memory sink recording every flushed step. Used by tests.
#[derive(Default)]
pub struct MemorySink {
    steps: std::sync::Arc<parking_lot::Mutex<Vec<(u64, Vec<(String, f64)>)>>>,
}

impl MemorySink {
    /// Create an empty memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the recorded steps.
    pub fn handle(&self) -> std::sync::Arc<parking_lot::Mutex<Vec<(u64, Vec<(String, f64)>)>>> {
        self.steps.clone()
    }
}

impl MetricsSink for MemorySink {
    fn log_step(&mut self, step: u64, metrics: &[(String, f64)]) {
        self.steps.lock().push((step, metrics.to_vec()));
    }

    fn flush(&mut self) {}
}
