//! Step tracing - observers notified before each step runs

use crate::core::step::StepKind;
use console::style;
use std::io::Write;
use std::sync::Mutex;

/// How the traced scope relates to the one that continued into it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// First step of an invocation started without a caller
    Entered,
    /// Next step of the scope traced just before
    Sequential,
    /// Resumed by a deeper scope finishing
    Ascended,
    /// Started by a shallower scope
    Descended,
    /// Resumed after another scope was traced in between
    Interrupted,
}

/// One trace line worth of information
#[derive(Debug, Clone)]
pub struct StepTrace {
    pub kind: StepKind,
    pub relation: Relation,
    pub scope_id: u64,
    /// Stable color class of the scope id
    pub color: usize,
    pub depth: usize,
    pub description: String,
    pub watch: Option<String>,
}

/// Observer of step execution
///
/// Implementations must not block; they run inline with the pipeline.
pub trait Tracer: Send + Sync {
    fn on_step(&self, trace: &StepTrace);
}

/// Number of distinct color classes used for scope ids
pub const PALETTE_SIZE: u64 = 4;

pub fn color_class(scope_id: u64) -> usize {
    (scope_id % PALETTE_SIZE) as usize
}

/// Renders traces as an indented tree on a terminal
pub struct ConsoleTracer {
    out: Mutex<Box<dyn Write + Send>>,
    indent: usize,
}

impl ConsoleTracer {
    pub fn new(out: Box<dyn Write + Send>, indent: usize) -> Self {
        Self {
            out: Mutex::new(out),
            indent,
        }
    }

    pub fn stderr(indent: usize) -> Self {
        Self::new(Box::new(std::io::stderr()), indent)
    }

    /// Format a trace without writing it
    pub fn render(&self, trace: &StepTrace) -> String {
        let width = trace.depth * self.indent;
        let arrow = match trace.relation {
            Relation::Entered => format!("{:>w$}", "→", w = width + 1),
            Relation::Sequential => format!("{:>w$}", "↑", w = width + 1),
            Relation::Ascended => format!("{:>w$}", "↗", w = width + 1),
            Relation::Descended => format!("{:>w$}", "↖", w = width + 1),
            Relation::Interrupted => format!("{:─<w$}←", "", w = width),
        };

        let id = format!("{:>5}", trace.scope_id);
        let id = match trace.color {
            0 => style(id).green(),
            1 => style(id).yellow(),
            2 => style(id).blue().bright(),
            _ => style(id).magenta(),
        };

        let description = match trace.kind {
            StepKind::Step => style(trace.description.clone()),
            StepKind::Catch => style(trace.description.clone()).red().bright(),
        };

        match &trace.watch {
            Some(watch) => format!("{} {} {} ({})", id, arrow, description, watch),
            None => format!("{} {} {}", id, arrow, description),
        }
    }
}

impl Tracer for ConsoleTracer {
    fn on_step(&self, trace: &StepTrace) {
        let line = self.render(trace);
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{}", line);
        }
    }
}

/// Emits traces as `tracing` debug events
#[derive(Debug, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn on_step(&self, trace: &StepTrace) {
        tracing::debug!(
            scope_id = trace.scope_id,
            depth = trace.depth,
            kind = ?trace.kind,
            relation = ?trace.relation,
            watch = trace.watch.as_deref().unwrap_or(""),
            "{}",
            trace.description
        );
    }
}
