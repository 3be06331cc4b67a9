//! Shared helpers for scenario tests

#![allow(dead_code)]

use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stepline::execution::{StepTrace, Tracer};
use stepline::persistence::Document;
use stepline::resource::{Declared, Level, ResourceError, SharedResource};

/// Tracer keeping every trace it receives
#[derive(Default)]
pub struct RecordingTracer {
    traces: Mutex<Vec<StepTrace>>,
}

impl RecordingTracer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn traces(&self) -> Vec<StepTrace> {
        self.traces.lock().unwrap().clone()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.traces().into_iter().map(|t| t.description).collect()
    }
}

impl Tracer for RecordingTracer {
    fn on_step(&self, trace: &StepTrace) {
        self.traces.lock().unwrap().push(trace.clone());
    }
}

/// Writer whose bytes can be read back after a console tracer wrote them
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap().clone();
        console::strip_ansi_codes(&String::from_utf8_lossy(&bytes)).to_string()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Ordered log shared between steps
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Ladder level counting its creations, failing while `failures` is non-zero
pub fn counting_level(key: &str, created: Arc<AtomicUsize>, failures: Arc<AtomicUsize>) -> Level {
    let name = key.to_string();
    Level::from_fn(key, move |_| {
        let created = created.clone();
        let failures = failures.clone();
        let name = name.clone();
        async move {
            let failing = failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ResourceError::failed(format!("{} unavailable", name)));
            }
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Declared::new(name) as SharedResource)
        }
    })
}

pub fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}
