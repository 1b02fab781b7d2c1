//! # Annotations
//!
//! Structured event bus wrapping the matcher and executor. Every matcher
//! call, join, expression batch, subquery boundary, and rewrite emits an
//! event to an optional handler. Handlers run synchronously on the emitting
//! thread and must be cheap or offload; they are strict decorators and
//! never alter results.
//!
//! Reserved names: `plan/cache.hit`, `plan/cache.miss`, `plan/rewrite.*`,
//! `phase/begin`, `phase/end`, `pattern/multi-match`,
//! `pattern/storage-scan`, `join/build`, `join/probe`, `subquery/begin`,
//! `subquery/end`, `aggregation/executed`.

use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One pipeline event.
#[derive(Debug, Clone)]
pub struct Annotation {
    /// Reserved event name, e.g. `pattern/storage-scan`
    pub name: String,
    /// When the annotated operation started
    pub ts: Instant,
    /// How long the annotated operation took
    pub latency: Duration,
    /// Executing phase, when the event is phase-scoped
    pub phase_id: Option<usize>,
    /// Event payload
    pub data: BTreeMap<String, Value>,
}

/// Receives events. Must be thread-safe when parallel subqueries are
/// enabled.
pub trait AnnotationHandler: Send + Sync {
    fn handle(&self, event: &Annotation);
}

/// Cloneable dispatch point carried by the query context.
///
/// With no handler installed every emit is a no-op beyond a `trace!` log
/// line.
#[derive(Clone, Default)]
pub struct AnnotationBus {
    handler: Option<Arc<dyn AnnotationHandler>>,
}

impl AnnotationBus {
    pub fn new(handler: Arc<dyn AnnotationHandler>) -> Self {
        AnnotationBus {
            handler: Some(handler),
        }
    }

    pub fn disabled() -> Self {
        AnnotationBus { handler: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.handler.is_some()
    }

    /// Emit an event with a latency measured from `started`.
    pub fn emit(
        &self,
        name: &str,
        phase_id: Option<usize>,
        started: Instant,
        data: impl IntoIterator<Item = (&'static str, Value)>,
    ) {
        let latency = started.elapsed();
        tracing::trace!(target: "tetrad::annotations", name, ?latency, phase = ?phase_id);
        if let Some(handler) = &self.handler {
            let data = data
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            handler.handle(&Annotation {
                name: name.to_string(),
                ts: started,
                latency,
                phase_id,
                data,
            });
        }
    }

    /// Emit a point event (no meaningful duration).
    pub fn emit_point(
        &self,
        name: &str,
        phase_id: Option<usize>,
        data: impl IntoIterator<Item = (&'static str, Value)>,
    ) {
        self.emit(name, phase_id, Instant::now(), data);
    }
}

/// Handler that records every event; used by tests and diagnostics.
#[derive(Default)]
pub struct CollectingHandler {
    events: Mutex<Vec<Annotation>>,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(CollectingHandler::default())
    }

    pub fn events(&self) -> Vec<Annotation> {
        self.events.lock().clone()
    }

    /// Events with the given name, in emission order.
    pub fn named(&self, name: &str) -> Vec<Annotation> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }
}

impl AnnotationHandler for CollectingHandler {
    fn handle(&self, event: &Annotation) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_handler_records_in_order() {
        let handler = CollectingHandler::new();
        let bus = AnnotationBus::new(handler.clone());
        bus.emit_point("phase/begin", Some(0), [("clauses", Value::Int64(2))]);
        bus.emit_point("phase/end", Some(0), []);
        let events = handler.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "phase/begin");
        assert_eq!(events[0].phase_id, Some(0));
        assert_eq!(events[0].data["clauses"], Value::Int64(2));
    }

    #[test]
    fn test_disabled_bus_is_noop() {
        let bus = AnnotationBus::disabled();
        assert!(!bus.is_enabled());
        bus.emit_point("join/build", None, []);
    }
}
