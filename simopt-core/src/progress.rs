use crate::space::ParameterVector;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Default number of events buffered before the oldest are dropped.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// The final summary of a run, as carried by a `complete` event and written
/// to the best-result file.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    #[serde(rename = "bestParameters")]
    pub best_parameters: Option<ParameterVector>,
    #[serde(rename = "bestKPIs")]
    pub best_kpis: BTreeMap<String, f64>,
    pub iterations: usize,
    /// Elapsed wall-clock seconds.
    #[serde(rename = "elapsedTime")]
    pub elapsed_time: f64,
}

/// A live progress event.
///
/// The serialised form is the wire contract consumed by external stream
/// boundaries; `objectiveValue` is null for failed iterations.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Step {
        step: u64,
        parameters: ParameterVector,
        kpis: BTreeMap<String, f64>,
        objective_value: Option<f64>,
        elapsed_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Complete {
        result: RunSummary,
    },
    Error {
        message: String,
    },
    /// Marker inserted where buffered events were discarded because no
    /// consumer kept up.
    Dropped {
        count: u64,
    },
}

impl ProgressEvent {
    fn closes_stream(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

#[derive(Debug)]
struct Shared {
    queue: VecDeque<ProgressEvent>,
    capacity: usize,
    dropped: u64,
    closed: bool,
}

/// Create a bounded progress channel.
///
/// The buffer holds at most `capacity` events; when it overflows, the oldest
/// event is discarded and counted, and the receiver sees a
/// [`ProgressEvent::Dropped`] marker in its place. A `complete` or `error`
/// event closes the stream: later sends are discarded and, once drained,
/// receives return `None`.
pub fn progress_channel(capacity: usize) -> (ProgressSender, ProgressReceiver) {
    let shared = Arc::new((
        Mutex::new(Shared {
            queue: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            dropped: 0,
            closed: false,
        }),
        Condvar::new(),
    ));
    (ProgressSender(shared.clone()), ProgressReceiver(shared))
}

#[derive(Debug, Clone)]
pub struct ProgressSender(Arc<(Mutex<Shared>, Condvar)>);

impl ProgressSender {
    /// Enqueue an event. Never blocks; on overflow the oldest event is
    /// dropped. Returns whether the event was accepted.
    pub fn send(&self, event: ProgressEvent) -> bool {
        let (lock, condvar) = &*self.0;
        let mut shared = lock.lock().expect("progress stream lock poisoned");

        if shared.closed {
            return false;
        }

        if shared.queue.len() >= shared.capacity {
            shared.queue.pop_front();
            shared.dropped += 1;
        }

        if event.closes_stream() {
            shared.closed = true;
        }
        shared.queue.push_back(event);

        condvar.notify_all();
        true
    }
}

#[derive(Debug)]
pub struct ProgressReceiver(Arc<(Mutex<Shared>, Condvar)>);

impl ProgressReceiver {
    /// Block until an event is available or the stream is closed and
    /// drained.
    pub fn recv(&self) -> Option<ProgressEvent> {
        let (lock, condvar) = &*self.0;
        let mut shared = lock.lock().expect("progress stream lock poisoned");

        loop {
            if let Some(event) = Self::pop(&mut shared) {
                return Some(event);
            }
            if shared.closed {
                return None;
            }
            shared = condvar.wait(shared).expect("progress stream lock poisoned");
        }
    }

    /// Like [`recv`](Self::recv) with an upper bound on the wait.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProgressEvent> {
        let (lock, condvar) = &*self.0;
        let mut shared = lock.lock().expect("progress stream lock poisoned");

        loop {
            if let Some(event) = Self::pop(&mut shared) {
                return Some(event);
            }
            if shared.closed {
                return None;
            }
            let (guard, result) = condvar
                .wait_timeout(shared, timeout)
                .expect("progress stream lock poisoned");
            shared = guard;
            if result.timed_out() {
                return Self::pop(&mut shared);
            }
        }
    }

    /// A non-blocking receive.
    pub fn try_recv(&self) -> Option<ProgressEvent> {
        let (lock, _) = &*self.0;
        let mut shared = lock.lock().expect("progress stream lock poisoned");
        Self::pop(&mut shared)
    }

    /// Drain the stream to completion, blocking between events.
    pub fn iter(&self) -> impl Iterator<Item = ProgressEvent> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    fn pop(shared: &mut Shared) -> Option<ProgressEvent> {
        if shared.dropped > 0 {
            let count = shared.dropped;
            shared.dropped = 0;
            return Some(ProgressEvent::Dropped { count });
        }
        shared.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParameterValue;

    fn step_event(step: u64) -> ProgressEvent {
        let mut parameters = ParameterVector::new();
        parameters.insert("a".to_string(), ParameterValue::F64(0.5));
        let mut kpis = BTreeMap::new();
        kpis.insert("score".to_string(), 1.5);
        ProgressEvent::Step {
            step,
            parameters,
            kpis,
            objective_value: Some(1.5),
            elapsed_ms: 12,
            error: None,
        }
    }

    #[test]
    fn test_events_flow_in_order() {
        let (sender, receiver) = progress_channel(8);
        sender.send(step_event(1));
        sender.send(step_event(2));

        assert_eq!(receiver.try_recv(), Some(step_event(1)));
        assert_eq!(receiver.try_recv(), Some(step_event(2)));
        assert_eq!(receiver.try_recv(), None);
    }

    #[test]
    fn test_overflow_drops_oldest_with_counter() {
        let (sender, receiver) = progress_channel(2);
        for step in 1..=5 {
            sender.send(step_event(step));
        }

        assert_eq!(receiver.try_recv(), Some(ProgressEvent::Dropped { count: 3 }));
        assert_eq!(receiver.try_recv(), Some(step_event(4)));
        assert_eq!(receiver.try_recv(), Some(step_event(5)));
        assert_eq!(receiver.try_recv(), None);
    }

    #[test]
    fn test_complete_closes_the_stream() {
        let (sender, receiver) = progress_channel(8);
        sender.send(step_event(1));
        assert!(sender.send(ProgressEvent::Complete {
            result: RunSummary {
                best_parameters: None,
                best_kpis: BTreeMap::new(),
                iterations: 1,
                elapsed_time: 0.5,
            }
        }));

        // Events after close are discarded.
        assert!(!sender.send(step_event(2)));

        assert_eq!(receiver.recv(), Some(step_event(1)));
        assert!(matches!(receiver.recv(), Some(ProgressEvent::Complete { .. })));
        assert_eq!(receiver.recv(), None);
    }

    #[test]
    fn test_recv_blocks_until_send() {
        let (sender, receiver) = progress_channel(8);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.send(step_event(1));
        });

        assert_eq!(receiver.recv(), Some(step_event(1)));
        handle.join().unwrap();
    }

    #[test]
    fn test_step_wire_form() {
        let event = step_event(3);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"step","step":3,"parameters":{"a":0.5},"kpis":{"score":1.5},"objectiveValue":1.5,"elapsedMs":12}"#
        );
    }

    #[test]
    fn test_failed_step_wire_form() {
        let event = ProgressEvent::Step {
            step: 4,
            parameters: ParameterVector::new(),
            kpis: BTreeMap::new(),
            objective_value: None,
            elapsed_ms: 7,
            error: Some("timeout".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"step","step":4,"parameters":{},"kpis":{},"objectiveValue":null,"elapsedMs":7,"error":"timeout"}"#
        );
    }

    #[test]
    fn test_complete_wire_form() {
        let mut best = ParameterVector::new();
        best.insert("a".to_string(), ParameterValue::Int(2));
        let mut kpis = BTreeMap::new();
        kpis.insert("score".to_string(), 2.0);

        let event = ProgressEvent::Complete {
            result: RunSummary {
                best_parameters: Some(best),
                best_kpis: kpis,
                iterations: 9,
                elapsed_time: 1.25,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"complete","result":{"bestParameters":{"a":2},"bestKPIs":{"score":2.0},"iterations":9,"elapsedTime":1.25}}"#
        );
    }

    #[test]
    fn test_error_wire_form() {
        let event = ProgressEvent::Error {
            message: "no objective".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"type":"error","message":"no objective"}"#
        );
    }
}
