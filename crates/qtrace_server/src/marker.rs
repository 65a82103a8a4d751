//! The tracepoint fabric: named markers, attach semaphores, and the
//! emission macro.
//!
//! A marker is a named emission point with up to twelve pointer-width
//! payload slots. Every marker carries a process-wide semaphore counter;
//! when no observer is attached the call site costs one atomic load and an
//! untaken branch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// Compile-time maximum number of payload slots per marker.
pub const MAX_MARKER_ARGS: usize = 12;

/// Index of a registered marker. Stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerId(pub u32);

/// Receives fired markers. Installed by the probe transport when a
/// collector session attaches.
pub trait MarkerObserver: Send + Sync {
    fn marker(&self, backend_pid: u32, marker: MarkerId, args: &[u64], payload: Option<&[u8]>);
}

/// Process-wide marker registry. The full marker set is fixed at
/// construction so the semaphore array never moves.
pub struct TracepointFabric {
    names: Vec<String>,
    by_name: HashMap<String, MarkerId>,
    semaphores: Vec<AtomicU32>,
    observer: RwLock<Option<Arc<dyn MarkerObserver>>>,
}

impl TracepointFabric {
    pub fn new(marker_names: impl IntoIterator<Item = String>) -> Self {
        let names: Vec<String> = marker_names.into_iter().collect();
        let by_name = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), MarkerId(idx as u32)))
            .collect();
        let semaphores = names.iter().map(|_| AtomicU32::new(0)).collect();
        Self {
            names,
            by_name,
            semaphores,
            observer: RwLock::new(None),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<MarkerId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, marker: MarkerId) -> Option<&str> {
        self.names.get(marker.0 as usize).map(String::as_str)
    }

    /// All registered markers, in id order.
    pub fn marker_names(&self) -> &[String] {
        &self.names
    }

    /// True when the marker's semaphore is held by at least one attach.
    #[inline]
    pub fn is_enabled(&self, marker: MarkerId) -> bool {
        self.semaphores
            .get(marker.0 as usize)
            .map(|sem| sem.load(Ordering::Relaxed) > 0)
            .unwrap_or(false)
    }

    /// Increment the semaphore for one attach. Returns false for unknown
    /// markers.
    pub fn attach(&self, name: &str) -> bool {
        match self.lookup(name) {
            Some(id) => {
                self.semaphores[id.0 as usize].fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Decrement the semaphore for one detach, saturating at zero.
    pub fn detach(&self, name: &str) {
        if let Some(id) = self.lookup(name) {
            let sem = &self.semaphores[id.0 as usize];
            let _ = sem.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_sub(1)
            });
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn MarkerObserver>) {
        *self
            .observer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self
            .observer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    /// Fire a marker. A marker that has committed to firing completes its
    /// emission even if a detach races it.
    pub fn emit(&self, backend_pid: u32, marker: MarkerId, args: &[u64]) {
        self.emit_with_payload(backend_pid, marker, args, None);
    }

    /// Fire a marker with a scratch-copied payload (the features structs,
    /// which are too wide for argument slots).
    pub fn emit_with_payload(
        &self,
        backend_pid: u32,
        marker: MarkerId,
        args: &[u64],
        payload: Option<&[u8]>,
    ) {
        debug_assert!(args.len() <= MAX_MARKER_ARGS);
        if !self.is_enabled(marker) {
            return;
        }
        let observer = self
            .observer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(observer) = observer {
            observer.marker(backend_pid, marker, args, payload);
        }
    }
}

/// Fire a named marker when its semaphore is held. Arguments are promoted
/// to pointer width and evaluated left to right, only when the marker is
/// enabled; argument side effects must not be load-bearing.
#[macro_export]
macro_rules! marker {
    ($fabric:expr, $pid:expr, $marker:expr $(, $arg:expr)* $(,)?) => {{
        const _: () = assert!(
            0usize $(+ { let _ = stringify!($arg); 1usize })* <= $crate::marker::MAX_MARKER_ARGS,
            "markers carry at most 12 payload slots",
        );
        let fabric = &$fabric;
        let marker = $marker;
        if fabric.is_enabled(marker) {
            let args = [$(($arg) as u64),*];
            fabric.emit($pid, marker, &args);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        events: Mutex<Vec<(u32, MarkerId, Vec<u64>)>>,
    }

    impl MarkerObserver for Recorder {
        fn marker(&self, backend_pid: u32, marker: MarkerId, args: &[u64], _payload: Option<&[u8]>) {
            self.events
                .lock()
                .unwrap()
                .push((backend_pid, marker, args.to_vec()));
        }
    }

    fn fabric() -> TracepointFabric {
        TracepointFabric::new(["a_begin".to_string(), "a_end".to_string()])
    }

    #[test]
    fn markers_are_silent_without_attach() {
        let fabric = fabric();
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        fabric.set_observer(recorder.clone());
        let id = fabric.lookup("a_begin").unwrap();
        marker!(fabric, 1, id, 7);
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn attach_detach_toggles_the_semaphore() {
        let fabric = fabric();
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        fabric.set_observer(recorder.clone());
        assert!(fabric.attach("a_begin"));
        let id = fabric.lookup("a_begin").unwrap();
        marker!(fabric, 9, id, 7, -1i32);
        fabric.detach("a_begin");
        marker!(fabric, 9, id, 8);
        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 9);
        assert_eq!(events[0].2, vec![7u64, (-1i32) as u64]);
    }

    #[test]
    fn detach_saturates_at_zero() {
        let fabric = fabric();
        fabric.detach("a_begin");
        assert!(fabric.attach("a_begin"));
        assert!(fabric.is_enabled(fabric.lookup("a_begin").unwrap()));
        fabric.detach("a_begin");
        assert!(!fabric.is_enabled(fabric.lookup("a_begin").unwrap()));
    }

    #[test]
    fn unknown_marker_attach_is_rejected() {
        let fabric = fabric();
        assert!(!fabric.attach("nope"));
    }
}
