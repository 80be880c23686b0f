//! Loaded scorer instances, one exclusive lock per instance.
//!
//! Cameras bound to the same instance queue on its lock; cameras on
//! different instances never wait for each other.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use ml_core::{Detection, Scorer, ScorerError};
use thiserror::Error;
use tracing::debug;
use video_ingest::Frame;

#[derive(Debug, Error)]
#[error("no scorer named {0:?} is loaded")]
pub struct UnknownScorer(pub String);

struct ScorerSlot {
    id: String,
    scorer: Mutex<Box<dyn Scorer>>,
    bindings: Mutex<BTreeSet<Arc<str>>>,
}

#[derive(Default)]
pub struct ScorerRegistry {
    slots: BTreeMap<String, Arc<ScorerSlot>>,
}

impl ScorerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance under `id`, replacing any previous one.
    pub fn insert(&mut self, id: impl Into<String>, scorer: Box<dyn Scorer>) {
        let id = id.into();
        self.slots.insert(
            id.clone(),
            Arc::new(ScorerSlot {
                id,
                scorer: Mutex::new(scorer),
                bindings: Mutex::new(BTreeSet::new()),
            }),
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Register `camera` as a user of `id`. The binding unregisters on drop.
    pub fn bind(&self, id: &str, camera: Arc<str>) -> Result<ScorerBinding, UnknownScorer> {
        let slot = self
            .slots
            .get(id)
            .cloned()
            .ok_or_else(|| UnknownScorer(id.to_string()))?;
        slot.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(camera.clone());
        debug!(camera = %camera, model = %id, "bound to scorer");
        Ok(ScorerBinding { slot, camera })
    }

    /// Cameras currently bound to `id`.
    pub fn bound_cameras(&self, id: &str) -> Vec<String> {
        self.slots.get(id).map_or_else(Vec::new, |slot| {
            slot.bindings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|c| c.to_string())
                .collect()
        })
    }
}

/// Timings of one scorer call.
#[derive(Debug, Clone, Copy)]
pub struct InferenceTiming {
    /// Time spent queued behind other cameras on the same instance.
    pub waited: Duration,
    pub inference: Duration,
}

/// A camera's handle on a shared scorer instance.
pub struct ScorerBinding {
    slot: Arc<ScorerSlot>,
    camera: Arc<str>,
}

impl ScorerBinding {
    pub fn model_id(&self) -> &str {
        &self.slot.id
    }

    /// Run the scorer under the instance lock.
    pub fn infer(&self, frame: &Frame) -> (Result<Vec<Detection>, ScorerError>, InferenceTiming) {
        let queued = Instant::now();
        // A panic inside another camera's inference leaves the scorer usable.
        let mut scorer = self.slot.scorer.lock().unwrap_or_else(PoisonError::into_inner);
        let started = Instant::now();
        let result = scorer.infer(frame);
        let timing = InferenceTiming {
            waited: started - queued,
            inference: started.elapsed(),
        };
        drop(scorer);
        metrics::histogram!("coalguard_inference_seconds", "model" => self.slot.id.clone())
            .record(timing.inference.as_secs_f64());
        metrics::histogram!("coalguard_inference_wait_seconds", "model" => self.slot.id.clone())
            .record(timing.waited.as_secs_f64());
        (result, timing)
    }
}

impl Drop for ScorerBinding {
    fn drop(&mut self) {
        self.slot
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.camera);
        debug!(camera = %self.camera, model = %self.slot.id, "unbound from scorer");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
    };

    use video_ingest::Resolution;

    use super::*;

    /// Records overlapping calls into a shared counter.
    struct Probe {
        busy: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
    }

    impl Scorer for Probe {
        fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>, ScorerError> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(20));
            self.busy.store(false, Ordering::SeqCst);
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "probe"
        }
    }

    fn frame() -> Frame {
        Frame::bgr8(vec![0; 12], Resolution::new(2, 2))
    }

    #[test]
    fn binding_tracks_cameras() {
        let mut registry = ScorerRegistry::new();
        registry.insert(
            "yolo",
            Box::new(Probe {
                busy: Arc::default(),
                overlaps: Arc::default(),
            }),
        );
        let a = registry.bind("yolo", "cam1".into()).unwrap();
        let b = registry.bind("yolo", "cam2".into()).unwrap();
        assert_eq!(registry.bound_cameras("yolo"), vec!["cam1", "cam2"]);
        drop(a);
        assert_eq!(registry.bound_cameras("yolo"), vec!["cam2"]);
        assert_eq!(b.model_id(), "yolo");
        assert!(registry.bind("missing", "cam1".into()).is_err());
    }

    #[test]
    fn shared_instance_is_serialized() {
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let mut registry = ScorerRegistry::new();
        registry.insert(
            "shared",
            Box::new(Probe {
                busy: busy.clone(),
                overlaps: overlaps.clone(),
            }),
        );
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let binding = registry.bind("shared", format!("cam{i}").into()).unwrap();
                thread::spawn(move || {
                    for _ in 0..3 {
                        binding.infer(&frame()).0.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn separate_instances_run_in_parallel() {
        let overlaps = Arc::new(AtomicUsize::new(0));
        let mut registry = ScorerRegistry::new();
        // Separate busy flags: each instance only sees its own calls.
        for id in ["a", "b"] {
            registry.insert(
                id,
                Box::new(Probe {
                    busy: Arc::default(),
                    overlaps: overlaps.clone(),
                }),
            );
        }
        let registry = Arc::new(registry);
        let a = registry.bind("a", "cam1".into()).unwrap();
        let b = registry.bind("b", "cam2".into()).unwrap();

        let started = Instant::now();
        let ta = thread::spawn(move || a.infer(&frame()).1);
        let tb = thread::spawn(move || b.infer(&frame()).1);
        let (ta, tb) = (ta.join().unwrap(), tb.join().unwrap());
        assert!(ta.waited < Duration::from_millis(15));
        assert!(tb.waited < Duration::from_millis(15));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
