//! Background visibility classification.
//!
//! One worker thread owns the `VisibilityEvaluator`. The render thread
//! submits jobs and polls for results; it never waits on the worker.
//! Results are published as immutable `Arc<VisibilitySnapshot>` values
//! swapped in under a short lock, so a reader either holds the old
//! snapshot or the new one, never a mix.
//!
//! Dataset, timestep and classification changes bump a generation
//! counter. The worker checks it before computing and again while
//! holding the publish lock; results for an older generation are
//! dropped. Camera-only requests keep the current generation so that
//! continuous camera motion cannot starve publication.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::core::types::Result;
use crate::math::Frustum;
use super::classify::{Classification, VisibilityEvaluator};
use super::snapshot::VisibilitySnapshot;

/// One classification request.
#[derive(Clone, Debug)]
pub struct VisibilityJob {
    pub generation: u64,
    pub frustum: Option<Frustum>,
    pub classification: Classification,
    pub timestep: u32,
}

/// State shared between the render thread and the worker.
struct Shared {
    generation: AtomicU64,
    version: AtomicU64,
    ready: AtomicBool,
    published: Mutex<Option<Arc<VisibilitySnapshot>>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }
}

pub struct AsyncVisibilityUpdater {
    shared: Arc<Shared>,
    jobs: Option<Sender<VisibilityJob>>,
    notify: Receiver<()>,
    worker: Option<JoinHandle<()>>,
    /// Snapshot the render thread is currently using
    current: Option<Arc<VisibilitySnapshot>>,
    classification: Classification,
    timestep: u32,
}

impl AsyncVisibilityUpdater {
    /// Start the worker thread.
    pub fn spawn(evaluator: VisibilityEvaluator, classification: Classification, timestep: u32) -> Result<Self> {
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            version: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            published: Mutex::new(None),
        });
        let (job_tx, job_rx) = unbounded();
        let (notify_tx, notify_rx) = bounded(1);

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("visibility".into())
            .spawn(move || run_worker(evaluator, job_rx, worker_shared, notify_tx))
            .map_err(|e| crate::core::Error::Worker(e.to_string()))?;

        Ok(Self {
            shared,
            jobs: Some(job_tx),
            notify: notify_rx,
            worker: Some(worker),
            current: None,
            classification,
            timestep,
        })
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Mark every in-flight or queued result stale. Returns the new generation.
    pub fn invalidate(&mut self) -> u64 {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("Visibility generation advanced to {}", generation);
        generation
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn set_classification(&mut self, classification: Classification) {
        self.classification = classification;
        self.invalidate();
    }

    pub fn timestep(&self) -> u32 {
        self.timestep
    }

    pub fn set_timestep(&mut self, timestep: u32) {
        if self.timestep != timestep {
            self.timestep = timestep;
            self.invalidate();
        }
    }

    /// Queue a classification for the current generation.
    pub fn request(&self, frustum: Option<Frustum>) -> Result<()> {
        let job = VisibilityJob {
            generation: self.generation(),
            frustum,
            classification: self.classification,
            timestep: self.timestep,
        };
        self.jobs
            .as_ref()
            .ok_or_else(|| crate::core::Error::Worker("visibility worker stopped".into()))?
            .send(job)
            .map_err(|_| crate::core::Error::Worker("visibility worker stopped".into()))
    }

    /// Pick up a newly published snapshot, if any.
    ///
    /// Returns the new snapshot when it replaced the current one. A
    /// published snapshot whose generation is no longer current is dropped.
    pub fn poll(&mut self) -> Option<Arc<VisibilitySnapshot>> {
        if !self.shared.ready.swap(false, Ordering::AcqRel) {
            return None;
        }
        let snapshot = self
            .shared
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        if !self.shared.is_current(snapshot.generation) {
            log::debug!(
                "Dropping visibility snapshot of generation {} (current {})",
                snapshot.generation,
                self.generation()
            );
            return None;
        }
        self.current = Some(snapshot.clone());
        Some(snapshot)
    }

    /// The snapshot in use, possibly stale with respect to the camera.
    pub fn current(&self) -> Option<&Arc<VisibilitySnapshot>> {
        self.current.as_ref()
    }

    /// Block up to `timeout` for a snapshot of the current generation.
    ///
    /// Only for startup and tests; the frame loop uses `poll`.
    pub fn wait_for_snapshot(&mut self, timeout: Duration) -> Option<Arc<VisibilitySnapshot>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(snapshot) = self.poll() {
                return Some(snapshot);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if self.notify.recv_timeout(remaining).is_err() {
                return self.poll();
            }
        }
    }
}

impl Drop for AsyncVisibilityUpdater {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Visibility worker panicked");
            }
        }
    }
}

fn run_worker(
    mut evaluator: VisibilityEvaluator,
    jobs: Receiver<VisibilityJob>,
    shared: Arc<Shared>,
    notify: Sender<()>,
) {
    let mut flags = Vec::new();
    while let Ok(mut job) = jobs.recv() {
        // Only the latest request matters
        while let Ok(newer) = jobs.try_recv() {
            job = newer;
        }
        if !shared.is_current(job.generation) {
            log::debug!("Skipping stale visibility job of generation {}", job.generation);
            continue;
        }

        let start = Instant::now();
        evaluator.set_timestep(job.timestep);
        let stats = match evaluator.classify_into(job.frustum.as_ref(), &job.classification, &mut flags) {
            Ok(stats) => stats,
            Err(e) => {
                log::error!("Visibility classification failed: {}", e);
                continue;
            }
        };

        let mut published = shared.published.lock().unwrap_or_else(PoisonError::into_inner);
        if !shared.is_current(job.generation) {
            log::debug!("Discarding visibility result of stale generation {}", job.generation);
            continue;
        }
        let version = shared.version.fetch_add(1, Ordering::AcqRel) + 1;
        *published = Some(Arc::new(VisibilitySnapshot::new(
            job.generation,
            version,
            job.timestep,
            job.classification,
            stats,
            std::mem::take(&mut flags),
        )));
        shared.ready.store(true, Ordering::Release);
        drop(published);
        let _ = notify.try_send(());

        log::debug!(
            "Published visibility v{} (generation {}) in {:.2}ms",
            version,
            job.generation,
            start.elapsed().as_secs_f64() * 1000.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    use crate::core::types::UVec3;
    use crate::volume::{BrickId, BrickIndex, BrickKey, MinMax, SyntheticVolume, VolumeDataset, VolumeField, VoxelFormat};

    const WAIT: Duration = Duration::from_secs(10);

    fn updater_for(volume: Arc<dyn VolumeDataset>, classification: Classification) -> AsyncVisibilityUpdater {
        let index = Arc::new(BrickIndex::from_dataset(volume.as_ref()).unwrap());
        AsyncVisibilityUpdater::spawn(VisibilityEvaluator::new(volume, index), classification, 0).unwrap()
    }

    fn radial() -> Arc<dyn VolumeDataset> {
        Arc::new(SyntheticVolume::new(UVec3::splat(64), UVec3::splat(16), 2, VolumeField::Radial))
    }

    /// Dataset that blocks its first range query until released.
    struct GatedVolume {
        inner: SyntheticVolume,
        gate: Mutex<Option<Receiver<()>>>,
        entered: Sender<()>,
    }

    impl VolumeDataset for GatedVolume {
        fn level_count(&self) -> u32 {
            self.inner.level_count()
        }
        fn brick_count(&self, level: u32) -> UVec3 {
            self.inner.brick_count(level)
        }
        fn domain_size(&self, level: u32) -> UVec3 {
            self.inner.domain_size(level)
        }
        fn brick_size(&self, key: BrickKey) -> UVec3 {
            self.inner.brick_size(key)
        }
        fn max_brick_size(&self) -> UVec3 {
            self.inner.max_brick_size()
        }
        fn brick_overlap(&self) -> UVec3 {
            self.inner.brick_overlap()
        }
        fn scale(&self) -> glam::Vec3 {
            self.inner.scale()
        }
        fn voxel_format(&self) -> VoxelFormat {
            self.inner.voxel_format()
        }
        fn scalar_range(&self, key: BrickKey, timestep: u32) -> MinMax {
            let gate = self.gate.lock().unwrap().take();
            if let Some(release) = gate {
                self.entered.send(()).unwrap();
                release.recv().unwrap();
            }
            self.inner.scalar_range(key, timestep)
        }
        fn gradient_range(&self, key: BrickKey, timestep: u32) -> MinMax {
            self.inner.gradient_range(key, timestep)
        }
        fn fetch_brick(&self, key: BrickKey, timestep: u32, out: &mut Vec<u8>) -> Result<()> {
            self.inner.fetch_brick(key, timestep, out)
        }
    }

    #[test]
    fn test_publishes_snapshot() {
        let mut updater = updater_for(radial(), Classification::ValueInterval(MinMax::new(1.0, 255.0)));
        assert!(updater.poll().is_none());
        updater.request(None).unwrap();

        let snapshot = updater.wait_for_snapshot(WAIT).unwrap();
        assert_eq!(snapshot.generation, 0);
        assert_eq!(snapshot.version, 1);
        assert!(!snapshot.is_empty());
        assert!(Arc::ptr_eq(updater.current().unwrap(), &snapshot));
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let (release_tx, release_rx) = bounded(1);
        let (entered_tx, entered_rx) = bounded(1);
        let volume = Arc::new(GatedVolume {
            inner: SyntheticVolume::new(UVec3::splat(32), UVec3::splat(16), 2, VolumeField::Radial),
            gate: Mutex::new(Some(release_rx)),
            entered: entered_tx,
        });
        let mut updater = updater_for(volume, Classification::IsoThreshold(128.0));

        updater.request(None).unwrap();
        entered_rx.recv_timeout(WAIT).unwrap();
        // Transfer function changes while the pass is in flight
        updater.set_classification(Classification::IsoThreshold(64.0));
        release_tx.send(()).unwrap();

        assert!(updater.wait_for_snapshot(Duration::from_millis(300)).is_none());
        assert!(updater.current().is_none());

        updater.request(None).unwrap();
        let snapshot = updater.wait_for_snapshot(WAIT).unwrap();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.classification, Classification::IsoThreshold(64.0));
    }

    #[test]
    fn test_camera_only_request_keeps_generation() {
        let mut updater = updater_for(radial(), Classification::IsoThreshold(128.0));
        updater.request(None).unwrap();
        let first = updater.wait_for_snapshot(WAIT).unwrap();
        updater.request(None).unwrap();
        let second = updater.wait_for_snapshot(WAIT).unwrap();
        assert_eq!(first.generation, second.generation);
        assert!(second.version > first.version);
    }

    #[test]
    fn test_reader_finishes_old_snapshot_during_publish() {
        let mut updater = updater_for(radial(), Classification::ValueInterval(MinMax::new(1.0, 255.0)));
        updater.request(None).unwrap();
        let old = updater.wait_for_snapshot(WAIT).unwrap();
        let expected: Vec<u8> = old.all_flags().iter().map(|f| f.bits()).collect();
        let half = old.len() / 2;

        let barrier = Arc::new(Barrier::new(2));
        let reader = {
            let old = old.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::with_capacity(old.len());
                for i in 0..half {
                    seen.push(old.flags(BrickId(i as u32)).bits());
                }
                // Next generation is published while we are mid-read
                barrier.wait();
                barrier.wait();
                for i in half..old.len() {
                    seen.push(old.flags(BrickId(i as u32)).bits());
                }
                (old.generation, seen)
            })
        };

        barrier.wait();
        updater.set_classification(Classification::ValueInterval(MinMax::new(254.0, 255.0)));
        updater.request(None).unwrap();
        let new = updater.wait_for_snapshot(WAIT).unwrap();
        barrier.wait();

        let (generation, seen) = reader.join().unwrap();
        assert_eq!(generation, 0);
        assert_eq!(seen, expected);
        assert_eq!(new.generation, 1);
        assert_ne!(new.all_flags(), old.all_flags());
    }

    #[test]
    fn test_timestep_change_invalidates() {
        let volume: Arc<dyn VolumeDataset> = Arc::new(
            SyntheticVolume::new(UVec3::splat(32), UVec3::splat(16), 2, VolumeField::Radial).with_timesteps(3),
        );
        let mut updater = updater_for(volume, Classification::IsoThreshold(128.0));
        updater.set_timestep(0);
        assert_eq!(updater.generation(), 0);
        updater.set_timestep(2);
        assert_eq!(updater.generation(), 1);

        updater.request(None).unwrap();
        let snapshot = updater.wait_for_snapshot(WAIT).unwrap();
        assert_eq!(snapshot.timestep, 2);
    }
}
