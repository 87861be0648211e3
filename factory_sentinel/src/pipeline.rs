// THEORY:
// The `pipeline` module is the top-level API of the sentinel. `SentinelPipeline`
// drives everything from a single cooperative loop:
//
//   capture -> throttle check -> classify (with failover) -> decode -> persist -> dispatch
//
// Key architectural principles:
// 1.  **Latest frame wins**: every iteration pulls the current frame and drops it
//     unless an analysis is due. Frames are never queued.
// 2.  **Throttle on submission**: the interval clock resets when a frame is
//     *submitted*, not when its result arrives. A slow or failed call cannot make
//     analyses pile up faster than the interval allows.
// 3.  **One analysis in flight**: the classifier call is awaited inline, which
//     back-pressures capture for its duration. It is bounded by the selector's
//     timeout.
// 4.  **Failure isolation**: nothing that goes wrong with one frame ends the loop.
//     Only a configuration error (no viable backend at all) is fatal.

use crate::config::SentinelConfig;
use crate::core_modules::backend_selector::BackendSelector;
use crate::core_modules::classifier::SAFETY_PROMPT;
use crate::core_modules::dispatcher::{AlertDispatcher, DispatchReport};
use crate::core_modules::frame_source::FrameSource;
use crate::core_modules::state_store::{LiveState, StateStore};
use crate::core_modules::utils::image_helper::image_helper::encode_analysis_jpeg;
use crate::core_modules::verdict::Verdict;
use crate::error::{ConfigurationError, PersistenceError, SelectionError, SentinelError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::dispatcher::NotificationOutcome;
pub use crate::core_modules::verdict::SafetyStatus;

/// The scheduling subset of `SentinelConfig`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub analysis_interval: Duration,
    pub frame_period: Duration,
    pub frame_width: u32,
    pub frame_height: u32,
    pub jpeg_quality: u8,
}

impl From<&SentinelConfig> for PipelineConfig {
    fn from(config: &SentinelConfig) -> Self {
        Self {
            analysis_interval: config.analysis_interval,
            frame_period: config.frame_period,
            frame_width: config.frame_width,
            frame_height: config.frame_height,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// Everything that came out of one successful classification.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub backend: String,
    pub verdict: Verdict,
    pub state_written: bool,
    pub frame_written: bool,
    pub dispatch: DispatchReport,
}

/// The result of a single loop iteration.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// The interval has not elapsed; the frame was dropped.
    Waiting,
    /// The source or the encoder could not produce a frame.
    FrameUnavailable,
    /// A backend replied but the reply is not a verdict.
    DecodeFailed,
    /// Every backend failed for this frame.
    AllBackendsFailed,
    Analyzed(Box<AnalysisReport>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub iterations: u64,
    pub submissions: u64,
    pub verdicts: u64,
    pub dangers: u64,
    pub decode_failures: u64,
    pub backend_exhaustions: u64,
    pub frame_errors: u64,
    pub persistence_failures: u64,
}

/// Stops a running pipeline from another task.
#[derive(Clone)]
pub struct ControlHandle {
    stop_tx: Arc<watch::Sender<bool>>,
}

impl ControlHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            Self {
                stop_tx: Arc::new(stop_tx),
            },
            stop_rx,
        )
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

pub struct SentinelPipeline<S: FrameSource> {
    source: S,
    selector: BackendSelector,
    dispatcher: AlertDispatcher,
    store: StateStore,
    config: PipelineConfig,
    last_submission: Option<Instant>,
    stats: PipelineStats,
}

impl<S: FrameSource> SentinelPipeline<S> {
    pub fn new(
        config: PipelineConfig,
        source: S,
        selector: BackendSelector,
        dispatcher: AlertDispatcher,
        store: StateStore,
    ) -> Self {
        Self {
            source,
            selector,
            dispatcher,
            store,
            config,
            last_submission: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn last_submission(&self) -> Option<Instant> {
        self.last_submission
    }

    /// Validates the backend catalog, then loops until `shutdown` flips to
    /// `true` or its sender goes away.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<PipelineStats, SentinelError> {
        let backend = self.selector.initialize().await?.identifier.clone();
        info!(
            backend = %backend,
            interval_secs = self.config.analysis_interval.as_secs_f64(),
            "sentinel started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick().await?;
            tokio::select! {
                _ = tokio::time::sleep(self.config.frame_period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(stats = ?self.stats, "sentinel stopped");
        Ok(self.stats)
    }

    /// One iteration: take the current frame and analyze it if the interval
    /// since the last submission has elapsed.
    pub async fn tick(&mut self) -> Result<TickOutcome, ConfigurationError> {
        self.stats.iterations += 1;

        let frame = match self.source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.frame_errors += 1;
                warn!(error = %e, "frame source failed");
                return Ok(TickOutcome::FrameUnavailable);
            }
        };

        let now = Instant::now();
        if !self.analysis_due(now) {
            return Ok(TickOutcome::Waiting);
        }
        self.last_submission = Some(now);

        let jpeg = match encode_analysis_jpeg(
            &frame,
            self.config.frame_width,
            self.config.frame_height,
            self.config.jpeg_quality,
        ) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                self.stats.frame_errors += 1;
                warn!(error = %e, "could not encode frame");
                return Ok(TickOutcome::FrameUnavailable);
            }
        };

        self.analyze(jpeg).await
    }

    fn analysis_due(&self, now: Instant) -> bool {
        match self.last_submission {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.config.analysis_interval,
        }
    }

    async fn analyze(&mut self, jpeg: Vec<u8>) -> Result<TickOutcome, ConfigurationError> {
        self.stats.submissions += 1;
        info!(bytes = jpeg.len(), "scanning frame");

        let classification = match self.selector.classify(&jpeg, SAFETY_PROMPT).await {
            Ok(classification) => classification,
            Err(SelectionError::Configuration(e)) => return Err(e),
            Err(SelectionError::Exhausted { attempts, last }) => {
                self.stats.backend_exhaustions += 1;
                error!(attempts, last_error = %last, "all backends failed for this frame");
                return Ok(TickOutcome::AllBackendsFailed);
            }
        };

        let verdict = match Verdict::decode(&classification.reply) {
            Ok(verdict) => verdict,
            Err(e) => {
                self.stats.decode_failures += 1;
                warn!(
                    backend = %classification.backend,
                    reply = %classification.reply,
                    error = %e,
                    "reply is not a verdict"
                );
                return Ok(TickOutcome::DecodeFailed);
            }
        };

        self.stats.verdicts += 1;
        if verdict.is_danger() {
            self.stats.dangers += 1;
        }
        info!(
            backend = %classification.backend,
            status = %verdict.status(),
            issue = verdict.issue().unwrap_or_default(),
            confidence = ?verdict.confidence(),
            "verdict"
        );

        let live_state = LiveState::from_verdict(&verdict, &classification.backend);
        let state_written = self.persist("live state", |store| store.write_live_state(&live_state));
        let frame_written = self.persist("frame artifact", |store| store.write_frame(&jpeg));

        let dispatch = self.dispatcher.dispatch(&verdict, Instant::now()).await;

        Ok(TickOutcome::Analyzed(Box::new(AnalysisReport {
            backend: classification.backend,
            verdict,
            state_written,
            frame_written,
            dispatch,
        })))
    }

    fn persist<F>(&mut self, what: &str, write: F) -> bool
    where
        F: FnOnce(&StateStore) -> Result<(), PersistenceError>,
    {
        match write(&self.store) {
            Ok(()) => true,
            Err(e) => {
                self.stats.persistence_failures += 1;
                error!(error = %e, "failed to write {what}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::backend_selector::BackendCatalog;
    use crate::core_modules::classifier::Classifier;
    use crate::core_modules::frame_source::LoopingFrames;
    use crate::error::{BackendError, FrameError};
    use futures::future::BoxFuture;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::sync::Mutex;

    /// Replies with `reply` after `latency`, recording submission instants.
    struct TimedClassifier {
        reply: String,
        latency: Duration,
        submissions: Mutex<Vec<Instant>>,
    }

    impl TimedClassifier {
        fn new(reply: &str, latency: Duration) -> Self {
            Self {
                reply: reply.to_string(),
                latency,
                submissions: Mutex::new(Vec::new()),
            }
        }
    }

    impl Classifier for TimedClassifier {
        fn classify<'a>(
            &'a self,
            _backend: &'a str,
            _image_jpeg: &'a [u8],
            _prompt: &'a str,
        ) -> BoxFuture<'a, Result<String, BackendError>> {
            Box::pin(async move {
                self.submissions.lock().unwrap().push(Instant::now());
                tokio::time::sleep(self.latency).await;
                Ok(self.reply.clone())
            })
        }

        fn probe<'a>(&'a self, _backend: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn frames() -> LoopingFrames {
        let frame = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([40, 90, 140])));
        LoopingFrames::new(vec![frame]).unwrap()
    }

    fn config(interval: Duration) -> PipelineConfig {
        PipelineConfig {
            analysis_interval: interval,
            frame_period: Duration::from_millis(100),
            frame_width: 64,
            frame_height: 48,
            jpeg_quality: 80,
        }
    }

    fn pipeline<S: FrameSource>(
        source: S,
        classifier: Arc<dyn Classifier>,
        interval: Duration,
        dir: &std::path::Path,
    ) -> SentinelPipeline<S> {
        let store = StateStore::new(dir);
        let selector = BackendSelector::new(classifier, BackendCatalog::new(["alpha"]));
        let dispatcher = AlertDispatcher::new(store.clone(), "Camera-01");
        SentinelPipeline::new(config(interval), source, selector, dispatcher, store)
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_respect_minimum_interval() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(TimedClassifier::new(r#"{"status":"SAFE"}"#, Duration::ZERO));
        let interval = Duration::from_secs(5);
        let mut pipeline = pipeline(frames(), classifier.clone(), interval, dir.path());

        for _ in 0..300 {
            pipeline.tick().await.unwrap();
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        let submissions = classifier.submissions.lock().unwrap().clone();
        assert_eq!(submissions.len(), 6);
        for pair in submissions.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
        assert_eq!(pipeline.stats().iterations, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_clock_resets_at_submission_not_completion() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(TimedClassifier::new(r#"{"status":"SAFE"}"#, Duration::from_secs(3)));
        let interval = Duration::from_secs(5);
        let mut pipeline = pipeline(frames(), classifier.clone(), interval, dir.path());

        let start = Instant::now();
        assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Analyzed(_)));
        assert_eq!(pipeline.last_submission(), Some(start));

        // Three seconds were spent classifying; two more make the interval.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Waiting));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::Analyzed(_)));

        let submissions = classifier.submissions.lock().unwrap().clone();
        assert_eq!(submissions[1] - submissions[0], interval);
    }

    #[tokio::test]
    async fn decode_failure_writes_nothing_and_does_not_fail_over() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(TimedClassifier::new("I think it is fine", Duration::ZERO));
        let mut pipeline = pipeline(frames(), classifier.clone(), Duration::from_secs(5), dir.path());

        assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::DecodeFailed));

        assert_eq!(classifier.submissions.lock().unwrap().len(), 1);
        assert_eq!(pipeline.selector().stats().failovers, 0);
        assert_eq!(pipeline.store().read_live_state(), None);
        assert_eq!(pipeline.store().read_frame(), None);
        assert_eq!(pipeline.stats().decode_failures, 1);
    }

    #[tokio::test]
    async fn frame_source_failure_skips_the_iteration() {
        struct Broken;
        impl FrameSource for Broken {
            fn next_frame(&mut self) -> Result<DynamicImage, FrameError> {
                Err(FrameError::Device("camera unplugged".into()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(TimedClassifier::new(r#"{"status":"SAFE"}"#, Duration::ZERO));
        let mut pipeline = pipeline(Broken, classifier.clone(), Duration::from_secs(5), dir.path());

        assert!(matches!(pipeline.tick().await.unwrap(), TickOutcome::FrameUnavailable));
        assert!(classifier.submissions.lock().unwrap().is_empty());
        assert_eq!(pipeline.last_submission(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_signal() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(TimedClassifier::new(r#"{"status":"SAFE"}"#, Duration::ZERO));
        let mut pipeline = pipeline(frames(), classifier, Duration::from_secs(5), dir.path());
        let (control, shutdown) = ControlHandle::new();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            control.stop();
        });
        let stats = pipeline.run(shutdown).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(stats.submissions, 3);
        assert_eq!(stats.verdicts, 3);
    }

    #[tokio::test]
    async fn run_refuses_to_start_without_a_viable_backend() {
        struct Dead;
        impl Classifier for Dead {
            fn classify<'a>(
                &'a self,
                _backend: &'a str,
                _image_jpeg: &'a [u8],
                _prompt: &'a str,
            ) -> BoxFuture<'a, Result<String, BackendError>> {
                Box::pin(async { Err(BackendError::Auth("key revoked".into())) })
            }
            fn probe<'a>(&'a self, _backend: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
                Box::pin(async { Err(BackendError::Auth("key revoked".into())) })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(frames(), Arc::new(Dead), Duration::from_secs(5), dir.path());
        let (_control, shutdown) = ControlHandle::new();

        let err = pipeline.run(shutdown).await.unwrap_err();
        assert!(matches!(
            err,
            SentinelError::Configuration(ConfigurationError::NoViableBackend { tried: 1 })
        ));
        assert_eq!(pipeline.stats().iterations, 0);
    }
}
