// Batch orchestration: worker pool, retry/failover loop, ordered results
//
// One orchestrator per provider. A batch is split into scheduling units (one
// image, or a group sharing a single provider call); a pool of workers pulls
// units off a shared queue. Every attempt goes through the rate limiter's
// atomic acquire, so no worker can sneak past a full window. Results land in
// their input slot regardless of completion order.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::core::config::{BatchConfig, Config};
use crate::core::errors::{BatchError, PoolError, ProviderError};
use crate::core::types::{
    ImageInput, ImageTask, MetadataResult, ProgressSnapshot, PromptSettings, ProviderStats,
    SchedulingStrategy,
};
use crate::middleware::{Acquire, CredentialPool, CredentialView, RateLimiter};
use crate::orchestration::progress::ProgressTracker;
use crate::providers::{ProviderAdapter, ProviderKind};
use crate::utils::metrics::Metrics;

/// Invoked with each finished result in completion order.
pub type ItemCallback = Arc<dyn Fn(&MetadataResult) + Send + Sync>;

/// One scheduling unit: the images that share a single provider call and a
/// single retry budget.
struct Unit {
    tasks: Vec<ImageTask>,
}

/// Releases the single-batch guard when a run ends on any path.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BatchOrchestrator {
    kind: ProviderKind,
    batch: BatchConfig,
    adapter: Arc<dyn ProviderAdapter>,
    pool: Arc<CredentialPool>,
    limiter: Arc<RateLimiter>,
    progress: Arc<ProgressTracker>,
    metrics: Arc<Metrics>,
    cancel: AtomicBool,
    running: AtomicBool,
}

impl BatchOrchestrator {
    pub fn new(
        kind: ProviderKind,
        adapter: Arc<dyn ProviderAdapter>,
        pool: Arc<CredentialPool>,
        limiter: Arc<RateLimiter>,
        batch: BatchConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            kind,
            batch,
            adapter,
            pool,
            limiter,
            progress: Arc::new(ProgressTracker::new()),
            metrics,
            cancel: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Orchestrator with the provider's standard rate policy.
    pub fn from_config(
        kind: ProviderKind,
        adapter: Arc<dyn ProviderAdapter>,
        pool: Arc<CredentialPool>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limiter = Arc::new(kind.rate_limiter(config.providers.openrouter_has_credits));
        Self::new(kind, adapter, pool, limiter, config.batch.clone(), metrics)
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Request cooperative cancellation of the running batch. Workers finish
    /// their in-flight provider call and then drain.
    pub fn stop(&self) {
        info!("Stop requested for {} batch", self.kind);
        self.cancel.store(true, Ordering::SeqCst);
        self.progress.mark_stopped();
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub async fn stats(&self) -> ProviderStats {
        ProviderStats {
            provider: self.kind,
            total_credentials: self.pool.len().await,
            valid_credentials: self.pool.valid_count().await,
            total_requests: self.pool.total_requests().await,
            requests_per_minute: self.limiter.current_minute_count(),
        }
    }

    pub async fn credentials(&self) -> Vec<CredentialView> {
        self.pool.views().await
    }

    /// Register a credential; it stays out of scheduling until validated.
    pub async fn add_credential(&self, secret: &str, display_name: &str) -> CredentialView {
        let c = self.pool.add(secret, display_name).await;
        CredentialView {
            id: c.id,
            display_name: c.display_name,
            is_valid: c.is_valid,
            request_count: c.request_count,
        }
    }

    /// Probe a credential with a minimal provider call. Only a definitive
    /// auth rejection marks it invalid; transient failures leave it as-is.
    pub async fn validate_credential(&self, id: &str) -> Result<bool, PoolError> {
        let credential = self
            .pool
            .get(id)
            .await
            .ok_or_else(|| PoolError::UnknownCredential(id.to_string()))?;

        match self.adapter.validate(&credential.secret).await {
            Ok(()) => {
                self.pool.set_valid(id, true).await;
                Ok(true)
            }
            Err(e) if e.is_auth() => {
                self.pool.set_valid(id, false).await;
                Ok(false)
            }
            Err(e) => {
                warn!("Validation of {} inconclusive: {}", id, e);
                Ok(credential.is_valid)
            }
        }
    }

    pub async fn remove_credential(&self, id: &str) -> bool {
        let removed = self.pool.remove(id).await;
        if removed {
            self.limiter.reset(id);
        }
        removed
    }

    /// Run a batch to completion (or cancellation). Returns the finished
    /// results in input order; unprocessed items after a stop are simply
    /// absent. Per-item failures come back as `failed=true` results, never
    /// as an `Err`.
    pub async fn run_batch(
        self: Arc<Self>,
        images: Vec<ImageInput>,
        settings: PromptSettings,
        strategy: SchedulingStrategy,
        on_item: Option<ItemCallback>,
    ) -> Result<Vec<MetadataResult>, BatchError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BatchError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let valid = self.pool.list_valid().await;
        if valid.is_empty() {
            return Err(BatchError::NoValidCredentials {
                provider: self.kind.name().to_string(),
            });
        }

        let total = images.len();
        self.cancel.store(false, Ordering::SeqCst);
        self.progress.begin(total);
        if total == 0 {
            return Ok(Vec::new());
        }

        let model = settings
            .model
            .clone()
            .unwrap_or_else(|| self.adapter.model().to_string());
        let units = Self::partition(images, strategy, self.batch.group_size);
        let workers = valid.len().min(self.batch.max_parallel).max(1);
        info!(
            "Starting {} batch: {} image(s), {} unit(s), {} worker(s), model {}",
            self.kind,
            total,
            units.len(),
            workers,
            model
        );

        let queue = Arc::new(Mutex::new(units.into_iter().collect::<VecDeque<_>>()));
        let results: Arc<Mutex<Vec<Option<MetadataResult>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let this = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let settings = settings.clone();
            let model = model.clone();
            let on_item = on_item.clone();
            handles.push(tokio::spawn(async move {
                this.worker_loop(queue, results, settings, model, on_item).await;
            }));
        }
        for outcome in futures::future::join_all(handles).await {
            if let Err(e) = outcome {
                error!("Worker task panicked: {e}");
            }
        }

        let ordered: Vec<MetadataResult> = {
            let mut slots = results.lock();
            slots.drain(..).flatten().collect()
        };
        let failed = ordered.iter().filter(|r| r.failed).count();
        self.metrics.record_batch(ordered.len(), failed);
        info!(
            "{} batch finished: {}/{} completed, {} failed",
            self.kind,
            ordered.len(),
            total,
            failed
        );
        Ok(ordered)
    }

    fn partition(
        images: Vec<ImageInput>,
        strategy: SchedulingStrategy,
        default_group: usize,
    ) -> Vec<Unit> {
        let tasks = images
            .into_iter()
            .enumerate()
            .map(|(index, input)| ImageTask { index, input });

        match strategy {
            SchedulingStrategy::PerImage => {
                tasks.map(|t| Unit { tasks: vec![t] }).collect()
            }
            SchedulingStrategy::Grouped(size) => {
                let size = if size == 0 { default_group.max(1) } else { size };
                let mut units = Vec::new();
                let mut current = Vec::with_capacity(size);
                for task in tasks {
                    current.push(task);
                    if current.len() == size {
                        units.push(Unit {
                            tasks: std::mem::take(&mut current),
                        });
                    }
                }
                if !current.is_empty() {
                    units.push(Unit { tasks: current });
                }
                units
            }
        }
    }

    async fn worker_loop(
        &self,
        queue: Arc<Mutex<VecDeque<Unit>>>,
        results: Arc<Mutex<Vec<Option<MetadataResult>>>>,
        settings: PromptSettings,
        model: String,
        on_item: Option<ItemCallback>,
    ) {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return;
            }
            let unit = { queue.lock().pop_front() };
            let Some(unit) = unit else { return };

            if let Some(first) = unit.tasks.first() {
                self.progress.set_current(&first.input.filename);
            }

            let Some(outcomes) = self.process_unit(&unit, &settings, &model).await else {
                // Cancelled mid-unit; its slots stay empty.
                return;
            };

            {
                let mut slots = results.lock();
                for (task, result) in unit.tasks.iter().zip(outcomes.iter()) {
                    slots[task.index] = Some(result.clone());
                }
            }
            if let Some(callback) = &on_item {
                for result in &outcomes {
                    callback(result);
                }
            }
        }
    }

    fn failures(unit: &Unit) -> Vec<MetadataResult> {
        unit.tasks
            .iter()
            .map(|t| MetadataResult::failure(&t.input.filename))
            .collect()
    }

    /// Attempt a unit until it succeeds, exhausts its retry budget, or the
    /// batch is cancelled (`None`). Waiting for rate-limit headroom never
    /// consumes an attempt; only completed provider calls do.
    async fn process_unit(
        &self,
        unit: &Unit,
        settings: &PromptSettings,
        model: &str,
    ) -> Option<Vec<MetadataResult>> {
        let mut attempts: u32 = 0;
        let mut last_failed: Option<String> = None;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return None;
            }

            let valid = self.pool.list_valid().await;
            if valid.is_empty() {
                warn!(
                    "No valid {} credentials left; abandoning {} item(s)",
                    self.kind,
                    unit.tasks.len()
                );
                self.progress.record_failed_item(unit.tasks.len());
                return Some(Self::failures(unit));
            }

            let credential_id = match self.limiter.acquire(&valid, Some(model), last_failed.as_deref())
            {
                Some(Acquire::Granted { credential_id }) => credential_id,
                Some(Acquire::Wait { credential_id, wait }) => {
                    debug!(
                        "All {} credentials saturated; {} reopens in {:?}",
                        self.kind, credential_id, wait
                    );
                    if self.sleep_cancellable(wait).await {
                        return None;
                    }
                    continue;
                }
                None => {
                    if self.sleep_cancellable(Duration::from_millis(50)).await {
                        return None;
                    }
                    continue;
                }
            };
            let Some(credential) = valid.iter().find(|c| c.id == credential_id) else {
                continue;
            };

            if self.batch.dispatch_jitter_ms > 0 {
                let jitter = rand::thread_rng().gen_range(0..=self.batch.dispatch_jitter_ms);
                if self.sleep_cancellable(Duration::from_millis(jitter)).await {
                    return None;
                }
            }

            self.pool.mark_used(&credential_id).await;
            let started = Instant::now();
            let timeout_secs = self.batch.request_timeout_secs;
            let call = async {
                if unit.tasks.len() == 1 {
                    self.adapter
                        .generate_one(&credential.secret, &unit.tasks[0].input, settings)
                        .await
                        .map(|meta| vec![meta])
                } else {
                    let images: Vec<ImageInput> =
                        unit.tasks.iter().map(|t| t.input.clone()).collect();
                    self.adapter
                        .generate_group(&credential.secret, &images, settings)
                        .await
                }
            };
            let outcome = match tokio::time::timeout(Duration::from_secs(timeout_secs), call).await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(timeout_secs)),
            };
            attempts += 1;

            match outcome {
                Ok(metas) => {
                    self.metrics
                        .record_api_call(self.kind.name(), true, started.elapsed());
                    self.progress.record_success(&credential_id, unit.tasks.len());
                    return Some(
                        unit.tasks
                            .iter()
                            .zip(metas)
                            .map(|(t, m)| MetadataResult::from_metadata(&t.input.filename, m))
                            .collect(),
                    );
                }
                Err(err) => {
                    self.metrics
                        .record_api_call(self.kind.name(), false, started.elapsed());
                    self.progress.record_error(&credential_id);

                    if err.is_input() {
                        warn!("Rejecting unit without retry: {}", err);
                        self.progress.record_failed_item(unit.tasks.len());
                        return Some(Self::failures(unit));
                    }

                    let mut delay = Duration::ZERO;
                    if err.is_auth() {
                        warn!(
                            "Credential {} rejected by {}; marking invalid",
                            credential_id, self.kind
                        );
                        self.pool.set_valid(&credential_id, false).await;
                    } else if err.is_rate_limit() {
                        delay = self.backoff_delay(attempts, &err);
                        self.limiter.penalize(&credential_id, Some(model), delay);
                        warn!(
                            "{} rate limited on {} (attempt {}): backing off {:?}",
                            self.kind, credential_id, attempts, delay
                        );
                    } else {
                        delay = self.backoff_delay(attempts, &err);
                        debug!(
                            "{} attempt {} failed on {}: {}; retrying in {:?}",
                            self.kind, attempts, credential_id, err, delay
                        );
                    }
                    last_failed = Some(credential_id);

                    if attempts > self.batch.max_retries {
                        warn!(
                            "Retry budget exhausted after {} attempt(s); abandoning {} item(s)",
                            attempts,
                            unit.tasks.len()
                        );
                        self.progress.record_failed_item(unit.tasks.len());
                        return Some(Self::failures(unit));
                    }
                    if !delay.is_zero() && self.sleep_cancellable(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Exponential backoff for rate/quota pressure, linear for other
    /// transient failures. A provider-supplied retry-after wins when longer.
    fn backoff_delay(&self, attempt: u32, err: &ProviderError) -> Duration {
        let base = self.batch.backoff_base_ms;
        let cap = self.batch.backoff_cap_ms;
        let ms = match err {
            ProviderError::RateLimited { retry_after_secs } => {
                let exp = base
                    .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
                    .min(cap);
                match retry_after_secs {
                    Some(secs) => exp.max(secs.saturating_mul(1_000)).min(cap),
                    None => exp,
                }
            }
            _ => base.saturating_mul(attempt as u64).min(cap),
        };
        let jitter = if ms >= 4 {
            rand::thread_rng().gen_range(0..=ms / 4)
        } else {
            0
        };
        Duration::from_millis(ms + jitter)
    }

    /// Sleep in short slices so a stop request cuts waits short. Returns true
    /// when cancelled.
    async fn sleep_cancellable(&self, total: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(25);
        let deadline = Instant::now() + total;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(remaining.min(SLICE)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MediaKind, StockMetadata};
    use crate::middleware::RateLimitPolicy;
    use crate::providers::ProviderAdapter;
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Clone, Copy, Debug)]
    enum Script {
        Ok,
        RateLimited,
        Auth,
        Overloaded,
        Quality,
        Bad,
    }

    struct MockAdapter {
        scripts: Mutex<HashMap<String, VecDeque<Script>>>,
        default: Script,
        calls: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl MockAdapter {
        fn new(default: Script) -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                default,
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn script(self, secret: &str, steps: Vec<Script>) -> Self {
            self.scripts
                .lock()
                .insert(secret.to_string(), steps.into_iter().collect());
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn callers(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn next(&self, secret: &str) -> Script {
            self.calls.lock().push(secret.to_string());
            self.scripts
                .lock()
                .get_mut(secret)
                .and_then(|q| q.pop_front())
                .unwrap_or(self.default)
        }

        fn meta(filename: &str) -> StockMetadata {
            StockMetadata {
                title: format!("Generated title for {filename}"),
                description: format!("Generated description for {filename}"),
                keywords: (0..12).map(|i| format!("kw{i}")).collect(),
            }
        }

        async fn run(&self, secret: &str, count: usize, filenames: &[String]) -> Result<Vec<StockMetadata>, ProviderError> {
            let script = self.next(secret);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match script {
                Script::Ok => Ok((0..count).map(|i| Self::meta(&filenames[i])).collect()),
                Script::RateLimited => Err(ProviderError::RateLimited {
                    retry_after_secs: None,
                }),
                Script::Auth => Err(ProviderError::Auth("401".into())),
                Script::Overloaded => Err(ProviderError::Overloaded("503".into())),
                Script::Quality => Err(ProviderError::QualityBelowBar("2 keywords".into())),
                Script::Bad => Err(ProviderError::InvalidInput("undersized".into())),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Gemini
        }

        fn model(&self) -> &str {
            "mock-model"
        }

        async fn validate(&self, secret: &str) -> Result<(), ProviderError> {
            self.run(secret, 0, &[]).await.map(|_| ())
        }

        async fn generate_one(
            &self,
            secret: &str,
            image: &ImageInput,
            _settings: &PromptSettings,
        ) -> Result<StockMetadata, ProviderError> {
            let names = vec![image.filename.clone()];
            self.run(secret, 1, &names).await.map(|mut v| v.remove(0))
        }

        async fn generate_group(
            &self,
            secret: &str,
            images: &[ImageInput],
            _settings: &PromptSettings,
        ) -> Result<Vec<StockMetadata>, ProviderError> {
            let names: Vec<String> = images.iter().map(|i| i.filename.clone()).collect();
            self.run(secret, images.len(), &names).await
        }
    }

    fn image(n: usize) -> ImageInput {
        ImageInput {
            filename: format!("photo-{n:03}.jpg"),
            payload: format!("data:image/jpeg;base64,{}", "A".repeat(100)),
            media_kind: MediaKind::Photo,
        }
    }

    fn images(count: usize) -> Vec<ImageInput> {
        (0..count).map(image).collect()
    }

    fn test_batch_config() -> BatchConfig {
        BatchConfig {
            max_parallel: 2,
            strategy: SchedulingStrategy::PerImage,
            group_size: 2,
            max_retries: 3,
            backoff_base_ms: 5,
            backoff_cap_ms: 40,
            dispatch_jitter_ms: 0,
            request_timeout_secs: 5,
        }
    }

    async fn orchestrator(
        adapter: Arc<MockAdapter>,
        secrets: &[&str],
        batch: BatchConfig,
        policy: RateLimitPolicy,
    ) -> Arc<BatchOrchestrator> {
        let pool = Arc::new(
            CredentialPool::seeded(secrets.iter().map(|s| s.to_string()).collect()).await,
        );
        Arc::new(BatchOrchestrator::new(
            ProviderKind::Gemini,
            adapter,
            pool,
            Arc::new(RateLimiter::new(policy)),
            batch,
            Arc::new(Metrics::new()),
        ))
    }

    #[tokio::test]
    async fn results_keep_input_order_across_workers() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok).with_delay(Duration::from_millis(3)));
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1", "k2"],
            test_batch_config(),
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .run_batch(images(8), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.filename, format!("photo-{i:03}.jpg"));
            assert!(!result.failed);
        }
    }

    #[tokio::test]
    async fn work_spreads_evenly_across_credentials() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok));
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1", "k2"],
            test_batch_config(),
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        orch.run_batch(images(6), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        // Headroom-based selection keeps the split within one request of
        // count / credentials.
        let callers = adapter.callers();
        assert_eq!(callers.len(), 6);
        for secret in ["k1", "k2"] {
            let count = callers.iter().filter(|s| *s == secret).count() as i64;
            assert!((count - 3).abs() <= 1, "{secret} handled {count} of 6");
        }
    }

    #[tokio::test]
    async fn transient_failures_on_one_credential_fail_over() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok).script(
            "flaky",
            vec![Script::Overloaded; 8],
        ));
        let mut batch = test_batch_config();
        batch.max_parallel = 1;
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["flaky", "good"],
            batch,
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .clone()
            .run_batch(images(3), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.failed));

        // The flaky credential stays valid but only accumulated errors.
        let stats = orch.stats().await;
        assert_eq!(stats.valid_credentials, 2);

        let flaky_id = orch
            .credentials()
            .await
            .into_iter()
            .find(|c| c.display_name == "key-1")
            .map(|c| c.id)
            .unwrap();
        let progress = orch.progress();
        assert!(progress.per_credential[&flaky_id].errors >= 3);
        assert_eq!(progress.per_credential[&flaky_id].processed, 0);
    }

    #[tokio::test]
    async fn retry_budget_bounds_attempts_exactly() {
        let adapter = Arc::new(MockAdapter::new(Script::Overloaded));
        let mut batch = test_batch_config();
        batch.max_retries = 2;
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            batch,
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .run_batch(images(1), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        // max_retries retries after the initial attempt.
        assert_eq!(adapter.call_count(), 3);
        assert_eq!(results.len(), 1);
        assert!(results[0].failed);
    }

    #[tokio::test]
    async fn failed_results_carry_no_fabricated_metadata() {
        let adapter = Arc::new(MockAdapter::new(Script::Overloaded));
        let mut batch = test_batch_config();
        batch.max_retries = 0;
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            batch,
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .run_batch(images(1), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        let r = &results[0];
        assert!(r.failed);
        assert!(r.title.is_empty());
        assert!(r.description.is_empty());
        assert!(r.keywords.is_empty());
        assert_eq!(r.filename, "photo-000.jpg");
    }

    #[tokio::test]
    async fn invalid_input_fails_without_retry() {
        let adapter = Arc::new(MockAdapter::new(Script::Bad));
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            test_batch_config(),
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .run_batch(images(1), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        assert_eq!(adapter.call_count(), 1);
        assert!(results[0].failed);
    }

    #[tokio::test]
    async fn quality_failure_is_retried_then_succeeds() {
        let adapter =
            Arc::new(MockAdapter::new(Script::Ok).script("k1", vec![Script::Quality, Script::Ok]));
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            test_batch_config(),
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .run_batch(images(1), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        assert_eq!(adapter.call_count(), 2);
        assert!(!results[0].failed);
        assert!(results[0].title.contains("photo-000.jpg"));
    }

    #[tokio::test]
    async fn auth_rejection_invalidates_and_fails_over() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok).script(
            "bad",
            vec![Script::Auth, Script::Auth, Script::Auth, Script::Auth],
        ));
        let mut batch = test_batch_config();
        batch.max_parallel = 1;
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["bad", "good"],
            batch,
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .clone()
            .run_batch(images(3), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.failed));

        let stats = orch.stats().await;
        assert_eq!(stats.valid_credentials, 1);

        let progress = orch.progress();
        let bad_id = orch
            .credentials()
            .await
            .into_iter()
            .find(|c| !c.is_valid)
            .map(|c| c.id)
            .unwrap();
        assert!(progress.per_credential[&bad_id].errors >= 1);
        assert_eq!(progress.per_credential.get(&bad_id).map(|s| s.processed), Some(0));
    }

    #[tokio::test]
    async fn rate_limit_window_delays_excess_requests() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok));
        let mut batch = test_batch_config();
        batch.max_parallel = 1;
        let policy = RateLimitPolicy {
            requests_per_minute: 2,
            daily_quota: None,
            min_gap: None,
            safety_buffer: 0,
            window: Duration::from_millis(250),
            day: Duration::from_secs(3600),
        };
        let orch = orchestrator(Arc::clone(&adapter), &["k1"], batch, policy).await;

        let started = Instant::now();
        let results = orch
            .run_batch(images(3), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.failed));
        // The third request had to wait for the window to roll.
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test]
    async fn provider_rate_limit_penalizes_and_recovers() {
        let adapter =
            Arc::new(MockAdapter::new(Script::Ok).script("k1", vec![Script::RateLimited, Script::Ok]));
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            test_batch_config(),
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .run_batch(images(1), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();

        assert_eq!(adapter.call_count(), 2);
        assert!(!results[0].failed);
    }

    #[tokio::test]
    async fn stop_returns_partial_ordered_results() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok).with_delay(Duration::from_millis(30)));
        let mut batch = test_batch_config();
        batch.max_parallel = 1;
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            batch,
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let stopper = Arc::clone(&orch);
        let callback: ItemCallback = Arc::new(move |_r| stopper.stop());

        let results = orch
            .clone()
            .run_batch(
                images(6),
                PromptSettings::default(),
                SchedulingStrategy::PerImage,
                Some(callback),
            )
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert!(results.len() < 6);
        assert!(results.iter().all(|r| !r.failed));
        assert!(orch.progress().stopped);
    }

    #[tokio::test]
    async fn no_valid_credentials_is_fatal() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok));
        let pool = Arc::new(CredentialPool::new());
        let orch = Arc::new(BatchOrchestrator::new(
            ProviderKind::Gemini,
            adapter,
            pool,
            Arc::new(RateLimiter::new(RateLimitPolicy::fixed(10_000))),
            test_batch_config(),
            Arc::new(Metrics::new()),
        ));

        let err = orch
            .run_batch(images(2), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::NoValidCredentials { .. }));
    }

    #[tokio::test]
    async fn concurrent_batches_are_rejected() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok).with_delay(Duration::from_millis(50)));
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            test_batch_config(),
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let first = tokio::spawn(orch.clone().run_batch(
            images(3),
            PromptSettings::default(),
            SchedulingStrategy::PerImage,
            None,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = orch
            .clone()
            .run_batch(images(1), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await;
        assert!(matches!(second, Err(BatchError::AlreadyRunning)));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.len(), 3);
    }

    #[tokio::test]
    async fn grouped_strategy_shares_one_call_per_group() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok));
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            test_batch_config(),
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .run_batch(
                images(5),
                PromptSettings::default(),
                SchedulingStrategy::Grouped(2),
                None,
            )
            .await
            .unwrap();

        // 2 + 2 + 1 images across three provider calls.
        assert_eq!(adapter.call_count(), 3);
        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.filename, format!("photo-{i:03}.jpg"));
        }
    }

    #[tokio::test]
    async fn grouped_unit_fails_as_a_whole() {
        let adapter = Arc::new(MockAdapter::new(Script::Overloaded));
        let mut batch = test_batch_config();
        batch.max_retries = 1;
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            batch,
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let results = orch
            .run_batch(
                images(4),
                PromptSettings::default(),
                SchedulingStrategy::Grouped(2),
                None,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.failed));
        // 2 units, each attempted twice.
        assert_eq!(adapter.call_count(), 4);
    }

    #[tokio::test]
    async fn callback_sees_results_in_completion_order() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok));
        let mut batch = test_batch_config();
        batch.max_parallel = 1;
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            batch,
            RateLimitPolicy::fixed(10_000),
        )
        .await;

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ItemCallback = Arc::new(move |r| sink.lock().push(r.filename.clone()));

        orch.run_batch(
            images(3),
            PromptSettings::default(),
            SchedulingStrategy::PerImage,
            Some(callback),
        )
        .await
        .unwrap();

        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn validate_flips_validity_only_on_auth() {
        let adapter = Arc::new(
            MockAdapter::new(Script::Ok).script("k1", vec![Script::Overloaded, Script::Auth, Script::Ok]),
        );
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            test_batch_config(),
            RateLimitPolicy::fixed(10_000),
        )
        .await;
        let id = orch.credentials().await[0].id.clone();

        // Transient failure leaves the seeded credential valid.
        assert!(orch.validate_credential(&id).await.unwrap());
        // Auth rejection invalidates.
        assert!(!orch.validate_credential(&id).await.unwrap());
        // A later successful probe restores it.
        assert!(orch.validate_credential(&id).await.unwrap());

        assert!(matches!(
            orch.validate_credential("cred-999").await,
            Err(PoolError::UnknownCredential(_))
        ));
    }

    #[tokio::test]
    async fn remove_credential_purges_limiter_state() {
        let adapter = Arc::new(MockAdapter::new(Script::Ok));
        let orch = orchestrator(
            Arc::clone(&adapter),
            &["k1"],
            test_batch_config(),
            RateLimitPolicy::fixed(10_000),
        )
        .await;
        let id = orch.credentials().await[0].id.clone();

        orch.clone()
            .run_batch(images(2), PromptSettings::default(), SchedulingStrategy::PerImage, None)
            .await
            .unwrap();
        assert!(orch.stats().await.requests_per_minute > 0);

        assert!(orch.remove_credential(&id).await);
        let stats = orch.stats().await;
        assert_eq!(stats.total_credentials, 0);
        assert_eq!(stats.requests_per_minute, 0);
    }
}
