use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::gateway::types::{
    CallerContext, DescriptorSnapshot, HealthReport, ModelTarget, ResolvedTarget, TimeoutBudgets,
};
use crate::models::circuit_breaker::service_key;
use crate::models::operation::{self, PollPolicy};
use crate::models::selector::{predicted_next, resolve_tag};
use crate::models::{
    BinaryPayload, CallOptions, Capability, ChatRequest, ChatResponse, CircuitBreaker, CircuitState,
    EmbeddingRequest, EmbeddingResponse, FragmentCallback, HealthStatus, ImageRequest, MediaResponse,
    Message, ModelRanking, ModelSelector, ModelTag, ProviderInfo, ProviderRegistry, QuotaEnforcer,
    SpeechRequest, TokenUsage, TranscriptionRequest, TranscriptionResponse, VideoRequest, VisionRequest,
};
use crate::platform::{Clock, SystemClock};
use crate::storage::{UsageMetadata, UsageStatus};

/// Single entry point for every capability call: resolve the target, check
/// quota, run the adapter through its circuit under a time budget, then record
/// usage.
pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    breaker: CircuitBreaker,
    quotas: Arc<QuotaEnforcer>,
    selector: ModelSelector,
    defaults: BTreeMap<Capability, ModelTarget>,
    timeouts: TimeoutBudgets,
    polling: PollPolicy,
    again_min_rating: Option<f64>,
    clock: Arc<dyn Clock>,
}

impl Gateway {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breaker: CircuitBreaker,
        quotas: Arc<QuotaEnforcer>,
        selector: ModelSelector,
    ) -> Self {
        Self {
            registry,
            breaker,
            quotas,
            selector,
            defaults: BTreeMap::new(),
            timeouts: TimeoutBudgets::default(),
            polling: PollPolicy::default(),
            again_min_rating: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_defaults(mut self, defaults: BTreeMap<Capability, ModelTarget>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutBudgets) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_poll_policy(mut self, polling: PollPolicy) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_again_min_rating(mut self, min_rating: Option<f64>) -> Self {
        self.again_min_rating = min_rating;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn quotas(&self) -> &QuotaEnforcer {
        &self.quotas
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    /// Explicit option, then the caller's default, then the system default.
    /// A model without a provider is looked up in the catalog.
    pub fn resolve(
        &self,
        capability: Capability,
        caller: &CallerContext,
        options: &CallOptions,
        requested_model: Option<&str>,
    ) -> Result<ResolvedTarget> {
        let explicit_model = options
            .model
            .as_deref()
            .or(requested_model)
            .filter(|model| !model.trim().is_empty());

        let (provider, model) = if let Some(model) = explicit_model {
            (options.provider.clone(), model.to_string())
        } else if let Some(provider) = options.provider.as_deref() {
            let model = self
                .registry
                .descriptor(provider)
                .and_then(|d| d.default_model(capability).map(str::to_string))
                .ok_or_else(|| {
                    Error::invalid_request(format!("Provider '{}' has no default {} model", provider, capability))
                })?;
            (Some(provider.to_string()), model)
        } else if let Some(target) = caller
            .default_models
            .get(&capability)
            .or_else(|| self.defaults.get(&capability))
        {
            (target.provider.clone(), target.model.clone())
        } else {
            return Err(Error::invalid_request(format!("No model specified for {}", capability)));
        };

        let provider = match provider {
            Some(provider) => provider,
            None => self.selector.service_for(&model).ok_or_else(|| {
                Error::invalid_request(format!("No provider is known to serve model '{}'", model))
            })?,
        };

        debug!("Resolved {} for {} to {}/{}", capability, caller.id, provider, model);
        Ok(ResolvedTarget { provider, model })
    }

    /// Credentials first, then quota. Nothing here touches the network.
    async fn admit(&self, caller: &CallerContext, capability: Capability, target: &ResolvedTarget) -> Result<()> {
        let descriptor = self
            .registry
            .descriptor(&target.provider)
            .ok_or_else(|| Error::invalid_request(format!("Unknown provider '{}'", target.provider)))?;
        if !descriptor.is_available() {
            warn!("Provider {} is not configured", target.provider);
            return Err(Error::credentials_missing(&target.provider));
        }

        self.quotas.enforce(&caller.id, &caller.tier, capability.as_str()).await?;
        Ok(())
    }

    async fn guarded<T, F, Fut>(&self, target: &ResolvedTarget, capability: Capability, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let budget = self.timeouts.for_class(capability.timeout_class());
        let key = service_key(&target.provider, capability.as_str());

        self.breaker
            .execute(&key, || async move {
                match tokio::time::timeout(budget, call()).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            "{} call to {}/{} exceeded {:?}",
                            capability, target.provider, target.model, budget
                        );
                        Err(Error::timeout(format!("{} {}", target.provider, capability), budget))
                    }
                }
            })
            .await
    }

    async fn record(
        &self,
        caller: &CallerContext,
        capability: Capability,
        target: &ResolvedTarget,
        usage: Option<&TokenUsage>,
        started: Instant,
        status: UsageStatus,
    ) {
        let cost = match (usage, self.selector.pricing(&target.model)) {
            (Some(usage), Some(pricing)) => pricing.cost(usage),
            _ => Decimal::ZERO,
        };

        let metadata = UsageMetadata {
            provider: target.provider.clone(),
            model: target.model.clone(),
            input_tokens: usage.map_or(0, |u| u.input_tokens),
            output_tokens: usage.map_or(0, |u| u.output_tokens),
            cost,
            latency_ms: started.elapsed().as_millis() as u64,
            status: Some(status),
        };

        if let Err(e) = self.quotas.record_usage(&caller.id, capability.as_str(), metadata).await {
            error!("Failed to record {} usage for {}: {}", capability, caller.id, e);
        }
    }

    pub async fn chat(&self, caller: &CallerContext, messages: Vec<Message>, options: &CallOptions) -> Result<ChatResponse> {
        let capability = Capability::Chat;
        let target = self.resolve(capability, caller, options, None)?;
        let adapter = self.registry.chat(&target.provider)?;

        let mut request = ChatRequest::new(messages, target.model.clone()).apply_options(options);
        request.user_id = Some(caller.id.clone());
        request.validate()?;

        self.admit(caller, capability, &target).await?;
        let started = Instant::now();
        let response = self.guarded(&target, capability, || adapter.chat(&request)).await?;

        self.record(caller, capability, &target, response.usage.as_ref(), started, UsageStatus::Completed)
            .await;
        Ok(response)
    }

    /// Fragments reach `on_fragment` as they arrive; anything delivered before
    /// a failure stays delivered. Cancelling returns the partial response.
    pub async fn chat_stream(
        &self,
        caller: &CallerContext,
        messages: Vec<Message>,
        options: &CallOptions,
        on_fragment: FragmentCallback<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let capability = Capability::Chat;
        let target = self.resolve(capability, caller, options, None)?;
        let adapter = self.registry.chat(&target.provider)?;

        let mut request = ChatRequest::new(messages, target.model.clone()).apply_options(options);
        request.user_id = Some(caller.id.clone());
        request.validate()?;

        self.admit(caller, capability, &target).await?;
        let started = Instant::now();
        let response = self
            .guarded(&target, capability, || adapter.chat_stream(&request, on_fragment, cancel))
            .await?;

        let status = if response.finish_reason.as_deref() == Some("cancelled") {
            info!("Stream for {} cancelled after {} chars", caller.id, response.content.len());
            UsageStatus::Cancelled
        } else {
            UsageStatus::Completed
        };
        self.record(caller, capability, &target, response.usage.as_ref(), started, status)
            .await;
        Ok(response)
    }

    pub async fn describe_image(
        &self,
        caller: &CallerContext,
        prompt: &str,
        images: Vec<BinaryPayload>,
        options: &CallOptions,
    ) -> Result<ChatResponse> {
        let capability = Capability::Vision;
        let target = self.resolve(capability, caller, options, None)?;
        let adapter = self.registry.vision(&target.provider)?;

        if images.is_empty() {
            return Err(Error::invalid_request("At least one image is required"));
        }
        let request = VisionRequest {
            model: target.model.clone(),
            prompt: prompt.to_string(),
            images,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        self.admit(caller, capability, &target).await?;
        let started = Instant::now();
        let response = self
            .guarded(&target, capability, || adapter.describe_image(&request))
            .await?;

        self.record(caller, capability, &target, response.usage.as_ref(), started, UsageStatus::Completed)
            .await;
        Ok(response)
    }

    pub async fn embed(
        &self,
        caller: &CallerContext,
        input: Vec<String>,
        dimensions: Option<u32>,
        options: &CallOptions,
    ) -> Result<EmbeddingResponse> {
        let capability = Capability::Embeddings;
        let target = self.resolve(capability, caller, options, None)?;
        let adapter = self.registry.embeddings(&target.provider)?;

        if input.is_empty() {
            return Err(Error::invalid_request("At least one input text is required"));
        }
        let request = EmbeddingRequest {
            model: target.model.clone(),
            input,
            dimensions,
        };

        self.admit(caller, capability, &target).await?;
        let started = Instant::now();
        let response = self.guarded(&target, capability, || adapter.embed(&request)).await?;

        self.record(caller, capability, &target, response.usage.as_ref(), started, UsageStatus::Completed)
            .await;
        Ok(response)
    }

    /// `request.model` is used when no model option is given and is replaced
    /// with the resolved model.
    pub async fn generate_image(
        &self,
        caller: &CallerContext,
        mut request: ImageRequest,
        options: &CallOptions,
    ) -> Result<MediaResponse> {
        let capability = Capability::ImageGeneration;
        let target = self.resolve(capability, caller, options, Some(&request.model))?;
        let adapter = self.registry.image_generation(&target.provider)?;
        request.model = target.model.clone();

        self.admit(caller, capability, &target).await?;
        let started = Instant::now();
        let response = self
            .guarded(&target, capability, || adapter.generate_image(&request))
            .await?;

        self.record(caller, capability, &target, None, started, UsageStatus::Completed)
            .await;
        Ok(response)
    }

    /// Submits the job and polls it to completion inside one circuit call.
    /// Submission and polling share the long-running budget.
    pub async fn generate_video(
        &self,
        caller: &CallerContext,
        mut request: VideoRequest,
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<MediaResponse> {
        let capability = Capability::VideoGeneration;
        let target = self.resolve(capability, caller, options, Some(&request.model))?;
        let adapter = self.registry.video_generation(&target.provider)?;
        request.model = target.model.clone();

        self.admit(caller, capability, &target).await?;

        let budget = self.timeouts.for_class(capability.timeout_class());
        let policy = self.polling;
        let key = service_key(&target.provider, capability.as_str());
        let started = Instant::now();

        let response = self
            .breaker
            .execute(&key, || async {
                let deadline = tokio::time::Instant::now() + budget;
                let handle = match tokio::time::timeout_at(deadline, adapter.submit_video(&request)).await {
                    Ok(handle) => handle?,
                    Err(_) => {
                        warn!("Video submission to {}/{} exceeded {:?}", target.provider, target.model, budget);
                        return Err(Error::timeout(format!("{} video submission", target.provider), budget));
                    }
                };
                info!("Submitted video operation {} to {}", handle.id, handle.provider);

                let name = format!("{} video {}", handle.provider, handle.id);
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                operation::drive(&name, policy, remaining, cancel, |_attempt| adapter.poll_video(&handle)).await
            })
            .await?;

        self.record(caller, capability, &target, None, started, UsageStatus::Completed)
            .await;
        Ok(response)
    }

    pub async fn transcribe(
        &self,
        caller: &CallerContext,
        mut request: TranscriptionRequest,
        options: &CallOptions,
    ) -> Result<TranscriptionResponse> {
        let capability = Capability::SpeechToText;
        let target = self.resolve(capability, caller, options, Some(&request.model))?;
        let adapter = self.registry.speech_to_text(&target.provider)?;
        request.model = target.model.clone();

        self.admit(caller, capability, &target).await?;
        let started = Instant::now();
        let response = self.guarded(&target, capability, || adapter.transcribe(&request)).await?;

        self.record(caller, capability, &target, None, started, UsageStatus::Completed)
            .await;
        Ok(response)
    }

    pub async fn synthesize_speech(
        &self,
        caller: &CallerContext,
        mut request: SpeechRequest,
        options: &CallOptions,
    ) -> Result<MediaResponse> {
        let capability = Capability::TextToSpeech;
        let target = self.resolve(capability, caller, options, Some(&request.model))?;
        let adapter = self.registry.text_to_speech(&target.provider)?;
        request.model = target.model.clone();

        if request.text.trim().is_empty() {
            return Err(Error::invalid_request("Text to synthesize is empty"));
        }

        self.admit(caller, capability, &target).await?;
        let started = Instant::now();
        let response = self.guarded(&target, capability, || adapter.synthesize(&request)).await?;

        self.record(caller, capability, &target, None, started, UsageStatus::Completed)
            .await;
        Ok(response)
    }

    /// Tags that do not run through chat are ranked as plain chat.
    fn again_tag(topic: &str) -> ModelTag {
        let tag = resolve_tag(topic);
        if tag.capability() == Capability::Chat {
            tag
        } else {
            ModelTag::Chat
        }
    }

    /// The model an "Again" request would run on, without running it.
    pub fn predict_again(&self, topic: &str, current_model: Option<&str>) -> Option<ModelRanking> {
        let tag = Self::again_tag(topic);
        let eligible = self.selector.eligible(tag, self.again_min_rating);
        predicted_next(&eligible, current_model).cloned()
    }

    pub async fn again(
        &self,
        caller: &CallerContext,
        topic: &str,
        current_model: Option<&str>,
        messages: Vec<Message>,
        options: &CallOptions,
    ) -> Result<ChatResponse> {
        let next = self.predict_again(topic, current_model).ok_or_else(|| {
            Error::invalid_request(format!("No eligible model for topic '{}'", topic))
        })?;

        info!(
            "Again for {}: {} -> {}/{}",
            caller.id,
            current_model.unwrap_or("-"),
            next.service,
            next.model_id
        );

        let options = CallOptions {
            provider: Some(next.service),
            model: Some(next.model_id),
            ..options.clone()
        };
        self.chat(caller, messages, &options).await
    }

    async fn snapshot(&self, descriptor: Arc<dyn ProviderInfo>) -> DescriptorSnapshot {
        let available = descriptor.is_available();
        let status = if available {
            descriptor.get_status().await
        } else {
            HealthStatus::unhealthy("Provider is not configured")
        };

        let mut circuits = BTreeMap::new();
        let mut default_models = BTreeMap::new();
        for &capability in descriptor.capabilities() {
            let key = service_key(descriptor.name(), capability.as_str());
            match self.breaker.state(&key).await {
                Ok(state) => {
                    circuits.insert(capability, state);
                }
                Err(e) => warn!("Could not read circuit {}: {}", key, e),
            }
            if let Some(model) = descriptor.default_model(capability) {
                default_models.insert(capability, model.to_string());
            }
        }

        let healthy = available && status.healthy && !circuits.values().any(|s| *s == CircuitState::Open);
        DescriptorSnapshot {
            name: descriptor.name().to_string(),
            capabilities: descriptor.capabilities().to_vec(),
            default_models,
            available,
            healthy,
            status,
            circuits,
        }
    }

    /// Probes every registered provider concurrently and folds in breaker state.
    pub async fn health_report(&self) -> HealthReport {
        let descriptors: Vec<Arc<dyn ProviderInfo>> = self.registry.descriptors().cloned().collect();
        let providers = join_all(descriptors.into_iter().map(|d| self.snapshot(d))).await;

        let configured: Vec<&DescriptorSnapshot> = providers.iter().filter(|p| p.available).collect();
        let healthy = !configured.is_empty() && configured.iter().all(|p| p.healthy);
        info!(
            "Health report: {}/{} configured providers healthy",
            configured.iter().filter(|p| p.healthy).count(),
            configured.len()
        );

        HealthReport {
            generated_at: self.clock.now(),
            healthy,
            providers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ActionCeilings, ChatCapability, CircuitBreakerConfig, MediaDescriptor, ModelCatalog, OperationHandle,
        OperationStatus, PricingInfo, QuotaSettings, QuotaStrategy, StaticCatalog, StaticCeilings,
        StreamFragment, TierPolicy, VideoGeneration,
    };
    use crate::models::types::Transcript;
    use crate::platform::{Clock, ManualClock};
    use crate::storage::{MemoryStateStore, MemoryUsageLedger, StateStore, UsageLedger};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubChat {
        name: &'static str,
        available: bool,
        fail: bool,
        fragments: Vec<StreamFragment>,
        calls: AtomicU32,
    }

    impl StubChat {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                available: true,
                fail: false,
                fragments: vec![StreamFragment::Content("hello".into())],
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderInfo for StubChat {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &[Capability::Chat]
        }

        fn default_model(&self, capability: Capability) -> Option<&str> {
            (capability == Capability::Chat).then_some("stub-model")
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn get_status(&self) -> HealthStatus {
            HealthStatus::healthy(1)
        }
    }

    #[async_trait]
    impl ChatCapability for StubChat {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::backend(self.name, "API error 503: overloaded"));
            }
            let mut response = ChatResponse::new(self.name, &request.model, "hello");
            response.usage = Some(TokenUsage::new(1000, 500));
            Ok(response)
        }

        async fn chat_stream(
            &self,
            request: &ChatRequest,
            on_fragment: FragmentCallback<'_>,
            _cancel: &CancellationToken,
        ) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut transcript = Transcript::default();
            for fragment in &self.fragments {
                transcript.push(fragment);
                on_fragment(fragment.clone());
            }
            let mut response = transcript.into_response(self.name, &request.model);
            response.usage = Some(TokenUsage::new(10, 20));
            Ok(response)
        }
    }

    struct StubVideo {
        ready_after: u32,
        polls: AtomicU32,
        submit_delay: Duration,
    }

    impl StubVideo {
        fn new(ready_after: u32) -> Self {
            Self {
                ready_after,
                polls: AtomicU32::new(0),
                submit_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ProviderInfo for StubVideo {
        fn name(&self) -> &str {
            "studio"
        }

        fn capabilities(&self) -> &[Capability] {
            &[Capability::VideoGeneration]
        }

        fn default_model(&self, _capability: Capability) -> Option<&str> {
            Some("clip-1")
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn get_status(&self) -> HealthStatus {
            HealthStatus::unhealthy("probe failed")
        }
    }

    #[async_trait]
    impl VideoGeneration for StubVideo {
        async fn submit_video(&self, request: &VideoRequest) -> Result<OperationHandle> {
            tokio::time::sleep(self.submit_delay).await;
            Ok(OperationHandle::new("studio", &request.model, "operations/42"))
        }

        async fn poll_video(&self, handle: &OperationHandle) -> Result<OperationStatus<MediaResponse>> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if polls < self.ready_after {
                return Ok(OperationStatus::Pending);
            }
            Ok(OperationStatus::Ready(MediaResponse {
                provider: handle.provider.clone(),
                model: handle.model.clone(),
                items: vec![MediaDescriptor::inline("video/mp4", b"\x00\x00\x00\x18ftypmp42")],
            }))
        }
    }

    struct Harness {
        gateway: Gateway,
        ledger: Arc<MemoryUsageLedger>,
        clock: ManualClock,
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::new(vec![
            ModelRanking {
                model_id: "stub-large".into(),
                service: "stub".into(),
                quality: 90,
                rating: 4.5,
                tags: vec![ModelTag::Chat, ModelTag::Code],
                pricing: Some(PricingInfo {
                    input_per_1k_tokens: Decimal::new(1, 3),
                    output_per_1k_tokens: Decimal::new(2, 3),
                }),
            },
            ModelRanking {
                model_id: "stub-small".into(),
                service: "stub".into(),
                quality: 70,
                rating: 4.0,
                tags: vec![ModelTag::Chat],
                pricing: None,
            },
        ])
    }

    fn harness(registry: ProviderRegistry, failure_threshold: u32) -> Harness {
        let clock = ManualClock::default();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let ledger = Arc::new(MemoryUsageLedger::new());
        let clock_handle: Arc<dyn Clock> = Arc::new(clock.clone());
        let clock_handle_for_report = clock_handle.clone();

        let tiers = BTreeMap::from([(
            "free".to_string(),
            TierPolicy {
                strategy: QuotaStrategy::Lifetime,
                actions: BTreeMap::from([(
                    "chat".to_string(),
                    ActionCeilings {
                        lifetime: Some(2),
                        ..ActionCeilings::default()
                    },
                )]),
            },
        )]);
        let quotas = QuotaEnforcer::new(
            Arc::new(StaticCeilings::new(tiers)),
            ledger.clone() as Arc<dyn UsageLedger>,
            store.clone(),
            clock_handle.clone(),
            QuotaSettings::default(),
        );
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold,
                ..CircuitBreakerConfig::default()
            },
            store,
            clock_handle,
        );
        let catalog: Arc<dyn ModelCatalog> = Arc::new(catalog());

        let gateway = Gateway::new(
            Arc::new(registry),
            breaker,
            Arc::new(quotas),
            ModelSelector::new(catalog),
        )
        .with_defaults(BTreeMap::from([(Capability::Chat, ModelTarget::new("stub", "stub-large"))]))
        .with_poll_policy(PollPolicy {
            interval: Duration::from_millis(5),
            max_attempts: 10,
        })
        .with_clock(clock_handle_for_report);

        Harness { gateway, ledger, clock }
    }

    fn registry_with(stub: Arc<StubChat>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.add_descriptor(stub.clone());
        registry.add_chat(stub);
        registry
    }

    fn messages() -> Vec<Message> {
        vec![Message::user("Hi there")]
    }

    #[tokio::test]
    async fn test_missing_model_fails_before_any_call() {
        let stub = Arc::new(StubChat::new("stub"));
        let h = harness(registry_with(stub.clone()), 5);
        let gateway = h.gateway.with_defaults(BTreeMap::new());

        let err = gateway
            .chat(&CallerContext::new("alice", "pro"), messages(), &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(stub.calls(), 0);
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_provider_raises_credentials_missing() {
        let mut stub = StubChat::new("anthropic");
        stub.available = false;
        let stub = Arc::new(stub);
        let h = harness(registry_with(stub.clone()), 5);

        let options = CallOptions::default().with_provider("anthropic").with_model("claude-sonnet-4");
        let err = h
            .gateway
            .chat(&CallerContext::new("alice", "pro"), messages(), &options)
            .await
            .unwrap_err();
        match err {
            Error::CredentialsMissing { provider } => assert_eq!(provider, "anthropic"),
            other => panic!("expected CredentialsMissing, got {:?}", other),
        }
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_keeps_reasoning_out_of_transcript() {
        let mut stub = StubChat::new("stub");
        stub.fragments = vec![
            StreamFragment::Reasoning("Let me think.".into()),
            StreamFragment::Content("The answer is 4.".into()),
        ];
        let stub = Arc::new(stub);
        let h = harness(registry_with(stub.clone()), 5);

        let mut seen = Vec::new();
        let mut on_fragment = |fragment: StreamFragment| seen.push(fragment);
        let response = h
            .gateway
            .chat_stream(
                &CallerContext::new("alice", "pro"),
                messages(),
                &CallOptions::default().with_reasoning(None),
                &mut on_fragment,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_reasoning());
        assert!(!seen[1].is_reasoning());
        assert_eq!(response.content, "The answer is 4.");
        assert_eq!(response.reasoning.as_deref(), Some("Let me think."));
    }

    #[tokio::test]
    async fn test_usage_recorded_with_cost() {
        let stub = Arc::new(StubChat::new("stub"));
        let h = harness(registry_with(stub.clone()), 5);
        let caller = CallerContext::new("alice", "pro");

        let response = h.gateway.chat(&caller, messages(), &CallOptions::default()).await.unwrap();
        assert_eq!(response.model, "stub-large");

        let records = h.ledger.recent("alice", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.action_type, "chat");
        assert_eq!(record.provider, "stub");
        assert_eq!((record.input_tokens, record.output_tokens), (1000, 500));
        // 1000 * 0.001/1k + 500 * 0.002/1k
        assert_eq!(record.cost, Decimal::new(2, 3));
        assert_eq!(record.status, UsageStatus::Completed);
        assert_eq!(record.timestamp, h.clock.now());
    }

    #[tokio::test]
    async fn test_quota_denial_skips_adapter() {
        let stub = Arc::new(StubChat::new("stub"));
        let h = harness(registry_with(stub.clone()), 5);
        let caller = CallerContext::new("bob", "free");

        for _ in 0..2 {
            h.gateway.chat(&caller, messages(), &CallOptions::default()).await.unwrap();
        }
        let err = h.gateway.chat(&caller, messages(), &CallOptions::default()).await.unwrap_err();
        match err {
            Error::QuotaExceeded { action, limit, used, resets_at } => {
                assert_eq!(action, "chat");
                assert_eq!((limit, used), (2, 2));
                assert!(resets_at.is_none());
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let mut stub = StubChat::new("stub");
        stub.fail = true;
        let stub = Arc::new(stub);
        let h = harness(registry_with(stub.clone()), 2);
        let caller = CallerContext::new("carol", "pro");

        for _ in 0..2 {
            let err = h.gateway.chat(&caller, messages(), &CallOptions::default()).await.unwrap_err();
            assert!(matches!(err, Error::Backend { .. }));
        }
        let err = h.gateway.chat(&caller, messages(), &CallOptions::default()).await.unwrap_err();
        match err {
            Error::BackendUnavailable { service, .. } => assert_eq!(service, "stub:chat"),
            other => panic!("expected BackendUnavailable, got {:?}", other),
        }
        assert_eq!(stub.calls(), 2);
        assert!(h.ledger.is_empty());

        let report = h.gateway.health_report().await;
        assert_eq!(report.generated_at, h.clock.now());
        let snapshot = report.provider("stub").unwrap();
        assert!(snapshot.status.healthy);
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.circuits[&Capability::Chat], CircuitState::Open);
        assert!(!report.healthy);
    }

    #[tokio::test]
    async fn test_model_without_provider_resolves_through_catalog() {
        let stub = Arc::new(StubChat::new("stub"));
        let h = harness(registry_with(stub), 5);
        let caller = CallerContext::new("dave", "pro");

        let target = h
            .gateway
            .resolve(Capability::Chat, &caller, &CallOptions::default().with_model("stub-small"), None)
            .unwrap();
        assert_eq!(target.provider, "stub");

        let err = h
            .gateway
            .resolve(Capability::Chat, &caller, &CallOptions::default().with_model("mystery"), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let caller = caller.with_default(Capability::Chat, ModelTarget::new("stub", "stub-small"));
        let target = h
            .gateway
            .resolve(Capability::Chat, &caller, &CallOptions::default(), None)
            .unwrap();
        assert_eq!(target.model, "stub-small");
    }

    #[tokio::test]
    async fn test_again_moves_to_next_ranked_model() {
        let stub = Arc::new(StubChat::new("stub"));
        let h = harness(registry_with(stub), 5);
        let caller = CallerContext::new("erin", "pro");

        let response = h
            .gateway
            .again(&caller, "tell me a story", Some("stub-large"), messages(), &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(response.model, "stub-small");

        let predicted = h.gateway.predict_again("tell me a story", Some("stub-small")).unwrap();
        assert_eq!(predicted.model_id, "stub-large");
        // Non-chat tags rank as chat
        let predicted = h.gateway.predict_again("draw a picture of a cat", None).unwrap();
        assert_eq!(predicted.model_id, "stub-large");
    }

    #[tokio::test]
    async fn test_video_generation_polls_to_completion() {
        let video = Arc::new(StubVideo::new(3));
        let mut registry = ProviderRegistry::new();
        registry.add_descriptor(video.clone());
        registry.add_video_generation(video.clone());
        let h = harness(registry, 5);

        let request = VideoRequest {
            model: String::new(),
            prompt: "A drone shot over a glacier".into(),
            aspect_ratio: Some("16:9".into()),
            duration_seconds: Some(8),
            negative_prompt: None,
        };
        let response = h
            .gateway
            .generate_video(
                &CallerContext::new("frank", "pro"),
                request,
                &CallOptions::default().with_provider("studio"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.model, "clip-1");
        assert_eq!(response.items.len(), 1);
        assert_eq!(video.polls.load(Ordering::SeqCst), 3);

        let records = h.ledger.recent("frank", 10).await.unwrap();
        assert_eq!(records[0].action_type, "video_generation");
    }

    #[tokio::test]
    async fn test_video_generation_cancelled() {
        let video = Arc::new(StubVideo::new(u32::MAX));
        let mut registry = ProviderRegistry::new();
        registry.add_descriptor(video.clone());
        registry.add_video_generation(video);
        let h = harness(registry, 5);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = VideoRequest {
            model: "clip-1".into(),
            prompt: "Waves".into(),
            aspect_ratio: None,
            duration_seconds: None,
            negative_prompt: None,
        };
        let err = h
            .gateway
            .generate_video(
                &CallerContext::new("gina", "pro"),
                request,
                &CallOptions::default().with_provider("studio"),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_slow_video_submission_counts_against_the_budget() {
        let video = Arc::new(StubVideo {
            submit_delay: Duration::from_secs(5),
            ..StubVideo::new(1)
        });
        let mut registry = ProviderRegistry::new();
        registry.add_descriptor(video.clone());
        registry.add_video_generation(video.clone());
        let h = harness(registry, 5);
        let gateway = h.gateway.with_timeouts(TimeoutBudgets {
            long_running_secs: 1,
            ..TimeoutBudgets::default()
        });

        let request = VideoRequest {
            model: "clip-1".into(),
            prompt: "Slow motion rain".into(),
            aspect_ratio: None,
            duration_seconds: None,
            negative_prompt: None,
        };
        let err = gateway
            .generate_video(
                &CallerContext::new("hana", "pro"),
                request,
                &CallOptions::default().with_provider("studio"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(video.polls.load(Ordering::SeqCst), 0);
        assert!(h.ledger.is_empty());
    }
}
