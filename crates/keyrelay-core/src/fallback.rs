//! Provider fallback orchestration.
//!
//! A request walks the enabled providers in priority order, one at a time.
//! Rate-limit and quota failures spend the credential and rotate within the
//! provider; anything else moves straight on to the next provider. Only the
//! terminal outcomes in [`FallbackError`] reach the caller.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, Defaults, ProviderKind, ProviderSettings, SelectorConfig};
use crate::credentials::{CredentialSnapshot, KeyRotationTable};
use crate::error::{ConfigError, FailureKind, FallbackError, ProviderError};
use crate::provider::{self, ImageProvider, LlmProvider};
use crate::selector;
use crate::types::{CompletionOptions, CompletionRequest, CompletionResponse, ImageResponse, Message};
use crate::util::markdown::extract_code_block;

struct ChatEntry {
    settings: ProviderSettings,
    client: Arc<dyn LlmProvider>,
}

struct ImageEntry {
    settings: ProviderSettings,
    client: Arc<dyn ImageProvider>,
}

/// Status snapshot of one provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub name: String,
    pub kind: ProviderKind,
    pub priority: u32,
    pub enabled: bool,
    pub available: bool,
    pub current_key_index: usize,
    pub keys: Vec<CredentialSnapshot>,
}

/// Outcome of a successful chain run.
struct ChainSuccess<T> {
    value: T,
    provider: String,
}

/// Owns the provider clients and the credential table. Build one per process
/// and share it behind an `Arc`.
pub struct FallbackOrchestrator {
    chat: Vec<ChatEntry>,
    image: Vec<ImageEntry>,
    keys: KeyRotationTable,
    defaults: Defaults,
    selector: SelectorConfig,
}

impl FallbackOrchestrator {
    /// Empty orchestrator over the given credential table.
    pub fn new(keys: KeyRotationTable) -> Self {
        Self {
            chat: Vec::new(),
            image: Vec::new(),
            keys,
            defaults: Defaults::default(),
            selector: SelectorConfig::default(),
        }
    }

    /// Build from configuration using the wall clock.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let keys = KeyRotationTable::new(
            clock,
            ChronoDuration::seconds(config.credentials.cooldown_secs),
        );
        let mut orchestrator = Self::new(keys)
            .with_defaults(config.defaults.clone())
            .with_selector(config.selector.clone());

        for settings in &config.providers {
            if let Some(client) = provider::create_provider(settings) {
                orchestrator.register_provider(settings.clone(), client);
            }
        }
        for settings in &config.image_providers {
            if let Some(client) = provider::create_image_provider(settings) {
                orchestrator.register_image_provider(settings.clone(), client);
            }
        }

        info!(
            "Fallback chain: [{}], image chain: [{}]",
            orchestrator.chat.iter().map(|e| e.settings.name.as_str()).collect::<Vec<_>>().join(", "),
            orchestrator.image.iter().map(|e| e.settings.name.as_str()).collect::<Vec<_>>().join(", "),
        );

        Ok(orchestrator)
    }

    pub fn with_defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_selector(mut self, selector: SelectorConfig) -> Self {
        self.selector = selector;
        self
    }

    /// Add a chat provider. Its keys go into the rotation table and the chain
    /// stays ordered by priority (registration order breaks ties).
    pub fn register_provider(&mut self, settings: ProviderSettings, client: Arc<dyn LlmProvider>) {
        self.keys.register(&settings.name, settings.api_keys.iter().cloned());
        let pos = self
            .chat
            .partition_point(|e| e.settings.priority <= settings.priority);
        self.chat.insert(pos, ChatEntry { settings, client });
    }

    pub fn register_image_provider(
        &mut self,
        settings: ProviderSettings,
        client: Arc<dyn ImageProvider>,
    ) {
        self.keys.register(&settings.name, settings.api_keys.iter().cloned());
        let pos = self
            .image
            .partition_point(|e| e.settings.priority <= settings.priority);
        self.image.insert(pos, ImageEntry { settings, client });
    }

    pub fn keys(&self) -> &KeyRotationTable {
        &self.keys
    }

    /// Indices of enabled providers that still own a usable credential.
    fn available<'a>(&self, settings: impl Iterator<Item = &'a ProviderSettings>) -> Vec<usize> {
        settings
            .enumerate()
            .filter(|(_, s)| s.enabled && self.keys.is_available(&s.name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Walk `chain` (indices into `settings`) until one call succeeds.
    async fn run_chain<T, F, Fut>(
        &self,
        settings: &[&ProviderSettings],
        chain: &[usize],
        call: F,
    ) -> Result<ChainSuccess<T>, FallbackError>
    where
        F: Fn(usize, String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error: Option<String> = None;

        for pass in 0..2 {
            for (position, &idx) in chain.iter().enumerate() {
                let entry = settings[idx];
                let name = entry.name.as_str();
                let mut retries_left = entry.max_retries;

                while let Some(key) = self.keys.current(name).filter(|_| self.keys.is_available(name)) {
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(
                        Duration::from_millis(entry.timeout_ms),
                        call(idx, key.clone()),
                    )
                    .await
                    .unwrap_or(Err(ProviderError::Timeout(entry.timeout_ms)));
                    let elapsed = started.elapsed().as_millis() as u64;

                    let err = match outcome {
                        Ok(value) => {
                            self.keys.mark_success(name, &key, elapsed);
                            if position > 0 || pass > 0 {
                                info!("Fallback provider {} succeeded in {} ms", name, elapsed);
                            } else {
                                debug!("Provider {} succeeded in {} ms", name, elapsed);
                            }
                            return Ok(ChainSuccess {
                                value,
                                provider: name.to_string(),
                            });
                        }
                        Err(e) => e,
                    };

                    last_error = Some(format!("{name}: {err}"));

                    match err.kind() {
                        FailureKind::ExhaustedCredential => {
                            self.keys.mark_exhausted(name, &key, &err.to_string());
                            if !self.keys.is_available(name) {
                                warn!("Provider {} has no usable keys left, trying next provider", name);
                                break;
                            }
                            self.keys.rotate(name);
                            if retries_left == 0 {
                                warn!("Provider {} out of retries, trying next provider", name);
                                break;
                            }
                            retries_left -= 1;
                            info!("Retrying {} with the next key", name);
                        }
                        FailureKind::Transient => {
                            warn!("Provider {} failed: {}, trying next provider", name, err);
                            break;
                        }
                    }
                }
            }

            let all_exhausted = chain
                .iter()
                .all(|&idx| !self.keys.is_available(&settings[idx].name));
            if pass == 0 && all_exhausted {
                info!("Every provider in the chain is exhausted, resetting keys and retrying once");
                for &idx in chain {
                    self.keys.reset_provider(&settings[idx].name);
                }
                continue;
            }
            break;
        }

        Err(FallbackError::AllProvidersFailed {
            last_error: last_error.unwrap_or_else(|| "no provider attempted".to_string()),
        })
    }

    /// Chat completion over the fallback chain.
    ///
    /// `model` defaults to the configured model; providers of another vendor
    /// family substitute their own default model.
    pub async fn ai_completion(
        &self,
        messages: Vec<Message>,
        model: Option<&str>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, FallbackError> {
        let started = Instant::now();
        let requested = model.unwrap_or(&self.defaults.model).to_string();
        let options = CompletionOptions {
            temperature: options.temperature.or(Some(self.defaults.temperature)),
            max_tokens: options.max_tokens.or(Some(self.defaults.max_tokens)),
            ..options
        };

        let settings: Vec<&ProviderSettings> = self.chat.iter().map(|e| &e.settings).collect();
        let chain = self.available(settings.iter().copied());
        if chain.is_empty() {
            return Err(FallbackError::NoProvidersAvailable);
        }

        let request = CompletionRequest::new(messages, requested).with_options(options);

        let success = self
            .run_chain(&settings, &chain, |idx, key| {
                let entry = &self.chat[idx];
                let client = entry.client.clone();
                let mut request = request.clone();
                request.model = provider::model_for_provider(
                    entry.settings.kind,
                    &entry.settings.default_model,
                    &request.model,
                );
                async move { client.chat(&key, &request).await }
            })
            .await?;

        let mut response = success.value;
        response.provider = success.provider;
        response.processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    /// Code generation: a language-specific instruction, low temperature, and
    /// the answer unwrapped from its markdown fence.
    pub async fn generate_code_with_fallback(
        &self,
        prompt: &str,
        language: &str,
    ) -> Result<CompletionResponse, FallbackError> {
        let language = if language.trim().is_empty() { "the requested" } else { language.trim() };
        let messages = vec![
            Message::system(format!(
                "You are an expert {language} programmer. Reply with the complete, working {language} code \
                 in a single fenced code block. Keep explanations out of the code block and to a minimum."
            )),
            Message::user(prompt),
        ];
        let options = CompletionOptions {
            temperature: Some(self.defaults.code_temperature),
            ..CompletionOptions::default()
        };
        let code_model = self.defaults.code_model.clone();

        let mut response = self
            .ai_completion(messages, Some(&code_model), options)
            .await?;
        response.content = extract_code_block(&response.content);
        Ok(response)
    }

    /// Image generation over the image provider chain.
    /// Zero dimensions fall back to the configured defaults.
    pub async fn generate_image_with_fallback(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
    ) -> Result<ImageResponse, FallbackError> {
        let width = if width == 0 { self.defaults.image_width } else { width };
        let height = if height == 0 { self.defaults.image_height } else { height };

        let settings: Vec<&ProviderSettings> = self.image.iter().map(|e| &e.settings).collect();
        let chain = self.available(settings.iter().copied());
        if chain.is_empty() {
            return Err(FallbackError::NoProvidersAvailable);
        }

        let success = self
            .run_chain(&settings, &chain, |idx, key| {
                let client = self.image[idx].client.clone();
                let prompt = prompt.to_string();
                async move { client.generate_image(&key, &prompt, width, height).await }
            })
            .await?;

        Ok(success.value)
    }

    /// Multi-key "instant" answer: fan out one call per key with a distinct
    /// framing, then keep the best scoring answer.
    pub async fn instant_completion(&self, prompt: &str) -> Result<CompletionResponse, FallbackError> {
        let started = Instant::now();
        let entry = self
            .chat
            .iter()
            .find(|e| e.settings.name == self.selector.provider && e.settings.enabled)
            .ok_or(FallbackError::NoProvidersAvailable)?;
        let name = entry.settings.name.as_str();

        let keys = self.keys.available_keys(name);
        if keys.is_empty() {
            return Err(FallbackError::NoProvidersAvailable);
        }

        let framings: Vec<Option<&str>> = if self.selector.framings.is_empty() {
            vec![None; keys.len()]
        } else {
            self.selector.framings.iter().map(|f| Some(f.as_str())).collect()
        };
        let timeout = Duration::from_millis(self.selector.timeout_ms);
        let model = entry.settings.default_model.clone();

        let calls = keys.iter().zip(framings).map(|(key, framing)| {
            let mut messages = Vec::with_capacity(2);
            if let Some(framing) = framing {
                messages.push(Message::system(framing));
            }
            messages.push(Message::user(prompt));
            let request = CompletionRequest::new(messages, model.clone()).with_options(CompletionOptions {
                max_tokens: Some(self.selector.max_tokens),
                temperature: Some(self.defaults.temperature),
                ..CompletionOptions::default()
            });
            let client = entry.client.clone();
            let key = key.clone();
            async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, client.chat(&key, &request))
                    .await
                    .unwrap_or(Err(ProviderError::Timeout(timeout.as_millis() as u64)));
                (key, outcome, started.elapsed().as_millis() as u64)
            }
        });

        let results = join_all(calls).await;

        let mut successes = Vec::new();
        let mut last_error = None;
        for (key, outcome, elapsed) in results {
            match outcome {
                Ok(response) => {
                    self.keys.mark_success(name, &key, elapsed);
                    successes.push(response);
                }
                Err(e) => {
                    if e.is_exhausted_credential() {
                        self.keys.mark_exhausted(name, &key, &e.to_string());
                    } else {
                        warn!("Parallel {} call failed: {}", name, e);
                    }
                    last_error = Some(format!("{name}: {e}"));
                }
            }
        }

        let total = successes.len();
        let selection = selector::select_best(prompt, successes).ok_or_else(|| FallbackError::AllKeysFailed {
            last_error: last_error.unwrap_or_else(|| "no key attempted".to_string()),
        })?;
        debug!(
            "Selected 1 of {} parallel answers (confidence {:.2})",
            total, selection.confidence
        );

        let mut response = selection.primary;
        response.provider = name.to_string();
        response.confidence = Some(selection.confidence);
        response.alternatives = Some(selection.alternatives);
        response.processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    /// Snapshot of every chat and image provider.
    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        let chat = self.chat.iter().map(|e| &e.settings);
        let image = self.image.iter().map(|e| &e.settings);
        chat.chain(image)
            .map(|s| {
                let snapshot = self.keys.snapshot(&s.name);
                ProviderStatus {
                    name: s.name.clone(),
                    kind: s.kind,
                    priority: s.priority,
                    enabled: s.enabled,
                    available: s.enabled && self.keys.is_available(&s.name),
                    current_key_index: snapshot.as_ref().map(|r| r.current_index).unwrap_or(0),
                    keys: snapshot.map(|r| r.keys).unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Ping each chat provider with a tiny request on its current key.
    /// Pings run concurrently and never touch rotation state. Image providers
    /// are skipped since every call there is billed.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let pings = self.chat.iter().map(|entry| {
            let name = entry.settings.name.clone();
            let key = self.keys.peek(&name).filter(|_| entry.settings.enabled);
            let client = entry.client.clone();
            let timeout = Duration::from_millis(entry.settings.timeout_ms);
            let request = CompletionRequest::new(
                vec![Message::user("ping")],
                entry.settings.default_model.clone(),
            )
            .with_options(CompletionOptions {
                max_tokens: Some(5),
                ..CompletionOptions::default()
            });
            async move {
                let Some(key) = key else { return (name, false) };
                let healthy = match tokio::time::timeout(timeout, client.chat(&key, &request)).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        debug!("Health check for {} failed: {}", name, e);
                        false
                    }
                    Err(_) => false,
                };
                (name, healthy)
            }
        });

        join_all(pings).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted provider: pops one outcome per call and records the key used.
    struct Scripted {
        name: String,
        outcomes: Mutex<Vec<Result<String, ProviderError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(name: &str, outcomes: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn default_model(&self) -> &str {
            "test-model"
        }

        async fn chat(
            &self,
            api_key: &str,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            self.calls.lock().unwrap().push(api_key.to_string());
            let next = self
                .outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ProviderError::MalformedResponse("script exhausted".into())));
            next.map(|content| CompletionResponse::new(content, self.name.clone(), request.model.clone()))
        }
    }

    fn rate_limited() -> Result<String, ProviderError> {
        Err(ProviderError::Api {
            status: 429,
            message: "quota exceeded".into(),
        })
    }

    fn server_error() -> Result<String, ProviderError> {
        Err(ProviderError::Api {
            status: 500,
            message: "boom".into(),
        })
    }

    fn settings(name: &str, priority: u32, keys: &[&str]) -> ProviderSettings {
        let mut s = ProviderSettings::new(name, ProviderKind::OpenAiCompat, "test-model", priority);
        s.api_keys = keys.iter().map(|k| k.to_string()).collect();
        s.timeout_ms = 1_000;
        s
    }

    fn orchestrator() -> FallbackOrchestrator {
        let clock = Arc::new(ManualClock::default());
        FallbackOrchestrator::new(KeyRotationTable::new(clock, ChronoDuration::seconds(300)))
    }

    #[tokio::test]
    async fn test_first_provider_success_short_circuits() {
        let a = Scripted::new("a", vec![Ok("from a".into())]);
        let b = Scripted::new("b", vec![Ok("from b".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("b", 2, &["kb"]), b.clone());
        o.register_provider(settings("a", 1, &["ka"]), a.clone());

        let resp = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "from a");
        assert_eq!(resp.provider, "a");
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_falls_through_without_rotating() {
        let a = Scripted::new("a", vec![server_error()]);
        let b = Scripted::new("b", vec![Ok("from b".into())]);
        let c = Scripted::new("c", vec![Ok("from c".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["ka1", "ka2"]), a.clone());
        o.register_provider(settings("b", 2, &["kb"]), b.clone());
        o.register_provider(settings("c", 3, &["kc"]), c.clone());

        let resp = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.provider, "b");
        assert!(c.calls().is_empty());
        assert_eq!(o.keys().current("a").as_deref(), Some("ka1"));
        assert!(!o.keys().is_exhausted("a", "ka1"));
    }

    #[tokio::test]
    async fn test_exhausted_key_rotates_and_retries_same_provider() {
        let a = Scripted::new("a", vec![rate_limited(), Ok("second key".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["ka1", "ka2"]), a.clone());

        let resp = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "second key");
        assert_eq!(a.calls(), vec!["ka1", "ka2"]);
        assert!(o.keys().is_exhausted("a", "ka1"));
    }

    #[tokio::test]
    async fn test_retries_bounded_by_max_retries() {
        let a = Scripted::new("a", vec![rate_limited(), rate_limited(), Ok("never".into())]);
        let b = Scripted::new("b", vec![Ok("from b".into())]);
        let mut o = orchestrator();
        let mut sa = settings("a", 1, &["ka1", "ka2", "ka3"]);
        sa.max_retries = 1;
        o.register_provider(sa, a.clone());
        o.register_provider(settings("b", 2, &["kb"]), b.clone());

        let resp = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.provider, "b");
        assert_eq!(a.calls().len(), 2);
        // The next request starts on the one key that is still fresh.
        assert_eq!(o.keys().current("a").as_deref(), Some("ka3"));
    }

    #[tokio::test]
    async fn test_all_failing_reports_last_error() {
        let a = Scripted::new("a", vec![server_error()]);
        let b = Scripted::new(
            "b",
            vec![Err(ProviderError::MalformedResponse("no choices".into()))],
        );
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["ka"]), a);
        o.register_provider(settings("b", 2, &["kb"]), b);

        let err = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap_err();
        match err {
            FallbackError::AllProvidersFailed { last_error } => {
                assert!(last_error.contains("no choices"), "{last_error}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_total_exhaustion_resets_and_retries_once() {
        let a = Scripted::new("a", vec![rate_limited(), Ok("after reset".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["ka"]), a.clone());

        let resp = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "after reset");
        assert_eq!(a.calls(), vec!["ka", "ka"]);
    }

    #[tokio::test]
    async fn test_no_providers_available() {
        let o = orchestrator();
        let err = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::NoProvidersAvailable));

        let mut o = orchestrator();
        let mut disabled = settings("a", 1, &["ka"]);
        disabled.enabled = false;
        o.register_provider(disabled, Scripted::new("a", vec![Ok("x".into())]));
        o.register_provider(settings("b", 2, &[]), Scripted::new("b", vec![Ok("x".into())]));
        let err = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FallbackError::NoProvidersAvailable));
    }

    #[tokio::test]
    async fn test_cross_family_model_substituted() {
        let a = Scripted::new("a", vec![Ok("ok".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["ka"]), a);

        let resp = o
            .ai_completion(
                vec![Message::user("hi")],
                Some("gemini-2.0-flash"),
                CompletionOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(resp.model, "test-model");
    }

    #[tokio::test]
    async fn test_code_generation_strips_fence() {
        let a = Scripted::new("a", vec![Ok("```python\nprint('hi')\n```".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["ka"]), a);

        let resp = o.generate_code_with_fallback("say hi", "python").await.unwrap();
        assert_eq!(resp.content, "print('hi')");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        struct Slow;

        #[async_trait]
        impl LlmProvider for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            fn default_model(&self) -> &str {
                "test-model"
            }
            async fn chat(&self, _: &str, _: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(CompletionResponse::new("late", "slow", "test-model"))
            }
        }

        let b = Scripted::new("b", vec![Ok("from b".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("slow", 1, &["ks"]), Arc::new(Slow));
        o.register_provider(settings("b", 2, &["kb"]), b);

        let resp = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.provider, "b");
        assert!(!o.keys().is_exhausted("slow", "ks"));
    }

    #[tokio::test]
    async fn test_health_check_does_not_mark_keys() {
        let a = Scripted::new("a", vec![rate_limited()]);
        let b = Scripted::new("b", vec![Ok("pong".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["ka"]), a);
        o.register_provider(settings("b", 2, &["kb"]), b);

        let health = o.health_check().await;
        assert_eq!(health.get("a"), Some(&false));
        assert_eq!(health.get("b"), Some(&true));
        assert!(!o.keys().is_exhausted("a", "ka"));
    }

    #[tokio::test]
    async fn test_health_check_leaves_key_index() {
        let a = Scripted::new("a", vec![Ok("pong".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["ka1", "ka2"]), a.clone());
        o.keys().mark_exhausted("a", "ka1", "429");

        let health = o.health_check().await;
        assert_eq!(health.get("a"), Some(&true));
        assert_eq!(a.calls(), vec!["ka2"]);
        assert_eq!(o.keys().snapshot("a").unwrap().current_index, 0);
    }

    #[tokio::test]
    async fn test_two_exhausted_providers_reset_and_second_recovers() {
        let a = Scripted::new("a", vec![rate_limited(), rate_limited()]);
        let b = Scripted::new("b", vec![rate_limited(), Ok("b after reset".into())]);
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["ka"]), a.clone());
        o.register_provider(settings("b", 2, &["kb"]), b.clone());

        let resp = o
            .ai_completion(vec![Message::user("hi")], None, CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "b after reset");
        assert_eq!(resp.provider, "b");
        assert_eq!(a.calls(), vec!["ka", "ka"]);
        assert_eq!(b.calls(), vec!["kb", "kb"]);
        assert!(o.keys().is_exhausted("a", "ka"));
        assert!(!o.keys().is_exhausted("b", "kb"));
    }

    #[test]
    fn test_provider_status_snapshot() {
        let mut o = orchestrator();
        o.register_provider(settings("a", 1, &["key-aaaaaaaa1"]), Scripted::new("a", vec![]));
        o.keys().mark_exhausted("a", "key-aaaaaaaa1", "429");

        let status = o.provider_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "a");
        assert!(!status[0].available);
        assert!(status[0].keys[0].exhausted);
        assert_eq!(status[0].keys[0].error_count, 1);
    }
}
