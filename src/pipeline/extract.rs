//! Field extraction: the external-service contract and its VLM implementation.
//!
//! The runner only sees the [`FieldExtractor`] trait. [`VisionExtractor`]
//! implements it on top of any `edgequake-llm` vision provider: one system
//! prompt generated from the schema, one user message carrying every page.
//!
//! ## Retry Strategy
//!
//! [`extract_with_retry`] retries `ServiceUnavailable` only, up to
//! `max_attempts` calls in total, sleeping `retry_backoff_ms * 2^(n-1)`
//! between them: 500 ms → 1 s with the defaults. `QuotaExceeded` and
//! `MalformedResponse` are returned immediately.

use crate::config::PipelineConfig;
use crate::error::{DocumentError, ExtractError, InvoiceError};
use crate::model::{ExtractionResponse, PageImage};
use crate::pipeline::{encode, normalize};
use crate::prompts::extraction_prompt;
use crate::schema::FieldSchema;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Default model when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Turns page images into schema fields.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    /// Extract `schema` from `pages` (in page order).
    ///
    /// Fields the service could not locate must come back as
    /// [`crate::schema::FieldValue::Absent`], never omitted.
    async fn extract(
        &self,
        pages: &[PageImage],
        schema: &FieldSchema,
    ) -> Result<ExtractionResponse, ExtractError>;

    /// Identifier recorded with each extraction, e.g. `openai/gpt-4.1-nano`.
    fn label(&self) -> String {
        "unknown".to_string()
    }
}

/// Bounded retry policy for transient extraction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls, including the first. At least 1.
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_ms: config.retry_backoff_ms,
        }
    }

    /// Delay before attempt `attempt` (1-based; the first attempt has none).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 2);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Call `extractor`, retrying while the service is unavailable.
pub async fn extract_with_retry(
    extractor: &dyn FieldExtractor,
    pages: &[PageImage],
    schema: &FieldSchema,
    policy: &RetryPolicy,
) -> Result<ExtractionResponse, DocumentError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            warn!(
                "Extraction retry {}/{} after {}ms",
                attempt,
                max_attempts,
                delay.as_millis()
            );
            sleep(delay).await;
        }

        match extractor.extract(pages, schema).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!("Extraction attempt {} failed: {}", attempt, e);
                attempt += 1;
            }
            Err(e) => return Err(e.into_document_error(attempt)),
        }
    }
}

/// [`FieldExtractor`] backed by an `edgequake-llm` vision provider.
pub struct VisionExtractor {
    provider: Arc<dyn LLMProvider>,
    label: String,
    system_prompt: Option<String>,
    options: CompletionOptions,
    call_timeout: Option<Duration>,
}

impl VisionExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
            system_prompt: None,
            options: CompletionOptions {
                temperature: Some(0.0),
                max_tokens: Some(2048),
                ..Default::default()
            },
            call_timeout: None,
        }
    }

    /// Build from the pipeline config, resolving the provider as
    /// [`resolve_provider`] does.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, InvoiceError> {
        let (provider, label) = resolve_provider(config)?;
        let mut extractor = Self::new(provider, label);
        extractor.system_prompt = config.system_prompt.clone();
        extractor.options = build_options(config);
        extractor.call_timeout = config.service_timeout_seconds.map(Duration::from_secs);
        Ok(extractor)
    }
}

#[async_trait]
impl FieldExtractor for VisionExtractor {
    async fn extract(
        &self,
        pages: &[PageImage],
        schema: &FieldSchema,
    ) -> Result<ExtractionResponse, ExtractError> {
        if pages.is_empty() {
            return Err(ExtractError::MalformedResponse(
                "no page images to submit".into(),
            ));
        }

        let images = pages
            .iter()
            .map(encode::encode_page)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ExtractError::MalformedResponse(format!("image encoding failed: {e}")))?;

        let prompt = self
            .system_prompt
            .clone()
            .unwrap_or_else(|| extraction_prompt(schema));
        let messages = vec![
            ChatMessage::system(prompt),
            ChatMessage::user_with_images("Extract the fields from this bill.", images),
        ];

        let start = Instant::now();
        let call = self.provider.chat(&messages, Some(&self.options));
        let result = match self.call_timeout {
            Some(limit) => timeout(limit, call).await.map_err(|_| {
                ExtractError::ServiceUnavailable(format!(
                    "no response within {}s",
                    limit.as_secs()
                ))
            })?,
            None => call.await,
        };
        let response = result.map_err(|e| classify_provider_error(&e.to_string()))?;

        debug!(
            "{} pages: {} input tokens, {} output tokens, {:?}",
            pages.len(),
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        let normalized = normalize::parse_response(&response.content, schema)
            .map_err(ExtractError::MalformedResponse)?;

        Ok(ExtractionResponse {
            fields: normalized.fields,
            raw_response: response.content,
            validation_errors: normalized.validation_errors,
            model: self.label.clone(),
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

/// Map a provider error message onto the extractor taxonomy.
///
/// Providers report exhausted quota as HTTP 429 with a quota/billing body.
/// Per-minute rate limits share the status and often the word "quota"
/// (Gemini's `RESOURCE_EXHAUSTED ... per minute`), so they are checked
/// first: only an exhausted quota stops the run.
pub fn classify_provider_error(message: &str) -> ExtractError {
    let lower = message.to_lowercase();
    let rate_limit_markers = [
        "per minute",
        "per_minute",
        "perminute",
        "rate limit",
        "rate_limit",
        "too many requests",
    ];
    let quota_markers = [
        "insufficient_quota",
        "quota",
        "billing",
        "credit balance",
        "resource_exhausted",
        "resource has been exhausted",
    ];
    if rate_limit_markers.iter().any(|m| lower.contains(m)) {
        ExtractError::ServiceUnavailable(message.to_string())
    } else if quota_markers.iter().any(|m| lower.contains(m)) {
        ExtractError::QuotaExceeded(message.to_string())
    } else {
        ExtractError::ServiceUnavailable(message.to_string())
    }
}

/// Build `CompletionOptions` from the pipeline config.
fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`)
/// 2. **Named provider + model** (`config.provider_name`)
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`)
/// 4. **OpenAI** when `OPENAI_API_KEY` is set
/// 5. **Full auto-detection** (`ProviderFactory::from_env`)
///
/// Returns the provider and a `provider/model` label stored with every
/// extraction record.
pub fn resolve_provider(
    config: &PipelineConfig,
) -> Result<(Arc<dyn LLMProvider>, String), InvoiceError> {
    if let Some(ref provider) = config.provider {
        let label = config.model.clone().unwrap_or_else(|| "custom".to_string());
        return Ok((Arc::clone(provider), label));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| InvoiceError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, GEMINI_API_KEY, or ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok((llm_provider, "auto".to_string()))
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<(Arc<dyn LLMProvider>, String), InvoiceError> {
    let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        InvoiceError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })?;
    Ok((provider, format!("{provider_name}/{model}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ExtractedFields;
    use edgequake_llm::{LLMResponse, LlmError};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `error` for the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        error: ExtractError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl FieldExtractor for Flaky {
        async fn extract(
            &self,
            _pages: &[PageImage],
            _schema: &FieldSchema,
        ) -> Result<ExtractionResponse, ExtractError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            Ok(ExtractionResponse {
                fields: ExtractedFields::new(),
                raw_response: "{}".into(),
                validation_errors: vec![],
                model: "test".into(),
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    fn flaky(failures: u32, error: ExtractError) -> Flaky {
        Flaky {
            failures,
            error,
            calls: AtomicU32::new(0),
        }
    }

    const FAST: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        backoff_ms: 1,
    };

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy {
            max_attempts: 4,
            backoff_ms: 500,
        };
        assert_eq!(p.delay_before(1), Duration::ZERO);
        assert_eq!(p.delay_before(2), Duration::from_millis(500));
        assert_eq!(p.delay_before(3), Duration::from_millis(1000));
        assert_eq!(p.delay_before(4), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_budget() {
        let x = flaky(2, ExtractError::ServiceUnavailable("503".into()));
        let schema = FieldSchema::default();
        assert!(extract_with_retry(&x, &[], &schema, &FAST).await.is_ok());
        assert_eq!(x.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failure_exhausts_attempts() {
        let x = flaky(10, ExtractError::ServiceUnavailable("503".into()));
        let schema = FieldSchema::default();
        let err = extract_with_retry(&x, &[], &schema, &FAST).await.unwrap_err();
        assert_eq!(err.kind(), "ServiceUnavailable");
        assert!(matches!(err, DocumentError::ServiceUnavailable { attempts: 3, .. }));
        assert_eq!(x.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn quota_and_malformed_are_not_retried() {
        let schema = FieldSchema::default();

        let q = flaky(10, ExtractError::QuotaExceeded("no credit".into()));
        let err = extract_with_retry(&q, &[], &schema, &FAST).await.unwrap_err();
        assert!(err.is_run_fatal());
        assert_eq!(q.calls.load(Ordering::SeqCst), 1);

        let m = flaky(10, ExtractError::MalformedResponse("not json".into()));
        let err = extract_with_retry(&m, &[], &schema, &FAST).await.unwrap_err();
        assert_eq!(err.kind(), "MalformedResponse");
        assert_eq!(m.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classify_quota_versus_transient() {
        assert!(matches!(
            classify_provider_error("429: You exceeded your current quota (insufficient_quota)"),
            ExtractError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_provider_error("RESOURCE_EXHAUSTED: Resource has been exhausted"),
            ExtractError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_provider_error("503 Service Unavailable"),
            ExtractError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            classify_provider_error("connection reset by peer"),
            ExtractError::ServiceUnavailable(_)
        ));
    }

    #[test]
    fn per_minute_limits_are_transient() {
        assert!(matches!(
            classify_provider_error(
                "429 RESOURCE_EXHAUSTED: Quota exceeded for quota metric \
                 'Generate Content API requests per minute'"
            ),
            ExtractError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            classify_provider_error("Rate limit exceeded: too many requests"),
            ExtractError::ServiceUnavailable(_)
        ));
    }

    // ── VisionExtractor against in-process providers ─────────────────────

    /// What [`StubProvider`] does on `chat`.
    enum Reply {
        Text(&'static str),
        Fail(&'static str),
        Hang,
    }

    struct StubProvider {
        reply: Reply,
        calls: AtomicU32,
    }

    fn stub(reply: Reply) -> Arc<StubProvider> {
        Arc::new(StubProvider {
            reply,
            calls: AtomicU32::new(0),
        })
    }

    #[async_trait]
    impl LLMProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn model(&self) -> &str {
            "stub-vision"
        }

        fn max_context_length(&self) -> usize {
            8192
        }

        async fn complete(&self, _prompt: &str) -> edgequake_llm::Result<LLMResponse> {
            self.chat(&[], None).await
        }

        async fn complete_with_options(
            &self,
            _prompt: &str,
            options: &CompletionOptions,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.chat(&[], Some(options)).await
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: Option<&CompletionOptions>,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Reply::Text(body) => {
                    let mut response = LLMResponse::new(body, "stub-vision");
                    response.prompt_tokens = 900;
                    response.completion_tokens = 40;
                    Ok(response)
                }
                Reply::Fail(message) => Err(LlmError::ApiError(message.to_string())),
                Reply::Hang => {
                    sleep(Duration::from_secs(30)).await;
                    Ok(LLMResponse::new("{}", "stub-vision"))
                }
            }
        }
    }

    fn one_page() -> Vec<PageImage> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            4,
            4,
            image::Rgb([255, 255, 255]),
        ));
        vec![PageImage::new(0, img)]
    }

    #[tokio::test]
    async fn vision_extractor_normalizes_reply() {
        let provider = stub(Reply::Text(
            "```json\n{\"vendor\": \"City Power\", \"total\": \"$1,204.50\"}\n```",
        ));
        let extractor = VisionExtractor::new(provider.clone(), "stub/stub-vision");
        let schema = FieldSchema::default();

        let response = extractor.extract(&one_page(), &schema).await.unwrap();
        assert_eq!(
            response.fields.get("vendor"),
            &crate::schema::FieldValue::Text("City Power".into())
        );
        assert_eq!(
            response.fields.get("total"),
            &crate::schema::FieldValue::Amount(rust_decimal_macros::dec!(1204.50))
        );
        assert!(response.fields.get("due_date").is_absent());
        assert_eq!(response.model, "stub/stub-vision");
        assert_eq!((response.input_tokens, response.output_tokens), (900, 40));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn vision_extractor_with_mock_provider_rejects_prose() {
        let provider = Arc::new(edgequake_llm::MockProvider::new());
        provider.add_response("I could not read this bill, sorry.").await;
        let extractor = VisionExtractor::new(provider, "mock");

        let err = extractor
            .extract(&one_page(), &FieldSchema::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn vision_extractor_refuses_empty_documents() {
        let provider = stub(Reply::Text("{}"));
        let extractor = VisionExtractor::new(provider.clone(), "stub");

        let err = extractor.extract(&[], &FieldSchema::default()).await.unwrap_err();
        assert!(matches!(err, ExtractError::MalformedResponse(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vision_extractor_times_out_as_unavailable() {
        let mut extractor = VisionExtractor::new(stub(Reply::Hang), "stub");
        extractor.call_timeout = Some(Duration::from_millis(20));

        let started = Instant::now();
        let err = extractor
            .extract(&one_page(), &FieldSchema::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::ServiceUnavailable(_)));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn vision_extractor_classifies_provider_errors() {
        let schema = FieldSchema::default();

        let quota = VisionExtractor::new(
            stub(Reply::Fail("429 insufficient_quota: check your plan and billing")),
            "stub",
        );
        let err = quota.extract(&one_page(), &schema).await.unwrap_err();
        assert!(matches!(err, ExtractError::QuotaExceeded(_)));

        let rate = VisionExtractor::new(
            stub(Reply::Fail("429 RESOURCE_EXHAUSTED: quota metric requests per minute")),
            "stub",
        );
        let err = rate.extract(&one_page(), &schema).await.unwrap_err();
        assert!(matches!(err, ExtractError::ServiceUnavailable(_)));

        let down = VisionExtractor::new(stub(Reply::Fail("502 Bad Gateway")), "stub");
        let err = down.extract(&one_page(), &schema).await.unwrap_err();
        assert!(matches!(err, ExtractError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn repeated_timeouts_exhaust_retries() {
        let extractor = {
            let mut x = VisionExtractor::new(stub(Reply::Hang), "stub");
            x.call_timeout = Some(Duration::from_millis(10));
            x
        };
        let err = extract_with_retry(&extractor, &one_page(), &FieldSchema::default(), &FAST)
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::ServiceUnavailable { attempts: 3, .. }));
    }

    #[test]
    fn build_options_from_config() {
        let config = PipelineConfig::default();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(2048));
    }
}
