//! Core rate limiter implementation.
//!
//! Every request goes through the same steps: skip check, key derivation,
//! count, limit resolution, header emission, uncount bookkeeping, and the
//! allow/block decision. The limiter holds no per-request state of its own;
//! counts live in the store and the resolved configuration never changes
//! after construction.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use super::exchange::{within_request, Flow, Request, Response, ResponseEvent};
use super::headers::{
    set_draft6_headers, set_draft7_headers, set_draft8_headers, set_legacy_headers,
    set_retry_after_header, StandardHeaders,
};
use super::info::RateLimitInfo;
use super::options::{Options, Rejection, ResolvedConfig};
use super::store::ClientRateLimitInfo;
use super::validation::Validations;
use crate::error::{BoxError, RateLimitError, Result};

/// Outcome of evaluating one request.
#[derive(Debug)]
pub struct Evaluation {
    /// Whether the host should call the next handler
    pub flow: Flow,
    /// Uncounting hook, present when either uncounting flag is set
    pub completion: Option<CompletionHook>,
}

impl Evaluation {
    fn pass() -> Self {
        Self {
            flow: Flow::Next,
            completion: None,
        }
    }
}

/// A rate limiter bound to one store.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<ResolvedConfig>,
    validations: Arc<Validations>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("validations", &self.validations)
            .finish()
    }
}

impl RateLimiter {
    /// Build a limiter from `options`.
    ///
    /// Fails immediately if the options are inconsistent, for example when
    /// uncounting is requested from a store that cannot decrement.
    pub fn new(options: Options) -> Result<Self> {
        let validations = options.validations();
        let config = ResolvedConfig::resolve(options, &validations)?;

        info!(
            window_ms = config.window.as_millis() as u64,
            standard_headers = %config.standard_headers,
            uncounting = config.uncounts(),
            "Rate limiter created"
        );

        Ok(Self {
            config: Arc::new(config),
            validations: Arc::new(validations),
        })
    }

    /// The resolved configuration.
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Count `request` and decide whether it may proceed.
    ///
    /// Headers are written to `response`. Blocked requests are answered
    /// through the configured handler and come back as [`Flow::Stop`].
    /// Errors from user callbacks are returned as-is; store errors are
    /// returned unless the limiter fails open.
    pub async fn evaluate(
        &self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<Evaluation> {
        let config = &self.config;
        let validations = &self.validations;

        if config.skip.resolve(request).await? {
            debug!("Skipping rate limit for request");
            return Ok(Evaluation::pass());
        }

        let custom_keys = config.key_generator.is_custom();
        if !custom_keys {
            validations.ip(request.client_ip.as_deref());
            validations.trust_proxy(request);
            validations.x_forwarded_for_header(request);
        }
        let key = config.key_generator.key(request).await?;
        if custom_keys {
            validations.key_generator_ip_fallback(request, &key);
        }

        let record = match config.store.increment(&key).await {
            Ok(record) => record,
            Err(e) if config.pass_on_store_error => {
                error!(key = %key, error = %e, "Store increment failed, letting request through");
                return Ok(Evaluation::pass());
            }
            Err(e) => return Err(e.into()),
        };
        validations.positive_hits(record.total_hits);
        validations.single_count(request, &config.store, &key);

        let limit = config.limit.resolve(request).await?;
        validations.limit(limit);

        let info = RateLimitInfo::new(limit, record, key.as_str());
        request.set_rate_limit(&config.request_property_name, info.clone());

        if config.legacy_headers {
            set_legacy_headers(response, &info);
        }
        match config.standard_headers {
            StandardHeaders::Off => {}
            StandardHeaders::Draft6 => set_draft6_headers(response, &info, config.window),
            StandardHeaders::Draft7 => {
                validations.headers_reset_time(info.reset_time);
                set_draft7_headers(response, &info, config.window);
            }
            StandardHeaders::Draft8 => {
                validations.headers_reset_time(info.reset_time);
                let name = config.resolve_identifier(request, limit).await?;
                set_draft8_headers(response, &info, config.window, &name, &key);
            }
        }

        let completion = config
            .uncounts()
            .then(|| CompletionHook::new(self.config.clone(), key.clone()));

        validations.disable();

        if !info.is_exceeded() {
            debug!(
                key = %key,
                used = info.used,
                limit = info.limit,
                remaining = info.remaining,
                "Request allowed"
            );
            return Ok(Evaluation {
                flow: Flow::Next,
                completion,
            });
        }

        if info.just_reached() {
            if let Some(on_limit_reached) = &config.on_limit_reached {
                on_limit_reached(request, &info);
            }
        }

        if config.legacy_headers || config.standard_headers != StandardHeaders::Off {
            set_retry_after_header(response, &info, config.window);
        }

        debug!(
            key = %key,
            used = info.used,
            limit = info.limit,
            "Request blocked"
        );

        let rejection = Rejection {
            status_code: config.status_code,
            message: config.message.resolve(request).await?,
            info,
        };
        (config.handler)(request, response, &rejection).map_err(RateLimitError::Callback)?;

        Ok(Evaluation {
            flow: Flow::Stop,
            completion,
        })
    }

    /// Evaluate `request` and, if it is allowed, run `next`.
    ///
    /// Completion events are forwarded to the uncounting hook: `Finish`
    /// once the response is done, `Error` if `next` fails. Both run inside
    /// a request scope, so limiters created by `next` are reported.
    pub async fn run<F>(
        &self,
        request: &mut Request,
        response: &mut Response,
        next: F,
    ) -> Result<Flow>
    where
        F: for<'r> FnOnce(
            &'r mut Request,
            &'r mut Response,
        ) -> BoxFuture<'r, std::result::Result<(), BoxError>>,
    {
        let evaluation = within_request(self.evaluate(request, response)).await?;

        if evaluation.flow == Flow::Stop {
            if let Some(hook) = &evaluation.completion {
                hook.notify(ResponseEvent::Finish, request, response).await?;
            }
            return Ok(Flow::Stop);
        }

        match within_request(next(request, response)).await {
            Ok(()) => {
                response.finish();
                if let Some(hook) = &evaluation.completion {
                    hook.notify(ResponseEvent::Finish, request, response).await?;
                }
                Ok(Flow::Next)
            }
            Err(e) => {
                if let Some(hook) = &evaluation.completion {
                    if let Err(uncount_error) =
                        hook.notify(ResponseEvent::Error, request, response).await
                    {
                        warn!(error = %uncount_error, "Failed to uncount errored request");
                    }
                }
                Err(RateLimitError::Callback(e))
            }
        }
    }

    /// Drop the record for `key`.
    pub async fn reset_key(&self, key: &str) -> Result<()> {
        self.config.store.reset_key(key).await?;
        debug!(key = %key, "Reset rate limit key");
        Ok(())
    }

    /// Read the record for `key`, if the store supports it.
    pub async fn get_key(&self, key: &str) -> Result<Option<ClientRateLimitInfo>> {
        Ok(self.config.store.get(key).await?)
    }
}

struct CompletionState {
    config: Arc<ResolvedConfig>,
    key: String,
    decremented: AtomicBool,
}

/// Uncounts a request once its outcome is known.
///
/// Hosts forward every response lifecycle event; the store is decremented
/// at most once no matter how many events arrive or in what order.
#[derive(Clone)]
pub struct CompletionHook {
    state: Arc<CompletionState>,
}

impl fmt::Debug for CompletionHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHook")
            .field("key", &self.state.key)
            .field("decremented", &self.is_decremented())
            .finish()
    }
}

impl CompletionHook {
    fn new(config: Arc<ResolvedConfig>, key: String) -> Self {
        Self {
            state: Arc::new(CompletionState {
                config,
                key,
                decremented: AtomicBool::new(false),
            }),
        }
    }

    /// The key this request was counted under.
    pub fn key(&self) -> &str {
        &self.state.key
    }

    /// Whether the request has been uncounted.
    pub fn is_decremented(&self) -> bool {
        self.state.decremented.load(Ordering::Acquire)
    }

    /// Handle a lifecycle event. Returns whether this call uncounted the request.
    pub async fn notify(
        &self,
        event: ResponseEvent,
        request: &Request,
        response: &Response,
    ) -> Result<bool> {
        let config = &self.state.config;

        let uncount = match event {
            ResponseEvent::Finish => {
                if !config.skip_successful_requests && !config.skip_failed_requests {
                    false
                } else {
                    let successful = config.was_successful(request, response).await?;
                    if successful {
                        config.skip_successful_requests
                    } else {
                        config.skip_failed_requests
                    }
                }
            }
            ResponseEvent::Close => config.skip_failed_requests && !response.is_finished(),
            ResponseEvent::Error => config.skip_failed_requests,
        };

        if !uncount {
            return Ok(false);
        }
        self.decrement().await
    }

    async fn decrement(&self) -> Result<bool> {
        if self.state.decremented.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        let config = &self.state.config;
        match config.store.decrement(&self.state.key).await {
            Ok(()) => {
                debug!(key = %self.state.key, "Uncounted request");
                Ok(true)
            }
            Err(e) if config.pass_on_store_error => {
                error!(key = %self.state.key, error = %e, "Store decrement failed");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::ratelimit::memory::MemoryStore;
    use crate::ratelimit::store::Store;
    use async_trait::async_trait;
    use http::StatusCode;
    use std::sync::atomic::AtomicUsize;

    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn increment(&self, _key: &str) -> std::result::Result<ClientRateLimitInfo, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }

        async fn reset_key(&self, _key: &str) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    fn limiter(options: Options) -> RateLimiter {
        RateLimiter::new(options.validate(false)).unwrap()
    }

    async fn hit(limiter: &RateLimiter, ip: &str) -> (Request, Response, Evaluation) {
        let mut request = Request::from_ip(ip);
        let mut response = Response::new();
        let evaluation = limiter.evaluate(&mut request, &mut response).await.unwrap();
        (request, response, evaluation)
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_then_blocks() {
        let limiter = limiter(Options::new().limit(3));

        for ordinal in 1..=5u64 {
            let (request, response, evaluation) = hit(&limiter, "10.0.0.1").await;
            let info = request.rate_limit("rateLimit").unwrap();
            assert_eq!(info.used, ordinal);

            if ordinal <= 3 {
                assert_eq!(evaluation.flow, Flow::Next);
                assert_eq!(response.status, StatusCode::OK);
            } else {
                assert_eq!(evaluation.flow, Flow::Stop);
                assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(
                    response.body,
                    Some(serde_json::json!("Too many requests, please try again later."))
                );
            }
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(Options::new().limit(1));

        assert_eq!(hit(&limiter, "10.0.0.1").await.2.flow, Flow::Next);
        assert_eq!(hit(&limiter, "10.0.0.2").await.2.flow, Flow::Next);
        assert_eq!(hit(&limiter, "10.0.0.1").await.2.flow, Flow::Stop);
    }

    #[tokio::test]
    async fn test_ipv6_clients_share_a_subnet() {
        let limiter = limiter(Options::new().limit(1).ipv6_subnet(64));

        assert_eq!(hit(&limiter, "2001:db8::1").await.2.flow, Flow::Next);
        let (request, _, evaluation) = hit(&limiter, "2001:db8::ffff").await;
        assert_eq!(evaluation.flow, Flow::Stop);
        assert_eq!(request.rate_limit("rateLimit").unwrap().key, "2001:db8::/64");
    }

    #[tokio::test]
    async fn test_skip_bypasses_counting() {
        let limiter = limiter(
            Options::new()
                .limit(1)
                .skip(|request| request.header("x-internal").is_some()),
        );

        for _ in 0..3 {
            let mut request = Request::from_ip("10.0.0.1").with_header("x-internal", "1");
            let mut response = Response::new();
            let evaluation = limiter.evaluate(&mut request, &mut response).await.unwrap();
            assert_eq!(evaluation.flow, Flow::Next);
            assert!(request.rate_limit("rateLimit").is_none());
            assert!(response.headers.is_empty());
        }

        assert_eq!(hit(&limiter, "10.0.0.1").await.2.flow, Flow::Next);
    }

    #[tokio::test]
    async fn test_fail_closed_by_default() {
        let limiter = limiter(Options::new().store(Arc::new(BrokenStore)));
        let mut request = Request::from_ip("10.0.0.1");
        let mut response = Response::new();

        let err = limiter.evaluate(&mut request, &mut response).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Store(StoreError::Backend(_))));
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_fail_open() {
        let limiter = limiter(
            Options::new()
                .store(Arc::new(BrokenStore))
                .pass_on_store_error(true),
        );

        let (request, response, evaluation) = hit(&limiter, "10.0.0.1").await;
        assert_eq!(evaluation.flow, Flow::Next);
        assert!(request.rate_limit("rateLimit").is_none());
        assert!(response.headers.is_empty());
    }

    #[tokio::test]
    async fn test_custom_property_name_and_key_generator() {
        let limiter = limiter(
            Options::new()
                .request_property_name("quota")
                .key_generator(|request| {
                    request
                        .header("x-api-key")
                        .map(str::to_string)
                        .ok_or_else(|| "missing api key".into())
                }),
        );

        let mut request = Request::from_ip("10.0.0.1").with_header("x-api-key", "abc");
        let mut response = Response::new();
        limiter.evaluate(&mut request, &mut response).await.unwrap();
        assert_eq!(request.rate_limit("quota").unwrap().key, "abc");
        assert!(request.rate_limit("rateLimit").is_none());

        let mut request = Request::from_ip("10.0.0.1");
        let err = limiter.evaluate(&mut request, &mut response).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Callback(_)));
    }

    #[tokio::test]
    async fn test_on_limit_reached_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let limiter = limiter(Options::new().limit(1).on_limit_reached(move |_, info| {
            assert_eq!(info.used, 2);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..4 {
            hit(&limiter, "10.0.0.1").await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_handler() {
        let limiter = limiter(
            Options::new()
                .limit(0)
                .status_code(StatusCode::SERVICE_UNAVAILABLE)
                .message(serde_json::json!({ "error": "busy" }))
                .handler(|_, response, rejection| {
                    response.set_header(
                        http::header::HeaderName::from_static("x-blocked-key"),
                        &rejection.info.key,
                    );
                    response.send(rejection.status_code, rejection.message.clone());
                    Ok(())
                }),
        );

        let (_, response, evaluation) = hit(&limiter, "10.0.0.1").await;
        assert_eq!(evaluation.flow, Flow::Stop);
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.header("x-blocked-key"), Some("10.0.0.1"));
        assert_eq!(response.body, Some(serde_json::json!({ "error": "busy" })));
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let limiter = limiter(
            Options::new()
                .limit(0)
                .handler(|_, _, _| Err("handler exploded".into())),
        );

        let mut request = Request::from_ip("10.0.0.1");
        let mut response = Response::new();
        let err = limiter.evaluate(&mut request, &mut response).await.unwrap_err();
        assert_eq!(err.to_string(), "handler exploded");
    }

    #[tokio::test]
    async fn test_standard_headers_draft7_with_retry_after() {
        let limiter = limiter(
            Options::new()
                .limit(1)
                .legacy_headers(false)
                .standard_headers(StandardHeaders::Draft7),
        );

        let (_, response, _) = hit(&limiter, "10.0.0.1").await;
        assert!(response.header("x-ratelimit-limit").is_none());
        assert!(response.header("retry-after").is_none());
        assert!(response
            .header("ratelimit")
            .unwrap()
            .starts_with("limit=1, remaining=0, reset="));

        let (_, response, _) = hit(&limiter, "10.0.0.1").await;
        assert!(response.header("retry-after").unwrap().parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_draft8_identifier() {
        let limiter = limiter(
            Options::new()
                .limit(10)
                .window(std::time::Duration::from_secs(30))
                .standard_headers(StandardHeaders::Draft8),
        );

        let (_, response, _) = hit(&limiter, "10.0.0.1").await;
        assert!(response
            .header("ratelimit-policy")
            .unwrap()
            .starts_with("\"10-in-30sec\"; q=10; w=30; pk=:"));
    }

    #[tokio::test]
    async fn test_no_headers_when_disabled() {
        let limiter = limiter(Options::new().limit(0).legacy_headers(false));

        let (_, response, evaluation) = hit(&limiter, "10.0.0.1").await;
        assert_eq!(evaluation.flow, Flow::Stop);
        assert!(response.header("retry-after").is_none());
        assert!(response.header("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_completion_hook_only_when_uncounting() {
        let limiter_plain = limiter(Options::new());
        assert!(hit(&limiter_plain, "10.0.0.1").await.2.completion.is_none());

        let limiter_uncounting = limiter(Options::new().skip_failed_requests(true));
        let completion = hit(&limiter_uncounting, "10.0.0.1").await.2.completion.unwrap();
        assert_eq!(completion.key(), "10.0.0.1");
        assert!(!completion.is_decremented());
    }

    #[tokio::test]
    async fn test_close_before_finish_uncounts_failed() {
        let limiter = limiter(
            Options::new()
                .store(Arc::new(MemoryStore::bucketed(4)))
                .skip_failed_requests(true),
        );

        let (request, response, evaluation) = hit(&limiter, "10.0.0.1").await;
        let completion = evaluation.completion.unwrap();

        assert!(completion
            .notify(ResponseEvent::Close, &request, &response)
            .await
            .unwrap());
        assert!(!completion
            .notify(ResponseEvent::Error, &request, &response)
            .await
            .unwrap());

        let record = limiter.get_key("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record.total_hits, 0);
    }

    #[tokio::test]
    async fn test_close_after_finish_keeps_count() {
        let limiter = limiter(Options::new().skip_failed_requests(true));

        let (request, mut response, evaluation) = hit(&limiter, "10.0.0.1").await;
        response.finish();
        let completion = evaluation.completion.unwrap();

        assert!(!completion
            .notify(ResponseEvent::Close, &request, &response)
            .await
            .unwrap());
        assert!(!completion
            .notify(ResponseEvent::Finish, &request, &response)
            .await
            .unwrap());
        assert_eq!(limiter.get_key("10.0.0.1").await.unwrap().unwrap().total_hits, 1);
    }

    #[tokio::test]
    async fn test_run_calls_next_only_when_allowed() {
        let limiter = limiter(Options::new().limit(1));
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in [Flow::Next, Flow::Stop] {
            let mut request = Request::from_ip("10.0.0.1");
            let mut response = Response::new();
            let counter = calls.clone();
            let flow = limiter
                .run(&mut request, &mut response, move |_, response| {
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        response.status = StatusCode::OK;
                        Ok(())
                    })
                })
                .await
                .unwrap();
            assert_eq!(flow, expected);
            assert!(response.is_finished());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_uncounts_when_next_fails() {
        let limiter = limiter(Options::new().limit(1).skip_failed_requests(true));

        let mut request = Request::from_ip("10.0.0.1");
        let mut response = Response::new();
        let err = limiter
            .run(&mut request, &mut response, |_, _| {
                Box::pin(async { Err::<(), BoxError>("downstream failed".into()) })
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "downstream failed");
        assert_eq!(limiter.get_key("10.0.0.1").await.unwrap().unwrap().total_hits, 0);
    }

    #[tokio::test]
    async fn test_reset_key() {
        let limiter = limiter(Options::new().limit(1));

        hit(&limiter, "10.0.0.1").await;
        assert_eq!(hit(&limiter, "10.0.0.1").await.2.flow, Flow::Stop);

        limiter.reset_key("10.0.0.1").await.unwrap();
        assert!(limiter.get_key("10.0.0.1").await.unwrap().is_none());
        assert_eq!(hit(&limiter, "10.0.0.1").await.2.flow, Flow::Next);
    }

    #[tokio::test]
    async fn test_validations_disable_after_first_request() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let limiter = RateLimiter::new(Options::new().on_validation(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let mut response = Response::new();
        limiter
            .evaluate(&mut Request::new(), &mut response)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        limiter
            .evaluate(&mut Request::new(), &mut response)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
