//! Signal aggregation
//!
//! Runs the pattern filter and every enabled external classifier for one
//! event and folds the results into a single [`ViolationVerdict`].
//! Classifier calls run concurrently, each under its own deadline and the
//! whole retry sequence under a per-event ceiling. A failing classifier
//! counts as "found nothing".

use crate::moderation::filter::{FilterId, PatternFilter};
use crate::moderation::{CensorMethods, Moderatable, SignalError, TenantPolicy};
use async_trait::async_trait;
use derive_more::Display;
use poise::serenity_prelude::GuildId;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::ops::Range;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s<>]+").expect("Valid URL regex"));

/// Which detector produced a match
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display,
)]
pub enum SignalKind {
    #[display("Server Filter")]
    CustomFilter,
    #[display("Pre-Built Filter")]
    PrebuiltFilter,
    #[display("Toxicity")]
    Toxicity,
    #[display("NSFW Image")]
    Nsfw,
    #[display("Phishing Link")]
    Phishing,
}

impl From<&FilterId> for SignalKind {
    fn from(filter: &FilterId) -> Self {
        match filter {
            FilterId::Server => Self::CustomFilter,
            FilterId::Prebuilt(_) => Self::PrebuiltFilter,
        }
    }
}

/// Combined outcome of every detector for one event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViolationVerdict {
    pub is_violation: bool,
    /// Censor methods whose detectors matched
    pub triggered: CensorMethods,
    pub signals: BTreeSet<SignalKind>,
    /// Filter lists that matched the event text or text read from images
    pub matched_filters: Vec<FilterId>,
    /// Byte ranges into the event text
    pub matched_ranges: Vec<Range<usize>>,
    /// Raw classifier scores
    pub scores: BTreeMap<SignalKind, f32>,
    /// Classifiers that failed and were treated as finding nothing
    pub degraded: BTreeSet<SignalKind>,
}

impl ViolationVerdict {
    fn mark(&mut self, method: CensorMethods, signal: SignalKind) {
        self.is_violation = true;
        self.triggered |= method;
        self.signals.insert(signal);
    }

    fn add_filters(&mut self, method: CensorMethods, filters: &[FilterId]) {
        for filter in filters {
            self.mark(method, SignalKind::from(filter));
            if !self.matched_filters.contains(filter) {
                self.matched_filters.push(filter.clone());
            }
        }
    }
}

/// Scores how toxic a text is
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToxicityScorer: Send + Sync {
    /// Score in `0.0..=1.0`
    async fn score_toxicity(&self, text: &str) -> Result<f32, SignalError>;
}

/// Score returned by an image classifier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageScore {
    pub nsfw_score: f32,
}

/// Classifies images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageClassifier: Send + Sync {
    async fn classify_image(&self, url: &str) -> Result<ImageScore, SignalError>;
}

/// Reads text out of images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, image_url: &str) -> Result<String, SignalError>;
}

/// Decides whether a link is phishing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhishingChecker: Send + Sync {
    async fn check_phishing(&self, url: &str) -> Result<bool, SignalError>;
}

/// The external classifiers available to the aggregator
#[derive(Clone, Default)]
pub struct Classifiers {
    pub toxicity: Option<Arc<dyn ToxicityScorer>>,
    pub images: Option<Arc<dyn ImageClassifier>>,
    pub ocr: Option<Arc<dyn TextExtractor>>,
    pub phishing: Option<Arc<dyn PhishingChecker>>,
}

/// Deadlines, retries and default thresholds for classifier calls
#[derive(Debug, Clone, Copy)]
pub struct SignalSettings {
    pub timeout: Duration,
    /// Extra attempts after a retryable failure
    pub retries: u32,
    pub backoff: Duration,
    /// Ceiling on one signal including every retry
    pub deadline: Duration,
    pub toxicity_threshold: f32,
    pub nsfw_threshold: f32,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1500),
            retries: 2,
            backoff: Duration::from_millis(100),
            deadline: Duration::from_millis(2500),
            toxicity_threshold: 0.8,
            nsfw_threshold: 0.7,
        }
    }
}

enum SignalOutcome {
    Toxicity(Result<f32, SignalError>),
    Nsfw(String, Result<ImageScore, SignalError>),
    Ocr(String, Result<String, SignalError>),
    Phishing(String, Result<bool, SignalError>),
}

/// Call a classifier with a deadline, retrying retryable failures until the ceiling
async fn call_with_retry<T, F, Fut>(settings: SignalSettings, call: F) -> Result<T, SignalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SignalError>>,
{
    tokio::time::timeout(settings.deadline, retry(settings, call))
        .await
        .unwrap_or(Err(SignalError::Timeout))
}

async fn retry<T, F, Fut>(settings: SignalSettings, mut call: F) -> Result<T, SignalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SignalError>>,
{
    let mut attempt = 0;
    loop {
        let result = tokio::time::timeout(settings.timeout, call())
            .await
            .unwrap_or(Err(SignalError::Timeout));

        match result {
            Err(e) if e.is_retryable() && attempt < settings.retries => {
                attempt += 1;
                let base = settings.backoff * attempt;
                let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 2);
                debug!(attempt, error = %e, "Retrying signal");
                tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
            }
            other => return other,
        }
    }
}

/// Runs every enabled detector for an event
#[derive(Clone)]
pub struct SignalAggregator {
    filter: PatternFilter,
    classifiers: Classifiers,
    settings: SignalSettings,
}

impl SignalAggregator {
    #[must_use]
    pub fn new(filter: PatternFilter, classifiers: Classifiers, settings: SignalSettings) -> Self {
        Self {
            filter,
            classifiers,
            settings,
        }
    }

    /// Drop the compiled terms of a guild
    pub fn forget_guild(&self, guild_id: GuildId) {
        self.filter.invalidate(guild_id);
    }

    /// Evaluate every enabled signal for `event`
    ///
    /// Never fails: a classifier error degrades to no match for that signal.
    pub async fn evaluate<E: Moderatable + ?Sized>(
        &self,
        event: &E,
        policy: &TenantPolicy,
    ) -> ViolationVerdict {
        let mut verdict = ViolationVerdict::default();
        let text = event.text();
        let method = event.censor_method();

        if policy.censors(method) {
            let response = self.filter.test(text, policy);
            if response.censor {
                verdict.add_filters(method, &response.filters);
                verdict.matched_ranges = response.ranges;
            }
        }

        let mut tasks = self.spawn_classifiers(event, policy);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => self.fold(&mut verdict, outcome, policy),
                Err(e) => warn!(error = %e, "Signal task failed"),
            }
        }

        if verdict.is_violation {
            debug!(
                guild_id = %policy.guild_id,
                signals = ?verdict.signals,
                "Event matched"
            );
        }
        verdict
    }

    fn spawn_classifiers<E: Moderatable + ?Sized>(
        &self,
        event: &E,
        policy: &TenantPolicy,
    ) -> JoinSet<SignalOutcome> {
        let mut tasks = JoinSet::new();
        let settings = self.settings;
        let text = event.text();

        if policy.censors(CensorMethods::TOXICITY) && !text.trim().is_empty() {
            if let Some(scorer) = &self.classifiers.toxicity {
                let scorer = Arc::clone(scorer);
                let text = text.to_string();
                tasks.spawn(async move {
                    let result = call_with_retry(settings, || {
                        let scorer = Arc::clone(&scorer);
                        let text = text.clone();
                        async move { scorer.score_toxicity(&text).await }
                    })
                    .await;
                    SignalOutcome::Toxicity(result)
                });
            }
        }

        if policy.censors(CensorMethods::PHISHING) {
            if let Some(checker) = &self.classifiers.phishing {
                let urls: BTreeSet<&str> = URL_PATTERN.find_iter(text).map(|m| m.as_str()).collect();
                for url in urls {
                    let checker = Arc::clone(checker);
                    let url = url.to_string();
                    tasks.spawn(async move {
                        let result = call_with_retry(settings, || {
                            let checker = Arc::clone(&checker);
                            let url = url.clone();
                            async move { checker.check_phishing(&url).await }
                        })
                        .await;
                        SignalOutcome::Phishing(url, result)
                    });
                }
            }
        }

        let images = event.attachments().iter().filter(|a| a.is_image());
        for image in images {
            if policy.censors(CensorMethods::IMAGES) {
                if let Some(classifier) = &self.classifiers.images {
                    let classifier = Arc::clone(classifier);
                    let url = image.url.clone();
                    tasks.spawn(async move {
                        let result = call_with_retry(settings, || {
                            let classifier = Arc::clone(&classifier);
                            let url = url.clone();
                            async move { classifier.classify_image(&url).await }
                        })
                        .await;
                        SignalOutcome::Nsfw(url, result)
                    });
                }
            }
            if policy.censors(CensorMethods::OCR) {
                if let Some(extractor) = &self.classifiers.ocr {
                    let extractor = Arc::clone(extractor);
                    let url = image.url.clone();
                    tasks.spawn(async move {
                        let result = call_with_retry(settings, || {
                            let extractor = Arc::clone(&extractor);
                            let url = url.clone();
                            async move { extractor.extract_text(&url).await }
                        })
                        .await;
                        SignalOutcome::Ocr(url, result)
                    });
                }
            }
        }

        tasks
    }

    fn fold(&self, verdict: &mut ViolationVerdict, outcome: SignalOutcome, policy: &TenantPolicy) {
        match outcome {
            SignalOutcome::Toxicity(Ok(score)) => {
                verdict.scores.insert(SignalKind::Toxicity, score);
                let threshold = policy
                    .toxicity_threshold
                    .unwrap_or(self.settings.toxicity_threshold);
                if score > threshold {
                    verdict.mark(CensorMethods::TOXICITY, SignalKind::Toxicity);
                }
            }
            SignalOutcome::Nsfw(url, Ok(score)) => {
                let best = verdict.scores.entry(SignalKind::Nsfw).or_insert(0.0);
                *best = best.max(score.nsfw_score);
                let threshold = policy.nsfw_threshold.unwrap_or(self.settings.nsfw_threshold);
                if score.nsfw_score > threshold {
                    debug!(url = %url, score = score.nsfw_score, "Image flagged");
                    verdict.mark(CensorMethods::IMAGES, SignalKind::Nsfw);
                }
            }
            SignalOutcome::Ocr(url, Ok(extracted)) => {
                let response = self.filter.test(&extracted, policy);
                if response.censor {
                    debug!(url = %url, filters = ?response.filters, "Text in image matched");
                    verdict.add_filters(CensorMethods::OCR, &response.filters);
                }
            }
            SignalOutcome::Phishing(url, Ok(is_phishing)) => {
                if is_phishing {
                    verdict.scores.insert(SignalKind::Phishing, 1.0);
                    debug!(url = %url, "Phishing link detected");
                    verdict.mark(CensorMethods::PHISHING, SignalKind::Phishing);
                }
            }
            SignalOutcome::Toxicity(Err(e)) => degrade(verdict, SignalKind::Toxicity, &e),
            SignalOutcome::Nsfw(_, Err(e)) => degrade(verdict, SignalKind::Nsfw, &e),
            // OCR feeds the text filters
            SignalOutcome::Ocr(_, Err(e)) => degrade(verdict, SignalKind::CustomFilter, &e),
            SignalOutcome::Phishing(_, Err(e)) => degrade(verdict, SignalKind::Phishing, &e),
        }
    }
}

fn degrade(verdict: &mut ViolationVerdict, signal: SignalKind, error: &SignalError) {
    match error {
        SignalError::Timeout => debug!(signal = %signal, "Signal timed out, treating as no match"),
        SignalError::Unavailable(reason) => {
            warn!(signal = %signal, reason = %reason, "Signal unavailable, treating as no match");
        }
        SignalError::Transient(reason) => {
            warn!(signal = %signal, reason = %reason, "Signal kept failing, treating as no match");
        }
    }
    verdict.degraded.insert(signal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{Attachment, MessageEvent};
    use poise::serenity_prelude::{ChannelId, MessageId, UserId};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn message(content: &str, attachments: Vec<Attachment>) -> MessageEvent {
        MessageEvent {
            guild_id: GuildId::new(1),
            channel_id: ChannelId::new(2),
            message_id: MessageId::new(3),
            author_id: UserId::new(4),
            author_roles: Vec::new(),
            content: content.to_string(),
            attachments,
            edited: false,
        }
    }

    fn image(url: &str) -> Attachment {
        Attachment {
            url: url.to_string(),
            filename: "picture.png".to_string(),
            content_type: Some("image/png".to_string()),
        }
    }

    fn policy(censor: CensorMethods) -> TenantPolicy {
        TenantPolicy {
            guild_id: GuildId::new(1),
            censor,
            custom_terms: vec!["hello".to_string()],
            prebuilt_filters: Vec::new(),
            ..Default::default()
        }
    }

    fn fast_settings() -> SignalSettings {
        SignalSettings {
            timeout: Duration::from_millis(50),
            retries: 2,
            backoff: Duration::from_millis(1),
            deadline: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_clean_event_is_not_a_violation() {
        let mut scorer = MockToxicityScorer::new();
        scorer.expect_score_toxicity().returning(|_| Ok(0.1));
        let aggregator = SignalAggregator::new(
            PatternFilter::default(),
            Classifiers {
                toxicity: Some(Arc::new(scorer)),
                ..Default::default()
            },
            fast_settings(),
        );

        let verdict = aggregator
            .evaluate(
                &message("good morning", Vec::new()),
                &policy(CensorMethods::MESSAGES | CensorMethods::TOXICITY),
            )
            .await;
        assert!(!verdict.is_violation);
        assert!(verdict.matched_ranges.is_empty());
        assert!(verdict.triggered.is_empty());
        assert_eq!(verdict.scores.get(&SignalKind::Toxicity), Some(&0.1));
    }

    #[tokio::test]
    async fn test_text_match_tags_message_method() {
        let aggregator =
            SignalAggregator::new(PatternFilter::default(), Classifiers::default(), fast_settings());

        let verdict = aggregator
            .evaluate(&message("h3ll0 w0rld", Vec::new()), &policy(CensorMethods::MESSAGES))
            .await;
        assert!(verdict.is_violation);
        assert_eq!(verdict.triggered, CensorMethods::MESSAGES);
        assert_eq!(verdict.matched_ranges, vec![0..5]);
        assert!(verdict.signals.contains(&SignalKind::CustomFilter));
    }

    #[tokio::test]
    async fn test_disabled_method_is_not_checked() {
        let aggregator =
            SignalAggregator::new(PatternFilter::default(), Classifiers::default(), fast_settings());

        let verdict = aggregator
            .evaluate(&message("hello", Vec::new()), &policy(CensorMethods::NAMES))
            .await;
        assert!(!verdict.is_violation);
    }

    #[tokio::test]
    async fn test_image_signals_union_into_verdict() {
        let mut classifier = MockImageClassifier::new();
        classifier
            .expect_classify_image()
            .returning(|_| Ok(ImageScore { nsfw_score: 0.95 }));
        let mut ocr = MockTextExtractor::new();
        ocr.expect_extract_text()
            .returning(|_| Ok("HELLO there".to_string()));

        let aggregator = SignalAggregator::new(
            PatternFilter::default(),
            Classifiers {
                images: Some(Arc::new(classifier)),
                ocr: Some(Arc::new(ocr)),
                ..Default::default()
            },
            fast_settings(),
        );

        let verdict = aggregator
            .evaluate(
                &message("look at this", vec![image("https://cdn.example/a.png")]),
                &policy(CensorMethods::MESSAGES | CensorMethods::IMAGES | CensorMethods::OCR),
            )
            .await;
        assert!(verdict.is_violation);
        assert_eq!(verdict.triggered, CensorMethods::IMAGES | CensorMethods::OCR);
        assert!(verdict.signals.contains(&SignalKind::Nsfw));
        assert!(verdict.signals.contains(&SignalKind::CustomFilter));
        assert_eq!(verdict.matched_filters, vec![FilterId::Server]);
        // Ranges only ever point into the event text
        assert!(verdict.matched_ranges.is_empty());
    }

    #[tokio::test]
    async fn test_toxicity_threshold_from_policy() {
        let mut scorer = MockToxicityScorer::new();
        scorer.expect_score_toxicity().returning(|_| Ok(0.6));
        let aggregator = SignalAggregator::new(
            PatternFilter::default(),
            Classifiers {
                toxicity: Some(Arc::new(scorer)),
                ..Default::default()
            },
            fast_settings(),
        );

        let event = message("you are the worst", Vec::new());
        let mut tenant = policy(CensorMethods::TOXICITY);
        assert!(!aggregator.evaluate(&event, &tenant).await.is_violation);

        tenant.toxicity_threshold = Some(0.5);
        let verdict = aggregator.evaluate(&event, &tenant).await;
        assert!(verdict.is_violation);
        assert_eq!(verdict.triggered, CensorMethods::TOXICITY);
    }

    #[tokio::test]
    async fn test_phishing_link() {
        let mut checker = MockPhishingChecker::new();
        checker
            .expect_check_phishing()
            .times(1)
            .returning(|_| Ok(true));
        let aggregator = SignalAggregator::new(
            PatternFilter::default(),
            Classifiers {
                phishing: Some(Arc::new(checker)),
                ..Default::default()
            },
            fast_settings(),
        );

        let verdict = aggregator
            .evaluate(
                &message("claim at https://free-nitro.example/claim now", Vec::new()),
                &policy(CensorMethods::PHISHING),
            )
            .await;
        assert!(verdict.is_violation);
        assert!(verdict.signals.contains(&SignalKind::Phishing));
    }

    #[tokio::test]
    async fn test_unavailable_signal_degrades_without_retry() {
        let mut scorer = MockToxicityScorer::new();
        scorer
            .expect_score_toxicity()
            .times(1)
            .returning(|_| Err(SignalError::Unavailable("connection refused".to_string())));
        let aggregator = SignalAggregator::new(
            PatternFilter::default(),
            Classifiers {
                toxicity: Some(Arc::new(scorer)),
                ..Default::default()
            },
            fast_settings(),
        );

        let verdict = aggregator
            .evaluate(
                &message("hello", Vec::new()),
                &policy(CensorMethods::MESSAGES | CensorMethods::TOXICITY),
            )
            .await;
        // The text filter still counts
        assert!(verdict.is_violation);
        assert!(verdict.degraded.contains(&SignalKind::Toxicity));
        assert!(!verdict.signals.contains(&SignalKind::Toxicity));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut scorer = MockToxicityScorer::new();
        scorer.expect_score_toxicity().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SignalError::Transient("503".to_string()))
            } else {
                Ok(0.99)
            }
        });
        let aggregator = SignalAggregator::new(
            PatternFilter::default(),
            Classifiers {
                toxicity: Some(Arc::new(scorer)),
                ..Default::default()
            },
            fast_settings(),
        );

        let verdict = aggregator
            .evaluate(&message("whatever", Vec::new()), &policy(CensorMethods::TOXICITY))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(verdict.is_violation);
    }

    struct SlowScorer;

    #[async_trait]
    impl ToxicityScorer for SlowScorer {
        async fn score_toxicity(&self, _text: &str) -> Result<f32, SignalError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_signal_times_out() {
        let aggregator = SignalAggregator::new(
            PatternFilter::default(),
            Classifiers {
                toxicity: Some(Arc::new(SlowScorer)),
                ..Default::default()
            },
            SignalSettings {
                retries: 0,
                ..fast_settings()
            },
        );

        let verdict = aggregator
            .evaluate(&message("whatever", Vec::new()), &policy(CensorMethods::TOXICITY))
            .await;
        assert!(!verdict.is_violation);
        assert!(verdict.degraded.contains(&SignalKind::Toxicity));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_at_the_event_ceiling() {
        let settings = SignalSettings::default();
        let aggregator = SignalAggregator::new(
            PatternFilter::default(),
            Classifiers {
                toxicity: Some(Arc::new(SlowScorer)),
                ..Default::default()
            },
            settings,
        );

        let start = tokio::time::Instant::now();
        let verdict = aggregator
            .evaluate(&message("whatever", Vec::new()), &policy(CensorMethods::TOXICITY))
            .await;
        let elapsed = start.elapsed();

        assert!(elapsed >= settings.timeout);
        assert!(elapsed <= settings.deadline + Duration::from_millis(5));
        assert!(verdict.degraded.contains(&SignalKind::Toxicity));
    }

    fn scored(toxicity: f32, nsfw: f32) -> SignalAggregator {
        let mut scorer = MockToxicityScorer::new();
        scorer.expect_score_toxicity().returning(move |_| Ok(toxicity));
        let mut classifier = MockImageClassifier::new();
        classifier
            .expect_classify_image()
            .returning(move |_| Ok(ImageScore { nsfw_score: nsfw }));
        SignalAggregator::new(
            PatternFilter::default(),
            Classifiers {
                toxicity: Some(Arc::new(scorer)),
                images: Some(Arc::new(classifier)),
                ..Default::default()
            },
            fast_settings(),
        )
    }

    #[tokio::test]
    async fn test_score_equal_to_threshold_is_not_a_match() {
        let mut tenant = policy(CensorMethods::TOXICITY | CensorMethods::IMAGES);
        tenant.toxicity_threshold = Some(0.5);
        tenant.nsfw_threshold = Some(0.5);
        let event = message("whatever", vec![image("https://cdn.example/b.png")]);

        let verdict = scored(0.5, 0.5).evaluate(&event, &tenant).await;
        assert!(!verdict.is_violation);
        assert_eq!(verdict.scores.get(&SignalKind::Toxicity), Some(&0.5));
        assert_eq!(verdict.scores.get(&SignalKind::Nsfw), Some(&0.5));

        let verdict = scored(0.51, 0.51).evaluate(&event, &tenant).await;
        assert!(verdict.signals.contains(&SignalKind::Toxicity));
        assert!(verdict.signals.contains(&SignalKind::Nsfw));
    }
}
