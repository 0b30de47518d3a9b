use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::destination::{Destination, SendError};
use super::message::ComposedMessage;
use super::rate_limit::RateGate;
use crate::config::{DispatchConfig, RateProfile};
use crate::storage::{Database, Entry, EntryTranslation, Subscription};
use crate::translate::{TranslateError, TranslationCache};
use crate::util::now_unix;

/// Something the command surface should tell a subscriber about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionNotice {
    pub subscription_id: i64,
    pub platform: String,
    pub channel_id: String,
    pub kind: NoticeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// Delivery stopped after a terminal send failure
    Disabled { reason: String },
    /// Translation switched off; entries now arrive untranslated
    TranslationDisabled { language: String },
}

/// Counters for one dispatch call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages accepted by a destination
    pub delivered: usize,
    /// Messages given up on (retries exhausted, rejected or terminal)
    pub failed: usize,
    /// Subscriptions disabled by a terminal failure
    pub disabled: usize,
    /// Messages sent untranslated because translation failed transiently
    pub translation_pending: usize,
    /// Messages not attempted (no destination, or subscription disabled mid-batch)
    pub skipped: usize,
}

impl AddAssign for DispatchReport {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.disabled += other.disabled;
        self.translation_pending += other.translation_pending;
        self.skipped += other.skipped;
    }
}

#[derive(Clone)]
struct Route {
    destination: Arc<dyn Destination>,
    gate: Arc<RateGate>,
}

/// Routes new entries to subscriptions.
///
/// Subscriptions are served concurrently (up to `max_concurrent_sends`);
/// each one receives its entries in order. Every send to a platform passes
/// through that platform's [`RateGate`].
#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    config: DispatchConfig,
    routes: HashMap<String, Route>,
    translator: Option<TranslationCache>,
    notices: Option<mpsc::Sender<SubscriptionNotice>>,
}

impl Dispatcher {
    pub fn new(db: Database, config: DispatchConfig) -> Self {
        Self {
            db,
            config,
            routes: HashMap::new(),
            translator: None,
            notices: None,
        }
    }

    /// Register a platform. A later registration for the same platform wins.
    pub fn with_destination(mut self, destination: Arc<dyn Destination>, rate: RateProfile) -> Self {
        let platform = destination.platform().to_string();
        tracing::debug!(platform = %platform, per_second = rate.per_second, burst = rate.burst, "Destination registered");
        self.routes.insert(
            platform,
            Route {
                destination,
                gate: Arc::new(RateGate::new(rate)),
            },
        );
        self
    }

    pub fn with_translator(mut self, translator: TranslationCache) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Notices are sent with `try_send`; a full or closed channel drops them.
    pub fn with_notices(mut self, notices: mpsc::Sender<SubscriptionNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Deliver one entry to every active subscription of its feed.
    pub async fn dispatch(&self, entry: &Entry, subscriptions: &[Subscription]) -> DispatchReport {
        self.dispatch_batch(std::slice::from_ref(entry), subscriptions)
            .await
    }

    /// Deliver `entries` (already in emission order) to `subscriptions`.
    pub async fn dispatch_batch(
        &self,
        entries: &[Entry],
        subscriptions: &[Subscription],
    ) -> DispatchReport {
        if entries.is_empty() {
            return DispatchReport::default();
        }

        let active: Vec<&Subscription> = subscriptions.iter().filter(|s| s.active).collect();
        let mut pending = active.into_iter();
        let mut running = FuturesUnordered::new();
        for sub in pending.by_ref().take(self.config.max_concurrent_sends.max(1)) {
            running.push(self.deliver_to(sub, entries));
        }

        let mut total = DispatchReport::default();
        while let Some(report) = running.next().await {
            total += report;
            if let Some(sub) = pending.next() {
                running.push(self.deliver_to(sub, entries));
            }
        }
        total
    }

    async fn deliver_to(&self, sub: &Subscription, entries: &[Entry]) -> DispatchReport {
        let mut report = DispatchReport::default();
        let entries: Vec<&Entry> = entries.iter().filter(|e| e.feed_id == sub.feed_id).collect();

        let Some(route) = self.routes.get(&sub.platform) else {
            tracing::warn!(
                subscription_id = sub.id,
                platform = %sub.platform,
                "No destination registered for platform"
            );
            report.skipped += entries.len();
            return report;
        };

        let mut translate = sub.translate && self.translator.is_some();

        for (i, entry) in entries.iter().enumerate() {
            let message = if translate {
                match self.translation_for(entry, &sub.target_language).await {
                    Ok(translation) => ComposedMessage::translated(entry, &translation),
                    Err(TranslateError::UnsupportedLanguage(language)) => {
                        translate = false;
                        self.disable_translation(sub, &language).await;
                        ComposedMessage::original(entry)
                    }
                    Err(e) => {
                        tracing::warn!(
                            subscription_id = sub.id,
                            entry_id = entry.id,
                            language = %sub.target_language,
                            error = %e,
                            "Sending untranslated, translation pending"
                        );
                        report.translation_pending += 1;
                        ComposedMessage::original(entry)
                    }
                }
            } else {
                ComposedMessage::original(entry)
            };

            match self.send_with_retry(route, sub, &message).await {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::debug!(subscription_id = sub.id, entry_id = entry.id, "Delivered");
                }
                Err(SendError::Terminal(reason)) => {
                    report.failed += 1;
                    report.skipped += entries.len() - i - 1;
                    if self.disable(sub, &reason).await {
                        report.disabled += 1;
                    }
                    break;
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        subscription_id = sub.id,
                        entry_id = entry.id,
                        platform = %sub.platform,
                        error = %e,
                        "Giving up on message"
                    );
                }
            }
        }

        report
    }

    /// Stored translation for the entry, else translate title and summary
    /// through the cache and store the result.
    async fn translation_for(
        &self,
        entry: &Entry,
        language: &str,
    ) -> Result<EntryTranslation, TranslateError> {
        let language = language.trim().to_lowercase();

        match self.db.get_entry_translation(entry.id, &language).await {
            Ok(Some(stored)) => return Ok(stored),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(entry_id = entry.id, error = %e, "Failed to read entry translation");
            }
        }

        let Some(cache) = &self.translator else {
            return Err(TranslateError::Transient("translation is not configured".into()));
        };
        if !cache.provider().supports_language(&language) {
            return Err(TranslateError::UnsupportedLanguage(language));
        }

        let title = cache.translate(&entry.title, &language).await?;
        let summary = match entry.summary.as_deref() {
            Some(summary) => Some(cache.translate(summary, &language).await?),
            None => None,
        };

        let translation = EntryTranslation {
            entry_id: entry.id,
            language,
            title,
            summary,
        };
        if let Err(e) = self
            .db
            .record_entry_translation(&translation, now_unix())
            .await
        {
            tracing::warn!(entry_id = entry.id, error = %e, "Failed to store entry translation");
        }
        Ok(translation)
    }

    async fn send_with_retry(
        &self,
        route: &Route,
        sub: &Subscription,
        message: &ComposedMessage,
    ) -> Result<(), SendError> {
        let max_attempts = self.config.max_attempts.max(1);
        let budget = Duration::from_secs(self.config.retry_max_secs);
        let mut attempt = 1;

        loop {
            route.gate.acquire().await;
            match route.destination.send(&sub.channel_id, message).await {
                Ok(()) => return Ok(()),
                // Waiting that long would stall every subscription on the platform.
                Err(SendError::Retryable {
                    reason,
                    retry_after: Some(server),
                }) if server > budget => {
                    tracing::warn!(
                        subscription_id = sub.id,
                        platform = %sub.platform,
                        retry_after_secs = server.as_secs(),
                        "Server wait exceeds retry budget, giving up"
                    );
                    return Err(SendError::Retryable {
                        reason,
                        retry_after: Some(server),
                    });
                }
                Err(SendError::Retryable {
                    reason,
                    retry_after,
                }) if attempt < max_attempts => {
                    let backoff = retry_delay(attempt, &self.config);
                    let delay = retry_after.map_or(backoff, |server| server.max(backoff));
                    if let Some(server) = retry_after {
                        route.gate.pause_for(server).await;
                    }
                    tracing::warn!(
                        subscription_id = sub.id,
                        platform = %sub.platform,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns whether this call disabled the subscription.
    async fn disable(&self, sub: &Subscription, reason: &str) -> bool {
        match self.db.disable_subscription(sub.id, reason).await {
            Ok(true) => {
                tracing::info!(
                    subscription_id = sub.id,
                    platform = %sub.platform,
                    channel_id = %sub.channel_id,
                    reason = %reason,
                    "Subscription disabled"
                );
                self.notify(sub, NoticeKind::Disabled {
                    reason: reason.to_string(),
                });
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!(subscription_id = sub.id, error = %e, "Failed to disable subscription");
                false
            }
        }
    }

    async fn disable_translation(&self, sub: &Subscription, language: &str) {
        match self.db.disable_subscription_translation(sub.id).await {
            Ok(true) => {
                tracing::info!(
                    subscription_id = sub.id,
                    language = %language,
                    "Target language unsupported, translation disabled"
                );
                self.notify(sub, NoticeKind::TranslationDisabled {
                    language: language.to_string(),
                });
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(subscription_id = sub.id, error = %e, "Failed to disable translation");
            }
        }
    }

    fn notify(&self, sub: &Subscription, kind: NoticeKind) {
        let Some(tx) = &self.notices else {
            return;
        };
        let notice = SubscriptionNotice {
            subscription_id: sub.id,
            platform: sub.platform.clone(),
            channel_id: sub.channel_id.clone(),
            kind,
        };
        if let Err(e) = tx.try_send(notice) {
            tracing::warn!(subscription_id = sub.id, error = %e, "Dropped subscription notice");
        }
    }
}

/// `retry_base * 2^(attempt - 1)`, capped at `retry_max`.
fn retry_delay(attempt: u32, config: &DispatchConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay = Duration::from_millis(config.retry_base_ms.saturating_mul(factor));
    delay.min(Duration::from_secs(config.retry_max_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NewEntry, NewSubscription};
    use crate::translate::TranslationProvider;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records successful sends; pops scripted failures per channel first.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, ComposedMessage)>>,
        script: Mutex<HashMap<String, VecDeque<SendError>>>,
        attempts: AtomicUsize,
    }

    impl Recorder {
        fn fail(&self, channel: &str, errors: Vec<SendError>) {
            self.script
                .lock()
                .unwrap()
                .insert(channel.to_string(), errors.into());
        }

        fn sent_to(&self, channel: &str) -> Vec<ComposedMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| c == channel)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Destination for Recorder {
        fn platform(&self) -> &str {
            "test"
        }

        async fn send(&self, channel_id: &str, message: &ComposedMessage) -> Result<(), SendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let scripted = self
                .script
                .lock()
                .unwrap()
                .get_mut(channel_id)
                .and_then(|q| q.pop_front());
            if let Some(err) = scripted {
                return Err(err);
            }
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), message.clone()));
            Ok(())
        }
    }

    /// Prefixes the language; rejects "xx"; fails the first `failures` calls.
    struct Prefixer {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl TranslationProvider for Prefixer {
        fn name(&self) -> &str {
            "prefixer"
        }

        fn supports_language(&self, lang: &str) -> bool {
            lang != "xx"
        }

        async fn translate(
            &self,
            text: &str,
            target: &str,
            _source: Option<&str>,
        ) -> Result<String, TranslateError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TranslateError::Transient("busy".into()));
            }
            Ok(format!("{target}:{text}"))
        }
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            max_concurrent_sends: 1,
            max_attempts: 3,
            retry_base_ms: 1,
            retry_max_secs: 1,
        }
    }

    fn fast_rate() -> RateProfile {
        RateProfile {
            per_second: 1000.0,
            burst: 100,
        }
    }

    async fn seed(db: &Database, channels: &[(&str, bool, &str)]) -> (Vec<Entry>, Vec<Subscription>) {
        let feed_id = db.upsert_feed("https://example.com/rss").await.unwrap();
        let new = |guid: &str| NewEntry {
            guid: guid.into(),
            title: format!("Title {guid}"),
            link: format!("https://example.com/{guid}"),
            summary: Some(format!("Summary {guid}")),
            published_at: None,
            image_url: None,
        };
        let entries = db
            .insert_entries_if_absent(feed_id, &[new("1"), new("2")], 1_000)
            .await
            .unwrap();
        for (channel, translate, lang) in channels {
            db.add_subscription(&NewSubscription {
                platform: "test".into(),
                channel_id: channel.to_string(),
                feed_id,
                translate: *translate,
                target_language: lang.to_string(),
            })
            .await
            .unwrap();
        }
        let subs = db.active_subscriptions_for(feed_id).await.unwrap();
        (entries, subs)
    }

    fn translator(db: &Database, failures: usize) -> TranslationCache {
        TranslationCache::new(
            db.clone(),
            Arc::new(Prefixer {
                failures: AtomicUsize::new(failures),
            }),
            64,
            None,
        )
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = DispatchConfig {
            retry_base_ms: 500,
            retry_max_secs: 3,
            ..DispatchConfig::default()
        };
        assert_eq!(retry_delay(1, &config), Duration::from_millis(500));
        assert_eq!(retry_delay(2, &config), Duration::from_millis(1000));
        assert_eq!(retry_delay(3, &config), Duration::from_millis(2000));
        assert_eq!(retry_delay(4, &config), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_delivers_in_order_to_every_subscription() {
        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("a", false, "en"), ("b", false, "en")]).await;
        let recorder = Arc::new(Recorder::default());
        let dispatcher =
            Dispatcher::new(db, fast_config()).with_destination(recorder.clone(), fast_rate());

        let report = dispatcher.dispatch_batch(&entries, &subs).await;
        assert_eq!(report.delivered, 4);
        for channel in ["a", "b"] {
            let titles: Vec<_> = recorder.sent_to(channel).into_iter().map(|m| m.title).collect();
            assert_eq!(titles, vec!["Title 1", "Title 2"]);
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("a", false, "en")]).await;
        let recorder = Arc::new(Recorder::default());
        recorder.fail(
            "a",
            vec![SendError::retryable("flaky"), SendError::retryable("flaky")],
        );
        let dispatcher =
            Dispatcher::new(db, fast_config()).with_destination(recorder.clone(), fast_rate());

        let report = dispatcher.dispatch(&entries[0], &subs).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(recorder.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_move_on() {
        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("a", false, "en")]).await;
        let recorder = Arc::new(Recorder::default());
        recorder.fail("a", vec![SendError::retryable("down"); 3]);
        let dispatcher =
            Dispatcher::new(db.clone(), fast_config()).with_destination(recorder.clone(), fast_rate());

        let report = dispatcher.dispatch_batch(&entries, &subs).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(recorder.sent_to("a")[0].title, "Title 2");
        assert!(db.get_subscription(subs[0].id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_terminal_failure_disables_only_that_subscription() {
        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("gone", false, "en"), ("ok", false, "en")]).await;
        let recorder = Arc::new(Recorder::default());
        recorder.fail("gone", vec![SendError::Terminal("chat not found".into())]);
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(db.clone(), fast_config())
            .with_destination(recorder.clone(), fast_rate())
            .with_notices(tx);

        let report = dispatcher.dispatch_batch(&entries, &subs).await;
        assert_eq!(report.disabled, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 2);
        assert_eq!(recorder.sent_to("ok").len(), 2);
        assert!(recorder.sent_to("gone").is_empty());

        let gone = db.get_subscription(subs[0].id).await.unwrap().unwrap();
        assert!(!gone.active);
        assert_eq!(gone.disabled_reason.as_deref(), Some("chat not found"));
        assert!(db.get_subscription(subs[1].id).await.unwrap().unwrap().active);

        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.channel_id, "gone");
        assert_eq!(
            notice.kind,
            NoticeKind::Disabled {
                reason: "chat not found".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_translated_delivery_is_stored_per_entry() {
        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("a", true, "FR")]).await;
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(db.clone(), fast_config())
            .with_destination(recorder.clone(), fast_rate())
            .with_translator(translator(&db, 0));

        dispatcher.dispatch(&entries[0], &subs).await;
        let sent = recorder.sent_to("a");
        assert_eq!(sent[0].title, "fr:Title 1");
        assert_eq!(sent[0].summary.as_deref(), Some("fr:Summary 1"));
        assert_eq!(sent[0].language.as_deref(), Some("fr"));

        let stored = db
            .get_entry_translation(entries[0].id, "fr")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, "fr:Title 1");
    }

    #[tokio::test]
    async fn test_unsupported_language_disables_translation_once() {
        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("a", true, "xx")]).await;
        let recorder = Arc::new(Recorder::default());
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(db.clone(), fast_config())
            .with_destination(recorder.clone(), fast_rate())
            .with_translator(translator(&db, 0))
            .with_notices(tx);

        let report = dispatcher.dispatch_batch(&entries, &subs).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.translation_pending, 0);
        assert!(recorder.sent_to("a").iter().all(|m| m.language.is_none()));

        let sub = db.get_subscription(subs[0].id).await.unwrap().unwrap();
        assert!(!sub.translate);
        assert!(sub.active);
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            NoticeKind::TranslationDisabled { .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_wait_beyond_budget_fails_only_that_subscription() {
        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("slow", false, "en"), ("ok", false, "en")]).await;
        let recorder = Arc::new(Recorder::default());
        let day = SendError::Retryable {
            reason: "HTTP 429".into(),
            retry_after: Some(Duration::from_secs(86_400)),
        };
        recorder.fail("slow", vec![day.clone(), day]);
        let config = DispatchConfig {
            max_concurrent_sends: 2,
            ..fast_config()
        };
        let dispatcher =
            Dispatcher::new(db.clone(), config).with_destination(recorder.clone(), fast_rate());

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.dispatch_batch(&entries, &subs),
        )
        .await
        .expect("dispatch stalled on the server wait");

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(recorder.sent_to("ok").len(), 2);
        // No retries for the over-budget wait.
        assert_eq!(recorder.attempts.load(Ordering::SeqCst), 4);
        assert!(db.get_subscription(subs[0].id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_server_wait_within_budget_is_honored() {
        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("a", false, "en")]).await;
        let recorder = Arc::new(Recorder::default());
        recorder.fail(
            "a",
            vec![SendError::Retryable {
                reason: "HTTP 429".into(),
                retry_after: Some(Duration::from_millis(300)),
            }],
        );
        let dispatcher =
            Dispatcher::new(db, fast_config()).with_destination(recorder.clone(), fast_rate());

        let start = tokio::time::Instant::now();
        let report = dispatcher.dispatch(&entries[0], &subs).await;
        assert_eq!(report.delivered, 1);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_dispatch_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("a", false, "en")]).await;
        let recorder = Arc::new(Recorder::default());
        let dispatcher =
            Dispatcher::new(db, fast_config()).with_destination(recorder.clone(), fast_rate());

        let batch = dispatcher.dispatch_batch(&entries, &subs);
        assert_send(&batch);
        assert_eq!(batch.await.delivered, 2);
    }

    #[tokio::test]
    async fn test_missing_platform_is_skipped() {
        let db = Database::open(":memory:").await.unwrap();
        let (entries, subs) = seed(&db, &[("a", false, "en")]).await;
        let dispatcher = Dispatcher::new(db, fast_config());

        let report = dispatcher.dispatch_batch(&entries, &subs).await;
        assert_eq!(report.skipped, 2);
        assert_eq!(report.delivered, 0);
    }
}
