// =============================================================================
// Control channel — command subscriber, priority queue, single-flight drain
// =============================================================================
//
// Inbound messages are validated and pushed into a score-ordered queue
// (score = effective priority, member = the raw command JSON). A drain loop
// pops the most urgent command, acks it, executes it through the
// `CommandExecutor` seam, and publishes exactly one success or error — so
// every well-formed command produces `ack` then `success|error` with its
// correlation id, in strict priority order.
//
// Unparseable messages are dropped with a log line. Schema-invalid or
// expired commands that still carry a correlation id are answered with an
// error instead.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheService, ScoredMember};
use crate::cache_keys::{command_queue_key, commands_channel, responses_channel};
use crate::control::command::{Command, CommandEnvelope, CommandResponse};
use crate::errors::EngineError;

/// Executes parsed commands. Implemented by the service supervisor; mocked
/// in tests.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: Command) -> anyhow::Result<serde_json::Value>;
}

pub struct ControlChannel {
    cache: Arc<dyn CacheService>,
    executor: Arc<dyn CommandExecutor>,
    command_topic: String,
    response_topic: String,
    queue_key: String,
    draining: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    pub fn new(
        cache: Arc<dyn CacheService>,
        executor: Arc<dyn CommandExecutor>,
        identity_sub: &str,
    ) -> Self {
        Self {
            cache,
            executor,
            command_topic: commands_channel(identity_sub),
            response_topic: responses_channel(identity_sub),
            queue_key: command_queue_key(identity_sub),
            draining: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Subscribe to the command topic and spawn the consumer loop.
    pub async fn start(self: Arc<Self>) {
        let mut sub = match self.cache.subscribe(&[self.command_topic.clone()]).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(topic = %self.command_topic, error = %e, "control channel subscribe failed");
                return;
            }
        };

        let this = self.clone();
        let handle = tokio::spawn(async move {
            info!(topic = %this.command_topic, "control channel listening");
            while let Some(msg) = sub.recv().await {
                this.ingest(&msg.payload).await;
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("control channel stopped");
        }
    }

    /// Validate one raw message, queue it, and kick the drain.
    pub async fn ingest(&self, raw: &str) {
        if self.enqueue(raw, Utc::now().timestamp_millis()).await {
            self.drain().await;
        }
    }

    /// Validation + enqueue only. Returns whether anything was queued.
    pub async fn enqueue(&self, raw: &str, now_ms: i64) -> bool {
        // 1. Parse; unparseable messages carry no correlation id to answer.
        let envelope: CommandEnvelope = match serde_json::from_str(raw) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "dropping unparseable command");
                return false;
            }
        };

        // 2. Expiry before anything else.
        if envelope.is_expired(now_ms) {
            warn!(
                correlation_id = %envelope.correlation_id,
                age_ms = now_ms - envelope.timestamp,
                "command expired in transit"
            );
            self.respond(CommandResponse::error(
                &envelope.correlation_id,
                "Command expired",
            ))
            .await;
            return false;
        }

        // 3. Schema validation — an invalid command still gets an answer.
        let command = match Command::parse(&envelope) {
            Ok(c) => c,
            Err(msg) => {
                let err = EngineError::CommandInvalid(msg);
                self.respond(CommandResponse::error(
                    &envelope.correlation_id,
                    err.to_string(),
                ))
                .await;
                return false;
            }
        };

        // 4. Queue by effective priority; member is the raw envelope JSON.
        let priority = envelope.effective_priority(&command);
        let entry = ScoredMember::new(priority, raw.to_string());
        match self.cache.sorted_add(&self.queue_key, &[entry]).await {
            Ok(_) => {
                debug!(
                    correlation_id = %envelope.correlation_id,
                    command_type = %envelope.command_type,
                    priority,
                    "command queued"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "command enqueue failed");
                self.respond(CommandResponse::error(
                    &envelope.correlation_id,
                    "queue unavailable",
                ))
                .await;
                false
            }
        }
    }

    /// Pop-lowest-score, one command in flight at a time, until the queue is
    /// empty.
    pub async fn drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            // A drain is already running; it will pick up the new entry.
            return;
        }
        loop {
            let next = match self.cache.sorted_pop_min(&self.queue_key).await {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "command queue pop failed");
                    break;
                }
            };
            let Some(entry) = next else { break };
            self.process(&entry.member).await;
        }
        self.draining.store(false, Ordering::SeqCst);
    }

    async fn process(&self, raw: &str) {
        // Already validated at enqueue time; a decode failure here means the
        // queue was tampered with.
        let envelope: CommandEnvelope = match serde_json::from_str(raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping corrupt queue entry");
                return;
            }
        };
        let command = match Command::parse(&envelope) {
            Ok(c) => c,
            Err(msg) => {
                self.respond(CommandResponse::error(&envelope.correlation_id, msg))
                    .await;
                return;
            }
        };

        self.respond(CommandResponse::ack(&envelope.correlation_id))
            .await;

        info!(
            correlation_id = %envelope.correlation_id,
            command_type = %envelope.command_type,
            "executing command"
        );

        match self.executor.execute(command).await {
            Ok(data) => {
                self.respond(CommandResponse::success(&envelope.correlation_id, data))
                    .await;
            }
            Err(e) => {
                warn!(correlation_id = %envelope.correlation_id, error = %e, "command failed");
                self.respond(CommandResponse::error(
                    &envelope.correlation_id,
                    e.to_string(),
                ))
                .await;
            }
        }
    }

    async fn respond(&self, response: CommandResponse) {
        let payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "response encode failed");
                return;
            }
        };
        if let Err(e) = self.cache.publish(&self.response_topic, &payload).await {
            warn!(error = %e, "response publish failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::cache::Subscription;
    use crate::control::command::ResponseStatus;

    struct RecordingExecutor {
        executed: Mutex<Vec<Command>>,
        fail: bool,
    }

    impl RecordingExecutor {
        fn new(fail: bool) -> Self {
            Self {
                executed: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(&self, command: Command) -> anyhow::Result<serde_json::Value> {
            self.executed.lock().push(command);
            if self.fail {
                anyhow::bail!("handler exploded");
            }
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct Fixture {
        channel: Arc<ControlChannel>,
        executor: Arc<RecordingExecutor>,
        responses: Subscription,
    }

    async fn fixture_with(fail: bool) -> Fixture {
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let executor = Arc::new(RecordingExecutor::new(fail));
        let channel = Arc::new(ControlChannel::new(
            cache.clone(),
            executor.clone(),
            "sub-1",
        ));
        let responses = cache
            .subscribe(&[responses_channel("sub-1")])
            .await
            .unwrap();
        Fixture {
            channel,
            executor,
            responses,
        }
    }

    fn raw_command(id: &str, kind: &str, ts: i64) -> String {
        serde_json::json!({
            "correlationId": id,
            "type": kind,
            "timestamp": ts,
        })
        .to_string()
    }

    async fn drain_responses(sub: &mut Subscription, count: usize) -> Vec<CommandResponse> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let msg = sub.recv().await.expect("response");
            out.push(serde_json::from_str(&msg.payload).unwrap());
        }
        out
    }

    const NOW: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn unparseable_message_is_dropped_silently() {
        let mut f = fixture_with(false).await;
        assert!(!f.channel.enqueue("{not json", NOW).await);
        f.responses.close();
        assert!(f.responses.recv().await.is_none());
        assert!(f.executor.executed.lock().is_empty());
    }

    #[tokio::test]
    async fn expired_command_gets_error_response() {
        let mut f = fixture_with(false).await;
        let raw = raw_command("c-old", "pause", NOW - 31_000);
        assert!(!f.channel.enqueue(&raw, NOW).await);

        let responses = drain_responses(&mut f.responses, 1).await;
        assert_eq!(responses[0].status, ResponseStatus::Error);
        assert_eq!(responses[0].correlation_id, "c-old");
        assert_eq!(responses[0].message.as_deref(), Some("Command expired"));
    }

    #[tokio::test]
    async fn invalid_command_gets_error_response() {
        let mut f = fixture_with(false).await;
        let raw = raw_command("c-bad", "self-destruct", NOW);
        assert!(!f.channel.enqueue(&raw, NOW).await);

        let responses = drain_responses(&mut f.responses, 1).await;
        assert_eq!(responses[0].status, ResponseStatus::Error);
        assert!(responses[0]
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("unknown command type"));
    }

    #[tokio::test]
    async fn well_formed_command_acks_then_succeeds() {
        let mut f = fixture_with(false).await;
        f.channel.ingest(&raw_command("c-1", "pause", NOW)).await;

        let responses = drain_responses(&mut f.responses, 2).await;
        assert_eq!(responses[0].status, ResponseStatus::Ack);
        assert_eq!(responses[0].correlation_id, "c-1");
        assert_eq!(responses[1].status, ResponseStatus::Success);
        assert_eq!(responses[1].correlation_id, "c-1");
        assert_eq!(f.executor.executed.lock().as_slice(), &[Command::Pause]);
    }

    #[tokio::test]
    async fn handler_failure_acks_then_errors() {
        let mut f = fixture_with(true).await;
        f.channel.ingest(&raw_command("c-2", "resume", NOW)).await;

        let responses = drain_responses(&mut f.responses, 2).await;
        assert_eq!(responses[0].status, ResponseStatus::Ack);
        assert_eq!(responses[1].status, ResponseStatus::Error);
        assert!(responses[1]
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("handler exploded"));
    }

    #[tokio::test]
    async fn priority_orders_the_drain() {
        // force-backfill (prio 20) queued before pause
        // (prio 1); pause still runs first.
        let mut f = fixture_with(false).await;
        let backfill = serde_json::json!({
            "correlationId": "c-backfill",
            "type": "force-backfill",
            "payload": {"symbol": "BTC-USD", "timeframes": ["5m"]},
            "timestamp": NOW,
        })
        .to_string();
        assert!(f.channel.enqueue(&backfill, NOW).await);
        assert!(f.channel.enqueue(&raw_command("c-pause", "pause", NOW), NOW).await);

        f.channel.drain().await;

        let executed = f.executor.executed.lock();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0], Command::Pause);
        assert!(matches!(executed[1], Command::ForceBackfill { .. }));
        drop(executed);

        // Responses: ack+success for pause, then ack+success for backfill.
        let responses = drain_responses(&mut f.responses, 4).await;
        assert_eq!(responses[0].correlation_id, "c-pause");
        assert_eq!(responses[0].status, ResponseStatus::Ack);
        assert_eq!(responses[1].correlation_id, "c-pause");
        assert_eq!(responses[1].status, ResponseStatus::Success);
        assert_eq!(responses[2].correlation_id, "c-backfill");
        assert_eq!(responses[3].correlation_id, "c-backfill");
    }

    #[tokio::test]
    async fn explicit_priority_overrides_type_default() {
        let mut f = fixture_with(false).await;
        // reload-settings at explicit priority 0 beats pause's default 1.
        let urgent = serde_json::json!({
            "correlationId": "c-urgent",
            "type": "reload-settings",
            "priority": 0,
            "timestamp": NOW,
        })
        .to_string();
        assert!(f.channel.enqueue(&raw_command("c-pause", "pause", NOW), NOW).await);
        assert!(f.channel.enqueue(&urgent, NOW).await);

        f.channel.drain().await;
        let executed = f.executor.executed.lock();
        assert_eq!(executed[0], Command::ReloadSettings);
        assert_eq!(executed[1], Command::Pause);
        drop(executed);

        let responses = drain_responses(&mut f.responses, 4).await;
        assert_eq!(responses[0].correlation_id, "c-urgent");
    }

    #[tokio::test]
    async fn end_to_end_over_the_command_topic() {
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new());
        let executor = Arc::new(RecordingExecutor::new(false));
        let channel = Arc::new(ControlChannel::new(
            cache.clone(),
            executor.clone(),
            "sub-9",
        ));
        channel.clone().start().await;

        let raw = serde_json::json!({
            "correlationId": "c-live",
            "type": "pause",
            "timestamp": Utc::now().timestamp_millis(),
        })
        .to_string();
        cache
            .publish(&commands_channel("sub-9"), &raw)
            .await
            .unwrap();

        // Give the consumer loop a moment to run.
        for _ in 0..50 {
            if !executor.executed.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(executor.executed.lock().as_slice(), &[Command::Pause]);
        channel.stop();
    }
}
