//! Redis-backed queue for the turnloom orchestration core (companion crate).
//!
//! Implements `turnloom::MessageQueue` over the fixed key layout:
//!
//! - `q:{kind}:{priority}` — list of envelope ids, `LPUSH` on enqueue and
//!   `RPOP` on reserve, priorities scanned strictly high → normal → low
//! - `env:{id}` — versioned envelope bytes, TTL equal to the remaining
//!   deadline budget (dead-lettered envelopes are persisted)
//! - `inflight:{kind}` — sorted set of `(id, reserved_until)` for reclamation
//! - `dlq:{kind}` — list of envelope ids, never drained automatically
//! - `hb:{kind}:{instance}` — last-heartbeat timestamp with a liveness TTL
//!
//! Reserve is atomic: a Lua script pops the head of the highest non-empty
//! priority list and registers the reservation in one round trip. Everything
//! else leans on single-key atomic commands; no cross-queue transactions.
//!
//! Connection loss surfaces as retryable `Transport` errors; the caller's
//! retry harness owns recovery.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use turnloom::telemetry::{CoreEvent, QueueEvent};
use turnloom::{
    AgentKind, CoreError, Envelope, EventBus, MessageQueue, NackDisposition, Priority,
    QueueConfig, QueueDepths,
};
use uuid::Uuid;

const RESERVE_SCRIPT: &str = r#"
for i = 1, 3 do
    local id = redis.call('RPOP', KEYS[i])
    if id then
        redis.call('ZADD', KEYS[4], ARGV[1], id)
        return id
    end
end
return false
"#;

fn queue_key(kind: AgentKind, priority: Priority) -> String {
    format!("q:{}:{}", kind.label(), priority.label())
}

fn env_key(id: &Uuid) -> String {
    format!("env:{id}")
}

fn inflight_key(kind: AgentKind) -> String {
    format!("inflight:{}", kind.label())
}

fn dlq_key(kind: AgentKind) -> String {
    format!("dlq:{}", kind.label())
}

fn heartbeat_key(kind: AgentKind, instance: &str) -> String {
    format!("hb:{}:{instance}", kind.label())
}

fn transport(e: redis::RedisError) -> CoreError {
    CoreError::Transport { detail: format!("redis: {e}") }
}

fn wall_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// `MessageQueue` over a shared Redis instance.
///
/// Cheap to clone; all clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    reserve_script: Arc<Script>,
    config: QueueConfig,
    events: EventBus,
}

impl RedisQueue {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(
        url: &str,
        config: QueueConfig,
        events: EventBus,
    ) -> Result<Self, CoreError> {
        let client = redis::Client::open(url).map_err(transport)?;
        let conn = ConnectionManager::new(client).await.map_err(transport)?;
        Ok(Self { conn, reserve_script: Arc::new(Script::new(RESERVE_SCRIPT)), config, events })
    }

    /// Publish a liveness signal for one agent instance. The key expires
    /// after `ttl`, so a silent agent simply vanishes from the keyspace.
    pub async fn record_heartbeat(
        &self,
        kind: AgentKind,
        instance: &str,
        ttl: Duration,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(heartbeat_key(kind, instance))
            .arg(wall_millis())
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(transport)
    }

    async fn queued_depth(&self, kind: AgentKind) -> Result<usize, CoreError> {
        let mut conn = self.conn.clone();
        let mut total = 0usize;
        for priority in Priority::ORDERED {
            let len: usize =
                conn.llen(queue_key(kind, priority)).await.map_err(transport)?;
            total += len;
        }
        Ok(total)
    }

    /// Store the envelope body and append its id, atomically.
    async fn push(&self, env: &Envelope, to_head: bool) -> Result<(), CoreError> {
        let kind = env.to.kind;
        let bytes = env.encode()?;
        // Past-deadline envelopes get a minimal TTL; reserve treats the
        // missing body as expiry.
        let ttl_ms = env
            .remaining(SystemTime::now())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1)
            .max(1);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET").arg(env_key(&env.id)).arg(bytes).arg("PX").arg(ttl_ms).ignore();
        let key = queue_key(kind, env.priority);
        if to_head {
            // The consume side pops from the right.
            pipe.rpush(key, env.id.to_string()).ignore();
        } else {
            pipe.lpush(key, env.id.to_string()).ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await.map_err(transport)
    }

    /// Move an envelope to the dead-letter list, clearing the body's TTL so
    /// it survives until drained.
    async fn dead_letter(&self, kind: AgentKind, env: &Envelope) -> Result<(), CoreError> {
        let bytes = env.encode()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET").arg(env_key(&env.id)).arg(bytes).ignore();
        pipe.lpush(dlq_key(kind), env.id.to_string()).ignore();
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await.map_err(transport)?;
        self.events
            .emit(CoreEvent::Queue(QueueEvent::DeadLettered { kind, attempts: env.attempt }));
        tracing::warn!(kind = %kind, id = %env.id, attempt = env.attempt, "envelope dead-lettered");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Envelope>, CoreError> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.get(env_key_str(id)).await.map_err(transport)?;
        match bytes {
            Some(bytes) => Ok(Some(Envelope::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Route a redelivery: back to the tail while attempts remain, the DLQ
    /// past the bound.
    async fn redeliver(&self, kind: AgentKind, mut env: Envelope) -> Result<(), CoreError> {
        env.attempt += 1;
        env.dequeued_at = None;
        if env.attempt > self.config.max_delivery_attempts {
            self.dead_letter(kind, &env).await
        } else {
            self.push(&env, false).await
        }
    }
}

fn env_key_str(id: &str) -> String {
    format!("env:{id}")
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn enqueue(&self, mut env: Envelope) -> Result<(), CoreError> {
        let kind = env.to.kind;
        if env.enqueued_at.is_none() {
            env.enqueued_at = Some(SystemTime::now());
        }

        let started = SystemTime::now();
        loop {
            let depth = self.queued_depth(kind).await?;
            if depth < self.config.max_depth {
                self.push(&env, false).await?;
                self.events.emit(CoreEvent::Queue(QueueEvent::Enqueued {
                    kind,
                    priority: env.priority,
                    depth: depth + 1,
                }));
                return Ok(());
            }
            let waited = SystemTime::now().duration_since(started).unwrap_or_default();
            if waited >= self.config.enqueue_wait {
                return Err(CoreError::Overloaded { kind, depth });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn reserve(
        &self,
        kind: AgentKind,
        consumer_id: &str,
    ) -> Result<Option<Envelope>, CoreError> {
        loop {
            let reserved_until =
                wall_millis() + self.config.reservation_ttl.as_millis() as u64;
            let mut conn = self.conn.clone();
            let popped: Option<String> = self
                .reserve_script
                .key(queue_key(kind, Priority::High))
                .key(queue_key(kind, Priority::Normal))
                .key(queue_key(kind, Priority::Low))
                .key(inflight_key(kind))
                .arg(reserved_until)
                .invoke_async(&mut conn)
                .await
                .map_err(transport)?;

            let Some(id) = popped else { return Ok(None) };
            match self.load(&id).await? {
                Some(mut env) => {
                    env.dequeued_at = Some(SystemTime::now());
                    self.events.emit(CoreEvent::Queue(QueueEvent::Reserved {
                        kind,
                        attempt: env.attempt,
                    }));
                    tracing::debug!(kind = %kind, id = %env.id, consumer_id, "envelope reserved");
                    return Ok(Some(env));
                }
                None => {
                    // Body TTL elapsed: the deadline passed while queued.
                    // Nothing left to deliver or dead-letter.
                    let _: usize =
                        conn.zrem(inflight_key(kind), &id).await.map_err(transport)?;
                    tracing::debug!(kind = %kind, id, "queued envelope expired, skipping");
                }
            }
        }
    }

    async fn ack(&self, kind: AgentKind, id: Uuid) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let removed: usize =
            conn.zrem(inflight_key(kind), id.to_string()).await.map_err(transport)?;
        if removed == 0 {
            return Err(CoreError::Protocol {
                detail: format!("ack for {id} without a live reservation"),
            });
        }
        let _: usize = conn.del(env_key(&id)).await.map_err(transport)?;
        self.events.emit(CoreEvent::Queue(QueueEvent::Acked { kind }));
        Ok(())
    }

    async fn nack(
        &self,
        kind: AgentKind,
        id: Uuid,
        disposition: NackDisposition,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let removed: usize =
            conn.zrem(inflight_key(kind), id.to_string()).await.map_err(transport)?;
        if removed == 0 {
            return Err(CoreError::Protocol {
                detail: format!("nack for {id} without a live reservation"),
            });
        }
        let Some(env) = self.load(&id.to_string()).await? else {
            // Deadline passed while reserved; the body is gone.
            return Ok(());
        };

        match disposition {
            NackDisposition::Head => self.push(&env, true).await?,
            NackDisposition::Tail => self.redeliver(kind, env).await?,
            NackDisposition::DeadLetter => self.dead_letter(kind, &env).await?,
        }
        self.events.emit(CoreEvent::Queue(QueueEvent::Nacked { kind, disposition }));
        Ok(())
    }

    async fn reclaim_expired(&self, kind: AgentKind) -> Result<usize, CoreError> {
        let now = wall_millis();
        let mut conn = self.conn.clone();
        let expired: Vec<String> = conn
            .zrangebyscore(inflight_key(kind), "-inf", now)
            .await
            .map_err(transport)?;

        let mut reclaimed = 0usize;
        for id in expired {
            // ZREM doubles as the claim; a competing sweeper gets 0.
            let removed: usize =
                conn.zrem(inflight_key(kind), &id).await.map_err(transport)?;
            if removed == 0 {
                continue;
            }
            if let Some(env) = self.load(&id).await? {
                self.redeliver(kind, env).await?;
            }
            reclaimed += 1;
        }

        if reclaimed > 0 {
            self.events
                .emit(CoreEvent::Queue(QueueEvent::Reclaimed { kind, count: reclaimed }));
        }
        Ok(reclaimed)
    }

    async fn depths(&self, kind: AgentKind) -> Result<QueueDepths, CoreError> {
        let mut conn = self.conn.clone();
        let queued = self.queued_depth(kind).await?;
        let in_flight: usize = conn.zcard(inflight_key(kind)).await.map_err(transport)?;
        let dead_lettered: usize = conn.llen(dlq_key(kind)).await.map_err(transport)?;
        Ok(QueueDepths { queued, in_flight, dead_lettered })
    }

    async fn oldest_age(&self, kind: AgentKind) -> Result<Option<Duration>, CoreError> {
        let now = SystemTime::now();
        let mut conn = self.conn.clone();
        let mut oldest: Option<Duration> = None;
        for priority in Priority::ORDERED {
            // The consume side pops from the right, so -1 is the head.
            let head: Option<String> =
                conn.lindex(queue_key(kind, priority), -1).await.map_err(transport)?;
            let Some(id) = head else { continue };
            let Some(env) = self.load(&id).await? else { continue };
            let age = env.enqueued_at.and_then(|at| now.duration_since(at).ok());
            oldest = match (oldest, age) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        Ok(oldest)
    }

    async fn drain_dead_letters(&self, kind: AgentKind) -> Result<Vec<Envelope>, CoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> =
            conn.lrange(dlq_key(kind), 0, -1).await.map_err(transport)?;
        let _: usize = conn.del(dlq_key(kind)).await.map_err(transport)?;

        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(env) = self.load(&id).await? {
                let _: usize = conn.del(env_key_str(&id)).await.map_err(transport)?;
                drained.push(env);
            }
        }
        Ok(drained)
    }
}
