//! Redis-based session cache using Lua scripts for atomicity.
//!
//! Suitable for multi-node deployments: the admission check-and-create is
//! a single script execution, so concurrent creates on different hosts
//! cannot both pass the quota check.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, warn};
use uuid::Uuid;

use pbxgate_core::error::{AppError, ErrorKind};
use pbxgate_core::result::AppResult;
use pbxgate_entity::license::Feature;

use crate::client::RedisClient;
use crate::keys;

use super::{AdmitOutcome, ReleaseOutcome, SessionCache, SessionEntry};

/// Lua script for atomic session admission.
///
/// KEYS[1] = session entry hash
/// KEYS[2] = live set for (user, feature)
/// KEYS[3] = counter for (license, feature)
/// ARGV[1] = session id
/// ARGV[2] = quota
/// ARGV[3] = ttl seconds
/// ARGV[4] = key prefix (for probing other members' entry hashes)
/// ARGV[5..] = entry hash field/value pairs
///
/// Returns {1, new_count} on admission, {0, current} when the quota is
/// exhausted (the increment is compensated before returning), {-1, 0}
/// when the principal already holds a live session. Set members whose
/// entry hash has expired are dropped instead of blocking admission.
const ADMIT_SCRIPT: &str = r#"
    local members = redis.call('SMEMBERS', KEYS[2])
    for _, sid in ipairs(members) do
        if redis.call('EXISTS', ARGV[4] .. 'session:entry:' .. sid) == 1 then
            return {-1, 0}
        end
        redis.call('SREM', KEYS[2], sid)
    end

    local quota = tonumber(ARGV[2])
    local count = redis.call('INCR', KEYS[3])
    if count > quota then
        redis.call('DECR', KEYS[3])
        return {0, count - 1}
    end

    for i = 5, #ARGV, 2 do
        redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
    end
    redis.call('SADD', KEYS[2], ARGV[1])

    local ttl = tonumber(ARGV[3])
    redis.call('EXPIRE', KEYS[1], ttl)
    redis.call('EXPIRE', KEYS[2], ttl)
    redis.call('EXPIRE', KEYS[3], ttl)
    return {1, count}
"#;

/// Lua script for atomic session release.
///
/// KEYS as in the admit script; ARGV[1] = session id.
///
/// The counter is decremented only when the live-set member was actually
/// removed, so repeated releases decrement exactly once. An underflowing
/// counter is clamped to zero and reported.
const RELEASE_SCRIPT: &str = r#"
    local removed = redis.call('SREM', KEYS[2], ARGV[1])
    redis.call('DEL', KEYS[1])

    local clamped = 0
    if removed == 1 then
        local count = redis.call('DECR', KEYS[3])
        if count < 0 then
            clamped = 1
            count = 0
        end
        if count == 0 then
            redis.call('DEL', KEYS[3])
        end
    end
    return {removed, clamped}
"#;

/// Lua script for heartbeat refresh.
///
/// KEYS[1] = session entry hash
/// ARGV[1] = ttl seconds
/// ARGV[2] = heartbeat timestamp (RFC 3339)
/// ARGV[3] = key prefix
///
/// The live set and counter share the entry's expiry horizon, so their
/// TTLs are pushed forward together. Returns 0 when the entry is gone.
const HEARTBEAT_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return 0
    end

    redis.call('HSET', KEYS[1], 'last_heartbeat', ARGV[2])

    local ttl = tonumber(ARGV[1])
    local user_id = redis.call('HGET', KEYS[1], 'user_id')
    local feature = redis.call('HGET', KEYS[1], 'feature')
    local license_id = redis.call('HGET', KEYS[1], 'license_id')

    redis.call('EXPIRE', KEYS[1], ttl)
    redis.call('EXPIRE', ARGV[3] .. 'session:live:' .. user_id .. ':' .. feature, ttl)
    redis.call('EXPIRE', ARGV[3] .. 'license:count:' .. license_id .. ':' .. feature, ttl)
    return 1
"#;

/// Redis-backed session cache for multi-node deployments.
#[derive(Debug, Clone)]
pub struct RedisSessionCache {
    /// Redis client wrapper.
    client: RedisClient,
}

impl RedisSessionCache {
    /// Create a new Redis session cache.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    /// Map a Redis error to an AppError.
    fn map_err(e: redis::RedisError) -> AppError {
        AppError::with_source(ErrorKind::Cache, format!("Redis error: {e}"), e)
    }

    /// Fetch and parse an entry hash by full key. Unparsable hashes are
    /// deleted defensively.
    async fn entry_by_key(&self, full_key: &str) -> AppResult<Option<SessionEntry>> {
        let mut conn = self.client.conn_mut();

        let fields: HashMap<String, String> =
            conn.hgetall(full_key).await.map_err(Self::map_err)?;
        if fields.is_empty() {
            return Ok(None);
        }

        match SessionEntry::from_fields(&fields) {
            Some(entry) => Ok(Some(entry)),
            None => {
                warn!(key = %full_key, "Deleting unparsable session entry");
                let _: () = conn.del(full_key).await.map_err(Self::map_err)?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl SessionCache for RedisSessionCache {
    async fn admit(
        &self,
        entry: &SessionEntry,
        quota: i64,
        ttl: Duration,
    ) -> AppResult<AdmitOutcome> {
        let mut conn = self.client.conn_mut();

        let script = redis::Script::new(ADMIT_SCRIPT);
        let mut invocation = script.key(self.client.prefixed_key(&keys::session_entry(entry.session_id)));
        invocation
            .key(self.client.prefixed_key(&keys::live_set(entry.user_id, entry.feature)))
            .key(self.client.prefixed_key(&keys::feature_counter(entry.license_id, entry.feature)))
            .arg(entry.session_id.to_string())
            .arg(quota)
            .arg(ttl.as_secs())
            .arg(self.client.prefix());
        for (field, value) in entry.to_fields() {
            invocation.arg(field).arg(value);
        }

        let (status, count): (i64, i64) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        match status {
            1 => Ok(AdmitOutcome::Admitted { current: count }),
            0 => Ok(AdmitOutcome::LimitExceeded {
                current: count,
                quota,
            }),
            -1 => Ok(AdmitOutcome::AlreadyActive),
            other => Err(AppError::cache(format!(
                "Unexpected admission script result: {other}"
            ))),
        }
    }

    async fn release(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        feature: Feature,
        license_id: Uuid,
    ) -> AppResult<ReleaseOutcome> {
        let mut conn = self.client.conn_mut();

        let (removed, clamped): (i64, i64) = redis::Script::new(RELEASE_SCRIPT)
            .key(self.client.prefixed_key(&keys::session_entry(session_id)))
            .key(self.client.prefixed_key(&keys::live_set(user_id, feature)))
            .key(self.client.prefixed_key(&keys::feature_counter(license_id, feature)))
            .arg(session_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        if clamped == 1 {
            warn!(
                session_id = %session_id,
                license_id = %license_id,
                feature = %feature,
                "Session counter underflowed, clamped to zero"
            );
        }

        Ok(ReleaseOutcome {
            removed: removed == 1,
            clamped: clamped == 1,
        })
    }

    async fn heartbeat(&self, session_id: Uuid, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();

        let refreshed: i64 = redis::Script::new(HEARTBEAT_SCRIPT)
            .key(self.client.prefixed_key(&keys::session_entry(session_id)))
            .arg(ttl.as_secs())
            .arg(chrono::Utc::now().to_rfc3339())
            .arg(self.client.prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        Ok(refreshed == 1)
    }

    async fn live_entry(
        &self,
        user_id: Uuid,
        feature: Feature,
    ) -> AppResult<Option<SessionEntry>> {
        let mut conn = self.client.conn_mut();

        let members: Vec<String> = conn
            .smembers(self.client.prefixed_key(&keys::live_set(user_id, feature)))
            .await
            .map_err(Self::map_err)?;

        for member in members {
            let Ok(session_id) = member.parse::<Uuid>() else {
                continue;
            };
            let full_key = self.client.prefixed_key(&keys::session_entry(session_id));
            if let Some(entry) = self.entry_by_key(&full_key).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn entry(&self, session_id: Uuid) -> AppResult<Option<SessionEntry>> {
        let full_key = self.client.prefixed_key(&keys::session_entry(session_id));
        self.entry_by_key(&full_key).await
    }

    async fn scan_entries(&self) -> AppResult<Vec<SessionEntry>> {
        let mut conn = self.client.conn_mut();
        let pattern = self.client.prefixed_key(&keys::session_entry_pattern());

        let mut entries = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(Self::map_err)?;

            for key in batch {
                let key_type: String = redis::cmd("TYPE")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(Self::map_err)?;

                if key_type != "hash" {
                    warn!(key = %key, key_type = %key_type, "Deleting key of unexpected type");
                    let _: () = conn.del(&key).await.map_err(Self::map_err)?;
                    continue;
                }

                if let Some(entry) = self.entry_by_key(&key).await? {
                    entries.push(entry);
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(count = entries.len(), "Scanned session entries");
        Ok(entries)
    }

    async fn feature_count(&self, license_id: Uuid, feature: Feature) -> AppResult<i64> {
        let mut conn = self.client.conn_mut();
        let count: Option<i64> = conn
            .get(self.client.prefixed_key(&keys::feature_counter(license_id, feature)))
            .await
            .map_err(Self::map_err)?;
        Ok(count.unwrap_or(0))
    }

    async fn health_check(&self) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(pong == "PONG")
    }
}
