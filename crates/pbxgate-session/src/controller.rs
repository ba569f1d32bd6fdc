//! Session admission controller.
//!
//! The atomic check-and-create / validate / heartbeat / end protocol.
//! The atomic cache is authoritative for admission; the durable store is
//! written behind it and repaired by reconciliation. When the cache is
//! unavailable the controller degrades to durable-only checks with
//! reduced concurrency guarantees, and denies when those fail too.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pbxgate_cache::{AdmitOutcome, SessionCache, SessionEntry};
use pbxgate_core::config::session::SessionConfig;
use pbxgate_core::error::AppError;
use pbxgate_core::result::AppResult;
use pbxgate_entity::license::{Feature, LicenseRecord};
use pbxgate_entity::session::{CreateSession, SessionRecord, SessionStatus};
use pbxgate_license::master::{ActivityEvent, MasterApi, SessionActivity};
use pbxgate_license::LicenseSyncEngine;

use crate::store::SessionStore;
use crate::token::SessionTokens;

/// Result of a validation call.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    /// The caller's device already holds the live session.
    Valid {
        /// The live session entry.
        session: SessionEntry,
    },
    /// No live session exists; the caller may create one.
    ReadyToCreate,
    /// A session from another device exists and could not be evicted.
    Conflict,
}

/// Result of a successful admission.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    /// Session id.
    pub session_id: Uuid,
    /// Signed session token.
    pub session_token: String,
    /// Quota the session was admitted against.
    pub max_users: i32,
    /// Concurrent sessions for the license/feature after admission.
    pub current_users: i64,
}

/// Result of a combined validate+create round trip.
#[derive(Debug, Clone)]
pub enum SetupOutcome {
    /// The caller's device already held the live session.
    Existing(SessionEntry),
    /// A new session was admitted.
    Created(CreatedSession),
}

/// Request metadata recorded with the session.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    /// Client IP address.
    pub ip_address: Option<String>,
    /// Client User-Agent.
    pub user_agent: Option<String>,
}

/// Answer to the telephony layer's registration-time token check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistrationValidation {
    /// Whether the token and license admit the registration.
    pub valid: bool,
    /// User quota of the current license.
    pub max_users: i32,
    /// Enabled features of the current license.
    pub features: Vec<Feature>,
}

/// The Session Admission Controller.
pub struct AdmissionController {
    /// Atomic session cache, authoritative for admission.
    cache: Arc<dyn SessionCache>,
    /// Durable session store, repaired by reconciliation.
    sessions: Arc<dyn SessionStore>,
    /// License sync engine.
    license: Arc<LicenseSyncEngine>,
    /// Master client for best-effort activity notifications.
    master: Arc<dyn MasterApi>,
    /// Session token codec.
    tokens: SessionTokens,
    /// Session configuration.
    config: SessionConfig,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .finish()
    }
}

impl AdmissionController {
    /// Create a new admission controller.
    pub fn new(
        cache: Arc<dyn SessionCache>,
        sessions: Arc<dyn SessionStore>,
        license: Arc<LicenseSyncEngine>,
        master: Arc<dyn MasterApi>,
        tokens: SessionTokens,
        config: SessionConfig,
    ) -> Self {
        Self {
            cache,
            sessions,
            license,
            master,
            tokens,
            config,
        }
    }

    fn session_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.config.ttl_minutes * 60)
    }

    fn durable_expiry(&self) -> chrono::DateTime<Utc> {
        Utc::now() + Duration::minutes(self.config.ttl_minutes as i64)
    }

    /// Check whether a live session exists for the principal/feature pair.
    ///
    /// Same device ⇒ `Valid` (heartbeat refreshed). Different device ⇒ the
    /// previous session is evicted (last admission wins) and the caller may
    /// create. Falls back to the durable store when the cache is down.
    pub async fn validate(
        &self,
        user_id: Uuid,
        feature: Feature,
        client_fingerprint: &str,
    ) -> AppResult<ValidationOutcome> {
        let live = match self.cache.live_entry(user_id, feature).await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "Session cache unavailable, validating against durable store");
                return self.validate_degraded(user_id, feature, client_fingerprint).await;
            }
        };

        let Some(entry) = live else {
            return Ok(ValidationOutcome::ReadyToCreate);
        };

        if entry.client_fingerprint == client_fingerprint {
            let _ = self.cache.heartbeat(entry.session_id, self.session_ttl()).await;
            let _ = self
                .sessions
                .touch_heartbeat(entry.session_id, self.durable_expiry())
                .await;
            return Ok(ValidationOutcome::Valid { session: entry });
        }

        info!(
            user_id = %user_id,
            feature = %feature,
            evicted_session = %entry.session_id,
            "Fingerprint mismatch, evicting previous device session"
        );

        match self
            .end_session(entry.session_id, user_id, feature, Some(entry.license_id))
            .await
        {
            Ok(()) => Ok(ValidationOutcome::ReadyToCreate),
            Err(e) => {
                error!(error = %e, "Failed to evict conflicting session");
                Ok(ValidationOutcome::Conflict)
            }
        }
    }

    /// Durable-only validation used when the cache is unreachable.
    async fn validate_degraded(
        &self,
        user_id: Uuid,
        feature: Feature,
        client_fingerprint: &str,
    ) -> AppResult<ValidationOutcome> {
        let Some(row) = self
            .sessions
            .find_active_by_user_feature(user_id, feature)
            .await?
        else {
            return Ok(ValidationOutcome::ReadyToCreate);
        };

        if row.client_fingerprint == client_fingerprint {
            let _ = self
                .sessions
                .touch_heartbeat(row.id, self.durable_expiry())
                .await;
            return Ok(ValidationOutcome::Valid {
                session: entry_from_record(&row),
            });
        }

        let _ = self.sessions.mark_ended(row.id, SessionStatus::Disconnected).await;
        Ok(ValidationOutcome::ReadyToCreate)
    }

    /// Admit a new session.
    ///
    /// The quota check is an atomic increment-and-compare inside the
    /// cache; on rejection the increment is already compensated. A
    /// conflicting session from another device is evicted and admission
    /// retried once. Durable persistence failures do not roll back the
    /// admission; the cache is authoritative and reconciliation repairs
    /// the gap.
    pub async fn create(
        &self,
        user_id: Uuid,
        username: &str,
        feature: Feature,
        client_fingerprint: &str,
        meta: &ClientMeta,
    ) -> AppResult<CreatedSession> {
        let license = self.license.get_current_license().await?;

        if !license.is_active() {
            return Err(AppError::license_inactive(format!(
                "License is {}",
                license.status
            )));
        }
        if !license.feature_enabled(feature) {
            return Err(AppError::feature_disabled(format!(
                "Feature '{feature}' is not enabled on the current license"
            )));
        }

        let quota = license.quota_for(feature) as i64;
        let entry = self.new_entry(user_id, username, feature, client_fingerprint, meta, &license);

        let outcome = match self.cache.admit(&entry, quota, self.session_ttl()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Session cache unavailable, admitting in degraded mode");
                return self.create_degraded(entry, quota, &license).await;
            }
        };

        match outcome {
            AdmitOutcome::Admitted { current } => {
                Ok(self.finish_admission(entry, current, quota, &license).await)
            }
            AdmitOutcome::LimitExceeded { current, quota } => Err(AppError::limit_exceeded(
                format!("Maximum concurrent '{feature}' users reached ({current}/{quota})"),
                current,
                quota,
            )),
            AdmitOutcome::AlreadyActive => {
                // Same device would have validated as VALID; a different
                // device wins the seat (last admission wins).
                let existing = self.cache.live_entry(user_id, feature).await?;
                match existing {
                    Some(previous) if previous.client_fingerprint != client_fingerprint => {
                        info!(
                            user_id = %user_id,
                            feature = %feature,
                            evicted_session = %previous.session_id,
                            "Evicting previous device session during create"
                        );
                        self.end_session(
                            previous.session_id,
                            user_id,
                            feature,
                            Some(previous.license_id),
                        )
                        .await?;

                        match self.cache.admit(&entry, quota, self.session_ttl()).await? {
                            AdmitOutcome::Admitted { current } => {
                                Ok(self.finish_admission(entry, current, quota, &license).await)
                            }
                            AdmitOutcome::LimitExceeded { current, quota } => {
                                Err(AppError::limit_exceeded(
                                    format!(
                                        "Maximum concurrent '{feature}' users reached ({current}/{quota})"
                                    ),
                                    current,
                                    quota,
                                ))
                            }
                            AdmitOutcome::AlreadyActive => Err(AppError::session_conflict(
                                "User already has an active session for this feature",
                            )),
                        }
                    }
                    _ => Err(AppError::session_conflict(
                        "User already has an active session for this feature",
                    )),
                }
            }
        }
    }

    /// Build the cache entry for a new admission.
    fn new_entry(
        &self,
        user_id: Uuid,
        username: &str,
        feature: Feature,
        client_fingerprint: &str,
        meta: &ClientMeta,
        license: &LicenseRecord,
    ) -> SessionEntry {
        let now = Utc::now();
        SessionEntry {
            session_id: Uuid::new_v4(),
            user_id,
            username: username.to_string(),
            feature,
            license_id: license.id,
            client_fingerprint: client_fingerprint.to_string(),
            ip_address: meta.ip_address.clone(),
            user_agent: meta.user_agent.clone(),
            created_at: now,
            last_heartbeat: now,
        }
    }

    /// Persist the durable row, issue the token, and notify the master.
    /// The admission already happened; nothing here can undo it.
    async fn finish_admission(
        &self,
        entry: SessionEntry,
        current: i64,
        quota: i64,
        license: &LicenseRecord,
    ) -> CreatedSession {
        let token = self
            .tokens
            .issue(
                entry.session_id,
                license.id,
                entry.user_id,
                &entry.client_fingerprint,
                &entry.username,
            )
            .unwrap_or_default();

        let create = CreateSession {
            id: entry.session_id,
            session_token: token.clone(),
            user_id: entry.user_id,
            username: entry.username.clone(),
            feature: entry.feature,
            license_id: license.id,
            master_license_id: license.master_license_id.clone(),
            client_fingerprint: entry.client_fingerprint.clone(),
            ip_address: entry.ip_address.clone(),
            user_agent: entry.user_agent.clone(),
            expires_at: self.durable_expiry(),
        };

        if let Err(e) = self.sessions.create(&create).await {
            error!(
                session_id = %entry.session_id,
                error = %e,
                "Durable session write failed after admission, left for reconciliation"
            );
        }

        info!(
            session_id = %entry.session_id,
            user_id = %entry.user_id,
            feature = %entry.feature,
            current_users = current,
            max_users = quota,
            "Session admitted"
        );

        self.notify_activity(
            &license.master_license_id,
            entry.user_id,
            &entry.username,
            entry.feature,
            ActivityEvent::Created,
        );

        CreatedSession {
            session_id: entry.session_id,
            session_token: token,
            max_users: quota as i32,
            current_users: current,
        }
    }

    /// Durable-only admission used when the cache is unreachable. The
    /// check-then-act here is not atomic, and a durable-store failure
    /// denies admission rather than failing open.
    async fn create_degraded(
        &self,
        mut entry: SessionEntry,
        quota: i64,
        license: &LicenseRecord,
    ) -> AppResult<CreatedSession> {
        if let Some(previous) = self
            .sessions
            .find_active_by_user_feature(entry.user_id, entry.feature)
            .await?
        {
            if previous.client_fingerprint == entry.client_fingerprint {
                return Err(AppError::session_conflict(
                    "User already has an active session for this feature",
                ));
            }
            let _ = self
                .sessions
                .mark_ended(previous.id, SessionStatus::Disconnected)
                .await;
        }

        let current = self
            .sessions
            .count_active_by_license_feature(license.id, entry.feature)
            .await?;
        if current >= quota {
            return Err(AppError::limit_exceeded(
                format!(
                    "Maximum concurrent '{}' users reached ({current}/{quota})",
                    entry.feature
                ),
                current,
                quota,
            ));
        }

        let token = self.tokens.issue(
            entry.session_id,
            license.id,
            entry.user_id,
            &entry.client_fingerprint,
            &entry.username,
        )?;

        entry.last_heartbeat = Utc::now();
        self.sessions
            .create(&CreateSession {
                id: entry.session_id,
                session_token: token.clone(),
                user_id: entry.user_id,
                username: entry.username.clone(),
                feature: entry.feature,
                license_id: license.id,
                master_license_id: license.master_license_id.clone(),
                client_fingerprint: entry.client_fingerprint.clone(),
                ip_address: entry.ip_address.clone(),
                user_agent: entry.user_agent.clone(),
                expires_at: self.durable_expiry(),
            })
            .await?;

        warn!(
            session_id = %entry.session_id,
            "Session admitted in degraded mode (durable store only)"
        );

        self.notify_activity(
            &license.master_license_id,
            entry.user_id,
            &entry.username,
            entry.feature,
            ActivityEvent::Created,
        );

        Ok(CreatedSession {
            session_id: entry.session_id,
            session_token: token,
            max_users: quota as i32,
            current_users: current + 1,
        })
    }

    /// Combined validate+create in one round trip.
    pub async fn setup(
        &self,
        user_id: Uuid,
        username: &str,
        feature: Feature,
        client_fingerprint: &str,
        meta: &ClientMeta,
    ) -> AppResult<SetupOutcome> {
        match self.validate(user_id, feature, client_fingerprint).await? {
            ValidationOutcome::Valid { session } => Ok(SetupOutcome::Existing(session)),
            ValidationOutcome::ReadyToCreate | ValidationOutcome::Conflict => {
                let created = self
                    .create(user_id, username, feature, client_fingerprint, meta)
                    .await?;
                Ok(SetupOutcome::Created(created))
            }
        }
    }

    /// Refresh a session's heartbeat. A heartbeat on a session the cache
    /// no longer knows is a no-op, not an error.
    pub async fn heartbeat(&self, session_id: Uuid) -> AppResult<()> {
        match self.cache.heartbeat(session_id, self.session_ttl()).await {
            Ok(true) => {
                let _ = self
                    .sessions
                    .touch_heartbeat(session_id, self.durable_expiry())
                    .await;
            }
            Ok(false) => {
                debug!(session_id = %session_id, "Heartbeat on unknown session, ignoring");
            }
            Err(e) => {
                warn!(error = %e, "Session cache unavailable, heartbeating durable row only");
                let _ = self
                    .sessions
                    .touch_heartbeat(session_id, self.durable_expiry())
                    .await;
            }
        }
        Ok(())
    }

    /// End a session. Idempotent: ending an already-ended session
    /// succeeds silently.
    pub async fn end(&self, session_id: Uuid, user_id: Uuid, feature: Feature) -> AppResult<()> {
        let license_id = match self.cache.entry(session_id).await {
            Ok(Some(entry)) => Some(entry.license_id),
            _ => match self.sessions.find_by_id(session_id).await {
                Ok(Some(row)) => Some(row.license_id),
                _ => None,
            },
        };

        self.end_session(session_id, user_id, feature, license_id).await
    }

    /// End every active session for a principal. Returns how many were
    /// ended.
    pub async fn end_all_for_user(&self, user_id: Uuid) -> AppResult<u32> {
        let rows = self.sessions.end_all_for_user(user_id).await?;

        for row in &rows {
            if let Err(e) = self
                .cache
                .release(row.id, row.user_id, row.feature, row.license_id)
                .await
            {
                warn!(session_id = %row.id, error = %e, "Failed to release cache entry");
            }
            self.notify_activity(
                &row.master_license_id,
                row.user_id,
                &row.username,
                row.feature,
                ActivityEvent::Ended,
            );
        }

        info!(user_id = %user_id, count = rows.len(), "Ended all sessions for user");
        Ok(rows.len() as u32)
    }

    /// Administrative forced cleanup for a principal/feature pair.
    /// Idempotent: succeeds whether or not anything existed.
    pub async fn force_cleanup(&self, user_id: Uuid, feature: Feature) -> AppResult<()> {
        if let Ok(Some(entry)) = self.cache.live_entry(user_id, feature).await {
            let _ = self
                .end_session(entry.session_id, user_id, feature, Some(entry.license_id))
                .await;
        }

        match self.sessions.find_active_by_user_feature(user_id, feature).await {
            Ok(Some(row)) => {
                let _ = self
                    .cache
                    .release(row.id, row.user_id, row.feature, row.license_id)
                    .await;
                let _ = self.sessions.mark_ended(row.id, SessionStatus::Expired).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Forced cleanup could not reach durable store");
            }
        }

        info!(user_id = %user_id, feature = %feature, "Forced session cleanup");
        Ok(())
    }

    /// Registration-time token check made by the telephony layer when a
    /// device registers.
    pub async fn validate_registration(&self, token: &str) -> AppResult<RegistrationValidation> {
        if self.tokens.verify(token).is_err() {
            return Ok(RegistrationValidation {
                valid: false,
                max_users: 0,
                features: Vec::new(),
            });
        }

        let license = self.license.get_current_license().await?;
        Ok(RegistrationValidation {
            valid: license.is_active(),
            max_users: license.max_users,
            features: license.features.enabled(),
        })
    }

    /// Shared teardown: release from the cache, mark the durable row, and
    /// notify the master. Every step tolerates the others' absence.
    async fn end_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        feature: Feature,
        license_id: Option<Uuid>,
    ) -> AppResult<()> {
        if let Some(license_id) = license_id {
            match self.cache.release(session_id, user_id, feature, license_id).await {
                Ok(outcome) if outcome.clamped => {
                    warn!(
                        session_id = %session_id,
                        "Counter underflow during release, repair left to reconciliation"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Cache release failed");
                }
            }
        }

        let row = self.sessions.find_by_id(session_id).await.unwrap_or(None);
        let _ = self
            .sessions
            .mark_ended(session_id, SessionStatus::Disconnected)
            .await;

        if let Some(row) = row {
            self.notify_activity(
                &row.master_license_id,
                row.user_id,
                &row.username,
                row.feature,
                ActivityEvent::Ended,
            );
        }

        debug!(session_id = %session_id, "Session ended");
        Ok(())
    }

    /// Fire-and-forget session activity notification; failure never
    /// blocks the local decision.
    fn notify_activity(
        &self,
        master_license_id: &str,
        user_id: Uuid,
        username: &str,
        feature: Feature,
        event: ActivityEvent,
    ) {
        let master = Arc::clone(&self.master);
        let activity = SessionActivity {
            master_license_id: master_license_id.to_string(),
            user_id,
            username: username.to_string(),
            feature,
            event,
            occurred_at: Utc::now(),
        };

        tokio::spawn(async move {
            if let Err(e) = master.notify_session_activity(&activity).await {
                debug!(error = %e, "Session activity notification failed");
            }
        });
    }
}

/// Project a durable row into the cache entry shape for degraded-mode
/// validation responses.
fn entry_from_record(row: &SessionRecord) -> SessionEntry {
    SessionEntry {
        session_id: row.id,
        user_id: row.user_id,
        username: row.username.clone(),
        feature: row.feature,
        license_id: row.license_id,
        client_fingerprint: row.client_fingerprint.clone(),
        ip_address: row.ip_address.clone(),
        user_agent: row.user_agent.clone(),
        created_at: row.created_at,
        last_heartbeat: row.last_heartbeat.unwrap_or(row.created_at),
    }
}
