//! Durable store for users, connections, jobs and items.
//!
//! Single-writer invariant: this is the only module that mutates job and
//! item rows, and every state write carries its FSM precondition in the
//! SQL so at-least-once stage delivery cannot double-run a stage.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    Candidate, Classification, Connection, ImportItem, ImportJob, ImportReport, JobState, Provider,
    SourceTrack, User,
};

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    display_name: String,
    session_token: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ConnectionRow {
    id: Uuid,
    user_id: Uuid,
    provider: String,
    credentials: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    user_id: Uuid,
    source_playlist_id: String,
    source_playlist_name: Option<String>,
    target_provider: String,
    state: String,
    error_message: Option<String>,
    target_playlist_id: Option<String>,
    report: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: Uuid,
    job_id: Uuid,
    position: i32,
    source_track: serde_json::Value,
    best_match: Option<serde_json::Value>,
    classification: String,
    selected_target_id: Option<String>,
}

/// Aggregate item counts for a job.
#[derive(Debug, Default, serde::Serialize)]
pub struct ItemStats {
    pub total: i64,
    pub matched: i64,
    pub uncertain: i64,
    pub not_found: i64,
    pub skipped: i64,
}

/// One reviewer decision for one item.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewDecision {
    pub item_id: Uuid,
    pub decision: DecisionKind,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub candidate: Option<Candidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Confirm,
    Reject,
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> AppError {
    AppError::Internal(format!("corrupt {} row: {}", what, detail))
}

impl UserRow {
    fn into_user(self) -> User {
        User {
            id: self.id,
            display_name: self.display_name,
            session_token: self.session_token,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl ConnectionRow {
    fn into_connection(self) -> Result<Connection> {
        Ok(Connection {
            id: self.id,
            user_id: self.user_id,
            provider: self
                .provider
                .parse::<Provider>()
                .map_err(|e| corrupt("connection", e))?,
            credentials: self.credentials,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl JobRow {
    fn into_job(self) -> Result<ImportJob> {
        let report = match self.report {
            Some(value) => {
                Some(serde_json::from_value::<ImportReport>(value).map_err(|e| corrupt("job", e))?)
            }
            None => None,
        };
        Ok(ImportJob {
            id: self.id,
            user_id: self.user_id,
            source_playlist_id: self.source_playlist_id,
            source_playlist_name: self.source_playlist_name,
            target_provider: self
                .target_provider
                .parse::<Provider>()
                .map_err(|e| corrupt("job", e))?,
            state: self.state.parse::<JobState>().map_err(|e| corrupt("job", e))?,
            error_message: self.error_message,
            target_playlist_id: self.target_playlist_id,
            report,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl ItemRow {
    fn into_item(self) -> Result<ImportItem> {
        let source_track: SourceTrack =
            serde_json::from_value(self.source_track).map_err(|e| corrupt("item", e))?;
        let best_match = match self.best_match {
            Some(value) => {
                Some(serde_json::from_value::<Candidate>(value).map_err(|e| corrupt("item", e))?)
            }
            None => None,
        };
        Ok(ImportItem {
            id: self.id,
            job_id: self.job_id,
            position: self.position,
            source_track,
            best_match,
            classification: self
                .classification
                .parse::<Classification>()
                .map_err(|e| corrupt("item", e))?,
            selected_target_id: self.selected_target_id,
        })
    }
}

/// Apply one reviewer decision to an in-memory item. Confirming without an
/// override and without a best match leaves the item untouched.
pub fn apply_decision(item: &mut ImportItem, decision: &ReviewDecision) {
    match decision.decision {
        DecisionKind::Confirm => {
            if let Some(target_id) = decision.target_id.clone().filter(|t| !t.is_empty()) {
                item.classification = Classification::Matched;
                item.selected_target_id = Some(target_id);
                if let Some(candidate) = &decision.candidate {
                    item.best_match = Some(candidate.clone());
                }
            } else if let Some(best) = &item.best_match {
                item.classification = Classification::Matched;
                item.selected_target_id = Some(best.target_id.clone());
            }
        }
        DecisionKind::Reject => {
            item.classification = Classification::NotFound;
            item.selected_target_id = None;
        }
    }
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ---- users ----

    /// Resolve a session token to a user, provisioning one on first sight.
    pub async fn ensure_user(&self, session_token: &str) -> Result<User> {
        if let Some(row) = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE session_token = $1",
        )
        .bind(session_token)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(row.into_user());
        }

        let display_name = format!("tenant-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let row = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (display_name, session_token) VALUES ($1, $2) \
             ON CONFLICT (session_token) DO UPDATE SET updated_at = now() \
             RETURNING *",
        )
        .bind(&display_name)
        .bind(session_token)
        .fetch_one(&self.pool)
        .await?;
        tracing::info!(user_id = %row.id, "provisioned tenant user");
        Ok(row.into_user())
    }

    // ---- connections ----

    /// Store or rotate the credential blob for `(user, provider)` in one
    /// atomic statement.
    pub async fn upsert_connection(
        &self,
        user_id: Uuid,
        provider: Provider,
        credentials: &serde_json::Value,
    ) -> Result<Connection> {
        let row = sqlx::query_as::<_, ConnectionRow>(
            "INSERT INTO connections (user_id, provider, credentials) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id, provider) \
             DO UPDATE SET credentials = EXCLUDED.credentials, updated_at = now() \
             RETURNING *",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .bind(credentials)
        .fetch_one(&self.pool)
        .await?;
        row.into_connection()
    }

    pub async fn connection(&self, user_id: Uuid, provider: Provider) -> Result<Option<Connection>> {
        let row = sqlx::query_as::<_, ConnectionRow>(
            "SELECT * FROM connections WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ConnectionRow::into_connection).transpose()
    }

    pub async fn connections_for_user(&self, user_id: Uuid) -> Result<Vec<Connection>> {
        let rows = sqlx::query_as::<_, ConnectionRow>(
            "SELECT * FROM connections WHERE user_id = $1 ORDER BY provider",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ConnectionRow::into_connection).collect()
    }

    // ---- jobs ----

    pub async fn create_job(
        &self,
        user_id: Uuid,
        source_playlist_id: &str,
        target_provider: Provider,
    ) -> Result<ImportJob> {
        let row = sqlx::query_as::<_, JobRow>(
            "INSERT INTO import_jobs (user_id, source_playlist_id, target_provider, state) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(user_id)
        .bind(source_playlist_id)
        .bind(target_provider.as_str())
        .bind(JobState::Queued.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.into_job()
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM import_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    /// Owner-scoped fetch; a foreign job is indistinguishable from a
    /// missing one.
    pub async fn job_for_user(&self, job_id: Uuid, user_id: Uuid) -> Result<Option<ImportJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM import_jobs WHERE id = $1 AND user_id = $2",
        )
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    pub async fn jobs_for_user(&self, user_id: Uuid) -> Result<Vec<ImportJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM import_jobs WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Guarded FSM transition. Returns false when the job is no longer in
    /// `from` (duplicate queue delivery, cancellation, concurrent writer).
    pub async fn transition(&self, job_id: Uuid, from: JobState, to: JobState) -> Result<bool> {
        if !from.can_transition(to) {
            return Err(AppError::Internal(format!(
                "illegal job transition {} -> {}",
                from, to
            )));
        }
        let result = sqlx::query(
            "UPDATE import_jobs SET state = $1, updated_at = now() \
             WHERE id = $2 AND state = $3",
        )
        .bind(to.as_str())
        .bind(job_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a non-terminal job to FAILED with a reason.
    pub async fn fail_job(&self, job_id: Uuid, message: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE import_jobs SET state = $1, error_message = $2, updated_at = now() \
             WHERE id = $3 AND state NOT IN ($4, $5)",
        )
        .bind(JobState::Failed.as_str())
        .bind(message)
        .bind(job_id)
        .bind(JobState::Done.as_str())
        .bind(JobState::Failed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_playlist_name(&self, job_id: Uuid, name: &str) -> Result<()> {
        sqlx::query(
            "UPDATE import_jobs SET source_playlist_name = $1, updated_at = now() WHERE id = $2",
        )
        .bind(name)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_target_playlist(&self, job_id: Uuid, target_playlist_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE import_jobs SET target_playlist_id = $1, updated_at = now() WHERE id = $2",
        )
        .bind(target_playlist_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Finish a finalize run: persist the report and playlist id and move
    /// IMPORTING to DONE in one guarded statement. A finalize with nothing
    /// to write completes without either.
    pub async fn complete_job(
        &self,
        job_id: Uuid,
        target_playlist_id: Option<&str>,
        report: Option<&ImportReport>,
    ) -> Result<bool> {
        let report_value = report
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE import_jobs \
             SET state = $1, \
                 target_playlist_id = COALESCE($2, target_playlist_id), \
                 report = COALESCE($3, report), \
                 updated_at = now() \
             WHERE id = $4 AND state = $5",
        )
        .bind(JobState::Done.as_str())
        .bind(target_playlist_id)
        .bind(report_value)
        .bind(job_id)
        .bind(JobState::Importing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ---- items ----

    /// Persist the match-stage items for a job in one transaction.
    pub async fn insert_items(&self, job_id: Uuid, items: &[NewItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            let source_track = serde_json::to_value(&item.source_track)
                .map_err(|e| AppError::Internal(e.to_string()))?;
            let best_match = item
                .best_match
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| AppError::Internal(e.to_string()))?;
            sqlx::query(
                "INSERT INTO import_items \
                 (job_id, position, source_track, best_match, classification, selected_target_id) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(job_id)
            .bind(item.position)
            .bind(source_track)
            .bind(best_match)
            .bind(item.classification.as_str())
            .bind(&item.selected_target_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn items_for_job(&self, job_id: Uuid) -> Result<Vec<ImportItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM import_items WHERE job_id = $1 ORDER BY position",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Items the reviewer has to look at: uncertain and not-found.
    pub async fn review_items(&self, job_id: Uuid) -> Result<Vec<ImportItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM import_items \
             WHERE job_id = $1 AND classification IN ($2, $3) ORDER BY position",
        )
        .bind(job_id)
        .bind(Classification::Uncertain.as_str())
        .bind(Classification::NotFound.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Items that will be written at finalize time, in source order.
    pub async fn matched_items(&self, job_id: Uuid) -> Result<Vec<ImportItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM import_items \
             WHERE job_id = $1 AND classification = $2 AND selected_target_id IS NOT NULL \
             ORDER BY position",
        )
        .bind(job_id)
        .bind(Classification::Matched.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    pub async fn item_stats(&self, job_id: Uuid) -> Result<ItemStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT classification, COUNT(*) FROM import_items \
             WHERE job_id = $1 GROUP BY classification",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = ItemStats::default();
        for (classification, count) in rows {
            stats.total += count;
            match classification.parse::<Classification>() {
                Ok(Classification::Matched) => stats.matched = count,
                Ok(Classification::Uncertain) => stats.uncertain = count,
                Ok(Classification::NotFound) => stats.not_found = count,
                Ok(Classification::Skipped) => stats.skipped = count,
                Err(e) => return Err(corrupt("item", e)),
            }
        }
        Ok(stats)
    }

    /// Apply reviewer decisions inside one transaction. Items outside the
    /// job are ignored rather than leaked across owners.
    pub async fn apply_decisions(&self, job_id: Uuid, decisions: &[ReviewDecision]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut applied = 0;
        for decision in decisions {
            let row = sqlx::query_as::<_, ItemRow>(
                "SELECT * FROM import_items WHERE id = $1 AND job_id = $2 FOR UPDATE",
            )
            .bind(decision.item_id)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(row) = row else { continue };
            let mut item = row.into_item()?;
            apply_decision(&mut item, decision);

            let best_match = item
                .best_match
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| AppError::Internal(e.to_string()))?;
            sqlx::query(
                "UPDATE import_items \
                 SET classification = $1, selected_target_id = $2, best_match = $3 \
                 WHERE id = $4",
            )
            .bind(item.classification.as_str())
            .bind(&item.selected_target_id)
            .bind(best_match)
            .bind(item.id)
            .execute(&mut *tx)
            .await?;
            applied += 1;
        }
        tx.commit().await?;
        Ok(applied)
    }
}

/// Item payload produced by the match stage, before it has a row id.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub position: i32,
    pub source_track: SourceTrack,
    pub best_match: Option<Candidate>,
    pub classification: Classification,
    pub selected_target_id: Option<String>,
}
