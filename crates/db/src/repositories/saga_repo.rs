//! Repository for the `sagas` and `saga_transitions` tables.
//!
//! Every state change is a compare-and-set on `(id, version, state_id)` and
//! writes its audit row in the same transaction. A lost race surfaces as
//! `Ok(None)` rather than an error so callers can tell "someone else moved
//! this saga" apart from "the database is unavailable".

use onboard_core::pagination::{clamp_limit, clamp_offset};
use onboard_core::saga::{NewSaga, Saga, SagaState, SagaTransition, StateId};
use onboard_core::types::{SagaId, Timestamp};
use serde::Deserialize;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::saga::{SagaRow, SagaTransitionRow};

/// Column list for `sagas` queries.
const COLUMNS: &str = "\
    id, subject_id, state_id, payload, version, last_error, created_at, updated_at";

/// Column list for `saga_transitions` queries.
const TRANSITION_COLUMNS: &str = "saga_id, from_state_id, to_state_id, detail, created_at";

/// Maximum page size for saga listing.
const MAX_LIMIT: i64 = 500;

/// Default page size for saga listing.
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters for `GET /sagas`.
#[derive(Debug, Default, Deserialize)]
pub struct SagaListQuery {
    /// Filter by state name (case-insensitive).
    pub state: Option<String>,
    /// Maximum number of results. Defaults to 100, capped at 500.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

/// Saga persistence operations.
pub struct SagaRepo;

impl SagaRepo {
    /// Insert a saga in `Started`, or return the existing saga for the same
    /// subject.
    ///
    /// The boolean is `true` when a new row was written. `subject_id` carries
    /// the `uq_sagas_subject_id` constraint, so a redelivered trigger can
    /// never produce a second saga.
    pub async fn insert_or_get(pool: &PgPool, input: &NewSaga) -> Result<(Saga, bool), sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "INSERT INTO sagas (id, subject_id, state_id, payload) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (subject_id) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, SagaRow>(&query)
            .bind(input.id)
            .bind(&input.subject_id)
            .bind(SagaState::Started.id())
            .bind(&input.payload)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = inserted {
            Self::record_transition(&mut tx, row.id, None, SagaState::Started, None).await?;
            tx.commit().await?;
            return Ok((decode(row)?, true));
        }

        tx.rollback().await?;
        let existing = Self::find_by_subject(pool, &input.subject_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok((existing, false))
    }

    /// Find a saga by its primary key.
    pub async fn find_by_id(pool: &PgPool, id: SagaId) -> Result<Option<Saga>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM sagas WHERE id = $1");
        sqlx::query_as::<_, SagaRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(decode)
            .transpose()
    }

    /// Find the saga for a subject, if one exists.
    pub async fn find_by_subject(pool: &PgPool, subject_id: &str) -> Result<Option<Saga>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM sagas WHERE subject_id = $1");
        sqlx::query_as::<_, SagaRow>(&query)
            .bind(subject_id)
            .fetch_optional(pool)
            .await?
            .map(decode)
            .transpose()
    }

    /// List sagas, newest first, optionally filtered by state.
    pub async fn list(
        pool: &PgPool,
        state: Option<SagaState>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Saga>, sqlx::Error> {
        let limit = clamp_limit(limit, DEFAULT_LIMIT, MAX_LIMIT);
        let offset = clamp_offset(offset);
        let query = format!(
            "SELECT {COLUMNS} FROM sagas \
             WHERE ($1::SMALLINT IS NULL OR state_id = $1) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2 OFFSET $3"
        );
        sqlx::query_as::<_, SagaRow>(&query)
            .bind(state.map(SagaState::id))
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Non-terminal sagas untouched since `cutoff`, oldest first.
    pub async fn list_stalled(
        pool: &PgPool,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<Vec<Saga>, sqlx::Error> {
        let non_terminal: Vec<StateId> = SagaState::NON_TERMINAL.iter().map(|s| s.id()).collect();
        let query = format!(
            "SELECT {COLUMNS} FROM sagas \
             WHERE state_id = ANY($1) AND updated_at < $2 \
             ORDER BY updated_at ASC \
             LIMIT $3"
        );
        sqlx::query_as::<_, SagaRow>(&query)
            .bind(&non_terminal)
            .bind(cutoff)
            .bind(limit.max(1))
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Move `current` to `to` if nobody else has written it since it was read.
    ///
    /// `last_error` is stored only when given. Returns `Ok(None)` when the
    /// version or state no longer match. The caller is expected to have
    /// validated the transition with [`SagaState::ensure_transition`].
    pub async fn transition(
        pool: &PgPool,
        current: &Saga,
        to: SagaState,
        detail: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Option<Saga>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "UPDATE sagas \
             SET state_id = $4, version = version + 1, updated_at = NOW(), \
                 last_error = COALESCE($5, last_error) \
             WHERE id = $1 AND version = $2 AND state_id = $3 \
             RETURNING {COLUMNS}"
        );
        let updated = sqlx::query_as::<_, SagaRow>(&query)
            .bind(current.id)
            .bind(current.version)
            .bind(current.state.id())
            .bind(to.id())
            .bind(last_error)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = updated else {
            tx.rollback().await?;
            return Ok(None);
        };

        Self::record_transition(&mut tx, current.id, Some(current.state), to, detail).await?;
        tx.commit().await?;
        decode(row).map(Some)
    }

    /// Take ownership of a saga without changing its state.
    ///
    /// Bumps `version` and `updated_at`, so a concurrent owner's next write
    /// fails its version check and the sweeper sees the saga as fresh.
    pub async fn claim(pool: &PgPool, current: &Saga) -> Result<Option<Saga>, sqlx::Error> {
        let query = format!(
            "UPDATE sagas SET version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND version = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, SagaRow>(&query)
            .bind(current.id)
            .bind(current.version)
            .fetch_optional(pool)
            .await?
            .map(decode)
            .transpose()
    }

    /// Audit trail for a saga, oldest first.
    pub async fn list_transitions(pool: &PgPool, id: SagaId) -> Result<Vec<SagaTransition>, sqlx::Error> {
        let query = format!(
            "SELECT {TRANSITION_COLUMNS} FROM saga_transitions \
             WHERE saga_id = $1 ORDER BY id ASC"
        );
        sqlx::query_as::<_, SagaTransitionRow>(&query)
            .bind(id)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(|row| SagaTransition::try_from(row).map_err(|e| sqlx::Error::Decode(Box::new(e))))
            .collect()
    }

    async fn record_transition(
        tx: &mut Transaction<'_, Postgres>,
        saga_id: SagaId,
        from: Option<SagaState>,
        to: SagaState,
        detail: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO saga_transitions (saga_id, from_state_id, to_state_id, detail) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(saga_id)
        .bind(from.map(SagaState::id))
        .bind(to.id())
        .bind(detail)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn decode(row: SagaRow) -> Result<Saga, sqlx::Error> {
    Saga::try_from(row).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
