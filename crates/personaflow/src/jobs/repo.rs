// crates/personaflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use crate::error::StoreError;
use crate::jobs::model::{ArtifactRefs, Job, JobFilter, JobPatch, NewJob};
use crate::jobs::state::{JobStatus, Stage};
use crate::jobs::store::{ChainOutcome, JobStore};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    job_id: String,
    subject_id: String,
    stage: String,
    status: String,
    external_ref: Option<String>,

    expected_units: i32,
    produced_units: i32,
    artifact_refs: Json<ArtifactRefs>,
    error_message: Option<String>,

    is_processed: bool,
    is_uploaded: bool,
    is_chained: bool,

    source_job_id: Option<String>,
    chain_attempts: i32,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let stage = Stage::parse(&row.stage).ok_or_else(|| StoreError::Corrupt {
            job_id: row.job_id.clone(),
            reason: format!("unknown stage {}", row.stage),
        })?;
        let status = JobStatus::parse(stage, &row.status).ok_or_else(|| StoreError::Corrupt {
            job_id: row.job_id.clone(),
            reason: format!("unknown {} status {}", stage, row.status),
        })?;

        Ok(Job {
            job_id: row.job_id,
            subject_id: row.subject_id,
            stage,
            status,
            external_ref: row.external_ref,
            expected_units: row.expected_units,
            produced_units: row.produced_units,
            artifact_refs: row.artifact_refs.0,
            error_message: row.error_message,
            is_processed: row.is_processed,
            is_uploaded: row.is_uploaded,
            is_chained: row.is_chained,
            source_job_id: row.source_job_id,
            chain_attempts: row.chain_attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

/// Postgres-backed `JobStore`.
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Row helpers
    // ----------------------------

    async fn insert_in(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, subject_id, stage, status, external_ref,
                expected_units, produced_units, artifact_refs, error_message,
                is_processed, is_uploaded, is_chained,
                source_job_id, chain_attempts,
                created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.subject_id)
        .bind(job.stage.as_str())
        .bind(job.status.as_str())
        .bind(&job.external_ref)
        .bind(job.expected_units)
        .bind(job.produced_units)
        .bind(Json(job.artifact_refs.clone()))
        .bind(&job.error_message)
        .bind(job.is_processed)
        .bind(job.is_uploaded)
        .bind(job.is_chained)
        .bind(&job.source_job_id)
        .bind(job.chain_attempts)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&mut **tx)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate(job.job_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn lock_in(
        tx: &mut Transaction<'_, Postgres>,
        job_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn write_in(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                external_ref = $3,
                expected_units = $4,
                produced_units = $5,
                artifact_refs = $6,
                error_message = $7,
                is_processed = $8,
                is_uploaded = $9,
                is_chained = $10,
                chain_attempts = $11,
                updated_at = $12,
                completed_at = $13
            WHERE job_id = $1
            "#,
        )
        .bind(&job.job_id)
        .bind(job.status.as_str())
        .bind(&job.external_ref)
        .bind(job.expected_units)
        .bind(job.produced_units)
        .bind(Json(job.artifact_refs.clone()))
        .bind(&job.error_message)
        .bind(job.is_processed)
        .bind(job.is_uploaded)
        .bind(job.is_chained)
        .bind(job.chain_attempts)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&mut **tx)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict {
                job_id: job.job_id.clone(),
                reason: "external_ref belongs to another job".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = Job::from_new(job, Utc::now());

        let mut tx = self.pool.begin().await?;
        Self::insert_in(&mut tx, &job).await?;
        tx.commit().await?;

        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE external_ref = $1")
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_in(&mut tx, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let next = current.apply(&patch, Utc::now())?;
        Self::write_in(&mut tx, &next).await?;

        tx.commit().await?;
        Ok(next)
    }

    /// Newest first, ordered by (created_at, job_id) DESC.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM jobs WHERE TRUE");

        if let Some(stage) = filter.stage {
            qb.push(" AND stage = ").push_bind(stage.as_str());
        }
        if !filter.statuses.is_empty() {
            qb.push(" AND (");
            let mut sep = qb.separated(" OR ");
            for st in &filter.statuses {
                sep.push("(stage = ")
                    .push_bind_unseparated(st.stage().as_str())
                    .push_unseparated(" AND status = ")
                    .push_bind_unseparated(st.as_str())
                    .push_unseparated(")");
            }
            qb.push(")");
        }
        if let Some(subject_id) = &filter.subject_id {
            qb.push(" AND subject_id = ").push_bind(subject_id.clone());
        }
        if let Some(v) = filter.is_chained {
            qb.push(" AND is_chained = ").push_bind(v);
        }
        if let Some(v) = filter.is_uploaded {
            qb.push(" AND is_uploaded = ").push_bind(v);
        }
        if let Some(t) = filter.updated_before {
            qb.push(" AND updated_at < ").push_bind(t);
        }

        qb.push(" ORDER BY created_at DESC, job_id DESC");

        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit.clamp(1, 10_000));
        }

        let rows = qb.build_query_as::<JobRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(job) = Self::lock_in(&mut tx, job_id).await? else {
            tx.commit().await?;
            return Ok(());
        };

        if !job.status.is_terminal() {
            return Err(StoreError::Conflict {
                job_id: job_id.to_string(),
                reason: format!("cannot delete job in non-terminal status {}", job.status),
            });
        }

        sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn chain(&self, source_job_id: &str, next: NewJob) -> Result<ChainOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The row lock on the source serializes concurrent chain attempts.
        let source = Self::lock_in(&mut tx, source_job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(source_job_id.to_string()))?;

        if source.is_chained {
            tx.commit().await?;
            return Ok(ChainOutcome::AlreadyChained);
        }

        let now = Utc::now();
        let created = Job::from_new(next, now);
        Self::insert_in(&mut tx, &created).await?;

        let source = source.apply(&JobPatch::new().chained(), now)?;
        Self::write_in(&mut tx, &source).await?;

        tx.commit().await?;
        Ok(ChainOutcome::Created(created))
    }
}
