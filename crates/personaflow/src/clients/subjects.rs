use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::StoreError;

/// Persona attributes the prompts are built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubjectRecord {
    pub subject_id: String,
    pub name: String,
    pub description: String,
    pub personality: String,
    pub mbti: Option<String>,
    pub speech_style: Option<String>,
}

#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    async fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectRecord>, StoreError>;
}

/// Reads personas from the `subjects` table.
#[derive(Clone)]
pub struct PgSubjectDirectory {
    pool: PgPool,
}

impl PgSubjectDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, s: &SubjectRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subjects (subject_id, name, description, personality, mbti, speech_style)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (subject_id) DO UPDATE
            SET name = EXCLUDED.name,
                description = EXCLUDED.description,
                personality = EXCLUDED.personality,
                mbti = EXCLUDED.mbti,
                speech_style = EXCLUDED.speech_style
            "#,
        )
        .bind(&s.subject_id)
        .bind(&s.name)
        .bind(&s.description)
        .bind(&s.personality)
        .bind(&s.mbti)
        .bind(&s.speech_style)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubjectDirectory for PgSubjectDirectory {
    async fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectRecord>, StoreError> {
        let row = sqlx::query_as::<_, SubjectRecord>(
            r#"
            SELECT subject_id, name, description, personality, mbti, speech_style
            FROM subjects
            WHERE subject_id = $1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
