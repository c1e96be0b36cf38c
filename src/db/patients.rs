//! Patient repository
//!
//! Resolves a `P###` code from the upload path to a patient row and its
//! assigned therapist. Absence is allowed: a session can be created without
//! a resolved patient and linked later.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Patient {
    pub id: String,
    pub patient_code: String,
    pub therapist_id: Option<String>,
    pub treatment_start_date: Option<DateTime<Utc>>,
    pub total_sessions_planned: i64,
    pub trial_duration_days: i64,
    pub created_at: DateTime<Utc>,
}

pub async fn find_by_code(pool: &SqlitePool, patient_code: &str) -> Result<Option<Patient>> {
    Ok(
        sqlx::query_as::<_, Patient>("SELECT * FROM patients WHERE patient_code = ?")
            .bind(patient_code)
            .fetch_optional(pool)
            .await?,
    )
}

pub async fn create_patient(
    pool: &SqlitePool,
    patient_code: &str,
    therapist_id: Option<&str>,
    total_sessions_planned: i64,
    trial_duration_days: i64,
) -> Result<Patient> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO patients
            (id, patient_code, therapist_id, treatment_start_date,
             total_sessions_planned, trial_duration_days, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(patient_code)
    .bind(therapist_id)
    .bind(now)
    .bind(total_sessions_planned)
    .bind(trial_duration_days)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(find_by_code(pool, patient_code).await?.expect("just inserted"))
}
