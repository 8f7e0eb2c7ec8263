use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::models::detection::{BoundingBox, DetectionResult};
use crate::models::job::{CallerId, JobId, JobRecord, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, caller, status, priority, request_size, model_name, error, \
                           created_at, updated_at, completed_at";

fn job_from_row(row: &PgRow) -> Result<JobRecord, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str).map_err(|e| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: Box::new(e),
    })?;

    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        caller: CallerId::new(row.try_get::<String, _>("caller")?),
        status,
        priority: row.try_get("priority")?,
        request_size: row.try_get("request_size")?,
        model_name: row.try_get("model_name")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Insert a new job in `queued` status
pub async fn create_job(pool: &PgPool, job: &NewJob) -> Result<JobRecord, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO detection_jobs (caller, status, priority, request_size)
        VALUES ($1, 'queued', $2, $3)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job.caller.as_str())
    .bind(job.priority)
    .bind(job.request_size)
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: JobId) -> Result<Option<JobRecord>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM detection_jobs WHERE id = $1"
    ))
    .bind(job_id.get())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Store the detection with its boxes and mark the job completed, atomically
pub async fn insert_result(pool: &PgPool, result: &DetectionResult) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let detection_id: i64 = sqlx::query(
        r#"
        INSERT INTO detections
            (job_id, model_name, image_width, image_height, image_hash, processing_time_ms)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(result.job_id.get())
    .bind(&result.model_name)
    .bind(result.image_width as i32)
    .bind(result.image_height as i32)
    .bind(&result.image_hash)
    .bind(result.processing_time_ms as i64)
    .fetch_one(&mut *tx)
    .await?
    .try_get("id")?;

    for (ordinal, bbox) in result.boxes.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO bounding_boxes
                (detection_id, ordinal, class_name, confidence, x1, y1, x2, y2)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(detection_id)
        .bind(ordinal as i32)
        .bind(&bbox.class_name)
        .bind(bbox.confidence)
        .bind(bbox.x1)
        .bind(bbox.y1)
        .bind(bbox.x2)
        .bind(bbox.y2)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        UPDATE detection_jobs
        SET status = 'completed',
            model_name = $2,
            error = NULL,
            updated_at = NOW(),
            completed_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(result.job_id.get())
    .bind(&result.model_name)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Mark a job failed with an error description
pub async fn mark_failed(pool: &PgPool, job_id: JobId, error: &str) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE detection_jobs
        SET status = 'failed',
            error = $2,
            updated_at = NOW(),
            completed_at = NOW()
        WHERE id = $1 AND status <> 'completed'
        "#,
    )
    .bind(job_id.get())
    .bind(error)
    .execute(pool)
    .await?;

    Ok(done.rows_affected())
}

/// Mark a job abandoned, but only while no worker has finished it
pub async fn mark_abandoned(pool: &PgPool, job_id: JobId) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE detection_jobs
        SET status = 'abandoned',
            updated_at = NOW()
        WHERE id = $1 AND status = 'queued'
        "#,
    )
    .bind(job_id.get())
    .execute(pool)
    .await?;

    Ok(done.rows_affected())
}

/// Get the detection result for a job, boxes in engine order
pub async fn get_result(
    pool: &PgPool,
    job_id: JobId,
) -> Result<Option<DetectionResult>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, model_name, image_width, image_height, image_hash, processing_time_ms
        FROM detections
        WHERE job_id = $1
        "#,
    )
    .bind(job_id.get())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let detection_id: i64 = row.try_get("id")?;

    let boxes = sqlx::query(
        r#"
        SELECT class_name, confidence, x1, y1, x2, y2
        FROM bounding_boxes
        WHERE detection_id = $1
        ORDER BY ordinal ASC
        "#,
    )
    .bind(detection_id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|b| {
        Ok(BoundingBox {
            class_name: b.try_get("class_name")?,
            confidence: b.try_get("confidence")?,
            x1: b.try_get("x1")?,
            y1: b.try_get("y1")?,
            x2: b.try_get("x2")?,
            y2: b.try_get("y2")?,
        })
    })
    .collect::<Result<Vec<_>, sqlx::Error>>()?;

    Ok(Some(DetectionResult {
        job_id,
        model_name: row.try_get("model_name")?,
        image_width: row.try_get::<i32, _>("image_width")? as u32,
        image_height: row.try_get::<i32, _>("image_height")? as u32,
        image_hash: row.try_get("image_hash")?,
        processing_time_ms: row.try_get::<i64, _>("processing_time_ms")? as u64,
        boxes,
    }))
}
