//! SQLite-backed job store implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::sqlite::{from_db_time, from_db_time_opt, open, to_db_time};

use super::{
    Batch, BatchStatus, CreateJobRequest, EvaluationResult, Job, JobError, JobFilter, JobStatus,
    JobStore, Metadata, ScoringTemplate, StageName, StageRecord, StageStatus, TranscriptSegment,
    Vertical,
};

const JOB_COLUMNS: &str = "id, user_id, template_id, batch_id, input_ref, original_filename, status, processing_started_at, processing_completed_at, error_message, duration_seconds, work_dir, created_at, updated_at";

const STAGE_COLUMNS: &str =
    "id, job_id, stage, status, task_id, started_at, finished_at, error_message, metadata";

fn db_err(e: impl std::fmt::Display) -> JobError {
    JobError::Database(e.to_string())
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (or create) the database file and its tables.
    pub fn new(path: &Path) -> Result<Self, JobError> {
        let conn = open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, mostly for tests.
    pub fn in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                template_id INTEGER NOT NULL,
                batch_id TEXT,
                input_ref TEXT NOT NULL,
                original_filename TEXT,
                status TEXT NOT NULL,
                processing_started_at TEXT,
                processing_completed_at TEXT,
                error_message TEXT,
                duration_seconds INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                work_dir TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_batch ON jobs(batch_id);

            CREATE TABLE IF NOT EXISTS stage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id),
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                task_id TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error_message TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_stage_records_job ON stage_records(job_id);
            CREATE INDEX IF NOT EXISTS idx_stage_records_status ON stage_records(status, started_at);

            CREATE TABLE IF NOT EXISTS scoring_templates (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                vertical TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                user_prompt_template TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS transcripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id),
                speaker_label TEXT NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                text TEXT NOT NULL,
                confidence REAL
            );

            CREATE INDEX IF NOT EXISTS idx_transcripts_job ON transcripts(job_id);

            CREATE TABLE IF NOT EXISTS evaluation_results (
                job_id INTEGER PRIMARY KEY REFERENCES jobs(id),
                template_id INTEGER NOT NULL,
                overall_score REAL NOT NULL,
                pillar_scores TEXT NOT NULL,
                compliance_flags TEXT NOT NULL,
                fatal_flaw_detected INTEGER NOT NULL DEFAULT 0,
                fatal_flaw_type TEXT,
                summary TEXT,
                recommendations TEXT NOT NULL,
                sentiment_score REAL,
                raw_output TEXT NOT NULL,
                prompt_version INTEGER NOT NULL,
                model_used TEXT NOT NULL,
                processing_duration_secs REAL NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                num_jobs INTEGER NOT NULL,
                num_completed INTEGER NOT NULL DEFAULT 0,
                num_failed INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, JobError> {
        self.conn
            .lock()
            .map_err(|_| JobError::Database("connection lock poisoned".to_string()))
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(user_id) = filter.user_id {
            conditions.push("user_id = ?");
            params.push(Box::new(user_id));
        }

        if let Some(ref batch_id) = filter.batch_id {
            conditions.push("batch_id = ?");
            params.push(Box::new(batch_id.clone()));
        }

        if let Some(cutoff) = filter.started_before {
            conditions.push("processing_started_at IS NOT NULL AND processing_started_at < ?");
            params.push(Box::new(to_db_time(&cutoff)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status_str: String = row.get(6)?;
        let work_dir: Option<String> = row.get(11)?;
        let created_at: String = row.get(12)?;
        let updated_at: String = row.get(13)?;

        Ok(Job {
            id: row.get(0)?,
            user_id: row.get(1)?,
            template_id: row.get(2)?,
            batch_id: row.get(3)?,
            input_ref: row.get(4)?,
            original_filename: row.get(5)?,
            status: status_str.parse().unwrap_or(JobStatus::Failed),
            processing_started_at: from_db_time_opt(row.get(7)?),
            processing_completed_at: from_db_time_opt(row.get(8)?),
            error_message: row.get(9)?,
            duration_seconds: row.get(10)?,
            work_dir: work_dir.map(PathBuf::from),
            created_at: from_db_time(&created_at),
            updated_at: from_db_time(&updated_at),
        })
    }

    fn row_to_stage_record(row: &rusqlite::Row) -> rusqlite::Result<StageRecord> {
        let stage: String = row.get(2)?;
        let status: String = row.get(3)?;
        let started_at: String = row.get(5)?;
        let metadata_json: String = row.get(8)?;

        Ok(StageRecord {
            id: row.get(0)?,
            job_id: row.get(1)?,
            stage: stage.parse().unwrap_or(StageName::Failed),
            status: status.parse().unwrap_or(StageStatus::Failed),
            task_id: row.get(4)?,
            started_at: from_db_time(&started_at),
            finished_at: from_db_time_opt(row.get(6)?),
            error_message: row.get(7)?,
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        })
    }

    fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<Batch> {
        let status: String = row.get(5)?;
        let created_at: String = row.get(6)?;

        Ok(Batch {
            id: row.get(0)?,
            user_id: row.get(1)?,
            num_jobs: row.get(2)?,
            num_completed: row.get(3)?,
            num_failed: row.get(4)?,
            status: if status == "completed" {
                BatchStatus::Completed
            } else {
                BatchStatus::Processing
            },
            created_at: from_db_time(&created_at),
            completed_at: from_db_time_opt(row.get(7)?),
        })
    }

    fn load_job(conn: &Connection, id: i64) -> Result<Job, JobError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| JobError::NotFound(format!("job {}", id)))
    }

    fn load_stage_record(conn: &Connection, id: i64) -> Result<StageRecord, JobError> {
        conn.query_row(
            &format!("SELECT {} FROM stage_records WHERE id = ?", STAGE_COLUMNS),
            params![id],
            Self::row_to_stage_record,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| JobError::NotFound(format!("stage record {}", id)))
    }

    fn check_transition(job: &Job, next: JobStatus, operation: &str) -> Result<(), JobError> {
        if job.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(JobError::InvalidState {
                job_id: job.id,
                current_state: job.status.as_str().to_string(),
                operation: operation.to_string(),
            })
        }
    }

    /// Close an in-progress stage record. Records already closed stay as they are.
    fn finish_stage(
        &self,
        record_id: i64,
        status: StageStatus,
        error: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> Result<StageRecord, JobError> {
        let conn = self.conn()?;
        let record = Self::load_stage_record(&conn, record_id)?;

        if record.status != StageStatus::InProgress {
            return Err(JobError::InvalidState {
                job_id: record.job_id,
                current_state: format!("{} record {}", record.stage, record.status),
                operation: format!("close stage record {} of", record_id),
            });
        }

        let now = Utc::now();
        let metadata_json = match metadata {
            Some(m) => serde_json::to_string(m).map_err(db_err)?,
            None => serde_json::to_string(&record.metadata).map_err(db_err)?,
        };

        conn.execute(
            "UPDATE stage_records SET status = ?, finished_at = ?, error_message = ?, metadata = ? WHERE id = ?",
            params![status.as_str(), to_db_time(&now), error, metadata_json, record_id],
        )
        .map_err(db_err)?;

        Ok(StageRecord {
            status,
            finished_at: Some(now),
            error_message: error.map(str::to_string),
            metadata: metadata.cloned().unwrap_or(record.metadata.clone()),
            ..record
        })
    }

    fn count_batch_jobs(conn: &Connection, batch_id: &str, status: JobStatus) -> Result<i64, JobError> {
        conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE batch_id = ? AND status = ?",
            params![batch_id, status.as_str()],
            |row| row.get(0),
        )
        .map_err(db_err)
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, request: CreateJobRequest) -> Result<Job, JobError> {
        let conn = self.conn()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO jobs (user_id, template_id, batch_id, input_ref, original_filename, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                request.user_id,
                request.template_id,
                request.batch_id,
                request.input_ref,
                request.original_filename,
                JobStatus::Queued.as_str(),
                to_db_time(&now),
                to_db_time(&now),
            ],
        )
        .map_err(db_err)?;

        Ok(Job {
            id: conn.last_insert_rowid(),
            user_id: request.user_id,
            template_id: request.template_id,
            batch_id: request.batch_id,
            input_ref: request.input_ref,
            original_filename: request.original_filename,
            status: JobStatus::Queued,
            processing_started_at: None,
            processing_completed_at: None,
            error_message: None,
            duration_seconds: None,
            work_dir: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_job(&self, id: i64) -> Result<Option<Job>, JobError> {
        let conn = self.conn()?;
        match Self::load_job(&conn, id) {
            Ok(job) => Ok(Some(job)),
            Err(JobError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY id ASC LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, JobError> {
        let conn = self.conn()?;
        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(db_err)
    }

    fn begin_processing(&self, id: i64, work_dir: &Path, task_id: &str) -> Result<Job, JobError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let job = Self::load_job(&tx, id)?;
        Self::check_transition(&job, JobStatus::Processing, "start processing")?;

        let now = Utc::now();
        let work_dir_str = work_dir.to_string_lossy().to_string();

        tx.execute(
            "UPDATE jobs SET status = ?, processing_started_at = ?, work_dir = ?, error_message = NULL, updated_at = ? WHERE id = ?",
            params![
                JobStatus::Processing.as_str(),
                to_db_time(&now),
                work_dir_str,
                to_db_time(&now),
                id
            ],
        )
        .map_err(db_err)?;

        tx.execute(
            "INSERT INTO stage_records (job_id, stage, status, task_id, started_at, finished_at, metadata) VALUES (?, ?, ?, ?, ?, ?, '{}')",
            params![
                id,
                StageName::Uploaded.as_str(),
                StageStatus::Completed.as_str(),
                task_id,
                to_db_time(&now),
                to_db_time(&now)
            ],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;

        Ok(Job {
            status: JobStatus::Processing,
            processing_started_at: Some(now),
            work_dir: Some(work_dir.to_path_buf()),
            error_message: None,
            updated_at: now,
            ..job
        })
    }

    fn set_duration(&self, id: i64, duration_seconds: i64) -> Result<(), JobError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE jobs SET duration_seconds = ?, updated_at = ? WHERE id = ?",
                params![duration_seconds, to_db_time(&Utc::now()), id],
            )
            .map_err(db_err)?;

        if updated == 0 {
            return Err(JobError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    fn complete_job(&self, id: i64) -> Result<Job, JobError> {
        let conn = self.conn()?;
        let job = Self::load_job(&conn, id)?;
        Self::check_transition(&job, JobStatus::Completed, "complete")?;

        let now = Utc::now();
        conn.execute(
            "UPDATE jobs SET status = ?, processing_completed_at = ?, updated_at = ? WHERE id = ?",
            params![
                JobStatus::Completed.as_str(),
                to_db_time(&now),
                to_db_time(&now),
                id
            ],
        )
        .map_err(db_err)?;

        Ok(Job {
            status: JobStatus::Completed,
            processing_completed_at: Some(now),
            updated_at: now,
            ..job
        })
    }

    fn fail_job(&self, id: i64, error: &str) -> Result<Job, JobError> {
        let conn = self.conn()?;
        let job = Self::load_job(&conn, id)?;
        Self::check_transition(&job, JobStatus::Failed, "fail")?;

        let now = Utc::now();
        conn.execute(
            "UPDATE jobs SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
            params![JobStatus::Failed.as_str(), error, to_db_time(&now), id],
        )
        .map_err(db_err)?;

        Ok(Job {
            status: JobStatus::Failed,
            error_message: Some(error.to_string()),
            updated_at: now,
            ..job
        })
    }

    fn cancel_job(&self, id: i64, reason: &str) -> Result<Job, JobError> {
        let conn = self.conn()?;
        let job = Self::load_job(&conn, id)?;
        Self::check_transition(&job, JobStatus::Cancelled, "cancel")?;

        let now = Utc::now();
        conn.execute(
            "UPDATE jobs SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
            params![JobStatus::Cancelled.as_str(), reason, to_db_time(&now), id],
        )
        .map_err(db_err)?;

        Ok(Job {
            status: JobStatus::Cancelled,
            error_message: Some(reason.to_string()),
            updated_at: now,
            ..job
        })
    }

    fn start_stage(
        &self,
        job_id: i64,
        stage: StageName,
        task_id: &str,
    ) -> Result<StageRecord, JobError> {
        let conn = self.conn()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO stage_records (job_id, stage, status, task_id, started_at, metadata) VALUES (?, ?, ?, ?, ?, '{}')",
            params![
                job_id,
                stage.as_str(),
                StageStatus::InProgress.as_str(),
                task_id,
                to_db_time(&now)
            ],
        )
        .map_err(db_err)?;

        Ok(StageRecord {
            id: conn.last_insert_rowid(),
            job_id,
            stage,
            status: StageStatus::InProgress,
            task_id: Some(task_id.to_string()),
            started_at: now,
            finished_at: None,
            error_message: None,
            metadata: Metadata::new(),
        })
    }

    fn complete_stage(&self, record_id: i64, metadata: &Metadata) -> Result<StageRecord, JobError> {
        self.finish_stage(record_id, StageStatus::Completed, None, Some(metadata))
    }

    fn fail_stage(&self, record_id: i64, error: &str) -> Result<StageRecord, JobError> {
        self.finish_stage(record_id, StageStatus::Failed, Some(error), None)
    }

    fn stage_records(&self, job_id: i64) -> Result<Vec<StageRecord>, JobError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM stage_records WHERE job_id = ? ORDER BY id ASC",
                STAGE_COLUMNS
            ))
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![job_id], Self::row_to_stage_record)
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn stale_stage_records(&self, cutoff: DateTime<Utc>) -> Result<Vec<StageRecord>, JobError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM stage_records WHERE status = ? AND started_at < ? ORDER BY id ASC",
                STAGE_COLUMNS
            ))
            .map_err(db_err)?;

        let rows = stmt
            .query_map(
                params![StageStatus::InProgress.as_str(), to_db_time(&cutoff)],
                Self::row_to_stage_record,
            )
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn get_template(&self, id: i64) -> Result<Option<ScoringTemplate>, JobError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, vertical, system_prompt, user_prompt_template, version, is_active FROM scoring_templates WHERE id = ?",
            params![id],
            |row| {
                let vertical: String = row.get(2)?;
                let vertical = vertical.parse::<Vertical>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?;
                Ok(ScoringTemplate {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    vertical,
                    system_prompt: row.get(3)?,
                    user_prompt_template: row.get(4)?,
                    version: row.get(5)?,
                    is_active: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn save_template(&self, template: &ScoringTemplate) -> Result<(), JobError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO scoring_templates (id, name, vertical, system_prompt, user_prompt_template, version, is_active) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                template.id,
                template.name,
                template.vertical.as_str(),
                template.system_prompt,
                template.user_prompt_template,
                template.version,
                template.is_active
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn replace_transcript(
        &self,
        job_id: i64,
        segments: &[TranscriptSegment],
    ) -> Result<(), JobError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        tx.execute("DELETE FROM transcripts WHERE job_id = ?", params![job_id])
            .map_err(db_err)?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO transcripts (job_id, speaker_label, start_time, end_time, text, confidence) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .map_err(db_err)?;
            for segment in segments {
                stmt.execute(params![
                    job_id,
                    segment.speaker_label,
                    segment.start_time,
                    segment.end_time,
                    segment.text,
                    segment.confidence
                ])
                .map_err(db_err)?;
            }
        }

        tx.commit().map_err(db_err)
    }

    fn transcript(&self, job_id: i64) -> Result<Vec<TranscriptSegment>, JobError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT speaker_label, start_time, end_time, text, confidence FROM transcripts WHERE job_id = ? ORDER BY start_time ASC, id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(TranscriptSegment {
                    speaker_label: row.get(0)?,
                    start_time: row.get(1)?,
                    end_time: row.get(2)?,
                    text: row.get(3)?,
                    confidence: row.get(4)?,
                })
            })
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn save_evaluation(&self, result: &EvaluationResult) -> Result<(), JobError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO evaluation_results (job_id, template_id, overall_score, pillar_scores, compliance_flags, fatal_flaw_detected, fatal_flaw_type, summary, recommendations, sentiment_score, raw_output, prompt_version, model_used, processing_duration_secs, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                result.job_id,
                result.template_id,
                result.overall_score,
                serde_json::to_string(&result.pillar_scores).map_err(db_err)?,
                result.compliance_flags.to_string(),
                result.fatal_flaw_detected,
                result.fatal_flaw_type,
                result.summary,
                result.recommendations.to_string(),
                result.sentiment_score,
                result.raw_output.to_string(),
                result.prompt_version,
                result.model_used,
                result.processing_duration_secs,
                to_db_time(&result.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn evaluation(&self, job_id: i64) -> Result<Option<EvaluationResult>, JobError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT job_id, template_id, overall_score, pillar_scores, compliance_flags, fatal_flaw_detected, fatal_flaw_type, summary, recommendations, sentiment_score, raw_output, prompt_version, model_used, processing_duration_secs, created_at FROM evaluation_results WHERE job_id = ?",
            params![job_id],
            |row| {
                let pillars: String = row.get(3)?;
                let flags: String = row.get(4)?;
                let recommendations: String = row.get(8)?;
                let raw: String = row.get(10)?;
                let created_at: String = row.get(14)?;
                Ok(EvaluationResult {
                    job_id: row.get(0)?,
                    template_id: row.get(1)?,
                    overall_score: row.get(2)?,
                    pillar_scores: serde_json::from_str(&pillars).unwrap_or_default(),
                    compliance_flags: serde_json::from_str(&flags).unwrap_or_default(),
                    fatal_flaw_detected: row.get(5)?,
                    fatal_flaw_type: row.get(6)?,
                    summary: row.get(7)?,
                    recommendations: serde_json::from_str(&recommendations).unwrap_or_default(),
                    sentiment_score: row.get(9)?,
                    raw_output: serde_json::from_str(&raw).unwrap_or_default(),
                    prompt_version: row.get(11)?,
                    model_used: row.get(12)?,
                    processing_duration_secs: row.get(13)?,
                    created_at: from_db_time(&created_at),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn create_batch(&self, user_id: i64, num_jobs: i64) -> Result<Batch, JobError> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO batches (id, user_id, num_jobs, status, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                id,
                user_id,
                num_jobs,
                BatchStatus::Processing.as_str(),
                to_db_time(&now)
            ],
        )
        .map_err(db_err)?;

        Ok(Batch {
            id,
            user_id,
            num_jobs,
            num_completed: 0,
            num_failed: 0,
            status: BatchStatus::Processing,
            created_at: now,
            completed_at: None,
        })
    }

    fn get_batch(&self, id: &str) -> Result<Option<Batch>, JobError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, user_id, num_jobs, num_completed, num_failed, status, created_at, completed_at FROM batches WHERE id = ?",
            params![id],
            Self::row_to_batch,
        )
        .optional()
        .map_err(db_err)
    }

    fn open_batches(&self) -> Result<Vec<Batch>, JobError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, num_jobs, num_completed, num_failed, status, created_at, completed_at FROM batches WHERE status = ? ORDER BY created_at ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(
                params![BatchStatus::Processing.as_str()],
                Self::row_to_batch,
            )
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn refresh_batch(&self, id: &str) -> Result<Batch, JobError> {
        let conn = self.conn()?;

        let batch = conn
            .query_row(
                "SELECT id, user_id, num_jobs, num_completed, num_failed, status, created_at, completed_at FROM batches WHERE id = ?",
                params![id],
                Self::row_to_batch,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| JobError::NotFound(format!("batch {}", id)))?;

        let num_completed = Self::count_batch_jobs(&conn, id, JobStatus::Completed)?;
        let num_failed = Self::count_batch_jobs(&conn, id, JobStatus::Failed)?
            + Self::count_batch_jobs(&conn, id, JobStatus::Cancelled)?;

        let (status, completed_at) = if num_completed + num_failed >= batch.num_jobs {
            (
                BatchStatus::Completed,
                batch.completed_at.or_else(|| Some(Utc::now())),
            )
        } else {
            (BatchStatus::Processing, None)
        };

        conn.execute(
            "UPDATE batches SET num_completed = ?, num_failed = ?, status = ?, completed_at = ? WHERE id = ?",
            params![
                num_completed,
                num_failed,
                status.as_str(),
                completed_at.as_ref().map(to_db_time),
                id
            ],
        )
        .map_err(db_err)?;

        Ok(Batch {
            num_completed,
            num_failed,
            status,
            completed_at,
            ..batch
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> SqliteJobStore {
        SqliteJobStore::in_memory().unwrap()
    }

    fn create_test_request() -> CreateJobRequest {
        CreateJobRequest {
            user_id: 7,
            template_id: 1,
            input_ref: "uploads/7/call.wav".to_string(),
            original_filename: Some("call.wav".to_string()),
            batch_id: None,
        }
    }

    #[test]
    fn test_create_job_is_queued() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();

        assert!(job.id > 0);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.processing_started_at.is_none());

        let fetched = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(fetched.input_ref, "uploads/7/call.wav");
        assert_eq!(fetched.status, JobStatus::Queued);
    }

    #[test]
    fn test_get_nonexistent_job() {
        let store = create_test_store();
        assert!(store.get_job(999).unwrap().is_none());
    }

    #[test]
    fn test_begin_processing_writes_uploaded_record() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();

        let started = store
            .begin_processing(job.id, Path::new("/tmp/work/job-1"), "task-1")
            .unwrap();
        assert_eq!(started.status, JobStatus::Processing);
        assert!(started.processing_started_at.is_some());

        let fetched = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(fetched.work_dir, Some(PathBuf::from("/tmp/work/job-1")));

        let records = store.stage_records(job.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, StageName::Uploaded);
        assert_eq!(records[0].status, StageStatus::Completed);
        assert_eq!(records[0].task_id.as_deref(), Some("task-1"));
    }

    #[test]
    fn test_work_dir_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let job_id = {
            let store = SqliteJobStore::new(&path).unwrap();
            let job = store.create_job(create_test_request()).unwrap();
            store
                .begin_processing(job.id, Path::new("/tmp/work/job-1"), "task-1")
                .unwrap();
            job.id
        };

        // Opening again runs the schema setup on the existing tables
        let store = SqliteJobStore::new(&path).unwrap();
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.work_dir, Some(PathBuf::from("/tmp/work/job-1")));
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn test_begin_processing_requires_queued() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();
        store
            .begin_processing(job.id, Path::new("/tmp/a"), "t1")
            .unwrap();

        let err = store
            .begin_processing(job.id, Path::new("/tmp/b"), "t2")
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
        // No second hand-off record
        assert_eq!(store.stage_records(job.id).unwrap().len(), 1);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();
        store.begin_processing(job.id, Path::new("/tmp/a"), "t").unwrap();
        store.complete_job(job.id).unwrap();

        let err = store.fail_job(job.id, "late failure").unwrap_err();
        assert!(err.is_terminal_conflict());
        assert!(store.cancel_job(job.id, "too late").is_err());

        let fetched = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert!(fetched.processing_completed_at.is_some());
        assert!(fetched.error_message.is_none());
    }

    #[test]
    fn test_complete_requires_processing() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();
        assert!(store.complete_job(job.id).is_err());
    }

    #[test]
    fn test_fail_job_records_message() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();
        store.begin_processing(job.id, Path::new("/tmp/a"), "t").unwrap();

        let failed = store.fail_job(job.id, "ffmpeg exited with 1").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        let fetched = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(fetched.error_message.as_deref(), Some("ffmpeg exited with 1"));
    }

    #[test]
    fn test_stage_record_lifecycle() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();

        let record = store
            .start_stage(job.id, StageName::Normalization, "task-n")
            .unwrap();
        assert_eq!(record.status, StageStatus::InProgress);

        let mut metadata = Metadata::new();
        metadata.insert("duration_seconds".to_string(), serde_json::json!(42.5));
        let done = store.complete_stage(record.id, &metadata).unwrap();
        assert_eq!(done.status, StageStatus::Completed);
        assert!(done.finished_at.is_some());

        let records = store.stage_records(job.id).unwrap();
        assert_eq!(records[0].metadata["duration_seconds"], serde_json::json!(42.5));

        // A closed record cannot be closed again
        assert!(store.fail_stage(record.id, "late").is_err());
    }

    #[test]
    fn test_retries_append_new_records() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();

        for attempt in 1..=3 {
            let record = store
                .start_stage(job.id, StageName::Vad, &format!("task-{}", attempt))
                .unwrap();
            store.fail_stage(record.id, "model load failed").unwrap();
        }

        let records = store.stage_records(job.id).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == StageStatus::Failed));
        assert!(records
            .iter()
            .all(|r| r.error_message.as_deref() == Some("model load failed")));
    }

    #[test]
    fn test_stale_stage_records() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();
        let open = store
            .start_stage(job.id, StageName::Diarization, "t1")
            .unwrap();
        let closed = store.start_stage(job.id, StageName::Vad, "t0").unwrap();
        store.complete_stage(closed.id, &Metadata::new()).unwrap();

        let future = Utc::now() + chrono::Duration::hours(1);
        let stale = store.stale_stage_records(future).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, open.id);

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(store.stale_stage_records(past).unwrap().is_empty());
    }

    #[test]
    fn test_list_with_filters() {
        let store = create_test_store();
        let a = store.create_job(create_test_request()).unwrap();
        let mut other_user = create_test_request();
        other_user.user_id = 8;
        store.create_job(other_user).unwrap();
        store.begin_processing(a.id, Path::new("/tmp/a"), "t").unwrap();

        let processing = store
            .list_jobs(&JobFilter::new().with_status(JobStatus::Processing))
            .unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, a.id);

        assert_eq!(store.count_jobs(&JobFilter::new().with_user(8)).unwrap(), 1);
        assert_eq!(store.count_jobs(&JobFilter::new()).unwrap(), 2);

        let old = store
            .list_jobs(&JobFilter::new().started_before(Utc::now() + chrono::Duration::minutes(1)))
            .unwrap();
        assert_eq!(old.len(), 1);
    }

    #[test]
    fn test_template_round_trip() {
        let store = create_test_store();
        let template = ScoringTemplate {
            id: 3,
            name: "Collections QA".to_string(),
            vertical: Vertical::Collections,
            system_prompt: "You are a QA analyst.".to_string(),
            user_prompt_template: "Score this call:\n{transcript}".to_string(),
            version: 2,
            is_active: true,
        };
        store.save_template(&template).unwrap();
        assert_eq!(store.get_template(3).unwrap(), Some(template));
        assert!(store.get_template(4).unwrap().is_none());
    }

    #[test]
    fn test_replace_transcript_is_idempotent() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();
        let segments = vec![
            TranscriptSegment {
                speaker_label: "Agent".to_string(),
                start_time: 0.0,
                end_time: 2.5,
                text: "Hello, thanks for calling.".to_string(),
                confidence: Some(-0.2),
            },
            TranscriptSegment {
                speaker_label: "Customer".to_string(),
                start_time: 2.6,
                end_time: 4.0,
                text: "Hi.".to_string(),
                confidence: None,
            },
        ];

        store.replace_transcript(job.id, &segments).unwrap();
        store.replace_transcript(job.id, &segments).unwrap();

        assert_eq!(store.transcript(job.id).unwrap(), segments);
    }

    #[test]
    fn test_evaluation_upsert() {
        let store = create_test_store();
        let job = store.create_job(create_test_request()).unwrap();
        let mut result = EvaluationResult {
            job_id: job.id,
            template_id: 1,
            overall_score: 40.0,
            pillar_scores: [("CMP".to_string(), 40.0)].into_iter().collect(),
            compliance_flags: serde_json::json!([]),
            fatal_flaw_detected: false,
            fatal_flaw_type: None,
            summary: Some("ok".to_string()),
            recommendations: serde_json::json!(["slow down"]),
            sentiment_score: Some(0.1),
            raw_output: serde_json::json!({"cmp_score": 40}),
            prompt_version: 1,
            model_used: "llama3".to_string(),
            processing_duration_secs: 1.5,
            created_at: Utc::now(),
        };
        store.save_evaluation(&result).unwrap();
        result.overall_score = 80.0;
        store.save_evaluation(&result).unwrap();

        let stored = store.evaluation(job.id).unwrap().unwrap();
        assert_eq!(stored.overall_score, 80.0);
        assert_eq!(stored.pillar_scores["CMP"], 40.0);
        assert_eq!(stored.recommendations, serde_json::json!(["slow down"]));
    }

    #[test]
    fn test_batch_refresh_closes_when_all_terminal() {
        let store = create_test_store();
        let batch = store.create_batch(7, 2).unwrap();

        let mut request = create_test_request();
        request.batch_id = Some(batch.id.clone());
        let a = store.create_job(request.clone()).unwrap();
        let b = store.create_job(request).unwrap();

        store.begin_processing(a.id, Path::new("/tmp/a"), "t").unwrap();
        store.complete_job(a.id).unwrap();

        let refreshed = store.refresh_batch(&batch.id).unwrap();
        assert_eq!(refreshed.num_completed, 1);
        assert_eq!(refreshed.status, BatchStatus::Processing);
        assert_eq!(store.open_batches().unwrap().len(), 1);

        store.fail_job(b.id, "boom").unwrap();
        let refreshed = store.refresh_batch(&batch.id).unwrap();
        assert_eq!(refreshed.num_failed, 1);
        assert_eq!(refreshed.status, BatchStatus::Completed);
        assert!(refreshed.completed_at.is_some());
        assert!(store.open_batches().unwrap().is_empty());
    }

    #[test]
    fn test_file_based_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("jobs.db");

        let id = {
            let store = SqliteJobStore::new(&db_path).unwrap();
            store.create_job(create_test_request()).unwrap().id
        };

        let store = SqliteJobStore::new(&db_path).unwrap();
        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }
}
