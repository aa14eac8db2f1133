/// Module de la file durable des jobs de backfill
///
/// ARCHITECTURE:
/// La file vit dans la table backfill_queue du magasin. Les opérations
/// sensibles (enqueue avec fusion, leasing) s'exécutent dans une
/// transaction pour rester atomiques face aux workers concurrents.
///
/// Garantie d'ordre: parmi les jobs prêts, le leasing suit l'ordre total
/// (priority DESC, created_at ASC). Aucune garantie entre priorités une
/// fois les jobs loués.
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::models::{BackfillJob, JobStatus};
use crate::store::Store;
use crate::timeframe::Timeframe;
use crate::utils::now_ms;

/// Nombre de tentatives avant de marquer un job failed
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// Backoff exponentiel: base et plafond (plein jitter)
const BACKOFF_BASE_MS: i64 = 1_000;
const BACKOFF_CAP_MS: i64 = 60_000;

/// Priorités conventionnelles des producteurs de jobs
pub mod priority {
    /// Scan profond quotidien
    pub const DEEP_SCAN: i64 = 1;
    /// Balayage horaire des instruments primaires
    pub const SWEEP: i64 = 5;
    /// Commandes opérateur et réparation de bougies dégénérées
    pub const MANUAL: i64 = 10;
}

/// Compteurs de jobs par statut
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// File de backfill adossée au magasin
#[derive(Clone)]
pub struct BackfillQueue {
    conn: Arc<Mutex<Connection>>,
    max_attempts: i64,
}

impl BackfillQueue {
    pub fn new(store: &Store) -> Self {
        BackfillQueue {
            conn: store.connection(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Exécute une opération bloquante depuis un contexte asynchrone
    pub async fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&BackfillQueue) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.clone();
        Ok(tokio::task::spawn_blocking(move || f(&queue)).await??)
    }

    /// Enfile un job, idempotent sur (symbol, timeframe, gap_start, gap_end)
    ///
    /// ALGORITHME:
    /// 1. Job non terminal identique → rehausse la priorité, renvoie son id
    /// 2. Job pending chevauchant → fusion (fenêtre élargie, priorité max)
    /// 3. Sinon insertion d'un nouveau job pending
    ///
    /// RETOUR: id du job (existant ou créé)
    pub fn enqueue(
        &self,
        symbol: &str,
        tf: Timeframe,
        gap_start: i64,
        gap_end: i64,
        priority: i64,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let exact: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, priority FROM backfill_queue
                 WHERE symbol = ?1 AND timeframe = ?2
                   AND gap_start = ?3 AND gap_end = ?4
                   AND status IN ('pending', 'processing')
                 LIMIT 1",
                params![symbol, tf.as_str(), gap_start, gap_end],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((id, existing_priority)) = exact {
            if priority > existing_priority {
                tx.execute(
                    "UPDATE backfill_queue SET priority = ?1 WHERE id = ?2",
                    params![priority, id],
                )?;
            }
            tx.commit()?;
            return Ok(id);
        }

        let overlapping: Option<i64> = tx
            .query_row(
                "SELECT id FROM backfill_queue
                 WHERE symbol = ?1 AND timeframe = ?2 AND status = 'pending'
                   AND gap_start <= ?4 AND gap_end >= ?3
                 LIMIT 1",
                params![symbol, tf.as_str(), gap_start, gap_end],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = overlapping {
            tx.execute(
                "UPDATE backfill_queue
                 SET gap_start = MIN(gap_start, ?1),
                     gap_end = MAX(gap_end, ?2),
                     priority = MAX(priority, ?3)
                 WHERE id = ?4",
                params![gap_start, gap_end, priority, id],
            )?;
            tx.commit()?;
            return Ok(id);
        }

        tx.execute(
            "INSERT INTO backfill_queue
             (symbol, timeframe, gap_start, gap_end, priority, status, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6)",
            params![symbol, tf.as_str(), gap_start, gap_end, priority, now_ms()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Loue le job prêt le plus prioritaire
    ///
    /// Atomique: sélection, passage en processing, pose du bail et
    /// incrément du compteur de tentatives dans la même transaction.
    pub fn lease_next(&self, worker_id: &str, lease_ttl_ms: i64) -> Result<Option<BackfillJob>> {
        let now = now_ms();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM backfill_queue
                 WHERE status = 'pending'
                   AND (not_before IS NULL OR not_before <= ?1)
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = id else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE backfill_queue
             SET status = 'processing',
                 leased_until = ?1,
                 attempts = attempts + 1,
                 not_before = NULL
             WHERE id = ?2",
            params![now + lease_ttl_ms, id],
        )?;

        let job = job_by_id(&tx, id)?.context("job loué introuvable")?;
        tx.commit()?;

        debug!(worker = worker_id, job = id, symbol = %job.symbol, "job loué");
        Ok(Some(job))
    }

    /// Marque un job comme terminé
    pub fn complete(&self, job_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backfill_queue
             SET status = 'completed', leased_until = NULL
             WHERE id = ?1",
            params![job_id],
        )?;
        Ok(())
    }

    /// Échec récupérable: re-file avec backoff tant que attempts < max,
    /// sinon le job passe failed
    pub fn fail(&self, job_id: i64, error: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let attempts: i64 = tx.query_row(
            "SELECT attempts FROM backfill_queue WHERE id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;

        if attempts < self.max_attempts {
            let delay = backoff_delay_ms(attempts);
            tx.execute(
                "UPDATE backfill_queue
                 SET status = 'pending',
                     leased_until = NULL,
                     not_before = ?1,
                     error_message = ?2
                 WHERE id = ?3",
                params![now_ms() + delay, error, job_id],
            )?;
            debug!(job = job_id, attempts, delay_ms = delay, "job re-filé");
        } else {
            tx.execute(
                "UPDATE backfill_queue
                 SET status = 'failed', leased_until = NULL, error_message = ?1
                 WHERE id = ?2",
                params![error, job_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Échec permanent: le job passe failed immédiatement
    pub fn fail_permanent(&self, job_id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backfill_queue
             SET status = 'failed', leased_until = NULL, error_message = ?1
             WHERE id = ?2",
            params![error, job_id],
        )?;
        Ok(())
    }

    /// Rend les baux expirés à l'état pending
    ///
    /// RETOUR: nombre de jobs récupérés
    pub fn reap(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let reclaimed = conn.execute(
            "UPDATE backfill_queue
             SET status = 'pending', leased_until = NULL
             WHERE status = 'processing' AND leased_until < ?1",
            params![now_ms()],
        )?;
        Ok(reclaimed)
    }

    /// Relit un job par id
    pub fn get(&self, job_id: i64) -> Result<Option<BackfillJob>> {
        let conn = self.conn.lock().unwrap();
        job_by_id(&conn, job_id)
    }

    /// Compteurs par statut
    pub fn status_counts(&self) -> Result<QueueCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM backfill_queue GROUP BY status")?;
        let mut rows = stmt.query([])?;

        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => counts.pending = count,
                Some(JobStatus::Processing) => counts.processing = count,
                Some(JobStatus::Completed) => counts.completed = count,
                Some(JobStatus::Failed) => counts.failed = count,
                None => {}
            }
        }

        Ok(counts)
    }

    /// Derniers jobs failed, pour les rapports opérateur
    pub fn recent_failures(&self, limit: i64) -> Result<Vec<BackfillJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM backfill_queue
             WHERE status = 'failed'
             ORDER BY created_at DESC
             LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![limit], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = job_by_id(&conn, id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

/// Délai de backoff plein jitter pour la n-ième tentative
fn backoff_delay_ms(attempt: i64) -> i64 {
    let shift = attempt.clamp(0, 16) as u32;
    let ceiling = BACKOFF_BASE_MS.saturating_mul(1_i64 << shift).min(BACKOFF_CAP_MS);
    rand::thread_rng().gen_range(0..=ceiling)
}

/// Charge un job complet par id
fn job_by_id(conn: &Connection, id: i64) -> Result<Option<BackfillJob>> {
    let row = conn
        .query_row(
            "SELECT id, symbol, timeframe, gap_start, gap_end, priority, status,
                    attempts, error_message, created_at, leased_until, not_before
             FROM backfill_queue WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, Option<i64>>(10)?,
                    row.get::<_, Option<i64>>(11)?,
                ))
            },
        )
        .optional()?;

    let Some((id, symbol, tf, gap_start, gap_end, priority, status, attempts, error, created, leased, not_before)) =
        row
    else {
        return Ok(None);
    };

    Ok(Some(BackfillJob {
        id,
        symbol,
        timeframe: Timeframe::parse(&tf)?,
        gap_start,
        gap_end,
        priority,
        status: JobStatus::parse(&status)
            .with_context(|| format!("statut de job inconnu: {}", status))?,
        attempts,
        error_message: error,
        created_at: created,
        leased_until: leased,
        not_before,
    }))
}
