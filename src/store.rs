/// Module de persistance SQLite
///
/// ARCHITECTURE:
/// Encapsule la connexion SQLite, initialise le schéma à l'ouverture et
/// expose les opérations sur les bougies, les ticks, les enregistrements
/// d'intégrité et les métriques de santé.
///
/// SQLite n'accepte qu'un écrivain à la fois: la connexion unique est
/// protégée par un Mutex et les handles se clonent à coût nul (Arc). Les
/// contextes asynchrones passent par `Store::with` qui délègue à
/// spawn_blocking. Chaque écriture de bougie est atomique; les lots sont
/// enveloppés dans une transaction.
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

use crate::models::{Candle, IntegrityRecord, IntegrityStatus, Tick};
use crate::timeframe::Timeframe;

/// Délai d'attente sur verrou SQLite (timeout magasin)
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Upsert d'une bougie avec fusion champ à champ en cas de conflit de clé:
/// open conservé, high élargi, low resserré, close écrasé, volumes sommés.
/// Exception: une bougie stockée dégénérée (OHLC identiques) est remplacée
/// intégralement par une bougie entrante pleinement formée.
const UPSERT_CANDLE_SQL: &str = "INSERT INTO market_data \
     (symbol, timeframe, timestamp, open, high, low, close, volume, spread) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
     ON CONFLICT(symbol, timeframe, timestamp) DO UPDATE SET \
         open = CASE WHEN market_data.open = market_data.high \
                      AND market_data.high = market_data.low \
                      AND market_data.low = market_data.close \
                      AND NOT (excluded.open = excluded.high \
                               AND excluded.high = excluded.low \
                               AND excluded.low = excluded.close) \
                THEN excluded.open ELSE market_data.open END, \
         high = CASE WHEN market_data.open = market_data.high \
                      AND market_data.high = market_data.low \
                      AND market_data.low = market_data.close \
                      AND NOT (excluded.open = excluded.high \
                               AND excluded.high = excluded.low \
                               AND excluded.low = excluded.close) \
                THEN excluded.high ELSE MAX(market_data.high, excluded.high) END, \
         low = CASE WHEN market_data.open = market_data.high \
                     AND market_data.high = market_data.low \
                     AND market_data.low = market_data.close \
                     AND NOT (excluded.open = excluded.high \
                              AND excluded.high = excluded.low \
                              AND excluded.low = excluded.close) \
                THEN excluded.low ELSE MIN(market_data.low, excluded.low) END, \
         close = excluded.close, \
         volume = CASE WHEN market_data.open = market_data.high \
                        AND market_data.high = market_data.low \
                        AND market_data.low = market_data.close \
                        AND NOT (excluded.open = excluded.high \
                                 AND excluded.high = excluded.low \
                                 AND excluded.low = excluded.close) \
                THEN excluded.volume ELSE market_data.volume + excluded.volume END, \
         spread = COALESCE(excluded.spread, market_data.spread)";

/// Réécriture autoritaire d'une bougie recalculée depuis sa source
/// (ticks pour M1, bougies M1 pour les timeframes dérivés)
const REPLACE_CANDLE_SQL: &str = "INSERT OR REPLACE INTO market_data \
     (symbol, timeframe, timestamp, open, high, low, close, volume, spread) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const DEGENERATE_WHERE: &str =
    "open = high AND high = low AND low = close";

/// Magasin de données du pipeline
///
/// Se clone à coût nul: tous les clones partagent la même connexion.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Ouvre (ou crée) le fichier de base et initialise le schéma
    pub fn open(db_file: &str) -> Result<Self> {
        let conn = Connection::open(Path::new(db_file))
            .with_context(|| format!("ouverture de la base {}", db_file))?;
        Self::prepare(conn)
    }

    /// Base en mémoire, pour les tests et les essais
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init_schema(&conn)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Initialise le schéma de la base de données
    fn init_schema(conn: &Connection) -> SqlResult<()> {
        // Table principale des bougies
        conn.execute(
            "CREATE TABLE IF NOT EXISTS market_data (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                spread REAL,
                PRIMARY KEY (symbol, timeframe, timestamp)
            )",
            [],
        )?;

        // Ticks bruts, insert-only, élagués par rétention
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ticks (
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                price REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (symbol, timestamp)
            )",
            [],
        )?;

        // File durable des jobs de backfill
        conn.execute(
            "CREATE TABLE IF NOT EXISTS backfill_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                gap_start INTEGER NOT NULL,
                gap_end INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                leased_until INTEGER,
                not_before INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_backfill_ready
             ON backfill_queue (status, priority DESC, created_at ASC)",
            [],
        )?;

        // Résultats des contrôles d'intégrité, une ligne par jour
        conn.execute(
            "CREATE TABLE IF NOT EXISTS data_integrity (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                date TEXT NOT NULL,
                expected_candles INTEGER NOT NULL,
                actual_candles INTEGER NOT NULL,
                missing_candles INTEGER NOT NULL,
                incomplete_candles INTEGER NOT NULL,
                last_checked INTEGER NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (symbol, timeframe, date)
            )",
            [],
        )?;

        // Série append-only des métriques de santé
        conn.execute(
            "CREATE TABLE IF NOT EXISTS health_metrics (
                metric_name TEXT NOT NULL,
                metric_value REAL NOT NULL,
                symbol TEXT,
                timeframe TEXT,
                recorded_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_health_metrics_time
             ON health_metrics (recorded_at)",
            [],
        )?;

        Ok(())
    }

    /// Partage de la connexion avec les composants du même fichier de base
    /// (la file de backfill vit dans le même schéma)
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Exécute une opération bloquante depuis un contexte asynchrone
    pub async fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    // ------------------------------------------------------------------
    // Bougies
    // ------------------------------------------------------------------

    /// Upsert idempotent d'une bougie (fusion en cas de conflit)
    pub fn upsert_candle(&self, symbol: &str, tf: Timeframe, candle: &Candle) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            UPSERT_CANDLE_SQL,
            params![
                symbol,
                tf.as_str(),
                candle.timestamp,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
                candle.spread,
            ],
        )?;
        Ok(())
    }

    /// Upsert d'un lot de bougies dans une transaction unique
    ///
    /// RETOUR: nombre de bougies écrites
    pub fn upsert_candles(&self, symbol: &str, tf: Timeframe, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_CANDLE_SQL)?;
            for candle in candles {
                stmt.execute(params![
                    symbol,
                    tf.as_str(),
                    candle.timestamp,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    candle.spread,
                ])?;
            }
        }
        tx.commit()?;
        Ok(candles.len())
    }

    /// Réécrit une bougie recalculée depuis sa source (écriture autoritaire,
    /// donc rejouable à l'identique)
    pub fn replace_candle(&self, symbol: &str, tf: Timeframe, candle: &Candle) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            REPLACE_CANDLE_SQL,
            params![
                symbol,
                tf.as_str(),
                candle.timestamp,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
                candle.spread,
            ],
        )?;
        Ok(())
    }

    /// Variante lot de `replace_candle`
    pub fn replace_candles(&self, symbol: &str, tf: Timeframe, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(REPLACE_CANDLE_SQL)?;
            for candle in candles {
                stmt.execute(params![
                    symbol,
                    tf.as_str(),
                    candle.timestamp,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    candle.spread,
                ])?;
            }
        }
        tx.commit()?;
        Ok(candles.len())
    }

    /// Bougies de la plage [from, to), triées par timestamp croissant
    pub fn read_range(
        &self,
        symbol: &str,
        tf: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp, open, high, low, close, volume, spread
             FROM market_data
             WHERE symbol = ?1 AND timeframe = ?2
               AND timestamp >= ?3 AND timestamp < ?4
             ORDER BY timestamp ASC",
        )?;

        let candles = stmt
            .query_map(params![symbol, tf.as_str(), from_ms, to_ms], candle_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(candles)
    }

    /// Timestamps seuls de la plage [from, to), triés croissants
    pub fn candle_timestamps(
        &self,
        symbol: &str,
        tf: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp FROM market_data
             WHERE symbol = ?1 AND timeframe = ?2
               AND timestamp >= ?3 AND timestamp < ?4
             ORDER BY timestamp ASC",
        )?;

        let timestamps = stmt
            .query_map(params![symbol, tf.as_str(), from_ms, to_ms], |row| {
                row.get(0)
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(timestamps)
    }

    /// Nombre de bougies dans [from, to)
    pub fn candle_count(&self, symbol: &str, tf: Timeframe, from_ms: i64, to_ms: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM market_data
             WHERE symbol = ?1 AND timeframe = ?2
               AND timestamp >= ?3 AND timestamp < ?4",
            params![symbol, tf.as_str(), from_ms, to_ms],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Timestamp de la dernière bougie stockée
    pub fn latest_timestamp(&self, symbol: &str, tf: Timeframe) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let latest = conn.query_row(
            "SELECT MAX(timestamp) FROM market_data
             WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol, tf.as_str()],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    /// Bougies dégénérées (OHLC identiques) de la plage [from, to)
    pub fn find_degenerate(
        &self,
        symbol: &str,
        tf: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT timestamp, open, high, low, close, volume, spread
             FROM market_data
             WHERE symbol = ?1 AND timeframe = ?2
               AND timestamp >= ?3 AND timestamp < ?4
               AND {DEGENERATE_WHERE}
             ORDER BY timestamp ASC"
        );
        let mut stmt = conn.prepare(&sql)?;

        let candles = stmt
            .query_map(params![symbol, tf.as_str(), from_ms, to_ms], candle_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(candles)
    }

    /// Symboles présents dans le magasin
    pub fn distinct_symbols(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT symbol FROM market_data ORDER BY symbol")?;
        let symbols = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(symbols)
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    /// Insère un lot de ticks (les doublons de clé sont ignorés)
    ///
    /// RETOUR: nombre de ticks réellement insérés
    pub fn insert_ticks(&self, ticks: &[Tick]) -> Result<usize> {
        if ticks.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO ticks (symbol, timestamp, price, volume)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for tick in ticks {
                let changes =
                    stmt.execute(params![tick.symbol, tick.timestamp, tick.price, tick.volume])?;
                if changes > 0 {
                    inserted += 1;
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Ticks de la plage [from, to), triés par timestamp croissant
    pub fn read_ticks(&self, symbol: &str, from_ms: i64, to_ms: i64) -> Result<Vec<Tick>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT symbol, timestamp, price, volume FROM ticks
             WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp < ?3
             ORDER BY timestamp ASC",
        )?;

        let ticks = stmt
            .query_map(params![symbol, from_ms, to_ms], |row| {
                Ok(Tick {
                    symbol: row.get(0)?,
                    timestamp: row.get(1)?,
                    price: row.get(2)?,
                    volume: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(ticks)
    }

    /// Nombre de ticks reçus depuis `since_ms`
    pub fn tick_count_since(&self, symbol: &str, since_ms: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM ticks WHERE symbol = ?1 AND timestamp >= ?2",
            params![symbol, since_ms],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Élague les ticks antérieurs à `older_than_ms` (politique de rétention)
    pub fn prune_ticks(&self, older_than_ms: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM ticks WHERE timestamp < ?1", params![older_than_ms])?;
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Intégrité et métriques
    // ------------------------------------------------------------------

    /// Écrit (ou remplace) l'enregistrement d'intégrité du jour
    pub fn upsert_integrity(&self, record: &IntegrityRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO data_integrity
             (symbol, timeframe, date, expected_candles, actual_candles,
              missing_candles, incomplete_candles, last_checked, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.symbol,
                record.timeframe.as_str(),
                record.date.to_string(),
                record.expected_candles,
                record.actual_candles,
                record.missing_candles,
                record.incomplete_candles,
                record.last_checked,
                record.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Relit un enregistrement d'intégrité
    pub fn read_integrity(
        &self,
        symbol: &str,
        tf: Timeframe,
        date: NaiveDate,
    ) -> Result<Option<IntegrityRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT expected_candles, actual_candles, missing_candles,
                        incomplete_candles, last_checked, status
                 FROM data_integrity
                 WHERE symbol = ?1 AND timeframe = ?2 AND date = ?3",
                params![symbol, tf.as_str(), date.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((expected, actual, missing, incomplete, last_checked, status)) = row else {
            return Ok(None);
        };

        Ok(Some(IntegrityRecord {
            symbol: symbol.to_string(),
            timeframe: tf,
            date,
            expected_candles: expected,
            actual_candles: actual,
            missing_candles: missing,
            incomplete_candles: incomplete,
            last_checked,
            status: IntegrityStatus::parse(&status)
                .with_context(|| format!("statut d'intégrité inconnu: {}", status))?,
        }))
    }

    /// Ajoute une métrique de santé à la série append-only
    pub fn record_metric(
        &self,
        name: &str,
        value: f64,
        symbol: Option<&str>,
        tf: Option<Timeframe>,
        recorded_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO health_metrics (metric_name, metric_value, symbol, timeframe, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, value, symbol, tf.map(Timeframe::as_str), recorded_at],
        )?;
        Ok(())
    }
}

/// Mappe une ligne (timestamp, o, h, l, c, volume, spread) vers une bougie
fn candle_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Candle> {
    Ok(Candle {
        timestamp: row.get(0)?,
        open: row.get(1)?,
        high: row.get(2)?,
        low: row.get(3)?,
        close: row.get(4)?,
        volume: row.get(5)?,
        spread: row.get(6)?,
    })
}
