/// Module de construction des bougies
///
/// Deux responsabilités:
/// - construire les bougies M1 depuis les ticks bruts
/// - agréger les timeframes supérieurs depuis la base M1
///
/// Les recalculs partent toujours de la source (ticks ou M1) et réécrivent
/// le créneau entier: rejouer une reconstruction donne octet pour octet le
/// même contenu en base. Les minutes sans tick et les créneaux sans M1 ne
/// produisent rien, le trou reste visible pour le détecteur de gaps.
use anyhow::Result;

use crate::models::{Candle, Tick};
use crate::store::Store;
use crate::timeframe::Timeframe;

/// Constructeur de bougies, M1 depuis les ticks puis dérivés depuis M1
#[derive(Clone)]
pub struct CandleBuilder {
    store: Store,
}

impl CandleBuilder {
    pub fn new(store: Store) -> Self {
        CandleBuilder { store }
    }

    /// Exécute une opération bloquante depuis un contexte asynchrone
    pub async fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&CandleBuilder) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let builder = self.clone();
        Ok(tokio::task::spawn_blocking(move || f(&builder)).await??)
    }

    /// Construit les bougies M1 de la plage [from, to) depuis les ticks
    ///
    /// ALGORITHME:
    /// 1. Lit les ticks triés de la plage
    /// 2. Les partitionne par minute alignée
    /// 3. Pour chaque minute avec au moins un tick:
    ///    open = premier prix, high = max, low = min, close = dernier,
    ///    volume = somme
    ///
    /// RETOUR: nombre de bougies écrites
    pub fn build_m1_from_ticks(&self, symbol: &str, from_ms: i64, to_ms: i64) -> Result<usize> {
        let ticks = self.store.read_ticks(symbol, from_ms, to_ms)?;
        if ticks.is_empty() {
            return Ok(0);
        }

        let candles = partition_into_minutes(&ticks);
        self.store.replace_candles(symbol, Timeframe::M1, &candles)
    }

    /// Recalcule la bougie d'un créneau dérivé depuis les M1 qu'il couvre
    ///
    /// RETOUR: true si une bougie a été écrite, false si le créneau est
    /// vide (marché fermé ou trou: rien à écrire, pas une erreur)
    pub fn rebuild_candle(&self, symbol: &str, tf: Timeframe, bucket_start: i64) -> Result<bool> {
        let bucket_start = tf.align_ms(bucket_start);
        let m1 = self.store.read_range(
            symbol,
            Timeframe::M1,
            bucket_start,
            bucket_start + tf.duration_ms(),
        )?;

        let Some(candle) = aggregate_m1(bucket_start, &m1) else {
            return Ok(false);
        };

        self.store.replace_candle(symbol, tf, &candle)?;
        Ok(true)
    }

    /// Recalcule tous les timeframes dérivés dont un créneau intersecte
    /// [from, to), en ordre croissant M5 → D1
    ///
    /// RETOUR: nombre de bougies écrites
    pub fn rebuild_higher_timeframes(&self, symbol: &str, from_ms: i64, to_ms: i64) -> Result<usize> {
        self.rebuild_above(symbol, Timeframe::M1, from_ms, to_ms)
    }

    /// Recalcule les timeframes strictement supérieurs à `above` sur la plage
    pub fn rebuild_above(
        &self,
        symbol: &str,
        above: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<usize> {
        let mut written = 0usize;

        for tf in above.higher() {
            let mut bucket = tf.align_ms(from_ms);
            while bucket < to_ms {
                if self.rebuild_candle(symbol, tf, bucket)? {
                    written += 1;
                }
                bucket += tf.duration_ms();
            }
        }

        Ok(written)
    }

    /// Reconstruit un timeframe sur une plage: M1 depuis les ticks, les
    /// dérivés depuis M1 (commande opérateur `rebuild`)
    pub fn rebuild_range(&self, symbol: &str, tf: Timeframe, from_ms: i64, to_ms: i64) -> Result<usize> {
        if tf == Timeframe::M1 {
            return self.build_m1_from_ticks(symbol, from_ms, to_ms);
        }

        let mut written = 0usize;
        let mut bucket = tf.align_ms(from_ms);
        while bucket < to_ms {
            if self.rebuild_candle(symbol, tf, bucket)? {
                written += 1;
            }
            bucket += tf.duration_ms();
        }
        Ok(written)
    }
}

/// Partitionne des ticks triés en bougies M1
fn partition_into_minutes(ticks: &[Tick]) -> Vec<Candle> {
    let mut candles: Vec<Candle> = Vec::new();

    for tick in ticks {
        let minute = Timeframe::M1.align_ms(tick.timestamp);

        match candles.last_mut() {
            Some(candle) if candle.timestamp == minute => {
                candle.high = candle.high.max(tick.price);
                candle.low = candle.low.min(tick.price);
                candle.close = tick.price;
                candle.volume += tick.volume;
            }
            _ => candles.push(Candle {
                timestamp: minute,
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume: tick.volume,
                spread: None,
            }),
        }
    }

    candles
}

/// Agrège des bougies M1 triées en une bougie du créneau `bucket_start`
fn aggregate_m1(bucket_start: i64, m1: &[Candle]) -> Option<Candle> {
    let first = m1.first()?;
    let last = m1.last()?;

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    for candle in m1 {
        high = high.max(candle.high);
        low = low.min(candle.low);
        volume += candle.volume;
    }

    Some(Candle {
        timestamp: bucket_start,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
        spread: None,
    })
}
