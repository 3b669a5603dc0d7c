use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::models::{
    Driver, DriverBreakdown, DriverScore, Enrichment, EnrichmentUpdate, Gamification,
    IngestRecord, Premium, PremiumBreakdown, RescoreRecord, Trip, TripBreakdown, TripScore,
    TripSummary,
};
use crate::store::TelematicsStore;

const TRIP_COLUMNS: &str = "id, seq, driver_id, start_ts, end_ts, distance_km, avg_speed, \
     max_speed, harsh_brakes, night_ratio, speeding_events, centroid_lat, centroid_lon";

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn to_db_count(value: u32, field: &str) -> anyhow::Result<i32> {
    i32::try_from(value).with_context(|| format!("{field} out of range: {value}"))
}

fn from_db_count(row: &PgRow, field: &str) -> anyhow::Result<u32> {
    let value: i32 = row.try_get(field)?;
    u32::try_from(value).with_context(|| format!("negative {field} in database: {value}"))
}

fn trip_from_row(row: &PgRow) -> anyhow::Result<Trip> {
    Ok(Trip {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        summary: TripSummary {
            driver_id: row.try_get("driver_id")?,
            start_ts: row.try_get("start_ts")?,
            end_ts: row.try_get("end_ts")?,
            distance_km: row.try_get("distance_km")?,
            avg_speed: row.try_get("avg_speed")?,
            max_speed: row.try_get("max_speed")?,
            harsh_brakes: from_db_count(row, "harsh_brakes")?,
            night_ratio: row.try_get("night_ratio")?,
            speeding_events: from_db_count(row, "speeding_events")?,
            centroid_lat: row.try_get("centroid_lat")?,
            centroid_lon: row.try_get("centroid_lon")?,
        },
    })
}

fn enrichment_from_row(row: &PgRow) -> anyhow::Result<Enrichment> {
    Ok(Enrichment {
        vehicle_risk: row.try_get("vehicle_risk")?,
        driver_history_risk: row.try_get("driver_history_risk")?,
        local_crime_index: row.try_get("local_crime_index")?,
        local_crash_rate: row.try_get("local_crash_rate")?,
        weather_risk: row.try_get("weather_risk")?,
    })
}

async fn write_rescore(conn: &mut PgConnection, record: &RescoreRecord) -> anyhow::Result<()> {
    let score = &record.driver_score;
    sqlx::query(
        r#"
        INSERT INTO telematics.driver_scores (driver_id, score, breakdown, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (driver_id) DO UPDATE
        SET score = EXCLUDED.score, breakdown = EXCLUDED.breakdown, updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&score.driver_id)
    .bind(score.score)
    .bind(Json(&score.breakdown))
    .bind(score.updated_at)
    .execute(&mut *conn)
    .await?;

    let premium = &record.premium;
    sqlx::query(
        r#"
        INSERT INTO telematics.premiums (driver_id, monthly_premium, breakdown, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (driver_id) DO UPDATE
        SET monthly_premium = EXCLUDED.monthly_premium,
            breakdown = EXCLUDED.breakdown,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&premium.driver_id)
    .bind(premium.monthly_premium)
    .bind(Json(&premium.breakdown))
    .bind(premium.updated_at)
    .execute(&mut *conn)
    .await?;

    let game = &record.gamification;
    sqlx::query(
        r#"
        INSERT INTO telematics.gamification (driver_id, safe_streak_days, last_safe_date, points)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (driver_id) DO UPDATE
        SET safe_streak_days = EXCLUDED.safe_streak_days,
            last_safe_date = EXCLUDED.last_safe_date,
            points = EXCLUDED.points
        "#,
    )
    .bind(&score.driver_id)
    .bind(to_db_count(game.safe_streak_days, "safe_streak_days")?)
    .bind(game.last_safe_date)
    .bind(to_db_count(game.points, "points")?)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Postgres-backed store over the `telematics` schema.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TelematicsStore for PgStore {
    async fn get_driver(&self, driver_id: &str) -> anyhow::Result<Option<Driver>> {
        let row = sqlx::query(
            "SELECT id, name, base_rate, vehicle FROM telematics.drivers WHERE id = $1",
        )
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Driver {
            id: row.get("id"),
            name: row.get("name"),
            base_rate: row.get("base_rate"),
            vehicle: row.get("vehicle"),
        }))
    }

    async fn ensure_driver(&self, driver: &Driver) -> anyhow::Result<Driver> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO telematics.drivers (id, name, base_rate, vehicle)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&driver.id)
        .bind(&driver.name)
        .bind(driver.base_rate)
        .bind(&driver.vehicle)
        .execute(&mut *tx)
        .await?;

        for table in ["enrichment", "gamification"] {
            sqlx::query(&format!(
                "INSERT INTO telematics.{table} (driver_id) VALUES ($1) ON CONFLICT (driver_id) DO NOTHING"
            ))
            .bind(&driver.id)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(
            "SELECT id, name, base_rate, vehicle FROM telematics.drivers WHERE id = $1",
        )
        .bind(&driver.id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Driver {
            id: row.get("id"),
            name: row.get("name"),
            base_rate: row.get("base_rate"),
            vehicle: row.get("vehicle"),
        })
    }

    async fn recent_trips(&self, driver_id: &str, limit: usize) -> anyhow::Result<Vec<Trip>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRIP_COLUMNS} FROM telematics.trips WHERE driver_id = $1 \
             ORDER BY seq DESC LIMIT $2"
        ))
        .bind(driver_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trip_from_row).collect()
    }

    async fn trips_by_start(&self, driver_id: &str, limit: usize) -> anyhow::Result<Vec<Trip>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRIP_COLUMNS} FROM telematics.trips WHERE driver_id = $1 \
             ORDER BY start_ts DESC, seq DESC LIMIT $2"
        ))
        .bind(driver_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trip_from_row).collect()
    }

    async fn trip_score(&self, trip_id: Uuid) -> anyhow::Result<Option<TripScore>> {
        let row = sqlx::query(
            "SELECT score, breakdown FROM telematics.trip_scores WHERE trip_id = $1",
        )
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> anyhow::Result<TripScore> {
            let Json(breakdown): Json<TripBreakdown> = row.try_get("breakdown")?;
            Ok(TripScore {
                score: row.try_get("score")?,
                breakdown,
            })
        })
        .transpose()
    }

    async fn enrichment(&self, driver_id: &str) -> anyhow::Result<Enrichment> {
        let row = sqlx::query(
            r#"
            SELECT vehicle_risk, driver_history_risk, local_crime_index, local_crash_rate, weather_risk
            FROM telematics.enrichment
            WHERE driver_id = $1
            "#,
        )
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => enrichment_from_row(&row),
            None => Ok(Enrichment::default()),
        }
    }

    async fn update_enrichment(
        &self,
        driver_id: &str,
        update: &EnrichmentUpdate,
    ) -> anyhow::Result<Enrichment> {
        let row = sqlx::query(
            r#"
            INSERT INTO telematics.enrichment
            (driver_id, vehicle_risk, driver_history_risk, local_crime_index, local_crash_rate, weather_risk)
            VALUES ($1, COALESCE($2::float8, 0), COALESCE($3::float8, 0), COALESCE($4::float8, 0),
                    COALESCE($5::float8, 0), COALESCE($6::float8, 0))
            ON CONFLICT (driver_id) DO UPDATE
            SET vehicle_risk = COALESCE($2::float8, telematics.enrichment.vehicle_risk),
                driver_history_risk = COALESCE($3::float8, telematics.enrichment.driver_history_risk),
                local_crime_index = COALESCE($4::float8, telematics.enrichment.local_crime_index),
                local_crash_rate = COALESCE($5::float8, telematics.enrichment.local_crash_rate),
                weather_risk = COALESCE($6::float8, telematics.enrichment.weather_risk),
                updated_at = now()
            RETURNING vehicle_risk, driver_history_risk, local_crime_index, local_crash_rate, weather_risk
            "#,
        )
        .bind(driver_id)
        .bind(update.vehicle_risk)
        .bind(update.driver_history_risk)
        .bind(update.local_crime_index)
        .bind(update.local_crash_rate)
        .bind(update.weather_risk)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to update enrichment for {driver_id}"))?;

        enrichment_from_row(&row)
    }

    async fn gamification(&self, driver_id: &str) -> anyhow::Result<Gamification> {
        let row = sqlx::query(
            "SELECT safe_streak_days, last_safe_date, points FROM telematics.gamification WHERE driver_id = $1",
        )
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Gamification {
                safe_streak_days: from_db_count(&row, "safe_streak_days")?,
                last_safe_date: row.try_get("last_safe_date")?,
                points: from_db_count(&row, "points")?,
            }),
            None => Ok(Gamification::default()),
        }
    }

    async fn driver_score(&self, driver_id: &str) -> anyhow::Result<Option<DriverScore>> {
        let row = sqlx::query(
            "SELECT driver_id, score, breakdown, updated_at FROM telematics.driver_scores WHERE driver_id = $1",
        )
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(driver_score_from_row).transpose()
    }

    async fn premium(&self, driver_id: &str) -> anyhow::Result<Option<Premium>> {
        let row = sqlx::query(
            "SELECT monthly_premium, breakdown, updated_at FROM telematics.premiums WHERE driver_id = $1",
        )
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> anyhow::Result<Premium> {
            let Json(breakdown): Json<PremiumBreakdown> = row.try_get("breakdown")?;
            Ok(Premium {
                driver_id: driver_id.to_string(),
                monthly_premium: row.try_get("monthly_premium")?,
                breakdown,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn top_driver_scores(&self, limit: usize) -> anyhow::Result<Vec<DriverScore>> {
        let rows = sqlx::query(
            r#"
            SELECT driver_id, score, breakdown, updated_at
            FROM telematics.driver_scores
            ORDER BY score DESC, driver_id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(driver_score_from_row).collect()
    }

    async fn record_ingest(&self, record: &IngestRecord) -> anyhow::Result<Option<Trip>> {
        let mut tx = self.pool.begin().await?;
        let trip = &record.summary;

        let seq: Option<i64> = sqlx::query(
            r#"
            INSERT INTO telematics.trips
            (id, driver_id, start_ts, end_ts, distance_km, avg_speed, max_speed, harsh_brakes,
             night_ratio, speeding_events, centroid_lat, centroid_lon, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (source_key) DO NOTHING
            RETURNING seq
            "#,
        )
        .bind(record.trip_id)
        .bind(&trip.driver_id)
        .bind(trip.start_ts)
        .bind(trip.end_ts)
        .bind(trip.distance_km)
        .bind(trip.avg_speed)
        .bind(trip.max_speed)
        .bind(to_db_count(trip.harsh_brakes, "harsh_brakes")?)
        .bind(trip.night_ratio)
        .bind(to_db_count(trip.speeding_events, "speeding_events")?)
        .bind(trip.centroid_lat)
        .bind(trip.centroid_lon)
        .bind(record.source_key.as_deref())
        .fetch_optional(&mut *tx)
        .await
        .context("failed to insert trip")?
        .map(|row| row.get("seq"));

        let Some(seq) = seq else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            "INSERT INTO telematics.trip_scores (trip_id, score, breakdown) VALUES ($1, $2, $3)",
        )
        .bind(record.trip_id)
        .bind(record.trip_score.score)
        .bind(Json(&record.trip_score.breakdown))
        .execute(&mut *tx)
        .await?;

        write_rescore(&mut *tx, &record.rescored).await?;
        tx.commit().await?;

        Ok(Some(Trip {
            id: record.trip_id,
            seq,
            summary: trip.clone(),
        }))
    }

    async fn record_rescore(&self, record: &RescoreRecord) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        write_rescore(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn driver_score_from_row(row: &PgRow) -> anyhow::Result<DriverScore> {
    let Json(breakdown): Json<DriverBreakdown> = row.try_get("breakdown")?;
    Ok(DriverScore {
        driver_id: row.try_get("driver_id")?,
        score: row.try_get("score")?,
        breakdown,
        updated_at: row.try_get("updated_at")?,
    })
}
