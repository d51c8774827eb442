use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{GlobalAlarmConfig, SensorBatch};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Persistence used by the storage writer and the alarm endpoints.
pub trait Storage: Send + Sync + 'static {
    /// Persists samples, one group per sensor.
    fn save_batch(&self, batches: &[SensorBatch]) -> impl Future<Output = Result<()>> + Send;

    fn save_alarm_config(
        &self,
        mac: &str,
        config: &GlobalAlarmConfig,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_alarm_config(
        &self,
        mac: &str,
    ) -> impl Future<Output = Result<Option<GlobalAlarmConfig>>> + Send;
}

/// TimescaleDB-backed storage with one hypertable per sensor.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
    known_tables: Arc<DashSet<String>>,
}

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

impl PgStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let storage = Self {
            pool: make_pool(database_url).await?,
            known_tables: Arc::new(DashSet::new()),
        };
        storage.load_existing_tables().await;
        Ok(storage)
    }

    async fn load_existing_tables(&self) {
        let tables = sqlx::query_scalar::<_, String>(
            "SELECT table_name::text FROM information_schema.tables WHERE table_schema = 'public'",
        )
        .fetch_all(&self.pool)
        .await;

        match tables {
            Ok(tables) => {
                info!("Found {} existing tables", tables.len());
                for table in tables {
                    self.known_tables.insert(table);
                }
            }
            Err(e) => warn!("Failed to load existing tables: {}", e),
        }
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        if self.known_tables.contains(table) {
            return Ok(());
        }

        let create = format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                time TIMESTAMPTZ NOT NULL,
                acc_x DOUBLE PRECISION NULL,
                acc_y DOUBLE PRECISION NULL,
                acc_z DOUBLE PRECISION NULL
            )"#,
            table
        );
        sqlx::query(&create).execute(&self.pool).await?;

        let hypertable = format!(
            r#"SELECT create_hypertable('"{}"', 'time', if_not_exists => TRUE, migrate_data => TRUE)"#,
            table
        );
        if let Err(e) = sqlx::query(&hypertable).execute(&self.pool).await {
            warn!("Table {} stays a plain table, hypertable creation failed: {}", table, e);
        }

        info!("Created sensor table {}", table);
        self.known_tables.insert(table.to_string());
        Ok(())
    }

    async fn insert_samples(&self, table: &str, batch: &SensorBatch) -> Result<()> {
        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match self.insert_samples_inner(table, batch).await {
                Ok(()) => return Ok(()),
                Err(e) => match &e {
                    Error::Database(db_err) => {
                        if attempts >= max_attempts || !is_transient_error(db_err) {
                            error!(
                                "Database insert into {} failed permanently after {} attempts: {}",
                                table, attempts, e
                            );
                            return Err(e);
                        }

                        let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                        warn!(
                            "Database insert failed (attempt {}/{}), retrying in {}ms: {}",
                            attempts, max_attempts, wait_ms, db_err
                        );
                        DB_FAILURES_TOTAL.inc();
                        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    }
                    _ => {
                        error!("Database insert failed with non-database error: {}", e);
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn insert_samples_inner(&self, table: &str, batch: &SensorBatch) -> Result<()> {
        let times: Vec<DateTime<Utc>> = batch.samples.iter().map(|s| s.time).collect();
        let xs: Vec<f64> = batch.samples.iter().map(|s| s.x).collect();
        let ys: Vec<f64> = batch.samples.iter().map(|s| s.y).collect();
        let zs: Vec<f64> = batch.samples.iter().map(|s| s.z).collect();

        let query = format!(
            r#"INSERT INTO "{}" (time, acc_x, acc_y, acc_z)
               SELECT * FROM UNNEST($1::timestamptz[], $2::float8[], $3::float8[], $4::float8[])"#,
            table
        );

        sqlx::query(&query)
            .bind(&times)
            .bind(&xs)
            .bind(&ys)
            .bind(&zs)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

impl Storage for PgStorage {
    async fn save_batch(&self, batches: &[SensorBatch]) -> Result<()> {
        let mut last_error = None;

        for batch in batches {
            let Some(table) = sensor_table_name(&batch.sensor) else {
                warn!("Skipping samples for unusable sensor id {:?}", batch.sensor);
                continue;
            };
            if batch.samples.is_empty() {
                continue;
            }

            let result = match self.ensure_table(&table).await {
                Ok(()) => self.insert_samples(&table, batch).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!("Stored {} samples in {}", batch.samples.len(), table),
                Err(e) => {
                    error!("Failed to store samples of sensor {}: {}", batch.sensor, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn save_alarm_config(&self, mac: &str, config: &GlobalAlarmConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        sqlx::query(
            r#"INSERT INTO alarm_configs (mac_address, config, updated_at)
               VALUES ($1, $2::jsonb, NOW())
               ON CONFLICT (mac_address)
               DO UPDATE SET config = EXCLUDED.config, updated_at = NOW()"#,
        )
        .bind(mac)
        .bind(json)
        .execute(&self.pool)
        .await?;

        info!("Alarm configuration saved for sensor {}", mac);
        Ok(())
    }

    async fn get_alarm_config(&self, mac: &str) -> Result<Option<GlobalAlarmConfig>> {
        let row = sqlx::query_scalar::<_, String>(
            "SELECT config::text FROM alarm_configs WHERE mac_address = $1",
        )
        .bind(mac)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// `sensor_` followed by the MAC restricted to `[A-Za-z0-9_]`, or `None` if nothing is left.
pub fn sensor_table_name(mac: &str) -> Option<String> {
    let cleaned: String = mac
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(format!("sensor_{}", cleaned.to_ascii_lowercase()))
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

/// In-memory storage for tests.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct MemoryStorage {
        pub batches: Mutex<Vec<Vec<SensorBatch>>>,
        pub alarms: Mutex<HashMap<String, GlobalAlarmConfig>>,
        pub fail: AtomicBool,
    }

    impl MemoryStorage {
        pub fn failing() -> Self {
            let storage = Self::default();
            storage.fail.store(true, Ordering::SeqCst);
            storage
        }

        fn check(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Database(sqlx::Error::PoolClosed))
            } else {
                Ok(())
            }
        }
    }

    impl Storage for MemoryStorage {
        async fn save_batch(&self, batches: &[SensorBatch]) -> Result<()> {
            self.check()?;
            self.batches.lock().unwrap().push(batches.to_vec());
            Ok(())
        }

        async fn save_alarm_config(&self, mac: &str, config: &GlobalAlarmConfig) -> Result<()> {
            self.check()?;
            self.alarms
                .lock()
                .unwrap()
                .insert(mac.to_string(), config.clone());
            Ok(())
        }

        async fn get_alarm_config(&self, mac: &str) -> Result<Option<GlobalAlarmConfig>> {
            self.check()?;
            Ok(self.alarms.lock().unwrap().get(mac).cloned())
        }
    }
}
