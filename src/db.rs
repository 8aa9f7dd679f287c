use std::future::Future;
use std::time::Duration;

use sea_orm::sea_query::{IndexCreateStatement, TableCreateStatement};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, Schema,
};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::entities::{
    item, order, order_item, order_status_history, payment_detail, reservation, reservation_line,
};
use crate::errors::ServiceError;

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connections
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for database retry logic
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Determines if an error is retryable (transient)
pub fn is_retryable_error(err: &DbErr) -> bool {
    match err {
        DbErr::Conn(_) => true,
        DbErr::ConnectionAcquire(_) => true,
        DbErr::Query(runtime_err) => {
            let msg = runtime_err.to_string().to_lowercase();
            msg.contains("connection")
                || msg.contains("timeout")
                || msg.contains("broken pipe")
                || msg.contains("reset by peer")
                || msg.contains("deadlock")
                || msg.contains("database is locked")
        }
        _ => false,
    }
}

/// Execute a database operation with retry logic and exponential backoff
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T, DbErr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbErr>>,
{
    let mut attempts = 0;
    let mut delay = config.initial_delay;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    info!(
                        operation = %operation_name,
                        attempts = attempts,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if attempts >= config.max_retries || !is_retryable_error(&err) {
                    error!(
                        operation = %operation_name,
                        attempts = attempts,
                        error = %err,
                        "Database operation failed (non-retryable or max retries reached)"
                    );
                    return Err(err);
                }

                warn!(
                    operation = %operation_name,
                    attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable database error, backing off"
                );

                sleep(delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Establishes a connection pool to the database
pub async fn establish_connection(database_url: &str) -> Result<DbPool, ServiceError> {
    let config = DbConfig {
        url: database_url.to_string(),
        ..Default::default()
    };
    establish_connection_with_config(&config).await
}

/// Establishes a connection pool with custom configuration
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection: {:?}", config);

    // An in-memory SQLite database exists per connection; more than one
    // pooled connection would each see an empty schema.
    let in_memory_sqlite = config.url.contains(":memory:") || config.url.contains("mode=memory");
    let (max_connections, min_connections) = if in_memory_sqlite {
        (1, 1)
    } else {
        (config.max_connections, config.min_connections)
    };

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(max_connections)
        .min_connections(min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(false);

    let retry = RetryConfig::default();
    let pool = with_retry(&retry, "establish_connection", || {
        let opt = opt.clone();
        async move { Database::connect(opt).await }
    })
    .await
    .map_err(|e| {
        error!(error = %e, "Database connection establishment failed");
        ServiceError::db_error(e)
    })?;

    info!("Database connection pool established");
    Ok(pool)
}

/// Creates the item-store tables (items, reservations, reservation lines)
/// and their secondary indexes from the entity definitions when they do
/// not yet exist.
pub async fn ensure_item_store_schema(db: &DbPool) -> Result<(), ServiceError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let tables: Vec<(&'static str, TableCreateStatement)> = vec![
        ("items", schema.create_table_from_entity(item::Entity)),
        (
            "reservations",
            schema.create_table_from_entity(reservation::Entity),
        ),
        (
            "reservation_lines",
            schema.create_table_from_entity(reservation_line::Entity),
        ),
    ];
    create_tables(db, backend, tables).await?;

    let mut indexes = schema.create_index_from_entity(item::Entity);
    indexes.extend(schema.create_index_from_entity(reservation::Entity));
    indexes.extend(schema.create_index_from_entity(reservation_line::Entity));
    create_indexes(db, backend, indexes).await
}

/// Creates the order-store tables (orders, order items, status history,
/// payment details) from the entity definitions when they do not yet exist.
pub async fn ensure_order_store_schema(db: &DbPool) -> Result<(), ServiceError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let tables: Vec<(&'static str, TableCreateStatement)> = vec![
        ("orders", schema.create_table_from_entity(order::Entity)),
        (
            "order_items",
            schema.create_table_from_entity(order_item::Entity),
        ),
        (
            "order_status_history",
            schema.create_table_from_entity(order_status_history::Entity),
        ),
        (
            "payment_details",
            schema.create_table_from_entity(payment_detail::Entity),
        ),
    ];
    create_tables(db, backend, tables).await?;

    let mut indexes = schema.create_index_from_entity(order::Entity);
    indexes.extend(schema.create_index_from_entity(order_item::Entity));
    indexes.extend(schema.create_index_from_entity(order_status_history::Entity));
    indexes.extend(schema.create_index_from_entity(payment_detail::Entity));
    create_indexes(db, backend, indexes).await
}

async fn create_tables(
    db: &DbPool,
    backend: DbBackend,
    mut tables: Vec<(&'static str, TableCreateStatement)>,
) -> Result<(), ServiceError> {
    for (name, table) in tables.iter_mut() {
        table.if_not_exists();
        let statement = backend.build(&*table);
        if let Err(err) = db.execute(statement).await {
            warn!(table = *name, error = %err, "Failed to ensure table exists");
            return Err(ServiceError::db_error(err));
        }
    }
    Ok(())
}

async fn create_indexes(
    db: &DbPool,
    backend: DbBackend,
    mut indexes: Vec<IndexCreateStatement>,
) -> Result<(), ServiceError> {
    for index in indexes.iter_mut() {
        index.if_not_exists();
        let statement = backend.build(&*index);
        if let Err(err) = db.execute(statement).await {
            warn!(error = %err, "Failed to ensure index exists");
            return Err(ServiceError::db_error(err));
        }
    }
    Ok(())
}

/// Checks if the database connection is active
pub async fn check_connection(db: &DbPool) -> Result<(), ServiceError> {
    db.ping().await.map_err(ServiceError::db_error)
}
