use std::time::Duration;

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema,
};
use tracing::{info, instrument};

use crate::config::AppConfig;
use crate::entities;

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Establishes a connection pool from application configuration.
#[instrument(skip(config), fields(database_url = %config.database_url))]
pub async fn connect(config: &AppConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(config.database_url.clone());
    options
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(600))
        .sqlx_logging(false);

    let db = Database::connect(options).await?;
    info!("Database connection established");

    if config.auto_migrate {
        create_schema(&db).await?;
    }

    Ok(db)
}

/// Creates all tables from the entity definitions. Used by tests and by
/// sqlite development databases; production deployments run managed
/// migrations instead.
pub async fn create_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    macro_rules! create_table {
        ($entity:expr) => {{
            let mut stmt = schema.create_table_from_entity($entity);
            db.execute(builder.build(stmt.if_not_exists())).await?;
        }};
    }

    create_table!(entities::Product);
    create_table!(entities::Cart);
    create_table!(entities::CartItem);
    create_table!(entities::Order);
    create_table!(entities::OrderItem);
    create_table!(entities::OrderHistory);
    create_table!(entities::Coupon);
    create_table!(entities::CouponUsage);
    create_table!(entities::RefundRequest);
    create_table!(entities::RefundRequestItem);

    info!("Schema created from entity definitions");
    Ok(())
}
