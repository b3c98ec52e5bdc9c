//! Embedded schema migrations for users, sessions and API keys.

use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};

/// Migrations compiled in from `tr_core/migrations/`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Bring the schema up to date. Already-applied migrations are skipped.
pub async fn migrate(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_schema_is_embedded() {
        let first = MIGRATOR.iter().next().expect("at least one migration");
        assert_eq!(first.version, 1);
        assert!(first.sql.contains("CREATE TABLE IF NOT EXISTS users"));
        assert!(first.sql.contains("CREATE TABLE IF NOT EXISTS api_keys"));
    }
}
