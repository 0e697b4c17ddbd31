use sqlx::{Executor, PgPool};

const MIGRATIONS: &[(&str, &str)] = &[(
    "001_review_core",
    include_str!("../../sql/001_review_core.sql"),
)];

pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrationError> {
    tracing::info!("running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS "_migrations" (
            "id" SERIAL PRIMARY KEY,
            "name" TEXT NOT NULL UNIQUE,
            "applied_at" TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied: Vec<String> = sqlx::query_scalar(r#"SELECT "name" FROM "_migrations" ORDER BY "id""#)
        .fetch_all(pool)
        .await?;

    let mut applied_count = 0;

    for (name, sql) in MIGRATIONS {
        if applied.iter().any(|a| a == name) {
            tracing::debug!(migration = name, "already applied");
            continue;
        }

        tracing::info!(migration = name, "applying migration");

        // Unprepared execution lets one file carry several statements.
        pool.execute(*sql)
            .await
            .map_err(|e| MigrationError::Migration {
                name: name.to_string(),
                source: e,
            })?;

        sqlx::query(r#"INSERT INTO "_migrations" ("name") VALUES ($1)"#)
            .bind(*name)
            .execute(pool)
            .await?;

        applied_count += 1;
    }

    if applied_count > 0 {
        tracing::info!(count = applied_count, "database migrations completed");
    } else {
        tracing::info!("database schema is up to date");
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}
