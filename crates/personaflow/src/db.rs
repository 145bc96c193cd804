use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;

const APPLICATION_NAME: &str = "personaflow";

fn env_num<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

/// Pool for the job store and subject directory.
///
/// Watchers hold a connection only for the length of one row update, so a
/// small pool serves many concurrent jobs.
pub async fn make_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let max_connections = env_num::<u32>("PERSONAFLOW_DB_MAX_CONNECTIONS")
        .unwrap_or(4)
        .clamp(1, 32);
    let acquire_timeout_secs = env_num::<u64>("PERSONAFLOW_DB_ACQUIRE_TIMEOUT_SECS")
        .unwrap_or(10)
        .clamp(1, 60);
    // 0 leaves the server default in place
    let statement_timeout_ms = env_num::<u64>("PERSONAFLOW_DB_STATEMENT_TIMEOUT_MS").unwrap_or(0);
    let disable_jit = env_flag("PERSONAFLOW_DISABLE_JIT", true);

    let connect = PgConnectOptions::from_str(database_url)?.application_name(APPLICATION_NAME);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if disable_jit {
                    sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                }
                if statement_timeout_ms > 0 {
                    sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                        .execute(&mut *conn)
                        .await?;
                }
                Ok(())
            })
        })
        .connect_with(connect)
        .await?;

    tracing::debug!(
        max_connections,
        acquire_timeout_secs,
        statement_timeout_ms,
        disable_jit,
        "database pool ready"
    );
    Ok(pool)
}

/// Creates the `jobs` and `subjects` tables.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}
