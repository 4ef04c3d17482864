//! Row-lock helpers shared by checkout and order cancellation.
//!
//! Postgres honours `SELECT ... FOR UPDATE` and `lock_timeout`. SQLite ignores
//! both and serializes writers on the database file instead, so the helpers
//! here degrade to no-ops there.

use sea_orm::{ConnectionTrait, DbBackend, DbErr, RuntimeErr};
use std::time::Duration;

const CONTENTION_MARKERS: [&str; 5] = [
    "lock timeout",
    "could not obtain lock",
    "deadlock detected",
    "database is locked",
    "could not serialize access",
];

/// Bounds how long statements in the current transaction wait on row locks.
///
/// Must run inside a transaction; `SET LOCAL` expires with it.
pub async fn set_lock_timeout<C>(conn: &C, timeout: Duration) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    if conn.get_database_backend() != DbBackend::Postgres {
        return Ok(());
    }
    let millis = timeout.as_millis().max(1);
    conn.execute_unprepared(&format!("SET LOCAL lock_timeout = '{}ms'", millis))
        .await?;
    Ok(())
}

/// True when `err` means another transaction held what we needed.
pub fn is_lock_contention(err: &DbErr) -> bool {
    if let DbErr::ConnectionAcquire(_) = err {
        return true;
    }
    let message = match err {
        DbErr::Exec(RuntimeErr::SqlxError(e)) | DbErr::Query(RuntimeErr::SqlxError(e)) => {
            e.to_string()
        }
        other => other.to_string(),
    }
    .to_ascii_lowercase();
    CONTENTION_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{error::ConnAcquireErr, MockDatabase, MockExecResult};

    #[test]
    fn recognises_postgres_lock_timeout() {
        let err = DbErr::Custom("ERROR: canceling statement due to lock timeout".into());
        assert!(is_lock_contention(&err));
    }

    #[test]
    fn recognises_sqlite_busy() {
        let err = DbErr::Custom("database is locked".into());
        assert!(is_lock_contention(&err));
    }

    #[test]
    fn pool_exhaustion_counts_as_contention() {
        assert!(is_lock_contention(&DbErr::ConnectionAcquire(
            ConnAcquireErr::Timeout
        )));
    }

    #[test]
    fn ordinary_failures_are_not_contention() {
        assert!(!is_lock_contention(&DbErr::RecordNotFound("order".into())));
        assert!(!is_lock_contention(&DbErr::Custom(
            "UNIQUE constraint failed: orders.order_number".into()
        )));
    }

    #[tokio::test]
    async fn lock_timeout_is_only_sent_to_postgres() {
        let pg = MockDatabase::new(DbBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            }])
            .into_connection();
        set_lock_timeout(&pg, Duration::from_millis(250)).await.unwrap();
        let log = format!("{:?}", pg.into_transaction_log());
        assert!(log.contains("SET LOCAL lock_timeout = '250ms'"), "{log}");

        let sqlite = MockDatabase::new(DbBackend::Sqlite).into_connection();
        set_lock_timeout(&sqlite, Duration::from_millis(250)).await.unwrap();
        assert!(sqlite.into_transaction_log().is_empty());
    }
}
