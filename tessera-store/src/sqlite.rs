// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, migrate};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::locks::NamedLocks;
use crate::traits::Transaction as _;

/// Create SQLite database if it doesn't already exist.
pub async fn create_database(url: &str) -> Result<(), StoreError> {
    if !Sqlite::database_exists(url).await? {
        Sqlite::create_database(url).await?
    }
    Ok(())
}

/// Drop SQLite database if it exists.
pub async fn drop_database(url: &str) -> Result<(), StoreError> {
    if Sqlite::database_exists(url).await? {
        Sqlite::drop_database(url).await?
    }
    Ok(())
}

/// Get migrations from folder without running them.
pub fn migrations() -> Migrator {
    migrate!()
}

/// Run any pending database migrations from inside the application.
pub async fn run_pending_migrations(pool: &sqlx::SqlitePool) -> Result<(), StoreError> {
    migrations().run(pool).await?;
    Ok(())
}

#[derive(Debug)]
pub struct SqliteStoreBuilder {
    url: String,
    max_connections: u32,
    run_migrations: bool,
    create_database: bool,
}

impl Default for SqliteStoreBuilder {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".into(),
            max_connections: 16,
            create_database: true,
            run_migrations: true,
        }
    }
}

impl SqliteStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn random_memory_url(mut self) -> Self {
        // Combining Rust tests with in-memory databases can lead to unsound behaviour, this
        // "workaround" assigns every temporary database a different, random name and keeps them
        // isolated from other tests.
        //
        // See related issue: https://github.com/launchbadge/sqlx/issues/2510
        self.url = format!(
            "sqlite://dbmem{}?mode=memory&cache=private",
            rand::random::<u32>()
        );
        self
    }

    pub fn database_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn create_database(mut self, create_database: bool) -> Self {
        self.create_database = create_database;
        self
    }

    pub fn run_default_migrations(mut self, run_migrations: bool) -> Self {
        self.run_migrations = run_migrations;
        self
    }

    pub async fn build(self) -> Result<SqliteStore, StoreError> {
        if self.create_database {
            create_database(&self.url).await?;
        }

        let pool: sqlx::SqlitePool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.url)
            .await?;

        if self.run_migrations {
            run_pending_migrations(&pool).await?;
        }

        debug!(url = %self.url, max_connections = self.max_connections, "opened sqlite store");

        Ok(SqliteStore::new(pool))
    }
}

pub type Transaction = sqlx::Transaction<'static, Sqlite>;

/// SQLite database with connection pool, transaction provider and named advisory locks.
///
/// Clones share the connection pool, the lock registry and the currently open transaction.
///
/// SQLite strictly serializes transactions with _writes_ and will block any parallel attempt to
/// begin another one. Processes starting a transaction acquire a `TransactionPermit` and keep it
/// until the transaction was committed or rolled back. Every engine operation is a write, so all
/// of its reads go through `tx` as well to observe its own uncommitted changes.
///
/// Named locks are independent of transactions. They are taken _before_ a transaction begins so
/// that a waiting process gives up after a bounded time instead of queueing on the permit.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    tx: Arc<Mutex<Option<Transaction>>>,
    pool: sqlx::SqlitePool,
    semaphore: Arc<Semaphore>,
    locks: NamedLocks,
}

impl SqliteStore {
    pub(crate) fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            tx: Arc::default(),
            pool,
            // One open transaction at a time.
            semaphore: Arc::new(Semaphore::new(1)),
            locks: NamedLocks::default(),
        }
    }

    /// Shortcut building an in-memory SQLite database with a randomised name for testing purposes.
    #[cfg(any(test, feature = "test_utils"))]
    pub async fn temporary() -> Self {
        SqliteStoreBuilder::new()
            .random_memory_url()
            .max_connections(1)
            .build()
            .await
            .expect("migrations succeeded")
    }

    /// Runs queries of `f` against the open transaction.
    ///
    /// Fails with `StoreError::TransactionMissing` outside of `begin` and `commit`/`rollback`.
    /// Calls must not be nested, the transaction stays locked for the duration of `f`.
    pub async fn tx<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: AsyncFnOnce(&mut Transaction) -> Result<R, StoreError>,
    {
        let mut tx_ref = self.tx.lock().await;
        let tx = tx_ref.as_mut().ok_or(StoreError::TransactionMissing)?;

        f(tx).await
    }

    /// Execute SQL query directly on the pool, outside of any transaction.
    pub async fn execute<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: AsyncFnOnce(&sqlx::SqlitePool) -> Result<R, StoreError>,
    {
        f(&self.pool).await
    }

    /// Runs `f` inside a fresh transaction.
    ///
    /// The transaction is committed when `f` returns `Ok` and rolled back otherwise. All writes
    /// issued by `f` through `tx` become visible atomically or not at all.
    pub async fn in_transaction<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: AsyncFnOnce() -> Result<R, E>,
        E: From<StoreError>,
    {
        let permit = self.begin().await?;

        match f().await {
            Ok(value) => {
                self.commit(permit).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(permit).await {
                    warn!("rolling back failed transaction: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    /// Runs `f` while holding the advisory lock `name`.
    ///
    /// Waiting for the lock is bounded by `timeout`, after which `StoreError::LockTimeout` is
    /// returned and `f` is never called.
    pub async fn with_named_lock<F, R, E>(&self, name: &str, timeout: Duration, f: F) -> Result<R, E>
    where
        F: AsyncFnOnce() -> Result<R, E>,
        E: From<StoreError>,
    {
        let _guard = self.locks.acquire(name, timeout).await?;
        f().await
    }
}

impl crate::traits::Transaction for SqliteStore {
    type Error = StoreError;

    type Permit = TransactionPermit;

    /// Begins a transaction once the single `TransactionPermit` is free.
    async fn begin(&self) -> Result<TransactionPermit, StoreError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;

        // This lock only makes sure that mutable access to the transaction is exclusive _within_
        // a process "holding" the transaction permit.
        let mut tx_ref = self.tx.lock().await;
        debug_assert!(
            tx_ref.is_none(),
            "can't have an already existing transaction after an just-acquired permit"
        );

        let tx = self.pool.begin().await?;
        tx_ref.replace(tx);

        Ok(TransactionPermit(permit))
    }

    /// Rolls back the transaction and with that all uncommitted changes.
    ///
    /// This takes the permit and frees it after the rollback has finished.
    async fn rollback(&self, permit: TransactionPermit) -> Result<(), StoreError> {
        let tx = self.tx.lock().await.take();

        let result = match tx {
            Some(tx) => tx.rollback().await.map_err(StoreError::from),
            None => Err(StoreError::TransactionMissing),
        };

        // Always drop the permit, both on successful rollback and error.
        drop(permit);

        result
    }

    /// Commits the transaction.
    ///
    /// This takes the permit and frees it after the commit has finished.
    async fn commit(&self, permit: TransactionPermit) -> Result<(), StoreError> {
        let tx = self.tx.lock().await.take();

        let result = match tx {
            Some(tx) => tx.commit().await.map_err(StoreError::from),
            None => Err(StoreError::TransactionMissing),
        };

        drop(permit);

        result
    }
}

#[allow(unused)]
#[derive(Debug)]
pub struct TransactionPermit(OwnedSemaphorePermit);

#[derive(Debug, Error)]
pub enum StoreError {
    /// A query was issued through `tx` without calling `begin` first.
    #[error("no transaction was started")]
    TransactionMissing,

    #[error("store was closed")]
    Closed,

    /// An insert hit an existing primary key or unique constraint.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Waiting for a named lock or for the database lock took too long.
    #[error("timed out waiting for lock '{0}'")]
    LockTimeout(String),

    #[error("deadlock detected")]
    Deadlock,

    /// Identifier generation kept colliding with existing rows.
    #[error("could not generate a unique identifier after {attempts} attempts")]
    GeneratorExhausted { attempts: u32 },

    /// SQLite database and connection error.
    #[error(transparent)]
    Sqlite(sqlx::Error),

    /// SQL table schema migration error.
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be turned back into its Rust type.
    #[error("could not decode stored '{0}' value: {1}")]
    Decode(String, DecodeError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let classified = match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Some(StoreError::DuplicateKey(db.message().to_string()))
            }
            // SQLITE_BUSY, SQLITE_BUSY_SNAPSHOT
            sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("5" | "517")) => {
                Some(StoreError::LockTimeout("database".into()))
            }
            // SQLITE_LOCKED, SQLITE_LOCKED_SHAREDCACHE
            sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("6" | "262")) => {
                Some(StoreError::Deadlock)
            }
            sqlx::Error::PoolTimedOut => Some(StoreError::LockTimeout("connection pool".into())),
            _ => None,
        };

        match classified {
            Some(classified) => classified,
            None => StoreError::Sqlite(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("parsing from string failed")]
    FromStr,

    #[error("value {0} is out of range")]
    OutOfRange(i64),
}

#[cfg(test)]
mod tests {
    use std::task::Poll;
    use std::time::Duration;

    use futures_test::task::noop_context;
    use sqlx::{Executor, query, query_as};

    use crate::sqlite::{SqliteStore, SqliteStoreBuilder, StoreError};
    use crate::traits::Transaction;

    #[tokio::test]
    async fn queries_need_an_open_transaction() {
        let store = store_with_test_table().await;

        assert!(matches!(
            store.tx(async |_| Ok(())).await,
            Err(StoreError::TransactionMissing)
        ));

        let permit = store.begin().await.unwrap();

        // A second transaction waits for the permit.
        let mut second = Box::pin(store.begin());
        assert!(matches!(
            second.as_mut().poll(&mut noop_context()),
            Poll::Pending
        ));
        drop(second);

        assert!(store.tx(async |_| Ok(())).await.is_ok());
        store.commit(permit).await.unwrap();

        assert!(matches!(
            store.tx(async |_| Ok(())).await,
            Err(StoreError::TransactionMissing)
        ));
    }

    #[tokio::test]
    async fn writers_wait_for_each_other() {
        let store = store_with_test_table().await;

        let permit = store.begin().await.unwrap();

        let ((), seen) = tokio::join!(
            async {
                store
                    .tx(async |tx| {
                        query("INSERT INTO test (x) VALUES (5)")
                            .execute(&mut **tx)
                            .await?;
                        Ok(())
                    })
                    .await
                    .unwrap();
                store.commit(permit).await.unwrap();
            },
            async {
                let permit = store.begin().await.unwrap();

                let seen = store
                    .tx(async |tx| {
                        let row: (i64,) =
                            query_as("SELECT x FROM test").fetch_one(&mut **tx).await?;
                        Ok(row.0)
                    })
                    .await
                    .unwrap();

                store
                    .tx(async |tx| {
                        query("UPDATE test SET x = 10").execute(&mut **tx).await?;
                        Ok(())
                    })
                    .await
                    .unwrap();
                store.rollback(permit).await.unwrap();

                seen
            }
        );

        // The waiting writer saw the committed row, its own update was discarded.
        assert_eq!(seen, 5);
        let value = store
            .execute(async |pool| {
                let row: (i64,) = query_as("SELECT x FROM test").fetch_one(pool).await?;
                Ok(row.0)
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    async fn store_with_test_table() -> SqliteStore {
        let store = SqliteStoreBuilder::new()
            .run_default_migrations(false)
            .max_connections(1)
            .random_memory_url()
            .build()
            .await
            .unwrap();

        store
            .execute(async |pool| {
                pool.execute("CREATE TABLE test(x INTEGER PRIMARY KEY)")
                    .await?;
                Ok(())
            })
            .await
            .unwrap();

        store
    }

    async fn count(store: &SqliteStore) -> i64 {
        store
            .execute(async |pool| {
                let row: (i64,) = query_as("SELECT COUNT(*) FROM test")
                    .fetch_one(pool)
                    .await?;
                Ok(row.0)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn in_transaction_commits_on_success() {
        let store = store_with_test_table().await;

        let value: Result<i64, StoreError> = store
            .in_transaction(async || {
                store
                    .tx(async |tx| {
                        query("INSERT INTO test (x) VALUES (1)")
                            .execute(&mut **tx)
                            .await?;
                        Ok(())
                    })
                    .await?;
                Ok(1)
            })
            .await;

        assert_eq!(value.unwrap(), 1);
        assert_eq!(count(&store).await, 1);
    }

    #[tokio::test]
    async fn in_transaction_rolls_back_on_error() {
        let store = store_with_test_table().await;

        let result: Result<(), StoreError> = store
            .in_transaction(async || {
                store
                    .tx(async |tx| {
                        query("INSERT INTO test (x) VALUES (1)")
                            .execute(&mut **tx)
                            .await?;
                        // Same primary key again.
                        query("INSERT INTO test (x) VALUES (1)")
                            .execute(&mut **tx)
                            .await?;
                        Ok(())
                    })
                    .await
            })
            .await;

        assert!(matches!(result, Err(StoreError::DuplicateKey(_))));
        assert_eq!(count(&store).await, 0);

        // The permit was released, a new transaction can begin.
        let permit = store.begin().await.unwrap();
        store.commit(permit).await.unwrap();
    }

    #[tokio::test]
    async fn named_lock_times_out() {
        let store = store_with_test_table().await;

        let holder = store.clone();
        let (first, second) = tokio::join!(
            holder.with_named_lock("test", Duration::from_secs(1), async || {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, StoreError>(())
            }),
            async {
                // Give the first future the chance to take the lock.
                tokio::time::sleep(Duration::from_millis(20)).await;
                store
                    .with_named_lock("test", Duration::from_millis(50), async || {
                        Ok::<_, StoreError>(())
                    })
                    .await
            }
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(StoreError::LockTimeout(name)) if name == "test"));
    }
}
