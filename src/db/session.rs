use super::engine::Engine;
use super::filter::{Predicate, SqlValue};
use super::schema::Entry;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::warn;

/// Unit of work on one pooled connection.
///
/// Ends with `commit`, `rollback` or `close`; dropping it without either
/// rolls the transaction back and returns the connection to the pool.
pub struct Session {
    tx: Transaction<'static, Sqlite>,
}

impl Session {
    pub async fn begin(engine: &Engine) -> Result<Self, sqlx::Error> {
        let tx = engine.pool().begin().await?;
        Ok(Self { tx })
    }

    /// Insert one row of `E`, with values already produced by [`Entry::values`].
    pub async fn add<E: Entry>(&mut self, values: &[SqlValue]) -> Result<(), sqlx::Error> {
        debug_assert_eq!(
            values.len(),
            E::COLUMNS.len(),
            "values() out of line with COLUMNS for {}",
            E::TABLE
        );

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO {} ({}) VALUES (",
            E::TABLE,
            E::COLUMNS.join(", ")
        ));
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            v.push_to(&mut qb);
        }
        qb.push(")");
        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    pub async fn add_all<E: Entry>(&mut self, rows: &[Vec<SqlValue>]) -> Result<(), sqlx::Error> {
        for values in rows {
            self.add::<E>(values).await?;
        }
        Ok(())
    }

    /// Rows of `E`'s table matching `predicate`, in insertion order.
    ///
    /// The predicate must already be validated against `E::COLUMNS`.
    pub async fn select<E: Entry>(
        &mut self,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<E>, sqlx::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {}",
            E::COLUMNS.join(", "),
            E::TABLE
        ));
        if let Some(p) = predicate {
            qb.push(" WHERE ");
            p.render(&mut qb);
        }
        qb.push(" ORDER BY rowid");
        qb.build_query_as::<E>().fetch_all(&mut *self.tx).await
    }

    pub async fn count<E: Entry>(&mut self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", E::TABLE))
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row.0)
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }

    /// End a read-only session. Failures are logged, never returned.
    pub async fn close(self) {
        if let Err(e) = self.tx.rollback().await {
            warn!(error = %e, "failed to close session cleanly");
        }
    }
}
