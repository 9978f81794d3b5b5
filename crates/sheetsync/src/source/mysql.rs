//! MySQL source repository.
//!
//! Selects `id, columns..` from the configured table where the sent flag is 0
//! and flips the flag to 1 for delivered rows inside one transaction.
//!
//! Column values are decoded dynamically from the reported column type, so
//! the table mapping is purely configuration.

use async_trait::async_trait;
use sheetsync_core::{Cell, RowId, SourceRow};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Row, TypeInfo, ValueRef};
use tracing::{debug, info};

use super::SourceRepository;
use crate::config::SourceConfig;
use crate::{Error, Result};

/// Maximum ids per `UPDATE .. WHERE id IN (..)` statement.
const MARK_CHUNK_SIZE: usize = 1000;

/// MySQL-backed [`SourceRepository`].
pub struct MySqlSource {
    pool: MySqlPool,
    select_sql: String,
    table: String,
    id_column: String,
    sent_column: String,
}

impl MySqlSource {
    /// Connect to the store. Fails with [`Error::Connection`] if it is
    /// unreachable, before any row is read.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        config.validate()?;

        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        // One sequential pass at a time needs one connection.
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| Error::Connection {
                operation: "connect",
                message: e.to_string(),
            })?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            table = %config.table,
            "MySQL source connected"
        );

        Ok(Self {
            pool,
            select_sql: select_unsent_sql(config),
            table: config.table.clone(),
            id_column: config.id_column.clone(),
            sent_column: config.sent_column.clone(),
        })
    }

    /// Close the pool, waiting for the connection to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SourceRepository for MySqlSource {
    async fn fetch_unsent(&self) -> Result<Vec<SourceRow>> {
        let rows = sqlx::query(&self.select_sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::from_sql("fetch_unsent", e))?;

        let rows = rows
            .iter()
            .map(|row| SourceRow::from_cells(decode_row(row)?).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;

        debug!("Fetched {} unsent rows from {}", rows.len(), self.table);
        Ok(rows)
    }

    async fn mark_sent(&self, ids: &[RowId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::from_sql("mark_sent", e))?;

        let mut updated = 0u64;
        for chunk in ids.chunks(MARK_CHUNK_SIZE) {
            let sql = mark_sent_sql(&self.table, &self.id_column, &self.sent_column, chunk.len());
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = match id {
                    RowId::Int(n) => query.bind(*n),
                    RowId::Text(s) => query.bind(s.as_str()),
                };
            }
            // Dropping `tx` on error rolls the whole batch back.
            let result = query.execute(&mut *tx).await.map_err(|e| Error::Write {
                operation: "mark_sent",
                message: e.to_string(),
            })?;
            updated += result.rows_affected();
        }

        tx.commit().await.map_err(|e| Error::Write {
            operation: "mark_sent",
            message: format!("commit failed: {e}"),
        })?;

        // Rows flagged by another writer since the fetch are not counted.
        debug!(
            requested = ids.len(),
            updated, "Marked rows as sent in {}", self.table
        );
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{name}`")
}

fn select_unsent_sql(config: &SourceConfig) -> String {
    let columns = std::iter::once(&config.id_column)
        .chain(config.columns.iter())
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {columns} FROM {table} WHERE {sent} = 0 ORDER BY {id}",
        table = quote_ident(&config.table),
        sent = quote_ident(&config.sent_column),
        id = quote_ident(&config.id_column),
    )
}

fn mark_sent_sql(table: &str, id_column: &str, sent_column: &str, count: usize) -> String {
    let placeholders = vec!["?"; count].join(", ");
    format!(
        "UPDATE {} SET {} = 1 WHERE {} IN ({placeholders})",
        quote_ident(table),
        quote_ident(sent_column),
        quote_ident(id_column),
    )
}

fn decode_row(row: &MySqlRow) -> Result<Vec<Cell>> {
    (0..row.columns().len())
        .map(|i| decode_cell(row, i))
        .collect()
}

fn decode_cell(row: &MySqlRow, index: usize) -> Result<Cell> {
    let decode_err = |e: sqlx::Error| Error::from_sql("fetch_unsent", e);

    let raw = row.try_get_raw(index).map_err(decode_err)?;
    if raw.is_null() {
        return Ok(Cell::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let cell = match type_name.as_str() {
        "BOOLEAN" => Cell::Bool(row.try_get::<bool, _>(index).map_err(decode_err)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            Cell::Int(row.try_get::<i64, _>(index).map_err(decode_err)?)
        }
        "YEAR" => Cell::Int(
            row.try_get_unchecked::<i64, _>(index)
                .map_err(decode_err)?,
        ),
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => {
            let n = row.try_get::<u64, _>(index).map_err(decode_err)?;
            i64::try_from(n)
                .map(Cell::Int)
                .unwrap_or_else(|_| Cell::Text(n.to_string()))
        }
        "FLOAT" => Cell::Float(f64::from(
            row.try_get::<f32, _>(index).map_err(decode_err)?,
        )),
        "DOUBLE" => Cell::Float(row.try_get::<f64, _>(index).map_err(decode_err)?),
        "DATE" => Cell::Text(
            row.try_get::<chrono::NaiveDate, _>(index)
                .map_err(decode_err)?
                .to_string(),
        ),
        "DATETIME" | "TIMESTAMP" => Cell::Text(
            row.try_get::<chrono::NaiveDateTime, _>(index)
                .map_err(decode_err)?
                .to_string(),
        ),
        "TIME" => Cell::Text(
            row.try_get::<chrono::NaiveTime, _>(index)
                .map_err(decode_err)?
                .to_string(),
        ),
        // DECIMAL travels as text on the wire; strings, enums and anything
        // else are taken as UTF-8 text.
        _ => {
            let bytes = row
                .try_get_unchecked::<Vec<u8>, _>(index)
                .map_err(decode_err)?;
            Cell::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
    };

    Ok(cell)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SourceConfig {
        SourceConfig {
            database: "jobs".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_unsent_sql() {
        assert_eq!(
            select_unsent_sql(&config()),
            "SELECT `id`, `nome`, `idade`, `cidade` FROM `vagas` WHERE `escrito` = 0 ORDER BY `id`"
        );
    }

    #[test]
    fn test_mark_sent_sql() {
        assert_eq!(
            mark_sent_sql("vagas", "id", "escrito", 3),
            "UPDATE `vagas` SET `escrito` = 1 WHERE `id` IN (?, ?, ?)"
        );
    }

    #[test]
    fn test_mark_sent_sql_single_placeholder() {
        assert!(mark_sent_sql("t", "id", "sent", 1).ends_with("IN (?)"));
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_connection_error() {
        let config = SourceConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout: std::time::Duration::from_millis(500),
            ..config()
        };
        let err = MySqlSource::connect(&config).await.err().unwrap();
        assert!(err.is_connection(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_connect_validates_config_first() {
        let config = SourceConfig {
            table: "bad name".to_string(),
            ..config()
        };
        let err = MySqlSource::connect(&config).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
