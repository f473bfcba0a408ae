//! Rows and row streams
//!
//! A [`RowStream`] borrows the connection it reads from, so the connection
//! manager's lock is held for exactly as long as rows are being consumed.

use crate::manager::Session;
use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// One result row in text format
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    /// Row with the given column names and raw text values
    pub fn new(columns: Arc<[String]>, values: Vec<Option<Bytes>>) -> Self {
        Self { columns, values }
    }

    /// Column names, in result order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at `index`; `Ok(None)` for SQL NULL
    pub fn get(&self, index: usize) -> Result<Option<&str>> {
        let value = self.values.get(index).ok_or_else(|| {
            Error::Protocol(format!(
                "column index {} out of range ({} columns)",
                index,
                self.values.len()
            ))
        })?;

        value
            .as_deref()
            .map(|bytes| {
                std::str::from_utf8(bytes).map_err(|e| {
                    Error::Protocol(format!("column {} is not valid UTF-8: {}", index, e))
                })
            })
            .transpose()
    }

    /// Value of the column named `name`; `Ok(None)` for SQL NULL
    ///
    /// # Errors
    ///
    /// `Error::Protocol` if no column has that name.
    pub fn try_get(&self, name: &str) -> Result<Option<&str>> {
        let index = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::Protocol(format!("no column named '{}'", name)))?;
        self.get(index)
    }
}

/// Lazily-read query result
pub struct RowStream<'a> {
    columns: Arc<[String]>,
    inner: BoxStream<'a, Result<Row>>,
}

impl<'a> RowStream<'a> {
    /// Stream over `inner`, whose rows carry `columns`
    pub fn new(columns: Arc<[String]>, inner: BoxStream<'a, Result<Row>>) -> Self {
        Self { columns, inner }
    }

    /// Result with no columns and no rows (statements without a result set)
    pub fn empty() -> Self {
        Self::new(Arc::from(Vec::new()), futures::stream::empty().boxed())
    }

    /// Stream over rows already in memory
    pub fn from_rows(columns: Arc<[String]>, rows: Vec<Result<Row>>) -> Self {
        Self::new(columns, futures::stream::iter(rows).boxed())
    }

    /// Column names of the result
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Apply `f` to every error the stream yields
    pub fn map_err<F>(self, f: F) -> Self
    where
        F: Fn(Error) -> Error + Send + 'a,
    {
        Self {
            columns: self.columns,
            inner: self.inner.map(move |row| row.map_err(&f)).boxed(),
        }
    }
}

impl Stream for RowStream<'_> {
    type Item = Result<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for RowStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// `SELECT * FROM <schema>.<table>`
///
/// Both parts are validated identifiers (see [`crate::ConnectionConfig::validate`])
/// and are interpolated unquoted.
pub fn select_all_sql(schema: &str, table: &str) -> String {
    format!("SELECT * FROM {}.{}", schema, table)
}

/// Run `SELECT * FROM <schema>.<table>` on a live handle
///
/// No reconnect is attempted: any failure, immediate or while streaming, is
/// reported as `Error::QueryExecution`.
pub async fn run_query<'a, S>(handle: &'a mut S, schema: &str, table: &str) -> Result<RowStream<'a>>
where
    S: Session + ?Sized,
{
    let sql = select_all_sql(schema, table);
    tracing::debug!(%sql, "running query");

    let rows = handle.query(&sql).await.map_err(Error::query)?;
    Ok(rows.map_err(Error::query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn columns(names: &[&str]) -> Arc<[String]> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_select_all_sql() {
        assert_eq!(select_all_sql("public", "users"), "SELECT * FROM public.users");
    }

    #[test]
    fn test_row_access() {
        let row = Row::new(
            columns(&["id", "name"]),
            vec![Some(Bytes::from_static(b"7")), None],
        );
        assert_eq!(row.len(), 2);
        assert_eq!(row.try_get("id").unwrap(), Some("7"));
        assert_eq!(row.try_get("name").unwrap(), None);
        assert!(matches!(row.try_get("email"), Err(Error::Protocol(_))));
        assert!(row.get(5).is_err());
    }

    #[test]
    fn test_row_rejects_invalid_utf8() {
        let row = Row::new(columns(&["id"]), vec![Some(Bytes::from_static(&[0xff, 0xfe]))]);
        assert!(row.get(0).is_err());
    }

    #[tokio::test]
    async fn test_from_rows_and_map_err() {
        let cols = columns(&["id"]);
        let stream = RowStream::from_rows(
            cols.clone(),
            vec![
                Ok(Row::new(cols.clone(), vec![Some(Bytes::from_static(b"1"))])),
                Err(Error::Sql("ERROR: boom".into())),
            ],
        )
        .map_err(Error::query);

        assert_eq!(stream.columns(), &["id".to_string()]);
        let items: Vec<Result<Row>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(Error::QueryExecution { .. })));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let rows: Vec<Row> = RowStream::empty().try_collect().await.unwrap();
        assert!(rows.is_empty());
    }
}
