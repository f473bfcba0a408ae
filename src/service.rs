//! Consumer-facing data access

use crate::config::ConnectionConfig;
use crate::manager::{ConnectionManager, Connector, PgConnector};
use crate::query::run_query;
use crate::{Error, Result};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Column logged for every row
pub const ID_COLUMN: &str = "id";

/// Reads the configured table through a [`ConnectionManager`]
#[derive(Debug)]
pub struct DataService<C: Connector> {
    manager: ConnectionManager<C>,
}

impl DataService<PgConnector> {
    /// Service configured from the process environment
    pub fn from_env() -> Result<Self> {
        let config = ConnectionConfig::from_env()?;
        Ok(Self::new(ConnectionManager::from_config(config)?))
    }
}

impl<C: Connector> DataService<C> {
    /// Wrap a manager
    pub fn new(manager: ConnectionManager<C>) -> Self {
        Self { manager }
    }

    /// The underlying manager
    pub fn manager(&self) -> &ConnectionManager<C> {
        &self.manager
    }

    /// Ensure a live connection, read every row of `<schema>.<table>` and log
    /// its `id`; returns the number of rows seen
    pub async fn get_data(&self) -> Result<u64> {
        self.get_data_until(&CancellationToken::new()).await
    }

    /// [`Self::get_data`] with a cancellable connection refresh
    pub async fn get_data_until(&self, cancel: &CancellationToken) -> Result<u64> {
        let config = self.manager.config();
        let span = tracing::info_span!("get_data", schema = %config.schema, table = %config.table);

        async {
            let mut handle = self.manager.ensure_connection_until(cancel).await?;
            let mut rows = run_query(&mut *handle, &config.schema, &config.table).await?;

            let mut count = 0u64;
            while let Some(row) = rows.next().await {
                let row = row?;
                let id = row.try_get(ID_COLUMN).map_err(Error::query)?;
                tracing::info!(id = id.unwrap_or("NULL"), "row");
                count += 1;
            }

            tracing::info!(rows = count, "get_data complete");
            Ok(count)
        }
        .instrument(span)
        .await
    }
}
