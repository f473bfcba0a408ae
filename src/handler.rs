//! Uppercase request handler

use crate::manager::Connector;
use crate::service::DataService;
use crate::{Error, Result};

/// Input that is always rejected
pub const REJECTED_INPUT: &str = "exception";

/// Touches the database, then echoes its input in upper case
#[derive(Debug)]
pub struct UppercaseHandler<C: Connector> {
    service: DataService<C>,
}

impl<C: Connector> UppercaseHandler<C> {
    /// Handler backed by `service`
    pub fn new(service: DataService<C>) -> Self {
        Self { service }
    }

    /// The data service
    pub fn service(&self) -> &DataService<C> {
        &self.service
    }

    /// Run `get_data`, then return `value` upper-cased
    ///
    /// # Errors
    ///
    /// Any `get_data` failure, or `Error::InvalidInput` for `"exception"`.
    pub async fn handle(&self, value: &str) -> Result<String> {
        tracing::info!("handling request");

        self.service.get_data().await?;

        if value == REJECTED_INPUT {
            return Err(Error::InvalidInput("intentional exception".into()));
        }

        let upper = value.to_uppercase();
        tracing::debug!(%upper, "responding");
        Ok(upper)
    }
}
