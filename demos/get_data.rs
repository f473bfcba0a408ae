//! Run the uppercase handler once against the configured database.
//!
//! ```sh
//! export dbEndpoint=mydb.abc123.us-east-1.rds.amazonaws.com region=us-east-1 \
//!        userName=app database=app schema=public table=users useToken=true \
//!        sslMode=verify-full sslRootCert=/opt/rds/global-bundle.pem
//! # AWS credentials come from the default chain (env, profile, IRSA, ECS, IMDS)
//! RUST_LOG=rds_iam_conn=debug cargo run --example get_data -- hello
//! ```

use rds_iam_conn::{DataService, Result, UppercaseHandler};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rds_iam_conn=info,get_data=info")),
        )
        .init();

    let input = std::env::args().nth(1).unwrap_or_else(|| "hello".to_string());

    let handler = UppercaseHandler::new(DataService::from_env()?);
    let output = handler.handle(&input).await?;

    println!("{}", output);
    Ok(())
}
