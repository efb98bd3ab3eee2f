//! Example of calling the REST API through the resilient client.
//!
//! This example demonstrates:
//! - Loading credentials from a file
//! - Reading a record with JSON and with XML payloads
//! - Creating a record from a buffered body
//! - Inspecting decoded provider errors

use salesforce_access::api::{self, PayloadFormat, RequestSpec};
use salesforce_access::session;
use salesforce_access::ErrorKind;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let session = Arc::new(
        session::Builder::new()
            .credentials_path(PathBuf::from("credentials.json"))
            .build()?,
    );
    let client = api::Client::new(session, api::Config::default()).await?;

    info!("Listing sObjects");
    let sobjects = RequestSpec::get(client.data_path("/sobjects"));
    let body = api::collect(client.execute(sobjects).await?).await?;
    let listing: serde_json::Value = serde_json::from_slice(&body)?;
    info!(
        "Org exposes {} sObjects",
        listing["sobjects"].as_array().map(Vec::len).unwrap_or(0)
    );

    info!("Creating an account");
    let create = RequestSpec::post(client.data_path("/sobjects/Account"))
        .json(&json!({ "Name": "Example Account" }))?;
    let body = api::collect(client.execute(create).await?).await?;
    let created: serde_json::Value = serde_json::from_slice(&body)?;
    let id = created["id"].as_str().unwrap_or_default().to_string();
    info!("Created account {id}");

    info!("Reading the account as XML");
    let read = RequestSpec::get(client.data_path(&format!("/sobjects/Account/{id}")))
        .format(PayloadFormat::Xml);
    let body = api::collect(client.execute(read).await?).await?;
    info!("{}", String::from_utf8_lossy(&body));

    info!("Reading a record that does not exist");
    let missing = RequestSpec::get(client.data_path("/sobjects/Account/001000000000000AAA"));
    match client.execute(missing).await {
        Ok(_) => info!("Unexpectedly found the record"),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            for entry in e.api_error().map(|a| a.entries.as_slice()).unwrap_or_default() {
                info!("Provider error {}: {}", entry.code, entry.message);
            }
        }
        Err(e) => error!("Request failed: {e}"),
    }

    info!("Deleting the account");
    client
        .execute(RequestSpec::delete(client.data_path(&format!("/sobjects/Account/{id}"))))
        .await?;

    Ok(())
}
