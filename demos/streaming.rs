//! Example of subscribing to a push topic through the Streaming API.
//!
//! This example demonstrates:
//! - Building a session manager from environment variables
//! - Provisioning a `PushTopic` with a filter query
//! - Starting the streaming engine and subscribing a consumer
//! - Unsubscribing and shutting down on Ctrl-C

use salesforce_access::session::{self, Credentials};
use salesforce_access::streaming::{self, NotifyForFields, SubscribeRequest, TopicProvisioner};
use salesforce_access::api;
use std::env;
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
            .credentials(Credentials {
                login_url: env::var("SALESFORCE_LOGIN_URL")
                    .unwrap_or_else(|_| "https://login.salesforce.com".to_string()),
                client_id: env::var("SALESFORCE_CLIENT_ID")?,
                client_secret: env::var("SALESFORCE_CLIENT_SECRET")?,
                username: env::var("SALESFORCE_USERNAME")?,
                password: env::var("SALESFORCE_PASSWORD")?,
            })
            .build()?,
    );
    session.login(None).await?;

    let api = Arc::new(api::Client::new(session.clone(), api::Config::default()).await?);
    let engine = streaming::Engine::new(
        session,
        TopicProvisioner::new(api),
        streaming::Config::default(),
    );

    engine.start().await?;
    info!(convention = ?engine.convention(), "Streaming engine started");

    let request = SubscribeRequest::new("AccountUpdates", "demo")
        .filter_query("SELECT Id, Name, Industry FROM Account")
        .notify_for_fields(NotifyForFields::Referenced)
        .allow_update(true);

    match engine
        .subscribe(&request, |channel, message| {
            info!(
                channel,
                event = %message["data"]["event"],
                "Received {}",
                message["data"]["sobject"]
            );
        })
        .await
    {
        Ok(()) => info!("Subscribed to {}", engine.channel_for(&request.topic)),
        Err(e) => {
            error!("Failed to subscribe: {e}");
            engine.shutdown().await?;
            return Err(e.into());
        }
    }

    // Keep the main task alive so the receive loop can run
    tokio::signal::ctrl_c().await?;

    if let Err(e) = engine.unsubscribe(&request.topic, &request.consumer_id).await {
        error!("Failed to unsubscribe: {e}");
    }
    engine.shutdown().await?;

    Ok(())
}
