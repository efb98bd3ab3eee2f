//! Salesforce REST API execution.
//!
//! This module provides:
//! - **Execution**: authenticated calls with one transparent replay after a session refresh
//! - **Request model**: replayable request bodies and negotiated payload formats
//! - **Error decoding**: JSON and XML provider error lists with a status fallback
//!
//! # Example
//!
//! ```no_run
//! use salesforce_access::api::{self, RequestSpec};
//! use salesforce_access::session;
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Arc::new(
//!     session::Builder::new()
//!         .credentials_path(PathBuf::from("credentials.json"))
//!         .build()?,
//! );
//!
//! let client = api::Client::new(session, api::Config::default()).await?;
//! let request = RequestSpec::get(client.data_path("/sobjects/Account/001xx000003DGb2AAG"));
//! let account = api::collect(client.execute(request).await?).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod request;

pub use client::{collect, ByteStream, Client, Config, Error};
pub use error::{ApiError, ErrorEntry};
pub use request::{PayloadFormat, RequestBody, RequestSpec};
