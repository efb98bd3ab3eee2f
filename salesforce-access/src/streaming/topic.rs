//! Idempotent `PushTopic` provisioning over the REST API.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::{self, RequestSpec};
use crate::ErrorKind;

/// First API version exposing per-operation notification flags on `PushTopic`.
const OPERATION_FLAGS_SINCE: f64 = 29.0;

/// Errors that can occur while provisioning a push topic.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A REST call failed.
    #[error("Push topic request failed: {source}")]
    Api {
        #[source]
        source: api::Error,
    },
    /// A REST response could not be decoded.
    #[error("Failed to decode push topic response: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },
    /// The server refused to create the topic.
    #[error("Failed to create push topic {name}: {reason}")]
    CreateFailed {
        /// Topic name.
        name: String,
        /// Server-provided reason.
        reason: String,
    },
    /// The stored topic differs from the desired one and updates are not allowed.
    #[error("Push topic {name} differs in {fields} and updates are not allowed")]
    UpdateNotAllowed {
        /// Topic name.
        name: String,
        /// Comma-separated list of differing fields.
        fields: String,
    },
    /// A required definition field is empty.
    #[error("Push topic definition is missing {field}")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },
    /// The definition's API version is not a number.
    #[error("Invalid push topic API version: {version}")]
    InvalidApiVersion {
        /// Offending version string.
        version: String,
    },
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Api { source } => source.kind(),
            Error::Decode { .. } => ErrorKind::Other,
            Error::CreateFailed { .. }
            | Error::UpdateNotAllowed { .. }
            | Error::MissingField { .. }
            | Error::InvalidApiVersion { .. } => ErrorKind::BadInput,
        }
    }
}

/// Which record fields are evaluated when matching changes against the topic query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NotifyForFields {
    /// Any field change.
    All,
    /// Fields referenced anywhere in the query.
    #[default]
    Referenced,
    /// Fields in the `SELECT` clause.
    Select,
    /// Fields in the `WHERE` clause.
    Where,
}

impl NotifyForFields {
    fn as_str(self) -> &'static str {
        match self {
            NotifyForFields::All => "All",
            NotifyForFields::Referenced => "Referenced",
            NotifyForFields::Select => "Select",
            NotifyForFields::Where => "Where",
        }
    }
}

/// Record operations that generate notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyForOperations {
    /// Notify when a matching record is inserted.
    pub create: bool,
    /// Notify when a matching record is updated.
    pub update: bool,
    /// Notify when a matching record is deleted.
    pub delete: bool,
    /// Notify when a matching record is restored from the recycle bin.
    pub undelete: bool,
}

impl Default for NotifyForOperations {
    fn default() -> Self {
        Self {
            create: true,
            update: true,
            delete: true,
            undelete: true,
        }
    }
}

impl NotifyForOperations {
    /// Value of the single `NotifyForOperations` picklist used before API 29.0.
    pub fn legacy_value(self) -> &'static str {
        match (self.create, self.update) {
            (true, false) => "Create",
            (false, true) => "Update",
            _ => "All",
        }
    }
}

/// Desired state of a push topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTopicDefinition {
    /// Topic name; immutable once created.
    pub name: String,
    /// SOQL filter query.
    pub query: String,
    /// Field changes that trigger a notification.
    pub notify_for_fields: NotifyForFields,
    /// Record operations that trigger a notification.
    pub notify_for_operations: NotifyForOperations,
    /// API version recorded on the topic at creation.
    pub api_version: String,
}

impl PushTopicDefinition {
    /// Creates a definition with default notification settings.
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            notify_for_fields: NotifyForFields::default(),
            notify_for_operations: NotifyForOperations::default(),
            api_version: crate::DEFAULT_API_VERSION.to_string(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::MissingField { field: "name" });
        }
        if self.query.trim().is_empty() {
            return Err(Error::MissingField { field: "query" });
        }
        Ok(())
    }
}

/// What [`TopicProvisioner::ensure_topic`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// A new topic was created.
    Created {
        /// Record id of the new topic.
        id: String,
    },
    /// The stored topic already matched.
    Unchanged {
        /// Record id of the existing topic.
        id: String,
    },
    /// The stored topic was updated.
    Updated {
        /// Record id of the updated topic.
        id: String,
    },
}

#[derive(Deserialize)]
struct QueryResult {
    records: Vec<PushTopicRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PushTopicRecord {
    id: String,
    query: String,
    notify_for_fields: Option<NotifyForFields>,
    notify_for_operations: Option<String>,
    notify_for_operation_create: Option<bool>,
    notify_for_operation_update: Option<bool>,
    notify_for_operation_delete: Option<bool>,
    notify_for_operation_undelete: Option<bool>,
}

#[derive(Deserialize)]
struct SaveResult {
    id: Option<String>,
    success: bool,
    #[serde(default)]
    errors: Vec<SaveError>,
}

#[derive(Deserialize)]
struct SaveError {
    #[serde(rename = "statusCode", default)]
    status_code: String,
    #[serde(default)]
    message: String,
}

/// Creates or reconciles push topics.
///
/// The lookup-then-write sequence is not atomic: two provisioners racing on the same new
/// name may both attempt the create, and the server rejects the duplicate. Serialize
/// provisioning of one name externally if that matters.
#[derive(Debug, Clone)]
pub struct TopicProvisioner {
    api: Arc<api::Client>,
}

impl TopicProvisioner {
    /// Creates a provisioner issuing calls through `api`.
    pub fn new(api: Arc<api::Client>) -> Self {
        Self { api }
    }

    /// Ensures a topic named `definition.name` exists with the desired query and
    /// notification settings.
    ///
    /// Only `Query`, `NotifyForFields` and the operation settings are ever updated.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The definition has an empty name or query ([`Error::MissingField`])
    /// - The stored topic differs and `allow_update` is false ([`Error::UpdateNotAllowed`])
    /// - The server refuses the create ([`Error::CreateFailed`])
    /// - A REST call fails ([`Error::Api`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn ensure_topic(
        &self,
        definition: &PushTopicDefinition,
        allow_update: bool,
    ) -> Result<Provisioned, Error> {
        definition.validate()?;

        let Some(existing) = self.find(&definition.name).await? else {
            return self.create(definition).await;
        };

        let differences = self.differences(&existing, definition);
        if differences.is_empty() {
            debug!(topic = %definition.name, "push topic up to date");
            return Ok(Provisioned::Unchanged { id: existing.id });
        }

        if !allow_update {
            return Err(Error::UpdateNotAllowed {
                name: definition.name.clone(),
                fields: differences.join(", "),
            });
        }

        self.update(&existing.id, definition).await?;
        info!(topic = %definition.name, fields = %differences.join(", "), "push topic updated");
        Ok(Provisioned::Updated { id: existing.id })
    }

    fn uses_operation_flags(&self) -> bool {
        super::api_version_number(self.api.api_version())
            .map(|version| version >= OPERATION_FLAGS_SINCE)
            .unwrap_or(true)
    }

    async fn find(&self, name: &str) -> Result<Option<PushTopicRecord>, Error> {
        let fields = if self.uses_operation_flags() {
            "Id, Name, Query, NotifyForFields, NotifyForOperationCreate, \
             NotifyForOperationUpdate, NotifyForOperationDelete, NotifyForOperationUndelete"
        } else {
            "Id, Name, Query, NotifyForFields, NotifyForOperations"
        };
        let soql = format!(
            "SELECT {fields} FROM PushTopic WHERE Name = '{}'",
            escape_soql(name)
        );

        let request = RequestSpec::get(self.api.data_path("/query")).query("q", soql);
        let body = self.call(request).await?;
        let result: QueryResult =
            serde_json::from_slice(&body).map_err(|source| Error::Decode { source })?;

        Ok(result.records.into_iter().next())
    }

    async fn create(&self, definition: &PushTopicDefinition) -> Result<Provisioned, Error> {
        let api_version = super::api_version_number(&definition.api_version).ok_or_else(|| {
            Error::InvalidApiVersion {
                version: definition.api_version.clone(),
            }
        })?;

        let mut fields = self.mutable_fields(definition);
        fields.insert("Name".to_string(), json!(definition.name));
        fields.insert("ApiVersion".to_string(), json!(api_version));

        let create = RequestSpec::post(self.api.data_path("/sobjects/PushTopic"));
        let request = self.json_request(create, &fields)?;
        let body = self.call(request).await?;
        let result: SaveResult =
            serde_json::from_slice(&body).map_err(|source| Error::Decode { source })?;

        match result {
            SaveResult {
                success: true,
                id: Some(id),
                ..
            } => {
                info!(topic = %definition.name, %id, "push topic created");
                Ok(Provisioned::Created { id })
            }
            SaveResult { errors, .. } => {
                let reason = errors
                    .iter()
                    .map(|e| format!("{}: {}", e.status_code, e.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(Error::CreateFailed {
                    name: definition.name.clone(),
                    reason: if reason.is_empty() {
                        "create returned success=false".to_string()
                    } else {
                        reason
                    },
                })
            }
        }
    }

    async fn update(&self, id: &str, definition: &PushTopicDefinition) -> Result<(), Error> {
        let path = self.api.data_path(&format!("/sobjects/PushTopic/{id}"));
        let request =
            self.json_request(RequestSpec::patch(path), &self.mutable_fields(definition))?;
        self.call(request).await?;
        Ok(())
    }

    /// Fields that may be written on both create and update.
    fn mutable_fields(&self, definition: &PushTopicDefinition) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("Query".to_string(), json!(definition.query));
        fields.insert(
            "NotifyForFields".to_string(),
            json!(definition.notify_for_fields.as_str()),
        );

        let operations = definition.notify_for_operations;
        if self.uses_operation_flags() {
            fields.insert("NotifyForOperationCreate".to_string(), json!(operations.create));
            fields.insert("NotifyForOperationUpdate".to_string(), json!(operations.update));
            fields.insert("NotifyForOperationDelete".to_string(), json!(operations.delete));
            fields.insert("NotifyForOperationUndelete".to_string(), json!(operations.undelete));
        } else {
            fields.insert("NotifyForOperations".to_string(), json!(operations.legacy_value()));
        }
        fields
    }

    fn differences(
        &self,
        existing: &PushTopicRecord,
        desired: &PushTopicDefinition,
    ) -> Vec<&'static str> {
        let mut differences = Vec::new();

        if existing.query.trim() != desired.query.trim() {
            differences.push("Query");
        }
        if existing.notify_for_fields != Some(desired.notify_for_fields) {
            differences.push("NotifyForFields");
        }

        let operations = desired.notify_for_operations;
        let operations_match = if self.uses_operation_flags() {
            existing.notify_for_operation_create == Some(operations.create)
                && existing.notify_for_operation_update == Some(operations.update)
                && existing.notify_for_operation_delete == Some(operations.delete)
                && existing.notify_for_operation_undelete == Some(operations.undelete)
        } else {
            existing.notify_for_operations.as_deref() == Some(operations.legacy_value())
        };
        if !operations_match {
            differences.push("NotifyForOperations");
        }

        differences
    }

    fn json_request(
        &self,
        request: RequestSpec,
        fields: &Map<String, Value>,
    ) -> Result<RequestSpec, Error> {
        request
            .json(fields)
            .map_err(|source| Error::Decode { source })
    }

    async fn call(&self, request: RequestSpec) -> Result<bytes::Bytes, Error> {
        let body = self
            .api
            .execute(request)
            .await
            .map_err(|source| Error::Api { source })?;
        api::collect(body)
            .await
            .map_err(|source| Error::Api { source })
    }
}

/// Escapes a value for use inside a single-quoted SOQL literal.
fn escape_soql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
