use crate::{
    models::{AggregateOptions, AuthMethod, ConnectionSettings, TlsOption},
    schema::ValidatedPipeline,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::{
    error::ErrorKind,
    options::{
        AggregateOptions as DriverAggregateOptions, AuthMechanism, ClientOptions, Credential, Tls,
        TlsOptions,
    },
    Client, Database,
};
use serde::Serialize;
use std::{path::PathBuf, time::Duration};
use tracing::{debug, error, info};

const X509_AUTH_SOURCE: &str = "$external";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub message: String,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            message: "Successfully connects to MongoDB".to_string(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Database collaborator. Errors are transport failures and are reported to
/// callers unchanged.
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    async fn aggregate(
        &self,
        pipeline: &ValidatedPipeline,
        options: &AggregateOptions,
    ) -> Result<Vec<Document>>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn check_health(&self) -> HealthStatus;
}

#[derive(Clone)]
pub struct MongoExecutor {
    client: Client,
    database: String,
}

impl MongoExecutor {
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self> {
        let options = client_options(settings).await?;
        let client = Client::with_options(options).context("failed to build MongoDB client")?;
        let executor = Self {
            client,
            database: settings.database.clone(),
        };

        // One-time connectivity check so bad settings show up in the startup logs.
        let health = executor.check_health().await;
        if health.ok {
            info!("database connectivity check succeeded");
        } else {
            error!(message = %health.message, "initial database connectivity check failed");
        }

        Ok(executor)
    }

    fn database(&self) -> Database {
        self.client.database(&self.database)
    }
}

#[async_trait]
impl PipelineExecutor for MongoExecutor {
    async fn aggregate(
        &self,
        pipeline: &ValidatedPipeline,
        options: &AggregateOptions,
    ) -> Result<Vec<Document>> {
        let collection = self
            .database()
            .collection::<Document>(pipeline.collection());
        let cursor = collection
            .aggregate(pipeline.stages().to_vec(), driver_options(options))
            .await?;
        let rows = cursor.try_collect::<Vec<_>>().await?;
        Ok(rows)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = self.database().list_collection_names(None).await?;
        names.sort();
        Ok(names)
    }

    async fn check_health(&self) -> HealthStatus {
        match self.database().run_command(doc! { "dbStats": 1 }, None).await {
            Ok(_) => HealthStatus::healthy(),
            Err(err) => {
                error!(error = %err, "failed to get database status");
                if is_auth_failure(&err) {
                    HealthStatus::failed("Authentication failed")
                } else {
                    HealthStatus::failed(err.to_string())
                }
            }
        }
    }
}

fn is_auth_failure(err: &mongodb::error::Error) -> bool {
    if matches!(*err.kind, ErrorKind::Authentication { .. }) {
        return true;
    }
    let text = err.to_string().to_lowercase();
    text.contains("authenticationfailed") || text.contains("unauthorized")
}

async fn client_options(settings: &ConnectionSettings) -> Result<ClientOptions> {
    let uri = connection_uri(settings)?;
    let mut options = ClientOptions::parse(uri.as_str())
        .await
        .context("invalid MongoDB connection settings")?;

    options.credential = credential(settings)?;

    if settings.tls != TlsOption::Disabled
        && (settings.ca_cert_path.is_some() || settings.client_cert_key_path.is_some())
    {
        let mut tls = TlsOptions::default();
        tls.ca_file_path = settings.ca_cert_path.as_ref().map(PathBuf::from);
        tls.cert_key_file_path = settings.client_cert_key_path.as_ref().map(PathBuf::from);
        options.tls = Some(Tls::Enabled(tls));
    }

    Ok(options)
}

/// `<scheme>://<host>/<database>?<options>` with the `tls`/`ssl` keys
/// rewritten to match the TLS option. Credentials are never embedded.
pub fn connection_uri(settings: &ConnectionSettings) -> Result<String> {
    let host = settings.host.trim();
    if host.is_empty() {
        bail!("missing MongoDB host");
    }

    let raw_options = settings.connection_options.trim();
    let raw_options = raw_options.strip_prefix('?').unwrap_or(raw_options);
    let mut pairs: Vec<(String, String)> = raw_options
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect();

    match settings.tls {
        TlsOption::Enabled => {
            pairs.retain(|(key, _)| key != "ssl");
            pairs.push(("tls".to_string(), "true".to_string()));
        }
        TlsOption::Disabled => {
            pairs.retain(|(key, _)| key != "tls");
            pairs.push(("ssl".to_string(), "false".to_string()));
        }
        TlsOption::Default => pairs.retain(|(key, _)| key != "tls" && key != "ssl"),
    }

    let mut uri = format!(
        "{}://{}/{}",
        settings.scheme.as_str(),
        host,
        settings.database.trim()
    );
    if !pairs.is_empty() {
        let query = pairs
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        uri.push('?');
        uri.push_str(&query);
    }
    Ok(uri)
}

fn credential(settings: &ConnectionSettings) -> Result<Option<Credential>> {
    match settings.auth_method {
        AuthMethod::None => Ok(None),
        AuthMethod::UsernamePassword => {
            let username = settings.username.as_deref().unwrap_or_default();
            let password = settings.password.as_deref().unwrap_or_default();
            if username.is_empty() || password.is_empty() {
                bail!("missing MongoDB username or password");
            }

            let mut credential = Credential::default();
            credential.username = Some(username.to_string());
            credential.password = Some(password.to_string());
            credential.source = settings
                .auth_database
                .clone()
                .filter(|source| !source.is_empty());
            Ok(Some(credential))
        }
        AuthMethod::X509 => {
            let mut credential = Credential::default();
            credential.mechanism = Some(AuthMechanism::MongoDbX509);
            credential.source = Some(X509_AUTH_SOURCE.to_string());
            Ok(Some(credential))
        }
    }
}

/// Maps request options onto the driver's; unset or non-positive numbers are
/// skipped.
pub fn driver_options(options: &AggregateOptions) -> DriverAggregateOptions {
    let mut driver = DriverAggregateOptions::default();

    if let Some(ms) = options.max_time_ms.filter(|ms| *ms > 0) {
        debug!(max_time_ms = ms, "applying aggregate maxTimeMS");
        driver.max_time = Some(Duration::from_millis(ms.unsigned_abs()));
    }
    if let Some(size) = options.batch_size.filter(|size| *size > 0) {
        debug!(batch_size = size, "applying aggregate batchSize");
        driver.batch_size = Some(size.unsigned_abs());
    }
    if let Some(flag) = options.allow_disk_use {
        debug!(allow_disk_use = flag, "applying aggregate allowDiskUse");
        driver.allow_disk_use = Some(flag);
    }
    if let Some(flag) = options.bypass_document_validation {
        debug!(
            bypass_document_validation = flag,
            "applying aggregate bypassDocumentValidation"
        );
        driver.bypass_document_validation = Some(flag);
    }
    if let Some(comment) = options.comment.as_ref().filter(|c| !c.is_empty()) {
        debug!(%comment, "applying aggregate comment");
        driver.comment = Some(comment.clone());
    }
    if let Some(ms) = options.max_await_time_ms.filter(|ms| *ms > 0) {
        debug!(max_await_time_ms = ms, "applying aggregate maxAwaitTime");
        driver.max_await_time = Some(Duration::from_millis(ms.unsigned_abs()));
    }

    driver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionScheme;
    use pretty_assertions::assert_eq;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            host: "localhost:27017".into(),
            database: "metrics".into(),
            ..ConnectionSettings::default()
        }
    }

    #[test]
    fn builds_standard_uri() {
        assert_eq!(
            connection_uri(&settings()).unwrap(),
            "mongodb://localhost:27017/metrics"
        );
    }

    #[test]
    fn builds_srv_uri_with_options() {
        let settings = ConnectionSettings {
            scheme: ConnectionScheme::DnsSeedList,
            host: "cluster0.example.net".into(),
            connection_options: "?retryWrites=true&w=majority".into(),
            ..settings()
        };
        assert_eq!(
            connection_uri(&settings).unwrap(),
            "mongodb+srv://cluster0.example.net/metrics?retryWrites=true&w=majority"
        );
    }

    #[test]
    fn tls_option_rewrites_query_keys() {
        let base = ConnectionSettings {
            connection_options: "tls=false&ssl=true&appName=dash".into(),
            ..settings()
        };

        let enabled = ConnectionSettings {
            tls: TlsOption::Enabled,
            ..base.clone()
        };
        assert_eq!(
            connection_uri(&enabled).unwrap(),
            "mongodb://localhost:27017/metrics?tls=false&appName=dash&tls=true"
        );

        let disabled = ConnectionSettings {
            tls: TlsOption::Disabled,
            ..base.clone()
        };
        assert_eq!(
            connection_uri(&disabled).unwrap(),
            "mongodb://localhost:27017/metrics?ssl=true&appName=dash&ssl=false"
        );

        assert_eq!(
            connection_uri(&base).unwrap(),
            "mongodb://localhost:27017/metrics?appName=dash"
        );
    }

    #[test]
    fn missing_host_is_rejected() {
        let settings = ConnectionSettings {
            host: " ".into(),
            ..settings()
        };
        assert!(connection_uri(&settings).is_err());
    }

    #[test]
    fn username_password_credentials() {
        let mut settings = settings();
        settings.auth_method = AuthMethod::UsernamePassword;
        assert!(credential(&settings).is_err());

        settings.username = Some("reader".into());
        settings.password = Some("secret".into());
        settings.auth_database = Some("admin".into());
        let credential = credential(&settings).unwrap().unwrap();
        assert_eq!(credential.username.as_deref(), Some("reader"));
        assert_eq!(credential.password.as_deref(), Some("secret"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
    }

    #[test]
    fn x509_uses_external_source() {
        let settings = ConnectionSettings {
            auth_method: AuthMethod::X509,
            ..settings()
        };
        let credential = credential(&settings).unwrap().unwrap();
        assert_eq!(credential.mechanism, Some(AuthMechanism::MongoDbX509));
        assert_eq!(credential.source.as_deref(), Some("$external"));
        assert!(credential.username.is_none());
    }

    #[test]
    fn aggregate_options_skip_unset_and_non_positive() {
        let options = AggregateOptions {
            max_time_ms: Some(0),
            batch_size: Some(-1),
            allow_disk_use: Some(true),
            comment: Some("dash".into()),
            max_await_time_ms: Some(250),
            ..AggregateOptions::default()
        };
        let driver = driver_options(&options);
        assert_eq!(driver.max_time, None);
        assert_eq!(driver.batch_size, None);
        assert_eq!(driver.allow_disk_use, Some(true));
        assert_eq!(driver.bypass_document_validation, None);
        assert_eq!(driver.comment.as_deref(), Some("dash"));
        assert_eq!(driver.max_await_time, Some(Duration::from_millis(250)));
    }
}
