//! Pipeline assembly: per-target translation, batch disposition and execution.
//!
//! A target moves `Received -> Parsed -> Substituted -> Validated -> Ready`;
//! any step may instead end it in `Failed`. Targets never affect each other,
//! except that streaming and non-streaming targets cannot share a batch.

mod frame;
mod stream;
mod timeseries;
mod variable;

pub use frame::{table_frame, Field, FieldType, Frame};
pub use stream::{live_channel, pipeline_channel, StreamChannel, CHANNEL_NAMESPACE};
pub use timeseries::timeseries_frames;
pub use variable::{metric_values, MetricFindValue, VariableQuery};

use crate::{
    catalog::StageOperatorCatalog,
    config::AppConfig,
    db::{HealthStatus, PipelineExecutor},
    error::{Result, ServiceError, TargetError, TranslateError},
    models::{QueryLanguage, QueryTarget, QueryType},
    parser::{self, CanonicalPipeline},
    sandbox::{CancelFlag, Sandbox},
    schema::{self, ValidatedPipeline, ValidationMode},
    time::TimeRange,
    variables::{self, TemplateSrv, VariableInterpolator},
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{debug, debug_span, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetState {
    Received,
    Parsed,
    Substituted,
    Validated,
    Ready,
    Failed,
}

/// Terminal result for one target. `reached` is the last state passed before
/// the target became `Ready` or `Failed`.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub ref_id: String,
    pub reached: TargetState,
    pub result: std::result::Result<ValidatedPipeline, TranslateError>,
}

impl TargetOutcome {
    pub fn state(&self) -> TargetState {
        if self.result.is_ok() {
            TargetState::Ready
        } else {
            TargetState::Failed
        }
    }

    fn target_error(&self) -> Option<TargetError> {
        self.result.as_ref().err().map(|err| TargetError {
            ref_id: self.ref_id.clone(),
            kind: err.kind(),
            error: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDisposition {
    AllReady,
    Mixed,
    AllFailed,
}

/// Outcomes in request order.
#[derive(Debug, Clone)]
pub struct BatchTranslation {
    pub outcomes: Vec<TargetOutcome>,
}

impl BatchTranslation {
    pub fn disposition(&self) -> BatchDisposition {
        let ready = self
            .outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .count();
        if ready == self.outcomes.len() {
            BatchDisposition::AllReady
        } else if ready == 0 {
            BatchDisposition::AllFailed
        } else {
            BatchDisposition::Mixed
        }
    }

    /// Rejects a batch in which every target failed, with one error per target.
    pub fn into_forwardable(self) -> Result<Vec<TargetOutcome>> {
        if self.disposition() == BatchDisposition::AllFailed {
            let errors = self
                .outcomes
                .iter()
                .filter_map(TargetOutcome::target_error)
                .collect();
            return Err(ServiceError::AllTargetsFailed(errors));
        }
        Ok(self.outcomes)
    }
}

/// Streaming and non-streaming targets use different transports and cannot be
/// mixed in one request.
pub fn ensure_uniform_streaming(targets: &[QueryTarget]) -> Result<()> {
    let streaming = targets.iter().filter(|target| target.is_streaming).count();
    if streaming > 0 && streaming < targets.len() {
        return Err(ServiceError::StreamingModeConflict);
    }
    Ok(())
}

/// Turns query targets into validated pipelines. Holds no per-request state.
#[derive(Clone)]
pub struct Translator {
    catalog: &'static StageOperatorCatalog,
    sandbox: Sandbox,
    mode: ValidationMode,
    templates: Arc<dyn TemplateSrv>,
}

impl Translator {
    pub fn new(catalog: &'static StageOperatorCatalog, sandbox: Sandbox) -> Self {
        Self {
            catalog,
            sandbox,
            mode: ValidationMode::default(),
            templates: Arc::new(VariableInterpolator),
        }
    }

    pub fn with_mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateSrv>) -> Self {
        self.templates = templates;
        self
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Selects the surface-language strategy for the target.
    pub fn parse(
        &self,
        target: &QueryTarget,
        cancel: &CancelFlag,
    ) -> std::result::Result<CanonicalPipeline, TranslateError> {
        match target.query_language {
            QueryLanguage::Json => parser::parse_json(&target.query_text),
            QueryLanguage::LegacyJs => parser::parse_legacy_js(&target.query_text),
            QueryLanguage::SandboxedJs => self.evaluate_script(target, cancel),
        }
    }

    fn evaluate_script(
        &self,
        target: &QueryTarget,
        cancel: &CancelFlag,
    ) -> std::result::Result<CanonicalPipeline, TranslateError> {
        if target.query_text.trim().is_empty() {
            return Err(TranslateError::EmptyQuery);
        }
        let script =
            variables::interpolate_script(&target.query_text, target, self.templates.as_ref());
        let json = self.sandbox.evaluate(&script, cancel)?;
        parser::parse_json(&json)
    }

    pub fn translate_target(&self, target: &QueryTarget, cancel: &CancelFlag) -> TargetOutcome {
        let span = debug_span!(
            "target",
            ref_id = %target.ref_id,
            language = target.query_language.as_str()
        );
        let _entered = span.enter();

        let mut reached = TargetState::Received;
        let result = self.advance(target, cancel, &mut reached);
        match &result {
            Ok(pipeline) => debug!(collection = pipeline.collection(), "target ready"),
            Err(err) => debug!(?reached, kind = err.kind(), error = %err, "target failed"),
        }

        TargetOutcome {
            ref_id: target.ref_id.clone(),
            reached,
            result,
        }
    }

    fn advance(
        &self,
        target: &QueryTarget,
        cancel: &CancelFlag,
        reached: &mut TargetState,
    ) -> std::result::Result<ValidatedPipeline, TranslateError> {
        if cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }

        let parsed = self.parse(target, cancel)?;
        *reached = TargetState::Parsed;

        let collection = parsed
            .collection
            .clone()
            .or_else(|| target.explicit_collection().map(str::to_string));
        let substituted =
            variables::substitute(&parsed.pipeline_text, target, self.templates.as_ref());
        *reached = TargetState::Substituted;

        let validated =
            schema::validate_pipeline(substituted, collection.as_deref(), self.catalog, self.mode)?;
        *reached = TargetState::Validated;
        Ok(validated)
    }

    /// Translates every target in order. Cancelled targets fail; targets that
    /// were already ready stay ready.
    pub fn translate_batch(
        &self,
        targets: &[QueryTarget],
        cancel: &CancelFlag,
    ) -> Result<BatchTranslation> {
        ensure_uniform_streaming(targets)?;
        let outcomes = targets
            .iter()
            .map(|target| self.translate_target(target, cancel))
            .collect();
        Ok(BatchTranslation { outcomes })
    }

    /// Editor check: parse and validate without substitution or a collection.
    pub fn check(
        &self,
        language: QueryLanguage,
        text: &str,
        mode: ValidationMode,
        cancel: &CancelFlag,
    ) -> std::result::Result<usize, TranslateError> {
        let target = QueryTarget::new("editor", language, text);
        let parsed = self.parse(&target, cancel)?;
        schema::validate(&parsed.pipeline_text, self.catalog, mode).map(|stages| stages.len())
    }
}

/// Raises the cancel flag when the owning request future is dropped early.
struct CancelOnDrop {
    flag: CancelFlag,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: CancelFlag) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            debug!("request dropped, cancelling translation");
            self.flag.cancel();
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    pub targets: Vec<QueryTarget>,
    #[serde(default)]
    pub live_streaming: bool,
    /// Defaults for targets that do not carry their own.
    #[serde(default)]
    pub range: Option<TimeRange>,
    #[serde(default)]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub scoped_vars: HashMap<String, Value>,
}

impl QueryRequest {
    fn resolved_targets(&self) -> Vec<QueryTarget> {
        self.targets
            .iter()
            .cloned()
            .map(|mut target| {
                target.range = target.range.or(self.range);
                target.interval_ms = target.interval_ms.or(self.interval_ms);
                for (name, value) in &self.scoped_vars {
                    target
                        .variables
                        .entry(name.clone())
                        .or_insert_with(|| value.clone());
                }
                target
            })
            .collect()
    }

    fn request_id(&self) -> String {
        self.request_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

pub type TranslateRequest = QueryRequest;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    pub ref_id: String,
    pub state: TargetState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<Frame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetResult {
    fn ready(ref_id: String) -> Self {
        Self {
            ref_id,
            state: TargetState::Ready,
            frames: Vec::new(),
            channel: None,
            kind: None,
            error: None,
        }
    }

    fn failed(ref_id: String, err: &TranslateError) -> Self {
        Self {
            ref_id,
            state: TargetState::Failed,
            frames: Vec::new(),
            channel: None,
            kind: Some(err.kind()),
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub request_id: String,
    pub results: Vec<TargetResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatedTarget {
    pub ref_id: String,
    pub state: TargetState,
    pub reached: TargetState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TargetOutcome> for TranslatedTarget {
    fn from(outcome: &TargetOutcome) -> Self {
        let (collection, pipeline, kind, error) = match &outcome.result {
            Ok(pipeline) => (
                Some(pipeline.collection().to_string()),
                Some(pipeline.pipeline_text().to_string()),
                None,
                None,
            ),
            Err(err) => (None, None, Some(err.kind()), Some(err.to_string())),
        };
        Self {
            ref_id: outcome.ref_id.clone(),
            state: outcome.state(),
            reached: outcome.reached,
            collection,
            pipeline,
            kind,
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateResponse {
    pub request_id: String,
    pub targets: Vec<TranslatedTarget>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    #[serde(default)]
    pub query_language: QueryLanguage,
    #[serde(default)]
    pub query_text: String,
    #[serde(default)]
    pub mode: Option<ValidationMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<std::result::Result<usize, TranslateError>> for ValidateResponse {
    fn from(result: std::result::Result<usize, TranslateError>) -> Self {
        match result {
            Ok(stages) => Self {
                ok: true,
                stages: Some(stages),
                stage: None,
                kind: None,
                error: None,
            },
            Err(err) => Self {
                ok: false,
                stages: None,
                stage: match &err {
                    TranslateError::SchemaViolation { stage, .. } => *stage,
                    _ => None,
                },
                kind: Some(err.kind()),
                error: Some(err.to_string()),
            },
        }
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    translator: Arc<Translator>,
    executor: Arc<dyn PipelineExecutor>,
    config: Arc<AppConfig>,
}

impl QueryEngine {
    pub fn new(
        translator: Translator,
        executor: Arc<dyn PipelineExecutor>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            translator: Arc::new(translator),
            executor,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Runs `work` on the blocking pool with a cancel flag that is raised if
    /// the caller stops waiting.
    async fn run_blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Translator, &CancelFlag) -> T + Send + 'static,
    {
        let cancel = CancelFlag::new();
        let mut guard = CancelOnDrop::new(cancel.clone());
        let translator = Arc::clone(&self.translator);
        let output = tokio::task::spawn_blocking(move || work(&translator, &cancel))
            .await
            .map_err(|err| anyhow::anyhow!("translation task failed: {err}"))?;
        guard.disarm();
        Ok(output)
    }

    async fn with_timeout<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.request_timeout;
        tokio::time::timeout(limit, work)
            .await
            .map_err(|_| ServiceError::Timeout(limit))?
    }

    async fn translate_targets(&self, targets: Vec<QueryTarget>) -> Result<BatchTranslation> {
        self.run_blocking(move |translator, cancel| translator.translate_batch(&targets, cancel))
            .await?
    }

    pub async fn translate(&self, request: TranslateRequest) -> Result<TranslateResponse> {
        let request_id = request.request_id();
        let span = info_span!("translate", request_id = %request_id);
        let targets = request.resolved_targets();

        async move {
            let batch = self.with_timeout(self.translate_targets(targets)).await?;
            let targets = batch.outcomes.iter().map(TranslatedTarget::from).collect();
            Ok(TranslateResponse {
                request_id,
                targets,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn execute_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let request_id = request.request_id();
        let span = info_span!("query", request_id = %request_id);
        let targets = request.resolved_targets();
        let live = request.live_streaming;

        async move {
            let results = self
                .with_timeout(self.run_targets(targets, live))
                .await?;
            Ok(QueryResponse {
                request_id,
                results,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_targets(&self, targets: Vec<QueryTarget>, live: bool) -> Result<Vec<TargetResult>> {
        let streaming = live || (!targets.is_empty() && targets.iter().all(|t| t.is_streaming));
        let batch = self.translate_targets(targets.clone()).await?;
        let outcomes = batch.into_forwardable()?;

        if streaming {
            info!(targets = outcomes.len(), live, "returning stream channels");
            return Ok(outcomes
                .iter()
                .map(|outcome| match &outcome.result {
                    Ok(pipeline) => TargetResult {
                        channel: Some(if live {
                            live_channel(&outcome.ref_id)
                        } else {
                            pipeline_channel(pipeline.collection(), pipeline.pipeline_text())
                        }),
                        ..TargetResult::ready(outcome.ref_id.clone())
                    },
                    Err(err) => TargetResult::failed(outcome.ref_id.clone(), err),
                })
                .collect());
        }

        let runs = targets
            .iter()
            .zip(outcomes.iter())
            .map(|(target, outcome)| self.execute_target(target, outcome));
        let results = join_all(runs).await;
        info!(targets = results.len(), "query batch finished");
        Ok(results)
    }

    async fn execute_target(&self, target: &QueryTarget, outcome: &TargetOutcome) -> TargetResult {
        let ref_id = outcome.ref_id.clone();
        let pipeline = match &outcome.result {
            Ok(pipeline) => pipeline,
            Err(err) => return TargetResult::failed(ref_id, err),
        };

        let frames = self
            .executor
            .aggregate(pipeline, &target.options)
            .await
            .map_err(|err| {
                warn!(ref_id = %ref_id, error = %err, "aggregate failed");
                TranslateError::Database(err.to_string())
            })
            .and_then(|rows| match target.query_type {
                QueryType::Table => table_frame(&rows).map(|frame| vec![frame]),
                QueryType::Timeseries => timeseries_frames(&rows),
            });

        match frames {
            Ok(frames) => TargetResult {
                frames: frames
                    .into_iter()
                    .map(|frame| frame.with_ref_id(ref_id.clone()))
                    .collect(),
                ..TargetResult::ready(ref_id)
            },
            Err(err) => TargetResult::failed(ref_id, &err),
        }
    }

    pub async fn validate(&self, request: ValidateRequest) -> Result<ValidateResponse> {
        let mode = request.mode.unwrap_or(ValidationMode::Strict);
        let result = self
            .with_timeout(self.run_blocking(move |translator, cancel| {
                translator.check(request.query_language, &request.query_text, mode, cancel)
            }))
            .await?;
        Ok(ValidateResponse::from(result))
    }

    pub async fn metric_find(&self, query: VariableQuery) -> Result<Vec<MetricFindValue>> {
        let id = Uuid::new_v4().simple().to_string();
        let target = query.to_target(&id[..8]);
        let response = self
            .execute_query(QueryRequest {
                request_id: Some(target.ref_id.clone()),
                targets: vec![target],
                ..QueryRequest::default()
            })
            .await?;

        let Some(result) = response.results.into_iter().next() else {
            return Ok(Vec::new());
        };
        if let Some(error) = result.error {
            return Err(ServiceError::InvalidRequest(error));
        }
        match result.frames.first() {
            Some(frame) => {
                metric_values(frame).map_err(|err| ServiceError::InvalidRequest(err.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn collections(&self) -> Result<Vec<String>> {
        self.executor
            .list_collections()
            .await
            .map_err(|err| ServiceError::Database(err.to_string()))
    }

    pub async fn health(&self) -> HealthStatus {
        self.executor.check_health().await
    }
}
