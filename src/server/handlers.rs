//! HTTP handlers for the $fhirpath operation endpoints

use crate::ast::{convert_ast_to_lab_format, extract_resource_type};
use crate::server::context::{ContextEvaluationOutcome, evaluate_context_items};
use crate::server::error::{ServerError, ServerResult};
use crate::server::metadata::capability_statement;
use crate::server::models::{
    EvaluationResultSet, EvaluationTiming, OperationOutcome, ParametersResource,
    ParsedServerRequest,
};
use crate::server::registry::ServerRegistry;
use crate::server::response::{
    ParseDebugInfo, ResponseMetadata, build_outcome_response, build_success_response,
};
use crate::server::results::evaluate_expression_for_contexts;
use crate::server::version::ServerFhirVersion;
use axum::{
    body::Bytes,
    extract::{Query, State},
    response::{IntoResponse, Json},
};
use octofhir_fhir_model::TypeInfo;
use octofhir_fhirpath::FhirPathEngine;
use octofhir_fhirpath::parser::{ParsingMode, parse_with_mode, parse_with_semantic_analysis};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Instant;
use tracing::error;

pub async fn metadata_handler() -> Json<JsonValue> {
    Json(capability_statement())
}

pub async fn health_handler(
    State(registry): State<ServerRegistry>,
) -> ServerResult<Json<JsonValue>> {
    let versions: Vec<_> = ServerFhirVersion::all()
        .iter()
        .map(|v| v.as_str().to_string())
        .collect();

    let payload = serde_json::json!({
        "status": "ok",
        "versions": versions,
        "engines": registry.version_count(),
    });

    Ok(Json(payload))
}

pub async fn version_handler() -> Json<JsonValue> {
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn fhirpath_lab_handler(
    State(registry): State<ServerRegistry>,
    body: Bytes,
) -> impl IntoResponse {
    // The unversioned endpoint evaluates against R4.
    dispatch(&registry, ServerFhirVersion::R4, &body).await
}

pub async fn fhirpath_lab_r4_handler(
    State(registry): State<ServerRegistry>,
    body: Bytes,
) -> impl IntoResponse {
    dispatch(&registry, ServerFhirVersion::R4, &body).await
}

pub async fn fhirpath_lab_r4b_handler(
    State(registry): State<ServerRegistry>,
    body: Bytes,
) -> impl IntoResponse {
    dispatch(&registry, ServerFhirVersion::R4B, &body).await
}

pub async fn fhirpath_lab_r5_handler(
    State(registry): State<ServerRegistry>,
    body: Bytes,
) -> impl IntoResponse {
    dispatch(&registry, ServerFhirVersion::R5, &body).await
}

pub async fn fhirpath_lab_r6_handler(
    State(registry): State<ServerRegistry>,
    body: Bytes,
) -> impl IntoResponse {
    dispatch(&registry, ServerFhirVersion::R6, &body).await
}

/// STU3 is routed so the lab UI gets a proper outcome instead of a 404, but
/// the engine stack has no STU3 schemas.
pub async fn fhirpath_lab_stu3_handler() -> impl IntoResponse {
    outcome_json(OperationOutcome::error(
        "not-supported",
        "FHIR STU3 is not supported by this server",
        None,
    ))
}

/// GET form of the operation. Only scalar fields fit in a query string;
/// variables require the POST body.
pub async fn fhirpath_lab_get_handler(
    State(registry): State<ServerRegistry>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    dispatch_query(&registry, ServerFhirVersion::R4, &params).await
}

pub async fn fhirpath_lab_get_r4_handler(
    State(registry): State<ServerRegistry>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    dispatch_query(&registry, ServerFhirVersion::R4, &params).await
}

pub async fn fhirpath_lab_get_r4b_handler(
    State(registry): State<ServerRegistry>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    dispatch_query(&registry, ServerFhirVersion::R4B, &params).await
}

pub async fn fhirpath_lab_get_r5_handler(
    State(registry): State<ServerRegistry>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    dispatch_query(&registry, ServerFhirVersion::R5, &params).await
}

pub async fn fhirpath_lab_get_r6_handler(
    State(registry): State<ServerRegistry>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    dispatch_query(&registry, ServerFhirVersion::R6, &params).await
}

async fn dispatch_query(
    registry: &ServerRegistry,
    version: ServerFhirVersion,
    params: &HashMap<String, String>,
) -> axum::response::Response {
    match request_from_query(params) {
        Ok(request) => match handle_request(registry, version, request).await {
            Ok(response) => response.into_response(),
            Err(error) => error.into_response(),
        },
        Err(error) => error.into_response(),
    }
}

/// Deserialize the POST body by hand so any malformed envelope gets a hard
/// 400 with an `OperationOutcome` body rather than the extractor's plain-text
/// rejection.
async fn dispatch(
    registry: &ServerRegistry,
    version: ServerFhirVersion,
    body: &[u8],
) -> axum::response::Response {
    let request: ParametersResource = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(error) => {
            return ServerError::BadRequest {
                message: format!("Invalid Parameters request body: {}", error),
            }
            .into_response();
        }
    };

    let parsed_request = match request.parse_request() {
        Ok(parsed) => parsed,
        Err(error) => {
            return ServerError::from(error).into_response();
        }
    };

    match handle_request(registry, version, parsed_request).await {
        Ok(response) => response.into_response(),
        Err(error) => error.into_response(),
    }
}

fn request_from_query(params: &HashMap<String, String>) -> ServerResult<ParsedServerRequest> {
    let expression = params
        .get("expression")
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ServerError::BadRequest {
            message: "Missing required 'expression' query parameter".to_string(),
        })?;

    // A query string cannot carry much of a resource; when absent, evaluation
    // runs against an empty input.
    let resource: JsonValue = match params.get("resource") {
        Some(text) => serde_json::from_str(text).map_err(|e| ServerError::BadRequest {
            message: format!("The 'resource' query parameter is not valid JSON: {}", e),
        })?,
        None => JsonValue::Object(serde_json::Map::new()),
    };

    let flag = |name: &str| {
        params
            .get(name)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    };

    Ok(ParsedServerRequest {
        expression,
        resource,
        context: params.get("context").cloned().filter(|c| !c.is_empty()),
        validate: flag("validate"),
        debug_trace: flag("debug_trace") || flag("debugTrace"),
        variables: Vec::new(),
        terminology_server: params
            .get("terminologyserver")
            .or_else(|| params.get("terminologyServer"))
            .cloned(),
    })
}

async fn handle_request(
    registry: &ServerRegistry,
    version: ServerFhirVersion,
    parsed_request: ParsedServerRequest,
) -> Result<Json<JsonValue>, ServerError> {
    let custom_engine;
    let pooled_guard;
    let engine: &FhirPathEngine =
        if let Some(url) = parsed_request.terminology_server.as_deref() {
            custom_engine = registry.create_engine_with_terminology(version, url).await?;
            &custom_engine
        } else {
            let engine_arc = match registry.get_evaluation_engine(version) {
                Some(engine) => engine,
                None => {
                    return Ok(outcome_json(OperationOutcome::error(
                        "not-supported",
                        &format!("FHIR version {} not available", version),
                        None,
                    )));
                }
            };
            pooled_guard = engine_arc.lock_owned().await;
            &pooled_guard
        };

    let model_provider = engine.get_model_provider();

    let parse_start = Instant::now();
    let parse_result = parse_with_mode(&parsed_request.expression, ParsingMode::Analysis);

    if let Some(outcome) =
        parse_error_outcome(&parsed_request.expression, &parse_result.diagnostics)
    {
        return Ok(outcome_json(outcome));
    }

    let ast = match &parse_result.ast {
        Some(ast) => ast,
        None => {
            return Ok(outcome_json(OperationOutcome::error(
                "invalid",
                "Parsing failed without AST",
                None,
            )));
        }
    };

    let lab_ast = convert_ast_to_lab_format(ast);

    let resource_type = extract_resource_type(&parsed_request.resource);
    let expression_has_explicit_resource =
        expression_has_explicit_resource_head(&parsed_request.expression, resource_type.as_deref());
    let parse_time = parse_start.elapsed();

    let analysis_start = Instant::now();
    let resource_type_info: Option<TypeInfo> = if let Some(ref name) = resource_type {
        match model_provider.get_type(name).await {
            Ok(info) => info,
            Err(error) => return Err(ServerError::Model(error)),
        }
    } else {
        None
    };

    let mut context_semantic_root: Option<TypeInfo> = None;
    if let Some(context_expr) = parsed_request.context.as_deref() {
        let context_semantic = parse_with_semantic_analysis(
            context_expr,
            model_provider.clone(),
            resource_type_info.clone(),
        )
        .await;

        // Context analysis issues ride along in the response; they are not
        // fatal to evaluation.
        context_semantic_root = context_semantic.analysis.root_type.clone();
    }

    let context_evaluation = match evaluate_context_items(engine, &parsed_request).await {
        Ok(outcome) => outcome,
        Err(ServerError::Evaluation(eval_error)) => {
            return Ok(outcome_json(OperationOutcome::error(
                "exception",
                &format!(
                    "Failed to evaluate context expression: {}",
                    parsed_request.context.as_deref().unwrap_or("")
                ),
                Some(eval_error.to_string()),
            )));
        }
        Err(other) => return Err(other),
    };
    let ContextEvaluationOutcome {
        items: context_items,
        duration: context_duration,
    } = context_evaluation;

    let mut context_type = if expression_has_explicit_resource {
        resource_type_info.clone()
    } else if let Some(ref root) = context_semantic_root {
        Some(root.clone())
    } else if let Some(first_item) = context_items.first() {
        Some(first_item.value.type_info().as_ref().clone())
    } else {
        resource_type_info.clone()
    };

    if context_type.is_none() {
        context_type = resource_type_info.clone();
    }

    let mut semantic_result = parse_with_semantic_analysis(
        &parsed_request.expression,
        model_provider.clone(),
        context_type,
    )
    .await;

    if !semantic_result.analysis.success && expression_has_explicit_resource {
        let fallback =
            parse_with_semantic_analysis(&parsed_request.expression, model_provider.clone(), None)
                .await;

        if fallback.analysis.success {
            semantic_result = fallback;
        }
    }

    let semantic_diagnostics = semantic_result.analysis.diagnostics.clone();

    let expected_return_type = semantic_result
        .analysis
        .root_type
        .as_ref()
        .map(|type_info| type_info.type_name.clone());

    let analysis_time = analysis_start.elapsed();

    let evaluation_outcome =
        match evaluate_expression_for_contexts(engine, &parsed_request, &context_items).await {
            Ok(outcome) => outcome,
            Err(ServerError::Evaluation(eval_error)) => {
                return Ok(outcome_json(OperationOutcome::error(
                    "exception",
                    &format!("Failed to evaluate: {}", parsed_request.expression),
                    Some(eval_error.to_string()),
                )));
            }
            Err(other) => return Err(other),
        };

    let timing = EvaluationTiming {
        parse: parse_time + analysis_time,
        evaluation: context_duration + evaluation_outcome.evaluation_time,
        total: parse_time + analysis_time + context_duration + evaluation_outcome.evaluation_time,
    };

    let evaluation = EvaluationResultSet {
        contexts: evaluation_outcome.contexts,
        timing,
    };

    let parse_debug_tree =
        serde_json::to_string_pretty(&lab_ast).unwrap_or_else(|_| "{}".to_string());
    let parse_debug = ParseDebugInfo {
        summary: format!(
            "{} : {}",
            parsed_request.expression,
            expected_return_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string())
        ),
        tree: parse_debug_tree,
    };

    let evaluator_label = evaluator_label(version);
    let metadata = ResponseMetadata {
        evaluator_label: &evaluator_label,
        expected_return_type,
        parse_debug: &parse_debug,
        semantic_diagnostics: &semantic_diagnostics,
    };

    let response = build_success_response(&parsed_request, &evaluation, metadata);
    let json = serde_json::to_value(response)?;
    Ok(Json(json))
}

fn expression_has_explicit_resource_head(expression: &str, resource_type: Option<&str>) -> bool {
    let trimmed = expression.trim_start();
    if let Some(resource) = resource_type
        && trimmed.starts_with(resource)
    {
        let next_char = trimmed.chars().nth(resource.len());
        return next_char
            .map(|c| c == '.' || c == '[' || c.is_whitespace())
            .unwrap_or(true);
    }
    false
}

fn evaluator_label(version: ServerFhirVersion) -> String {
    format!(
        "{}-{} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        version.as_str()
    )
}

fn parse_error_outcome(
    expression: &str,
    diagnostics: &[octofhir_fhirpath::diagnostics::Diagnostic],
) -> Option<OperationOutcome> {
    use octofhir_fhirpath::diagnostics::DiagnosticSeverity;

    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|diag| matches!(diag.severity, DiagnosticSeverity::Error))
        .collect();

    if errors.is_empty() {
        return None;
    }

    let summary = errors
        .iter()
        .map(|diag| {
            if let Some(location) = &diag.location {
                format!("{} at {}:{}", diag.message, location.line, location.column)
            } else {
                diag.message.clone()
            }
        })
        .collect::<Vec<_>>()
        .join("; ");

    Some(OperationOutcome::error(
        "invalid",
        &format!("Failed to parse expression: {}", expression),
        Some(summary),
    ))
}

/// Failures after envelope validation still answer 200, with the outcome
/// embedded in the `Parameters` body the way the lab UI expects.
fn outcome_json(outcome: OperationOutcome) -> Json<JsonValue> {
    let response = build_outcome_response(outcome);
    Json(serde_json::to_value(response).unwrap_or_else(|serialize_error| {
        error!("Failed to serialize outcome response: {}", serialize_error);
        serde_json::json!({ "resourceType": "Parameters", "parameter": [] })
    }))
}

#[cfg(test)]
mod tests {
    use super::{expression_has_explicit_resource_head, request_from_query};
    use std::collections::HashMap;

    #[test]
    fn detects_matching_resource_head() {
        assert!(expression_has_explicit_resource_head(
            "Patient.name",
            Some("Patient")
        ));
        assert!(expression_has_explicit_resource_head(
            "Observation.code.system",
            Some("Observation")
        ));
        assert!(expression_has_explicit_resource_head(
            "Patient ",
            Some("Patient")
        ));
    }

    #[test]
    fn rejects_non_matching_or_missing_head() {
        assert!(!expression_has_explicit_resource_head(
            "name.given",
            Some("Patient")
        ));
        assert!(!expression_has_explicit_resource_head(
            "Patient.name",
            Some("Observation")
        ));
        assert!(!expression_has_explicit_resource_head(
            "%context.name",
            Some("Patient")
        ));
    }

    #[test]
    fn query_request_requires_expression_only() {
        let params = HashMap::new();
        assert!(request_from_query(&params).is_err());

        let mut params = HashMap::new();
        params.insert("expression".to_string(), "name.given".to_string());
        let bare = request_from_query(&params).expect("request without resource");
        assert!(bare.resource.as_object().is_some_and(|o| o.is_empty()));

        params.insert(
            "resource".to_string(),
            "{\"resourceType\":\"Patient\"}".to_string(),
        );
        let request = request_from_query(&params).expect("request");
        assert_eq!(request.expression, "name.given");
        assert_eq!(request.resource["resourceType"], "Patient");
        assert!(!request.debug_trace);
    }

    #[test]
    fn query_request_reads_flags_and_terminology() {
        let mut params = HashMap::new();
        params.insert("expression".to_string(), "id".to_string());
        params.insert("resource".to_string(), "{}".to_string());
        params.insert("debug_trace".to_string(), "true".to_string());
        params.insert(
            "terminologyserver".to_string(),
            "https://tx.example.org/r4".to_string(),
        );

        let request = request_from_query(&params).expect("request");
        assert!(request.debug_trace);
        assert_eq!(
            request.terminology_server.as_deref(),
            Some("https://tx.example.org/r4")
        );
    }
}
