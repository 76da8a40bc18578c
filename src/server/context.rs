//! Context-expression evaluation
//!
//! The optional `context` parameter selects the items the main expression is
//! evaluated against. Each selected item gets a path into the subject
//! resource so the lab UI can highlight it.

use crate::server::error::ServerResult;
use crate::server::models::{
    ContextItem, Parameter, ParsedServerRequest, fhir_value_to_json, path_segments_to_string,
};
use crate::server::paths::PathMatcher;
use octofhir_fhirpath::FhirPathEngine;
use octofhir_fhirpath::core::trace::SharedTraceProvider;
use octofhir_fhirpath::core::{Collection, FhirPathValue};
use octofhir_fhirpath::evaluator::EvaluationContext;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct ContextEvaluationOutcome {
    pub items: Vec<ContextItem>,
    pub duration: Duration,
}

/// Assemble an evaluation context from the engine's providers, binding the
/// request variables so they resolve as `%name`.
pub(crate) async fn build_evaluation_context(
    engine: &FhirPathEngine,
    input: Collection,
    trace_provider: Option<SharedTraceProvider>,
    variables: &[Parameter],
) -> EvaluationContext {
    let model_provider = engine.get_model_provider();
    let context = EvaluationContext::new(
        input,
        model_provider.clone(),
        engine.get_terminology_provider(),
        engine.get_validation_provider(),
        trace_provider,
    );

    for parameter in variables {
        let value = parameter
            .to_fhirpath_value(Some(model_provider.clone()))
            .await;
        context.set_variable(parameter.name.clone(), value);
    }

    context
}

async fn subject_value(engine: &FhirPathEngine, request: &ParsedServerRequest) -> FhirPathValue {
    FhirPathValue::resource_with_model_provider(
        request.resource.clone(),
        Some(engine.get_model_provider()),
    )
    .await
    .unwrap_or_else(|_| FhirPathValue::resource(request.resource.clone()))
}

/// Evaluate the optional context expression and produce the items the main
/// expression runs against.
pub async fn evaluate_context_items(
    engine: &FhirPathEngine,
    request: &ParsedServerRequest,
) -> ServerResult<ContextEvaluationOutcome> {
    let subject = subject_value(engine, request).await;
    let resource_type = request
        .resource
        .get("resourceType")
        .and_then(|v| v.as_str())
        .unwrap_or("Resource");

    let Some(context_expr) = request.context.as_deref() else {
        return Ok(ContextEvaluationOutcome {
            items: vec![ContextItem {
                value: subject,
                path: Some(resource_type.to_string()),
                path_segments: Vec::new(),
                index: 0,
            }],
            duration: Duration::ZERO,
        });
    };

    let evaluation_context = build_evaluation_context(
        engine,
        Collection::single(subject),
        None,
        &request.variables,
    )
    .await;

    let start = Instant::now();
    let evaluation = engine
        .evaluate_with_metadata(context_expr, &evaluation_context)
        .await?;
    let duration = start.elapsed();

    let mut matcher = PathMatcher::new();
    let mut items = Vec::new();
    for (index, value) in evaluation.result.value.iter().cloned().enumerate() {
        let value_json = fhir_value_to_json(value.clone());
        let located = matcher.claim(&request.resource, &value_json).or_else(|| {
            (matches!(value, FhirPathValue::Resource(_, _, _)) && value_json == request.resource)
                .then(Vec::new)
        });

        let item = match located {
            Some(segments) => ContextItem {
                path: Some(path_segments_to_string(resource_type, &segments)),
                path_segments: segments,
                value,
                index,
            },
            None => ContextItem {
                path: Some(fallback_context_path(resource_type, context_expr, index)),
                path_segments: Vec::new(),
                value,
                index,
            },
        };
        items.push(item);
    }

    debug!(
        "Context expression '{}' selected {} item(s) in {:?}",
        context_expr,
        items.len(),
        duration
    );

    Ok(ContextEvaluationOutcome { items, duration })
}

/// Path shown when a context item has no structural match in the resource.
fn fallback_context_path(resource_type: &str, context_expr: &str, index: usize) -> String {
    let base = if context_expr.is_empty() {
        resource_type.to_string()
    } else if context_expr.starts_with('%') || context_expr.starts_with(resource_type) {
        context_expr.to_string()
    } else if context_expr.starts_with('.') {
        format!("{resource_type}{context_expr}")
    } else {
        format!("{resource_type}.{context_expr}")
    };
    format!("{base}[{index}]")
}
