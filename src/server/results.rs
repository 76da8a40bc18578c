//! Expression evaluation against each context item

use crate::server::context::build_evaluation_context;
use crate::server::error::ServerResult;
use crate::server::models::{
    ContextItem, ContextualResult, EvaluationResultItem, ParsedServerRequest, fhir_value_to_json,
    path_segments_to_string,
};
use crate::server::paths::PathMatcher;
use crate::server::trace::LabTraceProvider;
use octofhir_fhirpath::FhirPathEngine;
use octofhir_fhirpath::core::trace::SharedTraceProvider;
use octofhir_fhirpath::core::{Collection, FhirPathValue};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ExpressionEvaluationOutcome {
    pub contexts: Vec<ContextualResult>,
    pub evaluation_time: Duration,
}

/// Evaluate the request expression once per context item. Each item gets its
/// own trace provider so traces stay attached to the result they belong to.
pub async fn evaluate_expression_for_contexts(
    engine: &FhirPathEngine,
    request: &ParsedServerRequest,
    context_items: &[ContextItem],
) -> ServerResult<ExpressionEvaluationOutcome> {
    let resource_type = request
        .resource
        .get("resourceType")
        .and_then(|v| v.as_str())
        .unwrap_or("Resource");

    let started = Instant::now();
    let mut contexts = Vec::with_capacity(context_items.len());

    for context_item in context_items {
        let tracer = request
            .debug_trace
            .then(|| Arc::new(LabTraceProvider::new()));

        let evaluation_context = build_evaluation_context(
            engine,
            Collection::single(context_item.value.clone()),
            tracer.clone().map(|t| t as SharedTraceProvider),
            &request.variables,
        )
        .await;

        let evaluation = engine
            .evaluate_with_metadata(&request.expression, &evaluation_context)
            .await?;

        let context_json = fhir_value_to_json(context_item.value.clone());
        let mut matcher = PathMatcher::new();
        let results = evaluation
            .result
            .value
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, value)| {
                resolve_result(
                    &context_json,
                    context_item,
                    resource_type,
                    value,
                    index,
                    &mut matcher,
                )
            })
            .collect();

        contexts.push(ContextualResult {
            context: context_item.clone(),
            results,
            traces: tracer.map(|t| t.outputs()).unwrap_or_default(),
        });
    }

    Ok(ExpressionEvaluationOutcome {
        contexts,
        evaluation_time: started.elapsed(),
    })
}

/// Map one result value back into the subject resource. The value is located
/// inside the context item's JSON, then its path is extended from the context
/// item's own segments. Values with no structural match get an indexed
/// `#n` suffix on the context path.
fn resolve_result(
    context_json: &JsonValue,
    context_item: &ContextItem,
    resource_type: &str,
    value: FhirPathValue,
    index: usize,
    matcher: &mut PathMatcher,
) -> EvaluationResultItem {
    let value_json = fhir_value_to_json(value.clone());
    let located = matcher.claim(context_json, &value_json).or_else(|| {
        (matches!(value, FhirPathValue::Resource(_, _, _)) && &value_json == context_json)
            .then(Vec::new)
    });

    let (path_segments, path) = match located {
        Some(relative) => {
            let mut segments = context_item.path_segments.clone();
            segments.extend(relative);
            let path = path_segments_to_string(resource_type, &segments);
            (segments, Some(path))
        }
        None => {
            let base = context_item.path.as_deref().unwrap_or(resource_type);
            (
                context_item.path_segments.clone(),
                Some(format!("{base}#{index}")),
            )
        }
    };

    EvaluationResultItem {
        datatype: value.display_type_name(),
        value,
        path,
        path_segments,
        index,
    }
}
