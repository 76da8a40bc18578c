//! Assembly of the `Parameters` response the lab UI consumes

use crate::server::models::{
    ContextItem, ContextualResult, DecimalInput, EvaluationResultItem, EvaluationResultSet,
    Extension, ExtensionValue, OperationOutcome, Parameter, ParameterValue, ParametersResource,
    ParsedServerRequest, TraceOutput, TracePart, path_segments_to_string,
};
use octofhir_fhirpath::FhirPathValue;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue, json};
use std::time::Duration;

const JSON_VALUE_EXTENSION_URL: &str = "http://fhir.forms-lab.com/StructureDefinition/json-value";
const RESOURCE_PATH_EXTENSION_URL: &str =
    "http://fhir.forms-lab.com/StructureDefinition/resource-path";

pub struct ParseDebugInfo {
    pub summary: String,
    pub tree: String,
}

pub struct ResponseMetadata<'a> {
    pub evaluator_label: &'a str,
    pub expected_return_type: Option<String>,
    pub parse_debug: &'a ParseDebugInfo,
    pub semantic_diagnostics: &'a [octofhir_fhirpath::diagnostics::Diagnostic],
}

fn param(name: impl Into<String>, value: ParameterValue) -> Parameter {
    Parameter {
        name: name.into(),
        value,
        ..Parameter::empty()
    }
}

fn group(name: impl Into<String>, part: Vec<Parameter>) -> Parameter {
    Parameter {
        name: name.into(),
        part,
        ..Parameter::empty()
    }
}

fn string_value(text: impl Into<String>) -> ParameterValue {
    ParameterValue {
        value_string: Some(text.into()),
        ..ParameterValue::default()
    }
}

fn millis_param(name: impl Into<String>, duration: Duration) -> Parameter {
    let millis = duration.as_secs_f64() * 1000.0;
    param(
        name,
        ParameterValue {
            value_decimal: Some(DecimalInput::Number(
                JsonNumber::from_f64(millis).unwrap_or_else(|| JsonNumber::from(0)),
            )),
            ..ParameterValue::default()
        },
    )
}

pub fn build_success_response(
    request: &ParsedServerRequest,
    evaluation: &EvaluationResultSet,
    metadata: ResponseMetadata,
) -> ParametersResource {
    let mut parameter = vec![build_metadata_part(request, evaluation, metadata)];
    parameter.extend(
        evaluation
            .contexts
            .iter()
            .map(|contextual| build_result_parameter(request, contextual)),
    );

    ParametersResource {
        resource_type: "Parameters".to_string(),
        id: Some("fhirpath".to_string()),
        parameter,
    }
}

/// Wrap an `OperationOutcome` in the response envelope so failures travel in
/// a 200 body the UI can render next to the echoed request.
pub fn build_outcome_response(outcome: OperationOutcome) -> ParametersResource {
    let outcome_json = serde_json::to_value(&outcome)
        .unwrap_or_else(|_| json!({ "resourceType": "OperationOutcome", "issue": [] }));

    ParametersResource {
        resource_type: "Parameters".to_string(),
        id: Some("fhirpath".to_string()),
        parameter: vec![param(
            "outcome",
            ParameterValue {
                resource: Some(outcome_json),
                ..ParameterValue::default()
            },
        )],
    }
}

fn build_metadata_part(
    request: &ParsedServerRequest,
    evaluation: &EvaluationResultSet,
    metadata: ResponseMetadata,
) -> Parameter {
    let mut parts = vec![param("evaluator", string_value(metadata.evaluator_label))];

    // A bare "[]" means analysis produced nothing useful; leave the field out.
    if let Some(expected) = metadata
        .expected_return_type
        .as_deref()
        .filter(|t| !t.is_empty() && *t != "[]")
    {
        parts.push(param("expectedReturnType", string_value(expected)));
    }

    parts.push(param(
        "parseDebug",
        string_value(&*metadata.parse_debug.summary),
    ));
    parts.push(param(
        "parseDebugTree",
        string_value(&*metadata.parse_debug.tree),
    ));
    parts.push(param("expression", string_value(&*request.expression)));

    if let Some(context_expr) = request.context.as_deref()
        && !context_expr.is_empty()
    {
        parts.push(param("context", string_value(context_expr)));
    }

    parts.push(param(
        "resource",
        ParameterValue {
            resource: Some(request.resource.clone()),
            ..ParameterValue::default()
        },
    ));

    parts.push(param(
        "validate",
        ParameterValue {
            value_boolean: Some(request.validate),
            ..ParameterValue::default()
        },
    ));

    if let Some(term) = request.terminology_server.as_deref()
        && !term.is_empty()
    {
        parts.push(param("terminologyServerUrl", string_value(term)));
    }

    if !request.variables.is_empty() {
        parts.push(group("variables", request.variables.clone()));
    }

    parts.push(group(
        "timing",
        vec![
            millis_param("parseTime", evaluation.timing.parse),
            millis_param("evaluationTime", evaluation.timing.evaluation),
            millis_param("totalTime", evaluation.timing.total),
        ],
    ));

    for diagnostic in metadata.semantic_diagnostics {
        use octofhir_fhirpath::diagnostics::DiagnosticSeverity;
        let level = match diagnostic.severity {
            DiagnosticSeverity::Error => "Error",
            DiagnosticSeverity::Warning => "Warning",
            _ => continue,
        };
        parts.push(param(
            "analysis-diagnostic",
            string_value(format!("{}: {}", level, diagnostic.message)),
        ));
    }

    group("parameters", parts)
}

fn build_result_parameter(
    request: &ParsedServerRequest,
    contextual: &ContextualResult,
) -> Parameter {
    let mut parts: Vec<Parameter> = contextual
        .results
        .iter()
        .map(|result| result_part(result, request))
        .collect();
    parts.extend(contextual.traces.iter().map(trace_parameter));

    let context_path = contextual
        .context
        .path
        .clone()
        .or_else(|| derived_context_path(request, &contextual.context));

    Parameter {
        name: "result".to_string(),
        value: ParameterValue {
            value_string: context_path,
            ..ParameterValue::default()
        },
        part: parts,
        ..Parameter::empty()
    }
}

fn result_part(result: &EvaluationResultItem, request: &ParsedServerRequest) -> Parameter {
    let mut parameter = value_parameter(&result.datatype, &result.value);

    if let Some(path) = result.path.as_deref() {
        push_resource_path(&mut parameter, path);
    } else if !result.path_segments.is_empty() {
        let computed = path_segments_to_string(subject_type(request), &result.path_segments);
        push_resource_path(&mut parameter, &computed);
    }

    parameter
}

fn subject_type(request: &ParsedServerRequest) -> &str {
    request
        .resource
        .get("resourceType")
        .and_then(|v| v.as_str())
        .unwrap_or("Resource")
}

fn push_resource_path(parameter: &mut Parameter, path: &str) {
    parameter.extension.push(Extension {
        url: RESOURCE_PATH_EXTENSION_URL.to_string(),
        value: ExtensionValue {
            value_string: Some(path.to_string()),
        },
    });
    parameter
        .part
        .push(param("resource-path", string_value(path)));
}

fn trace_parameter(trace: &TraceOutput) -> Parameter {
    Parameter {
        name: "trace".to_string(),
        value: string_value(&*trace.name),
        part: trace
            .parts
            .iter()
            .enumerate()
            .map(|(index, part)| trace_part(index, part))
            .collect(),
        ..Parameter::empty()
    }
}

fn trace_part(index: usize, part: &TracePart) -> Parameter {
    let name = if part.datatype.is_empty() {
        format!("value{index}")
    } else {
        part.datatype.clone()
    };

    match &part.value {
        JsonValue::Bool(flag) => param(
            name,
            ParameterValue {
                value_boolean: Some(*flag),
                ..ParameterValue::default()
            },
        ),
        JsonValue::String(text) => param(name, string_value(&**text)),
        JsonValue::Number(number) if number.is_i64() => param(
            name,
            ParameterValue {
                value_integer: number.as_i64(),
                ..ParameterValue::default()
            },
        ),
        JsonValue::Number(number) => param(
            name,
            ParameterValue {
                value_decimal: Some(DecimalInput::Number(number.clone())),
                ..ParameterValue::default()
            },
        ),
        JsonValue::Object(map) => {
            if let Some(type_name) = map.get("resourceType").and_then(|v| v.as_str()) {
                complex_parameter(&name, type_name, part.value.clone())
            } else {
                param(
                    name,
                    ParameterValue {
                        resource: Some(json!({
                            "extension": [{
                                "url": JSON_VALUE_EXTENSION_URL,
                                "valueString": part.value.to_string()
                            }]
                        })),
                        ..ParameterValue::default()
                    },
                )
            }
        }
        JsonValue::Array(_) | JsonValue::Null => param(name, string_value(part.value.to_string())),
    }
}

fn value_parameter(datatype: &str, value: &FhirPathValue) -> Parameter {
    match value {
        FhirPathValue::Boolean(b, _, _) => param(
            datatype,
            ParameterValue {
                value_boolean: Some(*b),
                ..ParameterValue::default()
            },
        ),
        FhirPathValue::Integer(i, _, _) => param(
            datatype,
            ParameterValue {
                value_integer: Some(*i),
                ..ParameterValue::default()
            },
        ),
        FhirPathValue::Decimal(d, _, _) => param(
            datatype,
            ParameterValue {
                value_decimal: Some(DecimalInput::String(d.to_string())),
                ..ParameterValue::default()
            },
        ),
        FhirPathValue::String(s, type_info, _) => {
            let hint = type_info
                .name
                .as_deref()
                .unwrap_or(&type_info.type_name)
                .to_ascii_lowercase();
            param(datatype, string_kind_value(&hint, s))
        }
        FhirPathValue::Date(date, _, _) => param(
            datatype,
            ParameterValue {
                value_date: Some(date.to_string()),
                ..ParameterValue::default()
            },
        ),
        FhirPathValue::DateTime(dt, _, _) => param(
            datatype,
            ParameterValue {
                value_date_time: Some(dt.to_string()),
                ..ParameterValue::default()
            },
        ),
        FhirPathValue::Time(time, _, _) => param(
            datatype,
            ParameterValue {
                value_time: Some(time.to_string()),
                ..ParameterValue::default()
            },
        ),
        FhirPathValue::Quantity {
            value: magnitude,
            unit,
            code,
            system,
            ..
        } => param(
            datatype,
            ParameterValue {
                value_quantity: Some(quantity_json(
                    &magnitude.to_string(),
                    unit.as_deref(),
                    system.as_deref(),
                    code.as_deref(),
                )),
                ..ParameterValue::default()
            },
        ),
        FhirPathValue::Resource(json, type_info, _) => {
            let type_name = type_info
                .name
                .as_deref()
                .unwrap_or(&type_info.type_name)
                .to_string();
            complex_parameter(datatype, &type_name, json.as_ref().clone())
        }
        FhirPathValue::Collection(_) | FhirPathValue::Empty => {
            param(datatype, string_value("empty"))
        }
    }
}

fn quantity_json(
    magnitude: &str,
    unit: Option<&str>,
    system: Option<&str>,
    code: Option<&str>,
) -> JsonValue {
    let mut map = JsonMap::new();
    map.insert(
        "value".to_string(),
        JsonValue::String(magnitude.to_string()),
    );
    for (key, field) in [("unit", unit), ("system", system), ("code", code)] {
        if let Some(text) = field {
            map.insert(key.to_string(), JsonValue::String(text.to_string()));
        }
    }
    JsonValue::Object(map)
}

/// Primitive string-kinded FHIR types get their own `value[x]` field.
fn string_kind_value(hint: &str, text: &str) -> ParameterValue {
    let mut value = ParameterValue::default();
    let slot = match hint {
        "code" => &mut value.value_code,
        "id" => &mut value.value_id,
        "oid" => &mut value.value_oid,
        "uuid" => &mut value.value_uuid,
        "uri" => &mut value.value_uri,
        "url" => &mut value.value_url,
        "canonical" => &mut value.value_canonical,
        "markdown" => &mut value.value_markdown,
        "base64binary" => &mut value.value_base64_binary,
        _ => &mut value.value_string,
    };
    *slot = Some(text.to_string());
    value
}

/// Complex datatypes with a `value[x]` slot use it; anything else rides in
/// `resource` with the raw JSON attached through the json-value extension.
fn complex_parameter(name: &str, type_name: &str, json_value: JsonValue) -> Parameter {
    let mut value = ParameterValue::default();
    let slot = match type_name {
        "HumanName" => Some(&mut value.value_human_name),
        "Identifier" => Some(&mut value.value_identifier),
        "Address" => Some(&mut value.value_address),
        "ContactPoint" => Some(&mut value.value_contact_point),
        "Reference" => Some(&mut value.value_reference),
        "Period" => Some(&mut value.value_period),
        "Coding" => Some(&mut value.value_coding),
        "CodeableConcept" => Some(&mut value.value_codeable_concept),
        "Quantity" => Some(&mut value.value_quantity),
        "ContactDetail" => Some(&mut value.value_contact_detail),
        "Contributor" => Some(&mut value.value_contributor),
        "Expression" => Some(&mut value.value_expression),
        "ParameterDefinition" => Some(&mut value.value_parameter_definition),
        "TriggerDefinition" => Some(&mut value.value_trigger_definition),
        "DataRequirement" => Some(&mut value.value_data_requirement),
        "Meta" => Some(&mut value.value_meta),
        _ => None,
    };

    match slot {
        Some(slot) => {
            *slot = Some(json_value);
            param(name, value)
        }
        None => {
            let mut parameter = param(
                name,
                ParameterValue {
                    resource: Some(json_value.clone()),
                    ..ParameterValue::default()
                },
            );
            parameter.extension.push(Extension {
                url: JSON_VALUE_EXTENSION_URL.to_string(),
                value: ExtensionValue {
                    value_string: Some(json_value.to_string()),
                },
            });
            parameter
        }
    }
}

fn derived_context_path(request: &ParsedServerRequest, context: &ContextItem) -> Option<String> {
    if context.path_segments.is_empty() {
        return None;
    }
    Some(path_segments_to_string(
        subject_type(request),
        &context.path_segments,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::models::{EvaluationResultItem, EvaluationTiming, PathSegment};
    use serde_json::json;

    fn bare_request() -> ParsedServerRequest {
        ParsedServerRequest {
            expression: "name.given".to_string(),
            context: None,
            validate: false,
            debug_trace: false,
            resource: json!({ "resourceType": "Patient" }),
            variables: Vec::new(),
            terminology_server: None,
        }
    }

    fn empty_result_set() -> EvaluationResultSet {
        EvaluationResultSet {
            contexts: Vec::new(),
            timing: EvaluationTiming {
                parse: Duration::from_millis(1),
                evaluation: Duration::from_millis(1),
                total: Duration::from_millis(2),
            },
        }
    }

    fn default_metadata(parse_debug: &ParseDebugInfo) -> ResponseMetadata<'_> {
        ResponseMetadata {
            evaluator_label: "test-engine",
            expected_return_type: None,
            parse_debug,
            semantic_diagnostics: &[],
        }
    }

    #[test]
    fn string_kind_value_selects_field_by_hint() {
        let code = string_kind_value("code", "final");
        assert_eq!(code.value_code, Some("final".to_string()));

        let binary = string_kind_value("base64binary", "ZGF0YQ==");
        assert_eq!(binary.value_base64_binary, Some("ZGF0YQ==".to_string()));

        let plain = string_kind_value("string", "John");
        assert_eq!(plain.value_string, Some("John".to_string()));
    }

    #[test]
    fn result_part_carries_resource_path() {
        let result = EvaluationResultItem {
            value: FhirPathValue::string("John"),
            datatype: "string".to_string(),
            path: Some("Patient.name[0].given[0]".to_string()),
            path_segments: Vec::new(),
            index: 0,
        };

        let parameter = result_part(&result, &bare_request());
        assert_eq!(parameter.part.len(), 1);
        assert_eq!(parameter.part[0].name, "resource-path");
        assert_eq!(
            parameter.part[0].value.value_string,
            Some("Patient.name[0].given[0]".to_string())
        );
        assert!(
            parameter
                .extension
                .iter()
                .any(|ext| ext.url == RESOURCE_PATH_EXTENSION_URL)
        );
    }

    #[test]
    fn trace_parameter_names_parts_by_datatype() {
        let trace = TraceOutput {
            name: "eval".to_string(),
            parts: vec![
                TracePart {
                    datatype: "string".to_string(),
                    value: JsonValue::String("ok".to_string()),
                },
                TracePart {
                    datatype: "integer".to_string(),
                    value: json!(7),
                },
            ],
        };

        let parameter = trace_parameter(&trace);
        assert_eq!(parameter.name, "trace");
        assert_eq!(parameter.value.value_string, Some("eval".to_string()));
        assert_eq!(parameter.part.len(), 2);
        assert_eq!(parameter.part[0].name, "string");
        assert_eq!(parameter.part[1].value.value_integer, Some(7));
    }

    #[test]
    fn derived_context_path_uses_subject_type() {
        let context = ContextItem {
            value: FhirPathValue::empty(),
            path: None,
            path_segments: vec![PathSegment::Property("name".to_string())],
            index: 0,
        };

        let path = derived_context_path(&bare_request(), &context);
        assert_eq!(path, Some("Patient.name".to_string()));
    }

    #[test]
    fn complex_parameter_handles_known_and_unknown_types() {
        let name = json!({ "family": "Chalmers" });
        let parameter = complex_parameter("HumanName", "HumanName", name.clone());
        assert_eq!(parameter.value.value_human_name, Some(name));

        let opaque = json!({ "custom": true });
        let parameter = complex_parameter("Element", "Custom", opaque.clone());
        assert_eq!(parameter.value.resource, Some(opaque));
        assert!(
            parameter
                .extension
                .iter()
                .any(|ext| ext.url == JSON_VALUE_EXTENSION_URL)
        );
    }

    #[test]
    fn bare_bracket_return_type_is_omitted() {
        let parse_debug = ParseDebugInfo {
            summary: "expr : unknown".to_string(),
            tree: "{}".to_string(),
        };

        let response = build_success_response(
            &bare_request(),
            &empty_result_set(),
            ResponseMetadata {
                expected_return_type: Some("[]".to_string()),
                ..default_metadata(&parse_debug)
            },
        );

        let metadata = &response.parameter[0];
        assert_eq!(metadata.name, "parameters");
        assert!(
            !metadata
                .part
                .iter()
                .any(|part| part.name == "expectedReturnType")
        );
    }

    #[test]
    fn validate_flag_is_echoed_in_metadata() {
        let parse_debug = ParseDebugInfo {
            summary: "expr : unknown".to_string(),
            tree: "{}".to_string(),
        };
        let request = ParsedServerRequest {
            validate: true,
            ..bare_request()
        };

        let response = build_success_response(
            &request,
            &empty_result_set(),
            default_metadata(&parse_debug),
        );

        let echoed = response.parameter[0]
            .part
            .iter()
            .find(|part| part.name == "validate")
            .expect("validate part");
        assert_eq!(echoed.value.value_boolean, Some(true));
    }

    #[test]
    fn outcome_response_wraps_operation_outcome() {
        let outcome = OperationOutcome::error("invalid", "Failed to parse expression", None);
        let response = build_outcome_response(outcome);

        assert_eq!(response.resource_type, "Parameters");
        assert_eq!(response.parameter.len(), 1);
        assert_eq!(response.parameter[0].name, "outcome");
        let resource = response.parameter[0]
            .value
            .resource
            .as_ref()
            .expect("outcome resource");
        assert_eq!(resource["resourceType"], "OperationOutcome");
    }
}
