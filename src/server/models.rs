//! Request and response models for the fhirpath-lab Parameters API

use octofhir_fhirpath::FhirPathValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// FHIR `Parameters` resource used both as the request body and the response
/// envelope of the `$fhirpath` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParametersResource {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub parameter: Vec<Parameter>,
}

/// A single `Parameters.parameter` entry with its `value[x]` choice and
/// optional nested parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(flatten)]
    pub value: ParameterValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub part: Vec<Parameter>,
}

impl Parameter {
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            extension: Vec::new(),
            value: ParameterValue::default(),
            part: Vec::new(),
        }
    }

    /// Convert a request parameter (a variable binding) into an engine value.
    pub async fn to_fhirpath_value(
        &self,
        model_provider: Option<Arc<dyn octofhir_fhir_model::ModelProvider + Send + Sync>>,
    ) -> FhirPathValue {
        if let Some(resource) = &self.value.resource {
            return match FhirPathValue::resource_with_model_provider(
                resource.clone(),
                model_provider,
            )
            .await
            {
                Ok(value) => value,
                Err(_) => FhirPathValue::resource(resource.clone()),
            };
        }
        if let Some(text) = &self.value.value_string {
            return FhirPathValue::string(text.clone());
        }
        if let Some(flag) = self.value.value_boolean {
            return FhirPathValue::boolean(flag);
        }
        if let Some(int) = self.value.value_integer {
            return FhirPathValue::integer(int);
        }
        if let Some(decimal) = &self.value.value_decimal {
            let text = match decimal {
                DecimalInput::Number(number) => number.to_string(),
                DecimalInput::String(text) => text.clone(),
            };
            if let Ok(parsed) = rust_decimal::Decimal::from_str(&text) {
                return FhirPathValue::decimal(parsed);
            }
            return FhirPathValue::string(text);
        }
        FhirPathValue::empty()
    }
}

/// The `value[x]` choice of a `Parameters.parameter`, flattened into the
/// parameter object on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterValue {
    #[serde(rename = "valueString", skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(rename = "valueBoolean", skip_serializing_if = "Option::is_none")]
    pub value_boolean: Option<bool>,
    #[serde(rename = "valueInteger", skip_serializing_if = "Option::is_none")]
    pub value_integer: Option<i64>,
    #[serde(rename = "valueDecimal", skip_serializing_if = "Option::is_none")]
    pub value_decimal: Option<DecimalInput>,
    #[serde(rename = "valueCode", skip_serializing_if = "Option::is_none")]
    pub value_code: Option<String>,
    #[serde(rename = "valueId", skip_serializing_if = "Option::is_none")]
    pub value_id: Option<String>,
    #[serde(rename = "valueOid", skip_serializing_if = "Option::is_none")]
    pub value_oid: Option<String>,
    #[serde(rename = "valueUuid", skip_serializing_if = "Option::is_none")]
    pub value_uuid: Option<String>,
    #[serde(rename = "valueUri", skip_serializing_if = "Option::is_none")]
    pub value_uri: Option<String>,
    #[serde(rename = "valueUrl", skip_serializing_if = "Option::is_none")]
    pub value_url: Option<String>,
    #[serde(rename = "valueCanonical", skip_serializing_if = "Option::is_none")]
    pub value_canonical: Option<String>,
    #[serde(rename = "valueMarkdown", skip_serializing_if = "Option::is_none")]
    pub value_markdown: Option<String>,
    #[serde(rename = "valueBase64Binary", skip_serializing_if = "Option::is_none")]
    pub value_base64_binary: Option<String>,
    #[serde(rename = "valueDate", skip_serializing_if = "Option::is_none")]
    pub value_date: Option<String>,
    #[serde(rename = "valueDateTime", skip_serializing_if = "Option::is_none")]
    pub value_date_time: Option<String>,
    #[serde(rename = "valueTime", skip_serializing_if = "Option::is_none")]
    pub value_time: Option<String>,
    #[serde(rename = "valueQuantity", skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<JsonValue>,
    #[serde(rename = "valueCoding", skip_serializing_if = "Option::is_none")]
    pub value_coding: Option<JsonValue>,
    #[serde(
        rename = "valueCodeableConcept",
        skip_serializing_if = "Option::is_none"
    )]
    pub value_codeable_concept: Option<JsonValue>,
    #[serde(rename = "valuePeriod", skip_serializing_if = "Option::is_none")]
    pub value_period: Option<JsonValue>,
    #[serde(rename = "valueReference", skip_serializing_if = "Option::is_none")]
    pub value_reference: Option<JsonValue>,
    #[serde(rename = "valueHumanName", skip_serializing_if = "Option::is_none")]
    pub value_human_name: Option<JsonValue>,
    #[serde(rename = "valueIdentifier", skip_serializing_if = "Option::is_none")]
    pub value_identifier: Option<JsonValue>,
    #[serde(rename = "valueAddress", skip_serializing_if = "Option::is_none")]
    pub value_address: Option<JsonValue>,
    #[serde(rename = "valueContactPoint", skip_serializing_if = "Option::is_none")]
    pub value_contact_point: Option<JsonValue>,
    #[serde(rename = "valueContactDetail", skip_serializing_if = "Option::is_none")]
    pub value_contact_detail: Option<JsonValue>,
    #[serde(rename = "valueContributor", skip_serializing_if = "Option::is_none")]
    pub value_contributor: Option<JsonValue>,
    #[serde(rename = "valueExpression", skip_serializing_if = "Option::is_none")]
    pub value_expression: Option<JsonValue>,
    #[serde(
        rename = "valueParameterDefinition",
        skip_serializing_if = "Option::is_none"
    )]
    pub value_parameter_definition: Option<JsonValue>,
    #[serde(
        rename = "valueTriggerDefinition",
        skip_serializing_if = "Option::is_none"
    )]
    pub value_trigger_definition: Option<JsonValue>,
    #[serde(
        rename = "valueDataRequirement",
        skip_serializing_if = "Option::is_none"
    )]
    pub value_data_requirement: Option<JsonValue>,
    #[serde(rename = "valueMeta", skip_serializing_if = "Option::is_none")]
    pub value_meta: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<JsonValue>,
}

/// FHIR decimals must survive as written; accept numbers but allow a
/// canonical string form that keeps trailing zeros intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecimalInput {
    Number(JsonNumber),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub url: String,
    #[serde(flatten)]
    pub value: ExtensionValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionValue {
    #[serde(rename = "valueString", skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
}

/// Problems detected while unpacking the request `Parameters`.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Request body is not a Parameters resource")]
    NotParameters,
    #[error("Missing required 'expression' parameter")]
    MissingExpression,
    #[error("Missing required 'resource' parameter")]
    MissingResource,
    #[error("The 'resource' parameter is not valid JSON: {0}")]
    InvalidResourceJson(String),
}

/// Request fields extracted from the `Parameters` envelope.
#[derive(Debug, Clone)]
pub struct ParsedServerRequest {
    pub expression: String,
    pub resource: JsonValue,
    pub context: Option<String>,
    pub validate: bool,
    pub debug_trace: bool,
    pub variables: Vec<Parameter>,
    pub terminology_server: Option<String>,
}

impl ParametersResource {
    /// Unpack the request into its operation fields.
    pub fn parse_request(&self) -> Result<ParsedServerRequest, RequestError> {
        if self.resource_type != "Parameters" {
            return Err(RequestError::NotParameters);
        }

        let mut expression = None;
        let mut resource = None;
        let mut context = None;
        let mut validate = false;
        let mut debug_trace = false;
        let mut variables = Vec::new();
        let mut terminology_server = None;

        for parameter in &self.parameter {
            match parameter.name.as_str() {
                "expression" => expression = parameter.value.value_string.clone(),
                "resource" => {
                    if let Some(inline) = &parameter.value.resource {
                        resource = Some(inline.clone());
                    } else if let Some(text) = &parameter.value.value_string {
                        let parsed = serde_json::from_str(text)
                            .map_err(|e| RequestError::InvalidResourceJson(e.to_string()))?;
                        resource = Some(parsed);
                    }
                }
                "context" => context = parameter.value.value_string.clone(),
                "validate" => validate = parameter.value.value_boolean.unwrap_or(false),
                "debug_trace" | "debugTrace" => {
                    debug_trace = parameter.value.value_boolean.unwrap_or(false)
                }
                "terminologyserver" | "terminologyServer" => {
                    terminology_server = parameter.value.value_string.clone()
                }
                "variables" => variables = parameter.part.clone(),
                _ => {}
            }
        }

        let expression = expression
            .ok_or(RequestError::MissingExpression)?
            .trim()
            .to_string();
        if expression.is_empty() {
            return Err(RequestError::MissingExpression);
        }
        let resource = resource.ok_or(RequestError::MissingResource)?;

        Ok(ParsedServerRequest {
            expression,
            resource,
            context,
            validate,
            debug_trace,
            variables,
            terminology_server,
        })
    }
}

// ===== EVALUATION CARRIERS =====

/// A location inside the subject resource, as discovered by structural search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Property(String),
    Index(usize),
}

/// Render segments as a fhirpath-lab path string (`Patient.name[0].given`).
pub fn path_segments_to_string(resource_type: &str, segments: &[PathSegment]) -> String {
    let mut out = resource_type.to_string();
    for segment in segments {
        match segment {
            PathSegment::Property(name) => {
                out.push('.');
                out.push_str(name);
            }
            PathSegment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// One item produced by the context expression (or the whole resource when no
/// context was given).
#[derive(Debug, Clone)]
pub struct ContextItem {
    pub value: FhirPathValue,
    pub path: Option<String>,
    pub path_segments: Vec<PathSegment>,
    pub index: usize,
}

/// One value produced by evaluating the expression against a context item.
#[derive(Debug, Clone)]
pub struct EvaluationResultItem {
    pub value: FhirPathValue,
    pub datatype: String,
    pub path: Option<String>,
    pub path_segments: Vec<PathSegment>,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct ContextualResult {
    pub context: ContextItem,
    pub results: Vec<EvaluationResultItem>,
    pub traces: Vec<TraceOutput>,
}

#[derive(Debug, Clone)]
pub struct EvaluationResultSet {
    pub contexts: Vec<ContextualResult>,
    pub timing: EvaluationTiming,
}

#[derive(Debug, Clone)]
pub struct EvaluationTiming {
    pub parse: Duration,
    pub evaluation: Duration,
    pub total: Duration,
}

/// A `trace()` call captured during evaluation.
#[derive(Debug, Clone)]
pub struct TraceOutput {
    pub name: String,
    pub parts: Vec<TracePart>,
}

#[derive(Debug, Clone)]
pub struct TracePart {
    pub datatype: String,
    pub value: JsonValue,
}

// ===== VALUE CONVERSION =====

/// Convert an engine value back to plain JSON for path matching and trace
/// serialization.
pub fn fhir_value_to_json(value: FhirPathValue) -> JsonValue {
    match value {
        FhirPathValue::Boolean(b, _, _) => JsonValue::Bool(b),
        FhirPathValue::String(s, _, _) => JsonValue::String(s),
        FhirPathValue::Integer(i, _, _) => JsonValue::Number(JsonNumber::from(i)),
        FhirPathValue::Decimal(d, _, _) => decimal_to_json_value(&d),
        FhirPathValue::DateTime(dt, _, _) => JsonValue::String(dt.to_string()),
        FhirPathValue::Date(d, _, _) => JsonValue::String(d.to_string()),
        FhirPathValue::Time(t, _, _) => JsonValue::String(t.to_string()),
        FhirPathValue::Quantity {
            value,
            unit,
            code,
            system,
            ucum_unit,
            calendar_unit: _,
            type_info: _,
            primitive_element: _,
        } => {
            let mut obj = JsonMap::new();
            obj.insert("value".to_string(), decimal_to_json_value(&value));

            if let Some(unit_str) = unit {
                obj.insert("unit".to_string(), JsonValue::String(unit_str));
            }
            if let Some(system_str) = system {
                obj.insert("system".to_string(), JsonValue::String(system_str));
            }
            if let Some(code_str) = code {
                obj.insert("code".to_string(), JsonValue::String(code_str));
            }

            if let Some(ucum) = ucum_unit {
                if !obj.contains_key("system") {
                    obj.insert(
                        "system".to_string(),
                        JsonValue::String("http://unitsofmeasure.org".to_string()),
                    );
                }
                if !obj.contains_key("code") {
                    obj.insert("code".to_string(), JsonValue::String(ucum.code.to_string()));
                }
                if !obj.contains_key("unit") {
                    obj.insert(
                        "unit".to_string(),
                        JsonValue::String(ucum.display_name.to_string()),
                    );
                }
            }

            JsonValue::Object(obj)
        }
        FhirPathValue::Collection(collection) => JsonValue::Array(
            collection
                .iter()
                .map(|v| fhir_value_to_json(v.clone()))
                .collect(),
        ),
        FhirPathValue::Resource(resource, _, _) => resource.as_ref().clone(),
        FhirPathValue::Empty => JsonValue::Array(vec![]),
    }
}

pub fn decimal_to_json_value(decimal: &rust_decimal::Decimal) -> JsonValue {
    let text = decimal.to_string();
    JsonNumber::from_str(&text)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::String(text))
}

// ===== OPERATION OUTCOME =====

/// OperationOutcome response for errors
#[derive(Debug, Serialize)]
pub struct OperationOutcome {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    pub issue: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Serialize)]
pub struct OperationOutcomeIssue {
    pub severity: String,
    pub code: String,
    pub details: OperationOutcomeDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OperationOutcomeDetails {
    pub text: String,
}

impl OperationOutcome {
    /// Create a new OperationOutcome with a single error issue
    pub fn error(code: &str, message: &str, diagnostics: Option<String>) -> Self {
        Self {
            resource_type: "OperationOutcome".to_string(),
            issue: vec![OperationOutcomeIssue {
                severity: "error".to_string(),
                code: code.to_string(),
                details: OperationOutcomeDetails {
                    text: message.to_string(),
                },
                diagnostics,
            }],
        }
    }
}
