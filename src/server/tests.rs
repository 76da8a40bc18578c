//! End-to-end tests driving the router the way the lab UI does

use crate::server::config::ServerConfig;
use crate::server::registry::ServerRegistry;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::CONTENT_TYPE};
use serde_json::{Value as JsonValue, json};
use tower::ServiceExt;

async fn test_app() -> Router {
    let registry = ServerRegistry::new().await.expect("registry");
    crate::server::create_app(registry, ServerConfig::default())
}

async fn post_fhirpath(app: Router, path: &str, body: JsonValue) -> (StatusCode, JsonValue) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = serde_json::from_slice(&bytes).expect("json body");
    (status, json)
}

fn lab_request(expression: &str, resource: JsonValue) -> JsonValue {
    json!({
        "resourceType": "Parameters",
        "parameter": [
            { "name": "expression", "valueString": expression },
            { "name": "resource", "resource": resource }
        ]
    })
}

fn patient() -> JsonValue {
    json!({
        "resourceType": "Patient",
        "id": "example",
        "name": [
            { "use": "official", "family": "Chalmers", "given": ["Peter", "James"] },
            { "use": "usual", "given": ["Jim"] }
        ],
        "birthDate": "1974-12-25"
    })
}

fn find_parameter<'a>(body: &'a JsonValue, name: &str) -> Option<&'a JsonValue> {
    body["parameter"]
        .as_array()?
        .iter()
        .find(|p| p["name"] == name)
}

fn find_part<'a>(parameter: &'a JsonValue, name: &str) -> Option<&'a JsonValue> {
    parameter["part"]
        .as_array()?
        .iter()
        .find(|p| p["name"] == name)
}

#[tokio::test]
async fn metadata_returns_capability_statement() {
    let app = test_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/api/metadata")
        .body(Body::empty())
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: JsonValue = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["resourceType"], "CapabilityStatement");
}

#[tokio::test]
async fn simple_expression_returns_results_with_paths() {
    let app = test_app().await;
    let (status, body) =
        post_fhirpath(app, "/api/$fhirpath-r4", lab_request("name.given", patient())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resourceType"], "Parameters");
    assert_eq!(body["id"], "fhirpath");

    let metadata = find_parameter(&body, "parameters").expect("parameters part");
    assert!(find_part(metadata, "evaluator").is_some());
    assert!(find_part(metadata, "parseDebugTree").is_some());
    assert_eq!(
        find_part(metadata, "expression").expect("expression")["valueString"],
        "name.given"
    );
    assert!(find_part(metadata, "timing").is_some());

    let result = find_parameter(&body, "result").expect("result parameter");
    let parts = result["part"].as_array().expect("result parts");
    let values: Vec<&str> = parts
        .iter()
        .filter_map(|p| p["valueString"].as_str())
        .collect();
    assert!(values.contains(&"Peter"));
    assert!(values.contains(&"James"));
    assert!(values.contains(&"Jim"));
}

#[tokio::test]
async fn context_expression_produces_one_result_per_item() {
    let app = test_app().await;
    let mut request = lab_request("given", patient());
    request["parameter"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "name": "context", "valueString": "name" }));

    let (status, body) = post_fhirpath(app, "/api/$fhirpath-r4", request).await;

    assert_eq!(status, StatusCode::OK);
    let results: Vec<&JsonValue> = body["parameter"]
        .as_array()
        .expect("parameters")
        .iter()
        .filter(|p| p["name"] == "result")
        .collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["valueString"], "Patient.name[0]");
    assert_eq!(results[1]["valueString"], "Patient.name[1]");
}

#[tokio::test]
async fn parse_error_comes_back_as_embedded_outcome() {
    let app = test_app().await;
    let (status, body) = post_fhirpath(
        app,
        "/api/$fhirpath-r4",
        lab_request("name.given(", patient()),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resourceType"], "Parameters");

    let outcome = find_parameter(&body, "outcome").expect("outcome parameter");
    assert_eq!(outcome["resource"]["resourceType"], "OperationOutcome");
    assert_eq!(outcome["resource"]["issue"][0]["code"], "invalid");
}

#[tokio::test]
async fn malformed_envelope_is_rejected_with_400() {
    let app = test_app().await;
    let (status, body) = post_fhirpath(
        app,
        "/api/$fhirpath-r4",
        json!({ "resourceType": "Patient" }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["resourceType"], "OperationOutcome");
}

#[tokio::test]
async fn type_mismatched_body_is_rejected_with_400() {
    let app = test_app().await;

    // `parameter` must be an array; deserialization failures still answer
    // with an OperationOutcome body.
    let (status, body) = post_fhirpath(
        app,
        "/api/$fhirpath-r4",
        json!({ "resourceType": "Parameters", "parameter": {} }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["resourceType"], "OperationOutcome");
    assert_eq!(body["issue"][0]["code"], "invalid");
}

#[tokio::test]
async fn non_json_body_is_rejected_with_400() {
    let app = test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/$fhirpath-r4")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("not json at all"))
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: JsonValue = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["resourceType"], "OperationOutcome");
}

#[tokio::test]
async fn missing_expression_is_rejected_with_400() {
    let app = test_app().await;
    let (status, body) = post_fhirpath(
        app,
        "/api/$fhirpath-r4",
        json!({
            "resourceType": "Parameters",
            "parameter": [
                { "name": "resource", "resource": { "resourceType": "Patient" } }
            ]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["resourceType"], "OperationOutcome");
}

#[tokio::test]
async fn stu3_endpoint_answers_not_supported() {
    let app = test_app().await;
    let (status, body) = post_fhirpath(
        app,
        "/api/$fhirpath-stu3",
        lab_request("name.given", patient()),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let outcome = find_parameter(&body, "outcome").expect("outcome parameter");
    assert_eq!(
        outcome["resource"]["issue"][0]["code"],
        "not-supported"
    );
}

#[tokio::test]
async fn get_endpoint_evaluates_query_parameters() {
    let app = test_app().await;
    let resource = json!({ "resourceType": "Patient", "id": "p1" });
    let uri = format!(
        "/api/$fhirpath-r4?expression=id&resource={}",
        urlencode(&resource.to_string())
    );

    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: JsonValue = serde_json::from_slice(&bytes).expect("json");
    let result = find_parameter(&body, "result").expect("result parameter");
    let parts = result["part"].as_array().expect("parts");
    assert!(parts.iter().any(|p| p["valueString"] == "p1"
        || p["valueId"] == "p1"));
}

#[tokio::test]
async fn debug_trace_attaches_trace_parameters() {
    let app = test_app().await;
    let mut request = lab_request("name.trace('names').given", patient());
    request["parameter"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "name": "debug_trace", "valueBoolean": true }));

    let (status, body) = post_fhirpath(app, "/api/$fhirpath-r4", request).await;

    assert_eq!(status, StatusCode::OK);
    let result = find_parameter(&body, "result").expect("result parameter");
    let traces: Vec<&JsonValue> = result["part"]
        .as_array()
        .expect("parts")
        .iter()
        .filter(|p| p["name"] == "trace")
        .collect();
    assert!(!traces.is_empty());
    assert_eq!(traces[0]["valueString"], "names");
}

#[tokio::test]
async fn validate_flag_is_echoed_back() {
    let app = test_app().await;
    let mut request = lab_request("name.given", patient());
    request["parameter"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "name": "validate", "valueBoolean": true }));

    let (status, body) = post_fhirpath(app, "/api/$fhirpath-r4", request).await;

    assert_eq!(status, StatusCode::OK);
    let metadata = find_parameter(&body, "parameters").expect("parameters part");
    assert_eq!(
        find_part(metadata, "validate").expect("validate part")["valueBoolean"],
        true
    );
}

#[tokio::test]
async fn variables_are_bound_during_evaluation() {
    let app = test_app().await;
    let mut request = lab_request("%threshold + 1", patient());
    request["parameter"].as_array_mut().unwrap().push(json!({
        "name": "variables",
        "part": [ { "name": "threshold", "valueInteger": 2 } ]
    }));

    let (status, body) = post_fhirpath(app, "/api/$fhirpath-r4", request).await;

    assert_eq!(status, StatusCode::OK);
    let result = find_parameter(&body, "result").expect("result parameter");
    let parts = result["part"].as_array().expect("parts");
    assert!(parts.iter().any(|p| p["valueInteger"] == 3));
}

fn urlencode(input: &str) -> String {
    let mut out = String::new();
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
