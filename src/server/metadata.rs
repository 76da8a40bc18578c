//! Static CapabilityStatement for `GET /api/metadata`

use crate::server::version::ServerFhirVersion;
use serde_json::{Value as JsonValue, json};

/// CapabilityStatement advertising the $fhirpath operation. The lab UI calls
/// this once to discover which endpoints and FHIR versions are available.
pub fn capability_statement() -> JsonValue {
    let operations: Vec<JsonValue> = std::iter::once(json!({
        "name": "fhirpath",
        "definition": "http://fhir.forms-lab.com/OperationDefinition/fhirpath"
    }))
    .chain(ServerFhirVersion::all().iter().map(|version| {
        json!({
            "name": format!("fhirpath-{}", version.as_str()),
            "definition": "http://fhir.forms-lab.com/OperationDefinition/fhirpath"
        })
    }))
    .collect();

    json!({
        "resourceType": "CapabilityStatement",
        "id": "fhirpath-lab-server",
        "status": "active",
        "date": "2025-01-01",
        "kind": "instance",
        "software": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "implementation": {
            "description": "FHIRPath expression evaluation service for the fhirpath-lab UI"
        },
        "fhirVersion": "4.0.1",
        "format": ["json"],
        "rest": [{
            "mode": "server",
            "operation": operations
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_statement_lists_every_version_operation() {
        let statement = capability_statement();
        assert_eq!(statement["resourceType"], "CapabilityStatement");

        let operations = statement["rest"][0]["operation"]
            .as_array()
            .expect("operations");
        // Default endpoint plus one per FHIR version.
        assert_eq!(operations.len(), 1 + ServerFhirVersion::all().len());
        assert_eq!(operations[0]["name"], "fhirpath");
        assert!(
            operations
                .iter()
                .any(|op| op["name"] == "fhirpath-r4b")
        );
    }
}
