//! HTTP adapter exposing a FHIRPath engine to the fhirpath-lab testing UI.
//!
//! The heavy lifting (parsing, semantic analysis, evaluation) is done by the
//! octofhir FHIRPath stack; this crate translates between the lab's FHIR
//! `Parameters` wire format and the engine API.

pub mod ast;
pub mod server;
