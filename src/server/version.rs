//! FHIR version selection for the versioned `$fhirpath` endpoints

use std::fmt;

/// FHIR versions the evaluation engines are built for.
///
/// STU3 is part of the lab API surface but has no engine behind it; requests
/// for it are answered with a `not-supported` outcome instead of a 404.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerFhirVersion {
    R4,
    R4B,
    R5,
    R6,
}

impl ServerFhirVersion {
    pub fn all() -> &'static [ServerFhirVersion] {
        &[Self::R4, Self::R4B, Self::R5, Self::R6]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::R4 => "r4",
            Self::R4B => "r4b",
            Self::R5 => "r5",
            Self::R6 => "r6",
        }
    }

    /// Path fragment on tx.fhir.org serving this version.
    pub fn tx_path(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ServerFhirVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
