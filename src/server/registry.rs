//! Shared FhirPathEngine registry, one pre-initialized engine per FHIR version

use crate::server::error::{ServerError, ServerResult};
use crate::server::version::ServerFhirVersion;
use octofhir_fhir_model::{HttpTerminologyProvider, TerminologyProvider, provider::ModelProvider};
use octofhir_fhirpath::evaluator::FhirPathEngine;
use octofhir_fhirpath::{FunctionRegistry, create_function_registry};
use octofhir_fhirschema::{EmbeddedSchemaProvider, create_validation_provider_from_embedded};
use papaya::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Registry holding the engines reused across HTTP calls.
#[derive(Clone)]
pub struct ServerRegistry {
    evaluation_engines: HashMap<ServerFhirVersion, Arc<Mutex<FhirPathEngine>>>,
    function_registry: Arc<FunctionRegistry>,
    model_providers: HashMap<ServerFhirVersion, Arc<EmbeddedSchemaProvider>>,
}

impl ServerRegistry {
    /// Build engines for every supported FHIR version.
    pub async fn new() -> ServerResult<Self> {
        let evaluation_engines = HashMap::new();
        let model_providers = HashMap::new();

        let function_registry: Arc<FunctionRegistry> = Arc::new(create_function_registry());

        for &version in ServerFhirVersion::all() {
            let start = std::time::Instant::now();

            let model_provider = Arc::new(model_provider_for_version(version));
            model_providers.pin().insert(version, model_provider.clone());

            let engine = build_engine(
                function_registry.clone(),
                model_provider,
                default_terminology_provider(version),
            )
            .await?;

            evaluation_engines
                .pin()
                .insert(version, Arc::new(Mutex::new(engine)));

            info!(
                "Initialized FHIR {} engine in {:?}",
                version,
                start.elapsed()
            );
        }

        info!(
            "Engine registry ready with {} FHIR versions",
            evaluation_engines.len()
        );

        Ok(Self {
            evaluation_engines,
            function_registry,
            model_providers,
        })
    }

    pub fn get_evaluation_engine(
        &self,
        version: ServerFhirVersion,
    ) -> Option<Arc<Mutex<FhirPathEngine>>> {
        self.evaluation_engines.pin().get(&version).cloned()
    }

    pub fn version_count(&self) -> usize {
        self.evaluation_engines.pin().len()
    }

    pub fn supports_version(&self, version: ServerFhirVersion) -> bool {
        self.evaluation_engines.pin().contains_key(&version)
    }

    pub fn get_model_provider(
        &self,
        version: ServerFhirVersion,
    ) -> Option<Arc<EmbeddedSchemaProvider>> {
        self.model_providers.pin().get(&version).cloned()
    }

    /// Build a one-off engine pointing at a caller-supplied terminology
    /// server. The pooled engines keep the default tx.fhir.org endpoints.
    pub async fn create_engine_with_terminology(
        &self,
        version: ServerFhirVersion,
        terminology_url: &str,
    ) -> ServerResult<FhirPathEngine> {
        let model_provider = self
            .model_providers
            .pin()
            .get(&version)
            .cloned()
            .ok_or_else(|| ServerError::InvalidFhirVersion {
                version: version.to_string(),
            })?;

        let terminology = match HttpTerminologyProvider::new(terminology_url.to_string()) {
            Ok(provider) => Some(Arc::new(provider) as Arc<dyn TerminologyProvider>),
            Err(error) => {
                return Err(ServerError::BadRequest {
                    message: format!(
                        "Invalid terminology server URL '{}': {}",
                        terminology_url, error
                    ),
                });
            }
        };

        build_engine(self.function_registry.clone(), model_provider, terminology).await
    }
}

async fn build_engine(
    function_registry: Arc<FunctionRegistry>,
    model_provider: Arc<EmbeddedSchemaProvider>,
    terminology: Option<Arc<dyn TerminologyProvider>>,
) -> ServerResult<FhirPathEngine> {
    let mut engine = FhirPathEngine::new(function_registry, model_provider.clone()).await?;

    if let Ok(validation_provider) = create_validation_provider_from_embedded(
        model_provider as Arc<dyn ModelProvider + Send + Sync>,
    )
    .await
    {
        engine = engine.with_validation_provider(validation_provider);
    }

    if let Some(terminology) = terminology {
        engine = engine.with_terminology_provider(terminology);
    }

    Ok(engine)
}

/// Schema provider backing each FHIR version. R4B shares the R4 schemas;
/// R6 rides on R5 until R6 schemas ship.
fn model_provider_for_version(version: ServerFhirVersion) -> EmbeddedSchemaProvider {
    match version {
        ServerFhirVersion::R4 | ServerFhirVersion::R4B => EmbeddedSchemaProvider::r4(),
        ServerFhirVersion::R5 => EmbeddedSchemaProvider::r5(),
        ServerFhirVersion::R6 => {
            warn!("FHIR R6 is using R5 schemas as R6 is still in development");
            EmbeddedSchemaProvider::r5()
        }
    }
}

fn default_terminology_provider(
    version: ServerFhirVersion,
) -> Option<Arc<dyn TerminologyProvider>> {
    let tx_url = format!("https://tx.fhir.org/{}", version.tx_path());
    match HttpTerminologyProvider::new(tx_url) {
        Ok(provider) => Some(Arc::new(provider) as Arc<dyn TerminologyProvider>),
        Err(error) => {
            warn!(
                "Failed to create default terminology provider for {}: {}",
                version, error
            );
            None
        }
    }
}
