//! Run metadata: the header written alongside every experiment's observation
//! history.
//!
//! Grounded on the teacher's `Metadata`/`MetadataBuilder` shape in
//! `src/metadata.rs`, trimmed to the fields spec.md's persisted-state section
//! calls for (experiment name, description, an instrument config snapshot,
//! free-form parameters, annotations, software version).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Captures the run-level context written into each experiment's `log.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub experiment_name: String,
    pub description: String,
    /// Snapshot of the device fleet's configuration at run start.
    pub instrument_config: HashMap<String, String>,
    pub parameters: HashMap<String, serde_json::Value>,
    pub annotations: String,
    pub software_version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            experiment_name: String::new(),
            description: String::new(),
            instrument_config: HashMap::new(),
            parameters: HashMap::new(),
            annotations: String::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Builder for `Metadata`, matching the teacher's step-by-step assembly
/// pattern.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    #[must_use]
    pub fn new(experiment_name: impl Into<String>) -> Self {
        let mut builder = Self::default();
        builder.inner.experiment_name = experiment_name.into();
        builder
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.inner.description = description.into();
        self
    }

    #[must_use]
    pub fn instrument_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.instrument_config.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inner.parameters.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn annotations(mut self, annotations: impl Into<String>) -> Self {
        self.inner.annotations = annotations.into();
        self
    }

    #[must_use]
    pub fn build(self) -> Metadata {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_fields_and_defaults_software_version() {
        let metadata = MetadataBuilder::new("titration-01")
            .description("acid/base titration")
            .instrument_config("pump1", "syringe-5mL")
            .parameter("sample_id", serde_json::json!("S-104"))
            .annotations("operator: jdoe")
            .build();

        assert_eq!(metadata.experiment_name, "titration-01");
        assert_eq!(metadata.instrument_config.get("pump1").unwrap(), "syringe-5mL");
        assert_eq!(metadata.software_version, env!("CARGO_PKG_VERSION"));
    }
}
