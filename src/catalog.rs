//! Model catalog - read-only configuration describing generation models,
//! their providers, pricing tables, parameter schemas, and pipelines.
//!
//! Composite models (e.g. narrated video) declare a pipeline whose stages
//! each reference another catalog model; the orchestrator prices and
//! invokes each stage against that stage model.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};
use crate::job::Stage;
use crate::pricing::{CostTable, Multiplier};
use crate::schema::{FieldKind, FieldSpec, ParamSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    /// Call blocks until the artifact is ready or errors.
    Sync,
    /// Call returns a task id; the adapter polls on a bounded schedule.
    AsyncPoll,
}

/// Read-only description of one provider backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub provider_id: String,
    pub invocation_mode: InvocationMode,
    pub base_url: String,
    /// Name of the secret holding this provider's credentials; resolution
    /// happens outside the core.
    #[serde(default)]
    pub credentials_ref: Option<String>,
}

/// One stage of a composite pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage: Stage,
    /// Catalog model used to price and execute this stage.
    pub model_reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_reference: String,
    pub content_type: String,
    pub provider_id: String,
    pub base_cost: i64,
    #[serde(default)]
    pub cost_table: CostTable,
    #[serde(default)]
    pub schema: ParamSchema,
    /// Empty for single-stage models.
    #[serde(default)]
    pub pipeline: Vec<StageSpec>,
}

impl ModelSpec {
    /// Effective pipeline: declared stages, or a single asset-fetch stage
    /// against this model itself.
    pub fn stages(&self) -> Vec<StageSpec> {
        if self.pipeline.is_empty() {
            vec![StageSpec {
                stage: Stage::Asset,
                model_reference: self.model_reference.clone(),
            }]
        } else {
            self.pipeline.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    providers: BTreeMap<String, ProviderDescriptor>,
    #[serde(default)]
    models: BTreeMap<String, ModelSpec>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_provider(&mut self, descriptor: ProviderDescriptor) {
        self.providers
            .insert(descriptor.provider_id.clone(), descriptor);
    }

    pub fn insert_model(&mut self, spec: ModelSpec) {
        self.models.insert(spec.model_reference.clone(), spec);
    }

    pub fn model(&self, reference: &str) -> Result<&ModelSpec> {
        self.models
            .get(reference)
            .ok_or_else(|| ForgeError::ModelUnavailable(reference.to_string()))
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.providers.values()
    }

    pub fn provider(&self, id: &str) -> Result<&ProviderDescriptor> {
        self.providers
            .get(id)
            .ok_or_else(|| ForgeError::ModelUnavailable(format!("provider {id}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ForgeError::Internal(format!("read catalog: {e}")))?;
        serde_yaml::from_str(&raw).map_err(|e| ForgeError::Internal(format!("parse catalog: {e}")))
    }

    /// Catalog shipped with the binary; a YAML catalog replaces it.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();

        catalog.insert_provider(ProviderDescriptor {
            provider_id: "pixelforge".into(),
            invocation_mode: InvocationMode::Sync,
            base_url: "https://api.pixelforge.example/v1".into(),
            credentials_ref: Some("pixelforge_api_key".into()),
        });
        catalog.insert_provider(ProviderDescriptor {
            provider_id: "scriptor".into(),
            invocation_mode: InvocationMode::Sync,
            base_url: "https://api.scriptor.example/v1".into(),
            credentials_ref: Some("scriptor_api_key".into()),
        });
        catalog.insert_provider(ProviderDescriptor {
            provider_id: "narrator".into(),
            invocation_mode: InvocationMode::Sync,
            base_url: "https://api.narrator.example/v1".into(),
            credentials_ref: Some("narrator_api_key".into()),
        });
        catalog.insert_provider(ProviderDescriptor {
            provider_id: "volta".into(),
            invocation_mode: InvocationMode::AsyncPoll,
            base_url: "https://api.volta.example/v2".into(),
            credentials_ref: Some("volta_api_key".into()),
        });

        let mut image_schema = BTreeMap::new();
        image_schema.insert(
            "quality".to_string(),
            FieldSpec {
                kind: FieldKind::Enum {
                    values: vec!["Standard".into(), "HD".into()],
                    default: Some("Standard".into()),
                },
                editable: true,
                hidden: false,
            },
        );
        image_schema.insert(
            "uploaded_image".to_string(),
            FieldSpec {
                kind: FieldKind::FileRef { max_count: 4 },
                editable: true,
                hidden: false,
            },
        );
        image_schema.insert(
            "watermark".to_string(),
            FieldSpec {
                kind: FieldKind::Boolean { default: true },
                editable: false,
                hidden: true,
            },
        );
        let mut image_costs = CostTable::new();
        image_costs.insert(
            "quality".into(),
            Multiplier::ValueKeyed(
                [("Standard".to_string(), 1.0), ("HD".to_string(), 1.5)]
                    .into_iter()
                    .collect(),
            ),
        );
        image_costs.insert("uploaded_image".into(), Multiplier::Flat(2.0));
        catalog.insert_model(ModelSpec {
            model_reference: "image-basic".into(),
            content_type: "image".into(),
            provider_id: "pixelforge".into(),
            base_cost: 10,
            cost_table: image_costs,
            schema: ParamSchema::new(image_schema),
            pipeline: Vec::new(),
        });

        catalog.insert_model(ModelSpec {
            model_reference: "script-basic".into(),
            content_type: "text".into(),
            provider_id: "scriptor".into(),
            base_cost: 4,
            cost_table: CostTable::new(),
            schema: ParamSchema::default(),
            pipeline: Vec::new(),
        });

        let mut voice_costs = CostTable::new();
        // Per-character narration cost; `script_chars` is injected by the
        // orchestrator from the approved script.
        voice_costs.insert("script_chars".into(), Multiplier::Flat(0.01));
        catalog.insert_model(ModelSpec {
            model_reference: "voice-standard".into(),
            content_type: "voice".into(),
            provider_id: "narrator".into(),
            base_cost: 5,
            cost_table: voice_costs,
            schema: ParamSchema::default(),
            pipeline: Vec::new(),
        });

        let mut video_costs = CostTable::new();
        video_costs.insert("duration_secs".into(), Multiplier::Flat(0.5));
        catalog.insert_model(ModelSpec {
            model_reference: "video-clip".into(),
            content_type: "video".into(),
            provider_id: "volta".into(),
            base_cost: 20,
            cost_table: video_costs,
            schema: ParamSchema::default(),
            pipeline: Vec::new(),
        });

        catalog.insert_model(ModelSpec {
            model_reference: "assemble-av".into(),
            content_type: "video".into(),
            provider_id: "volta".into(),
            base_cost: 3,
            cost_table: CostTable::new(),
            schema: ParamSchema::default(),
            pipeline: Vec::new(),
        });

        catalog.insert_model(ModelSpec {
            model_reference: "video-narrated".into(),
            content_type: "video".into(),
            provider_id: "volta".into(),
            base_cost: 0,
            cost_table: CostTable::new(),
            schema: ParamSchema::default(),
            pipeline: vec![
                StageSpec {
                    stage: Stage::Script,
                    model_reference: "script-basic".into(),
                },
                StageSpec {
                    stage: Stage::Voice,
                    model_reference: "voice-standard".into(),
                },
                StageSpec {
                    stage: Stage::Asset,
                    model_reference: "video-clip".into(),
                },
                StageSpec {
                    stage: Stage::Assembly,
                    model_reference: "assemble-av".into(),
                },
            ],
        });

        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_internally_consistent() {
        let catalog = Catalog::builtin();
        // Every model's provider and every pipeline stage model resolves.
        for reference in ["image-basic", "video-narrated", "voice-standard"] {
            let model = catalog.model(reference).unwrap();
            catalog.provider(&model.provider_id).unwrap();
            for stage in model.stages() {
                let stage_model = catalog.model(&stage.model_reference).unwrap();
                catalog.provider(&stage_model.provider_id).unwrap();
            }
        }
    }

    #[test]
    fn single_stage_model_defaults_to_asset_fetch() {
        let catalog = Catalog::builtin();
        let stages = catalog.model("image-basic").unwrap().stages();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].stage, Stage::Asset);
        assert_eq!(stages[0].model_reference, "image-basic");
    }

    #[test]
    fn composite_pipeline_order_is_declared() {
        let catalog = Catalog::builtin();
        let stages = catalog.model("video-narrated").unwrap().stages();
        let order: Vec<_> = stages.iter().map(|s| s.stage).collect();
        assert_eq!(
            order,
            vec![Stage::Script, Stage::Voice, Stage::Asset, Stage::Assembly]
        );
    }

    #[test]
    fn unknown_model_is_unavailable() {
        let err = Catalog::builtin().model("does-not-exist").unwrap_err();
        assert_eq!(err.kind(), "model_unavailable");
    }
}
