//! ONNX model sessions on tract
//!
//! A session owns a model path and, while loaded, an optimized runnable
//! plan. Pipelines drive sessions through [`ModelSession`] so low-memory
//! runs can unload a model between stages and reload it on next use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tract_onnx::prelude::*;
use tract_onnx::tract_core::internal::DimLike;

use crate::config::{ExecutionProvider, InferenceConfig};
use crate::error::{RuntimeError, RuntimeResult, tract_error};
use crate::tensors::{DataType, ModelMetadata, NamedTensors, TensorInfo, TensorValue};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Model runtime collaborator
pub trait ModelSession: Send + Sync {
    /// Parse and optimize the model, returning its declared inputs/outputs
    fn load(&self) -> RuntimeResult<ModelMetadata>;

    /// Release the runnable plan; safe to call when already unloaded
    fn unload(&self);

    fn is_loaded(&self) -> bool;

    /// Run inference; outputs come back in graph declaration order
    fn run(&self, inputs: &NamedTensors) -> RuntimeResult<NamedTensors>;

    /// Load unless already resident
    fn ensure_loaded(&self) -> RuntimeResult<()> {
        if !self.is_loaded() {
            self.load()?;
        }
        Ok(())
    }
}

struct LoadedModel {
    plan: Plan,
    metadata: ModelMetadata,
}

/// tract-backed session for one ONNX file
pub struct OnnxSession {
    path: PathBuf,
    config: InferenceConfig,
    provider: ExecutionProvider,
    model: RwLock<Option<Arc<LoadedModel>>>,
}

impl std::fmt::Debug for OnnxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSession")
            .field("path", &self.path)
            .field("provider", &self.provider)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl OnnxSession {
    /// Describe a session; nothing is read until [`ModelSession::load`]
    pub fn new<P: AsRef<Path>>(model_path: P, config: InferenceConfig) -> Self {
        let provider = config.select_provider();
        Self {
            path: model_path.as_ref().to_path_buf(),
            config,
            provider,
            model: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Active execution provider
    pub fn provider(&self) -> ExecutionProvider {
        self.provider
    }

    /// Metadata of the loaded model
    pub fn metadata(&self) -> Option<ModelMetadata> {
        self.model.read().as_ref().map(|m| m.metadata.clone())
    }

    /// Load on a blocking worker so async callers are not stalled by graph optimization
    pub async fn load_async(&self) -> RuntimeResult<ModelMetadata> {
        let path = self.path.clone();
        let provider = self.provider;
        let loaded = tokio::task::spawn_blocking(move || load_model(&path, provider))
            .await
            .map_err(|e| RuntimeError::ModelLoadFailed {
                reason: e.to_string(),
            })??;
        let metadata = loaded.metadata.clone();
        *self.model.write() = Some(Arc::new(loaded));
        Ok(metadata)
    }

    fn loaded(&self) -> RuntimeResult<Arc<LoadedModel>> {
        self.model
            .read()
            .clone()
            .ok_or_else(|| RuntimeError::ModelNotLoaded {
                path: self.path.display().to_string(),
            })
    }
}

impl ModelSession for OnnxSession {
    fn load(&self) -> RuntimeResult<ModelMetadata> {
        let loaded = load_model(&self.path, self.provider)?;
        let metadata = loaded.metadata.clone();
        *self.model.write() = Some(Arc::new(loaded));
        Ok(metadata)
    }

    fn unload(&self) {
        if self.model.write().take().is_some() {
            log::info!("Unloaded model {}", self.path.display());
        }
    }

    fn is_loaded(&self) -> bool {
        self.model.read().is_some()
    }

    fn run(&self, inputs: &NamedTensors) -> RuntimeResult<NamedTensors> {
        let model = self.loaded()?;

        let tract_inputs: TVec<TValue> = model
            .metadata
            .inputs
            .iter()
            .map(|info| {
                let value = inputs
                    .get(&info.name)
                    .ok_or_else(|| RuntimeError::MissingInput(info.name.clone()))?;
                let tensor: TValue = value.to_tract()?.into();
                Ok(tensor)
            })
            .collect::<RuntimeResult<_>>()?;

        let outputs = model.plan.run(tract_inputs).map_err(tract_error)?;

        model
            .metadata
            .outputs
            .iter()
            .zip(outputs.iter())
            .map(|(info, value)| {
                Ok((info.name.clone(), TensorValue::from_tract(&info.name, value)?))
            })
            .collect()
    }
}

fn load_model(path: &Path, provider: ExecutionProvider) -> RuntimeResult<LoadedModel> {
    if !path.exists() {
        return Err(RuntimeError::ModelNotFound {
            path: path.display().to_string(),
        });
    }
    let bytes = std::fs::metadata(path)?.len();

    log::info!(
        "Loading model {} ({:.1} MB) on {:?}",
        path.display(),
        bytes as f64 / (1024.0 * 1024.0),
        provider
    );

    let model = tract_onnx::onnx()
        .model_for_path(path)
        .map_err(|e| RuntimeError::ModelLoadFailed {
            reason: e.to_string(),
        })?
        .into_optimized()
        .map_err(tract_error)?;

    let metadata = ModelMetadata {
        inputs: describe(&model, model.input_outlets().map_err(tract_error)?)?,
        outputs: describe(&model, model.output_outlets().map_err(tract_error)?)?,
    };
    let plan = model.into_runnable().map_err(tract_error)?;

    log::info!(
        "Model ready: {} inputs, {} outputs",
        metadata.inputs.len(),
        metadata.outputs.len()
    );
    Ok(LoadedModel { plan, metadata })
}

fn describe(model: &TypedModel, outlets: &[OutletId]) -> RuntimeResult<Vec<TensorInfo>> {
    outlets
        .iter()
        .map(|&outlet| {
            let fact = model.outlet_fact(outlet).map_err(tract_error)?;
            let name = model
                .outlet_label(outlet)
                .map(str::to_string)
                .unwrap_or_else(|| model.node(outlet.node).name.clone());
            Ok(TensorInfo {
                name,
                data_type: DataType::from(fact.datum_type),
                shape: fact.shape.iter().map(|d| d.to_usize().ok()).collect(),
            })
        })
        .collect()
}
