//! Execution provider selection and session configuration

use serde::{Deserialize, Serialize};

/// Execution provider for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionProvider {
    /// CPU execution using tract (pure Rust)
    Cpu,
    /// NVIDIA CUDA
    Cuda,
    /// DirectML (Windows)
    DirectMl,
}

impl ExecutionProvider {
    pub const ALL: [ExecutionProvider; 3] = [
        ExecutionProvider::Cuda,
        ExecutionProvider::DirectMl,
        ExecutionProvider::Cpu,
    ];

    /// Whether this build can execute on the provider
    ///
    /// Only the tract CPU backend is compiled in; GPU providers are accepted
    /// in configuration and fall back to CPU.
    pub fn is_available(&self) -> bool {
        matches!(self, ExecutionProvider::Cpu)
    }

    /// Get priority (higher = preferred)
    pub fn priority(&self) -> u32 {
        match self {
            ExecutionProvider::Cuda => 90,
            ExecutionProvider::DirectMl => 80,
            ExecutionProvider::Cpu => 10,
        }
    }

    pub fn is_gpu(&self) -> bool {
        !matches!(self, ExecutionProvider::Cpu)
    }
}

/// Session residency between pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemoryMode {
    /// Keep every session loaded for the whole run
    #[default]
    Maximum,
    /// Unload each session once its stage is done; reload on next use
    Minimum,
}

/// Configuration for model sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Preferred execution providers (in order)
    pub providers: Vec<ExecutionProvider>,
    /// Number of threads for CPU execution
    pub num_threads: usize,
    /// Device ID for GPU execution
    pub device_id: i32,
    pub memory_mode: MemoryMode,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            providers: ExecutionProvider::ALL.to_vec(),
            num_threads: num_cpus::get(),
            device_id: 0,
            memory_mode: MemoryMode::Maximum,
        }
    }
}

impl InferenceConfig {
    /// CPU only, sessions released between stages
    pub fn low_memory() -> Self {
        Self {
            providers: vec![ExecutionProvider::Cpu],
            memory_mode: MemoryMode::Minimum,
            ..Default::default()
        }
    }

    /// Best available provider from the configured list
    pub fn select_provider(&self) -> ExecutionProvider {
        self.providers
            .iter()
            .filter(|p| p.is_available())
            .max_by_key(|p| p.priority())
            .copied()
            .unwrap_or(ExecutionProvider::Cpu)
    }
}

/// Get all available execution providers
pub fn available_providers() -> Vec<ExecutionProvider> {
    ExecutionProvider::ALL
        .into_iter()
        .filter(|p| p.is_available())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_request_falls_back_to_cpu() {
        let config = InferenceConfig {
            providers: vec![ExecutionProvider::Cuda, ExecutionProvider::DirectMl],
            ..Default::default()
        };
        assert_eq!(config.select_provider(), ExecutionProvider::Cpu);
        assert_eq!(available_providers(), vec![ExecutionProvider::Cpu]);
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: InferenceConfig =
            serde_json::from_str(r#"{"memory_mode":"Minimum","device_id":1}"#).unwrap();
        assert_eq!(config.memory_mode, MemoryMode::Minimum);
        assert_eq!(config.device_id, 1);
        assert_eq!(config.providers.len(), 3);
        assert!(config.num_threads >= 1);
    }
}
