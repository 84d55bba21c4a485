//! Attention key/value caches
//!
//! Slots are laid out per layer: `[key, value]` for decoder-only models and
//! `[key, value, encoder_key, encoder_value]` for encoder-decoder models.

use std::fmt;

use ts_core::Tensor;

use crate::error::{GenerateError, GenerateResult};
use crate::model::DecoderConfig;

/// Per-layer attention cache owned by one sequence
pub trait KvCache: Send + fmt::Debug {
    fn is_initialized(&self) -> bool;

    /// Allocate zeroed slots; `initial_size` is the static sequence length
    fn initialize(&mut self, initial_size: usize);

    /// Every slot in layer order
    fn values(&self) -> GenerateResult<&[Tensor<f32>]>;

    /// Fold in a decoder call's present key/values
    fn update(&mut self, current: &[Tensor<f32>], use_branch_cache: bool) -> GenerateResult<()>;

    /// Deep copy with independent buffers
    fn clone_box(&self) -> Box<dyn KvCache>;

    /// Release every buffer; safe to call repeatedly
    fn dispose(&mut self);
}

impl Clone for Box<dyn KvCache> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Check a present tensor against the configured head layout
fn check_slot(tensor: &Tensor<f32>, config: &DecoderConfig) -> GenerateResult<()> {
    let dims = tensor.dimensions();
    if dims.len() != 4 {
        return Err(GenerateError::ConfigurationMismatch {
            what: "cache tensor rank",
            expected: 4,
            got: dims.len(),
        });
    }
    if dims[1] != config.num_kv_heads {
        return Err(GenerateError::ConfigurationMismatch {
            what: "attention heads",
            expected: config.num_kv_heads,
            got: dims[1],
        });
    }
    if dims[3] != config.head_dim {
        return Err(GenerateError::ConfigurationMismatch {
            what: "head dimension",
            expected: config.head_dim,
            got: dims[3],
        });
    }
    Ok(())
}

fn check_count(current: &[Tensor<f32>], expected: usize) -> GenerateResult<()> {
    if current.len() != expected {
        return Err(GenerateError::ConfigurationMismatch {
            what: "cache slot count",
            expected,
            got: current.len(),
        });
    }
    Ok(())
}

/// Self-attention cache for decoder-only models
#[derive(Debug, Clone)]
pub struct DecoderKvCache {
    config: DecoderConfig,
    values: Vec<Tensor<f32>>,
    initialized: bool,
}

impl DecoderKvCache {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            values: Vec::new(),
            initialized: false,
        }
    }
}

impl KvCache for DecoderKvCache {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self, initial_size: usize) {
        let dims = [1, self.config.num_kv_heads, initial_size, self.config.head_dim];
        self.values = (0..self.config.num_layers * 2)
            .map(|_| Tensor::zeros(&dims))
            .collect();
        self.initialized = true;
    }

    fn values(&self) -> GenerateResult<&[Tensor<f32>]> {
        if !self.initialized {
            return Err(GenerateError::CacheNotInitialized);
        }
        Ok(&self.values)
    }

    fn update(&mut self, current: &[Tensor<f32>], _use_branch_cache: bool) -> GenerateResult<()> {
        if !self.initialized {
            return Err(GenerateError::CacheNotInitialized);
        }
        check_count(current, self.values.len())?;
        for tensor in current {
            check_slot(tensor, &self.config)?;
        }
        self.values = current.to_vec();
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn KvCache> {
        Box::new(self.clone())
    }

    fn dispose(&mut self) {
        self.values = Vec::new();
        self.initialized = false;
    }
}

/// Self- and cross-attention cache for encoder-decoder models
#[derive(Debug, Clone)]
pub struct EncoderDecoderKvCache {
    config: DecoderConfig,
    values: Vec<Tensor<f32>>,
    initialized: bool,
}

impl EncoderDecoderKvCache {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            values: Vec::new(),
            initialized: false,
        }
    }
}

impl KvCache for EncoderDecoderKvCache {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self, initial_size: usize) {
        let heads = self.config.num_kv_heads;
        let head_dim = self.config.head_dim;
        let decoder_dims = [1, heads, 1, head_dim];
        let encoder_dims = [1, heads, initial_size, head_dim];
        self.values = (0..self.config.num_layers * 4)
            .map(|slot| {
                if slot % 4 < 2 {
                    Tensor::zeros(&decoder_dims)
                } else {
                    Tensor::zeros(&encoder_dims)
                }
            })
            .collect();
        self.initialized = true;
    }

    fn values(&self) -> GenerateResult<&[Tensor<f32>]> {
        if !self.initialized {
            return Err(GenerateError::CacheNotInitialized);
        }
        Ok(&self.values)
    }

    fn update(&mut self, current: &[Tensor<f32>], use_branch_cache: bool) -> GenerateResult<()> {
        if !self.initialized {
            return Err(GenerateError::CacheNotInitialized);
        }
        check_count(current, self.values.len())?;
        for tensor in current {
            check_slot(tensor, &self.config)?;
        }

        for (slot, tensor) in current.iter().enumerate() {
            // Encoder state is static after the first pass
            let is_encoder_slot = slot % 4 >= 2;
            if is_encoder_slot && use_branch_cache {
                continue;
            }
            self.values[slot] = tensor.clone();
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn KvCache> {
        Box::new(self.clone())
    }

    fn dispose(&mut self) {
        self.values = Vec::new();
        self.initialized = false;
    }
}
