// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tunables of the command-submission and descriptor managers.

use super::api::DescriptorType;
use super::error::{RhiError, RhiResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Sizes and behaviors of every pool and heap owned by an RHI device.
///
/// Passed by value at construction of each pool. Missing fields in a RON
/// document fall back to [`RhiSettings::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RhiSettings {
    /// Descriptors per CPU-only heap segment.
    pub offline_segment_capacity: u32,
    /// Maximum number of segments an offline heap may grow to.
    pub max_offline_segments: u32,
    /// Descriptors per block of the shader-visible resource heap.
    pub online_resource_block_size: u32,
    /// Number of blocks in the shader-visible resource heap.
    pub online_resource_block_count: u32,
    /// Descriptors per block of the shader-visible sampler heap.
    pub online_sampler_block_size: u32,
    /// Number of blocks in the shader-visible sampler heap.
    pub online_sampler_block_count: u32,
    /// Size in bytes of a shared upload page. Larger requests get a dedicated buffer.
    pub upload_page_size: u64,
    /// Idle upload pages kept for reuse. Extra pages are destroyed.
    pub max_pooled_upload_pages: usize,
    /// Constant buffer table length per stage.
    pub constant_buffer_slots: u32,
    /// Shader resource table length per stage.
    pub shader_resource_slots: u32,
    /// Unordered access table length per stage.
    pub unordered_access_slots: u32,
    /// Sampler table length per stage.
    pub sampler_slots: u32,
    /// Upper bound on blocking fence waits, in milliseconds. `None` waits forever.
    pub gpu_timeout_ms: Option<u64>,
    /// Re-upload every descriptor table on each commit, ignoring dirty tracking.
    pub force_rebinding: bool,
}

impl Default for RhiSettings {
    fn default() -> Self {
        Self {
            offline_segment_capacity: 1024,
            max_offline_segments: 32,
            online_resource_block_size: 1024,
            online_resource_block_count: 64,
            online_sampler_block_size: 64,
            online_sampler_block_count: 32,
            upload_page_size: 2 * 1024 * 1024,
            max_pooled_upload_pages: 8,
            constant_buffer_slots: 16,
            shader_resource_slots: 32,
            unordered_access_slots: 16,
            sampler_slots: 16,
            gpu_timeout_ms: None,
            force_rebinding: false,
        }
    }
}

impl RhiSettings {
    /// Parses settings from a RON document and validates them.
    pub fn from_ron_str(source: &str) -> RhiResult<Self> {
        let settings: RhiSettings =
            ron::from_str(source).map_err(|e| RhiError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads and parses a RON settings file.
    pub fn load(path: impl AsRef<Path>) -> RhiResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| RhiError::InvalidSettings(format!("{}: {e}", path.display())))?;
        log::debug!("Loading RHI settings from '{}'", path.display());
        Self::from_ron_str(&source)
    }

    /// Serializes the settings to a pretty-printed RON document.
    pub fn to_ron_string(&self) -> RhiResult<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| RhiError::InvalidSettings(e.to_string()))
    }

    /// Rejects zero sizes and descriptor tables that cannot fit in one online block.
    pub fn validate(&self) -> RhiResult<()> {
        let non_zero = [
            ("offline_segment_capacity", self.offline_segment_capacity as u64),
            ("max_offline_segments", self.max_offline_segments as u64),
            ("online_resource_block_size", self.online_resource_block_size as u64),
            ("online_resource_block_count", self.online_resource_block_count as u64),
            ("online_sampler_block_size", self.online_sampler_block_size as u64),
            ("online_sampler_block_count", self.online_sampler_block_count as u64),
            ("upload_page_size", self.upload_page_size),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(RhiError::InvalidSettings(format!("{name} must be non-zero")));
            }
        }

        for ty in DescriptorType::ALL {
            let len = self.table_size(ty);
            let block = match ty {
                DescriptorType::Sampler => self.online_sampler_block_size,
                _ => self.online_resource_block_size,
            };
            if len > block {
                return Err(RhiError::InvalidSettings(format!(
                    "{ty:?} table of {len} slots does not fit in an online block of {block}"
                )));
            }
        }
        Ok(())
    }

    /// Length of the per-stage descriptor table of the given type.
    pub fn table_size(&self, ty: DescriptorType) -> u32 {
        match ty {
            DescriptorType::ConstantBuffer => self.constant_buffer_slots,
            DescriptorType::ShaderResource => self.shader_resource_slots,
            DescriptorType::UnorderedAccess => self.unordered_access_slots,
            DescriptorType::Sampler => self.sampler_slots,
        }
    }

    /// The GPU wait timeout as a [`Duration`].
    pub fn gpu_timeout(&self) -> Option<Duration> {
        self.gpu_timeout_ms.map(Duration::from_millis)
    }
}
