//! Resource requirements of a rental request and the capabilities a miner offers.
//!
//! Both are tagged records checked when they are decoded: unknown device kinds,
//! unknown fields and missing fields are rejected.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum DeviceRequirement {
    Cpu {
        count: u32,
    },
    Gpu {
        count: u32,
        /// Minimum memory per GPU in bytes.
        capacity: u64,
        /// Required card name, any card if unset.
        #[serde(default)]
        model: Option<String>,
    },
    Ram {
        capacity: u64,
    },
    Hard {
        capacity: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuDetails {
    pub name: String,
    /// Memory in bytes.
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum DeviceCapability {
    Cpu { count: u32 },
    Gpu { details: Vec<GpuDetails> },
    Ram { available: u64 },
    Hard { free: u64 },
}

impl DeviceCapability {
    pub fn satisfies(&self, requirement: &DeviceRequirement) -> bool {
        match (self, requirement) {
            (DeviceCapability::Cpu { count }, DeviceRequirement::Cpu { count: required }) => count >= required,
            (
                DeviceCapability::Gpu { details },
                DeviceRequirement::Gpu {
                    count,
                    capacity,
                    model,
                },
            ) => {
                let matching = details
                    .iter()
                    .filter(|gpu| gpu.capacity >= *capacity)
                    .filter(|gpu| model.as_ref().map_or(true, |model| gpu.name.contains(model.as_str())))
                    .count();
                matching >= *count as usize
            }
            (DeviceCapability::Ram { available }, DeviceRequirement::Ram { capacity }) => available >= capacity,
            (DeviceCapability::Hard { free }, DeviceRequirement::Hard { capacity }) => free >= capacity,
            _ => false,
        }
    }
}

/// Whether every requirement is met by one of the capabilities.
pub fn satisfies_all(capabilities: &[DeviceCapability], requirements: &[DeviceRequirement]) -> bool {
    requirements
        .iter()
        .all(|req| capabilities.iter().any(|cap| cap.satisfies(req)))
}
