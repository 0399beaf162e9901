/// Default compute request for an alignment job.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct JobRequirements {
    /// Virtual CPUs.
    pub vcpus: u32,
    /// Memory in MiB.
    pub memory: u32,
    /// Ephemeral storage in GiB.
    pub storage: u32,
    /// Container image identifier.
    pub image: String,
}

impl Default for JobRequirements {
    fn default() -> Self {
        Self {
            vcpus: 64,
            memory: 256_000,
            storage: 2000,
            image: "multiomics".to_string(),
        }
    }
}

impl JobRequirements {
    /// Memory rounded down to whole gigabytes, as alignment tools expect it.
    pub fn memory_gb(&self) -> u32 {
        self.memory / 1000
    }
}
