// Config loading and validation
//
// The config pipeline: raw YAML -> raw serde structs (unknown keys are a
// hard error) -> validated typed Config. The contract hash is a SHA256
// over the raw YAML so operators can correlate a running instance with a
// reviewed config revision.

mod error;
mod loader;
mod raw;
mod source;
mod types;

pub use error::ConfigError;
pub use loader::{compute_hash, load_config};
pub use source::{ConfigSource, FileSource, StringSource};
pub use types::{
    default_prefilter_keywords, CodeDetectionConfig, Config, DatasetConfig, NormalizeConfig,
    PrefilterConfig, ScanConfig, ServerConfig,
};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
