//! Metadata and hash extraction run on file selection.
//!
//! Three independent steps: type sniffing, tag metadata and hashing. None of
//! them fails the others; each falls back to a neutral value on error.

mod hash;
mod pipeline;
mod types;

pub use hash::{hash_all, Digest, HashAlgorithm, HashTriple};
pub use pipeline::ExtractionPipeline;
pub use types::{
    ExtractionResult, ExtractionState, ExtractionStep, StepState, TagMap, TagValue, TypeInfo,
    UNKNOWN_DESCRIPTION, UNKNOWN_MIME,
};
