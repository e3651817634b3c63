pub mod fs;
pub mod memory;
pub mod traits;

pub use fs::{FsEvidenceSource, FsSubmissionStore};
pub use memory::{InMemoryEvidence, InMemoryStore};
pub use traits::*;
