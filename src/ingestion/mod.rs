pub mod controller;
pub mod normalize;
pub mod parser;
pub mod pattern;
pub mod personality;

pub use controller::{IngestionController, IngestionOutcome, UploadKind, UploadRequest};
pub use pattern::{BasicPatternDetector, PatternDetector};
pub use personality::{BasicPersonalityClassifier, PersonalityClassifier};
