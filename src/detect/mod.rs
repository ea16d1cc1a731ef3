mod backend;
mod backends;
pub mod postprocess;
mod registry;
mod result;

pub use backend::Classifier;
pub use backends::{ReplayClassifier, StubClassifier};
#[cfg(feature = "backend-tract")]
pub use backends::TractClassifier;
pub use registry::{build_classifier, ClassifierConfig, BACKEND_NAMES};
pub use result::{mean_confidence, Detection};
