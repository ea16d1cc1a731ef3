pub mod replay;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use replay::ReplayClassifier;
pub use stub::StubClassifier;

#[cfg(feature = "backend-tract")]
pub use tract::TractClassifier;
