mod synthetic;

pub use synthetic::{SourceSummary, SyntheticSource};
