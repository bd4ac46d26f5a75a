mod index;

pub use index::{FragmentEntry, FragmentIndex, Retention};
