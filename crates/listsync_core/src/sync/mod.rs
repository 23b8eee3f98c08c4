//! Two-source reconciliation: detection, linking, resolution and the cycle
//! engine that drives them.

pub mod clock;
pub mod detector;
pub mod engine;
pub mod linker;
pub mod pairs;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod similarity;
pub mod source;
