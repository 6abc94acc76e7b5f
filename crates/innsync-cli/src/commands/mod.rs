pub mod common;
pub mod completions;
pub mod conflicts;
pub mod dead_letters;
pub mod logs;
pub mod mappings;
pub mod migrate;
pub mod pull;
pub mod status;
