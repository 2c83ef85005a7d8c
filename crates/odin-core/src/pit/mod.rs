//! Partition Information Table parsing and the partition catalog.

pub mod catalog;
pub mod parser;

pub use catalog::{Partition, PartitionCatalog};
pub use parser::PitParser;
