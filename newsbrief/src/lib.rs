// Library interface for newsbrief modules
// This allows tests and the binaries to import modules

pub mod assembler;
pub mod email;
pub mod error;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod schedule;
pub mod scraping;
pub mod search;
pub mod setup;
pub mod storage;
