pub mod crawl;
pub mod failure;
pub mod job;
pub mod target;
