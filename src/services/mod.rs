pub mod browser;
pub mod describe;
pub mod fetcher;
pub mod processor;
pub mod queue;
pub mod robots;
pub mod submit;
