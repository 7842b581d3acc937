pub mod canonical;
pub mod config;
pub mod logging;
pub mod merge;
pub mod proxy;
pub mod recorder;
pub mod redaction;
pub mod store;
pub mod stub;
pub mod upstream;
