use super::args::*;

pub mod dispatch;
pub mod probe;
pub mod settings;
pub mod storage;

pub use dispatch::dispatch;
