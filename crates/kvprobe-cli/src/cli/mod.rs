pub mod args;
pub mod commands;
pub mod confirm;
pub mod terminal;
