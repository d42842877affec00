pub mod chat;
pub mod config;
pub mod dialogue;
pub mod outcomes;
pub mod records;
pub mod tags;
