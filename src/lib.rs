pub mod alert;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod error;
pub mod log;
pub mod page;
pub mod paths;
pub mod patch;
pub mod pipeline;
pub mod probe;
pub mod prompts;
pub mod publish;
pub mod python;
pub mod sandbox;
pub mod secrets;
pub mod source;
pub mod synth;
