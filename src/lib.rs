pub mod assembler;
pub mod concat_script;
pub mod config;
pub mod encoder_args;
pub mod error_codes;
pub mod frame_log;
pub mod indexer;
pub mod recorder;
