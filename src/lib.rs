#![forbid(unsafe_code)]

// Huddle library - session orchestration for SFU-backed multi-party calls

pub mod config;
pub mod media;
pub mod metrics;
pub mod session;
pub mod signaling;
pub mod turn;
