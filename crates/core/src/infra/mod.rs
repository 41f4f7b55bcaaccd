pub mod artifacts;
pub mod dead_letter;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod tts;
