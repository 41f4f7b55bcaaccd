mod factory;
pub mod sidecar;
mod tone;

pub use factory::EngineFactory;
pub use sidecar::SidecarEngine;
pub use tone::ToneEngine;
