//! Flow Collection Manager: the cooperative scheduler, the collector
//! plugin host and the process memory watchdog.

pub mod collector;
pub mod manager;
pub mod memory;

pub use collector::{CollectorPlugin, PluginCtx, PluginParams, PluginTable};
pub use manager::{FcmConfig, FcmManager, FlowSource, NodeStatePublisher};
pub use memory::MemUsage;
