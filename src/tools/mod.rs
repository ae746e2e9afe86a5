//! Tools the model can call during a chat turn.

pub mod registry;
pub mod roadmap;
pub mod tool;

pub use registry::ToolRegistry;
pub use roadmap::{ModifyRoadmapTool, RoadmapAction};
pub use tool::*;
