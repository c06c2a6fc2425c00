pub mod classify;
pub mod config;
pub mod epistemic;
pub mod parse;

pub use classify::{MoveType, SourceClass};
pub use config::Config;
pub use epistemic::{EpistemicState, Status};
pub use parse::ToolCall;
