pub mod base;
pub mod logging;
pub mod player;
pub mod route_planner;
pub mod voice;

pub use base::*;
pub use logging::*;
pub use player::*;
pub use route_planner::*;
pub use voice::*;
