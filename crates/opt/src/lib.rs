pub mod domtree;
pub mod loop_analysis;
pub mod optim;

pub use domtree::DomTree;
pub use loop_analysis::{Loop, LoopTree};
pub use optim::dce::DceSolver;
pub use optim::escape::{Deadline, EaConfig, Effect, EffectList, EscapeError, EscapeSolver};
