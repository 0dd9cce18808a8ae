pub mod node;
pub mod schedule;

pub use node::{MctsNode, NodeId};
pub use schedule::MctsSchedule;
