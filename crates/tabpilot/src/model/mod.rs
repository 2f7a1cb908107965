pub mod definition;
pub mod event;
pub mod ids;
pub mod run;

pub use definition::*;
pub use event::*;
pub use ids::{RunId, TargetId, TestId};
pub use run::*;
