pub mod capability;
pub mod context;
pub mod envelope;
pub mod event;
pub mod facet;
pub mod hitl;
pub mod plan;
pub mod run;

pub use capability::*;
pub use context::*;
pub use envelope::*;
pub use event::*;
pub use facet::*;
pub use hitl::*;
pub use plan::*;
pub use run::*;
