pub mod engine;
pub mod error;
pub mod line;
pub mod link;
pub mod linetype;
pub mod record;
pub mod registry;
pub mod report;
pub mod sequence;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::Database;
pub use error::{Result, VellumError};
pub use line::Line;
pub use linetype::{ChildSpec, InlineSpec, Linetype};
pub use record::{RecordFormat, TableInfo};
pub use registry::{Registry, RegistryBuilder};
pub use report::{Listen, Report};
pub use sequence::Sequence;
pub use store::Store;
