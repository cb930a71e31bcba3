//! Linked subforms: a parent instance spawns, updates and deletes child
//! instances of other forms based on directives attached to its nodes.
//!
//! - [`directive`]: discovery of `saveInstance`/`saveForm`/`deleteForm` nodes
//! - [`relations`]: the persistent parent-node ↔ child-node link table
//! - [`manager`]: the propagation engine tying both together
//! - [`catalog`], [`definition`], [`creation`]: instance and template storage

pub mod catalog;
pub mod creation;
pub mod definition;
pub mod directive;
pub mod manager;
pub mod media;
pub mod paths;
pub mod relations;
pub mod result;

pub use catalog::{Catalog, FormStore, InstanceRecord, InstanceStatus, InstanceStore};
pub use directive::{DirectiveKind, FormNode, SubformDirective, TreeNode};
pub use manager::SubformManager;
pub use relations::{InstanceId, RelationStore, RelationshipRecord};
pub use result::{ActionError, SubformActionResult};
