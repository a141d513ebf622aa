//! Bosun core types: tasks, binding contexts, values trees, checksums.

#![forbid(unsafe_code)]

pub mod binding;
pub mod task;
pub mod values;

pub use binding::{BindingContext, BindingPayload, BindingType, ObjectAndFilterResult, WatchEventType};
pub use task::{HookMetadata, Task, TaskType};
pub use values::{checksum_of, Values};

pub mod prelude {
    pub use super::{BindingContext, BindingType, HookMetadata, Task, TaskType, Values};
}
