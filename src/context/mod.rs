pub mod ignore;
pub mod safejoin;
pub mod walk;

pub use walk::{BuildContext, ContextEntry, EntryKind};
