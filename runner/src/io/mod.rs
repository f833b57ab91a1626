//! Side-effecting components: configuration, processes, sandboxing,
//! collaborators and the artifact store.

pub mod collaborator;
pub mod config;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod schema;
pub mod store;
pub mod workdir;
