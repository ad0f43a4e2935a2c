pub mod elf;
pub mod elf_loader;

pub use elf_loader::{load_elf, LoadError, LoadedProgram};
