pub mod common;
pub mod disasm;
pub mod discover;
pub mod hash;
pub mod process;
