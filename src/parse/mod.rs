pub mod instruction;
pub mod recipe;

pub use instruction::{CommandExpr, Instruction, InstructionLine, KeyValue};
pub use recipe::Recipe;
