mod prologue;
mod recipe;
mod regs;

pub use prologue::*;
pub use recipe::*;
pub use regs::*;
