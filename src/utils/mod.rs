pub mod shell;
pub mod template;
