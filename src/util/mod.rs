pub mod ext;
pub mod shell;
