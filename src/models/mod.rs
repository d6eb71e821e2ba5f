pub mod enums;
pub mod document;
pub mod conversation;
pub mod knowledge;

pub use document::*;
pub use conversation::*;
pub use knowledge::*;
