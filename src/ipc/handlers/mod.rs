pub mod bulk;
pub mod core;
pub mod import;
pub mod reference;
pub mod setup;
