// Shared helpers: log formatting, path handling, input validation

pub mod logging;
pub mod path_resolver;
pub mod validation;
