mod errors;

pub use errors::LspError;
