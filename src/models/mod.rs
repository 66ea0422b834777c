// Data model: catalog descriptors, persisted records, installed-state stores

pub mod catalog;
pub mod record;
pub mod state;
