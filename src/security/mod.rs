// Integrity checks for downloaded artifacts

pub mod crypto;
