//! Database repositories for the authentication service

pub mod account;
pub mod backup_code;

pub use account::AccountRepository;
pub use backup_code::BackupCodeRepository;
