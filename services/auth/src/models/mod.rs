//! Authentication service models

pub mod account;
pub mod claims;

// Re-export for convenience
pub use account::{
    Account, AccountRole, AccountState, MfaMethod, MfaStateUpdate, NewAccount, OAuthTokenSet,
    ProfileUpdate,
};
pub use claims::SessionClaims;
