//! `taskboard-auth`: account identity, credentials, and tokens.
//!
//! No HTTP or storage code lives here. The crate owns the
//! user record shape, the rules deciding what a profile update touches, and the
//! hashing/signing collaborators behind traits.

pub mod claims;
pub mod password;
pub mod profile;
pub mod roles;
pub mod tokens;
pub mod user;

pub use claims::{TokenClaims, TokenValidationError, validate_claims};
pub use password::{BcryptPasswordHasher, PasswordError, PasswordHasher, validate_password};
pub use profile::{AvatarUpload, ProfileUpdate};
pub use roles::Role;
pub use tokens::{Hs256TokenIssuer, TokenError, TokenIssuer, TokenKind, TokenPair, TokenSettings};
pub use user::{NewUser, PublicUser, UserLookup, UserPatch, UserRecord};
