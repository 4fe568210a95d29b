//! Realm-address parsing for the SSH user field.
//!
//! Clients encode their destination in the SSH username:
//! - `diego:<process-guid>/<index>` for direct process access
//! - `cf:<app-guid>/<index>` for app access with a pre-obtained token
//! - `<user>@<app-guid>/<index>` for app access with platform credentials

use thiserror::Error;

/// The authentication strategy selected by the user field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Realm {
    /// Direct access by process guid, no credential check.
    Diego,
    /// App access authorized by a bearer token supplied as the password.
    Cf,
    /// App access authorized by exchanging `user` + password for a token.
    UserCredentials { user: String },
}

impl Realm {
    /// Short identifying token, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Realm::Diego => "diego",
            Realm::Cf => "cf",
            Realm::UserCredentials { .. } => "user",
        }
    }
}

/// A parsed SSH user field: realm, principal, and instance index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmAddress {
    pub realm: Realm,
    pub principal: String,
    pub index: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed realm address")]
pub struct AddressParseError;

impl RealmAddress {
    /// Parse an SSH user field.
    ///
    /// The `/<index>` suffix is required and splits at the last `/`; the
    /// principal itself is opaque. The `user@` form requires a non-empty
    /// user containing no `:`.
    pub fn parse(user: &str) -> Result<Self, AddressParseError> {
        if let Some((token, rest)) = user.split_once(':') {
            let realm = match token {
                "diego" => Some(Realm::Diego),
                "cf" => Some(Realm::Cf),
                _ => None,
            };
            if let Some(realm) = realm {
                let (principal, index) = split_index(rest)?;
                return Ok(Self {
                    realm,
                    principal: principal.to_string(),
                    index,
                });
            }
        }

        if let Some((user, rest)) = user.split_once('@') {
            if user.is_empty() || user.contains(':') {
                return Err(AddressParseError);
            }
            let (principal, index) = split_index(rest)?;
            return Ok(Self {
                realm: Realm::UserCredentials {
                    user: user.to_string(),
                },
                principal: principal.to_string(),
                index,
            });
        }

        Err(AddressParseError)
    }

    /// The canonical user-field form of this address. Parsing the result
    /// yields back the same address.
    pub fn canonical_user(&self) -> String {
        match &self.realm {
            Realm::Diego => format!("diego:{}/{}", self.principal, self.index),
            Realm::Cf => format!("cf:{}/{}", self.principal, self.index),
            Realm::UserCredentials { user } => {
                format!("{}@{}/{}", user, self.principal, self.index)
            }
        }
    }
}

fn split_index(rest: &str) -> Result<(&str, u32), AddressParseError> {
    let (principal, index) = rest.rsplit_once('/').ok_or(AddressParseError)?;
    let index = index.parse::<u32>().map_err(|_| AddressParseError)?;
    Ok((principal, index))
}
