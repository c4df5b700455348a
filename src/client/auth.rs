use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// Use an API key authentication via headers
    Apikey(String),
    /// Use username and password authentication via Basic Auth headers
    Basic(String, String),
    /// Don't use any authentication
    None,
}

impl Auth {
    pub fn new(
        r#type: &AuthType,
        username: Option<String>,
        password: Option<String>,
        apikey: Option<String>,
    ) -> Self {
        match (r#type, username, password, apikey) {
            (AuthType::Apikey, _, _, Some(apikey)) => Self::Apikey(apikey),
            (AuthType::Basic, Some(username), Some(password), _) => Self::Basic(username, password),
            _ => Self::None,
        }
    }

    /// Resolve a credential reference against the process environment
    ///
    /// # Errors
    /// Returns an error if a named environment variable is not set.
    pub fn from_credential(credential: Option<&CredentialRef>) -> Result<Self> {
        let Some(credential) = credential else {
            return Ok(Self::None);
        };
        let read = |name: &Option<String>| -> Result<Option<String>> {
            name.as_deref()
                .map(|var| {
                    std::env::var(var)
                        .with_context(|| format!("Credential variable {} is not set", var))
                })
                .transpose()
        };
        let auth = Self::new(
            &credential.r#type,
            credential.username.clone(),
            read(&credential.password_env)?,
            read(&credential.apikey_env)?,
        );
        if auth == Self::None && credential.r#type != AuthType::None {
            bail!(
                "Credential of type {} is incomplete",
                credential.r#type.as_str()
            );
        }
        Ok(auth)
    }
}

impl std::fmt::Display for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apikey(_) => write!(f, "Apikey"),
            Self::Basic(_, _) => write!(f, "Basic"),
            Self::None => write!(f, "None"),
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secrets
        write!(f, "Auth({})", self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Apikey,
    Basic,
    None,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apikey => "apikey",
            Self::Basic => "basic",
            Self::None => "none",
        }
    }
}

/// Names the environment variables holding a store's secrets
///
/// Job files carry only this reference; the secrets themselves are read
/// from the environment (or a `.env` file) when the client is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    #[serde(rename = "type")]
    pub r#type: AuthType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub apikey_env: Option<String>,
}
