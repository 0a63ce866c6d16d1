use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::envelope::{BearerToken, Envelope, SessionDescriptor};
use crate::errors::IdentityError;
use crate::ids::ClientToken;

const USER_TOKEN_HEX_LEN: usize = 24;
const ANON_TOKEN_LEN: usize = 12;

/// External identity capability: a stable user id and a short-lived bearer
/// credential fetched on demand.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;

    async fn bearer_token(&self) -> Result<Option<SecretString>, IdentityError>;
}

/// Visitor with no identity.
pub struct Anonymous;

#[async_trait]
impl IdentityProvider for Anonymous {
    fn current_user_id(&self) -> Option<String> {
        None
    }

    async fn bearer_token(&self) -> Result<Option<SecretString>, IdentityError> {
        Ok(None)
    }
}

/// Fixed identity, e.g. supplied on the command line.
pub struct StaticIdentity {
    user_id: String,
    token: Option<SecretString>,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            user_id: user_id.into(),
            token,
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }

    async fn bearer_token(&self) -> Result<Option<SecretString>, IdentityError> {
        Ok(self.token.clone())
    }
}

#[derive(Clone, Debug)]
struct Binding {
    token: ClientToken,
    user_id: Option<String>,
}

/// Derives the per-session correlation token and stamps outbound envelopes.
///
/// The token is fixed on first use and survives reconnects and later identity
/// changes for the binder's lifetime.
pub struct IdentityBinder {
    provider: Arc<dyn IdentityProvider>,
    binding: OnceLock<Binding>,
}

impl IdentityBinder {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            binding: OnceLock::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(Arc::new(Anonymous))
    }

    fn binding(&self) -> &Binding {
        self.binding.get_or_init(|| match self.provider.current_user_id() {
            Some(user_id) => Binding {
                token: derive_user_token(&user_id),
                user_id: Some(user_id),
            },
            None => Binding {
                token: anonymous_token(),
                user_id: None,
            },
        })
    }

    pub fn client_token(&self) -> &ClientToken {
        &self.binding().token
    }

    pub fn user_id(&self) -> Option<&str> {
        self.binding().user_id.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.binding().user_id.is_none()
    }

    pub fn session_descriptor(&self) -> SessionDescriptor {
        let binding = self.binding();
        SessionDescriptor {
            session_id: binding.token.to_string(),
            user_id: binding.user_id.clone(),
            is_anonymous: binding.user_id.is_none(),
        }
    }

    pub fn analysis_request(&self, prompt: impl Into<String>) -> Envelope {
        Envelope::AnalysisRequest {
            prompt: prompt.into(),
            client_id: self.client_token().clone(),
            session_data: self.session_descriptor(),
            timestamp: Utc::now(),
        }
    }

    /// Build the `authenticate` frame sent after every successful open.
    pub async fn authenticate_frame(&self) -> Result<Envelope, IdentityError> {
        let binding = self.binding().clone();
        let token = if binding.user_id.is_some() {
            self.provider
                .bearer_token()
                .await?
                .map(|secret| BearerToken::new(secret.expose_secret()))
        } else {
            None
        };
        Ok(Envelope::Authenticate {
            token,
            anonymous: binding.user_id.is_none(),
            user_id: binding.user_id,
            timestamp: Utc::now(),
        })
    }
}

/// Stable token for an authenticated user: same user, same token.
pub fn derive_user_token(user_id: &str) -> ClientToken {
    let digest = Sha256::digest(user_id.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    ClientToken::from_raw(format!("user_{}", &hex[..USER_TOKEN_HEX_LEN]))
}

pub fn anonymous_token() -> ClientToken {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ANON_TOKEN_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    ClientToken::from_raw(format!("anon_{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Identity that can sign in after the binder was created.
    struct SwitchableIdentity {
        user: Mutex<Option<String>>,
    }

    #[async_trait]
    impl IdentityProvider for SwitchableIdentity {
        fn current_user_id(&self) -> Option<String> {
            self.user.lock().unwrap().clone()
        }

        async fn bearer_token(&self) -> Result<Option<SecretString>, IdentityError> {
            Ok(Some(SecretString::from("jwt-token")))
        }
    }

    #[test]
    fn user_token_is_deterministic() {
        let a = derive_user_token("user_2abc");
        let b = derive_user_token("user_2abc");
        let c = derive_user_token("user_other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("user_"));
        assert_eq!(a.as_str().len(), "user_".len() + USER_TOKEN_HEX_LEN);
    }

    #[test]
    fn anonymous_tokens_are_random_and_lowercase() {
        let a = anonymous_token();
        let b = anonymous_token();
        assert_ne!(a, b);
        assert!(a.is_anonymous());
        let suffix = &a.as_str()["anon_".len()..];
        assert_eq!(suffix.len(), ANON_TOKEN_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn binder_reuses_token_for_authenticated_user() {
        let binder = IdentityBinder::new(Arc::new(StaticIdentity::new("user_42", None)));
        let again = IdentityBinder::new(Arc::new(StaticIdentity::new("user_42", None)));
        assert_eq!(binder.client_token(), again.client_token());
        assert!(!binder.is_anonymous());
    }

    #[test]
    fn token_never_changes_after_first_use() {
        let provider = Arc::new(SwitchableIdentity {
            user: Mutex::new(None),
        });
        let binder = IdentityBinder::new(provider.clone());
        let first = binder.client_token().clone();
        assert!(first.is_anonymous());

        *provider.user.lock().unwrap() = Some("user_late".into());
        assert_eq!(binder.client_token(), &first);
        assert!(binder.is_anonymous());
    }

    #[test]
    fn analysis_request_is_stamped() {
        let binder = IdentityBinder::anonymous();
        let env = binder.analysis_request("scan my repo");
        match env {
            Envelope::AnalysisRequest { prompt, client_id, session_data, .. } => {
                assert_eq!(prompt, "scan my repo");
                assert_eq!(&client_id, binder.client_token());
                assert_eq!(session_data.session_id, client_id.as_str());
                assert!(session_data.is_anonymous);
                assert!(session_data.user_id.is_none());
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn authenticate_frame_carries_token_for_users() {
        let binder = IdentityBinder::new(Arc::new(StaticIdentity::new(
            "user_9",
            Some(SecretString::from("jwt.payload.sig")),
        )));
        let frame = binder.authenticate_frame().await.unwrap();
        match frame {
            Envelope::Authenticate { token, user_id, anonymous, .. } => {
                assert_eq!(token.unwrap().expose(), "jwt.payload.sig");
                assert_eq!(user_id.as_deref(), Some("user_9"));
                assert!(!anonymous);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn authenticate_frame_is_anonymous_without_user() {
        let binder = IdentityBinder::anonymous();
        let frame = binder.authenticate_frame().await.unwrap();
        assert!(matches!(
            frame,
            Envelope::Authenticate { token: None, user_id: None, anonymous: true, .. }
        ));
    }
}
