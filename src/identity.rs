use std::sync::RwLock;

use tracing::info;

/// The signed-in user as seen by outgoing requests.
pub trait Identity: Send + Sync {
    /// Bearer token to attach, `None` when anonymous.
    fn bearer_token(&self) -> Option<String>;
    fn sign_out(&self);
}

/// A fixed ID token, e.g. from `GODMODE_ID_TOKEN`.
#[derive(Debug, Default)]
pub struct TokenIdentity {
    token: RwLock<Option<String>>,
}

impl TokenIdentity {
    pub fn new(token: Option<String>) -> Self {
        Self { token: RwLock::new(token.filter(|t| !t.is_empty())) }
    }

    #[cfg(test)]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_signed_in(&self) -> bool {
        self.bearer_token().is_some()
    }
}

impl Identity for TokenIdentity {
    fn bearer_token(&self) -> Option<String> {
        match self.token.read() {
            Ok(t) => t.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn sign_out(&self) {
        info!("signing out");
        match self.token.write() {
            Ok(mut t) => *t = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_out_drops_token() {
        let id = TokenIdentity::new(Some("tok".into()));
        assert!(id.is_signed_in());
        id.sign_out();
        assert!(!id.is_signed_in());
        assert!(!TokenIdentity::new(Some(String::new())).is_signed_in());
    }
}
