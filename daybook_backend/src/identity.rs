use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

use crate::error::ValidationError;

/// Opaque user identifier handed to us by the external auth provider.
///
/// Every store path is derived from it, so an identifier that could step out
/// of its own `users/{id}` partition is rejected here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.contains('/') {
            return Err(ValidationError::InvalidIdentity(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Producer side of the auth provider's identity-changed events.
pub struct IdentityPublisher {
    tx: watch::Sender<Option<Identity>>,
}

/// Read side: screens only ever look at the current identity.
#[derive(Clone)]
pub struct IdentityWatch {
    rx: watch::Receiver<Option<Identity>>,
}

pub fn identity_channel(initial: Option<Identity>) -> (IdentityPublisher, IdentityWatch) {
    let (tx, rx) = watch::channel(initial);
    (IdentityPublisher { tx }, IdentityWatch { rx })
}

impl IdentityPublisher {
    pub fn publish(&self, identity: Option<Identity>) {
        self.tx.send_if_modified(|current| {
            if *current == identity {
                return false;
            }
            match &identity {
                Some(next) => tracing::debug!("Identity changed to {}", next),
                None => tracing::debug!("Identity signed out"),
            }
            *current = identity;
            true
        });
    }

    pub fn sign_in(&self, identity: Identity) {
        self.publish(Some(identity));
    }

    pub fn sign_out(&self) {
        self.publish(None);
    }
}

impl IdentityWatch {
    pub fn current(&self) -> Option<Identity> {
        self.rx.borrow().clone()
    }

    /// Wait for the next identity change. Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Option<Identity>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// A watch pinned to one identity, for callers without an auth provider.
    pub fn fixed(identity: Option<Identity>) -> Self {
        let (_, rx) = watch::channel(identity);
        Self { rx }
    }
}
