//! Identity scope
//!
//! Tracks who is signed in and ties every open feed to that identity. An
//! identity change first swaps the identity and bumps its generation, then
//! tears down the registry. A subscriber registers its handle before reading
//! the generation a second time, so it is either caught by the teardown or
//! sees the generation move and closes itself. No feed outlives the user it
//! was opened for.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;
use types::ids::UserId;

use crate::registry::SubscriptionRegistry;

#[derive(Default)]
struct Identity {
    user: Option<UserId>,
    /// Bumped on every sign-in and sign-out.
    generation: u64,
}

pub struct Session {
    identity: RwLock<Identity>,
    registry: SubscriptionRegistry,
}

impl Session {
    /// An anonymous session bound to `registry`.
    pub fn new(registry: SubscriptionRegistry) -> Self {
        Self {
            identity: RwLock::new(Identity::default()),
            registry,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Identity> {
        self.identity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Identity> {
        self.identity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The signed-in user, if any.
    pub fn current_user(&self) -> Option<UserId> {
        self.read().user.clone()
    }

    /// The signed-in user and the identity generation, read together.
    pub fn current_identity(&self) -> (Option<UserId>, u64) {
        let identity = self.read();
        (identity.user.clone(), identity.generation)
    }

    /// Changes on every identity change, including a sign-out while
    /// already anonymous.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn is_signed_in(&self) -> bool {
        self.current_user().is_some()
    }

    /// Sign in as `user`.
    ///
    /// Any identity change, including leaving the anonymous state, cancels
    /// every registered subscription first. Signing in again as the same
    /// user is a no-op.
    pub fn sign_in(&self, user: UserId) {
        {
            let mut identity = self.write();
            if identity.user.as_ref() == Some(&user) {
                return;
            }
            identity.user = Some(user.clone());
            identity.generation += 1;
        }
        info!(user = %user, "Signed in");

        // Runs without the identity lock: a capability may wait on a
        // callback that reads the session.
        let report = self.registry.cancel_all();
        info!(
            cancelled = report.invoked,
            failed = report.failed,
            "Identity changed, subscriptions torn down"
        );
    }

    /// Sign out, cancelling every registered subscription.
    pub fn sign_out(&self) {
        let previous = {
            let mut identity = self.write();
            identity.generation += 1;
            identity.user.take()
        };
        let report = self.registry.cancel_all();

        info!(
            user = previous.as_ref().map(|u| u.as_str()).unwrap_or("anonymous"),
            cancelled = report.invoked,
            failed = report.failed,
            "Signed out"
        );
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }
}
