//! Backing-instance store client
//!
//! Wraps a [`ServerApi`] with the lookup, creation and teardown semantics
//! the engine relies on: exact-hostname lookups, idempotent destroy,
//! bounded retry of transient failures, and scoped ownership of freshly
//! created instances through [`InstanceGuard`].

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::{debug, info, warn};

use dkcloud_common::retry::{retry_with_backoff, RetryConfig, RetryError};
use dkcloud_common::{Error, ProviderConfig, Result};

use crate::api::{ApiError, LogBody, ServerApi, ServerCreateBody};
use crate::types::{BackingInstance, CapacityTier};

/// Resource name used in `NotFound` errors
pub const SERVER_RESOURCE: &str = "cloud server";

/// Length of generated root passwords
pub const PASSWORD_LENGTH: usize = 64;

/// Retry budgets per kind of store call
#[derive(Clone, Debug)]
pub struct StoreRetryPolicy {
    /// Lookups (list, get)
    pub read: RetryConfig,
    /// Create requests; a POST is not safe to repeat
    pub create: RetryConfig,
    /// Destroy requests
    pub destroy: RetryConfig,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            read: RetryConfig::fixed(3, Duration::from_secs(2)),
            create: RetryConfig::once(),
            destroy: RetryConfig::fixed(60, Duration::from_secs(10)),
        }
    }
}

/// Store client used by the engine
#[derive(Clone)]
pub struct InstanceStore {
    api: Arc<dyn ServerApi>,
    retry: StoreRetryPolicy,
    template: String,
}

impl InstanceStore {
    /// Create a store client over the given API
    pub fn new(api: Arc<dyn ServerApi>, config: &ProviderConfig) -> Self {
        Self {
            api,
            retry: StoreRetryPolicy::default(),
            template: config.template().to_string(),
        }
    }

    /// Override the retry budgets
    pub fn with_retry_policy(mut self, retry: StoreRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Find the instance with exactly this hostname.
    ///
    /// The store filters loosely, so results are matched again here.
    pub async fn find_by_hostname(&self, hostname: &str) -> Result<Option<BackingInstance>> {
        let servers = retry_with_backoff(&self.retry.read, "list_servers", || {
            self.api.list_servers(hostname)
        })
        .await
        .map_err(|e| store_error("list", hostname, e))?;

        let found = servers
            .into_iter()
            .find(|s| s.hostname == hostname)
            .map(BackingInstance::from);
        debug!(hostname = %hostname, found = found.is_some(), "Looked up instance by hostname");
        Ok(found)
    }

    /// Fetch an instance by identifier; a missing instance is `NotFound`
    pub async fn find_by_id(&self, id: &str) -> Result<BackingInstance> {
        let server = retry_with_backoff(&self.retry.read, "get_server", || self.api.get_server(id))
            .await
            .map_err(|e| store_error("get", id, e))?;
        Ok(BackingInstance::from(server))
    }

    /// Job log of an instance
    pub async fn job_log(&self, id: &str) -> Result<Vec<LogBody>> {
        retry_with_backoff(&self.retry.read, "list_server_logs", || {
            self.api.list_server_logs(id)
        })
        .await
        .map_err(|e| store_error("list logs", id, e))
    }

    /// Create an instance and hand it back under a teardown guard.
    ///
    /// Fails with `InconsistentState`, after destroying the instance, if the
    /// store reports it without any network address.
    pub async fn create(
        &self,
        location: &str,
        tier: CapacityTier,
        hostname: &str,
    ) -> Result<InstanceGuard> {
        let root_password = generate_password();
        let body = ServerCreateBody {
            hostname: hostname.to_string(),
            label: hostname.to_string(),
            initial_root_password: root_password.clone(),
            package: tier.package_id().to_string(),
            template: self.template.clone(),
            location: location.to_string(),
        };

        info!(
            hostname = %hostname,
            package = tier.package_id(),
            location = %location,
            "Creating cloud server"
        );
        let server = retry_with_backoff(&self.retry.create, "create_server", || {
            self.api.create_server(&body)
        })
        .await
        .map_err(|e| store_error("create", hostname, e))?;

        let guard = InstanceGuard::new(self.clone(), BackingInstance::from(server), root_password);

        if guard.instance().primary_address().is_none() {
            warn!(hostname = %hostname, id = %guard.instance().id, "Created server has no network interfaces");
            if let Err(e) = guard.abort().await {
                warn!(hostname = %hostname, error = %e, "Failed to destroy server without network interfaces");
            }
            return Err(Error::inconsistent_state(
                hostname,
                "no network interfaces were created for the server",
            ));
        }

        Ok(guard)
    }

    /// Destroy an instance; an instance that is already gone counts as destroyed
    pub async fn destroy(&self, id: &str) -> Result<()> {
        info!(id = %id, "Destroying cloud server");
        let result = retry_with_backoff(&self.retry.destroy, "delete_server", || {
            self.api.delete_server(id)
        })
        .await;
        match result {
            Ok(()) | Err(RetryError::Rejected(ApiError::NotFound)) => Ok(()),
            Err(e) => Err(store_error("destroy", id, e)),
        }
    }
}

fn store_error(operation: &str, subject: &str, err: RetryError<ApiError>) -> Error {
    match err {
        RetryError::Exhausted { attempts, last } => {
            Error::store_unavailable(operation, attempts, last.to_string())
        }
        RetryError::Rejected(ApiError::NotFound) => Error::not_found(SERVER_RESOURCE, subject),
        RetryError::Rejected(ApiError::Status { status, body }) => {
            Error::store_rejected(operation, status, body)
        }
        RetryError::Rejected(ApiError::Decode(message)) => Error::serialization(message),
        RetryError::Rejected(ApiError::Transport(message)) => {
            Error::store_unavailable(operation, 1, message)
        }
    }
}

/// 64 characters from a CSPRNG: a leading letter, then alphanumerics
pub fn generate_password() -> String {
    let rest: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH - 1)
        .map(char::from)
        .collect();
    format!("p{rest}")
}

/// Ownership of an instance whose creation has not finished yet.
///
/// Until [`InstanceGuard::commit`] is called the instance is torn down on
/// every way out: [`InstanceGuard::abort`] destroys it in place, and
/// dropping the guard (a panic or a cancelled future) schedules the destroy
/// on the current runtime.
pub struct InstanceGuard {
    store: InstanceStore,
    instance: BackingInstance,
    root_password: String,
    armed: bool,
}

impl InstanceGuard {
    fn new(store: InstanceStore, instance: BackingInstance, root_password: String) -> Self {
        Self {
            store,
            instance,
            root_password,
            armed: true,
        }
    }

    /// The instance being created
    pub fn instance(&self) -> &BackingInstance {
        &self.instance
    }

    /// One-time root password the instance was created with
    pub fn root_password(&self) -> &str {
        &self.root_password
    }

    /// Keep the instance
    pub fn commit(mut self) -> BackingInstance {
        self.armed = false;
        self.instance.clone()
    }

    /// Destroy the instance now.
    ///
    /// The guard stays armed until destroy returns, so cancelling this
    /// future still leaves the teardown to `Drop`.
    pub async fn abort(mut self) -> Result<()> {
        let result = self.store.destroy(&self.instance.id).await;
        self.armed = false;
        result
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.instance.id.clone();
        warn!(id = %id, hostname = %self.instance.hostname, "Instance guard dropped, scheduling teardown");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    if let Err(e) = store.destroy(&id).await {
                        warn!(id = %id, error = %e, "Scheduled teardown failed");
                    }
                });
            }
            Err(_) => warn!(id = %id, "No runtime available, instance leaked"),
        }
    }
}
