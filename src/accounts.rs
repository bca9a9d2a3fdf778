//! Account lookup used by the login, registration, admin and billing
//! endpoints. The dispatch pipeline never touches it.

use std::collections::BTreeMap;

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{GatewayError, GatewayResult},
    identity::{ADMIN_ROLE, Plan},
};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub plan: Plan,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Fails with `InvalidCredential` on unknown email or wrong password.
    async fn authenticate(&self, email: &str, password: &str) -> GatewayResult<Account>;

    async fn register(&self, email: &str, password: &str, plan: Plan) -> GatewayResult<Account>;

    /// Newest first.
    async fn list(&self, limit: usize) -> GatewayResult<Vec<Account>>;

    async fn plan_counts(&self) -> GatewayResult<BTreeMap<Plan, u64>>;

    /// Returns `None` when no account matches `email`.
    async fn set_plan(&self, email: &str, plan: Plan) -> GatewayResult<Option<Account>>;
}

struct StoredAccount {
    account: Account,
    password_hash: String,
}

pub struct InMemoryAccountDirectory {
    accounts: DashMap<String, StoredAccount>,
    params: Params,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::with_params(Params::default())
    }

    pub fn with_params(params: Params) -> Self {
        Self {
            accounts: DashMap::new(),
            params,
        }
    }

    pub async fn bootstrap_admin(&self, email: &str, password: &str) -> GatewayResult<Account> {
        let account = self.register(email, password, Plan::Enterprise).await?;
        let mut stored = self
            .accounts
            .get_mut(&normalize_email(email))
            .ok_or_else(|| GatewayError::Internal("bootstrap account vanished".to_string()))?;
        stored.account.roles.push(ADMIN_ROLE.to_string());
        tracing::info!(account_id = %account.id, "bootstrap admin account created");
        Ok(stored.account.clone())
    }

    async fn hash(&self, password: &str) -> GatewayResult<String> {
        let params = self.params.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password(password.as_bytes(), &salt)
                .map(|h| h.to_string())
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("password hash task failed: {e}")))?
        .map_err(|e| GatewayError::Internal(format!("password hashing failed: {e}")))
    }

    async fn verify(&self, password: &str, hash: String) -> GatewayResult<bool> {
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&hash).map_err(|e| e.to_string())?;
            Ok::<_, String>(
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok(),
            )
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("password verify task failed: {e}")))?
        .map_err(GatewayError::Internal)
    }
}

impl Default for InMemoryAccountDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn authenticate(&self, email: &str, password: &str) -> GatewayResult<Account> {
        let (account, hash) = self
            .accounts
            .get(&normalize_email(email))
            .map(|stored| (stored.account.clone(), stored.password_hash.clone()))
            .ok_or(GatewayError::InvalidCredential)?;

        if self.verify(password, hash).await? {
            Ok(account)
        } else {
            Err(GatewayError::InvalidCredential)
        }
    }

    async fn register(&self, email: &str, password: &str, plan: Plan) -> GatewayResult<Account> {
        let email = normalize_email(email);
        validate_email(&email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(GatewayError::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        if plan == Plan::Unknown {
            return Err(GatewayError::Validation("unknown plan".to_string()));
        }
        if self.accounts.contains_key(&email) {
            return Err(GatewayError::Conflict("account already exists".to_string()));
        }

        let password_hash = self.hash(password).await?;
        let account = Account {
            id: Uuid::new_v4().to_string(),
            email: email.clone(),
            plan,
            roles: Vec::new(),
            created_at: Utc::now(),
        };

        // Re-checked under the shard lock; two concurrent registrations of
        // the same email must not both succeed.
        match self.accounts.entry(email) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(GatewayError::Conflict("account already exists".to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(StoredAccount {
                    account: account.clone(),
                    password_hash,
                });
                Ok(account)
            }
        }
    }

    async fn list(&self, limit: usize) -> GatewayResult<Vec<Account>> {
        let mut accounts = self
            .accounts
            .iter()
            .map(|stored| stored.account.clone())
            .collect::<Vec<_>>();
        accounts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        accounts.truncate(limit);
        Ok(accounts)
    }

    async fn plan_counts(&self) -> GatewayResult<BTreeMap<Plan, u64>> {
        let mut counts = BTreeMap::new();
        for stored in self.accounts.iter() {
            *counts.entry(stored.account.plan).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn set_plan(&self, email: &str, plan: Plan) -> GatewayResult<Option<Account>> {
        Ok(self
            .accounts
            .get_mut(&normalize_email(email))
            .map(|mut stored| {
                stored.account.plan = plan;
                stored.account.clone()
            }))
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn validate_email(email: &str) -> GatewayResult<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(GatewayError::Validation("invalid email address".to_string())),
    }
}
