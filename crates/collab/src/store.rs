//! Durable document, user, and permission storage.
//!
//! The core consumes this as an interface; the server binary supplies a
//! file-backed implementation and tests use [`MemoryStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub owner_id: String,
    pub content: String,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
}

/// Opaque bearer token handed out at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("user with email {0} already exists")]
    EmailTaken(String),

    #[error("permission denied: only the owner can share this document")]
    NotOwner,

    #[error("storage failure: {0}")]
    Internal(String),
}

/// Durable store the session core and the HTTP surface run against.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_document(&self, id: &str) -> Result<Document, StoreError>;

    /// Unconditional overwrite of content and version.
    async fn save_document(&self, id: &str, content: &str, version: u64)
        -> Result<(), StoreError>;

    /// Owner has implicit access; anyone else needs a permission grant.
    async fn check_permission(&self, document_id: &str, user_id: &str)
        -> Result<bool, StoreError>;

    async fn create_document(&self, title: &str, owner_id: &str) -> Result<Document, StoreError>;

    /// Grants `target_user_id` access. Only the owner may share;
    /// repeating an existing grant is not an error.
    async fn share_document(
        &self,
        document_id: &str,
        owner_id: &str,
        target_user_id: &str,
        role: &str,
    ) -> Result<(), StoreError>;

    async fn create_user(&self, email: &str, password: &str) -> Result<User, StoreError>;

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError>;

    async fn get_user_by_id(&self, id: &str) -> Result<User, StoreError>;

    async fn create_token(&self, user_id: &str, ttl: Duration) -> Result<AuthToken, StoreError>;

    /// Resolves a bearer token to its user. Expired and unknown tokens
    /// both come back as [`StoreError::NotFound`].
    async fn lookup_token(&self, token: &str) -> Result<User, StoreError>;
}

/// Salted digest stored as `salt$hex`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = Sha256::digest(format!("{salt}:{password}").as_bytes());
    format!("{salt}${digest:x}")
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, expected)) = stored.split_once('$') else {
        return false;
    };
    let digest = Sha256::digest(format!("{salt}:{password}").as_bytes());
    format!("{digest:x}") == expected
}

/// In-memory store for tests and single-process development.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, User>>,
    documents: RwLock<HashMap<String, Document>>,
    permissions: RwLock<HashMap<String, HashMap<String, String>>>,
    tokens: RwLock<HashMap<String, AuthToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_document(&self, id: &str) -> Result<Document, StoreError> {
        self.documents
            .read()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn save_document(
        &self,
        id: &str,
        content: &str,
        version: u64,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write();
        let doc = documents.get_mut(id).ok_or(StoreError::NotFound)?;
        doc.content = content.to_string();
        doc.version = version;
        Ok(())
    }

    async fn check_permission(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        if let Some(doc) = self.documents.read().get(document_id) {
            if doc.owner_id == user_id {
                return Ok(true);
            }
        }
        Ok(self
            .permissions
            .read()
            .get(document_id)
            .is_some_and(|grants| grants.contains_key(user_id)))
    }

    async fn create_document(&self, title: &str, owner_id: &str) -> Result<Document, StoreError> {
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            owner_id: owner_id.to_string(),
            content: String::new(),
            version: 0,
        };
        self.documents.write().insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn share_document(
        &self,
        document_id: &str,
        owner_id: &str,
        target_user_id: &str,
        role: &str,
    ) -> Result<(), StoreError> {
        let documents = self.documents.read();
        let doc = documents.get(document_id).ok_or(StoreError::NotFound)?;
        if doc.owner_id != owner_id {
            return Err(StoreError::NotOwner);
        }
        drop(documents);

        self.permissions
            .write()
            .entry(document_id.to_string())
            .or_default()
            .entry(target_user_id.to_string())
            .or_insert_with(|| role.to_string());
        Ok(())
    }

    async fn create_user(&self, email: &str, password: &str) -> Result<User, StoreError> {
        let mut users = self.users.write();
        if users.values().any(|u| u.email == email) {
            return Err(StoreError::EmailTaken(email.to_string()));
        }
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password_hash: hash_password(password),
        };
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
        self.users
            .read()
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_user_by_id(&self, id: &str) -> Result<User, StoreError> {
        self.users
            .read()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_token(&self, user_id: &str, ttl: Duration) -> Result<AuthToken, StoreError> {
        let token = AuthToken {
            token: Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            expires_at: Utc::now() + ttl,
        };
        self.tokens.write().insert(token.token.clone(), token.clone());
        Ok(token)
    }

    async fn lookup_token(&self, token: &str) -> Result<User, StoreError> {
        let user_id = {
            let mut tokens = self.tokens.write();
            let Some(entry) = tokens.get(token) else {
                return Err(StoreError::NotFound);
            };
            if entry.expires_at <= Utc::now() {
                tokens.remove(token);
                return Err(StoreError::NotFound);
            }
            entry.user_id.clone()
        };
        self.get_user_by_id(&user_id).await
    }
}
