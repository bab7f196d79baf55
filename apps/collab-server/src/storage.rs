//! JSON-file-backed store. Collections live in memory behind RwLocks
//! and are rewritten to disk on mutation; a production deployment would
//! put a database behind the same trait.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use collab::store::{hash_password, AuthToken, Document, Store, StoreError, User};
use parking_lot::RwLock;
use uuid::Uuid;

pub struct JsonStore {
    data_dir: PathBuf,
    users: RwLock<HashMap<String, User>>,
    documents: RwLock<HashMap<String, Document>>,
    permissions: RwLock<HashMap<String, HashMap<String, String>>>,
    tokens: RwLock<HashMap<String, AuthToken>>,
}

impl JsonStore {
    pub fn new(data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let users = load_collection(&data_dir.join("users.json"))?;
        let documents = load_collection(&data_dir.join("documents.json"))?;
        let permissions = load_collection(&data_dir.join("permissions.json"))?;
        let tokens = load_collection(&data_dir.join("tokens.json"))?;

        Ok(Self {
            data_dir,
            users: RwLock::new(users),
            documents: RwLock::new(documents),
            permissions: RwLock::new(permissions),
            tokens: RwLock::new(tokens),
        })
    }

    fn save_users(&self) -> Result<(), StoreError> {
        save_collection(&self.data_dir.join("users.json"), &*self.users.read())
    }

    fn save_documents(&self) -> Result<(), StoreError> {
        save_collection(&self.data_dir.join("documents.json"), &*self.documents.read())
    }

    fn save_permissions(&self) -> Result<(), StoreError> {
        save_collection(
            &self.data_dir.join("permissions.json"),
            &*self.permissions.read(),
        )
    }

    fn save_tokens(&self) -> Result<(), StoreError> {
        save_collection(&self.data_dir.join("tokens.json"), &*self.tokens.read())
    }
}

fn load_collection<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> anyhow::Result<T> {
    if path.exists() {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data).unwrap_or_default())
    } else {
        Ok(T::default())
    }
}

fn save_collection<T: serde::Serialize>(path: &Path, collection: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(collection)
        .map_err(|err| StoreError::Internal(err.to_string()))?;
    fs::write(path, json).map_err(|err| StoreError::Internal(err.to_string()))
}

#[async_trait]
impl Store for JsonStore {
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
        {
            let mut documents = self.documents.write();
            let doc = documents.get_mut(id).ok_or(StoreError::NotFound)?;
            doc.content = content.to_string();
            doc.version = version;
        }
        self.save_documents()
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
        self.save_documents()?;
        Ok(doc)
    }

    async fn share_document(
        &self,
        document_id: &str,
        owner_id: &str,
        target_user_id: &str,
        role: &str,
    ) -> Result<(), StoreError> {
        {
            let documents = self.documents.read();
            let doc = documents.get(document_id).ok_or(StoreError::NotFound)?;
            if doc.owner_id != owner_id {
                return Err(StoreError::NotOwner);
            }
        }
        self.permissions
            .write()
            .entry(document_id.to_string())
            .or_default()
            .entry(target_user_id.to_string())
            .or_insert_with(|| role.to_string());
        self.save_permissions()
    }

    async fn create_user(&self, email: &str, password: &str) -> Result<User, StoreError> {
        let user = {
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
            user
        };
        self.save_users()?;
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
        self.save_tokens()?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collections_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();

        let (doc_id, owner_id, guest_id) = {
            let store = JsonStore::new(dir.path()).unwrap();
            let owner = store.create_user("a@example.com", "pw").await.unwrap();
            let guest = store.create_user("b@example.com", "pw").await.unwrap();
            let doc = store.create_document("Notes", &owner.id).await.unwrap();
            store.save_document(&doc.id, "Hello", 5).await.unwrap();
            store
                .share_document(&doc.id, &owner.id, &guest.id, "editor")
                .await
                .unwrap();
            (doc.id, owner.id, guest.id)
        };

        let reloaded = JsonStore::new(dir.path()).unwrap();
        let doc = reloaded.get_document(&doc_id).await.unwrap();
        assert_eq!((doc.content.as_str(), doc.version), ("Hello", 5));
        assert_eq!(doc.owner_id, owner_id);
        assert!(reloaded.check_permission(&doc_id, &guest_id).await.unwrap());
        assert!(reloaded.get_user_by_email("a@example.com").await.is_ok());
    }

    #[tokio::test]
    async fn tokens_survive_a_reload_until_expiry() {
        let dir = tempfile::tempdir().unwrap();

        let token = {
            let store = JsonStore::new(dir.path()).unwrap();
            let user = store.create_user("a@example.com", "pw").await.unwrap();
            store
                .create_token(&user.id, Duration::hours(1))
                .await
                .unwrap()
        };

        let reloaded = JsonStore::new(dir.path()).unwrap();
        let user = reloaded.lookup_token(&token.token).await.unwrap();
        assert_eq!(user.email, "a@example.com");
    }
}
