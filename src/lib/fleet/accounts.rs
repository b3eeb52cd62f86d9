use dashmap::DashMap;

use super::types::User;

pub trait AccountStore: Send + Sync {
    /// Tokens are matched case-insensitively; keys are stored upper-cased.
    fn find_user_by_token(&self, token: &str) -> Option<User>;
}

#[derive(Debug, Default)]
pub struct InMemoryAccounts {
    by_key: DashMap<String, User>,
}

impl InMemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `email` and returns its access key. A `None` key gets a
    /// freshly generated one.
    pub fn add_user(&self, email: &str, access_key: Option<&str>) -> String {
        let key = access_key
            .map(str::to_uppercase)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string().to_uppercase());

        self.by_key.insert(
            key.clone(),
            User {
                email: email.to_string(),
                access_key: key.clone(),
            },
        );
        key
    }
}

impl AccountStore for InMemoryAccounts {
    fn find_user_by_token(&self, token: &str) -> Option<User> {
        self.by_key
            .get(&token.to_uppercase())
            .map(|user| user.value().clone())
    }
}
