use crate::api::{HttpSocialApi, SocialApi};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use std::sync::Arc;

/// Everything an authenticated session needs to talk to the backend.
#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<Config>,
    pub api: Arc<dyn SocialApi>,
    pub user_id: String,
    pub token: String,
}

impl SyncContext {
    pub fn new(config: Config) -> SyncResult<Self> {
        let user_id = config
            .session
            .user_id
            .clone()
            .ok_or_else(|| SyncError::Config("SYNC_USER_ID is not set".to_string()))?;
        let token = config
            .session
            .auth_token
            .clone()
            .ok_or_else(|| SyncError::Config("SYNC_AUTH_TOKEN is not set".to_string()))?;
        let api = HttpSocialApi::new(&config.api, &token)?;

        Ok(SyncContext {
            config: Arc::new(config),
            api: Arc::new(api),
            user_id,
            token,
        })
    }

    pub fn with_api(config: Config, user_id: &str, token: &str, api: Arc<dyn SocialApi>) -> Self {
        SyncContext {
            config: Arc::new(config),
            api,
            user_id: user_id.to_string(),
            token: token.to_string(),
        }
    }

    pub fn chat_url(&self) -> String {
        self.config.chat_url(&self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_session_is_a_config_error() {
        let result = SyncContext::new(Config::default());
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_new_with_session() {
        let config = Config::from_lookup(|key| match key {
            "SYNC_USER_ID" => Some("me".to_string()),
            "SYNC_AUTH_TOKEN" => Some("tok".to_string()),
            _ => None,
        });
        let ctx = SyncContext::new(config).unwrap();
        assert_eq!(ctx.user_id, "me");
        assert_eq!(ctx.chat_url(), "ws://localhost:8080/chat?token=tok");
    }
}
