use std::str::FromStr;
use std::sync::Arc;

use crate::{
    conversation::{ConversationRepository, ConversationService},
    error::{AppError, Result},
    identity::{RoleDirectory, StaticRoleDirectory},
    message::{MessageRepository, MessageService, PageLimits},
    store::MemoryStore,
    websocket::{Dispatcher, RoomRegistry, SessionHub},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: RoomRegistry,
    pub roles: Arc<dyn RoleDirectory>,
    pub conversation_service: ConversationService,
    pub message_service: MessageService,
    pub session_hub: SessionHub,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        roles: Arc<dyn RoleDirectory>,
    ) -> Self {
        let registry = RoomRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());

        let conversation_service =
            ConversationService::new(conversations, roles.clone(), dispatcher.clone());
        let message_service = MessageService::new(
            messages,
            conversation_service.clone(),
            dispatcher.clone(),
            config.page_limits(),
        );
        let session_hub = SessionHub::new(conversation_service.clone(), dispatcher);

        Self {
            config,
            registry,
            roles,
            conversation_service,
            message_service,
            session_hub,
        }
    }

    /// Process-local backend: one `MemoryStore` for both repositories.
    pub fn in_memory(config: Arc<Config>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(
            config,
            store.clone(),
            store,
            Arc::new(StaticRoleDirectory::new()),
        )
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Unset means the in-memory store.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub host: String,
    pub port: u16,
    pub ws_send_buffer: usize,
    pub ws_heartbeat_secs: u64,
    pub page_default_limit: u32,
    pub page_max_limit: u32,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            database_url: None,
            jwt_secret: jwt_secret.into(),
            host: "127.0.0.1".to_string(),
            port: 3000,
            ws_send_buffer: 64,
            ws_heartbeat_secs: 30,
            page_default_limit: 50,
            page_max_limit: 100,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }

    pub fn from_env() -> Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .map_err(|_| AppError::Config("JWT_SECRET must be set".to_string()))?;
        let defaults = Self::new(jwt_secret);

        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            host: std::env::var("HOST").unwrap_or(defaults.host.clone()),
            port: env_or("PORT", defaults.port)?,
            ws_send_buffer: env_or("WS_SEND_BUFFER", defaults.ws_send_buffer)?,
            ws_heartbeat_secs: env_or("WS_HEARTBEAT_SECS", defaults.ws_heartbeat_secs)?,
            page_default_limit: env_or("PAGE_DEFAULT_LIMIT", defaults.page_default_limit)?,
            page_max_limit: env_or("PAGE_MAX_LIMIT", defaults.page_max_limit)?,
            cors_origins: match std::env::var("CORS_ORIGINS") {
                Ok(list) => list
                    .split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect(),
                Err(_) => defaults.cors_origins.clone(),
            },
            ..defaults
        };

        if config.ws_send_buffer == 0 {
            return Err(AppError::Config("WS_SEND_BUFFER must be positive".to_string()));
        }
        if config.page_max_limit == 0 || config.page_default_limit > config.page_max_limit {
            return Err(AppError::Config(
                "PAGE_DEFAULT_LIMIT must not exceed a positive PAGE_MAX_LIMIT".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_limit: self.page_default_limit,
            max_limit: self.page_max_limit,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("{} must be a number", key))),
        Err(_) => Ok(default),
    }
}
