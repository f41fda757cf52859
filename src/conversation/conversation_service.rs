use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::identity::RoleDirectory;
use crate::websocket::Dispatcher;
use super::conversation_models::{dedup_key, Conversation, MembershipChange, NewConversation};
use super::conversation_repository::ConversationRepository;

#[derive(Clone)]
pub struct ConversationService {
    repo: Arc<dyn ConversationRepository>,
    roles: Arc<dyn RoleDirectory>,
    dispatcher: Dispatcher,
}

impl ConversationService {
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        roles: Arc<dyn RoleDirectory>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            repo,
            roles,
            dispatcher,
        }
    }

    /// Returns the direct conversation between two users, creating it if needed.
    /// Concurrent callers for the same pair all get the same conversation.
    pub async fn get_or_create_direct(&self, user_a: Uuid, user_b: Uuid) -> Result<Conversation> {
        let new = NewConversation::direct(user_a, user_b)?;
        let key = dedup_key(user_a, user_b);

        if let Some(existing) = self.repo.find_by_dedup_key(&key).await? {
            return Ok(existing);
        }

        match self.repo.create(new).await {
            Ok(conversation) => {
                tracing::info!(
                    "Created direct conversation {} for {} and {}",
                    conversation.id,
                    user_a,
                    user_b
                );
                Ok(conversation)
            }
            // Another caller won the insert; theirs is the conversation
            Err(AppError::Conflict(_)) => self
                .repo
                .find_by_dedup_key(&key)
                .await?
                .ok_or(AppError::InternalError),
            Err(e) => Err(e),
        }
    }

    pub async fn create_group(
        &self,
        participant_ids: Vec<Uuid>,
        title: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<Conversation> {
        let new = NewConversation::group(participant_ids, title, avatar_url)?;
        let conversation = self.repo.create(new).await?;

        tracing::info!(
            "Created group conversation {} with {} participants",
            conversation.id,
            conversation.participants.len()
        );
        Ok(conversation)
    }

    pub async fn find(&self, conversation_id: Uuid) -> Result<Conversation> {
        self.repo
            .find_by_id(conversation_id)
            .await?
            .ok_or(AppError::NotFound("Conversation not found".to_string()))
    }

    /// Loads the conversation and checks `user_id` takes part in it.
    pub async fn require_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Conversation> {
        let conversation = self.find(conversation_id).await?;
        conversation.ensure_participant(user_id)?;
        Ok(conversation)
    }

    pub async fn add_participant(
        &self,
        actor_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation> {
        self.require_participant(conversation_id, actor_id).await?;

        let conversation = self
            .apply_membership(conversation_id, MembershipChange::Add(user_id))
            .await?;

        self.dispatcher.conversation_updated(&conversation);
        Ok(conversation)
    }

    pub async fn remove_participant(
        &self,
        actor_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Conversation> {
        self.require_participant(conversation_id, actor_id).await?;

        let conversation = self
            .apply_membership(conversation_id, MembershipChange::Remove(user_id))
            .await?;

        self.dispatcher.conversation_updated(&conversation);
        self.dispatcher.evict(conversation_id, user_id);
        Ok(conversation)
    }

    async fn apply_membership(&self, conversation_id: Uuid, change: MembershipChange) -> Result<Conversation> {
        match self.repo.apply_membership(conversation_id, change).await {
            // The pair's key was claimed between the availability check and the
            // write; a second pass sees it taken and keeps the group shape.
            Err(AppError::Conflict(_)) => self.repo.apply_membership(conversation_id, change).await,
            other => other,
        }
    }

    pub async fn update_group(
        &self,
        actor_id: Uuid,
        conversation_id: Uuid,
        title: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<Conversation> {
        let conversation = self.require_participant(conversation_id, actor_id).await?;
        if !conversation.is_group {
            return Err(AppError::Validation(
                "Only group conversations have a title or avatar".to_string(),
            ));
        }

        let conversation = self
            .repo
            .update_details(conversation_id, title.as_deref(), avatar_url.as_deref())
            .await?;

        self.dispatcher.conversation_updated(&conversation);
        Ok(conversation)
    }

    /// Conversations containing `user_id`: those with a privileged participant
    /// first, then most recent message first. Conversations without messages
    /// come last, newest update first.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let conversations = self.repo.find_for_user(user_id).await?;

        let everyone: Vec<Uuid> = conversations
            .iter()
            .flat_map(|c| c.participants.iter().copied())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let roles = self.roles.roles_of(&everyone).await?;

        let mut ranked: Vec<(bool, Option<DateTime<Utc>>, DateTime<Utc>, Conversation)> = conversations
            .into_iter()
            .map(|c| {
                let privileged = c
                    .participants
                    .iter()
                    .any(|id| roles.get(id).is_some_and(|role| role.is_privileged()));
                (privileged, c.last_message_at, c.updated_at, c)
            })
            .collect();

        ranked.sort_by_key(|(privileged, last_message_at, updated_at, _)| {
            (!*privileged, Reverse(*last_message_at), Reverse(*updated_at))
        });

        Ok(ranked.into_iter().map(|(_, _, _, c)| c).collect())
    }

    /// Advisory preview pointer; failures are logged by the caller, not surfaced.
    pub async fn record_last_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.repo.set_last_message(conversation_id, message_id, at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Role, StaticRoleDirectory};
    use crate::store::MemoryStore;
    use crate::websocket::RoomRegistry;
    use tokio::sync::mpsc;

    fn service_with(roles: Arc<StaticRoleDirectory>) -> (ConversationService, RoomRegistry) {
        let registry = RoomRegistry::new();
        let service = ConversationService::new(
            Arc::new(MemoryStore::new()),
            roles,
            Dispatcher::new(registry.clone()),
        );
        (service, registry)
    }

    fn service() -> ConversationService {
        service_with(Arc::new(StaticRoleDirectory::new())).0
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_direct_is_idempotent() {
        let service = service();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        service.get_or_create_direct(a, b).await
                    } else {
                        service.get_or_create_direct(b, a).await
                    }
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            let conversation = handle.await.unwrap().unwrap();
            assert!(!conversation.is_group);
            assert_eq!(conversation.participants.len(), 2);
            ids.insert(conversation.id);
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(service.list_for_user(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_with_self_is_rejected() {
        let a = Uuid::new_v4();
        assert!(matches!(
            service().get_or_create_direct(a, a).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_group_grow_and_shrink() {
        let service = service();
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let group = service
            .create_group(vec![a, b, c], Some("Suppliers".into()), None)
            .await
            .unwrap();
        assert!(group.is_group);
        assert!(group.dedup_key.is_none());

        let grown = service.add_participant(a, group.id, d).await.unwrap();
        assert_eq!(grown.participants.len(), 4);
        assert!(grown.is_group);

        service.remove_participant(a, group.id, d).await.unwrap();
        let shrunk = service.remove_participant(a, group.id, c).await.unwrap();
        assert_eq!(shrunk.participants, vec![a, b]);
        assert!(!shrunk.is_group);
        assert_eq!(shrunk.dedup_key, Some(dedup_key(a, b)));
        // title survives demotion
        assert_eq!(shrunk.title.as_deref(), Some("Suppliers"));

        // the demoted conversation now answers direct lookups for the pair
        let direct = service.get_or_create_direct(b, a).await.unwrap();
        assert_eq!(direct.id, group.id);

        assert!(matches!(
            service.remove_participant(a, group.id, b).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_group_needs_two_distinct_participants() {
        let a = Uuid::new_v4();
        assert!(matches!(
            service().create_group(vec![a, a], None, None).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_non_participant_cannot_change_membership() {
        let service = service();
        let (a, b, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conversation = service.get_or_create_direct(a, b).await.unwrap();

        assert!(matches!(
            service.add_participant(outsider, conversation.id, outsider).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            service.add_participant(a, Uuid::new_v4(), outsider).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_group_rejects_direct() {
        let service = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let direct = service.get_or_create_direct(a, b).await.unwrap();

        assert!(matches!(
            service.update_group(a, direct.id, Some("x".into()), None).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_list_puts_privileged_conversations_first() {
        let roles = Arc::new(StaticRoleDirectory::new());
        let (service, _) = service_with(roles.clone());
        let me = Uuid::new_v4();
        let admin = Uuid::new_v4();
        roles.grant(admin, Role::Admin);

        let with_admin = service.get_or_create_direct(me, admin).await.unwrap();
        let older = service.get_or_create_direct(me, Uuid::new_v4()).await.unwrap();
        let newer = service.get_or_create_direct(me, Uuid::new_v4()).await.unwrap();
        let quiet = service.get_or_create_direct(me, Uuid::new_v4()).await.unwrap();

        let now = Utc::now();
        service
            .record_last_message(older.id, Uuid::new_v4(), now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        service
            .record_last_message(newer.id, Uuid::new_v4(), now)
            .await
            .unwrap();

        let order: Vec<Uuid> = service
            .list_for_user(me)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(order, vec![with_admin.id, newer.id, older.id, quiet.id]);
    }

    #[tokio::test]
    async fn test_removed_participant_is_evicted_from_room() {
        let (service, registry) = service_with(Arc::new(StaticRoleDirectory::new()));
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let group = service.create_group(vec![a, b, c], None, None).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let session = registry.connect(c, tx);
        registry.join(session, group.id).unwrap();

        service.remove_participant(a, group.id, c).await.unwrap();

        assert!(matches!(
            rx.try_recv(),
            Ok(crate::websocket::ServerEvent::ConversationUpdated(_))
        ));
        assert!(registry.joined_rooms(session).is_empty());
    }
}
