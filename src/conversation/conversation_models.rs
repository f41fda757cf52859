use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    pub is_group: bool,
    /// Set only on direct (two-person, non-group) conversations.
    pub dedup_key: Option<String>,
    pub title: Option<String>,
    pub avatar_url: Option<String>,
    /// Advisory preview pointer; the message log is authoritative.
    pub last_message_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn ensure_participant(&self, user_id: Uuid) -> Result<()> {
        if self.has_participant(user_id) {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "You are not a participant of this conversation".to_string(),
            ))
        }
    }
}

/// Values for a conversation that hasn't been persisted yet.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    pub is_group: bool,
    pub dedup_key: Option<String>,
    pub title: Option<String>,
    pub avatar_url: Option<String>,
}

impl NewConversation {
    pub fn direct(user_a: Uuid, user_b: Uuid) -> Result<Self> {
        if user_a == user_b {
            return Err(AppError::Validation(
                "A direct conversation needs two different users".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            participants: vec![user_a, user_b],
            is_group: false,
            dedup_key: Some(dedup_key(user_a, user_b)),
            title: None,
            avatar_url: None,
        })
    }

    pub fn group(
        participant_ids: impl IntoIterator<Item = Uuid>,
        title: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<Self> {
        let participants = normalize_participants(participant_ids);
        if participants.len() < 2 {
            return Err(AppError::Validation(
                "A group needs at least two distinct participants".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            participants,
            is_group: true,
            dedup_key: None,
            title,
            avatar_url,
        })
    }

    pub fn into_conversation(self, now: DateTime<Utc>) -> Conversation {
        Conversation {
            id: self.id,
            participants: self.participants,
            is_group: self.is_group,
            dedup_key: self.dedup_key,
            title: self.title,
            avatar_url: self.avatar_url,
            last_message_id: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Order-independent key for a pair of users.
pub fn dedup_key(user_a: Uuid, user_b: Uuid) -> String {
    let (low, high) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    format!("{}:{}", low, high)
}

/// Drops repeated ids, keeping first-seen order.
pub fn normalize_participants(ids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
    let mut participants: Vec<Uuid> = Vec::new();
    for id in ids {
        if !participants.contains(&id) {
            participants.push(id);
        }
    }
    participants
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Add(Uuid),
    Remove(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationKind {
    Direct { dedup_key: String },
    Group,
}

/// Group/direct policy applied after every membership change.
///
/// Exactly two participants make a direct conversation keyed by the pair;
/// three or more make a group. Fewer than two is never allowed.
pub fn membership_policy(participants: &[Uuid]) -> Result<ConversationKind> {
    match participants {
        [] | [_] => Err(AppError::Validation(
            "A conversation needs at least two participants".to_string(),
        )),
        [a, b] => Ok(ConversationKind::Direct {
            dedup_key: dedup_key(*a, *b),
        }),
        _ => Ok(ConversationKind::Group),
    }
}

/// The stored shape a conversation takes after a membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipPlan {
    pub participants: Vec<Uuid>,
    pub is_group: bool,
    pub dedup_key: Option<String>,
}

impl MembershipPlan {
    /// Returns `None` when the change is a no-op (adding a current participant).
    pub fn for_change(conversation: &Conversation, change: MembershipChange) -> Result<Option<Self>> {
        let mut participants = conversation.participants.clone();

        match change {
            MembershipChange::Add(user_id) => {
                if participants.contains(&user_id) {
                    return Ok(None);
                }
                participants.push(user_id);
            }
            MembershipChange::Remove(user_id) => {
                if !participants.contains(&user_id) {
                    return Err(AppError::NotFound(
                        "User is not a participant of this conversation".to_string(),
                    ));
                }
                participants.retain(|id| *id != user_id);
            }
        }

        let plan = match membership_policy(&participants)? {
            ConversationKind::Direct { dedup_key } => Self {
                participants,
                is_group: false,
                dedup_key: Some(dedup_key),
            },
            ConversationKind::Group => Self {
                participants,
                is_group: true,
                dedup_key: None,
            },
        };

        Ok(Some(plan))
    }

    /// Keeps a two-person conversation as a group because another direct
    /// conversation already owns the pair's key.
    pub fn keep_group(self) -> Self {
        Self {
            is_group: true,
            dedup_key: None,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(participants: Vec<Uuid>, is_group: bool) -> Conversation {
        let dedup = if is_group {
            None
        } else {
            Some(dedup_key(participants[0], participants[1]))
        };
        NewConversation {
            id: Uuid::new_v4(),
            participants,
            is_group,
            dedup_key: dedup,
            title: None,
            avatar_url: None,
        }
        .into_conversation(Utc::now())
    }

    #[test]
    fn test_dedup_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(dedup_key(a, b), dedup_key(b, a));
        assert_ne!(dedup_key(a, b), dedup_key(a, Uuid::new_v4()));
    }

    #[test]
    fn test_direct_rejects_same_user() {
        let a = Uuid::new_v4();
        assert!(matches!(
            NewConversation::direct(a, a),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_group_dedups_participants() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let group = NewConversation::group(vec![a, b, a, b], Some("Team".into()), None).unwrap();
        assert_eq!(group.participants, vec![a, b]);
        assert!(group.is_group);
        assert!(group.dedup_key.is_none());

        assert!(matches!(
            NewConversation::group(vec![a, a], None, None),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_membership_policy() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        assert!(membership_policy(&[a]).is_err());
        assert_eq!(
            membership_policy(&[a, b]).unwrap(),
            ConversationKind::Direct {
                dedup_key: dedup_key(a, b)
            }
        );
        assert_eq!(membership_policy(&[a, b, c]).unwrap(), ConversationKind::Group);
    }

    #[test]
    fn test_adding_third_participant_promotes_to_group() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let direct = conversation(vec![a, b], false);

        let plan = MembershipPlan::for_change(&direct, MembershipChange::Add(c))
            .unwrap()
            .unwrap();
        assert_eq!(plan.participants, vec![a, b, c]);
        assert!(plan.is_group);
        assert!(plan.dedup_key.is_none());

        assert!(MembershipPlan::for_change(&direct, MembershipChange::Add(a))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_shrinking_to_two_demotes_to_direct() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let group = conversation(vec![a, b, c], true);

        let plan = MembershipPlan::for_change(&group, MembershipChange::Remove(c))
            .unwrap()
            .unwrap();
        assert!(!plan.is_group);
        assert_eq!(plan.dedup_key, Some(dedup_key(a, b)));

        let kept = plan.keep_group();
        assert!(kept.is_group);
        assert!(kept.dedup_key.is_none());
    }

    #[test]
    fn test_cannot_shrink_below_two() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let direct = conversation(vec![a, b], false);

        assert!(matches!(
            MembershipPlan::for_change(&direct, MembershipChange::Remove(a)),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            MembershipPlan::for_change(&direct, MembershipChange::Remove(Uuid::new_v4())),
            Err(AppError::NotFound(_))
        ));
    }
}
