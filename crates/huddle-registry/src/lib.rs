use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use huddle_db::Database;
use huddle_types::api::ChannelOverview;
use huddle_types::error::ChatError;
use huddle_types::models::{Channel, ChannelKind, Membership};

/// Decides which channel kinds a user may enter without an explicit invite,
/// and who may create restricted kinds. The server-side policy for
/// invite-only kinds is deliberately pluggable.
pub trait JoinPolicy: Send + Sync {
    fn allows_open_join(&self, kind: ChannelKind) -> bool;

    /// Creation permission hook. Default: any authenticated user may create
    /// any kind of channel.
    fn allows_create(&self, _kind: ChannelKind, _creator_id: Uuid) -> bool {
        true
    }
}

/// Default policy: general channels are open-join; department and project
/// channels require an explicit invite.
pub struct OpenGeneral;

impl JoinPolicy for OpenGeneral {
    fn allows_open_join(&self, kind: ChannelKind) -> bool {
        matches!(kind, ChannelKind::General)
    }
}

/// Owns channel metadata and membership resolution. All durable state lives
/// in the database; the registry adds validation and the join policy.
///
/// `is_member` is consulted on every subscribe and every send — membership
/// can change between operations, so callers must not cache the answer.
#[derive(Clone)]
pub struct ChannelRegistry {
    db: Arc<Database>,
    policy: Arc<dyn JoinPolicy>,
}

impl ChannelRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_policy(db, Arc::new(OpenGeneral))
    }

    pub fn with_policy(db: Arc<Database>, policy: Arc<dyn JoinPolicy>) -> Self {
        Self { db, policy }
    }

    /// Every channel, annotated with membership and member count, so a user
    /// can discover channels they have not joined yet.
    pub fn list_for(&self, user_id: Uuid) -> Result<Vec<ChannelOverview>, ChatError> {
        let rows = self.db.list_channels_for(&user_id.to_string())?;

        let mut overviews = Vec::with_capacity(rows.len());
        for (row, is_member, member_count) in rows {
            overviews.push(ChannelOverview {
                channel: Channel::try_from(row)?,
                is_member,
                member_count,
            });
        }
        Ok(overviews)
    }

    /// Create a channel and auto-join the creator as its first member.
    pub fn create(
        &self,
        name: &str,
        kind: ChannelKind,
        description: &str,
        creator_id: Uuid,
    ) -> Result<Channel, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::invalid("channel name must not be empty"));
        }
        if !self.policy.allows_create(kind, creator_id) {
            return Err(ChatError::forbidden(format!(
                "not allowed to create {} channels",
                kind.as_str()
            )));
        }

        // The insert itself detects name collisions (case-insensitive), so
        // two concurrent creates with the same name cannot both win.
        let id = Uuid::new_v4();
        let row = self
            .db
            .insert_channel(
                &id.to_string(),
                name,
                kind.as_str(),
                description,
                &creator_id.to_string(),
            )?
            .ok_or_else(|| {
                ChatError::invalid(format!("channel name '{}' is already taken", name))
            })?;

        self.db
            .upsert_membership(&id.to_string(), &creator_id.to_string())?;

        info!("channel '{}' ({}) created by {}", name, id, creator_id);
        Ok(Channel::try_from(row)?)
    }

    /// Idempotent join: an already-joined user gets their existing
    /// membership back and no duplicate row is created.
    pub fn join(&self, channel_id: Uuid, user_id: Uuid) -> Result<Membership, ChatError> {
        if self.db.get_channel(&channel_id.to_string())?.is_none() {
            return Err(ChatError::not_found(format!("channel {}", channel_id)));
        }

        let row = self
            .db
            .upsert_membership(&channel_id.to_string(), &user_id.to_string())?;
        Ok(Membership::try_from(row)?)
    }

    /// Join via the gateway's implicit-join path: only allowed for kinds the
    /// policy marks open; invite-only kinds are refused.
    pub fn join_open(&self, channel_id: Uuid, user_id: Uuid) -> Result<Membership, ChatError> {
        let row = self
            .db
            .get_channel(&channel_id.to_string())?
            .ok_or_else(|| ChatError::not_found(format!("channel {}", channel_id)))?;
        let channel = Channel::try_from(row)?;

        if !self.policy.allows_open_join(channel.kind) {
            return Err(ChatError::forbidden(format!(
                "channel '{}' is invite-only",
                channel.name
            )));
        }

        self.join(channel_id, user_id)
    }

    pub fn is_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool, ChatError> {
        Ok(self
            .db
            .is_member(&channel_id.to_string(), &user_id.to_string())?)
    }

    pub fn get(&self, channel_id: Uuid) -> Result<Option<Channel>, ChatError> {
        match self.db.get_channel(&channel_id.to_string())? {
            Some(row) => Ok(Some(Channel::try_from(row)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERAL: &str = "00000000-0000-0000-0000-000000000001";

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn create_rejects_empty_and_duplicate_names() {
        let registry = registry();
        let creator = Uuid::new_v4();

        let err = registry
            .create("   ", ChannelKind::Project, "", creator)
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidInput(_)));

        // Seeded channel is named "general"; duplicates are case-insensitive
        let err = registry
            .create("General", ChannelKind::General, "", creator)
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidInput(_)));
    }

    #[test]
    fn creator_is_auto_joined_as_first_member() {
        let registry = registry();
        let creator = Uuid::new_v4();

        let channel = registry
            .create("engineering", ChannelKind::Department, "eng team", creator)
            .unwrap();

        assert!(registry.is_member(channel.id, creator).unwrap());
        let listing = registry.list_for(creator).unwrap();
        let eng = listing
            .iter()
            .find(|o| o.channel.id == channel.id)
            .unwrap();
        assert_eq!(eng.member_count, 1);
        assert!(eng.is_member);
    }

    #[test]
    fn join_is_idempotent_and_unknown_channel_is_not_found() {
        let registry = registry();
        let user = Uuid::new_v4();
        let general: Uuid = GENERAL.parse().unwrap();

        let first = registry.join(general, user).unwrap();
        let second = registry.join(general, user).unwrap();
        assert_eq!(first.joined_at, second.joined_at);

        let err = registry.join(Uuid::new_v4(), user).unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn open_join_is_limited_to_general_channels() {
        let registry = registry();
        let creator = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let general: Uuid = GENERAL.parse().unwrap();

        assert!(registry.join_open(general, stranger).is_ok());

        let project = registry
            .create("apollo", ChannelKind::Project, "", creator)
            .unwrap();
        let err = registry.join_open(project.id, stranger).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        assert!(!registry.is_member(project.id, stranger).unwrap());
    }
}
