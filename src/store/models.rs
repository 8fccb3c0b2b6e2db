//! Data models for the study core
//!
//! Every mutable entity carries `updated_at` and `is_synced`: local writes
//! set `is_synced = false`, and only a confirmed round-trip through the sync
//! orchestrator flips it back to `true`.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Prefix used for the temporary identifier space in the storage/wire form.
const TEMPORARY_PREFIX: &str = "local:";

/// Identifier of an entity row.
///
/// Locally created records start out with a `Temporary` id; the sync
/// orchestrator's push step swaps it for the `Canonical` id assigned by the
/// remote store. Only one canonical id ever exists per logical entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EntityId {
    Temporary(Uuid),
    Canonical(Uuid),
}

impl EntityId {
    /// Mint a fresh id in the temporary space for an offline-created record.
    pub fn fresh_temporary() -> Self {
        Self::Temporary(Uuid::new_v4())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// The canonical UUID, if this id has one.
    pub fn canonical(&self) -> Option<Uuid> {
        match self {
            Self::Canonical(id) => Some(*id),
            Self::Temporary(_) => None,
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temporary(id) => write!(f, "{}{}", TEMPORARY_PREFIX, id),
            Self::Canonical(id) => write!(f, "{}", id),
        }
    }
}

impl std::str::FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(TEMPORARY_PREFIX) {
            Some(rest) => Ok(Self::Temporary(Uuid::parse_str(rest)?)),
            None => Ok(Self::Canonical(Uuid::parse_str(s)?)),
        }
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for EntityId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Sharing scope; every entity is partitioned by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub Uuid);

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The five synchronized entity collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Cards,
    Subjects,
    Courses,
    Memos,
    ReviewProgress,
}

impl Collection {
    /// All collections, dependencies before dependents (subjects before the
    /// cards that reference them, cards before progress, and so on). The
    /// push phase relies on this order so that reconciled canonical ids are
    /// visible to dependent collections within the same cycle.
    pub fn all() -> [Collection; 5] {
        [
            Collection::Subjects,
            Collection::Cards,
            Collection::Courses,
            Collection::Memos,
            Collection::ReviewProgress,
        ]
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            Collection::Cards => "cards",
            Collection::Subjects => "subjects",
            Collection::Courses => "courses",
            Collection::Memos => "memos",
            Collection::ReviewProgress => "user_card_progress",
        }
    }

    /// Natural key used to match a freshly created local record (temporary
    /// id, id stripped before upload) against the canonical record the
    /// remote store returns. Heuristic: two creates with an identical key
    /// are indistinguishable after upload.
    pub fn natural_key(&self, payload: &serde_json::Value) -> Option<String> {
        match self {
            Collection::Cards => payload.get("question")?.as_str().map(str::to_owned),
            Collection::Subjects => payload
                .get("name")?
                .as_str()
                .map(|n| n.to_lowercase()),
            Collection::Courses => payload.get("title")?.as_str().map(str::to_owned),
            Collection::Memos => payload.get("content")?.as_str().map(str::to_owned),
            Collection::ReviewProgress => {
                let card = payload.get("cardId")?.as_str()?;
                let user = payload.get("userId")?.as_str()?;
                Some(format!("{}/{}", card, user))
            }
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

/// A synchronized entity: the store's generic read/write plumbing and the
/// change tracker speak to every collection through this seam.
pub trait Entity: Serialize + DeserializeOwned + Clone {
    const COLLECTION: Collection;

    fn id(&self) -> &EntityId;
    fn workspace_id(&self) -> WorkspaceId;
    fn updated_at(&self) -> DateTime<Utc>;
    fn is_synced(&self) -> bool;
    fn set_updated_at(&mut self, at: DateTime<Utc>);
    fn set_synced(&mut self, synced: bool);
}

macro_rules! impl_entity {
    ($type:ty, $collection:expr) => {
        impl Entity for $type {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> &EntityId {
                &self.id
            }

            fn workspace_id(&self) -> WorkspaceId {
                self.workspace_id
            }

            fn updated_at(&self) -> DateTime<Utc> {
                self.updated_at
            }

            fn is_synced(&self) -> bool {
                self.is_synced
            }

            fn set_updated_at(&mut self, at: DateTime<Utc>) {
                self.updated_at = at;
            }

            fn set_synced(&mut self, synced: bool) {
                self.is_synced = synced;
            }
        }
    };
}

/// A flashcard with a question (front) and an answer (back).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: EntityId,
    pub workspace_id: WorkspaceId,
    pub subject_id: EntityId,
    pub question: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_synced: bool,
}

impl Card {
    pub fn new(
        workspace_id: WorkspaceId,
        subject_id: EntityId,
        question: String,
        answer: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::fresh_temporary(),
            workspace_id,
            subject_id,
            question,
            answer,
            created_at: now,
            updated_at: now,
            is_synced: false,
        }
    }
}

impl_entity!(Card, Collection::Cards);

/// A subject groups cards; its name is unique per workspace
/// (case-insensitive).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: EntityId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_synced: bool,
}

impl Subject {
    pub fn new(workspace_id: WorkspaceId, name: String) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::fresh_temporary(),
            workspace_id,
            name,
            created_at: now,
            updated_at: now,
            is_synced: false,
        }
    }
}

impl_entity!(Subject, Collection::Subjects);

/// A course: a titled, free-form text document attached to a subject.
/// The content blob is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: EntityId,
    pub workspace_id: WorkspaceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<EntityId>,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_synced: bool,
}

impl Course {
    pub fn new(
        workspace_id: WorkspaceId,
        subject_id: Option<EntityId>,
        title: String,
        content: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::fresh_temporary(),
            workspace_id,
            subject_id,
            title,
            content,
            created_at: now,
            updated_at: now,
            is_synced: false,
        }
    }
}

impl_entity!(Course, Collection::Courses);

/// A free-form note, optionally pinned and optionally attached to a course.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memo {
    pub id: EntityId,
    pub workspace_id: WorkspaceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_id: Option<EntityId>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub is_pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_synced: bool,
}

impl Memo {
    pub fn new(workspace_id: WorkspaceId, course_id: Option<EntityId>, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::fresh_temporary(),
            workspace_id,
            course_id,
            content,
            color: None,
            is_pinned: false,
            created_at: now,
            updated_at: now,
            is_synced: false,
        }
    }
}

impl_entity!(Memo, Collection::Memos);

/// Where a card sits in the spaced repetition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ReviewStatus {
    /// Never reviewed.
    New,
    /// Short-term learning; `step` indexes the fixed delay sequence.
    Learning { step: usize },
    /// Long-term review with day-granularity interval growth.
    Review,
}

impl Default for ReviewStatus {
    fn default() -> Self {
        Self::New
    }
}

/// Spaced-repetition state for one (card, user) pair. Absence of a record
/// means the card is untouched ("new"). `due_date` and `status` are written
/// exclusively by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewProgress {
    pub id: EntityId,
    pub workspace_id: WorkspaceId,
    pub card_id: EntityId,
    pub user_id: UserId,
    /// Current interval in whole days (0 while learning).
    pub interval: i32,
    /// Ease factor, clamped to >= 1.3.
    pub ease_factor: f32,
    #[serde(default)]
    pub status: ReviewStatus,
    pub due_date: DateTime<Utc>,
    #[serde(default)]
    pub review_count: i32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_synced: bool,
}

impl ReviewProgress {
    pub fn new(workspace_id: WorkspaceId, card_id: EntityId, user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::fresh_temporary(),
            workspace_id,
            card_id,
            user_id,
            interval: 0,
            ease_factor: crate::scheduler::DEFAULT_EASE_FACTOR,
            status: ReviewStatus::New,
            due_date: now,
            review_count: 0,
            updated_at: now,
            is_synced: false,
        }
    }

    /// Check if the card is due at the given instant.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date <= now
    }
}

impl_entity!(ReviewProgress, Collection::ReviewProgress);

/// User recall rating for a single review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Rating {
    Again,
    Hard,
    Good,
    Easy,
    VeryEasy,
}

impl Rating {
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Again),
            2 => Some(Self::Hard),
            3 => Some(Self::Good),
            4 => Some(Self::Easy),
            5 => Some(Self::VeryEasy),
            _ => None,
        }
    }

    pub fn value(&self) -> i32 {
        match self {
            Self::Again => 1,
            Self::Hard => 2,
            Self::Good => 3,
            Self::Easy => 4,
            Self::VeryEasy => 5,
        }
    }
}

/// Tombstone for a local deletion, kept until the remote store acknowledges
/// the corresponding delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeletion {
    pub entity_id: Uuid,
    pub collection: Collection,
    pub workspace_id: WorkspaceId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_round_trips_through_string_form() {
        let temp = EntityId::fresh_temporary();
        let parsed: EntityId = temp.to_string().parse().unwrap();
        assert_eq!(temp, parsed);
        assert!(parsed.is_temporary());

        let canonical = EntityId::Canonical(Uuid::new_v4());
        let parsed: EntityId = canonical.to_string().parse().unwrap();
        assert_eq!(canonical, parsed);
        assert!(!parsed.is_temporary());
    }

    #[test]
    fn temporary_ids_are_distinguishable_in_serialized_form() {
        let card = Card::new(
            WorkspaceId(Uuid::new_v4()),
            EntityId::fresh_temporary(),
            "q".into(),
            "a".into(),
        );
        let json = serde_json::to_value(&card).unwrap();
        assert!(json["id"].as_str().unwrap().starts_with("local:"));
    }

    #[test]
    fn natural_keys_cover_every_collection() {
        let payload = serde_json::json!({
            "question": "Q",
            "name": "Biology",
            "title": "T",
            "content": "C",
            "cardId": "abc",
            "userId": "def",
        });
        for collection in Collection::all() {
            assert!(collection.natural_key(&payload).is_some());
        }
        assert_eq!(
            Collection::Subjects.natural_key(&payload).unwrap(),
            "biology"
        );
    }
}
