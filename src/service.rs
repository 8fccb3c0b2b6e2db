//! Application service: the single entry point callers use.
//!
//! Every mutation is local-first: it commits to the embedded store and
//! returns immediately, then requests a background sync cycle if the
//! device is online. Reads never touch the network.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::scheduler;
use crate::store::{
    Card, Collection, Course, EntityId, LocalStore, Memo, Rating, ReviewProgress, StorageError,
    StoreEvent, Subject, UserId, WorkspaceId,
};
use crate::sync::{
    ConnectivityMonitor, RemoteStore, SharedStore, SyncConfig, SyncContext, SyncError,
    SyncOrchestrator, SyncReport,
};

/// Subject cards fall back to when their own subject is deleted.
pub const DEFAULT_SUBJECT_NAME: &str = "Unclassified";

/// Trim and capitalize the first letter; duplicate checks stay
/// case-insensitive on top of this.
fn normalize_subject_name(name: &str) -> String {
    let name = name.trim();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("{0}")]
    Validation(String),

    #[error("sign-out blocked: unsynced changes could not be uploaded")]
    SignOutBlocked,
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// A card joined with the user's progress for it. No progress record means
/// the card has never been reviewed and is due immediately.
#[derive(Debug, Clone)]
pub struct DueCard {
    pub card: Card,
    pub progress: Option<ReviewProgress>,
}

impl DueCard {
    /// `None` for never-reviewed cards, which sort before everything else.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.progress.as_ref().map(|p| p.due_date)
    }
}

pub struct StudyService {
    store: SharedStore,
    orchestrator: Arc<SyncOrchestrator>,
    connectivity: ConnectivityMonitor,
    session: Mutex<Option<SyncContext>>,
}

impl StudyService {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let store: SharedStore = Arc::new(Mutex::new(store));
        let orchestrator = Arc::new(SyncOrchestrator::new(store.clone(), remote, config));
        Self {
            store,
            orchestrator,
            connectivity,
            session: Mutex::new(None),
        }
    }

    /// Events for every local mutation, including merges applied by sync.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<StoreEvent> {
        self.store.lock().unwrap().subscribe()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Bind the service to a signed-in workspace/user. Sync cycles started
    /// for any other workspace stop committing from this point on.
    pub fn set_session(&self, ctx: Option<SyncContext>) {
        self.orchestrator
            .set_active_workspace(ctx.as_ref().map(|c| c.workspace));
        *self.session.lock().unwrap() = ctx;
    }

    fn session_for(&self, workspace: WorkspaceId) -> Option<SyncContext> {
        (*self.session.lock().unwrap()).filter(|ctx| ctx.workspace == workspace)
    }

    /// Fire-and-forget sync after a local mutation. Offline, or outside a
    /// runtime, the change simply waits for the next explicit cycle.
    fn request_sync(&self, workspace: WorkspaceId) {
        let Some(ctx) = self.session_for(workspace) else {
            return;
        };
        if !self.connectivity.is_online() {
            log::debug!("service: offline, deferring sync for {}", workspace);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let orchestrator = self.orchestrator.clone();
        handle.spawn(async move {
            match orchestrator.sync_workspace(&ctx).await {
                Ok(report) if !report.in_flight => {
                    log::debug!("service: background sync pushed {}", report.pushed);
                }
                Ok(_) => {}
                Err(err) => log::warn!("service: background sync failed: {}", err),
            }
        });
    }

    // ==================== Cards ====================

    pub fn create_card(
        &self,
        workspace: WorkspaceId,
        subject_id: EntityId,
        question: &str,
        answer: &str,
    ) -> Result<Card> {
        let question = question.trim();
        let answer = answer.trim();
        if question.is_empty() || answer.is_empty() {
            return Err(ServiceError::Validation(
                "card question and answer must not be empty".into(),
            ));
        }
        let mut card = Card::new(workspace, subject_id, question.into(), answer.into());
        self.store.lock().unwrap().put_local(&mut card)?;
        self.request_sync(workspace);
        Ok(card)
    }

    pub fn update_card(&self, mut card: Card) -> Result<Card> {
        let workspace = card.workspace_id;
        self.store.lock().unwrap().put_local(&mut card)?;
        self.request_sync(workspace);
        Ok(card)
    }

    pub fn delete_card(&self, workspace: WorkspaceId, id: &EntityId) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .delete_with_tombstone(Collection::Cards, id)?;
        self.request_sync(workspace);
        Ok(())
    }

    pub fn list_cards(&self, workspace: WorkspaceId) -> Result<Vec<Card>> {
        Ok(self.store.lock().unwrap().list(workspace)?)
    }

    /// Bulk import, one card per line as `question/answer` or
    /// `question/answer/subject`. Unknown subjects are created on the fly;
    /// lines without a subject land in the default one. Malformed lines are
    /// skipped with a warning.
    pub fn bulk_add_cards(&self, workspace: WorkspaceId, text: &str) -> Result<Vec<Card>> {
        let mut created = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, '/').map(str::trim);
            let (question, answer) = match (parts.next(), parts.next()) {
                (Some(q), Some(a)) if !q.is_empty() && !a.is_empty() => (q, a),
                _ => {
                    log::warn!("service: skipping malformed import line {}", index + 1);
                    continue;
                }
            };
            let subject = match parts.next().filter(|s| !s.is_empty()) {
                Some(name) => self.find_or_create_subject(workspace, name)?,
                None => self.default_subject(workspace)?,
            };

            let mut card = Card::new(workspace, subject.id.clone(), question.into(), answer.into());
            self.store.lock().unwrap().put_local(&mut card)?;
            created.push(card);
        }
        log::info!(
            "service: imported {} cards into workspace {}",
            created.len(),
            workspace,
        );
        if !created.is_empty() {
            self.request_sync(workspace);
        }
        Ok(created)
    }

    // ==================== Subjects ====================

    pub fn create_subject(&self, workspace: WorkspaceId, name: &str) -> Result<Subject> {
        let name = normalize_subject_name(name);
        if name.is_empty() {
            return Err(ServiceError::Validation(
                "subject name must not be empty".into(),
            ));
        }
        let mut store = self.store.lock().unwrap();
        if store.find_subject_by_name(workspace, &name)?.is_some() {
            return Err(ServiceError::Validation(format!(
                "a subject named '{}' already exists",
                name
            )));
        }
        let mut subject = Subject::new(workspace, name);
        store.put_local(&mut subject)?;
        drop(store);
        self.request_sync(workspace);
        Ok(subject)
    }

    pub fn rename_subject(&self, mut subject: Subject, name: &str) -> Result<Subject> {
        let name = normalize_subject_name(name);
        let workspace = subject.workspace_id;
        let mut store = self.store.lock().unwrap();
        if let Some(existing) = store.find_subject_by_name(workspace, &name)? {
            if existing.id != subject.id {
                return Err(ServiceError::Validation(format!(
                    "a subject named '{}' already exists",
                    name
                )));
            }
        }
        subject.name = name;
        store.put_local(&mut subject)?;
        drop(store);
        self.request_sync(workspace);
        Ok(subject)
    }

    pub fn list_subjects(&self, workspace: WorkspaceId) -> Result<Vec<Subject>> {
        Ok(self.store.lock().unwrap().list(workspace)?)
    }

    fn find_or_create_subject(&self, workspace: WorkspaceId, name: &str) -> Result<Subject> {
        let name = normalize_subject_name(name);
        let mut store = self.store.lock().unwrap();
        if let Some(existing) = store.find_subject_by_name(workspace, &name)? {
            return Ok(existing);
        }
        let mut subject = Subject::new(workspace, name);
        store.put_local(&mut subject)?;
        Ok(subject)
    }

    fn default_subject(&self, workspace: WorkspaceId) -> Result<Subject> {
        self.find_or_create_subject(workspace, DEFAULT_SUBJECT_NAME)
    }

    /// Delete a subject and every card in it. Both leave tombstones.
    pub fn delete_subject_and_cards(
        &self,
        workspace: WorkspaceId,
        subject_id: &EntityId,
    ) -> Result<usize> {
        let mut store = self.store.lock().unwrap();
        let cards: Vec<Card> = store.list(workspace)?;
        let mut deleted = 0;
        for card in cards.iter().filter(|c| &c.subject_id == subject_id) {
            store.delete_with_tombstone(Collection::Cards, &card.id)?;
            deleted += 1;
        }
        store.delete_with_tombstone(Collection::Subjects, subject_id)?;
        drop(store);
        log::info!("service: deleted subject with {} cards", deleted);
        self.request_sync(workspace);
        Ok(deleted)
    }

    /// Delete a subject but keep its cards, moving them to the default
    /// subject. Moved cards are re-marked unsynced so the new reference
    /// uploads on the next cycle.
    pub fn delete_subject_reassign_cards(
        &self,
        workspace: WorkspaceId,
        subject_id: &EntityId,
    ) -> Result<usize> {
        let fallback = self.default_subject(workspace)?;
        if &fallback.id == subject_id {
            return Err(ServiceError::Validation(format!(
                "cannot delete the '{}' subject with reassignment",
                DEFAULT_SUBJECT_NAME
            )));
        }

        let mut store = self.store.lock().unwrap();
        let cards: Vec<Card> = store.list(workspace)?;
        let mut moved = 0;
        for mut card in cards {
            if &card.subject_id != subject_id {
                continue;
            }
            card.subject_id = fallback.id.clone();
            store.put_local(&mut card)?;
            moved += 1;
        }
        store.delete_with_tombstone(Collection::Subjects, subject_id)?;
        drop(store);
        log::info!("service: deleted subject, reassigned {} cards", moved);
        self.request_sync(workspace);
        Ok(moved)
    }

    // ==================== Courses ====================

    pub fn create_course(
        &self,
        workspace: WorkspaceId,
        subject_id: Option<EntityId>,
        title: &str,
        content: &str,
    ) -> Result<Course> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ServiceError::Validation(
                "course title must not be empty".into(),
            ));
        }
        let mut course = Course::new(workspace, subject_id, title.into(), content.into());
        self.store.lock().unwrap().put_local(&mut course)?;
        self.request_sync(workspace);
        Ok(course)
    }

    pub fn update_course(&self, mut course: Course) -> Result<Course> {
        let workspace = course.workspace_id;
        self.store.lock().unwrap().put_local(&mut course)?;
        self.request_sync(workspace);
        Ok(course)
    }

    pub fn delete_course(&self, workspace: WorkspaceId, id: &EntityId) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .delete_with_tombstone(Collection::Courses, id)?;
        self.request_sync(workspace);
        Ok(())
    }

    pub fn list_courses(&self, workspace: WorkspaceId) -> Result<Vec<Course>> {
        Ok(self.store.lock().unwrap().list(workspace)?)
    }

    // ==================== Memos ====================

    pub fn create_memo(
        &self,
        workspace: WorkspaceId,
        course_id: Option<EntityId>,
        content: &str,
    ) -> Result<Memo> {
        let mut memo = Memo::new(workspace, course_id, content.into());
        self.store.lock().unwrap().put_local(&mut memo)?;
        self.request_sync(workspace);
        Ok(memo)
    }

    pub fn update_memo(&self, mut memo: Memo) -> Result<Memo> {
        let workspace = memo.workspace_id;
        self.store.lock().unwrap().put_local(&mut memo)?;
        self.request_sync(workspace);
        Ok(memo)
    }

    pub fn delete_memo(&self, workspace: WorkspaceId, id: &EntityId) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .delete_with_tombstone(Collection::Memos, id)?;
        self.request_sync(workspace);
        Ok(())
    }

    pub fn list_memos(&self, workspace: WorkspaceId) -> Result<Vec<Memo>> {
        Ok(self.store.lock().unwrap().list(workspace)?)
    }

    // ==================== Reviewing ====================

    /// Record a review rating and persist the scheduler's verdict. This is
    /// the only path that writes `due_date` and `status`.
    pub fn rate_card(
        &self,
        workspace: WorkspaceId,
        user: UserId,
        card_id: &EntityId,
        rating: Rating,
    ) -> Result<ReviewProgress> {
        let now = Utc::now();
        let mut store = self.store.lock().unwrap();
        store.require::<Card>(card_id)?;

        let existing = store.progress_for(workspace, card_id, user)?;
        let outcome = scheduler::rate(existing.as_ref(), rating, now);

        let mut progress = existing
            .unwrap_or_else(|| ReviewProgress::new(workspace, card_id.clone(), user));
        progress.interval = outcome.interval;
        progress.ease_factor = outcome.ease_factor;
        progress.status = outcome.status;
        progress.due_date = outcome.due_date;
        progress.review_count += 1;
        store.put_local(&mut progress)?;
        drop(store);

        self.request_sync(workspace);
        Ok(progress)
    }

    /// Cards for a study session. Never-reviewed cards count as due and
    /// sort first; the rest sort by due date. With `include_future` the
    /// whole deck is returned in that order, otherwise only cards due now.
    pub fn cards_due_for_review(
        &self,
        workspace: WorkspaceId,
        user: UserId,
        subject_filter: Option<&[EntityId]>,
        include_future: bool,
    ) -> Result<Vec<DueCard>> {
        let now = Utc::now();
        let store = self.store.lock().unwrap();
        let cards: Vec<Card> = store.list(workspace)?;
        let progress = store.progress_for_user(workspace, user)?;
        drop(store);

        let mut due: Vec<DueCard> = cards
            .into_iter()
            .filter(|card| match subject_filter {
                Some(subjects) => subjects.contains(&card.subject_id),
                None => true,
            })
            .map(|card| {
                let progress = progress.iter().find(|p| p.card_id == card.id).cloned();
                DueCard { card, progress }
            })
            .filter(|entry| {
                include_future
                    || entry
                        .progress
                        .as_ref()
                        .map_or(true, |p| p.is_due(now))
            })
            .collect();

        // Option sorts None first: new cards lead the session.
        due.sort_by_key(|entry| entry.due_at());
        Ok(due)
    }

    // ==================== Sync and session ====================

    /// Run a sync cycle now. Transient failures (offline, timeout) come
    /// back as a non-success report; local state is already durable either
    /// way.
    pub async fn sync_now(&self, ctx: &SyncContext) -> Result<SyncReport> {
        match self.orchestrator.sync_workspace(ctx).await {
            Ok(report) => Ok(report),
            Err(err) if err.is_transient() => {
                log::warn!("service: sync did not complete: {}", err);
                Ok(SyncReport::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Consume the remote change feed until it closes or the workspace is
    /// switched away.
    pub async fn run_change_feed(&self, ctx: SyncContext) -> Result<()> {
        Ok(self.orchestrator.run_change_feed(ctx).await?)
    }

    /// Drive sync from connectivity: every offline-to-online transition
    /// starts a cycle, so changes made offline upload as soon as the
    /// device reconnects. Runs until the connectivity channel closes.
    pub async fn run_connectivity_driver(&self, ctx: SyncContext) {
        let mut online = self.connectivity.subscribe();
        while online.changed().await.is_ok() {
            if !*online.borrow() {
                continue;
            }
            log::info!("service: back online, starting sync");
            if let Err(err) = self.orchestrator.sync_workspace(&ctx).await {
                log::warn!("service: reconnect sync failed: {}", err);
            }
        }
    }

    /// Sign out of a workspace. A final sync must fully succeed first;
    /// otherwise local state (and its unsynced changes) stays intact and
    /// the sign-out is refused.
    pub async fn sign_out(&self, ctx: &SyncContext) -> Result<()> {
        let report = self.sync_now(ctx).await?;
        if !report.success {
            return Err(ServiceError::SignOutBlocked);
        }
        {
            let mut store = self.store.lock().unwrap();
            store.clear_workspace(ctx.workspace)?;
        }
        self.set_session(None);
        log::info!("service: signed out of workspace {}", ctx.workspace);
        Ok(())
    }
}
