//! Blog webhook events (mx-space style)
//!
//! Payloads arrive either with the event name in the `X-Webhook-Event`
//! header and the model as the body, or as a `{type, payload}` envelope
//! (`data` is accepted in place of `payload`). Comments and likes need extra
//! lookups before they can be formatted; `enrich` performs them against a
//! [`BlogApi`] so that [`BlogNormalizer::normalize`] stays synchronous.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::DecodeError;
use crate::api::blog::BlogApi;
use crate::text::{relative_duration, simple_preview, strip_markdown};
use crate::types::{Attachment, NotificationRecord, SourceKind};

/// Comment ancestry deeper than this is not inspected
pub const MAX_ANCESTOR_DEPTH: usize = 32;

/// Link state the blog uses for applications waiting for review
pub const LINK_STATE_AUDIT: u8 = 1;

fn default_true() -> bool {
    true
}

/// Owner and site details from the blog's aggregate endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub owner_name: String,
    pub owner_username: String,
    pub site_title: String,
    pub web_url: String,
}

impl SiteInfo {
    /// Absolute front-end URL for a site path
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.web_url.trim_end_matches('/'), path)
    }

    fn is_owner(&self, author: &str) -> bool {
        author == self.owner_name || author == self.owner_username
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

/// Populated category object, or just its id when the blog did not expand it
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CategoryField {
    Model(Category),
    Id(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(alias = "_id", default)]
    pub id: String,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub category: Option<CategoryField>,
    pub created: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub is_published: bool,
}

impl Post {
    pub fn category(&self) -> Option<&Category> {
        match &self.category {
            Some(CategoryField::Model(c)) => Some(c),
            _ => None,
        }
    }

    /// `/posts/{category}/{slug}`, or `None` when the category is not populated
    pub fn path(&self) -> Option<String> {
        self.category().map(|c| {
            format!("/posts/{}/{}", c.slug, urlencoding::encode(&self.slug))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoteImage {
    pub src: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(alias = "_id", default)]
    pub id: String,
    pub nid: u64,
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub weather: Option<String>,
    #[serde(default)]
    pub images: Vec<NoteImage>,
    #[serde(default)]
    pub hide: bool,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub public_at: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

impl Note {
    /// Hidden, password protected, or scheduled for later publication
    pub fn is_private(&self, now: DateTime<Utc>) -> bool {
        self.hide
            || self.password.as_deref().is_some_and(|p| !p.is_empty())
            || self.public_at.is_some_and(|at| at > now)
    }

    pub fn path(&self) -> String {
        format!("/notes/{}", self.nid)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    #[serde(alias = "_id", default)]
    pub id: String,
    pub title: String,
    pub slug: String,
    pub created: DateTime<Utc>,
}

/// The document a comment is attached to
#[derive(Debug, Clone)]
pub enum RefModel {
    Post(Post),
    Note(Note),
    Page(Page),
}

impl RefModel {
    pub fn title(&self) -> &str {
        match self {
            Self::Post(p) => &p.title,
            Self::Note(n) => &n.title,
            Self::Page(p) => &p.title,
        }
    }

    pub fn created(&self) -> DateTime<Utc> {
        match self {
            Self::Post(p) => p.created,
            Self::Note(n) => n.created,
            Self::Page(p) => p.created,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Self::Post(p) => p.path().unwrap_or_else(|| "/".to_string()),
            Self::Note(n) => n.path(),
            Self::Page(p) => format!("/{}", p.slug),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RefType {
    #[serde(rename = "posts", alias = "Post", alias = "post")]
    Post,
    #[serde(rename = "notes", alias = "Note", alias = "note")]
    Note,
    #[serde(rename = "pages", alias = "Page", alias = "page")]
    Page,
    #[serde(rename = "recentlies", alias = "Recently", alias = "recently")]
    Recently,
}

/// The `ref` field of a comment: an id or the embedded document
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommentRef {
    Id(String),
    Embedded(Value),
}

impl CommentRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Id(id) => Some(id),
            Self::Embedded(v) => v
                .get("id")
                .or_else(|| v.get("_id"))
                .and_then(Value::as_str),
        }
    }

    /// Decode the embedded document, if there is one and it is complete
    pub fn model(&self, ref_type: RefType) -> Option<RefModel> {
        let Self::Embedded(value) = self else {
            return None;
        };
        let value = value.clone();
        match ref_type {
            RefType::Post => serde_json::from_value(value).ok().map(RefModel::Post),
            RefType::Note => serde_json::from_value(value).ok().map(RefModel::Note),
            RefType::Page => serde_json::from_value(value).ok().map(RefModel::Page),
            RefType::Recently => None,
        }
    }
}

/// Parent of a comment: an unexpanded id or the parent comment itself
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ParentRef {
    Id(String),
    Comment(Box<ParentComment>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentComment {
    #[serde(default)]
    pub is_whispers: bool,
    #[serde(default)]
    pub parent: Option<ParentRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(alias = "_id", default)]
    pub id: String,
    pub author: String,
    pub text: String,
    pub ref_type: RefType,
    #[serde(rename = "ref", default)]
    pub reference: Option<CommentRef>,
    #[serde(default)]
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub is_whispers: bool,
}

impl Comment {
    /// Whether any expanded ancestor is a whisper
    pub fn has_whispered_ancestor(&self) -> bool {
        let mut current = self.parent.as_ref();
        for _ in 0..MAX_ANCESTOR_DEPTH {
            match current {
                Some(ParentRef::Comment(parent)) => {
                    if parent.is_whispers {
                        return true;
                    }
                    current = parent.parent.as_ref();
                }
                _ => return false,
            }
        }
        warn!(
            "Comment {} ancestry exceeds {} levels, not inspecting further",
            self.id, MAX_ANCESTOR_DEPTH
        );
        false
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    pub state: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Say {
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recently {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LikeTarget {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reader {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityLike {
    #[serde(rename = "ref")]
    pub target: LikeTarget,
    #[serde(default)]
    pub reader: Option<Reader>,
}

/// A blog webhook event we know how to format
#[derive(Debug, Clone)]
pub enum BlogEvent {
    PostCreate(Post),
    PostUpdate(Post),
    NoteCreate(Note),
    CommentCreate {
        comment: Comment,
        reference: Option<RefModel>,
    },
    LinkApply(Link),
    SayCreate(Say),
    RecentlyCreate(Recently),
    ActivityLike {
        like: ActivityLike,
        url: Option<String>,
    },
}

impl BlogEvent {
    /// Decode a webhook body. `event_header` takes precedence over the
    /// envelope's `type`. Unknown event names yield `Ok(None)`.
    pub fn decode(event_header: Option<&str>, body: &[u8]) -> Result<Option<Self>, DecodeError> {
        let mut value: Value =
            serde_json::from_slice(body).map_err(|source| DecodeError::Malformed {
                event: event_header.unwrap_or("blog").to_string(),
                source,
            })?;

        let envelope_type = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let kind = match event_header.map(str::trim).filter(|h| !h.is_empty()) {
            Some(header) => header.to_string(),
            None => envelope_type.clone().ok_or(DecodeError::MissingEventType)?,
        };

        let is_envelope = envelope_type.is_some()
            && (value.get("payload").is_some() || value.get("data").is_some());
        let data = if is_envelope {
            let key = if value.get("payload").is_some() {
                "payload"
            } else {
                "data"
            };
            value.get_mut(key).map(Value::take).unwrap_or(Value::Null)
        } else {
            value
        };

        let kind = kind.to_ascii_uppercase();
        let malformed = |source| DecodeError::Malformed {
            event: kind.clone(),
            source,
        };

        let event = match kind.as_str() {
            "POST_CREATE" => Self::PostCreate(serde_json::from_value(data).map_err(malformed)?),
            "POST_UPDATE" => Self::PostUpdate(serde_json::from_value(data).map_err(malformed)?),
            "NOTE_CREATE" => Self::NoteCreate(serde_json::from_value(data).map_err(malformed)?),
            "COMMENT_CREATE" => {
                let comment: Comment = serde_json::from_value(data).map_err(malformed)?;
                let reference = comment
                    .reference
                    .as_ref()
                    .and_then(|r| r.model(comment.ref_type));
                Self::CommentCreate { comment, reference }
            }
            "LINK_APPLY" => Self::LinkApply(serde_json::from_value(data).map_err(malformed)?),
            "SAY_CREATE" => Self::SayCreate(serde_json::from_value(data).map_err(malformed)?),
            "RECENTLY_CREATE" => {
                Self::RecentlyCreate(serde_json::from_value(data).map_err(malformed)?)
            }
            "ACTIVITY_LIKE" => Self::ActivityLike {
                like: serde_json::from_value(data).map_err(malformed)?,
                url: None,
            },
            other => {
                debug!("Ignoring unhandled blog event '{}'", other);
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::PostCreate(_) => SourceKind::PostCreate,
            Self::PostUpdate(_) => SourceKind::PostUpdate,
            Self::NoteCreate(_) => SourceKind::NoteCreate,
            Self::CommentCreate { .. } => SourceKind::Comment,
            Self::LinkApply(_) => SourceKind::LinkApply,
            Self::SayCreate(_) => SourceKind::Say,
            Self::RecentlyCreate(_) => SourceKind::Recently,
            Self::ActivityLike { .. } => SourceKind::ActivityLike,
        }
    }
}

/// Fill in what a comment or like needs from the blog API.
///
/// Lookup failures are logged and leave the event as it was; the normalizer
/// then drops it.
pub async fn enrich(event: &mut BlogEvent, api: &dyn BlogApi) {
    match event {
        BlogEvent::CommentCreate { comment, reference } if reference.is_none() => {
            if comment.is_whispers || comment.has_whispered_ancestor() {
                return;
            }
            let Some(id) = comment.reference.as_ref().and_then(CommentRef::id) else {
                warn!("Comment {} has no reference id", comment.id);
                return;
            };
            let fetched = match comment.ref_type {
                RefType::Post => api.get_post(id).await.map(RefModel::Post),
                RefType::Note => api.get_note(id).await.map(RefModel::Note),
                RefType::Page => api.get_page(id).await.map(RefModel::Page),
                RefType::Recently => {
                    debug!("Comment {} is on a recently entry, nothing to link", comment.id);
                    return;
                }
            };
            match fetched {
                Ok(model) => *reference = Some(model),
                Err(e) => warn!("Failed to fetch comment reference {}: {}", id, e),
            }
        }
        BlogEvent::ActivityLike { like, url } if url.is_none() => {
            match api.resolve_url(&like.target.id).await {
                Ok(resolved) => *url = Some(resolved),
                Err(e) => warn!("Failed to resolve url for {}: {}", like.target.id, e),
            }
        }
        _ => {}
    }
}

/// Formats blog events into notifications
#[derive(Debug, Clone)]
pub struct BlogNormalizer {
    /// Updates to posts younger than this are not announced
    pub update_min_age: Duration,
}

impl Default for BlogNormalizer {
    fn default() -> Self {
        Self {
            update_min_age: Duration::days(90),
        }
    }
}

impl BlogNormalizer {
    pub fn new(update_min_age_days: i64) -> Self {
        Self {
            update_min_age: Duration::days(update_min_age_days),
        }
    }

    pub fn normalize(
        &self,
        event: &BlogEvent,
        site: &SiteInfo,
        now: DateTime<Utc>,
    ) -> Option<NotificationRecord> {
        match event {
            BlogEvent::PostCreate(post) => self.post(post, true, site, now),
            BlogEvent::PostUpdate(post) => self.post(post, false, site, now),
            BlogEvent::NoteCreate(note) => note_created(note, site, now),
            BlogEvent::CommentCreate { comment, reference } => {
                comment_created(comment, reference.as_ref(), site, now)
            }
            BlogEvent::LinkApply(link) => link_applied(link),
            BlogEvent::SayCreate(say) => {
                let from = say
                    .source
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .or(say.author.as_deref().filter(|s| !s.is_empty()));
                let mut text = format!("{} posted a new say:\n{}", site.owner_name, say.text);
                if let Some(from) = from {
                    text.push_str(&format!("\nfrom: {}", from));
                }
                Some(NotificationRecord::new(SourceKind::Say, text))
            }
            BlogEvent::RecentlyCreate(recently) => Some(NotificationRecord::new(
                SourceKind::Recently,
                format!("{} shared a moment:\n{}", site.owner_name, recently.content),
            )),
            BlogEvent::ActivityLike { like, url } => {
                let mut text = match &like.reader {
                    Some(reader) => format!("{} liked 「{}」", reader.name, like.target.title),
                    None => format!("Someone liked 「{}」!", like.target.title),
                };
                if let Some(url) = url {
                    text.push_str(&format!("\n\nView: {}", url));
                }
                Some(NotificationRecord::new(SourceKind::ActivityLike, text))
            }
        }
    }

    fn post(
        &self,
        post: &Post,
        is_new: bool,
        site: &SiteInfo,
        now: DateTime<Utc>,
    ) -> Option<NotificationRecord> {
        if !post.is_published {
            debug!("Post {} is not published, skipping", post.id);
            return None;
        }
        if !is_new && now - post.created < self.update_min_age {
            debug!("Post {} updated within its first days, skipping", post.id);
            return None;
        }
        let Some(path) = post.path() else {
            warn!("Post {} has no category, cannot build link", post.id);
            return None;
        };

        let (verb, source) = if is_new {
            ("published a new post", SourceKind::PostCreate)
        } else {
            ("updated a post", SourceKind::PostUpdate)
        };
        let summary = post
            .summary
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| format!("{}\n\n", s))
            .unwrap_or_default();
        let text = format!(
            "{} {}: {}\n\n{}Read more: {}",
            site.owner_name,
            verb,
            post.title,
            summary,
            site.url_for(&path)
        );
        Some(NotificationRecord::new(source, text))
    }
}

fn note_created(note: &Note, site: &SiteInfo, now: DateTime<Utc>) -> Option<NotificationRecord> {
    if note.is_private(now) {
        debug!("Note {} is not public, skipping", note.nid);
        return None;
    }

    let status = [
        note.mood.as_deref().map(|m| format!("Mood: {}", m)),
        note.weather.as_deref().map(|w| format!("Weather: {}", w)),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join("\t");
    let status = if status.is_empty() {
        "\n".to_string()
    } else {
        format!("\n{}\n\n", status)
    };

    let text = format!(
        "{} published a new note: {}\n{}{}\n\nRead more: {}",
        site.owner_name,
        note.title,
        status,
        simple_preview(&note.text),
        site.url_for(&note.path())
    );

    Some(
        note.images
            .iter()
            .filter(|img| !img.src.is_empty())
            .fold(NotificationRecord::new(SourceKind::NoteCreate, text), |record, img| {
                record.with_attachment(Attachment::image(img.src.clone()))
            }),
    )
}

fn comment_created(
    comment: &Comment,
    reference: Option<&RefModel>,
    site: &SiteInfo,
    now: DateTime<Utc>,
) -> Option<NotificationRecord> {
    if comment.has_whispered_ancestor() {
        debug!("Comment {} replies to a whisper, skipping", comment.id);
        return None;
    }
    if comment.is_whispers {
        return Some(NotificationRecord::new(
            SourceKind::Comment,
            format!("「{}」Psst, someone just left a whisper.", site.site_title),
        ));
    }
    let Some(reference) = reference else {
        warn!("Comment {} reference could not be resolved", comment.id);
        return None;
    };

    let message = if site.is_owner(&comment.author) && comment.parent.is_none() {
        format!(
            "{} followed up on 「{}」 {} after publishing: {}",
            comment.author,
            reference.title(),
            relative_duration(reference.created(), now),
            comment.text
        )
    } else {
        format!(
            "{} commented on 「{}」: {}",
            comment.author,
            reference.title(),
            comment.text
        )
    };

    Some(NotificationRecord::new(
        SourceKind::Comment,
        format!(
            "{}\n\nView: {}",
            strip_markdown(&message),
            site.url_for(&reference.path())
        ),
    ))
}

fn link_applied(link: &Link) -> Option<NotificationRecord> {
    if link.state != LINK_STATE_AUDIT {
        debug!("Link {} is in state {}, skipping", link.name, link.state);
        return None;
    }
    Some(NotificationRecord::new(
        SourceKind::LinkApply,
        format!(
            "New friend link application!\n{}\n{}\n\n{}",
            link.name, link.url, link.description
        ),
    ))
}
