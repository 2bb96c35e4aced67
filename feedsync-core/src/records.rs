//! Record kinds carried by the feeds, and their document schemas
//!
//! Primary collections (posts, replies, tournament messages, participants)
//! are [`Record`]s keyed by their own id. Profile summaries are the keyed
//! enrichment value. Each kind decodes from a raw [`Document`] with explicit
//! validation so the sync core only ever sees typed values.

use crate::{
    parse_timestamp, MessageId, ParticipantId, PostId, Record, ReplyId, SchemaError, Timestamp,
    TournamentId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw document as delivered by a backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    /// Build a document from an id and a JSON object. Non-object values
    /// produce a document with no fields.
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            fields,
        }
    }
}

impl Record for Document {
    type Id = String;

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

/// Decoding from a raw document with schema validation.
pub trait Decode: Sized {
    /// Human-readable kind used in error messages.
    const KIND: &'static str;

    fn decode(doc: &Document) -> Result<Self, SchemaError>;
}

struct Fields<'a> {
    kind: &'static str,
    doc: &'a Document,
}

impl<'a> Fields<'a> {
    fn new(kind: &'static str, doc: &'a Document) -> Self {
        Self { kind, doc }
    }

    fn missing(&self, field: &str) -> SchemaError {
        SchemaError::RequiredFieldMissing {
            kind: self.kind,
            id: self.doc.id.clone(),
            field: field.to_string(),
        }
    }

    fn invalid(&self, field: &str, reason: &str) -> SchemaError {
        SchemaError::InvalidValue {
            kind: self.kind,
            id: self.doc.id.clone(),
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    fn optional_str(&self, field: &str) -> Result<Option<String>, SchemaError> {
        match self.doc.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.invalid(field, "expected string")),
        }
    }

    fn required_str(&self, field: &str) -> Result<String, SchemaError> {
        match self.optional_str(field)? {
            Some(s) if !s.trim().is_empty() => Ok(s),
            Some(_) => Err(self.invalid(field, "must not be empty")),
            None => Err(self.missing(field)),
        }
    }

    fn count(&self, field: &str) -> Result<u32, SchemaError> {
        match self.doc.fields.get(field) {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| self.invalid(field, "expected non-negative integer")),
            Some(_) => Err(self.invalid(field, "expected number")),
        }
    }

    fn integer(&self, field: &str) -> Result<i64, SchemaError> {
        match self.doc.fields.get(field) {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| self.invalid(field, "expected integer")),
            Some(_) => Err(self.invalid(field, "expected number")),
        }
    }

    fn timestamp(&self, field: &str) -> Result<Timestamp, SchemaError> {
        let raw = self.doc.fields.get(field).ok_or_else(|| self.missing(field))?;
        parse_timestamp(raw).map_err(|source| SchemaError::Timestamp {
            field: field.to_string(),
            source,
        })
    }
}

// ============================================================================
// PROFILE SUMMARY (keyed enrichment value)
// ============================================================================

/// Small profile value object used to enrich feed items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl ProfileSummary {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

impl Decode for ProfileSummary {
    const KIND: &'static str = "profile";

    fn decode(doc: &Document) -> Result<Self, SchemaError> {
        let f = Fields::new(Self::KIND, doc);
        // Older profile documents only carry `username`.
        let display_name = match f.optional_str("displayName")? {
            Some(name) if !name.trim().is_empty() => name,
            _ => f
                .required_str("username")
                .map_err(|_| f.missing("displayName"))?,
        };
        Ok(Self {
            display_name,
            avatar_url: f.optional_str("avatarUrl")?,
        })
    }
}

// ============================================================================
// POST
// ============================================================================

/// A feed post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub author_id: UserId,
    pub body: String,
    pub like_count: u32,
    pub reply_count: u32,
    pub tournament_id: Option<TournamentId>,
    pub created_at: Timestamp,
}

impl Record for Post {
    type Id = PostId;

    fn record_id(&self) -> PostId {
        self.id.clone()
    }
}

impl Decode for Post {
    const KIND: &'static str = "post";

    fn decode(doc: &Document) -> Result<Self, SchemaError> {
        let f = Fields::new(Self::KIND, doc);
        Ok(Self {
            id: PostId::new(doc.id.clone()),
            author_id: UserId::new(f.required_str("authorId")?),
            body: f.optional_str("body")?.unwrap_or_default(),
            like_count: f.count("likeCount")?,
            reply_count: f.count("replyCount")?,
            tournament_id: f.optional_str("tournamentId")?.map(TournamentId::new),
            created_at: f.timestamp("createdAt")?,
        })
    }
}

// ============================================================================
// REPLY
// ============================================================================

/// A reply to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: ReplyId,
    pub post_id: PostId,
    pub author_id: UserId,
    pub body: String,
    pub created_at: Timestamp,
}

impl Record for Reply {
    type Id = ReplyId;

    fn record_id(&self) -> ReplyId {
        self.id.clone()
    }
}

impl Decode for Reply {
    const KIND: &'static str = "reply";

    fn decode(doc: &Document) -> Result<Self, SchemaError> {
        let f = Fields::new(Self::KIND, doc);
        Ok(Self {
            id: ReplyId::new(doc.id.clone()),
            post_id: PostId::new(f.required_str("postId")?),
            author_id: UserId::new(f.required_str("authorId")?),
            body: f.required_str("body")?,
            created_at: f.timestamp("createdAt")?,
        })
    }
}

// ============================================================================
// TOURNAMENT MESSAGE
// ============================================================================

/// A chat message inside a tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentMessage {
    pub id: MessageId,
    pub tournament_id: TournamentId,
    pub sender_id: UserId,
    pub text: String,
    pub sent_at: Timestamp,
}

impl Record for TournamentMessage {
    type Id = MessageId;

    fn record_id(&self) -> MessageId {
        self.id.clone()
    }
}

impl Decode for TournamentMessage {
    const KIND: &'static str = "tournament_message";

    fn decode(doc: &Document) -> Result<Self, SchemaError> {
        let f = Fields::new(Self::KIND, doc);
        Ok(Self {
            id: MessageId::new(doc.id.clone()),
            tournament_id: TournamentId::new(f.required_str("tournamentId")?),
            sender_id: UserId::new(f.required_str("senderId")?),
            text: f.required_str("text")?,
            sent_at: f.timestamp("sentAt")?,
        })
    }
}

// ============================================================================
// PARTICIPANT
// ============================================================================

/// A user's participation in a tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub tournament_id: TournamentId,
    pub user_id: UserId,
    pub score: i64,
    pub joined_at: Timestamp,
}

impl Record for Participant {
    type Id = ParticipantId;

    fn record_id(&self) -> ParticipantId {
        self.id.clone()
    }
}

impl Decode for Participant {
    const KIND: &'static str = "participant";

    fn decode(doc: &Document) -> Result<Self, SchemaError> {
        let f = Fields::new(Self::KIND, doc);
        Ok(Self {
            id: ParticipantId::new(doc.id.clone()),
            tournament_id: TournamentId::new(f.required_str("tournamentId")?),
            user_id: UserId::new(f.required_str("userId")?),
            score: f.integer("score")?,
            joined_at: f.timestamp("joinedAt")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_decode_post() {
        let doc = Document::new(
            "p1",
            json!({
                "authorId": "alice",
                "body": "gg",
                "likeCount": 3,
                "createdAt": {"seconds": 1_700_000_000, "nanoseconds": 0},
            }),
        );
        let post = Post::decode(&doc).unwrap();
        assert_eq!(post.id, PostId::new("p1"));
        assert_eq!(post.author_id, UserId::new("alice"));
        assert_eq!(post.like_count, 3);
        assert_eq!(post.reply_count, 0);
        assert_eq!(post.created_at, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
    }

    #[test]
    fn test_decode_post_missing_author() {
        let doc = Document::new("p1", json!({"createdAt": 0}));
        let err = Post::decode(&doc).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::RequiredFieldMissing { ref field, .. } if field == "authorId"
        ));
    }

    #[test]
    fn test_decode_post_rejects_negative_likes() {
        let doc = Document::new(
            "p1",
            json!({"authorId": "a", "likeCount": -1, "createdAt": 0}),
        );
        assert!(matches!(
            Post::decode(&doc),
            Err(SchemaError::InvalidValue { ref field, .. }) if field == "likeCount"
        ));
    }

    #[test]
    fn test_decode_bad_timestamp() {
        let doc = Document::new(
            "r1",
            json!({"postId": "p1", "authorId": "a", "body": "hi", "createdAt": true}),
        );
        assert!(matches!(
            Reply::decode(&doc),
            Err(SchemaError::Timestamp { ref field, .. }) if field == "createdAt"
        ));
    }

    #[test]
    fn test_decode_profile_falls_back_to_username() {
        let doc = Document::new("u1", json!({"username": "alice99"}));
        let profile = ProfileSummary::decode(&doc).unwrap();
        assert_eq!(profile.display_name, "alice99");
        assert_eq!(profile.avatar_url, None);

        let doc = Document::new("u2", json!({"avatarUrl": "x"}));
        assert!(matches!(
            ProfileSummary::decode(&doc),
            Err(SchemaError::RequiredFieldMissing { ref field, .. }) if field == "displayName"
        ));
    }

    #[test]
    fn test_decode_message_and_participant() {
        let msg = TournamentMessage::decode(&Document::new(
            "m1",
            json!({"tournamentId": "t1", "senderId": "bob", "text": "hello", "sentAt": "2024-03-01T10:00:00Z"}),
        ))
        .unwrap();
        assert_eq!(msg.sender_id, UserId::new("bob"));

        let participant = Participant::decode(&Document::new(
            "pa1",
            json!({"tournamentId": "t1", "userId": "bob", "score": -4, "joinedAt": 1_700_000_000_000i64}),
        ))
        .unwrap();
        assert_eq!(participant.score, -4);
        assert_eq!(participant.record_id(), ParticipantId::new("pa1"));
    }

    #[test]
    fn test_post_serializes_camel_case() {
        let post = Post {
            id: PostId::new("p1"),
            author_id: UserId::new("a"),
            body: String::new(),
            like_count: 1,
            reply_count: 0,
            tournament_id: None,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
        };
        let value = serde_json::to_value(&post).unwrap();
        assert_eq!(value["authorId"], json!("a"));
        assert_eq!(value["likeCount"], json!(1));
        assert_eq!(value["id"], json!("p1"));
    }
}
