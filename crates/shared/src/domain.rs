use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// A conversation participant as resolved against the current session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_self: bool,
}

/// Owned by the REST layer; the sync core caches it read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    /// Explicit name for group conversations; direct conversations derive
    /// theirs from the non-self participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub members: Vec<Member>,
}

impl Conversation {
    pub fn display_name(&self) -> String {
        match self.kind {
            ConversationKind::Group => self
                .name
                .clone()
                .unwrap_or_else(|| "Unnamed group".to_string()),
            ConversationKind::Direct => self
                .members
                .iter()
                .find(|member| !member.is_self)
                .map(|member| member.display_name.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }

    pub fn member(&self, user_id: UserId) -> Option<&Member> {
        self.members.iter().find(|member| member.user_id == user_id)
    }
}
