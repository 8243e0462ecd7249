use crate::altered::client::{AlteredClient, AlteredError, ensure_success};
use serde::{Deserialize, Serialize};

/// A possible transfer recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Friend {
    pub id: String,
    pub nick_name: Option<String>,
    pub unique_id: Option<String>,
    pub avatar_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FriendshipPage {
    #[serde(rename = "hydra:member", default)]
    members: Vec<Friendship>,
}

#[derive(Debug, Deserialize)]
struct Friendship {
    #[serde(rename = "userFriend")]
    user_friend: Option<UserFriend>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserFriend {
    id: String,
    #[serde(default)]
    friend_status: Option<String>,
    #[serde(default)]
    nick_name: Option<String>,
    #[serde(default)]
    unique_id: Option<String>,
    #[serde(default)]
    avatar_path: Option<String>,
}

impl AlteredClient {
    /// Accepted friendships of the token's owner.
    pub async fn fetch_friends(&self, token: &str) -> Result<Vec<Friend>, AlteredError> {
        let response = self
            .http
            .get(self.api_url("user_friendships"))
            .query(&[("itemsPerPage", "1000"), ("page", "1")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| AlteredError::Request(err.to_string()))?;
        let response = ensure_success(response).await?;

        let payload: FriendshipPage = response
            .json()
            .await
            .map_err(|err| AlteredError::Deserialize(err.to_string()))?;

        Ok(payload
            .members
            .into_iter()
            .filter_map(|f| f.user_friend)
            .filter(|u| u.friend_status.as_deref() == Some("ACCEPTED"))
            .map(|u| Friend {
                id: u.id,
                nick_name: u.nick_name,
                unique_id: u.unique_id,
                avatar_path: u.avatar_path,
            })
            .collect())
    }
}
