//! In-memory users and teams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub name: String,
    pub leader_id: String,
    pub created_at: DateTime<Utc>,
}

fn at(timestamp: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Users and teams, keyed by id.
pub struct Store {
    users: RwLock<Vec<User>>,
    teams: RwLock<HashMap<String, Team>>,
}

impl Store {
    pub fn with_seed_data() -> Self {
        let users = [
            ("1", "Alice", "team1", "2023-01-15T10:30:00Z"),
            ("2", "Bob", "team1", "2023-02-20T14:45:00Z"),
            ("3", "Charlie", "team2", "2023-03-10T09:15:00Z"),
        ]
        .into_iter()
        .map(|(id, name, team_id, created_at)| User {
            id: id.to_string(),
            name: name.to_string(),
            team_id: Some(team_id.to_string()),
            created_at: at(created_at),
        })
        .collect();

        let teams = [
            ("team1", "Engineering", "1", "2022-12-01T08:00:00Z"),
            ("team2", "Design", "3", "2023-01-05T12:30:00Z"),
        ]
        .into_iter()
        .map(|(id, name, leader_id, created_at)| {
            let team = Team {
                id: id.to_string(),
                name: name.to_string(),
                leader_id: leader_id.to_string(),
                created_at: at(created_at),
            };
            (team.id.clone(), team)
        })
        .collect();

        Self {
            users: RwLock::new(users),
            teams: RwLock::new(teams),
        }
    }

    pub async fn users(&self) -> Vec<User> {
        self.users.read().await.clone()
    }

    pub async fn users_by_ids(&self, ids: &[String]) -> Vec<User> {
        self.users
            .read()
            .await
            .iter()
            .filter(|user| ids.contains(&user.id))
            .cloned()
            .collect()
    }

    pub async fn teams_by_ids(&self, ids: &[String]) -> Vec<Team> {
        let teams = self.teams.read().await;
        ids.iter().filter_map(|id| teams.get(id)).cloned().collect()
    }

    /// Members of each team, in user order. Teams without members map to an
    /// empty list.
    pub async fn members_by_team_ids(&self, team_ids: &[String]) -> HashMap<String, Vec<User>> {
        let users = self.users.read().await;
        team_ids
            .iter()
            .map(|team_id| {
                let members = users
                    .iter()
                    .filter(|user| user.team_id.as_deref() == Some(team_id.as_str()))
                    .cloned()
                    .collect();
                (team_id.clone(), members)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_data() {
        let store = Store::with_seed_data();
        assert_eq!(store.users().await.len(), 3);

        let teams = store.teams_by_ids(&["team2".into(), "team9".into()]).await;
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].leader_id, "3");

        let members = store.members_by_team_ids(&["team1".into()]).await;
        let names: Vec<_> = members["team1"].iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_user_wire_format() {
        let user = User {
            id: "1".into(),
            name: "Alice".into(),
            team_id: Some("team1".into()),
            created_at: at("2023-01-15T10:30:00Z"),
        };
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["teamId"], "team1");
        assert_eq!(json["createdAt"], "2023-01-15T10:30:00Z");
    }
}
