//! Directory and search data types shared by the gateway, the chat endpoints and the streaming
//! search session.

use serde::{Deserialize, Serialize};

use crate::credentials::OrganizationRole;

/// Searchable, free-form profile attributes of a directory member.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSemantic {
    /// Self-written description used for semantic matching.
    #[serde(default)]
    pub description: String,
    /// Team identifier.
    #[serde(default)]
    pub team: String,
    /// Level identifier.
    #[serde(default)]
    pub level: String,
    /// Free-form location name.
    #[serde(default)]
    pub location: String,
}

/// Contact handles of a directory member.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserContact {
    #[serde(default)]
    pub slack: String,
    #[serde(default)]
    pub telephone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub telegram: String,
    #[serde(default)]
    pub whatsapp: String,
}

/// The directory member a search result points at.
///
/// Only `_id` is required; every other field defaults when the server omits it, so that
/// persisted chat records with a bare user id still deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub semantic: UserSemantic,
    #[serde(default)]
    pub contact: UserContact,
    #[serde(rename = "avatarId", default, skip_serializing_if = "Option::is_none")]
    pub avatar_id: Option<String>,
    #[serde(rename = "organizationId", default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(
        rename = "organizationRole",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub organization_role: Option<OrganizationRole>,
}

impl UserRef {
    /// Create a reference with only an id and a display name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

/// One ranked match produced by a search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    /// Similarity score; higher is better.
    pub score: f64,
    /// The matched member.
    pub user: UserRef,
    /// Generated explanation of why the member matches.
    #[serde(default)]
    pub description: String,
}

impl SearchResult {
    /// Create a new search result.
    pub fn new(score: f64, user: UserRef, description: impl Into<String>) -> Self {
        Self {
            score,
            user,
            description: description.into(),
        }
    }
}

/// Sort results by descending score for display.
///
/// The sort is stable: results with equal scores keep their arrival order.
pub fn rank(results: &[SearchResult]) -> Vec<SearchResult> {
    let mut ranked = results.to_vec();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

/// Filters narrowing a search to parts of the organization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchFilters {
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub levels: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    /// Maximum number of results the server should produce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl SearchFilters {
    /// Create an empty filter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given teams.
    pub fn with_teams<I, S>(mut self, teams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.teams = teams.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the given levels.
    pub fn with_levels<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.levels = levels.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the given locations.
    pub fn with_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locations = locations.into_iter().map(Into::into).collect();
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query pairs for this filter set: one pair per value, never a joined list.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (key, values) in [
            ("teams", &self.teams),
            ("levels", &self.levels),
            ("locations", &self.locations),
        ] {
            for value in values {
                pairs.push((key.to_string(), value.clone()));
            }
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn search_result_from_server_json() {
        let result: SearchResult = serde_json::from_value(json!({
            "score": 0.91,
            "user": {
                "_id": "u1",
                "name": "Ada",
                "email": "ada@example.com",
                "semantic": {"description": "backend", "team": "t1", "level": "l3", "location": "Berlin"},
                "contact": {"slack": "ada"},
                "organizationRole": "ADMIN"
            },
            "description": "Knows the billing service."
        }))
        .unwrap();
        assert_eq!(result.user.id, "u1");
        assert_eq!(result.user.semantic.location, "Berlin");
        assert_eq!(result.user.contact.slack, "ada");
        assert_eq!(result.user.organization_role, Some(OrganizationRole::Admin));
        assert_eq!(result.description, "Knows the billing service.");
    }

    #[test]
    fn search_result_without_description() {
        let result: SearchResult =
            serde_json::from_value(json!({"score": 0.5, "user": {"_id": "u2"}})).unwrap();
        assert_eq!(result.description, "");
        assert_eq!(result.user.name, "");
    }

    #[test]
    fn rank_is_descending_and_stable() {
        let results = vec![
            SearchResult::new(0.2, UserRef::new("a", "A"), ""),
            SearchResult::new(0.9, UserRef::new("b", "B"), ""),
            SearchResult::new(0.2, UserRef::new("c", "C"), ""),
        ];
        let ids: Vec<_> = rank(&results).into_iter().map(|r| r.user.id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn filters_repeat_keys() {
        let filters = SearchFilters::new()
            .with_teams(["t1", "t2"])
            .with_locations(["Berlin"])
            .with_limit(5);
        assert_eq!(
            filters.query_pairs(),
            vec![
                ("teams".to_string(), "t1".to_string()),
                ("teams".to_string(), "t2".to_string()),
                ("locations".to_string(), "Berlin".to_string()),
                ("limit".to_string(), "5".to_string()),
            ]
        );
    }
}
