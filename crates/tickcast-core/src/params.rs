//! Connect-time request parameters and cohort key derivation.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{FeedType, GroupKey};

/// Reserved authentication parameter, never part of a group key.
pub const TOKEN_PARAM: &str = "token";

/// String parameters supplied when a session connects (e.g. the query string).
///
/// Keeps first-insertion order. Inserting an existing key replaces its
/// value but keeps its original position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectParams(IndexMap<String, String>);

impl ConnectParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a URL query string (`a=1&b=two%20words`).
    ///
    /// A leading `?` is ignored. Keys without a value map to "".
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Derives the cohort key for `feed`.
    ///
    /// Every parameter except [`TOKEN_PARAM`] is rendered as `key=value` and
    /// joined with `&`, in insertion order unless `sorted` is set. With no
    /// remaining parameters the key is the feed name.
    pub fn group_key(&self, feed: &FeedType, sorted: bool) -> GroupKey {
        let mut entries: Vec<(&str, &str)> =
            self.iter().filter(|(k, _)| *k != TOKEN_PARAM).collect();

        if entries.is_empty() {
            return GroupKey::new(feed.as_str());
        }
        if sorted {
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        }

        let joined = entries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        GroupKey::new(joined)
    }
}

impl FromIterator<(String, String)> for ConnectParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for ConnectParams {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> FeedType {
        FeedType::new("quotes")
    }

    #[test]
    fn test_group_key_excludes_token() {
        let params = ConnectParams::from_query("zone=A&token=secret&unit=kw");
        assert_eq!(params.group_key(&feed(), false).as_str(), "zone=A&unit=kw");
    }

    #[test]
    fn test_group_key_falls_back_to_feed_name() {
        let params = ConnectParams::from_query("token=secret");
        assert_eq!(params.group_key(&feed(), false).as_str(), "quotes");
        assert_eq!(ConnectParams::new().group_key(&feed(), false).as_str(), "quotes");
    }

    #[test]
    fn test_group_key_keeps_insertion_order() {
        let ab = ConnectParams::from_query("a=1&b=2");
        let ba = ConnectParams::from_query("b=2&a=1");

        assert_ne!(ab.group_key(&feed(), false), ba.group_key(&feed(), false));
        assert_eq!(ab.group_key(&feed(), true), ba.group_key(&feed(), true));
        assert_eq!(ba.group_key(&feed(), true).as_str(), "a=1&b=2");
    }

    #[test]
    fn test_repeated_key_keeps_first_position_last_value() {
        let params = ConnectParams::from_query("zone=A&unit=kw&zone=B");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("zone"), Some("B"));
        assert_eq!(params.group_key(&feed(), false).as_str(), "zone=B&unit=kw");
    }

    #[test]
    fn test_from_query_decodes() {
        let params = ConnectParams::from_query("?name=two%20words&flag");
        assert_eq!(params.get("name"), Some("two words"));
        assert_eq!(params.get("flag"), Some(""));
        assert!(ConnectParams::from_query("").is_empty());
    }
}
