//! The user model: a keyed bag of attributes that flags are evaluated against.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::Value;

/// A user (evaluation context) with a required key and optional attributes.
///
/// Users are value objects created by the caller and read-only to the SDK.
/// Build one with [`User::with_key`]:
///
/// ```
/// # use darklaunch::User;
/// let user = User::with_key("user-key")
///     .country("DE")
///     .custom("plan", "pro")
///     .build();
/// assert_eq!(user.key(), "user-key");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    secondary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anonymous: Option<bool>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    custom: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    private_attribute_names: HashSet<String>,
}

impl User {
    /// Start building a user with the given key.
    pub fn with_key(key: impl Into<String>) -> UserBuilder {
        UserBuilder::new(key)
    }

    /// The user's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The user's secondary key, if set. Participates in bucketing.
    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    /// Attribute names this user asked to keep out of analytics events.
    pub fn private_attribute_names(&self) -> &HashSet<String> {
        &self.private_attribute_names
    }

    /// Looks up an attribute for evaluation.
    ///
    /// Known attribute names resolve to their slot; anything else is looked up
    /// in the custom attribute map. Unset attributes return `None`.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "key" => Some(Value::Str(self.key.clone())),
            "secondary" => self.secondary.clone().map(Value::Str),
            "ip" => self.ip.clone().map(Value::Str),
            "email" => self.email.clone().map(Value::Str),
            "name" => self.name.clone().map(Value::Str),
            "firstName" => self.first_name.clone().map(Value::Str),
            "lastName" => self.last_name.clone().map(Value::Str),
            "avatar" => self.avatar.clone().map(Value::Str),
            "country" => self.country.clone().map(Value::Str),
            "anonymous" => self.anonymous.map(Value::Bool),
            _ => self.custom.get(name).cloned(),
        }
    }

    /// All attributes that are set, keyed by their wire name. Used when
    /// serializing the user into events.
    pub(crate) fn set_attributes(&self) -> Vec<(&'static str, Value)> {
        let mut attrs = Vec::new();
        let mut push_str = |name: &'static str, slot: &Option<String>| {
            if let Some(s) = slot {
                attrs.push((name, Value::Str(s.clone())));
            }
        };
        push_str("secondary", &self.secondary);
        push_str("ip", &self.ip);
        push_str("email", &self.email);
        push_str("name", &self.name);
        push_str("firstName", &self.first_name);
        push_str("lastName", &self.last_name);
        push_str("avatar", &self.avatar);
        push_str("country", &self.country);
        if let Some(anonymous) = self.anonymous {
            attrs.push(("anonymous", Value::Bool(anonymous)));
        }
        attrs
    }

    /// The custom attribute map.
    pub(crate) fn custom_attributes(&self) -> &HashMap<String, Value> {
        &self.custom
    }
}

/// Builder for [`User`].
pub struct UserBuilder {
    user: User,
}

impl UserBuilder {
    fn new(key: impl Into<String>) -> Self {
        UserBuilder {
            user: User {
                key: key.into(),
                secondary: None,
                ip: None,
                email: None,
                name: None,
                first_name: None,
                last_name: None,
                avatar: None,
                country: None,
                anonymous: None,
                custom: HashMap::new(),
                private_attribute_names: HashSet::new(),
            },
        }
    }

    /// Set the secondary key used to further distribute bucketing.
    pub fn secondary(mut self, secondary: impl Into<String>) -> Self {
        self.user.secondary = Some(secondary.into());
        self
    }

    /// Set the user's IP address.
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.user.ip = Some(ip.into());
        self
    }

    /// Set the user's email address.
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.user.email = Some(email.into());
        self
    }

    /// Set the user's full name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.user.name = Some(name.into());
        self
    }

    /// Set the user's first name.
    pub fn first_name(mut self, first_name: impl Into<String>) -> Self {
        self.user.first_name = Some(first_name.into());
        self
    }

    /// Set the user's last name.
    pub fn last_name(mut self, last_name: impl Into<String>) -> Self {
        self.user.last_name = Some(last_name.into());
        self
    }

    /// Set the user's avatar URL.
    pub fn avatar(mut self, avatar: impl Into<String>) -> Self {
        self.user.avatar = Some(avatar.into());
        self
    }

    /// Set the user's two-letter country code.
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.user.country = Some(country.into());
        self
    }

    /// Mark the user as anonymous.
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.user.anonymous = Some(anonymous);
        self
    }

    /// Add a custom attribute.
    pub fn custom(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user.custom.insert(name.into(), value.into());
        self
    }

    /// Mark an attribute as private for this user; it will be redacted from
    /// analytics events.
    pub fn private_attribute(mut self, name: impl Into<String>) -> Self {
        self.user.private_attribute_names.insert(name.into());
        self
    }

    /// Finish building the user.
    pub fn build(self) -> User {
        self.user
    }
}

#[cfg(test)]
mod tests {
    use super::User;
    use crate::Value;

    #[test]
    fn known_attributes_resolve_to_their_slot() {
        let user = User::with_key("u")
            .email("u@example.com")
            .first_name("Uli")
            .custom("email", "shadowed@example.com")
            .build();

        assert_eq!(user.attribute("key"), Some(Value::Str("u".into())));
        // The built-in slot wins over a same-named custom attribute.
        assert_eq!(
            user.attribute("email"),
            Some(Value::Str("u@example.com".into()))
        );
        assert_eq!(user.attribute("firstName"), Some(Value::Str("Uli".into())));
        assert_eq!(user.attribute("lastName"), None);
    }

    #[test]
    fn custom_attributes_resolve_by_name() {
        let user = User::with_key("u")
            .custom("groups", Value::Array(vec!["beta".into(), "qa".into()]))
            .build();

        let groups = user.attribute("groups").unwrap();
        assert_eq!(groups.as_array().unwrap().len(), 2);
        assert_eq!(user.attribute("missing"), None);
    }

    #[test]
    fn deserializes_from_wire_names() {
        let user: User = serde_json::from_str(
            r#"{"key":"u","firstName":"A","custom":{"n":1},"privateAttributeNames":["firstName"]}"#,
        )
        .unwrap();
        assert_eq!(user.attribute("firstName"), Some(Value::Str("A".into())));
        assert!(user.private_attribute_names().contains("firstName"));
    }
}
