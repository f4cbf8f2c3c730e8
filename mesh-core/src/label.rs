use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    ops::Deref,
    str::FromStr,
};

/// Regex to match the requirements of hostname(7), used everywhere a name in
/// this data model must double as a DNS label: network names, domain
/// suffixes, peer/group/policy/route names, and DNS mapping labels.
static LABEL_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-z0-9]-?)*[a-z0-9]$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    pub fn is_valid(name: &str) -> bool {
        name.len() < 64 && LABEL_REGEX.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Label {
    type Err = &'static str;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(name) {
            Ok(Self(name.to_string()))
        } else {
            Err("invalid DNS label (must be lowercase alphanumeric with interior dashes, max 63 chars)")
        }
    }
}

impl TryFrom<String> for Label {
    type Error = &'static str;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.0
    }
}

impl Deref for Label {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sanitizes an arbitrary peer name into a DNS-safe label for config/DNS
/// output: lowercase, map every non-`[a-z0-9-]` character to `-`, and
/// collapse an empty result to `peer` (spec §4.3).
pub fn sanitize_label(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' { c } else { '-' })
        .collect();

    if mapped.is_empty() {
        "peer".to_string()
    } else {
        mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_labels() {
        assert!(Label::is_valid("office"));
        assert!(Label::is_valid("gw-1"));
        assert!("office".parse::<Label>().is_ok());
    }

    #[test]
    fn rejects_bad_labels() {
        assert!(!Label::is_valid("Office"));
        assert!(!Label::is_valid("-office"));
        assert!(!Label::is_valid("office-"));
        assert!(!Label::is_valid(""));
        assert!("office_1".parse::<Label>().is_err());
    }

    #[test]
    fn sanitize_maps_and_collapses() {
        assert_eq!(sanitize_label("My Laptop!"), "my-laptop-");
        assert_eq!(sanitize_label("***"), "---");
        assert_eq!(sanitize_label(""), "peer");
    }
}
