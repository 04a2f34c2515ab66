//! Built-in term lists shipped with the engine

use serde::Deserialize;
use std::sync::LazyLock;
use tracing::error;

/// One entry of a built-in list
#[derive(Debug, Clone, Deserialize)]
pub struct PrebuiltTerm {
    pub term: String,
    /// Only match the term as a whole word
    #[serde(default)]
    pub word: bool,
}

/// A named built-in list
#[derive(Debug, Clone, Deserialize)]
pub struct PrebuiltList {
    pub id: String,
    pub name: String,
    pub terms: Vec<PrebuiltTerm>,
}

static LISTS: LazyLock<Vec<PrebuiltList>> = LazyLock::new(|| {
    serde_yaml::from_str(include_str!("prebuilt.yaml")).unwrap_or_else(|e| {
        error!(error = %e, "Failed to parse built-in filter lists");
        Vec::new()
    })
});

/// All built-in lists
#[must_use]
pub fn lists() -> &'static [PrebuiltList] {
    &LISTS
}

/// Look up a built-in list by id
#[must_use]
pub fn get(id: &str) -> Option<&'static PrebuiltList> {
    LISTS.iter().find(|list| list.id == id)
}

/// Whether `id` names a built-in list
#[must_use]
pub fn is_known(id: &str) -> bool {
    get(id).is_some()
}

/// Human readable name of a list, falling back to the id
#[must_use]
pub fn display_name(id: &str) -> String {
    get(id).map_or_else(|| id.to_string(), |list| list.name.clone())
}
