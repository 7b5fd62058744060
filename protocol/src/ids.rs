use std::fmt::Display;
use std::str::FromStr;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

const TASK_ID_PREFIX: &str = "tx-";
const TASK_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TASK_ID_SUFFIX_LEN: usize = 8;

/// Opaque task identifier of the form `tx-<6-8 lowercase alphanumerics>`.
///
/// Ids are stable for the lifetime of a task and survive export/import.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a fresh random id with the full 8-character suffix.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..TASK_ID_SUFFIX_LEN)
            .map(|_| {
                let idx = rng.random_range(0..TASK_ID_ALPHABET.len());
                TASK_ID_ALPHABET[idx] as char
            })
            .collect();
        Self(format!("{TASK_ID_PREFIX}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some(suffix) = value.strip_prefix(TASK_ID_PREFIX) else {
            return Err(format!("task id must start with `{TASK_ID_PREFIX}`: {value}"));
        };
        if !(6..=8).contains(&suffix.len()) {
            return Err(format!("task id suffix must be 6-8 characters: {value}"));
        }
        if !suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(format!(
                "task id suffix must be lowercase alphanumeric: {value}"
            ));
        }
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for TaskId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TaskId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Worker identifier assigned at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run (execution instance) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
