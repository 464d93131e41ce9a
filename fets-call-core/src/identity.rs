//! Participant identity abstraction
//!
//! Every signaling envelope names its sender and recipient. The orchestrator is
//! generic over the identity scheme so the portal can plug in its own user ids;
//! `StaffId` is the string-backed identity used by the staff portal itself.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Trait for participant identity in the call system
///
/// Implementations must provide a way to uniquely identify participants on the
/// shared signaling channel. The identity must be serializable and displayable.
pub trait PeerIdentity:
    Clone + Debug + Display + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Convert the identity to a string representation
    fn to_string_repr(&self) -> String;

    /// Try to create an identity from a string representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Key used for the peer registry and recipient filtering
    fn unique_id(&self) -> String {
        self.to_string_repr()
    }

    /// Whether two identities name the same participant
    fn same_as(&self, other: &Self) -> bool {
        self.unique_id() == other.unique_id()
    }
}

/// Identity of a staff member of the examination-center network
///
/// Serializes as a bare string, which is how the portal addresses users on
/// the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaffId(pub String);

impl StaffId {
    /// Create a new staff identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StaffId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for StaffId {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("staff id cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for StaffId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StaffId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
