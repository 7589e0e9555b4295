//! Caller credentials.

use serde::{Deserialize, Serialize};

/// The identity a request runs as.
///
/// Resolution of user and group names to ids is the transport layer's
/// concern; the core only ever sees numeric ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cred {
    /// User id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Supplementary group ids.
    pub groups: Vec<u32>,
}

impl Cred {
    /// Credential for a plain uid/gid pair.
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    /// The superuser credential.
    #[must_use]
    pub fn root() -> Self {
        Self::new(0, 0)
    }

    /// Whether this credential is the superuser.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Whether `gid` is the primary or a supplementary group.
    #[must_use]
    pub fn is_member_of(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership() {
        let mut cred = Cred::new(1000, 1000);
        cred.groups.push(44);
        assert!(cred.is_member_of(1000));
        assert!(cred.is_member_of(44));
        assert!(!cred.is_member_of(0));
        assert!(!cred.is_root());
        assert!(Cred::root().is_root());
    }
}
