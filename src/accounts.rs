//! Run-as identity lookups

use crate::error::WorkerError;
use nix::unistd::{getuid, User};
use std::path::PathBuf;

/// A local account a worker can run as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl Account {
    /// An empty home field means the account has no home directory
    pub fn has_home(&self) -> bool {
        !self.home.as_os_str().is_empty()
    }
}

impl From<User> for Account {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        }
    }
}

/// Look up an account by name
pub fn lookup(name: &str) -> Result<Option<Account>, WorkerError> {
    User::from_name(name)
        .map(|user| user.map(Account::from))
        .map_err(|e| WorkerError::from(std::io::Error::from(e)))
}

/// Name of the account this process runs as
pub fn process_user() -> Option<String> {
    User::from_uid(getuid()).ok().flatten().map(|u| u.name)
}

pub fn is_superuser() -> bool {
    getuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_root() {
        let root = lookup("root").unwrap().expect("root account exists");
        assert_eq!(root.uid, 0);
        assert!(root.has_home());
    }

    #[test]
    fn test_lookup_missing_user() {
        assert!(lookup("workergate-no-such-user").unwrap().is_none());
    }

    #[test]
    fn test_process_user_resolves() {
        let name = process_user().expect("current uid has an account");
        let account = lookup(&name).unwrap().unwrap();
        assert_eq!(account.uid, getuid().as_raw());
        assert_eq!(is_superuser(), account.uid == 0);
    }
}
