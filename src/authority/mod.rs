//! Display access control
//!
//! [`AuthoritySession`] owns the secret cookie for one display and the
//! authority file granting access to it. The file is created exclusively
//! with mode 0600 and written under a single open handle, so there is no
//! window in which another user can observe a partially written or
//! world-readable file. Closing a session removes the file; every teardown
//! path must close.
//!
//! Record layout follows the xauth format: big-endian u16 length-prefixed
//! fields for family, address, display number, auth name and cookie data.

use rand::rngs::OsRng;
use rand::TryRngCore;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Result type for authority operations
pub type Result<T> = std::result::Result<T, AuthorityError>;

/// Authority file error types
#[derive(Error, Debug)]
pub enum AuthorityError {
    /// Authority file could not be created
    #[error("failed to create authority file {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Write or flush to the authority file failed
    #[error("authority file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Cookie entropy could not be gathered
    #[error("failed to generate cookie: {0}")]
    Entropy(String),

    /// Operation requires an open authority file
    #[error("authority file is not open")]
    NotOpen,

    /// Session already has a display entry
    #[error("display already added to authority file")]
    DisplayAdded,
}

/// Cookie length in bytes (MIT-MAGIC-COOKIE-1)
pub const COOKIE_SIZE: usize = 16;

const AUTH_NAME: &str = "MIT-MAGIC-COOKIE-1";

// xauth address families
const FAMILY_LOCAL: u16 = 256;
const FAMILY_WILD: u16 = 65535;

/// Access-control record for one display
///
/// Holds the cookie, the backing file, and the set of usernames granted
/// access. A display gets one display-level session at prepare time and at
/// most one user-level session once a login succeeds.
pub struct AuthoritySession {
    path: PathBuf,
    file: Option<File>,
    cookie: Vec<u8>,
    display_added: bool,
    authorized_users: Vec<String>,
}

impl AuthoritySession {
    /// Create the authority file exclusively with mode 0600
    ///
    /// Fails if the file already exists; stale files from a crashed run must
    /// be removed by the caller before re-preparing the display.
    pub fn create(auth_dir: &Path, tag: &str) -> Result<Self> {
        let path = auth_dir.join(format!("auth-{tag}"));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|source| AuthorityError::Create {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "authority file created");
        Ok(Self {
            path,
            file: Some(file),
            cookie: Vec::new(),
            display_added: false,
            authorized_users: Vec::new(),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The display's secret cookie; empty until a display entry exists
    pub fn cookie(&self) -> &[u8] {
        &self.cookie
    }

    /// Usernames granted access through this session
    pub fn authorized_users(&self) -> &[String] {
        &self.authorized_users
    }

    /// Whether the session still holds an open file handle
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Mint a fresh cookie and write entries for `display_number`
    ///
    /// Returns the cookie so the owner can hand it to the display server.
    pub fn add_display(&mut self, display_number: u32) -> Result<Vec<u8>> {
        if self.display_added {
            return Err(AuthorityError::DisplayAdded);
        }

        let mut cookie = vec![0u8; COOKIE_SIZE];
        OsRng
            .try_fill_bytes(&mut cookie)
            .map_err(|e| AuthorityError::Entropy(e.to_string()))?;

        self.add_display_with_cookie(display_number, &cookie)?;
        Ok(cookie)
    }

    /// Write entries for `display_number` using an already-issued cookie
    pub fn add_display_with_cookie(&mut self, display_number: u32, cookie: &[u8]) -> Result<()> {
        if self.display_added {
            return Err(AuthorityError::DisplayAdded);
        }
        let file = self.file.as_mut().ok_or(AuthorityError::NotOpen)?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let number = display_number.to_string();

        write_entry(file, FAMILY_LOCAL, host.as_bytes(), &number, cookie)?;
        write_entry(file, FAMILY_WILD, &[], &number, cookie)?;
        file.flush()?;

        self.cookie = cookie.to_vec();
        self.display_added = true;
        info!(path = %self.path.display(), display = display_number, "display added to authority file");
        Ok(())
    }

    /// Grant `username` access with the already-issued cookie
    ///
    /// Never mints a second cookie: user-level authority shares the secret
    /// established at prepare time.
    pub fn add_user(&mut self, username: &str, display_number: u32) -> Result<()> {
        if self.cookie.is_empty() {
            return Err(AuthorityError::NotOpen);
        }
        let cookie = self.cookie.clone();
        let file = self.file.as_mut().ok_or(AuthorityError::NotOpen)?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let number = display_number.to_string();

        write_entry(file, FAMILY_LOCAL, host.as_bytes(), &number, &cookie)?;
        file.flush()?;

        self.authorized_users.push(username.to_string());
        info!(user = username, path = %self.path.display(), "user authorized for display");
        Ok(())
    }

    /// Flush, close and remove the authority file
    ///
    /// Idempotent; called on every display teardown path.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                warn!(path = %self.path.display(), error = %e, "flush on close failed");
            }
            drop(file);
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "could not remove authority file");
            } else {
                debug!(path = %self.path.display(), "authority file removed");
            }
        }
        self.authorized_users.clear();
    }
}

impl Drop for AuthoritySession {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_entry(
    file: &mut File,
    family: u16,
    address: &[u8],
    number: &str,
    cookie: &[u8],
) -> Result<()> {
    file.write_all(&family.to_be_bytes())?;
    write_field(file, address)?;
    write_field(file, number.as_bytes())?;
    write_field(file, AUTH_NAME.as_bytes())?;
    write_field(file, cookie)?;
    Ok(())
}

fn write_field(file: &mut File, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).unwrap_or(u16::MAX);
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&data[..len as usize])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn create_sets_exclusive_0600_mode() {
        let dir = tempfile::tempdir().unwrap();
        let session = AuthoritySession::create(dir.path(), "display-1").unwrap();

        let mode = std::fs::metadata(session.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // A second create for the same tag must fail (O_EXCL)
        assert!(matches!(
            AuthoritySession::create(dir.path(), "display-1"),
            Err(AuthorityError::Create { .. })
        ));
    }

    #[test]
    fn add_display_mints_cookie_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = AuthoritySession::create(dir.path(), "d").unwrap();

        let cookie = session.add_display(0).unwrap();
        assert_eq!(cookie.len(), COOKIE_SIZE);
        assert_eq!(session.cookie(), &cookie[..]);

        assert!(matches!(
            session.add_display(0),
            Err(AuthorityError::DisplayAdded)
        ));
    }

    #[test]
    fn add_user_reuses_display_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = AuthoritySession::create(dir.path(), "d").unwrap();

        let cookie = session.add_display(0).unwrap();
        session.add_user("alice", 0).unwrap();

        assert_eq!(session.cookie(), &cookie[..], "no second cookie minted");
        assert_eq!(session.authorized_users(), &["alice".to_string()]);
    }

    #[test]
    fn add_user_before_display_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = AuthoritySession::create(dir.path(), "d").unwrap();
        assert!(session.add_user("alice", 0).is_err());
    }

    #[test]
    fn close_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = AuthoritySession::create(dir.path(), "d").unwrap();
        session.add_display(0).unwrap();

        let path = session.path().to_path_buf();
        assert!(path.exists());

        session.close();
        assert!(!path.exists());
        session.close();
    }

    #[test]
    fn entries_use_big_endian_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = AuthoritySession::create(dir.path(), "d").unwrap();
        session.add_display(2).unwrap();

        let bytes = std::fs::read(session.path()).unwrap();
        // First entry: FamilyLocal
        assert_eq!(&bytes[0..2], &FAMILY_LOCAL.to_be_bytes());
        // Walk the four length-prefixed fields
        let mut offset = 2;
        for _ in 0..4 {
            let len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize;
            offset += 2 + len;
        }
        // Second entry starts with the wildcard family
        assert_eq!(&bytes[offset..offset + 2], &FAMILY_WILD.to_be_bytes());
    }

    #[test]
    fn drop_cleans_up_file() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut session = AuthoritySession::create(dir.path(), "d").unwrap();
            session.add_display(0).unwrap();
            path = session.path().to_path_buf();
        }
        assert!(!path.exists());
    }

    /// Field list of one xauth record: (family, address, number, name, data)
    fn parse_records(bytes: &[u8]) -> Vec<(u16, Vec<u8>, String, String, Vec<u8>)> {
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let family = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            offset += 2;
            let mut fields = Vec::with_capacity(4);
            for _ in 0..4 {
                let len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize;
                offset += 2;
                fields.push(bytes[offset..offset + len].to_vec());
                offset += len;
            }
            let data = fields.pop().unwrap();
            let name = String::from_utf8(fields.pop().unwrap()).unwrap();
            let number = String::from_utf8(fields.pop().unwrap()).unwrap();
            let address = fields.pop().unwrap();
            records.push((family, address, number, name, data));
        }
        records
    }

    proptest::proptest! {
        #[test]
        fn any_display_entry_parses_back(
            display_number in 0u32..=65_535,
            cookie in proptest::collection::vec(proptest::num::u8::ANY, COOKIE_SIZE),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut session = AuthoritySession::create(dir.path(), "p").unwrap();
            session.add_display_with_cookie(display_number, &cookie).unwrap();

            let bytes = std::fs::read(session.path()).unwrap();
            let records = parse_records(&bytes);
            proptest::prop_assert_eq!(records.len(), 2);
            let expected_number = display_number.to_string();

            let (family, address, number, name, data) = &records[0];
            proptest::prop_assert_eq!(*family, FAMILY_LOCAL);
            proptest::prop_assert!(!address.is_empty());
            proptest::prop_assert_eq!(number.as_str(), expected_number.as_str());
            proptest::prop_assert_eq!(name.as_str(), AUTH_NAME);
            proptest::prop_assert_eq!(data, &cookie);

            let (family, address, number, _, data) = &records[1];
            proptest::prop_assert_eq!(*family, FAMILY_WILD);
            proptest::prop_assert!(address.is_empty());
            proptest::prop_assert_eq!(number.as_str(), expected_number.as_str());
            proptest::prop_assert_eq!(data, &cookie);
        }
    }
}
