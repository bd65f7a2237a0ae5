//! Authorized keys management

use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;

use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

use ots_core::StartupError;

/// Immutable set of public keys allowed to open the session
///
/// Keys are stored by their SSH wire encoding, so membership is exact key
/// equality regardless of the comment or options on the source line.
#[derive(Debug, Default, Clone)]
pub struct AuthorizedKeySet {
    /// Wire-format key blobs
    blobs: HashSet<Vec<u8>>,
    /// Comments of the loaded keys, for logging
    comments: Vec<String>,
}

impl AuthorizedKeySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the set from a file, or from stdin when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, StartupError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => {
                tracing::info!("--authorized-keys not passed: reading authorized keys from stdin");
                let stdin = std::io::stdin();
                Self::from_reader(stdin.lock(), "stdin")
            }
        }
    }

    /// Load the set from an authorized_keys file
    pub fn load_from_file(path: &Path) -> Result<Self, StartupError> {
        tracing::info!("Loading authorized keys from {:?}", path);

        let file = std::fs::File::open(path).map_err(|e| {
            StartupError::AuthorizedKeys(format!("failed to open {:?}: {}", path, e))
        })?;

        Self::from_reader(BufReader::new(file), &path.display().to_string())
    }

    /// Parse authorized_keys lines from a reader
    ///
    /// Blank lines and `#` comments are skipped. Any other line that does not
    /// parse is an error, as is input without a single key.
    pub fn from_reader(reader: impl BufRead, source: &str) -> Result<Self, StartupError> {
        let mut set = Self::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                StartupError::AuthorizedKeys(format!(
                    "failed to read line {} of {}: {}",
                    line_num + 1,
                    source,
                    e
                ))
            })?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let key = parse_authorized_key_line(line).map_err(|e| {
                StartupError::AuthorizedKeys(format!(
                    "failed to parse key on line {} of {}: {}",
                    line_num + 1,
                    source,
                    e
                ))
            })?;

            set.insert(&key)?;
        }

        if set.is_empty() {
            return Err(StartupError::AuthorizedKeys(
                "no keys supplied - either pass a file using --authorized-keys, or pipe them in"
                    .to_string(),
            ));
        }

        tracing::info!("Loaded {} authorized keys from {}", set.len(), source);
        Ok(set)
    }

    /// Add a key to the set
    pub fn insert(&mut self, key: &ssh_key::PublicKey) -> Result<(), StartupError> {
        let blob = key
            .to_bytes()
            .map_err(|e| StartupError::AuthorizedKeys(format!("failed to encode key: {}", e)))?;

        tracing::debug!(
            "Loaded key: {} ({})",
            key.fingerprint(ssh_key::HashAlg::Sha256),
            if key.comment().is_empty() { "no comment" } else { key.comment() }
        );

        if self.blobs.insert(blob) {
            self.comments.push(key.comment().to_string());
        }
        Ok(())
    }

    /// Check whether a key presented by a peer is authorized
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.blobs.contains(&key.public_key_bytes())
    }

    /// Get the number of authorized keys
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Check if there are no authorized keys
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Comments attached to the loaded keys
    pub fn comments(&self) -> &[String] {
        &self.comments
    }
}

/// Parse an authorized_keys line (`[options] type base64 [comment]`)
fn parse_authorized_key_line(line: &str) -> Result<ssh_key::PublicKey, ssh_key::Error> {
    match ssh_key::PublicKey::from_openssh(line) {
        Ok(key) => Ok(key),
        Err(e) => {
            // Retry without a leading options field
            match strip_options(line) {
                Some(rest) => ssh_key::PublicKey::from_openssh(rest),
                None => Err(e),
            }
        }
    }
}

/// Skip the options field of an authorized_keys line
///
/// Options end at the first whitespace outside double quotes, so values
/// such as `command="echo hi"` stay in one field. A backslash escapes the
/// next character inside quotes.
fn strip_options(line: &str) -> Option<&str> {
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                let rest = line[i..].trim_start();
                return (!rest.is_empty()).then_some(rest);
            }
            _ => {}
        }
    }
    None
}
