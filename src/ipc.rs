//! Supervisor IPC socket paths.
//!
//! The per-project supervisor socket lives in the runtime directory
//! under a name derived from the project id. Unix socket paths cap the
//! name around 100 bytes, so over-long encodings are middle-truncated.
//! The derivation is idempotent over its own output:
//! `socket_name(extract(socket_name(x))) == socket_name(x)`, so a
//! supervisor that recovers the token from an existing socket re-derives
//! the same path.

use std::path::PathBuf;

/// Budget for the socket file name (conservative slice of the 108-byte
/// `sun_path` limit, leaving room for the directory).
pub const MAX_SOCKET_NAME_BYTES: usize = 100;

const PREFIX: &str = "sidekick-";
const SUFFIX: &str = ".sock";
const ELLIPSIS: &str = "...";

/// Absolute path of the supervisor socket for a project.
pub fn socket_path(project_id: &str) -> PathBuf {
    runtime_dir().join(socket_name(project_id))
}

fn runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    }
}

/// The socket file name for a project id: `sidekick-<encoded>.sock`,
/// middle-truncated to stay within [`MAX_SOCKET_NAME_BYTES`].
pub fn socket_name(project_id: &str) -> String {
    let encoded = encode(project_id);
    let name = format!("{PREFIX}{encoded}{SUFFIX}");
    if name.len() <= MAX_SOCKET_NAME_BYTES {
        return name;
    }
    // Middle truncation keeps the head and tail of the encoded id, which
    // carry the discriminating parts of typical project paths.
    let budget = MAX_SOCKET_NAME_BYTES - PREFIX.len() - SUFFIX.len() - ELLIPSIS.len();
    let mut head = budget / 2;
    let tail = budget - head;
    // Never end the head inside a %XX escape: a dangling `%` would get
    // re-encoded on the next derivation and break idempotence. (A tail
    // starting mid-escape is harmless: bare hex digits are safe bytes.)
    let bytes = encoded.as_bytes();
    while head > 0
        && (bytes[head - 1] == b'%' || (head >= 2 && bytes[head - 2] == b'%'))
    {
        head -= 1;
    }
    // The encoding is pure ASCII, so byte indexing is char-safe.
    format!(
        "{PREFIX}{}{ELLIPSIS}{}{SUFFIX}",
        &encoded[..head],
        &encoded[encoded.len() - tail..]
    )
}

/// Recover the encoded project token from a socket name.
pub fn extract_project_token(name: &str) -> Option<&str> {
    name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)
}

/// Percent-encode everything outside `[A-Za-z0-9._-]`.
///
/// `%` already introducing a valid escape is left alone, which makes the
/// encoding idempotent: re-encoding an encoded (even truncated) token
/// is a no-op, which is what the socket-name round-trip law relies on.
fn encode(id: &str) -> String {
    let bytes = id.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(b as char);
                i += 1;
            }
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                out.push('%');
                i += 1;
            }
            _ => {
                out.push_str(&format!("%{b:02X}"));
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_encode_readably() {
        assert_eq!(socket_name("myproj"), "sidekick-myproj.sock");
        assert_eq!(
            socket_name("github.com/side/app"),
            "sidekick-github.com%2Fside%2Fapp.sock"
        );
    }

    #[test]
    fn encoding_is_idempotent() {
        let once = encode("github.com/side/app with spaces");
        assert_eq!(encode(&once), once);
    }

    #[test]
    fn long_names_are_middle_truncated_to_the_cap() {
        let id = "x".repeat(300);
        let name = socket_name(&id);
        assert_eq!(name.len(), MAX_SOCKET_NAME_BYTES);
        assert!(name.starts_with(PREFIX));
        assert!(name.ends_with(SUFFIX));
        assert!(name.contains(ELLIPSIS));
    }

    #[test]
    fn derivation_is_idempotent_over_extraction() {
        for id in [
            "short",
            "with/slashes/and spaces",
            &"deep/nested/project/path/".repeat(20),
        ] {
            let name = socket_name(id);
            let token = extract_project_token(&name).unwrap();
            assert_eq!(socket_name(token), name, "law failed for {id:?}");
        }
    }

    #[test]
    fn extraction_inverts_naming_for_short_ids() {
        let name = socket_name("abc.def");
        assert_eq!(extract_project_token(&name), Some("abc.def"));
        assert_eq!(extract_project_token("unrelated"), None);
    }
}
