//! API endpoint naming and discovery.
//!
//! Each server generation binds a fresh `<token>.api` socket file where the
//! token starts with the bind time, so lexical order equals generation order.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

pub const API_FILE_EXTENSION: &str = "api";

const SOCKET_DIR_NAME: &str = "sensord";

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

/// Directory holding the API socket files.
///
/// On Linux, prefers `$XDG_RUNTIME_DIR` for proper runtime file handling.
/// Falls back to the system temp directory.
#[must_use]
pub fn socket_dir() -> PathBuf {
    runtime_dir().join(SOCKET_DIR_NAME)
}

/// Microsecond UNIX time as 14 hex digits followed by 8 random hex digits.
#[must_use]
pub fn unique_timestamp_hex() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_micros());
    let random = Uuid::new_v4();
    let bytes = random.as_bytes();
    let suffix = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    format!("{micros:014x}{suffix:08x}")
}

#[must_use]
pub fn endpoint_file_name() -> String {
    format!("{}.{API_FILE_EXTENSION}", unique_timestamp_hex())
}

/// All `*.api` files in `dir`, oldest generation first.
///
/// A missing directory yields an empty list.
///
/// # Errors
///
/// Returns any I/O error other than `NotFound` raised while listing `dir`.
pub fn search_api_sockets(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut sockets = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == API_FILE_EXTENSION) {
            sockets.push(path);
        }
    }

    sockets.sort();
    Ok(sockets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_dir() {
        assert!(socket_dir().ends_with("sensord"));
    }

    #[test]
    fn test_unique_timestamp_hex_format() {
        let token = unique_timestamp_hex();
        assert_eq!(token.len(), 22);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_unique_timestamp_hex_is_ordered() {
        let first = unique_timestamp_hex();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = unique_timestamp_hex();
        assert!(first[..14] < second[..14]);
        assert!(first < second);
    }

    #[test]
    fn test_endpoint_file_name() {
        let name = endpoint_file_name();
        assert!(name.ends_with(".api"));
        assert_eq!(name.len(), 26);
    }

    #[test]
    fn test_search_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sockets = search_api_sockets(&dir.path().join("absent")).unwrap();
        assert!(sockets.is_empty());
    }

    #[test]
    fn test_search_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.api", "a.api", "c.sock", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let sockets = search_api_sockets(dir.path()).unwrap();
        let names: Vec<_> = sockets
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["a.api", "b.api"]);
    }
}
