//! Backup name validation and client file name normalization
//!
//! Clients send Windows-style paths, DOS 8.3 short names and names that
//! lost their encoding on the way. Everything stored on the server is a
//! relative, forward-slash path without `.`/`..` segments.

use chrono::{DateTime, Utc};

use super::types::{
    NewSession, StartUploadRequest, UploadError, MAX_BACKUP_NAME_LEN, MAX_FILE_PATH_LEN,
};

/// Longest extension carried over to a placeholder name
const MAX_PLACEHOLDER_EXT_LEN: usize = 8;

/// Validate a backup set name; returns the trimmed name
pub fn validate_backup_name(raw: &str) -> Result<String, UploadError> {
    let name = raw.trim();

    if name.is_empty() {
        return Err(UploadError::Validation("backupName must not be empty".into()));
    }
    if name.len() > MAX_BACKUP_NAME_LEN {
        return Err(UploadError::Validation(format!(
            "backupName exceeds {} bytes",
            MAX_BACKUP_NAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(UploadError::Validation(format!(
            "backupName {:?} is reserved",
            name
        )));
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(UploadError::Validation(
            "backupName must not contain path separators or control characters".into(),
        ));
    }

    Ok(name.to_string())
}

/// Normalize a client file name into a safe relative storage path.
///
/// Backslashes become `/`, a drive prefix is dropped and `.`/`..`/empty
/// segments are removed. A final segment that is unreadable (control
/// characters, replacement characters, DOS short form, no alphanumerics)
/// is replaced with `file_<YYYYmmdd_HHMMSS><ext>`.
pub fn normalize_file_name(raw: &str, now: DateTime<Utc>) -> String {
    let unified = raw.replace('\\', "/");
    let relative = strip_drive_prefix(&unified);

    let mut segments: Vec<&str> = relative
        .split('/')
        .filter(|s| !s.trim().is_empty() && *s != "." && *s != "..")
        .collect();

    let file_name = match segments.pop() {
        Some(name) if !is_unreadable(name) => name.to_string(),
        Some(name) => placeholder_name(extension_of(name), now),
        None => placeholder_name(None, now),
    };

    let mut parts: Vec<String> = segments
        .into_iter()
        .map(|s| s.chars().filter(|c| !c.is_control()).collect::<String>())
        .filter(|s| !s.trim().is_empty())
        .collect();
    parts.push(file_name);
    parts.join("/")
}

fn strip_drive_prefix(path: &str) -> &str {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        &path[2..]
    } else {
        path
    }
}

fn is_unreadable(name: &str) -> bool {
    name.chars().any(|c| c.is_control() || c == char::REPLACEMENT_CHARACTER)
        || !name.chars().any(char::is_alphanumeric)
        || is_dos_short_name(name)
}

/// `PROGRA~1`, `DOCUME~2.BAK`: at most 8.3, upper case, `~` followed by digits
fn is_dos_short_name(name: &str) -> bool {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext),
        None => (name, ""),
    };

    let Some((_, ordinal)) = stem.rsplit_once('~') else {
        return false;
    };

    stem.len() <= 8
        && ext.len() <= 3
        && !ordinal.is_empty()
        && ordinal.bytes().all(|b| b.is_ascii_digit())
        && !name.chars().any(char::is_lowercase)
}

fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let valid = !ext.is_empty()
        && ext.len() <= MAX_PLACEHOLDER_EXT_LEN
        && ext.bytes().all(|b| b.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

fn placeholder_name(ext: Option<String>, now: DateTime<Utc>) -> String {
    match ext {
        Some(ext) => format!("file_{}.{}", now.format("%Y%m%d_%H%M%S"), ext),
        None => format!("file_{}", now.format("%Y%m%d_%H%M%S")),
    }
}

/// Validate a start request and normalize its names
pub fn validate_start_request(
    client_id: &str,
    request: StartUploadRequest,
    max_total_chunks: u32,
    now: DateTime<Utc>,
) -> Result<NewSession, UploadError> {
    let backup_name = request
        .backup_name
        .as_deref()
        .ok_or_else(|| UploadError::Validation("backupName is required".into()))
        .and_then(validate_backup_name)?;

    let file_name = request
        .file_name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| UploadError::Validation("fileName is required".into()))?;

    let file_size = match request.file_size {
        Some(size) if size > 0 => size as u64,
        Some(size) => {
            return Err(UploadError::Validation(format!(
                "fileSize must be positive, got {}",
                size
            )))
        }
        None => return Err(UploadError::Validation("fileSize is required".into())),
    };

    let total_chunks = match request.total_chunks {
        Some(n) if n > 0 && n <= i64::from(max_total_chunks) => n as u32,
        Some(n) => {
            return Err(UploadError::Validation(format!(
                "totalChunks must be between 1 and {}, got {}",
                max_total_chunks, n
            )))
        }
        None => return Err(UploadError::Validation("totalChunks is required".into())),
    };

    if u64::from(total_chunks) > file_size {
        return Err(UploadError::Validation(format!(
            "totalChunks ({}) exceeds fileSize ({})",
            total_chunks, file_size
        )));
    }

    if let Some(version) = request.version {
        if version < 1 {
            return Err(UploadError::Validation(format!(
                "version must be at least 1, got {}",
                version
            )));
        }
    }

    let checksum = match request.checksum.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(c) if c.len() == 64 && c.bytes().all(|b| b.is_ascii_hexdigit()) => {
            Some(c.to_ascii_lowercase())
        }
        Some(_) => {
            return Err(UploadError::Validation(
                "checksum must be a 64 character hex SHA-256 digest".into(),
            ))
        }
    };

    let file_path = normalize_file_name(file_name, now);
    if file_path.len() > MAX_FILE_PATH_LEN {
        return Err(UploadError::Validation(format!(
            "fileName exceeds {} bytes after normalization",
            MAX_FILE_PATH_LEN
        )));
    }

    Ok(NewSession {
        client_id: client_id.to_string(),
        backup_name,
        file_path,
        file_size,
        total_chunks,
        metadata: request.metadata,
        version: request.version,
        checksum,
    })
}
