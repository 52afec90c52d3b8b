//! Upload safety checks applied before an attachment is saved.
//!
//! Multi-layer protection:
//! 1. Size limit
//! 2. Extension blocklist
//! 3. Magic byte detection for executables

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Magic byte signatures for executable files
pub const MAGIC_SIGNATURES: &[(&str, &[u8])] = &[
    ("Windows PE/MZ", &[0x4D, 0x5A]),
    ("ELF", &[0x7F, 0x45, 0x4C, 0x46]),
    ("Mach-O 32", &[0xFE, 0xED, 0xFA, 0xCE]),
    ("Mach-O 64", &[0xFE, 0xED, 0xFA, 0xCF]),
    ("Mach-O Fat / Java Class", &[0xCA, 0xFE, 0xBA, 0xBE]),
    ("WebAssembly", &[0x00, 0x61, 0x73, 0x6D]),
];

/// Blocked file extensions (case-insensitive)
static BLOCKED_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "exe", "dll", "scr", "pif", "com", "msi", "msp", "mst", "so", "dylib", "out", "jar",
        "war", "ear", "class", "deb", "rpm", "apk", "app", "dmg", "pkg", "reg", "inf", "scf",
        "lnk", "url", "hta",
    ]
    .into_iter()
    .collect()
});

/// Outcome of an upload safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadCheck {
    Allowed,
    Blocked(String),
}

impl UploadCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, UploadCheck::Allowed)
    }
}

/// Check an upload against the size limit, extension blocklist, and
/// executable signatures.
pub fn validate_upload(filename: &str, data: &[u8], max_size_bytes: u64) -> UploadCheck {
    if data.is_empty() {
        return UploadCheck::Blocked("File is empty".to_string());
    }

    if data.len() as u64 > max_size_bytes {
        return UploadCheck::Blocked(format!(
            "File exceeds maximum size of {} bytes",
            max_size_bytes
        ));
    }

    if let Some(ext) = extension_of(filename) {
        if BLOCKED_EXTENSIONS.contains(ext.as_str()) {
            return UploadCheck::Blocked(format!("File extension .{} is not allowed", ext));
        }
    }

    for (name, magic) in MAGIC_SIGNATURES {
        if data.starts_with(magic) {
            return UploadCheck::Blocked(format!("Executable file detected: {}", name));
        }
    }

    UploadCheck::Allowed
}

/// Lowercased extension of a sanitized filename, if it has a usable one.
pub fn extension_of(filename: &str) -> Option<String> {
    let name = sanitize_filename(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 10 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Extension to store a blob under: the client's extension when usable,
/// otherwise one sniffed from the content's magic bytes.
pub fn storage_extension(filename: &str, data: &[u8]) -> Option<String> {
    extension_of(filename).or_else(|| infer::get(data).map(|kind| kind.extension().to_string()))
}

/// Sanitize filename for safe storage
pub fn sanitize_filename(filename: &str) -> String {
    // Remove path components
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let sanitized = sanitized.trim();
    if sanitized.is_empty() {
        return "unnamed_file".to_string();
    }

    sanitized.chars().take(255).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_allows_png() {
        assert!(validate_upload("photo.png", &PNG, 1024).is_allowed());
    }

    #[test]
    fn test_blocks_oversized() {
        let check = validate_upload("photo.png", &[0u8; 2048], 1024);
        assert!(matches!(check, UploadCheck::Blocked(msg) if msg.contains("maximum size")));
    }

    #[test]
    fn test_blocks_empty() {
        assert!(!validate_upload("photo.png", &[], 1024).is_allowed());
    }

    #[test]
    fn test_blocks_extension_case_insensitive() {
        assert!(!validate_upload("setup.EXE", b"plain text", 1024).is_allowed());
    }

    #[test]
    fn test_blocks_elf_magic_with_innocent_name() {
        let elf = [0x7F, 0x45, 0x4C, 0x46, 0x02, 0x01];
        assert!(!validate_upload("picture.png", &elf, 1024).is_allowed());
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("a.PNG"), Some("png".to_string()));
        assert_eq!(extension_of("../../dir/b.jpeg"), Some("jpeg".to_string()));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of(".hidden"), None);
        assert_eq!(extension_of("weird.p$g"), None);
    }

    #[test]
    fn test_storage_extension_sniffs_when_missing() {
        assert_eq!(storage_extension("blob", &PNG), Some("png".to_string()));
        assert_eq!(storage_extension("x.gif", &PNG), Some("gif".to_string()));
        assert_eq!(storage_extension("blob", b"plain"), None);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\a<b>.png"), "a_b_.png");
        assert_eq!(sanitize_filename("   "), "unnamed_file");
    }
}
