//! Quarantine manager.
//!
//! Detected files are moved into a size-bounded repository directory under a
//! byte-wise XOR with a fixed repeating key. The transform is deliberately
//! reversible and is not a security boundary; it exists so stored samples
//! are neither re-detected by scanners nor launchable by a double-click.
//! Every stored file has a catalog row, the repository size is capped with
//! oldest-first eviction, and restore reverses the transform and whitelists
//! the restored content.

use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use sentra_core::{digest, Catalog};

/// The repeating obfuscation key compiled into the binary. Not a secret.
pub const XOR_KEY: [u8; 8] = [0xAA, 0x55, 0xC3, 0x7E, 0x9A, 0x1F, 0xB6, 0x4D];

const DEFAULT_FOLDER_LIMIT: u64 = 500 * 1024 * 1024;
const DEFAULT_SAFE_FREE: u64 = 100 * 1024 * 1024;

const KEY_FOLDER_PATH: &str = "quarantine_folder_path";
const KEY_FOLDER_LIMIT: &str = "quarantine_folder_limit_bytes";
const KEY_SAFE_FREE: &str = "quarantine_safe_free_bytes";
const KEY_TOTAL_SIZE: &str = "quarantine_total_size";

/// Repository settings, resolved from `db_info` with these defaults.
#[derive(Debug, Clone)]
pub struct QuarantineConfig {
    pub folder_path: PathBuf,
    pub folder_limit_bytes: u64,
    pub safe_free_bytes: u64,
}

impl QuarantineConfig {
    pub fn new(folder_path: impl Into<PathBuf>) -> Self {
        Self {
            folder_path: folder_path.into(),
            folder_limit_bytes: DEFAULT_FOLDER_LIMIT,
            safe_free_bytes: DEFAULT_SAFE_FREE,
        }
    }
}

/// Tagged outcome of a quarantine-manager operation.
///
/// The `Display` rendering is a stable text protocol: callers parse the
/// leading `QUARANTINED:` / `PRUNED_AND_QUARANTINED:` / `EMERGENCY_DELETED:`
/// / `RESTORED:` / `WHITELISTED:` / `ERROR:` literals.
#[derive(Debug, Clone, PartialEq)]
pub enum QuarantineOutcome {
    Quarantined {
        stored_as: PathBuf,
    },
    PrunedAndQuarantined {
        freed: u64,
        stored_as: PathBuf,
        /// Per-record diagnostics for eviction steps that partially failed.
        detail: String,
    },
    EmergencyDeleted {
        free_bytes: u64,
        threshold: u64,
        path: PathBuf,
    },
    Restored {
        path: PathBuf,
        sha256: String,
        /// Set when the stored file could not be removed after restore.
        warning: Option<String>,
    },
    Whitelisted {
        sha256: String,
    },
    Error {
        message: String,
    },
}

impl QuarantineOutcome {
    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl fmt::Display for QuarantineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quarantined { stored_as } => {
                write!(f, "QUARANTINED: stored_as={}", stored_as.display())
            }
            Self::PrunedAndQuarantined {
                freed,
                stored_as,
                detail,
            } => {
                write!(
                    f,
                    "PRUNED_AND_QUARANTINED: freed={} bytes; stored_as={}",
                    freed,
                    stored_as.display()
                )?;
                if !detail.is_empty() {
                    write!(f, "; {detail}")?;
                }
                Ok(())
            }
            Self::EmergencyDeleted {
                free_bytes,
                threshold,
                path,
            } => write!(
                f,
                "EMERGENCY_DELETED: free_bytes={}, threshold={}, path={}",
                free_bytes,
                threshold,
                path.display()
            ),
            Self::Restored {
                path,
                sha256,
                warning,
            } => {
                write!(f, "RESTORED: {} sha256={}", path.display(), sha256)?;
                if let Some(w) = warning {
                    write!(f, " WARNING: {w}")?;
                }
                Ok(())
            }
            Self::Whitelisted { sha256 } => write!(f, "WHITELISTED: sha256={sha256}"),
            Self::Error { message } => write!(f, "ERROR: {message}"),
        }
    }
}

/// Moves files into the bounded repository and back out of it.
///
/// Holds its own catalog handle; scanner reads and quarantine writes never
/// share a statement. One internal lock serializes manager operations.
pub struct QuarantineManager {
    catalog: Arc<Catalog>,
    config: QuarantineConfig,
    lock: parking_lot::Mutex<()>,
}

impl QuarantineManager {
    pub fn new(catalog: Arc<Catalog>, config: QuarantineConfig) -> Self {
        Self {
            catalog,
            config,
            lock: parking_lot::Mutex::new(()),
        }
    }

    /// Current settings: `db_info` overrides the construction-time defaults.
    fn resolve_config(&self) -> QuarantineConfig {
        let folder_path = match self.catalog.info_value(KEY_FOLDER_PATH) {
            Ok(Some(p)) if !p.is_empty() => PathBuf::from(p),
            _ => self.config.folder_path.clone(),
        };
        QuarantineConfig {
            folder_path,
            folder_limit_bytes: self
                .catalog
                .info_u64(KEY_FOLDER_LIMIT, self.config.folder_limit_bytes),
            safe_free_bytes: self
                .catalog
                .info_u64(KEY_SAFE_FREE, self.config.safe_free_bytes),
        }
    }

    // ── quarantine ──────────────────────────────────────────────────────

    /// Move `path` into the repository under obfuscation and record it.
    pub fn quarantine(&self, path: &Path) -> QuarantineOutcome {
        let _guard = self.lock.lock();
        let config = self.resolve_config();

        if let Err(e) = ensure_repository(&config.folder_path) {
            return QuarantineOutcome::error(format!(
                "Failed to ensure quarantine folder exists: {e}"
            ));
        }

        let original_size = match fs::metadata(path) {
            Ok(m) if m.is_file() => m.len(),
            _ => return QuarantineOutcome::error(format!("File not found: {}", path.display())),
        };

        // Out of disk entirely: drop the sample rather than fill the volume.
        let free_bytes = free_space_bytes(&config.folder_path);
        if free_bytes < config.safe_free_bytes {
            return match fs::remove_file(path) {
                Ok(()) => {
                    warn!(
                        path = %path.display(),
                        free_bytes,
                        threshold = config.safe_free_bytes,
                        "emergency delete: volume below safe free space"
                    );
                    QuarantineOutcome::EmergencyDeleted {
                        free_bytes,
                        threshold: config.safe_free_bytes,
                        path: path.to_path_buf(),
                    }
                }
                Err(e) => {
                    QuarantineOutcome::error(format!("failed to delete file in emergency: {e}"))
                }
            };
        }

        let current_total = self.current_total(&config.folder_path);

        let mut pruned: Option<(u64, String)> = None;
        if current_total + original_size > config.folder_limit_bytes {
            let needed = (current_total + original_size) - config.folder_limit_bytes;
            match self.prune_if_needed(needed) {
                Ok((freed, detail)) => pruned = Some((freed, detail)),
                Err(message) => {
                    return QuarantineOutcome::error(format!(
                        "Unable to make room in quarantine: {message}"
                    ))
                }
            }
        }

        let stored_name = make_stored_filename(path);
        let dest = config.folder_path.join(&stored_name);

        let bytes_written = match xor_transform_file(path, &dest) {
            Ok(n) => n,
            Err(e) => {
                return QuarantineOutcome::error(format!(
                    "Failed to move file to quarantine: {e}"
                ))
            }
        };

        let stored_hash = digest::compute(&dest, digest::DigestAlgorithm::Sha256)
            .unwrap_or_default();

        if let Err(e) = self.catalog.record_quarantine(
            &path.display().to_string(),
            &stored_name,
            &config.folder_path.display().to_string(),
            bytes_written,
            &stored_hash,
        ) {
            // Remove the orphan so disk and catalog stay consistent.
            let _ = fs::remove_file(&dest);
            return QuarantineOutcome::error(format!("Failed to record quarantine in DB: {e}"));
        }

        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "could not remove original after quarantine");
        }

        info!(
            original = %path.display(),
            stored = %dest.display(),
            size = bytes_written,
            "file quarantined"
        );

        match pruned {
            Some((freed, detail)) => QuarantineOutcome::PrunedAndQuarantined {
                freed,
                stored_as: dest,
                detail,
            },
            None => QuarantineOutcome::Quarantined { stored_as: dest },
        }
    }

    /// Bytes currently in the repository: the `db_info` counter when present
    /// and parsable, otherwise a directory scan.
    fn current_total(&self, folder: &Path) -> u64 {
        if let Ok(Some(value)) = self.catalog.info_value(KEY_TOTAL_SIZE) {
            if let Ok(total) = value.trim().parse::<u64>() {
                return total;
            }
        }
        directory_size(folder)
    }

    /// Evict oldest records until at least `needed` bytes are reclaimable.
    /// Returns `(planned_freed, detail)`; individual removal failures are
    /// reported in `detail` without aborting the sweep.
    fn prune_if_needed(&self, needed: u64) -> std::result::Result<(u64, String), String> {
        if needed == 0 {
            return Ok((0, String::new()));
        }

        let candidates = self
            .catalog
            .active_records_oldest_first()
            .map_err(|e| e.to_string())?;

        let mut selected = Vec::new();
        let mut reclaimable = 0u64;
        for record in candidates {
            reclaimable += record.stored_size;
            selected.push(record);
            if reclaimable >= needed {
                break;
            }
        }
        if reclaimable < needed {
            return Err("Not enough reclaimable space in quarantine to satisfy request".into());
        }

        let mut detail = String::new();
        for record in &selected {
            let stored = Path::new(&record.stored_path).join(&record.stored_filename);
            if stored.exists() {
                if let Err(e) = fs::remove_file(&stored) {
                    detail.push_str(&format!(
                        "Failed to remove stored file for record id {}: {e}; ",
                        record.id
                    ));
                }
            }
            if let Err(e) = self
                .catalog
                .delete_quarantine_record(record.id, record.stored_size)
            {
                detail.push_str(&format!("Failed to remove record id {}: {e}; ", record.id));
            } else {
                info!(
                    id = record.id,
                    stored = %stored.display(),
                    size = record.stored_size,
                    "quarantine record evicted"
                );
            }
        }

        Ok((reclaimable, detail.trim_end_matches("; ").to_string()))
    }

    // ── whitelist ───────────────────────────────────────────────────────

    /// SHA-256 the file and add it to the whitelist (idempotent).
    pub fn whitelist(&self, path: &Path) -> QuarantineOutcome {
        let _guard = self.lock.lock();

        if !path.is_file() {
            return QuarantineOutcome::error(format!("File not found: {}", path.display()));
        }
        let hash = match digest::compute(path, digest::DigestAlgorithm::Sha256) {
            Ok(h) => h,
            Err(e) => return QuarantineOutcome::error(format!("Hash computation failed: {e}")),
        };
        if let Err(e) = self.catalog.insert_whitelist(
            &hash,
            digest::DigestAlgorithm::Sha256,
            &path.display().to_string(),
        ) {
            return QuarantineOutcome::error(format!("Failed to insert whitelist: {e}"));
        }
        QuarantineOutcome::Whitelisted { sha256: hash }
    }

    // ── restore ─────────────────────────────────────────────────────────

    /// Reverse the obfuscation back to the original path, whitelist the
    /// restored content, and mark the record restored.
    pub fn restore(&self, stored_name_or_path: &str) -> QuarantineOutcome {
        let _guard = self.lock.lock();

        let record = match self.catalog.find_quarantine_record(stored_name_or_path) {
            Ok(Some(r)) => r,
            Ok(None) => {
                return QuarantineOutcome::error(format!(
                    "Quarantined file not found: {stored_name_or_path}"
                ))
            }
            Err(e) => return QuarantineOutcome::error(format!("DB lookup failed: {e}")),
        };

        let src = Path::new(&record.stored_path).join(&record.stored_filename);
        if !src.exists() {
            return QuarantineOutcome::error(format!(
                "Quarantined file missing on disk: {}",
                src.display()
            ));
        }

        let dest = PathBuf::from(&record.original_path);
        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return QuarantineOutcome::error(format!(
                    "Failed to create destination directories: {e}"
                ));
            }
        }

        // The transform is symmetric; running it again decodes.
        if let Err(e) = xor_transform_file(&src, &dest) {
            return QuarantineOutcome::error(format!("Failed to decode and restore file: {e}"));
        }

        let sha256 = match digest::compute(&dest, digest::DigestAlgorithm::Sha256) {
            Ok(hash) => {
                if let Err(e) = self.catalog.insert_whitelist(
                    &hash,
                    digest::DigestAlgorithm::Sha256,
                    &dest.display().to_string(),
                ) {
                    warn!(error = %e, "could not whitelist restored file");
                }
                hash
            }
            Err(e) => {
                warn!(error = %e, "could not hash restored file");
                String::new()
            }
        };

        if let Err(e) = self.catalog.mark_restored(
            record.id,
            &dest.display().to_string(),
            record.stored_size,
        ) {
            warn!(id = record.id, error = %e, "could not mark record restored");
        }

        let warning = match fs::remove_file(&src) {
            Ok(()) => None,
            Err(e) => Some(format!("Failed to remove quarantined file: {e}")),
        };

        info!(restored = %dest.display(), "quarantined file restored");
        QuarantineOutcome::Restored {
            path: dest,
            sha256,
            warning,
        }
    }
}

// ── helpers ─────────────────────────────────────────────────────────────

fn ensure_repository(folder: &Path) -> std::io::Result<()> {
    fs::create_dir_all(folder)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(folder, fs::Permissions::from_mode(0o700));
    }
    Ok(())
}

/// `<ms_epoch>_<hex_random>_<original_basename>` with path separators and
/// colons replaced so the name is a single flat filename everywhere.
fn make_stored_filename(original: &Path) -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let nonce: u64 = rand::random();
    let basename = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{ms}_{nonce:x}_{basename}")
        .replace([':', '\\', '/'], "_")
}

/// Stream `src` through the repeating-key XOR into `dst`. The key offset is
/// continuous across read blocks, so the transform is an involution over the
/// whole stream. Returns the number of bytes written.
fn xor_transform_file(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let mut input = File::open(src)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut output = File::create(dst)?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut key_pos = 0usize;
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for byte in &mut buf[..n] {
            *byte ^= XOR_KEY[key_pos];
            key_pos = (key_pos + 1) % XOR_KEY.len();
        }
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
    output.flush()?;
    Ok(total)
}

fn directory_size(folder: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(folder) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// Available bytes on the volume holding `folder`, walking up to the nearest
/// existing ancestor. On probe failure the check is skipped (reported as
/// unlimited) rather than triggering a spurious emergency delete.
fn free_space_bytes(folder: &Path) -> u64 {
    let mut probe = folder;
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent,
            None => break,
        }
    }

    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        let Ok(c_path) = std::ffi::CString::new(probe.to_string_lossy().as_bytes()) else {
            return u64::MAX;
        };
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc == 0 {
            let stat = unsafe { stat.assume_init() };
            return stat.f_bavail as u64 * stat.f_frsize as u64;
        }
        warn!(path = %probe.display(), "statvfs failed; skipping free-space check");
        u64::MAX
    }
    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::GetDiskFreeSpaceExW;

        let wide: Vec<u16> = probe.as_os_str().encode_wide().chain(Some(0)).collect();
        let mut available: u64 = 0;
        let ok = unsafe {
            GetDiskFreeSpaceExW(
                wide.as_ptr(),
                &mut available,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ok != 0 {
            return available;
        }
        warn!(path = %probe.display(), "GetDiskFreeSpaceExW failed; skipping free-space check");
        u64::MAX
    }
    #[cfg(not(any(unix, windows)))]
    {
        u64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_involutive_over_block_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let enc = dir.path().join("enc.bin");
        let dec = dir.path().join("dec.bin");

        // Deliberately not a multiple of the key or buffer length.
        let data: Vec<u8> = (0..200_003).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &data).unwrap();

        let written = xor_transform_file(&src, &enc).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_ne!(fs::read(&enc).unwrap(), data);

        xor_transform_file(&enc, &dec).unwrap();
        assert_eq!(fs::read(&dec).unwrap(), data);
    }

    #[test]
    fn stored_filenames_are_flat_and_unique() {
        let a = make_stored_filename(Path::new("/src/dir/report:final.pdf"));
        let b = make_stored_filename(Path::new("/src/dir/report:final.pdf"));

        assert!(!a.contains('/') && !a.contains('\\') && !a.contains(':'));
        assert!(a.ends_with("_report_final.pdf"));
        assert_ne!(a, b);
    }

    #[test]
    fn outcome_rendering_is_stable() {
        let q = QuarantineOutcome::Quarantined {
            stored_as: PathBuf::from("/q/123_ab_f.bin"),
        };
        assert_eq!(q.to_string(), "QUARANTINED: stored_as=/q/123_ab_f.bin");

        let p = QuarantineOutcome::PrunedAndQuarantined {
            freed: 614400,
            stored_as: PathBuf::from("/q/s"),
            detail: String::new(),
        };
        assert_eq!(
            p.to_string(),
            "PRUNED_AND_QUARANTINED: freed=614400 bytes; stored_as=/q/s"
        );

        let e = QuarantineOutcome::EmergencyDeleted {
            free_bytes: 5,
            threshold: 100,
            path: PathBuf::from("/x"),
        };
        assert_eq!(
            e.to_string(),
            "EMERGENCY_DELETED: free_bytes=5, threshold=100, path=/x"
        );

        let r = QuarantineOutcome::Restored {
            path: PathBuf::from("/src/a.bin"),
            sha256: "ff".into(),
            warning: None,
        };
        assert_eq!(r.to_string(), "RESTORED: /src/a.bin sha256=ff");

        let w = QuarantineOutcome::Whitelisted { sha256: "aa".into() };
        assert_eq!(w.to_string(), "WHITELISTED: sha256=aa");

        let err = QuarantineOutcome::error("boom");
        assert_eq!(err.to_string(), "ERROR: boom");
    }
}
