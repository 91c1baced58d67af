//! File locations derived from the output path

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Extension of the converted output
pub const OUTPUT_EXTENSION: &str = "m4b";

/// Extension of the downloaded payload
pub const PAYLOAD_EXTENSION: &str = "aaxc";

/// Output base name when none was set
pub const DEFAULT_OUTPUT_NAME: &str = "audiobook";

/// Source and sibling container extensions replaced by [`OUTPUT_EXTENSION`]
const REPLACED_EXTENSIONS: [&str; 5] = ["m4a", "mp4", "aax", "aaxc", "mp3"];

/// Resolve a caller-supplied name against `output_dir` and normalize its extension.
///
/// Absolute names are used as given.
pub fn resolve_output_path(output_dir: &Path, name: &Path) -> PathBuf {
    let path = if name.is_absolute() {
        name.to_path_buf()
    } else {
        output_dir.join(name)
    };
    normalize_output_path(&path)
}

/// Force the `.m4b` extension.
///
/// `.m4b` is kept, known audio container extensions are replaced and anything
/// else (including dotted titles such as `Vol. 2`) gets `.m4b` appended.
pub fn normalize_output_path(path: &Path) -> PathBuf {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some(OUTPUT_EXTENSION) => path.with_extension(OUTPUT_EXTENSION),
        Some(e) if REPLACED_EXTENSIONS.contains(&e) => path.with_extension(OUTPUT_EXTENSION),
        _ => {
            let mut appended = OsString::from(path.as_os_str());
            appended.push(".");
            appended.push(OUTPUT_EXTENSION);
            PathBuf::from(appended)
        }
    }
}

/// State file for `output_path`: `<cache_dir>/<output stem>.json`
pub fn state_path_for(cache_dir: &Path, output_path: &Path) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_OUTPUT_NAME.to_string());
    cache_dir.join(format!("{stem}.json"))
}

/// Payload beside its state file
pub fn temp_path_for(state_path: &Path) -> PathBuf {
    state_path.with_extension(PAYLOAD_EXTENSION)
}

/// Cue sheet beside the output
pub fn cue_path_for(output_path: &Path) -> PathBuf {
    output_path.with_extension("cue")
}

/// NFO beside the output
pub fn nfo_path_for(output_path: &Path) -> PathBuf {
    output_path.with_extension("nfo")
}
