use crate::errors::TyperError;
use std::fs;
use std::path::{Path, PathBuf};

/// Next free rotation slot for `active`: `run.jsonl` -> `run.jsonl.1`, `.2`, ...
pub fn rotated_path(active: &Path) -> PathBuf {
    let file_name = active
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let dir = active.parent().unwrap_or_else(|| Path::new("."));
    let next = rotation_indices(dir, &file_name)
        .into_iter()
        .max()
        .unwrap_or(0)
        + 1;
    dir.join(format!("{file_name}.{next}"))
}

fn rotation_indices(dir: &Path, file_name: &str) -> Vec<u64> {
    let prefix = format!("{file_name}.");
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    let name = entry.file_name().to_string_lossy().to_string();
                    name.strip_prefix(&prefix)?.parse::<u64>().ok()
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Deletes the oldest files in `dir` until the total size fits `budget_bytes`.
/// `active` is never deleted.
pub fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    active: &Path,
) -> Result<Vec<PathBuf>, TyperError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| TyperError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();

    files.sort_by(|a, b| {
        let ma = fs::metadata(a).ok().and_then(|m| m.modified().ok());
        let mb = fs::metadata(b).ok().and_then(|m| m.modified().ok());
        ma.cmp(&mb).then_with(|| rotation_rank(a).cmp(&rotation_rank(b)))
    });

    let mut total = files
        .iter()
        .filter_map(|path| fs::metadata(path).ok().map(|meta| meta.len()))
        .sum::<u64>();

    let mut deleted = Vec::new();
    for path in files {
        if total <= budget_bytes {
            break;
        }
        if path == active {
            continue;
        }
        let len = fs::metadata(&path)
            .map_err(|e| TyperError::Io(e.to_string()))?
            .len();
        fs::remove_file(&path).map_err(|e| TyperError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}

fn rotation_rank(path: &Path) -> u64 {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| ext.parse::<u64>().ok())
        .unwrap_or(u64::MAX)
}
