use std::path::{Component, Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// Resolve a caller-supplied path against the profile home, rejecting
/// anything that escapes it. Relative paths are joined onto the home
/// root; absolute paths must already live under it. `..` traversal is
/// caught by normalizing component by component, so the target does not
/// need to exist. This is NOT a chroot — it's best-effort path
/// validation for the bridge's file commands.
pub(super) fn resolve_in_home(home: &Path, raw: &str) -> CoreResult<PathBuf> {
    let requested = Path::new(raw);

    let relative = if requested.is_absolute() {
        requested.strip_prefix(home).map_err(|_| {
            CoreError::PreconditionFailed(format!("{raw} is outside the profile home"))
        })?
    } else {
        requested
    };

    let mut normalized = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(seg) => normalized.push(seg),
            Component::CurDir => {}
            Component::ParentDir => {
                // ".." — pop one level; if we'd escape the home, reject
                if !normalized.pop() {
                    return Err(CoreError::PreconditionFailed(format!(
                        "{raw} escapes the profile home"
                    )));
                }
            }
            // RootDir/Prefix already handled by the strip above
            _ => {}
        }
    }

    // Build the final path from the canonical root so symlink resolution
    // is consistent (e.g. /var vs /private/var on macOS).
    let root = home.canonicalize().unwrap_or_else(|_| home.to_path_buf());
    Ok(root.join(normalized))
}
