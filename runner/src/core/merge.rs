//! Apply repair patches onto an immutable base revision.

use crate::core::project::{path_problem, validate_project};
use crate::core::types::{CodeProject, RepairPatch};

/// Structural rejection of a repair patch.
///
/// The message is fed back to the repair collaborator verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("invalid patch: {}", .0.join("; "))]
    InvalidPatch(Vec<String>),
}

/// Produce revision `base.revision + 1` from `base` and `patch`.
///
/// Existing paths are replaced, paths marked `new_file` are added and every
/// other file is carried over unchanged. Added requirements are unioned in.
pub fn apply_patch(base: &CodeProject, patch: &RepairPatch) -> Result<CodeProject, MergeError> {
    let mut errors = Vec::new();

    if patch.revision != base.revision {
        errors.push(format!(
            "patch targets revision {} but base is revision {}",
            patch.revision, base.revision
        ));
    }
    if !(0.0..=1.0).contains(&patch.confidence) {
        errors.push(format!("confidence {} outside [0, 1]", patch.confidence));
    }

    let mut next = base.clone();
    next.revision = base.revision + 1;

    for (idx, change) in patch.changes.iter().enumerate() {
        if let Some(problem) = path_problem(&change.path) {
            errors.push(format!("change {idx} {:?}: {problem}", change.path));
            continue;
        }
        let exists = base.files.contains_key(&change.path);
        if !exists && !change.new_file {
            errors.push(format!(
                "change {idx} {:?}: path not in revision {} and not marked new",
                change.path, base.revision
            ));
            continue;
        }
        next.files.insert(change.path.clone(), change.content.clone());
    }

    next.requirements.extend(patch.added_requirements.iter().cloned());

    if errors.is_empty() {
        errors.extend(validate_project(&next));
    }
    if !errors.is_empty() {
        return Err(MergeError::InvalidPatch(errors));
    }
    Ok(next)
}
