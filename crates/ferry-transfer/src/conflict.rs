//! Destination conflict resolution.
//!
//! Resolution runs before any byte moves. It is a check-then-act sequence: a
//! destination that appears between the probe and the write is overwritten.
//! No locking is attempted across processes or remote stores.

use ferry_core::types::{ConflictPolicy, TransferRef};
use ferry_core::{FerryError, FerryResult};
use std::future::Future;

/// Upper bound on `rename` probes for a single task
pub const MAX_RENAME_ATTEMPTS: u32 = 10_000;

/// What the executor should do with a task's destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Write to this destination (possibly renamed)
    Write(TransferRef),
    /// Destination exists and the policy is `skip`
    Skip,
}

// ── Rename candidates ─────────────────────────────────────────────────────────

/// The `n`th alternative name for `path`: `dir/report.txt` becomes
/// `dir/report (n).txt`.
///
/// The extension is kept; dotfiles without a further extension (`.env`) get
/// the marker appended.
pub fn rename_candidate(path: &str, n: u32) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    format!("{dir}{stem} ({n}){ext}")
}

/// Apply `policy` to `dest`, consulting `exists` for each probe.
pub async fn resolve<F, Fut>(
    dest: &TransferRef,
    policy: ConflictPolicy,
    mut exists: F,
) -> FerryResult<Resolution>
where
    F: FnMut(TransferRef) -> Fut,
    Fut: Future<Output = FerryResult<bool>>,
{
    match policy {
        ConflictPolicy::Overwrite => Ok(Resolution::Write(dest.clone())),
        ConflictPolicy::Skip => {
            if exists(dest.clone()).await? {
                Ok(Resolution::Skip)
            } else {
                Ok(Resolution::Write(dest.clone()))
            }
        }
        ConflictPolicy::Rename => {
            if !exists(dest.clone()).await? {
                return Ok(Resolution::Write(dest.clone()));
            }
            for n in 1..=MAX_RENAME_ATTEMPTS {
                let candidate = dest.with_path(rename_candidate(&dest.path, n));
                if !exists(candidate.clone()).await? {
                    return Ok(Resolution::Write(candidate));
                }
            }
            Err(FerryError::Conflict(format!(
                "{dest}: no free name after {MAX_RENAME_ATTEMPTS} attempts"
            )))
        }
    }
}

/// Join a destination directory and an entry name into a location-relative path.
pub fn join_dest(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn taken(paths: &[&str]) -> HashSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    async fn run(policy: ConflictPolicy, existing: &HashSet<String>) -> Resolution {
        let dest = TransferRef::local("local-0", "out/report.txt");
        resolve(&dest, policy, |r| {
            let hit = existing.contains(&r.path);
            async move { Ok::<_, FerryError>(hit) }
        })
        .await
        .unwrap()
    }

    #[test]
    fn candidates_keep_extension() {
        assert_eq!(rename_candidate("report.txt", 1), "report (1).txt");
        assert_eq!(rename_candidate("a/b/report.tar.gz", 2), "a/b/report.tar (2).gz");
        assert_eq!(rename_candidate("Makefile", 3), "Makefile (3)");
        assert_eq!(rename_candidate("cfg/.env", 1), "cfg/.env (1)");
    }

    #[tokio::test]
    async fn overwrite_never_probes() {
        let dest = TransferRef::local("local-0", "report.txt");
        let res = resolve(&dest, ConflictPolicy::Overwrite, |_| async {
            Err::<bool, _>(FerryError::Storage("probe must not run".into()))
        })
        .await
        .unwrap();
        assert_eq!(res, Resolution::Write(dest));
    }

    #[tokio::test]
    async fn skip_only_when_present() {
        assert_eq!(
            run(ConflictPolicy::Skip, &taken(&["out/report.txt"])).await,
            Resolution::Skip
        );
        assert!(matches!(
            run(ConflictPolicy::Skip, &taken(&[])).await,
            Resolution::Write(_)
        ));
    }

    #[tokio::test]
    async fn rename_finds_first_free_name() {
        let existing = taken(&["out/report.txt", "out/report (1).txt"]);
        match run(ConflictPolicy::Rename, &existing).await {
            Resolution::Write(r) => assert_eq!(r.path, "out/report (2).txt"),
            other => panic!("unexpected {other:?}"),
        }

        match run(ConflictPolicy::Rename, &taken(&[])).await {
            Resolution::Write(r) => assert_eq!(r.path, "out/report.txt"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_errors_propagate() {
        let dest = TransferRef::object("models", "x.bin");
        let err = resolve(&dest, ConflictPolicy::Skip, |_| async {
            Err::<bool, _>(FerryError::Permission("models:x.bin".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "permission");
    }

    #[test]
    fn join_dest_paths() {
        assert_eq!(join_dest("", "a.txt"), "a.txt");
        assert_eq!(join_dest("/out/", "a.txt"), "out/a.txt");
        assert_eq!(join_dest("out", "/a.txt"), "out/a.txt");
    }
}
