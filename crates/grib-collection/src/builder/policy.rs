//! Applying an update policy to an existing index.

use std::fs;
use std::path::Path;

use crate::codec;
use crate::config::UpdatePolicy;
use crate::error::{CollectionError, Result};
use crate::model::Collection;
use crate::scan::{modified_ms, SourceFile};

#[derive(Debug)]
pub(crate) enum Decision {
    Reuse(Collection),
    Rebuild,
}

/// Decides whether the index at `index_path` can be reused.
///
/// `is_fresh` is only consulted under [`UpdatePolicy::Test`].
pub(crate) fn decide(
    policy: UpdatePolicy,
    index_path: &Path,
    is_fresh: impl FnOnce(&Collection) -> Result<bool>,
) -> Result<Decision> {
    if policy == UpdatePolicy::Always {
        return Ok(Decision::Rebuild);
    }

    let existing = codec::open_collection(index_path)?;
    match (policy, existing) {
        (UpdatePolicy::Never | UpdatePolicy::Nocheck, Some(collection)) => Ok(Decision::Reuse(collection)),
        (UpdatePolicy::Never, None) => Err(CollectionError::IndexMissing(index_path.to_path_buf())),
        (UpdatePolicy::Test, Some(collection)) => {
            if is_fresh(&collection)? {
                Ok(Decision::Reuse(collection))
            } else {
                log::debug!("index {} is stale", index_path.display());
                Ok(Decision::Rebuild)
            }
        }
        _ => Ok(Decision::Rebuild),
    }
}

/// True when the recorded sources are exactly the current ones, in order.
pub(crate) fn same_sources(recorded: &[SourceFile], current: &[SourceFile]) -> bool {
    recorded == current
}

/// True when the index file is not older than any of `sources`.
pub(crate) fn index_is_newer(index_path: &Path, sources: &[SourceFile]) -> bool {
    let Ok(metadata) = fs::metadata(index_path) else {
        return false;
    };
    let index_modified = modified_ms(&metadata);
    sources.iter().all(|source| source.last_modified <= index_modified)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::testing;

    fn sources(dir: &Path) -> Vec<SourceFile> {
        let path = testing::write_data_file(dir, "a.grib2", &["1 0 0 0 100 0 0 500"]);
        vec![SourceFile::from_path(&path).expect("stat")]
    }

    #[test]
    fn always_rebuilds_without_reading() {
        let dir = TempDir::new().expect("tempdir");
        let decision = decide(UpdatePolicy::Always, &dir.path().join("x.ncx2"), |_| {
            panic!("freshness must not be checked")
        })
        .expect("decide");
        assert!(matches!(decision, Decision::Rebuild));
    }

    #[test]
    fn never_without_index_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let err = decide(UpdatePolicy::Never, &dir.path().join("x.ncx2"), |_| Ok(true))
            .expect_err("missing");
        assert!(matches!(err, CollectionError::IndexMissing(_)));
    }

    #[test]
    fn test_and_nocheck_rebuild_when_missing() {
        let dir = TempDir::new().expect("tempdir");
        for policy in [UpdatePolicy::Test, UpdatePolicy::Nocheck] {
            let decision = decide(policy, &dir.path().join("x.ncx2"), |_| Ok(true)).expect("decide");
            assert!(matches!(decision, Decision::Rebuild));
        }
    }

    #[test]
    fn test_consults_freshness() {
        let dir = TempDir::new().expect("tempdir");
        let (descriptor, tables) = testing::sample_contents(dir.path());
        let path = dir.path().join("sample.ncx2");
        codec::write_index_file(&path, descriptor, &tables).expect("write");

        let fresh = decide(UpdatePolicy::Test, &path, |_| Ok(true)).expect("decide");
        assert!(matches!(fresh, Decision::Reuse(_)));
        let stale = decide(UpdatePolicy::Test, &path, |_| Ok(false)).expect("decide");
        assert!(matches!(stale, Decision::Rebuild));
        let unchecked = decide(UpdatePolicy::Nocheck, &path, |_| Ok(false)).expect("decide");
        assert!(matches!(unchecked, Decision::Reuse(_)));
    }

    #[test]
    fn source_comparison_sees_size_and_time() {
        let dir = TempDir::new().expect("tempdir");
        let recorded = sources(dir.path());
        assert!(same_sources(&recorded, &recorded.clone()));

        let mut grown = recorded.clone();
        grown[0].size += 1;
        assert!(!same_sources(&recorded, &grown));

        let mut touched = recorded.clone();
        touched[0].last_modified += 1;
        assert!(!same_sources(&recorded, &touched));
        assert!(!same_sources(&recorded, &[]));
    }

    #[test]
    fn index_age_is_compared_with_sources() {
        let dir = TempDir::new().expect("tempdir");
        let mut sources = sources(dir.path());
        let index = dir.path().join("x.ncx2");
        std::fs::write(&index, b"index").expect("write");
        assert!(index_is_newer(&index, &sources));

        sources[0].last_modified = u64::MAX;
        assert!(!index_is_newer(&index, &sources));
        assert!(!index_is_newer(&dir.path().join("absent.ncx2"), &sources));
    }
}
