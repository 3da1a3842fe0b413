use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::warn;

/// Every `.jar`, `.zip` and `.jmod` below `base_path`, sorted so classpath
/// precedence does not depend on walk order.
pub fn scan_jars(base_path: &Path) -> Result<Vec<PathBuf>> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if is_archive(path) && path.is_file() {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut jars: Vec<PathBuf> = rx.iter().collect();
    jars.sort();
    Ok(jars)
}

/// Expands library locations into archive paths. Files are kept in the given
/// order, directories contribute their jars in sorted order.
pub fn library_archives(locations: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for location in locations {
        if location.is_dir() {
            match scan_jars(location) {
                Ok(jars) => out.extend(jars),
                Err(e) => warn!(path = %location.display(), error = %e, "skipping library directory"),
            }
        } else {
            out.push(location.clone());
        }
    }
    out
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| ["jar", "zip", "jmod"].iter().any(|ext| e.eq_ignore_ascii_case(ext)))
}

pub fn class_entry_name(internal_name: &str) -> String {
    format!("{internal_name}.class")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn scan_jars_is_sorted_and_recursive() {
        let base = temp_dir("class-shroud-scan");
        fs::create_dir_all(base.join("b/nested")).unwrap();
        fs::create_dir_all(base.join("a")).unwrap();
        fs::write(base.join("b/nested/z.jar"), b"").unwrap();
        fs::write(base.join("a/y.jar"), b"").unwrap();
        fs::write(base.join("a/readme.txt"), b"").unwrap();

        let jars = scan_jars(&base).unwrap();
        assert_eq!(jars, vec![base.join("a/y.jar"), base.join("b/nested/z.jar")]);
        fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn library_archives_expands_directories_in_place() {
        let base = temp_dir("class-shroud-libs");
        fs::create_dir_all(base.join("dir")).unwrap();
        fs::write(base.join("dir/b.jar"), b"").unwrap();
        fs::write(base.join("dir/a.jar"), b"").unwrap();
        let single = base.join("single.jar");
        fs::write(&single, b"").unwrap();

        let archives = library_archives(&[single.clone(), base.join("dir")]);
        assert_eq!(
            archives,
            vec![single, base.join("dir/a.jar"), base.join("dir/b.jar")]
        );
        fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn platform_modules_count_as_archives() {
        let base = temp_dir("class-shroud-jmods");
        fs::create_dir_all(base.join("jmods")).unwrap();
        fs::write(base.join("jmods/java.base.jmod"), b"").unwrap();
        fs::write(base.join("jmods/java.sql.JMOD"), b"").unwrap();
        fs::write(base.join("jmods/release"), b"").unwrap();

        let archives = library_archives(&[base.join("jmods")]);
        assert_eq!(
            archives,
            vec![base.join("jmods/java.base.jmod"), base.join("jmods/java.sql.JMOD")]
        );
        fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn class_entry_name_appends_suffix() {
        assert_eq!(class_entry_name("com/example/App"), "com/example/App.class");
    }
}
