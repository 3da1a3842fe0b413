//! Include/exclude filtering of application classes.
//!
//! Patterns are globs over internal names; dots are accepted as package
//! separators. `*` matches within one package segment, `**` matches across
//! segments. An exclude match always wins, and an empty include list admits
//! every class.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct ClassGate {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl Default for ClassGate {
    fn default() -> Self {
        Self {
            include: None,
            exclude: GlobSet::empty(),
        }
    }
}

impl ClassGate {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self, Error> {
        Ok(Self {
            include: if include.is_empty() { None } else { Some(glob_set(include)?) },
            exclude: glob_set(exclude)?,
        })
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.is_match(name)
    }

    pub fn allows(&self, name: &str) -> bool {
        if self.is_excluded(name) {
            return false;
        }
        self.include.as_ref().is_none_or(|set| set.is_match(name))
    }
}

fn glob_set<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet, Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let normalized = pattern.as_ref().trim().replace('.', "/");
        let glob = GlobBuilder::new(&normalized)
            .literal_separator(true)
            .build()
            .map_err(|source| Error::InvalidPattern {
                pattern: pattern.as_ref().to_string(),
                source,
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| Error::InvalidPattern {
        pattern: patterns.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", "),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_star_stays_in_segment() {
        let gate = ClassGate::new(&["com/example/*"], &[]).unwrap();
        assert!(gate.allows("com/example/App"));
        assert!(!gate.allows("com/example/internal/Util"));
        assert!(!gate.allows("org/other/App"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let gate = ClassGate::new(&["com.example.**"], &[]).unwrap();
        assert!(gate.allows("com/example/App"));
        assert!(gate.allows("com/example/internal/deep/Util"));
        assert!(!gate.allows("com/other/App"));

        let middle = ClassGate::new(&["com/**/Util"], &[]).unwrap();
        assert!(middle.allows("com/Util"));
        assert!(middle.allows("com/a/b/Util"));
        assert!(!middle.allows("com/a/b/Utility"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let gate = ClassGate::new(&["com/example/**"], &["com/example/api/*"]).unwrap();
        assert!(gate.allows("com/example/core/Engine"));
        assert!(!gate.allows("com/example/api/Client"));
        assert!(gate.is_excluded("com/example/api/Client"));
    }

    #[test]
    fn empty_include_admits_everything_not_excluded() {
        let gate = ClassGate::new(&[], &["**/*Test"]).unwrap();
        assert!(gate.allows("com/example/App"));
        assert!(!gate.allows("com/example/AppTest"));
        assert!(ClassGate::allow_all().allows("anything/At/All"));
    }

    #[test]
    fn inner_classes_match_like_any_name() {
        let gate = ClassGate::new(&["com/example/App*"], &[]).unwrap();
        assert!(gate.allows("com/example/App$1"));
        assert!(gate.allows("com/example/App"));
    }

    #[test]
    fn malformed_pattern_is_rejected() {
        match ClassGate::new(&["com/example/[a"], &[]) {
            Err(Error::InvalidPattern { pattern, .. }) => assert_eq!(pattern, "com/example/[a"),
            other => panic!("expected invalid pattern, got {other:?}"),
        }
    }
}
