use std::path::PathBuf;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that abort a run. Per-class failures never surface here; the
/// scheduler degrades those and reports them in the run report.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read input archive {}", .path.display())]
    InputUnreadable {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("cannot write output archive {}", .path.display())]
    OutputUnwritable {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("invalid class pattern `{pattern}`")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("class `{0}` is referenced but not on the classpath")]
    MissingClassDependency(String),

    #[error("class `{0}` is its own ancestor")]
    HierarchyCycle(String),

    #[error("whole-program pass `{pass}` failed")]
    WholeProgramPass {
        pass: String,
        #[source]
        source: BoxError,
    },

    #[error("packaging failed: {0}")]
    Packaging(String),

    #[error("cannot start worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    pub(crate) fn input(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Error::InputUnreadable {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn output(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Error::OutputUnwritable {
            path: path.into(),
            source: source.into(),
        }
    }
}
