//! Pass contracts and the ordered registry the pipeline runs.
//!
//! Whole-program passes run once, serially, before hierarchy resolution and
//! may change any application class (renaming is the typical case). Class
//! passes run on worker threads, one class at a time, against a frozen
//! [`Hierarchy`].

use serde::Serialize;
use std::collections::BTreeMap;

use crate::classfile::ClassDocument;
use crate::classpath::ClassPath;
use crate::gate::ClassGate;
use crate::hierarchy::Hierarchy;

/// Old internal name to new internal name for every renamed class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RenameMap {
    classes: BTreeMap<String, String>,
}

impl RenameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `old -> new`. When `old` is itself the result of an earlier
    /// rename the chain is collapsed so lookups stay single-step.
    pub fn record(&mut self, old: &str, new: &str) {
        if let Some(origin) = self
            .classes
            .iter()
            .find(|(_, current)| current.as_str() == old)
            .map(|(origin, _)| origin.clone())
        {
            self.classes.insert(origin, new.to_string());
            return;
        }
        self.classes.insert(old.to_string(), new.to_string());
    }

    pub fn get(&self, old: &str) -> Option<&str> {
        self.classes.get(old).map(String::as_str)
    }

    /// Final internal name of `name`, which is `name` itself when untouched.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.get(name).unwrap_or(name)
    }

    /// Maps a dotted binary name such as a manifest `Main-Class`.
    pub fn resolve_binary_name(&self, dotted: &str) -> String {
        let internal = dotted.replace('.', "/");
        self.resolve(&internal).replace('/', ".")
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.classes.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }
}

/// Mutable view of the run handed to whole-program passes.
pub struct ProgramContext<'a> {
    pub classpath: &'a mut ClassPath,
    pub renames: &'a mut RenameMap,
    pub gate: &'a ClassGate,
}

/// Read-only view handed to class passes on worker threads.
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    pub hierarchy: &'a Hierarchy,
    pub renames: &'a RenameMap,
}

/// Lets a class pass ask for a full frame recomputation. Existing frames are
/// then discarded before serialization, whichever tier ends up writing the
/// class.
#[derive(Debug, Default)]
pub struct ProcessorCallback {
    force_frames: bool,
}

impl ProcessorCallback {
    pub fn force_compute_frames(&mut self) {
        self.force_frames = true;
    }

    pub fn frames_forced(&self) -> bool {
        self.force_frames
    }
}

pub trait WholeProgramPass: Send + Sync {
    fn name(&self) -> &str;

    fn requires_hierarchy(&self) -> bool {
        false
    }

    fn run(&self, ctx: &mut ProgramContext<'_>) -> anyhow::Result<()>;
}

pub trait ClassPass: Send + Sync {
    fn name(&self) -> &str;

    fn requires_hierarchy(&self) -> bool {
        false
    }

    fn process(
        &self,
        class: &mut ClassDocument,
        ctx: &PassContext<'_>,
        callback: &mut ProcessorCallback,
    ) -> anyhow::Result<()>;
}

/// Passes in execution order.
#[derive(Default)]
pub struct PassRegistry {
    whole_program: Vec<Box<dyn WholeProgramPass>>,
    per_class: Vec<Box<dyn ClassPass>>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_whole_program(mut self, pass: impl WholeProgramPass + 'static) -> Self {
        self.whole_program.push(Box::new(pass));
        self
    }

    pub fn with_class_pass(mut self, pass: impl ClassPass + 'static) -> Self {
        self.per_class.push(Box::new(pass));
        self
    }

    pub fn whole_program(&self) -> &[Box<dyn WholeProgramPass>] {
        &self.whole_program
    }

    pub fn per_class(&self) -> &[Box<dyn ClassPass>] {
        &self.per_class
    }

    /// True when any registered pass needs the hierarchy pre-resolved.
    pub fn requires_hierarchy(&self) -> bool {
        self.whole_program.iter().any(|p| p.requires_hierarchy())
            || self.per_class.iter().any(|p| p.requires_hierarchy())
    }

    pub fn names(&self) -> Vec<&str> {
        self.whole_program
            .iter()
            .map(|p| p.name())
            .chain(self.per_class.iter().map(|p| p.name()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.whole_program.is_empty() && self.per_class.is_empty()
    }
}

impl std::fmt::Debug for PassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
