//! Run driver: load, whole-program passes, hierarchy, parallel phase,
//! packaging, assembly.
//!
//! All per-run state lives in a [`RunContext`] owned by [`Obfuscator::run`]
//! and is dropped when the run ends, whether it succeeded or not.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::archive::{InputEntry, OutputLayout, assemble, read_input};
use crate::classfile::{ParseMode, parse};
use crate::classpath::{ClassPath, Origin};
use crate::config::JobConfig;
use crate::error::Error;
use crate::gate::ClassGate;
use crate::hierarchy::HierarchyResolver;
use crate::manifest;
use crate::packager::Packager;
use crate::pass::{PassRegistry, ProgramContext, RenameMap};
use crate::scan::class_entry_name;
use crate::scheduler::{ClassJob, PassFailure, Scheduler, SchedulerStats, Tier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedClass {
    pub class: String,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub passes: Vec<String>,
    pub application_classes: usize,
    pub library_classes: usize,
    pub resources: usize,
    pub renamed_classes: usize,
    pub renames: RenameMap,
    pub stats: SchedulerStats,
    /// Classes written by a weaker tier than full frame computation.
    pub degraded_classes: Vec<DegradedClass>,
    pub pass_failures: Vec<PassFailure>,
    pub original_main_class: Option<String>,
    pub final_main_class: Option<String>,
    pub bootstrap_class: Option<String>,
    pub entries_written: usize,
    pub duration_ms: u64,
}

/// Mutable state of one run.
#[derive(Debug, Default)]
struct RunContext {
    classpath: ClassPath,
    renames: RenameMap,
    directories: Vec<String>,
    /// Non-class entries, plus class entries that could not be used as classes.
    resources: Vec<(String, Vec<u8>)>,
    /// Entry name and input bytes per class, keyed by the name it was read as.
    originals: HashMap<String, (String, Vec<u8>)>,
}

impl RunContext {
    fn load(config: &JobConfig) -> Result<Self, Error> {
        let entries = read_input(&config.input)?;
        let mut ctx = RunContext::default();
        ctx.classpath.load_libraries(&config.libraries);

        for entry in entries {
            match entry {
                InputEntry::Directory(name) => ctx.directories.push(name),
                InputEntry::Resource { name, bytes } => ctx.resources.push((name, bytes)),
                InputEntry::Class { name, bytes } => match parse(&bytes, ParseMode::Full) {
                    Ok(document) if class_entry_name(&document.name) == name => {
                        ctx.originals
                            .insert(document.name.clone(), (name, bytes));
                        if let Some(shadowed) = ctx.classpath.insert(document, Origin::Application) {
                            debug!(class = %shadowed.document.name, "application class shadows a library class");
                        }
                    }
                    Ok(document) => {
                        debug!(entry = %name, class = %document.name, "class stored under a foreign path, copying verbatim");
                        ctx.resources.push((name, bytes));
                    }
                    Err(e) => {
                        warn!(entry = %name, error = %e, "unparseable class, copying verbatim");
                        ctx.resources.push((name, bytes));
                    }
                },
            }
        }
        Ok(ctx)
    }

    /// Moves application classes out of the classpath into scheduler jobs.
    fn take_jobs(&mut self) -> Vec<ClassJob> {
        let renamed_from: HashMap<&str, &str> = self.renames.iter().map(|(old, new)| (new, old)).collect();
        let documents = self.classpath.take_application();
        let mut jobs = Vec::with_capacity(documents.len());
        for document in documents {
            let read_as = renamed_from.get(document.name.as_str()).copied().unwrap_or(&document.name);
            let (entry_name, original) = self
                .originals
                .remove(read_as)
                .unwrap_or_else(|| (class_entry_name(&document.name), Vec::new()));
            jobs.push(ClassJob {
                document,
                entry_name,
                original,
            });
        }
        jobs
    }

    fn main_class(&self) -> Option<String> {
        self.resources
            .iter()
            .find(|(name, _)| manifest::is_manifest(name))
            .and_then(|(_, bytes)| manifest::main_class(bytes))
    }
}

pub struct Obfuscator {
    config: JobConfig,
    registry: PassRegistry,
}

impl Obfuscator {
    pub fn new(config: JobConfig, registry: PassRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn run(&self) -> Result<RunReport, Error> {
        let started = Instant::now();
        let config = &self.config;

        let mut ctx = RunContext::load(config)?;
        let application_classes = ctx.classpath.count(Origin::Application);
        let library_classes = ctx.classpath.count(Origin::Library);
        info!(
            application_classes,
            library_classes,
            resources = ctx.resources.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "classpath loaded"
        );

        let gate = ClassGate::new(&config.include, &config.exclude)?;
        for pass in self.registry.whole_program() {
            let pass_started = Instant::now();
            let mut program = ProgramContext {
                classpath: &mut ctx.classpath,
                renames: &mut ctx.renames,
                gate: &gate,
            };
            pass.run(&mut program).map_err(|e| Error::WholeProgramPass {
                pass: pass.name().to_string(),
                source: e.into(),
            })?;
            info!(
                pass = pass.name(),
                elapsed_ms = pass_started.elapsed().as_millis() as u64,
                "whole-program pass finished"
            );
        }

        let hierarchy = {
            let mut resolver = HierarchyResolver::new(&ctx.classpath);
            if self.registry.requires_hierarchy() {
                let names = ctx.classpath.application_names();
                resolver.resolve_all(names.iter().map(String::as_str))?;
            }
            Arc::new(resolver.into_snapshot())
        };

        let packager = config.package.then(|| Packager::new(config.seed));
        let jobs = ctx.take_jobs();
        let outcome = Scheduler::new(&self.registry, &gate, hierarchy, &ctx.renames, config.worker_threads())
            .with_packager(packager.as_ref())
            .run(jobs)?;

        let original_main = ctx.main_class();
        let renamed_main = original_main
            .as_deref()
            .map(|main| ctx.renames.resolve_binary_name(main));
        let bootstrap = match &packager {
            Some(packager) => {
                let main = renamed_main
                    .clone()
                    .ok_or_else(|| Error::Packaging("input manifest declares no Main-Class".into()))?;
                Some(packager.generate_bootstrap(&main)?)
            }
            None => None,
        };
        let manifest_main = match (&bootstrap, &renamed_main) {
            (Some(bootstrap), _) => Some(bootstrap.name.replace('/', ".")),
            (None, Some(renamed)) if Some(renamed) != original_main.as_ref() => Some(renamed.clone()),
            _ => None,
        };
        let bootstrap_class = bootstrap.as_ref().map(|b| b.name.clone());

        let mut degraded_classes = Vec::new();
        let mut classes = Vec::with_capacity(outcome.classes.len());
        for (name, processed) in outcome.classes {
            if processed.tier != Tier::Frames {
                degraded_classes.push(DegradedClass {
                    class: name,
                    tier: processed.tier,
                });
            }
            classes.push((processed.entry_name, processed.bytes));
        }
        degraded_classes.sort_by(|a, b| a.class.cmp(&b.class));

        let resources = ctx.resources.len();
        let entries_written = assemble(
            &config.output,
            OutputLayout {
                directories: std::mem::take(&mut ctx.directories),
                classes,
                resources: std::mem::take(&mut ctx.resources),
                main_class: manifest_main.clone(),
                bootstrap: bootstrap.map(|b| (b.entry_name, b.bytes)),
            },
        )?;

        let report = RunReport {
            input: config.input.clone(),
            output: config.output.clone(),
            passes: self.registry.names().into_iter().map(String::from).collect(),
            application_classes,
            library_classes,
            resources,
            renamed_classes: ctx.renames.len(),
            renames: std::mem::take(&mut ctx.renames),
            stats: outcome.stats,
            degraded_classes,
            pass_failures: outcome.failures,
            final_main_class: manifest_main.or_else(|| original_main.clone()),
            original_main_class: original_main,
            bootstrap_class,
            entries_written,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            output = %config.output.display(),
            entries = report.entries_written,
            degraded = report.degraded_classes.len(),
            elapsed_ms = report.duration_ms,
            "run finished"
        );
        Ok(report)
    }
}
