//! Parallel per-class processing.
//!
//! Application classes are queued once and drained by a fixed rayon pool.
//! Each worker runs the class pass chain and then serializes the class,
//! trying progressively weaker writers:
//!
//! - `Frames`: recompute max stack/locals and the full `StackMapTable`
//! - `Maxs`: recompute max stack/locals only, keeping existing frames
//! - `Original`: emit the bytes the class was read from
//!
//! A failing or panicking pass never stops the run; the class continues
//! through the rest of the chain and the failure is counted.

use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::classfile::{ClassDocument, ClassWriter, ComputeMode, TypeResolver};
use crate::error::Error;
use crate::gate::ClassGate;
use crate::hierarchy::Hierarchy;
use crate::packager::Packager;
use crate::pass::{PassContext, PassRegistry, ProcessorCallback, RenameMap};

#[derive(Debug, Clone)]
pub struct ClassJob {
    pub document: ClassDocument,
    /// Entry name the class was read from.
    pub entry_name: String,
    pub original: Vec<u8>,
}

/// Lifecycle of one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loaded,
    Scheduled,
    Draining,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Frames,
    Maxs,
    Original,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassFailure {
    pub class: String,
    pub pass: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ProcessedClass {
    pub name: String,
    pub entry_name: String,
    pub bytes: Vec<u8>,
    pub tier: Tier,
    pub packaged: bool,
}

#[derive(Debug, Default)]
struct Counters {
    done: AtomicUsize,
    frames: AtomicUsize,
    maxs: AtomicUsize,
    original: AtomicUsize,
    gated_out: AtomicUsize,
    packaging_failures: AtomicUsize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub processed: usize,
    pub tier_frames: usize,
    pub tier_maxs: usize,
    pub tier_original: usize,
    pub gated_out: usize,
    pub pass_failures: usize,
    pub packaging_failures: usize,
}

#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// Keyed by final internal name.
    pub classes: HashMap<String, ProcessedClass>,
    pub failures: Vec<PassFailure>,
    pub stats: SchedulerStats,
}

pub struct Scheduler<'a> {
    registry: &'a PassRegistry,
    gate: &'a ClassGate,
    hierarchy: Arc<Hierarchy>,
    renames: &'a RenameMap,
    packager: Option<&'a Packager>,
    threads: usize,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        registry: &'a PassRegistry,
        gate: &'a ClassGate,
        hierarchy: Arc<Hierarchy>,
        renames: &'a RenameMap,
        threads: usize,
    ) -> Self {
        Self {
            registry,
            gate,
            hierarchy,
            renames,
            packager: None,
            threads: threads.max(1),
        }
    }

    pub fn with_packager(mut self, packager: Option<&'a Packager>) -> Self {
        self.packager = packager;
        self
    }

    /// Processes every job and returns once all of them are done.
    pub fn run(&self, jobs: Vec<ClassJob>) -> Result<ScheduleOutcome, Error> {
        let total = jobs.len();
        let started = Instant::now();
        debug!(phase = ?Phase::Loaded, classes = total);
        let queue = Mutex::new(VecDeque::from(jobs));
        let results = Mutex::new(HashMap::with_capacity(total));
        let failures = Mutex::new(Vec::new());
        let counters = Counters::default();
        let progress_step = (total / 10).max(1);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("class-shroud-worker-{i}"))
            .build()?;
        debug!(phase = ?Phase::Scheduled, threads = self.threads);

        pool.scope(|scope| {
            debug!(phase = ?Phase::Draining);
            for _ in 0..self.threads {
                scope.spawn(|_| {
                    loop {
                        let job = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                        let Some(job) = job else { break };
                        let processed = self.process(job, &counters, &failures);
                        results
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(processed.name.clone(), processed);
                        let done = counters.done.fetch_add(1, Ordering::Relaxed) + 1;
                        if done % progress_step == 0 || done == total {
                            debug!(done, total, "classes processed");
                        }
                    }
                });
            }
        });

        let failures = failures.into_inner().unwrap_or_else(PoisonError::into_inner);
        let stats = SchedulerStats {
            processed: counters.done.load(Ordering::Relaxed),
            tier_frames: counters.frames.load(Ordering::Relaxed),
            tier_maxs: counters.maxs.load(Ordering::Relaxed),
            tier_original: counters.original.load(Ordering::Relaxed),
            gated_out: counters.gated_out.load(Ordering::Relaxed),
            pass_failures: failures.len(),
            packaging_failures: counters.packaging_failures.load(Ordering::Relaxed),
        };
        info!(
            phase = ?Phase::Complete,
            classes = stats.processed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "per-class phase finished"
        );
        Ok(ScheduleOutcome {
            classes: results.into_inner().unwrap_or_else(PoisonError::into_inner),
            failures,
            stats,
        })
    }

    fn process(&self, job: ClassJob, counters: &Counters, failures: &Mutex<Vec<PassFailure>>) -> ProcessedClass {
        let ClassJob {
            mut document,
            entry_name,
            original,
        } = job;
        let name = document.name.clone();
        let mut callback = ProcessorCallback::default();
        let ctx = PassContext {
            hierarchy: self.hierarchy.as_ref(),
            renames: self.renames,
        };

        if self.gate.allows(&name) {
            for pass in self.registry.per_class() {
                let outcome = catch_unwind(AssertUnwindSafe(|| pass.process(&mut document, &ctx, &mut callback)));
                let message = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => format!("{e:#}"),
                    Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
                };
                warn!(class = %name, pass = pass.name(), error = %message, "pass failed, continuing");
                failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(PassFailure {
                        class: name.clone(),
                        pass: pass.name().to_string(),
                        message,
                    });
            }
        } else {
            counters.gated_out.fetch_add(1, Ordering::Relaxed);
            debug!(class = %name, "excluded from passes");
        }

        if callback.frames_forced() {
            document.strip_frames();
        }

        let (bytes, tier) = self.serialize(&document, original);
        match tier {
            Tier::Frames => counters.frames.fetch_add(1, Ordering::Relaxed),
            Tier::Maxs => counters.maxs.fetch_add(1, Ordering::Relaxed),
            Tier::Original => counters.original.fetch_add(1, Ordering::Relaxed),
        };
        let plain_entry = match tier {
            Tier::Original => entry_name,
            _ => format!("{name}.class"),
        };

        if let Some(packager) = self.packager {
            match packager.package(&name, &bytes) {
                Ok((entry_name, encrypted)) => {
                    return ProcessedClass {
                        name,
                        entry_name,
                        bytes: encrypted,
                        tier,
                        packaged: true,
                    };
                }
                Err(e) => {
                    counters.packaging_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(class = %name, error = %e, "packaging failed, storing class unencrypted");
                }
            }
        }

        ProcessedClass {
            name,
            entry_name: plain_entry,
            bytes,
            tier,
            packaged: false,
        }
    }

    fn serialize(&self, document: &ClassDocument, original: Vec<u8>) -> (Vec<u8>, Tier) {
        let resolver: &dyn TypeResolver = self.hierarchy.as_ref();
        let name = &document.name;

        match write_guarded(ComputeMode::Frames, resolver, document) {
            Ok(bytes) => return (bytes, Tier::Frames),
            Err(reason) => warn!(class = %name, error = %reason, "frame computation failed, writing without frames"),
        }
        match write_guarded(ComputeMode::Maxs, resolver, document) {
            Ok(bytes) => (bytes, Tier::Maxs),
            Err(reason) => {
                error!(class = %name, error = %reason, "class cannot be serialized, emitting original bytes");
                (original, Tier::Original)
            }
        }
    }
}

fn write_guarded(mode: ComputeMode, resolver: &dyn TypeResolver, document: &ClassDocument) -> Result<Vec<u8>, String> {
    match catch_unwind(AssertUnwindSafe(|| ClassWriter::new(mode, resolver).write(document))) {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("writer panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::*;
    use crate::classfile::analysis::JdkOnly;
    use crate::classfile::{Code, Frame, FrameValue, Insn, MethodNode, ParseMode, parse};
    use crate::pass::ClassPass;

    fn class(name: &str, methods: Vec<MethodNode>) -> ClassDocument {
        ClassDocument {
            major_version: V1_8,
            access: ACC_PUBLIC | ACC_SUPER,
            name: name.into(),
            super_name: Some("java/lang/Object".into()),
            methods,
            ..ClassDocument::default()
        }
    }

    fn returns_int() -> MethodNode {
        MethodNode {
            access: ACC_PUBLIC | ACC_STATIC,
            name: "one".into(),
            desc: "()I".into(),
            signature: None,
            exceptions: Vec::new(),
            code: Some(Code {
                instructions: vec![Insn::Simple(ICONST_1), Insn::Simple(IRETURN)],
                ..Code::default()
            }),
            attributes: Vec::new(),
        }
    }

    /// Merges two unrelated classes that no resolver knows about.
    fn unknown_merge() -> MethodNode {
        let mut code = Code::default();
        let other = code.new_label();
        let join = code.new_label();
        code.instructions = vec![
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::Jump { opcode: IFEQ, target: other },
            Insn::Simple(ACONST_NULL),
            Insn::Type { opcode: CHECKCAST, desc: "vendor/Left".into() },
            Insn::Jump { opcode: GOTO, target: join },
            Insn::Label(other),
            Insn::Simple(ACONST_NULL),
            Insn::Type { opcode: CHECKCAST, desc: "vendor/Right".into() },
            Insn::Label(join),
            Insn::Simple(ARETURN),
        ];
        MethodNode {
            access: ACC_PUBLIC | ACC_STATIC,
            name: "pick".into(),
            desc: "(Z)Ljava/lang/Object;".into(),
            signature: None,
            exceptions: Vec::new(),
            code: Some(code),
            attributes: Vec::new(),
        }
    }

    /// Counts its argument down to zero; the loop head needs a frame.
    fn countdown() -> MethodNode {
        let mut code = Code::default();
        let head = code.new_label();
        let done = code.new_label();
        code.instructions = vec![
            Insn::Label(head),
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::Jump { opcode: IFLE, target: done },
            Insn::Iinc { var: 0, increment: -1 },
            Insn::Jump { opcode: GOTO, target: head },
            Insn::Label(done),
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::Simple(IRETURN),
        ];
        MethodNode {
            access: ACC_PUBLIC | ACC_STATIC,
            name: "countdown".into(),
            desc: "(I)I".into(),
            signature: None,
            exceptions: Vec::new(),
            code: Some(code),
            attributes: Vec::new(),
        }
    }

    /// A parsed class whose `countdown` still carries the frames it was written with.
    fn framed_class(name: &str) -> ClassDocument {
        let bytes = ClassWriter::new(ComputeMode::Frames, &JdkOnly)
            .write(&class(name, vec![countdown()]))
            .unwrap();
        parse(&bytes, ParseMode::Full).unwrap()
    }

    fn frames(document: &ClassDocument) -> Vec<Frame> {
        let method = document.methods.iter().find(|m| m.name == "countdown").unwrap();
        method
            .code
            .as_ref()
            .unwrap()
            .instructions
            .iter()
            .filter_map(|i| match i {
                Insn::Frame(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// Stores into a new local ahead of the loop, so every recorded frame goes stale.
    struct NewLocal {
        force: bool,
    }

    impl ClassPass for NewLocal {
        fn name(&self) -> &str {
            "new-local"
        }

        fn process(&self, class: &mut ClassDocument, _: &PassContext<'_>, callback: &mut ProcessorCallback) -> anyhow::Result<()> {
            for method in &mut class.methods {
                if method.name != "countdown" {
                    continue;
                }
                if let Some(code) = &mut method.code {
                    code.instructions
                        .splice(0..0, [Insn::Simple(ICONST_5), Insn::Var { opcode: ISTORE, var: 1 }]);
                }
            }
            if self.force {
                callback.force_compute_frames();
            }
            Ok(())
        }
    }

    fn job(document: ClassDocument) -> ClassJob {
        ClassJob {
            entry_name: format!("{}.class", document.name),
            original: b"original".to_vec(),
            document,
        }
    }

    struct Failing;

    impl ClassPass for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn process(&self, class: &mut ClassDocument, _: &PassContext<'_>, _: &mut ProcessorCallback) -> anyhow::Result<()> {
            if class.name.ends_with("Bad") {
                anyhow::bail!("refusing {}", class.name);
            }
            Ok(())
        }
    }

    struct Panicking;

    impl ClassPass for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn process(&self, class: &mut ClassDocument, _: &PassContext<'_>, _: &mut ProcessorCallback) -> anyhow::Result<()> {
            if class.name.ends_with("Bad") {
                panic!("boom");
            }
            Ok(())
        }
    }

    /// Marks every class it sees so later passes can be observed.
    struct Marker;

    impl ClassPass for Marker {
        fn name(&self) -> &str {
            "marker"
        }

        fn process(&self, class: &mut ClassDocument, _: &PassContext<'_>, _: &mut ProcessorCallback) -> anyhow::Result<()> {
            class.source_file = Some("marked".into());
            Ok(())
        }
    }

    fn run(registry: &PassRegistry, gate: &ClassGate, threads: usize, jobs: Vec<ClassJob>) -> ScheduleOutcome {
        let hierarchy = Arc::new(Hierarchy::default());
        let renames = RenameMap::new();
        Scheduler::new(registry, gate, hierarchy, &renames, threads)
            .run(jobs)
            .unwrap()
    }

    #[test]
    fn every_class_comes_out_exactly_once() {
        let registry = PassRegistry::new().with_class_pass(Marker);
        let jobs: Vec<ClassJob> = (0..50)
            .map(|i| job(class(&format!("app/C{i}"), vec![returns_int()])))
            .collect();
        let outcome = run(&registry, &ClassGate::allow_all(), 4, jobs);

        assert_eq!(outcome.classes.len(), 50);
        assert_eq!(outcome.stats.processed, 50);
        assert_eq!(outcome.stats.tier_frames, 50);
        let c7 = &outcome.classes["app/C7"];
        assert_eq!(c7.entry_name, "app/C7.class");
        let parsed = parse(&c7.bytes, ParseMode::Full).unwrap();
        assert_eq!(parsed.source_file.as_deref(), Some("marked"));
    }

    #[test]
    fn pass_failures_do_not_stop_the_chain() {
        let registry = PassRegistry::new()
            .with_class_pass(Failing)
            .with_class_pass(Panicking)
            .with_class_pass(Marker);
        let jobs = vec![
            job(class("app/Bad", vec![returns_int()])),
            job(class("app/Good", vec![returns_int()])),
        ];
        let outcome = run(&registry, &ClassGate::allow_all(), 2, jobs);

        assert_eq!(outcome.classes.len(), 2);
        assert_eq!(outcome.stats.pass_failures, 2);
        let passes: Vec<&str> = outcome.failures.iter().map(|f| f.pass.as_str()).collect();
        assert!(passes.contains(&"failing") && passes.contains(&"panicking"));
        assert!(outcome.failures.iter().all(|f| f.class == "app/Bad"));

        let bad = parse(&outcome.classes["app/Bad"].bytes, ParseMode::Full).unwrap();
        assert_eq!(bad.source_file.as_deref(), Some("marked"));
    }

    #[test]
    fn max_only_tier_is_used_when_frames_fail() {
        let registry = PassRegistry::new();
        let jobs = vec![
            job(class("app/Fine", vec![returns_int()])),
            job(class("app/Merging", vec![unknown_merge()])),
        ];
        let outcome = run(&registry, &ClassGate::allow_all(), 1, jobs);

        assert_eq!(outcome.classes["app/Fine"].tier, Tier::Frames);
        assert_eq!(outcome.classes["app/Merging"].tier, Tier::Maxs);
        assert_eq!(outcome.stats.tier_maxs, 1);
        assert_eq!(outcome.stats.tier_original, 0);
    }

    #[test]
    fn restructured_methods_get_fresh_frames() {
        let before = framed_class("app/Loop");
        assert!(frames(&before).iter().all(|f| f.locals == vec![FrameValue::Integer]));

        let registry = PassRegistry::new().with_class_pass(NewLocal { force: true });
        let outcome = run(&registry, &ClassGate::allow_all(), 1, vec![job(before)]);

        let written = &outcome.classes["app/Loop"];
        assert_eq!(written.tier, Tier::Frames);
        let after = frames(&parse(&written.bytes, ParseMode::Full).unwrap());
        assert!(!after.is_empty());
        for frame in after {
            assert_eq!(frame.locals, vec![FrameValue::Integer, FrameValue::Integer]);
            assert!(frame.stack.is_empty());
        }
    }

    #[test]
    fn forced_frames_are_dropped_when_only_maxs_can_be_written() {
        let written = |force: bool| {
            let mut document = framed_class("app/Loop");
            document.methods.push(unknown_merge());
            let registry = PassRegistry::new().with_class_pass(NewLocal { force });
            let outcome = run(&registry, &ClassGate::allow_all(), 1, vec![job(document)]);
            let class = &outcome.classes["app/Loop"];
            assert_eq!(class.tier, Tier::Maxs);
            frames(&parse(&class.bytes, ParseMode::Full).unwrap())
        };

        assert!(written(true).is_empty());
        let stale = written(false);
        assert!(!stale.is_empty(), "frames are kept unless a pass asks otherwise");
        assert!(stale.iter().all(|f| f.locals == vec![FrameValue::Integer]));
    }

    #[test]
    fn gated_classes_skip_passes_but_are_written() {
        let registry = PassRegistry::new().with_class_pass(Marker);
        let gate = ClassGate::new(&["app/keep/**"], &[]).unwrap();
        let jobs = vec![
            job(class("app/keep/A", vec![returns_int()])),
            job(class("app/skip/B", vec![returns_int()])),
        ];
        let outcome = run(&registry, &gate, 2, jobs);

        assert_eq!(outcome.stats.gated_out, 1);
        let skipped = parse(&outcome.classes["app/skip/B"].bytes, ParseMode::Full).unwrap();
        assert_eq!(skipped.source_file, None);
        let kept = parse(&outcome.classes["app/keep/A"].bytes, ParseMode::Full).unwrap();
        assert_eq!(kept.source_file.as_deref(), Some("marked"));
    }

    #[test]
    fn packaged_classes_use_opaque_entries() {
        let registry = PassRegistry::new();
        let gate = ClassGate::allow_all();
        let hierarchy = Arc::new(Hierarchy::default());
        let renames = RenameMap::new();
        let packager = Packager::with_key("key");
        let outcome = Scheduler::new(&registry, &gate, hierarchy, &renames, 2)
            .with_packager(Some(&packager))
            .run(vec![job(class("app/Main", vec![returns_int()]))])
            .unwrap();

        let main = &outcome.classes["app/Main"];
        assert!(main.packaged);
        assert_eq!(main.entry_name, packager.encrypt_name("app/Main"));
        let plain = packager.decrypt_class(&main.bytes);
        assert_eq!(parse(&plain, ParseMode::Full).unwrap().name, "app/Main");
    }
}
