use anyhow::{Context, Result};
use clap::Parser;
use class_shroud::archive::{InputEntry, read_input};
use class_shroud::classfile::{ClassDocument, ParseMode, parse};
use class_shroud::cli::{Cli, Commands};
use class_shroud::config::resolve_job_config;
use class_shroud::passes::build_registry;
use class_shroud::pipeline::Obfuscator;
use serde::Serialize;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Obfuscate { .. } => {
            let config = resolve_job_config(&cli)?;
            let registry = build_registry(&config);
            let report = Obfuscator::new(config, registry).run()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Inspect { path } => {
            let summaries = inspect(path)?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    // a second init (tests) is harmless
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Serialize)]
struct MethodSummary {
    name: String,
    desc: String,
    instructions: usize,
}

#[derive(Debug, Serialize)]
struct ClassSummary {
    name: String,
    version: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    fields: usize,
    methods: Vec<MethodSummary>,
}

impl From<&ClassDocument> for ClassSummary {
    fn from(doc: &ClassDocument) -> Self {
        Self {
            name: doc.name.clone(),
            version: format!("{}.{}", doc.major_version, doc.minor_version),
            super_name: doc.super_name.clone(),
            interfaces: doc.interfaces.clone(),
            fields: doc.fields.len(),
            methods: doc
                .methods
                .iter()
                .map(|m| MethodSummary {
                    name: m.name.clone(),
                    desc: m.desc.clone(),
                    instructions: m.code.as_ref().map_or(0, |c| c.instruction_count()),
                })
                .collect(),
        }
    }
}

/// Summarises a single class file, or every parseable class of an archive.
fn inspect(path: &Path) -> Result<Vec<ClassSummary>> {
    if path.extension().is_some_and(|ext| ext == "class") {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read class file: {}", path.display()))?;
        let doc = parse(&bytes, ParseMode::Full).with_context(|| format!("Failed to parse class file: {}", path.display()))?;
        return Ok(vec![ClassSummary::from(&doc)]);
    }

    let mut summaries = Vec::new();
    for entry in read_input(path)? {
        let InputEntry::Class { name, bytes } = entry else {
            continue;
        };
        match parse(&bytes, ParseMode::Full) {
            Ok(doc) => summaries.push(ClassSummary::from(&doc)),
            Err(e) => tracing::warn!(entry = %name, error = %e, "skipping unparseable class"),
        }
    }
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use class_shroud::classfile::analysis::JdkOnly;
    use class_shroud::classfile::opcodes::{ACC_PUBLIC, ACC_SUPER, RETURN, V1_8};
    use class_shroud::classfile::{ClassWriter, Code, ComputeMode, Insn, MethodNode};

    fn empty_class(name: &str) -> Vec<u8> {
        let mut doc = ClassDocument {
            major_version: V1_8,
            access: ACC_PUBLIC | ACC_SUPER,
            name: name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            ..ClassDocument::default()
        };
        doc.methods.push(MethodNode {
            access: ACC_PUBLIC,
            name: "run".to_string(),
            desc: "()V".to_string(),
            signature: None,
            exceptions: Vec::new(),
            code: Some(Code {
                instructions: vec![Insn::Simple(RETURN)],
                ..Code::default()
            }),
            attributes: Vec::new(),
        });
        ClassWriter::new(ComputeMode::Frames, &JdkOnly).write(&doc).unwrap()
    }

    #[test]
    fn inspect_summarises_a_single_class_file() {
        let path = std::env::temp_dir().join(format!("class-shroud-inspect-{}.class", std::process::id()));
        std::fs::write(&path, empty_class("demo/Thing")).unwrap();

        let summaries = inspect(&path).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "demo/Thing");
        assert_eq!(summaries[0].version, "52.0");
        assert_eq!(summaries[0].methods[0].name, "run");
        assert_eq!(summaries[0].methods[0].instructions, 1);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn inspect_rejects_garbage_class_files() {
        let path = std::env::temp_dir().join(format!("class-shroud-garbage-{}.class", std::process::id()));
        std::fs::write(&path, b"not a class").unwrap();
        assert!(inspect(&path).is_err());
        std::fs::remove_file(path).unwrap();
    }
}
