//! Whole-program class renaming.
//!
//! Every eligible application class gets a short sequential name (`A`, `B`,
//! ..., `AA`, ...) either in its own package or in a configured target
//! package. References are then rewritten in every application class.
//! Library classes are never renamed, and string constants are left alone.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::info;

use crate::classfile::descriptor::{remap_descriptor, remap_signature, remap_type};
use crate::classfile::{
    Annotation, Attribute, BootstrapCall, ClassDocument, Constant, ElementValue, FrameValue, Handle, Insn,
};
use crate::gate::ClassGate;
use crate::pass::{ProgramContext, WholeProgramPass};

#[derive(Debug, Clone, Default)]
pub struct ClassRenamer {
    package: Option<String>,
}

impl ClassRenamer {
    /// `package` may use dots or slashes; `None` keeps each class in place.
    pub fn new(package: Option<String>) -> Self {
        Self {
            package: package.map(|p| p.trim().replace('.', "/").trim_matches('/').to_string()),
        }
    }

    /// Old name to new name for every class that will be renamed.
    fn plan<'a>(&self, names: &'a [String], taken: &mut HashSet<String>, eligible: impl Fn(&str) -> bool) -> BTreeMap<&'a str, String> {
        let mut counters: HashMap<String, usize> = HashMap::new();
        let mut plan = BTreeMap::new();
        for name in names.iter().filter(|n| eligible(n)) {
            let package = match &self.package {
                Some(package) => package.clone(),
                None => name.rsplit_once('/').map(|(p, _)| p.to_string()).unwrap_or_default(),
            };
            let counter = counters.entry(package.clone()).or_default();
            let new_name = loop {
                let short = short_name(*counter);
                *counter += 1;
                let candidate = if package.is_empty() { short } else { format!("{package}/{short}") };
                if taken.insert(candidate.clone()) {
                    break candidate;
                }
            };
            plan.insert(name.as_str(), new_name);
        }
        plan
    }
}

impl WholeProgramPass for ClassRenamer {
    fn name(&self) -> &str {
        "class-renamer"
    }

    fn run(&self, ctx: &mut ProgramContext<'_>) -> anyhow::Result<()> {
        if let Some(package) = &self.package {
            anyhow::ensure!(
                !package.contains(['[', ';', '<', '>', ' ']),
                "invalid target package `{package}`"
            );
        }

        let names = ctx.classpath.application_names();
        let mut taken: HashSet<String> = ctx.classpath.iter().map(|(name, _)| name.to_string()).collect();
        let classpath = &*ctx.classpath;
        let gate = ctx.gate;
        let plan = self.plan(&names, &mut taken, |name| {
            is_renamable(name, gate) && classpath.document(name).is_some_and(|doc| !doc.is_annotation())
        });
        if plan.is_empty() {
            return Ok(());
        }

        let lookup = |name: &str| plan.get(name).cloned();
        for document in ctx.classpath.application_mut() {
            remap_class(document, &lookup);
        }
        for (old, new) in &plan {
            ctx.renames.record(old, new);
        }
        ctx.classpath.reindex();
        info!(renamed = plan.len(), "classes renamed");
        Ok(())
    }
}

fn is_renamable(name: &str, gate: &ClassGate) -> bool {
    let simple = name.rsplit('/').next().unwrap_or(name);
    simple != "module-info" && simple != "package-info" && !gate.is_excluded(name)
}

/// `0 -> A`, `25 -> Z`, `26 -> AA`.
fn short_name(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (n % 26) as u8);
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    out.iter().rev().map(|&b| b as char).collect()
}

/// Rewrites every class reference inside `class` through `map`.
pub fn remap_class(class: &mut ClassDocument, map: &dyn Fn(&str) -> Option<String>) {
    let ty = |name: &str| remap_type(name, map);
    let desc = |d: &str| remap_descriptor(d, map);
    let sig = |s: &str| remap_signature(s, map);

    class.name = ty(&class.name);
    class.super_name = class.super_name.as_deref().map(ty);
    class.interfaces = class.interfaces.iter().map(|i| ty(i)).collect();
    class.signature = class.signature.as_deref().map(sig);
    for inner in &mut class.inner_classes {
        inner.name = ty(&inner.name);
        inner.outer_name = inner.outer_name.as_deref().map(ty);
    }
    if let Some(enclosing) = &mut class.enclosing_method {
        enclosing.owner = ty(&enclosing.owner);
        if let Some((_, method_desc)) = &mut enclosing.method {
            *method_desc = desc(method_desc);
        }
    }
    class.nest_host = class.nest_host.as_deref().map(ty);
    for name in class.nest_members.iter_mut().chain(class.permitted_subclasses.iter_mut()) {
        *name = ty(name);
    }
    remap_attributes(&mut class.attributes, map);

    for field in &mut class.fields {
        field.desc = desc(&field.desc);
        field.signature = field.signature.as_deref().map(sig);
        remap_attributes(&mut field.attributes, map);
    }

    for method in &mut class.methods {
        method.desc = desc(&method.desc);
        method.signature = method.signature.as_deref().map(sig);
        remap_attributes(&mut method.attributes, map);
        for exception in &mut method.exceptions {
            *exception = ty(exception);
        }
        let Some(code) = &mut method.code else { continue };
        for insn in &mut code.instructions {
            remap_insn(insn, map);
        }
        for block in &mut code.try_catch {
            block.catch_type = block.catch_type.as_deref().map(ty);
        }
        for local in &mut code.local_variables {
            local.desc = desc(&local.desc);
        }
        for local in &mut code.local_variable_types {
            local.desc = sig(&local.desc);
        }
    }
}

fn remap_attributes(attributes: &mut [Attribute], map: &dyn Fn(&str) -> Option<String>) {
    for attribute in attributes {
        match attribute {
            Attribute::Annotations { annotations, .. } => {
                for annotation in annotations {
                    remap_annotation(annotation, map);
                }
            }
            Attribute::ParameterAnnotations { parameters, .. } => {
                for annotation in parameters.iter_mut().flatten() {
                    remap_annotation(annotation, map);
                }
            }
            Attribute::AnnotationDefault(value) => remap_element(value, map),
            Attribute::Opaque(_) => {}
        }
    }
}

fn remap_annotation(annotation: &mut Annotation, map: &dyn Fn(&str) -> Option<String>) {
    annotation.desc = remap_descriptor(&annotation.desc, map);
    for (_, value) in &mut annotation.values {
        remap_element(value, map);
    }
}

fn remap_element(value: &mut ElementValue, map: &dyn Fn(&str) -> Option<String>) {
    match value {
        ElementValue::Enum { desc, .. } => *desc = remap_descriptor(desc, map),
        ElementValue::Class(desc) => *desc = remap_descriptor(desc, map),
        ElementValue::Annotation(nested) => remap_annotation(nested, map),
        ElementValue::Array(values) => {
            for value in values {
                remap_element(value, map);
            }
        }
        _ => {}
    }
}

fn remap_insn(insn: &mut Insn, map: &dyn Fn(&str) -> Option<String>) {
    match insn {
        Insn::Type { desc, .. } => *desc = remap_type(desc, map),
        Insn::Field { owner, desc, .. } => {
            *owner = remap_type(owner, map);
            *desc = remap_descriptor(desc, map);
        }
        Insn::Method { owner, desc, .. } => {
            *owner = remap_type(owner, map);
            *desc = remap_descriptor(desc, map);
        }
        Insn::InvokeDynamic { desc, bootstrap, .. } => {
            *desc = remap_descriptor(desc, map);
            remap_bootstrap(bootstrap, map);
        }
        Insn::Ldc(constant) => remap_constant(constant, map),
        Insn::MultiANewArray { desc, .. } => *desc = remap_descriptor(desc, map),
        Insn::Frame(frame) => {
            for value in frame.locals.iter_mut().chain(frame.stack.iter_mut()) {
                if let FrameValue::Object(name) = value {
                    *name = remap_type(name, map);
                }
            }
        }
        _ => {}
    }
}

fn remap_constant(constant: &mut Constant, map: &dyn Fn(&str) -> Option<String>) {
    match constant {
        Constant::Class(name) => *name = remap_type(name, map),
        Constant::MethodType(desc) => *desc = remap_descriptor(desc, map),
        Constant::Handle(handle) => remap_handle(handle, map),
        Constant::Dynamic(dynamic) => {
            dynamic.desc = remap_descriptor(&dynamic.desc, map);
            remap_bootstrap(&mut dynamic.bootstrap, map);
        }
        _ => {}
    }
}

fn remap_handle(handle: &mut Handle, map: &dyn Fn(&str) -> Option<String>) {
    handle.owner = remap_type(&handle.owner, map);
    handle.desc = remap_descriptor(&handle.desc, map);
}

fn remap_bootstrap(call: &mut BootstrapCall, map: &dyn Fn(&str) -> Option<String>) {
    remap_handle(&mut call.method, map);
    for argument in &mut call.arguments {
        remap_constant(argument, map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::*;
    use crate::classfile::{Code, FieldNode, Frame, MethodNode, TryCatch};
    use crate::classpath::{ClassPath, Origin};
    use crate::pass::RenameMap;

    fn class(name: &str, super_name: &str) -> ClassDocument {
        ClassDocument {
            major_version: V1_8,
            access: ACC_PUBLIC | ACC_SUPER,
            name: name.into(),
            super_name: Some(super_name.into()),
            ..ClassDocument::default()
        }
    }

    fn main_class() -> ClassDocument {
        let mut code = Code::default();
        let start = code.new_label();
        let end = code.new_label();
        let handler = code.new_label();
        code.instructions = vec![
            Insn::Label(start),
            Insn::Method {
                opcode: INVOKESTATIC,
                owner: "app/Util".into(),
                name: "make".into(),
                desc: "()Lapp/Util;".into(),
                is_interface: false,
            },
            Insn::Type { opcode: CHECKCAST, desc: "app/Util".into() },
            Insn::Field {
                opcode: PUTSTATIC,
                owner: "app/Main".into(),
                name: "util".into(),
                desc: "Lapp/Util;".into(),
            },
            Insn::Ldc(Constant::Class("[Lapp/Util;".into())),
            Insn::Simple(POP),
            Insn::Label(end),
            Insn::Simple(RETURN),
            Insn::Label(handler),
            Insn::Frame(Frame {
                locals: vec![FrameValue::Object("[Ljava/lang/String;".into())],
                stack: vec![FrameValue::Object("app/Failure".into())],
            }),
            Insn::Simple(ATHROW),
        ];
        code.try_catch.push(TryCatch {
            start,
            end,
            handler,
            catch_type: Some("app/Failure".into()),
        });

        ClassDocument {
            fields: vec![FieldNode {
                access: ACC_STATIC,
                name: "util".into(),
                desc: "Lapp/Util;".into(),
                signature: Some("Ljava/util/List<Lapp/Util;>;".into()),
                constant_value: None,
                attributes: Vec::new(),
            }],
            methods: vec![MethodNode {
                access: ACC_PUBLIC | ACC_STATIC,
                name: "main".into(),
                desc: "([Ljava/lang/String;)V".into(),
                signature: None,
                exceptions: vec!["app/Failure".into()],
                code: Some(code),
                attributes: Vec::new(),
            }],
            attributes: vec![Attribute::Annotations {
                visible: true,
                annotations: vec![Annotation {
                    desc: "Lapp/Marker;".into(),
                    values: vec![
                        ("type".into(), ElementValue::Class("Lapp/Util;".into())),
                        ("types".into(), ElementValue::Array(vec![
                            ElementValue::Class("[Lapp/Failure;".into()),
                            ElementValue::Class("V".into()),
                        ])),
                        ("mode".into(), ElementValue::Enum { desc: "Lapp/Failure;".into(), name: "LOUD".into() }),
                        ("nested".into(), ElementValue::Annotation(Annotation {
                            desc: "Lapp/Marker;".into(),
                            values: vec![("type".into(), ElementValue::Class("Lapp/Main;".into()))],
                        })),
                    ],
                }],
            }],
            ..class("app/Main", "java/lang/Object")
        }
    }

    fn classpath() -> ClassPath {
        let mut classpath = ClassPath::new();
        classpath.insert(class("lib/Base", "java/lang/Object"), Origin::Library);
        classpath.insert(main_class(), Origin::Application);
        classpath.insert(class("app/Util", "lib/Base"), Origin::Application);
        classpath.insert(class("app/Failure", "java/lang/RuntimeException"), Origin::Application);
        classpath.insert(class("app/api/Client", "java/lang/Object"), Origin::Application);
        let marker = ClassDocument {
            access: ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT | ACC_ANNOTATION,
            ..class("app/Marker", "java/lang/Object")
        };
        classpath.insert(marker, Origin::Application);
        classpath
    }

    fn run(renamer: ClassRenamer, classpath: &mut ClassPath, gate: &ClassGate) -> RenameMap {
        let mut renames = RenameMap::new();
        renamer
            .run(&mut ProgramContext {
                classpath,
                renames: &mut renames,
                gate,
            })
            .unwrap();
        renames
    }

    #[test]
    fn short_names_count_like_spreadsheet_columns() {
        assert_eq!(short_name(0), "A");
        assert_eq!(short_name(25), "Z");
        assert_eq!(short_name(26), "AA");
        assert_eq!(short_name(27), "AB");
        assert_eq!(short_name(26 + 26 * 26), "AAA");
    }

    #[test]
    fn classes_are_renamed_within_their_package() {
        let mut classpath = classpath();
        let renames = run(ClassRenamer::new(None), &mut classpath, &ClassGate::new(&[], &["app/api/**"]).unwrap());

        // sorted order: app/Failure, app/Main, app/Util
        assert_eq!(renames.get("app/Failure"), Some("app/A"));
        assert_eq!(renames.get("app/Main"), Some("app/B"));
        assert_eq!(renames.get("app/Util"), Some("app/C"));
        assert_eq!(renames.get("app/Marker"), None, "annotations keep their names");
        assert_eq!(renames.get("app/api/Client"), None, "excluded classes keep their names");
        assert_eq!(renames.get("lib/Base"), None);

        assert!(classpath.contains("app/B"));
        assert!(!classpath.contains("app/Main"));
        assert_eq!(
            classpath.document("app/C").unwrap().super_name.as_deref(),
            Some("lib/Base")
        );
    }

    #[test]
    fn every_reference_follows_the_rename() {
        let mut classpath = classpath();
        run(ClassRenamer::new(Some("o".into())), &mut classpath, &ClassGate::allow_all());

        let main = classpath.document("o/B").unwrap();
        assert_eq!(main.fields[0].desc, "Lo/C;");
        assert_eq!(main.fields[0].signature.as_deref(), Some("Ljava/util/List<Lo/C;>;"));
        let method = &main.methods[0];
        assert_eq!(method.exceptions, vec!["o/A".to_string()]);

        let code = method.code.as_ref().unwrap();
        assert_eq!(code.try_catch[0].catch_type.as_deref(), Some("o/A"));
        let mut seen = 0;
        for insn in &code.instructions {
            match insn {
                Insn::Method { owner, desc, .. } => {
                    assert_eq!((owner.as_str(), desc.as_str()), ("o/C", "()Lo/C;"));
                    seen += 1;
                }
                Insn::Type { desc, .. } => {
                    assert_eq!(desc, "o/C");
                    seen += 1;
                }
                Insn::Field { owner, desc, .. } => {
                    assert_eq!((owner.as_str(), desc.as_str()), ("o/B", "Lo/C;"));
                    seen += 1;
                }
                Insn::Ldc(Constant::Class(name)) => {
                    assert_eq!(name, "[Lo/C;");
                    seen += 1;
                }
                Insn::Frame(frame) => {
                    assert_eq!(frame.stack, vec![FrameValue::Object("o/A".into())]);
                    assert_eq!(frame.locals, vec![FrameValue::Object("[Ljava/lang/String;".into())]);
                    seen += 1;
                }
                _ => {}
            }
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn annotation_values_follow_the_rename() {
        let mut classpath = classpath();
        run(ClassRenamer::new(Some("o".into())), &mut classpath, &ClassGate::allow_all());

        let main = classpath.document("o/B").unwrap();
        let Attribute::Annotations { annotations, .. } = &main.attributes[0] else {
            panic!("annotations were not kept");
        };
        let annotation = &annotations[0];
        assert_eq!(annotation.desc, "Lapp/Marker;", "annotation interfaces keep their names");
        let values: HashMap<&str, &ElementValue> = annotation.values.iter().map(|(k, v)| (k.as_str(), v)).collect();
        assert_eq!(values["type"], &ElementValue::Class("Lo/C;".into()));
        assert_eq!(
            values["types"],
            &ElementValue::Array(vec![ElementValue::Class("[Lo/A;".into()), ElementValue::Class("V".into())])
        );
        assert_eq!(
            values["mode"],
            &ElementValue::Enum { desc: "Lo/A;".into(), name: "LOUD".into() }
        );
        let ElementValue::Annotation(nested) = values["nested"] else {
            panic!("nested annotation was not kept");
        };
        assert_eq!(nested.values[0].1, ElementValue::Class("Lo/B;".into()));
    }

    #[test]
    fn parameter_annotations_and_defaults_follow_the_rename() {
        let mut classpath = classpath();
        let tagged = |desc: &str| Annotation {
            desc: "Lapp/Marker;".into(),
            values: vec![("type".into(), ElementValue::Class(desc.into()))],
        };
        let util = classpath.document_mut("app/Util").unwrap();
        util.methods.push(MethodNode {
            access: ACC_PUBLIC | ACC_ABSTRACT,
            name: "take".into(),
            desc: "(Lapp/Util;)V".into(),
            signature: None,
            exceptions: Vec::new(),
            code: None,
            attributes: vec![
                Attribute::ParameterAnnotations { visible: false, parameters: vec![vec![tagged("Lapp/Main;")]] },
                Attribute::AnnotationDefault(ElementValue::Class("Lapp/Failure;".into())),
            ],
        });
        run(ClassRenamer::new(Some("o".into())), &mut classpath, &ClassGate::allow_all());

        let method = &classpath.document("o/C").unwrap().methods[0];
        assert_eq!(method.desc, "(Lo/C;)V");
        let Attribute::ParameterAnnotations { parameters, .. } = &method.attributes[0] else {
            panic!("parameter annotations were not kept");
        };
        assert_eq!(parameters[0][0], tagged("Lo/B;"));
        assert!(matches!(
            &method.attributes[1],
            Attribute::AnnotationDefault(ElementValue::Class(desc)) if desc == "Lo/A;"
        ));
    }

    #[test]
    fn invalid_target_package_fails_the_pass() {
        let mut classpath = classpath();
        let mut renames = RenameMap::new();
        let result = ClassRenamer::new(Some("bad;pkg".into())).run(&mut ProgramContext {
            classpath: &mut classpath,
            renames: &mut renames,
            gate: &ClassGate::allow_all(),
        });
        assert!(result.is_err());
        assert!(renames.is_empty());
    }

    #[test]
    fn generated_names_avoid_existing_classes() {
        let mut classpath = ClassPath::new();
        classpath.insert(class("app/A", "java/lang/Object"), Origin::Library);
        classpath.insert(class("app/Main", "java/lang/Object"), Origin::Application);
        let renames = run(ClassRenamer::new(None), &mut classpath, &ClassGate::allow_all());
        assert_eq!(renames.get("app/Main"), Some("app/B"));
    }
}
