//! Class hierarchy resolution.
//!
//! [`HierarchyResolver`] walks superclass and interface edges depth-first,
//! memoizing each node after its parents and registering it as a child of
//! every parent. Once all application classes are resolved the graph is
//! frozen into a [`Hierarchy`] and shared read-only with the workers.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::classfile::{TypeInfo, TypeResolver};
use crate::classpath::ClassPath;
use crate::error::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HierarchyNode {
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub is_interface: bool,
    /// Direct subclasses and implementors seen so far.
    pub children: BTreeSet<String>,
}

impl HierarchyNode {
    /// Superclass first, then interfaces in declaration order.
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.super_name
            .iter()
            .chain(self.interfaces.iter())
            .map(String::as_str)
    }
}

pub struct HierarchyResolver<'a> {
    classpath: &'a ClassPath,
    nodes: HashMap<String, HierarchyNode>,
    in_progress: HashSet<String>,
}

impl<'a> HierarchyResolver<'a> {
    pub fn new(classpath: &'a ClassPath) -> Self {
        Self {
            classpath,
            nodes: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Resolves `name` and all of its ancestors. Every ancestor, platform
    /// classes included, must be on the classpath.
    pub fn resolve(&mut self, name: &str) -> Result<&HierarchyNode, Error> {
        self.resolve_node(name)?;
        self.nodes
            .get(name)
            .ok_or_else(|| Error::MissingClassDependency(name.to_string()))
    }

    pub fn resolve_all<'n>(&mut self, names: impl IntoIterator<Item = &'n str>) -> Result<(), Error> {
        for name in names {
            self.resolve_node(name)?;
        }
        debug!(nodes = self.nodes.len(), "hierarchy resolved");
        Ok(())
    }

    fn resolve_node(&mut self, name: &str) -> Result<(), Error> {
        if self.nodes.contains_key(name) {
            return Ok(());
        }
        let doc = self
            .classpath
            .document(name)
            .ok_or_else(|| Error::MissingClassDependency(name.to_string()))?;
        if !self.in_progress.insert(name.to_string()) {
            return Err(Error::HierarchyCycle(name.to_string()));
        }
        let super_name = doc.super_name.clone();
        let interfaces = doc.interfaces.clone();
        let is_interface = doc.is_interface();

        for parent in super_name.iter().chain(interfaces.iter()) {
            self.resolve_node(parent)?;
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children.insert(name.to_string());
            }
        }

        self.in_progress.remove(name);
        self.nodes.insert(
            name.to_string(),
            HierarchyNode {
                super_name,
                interfaces,
                is_interface,
                children: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Freezes the resolved graph. The snapshot also records the superclass
    /// of every classpath entry so that frame computation can merge types
    /// that were never resolved as part of the graph.
    pub fn into_snapshot(self) -> Hierarchy {
        let types = self
            .classpath
            .iter()
            .map(|(name, entry)| {
                (
                    name.to_string(),
                    TypeInfo {
                        super_name: entry.document.super_name.clone(),
                        is_interface: entry.document.is_interface(),
                    },
                )
            })
            .collect();
        Hierarchy {
            nodes: self.nodes,
            types,
        }
    }
}

/// Read-only hierarchy snapshot shared by all workers of a run.
#[derive(Debug, Default)]
pub struct Hierarchy {
    nodes: HashMap<String, HierarchyNode>,
    types: HashMap<String, TypeInfo>,
}

impl Hierarchy {
    pub fn node(&self, name: &str) -> Option<&HierarchyNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every resolved ancestor of `name`, nearest first.
    pub fn ancestors(&self, name: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = self.node(name).into_iter().flat_map(HierarchyNode::parents).collect();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            out.push(current);
            if let Some(node) = self.node(current) {
                queue.extend(node.parents());
            }
        }
        out
    }

    /// True when `name` is `ancestor` or inherits from it.
    pub fn is_subtype(&self, name: &str, ancestor: &str) -> bool {
        name == ancestor || self.ancestors(name).contains(&ancestor)
    }
}

impl TypeResolver for Hierarchy {
    fn type_info(&self, name: &str) -> Option<TypeInfo> {
        if let Some(info) = self.types.get(name) {
            return Some(info.clone());
        }
        self.nodes.get(name).map(|node| TypeInfo {
            super_name: node.super_name.clone(),
            is_interface: node.is_interface,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ClassDocument;
    use crate::classfile::opcodes::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC};
    use crate::classpath::Origin;

    fn class(name: &str, super_name: &str, interfaces: &[&str]) -> ClassDocument {
        ClassDocument {
            access: ACC_PUBLIC,
            name: name.into(),
            super_name: Some(super_name.into()),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            ..ClassDocument::default()
        }
    }

    fn interface(name: &str) -> ClassDocument {
        ClassDocument {
            access: ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT,
            ..class(name, "java/lang/Object", &[])
        }
    }

    fn object() -> ClassDocument {
        ClassDocument {
            super_name: None,
            ..class("java/lang/Object", "java/lang/Object", &[])
        }
    }

    fn zoo() -> ClassPath {
        let mut classpath = ClassPath::new();
        classpath.insert(object(), Origin::Library);
        classpath.insert(interface("app/Pet"), Origin::Application);
        classpath.insert(class("lib/Animal", "java/lang/Object", &[]), Origin::Library);
        classpath.insert(class("app/Dog", "lib/Animal", &["app/Pet"]), Origin::Application);
        classpath.insert(class("app/Cat", "lib/Animal", &["app/Pet"]), Origin::Application);
        classpath
    }

    #[test]
    fn parents_are_registered_before_children() {
        let classpath = zoo();
        let mut resolver = HierarchyResolver::new(&classpath);
        resolver.resolve_all(["app/Dog", "app/Cat"]).unwrap();
        let hierarchy = resolver.into_snapshot();

        let animal = hierarchy.node("lib/Animal").unwrap();
        assert_eq!(
            animal.children.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["app/Cat", "app/Dog"]
        );
        assert!(hierarchy.node("app/Pet").unwrap().children.contains("app/Dog"));
        assert!(hierarchy.node("java/lang/Object").is_some());
        assert_eq!(
            hierarchy.node("app/Dog").unwrap().parents().collect::<Vec<_>>(),
            vec!["lib/Animal", "app/Pet"]
        );
    }

    #[test]
    fn resolution_order_does_not_change_the_graph() {
        let classpath = zoo();

        let mut forward = HierarchyResolver::new(&classpath);
        forward.resolve_all(["app/Dog", "app/Cat", "app/Pet"]).unwrap();
        let mut backward = HierarchyResolver::new(&classpath);
        backward.resolve_all(["app/Pet", "app/Cat", "app/Dog"]).unwrap();

        let (a, b) = (forward.into_snapshot(), backward.into_snapshot());
        assert_eq!(a.len(), b.len());
        for name in ["app/Dog", "app/Cat", "app/Pet", "lib/Animal", "java/lang/Object"] {
            assert_eq!(a.node(name), b.node(name), "{name}");
        }
    }

    #[test]
    fn missing_ancestor_fails_resolution() {
        let mut classpath = ClassPath::new();
        classpath.insert(class("app/Widget", "vendor/Component", &[]), Origin::Application);

        let mut resolver = HierarchyResolver::new(&classpath);
        match resolver.resolve("app/Widget") {
            Err(Error::MissingClassDependency(name)) => assert_eq!(name, "vendor/Component"),
            other => panic!("expected missing dependency, got {other:?}"),
        }
    }

    #[test]
    fn platform_superclass_must_be_on_the_classpath() {
        let mut classpath = ClassPath::new();
        classpath.insert(class("app/Worker", "java/util/ArrayList", &[]), Origin::Application);

        let mut resolver = HierarchyResolver::new(&classpath);
        match resolver.resolve("app/Worker") {
            Err(Error::MissingClassDependency(name)) => assert_eq!(name, "java/util/ArrayList"),
            other => panic!("expected missing dependency, got {other:?}"),
        }
    }

    #[test]
    fn platform_classes_keep_their_interfaces() {
        let mut classpath = ClassPath::new();
        classpath.insert(object(), Origin::Library);
        classpath.insert(interface("java/util/List"), Origin::Library);
        classpath.insert(interface("java/util/RandomAccess"), Origin::Library);
        classpath.insert(
            class("java/util/ArrayList", "java/lang/Object", &["java/util/List", "java/util/RandomAccess"]),
            Origin::Library,
        );
        classpath.insert(class("app/Worker", "java/util/ArrayList", &[]), Origin::Application);

        let mut resolver = HierarchyResolver::new(&classpath);
        resolver.resolve_all(["app/Worker"]).unwrap();
        let hierarchy = resolver.into_snapshot();

        assert_eq!(
            hierarchy.node("java/util/ArrayList").unwrap().parents().collect::<Vec<_>>(),
            vec!["java/lang/Object", "java/util/List", "java/util/RandomAccess"]
        );
        assert!(hierarchy.is_subtype("app/Worker", "java/util/List"));
    }

    #[test]
    fn cycle_is_reported() {
        let mut classpath = ClassPath::new();
        classpath.insert(class("app/A", "app/B", &[]), Origin::Application);
        classpath.insert(class("app/B", "app/A", &[]), Origin::Application);

        let mut resolver = HierarchyResolver::new(&classpath);
        assert!(matches!(resolver.resolve("app/A"), Err(Error::HierarchyCycle(_))));
    }

    #[test]
    fn snapshot_answers_type_queries_for_unresolved_classes() {
        let classpath = zoo();
        let hierarchy = HierarchyResolver::new(&classpath).into_snapshot();
        assert!(hierarchy.is_empty());

        let info = hierarchy.type_info("app/Dog").unwrap();
        assert_eq!(info.super_name.as_deref(), Some("lib/Animal"));
        assert!(hierarchy.type_info("app/Pet").unwrap().is_interface);
        assert!(hierarchy.type_info("vendor/Unknown").is_none());
    }

    #[test]
    fn subtype_queries_follow_interfaces() {
        let classpath = zoo();
        let mut resolver = HierarchyResolver::new(&classpath);
        resolver.resolve_all(["app/Dog"]).unwrap();
        let hierarchy = resolver.into_snapshot();

        assert!(hierarchy.is_subtype("app/Dog", "app/Pet"));
        assert!(hierarchy.is_subtype("app/Dog", "java/lang/Object"));
        assert!(!hierarchy.is_subtype("lib/Animal", "app/Pet"));
    }
}
