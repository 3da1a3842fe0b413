use crate::classfile::ClassDocument;
use crate::classfile::opcodes::{ACC_BRIDGE, ACC_SYNTHETIC};
use crate::pass::{ClassPass, PassContext, ProcessorCallback};

/// Flags fields synthetic and methods synthetic plus bridge, which most
/// decompilers then leave out. Constructors and static initializers keep
/// their flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct HideMembers;

impl ClassPass for HideMembers {
    fn name(&self) -> &str {
        "hide-members"
    }

    fn process(&self, class: &mut ClassDocument, _: &PassContext<'_>, _: &mut ProcessorCallback) -> anyhow::Result<()> {
        for field in &mut class.fields {
            field.access |= ACC_SYNTHETIC;
        }
        for method in class.methods.iter_mut().filter(|m| !m.name.starts_with('<')) {
            method.access |= ACC_SYNTHETIC | ACC_BRIDGE;
        }
        Ok(())
    }
}
