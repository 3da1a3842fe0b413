use crate::classfile::{ClassDocument, Insn};
use crate::pass::{ClassPass, PassContext, ProcessorCallback};

/// Drops line numbers, local variable tables and the source file name.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineNumberRemover;

impl ClassPass for LineNumberRemover {
    fn name(&self) -> &str {
        "line-number-remover"
    }

    fn process(&self, class: &mut ClassDocument, _: &PassContext<'_>, _: &mut ProcessorCallback) -> anyhow::Result<()> {
        class.source_file = None;
        for code in class.methods.iter_mut().filter_map(|m| m.code.as_mut()) {
            code.instructions.retain(|i| !matches!(i, Insn::LineNumber { .. }));
            code.local_variables.clear();
            code.local_variable_types.clear();
        }
        Ok(())
    }
}
