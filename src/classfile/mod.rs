//! Structured, mutable model of a JVM class file.
//!
//! The byte-level format (constant pool, attribute layouts, modified UTF-8,
//! instruction encoding) is handled by `ristretto_classfile`. On top of it,
//! [`reader::parse`] lifts a class into a [`ClassDocument`] whose method
//! bodies are symbolic instruction lists (branch targets are [`Label`]s,
//! constants are values, not pool indices). [`writer::ClassWriter`] lowers a
//! document back into bytes, recomputing max stack/locals and, in
//! [`ComputeMode::Frames`], the whole `StackMapTable`.
//!
//! Annotations are decoded into the model so that renaming can reach the
//! class names inside them. Any other attribute is kept opaque; it keeps
//! pointing into the constant pool it was read from, so the writer reuses
//! that pool as the base of the new one.

pub mod analysis;
pub mod constant_pool;
pub mod descriptor;
pub mod instructions;
pub mod jdk;
pub mod opcodes;
pub mod reader;
pub mod writer;

pub use analysis::{TypeInfo, TypeResolver};
pub use constant_pool::SourcePool;
pub use reader::{ParseMode, parse};
pub use writer::{ClassWriter, ComputeMode};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Format(#[from] ristretto_classfile::Error),

    #[error("invalid constant pool reference #{0}")]
    BadConstant(u16),

    #[error("invalid method handle kind {0}")]
    BadHandleKind(u8),

    #[error("unsupported instruction {instruction} at index {index}")]
    BadInstruction { instruction: String, index: usize },

    #[error("invalid code position {0}")]
    BadOffset(usize),

    #[error("malformed descriptor `{0}`")]
    Descriptor(String),

    #[error("label {0:?} is not placed in the instruction list")]
    UnplacedLabel(Label),

    #[error("frame computation failed in {method}: {reason}")]
    Frame { method: String, reason: String },

    #[error("type `{0}` is not known to the class graph")]
    UnknownType(String),

    #[error("class file limit exceeded: {0}")]
    Limit(String),
}

/// Symbolic position in an instruction list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub kind: u8,
    pub owner: String,
    pub name: String,
    pub desc: String,
    pub is_interface: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BootstrapCall {
    pub method: Handle,
    pub arguments: Vec<Constant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynamicConstant {
    pub name: String,
    pub desc: String,
    pub bootstrap: BootstrapCall,
}

/// Loadable constant. Floating point values are kept as raw bits so that
/// NaN payloads survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    String(String),
    /// Internal name, or a descriptor for array classes.
    Class(String),
    MethodType(String),
    Handle(Handle),
    Dynamic(Box<DynamicConstant>),
}

/// Verification type as stored in a `StackMapTable` entry. Long and double
/// occupy a single element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrameValue {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Object(String),
    /// Value created by the `new` instruction that follows this label.
    Uninitialized(Label),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub locals: Vec<FrameValue>,
    pub stack: Vec<FrameValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    Label(Label),
    LineNumber { line: u16, start: Label },
    Frame(Frame),
    /// Any instruction without operands.
    Simple(u8),
    /// `bipush`, `sipush` and `newarray`.
    Int { opcode: u8, operand: i32 },
    /// Loads, stores and `ret`, always in their indexed form.
    Var { opcode: u8, var: u16 },
    /// `new`, `anewarray`, `checkcast` and `instanceof`.
    Type { opcode: u8, desc: String },
    Field { opcode: u8, owner: String, name: String, desc: String },
    Method { opcode: u8, owner: String, name: String, desc: String, is_interface: bool },
    InvokeDynamic { name: String, desc: String, bootstrap: BootstrapCall },
    /// Conditional and unconditional branches; `goto_w`/`jsr_w` are folded
    /// into `goto`/`jsr` and re-widened on write when needed.
    Jump { opcode: u8, target: Label },
    Ldc(Constant),
    Iinc { var: u16, increment: i16 },
    TableSwitch { low: i32, high: i32, default: Label, targets: Vec<Label> },
    LookupSwitch { default: Label, pairs: Vec<(i32, Label)> },
    MultiANewArray { desc: String, dims: u8 },
}

impl Insn {
    /// True for labels, line numbers and frames, which occupy no bytecode.
    pub fn is_pseudo(&self) -> bool {
        matches!(self, Insn::Label(_) | Insn::LineNumber { .. } | Insn::Frame(_))
    }

    pub fn opcode(&self) -> Option<u8> {
        match self {
            Insn::Label(_) | Insn::LineNumber { .. } | Insn::Frame(_) => None,
            Insn::Simple(op) => Some(*op),
            Insn::Int { opcode, .. }
            | Insn::Var { opcode, .. }
            | Insn::Type { opcode, .. }
            | Insn::Field { opcode, .. }
            | Insn::Method { opcode, .. }
            | Insn::Jump { opcode, .. } => Some(*opcode),
            Insn::InvokeDynamic { .. } => Some(opcodes::INVOKEDYNAMIC),
            Insn::Ldc(_) => Some(opcodes::LDC),
            Insn::Iinc { .. } => Some(opcodes::IINC),
            Insn::TableSwitch { .. } => Some(opcodes::TABLESWITCH),
            Insn::LookupSwitch { .. } => Some(opcodes::LOOKUPSWITCH),
            Insn::MultiANewArray { .. } => Some(opcodes::MULTIANEWARRAY),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryCatch {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    pub catch_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub name: String,
    /// Descriptor for `LocalVariableTable`, signature for `LocalVariableTypeTable`.
    pub desc: String,
    pub start: Label,
    pub end: Label,
    pub index: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub instructions: Vec<Insn>,
    pub try_catch: Vec<TryCatch>,
    pub local_variables: Vec<LocalVariable>,
    pub local_variable_types: Vec<LocalVariable>,
    pub next_label: u32,
}

impl Code {
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Number of real (non-pseudo) instructions.
    pub fn instruction_count(&self) -> usize {
        self.instructions.iter().filter(|i| !i.is_pseudo()).count()
    }

    pub fn strip_frames(&mut self) {
        self.instructions.retain(|i| !matches!(i, Insn::Frame(_)));
    }
}

/// Value of an annotation element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementValue {
    Byte(i32),
    Char(i32),
    Short(i32),
    Boolean(i32),
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    String(String),
    Enum { desc: String, name: String },
    /// Return descriptor, e.g. `Ljava/lang/String;` or `V`.
    Class(String),
    Annotation(Annotation),
    Array(Vec<ElementValue>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Field descriptor of the annotation interface.
    pub desc: String,
    pub values: Vec<(String, ElementValue)>,
}

#[derive(Debug, Clone)]
pub enum Attribute {
    Annotations {
        visible: bool,
        annotations: Vec<Annotation>,
    },
    ParameterAnnotations {
        visible: bool,
        parameters: Vec<Vec<Annotation>>,
    },
    AnnotationDefault(ElementValue),
    /// Still indexes the constant pool it was read from.
    Opaque(ristretto_classfile::attributes::Attribute),
}

impl Attribute {
    pub fn is_opaque(&self) -> bool {
        matches!(self, Attribute::Opaque(_))
    }
}

#[derive(Debug, Clone)]
pub struct FieldNode {
    pub access: u16,
    pub name: String,
    pub desc: String,
    pub signature: Option<String>,
    pub constant_value: Option<Constant>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct MethodNode {
    pub access: u16,
    pub name: String,
    pub desc: String,
    pub signature: Option<String>,
    pub exceptions: Vec<String>,
    pub code: Option<Code>,
    pub attributes: Vec<Attribute>,
}

impl MethodNode {
    pub fn is_static(&self) -> bool {
        self.access & opcodes::ACC_STATIC != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerClass {
    pub name: String,
    pub outer_name: Option<String>,
    pub inner_name: Option<String>,
    pub access: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclosingMethod {
    pub owner: String,
    pub method: Option<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassDocument {
    pub minor_version: u16,
    pub major_version: u16,
    pub access: u16,
    pub name: String,
    /// Absent only for `java/lang/Object`.
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub signature: Option<String>,
    pub inner_classes: Vec<InnerClass>,
    pub enclosing_method: Option<EnclosingMethod>,
    pub nest_host: Option<String>,
    pub nest_members: Vec<String>,
    pub permitted_subclasses: Vec<String>,
    pub fields: Vec<FieldNode>,
    pub methods: Vec<MethodNode>,
    pub attributes: Vec<Attribute>,
    /// Pool the opaque attributes index into.
    pub source_pool: Option<SourcePool>,
}

impl ClassDocument {
    pub fn is_interface(&self) -> bool {
        self.access & opcodes::ACC_INTERFACE != 0
    }

    pub fn is_annotation(&self) -> bool {
        self.access & opcodes::ACC_ANNOTATION != 0
    }

    pub fn has_opaque_attributes(&self) -> bool {
        self.attributes.iter().any(Attribute::is_opaque)
            || self.fields.iter().flat_map(|f| &f.attributes).any(Attribute::is_opaque)
            || self.methods.iter().flat_map(|m| &m.attributes).any(Attribute::is_opaque)
    }

    pub fn instruction_count(&self) -> usize {
        self.methods
            .iter()
            .filter_map(|m| m.code.as_ref())
            .map(Code::instruction_count)
            .sum()
    }

    /// Removes every frame pseudo-instruction from every method body.
    pub fn strip_frames(&mut self) {
        for code in self.methods.iter_mut().filter_map(|m| m.code.as_mut()) {
            code.strip_frames();
        }
    }
}
