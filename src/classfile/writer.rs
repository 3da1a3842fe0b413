//! Class file serializer.
//!
//! Branch targets, the constant pool, max stack/locals and (in
//! [`ComputeMode::Frames`]) the `StackMapTable` are all derived from the
//! document at write time; nothing positional survives from the input. The
//! lowered class is encoded by `ristretto_classfile`.

use std::collections::{BTreeMap, HashMap, HashSet};

use ristretto_classfile::attributes::{
    Annotation as RawAnnotation, AnnotationElement, AnnotationValuePair,
    Attribute as RawAttribute, ExceptionTableEntry, InnerClass as RawInnerClass, Instruction,
    LineNumber, LocalVariableTable as LocalVariableEntry,
    LocalVariableTypeTable as LocalVariableTypeEntry, LookupSwitch, NestedClassAccessFlags,
    ParameterAnnotation, StackFrame, TableSwitch, VerificationType,
};
use ristretto_classfile::{
    ClassAccessFlags, ClassFile, Field, FieldAccessFlags, Method, MethodAccessFlags, Version,
};

use super::analysis::{self, TypeResolver};
use super::constant_pool::PoolBuilder;
use super::descriptor;
use super::instructions::{array_type, jump_instruction, simple_instruction, var_instruction};
use super::opcodes::*;
use super::{
    Annotation, Attribute, ClassDocument, Code, CodecError, Constant, ElementValue, FieldNode,
    Frame, FrameValue, Insn, Label, LocalVariable, MethodNode,
};

const MAX_CODE_LENGTH: usize = 65535;

/// What the writer recomputes for each method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    /// Max stack, max locals and every stack map frame.
    Frames,
    /// Max stack and max locals only; existing frames are written as they are.
    Maxs,
}

pub struct ClassWriter<'a> {
    mode: ComputeMode,
    resolver: &'a dyn TypeResolver,
}

fn count(len: usize, what: &str) -> Result<u16, CodecError> {
    u16::try_from(len).map_err(|_| CodecError::Limit(format!("{len} {what}")))
}

fn fits_i16(delta: i64) -> bool {
    i16::try_from(delta).is_ok()
}

fn is_wide_constant(constant: &Constant) -> bool {
    match constant {
        Constant::Long(_) | Constant::Double(_) => true,
        Constant::Dynamic(d) => matches!(d.desc.as_str(), "J" | "D"),
        _ => false,
    }
}

fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

/// Encoded size of one instruction at byte `offset`.
fn insn_size(
    insn: &Insn,
    offset: usize,
    wide: bool,
    pool: &mut PoolBuilder,
) -> Result<usize, CodecError> {
    Ok(match insn {
        Insn::Label(_) | Insn::LineNumber { .. } | Insn::Frame(_) => 0,
        Insn::Simple(_) => 1,
        Insn::Int { opcode, .. } => {
            if *opcode == SIPUSH {
                3
            } else {
                2
            }
        }
        Insn::Var { opcode, var } => {
            if *var <= 3 && *opcode != RET {
                1
            } else if *var <= 255 {
                2
            } else {
                4
            }
        }
        Insn::Iinc { var, increment } => {
            if *var <= 255 && i8::try_from(*increment).is_ok() {
                3
            } else {
                6
            }
        }
        Insn::Type { .. } | Insn::Field { .. } => 3,
        Insn::Method { opcode, .. } => {
            if *opcode == INVOKEINTERFACE {
                5
            } else {
                3
            }
        }
        Insn::InvokeDynamic { .. } => 5,
        Insn::Jump { .. } => {
            if wide {
                5
            } else {
                3
            }
        }
        Insn::Ldc(constant) => {
            let index = pool.constant(constant)?;
            if is_wide_constant(constant) || index > 255 {
                3
            } else {
                2
            }
        }
        Insn::TableSwitch { targets, .. } => 1 + switch_padding(offset) + 12 + 4 * targets.len(),
        Insn::LookupSwitch { pairs, .. } => 1 + switch_padding(offset) + 8 + 8 * pairs.len(),
        Insn::MultiANewArray { .. } => 4,
    })
}

/// Byte offsets and instruction indices of one instruction list.
/// Unconditional jumps that cannot reach their target with a 16-bit offset
/// are marked wide.
struct Layout {
    offsets: Vec<usize>,
    indices: Vec<usize>,
    wide: Vec<bool>,
    labels: HashMap<Label, (usize, usize)>,
    len: usize,
    count: usize,
}

impl Layout {
    fn compute(insns: &[Insn], pool: &mut PoolBuilder) -> Result<Self, CodecError> {
        let mut wide = vec![false; insns.len()];
        loop {
            let mut offsets = Vec::with_capacity(insns.len());
            let mut indices = Vec::with_capacity(insns.len());
            let mut labels = HashMap::new();
            let mut pos = 0usize;
            let mut index = 0usize;
            for (i, insn) in insns.iter().enumerate() {
                offsets.push(pos);
                indices.push(index);
                if let Insn::Label(label) = insn {
                    labels.insert(*label, (pos, index));
                }
                pos += insn_size(insn, pos, wide[i], pool)?;
                if !insn.is_pseudo() {
                    index += 1;
                }
            }
            let layout = Layout {
                offsets,
                indices,
                wide: wide.clone(),
                labels,
                len: pos,
                count: index,
            };

            let mut changed = false;
            for (i, insn) in insns.iter().enumerate() {
                if let Insn::Jump {
                    opcode: GOTO | JSR,
                    target,
                } = insn
                {
                    if !wide[i] && !fits_i16(layout.delta(i, *target)?) {
                        wide[i] = true;
                        changed = true;
                    }
                }
            }
            if !changed {
                return Ok(layout);
            }
        }
    }

    fn position(&self, label: Label) -> Result<(usize, usize), CodecError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or(CodecError::UnplacedLabel(label))
    }

    fn delta(&self, from: usize, label: Label) -> Result<i64, CodecError> {
        Ok(self.position(label)?.0 as i64 - self.offsets[from] as i64)
    }

    /// Instruction index of a label, as stored in branch operands and tables.
    fn index(&self, label: Label) -> Result<u16, CodecError> {
        count(self.position(label)?.1, "instructions")
    }

    /// Conditional jumps whose target is out of 16-bit range.
    fn overflowing(&self, insns: &[Insn]) -> Result<Vec<usize>, CodecError> {
        let mut out = Vec::new();
        for (i, insn) in insns.iter().enumerate() {
            if let Insn::Jump { opcode, target } = insn {
                if !matches!(*opcode, GOTO | JSR) && !fits_i16(self.delta(i, *target)?) {
                    out.push(i);
                }
            }
        }
        Ok(out)
    }
}

/// Rewrites `ifXX far` as `ifNotXX skip; goto far; skip:` until every
/// conditional jump is in range.
fn widen_conditionals(code: &mut Code, pool: &mut PoolBuilder) -> Result<(), CodecError> {
    loop {
        let layout = Layout::compute(&code.instructions, pool)?;
        let overflowing: HashSet<usize> = layout.overflowing(&code.instructions)?.into_iter().collect();
        if overflowing.is_empty() {
            return Ok(());
        }
        let insns = std::mem::take(&mut code.instructions);
        let mut rewritten = Vec::with_capacity(insns.len() + 3 * overflowing.len());
        for (i, insn) in insns.into_iter().enumerate() {
            match insn {
                Insn::Jump { opcode, target } if overflowing.contains(&i) => {
                    let inverted = invert_jump(opcode).ok_or_else(|| {
                        CodecError::Limit(format!("opcode {opcode} cannot be widened"))
                    })?;
                    let skip = code.new_label();
                    rewritten.push(Insn::Jump {
                        opcode: inverted,
                        target: skip,
                    });
                    rewritten.push(Insn::Jump {
                        opcode: GOTO,
                        target,
                    });
                    rewritten.push(Insn::Label(skip));
                }
                other => rewritten.push(other),
            }
        }
        code.instructions = rewritten;
    }
}

fn unsupported(opcode: u8, index: usize) -> CodecError {
    CodecError::BadInstruction {
        instruction: format!("opcode {opcode}"),
        index,
    }
}

/// Lowers the symbolic instruction list; branch operands become instruction
/// indices.
fn lower(insns: &[Insn], layout: &Layout, pool: &mut PoolBuilder) -> Result<Vec<Instruction>, CodecError> {
    use Instruction as I;
    let mut out = Vec::with_capacity(layout.count);
    for (i, insn) in insns.iter().enumerate() {
        let index = layout.indices[i];
        let instruction = match insn {
            Insn::Label(_) | Insn::LineNumber { .. } | Insn::Frame(_) => continue,
            Insn::Simple(op) => simple_instruction(*op).ok_or_else(|| unsupported(*op, index))?,
            Insn::Int { opcode, operand } => match *opcode {
                BIPUSH => I::Bipush(*operand as i8),
                SIPUSH => I::Sipush(*operand as i16),
                NEWARRAY => I::Newarray(array_type(*operand).ok_or_else(|| unsupported(*opcode, index))?),
                other => return Err(unsupported(other, index)),
            },
            Insn::Var { opcode, var } => {
                var_instruction(*opcode, *var).ok_or_else(|| unsupported(*opcode, index))?
            }
            Insn::Iinc { var, increment } => match (u8::try_from(*var), i8::try_from(*increment)) {
                (Ok(var), Ok(increment)) => I::Iinc(var, increment),
                _ => I::Iinc_w(*var, *increment),
            },
            Insn::Type { opcode, desc } => {
                let class = pool.class(desc)?;
                match *opcode {
                    NEW => I::New(class),
                    ANEWARRAY => I::Anewarray(class),
                    CHECKCAST => I::Checkcast(class),
                    INSTANCEOF => I::Instanceof(class),
                    other => return Err(unsupported(other, index)),
                }
            }
            Insn::Field {
                opcode,
                owner,
                name,
                desc,
            } => {
                let field = pool.field_ref(owner, name, desc)?;
                match *opcode {
                    GETSTATIC => I::Getstatic(field),
                    PUTSTATIC => I::Putstatic(field),
                    GETFIELD => I::Getfield(field),
                    PUTFIELD => I::Putfield(field),
                    other => return Err(unsupported(other, index)),
                }
            }
            Insn::Method {
                opcode,
                owner,
                name,
                desc,
                is_interface,
            } => {
                let method = pool.method_ref(owner, name, desc, *is_interface)?;
                match *opcode {
                    INVOKEVIRTUAL => I::Invokevirtual(method),
                    INVOKESPECIAL => I::Invokespecial(method),
                    INVOKESTATIC => I::Invokestatic(method),
                    INVOKEINTERFACE => {
                        let args = descriptor::arguments_size(desc)? + 1;
                        I::Invokeinterface(method, args as u8)
                    }
                    other => return Err(unsupported(other, index)),
                }
            }
            Insn::InvokeDynamic {
                name,
                desc,
                bootstrap,
            } => I::Invokedynamic(pool.invoke_dynamic(name, desc, bootstrap)?),
            Insn::Jump { opcode, target } => {
                let target = layout.index(*target)?;
                if layout.wide[i] {
                    if *opcode == JSR {
                        I::Jsr_w(target as i32)
                    } else {
                        I::Goto_w(target as i32)
                    }
                } else {
                    jump_instruction(*opcode, target).ok_or_else(|| unsupported(*opcode, index))?
                }
            }
            Insn::Ldc(constant) => {
                let pooled = pool.constant(constant)?;
                if is_wide_constant(constant) {
                    I::Ldc2_w(pooled)
                } else if let Ok(narrow) = u8::try_from(pooled) {
                    I::Ldc(narrow)
                } else {
                    I::Ldc_w(pooled)
                }
            }
            Insn::TableSwitch {
                low,
                high,
                default,
                targets,
            } => I::Tableswitch(TableSwitch {
                default: layout.index(*default)? as i32,
                low: *low,
                high: *high,
                offsets: targets
                    .iter()
                    .map(|target| layout.index(*target).map(i32::from))
                    .collect::<Result<_, _>>()?,
            }),
            Insn::LookupSwitch { default, pairs } => {
                let mut sorted: Vec<&(i32, Label)> = pairs.iter().collect();
                sorted.sort_by_key(|(key, _)| *key);
                I::Lookupswitch(LookupSwitch {
                    default: layout.index(*default)? as i32,
                    pairs: sorted
                        .into_iter()
                        .map(|(key, target)| Ok((*key, i32::from(layout.index(*target)?))))
                        .collect::<Result<_, CodecError>>()?,
                })
            }
            Insn::MultiANewArray { desc, dims } => I::Multianewarray(pool.class(desc)?, *dims),
        };
        out.push(instruction);
    }
    Ok(out)
}

const SAME_LOCALS_1_STACK_ITEM: u8 = 64;
const SAME_LOCALS_1_STACK_ITEM_EXTENDED: u8 = 247;
const SAME_FRAME_EXTENDED: u8 = 251;
const FULL_FRAME: u8 = 255;

fn verification_types(
    values: &[FrameValue],
    layout: &Layout,
    pool: &mut PoolBuilder,
) -> Result<Vec<VerificationType>, CodecError> {
    values
        .iter()
        .map(|value| {
            Ok(match value {
                FrameValue::Top => VerificationType::Top,
                FrameValue::Integer => VerificationType::Integer,
                FrameValue::Float => VerificationType::Float,
                FrameValue::Double => VerificationType::Double,
                FrameValue::Long => VerificationType::Long,
                FrameValue::Null => VerificationType::Null,
                FrameValue::UninitializedThis => VerificationType::UninitializedThis,
                FrameValue::Object(name) => VerificationType::Object {
                    cpool_index: pool.class(name)?,
                },
                FrameValue::Uninitialized(label) => VerificationType::Uninitialized {
                    offset: layout.index(*label)?,
                },
            })
        })
        .collect()
}

/// Encodes frames, keyed by instruction index, with the smallest frame type
/// that expresses each one relative to its predecessor.
fn stack_map_table(
    frames: &BTreeMap<usize, &Frame>,
    initial: Vec<FrameValue>,
    layout: &Layout,
    pool: &mut PoolBuilder,
) -> Result<Vec<StackFrame>, CodecError> {
    let mut out = Vec::with_capacity(frames.len());
    let mut previous_locals = initial;
    let mut previous: Option<usize> = None;
    for (at, frame) in frames {
        let delta = match previous {
            None => *at,
            Some(prev) => at - prev - 1,
        };
        let offset_delta = count(delta, "instructions between frames")?;
        let locals = &frame.locals;
        let same_locals = *locals == previous_locals;
        let old = previous_locals.len();

        let encoded = if frame.stack.is_empty() && same_locals {
            if delta < SAME_LOCALS_1_STACK_ITEM as usize {
                StackFrame::SameFrame {
                    frame_type: delta as u8,
                }
            } else {
                StackFrame::SameFrameExtended {
                    frame_type: SAME_FRAME_EXTENDED,
                    offset_delta,
                }
            }
        } else if frame.stack.len() == 1 && same_locals {
            let stack = verification_types(&frame.stack, layout, pool)?;
            if delta < SAME_LOCALS_1_STACK_ITEM as usize {
                StackFrame::SameLocals1StackItemFrame {
                    frame_type: SAME_LOCALS_1_STACK_ITEM + delta as u8,
                    stack,
                }
            } else {
                StackFrame::SameLocals1StackItemFrameExtended {
                    frame_type: SAME_LOCALS_1_STACK_ITEM_EXTENDED,
                    offset_delta,
                    stack,
                }
            }
        } else if frame.stack.is_empty()
            && locals.len() < old
            && old - locals.len() <= 3
            && previous_locals.starts_with(locals)
        {
            StackFrame::ChopFrame {
                frame_type: SAME_FRAME_EXTENDED - (old - locals.len()) as u8,
                offset_delta,
            }
        } else if frame.stack.is_empty()
            && locals.len() > old
            && locals.len() - old <= 3
            && locals.starts_with(&previous_locals)
        {
            StackFrame::AppendFrame {
                frame_type: SAME_FRAME_EXTENDED + (locals.len() - old) as u8,
                offset_delta,
                locals: verification_types(&locals[old..], layout, pool)?,
            }
        } else {
            StackFrame::FullFrame {
                frame_type: FULL_FRAME,
                offset_delta,
                locals: verification_types(locals, layout, pool)?,
                stack: verification_types(&frame.stack, layout, pool)?,
            }
        };
        out.push(encoded);
        previous_locals = locals.clone();
        previous = Some(*at);
    }
    Ok(out)
}

/// Resolves the instruction range of each entry, dropping inverted ones.
fn variable_ranges<'v>(
    entries: &'v [LocalVariable],
    layout: &Layout,
) -> Result<Vec<(u16, u16, &'v LocalVariable)>, CodecError> {
    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let start = layout.index(entry.start)?;
        let end = layout.index(entry.end)?;
        if end >= start {
            rows.push((start, end - start, entry));
        }
    }
    Ok(rows)
}

fn lower_annotation(annotation: &Annotation, pool: &mut PoolBuilder) -> Result<RawAnnotation, CodecError> {
    let mut elements = Vec::with_capacity(annotation.values.len());
    for (name, value) in &annotation.values {
        elements.push(AnnotationValuePair {
            name_index: pool.utf8(name)?,
            value: lower_element(value, pool)?,
        });
    }
    Ok(RawAnnotation {
        type_index: pool.utf8(&annotation.desc)?,
        elements,
    })
}

fn lower_annotations(
    annotations: &[Annotation],
    pool: &mut PoolBuilder,
) -> Result<Vec<RawAnnotation>, CodecError> {
    annotations.iter().map(|a| lower_annotation(a, pool)).collect()
}

fn lower_element(value: &ElementValue, pool: &mut PoolBuilder) -> Result<AnnotationElement, CodecError> {
    use AnnotationElement as E;
    Ok(match value {
        ElementValue::Byte(v) => E::Byte {
            const_value_index: pool.integer(*v)?,
        },
        ElementValue::Char(v) => E::Char {
            const_value_index: pool.integer(*v)?,
        },
        ElementValue::Short(v) => E::Short {
            const_value_index: pool.integer(*v)?,
        },
        ElementValue::Boolean(v) => E::Boolean {
            const_value_index: pool.integer(*v)?,
        },
        ElementValue::Int(v) => E::Int {
            const_value_index: pool.integer(*v)?,
        },
        ElementValue::Long(v) => E::Long {
            const_value_index: pool.long(*v)?,
        },
        ElementValue::Float(bits) => E::Float {
            const_value_index: pool.float(*bits)?,
        },
        ElementValue::Double(bits) => E::Double {
            const_value_index: pool.double(*bits)?,
        },
        ElementValue::String(value) => E::String {
            const_value_index: pool.utf8(value)?,
        },
        ElementValue::Enum { desc, name } => E::Enum {
            type_name_index: pool.utf8(desc)?,
            const_name_index: pool.utf8(name)?,
        },
        ElementValue::Class(desc) => E::Class {
            class_info_index: pool.utf8(desc)?,
        },
        ElementValue::Annotation(annotation) => E::Annotation {
            annotation: lower_annotation(annotation, pool)?,
        },
        ElementValue::Array(values) => E::Array {
            values: values
                .iter()
                .map(|value| lower_element(value, pool))
                .collect::<Result<_, _>>()?,
        },
    })
}

fn lower_attribute(attribute: &Attribute, pool: &mut PoolBuilder) -> Result<RawAttribute, CodecError> {
    Ok(match attribute {
        Attribute::Annotations {
            visible: true,
            annotations,
        } => RawAttribute::RuntimeVisibleAnnotations {
            name_index: pool.utf8("RuntimeVisibleAnnotations")?,
            annotations: lower_annotations(annotations, pool)?,
        },
        Attribute::Annotations {
            visible: false,
            annotations,
        } => RawAttribute::RuntimeInvisibleAnnotations {
            name_index: pool.utf8("RuntimeInvisibleAnnotations")?,
            annotations: lower_annotations(annotations, pool)?,
        },
        Attribute::ParameterAnnotations {
            visible,
            parameters,
        } => {
            let parameter_annotations = parameters
                .iter()
                .map(|annotations| {
                    Ok(ParameterAnnotation {
                        annotations: lower_annotations(annotations, pool)?,
                    })
                })
                .collect::<Result<Vec<_>, CodecError>>()?;
            if *visible {
                RawAttribute::RuntimeVisibleParameterAnnotations {
                    name_index: pool.utf8("RuntimeVisibleParameterAnnotations")?,
                    parameter_annotations,
                }
            } else {
                RawAttribute::RuntimeInvisibleParameterAnnotations {
                    name_index: pool.utf8("RuntimeInvisibleParameterAnnotations")?,
                    parameter_annotations,
                }
            }
        }
        Attribute::AnnotationDefault(value) => RawAttribute::AnnotationDefault {
            name_index: pool.utf8("AnnotationDefault")?,
            element: lower_element(value, pool)?,
        },
        Attribute::Opaque(raw) => raw.clone(),
    })
}

fn signature_attribute(signature: &str, pool: &mut PoolBuilder) -> Result<RawAttribute, CodecError> {
    Ok(RawAttribute::Signature {
        name_index: pool.utf8("Signature")?,
        signature_index: pool.utf8(signature)?,
    })
}

impl<'a> ClassWriter<'a> {
    pub fn new(mode: ComputeMode, resolver: &'a dyn TypeResolver) -> Self {
        Self { mode, resolver }
    }

    /// Serializes `doc`. Opaque attributes keep their pool indices, so when
    /// any are present the new pool starts as a copy of the one they were
    /// read from.
    pub fn write(&self, doc: &ClassDocument) -> Result<Vec<u8>, CodecError> {
        let mut pool = match &doc.source_pool {
            Some(source) if doc.has_opaque_attributes() => PoolBuilder::seeded(source),
            _ => PoolBuilder::new(),
        };

        let this_class = pool.class(&doc.name)?;
        let super_class = pool.optional_class(doc.super_name.as_deref())?;
        count(doc.interfaces.len(), "interfaces")?;
        let interfaces = doc
            .interfaces
            .iter()
            .map(|interface| pool.class(interface))
            .collect::<Result<Vec<_>, _>>()?;

        count(doc.fields.len(), "fields")?;
        let mut fields = Vec::with_capacity(doc.fields.len());
        for field in &doc.fields {
            fields.push(self.write_field(field, &mut pool)?);
        }
        count(doc.methods.len(), "methods")?;
        let mut methods = Vec::with_capacity(doc.methods.len());
        for method in &doc.methods {
            methods.push(self.write_method(doc, method, &mut pool)?);
        }

        let mut attributes = class_attributes(doc, &mut pool)?;
        if pool.has_bootstrap_methods() {
            attributes.push(RawAttribute::BootstrapMethods {
                name_index: pool.utf8("BootstrapMethods")?,
                methods: pool.bootstrap_methods(),
            });
        }

        let class_file = ClassFile {
            version: Version::from(doc.major_version, doc.minor_version)?,
            constant_pool: pool.finish(),
            access_flags: ClassAccessFlags::from_bits_truncate(doc.access),
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        let mut out = Vec::new();
        class_file.to_bytes(&mut out)?;
        Ok(out)
    }

    fn write_field(&self, field: &FieldNode, pool: &mut PoolBuilder) -> Result<Field, CodecError> {
        let mut attributes = Vec::new();
        if let Some(value) = &field.constant_value {
            attributes.push(RawAttribute::ConstantValue {
                name_index: pool.utf8("ConstantValue")?,
                constant_value_index: pool.constant(value)?,
            });
        }
        if let Some(signature) = &field.signature {
            attributes.push(signature_attribute(signature, pool)?);
        }
        for attribute in &field.attributes {
            attributes.push(lower_attribute(attribute, pool)?);
        }
        Ok(Field {
            access_flags: FieldAccessFlags::from_bits_truncate(field.access),
            name_index: pool.utf8(&field.name)?,
            descriptor_index: pool.utf8(&field.desc)?,
            field_type: descriptor::field_type(&field.desc)?,
            attributes,
        })
    }

    fn write_method(
        &self,
        doc: &ClassDocument,
        method: &MethodNode,
        pool: &mut PoolBuilder,
    ) -> Result<Method, CodecError> {
        let name_index = pool.utf8(&method.name)?;
        let descriptor_index = pool.utf8(&method.desc)?;
        let mut attributes = Vec::new();
        if let Some(code) = &method.code {
            attributes.push(self.write_code(doc, method, code, pool)?);
        }
        if !method.exceptions.is_empty() {
            count(method.exceptions.len(), "exceptions")?;
            let exception_indexes = method
                .exceptions
                .iter()
                .map(|exception| pool.class(exception))
                .collect::<Result<Vec<_>, _>>()?;
            attributes.push(RawAttribute::Exceptions {
                name_index: pool.utf8("Exceptions")?,
                exception_indexes,
            });
        }
        if let Some(signature) = &method.signature {
            attributes.push(signature_attribute(signature, pool)?);
        }
        for attribute in &method.attributes {
            attributes.push(lower_attribute(attribute, pool)?);
        }
        Ok(Method {
            access_flags: MethodAccessFlags::from_bits_truncate(method.access),
            name_index,
            descriptor_index,
            attributes,
        })
    }

    fn write_code(
        &self,
        doc: &ClassDocument,
        method: &MethodNode,
        source: &Code,
        pool: &mut PoolBuilder,
    ) -> Result<RawAttribute, CodecError> {
        let mut code = source.clone();
        widen_conditionals(&mut code, pool)?;
        match self.mode {
            ComputeMode::Frames => {
                analysis::compute_frames(&doc.name, method, &mut code, self.resolver)?;
            }
            ComputeMode::Maxs => {
                let (max_stack, max_locals) = analysis::compute_maxs(&doc.name, method, &code);
                code.max_stack = max_stack;
                code.max_locals = max_locals;
            }
        }

        let layout = Layout::compute(&code.instructions, pool)?;
        if let Some(i) = layout.overflowing(&code.instructions)?.first() {
            return Err(CodecError::Limit(format!(
                "branch at offset {} in {}.{} is out of range",
                layout.offsets[*i], doc.name, method.name
            )));
        }
        if layout.len > MAX_CODE_LENGTH {
            return Err(CodecError::Limit(format!(
                "{}.{}{} has {} bytes of code",
                doc.name, method.name, method.desc, layout.len
            )));
        }
        let instructions = lower(&code.instructions, &layout, pool)?;

        let mut exception_table = Vec::with_capacity(code.try_catch.len());
        for tc in &code.try_catch {
            let start = layout.index(tc.start)?;
            let end = layout.index(tc.end)?;
            if start >= end {
                continue;
            }
            exception_table.push(ExceptionTableEntry {
                range_pc: start..end,
                handler_pc: layout.index(tc.handler)?,
                catch_type: pool.optional_class(tc.catch_type.as_deref())?,
            });
        }
        count(exception_table.len(), "exception handlers")?;

        let mut attributes = Vec::new();
        let mut line_numbers = Vec::new();
        let mut frames = BTreeMap::new();
        for (i, insn) in code.instructions.iter().enumerate() {
            match insn {
                Insn::LineNumber { line, start } => line_numbers.push(LineNumber {
                    start_pc: layout.index(*start)?,
                    line_number: *line,
                }),
                Insn::Frame(frame) if layout.indices[i] < layout.count => {
                    frames.insert(layout.indices[i], frame);
                }
                _ => {}
            }
        }
        if !line_numbers.is_empty() {
            attributes.push(RawAttribute::LineNumberTable {
                name_index: pool.utf8("LineNumberTable")?,
                line_numbers,
            });
        }
        if !code.local_variables.is_empty() {
            let mut variables = Vec::new();
            for (start_pc, length, entry) in variable_ranges(&code.local_variables, &layout)? {
                variables.push(LocalVariableEntry {
                    start_pc,
                    length,
                    name_index: pool.utf8(&entry.name)?,
                    descriptor_index: pool.utf8(&entry.desc)?,
                    index: entry.index,
                });
            }
            attributes.push(RawAttribute::LocalVariableTable {
                name_index: pool.utf8("LocalVariableTable")?,
                variables,
            });
        }
        if !code.local_variable_types.is_empty() {
            let mut variable_types = Vec::new();
            for (start_pc, length, entry) in variable_ranges(&code.local_variable_types, &layout)? {
                variable_types.push(LocalVariableTypeEntry {
                    start_pc,
                    length,
                    name_index: pool.utf8(&entry.name)?,
                    signature_index: pool.utf8(&entry.desc)?,
                    index: entry.index,
                });
            }
            attributes.push(RawAttribute::LocalVariableTypeTable {
                name_index: pool.utf8("LocalVariableTypeTable")?,
                variable_types,
            });
        }
        if doc.major_version >= V1_6 && !frames.is_empty() {
            let initial =
                analysis::initial_locals(&doc.name, method.access, &method.name, &method.desc)?;
            let frames = stack_map_table(&frames, initial, &layout, pool)?;
            attributes.push(RawAttribute::StackMapTable {
                name_index: pool.utf8("StackMapTable")?,
                frames,
            });
        }

        Ok(RawAttribute::Code {
            name_index: pool.utf8("Code")?,
            max_stack: code.max_stack,
            max_locals: code.max_locals,
            code: instructions,
            exception_table,
            attributes,
        })
    }
}

fn class_attributes(doc: &ClassDocument, pool: &mut PoolBuilder) -> Result<Vec<RawAttribute>, CodecError> {
    let mut attributes = Vec::new();
    if let Some(source_file) = &doc.source_file {
        attributes.push(RawAttribute::SourceFile {
            name_index: pool.utf8("SourceFile")?,
            source_file_index: pool.utf8(source_file)?,
        });
    }
    if let Some(signature) = &doc.signature {
        attributes.push(signature_attribute(signature, pool)?);
    }
    if !doc.inner_classes.is_empty() {
        count(doc.inner_classes.len(), "inner classes")?;
        let mut classes = Vec::with_capacity(doc.inner_classes.len());
        for inner in &doc.inner_classes {
            classes.push(RawInnerClass {
                class_info_index: pool.class(&inner.name)?,
                outer_class_info_index: pool.optional_class(inner.outer_name.as_deref())?,
                name_index: match &inner.inner_name {
                    Some(name) => pool.utf8(name)?,
                    None => 0,
                },
                access_flags: NestedClassAccessFlags::from_bits_truncate(inner.access),
            });
        }
        attributes.push(RawAttribute::InnerClasses {
            name_index: pool.utf8("InnerClasses")?,
            classes,
        });
    }
    if let Some(enclosing) = &doc.enclosing_method {
        attributes.push(RawAttribute::EnclosingMethod {
            name_index: pool.utf8("EnclosingMethod")?,
            class_index: pool.class(&enclosing.owner)?,
            method_index: match &enclosing.method {
                Some((name, desc)) => pool.name_and_type(name, desc)?,
                None => 0,
            },
        });
    }
    if let Some(host) = &doc.nest_host {
        attributes.push(RawAttribute::NestHost {
            name_index: pool.utf8("NestHost")?,
            host_class_index: pool.class(host)?,
        });
    }
    if !doc.nest_members.is_empty() {
        let class_indexes = doc
            .nest_members
            .iter()
            .map(|class| pool.class(class))
            .collect::<Result<Vec<_>, _>>()?;
        attributes.push(RawAttribute::NestMembers {
            name_index: pool.utf8("NestMembers")?,
            class_indexes,
        });
    }
    if !doc.permitted_subclasses.is_empty() {
        let class_indexes = doc
            .permitted_subclasses
            .iter()
            .map(|class| pool.class(class))
            .collect::<Result<Vec<_>, _>>()?;
        attributes.push(RawAttribute::PermittedSubclasses {
            name_index: pool.utf8("PermittedSubclasses")?,
            class_indexes,
        });
    }
    for attribute in &doc.attributes {
        attributes.push(lower_attribute(attribute, pool)?);
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::super::analysis::JdkOnly;
    use super::super::{ParseMode, TryCatch, parse};
    use super::*;
    use ristretto_classfile::attributes::Attribute as RawAttribute;

    fn method(access: u16, name: &str, desc: &str, code: Code) -> MethodNode {
        MethodNode {
            access,
            name: name.into(),
            desc: desc.into(),
            signature: None,
            exceptions: Vec::new(),
            code: Some(code),
            attributes: Vec::new(),
        }
    }

    fn constructor() -> MethodNode {
        let mut code = Code::default();
        code.instructions = vec![
            Insn::Var { opcode: ALOAD, var: 0 },
            Insn::Method {
                opcode: INVOKESPECIAL,
                owner: "java/lang/Object".into(),
                name: "<init>".into(),
                desc: "()V".into(),
                is_interface: false,
            },
            Insn::Simple(RETURN),
        ];
        method(ACC_PUBLIC, "<init>", "()V", code)
    }

    /// `static int sum(int n) { int s = 0; for (int i = 0; i < n; i++) s += i; return s; }`
    fn sum() -> MethodNode {
        let mut code = Code::default();
        let top = code.new_label();
        let done = code.new_label();
        code.instructions = vec![
            Insn::Simple(ICONST_0),
            Insn::Var { opcode: ISTORE, var: 1 },
            Insn::Simple(ICONST_0),
            Insn::Var { opcode: ISTORE, var: 2 },
            Insn::Label(top),
            Insn::Var { opcode: ILOAD, var: 2 },
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::Jump { opcode: IF_ICMPGE, target: done },
            Insn::Var { opcode: ILOAD, var: 1 },
            Insn::Var { opcode: ILOAD, var: 2 },
            Insn::Simple(IADD),
            Insn::Var { opcode: ISTORE, var: 1 },
            Insn::Iinc { var: 2, increment: 1 },
            Insn::Jump { opcode: GOTO, target: top },
            Insn::Label(done),
            Insn::Var { opcode: ILOAD, var: 1 },
            Insn::Simple(IRETURN),
        ];
        method(ACC_PUBLIC | ACC_STATIC, "sum", "(I)I", code)
    }

    /// `static String guarded() { try { return "ok"; } catch (RuntimeException e) { return null; } }`
    fn guarded() -> MethodNode {
        let mut code = Code::default();
        let start = code.new_label();
        let end = code.new_label();
        let handler = code.new_label();
        code.instructions = vec![
            Insn::Label(start),
            Insn::Ldc(Constant::String("ok".into())),
            Insn::Label(end),
            Insn::Simple(ARETURN),
            Insn::Label(handler),
            Insn::Var { opcode: ASTORE, var: 0 },
            Insn::Simple(ACONST_NULL),
            Insn::Simple(ARETURN),
        ];
        code.try_catch.push(TryCatch {
            start,
            end,
            handler,
            catch_type: Some("java/lang/RuntimeException".into()),
        });
        method(ACC_STATIC, "guarded", "()Ljava/lang/String;", code)
    }

    fn sample(methods: Vec<MethodNode>) -> ClassDocument {
        ClassDocument {
            major_version: V1_8,
            access: ACC_PUBLIC | ACC_SUPER,
            name: "app/Sample".into(),
            super_name: Some("java/lang/Object".into()),
            source_file: Some("Sample.java".into()),
            methods,
            ..ClassDocument::default()
        }
    }

    fn real_opcodes(code: &Code) -> Vec<u8> {
        code.instructions.iter().filter_map(Insn::opcode).collect()
    }

    #[test]
    fn written_class_parses_back() {
        let doc = sample(vec![constructor(), sum(), guarded()]);
        let bytes = ClassWriter::new(ComputeMode::Frames, &JdkOnly).write(&doc).unwrap();
        let parsed = parse(&bytes, ParseMode::Full).unwrap();

        assert_eq!(parsed.name, "app/Sample");
        assert_eq!(parsed.source_file.as_deref(), Some("Sample.java"));
        assert_eq!(parsed.methods.len(), 3);
        let sum = parsed.methods[1].code.as_ref().unwrap();
        assert_eq!(real_opcodes(sum), real_opcodes(doc.methods[1].code.as_ref().unwrap()));
        assert_eq!((sum.max_stack, sum.max_locals), (2, 3));
        let frames = sum
            .instructions
            .iter()
            .filter(|i| matches!(i, Insn::Frame(_)))
            .count();
        assert_eq!(frames, 2);

        let guarded = parsed.methods[2].code.as_ref().unwrap();
        assert_eq!(guarded.try_catch.len(), 1);
        assert_eq!(
            guarded.try_catch[0].catch_type.as_deref(),
            Some("java/lang/RuntimeException")
        );
    }

    #[test]
    fn rewriting_a_written_class_is_stable() {
        let writer = ClassWriter::new(ComputeMode::Frames, &JdkOnly);
        let first = writer.write(&sample(vec![constructor(), sum(), guarded()])).unwrap();
        let second = writer.write(&parse(&first, ParseMode::Full).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn far_conditional_is_rewritten_around_goto() {
        let mut code = Code::default();
        let end = code.new_label();
        code.instructions.push(Insn::Var { opcode: ILOAD, var: 0 });
        code.instructions.push(Insn::Jump { opcode: IFEQ, target: end });
        for _ in 0..17_000 {
            code.instructions.push(Insn::Simple(ICONST_0));
            code.instructions.push(Insn::Simple(POP));
        }
        code.instructions.push(Insn::Label(end));
        code.instructions.push(Insn::Simple(RETURN));
        let doc = sample(vec![method(ACC_STATIC, "far", "(I)V", code)]);

        let bytes = ClassWriter::new(ComputeMode::Frames, &JdkOnly).write(&doc).unwrap();
        let parsed = parse(&bytes, ParseMode::Full).unwrap();
        let opcodes = real_opcodes(parsed.methods[0].code.as_ref().unwrap());
        assert_eq!(&opcodes[..3], &[ILOAD, IFNE, GOTO]);
    }

    #[test]
    fn maxs_mode_survives_unknown_types() {
        // Merges two classes the resolver has never heard of.
        let mut code = Code::default();
        let other = code.new_label();
        let join = code.new_label();
        code.instructions = vec![
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::Jump { opcode: IFEQ, target: other },
            Insn::Simple(ACONST_NULL),
            Insn::Type { opcode: CHECKCAST, desc: "x/A".into() },
            Insn::Jump { opcode: GOTO, target: join },
            Insn::Label(other),
            Insn::Simple(ACONST_NULL),
            Insn::Type { opcode: CHECKCAST, desc: "x/B".into() },
            Insn::Label(join),
            Insn::Simple(ARETURN),
        ];
        let doc = sample(vec![method(ACC_STATIC, "pick", "(Z)Ljava/lang/Object;", code)]);

        let err = ClassWriter::new(ComputeMode::Frames, &JdkOnly).write(&doc).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(_)));

        let bytes = ClassWriter::new(ComputeMode::Maxs, &JdkOnly).write(&doc).unwrap();
        let parsed = parse(&bytes, ParseMode::Full).unwrap();
        let code = parsed.methods[0].code.as_ref().unwrap();
        assert_eq!((code.max_stack, code.max_locals), (1, 1));
    }

    #[test]
    fn opaque_attributes_keep_their_pool_indices() {
        let doc = sample(vec![constructor()]);
        let bytes = ClassWriter::new(ComputeMode::Frames, &JdkOnly).write(&doc).unwrap();
        let mut parsed = parse(&bytes, ParseMode::Full).unwrap();
        let source = parsed.source_pool.as_mut().unwrap();
        let pointed = (1..u16::MAX)
            .find(|i| source.utf8(*i).is_ok_and(|s| s == "Sample.java"))
            .unwrap();
        let name_index = source.pool.add_utf8("Custom").unwrap();
        parsed.attributes.push(Attribute::Opaque(RawAttribute::Unknown {
            name_index,
            info: pointed.to_be_bytes().to_vec(),
        }));
        parsed.source_file = None;

        let rewritten = ClassWriter::new(ComputeMode::Frames, &JdkOnly).write(&parsed).unwrap();
        let reparsed = parse(&rewritten, ParseMode::Full).unwrap();
        assert!(reparsed.source_file.is_none());
        let Some(Attribute::Opaque(RawAttribute::Unknown { info, .. })) = reparsed.attributes.first() else {
            panic!("custom attribute lost: {:?}", reparsed.attributes);
        };
        let index = u16::from_be_bytes([info[0], info[1]]);
        assert_eq!(reparsed.source_pool.unwrap().utf8(index).unwrap(), "Sample.java");
    }

    fn tag(values: Vec<(String, ElementValue)>) -> Annotation {
        Annotation {
            desc: "Lapp/Tag;".into(),
            values,
        }
    }

    #[test]
    fn annotations_survive_a_round_trip() {
        let class_tag = tag(vec![
            ("value".into(), ElementValue::Class("Lapp/Helper;".into())),
            (
                "mode".into(),
                ElementValue::Enum {
                    desc: "Lapp/Mode;".into(),
                    name: "FAST".into(),
                },
            ),
            ("ids".into(), ElementValue::Array(vec![ElementValue::Int(1), ElementValue::Long(2)])),
            ("ratio".into(), ElementValue::Double(0.5f64.to_bits())),
            ("nested".into(), ElementValue::Annotation(tag(Vec::new()))),
            ("note".into(), ElementValue::String("kept".into())),
        ]);
        let mut run = constructor();
        run.attributes.push(Attribute::ParameterAnnotations {
            visible: false,
            parameters: Vec::new(),
        });
        let mut doc = sample(vec![run]);
        doc.attributes.push(Attribute::Annotations {
            visible: true,
            annotations: vec![class_tag.clone()],
        });
        doc.fields.push(FieldNode {
            access: ACC_PRIVATE,
            name: "helper".into(),
            desc: "Ljava/lang/Class;".into(),
            signature: None,
            constant_value: None,
            attributes: vec![Attribute::Annotations {
                visible: false,
                annotations: vec![tag(vec![("value".into(), ElementValue::Boolean(1))])],
            }],
        });

        let bytes = ClassWriter::new(ComputeMode::Frames, &JdkOnly).write(&doc).unwrap();
        let parsed = parse(&bytes, ParseMode::Full).unwrap();
        assert!(!parsed.has_opaque_attributes());
        match &parsed.attributes[..] {
            [Attribute::Annotations { visible: true, annotations }] => {
                assert_eq!(annotations, &vec![class_tag])
            }
            other => panic!("unexpected class attributes {other:?}"),
        }
        match &parsed.fields[0].attributes[..] {
            [Attribute::Annotations { visible: false, annotations }] => {
                assert_eq!(annotations[0].values, vec![("value".to_string(), ElementValue::Boolean(1))])
            }
            other => panic!("unexpected field attributes {other:?}"),
        }
        assert!(matches!(
            &parsed.methods[0].attributes[..],
            [Attribute::ParameterAnnotations { visible: false, .. }]
        ));
    }

    #[test]
    fn wide_variables_and_switches_round_trip() {
        let mut code = Code::default();
        let one = code.new_label();
        let other = code.new_label();
        let done = code.new_label();
        code.instructions = vec![
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::Var { opcode: ISTORE, var: 300 },
            Insn::Iinc { var: 300, increment: 1000 },
            Insn::Var { opcode: ILOAD, var: 300 },
            Insn::LookupSwitch {
                default: other,
                pairs: vec![(10, one), (-3, other)],
            },
            Insn::Label(one),
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::TableSwitch {
                low: 0,
                high: 1,
                default: done,
                targets: vec![other, done],
            },
            Insn::Label(other),
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::Int { opcode: NEWARRAY, operand: T_LONG },
            Insn::Simple(POP),
            Insn::Label(done),
            Insn::Simple(RETURN),
        ];
        let doc = sample(vec![method(ACC_STATIC, "pick", "(I)V", code)]);

        let bytes = ClassWriter::new(ComputeMode::Frames, &JdkOnly).write(&doc).unwrap();
        let parsed = parse(&bytes, ParseMode::Full).unwrap();
        let code = parsed.methods[0].code.as_ref().unwrap();
        let real: Vec<&Insn> = code.instructions.iter().filter(|i| !i.is_pseudo()).collect();
        assert!(matches!(real[1], Insn::Var { opcode: ISTORE, var: 300 }));
        assert!(matches!(real[2], Insn::Iinc { var: 300, increment: 1000 }));
        match real[4] {
            Insn::LookupSwitch { pairs, .. } => {
                assert_eq!(pairs.iter().map(|(key, _)| *key).collect::<Vec<_>>(), vec![-3, 10])
            }
            other => panic!("expected lookupswitch, got {other:?}"),
        }
        assert!(matches!(real[8], Insn::Int { opcode: NEWARRAY, operand: T_LONG }));
        assert_eq!(code.max_locals, 301);
    }
}
