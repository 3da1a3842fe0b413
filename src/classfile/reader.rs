//! Lifts a `ristretto_classfile` class into the symbolic model.

use std::collections::HashMap;
use std::io::Cursor;

use ristretto_classfile::ClassFile;
use ristretto_classfile::attributes::{
    Annotation as RawAnnotation, AnnotationElement, Attribute as RawAttribute, ExceptionTableEntry,
    Instruction, StackFrame, VerificationType,
};

use super::analysis::initial_locals;
use super::constant_pool::SourcePool;
use super::instructions::{array_type_code, jump_operand, simple_opcode, var_operand};
use super::opcodes::*;
use super::{
    Annotation, Attribute, ClassDocument, Code, CodecError, Constant, ElementValue,
    EnclosingMethod, FieldNode, Frame, FrameValue, InnerClass, Insn, Label, LocalVariable,
    MethodNode, TryCatch,
};

/// How much of a class to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Everything, including method bodies, debug tables, frames and
    /// annotations.
    Full,
    /// Names, hierarchy and member signatures only. Used for library
    /// classes that are consulted for type resolution and never written.
    StructureOnly,
}

/// Parses a class file into a [`ClassDocument`].
pub fn parse(bytes: &[u8], mode: ParseMode) -> Result<ClassDocument, CodecError> {
    let class_file = ClassFile::from_bytes(&mut Cursor::new(bytes.to_vec()))?;
    let full = mode == ParseMode::Full;

    let bootstrap_methods = class_file
        .attributes
        .iter()
        .find_map(|attribute| match attribute {
            RawAttribute::BootstrapMethods { methods, .. } => Some(methods.clone()),
            _ => None,
        })
        .unwrap_or_default();
    let ClassFile {
        version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
        ..
    } = class_file;
    let pool = SourcePool::new(constant_pool, bootstrap_methods);

    let mut doc = ClassDocument {
        minor_version: version.minor(),
        major_version: version.major(),
        access: access_flags.bits(),
        name: pool.class_name(this_class)?.to_string(),
        super_name: pool.optional_class_name(super_class)?,
        ..ClassDocument::default()
    };
    for interface in interfaces {
        doc.interfaces.push(pool.class_name(interface)?.to_string());
    }

    for field in fields {
        let mut node = FieldNode {
            access: field.access_flags.bits(),
            name: pool.utf8(field.name_index)?.to_string(),
            desc: pool.utf8(field.descriptor_index)?.to_string(),
            signature: None,
            constant_value: None,
            attributes: Vec::new(),
        };
        for attribute in field.attributes {
            match attribute {
                RawAttribute::ConstantValue {
                    constant_value_index,
                    ..
                } => node.constant_value = Some(pool.constant(constant_value_index)?),
                RawAttribute::Signature {
                    signature_index, ..
                } => node.signature = Some(pool.utf8(signature_index)?.to_string()),
                other if full => node.attributes.push(lift_attribute(other, &pool)?),
                _ => {}
            }
        }
        doc.fields.push(node);
    }

    for method in methods {
        let mut node = MethodNode {
            access: method.access_flags.bits(),
            name: pool.utf8(method.name_index)?.to_string(),
            desc: pool.utf8(method.descriptor_index)?.to_string(),
            signature: None,
            exceptions: Vec::new(),
            code: None,
            attributes: Vec::new(),
        };
        let mut body = None;
        for attribute in method.attributes {
            match attribute {
                RawAttribute::Code {
                    max_stack,
                    max_locals,
                    code,
                    exception_table,
                    attributes,
                    ..
                } => {
                    if full {
                        body = Some((max_stack, max_locals, code, exception_table, attributes));
                    }
                }
                RawAttribute::Exceptions {
                    exception_indexes, ..
                } => {
                    for index in exception_indexes {
                        node.exceptions.push(pool.class_name(index)?.to_string());
                    }
                }
                RawAttribute::Signature {
                    signature_index, ..
                } => node.signature = Some(pool.utf8(signature_index)?.to_string()),
                other if full => node.attributes.push(lift_attribute(other, &pool)?),
                _ => {}
            }
        }
        if let Some((max_stack, max_locals, code, exception_table, attributes)) = body {
            let mut lifted = lift_code(&code, &exception_table, &attributes, &pool, &doc.name, &node)?;
            lifted.max_stack = max_stack;
            lifted.max_locals = max_locals;
            node.code = Some(lifted);
        }
        doc.methods.push(node);
    }

    for attribute in attributes {
        match attribute {
            RawAttribute::SourceFile {
                source_file_index, ..
            } => {
                if full {
                    doc.source_file = Some(pool.utf8(source_file_index)?.to_string());
                }
            }
            RawAttribute::Signature {
                signature_index, ..
            } => doc.signature = Some(pool.utf8(signature_index)?.to_string()),
            RawAttribute::InnerClasses { classes, .. } => {
                for inner in classes {
                    doc.inner_classes.push(InnerClass {
                        name: pool.class_name(inner.class_info_index)?.to_string(),
                        outer_name: pool.optional_class_name(inner.outer_class_info_index)?,
                        inner_name: pool.optional_utf8(inner.name_index)?,
                        access: inner.access_flags.bits(),
                    });
                }
            }
            RawAttribute::EnclosingMethod {
                class_index,
                method_index,
                ..
            } => {
                let method = if method_index == 0 {
                    None
                } else {
                    let (name, desc) = pool.name_and_type(method_index)?;
                    Some((name.to_string(), desc.to_string()))
                };
                doc.enclosing_method = Some(EnclosingMethod {
                    owner: pool.class_name(class_index)?.to_string(),
                    method,
                });
            }
            RawAttribute::NestHost {
                host_class_index, ..
            } => doc.nest_host = Some(pool.class_name(host_class_index)?.to_string()),
            RawAttribute::NestMembers { class_indexes, .. } => {
                for index in class_indexes {
                    doc.nest_members.push(pool.class_name(index)?.to_string());
                }
            }
            RawAttribute::PermittedSubclasses { class_indexes, .. } => {
                for index in class_indexes {
                    doc.permitted_subclasses.push(pool.class_name(index)?.to_string());
                }
            }
            RawAttribute::BootstrapMethods { .. } => {}
            other if full => doc.attributes.push(lift_attribute(other, &pool)?),
            _ => {}
        }
    }

    if full {
        doc.source_pool = Some(pool);
    }
    Ok(doc)
}

fn lift_attribute(attribute: RawAttribute, pool: &SourcePool) -> Result<Attribute, CodecError> {
    let lift_all = |annotations: &[RawAnnotation]| -> Result<Vec<Annotation>, CodecError> {
        annotations.iter().map(|a| lift_annotation(a, pool)).collect()
    };
    let lifted = match &attribute {
        RawAttribute::RuntimeVisibleAnnotations { annotations, .. } => Attribute::Annotations {
            visible: true,
            annotations: lift_all(annotations)?,
        },
        RawAttribute::RuntimeInvisibleAnnotations { annotations, .. } => Attribute::Annotations {
            visible: false,
            annotations: lift_all(annotations)?,
        },
        RawAttribute::RuntimeVisibleParameterAnnotations {
            parameter_annotations,
            ..
        } => Attribute::ParameterAnnotations {
            visible: true,
            parameters: parameter_annotations
                .iter()
                .map(|p| lift_all(&p.annotations))
                .collect::<Result<_, _>>()?,
        },
        RawAttribute::RuntimeInvisibleParameterAnnotations {
            parameter_annotations,
            ..
        } => Attribute::ParameterAnnotations {
            visible: false,
            parameters: parameter_annotations
                .iter()
                .map(|p| lift_all(&p.annotations))
                .collect::<Result<_, _>>()?,
        },
        RawAttribute::AnnotationDefault { element, .. } => {
            Attribute::AnnotationDefault(lift_element(element, pool)?)
        }
        _ => return Ok(Attribute::Opaque(attribute)),
    };
    Ok(lifted)
}

fn lift_annotation(annotation: &RawAnnotation, pool: &SourcePool) -> Result<Annotation, CodecError> {
    let mut values = Vec::with_capacity(annotation.elements.len());
    for pair in &annotation.elements {
        values.push((
            pool.utf8(pair.name_index)?.to_string(),
            lift_element(&pair.value, pool)?,
        ));
    }
    Ok(Annotation {
        desc: pool.utf8(annotation.type_index)?.to_string(),
        values,
    })
}

fn lift_element(element: &AnnotationElement, pool: &SourcePool) -> Result<ElementValue, CodecError> {
    use AnnotationElement as E;
    Ok(match element {
        E::Byte { const_value_index } => ElementValue::Byte(pool.integer(*const_value_index)?),
        E::Char { const_value_index } => ElementValue::Char(pool.integer(*const_value_index)?),
        E::Short { const_value_index } => ElementValue::Short(pool.integer(*const_value_index)?),
        E::Boolean { const_value_index } => ElementValue::Boolean(pool.integer(*const_value_index)?),
        E::Int { const_value_index } => ElementValue::Int(pool.integer(*const_value_index)?),
        E::Long { const_value_index } => match pool.constant(*const_value_index)? {
            Constant::Long(v) => ElementValue::Long(v),
            _ => return Err(CodecError::BadConstant(*const_value_index)),
        },
        E::Float { const_value_index } => match pool.constant(*const_value_index)? {
            Constant::Float(bits) => ElementValue::Float(bits),
            _ => return Err(CodecError::BadConstant(*const_value_index)),
        },
        E::Double { const_value_index } => match pool.constant(*const_value_index)? {
            Constant::Double(bits) => ElementValue::Double(bits),
            _ => return Err(CodecError::BadConstant(*const_value_index)),
        },
        E::String { const_value_index } => {
            ElementValue::String(pool.utf8(*const_value_index)?.to_string())
        }
        E::Enum {
            type_name_index,
            const_name_index,
        } => ElementValue::Enum {
            desc: pool.utf8(*type_name_index)?.to_string(),
            name: pool.utf8(*const_name_index)?.to_string(),
        },
        E::Class { class_info_index } => ElementValue::Class(pool.utf8(*class_info_index)?.to_string()),
        E::Annotation { annotation } => ElementValue::Annotation(lift_annotation(annotation, pool)?),
        E::Array { values } => ElementValue::Array(
            values
                .iter()
                .map(|value| lift_element(value, pool))
                .collect::<Result<_, _>>()?,
        ),
    })
}

/// Instruction index to label mapping built while lifting one method body.
/// Index `len` is the position just past the last instruction.
struct Labels {
    by_index: HashMap<usize, Label>,
    next: u32,
    len: usize,
}

impl Labels {
    fn at(&mut self, index: i64) -> Result<Label, CodecError> {
        if index < 0 || index as usize > self.len {
            return Err(CodecError::BadOffset(index.max(0) as usize));
        }
        let next = &mut self.next;
        Ok(*self.by_index.entry(index as usize).or_insert_with(|| {
            let label = Label(*next);
            *next += 1;
            label
        }))
    }
}

fn lift_code(
    code: &[Instruction],
    exception_table: &[ExceptionTableEntry],
    attributes: &[RawAttribute],
    pool: &SourcePool,
    owner: &str,
    method: &MethodNode,
) -> Result<Code, CodecError> {
    let mut labels = Labels {
        by_index: HashMap::new(),
        next: 0,
        len: code.len(),
    };

    let mut lifted = Vec::with_capacity(code.len());
    for (index, instruction) in code.iter().enumerate() {
        lifted.push(lift_instruction(instruction, index, pool, &mut labels)?);
    }

    let mut try_catch = Vec::with_capacity(exception_table.len());
    for entry in exception_table {
        try_catch.push(TryCatch {
            start: labels.at(entry.range_pc.start as i64)?,
            end: labels.at(entry.range_pc.end as i64)?,
            handler: labels.at(entry.handler_pc as i64)?,
            catch_type: pool.optional_class_name(entry.catch_type)?,
        });
    }

    let mut lines: Vec<(usize, u16)> = Vec::new();
    let mut local_variables = Vec::new();
    let mut local_variable_types = Vec::new();
    let mut frames: Vec<(usize, Frame)> = Vec::new();
    for attribute in attributes {
        match attribute {
            RawAttribute::LineNumberTable { line_numbers, .. } => {
                for entry in line_numbers {
                    labels.at(entry.start_pc as i64)?;
                    lines.push((entry.start_pc as usize, entry.line_number));
                }
            }
            RawAttribute::LocalVariableTable { variables, .. } => {
                for entry in variables {
                    local_variables.push(LocalVariable {
                        name: pool.utf8(entry.name_index)?.to_string(),
                        desc: pool.utf8(entry.descriptor_index)?.to_string(),
                        start: labels.at(entry.start_pc as i64)?,
                        end: labels.at(entry.start_pc as i64 + entry.length as i64)?,
                        index: entry.index,
                    });
                }
            }
            RawAttribute::LocalVariableTypeTable { variable_types, .. } => {
                for entry in variable_types {
                    local_variable_types.push(LocalVariable {
                        name: pool.utf8(entry.name_index)?.to_string(),
                        desc: pool.utf8(entry.signature_index)?.to_string(),
                        start: labels.at(entry.start_pc as i64)?,
                        end: labels.at(entry.start_pc as i64 + entry.length as i64)?,
                        index: entry.index,
                    });
                }
            }
            RawAttribute::StackMapTable { frames: raw, .. } => {
                frames = lift_stack_map(raw, pool, owner, method, &mut labels)?;
            }
            _ => {}
        }
    }

    let mut instructions = Vec::with_capacity(lifted.len() + labels.by_index.len());
    let mut frames = frames.into_iter().peekable();
    for (index, insn) in lifted.into_iter().enumerate() {
        if let Some(label) = labels.by_index.get(&index) {
            instructions.push(Insn::Label(*label));
            for (_, line) in lines.iter().filter(|(pc, _)| *pc == index) {
                instructions.push(Insn::LineNumber {
                    line: *line,
                    start: *label,
                });
            }
        }
        while let Some((_, frame)) = frames.next_if(|(at, _)| *at == index) {
            instructions.push(Insn::Frame(frame));
        }
        // `wide` prefixes lift to nothing; the widened instruction follows
        if let Some(insn) = insn {
            instructions.push(insn);
        }
    }
    if let Some(label) = labels.by_index.get(&code.len()) {
        instructions.push(Insn::Label(*label));
    }

    Ok(Code {
        max_stack: 0,
        max_locals: 0,
        instructions,
        try_catch,
        local_variables,
        local_variable_types,
        next_label: labels.next,
    })
}

fn lift_instruction(
    instruction: &Instruction,
    index: usize,
    pool: &SourcePool,
    labels: &mut Labels,
) -> Result<Option<Insn>, CodecError> {
    use Instruction as I;
    if let Some(opcode) = simple_opcode(instruction) {
        return Ok(Some(Insn::Simple(opcode)));
    }
    if let Some((opcode, var)) = var_operand(instruction) {
        return Ok(Some(Insn::Var { opcode, var }));
    }
    if let Some((opcode, target)) = jump_operand(instruction) {
        return Ok(Some(Insn::Jump {
            opcode,
            target: labels.at(target as i64)?,
        }));
    }
    let member = |index: u16, opcode: u8| -> Result<Insn, CodecError> {
        let (owner, name, desc, is_interface) = pool.member_ref(index)?;
        Ok(match opcode {
            GETSTATIC..=PUTFIELD => Insn::Field {
                opcode,
                owner: owner.to_string(),
                name: name.to_string(),
                desc: desc.to_string(),
            },
            _ => Insn::Method {
                opcode,
                owner: owner.to_string(),
                name: name.to_string(),
                desc: desc.to_string(),
                is_interface,
            },
        })
    };
    let type_insn = |index: u16, opcode: u8| -> Result<Insn, CodecError> {
        Ok(Insn::Type {
            opcode,
            desc: pool.class_name(index)?.to_string(),
        })
    };

    let insn = match instruction {
        I::Goto_w(target) => Insn::Jump {
            opcode: GOTO,
            target: labels.at(*target as i64)?,
        },
        I::Jsr_w(target) => Insn::Jump {
            opcode: JSR,
            target: labels.at(*target as i64)?,
        },
        I::Bipush(value) => Insn::Int {
            opcode: BIPUSH,
            operand: *value as i32,
        },
        I::Sipush(value) => Insn::Int {
            opcode: SIPUSH,
            operand: *value as i32,
        },
        I::Newarray(array_type) => Insn::Int {
            opcode: NEWARRAY,
            operand: array_type_code(array_type),
        },
        I::Ldc(index) => Insn::Ldc(pool.constant(*index as u16)?),
        I::Ldc_w(index) | I::Ldc2_w(index) => Insn::Ldc(pool.constant(*index)?),
        I::Iinc(var, increment) => Insn::Iinc {
            var: *var as u16,
            increment: *increment as i16,
        },
        I::Iinc_w(var, increment) => Insn::Iinc {
            var: *var,
            increment: *increment,
        },
        I::Tableswitch(switch) => Insn::TableSwitch {
            low: switch.low,
            high: switch.high,
            default: labels.at(switch.default as i64)?,
            targets: switch
                .offsets
                .iter()
                .map(|target| labels.at(*target as i64))
                .collect::<Result<_, _>>()?,
        },
        I::Lookupswitch(switch) => {
            let mut pairs = Vec::with_capacity(switch.pairs.len());
            for (key, target) in switch.pairs.iter() {
                pairs.push((*key, labels.at(*target as i64)?));
            }
            Insn::LookupSwitch {
                default: labels.at(switch.default as i64)?,
                pairs,
            }
        }
        I::Getstatic(index) => member(*index, GETSTATIC)?,
        I::Putstatic(index) => member(*index, PUTSTATIC)?,
        I::Getfield(index) => member(*index, GETFIELD)?,
        I::Putfield(index) => member(*index, PUTFIELD)?,
        I::Invokevirtual(index) => member(*index, INVOKEVIRTUAL)?,
        I::Invokespecial(index) => member(*index, INVOKESPECIAL)?,
        I::Invokestatic(index) => member(*index, INVOKESTATIC)?,
        I::Invokeinterface(index, _) => member(*index, INVOKEINTERFACE)?,
        I::Invokedynamic(index) => {
            let (name, desc, bootstrap) = pool.invoke_dynamic(*index)?;
            Insn::InvokeDynamic {
                name,
                desc,
                bootstrap,
            }
        }
        I::New(index) => type_insn(*index, NEW)?,
        I::Anewarray(index) => type_insn(*index, ANEWARRAY)?,
        I::Checkcast(index) => type_insn(*index, CHECKCAST)?,
        I::Instanceof(index) => type_insn(*index, INSTANCEOF)?,
        I::Multianewarray(index, dims) => Insn::MultiANewArray {
            desc: pool.class_name(*index)?.to_string(),
            dims: *dims,
        },
        I::Wide => return Ok(None),
        other => {
            return Err(CodecError::BadInstruction {
                instruction: format!("{other:?}"),
                index,
            });
        }
    };
    Ok(Some(insn))
}

fn lift_stack_map(
    raw: &[StackFrame],
    pool: &SourcePool,
    owner: &str,
    method: &MethodNode,
    labels: &mut Labels,
) -> Result<Vec<(usize, Frame)>, CodecError> {
    let mut locals = initial_locals(owner, method.access, &method.name, &method.desc)?;
    let mut position: i64 = -1;
    let mut frames = Vec::with_capacity(raw.len());
    for frame in raw {
        let stack = match frame {
            StackFrame::SameFrame { .. } | StackFrame::SameFrameExtended { .. } => Vec::new(),
            StackFrame::SameLocals1StackItemFrame { stack, .. }
            | StackFrame::SameLocals1StackItemFrameExtended { stack, .. } => {
                lift_types(stack, pool, labels)?
            }
            StackFrame::ChopFrame { frame_type, .. } => {
                let chop = 251usize.saturating_sub(*frame_type as usize);
                locals.truncate(locals.len().saturating_sub(chop));
                Vec::new()
            }
            StackFrame::AppendFrame { locals: added, .. } => {
                locals.extend(lift_types(added, pool, labels)?);
                Vec::new()
            }
            StackFrame::FullFrame {
                locals: all, stack, ..
            } => {
                locals = lift_types(all, pool, labels)?;
                lift_types(stack, pool, labels)?
            }
        };
        position += frame.offset_delta() as i64 + 1;
        labels.at(position)?;
        frames.push((
            position as usize,
            Frame {
                locals: locals.clone(),
                stack,
            },
        ));
    }
    Ok(frames)
}

fn lift_types(
    types: &[VerificationType],
    pool: &SourcePool,
    labels: &mut Labels,
) -> Result<Vec<FrameValue>, CodecError> {
    types
        .iter()
        .map(|value| {
            Ok(match value {
                VerificationType::Top => FrameValue::Top,
                VerificationType::Integer => FrameValue::Integer,
                VerificationType::Float => FrameValue::Float,
                VerificationType::Double => FrameValue::Double,
                VerificationType::Long => FrameValue::Long,
                VerificationType::Null => FrameValue::Null,
                VerificationType::UninitializedThis => FrameValue::UninitializedThis,
                VerificationType::Object { cpool_index } => {
                    FrameValue::Object(pool.class_name(*cpool_index)?.to_string())
                }
                VerificationType::Uninitialized { offset } => {
                    FrameValue::Uninitialized(labels.at(*offset as i64)?)
                }
            })
        })
        .collect()
}
