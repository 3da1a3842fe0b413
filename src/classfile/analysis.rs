//! Dataflow over symbolic instruction lists.
//!
//! [`compute_frames`] is a typed worklist analysis in the style of ASM's
//! `COMPUTE_FRAMES`: it infers the verification type of every local and
//! stack slot, merges at join points through a [`TypeResolver`], and rewrites
//! the method with fresh frame pseudo-instructions. Unreachable code is
//! replaced by `athrow` and cut out of exception ranges, since no frame can
//! be inferred for it.
//!
//! [`compute_maxs`] only tracks stack heights and cannot fail.

use std::collections::{HashMap, HashSet, VecDeque};

use super::descriptor;
use super::opcodes::*;
use super::{Code, CodecError, Constant, Frame, FrameValue, Insn, Label, MethodNode, TryCatch, jdk};

const OBJECT: &str = "java/lang/Object";
const THROWABLE: &str = "java/lang/Throwable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub super_name: Option<String>,
    pub is_interface: bool,
}

/// Answers superclass questions for frame merging.
pub trait TypeResolver: Send + Sync {
    fn type_info(&self, name: &str) -> Option<TypeInfo>;
}

/// Knows nothing beyond the built-in JDK table.
#[derive(Debug, Clone, Copy, Default)]
pub struct JdkOnly;

impl TypeResolver for JdkOnly {
    fn type_info(&self, _name: &str) -> Option<TypeInfo> {
        None
    }
}

fn lookup(resolver: &dyn TypeResolver, name: &str) -> Result<TypeInfo, CodecError> {
    resolver
        .type_info(name)
        .or_else(|| jdk::lookup(name))
        .ok_or_else(|| CodecError::UnknownType(name.to_string()))
}

/// Most specific common superclass of two internal names or array
/// descriptors. Interfaces merge to `java/lang/Object`, as the verifier
/// treats them.
pub fn common_super_class(
    resolver: &dyn TypeResolver,
    a: &str,
    b: &str,
) -> Result<String, CodecError> {
    if a == b {
        return Ok(a.to_string());
    }
    if a.starts_with('[') || b.starts_with('[') {
        return common_array_type(resolver, a, b);
    }
    if a == OBJECT || b == OBJECT {
        return Ok(OBJECT.to_string());
    }

    let left = lookup(resolver, a)?;
    let right = lookup(resolver, b)?;
    if left.is_interface || right.is_interface {
        return Ok(OBJECT.to_string());
    }

    let mut ancestors = HashSet::new();
    ancestors.insert(a.to_string());
    let mut current = left.super_name;
    while let Some(name) = current {
        if !ancestors.insert(name.clone()) {
            break;
        }
        current = lookup(resolver, &name)?.super_name;
    }
    if ancestors.contains(b) {
        return Ok(b.to_string());
    }

    let mut seen = HashSet::new();
    let mut current = right.super_name;
    while let Some(name) = current {
        if ancestors.contains(&name) {
            return Ok(name);
        }
        if !seen.insert(name.clone()) {
            break;
        }
        current = lookup(resolver, &name)?.super_name;
    }
    Ok(OBJECT.to_string())
}

fn common_array_type(resolver: &dyn TypeResolver, a: &str, b: &str) -> Result<String, CodecError> {
    match (a.strip_prefix('['), b.strip_prefix('[')) {
        (Some(ea), Some(eb)) if is_reference_desc(ea) && is_reference_desc(eb) => {
            let common = common_super_class(resolver, element_name(ea), element_name(eb))?;
            Ok(array_of(&common))
        }
        _ => Ok(OBJECT.to_string()),
    }
}

fn is_reference_desc(desc: &str) -> bool {
    desc.starts_with('L') || desc.starts_with('[')
}

fn element_name(desc: &str) -> &str {
    desc.strip_prefix('L')
        .and_then(|d| d.strip_suffix(';'))
        .unwrap_or(desc)
}

fn array_of(name: &str) -> String {
    if name.starts_with('[') {
        format!("[{name}")
    } else {
        format!("[L{name};")
    }
}

/// Verification type of a value with the given field descriptor; `None`
/// for `V` or malformed input.
pub fn descriptor_value(desc: &str) -> Option<FrameValue> {
    match desc.as_bytes().first()? {
        b'Z' | b'B' | b'C' | b'S' | b'I' => Some(FrameValue::Integer),
        b'F' => Some(FrameValue::Float),
        b'J' => Some(FrameValue::Long),
        b'D' => Some(FrameValue::Double),
        b'L' => desc
            .strip_prefix('L')
            .and_then(|d| d.strip_suffix(';'))
            .map(|name| FrameValue::Object(name.to_string())),
        b'[' => Some(FrameValue::Object(desc.to_string())),
        _ => None,
    }
}

/// Locals on method entry, in `StackMapTable` (compact) form.
pub fn initial_locals(
    owner: &str,
    access: u16,
    name: &str,
    desc: &str,
) -> Result<Vec<FrameValue>, CodecError> {
    let mut locals = Vec::new();
    if access & ACC_STATIC == 0 {
        if name == "<init>" && owner != OBJECT {
            locals.push(FrameValue::UninitializedThis);
        } else {
            locals.push(FrameValue::Object(owner.to_string()));
        }
    }
    for arg in descriptor::method_arguments(desc)? {
        locals.push(descriptor_value(&arg).ok_or_else(|| CodecError::Descriptor(desc.to_string()))?);
    }
    Ok(locals)
}

/// Abstract value. Unlike [`FrameValue`], locals hold long/double as two
/// slots (the value followed by `Top`), and uninitialized objects are
/// identified by the index of their `new` instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Top,
    Int,
    Float,
    Long,
    Double,
    Null,
    UninitThis,
    Ref(String),
    Uninit(usize),
}

impl Value {
    fn from_frame(value: &FrameValue) -> Value {
        match value {
            FrameValue::Top | FrameValue::Uninitialized(_) => Value::Top,
            FrameValue::Integer => Value::Int,
            FrameValue::Float => Value::Float,
            FrameValue::Long => Value::Long,
            FrameValue::Double => Value::Double,
            FrameValue::Null => Value::Null,
            FrameValue::UninitializedThis => Value::UninitThis,
            FrameValue::Object(name) => Value::Ref(name.clone()),
        }
    }

    fn is_wide(&self) -> bool {
        matches!(self, Value::Long | Value::Double)
    }

    fn is_reference(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::UninitThis | Value::Ref(_) | Value::Uninit(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct State {
    locals: Vec<Value>,
    stack: Vec<Value>,
}

fn stack_slots(stack: &[Value]) -> usize {
    stack.iter().map(|v| if v.is_wide() { 2 } else { 1 }).sum()
}

fn store_local(locals: &mut Vec<Value>, var: u16, value: Value) {
    let index = var as usize;
    let needed = index + if value.is_wide() { 2 } else { 1 };
    if locals.len() < needed {
        locals.resize(needed, Value::Top);
    }
    if index > 0 && locals[index - 1].is_wide() {
        locals[index - 1] = Value::Top;
    }
    if value.is_wide() {
        locals[index + 1] = Value::Top;
    }
    locals[index] = value;
}

fn newarray_desc(operand: i32) -> Option<&'static str> {
    Some(match operand {
        T_BOOLEAN => "[Z",
        T_CHAR => "[C",
        T_FLOAT => "[F",
        T_DOUBLE => "[D",
        T_BYTE => "[B",
        T_SHORT => "[S",
        T_INT => "[I",
        T_LONG => "[J",
        _ => return None,
    })
}

/// Highest local slot touched by any instruction, plus the arguments.
fn locals_needed(initial: usize, instructions: &[Insn]) -> usize {
    instructions
        .iter()
        .filter_map(|insn| match insn {
            Insn::Var { opcode, var } => Some(
                *var as usize
                    + if matches!(*opcode, LLOAD | DLOAD | LSTORE | DSTORE) {
                        2
                    } else {
                        1
                    },
            ),
            Insn::Iinc { var, .. } => Some(*var as usize + 1),
            _ => None,
        })
        .fold(initial, usize::max)
}

fn label_positions(instructions: &[Insn]) -> HashMap<Label, usize> {
    instructions
        .iter()
        .enumerate()
        .filter_map(|(i, insn)| match insn {
            Insn::Label(label) => Some((*label, i)),
            _ => None,
        })
        .collect()
}

struct Handler {
    start: usize,
    end: usize,
    target: usize,
    catch: Value,
}

struct Analyzer<'a> {
    owner: &'a str,
    method_id: String,
    insns: &'a [Insn],
    labels: HashMap<Label, usize>,
    resolver: &'a dyn TypeResolver,
}

impl Analyzer<'_> {
    fn error(&self, reason: impl Into<String>) -> CodecError {
        CodecError::Frame {
            method: self.method_id.clone(),
            reason: reason.into(),
        }
    }

    fn index_of(&self, label: Label) -> Result<usize, CodecError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or(CodecError::UnplacedLabel(label))
    }

    fn successors(&self, index: usize) -> Result<Vec<usize>, CodecError> {
        let next = vec![index + 1];
        Ok(match &self.insns[index] {
            Insn::Jump { opcode: GOTO, target } => vec![self.index_of(*target)?],
            Insn::Jump { opcode: JSR, .. } => return Err(self.error("jsr is not supported")),
            Insn::Jump { target, .. } => vec![self.index_of(*target)?, index + 1],
            Insn::TableSwitch {
                default, targets, ..
            } => std::iter::once(default)
                .chain(targets.iter())
                .map(|l| self.index_of(*l))
                .collect::<Result<_, _>>()?,
            Insn::LookupSwitch { default, pairs } => std::iter::once(default)
                .chain(pairs.iter().map(|(_, l)| l))
                .map(|l| self.index_of(*l))
                .collect::<Result<_, _>>()?,
            Insn::Var { opcode: RET, .. } => return Err(self.error("ret is not supported")),
            Insn::Simple(op) if is_return(*op) || *op == ATHROW => Vec::new(),
            _ => next,
        })
    }

    fn pop(&self, state: &mut State) -> Result<Value, CodecError> {
        state
            .stack
            .pop()
            .ok_or_else(|| self.error("operand stack underflow"))
    }

    fn pop1(&self, state: &mut State) -> Result<Value, CodecError> {
        let value = self.pop(state)?;
        if value.is_wide() {
            return Err(self.error("category 2 value where category 1 expected"));
        }
        Ok(value)
    }

    fn pop_n(&self, state: &mut State, n: usize) -> Result<(), CodecError> {
        for _ in 0..n {
            self.pop(state)?;
        }
        Ok(())
    }

    fn value_of(&self, desc: &str) -> Result<Value, CodecError> {
        descriptor_value(desc)
            .map(|v| Value::from_frame(&v))
            .ok_or_else(|| CodecError::Descriptor(desc.to_string()))
    }

    fn push_return(&self, state: &mut State, desc: &str) -> Result<(), CodecError> {
        let ret = descriptor::method_return(desc)?;
        if ret != "V" {
            state.stack.push(self.value_of(&ret)?);
        }
        Ok(())
    }

    fn execute(&self, index: usize, input: &State) -> Result<State, CodecError> {
        let mut s = input.clone();
        match &self.insns[index] {
            Insn::Simple(op) => self.simple(*op, &mut s)?,
            Insn::Int { opcode, operand } => {
                if *opcode == NEWARRAY {
                    self.pop1(&mut s)?;
                    let desc = newarray_desc(*operand)
                        .ok_or_else(|| self.error(format!("bad newarray type {operand}")))?;
                    s.stack.push(Value::Ref(desc.to_string()));
                } else {
                    s.stack.push(Value::Int);
                }
            }
            Insn::Var { opcode, var } => match *opcode {
                ILOAD => s.stack.push(Value::Int),
                LLOAD => s.stack.push(Value::Long),
                FLOAD => s.stack.push(Value::Float),
                DLOAD => s.stack.push(Value::Double),
                ALOAD => {
                    let value = s.locals.get(*var as usize).cloned().unwrap_or(Value::Top);
                    if !value.is_reference() {
                        return Err(self.error(format!("aload {var} of {value:?}")));
                    }
                    s.stack.push(value);
                }
                ISTORE..=ASTORE => {
                    let value = self.pop(&mut s)?;
                    store_local(&mut s.locals, *var, value);
                }
                _ => return Err(self.error("ret is not supported")),
            },
            Insn::Iinc { .. } => {}
            Insn::Type { opcode, desc } => match *opcode {
                NEW => s.stack.push(Value::Uninit(index)),
                ANEWARRAY => {
                    self.pop1(&mut s)?;
                    s.stack.push(Value::Ref(array_of(desc)));
                }
                CHECKCAST => {
                    self.pop1(&mut s)?;
                    s.stack.push(Value::Ref(desc.clone()));
                }
                _ => {
                    self.pop1(&mut s)?;
                    s.stack.push(Value::Int);
                }
            },
            Insn::Field { opcode, desc, .. } => match *opcode {
                GETSTATIC => s.stack.push(self.value_of(desc)?),
                PUTSTATIC => {
                    self.pop(&mut s)?;
                }
                GETFIELD => {
                    self.pop1(&mut s)?;
                    s.stack.push(self.value_of(desc)?);
                }
                _ => self.pop_n(&mut s, 2)?,
            },
            Insn::Method {
                opcode, name, desc, ..
            } => {
                self.pop_n(&mut s, descriptor::method_arguments(desc)?.len())?;
                if *opcode != INVOKESTATIC {
                    let receiver = self.pop1(&mut s)?;
                    if *opcode == INVOKESPECIAL && name == "<init>" {
                        self.initialize(&mut s, receiver)?;
                    }
                }
                self.push_return(&mut s, desc)?;
            }
            Insn::InvokeDynamic { desc, .. } => {
                self.pop_n(&mut s, descriptor::method_arguments(desc)?.len())?;
                self.push_return(&mut s, desc)?;
            }
            Insn::Jump { opcode, .. } => match *opcode {
                IFEQ..=IFLE | IFNULL | IFNONNULL => {
                    self.pop1(&mut s)?;
                }
                IF_ICMPEQ..=IF_ACMPNE => self.pop_n(&mut s, 2)?,
                _ => {}
            },
            Insn::Ldc(constant) => {
                let value = match constant {
                    Constant::Int(_) => Value::Int,
                    Constant::Float(_) => Value::Float,
                    Constant::Long(_) => Value::Long,
                    Constant::Double(_) => Value::Double,
                    Constant::String(_) => Value::Ref("java/lang/String".into()),
                    Constant::Class(_) => Value::Ref("java/lang/Class".into()),
                    Constant::MethodType(_) => Value::Ref("java/lang/invoke/MethodType".into()),
                    Constant::Handle(_) => Value::Ref("java/lang/invoke/MethodHandle".into()),
                    Constant::Dynamic(dynamic) => self.value_of(&dynamic.desc)?,
                };
                s.stack.push(value);
            }
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
                self.pop1(&mut s)?;
            }
            Insn::MultiANewArray { desc, dims } => {
                self.pop_n(&mut s, *dims as usize)?;
                s.stack.push(Value::Ref(desc.clone()));
            }
            Insn::Label(_) | Insn::LineNumber { .. } | Insn::Frame(_) => {}
        }
        Ok(s)
    }

    fn initialize(&self, s: &mut State, receiver: Value) -> Result<(), CodecError> {
        let initialized = match &receiver {
            Value::UninitThis => Value::Ref(self.owner.to_string()),
            Value::Uninit(at) => match &self.insns[*at] {
                Insn::Type { desc, .. } => Value::Ref(desc.clone()),
                _ => return Err(self.error("uninitialized value without a new instruction")),
            },
            other => return Err(self.error(format!("<init> invoked on {other:?}"))),
        };
        for value in s.locals.iter_mut().chain(s.stack.iter_mut()) {
            if *value == receiver {
                *value = initialized.clone();
            }
        }
        Ok(())
    }

    fn simple(&self, op: u8, s: &mut State) -> Result<(), CodecError> {
        match op {
            NOP => {}
            ACONST_NULL => s.stack.push(Value::Null),
            ICONST_M1..=ICONST_5 => s.stack.push(Value::Int),
            LCONST_0 | LCONST_1 => s.stack.push(Value::Long),
            FCONST_0..=FCONST_2 => s.stack.push(Value::Float),
            DCONST_0 | DCONST_1 => s.stack.push(Value::Double),
            IALOAD..=SALOAD => {
                self.pop1(s)?;
                let array = self.pop1(s)?;
                let element = match op {
                    IALOAD | BALOAD | CALOAD | SALOAD => Value::Int,
                    LALOAD => Value::Long,
                    FALOAD => Value::Float,
                    DALOAD => Value::Double,
                    _ => match &array {
                        Value::Null => Value::Null,
                        Value::Ref(desc) if desc.starts_with('[') => {
                            self.value_of(&desc[1..])?
                        }
                        other => return Err(self.error(format!("aaload from {other:?}"))),
                    },
                };
                s.stack.push(element);
            }
            IASTORE..=SASTORE => {
                self.pop(s)?;
                self.pop1(s)?;
                self.pop1(s)?;
            }
            POP => {
                self.pop1(s)?;
            }
            POP2 => {
                if !self.pop(s)?.is_wide() {
                    self.pop1(s)?;
                }
            }
            DUP => {
                let v1 = self.pop1(s)?;
                s.stack.push(v1.clone());
                s.stack.push(v1);
            }
            DUP_X1 => {
                let v1 = self.pop1(s)?;
                let v2 = self.pop1(s)?;
                s.stack.extend([v1.clone(), v2, v1]);
            }
            DUP_X2 => {
                let v1 = self.pop1(s)?;
                let v2 = self.pop(s)?;
                if v2.is_wide() {
                    s.stack.extend([v1.clone(), v2, v1]);
                } else {
                    let v3 = self.pop1(s)?;
                    s.stack.extend([v1.clone(), v3, v2, v1]);
                }
            }
            DUP2 => {
                let v1 = self.pop(s)?;
                if v1.is_wide() {
                    s.stack.extend([v1.clone(), v1]);
                } else {
                    let v2 = self.pop1(s)?;
                    s.stack.extend([v2.clone(), v1.clone(), v2, v1]);
                }
            }
            DUP2_X1 => {
                let v1 = self.pop(s)?;
                if v1.is_wide() {
                    let v2 = self.pop1(s)?;
                    s.stack.extend([v1.clone(), v2, v1]);
                } else {
                    let v2 = self.pop1(s)?;
                    let v3 = self.pop1(s)?;
                    s.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                }
            }
            DUP2_X2 => {
                let v1 = self.pop(s)?;
                if v1.is_wide() {
                    let v2 = self.pop(s)?;
                    if v2.is_wide() {
                        s.stack.extend([v1.clone(), v2, v1]);
                    } else {
                        let v3 = self.pop1(s)?;
                        s.stack.extend([v1.clone(), v3, v2, v1]);
                    }
                } else {
                    let v2 = self.pop1(s)?;
                    let v3 = self.pop(s)?;
                    if v3.is_wide() {
                        s.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                    } else {
                        let v4 = self.pop1(s)?;
                        s.stack.extend([v2.clone(), v1.clone(), v4, v3, v2, v1]);
                    }
                }
            }
            SWAP => {
                let v1 = self.pop1(s)?;
                let v2 = self.pop1(s)?;
                s.stack.extend([v1, v2]);
            }
            IADD..=DREM => {
                self.pop_n(s, 2)?;
                s.stack.push(match (op - IADD) % 4 {
                    0 => Value::Int,
                    1 => Value::Long,
                    2 => Value::Float,
                    _ => Value::Double,
                });
            }
            INEG | LNEG | FNEG | DNEG => {
                let value = self.pop(s)?;
                s.stack.push(value);
            }
            ISHL..=LUSHR | IAND..=LXOR => {
                self.pop_n(s, 2)?;
                let base = if op >= IAND { IAND } else { ISHL };
                s.stack.push(if (op - base) % 2 == 0 {
                    Value::Int
                } else {
                    Value::Long
                });
            }
            I2L..=I2S => {
                self.pop(s)?;
                s.stack.push(match op {
                    I2L | F2L | D2L => Value::Long,
                    I2F | L2F | D2F => Value::Float,
                    I2D | L2D | F2D => Value::Double,
                    _ => Value::Int,
                });
            }
            LCMP..=DCMPG => {
                self.pop_n(s, 2)?;
                s.stack.push(Value::Int);
            }
            IRETURN..=ARETURN | ATHROW | MONITORENTER | MONITOREXIT => {
                self.pop(s)?;
            }
            RETURN => {}
            ARRAYLENGTH => {
                self.pop1(s)?;
                s.stack.push(Value::Int);
            }
            other => {
                return Err(self.error(format!("unexpected opcode {other}")));
            }
        }
        Ok(())
    }

    fn merge_value(&self, a: &Value, b: &Value) -> Result<Value, CodecError> {
        if a == b {
            return Ok(a.clone());
        }
        Ok(match (a, b) {
            (Value::Null, Value::Ref(_)) => b.clone(),
            (Value::Ref(_), Value::Null) => a.clone(),
            (Value::Ref(x), Value::Ref(y)) => Value::Ref(common_super_class(self.resolver, x, y)?),
            _ => Value::Top,
        })
    }

    /// Locals merge leniently: a type the graph cannot answer for becomes
    /// `Top`, and any later load of it fails the analysis anyway.
    fn merge_locals(&self, a: &[Value], b: &[Value]) -> Vec<Value> {
        let len = a.len().max(b.len());
        (0..len)
            .map(|i| {
                let left = a.get(i).unwrap_or(&Value::Top);
                let right = b.get(i).unwrap_or(&Value::Top);
                self.merge_value(left, right).unwrap_or(Value::Top)
            })
            .collect()
    }

    fn merge(&self, old: &State, new: &State, at: usize) -> Result<State, CodecError> {
        if old.stack.len() != new.stack.len() {
            return Err(self.error(format!("inconsistent stack height at instruction {at}")));
        }
        let mut stack = Vec::with_capacity(old.stack.len());
        for (a, b) in old.stack.iter().zip(&new.stack) {
            let merged = self.merge_value(a, b)?;
            if merged == Value::Top {
                return Err(self.error(format!(
                    "incompatible stack values {a:?} and {b:?} at instruction {at}"
                )));
            }
            stack.push(merged);
        }
        Ok(State {
            locals: self.merge_locals(&old.locals, &new.locals),
            stack,
        })
    }

    fn flow(
        &self,
        states: &mut [Option<State>],
        queue: &mut VecDeque<usize>,
        queued: &mut [bool],
        target: usize,
        incoming: State,
    ) -> Result<(), CodecError> {
        if target >= states.len() {
            return Err(self.error("execution falls off the end of the code"));
        }
        let next = match &states[target] {
            None => Some(incoming),
            Some(old) => {
                let merged = self.merge(old, &incoming, target)?;
                (merged != *old).then_some(merged)
            }
        };
        if let Some(state) = next {
            states[target] = Some(state);
            if !queued[target] {
                queued[target] = true;
                queue.push_back(target);
            }
        }
        Ok(())
    }

    fn to_frame_value(&self, value: &Value, new_labels: &HashMap<usize, Label>) -> FrameValue {
        match value {
            Value::Top => FrameValue::Top,
            Value::Int => FrameValue::Integer,
            Value::Float => FrameValue::Float,
            Value::Long => FrameValue::Long,
            Value::Double => FrameValue::Double,
            Value::Null => FrameValue::Null,
            Value::UninitThis => FrameValue::UninitializedThis,
            Value::Ref(name) => FrameValue::Object(name.clone()),
            Value::Uninit(at) => match new_labels.get(at) {
                Some(label) => FrameValue::Uninitialized(*label),
                None => FrameValue::Top,
            },
        }
    }

    fn frame(&self, state: &State, new_labels: &HashMap<usize, Label>) -> Frame {
        let mut locals = Vec::new();
        let mut i = 0usize;
        while i < state.locals.len() {
            let value = &state.locals[i];
            locals.push(self.to_frame_value(value, new_labels));
            i += if value.is_wide() { 2 } else { 1 };
        }
        while locals.last() == Some(&FrameValue::Top) {
            locals.pop();
        }
        Frame {
            locals,
            stack: state
                .stack
                .iter()
                .map(|v| self.to_frame_value(v, new_labels))
                .collect(),
        }
    }
}

fn method_id(owner: &str, method: &MethodNode) -> String {
    format!("{owner}.{}{}", method.name, method.desc)
}

/// Recomputes max stack, max locals and every frame of `code`, replacing
/// unreachable instructions with `athrow`.
pub fn compute_frames(
    owner: &str,
    method: &MethodNode,
    code: &mut Code,
    resolver: &dyn TypeResolver,
) -> Result<(), CodecError> {
    code.strip_frames();
    let insns = std::mem::take(&mut code.instructions);
    let analyzer = Analyzer {
        owner,
        method_id: method_id(owner, method),
        insns: &insns,
        labels: label_positions(&insns),
        resolver,
    };
    if insns.iter().all(Insn::is_pseudo) {
        return Err(analyzer.error("method body has no instructions"));
    }

    let initial_frame = initial_locals(owner, method.access, &method.name, &method.desc)?;
    let mut initial = Vec::new();
    for value in &initial_frame {
        let v = Value::from_frame(value);
        let wide = v.is_wide();
        initial.push(v);
        if wide {
            initial.push(Value::Top);
        }
    }

    let mut handlers = Vec::with_capacity(code.try_catch.len());
    for tc in &code.try_catch {
        handlers.push(Handler {
            start: analyzer.index_of(tc.start)?,
            end: analyzer.index_of(tc.end)?,
            target: analyzer.index_of(tc.handler)?,
            catch: Value::Ref(tc.catch_type.clone().unwrap_or_else(|| THROWABLE.to_string())),
        });
    }

    let n = insns.len();
    let mut states: Vec<Option<State>> = vec![None; n];
    let mut queued = vec![false; n];
    let mut queue = VecDeque::new();
    states[0] = Some(State {
        locals: initial.clone(),
        stack: Vec::new(),
    });
    queued[0] = true;
    queue.push_back(0usize);
    let mut max_stack = 0usize;
    let mut max_locals = locals_needed(initial.len(), &insns);

    while let Some(i) = queue.pop_front() {
        queued[i] = false;
        let Some(input) = states[i].clone() else {
            continue;
        };
        max_stack = max_stack.max(stack_slots(&input.stack));
        let insn = &insns[i];
        if insn.is_pseudo() {
            analyzer.flow(&mut states, &mut queue, &mut queued, i + 1, input)?;
            continue;
        }

        let output = analyzer.execute(i, &input)?;
        max_stack = max_stack.max(stack_slots(&output.stack));
        max_locals = max_locals.max(output.locals.len());

        for handler in handlers.iter().filter(|h| h.start <= i && i < h.end) {
            let state = State {
                locals: analyzer.merge_locals(&input.locals, &output.locals),
                stack: vec![handler.catch.clone()],
            };
            max_stack = max_stack.max(1);
            analyzer.flow(&mut states, &mut queue, &mut queued, handler.target, state)?;
        }
        for successor in analyzer.successors(i)? {
            analyzer.flow(&mut states, &mut queue, &mut queued, successor, output.clone())?;
        }
    }

    // Frames go on every branch target and after every instruction that
    // does not fall through.
    let mut targeted = HashSet::new();
    for insn in &insns {
        let labels: Vec<Label> = match insn {
            Insn::Jump { target, .. } => vec![*target],
            Insn::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
            Insn::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, l)| *l))
                .collect(),
            _ => Vec::new(),
        };
        for label in labels {
            targeted.insert(analyzer.index_of(label)?);
        }
    }
    for tc in &code.try_catch {
        targeted.insert(analyzer.index_of(tc.handler)?);
    }

    let mut frame_points = HashSet::new();
    let mut previous_real: Option<usize> = None;
    let mut pending_target = false;
    for (i, insn) in insns.iter().enumerate() {
        if targeted.contains(&i) {
            pending_target = true;
        }
        if insn.is_pseudo() {
            continue;
        }
        let after_break = previous_real.is_some_and(|p| {
            states[p].is_none() || insns[p].opcode().is_some_and(ends_flow)
        });
        if states[i].is_some() && (pending_target || after_break) {
            frame_points.insert(i);
        }
        pending_target = false;
        previous_real = Some(i);
    }

    let mut uninitialized = HashSet::new();
    for point in &frame_points {
        if let Some(state) = &states[*point] {
            for value in state.locals.iter().chain(&state.stack) {
                if let Value::Uninit(at) = value {
                    uninitialized.insert(*at);
                }
            }
        }
    }
    let mut new_labels = HashMap::new();
    let mut insert_label = HashMap::new();
    for at in uninitialized {
        let mut existing = None;
        let mut j = at;
        while j > 0 && insns[j - 1].is_pseudo() {
            j -= 1;
            if let Insn::Label(label) = &insns[j] {
                existing = Some(*label);
                break;
            }
        }
        let label = match existing {
            Some(label) => label,
            None => {
                let label = code.new_label();
                insert_label.insert(at, label);
                label
            }
        };
        new_labels.insert(at, label);
    }

    let frames: HashMap<usize, Frame> = frame_points
        .iter()
        .filter_map(|p| states[*p].as_ref().map(|s| (*p, analyzer.frame(s, &new_labels))))
        .collect();
    drop(analyzer);

    let mut rebuilt = Vec::with_capacity(insns.len() + frames.len());
    let mut dead_runs: Vec<(Label, Label)> = Vec::new();
    let mut in_dead_run = false;
    for (i, insn) in insns.into_iter().enumerate() {
        if insn.is_pseudo() {
            rebuilt.push(insn);
            continue;
        }
        if states[i].is_some() {
            in_dead_run = false;
            if let Some(frame) = frames.get(&i) {
                rebuilt.push(Insn::Frame(frame.clone()));
            }
            if let Some(label) = insert_label.get(&i) {
                rebuilt.push(Insn::Label(*label));
            }
            rebuilt.push(insn);
        } else if !in_dead_run {
            in_dead_run = true;
            let start = code.new_label();
            let end = code.new_label();
            rebuilt.push(Insn::Label(start));
            rebuilt.push(Insn::Frame(Frame {
                locals: Vec::new(),
                stack: vec![FrameValue::Object(THROWABLE.to_string())],
            }));
            rebuilt.push(Insn::Simple(ATHROW));
            rebuilt.push(Insn::Label(end));
            dead_runs.push((start, end));
            max_stack = max_stack.max(1);
        }
    }

    if !dead_runs.is_empty() {
        code.try_catch = exclude_ranges(&rebuilt, std::mem::take(&mut code.try_catch), &dead_runs)?;
    }
    code.instructions = rebuilt;
    code.max_stack = u16::try_from(max_stack)
        .map_err(|_| CodecError::Limit(format!("max stack {max_stack}")))?;
    code.max_locals = u16::try_from(max_locals)
        .map_err(|_| CodecError::Limit(format!("max locals {max_locals}")))?;
    Ok(())
}

/// Splits exception ranges so that none of them covers a dead run.
fn exclude_ranges(
    instructions: &[Insn],
    try_catch: Vec<TryCatch>,
    dead_runs: &[(Label, Label)],
) -> Result<Vec<TryCatch>, CodecError> {
    let positions = label_positions(instructions);
    let pos = |label: Label| positions.get(&label).copied().ok_or(CodecError::UnplacedLabel(label));

    let mut out = Vec::with_capacity(try_catch.len());
    for tc in try_catch {
        let mut pieces = vec![(tc.start, tc.end)];
        for (dead_start, dead_end) in dead_runs {
            let (ds, de) = (pos(*dead_start)?, pos(*dead_end)?);
            let mut next = Vec::with_capacity(pieces.len() + 1);
            for (start, end) in pieces {
                let (s, e) = (pos(start)?, pos(end)?);
                if ds >= e || de <= s {
                    next.push((start, end));
                    continue;
                }
                if s < ds {
                    next.push((start, *dead_start));
                }
                if de < e {
                    next.push((*dead_end, end));
                }
            }
            pieces = next;
        }
        for (start, end) in pieces {
            let (s, e) = (pos(start)?, pos(end)?);
            if s >= e || instructions[s..e].iter().all(Insn::is_pseudo) {
                continue;
            }
            out.push(TryCatch {
                start,
                end,
                handler: tc.handler,
                catch_type: tc.catch_type.clone(),
            });
        }
    }
    Ok(out)
}

fn simple_effect(op: u8) -> i32 {
    match op {
        ACONST_NULL..=ICONST_5 | FCONST_0..=FCONST_2 => 1,
        LCONST_0 | LCONST_1 | DCONST_0 | DCONST_1 => 2,
        IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD => -1,
        IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE => -3,
        LASTORE | DASTORE => -4,
        POP => -1,
        POP2 => -2,
        DUP | DUP_X1 | DUP_X2 => 1,
        DUP2 | DUP2_X1 | DUP2_X2 => 2,
        IADD..=DREM => {
            if (op - IADD) % 2 == 0 {
                -1
            } else {
                -2
            }
        }
        ISHL..=LUSHR => -1,
        IAND..=LXOR => {
            if (op - IAND) % 2 == 0 {
                -1
            } else {
                -2
            }
        }
        I2L | I2D | F2L | F2D => 1,
        L2I | L2F | D2I | D2F => -1,
        LCMP | DCMPL | DCMPG => -3,
        FCMPL | FCMPG => -1,
        IRETURN | FRETURN | ARETURN | ATHROW | MONITORENTER | MONITOREXIT => -1,
        LRETURN | DRETURN => -2,
        _ => 0,
    }
}

fn desc_slots(desc: &str) -> i32 {
    descriptor::slot_size(desc) as i32
}

fn call_effect(desc: &str) -> i32 {
    let args = descriptor::arguments_size(desc).unwrap_or(0) as i32;
    let ret = descriptor::method_return(desc).map_or(0, |ret| desc_slots(&ret));
    ret - args
}

/// Net change in operand stack slots caused by one instruction.
pub fn stack_effect(insn: &Insn) -> i32 {
    match insn {
        Insn::Label(_) | Insn::LineNumber { .. } | Insn::Frame(_) | Insn::Iinc { .. } => 0,
        Insn::Simple(op) => simple_effect(*op),
        Insn::Int { opcode, .. } => i32::from(*opcode != NEWARRAY),
        Insn::Var { opcode, .. } => match *opcode {
            ILOAD | FLOAD | ALOAD => 1,
            LLOAD | DLOAD => 2,
            ISTORE | FSTORE | ASTORE => -1,
            LSTORE | DSTORE => -2,
            _ => 0,
        },
        Insn::Type { opcode, .. } => i32::from(*opcode == NEW),
        Insn::Field { opcode, desc, .. } => {
            let size = desc_slots(desc);
            match *opcode {
                GETSTATIC => size,
                PUTSTATIC => -size,
                GETFIELD => size - 1,
                _ => -size - 1,
            }
        }
        Insn::Method { opcode, desc, .. } => {
            call_effect(desc) - i32::from(*opcode != INVOKESTATIC)
        }
        Insn::InvokeDynamic { desc, .. } => call_effect(desc),
        Insn::Jump { opcode, .. } => match *opcode {
            IFEQ..=IFLE | IFNULL | IFNONNULL => -1,
            IF_ICMPEQ..=IF_ACMPNE => -2,
            JSR => 1,
            _ => 0,
        },
        Insn::Ldc(constant) => match constant {
            Constant::Long(_) | Constant::Double(_) => 2,
            Constant::Dynamic(d) => desc_slots(&d.desc),
            _ => 1,
        },
        Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => -1,
        Insn::MultiANewArray { dims, .. } => 1 - *dims as i32,
    }
}

/// Computes `(max_stack, max_locals)` from stack heights alone.
pub fn compute_maxs(owner: &str, method: &MethodNode, code: &Code) -> (u16, u16) {
    let insns = &code.instructions;
    let labels = label_positions(insns);
    let initial = initial_locals(owner, method.access, &method.name, &method.desc)
        .map(|locals| {
            locals
                .iter()
                .map(|v| if matches!(v, FrameValue::Long | FrameValue::Double) { 2 } else { 1 })
                .sum()
        })
        .unwrap_or(0);
    let max_locals = locals_needed(initial, insns);

    let handlers: Vec<(usize, usize, usize)> = code
        .try_catch
        .iter()
        .filter_map(|tc| {
            Some((
                *labels.get(&tc.start)?,
                *labels.get(&tc.end)?,
                *labels.get(&tc.handler)?,
            ))
        })
        .collect();

    let n = insns.len();
    let mut heights: Vec<Option<i32>> = vec![None; n];
    let mut queue = VecDeque::new();
    let mut max_stack = 0i32;
    if n > 0 {
        heights[0] = Some(0);
        queue.push_back(0usize);
    }
    let push = |heights: &mut Vec<Option<i32>>, queue: &mut VecDeque<usize>, at: usize, h: i32| {
        if at >= n {
            return;
        }
        let h = h.clamp(0, u16::MAX as i32);
        if heights[at].is_none_or(|old| h > old) {
            heights[at] = Some(h);
            queue.push_back(at);
        }
    };

    while let Some(i) = queue.pop_front() {
        let Some(h) = heights[i] else { continue };
        let insn = &insns[i];
        let out = h + stack_effect(insn);
        max_stack = max_stack.max(h).max(out);
        if !insn.is_pseudo() {
            for (start, end, target) in &handlers {
                if *start <= i && i < *end {
                    max_stack = max_stack.max(1);
                    push(&mut heights, &mut queue, *target, 1);
                }
            }
        }
        let label_index = |label: &Label| labels.get(label).copied();
        let successors: Vec<usize> = match insn {
            Insn::Jump { opcode: GOTO, target } => label_index(target).into_iter().collect(),
            Insn::Jump { target, .. } => label_index(target).into_iter().chain([i + 1]).collect(),
            Insn::TableSwitch {
                default, targets, ..
            } => std::iter::once(default)
                .chain(targets)
                .filter_map(label_index)
                .collect(),
            Insn::LookupSwitch { default, pairs } => std::iter::once(default)
                .chain(pairs.iter().map(|(_, l)| l))
                .filter_map(label_index)
                .collect(),
            Insn::Var { opcode: RET, .. } => Vec::new(),
            Insn::Simple(op) if is_return(*op) || *op == ATHROW => Vec::new(),
            _ => vec![i + 1],
        };
        for successor in successors {
            push(&mut heights, &mut queue, successor, out);
        }
    }

    (
        max_stack.clamp(0, u16::MAX as i32) as u16,
        max_locals.min(u16::MAX as usize) as u16,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Graph(HashMap<&'static str, TypeInfo>);

    impl TypeResolver for Graph {
        fn type_info(&self, name: &str) -> Option<TypeInfo> {
            self.0.get(name).cloned()
        }
    }

    fn class(super_name: &str) -> TypeInfo {
        TypeInfo {
            super_name: Some(super_name.to_string()),
            is_interface: false,
        }
    }

    fn graph() -> Graph {
        let mut map = HashMap::new();
        map.insert("app/Animal", class("java/lang/Object"));
        map.insert("app/Dog", class("app/Animal"));
        map.insert("app/Cat", class("app/Animal"));
        map.insert("app/Puppy", class("app/Dog"));
        map.insert(
            "app/Pet",
            TypeInfo {
                super_name: Some("java/lang/Object".into()),
                is_interface: true,
            },
        );
        Graph(map)
    }

    fn method(access: u16, name: &str, desc: &str) -> MethodNode {
        MethodNode {
            access,
            name: name.into(),
            desc: desc.into(),
            signature: None,
            exceptions: Vec::new(),
            code: None,
            attributes: Vec::new(),
        }
    }

    #[test]
    fn common_super_class_walks_the_graph() {
        let g = graph();
        assert_eq!(common_super_class(&g, "app/Dog", "app/Cat").unwrap(), "app/Animal");
        assert_eq!(common_super_class(&g, "app/Puppy", "app/Dog").unwrap(), "app/Dog");
        assert_eq!(common_super_class(&g, "app/Dog", "app/Puppy").unwrap(), "app/Dog");
        assert_eq!(common_super_class(&g, "app/Pet", "app/Dog").unwrap(), OBJECT);
        assert_eq!(
            common_super_class(&g, "[Lapp/Dog;", "[Lapp/Cat;").unwrap(),
            "[Lapp/Animal;"
        );
        assert_eq!(common_super_class(&g, "[I", "[J").unwrap(), OBJECT);
    }

    #[test]
    fn common_super_class_uses_jdk_table() {
        assert_eq!(
            common_super_class(
                &JdkOnly,
                "java/lang/IllegalArgumentException",
                "java/lang/IllegalStateException"
            )
            .unwrap(),
            "java/lang/RuntimeException"
        );
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(matches!(
            common_super_class(&JdkOnly, "x/Unknown", "app/Dog"),
            Err(CodecError::UnknownType(_))
        ));
    }

    #[test]
    fn initial_locals_follow_descriptor() {
        let locals = initial_locals("app/Dog", 0, "<init>", "(JLjava/lang/String;[I)V").unwrap();
        assert_eq!(
            locals,
            vec![
                FrameValue::UninitializedThis,
                FrameValue::Long,
                FrameValue::Object("java/lang/String".into()),
                FrameValue::Object("[I".into()),
            ]
        );
        let locals = initial_locals("app/Dog", ACC_STATIC, "run", "(I)V").unwrap();
        assert_eq!(locals, vec![FrameValue::Integer]);
    }

    #[test]
    fn merges_branches_to_common_superclass() {
        // Animal pick(boolean b) { Object o = b ? new Dog() : new Cat(); return (Animal) o; }
        let mut code = Code::default();
        let else_label = code.new_label();
        let join = code.new_label();
        code.instructions = vec![
            Insn::Var { opcode: ILOAD, var: 1 },
            Insn::Jump { opcode: IFEQ, target: else_label },
            Insn::Type { opcode: NEW, desc: "app/Dog".into() },
            Insn::Simple(DUP),
            Insn::Method {
                opcode: INVOKESPECIAL,
                owner: "app/Dog".into(),
                name: "<init>".into(),
                desc: "()V".into(),
                is_interface: false,
            },
            Insn::Jump { opcode: GOTO, target: join },
            Insn::Label(else_label),
            Insn::Type { opcode: NEW, desc: "app/Cat".into() },
            Insn::Simple(DUP),
            Insn::Method {
                opcode: INVOKESPECIAL,
                owner: "app/Cat".into(),
                name: "<init>".into(),
                desc: "()V".into(),
                is_interface: false,
            },
            Insn::Label(join),
            Insn::Simple(ARETURN),
        ];
        let m = method(0, "pick", "(Z)Lapp/Animal;");
        compute_frames("app/Shelter", &m, &mut code, &graph()).unwrap();

        assert_eq!(code.max_stack, 2);
        assert_eq!(code.max_locals, 2);
        let frames: Vec<&Frame> = code
            .instructions
            .iter()
            .filter_map(|i| match i {
                Insn::Frame(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].stack, vec![FrameValue::Object("app/Animal".into())]);
        assert_eq!(
            frames[1].locals,
            vec![FrameValue::Object("app/Shelter".into()), FrameValue::Integer]
        );
    }

    #[test]
    fn dead_code_becomes_athrow_outside_handlers() {
        let mut code = Code::default();
        let start = code.new_label();
        let end = code.new_label();
        let handler = code.new_label();
        code.instructions = vec![
            Insn::Label(start),
            Insn::Simple(RETURN),
            Insn::Simple(ICONST_1),
            Insn::Simple(POP),
            Insn::Label(end),
            Insn::Label(handler),
            Insn::Simple(POP),
            Insn::Simple(RETURN),
        ];
        code.try_catch.push(TryCatch {
            start,
            end,
            handler,
            catch_type: None,
        });
        let m = method(ACC_STATIC, "f", "()V");
        compute_frames("app/F", &m, &mut code, &JdkOnly).unwrap();

        let real: Vec<u8> = code.instructions.iter().filter_map(Insn::opcode).collect();
        assert_eq!(real, vec![RETURN, ATHROW, POP, RETURN]);
        // The try range now ends before the replaced block.
        assert_eq!(code.try_catch.len(), 1);
        assert_eq!(code.try_catch[0].start, start);
        assert_ne!(code.try_catch[0].end, end);
    }

    #[test]
    fn inconsistent_stack_heights_fail() {
        let mut code = Code::default();
        let join = code.new_label();
        code.instructions = vec![
            Insn::Var { opcode: ILOAD, var: 0 },
            Insn::Jump { opcode: IFEQ, target: join },
            Insn::Simple(ICONST_1),
            Insn::Label(join),
            Insn::Simple(RETURN),
        ];
        let m = method(ACC_STATIC, "f", "(I)V");
        let err = compute_frames("app/F", &m, &mut code, &JdkOnly).unwrap_err();
        assert!(matches!(err, CodecError::Frame { .. }));
    }

    #[test]
    fn maxs_count_wide_values() {
        let mut code = Code::default();
        code.instructions = vec![
            Insn::Simple(LCONST_1),
            Insn::Simple(LCONST_1),
            Insn::Simple(97),
            Insn::Var { opcode: LSTORE, var: 3 },
            Insn::Simple(RETURN),
        ];
        let m = method(ACC_STATIC, "f", "(I)V");
        assert_eq!(compute_maxs("app/F", &m, &code), (4, 5));
    }
}
