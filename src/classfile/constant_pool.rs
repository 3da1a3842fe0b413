//! Bridge between `ristretto_classfile` constant pools and the symbolic
//! model: [`SourcePool`] resolves indices of a parsed class into values,
//! [`PoolBuilder`] interns values into the pool of a class being written.

use std::collections::HashMap;

use ristretto_classfile::attributes::BootstrapMethod;
use ristretto_classfile::{Constant as PoolConstant, ConstantPool, ReferenceKind};

use super::opcodes::H_PUTSTATIC;
use super::{BootstrapCall, CodecError, Constant, DynamicConstant, Handle};

/// Length of `value` in modified UTF-8: NUL takes two bytes and
/// supplementary characters are written as two three-byte surrogates.
pub fn modified_utf8_len(value: &str) -> usize {
    value
        .chars()
        .map(|c| match c as u32 {
            0 => 2,
            0x01..=0x7F => 1,
            0x80..=0x7FF => 2,
            0x800..=0xFFFF => 3,
            _ => 6,
        })
        .sum()
}

fn reference_kind(kind: u8) -> Result<ReferenceKind, CodecError> {
    Ok(match kind {
        1 => ReferenceKind::GetField,
        2 => ReferenceKind::GetStatic,
        3 => ReferenceKind::PutField,
        4 => ReferenceKind::PutStatic,
        5 => ReferenceKind::InvokeVirtual,
        6 => ReferenceKind::InvokeStatic,
        7 => ReferenceKind::InvokeSpecial,
        8 => ReferenceKind::NewInvokeSpecial,
        9 => ReferenceKind::InvokeInterface,
        other => return Err(CodecError::BadHandleKind(other)),
    })
}

fn handle_kind(kind: &ReferenceKind) -> u8 {
    match kind {
        ReferenceKind::GetField => 1,
        ReferenceKind::GetStatic => 2,
        ReferenceKind::PutField => 3,
        ReferenceKind::PutStatic => 4,
        ReferenceKind::InvokeVirtual => 5,
        ReferenceKind::InvokeStatic => 6,
        ReferenceKind::InvokeSpecial => 7,
        ReferenceKind::NewInvokeSpecial => 8,
        ReferenceKind::InvokeInterface => 9,
    }
}

/// Constant pool and bootstrap table of a parsed class.
#[derive(Debug, Clone)]
pub struct SourcePool {
    pub pool: ConstantPool,
    pub bootstrap_methods: Vec<BootstrapMethod>,
}

impl SourcePool {
    pub fn new(pool: ConstantPool, bootstrap_methods: Vec<BootstrapMethod>) -> Self {
        Self {
            pool,
            bootstrap_methods,
        }
    }

    fn get(&self, index: u16) -> Result<&PoolConstant, CodecError> {
        self.pool.try_get(index).map_err(|_| CodecError::BadConstant(index))
    }

    pub fn utf8(&self, index: u16) -> Result<&str, CodecError> {
        match self.get(index)? {
            PoolConstant::Utf8(value) => Ok(value),
            _ => Err(CodecError::BadConstant(index)),
        }
    }

    pub fn optional_utf8(&self, index: u16) -> Result<Option<String>, CodecError> {
        if index == 0 {
            return Ok(None);
        }
        self.utf8(index).map(|s| Some(s.to_string()))
    }

    pub fn class_name(&self, index: u16) -> Result<&str, CodecError> {
        match self.get(index)? {
            PoolConstant::Class(name) => self.utf8(*name),
            _ => Err(CodecError::BadConstant(index)),
        }
    }

    pub fn optional_class_name(&self, index: u16) -> Result<Option<String>, CodecError> {
        if index == 0 {
            return Ok(None);
        }
        self.class_name(index).map(|s| Some(s.to_string()))
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), CodecError> {
        match self.get(index)? {
            PoolConstant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(CodecError::BadConstant(index)),
        }
    }

    pub fn integer(&self, index: u16) -> Result<i32, CodecError> {
        match self.get(index)? {
            PoolConstant::Integer(value) => Ok(*value),
            _ => Err(CodecError::BadConstant(index)),
        }
    }

    /// Resolves a field, method or interface method reference into
    /// `(owner, name, desc, is_interface)`.
    pub fn member_ref(&self, index: u16) -> Result<(&str, &str, &str, bool), CodecError> {
        let (class, nat, itf) = match self.get(index)? {
            PoolConstant::FieldRef {
                class_index,
                name_and_type_index,
            }
            | PoolConstant::MethodRef {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, false),
            PoolConstant::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, true),
            _ => return Err(CodecError::BadConstant(index)),
        };
        let (name, desc) = self.name_and_type(nat)?;
        Ok((self.class_name(class)?, name, desc, itf))
    }

    pub fn handle(&self, index: u16) -> Result<Handle, CodecError> {
        match self.get(index)? {
            PoolConstant::MethodHandle {
                reference_kind,
                reference_index,
            } => {
                let (owner, name, desc, is_interface) = self.member_ref(*reference_index)?;
                Ok(Handle {
                    kind: handle_kind(reference_kind),
                    owner: owner.to_string(),
                    name: name.to_string(),
                    desc: desc.to_string(),
                    is_interface,
                })
            }
            _ => Err(CodecError::BadConstant(index)),
        }
    }

    pub fn bootstrap(&self, index: u16) -> Result<BootstrapCall, CodecError> {
        let raw = self
            .bootstrap_methods
            .get(index as usize)
            .ok_or(CodecError::BadConstant(index))?;
        let method = self.handle(raw.bootstrap_method_ref)?;
        let arguments = raw
            .arguments
            .iter()
            .map(|arg| self.constant(*arg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BootstrapCall { method, arguments })
    }

    /// Resolves a loadable constant (`ldc` operand, bootstrap argument or
    /// `ConstantValue`).
    pub fn constant(&self, index: u16) -> Result<Constant, CodecError> {
        Ok(match self.get(index)? {
            PoolConstant::Integer(v) => Constant::Int(*v),
            PoolConstant::Float(v) => Constant::Float(v.to_bits()),
            PoolConstant::Long(v) => Constant::Long(*v),
            PoolConstant::Double(v) => Constant::Double(v.to_bits()),
            PoolConstant::String(s) => Constant::String(self.utf8(*s)?.to_string()),
            PoolConstant::Class(name) => Constant::Class(self.utf8(*name)?.to_string()),
            PoolConstant::MethodType(desc) => Constant::MethodType(self.utf8(*desc)?.to_string()),
            PoolConstant::MethodHandle { .. } => Constant::Handle(self.handle(index)?),
            PoolConstant::Dynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                let (name, desc) = self.name_and_type(*name_and_type_index)?;
                Constant::Dynamic(Box::new(DynamicConstant {
                    name: name.to_string(),
                    desc: desc.to_string(),
                    bootstrap: self.bootstrap(*bootstrap_method_attr_index)?,
                }))
            }
            _ => return Err(CodecError::BadConstant(index)),
        })
    }

    pub fn invoke_dynamic(&self, index: u16) -> Result<(String, String, BootstrapCall), CodecError> {
        match self.get(index)? {
            PoolConstant::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                let (name, desc) = self.name_and_type(*name_and_type_index)?;
                Ok((
                    name.to_string(),
                    desc.to_string(),
                    self.bootstrap(*bootstrap_method_attr_index)?,
                ))
            }
            _ => Err(CodecError::BadConstant(index)),
        }
    }
}

/// Interning key of a pool entry. Floating point values are keyed by their
/// bits so that every NaN payload gets its own slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Entry {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
}

impl Entry {
    fn to_constant(&self) -> Result<PoolConstant, CodecError> {
        Ok(match self {
            Entry::Utf8(value) => PoolConstant::Utf8(value.clone()),
            Entry::Integer(v) => PoolConstant::Integer(*v),
            Entry::Float(bits) => PoolConstant::Float(f32::from_bits(*bits)),
            Entry::Long(v) => PoolConstant::Long(*v),
            Entry::Double(bits) => PoolConstant::Double(f64::from_bits(*bits)),
            Entry::Class(name) => PoolConstant::Class(*name),
            Entry::String(value) => PoolConstant::String(*value),
            Entry::FieldRef(class_index, name_and_type_index) => PoolConstant::FieldRef {
                class_index: *class_index,
                name_and_type_index: *name_and_type_index,
            },
            Entry::MethodRef(class_index, name_and_type_index) => PoolConstant::MethodRef {
                class_index: *class_index,
                name_and_type_index: *name_and_type_index,
            },
            Entry::InterfaceMethodRef(class_index, name_and_type_index) => {
                PoolConstant::InterfaceMethodRef {
                    class_index: *class_index,
                    name_and_type_index: *name_and_type_index,
                }
            }
            Entry::NameAndType(name_index, descriptor_index) => PoolConstant::NameAndType {
                name_index: *name_index,
                descriptor_index: *descriptor_index,
            },
            Entry::MethodHandle(kind, reference_index) => PoolConstant::MethodHandle {
                reference_kind: reference_kind(*kind)?,
                reference_index: *reference_index,
            },
            Entry::MethodType(desc) => PoolConstant::MethodType(*desc),
            Entry::Dynamic(bootstrap_method_attr_index, name_and_type_index) => {
                PoolConstant::Dynamic {
                    bootstrap_method_attr_index: *bootstrap_method_attr_index,
                    name_and_type_index: *name_and_type_index,
                }
            }
            Entry::InvokeDynamic(bootstrap_method_attr_index, name_and_type_index) => {
                PoolConstant::InvokeDynamic {
                    bootstrap_method_attr_index: *bootstrap_method_attr_index,
                    name_and_type_index: *name_and_type_index,
                }
            }
        })
    }
}

/// Builds the constant pool of a class being written, deduplicating entries.
///
/// When seeded from a source pool every original index stays valid, so
/// opaque attributes copied from that class need no rewriting. New entries
/// are appended after the seeded ones.
#[derive(Debug, Default)]
pub struct PoolBuilder {
    pool: ConstantPool,
    index: HashMap<Entry, u16>,
    bootstrap: Vec<(u16, Vec<u16>)>,
    bootstrap_index: HashMap<(u16, Vec<u16>), u16>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(source: &SourcePool) -> Self {
        let mut builder = Self {
            pool: source.pool.clone(),
            ..Self::default()
        };
        for (i, raw) in source.bootstrap_methods.iter().enumerate() {
            let key = (raw.bootstrap_method_ref, raw.arguments.clone());
            builder.bootstrap_index.entry(key.clone()).or_insert(i as u16);
            builder.bootstrap.push(key);
        }
        builder
    }

    fn put(&mut self, entry: Entry) -> Result<u16, CodecError> {
        if let Some(index) = self.index.get(&entry) {
            return Ok(*index);
        }
        let index = self.pool.add(entry.to_constant()?)?;
        self.index.insert(entry, index);
        Ok(index)
    }

    pub fn utf8(&mut self, value: &str) -> Result<u16, CodecError> {
        if value.len() > u16::MAX as usize / 3 && modified_utf8_len(value) > u16::MAX as usize {
            return Err(CodecError::Limit(format!(
                "string constant of {} bytes",
                value.len()
            )));
        }
        self.put(Entry::Utf8(value.to_string()))
    }

    pub fn class(&mut self, name: &str) -> Result<u16, CodecError> {
        let name = self.utf8(name)?;
        self.put(Entry::Class(name))
    }

    pub fn optional_class(&mut self, name: Option<&str>) -> Result<u16, CodecError> {
        name.map_or(Ok(0), |name| self.class(name))
    }

    pub fn string(&mut self, value: &str) -> Result<u16, CodecError> {
        let value = self.utf8(value)?;
        self.put(Entry::String(value))
    }

    pub fn integer(&mut self, value: i32) -> Result<u16, CodecError> {
        self.put(Entry::Integer(value))
    }

    pub fn long(&mut self, value: i64) -> Result<u16, CodecError> {
        self.put(Entry::Long(value))
    }

    pub fn float(&mut self, bits: u32) -> Result<u16, CodecError> {
        self.put(Entry::Float(bits))
    }

    pub fn double(&mut self, bits: u64) -> Result<u16, CodecError> {
        self.put(Entry::Double(bits))
    }

    pub fn name_and_type(&mut self, name: &str, desc: &str) -> Result<u16, CodecError> {
        let name = self.utf8(name)?;
        let desc = self.utf8(desc)?;
        self.put(Entry::NameAndType(name, desc))
    }

    pub fn field_ref(&mut self, owner: &str, name: &str, desc: &str) -> Result<u16, CodecError> {
        let class = self.class(owner)?;
        let name_and_type = self.name_and_type(name, desc)?;
        self.put(Entry::FieldRef(class, name_and_type))
    }

    pub fn method_ref(
        &mut self,
        owner: &str,
        name: &str,
        desc: &str,
        is_interface: bool,
    ) -> Result<u16, CodecError> {
        let class = self.class(owner)?;
        let name_and_type = self.name_and_type(name, desc)?;
        if is_interface {
            self.put(Entry::InterfaceMethodRef(class, name_and_type))
        } else {
            self.put(Entry::MethodRef(class, name_and_type))
        }
    }

    pub fn handle(&mut self, handle: &Handle) -> Result<u16, CodecError> {
        let reference = if handle.kind <= H_PUTSTATIC {
            self.field_ref(&handle.owner, &handle.name, &handle.desc)?
        } else {
            self.method_ref(&handle.owner, &handle.name, &handle.desc, handle.is_interface)?
        };
        self.put(Entry::MethodHandle(handle.kind, reference))
    }

    pub fn bootstrap(&mut self, call: &BootstrapCall) -> Result<u16, CodecError> {
        let method = self.handle(&call.method)?;
        let arguments = call
            .arguments
            .iter()
            .map(|arg| self.constant(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let key = (method, arguments);
        if let Some(index) = self.bootstrap_index.get(&key) {
            return Ok(*index);
        }
        let index = u16::try_from(self.bootstrap.len())
            .map_err(|_| CodecError::Limit("too many bootstrap methods".into()))?;
        self.bootstrap.push(key.clone());
        self.bootstrap_index.insert(key, index);
        Ok(index)
    }

    pub fn invoke_dynamic(
        &mut self,
        name: &str,
        desc: &str,
        call: &BootstrapCall,
    ) -> Result<u16, CodecError> {
        let bootstrap = self.bootstrap(call)?;
        let name_and_type = self.name_and_type(name, desc)?;
        self.put(Entry::InvokeDynamic(bootstrap, name_and_type))
    }

    pub fn constant(&mut self, constant: &Constant) -> Result<u16, CodecError> {
        match constant {
            Constant::Int(v) => self.integer(*v),
            Constant::Float(bits) => self.float(*bits),
            Constant::Long(v) => self.long(*v),
            Constant::Double(bits) => self.double(*bits),
            Constant::String(s) => self.string(s),
            Constant::Class(name) => self.class(name),
            Constant::MethodType(desc) => {
                let desc = self.utf8(desc)?;
                self.put(Entry::MethodType(desc))
            }
            Constant::Handle(handle) => self.handle(handle),
            Constant::Dynamic(dynamic) => {
                let bootstrap = self.bootstrap(&dynamic.bootstrap)?;
                let name_and_type = self.name_and_type(&dynamic.name, &dynamic.desc)?;
                self.put(Entry::Dynamic(bootstrap, name_and_type))
            }
        }
    }

    pub fn has_bootstrap_methods(&self) -> bool {
        !self.bootstrap.is_empty()
    }

    pub fn bootstrap_methods(&self) -> Vec<BootstrapMethod> {
        self.bootstrap
            .iter()
            .map(|(method, arguments)| BootstrapMethod {
                bootstrap_method_ref: *method,
                arguments: arguments.clone(),
            })
            .collect()
    }

    pub fn finish(self) -> ConstantPool {
        self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_deduplicates_entries() {
        let mut pool = PoolBuilder::new();
        let a = pool.method_ref("java/lang/Object", "<init>", "()V", false).unwrap();
        let b = pool.method_ref("java/lang/Object", "<init>", "()V", false).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.class("java/lang/Object").unwrap(), pool.class("java/lang/Object").unwrap());
        assert_ne!(
            pool.method_ref("java/lang/Object", "<init>", "()V", true).unwrap(),
            a
        );
    }

    #[test]
    fn wide_entries_take_two_slots() {
        let mut pool = PoolBuilder::new();
        let long = pool.constant(&Constant::Long(7)).unwrap();
        let next = pool.utf8("after").unwrap();
        assert_eq!(next, long + 2);
    }

    #[test]
    fn seeded_builder_keeps_original_indices() {
        let mut source = ConstantPool::default();
        let name = source.add(PoolConstant::Utf8("Foo".into())).unwrap();
        let class = source.add(PoolConstant::Class(name)).unwrap();
        let source = SourcePool::new(source, Vec::new());

        let mut pool = PoolBuilder::seeded(&source);
        let bar = pool.utf8("Bar").unwrap();
        assert!(bar > class);
        let pool = SourcePool::new(pool.finish(), Vec::new());
        assert_eq!(pool.class_name(class).unwrap(), "Foo");
        assert_eq!(pool.utf8(bar).unwrap(), "Bar");
    }

    #[test]
    fn handles_resolve_through_their_member_reference() {
        let mut builder = PoolBuilder::new();
        let handle = Handle {
            kind: 6,
            owner: "app/Main".into(),
            name: "run".into(),
            desc: "()V".into(),
            is_interface: false,
        };
        let index = builder.handle(&handle).unwrap();
        let pool = SourcePool::new(builder.finish(), Vec::new());
        assert_eq!(pool.handle(index).unwrap(), handle);
        assert!(matches!(
            PoolBuilder::new().handle(&Handle { kind: 12, ..handle }),
            Err(CodecError::BadHandleKind(12))
        ));
    }

    #[test]
    fn modified_utf8_length_counts_nul_and_surrogates() {
        assert_eq!(modified_utf8_len("abc"), 3);
        assert_eq!(modified_utf8_len("\0"), 2);
        assert_eq!(modified_utf8_len("é"), 2);
        assert_eq!(modified_utf8_len("€"), 3);
        assert_eq!(modified_utf8_len("😀"), 6);
    }
}
