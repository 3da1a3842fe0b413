//! Encrypted repackaging of application classes.
//!
//! Each processed class is stored under an opaque `.bin` entry name and its
//! bytes are XOR-masked with the run key. A generated bootstrap class, which
//! becomes the archive's `Main-Class`, carries the name index and the key,
//! decrypts classes on demand in `findClass` and then hands control to the
//! original main class.

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::classfile::analysis::JdkOnly;
use crate::classfile::constant_pool::modified_utf8_len;
use crate::classfile::opcodes::*;
use crate::classfile::{ClassDocument, ClassWriter, Code, ComputeMode, Constant, Insn, MethodNode};
use crate::error::Error;

const KEY_LEN: usize = 32;
const STRING: &str = "java/lang/String";
const CLASS_LOADER: &str = "java/lang/ClassLoader";
const NOT_FOUND: &str = "java/lang/ClassNotFoundException";

/// Generated loader class ready to be written to the archive.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub name: String,
    pub entry_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct Packager {
    key: String,
    mappings: Mutex<BTreeMap<String, String>>,
}

impl Packager {
    /// Creates a packager with a fresh key. A seed makes the key, and
    /// therefore every entry name, reproducible.
    pub fn new(seed: Option<u64>) -> Self {
        let key = match seed {
            Some(seed) => random_key(StdRng::seed_from_u64(seed)),
            None => random_key(rand::thread_rng()),
        };
        Self::with_key(key)
    }

    /// Uses `key` as is. It must be non-empty ASCII, since the bootstrap
    /// class reads it back one `char` per byte.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            mappings: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bootstrap_name(&self) -> String {
        let digest = Sha256::digest(self.key.as_bytes());
        format!("shroud/L{}", &hex::encode(digest)[..8])
    }

    /// `hex(sha256(key ++ internal_name))`, truncated to 32 digits, plus `.bin`.
    pub fn encrypt_name(&self, internal_name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update(internal_name.as_bytes());
        format!("{}.bin", &hex::encode(hasher.finalize())[..32])
    }

    /// XORs byte `i` with `key[i % len] + i`. Applying it twice restores the input.
    pub fn encrypt_class(&self, bytes: &[u8]) -> Vec<u8> {
        let key = self.key.as_bytes();
        if key.is_empty() {
            return bytes.to_vec();
        }
        bytes
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ (key[i % key.len()] as usize).wrapping_add(i) as u8)
            .collect()
    }

    pub fn decrypt_class(&self, bytes: &[u8]) -> Vec<u8> {
        self.encrypt_class(bytes)
    }

    /// Encrypts one class and records its entry name.
    pub fn package(&self, internal_name: &str, bytes: &[u8]) -> anyhow::Result<(String, Vec<u8>)> {
        if internal_name == self.bootstrap_name() {
            anyhow::bail!("class {internal_name} collides with the bootstrap loader");
        }
        let entry_name = self.encrypt_name(internal_name);
        self.mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(internal_name.to_string(), entry_name.clone());
        Ok((entry_name, self.encrypt_class(bytes)))
    }

    pub fn mappings(&self) -> BTreeMap<String, String> {
        self.mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Builds the loader class that launches `main_class` (a dotted binary name).
    pub fn generate_bootstrap(&self, main_class: &str) -> Result<Bootstrap, Error> {
        let name = self.bootstrap_name();
        let mut index = String::from("\n");
        for (class, entry) in self.mappings() {
            index.push_str(&class);
            index.push('=');
            index.push_str(&entry);
            index.push('\n');
        }
        if modified_utf8_len(&index) > u16::MAX as usize {
            return Err(Error::Packaging(format!(
                "name index for {} classes does not fit in one string constant",
                self.mappings().len()
            )));
        }

        let document = ClassDocument {
            major_version: V1_8,
            access: ACC_PUBLIC | ACC_SUPER,
            name: name.clone(),
            super_name: Some(CLASS_LOADER.into()),
            methods: vec![
                constructor(),
                find_class(&index, &self.key),
                launcher(&name, main_class),
            ],
            ..ClassDocument::default()
        };
        let bytes = ClassWriter::new(ComputeMode::Frames, &JdkOnly)
            .write(&document)
            .map_err(|e| Error::Packaging(format!("cannot assemble bootstrap class: {e}")))?;
        debug!(class = %name, classes = self.mappings().len(), "bootstrap generated");
        Ok(Bootstrap {
            entry_name: format!("{name}.class"),
            name,
            bytes,
        })
    }
}

fn random_key(rng: impl Rng) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(KEY_LEN)
        .map(char::from)
        .collect()
}

fn var(opcode: u8, var: u16) -> Insn {
    Insn::Var { opcode, var }
}

fn call(opcode: u8, owner: &str, name: &str, desc: &str) -> Insn {
    Insn::Method {
        opcode,
        owner: owner.into(),
        name: name.into(),
        desc: desc.into(),
        is_interface: false,
    }
}

fn text(value: &str) -> Insn {
    Insn::Ldc(Constant::String(value.into()))
}

fn method(access: u16, name: &str, desc: &str, exceptions: &[&str], code: Code) -> MethodNode {
    MethodNode {
        access,
        name: name.into(),
        desc: desc.into(),
        signature: None,
        exceptions: exceptions.iter().map(|e| e.to_string()).collect(),
        code: Some(code),
        attributes: Vec::new(),
    }
}

fn throw_not_found() -> [Insn; 5] {
    [
        Insn::Type { opcode: NEW, desc: NOT_FOUND.into() },
        Insn::Simple(DUP),
        var(ALOAD, 1),
        call(INVOKESPECIAL, NOT_FOUND, "<init>", "(Ljava/lang/String;)V"),
        Insn::Simple(ATHROW),
    ]
}

/// `public L(ClassLoader parent) { super(parent); }`
fn constructor() -> MethodNode {
    let code = Code {
        instructions: vec![
            var(ALOAD, 0),
            var(ALOAD, 1),
            call(INVOKESPECIAL, CLASS_LOADER, "<init>", "(Ljava/lang/ClassLoader;)V"),
            Insn::Simple(RETURN),
        ],
        ..Code::default()
    };
    method(ACC_PUBLIC, "<init>", "(Ljava/lang/ClassLoader;)V", &[], code)
}

/// Looks the class up in the `\nname=entry\n` index, reads the entry through
/// the parent loader, unmasks it and defines it.
fn find_class(index: &str, key: &str) -> MethodNode {
    let mut code = Code::default();
    let found = code.new_label();
    let read = code.new_label();
    let top = code.new_label();
    let done = code.new_label();

    let mut insns = vec![
        // String internal = name.replace('.', '/');
        var(ALOAD, 1),
        Insn::Int { opcode: BIPUSH, operand: '.' as i32 },
        Insn::Int { opcode: BIPUSH, operand: '/' as i32 },
        call(INVOKEVIRTUAL, STRING, "replace", "(CC)Ljava/lang/String;"),
        var(ASTORE, 2),
        // int at = INDEX.indexOf("\n".concat(internal).concat("="));
        text(index),
        text("\n"),
        var(ALOAD, 2),
        call(INVOKEVIRTUAL, STRING, "concat", "(Ljava/lang/String;)Ljava/lang/String;"),
        text("="),
        call(INVOKEVIRTUAL, STRING, "concat", "(Ljava/lang/String;)Ljava/lang/String;"),
        call(INVOKEVIRTUAL, STRING, "indexOf", "(Ljava/lang/String;)I"),
        var(ISTORE, 3),
        var(ILOAD, 3),
        Insn::Jump { opcode: IFGE, target: found },
    ];
    insns.extend(throw_not_found());
    insns.extend([
        Insn::Label(found),
        // int start = at + internal.length() + 2;
        var(ILOAD, 3),
        var(ALOAD, 2),
        call(INVOKEVIRTUAL, STRING, "length", "()I"),
        Insn::Simple(IADD),
        Insn::Simple(ICONST_2),
        Insn::Simple(IADD),
        var(ISTORE, 4),
        // int end = INDEX.indexOf('\n', start);
        text(index),
        Insn::Int { opcode: BIPUSH, operand: '\n' as i32 },
        var(ILOAD, 4),
        call(INVOKEVIRTUAL, STRING, "indexOf", "(II)I"),
        var(ISTORE, 5),
        text(index),
        var(ILOAD, 4),
        var(ILOAD, 5),
        call(INVOKEVIRTUAL, STRING, "substring", "(II)Ljava/lang/String;"),
        var(ASTORE, 6),
        // InputStream in = getParent().getResourceAsStream(entry);
        var(ALOAD, 0),
        call(INVOKEVIRTUAL, CLASS_LOADER, "getParent", "()Ljava/lang/ClassLoader;"),
        var(ALOAD, 6),
        call(INVOKEVIRTUAL, CLASS_LOADER, "getResourceAsStream", "(Ljava/lang/String;)Ljava/io/InputStream;"),
        var(ASTORE, 7),
        var(ALOAD, 7),
        Insn::Jump { opcode: IFNONNULL, target: read },
    ]);
    insns.extend(throw_not_found());
    insns.extend([
        Insn::Label(read),
        var(ALOAD, 7),
        call(INVOKEVIRTUAL, "java/io/InputStream", "readAllBytes", "()[B"),
        var(ASTORE, 8),
        Insn::Simple(ICONST_0),
        var(ISTORE, 9),
        text(key),
        var(ASTORE, 10),
        Insn::Label(top),
        var(ILOAD, 9),
        var(ALOAD, 8),
        Insn::Simple(ARRAYLENGTH),
        Insn::Jump { opcode: IF_ICMPGE, target: done },
        // data[i] = (byte) (data[i] ^ (key.charAt(i % key.length()) + i));
        var(ALOAD, 8),
        var(ILOAD, 9),
        var(ALOAD, 8),
        var(ILOAD, 9),
        Insn::Simple(BALOAD),
        var(ALOAD, 10),
        var(ILOAD, 9),
        var(ALOAD, 10),
        call(INVOKEVIRTUAL, STRING, "length", "()I"),
        Insn::Simple(IREM),
        call(INVOKEVIRTUAL, STRING, "charAt", "(I)C"),
        var(ILOAD, 9),
        Insn::Simple(IADD),
        Insn::Simple(IXOR),
        Insn::Simple(I2B),
        Insn::Simple(BASTORE),
        Insn::Iinc { var: 9, increment: 1 },
        Insn::Jump { opcode: GOTO, target: top },
        Insn::Label(done),
        var(ALOAD, 0),
        var(ALOAD, 1),
        var(ALOAD, 8),
        Insn::Simple(ICONST_0),
        var(ALOAD, 8),
        Insn::Simple(ARRAYLENGTH),
        call(INVOKEVIRTUAL, CLASS_LOADER, "defineClass", "(Ljava/lang/String;[BII)Ljava/lang/Class;"),
        Insn::Simple(ARETURN),
    ]);
    code.instructions = insns;

    method(
        ACC_PROTECTED,
        "findClass",
        "(Ljava/lang/String;)Ljava/lang/Class;",
        &[NOT_FOUND],
        code,
    )
}

/// `new L(L.class.getClassLoader()).loadClass(main).getMethod("main", String[].class).invoke(null, args)`
fn launcher(owner: &str, main_class: &str) -> MethodNode {
    let code = Code {
        instructions: vec![
            Insn::Type { opcode: NEW, desc: owner.into() },
            Insn::Simple(DUP),
            Insn::Ldc(Constant::Class(owner.into())),
            call(INVOKEVIRTUAL, "java/lang/Class", "getClassLoader", "()Ljava/lang/ClassLoader;"),
            call(INVOKESPECIAL, owner, "<init>", "(Ljava/lang/ClassLoader;)V"),
            text(main_class),
            call(INVOKEVIRTUAL, CLASS_LOADER, "loadClass", "(Ljava/lang/String;)Ljava/lang/Class;"),
            text("main"),
            Insn::Simple(ICONST_1),
            Insn::Type { opcode: ANEWARRAY, desc: "java/lang/Class".into() },
            Insn::Simple(DUP),
            Insn::Simple(ICONST_0),
            Insn::Ldc(Constant::Class("[Ljava/lang/String;".into())),
            Insn::Simple(AASTORE),
            call(
                INVOKEVIRTUAL,
                "java/lang/Class",
                "getMethod",
                "(Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;",
            ),
            Insn::Simple(ACONST_NULL),
            Insn::Simple(ICONST_1),
            Insn::Type { opcode: ANEWARRAY, desc: "java/lang/Object".into() },
            Insn::Simple(DUP),
            Insn::Simple(ICONST_0),
            var(ALOAD, 0),
            Insn::Simple(AASTORE),
            call(
                INVOKEVIRTUAL,
                "java/lang/reflect/Method",
                "invoke",
                "(Ljava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;",
            ),
            Insn::Simple(POP),
            Insn::Simple(RETURN),
        ],
        ..Code::default()
    };
    method(
        ACC_PUBLIC | ACC_STATIC,
        "main",
        "([Ljava/lang/String;)V",
        &["java/lang/Exception"],
        code,
    )
}
