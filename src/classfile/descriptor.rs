//! Field and method descriptors, plus remapping of class names inside
//! descriptors and generic signatures.

use std::str::FromStr;

use jdescriptor::{MethodDescriptor, TypeDescriptor};
use ristretto_classfile::{BaseType, FieldType};

use super::CodecError;

fn parse_method(desc: &str) -> Result<MethodDescriptor, CodecError> {
    MethodDescriptor::from_str(desc).map_err(|_| CodecError::Descriptor(desc.to_string()))
}

/// Descriptor text of one parsed type.
pub fn render(ty: &TypeDescriptor, out: &mut String) {
    match ty {
        TypeDescriptor::Byte => out.push('B'),
        TypeDescriptor::Char => out.push('C'),
        TypeDescriptor::Double => out.push('D'),
        TypeDescriptor::Float => out.push('F'),
        TypeDescriptor::Int => out.push('I'),
        TypeDescriptor::Long => out.push('J'),
        TypeDescriptor::Short => out.push('S'),
        TypeDescriptor::Boolean => out.push('Z'),
        TypeDescriptor::Void => out.push('V'),
        TypeDescriptor::Object(name) => {
            out.push('L');
            out.push_str(name);
            out.push(';');
        }
        TypeDescriptor::Array(element, dims) => {
            for _ in 0..*dims {
                out.push('[');
            }
            render(element, out);
        }
    }
}

fn rendered(ty: &TypeDescriptor) -> String {
    let mut out = String::new();
    render(ty, &mut out);
    out
}

fn type_slots(ty: &TypeDescriptor) -> usize {
    match ty {
        TypeDescriptor::Long | TypeDescriptor::Double => 2,
        TypeDescriptor::Void => 0,
        _ => 1,
    }
}

fn to_field_type(ty: &TypeDescriptor) -> Option<FieldType> {
    Some(match ty {
        TypeDescriptor::Byte => FieldType::Base(BaseType::Byte),
        TypeDescriptor::Char => FieldType::Base(BaseType::Char),
        TypeDescriptor::Double => FieldType::Base(BaseType::Double),
        TypeDescriptor::Float => FieldType::Base(BaseType::Float),
        TypeDescriptor::Int => FieldType::Base(BaseType::Int),
        TypeDescriptor::Long => FieldType::Base(BaseType::Long),
        TypeDescriptor::Short => FieldType::Base(BaseType::Short),
        TypeDescriptor::Boolean => FieldType::Base(BaseType::Boolean),
        TypeDescriptor::Void => return None,
        TypeDescriptor::Object(name) => FieldType::Object(name.clone()),
        TypeDescriptor::Array(element, dims) => {
            let mut ty = to_field_type(element)?;
            for _ in 0..*dims {
                ty = FieldType::Array(Box::new(ty));
            }
            ty
        }
    })
}

/// Field type of a field descriptor, as stored on a written field.
pub fn field_type(desc: &str) -> Result<FieldType, CodecError> {
    TypeDescriptor::from_str(desc)
        .ok()
        .as_ref()
        .and_then(to_field_type)
        .ok_or_else(|| CodecError::Descriptor(desc.to_string()))
}

/// Splits `(IJLjava/lang/String;)V` into its argument descriptors.
pub fn method_arguments(desc: &str) -> Result<Vec<String>, CodecError> {
    Ok(parse_method(desc)?.parameter_types().iter().map(rendered).collect())
}

pub fn method_return(desc: &str) -> Result<String, CodecError> {
    Ok(rendered(parse_method(desc)?.return_type()))
}

/// Number of local slots a single value of this field descriptor occupies.
pub fn slot_size(field_desc: &str) -> usize {
    TypeDescriptor::from_str(field_desc).map_or(0, |ty| type_slots(&ty))
}

/// Slots taken by the arguments of a method descriptor, excluding `this`.
pub fn arguments_size(desc: &str) -> Result<usize, CodecError> {
    Ok(parse_method(desc)?.parameter_types().iter().map(type_slots).sum())
}

fn remap_parsed(ty: &TypeDescriptor, map: &dyn Fn(&str) -> Option<String>, out: &mut String) {
    match ty {
        TypeDescriptor::Object(name) => {
            out.push('L');
            out.push_str(&map(name).unwrap_or_else(|| name.clone()));
            out.push(';');
        }
        TypeDescriptor::Array(element, dims) => {
            for _ in 0..*dims {
                out.push('[');
            }
            remap_parsed(element, map, out);
        }
        other => render(other, out),
    }
}

/// Rewrites every class name in a field or method descriptor through `map`.
/// Text that is not a well-formed descriptor comes back unchanged.
pub fn remap_descriptor(desc: &str, map: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(desc.len());
    if desc.starts_with('(') {
        let Ok(method) = MethodDescriptor::from_str(desc) else {
            return desc.to_string();
        };
        out.push('(');
        for param in method.parameter_types().iter() {
            remap_parsed(param, map, &mut out);
        }
        out.push(')');
        remap_parsed(method.return_type(), map, &mut out);
    } else {
        let Ok(ty) = TypeDescriptor::from_str(desc) else {
            return desc.to_string();
        };
        remap_parsed(&ty, map, &mut out);
    }
    out
}

/// Remaps an internal name or, when it starts with `[`, an array descriptor.
pub fn remap_type(name: &str, map: &dyn Fn(&str) -> Option<String>) -> String {
    if name.starts_with('[') {
        remap_descriptor(name, map)
    } else {
        map(name).unwrap_or_else(|| name.to_string())
    }
}

/// Rewrites class names inside a generic signature (class, method or field).
///
/// A renamed inner class reached through `Outer<..>.Inner` is collapsed to
/// its new top-level name, since the rename map is flat.
pub fn remap_signature(sig: &str, map: &dyn Fn(&str) -> Option<String>) -> String {
    let mut remapper = SignatureRemapper {
        src: sig.as_bytes(),
        at: 0,
        out: String::with_capacity(sig.len()),
        map,
    };
    if remapper.signature().is_none() {
        return sig.to_string();
    }
    remapper.out
}

struct SignatureRemapper<'a> {
    src: &'a [u8],
    at: usize,
    out: String,
    map: &'a dyn Fn(&str) -> Option<String>,
}

impl SignatureRemapper<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.at).copied()
    }

    fn copy_one(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.out.push(b as char);
        self.at += 1;
        Some(b)
    }

    fn identifier(&mut self) -> Option<&str> {
        let start = self.at;
        while let Some(b) = self.peek() {
            if matches!(b, b';' | b'<' | b'>' | b'.' | b':' | b'/') {
                break;
            }
            self.at += 1;
        }
        std::str::from_utf8(&self.src[start..self.at]).ok()
    }

    fn signature(&mut self) -> Option<()> {
        if self.peek() == Some(b'<') {
            self.formal_type_parameters()?;
        }
        if self.peek() == Some(b'(') {
            self.copy_one();
            while self.peek()? != b')' {
                self.type_signature()?;
            }
            self.copy_one();
            self.type_signature()?;
            while self.peek() == Some(b'^') {
                self.copy_one();
                self.type_signature()?;
            }
        } else {
            while self.peek().is_some() {
                self.type_signature()?;
            }
        }
        Some(())
    }

    fn formal_type_parameters(&mut self) -> Option<()> {
        self.copy_one();
        while self.peek()? != b'>' {
            let name = self.identifier()?.to_string();
            self.out.push_str(&name);
            while self.peek()? == b':' {
                self.copy_one();
                if matches!(self.peek()?, b'L' | b'T' | b'[') {
                    self.type_signature()?;
                }
            }
        }
        self.copy_one();
        Some(())
    }

    fn type_signature(&mut self) -> Option<()> {
        match self.peek()? {
            b'L' => self.class_type(),
            b'T' => {
                while self.copy_one()? != b';' {}
                Some(())
            }
            b'[' => {
                self.copy_one();
                self.type_signature()
            }
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b'V' => {
                self.copy_one();
                Some(())
            }
            _ => None,
        }
    }

    fn class_type(&mut self) -> Option<()> {
        self.at += 1;
        let start = self.at;
        while !matches!(self.peek()?, b';' | b'<' | b'.') {
            self.at += 1;
        }
        let mut original = std::str::from_utf8(&self.src[start..self.at]).ok()?.to_string();
        let mut segment_start = self.out.len();
        self.out.push('L');
        self.out.push_str(&(self.map)(&original).unwrap_or_else(|| original.clone()));

        loop {
            match self.peek()? {
                b'<' => {
                    self.copy_one();
                    while self.peek()? != b'>' {
                        match self.peek()? {
                            b'*' => {
                                self.copy_one();
                            }
                            b'+' | b'-' => {
                                self.copy_one();
                                self.type_signature()?;
                            }
                            _ => self.type_signature()?,
                        }
                    }
                    self.copy_one();
                }
                b'.' => {
                    self.at += 1;
                    let inner = self.identifier()?.to_string();
                    original = format!("{original}${inner}");
                    match (self.map)(&original) {
                        Some(mapped) => {
                            self.out.truncate(segment_start);
                            self.out.push('L');
                            self.out.push_str(&mapped);
                            segment_start = self.out.len() - mapped.len() - 1;
                        }
                        None => {
                            self.out.push('.');
                            self.out.push_str(&inner);
                        }
                    }
                }
                b';' => {
                    self.copy_one();
                    return Some(());
                }
                _ => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rename(name: &str) -> Option<String> {
        match name {
            "com/example/Foo" => Some("a/A".to_string()),
            "com/example/Foo$Bar" => Some("a/B".to_string()),
            _ => None,
        }
    }

    #[test]
    fn splits_method_arguments() {
        let args = method_arguments("(I[JLjava/lang/String;[[Lcom/example/Foo;D)V").unwrap();
        assert_eq!(args, vec!["I", "[J", "Ljava/lang/String;", "[[Lcom/example/Foo;", "D"]);
        assert_eq!(method_return("(I)Ljava/lang/Object;").unwrap(), "Ljava/lang/Object;");
        assert_eq!(arguments_size("(IJD[J)V").unwrap(), 1 + 2 + 2 + 1);
        assert_eq!((slot_size("J"), slot_size("[J"), slot_size("V")), (2, 1, 0));
    }

    #[test]
    fn field_types_nest_arrays() {
        assert!(matches!(field_type("I").unwrap(), FieldType::Base(BaseType::Int)));
        match field_type("[[Ljava/lang/String;").unwrap() {
            FieldType::Array(inner) => match *inner {
                FieldType::Array(element) => {
                    assert!(matches!(*element, FieldType::Object(ref name) if name == "java/lang/String"))
                }
                other => panic!("expected nested array, got {other:?}"),
            },
            other => panic!("expected array, got {other:?}"),
        }
        assert!(field_type("V").is_err());
    }

    #[test]
    fn rejects_malformed_descriptor() {
        assert!(method_arguments("(Q)V").is_err());
        assert!(method_arguments("I)V").is_err());
        assert_eq!(remap_descriptor("(Q)V", &rename), "(Q)V");
    }

    #[test]
    fn remaps_descriptor_class_names() {
        assert_eq!(
            remap_descriptor("(Lcom/example/Foo;I)[Lcom/example/Foo;", &rename),
            "(La/A;I)[La/A;"
        );
        assert_eq!(remap_type("[Lcom/example/Foo;", &rename), "[La/A;");
        assert_eq!(remap_type("com/example/Foo", &rename), "a/A");
        assert_eq!(remap_type("java/lang/Object", &rename), "java/lang/Object");
    }

    #[test]
    fn remaps_generic_signatures() {
        let sig = "<T:Lcom/example/Foo;L:Ljava/lang/Object;>Ljava/util/List<TT;>;";
        assert_eq!(
            remap_signature(sig, &rename),
            "<T:La/A;L:Ljava/lang/Object;>Ljava/util/List<TT;>;"
        );

        let method = "<X:Ljava/lang/Object;>(Ljava/util/Map<+Lcom/example/Foo;*>;)TX;^Ljava/io/IOException;";
        assert_eq!(
            remap_signature(method, &rename),
            "<X:Ljava/lang/Object;>(Ljava/util/Map<+La/A;*>;)TX;^Ljava/io/IOException;"
        );
    }

    #[test]
    fn collapses_renamed_inner_class_segment() {
        assert_eq!(
            remap_signature("Lcom/example/Foo<TT;>.Bar<TU;>;", &rename),
            "La/B<TU;>;"
        );
    }
}
