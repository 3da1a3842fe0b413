//! Superclass table for JDK types that application code merges most often.
//!
//! The run's classpath rarely contains the runtime image, so frame merges
//! between, say, two exception types would otherwise have no answer.

use super::TypeInfo;

const CLASSES: &[(&str, &str)] = &[
    ("java/lang/String", "java/lang/Object"),
    ("java/lang/Class", "java/lang/Object"),
    ("java/lang/ClassLoader", "java/lang/Object"),
    ("java/lang/Thread", "java/lang/Object"),
    ("java/lang/Enum", "java/lang/Object"),
    ("java/lang/Record", "java/lang/Object"),
    ("java/lang/Number", "java/lang/Object"),
    ("java/lang/Integer", "java/lang/Number"),
    ("java/lang/Long", "java/lang/Number"),
    ("java/lang/Short", "java/lang/Number"),
    ("java/lang/Byte", "java/lang/Number"),
    ("java/lang/Float", "java/lang/Number"),
    ("java/lang/Double", "java/lang/Number"),
    ("java/lang/Boolean", "java/lang/Object"),
    ("java/lang/Character", "java/lang/Object"),
    ("java/lang/AbstractStringBuilder", "java/lang/Object"),
    ("java/lang/StringBuilder", "java/lang/AbstractStringBuilder"),
    ("java/lang/StringBuffer", "java/lang/AbstractStringBuilder"),
    ("java/lang/Throwable", "java/lang/Object"),
    ("java/lang/Exception", "java/lang/Throwable"),
    ("java/lang/Error", "java/lang/Throwable"),
    ("java/lang/RuntimeException", "java/lang/Exception"),
    ("java/lang/ReflectiveOperationException", "java/lang/Exception"),
    ("java/lang/ClassNotFoundException", "java/lang/ReflectiveOperationException"),
    ("java/lang/NoSuchMethodException", "java/lang/ReflectiveOperationException"),
    ("java/lang/NoSuchFieldException", "java/lang/ReflectiveOperationException"),
    ("java/lang/IllegalAccessException", "java/lang/ReflectiveOperationException"),
    ("java/lang/InstantiationException", "java/lang/ReflectiveOperationException"),
    ("java/lang/reflect/InvocationTargetException", "java/lang/ReflectiveOperationException"),
    ("java/lang/InterruptedException", "java/lang/Exception"),
    ("java/lang/CloneNotSupportedException", "java/lang/Exception"),
    ("java/lang/IllegalArgumentException", "java/lang/RuntimeException"),
    ("java/lang/NumberFormatException", "java/lang/IllegalArgumentException"),
    ("java/lang/IllegalStateException", "java/lang/RuntimeException"),
    ("java/lang/NullPointerException", "java/lang/RuntimeException"),
    ("java/lang/ClassCastException", "java/lang/RuntimeException"),
    ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
    ("java/lang/UnsupportedOperationException", "java/lang/RuntimeException"),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException"),
    ("java/lang/ArrayIndexOutOfBoundsException", "java/lang/IndexOutOfBoundsException"),
    ("java/lang/StringIndexOutOfBoundsException", "java/lang/IndexOutOfBoundsException"),
    ("java/lang/SecurityException", "java/lang/RuntimeException"),
    ("java/util/NoSuchElementException", "java/lang/RuntimeException"),
    ("java/util/ConcurrentModificationException", "java/lang/RuntimeException"),
    ("java/lang/LinkageError", "java/lang/Error"),
    ("java/lang/NoClassDefFoundError", "java/lang/LinkageError"),
    ("java/lang/ExceptionInInitializerError", "java/lang/LinkageError"),
    ("java/lang/VirtualMachineError", "java/lang/Error"),
    ("java/lang/OutOfMemoryError", "java/lang/VirtualMachineError"),
    ("java/lang/StackOverflowError", "java/lang/VirtualMachineError"),
    ("java/lang/AssertionError", "java/lang/Error"),
    ("java/io/IOException", "java/lang/Exception"),
    ("java/io/FileNotFoundException", "java/io/IOException"),
    ("java/io/UncheckedIOException", "java/lang/RuntimeException"),
    ("java/io/InputStream", "java/lang/Object"),
    ("java/io/OutputStream", "java/lang/Object"),
    ("java/io/FilterOutputStream", "java/io/OutputStream"),
    ("java/io/PrintStream", "java/io/FilterOutputStream"),
    ("java/io/File", "java/lang/Object"),
    ("java/util/AbstractCollection", "java/lang/Object"),
    ("java/util/AbstractList", "java/util/AbstractCollection"),
    ("java/util/AbstractSequentialList", "java/util/AbstractList"),
    ("java/util/AbstractSet", "java/util/AbstractCollection"),
    ("java/util/AbstractMap", "java/lang/Object"),
    ("java/util/ArrayList", "java/util/AbstractList"),
    ("java/util/LinkedList", "java/util/AbstractSequentialList"),
    ("java/util/HashSet", "java/util/AbstractSet"),
    ("java/util/LinkedHashSet", "java/util/HashSet"),
    ("java/util/TreeSet", "java/util/AbstractSet"),
    ("java/util/HashMap", "java/util/AbstractMap"),
    ("java/util/LinkedHashMap", "java/util/HashMap"),
    ("java/util/TreeMap", "java/util/AbstractMap"),
];

const INTERFACES: &[&str] = &[
    "java/lang/CharSequence",
    "java/lang/Comparable",
    "java/lang/Runnable",
    "java/lang/Iterable",
    "java/lang/AutoCloseable",
    "java/io/Closeable",
    "java/io/Serializable",
    "java/util/Collection",
    "java/util/List",
    "java/util/Set",
    "java/util/Map",
    "java/util/Iterator",
    "java/util/function/Function",
    "java/util/function/Supplier",
    "java/util/function/Consumer",
];

pub fn lookup(name: &str) -> Option<TypeInfo> {
    if name == "java/lang/Object" {
        return Some(TypeInfo {
            super_name: None,
            is_interface: false,
        });
    }
    if let Some((_, parent)) = CLASSES.iter().find(|(class, _)| *class == name) {
        return Some(TypeInfo {
            super_name: Some((*parent).to_string()),
            is_interface: false,
        });
    }
    INTERFACES.contains(&name).then(|| TypeInfo {
        super_name: Some("java/lang/Object".to_string()),
        is_interface: true,
    })
}
