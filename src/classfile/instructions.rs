//! Opcode tables between `ristretto_classfile` instructions and the model's
//! opcode vocabulary.

use ristretto_classfile::attributes::{ArrayType, Instruction};

use super::opcodes::*;

macro_rules! simple_instructions {
    ($($variant:ident => $opcode:ident),* $(,)?) => {
        /// Opcode of an instruction without operands.
        pub fn simple_opcode(instruction: &Instruction) -> Option<u8> {
            match instruction {
                $(Instruction::$variant => Some($opcode),)*
                _ => None,
            }
        }

        pub fn simple_instruction(opcode: u8) -> Option<Instruction> {
            match opcode {
                $($opcode => Some(Instruction::$variant),)*
                _ => None,
            }
        }
    };
}

simple_instructions! {
    Nop => NOP,
    Aconst_null => ACONST_NULL,
    Iconst_m1 => ICONST_M1,
    Iconst_0 => ICONST_0,
    Iconst_1 => ICONST_1,
    Iconst_2 => ICONST_2,
    Iconst_3 => ICONST_3,
    Iconst_4 => ICONST_4,
    Iconst_5 => ICONST_5,
    Lconst_0 => LCONST_0,
    Lconst_1 => LCONST_1,
    Fconst_0 => FCONST_0,
    Fconst_1 => FCONST_1,
    Fconst_2 => FCONST_2,
    Dconst_0 => DCONST_0,
    Dconst_1 => DCONST_1,
    Iaload => IALOAD,
    Laload => LALOAD,
    Faload => FALOAD,
    Daload => DALOAD,
    Aaload => AALOAD,
    Baload => BALOAD,
    Caload => CALOAD,
    Saload => SALOAD,
    Iastore => IASTORE,
    Lastore => LASTORE,
    Fastore => FASTORE,
    Dastore => DASTORE,
    Aastore => AASTORE,
    Bastore => BASTORE,
    Castore => CASTORE,
    Sastore => SASTORE,
    Pop => POP,
    Pop2 => POP2,
    Dup => DUP,
    Dup_x1 => DUP_X1,
    Dup_x2 => DUP_X2,
    Dup2 => DUP2,
    Dup2_x1 => DUP2_X1,
    Dup2_x2 => DUP2_X2,
    Swap => SWAP,
    Iadd => IADD,
    Ladd => LADD,
    Fadd => FADD,
    Dadd => DADD,
    Isub => ISUB,
    Lsub => LSUB,
    Fsub => FSUB,
    Dsub => DSUB,
    Imul => IMUL,
    Lmul => LMUL,
    Fmul => FMUL,
    Dmul => DMUL,
    Idiv => IDIV,
    Ldiv => LDIV,
    Fdiv => FDIV,
    Ddiv => DDIV,
    Irem => IREM,
    Lrem => LREM,
    Frem => FREM,
    Drem => DREM,
    Ineg => INEG,
    Lneg => LNEG,
    Fneg => FNEG,
    Dneg => DNEG,
    Ishl => ISHL,
    Lshl => LSHL,
    Ishr => ISHR,
    Lshr => LSHR,
    Iushr => IUSHR,
    Lushr => LUSHR,
    Iand => IAND,
    Land => LAND,
    Ior => IOR,
    Lor => LOR,
    Ixor => IXOR,
    Lxor => LXOR,
    I2l => I2L,
    I2f => I2F,
    I2d => I2D,
    L2i => L2I,
    L2f => L2F,
    L2d => L2D,
    F2i => F2I,
    F2l => F2L,
    F2d => F2D,
    D2i => D2I,
    D2l => D2L,
    D2f => D2F,
    I2b => I2B,
    I2c => I2C,
    I2s => I2S,
    Lcmp => LCMP,
    Fcmpl => FCMPL,
    Fcmpg => FCMPG,
    Dcmpl => DCMPL,
    Dcmpg => DCMPG,
    Ireturn => IRETURN,
    Lreturn => LRETURN,
    Freturn => FRETURN,
    Dreturn => DRETURN,
    Areturn => ARETURN,
    Return => RETURN,
    Arraylength => ARRAYLENGTH,
    Athrow => ATHROW,
    Monitorenter => MONITORENTER,
    Monitorexit => MONITOREXIT,
}

/// Local variable instruction in its indexed form: `(opcode, var)`.
pub fn var_operand(instruction: &Instruction) -> Option<(u8, u16)> {
    use Instruction as I;
    Some(match instruction {
        I::Iload(v) => (ILOAD, *v as u16),
        I::Lload(v) => (LLOAD, *v as u16),
        I::Fload(v) => (FLOAD, *v as u16),
        I::Dload(v) => (DLOAD, *v as u16),
        I::Aload(v) => (ALOAD, *v as u16),
        I::Istore(v) => (ISTORE, *v as u16),
        I::Lstore(v) => (LSTORE, *v as u16),
        I::Fstore(v) => (FSTORE, *v as u16),
        I::Dstore(v) => (DSTORE, *v as u16),
        I::Astore(v) => (ASTORE, *v as u16),
        I::Ret(v) => (RET, *v as u16),
        I::Iload_w(v) => (ILOAD, *v),
        I::Lload_w(v) => (LLOAD, *v),
        I::Fload_w(v) => (FLOAD, *v),
        I::Dload_w(v) => (DLOAD, *v),
        I::Aload_w(v) => (ALOAD, *v),
        I::Istore_w(v) => (ISTORE, *v),
        I::Lstore_w(v) => (LSTORE, *v),
        I::Fstore_w(v) => (FSTORE, *v),
        I::Dstore_w(v) => (DSTORE, *v),
        I::Astore_w(v) => (ASTORE, *v),
        I::Ret_w(v) => (RET, *v),
        I::Iload_0 => (ILOAD, 0),
        I::Iload_1 => (ILOAD, 1),
        I::Iload_2 => (ILOAD, 2),
        I::Iload_3 => (ILOAD, 3),
        I::Lload_0 => (LLOAD, 0),
        I::Lload_1 => (LLOAD, 1),
        I::Lload_2 => (LLOAD, 2),
        I::Lload_3 => (LLOAD, 3),
        I::Fload_0 => (FLOAD, 0),
        I::Fload_1 => (FLOAD, 1),
        I::Fload_2 => (FLOAD, 2),
        I::Fload_3 => (FLOAD, 3),
        I::Dload_0 => (DLOAD, 0),
        I::Dload_1 => (DLOAD, 1),
        I::Dload_2 => (DLOAD, 2),
        I::Dload_3 => (DLOAD, 3),
        I::Aload_0 => (ALOAD, 0),
        I::Aload_1 => (ALOAD, 1),
        I::Aload_2 => (ALOAD, 2),
        I::Aload_3 => (ALOAD, 3),
        I::Istore_0 => (ISTORE, 0),
        I::Istore_1 => (ISTORE, 1),
        I::Istore_2 => (ISTORE, 2),
        I::Istore_3 => (ISTORE, 3),
        I::Lstore_0 => (LSTORE, 0),
        I::Lstore_1 => (LSTORE, 1),
        I::Lstore_2 => (LSTORE, 2),
        I::Lstore_3 => (LSTORE, 3),
        I::Fstore_0 => (FSTORE, 0),
        I::Fstore_1 => (FSTORE, 1),
        I::Fstore_2 => (FSTORE, 2),
        I::Fstore_3 => (FSTORE, 3),
        I::Dstore_0 => (DSTORE, 0),
        I::Dstore_1 => (DSTORE, 1),
        I::Dstore_2 => (DSTORE, 2),
        I::Dstore_3 => (DSTORE, 3),
        I::Astore_0 => (ASTORE, 0),
        I::Astore_1 => (ASTORE, 1),
        I::Astore_2 => (ASTORE, 2),
        I::Astore_3 => (ASTORE, 3),
        _ => return None,
    })
}

/// Smallest encoding of a local variable instruction.
pub fn var_instruction(opcode: u8, var: u16) -> Option<Instruction> {
    use Instruction as I;
    if let Ok(short) = u8::try_from(var) {
        let instruction = match (opcode, short) {
            (ILOAD, 0) => I::Iload_0,
            (ILOAD, 1) => I::Iload_1,
            (ILOAD, 2) => I::Iload_2,
            (ILOAD, 3) => I::Iload_3,
            (LLOAD, 0) => I::Lload_0,
            (LLOAD, 1) => I::Lload_1,
            (LLOAD, 2) => I::Lload_2,
            (LLOAD, 3) => I::Lload_3,
            (FLOAD, 0) => I::Fload_0,
            (FLOAD, 1) => I::Fload_1,
            (FLOAD, 2) => I::Fload_2,
            (FLOAD, 3) => I::Fload_3,
            (DLOAD, 0) => I::Dload_0,
            (DLOAD, 1) => I::Dload_1,
            (DLOAD, 2) => I::Dload_2,
            (DLOAD, 3) => I::Dload_3,
            (ALOAD, 0) => I::Aload_0,
            (ALOAD, 1) => I::Aload_1,
            (ALOAD, 2) => I::Aload_2,
            (ALOAD, 3) => I::Aload_3,
            (ISTORE, 0) => I::Istore_0,
            (ISTORE, 1) => I::Istore_1,
            (ISTORE, 2) => I::Istore_2,
            (ISTORE, 3) => I::Istore_3,
            (LSTORE, 0) => I::Lstore_0,
            (LSTORE, 1) => I::Lstore_1,
            (LSTORE, 2) => I::Lstore_2,
            (LSTORE, 3) => I::Lstore_3,
            (FSTORE, 0) => I::Fstore_0,
            (FSTORE, 1) => I::Fstore_1,
            (FSTORE, 2) => I::Fstore_2,
            (FSTORE, 3) => I::Fstore_3,
            (DSTORE, 0) => I::Dstore_0,
            (DSTORE, 1) => I::Dstore_1,
            (DSTORE, 2) => I::Dstore_2,
            (DSTORE, 3) => I::Dstore_3,
            (ASTORE, 0) => I::Astore_0,
            (ASTORE, 1) => I::Astore_1,
            (ASTORE, 2) => I::Astore_2,
            (ASTORE, 3) => I::Astore_3,
            (ILOAD, v) => I::Iload(v),
            (LLOAD, v) => I::Lload(v),
            (FLOAD, v) => I::Fload(v),
            (DLOAD, v) => I::Dload(v),
            (ALOAD, v) => I::Aload(v),
            (ISTORE, v) => I::Istore(v),
            (LSTORE, v) => I::Lstore(v),
            (FSTORE, v) => I::Fstore(v),
            (DSTORE, v) => I::Dstore(v),
            (ASTORE, v) => I::Astore(v),
            (RET, v) => I::Ret(v),
            _ => return None,
        };
        return Some(instruction);
    }
    Some(match opcode {
        ILOAD => I::Iload_w(var),
        LLOAD => I::Lload_w(var),
        FLOAD => I::Fload_w(var),
        DLOAD => I::Dload_w(var),
        ALOAD => I::Aload_w(var),
        ISTORE => I::Istore_w(var),
        LSTORE => I::Lstore_w(var),
        FSTORE => I::Fstore_w(var),
        DSTORE => I::Dstore_w(var),
        ASTORE => I::Astore_w(var),
        RET => I::Ret_w(var),
        _ => return None,
    })
}

/// Branch with a 16-bit operand: `(opcode, target index)`.
pub fn jump_operand(instruction: &Instruction) -> Option<(u8, u16)> {
    use Instruction as I;
    Some(match instruction {
        I::Ifeq(t) => (IFEQ, *t),
        I::Ifne(t) => (IFNE, *t),
        I::Iflt(t) => (IFLT, *t),
        I::Ifge(t) => (IFGE, *t),
        I::Ifgt(t) => (IFGT, *t),
        I::Ifle(t) => (IFLE, *t),
        I::If_icmpeq(t) => (IF_ICMPEQ, *t),
        I::If_icmpne(t) => (IF_ICMPNE, *t),
        I::If_icmplt(t) => (IF_ICMPLT, *t),
        I::If_icmpge(t) => (IF_ICMPGE, *t),
        I::If_icmpgt(t) => (IF_ICMPGT, *t),
        I::If_icmple(t) => (IF_ICMPLE, *t),
        I::If_acmpeq(t) => (IF_ACMPEQ, *t),
        I::If_acmpne(t) => (IF_ACMPNE, *t),
        I::Goto(t) => (GOTO, *t),
        I::Jsr(t) => (JSR, *t),
        I::Ifnull(t) => (IFNULL, *t),
        I::Ifnonnull(t) => (IFNONNULL, *t),
        _ => return None,
    })
}

pub fn jump_instruction(opcode: u8, target: u16) -> Option<Instruction> {
    use Instruction as I;
    Some(match opcode {
        IFEQ => I::Ifeq(target),
        IFNE => I::Ifne(target),
        IFLT => I::Iflt(target),
        IFGE => I::Ifge(target),
        IFGT => I::Ifgt(target),
        IFLE => I::Ifle(target),
        IF_ICMPEQ => I::If_icmpeq(target),
        IF_ICMPNE => I::If_icmpne(target),
        IF_ICMPLT => I::If_icmplt(target),
        IF_ICMPGE => I::If_icmpge(target),
        IF_ICMPGT => I::If_icmpgt(target),
        IF_ICMPLE => I::If_icmple(target),
        IF_ACMPEQ => I::If_acmpeq(target),
        IF_ACMPNE => I::If_acmpne(target),
        GOTO => I::Goto(target),
        JSR => I::Jsr(target),
        IFNULL => I::Ifnull(target),
        IFNONNULL => I::Ifnonnull(target),
        _ => return None,
    })
}

pub fn array_type_code(array_type: &ArrayType) -> i32 {
    match array_type {
        ArrayType::Boolean => T_BOOLEAN,
        ArrayType::Char => T_CHAR,
        ArrayType::Float => T_FLOAT,
        ArrayType::Double => T_DOUBLE,
        ArrayType::Byte => T_BYTE,
        ArrayType::Short => T_SHORT,
        ArrayType::Int => T_INT,
        ArrayType::Long => T_LONG,
    }
}

pub fn array_type(code: i32) -> Option<ArrayType> {
    Some(match code {
        T_BOOLEAN => ArrayType::Boolean,
        T_CHAR => ArrayType::Char,
        T_FLOAT => ArrayType::Float,
        T_DOUBLE => ArrayType::Double,
        T_BYTE => ArrayType::Byte,
        T_SHORT => ArrayType::Short,
        T_INT => ArrayType::Int,
        T_LONG => ArrayType::Long,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_table_maps_both_ways() {
        for opcode in [NOP, ICONST_4, DDIV, I2C, DCMPG, RETURN, MONITOREXIT] {
            let instruction = simple_instruction(opcode).unwrap();
            assert_eq!(simple_opcode(&instruction), Some(opcode));
        }
        assert_eq!(simple_instruction(BIPUSH), None);
    }

    #[test]
    fn variables_pick_the_smallest_form() {
        assert!(matches!(var_instruction(ALOAD, 0), Some(Instruction::Aload_0)));
        assert!(matches!(var_instruction(ISTORE, 9), Some(Instruction::Istore(9))));
        assert!(matches!(var_instruction(DLOAD, 300), Some(Instruction::Dload_w(300))));
        assert!(matches!(var_instruction(RET, 2), Some(Instruction::Ret(2))));
        assert_eq!(var_operand(&Instruction::Lstore_3), Some((LSTORE, 3)));
        assert_eq!(var_operand(&Instruction::Fload_w(400)), Some((FLOAD, 400)));
    }
}
