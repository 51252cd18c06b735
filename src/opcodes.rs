use crate::ir::CallKind;

/// Conditional branch mnemonics.
pub(crate) const BRANCH: &[&str] = &[
    "ifeq",
    "ifne",
    "iflt",
    "ifge",
    "ifgt",
    "ifle",
    "ifnull",
    "ifnonnull",
    "if_icmpeq",
    "if_icmpne",
    "if_icmplt",
    "if_icmpge",
    "if_icmpgt",
    "if_icmple",
    "if_acmpeq",
    "if_acmpne",
];
pub(crate) const RETURN: &[&str] = &["return", "ireturn", "lreturn", "freturn", "dreturn", "areturn"];
pub(crate) const THROW: &[&str] = &["athrow"];
pub(crate) const GOTO: &[&str] = &["goto", "goto_w"];
pub(crate) const SWITCH: &[&str] = &["lookupswitch", "tableswitch"];

/// Instructions that only push a value, used to recognise argument setup.
pub(crate) const PUSH: &[&str] = &[
    "bipush", "sipush", "ldc", "ldc_w", "ldc2_w", "iconst_m1", "iconst_0", "iconst_1", "iconst_2",
    "iconst_3", "iconst_4", "iconst_5", "lconst_0", "lconst_1", "fconst_0", "fconst_1",
    "fconst_2", "dconst_0", "dconst_1", "aconst_null", "iload", "lload", "fload", "dload",
    "aload", "iload_0", "iload_1", "iload_2", "iload_3", "lload_0", "lload_1", "lload_2",
    "lload_3", "fload_0", "fload_1", "fload_2", "fload_3", "dload_0", "dload_1", "dload_2",
    "dload_3", "aload_0", "aload_1", "aload_2", "aload_3",
];

pub(crate) const LOAD_THIS: &str = "aload_0";

/// Control-flow relevant classification of a single instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum InstructionKind {
    Branch,
    Goto,
    Switch,
    Return,
    Throw,
    Invoke(CallKind),
    Irrelevant,
}

pub(crate) fn classify(opcode: &str) -> InstructionKind {
    match opcode {
        "invokevirtual" => InstructionKind::Invoke(CallKind::Virtual),
        "invokeinterface" => InstructionKind::Invoke(CallKind::Interface),
        "invokespecial" => InstructionKind::Invoke(CallKind::Special),
        "invokestatic" => InstructionKind::Invoke(CallKind::Static),
        op if BRANCH.contains(&op) => InstructionKind::Branch,
        op if GOTO.contains(&op) => InstructionKind::Goto,
        op if SWITCH.contains(&op) => InstructionKind::Switch,
        op if RETURN.contains(&op) => InstructionKind::Return,
        op if THROW.contains(&op) => InstructionKind::Throw,
        _ => InstructionKind::Irrelevant,
    }
}

pub(crate) fn is_push(opcode: &str) -> bool {
    PUSH.contains(&opcode)
}
